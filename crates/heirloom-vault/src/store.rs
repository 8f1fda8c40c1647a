//! SQLite persistence for vaults, the registry counter, caller nonces, the
//! audit log and the in-store ledger balances.
//!
//! Helpers take a plain `&Connection` so the engine can run them on an open
//! `Transaction` (which derefs to `Connection`). None of them commit.

use crate::types::{AccountId, Vault};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

impl ToSql for AccountId {
    fn to_sql(&self) -> SqlResult<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.to_string()))
    }
}

impl FromSql for AccountId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        AccountId::from_str(value.as_str()?).map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// Open (or create) the store at `path` and run migrations.
pub fn open_store(path: &Path) -> SqlResult<Connection> {
    let conn = Connection::open(path)?;

    // WAL mode for better concurrent read performance
    conn.pragma_update(None, "journal_mode", "WAL")?;
    // Another process may hold the write lock for the length of one mutation
    conn.busy_timeout(Duration::from_secs(5))?;

    migrate(&conn)?;
    Ok(conn)
}

/// Fresh in-memory store, for tests and throwaway engines.
pub fn open_in_memory() -> SqlResult<Connection> {
    let conn = Connection::open_in_memory()?;
    migrate(&conn)?;
    Ok(conn)
}

fn migrate(conn: &Connection) -> SqlResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS vaults (
            owner              TEXT PRIMARY KEY,
            heir               TEXT NOT NULL,
            last_heartbeat     INTEGER NOT NULL,
            heartbeat_interval INTEGER NOT NULL,
            balance            INTEGER NOT NULL CHECK (balance >= 0),
            created_at         INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS registry (
            id           INTEGER PRIMARY KEY CHECK (id = 1),
            total_vaults INTEGER NOT NULL CHECK (total_vaults >= 0)
        );
        INSERT OR IGNORE INTO registry (id, total_vaults) VALUES (1, 0);

        CREATE TABLE IF NOT EXISTS caller_nonces (
            caller     TEXT PRIMARY KEY,
            last_nonce INTEGER NOT NULL
        );
        ",
    )?;

    migrate_v02(conn)?;
    migrate_v03(conn)?;
    Ok(())
}

/// v0.2 migration: audit log of accepted mutations.
fn migrate_v02(conn: &Connection) -> SqlResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS vault_events (
            id        INTEGER PRIMARY KEY AUTOINCREMENT,
            owner     TEXT NOT NULL,
            kind      TEXT NOT NULL,
            actor     TEXT NOT NULL,
            amount    INTEGER,
            timestamp INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS vault_events_owner ON vault_events (owner);",
    )?;
    Ok(())
}

/// v0.3 migration: ledger balances kept next to the vaults they back.
fn migrate_v03(conn: &Connection) -> SqlResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS ledger_accounts (
            account TEXT PRIMARY KEY,
            balance INTEGER NOT NULL CHECK (balance >= 0)
        );
        CREATE TABLE IF NOT EXISTS ledger_genesis (
            id        INTEGER PRIMARY KEY CHECK (id = 1),
            seeded_at INTEGER NOT NULL
        );",
    )?;
    Ok(())
}

// ============================================================================
// Vaults
// ============================================================================

fn vault_from_row(row: &Row<'_>) -> SqlResult<Vault> {
    Ok(Vault {
        owner: row.get(0)?,
        heir: row.get(1)?,
        last_heartbeat: row.get(2)?,
        heartbeat_interval: row.get(3)?,
        balance: row.get(4)?,
        created_at: row.get(5)?,
    })
}

/// Get the vault owned by `owner`.
pub fn vault_get(conn: &Connection, owner: &AccountId) -> SqlResult<Option<Vault>> {
    let mut stmt = conn.prepare_cached(
        "SELECT owner, heir, last_heartbeat, heartbeat_interval, balance, created_at
         FROM vaults WHERE owner = ?1",
    )?;
    stmt.query_row(params![owner], vault_from_row).optional()
}

/// Insert or replace a vault row.
pub fn vault_upsert(conn: &Connection, vault: &Vault) -> SqlResult<()> {
    conn.execute(
        "INSERT INTO vaults (owner, heir, last_heartbeat, heartbeat_interval, balance, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(owner) DO UPDATE SET
            heir = excluded.heir,
            last_heartbeat = excluded.last_heartbeat,
            heartbeat_interval = excluded.heartbeat_interval,
            balance = excluded.balance,
            created_at = excluded.created_at",
        params![
            vault.owner,
            vault.heir,
            vault.last_heartbeat,
            vault.heartbeat_interval,
            vault.balance,
            vault.created_at
        ],
    )?;
    Ok(())
}

/// Remove a vault. Returns true if a row was deleted.
pub fn vault_delete(conn: &Connection, owner: &AccountId) -> SqlResult<bool> {
    let affected = conn.execute("DELETE FROM vaults WHERE owner = ?1", params![owner])?;
    Ok(affected > 0)
}

/// List all vaults, earliest deadline first.
pub fn vault_list(conn: &Connection) -> SqlResult<Vec<Vault>> {
    let mut stmt = conn.prepare(
        "SELECT owner, heir, last_heartbeat, heartbeat_interval, balance, created_at
         FROM vaults ORDER BY last_heartbeat + heartbeat_interval ASC",
    )?;
    let rows = stmt.query_map([], vault_from_row)?;
    rows.collect()
}

/// Count vault rows directly (for consistency checks against the registry).
pub fn vault_count(conn: &Connection) -> SqlResult<u64> {
    conn.query_row("SELECT COUNT(*) FROM vaults", [], |row| row.get(0))
}

// ============================================================================
// Registry counter
// ============================================================================

pub fn registry_total(conn: &Connection) -> SqlResult<u64> {
    conn.query_row(
        "SELECT total_vaults FROM registry WHERE id = 1",
        [],
        |row| row.get(0),
    )
}

/// Add `delta` to the active vault count. The CHECK constraint rejects
/// a negative total.
pub fn registry_adjust(conn: &Connection, delta: i64) -> SqlResult<()> {
    conn.execute(
        "UPDATE registry SET total_vaults = total_vaults + ?1 WHERE id = 1",
        params![delta],
    )?;
    Ok(())
}

// ============================================================================
// Caller nonces (replay protection)
// ============================================================================

pub fn nonce_last(conn: &Connection, caller: &AccountId) -> SqlResult<Option<u64>> {
    conn.query_row(
        "SELECT last_nonce FROM caller_nonces WHERE caller = ?1",
        params![caller],
        |row| row.get(0),
    )
    .optional()
}

pub fn nonce_set(conn: &Connection, caller: &AccountId, nonce: u64) -> SqlResult<()> {
    conn.execute(
        "INSERT INTO caller_nonces (caller, last_nonce) VALUES (?1, ?2)
         ON CONFLICT(caller) DO UPDATE SET last_nonce = excluded.last_nonce",
        params![caller, nonce],
    )?;
    Ok(())
}

// ============================================================================
// Ledger balances
// ============================================================================

/// Balance of a ledger account. Unknown accounts hold zero.
pub fn ledger_balance(conn: &Connection, account: &AccountId) -> SqlResult<u64> {
    let balance = conn
        .query_row(
            "SELECT balance FROM ledger_accounts WHERE account = ?1",
            params![account],
            |row| row.get(0),
        )
        .optional()?;
    Ok(balance.unwrap_or(0))
}

pub fn ledger_set(conn: &Connection, account: &AccountId, balance: u64) -> SqlResult<()> {
    conn.execute(
        "INSERT INTO ledger_accounts (account, balance) VALUES (?1, ?2)
         ON CONFLICT(account) DO UPDATE SET balance = excluded.balance",
        params![account, balance],
    )?;
    Ok(())
}

pub fn ledger_genesis_seeded(conn: &Connection) -> SqlResult<bool> {
    let row: Option<i64> = conn
        .query_row("SELECT id FROM ledger_genesis WHERE id = 1", [], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(row.is_some())
}

pub fn ledger_mark_seeded(conn: &Connection, now: u64) -> SqlResult<()> {
    conn.execute(
        "INSERT INTO ledger_genesis (id, seeded_at) VALUES (1, ?1)",
        params![now],
    )?;
    Ok(())
}

// ============================================================================
// Audit log
// ============================================================================

/// Kind of accepted mutation recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Setup,
    Reset,
    Deposit,
    Withdraw,
    HeirUpdated,
    IntervalUpdated,
    Heartbeat,
    Claim,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Setup => "setup",
            EventKind::Reset => "reset",
            EventKind::Deposit => "deposit",
            EventKind::Withdraw => "withdraw",
            EventKind::HeirUpdated => "heir_updated",
            EventKind::IntervalUpdated => "interval_updated",
            EventKind::Heartbeat => "heartbeat",
            EventKind::Claim => "claim",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "setup" => Ok(EventKind::Setup),
            "reset" => Ok(EventKind::Reset),
            "deposit" => Ok(EventKind::Deposit),
            "withdraw" => Ok(EventKind::Withdraw),
            "heir_updated" => Ok(EventKind::HeirUpdated),
            "interval_updated" => Ok(EventKind::IntervalUpdated),
            "heartbeat" => Ok(EventKind::Heartbeat),
            "claim" => Ok(EventKind::Claim),
            other => Err(format!("unknown event kind '{}'", other)),
        }
    }
}

/// One accepted mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultEvent {
    pub id: i64,
    pub owner: AccountId,
    pub kind: EventKind,
    /// Authenticated identity that issued the mutation.
    pub actor: AccountId,
    /// Value moved or the new setting, when the kind carries one.
    pub amount: Option<u64>,
    pub timestamp: u64,
}

pub fn event_insert(
    conn: &Connection,
    owner: &AccountId,
    kind: EventKind,
    actor: &AccountId,
    amount: Option<u64>,
    timestamp: u64,
) -> SqlResult<()> {
    conn.execute(
        "INSERT INTO vault_events (owner, kind, actor, amount, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![owner, kind.as_str(), actor, amount, timestamp],
    )?;
    Ok(())
}

/// Events for one owner key, oldest first. Survives the vault being claimed.
pub fn event_list(conn: &Connection, owner: &AccountId) -> SqlResult<Vec<VaultEvent>> {
    let mut stmt = conn.prepare(
        "SELECT id, owner, kind, actor, amount, timestamp
         FROM vault_events WHERE owner = ?1 ORDER BY id ASC",
    )?;
    let rows = stmt.query_map(params![owner], |row| {
        let kind: String = row.get(2)?;
        Ok(VaultEvent {
            id: row.get(0)?,
            owner: row.get(1)?,
            kind: EventKind::from_str(&kind).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    2,
                    rusqlite::types::Type::Text,
                    e.into(),
                )
            })?,
            actor: row.get(3)?,
            amount: row.get(4)?,
            timestamp: row.get(5)?,
        })
    })?;
    rows.collect()
}
