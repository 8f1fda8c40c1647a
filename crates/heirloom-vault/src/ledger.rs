//! Value transfer seam.
//!
//! The engine never moves funds directly. It stages a transfer inside its
//! open store transaction, applies its own state change, and only finalizes
//! the transfer once that change has committed. A staged transfer holds the
//! funds so that finalizing cannot fail; cancelling releases the hold.
//!
//! ```text
//! stage ──> (store commit ok) ──> finalize
//!   │
//!   └────> (validation / store failure) ──> cancel
//! ```
//!
//! Two implementations:
//!
//! - [`SqliteLedger`] keeps balances in the vault store itself and writes
//!   each staged movement through the engine's transaction, so the movement
//!   commits or rolls back together with the vault rows. The server uses it.
//! - [`MemoryLedger`] keeps balances in process and settles on `finalize`.
//!   It stands in for an external substrate in tests.

use crate::store;
use crate::types::{AccountId, MAX_BALANCE};
use rusqlite::{Connection, TransactionBehavior};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Errors from the value transfer primitive
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Insufficient funds in {account}: need {needed}, spendable {spendable}")]
    InsufficientFunds {
        account: AccountId,
        needed: u64,
        spendable: u64,
    },

    #[error("Transfer would leave {account} below the reserve of {reserve}")]
    ReserveBreached { account: AccountId, reserve: u64 },

    #[error("Credit to {0} would overflow")]
    Overflow(AccountId),

    #[error("Ledger unavailable: {0}")]
    Unavailable(String),
}

impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        LedgerError::Unavailable(e.to_string())
    }
}

/// Why funds are moving. Only withdrawals are subject to the reserve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    /// Owner funds a vault (owner -> custody).
    Deposit,
    /// Owner drains a vault (custody -> owner).
    Withdrawal,
    /// Balance of an overwritten vault returned to its owner.
    Refund,
    /// Whole balance handed to the heir.
    Claim,
}

impl TransferKind {
    pub fn respects_reserve(self) -> bool {
        matches!(self, TransferKind::Withdrawal)
    }
}

/// A staged, not yet final, movement of funds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferTicket {
    pub id: u64,
    pub kind: TransferKind,
    pub from: AccountId,
    pub to: AccountId,
    pub amount: u64,
}

/// Two-phase value transfer between accounts.
pub trait ValueTransfer: Send + Sync {
    /// Validate a transfer and hold the funds. `tx` is the engine's open
    /// store transaction; ledgers that live in the store write through it.
    fn stage(
        &self,
        tx: &Connection,
        kind: TransferKind,
        from: &AccountId,
        to: &AccountId,
        amount: u64,
    ) -> Result<TransferTicket, LedgerError>;

    /// Complete a staged transfer. Must not fail for a ticket returned by `stage`.
    fn finalize(&self, ticket: TransferTicket);

    /// Release a staged transfer without moving anything.
    fn cancel(&self, ticket: TransferTicket);

    /// Minimum balance a withdrawal must leave in the paying account.
    fn reserve(&self) -> u64;
}

fn check_reserve(
    kind: TransferKind,
    from: &AccountId,
    remaining: u64,
    reserve: u64,
) -> Result<(), LedgerError> {
    if kind.respects_reserve() && remaining < reserve {
        return Err(LedgerError::ReserveBreached {
            account: *from,
            reserve,
        });
    }
    Ok(())
}

// ============================================================================
// SQLite-backed ledger
// ============================================================================

/// Ledger whose balances live in the `ledger_accounts` table of the vault
/// store. Finalize and cancel are no-ops: the movement is already part of the
/// engine's transaction.
#[derive(Debug, Default)]
pub struct SqliteLedger {
    reserve: u64,
    next_ticket: AtomicU64,
}

impl SqliteLedger {
    pub fn new(reserve: u64) -> Self {
        Self {
            reserve,
            next_ticket: AtomicU64::new(0),
        }
    }

    pub fn balance_of(conn: &Connection, account: &AccountId) -> Result<u64, LedgerError> {
        Ok(store::ledger_balance(conn, account)?)
    }

    /// Mint `genesis` balances the first time the store is opened.
    /// Returns false if the store was already seeded.
    pub fn seed_genesis(
        conn: &mut Connection,
        genesis: &[(AccountId, u64)],
        now: u64,
    ) -> Result<bool, LedgerError> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if store::ledger_genesis_seeded(&tx)? {
            return Ok(false);
        }
        for (account, amount) in genesis {
            let balance = store::ledger_balance(&tx, account)?
                .checked_add(*amount)
                .filter(|b| *b <= MAX_BALANCE)
                .ok_or(LedgerError::Overflow(*account))?;
            store::ledger_set(&tx, account, balance)?;
        }
        store::ledger_mark_seeded(&tx, now)?;
        tx.commit()?;
        Ok(true)
    }
}

impl ValueTransfer for SqliteLedger {
    fn stage(
        &self,
        tx: &Connection,
        kind: TransferKind,
        from: &AccountId,
        to: &AccountId,
        amount: u64,
    ) -> Result<TransferTicket, LedgerError> {
        let from_balance = store::ledger_balance(tx, from)?;
        if amount > from_balance {
            let spendable = if kind.respects_reserve() {
                from_balance.saturating_sub(self.reserve)
            } else {
                from_balance
            };
            return Err(LedgerError::InsufficientFunds {
                account: *from,
                needed: amount,
                spendable,
            });
        }
        check_reserve(kind, from, from_balance - amount, self.reserve)?;

        if from != to {
            let credited = store::ledger_balance(tx, to)?
                .checked_add(amount)
                .filter(|b| *b <= MAX_BALANCE)
                .ok_or(LedgerError::Overflow(*to))?;
            store::ledger_set(tx, from, from_balance - amount)?;
            store::ledger_set(tx, to, credited)?;
        }

        Ok(TransferTicket {
            id: self.next_ticket.fetch_add(1, Ordering::Relaxed) + 1,
            kind,
            from: *from,
            to: *to,
            amount,
        })
    }

    fn finalize(&self, _ticket: TransferTicket) {}

    fn cancel(&self, _ticket: TransferTicket) {}

    fn reserve(&self) -> u64 {
        self.reserve
    }
}

// ============================================================================
// In-memory ledger
// ============================================================================

/// Balances of a [`MemoryLedger`]. Holds are transient and not included.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub reserve: u64,
    pub balances: HashMap<AccountId, u64>,
}

#[derive(Debug, Default)]
struct LedgerInner {
    snapshot: LedgerSnapshot,
    holds: HashMap<u64, TransferTicket>,
    next_ticket: u64,
}

impl LedgerInner {
    fn balance(&self, account: &AccountId) -> u64 {
        self.snapshot.balances.get(account).copied().unwrap_or(0)
    }

    fn held(&self, account: &AccountId) -> u64 {
        self.holds
            .values()
            .filter(|t| &t.from == account)
            .map(|t| t.amount)
            .sum()
    }

    fn pending_credit(&self, account: &AccountId) -> u64 {
        self.holds
            .values()
            .filter(|t| &t.to == account)
            .map(|t| t.amount)
            .sum()
    }
}

/// In-memory ledger with a withdrawal reserve and outstanding holds.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    inner: Mutex<LedgerInner>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reserve(reserve: u64) -> Self {
        Self {
            inner: Mutex::new(LedgerInner {
                snapshot: LedgerSnapshot {
                    reserve,
                    balances: HashMap::new(),
                },
                ..Default::default()
            }),
        }
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        self.lock().snapshot.clone()
    }

    /// Mint funds into an account (test funding).
    pub fn credit(&self, account: &AccountId, amount: u64) -> Result<u64, LedgerError> {
        let mut inner = self.lock();
        let current = inner.balance(account);
        let updated = current
            .checked_add(amount)
            .ok_or(LedgerError::Overflow(*account))?;
        inner.snapshot.balances.insert(*account, updated);
        Ok(updated)
    }

    pub fn balance_of(&self, account: &AccountId) -> u64 {
        self.lock().balance(account)
    }

    /// Number of staged, unresolved transfers.
    pub fn outstanding_holds(&self) -> usize {
        self.lock().holds.len()
    }

    fn lock(&self) -> MutexGuard<'_, LedgerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ValueTransfer for MemoryLedger {
    fn stage(
        &self,
        _tx: &Connection,
        kind: TransferKind,
        from: &AccountId,
        to: &AccountId,
        amount: u64,
    ) -> Result<TransferTicket, LedgerError> {
        let mut inner = self.lock();

        let available = inner.balance(from).saturating_sub(inner.held(from));
        let reserve = inner.snapshot.reserve;
        if amount > available {
            let spendable = if kind.respects_reserve() {
                available.saturating_sub(reserve)
            } else {
                available
            };
            return Err(LedgerError::InsufficientFunds {
                account: *from,
                needed: amount,
                spendable,
            });
        }
        check_reserve(kind, from, available - amount, reserve)?;
        inner
            .balance(to)
            .checked_add(inner.pending_credit(to))
            .and_then(|b| b.checked_add(amount))
            .ok_or(LedgerError::Overflow(*to))?;

        inner.next_ticket += 1;
        let ticket = TransferTicket {
            id: inner.next_ticket,
            kind,
            from: *from,
            to: *to,
            amount,
        };
        inner.holds.insert(ticket.id, ticket);
        Ok(ticket)
    }

    fn finalize(&self, ticket: TransferTicket) {
        let mut inner = self.lock();
        if inner.holds.remove(&ticket.id).is_none() {
            log::warn!("Finalize for unknown transfer ticket {}", ticket.id);
            return;
        }
        let from_balance = inner.balance(&ticket.from);
        inner
            .snapshot
            .balances
            .insert(ticket.from, from_balance - ticket.amount);
        let to_balance = inner.balance(&ticket.to);
        inner
            .snapshot
            .balances
            .insert(ticket.to, to_balance.saturating_add(ticket.amount));
    }

    fn cancel(&self, ticket: TransferTicket) {
        if self.lock().holds.remove(&ticket.id).is_none() {
            log::warn!("Cancel for unknown transfer ticket {}", ticket.id);
        }
    }

    fn reserve(&self) -> u64 {
        self.lock().snapshot.reserve
    }
}
