//! The vault state machine.
//!
//! Every mutation runs as one unit under the engine lock:
//!
//! 1. open an immediate SQLite transaction and sample the clock
//! 2. consume the caller's nonce
//! 3. validate against the stored vault
//! 4. stage any value transfer on the ledger
//! 5. write the vault row, registry counter and audit event
//! 6. commit, then finalize the staged transfers
//!
//! A failure at any step before the commit cancels the staged transfers and
//! drops the transaction, so neither the store nor the ledger changes.

use crate::auth::AuthenticatedCaller;
use crate::clock::Clock;
use crate::error::VaultError;
use crate::ledger::{TransferKind, TransferTicket, ValueTransfer};
use crate::liveness::{evaluate_liveness, LivenessConfig, LivenessStatus};
use crate::store::{self, EventKind, VaultEvent};
use crate::types::{interval_in_bounds, AccountId, SetupPolicy, Vault, MAX_BALANCE};
use rusqlite::{Connection, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Ledger account that holds all vault balances.
    pub custody: AccountId,
    /// Behaviour of `setup_vault` for an owner that already has a vault.
    pub setup_policy: SetupPolicy,
}

/// Authoritative sequencer for all vaults.
pub struct VaultEngine {
    conn: Mutex<Connection>,
    ledger: Arc<dyn ValueTransfer>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

/// In-flight mutation: the open transaction plus transfers staged so far.
struct Mutation<'a> {
    conn: &'a Connection,
    ledger: &'a dyn ValueTransfer,
    staged: Vec<TransferTicket>,
    now: u64,
}

impl Mutation<'_> {
    fn stage(
        &mut self,
        kind: TransferKind,
        from: &AccountId,
        to: &AccountId,
        amount: u64,
    ) -> Result<(), VaultError> {
        if amount == 0 {
            return Ok(());
        }
        let ticket = self.ledger.stage(self.conn, kind, from, to, amount)?;
        self.staged.push(ticket);
        Ok(())
    }

    /// The caller's own vault. A caller without one is not an owner.
    fn owned_vault(&self, caller: &AccountId) -> Result<Vault, VaultError> {
        match store::vault_get(self.conn, caller)? {
            Some(vault) if &vault.owner == caller => Ok(vault),
            _ => Err(VaultError::Unauthorized { caller: *caller }),
        }
    }

    fn record(
        &self,
        owner: &AccountId,
        kind: EventKind,
        actor: &AccountId,
        amount: Option<u64>,
    ) -> Result<(), VaultError> {
        store::event_insert(self.conn, owner, kind, actor, amount, self.now)?;
        Ok(())
    }
}

impl VaultEngine {
    pub fn new(
        conn: Connection,
        ledger: Arc<dyn ValueTransfer>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            conn: Mutex::new(conn),
            ledger,
            clock,
            config,
        }
    }

    /// Open an engine over the SQLite store at `path`.
    pub fn open(
        path: &Path,
        ledger: Arc<dyn ValueTransfer>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Result<Self, VaultError> {
        let conn = store::open_store(path)?;
        Ok(Self::new(conn, ledger, clock, config))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, VaultError> {
        self.conn.lock().map_err(|_| VaultError::Poisoned)
    }

    fn validate_heir(&self, owner: &AccountId, heir: &AccountId) -> Result<(), VaultError> {
        if heir == owner {
            return Err(VaultError::InvalidHeir(
                "an owner cannot be their own heir".into(),
            ));
        }
        if heir == &self.config.custody {
            return Err(VaultError::InvalidHeir(
                "the custody account cannot be an heir".into(),
            ));
        }
        Ok(())
    }

    /// Run `f` as one atomic mutation on behalf of `caller`.
    fn commit<T>(
        &self,
        op: &'static str,
        caller: &AuthenticatedCaller,
        f: impl FnOnce(&mut Mutation<'_>) -> Result<T, VaultError>,
    ) -> Result<T, VaultError> {
        let mut conn = self.lock()?;
        // Holds the store write lock from the first read, across processes
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = self.clock.now();

        let mut mutation = Mutation {
            conn: &tx,
            ledger: self.ledger.as_ref(),
            staged: Vec::new(),
            now,
        };
        let result = consume_nonce(mutation.conn, caller).and_then(|()| f(&mut mutation));
        let staged = mutation.staged;

        let result = result.and_then(|value| {
            tx.commit()?;
            Ok(value)
        });

        match result {
            Ok(value) => {
                for ticket in staged {
                    self.ledger.finalize(ticket);
                }
                Ok(value)
            }
            Err(e) => {
                for ticket in staged {
                    self.ledger.cancel(ticket);
                }
                log::debug!("Rejected {} from {}: {}", op, caller.account(), e);
                Err(e)
            }
        }
    }

    fn read<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, VaultError> {
        let conn = self.lock()?;
        Ok(f(&conn)?)
    }

    // ========================================================================
    // Owner operations
    // ========================================================================

    /// Create the caller's vault, or re-initialize it under
    /// [`SetupPolicy::Overwrite`].
    pub fn setup_vault(
        &self,
        caller: &AuthenticatedCaller,
        heir: AccountId,
        interval: u64,
    ) -> Result<(), VaultError> {
        let owner = *caller.account();
        if !interval_in_bounds(interval) {
            return Err(VaultError::InvalidInterval(interval));
        }
        self.validate_heir(&owner, &heir)?;

        let custody = self.config.custody;
        let policy = self.config.setup_policy;
        self.commit("setup_vault", caller, |m| {
            let fresh = Vault {
                owner,
                heir,
                last_heartbeat: m.now,
                heartbeat_interval: interval,
                balance: 0,
                created_at: m.now,
            };
            match store::vault_get(m.conn, &owner)? {
                Some(existing) => match policy {
                    SetupPolicy::Reject => Err(VaultError::AlreadyExists(owner)),
                    SetupPolicy::Overwrite => {
                        // Old balance goes back to the owner, not into the void.
                        m.stage(TransferKind::Refund, &custody, &owner, existing.balance)?;
                        store::vault_upsert(m.conn, &fresh)?;
                        m.record(&owner, EventKind::Reset, &owner, Some(existing.balance))?;
                        log::info!(
                            "Vault {} re-initialized (refunded {}), heir {}, interval {}s",
                            owner,
                            existing.balance,
                            heir,
                            interval
                        );
                        Ok(())
                    }
                },
                None => {
                    store::vault_upsert(m.conn, &fresh)?;
                    store::registry_adjust(m.conn, 1)?;
                    m.record(&owner, EventKind::Setup, &owner, Some(interval))?;
                    log::info!(
                        "Vault {} created, heir {}, interval {}s",
                        owner,
                        heir,
                        interval
                    );
                    Ok(())
                }
            }
        })
    }

    /// Move `amount` from the owner into custody. Returns the new balance.
    pub fn deposit_funds(
        &self,
        caller: &AuthenticatedCaller,
        amount: u64,
    ) -> Result<u64, VaultError> {
        if amount == 0 {
            return Err(VaultError::InvalidAmount);
        }
        let custody = self.config.custody;
        self.commit("deposit_funds", caller, |m| {
            let mut vault = m.owned_vault(caller.account())?;
            vault.balance = vault
                .balance
                .checked_add(amount)
                .filter(|b| *b <= MAX_BALANCE)
                .ok_or(VaultError::BalanceOverflow)?;
            m.stage(TransferKind::Deposit, &vault.owner, &custody, amount)?;
            store::vault_upsert(m.conn, &vault)?;
            m.record(&vault.owner, EventKind::Deposit, &vault.owner, Some(amount))?;
            log::info!(
                "Vault {} deposit {} -> balance {}",
                vault.owner,
                amount,
                vault.balance
            );
            Ok(vault.balance)
        })
    }

    /// Move `amount` from custody back to the owner. Returns the new balance.
    pub fn withdraw_funds(
        &self,
        caller: &AuthenticatedCaller,
        amount: u64,
    ) -> Result<u64, VaultError> {
        if amount == 0 {
            return Err(VaultError::InvalidAmount);
        }
        let custody = self.config.custody;
        self.commit("withdraw_funds", caller, |m| {
            let mut vault = m.owned_vault(caller.account())?;
            if amount > vault.balance {
                return Err(VaultError::InsufficientBalance {
                    requested: amount,
                    available: vault.balance,
                });
            }
            vault.balance -= amount;
            m.stage(TransferKind::Withdrawal, &custody, &vault.owner, amount)?;
            store::vault_upsert(m.conn, &vault)?;
            m.record(&vault.owner, EventKind::Withdraw, &vault.owner, Some(amount))?;
            log::info!(
                "Vault {} withdraw {} -> balance {}",
                vault.owner,
                amount,
                vault.balance
            );
            Ok(vault.balance)
        })
    }

    /// Designate a new heir. Allowed even after a missed heartbeat, as long
    /// as no claim has executed.
    pub fn update_heir(
        &self,
        caller: &AuthenticatedCaller,
        new_heir: AccountId,
    ) -> Result<(), VaultError> {
        self.commit("update_heir", caller, |m| {
            let mut vault = m.owned_vault(caller.account())?;
            self.validate_heir(&vault.owner, &new_heir)?;
            vault.heir = new_heir;
            store::vault_upsert(m.conn, &vault)?;
            m.record(&vault.owner, EventKind::HeirUpdated, &vault.owner, None)?;
            log::info!("Vault {} heir -> {}", vault.owner, new_heir);
            Ok(())
        })
    }

    /// Change the heartbeat interval. Does not reset `last_heartbeat`.
    pub fn update_heartbeat_interval(
        &self,
        caller: &AuthenticatedCaller,
        new_interval: u64,
    ) -> Result<(), VaultError> {
        self.commit("update_heartbeat_interval", caller, |m| {
            let mut vault = m.owned_vault(caller.account())?;
            if !interval_in_bounds(new_interval) {
                return Err(VaultError::InvalidInterval(new_interval));
            }
            vault.heartbeat_interval = new_interval;
            store::vault_upsert(m.conn, &vault)?;
            m.record(
                &vault.owner,
                EventKind::IntervalUpdated,
                &vault.owner,
                Some(new_interval),
            )?;
            log::info!("Vault {} interval -> {}s", vault.owner, new_interval);
            Ok(())
        })
    }

    /// Prove liveness. Returns the new `last_heartbeat`.
    pub fn heartbeat(&self, caller: &AuthenticatedCaller) -> Result<u64, VaultError> {
        self.commit("heartbeat", caller, |m| {
            let mut vault = m.owned_vault(caller.account())?;
            vault.last_heartbeat = vault.last_heartbeat.max(m.now);
            store::vault_upsert(m.conn, &vault)?;
            m.record(&vault.owner, EventKind::Heartbeat, &vault.owner, None)?;
            log::info!("Vault {} heartbeat at {}", vault.owner, vault.last_heartbeat);
            Ok(vault.last_heartbeat)
        })
    }

    // ========================================================================
    // Heir operation
    // ========================================================================

    /// Transfer the whole balance of `owner`'s vault to its heir and close
    /// the vault. Returns the amount transferred.
    pub fn claim_funds(
        &self,
        caller: &AuthenticatedCaller,
        owner: &AccountId,
    ) -> Result<u64, VaultError> {
        let custody = self.config.custody;
        self.commit("claim_funds", caller, |m| {
            let vault = store::vault_get(m.conn, owner)?
                .ok_or(VaultError::VaultNotFound(*owner))?;
            if caller.account() != &vault.heir {
                return Err(VaultError::Unauthorized {
                    caller: *caller.account(),
                });
            }
            if !vault.is_claimable(m.now) {
                return Err(VaultError::OwnerStillActive {
                    claimable_at: vault.deadline().saturating_add(1),
                });
            }

            m.stage(TransferKind::Claim, &custody, &vault.heir, vault.balance)?;
            store::vault_delete(m.conn, owner)?;
            store::registry_adjust(m.conn, -1)?;
            m.record(owner, EventKind::Claim, &vault.heir, Some(vault.balance))?;
            log::info!(
                "Vault {} claimed by {}: {} transferred",
                owner,
                vault.heir,
                vault.balance
            );
            Ok(vault.balance)
        })
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// `None` means no vault, which is distinct from a vault with zero balance.
    pub fn get_vault_info(&self, owner: &AccountId) -> Result<Option<Vault>, VaultError> {
        self.read(|conn| store::vault_get(conn, owner))
    }

    pub fn get_total_vaults(&self) -> Result<u64, VaultError> {
        self.read(store::registry_total)
    }

    /// Liveness evaluation for one vault at the current time.
    pub fn liveness(
        &self,
        owner: &AccountId,
        config: &LivenessConfig,
    ) -> Result<Option<LivenessStatus>, VaultError> {
        let conn = self.lock()?;
        let now = self.clock.now();
        let vault = store::vault_get(&conn, owner)?;
        Ok(vault.map(|v| evaluate_liveness(&v, now, config)))
    }

    /// Accepted mutations for an owner key, oldest first.
    pub fn history(&self, owner: &AccountId) -> Result<Vec<VaultEvent>, VaultError> {
        self.read(|conn| store::event_list(conn, owner))
    }

    /// All active vaults, earliest deadline first.
    pub fn list_vaults(&self) -> Result<Vec<Vault>, VaultError> {
        self.read(store::vault_list)
    }

    /// Registry counter and row count agree.
    pub fn registry_consistent(&self) -> Result<bool, VaultError> {
        self.read(|conn| Ok(store::registry_total(conn)? == store::vault_count(conn)?))
    }
}

fn consume_nonce(conn: &Connection, caller: &AuthenticatedCaller) -> Result<(), VaultError> {
    let nonce = caller.nonce();
    // Stored as a SQLite INTEGER
    if i64::try_from(nonce).is_err() {
        return Err(VaultError::Authentication(format!(
            "nonce {} exceeds the largest storable nonce {}",
            nonce,
            i64::MAX
        )));
    }
    if let Some(last) = store::nonce_last(conn, caller.account())? {
        if nonce <= last {
            return Err(VaultError::Replay { nonce, last });
        }
    }
    store::nonce_set(conn, caller.account(), nonce)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerError;
    use crate::test_utils::{fixture, Fixture, TestAccount};
    use crate::types::{MAX_INTERVAL, MIN_INTERVAL};

    fn funded(f: &Fixture, account: &TestAccount, amount: u64) {
        f.ledger.credit(&account.id(), amount).unwrap();
    }

    #[test]
    fn test_setup_creates_vault() {
        let f = fixture(SetupPolicy::Reject);
        let (owner, heir) = (TestAccount::new(1), TestAccount::new(2));
        f.clock.set(1_000);

        f.engine
            .setup_vault(&owner.caller(), heir.id(), MIN_INTERVAL)
            .unwrap();

        let vault = f.engine.get_vault_info(&owner.id()).unwrap().unwrap();
        assert_eq!(vault.heir, heir.id());
        assert_eq!(vault.balance, 0);
        assert_eq!(vault.last_heartbeat, 1_000);
        assert_eq!(vault.heartbeat_interval, MIN_INTERVAL);
        assert_eq!(f.engine.get_total_vaults().unwrap(), 1);
    }

    #[test]
    fn test_setup_interval_bounds() {
        let f = fixture(SetupPolicy::Reject);
        let heir = TestAccount::new(2);

        for (seed, interval, ok) in [
            (10u8, MIN_INTERVAL - 1, false),
            (11, MIN_INTERVAL, true),
            (12, MAX_INTERVAL, true),
            (13, MAX_INTERVAL + 1, false),
            (14, 0, false),
        ] {
            let owner = TestAccount::new(seed);
            let result = f.engine.setup_vault(&owner.caller(), heir.id(), interval);
            if ok {
                assert!(result.is_ok(), "interval {} should be accepted", interval);
            } else {
                assert!(
                    matches!(result, Err(VaultError::InvalidInterval(i)) if i == interval),
                    "interval {} should be rejected",
                    interval
                );
            }
        }
        assert_eq!(f.engine.get_total_vaults().unwrap(), 2);
    }

    #[test]
    fn test_setup_rejects_self_and_custody_heir() {
        let f = fixture(SetupPolicy::Reject);
        let owner = TestAccount::new(1);

        assert!(matches!(
            f.engine.setup_vault(&owner.caller(), owner.id(), MIN_INTERVAL),
            Err(VaultError::InvalidHeir(_))
        ));
        assert!(matches!(
            f.engine
                .setup_vault(&owner.caller(), f.custody.id(), MIN_INTERVAL),
            Err(VaultError::InvalidHeir(_))
        ));
        assert_eq!(f.engine.get_total_vaults().unwrap(), 0);
    }

    #[test]
    fn test_resetup_rejected_under_reject_policy() {
        let f = fixture(SetupPolicy::Reject);
        let (owner, heir, other) = (TestAccount::new(1), TestAccount::new(2), TestAccount::new(3));
        funded(&f, &owner, 1_000);

        f.engine
            .setup_vault(&owner.caller(), heir.id(), MIN_INTERVAL)
            .unwrap();
        f.engine.deposit_funds(&owner.caller(), 300).unwrap();

        let err = f
            .engine
            .setup_vault(&owner.caller(), other.id(), MAX_INTERVAL)
            .unwrap_err();
        assert!(matches!(err, VaultError::AlreadyExists(o) if o == owner.id()));

        let vault = f.engine.get_vault_info(&owner.id()).unwrap().unwrap();
        assert_eq!(vault.heir, heir.id());
        assert_eq!(vault.balance, 300);
        assert_eq!(f.engine.get_total_vaults().unwrap(), 1);
    }

    #[test]
    fn test_resetup_overwrites_and_refunds_under_overwrite_policy() {
        let f = fixture(SetupPolicy::Overwrite);
        let (owner, heir, other) = (TestAccount::new(1), TestAccount::new(2), TestAccount::new(3));
        funded(&f, &owner, 1_000);
        f.clock.set(100);

        f.engine
            .setup_vault(&owner.caller(), heir.id(), MIN_INTERVAL)
            .unwrap();
        f.engine.deposit_funds(&owner.caller(), 300).unwrap();
        assert_eq!(f.ledger.balance_of(&owner.id()), 700);

        f.clock.set(5_000);
        f.engine
            .setup_vault(&owner.caller(), other.id(), MAX_INTERVAL)
            .unwrap();

        let vault = f.engine.get_vault_info(&owner.id()).unwrap().unwrap();
        assert_eq!(vault.heir, other.id());
        assert_eq!(vault.heartbeat_interval, MAX_INTERVAL);
        assert_eq!(vault.balance, 0);
        assert_eq!(vault.last_heartbeat, 5_000);
        // Refunded, and still counted once
        assert_eq!(f.ledger.balance_of(&owner.id()), 1_000);
        assert_eq!(f.ledger.balance_of(&f.custody.id()), 0);
        assert_eq!(f.engine.get_total_vaults().unwrap(), 1);
        assert!(f.engine.registry_consistent().unwrap());
    }

    #[test]
    fn test_deposit_and_withdraw_move_funds() {
        let f = fixture(SetupPolicy::Reject);
        let (owner, heir) = (TestAccount::new(1), TestAccount::new(2));
        funded(&f, &owner, 5_000);
        f.engine
            .setup_vault(&owner.caller(), heir.id(), MIN_INTERVAL)
            .unwrap();

        assert_eq!(f.engine.deposit_funds(&owner.caller(), 2_000).unwrap(), 2_000);
        assert_eq!(f.ledger.balance_of(&owner.id()), 3_000);
        assert_eq!(f.ledger.balance_of(&f.custody.id()), 2_000);

        assert_eq!(f.engine.withdraw_funds(&owner.caller(), 500).unwrap(), 1_500);
        assert_eq!(f.ledger.balance_of(&owner.id()), 3_500);
        assert_eq!(f.ledger.balance_of(&f.custody.id()), 1_500);
        assert_eq!(f.ledger.outstanding_holds(), 0);
    }

    #[test]
    fn test_zero_amounts_rejected() {
        let f = fixture(SetupPolicy::Reject);
        let (owner, heir) = (TestAccount::new(1), TestAccount::new(2));
        f.engine
            .setup_vault(&owner.caller(), heir.id(), MIN_INTERVAL)
            .unwrap();

        assert!(matches!(
            f.engine.deposit_funds(&owner.caller(), 0),
            Err(VaultError::InvalidAmount)
        ));
        assert!(matches!(
            f.engine.withdraw_funds(&owner.caller(), 0),
            Err(VaultError::InvalidAmount)
        ));
    }

    #[test]
    fn test_withdraw_more_than_balance() {
        let f = fixture(SetupPolicy::Reject);
        let (owner, heir) = (TestAccount::new(1), TestAccount::new(2));
        funded(&f, &owner, 100);
        f.engine
            .setup_vault(&owner.caller(), heir.id(), MIN_INTERVAL)
            .unwrap();
        f.engine.deposit_funds(&owner.caller(), 100).unwrap();

        let err = f.engine.withdraw_funds(&owner.caller(), 101).unwrap_err();
        assert!(matches!(
            err,
            VaultError::InsufficientBalance {
                requested: 101,
                available: 100
            }
        ));
        assert_eq!(
            f.engine.get_vault_info(&owner.id()).unwrap().unwrap().balance,
            100
        );
    }

    #[test]
    fn test_failed_deposit_transfer_rolls_back() {
        let f = fixture(SetupPolicy::Reject);
        let (owner, heir) = (TestAccount::new(1), TestAccount::new(2));
        funded(&f, &owner, 50);
        f.engine
            .setup_vault(&owner.caller(), heir.id(), MIN_INTERVAL)
            .unwrap();
        let events_before = f.engine.history(&owner.id()).unwrap().len();

        let err = f.engine.deposit_funds(&owner.caller(), 51).unwrap_err();
        assert!(matches!(
            err,
            VaultError::TransferFailed(LedgerError::InsufficientFunds { .. })
        ));

        assert_eq!(
            f.engine.get_vault_info(&owner.id()).unwrap().unwrap().balance,
            0
        );
        assert_eq!(f.ledger.balance_of(&owner.id()), 50);
        assert_eq!(f.ledger.outstanding_holds(), 0);
        assert_eq!(f.engine.history(&owner.id()).unwrap().len(), events_before);
    }

    #[test]
    fn test_withdraw_blocked_by_custody_reserve() {
        let f = crate::test_utils::fixture_with_reserve(SetupPolicy::Reject, 10);
        let (owner, heir) = (TestAccount::new(1), TestAccount::new(2));
        funded(&f, &owner, 1_010);
        f.engine
            .setup_vault(&owner.caller(), heir.id(), MIN_INTERVAL)
            .unwrap();
        f.engine.deposit_funds(&owner.caller(), 1_000).unwrap();

        // Custody holds exactly the vault balance, so the reserve bites.
        let err = f.engine.withdraw_funds(&owner.caller(), 1_000).unwrap_err();
        assert!(matches!(
            err,
            VaultError::TransferFailed(LedgerError::ReserveBreached { .. })
        ));
        assert_eq!(
            f.engine.get_vault_info(&owner.id()).unwrap().unwrap().balance,
            1_000
        );
        assert_eq!(f.engine.withdraw_funds(&owner.caller(), 990).unwrap(), 10);
    }

    #[test]
    fn test_claim_ignores_custody_reserve() {
        let f = crate::test_utils::fixture_with_reserve(SetupPolicy::Reject, 10);
        let (owner, heir) = (TestAccount::new(1), TestAccount::new(2));
        funded(&f, &owner, 1_000);
        f.engine
            .setup_vault(&owner.caller(), heir.id(), MIN_INTERVAL)
            .unwrap();
        f.engine.deposit_funds(&owner.caller(), 1_000).unwrap();

        f.clock.set(MIN_INTERVAL + 1);
        assert_eq!(
            f.engine.claim_funds(&heir.caller(), &owner.id()).unwrap(),
            1_000
        );
        assert_eq!(f.ledger.balance_of(&heir.id()), 1_000);
        assert_eq!(f.ledger.balance_of(&f.custody.id()), 0);
        assert_eq!(f.engine.get_total_vaults().unwrap(), 0);
    }

    #[test]
    fn test_overwrite_refund_ignores_custody_reserve() {
        let f = crate::test_utils::fixture_with_reserve(SetupPolicy::Overwrite, 10);
        let (owner, heir) = (TestAccount::new(1), TestAccount::new(2));
        funded(&f, &owner, 500);
        f.engine
            .setup_vault(&owner.caller(), heir.id(), MIN_INTERVAL)
            .unwrap();
        f.engine.deposit_funds(&owner.caller(), 500).unwrap();

        f.engine
            .setup_vault(&owner.caller(), heir.id(), MAX_INTERVAL)
            .unwrap();
        assert_eq!(f.ledger.balance_of(&owner.id()), 500);
        assert_eq!(f.ledger.balance_of(&f.custody.id()), 0);
        assert_eq!(
            f.engine.get_vault_info(&owner.id()).unwrap().unwrap().balance,
            0
        );
    }

    #[test]
    fn test_owner_ops_without_vault_are_unauthorized() {
        let f = fixture(SetupPolicy::Reject);
        let stranger = TestAccount::new(5);
        funded(&f, &stranger, 100);

        assert!(matches!(
            f.engine.deposit_funds(&stranger.caller(), 10),
            Err(VaultError::Unauthorized { .. })
        ));
        assert!(matches!(
            f.engine.withdraw_funds(&stranger.caller(), 10),
            Err(VaultError::Unauthorized { .. })
        ));
        assert!(matches!(
            f.engine.heartbeat(&stranger.caller()),
            Err(VaultError::Unauthorized { .. })
        ));
        assert!(matches!(
            f.engine
                .update_heir(&stranger.caller(), TestAccount::new(6).id()),
            Err(VaultError::Unauthorized { .. })
        ));
        assert!(matches!(
            f.engine
                .update_heartbeat_interval(&stranger.caller(), MIN_INTERVAL),
            Err(VaultError::Unauthorized { .. })
        ));
        assert_eq!(f.ledger.balance_of(&stranger.id()), 100);
    }

    #[test]
    fn test_update_heir_and_interval() {
        let f = fixture(SetupPolicy::Reject);
        let (owner, heir, new_heir) = (TestAccount::new(1), TestAccount::new(2), TestAccount::new(3));
        f.clock.set(10);
        f.engine
            .setup_vault(&owner.caller(), heir.id(), MIN_INTERVAL)
            .unwrap();

        f.clock.set(500);
        f.engine.update_heir(&owner.caller(), new_heir.id()).unwrap();
        f.engine
            .update_heartbeat_interval(&owner.caller(), 15_552_000)
            .unwrap();

        let vault = f.engine.get_vault_info(&owner.id()).unwrap().unwrap();
        assert_eq!(vault.heir, new_heir.id());
        assert_eq!(vault.heartbeat_interval, 15_552_000);
        // Interval change does not count as a heartbeat
        assert_eq!(vault.last_heartbeat, 10);

        assert!(matches!(
            f.engine.update_heir(&owner.caller(), owner.id()),
            Err(VaultError::InvalidHeir(_))
        ));
        assert!(matches!(
            f.engine
                .update_heartbeat_interval(&owner.caller(), MAX_INTERVAL + 1),
            Err(VaultError::InvalidInterval(_))
        ));
    }

    #[test]
    fn test_owner_may_reconfigure_after_missed_heartbeat() {
        let f = fixture(SetupPolicy::Reject);
        let (owner, heir) = (TestAccount::new(1), TestAccount::new(2));
        f.engine
            .setup_vault(&owner.caller(), heir.id(), MIN_INTERVAL)
            .unwrap();

        f.clock.advance(MIN_INTERVAL * 2);
        f.engine
            .update_heartbeat_interval(&owner.caller(), MAX_INTERVAL)
            .unwrap();
        // Longer window now covers the gap, heir can no longer claim
        assert!(matches!(
            f.engine.claim_funds(&heir.caller(), &owner.id()),
            Err(VaultError::OwnerStillActive { .. })
        ));
    }

    #[test]
    fn test_heartbeat_never_moves_backwards() {
        let f = fixture(SetupPolicy::Reject);
        let (owner, heir) = (TestAccount::new(1), TestAccount::new(2));
        f.clock.set(1_000);
        f.engine
            .setup_vault(&owner.caller(), heir.id(), MIN_INTERVAL)
            .unwrap();

        assert_eq!(f.engine.heartbeat(&owner.caller()).unwrap(), 1_000);
        f.clock.set(2_000);
        assert_eq!(f.engine.heartbeat(&owner.caller()).unwrap(), 2_000);
        assert_eq!(f.engine.heartbeat(&owner.caller()).unwrap(), 2_000);
    }

    #[test]
    fn test_claim_boundary_is_strict() {
        let f = fixture(SetupPolicy::Reject);
        let (owner, heir) = (TestAccount::new(1), TestAccount::new(2));
        f.engine
            .setup_vault(&owner.caller(), heir.id(), MIN_INTERVAL)
            .unwrap();

        f.clock.set(MIN_INTERVAL);
        let err = f.engine.claim_funds(&heir.caller(), &owner.id()).unwrap_err();
        assert!(matches!(
            err,
            VaultError::OwnerStillActive { claimable_at } if claimable_at == MIN_INTERVAL + 1
        ));

        f.clock.set(MIN_INTERVAL + 1);
        assert_eq!(f.engine.claim_funds(&heir.caller(), &owner.id()).unwrap(), 0);
        assert_eq!(f.engine.get_total_vaults().unwrap(), 0);
    }

    #[test]
    fn test_claim_by_non_heir_is_unauthorized() {
        let f = fixture(SetupPolicy::Reject);
        let (owner, heir, stranger) = (TestAccount::new(1), TestAccount::new(2), TestAccount::new(3));
        f.engine
            .setup_vault(&owner.caller(), heir.id(), MIN_INTERVAL)
            .unwrap();
        f.clock.set(MAX_INTERVAL * 2);

        for caller in [&stranger, &owner] {
            assert!(matches!(
                f.engine.claim_funds(&caller.caller(), &owner.id()),
                Err(VaultError::Unauthorized { .. })
            ));
        }
        assert!(f.engine.get_vault_info(&owner.id()).unwrap().is_some());
        assert_eq!(f.engine.get_total_vaults().unwrap(), 1);
    }

    #[test]
    fn test_claim_missing_vault() {
        let f = fixture(SetupPolicy::Reject);
        let (owner, heir) = (TestAccount::new(1), TestAccount::new(2));
        assert!(matches!(
            f.engine.claim_funds(&heir.caller(), &owner.id()),
            Err(VaultError::VaultNotFound(o)) if o == owner.id()
        ));
    }

    #[test]
    fn test_replayed_nonce_rejected() {
        let f = fixture(SetupPolicy::Reject);
        let (owner, heir) = (TestAccount::new(1), TestAccount::new(2));
        let caller = owner.caller();
        f.engine
            .setup_vault(&caller, heir.id(), MIN_INTERVAL)
            .unwrap();

        let err = f.engine.heartbeat(&caller).unwrap_err();
        assert!(matches!(err, VaultError::Replay { .. }));
    }

    #[test]
    fn test_nonce_beyond_storage_range_rejected() {
        let f = fixture(SetupPolicy::Reject);
        let (owner, heir) = (TestAccount::new(1), TestAccount::new(2));
        let huge = AuthenticatedCaller::verified(owner.id(), i64::MAX as u64 + 1);

        assert!(matches!(
            f.engine.setup_vault(&huge, heir.id(), MIN_INTERVAL),
            Err(VaultError::Authentication(_))
        ));
        let largest = AuthenticatedCaller::verified(owner.id(), i64::MAX as u64);
        assert!(f.engine.setup_vault(&largest, heir.id(), MIN_INTERVAL).is_ok());
    }

    #[test]
    fn test_rejected_request_does_not_consume_nonce() {
        let f = fixture(SetupPolicy::Reject);
        let (owner, heir) = (TestAccount::new(1), TestAccount::new(2));
        let caller = owner.caller();

        // Fails inside the transaction, after the nonce was written
        assert!(matches!(
            f.engine.deposit_funds(&caller, 5),
            Err(VaultError::Unauthorized { .. })
        ));
        assert!(f.engine.setup_vault(&caller, heir.id(), MIN_INTERVAL).is_ok());
    }

    #[test]
    fn test_history_records_accepted_mutations_only() {
        let f = fixture(SetupPolicy::Reject);
        let (owner, heir) = (TestAccount::new(1), TestAccount::new(2));
        funded(&f, &owner, 100);
        f.engine
            .setup_vault(&owner.caller(), heir.id(), MIN_INTERVAL)
            .unwrap();
        f.engine.deposit_funds(&owner.caller(), 100).unwrap();
        let _ = f.engine.withdraw_funds(&owner.caller(), 1_000);
        f.engine.heartbeat(&owner.caller()).unwrap();

        let kinds: Vec<EventKind> = f
            .engine
            .history(&owner.id())
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![EventKind::Setup, EventKind::Deposit, EventKind::Heartbeat]
        );
    }

    #[test]
    fn test_liveness_query() {
        let f = fixture(SetupPolicy::Reject);
        let (owner, heir) = (TestAccount::new(1), TestAccount::new(2));
        let config = LivenessConfig::default();
        assert!(f.engine.liveness(&owner.id(), &config).unwrap().is_none());

        f.engine
            .setup_vault(&owner.caller(), heir.id(), MIN_INTERVAL)
            .unwrap();
        f.clock.set(MIN_INTERVAL + 1);
        let status = f.engine.liveness(&owner.id(), &config).unwrap().unwrap();
        assert_eq!(status.action, crate::liveness::LivenessAction::Claimable);
    }
}
