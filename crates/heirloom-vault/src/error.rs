//! Typed failures returned by the vault engine.
//!
//! Every rejected operation leaves the store, the registry counter and the
//! ledger exactly as they were before the attempt.

use crate::ledger::LedgerError;
use crate::types::AccountId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Caller {caller} is not authorized for this operation")]
    Unauthorized { caller: AccountId },

    #[error("Heartbeat interval {0}s is outside [7776000, 31536000]")]
    InvalidInterval(u64),

    #[error("Invalid heir: {0}")]
    InvalidHeir(String),

    #[error("Amount must be greater than zero")]
    InvalidAmount,

    #[error("Vault already exists for {0}")]
    AlreadyExists(AccountId),

    #[error("Insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: u64, available: u64 },

    #[error("Balance would exceed the maximum vault balance")]
    BalanceOverflow,

    #[error("No vault found for {0}")]
    VaultNotFound(AccountId),

    #[error("Owner is still active; claimable from {claimable_at}")]
    OwnerStillActive { claimable_at: u64 },

    #[error("Value transfer failed: {0}")]
    TransferFailed(#[from] LedgerError),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Replayed request: nonce {nonce} is not above {last}")]
    Replay { nonce: u64, last: u64 },

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Engine lock poisoned")]
    Poisoned,
}

impl VaultError {
    /// Stable snake_case identifier used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            VaultError::Unauthorized { .. } => "unauthorized",
            VaultError::InvalidInterval(_) => "invalid_interval",
            VaultError::InvalidHeir(_) => "invalid_heir",
            VaultError::InvalidAmount => "invalid_amount",
            VaultError::AlreadyExists(_) => "already_exists",
            VaultError::InsufficientBalance { .. } => "insufficient_balance",
            VaultError::BalanceOverflow => "balance_overflow",
            VaultError::VaultNotFound(_) => "vault_not_found",
            VaultError::OwnerStillActive { .. } => "owner_still_active",
            VaultError::TransferFailed(_) => "transfer_failed",
            VaultError::Authentication(_) => "authentication",
            VaultError::Replay { .. } => "replay",
            VaultError::Storage(_) | VaultError::Poisoned => "storage",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestAccount;

    #[test]
    fn test_kinds_are_distinct_for_caller_facing_errors() {
        let who = TestAccount::new(1).id();
        let errors = vec![
            VaultError::Unauthorized { caller: who },
            VaultError::InvalidInterval(1),
            VaultError::InvalidHeir("self".into()),
            VaultError::InvalidAmount,
            VaultError::AlreadyExists(who),
            VaultError::InsufficientBalance {
                requested: 2,
                available: 1,
            },
            VaultError::BalanceOverflow,
            VaultError::VaultNotFound(who),
            VaultError::OwnerStillActive { claimable_at: 9 },
            VaultError::TransferFailed(LedgerError::Unavailable("down".into())),
            VaultError::Authentication("bad sig".into()),
            VaultError::Replay { nonce: 1, last: 1 },
        ];
        let mut kinds: Vec<&str> = errors.iter().map(|e| e.kind()).collect();
        let total = kinds.len();
        kinds.sort();
        kinds.dedup();
        assert_eq!(kinds.len(), total);
    }

    #[test]
    fn test_not_found_differs_from_zero_balance_error() {
        let who = TestAccount::new(1).id();
        assert_eq!(VaultError::VaultNotFound(who).kind(), "vault_not_found");
        assert_eq!(
            VaultError::InsufficientBalance {
                requested: 1,
                available: 0
            }
            .kind(),
            "insufficient_balance"
        );
    }
}
