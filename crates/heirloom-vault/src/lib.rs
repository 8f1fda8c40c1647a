//! Heirloom Vault Engine
//!
//! Time-gated inheritance vaults: an owner locks value behind a policy that
//! hands custody to a designated heir once the owner stops proving liveness.
//!
//! # Concepts
//!
//! - **Owner**: the only identity that may fund, drain or reconfigure a vault
//! - **Heir**: the only identity that may claim, and only after the window lapses
//! - **Heartbeat**: an owner liveness proof that restarts the window
//! - **Custody**: balances are held by the engine's custody account on the
//!   ledger, moved with a two-phase [`ledger::ValueTransfer`]
//!
//! # Lifecycle
//!
//! ```text
//! NonExistent --setup_vault--> Active --claim_funds--> NonExistent
//!                               |  ^
//!                               +--+  deposit / withdraw / update_heir /
//!                                     update_heartbeat_interval / heartbeat
//! ```
//!
//! Claim requires `now - last_heartbeat > heartbeat_interval`; at exactly the
//! boundary the owner is still considered alive.

pub mod api;
pub mod auth;
pub mod clock;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod liveness;
pub mod store;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use api::{answer, execute, Outcome, Query, Request, Response};
pub use auth::{authenticate, AuthenticatedCaller, SignedRequest};
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{EngineConfig, VaultEngine};
pub use error::VaultError;
pub use ledger::{
    LedgerError, MemoryLedger, SqliteLedger, TransferKind, TransferTicket, ValueTransfer,
};
pub use liveness::{
    evaluate_batch, evaluate_liveness, LivenessAction, LivenessConfig, LivenessError,
    LivenessStatus,
};
pub use store::{EventKind, VaultEvent};
pub use types::{AccountId, SetupPolicy, Vault, MAX_BALANCE, MAX_INTERVAL, MIN_INTERVAL};
