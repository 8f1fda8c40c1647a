//! Wire surface.
//!
//! All messages are JSON with a tag field for dispatch:
//!
//! - [`Request`] (`"op"`): owner and heir mutations, carried in a
//!   [`SignedRequest`]
//! - [`Query`] (`"query"`): unsigned reads
//! - [`Response`] (`"status"`): `ok` with an [`Outcome`], or `error` with the
//!   stable error kind and a message

use crate::auth::{authenticate, SignedRequest};
use crate::engine::VaultEngine;
use crate::error::VaultError;
use crate::liveness::{LivenessConfig, LivenessStatus};
use crate::store::VaultEvent;
use crate::types::{AccountId, Vault};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// A state-changing operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// `heir` stays textual so a malformed id is reported as an invalid heir.
    SetupVault { heir: String, interval: u64 },
    DepositFunds { amount: u64 },
    WithdrawFunds { amount: u64 },
    UpdateHeir { heir: String },
    UpdateHeartbeatInterval { interval: u64 },
    Heartbeat,
    ClaimFunds { owner: AccountId },
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::SetupVault { .. } => "setup_vault",
            Request::DepositFunds { .. } => "deposit_funds",
            Request::WithdrawFunds { .. } => "withdraw_funds",
            Request::UpdateHeir { .. } => "update_heir",
            Request::UpdateHeartbeatInterval { .. } => "update_heartbeat_interval",
            Request::Heartbeat => "heartbeat",
            Request::ClaimFunds { .. } => "claim_funds",
        }
    }
}

/// A read-only question about engine state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "query", rename_all = "snake_case")]
pub enum Query {
    GetVaultInfo { owner: AccountId },
    GetTotalVaults,
    Liveness { owner: AccountId },
    History { owner: AccountId },
}

/// Successful result payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outcome {
    Ack,
    Balance { balance: u64 },
    LastHeartbeat { last_heartbeat: u64 },
    Transferred { amount: u64 },
    Vault { vault: Vault },
    /// No vault for that owner. Distinct from a vault with zero balance.
    NotFound,
    TotalVaults { total: u64 },
    Liveness { status: LivenessStatus },
    History { events: Vec<VaultEvent> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok { result: Outcome },
    Error { kind: String, message: String },
}

impl Response {
    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok { .. })
    }

    /// Error response for a message that could not be decoded at all.
    pub fn malformed(message: impl Into<String>) -> Self {
        Response::Error {
            kind: "malformed".into(),
            message: message.into(),
        }
    }
}

impl From<Result<Outcome, VaultError>> for Response {
    fn from(result: Result<Outcome, VaultError>) -> Self {
        match result {
            Ok(result) => Response::Ok { result },
            Err(e) => Response::Error {
                kind: e.kind().to_string(),
                message: e.to_string(),
            },
        }
    }
}

fn parse_heir(heir: &str) -> Result<AccountId, VaultError> {
    AccountId::from_str(heir).map_err(|e| VaultError::InvalidHeir(e.to_string()))
}

fn dispatch(engine: &VaultEngine, signed: &SignedRequest) -> Result<Outcome, VaultError> {
    let caller = authenticate(signed)?;
    match &signed.request {
        Request::SetupVault { heir, interval } => {
            engine.setup_vault(&caller, parse_heir(heir)?, *interval)?;
            Ok(Outcome::Ack)
        }
        Request::DepositFunds { amount } => engine
            .deposit_funds(&caller, *amount)
            .map(|balance| Outcome::Balance { balance }),
        Request::WithdrawFunds { amount } => engine
            .withdraw_funds(&caller, *amount)
            .map(|balance| Outcome::Balance { balance }),
        Request::UpdateHeir { heir } => {
            engine.update_heir(&caller, parse_heir(heir)?)?;
            Ok(Outcome::Ack)
        }
        Request::UpdateHeartbeatInterval { interval } => {
            engine.update_heartbeat_interval(&caller, *interval)?;
            Ok(Outcome::Ack)
        }
        Request::Heartbeat => engine
            .heartbeat(&caller)
            .map(|last_heartbeat| Outcome::LastHeartbeat { last_heartbeat }),
        Request::ClaimFunds { owner } => engine
            .claim_funds(&caller, owner)
            .map(|amount| Outcome::Transferred { amount }),
    }
}

/// Authenticate and apply a signed request.
pub fn execute(engine: &VaultEngine, signed: &SignedRequest) -> Response {
    dispatch(engine, signed).into()
}

/// Answer a read-only query.
pub fn answer(engine: &VaultEngine, query: &Query, liveness: &LivenessConfig) -> Response {
    let result = match query {
        Query::GetVaultInfo { owner } => engine.get_vault_info(owner).map(|vault| match vault {
            Some(vault) => Outcome::Vault { vault },
            None => Outcome::NotFound,
        }),
        Query::GetTotalVaults => engine
            .get_total_vaults()
            .map(|total| Outcome::TotalVaults { total }),
        Query::Liveness { owner } => engine.liveness(owner, liveness).map(|status| match status {
            Some(status) => Outcome::Liveness { status },
            None => Outcome::NotFound,
        }),
        Query::History { owner } => engine
            .history(owner)
            .map(|events| Outcome::History { events }),
    };
    result.into()
}
