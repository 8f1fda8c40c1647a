//! Vault data model and contract constants.

use secp256k1::XOnlyPublicKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Shortest allowed heartbeat interval: 90 days.
pub const MIN_INTERVAL: u64 = 7_776_000;

/// Longest allowed heartbeat interval: 365 days.
pub const MAX_INTERVAL: u64 = 31_536_000;

/// Largest balance a single vault can hold (SQLite stores signed 64-bit).
pub const MAX_BALANCE: u64 = i64::MAX as u64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid account id '{input}': {reason}")]
pub struct InvalidAccountId {
    pub input: String,
    pub reason: String,
}

/// Account identifier: a BIP-340 x-only secp256k1 public key.
///
/// Rendered as 64 lowercase hex characters. Requests are signed by the
/// matching secret key, so the identifier doubles as the verification key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccountId(XOnlyPublicKey);

impl AccountId {
    pub fn from_xonly(key: XOnlyPublicKey) -> Self {
        Self(key)
    }

    pub fn as_xonly(&self) -> &XOnlyPublicKey {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AccountId {
    type Err = InvalidAccountId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.len() != 64 {
            return Err(InvalidAccountId {
                input: s.to_string(),
                reason: format!("expected 64 hex characters, got {}", trimmed.len()),
            });
        }
        XOnlyPublicKey::from_str(trimmed)
            .map(Self)
            .map_err(|e| InvalidAccountId {
                input: s.to_string(),
                reason: e.to_string(),
            })
    }
}

impl Serialize for AccountId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for AccountId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        AccountId::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// What `setup_vault` does when the caller already holds an active vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetupPolicy {
    /// Fail with `AlreadyExists`.
    #[default]
    Reject,
    /// Re-initialize the vault. Any held balance is refunded to the owner.
    Overwrite,
}

impl fmt::Display for SetupPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetupPolicy::Reject => write!(f, "reject"),
            SetupPolicy::Overwrite => write!(f, "overwrite"),
        }
    }
}

impl FromStr for SetupPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(SetupPolicy::Reject),
            "overwrite" => Ok(SetupPolicy::Overwrite),
            other => Err(format!("unknown setup policy '{}'", other)),
        }
    }
}

/// An active inheritance vault. Keyed by `owner`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vault {
    pub owner: AccountId,
    pub heir: AccountId,
    /// Unix seconds of the latest liveness proof (or creation).
    pub last_heartbeat: u64,
    /// Maximum allowed gap between heartbeats, in seconds.
    pub heartbeat_interval: u64,
    /// Custody balance in the smallest value unit.
    pub balance: u64,
    pub created_at: u64,
}

impl Vault {
    /// Last second at which the owner is still considered alive.
    pub fn deadline(&self) -> u64 {
        self.last_heartbeat.saturating_add(self.heartbeat_interval)
    }

    /// Seconds since the last heartbeat (zero if the clock is behind it).
    pub fn elapsed(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_heartbeat)
    }

    /// Strictly past the interval. Exactly at the boundary is not enough.
    pub fn is_claimable(&self, now: u64) -> bool {
        self.elapsed(now) > self.heartbeat_interval
    }
}

/// Check an interval against `[MIN_INTERVAL, MAX_INTERVAL]`, inclusive.
pub fn interval_in_bounds(interval: u64) -> bool {
    (MIN_INTERVAL..=MAX_INTERVAL).contains(&interval)
}
