//! Owner liveness evaluation.
//!
//! Pure logic over a stored vault and the current time. The server uses it to
//! decide which owners are due a reminder and which vaults their heirs can
//! already claim.
//!
//! ```text
//! |--- Healthy ---|--- CheckinRecommended ---|--- CheckinRequired ---|--- Claimable
//! 0%             50%                        90%                    >100%
//! ```

use crate::types::{AccountId, Vault};
use serde::{Deserialize, Serialize};

/// When to recommend a heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessConfig {
    /// Fraction of the interval elapsed before a heartbeat is recommended (0.0–1.0).
    pub checkin_threshold: f64,

    /// Fraction of the interval elapsed before a heartbeat is critical (0.0–1.0).
    pub critical_threshold: f64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            checkin_threshold: 0.5,
            critical_threshold: 0.9,
        }
    }
}

impl LivenessConfig {
    pub fn validate(&self) -> Result<(), LivenessError> {
        if self.checkin_threshold <= 0.0 || self.checkin_threshold >= 1.0 {
            return Err(LivenessError::InvalidThreshold(
                "checkin_threshold must be between 0.0 and 1.0 exclusive".into(),
            ));
        }
        if self.critical_threshold <= self.checkin_threshold || self.critical_threshold >= 1.0 {
            return Err(LivenessError::InvalidThreshold(
                "critical_threshold must be between checkin_threshold and 1.0 exclusive".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LivenessError {
    #[error("Invalid threshold: {0}")]
    InvalidThreshold(String),
}

/// What the owner (or heir) should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessAction {
    Healthy,
    CheckinRecommended,
    /// Past the critical threshold. The owner must heartbeat now.
    CheckinRequired,
    /// The heir may claim.
    Claimable,
}

impl LivenessAction {
    fn priority(self) -> u8 {
        match self {
            LivenessAction::Claimable => 0,
            LivenessAction::CheckinRequired => 1,
            LivenessAction::CheckinRecommended => 2,
            LivenessAction::Healthy => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivenessStatus {
    pub owner: AccountId,
    pub heir: AccountId,
    /// `last_heartbeat + heartbeat_interval`. Claims succeed strictly after it.
    pub deadline: u64,
    pub elapsed_secs: u64,
    /// Seconds until the first claimable instant; zero or negative once claimable.
    pub seconds_until_claimable: i64,
    /// Fraction of the interval elapsed (0.0–1.0+).
    pub elapsed_fraction: f64,
    pub action: LivenessAction,
}

/// Evaluate a single vault at `now`.
pub fn evaluate_liveness(vault: &Vault, now: u64, config: &LivenessConfig) -> LivenessStatus {
    let elapsed_secs = vault.elapsed(now);
    let interval = vault.heartbeat_interval;
    let elapsed_fraction = if interval == 0 {
        1.0
    } else {
        elapsed_secs as f64 / interval as f64
    };

    let action = if vault.is_claimable(now) {
        LivenessAction::Claimable
    } else if elapsed_fraction >= config.critical_threshold {
        LivenessAction::CheckinRequired
    } else if elapsed_fraction >= config.checkin_threshold {
        LivenessAction::CheckinRecommended
    } else {
        LivenessAction::Healthy
    };

    let claimable_at = vault.deadline().saturating_add(1);
    let seconds_until_claimable = if claimable_at >= now {
        i64::try_from(claimable_at - now).unwrap_or(i64::MAX)
    } else {
        i64::try_from(now - claimable_at).map_or(i64::MIN, |d| -d)
    };

    LivenessStatus {
        owner: vault.owner,
        heir: vault.heir,
        deadline: vault.deadline(),
        elapsed_secs,
        seconds_until_claimable,
        elapsed_fraction,
        action,
    }
}

/// Evaluate many vaults, most urgent first.
pub fn evaluate_batch(vaults: &[Vault], now: u64, config: &LivenessConfig) -> Vec<LivenessStatus> {
    let mut statuses: Vec<LivenessStatus> = vaults
        .iter()
        .map(|vault| evaluate_liveness(vault, now, config))
        .collect();

    statuses.sort_by(|a, b| {
        a.action.priority().cmp(&b.action.priority()).then(
            a.elapsed_fraction
                .partial_cmp(&b.elapsed_fraction)
                .unwrap_or(std::cmp::Ordering::Equal)
                .reverse(),
        )
    });

    statuses
}
