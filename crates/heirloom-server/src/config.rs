//! Server configuration, parsed from a TOML file plus environment overrides.
//!
//! Priority: environment variables > config file > defaults.

use anyhow::{Context, Result};
use heirloom_vault::{AccountId, EngineConfig, LivenessConfig, SetupPolicy, MAX_BALANCE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Top-level server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// General server settings
    #[serde(default)]
    pub server: ServerSection,

    /// Vault engine settings
    pub engine: EngineSection,

    /// Ledger settings
    #[serde(default)]
    pub ledger: LedgerSection,

    /// Reminder thresholds for the monitoring loop
    #[serde(default)]
    pub liveness: LivenessConfig,
}

/// General server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// Data directory (vault database with ledger balances)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Monitoring interval in seconds (default: 6 hours)
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            check_interval_secs: default_check_interval(),
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    /// Ledger account that holds vault balances (64 hex chars)
    pub custody_account: String,

    /// What re-running setup on an active vault does
    #[serde(default)]
    pub setup_policy: SetupPolicy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerSection {
    /// Minimum balance a withdrawal must leave in custody
    #[serde(default)]
    pub reserve: u64,

    /// Balances minted the first time the vault database is opened.
    /// Funding custody here backs the reserve.
    #[serde(default)]
    pub genesis: Vec<GenesisBalance>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisBalance {
    pub account: AccountId,
    pub balance: u64,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_data_dir() -> PathBuf {
    PathBuf::from("/data")
}

fn default_check_interval() -> u64 {
    21600 // 6 hours
}

fn default_log_level() -> String {
    "info".to_string()
}

// ============================================================================
// Loading & environment override
// ============================================================================

impl ServerConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: ServerConfig =
            toml::from_str(&contents).with_context(|| "Failed to parse TOML config")?;
        Ok(config)
    }

    /// Apply environment variable overrides.
    ///
    /// Supported env vars:
    /// - `HEIRLOOM_DATA_DIR`
    /// - `HEIRLOOM_CHECK_INTERVAL`
    /// - `HEIRLOOM_LOG_LEVEL`
    /// - `HEIRLOOM_CUSTODY_ACCOUNT`
    /// - `HEIRLOOM_SETUP_POLICY`
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("HEIRLOOM_DATA_DIR") {
            self.server.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("HEIRLOOM_CHECK_INTERVAL") {
            if let Ok(secs) = v.parse::<u64>() {
                self.server.check_interval_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("HEIRLOOM_LOG_LEVEL") {
            self.server.log_level = v;
        }
        if let Ok(v) = std::env::var("HEIRLOOM_CUSTODY_ACCOUNT") {
            self.engine.custody_account = v;
        }
        if let Ok(v) = std::env::var("HEIRLOOM_SETUP_POLICY") {
            match v.parse::<SetupPolicy>() {
                Ok(policy) => self.engine.setup_policy = policy,
                Err(e) => log::warn!("Ignoring HEIRLOOM_SETUP_POLICY: {}", e),
            }
        }
    }

    /// Parse the custody account.
    pub fn custody(&self) -> Result<AccountId> {
        AccountId::from_str(&self.engine.custody_account)
            .context("engine.custody_account is not a valid account id")
    }

    pub fn engine_config(&self) -> Result<EngineConfig> {
        Ok(EngineConfig {
            custody: self.custody()?,
            setup_policy: self.engine.setup_policy,
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.server.data_dir.join("vaults.db")
    }

    /// Validate that the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        self.custody()?;

        // Check interval must be at least 60 seconds
        anyhow::ensure!(
            self.server.check_interval_secs >= 60,
            "server.check_interval_secs must be >= 60"
        );

        self.liveness
            .validate()
            .context("Invalid [liveness] section")?;

        let mut seen = Vec::with_capacity(self.ledger.genesis.len());
        for entry in &self.ledger.genesis {
            anyhow::ensure!(
                !seen.contains(&entry.account),
                "ledger.genesis lists {} more than once",
                entry.account
            );
            anyhow::ensure!(
                entry.balance <= MAX_BALANCE,
                "ledger.genesis balance for {} exceeds {}",
                entry.account,
                MAX_BALANCE
            );
            seen.push(entry.account);
        }

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
