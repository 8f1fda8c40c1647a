//! Server runtime: applies signed requests and periodically reviews vault
//! liveness.

use crate::config::ServerConfig;
use anyhow::{Context, Result};
use heirloom_vault::{
    answer, evaluate_batch, execute, store, Clock, LivenessAction, LivenessConfig, Query,
    Response, SignedRequest, SqliteLedger, SystemClock, VaultEngine,
};
use std::sync::Arc;
use std::time::Duration;

/// Engine over `vaults.db`, whose ledger balances live in the same store.
pub struct Runtime {
    engine: VaultEngine,
    liveness: LivenessConfig,
}

/// Tally of one monitoring pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CheckReport {
    pub total: usize,
    pub healthy: usize,
    pub checkin_recommended: usize,
    pub checkin_required: usize,
    pub claimable: usize,
}

impl Runtime {
    /// Open the vault database under `data_dir`, seeding ledger balances
    /// from `[ledger.genesis]` the first time.
    pub fn open(config: &ServerConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.server.data_dir).with_context(|| {
            format!(
                "Failed to create data dir: {}",
                config.server.data_dir.display()
            )
        })?;

        let db_path = config.db_path();
        let mut conn = store::open_store(&db_path)
            .with_context(|| format!("Failed to open vault database {}", db_path.display()))?;

        let clock = Arc::new(SystemClock);
        let genesis: Vec<_> = config
            .ledger
            .genesis
            .iter()
            .map(|g| (g.account, g.balance))
            .collect();
        if SqliteLedger::seed_genesis(&mut conn, &genesis, clock.now())
            .context("Failed to seed ledger genesis")?
        {
            log::info!("Seeded ledger with {} genesis balance(s)", genesis.len());
        }

        let engine = VaultEngine::new(
            conn,
            Arc::new(SqliteLedger::new(config.ledger.reserve)),
            clock,
            config.engine_config()?,
        );

        Ok(Self {
            engine,
            liveness: config.liveness.clone(),
        })
    }

    #[cfg(test)]
    pub fn engine(&self) -> &VaultEngine {
        &self.engine
    }

    /// Apply one signed request. The ledger movement commits together with
    /// the vault change.
    pub fn apply(&self, signed: &SignedRequest) -> Response {
        let response = execute(&self.engine, signed);
        match &response {
            Response::Ok { .. } => {
                log::info!("Applied {} from {}", signed.request.name(), signed.caller);
            }
            Response::Error { kind, message } => {
                log::warn!(
                    "Rejected {} from {}: {} ({})",
                    signed.request.name(),
                    signed.caller,
                    message,
                    kind
                );
            }
        }
        response
    }

    /// Decode and apply a JSON-encoded signed request.
    pub fn apply_json(&self, json: &str) -> Response {
        match serde_json::from_str::<SignedRequest>(json) {
            Ok(signed) => self.apply(&signed),
            Err(e) => Response::malformed(format!("invalid signed request: {}", e)),
        }
    }

    /// Decode and answer a JSON-encoded query.
    pub fn answer_json(&self, json: &str) -> Response {
        match serde_json::from_str::<Query>(json) {
            Ok(query) => answer(&self.engine, &query, &self.liveness),
            Err(e) => Response::malformed(format!("invalid query: {}", e)),
        }
    }

    /// Review every active vault and log the ones that need attention.
    pub fn check_vaults(&self) -> Result<CheckReport> {
        let vaults = self.engine.list_vaults().context("Failed to list vaults")?;
        let now = self.engine.now();
        let statuses = evaluate_batch(&vaults, now, &self.liveness);

        let mut report = CheckReport {
            total: statuses.len(),
            ..Default::default()
        };
        for status in &statuses {
            match status.action {
                LivenessAction::Claimable => {
                    report.claimable += 1;
                    log::warn!(
                        "[{}] Claimable by heir {} since {}",
                        status.owner,
                        status.heir,
                        format_timestamp(status.deadline.saturating_add(1))
                    );
                }
                LivenessAction::CheckinRequired => {
                    report.checkin_required += 1;
                    log::warn!(
                        "[{}] Heartbeat required: deadline {} ({:.0}% elapsed)",
                        status.owner,
                        format_timestamp(status.deadline),
                        status.elapsed_fraction * 100.0
                    );
                }
                LivenessAction::CheckinRecommended => {
                    report.checkin_recommended += 1;
                    log::info!(
                        "[{}] Heartbeat recommended: deadline {} (~{:.1} days left)",
                        status.owner,
                        format_timestamp(status.deadline),
                        status.seconds_until_claimable as f64 / 86_400.0
                    );
                }
                LivenessAction::Healthy => {
                    report.healthy += 1;
                    log::debug!("[{}] Healthy", status.owner);
                }
            }
        }

        let counted = self.engine.get_total_vaults()?;
        if counted != vaults.len() as u64 {
            log::error!(
                "Registry counter {} disagrees with {} stored vaults",
                counted,
                vaults.len()
            );
        }

        Ok(report)
    }
}

fn format_timestamp(secs: u64) -> String {
    i64::try_from(secs)
        .ok()
        .and_then(|s| chrono::DateTime::from_timestamp(s, 0))
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| secs.to_string())
}

/// Execute a single monitoring pass.
pub fn run_check_cycle(config: &ServerConfig) -> Result<CheckReport> {
    log::info!("Starting check cycle…");
    let runtime = Runtime::open(config)?;
    let report = runtime.check_vaults()?;
    log::info!(
        "Vaults: {}  |  claimable: {}  required: {}  recommended: {}  healthy: {}",
        report.total,
        report.claimable,
        report.checkin_required,
        report.checkin_recommended,
        report.healthy
    );
    Ok(report)
}

/// Run the monitoring loop. Blocks forever (until shutdown signal).
pub async fn run(config: ServerConfig) -> Result<()> {
    log::info!("Heirloom server starting…");
    log::info!(
        "  Interval:   {} seconds ({:.1} hours)",
        config.server.check_interval_secs,
        config.server.check_interval_secs as f64 / 3600.0
    );
    log::info!("  Data dir:   {}", config.server.data_dir.display());
    log::info!("  Custody:    {}", config.engine.custody_account);
    log::info!("  Re-setup:   {}", config.engine.setup_policy);

    let runtime = Runtime::open(&config)?;
    let interval = Duration::from_secs(config.server.check_interval_secs);

    // Run first check immediately, then loop
    let mut first = true;
    loop {
        if !first {
            log::info!(
                "Sleeping {} seconds until next check…",
                config.server.check_interval_secs
            );
            tokio::time::sleep(interval).await;
        }
        first = false;

        match runtime.check_vaults() {
            Ok(report) => log::info!(
                "Check cycle completed: {} vault(s), {} claimable, {} need a heartbeat",
                report.total,
                report.claimable,
                report.checkin_required
            ),
            Err(e) => log::error!("Check cycle failed: {:#}", e),
        }
    }
}
