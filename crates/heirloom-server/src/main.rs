//! Heirloom Server: headless vault engine host.
//!
//! Applies signed owner/heir requests, answers queries, and runs a monitoring
//! loop that flags vaults whose owners are overdue for a heartbeat.
//!
//! # Usage
//!
//! ```bash
//! heirloom-server --config /path/to/heirloom-server.toml
//! heirloom-server --apply request.json   # Apply one signed request and exit
//! heirloom-server --query query.json     # Answer one query and exit
//! heirloom-server --check                # Run one monitoring pass and exit
//! heirloom-server --validate             # Validate config and exit
//! ```

mod config;
mod daemon;

use anyhow::{Context, Result};
use std::path::PathBuf;

enum Mode {
    Daemon,
    Check,
    Validate,
    Apply(PathBuf),
    Query(PathBuf),
}

fn main() -> Result<()> {
    // Parse CLI args (minimal, no clap dependency needed)
    let args: Vec<String> = std::env::args().collect();

    let mut config_path = PathBuf::from("/config/heirloom-server.toml");
    let mut mode = Mode::Daemon;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                if i < args.len() {
                    config_path = PathBuf::from(&args[i]);
                } else {
                    anyhow::bail!("--config requires a path argument");
                }
            }
            "--check" | "--once" => {
                mode = Mode::Check;
            }
            "--validate" => {
                mode = Mode::Validate;
            }
            "--apply" => {
                i += 1;
                let path = args
                    .get(i)
                    .context("--apply requires a path to a signed request")?;
                mode = Mode::Apply(PathBuf::from(path));
            }
            "--query" => {
                i += 1;
                let path = args.get(i).context("--query requires a path to a query")?;
                mode = Mode::Query(PathBuf::from(path));
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            "--version" | "-V" => {
                println!("heirloom-server {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            other => {
                anyhow::bail!("Unknown argument: {}", other);
            }
        }
        i += 1;
    }

    // Load config
    let mut server_config = config::ServerConfig::from_file(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    // Apply env overrides
    server_config.apply_env_overrides();

    // Validate
    server_config
        .validate()
        .context("Configuration validation failed")?;

    // Init logger
    std::env::set_var("RUST_LOG", &server_config.server.log_level);
    env_logger::init();

    match mode {
        Mode::Validate => {
            println!("✅ Configuration is valid.");
            println!("  Data dir:       {}", server_config.server.data_dir.display());
            println!("  Custody:        {}", server_config.engine.custody_account);
            println!("  Re-setup:       {}", server_config.engine.setup_policy);
            println!("  Ledger reserve: {}", server_config.ledger.reserve);
            println!(
                "  Genesis:        {} account(s)",
                server_config.ledger.genesis.len()
            );
            println!(
                "  Thresholds:     {:.0}% / {:.0}%",
                server_config.liveness.checkin_threshold * 100.0,
                server_config.liveness.critical_threshold * 100.0
            );
            println!(
                "  Check interval: {} secs",
                server_config.server.check_interval_secs
            );
        }
        Mode::Apply(path) => {
            let json = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read request {}", path.display()))?;
            let runtime = daemon::Runtime::open(&server_config)?;
            let response = runtime.apply_json(&json);
            println!("{}", serde_json::to_string_pretty(&response)?);
            if !response.is_ok() {
                std::process::exit(2);
            }
        }
        Mode::Query(path) => {
            let json = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read query {}", path.display()))?;
            let runtime = daemon::Runtime::open(&server_config)?;
            let response = runtime.answer_json(&json);
            println!("{}", serde_json::to_string_pretty(&response)?);
            if !response.is_ok() {
                std::process::exit(2);
            }
        }
        Mode::Check => {
            daemon::run_check_cycle(&server_config)?;
            log::info!("Done.");
        }
        Mode::Daemon => {
            let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;

            // Install Ctrl-C handler for graceful shutdown
            let shutdown = rt.block_on(async {
                tokio::select! {
                    result = daemon::run(server_config) => result,
                    _ = tokio::signal::ctrl_c() => {
                        log::info!("Received shutdown signal. Exiting…");
                        Ok(())
                    }
                }
            });

            if let Err(e) = shutdown {
                log::error!("Server error: {:#}", e);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn print_help() {
    println!(
        r#"Heirloom Server: time-gated inheritance vault engine

USAGE:
    heirloom-server [OPTIONS]

OPTIONS:
    -c, --config <PATH>   Config file path (default: /config/heirloom-server.toml)
    --apply <PATH>        Apply one signed request (JSON) and print the response
    --query <PATH>        Answer one query (JSON) and print the response
    --check, --once       Run a single monitoring pass and exit
    --validate            Validate config file and exit
    -h, --help            Show this help message
    -V, --version         Show version

ENVIRONMENT VARIABLES (override config file):
    HEIRLOOM_DATA_DIR          Data directory path
    HEIRLOOM_CHECK_INTERVAL    Monitoring interval in seconds
    HEIRLOOM_LOG_LEVEL         Log level (error/warn/info/debug/trace)
    HEIRLOOM_CUSTODY_ACCOUNT   Custody account id (64 hex chars)
    HEIRLOOM_SETUP_POLICY      Re-setup policy (reject/overwrite)

EXAMPLES:
    # Run the monitoring daemon
    heirloom-server --config /path/to/config.toml

    # Apply an owner heartbeat
    heirloom-server --config config.toml --apply heartbeat.json

    # Single monitoring pass (useful for cron jobs)
    heirloom-server --config config.toml --check
"#
    );
}
