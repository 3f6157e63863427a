//! Confluence - genesis merge & balance-reconciliation engine.
//!
//! # Usage
//!
//! ```bash
//! # Dry run against a destination state file
//! confluence --genesis cudos-genesis.json --config network.json \
//!     --destination-state fetch-state.json --state-out merged-state.json \
//!     --upgrade-info data/upgrade-info.json --manifest-label v0.14.0
//!
//! # With expected digests and a reconciliation list
//! GENESIS_SHA256=... CONFIG_SHA256=... confluence --genesis g.json --config c.json \
//!     --reconciliation-csv reconciliation.csv
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use confluence_core::metrics::init_metrics;
use confluence_core::services::{
    ContractMutator, MergeOptions, MigrationPipeline, ReconciliationProcessor, SnapshotIndexer,
};
use confluence_storage::{MemoryLedger, files};

/// Confluence CLI - fold a retiring chain's genesis into a destination ledger.
#[derive(Parser, Debug)]
#[command(name = "confluence")]
#[command(about = "Confluence - genesis merge & balance-reconciliation engine")]
#[command(version)]
struct Cli {
    /// Source chain genesis export (JSON).
    #[arg(long, env = "GENESIS_FILE")]
    genesis: PathBuf,

    /// Network configuration (JSON).
    #[arg(long, env = "NETWORK_CONFIG")]
    config: PathBuf,

    /// Expected hex SHA-256 of the genesis file.
    #[arg(long, env = "GENESIS_SHA256")]
    genesis_sha256: Option<String>,

    /// Expected hex SHA-256 of the network config file.
    #[arg(long, env = "CONFIG_SHA256")]
    config_sha256: Option<String>,

    /// Reconciliation transfer list (CSV, no header).
    #[arg(long, env = "RECONCILIATION_CSV")]
    reconciliation_csv: Option<PathBuf>,

    /// Destination ledger state to merge into. Starts empty when omitted.
    #[arg(long, env = "DESTINATION_STATE")]
    destination_state: Option<PathBuf>,

    /// Upgrade-info file; the manifest is written next to it.
    #[arg(long, env = "UPGRADE_INFO", default_value = "upgrade-info.json")]
    upgrade_info: PathBuf,

    /// Prefix of the manifest file name.
    #[arg(long, env = "MANIFEST_LABEL")]
    manifest_label: Option<String>,

    /// Start of the created vesting schedules (RFC 3339). Defaults to now.
    #[arg(long, env = "VESTING_START", value_parser = parse_rfc3339)]
    vesting_start: Option<DateTime<Utc>>,

    /// Where to write the resulting destination state.
    #[arg(long, env = "STATE_OUT")]
    state_out: Option<PathBuf>,

    /// Where to write the Prometheus metrics of the run.
    #[arg(long, env = "METRICS_OUT")]
    metrics_out: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Enable JSON log output.
    #[arg(long, env = "JSON_LOGS")]
    json_logs: bool,
}

/// Parse an RFC 3339 timestamp.
fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("Invalid timestamp '{s}': {e}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json_logs);

    // Metrics are rendered to a file at the end (optional - failures don't abort the run)
    let metrics = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            init_metrics();
            Some(handle)
        }
        Err(e) => {
            warn!("⚠️  Failed to install metrics recorder: {}. Continuing without metrics.", e);
            None
        }
    };

    // ─────────────────────────────────────────────────────────────────────────
    // 🚀 STARTUP
    // ─────────────────────────────────────────────────────────────────────────
    info!("🚀 Starting Confluence merge");
    debug!(genesis = %cli.genesis.display(), config = %cli.config.display(), "Inputs");

    // ─────────────────────────────────────────────────────────────────────────
    // 📥 INPUTS
    // ─────────────────────────────────────────────────────────────────────────
    let config = files::load_config(&cli.config, cli.config_sha256.as_deref())
        .await
        .context("Failed to load network config")?;
    config.value.verify().context("Network config is invalid")?;
    info!(
        source = %config.value.merge_source_chain_id,
        destination = %config.value.destination_chain_id,
        "⚙️  Network config verified"
    );

    let genesis = files::load_genesis(&cli.genesis, cli.genesis_sha256.as_deref())
        .await
        .context("Failed to load genesis")?;

    let rows = match &cli.reconciliation_csv {
        Some(path) => files::read_reconciliation_csv(path)
            .await
            .context("Failed to read reconciliation CSV")?,
        None => Vec::new(),
    };

    let ledger = match &cli.destination_state {
        Some(path) => MemoryLedger::load(path)
            .await
            .context("Failed to load destination state")?,
        None => {
            warn!("⚠️  No destination state given, merging into an empty ledger");
            MemoryLedger::new()
        }
    };
    let ledger = Arc::new(ledger);

    let vesting_start = cli.vesting_start.unwrap_or_else(|| {
        let now = Utc::now();
        warn!(vesting_start = %now.to_rfc3339(), "⚠️  No vesting start given, using current time");
        now
    });

    // ─────────────────────────────────────────────────────────────────────────
    // 🔎 INDEX
    // ─────────────────────────────────────────────────────────────────────────
    let snapshot = SnapshotIndexer::new(&config.value)
        .index(&genesis.value)
        .context("Failed to index genesis")?;
    drop(genesis.value);

    // ─────────────────────────────────────────────────────────────────────────
    // 🔀 MERGE
    // ─────────────────────────────────────────────────────────────────────────
    let options = MergeOptions {
        vesting_start: vesting_start.timestamp(),
        genesis_sha256: Some(genesis.sha256),
        config_sha256: Some(config.sha256),
    };
    let pipeline = MigrationPipeline::new(config.value.clone(), ledger.clone(), options);
    let mut outcome = pipeline.run(snapshot).await.context("Merge failed")?;

    // ─────────────────────────────────────────────────────────────────────────
    // 📝 CONTRACTS & RECONCILIATION
    // ─────────────────────────────────────────────────────────────────────────
    if let Some(contracts) = &config.value.contracts {
        ContractMutator::new(ledger.as_ref(), contracts, &config.value.destination_address_prefix)
            .apply(&mut outcome.manifest)
            .await
            .context("Contract mutations failed")?;
    }

    ReconciliationProcessor::new(ledger.as_ref(), &config.value)
        .run(&rows, &mut outcome.manifest)
        .await
        .context("Reconciliation failed")?;

    outcome.manifest.verify().context("Manifest verification failed")?;

    // ─────────────────────────────────────────────────────────────────────────
    // 💾 OUTPUTS
    // ─────────────────────────────────────────────────────────────────────────
    let manifest_path = files::manifest_path(&cli.upgrade_info, cli.manifest_label.as_deref());
    files::save_manifest(&outcome.manifest, &manifest_path)
        .await
        .context("Failed to save manifest")?;

    if let Some(path) = &cli.state_out {
        ledger
            .save(path)
            .await
            .context("Failed to save destination state")?;
    }

    if let (Some(path), Some(handle)) = (&cli.metrics_out, &metrics) {
        write_metrics(handle, path).await?;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // ✅ DONE
    // ─────────────────────────────────────────────────────────────────────────
    info!("✅ Confluence merge complete");
    info!("   📄 Manifest: {}", manifest_path.display());
    info!("   👤 Accounts: {}", outcome.accounts.len());
    info!("   🪙 Minted:   {}", outcome.manifest.aggregated_migrated_amount());
    if let Some(check) = &outcome.manifest.supply_check
        && !check.within_tolerance
    {
        warn!(
            expected = %check.expected,
            minted = %check.minted,
            "⚠️  Supply check outside tolerance, review the manifest"
        );
    }

    Ok(())
}

/// Initialize tracing subscriber.
fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        fmt().with_env_filter(filter).json().init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .init();
    }
}

/// Render the Prometheus text format to `path`.
async fn write_metrics(handle: &PrometheusHandle, path: &Path) -> Result<()> {
    tokio::fs::write(path, handle.render())
        .await
        .with_context(|| format!("Failed to write metrics to {}", path.display()))?;
    debug!(path = %path.display(), "Metrics written");
    Ok(())
}
