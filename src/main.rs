// ABOUTME: CLI entry point for erp-replicator
// ABOUTME: Parses commands and routes to the sync daemon and diagnostic handlers

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use erp_replicator::config::Config;
use erp_replicator::erp::{self, ErpClient, ErpTransport};
use erp_replicator::remote::models::QueryRequest;
use erp_replicator::remote::{RemoteClient, RemoteStore};
use erp_replicator::sync::{Decision, SyncDaemon, SyncMode, SyncState, SyncStats};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "erp-replicator")]
#[command(about = "Incremental ERP-to-HTTP replication CLI", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(
        long,
        global = true,
        env = "ERP_REPLICATOR_CONFIG",
        default_value = "erp-replicator.toml"
    )]
    config: PathBuf,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    /// Remote store API key (overrides remote.api_key in the config file)
    #[arg(long = "api-key", env = "ERP_REPLICATOR_API_KEY", global = true)]
    api_key: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replicate changed ERP data to the remote store on a schedule
    Sync {
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
        /// Re-extract every table regardless of counters
        #[arg(long)]
        full: bool,
    },
    /// Check that the ERP and the remote store are reachable
    Check,
    /// Print the XML request compiled for a table
    Compile {
        table: String,
    },
    /// Extract a table from the ERP and print the records as JSON
    Extract {
        table: String,
        /// Print at most this many records
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show ERP, remote, and local AlterID counters
    Counters,
    /// Read rows back from the remote store
    Query {
        table: String,
        #[arg(long, default_value_t = 20)]
        limit: u64,
        #[arg(long, default_value_t = 0)]
        offset: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    // 1. RUST_LOG environment variable has highest precedence
    // 2. --log flag is used if RUST_LOG is not set
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let mut config = Config::load(&cli.config)?;
    if cli.api_key.is_some() {
        config.remote.api_key = cli.api_key.clone();
    }

    match cli.command {
        Commands::Sync { once, full } => sync(&config, once, full).await,
        Commands::Check => check(&config).await,
        Commands::Compile { table } => {
            let spec = config
                .tables
                .find(&table)
                .with_context(|| format!("Table '{}' is not declared in {:?}", table, cli.config))?;
            let xml = erp::compile(spec, &config.erp.request_options())?;
            println!("{}", xml);
            Ok(())
        }
        Commands::Extract { table, limit } => extract(&config, &table, limit).await,
        Commands::Counters => counters(&config).await,
        Commands::Query {
            table,
            limit,
            offset,
        } => query(&config, &table, limit, offset).await,
    }
}

fn erp_client(config: &Config) -> anyhow::Result<ErpClient> {
    Ok(ErpClient::new(
        &config.erp.host,
        config.erp.port,
        Duration::from_secs(config.erp.timeout_secs),
        Duration::from_secs(config.erp.bulk_timeout_secs),
    )?)
}

fn remote_client(config: &Config) -> anyhow::Result<RemoteClient> {
    Ok(RemoteClient::new(
        &config.remote.base_url,
        config.remote.api_key.clone(),
        &config.remote.tenant,
        &config.remote.sub_tenant,
        Duration::from_secs(config.remote.timeout_secs),
    )?)
}

async fn build_daemon(config: &Config) -> anyhow::Result<SyncDaemon<ErpClient, RemoteClient>> {
    let daemon_config = config.daemon_config();
    let state = match daemon_config.state_path {
        Some(ref path) => {
            SyncState::load_or_new(path, &config.erp.endpoint(), &config.remote.base_url).await
        }
        None => SyncState::new(&config.erp.endpoint(), &config.remote.base_url),
    };
    Ok(SyncDaemon::new(
        erp_client(config)?,
        remote_client(config)?,
        config.tables.clone(),
        daemon_config,
        state,
    )?)
}

fn print_stats(stats: &SyncStats) {
    tracing::info!("Sync cycle complete:");
    tracing::info!("  Mode: {:?}", stats.kind);
    tracing::info!("  Tables synced: {}", stats.tables_synced);
    tracing::info!("  Records synced: {}", stats.records_synced);
    if !stats.errors.is_empty() {
        tracing::warn!("  Errors: {}", stats.errors.len());
        for err in &stats.errors {
            tracing::warn!("    - {}", err);
        }
    }

    println!();
    println!("========================================");
    println!("Sync cycle complete");
    println!("========================================");
    println!("  Run: {}", stats.run_id);
    println!("  Tables synced: {}", stats.tables_synced);
    println!("  Tables failed: {}", stats.tables_failed);
    println!("  Records synced: {}", stats.records_synced);
    println!("  Partitions advanced: {:?}", stats.partitions_advanced);
    println!("  Duration: {}ms", stats.duration_ms);
}

async fn sync(config: &Config, once: bool, full: bool) -> anyhow::Result<()> {
    let daemon = build_daemon(config).await?;

    if once || full {
        let mode = if full { SyncMode::Full } else { SyncMode::Auto };
        let stats = match daemon.try_run_cycle(mode).await {
            Some(result) => result?,
            None => bail!("A sync cycle is already running"),
        };
        print_stats(&stats);
        if !stats.is_success() {
            bail!("Sync cycle finished with {} errors", stats.errors.len());
        }
        return Ok(());
    }

    tracing::info!("Starting continuous sync daemon...");
    tracing::info!("Press Ctrl+C to stop");

    println!();
    println!("========================================");
    println!("Starting ERP replication");
    println!("========================================");
    println!("  ERP: {}", config.erp.endpoint());
    println!("  Sync interval: {}s", config.sync.interval_secs);
    println!("  Tables: {}", config.tables.len());
    println!("  Press Ctrl+C to stop");
    println!();

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);

    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Received shutdown signal");
        let _ = shutdown_tx_clone.send(());
    });

    daemon.run(shutdown_rx).await
}

async fn check(config: &Config) -> anyhow::Result<()> {
    let erp = erp_client(config)?;
    let remote = remote_client(config)?;

    let erp_result = erp.check().await;
    match erp_result {
        Ok(()) => println!("ERP          {}  ok", erp.endpoint()),
        Err(ref e) => println!("ERP          {}  FAILED: {}", erp.endpoint(), e),
    }
    let remote_result = remote.health().await;
    match remote_result {
        Ok(()) => println!("Remote store {}  ok", config.remote.base_url),
        Err(ref e) => println!("Remote store {}  FAILED: {}", config.remote.base_url, e),
    }

    if erp_result.is_err() || remote_result.is_err() {
        bail!("Connectivity check failed");
    }
    Ok(())
}

async fn extract(config: &Config, table: &str, limit: Option<usize>) -> anyhow::Result<()> {
    let spec = config
        .tables
        .find(table)
        .with_context(|| format!("Table '{}' is not declared", table))?;
    let erp = erp_client(config)?;

    let records = erp::extract_table(&erp, spec, &config.erp.request_options()).await?;
    tracing::info!("Extracted {} records from {}", records.len(), table);

    let shown = limit.unwrap_or(records.len()).min(records.len());
    let rows: Vec<_> = records.into_iter().take(shown).map(|r| r.into_json()).collect();
    println!("{}", serde_json::to_string_pretty(&rows)?);
    Ok(())
}

async fn counters(config: &Config) -> anyhow::Result<()> {
    let daemon = build_daemon(config).await?;
    let tracker = daemon.tracker();

    match tracker.source_counters().await {
        Ok(c) => println!("ERP     master={} transaction={}", c.master, c.transaction),
        Err(e) => println!("ERP     unavailable: {}", e),
    }
    match tracker.remote_counters().await {
        Ok(snapshot) => println!(
            "Remote  master={} transaction={} ({} records)",
            snapshot.counters.master, snapshot.counters.transaction, snapshot.total_records
        ),
        Err(e) => println!("Remote  unavailable: {}", e),
    }
    let local = daemon.counters().await;
    println!(
        "Local   master={} transaction={}",
        local.master, local.transaction
    );

    match tracker.assess().await? {
        Decision::Cold(reason) => println!("Next cycle: full extraction ({})", reason),
        Decision::Incremental { changes, .. } if changes.any() => {
            println!("Next cycle: incremental over {:?}", changes.partitions())
        }
        Decision::Incremental { .. } => println!("Next cycle: nothing to do"),
    }
    Ok(())
}

async fn query(config: &Config, table: &str, limit: u64, offset: u64) -> anyhow::Result<()> {
    let remote = remote_client(config)?;
    let response = remote
        .query(&QueryRequest {
            table: Some(table.to_string()),
            limit,
            offset,
            ..Default::default()
        })
        .await?;

    println!("{}", serde_json::to_string_pretty(&response.data)?);
    eprintln!(
        "{} of {} rows{}",
        response.data.len(),
        response.total,
        response
            .next_offset
            .map(|n| format!(", next offset {}", n))
            .unwrap_or_default()
    );
    Ok(())
}
