use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::Path;
use std::sync::Arc;

use spend_recon_core::{AppConfig, ConfigLoader, DatabaseConfig, RecordStore};
use spend_recon_data::{MemoryStore, SqliteStore};
use spend_recon_engine::ReconService;
use spend_recon_scheduler::SweepScheduler;
use spend_recon_web_api::{ApiServer, TokenRegistry};

/// `database.url` value selecting the in-process store.
const MEMORY_URL: &str = "memory";

#[derive(Parser)]
#[command(name = "spend-recon")]
#[command(about = "Reconciles operator ad-spend reports against finance ledger entries", long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, global = true, env = "RECON_CONFIG", default_value = "config/Config.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the web API and the periodic sweep
    Serve {
        /// Listen address, overriding `server.host` and `server.port`
        #[arg(short, long)]
        addr: Option<String>,
    },
    /// Run one reconciliation sweep and print the report
    Sweep,
    /// Load and validate the configuration, then exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = ConfigLoader::load_from(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config))?;

    match cli.command {
        Commands::Serve { addr } => run_server(&config, addr).await?,
        Commands::Sweep => run_sweep(&config).await?,
        Commands::CheckConfig => check_config(&config),
    }

    Ok(())
}

async fn run_server(config: &AppConfig, addr: Option<String>) -> anyhow::Result<()> {
    let service = Arc::new(build_service(config).await?);
    let tokens = TokenRegistry::from_config(&config.auth);
    if tokens.is_empty() {
        tracing::warn!("No API tokens configured; every API request will be rejected");
    }

    // Dropping the scheduler stops the sweep, so it lives as long as the server.
    let sweep = SweepScheduler::new(config.sweep.clone(), Arc::clone(&service));
    let _scheduler = sweep.start().await?;

    let addr = addr.unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));
    ApiServer::new(service, tokens).serve(&addr).await
}

async fn run_sweep(config: &AppConfig) -> anyhow::Result<()> {
    let service = Arc::new(build_service(config).await?);
    let report = SweepScheduler::new(config.sweep.clone(), service)
        .run_once()
        .await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn check_config(config: &AppConfig) {
    println!("Configuration OK");
    println!("  database:   {}", redact_url(&config.database.url));
    println!(
        "  thresholds: auto {} / review {}",
        config.matching.auto_match_threshold, config.matching.review_threshold
    );
    println!(
        "  weights:    amount {} / date {} / project {}",
        config.matching.w_amount, config.matching.w_date, config.matching.w_project
    );
    println!("  currencies: {}", config.currency.rates.len());
    println!("  api tokens: {}", config.auth.tokens.len());
    if config.sweep.enabled {
        println!("  sweep:      {}", config.sweep.cron_schedule);
    } else {
        println!("  sweep:      disabled");
    }
}

async fn build_service(config: &AppConfig) -> anyhow::Result<ReconService> {
    let store = open_store(&config.database).await?;
    Ok(ReconService::new(store, config)?)
}

/// Opens the store named by `database.url`: `memory` or a SQLite URL.
async fn open_store(config: &DatabaseConfig) -> anyhow::Result<Arc<dyn RecordStore>> {
    if config.url == MEMORY_URL {
        tracing::warn!("Using the in-memory store; records are lost on exit");
        return Ok(Arc::new(MemoryStore::new()));
    }

    ensure_parent_dir(&config.url)?;
    tracing::info!(url = %redact_url(&config.url), "Opening SQLite store");
    let store = SqliteStore::connect(&config.url, config.max_connections)
        .await
        .context("failed to open the record store")?;
    Ok(Arc::new(store))
}

/// Creates the directory holding a file-backed SQLite database.
fn ensure_parent_dir(url: &str) -> anyhow::Result<()> {
    let Some(rest) = url.strip_prefix("sqlite://") else {
        return Ok(());
    };
    let file = rest.split('?').next().unwrap_or(rest);
    if file.is_empty() || file.starts_with(':') {
        return Ok(());
    }
    if let Some(parent) = Path::new(file).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("cannot create {}", parent.display()))?;
        }
    }
    Ok(())
}

/// Drops URL query parameters before logging.
fn redact_url(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}
