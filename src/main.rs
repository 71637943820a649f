mod aggregator;
mod api;
mod chain;
mod config;
mod correlator;
mod db;
mod error;
mod export;
mod inputs;
mod scanner;
mod scheduler;
mod state;
mod types;
mod window;

use std::future::IntoFuture;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::aggregator::AddressBook;
use crate::api::health::HealthState;
use crate::api::latency::TaskDurations;
use crate::api::routes::{router, ApiState};
use crate::chain::rpc::BitcoinRpc;
use crate::chain::ChainSource;
use crate::config::Config;
use crate::correlator::{CorrelationReport, EventCorrelator};
use crate::db::{FileCursor, RecordStore};
use crate::error::Result;
use crate::export::ReportExporter;
use crate::scanner::TransactionScanner;
use crate::scheduler::spec::{load_task_file, TaskKind};
use crate::scheduler::tasks::{BlockSignal, CheckBlocks, MonitorAddresses, ScheduledTask};
use crate::scheduler::TaskScheduler;
use crate::state::TaskBoard;
use crate::types::{FilterConfig, Partition};
use crate::window::EventWindowResolver;

#[derive(Parser)]
#[command(name = "btc-monitor", about = "Correlate large BTC transfers with market events")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan the window before every event with the configured value band.
    Events,
    /// Scan every event once per filter row in FILE.
    Batch { file: PathBuf },
    /// Run the recurring tasks from TASKS_FILE and serve the read API.
    Agent,
    /// Deduplicate the stored records and write them to OUTPUT_DIR.
    Export,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg, cli.command).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config, command: Command) -> Result<()> {
    // --- Database setup ---
    let store = RecordStore::open(&cfg.db_path).await?;
    info!("Database ready at {}", cfg.db_path);

    if let Command::Export = command {
        let summary = ReportExporter::new(&cfg.output_dir).export(&store).await?;
        info!(
            regular = summary.regular,
            coinbase = summary.coinbase,
            duplicates_removed = summary.regular_dedup.removed() + summary.coinbase_dedup.removed(),
            "export complete"
        );
        return Ok(());
    }

    // --- Chain source and correlator ---
    let source: Arc<dyn ChainSource> = Arc::new(BitcoinRpc::new(&cfg)?);
    let scanner = TransactionScanner::new(source, cfg.retry_policy());
    let resolver = EventWindowResolver::from_scanner(&scanner).await?;
    let labels = match &cfg.labels_file {
        Some(path) => AddressBook::load(path)?,
        None => AddressBook::new(),
    };
    info!(labels = labels.len(), rpc = %cfg.rpc_url, "chain source ready");
    let correlator = Arc::new(EventCorrelator::new(
        scanner,
        resolver,
        Arc::new(labels),
        cfg.max_concurrent_scans,
    ));

    match command {
        Command::Events => {
            let filters = vec![FilterConfig {
                name: "default".to_string(),
                band: cfg.band,
                lookback_secs: cfg.lookback_secs,
            }];
            correlate(&cfg, &correlator, &store, &filters).await
        }
        Command::Batch { file } => {
            let filters = inputs::load_filters(&file, cfg.band, cfg.lookback_secs)?;
            correlate(&cfg, &correlator, &store, &filters).await
        }
        Command::Agent => agent(&cfg, correlator, store).await,
        Command::Export => Ok(()),
    }
}

/// Event-window mode: every event × filter pair, then persist and summarise.
async fn correlate(
    cfg: &Config,
    correlator: &EventCorrelator,
    store: &RecordStore,
    filters: &[FilterConfig],
) -> Result<()> {
    let events = inputs::load_events(&cfg.events_file)?;
    let CorrelationReport { records, summaries, run } = correlator.run(&events, filters).await;

    for partition in Partition::all() {
        let inserted = store.insert(partition, records.partition(partition)).await?;
        info!(%partition, inserted, "records stored");
    }
    let summary_file = ReportExporter::new(&cfg.output_dir).append_summaries(&summaries)?;
    info!(path = %summary_file.display(), pairs = summaries.len(), "event summaries written");

    if run.is_partial() {
        for (pair, reason) in &run.failures {
            warn!(pair = %pair, reason = %reason, "pair failed");
        }
    }
    info!(succeeded = run.succeeded, failed = run.failed, "run complete");
    Ok(())
}

/// Agent mode: scheduler loop plus the read API until ctrl-c.
async fn agent(cfg: &Config, correlator: Arc<EventCorrelator>, store: RecordStore) -> Result<()> {
    let specs = load_task_file(&cfg.tasks_file)?;
    let signal = BlockSignal::new(Arc::new(FileCursor::new(&cfg.cursor_path)));
    let board = TaskBoard::new();
    let durations = Arc::new(TaskDurations::new()?);
    let health = Arc::new(HealthState::new());

    let scheduler = TaskScheduler::new(
        specs,
        Arc::clone(&signal),
        Arc::clone(&board),
        Arc::clone(&durations),
        Arc::clone(&health),
        Duration::from_secs(cfg.task_timeout_secs),
        |spec| -> Arc<dyn ScheduledTask> {
            match spec.kind {
                TaskKind::CheckBlocks => {
                    Arc::new(CheckBlocks::new(Arc::clone(&correlator), Arc::clone(&signal)))
                }
                TaskKind::MonitorAddresses => Arc::new(MonitorAddresses::new(
                    Arc::clone(&correlator),
                    store.clone(),
                    Arc::clone(&signal),
                    cfg.band,
                )),
            }
        },
    )?;
    info!(tasks = board.len(), tick_secs = cfg.tick_secs, "scheduler ready");

    // HTTP API server
    let app = router(ApiState { store: store.clone(), board, durations, health });
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");

    tokio::select! {
        _ = scheduler.run(Duration::from_secs(cfg.tick_secs)) => {}
        served = axum::serve(listener, app).into_future() => served?,
        _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
    }
    Ok(())
}
