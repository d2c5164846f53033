//! CometIndex CLI: index a CometBFT chain live, backfill history, report gaps.
//!
//! # Commands
//! ```text
//! cometindex status   --http-url <url>
//! cometindex live     --http-url <url> [--ws-url <url>] [--db <target>]
//! cometindex backfill --http-url <url> [--order ascending] [--db <target>]
//! cometindex gaps     --http-url <url> [--db <target>]
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use cometindex_core::{BlockSource, PersisterConfig, RetryConfig};
use cometindex_engine::{BackfillHarnessBuilder, BackfillOrder, IndexerHarnessBuilder};
use cometindex_rpc::{CometHttpClient, HttpClientConfig};

mod indexer;
mod logging;
mod store;

use indexer::{event_filter, LoggingIndexer};
use logging::{init_tracing, LogConfig};
use store::Store;

#[derive(Parser)]
#[command(
    name = "cometindex",
    about = "Block indexer for CometBFT / Tendermint chains",
    long_about = "
CometIndex CLI: follow new blocks over WebSocket or HTTP polling, backfill
historical heights, and track processed block ranges in SQLite or PostgreSQL.

ENVIRONMENT VARIABLES:
  COMETINDEX_HTTP_URL    RPC endpoint used for block data
  COMETINDEX_WS_URL      WebSocket endpoint for live new-block events
  COMETINDEX_DB          memory | <sqlite file> | postgres://...
  COMETINDEX_LOG_LEVEL   trace | debug | info | warn | error
  RUST_LOG               overrides every other log setting
",
    version
)]
struct Cli {
    /// JSON file with `log`, `retry` and `persister` sections
    #[arg(long, global = true, env = "COMETINDEX_CONFIG")]
    config: Option<PathBuf>,

    /// Default log level
    #[arg(long, global = true, env = "COMETINDEX_LOG_LEVEL")]
    log_level: Option<String>,

    /// Emit JSON logs
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the block range the node serves
    Status {
        #[command(flatten)]
        node: NodeArgs,
    },

    /// Index new blocks as they are produced
    Live(LiveArgs),

    /// Process heights the store has not seen yet
    Backfill(BackfillArgs),

    /// List unprocessed block ranges
    Gaps {
        #[command(flatten)]
        node: NodeArgs,
        #[command(flatten)]
        store: StoreArgs,
    },
}

#[derive(Args)]
struct NodeArgs {
    /// CometBFT RPC endpoint, e.g. http://localhost:26657
    #[arg(long, env = "COMETINDEX_HTTP_URL")]
    http_url: String,

    /// Send `block` and `block_results` as one batch
    #[arg(long)]
    batch: bool,

    /// Per-request timeout
    #[arg(long, default_value_t = 30_000)]
    timeout_ms: u64,
}

#[derive(Args)]
struct StoreArgs {
    /// Where processed ranges live: memory, a SQLite file, or a postgres:// URL
    #[arg(long, env = "COMETINDEX_DB", default_value = "memory")]
    db: String,

    /// Range table name
    #[arg(long, default_value = "cometindex_block_ranges")]
    table: String,
}

#[derive(Args)]
struct EventArgs {
    /// Log events of exactly this type (repeatable)
    #[arg(long = "event")]
    matches: Vec<String>,

    /// Log events whose type contains this text (repeatable)
    #[arg(long = "event-contains")]
    contains: Vec<String>,
}

#[derive(Args)]
struct LiveArgs {
    #[command(flatten)]
    node: NodeArgs,
    #[command(flatten)]
    store: StoreArgs,
    #[command(flatten)]
    events: EventArgs,

    /// Subscribe over WebSocket; polls over HTTP when absent
    #[arg(long, env = "COMETINDEX_WS_URL")]
    ws_url: Option<String>,

    /// HTTP poll interval
    #[arg(long, default_value_t = 2_000)]
    poll_interval_ms: u64,

    /// First height to index when polling (defaults to the chain tip)
    #[arg(long)]
    start_height: Option<u64>,
}

#[derive(Clone, Copy, ValueEnum)]
enum OrderArg {
    Ascending,
    Descending,
    Concurrent,
    Specific,
    ConcurrentSpecific,
}

impl From<OrderArg> for BackfillOrder {
    fn from(order: OrderArg) -> Self {
        match order {
            OrderArg::Ascending => Self::Ascending,
            OrderArg::Descending => Self::Descending,
            OrderArg::Concurrent => Self::Concurrent,
            OrderArg::Specific => Self::Specific,
            OrderArg::ConcurrentSpecific => Self::ConcurrentSpecific,
        }
    }
}

#[derive(Args)]
struct BackfillArgs {
    #[command(flatten)]
    node: NodeArgs,
    #[command(flatten)]
    store: StoreArgs,
    #[command(flatten)]
    events: EventArgs,

    #[arg(long, value_enum, default_value = "ascending")]
    order: OrderArg,

    /// Workers for the concurrent orders
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Heights for the specific orders, comma separated
    #[arg(long, value_delimiter = ',')]
    heights: Vec<u64>,

    /// Do not record the specific heights as processed
    #[arg(long)]
    no_persist: bool,
}

/// Settings read from `--config`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct FileConfig {
    #[serde(default)]
    log: LogConfig,
    #[serde(default)]
    retry: RetryConfig,
    #[serde(default)]
    persister: PersisterConfig,
}

impl FileConfig {
    fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }
}

fn http_config(node: &NodeArgs, retry: &RetryConfig) -> HttpClientConfig {
    HttpClientConfig {
        request_timeout_ms: node.timeout_ms,
        batch_requests: node.batch,
        retry: retry.clone(),
    }
}

fn http_client(node: &NodeArgs, retry: &RetryConfig) -> Result<Arc<CometHttpClient>> {
    let client = CometHttpClient::new(&node.http_url, &http_config(node, retry))
        .with_context(|| format!("creating RPC client for {}", node.http_url))?;
    Ok(Arc::new(client))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let file = match &cli.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let mut log = file.log.clone();
    if let Some(level) = &cli.log_level {
        log.level = level.clone();
    }
    log.json |= cli.log_json;
    init_tracing(&log);

    match cli.command {
        Commands::Status { node } => cmd_status(&node, &file).await,
        Commands::Live(args) => cmd_live(args, &file).await,
        Commands::Backfill(args) => cmd_backfill(args, &file).await,
        Commands::Gaps { node, store } => cmd_gaps(&node, &store, &file).await,
    }
}

async fn cmd_status(node: &NodeArgs, file: &FileConfig) -> Result<()> {
    let client = http_client(node, &file.retry)?;
    let heights = client.block_heights().await.context("querying node status")?;
    let time = client
        .block_time(heights.latest)
        .await
        .context("fetching latest block")?;

    println!("Node:     {}", client.url());
    println!("Earliest: {}", heights.earliest);
    println!("Latest:   {} ({})", heights.latest, time.to_rfc3339());
    Ok(())
}

async fn cmd_gaps(node: &NodeArgs, store: &StoreArgs, file: &FileConfig) -> Result<()> {
    let source: Arc<dyn BlockSource> = http_client(node, &file.retry)?;
    let store = Store::open(&store.db, &store.table, source, file.persister.clone()).await?;
    let ranges = store.persister().get_unprocessed_block_ranges().await;
    store.close().await;

    let ranges = ranges.context("computing unprocessed ranges")?;
    if ranges.is_empty() {
        println!("No unprocessed block ranges");
    }
    for range in &ranges {
        println!("{range}  ({} blocks)", range.len());
    }
    Ok(())
}

async fn cmd_live(args: LiveArgs, file: &FileConfig) -> Result<()> {
    let source: Arc<dyn BlockSource> = http_client(&args.node, &file.retry)?;
    let store = Store::open(
        &args.store.db,
        &args.store.table,
        source.clone(),
        file.persister.clone(),
    )
    .await?;
    let indexer = Arc::new(LoggingIndexer::new(
        event_filter(&args.events.matches, &args.events.contains),
        store.persister(),
    ));

    let builder = match &args.ws_url {
        Some(ws_url) => IndexerHarnessBuilder::new().websocket(ws_url, &args.node.http_url),
        None => {
            let builder = IndexerHarnessBuilder::new()
                .http_poll(&args.node.http_url)
                .poll_interval_ms(args.poll_interval_ms);
            match args.start_height {
                Some(height) => builder.start_height(height),
                None => builder,
            }
        }
    };
    let pipeline = builder
        .retry(file.retry.clone())
        .http_config(http_config(&args.node, &file.retry))
        .block_source(source)
        .persistent_indexer(indexer)
        .build()?;

    pipeline.start().await?;
    let outcome = tokio::select! {
        res = pipeline.wait() => res,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            Ok(())
        }
    };

    if let Err(err) = pipeline.destroy().await {
        warn!(error = %err, "error during shutdown");
    }
    store.close().await;
    outcome.context("live indexing stopped")
}

async fn cmd_backfill(args: BackfillArgs, file: &FileConfig) -> Result<()> {
    let source: Arc<dyn BlockSource> = http_client(&args.node, &file.retry)?;
    let store = Store::open(
        &args.store.db,
        &args.store.table,
        source.clone(),
        file.persister.clone(),
    )
    .await?;
    let indexer = Arc::new(LoggingIndexer::new(
        event_filter(&args.events.matches, &args.events.contains),
        store.persister(),
    ));

    let backfiller = BackfillHarnessBuilder::new()
        .http_url(&args.node.http_url)
        .order(args.order.into())
        .num_workers(args.workers)
        .heights(args.heights)
        .should_persist(!args.no_persist)
        .retry(file.retry.clone())
        .block_source(source)
        .indexer(indexer)
        .build()?;

    let outcome = backfiller.start().await;
    if let Err(err) = backfiller.destroy().await {
        warn!(error = %err, "error during shutdown");
    }
    store.close().await;

    let processed = outcome.context("backfill failed")?;
    println!("Backfilled {processed} blocks");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_backfill_flags() {
        let cli = Cli::try_parse_from([
            "cometindex",
            "backfill",
            "--http-url",
            "http://localhost:26657",
            "--order",
            "concurrent-specific",
            "--heights",
            "5,9,7",
            "--no-persist",
        ])
        .unwrap();
        let Commands::Backfill(args) = cli.command else {
            panic!("expected backfill");
        };
        assert_eq!(args.heights, vec![5, 9, 7]);
        assert!(args.no_persist);
        assert_eq!(BackfillOrder::from(args.order), BackfillOrder::ConcurrentSpecific);
        assert_eq!(args.store.db, "memory");
    }

    #[test]
    fn config_file_sections_are_optional() {
        let file: FileConfig =
            serde_json::from_str(r#"{"persister":{"latest_block_buffer":5}}"#).unwrap();
        assert_eq!(file.persister.latest_block_buffer, 5);
        assert_eq!(file.log, LogConfig::default());
        assert_eq!(file.retry, RetryConfig::default());
    }
}
