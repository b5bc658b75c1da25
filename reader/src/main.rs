/*
reader - single-binary main.rs
Starts the Rocket HTTP server and the background loops (feed updates,
breaking-news scoring, ticker fan-out, cache sweeping) in one process.
*/

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use common::{init_db_pool, Config, ScoringConfig};

use reader::breaking::{BreakingScheduler, ScoringSettings};
use reader::cache::{spawn_sweeper, TtlCache};
use reader::gate::IngestGate;
use reader::ingestion::FeedFetcher;
use reader::llm::remote::RemoteLlmProvider;
use reader::llm::LlmProvider;
use reader::server::{launch_rocket, AppState};
use reader::shutdown::Shutdown;
use reader::storage;
use reader::ticker::{self, Ticker};
use reader::views::Views;
use reader::worker::{spawn_update_worker, Updater};

#[derive(Parser, Debug)]
#[command(name = "reader", about = "Feed reader server + background worker")]
struct Args {
    /// Path to config.toml
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (info, debug, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Minutes between feed updates
    #[arg(long, value_name = "MINUTES")]
    update_interval: Option<u64>,

    /// Enable breaking-news scoring
    #[arg(long, conflicts_with = "no_scoring")]
    scoring: bool,

    /// Disable breaking-news scoring
    #[arg(long)]
    no_scoring: bool,

    /// File replacing the built-in scoring prompt
    #[arg(long, value_name = "FILE")]
    prompt_file: Option<PathBuf>,

    /// Run background loops only (do not bind HTTP server)
    #[arg(long)]
    worker_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI args
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    // Resolve config paths
    let default_path = PathBuf::from("config.default.toml");

    let override_path = if let Some(p) = args.config.clone() {
        if !p.exists() {
            error!(path = ?p, "specified config file not found");
            return Err(anyhow::anyhow!("Config file not found: {}", p.display()));
        }
        Some(p)
    } else {
        let p = PathBuf::from("config.toml");
        if p.exists() {
            Some(p)
        } else {
            None
        }
    };

    // Load configuration with defaults
    let mut config = match Config::load_with_defaults(
        if default_path.exists() { Some(&default_path) } else { None },
        override_path.as_deref(),
    )
    .await
    {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(%e, "failed to load configuration");
            return Err(e);
        }
    };
    apply_cli_overrides(&mut config, &args);
    info!(default = ?default_path, override = ?override_path, "configuration loaded");

    // Persistence is the one thing we cannot run without
    let db_pool = match init_db_pool(&config.database.path).await {
        Ok(p) => p,
        Err(e) => {
            error!(%e, db_path = %config.database.path, "failed to initialize database pool");
            return Err(e);
        }
    };
    storage::ensure_schema(&db_pool).await?;
    storage::seed_feeds_if_empty(&db_pool, &config.feeds).await?;

    let shutdown = Shutdown::new();
    let mut handles: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

    // Query cache
    let cache = Arc::new(TtlCache::new(Duration::from_secs(config.cache.min_horizon_seconds)));
    handles.push((
        "cache sweeper",
        spawn_sweeper(
            cache.clone(),
            Duration::from_secs(config.cache.sweep_interval_seconds.max(1)),
            shutdown.clone(),
        ),
    ));
    let views = Views::new(db_pool.clone(), cache, &config.cache);

    // Ticker fan-out
    let ticker = Ticker::new(config.ticker.subscriber_buffer);
    let (ticker_tx, ticker_rx) = mpsc::channel(config.ticker.inbound_buffer.max(1));
    handles.push((
        "ticker",
        ticker::spawn_consumer(ticker.clone(), ticker_rx, shutdown.clone()),
    ));
    if config.ticker.simulate {
        handles.push((
            "ticker simulator",
            ticker::spawn_simulator(
                ticker_tx.clone(),
                Duration::from_secs(config.ticker.simulate_interval_seconds.max(1)),
                shutdown.clone(),
            ),
        ));
    }

    // Breaking-news scoring
    let scheduler = if config.scoring.enabled {
        match build_scheduler(&db_pool, &config.scoring) {
            Ok(scheduler) => {
                scheduler.arm(shutdown.clone());
                Some(scheduler)
            }
            Err(e) => {
                error!("breaking-news scoring disabled: {:#}", e);
                None
            }
        }
    } else {
        info!("breaking-news scoring disabled");
        None
    };

    // Feed updates
    let fetcher = Arc::new(FeedFetcher::new(&config.fetch)?);
    let updater = Updater::new(
        db_pool.clone(),
        fetcher,
        IngestGate::new(db_pool.clone(), ticker_tx),
        views.clone(),
        scheduler,
        shutdown.clone(),
    );
    handles.push((
        "update worker",
        spawn_update_worker(
            updater.clone(),
            Duration::from_secs(config.scheduler.update_interval_minutes.max(1) * 60),
        ),
    ));

    if args.worker_only {
        info!("Starting in worker-only mode");
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(%e, "failed to listen for ctrl-c");
        }
        info!("ctrl-c received, shutting down");
    } else {
        let state = AppState {
            started_at: Utc::now(),
            config: Arc::new(config),
            db: db_pool.clone(),
            views,
            ticker,
            updater,
            shutdown: shutdown.clone(),
        };
        // Rocket handles ctrl-c itself and returns from launch.
        if let Err(e) = launch_rocket(state).await {
            error!(%e, "Rocket server failed");
        }
        info!("HTTP server stopped");
    }

    shutdown.trigger();
    for (name, handle) in handles {
        match tokio::time::timeout(Duration::from_secs(10), handle).await {
            Ok(Ok(())) => info!("{} exited cleanly", name),
            Ok(Err(join_err)) => error!(%join_err, "{} task panicked", name),
            Err(_) => warn!("Timed out waiting for {} to exit; continuing shutdown", name),
        }
    }

    db_pool.close().await;
    info!("Shutdown complete");
    Ok(())
}

fn apply_cli_overrides(config: &mut Config, args: &Args) {
    if let Some(minutes) = args.update_interval {
        config.scheduler.update_interval_minutes = minutes;
    }
    if args.scoring {
        config.scoring.enabled = true;
    }
    if args.no_scoring {
        config.scoring.enabled = false;
    }
    if let Some(path) = &args.prompt_file {
        config.scoring.prompt_file = Some(path.to_string_lossy().into_owned());
    }
}

/// Scoring scheduler backed by the configured remote endpoint.
fn build_scheduler(pool: &sqlx::SqlitePool, scoring: &ScoringConfig) -> Result<BreakingScheduler> {
    let api_key = std::env::var(&scoring.api_key_env)
        .with_context(|| format!("LLM API key env var '{}' not set", scoring.api_key_env))?;
    let provider = RemoteLlmProvider::new(&scoring.api_url, api_key, &scoring.model)
        .with_defaults(scoring.timeout_seconds, scoring.max_tokens);
    info!("LLM provider initialized: remote ({}) at {}", scoring.model, scoring.api_url);

    let settings = ScoringSettings::from_config(scoring)?;
    let provider: Arc<dyn LlmProvider> = Arc::new(provider);
    Ok(BreakingScheduler::new(pool.clone(), provider, settings))
}
