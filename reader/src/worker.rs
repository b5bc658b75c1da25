use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::breaking::BreakingScheduler;
use crate::gate::IngestGate;
use crate::ingestion::{self, FeedFetcher, PollReport};
use crate::shutdown::Shutdown;
use crate::views::Views;

/// Everything one feed update touches.
#[derive(Clone)]
pub struct Updater {
    pool: SqlitePool,
    fetcher: Arc<FeedFetcher>,
    gate: IngestGate,
    views: Views,
    scheduler: Option<BreakingScheduler>,
    shutdown: Shutdown,
}

impl Updater {
    pub fn new(
        pool: SqlitePool,
        fetcher: Arc<FeedFetcher>,
        gate: IngestGate,
        views: Views,
        scheduler: Option<BreakingScheduler>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            pool,
            fetcher,
            gate,
            views,
            scheduler,
            shutdown,
        }
    }

    pub fn scheduler(&self) -> Option<&BreakingScheduler> {
        self.scheduler.as_ref()
    }

    /// Poll every feed once. When anything new was stored, cached item pages
    /// are dropped and scoring is re-armed if it had stopped.
    pub async fn run_update_cycle(&self) -> Result<PollReport> {
        let report =
            ingestion::update_all_feeds(&self.pool, self.fetcher.clone(), self.gate.clone()).await?;

        if report.inserted > 0 {
            let dropped = self.views.invalidate_items();
            info!(dropped, "worker: cached item views invalidated");
            if let Some(scheduler) = &self.scheduler {
                if scheduler.arm(self.shutdown.clone()).is_some() {
                    info!("worker: scoring re-armed after update");
                }
            }
        }
        Ok(report)
    }
}

/// Run an update immediately, then every `every`, until shutdown.
pub fn spawn_update_worker(updater: Updater, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let shutdown = updater.shutdown.clone();
        let mut tick = tokio::time::interval(every);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval = ?every, "worker: started");

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = tick.tick() => {}
            }

            info!("worker: updating feeds");
            let cycle = tokio::select! {
                _ = shutdown.wait() => break,
                cycle = updater.run_update_cycle() => cycle,
            };
            if let Err(e) = cycle {
                error!("worker: update failed: {:#}", e);
            }
        }
        info!("worker: shutdown requested, exiting loop");
    })
}
