//! Live headline fan-out.
//!
//! One consumer loop reads newly stored items from the inbound channel fed by
//! the ingest gate and offers each to every registered subscriber with a
//! non-blocking send. A subscriber whose buffer is full misses that item; a
//! subscriber whose receiver is gone is dropped from the registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use rand::seq::SliceRandom;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::model::{fingerprint, Item, UNSCORED};
use crate::shutdown::Shutdown;

type Registry = HashMap<String, mpsc::Sender<Item>>;

/// Subscriber registry. Cheap to clone; all clones share one map.
#[derive(Clone)]
pub struct Ticker {
    subscribers: Arc<Mutex<Registry>>,
    subscriber_buffer: usize,
}

/// What happened to one published item.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    pub delivered: usize,
    /// Subscribers whose buffer was full.
    pub skipped: usize,
    /// Subscribers found gone and removed.
    pub disconnected: usize,
}

impl Ticker {
    pub fn new(subscriber_buffer: usize) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            subscriber_buffer: subscriber_buffer.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `id` and return its receiving end. Re-using an id replaces
    /// the previous subscription.
    pub fn subscribe(&self, id: impl Into<String>) -> mpsc::Receiver<Item> {
        let id = id.into();
        let (tx, rx) = mpsc::channel(self.subscriber_buffer);
        if self.lock().insert(id.clone(), tx).is_some() {
            debug!(subscriber = %id, "ticker: subscription replaced");
        }
        info!(subscriber = %id, "ticker: subscribed");
        rx
    }

    pub fn unsubscribe(&self, id: &str) -> bool {
        let removed = self.lock().remove(id).is_some();
        if removed {
            info!(subscriber = %id, "ticker: unsubscribed");
        }
        removed
    }

    pub fn subscriber_exists(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    /// Offer `item` to every subscriber without waiting on any of them.
    pub fn publish(&self, item: &Item) -> PublishReport {
        // Sends happen outside the lock.
        let targets: Vec<(String, mpsc::Sender<Item>)> = self
            .lock()
            .iter()
            .map(|(id, tx)| (id.clone(), tx.clone()))
            .collect();

        let mut report = PublishReport::default();
        let mut gone = Vec::new();
        for (id, tx) in targets {
            match tx.try_send(item.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    debug!(subscriber = %id, "ticker: subscriber too slow, item skipped");
                    report.skipped += 1;
                }
                Err(TrySendError::Closed(_)) => gone.push((id, tx)),
            }
        }

        if !gone.is_empty() {
            let mut subscribers = self.lock();
            for (id, tx) in gone {
                // Only drop the entry if it was not re-subscribed meanwhile.
                if subscribers.get(&id).map_or(false, |current| current.same_channel(&tx)) {
                    subscribers.remove(&id);
                    report.disconnected += 1;
                    info!(subscriber = %id, "ticker: subscriber disconnected");
                }
            }
        }
        report
    }
}

/// Consume the inbound channel until `shutdown` fires or every sender is gone.
pub fn spawn_consumer(
    ticker: Ticker,
    mut inbound: mpsc::Receiver<Item>,
    shutdown: Shutdown,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("ticker: started");
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                next = inbound.recv() => {
                    let Some(item) = next else { break };
                    let report = ticker.publish(&item);
                    debug!(
                        title = %item.title,
                        delivered = report.delivered,
                        skipped = report.skipped,
                        "ticker: item published"
                    );
                }
            }
        }
        info!("ticker: stopped");
    })
}

const TAGS: &[&str] = &["BREAKING: ", "DEVELOPING: ", "Just in: "];
const SUBJECTS: &[&str] = &[
    "Local council",
    "Central bank",
    "Chipmaker",
    "Harbour authority",
    "Weather service",
    "Football club",
    "Space agency",
];
const ACTIONS: &[&str] = &[
    "announces", "denies", "confirms", "postpones", "unveils", "reverses", "welcomes",
];
const OBJECTS: &[&str] = &[
    "surprise rate cut",
    "new factory",
    "record heatwave",
    "merger talks",
    "budget overhaul",
    "launch window",
];

fn pick(words: &[&'static str]) -> &'static str {
    words.choose(&mut rand::thread_rng()).copied().unwrap_or_default()
}

/// A synthetic headline, for exercising live views without real feeds.
pub fn simulated_item() -> Item {
    let title = format!(
        "{}{} {} {}",
        pick(TAGS),
        pick(SUBJECTS),
        pick(ACTIONS),
        pick(OBJECTS)
    );
    let link = format!("https://example.com/ticker/{}", uuid::Uuid::new_v4());
    Item {
        id: 0,
        feed_abbr: "SIM".to_string(),
        title,
        fingerprint: fingerprint(&link),
        link,
        description: String::new(),
        published_at: Utc::now(),
        breaking_score: UNSCORED,
        breaking_reason: String::new(),
    }
}

/// Push a synthetic item into `inbound` every `every` until `shutdown` fires.
pub fn spawn_simulator(
    inbound: mpsc::Sender<Item>,
    every: Duration,
    shutdown: Shutdown,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval_at(Instant::now() + every, every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?every, "ticker: simulator started");
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = tick.tick() => {
                    if let Err(e) = inbound.try_send(simulated_item()) {
                        warn!("ticker: simulator could not queue item: {}", e);
                        if matches!(e, TrySendError::Closed(_)) {
                            break;
                        }
                    }
                }
            }
        }
        info!("ticker: simulator stopped");
    })
}
