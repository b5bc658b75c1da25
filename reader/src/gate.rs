use anyhow::Result;
use sqlx::SqlitePool;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::model::{Item, NewItem};
use crate::storage;

/// Dedup/persistence gate between the poller and everything downstream.
///
/// Uniqueness is left to the store's fingerprint constraint, so any number of
/// poll tasks can share one gate without further locking.
#[derive(Clone)]
pub struct IngestGate {
    pool: SqlitePool,
    ticker: mpsc::Sender<Item>,
}

impl IngestGate {
    pub fn new(pool: SqlitePool, ticker: mpsc::Sender<Item>) -> Self {
        Self { pool, ticker }
    }

    /// Store `candidate` unless its fingerprint is already known.
    ///
    /// `Ok(true)` means a new row exists and the item was handed to the
    /// ticker. A duplicate is `Ok(false)`, never an error.
    pub async fn insert_if_new(&self, candidate: NewItem) -> Result<bool> {
        let Some(id) = storage::insert_item_if_fingerprint_absent(&self.pool, &candidate).await?
        else {
            return Ok(false);
        };

        let item = candidate.into_item(id);
        debug!(id, feed = %item.feed_abbr, title = %item.title, "gate: stored new item");
        match self.ticker.try_send(item) {
            Ok(()) => {}
            Err(TrySendError::Full(item)) => {
                warn!(id = item.id, "gate: ticker inbound queue full, item not broadcast");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(id, "gate: ticker stopped, item not broadcast");
            }
        }
        Ok(true)
    }
}
