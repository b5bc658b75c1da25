use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use feed_rs::model::{Entry, Feed as ParsedFeed};
use feed_rs::parser;
use reqwest::Client;
use scraper::Html;
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use common::FetchConfig;

use crate::gate::IngestGate;
use crate::model::{Feed, NewItem};
use crate::storage;

/// Previews longer than this many characters are cut and get a trailing "...".
pub const PREVIEW_MAX_CHARS: usize = 450;

/// HTTP side of polling: one shared client with timeout, user agent and retry policy.
pub struct FeedFetcher {
    client: Client,
    max_retries: u32,
}

impl FeedFetcher {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(config.user_agent.as_str())
            .build()
            .context("failed to build reqwest client")?;
        Ok(Self {
            client,
            max_retries: config.max_retries.max(1),
        })
    }

    /// Fetches a feed from the given URL and parses it.
    /// Network errors, 5xx and 429 are retried with exponential backoff; other
    /// 4xx responses fail immediately.
    pub async fn fetch_and_parse_feed(&self, url: &str) -> Result<ParsedFeed> {
        let mut last_error = None;

        for attempt in 1..=self.max_retries {
            if attempt > 1 {
                let backoff = retry_backoff(attempt); // 1s, 2s, 4s...
                info!(
                    "Retrying feed fetch for {} (attempt {}/{}) after {:?}...",
                    url, attempt, self.max_retries, backoff
                );
                tokio::time::sleep(backoff).await;
            }

            match self.client.get(url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let bytes = response.bytes().await.context("failed to read response body")?;
                        return parse_feed(bytes.as_ref());
                    } else if status.is_server_error() {
                        last_error = Some(anyhow::anyhow!("server error: {}", status));
                    } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                        last_error = Some(anyhow::anyhow!("rate limited: {}", status));
                    } else {
                        bail!("feed fetch failed with status: {}", status);
                    }
                }
                Err(e) => {
                    last_error = Some(anyhow::Error::new(e).context("network error during fetch"));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("unknown error after retries")))
    }
}

/// Upper bound for the wait between two fetch attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Wait before `attempt` (2-based): doubles from one second, capped.
fn retry_backoff(attempt: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt.saturating_sub(2))).min(MAX_BACKOFF)
}

pub fn parse_feed(bytes: &[u8]) -> Result<ParsedFeed> {
    parser::parse(bytes).context("failed to parse feed")
}

/// Plain-text preview of an HTML fragment: tags dropped, whitespace collapsed,
/// capped at [`PREVIEW_MAX_CHARS`].
pub fn preview_text(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let text = fragment
        .root_element()
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ");

    if text.chars().count() <= PREVIEW_MAX_CHARS {
        return text;
    }
    let mut cut: String = text.chars().take(PREVIEW_MAX_CHARS).collect();
    cut.push_str("...");
    cut
}

/// Candidate item for one parsed entry.
///
/// Entries without a link or without a usable date (`published`, else
/// `updated`) yield `None`. Dates ahead of `now` are clamped to `now`.
pub fn entry_to_new_item(entry: &Entry, feed_abbr: &str, now: DateTime<Utc>) -> Option<NewItem> {
    let link = entry.links.first()?.href.trim().to_string();
    if link.is_empty() {
        return None;
    }
    let published_at = entry.published.or(entry.updated)?.min(now);

    let title = entry
        .title
        .as_ref()
        .map(|t| t.content.trim().to_string())
        .unwrap_or_default();
    let content = entry
        .content
        .as_ref()
        .and_then(|c| c.body.clone())
        .unwrap_or_default();
    let summary = entry
        .summary
        .as_ref()
        .map(|s| s.content.clone())
        .unwrap_or_default();
    let description = if summary.trim().is_empty() {
        preview_text(&content)
    } else {
        preview_text(&summary)
    };

    Some(NewItem {
        feed_abbr: feed_abbr.to_string(),
        title,
        link,
        description,
        content,
        published_at,
    })
}

/// Outcome of one poll cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct PollReport {
    pub feeds_ok: usize,
    pub feeds_failed: usize,
    pub inserted: usize,
    pub duplicates: usize,
    /// Entries dropped for a missing link or unparseable date.
    pub skipped: usize,
    /// Entries the store refused.
    pub failed: usize,
}

impl PollReport {
    fn absorb(&mut self, other: FeedOutcome) {
        self.feeds_ok += 1;
        self.inserted += other.inserted;
        self.duplicates += other.duplicates;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

#[derive(Debug, Default)]
struct FeedOutcome {
    inserted: usize,
    duplicates: usize,
    skipped: usize,
    failed: usize,
}

/// Fetch one feed and run its entries through the gate in source order.
async fn ingest_feed(fetcher: &FeedFetcher, gate: &IngestGate, feed: &Feed) -> Result<FeedOutcome> {
    let parsed = fetcher
        .fetch_and_parse_feed(&feed.url)
        .await
        .with_context(|| format!("feed {} ({})", feed.abbr, feed.url))?;

    let now = Utc::now();
    let mut outcome = FeedOutcome::default();
    for entry in &parsed.entries {
        let Some(candidate) = entry_to_new_item(entry, &feed.abbr, now) else {
            debug!(feed = %feed.abbr, entry = %entry.id, "ingestion: entry without link or date skipped");
            outcome.skipped += 1;
            continue;
        };
        match gate.insert_if_new(candidate).await {
            Ok(true) => outcome.inserted += 1,
            Ok(false) => outcome.duplicates += 1,
            Err(e) => {
                warn!(feed = %feed.abbr, entry = %entry.id, "ingestion: entry not stored: {:#}", e);
                outcome.failed += 1;
            }
        }
    }
    Ok(outcome)
}

/// Poll `feeds` concurrently, one task per feed, and wait for all of them.
/// A failing feed is logged and counted; it never aborts the others.
pub async fn poll_feeds(
    fetcher: Arc<FeedFetcher>,
    gate: IngestGate,
    feeds: Vec<Feed>,
) -> PollReport {
    let mut tasks = JoinSet::new();
    for feed in feeds {
        let fetcher = fetcher.clone();
        let gate = gate.clone();
        tasks.spawn(async move {
            let result = ingest_feed(&fetcher, &gate, &feed).await;
            (feed, result)
        });
    }

    let mut report = PollReport::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((feed, Ok(outcome))) => {
                info!(
                    feed = %feed.abbr,
                    inserted = outcome.inserted,
                    duplicates = outcome.duplicates,
                    "ingestion: feed done"
                );
                report.absorb(outcome);
            }
            Ok((feed, Err(e))) => {
                warn!(feed = %feed.abbr, "ingestion: feed failed: {:#}", e);
                report.feeds_failed += 1;
            }
            Err(e) => {
                warn!("ingestion: feed task aborted: {}", e);
                report.feeds_failed += 1;
            }
        }
    }
    report
}

/// One full update: load the configured feeds and poll them all.
/// Having no feeds at all is an error for this cycle.
pub async fn update_all_feeds(
    pool: &SqlitePool,
    fetcher: Arc<FeedFetcher>,
    gate: IngestGate,
) -> Result<PollReport> {
    let feeds = storage::find_feeds(pool).await?;
    if feeds.is_empty() {
        bail!("no feeds configured");
    }
    let report = poll_feeds(fetcher, gate, feeds).await;
    info!(
        feeds_ok = report.feeds_ok,
        feeds_failed = report.feeds_failed,
        inserted = report.inserted,
        "ingestion: update finished"
    );
    Ok(report)
}
