use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{TimeZone, Utc};
use common::{CacheConfig, FetchConfig};
use reader::breaking::{BreakingScheduler, SchedulerState, ScoringSettings};
use reader::cache::TtlCache;
use reader::gate::IngestGate;
use reader::ingestion::FeedFetcher;
use reader::llm::{LlmProvider, LlmRequest, LlmResponse};
use reader::model::{Item, NewItem};
use reader::shutdown::Shutdown;
use reader::storage;
use reader::ticker::{self, Ticker};
use reader::views::Views;
use reader::worker::Updater;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tokio::sync::mpsc;

const WIRE_RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0"><channel><title>Wire</title>
<item><title>ECB cuts rates</title><link>https://wire.example/1</link>
  <pubDate>Tue, 10 Jun 2025 09:00:00 GMT</pubDate></item>
<item><title>Chipmaker opens new fab</title><link>https://wire.example/2</link>
  <pubDate>Tue, 10 Jun 2025 08:30:00 GMT</pubDate></item>
<item><title>Port strike ends</title><link>https://wire.example/3</link>
  <pubDate>Tue, 10 Jun 2025 08:00:00 GMT</pubDate></item>
<item><title>Old story, new headline</title><link>https://wire.example/4</link>
  <pubDate>Tue, 10 Jun 2025 07:00:00 GMT</pubDate></item>
</channel></rss>"#;

/// Scorer that must never be reached in these tests.
struct Unreachable;

#[async_trait::async_trait]
impl LlmProvider for Unreachable {
    async fn generate(&self, _request: LlmRequest) -> Result<LlmResponse> {
        bail!("scorer should not be called")
    }

    fn model(&self) -> &str {
        "unreachable"
    }
}

async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory sqlite pool");
    storage::ensure_schema(&pool).await.expect("schema");
    pool
}

async fn next_item(rx: &mut mpsc::Receiver<Item>) -> Item {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("ticker delivery")
        .expect("subscriber channel open")
}

#[tokio::test]
async fn new_entries_reach_every_subscriber_once() {
    let mut server = mockito::Server::new_async().await;
    let feed_mock = server
        .mock("GET", "/rss")
        .with_status(200)
        .with_header("content-type", "application/rss+xml")
        .with_body(WIRE_RSS)
        .expect(2)
        .create_async()
        .await;

    let pool = memory_pool().await;
    storage::create_feed(&pool, "Wire Service", "WIRE", &format!("{}/rss", server.url()))
        .await
        .unwrap();
    // The fourth entry was already stored under an older headline
    storage::insert_item_if_fingerprint_absent(
        &pool,
        &NewItem {
            feed_abbr: "WIRE".to_string(),
            title: "Old story".to_string(),
            link: "https://wire.example/4".to_string(),
            description: String::new(),
            content: String::new(),
            published_at: Utc.with_ymd_and_hms(2025, 6, 10, 7, 0, 0).unwrap(),
        },
    )
    .await
    .unwrap();

    let shutdown = Shutdown::new();
    let ticker = Ticker::new(8);
    let mut alice = ticker.subscribe("alice");
    let mut bob = ticker.subscribe("bob");
    let (ticker_tx, ticker_rx) = mpsc::channel(16);
    let consumer = ticker::spawn_consumer(ticker.clone(), ticker_rx, shutdown.clone());

    let views = Views::new(
        pool.clone(),
        Arc::new(TtlCache::new(Duration::from_secs(10))),
        &CacheConfig::default(),
    );
    let scheduler = BreakingScheduler::new(
        pool.clone(),
        Arc::new(Unreachable),
        ScoringSettings {
            tick: Duration::from_secs(3600),
            ..ScoringSettings::default()
        },
    );
    let fetcher = FeedFetcher::new(&FetchConfig {
        max_retries: 1,
        ..FetchConfig::default()
    })
    .unwrap();
    let updater = Updater::new(
        pool.clone(),
        Arc::new(fetcher),
        IngestGate::new(pool.clone(), ticker_tx),
        views.clone(),
        Some(scheduler.clone()),
        shutdown.clone(),
    );

    // Warm an item page so the update has something to invalidate
    assert_eq!(views.items("", 50, 0, 0).await.unwrap().len(), 1);
    assert_eq!(views.cache().len(), 1);
    assert_eq!(scheduler.state(), SchedulerState::Idle);

    let report = updater.run_update_cycle().await.unwrap();
    assert_eq!(report.feeds_ok, 1);
    assert_eq!(report.feeds_failed, 0);
    assert_eq!(report.inserted, 3);
    assert_eq!(report.duplicates, 1);
    assert_eq!(storage::count_items(&pool).await.unwrap(), 4);

    assert!(views.cache().is_empty(), "item pages dropped after insert");
    assert_eq!(scheduler.state(), SchedulerState::Armed, "scoring re-armed");

    for rx in [&mut alice, &mut bob] {
        let titles = vec![
            next_item(rx).await.title,
            next_item(rx).await.title,
            next_item(rx).await.title,
        ];
        assert_eq!(
            titles,
            ["ECB cuts rates", "Chipmaker opens new fab", "Port strike ends"]
        );
    }

    // Nothing new the second time round
    let report = updater.run_update_cycle().await.unwrap();
    assert_eq!(report.inserted, 0);
    assert_eq!(report.duplicates, 4);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(alice.try_recv().is_err());
    assert!(bob.try_recv().is_err());

    shutdown.trigger();
    consumer.await.unwrap();
    feed_mock.assert_async().await;
}

#[tokio::test]
async fn unreachable_feed_is_counted_not_fatal() {
    let mut server = mockito::Server::new_async().await;
    let _gone = server
        .mock("GET", "/gone")
        .with_status(404)
        .create_async()
        .await;
    let _live = server
        .mock("GET", "/rss")
        .with_status(200)
        .with_body(WIRE_RSS)
        .create_async()
        .await;

    let pool = memory_pool().await;
    storage::create_feed(&pool, "Gone", "GONE", &format!("{}/gone", server.url()))
        .await
        .unwrap();
    storage::create_feed(&pool, "Wire Service", "WIRE", &format!("{}/rss", server.url()))
        .await
        .unwrap();

    let (ticker_tx, mut ticker_rx) = mpsc::channel(16);
    let views = Views::new(
        pool.clone(),
        Arc::new(TtlCache::new(Duration::from_secs(10))),
        &CacheConfig::default(),
    );
    let updater = Updater::new(
        pool.clone(),
        Arc::new(FeedFetcher::new(&FetchConfig::default()).unwrap()),
        IngestGate::new(pool.clone(), ticker_tx),
        views,
        None,
        Shutdown::new(),
    );

    let report = updater.run_update_cycle().await.unwrap();
    assert_eq!(report.feeds_ok, 1);
    assert_eq!(report.feeds_failed, 1);
    assert_eq!(report.inserted, 4);

    let mut forwarded = 0;
    while ticker_rx.try_recv().is_ok() {
        forwarded += 1;
    }
    assert_eq!(forwarded, 4);
}
