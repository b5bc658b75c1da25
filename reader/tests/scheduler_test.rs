use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::Utc;
use reader::breaking::{BreakingScheduler, SchedulerState, ScoringSettings, StopReason};
use reader::llm::{LlmProvider, LlmRequest, LlmResponse, UsageMetadata};
use reader::model::{NewItem, NOT_APPLICABLE_REASON, NOT_APPLICABLE_SCORE, UNSCORED};
use reader::shutdown::Shutdown;
use reader::storage;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

/// Scorer double: replies with a fixed completion (or error) and keeps every request.
struct FakeScorer {
    reply: Result<String, String>,
    requests: Mutex<Vec<LlmRequest>>,
}

impl FakeScorer {
    fn replying(content: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Ok(content.to_string()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Err(message.to_string()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl LlmProvider for FakeScorer {
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse> {
        self.requests.lock().unwrap().push(request);
        match &self.reply {
            Ok(content) => Ok(LlmResponse {
                content: content.clone(),
                usage: UsageMetadata {
                    prompt_tokens: 700,
                    completion_tokens: 80,
                    total_tokens: 780,
                },
                model: "fake".to_string(),
                finish_reason: Some("stop".to_string()),
            }),
            Err(message) => bail!("LLM API error 401 Unauthorized: {}", message),
        }
    }

    fn model(&self) -> &str {
        "fake"
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

/// Insert `n` items, ids 1..=n, all published `age_minutes` ago or later.
async fn seed_items(pool: &SqlitePool, n: usize, age_minutes: i64) {
    for i in 0..n {
        let item = NewItem {
            feed_abbr: "NYT".to_string(),
            title: format!("Headline number {}", i + 1),
            link: format!("https://news.example/{}", i + 1),
            description: String::new(),
            content: String::new(),
            published_at: Utc::now() - chrono::Duration::minutes(age_minutes + i as i64),
        };
        storage::insert_item_if_fingerprint_absent(pool, &item)
            .await
            .unwrap()
            .expect("fresh link");
    }
}

fn fast_settings() -> ScoringSettings {
    ScoringSettings {
        tick: Duration::from_millis(50),
        ..ScoringSettings::default()
    }
}

fn scheduler(pool: &SqlitePool, scorer: Arc<FakeScorer>) -> BreakingScheduler {
    BreakingScheduler::new(pool.clone(), scorer, fast_settings())
}

async fn score_of(pool: &SqlitePool, id: i64) -> (i64, String) {
    sqlx::query_as("SELECT breaking_score, breaking_reason FROM items WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn unmentioned_items_get_the_not_applicable_marker() {
    let pool = memory_pool().await;
    seed_items(&pool, 20, 1).await;
    let scorer = FakeScorer::replying(
        r#"{"news": [
            {"ID": 2, "headline": "Headline number 2", "confidence": 92, "reason": "rate decision"},
            {"ID": "5", "headline": "Headline number 5", "confidence": 88, "reason": "chip export ban"},
            {"ID": 9.0, "headline": "Headline number 9", "confidence": 75, "reason": "merger"}
        ]}"#,
    );

    let outcome = scheduler(&pool, scorer.clone()).run_pass().await.unwrap();
    assert_eq!(outcome.batch, 20);
    assert_eq!(outcome.matched, 3);
    assert_eq!(outcome.total_tokens, 780);

    assert_eq!(score_of(&pool, 2).await, (92, "rate decision".to_string()));
    assert_eq!(score_of(&pool, 5).await, (88, "chip export ban".to_string()));
    assert_eq!(score_of(&pool, 9).await, (75, "merger".to_string()));
    for id in (1..=20).filter(|id| ![2, 5, 9].contains(id)) {
        assert_eq!(
            score_of(&pool, id).await,
            (NOT_APPLICABLE_SCORE, NOT_APPLICABLE_REASON.to_string()),
            "item {}",
            id
        );
    }
    assert!(storage::query_unscored_items(&pool, 20).await.unwrap().is_empty());

    // one call, with the compiled list as the user message
    assert_eq!(scorer.calls(), 1);
    let requests = scorer.requests.lock().unwrap();
    assert!(requests[0].json_response);
    assert!(requests[0].prompt.contains("- Headline number 2 (ID: 2)\n"));
    assert!(requests[0].system.as_deref().unwrap().contains("Today is"));

    assert_eq!(storage::scoring_tokens_spent(&pool).await.unwrap(), 780);
}

#[tokio::test]
async fn recent_alerts_are_sent_as_context() {
    let pool = memory_pool().await;
    seed_items(&pool, 21, 1).await;
    storage::update_item_score(&pool, 21, 95, "already sent").await.unwrap();
    let scorer = FakeScorer::replying(r#"{"news": []}"#);

    scheduler(&pool, scorer.clone()).run_pass().await.unwrap();

    let requests = scorer.requests.lock().unwrap();
    let system = requests[0].system.as_deref().unwrap();
    assert!(system.contains("- Headline number 21\n"));
    assert!(!requests[0].prompt.contains("(ID: 21)"));
}

#[tokio::test]
async fn thin_backlog_stops_without_calling_the_scorer() {
    let pool = memory_pool().await;
    seed_items(&pool, 10, 1).await;
    let scorer = FakeScorer::replying(r#"{"news": []}"#);

    let stop = scheduler(&pool, scorer.clone()).run_pass().await.unwrap_err();
    assert_eq!(stop, StopReason::BacklogTooSmall { found: 10 });
    assert_eq!(scorer.calls(), 0);
    assert_eq!(storage::query_unscored_items(&pool, 20).await.unwrap().len(), 10);
}

#[tokio::test]
async fn stale_backlog_stops_without_calling_the_scorer() {
    let pool = memory_pool().await;
    seed_items(&pool, 20, 6 * 60).await;
    let scorer = FakeScorer::replying(r#"{"news": []}"#);

    let stop = scheduler(&pool, scorer.clone()).run_pass().await.unwrap_err();
    assert_eq!(stop, StopReason::BacklogStale);
    assert_eq!(scorer.calls(), 0);
}

#[tokio::test]
async fn malformed_completion_fails_the_pass_and_leaves_items_unscored() {
    let pool = memory_pool().await;
    seed_items(&pool, 20, 1).await;
    let scorer = FakeScorer::replying(r#"{"headlines": "none"}"#);

    let stop = scheduler(&pool, scorer).run_pass().await.unwrap_err();
    assert!(matches!(stop, StopReason::ScoringFailed(_)));
    assert_eq!(storage::query_unscored_items(&pool, 20).await.unwrap().len(), 20);

    let status: String = sqlx::query_scalar("SELECT status FROM scoring_runs")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(status, "failed");
}

#[tokio::test]
async fn hard_error_terminates_the_armed_scheduler() {
    let pool = memory_pool().await;
    seed_items(&pool, 20, 1).await;
    let scorer = FakeScorer::failing("invalid api key");
    let scheduler = scheduler(&pool, scorer.clone());

    let handle = scheduler.arm(Shutdown::new()).expect("armed");
    assert!(scheduler.arm(Shutdown::new()).is_none(), "second arm is a no-op");

    let stop = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("scheduler stops by itself")
        .unwrap();
    assert!(matches!(stop, StopReason::ScoringFailed(ref e) if e.contains("401")));
    assert_eq!(scorer.calls(), 1);
    assert_eq!(scheduler.state(), SchedulerState::Idle);

    let unscored = storage::query_unscored_items(&pool, 20).await.unwrap();
    assert!(unscored.iter().all(|i| i.breaking_score == UNSCORED));
}

#[tokio::test]
async fn scheduler_keeps_ticking_until_the_backlog_is_gone() {
    let pool = memory_pool().await;
    seed_items(&pool, 20, 1).await;
    let scorer = FakeScorer::replying(r#"{"news": []}"#);
    let scheduler = scheduler(&pool, scorer.clone());

    let handle = scheduler.arm(Shutdown::new()).expect("armed");
    let stop = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("scheduler stops by itself")
        .unwrap();

    // first pass scores everything, the second finds nothing left
    assert_eq!(stop, StopReason::BacklogTooSmall { found: 0 });
    assert_eq!(scorer.calls(), 1);

    // and it can be armed again afterwards
    assert!(scheduler.arm(Shutdown::new()).is_some());
}

#[tokio::test]
async fn shutdown_cancels_an_armed_scheduler() {
    let pool = memory_pool().await;
    let scorer = FakeScorer::replying(r#"{"news": []}"#);
    let scheduler = BreakingScheduler::new(
        pool.clone(),
        scorer.clone(),
        ScoringSettings {
            tick: Duration::from_secs(3600),
            ..ScoringSettings::default()
        },
    );

    let shutdown = Shutdown::new();
    let handle = scheduler.arm(shutdown.clone()).expect("armed");
    assert_eq!(scheduler.state(), SchedulerState::Armed);

    shutdown.trigger();
    shutdown.trigger();
    let stop = tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("cancelled promptly")
        .unwrap();
    assert_eq!(stop, StopReason::Cancelled);
    assert_eq!(scorer.calls(), 0);
}
