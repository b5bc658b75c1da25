//! Breaking-news scoring scheduler.
//!
//! While armed, the scheduler wakes on a fixed tick, takes the newest
//! unscored items and asks the scoring model which of them deserve a push
//! alert. It stops itself when the backlog is too thin or too old, and on
//! any hard scoring error, so a broken credential cannot keep spending.
//! Ingestion re-arms it.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use sqlx::SqlitePool;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use common::ScoringConfig;

use crate::llm::{extract_json_from_text, LlmProvider, LlmRequest};
use crate::model::{Item, NOT_APPLICABLE_REASON, NOT_APPLICABLE_SCORE};
use crate::shutdown::Shutdown;
use crate::storage;

pub const DEFAULT_PROMPT: &str = r#"
You are the night editor of a news desk. The user message lists headlines, one per line, each followed by its ID. Pick only the few that justify interrupting the reader with a push notification. Be strict: most batches deserve none.

Worth an alert:
- Major breaking developments, the kind a broadcaster would cut into regular programming for.
- Markets and the economy: sharp market moves, central bank rate decisions (ECB, Fed), major fiscal or economic policy shifts, surprising economic data.
- Geopolitics: US-China relations, EU decisions, NATO, armed conflicts.
- Semiconductors and adjacent industries: TSMC, Intel, Nvidia, Qualcomm, ASML, Applied Materials and their peers.

Not worth an alert:
- Vague teasers, opinion and analysis pieces.
- Domestic US political horse-race coverage and culture-war stories; the reader lives in Europe.

Answer with a JSON object that has a "news" array. Each element is an object with "ID" and "headline" copied from the input, a "confidence" between 0 and 100, and a "reason" of a few words.
"#;

#[derive(Debug, thiserror::Error)]
pub enum ScoringError {
    #[error("scoring request failed: {0:#}")]
    Request(anyhow::Error),
    #[error("completion contains no JSON object")]
    NoJson,
    #[error("completion is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("completion has no \"news\" array")]
    MissingNews,
    #[error("judgment #{index} rejected: {reason}")]
    BadJudgment { index: usize, reason: String },
    #[error("failed to store scoring results: {0:#}")]
    Store(anyhow::Error),
}

/// Item identifier as returned by the model: a JSON number or a numeric string.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum NewsId {
    Number(serde_json::Number),
    Text(String),
}

impl NewsId {
    /// The item id this refers to. `42`, `42.0` and `"42"` are all 42.
    pub fn normalize(&self) -> Option<i64> {
        match self {
            NewsId::Number(n) => n.as_i64().or_else(|| {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                    .map(|f| f as i64)
            }),
            NewsId::Text(s) => s.trim().parse().ok(),
        }
    }
}

/// One element of the model's `news` array.
#[derive(Debug, Clone, Deserialize)]
pub struct Judgment {
    #[serde(rename = "ID")]
    pub id: NewsId,
    #[serde(default)]
    pub headline: String,
    pub confidence: f64,
    pub reason: String,
}

impl Judgment {
    /// Stored score. 0 is the "unscored" marker, so the floor is 1.
    pub fn score(&self) -> i64 {
        self.confidence.round().clamp(1.0, 100.0) as i64
    }
}

/// Parse a completion into judgments keyed by item id.
///
/// Whole-completion problems are errors. A malformed element is logged and
/// skipped; its item then counts as not mentioned.
pub fn parse_judgments(completion: &str) -> Result<HashMap<i64, Judgment>, ScoringError> {
    let json = extract_json_from_text(completion).ok_or(ScoringError::NoJson)?;
    let root: Value = serde_json::from_str(&json)?;
    let news = root
        .get("news")
        .and_then(Value::as_array)
        .ok_or(ScoringError::MissingNews)?;

    let mut judgments = HashMap::with_capacity(news.len());
    for (index, element) in news.iter().enumerate() {
        match parse_element(index, element) {
            Ok((id, judgment)) => {
                judgments.entry(id).or_insert(judgment);
            }
            Err(e) => warn!("breaking: {}", e),
        }
    }
    Ok(judgments)
}

fn parse_element(index: usize, element: &Value) -> Result<(i64, Judgment), ScoringError> {
    let judgment = Judgment::deserialize(element).map_err(|e| ScoringError::BadJudgment {
        index,
        reason: e.to_string(),
    })?;
    let id = judgment.id.normalize().ok_or_else(|| ScoringError::BadJudgment {
        index,
        reason: format!("unusable ID {:?}", judgment.id),
    })?;
    Ok((id, judgment))
}

/// Prompt from `path`, or the built-in one.
pub fn load_prompt(path: Option<&Path>) -> Result<String> {
    match path {
        Some(path) => {
            let prompt = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read scoring prompt {}", path.display()))?;
            info!("breaking: using scoring prompt from {}", path.display());
            Ok(prompt)
        }
        None => Ok(DEFAULT_PROMPT.to_string()),
    }
}

/// Scheduler knobs, resolved from configuration.
#[derive(Debug, Clone)]
pub struct ScoringSettings {
    pub prompt: String,
    pub tick: Duration,
    pub batch_size: usize,
    pub min_backlog: usize,
    pub staleness: chrono::Duration,
    pub context_min_score: i64,
    pub context_limit: usize,
    pub max_tokens: usize,
    pub timeout_seconds: u64,
}

impl ScoringSettings {
    pub fn from_config(config: &ScoringConfig) -> Result<Self> {
        let prompt = load_prompt(config.prompt_file.as_deref().map(Path::new))?;
        Ok(Self {
            prompt,
            tick: Duration::from_secs(config.tick_seconds.max(1)),
            batch_size: config.batch_size.max(1),
            min_backlog: config.min_backlog,
            staleness: chrono::Duration::hours(config.staleness_hours),
            context_min_score: config.context_min_score,
            context_limit: config.context_limit,
            max_tokens: config.max_tokens,
            timeout_seconds: config.timeout_seconds,
        })
    }
}

impl Default for ScoringSettings {
    fn default() -> Self {
        let config = ScoringConfig::default();
        Self {
            prompt: DEFAULT_PROMPT.to_string(),
            tick: Duration::from_secs(config.tick_seconds),
            batch_size: config.batch_size,
            min_backlog: config.min_backlog,
            staleness: chrono::Duration::hours(config.staleness_hours),
            context_min_score: config.context_min_score,
            context_limit: config.context_limit,
            max_tokens: config.max_tokens,
            timeout_seconds: config.timeout_seconds,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Armed,
    Scoring,
}

/// Why an armed scheduler went back to idle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    BacklogTooSmall { found: usize },
    BacklogStale,
    ScoringFailed(String),
    StoreFailed(String),
}

/// Result of one successful scoring pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassOutcome {
    pub batch: usize,
    pub matched: usize,
    pub total_tokens: usize,
}

struct Inner {
    pool: SqlitePool,
    provider: Arc<dyn LlmProvider>,
    settings: ScoringSettings,
    state: watch::Sender<SchedulerState>,
}

#[derive(Clone)]
pub struct BreakingScheduler {
    inner: Arc<Inner>,
}

impl BreakingScheduler {
    pub fn new(pool: SqlitePool, provider: Arc<dyn LlmProvider>, settings: ScoringSettings) -> Self {
        let (state, _) = watch::channel(SchedulerState::Idle);
        Self {
            inner: Arc::new(Inner {
                pool,
                provider,
                settings,
                state,
            }),
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.inner.state.borrow()
    }

    /// Idle -> Armed. Returns `None` if the scheduler is already running.
    pub fn arm(&self, shutdown: Shutdown) -> Option<JoinHandle<StopReason>> {
        let armed = self.inner.state.send_if_modified(|state| {
            if *state == SchedulerState::Idle {
                *state = SchedulerState::Armed;
                true
            } else {
                false
            }
        });
        if !armed {
            debug!("breaking: already armed");
            return None;
        }

        info!(tick = ?self.inner.settings.tick, "breaking: scheduler armed");
        let this = self.clone();
        Some(tokio::spawn(async move {
            let reason = this.run(&shutdown).await;
            this.inner.state.send_replace(SchedulerState::Idle);
            match &reason {
                StopReason::ScoringFailed(e) | StopReason::StoreFailed(e) => {
                    error!("breaking: scheduler stopped: {}", e)
                }
                other => info!("breaking: scheduler stopped: {:?}", other),
            }
            reason
        }))
    }

    async fn run(&self, shutdown: &Shutdown) -> StopReason {
        let every = self.inner.settings.tick;
        let mut tick = tokio::time::interval_at(Instant::now() + every, every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.wait() => return StopReason::Cancelled,
                _ = tick.tick() => {}
            }

            let pass = tokio::select! {
                _ = shutdown.wait() => return StopReason::Cancelled,
                pass = self.run_pass() => pass,
            };
            match pass {
                Ok(outcome) => info!(
                    batch = outcome.batch,
                    matched = outcome.matched,
                    tokens = outcome.total_tokens,
                    "breaking: pass complete"
                ),
                Err(reason) => return reason,
            }
        }
    }

    /// One tick's work: check the backlog, then score it.
    pub async fn run_pass(&self) -> Result<PassOutcome, StopReason> {
        let batch = self.ready_batch().await?;
        self.inner.state.send_if_modified(|state| {
            let armed = *state == SchedulerState::Armed;
            if armed {
                *state = SchedulerState::Scoring;
            }
            armed
        });
        let result = self.score_batch(&batch).await;
        self.inner.state.send_if_modified(|state| {
            let scoring = *state == SchedulerState::Scoring;
            if scoring {
                *state = SchedulerState::Armed;
            }
            scoring
        });

        result.map_err(|e| match e {
            ScoringError::Store(_) => StopReason::StoreFailed(e.to_string()),
            other => StopReason::ScoringFailed(other.to_string()),
        })
    }

    /// Newest unscored items, if the backlog is big and fresh enough to score.
    async fn ready_batch(&self) -> Result<Vec<Item>, StopReason> {
        let settings = &self.inner.settings;
        let batch = storage::query_unscored_items(&self.inner.pool, settings.batch_size)
            .await
            .map_err(|e| StopReason::StoreFailed(format!("{:#}", e)))?;

        if batch.len() < settings.min_backlog {
            info!(found = batch.len(), needed = settings.min_backlog, "breaking: backlog too small");
            return Err(StopReason::BacklogTooSmall { found: batch.len() });
        }
        let horizon = Utc::now() - settings.staleness;
        match batch.last() {
            Some(oldest) if oldest.published_at >= horizon => Ok(batch),
            Some(oldest) => {
                info!(
                    oldest = %oldest.published_at.format("%b %-d - %H:%M"),
                    "breaking: no recent headlines to score"
                );
                Err(StopReason::BacklogStale)
            }
            None => Err(StopReason::BacklogTooSmall { found: 0 }),
        }
    }

    fn system_message(&self, recent: &[String]) -> String {
        let mut context = format!("\nContext:\nToday is {}.", Utc::now().format("%b %-d, %Y"));
        if !recent.is_empty() {
            context.push_str(
                "\nThese headlines already went out in the last hours. \
                 Do not repeat them unless there is a significant new development:\n",
            );
            for headline in recent {
                context.push_str(&format!("- {}\n", headline));
            }
        }
        format!("{}{}", self.inner.settings.prompt, context)
    }

    /// Score `batch` with a single model call and write every item back:
    /// mentioned items get the model's score, the rest the not-applicable marker.
    pub async fn score_batch(&self, batch: &[Item]) -> Result<PassOutcome, ScoringError> {
        let inner = &self.inner;
        let settings = &inner.settings;

        let recent = storage::recent_breaking_headlines(
            &inner.pool,
            settings.context_min_score,
            settings.context_limit,
        )
        .await
        .unwrap_or_else(|e| {
            warn!("breaking: could not load recent headlines: {:#}", e);
            Vec::new()
        });

        let compiled: String = batch
            .iter()
            .map(|item| format!("- {} (ID: {})\n", item.title, item.id))
            .collect();

        let run_id = storage::start_scoring_run(&inner.pool, inner.provider.model(), batch.len())
            .await
            .map_err(ScoringError::Store)?;

        let request = LlmRequest {
            system: Some(self.system_message(&recent)),
            prompt: compiled,
            max_tokens: Some(settings.max_tokens),
            temperature: None,
            timeout_seconds: Some(settings.timeout_seconds),
            json_response: true,
        };

        let scored = match inner.provider.generate(request).await {
            Ok(response) => {
                if response.truncated() {
                    warn!(
                        tokens = response.usage.total_tokens,
                        "breaking: completion hit the token limit"
                    );
                }
                parse_judgments(&response.content).map(|j| (j, response.usage))
            }
            Err(e) => Err(ScoringError::Request(e)),
        };
        let (judgments, usage) = match scored {
            Ok(scored) => scored,
            Err(e) => {
                if let Err(store) = storage::fail_scoring_run(&inner.pool, run_id, &e.to_string()).await {
                    warn!("breaking: {:#}", store);
                }
                return Err(e);
            }
        };

        let matched = self
            .write_back(batch, &judgments)
            .await
            .map_err(ScoringError::Store)?;
        storage::complete_scoring_run(&inner.pool, run_id, matched, &usage)
            .await
            .map_err(ScoringError::Store)?;

        Ok(PassOutcome {
            batch: batch.len(),
            matched,
            total_tokens: usage.total_tokens,
        })
    }

    async fn write_back(&self, batch: &[Item], judgments: &HashMap<i64, Judgment>) -> Result<usize> {
        let mut matched = 0;
        for item in batch {
            match judgments.get(&item.id) {
                Some(judgment) => {
                    let score = judgment.score();
                    info!(id = item.id, score, reason = %judgment.reason, title = %item.title, "breaking: headline scored");
                    storage::update_item_score(&self.inner.pool, item.id, score, &judgment.reason).await?;
                    matched += 1;
                }
                None => {
                    storage::update_item_score(
                        &self.inner.pool,
                        item.id,
                        NOT_APPLICABLE_SCORE,
                        NOT_APPLICABLE_REASON,
                    )
                    .await?;
                }
            }
        }
        Ok(matched)
    }
}
