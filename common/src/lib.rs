/*!
common/src/lib.rs

Shared configuration types and DB helper functions for Reader.

This file provides:
- Config data structures (deserialized from TOML)
- An async loader that merges a defaults file with an override file
- A helper to initialize an SQLite connection pool
*/

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;

/// Database configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the sqlite database file (e.g. "db/reader.db")
    pub path: String,
}

/// Periodic feed update cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub update_interval_minutes: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            update_interval_minutes: 15,
        }
    }
}

/// Feed retrieval settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 10,
            max_retries: 3,
            user_agent: "Reader/0.1.0".to_string(),
        }
    }
}

/// Query cache horizons. All values are seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Entries expiring sooner than this are rejected by `put`.
    pub min_horizon_seconds: u64,
    pub sweep_interval_seconds: u64,
    pub items_ttl_seconds: u64,
    pub feeds_ttl_seconds: u64,
    pub keywords_ttl_seconds: u64,
    pub saved_ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            min_horizon_seconds: 10,
            sweep_interval_seconds: 300,
            items_ttl_seconds: 15 * 60,
            feeds_ttl_seconds: 6 * 60 * 60,
            keywords_ttl_seconds: 60 * 60,
            saved_ttl_seconds: 60 * 60,
        }
    }
}

/// Breaking-news scoring against an OpenAI-compatible chat completion endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub enabled: bool,
    pub api_url: String,
    /// Name of the environment variable holding the API key
    pub api_key_env: String,
    pub model: String,
    pub max_tokens: usize,
    pub timeout_seconds: u64,
    /// Optional file replacing the built-in editor prompt
    pub prompt_file: Option<String>,
    pub tick_seconds: u64,
    pub batch_size: usize,
    /// Minimum number of unscored items before a pass is worth paying for
    pub min_backlog: usize,
    /// Oldest item of the backlog must be newer than this
    pub staleness_hours: i64,
    /// Items scored at or above this are sent back as duplicate-avoidance context
    pub context_min_score: i64,
    pub context_limit: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_url: "https://api.openai.com/v1/chat/completions".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            model: "gpt-4o-mini".to_string(),
            max_tokens: 1200,
            timeout_seconds: 60,
            prompt_file: None,
            tick_seconds: 60,
            batch_size: 20,
            min_backlog: 15,
            staleness_hours: 5,
            context_min_score: 85,
            context_limit: 10,
        }
    }
}

/// Live ticker fan-out
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TickerConfig {
    pub inbound_buffer: usize,
    pub subscriber_buffer: usize,
    /// Feed synthetic headlines into the ticker (useful for UI work)
    pub simulate: bool,
    pub simulate_interval_seconds: u64,
}

impl Default for TickerConfig {
    fn default() -> Self {
        Self {
            inbound_buffer: 256,
            subscriber_buffer: 32,
            simulate: false,
            simulate_interval_seconds: 15,
        }
    }
}

/// HTTP server binding
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub results_per_page: i64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8000,
            results_per_page: 50,
        }
    }
}

/// Feed seeded into an empty database on first start
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    pub name: String,
    pub abbr: String,
    pub url: String,
}

/// Top-level application configuration (deserialized from config.toml)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub ticker: TickerConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub feeds: Vec<FeedConfig>,
}

impl Config {
    /// Every section at its default, backed by the database at `path`.
    pub fn with_database_path(path: impl Into<String>) -> Self {
        Self {
            database: DatabaseConfig { path: path.into() },
            scheduler: SchedulerConfig::default(),
            fetch: FetchConfig::default(),
            cache: CacheConfig::default(),
            scoring: ScoringConfig::default(),
            ticker: TickerConfig::default(),
            server: ServerConfig::default(),
            feeds: Vec::new(),
        }
    }

    /// Load configuration with an optional default file and an optional override file.
    /// If both are present, they are merged (override takes precedence).
    pub async fn load_with_defaults(
        default_path: Option<&Path>,
        override_path: Option<&Path>,
    ) -> Result<Self> {
        let mut config_value = toml::Value::Table(toml::map::Map::new());

        for path in [default_path, override_path].into_iter().flatten() {
            if !path.exists() {
                continue;
            }
            let data = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let val: toml::Value = toml::from_str(&data)
                .with_context(|| format!("Failed to parse configuration: {}", path.display()))?;
            merge_toml(&mut config_value, val);
        }

        let cfg: Config = config_value
            .try_into()
            .context("Failed to parse merged configuration")?;
        Ok(cfg)
    }
}

fn merge_toml(a: &mut toml::Value, b: toml::Value) {
    match (a, b) {
        (toml::Value::Table(a_map), toml::Value::Table(b_map)) => {
            for (k, v) in b_map {
                if let Some(a_val) = a_map.get_mut(&k) {
                    merge_toml(a_val, v);
                } else {
                    a_map.insert(k, v);
                }
            }
        }
        (a_val, b_val) => *a_val = b_val,
    }
}

/// Initialize an SQLite connection pool.
///
/// Creates the parent directory if necessary and returns a WAL-mode `SqlitePool`.
/// Schema creation is left to the caller.
///
/// Example:
///   let pool = init_db_pool("db/reader.db").await?;
pub async fn init_db_pool(path: &str) -> Result<SqlitePool> {
    if let Some(parent) = Path::new(path).parent() {
        tokio::fs::create_dir_all(parent).await.with_context(|| {
            format!("Failed to create DB parent directory: {}", parent.display())
        })?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    // Modest pool size; SQLite serializes writers anyway.
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to connect to sqlite database at path: {}", path))?;

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_sections_fall_back_to_defaults() {
        let toml = r#"
            [database]
            path = "db/test.db"

            [scoring]
            enabled = true
            staleness_hours = 2

            [[feeds]]
            name = "Tagesschau"
            abbr = "ARD"
            url = "https://www.tagesschau.de/xml/atom/"
        "#;

        let cfg: Config = toml::from_str(toml).expect("parse config");
        assert!(cfg.scoring.enabled);
        assert_eq!(cfg.scoring.staleness_hours, 2);
        // untouched keys in a present section keep their defaults
        assert_eq!(cfg.scoring.batch_size, 20);
        assert_eq!(cfg.scoring.min_backlog, 15);
        // absent sections are defaulted wholesale
        assert_eq!(cfg.scheduler.update_interval_minutes, 15);
        assert_eq!(cfg.cache.min_horizon_seconds, 10);
        assert_eq!(cfg.ticker.subscriber_buffer, 32);
        assert_eq!(cfg.feeds.len(), 1);
        assert_eq!(cfg.feeds[0].abbr, "ARD");
    }

    #[tokio::test]
    async fn override_file_wins_over_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let defaults = dir.path().join("config.default.toml");
        let overrides = dir.path().join("config.toml");
        std::fs::write(
            &defaults,
            "[database]\npath = \"db/reader.db\"\n[scheduler]\nupdate_interval_minutes = 30\n",
        )
        .expect("write defaults");
        std::fs::write(&overrides, "[scheduler]\nupdate_interval_minutes = 5\n")
            .expect("write override");

        let cfg = Config::load_with_defaults(Some(&defaults), Some(&overrides))
            .await
            .expect("load config");
        assert_eq!(cfg.database.path, "db/reader.db");
        assert_eq!(cfg.scheduler.update_interval_minutes, 5);
    }

    #[tokio::test]
    async fn db_pool_creates_missing_parent_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("nested").join("reader.db");
        let db_path_str = db_path.to_string_lossy().to_string();

        let pool = init_db_pool(&db_path_str).await.expect("init pool");
        let conn = pool.acquire().await.expect("acquire conn");
        drop(conn);
        assert!(db_path.exists());
    }
}
