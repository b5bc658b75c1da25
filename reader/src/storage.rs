use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use common::FeedConfig;

use crate::llm::UsageMetadata;
use crate::model::{
    normalize_abbr, Feed, Item, ItemRow, Keyword, KeywordMode, NewItem, UNSCORED,
};

const ITEM_COLUMNS: &str = "id, feed_abbr, title, link, description, fingerprint, \
     published_at, breaking_score, breaking_reason";

/// Create tables and indexes if they do not exist yet.
pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    info!("storage: ensuring DB schema");
    let stmts = [
        r#"
        CREATE TABLE IF NOT EXISTS feeds (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            abbr TEXT NOT NULL UNIQUE,
            url TEXT NOT NULL,
            created_at TIMESTAMP DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            feed_abbr TEXT NOT NULL,
            title TEXT NOT NULL,
            link TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            content TEXT NOT NULL DEFAULT '',
            fingerprint TEXT NOT NULL UNIQUE,
            published_at INTEGER NOT NULL,
            breaking_score INTEGER NOT NULL DEFAULT 0,
            breaking_reason TEXT NOT NULL DEFAULT '',
            created_at TIMESTAMP DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );
        "#,
        "CREATE INDEX IF NOT EXISTS idx_items_published_at ON items (published_at);",
        "CREATE INDEX IF NOT EXISTS idx_items_feed_abbr ON items (feed_abbr);",
        r#"
        CREATE TABLE IF NOT EXISTS keywords (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL,
            mode TEXT NOT NULL,
            text TEXT NOT NULL,
            annotation TEXT,
            created_at TIMESTAMP DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS saved_items (
            username TEXT NOT NULL,
            item_id INTEGER NOT NULL REFERENCES items (id) ON DELETE CASCADE,
            saved_at TIMESTAMP DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
            PRIMARY KEY (username, item_id)
        );
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS scoring_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            started_at TIMESTAMP NOT NULL,
            completed_at TIMESTAMP,
            status TEXT NOT NULL,
            model TEXT NOT NULL,
            batch_size INTEGER NOT NULL,
            matched INTEGER,
            prompt_tokens INTEGER,
            completion_tokens INTEGER,
            error_message TEXT
        );
        "#,
    ];

    for stmt in stmts {
        sqlx::query(stmt)
            .execute(pool)
            .await
            .context("failed to apply schema statement")?;
    }
    Ok(())
}

// ---- feeds ----

pub async fn find_feeds(pool: &SqlitePool) -> Result<Vec<Feed>> {
    sqlx::query_as::<_, Feed>("SELECT id, name, abbr, url FROM feeds ORDER BY abbr")
        .fetch_all(pool)
        .await
        .context("failed to load feeds")
}

/// Insert a feed. The abbreviation is reduced to at most four letters and the
/// URL must parse.
pub async fn create_feed(pool: &SqlitePool, name: &str, abbr: &str, url: &str) -> Result<Feed> {
    let abbr = normalize_abbr(abbr)
        .with_context(|| format!("feed abbreviation '{}' has no letters", abbr))?;
    url::Url::parse(url).with_context(|| format!("invalid feed URL: {}", url))?;

    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO feeds (name, abbr, url) VALUES (?, ?, ?) RETURNING id",
    )
    .bind(name)
    .bind(&abbr)
    .bind(url)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert feed {}", abbr))?;

    Ok(Feed {
        id,
        name: name.to_string(),
        abbr,
        url: url.to_string(),
    })
}

pub async fn delete_feed(pool: &SqlitePool, id: i64) -> Result<bool> {
    let result = sqlx::query("DELETE FROM feeds WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to delete feed")?;
    Ok(result.rows_affected() > 0)
}

/// Seed the configured feeds, but only into an empty feeds table.
pub async fn seed_feeds_if_empty(pool: &SqlitePool, feeds: &[FeedConfig]) -> Result<usize> {
    let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM feeds")
        .fetch_one(pool)
        .await
        .context("failed to count feeds")?;
    if existing > 0 {
        return Ok(0);
    }

    let mut seeded = 0;
    for f in feeds {
        create_feed(pool, &f.name, &f.abbr, &f.url).await?;
        seeded += 1;
    }
    if seeded > 0 {
        info!("storage: seeded {} feeds", seeded);
    }
    Ok(seeded)
}

// ---- items ----

/// Insert the item unless one with the same fingerprint already exists.
/// Returns the new row id, or `None` on a fingerprint conflict.
///
/// Uniqueness is enforced by the `fingerprint` UNIQUE constraint, so
/// concurrent callers racing on the same story cannot both insert.
pub async fn insert_item_if_fingerprint_absent(
    pool: &SqlitePool,
    item: &NewItem,
) -> Result<Option<i64>> {
    let id = sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO items (feed_abbr, title, link, description, content, fingerprint, published_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(fingerprint) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(&item.feed_abbr)
    .bind(&item.title)
    .bind(&item.link)
    .bind(&item.description)
    .bind(&item.content)
    .bind(item.fingerprint())
    .bind(item.published_at.timestamp())
    .fetch_optional(pool)
    .await
    .context("failed to insert item")?;

    if id.is_none() {
        debug!(link = %item.link, "storage: duplicate fingerprint, skipped");
    }
    Ok(id)
}

/// Items for a view, newest first.
///
/// `filter` is a feed abbreviation ("" for all feeds). `since` is an
/// exclusive unix-timestamp upper bound, so a client can page on by the
/// oldest timestamp it has seen; 0 means "now".
pub async fn query_items(
    pool: &SqlitePool,
    filter: &str,
    limit: i64,
    offset: i64,
    since: i64,
) -> Result<Vec<Item>> {
    let upper = if since == 0 {
        Utc::now().timestamp() + 1
    } else {
        since
    };
    let filter = if filter.is_empty() { "%" } else { filter };

    let sql = format!(
        "SELECT {} FROM items WHERE feed_abbr LIKE ? AND published_at < ? \
         ORDER BY published_at DESC, id DESC LIMIT ? OFFSET ?",
        ITEM_COLUMNS
    );
    let rows = sqlx::query_as::<_, ItemRow>(&sql)
        .bind(filter)
        .bind(upper)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
        .context("failed to query items")?;

    Ok(rows.into_iter().map(Item::from).collect())
}

/// Unscored items, newest first.
pub async fn query_unscored_items(pool: &SqlitePool, limit: usize) -> Result<Vec<Item>> {
    let sql = format!(
        "SELECT {} FROM items WHERE breaking_score = ? OR breaking_score IS NULL \
         ORDER BY published_at DESC, id DESC LIMIT ?",
        ITEM_COLUMNS
    );
    let rows = sqlx::query_as::<_, ItemRow>(&sql)
        .bind(UNSCORED)
        .bind(limit as i64)
        .fetch_all(pool)
        .await
        .context("failed to query unscored items")?;

    Ok(rows.into_iter().map(Item::from).collect())
}

pub async fn update_item_score(pool: &SqlitePool, id: i64, score: i64, reason: &str) -> Result<()> {
    sqlx::query("UPDATE items SET breaking_score = ?, breaking_reason = ? WHERE id = ?")
        .bind(score)
        .bind(reason)
        .bind(id)
        .execute(pool)
        .await
        .with_context(|| format!("failed to update score for item {}", id))?;
    Ok(())
}

/// Titles of the most recent items scored at or above `min_score`.
pub async fn recent_breaking_headlines(
    pool: &SqlitePool,
    min_score: i64,
    limit: usize,
) -> Result<Vec<String>> {
    sqlx::query_scalar::<_, String>(
        "SELECT title FROM items WHERE breaking_score >= ? \
         ORDER BY published_at DESC, id DESC LIMIT ?",
    )
    .bind(min_score)
    .bind(limit as i64)
    .fetch_all(pool)
    .await
    .context("failed to load recent breaking headlines")
}

pub async fn count_items(pool: &SqlitePool) -> Result<i64> {
    sqlx::query_scalar("SELECT COUNT(*) FROM items")
        .fetch_one(pool)
        .await
        .context("failed to count items")
}

// ---- keywords ----

pub async fn keywords_for_user(pool: &SqlitePool, username: &str) -> Result<Vec<Keyword>> {
    let rows = sqlx::query(
        "SELECT id, username, mode, text, annotation FROM keywords WHERE username = ? ORDER BY id",
    )
    .bind(username)
    .fetch_all(pool)
    .await
    .context("failed to load keywords")?;

    let mut keywords = Vec::with_capacity(rows.len());
    for row in rows {
        let mode: String = row.get("mode");
        let Some(mode) = KeywordMode::parse(&mode) else {
            debug!(mode = %mode, "storage: skipping keyword with unknown mode");
            continue;
        };
        keywords.push(Keyword {
            id: row.get("id"),
            username: row.get("username"),
            mode,
            text: row.get("text"),
            annotation: row.get("annotation"),
        });
    }
    Ok(keywords)
}

pub async fn add_keyword(
    pool: &SqlitePool,
    username: &str,
    mode: KeywordMode,
    text: &str,
    annotation: Option<&str>,
) -> Result<Keyword> {
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO keywords (username, mode, text, annotation) VALUES (?, ?, ?, ?) RETURNING id",
    )
    .bind(username)
    .bind(mode.as_str())
    .bind(text)
    .bind(annotation)
    .fetch_one(pool)
    .await
    .context("failed to insert keyword")?;

    Ok(Keyword {
        id,
        username: username.to_string(),
        mode,
        text: text.to_string(),
        annotation: annotation.map(str::to_string),
    })
}

pub async fn delete_keyword(pool: &SqlitePool, username: &str, id: i64) -> Result<bool> {
    let result = sqlx::query("DELETE FROM keywords WHERE id = ? AND username = ?")
        .bind(id)
        .bind(username)
        .execute(pool)
        .await
        .context("failed to delete keyword")?;
    Ok(result.rows_affected() > 0)
}

// ---- saved items ----

/// Items `username` has saved, newest first.
pub async fn saved_items_for_user(pool: &SqlitePool, username: &str) -> Result<Vec<Item>> {
    let rows = sqlx::query_as::<_, ItemRow>(
        "SELECT i.id, i.feed_abbr, i.title, i.link, i.description, i.fingerprint, \
         i.published_at, i.breaking_score, i.breaking_reason \
         FROM saved_items s JOIN items i ON i.id = s.item_id \
         WHERE s.username = ? ORDER BY i.published_at DESC, i.id DESC",
    )
    .bind(username)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to load saved items for {}", username))?;

    Ok(rows.into_iter().map(Item::from).collect())
}

/// Save an item for `username`. Saving twice is a no-op.
/// Returns `false` if no item with `item_id` exists.
pub async fn save_item_for_user(pool: &SqlitePool, username: &str, item_id: i64) -> Result<bool> {
    let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM items WHERE id = ?)")
        .bind(item_id)
        .fetch_one(pool)
        .await
        .context("failed to look up item")?;
    if !exists {
        return Ok(false);
    }

    sqlx::query(
        "INSERT INTO saved_items (username, item_id) VALUES (?, ?) \
         ON CONFLICT(username, item_id) DO NOTHING",
    )
    .bind(username)
    .bind(item_id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to save item {} for {}", item_id, username))?;
    Ok(true)
}

pub async fn delete_saved_item(pool: &SqlitePool, username: &str, item_id: i64) -> Result<bool> {
    let result = sqlx::query("DELETE FROM saved_items WHERE username = ? AND item_id = ?")
        .bind(username)
        .bind(item_id)
        .execute(pool)
        .await
        .context("failed to delete saved item")?;
    Ok(result.rows_affected() > 0)
}

// ---- scoring runs ----

pub async fn start_scoring_run(pool: &SqlitePool, model: &str, batch_size: usize) -> Result<i64> {
    sqlx::query_scalar::<_, i64>(
        "INSERT INTO scoring_runs (started_at, status, model, batch_size) \
         VALUES (?, 'running', ?, ?) RETURNING id",
    )
    .bind(Utc::now())
    .bind(model)
    .bind(batch_size as i64)
    .fetch_one(pool)
    .await
    .context("failed to record scoring run")
}

pub async fn complete_scoring_run(
    pool: &SqlitePool,
    run_id: i64,
    matched: usize,
    usage: &UsageMetadata,
) -> Result<()> {
    sqlx::query(
        "UPDATE scoring_runs SET status = 'completed', completed_at = ?, matched = ?, \
         prompt_tokens = ?, completion_tokens = ? WHERE id = ?",
    )
    .bind(Utc::now())
    .bind(matched as i64)
    .bind(usage.prompt_tokens as i64)
    .bind(usage.completion_tokens as i64)
    .bind(run_id)
    .execute(pool)
    .await
    .context("failed to complete scoring run")?;
    Ok(())
}

pub async fn fail_scoring_run(pool: &SqlitePool, run_id: i64, error: &str) -> Result<()> {
    sqlx::query(
        "UPDATE scoring_runs SET status = 'failed', completed_at = ?, error_message = ? WHERE id = ?",
    )
    .bind(Utc::now())
    .bind(error)
    .bind(run_id)
    .execute(pool)
    .await
    .context("failed to mark scoring run as failed")?;
    Ok(())
}

/// Total tokens spent on scoring so far.
pub async fn scoring_tokens_spent(pool: &SqlitePool) -> Result<i64> {
    sqlx::query_scalar(
        "SELECT COALESCE(SUM(COALESCE(prompt_tokens, 0) + COALESCE(completion_tokens, 0)), 0) \
         FROM scoring_runs",
    )
    .fetch_one(pool)
    .await
    .context("failed to sum scoring tokens")
}
