use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::info;

use common::CacheConfig;

use crate::cache::TtlCache;
use crate::model::{Feed, Item, Keyword, KeywordMode};
use crate::storage;

pub const FEEDS_KEY: &str = "/feeds";
pub const ITEMS_PREFIX: &str = "/items/";

/// Values held by the shared query cache.
#[derive(Debug, Clone)]
pub enum CachedView {
    Items(Arc<Vec<Item>>),
    Feeds(Arc<Vec<Feed>>),
    Keywords(Arc<KeywordList>),
}

pub type ViewCache = TtlCache<CachedView>;

/// A user's highlight/suppress keywords.
#[derive(Debug, Clone, Default, Serialize)]
pub struct KeywordList(pub Vec<Keyword>);

impl KeywordList {
    /// First keyword matching a whole word of `headline`, case-insensitively.
    /// Punctuation attached to words is ignored.
    pub fn matches(&self, headline: &str) -> Option<&Keyword> {
        headline
            .split_whitespace()
            .map(|word| {
                word.chars()
                    .filter(|c| c.is_alphanumeric())
                    .collect::<String>()
                    .to_lowercase()
            })
            .filter(|word| !word.is_empty())
            .find_map(|word| self.0.iter().find(|k| k.text.to_lowercase() == word))
    }
}

/// An item as seen by one user.
#[derive(Debug, Clone, Serialize)]
pub struct UserHeadline {
    #[serde(flatten)]
    pub item: Item,
    pub keyword_mode: Option<KeywordMode>,
    pub keyword: Option<String>,
}

/// Query-serving facade: every read goes through the cache.
#[derive(Clone)]
pub struct Views {
    pool: SqlitePool,
    cache: Arc<ViewCache>,
    items_ttl: Duration,
    feeds_ttl: Duration,
    keywords_ttl: Duration,
    saved_ttl: Duration,
}

impl Views {
    pub fn new(pool: SqlitePool, cache: Arc<ViewCache>, config: &CacheConfig) -> Self {
        Self {
            pool,
            cache,
            items_ttl: Duration::from_secs(config.items_ttl_seconds),
            feeds_ttl: Duration::from_secs(config.feeds_ttl_seconds),
            keywords_ttl: Duration::from_secs(config.keywords_ttl_seconds),
            saved_ttl: Duration::from_secs(config.saved_ttl_seconds),
        }
    }

    pub fn cache(&self) -> &Arc<ViewCache> {
        &self.cache
    }

    pub fn items_key(filter: &str, limit: i64, offset: i64, since: i64) -> String {
        format!("{}{}/{}/{}/{}", ITEMS_PREFIX, filter, limit, since, offset)
    }

    pub fn keywords_key(username: &str) -> String {
        format!("/keywords/{}", username)
    }

    pub fn saved_key(username: &str) -> String {
        format!("/saved/{}", username)
    }

    pub async fn items(
        &self,
        filter: &str,
        limit: i64,
        offset: i64,
        since: i64,
    ) -> Result<Arc<Vec<Item>>> {
        let key = Self::items_key(filter, limit, offset, since);
        let view = self
            .cache
            .get_or_load(&key, self.items_ttl, || async {
                let items = storage::query_items(&self.pool, filter, limit, offset, since).await?;
                Ok::<_, anyhow::Error>(CachedView::Items(Arc::new(items)))
            })
            .await?;
        match view {
            CachedView::Items(items) => Ok(items),
            other => bail!("cache key {} holds {:?} instead of items", key, other),
        }
    }

    pub async fn feeds(&self) -> Result<Arc<Vec<Feed>>> {
        let view = self
            .cache
            .get_or_load(FEEDS_KEY, self.feeds_ttl, || async {
                let feeds = storage::find_feeds(&self.pool).await?;
                Ok::<_, anyhow::Error>(CachedView::Feeds(Arc::new(feeds)))
            })
            .await?;
        match view {
            CachedView::Feeds(feeds) => Ok(feeds),
            other => bail!("cache key {} holds {:?} instead of feeds", FEEDS_KEY, other),
        }
    }

    pub async fn keywords(&self, username: &str) -> Result<Arc<KeywordList>> {
        let key = Self::keywords_key(username);
        let view = self
            .cache
            .get_or_load(&key, self.keywords_ttl, || async {
                let list = storage::keywords_for_user(&self.pool, username).await?;
                Ok::<_, anyhow::Error>(CachedView::Keywords(Arc::new(KeywordList(list))))
            })
            .await?;
        match view {
            CachedView::Keywords(list) => Ok(list),
            other => bail!("cache key {} holds {:?} instead of keywords", key, other),
        }
    }

    /// Items annotated with the first keyword of `username` that matches the title.
    pub async fn headlines_for_user(
        &self,
        username: &str,
        filter: &str,
        limit: i64,
        offset: i64,
        since: i64,
    ) -> Result<Vec<UserHeadline>> {
        let items = self.items(filter, limit, offset, since).await?;
        let keywords = self.keywords(username).await?;
        Ok(items
            .iter()
            .map(|item| {
                let hit = keywords.matches(&item.title);
                UserHeadline {
                    item: item.clone(),
                    keyword_mode: hit.map(|k| k.mode),
                    keyword: hit.map(|k| k.text.clone()),
                }
            })
            .collect())
    }

    pub async fn add_keyword(
        &self,
        username: &str,
        mode: KeywordMode,
        text: &str,
        annotation: Option<&str>,
    ) -> Result<Keyword> {
        let keyword = storage::add_keyword(&self.pool, username, mode, text, annotation).await?;
        info!(user = %username, keyword = %keyword.text, "views: keyword added");
        self.cache.invalidate(&Self::keywords_key(username));
        Ok(keyword)
    }

    pub async fn delete_keyword(&self, username: &str, id: i64) -> Result<bool> {
        let deleted = storage::delete_keyword(&self.pool, username, id).await?;
        if deleted {
            info!(user = %username, id, "views: keyword deleted");
            self.cache.invalidate(&Self::keywords_key(username));
        }
        Ok(deleted)
    }

    pub async fn create_feed(&self, name: &str, abbr: &str, url: &str) -> Result<Feed> {
        let feed = storage::create_feed(&self.pool, name, abbr, url).await?;
        self.cache.invalidate(FEEDS_KEY);
        Ok(feed)
    }

    pub async fn delete_feed(&self, id: i64) -> Result<bool> {
        let deleted = storage::delete_feed(&self.pool, id).await?;
        self.cache.invalidate(FEEDS_KEY);
        Ok(deleted)
    }

    /// Items `username` has saved, newest first.
    pub async fn saved(&self, username: &str) -> Result<Arc<Vec<Item>>> {
        let key = Self::saved_key(username);
        let view = self
            .cache
            .get_or_load(&key, self.saved_ttl, || async {
                let items = storage::saved_items_for_user(&self.pool, username).await?;
                Ok::<_, anyhow::Error>(CachedView::Items(Arc::new(items)))
            })
            .await?;
        match view {
            CachedView::Items(items) => Ok(items),
            other => bail!("cache key {} holds {:?} instead of saved items", key, other),
        }
    }

    /// `false` when the item does not exist.
    pub async fn save_item(&self, username: &str, item_id: i64) -> Result<bool> {
        let saved = storage::save_item_for_user(&self.pool, username, item_id).await?;
        if saved {
            info!(user = %username, item_id, "views: item saved");
            self.cache.invalidate(&Self::saved_key(username));
        }
        Ok(saved)
    }

    pub async fn delete_saved_item(&self, username: &str, item_id: i64) -> Result<bool> {
        let deleted = storage::delete_saved_item(&self.pool, username, item_id).await?;
        if deleted {
            info!(user = %username, item_id, "views: saved item removed");
            self.cache.invalidate(&Self::saved_key(username));
        }
        Ok(deleted)
    }

    /// Forget every cached item page so newly stored items show up before TTL.
    pub fn invalidate_items(&self) -> usize {
        self.cache.invalidate_prefix(ITEMS_PREFIX)
    }
}
