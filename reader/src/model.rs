use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Score carried by an item nobody has looked at yet.
pub const UNSCORED: i64 = 0;
/// Score written for items the scorer passed over, so they are never resubmitted.
pub const NOT_APPLICABLE_SCORE: i64 = -1;
pub const NOT_APPLICABLE_REASON: &str = "N/A";

/// Feed abbreviations are routing keys; anything longer is cut.
pub const MAX_ABBR_LEN: usize = 4;

/// A configured content source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Feed {
    pub id: i64,
    pub name: String,
    pub abbr: String,
    pub url: String,
}

/// A stored feed entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: i64,
    pub feed_abbr: String,
    pub title: String,
    pub link: String,
    pub description: String,
    pub fingerprint: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub published_at: DateTime<Utc>,
    pub breaking_score: i64,
    pub breaking_reason: String,
}

/// Raw row shape; `published_at` is stored as unix seconds.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ItemRow {
    pub id: i64,
    pub feed_abbr: String,
    pub title: String,
    pub link: String,
    pub description: String,
    pub fingerprint: String,
    pub published_at: i64,
    pub breaking_score: Option<i64>,
    pub breaking_reason: Option<String>,
}

impl From<ItemRow> for Item {
    fn from(row: ItemRow) -> Self {
        Item {
            id: row.id,
            feed_abbr: row.feed_abbr,
            title: row.title,
            link: row.link,
            description: row.description,
            fingerprint: row.fingerprint,
            published_at: Utc
                .timestamp_opt(row.published_at, 0)
                .single()
                .unwrap_or_default(),
            breaking_score: row.breaking_score.unwrap_or(UNSCORED),
            breaking_reason: row.breaking_reason.unwrap_or_default(),
        }
    }
}

/// Candidate item built from a parsed feed entry, not yet stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewItem {
    pub feed_abbr: String,
    pub title: String,
    pub link: String,
    pub description: String,
    pub content: String,
    pub published_at: DateTime<Utc>,
}

impl NewItem {
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.link)
    }

    /// The stored form of this candidate once the store has assigned an id.
    pub fn into_item(self, id: i64) -> Item {
        let fingerprint = self.fingerprint();
        Item {
            id,
            feed_abbr: self.feed_abbr,
            title: self.title,
            link: self.link,
            description: self.description,
            fingerprint,
            published_at: self.published_at,
            breaking_score: UNSCORED,
            breaking_reason: String::new(),
        }
    }
}

/// Content fingerprint: SHA-256 of the canonical link, hex encoded.
/// The title never contributes, so a retitled story keeps its fingerprint.
pub fn fingerprint(link: &str) -> String {
    format!("{:x}", Sha256::digest(link.trim().as_bytes()))
}

/// Reduce a user-supplied abbreviation to at most four letters.
/// Returns `None` when nothing usable remains.
pub fn normalize_abbr(raw: &str) -> Option<String> {
    // Uppercasing may expand a letter (ß -> SS), so cut afterwards.
    let abbr: String = raw
        .chars()
        .filter(|c| c.is_alphabetic())
        .flat_map(char::to_uppercase)
        .take(MAX_ABBR_LEN)
        .collect();
    if abbr.is_empty() {
        None
    } else {
        Some(abbr)
    }
}

/// What a keyword does to a matching headline in a user's view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeywordMode {
    Highlight,
    Suppress,
}

impl KeywordMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeywordMode::Highlight => "highlight",
            KeywordMode::Suppress => "suppress",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "highlight" => Some(KeywordMode::Highlight),
            "suppress" => Some(KeywordMode::Suppress),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keyword {
    pub id: i64,
    pub username: String,
    pub mode: KeywordMode,
    pub text: String,
    pub annotation: Option<String>,
}
