//! Movie identity value objects.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Front-end user identifier.
pub type UserId = i64;

/// Identity of a requested movie variant.
///
/// `content_id` is the external catalog id when known, otherwise the
/// normalized title. Two requests with equal keys ask for the same asset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MovieKey {
    pub content_id: String,
    pub lang: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dub: Option<String>,
}

impl MovieKey {
    pub fn new(content_id: impl Into<String>, lang: impl Into<String>, dub: Option<String>) -> Self {
        Self {
            content_id: content_id.into().trim().to_string(),
            lang: lang.into().trim().to_ascii_lowercase(),
            dub: dub
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty()),
        }
    }

    /// Build a key from a title when no external id is available.
    pub fn from_title(title: &str, lang: impl Into<String>, dub: Option<String>) -> Self {
        Self::new(normalize_title(title), lang, dub)
    }
}

impl fmt::Display for MovieKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.dub {
            Some(dub) => write!(f, "{}:{}:{}", self.content_id, self.lang, dub),
            None => write!(f, "{}:{}:*", self.content_id, self.lang),
        }
    }
}

/// Lowercase, strip punctuation and collapse whitespace.
pub fn normalize_title(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_lowercase().next().unwrap_or(c)
            } else {
                ' '
            }
        })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}
