//! Delivery references and the delivered-content record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::movie::MovieKey;

/// One uploaded part of a delivered asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartRef {
    /// 1-based part number.
    pub part_number: u32,
    /// Channel-side reference used to fetch this part later.
    pub file_ref: String,
}

/// Reference the front end uses to fetch a finished asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRef {
    /// Identity on the delivery channel that owns the uploaded parts.
    pub owner: String,
    /// Delivery account that performed the upload.
    pub session_name: String,
    /// Parts in playback order.
    pub parts: Vec<PartRef>,
}

impl ResultRef {
    pub fn single(owner: impl Into<String>, session_name: impl Into<String>, file_ref: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            session_name: session_name.into(),
            parts: vec![PartRef {
                part_number: 1,
                file_ref: file_ref.into(),
            }],
        }
    }

    pub fn is_multipart(&self) -> bool {
        self.parts.len() > 1
    }
}

/// Content that has been fully delivered at least once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveredContent {
    pub movie_key: MovieKey,
    pub quality: Option<String>,
    /// Normalized mirror URL the content was extracted from.
    pub source_url: Option<String>,
    pub title: Option<String>,
    pub result_ref: ResultRef,
    pub created_at: DateTime<Utc>,
}

/// Strip query string, fragment and trailing slash so mirror URLs compare equal.
pub fn normalize_source_url(raw: &str) -> String {
    match url::Url::parse(raw.trim()) {
        Ok(mut parsed) => {
            parsed.set_query(None);
            parsed.set_fragment(None);
            let mut out = parsed.to_string();
            while out.ends_with('/') {
                out.pop();
            }
            out.to_ascii_lowercase()
        }
        Err(_) => raw.trim().trim_end_matches('/').to_ascii_lowercase(),
    }
}
