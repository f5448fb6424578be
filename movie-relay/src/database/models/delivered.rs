//! Delivered-content rows.

use sqlx::FromRow;

use crate::database::time::ms_to_datetime;
use crate::domain::{DeliveredContent, MovieKey, PartRef, ResultRef};

/// Row of `delivered_content`.
#[derive(Debug, Clone, FromRow)]
pub struct DeliveredContentDbModel {
    pub id: i64,
    pub content_id: String,
    pub lang: String,
    /// Empty string when no dub was requested.
    pub dub: String,
    pub quality: Option<String>,
    pub source_url: Option<String>,
    pub title: Option<String>,
    pub session_name: String,
    pub owner: String,
    pub created_at: i64,
}

/// Row of `delivered_part`.
#[derive(Debug, Clone, FromRow)]
pub struct DeliveredPartDbModel {
    pub content_ref: i64,
    pub part_number: i64,
    pub file_ref: String,
}

impl DeliveredContentDbModel {
    /// Assemble the domain record from the content row and its parts.
    pub fn into_domain(self, mut parts: Vec<DeliveredPartDbModel>) -> DeliveredContent {
        parts.sort_by_key(|p| p.part_number);
        let dub = (!self.dub.is_empty()).then_some(self.dub);
        DeliveredContent {
            movie_key: MovieKey::new(self.content_id, self.lang, dub),
            quality: self.quality,
            source_url: self.source_url,
            title: self.title,
            result_ref: ResultRef {
                owner: self.owner,
                session_name: self.session_name,
                parts: parts
                    .into_iter()
                    .map(|p| PartRef {
                        part_number: u32::try_from(p.part_number).unwrap_or(0),
                        file_ref: p.file_ref,
                    })
                    .collect(),
            },
            created_at: ms_to_datetime(self.created_at),
        }
    }
}

/// Column value for an optional dub.
pub fn dub_column(key: &MovieKey) -> &str {
    key.dub.as_deref().unwrap_or("")
}
