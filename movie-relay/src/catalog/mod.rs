//! Catalog of content that has been fully delivered.
//!
//! Consulted on submit (a hit answers immediately with the stored reference)
//! and by the resolver's de-duplication step.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::Result;
use crate::domain::{DeliveredContent, MovieKey, normalize_source_url};

#[async_trait]
pub trait DeliveredStore: Send + Sync {
    /// Exact variant lookup.
    async fn find(&self, key: &MovieKey) -> Result<Option<DeliveredContent>>;

    /// Everything delivered from `source_url` (normalized before comparison).
    async fn find_by_source(&self, source_url: &str) -> Result<Vec<DeliveredContent>>;

    /// Insert or replace the record for `content.movie_key`.
    async fn record(&self, content: &DeliveredContent) -> Result<()>;
}

/// Whether `delivered` already covers `dub` from the same source.
pub fn covers_dub(delivered: &[DeliveredContent], dub: Option<&str>) -> bool {
    delivered.iter().any(|c| match (c.movie_key.dub.as_deref(), dub) {
        (Some(have), Some(want)) => have.eq_ignore_ascii_case(want),
        (None, None) => true,
        _ => false,
    })
}

#[derive(Default)]
pub struct InMemoryDeliveredStore {
    entries: RwLock<HashMap<MovieKey, DeliveredContent>>,
}

impl InMemoryDeliveredStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeliveredStore for InMemoryDeliveredStore {
    async fn find(&self, key: &MovieKey) -> Result<Option<DeliveredContent>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn find_by_source(&self, source_url: &str) -> Result<Vec<DeliveredContent>> {
        let wanted = normalize_source_url(source_url);
        Ok(self
            .entries
            .read()
            .values()
            .filter(|c| {
                c.source_url
                    .as_deref()
                    .is_some_and(|u| normalize_source_url(u) == wanted)
            })
            .cloned()
            .collect())
    }

    async fn record(&self, content: &DeliveredContent) -> Result<()> {
        let mut content = content.clone();
        content.source_url = content.source_url.as_deref().map(normalize_source_url);
        self.entries
            .write()
            .insert(content.movie_key.clone(), content);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ResultRef;
    use chrono::Utc;

    fn delivered(dub: Option<&str>, url: &str) -> DeliveredContent {
        DeliveredContent {
            movie_key: MovieKey::new("603", "en", dub.map(String::from)),
            quality: Some("1080p".into()),
            source_url: Some(url.into()),
            title: Some("The Matrix".into()),
            result_ref: ResultRef::single("owner", "acc-a", "file-1"),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_record_and_find() {
        let store = InMemoryDeliveredStore::new();
        let item = delivered(Some("LostFilm"), "https://m.example/603?x=1");
        store.record(&item).await.unwrap();

        let found = store.find(&item.movie_key).await.unwrap().unwrap();
        assert_eq!(found.result_ref, item.result_ref);
        assert!(store.find(&MovieKey::new("603", "en", None)).await.unwrap().is_none());

        let by_source = store.find_by_source("https://M.example/603/").await.unwrap();
        assert_eq!(by_source.len(), 1);
    }

    #[test]
    fn test_covers_dub_is_case_insensitive() {
        let items = vec![delivered(Some("LostFilm"), "https://m.example/603")];
        assert!(covers_dub(&items, Some("lostfilm")));
        assert!(!covers_dub(&items, Some("Jaskier")));
        assert!(!covers_dub(&items, None));
    }
}
