//! Fan-out mirror search and de-duplication against delivered content.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::ranking::{rank, score_hit};
use super::resilience::SourceBreakers;
use crate::Result;
use crate::catalog::{DeliveredStore, covers_dub};
use crate::domain::{DeliveredContent, MirrorCandidate, SearchFilters, normalize_source_url};
use crate::external::{ExternalError, MirrorSource};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    #[serde(default = "default_per_source_timeout_secs")]
    pub per_source_timeout_secs: u64,
    /// Consecutive failures before a source is skipped.
    #[serde(default = "default_breaker_failure_threshold")]
    pub breaker_failure_threshold: u32,
    #[serde(default = "default_breaker_cooldown_secs")]
    pub breaker_cooldown_secs: u64,
}

fn default_per_source_timeout_secs() -> u64 {
    10
}

fn default_breaker_failure_threshold() -> u32 {
    3
}

fn default_breaker_cooldown_secs() -> u64 {
    120
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            per_source_timeout_secs: default_per_source_timeout_secs(),
            breaker_failure_threshold: default_breaker_failure_threshold(),
            breaker_cooldown_secs: default_breaker_cooldown_secs(),
        }
    }
}

/// A source that contributed nothing to a search.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceFailure {
    pub source: String,
    pub reason: String,
}

/// Candidates of one search, best first.
#[derive(Debug, Clone)]
pub struct RankedCandidates {
    inner: std::vec::IntoIter<MirrorCandidate>,
}

impl RankedCandidates {
    fn new(candidates: Vec<MirrorCandidate>) -> Self {
        Self {
            inner: candidates.into_iter(),
        }
    }

    /// Highest ranked candidate scoring at least `min_confidence`.
    pub fn best_above(mut self, min_confidence: f32) -> Option<MirrorCandidate> {
        self.inner.find(|c| c.confidence >= min_confidence)
    }
}

impl Iterator for RankedCandidates {
    type Item = MirrorCandidate;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for RankedCandidates {}

#[derive(Debug)]
pub enum SearchOutcome {
    /// At least one source answered. May still be empty: a genuine miss.
    Found(RankedCandidates),
    /// No source answered.
    NoResults { failures: Vec<SourceFailure> },
}

pub struct MirrorResolver {
    sources: Vec<Arc<dyn MirrorSource>>,
    breakers: SourceBreakers,
    per_source_timeout: Duration,
}

impl MirrorResolver {
    pub fn new(sources: Vec<Arc<dyn MirrorSource>>, config: &ResolverConfig) -> Self {
        Self {
            sources,
            breakers: SourceBreakers::new(
                config.breaker_failure_threshold,
                Duration::from_secs(config.breaker_cooldown_secs),
            ),
            per_source_timeout: Duration::from_secs(config.per_source_timeout_secs.max(1)),
        }
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.name().to_string()).collect()
    }

    fn selected_sources(&self, hint: Option<&str>) -> Vec<Arc<dyn MirrorSource>> {
        if let Some(hint) = hint {
            let matching: Vec<_> = self
                .sources
                .iter()
                .filter(|s| s.name().eq_ignore_ascii_case(hint))
                .cloned()
                .collect();
            if !matching.is_empty() {
                return matching;
            }
            warn!(source = hint, "Unknown source hint, searching every source");
        }
        self.sources.clone()
    }

    /// Query every selected source concurrently and rank the union.
    ///
    /// Each call re-queries; there is no cursor to resume.
    pub async fn search(&self, title: &str, filters: &SearchFilters) -> SearchOutcome {
        let sources = self.selected_sources(filters.source.as_deref());
        let mut failures = Vec::new();
        let mut pending = Vec::new();

        for source in sources {
            if self.breakers.is_allowed(source.name()) {
                pending.push(source);
            } else {
                debug!(source = source.name(), "Skipping mirror source with open circuit");
                failures.push(SourceFailure {
                    source: source.name().to_string(),
                    reason: "circuit open".to_string(),
                });
            }
        }

        let timeout = self.per_source_timeout;
        let results = join_all(pending.iter().map(|source| async move {
            let result = match tokio::time::timeout(timeout, source.search(title, filters)).await {
                Ok(result) => result,
                Err(_) => Err(ExternalError::transient(format!(
                    "search timed out after {}s",
                    timeout.as_secs()
                ))),
            };
            (source.name().to_string(), result)
        }))
        .await;

        let mut answered = 0usize;
        let mut candidates = Vec::new();
        for (name, result) in results {
            match result {
                Ok(hits) => {
                    answered += 1;
                    self.breakers.record_success(&name);
                    candidates.extend(
                        hits.into_iter()
                            .filter_map(|hit| score_hit(&name, title, hit, filters)),
                    );
                }
                Err(e) => {
                    warn!(source = %name, error = %e, "Mirror source failed");
                    self.breakers.record_failure(&name);
                    failures.push(SourceFailure {
                        source: name,
                        reason: e.to_string(),
                    });
                }
            }
        }

        if answered == 0 {
            info!(title, failed = failures.len(), "Mirror search produced no results");
            return SearchOutcome::NoResults { failures };
        }

        let ranked = rank(candidates);
        debug!(title, candidates = ranked.len(), answered, "Mirror search ranked");
        SearchOutcome::Found(RankedCandidates::new(ranked))
    }
}

/// Drop candidates whose source already delivered the requested dub.
pub fn deduplicate(
    candidates: Vec<MirrorCandidate>,
    already_delivered: &[DeliveredContent],
    dub: Option<&str>,
    alternate_dub: bool,
) -> Vec<MirrorCandidate> {
    if alternate_dub {
        return candidates;
    }
    candidates
        .into_iter()
        .filter(|candidate| {
            let url = normalize_source_url(&candidate.source_url);
            let delivered: Vec<DeliveredContent> = already_delivered
                .iter()
                .filter(|c| {
                    c.source_url
                        .as_deref()
                        .is_some_and(|u| normalize_source_url(u) == url)
                })
                .cloned()
                .collect();
            !covers_dub(&delivered, dub)
        })
        .collect()
}

/// [`deduplicate`] with delivered records looked up in `store`.
pub async fn deduplicate_against(
    store: &dyn DeliveredStore,
    candidates: Vec<MirrorCandidate>,
    dub: Option<&str>,
    alternate_dub: bool,
) -> Result<Vec<MirrorCandidate>> {
    if alternate_dub {
        return Ok(candidates);
    }
    let mut delivered = Vec::new();
    for candidate in &candidates {
        delivered.extend(store.find_by_source(&candidate.source_url).await?);
    }
    Ok(deduplicate(candidates, &delivered, dub, alternate_dub))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MirrorHit, MovieKey, ResultRef};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FixedSource {
        name: &'static str,
        hits: Vec<MirrorHit>,
    }

    #[async_trait]
    impl MirrorSource for FixedSource {
        fn name(&self) -> &str {
            self.name
        }

        async fn search(
            &self,
            _title: &str,
            _filters: &SearchFilters,
        ) -> std::result::Result<Vec<MirrorHit>, ExternalError> {
            Ok(self.hits.clone())
        }
    }

    struct BrokenSource {
        name: &'static str,
        calls: AtomicU32,
    }

    #[async_trait]
    impl MirrorSource for BrokenSource {
        fn name(&self) -> &str {
            self.name
        }

        async fn search(
            &self,
            _title: &str,
            _filters: &SearchFilters,
        ) -> std::result::Result<Vec<MirrorHit>, ExternalError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ExternalError::transient("connection reset"))
        }
    }

    fn hit(url: &str, title: &str, dubs: &[&str]) -> MirrorHit {
        MirrorHit {
            url: url.to_string(),
            title: title.to_string(),
            dubs: dubs.iter().map(|d| d.to_string()).collect(),
        }
    }

    fn candidate(url: &str) -> MirrorCandidate {
        MirrorCandidate {
            source: "alpha".into(),
            source_url: url.into(),
            title: "Heat".into(),
            confidence: 1.0,
            exact_match: true,
            available_dubs: BTreeSet::new(),
        }
    }

    fn delivered(url: &str, dub: Option<&str>) -> DeliveredContent {
        DeliveredContent {
            movie_key: MovieKey::new("heat", "en", dub.map(String::from)),
            quality: None,
            source_url: Some(url.to_string()),
            title: None,
            result_ref: ResultRef::single("@store", "a", "f1"),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_partial_failure_still_returns_results() {
        let resolver = MirrorResolver::new(
            vec![
                Arc::new(BrokenSource {
                    name: "beta",
                    calls: AtomicU32::new(0),
                }),
                Arc::new(FixedSource {
                    name: "alpha",
                    hits: vec![
                        hit("https://a/heat-copy", "Heat (copy)", &[]),
                        hit("https://a/heat", "Heat", &["LostFilm"]),
                    ],
                }),
            ],
            &ResolverConfig::default(),
        );

        let SearchOutcome::Found(ranked) = resolver.search("Heat", &SearchFilters::default()).await
        else {
            panic!("expected results");
        };
        let ranked: Vec<_> = ranked.collect();
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].source_url, "https://a/heat");
        assert!(ranked[0].confidence >= ranked[1].confidence);
    }

    #[tokio::test]
    async fn test_total_failure_is_distinct_from_zero_matches() {
        let broken = MirrorResolver::new(
            vec![Arc::new(BrokenSource {
                name: "beta",
                calls: AtomicU32::new(0),
            })],
            &ResolverConfig::default(),
        );
        match broken.search("Heat", &SearchFilters::default()).await {
            SearchOutcome::NoResults { failures } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].source, "beta");
            }
            SearchOutcome::Found(_) => panic!("expected no results"),
        }

        let empty = MirrorResolver::new(
            vec![Arc::new(FixedSource {
                name: "alpha",
                hits: vec![],
            })],
            &ResolverConfig::default(),
        );
        let SearchOutcome::Found(ranked) = empty.search("Heat", &SearchFilters::default()).await
        else {
            panic!("a source answered");
        };
        assert_eq!(ranked.len(), 0);
    }

    #[tokio::test]
    async fn test_open_circuit_skips_source() {
        let broken = Arc::new(BrokenSource {
            name: "beta",
            calls: AtomicU32::new(0),
        });
        let config = ResolverConfig {
            breaker_failure_threshold: 2,
            ..ResolverConfig::default()
        };
        let resolver = MirrorResolver::new(vec![broken.clone()], &config);

        for _ in 0..4 {
            let _ = resolver.search("Heat", &SearchFilters::default()).await;
        }
        assert_eq!(broken.calls.load(Ordering::SeqCst), 2);

        let SearchOutcome::NoResults { failures } =
            resolver.search("Heat", &SearchFilters::default()).await
        else {
            panic!("expected no results");
        };
        assert_eq!(failures[0].reason, "circuit open");
    }

    #[tokio::test]
    async fn test_source_hint_restricts_search() {
        let resolver = MirrorResolver::new(
            vec![
                Arc::new(FixedSource {
                    name: "alpha",
                    hits: vec![hit("https://a/heat", "Heat", &[])],
                }),
                Arc::new(FixedSource {
                    name: "beta",
                    hits: vec![hit("https://b/heat", "Heat", &[])],
                }),
            ],
            &ResolverConfig::default(),
        );

        let filters = SearchFilters::default().with_source(Some("BETA".into()));
        let SearchOutcome::Found(ranked) = resolver.search("Heat", &filters).await else {
            panic!("expected results");
        };
        let urls: Vec<_> = ranked.map(|c| c.source_url).collect();
        assert_eq!(urls, vec!["https://b/heat".to_string()]);

        let unknown = SearchFilters::default().with_source(Some("gamma".into()));
        let SearchOutcome::Found(ranked) = resolver.search("Heat", &unknown).await else {
            panic!("expected results");
        };
        assert_eq!(ranked.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_source_times_out() {
        struct Slow;

        #[async_trait]
        impl MirrorSource for Slow {
            fn name(&self) -> &str {
                "slow"
            }

            async fn search(
                &self,
                _title: &str,
                _filters: &SearchFilters,
            ) -> std::result::Result<Vec<MirrorHit>, ExternalError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(vec![])
            }
        }

        let resolver = MirrorResolver::new(vec![Arc::new(Slow)], &ResolverConfig::default());
        let SearchOutcome::NoResults { failures } =
            resolver.search("Heat", &SearchFilters::default()).await
        else {
            panic!("expected timeout");
        };
        assert!(failures[0].reason.contains("timed out"));
    }

    #[test]
    fn test_best_above_threshold() {
        let mut low = candidate("https://a/low");
        low.confidence = 0.4;
        let ranked = RankedCandidates::new(vec![low]);
        assert!(ranked.best_above(0.6).is_none());
    }

    #[test]
    fn test_deduplicate_drops_delivered_dub() {
        let candidates = vec![candidate("https://a/heat?x=1"), candidate("https://b/heat")];
        let already = vec![delivered("https://a/heat", Some("LostFilm"))];

        let kept = deduplicate(candidates.clone(), &already, Some("lostfilm"), false);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].source_url, "https://b/heat");

        let other_dub = deduplicate(candidates.clone(), &already, Some("Jaskier"), false);
        assert_eq!(other_dub.len(), 2);

        let alternate = deduplicate(candidates, &already, Some("LostFilm"), true);
        assert_eq!(alternate.len(), 2);
    }

    #[tokio::test]
    async fn test_deduplicate_against_store() {
        let store = crate::catalog::InMemoryDeliveredStore::new();
        store
            .record(&delivered("https://a/heat", None))
            .await
            .unwrap();

        let kept = deduplicate_against(
            &store,
            vec![candidate("https://a/heat/"), candidate("https://b/heat")],
            None,
            false,
        )
        .await
        .unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].source_url, "https://b/heat");
    }
}
