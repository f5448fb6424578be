//! Fakes and builders shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use movie_relay::catalog::InMemoryDeliveredStore;
use movie_relay::domain::{
    DeliveryAccount, JobId, MirrorCandidate, MirrorHit, ResultRef, SearchFilters,
};
use movie_relay::external::{
    ConvertedAsset, DeliveryChannel, ExternalError, Extractor, MirrorSource, RawStream, Transcoder,
};
use movie_relay::ledger::{AccountHandle, AccountLedger, InMemoryAccountStore, LedgerConfig};
use movie_relay::pipeline::{Collaborators, PipelineManager, PipelineManagerConfig, ProgressReporter};
use movie_relay::poller::JobStatus;
use movie_relay::resolver::{MirrorResolver, ResolverConfig};

pub struct StaticSource {
    pub name: String,
    pub hits: Vec<MirrorHit>,
}

impl StaticSource {
    pub fn titled(name: &str, title: &str) -> Self {
        Self {
            name: name.to_string(),
            hits: vec![MirrorHit {
                url: format!("https://{name}.example/films/1"),
                title: title.to_string(),
                dubs: Vec::new(),
            }],
        }
    }
}

#[async_trait]
impl MirrorSource for StaticSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn search(&self, _: &str, _: &SearchFilters) -> Result<Vec<MirrorHit>, ExternalError> {
        Ok(self.hits.clone())
    }
}

pub struct FailingSource(pub &'static str);

#[async_trait]
impl MirrorSource for FailingSource {
    fn name(&self) -> &str {
        self.0
    }

    async fn search(&self, _: &str, _: &SearchFilters) -> Result<Vec<MirrorHit>, ExternalError> {
        Err(ExternalError::transient("connection refused"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractBehavior {
    Succeed,
    AlwaysTransient,
    Hang,
}

pub struct ScriptedExtractor {
    pub behavior: ExtractBehavior,
    pub calls: AtomicU32,
}

impl ScriptedExtractor {
    pub fn new(behavior: ExtractBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Extractor for ScriptedExtractor {
    async fn extract(
        &self,
        candidate: &MirrorCandidate,
        _dub: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<RawStream, ExternalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            ExtractBehavior::Succeed => Ok(RawStream {
                url: format!("{}/stream.m3u8", candidate.source_url),
                headers: Vec::new(),
                quality: Some("1080p".to_string()),
                duration_secs: Some(60.0),
                subtitles: Vec::new(),
            }),
            ExtractBehavior::AlwaysTransient => Err(ExternalError::transient("mirror returned 503")),
            ExtractBehavior::Hang => {
                cancel.cancelled().await;
                Err(ExternalError::cancelled())
            }
        }
    }
}

pub struct InstantTranscoder;

#[async_trait]
impl Transcoder for InstantTranscoder {
    async fn convert(
        &self,
        job_id: &JobId,
        _stream: &RawStream,
        progress: &ProgressReporter,
        _cancel: &CancellationToken,
    ) -> Result<ConvertedAsset, ExternalError> {
        progress.report(100);
        let work_dir = PathBuf::from(format!("/nonexistent/movie-relay/{job_id}"));
        Ok(ConvertedAsset {
            playlist: work_dir.join("index.m3u8"),
            files: vec![work_dir.join("index.m3u8"), work_dir.join("media.ts")],
            subtitles: Vec::new(),
            work_dir,
        })
    }

    async fn cleanup(&self, _asset: &ConvertedAsset) {}
}

#[derive(Default)]
pub struct RecordingDelivery {
    pub uploads: AtomicU32,
}

#[async_trait]
impl DeliveryChannel for RecordingDelivery {
    async fn upload(
        &self,
        account: &AccountHandle,
        asset: &ConvertedAsset,
        _caption: &str,
        progress: &ProgressReporter,
        _cancel: &CancellationToken,
    ) -> Result<ResultRef, ExternalError> {
        let n = self.uploads.fetch_add(1, Ordering::SeqCst) + 1;
        progress.report_fraction(1, 1);
        Ok(ResultRef {
            owner: "@relay-store".to_string(),
            session_name: account.session_name().to_string(),
            parts: asset
                .files
                .iter()
                .enumerate()
                .map(|(i, _)| movie_relay::domain::PartRef {
                    part_number: i as u32 + 1,
                    file_ref: format!("upload-{n}-{}", i + 1),
                })
                .collect(),
        })
    }

    async fn probe(&self, _account: &AccountHandle) -> Result<(), ExternalError> {
        Ok(())
    }
}

pub struct Harness {
    pub manager: Arc<PipelineManager>,
    pub extractor: Arc<ScriptedExtractor>,
    pub delivery: Arc<RecordingDelivery>,
    pub catalog: Arc<InMemoryDeliveredStore>,
    pub ledger: Arc<AccountLedger>,
}

/// Fast retry and poll settings so tests finish in milliseconds.
pub fn fast_config() -> PipelineManagerConfig {
    let mut config = PipelineManagerConfig::default();
    config.runner.retry.initial_delay_ms = 10;
    config.runner.retry.max_delay_ms = 20;
    config.runner.retry.use_jitter = false;
    config.runner.account_wait_ms = 10;
    config.workers.poll_interval_ms = 20;
    config
}

pub fn harness(
    config: PipelineManagerConfig,
    sources: Vec<Arc<dyn MirrorSource>>,
    behavior: ExtractBehavior,
) -> Harness {
    let extractor = ScriptedExtractor::new(behavior);
    let delivery = Arc::new(RecordingDelivery::default());
    let catalog = Arc::new(InMemoryDeliveredStore::new());
    let ledger = Arc::new(AccountLedger::new(
        Arc::new(InMemoryAccountStore::with_accounts([
            DeliveryAccount::new("uploader-a"),
            DeliveryAccount::new("uploader-b"),
        ])),
        LedgerConfig::default(),
    ));

    let collaborators = Collaborators {
        resolver: Arc::new(MirrorResolver::new(sources, &ResolverConfig::default())),
        extractor: extractor.clone(),
        transcoder: Arc::new(InstantTranscoder),
        delivery: delivery.clone(),
        ledger: ledger.clone(),
        catalog: catalog.clone(),
    };

    Harness {
        manager: Arc::new(PipelineManager::new(config, collaborators)),
        extractor,
        delivery,
        catalog,
        ledger,
    }
}

pub fn heat_sources() -> Vec<Arc<dyn MirrorSource>> {
    vec![Arc::new(StaticSource::titled("alpha", "Heat"))]
}

pub fn is_terminal(status: &JobStatus) -> bool {
    matches!(
        status,
        JobStatus::Ready { .. } | JobStatus::Failed { .. } | JobStatus::Expired { .. }
    )
}

/// Poll until `done` holds or a few seconds pass.
pub async fn wait_for(
    manager: &PipelineManager,
    job_id: &JobId,
    done: impl Fn(&JobStatus) -> bool,
) -> JobStatus {
    for _ in 0..250 {
        if let Some(status) = manager.poll(job_id)
            && done(&status)
        {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job {job_id} did not reach the expected status: {:?}", manager.poll(job_id));
}
