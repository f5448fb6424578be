//! Contracts the pipeline needs from its external collaborators.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use super::error::ExternalError;
use crate::domain::{JobId, MirrorCandidate, MirrorHit, ResultRef, SearchFilters};
use crate::ledger::AccountHandle;
use crate::pipeline::ProgressReporter;

/// A subtitle track offered alongside the raw stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtitleTrack {
    pub lang: String,
    pub url: String,
}

/// Fetchable raw media located by an [`Extractor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawStream {
    pub url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub quality: Option<String>,
    /// Media duration when the source reports it; used for progress.
    #[serde(default)]
    pub duration_secs: Option<f64>,
    #[serde(default)]
    pub subtitles: Vec<SubtitleTrack>,
}

/// Output of a [`Transcoder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertedAsset {
    pub work_dir: PathBuf,
    /// Adaptive-bitrate playlist.
    pub playlist: PathBuf,
    pub subtitles: Vec<PathBuf>,
    /// Every file to deliver, in part order.
    pub files: Vec<PathBuf>,
}

/// An external site that may host the requested content.
#[async_trait]
pub trait MirrorSource: Send + Sync {
    fn name(&self) -> &str;

    async fn search(
        &self,
        title: &str,
        filters: &SearchFilters,
    ) -> Result<Vec<MirrorHit>, ExternalError>;
}

#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(
        &self,
        candidate: &MirrorCandidate,
        dub: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<RawStream, ExternalError>;
}

/// Produces an adaptive playlist plus subtitle tracks from a raw stream.
///
/// Progress goes through `progress` as a 0-100 percentage.
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn convert(
        &self,
        job_id: &JobId,
        stream: &RawStream,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<ConvertedAsset, ExternalError>;

    /// Remove intermediate files once the job no longer needs them.
    async fn cleanup(&self, asset: &ConvertedAsset) {
        if let Err(e) = tokio::fs::remove_dir_all(&asset.work_dir).await {
            tracing::debug!(dir = %asset.work_dir.display(), error = %e, "Work dir cleanup failed");
        }
    }
}

/// Accepts uploads and returns a fetchable reference.
///
/// All parts of one asset go through the same account; a failed part fails
/// the whole upload.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    async fn upload(
        &self,
        account: &AccountHandle,
        asset: &ConvertedAsset,
        caption: &str,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<ResultRef, ExternalError>;

    /// Cheap liveness check for an account in error cooldown.
    async fn probe(&self, account: &AccountHandle) -> Result<(), ExternalError>;
}
