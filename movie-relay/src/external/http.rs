//! HTTP adapters for mirror search, extraction and delivery services.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::ExternalError;
use super::traits::{ConvertedAsset, DeliveryChannel, Extractor, MirrorSource, RawStream};
use crate::domain::{MirrorCandidate, MirrorHit, PartRef, ResultRef, SearchFilters};
use crate::ledger::AccountHandle;
use crate::pipeline::ProgressReporter;

fn default_timeout_secs() -> u64 {
    30
}

fn build_client(timeout_secs: u64) -> Client {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(timeout_secs))
        .user_agent(concat!("movie-relay/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_default()
}

/// Race `fut` against `cancel`.
async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, ExternalError>>,
) -> Result<T, ExternalError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(ExternalError::cancelled()),
        result = fut => result,
    }
}

async fn check_status(
    response: reqwest::Response,
    context: &str,
) -> Result<reqwest::Response, ExternalError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    warn!(%status, context, body = %body.chars().take(200).collect::<String>(), "HTTP call failed");
    Err(ExternalError::from_status(status, context))
}

/// One mirror search endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorSourceConfig {
    pub name: String,
    /// Called as `GET {search_url}?q=<title>&lang=..&dub=..`.
    pub search_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SearchResponse {
    Wrapped { results: Vec<MirrorHit> },
    Bare(Vec<MirrorHit>),
}

pub struct HttpMirrorSource {
    config: MirrorSourceConfig,
    client: Client,
}

impl HttpMirrorSource {
    pub fn new(config: MirrorSourceConfig) -> Self {
        let client = build_client(config.timeout_secs);
        Self { config, client }
    }
}

#[async_trait]
impl MirrorSource for HttpMirrorSource {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn search(
        &self,
        title: &str,
        filters: &SearchFilters,
    ) -> Result<Vec<MirrorHit>, ExternalError> {
        let mut query: Vec<(&str, &str)> = vec![("q", title)];
        if let Some(lang) = filters.lang.as_deref() {
            query.push(("lang", lang));
        }
        if let Some(dub) = filters.dub.as_deref() {
            query.push(("dub", dub));
        }

        let mut request = self.client.get(&self.config.search_url).query(&query);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = check_status(request.send().await?, &self.config.name).await?;
        let hits = match response.json::<SearchResponse>().await {
            Ok(SearchResponse::Wrapped { results }) => results,
            Ok(SearchResponse::Bare(results)) => results,
            // A source returning garbage is skipped like a network failure.
            Err(e) => return Err(ExternalError::transient(format!("bad search payload: {e}"))),
        };
        debug!(source = %self.config.name, hits = hits.len(), "Mirror search finished");
        Ok(hits)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractorConfig {
    /// Called as `POST {endpoint}` with `{ "url", "dub" }`.
    pub endpoint: String,
    #[serde(default = "default_extract_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_extract_timeout_secs() -> u64 {
    120
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8081/extract".to_string(),
            timeout_secs: default_extract_timeout_secs(),
        }
    }
}

#[derive(Serialize)]
struct ExtractRequest<'a> {
    url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    dub: Option<&'a str>,
}

pub struct HttpExtractor {
    config: ExtractorConfig,
    client: Client,
}

impl HttpExtractor {
    pub fn new(config: ExtractorConfig) -> Self {
        let client = build_client(config.timeout_secs);
        Self { config, client }
    }
}

#[async_trait]
impl Extractor for HttpExtractor {
    async fn extract(
        &self,
        candidate: &MirrorCandidate,
        dub: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<RawStream, ExternalError> {
        cancellable(cancel, async {
            let response = self
                .client
                .post(&self.config.endpoint)
                .json(&ExtractRequest {
                    url: &candidate.source_url,
                    dub,
                })
                .send()
                .await?;
            let response = check_status(response, "extract").await?;
            let stream: RawStream = response.json().await?;
            if stream.url.trim().is_empty() {
                return Err(ExternalError::fatal("extractor returned an empty stream url"));
            }
            info!(source = %candidate.source_url, quality = ?stream.quality, "Stream extracted");
            Ok(stream)
        })
        .await
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Base URL of the delivery service.
    pub endpoint: String,
    /// Channel identity that owns uploaded files.
    pub owner: String,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_upload_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_upload_timeout_secs() -> u64 {
    1800
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8082".to_string(),
            owner: String::new(),
            api_token: None,
            timeout_secs: default_upload_timeout_secs(),
        }
    }
}

#[derive(Deserialize)]
struct UploadResponse {
    file_ref: String,
}

pub struct HttpDeliveryChannel {
    config: DeliveryConfig,
    client: Client,
}

impl HttpDeliveryChannel {
    pub fn new(config: DeliveryConfig) -> Self {
        let client = build_client(config.timeout_secs);
        Self { config, client }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.endpoint.trim_end_matches('/'), path)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn upload_part(
        &self,
        account: &AccountHandle,
        path: &std::path::Path,
        part_number: u32,
        total_parts: u32,
        caption: &str,
    ) -> Result<PartRef, ExternalError> {
        let file = tokio::fs::File::open(path).await.map_err(|e| {
            ExternalError::fatal(format!("cannot open {}: {e}", path.display()))
        })?;
        let size = file.metadata().await?.len();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("part-{part_number}"));

        let part = part_number.to_string();
        let total = total_parts.to_string();
        let request = self
            .client
            .post(self.url("upload"))
            .query(&[
                ("session", account.session_name()),
                ("file_name", file_name.as_str()),
                ("part", part.as_str()),
                ("parts", total.as_str()),
                ("caption", caption),
            ])
            .header(reqwest::header::CONTENT_LENGTH, size)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)));

        let response = self.authorized(request).send().await?;
        let response = check_status(response, "upload").await?;
        let body: UploadResponse = response.json().await?;
        debug!(session = %account.session_name(), part_number, size, "Part uploaded");
        Ok(PartRef {
            part_number,
            file_ref: body.file_ref,
        })
    }
}

#[async_trait]
impl DeliveryChannel for HttpDeliveryChannel {
    async fn upload(
        &self,
        account: &AccountHandle,
        asset: &ConvertedAsset,
        caption: &str,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<ResultRef, ExternalError> {
        if asset.files.is_empty() {
            return Err(ExternalError::fatal("nothing to upload"));
        }
        let total = asset.files.len() as u32;
        let mut parts = Vec::with_capacity(asset.files.len());

        for (index, path) in asset.files.iter().enumerate() {
            let part_number = index as u32 + 1;
            let part = cancellable(
                cancel,
                self.upload_part(account, path, part_number, total, caption),
            )
            .await?;
            parts.push(part);
            progress.report_fraction(u64::from(part_number), u64::from(total));
        }

        info!(
            session = %account.session_name(),
            parts = parts.len(),
            "Upload acknowledged"
        );
        Ok(ResultRef {
            owner: self.config.owner.clone(),
            session_name: account.session_name().to_string(),
            parts,
        })
    }

    async fn probe(&self, account: &AccountHandle) -> Result<(), ExternalError> {
        let request = self
            .client
            .get(self.url(&format!("accounts/{}/probe", account.session_name())));
        let response = self.authorized(request).send().await?;
        check_status(response, "probe").await?;
        Ok(())
    }
}
