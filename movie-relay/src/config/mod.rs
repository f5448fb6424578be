//! Application configuration.
//!
//! Values come from an optional JSON file (`RELAY_CONFIG_PATH`) with serde
//! defaults, then individual environment variables override single fields.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{info, warn};

use crate::api::ApiServerConfig;
use crate::domain::UserId;
use crate::external::FfmpegConfig;
use crate::external::http::{DeliveryConfig, ExtractorConfig, MirrorSourceConfig};
use crate::ledger::LedgerConfig;
use crate::pipeline::PipelineManagerConfig;
use crate::resolver::ResolverConfig;
use crate::{Error, Result};

fn default_database_url() -> String {
    "sqlite:movie-relay.db?mode=rwc".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

/// Endpoints of the external collaborators.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourcesConfig {
    #[serde(default)]
    pub mirrors: Vec<MirrorSourceConfig>,
    #[serde(default)]
    pub extractor: ExtractorConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub ffmpeg: FfmpegConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default)]
    pub api: ApiServerConfig,
    #[serde(default)]
    pub pipeline: PipelineManagerConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    /// Single delivery account used when no accounts file is configured.
    #[serde(default)]
    pub session_name: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            log_dir: default_log_dir(),
            api: ApiServerConfig::default(),
            pipeline: PipelineManagerConfig::default(),
            ledger: LedgerConfig::default(),
            sources: SourcesConfig::default(),
            session_name: None,
        }
    }
}

fn parse_env<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::config(format!("{key} has an invalid value: {raw}"))),
        _ => Ok(None),
    }
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl AppConfig {
    /// Load from the process environment.
    pub fn from_env_or_default() -> Result<Self> {
        Self::load(&|key: &str| std::env::var(key).ok())
    }

    /// Load using `lookup` in place of the process environment.
    pub fn load(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = match non_empty(lookup, "RELAY_CONFIG_PATH") {
            Some(path) => {
                let raw = std::fs::read_to_string(&path)?;
                info!(path = %path, "Loaded configuration file");
                serde_json::from_str(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env(lookup)?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self, lookup: &impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = non_empty(lookup, "DATABASE_URL") {
            self.database_url = url;
        }
        if let Some(dir) = non_empty(lookup, "LOG_DIR") {
            self.log_dir = dir;
        }
        self.api.apply_env(lookup);

        let admission = &mut self.pipeline.admission;
        if let Some(v) = parse_env(lookup, "MAX_ACTIVE_JOBS")? {
            admission.max_active_jobs = v;
        }
        if let Some(v) = parse_env(lookup, "USER_LIMIT")? {
            admission.default_user_limit = v;
        }
        if let Some(v) = parse_env(lookup, "PREMIUM_USER_LIMIT")? {
            admission.premium_user_limit = v;
        }
        if let Some(raw) = non_empty(lookup, "PREMIUM_USERS") {
            admission.premium_users = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse::<UserId>()
                        .map_err(|_| Error::config(format!("PREMIUM_USERS has an invalid id: {s}")))
                })
                .collect::<Result<_>>()?;
        }

        let runner = &mut self.pipeline.runner;
        if let Some(v) = parse_env(lookup, "JOB_DEADLINE_SECS")? {
            runner.job_deadline_secs = v;
        }
        if let Some(v) = parse_env(lookup, "MAX_RETRIES")? {
            runner.retry.max_retries = v;
        }

        if let Some(path) = non_empty(lookup, "UPLOAD_ACCOUNTS_PATH") {
            self.ledger.accounts_path = Some(PathBuf::from(path));
        }
        if let Some(name) = non_empty(lookup, "SESSION_NAME") {
            self.session_name = Some(name);
        }

        let sources = &mut self.sources;
        if let Some(raw) = non_empty(lookup, "MIRROR_SOURCES") {
            sources.mirrors = serde_json::from_str(&raw)
                .map_err(|e| Error::config(format!("MIRROR_SOURCES is not valid JSON: {e}")))?;
        }
        if let Some(url) = non_empty(lookup, "EXTRACTOR_URL") {
            sources.extractor.endpoint = url;
        }
        if let Some(url) = non_empty(lookup, "DELIVERY_URL") {
            sources.delivery.endpoint = url;
        }
        if let Some(owner) = non_empty(lookup, "DELIVERY_OWNER") {
            sources.delivery.owner = owner;
        }
        if let Some(token) = non_empty(lookup, "DELIVERY_TOKEN") {
            sources.delivery.api_token = Some(token);
        }
        if let Some(path) = non_empty(lookup, "FFMPEG_PATH") {
            sources.ffmpeg.binary_path = path;
        }
        if let Some(dir) = non_empty(lookup, "WORK_DIR") {
            sources.ffmpeg.work_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let admission = &self.pipeline.admission;
        if admission.max_active_jobs == 0 {
            return Err(Error::config("max_active_jobs must be at least 1"));
        }
        if admission.default_user_limit == 0 || admission.premium_user_limit == 0 {
            return Err(Error::config("per-user limits must be at least 1"));
        }
        if admission.queue_warning_threshold > admission.queue_critical_threshold {
            return Err(Error::config(
                "queue_warning_threshold must not exceed queue_critical_threshold",
            ));
        }
        if self.pipeline.runner.job_deadline_secs == 0 {
            return Err(Error::config("job_deadline_secs must be positive"));
        }
        if !(0.0..=1.0).contains(&self.pipeline.runner.min_confidence) {
            return Err(Error::config("min_confidence must be within 0..=1"));
        }
        for mirror in &self.sources.mirrors {
            url::Url::parse(&mirror.search_url).map_err(|e| {
                Error::config(format!("mirror '{}' has a bad search_url: {e}", mirror.name))
            })?;
        }
        if self.sources.mirrors.is_empty() {
            warn!("No mirror sources configured; every search will report no results");
        }
        Ok(())
    }
}
