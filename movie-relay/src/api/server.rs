//! API server setup and configuration.

use axum::Router;
use axum::extract::{DefaultBodyLimit, Request};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Span;

use crate::api::routes;
use crate::error::{Error, Result};
use crate::logging::LoggingConfig;
use crate::pipeline::PipelineManager;

/// API server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub enable_cors: bool,
    /// Request body size limit in bytes
    #[serde(default = "default_body_limit")]
    pub body_limit: usize,
    /// Shared secret for signed submit links. Signed submits are refused without it.
    #[serde(default, skip_serializing)]
    pub download_secret: Option<String>,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_body_limit() -> usize {
    64 * 1024
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            enable_cors: default_true(),
            body_limit: default_body_limit(),
            download_secret: None,
        }
    }
}

impl ApiServerConfig {
    /// Overlay `API_BIND_ADDRESS`, `API_PORT` and `BACKEND_DOWNLOAD_SECRET`.
    pub fn apply_env(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(bind_address) = lookup("API_BIND_ADDRESS")
            && !bind_address.trim().is_empty()
        {
            self.bind_address = bind_address;
        }

        if let Some(port) = lookup("API_PORT")
            && let Ok(parsed) = port.trim().parse::<u16>()
        {
            self.port = parsed;
        }

        if let Some(secret) = lookup("BACKEND_DOWNLOAD_SECRET")
            && !secret.trim().is_empty()
        {
            self.download_secret = Some(secret);
        }
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Server start time for uptime calculation
    pub start_time: Instant,
    pub pipeline: Arc<PipelineManager>,
    /// Logging configuration for runtime filter changes
    pub logging_config: Option<Arc<LoggingConfig>>,
    pub download_secret: Option<Arc<str>>,
}

impl AppState {
    pub fn new(pipeline: Arc<PipelineManager>) -> Self {
        Self {
            start_time: Instant::now(),
            pipeline,
            logging_config: None,
            download_secret: None,
        }
    }

    pub fn with_logging_config(mut self, config: Arc<LoggingConfig>) -> Self {
        self.logging_config = Some(config);
        self
    }

    pub fn with_download_secret(mut self, secret: Option<String>) -> Self {
        self.download_secret = secret.map(Arc::from);
        self
    }
}

/// Build the router with middleware.
pub fn build_router(config: &ApiServerConfig, state: AppState) -> Router {
    let mut router =
        routes::create_router(state).layer(DefaultBodyLimit::max(config.body_limit.max(1024)));

    if config.enable_cors {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        router = router.layer(cors);
    }

    router.layer(
        TraceLayer::new_for_http()
            .make_span_with(|req: &Request| {
                if req.uri().path().starts_with("/health") {
                    Span::none()
                } else {
                    let mut make_span =
                        tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO);
                    use tower_http::trace::MakeSpan;
                    make_span.make_span(req)
                }
            })
            .on_response(
                |res: &axum::http::Response<_>, latency: Duration, span: &Span| {
                    if span.is_disabled() {
                        return;
                    }
                    let on_response =
                        tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO);
                    use tower_http::trace::OnResponse;
                    on_response.on_response(res, latency, span);
                },
            ),
    )
}

/// API server.
pub struct ApiServer {
    config: ApiServerConfig,
    state: AppState,
    cancel_token: CancellationToken,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, state: AppState) -> Self {
        Self {
            config,
            state,
            cancel_token: CancellationToken::new(),
        }
    }

    pub async fn run(&self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.bind_address, self.config.port)
            .parse()
            .map_err(|e| Error::config(format!("Invalid address: {}", e)))?;

        let router = build_router(&self.config, self.state.clone());
        let listener = TcpListener::bind(addr).await?;

        tracing::info!("API server listening on http://{}", addr);

        let cancel_token = self.cancel_token.clone();

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                cancel_token.cancelled().await;
                tracing::info!("API server shutting down...");
            })
            .await?;

        Ok(())
    }

    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_config_defaults() {
        let config = ApiServerConfig::default();
        assert_eq!(config.bind_address, "0.0.0.0");
        assert_eq!(config.port, 8080);
        assert!(config.enable_cors);
        assert!(config.download_secret.is_none());
    }

    #[test]
    fn test_env_overlay() {
        let env: HashMap<&str, &str> = [
            ("API_PORT", "9000"),
            ("API_BIND_ADDRESS", " "),
            ("BACKEND_DOWNLOAD_SECRET", "abc"),
        ]
        .into_iter()
        .collect();
        let mut config = ApiServerConfig::default();
        config.apply_env(&|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.port, 9000);
        assert_eq!(config.bind_address, "0.0.0.0");
        assert_eq!(config.download_secret.as_deref(), Some("abc"));
    }
}
