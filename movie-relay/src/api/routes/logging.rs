//! Runtime log filter.

use axum::{Json, Router, extract::State, routing::get};
use serde::{Deserialize, Serialize};

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(get_filter).put(set_filter))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogFilter {
    pub filter: String,
}

async fn get_filter(State(state): State<AppState>) -> ApiResult<Json<LogFilter>> {
    let config = state
        .logging_config
        .as_ref()
        .ok_or_else(|| ApiError::service_unavailable("logging is not configured"))?;
    Ok(Json(LogFilter {
        filter: config.get_filter(),
    }))
}

async fn set_filter(
    State(state): State<AppState>,
    Json(body): Json<LogFilter>,
) -> ApiResult<Json<LogFilter>> {
    let config = state
        .logging_config
        .as_ref()
        .ok_or_else(|| ApiError::service_unavailable("logging is not configured"))?;
    config.set_filter(&body.filter)?;
    Ok(Json(LogFilter {
        filter: config.get_filter(),
    }))
}
