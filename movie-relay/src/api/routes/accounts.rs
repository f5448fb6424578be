//! Delivery account statistics.

use axum::{Json, Router, extract::State, routing::get};

use crate::api::error::ApiResult;
use crate::api::server::AppState;
use crate::domain::DeliveryAccount;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(list_accounts))
}

async fn list_accounts(State(state): State<AppState>) -> ApiResult<Json<Vec<DeliveryAccount>>> {
    Ok(Json(state.pipeline.accounts().await?))
}
