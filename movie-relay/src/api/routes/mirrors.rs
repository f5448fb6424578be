//! Mirror search route.

use axum::{
    Json, Router,
    extract::{Query, State},
    routing::get,
};
use serde::{Deserialize, Serialize};

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::domain::{MirrorCandidate, SearchFilters};
use crate::pipeline::MirrorSearch;

pub fn router() -> Router<AppState> {
    Router::new().route("/search", get(search))
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub title: String,
    pub lang: Option<String>,
    pub dub: Option<String>,
    pub source: Option<String>,
    #[serde(default)]
    pub alternate_dub: bool,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub candidates: Vec<MirrorCandidate>,
}

async fn search(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Json<SearchResponse>> {
    if query.title.trim().is_empty() {
        return Err(ApiError::validation("title must not be empty"));
    }
    let filters = SearchFilters {
        lang: query.lang,
        dub: query.dub.filter(|d| !d.trim().is_empty()),
        source: query.source,
    };

    match state
        .pipeline
        .search_mirrors(query.title.trim(), &filters, query.alternate_dub)
        .await?
    {
        MirrorSearch::Candidates(candidates) => Ok(Json(SearchResponse { candidates })),
        MirrorSearch::NoResults(failures) => Err(ApiError::no_results(&failures)),
    }
}
