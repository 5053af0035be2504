// src/api.rs
// JSON read facade over the story store, plus the live socket route.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::live::{self, LiveHub};
use crate::store::{Store, StoryFilter};

/// Window used by `/stories/count` and `/stories/latest`.
pub const RECENT_WINDOW_MINUTES: i64 = 5;

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub live: LiveHub,
}

/// Store failure surfaced as a 500 JSON body.
pub struct ApiError(anyhow::Error);

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self.0, "request failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "status": "error", "message": self.0.to_string() })),
        )
            .into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/health", get(health))
        .route("/api/stories/count", get(recent_count))
        .route("/api/stories/latest", get(recent_stories))
        .route("/api/stories", get(list_stories))
        .with_state(state.clone());

    api.merge(live::socket::router(state.live))
        .layer(CorsLayer::very_permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

fn recent_cutoff() -> chrono::DateTime<Utc> {
    Utc::now() - chrono::Duration::minutes(RECENT_WINDOW_MINUTES)
}

async fn recent_count(State(state): State<AppState>) -> ApiResult {
    let count = state.store.count_since(recent_cutoff()).await?;
    Ok(Json(json!({
        "status": "success",
        "count": count,
        "timestamp": Utc::now(),
    })))
}

async fn recent_stories(State(state): State<AppState>) -> ApiResult {
    let stories = state.store.created_since(recent_cutoff()).await?;
    Ok(Json(json!({
        "status": "success",
        "count": stories.len(),
        "stories": stories,
        "timestamp": Utc::now(),
    })))
}

async fn list_stories(State(state): State<AppState>, Query(filter): Query<StoryFilter>) -> ApiResult {
    let page = state.store.query(&filter).await?;
    Ok(Json(json!({
        "status": "success",
        "count": page.count,
        "total": page.total,
        "page": page.page,
        "totalPages": page.total_pages,
        "stories": page.stories,
        "filters": {
            "type": filter.order,
            "author": filter.author,
            "title": filter.title,
            "limit": filter.effective_limit(),
            "offset": filter.effective_offset(),
        },
        "timestamp": Utc::now(),
    })))
}
