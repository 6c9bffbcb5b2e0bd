//! Read-only administration endpoints.
//!
//! Everything here is observational: review counters, queue depths,
//! per-repo indexing progress, recent terminal errors, and the last
//! observed forge rate-limit budget. Authenticated by a shared secret
//! header; with no secret configured the endpoints are disabled outright.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::get,
    Router,
};
use serde_json::{json, Value};
use tracing::warn;

use goshawk_core::Lane;

use crate::AppState;

const ADMIN_SECRET_HEADER: &str = "x-admin-secret";

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), StatusCode> {
    let Some(expected) = state.config.admin_secret.as_deref() else {
        return Err(StatusCode::FORBIDDEN);
    };
    let provided = headers
        .get(ADMIN_SECRET_HEADER)
        .and_then(|h| h.to_str().ok());
    if provided == Some(expected) {
        Ok(())
    } else {
        Err(StatusCode::FORBIDDEN)
    }
}

async fn stats_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    authorize(&state, &headers)?;

    let db = state.db.clone();
    let gathered = tokio::task::spawn_blocking(move || {
        let reviews = db.review_counts_by_status()?;
        let fast = db.queue_depth(Lane::Fast)?;
        let slow = db.queue_depth(Lane::Slow)?;
        let index = db.queue_depth(Lane::Index)?;
        let dead = db.dead_letter_count()?;
        anyhow::Ok((reviews, fast, slow, index, dead))
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
    .map_err(|err| {
        warn!(error = %err, "stats query failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let (reviews, fast, slow, index, dead) = gathered;
    let review_counts: Value = reviews
        .into_iter()
        .map(|(status, count)| (status, json!(count)))
        .collect::<serde_json::Map<String, Value>>()
        .into();

    Ok(Json(json!({
        "version": crate::get_service_version(),
        "reviews": review_counts,
        "queues": { "fast": fast, "slow": slow, "index": index, "dead_letter": dead },
        "workers": {
            "fast": state.config.lane_workers.fast,
            "slow": state.config.lane_workers.slow,
            "index": state.config.lane_workers.index,
        },
        "forge_rate_limit": state.github.rate_limit_snapshot(),
    })))
}

async fn indexing_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    authorize(&state, &headers)?;

    let db = state.db.clone();
    let progress = tokio::task::spawn_blocking(move || db.repo_index_progress())
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let rows: Vec<Value> = progress
        .into_iter()
        .map(|(repo, status)| json!({ "repo": repo, "index_status": status }))
        .collect();
    Ok(Json(json!({ "repositories": rows })))
}

async fn errors_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    authorize(&state, &headers)?;

    let db = state.db.clone();
    let failures = tokio::task::spawn_blocking(move || db.recent_failures(50))
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let rows: Vec<Value> = failures
        .into_iter()
        .map(|(id, message)| json!({ "review_id": id, "error": message }))
        .collect();
    Ok(Json(json!({ "recent_errors": rows })))
}

pub fn admin_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/admin/stats", get(stats_handler))
        .route("/admin/indexing", get(indexing_handler))
        .route("/admin/errors", get(errors_handler))
}
