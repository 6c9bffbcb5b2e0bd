//! Ingestion gateway.
//!
//! One endpoint under a hard response-time contract: verify the signature,
//! classify the event, run the gatekeeper, check idempotency, enqueue, and
//! acknowledge. The forge's own delivery deadline is generous; the tight
//! budget here exists to absorb its retries. Nothing on this path makes an
//! outbound HTTP call or does cryptographic work beyond the one HMAC.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{Json, Response},
    routing::post,
    Router,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use goshawk_core::PullRequestFacts;

use crate::conversation::ReplyEvent;
use crate::signature::verify_signature;
use crate::AppState;

/// Sub-budget for the idempotency check plus queue write. Overrunning it
/// still acknowledges: the forge's retry will redeliver, and dropping one
/// task beats blowing the response deadline.
const ENQUEUE_BUDGET: Duration = Duration::from_millis(75);

const SIGNATURE_HEADER: &str = "x-hub-signature-256";
const EVENT_HEADER: &str = "x-github-event";

#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    pub action: Option<String>,
    pub pull_request: Option<PullRequest>,
    pub repository: Option<Repository>,
    pub installation: Option<Installation>,
    pub comment: Option<ReviewComment>,
    pub repositories: Option<Vec<RepositoryRef>>,
    pub repositories_added: Option<Vec<RepositoryRef>>,
    pub repositories_removed: Option<Vec<RepositoryRef>>,
}

#[derive(Debug, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    #[serde(default)]
    pub draft: bool,
    pub user: Option<User>,
    #[serde(default)]
    pub labels: Vec<Label>,
    pub head: PullRequestRef,
    pub base: PullRequestRef,
    pub changed_files: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct PullRequestRef {
    pub sha: String,
}

#[derive(Debug, Deserialize)]
pub struct Label {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct User {
    pub login: String,
}

#[derive(Debug, Deserialize)]
pub struct Repository {
    pub id: i64,
    pub full_name: String,
    pub default_branch: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RepositoryRef {
    pub id: i64,
    pub full_name: String,
}

#[derive(Debug, Deserialize)]
pub struct Installation {
    pub id: i64,
    pub account: Option<Account>,
}

#[derive(Debug, Deserialize)]
pub struct Account {
    pub login: String,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReviewComment {
    pub id: i64,
    pub body: String,
    pub in_reply_to_id: Option<i64>,
    pub user: User,
}

#[derive(Serialize)]
pub struct WebhookResponse {
    pub message: String,
}

fn ack(message: &str) -> Json<WebhookResponse> {
    Json(WebhookResponse {
        message: message.to_string(),
    })
}

/// Middleware: read the body exactly once and verify the signature before
/// anything else sees the request. Failure is a 403 and the payload is
/// never parsed or logged.
async fn verify_webhook_signature(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    let header = parts
        .headers
        .get(SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok());

    if let Err(reason) = verify_signature(header, &bytes, &state.config.github_webhook_secret) {
        warn!(%reason, "webhook rejected");
        return Err(StatusCode::FORBIDDEN);
    }

    let request = Request::from_parts(parts, axum::body::Body::from(bytes));
    Ok(next.run(request).await)
}

pub async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<Json<WebhookResponse>, StatusCode> {
    let event_kind = request
        .headers()
        .get(EVENT_HEADER)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    let (_parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;
    let payload: WebhookPayload =
        serde_json::from_slice(&bytes).map_err(|_| StatusCode::BAD_REQUEST)?;

    let action = payload.action.as_deref().unwrap_or("");
    info!(event = %event_kind, action, "webhook received");

    match event_kind.as_str() {
        "pull_request" => handle_pull_request(&state, &payload, action).await,
        "pull_request_review_comment" => handle_review_comment(&state, &payload, action).await,
        "installation" => handle_installation(&state, &payload, action).await,
        "installation_repositories" => handle_installation_repos(&state, &payload).await,
        _ => {
            info!(event = %event_kind, "unhandled event kind, acknowledging");
            Ok(ack("ignored"))
        }
    }
}

async fn handle_pull_request(
    state: &Arc<AppState>,
    payload: &WebhookPayload,
    action: &str,
) -> Result<Json<WebhookResponse>, StatusCode> {
    if !matches!(action, "opened" | "synchronize" | "reopened") {
        return Ok(ack("ignored"));
    }
    let (Some(pr), Some(repo), Some(installation)) = (
        payload.pull_request.as_ref(),
        payload.repository.as_ref(),
        payload.installation.as_ref(),
    ) else {
        warn!("pull_request event missing pr/repository/installation");
        return Ok(ack("ignored"));
    };

    let facts = PullRequestFacts {
        author_login: pr
            .user
            .as_ref()
            .map(|u| u.login.clone())
            .unwrap_or_default(),
        labels: pr.labels.iter().map(|l| l.name.clone()).collect(),
        draft: pr.draft,
        changed_file_count: pr.changed_files,
    };

    // The payload carries no file list; path rules re-run in the worker
    // against the real diff.
    let decision = state.gatekeeper.evaluate(&facts, None);
    if !decision.admit {
        return Ok(ack("skipped"));
    }

    let key = format!("review:{}:{}:{}", repo.id, pr.number, pr.head.sha);
    let db = state.db.clone();
    let ttl = state.config.idempotency_ttl_secs;
    let key_clone = key.clone();

    let reserve_and_enqueue = async {
        let reserved =
            tokio::task::spawn_blocking(move || db.reserve_idempotency_key(&key_clone, ttl))
                .await
                .map_err(|e| anyhow::anyhow!("reserve task panicked: {e}"))??;
        if !reserved {
            return anyhow::Ok(false);
        }
        state
            .scheduler
            .enqueue_review(
                decision.lane,
                installation.id,
                repo.id,
                &repo.full_name,
                pr.number as i64,
                &pr.head.sha,
                &pr.base.sha,
            )
            .await?;
        anyhow::Ok(true)
    };

    match tokio::time::timeout(ENQUEUE_BUDGET, reserve_and_enqueue).await {
        Ok(Ok(true)) => {
            info!(
                repo = %repo.full_name,
                pr = pr.number,
                lane = decision.lane.as_str(),
                reason = %decision.reason,
                "review task enqueued"
            );
            Ok(ack("queued"))
        }
        Ok(Ok(false)) => {
            info!(repo = %repo.full_name, pr = pr.number, "duplicate delivery suppressed");
            Ok(ack("duplicate"))
        }
        Ok(Err(err)) => {
            // Acknowledge anyway; the forge redelivers and the idempotency
            // key (if reserved) expires.
            error!(error = %err, "enqueue failed, acknowledging for redelivery");
            Ok(ack("accepted"))
        }
        Err(_) => {
            error!(key = %key, "enqueue exceeded its budget, acknowledging without it");
            Ok(ack("accepted"))
        }
    }
}

async fn handle_review_comment(
    state: &Arc<AppState>,
    payload: &WebhookPayload,
    action: &str,
) -> Result<Json<WebhookResponse>, StatusCode> {
    if action != "created" {
        return Ok(ack("ignored"));
    }
    let (Some(comment), Some(pr), Some(repo), Some(installation)) = (
        payload.comment.as_ref(),
        payload.pull_request.as_ref(),
        payload.repository.as_ref(),
        payload.installation.as_ref(),
    ) else {
        return Ok(ack("ignored"));
    };
    let Some(parent_id) = comment.in_reply_to_id else {
        // A fresh top-level comment, not a reply to one of our threads.
        return Ok(ack("ignored"));
    };

    let event = ReplyEvent {
        comment_id: comment.id,
        in_reply_to_id: parent_id,
        body: comment.body.clone(),
        author: comment.user.login.clone(),
    };
    let Ok(event_json) = serde_json::to_string(&event) else {
        return Ok(ack("ignored"));
    };

    let enqueue = state.scheduler.enqueue_reply(
        installation.id,
        repo.id,
        &repo.full_name,
        pr.number as i64,
        &pr.head.sha,
        &event_json,
    );
    match tokio::time::timeout(ENQUEUE_BUDGET, enqueue).await {
        Ok(Ok(_)) => Ok(ack("queued")),
        Ok(Err(err)) => {
            error!(error = %err, "reply enqueue failed");
            Ok(ack("accepted"))
        }
        Err(_) => {
            error!("reply enqueue exceeded its budget");
            Ok(ack("accepted"))
        }
    }
}

/// Installation lifecycle events are rare and latency-tolerant; they write
/// straight to persistence.
async fn handle_installation(
    state: &Arc<AppState>,
    payload: &WebhookPayload,
    action: &str,
) -> Result<Json<WebhookResponse>, StatusCode> {
    let Some(installation) = payload.installation.as_ref() else {
        return Ok(ack("ignored"));
    };
    let installation_id = installation.id;
    let (account_login, account_kind) = installation
        .account
        .as_ref()
        .map(|a| {
            (
                a.login.clone(),
                a.kind.clone().unwrap_or_else(|| "User".to_string()),
            )
        })
        .unwrap_or_else(|| ("unknown".to_string(), "User".to_string()));

    match action {
        "created" => {
            let repos: Vec<RepositoryRef> = payload
                .repositories
                .as_ref()
                .map(|r| {
                    r.iter()
                        .map(|r| RepositoryRef {
                            id: r.id,
                            full_name: r.full_name.clone(),
                        })
                        .collect()
                })
                .unwrap_or_default();

            let db = state.db.clone();
            let repo_list: Vec<(i64, String)> =
                repos.iter().map(|r| (r.id, r.full_name.clone())).collect();
            let write = tokio::task::spawn_blocking(move || {
                db.upsert_installation(installation_id, &account_login, &account_kind)?;
                for (id, full_name) in &repo_list {
                    db.upsert_repository(*id, installation_id, full_name, "main")?;
                }
                anyhow::Ok(())
            })
            .await;
            if let Ok(Err(err)) = write {
                error!(error = %err, "installation write failed");
            }

            for repo in &repos {
                if let Err(err) = state
                    .scheduler
                    .enqueue_index(installation_id, repo.id, &repo.full_name)
                    .await
                {
                    error!(error = %err, repo = %repo.full_name, "index enqueue failed");
                }
            }
            info!(installation_id, repos = repos.len(), "installation created");
            Ok(ack("installed"))
        }
        "deleted" => {
            let db = state.db.clone();
            let write =
                tokio::task::spawn_blocking(move || db.deactivate_installation(installation_id))
                    .await;
            if let Ok(Err(err)) = write {
                error!(error = %err, "installation deactivation failed");
            }
            info!(installation_id, "installation deleted");
            Ok(ack("uninstalled"))
        }
        _ => Ok(ack("ignored")),
    }
}

async fn handle_installation_repos(
    state: &Arc<AppState>,
    payload: &WebhookPayload,
) -> Result<Json<WebhookResponse>, StatusCode> {
    let Some(installation) = payload.installation.as_ref() else {
        return Ok(ack("ignored"));
    };
    let installation_id = installation.id;

    let added: Vec<(i64, String)> = payload
        .repositories_added
        .as_ref()
        .map(|r| r.iter().map(|r| (r.id, r.full_name.clone())).collect())
        .unwrap_or_default();
    let removed: Vec<i64> = payload
        .repositories_removed
        .as_ref()
        .map(|r| r.iter().map(|r| r.id).collect())
        .unwrap_or_default();

    let db = state.db.clone();
    let added_for_db = added.clone();
    let write = tokio::task::spawn_blocking(move || {
        for (id, full_name) in &added_for_db {
            db.upsert_repository(*id, installation_id, full_name, "main")?;
        }
        for id in &removed {
            db.remove_repository(*id)?;
        }
        anyhow::Ok(())
    })
    .await;
    if let Ok(Err(err)) = write {
        error!(error = %err, "installation_repositories write failed");
    }

    for (id, full_name) in &added {
        if let Err(err) = state
            .scheduler
            .enqueue_index(installation_id, *id, full_name)
            .await
        {
            error!(error = %err, repo = %full_name, "index enqueue failed");
        }
    }
    Ok(ack("updated"))
}

pub fn webhook_router(middleware_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/webhook", post(webhook_handler))
        .route_layer(middleware::from_fn_with_state(
            middleware_state,
            verify_webhook_signature,
        ))
}
