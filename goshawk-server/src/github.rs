//! Authenticated forge client.
//!
//! Thin wrapper over the GitHub REST API for the four operations the
//! pipeline needs: fetch a PR's unified diff, fetch file content at a ref,
//! post a review with inline comments, and reply to a review comment.
//! Every call obtains an installation token from the token cache. Rate-limit
//! headers are observed on every response and published for the admin
//! surface without ever blocking a request.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::error::{ReviewError, Result};
use crate::token::TokenCache;

pub const API_VERSION: &str = "2022-11-28";
pub const DEFAULT_API_BASE: &str = "https://api.github.com";

const ACCEPT_JSON: &str = "application/vnd.github+json";
const ACCEPT_DIFF: &str = "application/vnd.github.v3.diff";
const ACCEPT_RAW: &str = "application/vnd.github.raw";

/// One inline comment in a review submission, addressed by diff position.
#[derive(Debug, Clone, Serialize)]
pub struct InlineComment {
    pub path: String,
    /// Start of a multi-line comment's position range, when it spans lines.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_position: Option<u32>,
    pub position: u32,
    pub body: String,
}

/// An inline comment as confirmed by the forge.
#[derive(Debug, Clone, Deserialize)]
pub struct PostedComment {
    pub id: i64,
    pub path: String,
    pub position: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ReviewResponse {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct ReplyResponse {
    id: i64,
}

/// Most recent rate-limit observation, published for observability.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RateLimitSnapshot {
    pub remaining: i64,
    pub limit: i64,
    pub reset_at: i64,
}

pub struct GithubClient {
    client: reqwest::Client,
    api_base: String,
    tokens: Arc<TokenCache>,
    rate_limit: RwLock<Option<RateLimitSnapshot>>,
}

impl GithubClient {
    pub fn new(client: reqwest::Client, api_base: String, tokens: Arc<TokenCache>) -> Self {
        GithubClient {
            client,
            api_base,
            tokens,
            rate_limit: RwLock::new(None),
        }
    }

    /// Latest observed rate-limit budget, if any response carried one.
    pub fn rate_limit_snapshot(&self) -> Option<RateLimitSnapshot> {
        *self.rate_limit.read().expect("lock poisoned")
    }

    /// Fetch the raw unified diff for a pull request.
    pub async fn fetch_pr_diff(
        &self,
        installation_id: u64,
        repo_full_name: &str,
        pr_number: u64,
    ) -> Result<String> {
        let url = format!("{}/repos/{}/pulls/{}", self.api_base, repo_full_name, pr_number);
        let response = self
            .request(installation_id, Method::GET, &url, ACCEPT_DIFF, None)
            .await?;
        let diff = response
            .text()
            .await
            .map_err(|e| ReviewError::Transient(format!("failed to read diff body: {e}")))?;
        info!(repo = repo_full_name, pr_number, bytes = diff.len(), "fetched diff");
        Ok(diff)
    }

    /// Fetch decoded file content at a specific ref.
    pub async fn get_file_content(
        &self,
        installation_id: u64,
        repo_full_name: &str,
        path: &str,
        git_ref: &str,
    ) -> Result<String> {
        let url = format!(
            "{}/repos/{}/contents/{}?ref={}",
            self.api_base, repo_full_name, path, git_ref
        );
        let response = self
            .request(installation_id, Method::GET, &url, ACCEPT_RAW, None)
            .await?;
        response
            .text()
            .await
            .map_err(|e| ReviewError::Transient(format!("failed to read file body: {e}")))
    }

    /// Post a review: one summary body plus a batch of inline comments.
    ///
    /// The forge accepts or rejects the batch atomically; a 422 here means
    /// at least one comment was invalid and the caller should fall back to
    /// `post_single_comment` per item, dropping the offenders.
    pub async fn post_review(
        &self,
        installation_id: u64,
        repo_full_name: &str,
        pr_number: u64,
        head_sha: &str,
        comments: &[InlineComment],
        summary_body: &str,
    ) -> Result<Vec<PostedComment>> {
        let url = format!(
            "{}/repos/{}/pulls/{}/reviews",
            self.api_base, repo_full_name, pr_number
        );
        let payload = json!({
            "commit_id": head_sha,
            "body": summary_body,
            "event": "COMMENT",
            "comments": comments,
        });

        let response = self
            .request(installation_id, Method::POST, &url, ACCEPT_JSON, Some(payload))
            .await?;
        let review: ReviewResponse = response
            .json()
            .await
            .map_err(|e| ReviewError::Transient(format!("bad review response: {e}")))?;

        info!(repo = repo_full_name, pr_number, review_id = review.id, "posted review");

        if comments.is_empty() {
            return Ok(Vec::new());
        }

        // The review response does not include per-comment ids; fetch them
        // so findings can be linked to their threads.
        let comments_url = format!(
            "{}/repos/{}/pulls/{}/reviews/{}/comments",
            self.api_base, repo_full_name, pr_number, review.id
        );
        let response = self
            .request(installation_id, Method::GET, &comments_url, ACCEPT_JSON, None)
            .await?;
        response
            .json::<Vec<PostedComment>>()
            .await
            .map_err(|e| ReviewError::Transient(format!("bad review comments response: {e}")))
    }

    /// Post one inline comment outside a review. Used when the batched
    /// submission was rejected and comments are re-posted individually.
    pub async fn post_single_comment(
        &self,
        installation_id: u64,
        repo_full_name: &str,
        pr_number: u64,
        head_sha: &str,
        comment: &InlineComment,
    ) -> Result<PostedComment> {
        let url = format!(
            "{}/repos/{}/pulls/{}/comments",
            self.api_base, repo_full_name, pr_number
        );
        let payload = json!({
            "commit_id": head_sha,
            "path": comment.path,
            "position": comment.position,
            "body": comment.body,
        });
        let response = self
            .request(installation_id, Method::POST, &url, ACCEPT_JSON, Some(payload))
            .await?;
        response
            .json::<PostedComment>()
            .await
            .map_err(|e| ReviewError::Transient(format!("bad comment response: {e}")))
    }

    /// Reply to an existing review comment thread.
    pub async fn post_reply(
        &self,
        installation_id: u64,
        repo_full_name: &str,
        pr_number: u64,
        parent_comment_id: i64,
        body: &str,
    ) -> Result<i64> {
        let url = format!(
            "{}/repos/{}/pulls/{}/comments/{}/replies",
            self.api_base, repo_full_name, pr_number, parent_comment_id
        );
        let response = self
            .request(
                installation_id,
                Method::POST,
                &url,
                ACCEPT_JSON,
                Some(json!({ "body": body })),
            )
            .await?;
        let reply: ReplyResponse = response
            .json()
            .await
            .map_err(|e| ReviewError::Transient(format!("bad reply response: {e}")))?;
        Ok(reply.id)
    }

    /// Post a top-level PR comment (used for operator-correlated failure
    /// notices).
    pub async fn post_issue_comment(
        &self,
        installation_id: u64,
        repo_full_name: &str,
        pr_number: u64,
        body: &str,
    ) -> Result<i64> {
        let url = format!(
            "{}/repos/{}/issues/{}/comments",
            self.api_base, repo_full_name, pr_number
        );
        let response = self
            .request(
                installation_id,
                Method::POST,
                &url,
                ACCEPT_JSON,
                Some(json!({ "body": body })),
            )
            .await?;
        let reply: ReplyResponse = response
            .json()
            .await
            .map_err(|e| ReviewError::Transient(format!("bad comment response: {e}")))?;
        Ok(reply.id)
    }

    /// Authenticated request with rate-limit observation and one token
    /// refresh on a non-rate-limit 403.
    async fn request(
        &self,
        installation_id: u64,
        method: Method,
        url: &str,
        accept: &str,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response> {
        let mut invalidated = false;
        loop {
            let token = self.tokens.get_token(installation_id).await?;
            let mut builder = self
                .client
                .request(method.clone(), url)
                .header("Authorization", format!("Bearer {token}"))
                .header("Accept", accept)
                .header("X-GitHub-Api-Version", API_VERSION);
            if let Some(ref body) = body {
                builder = builder.json(body);
            }

            let response = builder.send().await?;
            self.observe_rate_limit(response.headers());

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            if status == StatusCode::FORBIDDEN {
                let remaining = header_i64(response.headers(), "x-ratelimit-remaining");
                if remaining == Some(0) {
                    let reset_at = header_i64(response.headers(), "x-ratelimit-reset")
                        .and_then(|epoch| Utc.timestamp_opt(epoch, 0).single());
                    return Err(ReviewError::RateLimited { reset_at });
                }
                if !invalidated {
                    // A 403 with budget remaining usually means the token
                    // was revoked; refresh once and retry.
                    warn!(installation_id, url, "403 with budget remaining, refreshing token");
                    self.tokens.invalidate(installation_id).await;
                    invalidated = true;
                    continue;
                }
            }

            let body_text = response.text().await.unwrap_or_default();
            return Err(classify_failure(status, &body_text));
        }
    }

    fn observe_rate_limit(&self, headers: &HeaderMap) {
        let Some(remaining) = header_i64(headers, "x-ratelimit-remaining") else {
            return;
        };
        let snapshot = RateLimitSnapshot {
            remaining,
            limit: header_i64(headers, "x-ratelimit-limit").unwrap_or(-1),
            reset_at: header_i64(headers, "x-ratelimit-reset").unwrap_or(0),
        };
        if snapshot.remaining < 100 {
            warn!(
                remaining = snapshot.remaining,
                limit = snapshot.limit,
                "forge rate limit running low"
            );
        }
        *self.rate_limit.write().expect("lock poisoned") = Some(snapshot);
    }
}

fn header_i64(headers: &HeaderMap, name: &str) -> Option<i64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// Map a non-success, non-rate-limit response to the error taxonomy.
fn classify_failure(status: StatusCode, body: &str) -> ReviewError {
    let detail = format!("{status}: {}", truncate(body, 200));
    if status == StatusCode::NOT_FOUND {
        ReviewError::NotFound(detail)
    } else if status == StatusCode::UNPROCESSABLE_ENTITY {
        ReviewError::Validation(detail)
    } else if status == StatusCode::FORBIDDEN || status == StatusCode::UNAUTHORIZED {
        ReviewError::Auth(detail)
    } else if status.is_server_error() {
        ReviewError::Transient(detail)
    } else {
        ReviewError::Validation(detail)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Timestamp helper for rate-limit reset headers.
pub fn reset_at_from_epoch(epoch: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(epoch, 0).single()
}
