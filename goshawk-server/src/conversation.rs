//! Conversation tracker: per-comment thread state and reply handling.
//!
//! A thread is created when a finding is posted and keyed by the forge
//! comment id. Replies arrive through the gateway as lightweight jobs; each
//! reply is classified into an intent (keyword rules first, a cheap model
//! call for ambiguous text) and dispatched. Handlers that regenerate code
//! re-fetch the file at the PR's *current* head: the thread's pinned commit
//! is the one the finding was posted against, and suggesting edits against
//! stale content is worse than useless.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::db::{JobRecord, ThreadRecord, ThreadTurn};
use crate::error::{ReviewError, Result};
use crate::model::ModelTier;
use crate::orchestrator::ReviewDeps;

/// Bounded thread history. The original finding (turn zero) is always
/// retained; beyond the cap, the oldest conversation turns are dropped.
pub const MAX_THREAD_TURNS: usize = 20;

const INTENT_SYSTEM_PROMPT: &str = "Classify the user's reply to a code-review comment. \
Respond with JSON {\"intent\": \"fix\"|\"explain\"|\"dismiss\"|\"converse\"}.";

const FIX_SYSTEM_PROMPT: &str = "You are a code reviewer asked to propose a concrete fix \
for a finding you reported. Given the current file content and the finding, respond with \
JSON {\"reply\": string, \"suggestion\": string?} where suggestion is replacement code \
for the flagged lines only.";

const EXPLAIN_SYSTEM_PROMPT: &str = "You are a code reviewer asked to explain a finding \
you reported. Respond with JSON {\"reply\": string}. Be concrete and brief.";

const CONVERSE_SYSTEM_PROMPT: &str = "You are a code reviewer continuing a thread about \
one of your findings. Respond with JSON {\"reply\": string}.";

/// Payload of a reply job, produced by the gateway from a
/// review-comment event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyEvent {
    pub comment_id: i64,
    pub in_reply_to_id: i64,
    pub body: String,
    pub author: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Fix,
    Explain,
    Dismiss,
    Converse,
}

/// Keyword-rule classification; `None` means ambiguous.
pub fn classify_by_keywords(text: &str) -> Option<Intent> {
    let lowered = text.to_lowercase();
    if lowered.contains("dismiss")
        || lowered.contains("ignore this")
        || lowered.contains("not an issue")
        || lowered.contains("wontfix")
        || lowered.contains("won't fix")
    {
        return Some(Intent::Dismiss);
    }
    if lowered.contains("fix this") || lowered.contains("fix it") || lowered.starts_with("fix") {
        return Some(Intent::Fix);
    }
    if lowered.contains("explain") || lowered.contains("why") || lowered.contains("what do you mean")
    {
        return Some(Intent::Explain);
    }
    None
}

/// Drop the oldest conversation turns beyond the cap, always keeping the
/// original finding at index zero.
pub fn prune_history(mut history: Vec<ThreadTurn>, cap: usize) -> Vec<ThreadTurn> {
    if history.len() <= cap || history.is_empty() {
        return history;
    }
    let overflow = history.len() - cap;
    let tail = history.split_off(1 + overflow);
    history.truncate(1);
    history.extend(tail);
    history
}

#[derive(Debug, Deserialize)]
struct ReplyResponse {
    reply: String,
    #[serde(default)]
    suggestion: Option<String>,
}

fn parse_reply(text: &str) -> Result<ReplyResponse> {
    serde_json::from_str(text.trim())
        .map_err(|e| ReviewError::Transient(format!("unparseable reply response: {e}")))
}

/// Handle one reply job end to end.
pub async fn handle_reply_job(deps: &Arc<ReviewDeps>, job: &JobRecord) -> Result<()> {
    let Some(payload) = job.payload.as_deref() else {
        warn!(job_id = job.id, "reply job without payload, dropping");
        return Ok(());
    };
    let event: ReplyEvent = match serde_json::from_str(payload) {
        Ok(event) => event,
        Err(err) => {
            warn!(job_id = job.id, error = %err, "unparseable reply payload, dropping");
            return Ok(());
        }
    };

    // Never converse with other bots.
    if event.author.ends_with("[bot]") {
        return Ok(());
    }

    let thread = {
        let db = deps.db.clone();
        let parent = event.in_reply_to_id;
        tokio::task::spawn_blocking(move || db.get_thread(parent))
            .await
            .map_err(|e| ReviewError::Transient(format!("db task panicked: {e}")))?
            .map_err(|e| ReviewError::Transient(format!("thread lookup failed: {e}")))?
    };
    let Some(thread) = thread else {
        // A reply to some other comment; not ours to answer.
        return Ok(());
    };

    let intent = match classify_by_keywords(&event.body) {
        Some(intent) => intent,
        None => classify_by_model(deps, &event.body).await,
    };
    info!(
        comment_id = thread.comment_id,
        ?intent,
        "dispatching reply"
    );

    let reply_body = match intent {
        Intent::Dismiss => {
            if let Some(finding_id) = thread.finding_id.clone() {
                let db = deps.db.clone();
                let result =
                    tokio::task::spawn_blocking(move || db.set_finding_dismissed(&finding_id))
                        .await;
                if let Ok(Err(err)) = result {
                    warn!(error = %err, "failed to record dismissal");
                }
            }
            "Understood, I've dismissed this finding. It won't be raised again for this \
             pull request."
                .to_string()
        }
        Intent::Fix => handle_fix(deps, job, &thread, &event).await?,
        Intent::Explain => {
            let user = format!(
                "Finding:\n{}\n\nFile {} at line {}:\n{}\n\nUser asked: {}",
                original_finding(&thread),
                thread.path,
                thread.line,
                thread.cached_content.as_deref().unwrap_or("<unavailable>"),
                event.body
            );
            let completion = deps
                .model
                .complete(ModelTier::Cheap, EXPLAIN_SYSTEM_PROMPT, &user)
                .await?;
            parse_reply(&completion.text)?.reply
        }
        Intent::Converse => {
            let transcript: String = thread
                .history
                .iter()
                .map(|t| format!("{}: {}\n", t.role, t.content))
                .collect();
            let user = format!("{transcript}user: {}", event.body);
            let completion = deps
                .model
                .complete(ModelTier::Cheap, CONVERSE_SYSTEM_PROMPT, &user)
                .await?;
            parse_reply(&completion.text)?.reply
        }
    };

    deps.github
        .post_reply(
            job.installation_id as u64,
            &thread.repo_full_name,
            thread.pr_number as u64,
            thread.comment_id,
            &reply_body,
        )
        .await?;

    let mut history = thread.history.clone();
    history.push(ThreadTurn {
        role: "user".to_string(),
        content: event.body.clone(),
    });
    history.push(ThreadTurn {
        role: "assistant".to_string(),
        content: reply_body,
    });
    let history = prune_history(history, MAX_THREAD_TURNS);

    let db = deps.db.clone();
    let comment_id = thread.comment_id;
    tokio::task::spawn_blocking(move || db.update_thread_history(comment_id, &history))
        .await
        .map_err(|e| ReviewError::Transient(format!("db task panicked: {e}")))?
        .map_err(|e| ReviewError::Transient(format!("history write failed: {e}")))?;

    Ok(())
}

async fn classify_by_model(deps: &Arc<ReviewDeps>, text: &str) -> Intent {
    #[derive(Deserialize)]
    struct IntentResponse {
        intent: String,
    }
    let result = deps
        .model
        .complete(ModelTier::Cheap, INTENT_SYSTEM_PROMPT, text)
        .await;
    match result {
        Ok(completion) => match serde_json::from_str::<IntentResponse>(completion.text.trim()) {
            Ok(parsed) => match parsed.intent.as_str() {
                "fix" => Intent::Fix,
                "explain" => Intent::Explain,
                "dismiss" => Intent::Dismiss,
                _ => Intent::Converse,
            },
            Err(_) => Intent::Converse,
        },
        Err(err) => {
            warn!(error = %err, "intent classification failed, treating as conversation");
            Intent::Converse
        }
    }
}

/// The fix handler regenerates against the PR's current head, not the
/// thread's pinned commit.
async fn handle_fix(
    deps: &Arc<ReviewDeps>,
    job: &JobRecord,
    thread: &ThreadRecord,
    event: &ReplyEvent,
) -> Result<String> {
    let current = deps
        .github
        .get_file_content(
            job.installation_id as u64,
            &thread.repo_full_name,
            &thread.path,
            &job.head_sha,
        )
        .await;

    let content = match current {
        Ok(content) => content,
        Err(err) => {
            warn!(error = %err, "current-head fetch failed, answering from pinned content");
            thread
                .cached_content
                .clone()
                .unwrap_or_else(|| "<unavailable>".to_string())
        }
    };

    let user = format!(
        "Finding:\n{}\n\nCurrent content of {} (around line {}):\n{}\n\nUser asked: {}",
        original_finding(thread),
        thread.path,
        thread.line,
        content,
        event.body
    );
    let completion = deps
        .model
        .complete(ModelTier::Capable, FIX_SYSTEM_PROMPT, &user)
        .await?;
    let parsed = parse_reply(&completion.text)?;

    let mut body = parsed.reply;
    if let Some(suggestion) = parsed.suggestion {
        body.push_str(&format!("\n\n```suggestion\n{suggestion}\n```"));
    }
    Ok(body)
}

fn original_finding(thread: &ThreadRecord) -> &str {
    thread
        .history
        .first()
        .map(|t| t.content.as_str())
        .unwrap_or("<missing>")
}
