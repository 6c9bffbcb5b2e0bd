//! The staged review pipeline: S0 static analysis, S1 summary, S2 defect
//! and security detection, S3 cross-file impact, S4 style, S5 synthesis,
//! then position-validated posting.
//!
//! Every stage owns its failure boundary: a broken stage contributes zero
//! findings instead of aborting the review. Only a failed diff fetch or a
//! total posting failure is fatal. The cost ledger is charged before each
//! model call begins, so total spend never exceeds the ceiling by more
//! than one call.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use goshawk_core::{
    line_position_map, parse_diff, synthesize, FileDiff, FileStatus, Finding, Gatekeeper,
    RepoConfig, Severity, REPO_CONFIG_PATH,
};

use crate::analysis::analyze_file;
use crate::conversation;
use crate::db::{Database, IndexStatus, JobKind, JobRecord, ThreadRecord, ThreadTurn};
use crate::error::{ReviewError, Result};
use crate::github::{GithubClient, InlineComment};
use crate::model::{
    estimate_cost, parse_findings, parse_summary, DiffSummary, ModelClient, ModelTier, RiskLevel,
};

/// Diff text beyond this many bytes is truncated before the summary call.
const SUMMARY_DIFF_LIMIT: usize = 24_000;

/// Files with more hunks than this get file-level review with the capable
/// model in S2.
const FILE_LEVEL_HUNK_THRESHOLD: usize = 5;

/// Path fragments that mark a file as security-sensitive.
const SECURITY_SENSITIVE_MARKERS: &[&str] = &[
    "auth", "security", "crypto", "password", "secret", "token", "session", "login",
];

/// Style findings within this many lines of a defect finding are dropped.
const STYLE_OVERLAP_SLACK: u32 = 3;

/// If more than this many findings survive the rule-based pass, a cheap
/// model call pares the list further.
const MODEL_PARE_THRESHOLD: usize = 15;

const SUMMARY_SYSTEM_PROMPT: &str = "You are a senior code reviewer. Summarize the pull \
request diff in two or three sentences and assess its risk. Respond with JSON: \
{\"summary\": string, \"risk\": \"low\"|\"medium\"|\"high\"}.";

const DEFECT_SYSTEM_PROMPT: &str = "You are a rigorous code reviewer hunting for defects, \
security flaws, and breaking changes. Only report issues you are confident about. Respond \
with JSON: {\"findings\": [{\"line_start\": int, \"line_end\": int, \"severity\": \
\"critical\"|\"high\"|\"medium\"|\"low\"|\"info\", \"category\": \"defect\"|\"security\"|\
\"performance\"|\"breaking_change\", \"title\": string, \"body\": string, \"suggestion\": \
string?, \"confidence\": number}]}. Line numbers refer to the new file.";

const STYLE_SYSTEM_PROMPT: &str = "You are a code reviewer focused on style and \
conventions only. Ignore functional issues. Respond with the same JSON findings shape, \
using category \"style\" or \"docs\".";

const CROSS_FILE_SYSTEM_PROMPT: &str = "You are assessing whether a changed function \
breaks one of its call sites. Respond with the JSON findings shape; use category \
\"breaking_change\" and report nothing if the call site is unaffected.";

const PARE_SYSTEM_PROMPT: &str = "You are deduplicating a code review. Given a numbered \
list of findings, respond with JSON {\"keep\": [int]} listing the indexes worth posting. \
Drop near-duplicates and low-value nits; keep at most fifteen.";

/// A call site reported by the symbol-graph or retrieval collaborator.
#[derive(Debug, Clone)]
pub struct CallSite {
    pub path: String,
    pub snippet: String,
}

/// Seam for the cross-file stage's collaborators. The symbol graph and the
/// vector index are external services; when neither is configured the
/// stage is skipped.
#[async_trait]
pub trait CallSiteIndex: Send + Sync {
    async fn call_sites(&self, repo_full_name: &str, symbol: &str) -> Result<Vec<CallSite>>;
}

/// Accumulating spend counter with a hard ceiling.
///
/// Charged before a call begins. The last successful charge may overshoot
/// the ceiling, bounding total spend at ceiling + one call.
pub struct CostLedger {
    inner: Mutex<LedgerState>,
}

struct LedgerState {
    spent: f64,
    ceiling: f64,
    truncated: bool,
}

impl CostLedger {
    pub fn new(ceiling: f64) -> Self {
        CostLedger {
            inner: Mutex::new(LedgerState {
                spent: 0.0,
                ceiling,
                truncated: false,
            }),
        }
    }

    /// Charge for an upcoming call. Fails once the ceiling is spent.
    pub fn try_charge(&self, amount: f64) -> Result<()> {
        let mut state = self.inner.lock().expect("lock poisoned");
        if state.spent >= state.ceiling {
            state.truncated = true;
            return Err(ReviewError::CostCeiling);
        }
        state.spent += amount.max(0.0);
        Ok(())
    }

    /// Replace an estimate with the actual cost once usage is known.
    pub fn settle(&self, estimated: f64, actual: f64) {
        let mut state = self.inner.lock().expect("lock poisoned");
        state.spent = (state.spent - estimated + actual).max(0.0);
    }

    pub fn spent(&self) -> f64 {
        self.inner.lock().expect("lock poisoned").spent
    }

    pub fn was_truncated(&self) -> bool {
        self.inner.lock().expect("lock poisoned").truncated
    }
}

/// Shared handles a worker needs to run reviews.
pub struct ReviewDeps {
    pub db: Arc<Database>,
    pub github: Arc<GithubClient>,
    pub model: Arc<ModelClient>,
    pub call_sites: Option<Arc<dyn CallSiteIndex>>,
    pub cost_ceiling_usd: f64,
    pub model_concurrency: usize,
    pub large_pr_threshold: usize,
    /// Mirror of the scheduler's retry bound, so the final attempt can mark
    /// the review failed before the task is dead-lettered.
    pub max_retries: u32,
}

/// One reviewable file: its parsed diff plus the position map.
#[derive(Debug, Clone)]
struct ReviewFile {
    diff: FileDiff,
    positions: BTreeMap<u32, u32>,
}

/// The flat, typed state flowing through the stages of one review.
struct ReviewContext {
    review_id: String,
    installation_id: u64,
    repo_id: i64,
    repo_full_name: String,
    pr_number: u64,
    head_sha: String,
    base_sha: String,
    config: RepoConfig,
    files: Vec<ReviewFile>,
    /// File contents at head, fetched once in S0 and reused by posting and
    /// thread registration.
    contents: HashMap<String, String>,
    summary: Option<DiffSummary>,
    findings: Vec<Finding>,
    ledger: Arc<CostLedger>,
    cancel: CancellationToken,
}

/// The executor handed to scheduler workers; dispatches on job kind.
pub struct WorkerExecutor {
    pub deps: Arc<ReviewDeps>,
}

#[async_trait]
impl crate::queue::JobExecutor for WorkerExecutor {
    async fn execute(&self, job: JobRecord, cancel: CancellationToken) -> Result<()> {
        match job.kind {
            JobKind::Review => run_review(&self.deps, &job, cancel).await,
            JobKind::Reply => conversation::handle_reply_job(&self.deps, &job).await,
            JobKind::Index => run_index_job(&self.deps, &job).await,
        }
    }
}

/// The indexing worker proper is an external collaborator; the scheduler
/// contract only requires recording status transitions here.
async fn run_index_job(deps: &Arc<ReviewDeps>, job: &JobRecord) -> Result<()> {
    let db = deps.db.clone();
    let repo_id = job.repo_id;
    tokio::task::spawn_blocking(move || {
        db.set_repo_index_status(repo_id, IndexStatus::Indexing, None)?;
        db.set_repo_index_status(repo_id, IndexStatus::Ready, None)
    })
    .await
    .map_err(|e| ReviewError::Transient(format!("index task panicked: {e}")))?
    .map_err(|e| ReviewError::Transient(format!("index status write failed: {e}")))?;
    Ok(())
}

/// Run one complete review for a claimed job.
pub async fn run_review(
    deps: &Arc<ReviewDeps>,
    job: &JobRecord,
    cancel: CancellationToken,
) -> Result<()> {
    let idempotency_key = format!(
        "review:{}:{}:{}",
        job.repo_id, job.pr_number, job.head_sha
    );

    let review_id = {
        let db = deps.db.clone();
        let (repo_id, pr_number) = (job.repo_id, job.pr_number);
        let (head, base) = (job.head_sha.clone(), job.base_sha.clone());
        tokio::task::spawn_blocking(move || {
            let id = db.create_review(repo_id, pr_number, &head, &base)?;
            db.mark_review_processing(&id)?;
            anyhow::Ok(id)
        })
        .await
        .map_err(|e| ReviewError::Transient(format!("db task panicked: {e}")))?
        .map_err(|e| ReviewError::Transient(format!("review row write failed: {e}")))?
    };

    let result = run_review_inner(deps, job, &review_id, cancel).await;

    match result {
        Ok(()) => {
            release_key(deps, &idempotency_key).await;
            Ok(())
        }
        Err(err) if err.is_retryable() => {
            if job.attempts as u32 > deps.max_retries {
                // This was the last attempt; the scheduler will not retry
                // again, so the review reaches its terminal row now.
                let message = format!("retries exhausted: {}: {}", err.kind(), err);
                fail_review(deps, job, &review_id, &message).await;
                release_key(deps, &idempotency_key).await;
            }
            // Otherwise the scheduler retries; the review row stays
            // processing and the idempotency key stays held so duplicate
            // deliveries are suppressed meanwhile.
            Err(err)
        }
        Err(err) => {
            // Terminal: mark the review failed, post a correlated notice,
            // release the key.
            let message = format!("{}: {}", err.kind(), err);
            fail_review(deps, job, &review_id, &message).await;
            release_key(deps, &idempotency_key).await;
            match err {
                // Invariant bugs go to the dead-letter sink for operators.
                ReviewError::Invariant(_) => Err(err),
                _ => Ok(()),
            }
        }
    }
}

async fn release_key(deps: &Arc<ReviewDeps>, key: &str) {
    let db = deps.db.clone();
    let key = key.to_string();
    if let Ok(Err(err)) =
        tokio::task::spawn_blocking(move || db.release_idempotency_key(&key)).await
    {
        warn!(error = %err, "failed to release idempotency key");
    }
}

async fn fail_review(deps: &Arc<ReviewDeps>, job: &JobRecord, review_id: &str, message: &str) {
    error!(review_id, message, "review failed terminally");
    {
        let db = deps.db.clone();
        let (review_id, message) = (review_id.to_string(), message.to_string());
        if let Ok(Err(err)) =
            tokio::task::spawn_blocking(move || db.fail_review(&review_id, &message)).await
        {
            error!(error = %err, "failed to record review failure");
        }
    }

    // One user-neutral comment with an operator correlation id.
    let body = format!(
        "Automated review could not be completed for this push. \
         Reference: `{review_id}`."
    );
    if let Err(err) = deps
        .github
        .post_issue_comment(
            job.installation_id as u64,
            &job.repo_full_name,
            job.pr_number as u64,
            &body,
        )
        .await
    {
        warn!(error = %err, "failed to post failure notice");
    }
}

async fn run_review_inner(
    deps: &Arc<ReviewDeps>,
    job: &JobRecord,
    review_id: &str,
    cancel: CancellationToken,
) -> Result<()> {
    let installation_id = job.installation_id as u64;

    // Per-repository configuration at the base commit; absent or malformed
    // documents silently fall back to defaults.
    let config = match deps
        .github
        .get_file_content(
            installation_id,
            &job.repo_full_name,
            REPO_CONFIG_PATH,
            &job.base_sha,
        )
        .await
    {
        Ok(content) => RepoConfig::parse(&content),
        Err(ReviewError::NotFound(_)) => RepoConfig::default(),
        Err(err) => {
            warn!(error = %err, "repo config fetch failed, using defaults");
            RepoConfig::default()
        }
    };

    if !config.review.enabled {
        info!(repo = %job.repo_full_name, pr = job.pr_number, "reviews disabled by repo config");
        complete_review(deps, review_id, &[], 0.0).await?;
        return Ok(());
    }

    // The diff is the one fetch the pipeline cannot survive without.
    let diff_text = deps
        .github
        .fetch_pr_diff(installation_id, &job.repo_full_name, job.pr_number as u64)
        .await?;

    let gate = Gatekeeper::new(deps.large_pr_threshold, &config.review.ignore_patterns);
    let files = reviewable_files(&parse_diff(&diff_text), &gate, &config);

    let mut ctx = ReviewContext {
        review_id: review_id.to_string(),
        installation_id,
        repo_id: job.repo_id,
        repo_full_name: job.repo_full_name.clone(),
        pr_number: job.pr_number as u64,
        head_sha: job.head_sha.clone(),
        base_sha: job.base_sha.clone(),
        config,
        files,
        contents: HashMap::new(),
        summary: None,
        findings: Vec::new(),
        ledger: Arc::new(CostLedger::new(deps.cost_ceiling_usd)),
        cancel,
    };

    if ctx.files.is_empty() {
        // Nothing commentable: removed-only diffs, binary-only diffs, or
        // an empty diff. A summary-only review is still posted.
        let body = "No reviewable changes in this push.";
        deps.github
            .post_review(
                ctx.installation_id,
                &ctx.repo_full_name,
                ctx.pr_number,
                &ctx.head_sha,
                &[],
                body,
            )
            .await?;
        complete_review(deps, review_id, &[], ctx.ledger.spent()).await?;
        return Ok(());
    }

    stage_static_analysis(deps, &mut ctx).await;
    stage_summary(deps, &mut ctx).await;
    stage_defects(deps, &mut ctx).await;
    stage_cross_file(deps, &mut ctx).await;
    stage_style(deps, &mut ctx).await;
    let final_findings = stage_synthesis(deps, &mut ctx).await;

    post_and_record(deps, &mut ctx, final_findings).await
}

/// Filter parsed diffs down to files worth reviewing.
fn reviewable_files(parsed: &[FileDiff], gate: &Gatekeeper, config: &RepoConfig) -> Vec<ReviewFile> {
    parsed
        .iter()
        .filter(|f| !f.is_binary)
        .filter(|f| f.status != FileStatus::Removed)
        .filter(|f| config.language_enabled(f.language.as_deref()))
        .filter(|f| {
            let paths = [f.path.clone()];
            !gate.reviewable_files(&paths).is_empty()
        })
        .map(|f| ReviewFile {
            positions: line_position_map(f),
            diff: f.clone(),
        })
        .collect()
}

async fn set_stage(deps: &Arc<ReviewDeps>, review_id: &str, stage: &str) {
    let db = deps.db.clone();
    let (review_id, stage) = (review_id.to_string(), stage.to_string());
    if let Ok(Err(err)) =
        tokio::task::spawn_blocking(move || db.set_review_stage(&review_id, &stage)).await
    {
        warn!(error = %err, "failed to record stage");
    }
}

/// S0: external analyzers in a per-review scratch directory.
async fn stage_static_analysis(deps: &Arc<ReviewDeps>, ctx: &mut ReviewContext) {
    if ctx.cancel.is_cancelled() {
        return;
    }
    set_stage(deps, &ctx.review_id, "s0_static_analysis").await;

    let workdir = match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(err) => {
            warn!(error = %err, "could not create analysis scratch dir");
            return;
        }
    };

    let targets: Vec<(String, Option<String>, BTreeMap<u32, u32>)> = ctx
        .files
        .iter()
        .map(|f| (f.diff.path.clone(), f.diff.language.clone(), f.positions.clone()))
        .collect();

    for (path, language, positions) in targets {
        let content = match deps
            .github
            .get_file_content(ctx.installation_id, &ctx.repo_full_name, &path, &ctx.head_sha)
            .await
        {
            Ok(content) => content,
            Err(err) => {
                warn!(path = %path, error = %err, "content fetch failed, skipping analysis");
                continue;
            }
        };
        ctx.contents.insert(path.clone(), content.clone());

        let Some(language) = language else {
            continue;
        };
        let findings = analyze_file(workdir.path(), &path, &language, &content, &positions).await;
        ctx.findings.extend(findings);
    }
    // The scratch directory is removed when `workdir` drops.
}

/// S1: cheap-model summary plus risk level; becomes the review body.
async fn stage_summary(deps: &Arc<ReviewDeps>, ctx: &mut ReviewContext) {
    if ctx.cancel.is_cancelled() {
        return;
    }
    set_stage(deps, &ctx.review_id, "s1_summary").await;

    let mut diff_digest = String::new();
    for file in &ctx.files {
        diff_digest.push_str(&format!("--- {} ---\n", file.diff.path));
        for hunk in &file.diff.hunks {
            diff_digest.push_str(&hunk.header);
            diff_digest.push('\n');
            for line in &hunk.lines {
                diff_digest.push_str(&line.content);
                diff_digest.push('\n');
            }
        }
        if diff_digest.len() > SUMMARY_DIFF_LIMIT {
            diff_digest.truncate(SUMMARY_DIFF_LIMIT);
            diff_digest.push_str("\n[diff truncated]\n");
            break;
        }
    }

    let user = format!(
        "Repository: {}\nPR #{} ({} files changed)\n\n{}",
        ctx.repo_full_name,
        ctx.pr_number,
        ctx.files.len(),
        diff_digest
    );

    match model_call(deps, ctx, ModelTier::Cheap, SUMMARY_SYSTEM_PROMPT, &user).await {
        Ok(text) => match parse_summary(&text) {
            Ok(summary) => ctx.summary = Some(summary),
            Err(err) => warn!(error = %err, "summary response unparseable"),
        },
        Err(ReviewError::CostCeiling) => {}
        Err(err) => warn!(error = %err, "summary stage failed"),
    }
}

/// S2: defect and security detection with depth selection.
async fn stage_defects(deps: &Arc<ReviewDeps>, ctx: &mut ReviewContext) {
    if ctx.cancel.is_cancelled() {
        return;
    }
    set_stage(deps, &ctx.review_id, "s2_defects").await;

    let semaphore = Arc::new(Semaphore::new(deps.model_concurrency));
    let mut handles = Vec::new();

    for file in &ctx.files {
        let file_level = is_security_sensitive(&file.diff.path)
            || file.diff.hunks.len() > FILE_LEVEL_HUNK_THRESHOLD;

        if file_level {
            let prompt = format!(
                "File: {} (full changed file)\n\n{}",
                file.diff.path,
                render_file_hunks(&file.diff)
            );
            handles.push(spawn_finding_call(
                deps,
                ctx,
                semaphore.clone(),
                ModelTier::Capable,
                DEFECT_SYSTEM_PROMPT.to_string(),
                prompt,
                file.diff.path.clone(),
            ));
        } else {
            for hunk in &file.diff.hunks {
                let prompt = format!(
                    "File: {}\nHunk {}\n\n{}",
                    file.diff.path,
                    hunk.header,
                    render_hunk(hunk)
                );
                handles.push(spawn_finding_call(
                    deps,
                    ctx,
                    semaphore.clone(),
                    ModelTier::Cheap,
                    DEFECT_SYSTEM_PROMPT.to_string(),
                    prompt,
                    file.diff.path.clone(),
                ));
            }
        }
    }

    collect_findings(ctx, handles).await;
}

/// S3: cross-file impact, only on elevated risk or a signature change, and
/// only when a call-site collaborator is configured.
async fn stage_cross_file(deps: &Arc<ReviewDeps>, ctx: &mut ReviewContext) {
    if ctx.cancel.is_cancelled() {
        return;
    }
    let elevated = ctx
        .summary
        .as_ref()
        .map(|s| s.risk.is_elevated())
        .unwrap_or(false);
    let signature_change = ctx.files.iter().any(|f| detect_signature_change(&f.diff));
    if !elevated && !signature_change {
        return;
    }
    let Some(index) = deps.call_sites.clone() else {
        info!("cross-file stage skipped: no call-site collaborator");
        return;
    };
    set_stage(deps, &ctx.review_id, "s3_cross_file").await;

    let symbols: Vec<(String, String)> = ctx
        .files
        .iter()
        .flat_map(|f| {
            f.diff
                .hunks
                .iter()
                .filter_map(|h| h.enclosing_symbol.clone())
                .map(|s| (f.diff.path.clone(), s))
        })
        .collect();

    let semaphore = Arc::new(Semaphore::new(deps.model_concurrency));
    let mut handles = Vec::new();
    for (path, symbol) in symbols {
        let sites = match index.call_sites(&ctx.repo_full_name, &symbol).await {
            Ok(sites) => sites,
            Err(err) => {
                warn!(symbol = %symbol, error = %err, "call-site lookup failed");
                continue;
            }
        };
        for site in sites {
            let prompt = format!(
                "Changed symbol `{symbol}` in {path}.\nCall site in {}:\n{}\n",
                site.path, site.snippet
            );
            handles.push(spawn_finding_call(
                deps,
                ctx,
                semaphore.clone(),
                ModelTier::Cheap,
                CROSS_FILE_SYSTEM_PROMPT.to_string(),
                prompt,
                site.path.clone(),
            ));
        }
    }

    collect_findings(ctx, handles).await;
}

/// S4: style pass; its findings yield to overlapping S2 findings.
async fn stage_style(deps: &Arc<ReviewDeps>, ctx: &mut ReviewContext) {
    if ctx.cancel.is_cancelled() || !ctx.config.review.style {
        return;
    }
    set_stage(deps, &ctx.review_id, "s4_style").await;

    let guidelines = ctx
        .config
        .review
        .custom_guidelines
        .clone()
        .unwrap_or_default();

    let semaphore = Arc::new(Semaphore::new(deps.model_concurrency));
    let mut handles = Vec::new();
    for file in &ctx.files {
        for hunk in &file.diff.hunks {
            let prompt = format!(
                "{}File: {}\nHunk {}\n\n{}",
                if guidelines.is_empty() {
                    String::new()
                } else {
                    format!("Project guidelines:\n{guidelines}\n\n")
                },
                file.diff.path,
                hunk.header,
                render_hunk(hunk)
            );
            handles.push(spawn_finding_call(
                deps,
                ctx,
                semaphore.clone(),
                ModelTier::Cheap,
                STYLE_SYSTEM_PROMPT.to_string(),
                prompt,
                file.diff.path.clone(),
            ));
        }
    }

    let before = ctx.findings.len();
    let mut style_findings = Vec::new();
    for handle in handles {
        match handle.await {
            Ok(Ok(findings)) => style_findings.extend(findings),
            Ok(Err(ReviewError::CostCeiling)) => break,
            Ok(Err(err)) => warn!(error = %err, "style call failed"),
            Err(err) => warn!(error = %err, "style task panicked"),
        }
    }
    let defects = ctx.findings[..before].to_vec();
    ctx.findings
        .extend(drop_overlapping_style(style_findings, &defects));
}

/// S5: rule-based synthesis, then an optional model pare-down.
async fn stage_synthesis(deps: &Arc<ReviewDeps>, ctx: &mut ReviewContext) -> Vec<Finding> {
    set_stage(deps, &ctx.review_id, "s5_synthesis").await;

    let mut candidates = std::mem::take(&mut ctx.findings);
    resolve_positions(&ctx.files, &mut candidates);

    let outcome = synthesize(
        candidates,
        ctx.config.review.severity_threshold,
        goshawk_core::DEFAULT_MAX_FINDINGS,
    );
    let mut kept = outcome.kept;
    if outcome.dropped_invalid > 0 {
        info!(
            dropped = outcome.dropped_invalid,
            "findings dropped for null position or sub-threshold severity"
        );
    }

    if kept.len() > MODEL_PARE_THRESHOLD && !ctx.cancel.is_cancelled() {
        let listing: String = kept
            .iter()
            .enumerate()
            .map(|(i, f)| {
                format!(
                    "{i}. [{}] {}:{} {}\n",
                    f.severity.as_str(),
                    f.path,
                    f.line_start,
                    f.title
                )
            })
            .collect();
        match model_call(deps, ctx, ModelTier::Cheap, PARE_SYSTEM_PROMPT, &listing).await {
            Ok(text) => {
                if let Some(indexes) = parse_keep_list(&text) {
                    kept = kept
                        .into_iter()
                        .enumerate()
                        .filter(|(i, _)| indexes.contains(i))
                        .map(|(_, f)| f)
                        .collect();
                }
            }
            Err(ReviewError::CostCeiling) => {}
            Err(err) => warn!(error = %err, "pare-down call failed, keeping rule-based set"),
        }
    }

    kept.sort_by(|a, b| {
        a.severity
            .cmp(&b.severity)
            .then_with(|| a.path.cmp(&b.path))
            .then_with(|| a.line_start.cmp(&b.line_start))
    });
    kept
}

/// Resolve each finding's diff position and enforce the same-hunk rule.
/// Violators keep a null position and are discarded by synthesis (and
/// would be refused by the poster regardless).
fn resolve_positions(files: &[ReviewFile], findings: &mut [Finding]) {
    for finding in findings.iter_mut() {
        if finding.position.is_some() {
            continue;
        }
        let Some(file) = files.iter().find(|f| f.diff.path == finding.path) else {
            continue;
        };
        let start_hunk = file.diff.hunk_index_for_new_line(finding.line_start);
        let end_hunk = file.diff.hunk_index_for_new_line(finding.line_end);
        let (Some(start_hunk), Some(end_hunk)) = (start_hunk, end_hunk) else {
            warn!(
                path = %finding.path,
                line = finding.line_start,
                "finding outside changed hunks, dropping"
            );
            continue;
        };
        if start_hunk != end_hunk {
            warn!(
                path = %finding.path,
                start = finding.line_start,
                end = finding.line_end,
                "finding spans hunks, dropping"
            );
            continue;
        }
        // Both endpoints must be commentable lines.
        if !file.positions.contains_key(&finding.line_start) {
            continue;
        }
        let Some(&end_pos) = file.positions.get(&finding.line_end) else {
            continue;
        };
        finding.position = Some(end_pos);
    }
}

/// Build the comment batch and post it, falling back to per-comment
/// submission when the forge rejects the batch; then record everything.
async fn post_and_record(
    deps: &Arc<ReviewDeps>,
    ctx: &mut ReviewContext,
    findings: Vec<Finding>,
) -> Result<()> {
    set_stage(deps, &ctx.review_id, "posting").await;

    // Belt and braces: a null position here is a bug upstream.
    if findings.iter().any(|f| f.position.is_none()) {
        return Err(ReviewError::Invariant(
            "finding with null position reached the poster".to_string(),
        ));
    }

    let comments = to_inline_comments(&ctx.files, &findings);
    let summary_body = build_summary_body(ctx, findings.len());

    let posted = match deps
        .github
        .post_review(
            ctx.installation_id,
            &ctx.repo_full_name,
            ctx.pr_number,
            &ctx.head_sha,
            &comments,
            &summary_body,
        )
        .await
    {
        Ok(posted) => posted,
        Err(ReviewError::Validation(detail)) => {
            // The forge rejects a review batch atomically; re-post one by
            // one, dropping whatever it refuses.
            warn!(%detail, "review batch rejected, re-posting individually");
            let mut posted = Vec::new();
            for comment in &comments {
                match deps
                    .github
                    .post_single_comment(
                        ctx.installation_id,
                        &ctx.repo_full_name,
                        ctx.pr_number,
                        &ctx.head_sha,
                        comment,
                    )
                    .await
                {
                    Ok(one) => posted.push(one),
                    Err(ReviewError::Validation(detail)) => {
                        warn!(path = %comment.path, position = comment.position, %detail,
                            "comment rejected by forge, dropping");
                    }
                    Err(err) => return Err(err),
                }
            }
            posted
        }
        Err(err) => return Err(err),
    };

    // Persist: terminal status + findings atomically, then thread and
    // comment-id writes (write-then-verify: ids only after the forge
    // confirmed them).
    let finding_ids = complete_review(deps, &ctx.review_id, &findings, ctx.ledger.spent()).await?;

    let by_key: HashMap<(String, u32), i64> = posted
        .iter()
        .filter_map(|p| p.position.map(|pos| ((p.path.clone(), pos), p.id)))
        .collect();

    for (finding, finding_id) in findings.iter().zip(finding_ids.iter()) {
        let Some(position) = finding.position else {
            continue;
        };
        let Some(&comment_id) = by_key.get(&(finding.path.clone(), position)) else {
            continue;
        };
        let thread = ThreadRecord {
            comment_id,
            finding_id: Some(finding_id.clone()),
            repo_id: ctx.repo_id,
            repo_full_name: ctx.repo_full_name.clone(),
            pr_number: ctx.pr_number as i64,
            installation_id: ctx.installation_id as i64,
            path: finding.path.clone(),
            line: finding.line_end as i64,
            commit_sha: ctx.head_sha.clone(),
            cached_content: ctx.contents.get(&finding.path).cloned(),
            history: vec![ThreadTurn {
                role: "assistant".to_string(),
                content: finding.body.clone(),
            }],
        };
        let db = deps.db.clone();
        let finding_id = finding_id.clone();
        if let Ok(Err(err)) = tokio::task::spawn_blocking(move || {
            db.set_finding_comment_id(&finding_id, comment_id)?;
            db.insert_thread(&thread)
        })
        .await
        {
            warn!(error = %err, "failed to register conversation thread");
        }
    }

    info!(
        review_id = %ctx.review_id,
        findings = findings.len(),
        posted = posted.len(),
        cost_usd = ctx.ledger.spent(),
        "review complete"
    );
    Ok(())
}

async fn complete_review(
    deps: &Arc<ReviewDeps>,
    review_id: &str,
    findings: &[Finding],
    cost_usd: f64,
) -> Result<Vec<String>> {
    let db = deps.db.clone();
    let review_id = review_id.to_string();
    let findings = findings.to_vec();
    tokio::task::spawn_blocking(move || {
        db.add_review_cost(&review_id, cost_usd)?;
        db.complete_review(&review_id, &findings)
    })
    .await
    .map_err(|e| ReviewError::Transient(format!("db task panicked: {e}")))?
    .map_err(|e| ReviewError::Transient(format!("review completion failed: {e}")))
}

fn build_summary_body(ctx: &ReviewContext, finding_count: usize) -> String {
    let mut body = match &ctx.summary {
        Some(summary) => summary.summary.clone(),
        None => "Automated review of this push.".to_string(),
    };
    if let Some(summary) = &ctx.summary {
        if summary.risk == RiskLevel::High {
            body.push_str("\n\n**Risk: high.**");
        }
    }
    if finding_count == 0 {
        body.push_str("\n\nNo issues worth flagging inline.");
    }
    if ctx.ledger.was_truncated() {
        body.push_str("\n\n_Some checks were skipped because this review reached its analysis budget._");
    }
    if ctx.cancel.is_cancelled() {
        body.push_str("\n\n_Partial review: a newer push or deadline interrupted the analysis._");
    }
    body
}

/// Build forge comment descriptors from validated findings.
fn to_inline_comments(files: &[ReviewFile], findings: &[Finding]) -> Vec<InlineComment> {
    findings
        .iter()
        .filter_map(|finding| {
            let position = finding.position?;
            let start_position = if finding.line_start < finding.line_end {
                files
                    .iter()
                    .find(|f| f.diff.path == finding.path)
                    .and_then(|f| f.positions.get(&finding.line_start).copied())
                    .filter(|&start| start < position)
            } else {
                None
            };
            let mut body = format!("**{}**\n\n{}", finding.title, finding.body);
            if let Some(suggestion) = &finding.suggestion {
                body.push_str(&format!("\n\n```suggestion\n{suggestion}\n```"));
            }
            Some(InlineComment {
                path: finding.path.clone(),
                start_position,
                position,
                body,
            })
        })
        .collect()
}

/// Heuristic for S3: did any changed line alter a function signature?
fn detect_signature_change(diff: &FileDiff) -> bool {
    const SIGNATURE_PREFIXES: &[&str] = &["def ", "fn ", "func ", "function ", "pub fn ", "class "];
    diff.hunks.iter().flat_map(|h| h.lines.iter()).any(|line| {
        line.kind != goshawk_core::LineKind::Context
            && SIGNATURE_PREFIXES
                .iter()
                .any(|p| line.content.trim_start().starts_with(p))
    })
}

fn is_security_sensitive(path: &str) -> bool {
    let lowered = path.to_ascii_lowercase();
    SECURITY_SENSITIVE_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

/// Style findings that overlap a defect finding (same file, ±3 lines)
/// yield to it.
fn drop_overlapping_style(style: Vec<Finding>, defects: &[Finding]) -> Vec<Finding> {
    style
        .into_iter()
        .filter(|s| !defects.iter().any(|d| d.overlaps(s, STYLE_OVERLAP_SLACK)))
        .collect()
}

fn parse_keep_list(text: &str) -> Option<Vec<usize>> {
    #[derive(serde::Deserialize)]
    struct KeepResponse {
        keep: Vec<usize>,
    }
    serde_json::from_str::<KeepResponse>(text.trim())
        .ok()
        .map(|r| r.keep)
}

fn render_hunk(hunk: &goshawk_core::Hunk) -> String {
    hunk.lines
        .iter()
        .map(|line| {
            let marker = match line.kind {
                goshawk_core::LineKind::Added => '+',
                goshawk_core::LineKind::Removed => '-',
                goshawk_core::LineKind::Context => ' ',
            };
            match line.new_line {
                Some(n) => format!("{n:>5} {marker} {}\n", line.content),
                None => format!("      {marker} {}\n", line.content),
            }
        })
        .collect()
}

fn render_file_hunks(diff: &FileDiff) -> String {
    diff.hunks
        .iter()
        .map(|h| format!("{}\n{}", h.header, render_hunk(h)))
        .collect()
}

/// Charge the ledger, make the call, settle to actual cost.
async fn model_call(
    deps: &Arc<ReviewDeps>,
    ctx: &ReviewContext,
    tier: ModelTier,
    system: &str,
    user: &str,
) -> Result<String> {
    let estimate = estimate_cost(tier, system.len() + user.len());
    ctx.ledger.try_charge(estimate)?;
    match deps.model.complete(tier, system, user).await {
        Ok(completion) => {
            ctx.ledger.settle(estimate, completion.cost_usd);
            Ok(completion.text)
        }
        Err(err) => Err(err),
    }
}

/// Spawn one bounded-concurrency finding call for S2/S3/S4.
fn spawn_finding_call(
    deps: &Arc<ReviewDeps>,
    ctx: &ReviewContext,
    semaphore: Arc<Semaphore>,
    tier: ModelTier,
    system: String,
    user: String,
    path: String,
) -> tokio::task::JoinHandle<Result<Vec<Finding>>> {
    let model = deps.model.clone();
    let ledger = ctx.ledger.clone();
    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        if cancel.is_cancelled() {
            return Err(ReviewError::Cancelled);
        }
        let _permit = semaphore
            .acquire()
            .await
            .map_err(|_| ReviewError::Cancelled)?;

        let estimate = estimate_cost(tier, system.len() + user.len());
        ledger.try_charge(estimate)?;
        let completion = model.complete(tier, &system, &user).await?;
        ledger.settle(estimate, completion.cost_usd);

        let raw = parse_findings(&completion.text)?;
        Ok(raw.into_iter().map(|r| r.into_finding(&path)).collect())
    })
}

async fn collect_findings(
    ctx: &mut ReviewContext,
    handles: Vec<tokio::task::JoinHandle<Result<Vec<Finding>>>>,
) {
    for handle in handles {
        match handle.await {
            Ok(Ok(findings)) => ctx.findings.extend(findings),
            Ok(Err(ReviewError::CostCeiling)) => {
                // Remaining calls will fail the same way; keep draining so
                // tasks are joined, but stop logging each one.
                continue;
            }
            Ok(Err(ReviewError::Cancelled)) => continue,
            Ok(Err(err)) => warn!(error = %err, "finding call failed"),
            Err(err) => warn!(error = %err, "finding task panicked"),
        }
    }
}
