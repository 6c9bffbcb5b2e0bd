//! Multi-lane job scheduler.
//!
//! Three durable lanes (fast, slow, index) with independent consumer pools
//! plus a dead-letter sink, all backed by the `jobs` table. The database
//! claim enforces per-(repo, pr) serialization; this module owns the
//! runtime half: worker loops, retry with exponential backoff and jitter,
//! soft/hard deadlines, cooperative cancellation, and lease reaping for
//! at-least-once redelivery.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use goshawk_core::Lane;

use crate::db::{Database, JobKind, JobRecord};
use crate::error::ReviewError;

/// How often an idle worker polls its lane.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Slack added to the hard deadline when computing the claim lease, so a
/// healthy worker never loses its own job to the reaper.
const LEASE_SLACK_SECS: u64 = 30;

/// Cadence of the maintenance loop (lease reaping, idempotency sweeps).
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            initial: Duration::from_secs(60),
            cap: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff for the given (1-based) failed attempt, capped,
    /// with `jitter_frac` in [0, 1] adding up to 25% on top.
    pub fn backoff(&self, attempt: u32, jitter_frac: f64) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self.initial.saturating_mul(2u32.saturating_pow(exp));
        let base = base.min(self.cap);
        let jittered = base.mul_f64(1.0 + 0.25 * jitter_frac.clamp(0.0, 1.0));
        jittered.min(self.cap)
    }
}

/// What a worker does with a claimed job. Implemented by the review
/// orchestrator, the reply handler, and the index worker.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: JobRecord, cancel: CancellationToken) -> Result<(), ReviewError>;
}

pub struct Scheduler {
    db: Arc<Database>,
    retry: RetryPolicy,
    soft_deadline: Duration,
    hard_deadline: Duration,
    poll_interval: Duration,
    shutdown: CancellationToken,
    /// Cancellation handles for running jobs, keyed by job id, so a newer
    /// push can cooperatively cancel an in-flight review.
    running: Mutex<HashMap<i64, CancellationToken>>,
}

impl Scheduler {
    pub fn new(
        db: Arc<Database>,
        retry: RetryPolicy,
        soft_deadline: Duration,
        hard_deadline: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Scheduler {
            db,
            retry,
            soft_deadline,
            hard_deadline,
            poll_interval: DEFAULT_POLL_INTERVAL,
            shutdown,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Shrink the idle poll interval (tests).
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Enqueue a review task, cancelling any sibling task for the same pull
    /// request with an older head: the newer push supersedes it.
    #[allow(clippy::too_many_arguments)]
    pub async fn enqueue_review(
        self: &Arc<Self>,
        lane: Lane,
        installation_id: i64,
        repo_id: i64,
        repo_full_name: &str,
        pr_number: i64,
        head_sha: &str,
        base_sha: &str,
    ) -> anyhow::Result<i64> {
        let db = self.db.clone();
        let (repo_full_name, head_sha, base_sha) = (
            repo_full_name.to_string(),
            head_sha.to_string(),
            base_sha.to_string(),
        );
        let scheduler = self.clone();
        tokio::task::spawn_blocking(move || {
            let to_signal = db.supersede_older_jobs(repo_id, pr_number, &head_sha)?;
            for job_id in to_signal {
                scheduler.signal_cancellation(job_id);
            }
            db.enqueue_job(
                lane,
                JobKind::Review,
                installation_id,
                repo_id,
                &repo_full_name,
                pr_number,
                &head_sha,
                &base_sha,
                None,
            )
        })
        .await?
    }

    /// Enqueue a conversation-reply task on the fast lane.
    #[allow(clippy::too_many_arguments)]
    pub async fn enqueue_reply(
        self: &Arc<Self>,
        installation_id: i64,
        repo_id: i64,
        repo_full_name: &str,
        pr_number: i64,
        head_sha: &str,
        payload: &str,
    ) -> anyhow::Result<i64> {
        let db = self.db.clone();
        let (repo_full_name, head_sha, payload) = (
            repo_full_name.to_string(),
            head_sha.to_string(),
            payload.to_string(),
        );
        tokio::task::spawn_blocking(move || {
            db.enqueue_job(
                Lane::Fast,
                JobKind::Reply,
                installation_id,
                repo_id,
                &repo_full_name,
                pr_number,
                &head_sha,
                "",
                Some(&payload),
            )
        })
        .await?
    }

    /// Enqueue a repository indexing task on the index lane, which is kept
    /// apart from review lanes so a repo-wide walk cannot starve reviews.
    pub async fn enqueue_index(
        self: &Arc<Self>,
        installation_id: i64,
        repo_id: i64,
        repo_full_name: &str,
    ) -> anyhow::Result<i64> {
        let db = self.db.clone();
        let repo_full_name = repo_full_name.to_string();
        tokio::task::spawn_blocking(move || {
            db.enqueue_job(
                Lane::Index,
                JobKind::Index,
                installation_id,
                repo_id,
                &repo_full_name,
                0,
                "",
                "",
                None,
            )
        })
        .await?
    }

    /// Fire the cooperative cancellation token of a running job, if any.
    pub fn signal_cancellation(&self, job_id: i64) {
        if let Some(token) = self.running.lock().expect("lock poisoned").get(&job_id) {
            info!(job_id, "signalling cooperative cancellation");
            token.cancel();
        }
    }

    /// Spawn `count` workers consuming one lane.
    pub fn spawn_workers(
        self: &Arc<Self>,
        lane: Lane,
        count: usize,
        executor: Arc<dyn JobExecutor>,
    ) {
        for worker_index in 0..count {
            let scheduler = self.clone();
            let executor = executor.clone();
            tokio::spawn(async move {
                scheduler.worker_loop(lane, worker_index, executor).await;
            });
        }
    }

    /// Spawn the maintenance loop: lease reaping (crash redelivery) and
    /// idempotency-key sweeping.
    pub fn spawn_maintenance(self: &Arc<Self>) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = scheduler.shutdown.cancelled() => break,
                    _ = sleep(MAINTENANCE_INTERVAL) => {}
                }
                let db = scheduler.db.clone();
                let result = tokio::task::spawn_blocking(move || {
                    let reaped = db.reap_expired_leases()?;
                    let swept = db.sweep_expired_idempotency_keys()?;
                    anyhow::Ok((reaped, swept))
                })
                .await;
                match result {
                    Ok(Ok((reaped, _swept))) if reaped > 0 => {
                        warn!(reaped, "requeued jobs with expired leases");
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => error!(error = %err, "maintenance sweep failed"),
                    Err(err) => error!(error = %err, "maintenance task panicked"),
                }
            }
        });
    }

    async fn worker_loop(self: Arc<Self>, lane: Lane, worker_index: usize, executor: Arc<dyn JobExecutor>) {
        info!(lane = lane.as_str(), worker_index, "worker started");
        let lease_secs = self.hard_deadline.as_secs() + LEASE_SLACK_SECS;

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let db = self.db.clone();
            let claimed = tokio::task::spawn_blocking(move || db.claim_job(lane, lease_secs)).await;

            let job = match claimed {
                Ok(Ok(Some(job))) => job,
                Ok(Ok(None)) => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = sleep(self.poll_interval) => continue,
                    }
                }
                Ok(Err(err)) => {
                    error!(lane = lane.as_str(), error = %err, "claim failed");
                    sleep(self.poll_interval).await;
                    continue;
                }
                Err(join_err) => {
                    error!(lane = lane.as_str(), error = %join_err, "claim task panicked");
                    sleep(self.poll_interval).await;
                    continue;
                }
            };

            self.run_job(lane, job, executor.as_ref()).await;
        }
        info!(lane = lane.as_str(), worker_index, "worker stopped");
    }

    async fn run_job(&self, lane: Lane, job: JobRecord, executor: &dyn JobExecutor) {
        let job_id = job.id;
        let attempt = job.attempts as u32;
        info!(
            lane = lane.as_str(),
            job_id,
            kind = job.kind.as_str(),
            repo = %job.repo_full_name,
            pr = job.pr_number,
            attempt,
            "job started"
        );

        let cancel = self.shutdown.child_token();
        self.running
            .lock()
            .expect("lock poisoned")
            .insert(job_id, cancel.clone());

        // The soft deadline fires the cooperative token: in-flight calls
        // finish, no new stages start, partial results are synthesized.
        let soft_timer = {
            let cancel = cancel.clone();
            let soft = self.soft_deadline;
            tokio::spawn(async move {
                sleep(soft).await;
                cancel.cancel();
            })
        };

        let outcome =
            tokio::time::timeout(self.hard_deadline, executor.execute(job.clone(), cancel.clone()))
                .await;
        soft_timer.abort();
        self.running.lock().expect("lock poisoned").remove(&job_id);

        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(ReviewError::Cancelled),
        };

        let db = self.db.clone();
        let retry = self.retry.clone();
        let finish = tokio::task::spawn_blocking(move || match result {
            Ok(()) => {
                info!(job_id, "job completed");
                db.complete_job(job_id)
            }
            Err(ReviewError::Cancelled) => {
                info!(job_id, "job cancelled");
                db.cancel_job(job_id, "cancelled")
            }
            Err(err) if err.is_retryable() && attempt <= retry.max_retries => {
                let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
                let mut delay = retry.backoff(attempt, jitter);
                // A rate-limit reset further out than the backoff wins.
                if let ReviewError::RateLimited { reset_at: Some(at) } = &err {
                    let until_reset = (*at - Utc::now()).to_std().unwrap_or_default();
                    delay = delay.max(until_reset);
                }
                warn!(job_id, attempt, delay_secs = delay.as_secs(), error = %err, "job will retry");
                db.retry_job(
                    job_id,
                    Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default(),
                    &err.to_string(),
                )
            }
            Err(err) => {
                error!(job_id, attempt, kind = err.kind(), error = %err, "job dead-lettered");
                db.dead_letter_job(job_id, &format!("{}: {}", err.kind(), err))
            }
        })
        .await;

        match finish {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(job_id, error = %err, "failed to record job outcome"),
            Err(err) => error!(job_id, error = %err, "job outcome task panicked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedExecutor {
        calls: AtomicUsize,
        /// Errors to return before succeeding.
        failures: Vec<ReviewError>,
    }

    impl ScriptedExecutor {
        fn new(failures: Vec<ReviewError>) -> Self {
            ScriptedExecutor {
                calls: AtomicUsize::new(0),
                failures,
            }
        }
    }

    #[async_trait]
    impl JobExecutor for ScriptedExecutor {
        async fn execute(
            &self,
            _job: JobRecord,
            _cancel: CancellationToken,
        ) -> Result<(), ReviewError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            match self.failures.get(call) {
                Some(ReviewError::Transient(msg)) => Err(ReviewError::Transient(msg.clone())),
                Some(ReviewError::Invariant(msg)) => Err(ReviewError::Invariant(msg.clone())),
                Some(_) => Err(ReviewError::Transient("scripted".to_string())),
                None => Ok(()),
            }
        }
    }

    struct BlockUntilCancelled;

    #[async_trait]
    impl JobExecutor for BlockUntilCancelled {
        async fn execute(
            &self,
            _job: JobRecord,
            cancel: CancellationToken,
        ) -> Result<(), ReviewError> {
            cancel.cancelled().await;
            Err(ReviewError::Cancelled)
        }
    }

    fn test_scheduler(db: Arc<Database>, retry: RetryPolicy) -> Arc<Scheduler> {
        Arc::new(
            Scheduler::new(
                db,
                retry,
                Duration::from_secs(60),
                Duration::from_secs(120),
                CancellationToken::new(),
            )
            .with_poll_interval(Duration::from_millis(10)),
        )
    }

    async fn wait_for<F: Fn() -> bool>(predicate: F) {
        for _ in 0..200 {
            if predicate() {
                return;
            }
            sleep(Duration::from_millis(25)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 3,
            initial: Duration::from_secs(60),
            cap: Duration::from_secs(300),
        };
        assert_eq!(policy.backoff(1, 0.0), Duration::from_secs(60));
        assert_eq!(policy.backoff(2, 0.0), Duration::from_secs(120));
        assert_eq!(policy.backoff(3, 0.0), Duration::from_secs(240));
        // Capped.
        assert_eq!(policy.backoff(4, 0.0), Duration::from_secs(300));
        assert_eq!(policy.backoff(30, 0.0), Duration::from_secs(300));
    }

    #[test]
    fn backoff_jitter_is_bounded() {
        let policy = RetryPolicy::default();
        let base = policy.backoff(1, 0.0);
        let jittered = policy.backoff(1, 1.0);
        assert!(jittered >= base);
        assert!(jittered <= base.mul_f64(1.25));
    }

    #[tokio::test]
    async fn job_completes_on_success() {
        let db = Arc::new(Database::new_in_memory().unwrap());
        let scheduler = test_scheduler(db.clone(), RetryPolicy::default());
        let executor = Arc::new(ScriptedExecutor::new(vec![]));

        scheduler
            .enqueue_review(Lane::Fast, 1, 7, "acme/w", 1, "h1", "b1")
            .await
            .unwrap();
        scheduler.spawn_workers(Lane::Fast, 1, executor.clone());

        wait_for(|| executor.calls.load(Ordering::SeqCst) == 1).await;
        wait_for(|| db.queue_depth(Lane::Fast).unwrap() == 0).await;
    }

    #[tokio::test]
    async fn transient_failure_retries_then_succeeds() {
        let db = Arc::new(Database::new_in_memory().unwrap());
        let retry = RetryPolicy {
            max_retries: 3,
            initial: Duration::from_millis(10),
            cap: Duration::from_millis(50),
        };
        let scheduler = test_scheduler(db.clone(), retry);
        let executor = Arc::new(ScriptedExecutor::new(vec![ReviewError::Transient(
            "flaky".to_string(),
        )]));

        scheduler
            .enqueue_review(Lane::Fast, 1, 7, "acme/w", 1, "h1", "b1")
            .await
            .unwrap();
        scheduler.spawn_workers(Lane::Fast, 1, executor.clone());

        wait_for(|| executor.calls.load(Ordering::SeqCst) >= 2).await;
        wait_for(|| db.queue_depth(Lane::Fast).unwrap() == 0).await;
        assert_eq!(db.dead_letter_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn non_retryable_failure_dead_letters() {
        let db = Arc::new(Database::new_in_memory().unwrap());
        let scheduler = test_scheduler(db.clone(), RetryPolicy::default());
        let executor = Arc::new(ScriptedExecutor::new(vec![ReviewError::Invariant(
            "finding with null position reached the poster".to_string(),
        )]));

        scheduler
            .enqueue_review(Lane::Fast, 1, 7, "acme/w", 1, "h1", "b1")
            .await
            .unwrap();
        scheduler.spawn_workers(Lane::Fast, 1, executor.clone());

        wait_for(|| db.dead_letter_count().unwrap() == 1).await;
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let db = Arc::new(Database::new_in_memory().unwrap());
        let retry = RetryPolicy {
            max_retries: 2,
            initial: Duration::from_millis(5),
            cap: Duration::from_millis(10),
        };
        let scheduler = test_scheduler(db.clone(), retry);
        // Always fails transiently.
        let executor = Arc::new(ScriptedExecutor::new(vec![
            ReviewError::Transient("a".to_string()),
            ReviewError::Transient("b".to_string()),
            ReviewError::Transient("c".to_string()),
            ReviewError::Transient("d".to_string()),
        ]));

        scheduler
            .enqueue_review(Lane::Fast, 1, 7, "acme/w", 1, "h1", "b1")
            .await
            .unwrap();
        scheduler.spawn_workers(Lane::Fast, 1, executor.clone());

        wait_for(|| db.dead_letter_count().unwrap() == 1).await;
        // Initial attempt plus max_retries.
        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn newer_head_supersedes_running_job() {
        let db = Arc::new(Database::new_in_memory().unwrap());
        let scheduler = test_scheduler(db.clone(), RetryPolicy::default());

        let old_job = scheduler
            .enqueue_review(Lane::Fast, 1, 7, "acme/w", 1, "old-head", "b1")
            .await
            .unwrap();
        // The executor holds the job open until its token fires.
        scheduler.spawn_workers(Lane::Fast, 1, Arc::new(BlockUntilCancelled));

        wait_for(|| db.job_status(old_job).unwrap().as_deref() == Some("running")).await;

        // A newer push for the same PR cancels the in-flight older head.
        scheduler
            .enqueue_review(Lane::Fast, 1, 7, "acme/w", 1, "new-head", "b1")
            .await
            .unwrap();
        wait_for(|| db.job_status(old_job).unwrap().as_deref() == Some("cancelled")).await;
    }

    #[tokio::test]
    async fn soft_deadline_fires_cancellation() {
        let db = Arc::new(Database::new_in_memory().unwrap());
        let shutdown = CancellationToken::new();
        let scheduler = Arc::new(
            Scheduler::new(
                db.clone(),
                RetryPolicy::default(),
                Duration::from_millis(30), // soft
                Duration::from_secs(60),   // hard
                shutdown,
            )
            .with_poll_interval(Duration::from_millis(10)),
        );

        let job_id = scheduler
            .enqueue_review(Lane::Fast, 1, 7, "acme/w", 1, "h1", "b1")
            .await
            .unwrap();
        scheduler.spawn_workers(Lane::Fast, 1, Arc::new(BlockUntilCancelled));

        // The executor only returns once its token fires; a cancelled
        // terminal state proves the soft deadline did it.
        wait_for(|| db.job_status(job_id).unwrap().as_deref() == Some("cancelled")).await;
    }
}
