//! SQLite persistence for installations, repositories, reviews, findings,
//! conversation threads, queue jobs, and idempotency reservations.
//!
//! Uses a `Mutex<Connection>` because `rusqlite::Connection` is not `Sync`.
//! Callers on async paths should wrap operations in
//! `tokio::task::spawn_blocking`.
//!
//! # Schema Versioning
//!
//! The database uses SQLite's `user_version` pragma to track schema
//! versions. When the schema changes, increment `SCHEMA_VERSION` and add a
//! migration function in `run_migrations`.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

use goshawk_core::{Category, Finding, Lane, Severity};

/// Current schema version. Increment when making schema changes.
const SCHEMA_VERSION: i32 = 1;

pub fn now_ts() -> String {
    format_ts(Utc::now())
}

pub fn format_ts(at: DateTime<Utc>) -> String {
    // Fixed precision so stored timestamps compare lexicographically.
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Queued => "queued",
            ReviewStatus::Processing => "processing",
            ReviewStatus::Completed => "completed",
            ReviewStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<ReviewStatus> {
        match s {
            "queued" => Ok(ReviewStatus::Queued),
            "processing" => Ok(ReviewStatus::Processing),
            "completed" => Ok(ReviewStatus::Completed),
            "failed" => Ok(ReviewStatus::Failed),
            other => Err(anyhow!("Unknown review status: {}", other)),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ReviewStatus::Completed | ReviewStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexStatus {
    Pending,
    Indexing,
    Ready,
    Failed,
}

impl IndexStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexStatus::Pending => "pending",
            IndexStatus::Indexing => "indexing",
            IndexStatus::Ready => "ready",
            IndexStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<IndexStatus> {
        match s {
            "pending" => Ok(IndexStatus::Pending),
            "indexing" => Ok(IndexStatus::Indexing),
            "ready" => Ok(IndexStatus::Ready),
            "failed" => Ok(IndexStatus::Failed),
            other => Err(anyhow!("Unknown index status: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RepositoryRecord {
    pub id: i64,
    pub installation_id: i64,
    pub full_name: String,
    pub default_branch: String,
    pub index_status: IndexStatus,
    pub last_indexed_sha: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReviewRecord {
    pub id: String,
    pub repo_id: i64,
    pub pr_number: i64,
    pub head_sha: String,
    pub base_sha: String,
    pub status: ReviewStatus,
    pub stage: Option<String>,
    pub findings_count: i64,
    pub cost_usd: f64,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FindingRecord {
    pub id: String,
    pub review_id: String,
    pub finding: Finding,
    pub comment_id: Option<i64>,
    pub applied: bool,
    pub dismissed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ThreadTurn {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct ThreadRecord {
    /// Forge comment id of the root inline comment.
    pub comment_id: i64,
    pub finding_id: Option<String>,
    pub repo_id: i64,
    pub repo_full_name: String,
    pub pr_number: i64,
    pub installation_id: i64,
    pub path: String,
    pub line: i64,
    /// Commit the finding was posted against. Pinned: never advanced to the
    /// latest head.
    pub commit_sha: String,
    pub cached_content: Option<String>,
    pub history: Vec<ThreadTurn>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Review,
    Reply,
    Index,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Review => "review",
            JobKind::Reply => "reply",
            JobKind::Index => "index",
        }
    }

    pub fn parse(s: &str) -> Result<JobKind> {
        match s {
            "review" => Ok(JobKind::Review),
            "reply" => Ok(JobKind::Reply),
            "index" => Ok(JobKind::Index),
            other => Err(anyhow!("Unknown job kind: {}", other)),
        }
    }
}

fn lane_from_str(s: &str) -> Result<Lane> {
    match s {
        "fast" => Ok(Lane::Fast),
        "slow" => Ok(Lane::Slow),
        "index" => Ok(Lane::Index),
        other => Err(anyhow!("Unknown lane: {}", other)),
    }
}

/// A task descriptor as handed to workers. Minimal by design: the worker
/// re-fetches everything else from the forge.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: i64,
    pub lane: Lane,
    pub kind: JobKind,
    pub installation_id: i64,
    pub repo_id: i64,
    pub repo_full_name: String,
    pub pr_number: i64,
    pub head_sha: String,
    pub base_sha: String,
    /// Kind-specific JSON payload (reply jobs carry the comment event).
    pub payload: Option<String>,
    pub attempts: i64,
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database at {:?}", path))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");

        let current_version: i32 =
            conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

        if current_version > SCHEMA_VERSION {
            anyhow::bail!(
                "Database schema version {} is newer than supported version {}. \
                 Please upgrade the application.",
                current_version,
                SCHEMA_VERSION
            );
        }

        if current_version < SCHEMA_VERSION {
            Self::run_migrations(&conn, current_version)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }

        Ok(())
    }

    fn run_migrations(conn: &Connection, from_version: i32) -> Result<()> {
        if from_version < 1 {
            Self::migrate_v0_to_v1(conn)?;
        }
        Ok(())
    }

    fn migrate_v0_to_v1(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS installations (
                id INTEGER PRIMARY KEY,
                account_login TEXT NOT NULL,
                account_type TEXT NOT NULL,
                config TEXT NOT NULL DEFAULT '{}',
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS repositories (
                id INTEGER PRIMARY KEY,
                installation_id INTEGER NOT NULL,
                full_name TEXT NOT NULL,
                default_branch TEXT NOT NULL DEFAULT 'main',
                index_status TEXT NOT NULL DEFAULT 'pending' CHECK(index_status IN (
                    'pending', 'indexing', 'ready', 'failed'
                )),
                last_indexed_sha TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_repositories_installation
            ON repositories(installation_id);

            CREATE TABLE IF NOT EXISTS reviews (
                id TEXT PRIMARY KEY,
                repo_id INTEGER NOT NULL,
                pr_number INTEGER NOT NULL,
                head_sha TEXT NOT NULL,
                base_sha TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'queued' CHECK(status IN (
                    'queued', 'processing', 'completed', 'failed'
                )),
                stage TEXT,
                findings_count INTEGER NOT NULL DEFAULT 0,
                cost_usd REAL NOT NULL DEFAULT 0,
                enqueued_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                error_message TEXT
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_reviews_repo_pr_head
            ON reviews(repo_id, pr_number, head_sha);

            CREATE TABLE IF NOT EXISTS findings (
                id TEXT PRIMARY KEY,
                review_id TEXT NOT NULL,
                path TEXT NOT NULL,
                line_start INTEGER NOT NULL,
                line_end INTEGER NOT NULL,
                position INTEGER,
                severity TEXT NOT NULL,
                category TEXT NOT NULL,
                title TEXT NOT NULL,
                body TEXT NOT NULL,
                suggestion TEXT,
                confidence REAL NOT NULL DEFAULT 0,
                comment_id INTEGER,
                applied INTEGER NOT NULL DEFAULT 0,
                dismissed INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_findings_review ON findings(review_id);

            CREATE TABLE IF NOT EXISTS conversation_threads (
                comment_id INTEGER PRIMARY KEY,
                finding_id TEXT,
                repo_id INTEGER NOT NULL,
                repo_full_name TEXT NOT NULL,
                pr_number INTEGER NOT NULL,
                installation_id INTEGER NOT NULL,
                path TEXT NOT NULL,
                line INTEGER NOT NULL,
                commit_sha TEXT NOT NULL,
                cached_content TEXT,
                history TEXT NOT NULL DEFAULT '[]',
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                lane TEXT NOT NULL CHECK(lane IN ('fast', 'slow', 'index')),
                kind TEXT NOT NULL CHECK(kind IN ('review', 'reply', 'index')),
                installation_id INTEGER NOT NULL,
                repo_id INTEGER NOT NULL,
                repo_full_name TEXT NOT NULL,
                pr_number INTEGER NOT NULL,
                head_sha TEXT NOT NULL,
                base_sha TEXT NOT NULL,
                payload TEXT,
                status TEXT NOT NULL DEFAULT 'queued' CHECK(status IN (
                    'queued', 'running', 'completed', 'cancelled', 'dead'
                )),
                attempts INTEGER NOT NULL DEFAULT 0,
                run_after TEXT NOT NULL,
                lease_expires_at TEXT,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_lane_status ON jobs(lane, status);
            CREATE INDEX IF NOT EXISTS idx_jobs_repo_pr ON jobs(repo_id, pr_number);

            CREATE TABLE IF NOT EXISTS idempotency_keys (
                key TEXT PRIMARY KEY,
                expires_at TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            "#,
        )
        .context("Failed to create initial schema (v0 -> v1)")?;

        Ok(())
    }

    // =========================================================================
    // Installations and repositories
    // =========================================================================

    pub fn upsert_installation(&self, id: i64, account_login: &str, account_type: &str) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "INSERT INTO installations (id, account_login, account_type, is_active, created_at) \
             VALUES (?1, ?2, ?3, 1, ?4) \
             ON CONFLICT (id) DO UPDATE SET \
                account_login = excluded.account_login, \
                account_type = excluded.account_type, \
                is_active = 1",
            rusqlite::params![id, account_login, account_type, now_ts()],
        )
        .context("Failed to upsert installation")?;
        Ok(())
    }

    /// Logical delete: repositories become unreachable but review history is
    /// retained.
    pub fn deactivate_installation(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "UPDATE installations SET is_active = 0 WHERE id = ?1",
            rusqlite::params![id],
        )
        .context("Failed to deactivate installation")?;
        Ok(())
    }

    pub fn installation_is_active(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let active: Option<bool> = conn
            .query_row(
                "SELECT is_active FROM installations WHERE id = ?1",
                rusqlite::params![id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query installation")?;
        Ok(active.unwrap_or(false))
    }

    pub fn upsert_repository(
        &self,
        id: i64,
        installation_id: i64,
        full_name: &str,
        default_branch: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "INSERT INTO repositories (id, installation_id, full_name, default_branch, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT (id) DO UPDATE SET \
                installation_id = excluded.installation_id, \
                full_name = excluded.full_name, \
                default_branch = excluded.default_branch",
            rusqlite::params![id, installation_id, full_name, default_branch, now_ts()],
        )
        .context("Failed to upsert repository")?;
        Ok(())
    }

    pub fn remove_repository(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "DELETE FROM repositories WHERE id = ?1",
            rusqlite::params![id],
        )
        .context("Failed to remove repository")?;
        Ok(())
    }

    pub fn set_repo_index_status(
        &self,
        id: i64,
        status: IndexStatus,
        last_indexed_sha: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "UPDATE repositories SET index_status = ?2, \
             last_indexed_sha = COALESCE(?3, last_indexed_sha) WHERE id = ?1",
            rusqlite::params![id, status.as_str(), last_indexed_sha],
        )
        .context("Failed to set repository index status")?;
        Ok(())
    }

    pub fn get_repository(&self, id: i64) -> Result<Option<RepositoryRecord>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.query_row(
            "SELECT id, installation_id, full_name, default_branch, index_status, last_indexed_sha \
             FROM repositories WHERE id = ?1",
            rusqlite::params![id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            },
        )
        .optional()
        .context("Failed to query repository")?
        .map(|(id, installation_id, full_name, default_branch, status, sha)| {
            Ok(RepositoryRecord {
                id,
                installation_id,
                full_name,
                default_branch,
                index_status: IndexStatus::parse(&status)?,
                last_indexed_sha: sha,
            })
        })
        .transpose()
    }

    // =========================================================================
    // Reviews and findings
    // =========================================================================

    /// Create (or resume) the review row for a (repo, pr, head) attempt.
    ///
    /// The unique index keeps this to one row per key. A non-terminal
    /// existing row is returned as-is: under at-least-once delivery a
    /// redelivered task resumes the same attempt. A terminal row (re-review
    /// after the idempotency TTL lapsed) is reset to queued and its id
    /// reused.
    pub fn create_review(
        &self,
        repo_id: i64,
        pr_number: i64,
        head_sha: &str,
        base_sha: &str,
    ) -> Result<String> {
        let conn = self.conn.lock().expect("mutex poisoned");

        let existing: Option<(String, String)> = conn
            .query_row(
                "SELECT id, status FROM reviews \
                 WHERE repo_id = ?1 AND pr_number = ?2 AND head_sha = ?3",
                rusqlite::params![repo_id, pr_number, head_sha],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Failed to query existing review")?;

        if let Some((id, status)) = existing {
            if !ReviewStatus::parse(&status)?.is_terminal() {
                return Ok(id);
            }
            conn.execute(
                "UPDATE reviews SET status = 'queued', stage = NULL, findings_count = 0, \
                 cost_usd = 0, enqueued_at = ?2, started_at = NULL, completed_at = NULL, \
                 error_message = NULL WHERE id = ?1",
                rusqlite::params![id, now_ts()],
            )
            .context("Failed to reset terminal review")?;
            return Ok(id);
        }

        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO reviews (id, repo_id, pr_number, head_sha, base_sha, status, enqueued_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, 'queued', ?6)",
            rusqlite::params![id, repo_id, pr_number, head_sha, base_sha, now_ts()],
        )
        .context("Failed to insert review")?;
        Ok(id)
    }

    pub fn mark_review_processing(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "UPDATE reviews SET status = 'processing', started_at = ?2 WHERE id = ?1",
            rusqlite::params![id, now_ts()],
        )
        .context("Failed to mark review processing")?;
        Ok(())
    }

    pub fn set_review_stage(&self, id: &str, stage: &str) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "UPDATE reviews SET stage = ?2 WHERE id = ?1",
            rusqlite::params![id, stage],
        )
        .context("Failed to set review stage")?;
        Ok(())
    }

    /// Record model spend. The accumulated figure is monotone by
    /// construction: deltas are non-negative.
    pub fn add_review_cost(&self, id: &str, delta_usd: f64) -> Result<()> {
        if delta_usd < 0.0 {
            anyhow::bail!("Cost delta must be non-negative, got {}", delta_usd);
        }
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "UPDATE reviews SET cost_usd = cost_usd + ?2 WHERE id = ?1",
            rusqlite::params![id, delta_usd],
        )
        .context("Failed to add review cost")?;
        Ok(())
    }

    /// Transition a review to completed together with its findings, in one
    /// transaction. A completed review with missing findings is forbidden,
    /// so the two writes are atomic.
    pub fn complete_review(&self, id: &str, findings: &[Finding]) -> Result<Vec<String>> {
        let mut conn = self.conn.lock().expect("mutex poisoned");
        let tx = conn.transaction().context("Failed to begin transaction")?;

        let mut finding_ids = Vec::with_capacity(findings.len());
        for finding in findings {
            let finding_id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO findings (id, review_id, path, line_start, line_end, position, \
                 severity, category, title, body, suggestion, confidence, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                rusqlite::params![
                    finding_id,
                    id,
                    finding.path,
                    finding.line_start,
                    finding.line_end,
                    finding.position,
                    finding.severity.as_str(),
                    finding.category.as_str(),
                    finding.title,
                    finding.body,
                    finding.suggestion,
                    finding.confidence as f64,
                    now_ts(),
                ],
            )
            .context("Failed to insert finding")?;
            finding_ids.push(finding_id);
        }

        let updated = tx
            .execute(
                "UPDATE reviews SET status = 'completed', findings_count = ?2, \
                 completed_at = ?3 WHERE id = ?1",
                rusqlite::params![id, findings.len() as i64, now_ts()],
            )
            .context("Failed to complete review")?;
        if updated == 0 {
            anyhow::bail!("No review row with id {}", id);
        }

        tx.commit().context("Failed to commit review completion")?;
        Ok(finding_ids)
    }

    pub fn fail_review(&self, id: &str, error_message: &str) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "UPDATE reviews SET status = 'failed', completed_at = ?2, error_message = ?3 \
             WHERE id = ?1",
            rusqlite::params![id, now_ts(), error_message],
        )
        .context("Failed to fail review")?;
        Ok(())
    }

    pub fn get_review(&self, id: &str) -> Result<Option<ReviewRecord>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.query_row(
            "SELECT id, repo_id, pr_number, head_sha, base_sha, status, stage, \
             findings_count, cost_usd, error_message FROM reviews WHERE id = ?1",
            rusqlite::params![id],
            row_to_review,
        )
        .optional()
        .context("Failed to query review")?
        .map(|(record, status)| {
            Ok(ReviewRecord {
                status: ReviewStatus::parse(&status)?,
                ..record
            })
        })
        .transpose()
    }

    /// Count of non-terminal reviews for a (repo, pr, head) key. Used by
    /// tests and the admin surface to check the at-most-one invariant.
    pub fn active_review_count(&self, repo_id: i64, pr_number: i64, head_sha: &str) -> Result<i64> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.query_row(
            "SELECT COUNT(*) FROM reviews WHERE repo_id = ?1 AND pr_number = ?2 \
             AND head_sha = ?3 AND status IN ('queued', 'processing')",
            rusqlite::params![repo_id, pr_number, head_sha],
            |row| row.get(0),
        )
        .context("Failed to count active reviews")
    }

    pub fn set_finding_comment_id(&self, finding_id: &str, comment_id: i64) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "UPDATE findings SET comment_id = ?2 WHERE id = ?1",
            rusqlite::params![finding_id, comment_id],
        )
        .context("Failed to set finding comment id")?;
        Ok(())
    }

    pub fn set_finding_dismissed(&self, finding_id: &str) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "UPDATE findings SET dismissed = 1 WHERE id = ?1",
            rusqlite::params![finding_id],
        )
        .context("Failed to dismiss finding")?;
        Ok(())
    }

    pub fn list_findings(&self, review_id: &str) -> Result<Vec<FindingRecord>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT id, review_id, path, line_start, line_end, position, severity, \
                 category, title, body, suggestion, confidence, comment_id, applied, dismissed \
                 FROM findings WHERE review_id = ?1 ORDER BY severity, path, line_start",
            )
            .context("Failed to prepare findings query")?;

        let rows = stmt
            .query_map(rusqlite::params![review_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, u32>(3)?,
                    row.get::<_, u32>(4)?,
                    row.get::<_, Option<u32>>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, String>(8)?,
                    row.get::<_, String>(9)?,
                    row.get::<_, Option<String>>(10)?,
                    row.get::<_, f64>(11)?,
                    row.get::<_, Option<i64>>(12)?,
                    row.get::<_, bool>(13)?,
                    row.get::<_, bool>(14)?,
                ))
            })
            .context("Failed to query findings")?;

        let mut results = Vec::new();
        for row in rows {
            let (
                id,
                review_id,
                path,
                line_start,
                line_end,
                position,
                severity,
                category,
                title,
                body,
                suggestion,
                confidence,
                comment_id,
                applied,
                dismissed,
            ) = row.context("Failed to read finding row")?;
            results.push(FindingRecord {
                id,
                review_id,
                finding: Finding {
                    path,
                    line_start,
                    line_end,
                    position,
                    severity: Severity::parse(&severity)
                        .ok_or_else(|| anyhow!("Unknown severity: {}", severity))?,
                    category: Category::parse(&category)
                        .ok_or_else(|| anyhow!("Unknown category: {}", category))?,
                    title,
                    body,
                    suggestion,
                    confidence: confidence as f32,
                },
                comment_id,
                applied,
                dismissed,
            });
        }
        Ok(results)
    }

    // =========================================================================
    // Conversation threads
    // =========================================================================

    pub fn insert_thread(&self, record: &ThreadRecord) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let history =
            serde_json::to_string(&record.history).context("Failed to serialize history")?;
        conn.execute(
            "INSERT INTO conversation_threads \
             (comment_id, finding_id, repo_id, repo_full_name, pr_number, installation_id, \
              path, line, commit_sha, cached_content, history, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12) \
             ON CONFLICT (comment_id) DO NOTHING",
            rusqlite::params![
                record.comment_id,
                record.finding_id,
                record.repo_id,
                record.repo_full_name,
                record.pr_number,
                record.installation_id,
                record.path,
                record.line,
                record.commit_sha,
                record.cached_content,
                history,
                now_ts(),
            ],
        )
        .context("Failed to insert conversation thread")?;
        Ok(())
    }

    pub fn get_thread(&self, comment_id: i64) -> Result<Option<ThreadRecord>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.query_row(
            "SELECT comment_id, finding_id, repo_id, repo_full_name, pr_number, \
             installation_id, path, line, commit_sha, cached_content, history \
             FROM conversation_threads WHERE comment_id = ?1",
            rusqlite::params![comment_id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, String>(8)?,
                    row.get::<_, Option<String>>(9)?,
                    row.get::<_, String>(10)?,
                ))
            },
        )
        .optional()
        .context("Failed to query thread")?
        .map(
            |(
                comment_id,
                finding_id,
                repo_id,
                repo_full_name,
                pr_number,
                installation_id,
                path,
                line,
                commit_sha,
                cached_content,
                history,
            )| {
                Ok(ThreadRecord {
                    comment_id,
                    finding_id,
                    repo_id,
                    repo_full_name,
                    pr_number,
                    installation_id,
                    path,
                    line,
                    commit_sha,
                    cached_content,
                    history: serde_json::from_str(&history)
                        .context("Failed to parse thread history")?,
                })
            },
        )
        .transpose()
    }

    pub fn update_thread_history(&self, comment_id: i64, history: &[ThreadTurn]) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let serialized = serde_json::to_string(history).context("Failed to serialize history")?;
        conn.execute(
            "UPDATE conversation_threads SET history = ?2, updated_at = ?3 \
             WHERE comment_id = ?1",
            rusqlite::params![comment_id, serialized, now_ts()],
        )
        .context("Failed to update thread history")?;
        Ok(())
    }

    // =========================================================================
    // Jobs
    // =========================================================================

    #[allow(clippy::too_many_arguments)]
    pub fn enqueue_job(
        &self,
        lane: Lane,
        kind: JobKind,
        installation_id: i64,
        repo_id: i64,
        repo_full_name: &str,
        pr_number: i64,
        head_sha: &str,
        base_sha: &str,
        payload: Option<&str>,
    ) -> Result<i64> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let now = now_ts();
        conn.execute(
            "INSERT INTO jobs (lane, kind, installation_id, repo_id, repo_full_name, \
             pr_number, head_sha, base_sha, payload, run_after, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10, ?10)",
            rusqlite::params![
                lane.as_str(),
                kind.as_str(),
                installation_id,
                repo_id,
                repo_full_name,
                pr_number,
                head_sha,
                base_sha,
                payload,
                now,
            ],
        )
        .context("Failed to enqueue job")?;
        Ok(conn.last_insert_rowid())
    }

    /// Claim the next due job in a lane, honoring per-(repo, pr)
    /// serialization: a job is skipped while a sibling for the same pull
    /// request is running in any lane.
    pub fn claim_job(&self, lane: Lane, lease_secs: u64) -> Result<Option<JobRecord>> {
        let mut conn = self.conn.lock().expect("mutex poisoned");
        let tx = conn.transaction().context("Failed to begin claim")?;
        let now = now_ts();

        let job = tx
            .query_row(
                "SELECT id, lane, kind, installation_id, repo_id, repo_full_name, pr_number, \
                 head_sha, base_sha, payload, attempts FROM jobs j \
                 WHERE lane = ?1 AND status = 'queued' AND run_after <= ?2 \
                 AND NOT EXISTS (SELECT 1 FROM jobs r WHERE r.status = 'running' \
                     AND r.repo_id = j.repo_id AND r.pr_number = j.pr_number) \
                 ORDER BY id LIMIT 1",
                rusqlite::params![lane.as_str(), now],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, String>(8)?,
                        row.get::<_, Option<String>>(9)?,
                        row.get::<_, i64>(10)?,
                    ))
                },
            )
            .optional()
            .context("Failed to select claimable job")?;

        let Some((
            id,
            lane_str,
            kind,
            installation_id,
            repo_id,
            repo_full_name,
            pr_number,
            head_sha,
            base_sha,
            payload,
            attempts,
        )) = job
        else {
            tx.rollback().ok();
            return Ok(None);
        };

        let lease = format_ts(Utc::now() + Duration::seconds(lease_secs as i64));
        tx.execute(
            "UPDATE jobs SET status = 'running', attempts = attempts + 1, \
             lease_expires_at = ?2, updated_at = ?3 WHERE id = ?1",
            rusqlite::params![id, lease, now],
        )
        .context("Failed to mark job running")?;
        tx.commit().context("Failed to commit claim")?;

        Ok(Some(JobRecord {
            id,
            lane: lane_from_str(&lane_str)?,
            kind: JobKind::parse(&kind)?,
            installation_id,
            repo_id,
            repo_full_name,
            pr_number,
            head_sha,
            base_sha,
            payload,
            attempts: attempts + 1,
        }))
    }

    /// Acknowledge a job after its terminal side effects committed.
    pub fn complete_job(&self, id: i64) -> Result<()> {
        self.finish_job(id, "completed", None)
    }

    pub fn cancel_job(&self, id: i64, reason: &str) -> Result<()> {
        self.finish_job(id, "cancelled", Some(reason))
    }

    pub fn dead_letter_job(&self, id: i64, error: &str) -> Result<()> {
        self.finish_job(id, "dead", Some(error))
    }

    fn finish_job(&self, id: i64, status: &str, error: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "UPDATE jobs SET status = ?2, last_error = COALESCE(?3, last_error), \
             lease_expires_at = NULL, updated_at = ?4 WHERE id = ?1",
            rusqlite::params![id, status, error, now_ts()],
        )
        .with_context(|| format!("Failed to mark job {}", status))?;
        Ok(())
    }

    /// Return a running or failed job to the queue for a later attempt.
    pub fn retry_job(&self, id: i64, run_after: DateTime<Utc>, error: &str) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "UPDATE jobs SET status = 'queued', run_after = ?2, last_error = ?3, \
             lease_expires_at = NULL, updated_at = ?4 WHERE id = ?1",
            rusqlite::params![id, format_ts(run_after), error, now_ts()],
        )
        .context("Failed to requeue job")?;
        Ok(())
    }

    /// Redeliver jobs whose worker died: running rows with an expired lease
    /// go back to queued. At-least-once by construction.
    pub fn reap_expired_leases(&self) -> Result<usize> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let count = conn
            .execute(
                "UPDATE jobs SET status = 'queued', lease_expires_at = NULL, updated_at = ?1 \
                 WHERE status = 'running' AND lease_expires_at IS NOT NULL \
                 AND lease_expires_at <= ?1",
                rusqlite::params![now_ts()],
            )
            .context("Failed to reap expired leases")?;
        Ok(count)
    }

    /// Cancel queued review jobs for the same pull request with a different
    /// (older) head; returns ids of *running* siblings that should receive a
    /// cooperative cancellation signal.
    pub fn supersede_older_jobs(
        &self,
        repo_id: i64,
        pr_number: i64,
        current_head: &str,
    ) -> Result<Vec<i64>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "UPDATE jobs SET status = 'cancelled', last_error = 'superseded by newer head', \
             updated_at = ?4 WHERE repo_id = ?1 AND pr_number = ?2 AND kind = 'review' \
             AND status = 'queued' AND head_sha != ?3",
            rusqlite::params![repo_id, pr_number, current_head, now_ts()],
        )
        .context("Failed to cancel superseded jobs")?;

        let mut stmt = conn
            .prepare(
                "SELECT id FROM jobs WHERE repo_id = ?1 AND pr_number = ?2 AND kind = 'review' \
                 AND status = 'running' AND head_sha != ?3",
            )
            .context("Failed to prepare superseded query")?;
        let ids = stmt
            .query_map(rusqlite::params![repo_id, pr_number, current_head], |row| {
                row.get::<_, i64>(0)
            })
            .context("Failed to query running superseded jobs")?
            .collect::<std::result::Result<Vec<i64>, _>>()
            .context("Failed to read superseded ids")?;
        Ok(ids)
    }

    pub fn job_status(&self, id: i64) -> Result<Option<String>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.query_row(
            "SELECT status FROM jobs WHERE id = ?1",
            rusqlite::params![id],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to query job status")
    }

    pub fn queue_depth(&self, lane: Lane) -> Result<i64> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE lane = ?1 AND status = 'queued'",
            rusqlite::params![lane.as_str()],
            |row| row.get(0),
        )
        .context("Failed to count queue depth")
    }

    pub fn dead_letter_count(&self) -> Result<i64> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = 'dead'",
            [],
            |row| row.get(0),
        )
        .context("Failed to count dead letters")
    }

    // =========================================================================
    // Idempotency keys
    // =========================================================================

    /// Set-if-absent with TTL. Returns true when the key was reserved by
    /// this call, false when a live reservation already exists. An expired
    /// reservation is replaced.
    pub fn reserve_idempotency_key(&self, key: &str, ttl_secs: u64) -> Result<bool> {
        let mut conn = self.conn.lock().expect("mutex poisoned");
        let tx = conn.transaction().context("Failed to begin reservation")?;
        let now = now_ts();
        let expires = format_ts(Utc::now() + Duration::seconds(ttl_secs as i64));

        let inserted = tx
            .execute(
                "INSERT INTO idempotency_keys (key, expires_at, created_at) \
                 VALUES (?1, ?2, ?3) ON CONFLICT (key) DO NOTHING",
                rusqlite::params![key, expires, now],
            )
            .context("Failed to reserve idempotency key")?;
        if inserted > 0 {
            tx.commit().context("Failed to commit reservation")?;
            return Ok(true);
        }

        // Key exists: replace it only if the old reservation lapsed.
        let replaced = tx
            .execute(
                "UPDATE idempotency_keys SET expires_at = ?2, created_at = ?3 \
                 WHERE key = ?1 AND expires_at <= ?3",
                rusqlite::params![key, expires, now],
            )
            .context("Failed to refresh expired idempotency key")?;
        tx.commit().context("Failed to commit reservation")?;
        Ok(replaced > 0)
    }

    /// Delete a reservation on terminal review status so a later push of
    /// the same head can be reviewed again.
    pub fn release_idempotency_key(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "DELETE FROM idempotency_keys WHERE key = ?1",
            rusqlite::params![key],
        )
        .context("Failed to release idempotency key")?;
        Ok(())
    }

    pub fn sweep_expired_idempotency_keys(&self) -> Result<usize> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute(
            "DELETE FROM idempotency_keys WHERE expires_at <= ?1",
            rusqlite::params![now_ts()],
        )
        .context("Failed to sweep idempotency keys")
    }

    // =========================================================================
    // Admin queries
    // =========================================================================

    pub fn review_counts_by_status(&self) -> Result<Vec<(String, i64)>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM reviews GROUP BY status")
            .context("Failed to prepare review counts")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .context("Failed to query review counts")?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to read review counts")
    }

    pub fn recent_failures(&self, limit: i64) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT id, COALESCE(error_message, '') FROM reviews \
                 WHERE status = 'failed' ORDER BY completed_at DESC LIMIT ?1",
            )
            .context("Failed to prepare recent failures")?;
        let rows = stmt
            .query_map(rusqlite::params![limit], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .context("Failed to query recent failures")?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to read recent failures")
    }

    pub fn repo_index_progress(&self) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock().expect("mutex poisoned");
        let mut stmt = conn
            .prepare("SELECT full_name, index_status FROM repositories ORDER BY full_name")
            .context("Failed to prepare index progress")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .context("Failed to query index progress")?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to read index progress")
    }
}

type ReviewRow = (ReviewRecord, String);

fn row_to_review(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReviewRow> {
    Ok((
        ReviewRecord {
            id: row.get(0)?,
            repo_id: row.get(1)?,
            pr_number: row.get(2)?,
            head_sha: row.get(3)?,
            base_sha: row.get(4)?,
            status: ReviewStatus::Queued, // overwritten by the caller
            stage: row.get(6)?,
            findings_count: row.get(7)?,
            cost_usd: row.get(8)?,
            error_message: row.get(9)?,
        },
        row.get::<_, String>(5)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finding(path: &str, line: u32) -> Finding {
        Finding {
            path: path.to_string(),
            line_start: line,
            line_end: line,
            position: Some(line),
            severity: Severity::High,
            category: Category::Defect,
            title: "t".to_string(),
            body: "b".to_string(),
            suggestion: None,
            confidence: 0.9,
        }
    }

    #[test]
    fn schema_initializes_in_memory() {
        let db = Database::new_in_memory().expect("should create db");
        assert_eq!(db.queue_depth(Lane::Fast).unwrap(), 0);
    }

    #[test]
    fn installation_lifecycle() {
        let db = Database::new_in_memory().unwrap();
        db.upsert_installation(42, "acme", "Organization").unwrap();
        assert!(db.installation_is_active(42).unwrap());
        db.deactivate_installation(42).unwrap();
        assert!(!db.installation_is_active(42).unwrap());
        // Re-install reactivates.
        db.upsert_installation(42, "acme", "Organization").unwrap();
        assert!(db.installation_is_active(42).unwrap());
    }

    #[test]
    fn repository_index_status_transitions() {
        let db = Database::new_in_memory().unwrap();
        db.upsert_repository(7, 42, "acme/widgets", "main").unwrap();
        let repo = db.get_repository(7).unwrap().unwrap();
        assert_eq!(repo.index_status, IndexStatus::Pending);

        db.set_repo_index_status(7, IndexStatus::Ready, Some("abc123"))
            .unwrap();
        let repo = db.get_repository(7).unwrap().unwrap();
        assert_eq!(repo.index_status, IndexStatus::Ready);
        assert_eq!(repo.last_indexed_sha.as_deref(), Some("abc123"));
    }

    #[test]
    fn review_completion_is_transactional_with_findings() {
        let db = Database::new_in_memory().unwrap();
        let id = db.create_review(7, 42, "head1", "base1").unwrap();
        db.mark_review_processing(&id).unwrap();
        db.add_review_cost(&id, 0.02).unwrap();
        db.add_review_cost(&id, 0.01).unwrap();

        let ids = db
            .complete_review(&id, &[finding("a.rs", 10), finding("b.rs", 20)])
            .unwrap();
        assert_eq!(ids.len(), 2);

        let review = db.get_review(&id).unwrap().unwrap();
        assert_eq!(review.status, ReviewStatus::Completed);
        assert_eq!(review.findings_count, 2);
        assert!((review.cost_usd - 0.03).abs() < 1e-9);

        let findings = db.list_findings(&id).unwrap();
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].finding.severity, Severity::High);
    }

    #[test]
    fn negative_cost_delta_is_rejected() {
        let db = Database::new_in_memory().unwrap();
        let id = db.create_review(7, 42, "head1", "base1").unwrap();
        assert!(db.add_review_cost(&id, -0.01).is_err());
    }

    #[test]
    fn redelivered_attempt_resumes_the_same_review_row() {
        let db = Database::new_in_memory().unwrap();
        let id = db.create_review(7, 42, "head1", "base1").unwrap();
        // At-least-once redelivery: same key, same row, still exactly one
        // non-terminal review.
        let id2 = db.create_review(7, 42, "head1", "base1").unwrap();
        assert_eq!(id, id2);
        assert_eq!(db.active_review_count(7, 42, "head1").unwrap(), 1);
    }

    #[test]
    fn terminal_review_row_is_reused_on_re_review() {
        let db = Database::new_in_memory().unwrap();
        let id = db.create_review(7, 42, "head1", "base1").unwrap();
        db.fail_review(&id, "boom").unwrap();

        let id2 = db.create_review(7, 42, "head1", "base1").unwrap();
        assert_eq!(id, id2);
        let review = db.get_review(&id2).unwrap().unwrap();
        assert_eq!(review.status, ReviewStatus::Queued);
        assert!(review.error_message.is_none());
    }

    #[test]
    fn job_claim_is_fifo_within_lane() {
        let db = Database::new_in_memory().unwrap();
        let a = db
            .enqueue_job(Lane::Fast, JobKind::Review, 1, 7, "acme/w", 1, "h1", "b1", None)
            .unwrap();
        let _b = db
            .enqueue_job(Lane::Fast, JobKind::Review, 1, 8, "acme/x", 2, "h2", "b2", None)
            .unwrap();

        let claimed = db.claim_job(Lane::Fast, 60).unwrap().unwrap();
        assert_eq!(claimed.id, a);
        assert_eq!(claimed.attempts, 1);
    }

    #[test]
    fn same_pr_jobs_never_run_concurrently() {
        let db = Database::new_in_memory().unwrap();
        db.enqueue_job(Lane::Fast, JobKind::Review, 1, 7, "acme/w", 1, "h1", "b1", None)
            .unwrap();
        db.enqueue_job(Lane::Fast, JobKind::Review, 1, 7, "acme/w", 1, "h2", "b1", None)
            .unwrap();

        let first = db.claim_job(Lane::Fast, 60).unwrap().unwrap();
        // The second job targets the same (repo, pr) and must be withheld.
        assert!(db.claim_job(Lane::Fast, 60).unwrap().is_none());

        db.complete_job(first.id).unwrap();
        let second = db.claim_job(Lane::Fast, 60).unwrap().unwrap();
        assert_eq!(second.head_sha, "h2");
    }

    #[test]
    fn distinct_prs_claim_independently() {
        let db = Database::new_in_memory().unwrap();
        db.enqueue_job(Lane::Fast, JobKind::Review, 1, 7, "acme/w", 1, "h1", "b1", None)
            .unwrap();
        db.enqueue_job(Lane::Fast, JobKind::Review, 1, 7, "acme/w", 2, "h2", "b2", None)
            .unwrap();

        assert!(db.claim_job(Lane::Fast, 60).unwrap().is_some());
        assert!(db.claim_job(Lane::Fast, 60).unwrap().is_some());
    }

    #[test]
    fn lanes_are_isolated() {
        let db = Database::new_in_memory().unwrap();
        db.enqueue_job(Lane::Slow, JobKind::Review, 1, 7, "acme/w", 1, "h1", "b1", None)
            .unwrap();
        assert!(db.claim_job(Lane::Fast, 60).unwrap().is_none());
        assert!(db.claim_job(Lane::Slow, 60).unwrap().is_some());
    }

    #[test]
    fn expired_lease_is_redelivered() {
        let db = Database::new_in_memory().unwrap();
        db.enqueue_job(Lane::Fast, JobKind::Review, 1, 7, "acme/w", 1, "h1", "b1", None)
            .unwrap();

        // Zero-second lease expires immediately.
        let job = db.claim_job(Lane::Fast, 0).unwrap().unwrap();
        assert_eq!(db.reap_expired_leases().unwrap(), 1);

        let again = db.claim_job(Lane::Fast, 60).unwrap().unwrap();
        assert_eq!(again.id, job.id);
        assert_eq!(again.attempts, 2);
    }

    #[test]
    fn retry_schedules_into_the_future() {
        let db = Database::new_in_memory().unwrap();
        db.enqueue_job(Lane::Fast, JobKind::Review, 1, 7, "acme/w", 1, "h1", "b1", None)
            .unwrap();
        let job = db.claim_job(Lane::Fast, 60).unwrap().unwrap();

        db.retry_job(job.id, Utc::now() + Duration::seconds(3600), "timeout")
            .unwrap();
        // Not due yet.
        assert!(db.claim_job(Lane::Fast, 60).unwrap().is_none());
        assert_eq!(db.queue_depth(Lane::Fast).unwrap(), 1);
    }

    #[test]
    fn superseded_queued_jobs_are_cancelled() {
        let db = Database::new_in_memory().unwrap();
        db.enqueue_job(Lane::Fast, JobKind::Review, 1, 7, "acme/w", 1, "old", "b1", None)
            .unwrap();
        let running = db.claim_job(Lane::Fast, 60).unwrap().unwrap();

        db.enqueue_job(Lane::Fast, JobKind::Review, 1, 7, "acme/w", 1, "older", "b1", None)
            .unwrap();
        let to_signal = db.supersede_older_jobs(7, 1, "new").unwrap();

        // The queued older-head job was cancelled; the running one is
        // reported for cooperative cancellation.
        assert_eq!(db.queue_depth(Lane::Fast).unwrap(), 0);
        assert_eq!(to_signal, vec![running.id]);
    }

    #[test]
    fn dead_letter_bookkeeping() {
        let db = Database::new_in_memory().unwrap();
        db.enqueue_job(Lane::Fast, JobKind::Review, 1, 7, "acme/w", 1, "h1", "b1", None)
            .unwrap();
        let job = db.claim_job(Lane::Fast, 60).unwrap().unwrap();
        db.dead_letter_job(job.id, "invariant violated").unwrap();
        assert_eq!(db.dead_letter_count().unwrap(), 1);
        assert!(db.claim_job(Lane::Fast, 60).unwrap().is_none());
    }

    #[test]
    fn idempotency_reserve_is_set_if_absent() {
        let db = Database::new_in_memory().unwrap();
        assert!(db.reserve_idempotency_key("review:7:1:h1", 3600).unwrap());
        assert!(!db.reserve_idempotency_key("review:7:1:h1", 3600).unwrap());

        db.release_idempotency_key("review:7:1:h1").unwrap();
        assert!(db.reserve_idempotency_key("review:7:1:h1", 3600).unwrap());
    }

    #[test]
    fn expired_idempotency_key_is_replaced() {
        let db = Database::new_in_memory().unwrap();
        assert!(db.reserve_idempotency_key("review:7:1:h1", 0).unwrap());
        // TTL of zero lapses immediately, so the next reservation wins.
        assert!(db.reserve_idempotency_key("review:7:1:h1", 3600).unwrap());
    }

    #[test]
    fn thread_round_trip() {
        let db = Database::new_in_memory().unwrap();
        let record = ThreadRecord {
            comment_id: 9001,
            finding_id: Some("f-1".to_string()),
            repo_id: 7,
            repo_full_name: "acme/widgets".to_string(),
            pr_number: 42,
            installation_id: 1,
            path: "src/a.rs".to_string(),
            line: 10,
            commit_sha: "head1".to_string(),
            cached_content: Some("fn a() {}".to_string()),
            history: vec![ThreadTurn {
                role: "assistant".to_string(),
                content: "finding body".to_string(),
            }],
        };
        db.insert_thread(&record).unwrap();

        let loaded = db.get_thread(9001).unwrap().unwrap();
        assert_eq!(loaded.commit_sha, "head1");
        assert_eq!(loaded.history.len(), 1);

        let mut history = loaded.history.clone();
        history.push(ThreadTurn {
            role: "user".to_string(),
            content: "fix this".to_string(),
        });
        db.update_thread_history(9001, &history).unwrap();
        assert_eq!(db.get_thread(9001).unwrap().unwrap().history.len(), 2);
    }

    #[test]
    fn admin_counters() {
        let db = Database::new_in_memory().unwrap();
        let id = db.create_review(7, 1, "h1", "b1").unwrap();
        db.fail_review(&id, "diff fetch failed").unwrap();
        let id2 = db.create_review(7, 2, "h2", "b2").unwrap();
        db.complete_review(&id2, &[]).unwrap();

        let counts = db.review_counts_by_status().unwrap();
        assert!(counts.contains(&("failed".to_string(), 1)));
        assert!(counts.contains(&("completed".to_string(), 1)));

        let failures = db.recent_failures(10).unwrap();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].1.contains("diff fetch"));
    }
}
