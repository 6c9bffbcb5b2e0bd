use anyhow::{Context, Result};
use std::env;
use std::fs;
use std::path::PathBuf;

use goshawk_core::DEFAULT_LARGE_PR_THRESHOLD;

/// Lane concurrency settings. Slow defaults to a single worker so one large
/// PR cannot monopolize review throughput.
#[derive(Debug, Clone)]
pub struct LaneWorkers {
    pub fast: usize,
    pub slow: usize,
    pub index: usize,
}

#[derive(Clone)]
pub struct Config {
    pub github_app_id: u64,
    pub github_private_key: String,
    pub github_webhook_secret: String,
    pub model_api_key: String,
    pub port: u16,
    /// Directory for persistent state (SQLite database).
    /// Defaults to current working directory.
    pub state_dir: PathBuf,
    /// Optional shared secret for /admin endpoints.
    /// If not set, /admin endpoints are disabled (403 Forbidden).
    pub admin_secret: Option<String>,
    /// Per-review model spend ceiling, in currency units.
    pub cost_ceiling_usd: f64,
    /// Changed-file count above which a PR is routed to the slow lane.
    pub large_pr_threshold: usize,
    pub lane_workers: LaneWorkers,
    /// Cooperative cancellation fires at the soft deadline; the task is
    /// forcibly terminated at the hard deadline.
    pub soft_deadline_secs: u64,
    pub hard_deadline_secs: u64,
    /// TTL for idempotency reservations.
    pub idempotency_ttl_secs: u64,
    /// Bound on concurrent outbound model calls within one review.
    pub model_concurrency: usize,
    /// Retry policy for transient task failures.
    pub max_retries: u32,
    pub retry_initial_secs: u64,
    pub retry_cap_secs: u64,
}

/// Read a required config value.
///
/// For a key like "GITHUB_PRIVATE_KEY":
/// 1. Check if GITHUB_PRIVATE_KEY_FILE is set - if so, read from that file path
/// 2. Otherwise, check GITHUB_PRIVATE_KEY env var directly
///
/// When reading from env var, `\n` escape sequences are converted to actual
/// newlines (needed for PEM keys stored as single-line env vars).
fn read_secret(key: &str) -> Result<String> {
    let file_key = format!("{}_FILE", key);

    if let Ok(path) = env::var(&file_key) {
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {} from file: {}", key, path))?;
        Ok(contents.trim_end().to_string())
    } else {
        let value = env::var(key)
            .with_context(|| format!("{} or {} environment variable is required", key, file_key))?;
        Ok(value.replace("\\n", "\n"))
    }
}

/// Read an optional config value with the same _FILE indirection.
/// Returns None when neither variable is set or the value is blank; an
/// explicitly-set but unreadable _FILE path is an error, not a silent None.
fn read_secret_optional(key: &str) -> Result<Option<String>> {
    let file_key = format!("{}_FILE", key);

    let value = if let Ok(path) = env::var(&file_key) {
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {} from file: {}", key, path))?;
        Some(contents)
    } else {
        env::var(key).ok()
    };

    Ok(value.and_then(|s| {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }))
}

fn read_parsed<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .with_context(|| format!("{} must be a valid value", key)),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let github_app_id = read_secret("GITHUB_APP_ID")?
            .parse::<u64>()
            .context("GITHUB_APP_ID must be a valid number")?;

        // A missing or unreadable signing key is a hard startup failure:
        // nothing downstream can authenticate without it.
        let github_private_key = read_secret("GITHUB_PRIVATE_KEY")?;

        let github_webhook_secret = read_secret("GITHUB_WEBHOOK_SECRET")?;

        let model_api_key = read_secret("MODEL_API_KEY")?;

        let port = read_parsed("PORT", 3000u16)?;

        let state_dir = env::var("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));

        let admin_secret = read_secret_optional("ADMIN_SECRET")?;

        let cost_ceiling_usd = read_parsed("COST_CEILING_USD", 0.50f64)?;
        let large_pr_threshold = read_parsed("LARGE_PR_THRESHOLD", DEFAULT_LARGE_PR_THRESHOLD)?;

        let lane_workers = LaneWorkers {
            fast: read_parsed("FAST_LANE_WORKERS", 4usize)?,
            slow: read_parsed("SLOW_LANE_WORKERS", 1usize)?,
            index: read_parsed("INDEX_LANE_WORKERS", 1usize)?,
        };

        let soft_deadline_secs = read_parsed("SOFT_DEADLINE_SECS", 180u64)?;
        let hard_deadline_secs = read_parsed("HARD_DEADLINE_SECS", 300u64)?;
        let idempotency_ttl_secs = read_parsed("IDEMPOTENCY_TTL_SECS", 7200u64)?;
        let model_concurrency = read_parsed("MODEL_CONCURRENCY", 5usize)?;

        let max_retries = read_parsed("TASK_MAX_RETRIES", 3u32)?;
        let retry_initial_secs = read_parsed("TASK_RETRY_INITIAL_SECS", 60u64)?;
        let retry_cap_secs = read_parsed("TASK_RETRY_CAP_SECS", 300u64)?;

        Ok(Config {
            github_app_id,
            github_private_key,
            github_webhook_secret,
            model_api_key,
            port,
            state_dir,
            admin_secret,
            cost_ceiling_usd,
            large_pr_threshold,
            lane_workers,
            soft_deadline_secs,
            hard_deadline_secs,
            idempotency_ttl_secs,
            model_concurrency,
            max_retries,
            retry_initial_secs,
            retry_cap_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_read_secret_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "secret-value").unwrap();

        env::set_var("GOSHAWK_TEST_SECRET_FILE", file.path());
        env::remove_var("GOSHAWK_TEST_SECRET");

        let result = read_secret("GOSHAWK_TEST_SECRET").unwrap();
        assert_eq!(result, "secret-value");

        env::remove_var("GOSHAWK_TEST_SECRET_FILE");
    }

    #[test]
    fn test_read_secret_from_env() {
        env::remove_var("GOSHAWK_TEST_SECRET2_FILE");
        env::set_var("GOSHAWK_TEST_SECRET2", "env-value");

        let result = read_secret("GOSHAWK_TEST_SECRET2").unwrap();
        assert_eq!(result, "env-value");

        env::remove_var("GOSHAWK_TEST_SECRET2");
    }

    #[test]
    fn test_read_secret_converts_escaped_newlines() {
        // PEM keys are often stored as single-line env vars.
        env::remove_var("GOSHAWK_TEST_PEM_FILE");
        env::set_var("GOSHAWK_TEST_PEM", "line1\\nline2\\nline3");

        let result = read_secret("GOSHAWK_TEST_PEM").unwrap();
        assert_eq!(result, "line1\nline2\nline3");

        env::remove_var("GOSHAWK_TEST_PEM");
    }

    #[test]
    fn test_read_secret_file_takes_precedence() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "file-value").unwrap();

        env::set_var("GOSHAWK_TEST_SECRET3_FILE", file.path());
        env::set_var("GOSHAWK_TEST_SECRET3", "env-value");

        let result = read_secret("GOSHAWK_TEST_SECRET3").unwrap();
        assert_eq!(result, "file-value");

        env::remove_var("GOSHAWK_TEST_SECRET3_FILE");
        env::remove_var("GOSHAWK_TEST_SECRET3");
    }

    #[test]
    fn test_missing_required_secret_is_an_error() {
        env::remove_var("GOSHAWK_TEST_ABSENT");
        env::remove_var("GOSHAWK_TEST_ABSENT_FILE");
        assert!(read_secret("GOSHAWK_TEST_ABSENT").is_err());
    }

    #[test]
    fn test_read_secret_optional_none_when_missing() {
        env::remove_var("GOSHAWK_TEST_OPT_FILE");
        env::remove_var("GOSHAWK_TEST_OPT");

        let result = read_secret_optional("GOSHAWK_TEST_OPT").unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn test_read_secret_optional_none_when_blank() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "   ").unwrap();

        env::set_var("GOSHAWK_TEST_OPT2_FILE", file.path());

        let result = read_secret_optional("GOSHAWK_TEST_OPT2").unwrap();
        assert_eq!(result, None);

        env::remove_var("GOSHAWK_TEST_OPT2_FILE");
    }

    #[test]
    fn test_read_secret_optional_errors_when_file_unreadable() {
        env::set_var("GOSHAWK_TEST_OPT3_FILE", "/nonexistent/path/to/secret");
        env::remove_var("GOSHAWK_TEST_OPT3");

        let result = read_secret_optional("GOSHAWK_TEST_OPT3");
        assert!(result.is_err());

        env::remove_var("GOSHAWK_TEST_OPT3_FILE");
    }

    #[test]
    fn test_read_parsed_default_and_override() {
        env::remove_var("GOSHAWK_TEST_NUM");
        assert_eq!(read_parsed("GOSHAWK_TEST_NUM", 7u64).unwrap(), 7);

        env::set_var("GOSHAWK_TEST_NUM", "42");
        assert_eq!(read_parsed("GOSHAWK_TEST_NUM", 7u64).unwrap(), 42);

        env::set_var("GOSHAWK_TEST_NUM", "not-a-number");
        assert!(read_parsed("GOSHAWK_TEST_NUM", 7u64).is_err());

        env::remove_var("GOSHAWK_TEST_NUM");
    }
}
