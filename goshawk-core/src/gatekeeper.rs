//! Pre-enqueue gatekeeper: a deterministic, rule-ordered filter.
//!
//! Runs in the ingestion gateway before any queue write, so every rule must
//! be answerable from the webhook payload plus the changed-path list alone.
//! No network I/O, no state mutation. A large share of inbound events never
//! reaches the review pipeline at all.

use glob::Pattern;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Queue lane selected for an admitted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    Fast,
    Slow,
    Index,
}

impl Lane {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Fast => "fast",
            Lane::Slow => "slow",
            Lane::Index => "index",
        }
    }
}

/// Outcome of gatekeeper evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateDecision {
    pub admit: bool,
    pub reason: String,
    /// Target lane; meaningful only when `admit` is true.
    pub lane: Lane,
}

impl GateDecision {
    fn skip(reason: String) -> Self {
        GateDecision {
            admit: false,
            reason,
            lane: Lane::Fast,
        }
    }

    fn admit(reason: String, lane: Lane) -> Self {
        GateDecision {
            admit: true,
            reason,
            lane,
        }
    }
}

/// The facts the gatekeeper needs from a pull-request event.
#[derive(Debug, Clone, Default)]
pub struct PullRequestFacts {
    pub author_login: String,
    pub labels: Vec<String>,
    pub draft: bool,
    /// Changed-file count from the event payload, available even when the
    /// path list is not.
    pub changed_file_count: Option<usize>,
}

/// Service accounts whose pull requests are never reviewed.
const BOT_LOGINS: &[&str] = &[
    "dependabot[bot]",
    "dependabot-preview[bot]",
    "renovate[bot]",
    "snyk-bot",
    "github-actions[bot]",
    "imgbot[bot]",
    "whitesource-bolt-for-github[bot]",
    "semantic-release-bot",
    "allcontributors[bot]",
];

/// Label that opts a pull request out of review entirely.
const SKIP_LABEL: &str = "skip-ai-review";

/// Basename globs for paths that never need review: documentation, media,
/// lockfiles, build artifacts, and editor config.
const NO_REVIEW_PATTERNS: &[&str] = &[
    "*.md",
    "*.rst",
    "*.txt",
    "*.adoc",
    "*.wiki",
    "*.png",
    "*.jpg",
    "*.jpeg",
    "*.gif",
    "*.svg",
    "*.ico",
    "*.webp",
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "*.lock",
    "*.sum",
    "Cargo.lock",
    "poetry.lock",
    "Gemfile.lock",
    "composer.lock",
    "packages.lock.json",
    "*.min.js",
    "*.min.css",
    "*.map",
    ".gitignore",
    ".gitattributes",
    ".editorconfig",
    "*.iml",
];

/// Directory segments whose contents are vendored or generated.
const VENDOR_DIRS: &[&str] = &["vendor", "node_modules", ".git", "__pycache__", "dist", "build"];

/// Default changed-file count above which a PR is routed to the slow lane.
pub const DEFAULT_LARGE_PR_THRESHOLD: usize = 50;

/// Rule-ordered gatekeeper. Construct once per process (or per repository
/// when repo-level ignore patterns apply) and reuse; pattern compilation is
/// done up front.
pub struct Gatekeeper {
    patterns: Vec<Pattern>,
    large_pr_threshold: usize,
}

impl Default for Gatekeeper {
    fn default() -> Self {
        Gatekeeper::new(DEFAULT_LARGE_PR_THRESHOLD, &[])
    }
}

impl Gatekeeper {
    /// Build a gatekeeper with the given large-PR threshold and any
    /// repository-level ignore patterns appended to the built-in set.
    /// Invalid extra patterns are dropped silently (repo config is
    /// best-effort by contract).
    pub fn new(large_pr_threshold: usize, extra_ignore_patterns: &[String]) -> Self {
        let mut patterns: Vec<Pattern> = NO_REVIEW_PATTERNS
            .iter()
            .map(|p| Pattern::new(p).expect("built-in pattern is valid"))
            .collect();
        patterns.extend(
            extra_ignore_patterns
                .iter()
                .filter_map(|p| Pattern::new(p).ok()),
        );
        Gatekeeper {
            patterns,
            large_pr_threshold,
        }
    }

    /// Evaluate the ordered rule set; the first rule that fires decides.
    ///
    /// `changed_files` is the path list when the caller has one. The
    /// ingestion gateway usually does not (the event payload carries only a
    /// count), in which case the path-based rules are skipped and the lane
    /// decision falls back to the payload's count.
    pub fn evaluate(
        &self,
        facts: &PullRequestFacts,
        changed_files: Option<&[String]>,
    ) -> GateDecision {
        // Rule 1: bot authors.
        let author = facts.author_login.as_str();
        if BOT_LOGINS.contains(&author) || author.ends_with("[bot]") {
            let decision = GateDecision::skip(format!("bot PR from {author}"));
            info!(rule = 1, reason = %decision.reason, "gatekeeper skip");
            return decision;
        }

        // Rule 2: explicit opt-out label.
        if facts.labels.iter().any(|l| l == SKIP_LABEL) {
            let decision = GateDecision::skip(format!("{SKIP_LABEL} label present"));
            info!(rule = 2, reason = %decision.reason, "gatekeeper skip");
            return decision;
        }

        // Rule 3: drafts wait for ready-for-review.
        if facts.draft {
            let decision = GateDecision::skip("draft PR".to_string());
            info!(rule = 3, reason = %decision.reason, "gatekeeper skip");
            return decision;
        }

        if let Some(changed_files) = changed_files {
            // Rule 4: nothing reviewable changed.
            let reviewable = self.reviewable_files(changed_files);
            if reviewable.is_empty() {
                let decision = GateDecision::skip(format!(
                    "all {} files match no-review patterns",
                    changed_files.len()
                ));
                info!(rule = 4, reason = %decision.reason, "gatekeeper skip");
                return decision;
            }

            // Rule 5: large PRs go to the slow lane so they cannot
            // monopolize the fast lane's workers.
            if changed_files.len() > self.large_pr_threshold {
                let decision = GateDecision::admit(
                    format!("large PR: {} files", changed_files.len()),
                    Lane::Slow,
                );
                info!(rule = 5, reason = %decision.reason, "gatekeeper admit (slow)");
                return decision;
            }

            // Rule 6: the common case.
            let decision = GateDecision::admit(
                format!("reviewable PR: {} code files", reviewable.len()),
                Lane::Fast,
            );
            info!(rule = 6, reason = %decision.reason, "gatekeeper admit (fast)");
            return decision;
        }

        // No path list: the count from the payload still routes large PRs
        // to the slow lane; everything else defaults to fast.
        if facts.changed_file_count.unwrap_or(0) > self.large_pr_threshold {
            let count = facts.changed_file_count.unwrap_or(0);
            let decision = GateDecision::admit(format!("large PR: {count} files"), Lane::Slow);
            info!(rule = 5, reason = %decision.reason, "gatekeeper admit (slow)");
            return decision;
        }
        let decision =
            GateDecision::admit("no file list, defaulting to fast lane".to_string(), Lane::Fast);
        info!(rule = 6, reason = %decision.reason, "gatekeeper admit (fast)");
        decision
    }

    /// Filter the changed-path list down to paths worth reviewing.
    pub fn reviewable_files<'a>(&self, changed_files: &'a [String]) -> Vec<&'a String> {
        changed_files
            .iter()
            .filter(|path| !self.is_ignored(path))
            .collect()
    }

    fn is_ignored(&self, path: &str) -> bool {
        let basename = path.rsplit('/').next().unwrap_or(path);
        if self.patterns.iter().any(|p| p.matches(basename)) {
            return true;
        }
        path.split('/').any(|seg| VENDOR_DIRS.contains(&seg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts(author: &str) -> PullRequestFacts {
        PullRequestFacts {
            author_login: author.to_string(),
            labels: Vec::new(),
            draft: false,
            changed_file_count: None,
        }
    }

    fn paths(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn eval(gate: &Gatekeeper, f: &PullRequestFacts, files: &[&str]) -> GateDecision {
        let files = paths(files);
        gate.evaluate(f, Some(&files))
    }

    #[test]
    fn known_bot_author_is_skipped() {
        let gate = Gatekeeper::default();
        let decision = eval(&gate, &facts("dependabot[bot]"), &["src/a.py"]);
        assert!(!decision.admit);
        assert!(decision.reason.contains("bot PR"));
    }

    #[test]
    fn bot_suffix_is_skipped_even_when_unlisted() {
        let gate = Gatekeeper::default();
        let decision = eval(&gate, &facts("some-new-ci[bot]"), &["src/a.py"]);
        assert!(!decision.admit);
    }

    #[test]
    fn skip_label_wins_over_everything_after_rule_one() {
        let gate = Gatekeeper::default();
        let mut f = facts("developer");
        f.labels = vec!["enhancement".to_string(), "skip-ai-review".to_string()];
        let decision = eval(&gate, &f, &["src/a.py"]);
        assert!(!decision.admit);
        assert!(decision.reason.contains("skip-ai-review"));
    }

    #[test]
    fn draft_pr_is_skipped() {
        let gate = Gatekeeper::default();
        let mut f = facts("developer");
        f.draft = true;
        let decision = eval(&gate, &f, &["src/a.py"]);
        assert!(!decision.admit);
        assert!(decision.reason.contains("draft"));
    }

    #[test]
    fn docs_only_pr_is_skipped() {
        let gate = Gatekeeper::default();
        let decision = eval(
            &gate,
            &facts("developer"),
            &["README.md", "docs/guide.rst", "CHANGELOG.txt"],
        );
        assert!(!decision.admit);
        assert!(decision.reason.contains("no-review patterns"));
    }

    #[test]
    fn lockfiles_and_media_are_not_reviewable() {
        let gate = Gatekeeper::default();
        let input_paths = paths(&[
            "Cargo.lock",
            "package-lock.json",
            "assets/logo.png",
            "bundle.min.js",
            "src/lib.rs",
        ]);
        let reviewable = gate.reviewable_files(&input_paths);
        assert_eq!(reviewable, vec!["src/lib.rs"]);
    }

    #[test]
    fn vendor_directories_are_not_reviewable() {
        let gate = Gatekeeper::default();
        let input_paths = paths(&[
            "vendor/lib/x.go",
            "web/node_modules/left-pad/index.js",
            "build/out.c",
            "src/main.go",
        ]);
        let reviewable = gate.reviewable_files(&input_paths);
        assert_eq!(reviewable, vec!["src/main.go"]);
    }

    #[test]
    fn mixed_pr_with_one_code_file_is_admitted() {
        let gate = Gatekeeper::default();
        let decision = eval(&gate, &facts("developer"), &["README.md", "src/handler.py"]);
        assert!(decision.admit);
        assert_eq!(decision.lane, Lane::Fast);
    }

    #[test]
    fn large_pr_exactly_at_threshold_stays_fast() {
        let gate = Gatekeeper::new(3, &[]);
        let decision = eval(&gate, &facts("developer"), &["a.py", "b.py", "c.py"]);
        assert!(decision.admit);
        assert_eq!(decision.lane, Lane::Fast);
    }

    #[test]
    fn large_pr_one_above_threshold_goes_slow() {
        let gate = Gatekeeper::new(3, &[]);
        let decision = eval(&gate, &facts("developer"), &["a.py", "b.py", "c.py", "d.py"]);
        assert!(decision.admit);
        assert_eq!(decision.lane, Lane::Slow);
    }

    #[test]
    fn no_file_list_defaults_to_fast_lane() {
        let gate = Gatekeeper::default();
        let decision = gate.evaluate(&facts("developer"), None);
        assert!(decision.admit);
        assert_eq!(decision.lane, Lane::Fast);
    }

    #[test]
    fn no_file_list_uses_payload_count_for_lane() {
        let gate = Gatekeeper::new(3, &[]);
        let mut f = facts("developer");
        f.changed_file_count = Some(4);
        let decision = gate.evaluate(&f, None);
        assert!(decision.admit);
        assert_eq!(decision.lane, Lane::Slow);

        f.changed_file_count = Some(3);
        let decision = gate.evaluate(&f, None);
        assert_eq!(decision.lane, Lane::Fast);
    }

    #[test]
    fn repo_ignore_patterns_extend_builtins() {
        let gate = Gatekeeper::new(
            DEFAULT_LARGE_PR_THRESHOLD,
            &["*.gen.rs".to_string(), "migrations/*".to_string()],
        );
        let decision = eval(&gate, &facts("developer"), &["api.gen.rs"]);
        assert!(!decision.admit);
    }

    #[test]
    fn invalid_repo_pattern_is_dropped_silently() {
        let gate = Gatekeeper::new(DEFAULT_LARGE_PR_THRESHOLD, &["[".to_string()]);
        let decision = eval(&gate, &facts("developer"), &["src/a.py"]);
        assert!(decision.admit);
    }

    #[test]
    fn rules_fire_in_order_bot_before_label() {
        // A bot PR with the skip label must report the bot rule, proving
        // evaluation order is fixed.
        let gate = Gatekeeper::default();
        let mut f = facts("renovate[bot]");
        f.labels = vec!["skip-ai-review".to_string()];
        let decision = eval(&gate, &f, &["src/a.py"]);
        assert!(decision.reason.contains("bot PR"));
    }
}
