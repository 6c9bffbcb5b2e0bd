//! Review findings and the rule-based synthesis pass.
//!
//! A finding is one candidate inline comment. It is born in a pipeline stage
//! with a line range in new-file coordinates; the orchestrator later resolves
//! the diff position and refuses to post anything whose range does not map
//! cleanly into a single hunk.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Severity, ordered from most to least severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
            Severity::Info => "info",
        }
    }

    pub fn parse(s: &str) -> Option<Severity> {
        match s {
            "critical" => Some(Severity::Critical),
            "high" => Some(Severity::High),
            "medium" => Some(Severity::Medium),
            "low" => Some(Severity::Low),
            "info" => Some(Severity::Info),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Defect,
    Security,
    Style,
    Performance,
    Docs,
    BreakingChange,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Defect => "defect",
            Category::Security => "security",
            Category::Style => "style",
            Category::Performance => "performance",
            Category::Docs => "docs",
            Category::BreakingChange => "breaking_change",
        }
    }

    pub fn parse(s: &str) -> Option<Category> {
        match s {
            "defect" => Some(Category::Defect),
            "security" => Some(Category::Security),
            "style" => Some(Category::Style),
            "performance" => Some(Category::Performance),
            "docs" => Some(Category::Docs),
            "breaking_change" => Some(Category::BreakingChange),
            _ => None,
        }
    }
}

/// One candidate inline comment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub path: String,
    /// Inclusive new-file line range.
    pub line_start: u32,
    pub line_end: u32,
    /// Diff position, resolved from the position map. `None` until resolved;
    /// a finding with no position never reaches the forge.
    pub position: Option<u32>,
    pub severity: Severity,
    pub category: Category,
    pub title: String,
    pub body: String,
    pub suggestion: Option<String>,
    /// Model confidence in [0, 1].
    pub confidence: f32,
}

impl Finding {
    /// Whether two findings target the same file with overlapping line
    /// ranges, allowing `slack` lines of tolerance on each side.
    pub fn overlaps(&self, other: &Finding, slack: u32) -> bool {
        self.path == other.path
            && self.line_start <= other.line_end.saturating_add(slack)
            && other.line_start <= self.line_end.saturating_add(slack)
    }
}

/// Default cap on findings per review after synthesis.
pub const DEFAULT_MAX_FINDINGS: usize = 25;

/// Outcome of the rule-based synthesis pass.
#[derive(Debug)]
pub struct SynthesisOutcome {
    pub kept: Vec<Finding>,
    /// Findings discarded for a null position or sub-threshold severity.
    pub dropped_invalid: usize,
    /// Findings merged away as duplicates of a stronger overlapping finding.
    pub dropped_duplicates: usize,
    /// Findings cut by the per-review cap.
    pub dropped_over_cap: usize,
}

/// Rule-based half of stage S5.
///
/// Drops findings with no diff position or below the severity threshold,
/// keeps the strongest of each overlapping group (by severity, then
/// confidence), caps the total in severity order, and sorts the survivors
/// by severity, file, then line.
pub fn synthesize(
    findings: Vec<Finding>,
    severity_threshold: Severity,
    max_findings: usize,
) -> SynthesisOutcome {
    let total = findings.len();

    let mut valid: Vec<Finding> = findings
        .into_iter()
        .filter(|f| f.position.is_some() && f.severity <= severity_threshold)
        .collect();
    let dropped_invalid = total - valid.len();

    // Strongest first, so the dedup pass below always keeps the winner.
    valid.sort_by(compare_for_dedup);

    let mut kept: Vec<Finding> = Vec::with_capacity(valid.len());
    let mut dropped_duplicates = 0;
    for candidate in valid {
        if kept.iter().any(|k| k.overlaps(&candidate, 0)) {
            dropped_duplicates += 1;
        } else {
            kept.push(candidate);
        }
    }

    let dropped_over_cap = kept.len().saturating_sub(max_findings);
    kept.truncate(max_findings);

    kept.sort_by(|a, b| {
        a.severity
            .cmp(&b.severity)
            .then_with(|| a.path.cmp(&b.path))
            .then_with(|| a.line_start.cmp(&b.line_start))
    });

    debug!(
        kept = kept.len(),
        dropped_invalid,
        dropped_duplicates,
        dropped_over_cap,
        "synthesis pass complete"
    );

    SynthesisOutcome {
        kept,
        dropped_invalid,
        dropped_duplicates,
        dropped_over_cap,
    }
}

fn compare_for_dedup(a: &Finding, b: &Finding) -> Ordering {
    a.severity.cmp(&b.severity).then_with(|| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finding(path: &str, start: u32, end: u32, severity: Severity, confidence: f32) -> Finding {
        Finding {
            path: path.to_string(),
            line_start: start,
            line_end: end,
            position: Some(start),
            severity,
            category: Category::Defect,
            title: format!("issue at {path}:{start}"),
            body: "body".to_string(),
            suggestion: None,
            confidence,
        }
    }

    #[test]
    fn null_position_findings_are_dropped() {
        let mut f = finding("a.rs", 10, 12, Severity::High, 0.9);
        f.position = None;
        let outcome = synthesize(vec![f], Severity::Info, DEFAULT_MAX_FINDINGS);
        assert!(outcome.kept.is_empty());
        assert_eq!(outcome.dropped_invalid, 1);
    }

    #[test]
    fn sub_threshold_severities_are_dropped() {
        let outcome = synthesize(
            vec![
                finding("a.rs", 1, 1, Severity::Info, 0.9),
                finding("a.rs", 20, 20, Severity::High, 0.9),
            ],
            Severity::Medium,
            DEFAULT_MAX_FINDINGS,
        );
        assert_eq!(outcome.kept.len(), 1);
        assert_eq!(outcome.kept[0].severity, Severity::High);
        assert_eq!(outcome.dropped_invalid, 1);
    }

    #[test]
    fn overlapping_group_keeps_highest_severity() {
        let outcome = synthesize(
            vec![
                finding("a.rs", 10, 14, Severity::Low, 0.95),
                finding("a.rs", 12, 13, Severity::Critical, 0.5),
            ],
            Severity::Info,
            DEFAULT_MAX_FINDINGS,
        );
        assert_eq!(outcome.kept.len(), 1);
        assert_eq!(outcome.kept[0].severity, Severity::Critical);
        assert_eq!(outcome.dropped_duplicates, 1);
    }

    #[test]
    fn equal_severity_overlap_keeps_higher_confidence() {
        let outcome = synthesize(
            vec![
                finding("a.rs", 10, 14, Severity::High, 0.4),
                finding("a.rs", 12, 13, Severity::High, 0.8),
            ],
            Severity::Info,
            DEFAULT_MAX_FINDINGS,
        );
        assert_eq!(outcome.kept.len(), 1);
        assert!((outcome.kept[0].confidence - 0.8).abs() < f32::EPSILON);
    }

    #[test]
    fn distinct_files_never_collapse() {
        let outcome = synthesize(
            vec![
                finding("a.rs", 10, 14, Severity::High, 0.9),
                finding("b.rs", 10, 14, Severity::High, 0.9),
            ],
            Severity::Info,
            DEFAULT_MAX_FINDINGS,
        );
        assert_eq!(outcome.kept.len(), 2);
    }

    #[test]
    fn cap_cuts_least_severe_first() {
        let outcome = synthesize(
            vec![
                finding("a.rs", 1, 1, Severity::Info, 0.9),
                finding("a.rs", 100, 100, Severity::Critical, 0.9),
                finding("a.rs", 200, 200, Severity::Medium, 0.9),
            ],
            Severity::Info,
            2,
        );
        assert_eq!(outcome.kept.len(), 2);
        assert_eq!(outcome.dropped_over_cap, 1);
        assert!(outcome.kept.iter().all(|f| f.severity != Severity::Info));
    }

    #[test]
    fn output_sorted_by_severity_then_file_then_line() {
        let outcome = synthesize(
            vec![
                finding("b.rs", 5, 5, Severity::High, 0.9),
                finding("a.rs", 50, 50, Severity::High, 0.9),
                finding("a.rs", 2, 2, Severity::Critical, 0.9),
            ],
            Severity::Info,
            DEFAULT_MAX_FINDINGS,
        );
        let keys: Vec<(Severity, &str, u32)> = outcome
            .kept
            .iter()
            .map(|f| (f.severity, f.path.as_str(), f.line_start))
            .collect();
        assert_eq!(
            keys,
            vec![
                (Severity::Critical, "a.rs", 2),
                (Severity::High, "a.rs", 50),
                (Severity::High, "b.rs", 5),
            ]
        );
    }

    #[test]
    fn overlap_slack_extends_the_range() {
        let a = finding("a.rs", 10, 12, Severity::High, 0.9);
        let b = finding("a.rs", 14, 15, Severity::Low, 0.9);
        assert!(!a.overlaps(&b, 0));
        assert!(a.overlaps(&b, 3));
    }

    #[test]
    fn severity_ordering_is_most_severe_first() {
        assert!(Severity::Critical < Severity::High);
        assert!(Severity::High < Severity::Info);
        assert_eq!(Severity::parse("high"), Some(Severity::High));
        assert_eq!(Severity::parse("bogus"), None);
    }
}
