//! Stage S0: external static analyzers.
//!
//! Each reviewable file is written into a per-review temporary directory
//! and handed to a language-appropriate analyzer subprocess under a strict
//! time limit. Analyzer findings outside the changed hunks are discarded.
//! A failing or missing analyzer is logged and skipped; S0 never aborts a
//! review.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use goshawk_core::{Category, Finding, Severity};

/// Wall-clock bound for one analyzer invocation.
const ANALYZER_TIMEOUT: Duration = Duration::from_secs(20);

/// Cap on analyzer stdout we are willing to parse.
const MAX_OUTPUT_BYTES: usize = 256 * 1024;

/// Analyzer command per language. The file path is appended as the final
/// argument.
fn analyzer_for(language: &str) -> Option<&'static [&'static str]> {
    match language {
        "python" => Some(&["pyflakes"]),
        "bash" => Some(&["shellcheck", "-f", "gcc"]),
        _ => None,
    }
}

/// Run the analyzer for one file and keep findings on commentable lines.
///
/// `positions` is the file's line-to-position map; a reported line absent
/// from it falls outside the changed hunks and is dropped.
pub async fn analyze_file(
    workdir: &Path,
    relative_path: &str,
    language: &str,
    content: &str,
    positions: &BTreeMap<u32, u32>,
) -> Vec<Finding> {
    let Some(argv) = analyzer_for(language) else {
        return Vec::new();
    };

    let file_path = workdir.join(relative_path.replace('/', "_"));
    let Ok(mut file) = tokio::fs::File::create(&file_path).await else {
        warn!(path = relative_path, "failed to stage file for analysis");
        return Vec::new();
    };
    if file.write_all(content.as_bytes()).await.is_err() {
        warn!(path = relative_path, "failed to write staged file");
        return Vec::new();
    }
    drop(file);

    let child = Command::new(argv[0])
        .args(&argv[1..])
        .arg(&file_path)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(ANALYZER_TIMEOUT, child).await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => {
            // Usually the analyzer is simply not installed.
            debug!(analyzer = argv[0], error = %err, "analyzer unavailable");
            return Vec::new();
        }
        Err(_) => {
            warn!(analyzer = argv[0], path = relative_path, "analyzer timed out");
            return Vec::new();
        }
    };

    let stdout = &output.stdout[..output.stdout.len().min(MAX_OUTPUT_BYTES)];
    let stdout = String::from_utf8_lossy(stdout);
    parse_analyzer_output(&stdout, relative_path, positions)
}

/// Parse gcc-style `file:line[:col]: message` lines into findings on
/// commentable lines.
pub fn parse_analyzer_output(
    output: &str,
    relative_path: &str,
    positions: &BTreeMap<u32, u32>,
) -> Vec<Finding> {
    let mut findings = Vec::new();
    for raw in output.lines() {
        let Some((line, message)) = split_diagnostic(raw) else {
            continue;
        };
        if !positions.contains_key(&line) {
            // Pre-existing issue outside the changed hunks.
            continue;
        }
        let title = if message.chars().count() > 80 {
            let prefix: String = message.chars().take(77).collect();
            format!("{prefix}...")
        } else {
            message.to_string()
        };
        findings.push(Finding {
            path: relative_path.to_string(),
            line_start: line,
            line_end: line,
            position: None,
            severity: Severity::Low,
            category: Category::Defect,
            title,
            body: format!("Static analysis: {message}"),
            suggestion: None,
            confidence: 1.0,
        });
    }
    findings
}

/// Extract (line, message) from `anything:line[:col]: message`.
fn split_diagnostic(raw: &str) -> Option<(u32, String)> {
    // Skip the path segment; it may itself contain colons on some systems,
    // so scan for the first `:<digits>:` group instead.
    let bytes = raw.as_bytes();
    let mut idx = 0;
    while let Some(colon) = raw[idx..].find(':').map(|i| i + idx) {
        let rest = &raw[colon + 1..];
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        if !digits.is_empty() {
            let after = &rest[digits.len()..];
            if let Some(message) = after.strip_prefix(':') {
                // Optionally a column number follows.
                let message = strip_column(message);
                let line = digits.parse().ok()?;
                return Some((line, message.trim().to_string()));
            }
        }
        idx = colon + 1;
        if idx >= bytes.len() {
            break;
        }
    }
    None
}

fn strip_column(message: &str) -> &str {
    let digits: String = message.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return message;
    }
    match message[digits.len()..].strip_prefix(':') {
        Some(rest) => rest,
        None => message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn positions(lines: &[u32]) -> BTreeMap<u32, u32> {
        lines.iter().enumerate().map(|(i, &l)| (l, i as u32 + 1)).collect()
    }

    #[test]
    fn parses_file_line_message() {
        let out = "staged.py:10: undefined name 'foo'\n";
        let findings = parse_analyzer_output(out, "src/app.py", &positions(&[9, 10, 11]));
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].line_start, 10);
        assert_eq!(findings[0].path, "src/app.py");
        assert!(findings[0].body.contains("undefined name"));
        assert_eq!(findings[0].severity, Severity::Low);
    }

    #[test]
    fn parses_file_line_col_message() {
        let out = "staged.sh:3:7: warning: quote this [SC2086]\n";
        let findings = parse_analyzer_output(out, "run.sh", &positions(&[3]));
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].line_start, 3);
        assert!(findings[0].body.contains("quote this"));
    }

    #[test]
    fn drops_diagnostics_outside_changed_hunks() {
        let out = "staged.py:5: unused import\nstaged.py:50: undefined name\n";
        let findings = parse_analyzer_output(out, "a.py", &positions(&[50]));
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].line_start, 50);
    }

    #[test]
    fn ignores_unparseable_lines() {
        let out = "some banner text\n\nno colons here\n";
        assert!(parse_analyzer_output(out, "a.py", &positions(&[1])).is_empty());
    }

    #[test]
    fn long_messages_are_truncated_in_title() {
        let long = format!("staged.py:1: {}\n", "m".repeat(200));
        let findings = parse_analyzer_output(&long, "a.py", &positions(&[1]));
        assert!(findings[0].title.len() <= 80);
        assert!(findings[0].title.ends_with("..."));
        assert!(findings[0].body.len() > 100);
    }

    #[test]
    fn only_known_languages_have_analyzers() {
        assert!(analyzer_for("python").is_some());
        assert!(analyzer_for("bash").is_some());
        assert!(analyzer_for("rust").is_none());
        assert!(analyzer_for("cobol").is_none());
    }

    #[tokio::test]
    async fn missing_analyzer_binary_is_not_fatal() {
        // Point at a language whose analyzer is very unlikely to exist in
        // the test environment by staging through the real path.
        let dir = tempfile::tempdir().unwrap();
        let findings = analyze_file(
            dir.path(),
            "src/app.py",
            "python",
            "import os\n",
            &positions(&[1]),
        )
        .await;
        // Either pyflakes is installed (no findings for clean-ish code, or
        // an unused-import finding) or it is missing (no findings). Both
        // are acceptable; the call must simply not fail.
        assert!(findings.len() <= 1);
    }
}
