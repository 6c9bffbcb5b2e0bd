//! Unified diff parser and GitHub position mapper.
//!
//! GitHub's review API addresses inline comments by *diff position*: a
//! 1-indexed counter over one file's slice of the unified diff. The `@@`
//! hunk header counts as a position, every subsequent body line (added,
//! removed, context) counts as a position, and the counter is cumulative
//! across hunks of the same file but resets at each `diff --git` header.
//! A comment posted at any other coordinate is rejected with a 422, so this
//! parser is deliberately hand-written rather than delegating to a diff
//! library whose position arithmetic we cannot audit.
//!
//! Only added and context lines are commentable; removed lines carry no
//! new-file line number.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Kind of a single line within a hunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineKind {
    Added,
    Removed,
    Context,
}

/// File-level change status, as reported by the diff metadata lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Added,
    Modified,
    Removed,
    Renamed,
}

/// One line of a hunk, with both line-number coordinate systems attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffLine {
    pub content: String,
    pub kind: LineKind,
    /// Old-file line number. `None` for added lines.
    pub old_line: Option<u32>,
    /// New-file line number. `None` for removed lines.
    pub new_line: Option<u32>,
    /// GitHub diff position: 1-indexed, cumulative within the file.
    pub position: u32,
}

/// A `@@`-delimited hunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hunk {
    pub old_start: u32,
    pub old_count: u32,
    pub new_start: u32,
    pub new_count: u32,
    /// The raw `@@` header line.
    pub header: String,
    /// Trailing text after the second `@@`, when git emitted one
    /// (usually the enclosing function or type).
    pub enclosing_symbol: Option<String>,
    pub lines: Vec<DiffLine>,
}

impl Hunk {
    /// Whether `new_line` falls inside this hunk's new-file range.
    pub fn contains_new_line(&self, new_line: u32) -> bool {
        new_line >= self.new_start && new_line < self.new_start + self.new_count.max(1)
    }
}

/// A complete per-file diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDiff {
    /// New path (post-rename where applicable).
    pub path: String,
    /// Old path, present only when the file was renamed.
    pub old_path: Option<String>,
    pub status: FileStatus,
    /// Detected language, keyed off the new path's extension.
    pub language: Option<String>,
    pub hunks: Vec<Hunk>,
    pub additions: u32,
    pub deletions: u32,
    pub is_binary: bool,
}

impl FileDiff {
    fn new(path: String, old_path: Option<String>) -> Self {
        let language = detect_language(&path).map(str::to_string);
        FileDiff {
            path,
            old_path,
            status: FileStatus::Modified,
            language,
            hunks: Vec::new(),
            additions: 0,
            deletions: 0,
            is_binary: false,
        }
    }

    /// Index of the hunk whose new-file range contains `new_line`.
    pub fn hunk_index_for_new_line(&self, new_line: u32) -> Option<usize> {
        self.hunks
            .iter()
            .position(|h| h.contains_new_line(new_line))
    }
}

/// Extension-to-language table. Matched on the final path extension; an
/// unknown extension yields no language and the downstream pipeline falls
/// back to windowed chunking.
const EXTENSION_LANGUAGES: &[(&str, &str)] = &[
    ("py", "python"),
    ("js", "javascript"),
    ("jsx", "javascript"),
    ("ts", "typescript"),
    ("tsx", "typescript"),
    ("go", "go"),
    ("rs", "rust"),
    ("java", "java"),
    ("kt", "kotlin"),
    ("swift", "swift"),
    ("rb", "ruby"),
    ("php", "php"),
    ("cs", "csharp"),
    ("cpp", "cpp"),
    ("cc", "cpp"),
    ("cxx", "cpp"),
    ("c", "c"),
    ("h", "c"),
    ("hpp", "cpp"),
    ("sh", "bash"),
    ("bash", "bash"),
    ("zsh", "bash"),
    ("sql", "sql"),
    ("yaml", "yaml"),
    ("yml", "yaml"),
    ("json", "json"),
    ("tf", "terraform"),
    ("proto", "protobuf"),
    ("html", "html"),
    ("css", "css"),
    ("scss", "scss"),
    ("less", "less"),
    ("xml", "xml"),
    ("toml", "toml"),
    ("ini", "ini"),
    ("cfg", "ini"),
    ("r", "r"),
    ("scala", "scala"),
    ("dart", "dart"),
    ("lua", "lua"),
    ("ex", "elixir"),
    ("exs", "elixir"),
    ("erl", "erlang"),
    ("hs", "haskell"),
    ("ml", "ocaml"),
    ("vue", "vue"),
    ("svelte", "svelte"),
];

/// Detect a language from a path's extension against the fixed table.
pub fn detect_language(path: &str) -> Option<&'static str> {
    let ext = path.rsplit_once('.').map(|(_, ext)| ext)?;
    EXTENSION_LANGUAGES
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, lang)| *lang)
}

/// Parse the `diff --git a/old b/new` header into (new_path, old_path_if_renamed).
fn parse_git_header(line: &str) -> Option<(String, Option<String>)> {
    let rest = line.strip_prefix("diff --git a/")?;
    let (old, new) = rest.split_once(" b/")?;
    let old_path = if old != new {
        Some(old.to_string())
    } else {
        None
    };
    Some((new.to_string(), old_path))
}

/// Parse a hunk header of the form `@@ -old[,count] +new[,count] @@ symbol`.
///
/// Returns (old_start, old_count, new_start, new_count, enclosing_symbol).
/// `None` for anything that does not match the shape, including a missing
/// `+` range.
fn parse_hunk_header(line: &str) -> Option<(u32, u32, u32, u32, Option<String>)> {
    let rest = line.strip_prefix("@@ ")?;
    let (ranges, trailer) = rest.split_once(" @@")?;
    let (old_part, new_part) = ranges.split_once(' ')?;

    let old = old_part.strip_prefix('-')?;
    let new = new_part.strip_prefix('+')?;

    let parse_range = |s: &str| -> Option<(u32, u32)> {
        match s.split_once(',') {
            Some((start, count)) => Some((start.parse().ok()?, count.parse().ok()?)),
            None => Some((s.parse().ok()?, 1)),
        }
    };

    let (old_start, old_count) = parse_range(old)?;
    let (new_start, new_count) = parse_range(new)?;

    let symbol = trailer.trim();
    let symbol = if symbol.is_empty() {
        None
    } else {
        Some(symbol.to_string())
    };

    Some((old_start, old_count, new_start, new_count, symbol))
}

/// Per-file accumulation state while walking the diff text.
struct FileBuilder {
    file: FileDiff,
    /// Set when a hunk header failed to parse; the file is dropped from the
    /// output but parsing continues for subsequent files.
    malformed: bool,
    position: u32,
    old_line: u32,
    new_line: u32,
    in_hunk: bool,
}

impl FileBuilder {
    fn new(path: String, old_path: Option<String>) -> Self {
        FileBuilder {
            file: FileDiff::new(path, old_path),
            malformed: false,
            position: 0,
            old_line: 0,
            new_line: 0,
            in_hunk: false,
        }
    }

    fn finish(self, out: &mut Vec<FileDiff>) {
        if self.malformed {
            warn!(path = %self.file.path, "dropping file with malformed hunk header");
        } else {
            out.push(self.file);
        }
    }
}

/// Parse a unified diff into structured per-file records.
///
/// Handles modified, added (`/dev/null` old path), deleted, renamed, and
/// binary files; multi-hunk files with cumulative positions; and
/// `\ No newline at end of file` markers. Truly unparseable input (empty
/// bytes, whitespace) yields an empty vector. A malformed hunk header drops
/// only the file it appears in.
pub fn parse_diff(diff_text: &str) -> Vec<FileDiff> {
    if diff_text.trim().is_empty() {
        return Vec::new();
    }

    // Normalize CRLF so position counting is not disturbed by `\r`.
    let normalized;
    let diff_text = if diff_text.contains('\r') {
        normalized = diff_text.replace("\r\n", "\n").replace('\r', "\n");
        normalized.as_str()
    } else {
        diff_text
    };

    let mut files: Vec<FileDiff> = Vec::new();
    let mut current: Option<FileBuilder> = None;

    for line in diff_text.split('\n') {
        if line.starts_with("diff --git ") {
            if let Some(done) = current.take() {
                done.finish(&mut files);
            }
            current = match parse_git_header(line) {
                Some((path, old_path)) => Some(FileBuilder::new(path, old_path)),
                None => {
                    warn!(header = %line, "unparseable diff --git header");
                    None
                }
            };
            continue;
        }

        let Some(builder) = current.as_mut() else {
            continue;
        };
        if builder.malformed {
            continue;
        }

        // Metadata lines appear between the git header and the first hunk.
        if !builder.in_hunk {
            if line.starts_with("new file mode") {
                builder.file.status = FileStatus::Added;
                continue;
            }
            if line.starts_with("deleted file mode") {
                builder.file.status = FileStatus::Removed;
                continue;
            }
            if line.starts_with("similarity index") || line.starts_with("rename from") {
                builder.file.status = FileStatus::Renamed;
                continue;
            }
            if line.starts_with("rename to") {
                continue;
            }
            if line.starts_with("Binary files") {
                builder.file.is_binary = true;
                continue;
            }
            if let Some(rest) = line.strip_prefix("--- ") {
                if rest == "/dev/null" {
                    builder.file.status = FileStatus::Added;
                }
                continue;
            }
            if let Some(rest) = line.strip_prefix("+++ ") {
                if rest == "/dev/null" {
                    builder.file.status = FileStatus::Removed;
                } else if builder.file.status != FileStatus::Added {
                    // The +++ path is authoritative for the new filename.
                    if let Some(path) = rest.strip_prefix("b/") {
                        if path != builder.file.path {
                            builder.file.path = path.to_string();
                            builder.file.language =
                                detect_language(path).map(str::to_string);
                        }
                    }
                }
                continue;
            }
            if line.starts_with("index ")
                || line.starts_with("old mode")
                || line.starts_with("new mode")
            {
                continue;
            }
        }

        if line.starts_with("@@") {
            match parse_hunk_header(line) {
                Some((old_start, old_count, new_start, new_count, symbol)) => {
                    // The header itself occupies a position.
                    builder.position += 1;
                    builder.file.hunks.push(Hunk {
                        old_start,
                        old_count,
                        new_start,
                        new_count,
                        header: line.to_string(),
                        enclosing_symbol: symbol,
                        lines: Vec::new(),
                    });
                    builder.old_line = old_start.saturating_sub(1);
                    builder.new_line = new_start.saturating_sub(1);
                    builder.in_hunk = true;
                }
                None => {
                    builder.malformed = true;
                }
            }
            continue;
        }

        if !builder.in_hunk {
            continue;
        }

        // The no-newline marker belongs to the previous line and does not
        // advance the position counter.
        if line.starts_with("\\ No newline at end of file") {
            continue;
        }
        // Bare empty lines are not diff content; real body lines always
        // start with '+', '-', or ' '.
        if line.is_empty() {
            continue;
        }

        builder.position += 1;
        let hunk = builder
            .file
            .hunks
            .last_mut()
            .expect("in_hunk implies at least one hunk");

        if let Some(content) = line.strip_prefix('+') {
            builder.new_line += 1;
            builder.file.additions += 1;
            hunk.lines.push(DiffLine {
                content: content.to_string(),
                kind: LineKind::Added,
                old_line: None,
                new_line: Some(builder.new_line),
                position: builder.position,
            });
        } else if let Some(content) = line.strip_prefix('-') {
            builder.old_line += 1;
            builder.file.deletions += 1;
            hunk.lines.push(DiffLine {
                content: content.to_string(),
                kind: LineKind::Removed,
                old_line: Some(builder.old_line),
                new_line: None,
                position: builder.position,
            });
        } else {
            builder.old_line += 1;
            builder.new_line += 1;
            let content = line.strip_prefix(' ').unwrap_or(line);
            hunk.lines.push(DiffLine {
                content: content.to_string(),
                kind: LineKind::Context,
                old_line: Some(builder.old_line),
                new_line: Some(builder.new_line),
                position: builder.position,
            });
        }
    }

    if let Some(done) = current.take() {
        done.finish(&mut files);
    }

    debug!(
        files = files.len(),
        added = files.iter().filter(|f| f.status == FileStatus::Added).count(),
        removed = files
            .iter()
            .filter(|f| f.status == FileStatus::Removed)
            .count(),
        "parsed diff"
    );

    files
}

/// Map new-file line numbers to diff positions for every commentable line.
///
/// Removed lines have no new-file coordinate and are absent; everything in
/// the returned map is safe to hand to the review API as a position.
pub fn line_position_map(file: &FileDiff) -> BTreeMap<u32, u32> {
    file.hunks
        .iter()
        .flat_map(|h| h.lines.iter())
        .filter(|l| matches!(l.kind, LineKind::Added | LineKind::Context))
        .filter_map(|l| l.new_line.map(|n| (n, l.position)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE_MODIFICATION: &str = "\
diff --git a/app/utils.py b/app/utils.py
index 1234567..89abcde 100644
--- a/app/utils.py
+++ b/app/utils.py
@@ -10,7 +10,8 @@ def process_data(items):
     results = []
     for item in items:
-        results.append(item * 2)
+        value = item * 2
+        results.append(value)
     return results
";

    const NEW_FILE: &str = "\
diff --git a/src/config.rs b/src/config.rs
new file mode 100644
index 0000000..1111111
--- /dev/null
+++ b/src/config.rs
@@ -0,0 +1,4 @@
+pub struct Config {
+    pub port: u16,
+    pub verbose: bool,
+}
";

    const DELETED_FILE: &str = "\
diff --git a/legacy/shim.js b/legacy/shim.js
deleted file mode 100644
index 2222222..0000000
--- a/legacy/shim.js
+++ /dev/null
@@ -1,3 +0,0 @@
-function shim() {
-  return null;
-}
";

    const RENAMED_FILE: &str = "\
diff --git a/src/old_name.go b/src/new_name.go
similarity index 92%
rename from src/old_name.go
rename to src/new_name.go
index 3333333..4444444 100644
--- a/src/old_name.go
+++ b/src/new_name.go
@@ -5,3 +5,4 @@ func handler() {
 \tlog.Println(\"start\")
+\tlog.Println(\"extra\")
 \treturn
 }
";

    // Two hunks: new-file lines 5-7 (one added line at 6) and new-file
    // lines 40-42 (one added line at 41).
    const MULTI_HUNK: &str = "\
diff --git a/lib/core.py b/lib/core.py
index 5555555..6666666 100644
--- a/lib/core.py
+++ b/lib/core.py
@@ -5,2 +5,3 @@ def first():
 alpha
+beta
 gamma
@@ -39,2 +40,3 @@ def second():
 delta
+epsilon
 zeta
";

    const BINARY_FILE: &str = "\
diff --git a/assets/logo.png b/assets/logo.png
index 7777777..8888888 100644
Binary files a/assets/logo.png and b/assets/logo.png differ
";

    const NO_NEWLINE: &str = "\
diff --git a/notes b/notes
index aaaaaaa..bbbbbbb 100644
--- a/notes
+++ b/notes
@@ -1,2 +1,2 @@
 first
-second
\\ No newline at end of file
+second!
\\ No newline at end of file
";

    const MALFORMED_THEN_GOOD: &str = "\
diff --git a/bad.py b/bad.py
index 1111111..2222222 100644
--- a/bad.py
+++ b/bad.py
@@ -3,1 @@
-broken
diff --git a/good.py b/good.py
index 3333333..4444444 100644
--- a/good.py
+++ b/good.py
@@ -1,1 +1,2 @@
 ok
+fine
";

    #[test]
    fn simple_modification_parses_one_file() {
        let files = parse_diff(SIMPLE_MODIFICATION);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "app/utils.py");
        assert_eq!(files[0].status, FileStatus::Modified);
        assert_eq!(files[0].language.as_deref(), Some("python"));
        assert_eq!(files[0].hunks.len(), 1);
        assert_eq!(files[0].additions, 2);
        assert_eq!(files[0].deletions, 1);
    }

    #[test]
    fn simple_modification_positions_follow_counting_rules() {
        let files = parse_diff(SIMPLE_MODIFICATION);
        let lines = &files[0].hunks[0].lines;
        // Header is position 1, body lines count up from 2.
        let positions: Vec<u32> = lines.iter().map(|l| l.position).collect();
        assert_eq!(positions, vec![2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn simple_modification_extracts_enclosing_symbol() {
        let files = parse_diff(SIMPLE_MODIFICATION);
        assert_eq!(
            files[0].hunks[0].enclosing_symbol.as_deref(),
            Some("def process_data(items):")
        );
    }

    #[test]
    fn new_file_is_all_additions() {
        let files = parse_diff(NEW_FILE);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].status, FileStatus::Added);
        assert_eq!(files[0].deletions, 0);
        for line in files[0].hunks.iter().flat_map(|h| h.lines.iter()) {
            assert_eq!(line.kind, LineKind::Added);
            assert!(line.old_line.is_none());
        }
        // New-file line numbers are sequential from 1.
        let new_lines: Vec<u32> = files[0].hunks[0]
            .lines
            .iter()
            .filter_map(|l| l.new_line)
            .collect();
        assert_eq!(new_lines, vec![1, 2, 3, 4]);
    }

    #[test]
    fn deleted_file_has_no_new_lines() {
        let files = parse_diff(DELETED_FILE);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].status, FileStatus::Removed);
        assert_eq!(files[0].additions, 0);
        for line in files[0].hunks.iter().flat_map(|h| h.lines.iter()) {
            assert_eq!(line.kind, LineKind::Removed);
            assert!(line.new_line.is_none());
        }
    }

    #[test]
    fn renamed_file_carries_both_paths() {
        let files = parse_diff(RENAMED_FILE);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].status, FileStatus::Renamed);
        assert_eq!(files[0].path, "src/new_name.go");
        assert_eq!(files[0].old_path.as_deref(), Some("src/old_name.go"));
    }

    #[test]
    fn multi_hunk_positions_are_cumulative() {
        let files = parse_diff(MULTI_HUNK);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].hunks.len(), 2);

        let all_positions: Vec<u32> = files[0]
            .hunks
            .iter()
            .flat_map(|h| h.lines.iter())
            .map(|l| l.position)
            .collect();
        for pair in all_positions.windows(2) {
            assert!(pair[1] > pair[0], "positions must strictly increase");
        }

        // First hunk: header=1, lines alpha/beta/gamma=2,3,4.
        // Second hunk: header=5, lines delta/epsilon/zeta=6,7,8.
        assert_eq!(all_positions, vec![2, 3, 4, 6, 7, 8]);
    }

    #[test]
    fn multi_hunk_added_line_in_second_hunk_maps_cumulatively() {
        // The added line "epsilon" is new-file line 41; its position must
        // count the first hunk's header and body plus the second header.
        let files = parse_diff(MULTI_HUNK);
        let map = line_position_map(&files[0]);
        assert_eq!(map.get(&41), Some(&7));
        // And it sits in the second hunk.
        assert_eq!(files[0].hunk_index_for_new_line(41), Some(1));
        assert_eq!(files[0].hunk_index_for_new_line(6), Some(0));
    }

    #[test]
    fn binary_file_flagged_without_lines() {
        let files = parse_diff(BINARY_FILE);
        assert_eq!(files.len(), 1);
        assert!(files[0].is_binary);
        assert!(files[0].hunks.is_empty());
    }

    #[test]
    fn no_newline_marker_does_not_affect_positions() {
        let files = parse_diff(NO_NEWLINE);
        assert_eq!(files.len(), 1);
        let lines = &files[0].hunks[0].lines;
        assert_eq!(lines.len(), 3);
        let positions: Vec<u32> = lines.iter().map(|l| l.position).collect();
        assert_eq!(positions, vec![2, 3, 4]);
        for line in lines {
            assert!(!line.content.contains("No newline"));
        }
    }

    #[test]
    fn empty_input_yields_no_files() {
        assert!(parse_diff("").is_empty());
        assert!(parse_diff("   \n\n  ").is_empty());
    }

    #[test]
    fn malformed_hunk_header_drops_only_that_file() {
        let files = parse_diff(MALFORMED_THEN_GOOD);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "good.py");
        assert_eq!(files[0].additions, 1);
    }

    #[test]
    fn crlf_input_parses_identically() {
        let crlf = SIMPLE_MODIFICATION.replace('\n', "\r\n");
        assert_eq!(parse_diff(&crlf), parse_diff(SIMPLE_MODIFICATION));
    }

    #[test]
    fn file_diff_serde_round_trip() {
        let files = parse_diff(MULTI_HUNK);
        let json = serde_json::to_string(&files[0]).unwrap();
        let back: FileDiff = serde_json::from_str(&json).unwrap();
        assert_eq!(back, files[0]);
    }

    #[test]
    fn position_map_contains_only_commentable_lines() {
        let files = parse_diff(SIMPLE_MODIFICATION);
        let map = line_position_map(&files[0]);
        for (&line, &pos) in &map {
            assert!(line > 0);
            assert!(pos > 0);
        }
        // The removed line must be absent: it has no new-file coordinate.
        let removed_positions: Vec<u32> = files[0].hunks[0]
            .lines
            .iter()
            .filter(|l| l.kind == LineKind::Removed)
            .map(|l| l.position)
            .collect();
        for pos in removed_positions {
            assert!(!map.values().any(|&p| p == pos));
        }
    }

    #[test]
    fn position_map_for_new_file_covers_every_addition() {
        let files = parse_diff(NEW_FILE);
        let map = line_position_map(&files[0]);
        assert_eq!(map.len() as u32, files[0].additions);
    }

    #[test]
    fn position_map_for_deleted_file_is_empty() {
        let files = parse_diff(DELETED_FILE);
        assert!(line_position_map(&files[0]).is_empty());
    }

    #[test]
    fn language_detection_uses_extension_table() {
        assert_eq!(detect_language("a/b/main.rs"), Some("rust"));
        assert_eq!(detect_language("web/app.tsx"), Some("typescript"));
        assert_eq!(detect_language("setup.cfg"), Some("ini"));
        assert_eq!(detect_language("Dockerfile"), None);
        assert_eq!(detect_language("weird.xyz"), None);
    }

    #[test]
    fn hunk_header_without_plus_range_is_malformed() {
        assert!(parse_hunk_header("@@ -3,1 @@").is_none());
        assert!(parse_hunk_header("@@ -3,1 +4,2 @@").is_some());
        assert!(parse_hunk_header("@@ -3 +4 @@ fn thing()").is_some());
    }
}
