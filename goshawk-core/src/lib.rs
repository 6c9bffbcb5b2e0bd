pub mod diff;
pub mod finding;
pub mod gatekeeper;
pub mod repo_config;

pub use diff::{
    detect_language, line_position_map, parse_diff, DiffLine, FileDiff, FileStatus, Hunk, LineKind,
};
pub use finding::{synthesize, Category, Finding, Severity, SynthesisOutcome, DEFAULT_MAX_FINDINGS};
pub use gatekeeper::{GateDecision, Gatekeeper, Lane, PullRequestFacts, DEFAULT_LARGE_PR_THRESHOLD};
pub use repo_config::{RepoConfig, REPO_CONFIG_PATH};

/// Returns the library version for operator-facing surfaces.
pub fn get_library_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
