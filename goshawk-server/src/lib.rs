pub mod admin;
pub mod analysis;
pub mod config;
pub mod conversation;
pub mod db;
pub mod error;
pub mod github;
pub mod model;
pub mod orchestrator;
pub mod queue;
pub mod signature;
pub mod token;
pub mod webhook;

use std::sync::Arc;

pub use config::Config;
pub use db::Database;
pub use error::ReviewError;
pub use github::GithubClient;
pub use orchestrator::{ReviewDeps, WorkerExecutor};
pub use queue::Scheduler;

use goshawk_core::Gatekeeper;

/// Shared state for the HTTP surface (gateway + admin). Workers get their
/// own `ReviewDeps`; nothing here is a process-global singleton.
pub struct AppState {
    pub config: Config,
    pub db: Arc<Database>,
    pub github: Arc<GithubClient>,
    pub scheduler: Arc<Scheduler>,
    pub gatekeeper: Gatekeeper,
}

/// Returns the service version for operator-facing surfaces.
pub fn get_service_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
