use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{http::StatusCode, response::Json, routing::get, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, Level};

use goshawk_core::Gatekeeper;
use goshawk_server::admin::admin_router;
use goshawk_server::config::Config;
use goshawk_server::github::{GithubClient, DEFAULT_API_BASE};
use goshawk_server::model::{ModelClient, DEFAULT_MODEL_API_BASE};
use goshawk_server::queue::{RetryPolicy, Scheduler};
use goshawk_server::token::TokenCache;
use goshawk_server::webhook::webhook_router;
use goshawk_server::{AppState, Database, ReviewDeps, WorkerExecutor};

async fn health_check() -> Result<Json<serde_json::Value>, StatusCode> {
    Ok(Json(json!({
        "status": "healthy",
        "service": "goshawk"
    })))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting goshawk review service");

    let config =
        Config::from_env().expect("Failed to load configuration from environment variables");

    let http_client = reqwest::Client::builder()
        .user_agent(format!("goshawk/{}", goshawk_server::get_service_version()))
        .timeout(Duration::from_secs(30))
        .build()
        .expect("Failed to create HTTP client");

    // The signing key is parsed here; a missing or malformed key aborts
    // startup with a diagnostic rather than failing on the first review.
    let tokens = Arc::new(
        TokenCache::new(
            http_client.clone(),
            DEFAULT_API_BASE.to_string(),
            config.github_app_id,
            &config.github_private_key,
        )
        .expect("Failed to initialize token cache; check GITHUB_PRIVATE_KEY"),
    );

    let github = Arc::new(GithubClient::new(
        http_client.clone(),
        DEFAULT_API_BASE.to_string(),
        tokens,
    ));

    let model = Arc::new(ModelClient::new(
        http_client,
        DEFAULT_MODEL_API_BASE.to_string(),
        config.model_api_key.clone(),
    ));

    let db_path = config.state_dir.join("goshawk-state.db");
    info!("Using state database: {}", db_path.display());
    let db = Arc::new(Database::new(&db_path).expect("Failed to initialize SQLite database"));

    // Jobs claimed by a previous process hold stale leases; requeue them
    // before accepting new work.
    let reaped = db.reap_expired_leases().expect("Failed to reap stale leases");
    if reaped > 0 {
        info!(reaped, "requeued jobs orphaned by a previous run");
    }

    let shutdown = CancellationToken::new();
    let scheduler = Arc::new(Scheduler::new(
        db.clone(),
        RetryPolicy {
            max_retries: config.max_retries,
            initial: Duration::from_secs(config.retry_initial_secs),
            cap: Duration::from_secs(config.retry_cap_secs),
        },
        Duration::from_secs(config.soft_deadline_secs),
        Duration::from_secs(config.hard_deadline_secs),
        shutdown.clone(),
    ));

    let deps = Arc::new(ReviewDeps {
        db: db.clone(),
        github: github.clone(),
        model,
        call_sites: None,
        cost_ceiling_usd: config.cost_ceiling_usd,
        model_concurrency: config.model_concurrency,
        large_pr_threshold: config.large_pr_threshold,
        max_retries: config.max_retries,
    });
    let executor = Arc::new(WorkerExecutor { deps });

    scheduler.spawn_workers(goshawk_core::Lane::Fast, config.lane_workers.fast, executor.clone());
    scheduler.spawn_workers(goshawk_core::Lane::Slow, config.lane_workers.slow, executor.clone());
    scheduler.spawn_workers(goshawk_core::Lane::Index, config.lane_workers.index, executor);
    scheduler.spawn_maintenance();

    let gatekeeper = Gatekeeper::new(config.large_pr_threshold, &[]);
    let port = config.port;
    let app_state = Arc::new(AppState {
        config,
        db,
        github,
        scheduler,
        gatekeeper,
    });

    let app = Router::new()
        .route("/health", get(health_check))
        .merge(admin_router())
        .merge(webhook_router(app_state.clone()))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(app_state);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("Server listening on port {}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested, stopping workers");
            shutdown.cancel();
        })
        .await?;

    Ok(())
}
