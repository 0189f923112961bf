//! Shared application state and router assembly.

use std::{
    sync::Arc,
    time::Duration,
};

use axum::{
    routing::get,
    Router,
};
use fetcher::Fetcher;
use job_coordinator::JobCoordinator;
use scanner::ExtractionLimits;
use tower_http::trace::TraceLayer;
use transfer_ops::TransferLockTables;

use crate::{
    backend::BackendStorage,
    config::Config,
    routes,
};

pub struct AppState {
    pub storage: Arc<BackendStorage>,
    pub coordinator: Arc<JobCoordinator<BackendStorage>>,
    pub lock_tables: TransferLockTables,
    pub fetcher: Fetcher,
    pub http_client: reqwest::Client,
    pub default_limits: ExtractionLimits,
    pub callback_timeout: Duration,
}

impl AppState {
    pub async fn new(config: &Config) -> anyhow::Result<Self> {
        let storage = Arc::new(BackendStorage::from_config(config).await?);
        let scratch_dir = config.resolve_scratch_dir();
        tokio::fs::create_dir_all(&scratch_dir).await?;
        let coordinator = Arc::new(JobCoordinator::new(
            Arc::new(lock_table::LockTable::new("extract")),
            storage.clone(),
            scratch_dir.clone(),
            config.pre_compress_config(),
            config.job_timeouts(),
        ));
        Ok(Self {
            storage,
            coordinator,
            lock_tables: TransferLockTables::default(),
            fetcher: Fetcher::new(scratch_dir),
            http_client: reqwest::Client::new(),
            default_limits: config.default_limits(),
            callback_timeout: config.callback_timeout(),
        })
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/extract", get(routes::extract::handle))
        .route("/copy", get(routes::copy::handle))
        .route("/delete", get(routes::delete::handle))
        .route("/list", get(routes::list::handle))
        .route("/slurp", get(routes::slurp::handle))
        .route("/metrics", get(routes::metrics::handle))
        .route("/healthz", get(routes::health::handle))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
