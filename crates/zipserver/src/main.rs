//! `zipserver`: fetches zip archives from object storage, extracts them
//! under per-key locking with configurable safety limits, and exposes a
//! handful of sibling single-object operations (copy/delete/list/slurp)
//! alongside it.

mod app;
mod backend;
mod config;
mod response;
mod routes;

use std::sync::Arc;

use clap::Parser;
use cmd_util::env::config_service;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _guard = config_service();
    let config = config::Config::parse();

    let state = Arc::new(app::AppState::new(&config).await?);
    let router = app::router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!("zipserver listening on {}", config.bind_addr);
    axum::serve(listener, router).await?;
    Ok(())
}
