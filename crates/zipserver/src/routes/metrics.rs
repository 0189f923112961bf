//! `GET /metrics`: Prometheus text exposition of `CONVEX_METRICS_REGISTRY`.

use std::sync::Arc;

use axum::{
    extract::State,
    http::header::CONTENT_TYPE,
    response::{
        IntoResponse,
        Response,
    },
};
use prometheus::{
    Encoder,
    TextEncoder,
};

use crate::{
    app::AppState,
    response::AppError,
};

pub async fn handle(State(_state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let encoder = TextEncoder::new();
    let families = metrics::CONVEX_METRICS_REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&families, &mut buffer)?;
    Ok(([(CONTENT_TYPE, encoder.format_type().to_string())], buffer).into_response())
}
