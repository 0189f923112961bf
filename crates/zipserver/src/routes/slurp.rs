//! `GET /slurp` (§4.7 Slurp): pulls bytes from `url` and uploads them to
//! `target`/`key`, under the `slurp` lock-table family.

use std::sync::Arc;

use axum::{
    extract::{
        Query,
        State,
    },
    response::{
        IntoResponse,
        Response,
    },
};
use lock_table::Fingerprint;
use serde::Deserialize;
use transfer_ops::{
    slurp,
    SlurpRequest,
    TransferOutcome,
};

use crate::{
    app::AppState,
    response::{
        simple_success,
        AppError,
        ProcessingBody,
    },
};

#[derive(Debug, Deserialize)]
pub struct SlurpQuery {
    pub target: String,
    pub key: String,
    pub url: String,
    #[serde(rename = "async")]
    pub async_url: Option<String>,
}

struct SlurpOutcome {
    key: String,
    result: storage::PutObjectResult,
}

fn success_fields(outcome: &SlurpOutcome) -> Vec<(String, String)> {
    vec![
        ("Key".to_string(), outcome.key.clone()),
        ("Size".to_string(), outcome.result.bytes_written.to_string()),
        ("MD5".to_string(), outcome.result.md5_hex.clone()),
    ]
}

pub async fn handle(State(state): State<Arc<AppState>>, Query(query): Query<SlurpQuery>) -> Result<Response, AppError> {
    let fingerprint = Fingerprint::new(&query.target, &query.key);
    let storage = state.storage.clone();
    let http_client = state.http_client.clone();
    let max_input_size = state.default_limits.max_input_size;
    let key_for_fields = query.key.clone();

    let outcome = transfer_ops::run_locked(
        state.lock_tables.slurp.clone(),
        fingerprint,
        "slurp",
        state.http_client.clone(),
        state.callback_timeout,
        query.async_url,
        success_fields,
        move || async move {
            let result = slurp(SlurpRequest {
                http_client: &http_client,
                source_url: &query.url,
                dest: storage.as_ref(),
                dest_bucket: &query.target,
                dest_key: &query.key,
                max_input_size,
            })
            .await?;
            Ok(SlurpOutcome {
                key: key_for_fields,
                result,
            })
        },
    )
    .await;

    match outcome {
        TransferOutcome::Accepted => Ok(ProcessingBody::accepted().into_response()),
        TransferOutcome::Contention => Ok(ProcessingBody::contention().into_response()),
        TransferOutcome::Completed(Ok(outcome)) => Ok(simple_success(serde_json::json!({
            "Key": outcome.key,
            "Size": outcome.result.bytes_written,
            "MD5": outcome.result.md5_hex,
        }))
        .into_response()),
        TransferOutcome::Completed(Err(e)) => Err(AppError(e)),
    }
}
