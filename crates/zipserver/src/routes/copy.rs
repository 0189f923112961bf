//! `GET /copy` (§4.7 Copy): streams one object from `target`/`key` to
//! `dest_target`/`dest_key`, under the `copy` lock-table family.

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
    copy,
    CopyRequest,
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
pub struct CopyQuery {
    pub target: String,
    pub key: String,
    pub dest_target: String,
    pub dest_key: String,
    #[serde(rename = "async")]
    pub async_url: Option<String>,
}

struct CopyOutcome {
    dest_key: String,
    result: storage::PutObjectResult,
}

fn success_fields(outcome: &CopyOutcome) -> Vec<(String, String)> {
    vec![
        ("Key".to_string(), outcome.dest_key.clone()),
        ("Size".to_string(), outcome.result.bytes_written.to_string()),
        ("MD5".to_string(), outcome.result.md5_hex.clone()),
    ]
}

pub async fn handle(State(state): State<Arc<AppState>>, Query(query): Query<CopyQuery>) -> Result<Response, AppError> {
    let fingerprint = Fingerprint::new(&query.dest_target, &query.dest_key);
    let storage = state.storage.clone();
    let dest_key_for_fields = query.dest_key.clone();

    let outcome = transfer_ops::run_locked(
        state.lock_tables.copy.clone(),
        fingerprint,
        "copy",
        state.http_client.clone(),
        state.callback_timeout,
        query.async_url,
        success_fields,
        move || async move {
            let result = copy(CopyRequest {
                source: storage.as_ref(),
                source_bucket: &query.target,
                source_key: &query.key,
                dest: storage.as_ref(),
                dest_bucket: &query.dest_target,
                dest_key: &query.dest_key,
            })
            .await?;
            Ok(CopyOutcome {
                dest_key: dest_key_for_fields,
                result,
            })
        },
    )
    .await;

    match outcome {
        TransferOutcome::Accepted => Ok(ProcessingBody::accepted().into_response()),
        TransferOutcome::Contention => Ok(ProcessingBody::contention().into_response()),
        TransferOutcome::Completed(Ok(outcome)) => Ok(simple_success(serde_json::json!({
            "Key": outcome.dest_key,
            "Size": outcome.result.bytes_written,
            "MD5": outcome.result.md5_hex,
        }))
        .into_response()),
        TransferOutcome::Completed(Err(e)) => Err(AppError(e)),
    }
}
