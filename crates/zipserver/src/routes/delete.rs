//! `GET /delete` (§4.7 Delete): removes one or more keys from `target`,
//! under the `delete` lock-table family.

use std::sync::Arc;

use axum::{
    extract::State,
    response::{
        IntoResponse,
        Response,
    },
};
use axum_extra::extract::Query;
use lock_table::Fingerprint;
use serde::Deserialize;
use transfer_ops::TransferOutcome;

use crate::{
    app::AppState,
    response::{
        simple_success,
        AppError,
        ProcessingBody,
    },
};

#[derive(Debug, Deserialize)]
pub struct DeleteQuery {
    pub target: String,
    #[serde(rename = "key[]")]
    pub keys: Vec<String>,
    #[serde(rename = "async")]
    pub async_url: Option<String>,
}

fn success_fields(deleted: &Vec<String>) -> Vec<(String, String)> {
    deleted.iter().enumerate().map(|(i, key)| (format!("Deleted[{i}]"), key.clone())).collect()
}

pub async fn handle(State(state): State<Arc<AppState>>, Query(query): Query<DeleteQuery>) -> Result<Response, AppError> {
    let mut sorted_keys = query.keys.clone();
    sorted_keys.sort();
    let fingerprint = Fingerprint::new(&query.target, &sorted_keys.join("\u{0}"));
    let storage = state.storage.clone();

    let outcome = transfer_ops::run_locked(
        state.lock_tables.delete.clone(),
        fingerprint,
        "delete",
        state.http_client.clone(),
        state.callback_timeout,
        query.async_url,
        success_fields,
        move || async move { transfer_ops::delete_many(storage.as_ref(), &query.target, &query.keys).await.into_result() },
    )
    .await;

    match outcome {
        TransferOutcome::Accepted => Ok(ProcessingBody::accepted().into_response()),
        TransferOutcome::Contention => Ok(ProcessingBody::contention().into_response()),
        TransferOutcome::Completed(Ok(deleted)) => Ok(simple_success(serde_json::json!({ "Deleted": deleted })).into_response()),
        TransferOutcome::Completed(Err(e)) => Err(AppError(e)),
    }
}
