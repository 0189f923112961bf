//! `GET /list` (§4.7 List): lists the entries of the archive at
//! `target`/`key`, under the `list` lock-table family. Always synchronous --
//! there's no `async` parameter on this route.

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
use serde::{
    Deserialize,
    Serialize,
};
use transfer_ops::{
    ArchiveEntryInfo,
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
pub struct ListQuery {
    pub target: String,
    pub key: String,
}

#[derive(Serialize)]
struct EntryBody {
    #[serde(rename = "Path")]
    path: String,
    #[serde(rename = "Size")]
    size: u64,
    #[serde(rename = "IsDirectory")]
    is_directory: bool,
}

fn success_fields(_: &Vec<ArchiveEntryInfo>) -> Vec<(String, String)> {
    vec![]
}

pub async fn handle(State(state): State<Arc<AppState>>, Query(query): Query<ListQuery>) -> Result<Response, AppError> {
    let fingerprint = Fingerprint::new(&query.target, &query.key);
    let storage = state.storage.clone();
    let fetcher = state.fetcher.clone();
    let max_input_size = state.default_limits.max_input_size;

    let outcome = transfer_ops::run_locked(
        state.lock_tables.list.clone(),
        fingerprint,
        "list",
        state.http_client.clone(),
        state.callback_timeout,
        None,
        success_fields,
        move || async move { transfer_ops::list(storage.as_ref(), &query.target, &query.key, &fetcher, max_input_size).await },
    )
    .await;

    match outcome {
        TransferOutcome::Accepted => Ok(ProcessingBody::accepted().into_response()),
        TransferOutcome::Contention => Ok(ProcessingBody::contention().into_response()),
        TransferOutcome::Completed(Ok(entries)) => {
            let entries = entries
                .into_iter()
                .map(|e| EntryBody {
                    path: e.path,
                    size: e.declared_size,
                    is_directory: e.is_dir,
                })
                .collect::<Vec<_>>();
            Ok(simple_success(serde_json::json!({ "Entries": entries })).into_response())
        },
        TransferOutcome::Completed(Err(e)) => Err(AppError(e)),
    }
}
