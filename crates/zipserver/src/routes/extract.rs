//! `GET /extract` (§6): fetches an archive, extracts it under a bucket
//! prefix, and returns the uploaded keys -- synchronously or, with `async`,
//! by callback.
//!
//! The HTTP surface has no separate source/destination bucket parameters, so
//! `target` does double duty as both: extraction reads and writes within the
//! same bucket, with `key` naming the archive and `prefix` naming where its
//! contents land.

use std::sync::Arc;

use axum::{
    extract::State,
    response::{
        IntoResponse,
        Response,
    },
};
use axum_extra::extract::Query;
use job_coordinator::{
    ExtractRequest,
    JobOutcome,
};
use scanner::ExtractionLimits;
use serde::Deserialize;

use crate::{
    app::AppState,
    response::{
        AppError,
        ExtractSuccessBody,
        ExtractedFile,
        ProcessingBody,
    },
};

#[derive(Debug, Deserialize)]
pub struct ExtractQuery {
    pub key: String,
    pub prefix: String,
    pub target: String,
    #[serde(rename = "async")]
    pub async_url: Option<String>,
    pub filter: Option<String>,
    #[serde(rename = "only_files[]", default)]
    pub only_files: Vec<String>,
    #[serde(rename = "maxFileSize")]
    pub max_file_size: Option<u64>,
    #[serde(rename = "maxTotalSize")]
    pub max_total_size: Option<u64>,
    #[serde(rename = "maxNumFiles")]
    pub max_num_files: Option<u64>,
    #[serde(rename = "maxFileNameLength")]
    pub max_file_name_length: Option<u64>,
    #[serde(rename = "maxInputZipSize")]
    pub max_input_zip_size: Option<u64>,
    pub html_footer: Option<String>,
}

fn limits_from_query(state: &AppState, query: &ExtractQuery) -> anyhow::Result<ExtractionLimits> {
    let defaults = &state.default_limits;
    let limits = ExtractionLimits {
        max_input_size: query.max_input_zip_size.unwrap_or(defaults.max_input_size),
        max_entry_size: query.max_file_size.unwrap_or(defaults.max_entry_size),
        max_total_size: query.max_total_size.unwrap_or(defaults.max_total_size),
        max_entries: query.max_num_files.unwrap_or(defaults.max_entries),
        max_path_length: query.max_file_name_length.unwrap_or(defaults.max_path_length),
        worker_pool_size: defaults.worker_pool_size,
        include_glob: query.filter.clone(),
        allow_list: if query.only_files.is_empty() { None } else { Some(query.only_files.clone()) },
        html_tail: query.html_footer.clone(),
    };
    limits.validate()?;
    Ok(limits)
}

pub async fn handle(State(state): State<Arc<AppState>>, Query(query): Query<ExtractQuery>) -> Result<Response, AppError> {
    let limits = limits_from_query(&state, &query)?;
    let req = ExtractRequest {
        source_bucket: query.target.clone(),
        source_key: query.key,
        target_name: query.target.clone(),
        dest_bucket: query.target,
        dest_prefix: query.prefix,
        limits,
        callback_url: query.async_url,
        cancel: None,
    };

    match state.coordinator.handle_extract(req).await {
        JobOutcome::Accepted => Ok(ProcessingBody::accepted().into_response()),
        JobOutcome::Contention => Ok(ProcessingBody::contention().into_response()),
        JobOutcome::Completed(Ok(success)) => {
            let body = ExtractSuccessBody {
                success: true,
                extracted_files: success
                    .uploaded
                    .into_iter()
                    .map(|u| ExtractedFile {
                        key: u.destination_key,
                        size: u.bytes_written,
                        md5: u.md5_hex,
                        injected: u.injected,
                    })
                    .collect(),
            };
            Ok(axum::Json(body).into_response())
        },
        JobOutcome::Completed(Err(e)) => Err(AppError(e)),
    }
}
