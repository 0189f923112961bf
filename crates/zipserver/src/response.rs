//! JSON response envelopes shared by every handler (§6): the sync
//! success/error shapes, the async acknowledgment, and the contention
//! response, plus the `anyhow::Error -> HTTP response` bridge the router's
//! top-level error handler performs per §7.

use axum::{
    response::{
        IntoResponse,
        Response,
    },
    Json,
};
use errors::ErrorMetadataAnyhowExt;
use serde::Serialize;

/// Wraps any handler failure so `?` on an `anyhow::Result` renders the right
/// status code and `{Type, Error}` body, per §7's "router's top-level error
/// handler downcasts the `anyhow::Error` chain to find an `ErrorMetadata`".
pub struct AppError(pub anyhow::Error);

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        errors::report_error(&self.0);
        let status = self.0.http_status();
        let body = Json(serde_json::json!({
            "Type": self.0.short_msg(),
            "Error": self.0.user_facing_message(),
        }));
        (status, body).into_response()
    }
}

#[derive(Serialize)]
pub struct ExtractedFile {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "Size")]
    pub size: u64,
    #[serde(rename = "MD5")]
    pub md5: String,
    #[serde(rename = "Injected")]
    pub injected: bool,
}

#[derive(Serialize)]
pub struct ExtractSuccessBody {
    #[serde(rename = "Success")]
    pub success: bool,
    #[serde(rename = "ExtractedFiles")]
    pub extracted_files: Vec<ExtractedFile>,
}

/// `{Processing:true, Async:true}` (accepted) or `{Processing:true}`
/// (contention) -- the two responses are intentionally indistinguishable
/// apart from the `Async` field (§6).
#[derive(Serialize)]
pub struct ProcessingBody {
    #[serde(rename = "Processing")]
    pub processing: bool,
    #[serde(rename = "Async", skip_serializing_if = "Option::is_none")]
    pub is_async: Option<bool>,
}

impl ProcessingBody {
    pub fn accepted() -> Json<Self> {
        Json(Self {
            processing: true,
            is_async: Some(true),
        })
    }

    pub fn contention() -> Json<Self> {
        Json(Self {
            processing: true,
            is_async: None,
        })
    }
}

#[derive(Serialize)]
pub struct SimpleSuccessBody<T: Serialize> {
    #[serde(rename = "Success")]
    pub success: bool,
    #[serde(flatten)]
    pub fields: T,
}

pub fn simple_success<T: Serialize>(fields: T) -> Json<SimpleSuccessBody<T>> {
    Json(SimpleSuccessBody {
        success: true,
        fields,
    })
}
