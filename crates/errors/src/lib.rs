use std::{
    borrow::Cow,
    sync::LazyLock,
};

use http::StatusCode;

mod metrics;

/// These module prefixes are default-hidden from stacktraces
/// See https://docs.sentry.io/platforms/rust/configuration/options/#in-app-exclude
pub static SENTRY_IN_APP_EXCLUDE: LazyLock<Vec<&'static str>> = LazyLock::new(|| vec!["tokio::"]);

/// `ErrorMetadata` is attached to an `anyhow` error chain via
/// `.context(e /*ErrorMetadata*/)`. It tags an error with the classification
/// needed to render an HTTP response, decide on Sentry reporting, and match
/// in tests without depending on exact prose.
///
/// `msg` is shown to HTTP/callback clients. `short_msg` is a stable
/// ScreamingCamelCase tag used by tests and by the async callback payload's
/// `Type`/`Error` fields.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{msg}")]
pub struct ErrorMetadata {
    pub code: ErrorCode,
    pub short_msg: Cow<'static, str>,
    pub msg: Cow<'static, str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Malformed or contradictory request parameters (e.g. both `filter` and
    /// `only_files` given).
    InvalidParams,
    /// Any of the bounded limits in `ExtractionLimits` was violated.
    LimitExceeded,
    /// Source read or scratch-file write failure while materializing the
    /// archive.
    FetchError,
    /// A per-entry failure after extraction began (uploads, per-entry
    /// timeouts).
    ExtractError,
    /// The `copy` sibling operation failed.
    CopyError,
    /// The `delete` sibling operation failed.
    DeleteError,
    /// The `slurp` (URL ingestion) sibling operation failed.
    SlurpError,
    /// The job-wide deadline elapsed.
    Timeout,
    /// The fingerprint lock was already held by another job.
    ContentionBusy,
    /// Requested object does not exist.
    NotFound,
    /// Unclassified internal failure.
    OperationalInternalServerError,
}

impl ErrorMetadata {
    pub fn invalid_params(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::InvalidParams,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn limit_exceeded(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::LimitExceeded,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn fetch_error(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::FetchError,
            short_msg: "FetchError".into(),
            msg: msg.into(),
        }
    }

    pub fn extract_error(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::ExtractError,
            short_msg: "ExtractError".into(),
            msg: msg.into(),
        }
    }

    pub fn copy_error(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::CopyError,
            short_msg: "CopyError".into(),
            msg: msg.into(),
        }
    }

    pub fn delete_error(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::DeleteError,
            short_msg: "DeleteError".into(),
            msg: msg.into(),
        }
    }

    pub fn slurp_error(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::SlurpError,
            short_msg: "SlurpError".into(),
            msg: msg.into(),
        }
    }

    pub fn timeout(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::Timeout,
            short_msg: "Timeout".into(),
            msg: msg.into(),
        }
    }

    pub fn contention_busy() -> Self {
        Self {
            code: ErrorCode::ContentionBusy,
            short_msg: "ContentionBusy".into(),
            msg: "Another job is already processing this key".into(),
        }
    }

    pub fn not_found(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::NotFound,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn operational_internal_server_error() -> Self {
        Self {
            code: ErrorCode::OperationalInternalServerError,
            short_msg: INTERNAL_SERVER_ERROR.into(),
            msg: INTERNAL_SERVER_ERROR_MSG.into(),
        }
    }

    pub fn is_contention_busy(&self) -> bool {
        self.code == ErrorCode::ContentionBusy
    }

    pub fn is_limit_exceeded(&self) -> bool {
        self.code == ErrorCode::LimitExceeded
    }

    pub fn is_timeout(&self) -> bool {
        self.code == ErrorCode::Timeout
    }

    /// The `Type` field used in the async callback's error payload, and in
    /// HTTP error JSON responses.
    pub fn callback_type(&self) -> &str {
        &self.short_msg
    }

    pub fn should_report_to_sentry(&self) -> Option<sentry::Level> {
        match self.code {
            ErrorCode::ContentionBusy | ErrorCode::NotFound | ErrorCode::InvalidParams => {
                Some(sentry::Level::Info)
            },
            ErrorCode::LimitExceeded | ErrorCode::Timeout => Some(sentry::Level::Warning),
            ErrorCode::FetchError
            | ErrorCode::ExtractError
            | ErrorCode::CopyError
            | ErrorCode::DeleteError
            | ErrorCode::SlurpError
            | ErrorCode::OperationalInternalServerError => Some(sentry::Level::Error),
        }
    }

    pub fn custom_metric(&self) -> Option<&'static prometheus::IntCounterVec> {
        Some(&crate::metrics::CLASSIFIED_ERROR_TOTAL)
    }
}

impl ErrorCode {
    pub fn http_status_code(&self) -> StatusCode {
        match self {
            ErrorCode::InvalidParams => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::ContentionBusy => StatusCode::OK, // contention is a normal, expected response
            ErrorCode::LimitExceeded => StatusCode::BAD_REQUEST,
            ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::FetchError
            | ErrorCode::ExtractError
            | ErrorCode::CopyError
            | ErrorCode::DeleteError
            | ErrorCode::SlurpError => StatusCode::BAD_GATEWAY,
            ErrorCode::OperationalInternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub trait ErrorMetadataAnyhowExt {
    fn error_metadata(&self) -> Option<&ErrorMetadata>;
    fn is_contention_busy(&self) -> bool;
    fn is_limit_exceeded(&self) -> bool;
    fn short_msg(&self) -> &str;
    fn user_facing_message(&self) -> String;
    fn http_status(&self) -> StatusCode;
    fn should_report_to_sentry(&self) -> Option<sentry::Level>;
    fn wrap_error_message<F>(self, f: F) -> Self
    where
        F: FnOnce(String) -> String;
}

impl ErrorMetadataAnyhowExt for anyhow::Error {
    fn error_metadata(&self) -> Option<&ErrorMetadata> {
        self.downcast_ref::<ErrorMetadata>()
    }

    fn is_contention_busy(&self) -> bool {
        self.error_metadata().is_some_and(|e| e.is_contention_busy())
    }

    fn is_limit_exceeded(&self) -> bool {
        self.error_metadata().is_some_and(|e| e.is_limit_exceeded())
    }

    fn short_msg(&self) -> &str {
        self.error_metadata()
            .map(|e| &*e.short_msg)
            .unwrap_or(INTERNAL_SERVER_ERROR)
    }

    fn user_facing_message(&self) -> String {
        match self.error_metadata() {
            Some(e) => e.to_string(),
            None => INTERNAL_SERVER_ERROR_MSG.to_string(),
        }
    }

    fn http_status(&self) -> StatusCode {
        self.error_metadata()
            .map(|e| e.code.http_status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn should_report_to_sentry(&self) -> Option<sentry::Level> {
        match self.error_metadata() {
            Some(e) => e.should_report_to_sentry(),
            None => Some(sentry::Level::Error),
        }
    }

    fn wrap_error_message<F>(self, f: F) -> Self
    where
        F: FnOnce(String) -> String,
    {
        if let Some(mut em) = self.downcast_ref::<ErrorMetadata>().cloned() {
            em.msg = f(em.msg.to_string()).into();
            return self.context(em);
        }
        let new_msg = f(self.to_string());
        self.context(new_msg)
    }
}

/// Log and report an error to Sentry at the severity implied by its
/// classification, once, at the point where it is about to leave the
/// process boundary (an HTTP response or a callback POST).
pub fn report_error(err: &anyhow::Error) {
    tracing::error!("{:?}", err);
    if let Some(level) = err.should_report_to_sentry() {
        sentry::with_scope(
            |scope| scope.set_level(Some(level)),
            || {
                sentry::integrations::anyhow::capture_anyhow(err);
            },
        );
    }
    if let Some(em) = err.error_metadata() {
        crate::metrics::log_classified_error(&em.short_msg);
    }
}

pub const INTERNAL_SERVER_ERROR_MSG: &str = "Your request couldn't be completed. Try again later.";
pub const INTERNAL_SERVER_ERROR: &str = "InternalServerError";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contention_busy_maps_to_ok_without_async_flag() {
        let em = ErrorMetadata::contention_busy();
        assert_eq!(em.code.http_status_code(), StatusCode::OK);
        assert_eq!(em.short_msg, "ContentionBusy");
    }

    #[test]
    fn wrap_error_message_preserves_classification() {
        let err = anyhow::Error::new(ErrorMetadata::limit_exceeded(
            "TooManyFiles",
            "too many files in archive",
        ))
        .wrap_error_message(|m| format!("extract: {m}"));
        assert!(err.is_limit_exceeded());
        assert_eq!(err.short_msg(), "TooManyFiles");
        assert!(err.to_string().contains("extract:"));
    }

    #[test]
    fn unclassified_error_is_internal() {
        let err = anyhow::anyhow!("boom");
        assert_eq!(err.http_status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.short_msg(), INTERNAL_SERVER_ERROR);
    }
}
