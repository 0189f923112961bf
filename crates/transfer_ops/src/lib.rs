//! The four sibling transfer operations (§4.7): `copy`, `delete`, `list`, and
//! `slurp`. Each reuses a lock table from C1 (a distinct table per operation
//! family, so e.g. a `copy` and a `delete` on the same key never contend with
//! each other) and the same sync/async/contention response envelope as the
//! extraction job coordinator, but none of them run a worker pool, perform
//! rollback, or touch the entry processor -- they're single-shot operations.

use std::{
    sync::Arc,
    time::Duration,
};

use lock_table::{
    Fingerprint,
    LockTable,
};

mod copy;
mod delete;
mod list;
mod metrics;
mod slurp;

pub use copy::{
    copy,
    CopyRequest,
};
pub use delete::{
    delete_many,
    DeleteOutcome,
};
pub use list::{
    list,
    ArchiveEntryInfo,
};
pub use slurp::{
    slurp,
    SlurpRequest,
};

/// Mirrors `job_coordinator::JobOutcome`: contention when the fingerprint is
/// already locked, immediate acceptance when an async callback URL was given
/// (the work continues in a detached task), or the inline result otherwise.
pub enum TransferOutcome<T> {
    Contention,
    Accepted,
    Completed(anyhow::Result<T>),
}

/// Builds the callback POST body for one completed operation: `Success=true`
/// plus `success_fields(&value)` on success, or `Type`/`Error` (matching the
/// extraction job's error payload) on failure.
pub fn encode_callback_payload<T>(result: &anyhow::Result<T>, success_fields: impl FnOnce(&T) -> Vec<(String, String)>) -> Vec<(String, String)> {
    match result {
        Ok(value) => {
            let mut pairs = vec![("Success".to_string(), "true".to_string())];
            pairs.extend(success_fields(value));
            pairs
        },
        Err(e) => vec![
            ("Type".to_string(), errors::ErrorMetadataAnyhowExt::short_msg(e).to_string()),
            ("Error".to_string(), errors::ErrorMetadataAnyhowExt::user_facing_message(e)),
        ],
    }
}

/// Runs `work` under `table`'s lock for `fingerprint`. If `callback_url` is
/// set, the lock is handed off to a detached task that runs `work` to
/// completion and POSTs the result, and this returns `Accepted` immediately;
/// otherwise `work` runs inline and the result comes back in `Completed`.
///
/// Takes `table` as an owned `Arc` rather than a borrow: the async-callback
/// path moves the guard into a `tokio::spawn`'d task, which requires it (and
/// everything it's derived from) to be `'static` -- a guard borrowed from a
/// `&LockTable` reference can't cross that boundary, only one owning its own
/// `Arc` clone can.
pub async fn run_locked<T, F, Fut>(
    table: Arc<LockTable>,
    fingerprint: Fingerprint,
    op_name: &'static str,
    http_client: reqwest::Client,
    callback_timeout: Duration,
    callback_url: Option<String>,
    success_fields: fn(&T) -> Vec<(String, String)>,
    work: F,
) -> TransferOutcome<T>
where
    T: Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = anyhow::Result<T>> + Send + 'static,
{
    let Some(guard) = LockTable::try_acquire_owned(&table, fingerprint) else {
        metrics::log_contention(op_name);
        return TransferOutcome::Contention;
    };

    if let Some(url) = callback_url {
        tokio::spawn(async move {
            let _guard = guard;
            let result = work().await;
            if let Err(e) = &result {
                errors::report_error(e);
            }
            deliver_callback(&http_client, &url, callback_timeout, &result, success_fields).await;
        });
        TransferOutcome::Accepted
    } else {
        let result = work().await;
        drop(guard);
        TransferOutcome::Completed(result)
    }
}

async fn deliver_callback<T>(
    http_client: &reqwest::Client,
    callback_url: &str,
    timeout: Duration,
    result: &anyhow::Result<T>,
    success_fields: fn(&T) -> Vec<(String, String)>,
) {
    let pairs = encode_callback_payload(result, success_fields);
    let body = match serde_urlencoded::to_string(&pairs) {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!("failed to encode callback payload for {callback_url}: {e}");
            return;
        },
    };
    let post = http_client
        .post(callback_url)
        .header(reqwest::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(body)
        .send();
    match tokio::time::timeout(timeout, post).await {
        Ok(Ok(response)) if response.status().is_success() => {},
        Ok(Ok(response)) => {
            tracing::warn!("callback POST to {callback_url} returned status {}", response.status());
        },
        Ok(Err(e)) => {
            tracing::warn!("callback POST to {callback_url} failed: {e}");
        },
        Err(_) => {
            tracing::warn!("callback POST to {callback_url} timed out after {timeout:?}");
        },
    }
}

/// One [`LockTable`] per operation family, so e.g. a `copy` of a key never
/// contends with a `delete` of the same key.
pub struct TransferLockTables {
    pub copy: Arc<LockTable>,
    pub delete: Arc<LockTable>,
    pub list: Arc<LockTable>,
    pub slurp: Arc<LockTable>,
}

impl Default for TransferLockTables {
    fn default() -> Self {
        Self {
            copy: Arc::new(LockTable::new("copy")),
            delete: Arc::new(LockTable::new("delete")),
            list: Arc::new(LockTable::new("list")),
            slurp: Arc::new(LockTable::new("slurp")),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use storage::InMemoryStorage;

    use super::*;

    #[tokio::test]
    async fn second_call_with_same_fingerprint_reports_contention() {
        let tables = TransferLockTables::default();
        let fp = Fingerprint::new("bucket", "key");
        let guard = tables.delete.try_acquire(fp.clone()).expect("first acquires");

        let outcome: TransferOutcome<()> = run_locked(
            tables.delete.clone(),
            fp,
            "delete",
            reqwest::Client::new(),
            Duration::from_secs(1),
            None,
            |_: &()| vec![],
            || async { Ok(()) },
        )
        .await;
        assert!(matches!(outcome, TransferOutcome::Contention));
        drop(guard);
    }

    #[tokio::test]
    async fn sync_mode_returns_completed_with_inline_result() {
        let tables = TransferLockTables::default();
        let storage = InMemoryStorage::new();
        storage.seed("bucket", "a.txt", "hi", "text/plain");
        let fp = Fingerprint::new("dest-bucket", "a.txt");

        let outcome = run_locked(
            tables.copy.clone(),
            fp,
            "copy",
            reqwest::Client::new(),
            Duration::from_secs(1),
            None,
            |r: &storage::PutObjectResult| vec![("Size".to_string(), r.bytes_written.to_string())],
            move || {
                let storage = storage.clone();
                async move {
                    copy(CopyRequest {
                        source: &storage,
                        source_bucket: "bucket",
                        source_key: "a.txt",
                        dest: &storage,
                        dest_bucket: "dest-bucket",
                        dest_key: "b.txt",
                    })
                    .await
                }
            },
        )
        .await;
        match outcome {
            TransferOutcome::Completed(Ok(result)) => assert_eq!(result.bytes_written, 2),
            _ => panic!("expected a completed, successful copy"),
        }
    }
}
