//! Best-effort multi-key delete (§4.7 Delete): every key is attempted even if
//! an earlier one fails, and the caller gets back which keys succeeded and
//! which didn't rather than a single hard error.

use errors::ErrorMetadata;
use storage::Storage;

use crate::metrics;

#[derive(Debug, Default)]
pub struct DeleteOutcome {
    pub deleted: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl DeleteOutcome {
    /// Collapses the outcome into a single `Result`, the shape the HTTP
    /// surface and the async callback envelope want: success only if every
    /// key deleted, otherwise a `DeleteError` naming the keys that didn't.
    pub fn into_result(self) -> anyhow::Result<Vec<String>> {
        if self.failed.is_empty() {
            Ok(self.deleted)
        } else {
            let detail = self
                .failed
                .iter()
                .map(|(key, err)| format!("{key}: {err}"))
                .collect::<Vec<_>>()
                .join("; ");
            anyhow::bail!(ErrorMetadata::delete_error(format!(
                "failed to delete {} of {} keys: {detail}",
                self.failed.len(),
                self.deleted.len() + self.failed.len(),
            )))
        }
    }
}

/// Deletes every key in `keys` from `bucket`, continuing past individual
/// failures rather than aborting on the first one.
pub async fn delete_many(storage: &dyn Storage, bucket: &str, keys: &[String]) -> DeleteOutcome {
    let mut outcome = DeleteOutcome::default();
    for key in keys {
        match storage.delete(bucket, key).await {
            Ok(()) => outcome.deleted.push(key.clone()),
            Err(e) => {
                metrics::log_delete_failure();
                tracing::warn!("failed to delete {bucket}/{key}: {e:#}");
                outcome.failed.push((key.clone(), e.to_string()));
            },
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use storage::InMemoryStorage;

    use super::*;

    #[tokio::test]
    async fn deletes_every_key_present() {
        let storage = InMemoryStorage::new();
        storage.seed("bucket", "a", "x", "text/plain");
        storage.seed("bucket", "b", "x", "text/plain");
        let outcome = delete_many(&storage, "bucket", &["a".to_string(), "b".to_string()]).await;
        assert!(outcome.failed.is_empty());
        assert_eq!(outcome.deleted.len(), 2);
        assert!(!storage.contains("bucket", "a"));
        assert!(!storage.contains("bucket", "b"));
    }

    #[tokio::test]
    async fn missing_keys_do_not_abort_remaining_deletes() {
        // `InMemoryStorage::delete` on a missing key is a no-op success, so
        // exercise `into_result`'s failure-collapsing path directly instead.
        let outcome = DeleteOutcome {
            deleted: vec!["a".to_string()],
            failed: vec![("b".to_string(), "boom".to_string())],
        };
        let err = outcome.into_result().unwrap_err();
        assert_eq!(
            errors::ErrorMetadataAnyhowExt::error_metadata(&err).map(|e| e.code),
            Some(errors::ErrorCode::DeleteError)
        );
        assert!(err.to_string().contains('b'));
    }

    #[tokio::test]
    async fn all_succeeding_collapses_to_ok() {
        let outcome = DeleteOutcome {
            deleted: vec!["a".to_string(), "b".to_string()],
            failed: vec![],
        };
        assert_eq!(outcome.into_result().unwrap(), vec!["a".to_string(), "b".to_string()]);
    }
}
