//! Orchestrates the lifecycle of one extraction job (C6):
//! `Acquired -> Fetched -> Scanned -> Pumping -> (Succeeded | Failing) ->
//! Finalized`. Owns the scratch file, the worker pool lifetime, and the
//! accumulated list of successfully-uploaded destination keys used for
//! compensating rollback. Delivers its result either inline (sync mode) or
//! via a callback POST (async mode), releasing the fingerprint lock on every
//! exit path.

use std::{
    sync::Arc,
    time::Duration,
};

use errors::{
    ErrorMetadata,
    ErrorMetadataAnyhowExt,
};
use fetcher::Fetcher;
use lock_table::{
    Fingerprint,
    LockTable,
};
use scanner::{
    ExtractionLimits,
    Scanner,
};
use storage::Storage;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

mod metrics;

pub use entry_processor::{
    PreCompressConfig,
    UploadResult,
};

/// The three nested timeout budgets from §4.6, plus the async callback's own
/// budget. All have sensible production defaults but are fully overridable
/// by the HTTP layer's configuration.
#[derive(Clone, Copy, Debug)]
pub struct JobTimeouts {
    pub job: Duration,
    pub fetch: Duration,
    pub upload: Duration,
    pub callback: Duration,
}

impl Default for JobTimeouts {
    fn default() -> Self {
        Self {
            job: Duration::from_secs(5 * 60),
            fetch: Duration::from_secs(60),
            upload: Duration::from_secs(60),
            callback: Duration::from_secs(5),
        }
    }
}

/// Everything needed to run one extraction, gathered by the HTTP layer from
/// query parameters.
#[derive(Clone)]
pub struct ExtractRequest {
    pub source_bucket: String,
    pub source_key: String,
    /// Identifies the destination storage backend for fingerprinting (§3);
    /// distinct from `dest_bucket`, which is the bucket within it.
    pub target_name: String,
    pub dest_bucket: String,
    pub dest_prefix: String,
    pub limits: ExtractionLimits,
    pub callback_url: Option<String>,
    /// Fires on caller-side abort (e.g. the HTTP connection dropped); when
    /// set, drives the same drain+rollback path as a job timeout but reports
    /// a distinguishable message (§4.6's "job timeout" vs "caller
    /// cancellation").
    pub cancel: Option<CancellationToken>,
}

impl Default for ExtractRequest {
    fn default() -> Self {
        Self {
            source_bucket: String::new(),
            source_key: String::new(),
            target_name: String::new(),
            dest_bucket: String::new(),
            dest_prefix: String::new(),
            limits: ExtractionLimits::default(),
            callback_url: None,
            cancel: None,
        }
    }
}

impl ExtractRequest {
    fn fingerprint(&self) -> Fingerprint {
        Fingerprint::new(&self.target_name, &self.source_key)
    }
}

#[derive(Debug)]
pub struct ExtractSuccess {
    pub uploaded: Vec<UploadResult>,
    pub duration: Duration,
}

/// What `JobCoordinator::handle_extract` hands back to its caller (the HTTP
/// handler). `Completed` carries the eventual result for sync mode;
/// `Accepted` means a detached task was spawned and the caller should return
/// the `{Processing:true, Async:true}` acknowledgment immediately.
pub enum JobOutcome {
    Contention,
    Accepted,
    Completed(anyhow::Result<ExtractSuccess>),
}

enum Cause {
    Worker(anyhow::Error),
    JobTimeout,
    Canceled,
}

pub struct JobCoordinator<S> {
    lock_table: Arc<LockTable>,
    storage: Arc<S>,
    fetcher: Fetcher,
    pre_compress: Option<PreCompressConfig>,
    timeouts: JobTimeouts,
    http_client: reqwest::Client,
}

impl<S: Storage + 'static> JobCoordinator<S> {
    pub fn new(
        lock_table: Arc<LockTable>,
        storage: Arc<S>,
        scratch_dir: impl Into<std::path::PathBuf>,
        pre_compress: Option<PreCompressConfig>,
        timeouts: JobTimeouts,
    ) -> Self {
        Self {
            lock_table,
            storage,
            fetcher: Fetcher::new(scratch_dir),
            pre_compress,
            timeouts,
            http_client: reqwest::Client::new(),
        }
    }

    /// Entry point from the HTTP layer (§6's `GET /extract`). Acquires the
    /// fingerprint lock, then either runs the job to completion inline or
    /// spawns it detached and acknowledges immediately, per whether
    /// `req.callback_url` is set.
    pub async fn handle_extract(self: &Arc<Self>, req: ExtractRequest) -> JobOutcome {
        let Some(guard) = LockTable::try_acquire_owned(&self.lock_table, req.fingerprint()) else {
            metrics::log_contention();
            return JobOutcome::Contention;
        };

        if let Some(callback_url) = req.callback_url.clone() {
            let this = self.clone();
            tokio::spawn(async move {
                let _guard = guard;
                let start = Instant::now();
                let result = this.run_job(&req).await;
                this.deliver_callback(&callback_url, &result, start.elapsed()).await;
            });
            return JobOutcome::Accepted;
        }

        let start = Instant::now();
        let result = self.run_job(&req).await;
        drop(guard);
        JobOutcome::Completed(result.map(|uploaded| ExtractSuccess {
            uploaded,
            duration: start.elapsed(),
        }))
    }

    /// Runs `Fetched -> Scanned -> Pumping -> (Succeeded | Failing)`. The
    /// scratch file (owned by `fetcher::ScratchFile`) is removed on every
    /// exit path via its `Drop` impl; the caller (`handle_extract`) owns
    /// lock release and result delivery (`Finalized`).
    async fn run_job(&self, req: &ExtractRequest) -> anyhow::Result<Vec<UploadResult>> {
        let timer = metrics::extract_timer();
        let job_deadline = Instant::now() + self.timeouts.job;

        let fetch_budget = self.timeouts.fetch.min(job_deadline.saturating_duration_since(Instant::now()));
        let scratch = match tokio::time::timeout(
            fetch_budget,
            self.fetcher
                .fetch(self.storage.as_ref(), &req.source_bucket, &req.source_key, req.limits.max_input_size),
        )
        .await
        {
            Ok(Ok(scratch)) => scratch,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(anyhow::Error::new(ErrorMetadata::fetch_error(
                    "fetch exceeded the per-fetch deadline",
                )))
            },
        };

        let scan_budget = job_deadline.saturating_duration_since(Instant::now());
        let tasks = match tokio::time::timeout(
            scan_budget,
            Scanner::scan(scratch.path(), &req.limits, &req.dest_prefix),
        )
        .await
        {
            Ok(Ok(tasks)) => tasks,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(anyhow::Error::new(ErrorMetadata::timeout(
                    "job timed out while scanning the archive",
                )))
            },
        };

        let processor = Arc::new(entry_processor::EntryProcessor::new(
            self.storage.clone(),
            req.dest_bucket.clone(),
            self.pre_compress.clone(),
        ));
        let worker_count = req.limits.effective_worker_pool_size();
        let cancel = CancellationToken::new();
        let mut rx = worker_pool::spawn(processor, tasks, worker_count, Some(self.timeouts.upload), cancel.clone());

        let deadline_sleep = tokio::time::sleep_until(job_deadline);
        tokio::pin!(deadline_sleep);
        let external_cancel = req.cancel.clone().unwrap_or_default();

        let mut uploaded = Vec::new();
        let mut cause: Option<Cause> = None;
        loop {
            tokio::select! {
                biased;
                () = &mut deadline_sleep, if cause.is_none() => {
                    cause = Some(Cause::JobTimeout);
                    cancel.cancel();
                },
                () = external_cancel.cancelled(), if cause.is_none() => {
                    cause = Some(Cause::Canceled);
                    cancel.cancel();
                },
                outcome = rx.recv() => {
                    match outcome {
                        None => break,
                        Some(worker_pool::TaskOutcome::Success(result)) => uploaded.push(result),
                        Some(worker_pool::TaskOutcome::Skipped) => {},
                        Some(worker_pool::TaskOutcome::Failed(e)) => {
                            if cause.is_none() {
                                cause = Some(Cause::Worker(e));
                            }
                            cancel.cancel();
                        },
                    }
                },
            }
        }

        match cause {
            None => {
                timer.finish();
                Ok(uploaded)
            },
            Some(cause) => {
                self.rollback(&req.dest_bucket, &uploaded).await;
                drop(timer);
                Err(match cause {
                    Cause::Worker(e) => e,
                    Cause::JobTimeout => anyhow::Error::new(ErrorMetadata::timeout("job timed out during extraction")),
                    Cause::Canceled => {
                        anyhow::Error::new(ErrorMetadata::timeout("job was canceled by the caller"))
                    },
                })
            },
        }
    }

    /// Best-effort compensating delete of every key uploaded before the
    /// job failed. Secondary failures are logged and ignored -- the
    /// primary error is what's reported to the caller.
    async fn rollback(&self, dest_bucket: &str, uploaded: &[UploadResult]) {
        for result in uploaded {
            if let Err(e) = self.storage.delete(dest_bucket, &result.destination_key).await {
                metrics::log_rollback_failure();
                tracing::warn!("rollback: failed to delete {}: {e:?}", result.destination_key);
            }
        }
    }

    /// POSTs the job's outcome to `callback_url` as
    /// `application/x-www-form-urlencoded`, within the callback budget.
    /// Never retried; failures are logged only (§4.6).
    async fn deliver_callback(&self, callback_url: &str, result: &anyhow::Result<ExtractSuccess>, duration: Duration) {
        let pairs = match result {
            Ok(success) => encode_success_payload(success, duration),
            Err(e) => encode_error_payload(e),
        };
        let body = serde_urlencoded::to_string(&pairs).expect("string pairs always encode");
        let post = self
            .http_client
            .post(callback_url)
            .header(reqwest::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body)
            .send();
        match tokio::time::timeout(self.timeouts.callback, post).await {
            Ok(Ok(response)) if response.status().is_success() => {},
            Ok(Ok(response)) => {
                metrics::log_callback_failure("non_2xx");
                tracing::warn!("callback to {callback_url} returned status {}", response.status());
            },
            Ok(Err(e)) => {
                metrics::log_callback_failure("request_error");
                tracing::warn!("callback to {callback_url} failed: {e:?}");
            },
            Err(_) => {
                metrics::log_callback_failure("timeout");
                tracing::warn!("callback to {callback_url} exceeded its delivery budget");
            },
        }
    }
}

/// Builds the success form body. Indices are 1-based and the bracket keys are
/// balanced (`ExtractedFiles[i][Key]`, not the upstream's mismatched
/// `ExtractedFiles[i][Key])` -- see §9's note on that irregularity).
fn encode_success_payload(success: &ExtractSuccess, duration: Duration) -> Vec<(String, String)> {
    let mut pairs = vec![
        ("Success".to_string(), "true".to_string()),
        ("Count".to_string(), success.uploaded.len().to_string()),
        ("Duration".to_string(), format!("{:.3}", duration.as_secs_f64())),
    ];
    for (i, result) in success.uploaded.iter().enumerate() {
        let index = i + 1;
        pairs.push((format!("ExtractedFiles[{index}][Key]"), result.destination_key.clone()));
        pairs.push((format!("ExtractedFiles[{index}][Size]"), result.bytes_written.to_string()));
    }
    pairs
}

fn encode_error_payload(err: &anyhow::Error) -> Vec<(String, String)> {
    vec![
        ("Type".to_string(), err.short_msg().to_string()),
        ("Error".to_string(), err.user_facing_message()),
    ]
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use async_zip::{
        tokio::write::ZipFileWriter,
        Compression,
        ZipEntryBuilder,
    };
    use storage::InMemoryStorage;

    use super::*;

    async fn build_archive(entries: &[(&str, &[u8])]) -> PathBuf {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.into_path().join("archive.zip");
        let mut buf = Vec::new();
        {
            let mut writer = ZipFileWriter::with_tokio(&mut buf);
            for (name, contents) in entries {
                let builder = ZipEntryBuilder::new((*name).to_string().into(), Compression::Deflate);
                writer.write_entry_whole(builder, contents).await.unwrap();
            }
            writer.close().await.unwrap();
        }
        tokio::fs::write(&path, buf).await.unwrap();
        path
    }

    fn coordinator(storage: Arc<InMemoryStorage>, scratch_dir: &std::path::Path) -> Arc<JobCoordinator<InMemoryStorage>> {
        Arc::new(JobCoordinator::new(
            Arc::new(LockTable::new("extract")),
            storage,
            scratch_dir,
            None,
            JobTimeouts::default(),
        ))
    }

    fn request(source_key: &str, dest_prefix: &str) -> ExtractRequest {
        ExtractRequest {
            source_bucket: "src".to_string(),
            source_key: source_key.to_string(),
            target_name: "dest".to_string(),
            dest_bucket: "dest".to_string(),
            dest_prefix: dest_prefix.to_string(),
            limits: ExtractionLimits::default(),
            callback_url: None,
            cancel: None,
        }
    }

    #[tokio::test]
    async fn happy_path_uploads_every_entry() {
        let path = build_archive(&[("file.txt", b"Hello there"), ("garbage.bin", &[1u8, 2, 3, 4])]).await;
        let storage = Arc::new(InMemoryStorage::new());
        storage.seed("src", "archive.zip", tokio::fs::read(&path).await.unwrap(), "application/zip");
        let scratch_dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(storage.clone(), scratch_dir.path());

        let outcome = coordinator.handle_extract(request("archive.zip", "p")).await;
        let JobOutcome::Completed(Ok(success)) = outcome else {
            panic!("expected a completed success");
        };
        assert_eq!(success.uploaded.len(), 2);
        assert!(storage.contains("dest", "p/file.txt"));
        assert!(storage.contains("dest", "p/garbage.bin"));
    }

    #[tokio::test]
    async fn too_many_files_reports_limit_exceeded_with_no_uploads() {
        let path = build_archive(&[("a", b"x"), ("b", b"x"), ("c", b"x"), ("d", b"x")]).await;
        let storage = Arc::new(InMemoryStorage::new());
        storage.seed("src", "archive.zip", tokio::fs::read(&path).await.unwrap(), "application/zip");
        let scratch_dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(storage.clone(), scratch_dir.path());

        let mut req = request("archive.zip", "p");
        req.limits.max_entries = 3;
        let outcome = coordinator.handle_extract(req).await;
        let JobOutcome::Completed(Err(e)) = outcome else {
            panic!("expected a completed failure");
        };
        assert!(e.is_limit_exceeded());
        assert!(e.to_string().contains("too many files"));
        assert_eq!(storage.len(), 1); // only the source archive
    }

    #[tokio::test]
    async fn mid_job_failure_rolls_back_successful_uploads() {
        struct FlakyStorage {
            inner: InMemoryStorage,
        }
        impl std::fmt::Debug for FlakyStorage {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct("FlakyStorage").finish()
            }
        }
        #[async_trait::async_trait]
        impl Storage for FlakyStorage {
            async fn get(&self, bucket: &str, key: &str) -> anyhow::Result<Option<storage::GetObjectResult>> {
                self.inner.get(bucket, key).await
            }

            async fn put(
                &self,
                bucket: &str,
                key: &str,
                body: storage::BoxAsyncRead,
                options: storage::PutObjectOptions,
            ) -> anyhow::Result<storage::PutObjectResult> {
                if key.ends_with("c.txt") {
                    anyhow::bail!(ErrorMetadata::extract_error("synthetic upload failure"));
                }
                self.inner.put(bucket, key, body, options).await
            }

            async fn delete(&self, bucket: &str, key: &str) -> anyhow::Result<()> {
                self.inner.delete(bucket, key).await
            }
        }

        let path = build_archive(&[("a.txt", b"a"), ("b.txt", b"b"), ("c.txt", b"c"), ("d.txt", b"d")]).await;
        let storage = Arc::new(FlakyStorage {
            inner: InMemoryStorage::new(),
        });
        storage
            .inner
            .seed("src", "archive.zip", tokio::fs::read(&path).await.unwrap(), "application/zip");
        let scratch_dir = tempfile::tempdir().unwrap();
        let coordinator = Arc::new(JobCoordinator::new(
            Arc::new(LockTable::new("extract")),
            storage.clone(),
            scratch_dir.path(),
            None,
            JobTimeouts::default(),
        ));

        let mut req = request("archive.zip", "");
        req.limits.worker_pool_size = 1;
        let outcome = coordinator.handle_extract(req).await;
        let JobOutcome::Completed(Err(e)) = outcome else {
            panic!("expected a completed failure");
        };
        assert_eq!(e.short_msg(), "ExtractError");
        assert!(!storage.inner.contains("dest", "a.txt"));
        assert!(!storage.inner.contains("dest", "b.txt"));
        assert!(!storage.inner.contains("dest", "d.txt"));
    }

    #[tokio::test]
    async fn scratch_file_is_removed_after_the_job_returns() {
        let path = build_archive(&[("file.txt", b"hi")]).await;
        let storage = Arc::new(InMemoryStorage::new());
        storage.seed("src", "archive.zip", tokio::fs::read(&path).await.unwrap(), "application/zip");
        let scratch_dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(storage, scratch_dir.path());

        coordinator.handle_extract(request("archive.zip", "")).await;
        let mut entries = tokio::fs::read_dir(scratch_dir.path()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn second_call_with_same_fingerprint_reports_contention() {
        let path = build_archive(&[("file.txt", b"hi")]).await;
        let storage = Arc::new(InMemoryStorage::new());
        storage.seed("src", "archive.zip", tokio::fs::read(&path).await.unwrap(), "application/zip");
        let scratch_dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(storage, scratch_dir.path());

        let lock_table = coordinator.lock_table.clone();
        let fp = Fingerprint::new("dest", "archive.zip");
        let _held = lock_table.try_acquire(fp).unwrap();

        let outcome = coordinator.handle_extract(request("archive.zip", "")).await;
        assert!(matches!(outcome, JobOutcome::Contention));
    }
}
