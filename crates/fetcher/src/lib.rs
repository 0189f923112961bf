//! Downloads an archive from a storage backend to a scratch file with a
//! deterministic name, enforcing the input-size cap before and during the
//! copy (C2).

use std::path::{
    Path,
    PathBuf,
};

use anyhow::Context;
use errors::ErrorMetadata;
use storage::{
    LimitedReader,
    Storage,
};
use tokio::io::AsyncWriteExt;

mod metrics;

/// `0` means "unbounded" everywhere in `ExtractionLimits`; translate that to
/// an effectively-infinite ceiling for `LimitedReader`.
pub fn effective_limit(configured: u64) -> u64 {
    if configured == 0 {
        u64::MAX
    } else {
        configured
    }
}

/// The on-disk copy of a downloaded archive. Deletes itself on drop so every
/// exit path out of the job coordinator cleans up, matching the invariant
/// that the scratch file never outlives the job.
pub struct ScratchFile {
    path: PathBuf,
}

impl ScratchFile {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("failed to remove scratch file {:?}: {e}", self.path);
            }
        }
    }
}

/// Deterministic scratch-file name for (bucket, key): `bucket_hash(key).zip`.
pub fn scratch_file_name(bucket: &str, key: &str) -> String {
    let hash = blake3::hash(format!("{bucket}\u{0}{key}").as_bytes());
    format!("{}.zip", hash.to_hex())
}

#[derive(Clone)]
pub struct Fetcher {
    scratch_dir: PathBuf,
}

impl Fetcher {
    pub fn new(scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
        }
    }

    /// Downloads `bucket`/`key` via `storage.get` to a scratch file in the
    /// configured scratch directory, capped at `max_input_size` bytes (`0` =
    /// unbounded). The scratch file is removed if this function returns an
    /// error.
    pub async fn fetch(
        &self,
        storage: &dyn Storage,
        bucket: &str,
        key: &str,
        max_input_size: u64,
    ) -> anyhow::Result<ScratchFile> {
        let timer = metrics::fetch_timer();
        let result = storage
            .get(bucket, key)
            .await
            .context("failed to read source archive")?
            .ok_or_else(|| storage::not_found(bucket, key))?;

        let limit = effective_limit(max_input_size);
        if max_input_size != 0 && result.headers.content_length > max_input_size {
            anyhow::bail!(ErrorMetadata::limit_exceeded(
                "ArchiveTooLarge",
                format!(
                    "source archive is {} bytes, exceeding the {max_input_size} byte limit",
                    result.headers.content_length
                ),
            ));
        }

        tokio::fs::create_dir_all(&self.scratch_dir)
            .await
            .context("failed to create scratch directory")?;
        let path = self.scratch_dir.join(scratch_file_name(bucket, key));
        let scratch = ScratchFile { path: path.clone() };

        let copy_result = self.copy_with_limit(result.reader, &path, limit).await;
        match copy_result {
            Ok(()) => {
                timer.finish();
                Ok(scratch)
            },
            Err(e) => {
                // `scratch`'s Drop impl removes the partial file.
                drop(scratch);
                Err(e)
            },
        }
    }

    async fn copy_with_limit(
        &self,
        reader: storage::BoxAsyncRead,
        dest: &Path,
        limit: u64,
    ) -> anyhow::Result<()> {
        let mut file = tokio::fs::File::create(dest)
            .await
            .context("failed to create scratch file")?;
        let mut limited = LimitedReader::new(reader, limit);
        let copy_result = tokio::io::copy(&mut limited, &mut file).await;
        match copy_result {
            Ok(_) => {
                file.flush().await.context("failed to flush scratch file")?;
                Ok(())
            },
            Err(e)
                if e.get_ref()
                    .is_some_and(|inner| inner.is::<storage::LimitExceededError>()) =>
            {
                Err(anyhow::Error::new(ErrorMetadata::limit_exceeded(
                    "ArchiveTooLarge",
                    format!("source archive exceeded the {limit} byte limit while downloading"),
                )))
            },
            Err(e) => Err(anyhow::Error::new(e)).context("failed to write scratch file"),
        }
    }
}

#[cfg(test)]
mod tests {
    use storage::InMemoryStorage;
    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn fetch_writes_full_archive_to_scratch_dir() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = InMemoryStorage::new();
        storage.seed("bucket", "archive.zip", "zip-bytes", "application/zip");

        let fetcher = Fetcher::new(dir.path());
        let scratch = fetcher.fetch(&storage, "bucket", "archive.zip", 0).await?;
        assert!(scratch.path().starts_with(dir.path()));

        let mut contents = Vec::new();
        tokio::fs::File::open(scratch.path())
            .await?
            .read_to_end(&mut contents)
            .await?;
        assert_eq!(contents, b"zip-bytes");
        Ok(())
    }

    #[tokio::test]
    async fn fetch_removes_scratch_file_on_drop() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = InMemoryStorage::new();
        storage.seed("bucket", "archive.zip", "zip-bytes", "application/zip");
        let fetcher = Fetcher::new(dir.path());
        let path = {
            let scratch = fetcher.fetch(&storage, "bucket", "archive.zip", 0).await?;
            scratch.path().to_path_buf()
        };
        assert!(!path.exists());
        Ok(())
    }

    #[tokio::test]
    async fn fetch_rejects_archive_exceeding_advertised_length_cap() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = InMemoryStorage::new();
        storage.seed("bucket", "archive.zip", "0123456789", "application/zip");
        let fetcher = Fetcher::new(dir.path());
        let err = fetcher
            .fetch(&storage, "bucket", "archive.zip", 5)
            .await
            .unwrap_err();
        assert!(errors::ErrorMetadataAnyhowExt::is_limit_exceeded(&err));
        Ok(())
    }

    #[tokio::test]
    async fn fetch_missing_object_reports_fetch_error() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = InMemoryStorage::new();
        let fetcher = Fetcher::new(dir.path());
        let err = fetcher
            .fetch(&storage, "bucket", "missing.zip", 0)
            .await
            .unwrap_err();
        assert_eq!(
            errors::ErrorMetadataAnyhowExt::error_metadata(&err)
                .map(|e| e.code)
                .unwrap(),
            errors::ErrorCode::FetchError
        );
        Ok(())
    }
}
