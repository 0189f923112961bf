//! Runs inside a worker for one upload task (C5): content identification,
//! rewrite rules, HTML tail injection, optional pre-compression, and upload.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use content_types::{
    content_type_for_known_extension,
    is_gzip_mime,
    sniff,
    strip_extension,
    APPLICATION_OCTET_STREAM,
};
use errors::ErrorMetadata;
use scanner::UploadTask;
use storage::{
    BoxAsyncRead,
    LimitedReader,
    Md5Reader,
    PutObjectOptions,
    Storage,
};
use tokio::io::{
    AsyncRead,
    AsyncReadExt,
};
use worker_pool::{
    PoolTask,
    TaskOutcome,
};

mod metrics;
mod precompress;

pub use precompress::PreCompressConfig;

const SNIFF_BUFFER_LEN: usize = 512;

/// Destination-key suffixes rewritten when the effective content-encoding is
/// `gzip` (Step B): a handful of game-engine archive builders name their
/// already-gzipped assets this way instead of with a plain `.gz`.
const GZIP_REWRITE_SUFFIXES: &[(&str, &str)] = &[
    (".jsgz", ".js"),
    (".datagz", ".data"),
    (".memgz", ".mem"),
    (".unity3dgz", ".unity3d"),
];

#[derive(Clone, Debug)]
pub struct UploadResult {
    pub destination_key: String,
    pub bytes_written: u64,
    pub md5_hex: String,
    pub injected: bool,
}

pub struct EntryProcessor<S: Storage> {
    storage: Arc<S>,
    dest_bucket: String,
    pre_compress: Option<PreCompressConfig>,
}

impl<S: Storage> EntryProcessor<S> {
    pub fn new(storage: Arc<S>, dest_bucket: impl Into<String>, pre_compress: Option<PreCompressConfig>) -> Self {
        Self {
            storage,
            dest_bucket: dest_bucket.into(),
            pre_compress,
        }
    }

    /// `Ok(None)` is the benign skip sentinel: a directory entry that slipped
    /// past the scanner's trailing-slash rule (e.g. a zero-byte entry with no
    /// trailing `/` but a directory external attribute).
    async fn process_entry(&self, task: &UploadTask) -> anyhow::Result<Option<UploadResult>> {
        if task.is_directory {
            return Ok(None);
        }

        let source = task.entry.open().await.map_err(|e| {
            e.context(ErrorMetadata::extract_error(format!(
                "failed to open entry {:?}",
                task.entry.path
            )))
        })?;
        let mut source: BoxAsyncRead = Box::pin(source);

        let mut sniff_buf = vec![0u8; SNIFF_BUFFER_LEN];
        let sniffed_len = fill_buffer(&mut source, &mut sniff_buf).await?;
        sniff_buf.truncate(sniffed_len);
        let sniffed = sniff(&sniff_buf);

        let (content_type, content_encoding) = identify(&task.entry.path, sniffed);
        let mut reader: BoxAsyncRead = Box::pin(std::io::Cursor::new(sniff_buf).chain(source));

        let mut destination_key = task.destination_key.clone();
        if content_encoding.as_deref() == Some("gzip") {
            if let Some((suffix, replacement)) = GZIP_REWRITE_SUFFIXES
                .iter()
                .find(|(suffix, _)| destination_key.ends_with(suffix))
            {
                destination_key.truncate(destination_key.len() - suffix.len());
                destination_key.push_str(replacement);
            }
        }

        let mut expected_size = task.entry.declared_size;
        let mut injected = false;
        if content_encoding.is_none() {
            if let Some(tail) = &task.html_tail {
                reader = wrap_with_tail(reader, tail);
                expected_size = expected_size.saturating_add(tail.len() as u64);
                injected = true;
            }
        }

        let mut content_encoding = content_encoding;
        if let Some(cfg) = &self.pre_compress {
            if content_encoding.is_none() && cfg.eligible(&destination_key, expected_size) {
                match precompress::attempt(reader, expected_size, cfg).await? {
                    precompress::Attempt::Compressed { reader: compressed, size } => {
                        reader = compressed;
                        expected_size = size;
                        content_encoding = Some("gzip".to_string());
                        metrics::log_precompressed();
                    },
                    precompress::Attempt::NotSmaller => {
                        let reopened = task.entry.open().await.map_err(|e| {
                            e.context(ErrorMetadata::extract_error(format!(
                                "failed to reopen entry {:?} after pre-compression backed out",
                                task.entry.path
                            )))
                        })?;
                        let mut reopened: BoxAsyncRead = Box::pin(reopened);
                        if injected {
                            if let Some(tail) = &task.html_tail {
                                reopened = wrap_with_tail(reopened, tail);
                            }
                        }
                        reader = reopened;
                        expected_size = task.entry.declared_size
                            + if injected {
                                task.html_tail.as_ref().map_or(0, |t| t.len() as u64)
                            } else {
                                0
                            };
                    },
                }
            }
        }

        if injected {
            metrics::log_injected();
        }

        let limited = LimitedReader::new(reader, expected_size);
        let md5_reader = Md5Reader::new(limited);
        let digest_handle = md5_reader.digest_handle();
        let body: BoxAsyncRead = Box::pin(md5_reader);

        let mut options = PutObjectOptions::new(content_type);
        if let Some(encoding) = content_encoding {
            options = options.with_content_encoding(encoding);
        }

        let start = std::time::Instant::now();
        let result = self
            .storage
            .put(&self.dest_bucket, &destination_key, body, options)
            .await
            .map_err(|e| {
                let exceeded_limit = e
                    .chain()
                    .any(|cause| cause.downcast_ref::<storage::LimitExceededError>().is_some());
                if exceeded_limit {
                    e.context(ErrorMetadata::limit_exceeded(
                        "ByteCountExceeded",
                        format!("{destination_key} exceeded its declared size while uploading"),
                    ))
                } else {
                    e.context(ErrorMetadata::extract_error(format!("failed to upload {destination_key}")))
                }
            })?;
        metrics::log_upload_seconds(start.elapsed().as_secs_f64());

        let md5_hex = digest_handle.lock().expect("poisoned").clone().unwrap_or(result.md5_hex);
        Ok(Some(UploadResult {
            destination_key,
            bytes_written: result.bytes_written,
            md5_hex,
            injected,
        }))
    }
}

#[async_trait]
impl<S: Storage + 'static> PoolTask for EntryProcessor<S> {
    type Item = UploadTask;
    type Success = UploadResult;

    async fn process(&self, item: UploadTask) -> TaskOutcome<UploadResult> {
        match self.process_entry(&item).await {
            Ok(Some(result)) => TaskOutcome::Success(result),
            Ok(None) => {
                metrics::log_skipped();
                TaskOutcome::Skipped
            },
            Err(e) => TaskOutcome::Failed(e),
        }
    }
}

/// For a gzip-sniffed entry, derives the path to re-derive its content type
/// from: plain `.gz` is stripped outright, while the `.jsgz`/`.datagz`/
/// `.memgz`/`.unity3dgz` family (gzip payloads wearing a game-engine-specific
/// suffix instead of a plain `.gz`) is rewritten to its base extension first,
/// exactly like the destination-key rewrite in Step B -- so `gamedata.memgz`
/// re-derives from `.mem`, not from the literal (unknown) `memgz` extension.
/// `None` means the path matched neither case and the raw sniffed mime
/// should be used as-is.
fn gzip_content_type_path(entry_path: &str) -> Option<String> {
    if let Some((suffix, replacement)) = GZIP_REWRITE_SUFFIXES
        .iter()
        .find(|(suffix, _)| entry_path.ends_with(suffix))
    {
        let mut rewritten = entry_path.to_string();
        rewritten.truncate(rewritten.len() - suffix.len());
        rewritten.push_str(replacement);
        return Some(rewritten);
    }
    entry_path.ends_with(".gz").then(|| strip_extension(entry_path, "gz").to_string())
}

/// Derives the effective content type and content-encoding for an entry, per
/// §4.5 step A: gzip/brotli magic/extension first, then a known extension,
/// then the raw sniffed type, then `application/octet-stream`.
fn identify(entry_path: &str, sniffed: Option<&str>) -> (String, Option<String>) {
    if let Some(mime) = sniffed {
        if is_gzip_mime(mime) {
            let content_type = match gzip_content_type_path(entry_path) {
                Some(derived_path) => content_type_for_known_extension(&derived_path)
                    .unwrap_or_else(|| APPLICATION_OCTET_STREAM.to_string()),
                None => mime.to_string(),
            };
            return (content_type, Some("gzip".to_string()));
        }
    }
    if entry_path.ends_with(".br") {
        let content_type = content_type_for_known_extension(strip_extension(entry_path, "br"))
            .unwrap_or_else(|| APPLICATION_OCTET_STREAM.to_string());
        return (content_type, Some("br".to_string()));
    }
    if let Some(content_type) = content_type_for_known_extension(entry_path) {
        return (content_type, None);
    }
    if let Some(mime) = sniffed {
        return (mime.to_string(), None);
    }
    (APPLICATION_OCTET_STREAM.to_string(), None)
}

/// Fills `buf` from `reader`, stopping early at EOF (entries smaller than the
/// sniff window are common and not an error).
async fn fill_buffer(reader: &mut BoxAsyncRead, buf: &mut [u8]) -> anyhow::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = reader.read(&mut buf[total..]).await?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

fn wrap_with_tail(reader: BoxAsyncRead, tail: &Arc<str>) -> BoxAsyncRead {
    let tail_bytes = Bytes::copy_from_slice(tail.as_bytes());
    Box::pin(reader.chain(std::io::Cursor::new(tail_bytes)))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use async_zip::{
        tokio::write::ZipFileWriter,
        Compression,
        ZipEntryBuilder,
    };
    use scanner::{
        ExtractionLimits,
        Scanner,
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

    #[tokio::test]
    async fn happy_path_text_and_binary() {
        let path = build_archive(&[("file.txt", b"Hello there"), ("garbage.bin", &[1u8, 2, 3, 4])]).await;
        let tasks = Scanner::scan(&path, &ExtractionLimits::default(), "p").await.unwrap();
        let storage = Arc::new(InMemoryStorage::new());
        let processor = EntryProcessor::new(storage.clone(), "dest", None);

        for task in &tasks {
            let outcome = processor.process_entry(task).await.unwrap().unwrap();
            assert_eq!(outcome.destination_key, task.destination_key);
        }
        assert!(storage.contains("dest", "p/file.txt"));
        assert!(storage.contains("dest", "p/garbage.bin"));

        let got = storage.get("dest", "p/file.txt").await.unwrap().unwrap();
        assert_eq!(got.headers.content_type.as_deref(), Some("text/plain; charset=utf-8"));
        let got = storage.get("dest", "p/garbage.bin").await.unwrap().unwrap();
        assert_eq!(got.headers.content_type.as_deref(), Some(APPLICATION_OCTET_STREAM));
    }

    #[tokio::test]
    async fn gzip_rewrite_strips_suffix_and_sets_encoding() {
        let mut gzip_payload = vec![0x1Fu8, 0x8B, 0x08, 0, 0, 0, 0, 0, 0, 0];
        gzip_payload.extend_from_slice(&[0u8; 16]);
        let path = build_archive(&[("gamedata.memgz", &gzip_payload)]).await;
        let tasks = Scanner::scan(&path, &ExtractionLimits::default(), "p").await.unwrap();
        let storage = Arc::new(InMemoryStorage::new());
        let processor = EntryProcessor::new(storage.clone(), "dest", None);

        let outcome = processor.process_entry(&tasks[0]).await.unwrap().unwrap();
        assert_eq!(outcome.destination_key, "p/gamedata.mem");
        let got = storage.get("dest", "p/gamedata.mem").await.unwrap().unwrap();
        assert_eq!(got.headers.content_encoding.as_deref(), Some("gzip"));
        assert_eq!(got.headers.content_type.as_deref(), Some(APPLICATION_OCTET_STREAM));
    }

    #[tokio::test]
    async fn brotli_by_extension_is_not_sniffable() {
        let path = build_archive(&[("bundle.wasm.br", b"arbitrary")]).await;
        let tasks = Scanner::scan(&path, &ExtractionLimits::default(), "p").await.unwrap();
        let storage = Arc::new(InMemoryStorage::new());
        let processor = EntryProcessor::new(storage.clone(), "dest", None);

        let outcome = processor.process_entry(&tasks[0]).await.unwrap().unwrap();
        assert_eq!(outcome.destination_key, "p/bundle.wasm.br");
        let got = storage.get("dest", "p/bundle.wasm.br").await.unwrap().unwrap();
        assert_eq!(got.headers.content_type.as_deref(), Some("application/wasm"));
        assert_eq!(got.headers.content_encoding.as_deref(), Some("br"));
    }

    #[tokio::test]
    async fn html_tail_injection_appends_bytes() {
        let path = build_archive(&[("index.html", b"<html></html>")]).await;
        let limits = ExtractionLimits {
            html_tail: Some("<!--tail-->".to_string()),
            ..Default::default()
        };
        let tasks = Scanner::scan(&path, &limits, "").await.unwrap();
        let storage = Arc::new(InMemoryStorage::new());
        let processor = EntryProcessor::new(storage.clone(), "dest", None);

        let outcome = processor.process_entry(&tasks[0]).await.unwrap().unwrap();
        assert!(outcome.injected);
        let got = storage.get("dest", "index.html").await.unwrap().unwrap();
        let bytes = got.collect_bytes().await.unwrap();
        assert_eq!(bytes.as_ref(), b"<html></html><!--tail-->".as_slice());
    }

    #[tokio::test]
    async fn directory_entry_without_trailing_slash_is_skipped() {
        let path = build_archive(&[("ordinary.txt", b"x")]).await;
        let tasks = Scanner::scan(&path, &ExtractionLimits::default(), "").await.unwrap();
        let mut forced_dir_task = tasks[0].clone();
        forced_dir_task.is_directory = true;
        let storage = Arc::new(InMemoryStorage::new());
        let processor = EntryProcessor::new(storage.clone(), "dest", None);

        let outcome = processor.process_entry(&forced_dir_task).await.unwrap();
        assert!(outcome.is_none());
        assert!(!storage.contains("dest", "ordinary.txt"));
    }

    #[tokio::test]
    async fn oversized_transfer_is_rejected() {
        let path = build_archive(&[("file.txt", b"0123456789")]).await;
        let tasks = Scanner::scan(&path, &ExtractionLimits::default(), "").await.unwrap();
        let mut task = tasks[0].clone();
        // Lie about the declared size so the limited reader trips mid-upload.
        task.entry.declared_size = 4;
        let storage = Arc::new(InMemoryStorage::new());
        let processor = EntryProcessor::new(storage, "dest", None);

        let err = processor.process_entry(&task).await.unwrap_err();
        assert!(errors::ErrorMetadataAnyhowExt::is_limit_exceeded(&err));
    }
}
