//! Step D: best-effort opportunistic gzip of eligible entries, kept only if
//! it actually shrinks the payload. Runs the synchronous `flate2` encoder on
//! a blocking thread, the same way `async_zip_reader` bridges the
//! synchronous `zip` crate into async code.

use std::sync::Arc;

use errors::ErrorMetadata;
use flate2::{
    write::GzEncoder,
    Compression,
};
use storage::BoxAsyncRead;
use tokio::{
    io::AsyncRead,
    sync::Semaphore,
};
use tokio_util::io::SyncIoBridge;

/// Extensions never attempted, regardless of the configured allow-list:
/// already-compressed formats and common already-compressed media.
const BUILTIN_DENY_EXTENSIONS: &[&str] = &[
    "gz", "br", "zip", "png", "jpg", "jpeg", "gif", "webp", "ico", "mp3", "mp4", "ogg", "wav", "avi", "mov", "webm",
    "rar", "7z", "bz2", "xz", "tar", "woff", "woff2",
];

#[derive(Clone)]
pub struct PreCompressConfig {
    allow_extensions: Vec<String>,
    min_size: u64,
    semaphore: Arc<Semaphore>,
}

impl PreCompressConfig {
    /// Extensions may be given with or without a leading dot (the configured
    /// `PRE_COMPRESS_EXTENSIONS` format is `.js,.css,.html`); both are
    /// normalized to the bare, lowercase form `extension_of` returns.
    pub fn new(allow_extensions: Vec<String>, min_size: u64, concurrency: usize) -> Self {
        Self {
            allow_extensions: allow_extensions
                .into_iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            min_size,
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    pub fn eligible(&self, path: &str, expected_size: u64) -> bool {
        if expected_size < self.min_size {
            return false;
        }
        let Some(ext) = content_types::extension_of(path) else {
            return false;
        };
        let ext = ext.to_ascii_lowercase();
        if BUILTIN_DENY_EXTENSIONS.contains(&ext.as_str()) {
            return false;
        }
        self.allow_extensions.iter().any(|e| *e == ext)
    }
}

pub enum Attempt {
    /// The gzip output was smaller; `reader` streams it, `size` is its byte
    /// length.
    Compressed { reader: BoxAsyncRead, size: u64 },
    /// Compression didn't help; the caller must reopen the source entry.
    NotSmaller,
}

/// Streams `reader` into a temporary gzip file. Fails with a limit-exceeded
/// error if the source turns out to contain more than `expected_size` bytes.
pub async fn attempt(reader: BoxAsyncRead, expected_size: u64, cfg: &PreCompressConfig) -> anyhow::Result<Attempt> {
    let _permit = cfg
        .semaphore
        .clone()
        .acquire_owned()
        .await
        .expect("pre-compression semaphore is never closed");

    let tmp = tempfile::NamedTempFile::new()
        .map_err(|e| anyhow::Error::new(e).context(ErrorMetadata::extract_error("failed to create pre-compression temp file")))?;
    let sync_reader = SyncIoBridge::new(reader);

    let (file, temp_path) = tmp.into_parts();
    let (compressed_len, original_len, file, temp_path) = tokio::task::spawn_blocking(move || {
        run_gzip(sync_reader, file, expected_size).map(|(compressed_len, original_len, file)| {
            (compressed_len, original_len, file, temp_path)
        })
    })
    .await
    .map_err(|e| anyhow::Error::new(e).context(ErrorMetadata::extract_error("pre-compression worker thread panicked")))??;

    if compressed_len >= original_len {
        // `temp_path` drops here, deleting the file; the caller reopens the
        // source entry from scratch.
        return Ok(Attempt::NotSmaller);
    }

    let async_file = tokio::fs::File::from_std(file);
    Ok(Attempt::Compressed {
        reader: Box::pin(PrecompressedReader {
            file: async_file,
            _temp_path: temp_path,
        }),
        size: compressed_len,
    })
}

/// Runs entirely on a blocking thread: copies `sync_reader` into a gzip
/// encoder writing to `file`, refusing to copy more than `expected_size`
/// source bytes.
fn run_gzip(
    mut sync_reader: SyncIoBridge<BoxAsyncRead>,
    file: std::fs::File,
    expected_size: u64,
) -> anyhow::Result<(u64, u64, std::fs::File)> {
    let mut encoder = GzEncoder::new(file, Compression::best());
    let original_len = {
        let mut limited = std::io::Read::take(&mut sync_reader, expected_size);
        std::io::copy(&mut limited, &mut encoder)?
    };
    let mut probe = [0u8; 1];
    if std::io::Read::read(&mut sync_reader, &mut probe)? > 0 {
        anyhow::bail!(ErrorMetadata::limit_exceeded(
            "ByteCountExceeded",
            format!("entry exceeded its declared size of {expected_size} bytes"),
        ));
    }
    let file = encoder.finish()?;
    let compressed_len = file.metadata()?.len();
    Ok((compressed_len, original_len, file))
}

struct PrecompressedReader {
    file: tokio::fs::File,
    _temp_path: tempfile::TempPath,
}

impl AsyncRead for PrecompressedReader {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let this = self.get_mut();
        std::pin::Pin::new(&mut this.file).poll_read(cx, buf)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    fn cfg() -> PreCompressConfig {
        PreCompressConfig::new(vec!["txt".to_string()], 0, 1)
    }

    #[tokio::test]
    async fn eligibility_respects_allow_deny_and_min_size() {
        let cfg = PreCompressConfig::new(vec!["txt".to_string()], 10, 1);
        assert!(!cfg.eligible("a.png", 100));
        assert!(!cfg.eligible("a.txt", 5));
        assert!(cfg.eligible("a.txt", 10));
    }

    #[tokio::test]
    async fn allow_list_with_leading_dots_still_matches() {
        // PRE_COMPRESS_EXTENSIONS is documented as ".js,.css,.html"; the
        // leading dot must not prevent a match against the bare extension
        // `extension_of` returns.
        let cfg = PreCompressConfig::new(vec![".js".to_string(), ".HTML".to_string()], 0, 1);
        assert!(cfg.eligible("bundle.js", 100));
        assert!(cfg.eligible("index.html", 100));
    }

    #[tokio::test]
    async fn compressible_text_shrinks() {
        let payload = "a".repeat(10_000);
        let reader: BoxAsyncRead = Box::pin(std::io::Cursor::new(payload.clone().into_bytes()));
        let outcome = attempt(reader, payload.len() as u64, &cfg()).await.unwrap();
        match outcome {
            Attempt::Compressed { mut reader, size } => {
                assert!(size < payload.len() as u64);
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf).await.unwrap();
                assert_eq!(buf.len() as u64, size);
            },
            Attempt::NotSmaller => panic!("expected compression to shrink repetitive text"),
        }
    }

    #[tokio::test]
    async fn oversized_source_is_rejected() {
        let reader: BoxAsyncRead = Box::pin(std::io::Cursor::new(vec![b'a'; 100]));
        let err = attempt(reader, 10, &cfg()).await.unwrap_err();
        assert!(errors::ErrorMetadataAnyhowExt::is_limit_exceeded(&err));
    }
}
