//! Walks an archive's central directory, applies the safety limits and
//! filters in `ExtractionLimits`, and produces the validated list of
//! `UploadTask`s a worker pool will drain (C3).

use std::{
    path::{
        Path,
        PathBuf,
    },
    sync::Arc,
};

use bytes::Bytes;
use errors::ErrorMetadata;
use globset::{
    GlobBuilder,
    GlobMatcher,
};
use tokio::{
    io::AsyncRead,
    sync::mpsc,
};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;

mod limits;

pub use limits::ExtractionLimits;

/// A single entry an archive offered up for extraction, immutable once
/// produced by [`Scanner::scan`]. The archive bytes themselves aren't held in
/// memory -- `open()` reopens the scratch file and streams the entry fresh
/// each time it's called, so the same descriptor can be reopened if a
/// worker needs to retry (e.g. pre-compression backing out).
#[derive(Clone, Debug)]
pub struct ArchiveEntryDescriptor {
    pub path: String,
    pub declared_size: u64,
    archive_path: Arc<PathBuf>,
    index: usize,
}

impl ArchiveEntryDescriptor {
    /// Streams this entry's decompressed bytes by reopening the scratch file
    /// and seeking to its central-directory index. Each call gets an
    /// independent reader, so concurrent workers never contend on a shared
    /// zip cursor.
    pub async fn open(&self) -> anyhow::Result<impl AsyncRead + Unpin + Send + 'static> {
        open_entry_stream(self.archive_path.clone(), self.index).await
    }
}

/// An entry queued for upload: the archive entry plus where it lands and
/// whether it should get an HTML tail appended.
#[derive(Clone, Debug)]
pub struct UploadTask {
    pub entry: ArchiveEntryDescriptor,
    pub destination_key: String,
    pub is_directory: bool,
    /// Only populated for `index.html` entries when tail injection is
    /// configured; the entry processor re-checks that content-encoding is
    /// empty before actually injecting it.
    pub html_tail: Option<Arc<str>>,
}

async fn open_entry_stream(
    archive_path: Arc<PathBuf>,
    index: usize,
) -> anyhow::Result<impl AsyncRead + Unpin + Send + 'static> {
    let file = tokio::fs::File::open(&*archive_path).await?;
    let mut reader = async_zip_reader::ZipReader::new(file).await?;
    let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(8);
    tokio::spawn(async move {
        let entry = match reader.by_index(index).await {
            Ok(entry) => entry,
            Err(e) => {
                let _ = tx.send(Err(std::io::Error::other(e))).await;
                return;
            },
        };
        use tokio::io::AsyncReadExt;
        let mut body = entry.read();
        loop {
            let mut buf = vec![0u8; 64 * 1024];
            match body.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    buf.truncate(n);
                    if tx.send(Ok(buf.into())).await.is_err() {
                        break;
                    }
                },
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    break;
                },
            }
        }
    });
    Ok(StreamReader::new(ReceiverStream::new(rx)))
}

/// Archive-relative paths never surface these to the worker pool: directory
/// entries, path traversal, absolute paths, and macOS/git housekeeping
/// directories that sneak into archives built on a Mac or checked out of a
/// repo.
fn should_ignore(path: &str) -> bool {
    path.ends_with('/')
        || path.split('/').any(|component| component == "..")
        || path.starts_with('/')
        || path.starts_with("__MACOSX/")
        || path.starts_with(".git/")
}

enum Filter {
    AllowList(Vec<String>),
    Glob(GlobMatcher),
    None,
}

impl Filter {
    fn matches(&self, path: &str) -> bool {
        match self {
            Filter::AllowList(list) => list.iter().any(|p| p == path),
            Filter::Glob(glob) => glob.is_match(path),
            Filter::None => true,
        }
    }
}

pub struct Scanner;

impl Scanner {
    /// Opens the archive at `archive_path`, applies the ignore/filter/limit
    /// policies in `limits`, and returns the validated upload tasks with
    /// destination keys joined under `dest_prefix`. Fails the whole job (no
    /// partial task list) if any limit is violated.
    pub async fn scan(
        archive_path: &Path,
        limits: &ExtractionLimits,
        dest_prefix: &str,
    ) -> anyhow::Result<Vec<UploadTask>> {
        limits.validate()?;

        let archive_path = Arc::new(archive_path.to_path_buf());
        let file = tokio::fs::File::open(&*archive_path)
            .await
            .map_err(|e| anyhow::Error::new(e).context(ErrorMetadata::fetch_error("failed to open archive")))?;
        let mut reader = async_zip_reader::ZipReader::new(file)
            .await
            .map_err(|e| e.context(ErrorMetadata::fetch_error("archive is not a valid zip file")))?;

        let raw_count = reader.len() as u64;
        if limits.max_entries != 0 && raw_count > limits.max_entries {
            anyhow::bail!(ErrorMetadata::limit_exceeded(
                "TooManyFiles",
                format!(
                    "too many files: archive contains {raw_count} entries, exceeding the {} limit",
                    limits.max_entries
                ),
            ));
        }

        let filter = build_filter(limits)?;

        let mut tasks = Vec::new();
        let mut total_size: u64 = 0;
        for index in 0..reader.len() {
            let entry = reader.by_index(index).await?;
            let path = entry.name().to_string();
            let is_dir = entry.is_dir() || !entry.is_file();
            let declared_size = entry.size();
            drop(entry);

            if should_ignore(&path) {
                continue;
            }
            if !filter.matches(&path) {
                continue;
            }

            if limits.max_path_length != 0 && path.len() as u64 > limits.max_path_length {
                anyhow::bail!(ErrorMetadata::limit_exceeded(
                    "PathTooLong",
                    format!(
                        "entry path {path:?} is {} bytes, exceeding the {} byte limit",
                        path.len(),
                        limits.max_path_length
                    ),
                ));
            }

            let is_index_html = basename(&path).eq_ignore_ascii_case("index.html");
            let html_tail = if is_index_html {
                limits.html_tail.as_deref().map(Arc::from)
            } else {
                None
            };
            let tail_len = html_tail.as_ref().map_or(0, |t: &Arc<str>| t.len() as u64);
            let effective_size = declared_size.saturating_add(tail_len);

            if limits.max_entry_size != 0 && effective_size > limits.max_entry_size {
                anyhow::bail!(ErrorMetadata::limit_exceeded(
                    "EntryTooLarge",
                    format!(
                        "entry {path:?} is {effective_size} bytes, exceeding the {} byte limit",
                        limits.max_entry_size
                    ),
                ));
            }

            total_size = total_size.saturating_add(effective_size);
            if limits.max_total_size != 0 && total_size > limits.max_total_size {
                anyhow::bail!(ErrorMetadata::limit_exceeded(
                    "TotalTooLarge",
                    format!(
                        "archive contents exceed the {} byte total size limit",
                        limits.max_total_size
                    ),
                ));
            }

            let destination_key = join_prefix(dest_prefix, &path);
            tasks.push(UploadTask {
                entry: ArchiveEntryDescriptor {
                    path,
                    declared_size,
                    archive_path: archive_path.clone(),
                    index,
                },
                destination_key,
                is_directory: is_dir,
                html_tail,
            });
        }

        Ok(tasks)
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn join_prefix(prefix: &str, path: &str) -> String {
    if prefix.is_empty() {
        path.to_string()
    } else {
        format!("{}/{path}", prefix.trim_end_matches('/'))
    }
}

fn build_filter(limits: &ExtractionLimits) -> anyhow::Result<Filter> {
    if let Some(allow_list) = &limits.allow_list {
        Ok(Filter::AllowList(allow_list.clone()))
    } else if let Some(pattern) = &limits.include_glob {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|e| {
                anyhow::Error::new(ErrorMetadata::invalid_params(
                    "InvalidFilter",
                    format!("invalid filter glob {pattern:?}: {e}"),
                ))
            })?;
        Ok(Filter::Glob(glob.compile_matcher()))
    } else {
        Ok(Filter::None)
    }
}

#[cfg(test)]
mod tests {
    use async_zip::{
        tokio::write::ZipFileWriter,
        Compression,
        ZipEntryBuilder,
    };

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
    async fn happy_path_round_trip() {
        let path = build_archive(&[("hello.txt", b"H")]).await;
        let tasks = Scanner::scan(&path, &ExtractionLimits::default(), "").await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].destination_key, "hello.txt");
        let mut buf = Vec::new();
        use tokio::io::AsyncReadExt;
        tasks[0].entry.open().await.unwrap().read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"H");
    }

    #[tokio::test]
    async fn ignore_rules_drop_macosx_dotgit_traversal_and_absolute() {
        let path = build_archive(&[
            ("__MACOSX/hello", b"x"),
            ("woops/../../etc/passwd", b"x"),
            (".git/HEAD", b"x"),
        ])
        .await;
        let tasks = Scanner::scan(&path, &ExtractionLimits::default(), "").await.unwrap();
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn too_many_files_aborts_before_filtering() {
        let path = build_archive(&[("a", b"x"), ("b", b"x"), ("c", b"x"), ("d", b"x")]).await;
        let limits = ExtractionLimits {
            max_entries: 3,
            ..Default::default()
        };
        let err = Scanner::scan(&path, &limits, "p").await.unwrap_err();
        assert!(errors::ErrorMetadataAnyhowExt::is_limit_exceeded(&err));
        assert!(err.to_string().contains("too many files"));
    }

    #[tokio::test]
    async fn allow_list_and_glob_are_mutually_exclusive() {
        let limits = ExtractionLimits {
            allow_list: Some(vec!["a".to_string()]),
            include_glob: Some("*".to_string()),
            ..Default::default()
        };
        let err = limits.validate().unwrap_err();
        assert_eq!(
            errors::ErrorMetadataAnyhowExt::error_metadata(&err)
                .map(|e| e.code)
                .unwrap(),
            errors::ErrorCode::InvalidParams
        );
    }

    #[tokio::test]
    async fn include_glob_supports_double_star() {
        let path = build_archive(&[("assets/img/a.png", b"x"), ("readme.txt", b"x")]).await;
        let limits = ExtractionLimits {
            include_glob: Some("assets/**".to_string()),
            ..Default::default()
        };
        let tasks = Scanner::scan(&path, &limits, "").await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].destination_key, "assets/img/a.png");
    }

    #[tokio::test]
    async fn entry_too_large_accounts_for_html_tail() {
        let path = build_archive(&[("index.html", b"0123456789")]).await;
        let limits = ExtractionLimits {
            max_entry_size: 12,
            html_tail: Some("xxxxx".to_string()),
            ..Default::default()
        };
        let err = Scanner::scan(&path, &limits, "").await.unwrap_err();
        assert!(errors::ErrorMetadataAnyhowExt::is_limit_exceeded(&err));
    }

    #[tokio::test]
    async fn destination_keys_join_prefix() {
        let path = build_archive(&[("a/b.txt", b"x")]).await;
        let tasks = Scanner::scan(&path, &ExtractionLimits::default(), "p").await.unwrap();
        assert_eq!(tasks[0].destination_key, "p/a/b.txt");
    }
}
