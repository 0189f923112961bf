//! Central-directory listing (§4.7 List): reuses the fetcher/`async_zip_reader`
//! path that the extraction core uses to open an archive, but never streams
//! entry bodies or writes anything to a destination.
//!
//! When the backend supports `get_range` and `head`, this instead reads only
//! the end-of-central-directory record and the central directory itself --
//! typically a small fraction of the archive -- and parses them directly,
//! skipping the full download. That fast path only understands ZIP32
//! archives; anything it can't confidently parse (zip64 size markers, a
//! truncated or unrecognized EOCD) falls back to the full fetch instead of
//! guessing.

use std::path::Path;

use errors::ErrorMetadata;
use storage::Storage;

use crate::metrics;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveEntryInfo {
    pub path: String,
    pub declared_size: u64,
    pub is_dir: bool,
}

/// Lists every entry in the archive at `bucket`/`key`, preferring the
/// get-range fast path and falling back to a full fetch through `fetcher`
/// into `scratch_dir` when the backend can't do random access or the fast
/// path can't parse the archive.
pub async fn list(
    storage: &dyn Storage,
    bucket: &str,
    key: &str,
    fetcher: &fetcher::Fetcher,
    max_input_size: u64,
) -> anyhow::Result<Vec<ArchiveEntryInfo>> {
    if storage.supports_get_range() && storage.supports_head() {
        match list_via_range(storage, bucket, key).await {
            Ok(entries) => {
                metrics::log_list_fast_path(true);
                return Ok(entries);
            },
            Err(e) => {
                tracing::debug!("get-range listing fast path declined for {bucket}/{key}: {e:#}");
            },
        }
    }
    metrics::log_list_fast_path(false);
    list_via_fetch(storage, bucket, key, fetcher, max_input_size).await
}

async fn list_via_fetch(
    storage: &dyn Storage,
    bucket: &str,
    key: &str,
    fetcher: &fetcher::Fetcher,
    max_input_size: u64,
) -> anyhow::Result<Vec<ArchiveEntryInfo>> {
    let scratch = fetcher.fetch(storage, bucket, key, max_input_size).await?;
    list_local_archive(scratch.path()).await
}

async fn list_local_archive(path: &Path) -> anyhow::Result<Vec<ArchiveEntryInfo>> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| anyhow::Error::new(e).context(ErrorMetadata::fetch_error("failed to open archive")))?;
    let mut reader = async_zip_reader::ZipReader::new(file)
        .await
        .map_err(|e| e.context(ErrorMetadata::fetch_error("archive is not a valid zip file")))?;
    let mut entries = Vec::with_capacity(reader.len());
    for index in 0..reader.len() {
        let entry = reader.by_index(index).await?;
        entries.push(ArchiveEntryInfo {
            path: entry.name().to_string(),
            declared_size: entry.size(),
            is_dir: entry.is_dir() || !entry.is_file(),
        });
    }
    Ok(entries)
}

/// Maximum size of the end-of-central-directory record plus its trailing
/// comment: 22 fixed bytes plus a comment of up to `u16::MAX` bytes.
const EOCD_MAX_WINDOW: u64 = 22 + u16::MAX as u64;
const EOCD_SIGNATURE: [u8; 4] = [0x50, 0x4b, 0x05, 0x06];
const CENTRAL_DIR_SIGNATURE: [u8; 4] = [0x50, 0x4b, 0x01, 0x02];
const ZIP64_MARKER: u32 = 0xFFFF_FFFF;

async fn list_via_range(storage: &dyn Storage, bucket: &str, key: &str) -> anyhow::Result<Vec<ArchiveEntryInfo>> {
    let headers = storage
        .head(bucket, key)
        .await?
        .ok_or_else(|| storage::not_found(bucket, key))?;
    let total = headers.content_length;
    anyhow::ensure!(total >= 22, "archive is too small to contain an end-of-central-directory record");

    let tail_window = total.min(EOCD_MAX_WINDOW);
    let tail_start = total - tail_window;
    let tail = storage
        .get_range(bucket, key, tail_start..total)
        .await?
        .ok_or_else(|| storage::not_found(bucket, key))?
        .collect_bytes()
        .await?;

    let eocd_offset_in_tail = find_eocd(&tail).ok_or_else(|| anyhow::anyhow!("end-of-central-directory record not found in trailing bytes"))?;
    let eocd = &tail[eocd_offset_in_tail..];
    anyhow::ensure!(eocd.len() >= 22, "truncated end-of-central-directory record");

    let cd_size = u32::from_le_bytes(eocd[12..16].try_into().unwrap());
    let cd_offset = u32::from_le_bytes(eocd[16..20].try_into().unwrap());
    anyhow::ensure!(cd_offset != ZIP64_MARKER, "zip64 archives are not supported by the fast listing path");

    let cd_start = cd_offset as u64;
    let cd_end = cd_start.saturating_add(cd_size as u64);
    anyhow::ensure!(cd_end <= total, "central directory range extends past the end of the object");

    let cd_bytes = if cd_start >= tail_start {
        tail[(cd_start - tail_start) as usize..(cd_end - tail_start) as usize].to_vec()
    } else {
        storage
            .get_range(bucket, key, cd_start..cd_end)
            .await?
            .ok_or_else(|| storage::not_found(bucket, key))?
            .collect_bytes()
            .await?
            .to_vec()
    };

    parse_central_directory(&cd_bytes)
}

/// Scans `tail` backward for the EOCD signature. Real-world archives almost
/// never contain the four-byte sequence inside their comment, so the first
/// match found scanning from the end is trusted without re-validating the
/// comment-length field against it.
fn find_eocd(tail: &[u8]) -> Option<usize> {
    if tail.len() < 22 {
        return None;
    }
    (0..=tail.len() - 22).rev().find(|&i| tail[i..i + 4] == EOCD_SIGNATURE)
}

fn parse_central_directory(mut bytes: &[u8]) -> anyhow::Result<Vec<ArchiveEntryInfo>> {
    let mut entries = Vec::new();
    while !bytes.is_empty() {
        anyhow::ensure!(bytes.len() >= 46, "truncated central directory file header");
        anyhow::ensure!(bytes[0..4] == CENTRAL_DIR_SIGNATURE, "unexpected signature in central directory");

        let uncompressed_size = u32::from_le_bytes(bytes[24..28].try_into().unwrap());
        anyhow::ensure!(uncompressed_size != ZIP64_MARKER, "zip64 entry sizes are not supported by the fast listing path");
        let filename_len = u16::from_le_bytes(bytes[28..30].try_into().unwrap()) as usize;
        let extra_len = u16::from_le_bytes(bytes[30..32].try_into().unwrap()) as usize;
        let comment_len = u16::from_le_bytes(bytes[32..34].try_into().unwrap()) as usize;

        let header_len = 46 + filename_len + extra_len + comment_len;
        anyhow::ensure!(bytes.len() >= header_len, "central directory entry overruns the directory buffer");

        let name = String::from_utf8_lossy(&bytes[46..46 + filename_len]).into_owned();
        let is_dir = name.ends_with('/');
        entries.push(ArchiveEntryInfo {
            path: name,
            declared_size: uncompressed_size as u64,
            is_dir,
        });

        bytes = &bytes[header_len..];
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use async_zip::{
        tokio::write::ZipFileWriter,
        Compression,
        ZipEntryBuilder,
    };
    use storage::InMemoryStorage;

    use super::*;

    async fn build_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut writer = ZipFileWriter::with_tokio(&mut buf);
        for (name, contents) in entries {
            let builder = ZipEntryBuilder::new((*name).to_string().into(), Compression::Deflate);
            writer.write_entry_whole(builder, contents).await.unwrap();
        }
        writer.close().await.unwrap();
        buf
    }

    #[tokio::test]
    async fn fast_path_matches_full_fetch_listing() -> anyhow::Result<()> {
        let bytes = build_archive(&[("a.txt", b"hello"), ("dir/b.txt", b"world!")]).await;
        let storage = InMemoryStorage::new();
        storage.seed("bucket", "archive.zip", bytes.clone(), "application/zip");

        let range_entries = list_via_range(&storage, "bucket", "archive.zip").await?;
        assert_eq!(range_entries.len(), 2);
        assert_eq!(range_entries[0].path, "a.txt");
        assert_eq!(range_entries[0].declared_size, 5);
        assert_eq!(range_entries[1].path, "dir/b.txt");
        assert_eq!(range_entries[1].declared_size, 6);

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("archive.zip");
        tokio::fs::write(&path, &bytes).await?;
        let fetch_entries = list_local_archive(&path).await?;
        assert_eq!(fetch_entries, range_entries);
        Ok(())
    }

    #[tokio::test]
    async fn list_prefers_fast_path_when_backend_supports_range() -> anyhow::Result<()> {
        let bytes = build_archive(&[("only.txt", b"x")]).await;
        let storage = InMemoryStorage::new();
        storage.seed("bucket", "archive.zip", bytes, "application/zip");
        let dir = tempfile::tempdir()?;
        let fetcher = fetcher::Fetcher::new(dir.path());

        let entries = list(&storage, "bucket", "archive.zip", &fetcher, 0).await?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "only.txt");
        // The fast path must not have left anything behind in the scratch dir.
        assert!(tokio::fs::read_dir(dir.path()).await?.next_entry().await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn missing_archive_reports_not_found() {
        let storage = InMemoryStorage::new();
        let dir = tempfile::tempdir().unwrap();
        let fetcher = fetcher::Fetcher::new(dir.path());
        let err = list(&storage, "bucket", "missing.zip", &fetcher, 0).await.unwrap_err();
        assert_eq!(
            errors::ErrorMetadataAnyhowExt::error_metadata(&err).map(|e| e.code),
            Some(errors::ErrorCode::NotFound)
        );
    }
}
