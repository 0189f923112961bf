//! The storage abstraction shared by every backend (`gcs_storage`,
//! `s3_storage`, and the in-memory backend used by tests below).
//!
//! Deliberately small: `get` / `get_range` / `put` / `delete` / `head`, with
//! `get_range` and `head` exposed as optional capabilities rather than
//! separate traits, since every backend we ship implements all five anyway.

use std::{
    collections::BTreeMap,
    fmt::Debug,
    ops::Range,
    pin::Pin,
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use errors::ErrorMetadata;
use futures::Stream;
use parking_lot::Mutex;
use tokio::io::{
    AsyncRead,
    AsyncReadExt,
};

mod limit;
mod md5_reader;

pub use limit::{
    LimitExceededError,
    LimitedReader,
};
pub use md5_reader::Md5Reader;

/// A boxed, owned byte stream. Backends accept this as the body of a `put`,
/// and return it as the body of a `get`/`get_range`.
pub type BoxByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;
/// A boxed, owned async reader, used where callers want `AsyncRead` rather
/// than a raw stream (the scanner and entry processor read this way).
pub type BoxAsyncRead = Pin<Box<dyn AsyncRead + Send>>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AccessLevel {
    PublicRead,
    Private,
}

#[derive(Clone, Debug, Default)]
pub struct PutObjectOptions {
    pub content_type: String,
    /// `gzip`, `br`, or empty.
    pub content_encoding: Option<String>,
    pub content_disposition: Option<String>,
    pub access_level: Option<AccessLevel>,
}

impl PutObjectOptions {
    pub fn new(content_type: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            content_encoding: None,
            content_disposition: None,
            access_level: Some(AccessLevel::PublicRead),
        }
    }

    pub fn with_content_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.content_encoding = Some(encoding.into());
        self
    }
}

#[derive(Clone, Debug)]
pub struct ObjectHeaders {
    pub content_length: u64,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
}

pub struct GetObjectResult {
    pub reader: BoxAsyncRead,
    pub headers: ObjectHeaders,
}

impl GetObjectResult {
    pub async fn collect_bytes(mut self) -> anyhow::Result<Bytes> {
        let mut buf = Vec::with_capacity(self.headers.content_length as usize);
        self.reader.read_to_end(&mut buf).await?;
        Ok(buf.into())
    }
}

#[derive(Clone, Debug)]
pub struct PutObjectResult {
    pub md5_hex: String,
    pub bytes_written: u64,
}

/// Every storage backend implements this; it's the boundary the extraction
/// core is written against so it never has to know whether it's talking to
/// GCS, S3, or the in-memory test double.
#[async_trait]
pub trait Storage: Send + Sync + Debug {
    async fn get(&self, bucket: &str, key: &str) -> anyhow::Result<Option<GetObjectResult>>;

    /// Capability check for `get_range`; backends that can't do random access
    /// (the in-memory backend, notably) return `false` and callers fall back
    /// to a full `get`.
    fn supports_get_range(&self) -> bool {
        false
    }

    async fn get_range(
        &self,
        _bucket: &str,
        _key: &str,
        _range: Range<u64>,
    ) -> anyhow::Result<Option<GetObjectResult>> {
        Ok(None)
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: BoxAsyncRead,
        options: PutObjectOptions,
    ) -> anyhow::Result<PutObjectResult>;

    async fn delete(&self, bucket: &str, key: &str) -> anyhow::Result<()>;

    fn supports_head(&self) -> bool {
        false
    }

    async fn head(&self, _bucket: &str, _key: &str) -> anyhow::Result<Option<ObjectHeaders>> {
        Ok(None)
    }
}

pub fn not_found(bucket: &str, key: &str) -> anyhow::Error {
    anyhow::Error::new(ErrorMetadata::not_found(
        "ObjectNotFound",
        format!("{bucket}/{key} does not exist"),
    ))
}

/// In-memory backend used by unit/integration tests (§6, A4). Stores whole
/// objects in a mutex-guarded map; every `get`/`get_range` is served from
/// memory so it never blocks.
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    objects: Arc<Mutex<BTreeMap<(String, String), StoredObject>>>,
}

#[derive(Clone)]
struct StoredObject {
    bytes: Bytes,
    content_type: String,
    content_encoding: Option<String>,
}

impl Debug for InMemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStorage").finish()
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds an object directly, bypassing `put` -- used by tests to stage a
    /// source archive or to pre-populate a fixture.
    pub fn seed(&self, bucket: &str, key: &str, bytes: impl Into<Bytes>, content_type: &str) {
        self.objects.lock().insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                bytes: bytes.into(),
                content_type: content_type.to_string(),
                content_encoding: None,
            },
        );
    }

    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.objects
            .lock()
            .contains_key(&(bucket.to_string(), key.to_string()))
    }

    pub fn keys_with_prefix(&self, bucket: &str, prefix: &str) -> Vec<String> {
        self.objects
            .lock()
            .keys()
            .filter(|(b, k)| b == bucket && k.starts_with(prefix))
            .map(|(_, k)| k.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn get(&self, bucket: &str, key: &str) -> anyhow::Result<Option<GetObjectResult>> {
        let Some(obj) = self
            .objects
            .lock()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
        else {
            return Ok(None);
        };
        let content_length = obj.bytes.len() as u64;
        Ok(Some(GetObjectResult {
            reader: Box::pin(std::io::Cursor::new(obj.bytes)),
            headers: ObjectHeaders {
                content_length,
                content_type: Some(obj.content_type),
                content_encoding: obj.content_encoding,
            },
        }))
    }

    fn supports_get_range(&self) -> bool {
        true
    }

    async fn get_range(
        &self,
        bucket: &str,
        key: &str,
        range: Range<u64>,
    ) -> anyhow::Result<Option<GetObjectResult>> {
        let Some(obj) = self
            .objects
            .lock()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
        else {
            return Ok(None);
        };
        let start = (range.start as usize).min(obj.bytes.len());
        let end = (range.end as usize).min(obj.bytes.len()).max(start);
        let slice = obj.bytes.slice(start..end);
        let content_length = slice.len() as u64;
        Ok(Some(GetObjectResult {
            reader: Box::pin(std::io::Cursor::new(slice)),
            headers: ObjectHeaders {
                content_length,
                content_type: Some(obj.content_type),
                content_encoding: obj.content_encoding,
            },
        }))
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        mut body: BoxAsyncRead,
        options: PutObjectOptions,
    ) -> anyhow::Result<PutObjectResult> {
        let mut buf = Vec::new();
        body.read_to_end(&mut buf).await?;
        let md5_hex = hex::encode(md5::Md5::digest(&buf));
        let bytes_written = buf.len() as u64;
        self.objects.lock().insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                bytes: buf.into(),
                content_type: options.content_type,
                content_encoding: options.content_encoding,
            },
        );
        Ok(PutObjectResult {
            md5_hex,
            bytes_written,
        })
    }

    async fn delete(&self, bucket: &str, key: &str) -> anyhow::Result<()> {
        self.objects
            .lock()
            .remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }

    fn supports_head(&self) -> bool {
        true
    }

    async fn head(&self, bucket: &str, key: &str) -> anyhow::Result<Option<ObjectHeaders>> {
        Ok(self
            .objects
            .lock()
            .get(&(bucket.to_string(), key.to_string()))
            .map(|obj| ObjectHeaders {
                content_length: obj.bytes.len() as u64,
                content_type: Some(obj.content_type.clone()),
                content_encoding: obj.content_encoding.clone(),
            }))
    }
}

use md5::Digest as _;

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn put_then_get_roundtrips() -> anyhow::Result<()> {
        let storage = InMemoryStorage::new();
        let body: BoxAsyncRead = Box::pin(std::io::Cursor::new(Bytes::from_static(b"hello")));
        let result = storage
            .put("bucket", "key", body, PutObjectOptions::new("text/plain"))
            .await?;
        assert_eq!(result.bytes_written, 5);

        let mut got = storage.get("bucket", "key").await?.expect("present");
        let mut buf = String::new();
        got.reader.read_to_string(&mut buf).await?;
        assert_eq!(buf, "hello");
        assert_eq!(got.headers.content_type.as_deref(), Some("text/plain"));
        Ok(())
    }

    #[tokio::test]
    async fn delete_removes_object() -> anyhow::Result<()> {
        let storage = InMemoryStorage::new();
        storage.seed("bucket", "key", "data", "text/plain");
        assert!(storage.contains("bucket", "key"));
        storage.delete("bucket", "key").await?;
        assert!(!storage.contains("bucket", "key"));
        Ok(())
    }

    #[tokio::test]
    async fn get_range_clamps_to_object_length() -> anyhow::Result<()> {
        let storage = InMemoryStorage::new();
        storage.seed("bucket", "key", "0123456789", "text/plain");
        let mut result = storage
            .get_range("bucket", "key", 5..1000)
            .await?
            .expect("present");
        let mut buf = String::new();
        result.reader.read_to_string(&mut buf).await?;
        assert_eq!(buf, "56789");
        Ok(())
    }
}
