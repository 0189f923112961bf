//! Google Cloud Storage implementation of `storage::Storage`, built on top of
//! the `object_store` crate's GCS backend. Authentication follows GCS's
//! JSON-Web-Token flow: a service-account key (JSON, embedding a PEM private
//! key) is read from `GOOGLE_APPLICATION_CREDENTIALS` (a file path) or
//! `GOOGLE_SERVICE_ACCOUNT_KEY` (the raw JSON), and `object_store` signs
//! outgoing requests with JWTs minted from it.
//!
//! One `ObjectStore` is built per distinct bucket name the first time it's
//! addressed, since `GoogleCloudStorageBuilder` binds a single bucket per
//! store.

use std::{
    collections::HashMap,
    env,
    ops::Range,
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::{
    gcp::GoogleCloudStorageBuilder,
    path::Path as ObjectPath,
    Attribute,
    Attributes,
    ObjectStore,
    PutOptions,
};
use parking_lot::Mutex;
use storage::{
    BoxAsyncRead,
    GetObjectResult,
    Md5Reader,
    ObjectHeaders,
    PutObjectOptions,
    PutObjectResult,
    Storage,
};
use tokio::io::AsyncReadExt;

#[derive(Clone, Default)]
pub struct GcsStorage {
    stores: Arc<Mutex<HashMap<String, Arc<dyn ObjectStore>>>>,
}

impl std::fmt::Debug for GcsStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcsStorage").finish()
    }
}

impl GcsStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn store_for_bucket(&self, bucket: &str) -> anyhow::Result<Arc<dyn ObjectStore>> {
        if let Some(store) = self.stores.lock().get(bucket) {
            return Ok(store.clone());
        }
        let mut builder = GoogleCloudStorageBuilder::new().with_bucket_name(bucket);
        if let Ok(key) = env::var("GOOGLE_SERVICE_ACCOUNT_KEY") {
            builder = builder.with_service_account_key(key);
        } else if let Ok(path) = env::var("GOOGLE_APPLICATION_CREDENTIALS") {
            builder = builder.with_service_account_path(path);
        }
        let store: Arc<dyn ObjectStore> = Arc::new(builder.build()?);
        self.stores
            .lock()
            .insert(bucket.to_string(), store.clone());
        Ok(store)
    }
}

fn is_not_found(err: &object_store::Error) -> bool {
    matches!(err, object_store::Error::NotFound { .. })
}

#[async_trait]
impl Storage for GcsStorage {
    async fn get(&self, bucket: &str, key: &str) -> anyhow::Result<Option<GetObjectResult>> {
        let store = self.store_for_bucket(bucket)?;
        let path = ObjectPath::from(key);
        let result = match store.get(&path).await {
            Ok(result) => result,
            Err(e) if is_not_found(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let content_length = result.meta.size as u64;
        let content_type = result
            .attributes
            .get(&Attribute::ContentType)
            .map(|v| v.to_string());
        let content_encoding = result
            .attributes
            .get(&Attribute::ContentEncoding)
            .map(|v| v.to_string());
        let stream = result
            .into_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        Ok(Some(GetObjectResult {
            reader: Box::pin(tokio_util::io::StreamReader::new(stream)),
            headers: ObjectHeaders {
                content_length,
                content_type,
                content_encoding,
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
        let store = self.store_for_bucket(bucket)?;
        let path = ObjectPath::from(key);
        let range = (range.start as usize)..(range.end as usize);
        let bytes = match store.get_range(&path, range).await {
            Ok(bytes) => bytes,
            Err(e) if is_not_found(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let content_length = bytes.len() as u64;
        Ok(Some(GetObjectResult {
            reader: Box::pin(std::io::Cursor::new(bytes)),
            headers: ObjectHeaders {
                content_length,
                content_type: None,
                content_encoding: None,
            },
        }))
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: BoxAsyncRead,
        options: PutObjectOptions,
    ) -> anyhow::Result<PutObjectResult> {
        let store = self.store_for_bucket(bucket)?;
        let path = ObjectPath::from(key);

        let mut md5_reader = Md5Reader::new(body);
        let mut buf = Vec::new();
        md5_reader.read_to_end(&mut buf).await?;
        let bytes_written = buf.len() as u64;
        let md5_hex = md5_reader
            .digest_handle()
            .lock()
            .expect("poisoned")
            .clone()
            .expect("digest finalized on EOF");

        let mut attributes = Attributes::new();
        attributes.insert(
            Attribute::ContentType,
            options.content_type.clone().into(),
        );
        if let Some(encoding) = &options.content_encoding {
            attributes.insert(Attribute::ContentEncoding, encoding.clone().into());
        }
        if let Some(disposition) = &options.content_disposition {
            attributes.insert(Attribute::ContentDisposition, disposition.clone().into());
        }

        store
            .put_opts(
                &path,
                Bytes::from(buf).into(),
                PutOptions {
                    attributes,
                    ..Default::default()
                },
            )
            .await?;

        Ok(PutObjectResult {
            md5_hex,
            bytes_written,
        })
    }

    async fn delete(&self, bucket: &str, key: &str) -> anyhow::Result<()> {
        let store = self.store_for_bucket(bucket)?;
        let path = ObjectPath::from(key);
        match store.delete(&path).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn supports_head(&self) -> bool {
        true
    }

    async fn head(&self, bucket: &str, key: &str) -> anyhow::Result<Option<ObjectHeaders>> {
        let store = self.store_for_bucket(bucket)?;
        let path = ObjectPath::from(key);
        match store.head(&path).await {
            Ok(meta) => Ok(Some(ObjectHeaders {
                content_length: meta.size as u64,
                content_type: None,
                content_encoding: None,
            })),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_cache_returns_same_instance_per_bucket() {
        let storage = GcsStorage::new();
        let a = storage.store_for_bucket("my-bucket").expect("builds store");
        let b = storage.store_for_bucket("my-bucket").expect("builds store");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
