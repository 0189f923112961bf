//! Runtime storage-backend selection (§9: "Dynamic dispatch... Tagged
//! variants suffice: `Gcs`, `S3`, `InMemory`"). `JobCoordinator` and the
//! transfer operations are written against `storage::Storage`; this enum
//! picks which concrete backend that trait delegates to, chosen once at
//! startup from [`crate::config::Config`].

use async_trait::async_trait;
use gcs_storage::GcsStorage;
use s3_storage::S3Storage;
use storage::{
    BoxAsyncRead,
    GetObjectResult,
    ObjectHeaders,
    PutObjectOptions,
    PutObjectResult,
    Storage,
};

use crate::config::{
    Config,
    StorageBackendKind,
};

pub enum BackendStorage {
    Gcs(GcsStorage),
    S3(S3Storage),
    Memory(storage::InMemoryStorage),
}

impl std::fmt::Debug for BackendStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gcs(s) => s.fmt(f),
            Self::S3(s) => s.fmt(f),
            Self::Memory(s) => s.fmt(f),
        }
    }
}

impl BackendStorage {
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(match config.storage_backend {
            StorageBackendKind::Gcs => Self::Gcs(GcsStorage::new()),
            StorageBackendKind::S3 => Self::S3(S3Storage::from_env().await?),
            StorageBackendKind::Memory => Self::Memory(storage::InMemoryStorage::new()),
        })
    }
}

#[async_trait]
impl Storage for BackendStorage {
    async fn get(&self, bucket: &str, key: &str) -> anyhow::Result<Option<GetObjectResult>> {
        match self {
            Self::Gcs(s) => s.get(bucket, key).await,
            Self::S3(s) => s.get(bucket, key).await,
            Self::Memory(s) => s.get(bucket, key).await,
        }
    }

    fn supports_get_range(&self) -> bool {
        match self {
            Self::Gcs(s) => s.supports_get_range(),
            Self::S3(s) => s.supports_get_range(),
            Self::Memory(s) => s.supports_get_range(),
        }
    }

    async fn get_range(
        &self,
        bucket: &str,
        key: &str,
        range: std::ops::Range<u64>,
    ) -> anyhow::Result<Option<GetObjectResult>> {
        match self {
            Self::Gcs(s) => s.get_range(bucket, key, range).await,
            Self::S3(s) => s.get_range(bucket, key, range).await,
            Self::Memory(s) => s.get_range(bucket, key, range).await,
        }
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: BoxAsyncRead,
        options: PutObjectOptions,
    ) -> anyhow::Result<PutObjectResult> {
        match self {
            Self::Gcs(s) => s.put(bucket, key, body, options).await,
            Self::S3(s) => s.put(bucket, key, body, options).await,
            Self::Memory(s) => s.put(bucket, key, body, options).await,
        }
    }

    async fn delete(&self, bucket: &str, key: &str) -> anyhow::Result<()> {
        match self {
            Self::Gcs(s) => s.delete(bucket, key).await,
            Self::S3(s) => s.delete(bucket, key).await,
            Self::Memory(s) => s.delete(bucket, key).await,
        }
    }

    fn supports_head(&self) -> bool {
        match self {
            Self::Gcs(s) => s.supports_head(),
            Self::S3(s) => s.supports_head(),
            Self::Memory(s) => s.supports_head(),
        }
    }

    async fn head(&self, bucket: &str, key: &str) -> anyhow::Result<Option<ObjectHeaders>> {
        match self {
            Self::Gcs(s) => s.head(bucket, key).await,
            Self::S3(s) => s.head(bucket, key).await,
            Self::Memory(s) => s.head(bucket, key).await,
        }
    }
}
