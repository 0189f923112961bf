//! S3-backed implementation of the `storage::Storage` abstraction.
//!
//! Every entry the extraction core uploads is already bounded by
//! `ExtractionLimits::max_entry_size`, so unlike a general-purpose export
//! pipeline we don't need multipart uploads here: each `put` buffers the
//! (bounded) body and issues a single `PutObject`.

use std::ops::Range;

use async_trait::async_trait;
use aws_sdk_s3::{
    error::SdkError,
    operation::head_object::HeadObjectError,
    primitives::ByteStream,
    types::ObjectCannedAcl,
    Client,
};
use aws_utils::{
    is_sse_disabled,
    must_s3_config_from_env,
};
use futures::TryStreamExt;
use md5::Digest as _;
use storage::{
    AccessLevel,
    BoxAsyncRead,
    GetObjectResult,
    Md5Reader,
    ObjectHeaders,
    PutObjectOptions,
    PutObjectResult,
    Storage,
};
use tokio::io::AsyncReadExt;

mod metrics;

#[derive(Clone)]
pub struct S3Storage {
    client: Client,
}

impl std::fmt::Debug for S3Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Storage").finish()
    }
}

impl S3Storage {
    pub async fn from_env() -> anyhow::Result<Self> {
        let config = must_s3_config_from_env().await?.build();
        Ok(Self {
            client: Client::from_conf(config),
        })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Storage for S3Storage {
    async fn get(&self, bucket: &str, key: &str) -> anyhow::Result<Option<GetObjectResult>> {
        self.get_range_inner(bucket, key, None).await
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
        self.get_range_inner(bucket, key, Some(range)).await
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: BoxAsyncRead,
        options: PutObjectOptions,
    ) -> anyhow::Result<PutObjectResult> {
        let timer = metrics::put_object_timer();
        let mut md5_reader = Md5Reader::new(body);
        let mut buf = Vec::new();
        md5_reader.read_to_end(&mut buf).await?;
        let bytes_written = buf.len() as u64;
        let digest_handle = md5_reader.digest_handle();
        let md5_hex = digest_handle
            .lock()
            .expect("poisoned")
            .clone()
            .unwrap_or_else(|| hex::encode(md5::Md5::digest(&buf)));

        let mut builder = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(buf))
            .content_type(&options.content_type);
        if let Some(encoding) = &options.content_encoding {
            builder = builder.content_encoding(encoding);
        }
        if let Some(disposition) = &options.content_disposition {
            builder = builder.content_disposition(disposition);
        }
        if matches!(options.access_level, Some(AccessLevel::PublicRead)) {
            builder = builder.acl(ObjectCannedAcl::PublicRead);
        }
        if !is_sse_disabled() {
            builder = builder.server_side_encryption(aws_sdk_s3::types::ServerSideEncryption::Aes256);
        }
        builder
            .send()
            .await
            .map_err(|e| anyhow::anyhow!(e))
            .map_err(|e| e.context(format!("failed to put s3://{bucket}/{key}")))?;
        timer.finish();
        Ok(PutObjectResult {
            md5_hex,
            bytes_written,
        })
    }

    async fn delete(&self, bucket: &str, key: &str) -> anyhow::Result<()> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!(e).context(format!("failed to delete s3://{bucket}/{key}")))?;
        Ok(())
    }

    fn supports_head(&self) -> bool {
        true
    }

    async fn head(&self, bucket: &str, key: &str) -> anyhow::Result<Option<ObjectHeaders>> {
        let result = self.client.head_object().bucket(bucket).key(key).send().await;
        match result {
            Ok(output) => Ok(Some(ObjectHeaders {
                content_length: output.content_length.unwrap_or_default() as u64,
                content_type: output.content_type,
                content_encoding: output.content_encoding,
            })),
            Err(SdkError::ServiceError(err)) => match err.err() {
                HeadObjectError::NotFound(_) => Ok(None),
                _ => Err(err.into_err().into()),
            },
            Err(err) => Err(err.into()),
        }
    }
}

impl S3Storage {
    async fn get_range_inner(
        &self,
        bucket: &str,
        key: &str,
        range: Option<Range<u64>>,
    ) -> anyhow::Result<Option<GetObjectResult>> {
        let mut request = self.client.get_object().bucket(bucket).key(key);
        if let Some(range) = &range {
            if range.start >= range.end {
                return Ok(Some(GetObjectResult {
                    reader: Box::pin(std::io::Cursor::new(Vec::new())),
                    headers: ObjectHeaders {
                        content_length: 0,
                        content_type: None,
                        content_encoding: None,
                    },
                }));
            }
            request = request.range(format!("bytes={}-{}", range.start, range.end - 1));
        }
        let result = request.send().await;
        let output = match result {
            Ok(output) => output,
            Err(SdkError::ServiceError(err)) if is_not_found(err.err()) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let content_length = output.content_length.unwrap_or_default() as u64;
        let content_type = output.content_type.clone();
        let content_encoding = output.content_encoding.clone();
        let stream = tokio_util::io::StreamReader::new(
            output
                .body
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
        );
        Ok(Some(GetObjectResult {
            reader: Box::pin(stream),
            headers: ObjectHeaders {
                content_length,
                content_type,
                content_encoding,
            },
        }))
    }
}

fn is_not_found(err: &aws_sdk_s3::operation::get_object::GetObjectError) -> bool {
    matches!(
        err,
        aws_sdk_s3::operation::get_object::GetObjectError::NoSuchKey(_)
    )
}

#[cfg(test)]
mod tests {
    use storage::PutObjectOptions;

    use super::*;

    #[test]
    fn put_object_options_default_has_no_acl() {
        let options = PutObjectOptions {
            content_type: "text/plain".to_string(),
            content_encoding: None,
            content_disposition: None,
            access_level: None,
        };
        assert!(options.access_level.is_none());
    }
}
