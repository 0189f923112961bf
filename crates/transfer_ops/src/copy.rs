//! Single-entry, streamed object copy (§4.7 Copy). Source and destination may
//! be different `Storage` implementations, so this is written against `&dyn
//! Storage` on both sides rather than a shared generic parameter.

use errors::ErrorMetadata;
use storage::{
    PutObjectOptions,
    PutObjectResult,
    Storage,
};

use crate::metrics;

pub struct CopyRequest<'a> {
    pub source: &'a dyn Storage,
    pub source_bucket: &'a str,
    pub source_key: &'a str,
    pub dest: &'a dyn Storage,
    pub dest_bucket: &'a str,
    pub dest_key: &'a str,
}

/// `get`s the source object and `put`s its body straight through to the
/// destination without buffering the whole thing in memory -- the same
/// `BoxAsyncRead` that came off the source reader is handed directly to the
/// destination's `put`.
pub async fn copy(req: CopyRequest<'_>) -> anyhow::Result<PutObjectResult> {
    let timer = metrics::copy_timer();
    let got = req
        .source
        .get(req.source_bucket, req.source_key)
        .await
        .map_err(|e| {
            e.context(ErrorMetadata::copy_error(format!(
                "failed to read {}/{}",
                req.source_bucket, req.source_key
            )))
        })?
        .ok_or_else(|| storage::not_found(req.source_bucket, req.source_key))?;

    let options = PutObjectOptions {
        content_type: got
            .headers
            .content_type
            .clone()
            .unwrap_or_else(|| content_types::APPLICATION_OCTET_STREAM.to_string()),
        content_encoding: got.headers.content_encoding.clone(),
        content_disposition: None,
        access_level: Some(storage::AccessLevel::PublicRead),
    };

    let result = req
        .dest
        .put(req.dest_bucket, req.dest_key, got.reader, options)
        .await
        .map_err(|e| {
            e.context(ErrorMetadata::copy_error(format!(
                "failed to write {}/{}",
                req.dest_bucket, req.dest_key
            )))
        })?;
    timer.finish();
    Ok(result)
}

#[cfg(test)]
mod tests {
    use storage::InMemoryStorage;

    use super::*;

    #[tokio::test]
    async fn copies_bytes_and_content_type_unmodified() -> anyhow::Result<()> {
        let source = InMemoryStorage::new();
        source.seed("src-bucket", "a.txt", "hello", "text/plain; charset=utf-8");
        let dest = InMemoryStorage::new();

        let result = copy(CopyRequest {
            source: &source,
            source_bucket: "src-bucket",
            source_key: "a.txt",
            dest: &dest,
            dest_bucket: "dest-bucket",
            dest_key: "b.txt",
        })
        .await?;

        assert_eq!(result.bytes_written, 5);
        let got = dest.get("dest-bucket", "b.txt").await?.expect("present");
        assert_eq!(got.headers.content_type.as_deref(), Some("text/plain; charset=utf-8"));
        Ok(())
    }

    #[tokio::test]
    async fn missing_source_reports_not_found() {
        let source = InMemoryStorage::new();
        let dest = InMemoryStorage::new();
        let err = copy(CopyRequest {
            source: &source,
            source_bucket: "src",
            source_key: "missing.txt",
            dest: &dest,
            dest_bucket: "dest",
            dest_key: "b.txt",
        })
        .await
        .unwrap_err();
        assert_eq!(
            errors::ErrorMetadataAnyhowExt::error_metadata(&err).map(|e| e.code),
            Some(errors::ErrorCode::NotFound)
        );
    }
}
