//! URL ingestion (§4.7 Slurp): pulls bytes from an arbitrary HTTP(S) URL,
//! rather than from a storage backend, and uploads them to a destination.
//! Subject to the same input-size cap as the fetcher (C2), enforced the same
//! way: `Content-Length` is checked up front where present, and the stream
//! itself is wrapped in a `LimitedReader` in case the server lied or omitted
//! the header.

use errors::ErrorMetadata;
use futures::TryStreamExt;
use storage::{
    LimitedReader,
    PutObjectOptions,
    PutObjectResult,
    Storage,
};
use tokio_util::io::StreamReader;

use crate::metrics;

pub struct SlurpRequest<'a> {
    pub http_client: &'a reqwest::Client,
    pub source_url: &'a str,
    pub dest: &'a dyn Storage,
    pub dest_bucket: &'a str,
    pub dest_key: &'a str,
    /// `0` means unbounded, matching `ExtractionLimits`'s convention.
    pub max_input_size: u64,
}

pub async fn slurp(req: SlurpRequest<'_>) -> anyhow::Result<PutObjectResult> {
    let timer = metrics::slurp_timer();
    let response = req
        .http_client
        .get(req.source_url)
        .send()
        .await
        .map_err(|e| anyhow::Error::new(e).context(ErrorMetadata::slurp_error(format!("failed to fetch {}", req.source_url))))?;

    if !response.status().is_success() {
        anyhow::bail!(ErrorMetadata::slurp_error(format!(
            "{} returned status {}",
            req.source_url,
            response.status()
        )));
    }

    let limit = fetcher::effective_limit(req.max_input_size);
    if let Some(len) = response.content_length() {
        if req.max_input_size != 0 && len > req.max_input_size {
            anyhow::bail!(ErrorMetadata::limit_exceeded(
                "ArchiveTooLarge",
                format!("{} is {len} bytes, exceeding the {} byte limit", req.source_url, req.max_input_size),
            ));
        }
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| content_types::APPLICATION_OCTET_STREAM.to_string());

    let stream = response
        .bytes_stream()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
    let reader = StreamReader::new(stream);
    let limited = LimitedReader::new(reader, limit);
    let body: storage::BoxAsyncRead = Box::pin(limited);

    let put_result = req
        .dest
        .put(req.dest_bucket, req.dest_key, body, PutObjectOptions::new(content_type))
        .await
        .map_err(|e| classify_put_error(e, req.max_input_size))?;
    timer.finish();
    Ok(put_result)
}

fn classify_put_error(e: anyhow::Error, limit: u64) -> anyhow::Error {
    let is_limit_exceeded = e
        .downcast_ref::<std::io::Error>()
        .and_then(|ioe| ioe.get_ref())
        .is_some_and(|inner| inner.is::<storage::LimitExceededError>());
    if is_limit_exceeded {
        anyhow::Error::new(ErrorMetadata::limit_exceeded(
            "ArchiveTooLarge",
            format!("source URL exceeded the {limit} byte limit while downloading"),
        ))
    } else {
        e.context(ErrorMetadata::slurp_error("failed to upload fetched bytes"))
    }
}

#[cfg(test)]
mod tests {
    use storage::InMemoryStorage;

    use super::*;

    fn client() -> reqwest::Client {
        reqwest::Client::new()
    }

    #[tokio::test]
    async fn unreachable_url_reports_slurp_error() {
        let dest = InMemoryStorage::new();
        let http_client = client();
        let err = slurp(SlurpRequest {
            http_client: &http_client,
            source_url: "http://127.0.0.1:1/unreachable",
            dest: &dest,
            dest_bucket: "bucket",
            dest_key: "key",
            max_input_size: 0,
        })
        .await
        .unwrap_err();
        assert_eq!(
            errors::ErrorMetadataAnyhowExt::error_metadata(&err).map(|e| e.code),
            Some(errors::ErrorCode::SlurpError)
        );
    }
}
