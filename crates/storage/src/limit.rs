use std::{
    fmt,
    pin::Pin,
    task::{
        Context,
        Poll,
    },
};

use tokio::io::{
    AsyncRead,
    ReadBuf,
};

/// Marker error surfaced via `io::Error::downcast_ref` when a
/// [`LimitedReader`] observes more bytes than its ceiling allows. Callers map
/// this to `ErrorMetadata`'s `LimitExceeded` kind.
#[derive(Debug)]
pub struct LimitExceededError {
    pub limit: u64,
}

impl fmt::Display for LimitExceededError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream exceeded its declared limit of {} bytes", self.limit)
    }
}

impl std::error::Error for LimitExceededError {}

/// Wraps an `AsyncRead`, failing as soon as more than `limit` bytes have
/// passed through it. A zero limit means unbounded: every entry in the
/// extraction core that declares "zero means unbounded" routes through this
/// by passing `u64::MAX` instead of `0` at construction.
pub struct LimitedReader<R> {
    inner: R,
    limit: u64,
    seen: u64,
}

impl<R: AsyncRead + Unpin> LimitedReader<R> {
    pub fn new(inner: R, limit: u64) -> Self {
        Self {
            inner,
            limit,
            seen: 0,
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.seen
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for LimitedReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let read = (buf.filled().len() - before) as u64;
                this.seen += read;
                if this.seen > this.limit {
                    return Poll::Ready(Err(std::io::Error::other(LimitExceededError {
                        limit: this.limit,
                    })));
                }
                Poll::Ready(Ok(()))
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn reads_within_limit_succeed() {
        let mut reader = LimitedReader::new(std::io::Cursor::new(b"hello".to_vec()), 10);
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.expect("within limit");
        assert_eq!(buf, b"hello");
    }

    #[tokio::test]
    async fn reads_beyond_limit_fail() {
        let mut reader = LimitedReader::new(std::io::Cursor::new(b"hello world".to_vec()), 5);
        let mut buf = Vec::new();
        let err = reader.read_to_end(&mut buf).await.unwrap_err();
        assert!(err.get_ref().unwrap().is::<LimitExceededError>());
    }
}
