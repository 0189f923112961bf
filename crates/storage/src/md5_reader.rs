use std::{
    pin::Pin,
    sync::{
        Arc,
        Mutex,
    },
    task::{
        Context,
        Poll,
    },
};

use md5::Digest;
use tokio::io::{
    AsyncRead,
    ReadBuf,
};

/// Wraps an `AsyncRead`, feeding every byte that passes through into an MD5
/// digest as it streams. `digest_hex()` is only meaningful once the
/// underlying reader has been fully drained (reached EOF).
pub struct Md5Reader<R> {
    inner: R,
    hasher: md5::Md5,
    bytes_read: u64,
    digest_hex: Arc<Mutex<Option<String>>>,
}

impl<R: AsyncRead + Unpin> Md5Reader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: md5::Md5::new(),
            bytes_read: 0,
            digest_hex: Arc::new(Mutex::new(None)),
        }
    }

    /// A handle that can be read after the reader has been fully consumed.
    pub fn digest_handle(&self) -> Arc<Mutex<Option<String>>> {
        self.digest_hex.clone()
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for Md5Reader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let filled = &buf.filled()[before..];
                if filled.is_empty() {
                    // EOF: finalize the digest exactly once.
                    let mut slot = this.digest_hex.lock().expect("poisoned");
                    if slot.is_none() {
                        *slot = Some(hex::encode(this.hasher.clone().finalize()));
                    }
                } else {
                    this.hasher.update(filled);
                    this.bytes_read += filled.len() as u64;
                }
                Poll::Ready(Ok(()))
            },
            other => other,
        }
    }
}
