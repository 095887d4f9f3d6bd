use std::io::IoSlice;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::ready;
use tokio::io::AsyncWrite;

/// Starts writing `header` followed by `payload`.
///
/// A writer that supports vectored writes gets both parts in one call; otherwise nothing is
/// written here. Returns the bytes the writer has not accepted yet, which the caller must write
/// before anything else.
pub fn poll_write_prefixed<W: AsyncWrite + ?Sized>(
    writer: Pin<&mut W>,
    cx: &mut Context<'_>,
    header: &[u8],
    payload: &[u8],
) -> Poll<std::io::Result<Vec<u8>>> {
    let total = header.len() + payload.len();
    let written = if writer.is_write_vectored() {
        let slices = [IoSlice::new(header), IoSlice::new(payload)];
        let n = ready!(writer.poll_write_vectored(cx, &slices))?;
        if n == 0 && total > 0 {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write zero byte into writer",
            )));
        }
        n
    } else {
        0
    };

    let mut rest = Vec::with_capacity(total - written);
    if written < header.len() {
        rest.extend_from_slice(&header[written..]);
        rest.extend_from_slice(payload);
    } else {
        rest.extend_from_slice(&payload[written - header.len()..]);
    }
    Poll::Ready(Ok(rest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Accepts at most `limit` bytes per call and counts vectored calls.
    struct Limited {
        written: Vec<u8>,
        limit: usize,
        vectored: bool,
        vectored_calls: Arc<AtomicUsize>,
    }

    impl AsyncWrite for Limited {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            let n = buf.len().min(self.limit);
            self.written.extend_from_slice(&buf[..n]);
            Poll::Ready(Ok(n))
        }

        fn poll_write_vectored(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            bufs: &[IoSlice<'_>],
        ) -> Poll<std::io::Result<usize>> {
            self.vectored_calls.fetch_add(1, Ordering::Relaxed);
            let mut budget = self.limit;
            let mut n = 0;
            for buf in bufs {
                let take = buf.len().min(budget);
                self.written.extend_from_slice(&buf[..take]);
                budget -= take;
                n += take;
            }
            Poll::Ready(Ok(n))
        }

        fn is_write_vectored(&self) -> bool {
            self.vectored
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn limited(limit: usize, vectored: bool) -> Limited {
        Limited {
            written: Vec::new(),
            limit,
            vectored,
            vectored_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[tokio::test]
    async fn test_vectored_writer_takes_both_parts() {
        let mut writer = limited(64, true);
        let rest = futures::future::poll_fn(|cx| {
            poll_write_prefixed(Pin::new(&mut writer), cx, b"head", b"body")
        })
        .await
        .unwrap();
        assert!(rest.is_empty());
        assert_eq!(writer.written, b"headbody");
        assert_eq!(writer.vectored_calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_partial_vectored_write_returns_remainder() {
        let mut writer = limited(6, true);
        let rest = futures::future::poll_fn(|cx| {
            poll_write_prefixed(Pin::new(&mut writer), cx, b"head", b"body")
        })
        .await
        .unwrap();
        assert_eq!(writer.written, b"headbo");
        assert_eq!(rest, b"dy");

        let mut writer = limited(2, true);
        let rest = futures::future::poll_fn(|cx| {
            poll_write_prefixed(Pin::new(&mut writer), cx, b"head", b"body")
        })
        .await
        .unwrap();
        assert_eq!(rest, b"adbody");
    }

    #[tokio::test]
    async fn test_plain_writer_gets_joined_parts() {
        let mut writer = limited(64, false);
        let rest = futures::future::poll_fn(|cx| {
            poll_write_prefixed(Pin::new(&mut writer), cx, b"head", b"body")
        })
        .await
        .unwrap();
        assert_eq!(rest, b"headbody");
        assert!(writer.written.is_empty());
        assert_eq!(writer.vectored_calls.load(Ordering::Relaxed), 0);
    }
}
