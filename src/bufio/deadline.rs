use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};

use super::upstream::{Layer, Upstream};
use super::{AsyncStream, ExtendedRead, ExtendedWrite, Headroom};
use crate::buf::{Buffer, BufferPool};

/// Adds a read deadline to streams that have no native timeout support.
pub struct DeadlineStream<S> {
    inner: S,
    read_deadline: Option<Pin<Box<Sleep>>>,
}

fn deadline_exceeded() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::TimedOut, "read deadline exceeded")
}

impl<S> DeadlineStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            read_deadline: None,
        }
    }

    /// Pending and future reads fail with `TimedOut` once `deadline` passes. `None` clears it.
    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        let Some(deadline) = deadline else {
            self.read_deadline = None;
            return;
        };
        if let Some(sleep) = self.read_deadline.as_mut() {
            sleep.as_mut().reset(deadline);
        } else {
            self.read_deadline = Some(Box::pin(tokio::time::sleep_until(deadline)));
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn poll_deadline(&mut self, cx: &mut Context<'_>) -> Poll<std::io::Error> {
        if let Some(sleep) = self.read_deadline.as_mut()
            && sleep.as_mut().poll(cx).is_ready()
        {
            return Poll::Ready(deadline_exceeded());
        }
        Poll::Pending
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for DeadlineStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if let Poll::Ready(result) = Pin::new(&mut this.inner).poll_read(cx, buf) {
            return Poll::Ready(result);
        }
        this.poll_deadline(cx).map(Err)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for DeadlineStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl<S: ExtendedRead + Unpin> ExtendedRead for DeadlineStream<S> {
    fn poll_read_buffer(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buffer: &mut Buffer,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if let Poll::Ready(result) = Pin::new(&mut this.inner).poll_read_buffer(cx, buffer) {
            return Poll::Ready(result);
        }
        this.poll_deadline(cx).map(Err)
    }

    fn supports_read_wait(&self) -> bool {
        self.inner.supports_read_wait()
    }

    fn poll_read_wait(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        pool: &Arc<BufferPool>,
        headroom: Headroom,
    ) -> Poll<std::io::Result<Option<Buffer>>> {
        let this = self.get_mut();
        if let Poll::Ready(result) = Pin::new(&mut this.inner).poll_read_wait(cx, pool, headroom) {
            return Poll::Ready(result);
        }
        this.poll_deadline(cx).map(Err)
    }
}

impl<S: ExtendedWrite + Unpin> ExtendedWrite for DeadlineStream<S> {
    fn front_headroom(&self) -> usize {
        self.inner.front_headroom()
    }

    fn rear_headroom(&self) -> usize {
        self.inner.rear_headroom()
    }

    fn poll_write_buffer(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buffer: &mut Buffer,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_write_buffer(cx, buffer)
    }
}

impl<S: Upstream> Upstream for DeadlineStream<S> {
    fn layer(&self) -> Layer {
        Layer::Passthrough
    }

    fn upstream(&self) -> Option<&dyn Upstream> {
        Some(&self.inner)
    }
}

impl<S: AsyncStream> AsyncStream for DeadlineStream<S> {
    fn need_handshake(&self) -> bool {
        self.inner.need_handshake()
    }

    fn supports_half_close(&self) -> bool {
        self.inner.supports_half_close()
    }

    fn poll_handshake_success(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_handshake_success(cx)
    }

    fn poll_handshake_failure(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        error: &std::io::Error,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_handshake_failure(cx, error)
    }
}
