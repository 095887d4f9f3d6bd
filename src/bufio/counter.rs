use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::ready;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pub use super::upstream::CountFn;
use super::upstream::{Layer, Upstream};
use super::{AsyncStream, ExtendedRead, ExtendedWrite, Headroom, PacketConn, PacketRead, PacketWrite};
use crate::address::NetLocation;
use crate::buf::{Buffer, BufferPool};

/// Reports bytes read from and written to the wrapped stream.
///
/// The wrapper is passthrough, so splice-capable sockets beneath it stay reachable; the copy
/// engine then calls the collected counters itself.
pub struct CounterStream<S> {
    inner: S,
    read_counter: Option<CountFn>,
    write_counter: Option<CountFn>,
}

impl<S> CounterStream<S> {
    pub fn new(inner: S, read_counter: Option<CountFn>, write_counter: Option<CountFn>) -> Self {
        Self {
            inner,
            read_counter,
            write_counter,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    fn count_read(&self, n: usize) {
        if n > 0
            && let Some(counter) = &self.read_counter
        {
            counter(n as u64);
        }
    }

    fn count_write(&self, n: usize) {
        if n > 0
            && let Some(counter) = &self.write_counter
        {
            counter(n as u64);
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CounterStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        this.count_read(buf.filled().len() - before);
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CounterStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let n = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;
        this.count_write(n);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl<S: ExtendedRead + Unpin> ExtendedRead for CounterStream<S> {
    fn poll_read_buffer(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buffer: &mut Buffer,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buffer.len();
        ready!(Pin::new(&mut this.inner).poll_read_buffer(cx, buffer))?;
        this.count_read(buffer.len().saturating_sub(before));
        Poll::Ready(Ok(()))
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
        let buffer = ready!(Pin::new(&mut this.inner).poll_read_wait(cx, pool, headroom))?;
        if let Some(buffer) = &buffer {
            this.count_read(buffer.len());
        }
        Poll::Ready(Ok(buffer))
    }
}

impl<S: ExtendedWrite + Unpin> ExtendedWrite for CounterStream<S> {
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
        let this = self.get_mut();
        let before = buffer.len();
        let result = Pin::new(&mut this.inner).poll_write_buffer(cx, buffer);
        // Count what the inner writer consumed, including progress made before a Pending.
        this.count_write(before.saturating_sub(buffer.len()));
        result
    }
}

impl<S: Upstream> Upstream for CounterStream<S> {
    fn layer(&self) -> Layer {
        Layer::Passthrough
    }

    fn upstream(&self) -> Option<&dyn Upstream> {
        Some(&self.inner)
    }

    fn read_counter(&self) -> Option<&CountFn> {
        self.read_counter.as_ref()
    }

    fn write_counter(&self) -> Option<&CountFn> {
        self.write_counter.as_ref()
    }
}

impl<S: AsyncStream + 'static> AsyncStream for CounterStream<S> {
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

/// Packet counterpart of [`CounterStream`].
pub struct CounterPacketConn<P> {
    inner: P,
    read_counter: Option<CountFn>,
    write_counter: Option<CountFn>,
}

impl<P> CounterPacketConn<P> {
    pub fn new(inner: P, read_counter: Option<CountFn>, write_counter: Option<CountFn>) -> Self {
        Self {
            inner,
            read_counter,
            write_counter,
        }
    }
}

impl<P: PacketRead + Unpin> PacketRead for CounterPacketConn<P> {
    fn poll_read_packet(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buffer: &mut Buffer,
    ) -> Poll<std::io::Result<NetLocation>> {
        let this = self.get_mut();
        let before = buffer.len();
        let location = ready!(Pin::new(&mut this.inner).poll_read_packet(cx, buffer))?;
        if let Some(counter) = &this.read_counter {
            counter(buffer.len().saturating_sub(before) as u64);
        }
        Poll::Ready(Ok(location))
    }

    fn supports_read_wait(&self) -> bool {
        self.inner.supports_read_wait()
    }

    fn poll_read_packet_wait(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        pool: &Arc<BufferPool>,
        headroom: Headroom,
    ) -> Poll<std::io::Result<(Buffer, NetLocation)>> {
        let this = self.get_mut();
        let (buffer, location) =
            ready!(Pin::new(&mut this.inner).poll_read_packet_wait(cx, pool, headroom))?;
        if let Some(counter) = &this.read_counter {
            counter(buffer.len() as u64);
        }
        Poll::Ready(Ok((buffer, location)))
    }

    fn take_cached_packets(&mut self) -> Vec<(Buffer, NetLocation)> {
        self.inner.take_cached_packets()
    }
}

impl<P: PacketWrite + Unpin> PacketWrite for CounterPacketConn<P> {
    fn poll_write_packet(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buffer: &mut Buffer,
        destination: &NetLocation,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let len = buffer.len();
        ready!(Pin::new(&mut this.inner).poll_write_packet(cx, buffer, destination))?;
        if let Some(counter) = &this.write_counter {
            counter(len as u64);
        }
        Poll::Ready(Ok(()))
    }

    fn packet_headroom(&self) -> Headroom {
        self.inner.packet_headroom()
    }
}

impl<P: Upstream> Upstream for CounterPacketConn<P> {
    fn layer(&self) -> Layer {
        Layer::Passthrough
    }

    fn upstream(&self) -> Option<&dyn Upstream> {
        Some(&self.inner)
    }

    fn read_counter(&self) -> Option<&CountFn> {
        self.read_counter.as_ref()
    }

    fn write_counter(&self) -> Option<&CountFn> {
        self.write_counter.as_ref()
    }
}

impl<P: PacketConn + 'static> PacketConn for CounterPacketConn<P> {
    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_close(cx)
    }
    fn poll_packet_handshake_failure(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        error: &std::io::Error,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_packet_handshake_failure(cx, error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn counter(total: &Arc<AtomicU64>) -> CountFn {
        let total = total.clone();
        Arc::new(move |n| {
            total.fetch_add(n, Ordering::Relaxed);
        })
    }

    #[tokio::test]
    async fn test_counts_both_directions() {
        let (a, mut b) = tokio::io::duplex(1024);
        let read = Arc::new(AtomicU64::new(0));
        let written = Arc::new(AtomicU64::new(0));
        let mut stream = CounterStream::new(a, Some(counter(&read)), Some(counter(&written)));

        stream.write_all(b"hello").await.unwrap();
        b.write_all(b"world!").await.unwrap();
        let mut buf = [0u8; 6];
        stream.read_exact(&mut buf).await.unwrap();

        let mut buffer = Buffer::from_slice(b"abc");
        super::super::write_buffer(&mut stream, &mut buffer).await.unwrap();

        assert_eq!(read.load(Ordering::Relaxed), 6);
        assert_eq!(written.load(Ordering::Relaxed), 8);
        assert_eq!(super::super::collect_read_counters(&stream).len(), 1);
    }
}
