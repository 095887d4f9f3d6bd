use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::upstream::{Layer, Upstream};
use super::{AsyncStream, ExtendedRead, ExtendedWrite, Headroom, PacketConn, PacketRead, PacketWrite};
use crate::address::NetLocation;
use crate::buf::{Buffer, BufferPool};

/// A stream whose first bytes were already consumed, for example while detecting the protocol.
///
/// The cached bytes are served before the inner stream is read again. Until they are drained the
/// wrapper rewrites the byte sequence and so reports a transforming layer.
pub struct CachedStream<S> {
    inner: S,
    cache: Option<Buffer>,
}

impl<S> CachedStream<S> {
    pub fn new(inner: S, cache: Buffer) -> Self {
        Self {
            inner,
            cache: (!cache.is_empty()).then_some(cache),
        }
    }

    fn take_cached(&mut self, dst: &mut [u8]) -> usize {
        let Some(cache) = self.cache.as_mut() else {
            return 0;
        };
        let n = dst.len().min(cache.len());
        dst[..n].copy_from_slice(&cache.bytes()[..n]);
        cache.advance(n);
        if cache.is_empty() {
            self.cache = None;
        }
        n
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CachedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.cache.is_some() {
            let n = this.take_cached(buf.initialize_unfilled());
            buf.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CachedStream<S> {
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

impl<S: ExtendedRead + Unpin> ExtendedRead for CachedStream<S> {
    fn poll_read_buffer(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buffer: &mut Buffer,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.cache.is_some() {
            let n = this.take_cached(buffer.free_bytes_mut());
            buffer.truncate_extend(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read_buffer(cx, buffer)
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
        if let Some(cache) = this.cache.take() {
            if headroom.fits(&cache) {
                return Poll::Ready(Ok(Some(cache)));
            }
            let copied = cache.copy_with_headroom(pool, headroom.front, headroom.rear);
            return Poll::Ready(Ok(Some(copied)));
        }
        Pin::new(&mut this.inner).poll_read_wait(cx, pool, headroom)
    }
}

impl<S: ExtendedWrite + Unpin> ExtendedWrite for CachedStream<S> {
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

impl<S: Upstream> Upstream for CachedStream<S> {
    fn layer(&self) -> Layer {
        if self.cache.is_some() {
            Layer::Transforming
        } else {
            Layer::Passthrough
        }
    }

    fn upstream(&self) -> Option<&dyn Upstream> {
        Some(&self.inner)
    }
}

impl<S: AsyncStream> AsyncStream for CachedStream<S> {
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

/// A packet conn with packets that were read ahead and must be delivered first.
pub struct CachedPacketConn<P> {
    inner: P,
    cached: Vec<(Buffer, NetLocation)>,
}

impl<P> CachedPacketConn<P> {
    pub fn new(inner: P, cached: Vec<(Buffer, NetLocation)>) -> Self {
        Self { inner, cached }
    }
}

impl<P: PacketRead + Unpin> PacketRead for CachedPacketConn<P> {
    fn poll_read_packet(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buffer: &mut Buffer,
    ) -> Poll<std::io::Result<NetLocation>> {
        let this = self.get_mut();
        if !this.cached.is_empty() {
            let (cached, destination) = this.cached.remove(0);
            buffer.write_slice(cached.bytes());
            return Poll::Ready(Ok(destination));
        }
        Pin::new(&mut this.inner).poll_read_packet(cx, buffer)
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
        if !this.cached.is_empty() {
            let (cached, destination) = this.cached.remove(0);
            if headroom.fits(&cached) {
                return Poll::Ready(Ok((cached, destination)));
            }
            let copied = cached.copy_with_headroom(pool, headroom.front, headroom.rear);
            return Poll::Ready(Ok((copied, destination)));
        }
        Pin::new(&mut this.inner).poll_read_packet_wait(cx, pool, headroom)
    }

    fn take_cached_packets(&mut self) -> Vec<(Buffer, NetLocation)> {
        let mut cached = std::mem::take(&mut self.cached);
        cached.extend(self.inner.take_cached_packets());
        cached
    }
}

impl<P: PacketWrite + Unpin> PacketWrite for CachedPacketConn<P> {
    fn poll_write_packet(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buffer: &mut Buffer,
        destination: &NetLocation,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_write_packet(cx, buffer, destination)
    }

    fn packet_headroom(&self) -> Headroom {
        self.inner.packet_headroom()
    }
}

impl<P: Upstream> Upstream for CachedPacketConn<P> {
    fn layer(&self) -> Layer {
        Layer::Passthrough
    }

    fn upstream(&self) -> Option<&dyn Upstream> {
        Some(&self.inner)
    }
}

impl<P: PacketConn> PacketConn for CachedPacketConn<P> {
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
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_cached_bytes_come_first() {
        let (a, mut b) = tokio::io::duplex(64);
        let mut stream = CachedStream::new(a, Buffer::from_slice(b"GET "));
        assert_eq!(stream.layer(), Layer::Transforming);

        b.write_all(b"/ HTTP/1.1").await.unwrap();
        drop(b);
        let mut all = Vec::new();
        stream.read_to_end(&mut all).await.unwrap();
        assert_eq!(all, b"GET / HTTP/1.1");
        assert_eq!(stream.layer(), Layer::Passthrough);
    }
}
