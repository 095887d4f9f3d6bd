//! Buffer-aware stream and packet abstractions and the copy engine built on them.

mod cached;
mod copy;
mod copy_packet;
mod counter;
mod deadline;
mod serial;
mod splice;
mod upstream;
mod vectorised;

pub use cached::{CachedPacketConn, CachedStream};
pub use copy::{copy, copy_conn};
pub use copy_packet::{copy_packet, copy_packet_conn};
pub use counter::{CountFn, CounterPacketConn, CounterStream};
pub use deadline::DeadlineStream;
pub use serial::{SerialPacketConn, SerialStream};
pub use upstream::{
    Layer, Upstream, calculate_front_headroom, collect_read_counters, collect_write_counters,
    find_capability, need_additional_read_deadline,
};
pub use vectorised::poll_write_prefixed;

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::ready;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::TcpStream;

use crate::address::NetLocation;
use crate::buf::{Buffer, BufferPool};

/// Space a writer needs around the data it is handed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Headroom {
    pub front: usize,
    pub rear: usize,
}

impl Headroom {
    pub const NONE: Headroom = Headroom { front: 0, rear: 0 };

    pub fn fits(&self, buffer: &Buffer) -> bool {
        buffer.front_headroom() >= self.front && buffer.free_len() >= self.rear
    }
}

fn unsupported(what: &str) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        format!("{what} is not supported"),
    )
}

pub trait ExtendedRead: AsyncRead {
    /// Reads into the free region of `buffer`. An unchanged buffer means EOF.
    fn poll_read_buffer(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buffer: &mut Buffer,
    ) -> Poll<std::io::Result<()>> {
        let mut read_buf = ReadBuf::new(buffer.free_bytes_mut());
        ready!(self.poll_read(cx, &mut read_buf))?;
        let n = read_buf.filled().len();
        buffer.truncate_extend(n);
        Poll::Ready(Ok(()))
    }

    /// Whether the reader can hand back buffers it already filled.
    fn supports_read_wait(&self) -> bool {
        false
    }

    /// Hands back a filled buffer with at least `headroom` around the data, or `None` at EOF.
    fn poll_read_wait(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _pool: &Arc<BufferPool>,
        _headroom: Headroom,
    ) -> Poll<std::io::Result<Option<Buffer>>> {
        Poll::Ready(Err(unsupported("read wait")))
    }
}

pub trait ExtendedWrite: AsyncWrite {
    fn front_headroom(&self) -> usize {
        0
    }

    fn rear_headroom(&self) -> usize {
        0
    }

    /// Writes the whole buffer, advancing it as bytes are accepted.
    fn poll_write_buffer(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buffer: &mut Buffer,
    ) -> Poll<std::io::Result<()>> {
        while !buffer.is_empty() {
            let n = ready!(self.as_mut().poll_write(cx, buffer.bytes()))?;
            if n == 0 {
                return Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "write zero byte into writer",
                )));
            }
            buffer.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

pub trait AsyncStream: ExtendedRead + ExtendedWrite + Upstream + Unpin + Send {
    /// Whether a request must be written before the first read can complete.
    fn need_handshake(&self) -> bool {
        false
    }

    fn supports_half_close(&self) -> bool {
        true
    }

    /// Tells the originating side that the outbound connection was established.
    fn poll_handshake_success(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    /// Tells the originating side that the outbound connection failed with `error`.
    fn poll_handshake_failure(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _error: &std::io::Error,
    ) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

pub async fn report_handshake_success<S: AsyncStream + ?Sized>(stream: &mut S) -> std::io::Result<()> {
    futures::future::poll_fn(|cx| Pin::new(&mut *stream).poll_handshake_success(cx)).await
}

pub async fn report_handshake_failure<S: AsyncStream + ?Sized>(
    stream: &mut S,
    error: &std::io::Error,
) -> std::io::Result<()> {
    futures::future::poll_fn(|cx| Pin::new(&mut *stream).poll_handshake_failure(cx, error)).await
}

pub trait PacketRead {
    /// Reads one packet into the free region of `buffer` and returns its address.
    fn poll_read_packet(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buffer: &mut Buffer,
    ) -> Poll<std::io::Result<NetLocation>>;

    fn supports_read_wait(&self) -> bool {
        false
    }

    fn poll_read_packet_wait(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _pool: &Arc<BufferPool>,
        _headroom: Headroom,
    ) -> Poll<std::io::Result<(Buffer, NetLocation)>> {
        Poll::Ready(Err(unsupported("packet read wait")))
    }

    /// Packets that were read ahead (for example while sniffing) and must be replayed first.
    fn take_cached_packets(&mut self) -> Vec<(Buffer, NetLocation)> {
        Vec::new()
    }
}

pub trait PacketWrite {
    /// Writes the data of `buffer` as one packet to `destination`.
    fn poll_write_packet(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buffer: &mut Buffer,
        destination: &NetLocation,
    ) -> Poll<std::io::Result<()>>;

    fn packet_headroom(&self) -> Headroom {
        Headroom::NONE
    }
}

pub trait PacketConn: PacketRead + PacketWrite + Upstream + Unpin + Send {
    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    /// Tells the originating side that the outbound flow could not be opened.
    fn poll_packet_handshake_failure(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _error: &std::io::Error,
    ) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Returned by packet readers once the flow is finished.
pub fn packet_conn_closed() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "packet connection closed")
}

pub fn is_closed_error(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
    )
}

pub async fn read_packet<P: PacketRead + Unpin + ?Sized>(
    conn: &mut P,
    buffer: &mut Buffer,
) -> std::io::Result<NetLocation> {
    futures::future::poll_fn(|cx| Pin::new(&mut *conn).poll_read_packet(cx, buffer)).await
}

pub async fn write_packet<P: PacketWrite + Unpin + ?Sized>(
    conn: &mut P,
    buffer: &mut Buffer,
    destination: &NetLocation,
) -> std::io::Result<()> {
    futures::future::poll_fn(|cx| Pin::new(&mut *conn).poll_write_packet(cx, buffer, destination))
        .await
}

pub async fn report_packet_handshake_failure<P: PacketConn + ?Sized>(
    conn: &mut P,
    error: &std::io::Error,
) -> std::io::Result<()> {
    futures::future::poll_fn(|cx| Pin::new(&mut *conn).poll_packet_handshake_failure(cx, error))
        .await
}

pub async fn close_packet_conn<P: PacketConn + ?Sized>(conn: &mut P) -> std::io::Result<()> {
    futures::future::poll_fn(|cx| Pin::new(&mut *conn).poll_close(cx)).await
}

pub async fn read_buffer<R: ExtendedRead + Unpin + ?Sized>(
    reader: &mut R,
    buffer: &mut Buffer,
) -> std::io::Result<()> {
    futures::future::poll_fn(|cx| Pin::new(&mut *reader).poll_read_buffer(cx, buffer)).await
}

pub async fn write_buffer<W: ExtendedWrite + Unpin + ?Sized>(
    writer: &mut W,
    buffer: &mut Buffer,
) -> std::io::Result<()> {
    futures::future::poll_fn(|cx| Pin::new(&mut *writer).poll_write_buffer(cx, buffer)).await
}

impl ExtendedRead for TcpStream {}
impl ExtendedWrite for TcpStream {}
impl AsyncStream for TcpStream {}

impl ExtendedRead for DuplexStream {}
impl ExtendedWrite for DuplexStream {}
impl AsyncStream for DuplexStream {}

#[cfg(unix)]
impl ExtendedRead for tokio::net::UnixStream {}
#[cfg(unix)]
impl ExtendedWrite for tokio::net::UnixStream {}
#[cfg(unix)]
impl AsyncStream for tokio::net::UnixStream {}

impl<T: ExtendedRead + Unpin + ?Sized> ExtendedRead for Box<T> {
    fn poll_read_buffer(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buffer: &mut Buffer,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut **self.get_mut()).poll_read_buffer(cx, buffer)
    }

    fn supports_read_wait(&self) -> bool {
        (**self).supports_read_wait()
    }

    fn poll_read_wait(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        pool: &Arc<BufferPool>,
        headroom: Headroom,
    ) -> Poll<std::io::Result<Option<Buffer>>> {
        Pin::new(&mut **self.get_mut()).poll_read_wait(cx, pool, headroom)
    }
}

impl<T: ExtendedWrite + Unpin + ?Sized> ExtendedWrite for Box<T> {
    fn front_headroom(&self) -> usize {
        (**self).front_headroom()
    }

    fn rear_headroom(&self) -> usize {
        (**self).rear_headroom()
    }

    fn poll_write_buffer(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buffer: &mut Buffer,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut **self.get_mut()).poll_write_buffer(cx, buffer)
    }
}

impl<T: AsyncStream + ?Sized> AsyncStream for Box<T> {
    fn need_handshake(&self) -> bool {
        (**self).need_handshake()
    }

    fn supports_half_close(&self) -> bool {
        (**self).supports_half_close()
    }

    fn poll_handshake_success(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut **self.get_mut()).poll_handshake_success(cx)
    }

    fn poll_handshake_failure(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        error: &std::io::Error,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut **self.get_mut()).poll_handshake_failure(cx, error)
    }
}

impl<T: PacketRead + Unpin + ?Sized> PacketRead for Box<T> {
    fn poll_read_packet(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buffer: &mut Buffer,
    ) -> Poll<std::io::Result<NetLocation>> {
        Pin::new(&mut **self.get_mut()).poll_read_packet(cx, buffer)
    }

    fn supports_read_wait(&self) -> bool {
        (**self).supports_read_wait()
    }

    fn poll_read_packet_wait(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        pool: &Arc<BufferPool>,
        headroom: Headroom,
    ) -> Poll<std::io::Result<(Buffer, NetLocation)>> {
        Pin::new(&mut **self.get_mut()).poll_read_packet_wait(cx, pool, headroom)
    }

    fn take_cached_packets(&mut self) -> Vec<(Buffer, NetLocation)> {
        (**self).take_cached_packets()
    }
}

impl<T: PacketWrite + Unpin + ?Sized> PacketWrite for Box<T> {
    fn poll_write_packet(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buffer: &mut Buffer,
        destination: &NetLocation,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut **self.get_mut()).poll_write_packet(cx, buffer, destination)
    }

    fn packet_headroom(&self) -> Headroom {
        (**self).packet_headroom()
    }
}

impl<T: PacketConn + ?Sized> PacketConn for Box<T> {
    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut **self.get_mut()).poll_close(cx)
    }

    fn poll_packet_handshake_failure(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        error: &std::io::Error,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut **self.get_mut()).poll_packet_handshake_failure(cx, error)
    }
}
