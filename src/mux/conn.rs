//! Per-stream wrappers that carry the stream request/response handshake and UDP framing.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use bytes::{Buf, BufMut, BytesMut};
use futures::ready;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::protocol::{
    STATUS_SUCCESS, StreamRequest, encode_response, parse_response, remote_error,
};
use super::session::MuxStream;
use crate::address::{NetLocation, parse_socks_addr, write_socks_addr};
use crate::buf::Buffer;
use crate::bufio::{
    AsyncStream, ExtendedRead, ExtendedWrite, PacketConn, PacketRead, PacketWrite, Upstream,
    calculate_front_headroom, packet_conn_closed, poll_write_prefixed,
};

const READ_CHUNK: usize = 4096;

/// A mux stream plus a queue of already-encoded bytes that must reach it before anything else.
struct Framed {
    inner: MuxStream,
    read_buf: BytesMut,
    pending: Vec<u8>,
    pending_pos: usize,
}

impl Framed {
    fn new(inner: MuxStream) -> Self {
        Self {
            inner,
            read_buf: BytesMut::new(),
            pending: Vec::new(),
            pending_pos: 0,
        }
    }

    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        while self.pending_pos < self.pending.len() {
            let n = ready!(
                Pin::new(&mut self.inner).poll_write(cx, &self.pending[self.pending_pos..])
            )?;
            if n == 0 {
                return Poll::Ready(Err(std::io::ErrorKind::WriteZero.into()));
            }
            self.pending_pos += n;
        }
        self.pending.clear();
        self.pending_pos = 0;
        Poll::Ready(Ok(()))
    }

    /// Queues `data` and starts writing it. A write that cannot finish now completes on the
    /// next drain.
    fn start_write(&mut self, cx: &mut Context<'_>) -> std::io::Result<()> {
        match self.poll_drain(cx) {
            Poll::Ready(Err(e)) => Err(e),
            _ => Ok(()),
        }
    }

    /// Reads more bytes into `read_buf`, returning how many arrived. Zero means EOF.
    fn poll_fill(&mut self, cx: &mut Context<'_>) -> Poll<std::io::Result<usize>> {
        let mut chunk = [0u8; READ_CHUNK];
        let mut read_buf = ReadBuf::new(&mut chunk);
        ready!(Pin::new(&mut self.inner).poll_read(cx, &mut read_buf))?;
        let n = read_buf.filled().len();
        self.read_buf.extend_from_slice(read_buf.filled());
        Poll::Ready(Ok(n))
    }

    /// Reads until a complete stream response is buffered, failing on an error status.
    fn poll_response(&mut self, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        loop {
            match parse_response(&self.read_buf)? {
                Some((None, used)) => {
                    self.read_buf.advance(used);
                    return Poll::Ready(Ok(()));
                }
                Some((Some(message), _)) => return Poll::Ready(Err(remote_error(&message))),
                None => {
                    if ready!(self.poll_fill(cx))? == 0 {
                        return Poll::Ready(Err(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "stream closed before response",
                        )));
                    }
                }
            }
        }
    }
}

/// Client side of a TCP stream: the request goes out with the first write, and the first read
/// waits for the server's response.
pub struct ClientStream {
    framed: Framed,
    request: Option<Vec<u8>>,
    response_read: bool,
}

impl ClientStream {
    pub fn new(inner: MuxStream, request: &StreamRequest) -> Self {
        let mut encoded = Vec::with_capacity(request.encoded_len());
        request.write_to(&mut encoded);
        Self {
            framed: Framed::new(inner),
            request: Some(encoded),
            response_read: false,
        }
    }
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if !this.response_read {
            if let Some(request) = this.request.take() {
                this.framed.pending = request;
                this.framed.pending_pos = 0;
            }
            ready!(this.framed.poll_drain(cx))?;
            ready!(Pin::new(&mut this.framed.inner).poll_flush(cx))?;
            ready!(this.framed.poll_response(cx))?;
            this.response_read = true;
        }
        if !this.framed.read_buf.is_empty() {
            let n = this.framed.read_buf.len().min(buf.remaining());
            buf.put_slice(&this.framed.read_buf[..n]);
            this.framed.read_buf.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.framed.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.framed.poll_drain(cx))?;
        if let Some(request) = this.request.as_deref() {
            let rest = ready!(poll_write_prefixed(
                Pin::new(&mut this.framed.inner),
                cx,
                request,
                buf
            ))?;
            this.request = None;
            this.framed.pending = rest;
            this.framed.pending_pos = 0;
            this.framed.start_write(cx)?;
            return Poll::Ready(Ok(buf.len()));
        }
        Pin::new(&mut this.framed.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        ready!(this.framed.poll_drain(cx))?;
        Pin::new(&mut this.framed.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if let Some(request) = this.request.take() {
            this.framed.pending = request;
            this.framed.pending_pos = 0;
        }
        ready!(this.framed.poll_drain(cx))?;
        Pin::new(&mut this.framed.inner).poll_shutdown(cx)
    }
}

impl ExtendedRead for ClientStream {}
impl ExtendedWrite for ClientStream {}

impl Upstream for ClientStream {
    fn upstream(&self) -> Option<&dyn Upstream> {
        Some(&self.framed.inner)
    }
}

impl AsyncStream for ClientStream {
    fn need_handshake(&self) -> bool {
        self.request.is_some()
    }
}

/// Server side of a TCP stream: the success status goes out with the first write or on
/// handshake success; a failed dial writes the error status instead.
pub struct ServerStream {
    framed: Framed,
    response_written: bool,
}

impl ServerStream {
    pub fn new(inner: MuxStream) -> Self {
        Self {
            framed: Framed::new(inner),
            response_written: false,
        }
    }

    fn poll_write_response(
        &mut self,
        cx: &mut Context<'_>,
        response: impl FnOnce() -> Vec<u8>,
    ) -> Poll<std::io::Result<()>> {
        if !self.response_written {
            self.response_written = true;
            self.framed.pending = response();
            self.framed.pending_pos = 0;
        }
        ready!(self.framed.poll_drain(cx))?;
        Pin::new(&mut self.framed.inner).poll_flush(cx)
    }
}

impl AsyncRead for ServerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().framed.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for ServerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.framed.poll_drain(cx))?;
        if !this.response_written {
            let rest = ready!(poll_write_prefixed(
                Pin::new(&mut this.framed.inner),
                cx,
                &[STATUS_SUCCESS],
                buf
            ))?;
            this.response_written = true;
            this.framed.pending = rest;
            this.framed.pending_pos = 0;
            this.framed.start_write(cx)?;
            return Poll::Ready(Ok(buf.len()));
        }
        Pin::new(&mut this.framed.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        ready!(this.framed.poll_drain(cx))?;
        Pin::new(&mut this.framed.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        ready!(this.framed.poll_drain(cx))?;
        Pin::new(&mut this.framed.inner).poll_shutdown(cx)
    }
}

impl ExtendedRead for ServerStream {}

impl ExtendedWrite for ServerStream {
    fn front_headroom(&self) -> usize {
        calculate_front_headroom(self)
    }

    /// Writes the success status into the buffer's headroom when there is room for it.
    fn poll_write_buffer(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buffer: &mut Buffer,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        ready!(this.framed.poll_drain(cx))?;
        if !this.response_written && buffer.front_headroom() >= 1 {
            buffer.extend_header(1)[0] = STATUS_SUCCESS;
            this.response_written = true;
        }
        if this.response_written {
            return Pin::new(&mut this.framed.inner).poll_write_buffer(cx, buffer);
        }
        while !buffer.is_empty() {
            let n = ready!(Pin::new(&mut *this).poll_write(cx, buffer.bytes()))?;
            if n == 0 {
                return Poll::Ready(Err(std::io::ErrorKind::WriteZero.into()));
            }
            buffer.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl Upstream for ServerStream {
    fn upstream(&self) -> Option<&dyn Upstream> {
        Some(&self.framed.inner)
    }

    fn own_front_headroom(&self) -> usize {
        if self.response_written { 0 } else { 1 }
    }
}

impl AsyncStream for ServerStream {
    fn poll_handshake_success(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.get_mut()
            .poll_write_response(cx, || vec![STATUS_SUCCESS])
    }

    fn poll_handshake_failure(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        error: &std::io::Error,
    ) -> Poll<std::io::Result<()>> {
        self.get_mut()
            .poll_write_response(cx, || encode_response(Some(&error.to_string())))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PacketMode {
    /// Every packet goes to and comes from one destination.
    Fixed(NetLocation),
    /// Every packet carries its own address.
    Addr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Client,
    Server,
}

/// UDP over a mux stream. Frames are `u16 BE length | payload`, prefixed with an address in
/// packet-addr mode. Writes after close are dropped.
pub struct MuxPacketConn {
    framed: Framed,
    mode: PacketMode,
    role: Role,
    request: Option<Vec<u8>>,
    response_read: bool,
    status_written: bool,
    closed: AtomicBool,
}

impl MuxPacketConn {
    fn new(inner: MuxStream, mode: PacketMode, role: Role, request: Option<&StreamRequest>) -> Self {
        let request = request.map(|request| {
            let mut encoded = Vec::with_capacity(request.encoded_len());
            request.write_to(&mut encoded);
            encoded
        });
        Self {
            framed: Framed::new(inner),
            mode,
            role,
            request,
            response_read: role == Role::Server,
            status_written: role == Role::Client,
            closed: AtomicBool::new(false),
        }
    }

    /// Client conn bound to `destination`.
    pub fn client(inner: MuxStream, destination: NetLocation) -> Self {
        let request = StreamRequest::udp(destination.clone());
        Self::new(inner, PacketMode::Fixed(destination), Role::Client, Some(&request))
    }

    /// Client conn whose packets carry their own addresses.
    pub fn client_addr(inner: MuxStream) -> Self {
        Self::new(
            inner,
            PacketMode::Addr,
            Role::Client,
            Some(&StreamRequest::udp_addr()),
        )
    }

    /// Server conn for a stream whose request has already been read.
    pub fn server(inner: MuxStream, request: &StreamRequest) -> Self {
        let mode = if request.packet_addr {
            PacketMode::Addr
        } else {
            PacketMode::Fixed(request.destination.clone())
        };
        Self::new(inner, mode, Role::Server, None)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn parse_frame(&self) -> std::io::Result<Option<(NetLocation, usize, usize)>> {
        let data = &self.framed.read_buf[..];
        let (destination, offset) = match &self.mode {
            PacketMode::Fixed(destination) => (destination.clone(), 0),
            PacketMode::Addr => match parse_socks_addr(data)? {
                Some(parsed) => parsed,
                None => return Ok(None),
            },
        };
        if data.len() < offset + 2 {
            return Ok(None);
        }
        let len = u16::from_be_bytes([data[offset], data[offset + 1]]) as usize;
        let start = offset + 2;
        if data.len() < start + len {
            return Ok(None);
        }
        Ok(Some((destination, start, len)))
    }
}

impl PacketRead for MuxPacketConn {
    fn poll_read_packet(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buffer: &mut Buffer,
    ) -> Poll<std::io::Result<NetLocation>> {
        let this = self.get_mut();
        if !this.response_read {
            if let Some(request) = this.request.take() {
                this.framed.pending = request;
                this.framed.pending_pos = 0;
            }
            ready!(this.framed.poll_drain(cx))?;
            ready!(Pin::new(&mut this.framed.inner).poll_flush(cx))?;
            ready!(this.framed.poll_response(cx))?;
            this.response_read = true;
        }
        loop {
            if let Some((destination, start, len)) = this.parse_frame()? {
                if len > buffer.free_len() {
                    log::debug!("[Mux] truncating {len} byte packet to {}", buffer.free_len());
                }
                buffer.write_slice(&this.framed.read_buf[start..start + len]);
                this.framed.read_buf.advance(start + len);
                return Poll::Ready(Ok(destination));
            }
            if ready!(this.framed.poll_fill(cx))? == 0 {
                return Poll::Ready(Err(packet_conn_closed()));
            }
        }
    }
}

impl PacketWrite for MuxPacketConn {
    fn poll_write_packet(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buffer: &mut Buffer,
        destination: &NetLocation,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.is_closed() {
            return Poll::Ready(Ok(()));
        }
        ready!(this.framed.poll_drain(cx))?;
        if buffer.len() > u16::MAX as usize {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("packet too large: {}", buffer.len()),
            )));
        }
        let mut frame = this.request.take().unwrap_or_default();
        if !this.status_written {
            this.status_written = true;
            frame.push(STATUS_SUCCESS);
        }
        if this.mode == PacketMode::Addr {
            write_socks_addr(destination, &mut frame);
        }
        frame.put_u16(buffer.len() as u16);
        frame.extend_from_slice(buffer.bytes());
        this.framed.pending = frame;
        this.framed.pending_pos = 0;
        this.framed.start_write(cx)?;
        Poll::Ready(Ok(()))
    }
}

impl Upstream for MuxPacketConn {
    fn upstream(&self) -> Option<&dyn Upstream> {
        Some(&self.framed.inner)
    }
}

impl PacketConn for MuxPacketConn {
    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        this.closed.store(true, Ordering::Release);
        ready!(this.framed.poll_drain(cx))?;
        Pin::new(&mut this.framed.inner).poll_shutdown(cx)
    }

    /// Answers the stream request with an error status. Only a server conn that has not sent
    /// its status yet writes anything.
    fn poll_packet_handshake_failure(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        error: &std::io::Error,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if !this.status_written {
            this.status_written = true;
            this.closed.store(true, Ordering::Release);
            this.framed.pending = encode_response(Some(&error.to_string()));
            this.framed.pending_pos = 0;
        }
        ready!(this.framed.poll_drain(cx))?;
        Pin::new(&mut this.framed.inner).poll_flush(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::bufio::{
        close_packet_conn, read_packet, report_handshake_failure, report_packet_handshake_failure,
        write_packet,
    };
    use crate::metadata::Network;
    use crate::mux::protocol::{read_response, read_stream_request};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn boxed(stream: tokio::io::DuplexStream) -> MuxStream {
        Box::new(stream)
    }

    fn target() -> NetLocation {
        NetLocation::from_str("example.com:443", None).unwrap()
    }

    #[tokio::test]
    async fn test_first_write_carries_request_and_payload() {
        let (a, mut b) = tokio::io::duplex(4096);
        let mut client = ClientStream::new(boxed(a), &StreamRequest::tcp(target()));
        assert!(client.need_handshake());
        client.write_all(b"GET /").await.unwrap();
        client.flush().await.unwrap();
        assert!(!client.need_handshake());

        let request = read_stream_request(&mut b).await.unwrap();
        assert_eq!(request.destination, target());
        let mut payload = [0u8; 5];
        b.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"GET /");
    }

    #[tokio::test]
    async fn test_read_before_write_sends_request_then_waits() {
        let (a, mut b) = tokio::io::duplex(4096);
        let mut client = ClientStream::new(boxed(a), &StreamRequest::tcp(target()));
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 5];
            client.read_exact(&mut buf).await.map(|_| buf)
        });
        let request = read_stream_request(&mut b).await.unwrap();
        assert_eq!(request.network, Network::Tcp);
        b.write_all(&[STATUS_SUCCESS]).await.unwrap();
        b.write_all(b"hello").await.unwrap();
        assert_eq!(&reader.await.unwrap().unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_error_response_surfaces_remote_error() {
        let (a, mut b) = tokio::io::duplex(4096);
        let mut client = ClientStream::new(boxed(a), &StreamRequest::tcp(target()));
        client.write_all(b"x").await.unwrap();
        client.flush().await.unwrap();
        b.write_all(&encode_response(Some("dial failed: refused")))
            .await
            .unwrap();
        let mut buf = [0u8; 1];
        let err = client.read(&mut buf).await.unwrap_err();
        assert_eq!(err.to_string(), "remote error: dial failed: refused");
    }

    #[tokio::test]
    async fn test_server_stream_status_prefix() {
        let (a, mut b) = tokio::io::duplex(4096);
        let mut server = ServerStream::new(boxed(a));
        assert_eq!(server.front_headroom(), 1);
        server.write_all(b"data").await.unwrap();
        server.flush().await.unwrap();
        assert_eq!(server.front_headroom(), 0);
        read_response(&mut b).await.unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"data");
    }

    #[tokio::test]
    async fn test_server_stream_handshake_failure() {
        let (a, mut b) = tokio::io::duplex(4096);
        let mut server = ServerStream::new(boxed(a));
        let error = std::io::Error::other("connection refused");
        report_handshake_failure(&mut server, &error).await.unwrap();
        let err = read_response(&mut b).await.unwrap_err();
        assert_eq!(err.to_string(), "remote error: connection refused");
    }

    #[tokio::test]
    async fn test_server_stream_status_in_headroom() {
        let (a, mut b) = tokio::io::duplex(4096);
        let mut server = ServerStream::new(boxed(a));
        let pool = crate::buf::BufferPool::new();
        let mut buffer = pool.buffer_with_headroom(server.front_headroom(), 4, 0);
        buffer.write_slice(b"data");
        crate::bufio::write_buffer(&mut server, &mut buffer).await.unwrap();
        server.flush().await.unwrap();
        assert_eq!(server.front_headroom(), 0);

        let mut out = [0u8; 5];
        b.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"\x00data");
    }

    #[tokio::test]
    async fn test_server_packet_conn_failure_reaches_client() {
        let (a, b) = tokio::io::duplex(1 << 16);
        let mut client = MuxPacketConn::client_addr(boxed(a));
        let dns = NetLocation::new(Address::from("8.8.8.8").unwrap(), 53);
        let mut packet = Buffer::from_slice(b"query");
        write_packet(&mut client, &mut packet, &dns).await.unwrap();

        let mut b = b;
        let request = read_stream_request(&mut b).await.unwrap();
        let mut server = MuxPacketConn::server(boxed(b), &request);
        let error = std::io::Error::other("network unreachable");
        report_packet_handshake_failure(&mut server, &error)
            .await
            .unwrap();
        assert!(server.is_closed());

        let mut buffer = Buffer::new(2048);
        let err = read_packet(&mut client, &mut buffer).await.unwrap_err();
        assert_eq!(err.to_string(), "remote error: network unreachable");
    }

    #[tokio::test]
    async fn test_packet_addr_round_trip() {
        let (a, b) = tokio::io::duplex(1 << 16);
        let mut client = MuxPacketConn::client_addr(boxed(a));
        let dns = NetLocation::new(Address::from("8.8.8.8").unwrap(), 53);

        let mut packet = Buffer::from_slice(b"query");
        write_packet(&mut client, &mut packet, &dns).await.unwrap();

        let mut b = b;
        let request = read_stream_request(&mut b).await.unwrap();
        assert!(request.packet_addr);
        let mut server = MuxPacketConn::server(boxed(b), &request);
        let mut buffer = Buffer::new(2048);
        let destination = read_packet(&mut server, &mut buffer).await.unwrap();
        assert_eq!(destination, dns);
        assert_eq!(buffer.bytes(), b"query");

        let mut reply = Buffer::from_slice(b"answer");
        write_packet(&mut server, &mut reply, &dns).await.unwrap();
        let mut buffer = Buffer::new(2048);
        let source = read_packet(&mut client, &mut buffer).await.unwrap();
        assert_eq!(source, dns);
        assert_eq!(buffer.bytes(), b"answer");

        close_packet_conn(&mut server).await.unwrap();
        let mut dropped = Buffer::from_slice(b"late");
        write_packet(&mut server, &mut dropped, &dns).await.unwrap();
        assert!(server.is_closed());
    }

    #[tokio::test]
    async fn test_fixed_packet_frames() {
        let (a, mut b) = tokio::io::duplex(1 << 16);
        let mut client = MuxPacketConn::client(boxed(a), target());
        let mut first = Buffer::from_slice(b"one");
        let mut second = Buffer::from_slice(b"two");
        write_packet(&mut client, &mut first, &target()).await.unwrap();
        write_packet(&mut client, &mut second, &target()).await.unwrap();

        let request = read_stream_request(&mut b).await.unwrap();
        assert_eq!(request.network, Network::Udp);
        assert!(!request.packet_addr);
        let mut frames = [0u8; 10];
        b.read_exact(&mut frames).await.unwrap();
        assert_eq!(&frames, b"\x00\x03one\x00\x03two");
    }
}
