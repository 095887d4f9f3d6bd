use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::ready;
use log::debug;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::{AdapterType, Dialer, ProxyAdapter, SystemDialer};
use crate::address::{Address, NetLocation};
use crate::buf::Buffer;
use crate::bufio::{
    AsyncStream, CachedStream, Headroom, PacketConn, PacketRead, PacketWrite, Upstream,
    packet_conn_closed,
};
use crate::metadata::Metadata;
use crate::socks_handler::{
    CMD_CONNECT, CMD_UDP_ASSOCIATE, client_handshake, encode_udp_header, parse_udp_header,
};
use crate::stream_reader::StreamReader;

// reserved, fragment, then the longest socks address
const MAX_UDP_HEADER_LEN: usize = 3 + 1 + 1 + 255 + 2;

#[derive(Debug)]
pub struct Socks5 {
    name: String,
    server: NetLocation,
    auth: Option<(String, String)>,
    udp: bool,
    dialer: Arc<dyn Dialer>,
}

impl Socks5 {
    pub fn new(
        name: &str,
        server: NetLocation,
        auth: Option<(String, String)>,
        udp: bool,
        dialer: SystemDialer,
    ) -> Self {
        Self {
            name: name.to_string(),
            server,
            auth,
            udp,
            dialer: Arc::new(dialer),
        }
    }

    async fn handshake(
        &self,
        dialer: &dyn Dialer,
        command: u8,
        location: &NetLocation,
    ) -> std::io::Result<(Box<dyn AsyncStream>, StreamReader, NetLocation)> {
        let mut stream = dialer.dial_stream(&self.server).await?;
        let mut reader = StreamReader::with_capacity(1024);
        let bound =
            client_handshake(&mut stream, &mut reader, self.auth.as_ref(), command, location)
                .await?;
        Ok((stream, reader, bound))
    }
}

#[async_trait]
impl ProxyAdapter for Socks5 {
    fn name(&self) -> &str {
        &self.name
    }

    fn adapter_type(&self) -> AdapterType {
        AdapterType::Socks5
    }

    fn addr(&self) -> String {
        self.server.to_string()
    }

    fn support_udp(&self) -> bool {
        self.udp
    }

    fn support_with_dialer(&self) -> bool {
        true
    }

    async fn dial_context(&self, metadata: &Metadata) -> std::io::Result<Box<dyn AsyncStream>> {
        self.dial_with_dialer(self.dialer.clone(), metadata).await
    }

    async fn listen_packet_context(
        &self,
        metadata: &Metadata,
    ) -> std::io::Result<Box<dyn PacketConn>> {
        self.listen_packet_with_dialer(self.dialer.clone(), metadata)
            .await
    }

    async fn dial_with_dialer(
        &self,
        dialer: Arc<dyn Dialer>,
        metadata: &Metadata,
    ) -> std::io::Result<Box<dyn AsyncStream>> {
        let (stream, reader, _) = self
            .handshake(dialer.as_ref(), CMD_CONNECT, &metadata.target())
            .await?;
        Ok(match reader.into_cache() {
            Some(cache) => Box::new(CachedStream::new(stream, cache)),
            None => stream,
        })
    }

    async fn listen_packet_with_dialer(
        &self,
        dialer: Arc<dyn Dialer>,
        _metadata: &Metadata,
    ) -> std::io::Result<Box<dyn PacketConn>> {
        if !self.udp {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                format!("{} has UDP disabled", self.name),
            ));
        }
        let (control, _, bound) = self
            .handshake(dialer.as_ref(), CMD_UDP_ASSOCIATE, &NetLocation::UNSPECIFIED)
            .await?;
        // Servers often answer with the unspecified address, meaning "the address you dialed".
        let relay = if bound.address().ip().is_some_and(|ip| ip.is_unspecified()) {
            NetLocation::new(self.server.address().clone(), bound.port())
        } else {
            bound
        };
        debug!("[Socks5] {} UDP relay at {relay}", self.name);
        let inner = dialer.listen_packet(&relay).await?;
        Ok(Box::new(Socks5PacketConn::new(inner, control, relay)))
    }
}

/// UDP through a SOCKS5 relay. The association lives as long as the control stream; its EOF
/// closes the conn.
pub struct Socks5PacketConn {
    inner: Box<dyn PacketConn>,
    control: Box<dyn AsyncStream>,
    relay: NetLocation,
    pending: Option<Buffer>,
    control_closed: bool,
}

impl Socks5PacketConn {
    pub fn new(inner: Box<dyn PacketConn>, control: Box<dyn AsyncStream>, relay: NetLocation) -> Self {
        Self {
            inner,
            control,
            relay,
            pending: None,
            control_closed: false,
        }
    }

    fn poll_control(&mut self, cx: &mut Context<'_>) -> bool {
        if self.control_closed {
            return true;
        }
        let mut scratch = [0u8; 64];
        let mut read_buf = ReadBuf::new(&mut scratch);
        match Pin::new(&mut self.control).poll_read(cx, &mut read_buf) {
            Poll::Ready(Ok(())) if !read_buf.filled().is_empty() => false,
            Poll::Ready(_) => {
                self.control_closed = true;
                true
            }
            Poll::Pending => false,
        }
    }

    fn relay_matches(&self, from: &NetLocation) -> bool {
        match (from.address(), self.relay.address()) {
            (_, Address::Hostname(_)) => true,
            (a, b) => a == b && from.port() == self.relay.port(),
        }
    }
}

impl PacketRead for Socks5PacketConn {
    fn poll_read_packet(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buffer: &mut Buffer,
    ) -> Poll<std::io::Result<NetLocation>> {
        let this = self.get_mut();
        if this.poll_control(cx) {
            return Poll::Ready(Err(packet_conn_closed()));
        }
        loop {
            let start = buffer.len();
            let from = ready!(Pin::new(&mut this.inner).poll_read_packet(cx, buffer))?;
            if !this.relay_matches(&from) {
                debug!("[Socks5] dropping packet from {from}, expected relay {}", this.relay);
                buffer.truncate(start);
                continue;
            }
            match parse_udp_header(&buffer.bytes()[start..]) {
                Ok((destination, header_len)) => {
                    let payload_len = buffer.len() - start - header_len;
                    buffer.bytes_mut().copy_within(start + header_len.., start);
                    buffer.truncate(start + payload_len);
                    return Poll::Ready(Ok(destination));
                }
                Err(e) => {
                    debug!("[Socks5] dropping packet: {e}");
                    buffer.truncate(start);
                }
            }
        }
    }
}

impl PacketWrite for Socks5PacketConn {
    fn poll_write_packet(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buffer: &mut Buffer,
        destination: &NetLocation,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.control_closed {
            return Poll::Ready(Err(packet_conn_closed()));
        }
        if this.pending.is_none() {
            let mut frame = Vec::with_capacity(MAX_UDP_HEADER_LEN + buffer.len());
            encode_udp_header(destination, &mut frame);
            frame.extend_from_slice(buffer.bytes());
            this.pending = Some(Buffer::from_vec(frame));
        }
        let Some(frame) = this.pending.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let result = ready!(Pin::new(&mut this.inner).poll_write_packet(cx, frame, &this.relay));
        this.pending = None;
        Poll::Ready(result)
    }

    fn packet_headroom(&self) -> Headroom {
        Headroom {
            front: MAX_UDP_HEADER_LEN,
            rear: 0,
        }
    }
}

impl Upstream for Socks5PacketConn {
    fn upstream(&self) -> Option<&dyn Upstream> {
        Some(&self.inner)
    }
}

impl PacketConn for Socks5PacketConn {
    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        this.control_closed = true;
        let _ = ready!(Pin::new(&mut this.control).poll_shutdown(cx));
        Pin::new(&mut this.inner).poll_close(cx)
    }
}
