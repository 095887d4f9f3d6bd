//! How adapters reach their servers: straight from this host, or through another proxy.

use std::fmt::Debug;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::ready;
use log::{debug, error};
use tokio::io::ReadBuf;
use tokio::net::UdpSocket;

use super::{ProxyAdapter, Proxy};
use crate::address::NetLocation;
use crate::buf::Buffer;
use crate::bufio::{AsyncStream, PacketConn, PacketRead, PacketWrite, Upstream};
use crate::metadata::{Metadata, Network};
use crate::resolver::{ResolveFuture, Resolver, resolve_single_address};
use crate::socket_util::{new_tcp_socket, new_udp_socket, set_tcp_keepalive};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE_IDLE: Duration = Duration::from_secs(120);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

#[async_trait]
pub trait Dialer: Send + Sync + Debug {
    async fn dial_stream(&self, destination: &NetLocation) -> std::io::Result<Box<dyn AsyncStream>>;

    /// A packet conn whose writes may target any address; `destination` picks the address family.
    async fn listen_packet(&self, destination: &NetLocation) -> std::io::Result<Box<dyn PacketConn>>;
}

/// Connects from this host, optionally pinned to a network interface.
#[derive(Debug, Clone)]
pub struct SystemDialer {
    resolver: Arc<dyn Resolver>,
    bind_interface: Option<String>,
}

impl SystemDialer {
    pub fn new(resolver: Arc<dyn Resolver>, bind_interface: Option<String>) -> Self {
        Self {
            resolver,
            bind_interface,
        }
    }

    pub fn resolver(&self) -> &Arc<dyn Resolver> {
        &self.resolver
    }
}

#[async_trait]
impl Dialer for SystemDialer {
    async fn dial_stream(&self, destination: &NetLocation) -> std::io::Result<Box<dyn AsyncStream>> {
        let target_addr = resolve_single_address(&self.resolver, destination).await?;
        let tcp_socket = new_tcp_socket(target_addr.is_ipv6(), self.bind_interface.as_deref())?;
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, tcp_socket.connect(target_addr))
            .await
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {destination} timed out"),
                )
            })??;

        if let Err(e) = set_tcp_keepalive(&stream, KEEPALIVE_IDLE, KEEPALIVE_INTERVAL) {
            error!("Failed to set TCP keepalive: {e}");
        }
        if let Err(e) = stream.set_nodelay(true) {
            error!("Failed to set TCP no-delay: {e}");
        }
        Ok(Box::new(stream))
    }

    async fn listen_packet(&self, destination: &NetLocation) -> std::io::Result<Box<dyn PacketConn>> {
        let is_ipv6 = match destination.address().ip() {
            Some(ip) => ip.is_ipv6(),
            None => resolve_single_address(&self.resolver, destination)
                .await?
                .is_ipv6(),
        };
        let socket = new_udp_socket(is_ipv6, self.bind_interface.as_deref())?;
        Ok(Box::new(UdpPacketConn::new(socket, self.resolver.clone())))
    }
}

/// Reaches destinations by dialing them through `proxy`, which itself connects with `dialer`.
#[derive(Debug, Clone)]
pub struct ProxyDialer {
    proxy: Arc<Proxy>,
    dialer: Arc<dyn Dialer>,
}

impl ProxyDialer {
    pub fn new(proxy: Arc<Proxy>, dialer: Arc<dyn Dialer>) -> Self {
        Self { proxy, dialer }
    }
}

#[async_trait]
impl Dialer for ProxyDialer {
    async fn dial_stream(&self, destination: &NetLocation) -> std::io::Result<Box<dyn AsyncStream>> {
        let metadata = Metadata::new(Network::Tcp, NetLocation::UNSPECIFIED, destination.clone());
        self.proxy
            .dial_with_dialer(self.dialer.clone(), &metadata)
            .await
    }

    async fn listen_packet(&self, destination: &NetLocation) -> std::io::Result<Box<dyn PacketConn>> {
        let metadata = Metadata::new(Network::Udp, NetLocation::UNSPECIFIED, destination.clone());
        self.proxy
            .listen_packet_with_dialer(self.dialer.clone(), &metadata)
            .await
    }
}

/// An unconnected UDP socket. Hostname destinations are resolved on write and the last answer
/// is reused for consecutive packets to the same host.
pub struct UdpPacketConn {
    socket: UdpSocket,
    resolver: Arc<dyn Resolver>,
    resolving: Option<(NetLocation, ResolveFuture)>,
    resolved: Option<(NetLocation, SocketAddr)>,
}

impl UdpPacketConn {
    pub fn new(socket: UdpSocket, resolver: Arc<dyn Resolver>) -> Self {
        Self {
            socket,
            resolver,
            resolving: None,
            resolved: None,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn poll_target(
        &mut self,
        cx: &mut Context<'_>,
        destination: &NetLocation,
    ) -> Poll<std::io::Result<SocketAddr>> {
        if let Some(addr) = destination.to_socket_addr_nonblocking() {
            return Poll::Ready(Ok(addr));
        }
        if let Some((location, addr)) = &self.resolved
            && location == destination
        {
            return Poll::Ready(Ok(*addr));
        }
        if self
            .resolving
            .as_ref()
            .is_none_or(|(location, _)| location != destination)
        {
            let lookup = self.resolver.resolve_location(destination);
            self.resolving = Some((destination.clone(), lookup));
        }
        let Some((_, lookup)) = self.resolving.as_mut() else {
            return Poll::Ready(Err(std::io::Error::other("no pending lookup")));
        };
        let result = ready!(lookup.as_mut().poll(cx));
        self.resolving = None;
        let addrs = result?;
        let want_ipv6 = self.socket.local_addr()?.is_ipv6();
        // An IPv6 socket can reach IPv4 hosts through mapped addresses; an IPv4 one cannot.
        let addr = addrs
            .iter()
            .find(|addr| addr.is_ipv6() == want_ipv6)
            .or_else(|| addrs.iter().find(|addr| want_ipv6 || addr.is_ipv4()))
            .copied()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("could not resolve location: {destination}"),
                )
            })?;
        self.resolved = Some((destination.clone(), addr));
        Poll::Ready(Ok(addr))
    }
}

impl Debug for UdpPacketConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpPacketConn")
            .field("local_addr", &self.socket.local_addr().ok())
            .finish()
    }
}

impl PacketRead for UdpPacketConn {
    fn poll_read_packet(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buffer: &mut Buffer,
    ) -> Poll<std::io::Result<NetLocation>> {
        let this = self.get_mut();
        let mut read_buf = ReadBuf::new(buffer.free_bytes_mut());
        let from = ready!(this.socket.poll_recv_from(cx, &mut read_buf))?;
        let n = read_buf.filled().len();
        buffer.truncate_extend(n);
        Poll::Ready(Ok(NetLocation::from_socket_addr(from)))
    }
}

impl PacketWrite for UdpPacketConn {
    fn poll_write_packet(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buffer: &mut Buffer,
        destination: &NetLocation,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let mut target = ready!(this.poll_target(cx, destination))?;
        if let IpAddr::V4(v4) = target.ip()
            && this.socket.local_addr()?.is_ipv6()
        {
            target = SocketAddr::new(IpAddr::V6(v4.to_ipv6_mapped()), target.port());
        }
        let n = ready!(this.socket.poll_send_to(cx, buffer.bytes(), target))?;
        if n != buffer.len() {
            debug!("[Udp] short send to {target}: {n} of {} bytes", buffer.len());
        }
        Poll::Ready(Ok(()))
    }
}

impl Upstream for UdpPacketConn {}

impl PacketConn for UdpPacketConn {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bufio::{read_packet, write_packet};
    use crate::resolver::NativeResolver;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn system() -> SystemDialer {
        SystemDialer::new(Arc::new(NativeResolver::new()), None)
    }

    #[tokio::test]
    async fn test_dial_stream_loopback() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            conn.write_all(b"hi").await.unwrap();
        });
        let mut stream = system()
            .dial_stream(&NetLocation::from_socket_addr(addr))
            .await
            .unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        assert!(stream.tcp_stream().is_some());
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = system()
            .dial_stream(&NetLocation::from_socket_addr(addr))
            .await
            .err().expect("dial should fail");
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn test_udp_packet_conn_round_trip() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = NetLocation::from_socket_addr(peer.local_addr().unwrap());
        let mut conn = system().listen_packet(&peer_addr).await.unwrap();

        let mut packet = Buffer::from_slice(b"ping");
        write_packet(&mut conn, &mut packet, &peer_addr).await.unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");

        peer.send_to(b"pong", from).await.unwrap();
        let mut buffer = Buffer::new(64);
        let source = read_packet(&mut conn, &mut buffer).await.unwrap();
        assert_eq!(source, peer_addr);
        assert_eq!(buffer.bytes(), b"pong");
    }

    #[tokio::test]
    async fn test_udp_hostname_destination() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = peer.local_addr().unwrap().port();
        let socket = new_udp_socket(false, None).unwrap();
        let mut conn = UdpPacketConn::new(socket, Arc::new(NativeResolver::new()));
        let destination = NetLocation::from_str(&format!("localhost:{port}"), None).unwrap();
        for payload in [&b"one"[..], &b"two"[..]] {
            let mut packet = Buffer::from_slice(payload);
            write_packet(&mut conn, &mut packet, &destination).await.unwrap();
            let mut buf = [0u8; 16];
            let (n, _) = peer.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], payload);
        }
    }
}
