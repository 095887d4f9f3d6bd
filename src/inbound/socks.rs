//! SOCKS5 inbound: CONNECT and UDP ASSOCIATE, with optional username/password authentication.

use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use futures::ready;
use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

use super::{Accepted, Inbound, Reply, ReplyStream, with_leftover};
use crate::address::NetLocation;
use crate::buf::{Buffer, UDP_BUFFER_SIZE};
use crate::bufio::{PacketWrite, is_closed_error};
use crate::metadata::Network;
use crate::socks_handler::{
    CMD_CONNECT, CMD_UDP_ASSOCIATE, REPLY_COMMAND_NOT_SUPPORTED, REPLY_SUCCESS, encode_reply,
    encode_udp_header, parse_udp_header, server_handshake,
};
use crate::stream_reader::StreamReader;
use crate::tunnel::UdpPacket;

pub(super) async fn accept(
    inbound: &Inbound,
    mut stream: TcpStream,
    mut reader: StreamReader,
    source: NetLocation,
    users: &[(String, String)],
    udp: bool,
) -> std::io::Result<Accepted> {
    let request = server_handshake(&mut stream, &mut reader, users).await?;
    match request.command {
        CMD_CONNECT => {
            let mut metadata = inbound.metadata(Network::Tcp, source, request.location);
            metadata.inbound_user = request.user;
            let stream = ReplyStream::new(with_leftover(stream, reader), Reply::Socks);
            Ok(Accepted::Stream(Box::new(stream), metadata))
        }
        CMD_UDP_ASSOCIATE if udp => {
            let listen_ip = inbound.listen_addr().ip();
            let bind_ip = if listen_ip.is_unspecified() {
                stream.local_addr()?.ip()
            } else {
                listen_ip
            };
            let socket = UdpSocket::bind(SocketAddr::new(bind_ip, 0)).await?;
            let bound = NetLocation::from_socket_addr(socket.local_addr()?);
            stream.write_all(&encode_reply(REPLY_SUCCESS, &bound)).await?;
            stream.flush().await?;
            debug!("[Socks] {} udp association from {source} on {bound}", inbound.name());
            Ok(Accepted::UdpAssociate(UdpAssociation {
                control: stream,
                socket: Arc::new(socket),
                source,
                user: request.user,
            }))
        }
        command => {
            stream
                .write_all(&encode_reply(REPLY_COMMAND_NOT_SUPPORTED, &NetLocation::UNSPECIFIED))
                .await?;
            stream.flush().await?;
            Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                format!("SOCKS command {command} is not enabled"),
            ))
        }
    }
}

/// A UDP relay socket that lives as long as the TCP connection that requested it.
pub(super) struct UdpAssociation {
    control: TcpStream,
    socket: Arc<UdpSocket>,
    source: NetLocation,
    user: Option<String>,
}

fn same_host(a: IpAddr, b: IpAddr) -> bool {
    a.to_canonical() == b.to_canonical()
}

impl UdpAssociation {
    /// Feeds client datagrams to the tunnel until the control connection closes.
    pub(super) async fn relay(mut self, inbound: &Inbound, cancel: &CancellationToken) -> std::io::Result<()> {
        let closed = Arc::new(AtomicBool::new(false));
        let client_ip = self.source.address().ip();
        let mut control_buf = [0u8; 64];
        let result = loop {
            let mut buffer = inbound.env().pool().buffer(UDP_BUFFER_SIZE);
            let received = tokio::select! {
                read = self.control.read(&mut control_buf) => match read {
                    Ok(0) => break Ok(()),
                    Ok(_) => continue,
                    Err(e) if is_closed_error(&e) => break Ok(()),
                    Err(e) => break Err(e),
                },
                received = self.socket.recv_from(buffer.free_bytes_mut()) => received,
                _ = cancel.cancelled() => break Ok(()),
            };
            let (n, from) = match received {
                Ok(v) => v,
                Err(e) => {
                    debug!("[Socks] udp receive failed: {e}");
                    continue;
                }
            };
            if client_ip.is_some_and(|ip| !same_host(ip, from.ip())) {
                debug!("[Socks] dropping datagram from {from}, association belongs to {}", self.source);
                continue;
            }
            buffer.truncate_extend(n);
            let (destination, header_len) = match parse_udp_header(buffer.bytes()) {
                Ok(v) => v,
                Err(e) => {
                    debug!("[Socks] invalid datagram from {from}: {e}");
                    continue;
                }
            };
            buffer.advance(header_len);

            let mut metadata =
                inbound.metadata(Network::Udp, NetLocation::from_socket_addr(from), destination);
            metadata.inbound_user = self.user.clone();
            let writer = Box::new(SocksUdpWriter {
                socket: self.socket.clone(),
                client: from,
                closed: closed.clone(),
            });
            inbound
                .tunnel()
                .handle_udp_packet(UdpPacket {
                    metadata,
                    buffer,
                    writer,
                })
                .await;
        };
        closed.store(true, Ordering::Release);
        result
    }
}

/// Sends replies back to the associated client with the SOCKS5 UDP header prepended.
struct SocksUdpWriter {
    socket: Arc<UdpSocket>,
    client: SocketAddr,
    closed: Arc<AtomicBool>,
}

impl PacketWrite for SocksUdpWriter {
    fn poll_write_packet(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buffer: &mut Buffer,
        destination: &NetLocation,
    ) -> Poll<std::io::Result<()>> {
        if self.closed.load(Ordering::Acquire) {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "udp association closed",
            )));
        }
        let mut packet = Vec::with_capacity(buffer.len() + destination.serialized_len() + 3);
        encode_udp_header(destination, &mut packet);
        packet.extend_from_slice(buffer.bytes());
        ready!(self.socket.poll_send_to(cx, &packet, self.client))?;
        Poll::Ready(Ok(()))
    }
}
