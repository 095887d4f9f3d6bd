//! Tunnel inbound: everything arriving on the port goes to fixed targets.

use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::{Context, Poll};

use log::debug;
use rustc_hash::FxHasher;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use super::{Accepted, Inbound};
use crate::address::NetLocation;
use crate::buf::{Buffer, UDP_BUFFER_SIZE};
use crate::adapter::UdpPacketConn;
use crate::bufio::{AsyncStream, PacketWrite, SerialPacketConn};
use crate::metadata::Network;
use crate::tunnel::UdpPacket;

#[derive(Debug)]
pub struct Forward {
    targets: Vec<NetLocation>,
    networks: Vec<Network>,
    next_target_index: AtomicUsize,
}

impl Forward {
    pub fn new(targets: Vec<NetLocation>, networks: Vec<Network>) -> std::io::Result<Self> {
        if targets.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tunnel inbound needs at least one target",
            ));
        }
        if networks.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tunnel inbound needs at least one network",
            ));
        }
        Ok(Self {
            targets,
            networks,
            next_target_index: AtomicUsize::new(0),
        })
    }

    pub fn accepts(&self, network: Network) -> bool {
        self.networks.contains(&network)
    }

    /// Rotates through the targets, one per connection.
    fn next_target(&self) -> &NetLocation {
        if self.targets.len() == 1 {
            return &self.targets[0];
        }
        let index = self.next_target_index.fetch_add(1, Ordering::Relaxed);
        &self.targets[index % self.targets.len()]
    }

    /// Keeps every packet of one client on the same target.
    fn target_for(&self, client: &NetLocation) -> &NetLocation {
        if self.targets.len() == 1 {
            return &self.targets[0];
        }
        let mut hasher = FxHasher::default();
        client.hash(&mut hasher);
        &self.targets[hasher.finish() as usize % self.targets.len()]
    }

    pub(super) fn accept(
        &self,
        inbound: &Inbound,
        stream: Box<dyn AsyncStream>,
        source: NetLocation,
    ) -> Accepted {
        let metadata = inbound.metadata(Network::Tcp, source, self.next_target().clone());
        Accepted::Stream(stream, metadata)
    }

    pub(super) async fn serve_packets(
        &self,
        inbound: &Inbound,
        socket: UdpSocket,
        cancel: &CancellationToken,
    ) -> std::io::Result<()> {
        // This loop is the only reader; replies are written through the same conn.
        let conn = Arc::new(SerialPacketConn::new(UdpPacketConn::new(
            socket,
            inbound.env().resolver().clone(),
        )));
        let closed = Arc::new(AtomicBool::new(false));
        let result = loop {
            let mut buffer = inbound.env().pool().buffer(UDP_BUFFER_SIZE);
            let received = tokio::select! {
                received = conn.read_packet(&mut buffer) => received,
                _ = cancel.cancelled() => break Ok(()),
            };
            let from = match received {
                Ok(from) => from,
                Err(e) => {
                    debug!("[Forward] {} udp receive failed: {e}", inbound.name());
                    continue;
                }
            };
            let metadata = inbound.metadata(Network::Udp, from.clone(), self.target_for(&from).clone());
            let writer = Box::new(ReturnWriter {
                conn: conn.clone(),
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

/// Sends replies from the target back to the client unchanged.
struct ReturnWriter {
    conn: Arc<SerialPacketConn<UdpPacketConn>>,
    client: NetLocation,
    closed: Arc<AtomicBool>,
}

impl PacketWrite for ReturnWriter {
    fn poll_write_packet(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buffer: &mut Buffer,
        _destination: &NetLocation,
    ) -> Poll<std::io::Result<()>> {
        if self.closed.load(Ordering::Acquire) {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "tunnel listener closed",
            )));
        }
        self.conn.poll_write_packet(cx, buffer, &self.client)
    }
}
