use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::ready;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::WaitForCancellationFutureOwned;

use super::context::{CancelContext, CloseCause};
use crate::address::NetLocation;
use crate::buf::{Buffer, BufferPool};
use crate::bufio::{Headroom, PacketConn, PacketRead, PacketWrite, Upstream, packet_conn_closed};

/// Last time a packet moved through a flow, shared between the conn and the sweeper.
#[derive(Debug)]
pub(super) struct Activity {
    epoch: Instant,
    last_millis: AtomicU64,
}

impl Activity {
    pub(super) fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_millis: AtomicU64::new(0),
        }
    }

    pub(super) fn touch(&self) {
        let millis = self.epoch.elapsed().as_millis() as u64;
        self.last_millis.fetch_max(millis, Ordering::Relaxed);
    }

    pub(super) fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_millis.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last)
    }
}

pub type PacketWriter = Box<dyn PacketWrite + Send + Unpin>;

/// The per-flow virtual connection handed to the UDP handler.
///
/// Reads return packets the service queued for this flow, in arrival order. Writes go to the
/// write-back path returned by the flow's init callback.
pub struct NatConn {
    receiver: mpsc::Receiver<(Buffer, NetLocation)>,
    writer: PacketWriter,
    ctx: CancelContext,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    activity: Arc<Activity>,
}

impl NatConn {
    pub(super) fn new(
        receiver: mpsc::Receiver<(Buffer, NetLocation)>,
        writer: PacketWriter,
        ctx: CancelContext,
        activity: Arc<Activity>,
    ) -> Self {
        let cancelled = Box::pin(ctx.token().clone().cancelled_owned());
        Self {
            receiver,
            writer,
            ctx,
            cancelled,
            activity,
        }
    }

    pub fn context(&self) -> &CancelContext {
        &self.ctx
    }

    fn poll_next(&mut self, cx: &mut Context<'_>) -> Poll<std::io::Result<(Buffer, NetLocation)>> {
        if self.cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(packet_conn_closed()));
        }
        match ready!(self.receiver.poll_recv(cx)) {
            Some(packet) => {
                self.activity.touch();
                Poll::Ready(Ok(packet))
            }
            None => Poll::Ready(Err(packet_conn_closed())),
        }
    }
}

impl std::fmt::Debug for NatConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatConn")
            .field("cause", &self.ctx.cause())
            .finish()
    }
}

impl PacketRead for NatConn {
    fn poll_read_packet(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buffer: &mut Buffer,
    ) -> Poll<std::io::Result<NetLocation>> {
        let (packet, destination) = ready!(self.get_mut().poll_next(cx))?;
        if packet.len() > buffer.free_len() {
            log::debug!(
                "[UdpNat] truncating {} byte packet to {} bytes",
                packet.len(),
                buffer.free_len()
            );
        }
        buffer.write_slice(packet.bytes());
        Poll::Ready(Ok(destination))
    }

    fn supports_read_wait(&self) -> bool {
        true
    }

    fn poll_read_packet_wait(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        pool: &Arc<BufferPool>,
        headroom: Headroom,
    ) -> Poll<std::io::Result<(Buffer, NetLocation)>> {
        let (packet, destination) = ready!(self.get_mut().poll_next(cx))?;
        if headroom.fits(&packet) {
            return Poll::Ready(Ok((packet, destination)));
        }
        let copied = packet.copy_with_headroom(pool, headroom.front, headroom.rear);
        Poll::Ready(Ok((copied, destination)))
    }
}

impl PacketWrite for NatConn {
    fn poll_write_packet(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buffer: &mut Buffer,
        destination: &NetLocation,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.ctx.is_cancelled() {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "nat flow closed",
            )));
        }
        ready!(Pin::new(&mut this.writer).poll_write_packet(cx, buffer, destination))?;
        this.activity.touch();
        Poll::Ready(Ok(()))
    }

    fn packet_headroom(&self) -> Headroom {
        self.writer.packet_headroom()
    }
}

impl Upstream for NatConn {}

impl PacketConn for NatConn {
    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        this.ctx.cancel(CloseCause::Closed);
        this.receiver.close();
        Poll::Ready(Ok(()))
    }
}
