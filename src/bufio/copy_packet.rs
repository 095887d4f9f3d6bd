use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::ready;
use tokio::time::{Instant, Sleep};
use tokio_util::sync::CancellationToken;

use super::{Headroom, PacketConn, PacketRead, PacketWrite, close_packet_conn, is_closed_error};
use crate::address::NetLocation;
use crate::buf::{Buffer, BufferPool, UDP_BUFFER_SIZE};

struct PacketCopier {
    pool: Arc<BufferPool>,
    read_wait: bool,
    cached: VecDeque<(Buffer, NetLocation)>,
    spare: Option<Buffer>,
    held_rear: usize,
    pending: Option<(Buffer, NetLocation, usize)>,
    transferred: u64,
}

impl PacketCopier {
    fn new(pool: Arc<BufferPool>, read_wait: bool, cached: Vec<(Buffer, NetLocation)>) -> Self {
        Self {
            pool,
            read_wait,
            cached: cached.into(),
            spare: None,
            held_rear: 0,
            pending: None,
            transferred: 0,
        }
    }

    fn poll_read<R: PacketRead + ?Sized>(
        &mut self,
        cx: &mut Context<'_>,
        mut reader: Pin<&mut R>,
        headroom: Headroom,
    ) -> Poll<std::io::Result<(Buffer, NetLocation)>> {
        if let Some((buffer, destination)) = self.cached.pop_front() {
            if headroom.fits(&buffer) {
                return Poll::Ready(Ok((buffer, destination)));
            }
            let copied = buffer.copy_with_headroom(&self.pool, headroom.front, headroom.rear);
            return Poll::Ready(Ok((copied, destination)));
        }
        if self.read_wait {
            return reader.as_mut().poll_read_packet_wait(cx, &self.pool, headroom);
        }

        if let Some(buffer) = self.spare.as_mut() {
            buffer.release_rear(self.held_rear);
        }
        self.held_rear = 0;
        let needed = headroom.front + UDP_BUFFER_SIZE + headroom.rear;
        let buffer = match self.spare.take() {
            Some(buffer) if buffer.capacity() >= needed => buffer,
            _ => self.pool.buffer(needed),
        };
        let buffer = self.spare.insert(buffer);
        buffer.resize(headroom.front, 0);
        let rear = buffer.free_len() - UDP_BUFFER_SIZE;
        buffer.hold_rear(rear);
        self.held_rear = rear;

        let destination = ready!(reader.as_mut().poll_read_packet(cx, buffer))?;
        let Some(mut filled) = self.spare.take() else {
            return Poll::Ready(Err(std::io::Error::other("packet buffer missing")));
        };
        filled.release_rear(self.held_rear);
        self.held_rear = 0;
        Poll::Ready(Ok((filled, destination)))
    }

    /// Copies packets until the reader reports the flow closed.
    fn poll_copy<R, W>(
        &mut self,
        cx: &mut Context<'_>,
        mut reader: Pin<&mut R>,
        mut writer: Pin<&mut W>,
    ) -> Poll<std::io::Result<u64>>
    where
        R: PacketRead + ?Sized,
        W: PacketWrite + ?Sized,
    {
        loop {
            if self.pending.is_none() {
                let headroom = writer.packet_headroom();
                match ready!(self.poll_read(cx, reader.as_mut(), headroom)) {
                    Ok((buffer, destination)) => {
                        let len = buffer.len();
                        self.pending = Some((buffer, destination, len));
                    }
                    Err(e) if is_closed_error(&e) => return Poll::Ready(Ok(self.transferred)),
                    Err(e) => return Poll::Ready(Err(e)),
                }
            }

            if let Some((buffer, destination, len)) = self.pending.as_mut() {
                match ready!(writer.as_mut().poll_write_packet(cx, buffer, destination)) {
                    Ok(()) => {
                        self.transferred += *len as u64;
                        if let Some((buffer, _, _)) = self.pending.take()
                            && !self.read_wait
                        {
                            self.spare = Some(buffer);
                        }
                    }
                    Err(e) => {
                        if let Some((mut buffer, _, _)) = self.pending.take() {
                            buffer.leak();
                        }
                        return Poll::Ready(Err(e));
                    }
                }
            }
        }
    }
}

/// Copies packets from `src` to `dst`, each to the destination it was read with, until `src`
/// reports the flow closed. Packets `src` had read ahead are written first.
pub async fn copy_packet<R, W>(dst: &mut W, src: &mut R, pool: &Arc<BufferPool>) -> std::io::Result<u64>
where
    R: PacketRead + Unpin + ?Sized,
    W: PacketWrite + Unpin + ?Sized,
{
    let read_wait = src.supports_read_wait() && !pool.is_low_memory();
    let cached = src.take_cached_packets();
    let mut copier = PacketCopier::new(pool.clone(), read_wait, cached);
    futures::future::poll_fn(|cx| copier.poll_copy(cx, Pin::new(&mut *src), Pin::new(&mut *dst)))
        .await
}

struct CopyPacketConn<'a, A: ?Sized, B: ?Sized> {
    a: &'a mut A,
    b: &'a mut B,
    a_to_b: PacketCopier,
    b_to_a: PacketCopier,
    idle_timeout: Duration,
    idle: Pin<Box<Sleep>>,
}

impl<A, B> Future for CopyPacketConn<'_, A, B>
where
    A: PacketConn + ?Sized,
    B: PacketConn + ?Sized,
{
    type Output = std::io::Result<(u64, u64)>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let before = this.a_to_b.transferred + this.b_to_a.transferred;

        let up = this
            .a_to_b
            .poll_copy(cx, Pin::new(&mut *this.a), Pin::new(&mut *this.b))?;
        let down = this
            .b_to_a
            .poll_copy(cx, Pin::new(&mut *this.b), Pin::new(&mut *this.a))?;

        // Either side closing ends the flow; packets have no half-close.
        if up.is_ready() || down.is_ready() {
            return Poll::Ready(Ok((this.a_to_b.transferred, this.b_to_a.transferred)));
        }

        if this.a_to_b.transferred + this.b_to_a.transferred != before {
            let deadline = Instant::now() + this.idle_timeout;
            this.idle.as_mut().reset(deadline);
        }
        if this.idle.as_mut().poll(cx).is_ready() {
            log::debug!("[Copy] packet flow idle for {:?}", this.idle_timeout);
            return Poll::Ready(Ok((this.a_to_b.transferred, this.b_to_a.transferred)));
        }
        Poll::Pending
    }
}

/// Relays packets both ways between `a` and `b` until one side closes, no packet moves for
/// `idle_timeout`, or `cancel` fires. Both conns are closed afterwards.
pub async fn copy_packet_conn<A, B>(
    a: &mut A,
    b: &mut B,
    pool: &Arc<BufferPool>,
    idle_timeout: Duration,
    cancel: &CancellationToken,
) -> std::io::Result<(u64, u64)>
where
    A: PacketConn + ?Sized,
    B: PacketConn + ?Sized,
{
    let a_read_wait = a.supports_read_wait() && !pool.is_low_memory();
    let b_read_wait = b.supports_read_wait() && !pool.is_low_memory();
    let a_cached = a.take_cached_packets();
    let b_cached = b.take_cached_packets();

    let result = {
        let relay = CopyPacketConn {
            a: &mut *a,
            b: &mut *b,
            a_to_b: PacketCopier::new(pool.clone(), a_read_wait, a_cached),
            b_to_a: PacketCopier::new(pool.clone(), b_read_wait, b_cached),
            idle_timeout,
            idle: Box::pin(tokio::time::sleep(idle_timeout)),
        };
        tokio::select! {
            result = relay => result,
            _ = cancel.cancelled() => Err(std::io::Error::new(
                std::io::ErrorKind::Interrupted,
                "packet connection cancelled",
            )),
        }
    };

    let (a_closed, b_closed) = futures::join!(close_packet_conn(a), close_packet_conn(b));
    if let Err(e) = a_closed.and(b_closed) {
        log::debug!("[Copy] failed to close packet connection: {e}");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bufio::{Upstream, packet_conn_closed};
    use tokio::sync::mpsc;

    /// Channel-backed packet conn used to drive both directions in tests.
    struct ChannelPacketConn {
        incoming: mpsc::Receiver<(Vec<u8>, NetLocation)>,
        outgoing: mpsc::UnboundedSender<(Vec<u8>, NetLocation)>,
        headroom: Headroom,
        cached: Vec<(Buffer, NetLocation)>,
        closed: bool,
    }

    impl PacketRead for ChannelPacketConn {
        fn poll_read_packet(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buffer: &mut Buffer,
        ) -> Poll<std::io::Result<NetLocation>> {
            match ready!(self.get_mut().incoming.poll_recv(cx)) {
                Some((data, location)) => {
                    buffer.write_slice(&data);
                    Poll::Ready(Ok(location))
                }
                None => Poll::Ready(Err(packet_conn_closed())),
            }
        }

        fn take_cached_packets(&mut self) -> Vec<(Buffer, NetLocation)> {
            std::mem::take(&mut self.cached)
        }
    }

    impl PacketWrite for ChannelPacketConn {
        fn poll_write_packet(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buffer: &mut Buffer,
            destination: &NetLocation,
        ) -> Poll<std::io::Result<()>> {
            let this = self.get_mut();
            assert!(buffer.front_headroom() >= this.headroom.front);
            let _ = this.outgoing.send((buffer.to_vec(), destination.clone()));
            Poll::Ready(Ok(()))
        }

        fn packet_headroom(&self) -> Headroom {
            self.headroom
        }
    }

    impl Upstream for ChannelPacketConn {}

    impl PacketConn for ChannelPacketConn {
        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            self.get_mut().closed = true;
            Poll::Ready(Ok(()))
        }
    }

    fn conn(
        headroom: Headroom,
    ) -> (
        ChannelPacketConn,
        mpsc::Sender<(Vec<u8>, NetLocation)>,
        mpsc::UnboundedReceiver<(Vec<u8>, NetLocation)>,
    ) {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        (
            ChannelPacketConn {
                incoming: in_rx,
                outgoing: out_tx,
                headroom,
                cached: Vec::new(),
                closed: false,
            },
            in_tx,
            out_rx,
        )
    }

    fn location(port: u16) -> NetLocation {
        NetLocation::from_str(&format!("10.0.0.1:{port}"), None).unwrap()
    }

    #[tokio::test]
    async fn test_copy_packet_preserves_destination_and_cached_order() {
        let pool = BufferPool::new();
        let (mut src, src_tx, _src_out) = conn(Headroom::NONE);
        let (mut dst, _dst_tx, mut dst_out) = conn(Headroom { front: 4, rear: 0 });
        src.cached.push((Buffer::from_slice(b"cached"), location(1)));

        src_tx.send((b"first".to_vec(), location(2))).await.unwrap();
        src_tx.send((b"second".to_vec(), location(3))).await.unwrap();
        drop(src_tx);

        let copied = copy_packet(&mut dst, &mut src, &pool).await.unwrap();
        assert_eq!(copied, 17);
        assert_eq!(dst_out.recv().await.unwrap(), (b"cached".to_vec(), location(1)));
        assert_eq!(dst_out.recv().await.unwrap(), (b"first".to_vec(), location(2)));
        assert_eq!(dst_out.recv().await.unwrap(), (b"second".to_vec(), location(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_copy_packet_conn_idle_timeout_closes_both() {
        let pool = BufferPool::new();
        let cancel = CancellationToken::new();
        let (mut a, a_tx, _a_out) = conn(Headroom::NONE);
        let (mut b, _b_tx, mut b_out) = conn(Headroom::NONE);

        a_tx.send((b"query".to_vec(), location(53))).await.unwrap();
        let (up, down) = copy_packet_conn(&mut a, &mut b, &pool, Duration::from_secs(30), &cancel)
            .await
            .unwrap();
        assert_eq!((up, down), (5, 0));
        assert_eq!(b_out.recv().await.unwrap().0, b"query");
        assert!(a.closed && b.closed);
    }
}
