use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::ready;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use super::splice::{splice, splice_supported};
use super::upstream::{CountFn, Upstream, collect_read_counters, collect_write_counters, find_capability};
use super::{AsyncStream, Headroom};
use crate::buf::{Buffer, BufferPool, DEFAULT_BUFFER_SIZE};

#[derive(Debug)]
struct CopyBuffer {
    pool: Arc<BufferPool>,
    read_wait: bool,
    spare: Option<Buffer>,
    held_rear: usize,
    pending: Option<Buffer>,
    pending_len: usize,
    read_done: bool,
    need_flush: bool,
    wrote: bool,
    failure: Option<std::io::Error>,
    transferred: u64,
}

impl CopyBuffer {
    fn new(pool: Arc<BufferPool>, read_wait: bool) -> Self {
        Self {
            pool,
            read_wait,
            spare: None,
            held_rear: 0,
            pending: None,
            pending_len: 0,
            read_done: false,
            need_flush: false,
            wrote: false,
            failure: None,
            transferred: 0,
        }
    }

    /// The reusable read buffer, reset so the writer's headroom stays free around the data.
    fn prepare_spare(&mut self, headroom: Headroom) -> &mut Buffer {
        if let Some(buffer) = self.spare.as_mut() {
            buffer.release_rear(self.held_rear);
        }
        self.held_rear = 0;
        let needed = headroom.front + DEFAULT_BUFFER_SIZE + headroom.rear;
        let buffer = match self.spare.take() {
            Some(buffer) if buffer.capacity() >= needed => buffer,
            _ => self.pool.buffer(needed),
        };
        let buffer = self.spare.insert(buffer);
        buffer.resize(headroom.front, 0);
        let rear = buffer.free_len() - DEFAULT_BUFFER_SIZE;
        buffer.hold_rear(rear);
        self.held_rear = rear;
        buffer
    }

    fn poll_fill<R>(
        &mut self,
        cx: &mut Context<'_>,
        mut reader: Pin<&mut R>,
        headroom: Headroom,
    ) -> Poll<std::io::Result<Option<Buffer>>>
    where
        R: AsyncStream + ?Sized,
    {
        if self.read_wait {
            return reader.as_mut().poll_read_wait(cx, &self.pool, headroom);
        }
        let buffer = self.prepare_spare(headroom);
        ready!(reader.as_mut().poll_read_buffer(cx, buffer))?;
        if buffer.is_empty() {
            return Poll::Ready(Ok(None));
        }
        let Some(mut filled) = self.spare.take() else {
            return Poll::Ready(Ok(None));
        };
        filled.release_rear(self.held_rear);
        self.held_rear = 0;
        Poll::Ready(Ok(Some(filled)))
    }

    fn poll_copy<R, W>(
        &mut self,
        cx: &mut Context<'_>,
        mut reader: Pin<&mut R>,
        mut writer: Pin<&mut W>,
    ) -> Poll<std::io::Result<u64>>
    where
        R: AsyncStream + ?Sized,
        W: AsyncStream + ?Sized,
    {
        loop {
            if let Some(error) = self.failure.as_ref() {
                if let Err(e) = ready!(reader.as_mut().poll_handshake_failure(cx, error)) {
                    log::debug!("[Copy] failed to report handshake failure: {e}");
                }
                if let Some(error) = self.failure.take() {
                    return Poll::Ready(Err(error));
                }
            }

            if self.pending.is_none() && !self.read_done {
                let headroom = Headroom {
                    front: writer.front_headroom(),
                    rear: writer.rear_headroom(),
                };
                match self.poll_fill(cx, reader.as_mut(), headroom) {
                    Poll::Ready(Ok(Some(buffer))) => {
                        self.pending_len = buffer.len();
                        self.pending = Some(buffer);
                    }
                    Poll::Ready(Ok(None)) => self.read_done = true,
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => {
                        // Nothing to write until the reader wakes us; push out what we have.
                        if self.need_flush {
                            ready!(writer.as_mut().poll_flush(cx))?;
                            self.need_flush = false;
                        }
                        return Poll::Pending;
                    }
                }
            }

            if let Some(buffer) = self.pending.as_mut() {
                match writer.as_mut().poll_write_buffer(cx, buffer) {
                    Poll::Ready(Ok(())) => {
                        self.transferred += self.pending_len as u64;
                        self.wrote = true;
                        self.need_flush = true;
                        let buffer = self.pending.take();
                        if !self.read_wait {
                            self.spare = buffer;
                        }
                    }
                    Poll::Ready(Err(e)) => {
                        if let Some(mut buffer) = self.pending.take() {
                            buffer.leak();
                        }
                        if !self.wrote {
                            self.failure = Some(e);
                            continue;
                        }
                        return Poll::Ready(Err(e));
                    }
                    Poll::Pending => return Poll::Pending,
                }
            }

            if self.read_done && self.pending.is_none() {
                if self.need_flush {
                    ready!(writer.as_mut().poll_flush(cx))?;
                    self.need_flush = false;
                }
                return Poll::Ready(Ok(self.transferred));
            }
        }
    }
}

fn find_tcp(node: &dyn Upstream) -> Option<&TcpStream> {
    find_capability(node, |n| n.tcp_stream())
}

/// Relays `src` into `dst` until EOF and returns the number of bytes written.
///
/// Raw TCP sockets on both sides are spliced; otherwise filled buffers are taken from the source
/// when it can hand them out, else a pooled buffer sized for the destination's headroom is used.
pub async fn copy<R, W>(dst: &mut W, src: &mut R, pool: &Arc<BufferPool>) -> std::io::Result<u64>
where
    R: AsyncStream,
    W: AsyncStream,
{
    if splice_supported()
        && let (Some(src_tcp), Some(dst_tcp)) = (find_tcp(&*src), find_tcp(&*dst))
    {
        let read_counters = collect_read_counters(&*src);
        let write_counters = collect_write_counters(&*dst);
        if let Some(n) = splice(dst_tcp, src_tcp, &read_counters, &write_counters).await? {
            return Ok(n);
        }
    }

    let read_wait = src.supports_read_wait() && !pool.is_low_memory();
    let mut buffer = CopyBuffer::new(pool.clone(), read_wait);
    futures::future::poll_fn(|cx| buffer.poll_copy(cx, Pin::new(&mut *src), Pin::new(&mut *dst)))
        .await
}

enum TransferState {
    Running(CopyBuffer),
    ShuttingDown(u64),
    Done(u64),
}

fn transfer_one_direction<A, B>(
    cx: &mut Context<'_>,
    state: &mut TransferState,
    r: &mut A,
    w: &mut B,
) -> Poll<std::io::Result<u64>>
where
    A: AsyncStream + ?Sized,
    B: AsyncStream + ?Sized,
{
    let mut r = Pin::new(r);
    let mut w = Pin::new(w);

    loop {
        match state {
            TransferState::Running(buf) => {
                let count = ready!(buf.poll_copy(cx, r.as_mut(), w.as_mut()))?;
                *state = TransferState::ShuttingDown(count);
            }
            TransferState::ShuttingDown(count) => {
                ready!(w.as_mut().poll_shutdown(cx))?;
                *state = TransferState::Done(*count);
            }
            TransferState::Done(count) => return Poll::Ready(Ok(*count)),
        }
    }
}

struct CopyConn<'a, A: ?Sized, B: ?Sized> {
    a: &'a mut A,
    b: &'a mut B,
    a_to_b: TransferState,
    b_to_a: TransferState,
}

impl<A, B> Future for CopyConn<'_, A, B>
where
    A: AsyncStream + ?Sized,
    B: AsyncStream + ?Sized,
{
    type Output = std::io::Result<(u64, u64)>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let CopyConn {
            a,
            b,
            a_to_b,
            b_to_a,
        } = &mut *self;

        let a_to_b = transfer_one_direction(cx, a_to_b, &mut **a, &mut **b)?;
        let b_to_a = transfer_one_direction(cx, b_to_a, &mut **b, &mut **a)?;

        match (a_to_b, b_to_a) {
            (Poll::Ready(up), Poll::Ready(down)) => Poll::Ready(Ok((up, down))),
            // A side that cannot half-close is already fully closed once its write half ends.
            (Poll::Ready(up), Poll::Pending) if !b.supports_half_close() => Poll::Ready(Ok((up, 0))),
            (Poll::Pending, Poll::Ready(down)) if !a.supports_half_close() => {
                Poll::Ready(Ok((0, down)))
            }
            _ => Poll::Pending,
        }
    }
}

/// Relays both directions between `a` and `b` until both reach EOF or `cancel` fires.
///
/// Each direction shuts down its destination's write half once its source reaches EOF.
/// Cancellation shuts down both ends. Returns bytes moved from `a` to `b` and from `b` to `a`.
pub async fn copy_conn<A, B>(
    a: &mut A,
    b: &mut B,
    pool: &Arc<BufferPool>,
    cancel: &CancellationToken,
) -> std::io::Result<(u64, u64)>
where
    A: AsyncStream,
    B: AsyncStream,
{
    let result = tokio::select! {
        result = copy_conn_inner(a, b, pool) => result,
        _ = cancel.cancelled() => Err(std::io::Error::new(
            std::io::ErrorKind::Interrupted,
            "connection cancelled",
        )),
    };
    if result.is_err() {
        let (_, _) = futures::join!(a.shutdown(), b.shutdown());
    }
    result
}

async fn copy_conn_inner<A, B>(
    a: &mut A,
    b: &mut B,
    pool: &Arc<BufferPool>,
) -> std::io::Result<(u64, u64)>
where
    A: AsyncStream,
    B: AsyncStream,
{
    if splice_supported()
        && let (Some(a_tcp), Some(b_tcp)) = (find_tcp(&*a), find_tcp(&*b))
    {
        let a_reads = collect_read_counters(&*a);
        let a_writes = collect_write_counters(&*a);
        let b_reads = collect_read_counters(&*b);
        let b_writes = collect_write_counters(&*b);
        let (up, down) = futures::try_join!(
            relay_tcp(b_tcp, a_tcp, &a_reads, &b_writes, pool),
            relay_tcp(a_tcp, b_tcp, &b_reads, &a_writes, pool),
        )?;
        return Ok((up, down));
    }

    let a_read_wait = a.supports_read_wait() && !pool.is_low_memory();
    let b_read_wait = b.supports_read_wait() && !pool.is_low_memory();
    CopyConn {
        a,
        b,
        a_to_b: TransferState::Running(CopyBuffer::new(pool.clone(), a_read_wait)),
        b_to_a: TransferState::Running(CopyBuffer::new(pool.clone(), b_read_wait)),
    }
    .await
}

/// One direction between two shared TCP sockets: splice, or a pooled copy when the kernel
/// refuses, followed by a write-half shutdown of `dst`.
async fn relay_tcp(
    dst: &TcpStream,
    src: &TcpStream,
    read_counters: &[CountFn],
    write_counters: &[CountFn],
    pool: &Arc<BufferPool>,
) -> std::io::Result<u64> {
    let moved = match splice(dst, src, read_counters, write_counters).await? {
        Some(n) => n,
        None => copy_tcp_shared(dst, src, read_counters, write_counters, pool).await?,
    };
    if let Err(e) = socket2::SockRef::from(dst).shutdown(std::net::Shutdown::Write) {
        log::debug!("[Copy] failed to shut down write half: {e}");
    }
    Ok(moved)
}

async fn copy_tcp_shared(
    dst: &TcpStream,
    src: &TcpStream,
    read_counters: &[CountFn],
    write_counters: &[CountFn],
    pool: &Arc<BufferPool>,
) -> std::io::Result<u64> {
    let mut buffer = pool.buffer(DEFAULT_BUFFER_SIZE);
    let mut total = 0u64;
    loop {
        src.readable().await?;
        buffer.reset();
        let n = match src.try_read(buffer.free_bytes_mut()) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        };
        buffer.truncate_extend(n);
        for counter in read_counters {
            counter(n as u64);
        }
        while !buffer.is_empty() {
            dst.writable().await?;
            match dst.try_write(buffer.bytes()) {
                Ok(0) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "write zero byte into writer",
                    ));
                }
                Ok(written) => {
                    buffer.advance(written);
                    total += written as u64;
                    for counter in write_counters {
                        counter(written as u64);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => {
                    buffer.leak();
                    return Err(e);
                }
            }
        }
    }
}
