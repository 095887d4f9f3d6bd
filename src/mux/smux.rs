//! smux v1 session: many logical streams over one ordered byte stream.
//!
//! Frames are `version | cmd | u16 LE length | u32 LE stream id | payload`. The connection sits
//! in a `SerialStream` shared by two tasks. The writer task is its only writer; streams and the
//! keepalive task queue frames to it. A reader task, the only reader,
//! demultiplexes PSH frames into per-stream queues. smux v1 carries no window updates, so those
//! queues are unbounded and an unread stream never stalls the reader. A FIN from the peer, or
//! session teardown, ends the stream's read side with EOF.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use futures::ready;
use log::{debug, warn};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, PollSender};

use crate::bufio::{AsyncStream, ExtendedRead, ExtendedWrite, SerialStream, Upstream};

pub const SMUX_VERSION: u8 = 1;

const CMD_SYN: u8 = 0;
const CMD_FIN: u8 = 1;
const CMD_PSH: u8 = 2;
const CMD_NOP: u8 = 3;

const HEADER_SIZE: usize = 8;
pub const MAX_FRAME_SIZE: usize = 32768;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(30);

const OUTGOING_CHANNEL_SIZE: usize = 64;
const ACCEPT_BACKLOG: usize = 128;
// Frames coalesced into one physical write.
const WRITE_BATCH_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

#[derive(Debug)]
enum Frame {
    Syn(u32),
    Fin(u32),
    Psh(u32, Bytes),
    Nop,
}

impl Frame {
    fn encode(&self, out: &mut BytesMut) {
        let (cmd, sid, payload): (u8, u32, &[u8]) = match self {
            Frame::Syn(sid) => (CMD_SYN, *sid, &[][..]),
            Frame::Fin(sid) => (CMD_FIN, *sid, &[][..]),
            Frame::Psh(sid, data) => (CMD_PSH, *sid, &data[..]),
            Frame::Nop => (CMD_NOP, 0, &[][..]),
        };
        out.reserve(HEADER_SIZE + payload.len());
        out.put_u8(SMUX_VERSION);
        out.put_u8(cmd);
        out.put_u16_le(payload.len() as u16);
        out.put_u32_le(sid);
        out.put_slice(payload);
    }
}

struct Shared {
    streams: Mutex<HashMap<u32, mpsc::UnboundedSender<Bytes>>>,
    data_tx: mpsc::Sender<Frame>,
    control_tx: mpsc::UnboundedSender<Frame>,
    next_id: AtomicU32,
    cancel: CancellationToken,
    epoch: Instant,
    last_recv_millis: AtomicU64,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn close(&self) {
        self.cancel.cancel();
        // Dropping the senders ends every stream's read side.
        self.streams.lock().clear();
    }

    fn touch_recv(&self) {
        let millis = self.epoch.elapsed().as_millis() as u64;
        self.last_recv_millis.store(millis, Ordering::Relaxed);
    }

    fn recv_idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_recv_millis.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last)
    }

    fn register(self: &Arc<Self>, id: u32) -> std::io::Result<SmuxStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut streams = self.streams.lock();
            if self.is_closed() {
                return Err(session_closed());
            }
            if streams.insert(id, tx).is_some() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!("duplicate smux stream id {id}"),
                ));
            }
        }
        Ok(SmuxStream {
            id,
            shared: self.clone(),
            data_rx: rx,
            read_buffer: Bytes::new(),
            data_tx: PollSender::new(self.data_tx.clone()),
            write_closed: false,
            fin_sent: false,
        })
    }
}

fn session_closed() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::BrokenPipe, "smux session closed")
}

pub struct SmuxSession {
    shared: Arc<Shared>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<SmuxStream>>,
}

impl std::fmt::Debug for SmuxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmuxSession")
            .field("streams", &self.num_streams())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SmuxSession {
    pub fn new<S>(conn: S, side: Side) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (data_tx, data_rx) = mpsc::channel(OUTGOING_CHANNEL_SIZE);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);
        let first_id = match side {
            Side::Client => 3,
            Side::Server => 2,
        };
        let shared = Arc::new(Shared {
            streams: Mutex::new(HashMap::new()),
            data_tx,
            control_tx,
            next_id: AtomicU32::new(first_id),
            cancel: CancellationToken::new(),
            epoch: Instant::now(),
            last_recv_millis: AtomicU64::new(0),
        });

        let conn = Arc::new(SerialStream::new(conn));
        let reader = conn.clone();
        let writer = conn;

        let reader_shared = shared.clone();
        tokio::spawn(async move {
            let cancel = reader_shared.cancel.clone();
            let result = tokio::select! {
                result = reader_loop(&reader, &reader_shared, accept_tx, side) => result,
                _ = cancel.cancelled() => Ok(()),
            };
            if let Err(e) = result {
                debug!("[Mux] smux session read ended: {e}");
            }
            reader_shared.close();
        });

        let writer_shared = shared.clone();
        tokio::spawn(async move {
            if let Err(e) = writer_loop(&writer, data_rx, control_rx, &writer_shared.cancel).await {
                debug!("[Mux] smux session write ended: {e}");
            }
            writer_shared.close();
        });

        let keepalive_shared = shared.clone();
        tokio::spawn(async move {
            keepalive_loop(&keepalive_shared).await;
        });

        Self {
            shared,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
        }
    }

    pub fn open_stream(&self) -> std::io::Result<SmuxStream> {
        if self.shared.is_closed() {
            return Err(session_closed());
        }
        let id = self.shared.next_id.fetch_add(2, Ordering::Relaxed);
        let stream = self.shared.register(id)?;
        self.shared
            .control_tx
            .send(Frame::Syn(id))
            .map_err(|_| session_closed())?;
        Ok(stream)
    }

    /// Waits for the next stream opened by the peer. `None` once the session is closed.
    pub async fn accept_stream(&self) -> Option<SmuxStream> {
        let mut accept_rx = self.accept_rx.lock().await;
        tokio::select! {
            stream = accept_rx.recv() => stream,
            _ = self.shared.cancel.cancelled() => None,
        }
    }

    pub fn num_streams(&self) -> usize {
        self.shared.streams.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn close(&self) {
        self.shared.close();
    }
}

async fn reader_loop<S: AsyncRead + AsyncWrite + Unpin>(
    reader: &SerialStream<S>,
    shared: &Arc<Shared>,
    accept_tx: mpsc::Sender<SmuxStream>,
    side: Side,
) -> std::io::Result<()> {
    let mut header = [0u8; HEADER_SIZE];
    loop {
        match reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        }
        shared.touch_recv();
        let version = header[0];
        let cmd = header[1];
        let len = u16::from_le_bytes([header[2], header[3]]) as usize;
        let sid = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if version != SMUX_VERSION {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid smux protocol version: {version}"),
            ));
        }

        match cmd {
            CMD_NOP => {}
            CMD_SYN => {
                if side == Side::Client {
                    debug!("[Mux] ignoring smux stream {sid} opened by server");
                    continue;
                }
                let stream = shared.register(sid)?;
                if let Err(mpsc::error::TrySendError::Full(stream)) = accept_tx.try_send(stream) {
                    warn!("[Mux] smux accept backlog full, dropping stream {}", stream.id);
                }
            }
            CMD_FIN => {
                shared.streams.lock().remove(&sid);
            }
            CMD_PSH => {
                let mut data = vec![0u8; len];
                reader.read_exact(&mut data).await?;
                if data.is_empty() {
                    continue;
                }
                let mut streams = shared.streams.lock();
                if let Some(sender) = streams.get(&sid)
                    && sender.send(Bytes::from(data)).is_err()
                {
                    streams.remove(&sid);
                }
            }
            unknown => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unknown smux command: {unknown}"),
                ));
            }
        }
    }
}

async fn writer_loop<S: AsyncRead + AsyncWrite + Unpin>(
    writer: &SerialStream<S>,
    mut data_rx: mpsc::Receiver<Frame>,
    mut control_rx: mpsc::UnboundedReceiver<Frame>,
    cancel: &CancellationToken,
) -> std::io::Result<()> {
    let mut buffer = BytesMut::with_capacity(WRITE_BATCH_SIZE + HEADER_SIZE + MAX_FRAME_SIZE);
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(frame) = control_rx.recv() => frame,
            Some(frame) = data_rx.recv() => frame,
            else => break,
        };
        buffer.clear();
        frame.encode(&mut buffer);
        // Control frames go first so a SYN always precedes its stream's data.
        while buffer.len() < WRITE_BATCH_SIZE {
            match control_rx.try_recv() {
                Ok(frame) => frame.encode(&mut buffer),
                Err(_) => match data_rx.try_recv() {
                    Ok(frame) => frame.encode(&mut buffer),
                    Err(_) => break,
                },
            }
        }
        writer.write_all(&buffer).await?;
    }
    let _ = writer.shutdown().await;
    Ok(())
}

async fn keepalive_loop(shared: &Arc<Shared>) {
    let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if shared.recv_idle_for() > KEEPALIVE_TIMEOUT {
            warn!("[Mux] smux session timed out");
            shared.close();
            return;
        }
        if shared.control_tx.send(Frame::Nop).is_err() {
            return;
        }
    }
}

/// A logical stream of a [`SmuxSession`].
pub struct SmuxStream {
    id: u32,
    shared: Arc<Shared>,
    data_rx: mpsc::UnboundedReceiver<Bytes>,
    read_buffer: Bytes,
    data_tx: PollSender<Frame>,
    write_closed: bool,
    fin_sent: bool,
}

impl std::fmt::Debug for SmuxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmuxStream").field("id", &self.id).finish()
    }
}

impl SmuxStream {
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl AsyncRead for SmuxStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.read_buffer.is_empty() {
            match ready!(self.data_rx.poll_recv(cx)) {
                Some(data) => self.read_buffer = data,
                None => return Poll::Ready(Ok(())),
            }
        }
        let n = self.read_buffer.len().min(buf.remaining());
        let chunk = self.read_buffer.split_to(n);
        buf.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for SmuxStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if self.write_closed {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "smux stream closed",
            )));
        }
        if self.shared.is_closed() {
            return Poll::Ready(Err(session_closed()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        ready!(self.data_tx.poll_reserve(cx)).map_err(|_| session_closed())?;
        let n = buf.len().min(MAX_FRAME_SIZE);
        let frame = Frame::Psh(self.id, Bytes::copy_from_slice(&buf[..n]));
        self.data_tx.send_item(frame).map_err(|_| session_closed())?;
        Poll::Ready(Ok(n))
    }

    /// Gathers the slices into a single PSH frame.
    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[std::io::IoSlice<'_>],
    ) -> Poll<std::io::Result<usize>> {
        if self.write_closed {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "smux stream closed",
            )));
        }
        if self.shared.is_closed() {
            return Poll::Ready(Err(session_closed()));
        }
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        if total == 0 {
            return Poll::Ready(Ok(0));
        }
        ready!(self.data_tx.poll_reserve(cx)).map_err(|_| session_closed())?;
        let mut payload = BytesMut::with_capacity(total.min(MAX_FRAME_SIZE));
        for buf in bufs {
            let take = buf.len().min(MAX_FRAME_SIZE - payload.len());
            payload.put_slice(&buf[..take]);
            if payload.len() == MAX_FRAME_SIZE {
                break;
            }
        }
        let n = payload.len();
        let frame = Frame::Psh(self.id, payload.freeze());
        self.data_tx.send_item(frame).map_err(|_| session_closed())?;
        Poll::Ready(Ok(n))
    }

    fn is_write_vectored(&self) -> bool {
        true
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        if self.fin_sent || self.shared.is_closed() {
            self.write_closed = true;
            return Poll::Ready(Ok(()));
        }
        self.write_closed = true;
        ready!(self.data_tx.poll_reserve(cx)).map_err(|_| session_closed())?;
        let frame = Frame::Fin(self.id);
        self.data_tx.send_item(frame).map_err(|_| session_closed())?;
        self.fin_sent = true;
        Poll::Ready(Ok(()))
    }
}

impl Drop for SmuxStream {
    fn drop(&mut self) {
        self.shared.streams.lock().remove(&self.id);
        if self.fin_sent || self.shared.is_closed() {
            return;
        }
        // Queue behind any data this stream already wrote.
        match self.shared.data_tx.try_send(Frame::Fin(self.id)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(frame)) => {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let data_tx = self.shared.data_tx.clone();
                    handle.spawn(async move {
                        let _ = data_tx.send(frame).await;
                    });
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

impl ExtendedRead for SmuxStream {}
impl ExtendedWrite for SmuxStream {}
impl Upstream for SmuxStream {
    fn need_additional_read_deadline(&self) -> bool {
        true
    }
}
impl AsyncStream for SmuxStream {}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn pair() -> (SmuxSession, SmuxSession) {
        let (a, b) = tokio::io::duplex(1 << 20);
        (SmuxSession::new(a, Side::Client), SmuxSession::new(b, Side::Server))
    }

    #[test]
    fn test_frame_header_layout() {
        let mut out = BytesMut::new();
        Frame::Psh(3, Bytes::from_static(b"hi")).encode(&mut out);
        assert_eq!(&out[..], &[1, CMD_PSH, 2, 0, 3, 0, 0, 0, b'h', b'i']);
        out.clear();
        Frame::Nop.encode(&mut out);
        assert_eq!(&out[..], &[1, CMD_NOP, 0, 0, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_open_accept_echo() {
        let (client, server) = pair();
        let mut stream = client.open_stream().unwrap();
        assert_eq!(stream.id(), 3);
        stream.write_all(b"ping").await.unwrap();

        let mut accepted = server.accept_stream().await.unwrap();
        assert_eq!(accepted.id(), 3);
        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        accepted.write_all(b"pong").await.unwrap();
        accepted.shutdown().await.unwrap();

        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"pong");
        assert_eq!(client.open_stream().unwrap().id(), 5);
    }

    #[tokio::test]
    async fn test_large_write_is_split_into_frames() {
        let (client, server) = pair();
        let data: Vec<u8> = (0..MAX_FRAME_SIZE * 3 + 17).map(|i| i as u8).collect();
        let expected = data.clone();
        let mut stream = client.open_stream().unwrap();
        let writer = tokio::spawn(async move {
            stream.write_all(&data).await.unwrap();
            stream.shutdown().await.unwrap();
            stream
        });
        let mut accepted = server.accept_stream().await.unwrap();
        let mut received = Vec::new();
        accepted.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, expected);
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_streams_are_independent() {
        let (client, server) = pair();
        let mut first = client.open_stream().unwrap();
        let mut second = client.open_stream().unwrap();
        first.write_all(b"one").await.unwrap();
        second.write_all(b"two").await.unwrap();
        first.shutdown().await.unwrap();

        let mut a = server.accept_stream().await.unwrap();
        let mut b = server.accept_stream().await.unwrap();
        let mut out = Vec::new();
        a.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"one");

        let mut buf = [0u8; 3];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"two");
        assert_eq!(client.num_streams(), 2);
        drop(first);
        assert_eq!(client.num_streams(), 1);
    }

    #[tokio::test]
    async fn test_close_ends_streams() {
        let (client, server) = pair();
        let mut stream = client.open_stream().unwrap();
        stream.write_all(b"x").await.unwrap();
        let mut accepted = server.accept_stream().await.unwrap();

        client.close();
        assert!(client.is_closed());
        assert!(stream.write_all(b"y").await.is_err());
        let mut out = Vec::new();
        accepted.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"x");
        assert!(server.accept_stream().await.is_none());
        assert!(client.open_stream().is_err());
    }

    #[tokio::test]
    async fn test_vectored_write_is_one_frame() {
        let (client, server) = pair();
        let mut stream = client.open_stream().unwrap();
        let slices = [std::io::IoSlice::new(b"ab"), std::io::IoSlice::new(b"cd")];
        assert!(stream.is_write_vectored());
        assert_eq!(stream.write_vectored(&slices).await.unwrap(), 4);

        let mut accepted = server.accept_stream().await.unwrap();
        let mut buf = [0u8; 4];
        let n = accepted.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abcd");
    }

    #[tokio::test]
    async fn test_unread_stream_does_not_block_others() {
        let (client, server) = pair();
        let mut idle = client.open_stream().unwrap();
        let mut busy = client.open_stream().unwrap();
        let _idle_accepted = server.accept_stream().await.unwrap();
        let mut busy_accepted = server.accept_stream().await.unwrap();

        let chunk = [7u8; 1024];
        for _ in 0..64 {
            idle.write_all(&chunk).await.unwrap();
        }
        busy.write_all(b"z").await.unwrap();

        let mut buf = [0u8; 1];
        tokio::time::timeout(Duration::from_secs(2), busy_accepted.read_exact(&mut buf))
            .await
            .expect("stream blocked behind an unread sibling")
            .unwrap();
        assert_eq!(&buf, b"z");
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out() {
        let (a, _peer) = tokio::io::duplex(1 << 20);
        let session = SmuxSession::new(a, Side::Client);
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(!session.is_closed());
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(session.is_closed());
    }
}
