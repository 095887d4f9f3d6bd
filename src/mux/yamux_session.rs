//! yamux sessions backed by the `yamux` crate.
//!
//! `yamux::Connection` must be polled continuously to make progress, so a driver task owns it and
//! serves open requests over a channel. Streams are adapted to tokio I/O through
//! `tokio_util::compat`.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};

use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tokio_util::sync::CancellationToken;

use super::smux::Side;
use crate::bufio::{AsyncStream, ExtendedRead, ExtendedWrite, Upstream};

const ACCEPT_BACKLOG: usize = 256;

type OpenReply = oneshot::Sender<std::io::Result<yamux::Stream>>;

fn connection_error(e: yamux::ConnectionError) -> std::io::Error {
    std::io::Error::other(format!("yamux: {e}"))
}

pub struct YamuxSession {
    open_tx: mpsc::UnboundedSender<OpenReply>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<yamux::Stream>>,
    num_streams: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for YamuxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("YamuxSession")
            .field("streams", &self.num_streams())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl YamuxSession {
    pub fn new<S>(conn: S, side: Side) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mode = match side {
            Side::Client => yamux::Mode::Client,
            Side::Server => yamux::Mode::Server,
        };
        let connection = yamux::Connection::new(conn.compat(), yamux::Config::default(), mode);
        let (open_tx, open_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);
        let cancel = CancellationToken::new();

        let driver_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = drive(connection, open_rx, accept_tx, side, &driver_cancel).await {
                debug!("[Mux] yamux session ended: {e}");
            }
            driver_cancel.cancel();
        });

        Self {
            open_tx,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            num_streams: Arc::new(AtomicUsize::new(0)),
            cancel,
        }
    }

    pub async fn open_stream(&self) -> std::io::Result<YamuxStream> {
        if self.is_closed() {
            return Err(session_closed());
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.open_tx.send(reply_tx).map_err(|_| session_closed())?;
        let stream = reply_rx.await.map_err(|_| session_closed())??;
        Ok(YamuxStream::new(stream, self.num_streams.clone()))
    }

    pub async fn accept_stream(&self) -> Option<YamuxStream> {
        let mut accept_rx = self.accept_rx.lock().await;
        let stream = tokio::select! {
            stream = accept_rx.recv() => stream?,
            _ = self.cancel.cancelled() => return None,
        };
        Some(YamuxStream::new(stream, self.num_streams.clone()))
    }

    pub fn num_streams(&self) -> usize {
        self.num_streams.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

fn session_closed() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::BrokenPipe, "yamux session closed")
}

async fn drive<T>(
    mut connection: yamux::Connection<T>,
    mut open_rx: mpsc::UnboundedReceiver<OpenReply>,
    accept_tx: mpsc::Sender<yamux::Stream>,
    side: Side,
    cancel: &CancellationToken,
) -> std::io::Result<()>
where
    T: futures::AsyncRead + futures::AsyncWrite + Unpin + Send + 'static,
{
    let mut pending_opens: VecDeque<OpenReply> = VecDeque::new();
    let mut handle_dropped = false;

    let result = {
        let run = futures::future::poll_fn(|cx| {
            loop {
                while !handle_dropped {
                    match open_rx.poll_recv(cx) {
                        Poll::Ready(Some(reply)) => pending_opens.push_back(reply),
                        Poll::Ready(None) => handle_dropped = true,
                        Poll::Pending => break,
                    }
                }

                while !pending_opens.is_empty() {
                    match connection.poll_new_outbound(cx) {
                        Poll::Ready(result) => {
                            if let Some(reply) = pending_opens.pop_front() {
                                let _ = reply.send(result.map_err(connection_error));
                            }
                        }
                        Poll::Pending => break,
                    }
                }

                match connection.poll_next_inbound(cx) {
                    Poll::Ready(Some(Ok(stream))) => {
                        if side == Side::Client {
                            debug!("[Mux] ignoring yamux stream opened by server");
                            continue;
                        }
                        if let Err(mpsc::error::TrySendError::Full(_)) = accept_tx.try_send(stream)
                        {
                            warn!("[Mux] yamux accept backlog full, dropping stream");
                        }
                    }
                    Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(connection_error(e))),
                    Poll::Ready(None) => return Poll::Ready(Ok(())),
                    Poll::Pending => return Poll::Pending,
                }
            }
        });
        tokio::select! {
            result = run => Some(result),
            _ = cancel.cancelled() => None,
        }
    };

    for reply in pending_opens.drain(..) {
        let _ = reply.send(Err(session_closed()));
    }
    match result {
        Some(result) => result,
        None => futures::future::poll_fn(|cx| connection.poll_close(cx))
            .await
            .map_err(connection_error),
    }
}

/// A logical yamux stream. Reads that fail because the stream or session went away end with EOF.
pub struct YamuxStream {
    inner: Compat<yamux::Stream>,
    num_streams: Arc<AtomicUsize>,
}

impl YamuxStream {
    fn new(stream: yamux::Stream, num_streams: Arc<AtomicUsize>) -> Self {
        num_streams.fetch_add(1, Ordering::Relaxed);
        Self {
            inner: stream.compat(),
            num_streams,
        }
    }
}

impl Drop for YamuxStream {
    fn drop(&mut self) {
        self.num_streams.fetch_sub(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for YamuxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("YamuxStream").finish()
    }
}

fn is_stream_closed(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::WriteZero
    )
}

impl AsyncRead for YamuxStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match Pin::new(&mut self.inner).poll_read(cx, buf) {
            Poll::Ready(Err(e)) if is_stream_closed(&e) => Poll::Ready(Ok(())),
            other => other,
        }
    }
}

impl AsyncWrite for YamuxStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl ExtendedRead for YamuxStream {}
impl ExtendedWrite for YamuxStream {}
impl Upstream for YamuxStream {
    // Reads are served by the session driver, not a socket of its own.
    fn need_additional_read_deadline(&self) -> bool {
        true
    }
}
impl AsyncStream for YamuxStream {}
