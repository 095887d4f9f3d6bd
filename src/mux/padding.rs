//! Random padding around the first frames of a mux connection.
//!
//! The first 16 reads and writes are framed as `u16 data length | u16 padding length | data |
//! padding`, after which the stream carries raw bytes.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::ready;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::bufio::{AsyncStream, ExtendedRead, ExtendedWrite, Layer, Upstream};

pub const FIRST_PADDINGS: u8 = 16;

const MAX_CHUNK: usize = 65535;
const HEADER_LEN: usize = 4;

pub struct PaddingStream<S> {
    inner: S,
    reads_done: u8,
    header: [u8; HEADER_LEN],
    header_len: usize,
    read_remaining: usize,
    padding_remaining: usize,
    writes_done: u8,
    pending: Vec<u8>,
    pending_pos: usize,
}

impl<S> PaddingStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            reads_done: 0,
            header: [0u8; HEADER_LEN],
            header_len: 0,
            read_remaining: 0,
            padding_remaining: 0,
            writes_done: 0,
            pending: Vec::new(),
            pending_pos: 0,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    fn framing_done(&self) -> bool {
        self.reads_done >= FIRST_PADDINGS
            && self.writes_done >= FIRST_PADDINGS
            && self.read_remaining == 0
            && self.padding_remaining == 0
            && self.pending_pos == self.pending.len()
    }
}

fn encode_frame(data: &[u8], out: &mut Vec<u8>) {
    let mut rng = rand::rng();
    let padding_len: usize = rng.random_range(256..768);
    out.clear();
    out.reserve(HEADER_LEN + data.len() + padding_len);
    out.extend_from_slice(&(data.len() as u16).to_be_bytes());
    out.extend_from_slice(&(padding_len as u16).to_be_bytes());
    out.extend_from_slice(data);
    out.resize(out.len() + padding_len, 0);
}

impl<S: AsyncWrite + Unpin> PaddingStream<S> {
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
}

impl<S: AsyncRead + Unpin> AsyncRead for PaddingStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        loop {
            if this.read_remaining > 0 {
                let limit = this.read_remaining.min(buf.remaining());
                let dst = buf.initialize_unfilled_to(limit);
                let mut limited = ReadBuf::new(dst);
                ready!(Pin::new(&mut this.inner).poll_read(cx, &mut limited))?;
                let n = limited.filled().len();
                if n == 0 {
                    return Poll::Ready(Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "truncated padded frame",
                    )));
                }
                buf.advance(n);
                this.read_remaining -= n;
                return Poll::Ready(Ok(()));
            }

            if this.padding_remaining > 0 {
                let mut scratch = [0u8; 1024];
                let limit = this.padding_remaining.min(scratch.len());
                let mut discard = ReadBuf::new(&mut scratch[..limit]);
                ready!(Pin::new(&mut this.inner).poll_read(cx, &mut discard))?;
                let n = discard.filled().len();
                if n == 0 {
                    return Poll::Ready(Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "truncated frame padding",
                    )));
                }
                this.padding_remaining -= n;
                continue;
            }

            if this.reads_done < FIRST_PADDINGS {
                let mut header = ReadBuf::new(&mut this.header[this.header_len..]);
                ready!(Pin::new(&mut this.inner).poll_read(cx, &mut header))?;
                let n = header.filled().len();
                if n == 0 {
                    if this.header_len == 0 {
                        return Poll::Ready(Ok(()));
                    }
                    return Poll::Ready(Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "truncated padding header",
                    )));
                }
                this.header_len += n;
                if this.header_len < HEADER_LEN {
                    continue;
                }
                this.header_len = 0;
                this.reads_done += 1;
                this.read_remaining = u16::from_be_bytes([this.header[0], this.header[1]]) as usize;
                this.padding_remaining =
                    u16::from_be_bytes([this.header[2], this.header[3]]) as usize;
                continue;
            }

            return Pin::new(&mut this.inner).poll_read(cx, buf);
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PaddingStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        if this.writes_done >= FIRST_PADDINGS || buf.is_empty() {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        }
        let data = &buf[..buf.len().min(MAX_CHUNK)];
        encode_frame(data, &mut this.pending);
        this.writes_done += 1;
        // The frame now owns the data; a pending drain finishes on the next write or flush.
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

impl<S: AsyncRead + Unpin> ExtendedRead for PaddingStream<S> {}
impl<S: AsyncWrite + Unpin> ExtendedWrite for PaddingStream<S> {}

impl<S: Upstream> Upstream for PaddingStream<S> {
    fn layer(&self) -> Layer {
        if self.framing_done() {
            Layer::Passthrough
        } else {
            Layer::Transforming
        }
    }

    fn upstream(&self) -> Option<&dyn Upstream> {
        Some(&self.inner)
    }
}

impl<S: AsyncStream> AsyncStream for PaddingStream<S> {}
