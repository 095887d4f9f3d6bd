//! Shared-reference access to streams and packet conns with at most one reader at a time.
//!
//! Reads and writes only hold the inner lock for the duration of a single poll, so a pending
//! read never blocks writers. Two overlapping reads are a programming error and panic.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use futures::future::poll_fn;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::{PacketConn, PacketRead, PacketWrite};
use crate::address::NetLocation;
use crate::buf::Buffer;

struct ReadGuard<'a>(&'a AtomicBool);

impl<'a> ReadGuard<'a> {
    fn acquire(flag: &'a AtomicBool, what: &str) -> Self {
        if flag.swap(true, Ordering::AcqRel) {
            panic!("concurrent read on {what}");
        }
        Self(flag)
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SerialStream<S> {
    inner: Mutex<S>,
    reading: AtomicBool,
}

impl<S: AsyncRead + AsyncWrite + Unpin> SerialStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner: Mutex::new(inner),
            reading: AtomicBool::new(false),
        }
    }

    /// Fills `buf` completely under a single read claim. EOF before that is `UnexpectedEof`.
    pub async fn read_exact(&self, buf: &mut [u8]) -> std::io::Result<()> {
        let _guard = ReadGuard::acquire(&self.reading, "serial stream");
        let mut filled = 0;
        while filled < buf.len() {
            let n = poll_fn(|cx| {
                let mut inner = self.inner.lock();
                let mut read_buf = ReadBuf::new(&mut buf[filled..]);
                Pin::new(&mut *inner)
                    .poll_read(cx, &mut read_buf)
                    .map_ok(|()| read_buf.filled().len())
            })
            .await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "early eof",
                ));
            }
            filled += n;
        }
        Ok(())
    }

    pub async fn write_all(&self, mut data: &[u8]) -> std::io::Result<()> {
        while !data.is_empty() {
            let n = poll_fn(|cx| Pin::new(&mut *self.inner.lock()).poll_write(cx, data)).await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "write zero byte into writer",
                ));
            }
            data = &data[n..];
        }
        poll_fn(|cx| Pin::new(&mut *self.inner.lock()).poll_flush(cx)).await
    }

    pub async fn shutdown(&self) -> std::io::Result<()> {
        poll_fn(|cx| Pin::new(&mut *self.inner.lock()).poll_shutdown(cx)).await
    }

}

pub struct SerialPacketConn<P> {
    inner: Mutex<P>,
    reading: AtomicBool,
}

impl<P: PacketConn> SerialPacketConn<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner: Mutex::new(inner),
            reading: AtomicBool::new(false),
        }
    }

    pub async fn read_packet(&self, buffer: &mut Buffer) -> std::io::Result<NetLocation> {
        let _guard = ReadGuard::acquire(&self.reading, "serial packet conn");
        poll_fn(|cx| Pin::new(&mut *self.inner.lock()).poll_read_packet(cx, buffer)).await
    }

    pub async fn write_packet(
        &self,
        buffer: &mut Buffer,
        destination: &NetLocation,
    ) -> std::io::Result<()> {
        poll_fn(|cx| self.poll_write_packet(cx, buffer, destination)).await
    }

    pub fn poll_write_packet(
        &self,
        cx: &mut Context<'_>,
        buffer: &mut Buffer,
        destination: &NetLocation,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.inner.lock()).poll_write_packet(cx, buffer, destination)
    }
}
