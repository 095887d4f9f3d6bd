//! Buffered parsing of handshake headers from a stream, keeping whatever was read past them.

use memchr::memchr;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::buf::Buffer;

const DEFAULT_BUFFER_SIZE: usize = 8192;

pub struct StreamReader {
    buf: Box<[u8]>,
    start: usize,
    end: usize,
}

impl StreamReader {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE)
    }

    /// `capacity` is also the longest line or slice that can be read.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            start: 0,
            end: 0,
        }
    }

    fn available(&self) -> usize {
        self.end - self.start
    }

    fn consume(&mut self, n: usize) {
        self.start += n;
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    async fn fill<T: AsyncRead + Unpin + ?Sized>(&mut self, stream: &mut T) -> std::io::Result<()> {
        if self.start > 0 {
            self.buf.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
        if self.end == self.buf.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "header too long",
            ));
        }
        let n = stream.read(&mut self.buf[self.end..]).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "EOF while reading",
            ));
        }
        self.end += n;
        Ok(())
    }

    async fn fill_to<T: AsyncRead + Unpin + ?Sized>(
        &mut self,
        stream: &mut T,
        len: usize,
    ) -> std::io::Result<()> {
        if len > self.buf.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("requested length {len} exceeds buffer size {}", self.buf.len()),
            ));
        }
        while self.available() < len {
            self.fill(stream).await?;
        }
        Ok(())
    }

    pub async fn peek_u8<T: AsyncRead + Unpin + ?Sized>(&mut self, stream: &mut T) -> std::io::Result<u8> {
        self.fill_to(stream, 1).await?;
        Ok(self.buf[self.start])
    }

    pub async fn read_u8<T: AsyncRead + Unpin + ?Sized>(&mut self, stream: &mut T) -> std::io::Result<u8> {
        self.fill_to(stream, 1).await?;
        let value = self.buf[self.start];
        self.consume(1);
        Ok(value)
    }

    pub async fn read_u16_be<T: AsyncRead + Unpin + ?Sized>(
        &mut self,
        stream: &mut T,
    ) -> std::io::Result<u16> {
        self.fill_to(stream, 2).await?;
        let value = u16::from_be_bytes([self.buf[self.start], self.buf[self.start + 1]]);
        self.consume(2);
        Ok(value)
    }

    pub async fn read_slice<T: AsyncRead + Unpin + ?Sized>(
        &mut self,
        stream: &mut T,
        len: usize,
    ) -> std::io::Result<&[u8]> {
        self.fill_to(stream, len).await?;
        let start = self.start;
        self.start += len;
        // Offsets are reset on the next fill rather than here, so the slice stays valid.
        Ok(&self.buf[start..start + len])
    }

    /// Reads one line without its `\n` or `\r\n` terminator.
    pub async fn read_line<T: AsyncRead + Unpin + ?Sized>(
        &mut self,
        stream: &mut T,
    ) -> std::io::Result<&str> {
        loop {
            if let Some(pos) = memchr(b'\n', &self.buf[self.start..self.end]) {
                let line_start = self.start;
                let newline = line_start + pos;
                let line_end = if newline > line_start && self.buf[newline - 1] == b'\r' {
                    newline - 1
                } else {
                    newline
                };
                self.start = newline + 1;
                return std::str::from_utf8(&self.buf[line_start..line_end]).map_err(|e| {
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("failed to decode utf8: {e}"),
                    )
                });
            }
            self.fill(stream).await?;
        }
    }

    pub fn unparsed_data(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    /// Bytes read past the parsed header, for replay through a `CachedStream`.
    pub fn into_cache(self) -> Option<Buffer> {
        let data = self.unparsed_data();
        (!data.is_empty()).then(|| Buffer::from_slice(data))
    }
}

impl Default for StreamReader {
    fn default() -> Self {
        Self::new()
    }
}
