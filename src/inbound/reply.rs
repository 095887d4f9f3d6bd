//! Defers the protocol reply to the client until the outbound dial has finished.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::ready;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::address::NetLocation;
use crate::buf::Buffer;
use crate::bufio::{AsyncStream, ExtendedRead, ExtendedWrite, Layer, Upstream};
use crate::http_handler::HttpRequest;
use crate::socks_handler::{REPLY_SUCCESS, encode_reply, reply_code};

/// What the client is waiting to hear once the outbound is up or has failed.
#[derive(Debug, Clone)]
pub enum Reply {
    Socks,
    Http {
        success: Option<Vec<u8>>,
        failure: Vec<u8>,
    },
}

impl Reply {
    pub fn http(request: &HttpRequest) -> Self {
        Reply::Http {
            success: request.success_response(),
            failure: request.failure_response(),
        }
    }

    fn success(&self) -> Option<Vec<u8>> {
        match self {
            Reply::Socks => Some(encode_reply(REPLY_SUCCESS, &NetLocation::UNSPECIFIED)),
            Reply::Http { success, .. } => success.clone(),
        }
    }

    fn failure(&self, error: &std::io::Error) -> Option<Vec<u8>> {
        match self {
            Reply::Socks => Some(encode_reply(reply_code(error), &NetLocation::UNSPECIFIED)),
            Reply::Http { failure, .. } => Some(failure.clone()),
        }
    }
}

#[derive(Debug)]
enum ReplyState {
    Waiting,
    Writing(Vec<u8>, usize),
    Flushing,
    Done,
}

/// An accepted client stream whose handshake reply is written when the tunnel reports the dial
/// outcome. Writing relayed data before that implies success.
#[derive(Debug)]
pub struct ReplyStream<S> {
    inner: S,
    reply: Reply,
    state: ReplyState,
}

impl<S: AsyncWrite + Unpin> ReplyStream<S> {
    pub fn new(inner: S, reply: Reply) -> Self {
        Self {
            inner,
            reply,
            state: ReplyState::Waiting,
        }
    }

    fn poll_reply(
        &mut self,
        cx: &mut Context<'_>,
        make: impl FnOnce(&Reply) -> Option<Vec<u8>>,
    ) -> Poll<std::io::Result<()>> {
        let mut make = Some(make);
        loop {
            match &mut self.state {
                ReplyState::Waiting => {
                    let reply = make.take().and_then(|make| make(&self.reply));
                    self.state = match reply {
                        Some(bytes) => ReplyState::Writing(bytes, 0),
                        None => ReplyState::Done,
                    };
                }
                ReplyState::Writing(bytes, written) => {
                    while *written < bytes.len() {
                        let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &bytes[*written..]))?;
                        if n == 0 {
                            return Poll::Ready(Err(std::io::ErrorKind::WriteZero.into()));
                        }
                        *written += n;
                    }
                    self.state = ReplyState::Flushing;
                }
                ReplyState::Flushing => {
                    ready!(Pin::new(&mut self.inner).poll_flush(cx))?;
                    self.state = ReplyState::Done;
                }
                ReplyState::Done => return Poll::Ready(Ok(())),
            }
        }
    }

    fn poll_implied_success(&mut self, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        if matches!(self.state, ReplyState::Done) {
            return Poll::Ready(Ok(()));
        }
        self.poll_reply(cx, Reply::success)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ReplyStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ReplyStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_implied_success(cx))?;
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl<S: ExtendedRead + AsyncWrite + Unpin> ExtendedRead for ReplyStream<S> {
    fn poll_read_buffer(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buffer: &mut Buffer,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read_buffer(cx, buffer)
    }
}

impl<S: ExtendedWrite + Unpin> ExtendedWrite for ReplyStream<S> {
    fn front_headroom(&self) -> usize {
        self.inner.front_headroom()
    }

    fn rear_headroom(&self) -> usize {
        self.inner.rear_headroom()
    }

    fn poll_write_buffer(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buffer: &mut Buffer,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_implied_success(cx))?;
        Pin::new(&mut this.inner).poll_write_buffer(cx, buffer)
    }
}

impl<S: Upstream> Upstream for ReplyStream<S> {
    fn layer(&self) -> Layer {
        match self.state {
            ReplyState::Done => Layer::Passthrough,
            _ => Layer::Transforming,
        }
    }

    fn upstream(&self) -> Option<&dyn Upstream> {
        Some(&self.inner)
    }
}

impl<S: AsyncStream> AsyncStream for ReplyStream<S> {
    fn supports_half_close(&self) -> bool {
        self.inner.supports_half_close()
    }

    fn poll_handshake_success(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.get_mut().poll_implied_success(cx)
    }

    fn poll_handshake_failure(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        error: &std::io::Error,
    ) -> Poll<std::io::Result<()>> {
        self.get_mut().poll_reply(cx, |reply| reply.failure(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bufio::{report_handshake_failure, report_handshake_success};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_socks_success_written_once() {
        let (client, server) = tokio::io::duplex(1024);
        let mut stream = ReplyStream::new(server, Reply::Socks);
        report_handshake_success(&mut stream).await.unwrap();
        report_handshake_success(&mut stream).await.unwrap();
        stream.write_all(b"data").await.unwrap();
        drop(stream);

        let mut client = client;
        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        let mut expected = encode_reply(REPLY_SUCCESS, &NetLocation::UNSPECIFIED);
        expected.extend_from_slice(b"data");
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_socks_failure_maps_error() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut stream = ReplyStream::new(server, Reply::Socks);
        let error = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        report_handshake_failure(&mut stream, &error).await.unwrap();
        drop(stream);

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, encode_reply(reply_code(&error), &NetLocation::UNSPECIFIED));
    }

    #[tokio::test]
    async fn test_write_implies_success() {
        let (mut client, server) = tokio::io::duplex(1024);
        let reply = Reply::Http {
            success: Some(b"HTTP/1.1 200 Connection established\r\n\r\n".to_vec()),
            failure: b"HTTP/1.1 502 Bad Gateway\r\n\r\n".to_vec(),
        };
        let mut stream = ReplyStream::new(server, reply);
        assert_eq!(stream.layer(), Layer::Transforming);
        stream.write_all(b"x").await.unwrap();
        assert_eq!(stream.layer(), Layer::Passthrough);
        drop(stream);

        let mut received = String::new();
        client.read_to_string(&mut received).await.unwrap();
        assert_eq!(received, "HTTP/1.1 200 Connection established\r\n\r\nx");
    }

    #[tokio::test]
    async fn test_http_forward_has_no_success_reply() {
        let (mut client, server) = tokio::io::duplex(1024);
        let reply = Reply::Http {
            success: None,
            failure: Vec::new(),
        };
        let mut stream = ReplyStream::new(server, reply);
        report_handshake_success(&mut stream).await.unwrap();
        stream.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").await.unwrap();
        drop(stream);

        let mut received = String::new();
        client.read_to_string(&mut received).await.unwrap();
        assert_eq!(received, "HTTP/1.1 204 No Content\r\n\r\n");
    }
}
