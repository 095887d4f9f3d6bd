//! Server side of the multiplexer: accepts sessions and hands each logical stream to a handler.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::brutal::{self, BrutalOptions};
use super::conn::{MuxPacketConn, ServerStream};
use super::padding::PaddingStream;
use super::protocol::{StreamRequest, read_session_request, read_stream_request};
use super::session::{MuxStream, Session};
use super::smux::Side;
use crate::buf::{Buffer, UDP_BUFFER_SIZE};
use crate::bufio::{
    AsyncStream, CachedPacketConn, DeadlineStream, find_capability, need_additional_read_deadline,
    read_packet,
};
use crate::handler::ConnectionHandler;
use crate::metadata::{Metadata, Network};

const SESSION_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const STREAM_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

fn timed_out(what: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::TimedOut, format!("{what} timed out"))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceOptions {
    /// Refuse sessions that did not negotiate padding.
    #[serde(default)]
    pub padding: bool,
    #[serde(default)]
    pub brutal: Option<BrutalOptions>,
}

#[derive(Debug, Clone)]
pub struct Service {
    padding_required: bool,
    brutal: Option<BrutalOptions>,
}

impl Service {
    pub fn new(options: &ServiceOptions) -> Self {
        Self {
            padding_required: options.padding,
            brutal: options.brutal,
        }
    }

    /// Serves one physical connection until the peer closes it or `cancel` fires.
    pub async fn new_connection(
        &self,
        mut conn: Box<dyn AsyncStream>,
        metadata: Metadata,
        handler: Arc<dyn ConnectionHandler>,
        cancel: CancellationToken,
    ) -> std::io::Result<()> {
        let socket = match self.brutal {
            Some(_) => find_capability(&conn, |node| {
                node.tcp_stream()
                    .and_then(|tcp| socket2::SockRef::from(tcp).try_clone().ok())
            }),
            None => None,
        };

        let request = tokio::time::timeout(SESSION_REQUEST_TIMEOUT, read_session_request(&mut conn))
            .await
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::TimedOut, "read session request timed out")
            })??;
        if self.padding_required && !request.padding {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "invalid connection, padding required",
            ));
        }
        let conn: Box<dyn AsyncStream> = if request.padding {
            Box::new(PaddingStream::new(conn))
        } else {
            conn
        };
        let session = Session::new(conn, request.protocol, Side::Server)?;
        debug!(
            "[Mux] accepted {} session v{} from {}",
            request.protocol, request.version, metadata.source
        );

        let socket = Arc::new(socket);
        loop {
            let stream = tokio::select! {
                stream = session.accept() => stream,
                _ = cancel.cancelled() => break,
            };
            let Some(stream) = stream else {
                break;
            };
            let metadata = metadata.clone();
            let handler = handler.clone();
            let socket = socket.clone();
            let brutal = self.brutal;
            tokio::spawn(async move {
                if let Err(e) = handle_stream(stream, metadata, handler, socket, brutal).await {
                    warn!("[Mux] {e}");
                }
            });
        }
        session.close();
        Ok(())
    }
}

/// Reads the stream request within `STREAM_REQUEST_TIMEOUT`.
///
/// Session streams are fed by the session reader and have no socket deadline of their own, so
/// they get a `DeadlineStream` that stays in the chain for later reads.
async fn read_request(stream: MuxStream) -> std::io::Result<(StreamRequest, MuxStream)> {
    if need_additional_read_deadline(&stream) {
        let mut stream = DeadlineStream::new(stream);
        stream.set_read_deadline(Some(tokio::time::Instant::now() + STREAM_REQUEST_TIMEOUT));
        let request = read_stream_request(&mut stream).await?;
        stream.set_read_deadline(None);
        return Ok((request, Box::new(stream)));
    }
    let mut stream = stream;
    let request = tokio::time::timeout(STREAM_REQUEST_TIMEOUT, read_stream_request(&mut stream))
        .await
        .map_err(|_| timed_out("read stream request"))??;
    Ok((request, stream))
}

async fn handle_stream(
    stream: MuxStream,
    mut metadata: Metadata,
    handler: Arc<dyn ConnectionHandler>,
    socket: Arc<Option<socket2::Socket>>,
    brutal: Option<BrutalOptions>,
) -> std::io::Result<()> {
    let (request, mut stream) = read_request(stream).await.map_err(|e| {
        std::io::Error::new(e.kind(), format!("read multiplex stream request: {e}"))
    })?;

    if brutal::is_brutal_exchange(&request.destination) {
        return brutal::serve_exchange(&mut stream, (*socket).as_ref(), brutal.as_ref())
            .await;
    }

    metadata.network = request.network;
    metadata.destination = request.destination.clone();
    metadata.dst_ip = request.destination.address().ip();
    match request.network {
        Network::Tcp => {
            debug!("[Mux] inbound stream {metadata}");
            handler
                .new_connection(Box::new(ServerStream::new(stream)), metadata)
                .await;
        }
        Network::Udp if request.packet_addr => {
            // Every packet names its own destination; route on the first one.
            let mut conn = MuxPacketConn::server(stream, &request);
            let mut first = Buffer::new(UDP_BUFFER_SIZE);
            let destination =
                tokio::time::timeout(STREAM_REQUEST_TIMEOUT, read_packet(&mut conn, &mut first))
                    .await
                    .map_err(|_| timed_out("read first packet"))??;
            metadata.dst_ip = destination.address().ip();
            metadata.destination = destination.clone();
            debug!("[Mux] inbound packet stream {metadata}");
            let conn = CachedPacketConn::new(conn, vec![(first, destination)]);
            handler
                .new_packet_connection(Box::new(conn), metadata)
                .await;
        }
        Network::Udp => {
            debug!("[Mux] inbound packet stream {metadata}");
            handler
                .new_packet_connection(Box::new(MuxPacketConn::server(stream, &request)), metadata)
                .await;
        }
    }
    Ok(())
}
