//! Client side of the multiplexer: keeps a small pool of sessions and opens streams on them.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use super::brutal::{self, BrutalOptions};
use super::conn::{ClientStream, MuxPacketConn};
use super::padding::PaddingStream;
use super::protocol::{Protocol, SessionRequest, StreamRequest};
use super::session::{MuxStream, Session};
use super::smux::Side;
use crate::address::NetLocation;
use crate::bufio::{AsyncStream, PacketConn, find_capability};

const DEFAULT_MIN_STREAMS: usize = 8;
const OPEN_ATTEMPTS: usize = 2;

/// Opens the physical connections that sessions run on.
#[async_trait]
pub trait MuxDialer: Send + Sync + Debug {
    async fn dial(&self) -> std::io::Result<Box<dyn AsyncStream>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientOptions {
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub max_connections: usize,
    #[serde(default)]
    pub min_streams: usize,
    #[serde(default)]
    pub max_streams: usize,
    #[serde(default)]
    pub padding: bool,
    #[serde(default)]
    pub brutal: Option<BrutalOptions>,
}

fn default_protocol() -> String {
    "smux".to_string()
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            max_connections: 0,
            min_streams: 0,
            max_streams: 0,
            padding: false,
            brutal: None,
        }
    }
}

#[derive(Debug)]
pub struct Client {
    dialer: Arc<dyn MuxDialer>,
    protocol: Protocol,
    padding: bool,
    max_connections: usize,
    min_streams: usize,
    max_streams: usize,
    brutal: Option<BrutalOptions>,
    sessions: tokio::sync::Mutex<Vec<Arc<Session>>>,
}

impl Client {
    pub fn new(dialer: Arc<dyn MuxDialer>, options: &ClientOptions) -> std::io::Result<Self> {
        let protocol = Protocol::from_name(&options.protocol)?;
        if protocol == Protocol::H2Mux {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "unsupported protocol: h2mux",
            ));
        }
        let mut min_streams = options.min_streams;
        if options.max_connections == 0 && options.max_streams == 0 && min_streams == 0 {
            min_streams = DEFAULT_MIN_STREAMS;
        }
        // Brutal pins the rate on one socket, so everything shares a single connection.
        let max_connections = if options.brutal.is_some() {
            1
        } else {
            options.max_connections
        };
        Ok(Self {
            dialer,
            protocol,
            padding: options.padding,
            max_connections,
            min_streams,
            max_streams: options.max_streams,
            brutal: options.brutal,
            sessions: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    pub async fn dial_tcp(&self, destination: NetLocation) -> std::io::Result<Box<dyn AsyncStream>> {
        let stream = self.open_stream().await?;
        Ok(Box::new(ClientStream::new(
            stream,
            &StreamRequest::tcp(destination),
        )))
    }

    /// A packet conn bound to one destination.
    pub async fn dial_udp(&self, destination: NetLocation) -> std::io::Result<Box<dyn PacketConn>> {
        let stream = self.open_stream().await?;
        Ok(Box::new(MuxPacketConn::client(stream, destination)))
    }

    /// A packet conn whose packets may go to any destination.
    pub async fn listen_packet(&self) -> std::io::Result<Box<dyn PacketConn>> {
        let stream = self.open_stream().await?;
        Ok(Box::new(MuxPacketConn::client_addr(stream)))
    }

    async fn open_stream(&self) -> std::io::Result<MuxStream> {
        let mut last_error = None;
        for attempt in 0..OPEN_ATTEMPTS {
            let session = self.offer().await?;
            match session.open().await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!("[Mux] open stream failed (attempt {attempt}): {e}");
                    session.close();
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| std::io::Error::other("failed to open mux stream")))
    }

    async fn offer(&self) -> std::io::Result<Arc<Session>> {
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|session| !session.is_closed());
        if let Some(session) = self.pick(&sessions) {
            return Ok(session);
        }
        let session = Arc::new(self.new_session().await?);
        sessions.push(session.clone());
        Ok(session)
    }

    fn pick(&self, sessions: &[Arc<Session>]) -> Option<Arc<Session>> {
        if self.brutal.is_some() {
            return sessions.first().cloned();
        }
        let least = sessions
            .iter()
            .filter(|session| session.can_take_new_request())
            .min_by_key(|session| session.num_streams())?;
        let streams = least.num_streams();
        if streams == 0 {
            return Some(least.clone());
        }
        let reuse = if self.max_connections > 0 {
            sessions.len() >= self.max_connections || streams < self.min_streams
        } else if self.max_streams > 0 {
            streams < self.max_streams
        } else {
            streams < self.min_streams
        };
        reuse.then(|| least.clone())
    }

    async fn new_session(&self) -> std::io::Result<Session> {
        let mut conn = self.dialer.dial().await?;
        let socket = if self.brutal.is_some() {
            find_capability(&conn, |node| {
                node.tcp_stream()
                    .and_then(|tcp| socket2::SockRef::from(tcp).try_clone().ok())
            })
        } else {
            None
        };

        let request = SessionRequest::new(self.protocol, self.padding);
        conn.write_all(&request.encode()).await?;
        conn.flush().await?;
        let conn: Box<dyn AsyncStream> = if self.padding {
            Box::new(PaddingStream::new(conn))
        } else {
            conn
        };
        let session = Session::new(conn, self.protocol, Side::Client)?;

        if let Some(options) = &self.brutal {
            match brutal::client_exchange(&session, socket.as_ref(), options).await {
                Ok(send_bps) => info!("[Mux] TCP Brutal enabled at {send_bps} B/s"),
                Err(e) => {
                    session.close();
                    return Err(std::io::Error::new(
                        e.kind(),
                        format!("brutal exchange: {e}"),
                    ));
                }
            }
        }
        debug!("[Mux] new {} session", self.protocol);
        Ok(session)
    }

    pub async fn num_sessions(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn close(&self) {
        for session in self.sessions.lock().await.drain(..) {
            session.close();
        }
    }
}
