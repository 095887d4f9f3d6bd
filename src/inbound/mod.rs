//! Listeners that accept client connections, parse where they want to go and hand them to the
//! tunnel.

mod forward;
mod http;
mod mixed;
mod reply;
mod socks;

pub use forward::Forward;
pub use reply::{Reply, ReplyStream};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::address::NetLocation;
use crate::bufio::{AsyncStream, CachedStream, report_handshake_success};
use crate::config::{InboundConfig, InboundProtocolConfig};
use crate::environment::Environment;
use crate::handler::{ConnectionHandler, TcpConnectionHandler};
use crate::metadata::{Metadata, Network};
use crate::mux::{self, ServiceOptions, is_mux_destination};
use crate::stream_reader::StreamReader;
use crate::tunnel::Tunnel;

const SETUP_TIMEOUT: Duration = Duration::from_secs(60);
const HEADER_BUFFER_SIZE: usize = 4096;

/// Accepted username and password pairs. Empty means no authentication.
pub type Users = Vec<(String, String)>;

#[derive(Debug)]
enum InboundKind {
    Socks { users: Users, udp: bool },
    Http { users: Users },
    Mixed { users: Users, udp: bool },
    Tunnel(Forward),
    Mux,
}

/// What the protocol handshake produced.
enum Accepted {
    Stream(Box<dyn AsyncStream>, Metadata),
    UdpAssociate(socks::UdpAssociation),
    Mux(Box<dyn AsyncStream>, Metadata),
}

/// One configured listener.
#[derive(Debug)]
pub struct Inbound {
    name: String,
    listen: SocketAddr,
    kind: InboundKind,
    mux: mux::Service,
    tunnel: Arc<Tunnel>,
    env: Arc<Environment>,
}

/// The accepted stream with any bytes the handshake read past its end put back in front.
fn with_leftover(stream: TcpStream, reader: StreamReader) -> Box<dyn AsyncStream> {
    match reader.into_cache() {
        Some(cache) => Box::new(CachedStream::new(stream, cache)),
        None => Box::new(stream),
    }
}

fn users(config: crate::option_util::NoneOrSome<crate::config::UserConfig>) -> Users {
    config
        .into_vec()
        .into_iter()
        .map(|user| (user.username, user.password))
        .collect()
}

impl Inbound {
    pub fn new(
        config: InboundConfig,
        tunnel: Arc<Tunnel>,
        env: Arc<Environment>,
    ) -> std::io::Result<Arc<Self>> {
        let listen = config.listen.to_socket_addr_nonblocking().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("inbound {} must listen on an IP address: {}", config.name, config.listen),
            )
        })?;
        let mut mux_options = ServiceOptions::default();
        let kind = match config.protocol {
            InboundProtocolConfig::Socks { users: u, udp } => InboundKind::Socks { users: users(u), udp },
            InboundProtocolConfig::Http { users: u } => InboundKind::Http { users: users(u) },
            InboundProtocolConfig::Mixed { users: u, udp } => InboundKind::Mixed { users: users(u), udp },
            InboundProtocolConfig::Tunnel { targets, network } => {
                InboundKind::Tunnel(Forward::new(targets.into_vec(), network.into_vec())?)
            }
            InboundProtocolConfig::Mux { padding, brutal } => {
                mux_options = ServiceOptions { padding, brutal };
                InboundKind::Mux
            }
        };
        Ok(Arc::new(Self {
            name: config.name,
            listen,
            kind,
            mux: mux::Service::new(&mux_options),
            tunnel,
            env,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn accepts(&self, network: Network) -> bool {
        match &self.kind {
            InboundKind::Tunnel(forward) => forward.accepts(network),
            _ => network == Network::Tcp,
        }
    }

    /// Binds the listening sockets and spawns their accept loops, which stop when `cancel` fires.
    pub async fn start(self: &Arc<Self>, cancel: CancellationToken) -> std::io::Result<Vec<JoinHandle<()>>> {
        let mut handles = Vec::with_capacity(2);
        if self.accepts(Network::Tcp) {
            let listener = TcpListener::bind(self.listen).await?;
            info!("[Inbound] {} listening on tcp {}", self.name, listener.local_addr()?);
            handles.push(tokio::spawn(self.clone().run_tcp(listener, cancel.clone())));
        }
        if self.accepts(Network::Udp) {
            let socket = UdpSocket::bind(self.listen).await?;
            info!("[Inbound] {} listening on udp {}", self.name, socket.local_addr()?);
            handles.push(tokio::spawn(self.clone().run_udp(socket, cancel)));
        }
        Ok(handles)
    }

    async fn run_tcp(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        loop {
            let (stream, addr) = tokio::select! {
                result = listener.accept() => match result {
                    Ok(v) => v,
                    Err(e) => {
                        error!("[Inbound] {} accept failed: {e}", self.name);
                        continue;
                    }
                },
                _ = cancel.cancelled() => break,
            };
            let inbound = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = inbound.process_stream(stream, addr, cancel).await {
                    error!("{}:{} finished with error: {e}", addr.ip(), addr.port());
                } else {
                    debug!("{}:{} finished successfully", addr.ip(), addr.port());
                }
            });
        }
        debug!("[Inbound] {} stopped accepting", self.name);
    }

    async fn run_udp(self: Arc<Self>, socket: UdpSocket, cancel: CancellationToken) {
        if let InboundKind::Tunnel(forward) = &self.kind
            && let Err(e) = forward
                .serve_packets(&self, socket, &cancel)
                .await
        {
            error!("[Inbound] {} udp listener failed: {e}", self.name);
        }
    }

    async fn process_stream(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        cancel: CancellationToken,
    ) -> std::io::Result<()> {
        if let Err(e) = stream.set_nodelay(true) {
            error!("Failed to set TCP no-delay on client socket: {e}");
        }
        let source = NetLocation::from_socket_addr(addr);
        let accepted = tokio::time::timeout(SETUP_TIMEOUT, self.accept(stream, source))
            .await
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::TimedOut, "inbound setup timed out")
            })?
            .map_err(|e| std::io::Error::new(e.kind(), format!("failed to setup inbound stream: {e}")))?;
        match accepted {
            Accepted::Stream(stream, metadata) => self.dispatch(stream, metadata, cancel).await,
            Accepted::UdpAssociate(association) => association.relay(self, &cancel).await,
            Accepted::Mux(stream, metadata) => self.serve_mux(stream, metadata, cancel).await,
        }
    }

    async fn accept(&self, stream: TcpStream, source: NetLocation) -> std::io::Result<Accepted> {
        let reader = StreamReader::with_capacity(HEADER_BUFFER_SIZE);
        let accepted = match &self.kind {
            InboundKind::Socks { users, udp } => {
                socks::accept(self, stream, reader, source, users, *udp).await?
            }
            InboundKind::Http { users } => http::accept(self, stream, reader, source, users).await?,
            InboundKind::Mixed { users, udp } => {
                mixed::accept(self, stream, reader, source, users, *udp).await?
            }
            InboundKind::Tunnel(forward) => forward.accept(self, Box::new(stream), source),
            InboundKind::Mux => {
                let metadata = self.metadata(Network::Tcp, source, mux::mux_destination());
                Accepted::Mux(Box::new(stream), metadata)
            }
        };
        Ok(accepted)
    }

    fn metadata(&self, network: Network, source: NetLocation, destination: NetLocation) -> Metadata {
        Metadata::new(network, source, destination).with_inbound(&self.name)
    }

    async fn serve_mux(
        &self,
        stream: Box<dyn AsyncStream>,
        metadata: Metadata,
        cancel: CancellationToken,
    ) -> std::io::Result<()> {
        let handler: Arc<dyn ConnectionHandler> = self.tunnel.clone();
        self.mux.new_connection(stream, metadata, handler, cancel).await
    }

    /// Hands a parsed connection to the tunnel, or to the mux service when the client asked for
    /// a mux session.
    async fn dispatch(
        &self,
        mut stream: Box<dyn AsyncStream>,
        metadata: Metadata,
        cancel: CancellationToken,
    ) -> std::io::Result<()> {
        if is_mux_destination(&metadata.destination) {
            report_handshake_success(&mut stream).await?;
            debug!("[Inbound] {} mux session from {}", self.name, metadata.source);
            return self.serve_mux(stream, metadata, cancel).await;
        }
        tokio::select! {
            _ = self.tunnel.new_connection(stream, metadata) => {}
            _ = cancel.cancelled() => {}
        }
        Ok(())
    }

    pub(crate) fn tunnel(&self) -> &Arc<Tunnel> {
        &self.tunnel
    }

    pub(crate) fn env(&self) -> &Arc<Environment> {
        &self.env
    }

    pub(crate) fn listen_addr(&self) -> SocketAddr {
        self.listen
    }
}

/// Builds every inbound and starts listening. Stops at the first bind failure.
pub async fn start_inbounds(
    configs: Vec<InboundConfig>,
    tunnel: &Arc<Tunnel>,
    env: &Arc<Environment>,
    cancel: &CancellationToken,
) -> std::io::Result<Vec<JoinHandle<()>>> {
    let mut handles = vec![];
    for config in configs {
        let inbound = Inbound::new(config, tunnel.clone(), env.clone())?;
        handles.extend(inbound.start(cancel.child_token()).await?);
    }
    Ok(handles)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Inbounds wired to a tunnel whose only route is DIRECT.

    use std::collections::HashMap;

    use super::*;
    use crate::adapter::{Direct, Proxy, SystemDialer};
    use crate::config::UserConfig;
    use crate::option_util::NoneOrSome;
    use crate::rule::RuleSet;
    use crate::tunnel::{DEFAULT_UDP_TIMEOUT, Routes};

    pub fn direct_tunnel(env: &Arc<Environment>) -> Arc<Tunnel> {
        let dialer = SystemDialer::new(env.resolver().clone(), None);
        let direct = Proxy::new(Arc::new(Direct::new("DIRECT", dialer)));
        let proxies = HashMap::from([("DIRECT".to_string(), direct)]);
        let routes = Routes::new(RuleSet::new(Vec::new()), proxies).unwrap();
        Tunnel::new(env.clone(), routes, DEFAULT_UDP_TIMEOUT)
    }

    pub fn user_list(users: &[(&str, &str)]) -> NoneOrSome<UserConfig> {
        NoneOrSome::Some(
            users
                .iter()
                .map(|(username, password)| UserConfig {
                    username: username.to_string(),
                    password: password.to_string(),
                })
                .collect(),
        )
    }

    /// Starts `protocol` on an ephemeral loopback port and returns the address it bound.
    pub async fn start(protocol: InboundProtocolConfig) -> (SocketAddr, Arc<Tunnel>, CancellationToken) {
        let env = Environment::native();
        let tunnel = direct_tunnel(&env);
        // Bind first to learn a free port, then hand the port to the inbound.
        let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = reserved.local_addr().unwrap();
        drop(reserved);
        let config = InboundConfig {
            name: "test-in".to_string(),
            listen: NetLocation::from_socket_addr(addr),
            protocol,
        };
        let inbound = Inbound::new(config, tunnel.clone(), env).unwrap();
        let cancel = CancellationToken::new();
        inbound.start(cancel.clone()).await.unwrap();
        (addr, tunnel, cancel)
    }

    /// A loopback TCP server that echoes every connection.
    pub async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((conn, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let (mut r, mut w) = conn.into_split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::adapter::{MuxAdapter, ProxyAdapter, Socks5, SystemDialer};
    use crate::mux::ClientOptions;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_mux_destination_on_socks_inbound() {
        let (addr, tunnel, cancel) = start(InboundProtocolConfig::Socks {
            users: Default::default(),
            udp: false,
        })
        .await;
        let echo = echo_server().await;

        let socks = Socks5::new(
            "socks",
            NetLocation::from_socket_addr(addr),
            None,
            false,
            SystemDialer::new(Environment::native().resolver().clone(), None),
        );
        let client = MuxAdapter::new(Arc::new(socks), &ClientOptions::default()).unwrap();
        let metadata = Metadata::new(
            Network::Tcp,
            NetLocation::UNSPECIFIED,
            NetLocation::from_socket_addr(echo),
        );
        let mut stream = client.dial_context(&metadata).await.unwrap();
        stream.write_all(b"over mux").await.unwrap();
        let mut buf = [0u8; 8];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"over mux");

        drop(stream);
        client.close().await;
        tunnel.close();
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_tcp_only_inbound_binds_no_udp() {
        let env = Environment::native();
        let config = InboundConfig {
            name: "h".to_string(),
            listen: NetLocation::from_str("127.0.0.1:0", None).unwrap(),
            protocol: InboundProtocolConfig::Http {
                users: Default::default(),
            },
        };
        let inbound = Inbound::new(config, direct_tunnel(&env), env).unwrap();
        let cancel = CancellationToken::new();
        let handles = inbound.start(cancel.clone()).await.unwrap();
        assert_eq!(handles.len(), 1);
        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_hostname_listen_rejected() {
        let env = Environment::native();
        let config = InboundConfig {
            name: "bad".to_string(),
            listen: NetLocation::from_str("localhost:1080", None).unwrap(),
            protocol: InboundProtocolConfig::Http {
                users: Default::default(),
            },
        };
        let err = Inbound::new(config, direct_tunnel(&env), env).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }
}
