//! Routes accepted connections and packets to proxies and relays them.

mod statistics;

pub use statistics::{Statistics, Tracker, TrackerInfo};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::adapter::{Proxy, ProxyAdapter};
use crate::buf::Buffer;
use crate::bufio::{
    AsyncStream, CounterPacketConn, CounterStream, PacketConn, copy_conn, copy_packet_conn,
    report_handshake_failure, report_handshake_success, report_packet_handshake_failure,
};
use crate::environment::Environment;
use crate::handler::{PacketConnectionHandler, TcpConnectionHandler};
use crate::metadata::{Metadata, Network};
use crate::rule::RuleSet;
use crate::udpnat::{self, CancelContext, FlowInit, NatConn, PacketWriter, UdpConnectionHandler};

pub const DEFAULT_UDP_TIMEOUT: Duration = Duration::from_secs(60);

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const UDP_QUEUE_SIZE: usize = 200;
const MIN_UDP_WORKERS: usize = 4;

/// Rules plus the proxies they may name, swapped as a whole on reload.
#[derive(Debug)]
pub struct Routes {
    rules: RuleSet,
    proxies: HashMap<String, Arc<Proxy>>,
    direct: Arc<Proxy>,
}

impl Routes {
    /// `proxies` must contain `DIRECT`, which also serves flows no rule matches.
    pub fn new(rules: RuleSet, proxies: HashMap<String, Arc<Proxy>>) -> std::io::Result<Self> {
        let direct = proxies.get("DIRECT").cloned().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "missing DIRECT proxy")
        })?;
        for rule in rules.rules() {
            if !proxies.contains_key(rule.target()) {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("rule {rule} targets unknown proxy {}", rule.target()),
                ));
            }
        }
        Ok(Self {
            rules,
            proxies,
            direct,
        })
    }

    pub fn proxy(&self, name: &str) -> Option<&Arc<Proxy>> {
        self.proxies.get(name)
    }

    pub fn proxies(&self) -> &HashMap<String, Arc<Proxy>> {
        &self.proxies
    }
}

/// One packet from a connectionless inbound, with the path back to its sender.
pub struct UdpPacket {
    pub metadata: Metadata,
    pub buffer: Buffer,
    pub writer: PacketWriter,
}

type NatKey = (String, crate::address::NetLocation);

#[derive(Debug)]
struct Dispatcher {
    env: Arc<Environment>,
    routes: RwLock<Arc<Routes>>,
    statistics: Arc<Statistics>,
    udp_timeout: Duration,
    cancel: CancellationToken,
}

/// Names from `proxy` down to the leaf a dial would use.
fn proxy_chain(proxy: &Arc<Proxy>, metadata: &Metadata) -> Vec<String> {
    let mut chain = vec![proxy.name().to_string()];
    let mut current = proxy.clone();
    while let Some(next) = current.unwrap(metadata, false) {
        chain.push(next.name().to_string());
        current = next;
    }
    chain
}

impl Dispatcher {
    async fn route(&self, metadata: &mut Metadata) -> (Arc<Proxy>, String) {
        let routes = self.routes.read().clone();
        let network = metadata.network;
        let found = routes
            .rules
            .find(metadata, self.env.resolver(), |rule| {
                routes
                    .proxies
                    .get(rule.target())
                    .is_some_and(|proxy| network == Network::Tcp || proxy.support_udp())
            })
            .await;
        match found {
            Some(rule) => match routes.proxies.get(rule.target()) {
                Some(proxy) => (proxy.clone(), rule.to_string()),
                None => (routes.direct.clone(), String::new()),
            },
            None => (routes.direct.clone(), String::new()),
        }
    }

    fn log_match(&self, metadata: &Metadata, rule: &str, chain: &[String]) {
        let chain = chain.join(" -> ");
        if rule.is_empty() {
            info!("[Tunnel] {metadata} doesn't match any rule using {chain}");
        } else {
            info!("[Tunnel] {metadata} match {rule} using {chain}");
        }
    }

    async fn handle_stream(&self, mut stream: Box<dyn AsyncStream>, mut metadata: Metadata) {
        let (proxy, rule) = self.route(&mut metadata).await;
        let chain = proxy_chain(&proxy, &metadata);
        self.log_match(&metadata, &rule, &chain);

        let dialed = tokio::time::timeout(DIAL_TIMEOUT, proxy.dial_context(&metadata))
            .await
            .unwrap_or_else(|_| {
                Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("dial {} timed out", metadata.target()),
                ))
            });
        let remote = match dialed {
            Ok(remote) => remote,
            Err(e) => {
                warn!("[Tunnel] dial {} via {} failed: {e}", metadata.target(), chain.join(" -> "));
                if let Err(e) = report_handshake_failure(&mut stream, &e).await {
                    debug!("[Tunnel] failed to report dial error: {e}");
                }
                return;
            }
        };
        if let Err(e) = report_handshake_success(&mut stream).await {
            debug!("[Tunnel] {metadata} client went away: {e}");
            return;
        }

        let tracker = self
            .statistics
            .track(metadata.clone(), chain, rule, &self.cancel);
        let mut remote = CounterStream::new(
            remote,
            Some(tracker.download_counter()),
            Some(tracker.upload_counter()),
        );
        match copy_conn(&mut stream, &mut remote, self.env.pool(), tracker.token()).await {
            Ok((up, down)) => debug!("[Tunnel] {metadata} closed, {up} bytes up, {down} bytes down"),
            Err(e) => debug!("[Tunnel] {metadata} relay ended: {e}"),
        }
    }

    async fn handle_packets<P: PacketConn + ?Sized>(
        &self,
        conn: &mut P,
        mut metadata: Metadata,
        parent: &CancellationToken,
    ) {
        let (proxy, rule) = self.route(&mut metadata).await;
        let chain = proxy_chain(&proxy, &metadata);
        self.log_match(&metadata, &rule, &chain);

        let dialed = tokio::time::timeout(DIAL_TIMEOUT, proxy.listen_packet_context(&metadata))
            .await
            .unwrap_or_else(|_| {
                Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("listen packet for {} timed out", metadata.target()),
                ))
            });
        let remote = match dialed {
            Ok(remote) => remote,
            Err(e) => {
                warn!(
                    "[Tunnel] listen packet for {} via {} failed: {e}",
                    metadata.target(),
                    chain.join(" -> ")
                );
                if let Err(e) = report_packet_handshake_failure(conn, &e).await {
                    debug!("[Tunnel] failed to report listen error: {e}");
                }
                return;
            }
        };

        let tracker = self.statistics.track(metadata.clone(), chain, rule, parent);
        let mut remote = CounterPacketConn::new(
            remote,
            Some(tracker.download_counter()),
            Some(tracker.upload_counter()),
        );
        match copy_packet_conn(
            conn,
            &mut remote,
            self.env.pool(),
            self.udp_timeout,
            tracker.token(),
        )
        .await
        {
            Ok((up, down)) => debug!("[Tunnel] {metadata} flow closed, {up} bytes up, {down} bytes down"),
            Err(e) => debug!("[Tunnel] {metadata} flow ended: {e}"),
        }
    }
}

#[async_trait]
impl UdpConnectionHandler for Dispatcher {
    async fn new_packet_connection(&self, ctx: CancelContext, mut conn: NatConn, metadata: Metadata) {
        self.handle_packets(&mut conn, metadata, ctx.token()).await;
    }
}

/// Entry point for every inbound: streams, packet conns and single packets.
#[derive(Debug)]
pub struct Tunnel {
    dispatcher: Arc<Dispatcher>,
    nat: udpnat::Service<NatKey>,
    udp_queue: mpsc::Sender<UdpPacket>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for UdpPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpPacket")
            .field("metadata", &self.metadata)
            .field("len", &self.buffer.len())
            .finish()
    }
}

fn udp_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .max(MIN_UDP_WORKERS)
}

impl Tunnel {
    pub fn new(env: Arc<Environment>, routes: Routes, udp_timeout: Duration) -> Arc<Self> {
        let cancel = env.child_token();
        let dispatcher = Arc::new(Dispatcher {
            env,
            routes: RwLock::new(Arc::new(routes)),
            statistics: Statistics::new(),
            udp_timeout,
            cancel: cancel.clone(),
        });
        let nat = udpnat::Service::new(udp_timeout, dispatcher.clone(), &cancel);

        let (udp_queue, receiver) = mpsc::channel::<UdpPacket>(UDP_QUEUE_SIZE);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        for _ in 0..udp_worker_count() {
            let receiver = receiver.clone();
            let nat = nat.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let packet = {
                        let mut receiver = receiver.lock().await;
                        tokio::select! {
                            packet = receiver.recv() => packet,
                            _ = cancel.cancelled() => None,
                        }
                    };
                    let Some(UdpPacket {
                        metadata,
                        buffer,
                        writer,
                    }) = packet
                    else {
                        break;
                    };
                    let key = (metadata.inbound_name.clone(), metadata.source.clone());
                    let destination = metadata.destination.clone();
                    nat.new_context_packet(&cancel, key, buffer, destination, move |_| {
                        Some(FlowInit { metadata, writer })
                    })
                    .await;
                }
            });
        }

        Arc::new(Self {
            dispatcher,
            nat,
            udp_queue,
            cancel,
        })
    }

    pub fn statistics(&self) -> &Arc<Statistics> {
        &self.dispatcher.statistics
    }

    pub fn routes(&self) -> Arc<Routes> {
        self.dispatcher.routes.read().clone()
    }

    pub fn set_routes(&self, routes: Routes) {
        *self.dispatcher.routes.write() = Arc::new(routes);
    }

    /// A token cancelled when the tunnel closes.
    pub fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// Queues a packet for its flow. Waits while the queue is full.
    pub async fn handle_udp_packet(&self, packet: UdpPacket) {
        if self.udp_queue.send(packet).await.is_err() {
            debug!("[Tunnel] udp queue closed, dropping packet");
        }
    }

    /// Closes every flow and connection.
    pub fn close(&self) {
        self.dispatcher.statistics.close_all();
        self.nat.close();
        self.cancel.cancel();
    }
}

#[async_trait]
impl TcpConnectionHandler for Tunnel {
    async fn new_connection(&self, stream: Box<dyn AsyncStream>, metadata: Metadata) {
        self.dispatcher.handle_stream(stream, metadata).await;
    }
}

#[async_trait]
impl PacketConnectionHandler for Tunnel {
    async fn new_packet_connection(&self, mut conn: Box<dyn PacketConn>, metadata: Metadata) {
        let parent = self.cancel.child_token();
        self.dispatcher
            .handle_packets(&mut *conn, metadata, &parent)
            .await;
    }
}
