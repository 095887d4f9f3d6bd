//! Outbound proxy adapters and the dialer chain they connect through.

mod dialer;
mod direct;
mod http;
mod mux;
mod proxy;
mod reject;
mod socks5;

pub use dialer::{Dialer, ProxyDialer, SystemDialer, UdpPacketConn};
pub use direct::Direct;
pub use http::Http;
pub use mux::MuxAdapter;
pub use proxy::{DEFAULT_TEST_URL, DelayRecord, MAX_HISTORY, Proxy};
pub use reject::Reject;
pub use socks5::Socks5;

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;

use crate::bufio::{AsyncStream, PacketConn};
use crate::metadata::Metadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterType {
    Direct,
    Reject,
    Socks5,
    Http,
    Relay,
    Selector,
    Fallback,
    UrlTest,
    LoadBalance,
}

impl AdapterType {
    pub fn is_group(self) -> bool {
        matches!(
            self,
            AdapterType::Relay
                | AdapterType::Selector
                | AdapterType::Fallback
                | AdapterType::UrlTest
                | AdapterType::LoadBalance
        )
    }
}

impl std::fmt::Display for AdapterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AdapterType::Direct => "Direct",
            AdapterType::Reject => "Reject",
            AdapterType::Socks5 => "Socks5",
            AdapterType::Http => "Http",
            AdapterType::Relay => "Relay",
            AdapterType::Selector => "Selector",
            AdapterType::Fallback => "Fallback",
            AdapterType::UrlTest => "URLTest",
            AdapterType::LoadBalance => "LoadBalance",
        };
        f.write_str(name)
    }
}

fn unsupported(adapter_type: AdapterType, name: &str, what: &str) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        format!("{adapter_type} {name} does not support {what}"),
    )
}

/// One way out of the engine: a leaf protocol or a group choosing among other proxies.
#[async_trait]
pub trait ProxyAdapter: Send + Sync + Debug {
    fn name(&self) -> &str;

    fn adapter_type(&self) -> AdapterType;

    /// The server address, or an empty string for adapters without one.
    fn addr(&self) -> String {
        String::new()
    }

    fn support_udp(&self) -> bool;

    /// Whether UDP can be carried over a TCP stream to the server.
    fn support_uot(&self) -> bool {
        false
    }

    /// Whether the adapter can reach its server through another dialer, as a relay hop.
    fn support_with_dialer(&self) -> bool {
        false
    }

    async fn dial_context(&self, metadata: &Metadata) -> std::io::Result<Box<dyn AsyncStream>>;

    async fn listen_packet_context(
        &self,
        metadata: &Metadata,
    ) -> std::io::Result<Box<dyn PacketConn>>;

    async fn dial_with_dialer(
        &self,
        _dialer: Arc<dyn Dialer>,
        _metadata: &Metadata,
    ) -> std::io::Result<Box<dyn AsyncStream>> {
        Err(unsupported(
            self.adapter_type(),
            self.name(),
            "dialing through another proxy",
        ))
    }

    async fn listen_packet_with_dialer(
        &self,
        _dialer: Arc<dyn Dialer>,
        _metadata: &Metadata,
    ) -> std::io::Result<Box<dyn PacketConn>> {
        Err(unsupported(
            self.adapter_type(),
            self.name(),
            "UDP through another proxy",
        ))
    }

    /// For groups, the member a dial for `metadata` would use. `touch` marks the group as in use.
    fn unwrap(&self, _metadata: &Metadata, _touch: bool) -> Option<Arc<Proxy>> {
        None
    }

    /// For groups, every member currently known.
    fn members(&self) -> Vec<Arc<Proxy>> {
        Vec::new()
    }

    /// Releases pooled connections.
    async fn close(&self) {}
}

#[cfg(test)]
pub(crate) mod testing {
    //! Adapters with scripted behaviour for group and tunnel tests.

    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::address::NetLocation;

    /// Dials an in-memory echo peer unless marked down.
    #[derive(Debug)]
    pub struct MockAdapter {
        pub name: String,
        pub up: AtomicBool,
        pub udp: bool,
        pub dials: AtomicUsize,
        pub kind: AdapterType,
    }

    impl MockAdapter {
        pub fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                up: AtomicBool::new(true),
                udp: true,
                dials: AtomicUsize::new(0),
                kind: AdapterType::Socks5,
            })
        }

        pub fn set_up(&self, up: bool) {
            self.up.store(up, Ordering::SeqCst);
        }

        pub fn dials(&self) -> usize {
            self.dials.load(Ordering::SeqCst)
        }

        fn check(&self) -> std::io::Result<()> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            if self.up.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    format!("{} is down", self.name),
                ))
            }
        }
    }

    pub fn echo_stream() -> Box<dyn AsyncStream> {
        let (a, b) = tokio::io::duplex(1 << 16);
        tokio::spawn(async move {
            let (mut r, mut w) = tokio::io::split(b);
            let _ = tokio::io::copy(&mut r, &mut w).await;
        });
        Box::new(a)
    }

    #[async_trait]
    impl ProxyAdapter for MockAdapter {
        fn name(&self) -> &str {
            &self.name
        }

        fn adapter_type(&self) -> AdapterType {
            self.kind
        }

        fn addr(&self) -> String {
            format!("{}.invalid:1080", self.name)
        }

        fn support_udp(&self) -> bool {
            self.udp
        }

        fn support_with_dialer(&self) -> bool {
            true
        }

        async fn dial_context(&self, _metadata: &Metadata) -> std::io::Result<Box<dyn AsyncStream>> {
            self.check()?;
            Ok(echo_stream())
        }

        async fn listen_packet_context(
            &self,
            _metadata: &Metadata,
        ) -> std::io::Result<Box<dyn PacketConn>> {
            self.check()?;
            Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "mock has no packet conn",
            ))
        }

        async fn dial_with_dialer(
            &self,
            dialer: Arc<dyn Dialer>,
            _metadata: &Metadata,
        ) -> std::io::Result<Box<dyn AsyncStream>> {
            self.check()?;
            let server = NetLocation::from_str(&self.addr(), None)?;
            dialer.dial_stream(&server).await
        }
    }
}
