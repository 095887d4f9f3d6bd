use std::sync::Arc;

use async_trait::async_trait;

use super::{AdapterType, Dialer, ProxyAdapter, SystemDialer};
use crate::address::NetLocation;
use crate::bufio::{AsyncStream, PacketConn};
use crate::metadata::Metadata;

/// Connects to the destination from this host.
#[derive(Debug)]
pub struct Direct {
    name: String,
    dialer: SystemDialer,
}

impl Direct {
    pub fn new(name: &str, dialer: SystemDialer) -> Self {
        Self {
            name: name.to_string(),
            dialer,
        }
    }

    /// Prefers an address resolved during rule matching over resolving the host again.
    fn target(metadata: &Metadata) -> NetLocation {
        match metadata.dst_ip {
            Some(ip) if metadata.host.is_none() => {
                NetLocation::from_ip_addr(ip, metadata.destination.port())
            }
            _ => metadata.target(),
        }
    }
}

#[async_trait]
impl ProxyAdapter for Direct {
    fn name(&self) -> &str {
        &self.name
    }

    fn adapter_type(&self) -> AdapterType {
        AdapterType::Direct
    }

    fn support_udp(&self) -> bool {
        true
    }

    fn support_with_dialer(&self) -> bool {
        true
    }

    async fn dial_context(&self, metadata: &Metadata) -> std::io::Result<Box<dyn AsyncStream>> {
        self.dialer.dial_stream(&Self::target(metadata)).await
    }

    async fn listen_packet_context(
        &self,
        metadata: &Metadata,
    ) -> std::io::Result<Box<dyn PacketConn>> {
        self.dialer.listen_packet(&Self::target(metadata)).await
    }

    async fn dial_with_dialer(
        &self,
        dialer: Arc<dyn Dialer>,
        metadata: &Metadata,
    ) -> std::io::Result<Box<dyn AsyncStream>> {
        dialer.dial_stream(&Self::target(metadata)).await
    }

    async fn listen_packet_with_dialer(
        &self,
        dialer: Arc<dyn Dialer>,
        metadata: &Metadata,
    ) -> std::io::Result<Box<dyn PacketConn>> {
        dialer.listen_packet(&Self::target(metadata)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Network;

    #[test]
    fn test_resolved_ip_is_preferred() {
        let mut metadata = Metadata::new(
            Network::Tcp,
            NetLocation::UNSPECIFIED,
            NetLocation::from_str("example.com:443", None).unwrap(),
        );
        assert_eq!(Direct::target(&metadata).to_string(), "example.com:443");

        metadata.dst_ip = Some("93.184.216.34".parse().unwrap());
        assert_eq!(Direct::target(&metadata).to_string(), "93.184.216.34:443");

        metadata.host = Some("sniffed.example.org".to_string());
        assert_eq!(Direct::target(&metadata).to_string(), "sniffed.example.org:443");
    }
}
