use async_trait::async_trait;
use log::debug;

use super::{AdapterType, ProxyAdapter};
use crate::bufio::{AsyncStream, PacketConn};
use crate::metadata::Metadata;

/// Refuses every connection.
#[derive(Debug)]
pub struct Reject {
    name: String,
}

impl Reject {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    fn rejected(&self, metadata: &Metadata) -> std::io::Error {
        debug!("[Reject] {metadata}");
        std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            format!("{} rejected {}", self.name, metadata.target()),
        )
    }
}

#[async_trait]
impl ProxyAdapter for Reject {
    fn name(&self) -> &str {
        &self.name
    }

    fn adapter_type(&self) -> AdapterType {
        AdapterType::Reject
    }

    fn support_udp(&self) -> bool {
        true
    }

    async fn dial_context(&self, metadata: &Metadata) -> std::io::Result<Box<dyn AsyncStream>> {
        Err(self.rejected(metadata))
    }

    async fn listen_packet_context(
        &self,
        metadata: &Metadata,
    ) -> std::io::Result<Box<dyn PacketConn>> {
        Err(self.rejected(metadata))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::NetLocation;
    use crate::metadata::Network;

    #[tokio::test]
    async fn test_reject_refuses() {
        let reject = Reject::new("REJECT");
        let metadata = Metadata::new(
            Network::Udp,
            NetLocation::UNSPECIFIED,
            NetLocation::from_str("1.1.1.1:53", None).unwrap(),
        );
        let err = reject.dial_context(&metadata).await.err().unwrap();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionRefused);
        let err = reject.listen_packet_context(&metadata).await.err().unwrap();
        assert_eq!(err.to_string(), "REJECT rejected 1.1.1.1:53");
    }
}
