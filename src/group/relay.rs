use std::sync::Arc;

use async_trait::async_trait;

use super::GroupBase;
use crate::adapter::{AdapterType, Dialer, Proxy, ProxyAdapter, ProxyDialer, SystemDialer};
use crate::bufio::{AsyncStream, PacketConn};
use crate::metadata::Metadata;

/// Chains its members: each hop is reached through every hop before it.
#[derive(Debug)]
pub struct Relay {
    base: GroupBase,
    dialer: SystemDialer,
}

/// Follows groups down to the proxy a dial would actually use.
fn leaf(mut proxy: Arc<Proxy>, metadata: &Metadata, touch: bool) -> Arc<Proxy> {
    while let Some(next) = proxy.unwrap(metadata, touch) {
        proxy = next;
    }
    proxy
}

impl Relay {
    pub fn new(base: GroupBase, dialer: SystemDialer) -> Self {
        Self { base, dialer }
    }

    fn hops(&self, metadata: &Metadata, touch: bool) -> Vec<Arc<Proxy>> {
        self.base
            .get_proxies(touch)
            .into_iter()
            .map(|proxy| leaf(proxy, metadata, touch))
            .filter(|proxy| proxy.adapter_type() != AdapterType::Direct)
            .collect()
    }

    /// A dialer that reaches the last hop's server through all earlier hops.
    fn chain(&self, hops: &[Arc<Proxy>]) -> Arc<dyn Dialer> {
        let mut dialer: Arc<dyn Dialer> = Arc::new(self.dialer.clone());
        for hop in hops {
            dialer = Arc::new(ProxyDialer::new(hop.clone(), dialer));
        }
        dialer
    }
}

#[async_trait]
impl ProxyAdapter for Relay {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn adapter_type(&self) -> AdapterType {
        AdapterType::Relay
    }

    fn support_udp(&self) -> bool {
        if self.base.disable_udp() {
            return false;
        }
        let proxies = self.base.get_proxies(false);
        for proxy in proxies.iter().rev() {
            if proxy.support_uot() {
                return true;
            }
            if !proxy.support_udp() {
                return false;
            }
        }
        true
    }

    async fn dial_context(&self, metadata: &Metadata) -> std::io::Result<Box<dyn AsyncStream>> {
        let hops = self.hops(metadata, true);
        match hops.split_last() {
            None => self.dialer.dial_stream(&metadata.target()).await,
            Some((last, [])) => last.dial_context(metadata).await,
            Some((last, rest)) => last.dial_with_dialer(self.chain(rest), metadata).await,
        }
    }

    async fn listen_packet_context(
        &self,
        metadata: &Metadata,
    ) -> std::io::Result<Box<dyn PacketConn>> {
        let hops = self.hops(metadata, true);
        match hops.split_last() {
            None => self.dialer.listen_packet(&metadata.target()).await,
            Some((last, [])) => last.listen_packet_context(metadata).await,
            Some((last, rest)) => {
                last.listen_packet_with_dialer(self.chain(rest), metadata)
                    .await
            }
        }
    }

    fn members(&self) -> Vec<Arc<Proxy>> {
        self.base.get_proxies(false)
    }

    async fn close(&self) {
        self.base.close();
    }
}
