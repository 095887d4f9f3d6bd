use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{GroupBase, empty_group, proxy_not_found};
use crate::adapter::{AdapterType, Proxy, ProxyAdapter};
use crate::bufio::{AsyncStream, PacketConn};
use crate::metadata::Metadata;

/// Routes through the proxy chosen with [`Selector::set`], or the first member by default.
#[derive(Debug)]
pub struct Selector {
    base: GroupBase,
    selected: Mutex<String>,
}

impl Selector {
    pub fn new(base: GroupBase) -> Self {
        Self {
            base,
            selected: Mutex::new(String::new()),
        }
    }

    /// The name of the proxy dials currently use.
    pub fn now(&self) -> Option<String> {
        self.select_proxy(false).map(|proxy| proxy.name().to_string())
    }

    pub fn set(&self, name: &str) -> std::io::Result<()> {
        let mut selected = self.selected.lock();
        if !self.base.get_proxies(false).iter().any(|p| p.name() == name) {
            return Err(proxy_not_found(self.base.name(), name));
        }
        *selected = name.to_string();
        Ok(())
    }

    fn select_proxy(&self, touch: bool) -> Option<Arc<Proxy>> {
        let selected = self.selected.lock();
        let proxies = self.base.get_proxies(touch);
        proxies
            .iter()
            .find(|p| p.name() == selected.as_str())
            .or_else(|| proxies.first())
            .cloned()
    }
}

#[async_trait]
impl ProxyAdapter for Selector {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn adapter_type(&self) -> AdapterType {
        AdapterType::Selector
    }

    fn support_udp(&self) -> bool {
        !self.base.disable_udp() && self.select_proxy(false).is_some_and(|p| p.support_udp())
    }

    async fn dial_context(&self, metadata: &Metadata) -> std::io::Result<Box<dyn AsyncStream>> {
        let proxy = self
            .select_proxy(true)
            .ok_or_else(|| empty_group(self.name()))?;
        proxy.dial_context(metadata).await
    }

    async fn listen_packet_context(
        &self,
        metadata: &Metadata,
    ) -> std::io::Result<Box<dyn PacketConn>> {
        let proxy = self
            .select_proxy(true)
            .ok_or_else(|| empty_group(self.name()))?;
        proxy.listen_packet_context(metadata).await
    }

    fn unwrap(&self, _metadata: &Metadata, touch: bool) -> Option<Arc<Proxy>> {
        self.select_proxy(touch)
    }

    fn members(&self) -> Vec<Arc<Proxy>> {
        self.base.get_proxies(false)
    }

    async fn close(&self) {
        self.base.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::NetLocation;
    use crate::group::GroupOptions;
    use crate::group::testing::{mocks, provider};
    use crate::metadata::Network;

    fn metadata() -> Metadata {
        Metadata::new(
            Network::Tcp,
            NetLocation::UNSPECIFIED,
            NetLocation::from_str("example.com:80", None).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_defaults_to_first_and_validates_set() {
        let (_, proxies) = mocks(&["a", "b"]);
        let selector = Selector::new(GroupBase::new(GroupOptions::new("s"), provider(proxies)));
        assert_eq!(selector.now().as_deref(), Some("a"));

        selector.set("b").unwrap();
        assert_eq!(selector.now().as_deref(), Some("b"));
        let err = selector.set("c").unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
        assert_eq!(selector.now().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_empty_selector_fails_dial() {
        let selector = Selector::new(GroupBase::new(GroupOptions::new("s"), Vec::new()));
        let err = selector.dial_context(&metadata()).await.err().expect("dial should fail");
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_set_and_dial() {
        let (adapters, proxies) = mocks(&["a", "b", "c"]);
        // Dials that fall back to the first member would show up on "a".
        let selector = Arc::new(Selector::new(GroupBase::new(
            GroupOptions::new("s"),
            provider(proxies),
        )));
        selector.set("b").unwrap();

        let mut tasks = Vec::new();
        for i in 0..8 {
            let selector = selector.clone();
            tasks.push(tokio::spawn(async move {
                for j in 0..50 {
                    if i % 2 == 0 {
                        selector.set(if j % 2 == 0 { "b" } else { "c" }).unwrap();
                        assert!(selector.set("missing").is_err());
                    } else {
                        selector.dial_context(&metadata()).await.unwrap();
                    }
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(adapters[0].dials(), 0);
        assert_eq!(adapters[1].dials() + adapters[2].dials(), 200);
    }
}
