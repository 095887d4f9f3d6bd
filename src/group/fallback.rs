use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{GroupBase, empty_group, proxy_not_found};
use crate::adapter::{AdapterType, Proxy, ProxyAdapter};
use crate::bufio::{AsyncStream, PacketConn};
use crate::metadata::Metadata;
use crate::provider::DEFAULT_TIMEOUT;

/// Uses the first alive member, or a pinned member for as long as it stays alive.
#[derive(Debug)]
pub struct Fallback {
    base: GroupBase,
    selected: Mutex<Option<String>>,
}

impl Fallback {
    pub fn new(base: GroupBase) -> Self {
        Self {
            base,
            selected: Mutex::new(None),
        }
    }

    pub fn now(&self) -> Option<String> {
        self.find_alive_proxy(false).map(|p| p.name().to_string())
    }

    /// Pins `name`. A member not known to be alive is tested right away.
    pub async fn set(&self, name: &str) -> std::io::Result<()> {
        let proxy = self
            .base
            .get_proxies(false)
            .into_iter()
            .find(|p| p.name() == name)
            .ok_or_else(|| proxy_not_found(self.base.name(), name))?;
        *self.selected.lock() = Some(name.to_string());
        if !proxy.alive_for_test_url(self.base.test_url()) {
            let _ = proxy.url_test(self.base.test_url(), DEFAULT_TIMEOUT).await;
        }
        Ok(())
    }

    fn find_alive_proxy(&self, touch: bool) -> Option<Arc<Proxy>> {
        let proxies = self.base.get_proxies(touch);
        let url = self.base.test_url();
        let mut selected = self.selected.lock();
        if let Some(name) = selected.as_deref()
            && let Some(proxy) = proxies.iter().find(|p| p.name() == name)
        {
            if proxy.alive_for_test_url(url) {
                return Some(proxy.clone());
            }
            *selected = None;
        }
        proxies
            .iter()
            .find(|p| p.alive_for_test_url(url))
            .or_else(|| proxies.first())
            .cloned()
    }
}

#[async_trait]
impl ProxyAdapter for Fallback {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn adapter_type(&self) -> AdapterType {
        AdapterType::Fallback
    }

    fn support_udp(&self) -> bool {
        !self.base.disable_udp() && self.find_alive_proxy(false).is_some_and(|p| p.support_udp())
    }

    async fn dial_context(&self, metadata: &Metadata) -> std::io::Result<Box<dyn AsyncStream>> {
        let proxy = self
            .find_alive_proxy(true)
            .ok_or_else(|| empty_group(self.name()))?;
        self.base.dial_member(&proxy, metadata).await
    }

    async fn listen_packet_context(
        &self,
        metadata: &Metadata,
    ) -> std::io::Result<Box<dyn PacketConn>> {
        let proxy = self
            .find_alive_proxy(true)
            .ok_or_else(|| empty_group(self.name()))?;
        self.base.listen_packet_member(&proxy, metadata).await
    }

    fn unwrap(&self, _metadata: &Metadata, touch: bool) -> Option<Arc<Proxy>> {
        self.find_alive_proxy(touch)
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
    use crate::group::GroupOptions;
    use crate::group::testing::{mocks, provider};

    #[tokio::test]
    async fn test_first_alive_and_pinned() {
        let (adapters, proxies) = mocks(&["a", "b", "c"]);
        let fallback = Fallback::new(GroupBase::new(GroupOptions::new("f"), provider(proxies.clone())));
        let url = fallback.base.test_url().to_string();
        assert_eq!(fallback.now().as_deref(), Some("a"));

        proxies[0].record_test(&url, 0);
        assert_eq!(fallback.now().as_deref(), Some("b"));

        fallback.set("c").await.unwrap();
        assert_eq!(fallback.now().as_deref(), Some("c"));
        assert_eq!(adapters[2].dials(), 0);

        // A pinned member that dies is forgotten.
        proxies[2].record_test(&url, 0);
        assert_eq!(fallback.now().as_deref(), Some("b"));
        proxies[2].record_test(&url, 100);
        assert_eq!(fallback.now().as_deref(), Some("b"));

        assert!(fallback.set("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_set_dead_member_tests_it() {
        let (adapters, proxies) = mocks(&["a", "b"]);
        let fallback = Fallback::new(GroupBase::new(GroupOptions::new("f"), provider(proxies.clone())));
        proxies[1].record_test(fallback.base.test_url(), 0);
        adapters[1].set_up(false);
        fallback.set("b").await.unwrap();
        assert_eq!(adapters[1].dials(), 1);
        assert_eq!(fallback.now().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_all_dead_uses_first() {
        let (_, proxies) = mocks(&["a", "b"]);
        let fallback = Fallback::new(GroupBase::new(GroupOptions::new("f"), provider(proxies.clone())));
        for proxy in &proxies {
            proxy.record_test(fallback.base.test_url(), 0);
        }
        assert_eq!(fallback.now().as_deref(), Some("a"));
    }
}
