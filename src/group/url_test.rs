use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{GroupBase, empty_group, proxy_not_found};
use crate::adapter::{AdapterType, Proxy, ProxyAdapter};
use crate::bufio::{AsyncStream, PacketConn};
use crate::metadata::Metadata;

#[derive(Debug, Default)]
struct UrlTestState {
    selected: Option<String>,
    fast_node: Option<Arc<Proxy>>,
}

/// Uses the member with the lowest measured delay. The current choice is kept until another
/// member is faster by more than `tolerance` milliseconds.
#[derive(Debug)]
pub struct UrlTest {
    base: GroupBase,
    tolerance: u16,
    state: Mutex<UrlTestState>,
}

impl UrlTest {
    pub fn new(base: GroupBase, tolerance: u16) -> Self {
        Self {
            base,
            tolerance,
            state: Mutex::new(UrlTestState::default()),
        }
    }

    pub fn now(&self) -> Option<String> {
        self.fast(false).map(|p| p.name().to_string())
    }

    /// Prefers `name` while it is alive.
    pub fn set(&self, name: &str) -> std::io::Result<()> {
        if !self.base.get_proxies(false).iter().any(|p| p.name() == name) {
            return Err(proxy_not_found(self.base.name(), name));
        }
        let mut state = self.state.lock();
        state.selected = Some(name.to_string());
        state.fast_node = None;
        Ok(())
    }

    fn fast(&self, touch: bool) -> Option<Arc<Proxy>> {
        let proxies = self.base.get_proxies(touch);
        let url = self.base.test_url();
        let mut state = self.state.lock();

        if let Some(name) = state.selected.as_deref()
            && let Some(proxy) = proxies
                .iter()
                .find(|p| p.name() == name && p.alive_for_test_url(url))
        {
            state.fast_node = Some(proxy.clone());
            return Some(proxy.clone());
        }

        let mut fast = proxies.first()?;
        let mut min_delay = fast.last_delay_for_test_url(url);
        for proxy in &proxies[1..] {
            if !proxy.alive_for_test_url(url) {
                continue;
            }
            let delay = proxy.last_delay_for_test_url(url);
            if delay < min_delay {
                fast = proxy;
                min_delay = delay;
            }
        }

        let keep = state.fast_node.as_ref().is_some_and(|current| {
            proxies.iter().any(|p| Arc::ptr_eq(p, current))
                && current.alive_for_test_url(url)
                && current.last_delay_for_test_url(url) as u32
                    <= min_delay as u32 + self.tolerance as u32
        });
        if !keep {
            state.fast_node = Some(fast.clone());
        }
        state.fast_node.clone()
    }
}

#[async_trait]
impl ProxyAdapter for UrlTest {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn adapter_type(&self) -> AdapterType {
        AdapterType::UrlTest
    }

    fn support_udp(&self) -> bool {
        !self.base.disable_udp() && self.fast(false).is_some_and(|p| p.support_udp())
    }

    async fn dial_context(&self, metadata: &Metadata) -> std::io::Result<Box<dyn AsyncStream>> {
        let proxy = self.fast(true).ok_or_else(|| empty_group(self.name()))?;
        self.base.dial_member(&proxy, metadata).await
    }

    async fn listen_packet_context(
        &self,
        metadata: &Metadata,
    ) -> std::io::Result<Box<dyn PacketConn>> {
        let proxy = self.fast(true).ok_or_else(|| empty_group(self.name()))?;
        self.base.listen_packet_member(&proxy, metadata).await
    }

    fn unwrap(&self, _metadata: &Metadata, touch: bool) -> Option<Arc<Proxy>> {
        self.fast(touch)
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

    fn group(tolerance: u16) -> (UrlTest, Vec<Arc<Proxy>>, String) {
        let (_, proxies) = mocks(&["a", "b", "c"]);
        let group = UrlTest::new(
            GroupBase::new(GroupOptions::new("auto"), provider(proxies.clone())),
            tolerance,
        );
        let url = group.base.test_url().to_string();
        (group, proxies, url)
    }

    #[test]
    fn test_picks_lowest_delay() {
        let (group, proxies, url) = group(0);
        proxies[0].record_test(&url, 300);
        proxies[1].record_test(&url, 100);
        proxies[2].record_test(&url, 200);
        assert_eq!(group.now().as_deref(), Some("b"));

        proxies[1].record_test(&url, 0);
        assert_eq!(group.now().as_deref(), Some("c"));
    }

    #[test]
    fn test_tolerance_keeps_current() {
        let (group, proxies, url) = group(50);
        proxies[0].record_test(&url, 100);
        proxies[1].record_test(&url, 200);
        proxies[2].record_test(&url, 200);
        assert_eq!(group.now().as_deref(), Some("a"));

        proxies[1].record_test(&url, 60);
        assert_eq!(group.now().as_deref(), Some("a"));

        proxies[1].record_test(&url, 40);
        assert_eq!(group.now().as_deref(), Some("b"));
    }

    #[test]
    fn test_selected_wins_while_alive() {
        let (group, proxies, url) = group(0);
        proxies[0].record_test(&url, 10);
        proxies[2].record_test(&url, 500);
        group.set("c").unwrap();
        assert_eq!(group.now().as_deref(), Some("c"));

        proxies[2].record_test(&url, 0);
        assert_eq!(group.now().as_deref(), Some("a"));
        assert!(group.set("missing").is_err());
    }
}
