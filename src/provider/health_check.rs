//! Periodic URL tests over a provider's proxies.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::adapter::{DEFAULT_TEST_URL, Proxy, ProxyAdapter};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_CONCURRENT_TESTS: usize = 10;

#[derive(Debug, Clone)]
pub struct HealthCheckOptions {
    pub url: String,
    /// Zero disables periodic checks.
    pub interval: Duration,
    /// Only check when the proxies were used within the last interval.
    pub lazy: bool,
    pub timeout: Duration,
}

impl Default for HealthCheckOptions {
    fn default() -> Self {
        Self {
            url: DEFAULT_TEST_URL.to_string(),
            interval: Duration::ZERO,
            lazy: true,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

#[derive(Debug)]
pub struct HealthCheck {
    options: HealthCheckOptions,
    proxies: RwLock<Vec<Arc<Proxy>>>,
    last_touch: Mutex<Option<Instant>>,
    running: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
}

impl HealthCheck {
    pub fn new(
        proxies: Vec<Arc<Proxy>>,
        options: HealthCheckOptions,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            options,
            proxies: RwLock::new(proxies),
            last_touch: Mutex::new(None),
            running: tokio::sync::Mutex::new(()),
            cancel: parent.child_token(),
        })
    }

    pub fn url(&self) -> &str {
        &self.options.url
    }

    pub fn set_proxies(&self, proxies: Vec<Arc<Proxy>>) {
        *self.proxies.write() = proxies;
    }

    pub fn touch(&self) {
        *self.last_touch.lock() = Some(Instant::now());
    }

    pub fn auto(&self) -> bool {
        !self.options.interval.is_zero()
    }

    fn recently_touched(&self) -> bool {
        self.last_touch
            .lock()
            .is_some_and(|touched| touched.elapsed() < self.options.interval)
    }

    /// Tests every proxy, at most ten at a time. A check already in progress makes this a no-op.
    pub async fn check(&self) {
        let Ok(_running) = self.running.try_lock() else {
            debug!("[HealthCheck] {} check already running", self.options.url);
            return;
        };
        let proxies = self.proxies.read().clone();
        let url = self.options.url.as_str();
        let timeout = self.options.timeout;
        futures::stream::iter(proxies)
            .for_each_concurrent(MAX_CONCURRENT_TESTS, |proxy| async move {
                match proxy.url_test(url, timeout).await {
                    Ok(delay) => debug!("[HealthCheck] {} {delay}ms", proxy.name()),
                    Err(e) => debug!("[HealthCheck] {} failed: {e}", proxy.name()),
                }
            })
            .await;
    }

    /// Runs one check now, then one per interval until closed.
    pub fn start(self: &Arc<Self>) {
        if !self.auto() {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            this.check().await;
            let mut ticker = tokio::time::interval(this.options.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = this.cancel.cancelled() => break,
                }
                if !this.options.lazy || this.recently_touched() {
                    this.check().await;
                } else {
                    debug!("[HealthCheck] skipping idle check for {}", this.options.url);
                }
            }
            info!("[HealthCheck] stopped checks for {}", this.options.url);
        });
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for HealthCheck {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::testing::MockAdapter;

    fn dead_proxies(n: usize) -> Vec<Arc<Proxy>> {
        (0..n)
            .map(|i| {
                let adapter = MockAdapter::new(&format!("p{i}"));
                adapter.set_up(false);
                Proxy::new(adapter)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_check_tests_every_proxy() {
        let proxies = dead_proxies(12);
        let hc = HealthCheck::new(proxies.clone(), HealthCheckOptions::default(), &CancellationToken::new());
        hc.check().await;
        for proxy in &proxies {
            assert!(!proxy.alive_for_test_url(DEFAULT_TEST_URL));
            assert_eq!(proxy.delay_history().len(), 1);
        }
    }

    #[tokio::test]
    async fn test_concurrent_check_is_skipped() {
        let proxies = dead_proxies(1);
        let hc = HealthCheck::new(proxies.clone(), HealthCheckOptions::default(), &CancellationToken::new());
        let guard = hc.running.lock().await;
        hc.check().await;
        drop(guard);
        assert!(proxies[0].delay_history().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lazy_checks_only_after_touch() {
        let proxies = dead_proxies(1);
        let options = HealthCheckOptions {
            interval: Duration::from_secs(60),
            ..Default::default()
        };
        let hc = HealthCheck::new(proxies.clone(), options, &CancellationToken::new());
        hc.start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(proxies[0].delay_history().len(), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(proxies[0].delay_history().len(), 1);

        hc.touch();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(proxies[0].delay_history().len(), 2);
        hc.close();
    }
}
