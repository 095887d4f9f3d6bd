use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::Mutex;

use crate::adapter::{AdapterType, DEFAULT_TEST_URL, Proxy, ProxyAdapter};
use crate::bufio::{AsyncStream, PacketConn};
use crate::metadata::Metadata;
use crate::provider::ProxyProvider;

pub const DEFAULT_MAX_FAILED_TIMES: usize = 5;
pub const DEFAULT_FAILED_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct GroupOptions {
    pub name: String,
    pub test_url: String,
    pub max_failed_times: usize,
    /// Failures further apart than this restart the count.
    pub failed_timeout: Duration,
    pub disable_udp: bool,
}

impl GroupOptions {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            test_url: DEFAULT_TEST_URL.to_string(),
            max_failed_times: DEFAULT_MAX_FAILED_TIMES,
            failed_timeout: DEFAULT_FAILED_TIMEOUT,
            disable_udp: false,
        }
    }
}

#[derive(Debug, Default)]
struct FailState {
    times: usize,
    first: Option<Instant>,
}

/// Member lookup and dial failure tracking shared by every group.
#[derive(Debug)]
pub struct GroupBase {
    options: GroupOptions,
    providers: Vec<Arc<dyn ProxyProvider>>,
    failed: Mutex<FailState>,
    failed_testing: Arc<AtomicBool>,
}

impl GroupBase {
    pub fn new(options: GroupOptions, providers: Vec<Arc<dyn ProxyProvider>>) -> Self {
        Self {
            options,
            providers,
            failed: Mutex::new(FailState::default()),
            failed_testing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn test_url(&self) -> &str {
        &self.options.test_url
    }

    pub fn disable_udp(&self) -> bool {
        self.options.disable_udp
    }

    pub fn providers(&self) -> &[Arc<dyn ProxyProvider>] {
        &self.providers
    }

    /// Every member of every provider, in provider order.
    pub fn get_proxies(&self, touch: bool) -> Vec<Arc<Proxy>> {
        let mut proxies = Vec::new();
        for provider in &self.providers {
            if touch {
                provider.touch();
            }
            proxies.extend(provider.proxies());
        }
        proxies
    }

    pub fn touch(&self) {
        for provider in &self.providers {
            provider.touch();
        }
    }

    pub async fn health_check(&self) {
        futures::future::join_all(self.providers.iter().map(|p| p.health_check())).await;
    }

    /// Counts a failed dial. Enough failures close together start a health check of every
    /// provider in the background.
    pub fn on_dial_failed(&self, member: AdapterType, error: &std::io::Error) {
        if matches!(member, AdapterType::Direct | AdapterType::Reject)
            || error.kind() == std::io::ErrorKind::Unsupported
        {
            return;
        }
        let mut failed = self.failed.lock();
        failed.times += 1;
        if failed.times == 1 {
            debug!("[Group] {} first failed", self.name());
            failed.first = Some(Instant::now());
            return;
        }
        if failed
            .first
            .is_none_or(|first| first.elapsed() > self.options.failed_timeout)
        {
            failed.times = 0;
            return;
        }
        debug!("[Group] {} failed count: {}", self.name(), failed.times);
        if failed.times < self.options.max_failed_times
            || self.failed_testing.swap(true, Ordering::AcqRel)
        {
            return;
        }
        warn!(
            "[Group] {} failed {} times, starting health check",
            self.name(),
            failed.times
        );
        let providers = self.providers.clone();
        let failed_testing = self.failed_testing.clone();
        let name = self.name().to_string();
        tokio::spawn(async move {
            futures::future::join_all(providers.iter().map(|p| p.health_check())).await;
            failed_testing.store(false, Ordering::Release);
            debug!("[Group] {name} health check finished");
        });
        failed.times = 0;
    }

    pub fn on_dial_success(&self) {
        if !self.failed_testing.load(Ordering::Acquire) {
            self.failed.lock().times = 0;
        }
    }

    pub(crate) fn failed_times(&self) -> usize {
        self.failed.lock().times
    }

    pub async fn dial_member(
        &self,
        proxy: &Arc<Proxy>,
        metadata: &Metadata,
    ) -> std::io::Result<Box<dyn AsyncStream>> {
        match proxy.dial_context(metadata).await {
            Ok(stream) => {
                self.on_dial_success();
                Ok(stream)
            }
            Err(e) => {
                self.on_dial_failed(proxy.adapter_type(), &e);
                Err(e)
            }
        }
    }

    pub async fn listen_packet_member(
        &self,
        proxy: &Arc<Proxy>,
        metadata: &Metadata,
    ) -> std::io::Result<Box<dyn PacketConn>> {
        match proxy.listen_packet_context(metadata).await {
            Ok(conn) => {
                self.on_dial_success();
                Ok(conn)
            }
            Err(e) => {
                self.on_dial_failed(proxy.adapter_type(), &e);
                Err(e)
            }
        }
    }

    pub fn close(&self) {
        for provider in &self.providers {
            provider.close();
        }
    }
}
