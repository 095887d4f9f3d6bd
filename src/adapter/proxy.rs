use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;

use super::{AdapterType, Dialer, ProxyAdapter};
use crate::address::{Address, NetLocation};
use crate::bufio::{AsyncStream, PacketConn};
use crate::metadata::{Metadata, Network};
use crate::stream_reader::StreamReader;

pub const DEFAULT_TEST_URL: &str = "http://www.gstatic.com/generate_204";
pub const MAX_HISTORY: usize = 10;

const UNKNOWN_DELAY: u16 = u16::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayRecord {
    pub time: SystemTime,
    /// Milliseconds, or 0 for a failed test.
    pub delay: u16,
}

#[derive(Debug)]
struct TestState {
    alive: bool,
    history: VecDeque<DelayRecord>,
}

impl Default for TestState {
    fn default() -> Self {
        Self {
            alive: true,
            history: VecDeque::with_capacity(MAX_HISTORY),
        }
    }
}

impl TestState {
    fn record(&mut self, record: DelayRecord) {
        self.alive = record.delay > 0;
        if self.history.len() == MAX_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(record);
    }

    fn last_delay(&self) -> u16 {
        if !self.alive {
            return UNKNOWN_DELAY;
        }
        match self.history.back() {
            Some(record) if record.delay > 0 => record.delay,
            _ => UNKNOWN_DELAY,
        }
    }
}

#[derive(Debug, Default)]
struct HealthState {
    global: TestState,
    per_url: HashMap<String, TestState>,
}

/// An adapter plus what health checks have learned about it.
#[derive(Debug)]
pub struct Proxy {
    adapter: Arc<dyn ProxyAdapter>,
    alive: AtomicBool,
    health: Mutex<HealthState>,
}

impl Proxy {
    pub fn new(adapter: Arc<dyn ProxyAdapter>) -> Arc<Self> {
        Arc::new(Self {
            adapter,
            alive: AtomicBool::new(true),
            health: Mutex::new(HealthState::default()),
        })
    }

    pub fn adapter(&self) -> &Arc<dyn ProxyAdapter> {
        &self.adapter
    }

    pub fn alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Health for `url`, falling back to the last result of any test when `url` was never tested.
    pub fn alive_for_test_url(&self, url: &str) -> bool {
        if let Some(state) = self.health.lock().per_url.get(url) {
            return state.alive;
        }
        self.alive()
    }

    /// Last measured delay for `url` in milliseconds, `u16::MAX` when dead or never tested.
    pub fn last_delay_for_test_url(&self, url: &str) -> u16 {
        let health = self.health.lock();
        match health.per_url.get(url) {
            Some(state) => state.last_delay(),
            None if self.alive() => health.global.last_delay(),
            None => UNKNOWN_DELAY,
        }
    }

    pub fn delay_history(&self) -> Vec<DelayRecord> {
        self.health.lock().global.history.iter().copied().collect()
    }

    pub fn delay_history_for_test_url(&self, url: &str) -> Vec<DelayRecord> {
        self.health
            .lock()
            .per_url
            .get(url)
            .map(|state| state.history.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Stores one test result; a zero delay marks the proxy dead.
    pub(crate) fn record_test(&self, url: &str, delay: u16) {
        let record = DelayRecord {
            time: SystemTime::now(),
            delay,
        };
        let mut health = self.health.lock();
        health.global.record(record);
        health.per_url.entry(url.to_string()).or_default().record(record);
        self.alive.store(delay > 0, Ordering::Release);
    }

    /// Measures a request to `url` through this proxy and records the result.
    ///
    /// `http` URLs time a `HEAD` request up to its status line. `https` URLs time the connection
    /// only.
    pub async fn url_test(&self, url: &str, timeout: Duration) -> std::io::Result<u16> {
        let result = tokio::time::timeout(timeout, self.measure(url))
            .await
            .unwrap_or_else(|_| {
                Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("url test {url} timed out"),
                ))
            });
        match result {
            Ok(delay) => {
                self.record_test(url, delay);
                Ok(delay)
            }
            Err(e) => {
                debug!("[HealthCheck] {} failed {url}: {e}", self.name());
                self.record_test(url, 0);
                Err(e)
            }
        }
    }

    async fn measure(&self, url: &str) -> std::io::Result<u16> {
        let test_url = TestUrl::parse(url)?;
        let start = Instant::now();
        let metadata = Metadata::new(Network::Tcp, NetLocation::UNSPECIFIED, test_url.location.clone());
        let mut stream = self.adapter.dial_context(&metadata).await?;
        if !test_url.tls {
            let host = test_url.host_header();
            let request = format!(
                "HEAD {} HTTP/1.1\r\nHost: {host}\r\nUser-Agent: burrow\r\nConnection: close\r\n\r\n",
                test_url.path
            );
            stream.write_all(request.as_bytes()).await?;
            stream.flush().await?;
            let mut reader = StreamReader::with_capacity(1024);
            let status = reader.read_line(&mut stream).await?;
            if !status.starts_with("HTTP/1.") {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unexpected url test response: {status}"),
                ));
            }
        }
        let _ = stream.shutdown().await;
        let elapsed = start.elapsed().as_millis().clamp(1, u16::MAX as u128 - 1);
        Ok(elapsed as u16)
    }
}

struct TestUrl {
    tls: bool,
    location: NetLocation,
    path: String,
}

impl TestUrl {
    fn parse(url: &str) -> std::io::Result<Self> {
        let invalid = || {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid test url: {url}"),
            )
        };
        let (tls, rest) = if let Some(rest) = url.strip_prefix("http://") {
            (false, rest)
        } else if let Some(rest) = url.strip_prefix("https://") {
            (true, rest)
        } else {
            return Err(invalid());
        };
        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };
        let default_port = if tls { 443 } else { 80 };
        let location = NetLocation::from_str(authority, Some(default_port)).map_err(|_| invalid())?;
        Ok(Self {
            tls,
            location,
            path: path.to_string(),
        })
    }

    fn host_header(&self) -> String {
        let host = match self.location.address() {
            Address::Ipv6(addr) => format!("[{addr}]"),
            address => address.to_string(),
        };
        match (self.tls, self.location.port()) {
            (false, 80) | (true, 443) => host,
            (_, port) => format!("{host}:{port}"),
        }
    }
}

#[async_trait]
impl ProxyAdapter for Proxy {
    fn name(&self) -> &str {
        self.adapter.name()
    }

    fn adapter_type(&self) -> AdapterType {
        self.adapter.adapter_type()
    }

    fn addr(&self) -> String {
        self.adapter.addr()
    }

    fn support_udp(&self) -> bool {
        self.adapter.support_udp()
    }

    fn support_uot(&self) -> bool {
        self.adapter.support_uot()
    }

    fn support_with_dialer(&self) -> bool {
        self.adapter.support_with_dialer()
    }

    async fn dial_context(&self, metadata: &Metadata) -> std::io::Result<Box<dyn AsyncStream>> {
        self.adapter.dial_context(metadata).await
    }

    async fn listen_packet_context(
        &self,
        metadata: &Metadata,
    ) -> std::io::Result<Box<dyn PacketConn>> {
        self.adapter.listen_packet_context(metadata).await
    }

    async fn dial_with_dialer(
        &self,
        dialer: Arc<dyn Dialer>,
        metadata: &Metadata,
    ) -> std::io::Result<Box<dyn AsyncStream>> {
        self.adapter.dial_with_dialer(dialer, metadata).await
    }

    async fn listen_packet_with_dialer(
        &self,
        dialer: Arc<dyn Dialer>,
        metadata: &Metadata,
    ) -> std::io::Result<Box<dyn PacketConn>> {
        self.adapter.listen_packet_with_dialer(dialer, metadata).await
    }

    fn unwrap(&self, metadata: &Metadata, touch: bool) -> Option<Arc<Proxy>> {
        self.adapter.unwrap(metadata, touch)
    }

    fn members(&self) -> Vec<Arc<Proxy>> {
        self.adapter.members()
    }

    async fn close(&self) {
        self.adapter.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::testing::MockAdapter;
    use crate::adapter::{Direct, SystemDialer};
    use crate::resolver::NativeResolver;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_parse_test_url() {
        let url = TestUrl::parse("http://www.gstatic.com/generate_204").unwrap();
        assert!(!url.tls);
        assert_eq!(url.location.to_string(), "www.gstatic.com:80");
        assert_eq!(url.path, "/generate_204");
        assert_eq!(url.host_header(), "www.gstatic.com");

        let url = TestUrl::parse("https://[::1]:8443").unwrap();
        assert!(url.tls);
        assert_eq!(url.location.port(), 8443);
        assert_eq!(url.path, "/");
        assert_eq!(url.host_header(), "[::1]:8443");

        assert!(TestUrl::parse("ftp://example.com").is_err());
    }

    #[tokio::test]
    async fn test_url_test_records_history() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut conn, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 512];
                    let _ = conn.read(&mut buf).await;
                    let _ = conn.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").await;
                });
            }
        });

        let direct = Direct::new("DIRECT", SystemDialer::new(Arc::new(NativeResolver::new()), None));
        let proxy = Proxy::new(Arc::new(direct));
        let url = format!("http://{addr}/generate_204");
        for _ in 0..MAX_HISTORY + 2 {
            let delay = proxy.url_test(&url, Duration::from_secs(5)).await.unwrap();
            assert!(delay >= 1);
        }
        assert!(proxy.alive_for_test_url(&url));
        assert_eq!(proxy.delay_history().len(), MAX_HISTORY);
        assert_eq!(proxy.delay_history_for_test_url(&url).len(), MAX_HISTORY);
        assert_ne!(proxy.last_delay_for_test_url(&url), u16::MAX);
    }

    #[tokio::test]
    async fn test_failed_test_marks_dead() {
        let adapter = MockAdapter::new("a");
        adapter.set_up(false);
        let proxy = Proxy::new(adapter);
        assert!(proxy.alive_for_test_url(DEFAULT_TEST_URL));
        assert!(proxy.url_test(DEFAULT_TEST_URL, Duration::from_secs(1)).await.is_err());
        assert!(!proxy.alive());
        assert!(!proxy.alive_for_test_url(DEFAULT_TEST_URL));
        assert_eq!(proxy.last_delay_for_test_url(DEFAULT_TEST_URL), u16::MAX);
        assert_eq!(proxy.delay_history()[0].delay, 0);
        // Another url that was never tested follows the overall state.
        assert!(!proxy.alive_for_test_url("http://example.com/"));
    }
}
