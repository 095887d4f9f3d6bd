use std::hash::Hasher;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use rustc_hash::FxHasher;

use super::{GroupBase, empty_group};
use crate::adapter::{AdapterType, Proxy, ProxyAdapter};
use crate::bufio::{AsyncStream, PacketConn};
use crate::environment::Environment;
use crate::metadata::Metadata;

const MAX_RETRY: u64 = 5;
const STICKY_CACHE_SIZE: usize = 1000;
const STICKY_TTL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    RoundRobin,
    ConsistentHashing,
    StickySessions,
}

impl Strategy {
    pub fn from_name(name: &str) -> std::io::Result<Self> {
        match name {
            "round-robin" => Ok(Strategy::RoundRobin),
            "consistent-hashing" => Ok(Strategy::ConsistentHashing),
            "sticky-sessions" => Ok(Strategy::StickySessions),
            _ => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("unknown load balance strategy: {name}"),
            )),
        }
    }
}

/// Google's jump consistent hash: maps `key` to a bucket in `0..buckets`.
fn jump_hash(mut key: u64, buckets: usize) -> usize {
    let buckets = buckets as i64;
    let mut b: i64 = 0;
    let mut j: i64 = 0;
    while j < buckets {
        b = j;
        key = key.wrapping_mul(2862933555777941757).wrapping_add(1);
        j = ((b + 1) as f64 * ((1i64 << 31) as f64 / ((key >> 33) + 1) as f64)) as i64;
    }
    b as usize
}

fn hash_key(key: &str) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write(key.as_bytes());
    hasher.finish()
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

enum StrategyState {
    RoundRobin(Mutex<usize>),
    ConsistentHashing,
    StickySessions(Mutex<LruCache<u64, (usize, Instant)>>),
}

/// Spreads connections over the alive members.
pub struct LoadBalance {
    base: GroupBase,
    env: Arc<Environment>,
    state: StrategyState,
}

impl std::fmt::Debug for LoadBalance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalance")
            .field("base", &self.base)
            .field("strategy", &self.strategy())
            .finish()
    }
}

impl LoadBalance {
    pub fn new(base: GroupBase, strategy: Strategy, env: Arc<Environment>) -> Self {
        let state = match strategy {
            Strategy::RoundRobin => StrategyState::RoundRobin(Mutex::new(0)),
            Strategy::ConsistentHashing => StrategyState::ConsistentHashing,
            Strategy::StickySessions => StrategyState::StickySessions(Mutex::new(LruCache::new(
                NonZeroUsize::new(STICKY_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN),
            ))),
        };
        Self { base, env, state }
    }

    pub fn strategy(&self) -> Strategy {
        match self.state {
            StrategyState::RoundRobin(_) => Strategy::RoundRobin,
            StrategyState::ConsistentHashing => Strategy::ConsistentHashing,
            StrategyState::StickySessions(_) => Strategy::StickySessions,
        }
    }

    fn alive(&self, proxy: &Proxy) -> bool {
        proxy.alive_for_test_url(self.base.test_url())
    }

    /// IP hosts as-is, domains by registrable domain, otherwise the resolved address.
    fn key(&self, metadata: &Metadata) -> String {
        if let Some(host) = metadata.domain() {
            if host.parse::<IpAddr>().is_ok() {
                return host.to_string();
            }
            if let Some(domain) = self.env.effective_tld_plus_one(host) {
                return domain;
            }
        }
        metadata
            .dst_ip
            .map(|ip| ip.to_string())
            .unwrap_or_default()
    }

    fn round_robin(&self, idx: &Mutex<usize>, proxies: &[Arc<Proxy>], touch: bool) -> Arc<Proxy> {
        let mut idx = idx.lock();
        let length = proxies.len();
        let mut found = None;
        let mut i = 0;
        while i < length {
            let proxy = &proxies[(*idx + i) % length];
            i += 1;
            if self.alive(proxy) {
                found = Some(proxy.clone());
                break;
            }
        }
        if touch {
            *idx = (*idx + i) % length;
        }
        found.unwrap_or_else(|| proxies[0].clone())
    }

    fn consistent_hashing(&self, proxies: &[Arc<Proxy>], metadata: &Metadata) -> Arc<Proxy> {
        let mut key = hash_key(&self.key(metadata));
        for _ in 0..MAX_RETRY {
            let proxy = &proxies[jump_hash(key, proxies.len())];
            if self.alive(proxy) {
                return proxy.clone();
            }
            key = key.wrapping_add(1);
        }
        proxies
            .iter()
            .find(|proxy| self.alive(proxy))
            .unwrap_or(&proxies[0])
            .clone()
    }

    fn sticky_sessions(
        &self,
        cache: &Mutex<LruCache<u64, (usize, Instant)>>,
        proxies: &[Arc<Proxy>],
        metadata: &Metadata,
    ) -> Arc<Proxy> {
        let src = metadata.src_ip().map(|ip| ip.to_string()).unwrap_or_default();
        let key = hash_key(&format!("{src}{}", self.key(metadata)));
        let length = proxies.len();
        let mut cache = cache.lock();
        let cached = cache
            .get(&key)
            .filter(|(idx, at)| *idx < length && at.elapsed() < STICKY_TTL)
            .map(|(idx, _)| *idx);
        let idx = cached.unwrap_or_else(|| jump_hash(key.wrapping_add(now_nanos()), length));
        let mut now_idx = idx;
        for _ in 1..MAX_RETRY {
            let proxy = &proxies[now_idx];
            if self.alive(proxy) {
                if cached.is_none() || now_idx != idx {
                    cache.put(key, (now_idx, Instant::now()));
                }
                return proxy.clone();
            }
            now_idx = jump_hash(key.wrapping_add(now_nanos()), length);
        }
        cache.put(key, (0, Instant::now()));
        proxies[0].clone()
    }

    fn select_proxy(&self, metadata: &Metadata, touch: bool) -> Option<Arc<Proxy>> {
        let proxies = self.base.get_proxies(touch);
        if proxies.is_empty() {
            return None;
        }
        Some(match &self.state {
            StrategyState::RoundRobin(idx) => self.round_robin(idx, &proxies, touch),
            StrategyState::ConsistentHashing => self.consistent_hashing(&proxies, metadata),
            StrategyState::StickySessions(cache) => {
                self.sticky_sessions(cache, &proxies, metadata)
            }
        })
    }
}

#[async_trait]
impl ProxyAdapter for LoadBalance {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn adapter_type(&self) -> AdapterType {
        AdapterType::LoadBalance
    }

    fn support_udp(&self) -> bool {
        !self.base.disable_udp()
    }

    async fn dial_context(&self, metadata: &Metadata) -> std::io::Result<Box<dyn AsyncStream>> {
        let proxy = self
            .select_proxy(metadata, true)
            .ok_or_else(|| empty_group(self.name()))?;
        self.base.dial_member(&proxy, metadata).await
    }

    async fn listen_packet_context(
        &self,
        metadata: &Metadata,
    ) -> std::io::Result<Box<dyn PacketConn>> {
        let proxy = self
            .select_proxy(metadata, true)
            .ok_or_else(|| empty_group(self.name()))?;
        self.base.listen_packet_member(&proxy, metadata).await
    }

    fn unwrap(&self, metadata: &Metadata, touch: bool) -> Option<Arc<Proxy>> {
        self.select_proxy(metadata, touch)
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

    fn group(names: &[&str], strategy: Strategy) -> (LoadBalance, Vec<Arc<Proxy>>) {
        let (_, proxies) = mocks(names);
        let lb = LoadBalance::new(
            GroupBase::new(GroupOptions::new("lb"), provider(proxies.clone())),
            strategy,
            Environment::native(),
        );
        (lb, proxies)
    }

    fn metadata(source: &str, destination: &str) -> Metadata {
        Metadata::new(
            Network::Tcp,
            NetLocation::from_str(source, None).unwrap(),
            NetLocation::from_str(destination, None).unwrap(),
        )
    }

    fn pick(lb: &LoadBalance, m: &Metadata) -> String {
        lb.unwrap(m, true).unwrap().name().to_string()
    }

    #[test]
    fn test_jump_hash_range_and_stability() {
        for key in 0..1000u64 {
            let bucket = jump_hash(key, 7);
            assert!(bucket < 7);
            assert_eq!(bucket, jump_hash(key, 7));
        }
        assert_eq!(jump_hash(12345, 1), 0);
    }

    #[test]
    fn test_round_robin_skips_dead() {
        let (lb, proxies) = group(&["A", "B", "C"], Strategy::RoundRobin);
        proxies[1].record_test(lb.base.test_url(), 0);
        let m = metadata("10.0.0.1:1000", "example.com:80");
        let picks: Vec<_> = (0..3).map(|_| pick(&lb, &m)).collect();
        assert_eq!(picks, vec!["A", "C", "A"]);
    }

    #[test]
    fn test_round_robin_without_touch_does_not_advance() {
        let (lb, _) = group(&["A", "B"], Strategy::RoundRobin);
        let m = metadata("10.0.0.1:1000", "example.com:80");
        assert_eq!(lb.unwrap(&m, false).unwrap().name(), "A");
        assert_eq!(lb.unwrap(&m, false).unwrap().name(), "A");
        assert_eq!(pick(&lb, &m), "A");
        assert_eq!(pick(&lb, &m), "B");
    }

    #[test]
    fn test_consistent_hashing_groups_by_site() {
        let (lb, proxies) = group(&["A", "B", "C", "D"], Strategy::ConsistentHashing);
        let first = pick(&lb, &metadata("10.0.0.1:1000", "www.example.com:443"));
        for (source, host) in [
            ("10.0.0.2:2000", "api.example.com:443"),
            ("10.0.0.3:3000", "example.com:80"),
            ("10.0.0.1:1001", "www.example.com:443"),
        ] {
            assert_eq!(pick(&lb, &metadata(source, host)), first);
        }

        // With the chosen member dead another alive member is used, and stays stable.
        let dead = proxies.iter().find(|p| p.name() == first).unwrap();
        dead.record_test(lb.base.test_url(), 0);
        let second = pick(&lb, &metadata("10.0.0.1:1000", "www.example.com:443"));
        assert_ne!(second, first);
        assert_eq!(pick(&lb, &metadata("10.0.0.9:9", "cdn.example.com:443")), second);
    }

    #[test]
    fn test_consistent_hashing_dead_member_only_moves_its_keys() {
        let (lb, proxies) = group(&["A", "B", "C", "D"], Strategy::ConsistentHashing);
        let keys: Vec<_> = (0..200)
            .map(|i| metadata("10.0.0.1:1000", &format!("10.1.{i}.1:80")))
            .collect();
        let before: Vec<_> = keys.iter().map(|m| pick(&lb, m)).collect();
        assert!(before.iter().any(|name| name == "D"));

        proxies[3].record_test(lb.base.test_url(), 0);
        for (m, old) in keys.iter().zip(&before) {
            let now = pick(&lb, m);
            if old == "D" {
                assert_ne!(now, "D");
            } else {
                assert_eq!(&now, old, "{} moved off a live member", m.destination);
            }
        }
    }

    #[test]
    fn test_consistent_hashing_all_dead_uses_first() {
        let (lb, proxies) = group(&["A", "B"], Strategy::ConsistentHashing);
        for proxy in &proxies {
            proxy.record_test(lb.base.test_url(), 0);
        }
        assert_eq!(pick(&lb, &metadata("10.0.0.1:1", "example.com:80")), "A");
    }

    #[test]
    fn test_sticky_sessions_keep_source_on_member() {
        let (lb, _) = group(&["A", "B", "C", "D", "E"], Strategy::StickySessions);
        let m = metadata("10.0.0.1:1000", "www.example.com:443");
        let first = pick(&lb, &m);
        for _ in 0..10 {
            assert_eq!(pick(&lb, &m), first);
        }
        let other_port = metadata("10.0.0.1:2000", "img.example.com:443");
        assert_eq!(pick(&lb, &other_port), first);
    }

    #[test]
    fn test_key_uses_ip_host_and_dst_ip() {
        let (lb, _) = group(&["A"], Strategy::ConsistentHashing);
        assert_eq!(lb.key(&metadata("10.0.0.1:1", "1.2.3.4:80")), "1.2.3.4");
        let mut m = metadata("10.0.0.1:1", "a.b.example.co.uk:80");
        assert_eq!(lb.key(&m), "example.co.uk");
        m.host = Some("5.6.7.8".to_string());
        assert_eq!(lb.key(&m), "5.6.7.8");
    }

    #[tokio::test]
    async fn test_dial_failures_are_counted() {
        let (adapters, proxies) = mocks(&["A"]);
        adapters[0].set_up(false);
        let lb = LoadBalance::new(
            GroupBase::new(GroupOptions::new("lb"), provider(proxies)),
            Strategy::RoundRobin,
            Environment::native(),
        );
        assert!(lb.dial_context(&metadata("10.0.0.1:1", "example.com:80")).await.is_err());
        assert_eq!(lb.base.failed_times(), 1);
    }
}
