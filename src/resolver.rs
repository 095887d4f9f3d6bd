use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use lru::LruCache;
use parking_lot::Mutex;

use crate::address::NetLocation;

pub type ResolveFuture = Pin<Box<dyn Future<Output = std::io::Result<Vec<SocketAddr>>> + Send>>;

pub trait Resolver: Send + Sync + std::fmt::Debug {
    fn resolve_location(&self, location: &NetLocation) -> ResolveFuture;
}

#[derive(Debug, Default)]
pub struct NativeResolver;

impl NativeResolver {
    pub fn new() -> Self {
        NativeResolver
    }
}

impl Resolver for NativeResolver {
    fn resolve_location(&self, location: &NetLocation) -> ResolveFuture {
        if let Some(addr) = location.to_socket_addr_nonblocking() {
            return Box::pin(async move { Ok(vec![addr]) });
        }
        let host = location.address().to_string();
        let port = location.port();
        Box::pin(async move {
            let result = tokio::net::lookup_host((host.as_str(), port))
                .await
                .map(|r| r.filter(|addr| !addr.ip().is_unspecified()).collect::<Vec<_>>());
            debug!("[Resolver] {host}:{port} -> {result:?}");
            result
        })
    }
}

const CACHE_SIZE: usize = 4096;
const CACHE_TTL: Duration = Duration::from_secs(60);

/// Remembers successful lookups for a short while.
#[derive(Debug)]
pub struct CachingResolver {
    inner: Arc<dyn Resolver>,
    cache: Arc<Mutex<LruCache<NetLocation, (Vec<SocketAddr>, Instant)>>>,
}

impl CachingResolver {
    pub fn new(inner: Arc<dyn Resolver>) -> Self {
        Self {
            inner,
            cache: Arc::new(Mutex::new(LruCache::new(
                std::num::NonZeroUsize::new(CACHE_SIZE).unwrap_or(std::num::NonZeroUsize::MIN),
            ))),
        }
    }
}

impl Resolver for CachingResolver {
    fn resolve_location(&self, location: &NetLocation) -> ResolveFuture {
        if let Some((addrs, resolved_at)) = self.cache.lock().get(location)
            && resolved_at.elapsed() < CACHE_TTL
        {
            let addrs = addrs.clone();
            return Box::pin(async move { Ok(addrs) });
        }
        let lookup = self.inner.resolve_location(location);
        let cache = self.cache.clone();
        let location = location.clone();
        Box::pin(async move {
            let addrs = lookup.await?;
            if !addrs.is_empty() {
                cache.lock().put(location, (addrs.clone(), Instant::now()));
            }
            Ok(addrs)
        })
    }
}

pub async fn resolve_single_address(
    resolver: &Arc<dyn Resolver>,
    location: &NetLocation,
) -> std::io::Result<SocketAddr> {
    let resolve_results = resolver.resolve_location(location).await?;
    resolve_results.into_iter().next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("could not resolve location: {location}"),
        )
    })
}

/// Resolves the host part of `location` to one address, if it has any.
pub async fn resolve_ip(resolver: &Arc<dyn Resolver>, location: &NetLocation) -> Option<IpAddr> {
    if let Some(ip) = location.address().ip() {
        return Some(ip);
    }
    match resolve_single_address(resolver, location).await {
        Ok(addr) => Some(addr.ip()),
        Err(e) => {
            debug!("[Resolver] failed to resolve {location}: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct CountingResolver {
        calls: AtomicUsize,
    }

    impl Resolver for CountingResolver {
        fn resolve_location(&self, _location: &NetLocation) -> ResolveFuture {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Box::pin(async { Ok(vec!["192.0.2.7:80".parse().unwrap()]) })
        }
    }

    #[tokio::test]
    async fn test_caching_resolver_reuses_result() {
        let counting = Arc::new(CountingResolver::default());
        let resolver: Arc<dyn Resolver> = Arc::new(CachingResolver::new(counting.clone()));
        let location = NetLocation::from_str("example.com:80", None).unwrap();
        for _ in 0..3 {
            let addr = resolve_single_address(&resolver, &location).await.unwrap();
            assert_eq!(addr, "192.0.2.7:80".parse().unwrap());
        }
        assert_eq!(counting.calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_ip_location_skips_lookup() {
        let resolver: Arc<dyn Resolver> = Arc::new(NativeResolver::new());
        let location = NetLocation::from_str("10.1.2.3:443", None).unwrap();
        assert_eq!(
            resolve_ip(&resolver, &location).await,
            Some("10.1.2.3".parse().unwrap())
        );
    }
}
