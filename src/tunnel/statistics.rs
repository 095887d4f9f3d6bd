//! Live connection trackers and traffic totals.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use dashmap::DashMap;
use log::info;
use tokio_util::sync::CancellationToken;

use crate::bufio::CountFn;
use crate::metadata::Metadata;

/// One relayed connection or UDP flow.
#[derive(Debug)]
pub struct TrackerInfo {
    pub id: u64,
    pub metadata: Metadata,
    /// Outermost proxy first, the leaf that carried the traffic last.
    pub chain: Vec<String>,
    pub rule: String,
    pub start: SystemTime,
    upload: AtomicU64,
    download: AtomicU64,
    cancel: CancellationToken,
}

impl TrackerInfo {
    pub fn upload(&self) -> u64 {
        self.upload.load(Ordering::Relaxed)
    }

    pub fn download(&self) -> u64 {
        self.download.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Statistics {
    connections: DashMap<u64, Arc<TrackerInfo>>,
    next_id: AtomicU64,
    upload_total: AtomicU64,
    download_total: AtomicU64,
}

impl Statistics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a connection. It stays listed until the returned tracker is dropped.
    pub fn track(
        self: &Arc<Self>,
        metadata: Metadata,
        chain: Vec<String>,
        rule: String,
        parent: &CancellationToken,
    ) -> Tracker {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let info = Arc::new(TrackerInfo {
            id,
            metadata,
            chain,
            rule,
            start: SystemTime::now(),
            upload: AtomicU64::new(0),
            download: AtomicU64::new(0),
            cancel: parent.child_token(),
        });
        self.connections.insert(id, info.clone());
        Tracker {
            info,
            statistics: self.clone(),
        }
    }

    pub fn upload_total(&self) -> u64 {
        self.upload_total.load(Ordering::Relaxed)
    }

    pub fn download_total(&self) -> u64 {
        self.download_total.load(Ordering::Relaxed)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connections(&self) -> Vec<Arc<TrackerInfo>> {
        self.connections.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Cancels one connection. Returns false if it is no longer tracked.
    pub fn close(&self, id: u64) -> bool {
        match self.connections.get(&id) {
            Some(info) => {
                info.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn close_all(&self) {
        let count = self.connections.len();
        if count > 0 {
            info!("[Tunnel] closing {count} connections");
        }
        for entry in self.connections.iter() {
            entry.value().cancel.cancel();
        }
    }
}

/// Handle held by the relay for the lifetime of one connection.
#[derive(Debug)]
pub struct Tracker {
    info: Arc<TrackerInfo>,
    statistics: Arc<Statistics>,
}

impl Tracker {
    pub fn info(&self) -> &Arc<TrackerInfo> {
        &self.info
    }

    /// Cancelled by [`Statistics::close`] and [`Statistics::close_all`].
    pub fn token(&self) -> &CancellationToken {
        &self.info.cancel
    }

    /// Counts bytes sent towards the remote.
    pub fn upload_counter(&self) -> CountFn {
        let info = self.info.clone();
        let statistics = self.statistics.clone();
        Arc::new(move |n| {
            info.upload.fetch_add(n, Ordering::Relaxed);
            statistics.upload_total.fetch_add(n, Ordering::Relaxed);
        })
    }

    /// Counts bytes received from the remote.
    pub fn download_counter(&self) -> CountFn {
        let info = self.info.clone();
        let statistics = self.statistics.clone();
        Arc::new(move |n| {
            info.download.fetch_add(n, Ordering::Relaxed);
            statistics.download_total.fetch_add(n, Ordering::Relaxed);
        })
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        self.statistics.connections.remove(&self.info.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::NetLocation;
    use crate::metadata::Network;

    fn metadata() -> Metadata {
        Metadata::new(
            Network::Tcp,
            NetLocation::UNSPECIFIED,
            NetLocation::from_str("example.com:443", None).unwrap(),
        )
    }

    #[test]
    fn test_counters_and_removal() {
        let statistics = Statistics::new();
        let root = CancellationToken::new();
        let tracker = statistics.track(metadata(), vec!["DIRECT".into()], "Match".into(), &root);
        (tracker.upload_counter())(10);
        (tracker.download_counter())(25);
        (tracker.download_counter())(5);
        assert_eq!(tracker.info().upload(), 10);
        assert_eq!(tracker.info().download(), 30);
        assert_eq!(statistics.upload_total(), 10);
        assert_eq!(statistics.download_total(), 30);
        assert_eq!(statistics.connection_count(), 1);

        drop(tracker);
        assert_eq!(statistics.connection_count(), 0);
        assert_eq!(statistics.download_total(), 30);
    }

    #[test]
    fn test_close_all_cancels_trackers() {
        let statistics = Statistics::new();
        let root = CancellationToken::new();
        let a = statistics.track(metadata(), Vec::new(), String::new(), &root);
        let b = statistics.track(metadata(), Vec::new(), String::new(), &root);
        assert!(statistics.close(a.info().id));
        assert!(a.token().is_cancelled());
        assert!(!b.token().is_cancelled());
        statistics.close_all();
        assert!(b.token().is_cancelled());
        assert!(!root.is_cancelled());
    }
}
