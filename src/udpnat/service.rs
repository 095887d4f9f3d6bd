use std::fmt::Debug;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::conn::{Activity, NatConn, PacketWriter};
use super::context::{CancelContext, CloseCause};
use crate::address::NetLocation;
use crate::buf::Buffer;
use crate::metadata::Metadata;

/// Pending packets per flow before senders wait.
pub const FLOW_QUEUE_SIZE: usize = 64;

const DEFAULT_CAPACITY: usize = 4096;
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[async_trait]
pub trait UdpConnectionHandler: Send + Sync + Debug {
    /// Serves one flow until it ends. The flow is removed from the table when this returns.
    async fn new_packet_connection(&self, ctx: CancelContext, conn: NatConn, metadata: Metadata);
}

/// What the creator of a flow decides in its init callback.
pub struct FlowInit {
    pub metadata: Metadata,
    pub writer: PacketWriter,
}

struct Entry {
    id: u64,
    sender: mpsc::Sender<(Buffer, NetLocation)>,
    ctx: CancelContext,
    activity: Arc<Activity>,
}

struct Inner<K> {
    flows: Mutex<LruCache<K, Arc<Entry>>>,
    timeout: Duration,
    handler: Arc<dyn UdpConnectionHandler>,
    next_id: AtomicU64,
    cancel: CancellationToken,
}

impl<K: Hash + Eq + Clone> Inner<K> {
    fn remove_if_same(&self, key: &K, id: u64) -> bool {
        let mut flows = self.flows.lock();
        if flows.peek(key).is_some_and(|entry| entry.id == id) {
            flows.pop(key);
            return true;
        }
        false
    }

    fn sweep(&self) {
        let mut expired = Vec::new();
        {
            let mut flows = self.flows.lock();
            let keys: Vec<K> = flows
                .iter()
                .filter(|(_, entry)| {
                    entry.ctx.is_cancelled() || entry.activity.idle_for() >= self.timeout
                })
                .map(|(key, _)| key.clone())
                .collect();
            for key in keys {
                if let Some(entry) = flows.pop(&key) {
                    expired.push(entry);
                }
            }
        }
        if expired.is_empty() {
            return;
        }
        debug!("[UdpNat] sweeping {} idle flows", expired.len());
        for entry in expired {
            entry.ctx.cancel(CloseCause::IdleTimeout);
        }
    }
}

/// Demultiplexes packets into per-key flows, each served by its own handler task.
pub struct Service<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for Service<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: Hash + Eq> Debug for Service<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("timeout", &self.inner.timeout)
            .field("flows", &self.inner.flows.lock().len())
            .finish()
    }
}

fn sweep_interval(timeout: Duration) -> Duration {
    (timeout / 2).clamp(MIN_SWEEP_INTERVAL, MAX_SWEEP_INTERVAL)
}

impl<K> Service<K>
where
    K: Hash + Eq + Clone + Send + Sync + Debug + 'static,
{
    pub fn new(
        timeout: Duration,
        handler: Arc<dyn UdpConnectionHandler>,
        parent: &CancellationToken,
    ) -> Self {
        Self::with_capacity(timeout, DEFAULT_CAPACITY, handler, parent)
    }

    pub fn with_capacity(
        timeout: Duration,
        capacity: usize,
        handler: Arc<dyn UdpConnectionHandler>,
        parent: &CancellationToken,
    ) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        let inner = Arc::new(Inner {
            flows: Mutex::new(LruCache::new(capacity)),
            timeout,
            handler,
            next_id: AtomicU64::new(0),
            cancel: parent.child_token(),
        });

        let weak = Arc::downgrade(&inner);
        let cancel = inner.cancel.clone();
        let interval = sweep_interval(timeout);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = cancel.cancelled() => break,
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.sweep();
            }
        });

        Self { inner }
    }

    pub fn len(&self) -> usize {
        self.inner.flows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queues `buffer` for the flow of `key`, creating the flow first if there is none.
    ///
    /// Only the caller that creates a flow runs `init`; returning `None` from it drops the packet
    /// and the flow. Waits while the flow's queue is full, giving up when the flow or `caller`
    /// is cancelled.
    pub async fn new_context_packet<F>(
        &self,
        caller: &CancellationToken,
        key: K,
        buffer: Buffer,
        destination: NetLocation,
        init: F,
    ) where
        F: FnOnce(&CancelContext) -> Option<FlowInit>,
    {
        let mut init = Some(init);
        let mut packet = Some((buffer, destination));

        for attempt in 0..2 {
            if caller.is_cancelled() {
                return;
            }
            let (entry, receiver) = self.load_or_create(&key);

            if let Some(receiver) = receiver {
                let Some(flow) = init.take().and_then(|init| init(&entry.ctx)) else {
                    self.inner.remove_if_same(&key, entry.id);
                    entry.ctx.cancel(CloseCause::Closed);
                    return;
                };
                self.spawn_handler(key.clone(), entry.clone(), receiver, flow);
            }

            if entry.ctx.is_cancelled() {
                self.inner.remove_if_same(&key, entry.id);
                debug!("[UdpNat] flow {key:?} was closed, attempt {attempt}");
                continue;
            }

            let Some(queued) = packet.take() else {
                return;
            };
            tokio::select! {
                biased;
                sent = entry.sender.send(queued) => match sent {
                    Ok(()) => {
                        entry.activity.touch();
                        return;
                    }
                    Err(mpsc::error::SendError(returned)) => {
                        packet = Some(returned);
                        self.inner.remove_if_same(&key, entry.id);
                    }
                },
                _ = entry.ctx.cancelled() => return,
                _ = caller.cancelled() => return,
            }
        }
        debug!("[UdpNat] dropping packet for {key:?}: flow keeps closing");
    }

    fn load_or_create(
        &self,
        key: &K,
    ) -> (Arc<Entry>, Option<mpsc::Receiver<(Buffer, NetLocation)>>) {
        let mut flows = self.inner.flows.lock();
        if let Some(entry) = flows.get(key) {
            return (entry.clone(), None);
        }
        let (sender, receiver) = mpsc::channel(FLOW_QUEUE_SIZE);
        let entry = Arc::new(Entry {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            sender,
            ctx: CancelContext::new(&self.inner.cancel),
            activity: Arc::new(Activity::new()),
        });
        if let Some((evicted_key, evicted)) = flows.push(key.clone(), entry.clone())
            && evicted_key != *key
        {
            debug!("[UdpNat] evicting flow {evicted_key:?}");
            evicted.ctx.cancel(CloseCause::Evicted);
        }
        (entry, Some(receiver))
    }

    fn spawn_handler(
        &self,
        key: K,
        entry: Arc<Entry>,
        receiver: mpsc::Receiver<(Buffer, NetLocation)>,
        flow: FlowInit,
    ) {
        let inner = self.inner.clone();
        let conn = NatConn::new(
            receiver,
            flow.writer,
            entry.ctx.clone(),
            entry.activity.clone(),
        );
        tokio::spawn(async move {
            inner
                .handler
                .new_packet_connection(entry.ctx.clone(), conn, flow.metadata)
                .await;
            inner.remove_if_same(&key, entry.id);
            entry.ctx.cancel(CloseCause::Closed);
        });
    }

    /// Closes every flow and stops the sweeper.
    pub fn close(&self) {
        let entries: Vec<_> = {
            let mut flows = self.inner.flows.lock();
            let entries = flows.iter().map(|(_, e)| e.clone()).collect();
            flows.clear();
            entries
        };
        if !entries.is_empty() {
            warn!("[UdpNat] closing {} active flows", entries.len());
        }
        for entry in entries {
            entry.ctx.cancel(CloseCause::Closed);
        }
        self.inner.cancel.cancel();
    }
}
