//! Source cache (§4.3): the single-writer/many-reader store behind one
//! upstream source, and the atomic snapshot+live-stream handoff new
//! subscribers attach through.
//!
//! `apply` is called only by that source's upstream protocol handler task.
//! Every subscriber and trigger instead calls [`SourceCache::snapshot_and_subscribe`]
//! or [`SourceCache::subscribe_live`], both of which take the same write lock
//! `apply` does — a subscriber registered under that lock can never miss an
//! event `apply` sends afterward, nor see one twice.
//!
//! Per-subscriber delivery uses a bounded `mpsc` per subscriber rather than a
//! shared broadcast channel: a slow subscriber's queue filling up evicts only
//! that subscriber (drop subscriber, never drop event, §4.6), instead of
//! forcing every receiver to skip the same lagged entries.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use tokio::sync::mpsc;
use tycostream_protocol::{Frontier, Key, Row, RowEvent, RowKind};

pub type SubscriberId = u64;

struct CacheInner {
    rows: HashMap<Key, Row>,
    frontier: Frontier,
    snapshot_complete: bool,
    subscribers: HashMap<SubscriberId, mpsc::Sender<RowEvent>>,
    /// Subscribers evicted by [`SourceCache::reset_and_resync_all`] rather
    /// than by a full queue. `unsubscribe` consults this to tell its caller
    /// which terminal error the eviction means (§4.2).
    resync_pending: HashSet<SubscriberId>,
}

pub struct SourceCache {
    pk_column: String,
    inner: RwLock<CacheInner>,
    next_subscriber_id: AtomicU64,
}

impl SourceCache {
    pub fn new(pk_column: impl Into<String>) -> Self {
        SourceCache {
            pk_column: pk_column.into(),
            inner: RwLock::new(CacheInner {
                rows: HashMap::new(),
                frontier: Frontier::MIN,
                snapshot_complete: false,
                subscribers: HashMap::new(),
                resync_pending: HashSet::new(),
            }),
            next_subscriber_id: AtomicU64::new(0),
        }
    }

    /// Apply one coalesced row event from the upstream handler. Updates the
    /// authoritative row map and fans the event out to every live
    /// subscriber, evicting any whose queue is full.
    pub fn apply(&self, event: RowEvent) {
        let mut inner = self.inner.write().unwrap();

        match event.kind {
            RowKind::Insert | RowKind::Update => {
                inner.rows.insert(event.key.clone(), event.row_after.clone());
            }
            RowKind::Delete => {
                inner.rows.remove(&event.key);
            }
        }
        if event.frontier_token > inner.frontier {
            inner.frontier = event.frontier_token;
        }

        let mut dead = Vec::new();
        for (&id, sender) in &inner.subscribers {
            if sender.try_send(event.clone()).is_err() {
                dead.push(id);
            }
        }
        for id in dead {
            inner.subscribers.remove(&id);
        }
    }

    /// Record that the upstream handler has caught up to a progress marker
    /// with no row changes attached. The first call marks the cache ready
    /// (§4.3's `snapshot_complete`); later calls just advance the frontier.
    pub fn advance_frontier(&self, token: Frontier) {
        let mut inner = self.inner.write().unwrap();
        if token > inner.frontier {
            inner.frontier = token;
        }
        inner.snapshot_complete = true;
    }

    /// Whether the cache has seen at least one progress marker and is safe
    /// to serve subscriptions from.
    pub fn is_ready(&self) -> bool {
        self.inner.read().unwrap().snapshot_complete
    }

    pub fn frontier(&self) -> Frontier {
        self.inner.read().unwrap().frontier
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.inner.read().unwrap().rows.contains_key(key)
    }

    /// Atomically clone the current row set, its frontier, and register a
    /// new live subscriber — the handoff §4.3 calls the hardest invariant.
    pub fn snapshot_and_subscribe(
        &self,
        queue_capacity: usize,
    ) -> (Vec<Row>, Frontier, SubscriberId, mpsc::Receiver<RowEvent>) {
        let mut inner = self.inner.write().unwrap();
        let rows: Vec<Row> = inner.rows.values().cloned().collect();
        let frontier = inner.frontier;
        let (tx, rx) = mpsc::channel(queue_capacity);
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        inner.subscribers.insert(id, tx);
        (rows, frontier, id, rx)
    }

    /// Register a live-only subscriber with no snapshot, used by the
    /// trigger engine (§4.5), which only ever evaluates transitions against
    /// the live tail.
    pub fn subscribe_live(
        &self,
        queue_capacity: usize,
    ) -> (Frontier, SubscriberId, mpsc::Receiver<RowEvent>) {
        let mut inner = self.inner.write().unwrap();
        let frontier = inner.frontier;
        let (tx, rx) = mpsc::channel(queue_capacity);
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        inner.subscribers.insert(id, tx);
        (frontier, id, rx)
    }

    /// Discard every cached row and evict every attached subscriber,
    /// marking each one as resync-evicted rather than lag-evicted. Called
    /// when the upstream handler loses its cursor and must resubscribe from
    /// scratch (§4.2's "Failure semantics"): the cache can no longer vouch
    /// for anything it held, and neither can a subscriber's in-progress
    /// snapshot, so both are torn down together.
    pub fn reset_and_resync_all(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.rows.clear();
        inner.frontier = Frontier::MIN;
        inner.snapshot_complete = false;
        for id in inner.subscribers.keys().copied().collect::<Vec<_>>() {
            inner.resync_pending.insert(id);
        }
        inner.subscribers.clear();
    }

    /// Remove a subscriber's registration. Returns whether it had been
    /// marked for resync by [`Self::reset_and_resync_all`] rather than
    /// evicted by its own full queue — the subscriber task uses this to
    /// choose between `UpstreamResync` and `SubscriberLagged`.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut inner = self.inner.write().unwrap();
        inner.subscribers.remove(&id);
        inner.resync_pending.remove(&id)
    }

    pub fn pk_column(&self) -> &str {
        &self.pk_column
    }

    #[cfg(test)]
    fn row_count(&self) -> usize {
        self.inner.read().unwrap().rows.len()
    }
}
