//! Synchronization layer: fans full-state snapshots out to observers.
//!
//! Every accepted mutation (local or from another client, via the backend
//! watch) ends in one `publish`. Observers hold a [`Subscription`] that
//! yields whole snapshots; a slow observer skips straight to the newest one.
//! There is no merging: the last snapshot published wins.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use futures::Stream;
use tokio::sync::watch;
use ulid::Ulid;

use crate::model::{Instrument, Reservation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No snapshot received from the backend yet.
    Connecting,
    Connected,
    /// Backend unreachable. Reads serve the stale cache; writes fail.
    Degraded,
}

impl ConnectionStatus {
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Degraded => "degraded",
        }
    }
}

/// Full client-visible state at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub version: u64,
    pub status: ConnectionStatus,
    /// Sorted by id.
    pub instruments: Vec<Instrument>,
    /// Sorted by id.
    pub reservations: Vec<Reservation>,
}

impl Snapshot {
    fn empty() -> Self {
        Self {
            version: 0,
            status: ConnectionStatus::Connecting,
            instruments: Vec::new(),
            reservations: Vec::new(),
        }
    }
}

struct HubInner {
    tx: watch::Sender<Arc<Snapshot>>,
    listeners: DashMap<Ulid, ()>,
}

/// Owner of the snapshot channel. Cloning shares the same channel.
#[derive(Clone)]
pub struct SyncHub {
    inner: Arc<HubInner>,
}

impl Default for SyncHub {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncHub {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Arc::new(Snapshot::empty()));
        Self {
            inner: Arc::new(HubInner {
                tx,
                listeners: DashMap::new(),
            }),
        }
    }

    /// Replace the published state wholesale. Returns the new version.
    pub fn publish(
        &self,
        status: ConnectionStatus,
        instruments: Vec<Instrument>,
        reservations: Vec<Reservation>,
    ) -> u64 {
        let version = self.inner.tx.borrow().version + 1;
        self.inner.tx.send_replace(Arc::new(Snapshot {
            version,
            status,
            instruments,
            reservations,
        }));
        version
    }

    pub fn latest(&self) -> Arc<Snapshot> {
        self.inner.tx.borrow().clone()
    }

    /// Register an observer. The handle yields the current snapshot first.
    pub fn subscribe(&self) -> Subscription {
        let id = Ulid::new();
        self.inner.listeners.insert(id, ());
        metrics::gauge!(crate::observability::SUBSCRIBERS_ACTIVE).increment(1.0);
        Subscription {
            id,
            rx: self.inner.tx.subscribe(),
            hub: Arc::downgrade(&self.inner),
            primed: false,
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }
}

/// One observer's handle on the snapshot sequence. Infinite while the hub
/// lives; ends on `unsubscribe` (or drop).
pub struct Subscription {
    id: Ulid,
    rx: watch::Receiver<Arc<Snapshot>>,
    hub: Weak<HubInner>,
    primed: bool,
}

impl Subscription {
    pub fn id(&self) -> Ulid {
        self.id
    }

    /// The current snapshot on first call, then each newer one.
    /// `None` once the hub has been dropped.
    pub async fn next(&mut self) -> Option<Arc<Snapshot>> {
        if !self.primed {
            self.primed = true;
            return Some(self.rx.borrow_and_update().clone());
        }
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// The newest snapshot, without waiting or marking it seen.
    pub fn current(&self) -> Arc<Snapshot> {
        self.rx.borrow().clone()
    }

    pub fn unsubscribe(self) {}

    pub fn into_stream(self) -> impl Stream<Item = Arc<Snapshot>> {
        futures::stream::unfold(self, |mut sub| async move {
            let snapshot = sub.next().await?;
            Some((snapshot, sub))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade()
            && hub.listeners.remove(&self.id).is_some()
        {
            metrics::gauge!(crate::observability::SUBSCRIBERS_ACTIVE).decrement(1.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio_test::{assert_pending, assert_ready, task};

    fn instrument(id: u64) -> Instrument {
        Instrument {
            id,
            name: format!("inst-{id}"),
            description: String::new(),
            location: String::new(),
        }
    }

    #[tokio::test]
    async fn first_next_yields_current_snapshot() {
        let hub = SyncHub::new();
        hub.publish(ConnectionStatus::Connected, vec![instrument(1)], vec![]);

        let mut sub = hub.subscribe();
        let snap = sub.next().await.unwrap();
        assert_eq!(snap.version, 1);
        assert_eq!(snap.status, ConnectionStatus::Connected);
        assert_eq!(snap.instruments.len(), 1);
    }

    #[test]
    fn next_is_pending_until_publish() {
        let hub = SyncHub::new();
        let mut sub = hub.subscribe();
        {
            let mut first = task::spawn(sub.next());
            assert_ready!(first.poll());
        }

        let mut waiting = task::spawn(sub.next());
        assert_pending!(waiting.poll());
        hub.publish(ConnectionStatus::Connected, vec![], vec![]);
        assert!(waiting.is_woken());
        let snap = assert_ready!(waiting.poll()).unwrap();
        assert_eq!(snap.version, 1);
    }

    #[tokio::test]
    async fn slow_observer_sees_only_latest() {
        let hub = SyncHub::new();
        let mut sub = hub.subscribe();
        let _ = sub.next().await;

        hub.publish(ConnectionStatus::Connected, vec![instrument(1)], vec![]);
        hub.publish(ConnectionStatus::Connected, vec![instrument(1), instrument(2)], vec![]);
        hub.publish(ConnectionStatus::Degraded, vec![instrument(2)], vec![]);

        let snap = sub.next().await.unwrap();
        assert_eq!(snap.version, 3);
        assert_eq!(snap.status, ConnectionStatus::Degraded);
        assert_eq!(snap.instruments, vec![instrument(2)]);
    }

    #[test]
    fn unsubscribe_releases_listener() {
        let hub = SyncHub::new();
        let a = hub.subscribe();
        let b = hub.subscribe();
        assert_eq!(hub.listener_count(), 2);
        assert_ne!(a.id(), b.id());

        a.unsubscribe();
        assert_eq!(hub.listener_count(), 1);
        drop(b);
        assert_eq!(hub.listener_count(), 0);
    }

    #[tokio::test]
    async fn stream_ends_when_hub_dropped() {
        let hub = SyncHub::new();
        let stream = hub.subscribe().into_stream();
        hub.publish(ConnectionStatus::Connected, vec![], vec![]);
        drop(hub);

        let seen: Vec<_> = stream.collect().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].version, 1);
    }
}
