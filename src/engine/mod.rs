mod conflict;
mod error;
mod registry;
mod reservations;

pub use conflict::{Rejection, Verdict, evaluate};
pub use error::{BookingError, RecordKind};
pub use registry::{InstrumentRegistry, default_instruments};
pub use reservations::ReservationStore;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::model::*;
use crate::storage::{self, Backend, KeyPath, Revision, StorageError, Versioned, Watch};
use crate::sync::{ConnectionStatus, Snapshot, SyncHub, Subscription};

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Smallest id that is both at least `now` and above every id already seen.
pub(crate) fn next_id(max_existing: Option<u64>, now: Ms) -> u64 {
    let floor = max_existing.map_or(0, |m| m + 1);
    (now.max(0) as u64).max(floor)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Collection {
    Instruments,
    Reservations,
}

impl Collection {
    fn name(&self) -> &'static str {
        match self {
            Collection::Instruments => storage::INSTRUMENTS,
            Collection::Reservations => storage::RESERVATIONS,
        }
    }

    fn path(&self) -> KeyPath {
        storage::collection(self.name())
    }
}

/// The client's cached copy of both collections.
pub(crate) struct Cache {
    pub instruments: BTreeMap<InstrumentId, Instrument>,
    pub reservations: BTreeMap<ReservationId, Reservation>,
    instruments_rev: Option<Revision>,
    reservations_rev: Option<Revision>,
    /// Collections last seen stored as a JSON array rather than keyed by id.
    instruments_array: bool,
    reservations_array: bool,
    status: ConnectionStatus,
}

impl Cache {
    fn new() -> Self {
        Self {
            instruments: BTreeMap::new(),
            reservations: BTreeMap::new(),
            instruments_rev: None,
            reservations_rev: None,
            instruments_array: false,
            reservations_array: false,
            status: ConnectionStatus::Connecting,
        }
    }

    fn revision_mut(&mut self, collection: Collection) -> &mut Option<Revision> {
        match collection {
            Collection::Instruments => &mut self.instruments_rev,
            Collection::Reservations => &mut self.reservations_rev,
        }
    }

    fn array_shaped_mut(&mut self, collection: Collection) -> &mut bool {
        match collection {
            Collection::Instruments => &mut self.instruments_array,
            Collection::Reservations => &mut self.reservations_array,
        }
    }

    fn synced(&self) -> bool {
        self.instruments_rev.is_some() && self.reservations_rev.is_some()
    }
}

/// State shared between the engine handle and its background appliers.
pub(crate) struct Shared {
    backend: Arc<dyn Backend>,
    pub(crate) cache: RwLock<Cache>,
    /// Serializes local check-then-write sequences.
    pub(crate) write_gate: Mutex<()>,
    hub: SyncHub,
}

impl Shared {
    /// Publish the cache as a new snapshot. Caller holds the cache lock so
    /// snapshots leave in the order the cache changed.
    fn publish(&self, cache: &Cache) {
        self.hub.publish(
            cache.status,
            cache.instruments.values().cloned().collect(),
            cache.reservations.values().cloned().collect(),
        );
    }

    async fn apply_delivery(&self, collection: Collection, delivery: Versioned) {
        let mut cache = self.cache.write().await;
        if let Some(current) = *cache.revision_mut(collection)
            && delivery.revision < current
        {
            metrics::counter!(crate::observability::SNAPSHOTS_STALE_TOTAL).increment(1);
            debug!(
                "discarding stale {} snapshot r{} (have r{current})",
                collection.name(),
                delivery.revision
            );
            return;
        }

        match collection {
            Collection::Instruments => {
                cache.instruments = decode_collection(collection.name(), delivery.value.as_ref(), |i: &Instrument| i.id);
            }
            Collection::Reservations => {
                cache.reservations =
                    decode_collection(collection.name(), delivery.value.as_ref(), |r: &Reservation| r.id);
            }
        }
        *cache.revision_mut(collection) = Some(delivery.revision);
        *cache.array_shaped_mut(collection) = matches!(delivery.value, Some(Value::Array(_)));
        if cache.synced() && cache.status != ConnectionStatus::Connected {
            info!("storage connected");
            cache.status = ConnectionStatus::Connected;
        }
        metrics::counter!(crate::observability::SNAPSHOTS_APPLIED_TOTAL, "collection" => collection.name())
            .increment(1);
        debug!("applied {} snapshot r{}", collection.name(), delivery.revision);
        self.publish(&cache);
    }

    pub(crate) async fn mark_degraded(&self, cause: &(dyn std::fmt::Display + Sync)) {
        let mut cache = self.cache.write().await;
        if cache.status != ConnectionStatus::Degraded {
            warn!("storage degraded: {cause}");
            cache.status = ConnectionStatus::Degraded;
            self.publish(&cache);
        }
    }

    /// Write one record to the backend. Unreachable storage degrades the
    /// client and surfaces as `StorageUnavailable`; nothing is queued.
    /// Caller holds the write gate.
    pub(crate) async fn put_record<T: Serialize>(
        &self,
        collection: Collection,
        id: u64,
        record: &T,
    ) -> Result<Revision, BookingError> {
        let value = serde_json::to_value(record)
            .map_err(|e| BookingError::from(StorageError::Encoding(e.to_string())))?;
        let path = storage::record_path(collection.name(), id);
        let written = async {
            self.ensure_keyed(collection).await?;
            self.backend.write(&path, value).await
        };
        self.degrade_on_error(written.await).await
    }

    /// Caller holds the write gate.
    pub(crate) async fn delete_record(&self, collection: Collection, id: u64) -> Result<Revision, BookingError> {
        let path = storage::record_path(collection.name(), id);
        let deleted = async {
            self.ensure_keyed(collection).await?;
            self.backend.delete(&path).await
        };
        self.degrade_on_error(deleted.await).await
    }

    async fn degrade_on_error<T>(&self, result: Result<T, StorageError>) -> Result<T, BookingError> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                self.mark_degraded(&e).await;
                Err(e.into())
            }
        }
    }

    /// Record paths address records by id. A collection stored as an array
    /// is keyed by position instead, so rewrite it once as an object keyed
    /// by each record's `id` before touching any of its records.
    async fn ensure_keyed(&self, collection: Collection) -> Result<(), StorageError> {
        if !*self.cache.write().await.array_shaped_mut(collection) {
            return Ok(());
        }
        let path = collection.path();
        if let Some(Value::Array(items)) = self.backend.read(&path).await? {
            let keyed: Map<String, Value> = items
                .into_iter()
                .filter_map(|item| {
                    let id = item.get("id")?.as_u64()?;
                    Some((id.to_string(), item))
                })
                .collect();
            info!("{}: rekeying {} array records by id", collection.name(), keyed.len());
            self.backend.write(&path, Value::Object(keyed)).await?;
        }
        *self.cache.write().await.array_shaped_mut(collection) = false;
        Ok(())
    }

    /// Apply an accepted local write without waiting for the backend echo.
    /// Deliveries older than `revision` are then discarded for `collection`.
    async fn apply_local(&self, collection: Collection, revision: Revision, mutate: impl FnOnce(&mut Cache)) {
        let mut cache = self.cache.write().await;
        mutate(&mut cache);
        if let Some(rev) = cache.revision_mut(collection).as_mut() {
            *rev = (*rev).max(revision);
        }
        if cache.synced() {
            cache.status = ConnectionStatus::Connected;
        }
        self.publish(&cache);
    }
}

/// Decode a stored collection. Objects keyed by id and plain arrays are both
/// accepted; unreadable records are skipped.
fn decode_collection<T: DeserializeOwned>(
    name: &str,
    value: Option<&Value>,
    id_of: impl Fn(&T) -> u64,
) -> BTreeMap<u64, T> {
    let items: Vec<&Value> = match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Object(map)) => map.values().collect(),
        Some(Value::Array(items)) => items.iter().filter(|v| !v.is_null()).collect(),
        Some(other) => {
            warn!("{name}: expected a collection, found {other}");
            Vec::new()
        }
    };
    let mut out = BTreeMap::new();
    for item in items {
        match serde_json::from_value::<T>(item.clone()) {
            Ok(record) => {
                out.insert(id_of(&record), record);
            }
            Err(e) => warn!("{name}: skipping malformed record: {e}"),
        }
    }
    out
}

/// One client session: a local cache kept in sync with the backend, the
/// instrument registry and reservation store operating on it, and the hub
/// its observers subscribe to.
pub struct Engine {
    shared: Arc<Shared>,
    appliers: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Attach to `backend`, load both collections and keep them in sync.
    /// An unreachable backend yields a `Degraded` engine that keeps
    /// retrying every `retry`.
    pub async fn connect(backend: Arc<dyn Backend>, retry: Duration) -> Self {
        let shared = Arc::new(Shared {
            backend,
            cache: RwLock::new(Cache::new()),
            write_gate: Mutex::new(()),
            hub: SyncHub::new(),
        });

        let mut appliers = Vec::new();
        for collection in [Collection::Instruments, Collection::Reservations] {
            let watch = open_watch(&shared, collection).await;
            appliers.push(tokio::spawn(run_applier(shared.clone(), collection, watch, retry)));
        }

        Self { shared, appliers }
    }

    pub fn instruments(&self) -> InstrumentRegistry<'_> {
        InstrumentRegistry::new(&self.shared)
    }

    pub fn reservations(&self) -> ReservationStore<'_> {
        ReservationStore::new(&self.shared)
    }

    /// Observe every future state of this client.
    pub fn subscribe(&self) -> Subscription {
        self.shared.hub.subscribe()
    }

    pub fn hub(&self) -> &SyncHub {
        &self.shared.hub
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.shared.hub.latest()
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.shared.cache.read().await.status
    }

    /// Re-read both collections straight from the backend. On failure the
    /// stale cache stays in place and the client is marked degraded.
    ///
    /// Runs under the write gate and through the revision guard, so neither
    /// a local write in flight nor a newer delivery is rolled back.
    pub async fn refresh(&self) -> Result<(), BookingError> {
        let _gate = self.shared.write_gate.lock().await;
        let backend = &self.shared.backend;
        let read = async {
            let instruments = backend.read_versioned(&Collection::Instruments.path()).await?;
            let reservations = backend.read_versioned(&Collection::Reservations.path()).await?;
            Ok::<_, StorageError>((instruments, reservations))
        };
        let (instruments, reservations) = self.shared.degrade_on_error(read.await).await?;
        self.shared.apply_delivery(Collection::Instruments, instruments).await;
        self.shared.apply_delivery(Collection::Reservations, reservations).await;
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        for task in &self.appliers {
            task.abort();
        }
    }
}

/// Subscribe to a collection and apply its current value right away.
async fn open_watch(shared: &Shared, collection: Collection) -> Option<Watch> {
    match shared.backend.subscribe(&collection.path()).await {
        Ok(mut watch) => {
            if let Some(initial) = watch.next().await {
                shared.apply_delivery(collection, initial).await;
            }
            Some(watch)
        }
        Err(e) => {
            shared.mark_degraded(&e).await;
            None
        }
    }
}

/// Feed backend deliveries for one collection into the cache, resubscribing
/// after `retry` whenever the watch is lost.
async fn run_applier(shared: Arc<Shared>, collection: Collection, mut watch: Option<Watch>, retry: Duration) {
    loop {
        let Some(mut current) = watch.take() else {
            tokio::time::sleep(retry).await;
            watch = open_watch(&shared, collection).await;
            continue;
        };
        while let Some(delivery) = current.next().await {
            shared.apply_delivery(collection, delivery).await;
        }
        shared.mark_degraded(&format!("{} watch closed", collection.name())).await;
    }
}
