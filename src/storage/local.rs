use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{info, warn};

use crate::limits::WAL_QUEUE_CAPACITY;

use super::notify::NotifyHub;
use super::wal::{Wal, WalRecord};
use super::{Backend, KeyPath, Revision, StorageError, Versioned, Watch};

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        record: WalRecord,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        records: Vec<WalRecord>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Writer task owning the WAL. Appends that queue up while a flush is in
/// progress share the next fsync; compaction and counters run between
/// batches, never inside one.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { record, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(record, response)];
        let next = drain_appends(&mut rx, &mut batch);
        commit_batch(&mut wal, batch);
        if let Some(cmd) = next {
            handle_non_append(&mut wal, cmd);
        }
    }
}

/// Move every already-queued append into `batch`. Returns the first
/// non-append command met, which must run after the batch is durable.
fn drain_appends(rx: &mut mpsc::Receiver<WalCommand>, batch: &mut Vec<PendingAppend>) -> Option<WalCommand> {
    while let Ok(cmd) = rx.try_recv() {
        match cmd {
            WalCommand::Append { record, response } => batch.push((record, response)),
            other => return Some(other),
        }
    }
    None
}

type PendingAppend = (WalRecord, oneshot::Sender<io::Result<()>>);

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let buffered = batch.iter().try_for_each(|(record, _)| wal.append_buffered(record));
    // Flush even after a failed append so no half-written frame lingers in
    // the buffer for the next batch.
    let flushed = wal.flush_sync();
    let outcome = buffered.and(flushed);

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    if let Err(e) = &outcome {
        warn!("WAL flush of {} records failed: {e}", batch.len());
    }
    for (_, response) in batch {
        let reply = match &outcome {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = response.send(reply);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { records, response } => {
            let _ = response.send(wal.rewrite(&records));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { record, response } => commit_batch(wal, vec![(record, response)]),
    }
}

// ── JSON tree ────────────────────────────────────────────

/// Whole storage state: one JSON object tree plus the last revision.
struct Tree {
    root: Value,
    revision: Revision,
}

impl Tree {
    fn new() -> Self {
        Self {
            root: Value::Object(Map::new()),
            revision: 0,
        }
    }

    fn get(&self, path: &KeyPath) -> Option<&Value> {
        path.segments()
            .iter()
            .try_fold(&self.root, |node, seg| match node {
                Value::Object(map) => map.get(seg),
                Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            })
            .filter(|v| !v.is_null())
    }

    fn set(&mut self, path: &KeyPath, value: Value) {
        let Some((last, parents)) = path.segments().split_last() else {
            self.root = match value {
                Value::Object(_) => value,
                _ => Value::Object(Map::new()),
            };
            return;
        };
        let mut node = &mut self.root;
        for seg in parents {
            node = coerce_object(node)
                .entry(seg.clone())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        coerce_object(node).insert(last.clone(), value);
    }

    fn remove(&mut self, path: &KeyPath) {
        if path.is_root() {
            self.root = Value::Object(Map::new());
            return;
        }
        remove_at(&mut self.root, path.segments());
    }

    /// One record per top-level key: the minimal log that rebuilds this tree.
    fn compacted(&self) -> Result<Vec<WalRecord>, StorageError> {
        let Value::Object(map) = &self.root else {
            return Ok(Vec::new());
        };
        map.iter()
            .map(|(key, value)| {
                Ok(WalRecord::Put {
                    revision: self.revision,
                    path: key.clone(),
                    json: serde_json::to_string(value)
                        .map_err(|e| StorageError::Encoding(e.to_string()))?,
                })
            })
            .collect()
    }

    fn apply(&mut self, record: &WalRecord) {
        match record {
            WalRecord::Put { path, json, .. } => {
                let parsed = KeyPath::parse(path)
                    .ok()
                    .zip(serde_json::from_str::<Value>(json).ok());
                match parsed {
                    Some((p, v)) => self.set(&p, v),
                    None => warn!("replay: skipping unreadable put at {path}"),
                }
            }
            WalRecord::Removed { path, .. } => match KeyPath::parse(path) {
                Ok(p) => self.remove(&p),
                Err(_) => warn!("replay: skipping unreadable remove at {path}"),
            },
        }
        self.revision = self.revision.max(record.revision());
    }
}

/// Treat arrays as objects keyed by index; replace scalars with an empty object.
fn coerce_object(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        let map = match node.take() {
            Value::Array(items) => items
                .into_iter()
                .enumerate()
                .filter(|(_, v)| !v.is_null())
                .map(|(i, v)| (i.to_string(), v))
                .collect(),
            _ => Map::new(),
        };
        *node = Value::Object(map);
    }
    match node {
        Value::Object(map) => map,
        _ => unreachable!("coerced to object above"),
    }
}

/// Remove the leaf at `segs`, pruning parents left empty. Returns whether
/// anything was removed.
fn remove_at(node: &mut Value, segs: &[String]) -> bool {
    let Some((first, rest)) = segs.split_first() else {
        return false;
    };
    if !node.is_object() && !node.is_array() {
        return false;
    }
    let map = coerce_object(node);
    if rest.is_empty() {
        return map.remove(first).is_some();
    }
    let Some(child) = map.get_mut(first) else {
        return false;
    };
    let removed = remove_at(child, rest);
    if removed && child.as_object().is_some_and(Map::is_empty) {
        map.remove(first);
    }
    removed
}

// ── Backend ──────────────────────────────────────────────

/// In-process storage backend: a JSON tree, durable through the WAL, with
/// path-keyed watches.
pub struct LocalBackend {
    tree: Mutex<Tree>,
    wal_tx: mpsc::Sender<WalCommand>,
    notify: NotifyHub,
    reachable: AtomicBool,
}

impl LocalBackend {
    /// Replay the WAL at `wal_path` and start its writer task.
    /// Must be called inside a tokio runtime.
    pub fn open(wal_path: &Path) -> io::Result<Arc<Self>> {
        let records = Wal::replay(wal_path)?;
        let mut tree = Tree::new();
        for record in &records {
            tree.apply(record);
        }
        info!(
            "storage replayed {} records from {}, revision {}",
            records.len(),
            wal_path.display(),
            tree.revision
        );

        let wal = Wal::open(wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(WAL_QUEUE_CAPACITY);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        Ok(Arc::new(Self {
            tree: Mutex::new(tree),
            wal_tx,
            notify: NotifyHub::new(),
            reachable: AtomicBool::new(true),
        }))
    }

    /// Take the backend offline: every operation fails with `Unavailable`
    /// until `resume()`.
    pub fn suspend(&self) {
        warn!("storage suspended");
        self.reachable.store(false, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        info!("storage resumed");
        self.reachable.store(true, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    pub async fn revision(&self) -> Revision {
        self.tree.lock().await.revision
    }

    pub fn watched_paths(&self) -> usize {
        self.notify.watched_paths()
    }

    fn ensure_reachable(&self) -> Result<(), StorageError> {
        if self.is_reachable() {
            Ok(())
        } else {
            metrics::counter!(crate::observability::STORAGE_FAILURES_TOTAL).increment(1);
            Err(StorageError::Unavailable("backend suspended".into()))
        }
    }

    async fn wal_append(&self, record: WalRecord) -> Result<(), StorageError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { record, response: tx })
            .await
            .map_err(|_| StorageError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StorageError::Unavailable("WAL writer dropped response".into()))?
            .map_err(StorageError::Io)
    }

    pub async fn appends_since_compact(&self) -> Result<u64, StorageError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .map_err(|_| StorageError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StorageError::Unavailable("WAL writer dropped response".into()))
    }

    /// Rewrite the WAL with only the records needed to rebuild the current tree.
    pub async fn compact(&self) -> Result<(), StorageError> {
        let tree = self.tree.lock().await;
        let records = tree.compacted()?;
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { records, response: tx })
            .await
            .map_err(|_| StorageError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StorageError::Unavailable("WAL writer dropped response".into()))?
            .map_err(StorageError::Io)
    }

    /// WAL-append + apply + notify under the tree lock, so revisions reach
    /// watchers in commit order.
    async fn commit(&self, path: &KeyPath, value: Option<Value>) -> Result<Revision, StorageError> {
        self.ensure_reachable()?;
        let mut tree = self.tree.lock().await;
        let revision = tree.revision + 1;
        let record = match &value {
            Some(v) => WalRecord::Put {
                revision,
                path: path.to_string(),
                json: serde_json::to_string(v).map_err(|e| StorageError::Encoding(e.to_string()))?,
            },
            None => WalRecord::Removed {
                revision,
                path: path.to_string(),
            },
        };
        self.wal_append(record).await?;
        match value {
            Some(v) => tree.set(path, v),
            None => tree.remove(path),
        }
        tree.revision = revision;
        self.notify.publish(path, revision, |watched| tree.get(watched).cloned());
        Ok(revision)
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn write(&self, path: &KeyPath, value: Value) -> Result<Revision, StorageError> {
        if path.is_root() {
            return Err(StorageError::InvalidPath("cannot overwrite the root".into()));
        }
        if value.is_null() {
            return self.commit(path, None).await;
        }
        self.commit(path, Some(value)).await
    }

    async fn read_versioned(&self, path: &KeyPath) -> Result<Versioned, StorageError> {
        self.ensure_reachable()?;
        let tree = self.tree.lock().await;
        Ok(Versioned {
            revision: tree.revision,
            value: tree.get(path).cloned(),
        })
    }

    async fn delete(&self, path: &KeyPath) -> Result<Revision, StorageError> {
        self.commit(path, None).await
    }

    async fn subscribe(&self, path: &KeyPath) -> Result<Watch, StorageError> {
        self.ensure_reachable()?;
        // Holding the lock keeps the initial value and the first delivery gap-free.
        let tree = self.tree.lock().await;
        let rx = self.notify.subscribe(path);
        let initial = Versioned {
            revision: tree.revision,
            value: tree.get(path).cloned(),
        };
        Ok(Watch::new(path.clone(), initial, rx))
    }
}
