use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::limits::WATCH_CHANNEL_CAPACITY;

use super::{KeyPath, Revision, Versioned};

/// Broadcast hub for backend watches, one channel per watched path.
pub(super) struct NotifyHub {
    channels: DashMap<KeyPath, broadcast::Sender<Versioned>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a path. Creates the channel if needed.
    pub fn subscribe(&self, path: &KeyPath) -> broadcast::Receiver<Versioned> {
        let sender = self
            .channels
            .entry(path.clone())
            .or_insert_with(|| broadcast::channel(WATCH_CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Push the full value of every watched path affected by a change at
    /// `changed`. Channels nobody listens to any more are dropped.
    pub fn publish(
        &self,
        changed: &KeyPath,
        revision: Revision,
        value_at: impl Fn(&KeyPath) -> Option<Value>,
    ) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
        for entry in self.channels.iter() {
            if !entry.key().is_related(changed) {
                continue;
            }
            let _ = entry.value().send(Versioned {
                revision,
                value: value_at(entry.key()),
            });
        }
    }

    pub fn watched_paths(&self) -> usize {
        self.channels.len()
    }
}
