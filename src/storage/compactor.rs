use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use super::local::LocalBackend;

/// Background task that compacts the WAL once enough appends pile up.
pub async fn run_compactor(backend: Arc<LocalBackend>, threshold: u64, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_needed(&backend, threshold).await {
            tracing::warn!("compaction skipped: {e}");
        }
    }
}

/// Compact when the WAL has grown past `threshold` appends. Returns whether
/// a compaction ran.
pub async fn compact_if_needed(
    backend: &LocalBackend,
    threshold: u64,
) -> Result<bool, super::StorageError> {
    let appends = backend.appends_since_compact().await?;
    if appends < threshold {
        return Ok(false);
    }
    backend.compact().await?;
    info!("compacted WAL after {appends} appends");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Backend, KeyPath};
    use serde_json::json;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("labslot_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let backend = LocalBackend::open(&test_wal_path("threshold.wal")).unwrap();
        let p = KeyPath::parse("reservations/1").unwrap();

        for n in 0..4 {
            backend.write(&p, json!({"n": n})).await.unwrap();
        }
        assert!(!compact_if_needed(&backend, 5).await.unwrap());

        backend.write(&p, json!({"n": 4})).await.unwrap();
        assert!(compact_if_needed(&backend, 5).await.unwrap());
        assert_eq!(backend.appends_since_compact().await.unwrap(), 0);
        assert_eq!(backend.read(&p).await.unwrap(), Some(json!({"n": 4})));
    }
}
