use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;

const CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// One compaction check. Returns whether the log was rewritten.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!("compacted WAL after {appends} appends");
            true
        }
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            false
        }
    }
}

/// Background task that compacts the WAL once appends since the last compaction reach `threshold`.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    debug!("compactor running, threshold {threshold}");
    loop {
        interval.tick().await;
        compact_if_needed(&engine, threshold).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotifyHub;
    use crate::wal::Wal;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotline_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();
        let user_id = Ulid::new();

        for i in 0..4 {
            let id = engine
                .post_notification(user_id, format!("note {i}"))
                .await
                .unwrap();
            engine.mark_notification_read(id).await.unwrap();
        }
        engine.clear_read_notifications(user_id).await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 9);

        assert!(!compact_if_needed(&engine, 10).await);
        assert!(compact_if_needed(&engine, 9).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        // Every notification was read and cleared: nothing left to restore.
        assert!(Wal::replay(&path).unwrap().is_empty());
    }
}
