use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::buffer::BufferManager;
use crate::clock::{format_timestamp, Clock};
use crate::config::SweepConfig;
use crate::database::Database;
use crate::guard::KeyGuard;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted_buffers: usize,
    pub deleted_rows: usize,
    pub purged_guard_entries: usize,
}

/// Background task that evicts idle buffers and deletes stale session rows
pub struct SessionSweeper {
    db: Arc<Mutex<Database>>,
    buffers: Arc<BufferManager>,
    guard: Arc<KeyGuard>,
    clock: Arc<dyn Clock>,
    config: SweepConfig,
}

impl SessionSweeper {
    pub fn new(
        db: Arc<Mutex<Database>>,
        buffers: Arc<BufferManager>,
        guard: Arc<KeyGuard>,
        clock: Arc<dyn Clock>,
        config: SweepConfig,
    ) -> Self {
        Self {
            db,
            buffers,
            guard,
            clock,
            config,
        }
    }

    /// Sweep on a fixed interval until the token is cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            "Session sweeper started (every {}s)",
            self.config.interval_secs
        );

        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.interval_secs));
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep_once().await;
                }
            }
        }

        info!("Session sweeper stopped");
    }

    pub async fn sweep_once(&self) -> SweepReport {
        let now = self.clock.now();
        let evicted_buffers = self.buffers.evict_idle(now).await;

        let cutoff = format_timestamp(now - self.config.row_retention_secs);
        let deleted_rows = {
            let db = self.db.lock().await;
            match db.delete_sessions_inactive_before(&cutoff) {
                Ok(n) => n,
                Err(e) => {
                    // Continue; the next sweep retries
                    error!("Failed to delete stale sessions: {}", e);
                    0
                }
            }
        };

        let purged_guard_entries = self.guard.purge_expired(now).await;

        let report = SweepReport {
            evicted_buffers,
            deleted_rows,
            purged_guard_entries,
        };
        if report != SweepReport::default() {
            info!(
                "Sweep evicted {} buffer(s), deleted {} row(s), purged {} guard entr(ies)",
                evicted_buffers, deleted_rows, purged_guard_entries
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferConfig;
    use crate::clock::ManualClock;
    use crate::config::GuardConfig;
    use jarvis_schemas::{SessionId, UserId};

    const T0: f64 = 1_762_473_600.0;

    struct Fixture {
        sweeper: SessionSweeper,
        db: Arc<Mutex<Database>>,
        buffers: Arc<BufferManager>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Mutex::new(Database::in_memory().unwrap()));
        let buffers = Arc::new(BufferManager::new(BufferConfig::default()));
        let guard = Arc::new(KeyGuard::new(GuardConfig::default()));
        let clock = Arc::new(ManualClock::new(T0));
        let sweeper = SessionSweeper::new(
            db.clone(),
            buffers.clone(),
            guard,
            clock.clone(),
            SweepConfig::default(),
        );
        Fixture {
            sweeper,
            db,
            buffers,
            clock,
        }
    }

    #[tokio::test]
    async fn test_sweep_evicts_idle_buffers() {
        let f = fixture();
        let session = SessionId("s1".to_string());
        f.buffers.get_buffer(&f.db, &session, T0).await;

        f.clock.advance(1_800.0);
        assert_eq!(f.sweeper.sweep_once().await.evicted_buffers, 0);

        f.clock.advance(1_801.0);
        assert_eq!(f.sweeper.sweep_once().await.evicted_buffers, 1);
        assert_eq!(f.buffers.active_sessions().await, 0);

        // row survives eviction
        assert!(f.db.lock().await.get_session(&session).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sweep_deletes_stale_rows() {
        let f = fixture();
        {
            let db = f.db.lock().await;
            let uid = UserId("u1".to_string());
            db.save_session(
                &SessionId("old".to_string()),
                Some(&uid),
                &[],
                &format_timestamp(T0 - 90_000.0),
            )
            .unwrap();
            db.save_session(
                &SessionId("fresh".to_string()),
                Some(&uid),
                &[],
                &format_timestamp(T0 - 60.0),
            )
            .unwrap();
        }

        let report = f.sweeper.sweep_once().await;
        assert_eq!(report.deleted_rows, 1);

        let db = f.db.lock().await;
        assert!(db.get_session(&SessionId("old".to_string())).unwrap().is_none());
        assert!(db.get_session(&SessionId("fresh".to_string())).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let f = fixture();
        let token = CancellationToken::new();
        let handle = tokio::spawn(f.sweeper.run(token.clone()));
        token.cancel();
        handle.await.unwrap();
    }
}
