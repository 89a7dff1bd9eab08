//! Background maintenance tasks: the stale-session sweeper and the WAL
//! compactor. Both run forever on a tokio interval; spawn them once at
//! startup with a shared `Engine`.

use std::sync::Arc;
use std::time::Duration;

use crate::engine::Engine;
use crate::observability;

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
pub const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(300);

/// Flag sessions still open long after their lesson ended. The sweeper only
/// reports; a late leave event may still arrive, so closing them here would
/// fabricate telemetry.
pub async fn run_session_sweeper(engine: Arc<Engine>) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let now = chrono::Utc::now();
        let stale = engine.collect_stale_sessions(now);
        if stale.is_empty() {
            continue;
        }
        metrics::counter!(observability::STALE_SESSIONS_TOTAL).increment(stale.len() as u64);
        for (lesson_id, session_id) in stale {
            tracing::warn!("stale open session {session_id} on lesson {lesson_id}");
        }
    }
}

/// Rewrite the WAL once the append count since the last compaction crosses
/// `threshold`. Keeps recovery time bounded on long-lived processes.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut ticker = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => tracing::info!("compacted WAL after {appends} appends"),
            Err(e) => tracing::error!("WAL compaction failed: {e}"),
        }
    }
}
