use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::engine::Engine;
use crate::model::{Ms, now_ms};
use crate::notify::{Notification, NotificationKind};

/// Announce bookings that just became overdue. Each booking is announced once
/// per engine lifetime; nothing is written, since overdue is always derived.
/// Returns how many notifications went out.
pub fn scan_overdue(engine: &Engine, now: Ms) -> usize {
    let overdue: HashSet<Ulid> = engine.collect_overdue(now).into_iter().collect();
    // Forget bookings that were checked in (or deleted) since the last scan.
    engine.overdue_notified.retain(|id| overdue.contains(id));

    let mut sent = 0;
    for booking_id in overdue {
        if engine.overdue_notified.insert(booking_id) {
            engine
                .notify
                .send(Notification::new(NotificationKind::Overdue, booking_id, None));
            metrics::counter!(crate::observability::OVERDUE_NOTIFICATIONS_TOTAL).increment(1);
            info!("booking {booking_id} is overdue");
            sent += 1;
        }
    }
    sent
}

/// Background task that periodically looks for overdue bookings.
pub async fn run_overdue_watcher(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let sent = scan_overdue(&engine, now_ms());
        if sent > 0 {
            debug!("overdue scan sent {sent} notifications");
        }
    }
}

/// Background task that rewrites the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
