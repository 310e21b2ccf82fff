use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::engine::Engine;

/// Outcome of one janitor pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct JanitorReport {
    pub reaped: usize,
    pub reconciled: usize,
    pub quotes_purged: usize,
    pub compacted: bool,
}

/// Background task: reaps long-expired holds, removes holds left behind by a
/// half-finished confirmation, drops stale price quotes and compacts the WAL
/// once it has grown enough.
/// Correctness never depends on it; expiry is enforced lazily on every read.
pub async fn run_janitor(engine: Arc<Engine>, period: Duration, compact_threshold: u64) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let report = janitor_pass(&engine, compact_threshold).await;
        if report != JanitorReport::default() {
            info!(
                reaped = report.reaped,
                reconciled = report.reconciled,
                quotes_purged = report.quotes_purged,
                compacted = report.compacted,
                "janitor pass"
            );
        }
    }
}

pub async fn janitor_pass(engine: &Engine, compact_threshold: u64) -> JanitorReport {
    let reaped = engine.reap_expired_holds().await;
    let reconciled = engine.reconcile_stale_holds().await;
    let quotes_purged = engine.purge_quote_cache();

    let mut compacted = false;
    if compact_threshold > 0 && engine.wal_appends_since_compact().await >= compact_threshold {
        match engine.compact_wal().await {
            Ok(()) => compacted = true,
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }

    JanitorReport {
        reaped,
        reconciled,
        quotes_purged,
        compacted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::EngineSettings;
    use crate::limits::HOUR_MS;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use crate::pricing::{PricingSnapshotter, ProfilePricing};
    use chrono::NaiveTime;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotwise_test_janitor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    // 2026-10-19 00:00 UTC, a Monday.
    const MONDAY: Ms = 1_792_368_000_000;

    async fn setup(name: &str) -> (Arc<Engine>, Arc<ManualClock>, Ulid) {
        let clock = Arc::new(ManualClock::new(MONDAY));
        let engine = Engine::with_parts(
            test_wal_path(name),
            Arc::new(NotifyHub::new()),
            EngineSettings::default(),
            clock.clone(),
            PricingSnapshotter::new(Arc::new(ProfilePricing)),
        )
        .unwrap();
        let tutor_id = Ulid::new();
        engine
            .register_tutor(TutorProfile {
                id: tutor_id,
                timezone: "UTC".into(),
                base_price: Money {
                    amount_minor: 3000,
                    currency: "EUR".into(),
                },
                policy: BookingPolicy::default(),
                bookable: true,
            })
            .await
            .unwrap();
        engine
            .add_rule(AvailabilityRule {
                id: Ulid::new(),
                tutor_id,
                day_of_week: 0,
                window: LocalWindow::new(
                    NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                    NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
                )
                .unwrap(),
                timezone: String::new(),
                valid_from: None,
                valid_until: None,
            })
            .await
            .unwrap();
        (Arc::new(engine), clock, tutor_id)
    }

    #[tokio::test]
    async fn pass_reaps_only_after_retention() {
        let (engine, clock, tutor_id) = setup("janitor_retention.wal").await;
        let hold = engine
            .create_hold(Ulid::new(), tutor_id, Ulid::new(), MONDAY + 10 * HOUR_MS, 60)
            .await
            .unwrap();

        // Expired but still inside the retention window.
        clock.set(hold.expires_at + 1);
        assert_eq!(janitor_pass(&engine, 0).await.reaped, 0);
        assert!(engine.get_holds(tutor_id).await.unwrap().is_empty());

        clock.set(hold.expires_at + engine.settings().hold_retention_ms);
        let report = janitor_pass(&engine, 0).await;
        assert_eq!(report.reaped, 1);
        assert!(engine.collect_expired_holds(i64::MAX).is_empty());
    }

    #[tokio::test]
    async fn pass_compacts_past_threshold() {
        let (engine, _clock, tutor_id) = setup("janitor_compact.wal").await;
        for h in 10..14 {
            let hold = engine
                .create_hold(Ulid::new(), tutor_id, Ulid::new(), MONDAY + h * HOUR_MS, 60)
                .await
                .unwrap();
            engine.release_hold(hold.id).await.unwrap();
        }
        assert!(engine.wal_appends_since_compact().await >= 8);

        let report = janitor_pass(&engine, 5).await;
        assert!(report.compacted);
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        let quiet = janitor_pass(&engine, 5).await;
        assert_eq!(quiet, JanitorReport::default());
    }

    #[tokio::test]
    async fn pass_purges_stale_quotes() {
        let clock = Arc::new(ManualClock::new(MONDAY));
        let engine = Engine::with_parts(
            test_wal_path("janitor_quotes.wal"),
            Arc::new(NotifyHub::new()),
            EngineSettings::default(),
            clock.clone(),
            PricingSnapshotter::cached(Arc::new(ProfilePricing), 60_000, clock.clone()),
        )
        .unwrap();
        let tutor_id = Ulid::new();
        engine
            .register_tutor(TutorProfile {
                id: tutor_id,
                timezone: "UTC".into(),
                base_price: Money {
                    amount_minor: 3000,
                    currency: "EUR".into(),
                },
                policy: BookingPolicy::default(),
                bookable: true,
            })
            .await
            .unwrap();
        let consumer = Ulid::new();
        let hold = engine
            .create_hold(Ulid::new(), tutor_id, consumer, MONDAY + 10 * HOUR_MS, 60)
            .await
            .unwrap();
        engine
            .confirm_booking(Ulid::new(), hold.id, consumer, Ulid::new())
            .await
            .unwrap();

        assert_eq!(janitor_pass(&engine, 0).await.quotes_purged, 0);
        clock.advance(60_000);
        assert_eq!(janitor_pass(&engine, 0).await.quotes_purged, 1);
    }
}
