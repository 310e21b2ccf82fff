use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};
use proptest::prelude::*;
use tokio::task::JoinSet;
use ulid::Ulid;

use slotwise::clock::ManualClock;
use slotwise::engine::{Engine, EngineError, EngineSettings};
use slotwise::model::*;
use slotwise::notify::NotifyHub;
use slotwise::pricing::{PricingSnapshotter, ProfilePricing};

const MINUTE: Ms = 60_000;

fn monday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
}

fn monday_midnight() -> Ms {
    Utc.with_ymd_and_hms(2026, 10, 19, 0, 0, 0)
        .unwrap()
        .timestamp_millis()
}

#[derive(Debug, Clone)]
enum Op {
    /// Claim `duration` minutes starting `offset` quarter-hours after midnight,
    /// confirming it straight away when `confirm` is set.
    Claim {
        offset: u32,
        duration: u32,
        confirm: bool,
    },
    /// Cancel the n-th booking made so far, if any.
    Cancel { nth: usize },
    /// Move the clock forward.
    Advance { minutes: u32 },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u32..96, prop::sample::select(vec![15u32, 30, 45, 60, 90, 120]), any::<bool>())
            .prop_map(|(offset, duration, confirm)| Op::Claim { offset, duration, confirm }),
        1 => (0usize..8).prop_map(|nth| Op::Cancel { nth }),
        1 => (1u32..30).prop_map(|minutes| Op::Advance { minutes }),
    ]
}

/// Up to three Monday windows on whole hours.
fn windows() -> impl Strategy<Value = Vec<(u32, u32)>> {
    prop::collection::vec((0u32..23, 1u32..6), 1..4).prop_map(|ws| {
        ws.into_iter()
            .map(|(start, len)| (start, (start + len).min(24)))
            .collect()
    })
}

fn window(start_h: u32, end_h: u32) -> LocalWindow {
    let end = if end_h == 24 { 0 } else { end_h };
    LocalWindow::new(
        NaiveTime::from_hms_opt(start_h, 0, 0).unwrap(),
        NaiveTime::from_hms_opt(end, 0, 0).unwrap(),
    )
    .unwrap()
}

struct Outcome {
    occupied: Vec<Span>,
    slots: Vec<Span>,
}

async fn run(windows: Vec<(u32, u32)>, ops: Vec<Op>) -> Outcome {
    let dir = std::env::temp_dir().join(format!("slotwise_prop_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    // Sunday 12:00 UTC, so the whole Monday lies ahead.
    let clock = Arc::new(ManualClock::new(monday_midnight() - 12 * 60 * MINUTE));
    let engine = Engine::with_parts(
        dir.join("prop.wal"),
        Arc::new(NotifyHub::new()),
        EngineSettings::default(),
        clock.clone(),
        PricingSnapshotter::new(Arc::new(ProfilePricing)),
    )
    .unwrap();

    let tid = Ulid::new();
    engine
        .register_tutor(TutorProfile {
            id: tid,
            timezone: "UTC".into(),
            base_price: Money {
                amount_minor: 2500,
                currency: "EUR".into(),
            },
            policy: BookingPolicy::default(),
            bookable: true,
        })
        .await
        .unwrap();
    for (start_h, end_h) in windows {
        engine
            .add_rule(AvailabilityRule {
                id: Ulid::new(),
                tutor_id: tid,
                day_of_week: 0,
                window: window(start_h, end_h),
                timezone: String::new(),
                valid_from: None,
                valid_until: None,
            })
            .await
            .unwrap();
    }

    let mut bookings: Vec<(Ulid, Ulid)> = Vec::new();
    for op in ops {
        match op {
            Op::Claim {
                offset,
                duration,
                confirm,
            } => {
                let consumer = Ulid::new();
                let start = monday_midnight() + Ms::from(offset) * 15 * MINUTE;
                let hold = match engine
                    .create_hold(Ulid::new(), tid, consumer, start, duration)
                    .await
                {
                    Ok(hold) => hold,
                    // Taken, or the clock has already moved past it.
                    Err(EngineError::SlotUnavailable(_) | EngineError::Validation(_)) => continue,
                    Err(e) => panic!("unexpected hold error: {e}"),
                };
                if confirm {
                    let booking_id = Ulid::new();
                    match engine
                        .confirm_booking(booking_id, hold.id, consumer, Ulid::new())
                        .await
                    {
                        Ok(_) => bookings.push((booking_id, consumer)),
                        Err(EngineError::Expired(_)) => {}
                        Err(e) => panic!("unexpected confirm error: {e}"),
                    }
                }
            }
            Op::Cancel { nth } => {
                if let Some((booking_id, consumer)) = bookings.get(nth) {
                    let _ = engine.cancel_booking(*booking_id, *consumer).await;
                }
            }
            Op::Advance { minutes } => clock.advance(Ms::from(minutes) * MINUTE),
        }
    }

    let mut occupied: Vec<Span> = engine
        .get_holds(tid)
        .await
        .unwrap()
        .iter()
        .map(|h| h.span)
        .collect();
    occupied.extend(
        engine
            .get_bookings(tid)
            .await
            .unwrap()
            .iter()
            .filter(|b| b.status.is_active())
            .map(|b| b.span),
    );
    let slots = engine
        .get_available_slots(tid, monday(), monday(), 30)
        .await
        .unwrap()
        .iter()
        .map(|s| s.span)
        .collect();
    Outcome { occupied, slots }
}

/// One step inside a concurrent batch.
#[derive(Debug, Clone)]
enum Racer {
    /// Claim a span, confirming it straight away when `confirm` is set.
    Claim {
        offset: u32,
        duration: u32,
        confirm: bool,
    },
    /// Confirm the n-th hold left unconfirmed by an earlier batch.
    ConfirmLater { nth: usize },
    /// The tutor cancels the n-th booking made so far.
    TutorCancel { nth: usize },
}

fn racer() -> impl Strategy<Value = Racer> {
    prop_oneof![
        4 => (0u32..48, prop::sample::select(vec![30u32, 60, 90]), any::<bool>())
            .prop_map(|(offset, duration, confirm)| Racer::Claim { offset, duration, confirm }),
        2 => (0usize..6).prop_map(|nth| Racer::ConfirmLater { nth }),
        1 => (0usize..6).prop_map(|nth| Racer::TutorCancel { nth }),
    ]
}

/// Batches of racers run together, each followed by a clock advance in minutes.
fn batches() -> impl Strategy<Value = Vec<(Vec<Racer>, u32)>> {
    prop::collection::vec((prop::collection::vec(racer(), 2..10), 0u32..20), 1..8)
}

enum Gain {
    Held { hold_id: Ulid, consumer: Ulid },
    Booked(Ulid),
    Nothing,
}

fn tolerated(result: Result<Gain, EngineError>) -> Gain {
    match result {
        Ok(gain) => gain,
        Err(EngineError::Wal(e)) => panic!("WAL failure: {e}"),
        Err(_) => Gain::Nothing,
    }
}

async fn race(
    engine: Arc<Engine>,
    tid: Ulid,
    racer: Racer,
    pending: Arc<Vec<(Ulid, Ulid)>>,
    booked: Arc<Vec<Ulid>>,
) -> Gain {
    match racer {
        Racer::Claim {
            offset,
            duration,
            confirm,
        } => {
            let consumer = Ulid::new();
            // Quarter-hour grid from 09:00.
            let start = monday_midnight() + (36 + Ms::from(offset)) * 15 * MINUTE;
            let hold = match engine
                .create_hold(Ulid::new(), tid, consumer, start, duration)
                .await
            {
                Ok(hold) => hold,
                Err(e) => return tolerated(Err(e)),
            };
            if !confirm {
                return Gain::Held {
                    hold_id: hold.id,
                    consumer,
                };
            }
            let booking_id = Ulid::new();
            tolerated(
                engine
                    .confirm_booking(booking_id, hold.id, consumer, Ulid::new())
                    .await
                    .map(|_| Gain::Booked(booking_id)),
            )
        }
        Racer::ConfirmLater { nth } => {
            let Some(&(hold_id, consumer)) = pending.get(nth) else {
                return Gain::Nothing;
            };
            let booking_id = Ulid::new();
            tolerated(
                engine
                    .confirm_booking(booking_id, hold_id, consumer, Ulid::new())
                    .await
                    .map(|_| Gain::Booked(booking_id)),
            )
        }
        Racer::TutorCancel { nth } => {
            let Some(&booking_id) = booked.get(nth) else {
                return Gain::Nothing;
            };
            tolerated(
                engine
                    .cancel_booking(booking_id, tid)
                    .await
                    .map(|_| Gain::Nothing),
            )
        }
    }
}

async fn occupied(engine: &Engine, tid: Ulid) -> Vec<Span> {
    let mut spans: Vec<Span> = engine
        .get_holds(tid)
        .await
        .unwrap()
        .iter()
        .map(|h| h.span)
        .collect();
    spans.extend(
        engine
            .get_bookings(tid)
            .await
            .unwrap()
            .iter()
            .filter(|b| b.status.is_active())
            .map(|b| b.span),
    );
    spans
}

fn first_overlap(spans: &[Span]) -> Option<(Span, Span)> {
    spans.iter().enumerate().find_map(|(i, a)| {
        spans[i + 1..]
            .iter()
            .find(|b| a.overlaps(b))
            .map(|b| (*a, *b))
    })
}

/// Runs every batch concurrently on a multi-thread runtime and returns the
/// first overlap seen after any batch.
fn run_concurrent(batches: Vec<(Vec<Racer>, u32)>) -> Option<(Span, Span)> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async move {
        let dir = std::env::temp_dir().join(format!("slotwise_race_{}", Ulid::new()));
        std::fs::create_dir_all(&dir).unwrap();
        let clock = Arc::new(ManualClock::new(monday_midnight() - 12 * 60 * MINUTE));
        let engine = Arc::new(
            Engine::with_parts(
                dir.join("race.wal"),
                Arc::new(NotifyHub::new()),
                EngineSettings::default(),
                clock.clone(),
                PricingSnapshotter::new(Arc::new(ProfilePricing)),
            )
            .unwrap(),
        );
        let tid = Ulid::new();
        engine
            .register_tutor(TutorProfile {
                id: tid,
                timezone: "UTC".into(),
                base_price: Money {
                    amount_minor: 2500,
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
                tutor_id: tid,
                day_of_week: 0,
                window: window(9, 21),
                timezone: String::new(),
                valid_from: None,
                valid_until: None,
            })
            .await
            .unwrap();

        let mut pending: Vec<(Ulid, Ulid)> = Vec::new();
        let mut booked: Vec<Ulid> = Vec::new();
        for (racers, advance) in batches {
            let pending_now = Arc::new(pending.clone());
            let booked_now = Arc::new(booked.clone());
            let mut set = JoinSet::new();
            for racer in racers {
                set.spawn(race(
                    engine.clone(),
                    tid,
                    racer,
                    pending_now.clone(),
                    booked_now.clone(),
                ));
            }
            while let Some(gain) = set.join_next().await {
                match gain.unwrap() {
                    Gain::Held { hold_id, consumer } => pending.push((hold_id, consumer)),
                    Gain::Booked(id) => booked.push(id),
                    Gain::Nothing => {}
                }
            }

            if let Some(pair) = first_overlap(&occupied(&engine, tid).await) {
                return Some(pair);
            }
            clock.advance(Ms::from(advance) * MINUTE);
            if let Some(pair) = first_overlap(&occupied(&engine, tid).await) {
                return Some(pair);
            }
        }
        None
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn live_allocations_never_overlap(ws in windows(), ops in prop::collection::vec(op(), 1..40)) {
        let outcome = tokio_test::block_on(run(ws, ops));
        for (i, a) in outcome.occupied.iter().enumerate() {
            for b in &outcome.occupied[i + 1..] {
                prop_assert!(!a.overlaps(b), "{a:?} overlaps {b:?}");
            }
        }
    }

    #[test]
    fn slots_avoid_allocations(ws in windows(), ops in prop::collection::vec(op(), 1..40)) {
        let outcome = tokio_test::block_on(run(ws, ops));
        for slot in &outcome.slots {
            for taken in &outcome.occupied {
                prop_assert!(!slot.overlaps(taken), "slot {slot:?} overlaps {taken:?}");
            }
        }
        for pair in outcome.slots.windows(2) {
            prop_assert!(pair[0].end <= pair[1].start, "slots out of order: {pair:?}");
        }
    }

    #[test]
    fn concurrent_claims_never_overlap(batches in batches()) {
        prop_assert_eq!(run_concurrent(batches), None);
    }
}
