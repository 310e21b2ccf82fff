mod availability;
mod bookings;
mod calendar;
mod conflict;
mod error;
mod holds;
mod queries;

pub use availability::{SlotQuery, generate_slots, merge_overlapping, parse_timezone, resolve_local};
pub use conflict::{find_conflict, has_conflict, overlaps};
pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::clock::{Clock, SystemClock};
use crate::limits::*;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::pricing::{PricingSnapshotter, ProfilePricing};
use crate::wal::Wal;

pub type SharedTutorState = Arc<RwLock<TutorState>>;

/// Tunables the engine needs at runtime.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Lifetime of a new hold.
    pub hold_ttl_ms: Ms,
    /// How long an expired hold lingers before the janitor reaps it.
    pub hold_retention_ms: Ms,
    /// Cap on slots returned by one listing.
    pub max_slots: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            hold_ttl_ms: 15 * MINUTE_MS,
            hold_retention_ms: HOUR_MS,
            max_slots: 500,
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until a command arrives.
/// 2. Buffer appends (no fsync) and keep draining whatever is already queued.
/// 3. Single flush_sync for the whole batch, then answer every sender.
/// A control command ends the batch early; the batch is committed before it runs.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(first) = rx.recv().await {
        let mut batch: Vec<Pending> = Vec::new();
        let mut next = Some(first);
        while let Some(cmd) = next.take() {
            match cmd {
                WalCommand::Append { event, response } => {
                    batch.push((event, response));
                    next = rx.try_recv().ok();
                }
                WalCommand::Compact { events, response } => {
                    commit_batch(&mut wal, &mut batch);
                    let result = Wal::write_compact_file(wal.path(), &events)
                        .and_then(|()| wal.swap_compact_file());
                    let _ = response.send(result);
                }
                WalCommand::AppendsSinceCompact { response } => {
                    commit_batch(&mut wal, &mut batch);
                    let _ = response.send(wal.appends_since_compact());
                }
            }
        }
        commit_batch(&mut wal, &mut batch);
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<Pending>) {
    if batch.is_empty() {
        return;
    }
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed: {e}");
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[Pending]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so half-buffered bytes don't leak
    // into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    pub state: DashMap<Ulid, SharedTutorState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: entity (rule/exception/vacation/hold/booking) id → tutor id
    pub(super) entity_to_tutor: DashMap<Ulid, Ulid>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) settings: EngineSettings,
    pub(super) pricing: PricingSnapshotter,
    /// Held shared by tutor registration, exclusively by compaction, so no
    /// tutor appears between the snapshot and the log swap.
    pub(super) registration: RwLock<()>,
}

/// Apply an event directly to a TutorState (no locking; the caller holds the lock).
/// `TutorRegistered` is handled at the DashMap level.
fn apply_to_tutor(ts: &mut TutorState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    let tutor_id = ts.id();
    match event {
        Event::TutorRegistered { .. } => {}
        Event::TutorUpdated { profile } => {
            ts.profile = profile.clone();
        }
        Event::RuleAdded { rule } => {
            ts.rules.push(rule.clone());
            index.insert(rule.id, tutor_id);
        }
        Event::RuleRemoved { id, .. } => {
            ts.rules.retain(|r| r.id != *id);
            index.remove(id);
        }
        Event::ExceptionSet { exception } => {
            if let Some(prev) = ts.exceptions.insert(exception.date, exception.clone())
                && prev.id != exception.id
            {
                index.remove(&prev.id);
            }
            index.insert(exception.id, tutor_id);
        }
        Event::ExceptionRemoved { id, .. } => {
            ts.exceptions.retain(|_, e| e.id != *id);
            index.remove(id);
        }
        Event::VacationAdded { vacation } => {
            ts.vacations.push(vacation.clone());
            index.insert(vacation.id, tutor_id);
        }
        Event::VacationRemoved { id, .. } => {
            ts.vacations.retain(|v| v.id != *id);
            index.remove(id);
        }
        Event::HoldPlaced { hold } => {
            ts.insert_interval(Interval {
                id: hold.id,
                span: hold.span,
                kind: IntervalKind::Hold {
                    expires_at: hold.expires_at,
                },
            });
            ts.holds.insert(hold.id, hold.clone());
            index.insert(hold.id, tutor_id);
        }
        Event::HoldReleased { id, .. } => {
            ts.remove_interval(*id);
            ts.holds.remove(id);
            index.remove(id);
        }
        Event::BookingCreated { booking } => {
            if booking.status.is_active() {
                ts.insert_interval(Interval {
                    id: booking.id,
                    span: booking.span,
                    kind: IntervalKind::Booking,
                });
            }
            ts.bookings.insert(booking.id, booking.clone());
            index.insert(booking.id, tutor_id);
        }
        Event::BookingTransitioned { id, status, at, .. } => {
            if let Some(booking) = ts.bookings.get_mut(id) {
                booking.set_status(*status, *at);
            }
            if !status.is_active() {
                ts.remove_interval(*id);
            }
        }
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        settings: EngineSettings,
    ) -> io::Result<Self> {
        Self::with_parts(
            wal_path,
            notify,
            settings,
            Arc::new(SystemClock),
            PricingSnapshotter::new(Arc::new(ProfilePricing)),
        )
    }

    /// Build an engine with an explicit clock and price source.
    pub fn with_parts(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        settings: EngineSettings,
        clock: Arc<dyn Clock>,
        pricing: PricingSnapshotter,
    ) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            entity_to_tutor: DashMap::new(),
            clock,
            settings,
            pricing,
            registration: RwLock::new(()),
        };

        // Replay: we're the sole owner of these Arcs, so try_write never contends.
        // Never use blocking_write here because this may run inside an async context.
        for event in &events {
            if let Event::TutorRegistered { profile } = event {
                engine.state.insert(
                    profile.id,
                    Arc::new(RwLock::new(TutorState::new(profile.clone()))),
                );
                continue;
            }
            if let Some(entry) = engine.state.get(&event.tutor_id()) {
                let ts = entry.value().clone();
                if let Ok(mut guard) = ts.try_write() {
                    apply_to_tutor(&mut guard, event, &engine.entity_to_tutor);
                }
            }
        }
        tracing::info!(
            events = events.len(),
            tutors = engine.state.len(),
            "engine state replayed"
        );

        Ok(engine)
    }

    pub fn now(&self) -> Ms {
        self.clock.now_ms()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Wal(e.to_string()))
    }

    pub fn get_tutor_state(&self, id: &Ulid) -> Option<SharedTutorState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_tutor_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_tutor.get(entity_id).map(|e| *e.value())
    }

    /// WAL-append then apply. Nothing is applied if the append fails.
    pub(super) async fn persist_and_apply(
        &self,
        ts: &mut TutorState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_tutor(ts, event, &self.entity_to_tutor);
        Ok(())
    }

    /// Get tutor, acquire its write lock.
    pub(super) async fn tutor_write(
        &self,
        tutor_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<TutorState>, EngineError> {
        let ts = self
            .get_tutor_state(&tutor_id)
            .ok_or(EngineError::NotFound(tutor_id))?;
        Ok(ts.write_owned().await)
    }

    /// Lookup entity → tutor, get tutor, acquire write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<(Ulid, OwnedRwLockWriteGuard<TutorState>), EngineError> {
        let tutor_id = self
            .get_tutor_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let guard = self.tutor_write(tutor_id).await?;
        Ok((tutor_id, guard))
    }

    /// Rewrite the WAL with only the events needed to recreate current state.
    ///
    /// Every tutor stays read-locked until the swap is done. Writers append
    /// under the tutor write lock, so nothing can land in the old log after
    /// its tutor was snapshotted.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _registration = self.registration.write().await;
        let tutors: Vec<SharedTutorState> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut guards: Vec<OwnedRwLockReadGuard<TutorState>> = Vec::with_capacity(tutors.len());
        for ts in tutors {
            guards.push(ts.read_owned().await);
        }

        let mut events = Vec::new();
        for guard in &guards {
            events.push(Event::TutorRegistered {
                profile: guard.profile.clone(),
            });
            events.extend(guard.rules.iter().map(|rule| Event::RuleAdded { rule: rule.clone() }));
            events.extend(guard.exceptions.values().map(|exception| Event::ExceptionSet {
                exception: exception.clone(),
            }));
            events.extend(guard.vacations.iter().map(|vacation| Event::VacationAdded {
                vacation: vacation.clone(),
            }));
            events.extend(guard.holds.values().map(|hold| Event::HoldPlaced { hold: hold.clone() }));
            // A booking carries its status and timestamps, so one record restores it.
            events.extend(guard.bookings.values().map(|booking| Event::BookingCreated {
                booking: booking.clone(),
            }));
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Wal(e.to_string()))?;
        drop(guards);
        metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
        Ok(())
    }

    /// Drop expired price quotes. Returns how many were removed.
    pub fn purge_quote_cache(&self) -> usize {
        self.pricing.purge_expired()
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
