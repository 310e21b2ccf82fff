use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::DomainEvent;
use crate::observability;

use super::conflict::{find_conflict, validate_span};
use super::{Engine, EngineError};

impl Engine {
    /// Claim `[start_at, start_at + duration)` for `consumer_id`.
    ///
    /// The conflict check and the insert run under the tutor's write lock, so
    /// of N concurrent claims on overlapping spans exactly one succeeds.
    pub async fn create_hold(
        &self,
        id: Ulid,
        tutor_id: Ulid,
        consumer_id: Ulid,
        start_at: Ms,
        duration_minutes: u32,
    ) -> Result<Hold, EngineError> {
        if duration_minutes == 0 || duration_minutes > MAX_SESSION_MINUTES {
            return Err(EngineError::validation(format!(
                "duration must be between 1 and {MAX_SESSION_MINUTES} minutes"
            )));
        }
        let span = Span {
            start: start_at,
            end: start_at.saturating_add(Ms::from(duration_minutes) * MINUTE_MS),
        };
        validate_span(&span)?;

        let now = self.now();
        if span.start < now {
            return Err(EngineError::validation("hold cannot start in the past"));
        }

        let mut guard = self.tutor_write(tutor_id).await?;
        if !guard.profile.bookable {
            return Err(EngineError::NotFound(tutor_id));
        }
        if self.entity_to_tutor.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if guard.intervals.len() >= MAX_ALLOCATIONS_PER_TUTOR {
            return Err(EngineError::LimitExceeded("too many allocations on tutor"));
        }
        if let Some(conflict) = find_conflict(&guard, &span, now, None) {
            metrics::counter!(observability::HOLDS_REJECTED_TOTAL).increment(1);
            debug!(%tutor_id, %conflict, "hold rejected: slot unavailable");
            return Err(EngineError::SlotUnavailable(conflict));
        }

        let hold = Hold {
            id,
            tutor_id,
            consumer_id,
            span,
            expires_at: now.saturating_add(self.settings.hold_ttl_ms),
            created_at: now,
        };
        let event = Event::HoldPlaced { hold: hold.clone() };
        self.persist_and_apply(&mut guard, &event).await?;
        drop(guard);

        metrics::counter!(observability::HOLDS_PLACED_TOTAL).increment(1);
        info!(hold_id = %id, %tutor_id, %consumer_id, expires_at = hold.expires_at, "hold placed");
        self.notify.send(DomainEvent::HoldPlaced {
            hold_id: id,
            tutor_id,
            consumer_id,
            at: now,
        });
        Ok(hold)
    }

    /// Drop a live hold outright (abandoned checkout). Expired holds no longer
    /// exist from the caller's point of view and yield `NotFound`.
    pub async fn release_hold(&self, hold_id: Ulid) -> Result<Hold, EngineError> {
        let (tutor_id, mut guard) = self.resolve_entity_write(&hold_id).await?;
        let now = self.now();
        let hold = guard
            .holds
            .get(&hold_id)
            .filter(|h| h.is_live(now))
            .cloned()
            .ok_or(EngineError::NotFound(hold_id))?;

        let event = Event::HoldReleased {
            id: hold_id,
            tutor_id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        drop(guard);

        metrics::counter!(observability::HOLDS_RELEASED_TOTAL).increment(1);
        info!(%hold_id, %tutor_id, "hold released");
        self.notify.send(DomainEvent::HoldReleased {
            hold_id,
            tutor_id,
            consumer_id: hold.consumer_id,
            at: now,
        });
        Ok(hold)
    }

    /// `(hold_id, tutor_id)` of every hold with `expires_at <= cutoff`.
    /// Tutors whose lock is busy are skipped until the next pass.
    pub fn collect_expired_holds(&self, cutoff: Ms) -> Vec<(Ulid, Ulid)> {
        let mut expired = Vec::new();
        for entry in self.state.iter() {
            let ts = entry.value().clone();
            if let Ok(guard) = ts.try_read() {
                expired.extend(
                    guard
                        .holds
                        .values()
                        .filter(|h| h.expires_at <= cutoff)
                        .map(|h| (h.id, h.tutor_id)),
                );
            }
        }
        expired
    }

    /// Physically remove holds that expired more than `hold_retention` ago.
    /// Returns how many were reaped.
    pub async fn reap_expired_holds(&self) -> usize {
        let now = self.now();
        let cutoff = now.saturating_sub(self.settings.hold_retention_ms);
        let mut reaped = 0;
        for (hold_id, tutor_id) in self.collect_expired_holds(cutoff) {
            let Ok(mut guard) = self.tutor_write(tutor_id).await else {
                continue;
            };
            // Re-check under the write lock; it may have been released or converted.
            let Some(hold) = guard
                .holds
                .get(&hold_id)
                .filter(|h| h.expires_at <= cutoff)
                .cloned()
            else {
                continue;
            };
            let event = Event::HoldReleased {
                id: hold_id,
                tutor_id,
            };
            if let Err(e) = self.persist_and_apply(&mut guard, &event).await {
                warn!(%hold_id, "janitor could not reap hold: {e}");
                continue;
            }
            drop(guard);

            reaped += 1;
            metrics::counter!(observability::HOLDS_EXPIRED_TOTAL).increment(1);
            debug!(%hold_id, %tutor_id, "reaped expired hold");
            self.notify.send(DomainEvent::HoldExpired {
                hold_id,
                tutor_id,
                consumer_id: hold.consumer_id,
                at: now,
            });
        }
        reaped
    }

    /// Remove holds left behind by a confirmation whose second write failed:
    /// holds some booking was created from, or holds whose span equals an
    /// active booking's span on the same tutor. Returns how many were removed.
    pub async fn reconcile_stale_holds(&self) -> usize {
        let tutors: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        let mut removed = 0;
        for tutor_id in tutors {
            let Ok(mut guard) = self.tutor_write(tutor_id).await else {
                continue;
            };
            let stale: Vec<Ulid> = guard
                .holds
                .values()
                .filter(|h| {
                    guard.bookings.values().any(|b| {
                        b.hold_id == h.id || (b.status.is_active() && b.span == h.span)
                    })
                })
                .map(|h| h.id)
                .collect();
            for hold_id in stale {
                let event = Event::HoldReleased {
                    id: hold_id,
                    tutor_id,
                };
                match self.persist_and_apply(&mut guard, &event).await {
                    Ok(()) => {
                        removed += 1;
                        metrics::counter!(observability::HOLDS_RECONCILED_TOTAL).increment(1);
                        warn!(%hold_id, %tutor_id, "removed hold already converted to a booking");
                    }
                    Err(e) => warn!(%hold_id, "reconciliation failed: {e}"),
                }
            }
        }
        removed
    }
}
