use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::notify::DomainEvent;
use crate::observability;

use super::conflict::find_conflict;
use super::{Engine, EngineError};

fn reject_confirm(err: EngineError) -> EngineError {
    metrics::counter!(observability::CONFIRMS_REJECTED_TOTAL, "reason" => err.kind()).increment(1);
    err
}

impl Engine {
    /// Convert a live hold into a `Booked` booking.
    ///
    /// Two WAL writes: `BookingCreated`, then `HoldReleased`. If the second
    /// fails the booking stands and [`Engine::reconcile_stale_holds`] removes
    /// the leftover hold later.
    pub async fn confirm_booking(
        &self,
        id: Ulid,
        hold_id: Ulid,
        consumer_id: Ulid,
        student_id: Ulid,
    ) -> Result<Booking, EngineError> {
        let (tutor_id, mut guard) = self.resolve_entity_write(&hold_id).await?;
        let hold = guard
            .holds
            .get(&hold_id)
            .cloned()
            .ok_or(EngineError::NotFound(hold_id))?;

        let now = self.now();
        if !hold.is_live(now) {
            debug!(%hold_id, expired_at = hold.expires_at, now, "confirm on expired hold");
            return Err(reject_confirm(EngineError::Expired(hold_id)));
        }
        if hold.consumer_id != consumer_id {
            return Err(reject_confirm(EngineError::Forbidden(
                "hold belongs to another consumer",
            )));
        }
        if self.entity_to_tutor.contains_key(&id) {
            return Err(reject_confirm(EngineError::AlreadyExists(id)));
        }
        if let Some(conflict) = find_conflict(&guard, &hold.span, now, Some(hold_id)) {
            return Err(reject_confirm(EngineError::SlotUnavailable(conflict)));
        }

        let terms = self.pricing.snapshot(&guard.profile, &hold.span, now)?;
        let booking = Booking {
            id,
            tutor_id,
            consumer_id,
            student_id,
            span: hold.span,
            status: BookingStatus::Booked,
            hold_id,
            terms,
            created_at: now,
            acknowledged_at: None,
            canceled_at: None,
            completed_at: None,
            no_show_at: None,
        };
        let created = Event::BookingCreated {
            booking: booking.clone(),
        };
        self.persist_and_apply(&mut guard, &created).await?;

        let released = Event::HoldReleased {
            id: hold_id,
            tutor_id,
        };
        if let Err(e) = self.persist_and_apply(&mut guard, &released).await {
            warn!(booking_id = %id, %hold_id, "booking created but hold not released: {e}");
        }
        drop(guard);

        metrics::counter!(observability::BOOKINGS_CREATED_TOTAL).increment(1);
        info!(
            booking_id = %id,
            %tutor_id,
            %consumer_id,
            price = booking.terms.price.amount_minor,
            currency = %booking.terms.price.currency,
            "booking created"
        );
        self.notify.send(DomainEvent::BookingCreated {
            booking_id: id,
            tutor_id,
            consumer_id,
            at: now,
        });
        Ok(booking)
    }

    /// BOOKED → CONFIRMED. Only the tutor may acknowledge.
    pub async fn acknowledge_booking(
        &self,
        booking_id: Ulid,
        actor: Ulid,
    ) -> Result<Booking, EngineError> {
        self.transition(booking_id, actor, |_| Transition::Acknowledge)
            .await
    }

    /// Cancel on behalf of whichever side `actor` is on.
    pub async fn cancel_booking(&self, booking_id: Ulid, actor: Ulid) -> Result<Booking, EngineError> {
        self.transition(booking_id, actor, Transition::Cancel).await
    }

    pub async fn complete_booking(
        &self,
        booking_id: Ulid,
        actor: Ulid,
    ) -> Result<Booking, EngineError> {
        self.transition(booking_id, actor, |_| Transition::Complete)
            .await
    }

    /// Record that `absent` did not show up. Allowed once the session has started.
    pub async fn report_no_show(
        &self,
        booking_id: Ulid,
        actor: Ulid,
        absent: Party,
    ) -> Result<Booking, EngineError> {
        self.transition(booking_id, actor, |_| Transition::NoShow(absent))
            .await
    }

    /// Guard order: booking exists → move is legal from the current status →
    /// actor may make it → temporal guard.
    async fn transition(
        &self,
        booking_id: Ulid,
        actor: Ulid,
        make: impl FnOnce(Party) -> Transition,
    ) -> Result<Booking, EngineError> {
        let (tutor_id, mut guard) = self.resolve_entity_write(&booking_id).await?;
        let booking = guard
            .bookings
            .get(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;

        let party = booking.party_of(actor);
        // Legality never depends on which side acts, so an outsider is judged as a consumer.
        let transition = make(party.unwrap_or(Party::Consumer));
        let invalid = EngineError::InvalidTransition {
            from: booking.status,
            action: transition.name(),
        };
        let Some(next) = booking.status.next(transition) else {
            return Err(invalid);
        };

        let Some(party) = party else {
            return Err(EngineError::Forbidden("actor is not a party to this booking"));
        };
        match transition {
            Transition::Acknowledge if party != Party::Provider => {
                return Err(EngineError::Forbidden("only the tutor can acknowledge"));
            }
            Transition::Complete if party != Party::Provider => {
                return Err(EngineError::Forbidden("only the tutor can complete"));
            }
            _ => {}
        }

        let now = self.now();
        if matches!(transition, Transition::NoShow(_)) && now < booking.span.start {
            return Err(invalid);
        }

        let event = Event::BookingTransitioned {
            id: booking_id,
            tutor_id,
            status: next,
            at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        let updated = guard
            .bookings
            .get(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        drop(guard);

        metrics::counter!(observability::BOOKING_TRANSITIONS_TOTAL, "to" => next.as_str())
            .increment(1);
        info!(%booking_id, %tutor_id, from = %booking.status, to = %next, "booking transitioned");

        let consumer_id = booking.consumer_id;
        self.notify.send(match transition {
            Transition::Acknowledge => DomainEvent::BookingAcknowledged {
                booking_id,
                tutor_id,
                consumer_id,
                at: now,
            },
            Transition::Cancel(by) => DomainEvent::BookingCanceled {
                booking_id,
                tutor_id,
                consumer_id,
                by,
                at: now,
            },
            Transition::Complete => DomainEvent::BookingCompleted {
                booking_id,
                tutor_id,
                consumer_id,
                at: now,
            },
            Transition::NoShow(absent) => DomainEvent::NoShowReported {
                booking_id,
                tutor_id,
                consumer_id,
                absent,
                at: now,
            },
        });
        Ok(updated)
    }
}
