use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::availability::{SlotQuery, generate_slots};
use super::{Engine, EngineError};

impl Engine {
    /// Open slots of `duration_minutes` for the inclusive local date range.
    /// A point-in-time snapshot; only `create_hold` is authoritative.
    pub async fn get_available_slots(
        &self,
        tutor_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
        duration_minutes: u32,
    ) -> Result<Vec<Slot>, EngineError> {
        let started = std::time::Instant::now();
        let ts = self
            .get_tutor_state(&tutor_id)
            .ok_or(EngineError::NotFound(tutor_id))?;
        let guard = ts.read().await;
        let query = SlotQuery {
            from,
            to,
            duration_minutes,
            max_slots: self.settings.max_slots,
        };
        let slots = generate_slots(&guard, &query, self.now())?;
        drop(guard);

        metrics::histogram!(crate::observability::SLOT_QUERY_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        metrics::histogram!(crate::observability::SLOTS_RETURNED).record(slots.len() as f64);
        Ok(slots)
    }

    pub async fn get_tutor(&self, tutor_id: Ulid) -> Result<TutorProfile, EngineError> {
        let ts = self
            .get_tutor_state(&tutor_id)
            .ok_or(EngineError::NotFound(tutor_id))?;
        let guard = ts.read().await;
        Ok(guard.profile.clone())
    }

    pub fn list_tutors(&self) -> Vec<TutorProfile> {
        self.state
            .iter()
            .filter_map(|entry| entry.value().try_read().ok().map(|g| g.profile.clone()))
            .collect()
    }

    pub async fn get_rules(&self, tutor_id: Ulid) -> Result<Vec<AvailabilityRule>, EngineError> {
        let Some(ts) = self.get_tutor_state(&tutor_id) else {
            return Ok(vec![]);
        };
        let guard = ts.read().await;
        Ok(guard.rules.clone())
    }

    /// Exceptions ordered by date.
    pub async fn get_exceptions(
        &self,
        tutor_id: Ulid,
    ) -> Result<Vec<AvailabilityException>, EngineError> {
        let Some(ts) = self.get_tutor_state(&tutor_id) else {
            return Ok(vec![]);
        };
        let guard = ts.read().await;
        Ok(guard.exceptions.values().cloned().collect())
    }

    pub async fn get_vacations(&self, tutor_id: Ulid) -> Result<Vec<Vacation>, EngineError> {
        let Some(ts) = self.get_tutor_state(&tutor_id) else {
            return Ok(vec![]);
        };
        let guard = ts.read().await;
        let mut vacations = guard.vacations.clone();
        vacations.sort_by_key(|v| v.start_date);
        Ok(vacations)
    }

    /// Live holds only; an expired hold does not exist here.
    pub async fn get_holds(&self, tutor_id: Ulid) -> Result<Vec<Hold>, EngineError> {
        let Some(ts) = self.get_tutor_state(&tutor_id) else {
            return Ok(vec![]);
        };
        let guard = ts.read().await;
        let now = self.now();
        let mut holds: Vec<Hold> = guard.holds.values().filter(|h| h.is_live(now)).cloned().collect();
        holds.sort_by_key(|h| h.span.start);
        Ok(holds)
    }

    /// Every booking of the tutor, terminal ones included, ordered by start.
    pub async fn get_bookings(&self, tutor_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        let Some(ts) = self.get_tutor_state(&tutor_id) else {
            return Ok(vec![]);
        };
        let guard = ts.read().await;
        let mut bookings: Vec<Booking> = guard.bookings.values().cloned().collect();
        bookings.sort_by_key(|b| (b.span.start, b.id));
        Ok(bookings)
    }

    pub async fn get_booking(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        let tutor_id = self
            .get_tutor_for_entity(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let ts = self
            .get_tutor_state(&tutor_id)
            .ok_or(EngineError::NotFound(tutor_id))?;
        let guard = ts.read().await;
        guard
            .bookings
            .get(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))
    }
}
