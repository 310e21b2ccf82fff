use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::parse_timezone;
use super::{Engine, EngineError};

fn validate_profile(profile: &TutorProfile) -> Result<(), EngineError> {
    if profile.timezone.len() > MAX_TIMEZONE_LEN {
        return Err(EngineError::LimitExceeded("timezone name too long"));
    }
    parse_timezone(&profile.timezone)?;
    let currency = &profile.base_price.currency;
    if currency.is_empty() || currency.len() > MAX_CURRENCY_LEN {
        return Err(EngineError::validation(format!("invalid currency: {currency:?}")));
    }
    if profile.base_price.amount_minor < 0 {
        return Err(EngineError::validation("base price must not be negative"));
    }
    let policy = &profile.policy;
    if policy.late_cancel_fee_percent > 100 || policy.no_show_fee_percent > 100 {
        return Err(EngineError::validation("fee percentages must be within 0..=100"));
    }
    Ok(())
}

fn validate_rule(rule: &AvailabilityRule) -> Result<(), EngineError> {
    if rule.day_of_week > 6 {
        return Err(EngineError::validation("day_of_week must be 0 (Monday) through 6 (Sunday)"));
    }
    if !rule.window.is_valid() {
        return Err(EngineError::validation("rule window ends before it starts"));
    }
    if rule.timezone.len() > MAX_TIMEZONE_LEN {
        return Err(EngineError::LimitExceeded("timezone name too long"));
    }
    if !rule.timezone.is_empty() {
        parse_timezone(&rule.timezone)?;
    }
    if let (Some(from), Some(until)) = (rule.valid_from, rule.valid_until)
        && until < from
    {
        return Err(EngineError::validation("valid_until is before valid_from"));
    }
    Ok(())
}

fn validate_exception(exception: &AvailabilityException) -> Result<(), EngineError> {
    if !exception.is_available && !exception.windows.is_empty() {
        return Err(EngineError::validation("a blackout exception cannot carry windows"));
    }
    if exception.windows.len() > MAX_WINDOWS_PER_EXCEPTION {
        return Err(EngineError::LimitExceeded("too many windows on exception"));
    }
    if exception.windows.iter().any(|w| !w.is_valid()) {
        return Err(EngineError::validation("exception window ends before it starts"));
    }
    Ok(())
}

impl Engine {
    pub async fn register_tutor(&self, profile: TutorProfile) -> Result<(), EngineError> {
        validate_profile(&profile)?;
        let _registration = self.registration.read().await;
        if self.state.len() >= MAX_TUTORS {
            return Err(EngineError::LimitExceeded("too many tutors"));
        }
        let id = profile.id;

        // Publish the tutor already write-locked so nobody observes it before
        // the WAL append is durable.
        let ts = Arc::new(RwLock::new(TutorState::new(profile.clone())));
        let guard = ts.clone().try_write_owned().map_err(|_| EngineError::AlreadyExists(id))?;
        match self.state.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(ts);
            }
        }

        let event = Event::TutorRegistered { profile };
        if let Err(e) = self.wal_append(&event).await {
            self.state.remove(&id);
            return Err(e);
        }
        drop(guard);
        tracing::info!(%id, "tutor registered");
        Ok(())
    }

    /// Replace a tutor's profile. Existing bookings keep their captured terms.
    pub async fn update_tutor(&self, profile: TutorProfile) -> Result<(), EngineError> {
        validate_profile(&profile)?;
        let id = profile.id;
        let mut guard = self.tutor_write(id).await?;
        let event = Event::TutorUpdated { profile };
        self.persist_and_apply(&mut guard, &event).await?;
        self.pricing.invalidate(id);
        tracing::info!(%id, "tutor updated");
        Ok(())
    }

    pub async fn add_rule(&self, rule: AvailabilityRule) -> Result<(), EngineError> {
        validate_rule(&rule)?;
        let mut guard = self.tutor_write(rule.tutor_id).await?;
        if self.entity_to_tutor.contains_key(&rule.id) {
            return Err(EngineError::AlreadyExists(rule.id));
        }
        if guard.rules.len() >= MAX_RULES_PER_TUTOR {
            return Err(EngineError::LimitExceeded("too many rules on tutor"));
        }
        let event = Event::RuleAdded { rule };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn remove_rule(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (tutor_id, mut guard) = self.resolve_entity_write(&id).await?;
        if !guard.rules.iter().any(|r| r.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::RuleRemoved { id, tutor_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(tutor_id)
    }

    /// Set the single exception for `exception.date`, replacing any existing one.
    pub async fn set_exception(&self, exception: AvailabilityException) -> Result<(), EngineError> {
        validate_exception(&exception)?;
        let mut guard = self.tutor_write(exception.tutor_id).await?;
        let replaces = guard.exceptions.get(&exception.date).map(|e| e.id);
        if replaces != Some(exception.id) && self.entity_to_tutor.contains_key(&exception.id) {
            return Err(EngineError::AlreadyExists(exception.id));
        }
        if replaces.is_none() && guard.exceptions.len() >= MAX_EXCEPTIONS_PER_TUTOR {
            return Err(EngineError::LimitExceeded("too many exceptions on tutor"));
        }
        let event = Event::ExceptionSet { exception };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn remove_exception(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (tutor_id, mut guard) = self.resolve_entity_write(&id).await?;
        if guard.exception_by_id(id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::ExceptionRemoved { id, tutor_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(tutor_id)
    }

    pub async fn add_vacation(&self, vacation: Vacation) -> Result<(), EngineError> {
        if vacation.end_date < vacation.start_date {
            return Err(EngineError::validation("vacation ends before it starts"));
        }
        let mut guard = self.tutor_write(vacation.tutor_id).await?;
        if self.entity_to_tutor.contains_key(&vacation.id) {
            return Err(EngineError::AlreadyExists(vacation.id));
        }
        if guard.vacations.len() >= MAX_VACATIONS_PER_TUTOR {
            return Err(EngineError::LimitExceeded("too many vacations on tutor"));
        }
        let event = Event::VacationAdded { vacation };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn remove_vacation(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (tutor_id, mut guard) = self.resolve_entity_write(&id).await?;
        if !guard.vacations.iter().any(|v| v.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::VacationRemoved { id, tutor_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(tutor_id)
    }
}
