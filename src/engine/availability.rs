use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use chrono_tz::Tz;

use crate::limits::*;
use crate::model::*;

use super::conflict::has_conflict;
use super::EngineError;

// ── Calendar projection ───────────────────────────────────────────

pub fn parse_timezone(name: &str) -> Result<Tz, EngineError> {
    name.parse::<Tz>()
        .map_err(|_| EngineError::validation(format!("unknown timezone: {name}")))
}

/// Map a local wall-clock time to a UTC instant.
///
/// Ambiguous times (clocks falling back) take the earliest instant. Times in a
/// spring-forward gap do not exist and are shifted forward by one hour.
pub fn resolve_local(tz: Tz, local: NaiveDateTime) -> Option<Ms> {
    tz.from_local_datetime(&local)
        .earliest()
        .or_else(|| {
            tz.from_local_datetime(&(local + chrono::Duration::hours(1)))
                .earliest()
        })
        .map(|dt| dt.timestamp_millis())
}

/// UTC span of a local window on `date`. `None` if DST squeezes it to nothing.
pub fn window_to_span(tz: Tz, date: NaiveDate, window: &LocalWindow) -> Option<Span> {
    let start = resolve_local(tz, date.and_time(window.start))?;
    let end = if window.ends_at_midnight() {
        resolve_local(tz, date.succ_opt()?.and_time(NaiveTime::MIN))?
    } else {
        resolve_local(tz, date.and_time(window.end))?
    };
    (end > start).then(|| Span::new(start, end))
}

/// Windows offered on one local date before allocations are considered.
///
/// Precedence: vacation > blackout exception > custom-window exception > weekly rules.
pub fn day_windows(state: &TutorState, tz: Tz, date: NaiveDate) -> Result<Vec<Span>, EngineError> {
    if state.vacations.iter().any(|v| v.covers(date)) {
        return Ok(Vec::new());
    }

    let mut spans = Vec::new();
    match state.exceptions.get(&date) {
        Some(exc) if !exc.is_available => return Ok(Vec::new()),
        Some(exc) if !exc.windows.is_empty() => {
            spans.extend(exc.windows.iter().filter_map(|w| window_to_span(tz, date, w)));
        }
        _ => {
            let weekday = date.weekday().num_days_from_monday() as u8;
            for rule in state.rules.iter().filter(|r| r.applies_on(date, weekday)) {
                let rule_tz = if rule.timezone.is_empty() {
                    tz
                } else {
                    parse_timezone(&rule.timezone)?
                };
                spans.extend(window_to_span(rule_tz, date, &rule.window));
            }
        }
    }

    spans.sort_by_key(|s| s.start);
    Ok(merge_overlapping(&spans))
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// Cut a window into back-to-back pieces of `step` ms; a short remainder is dropped.
pub fn slice_window(window: &Span, step: Ms) -> impl Iterator<Item = Span> + '_ {
    let count = if step > 0 { window.duration_ms() / step } else { 0 };
    (0..count).map(move |k| {
        let start = window.start + k * step;
        Span::new(start, start + step)
    })
}

// ── Slot generation ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct SlotQuery {
    /// First local date, inclusive.
    pub from: NaiveDate,
    /// Last local date, inclusive.
    pub to: NaiveDate,
    pub duration_minutes: u32,
    pub max_slots: usize,
}

impl SlotQuery {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.duration_minutes == 0 || self.duration_minutes > MAX_SESSION_MINUTES {
            return Err(EngineError::validation(format!(
                "duration must be between 1 and {MAX_SESSION_MINUTES} minutes"
            )));
        }
        if self.to < self.from {
            return Err(EngineError::validation("date range ends before it starts"));
        }
        if self.to.signed_duration_since(self.from).num_days() >= MAX_QUERY_DAYS {
            return Err(EngineError::LimitExceeded("date range too wide"));
        }
        Ok(())
    }
}

/// Project a tutor's calendar onto open slots.
///
/// Dates are local to the tutor's timezone. Slices starting before `now`, and
/// slices overlapping an active booking or a live hold, are discarded. Result
/// is ascending by start and capped at `query.max_slots`.
pub fn generate_slots(
    state: &TutorState,
    query: &SlotQuery,
    now: Ms,
) -> Result<Vec<Slot>, EngineError> {
    query.validate()?;
    let tz = parse_timezone(&state.profile.timezone)?;

    let mut windows = Vec::new();
    let mut date = query.from;
    loop {
        windows.extend(day_windows(state, tz, date)?);
        if date >= query.to {
            break;
        }
        date = match date.succ_opt() {
            Some(next) => next,
            None => break,
        };
    }
    // Windows from neighbouring dates can touch or overlap in UTC.
    windows.sort_by_key(|s| s.start);
    let windows = merge_overlapping(&windows);

    let step = Ms::from(query.duration_minutes) * MINUTE_MS;
    let tutor_id = state.id();
    let slots = windows
        .iter()
        .flat_map(|w| slice_window(w, step))
        .filter(|s| s.start >= now)
        .filter(|s| !has_conflict(state, s, now, None))
        .take(query.max_slots)
        .map(|span| Slot { tutor_id, span })
        .collect();
    Ok(slots)
}
