use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Interval-overlap predicate on raw bounds, half-open.
pub fn overlaps(a_start: Ms, a_end: Ms, b_start: Ms, b_end: Ms) -> bool {
    a_start < b_end && b_start < a_end
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.end <= span.start {
        return Err(EngineError::validation("end must be after start"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

/// First allocation blocking `span` at `now`: an active booking or a hold with
/// `expires_at > now`. `exclude` skips the hold under re-validation.
pub fn find_conflict(
    state: &TutorState,
    span: &Span,
    now: Ms,
    exclude: Option<Ulid>,
) -> Option<Ulid> {
    state
        .overlapping(span)
        .filter(|i| Some(i.id) != exclude)
        .find(|i| i.is_blocking(now))
        .map(|i| i.id)
}

pub fn has_conflict(state: &TutorState, span: &Span, now: Ms, exclude: Option<Ulid>) -> bool {
    find_conflict(state, span, now, exclude).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = HOUR_MS;
    const BASE: Ms = 1_800_000_000_000;

    fn state_with(intervals: &[Interval]) -> TutorState {
        let mut ts = TutorState::new(TutorProfile {
            id: Ulid::new(),
            timezone: "UTC".into(),
            base_price: Money {
                amount_minor: 0,
                currency: "EUR".into(),
            },
            policy: BookingPolicy::default(),
            bookable: true,
        });
        for i in intervals {
            ts.insert_interval(*i);
        }
        ts
    }

    fn iv(start: Ms, end: Ms, kind: IntervalKind) -> Interval {
        Interval {
            id: Ulid::new(),
            span: Span::new(BASE + start, BASE + end),
            kind,
        }
    }

    fn q(start: Ms, end: Ms) -> Span {
        Span::new(BASE + start, BASE + end)
    }

    #[test]
    fn raw_overlap_predicate() {
        assert!(overlaps(10, 20, 15, 25));
        assert!(!overlaps(10, 20, 20, 30));
        assert!(!overlaps(20, 30, 10, 20));
        assert!(overlaps(10, 40, 20, 30));
    }

    #[test]
    fn booking_blocks_overlap_not_touching() {
        let b = iv(10 * H, 11 * H, IntervalKind::Booking);
        let ts = state_with(&[b]);
        assert_eq!(find_conflict(&ts, &q(10 * H + H / 2, 11 * H + H / 2), 0, None), Some(b.id));
        assert!(!has_conflict(&ts, &q(11 * H, 12 * H), 0, None));
        assert!(!has_conflict(&ts, &q(9 * H, 10 * H), 0, None));
    }

    #[test]
    fn expired_hold_is_invisible() {
        let expires_at = BASE;
        let h = iv(10 * H, 11 * H, IntervalKind::Hold { expires_at });
        let ts = state_with(&[h]);
        assert!(has_conflict(&ts, &q(10 * H, 11 * H), expires_at - 1, None));
        assert!(!has_conflict(&ts, &q(10 * H, 11 * H), expires_at, None));
    }

    #[test]
    fn excluded_hold_is_skipped_but_others_are_not() {
        let mine = iv(10 * H, 11 * H, IntervalKind::Hold { expires_at: i64::MAX });
        let ts = state_with(&[mine]);
        assert!(!has_conflict(&ts, &q(10 * H, 11 * H), 0, Some(mine.id)));

        let other = iv(10 * H, 11 * H, IntervalKind::Booking);
        let ts = state_with(&[mine, other]);
        assert_eq!(
            find_conflict(&ts, &q(10 * H, 11 * H), 0, Some(mine.id)),
            Some(other.id)
        );
    }

    #[test]
    fn validate_span_bounds() {
        assert!(validate_span(&Span { start: BASE, end: BASE }).is_err());
        assert!(matches!(
            validate_span(&Span::new(1, 2)),
            Err(EngineError::LimitExceeded(_))
        ));
        assert!(matches!(
            validate_span(&Span::new(BASE, BASE + 2 * DAY_MS)),
            Err(EngineError::LimitExceeded("span too wide"))
        ));
        assert!(validate_span(&Span::new(BASE, BASE + H)).is_ok());
    }
}
