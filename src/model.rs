use std::collections::{BTreeMap, HashMap};

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds (UTC). The only instant type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// `a.start < b.end && b.start < a.end`. Touching spans do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// A wall-clock window on a single local date. `end == 00:00` means midnight
/// at the end of the date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl LocalWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Option<Self> {
        let w = Self { start, end };
        w.is_valid().then_some(w)
    }

    pub fn ends_at_midnight(&self) -> bool {
        self.end == NaiveTime::MIN
    }

    pub fn is_valid(&self) -> bool {
        self.start < self.end || self.ends_at_midnight()
    }

    /// Parse `HH:MM-HH:MM`.
    pub fn parse(s: &str) -> Option<Self> {
        let (a, b) = s.trim().split_once('-')?;
        let start = NaiveTime::parse_from_str(a.trim(), "%H:%M").ok()?;
        let end = NaiveTime::parse_from_str(b.trim(), "%H:%M").ok()?;
        Self::new(start, end)
    }
}

// ── Provider configuration ───────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    /// Amount in the currency's minor unit (cents).
    pub amount_minor: i64,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BookingPolicy {
    /// Cancellations later than this many hours before start are "late".
    pub cancellation_notice_hours: u32,
    pub late_cancel_fee_percent: u8,
    pub no_show_fee_percent: u8,
}

/// Price and policy frozen onto a booking when it is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingTerms {
    pub price: Money,
    pub policy: BookingPolicy,
    pub captured_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TutorProfile {
    pub id: Ulid,
    /// IANA zone name, e.g. `Europe/Berlin`.
    pub timezone: String,
    pub base_price: Money,
    pub policy: BookingPolicy,
    pub bookable: bool,
}

/// Recurring weekly availability. `day_of_week` is 0 = Monday … 6 = Sunday.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityRule {
    pub id: Ulid,
    pub tutor_id: Ulid,
    pub day_of_week: u8,
    pub window: LocalWindow,
    pub timezone: String,
    pub valid_from: Option<NaiveDate>,
    pub valid_until: Option<NaiveDate>,
}

impl AvailabilityRule {
    pub fn applies_on(&self, date: NaiveDate, weekday: u8) -> bool {
        self.day_of_week == weekday
            && self.valid_from.is_none_or(|from| date >= from)
            && self.valid_until.is_none_or(|until| date <= until)
    }
}

/// Per-date override. `is_available = false` blacks the date out; non-empty
/// `windows` replace the rule-derived windows for the date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityException {
    pub id: Ulid,
    pub tutor_id: Ulid,
    pub date: NaiveDate,
    pub is_available: bool,
    pub windows: Vec<LocalWindow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vacation {
    pub id: Ulid,
    pub tutor_id: Ulid,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl Vacation {
    pub fn covers(&self, date: NaiveDate) -> bool {
        self.start_date <= date && date <= self.end_date
    }
}

// ── Allocations ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hold {
    pub id: Ulid,
    pub tutor_id: Ulid,
    pub consumer_id: Ulid,
    pub span: Span,
    pub expires_at: Ms,
    pub created_at: Ms,
}

impl Hold {
    pub fn is_live(&self, now: Ms) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Booked,
    Confirmed,
    Completed,
    CanceledByConsumer,
    CanceledByProvider,
    NoShowConsumer,
    NoShowCoach,
}

/// Which side of a booking an actor is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Party {
    Consumer,
    Provider,
}

impl Party {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "consumer" | "student" => Some(Party::Consumer),
            "provider" | "tutor" | "coach" => Some(Party::Provider),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Acknowledge,
    Cancel(Party),
    Complete,
    /// Carries the absent party.
    NoShow(Party),
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::Acknowledge => "acknowledge",
            Transition::Cancel(_) => "cancel",
            Transition::Complete => "complete",
            Transition::NoShow(_) => "report_no_show",
        }
    }
}

impl BookingStatus {
    /// Booked and Confirmed bookings occupy the tutor's calendar.
    pub fn is_active(self) -> bool {
        matches!(self, BookingStatus::Booked | BookingStatus::Confirmed)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    /// The transition table. `None` means the move is not allowed.
    pub fn next(self, transition: Transition) -> Option<BookingStatus> {
        use BookingStatus::*;
        match (self, transition) {
            (Booked, Transition::Acknowledge) => Some(Confirmed),
            (Booked | Confirmed, Transition::Cancel(Party::Consumer)) => Some(CanceledByConsumer),
            (Booked | Confirmed, Transition::Cancel(Party::Provider)) => Some(CanceledByProvider),
            (Booked | Confirmed, Transition::Complete) => Some(Completed),
            (Booked | Confirmed, Transition::NoShow(Party::Consumer)) => Some(NoShowConsumer),
            (Booked | Confirmed, Transition::NoShow(Party::Provider)) => Some(NoShowCoach),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Booked => "booked",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Completed => "completed",
            BookingStatus::CanceledByConsumer => "canceled_by_consumer",
            BookingStatus::CanceledByProvider => "canceled_by_provider",
            BookingStatus::NoShowConsumer => "no_show_consumer",
            BookingStatus::NoShowCoach => "no_show_coach",
        }
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub tutor_id: Ulid,
    pub consumer_id: Ulid,
    pub student_id: Ulid,
    pub span: Span,
    pub status: BookingStatus,
    /// The hold this booking was confirmed from.
    pub hold_id: Ulid,
    pub terms: BookingTerms,
    pub created_at: Ms,
    pub acknowledged_at: Option<Ms>,
    pub canceled_at: Option<Ms>,
    pub completed_at: Option<Ms>,
    pub no_show_at: Option<Ms>,
}

impl Booking {
    /// Record a status change and stamp the matching timestamp.
    pub fn set_status(&mut self, status: BookingStatus, at: Ms) {
        self.status = status;
        match status {
            BookingStatus::Booked => {}
            BookingStatus::Confirmed => self.acknowledged_at = Some(at),
            BookingStatus::Completed => self.completed_at = Some(at),
            BookingStatus::CanceledByConsumer | BookingStatus::CanceledByProvider => {
                self.canceled_at = Some(at)
            }
            BookingStatus::NoShowConsumer | BookingStatus::NoShowCoach => {
                self.no_show_at = Some(at)
            }
        }
    }

    /// Which side of this booking `actor` is on, if any.
    pub fn party_of(&self, actor: Ulid) -> Option<Party> {
        if actor == self.tutor_id {
            Some(Party::Provider)
        } else if actor == self.consumer_id {
            Some(Party::Consumer)
        } else {
            None
        }
    }
}

/// A bookable candidate interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub tutor_id: Ulid,
    pub span: Span,
}

// ── Per-tutor state ──────────────────────────────────────────────

/// What an allocation interval represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalKind {
    Hold { expires_at: Ms },
    Booking,
}

/// Calendar-occupying entry: a hold (live or lazily expired) or an active booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub id: Ulid,
    pub span: Span,
    pub kind: IntervalKind,
}

impl Interval {
    /// Whether this interval blocks the calendar at `now`.
    pub fn is_blocking(&self, now: Ms) -> bool {
        match self.kind {
            IntervalKind::Hold { expires_at } => expires_at > now,
            IntervalKind::Booking => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TutorState {
    pub profile: TutorProfile,
    pub rules: Vec<AvailabilityRule>,
    /// At most one exception per local date.
    pub exceptions: BTreeMap<NaiveDate, AvailabilityException>,
    pub vacations: Vec<Vacation>,
    pub holds: HashMap<Ulid, Hold>,
    pub bookings: HashMap<Ulid, Booking>,
    /// Holds and active bookings, sorted by `span.start`.
    pub intervals: Vec<Interval>,
}

impl TutorState {
    pub fn new(profile: TutorProfile) -> Self {
        Self {
            profile,
            rules: Vec::new(),
            exceptions: BTreeMap::new(),
            vacations: Vec::new(),
            holds: HashMap::new(),
            bookings: HashMap::new(),
            intervals: Vec::new(),
        }
    }

    pub fn id(&self) -> Ulid {
        self.profile.id
    }

    /// Insert interval maintaining sort order by span.start.
    pub fn insert_interval(&mut self, interval: Interval) {
        let pos = self
            .intervals
            .binary_search_by_key(&interval.span.start, |i| i.span.start)
            .unwrap_or_else(|e| e);
        self.intervals.insert(pos, interval);
    }

    pub fn remove_interval(&mut self, id: Ulid) -> Option<Interval> {
        let pos = self.intervals.iter().position(|i| i.id == id)?;
        Some(self.intervals.remove(pos))
    }

    /// Return only intervals whose span overlaps the query window.
    /// Uses binary search to skip intervals starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Interval> {
        let right_bound = self
            .intervals
            .partition_point(|i| i.span.start < query.end);
        self.intervals[..right_bound]
            .iter()
            .filter(move |i| i.span.end > query.start)
    }

    pub fn exception_by_id(&self, id: Ulid) -> Option<&AvailabilityException> {
        self.exceptions.values().find(|e| e.id == id)
    }
}

/// The WAL record format. Every state change is one of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    TutorRegistered { profile: TutorProfile },
    TutorUpdated { profile: TutorProfile },
    RuleAdded { rule: AvailabilityRule },
    RuleRemoved { id: Ulid, tutor_id: Ulid },
    ExceptionSet { exception: AvailabilityException },
    ExceptionRemoved { id: Ulid, tutor_id: Ulid },
    VacationAdded { vacation: Vacation },
    VacationRemoved { id: Ulid, tutor_id: Ulid },
    HoldPlaced { hold: Hold },
    HoldReleased { id: Ulid, tutor_id: Ulid },
    BookingCreated { booking: Booking },
    BookingTransitioned {
        id: Ulid,
        tutor_id: Ulid,
        status: BookingStatus,
        at: Ms,
    },
}

impl Event {
    pub fn tutor_id(&self) -> Ulid {
        match self {
            Event::TutorRegistered { profile } | Event::TutorUpdated { profile } => profile.id,
            Event::RuleAdded { rule } => rule.tutor_id,
            Event::ExceptionSet { exception } => exception.tutor_id,
            Event::VacationAdded { vacation } => vacation.tutor_id,
            Event::HoldPlaced { hold } => hold.tutor_id,
            Event::BookingCreated { booking } => booking.tutor_id,
            Event::RuleRemoved { tutor_id, .. }
            | Event::ExceptionRemoved { tutor_id, .. }
            | Event::VacationRemoved { tutor_id, .. }
            | Event::HoldReleased { tutor_id, .. }
            | Event::BookingTransitioned { tutor_id, .. } => *tutor_id,
        }
    }
}
