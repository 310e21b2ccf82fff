//! Hard limits applied at the engine boundary.

use crate::model::Ms;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// Longest single hold/booking.
pub const MAX_SPAN_DURATION_MS: Ms = DAY_MS;
/// Session length bounds for slot generation, in minutes.
pub const MAX_SESSION_MINUTES: u32 = 24 * 60;
/// Longest configurable hold lifetime.
pub const MAX_HOLD_TTL_MS: Ms = DAY_MS;
/// Longest configurable retention of expired holds.
pub const MAX_HOLD_RETENTION_MS: Ms = 30 * DAY_MS;
/// Widest date range a single slot query may cover.
pub const MAX_QUERY_DAYS: i64 = 62;

pub const MAX_TUTORS: usize = 100_000;
pub const MAX_RULES_PER_TUTOR: usize = 256;
pub const MAX_EXCEPTIONS_PER_TUTOR: usize = 2_048;
pub const MAX_VACATIONS_PER_TUTOR: usize = 256;
pub const MAX_WINDOWS_PER_EXCEPTION: usize = 48;
pub const MAX_ALLOCATIONS_PER_TUTOR: usize = 10_000;
pub const MAX_TIMEZONE_LEN: usize = 64;
pub const MAX_CURRENCY_LEN: usize = 8;
