//! Hard input limits. Anything past these is a malformed or abusive request,
//! rejected with `EngineError::LimitExceeded` before touching any state.

/// Hour windows are indexed 0..24; a window may end at hour 24 (midnight).
pub const HOURS_PER_DAY: u8 = 24;

/// Longest single lesson, in whole hours.
pub const MAX_LESSON_HOURS: u8 = 8;

/// Widest slot query, in days.
pub const MAX_QUERY_DAYS: i64 = 90;

pub const MAX_TOPIC_LEN: usize = 512;
pub const MAX_REASON_LEN: usize = 512;
pub const MAX_LANGUAGE_LEN: usize = 64;
pub const MAX_FEEDBACK_LEN: usize = 2048;

pub const MAX_PACKAGES_PER_STUDENT: usize = 16;

/// Largest prepaid package, in hours.
pub const MAX_PACKAGE_HOURS: f64 = 500.0;

/// Join/leave churn cap per lesson; beyond this the telemetry is garbage.
pub const MAX_SESSIONS_PER_LESSON: usize = 64;

pub const MAX_RATING: u8 = 5;
