use ulid::Ulid;

use crate::model::{LessonStatus, SlotKey};

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    /// No window was ever declared for this (tutor, date, hour). Distinct
    /// from `NotFound`: the tutor may well exist.
    UnknownWindow(SlotKey),
    AlreadyExists(Ulid),
    /// Lost the race for a window, or the window is not open for booking.
    /// Retryable: re-query availability and pick another slot.
    SlotConflict(SlotKey),
    InsufficientHours {
        required: f64,
        available: f64,
    },
    InvalidTransition {
        lesson_id: Ulid,
        from: LessonStatus,
    },
    /// The actor is not a party to this lesson, or not the one allowed to
    /// trigger the transition.
    Forbidden(Ulid),
    /// A row lock could not be acquired within the configured bound.
    /// Retryable.
    LockTimeout,
    LimitExceeded(&'static str),
    RoomProvision(String),
    WalError(String),
}

impl EngineError {
    /// Whether the caller can expect a retry (after re-querying) to succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SlotConflict(_) | Self::LockTimeout)
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::UnknownWindow(key) => write!(
                f,
                "no window declared for tutor {} on {} at {:02}:00",
                key.tutor_id, key.date, key.hour
            ),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::SlotConflict(key) => write!(
                f,
                "slot conflict: tutor {} {} {:02}:00 is not bookable",
                key.tutor_id, key.date, key.hour
            ),
            EngineError::InsufficientHours {
                required,
                available,
            } => write!(
                f,
                "insufficient package hours: need {required}, have {available}"
            ),
            EngineError::InvalidTransition { lesson_id, from } => {
                write!(f, "invalid transition for lesson {lesson_id} from {from:?}")
            }
            EngineError::Forbidden(id) => write!(f, "actor {id} may not perform this"),
            EngineError::LockTimeout => write!(f, "timed out waiting for a row lock"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::RoomProvision(e) => write!(f, "room provisioning failed: {e}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
