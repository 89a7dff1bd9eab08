use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix seconds, the engine's instant type for interval math.
pub type Secs = i64;

/// Half-open interval `[start, end)` in unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: Secs,
    pub end: Secs,
}

impl Span {
    pub fn new(start: Secs, end: Secs) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_secs(&self) -> Secs {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Intersection of two spans, `None` when they do not overlap.
    pub fn intersect(&self, other: &Span) -> Option<Span> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        if start < end { Some(Span::new(start, end)) } else { None }
    }
}

/// UTC instant at which an hour window on a date begins. `hour` may be 24
/// (midnight of the following day) when used as a window end.
pub fn hour_start(date: NaiveDate, hour: u8) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc() + chrono::Duration::hours(hour as i64)
}

/// Who triggered a lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Actor {
    Student,
    Tutor,
}

/// Closed lesson status set. Free-form status strings are not representable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LessonStatus {
    Scheduled,
    InProgress,
    Completed,
    Cancelled,
    NoShow,
}

impl LessonStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::NoShow)
    }

    /// The transition table. Everything not listed here is an invalid edge.
    pub fn permits(self, to: LessonStatus) -> bool {
        use LessonStatus::*;
        matches!(
            (self, to),
            (Scheduled, InProgress)
                | (Scheduled, Completed)
                | (Scheduled, Cancelled)
                | (Scheduled, NoShow)
                | (InProgress, Completed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionQuality {
    Good,
    Degraded,
    Poor,
    Unknown,
}

/// Identity of one bookable hour window: one tutor, one date, one hour.
/// The map keyed by this type IS the uniqueness constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotKey {
    pub tutor_id: Ulid,
    pub date: NaiveDate,
    pub hour: u8,
}

impl SlotKey {
    pub fn start_at(&self) -> DateTime<Utc> {
        hour_start(self.date, self.hour)
    }
}

/// Capacity record for one hour window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotState {
    pub key: SlotKey,
    pub is_available: bool,
    /// Max lesson-hours this window can hold (1 for hourly windows).
    pub capacity: u32,
    /// Lesson-hours currently reserved within this window.
    pub hours_booked: u32,
}

impl SlotState {
    pub fn new(key: SlotKey) -> Self {
        Self {
            key,
            is_available: true,
            capacity: 1,
            hours_booked: 0,
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.hours_booked < self.capacity
    }
}

/// Opaque meeting-room reference handed back by the provisioning collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeetingRoom {
    pub reference: String,
    pub url: String,
}

/// The reservation record and unit of billing.
#[derive(Debug, Clone, PartialEq)]
pub struct Lesson {
    pub id: Ulid,
    pub tutor_id: Ulid,
    pub student_id: Ulid,
    pub date: NaiveDate,
    /// Half-open hour window `[start_hour, end_hour)`.
    pub start_hour: u8,
    pub end_hour: u8,
    pub status: LessonStatus,
    pub language: String,
    pub topic: Option<String>,
    pub package_assignment_id: Ulid,
    /// Hours debited from the paying assignment at booking time.
    pub hours: f64,
    pub room: MeetingRoom,
    pub booked_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancelled_by: Option<Actor>,
    pub cancel_reason: Option<String>,
    /// Hours credited back on a timely cancellation (0 otherwise).
    pub refunded_hours: f64,
    pub no_show_at: Option<DateTime<Utc>>,
    pub rating: Option<u8>,
    pub feedback: Option<String>,
}

impl Lesson {
    pub fn start_at(&self) -> DateTime<Utc> {
        hour_start(self.date, self.start_hour)
    }

    pub fn end_at(&self) -> DateTime<Utc> {
        hour_start(self.date, self.end_hour)
    }

    pub fn span(&self) -> Span {
        Span::new(self.start_at().timestamp(), self.end_at().timestamp())
    }

    pub fn duration_hours(&self) -> f64 {
        (self.end_hour - self.start_hour) as f64
    }

    /// The hour windows this lesson occupies.
    pub fn window_hours(&self) -> impl Iterator<Item = u8> {
        self.start_hour..self.end_hour
    }

    pub fn slot_keys(&self) -> Vec<SlotKey> {
        self.window_hours()
            .map(|hour| SlotKey {
                tutor_id: self.tutor_id,
                date: self.date,
                hour,
            })
            .collect()
    }
}

/// A student's prepaid hour allotment.
#[derive(Debug, Clone, PartialEq)]
pub struct PackageAssignment {
    pub id: Ulid,
    pub student_id: Ulid,
    pub package_id: Ulid,
    pub total_hours: f64,
    pub hours_remaining: f64,
    pub assigned_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PackageAssignment {
    /// Active means debitable: not expired and not exhausted.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at && self.hours_remaining > 0.0
    }
}

/// Observed attendance record, one per participant join.
#[derive(Debug, Clone, PartialEq)]
pub struct MeetingSession {
    pub id: Ulid,
    pub lesson_id: Ulid,
    pub participant_id: Ulid,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
    pub quality: ConnectionQuality,
}

impl MeetingSession {
    pub fn is_open(&self) -> bool {
        self.left_at.is_none()
    }

    /// The span actually observed; open sessions are clamped to `now`.
    pub fn observed_span(&self, now: Secs) -> Option<Span> {
        let start = self.joined_at.timestamp();
        let end = self.left_at.map(|t| t.timestamp()).unwrap_or(now);
        if start < end { Some(Span::new(start, end)) } else { None }
    }
}

/// A lesson plus its attendance telemetry, guarded by one lock.
#[derive(Debug, Clone)]
pub struct LessonState {
    pub lesson: Lesson,
    pub sessions: Vec<MeetingSession>,
}

impl LessonState {
    pub fn new(lesson: Lesson) -> Self {
        Self {
            lesson,
            sessions: Vec::new(),
        }
    }

    /// Index of the most recent open session for a participant, if any.
    pub fn open_session_idx(&self, participant_id: Ulid) -> Option<usize> {
        self.sessions
            .iter()
            .rposition(|s| s.participant_id == participant_id && s.is_open())
    }

    pub fn has_session_for(&self, participant_id: Ulid) -> bool {
        self.sessions.iter().any(|s| s.participant_id == participant_id)
    }
}

/// Per-student shared row: packages plus an index of booked windows,
/// used for the cross-tutor double-booking check.
#[derive(Debug, Clone)]
pub struct StudentState {
    pub id: Ulid,
    pub packages: Vec<PackageAssignment>,
    pub booked: Vec<(Ulid, Span)>,
}

impl StudentState {
    pub fn new(id: Ulid) -> Self {
        Self {
            id,
            packages: Vec::new(),
            booked: Vec::new(),
        }
    }

    /// Lesson id of any booked window overlapping `span`.
    pub fn overlapping_booking(&self, span: &Span) -> Option<Ulid> {
        self.booked
            .iter()
            .find(|(_, s)| s.overlaps(span))
            .map(|(id, _)| *id)
    }

    pub fn remove_booked(&mut self, lesson_id: Ulid) {
        self.booked.retain(|(id, _)| *id != lesson_id);
    }

    pub fn package_mut(&mut self, id: Ulid) -> Option<&mut PackageAssignment> {
        self.packages.iter_mut().find(|p| p.id == id)
    }
}

/// The event types, flat with no nesting. This is the WAL record format; one
/// event is one committed state change, so a `LessonBooked` record carries
/// the slot reservations, the debit, and the lesson in a single entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    WindowDeclared {
        tutor_id: Ulid,
        date: NaiveDate,
        hour: u8,
    },
    WindowWithdrawn {
        tutor_id: Ulid,
        date: NaiveDate,
        hour: u8,
    },
    PackageAssigned {
        id: Ulid,
        student_id: Ulid,
        package_id: Ulid,
        hours: f64,
        assigned_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    },
    LessonBooked {
        id: Ulid,
        tutor_id: Ulid,
        student_id: Ulid,
        date: NaiveDate,
        start_hour: u8,
        end_hour: u8,
        language: String,
        topic: Option<String>,
        package_assignment_id: Ulid,
        hours: f64,
        room: MeetingRoom,
        booked_at: DateTime<Utc>,
    },
    LessonCancelled {
        id: Ulid,
        actor: Actor,
        reason: String,
        at: DateTime<Utc>,
        /// Computed at commit time so replay never re-derives refund policy.
        refund_hours: f64,
    },
    LessonStarted {
        id: Ulid,
        at: DateTime<Utc>,
    },
    LessonCompleted {
        id: Ulid,
        at: DateTime<Utc>,
    },
    LessonNoShow {
        id: Ulid,
        at: DateTime<Utc>,
    },
    FeedbackRecorded {
        id: Ulid,
        rating: u8,
        feedback: Option<String>,
    },
    SessionOpened {
        id: Ulid,
        lesson_id: Ulid,
        participant_id: Ulid,
        at: DateTime<Utc>,
        quality: ConnectionQuality,
    },
    SessionClosed {
        lesson_id: Ulid,
        participant_id: Ulid,
        at: DateTime<Utc>,
    },
}

// ── Query result types ───────────────────────────────────────────

/// A bookable window in displayable form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotView {
    pub tutor_id: Ulid,
    pub date: NaiveDate,
    pub start_hour: u8,
    pub end_hour: u8,
    pub window: String,
}

impl SlotView {
    pub fn from_key(key: SlotKey) -> Self {
        Self {
            tutor_id: key.tutor_id,
            date: key.date,
            start_hour: key.hour,
            end_hour: key.hour + 1,
            window: format!("{:02}:00-{:02}:00", key.hour, key.hour + 1),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PackageView {
    pub id: Ulid,
    pub package_id: Ulid,
    pub total_hours: f64,
    pub hours_remaining: f64,
    pub expires_at: DateTime<Utc>,
    pub active: bool,
}

/// Scheduled window vs. observed attendance for one lesson.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationSummary {
    pub lesson_id: Ulid,
    pub scheduled_secs: i64,
    pub tutor_secs: i64,
    pub student_secs: i64,
    /// Seconds during which both participants were present inside the
    /// scheduled window.
    pub overlap_secs: i64,
    pub open_sessions: usize,
    pub tutor_joined: bool,
    pub student_joined: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_secs(), 100);
        assert!(s.overlaps(&Span::new(150, 250)));
        assert!(!s.overlaps(&Span::new(200, 300))); // adjacent, half-open
    }

    #[test]
    fn span_intersect() {
        let a = Span::new(100, 300);
        assert_eq!(a.intersect(&Span::new(200, 400)), Some(Span::new(200, 300)));
        assert_eq!(a.intersect(&Span::new(300, 400)), None);
    }

    #[test]
    fn hour_start_rolls_over_midnight() {
        let d = date(2024, 1, 10);
        let end = hour_start(d, 24);
        assert_eq!(end, hour_start(date(2024, 1, 11), 0));
    }

    #[test]
    fn transition_table() {
        use LessonStatus::*;
        assert!(Scheduled.permits(InProgress));
        assert!(Scheduled.permits(Cancelled));
        assert!(InProgress.permits(Completed));
        assert!(!InProgress.permits(Cancelled));
        assert!(!Completed.permits(Scheduled));
        assert!(!Cancelled.permits(Completed));
        for s in [Completed, Cancelled, NoShow] {
            assert!(s.is_terminal());
            for t in [Scheduled, InProgress, Completed, Cancelled, NoShow] {
                assert!(!s.permits(t));
            }
        }
    }

    #[test]
    fn package_active_window() {
        let now = Utc::now();
        let p = PackageAssignment {
            id: Ulid::new(),
            student_id: Ulid::new(),
            package_id: Ulid::new(),
            total_hours: 10.0,
            hours_remaining: 2.5,
            assigned_at: now,
            expires_at: now + chrono::Duration::days(30),
        };
        assert!(p.is_active(now));
        assert!(!p.is_active(now + chrono::Duration::days(31)));
        let exhausted = PackageAssignment {
            hours_remaining: 0.0,
            ..p
        };
        assert!(!exhausted.is_active(now));
    }

    #[test]
    fn lesson_slot_keys_cover_window() {
        let tutor = Ulid::new();
        let lesson = Lesson {
            id: Ulid::new(),
            tutor_id: tutor,
            student_id: Ulid::new(),
            date: date(2024, 1, 10),
            start_hour: 9,
            end_hour: 11,
            status: LessonStatus::Scheduled,
            language: "en".into(),
            topic: None,
            package_assignment_id: Ulid::new(),
            hours: 2.0,
            room: MeetingRoom {
                reference: "r".into(),
                url: "u".into(),
            },
            booked_at: Utc::now(),
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            cancelled_by: None,
            cancel_reason: None,
            refunded_hours: 0.0,
            no_show_at: None,
            rating: None,
            feedback: None,
        };
        let keys = lesson.slot_keys();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].hour, 9);
        assert_eq!(keys[1].hour, 10);
        assert_eq!(lesson.duration_hours(), 2.0);
        assert_eq!(lesson.span().duration_secs(), 2 * 3600);
    }

    #[test]
    fn open_session_lookup_prefers_latest() {
        let lesson_id = Ulid::new();
        let pid = Ulid::new();
        let mk = |open: bool, at: DateTime<Utc>| MeetingSession {
            id: Ulid::new(),
            lesson_id,
            participant_id: pid,
            joined_at: at,
            left_at: if open { None } else { Some(at) },
            duration_secs: if open { None } else { Some(0) },
            quality: ConnectionQuality::Good,
        };
        let now = Utc::now();
        let mut state = LessonState {
            lesson: sample_lesson(),
            sessions: vec![mk(false, now), mk(true, now)],
        };
        assert_eq!(state.open_session_idx(pid), Some(1));
        state.sessions[1].left_at = Some(now);
        assert_eq!(state.open_session_idx(pid), None);
    }

    #[test]
    fn student_overlap_index() {
        let mut st = StudentState::new(Ulid::new());
        let lesson_id = Ulid::new();
        st.booked.push((lesson_id, Span::new(1000, 2000)));
        assert_eq!(st.overlapping_booking(&Span::new(1500, 2500)), Some(lesson_id));
        assert_eq!(st.overlapping_booking(&Span::new(2000, 3000)), None);
        st.remove_booked(lesson_id);
        assert!(st.booked.is_empty());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::LessonBooked {
            id: Ulid::new(),
            tutor_id: Ulid::new(),
            student_id: Ulid::new(),
            date: date(2024, 1, 10),
            start_hour: 9,
            end_hour: 10,
            language: "de".into(),
            topic: Some("cases".into()),
            package_assignment_id: Ulid::new(),
            hours: 1.0,
            room: MeetingRoom {
                reference: "abc".into(),
                url: "https://meet.example.com/abc".into(),
            },
            booked_at: Utc::now(),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }

    fn sample_lesson() -> Lesson {
        Lesson {
            id: Ulid::new(),
            tutor_id: Ulid::new(),
            student_id: Ulid::new(),
            date: date(2024, 1, 10),
            start_hour: 9,
            end_hour: 10,
            status: LessonStatus::Scheduled,
            language: "en".into(),
            topic: None,
            package_assignment_id: Ulid::new(),
            hours: 1.0,
            room: MeetingRoom {
                reference: "r".into(),
                url: "u".into(),
            },
            booked_at: Utc::now(),
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            cancelled_by: None,
            cancel_reason: None,
            refunded_hours: 0.0,
            no_show_at: None,
            rating: None,
            feedback: None,
        }
    }
}
