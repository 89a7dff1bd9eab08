use chrono::{DateTime, Utc};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::availability::{intersect_span_sets, merge_spans, total_secs};
use super::{Engine, EngineError, apply_closed_session};

impl Engine {
    /// Record a participant joining the meeting room. Opens a session; a
    /// join at or after the scheduled start also moves the lesson to
    /// `in_progress`. A participant with a session still open gets
    /// `AlreadyExists` with that session's id; the leave must arrive first.
    /// `at` is the telemetry timestamp, which may lag the wall clock.
    pub async fn record_join(
        &self,
        lesson_id: Ulid,
        participant_id: Ulid,
        at: DateTime<Utc>,
        quality: ConnectionQuality,
    ) -> Result<Ulid, EngineError> {
        let _gate = self.mutation_gate().await;
        let lrow = self
            .lesson_state(&lesson_id)
            .ok_or(EngineError::NotFound(lesson_id))?;
        let mut lstate = self.lock_write(&lrow).await?;

        if participant_id != lstate.lesson.tutor_id && participant_id != lstate.lesson.student_id {
            return Err(EngineError::Forbidden(participant_id));
        }
        if !matches!(
            lstate.lesson.status,
            LessonStatus::Scheduled | LessonStatus::InProgress
        ) {
            return Err(EngineError::InvalidTransition {
                lesson_id,
                from: lstate.lesson.status,
            });
        }
        if lstate.sessions.len() >= MAX_SESSIONS_PER_LESSON {
            return Err(EngineError::LimitExceeded("too many sessions for lesson"));
        }
        if let Some(idx) = lstate.open_session_idx(participant_id) {
            return Err(EngineError::AlreadyExists(lstate.sessions[idx].id));
        }

        let session_id = Ulid::new();
        let event = Event::SessionOpened {
            id: session_id,
            lesson_id,
            participant_id,
            at,
            quality,
        };
        self.wal_append(&event).await?;
        lstate.sessions.push(MeetingSession {
            id: session_id,
            lesson_id,
            participant_id,
            joined_at: at,
            left_at: None,
            duration_secs: None,
            quality,
        });

        if lstate.lesson.status == LessonStatus::Scheduled && at >= lstate.lesson.start_at() {
            let started = Event::LessonStarted { id: lesson_id, at };
            self.wal_append(&started).await?;
            lstate.lesson.status = LessonStatus::InProgress;
            lstate.lesson.started_at = Some(at);
            self.notify_parties(&lstate.lesson, &started);
        }

        self.notify_parties(&lstate.lesson, &event);
        metrics::counter!(observability::SESSIONS_OPENED_TOTAL).increment(1);
        tracing::debug!("participant {participant_id} joined lesson {lesson_id}");
        Ok(session_id)
    }

    /// Close the participant's open session and fix its duration. Leave
    /// telemetry with no matching open session is `NotFound`.
    pub async fn record_leave(
        &self,
        lesson_id: Ulid,
        participant_id: Ulid,
        at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let _gate = self.mutation_gate().await;
        let lrow = self
            .lesson_state(&lesson_id)
            .ok_or(EngineError::NotFound(lesson_id))?;
        let mut lstate = self.lock_write(&lrow).await?;

        let Some(idx) = lstate.open_session_idx(participant_id) else {
            return Err(EngineError::NotFound(participant_id));
        };
        if at < lstate.sessions[idx].joined_at {
            return Err(EngineError::LimitExceeded("leave precedes join"));
        }

        let event = Event::SessionClosed {
            lesson_id,
            participant_id,
            at,
        };
        self.wal_append(&event).await?;
        apply_closed_session(&mut lstate, participant_id, at);
        self.notify_parties(&lstate.lesson, &event);
        tracing::debug!("participant {participant_id} left lesson {lesson_id}");
        Ok(())
    }

    /// Compare scheduled window against observed attendance. Open sessions
    /// count up to `now`; per-participant seconds are clipped to the
    /// scheduled window, and overlap is the time both were present in it.
    pub async fn reconcile(&self, lesson_id: Ulid) -> Result<ReconciliationSummary, EngineError> {
        let lrow = self
            .lesson_state(&lesson_id)
            .ok_or(EngineError::NotFound(lesson_id))?;
        let lstate = lrow.read().await.clone();
        Ok(summarize_attendance(&lstate, self.now()))
    }

    /// Sessions still open past the lesson end plus the configured grace,
    /// as (lesson id, session id) pairs. The sweeper flags these; it never
    /// mutates them, since a late leave event may still arrive.
    pub fn collect_stale_sessions(&self, now: DateTime<Utc>) -> Vec<(Ulid, Ulid)> {
        let grace = chrono::Duration::seconds(self.policy.session_grace_secs);
        let mut stale = Vec::new();
        for entry in self.lessons.iter() {
            // Skip rows busy in a live transaction; the next sweep catches them.
            let Ok(guard) = entry.value().try_read() else {
                continue;
            };
            let deadline = guard.lesson.end_at() + grace;
            if now < deadline {
                continue;
            }
            for session in guard.sessions.iter().filter(|s| s.is_open()) {
                stale.push((guard.lesson.id, session.id));
            }
        }
        stale
    }
}

/// Pure reconciliation math over one lesson's telemetry.
fn summarize_attendance(state: &LessonState, now: DateTime<Utc>) -> ReconciliationSummary {
    let lesson = &state.lesson;
    let scheduled = lesson.span();
    let now_secs = now.timestamp();

    let spans_for = |pid: Ulid| -> Vec<Span> {
        let observed: Vec<Span> = state
            .sessions
            .iter()
            .filter(|s| s.participant_id == pid)
            .filter_map(|s| s.observed_span(now_secs))
            .collect();
        intersect_span_sets(&merge_spans(&observed), &[scheduled])
    };

    let tutor_spans = spans_for(lesson.tutor_id);
    let student_spans = spans_for(lesson.student_id);

    ReconciliationSummary {
        lesson_id: lesson.id,
        scheduled_secs: scheduled.duration_secs(),
        tutor_secs: total_secs(&tutor_spans),
        student_secs: total_secs(&student_spans),
        overlap_secs: total_secs(&intersect_span_sets(&tutor_spans, &student_spans)),
        open_sessions: state.sessions.iter().filter(|s| s.is_open()).count(),
        tutor_joined: state.has_session_for(lesson.tutor_id),
        student_joined: state.has_session_for(lesson.student_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn lesson(date: NaiveDate, start_hour: u8, end_hour: u8) -> Lesson {
        Lesson {
            id: Ulid::new(),
            tutor_id: Ulid::new(),
            student_id: Ulid::new(),
            date,
            start_hour,
            end_hour,
            status: LessonStatus::Scheduled,
            language: "en".into(),
            topic: None,
            package_assignment_id: Ulid::new(),
            hours: (end_hour - start_hour) as f64,
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

    fn session(
        lesson_id: Ulid,
        pid: Ulid,
        joined_at: DateTime<Utc>,
        left_at: Option<DateTime<Utc>>,
    ) -> MeetingSession {
        MeetingSession {
            id: Ulid::new(),
            lesson_id,
            participant_id: pid,
            joined_at,
            left_at,
            duration_secs: left_at.map(|t| (t - joined_at).num_seconds()),
            quality: ConnectionQuality::Good,
        }
    }

    #[test]
    fn summary_clips_to_scheduled_window() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        let l = lesson(date, 10, 11);
        let start = l.start_at();
        let mut state = LessonState::new(l.clone());

        // Tutor joins 5 min early, stays the whole hour.
        state.sessions.push(session(
            l.id,
            l.tutor_id,
            start - chrono::Duration::minutes(5),
            Some(start + chrono::Duration::minutes(60)),
        ));
        // Student arrives 10 min late, leaves 10 min early.
        state.sessions.push(session(
            l.id,
            l.student_id,
            start + chrono::Duration::minutes(10),
            Some(start + chrono::Duration::minutes(50)),
        ));

        let summary = summarize_attendance(&state, start + chrono::Duration::hours(2));
        assert_eq!(summary.scheduled_secs, 3600);
        assert_eq!(summary.tutor_secs, 3600);
        assert_eq!(summary.student_secs, 40 * 60);
        assert_eq!(summary.overlap_secs, 40 * 60);
        assert_eq!(summary.open_sessions, 0);
        assert!(summary.tutor_joined);
        assert!(summary.student_joined);
    }

    #[test]
    fn summary_counts_open_session_up_to_now() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        let l = lesson(date, 10, 11);
        let start = l.start_at();
        let mut state = LessonState::new(l.clone());
        state
            .sessions
            .push(session(l.id, l.student_id, start, None));

        let summary = summarize_attendance(&state, start + chrono::Duration::minutes(20));
        assert_eq!(summary.student_secs, 20 * 60);
        assert_eq!(summary.open_sessions, 1);
        assert!(!summary.tutor_joined);
    }

    #[test]
    fn summary_merges_rejoin_gaps() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        let l = lesson(date, 10, 12);
        let start = l.start_at();
        let mut state = LessonState::new(l.clone());

        // Two sessions with a 10 minute drop between them.
        state.sessions.push(session(
            l.id,
            l.student_id,
            start,
            Some(start + chrono::Duration::minutes(30)),
        ));
        state.sessions.push(session(
            l.id,
            l.student_id,
            start + chrono::Duration::minutes(40),
            Some(start + chrono::Duration::minutes(120)),
        ));

        let summary = summarize_attendance(&state, start + chrono::Duration::hours(3));
        assert_eq!(summary.student_secs, 110 * 60);
        assert_eq!(summary.overlap_secs, 0);
    }
}
