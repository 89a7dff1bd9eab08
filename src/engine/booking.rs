use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::availability::{validate_window, window_bookable};
use super::ledger::select_paying_assignment;
use super::{Engine, EngineError, apply_debit, apply_reserve};

impl Engine {
    // ── Availability store ───────────────────────────────

    /// Bulk-declare hourly windows for one tutor on one day. Re-declaring an
    /// already-open window is a no-op; a withdrawn window is reopened.
    /// Returns the number of windows that changed.
    pub async fn declare_availability(
        &self,
        tutor_id: Ulid,
        date: NaiveDate,
        hours: &[u8],
    ) -> Result<usize, EngineError> {
        if hours.len() > HOURS_PER_DAY as usize {
            return Err(EngineError::LimitExceeded("too many windows for one day"));
        }
        if hours.iter().any(|&h| h >= HOURS_PER_DAY) {
            return Err(EngineError::LimitExceeded("hour out of range"));
        }

        let mut hours = hours.to_vec();
        hours.sort_unstable();
        hours.dedup();

        let _gate = self.mutation_gate().await;
        let mut opened = 0usize;
        for hour in hours {
            let key = SlotKey {
                tutor_id,
                date,
                hour,
            };
            let event = Event::WindowDeclared {
                tutor_id,
                date,
                hour,
            };
            match self.slot(&key) {
                Some(row) => {
                    let mut guard = self.lock_write(&row).await?;
                    if !guard.is_available {
                        self.wal_append(&event).await?;
                        guard.is_available = true;
                        opened += 1;
                    }
                }
                None => {
                    self.wal_append(&event).await?;
                    match self.slots.entry(key) {
                        // Lost a concurrent declare of the same key; the
                        // duplicate WAL event is a no-op on replay.
                        Entry::Occupied(_) => {}
                        Entry::Vacant(v) => {
                            v.insert(Arc::new(RwLock::new(SlotState::new(key))));
                            self.tutor_windows.entry(tutor_id).or_default().push(key);
                            opened += 1;
                        }
                    }
                }
            }
        }
        tracing::debug!("tutor {tutor_id} declared {opened} windows on {date}");
        Ok(opened)
    }

    /// Mark a window unavailable. The row stays (it may be referenced by
    /// historical lessons); a window holding active reservations cannot be
    /// withdrawn.
    pub async fn withdraw_availability(
        &self,
        tutor_id: Ulid,
        date: NaiveDate,
        hour: u8,
    ) -> Result<(), EngineError> {
        let key = SlotKey {
            tutor_id,
            date,
            hour,
        };
        let _gate = self.mutation_gate().await;
        let row = self.slot(&key).ok_or(EngineError::UnknownWindow(key))?;
        let mut guard = self.lock_write(&row).await?;
        if guard.hours_booked > 0 {
            return Err(EngineError::SlotConflict(key));
        }
        if !guard.is_available {
            return Ok(());
        }
        let event = Event::WindowWithdrawn {
            tutor_id,
            date,
            hour,
        };
        self.wal_append(&event).await?;
        guard.is_available = false;
        Ok(())
    }

    // ── Booking ──────────────────────────────────────────

    /// Atomically reserve a window, debit the paying package, and create the
    /// lesson. Holds write locks on the student row and on every covered
    /// slot row (in sorted key order) from re-validation through commit, so
    /// two racing calls for the same window resolve to exactly one winner;
    /// the loser sees `SlotConflict`. Nothing is applied unless the single
    /// `LessonBooked` record made it to the WAL.
    #[allow(clippy::too_many_arguments)]
    pub async fn book(
        &self,
        tutor_id: Ulid,
        student_id: Ulid,
        date: NaiveDate,
        start_hour: u8,
        end_hour: u8,
        language: &str,
        topic: Option<&str>,
    ) -> Result<Lesson, EngineError> {
        validate_window(start_hour, end_hour)?;
        if language.len() > MAX_LANGUAGE_LEN {
            return Err(EngineError::LimitExceeded("language too long"));
        }
        if topic.is_some_and(|t| t.len() > MAX_TOPIC_LEN) {
            return Err(EngineError::LimitExceeded("topic too long"));
        }
        if !self.tutor_windows.contains_key(&tutor_id) {
            return Err(EngineError::NotFound(tutor_id));
        }

        let _gate = self.mutation_gate().await;
        let now = self.now();
        let first_key = SlotKey {
            tutor_id,
            date,
            hour: start_hour,
        };
        let span = Span::new(
            hour_start(date, start_hour).timestamp(),
            hour_start(date, end_hour).timestamp(),
        );
        if span.start < now.timestamp() + self.policy.min_lead_secs {
            return Err(EngineError::SlotConflict(first_key));
        }

        let student_row = self
            .student(&student_id)
            .ok_or(EngineError::NotFound(student_id))?;
        let mut student = self.lock_write(&student_row).await?;

        if self.policy.enforce_student_overlap
            && let Some(other) = student.overlapping_booking(&span)
        {
            return Err(EngineError::AlreadyExists(other));
        }

        let hours = (end_hour - start_hour) as f64;
        let paying = select_paying_assignment(
            &student,
            self.policy.package_selection,
            now,
            hours,
        )
        .inspect_err(|_| {
            metrics::counter!(observability::INSUFFICIENT_HOURS_TOTAL).increment(1);
        })?;

        // Re-validate under write locks, taken in sorted key order. This is
        // the critical section that closes the query-to-reserve race.
        let mut slot_guards = Vec::with_capacity((end_hour - start_hour) as usize);
        for hour in start_hour..end_hour {
            let key = SlotKey {
                tutor_id,
                date,
                hour,
            };
            let row = self.slot(&key).ok_or(EngineError::SlotConflict(key))?;
            let guard = self.lock_write(&row).await?;
            if !window_bookable(&guard, now.timestamp(), self.policy.min_lead_secs) {
                metrics::counter!(observability::SLOT_CONFLICTS_TOTAL).increment(1);
                return Err(EngineError::SlotConflict(key));
            }
            slot_guards.push(guard);
        }

        let lesson_id = Ulid::new();
        let room = self
            .rooms
            .provision(lesson_id)
            .await
            .map_err(EngineError::RoomProvision)?;

        let event = Event::LessonBooked {
            id: lesson_id,
            tutor_id,
            student_id,
            date,
            start_hour,
            end_hour,
            language: language.to_string(),
            topic: topic.map(str::to_string),
            package_assignment_id: paying,
            hours,
            room: room.clone(),
            booked_at: now,
        };
        self.wal_append(&event).await?;

        for guard in &mut slot_guards {
            apply_reserve(guard);
        }
        if let Some(pkg) = student.package_mut(paying) {
            apply_debit(pkg, hours);
        }
        student.booked.push((lesson_id, span));

        let lesson = Lesson {
            id: lesson_id,
            tutor_id,
            student_id,
            date,
            start_hour,
            end_hour,
            status: LessonStatus::Scheduled,
            language: language.to_string(),
            topic: topic.map(str::to_string),
            package_assignment_id: paying,
            hours,
            room,
            booked_at: now,
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
        self.lessons.insert(
            lesson_id,
            Arc::new(RwLock::new(LessonState::new(lesson.clone()))),
        );

        self.notify_parties(&lesson, &event);
        metrics::counter!(observability::BOOKINGS_TOTAL).increment(1);
        tracing::info!(
            "booked lesson {lesson_id}: tutor {tutor_id}, student {student_id}, {date} {:02}:00-{:02}:00",
            start_hour,
            end_hour
        );
        Ok(lesson)
    }
}
