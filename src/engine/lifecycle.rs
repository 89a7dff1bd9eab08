use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::{Engine, EngineError, apply_cancelled, apply_credit, apply_release};

impl Engine {
    /// Cancel a scheduled lesson. Either party may cancel; the window is
    /// freed for re-booking either way. The debited hours come back only
    /// when the cancellation lands at least `cancel_cutoff` before start;
    /// a late cancellation forfeits them.
    pub async fn cancel(
        &self,
        lesson_id: Ulid,
        actor: Actor,
        actor_id: Ulid,
        reason: &str,
    ) -> Result<Lesson, EngineError> {
        if reason.len() > MAX_REASON_LEN {
            return Err(EngineError::LimitExceeded("reason too long"));
        }
        let _gate = self.mutation_gate().await;
        let lrow = self
            .lesson_state(&lesson_id)
            .ok_or(EngineError::NotFound(lesson_id))?;
        let mut lstate = self.lock_write(&lrow).await?;

        let expected = match actor {
            Actor::Student => lstate.lesson.student_id,
            Actor::Tutor => lstate.lesson.tutor_id,
        };
        if actor_id != expected {
            return Err(EngineError::Forbidden(actor_id));
        }
        if !lstate.lesson.status.permits(LessonStatus::Cancelled) {
            return Err(EngineError::InvalidTransition {
                lesson_id,
                from: lstate.lesson.status,
            });
        }

        let now = self.now();
        let timely = lstate.lesson.start_at() - now >= self.policy.cancel_cutoff();
        let refund_hours = if timely { lstate.lesson.hours } else { 0.0 };

        let student_row = self
            .student(&lstate.lesson.student_id)
            .ok_or(EngineError::NotFound(lstate.lesson.student_id))?;
        let mut student = self.lock_write(&student_row).await?;
        let mut slot_guards = Vec::new();
        for key in lstate.lesson.slot_keys() {
            if let Some(row) = self.slot(&key) {
                slot_guards.push(self.lock_write(&row).await?);
            }
        }

        let event = Event::LessonCancelled {
            id: lesson_id,
            actor,
            reason: reason.to_string(),
            at: now,
            refund_hours,
        };
        self.wal_append(&event).await?;

        apply_cancelled(&mut lstate.lesson, actor, reason, now, refund_hours);
        for guard in &mut slot_guards {
            apply_release(guard);
        }
        student.remove_booked(lesson_id);
        if refund_hours > 0.0
            && let Some(pkg) = student.package_mut(lstate.lesson.package_assignment_id)
        {
            apply_credit(pkg, refund_hours);
        }

        self.notify_parties(&lstate.lesson, &event);
        metrics::counter!(
            observability::CANCELLATIONS_TOTAL,
            "refunded" => if timely { "true" } else { "false" }
        )
        .increment(1);
        tracing::info!(
            "lesson {lesson_id} cancelled by {actor:?}, refund {refund_hours}h"
        );
        Ok(lstate.lesson.clone())
    }

    /// Tutor marks a lesson as held. Valid from `scheduled` (the tutor may
    /// complete without telemetry ever arriving) or `in_progress`. Opens the
    /// lesson for student feedback; never refunds.
    pub async fn complete(&self, lesson_id: Ulid, tutor_id: Ulid) -> Result<Lesson, EngineError> {
        let _gate = self.mutation_gate().await;
        let lrow = self
            .lesson_state(&lesson_id)
            .ok_or(EngineError::NotFound(lesson_id))?;
        let mut lstate = self.lock_write(&lrow).await?;

        if tutor_id != lstate.lesson.tutor_id {
            return Err(EngineError::Forbidden(tutor_id));
        }
        if !lstate.lesson.status.permits(LessonStatus::Completed) {
            return Err(EngineError::InvalidTransition {
                lesson_id,
                from: lstate.lesson.status,
            });
        }

        let now = self.now();
        let event = Event::LessonCompleted { id: lesson_id, at: now };
        self.wal_append(&event).await?;

        lstate.lesson.status = LessonStatus::Completed;
        lstate.lesson.completed_at = Some(now);
        if let Some(student_row) = self.student(&lstate.lesson.student_id) {
            self.lock_write(&student_row).await?.remove_booked(lesson_id);
        }

        self.notify_parties(&lstate.lesson, &event);
        metrics::counter!(observability::COMPLETIONS_TOTAL).increment(1);
        tracing::info!("lesson {lesson_id} completed");
        Ok(lstate.lesson.clone())
    }

    /// Tutor marks a lesson nobody showed up for. Requires the scheduled
    /// window to be over and no student attendance on record; the hours are
    /// forfeited, which is what separates a no-show from a timely
    /// cancellation. The window itself is freed.
    pub async fn mark_no_show(&self, lesson_id: Ulid, tutor_id: Ulid) -> Result<Lesson, EngineError> {
        let _gate = self.mutation_gate().await;
        let lrow = self
            .lesson_state(&lesson_id)
            .ok_or(EngineError::NotFound(lesson_id))?;
        let mut lstate = self.lock_write(&lrow).await?;

        if tutor_id != lstate.lesson.tutor_id {
            return Err(EngineError::Forbidden(tutor_id));
        }
        if !lstate.lesson.status.permits(LessonStatus::NoShow) {
            return Err(EngineError::InvalidTransition {
                lesson_id,
                from: lstate.lesson.status,
            });
        }
        let now = self.now();
        if now < lstate.lesson.end_at() {
            return Err(EngineError::InvalidTransition {
                lesson_id,
                from: lstate.lesson.status,
            });
        }
        if lstate.has_session_for(lstate.lesson.student_id) {
            // The student did show up; this is a completion or a dispute,
            // not a no-show.
            return Err(EngineError::InvalidTransition {
                lesson_id,
                from: lstate.lesson.status,
            });
        }

        let student_row = self
            .student(&lstate.lesson.student_id)
            .ok_or(EngineError::NotFound(lstate.lesson.student_id))?;
        let mut student = self.lock_write(&student_row).await?;
        let mut slot_guards = Vec::new();
        for key in lstate.lesson.slot_keys() {
            if let Some(row) = self.slot(&key) {
                slot_guards.push(self.lock_write(&row).await?);
            }
        }

        let event = Event::LessonNoShow { id: lesson_id, at: now };
        self.wal_append(&event).await?;

        lstate.lesson.status = LessonStatus::NoShow;
        lstate.lesson.no_show_at = Some(now);
        for guard in &mut slot_guards {
            apply_release(guard);
        }
        student.remove_booked(lesson_id);

        self.notify_parties(&lstate.lesson, &event);
        metrics::counter!(observability::NO_SHOWS_TOTAL).increment(1);
        tracing::info!("lesson {lesson_id} marked no-show");
        Ok(lstate.lesson.clone())
    }

    /// Student rates a completed lesson, once.
    pub async fn record_feedback(
        &self,
        lesson_id: Ulid,
        student_id: Ulid,
        rating: u8,
        feedback: Option<&str>,
    ) -> Result<(), EngineError> {
        if rating == 0 || rating > MAX_RATING {
            return Err(EngineError::LimitExceeded("rating out of range"));
        }
        if feedback.is_some_and(|f| f.len() > MAX_FEEDBACK_LEN) {
            return Err(EngineError::LimitExceeded("feedback too long"));
        }
        let _gate = self.mutation_gate().await;
        let lrow = self
            .lesson_state(&lesson_id)
            .ok_or(EngineError::NotFound(lesson_id))?;
        let mut lstate = self.lock_write(&lrow).await?;

        if student_id != lstate.lesson.student_id {
            return Err(EngineError::Forbidden(student_id));
        }
        if lstate.lesson.status != LessonStatus::Completed {
            return Err(EngineError::InvalidTransition {
                lesson_id,
                from: lstate.lesson.status,
            });
        }
        if lstate.lesson.rating.is_some() {
            return Err(EngineError::AlreadyExists(lesson_id));
        }

        let event = Event::FeedbackRecorded {
            id: lesson_id,
            rating,
            feedback: feedback.map(str::to_string),
        };
        self.wal_append(&event).await?;
        lstate.lesson.rating = Some(rating);
        lstate.lesson.feedback = feedback.map(str::to_string);
        Ok(())
    }
}
