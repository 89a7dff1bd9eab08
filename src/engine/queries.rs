use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::MAX_QUERY_DAYS;
use crate::model::*;

use super::availability::window_bookable;
use super::{Engine, EngineError};

impl Engine {
    /// Bookable windows for one tutor over a date range (inclusive). A
    /// window shows up only if it would survive the booking re-validation
    /// right now: declared, spare capacity, lead time respected.
    pub async fn query_available_slots(
        &self,
        tutor_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<SlotView>, EngineError> {
        if from > to {
            return Err(EngineError::LimitExceeded("range start after end"));
        }
        if (to - from).num_days() >= MAX_QUERY_DAYS {
            return Err(EngineError::LimitExceeded("query range too wide"));
        }
        let mut keys: Vec<SlotKey> = self
            .tutor_windows
            .get(&tutor_id)
            .ok_or(EngineError::NotFound(tutor_id))?
            .iter()
            .filter(|k| k.date >= from && k.date <= to)
            .copied()
            .collect();
        keys.sort();

        let now = self.now().timestamp();
        let mut views = Vec::new();
        for key in keys {
            let Some(row) = self.slot(&key) else { continue };
            let guard = row.read().await;
            if window_bookable(&guard, now, self.policy.min_lead_secs) {
                views.push(SlotView::from_key(key));
            }
        }
        Ok(views)
    }

    pub async fn lesson(&self, lesson_id: Ulid) -> Result<Lesson, EngineError> {
        let row = self
            .lesson_state(&lesson_id)
            .ok_or(EngineError::NotFound(lesson_id))?;
        Ok(row.read().await.lesson.clone())
    }

    pub async fn lesson_sessions(&self, lesson_id: Ulid) -> Result<Vec<MeetingSession>, EngineError> {
        let row = self
            .lesson_state(&lesson_id)
            .ok_or(EngineError::NotFound(lesson_id))?;
        Ok(row.read().await.sessions.clone())
    }

    pub async fn lessons_for_tutor(&self, tutor_id: Ulid) -> Vec<Lesson> {
        self.lessons_matching(|l| l.tutor_id == tutor_id).await
    }

    pub async fn lessons_for_student(&self, student_id: Ulid) -> Vec<Lesson> {
        self.lessons_matching(|l| l.student_id == student_id).await
    }

    async fn lessons_matching(&self, pred: impl Fn(&Lesson) -> bool) -> Vec<Lesson> {
        let rows: Vec<_> = self.lessons.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for row in rows {
            let guard = row.read().await;
            if pred(&guard.lesson) {
                out.push(guard.lesson.clone());
            }
        }
        out.sort_by_key(|l| (l.date, l.start_hour, l.id));
        out
    }
}
