use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::config::PackageSelection;
use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

/// Pick the assignment that pays for a booking of `hours`.
///
/// `SingleActive`: there is at most one active assignment, use it.
/// `EarliestExpiring`: among active assignments with sufficient balance,
/// the one expiring first is debited.
///
/// The reported `available` on failure is the largest single active balance,
/// since one assignment pays for the whole lesson.
pub(super) fn select_paying_assignment(
    student: &StudentState,
    selection: PackageSelection,
    now: DateTime<Utc>,
    hours: f64,
) -> Result<Ulid, EngineError> {
    let mut active: Vec<&PackageAssignment> = student
        .packages
        .iter()
        .filter(|p| p.is_active(now))
        .collect();
    if selection == PackageSelection::EarliestExpiring {
        active.sort_by_key(|p| p.expires_at);
    }
    if let Some(pkg) = active.iter().find(|p| p.hours_remaining >= hours) {
        return Ok(pkg.id);
    }
    Err(EngineError::InsufficientHours {
        required: hours,
        available: active
            .iter()
            .map(|p| p.hours_remaining)
            .fold(0.0, f64::max),
    })
}

impl Engine {
    /// Register a prepaid package assignment for a student. The first
    /// assignment also registers the student. Under the `SingleActive`
    /// policy a second active assignment is rejected.
    pub async fn assign_package(
        &self,
        student_id: Ulid,
        package_id: Ulid,
        hours: f64,
        expires_at: DateTime<Utc>,
    ) -> Result<Ulid, EngineError> {
        if !(hours > 0.0 && hours <= MAX_PACKAGE_HOURS) {
            return Err(EngineError::LimitExceeded("package hours out of range"));
        }
        let now = self.now();
        if expires_at <= now {
            return Err(EngineError::LimitExceeded("package already expired"));
        }

        let _gate = self.mutation_gate().await;
        let row = self
            .students
            .entry(student_id)
            .or_insert_with(|| Arc::new(RwLock::new(StudentState::new(student_id))))
            .value()
            .clone();
        let mut guard = self.lock_write(&row).await?;

        if guard.packages.len() >= MAX_PACKAGES_PER_STUDENT {
            return Err(EngineError::LimitExceeded("too many packages for student"));
        }
        if self.policy.package_selection == PackageSelection::SingleActive
            && let Some(existing) = guard.packages.iter().find(|p| p.is_active(now))
        {
            return Err(EngineError::AlreadyExists(existing.id));
        }

        let id = Ulid::new();
        let event = Event::PackageAssigned {
            id,
            student_id,
            package_id,
            hours,
            assigned_at: now,
            expires_at,
        };
        self.wal_append(&event).await?;
        guard.packages.push(PackageAssignment {
            id,
            student_id,
            package_id,
            total_hours: hours,
            hours_remaining: hours,
            assigned_at: now,
            expires_at,
        });
        tracing::info!("assigned package {package_id} ({hours}h) to student {student_id}");
        Ok(id)
    }

    /// Current balances for every assignment a student holds.
    pub async fn package_balances(&self, student_id: Ulid) -> Result<Vec<PackageView>, EngineError> {
        let row = self
            .student(&student_id)
            .ok_or(EngineError::NotFound(student_id))?;
        let guard = row.read().await;
        let now = self.now();
        Ok(guard
            .packages
            .iter()
            .map(|p| PackageView {
                id: p.id,
                package_id: p.package_id,
                total_hours: p.total_hours,
                hours_remaining: p.hours_remaining,
                expires_at: p.expires_at,
                active: p.is_active(now),
            })
            .collect())
    }
}
