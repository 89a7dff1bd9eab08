use std::time::Duration;

/// Which active assignment pays for a booking when a student holds several.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageSelection {
    /// At most one active assignment per student; assigning a second fails.
    SingleActive,
    /// Several may be active; the earliest-expiring one is debited first.
    EarliestExpiring,
}

/// Business policy knobs. Everything here is policy, not correctness:
/// the engine's atomicity guarantees hold for any combination.
#[derive(Debug, Clone)]
pub struct BookingPolicy {
    /// Cancellations at least this many hours before start are refunded.
    pub cancel_cutoff_hours: i64,
    /// A window today is only bookable this many seconds ahead of now.
    pub min_lead_secs: i64,
    pub package_selection: PackageSelection,
    /// Reject a booking that overlaps another lesson of the same student,
    /// even with a different tutor.
    pub enforce_student_overlap: bool,
    /// Bound on waiting for a slot/student/lesson row lock; expiry surfaces
    /// as a retryable error instead of queueing behind a slow writer.
    pub lock_timeout: Duration,
    /// A session still open this long after its lesson ended is flagged
    /// by the sweeper as a data-quality problem.
    pub session_grace_secs: i64,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            cancel_cutoff_hours: 12,
            min_lead_secs: 3600,
            package_selection: PackageSelection::SingleActive,
            enforce_student_overlap: true,
            lock_timeout: Duration::from_secs(2),
            session_grace_secs: 6 * 3600,
        }
    }
}

impl BookingPolicy {
    pub fn cancel_cutoff(&self) -> chrono::Duration {
        chrono::Duration::hours(self.cancel_cutoff_hours)
    }

    /// Load policy from `CADENZA_*` environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut policy = Self::default();
        if let Some(v) = env_parse::<i64>("CADENZA_CANCEL_CUTOFF_HOURS") {
            policy.cancel_cutoff_hours = v;
        }
        if let Some(v) = env_parse::<i64>("CADENZA_MIN_LEAD_SECS") {
            policy.min_lead_secs = v;
        }
        if let Ok(v) = std::env::var("CADENZA_PACKAGE_SELECTION") {
            match v.as_str() {
                "single_active" => policy.package_selection = PackageSelection::SingleActive,
                "earliest_expiring" => {
                    policy.package_selection = PackageSelection::EarliestExpiring
                }
                other => tracing::warn!("unknown CADENZA_PACKAGE_SELECTION: {other}"),
            }
        }
        if let Some(v) = env_parse::<bool>("CADENZA_ENFORCE_STUDENT_OVERLAP") {
            policy.enforce_student_overlap = v;
        }
        if let Some(v) = env_parse::<u64>("CADENZA_LOCK_TIMEOUT_MS") {
            policy.lock_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<i64>("CADENZA_SESSION_GRACE_SECS") {
            policy.session_grace_secs = v;
        }
        policy
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let p = BookingPolicy::default();
        assert_eq!(p.cancel_cutoff_hours, 12);
        assert_eq!(p.min_lead_secs, 3600);
        assert_eq!(p.package_selection, PackageSelection::SingleActive);
        assert!(p.enforce_student_overlap);
        assert_eq!(p.cancel_cutoff(), chrono::Duration::hours(12));
    }

    #[test]
    fn env_overrides() {
        // Env vars are process-global; use names only this test touches.
        unsafe {
            std::env::set_var("CADENZA_CANCEL_CUTOFF_HOURS", "24");
            std::env::set_var("CADENZA_PACKAGE_SELECTION", "earliest_expiring");
            std::env::set_var("CADENZA_ENFORCE_STUDENT_OVERLAP", "false");
        }
        let p = BookingPolicy::from_env();
        assert_eq!(p.cancel_cutoff_hours, 24);
        assert_eq!(p.package_selection, PackageSelection::EarliestExpiring);
        assert!(!p.enforce_student_overlap);
        unsafe {
            std::env::remove_var("CADENZA_CANCEL_CUTOFF_HOURS");
            std::env::remove_var("CADENZA_PACKAGE_SELECTION");
            std::env::remove_var("CADENZA_ENFORCE_STUDENT_OVERLAP");
        }
    }
}
