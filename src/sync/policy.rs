//! Conflict resolution for progress updates.
//!
//! Live updates follow *arrival-time last-write-wins*: an update arriving within the recency
//! window of the stored record is a possible concurrent write and is applied only when its
//! arrival time is not older than the stored `last_updated_at` (ties go to the incoming
//! update). Outside the window the incoming update always wins. Only a single scalar position
//! is merged, so wall-clock proximity is enough; no vector clocks.
//!
//! Offline items carry their own capture time and must be strictly newer than the stored record.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::domain::ProgressRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// No record existed yet.
    Created,
    /// Plain last-write-wins outside the recency window.
    Overwritten,
    /// Inside the window and at least as new as the stored record.
    ConcurrentAccepted,
    /// Inside the window but older than the stored record.
    ConcurrentDiscarded,
    /// Offline item not newer than the stored record.
    Stale,
}

impl Resolution {
    pub fn is_applied(self) -> bool {
        !matches!(self, Resolution::ConcurrentDiscarded | Resolution::Stale)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Resolution::Created => "created",
            Resolution::Overwritten => "overwritten",
            Resolution::ConcurrentAccepted => "concurrent-accepted",
            Resolution::ConcurrentDiscarded => "concurrent-discarded",
            Resolution::Stale => "stale",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RecencyPolicy {
    window: TimeDelta,
}

impl RecencyPolicy {
    pub fn new(window: Duration) -> Self {
        Self {
            window: TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX),
        }
    }

    pub fn resolve_live(&self, existing: Option<&ProgressRecord>, now: DateTime<Utc>) -> Resolution {
        let Some(existing) = existing else {
            return Resolution::Created;
        };
        let gap = now.signed_duration_since(existing.last_updated_at);
        if gap.abs() >= self.window {
            return Resolution::Overwritten;
        }
        if now >= existing.last_updated_at {
            Resolution::ConcurrentAccepted
        } else {
            Resolution::ConcurrentDiscarded
        }
    }

    pub fn resolve_offline(existing: Option<&ProgressRecord>, captured_at: DateTime<Utc>) -> Resolution {
        match existing {
            None => Resolution::Created,
            Some(existing) if captured_at > existing.last_updated_at => Resolution::Overwritten,
            Some(_) => Resolution::Stale,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::UserId;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 4, 1, 10, 0, 0).unwrap()
    }

    fn stored_at(at: DateTime<Utc>) -> ProgressRecord {
        ProgressRecord {
            user_id: UserId::parse("u1").unwrap(),
            book_id: "b1".into(),
            chapter_id: "c1".into(),
            progress: 0.5,
            last_updated_at: at,
        }
    }

    fn policy() -> RecencyPolicy {
        RecencyPolicy::new(Duration::from_secs(5))
    }

    #[test]
    fn no_record_is_created() {
        assert_eq!(policy().resolve_live(None, now()), Resolution::Created);
    }

    #[test]
    fn old_record_is_overwritten() {
        let existing = stored_at(now() - TimeDelta::seconds(10));
        assert_eq!(
            policy().resolve_live(Some(&existing), now()),
            Resolution::Overwritten
        );
    }

    #[test]
    fn window_boundary_counts_as_outside() {
        let existing = stored_at(now() - TimeDelta::seconds(5));
        assert_eq!(
            policy().resolve_live(Some(&existing), now()),
            Resolution::Overwritten
        );
    }

    #[test]
    fn recent_record_accepts_newer_arrival() {
        let existing = stored_at(now() - TimeDelta::seconds(2));
        let resolution = policy().resolve_live(Some(&existing), now());
        assert_eq!(resolution, Resolution::ConcurrentAccepted);
        assert!(resolution.is_applied());
    }

    #[test]
    fn tie_goes_to_incoming_update() {
        let existing = stored_at(now());
        assert_eq!(
            policy().resolve_live(Some(&existing), now()),
            Resolution::ConcurrentAccepted
        );
    }

    #[test]
    fn record_from_the_near_future_discards_arrival() {
        let existing = stored_at(now() + TimeDelta::seconds(2));
        let resolution = policy().resolve_live(Some(&existing), now());
        assert_eq!(resolution, Resolution::ConcurrentDiscarded);
        assert!(!resolution.is_applied());
    }

    #[test]
    fn offline_item_must_be_strictly_newer() {
        let existing = stored_at(now());
        assert_eq!(RecencyPolicy::resolve_offline(None, now()), Resolution::Created);
        assert_eq!(
            RecencyPolicy::resolve_offline(Some(&existing), now() + TimeDelta::seconds(1)),
            Resolution::Overwritten
        );
        assert_eq!(
            RecencyPolicy::resolve_offline(Some(&existing), now()),
            Resolution::Stale
        );
    }
}
