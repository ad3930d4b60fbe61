//! Archive and visibility windows.

use chrono::{DateTime, TimeDelta, Utc};

/// How long records stay in the canonical collection and in view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Records created longer ago than this are dropped.
    pub archive: TimeDelta,
    /// Completed tasks finished longer ago than this are hidden.
    pub visibility: TimeDelta,
}

impl RetentionPolicy {
    /// Default archive window in days.
    pub const DEFAULT_ARCHIVE_DAYS: i64 = 60;
    /// Default visibility window in days.
    pub const DEFAULT_VISIBILITY_DAYS: i64 = 7;

    /// Builds a policy from whole days.
    #[must_use]
    pub fn from_days(archive_days: i64, visibility_days: i64) -> Self {
        Self {
            archive: TimeDelta::try_days(archive_days).unwrap_or(TimeDelta::MAX),
            visibility: TimeDelta::try_days(visibility_days).unwrap_or(TimeDelta::MAX),
        }
    }

    /// Records created before this instant are archived.
    #[must_use]
    pub fn archive_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.archive)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Tasks completed before this instant are hidden.
    #[must_use]
    pub fn visibility_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.visibility)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::from_days(Self::DEFAULT_ARCHIVE_DAYS, Self::DEFAULT_VISIBILITY_DAYS)
    }
}
