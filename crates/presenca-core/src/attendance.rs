//! Idempotent attendance recording.
//!
//! Check-in ids are deterministic functions of the logical event, so a
//! repeated frame, a restart, or a second kiosk replaying the same event can
//! never grow the record count — provided the store's create-if-absent is
//! atomic. The un-scheduled variant additionally suppresses writes when any
//! record for the subject exists inside a short lookback window; the
//! schedule-bound variant is keyed per subject per class per calendar day by
//! construction.
//!
//! Atomicity of check-then-create is delegated to the store. Two kiosks
//! sharing one database are covered; kiosks writing to different databases
//! retain a documented duplicate race.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Lookback for the recent-duplicate query in the un-scheduled variant.
pub const DEFAULT_RECENT_WINDOW_SECS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckInSource {
    Face,
    Manual,
}

impl CheckInSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckInSource::Face => "face",
            CheckInSource::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "face" => Some(CheckInSource::Face),
            "manual" => Some(CheckInSource::Manual),
            _ => None,
        }
    }
}

/// One stored attendance event. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckInRecord {
    pub id: String,
    pub subject_id: String,
    pub class_id: Option<String>,
    pub source: CheckInSource,
    pub created_at: DateTime<Utc>,
}

/// A scheduled class, read-only from the recorder's perspective.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassWindow {
    pub id: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

/// Why a check-in call did not write a new record. A duplicate is a normal
/// outcome, never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    RecentCheckin,
    AlreadyRecorded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckInOutcome {
    pub record_id: String,
    pub created: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<SkipReason>,
    /// Advisory only — `Some(false)` flags a late or out-of-window check-in
    /// that was still recorded. `None` in the un-scheduled variant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_ok: Option<bool>,
}

/// Permitted check-in window around a class start:
/// `[start − early, start + late]`, and never past the class end.
#[derive(Debug, Clone, Copy)]
pub struct WindowPolicy {
    pub early: Duration,
    pub late: Duration,
}

impl Default for WindowPolicy {
    fn default() -> Self {
        Self {
            early: Duration::minutes(10),
            late: Duration::minutes(15),
        }
    }
}

impl WindowPolicy {
    pub fn allows(&self, window: &ClassWindow, at: DateTime<Utc>) -> bool {
        at >= window.starts_at - self.early
            && at <= window.starts_at + self.late
            && at <= window.ends_at
    }
}

/// `{subject}_{yyyymmdd}_{hhmmss}` — unique per subject per second (UTC).
pub fn check_in_id(subject_id: &str, at: DateTime<Utc>) -> String {
    format!("{}_{}", subject_id, at.format("%Y%m%d_%H%M%S"))
}

/// `{class}_{subject}_{yyyymmdd}` — at most one record per subject per class
/// per calendar day (UTC) by construction of the key.
pub fn class_check_in_id(class_id: &str, subject_id: &str, at: DateTime<Utc>) -> String {
    format!("{}_{}_{}", class_id, subject_id, at.format("%Y%m%d"))
}

/// Persistence seam for attendance records.
#[allow(async_fn_in_trait)]
pub trait AttendanceStore {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Most recent record for `subject_id` created at or after `since`.
    async fn find_recent(
        &self,
        subject_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<CheckInRecord>, Self::Error>;

    /// Write `record` unless a record with the same id already exists.
    /// Returns whether a new record was written. The check-then-create must
    /// be atomic within one store.
    async fn create_if_absent(&self, record: &CheckInRecord) -> Result<bool, Self::Error>;

    async fn class_window(&self, class_id: &str) -> Result<Option<ClassWindow>, Self::Error>;
}

/// Duplicate-suppressing write path over an [`AttendanceStore`].
pub struct AttendanceRecorder<S> {
    store: S,
    recent_window: Duration,
    window_policy: WindowPolicy,
}

impl<S: AttendanceStore> AttendanceRecorder<S> {
    pub fn new(store: S) -> Self {
        Self::with_policies(
            store,
            Duration::seconds(DEFAULT_RECENT_WINDOW_SECS),
            WindowPolicy::default(),
        )
    }

    pub fn with_policies(store: S, recent_window: Duration, window_policy: WindowPolicy) -> Self {
        Self {
            store,
            recent_window,
            window_policy,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Un-scheduled check-in: suppressed when any record for the subject
    /// exists within the recent window, otherwise written under a
    /// second-resolution key.
    pub async fn check_in(
        &self,
        subject_id: &str,
        source: CheckInSource,
        at: DateTime<Utc>,
    ) -> Result<CheckInOutcome, S::Error> {
        if let Some(existing) = self
            .store
            .find_recent(subject_id, at - self.recent_window)
            .await?
        {
            tracing::debug!(subject_id, existing = %existing.id, "recent check-in exists; not recording");
            return Ok(CheckInOutcome {
                record_id: existing.id,
                created: false,
                reason: Some(SkipReason::RecentCheckin),
                window_ok: None,
            });
        }

        let record = CheckInRecord {
            id: check_in_id(subject_id, at),
            subject_id: subject_id.to_string(),
            class_id: None,
            source,
            created_at: at,
        };
        let created = self.store.create_if_absent(&record).await?;
        if created {
            tracing::info!(subject_id, id = %record.id, source = source.as_str(), "check-in recorded");
        }
        Ok(CheckInOutcome {
            record_id: record.id,
            created,
            // A key collision means another write for the same subject and
            // second already landed — the same logical event.
            reason: (!created).then_some(SkipReason::RecentCheckin),
            window_ok: None,
        })
    }

    /// Schedule-bound check-in: the day-scoped key makes the write idempotent
    /// on its own. The window policy is advisory — the record is written
    /// regardless and `window_ok` lets the caller flag late arrivals. An
    /// unknown class reads as out-of-window.
    pub async fn check_in_for_class(
        &self,
        class_id: &str,
        subject_id: &str,
        source: CheckInSource,
        at: DateTime<Utc>,
    ) -> Result<CheckInOutcome, S::Error> {
        let window_ok = match self.store.class_window(class_id).await? {
            Some(window) => self.window_policy.allows(&window, at),
            None => false,
        };

        let record = CheckInRecord {
            id: class_check_in_id(class_id, subject_id, at),
            subject_id: subject_id.to_string(),
            class_id: Some(class_id.to_string()),
            source,
            created_at: at,
        };
        let created = self.store.create_if_absent(&record).await?;
        match (created, window_ok) {
            (true, false) => {
                tracing::info!(subject_id, class_id, id = %record.id, "out-of-window check-in recorded")
            }
            (true, true) => {
                tracing::info!(subject_id, class_id, id = %record.id, source = source.as_str(), "check-in recorded")
            }
            (false, _) => {
                tracing::debug!(subject_id, class_id, id = %record.id, "already recorded for this class today")
            }
        }
        Ok(CheckInOutcome {
            record_id: record.id,
            created,
            reason: (!created).then_some(SkipReason::AlreadyRecorded),
            window_ok: Some(window_ok),
        })
    }
}
