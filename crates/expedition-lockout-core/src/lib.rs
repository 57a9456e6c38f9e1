//! Expedition lockout model, reservation protocol and registry façade.
//!
//! Persistence is abstracted behind [`LockoutStore`]; [`MemoryLockoutStore`]
//! is the reference backend and the SQLite backend lives in
//! `expedition-lockout-store-sqlite`.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime, PrimitiveDateTime, UtcOffset};

mod clock;
mod memory;
mod merge;
mod registry;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use memory::MemoryLockoutStore;
pub use merge::{merge_row, MergeOutcome, MergeStrategy};
pub use registry::{FailurePolicy, LockoutRegistry, RegistryConfig, Reservation};
pub use store::{ExpeditionLockouts, ExpeditionRecord, ExpeditionRecords, LockoutStore};

/// Event name reserved for the expedition-wide replay timer.
pub const REPLAY_TIMER_NAME: &str = "Replay Timer";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StoreError {
    #[error("backing store failure: {0}")]
    Backend(String),
    #[error("stored lockout is corrupt: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LockoutError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
#[serde(transparent)]
pub struct CharacterId(pub u32);

impl CharacterId {
    /// Sentinel for "no character"; deletes targeting it are skipped.
    pub const UNSET: Self = Self(0);

    #[must_use]
    pub fn is_unset(self) -> bool {
        self == Self::UNSET
    }
}

impl Display for CharacterId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
#[serde(transparent)]
pub struct ExpeditionId(pub u32);

impl ExpeditionId {
    pub const UNSET: Self = Self(0);

    #[must_use]
    pub fn is_unset(self) -> bool {
        self == Self::UNSET
    }
}

impl Display for ExpeditionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Storage state of a lockout row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LockoutState {
    Pending,
    Confirmed,
}

impl LockoutState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
        }
    }

    #[must_use]
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Pending)
    }

    #[must_use]
    pub fn from_pending_flag(pending: bool) -> Self {
        if pending {
            Self::Pending
        } else {
            Self::Confirmed
        }
    }
}

/// What occupies one `(character, expedition_name, event_name)` slot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", content = "lockout", rename_all = "snake_case")]
pub enum KeyState {
    #[default]
    Absent,
    Pending(LockoutEntry),
    Confirmed(LockoutEntry),
}

impl KeyState {
    #[must_use]
    pub fn stored(entry: LockoutEntry, state: LockoutState) -> Self {
        match state {
            LockoutState::Pending => Self::Pending(entry),
            LockoutState::Confirmed => Self::Confirmed(entry),
        }
    }

    #[must_use]
    pub fn entry(&self) -> Option<&LockoutEntry> {
        match self {
            Self::Absent => None,
            Self::Pending(entry) | Self::Confirmed(entry) => Some(entry),
        }
    }

    #[must_use]
    pub fn state(&self) -> Option<LockoutState> {
        match self {
            Self::Absent => None,
            Self::Pending(_) => Some(LockoutState::Pending),
            Self::Confirmed(_) => Some(LockoutState::Confirmed),
        }
    }

    /// True only for a confirmed entry that has not yet expired.
    #[must_use]
    pub fn is_enforced(&self, now: OffsetDateTime) -> bool {
        match self {
            Self::Confirmed(entry) => !entry.is_expired(now),
            Self::Absent | Self::Pending(_) => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockoutEntry {
    pub origin_expedition_uuid: String,
    pub expedition_name: String,
    pub event_name: String,
    pub expire_at: OffsetDateTime,
    /// Original duration in seconds.
    pub duration: u32,
}

impl LockoutEntry {
    /// Expiry is `now` truncated to the second plus `duration`, clamped to the
    /// latest representable second.
    #[must_use]
    pub fn new(
        origin_expedition_uuid: impl Into<String>,
        expedition_name: impl Into<String>,
        event_name: impl Into<String>,
        duration: u32,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            origin_expedition_uuid: origin_expedition_uuid.into(),
            expedition_name: expedition_name.into(),
            event_name: event_name.into(),
            expire_at: expiry_after(now, duration),
            duration,
        }
    }

    #[must_use]
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now >= self.expire_at
    }

    #[must_use]
    pub fn seconds_remaining(&self, now: OffsetDateTime) -> u64 {
        let remaining = (self.expire_at - now).whole_seconds();
        u64::try_from(remaining).unwrap_or(0)
    }

    /// Remaining time split into `(days, hours, minutes)`.
    #[must_use]
    pub fn remaining_parts(&self, now: OffsetDateTime) -> (u64, u64, u64) {
        let seconds = self.seconds_remaining(now);
        let days = seconds / 86_400;
        let hours = (seconds % 86_400) / 3_600;
        let minutes = (seconds % 3_600) / 60;
        (days, hours, minutes)
    }

    #[must_use]
    pub fn is_replay_timer(&self) -> bool {
        self.event_name == REPLAY_TIMER_NAME
    }

    /// Unix-seconds form used by persistent backends.
    #[must_use]
    pub fn expire_at_unix(&self) -> i64 {
        self.expire_at.unix_timestamp()
    }

    /// Validates the fields every backend relies on for keying.
    ///
    /// # Errors
    /// Returns [`LockoutError::Validation`] when the expedition or event name
    /// is blank.
    pub fn validate(&self) -> Result<(), LockoutError> {
        if self.expedition_name.trim().is_empty() {
            return Err(LockoutError::Validation(
                "expedition_name MUST be provided".to_string(),
            ));
        }
        if self.event_name.trim().is_empty() {
            return Err(LockoutError::Validation(
                "event_name MUST be provided".to_string(),
            ));
        }
        Ok(())
    }
}

/// Converts stored unix seconds back into a UTC timestamp.
///
/// # Errors
/// Returns [`StoreError::Corrupt`] when the value is outside the supported
/// date range.
pub fn from_unix_seconds(value: i64) -> Result<OffsetDateTime, StoreError> {
    OffsetDateTime::from_unix_timestamp(value)
        .map_err(|err| StoreError::Corrupt(format!("invalid unix timestamp {value}: {err}")))
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`LockoutError::Validation`] when parsing fails or the timestamp is
/// not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, LockoutError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| LockoutError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(LockoutError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`LockoutError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, LockoutError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            LockoutError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

// Persistent backends keep whole seconds; entries built in memory must match.
fn truncate_to_second(value: OffsetDateTime) -> OffsetDateTime {
    value.replace_nanosecond(0).unwrap_or(value)
}

fn expiry_after(now: OffsetDateTime, duration: u32) -> OffsetDateTime {
    truncate_to_second(now)
        .checked_add(Duration::seconds(i64::from(duration)))
        .unwrap_or_else(|| truncate_to_second(PrimitiveDateTime::MAX.assume_utc()))
}
