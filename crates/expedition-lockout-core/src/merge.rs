use serde::{Deserialize, Serialize};

use crate::{LockoutEntry, LockoutState};

/// Conflict policy for an upsert that lands on an occupied key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Overwrite origin, expiry and duration with the incoming values.
    ReplaceTimer,
    /// Keep the stored timer; the write is a no-op touch.
    PreserveTimer,
}

impl MergeStrategy {
    #[must_use]
    pub fn from_merge_flag(merge_timer: bool) -> Self {
        if merge_timer {
            Self::ReplaceTimer
        } else {
            Self::PreserveTimer
        }
    }

    #[must_use]
    pub fn replaces_timer(self) -> bool {
        matches!(self, Self::ReplaceTimer)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted(LockoutEntry, LockoutState),
    Updated(LockoutEntry, LockoutState),
    Unchanged,
}

/// Decides what an upsert leaves in one slot.
///
/// A pending write never rewrites a confirmed row, and a confirmed write that
/// replaces a pending row promotes it.
#[must_use]
pub fn merge_row(
    existing: Option<(&LockoutEntry, LockoutState)>,
    incoming: &LockoutEntry,
    strategy: MergeStrategy,
    incoming_state: LockoutState,
) -> MergeOutcome {
    let Some((current, current_state)) = existing else {
        return MergeOutcome::Inserted(incoming.clone(), incoming_state);
    };

    if !strategy.replaces_timer() {
        return MergeOutcome::Unchanged;
    }

    if incoming_state.is_pending() && !current_state.is_pending() {
        return MergeOutcome::Unchanged;
    }

    let merged = LockoutEntry {
        origin_expedition_uuid: incoming.origin_expedition_uuid.clone(),
        expedition_name: current.expedition_name.clone(),
        event_name: current.event_name.clone(),
        expire_at: incoming.expire_at,
        duration: incoming.duration,
    };
    let state = if incoming_state.is_pending() && current_state.is_pending() {
        LockoutState::Pending
    } else {
        LockoutState::Confirmed
    };

    MergeOutcome::Updated(merged, state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_rfc3339_utc;

    fn entry(origin: &str, duration: u32) -> LockoutEntry {
        let now = match parse_rfc3339_utc("2026-02-07T12:00:00Z") {
            Ok(value) => value,
            Err(err) => panic!("invalid fixture timestamp: {err}"),
        };
        LockoutEntry::new(origin, "Gates", "Trial1", duration, now)
    }

    #[test]
    fn empty_slot_inserts_with_incoming_state() {
        let incoming = entry("a", 60);
        let outcome = merge_row(None, &incoming, MergeStrategy::PreserveTimer, LockoutState::Pending);
        assert_eq!(outcome, MergeOutcome::Inserted(incoming, LockoutState::Pending));
    }

    #[test]
    fn preserve_timer_keeps_existing_row() {
        let current = entry("a", 60);
        let incoming = entry("b", 600);
        let outcome = merge_row(
            Some((&current, LockoutState::Confirmed)),
            &incoming,
            MergeStrategy::PreserveTimer,
            LockoutState::Confirmed,
        );
        assert_eq!(outcome, MergeOutcome::Unchanged);
    }

    #[test]
    fn replace_timer_overwrites_timer_fields() {
        let current = entry("a", 60);
        let incoming = entry("b", 600);
        let outcome = merge_row(
            Some((&current, LockoutState::Confirmed)),
            &incoming,
            MergeStrategy::ReplaceTimer,
            LockoutState::Confirmed,
        );
        assert_eq!(outcome, MergeOutcome::Updated(incoming, LockoutState::Confirmed));
    }

    #[test]
    fn pending_write_never_touches_confirmed_row() {
        let current = entry("a", 60);
        let incoming = entry("b", 600);
        let outcome = merge_row(
            Some((&current, LockoutState::Confirmed)),
            &incoming,
            MergeStrategy::ReplaceTimer,
            LockoutState::Pending,
        );
        assert_eq!(outcome, MergeOutcome::Unchanged);
    }

    #[test]
    fn competing_reservations_are_last_writer_wins() {
        let first = entry("a", 60);
        let second = entry("b", 600);
        let outcome = merge_row(
            Some((&first, LockoutState::Pending)),
            &second,
            MergeStrategy::ReplaceTimer,
            LockoutState::Pending,
        );
        assert_eq!(outcome, MergeOutcome::Updated(second, LockoutState::Pending));
    }

    #[test]
    fn confirmed_write_promotes_pending_row() {
        let pending = entry("a", 60);
        let confirmed = entry("b", 600);
        let outcome = merge_row(
            Some((&pending, LockoutState::Pending)),
            &confirmed,
            MergeStrategy::ReplaceTimer,
            LockoutState::Confirmed,
        );
        assert_eq!(outcome, MergeOutcome::Updated(confirmed, LockoutState::Confirmed));
    }
}
