use std::collections::{BTreeMap, BTreeSet};

use time::OffsetDateTime;

use crate::merge::{merge_row, MergeOutcome};
use crate::store::{ExpeditionLockouts, LockoutStore};
use crate::{
    CharacterId, ExpeditionId, KeyState, LockoutEntry, LockoutState, MergeStrategy, StoreError,
};

type CharacterKey = (CharacterId, String, String);

/// In-process [`LockoutStore`] applying the same merge and hydration rules as
/// the SQL backend. Never fails.
///
/// Hydration only sees expeditions announced through
/// [`Self::register_expedition`], the counterpart of an expedition record.
#[derive(Debug, Clone, Default)]
pub struct MemoryLockoutStore {
    characters: BTreeMap<CharacterKey, (LockoutEntry, LockoutState)>,
    expeditions: BTreeMap<(ExpeditionId, String), LockoutEntry>,
    known_expeditions: BTreeMap<ExpeditionId, String>,
    write_round_trips: u64,
}

impl MemoryLockoutStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `expedition_id` exists under `expedition_name`.
    pub fn register_expedition(
        &mut self,
        expedition_id: ExpeditionId,
        expedition_name: impl Into<String>,
    ) {
        self.known_expeditions
            .insert(expedition_id, expedition_name.into());
    }

    /// Number of write calls that reached the backing maps.
    #[must_use]
    pub fn write_round_trips(&self) -> u64 {
        self.write_round_trips
    }

    /// Every character row, ordered by key.
    #[must_use]
    pub fn character_rows(&self) -> Vec<(CharacterId, LockoutEntry, LockoutState)> {
        self.characters
            .iter()
            .map(|((character_id, _, _), (entry, state))| (*character_id, entry.clone(), *state))
            .collect()
    }

    fn upsert_row(
        &mut self,
        character_id: CharacterId,
        entry: &LockoutEntry,
        strategy: MergeStrategy,
        state: LockoutState,
    ) {
        let key = (
            character_id,
            entry.expedition_name.clone(),
            entry.event_name.clone(),
        );
        let existing = self
            .characters
            .get(&key)
            .map(|(current, current_state)| (current, *current_state));
        match merge_row(existing, entry, strategy, state) {
            MergeOutcome::Inserted(merged, merged_state)
            | MergeOutcome::Updated(merged, merged_state) => {
                self.characters.insert(key, (merged, merged_state));
            }
            MergeOutcome::Unchanged => {}
        }
    }

    fn active_where(
        &self,
        now: OffsetDateTime,
        predicate: impl Fn(&CharacterKey) -> bool,
    ) -> Vec<LockoutEntry> {
        self.characters
            .iter()
            .filter(|(key, (entry, state))| {
                predicate(key) && !state.is_pending() && !entry.is_expired(now)
            })
            .map(|(_, (entry, _))| entry.clone())
            .collect()
    }
}

impl LockoutStore for MemoryLockoutStore {
    fn get_active(
        &self,
        character_id: CharacterId,
        now: OffsetDateTime,
    ) -> Result<Vec<LockoutEntry>, StoreError> {
        Ok(self.active_where(now, |(id, _, _)| *id == character_id))
    }

    fn get_active_in(
        &self,
        character_id: CharacterId,
        expedition_name: &str,
        now: OffsetDateTime,
    ) -> Result<Vec<LockoutEntry>, StoreError> {
        Ok(self.active_where(now, |(id, name, _)| {
            *id == character_id && name == expedition_name
        }))
    }

    fn get_active_for_expeditions(
        &self,
        expedition_ids: &BTreeSet<ExpeditionId>,
    ) -> Result<ExpeditionLockouts, StoreError> {
        let mut grouped = ExpeditionLockouts::new();
        for ((expedition_id, event_name), entry) in &self.expeditions {
            if !expedition_ids.contains(expedition_id) {
                continue;
            }
            let Some(expedition_name) = self.known_expeditions.get(expedition_id) else {
                continue;
            };
            let mut entry = entry.clone();
            entry.expedition_name.clone_from(expedition_name);
            grouped
                .entry(*expedition_id)
                .or_default()
                .insert(event_name.clone(), entry);
        }
        Ok(grouped)
    }

    fn character_lockout_state(
        &self,
        character_id: CharacterId,
        expedition_name: &str,
        event_name: &str,
    ) -> Result<KeyState, StoreError> {
        let key = (
            character_id,
            expedition_name.to_string(),
            event_name.to_string(),
        );
        Ok(match self.characters.get(&key) {
            Some((entry, state)) => KeyState::stored(entry.clone(), *state),
            None => KeyState::Absent,
        })
    }

    fn upsert_character_lockouts(
        &mut self,
        character_id: CharacterId,
        entries: &[LockoutEntry],
        strategy: MergeStrategy,
        state: LockoutState,
    ) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        self.write_round_trips += 1;
        for entry in entries {
            self.upsert_row(character_id, entry, strategy, state);
        }
        Ok(())
    }

    fn upsert_members_lockout(
        &mut self,
        members: &[CharacterId],
        entry: &LockoutEntry,
    ) -> Result<(), StoreError> {
        if members.is_empty() {
            return Ok(());
        }
        self.write_round_trips += 1;
        for member in members {
            self.upsert_row(
                *member,
                entry,
                MergeStrategy::ReplaceTimer,
                LockoutState::Confirmed,
            );
        }
        Ok(())
    }

    fn upsert_expedition_lockouts(
        &mut self,
        expedition_id: ExpeditionId,
        entries: &BTreeMap<String, LockoutEntry>,
    ) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        self.write_round_trips += 1;
        for entry in entries.values() {
            let key = (expedition_id, entry.event_name.clone());
            let existing = self
                .expeditions
                .get(&key)
                .map(|current| (current, LockoutState::Confirmed));
            if let MergeOutcome::Inserted(merged, _) | MergeOutcome::Updated(merged, _) = merge_row(
                existing,
                entry,
                MergeStrategy::ReplaceTimer,
                LockoutState::Confirmed,
            ) {
                self.expeditions.insert(key, merged);
            }
        }
        Ok(())
    }

    fn delete_character_lockouts(&mut self, character_id: CharacterId) -> Result<(), StoreError> {
        if character_id.is_unset() {
            return Ok(());
        }
        self.write_round_trips += 1;
        self.characters.retain(|(id, _, _), _| *id != character_id);
        Ok(())
    }

    fn delete_character_lockouts_in(
        &mut self,
        character_id: CharacterId,
        expedition_name: &str,
    ) -> Result<(), StoreError> {
        if character_id.is_unset() || expedition_name.is_empty() {
            return Ok(());
        }
        self.write_round_trips += 1;
        self.characters
            .retain(|(id, name, _), _| !(*id == character_id && name == expedition_name));
        Ok(())
    }

    fn delete_character_lockout(
        &mut self,
        character_id: CharacterId,
        expedition_name: &str,
        event_name: &str,
    ) -> Result<(), StoreError> {
        self.delete_members_lockout(&[character_id], expedition_name, event_name)
    }

    fn delete_members_lockout(
        &mut self,
        members: &[CharacterId],
        expedition_name: &str,
        event_name: &str,
    ) -> Result<(), StoreError> {
        let members: Vec<CharacterId> = members
            .iter()
            .copied()
            .filter(|id| !id.is_unset())
            .collect();
        if members.is_empty() {
            return Ok(());
        }
        self.write_round_trips += 1;
        self.characters.retain(|(id, name, event), (_, state)| {
            !(members.contains(id)
                && name == expedition_name
                && event == event_name
                && !state.is_pending())
        });
        Ok(())
    }

    fn delete_pending_for_members(
        &mut self,
        character_ids: &[CharacterId],
    ) -> Result<(), StoreError> {
        if character_ids.is_empty() {
            return Ok(());
        }
        self.write_round_trips += 1;
        self.characters
            .retain(|(id, _, _), (_, state)| !(character_ids.contains(id) && state.is_pending()));
        Ok(())
    }

    fn delete_event_lockout(
        &mut self,
        expedition_id: ExpeditionId,
        event_name: &str,
    ) -> Result<(), StoreError> {
        self.write_round_trips += 1;
        self.expeditions
            .remove(&(expedition_id, event_name.to_string()));
        Ok(())
    }

    fn confirm_pending(
        &mut self,
        character_id: CharacterId,
        expedition_name: &str,
    ) -> Result<(), StoreError> {
        self.write_round_trips += 1;
        for ((id, name, _), (_, state)) in &mut self.characters {
            if *id == character_id && name == expedition_name {
                *state = LockoutState::Confirmed;
            }
        }
        Ok(())
    }

    fn purge_expired(&mut self, now: OffsetDateTime) -> Result<usize, StoreError> {
        self.write_round_trips += 1;
        let before = self.characters.len() + self.expeditions.len();
        self.characters.retain(|_, (entry, _)| !entry.is_expired(now));
        self.expeditions.retain(|_, entry| !entry.is_expired(now));
        Ok(before - self.characters.len() - self.expeditions.len())
    }
}
