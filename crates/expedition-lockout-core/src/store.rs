use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    CharacterId, ExpeditionId, KeyState, LockoutEntry, LockoutState, MergeStrategy, StoreError,
};

/// Expedition-scoped lockouts keyed by expedition id, then event name.
pub type ExpeditionLockouts = BTreeMap<ExpeditionId, BTreeMap<String, LockoutEntry>>;

/// Persistence contract for character- and expedition-scoped lockouts.
///
/// Character reads that feed eligibility (`get_active`, `get_active_in`)
/// exclude pending and expired rows. Writes with empty input must return
/// without touching the backend.
pub trait LockoutStore {
    fn get_active(
        &self,
        character_id: CharacterId,
        now: OffsetDateTime,
    ) -> Result<Vec<LockoutEntry>, StoreError>;

    fn get_active_in(
        &self,
        character_id: CharacterId,
        expedition_name: &str,
        now: OffsetDateTime,
    ) -> Result<Vec<LockoutEntry>, StoreError>;

    /// Every stored expedition-scoped lockout for the requested ids, expired
    /// ones included; expiry is left to the caller.
    ///
    /// Only expeditions the backend holds a record for are returned, and each
    /// entry carries that record's expedition name. Ids without a record or
    /// without stored lockouts produce no map entry.
    fn get_active_for_expeditions(
        &self,
        expedition_ids: &BTreeSet<ExpeditionId>,
    ) -> Result<ExpeditionLockouts, StoreError>;

    /// Raw slot contents, regardless of expiry.
    fn character_lockout_state(
        &self,
        character_id: CharacterId,
        expedition_name: &str,
        event_name: &str,
    ) -> Result<KeyState, StoreError>;

    fn upsert_character_lockouts(
        &mut self,
        character_id: CharacterId,
        entries: &[LockoutEntry],
        strategy: MergeStrategy,
        state: LockoutState,
    ) -> Result<(), StoreError>;

    /// Writes one confirmed lockout for every member, replacing timers.
    fn upsert_members_lockout(
        &mut self,
        members: &[CharacterId],
        entry: &LockoutEntry,
    ) -> Result<(), StoreError>;

    fn upsert_expedition_lockouts(
        &mut self,
        expedition_id: ExpeditionId,
        entries: &BTreeMap<String, LockoutEntry>,
    ) -> Result<(), StoreError>;

    fn upsert_expedition_lockout(
        &mut self,
        expedition_id: ExpeditionId,
        entry: &LockoutEntry,
    ) -> Result<(), StoreError> {
        let mut entries = BTreeMap::new();
        entries.insert(entry.event_name.clone(), entry.clone());
        self.upsert_expedition_lockouts(expedition_id, &entries)
    }

    /// Removes every row for the character, pending included.
    fn delete_character_lockouts(&mut self, character_id: CharacterId) -> Result<(), StoreError>;

    /// Removes every row for the character under one expedition name.
    fn delete_character_lockouts_in(
        &mut self,
        character_id: CharacterId,
        expedition_name: &str,
    ) -> Result<(), StoreError>;

    /// Removes one confirmed row.
    fn delete_character_lockout(
        &mut self,
        character_id: CharacterId,
        expedition_name: &str,
        event_name: &str,
    ) -> Result<(), StoreError>;

    /// Removes one confirmed row for each member.
    fn delete_members_lockout(
        &mut self,
        members: &[CharacterId],
        expedition_name: &str,
        event_name: &str,
    ) -> Result<(), StoreError>;

    fn delete_pending(&mut self, character_id: CharacterId) -> Result<(), StoreError> {
        self.delete_pending_for_members(&[character_id])
    }

    fn delete_pending_for_members(&mut self, character_ids: &[CharacterId])
        -> Result<(), StoreError>;

    fn delete_event_lockout(
        &mut self,
        expedition_id: ExpeditionId,
        event_name: &str,
    ) -> Result<(), StoreError>;

    /// Flips the character's pending rows for one expedition name to
    /// confirmed, leaving their expiry as stamped.
    fn confirm_pending(
        &mut self,
        character_id: CharacterId,
        expedition_name: &str,
    ) -> Result<(), StoreError>;

    /// Deletes rows in both tables whose expiry is at or before `now`.
    fn purge_expired(&mut self, now: OffsetDateTime) -> Result<usize, StoreError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExpeditionRecord {
    pub id: ExpeditionId,
    pub uuid: String,
    pub expedition_name: String,
    pub leader_id: CharacterId,
    pub min_players: u32,
    pub max_players: u32,
    pub add_replay_on_join: bool,
    pub is_locked: bool,
    pub members: Vec<CharacterId>,
}

/// Expedition metadata and membership records consumed by the registry's
/// callers.
pub trait ExpeditionRecords {
    fn create_expedition(
        &mut self,
        uuid: &str,
        expedition_name: &str,
        leader_id: CharacterId,
        min_players: u32,
        max_players: u32,
    ) -> Result<ExpeditionId, StoreError>;

    fn load_expedition(
        &self,
        expedition_id: ExpeditionId,
    ) -> Result<Option<ExpeditionRecord>, StoreError>;

    fn load_all_expeditions(&self) -> Result<Vec<ExpeditionRecord>, StoreError>;

    fn add_member(
        &mut self,
        expedition_id: ExpeditionId,
        character_id: CharacterId,
    ) -> Result<(), StoreError>;

    fn add_members(
        &mut self,
        expedition_id: ExpeditionId,
        members: &[CharacterId],
    ) -> Result<(), StoreError>;

    fn remove_member(
        &mut self,
        expedition_id: ExpeditionId,
        character_id: CharacterId,
    ) -> Result<(), StoreError>;

    fn remove_all_members(&mut self, expedition_id: ExpeditionId) -> Result<(), StoreError>;

    fn expedition_for_character(
        &self,
        character_id: CharacterId,
    ) -> Result<Option<ExpeditionId>, StoreError>;

    fn update_leader(
        &mut self,
        expedition_id: ExpeditionId,
        leader_id: CharacterId,
    ) -> Result<(), StoreError>;

    fn update_lock_state(
        &mut self,
        expedition_id: ExpeditionId,
        is_locked: bool,
    ) -> Result<(), StoreError>;

    fn update_replay_on_join(
        &mut self,
        expedition_id: ExpeditionId,
        add_on_join: bool,
    ) -> Result<(), StoreError>;
}
