use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::clock::{Clock, SystemClock};
use crate::store::{ExpeditionLockouts, LockoutStore};
use crate::{
    CharacterId, ExpeditionId, KeyState, LockoutEntry, LockoutError, LockoutState,
    MergeStrategy, StoreError,
};

/// How the registry reacts when the backing store fails.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Reads degrade to "no lockout", writes are logged and skipped.
    #[default]
    Open,
    /// Store failures surface as [`LockoutError::Store`]; eligibility checks
    /// report the character as locked out.
    Closed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RegistryConfig {
    pub failure_policy: FailurePolicy,
}

/// Pending lockouts held for an expedition-creation attempt.
///
/// Only [`LockoutRegistry::confirm`] and [`LockoutRegistry::discard`] resolve
/// it. Dropping it unresolved leaves the pending rows orphaned.
#[must_use = "a reservation must be confirmed or discarded"]
#[derive(Debug)]
pub struct Reservation {
    expedition_name: String,
    members: Vec<CharacterId>,
    resolved: bool,
}

impl Reservation {
    #[must_use]
    pub fn expedition_name(&self) -> &str {
        &self.expedition_name
    }

    #[must_use]
    pub fn members(&self) -> &[CharacterId] {
        &self.members
    }

    /// Releases the handle without resolving it. The pending rows stay in the
    /// store for a later `confirm_pending` or `delete_pending_for_members`.
    #[must_use]
    pub fn into_parts(mut self) -> (String, Vec<CharacterId>) {
        self.resolved = true;
        (
            std::mem::take(&mut self.expedition_name),
            std::mem::take(&mut self.members),
        )
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.resolved {
            tracing::warn!(
                expedition_name = %self.expedition_name,
                members = self.members.len(),
                "reservation dropped unresolved; pending lockouts left behind"
            );
        }
    }
}

/// Entry point for expedition logic deciding join eligibility and recording
/// lockouts.
#[derive(Debug)]
pub struct LockoutRegistry<S, C = SystemClock> {
    store: S,
    clock: C,
    config: RegistryConfig,
}

impl<S: LockoutStore> LockoutRegistry<S> {
    pub fn new(store: S) -> Self {
        Self::with_clock(store, SystemClock, RegistryConfig::default())
    }
}

impl<S: LockoutStore, C: Clock> LockoutRegistry<S, C> {
    pub fn with_clock(store: S, clock: C, config: RegistryConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    /// Active lockouts for a character keyed by event name.
    ///
    /// The same event name under two expedition names collapses to the entry
    /// that expires last; use [`Self::get_character_lockouts_in`] for an exact
    /// per-expedition view.
    ///
    /// # Errors
    /// Returns [`LockoutError::Store`] only under [`FailurePolicy::Closed`].
    pub fn get_character_lockouts(
        &self,
        character_id: CharacterId,
    ) -> Result<BTreeMap<String, LockoutEntry>, LockoutError> {
        let entries = self.settle_read(
            "get_character_lockouts",
            self.store.get_active(character_id, self.now()),
        )?;

        let mut by_event: BTreeMap<String, LockoutEntry> = BTreeMap::new();
        for entry in entries {
            match by_event.get(&entry.event_name) {
                Some(current) if current.expire_at >= entry.expire_at => {}
                _ => {
                    by_event.insert(entry.event_name.clone(), entry);
                }
            }
        }
        Ok(by_event)
    }

    /// Active lockouts for a character under one expedition name.
    ///
    /// # Errors
    /// Returns [`LockoutError::Store`] only under [`FailurePolicy::Closed`].
    pub fn get_character_lockouts_in(
        &self,
        character_id: CharacterId,
        expedition_name: &str,
    ) -> Result<BTreeMap<String, LockoutEntry>, LockoutError> {
        let entries = self.settle_read(
            "get_character_lockouts_in",
            self.store
                .get_active_in(character_id, expedition_name, self.now()),
        )?;
        Ok(entries
            .into_iter()
            .map(|entry| (entry.event_name.clone(), entry))
            .collect())
    }

    /// Startup hydration of expedition-scoped lockouts.
    ///
    /// Expired entries are returned as stored; callers decide what to do
    /// with them.
    ///
    /// # Errors
    /// Returns [`LockoutError::Store`] only under [`FailurePolicy::Closed`].
    pub fn hydrate_all(
        &self,
        expedition_ids: &BTreeSet<ExpeditionId>,
    ) -> Result<ExpeditionLockouts, LockoutError> {
        self.settle_read(
            "hydrate_all",
            self.store.get_active_for_expeditions(expedition_ids),
        )
    }

    /// The eligibility predicate: a confirmed, unexpired entry at the key.
    pub fn is_locked_out(
        &self,
        character_id: CharacterId,
        expedition_name: &str,
        event_name: &str,
    ) -> bool {
        match self
            .store
            .character_lockout_state(character_id, expedition_name, event_name)
        {
            Ok(state) => state.is_enforced(self.now()),
            Err(err) => {
                let locked = self.config.failure_policy == FailurePolicy::Closed;
                tracing::warn!(
                    character_id = %character_id,
                    expedition_name,
                    event_name,
                    error = %err,
                    locked,
                    "lockout check failed against store"
                );
                locked
            }
        }
    }

    /// Raw slot contents, pending included.
    ///
    /// # Errors
    /// Returns [`LockoutError::Store`] only under [`FailurePolicy::Closed`].
    pub fn lockout_state(
        &self,
        character_id: CharacterId,
        expedition_name: &str,
        event_name: &str,
    ) -> Result<KeyState, LockoutError> {
        self.settle_read(
            "lockout_state",
            self.store
                .character_lockout_state(character_id, expedition_name, event_name),
        )
    }

    /// Records an event lockout on the expedition and on every member.
    ///
    /// The two writes are independent; if one fails the other still lands.
    ///
    /// # Errors
    /// Returns [`LockoutError::Validation`] for an invalid lockout and
    /// [`LockoutError::Store`] under [`FailurePolicy::Closed`].
    pub fn apply_lockout_on_event(
        &mut self,
        expedition_id: ExpeditionId,
        members: &[CharacterId],
        lockout: &LockoutEntry,
    ) -> Result<(), LockoutError> {
        lockout.validate()?;
        tracing::debug!(
            expedition_id = %expedition_id,
            expedition_name = %lockout.expedition_name,
            event_name = %lockout.event_name,
            expire_at = lockout.expire_at_unix(),
            members = members.len(),
            "applying event lockout"
        );

        let expedition_result = self
            .store
            .upsert_expedition_lockout(expedition_id, lockout);
        let members_result = self.store.upsert_members_lockout(members, lockout);

        self.settle_write("apply_lockout_on_event.expedition", expedition_result)?;
        self.settle_write("apply_lockout_on_event.members", members_result)
    }

    /// # Errors
    /// Returns [`LockoutError::Validation`] when a lockout is invalid or is
    /// keyed under a name other than its event name, and
    /// [`LockoutError::Store`] under [`FailurePolicy::Closed`].
    pub fn add_expedition_lockouts(
        &mut self,
        expedition_id: ExpeditionId,
        lockouts: &BTreeMap<String, LockoutEntry>,
    ) -> Result<(), LockoutError> {
        for (event_name, lockout) in lockouts {
            lockout.validate()?;
            if *event_name != lockout.event_name {
                return Err(LockoutError::Validation(format!(
                    "lockout {}:{} is keyed as {event_name}",
                    lockout.expedition_name, lockout.event_name
                )));
            }
        }
        let result = self
            .store
            .upsert_expedition_lockouts(expedition_id, lockouts);
        self.settle_write("add_expedition_lockouts", result)
    }

    /// # Errors
    /// Returns [`LockoutError::Store`] only under [`FailurePolicy::Closed`].
    pub fn remove_character_lockouts(
        &mut self,
        character_id: CharacterId,
        expedition_name: Option<&str>,
    ) -> Result<(), LockoutError> {
        let result = match expedition_name {
            Some(name) => self.store.delete_character_lockouts_in(character_id, name),
            None => self.store.delete_character_lockouts(character_id),
        };
        self.settle_write("remove_character_lockouts", result)
    }

    /// # Errors
    /// Returns [`LockoutError::Store`] only under [`FailurePolicy::Closed`].
    pub fn remove_character_lockout(
        &mut self,
        character_id: CharacterId,
        expedition_name: &str,
        event_name: &str,
    ) -> Result<(), LockoutError> {
        let result = self
            .store
            .delete_character_lockout(character_id, expedition_name, event_name);
        self.settle_write("remove_character_lockout", result)
    }

    /// # Errors
    /// Returns [`LockoutError::Store`] only under [`FailurePolicy::Closed`].
    pub fn remove_members_lockout(
        &mut self,
        members: &[CharacterId],
        expedition_name: &str,
        event_name: &str,
    ) -> Result<(), LockoutError> {
        let result = self
            .store
            .delete_members_lockout(members, expedition_name, event_name);
        self.settle_write("remove_members_lockout", result)
    }

    /// # Errors
    /// Returns [`LockoutError::Store`] only under [`FailurePolicy::Closed`].
    pub fn remove_event_lockout(
        &mut self,
        expedition_id: ExpeditionId,
        event_name: &str,
    ) -> Result<(), LockoutError> {
        let result = self.store.delete_event_lockout(expedition_id, event_name);
        self.settle_write("remove_event_lockout", result)
    }

    /// # Errors
    /// Returns [`LockoutError::Store`] only under [`FailurePolicy::Closed`].
    pub fn purge_expired(&mut self) -> Result<usize, LockoutError> {
        let now = self.now();
        let result = self.store.purge_expired(now);
        self.settle_read("purge_expired", result)
    }

    /// Writes pending lockouts for every member ahead of an expedition
    /// creation attempt.
    ///
    /// Competing reservations on the same key are last-writer-wins. A
    /// pending write never alters a confirmed lockout already in place.
    ///
    /// # Errors
    /// Returns [`LockoutError::Validation`] when a lockout is invalid or names
    /// a different expedition, and [`LockoutError::Store`] under
    /// [`FailurePolicy::Closed`] (after discarding what was written).
    pub fn reserve(
        &mut self,
        expedition_name: &str,
        members: &[CharacterId],
        lockouts: &[LockoutEntry],
    ) -> Result<Reservation, LockoutError> {
        for lockout in lockouts {
            lockout.validate()?;
            if lockout.expedition_name != expedition_name {
                return Err(LockoutError::Validation(format!(
                    "lockout {}:{} does not belong to expedition {expedition_name}",
                    lockout.expedition_name, lockout.event_name
                )));
            }
        }

        tracing::debug!(
            expedition_name,
            members = members.len(),
            lockouts = lockouts.len(),
            "reserving pending lockouts"
        );

        for (written, member) in members.iter().enumerate() {
            let result = self.store.upsert_character_lockouts(
                *member,
                lockouts,
                MergeStrategy::ReplaceTimer,
                LockoutState::Pending,
            );
            if let Err(err) = self.settle_write("reserve", result) {
                let rollback = self
                    .store
                    .delete_pending_for_members(&members[..=written]);
                if let Err(rollback_err) = rollback {
                    tracing::warn!(
                        expedition_name,
                        error = %rollback_err,
                        "failed to discard partial reservation"
                    );
                }
                return Err(err);
            }
        }

        Ok(Reservation {
            expedition_name: expedition_name.to_string(),
            members: members.to_vec(),
            resolved: false,
        })
    }

    /// Promotes the reservation's pending rows to enforced lockouts in place.
    ///
    /// # Errors
    /// Returns [`LockoutError::Store`] only under [`FailurePolicy::Closed`].
    pub fn confirm(&mut self, mut reservation: Reservation) -> Result<(), LockoutError> {
        reservation.resolved = true;
        self.confirm_members(&reservation.expedition_name, &reservation.members)
    }

    /// Removes every pending row held by the reservation's members.
    ///
    /// # Errors
    /// Returns [`LockoutError::Store`] only under [`FailurePolicy::Closed`].
    pub fn discard(&mut self, mut reservation: Reservation) -> Result<(), LockoutError> {
        reservation.resolved = true;
        self.discard_members(&reservation.members)
    }

    /// Promotes pending rows of a released reservation (see
    /// [`Reservation::into_parts`]).
    ///
    /// # Errors
    /// Returns [`LockoutError::Store`] only under [`FailurePolicy::Closed`].
    pub fn confirm_members(
        &mut self,
        expedition_name: &str,
        members: &[CharacterId],
    ) -> Result<(), LockoutError> {
        tracing::debug!(
            expedition_name,
            members = members.len(),
            "confirming pending lockouts"
        );

        let mut first_error = None;
        for member in members {
            let result = self.store.confirm_pending(*member, expedition_name);
            if let Err(err) = self.settle_write("confirm", result) {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Removes every pending row held by `members`.
    ///
    /// # Errors
    /// Returns [`LockoutError::Store`] only under [`FailurePolicy::Closed`].
    pub fn discard_members(&mut self, members: &[CharacterId]) -> Result<(), LockoutError> {
        tracing::debug!(members = members.len(), "discarding pending lockouts");
        let result = self.store.delete_pending_for_members(members);
        self.settle_write("discard", result)
    }

    fn settle_read<T: Default>(
        &self,
        operation: &'static str,
        result: Result<T, StoreError>,
    ) -> Result<T, LockoutError> {
        match result {
            Ok(value) => Ok(value),
            Err(err) => match self.config.failure_policy {
                FailurePolicy::Open => {
                    tracing::warn!(operation, error = %err, "store read failed; treating as empty");
                    Ok(T::default())
                }
                FailurePolicy::Closed => Err(err.into()),
            },
        }
    }

    fn settle_write(
        &self,
        operation: &'static str,
        result: Result<(), StoreError>,
    ) -> Result<(), LockoutError> {
        match result {
            Ok(()) => Ok(()),
            Err(err) => match self.config.failure_policy {
                FailurePolicy::Open => {
                    tracing::warn!(operation, error = %err, "store write failed; skipped");
                    Ok(())
                }
                FailurePolicy::Closed => Err(err.into()),
            },
        }
    }
}
