use anyhow::{anyhow, Context, Result};
use expedition_lockout_core::{
    CharacterId, ExpeditionId, ExpeditionRecord, ExpeditionRecords, StoreError,
};
use rusqlite::{params, Connection, OptionalExtension};

use crate::{bool_to_sql, collect_rows, into_store_error, u32_column, SqliteLockoutStore};

const DETAILS_COLUMNS: &str = "id, uuid, expedition_name, leader_id, min_players, max_players, add_replay_on_join, is_locked";

fn parse_details_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExpeditionRecord> {
    let add_replay_on_join: i64 = row.get(6)?;
    let is_locked: i64 = row.get(7)?;
    Ok(ExpeditionRecord {
        id: ExpeditionId(u32_column(row, 0)?),
        uuid: row.get(1)?,
        expedition_name: row.get(2)?,
        leader_id: CharacterId(u32_column(row, 3)?),
        min_players: u32_column(row, 4)?,
        max_players: u32_column(row, 5)?,
        add_replay_on_join: add_replay_on_join != 0,
        is_locked: is_locked != 0,
        members: Vec::new(),
    })
}

fn load_members(conn: &Connection, expedition_id: ExpeditionId) -> Result<Vec<CharacterId>> {
    let mut stmt = conn.prepare_cached(
        "SELECT character_id
         FROM expedition_members
         WHERE expedition_id = ?1
         ORDER BY id ASC",
    )?;
    let rows = stmt.query_map(params![i64::from(expedition_id.0)], |row| {
        Ok(CharacterId(u32_column(row, 0)?))
    })?;
    collect_rows(rows).with_context(|| format!("failed to load members of expedition {expedition_id}"))
}

fn insert_member(
    conn: &Connection,
    expedition_id: ExpeditionId,
    character_id: CharacterId,
) -> Result<()> {
    conn.execute(
        "INSERT INTO expedition_members(expedition_id, character_id)
         VALUES (?1, ?2)
         ON CONFLICT(character_id) DO NOTHING",
        params![i64::from(expedition_id.0), i64::from(character_id.0)],
    )
    .with_context(|| format!("failed to add character {character_id} to expedition {expedition_id}"))?;

    match member_expedition(conn, character_id)? {
        Some(current) if current == expedition_id => Ok(()),
        Some(current) => Err(anyhow!(
            "character {character_id} already belongs to expedition {current}"
        )),
        None => Err(anyhow!(
            "character {character_id} was not added to expedition {expedition_id}"
        )),
    }
}

fn member_expedition(conn: &Connection, character_id: CharacterId) -> Result<Option<ExpeditionId>> {
    conn.query_row(
        "SELECT expedition_id FROM expedition_members WHERE character_id = ?1",
        params![i64::from(character_id.0)],
        |row| Ok(ExpeditionId(u32_column(row, 0)?)),
    )
    .optional()
    .with_context(|| format!("failed to look up expedition for character {character_id}"))
}

fn update_details(
    conn: &Connection,
    expedition_id: ExpeditionId,
    column: &str,
    value: i64,
) -> Result<()> {
    let updated = conn
        .execute(
            &format!("UPDATE expedition_details SET {column} = ?1 WHERE id = ?2"),
            params![value, i64::from(expedition_id.0)],
        )
        .with_context(|| format!("failed to update {column} for expedition {expedition_id}"))?;
    tracing::debug!(expedition_id = %expedition_id, column, value, updated, "updated expedition details");
    if updated == 0 {
        return Err(anyhow!("expedition {expedition_id} not found"));
    }
    Ok(())
}

impl SqliteLockoutStore {
    fn insert_expedition(
        &mut self,
        uuid: &str,
        expedition_name: &str,
        leader_id: CharacterId,
        min_players: u32,
        max_players: u32,
    ) -> Result<ExpeditionId> {
        if min_players > max_players {
            return Err(anyhow!(
                "min_players {min_players} exceeds max_players {max_players}"
            ));
        }

        self.conn
            .execute(
                "INSERT INTO expedition_details(
                    uuid, expedition_name, leader_id, min_players, max_players
                 ) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    uuid,
                    expedition_name,
                    i64::from(leader_id.0),
                    i64::from(min_players),
                    i64::from(max_players),
                ],
            )
            .with_context(|| format!("failed to insert expedition {expedition_name} ({uuid})"))?;

        let raw_id = self.conn.last_insert_rowid();
        let expedition_id = u32::try_from(raw_id)
            .map(ExpeditionId)
            .map_err(|_| anyhow!("expedition id {raw_id} does not fit in u32"))?;
        tracing::debug!(
            expedition_id = %expedition_id,
            uuid,
            expedition_name,
            leader_id = %leader_id,
            "inserted expedition"
        );
        Ok(expedition_id)
    }

    fn query_expedition(&self, expedition_id: ExpeditionId) -> Result<Option<ExpeditionRecord>> {
        let record = self
            .conn
            .query_row(
                &format!("SELECT {DETAILS_COLUMNS} FROM expedition_details WHERE id = ?1"),
                params![i64::from(expedition_id.0)],
                parse_details_row,
            )
            .optional()
            .with_context(|| format!("failed to load expedition {expedition_id}"))?;

        match record {
            Some(mut record) => {
                record.members = load_members(&self.conn, record.id)?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn query_all_expeditions(&self) -> Result<Vec<ExpeditionRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {DETAILS_COLUMNS} FROM expedition_details ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map([], parse_details_row)?;

        let mut records = collect_rows(rows).context("failed to load expeditions")?;
        for record in &mut records {
            record.members = load_members(&self.conn, record.id)?;
        }
        Ok(records)
    }

    fn insert_members(&mut self, expedition_id: ExpeditionId, members: &[CharacterId]) -> Result<()> {
        tracing::debug!(
            expedition_id = %expedition_id,
            members = members.len(),
            "adding expedition members"
        );
        if members.is_empty() {
            return Ok(());
        }

        let tx = self
            .conn
            .transaction()
            .context("failed to start membership transaction")?;
        for member in members {
            insert_member(&tx, expedition_id, *member)?;
        }
        tx.commit().context("failed to commit expedition members")?;
        Ok(())
    }

    fn delete_members(&self, expedition_id: ExpeditionId, character_id: Option<CharacterId>) -> Result<()> {
        let deleted = match character_id {
            Some(character_id) => self.conn.execute(
                "DELETE FROM expedition_members WHERE expedition_id = ?1 AND character_id = ?2",
                params![i64::from(expedition_id.0), i64::from(character_id.0)],
            ),
            None => self.conn.execute(
                "DELETE FROM expedition_members WHERE expedition_id = ?1",
                params![i64::from(expedition_id.0)],
            ),
        };
        let deleted = deleted
            .with_context(|| format!("failed to remove members of expedition {expedition_id}"))?;
        tracing::debug!(expedition_id = %expedition_id, deleted, "removed expedition members");
        Ok(())
    }
}

impl ExpeditionRecords for SqliteLockoutStore {
    fn create_expedition(
        &mut self,
        uuid: &str,
        expedition_name: &str,
        leader_id: CharacterId,
        min_players: u32,
        max_players: u32,
    ) -> Result<ExpeditionId, StoreError> {
        self.insert_expedition(uuid, expedition_name, leader_id, min_players, max_players)
            .map_err(into_store_error)
    }

    fn load_expedition(
        &self,
        expedition_id: ExpeditionId,
    ) -> Result<Option<ExpeditionRecord>, StoreError> {
        self.query_expedition(expedition_id)
            .map_err(into_store_error)
    }

    fn load_all_expeditions(&self) -> Result<Vec<ExpeditionRecord>, StoreError> {
        self.query_all_expeditions().map_err(into_store_error)
    }

    fn add_member(
        &mut self,
        expedition_id: ExpeditionId,
        character_id: CharacterId,
    ) -> Result<(), StoreError> {
        self.insert_members(expedition_id, &[character_id])
            .map_err(into_store_error)
    }

    fn add_members(
        &mut self,
        expedition_id: ExpeditionId,
        members: &[CharacterId],
    ) -> Result<(), StoreError> {
        self.insert_members(expedition_id, members)
            .map_err(into_store_error)
    }

    fn remove_member(
        &mut self,
        expedition_id: ExpeditionId,
        character_id: CharacterId,
    ) -> Result<(), StoreError> {
        self.delete_members(expedition_id, Some(character_id))
            .map_err(into_store_error)
    }

    fn remove_all_members(&mut self, expedition_id: ExpeditionId) -> Result<(), StoreError> {
        self.delete_members(expedition_id, None)
            .map_err(into_store_error)
    }

    fn expedition_for_character(
        &self,
        character_id: CharacterId,
    ) -> Result<Option<ExpeditionId>, StoreError> {
        member_expedition(&self.conn, character_id).map_err(into_store_error)
    }

    fn update_leader(
        &mut self,
        expedition_id: ExpeditionId,
        leader_id: CharacterId,
    ) -> Result<(), StoreError> {
        update_details(&self.conn, expedition_id, "leader_id", i64::from(leader_id.0))
            .map_err(into_store_error)
    }

    fn update_lock_state(
        &mut self,
        expedition_id: ExpeditionId,
        is_locked: bool,
    ) -> Result<(), StoreError> {
        update_details(&self.conn, expedition_id, "is_locked", bool_to_sql(is_locked))
            .map_err(into_store_error)
    }

    fn update_replay_on_join(
        &mut self,
        expedition_id: ExpeditionId,
        add_on_join: bool,
    ) -> Result<(), StoreError> {
        update_details(
            &self.conn,
            expedition_id,
            "add_replay_on_join",
            bool_to_sql(add_on_join),
        )
        .map_err(into_store_error)
    }
}
