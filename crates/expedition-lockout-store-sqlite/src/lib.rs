#![allow(clippy::missing_errors_doc)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use expedition_lockout_core::{
    format_rfc3339, from_unix_seconds, now_utc, CharacterId, ExpeditionId, ExpeditionLockouts,
    KeyState, LockoutEntry, LockoutState, LockoutStore, MergeStrategy, StoreError,
};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use time::OffsetDateTime;

mod records;

const LOCKOUT_MIGRATION_VERSION: i64 = 1;

const SCHEMA_LOCKOUTS_V1: &str = r"
CREATE TABLE IF NOT EXISTS character_lockouts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  character_id INTEGER NOT NULL CHECK (character_id >= 0),
  origin_expedition_uuid TEXT NOT NULL,
  expedition_name TEXT NOT NULL,
  event_name TEXT NOT NULL,
  expire_at INTEGER NOT NULL,
  duration INTEGER NOT NULL CHECK (duration >= 0),
  pending INTEGER NOT NULL DEFAULT 0 CHECK (pending IN (0, 1)),
  UNIQUE (character_id, expedition_name, event_name)
);

CREATE INDEX IF NOT EXISTS idx_character_lockouts_pending
  ON character_lockouts(character_id, pending);
CREATE INDEX IF NOT EXISTS idx_character_lockouts_expire_at
  ON character_lockouts(expire_at);

CREATE TABLE IF NOT EXISTS expedition_lockouts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  expedition_id INTEGER NOT NULL CHECK (expedition_id >= 0),
  origin_expedition_uuid TEXT NOT NULL,
  event_name TEXT NOT NULL,
  expire_at INTEGER NOT NULL,
  duration INTEGER NOT NULL CHECK (duration >= 0),
  UNIQUE (expedition_id, event_name)
);

CREATE TABLE IF NOT EXISTS expedition_details (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  uuid TEXT NOT NULL UNIQUE,
  expedition_name TEXT NOT NULL,
  leader_id INTEGER NOT NULL,
  min_players INTEGER NOT NULL CHECK (min_players >= 0),
  max_players INTEGER NOT NULL CHECK (max_players >= min_players),
  add_replay_on_join INTEGER NOT NULL DEFAULT 1 CHECK (add_replay_on_join IN (0, 1)),
  is_locked INTEGER NOT NULL DEFAULT 0 CHECK (is_locked IN (0, 1))
);

CREATE TABLE IF NOT EXISTS expedition_members (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  expedition_id INTEGER NOT NULL,
  character_id INTEGER NOT NULL,
  UNIQUE (character_id),
  FOREIGN KEY (expedition_id) REFERENCES expedition_details(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_expedition_members_expedition
  ON expedition_members(expedition_id);
";

const LOCKOUT_COLUMNS: &str = "origin_expedition_uuid, expedition_name, event_name, expire_at, duration";

/// Which table an upsert targets; both share one merge path.
#[derive(Debug, Clone, Copy)]
enum LockoutScope {
    Character(CharacterId),
    Expedition(ExpeditionId),
}

impl LockoutScope {
    fn upsert_sql(self, strategy: MergeStrategy) -> String {
        let (insert, conflict_target) = match self {
            Self::Character(_) => (
                "INSERT INTO character_lockouts(
                    character_id, origin_expedition_uuid, expedition_name, event_name,
                    expire_at, duration, pending
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                "character_id, expedition_name, event_name",
            ),
            Self::Expedition(_) => (
                "INSERT INTO expedition_lockouts(
                    expedition_id, origin_expedition_uuid, event_name, expire_at, duration
                 ) VALUES (?1, ?2, ?3, ?4, ?5)",
                "expedition_id, event_name",
            ),
        };

        let action = match (strategy, self) {
            (MergeStrategy::PreserveTimer, _) => "DO NOTHING",
            (MergeStrategy::ReplaceTimer, Self::Expedition(_)) => {
                "DO UPDATE SET
                   origin_expedition_uuid = excluded.origin_expedition_uuid,
                   expire_at = excluded.expire_at,
                   duration = excluded.duration"
            }
            // pending writes never touch confirmed rows; confirmed writes promote pending ones
            (MergeStrategy::ReplaceTimer, Self::Character(_)) => {
                "DO UPDATE SET
                   origin_expedition_uuid = excluded.origin_expedition_uuid,
                   expire_at = excluded.expire_at,
                   duration = excluded.duration,
                   pending = MIN(character_lockouts.pending, excluded.pending)
                 WHERE excluded.pending = 0 OR character_lockouts.pending = 1"
            }
        };

        format!("{insert} ON CONFLICT({conflict_target}) {action}")
    }

    fn write(
        self,
        conn: &Connection,
        entries: &[&LockoutEntry],
        strategy: MergeStrategy,
        state: LockoutState,
    ) -> Result<()> {
        let mut stmt = conn
            .prepare_cached(&self.upsert_sql(strategy))
            .context("failed to prepare lockout upsert")?;

        for entry in entries {
            let written = match self {
                Self::Character(character_id) => stmt.execute(params![
                    i64::from(character_id.0),
                    entry.origin_expedition_uuid,
                    entry.expedition_name,
                    entry.event_name,
                    entry.expire_at_unix(),
                    i64::from(entry.duration),
                    bool_to_sql(state.is_pending()),
                ]),
                Self::Expedition(expedition_id) => stmt.execute(params![
                    i64::from(expedition_id.0),
                    entry.origin_expedition_uuid,
                    entry.event_name,
                    entry.expire_at_unix(),
                    i64::from(entry.duration),
                ]),
            };
            written.with_context(|| {
                format!(
                    "failed to upsert lockout {}:{} for {self:?}",
                    entry.expedition_name, entry.event_name
                )
            })?;
        }

        Ok(())
    }
}

pub struct SqliteLockoutStore {
    conn: Connection,
}

impl SqliteLockoutStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_LOCKOUTS_V1)
            .context("failed to apply lockout schema")?;

        let now = format_rfc3339(now_utc())?;
        let applied = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![LOCKOUT_MIGRATION_VERSION, now],
            )
            .context("failed to register lockout schema migration")?;
        if applied > 0 {
            tracing::info!(version = LOCKOUT_MIGRATION_VERSION, "applied lockout schema");
        }

        self.verify_schema()
    }

    /// Checks the uniqueness keys every merge-upsert depends on.
    pub fn verify_schema(&self) -> Result<()> {
        ensure_table_has_columns(
            &self.conn,
            "character_lockouts",
            &[
                "character_id",
                "origin_expedition_uuid",
                "expedition_name",
                "event_name",
                "expire_at",
                "duration",
                "pending",
            ],
        )?;
        ensure_unique_index_on_columns(
            &self.conn,
            "character_lockouts",
            &["character_id", "expedition_name", "event_name"],
        )?;
        ensure_table_has_columns(
            &self.conn,
            "expedition_lockouts",
            &[
                "expedition_id",
                "origin_expedition_uuid",
                "event_name",
                "expire_at",
                "duration",
            ],
        )?;
        ensure_unique_index_on_columns(
            &self.conn,
            "expedition_lockouts",
            &["expedition_id", "event_name"],
        )
    }

    /// Every character row with its state, ordered by key.
    pub fn character_rows(&self) -> Result<Vec<(CharacterId, LockoutEntry, LockoutState)>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT character_id, {LOCKOUT_COLUMNS}, pending
             FROM character_lockouts
             ORDER BY character_id ASC, expedition_name ASC, event_name ASC"
        ))?;

        let rows = stmt.query_map([], |row| {
            let character_id = CharacterId(u32_column(row, 0)?);
            let entry = parse_lockout_row(row, 1)?;
            let pending: i64 = row.get(6)?;
            Ok((character_id, entry, LockoutState::from_pending_flag(pending != 0)))
        })?;

        collect_rows(rows)
    }

    fn query_active(
        &self,
        character_id: CharacterId,
        expedition_name: Option<&str>,
        now: OffsetDateTime,
    ) -> Result<Vec<LockoutEntry>> {
        tracing::debug!(
            character_id = %character_id,
            expedition_name = expedition_name.unwrap_or("*"),
            "loading character lockouts"
        );

        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {LOCKOUT_COLUMNS}
             FROM character_lockouts
             WHERE character_id = ?1
               AND pending = 0
               AND expire_at > ?2
               AND (?3 IS NULL OR expedition_name = ?3)
             ORDER BY expedition_name ASC, event_name ASC"
        ))?;

        let rows = stmt.query_map(
            params![i64::from(character_id.0), now.unix_timestamp(), expedition_name],
            |row| parse_lockout_row(row, 0),
        )?;

        collect_rows(rows).with_context(|| format!("failed to load lockouts for character {character_id}"))
    }

    fn query_for_expeditions(
        &self,
        expedition_ids: &BTreeSet<ExpeditionId>,
    ) -> Result<ExpeditionLockouts> {
        tracing::debug!(
            expeditions = expedition_ids.len(),
            "loading expedition lockouts"
        );

        let mut grouped = ExpeditionLockouts::new();
        if expedition_ids.is_empty() {
            return Ok(grouped);
        }

        let sql = format!(
            "SELECT
                lockout.expedition_id,
                lockout.origin_expedition_uuid,
                details.expedition_name,
                lockout.event_name,
                lockout.expire_at,
                lockout.duration
             FROM expedition_lockouts lockout
               INNER JOIN expedition_details details ON lockout.expedition_id = details.id
             WHERE lockout.expedition_id IN ({})
             ORDER BY lockout.expedition_id ASC, lockout.event_name ASC",
            numbered_vars(1, expedition_ids.len())
        );

        let values: Vec<Value> = expedition_ids
            .iter()
            .map(|id| Value::Integer(i64::from(id.0)))
            .collect();

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), |row| {
            let expedition_id = ExpeditionId(u32_column(row, 0)?);
            Ok((expedition_id, parse_lockout_row(row, 1)?))
        })?;

        for (expedition_id, entry) in collect_rows(rows)? {
            grouped
                .entry(expedition_id)
                .or_default()
                .insert(entry.event_name.clone(), entry);
        }

        Ok(grouped)
    }

    fn query_lockout_state(
        &self,
        character_id: CharacterId,
        expedition_name: &str,
        event_name: &str,
    ) -> Result<KeyState> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {LOCKOUT_COLUMNS}, pending
             FROM character_lockouts
             WHERE character_id = ?1 AND expedition_name = ?2 AND event_name = ?3"
        ))?;

        let row = stmt
            .query_row(
                params![i64::from(character_id.0), expedition_name, event_name],
                |row| {
                    let entry = parse_lockout_row(row, 0)?;
                    let pending: i64 = row.get(5)?;
                    Ok(KeyState::stored(
                        entry,
                        LockoutState::from_pending_flag(pending != 0),
                    ))
                },
            )
            .optional()
            .with_context(|| {
                format!("failed to load lockout {expedition_name}:{event_name} for character {character_id}")
            })?;

        Ok(row.unwrap_or(KeyState::Absent))
    }

    fn write_character_lockouts(
        &mut self,
        character_id: CharacterId,
        entries: &[LockoutEntry],
        strategy: MergeStrategy,
        state: LockoutState,
    ) -> Result<()> {
        tracing::debug!(
            character_id = %character_id,
            lockouts = entries.len(),
            strategy = ?strategy,
            state = state.as_str(),
            "inserting character lockouts"
        );
        if entries.is_empty() {
            return Ok(());
        }

        let refs: Vec<&LockoutEntry> = entries.iter().collect();
        let tx = self
            .conn
            .transaction()
            .context("failed to start lockout transaction")?;
        LockoutScope::Character(character_id).write(&tx, &refs, strategy, state)?;
        tx.commit().context("failed to commit character lockouts")?;
        Ok(())
    }

    fn write_members_lockout(&mut self, members: &[CharacterId], entry: &LockoutEntry) -> Result<()> {
        tracing::debug!(
            expedition_name = %entry.expedition_name,
            event_name = %entry.event_name,
            expire_at = entry.expire_at_unix(),
            members = members.len(),
            "inserting members lockout"
        );
        if members.is_empty() {
            return Ok(());
        }

        let tx = self
            .conn
            .transaction()
            .context("failed to start members lockout transaction")?;
        for member in members {
            LockoutScope::Character(*member).write(
                &tx,
                &[entry],
                MergeStrategy::ReplaceTimer,
                LockoutState::Confirmed,
            )?;
        }
        tx.commit().context("failed to commit members lockout")?;
        Ok(())
    }

    fn write_expedition_lockouts(
        &mut self,
        expedition_id: ExpeditionId,
        entries: &BTreeMap<String, LockoutEntry>,
    ) -> Result<()> {
        tracing::debug!(
            expedition_id = %expedition_id,
            lockouts = entries.len(),
            "inserting expedition lockouts"
        );
        if entries.is_empty() {
            return Ok(());
        }

        let refs: Vec<&LockoutEntry> = entries.values().collect();
        let tx = self
            .conn
            .transaction()
            .context("failed to start expedition lockout transaction")?;
        LockoutScope::Expedition(expedition_id).write(
            &tx,
            &refs,
            MergeStrategy::ReplaceTimer,
            LockoutState::Confirmed,
        )?;
        tx.commit().context("failed to commit expedition lockouts")?;
        Ok(())
    }

    fn execute_delete(&self, operation: &str, sql: &str, values: &[Value]) -> Result<usize> {
        let deleted = self
            .conn
            .execute(sql, params_from_iter(values.iter()))
            .with_context(|| format!("failed to {operation}"))?;
        tracing::debug!(operation, deleted, "lockout rows removed");
        Ok(deleted)
    }

    fn remove_members_lockout(
        &self,
        members: &[CharacterId],
        expedition_name: &str,
        event_name: &str,
    ) -> Result<()> {
        let members: Vec<CharacterId> = members
            .iter()
            .copied()
            .filter(|id| !id.is_unset())
            .collect();
        if members.is_empty() {
            return Ok(());
        }

        let sql = format!(
            "DELETE FROM character_lockouts
             WHERE pending = 0
               AND expedition_name = ?1
               AND event_name = ?2
               AND character_id IN ({})",
            numbered_vars(3, members.len())
        );
        let mut values = vec![
            Value::Text(expedition_name.to_string()),
            Value::Text(event_name.to_string()),
        ];
        values.extend(character_values(&members));
        self.execute_delete("delete members lockout", &sql, &values)
            .map(|_| ())
    }

    fn remove_pending(&self, character_ids: &[CharacterId]) -> Result<()> {
        if character_ids.is_empty() {
            return Ok(());
        }

        let sql = format!(
            "DELETE FROM character_lockouts
             WHERE pending = 1 AND character_id IN ({})",
            numbered_vars(1, character_ids.len())
        );
        self.execute_delete(
            "delete pending lockouts",
            &sql,
            &character_values(character_ids),
        )
        .map(|_| ())
    }

    fn remove_expired(&mut self, now: OffsetDateTime) -> Result<usize> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start purge transaction")?;
        let characters = tx
            .execute(
                "DELETE FROM character_lockouts WHERE expire_at <= ?1",
                params![now.unix_timestamp()],
            )
            .context("failed to purge expired character lockouts")?;
        let expeditions = tx
            .execute(
                "DELETE FROM expedition_lockouts WHERE expire_at <= ?1",
                params![now.unix_timestamp()],
            )
            .context("failed to purge expired expedition lockouts")?;
        tx.commit().context("failed to commit purge")?;

        tracing::debug!(characters, expeditions, "purged expired lockouts");
        Ok(characters + expeditions)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl LockoutStore for SqliteLockoutStore {
    fn get_active(
        &self,
        character_id: CharacterId,
        now: OffsetDateTime,
    ) -> Result<Vec<LockoutEntry>, StoreError> {
        self.query_active(character_id, None, now)
            .map_err(into_store_error)
    }

    fn get_active_in(
        &self,
        character_id: CharacterId,
        expedition_name: &str,
        now: OffsetDateTime,
    ) -> Result<Vec<LockoutEntry>, StoreError> {
        self.query_active(character_id, Some(expedition_name), now)
            .map_err(into_store_error)
    }

    fn get_active_for_expeditions(
        &self,
        expedition_ids: &BTreeSet<ExpeditionId>,
    ) -> Result<ExpeditionLockouts, StoreError> {
        self.query_for_expeditions(expedition_ids)
            .map_err(into_store_error)
    }

    fn character_lockout_state(
        &self,
        character_id: CharacterId,
        expedition_name: &str,
        event_name: &str,
    ) -> Result<KeyState, StoreError> {
        self.query_lockout_state(character_id, expedition_name, event_name)
            .map_err(into_store_error)
    }

    fn upsert_character_lockouts(
        &mut self,
        character_id: CharacterId,
        entries: &[LockoutEntry],
        strategy: MergeStrategy,
        state: LockoutState,
    ) -> Result<(), StoreError> {
        self.write_character_lockouts(character_id, entries, strategy, state)
            .map_err(into_store_error)
    }

    fn upsert_members_lockout(
        &mut self,
        members: &[CharacterId],
        entry: &LockoutEntry,
    ) -> Result<(), StoreError> {
        self.write_members_lockout(members, entry)
            .map_err(into_store_error)
    }

    fn upsert_expedition_lockouts(
        &mut self,
        expedition_id: ExpeditionId,
        entries: &BTreeMap<String, LockoutEntry>,
    ) -> Result<(), StoreError> {
        self.write_expedition_lockouts(expedition_id, entries)
            .map_err(into_store_error)
    }

    fn delete_character_lockouts(&mut self, character_id: CharacterId) -> Result<(), StoreError> {
        if character_id.is_unset() {
            return Ok(());
        }
        self.execute_delete(
            "delete character lockouts",
            "DELETE FROM character_lockouts WHERE character_id = ?1",
            &character_values(&[character_id]),
        )
        .map(|_| ())
        .map_err(into_store_error)
    }

    fn delete_character_lockouts_in(
        &mut self,
        character_id: CharacterId,
        expedition_name: &str,
    ) -> Result<(), StoreError> {
        if character_id.is_unset() || expedition_name.is_empty() {
            return Ok(());
        }
        self.execute_delete(
            "delete character expedition lockouts",
            "DELETE FROM character_lockouts WHERE character_id = ?1 AND expedition_name = ?2",
            &[
                Value::Integer(i64::from(character_id.0)),
                Value::Text(expedition_name.to_string()),
            ],
        )
        .map(|_| ())
        .map_err(into_store_error)
    }

    fn delete_character_lockout(
        &mut self,
        character_id: CharacterId,
        expedition_name: &str,
        event_name: &str,
    ) -> Result<(), StoreError> {
        self.remove_members_lockout(&[character_id], expedition_name, event_name)
            .map_err(into_store_error)
    }

    fn delete_members_lockout(
        &mut self,
        members: &[CharacterId],
        expedition_name: &str,
        event_name: &str,
    ) -> Result<(), StoreError> {
        self.remove_members_lockout(members, expedition_name, event_name)
            .map_err(into_store_error)
    }

    fn delete_pending_for_members(
        &mut self,
        character_ids: &[CharacterId],
    ) -> Result<(), StoreError> {
        self.remove_pending(character_ids)
            .map_err(into_store_error)
    }

    fn delete_event_lockout(
        &mut self,
        expedition_id: ExpeditionId,
        event_name: &str,
    ) -> Result<(), StoreError> {
        self.execute_delete(
            "delete expedition event lockout",
            "DELETE FROM expedition_lockouts WHERE expedition_id = ?1 AND event_name = ?2",
            &[
                Value::Integer(i64::from(expedition_id.0)),
                Value::Text(event_name.to_string()),
            ],
        )
        .map(|_| ())
        .map_err(into_store_error)
    }

    fn confirm_pending(
        &mut self,
        character_id: CharacterId,
        expedition_name: &str,
    ) -> Result<(), StoreError> {
        tracing::debug!(
            character_id = %character_id,
            expedition_name,
            "assigning pending lockouts"
        );
        self.conn
            .execute(
                "UPDATE character_lockouts
                 SET pending = 0
                 WHERE character_id = ?1 AND pending = 1 AND expedition_name = ?2",
                params![i64::from(character_id.0), expedition_name],
            )
            .map(|_| ())
            .with_context(|| {
                format!("failed to confirm pending lockouts for character {character_id}")
            })
            .map_err(into_store_error)
    }

    fn purge_expired(&mut self, now: OffsetDateTime) -> Result<usize, StoreError> {
        self.remove_expired(now).map_err(into_store_error)
    }
}

fn into_store_error(err: anyhow::Error) -> StoreError {
    match err.downcast_ref::<rusqlite::Error>() {
        Some(rusqlite::Error::FromSqlConversionFailure(..) | rusqlite::Error::IntegralValueOutOfRange(..)) => {
            StoreError::Corrupt(format!("{err:#}"))
        }
        _ => StoreError::Backend(format!("{err:#}")),
    }
}

fn parse_lockout_row(row: &rusqlite::Row<'_>, first: usize) -> rusqlite::Result<LockoutEntry> {
    let expire_at_raw: i64 = row.get(first + 3)?;
    let expire_at = from_unix_seconds(expire_at_raw).map_err(|err| to_sql_error(first + 3, &err))?;

    Ok(LockoutEntry {
        origin_expedition_uuid: row.get(first)?,
        expedition_name: row.get(first + 1)?,
        event_name: row.get(first + 2)?,
        expire_at,
        duration: u32_column(row, first + 4)?,
    })
}

fn u32_column(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<u32> {
    let raw: i64 = row.get(index)?;
    u32::try_from(raw).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            rusqlite::types::Type::Integer,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid u32 value: {raw}"),
            )),
        )
    })
}

fn to_sql_error(index: usize, err: &StoreError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Integer,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            err.to_string(),
        )),
    )
}

fn character_values(character_ids: &[CharacterId]) -> Vec<Value> {
    character_ids
        .iter()
        .map(|id| Value::Integer(i64::from(id.0)))
        .collect()
}

/// `?start, ?start+1, ...` for `count` bound values.
fn numbered_vars(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|index| format!("?{index}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

fn ensure_table_has_columns(conn: &Connection, table_name: &str, columns: &[&str]) -> Result<()> {
    if !table_exists(conn, table_name)? {
        return Err(anyhow!("lockout schema check failed: missing table {table_name}"));
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table_name})"))
        .with_context(|| format!("failed to inspect table_info for {table_name}"))?;
    let mut rows = stmt.query([])?;

    let mut available = Vec::new();
    while let Some(row) = rows.next()? {
        available.push(row.get::<_, String>(1)?);
    }

    for required in columns {
        if !available.iter().any(|candidate| candidate == required) {
            return Err(anyhow!(
                "lockout schema check failed: missing column {table_name}.{required}"
            ));
        }
    }

    Ok(())
}

fn ensure_unique_index_on_columns(
    conn: &Connection,
    table_name: &str,
    columns: &[&str],
) -> Result<()> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA index_list({table_name})"))
        .with_context(|| format!("failed to inspect index_list for {table_name}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let index_name: String = row.get(1)?;
        let is_unique: i64 = row.get(2)?;
        if is_unique != 1 {
            continue;
        }

        let indexed_columns = index_columns(conn, &index_name)?;
        if indexed_columns == columns {
            return Ok(());
        }
    }

    Err(anyhow!(
        "lockout schema check failed: expected UNIQUE({}) on {table_name}",
        columns.join(", ")
    ))
}

fn index_columns(conn: &Connection, index_name: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA index_info({index_name})"))
        .with_context(|| format!("failed to inspect index_info for {index_name}"))?;
    let mut rows = stmt.query([])?;

    let mut columns = Vec::new();
    while let Some(row) = rows.next()? {
        columns.push(row.get::<_, String>(2)?);
    }

    Ok(columns)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::*;
    use expedition_lockout_core::{
        parse_rfc3339_utc, ExpeditionRecords, LockoutRegistry, ManualClock, MemoryLockoutStore,
        RegistryConfig,
    };
    use proptest::prelude::*;
    use time::Duration;
    use ulid::Ulid;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_now() -> OffsetDateTime {
        must(parse_rfc3339_utc("2026-02-07T12:00:00Z"))
    }

    fn fixture_store() -> SqliteLockoutStore {
        let store = must(SqliteLockoutStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    fn fixture_registry(clock: &ManualClock) -> LockoutRegistry<SqliteLockoutStore, &ManualClock> {
        LockoutRegistry::with_clock(fixture_store(), clock, RegistryConfig::default())
    }

    fn lockout(expedition: &str, event: &str, duration: u32) -> LockoutEntry {
        LockoutEntry::new(
            "01J0SQQP7M70P6Y3R4T8D8G8M2",
            expedition,
            event,
            duration,
            fixture_now(),
        )
    }

    fn create_expedition(store: &mut SqliteLockoutStore, name: &str) -> ExpeditionId {
        must(store.create_expedition(&Ulid::new().to_string(), name, CharacterId(1), 1, 6))
    }

    const C1: CharacterId = CharacterId(11);
    const C2: CharacterId = CharacterId(12);

    #[test]
    fn migrate_is_idempotent_and_schema_contract_holds() {
        let store = fixture_store();
        must(store.migrate());
        must(store.verify_schema());

        let applied: i64 = must(store.connection().query_row(
            "SELECT COUNT(*) FROM schema_migrations WHERE version = ?1",
            params![LOCKOUT_MIGRATION_VERSION],
            |row| row.get(0),
        ));
        assert_eq!(applied, 1);
    }

    #[test]
    fn verify_schema_rejects_lockout_table_without_unique_key() {
        let store = must(SqliteLockoutStore::open(Path::new(":memory:")));
        must(store.connection().execute_batch(
            "CREATE TABLE character_lockouts (
                character_id INTEGER NOT NULL,
                origin_expedition_uuid TEXT NOT NULL,
                expedition_name TEXT NOT NULL,
                event_name TEXT NOT NULL,
                expire_at INTEGER NOT NULL,
                duration INTEGER NOT NULL,
                pending INTEGER NOT NULL
             );",
        ));

        let err = match store.verify_schema() {
            Ok(()) => panic!("schema without unique key passed verification"),
            Err(err) => err,
        };
        assert!(err
            .to_string()
            .contains("UNIQUE(character_id, expedition_name, event_name)"));
    }

    #[test]
    fn open_on_disk_database_persists_lockouts() {
        let path = std::env::temp_dir().join(format!("expedition-lockouts-{}.sqlite3", Ulid::new()));
        {
            let mut store = must(SqliteLockoutStore::open(&path));
            must(store.migrate());
            must(store.upsert_character_lockouts(
                C1,
                &[lockout("Gates", "Boss", 600)],
                MergeStrategy::ReplaceTimer,
                LockoutState::Confirmed,
            ));
        }

        let reopened = must(SqliteLockoutStore::open(&path));
        must(reopened.migrate());
        let active = must(reopened.get_active(C1, fixture_now()));
        assert_eq!(active, vec![lockout("Gates", "Boss", 600)]);

        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(path.with_extension("sqlite3-wal"));
        let _ = std::fs::remove_file(path.with_extension("sqlite3-shm"));
    }

    #[test]
    fn pending_reservation_is_invisible_until_confirmed() {
        let clock = ManualClock::new(fixture_now());
        let mut registry = fixture_registry(&clock);

        let reservation = must(registry.reserve("Gates", &[C1], &[lockout("Gates", "Trial1", 3_600)]));
        assert!(!registry.is_locked_out(C1, "Gates", "Trial1"));
        assert!(must(registry.get_character_lockouts(C1)).is_empty());
        assert!(matches!(
            must(registry.lockout_state(C1, "Gates", "Trial1")),
            KeyState::Pending(_)
        ));

        clock.advance(Duration::seconds(120));
        must(registry.confirm(reservation));
        assert!(registry.is_locked_out(C1, "Gates", "Trial1"));
        let active = must(registry.get_character_lockouts_in(C1, "Gates"));
        assert_eq!(
            active.get("Trial1").map(|entry| entry.expire_at),
            Some(fixture_now() + Duration::seconds(3_600))
        );

        clock.set(fixture_now() + Duration::seconds(3_600));
        assert!(!registry.is_locked_out(C1, "Gates", "Trial1"));
        assert!(must(registry.get_character_lockouts(C1)).is_empty());
    }

    #[test]
    fn reserve_then_discard_restores_prior_rows() {
        let clock = ManualClock::new(fixture_now());
        let mut registry = fixture_registry(&clock);
        let expedition_id = create_expedition(registry.store_mut(), "Gates");

        must(registry.apply_lockout_on_event(expedition_id, &[C1], &lockout("Gates", "Trial1", 60)));
        let before = must(registry.store().character_rows());

        let reservation = must(registry.reserve(
            "Gates",
            &[C1, C2],
            &[lockout("Gates", "Trial1", 7_200), lockout("Gates", "Trial2", 7_200)],
        ));
        assert_eq!(must(registry.store().character_rows()).len(), before.len() + 3);

        must(registry.discard(reservation));
        assert_eq!(must(registry.store().character_rows()), before);
    }

    #[test]
    fn confirm_promotes_only_the_named_expedition() {
        let clock = ManualClock::new(fixture_now());
        let mut registry = fixture_registry(&clock);

        let gates = must(registry.reserve("Gates", &[C1], &[lockout("Gates", "Boss", 600)]));
        let vault = must(registry.reserve("Vault", &[C1], &[lockout("Vault", "Boss", 600)]));
        must(registry.confirm(gates));

        assert!(registry.is_locked_out(C1, "Gates", "Boss"));
        assert!(!registry.is_locked_out(C1, "Vault", "Boss"));
        must(registry.discard(vault));
        assert_eq!(
            must(registry.lockout_state(C1, "Vault", "Boss")),
            KeyState::Absent
        );
    }

    #[test]
    fn event_lockout_is_shared_by_members_and_hydrated() {
        let clock = ManualClock::new(fixture_now());
        let mut registry = fixture_registry(&clock);
        let expedition_id = create_expedition(registry.store_mut(), "Gates");
        let boss = lockout("Gates", "Boss", 600);

        must(registry.apply_lockout_on_event(expedition_id, &[C1, C2], &boss));

        let first = must(registry.get_character_lockouts(C1));
        let second = must(registry.get_character_lockouts(C2));
        assert_eq!(first.get("Boss").map(|entry| entry.expire_at), Some(boss.expire_at));
        assert_eq!(second.get("Boss").map(|entry| entry.expire_at), Some(boss.expire_at));

        let hydrated = must(registry.hydrate_all(&BTreeSet::from([expedition_id])));
        assert_eq!(
            hydrated
                .get(&expedition_id)
                .and_then(|events| events.get("Boss"))
                .map(|entry| entry.expire_at),
            Some(boss.expire_at)
        );
    }

    #[test]
    fn hydration_keeps_expired_rows_and_skips_unknown_expeditions() {
        let clock = ManualClock::new(fixture_now());
        let mut registry = fixture_registry(&clock);
        let gates = create_expedition(registry.store_mut(), "Gates");
        let vault = create_expedition(registry.store_mut(), "Vault");
        let orphan = ExpeditionId(999);

        let lockouts = BTreeMap::from([
            ("Boss".to_string(), lockout("Gates", "Boss", 600)),
            ("Trash".to_string(), lockout("Gates", "Trash", 30)),
        ]);
        must(registry.add_expedition_lockouts(gates, &lockouts));
        must(registry.add_expedition_lockouts(vault, &lockouts));
        must(registry.add_expedition_lockouts(orphan, &lockouts));

        clock.advance(Duration::seconds(30));
        let hydrated = must(registry.hydrate_all(&BTreeSet::from([gates, orphan])));
        assert_eq!(hydrated.len(), 1);
        let events = match hydrated.get(&gates) {
            Some(events) => events,
            None => panic!("missing hydrated expedition"),
        };
        assert_eq!(events.keys().collect::<Vec<_>>(), vec!["Boss", "Trash"]);
        assert!(events["Trash"].is_expired(registry.now()));
        assert!(!events["Boss"].is_expired(registry.now()));

        assert!(must(registry.hydrate_all(&BTreeSet::new())).is_empty());
    }

    #[test]
    fn expedition_lockout_past_expiry_still_hydrates() {
        let clock = ManualClock::new(fixture_now());
        let mut registry = fixture_registry(&clock);
        let gates = create_expedition(registry.store_mut(), "Gates");
        must(registry.apply_lockout_on_event(gates, &[C1], &lockout("Gates", "Boss", 600)));

        clock.advance(Duration::seconds(601));
        assert!(!registry.is_locked_out(C1, "Gates", "Boss"));
        let hydrated = must(registry.hydrate_all(&BTreeSet::from([gates])));
        assert_eq!(
            hydrated
                .get(&gates)
                .and_then(|events| events.get("Boss"))
                .map(|entry| entry.expire_at),
            Some(fixture_now() + Duration::seconds(600))
        );
    }

    #[test]
    fn idempotent_writes_converge_after_one_application() {
        let mut store = fixture_store();
        let gates = create_expedition(&mut store, "Gates");
        let boss = lockout("Gates", "Boss", 600);
        let trial = lockout("Gates", "Trial", 900);

        let mut snapshots = Vec::new();
        for _ in 0..2 {
            must(store.upsert_character_lockouts(
                C1,
                std::slice::from_ref(&boss),
                MergeStrategy::ReplaceTimer,
                LockoutState::Confirmed,
            ));
            must(store.upsert_character_lockouts(
                C1,
                std::slice::from_ref(&trial),
                MergeStrategy::ReplaceTimer,
                LockoutState::Pending,
            ));
            must(store.upsert_members_lockout(&[C1, C2], &boss));
            must(store.upsert_expedition_lockout(gates, &boss));
            snapshots.push((
                must(store.character_rows()),
                must(store.get_active_for_expeditions(&BTreeSet::from([gates]))),
            ));
        }
        assert_eq!(snapshots[0], snapshots[1]);
        assert_eq!(snapshots[0].0.len(), 3);

        must(store.confirm_pending(C1, "Gates"));
        let confirmed = must(store.character_rows());
        must(store.confirm_pending(C1, "Gates"));
        assert_eq!(must(store.character_rows()), confirmed);
        assert_eq!(
            must(store.character_lockout_state(C1, "Gates", "Trial")),
            KeyState::Confirmed(trial.clone())
        );

        must(store.upsert_character_lockouts(
            C2,
            std::slice::from_ref(&trial),
            MergeStrategy::ReplaceTimer,
            LockoutState::Pending,
        ));
        must(store.delete_pending(C2));
        let cleared = must(store.character_rows());
        must(store.delete_pending(C2));
        assert_eq!(must(store.character_rows()), cleared);
        assert_eq!(
            must(store.character_lockout_state(C2, "Gates", "Trial")),
            KeyState::Absent
        );
    }

    #[test]
    fn preserve_timer_keeps_existing_and_replace_timer_overwrites() {
        let mut store = fixture_store();
        let original = lockout("Gates", "Boss", 600);
        let longer = lockout("Gates", "Boss", 7_200);
        must(store.upsert_character_lockouts(
            C1,
            std::slice::from_ref(&original),
            MergeStrategy::ReplaceTimer,
            LockoutState::Confirmed,
        ));

        must(store.upsert_character_lockouts(
            C1,
            std::slice::from_ref(&longer),
            MergeStrategy::PreserveTimer,
            LockoutState::Confirmed,
        ));
        assert_eq!(
            must(store.character_lockout_state(C1, "Gates", "Boss")),
            KeyState::Confirmed(original)
        );

        must(store.upsert_character_lockouts(
            C1,
            std::slice::from_ref(&longer),
            MergeStrategy::ReplaceTimer,
            LockoutState::Confirmed,
        ));
        assert_eq!(
            must(store.character_lockout_state(C1, "Gates", "Boss")),
            KeyState::Confirmed(longer)
        );
    }

    #[test]
    fn pending_write_never_rewrites_confirmed_row() {
        let mut store = fixture_store();
        let enforced = lockout("Gates", "Boss", 600);
        must(store.upsert_character_lockouts(
            C1,
            std::slice::from_ref(&enforced),
            MergeStrategy::ReplaceTimer,
            LockoutState::Confirmed,
        ));
        must(store.upsert_character_lockouts(
            C1,
            &[lockout("Gates", "Boss", 7_200)],
            MergeStrategy::ReplaceTimer,
            LockoutState::Pending,
        ));
        assert_eq!(
            must(store.character_lockout_state(C1, "Gates", "Boss")),
            KeyState::Confirmed(enforced)
        );

        let replacement = lockout("Gates", "Trial", 900);
        must(store.upsert_character_lockouts(
            C1,
            &[lockout("Gates", "Trial", 60)],
            MergeStrategy::ReplaceTimer,
            LockoutState::Pending,
        ));
        must(store.upsert_character_lockouts(
            C1,
            std::slice::from_ref(&replacement),
            MergeStrategy::ReplaceTimer,
            LockoutState::Confirmed,
        ));
        assert_eq!(
            must(store.character_lockout_state(C1, "Gates", "Trial")),
            KeyState::Confirmed(replacement)
        );
    }

    #[test]
    fn deletes_respect_pending_state_and_unset_characters() {
        let mut store = fixture_store();
        must(store.upsert_character_lockouts(
            C1,
            &[lockout("Gates", "Boss", 600)],
            MergeStrategy::ReplaceTimer,
            LockoutState::Pending,
        ));
        must(store.upsert_character_lockouts(
            CharacterId::UNSET,
            &[lockout("Gates", "Boss", 600)],
            MergeStrategy::ReplaceTimer,
            LockoutState::Confirmed,
        ));

        must(store.delete_character_lockout(C1, "Gates", "Boss"));
        assert!(matches!(
            must(store.character_lockout_state(C1, "Gates", "Boss")),
            KeyState::Pending(_)
        ));

        must(store.delete_character_lockouts(CharacterId::UNSET));
        must(store.delete_character_lockouts_in(CharacterId::UNSET, "Gates"));
        must(store.delete_character_lockouts_in(C1, ""));
        assert_eq!(must(store.character_rows()).len(), 2);

        must(store.delete_character_lockouts_in(C1, "Gates"));
        assert_eq!(
            must(store.character_lockout_state(C1, "Gates", "Boss")),
            KeyState::Absent
        );
    }

    #[test]
    fn members_lockout_write_and_delete_cover_every_member() {
        let mut store = fixture_store();
        let boss = lockout("Gates", "Boss", 600);
        must(store.upsert_members_lockout(&[C1, C2], &boss));
        assert_eq!(must(store.character_rows()).len(), 2);

        must(store.delete_members_lockout(&[C1, C2, CharacterId::UNSET], "Gates", "Boss"));
        assert!(must(store.character_rows()).is_empty());

        must(store.upsert_members_lockout(&[], &boss));
        must(store.delete_members_lockout(&[], "Gates", "Boss"));
        must(store.delete_pending_for_members(&[]));
        must(store.upsert_expedition_lockouts(ExpeditionId(1), &BTreeMap::new()));
    }

    #[test]
    fn purge_expired_clears_both_tables() {
        let mut store = fixture_store();
        must(store.upsert_character_lockouts(
            C1,
            &[lockout("Gates", "Short", 60), lockout("Gates", "Long", 3_600)],
            MergeStrategy::ReplaceTimer,
            LockoutState::Pending,
        ));
        must(store.upsert_expedition_lockout(ExpeditionId(3), &lockout("Gates", "Short", 60)));

        let purged = must(store.purge_expired(fixture_now() + Duration::seconds(60)));
        assert_eq!(purged, 2);
        assert_eq!(must(store.character_rows()).len(), 1);
    }

    #[test]
    fn undecodable_expiry_surfaces_as_corrupt() {
        let store = fixture_store();
        must(store.connection().execute(
            "INSERT INTO character_lockouts(
                character_id, origin_expedition_uuid, expedition_name, event_name,
                expire_at, duration, pending
             ) VALUES (?1, 'origin', 'Gates', 'Boss', ?2, 60, 0)",
            params![i64::from(C1.0), i64::MAX],
        ));

        match store.get_active(C1, fixture_now()) {
            Err(StoreError::Corrupt(message)) => assert!(message.contains("character 11")),
            other => panic!("expected corrupt row error, got {other:?}"),
        }
        assert!(matches!(
            store.character_lockout_state(C1, "Gates", "Boss"),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn expedition_records_round_trip() {
        let mut store = fixture_store();
        let gates = create_expedition(&mut store, "Gates");
        let vault = create_expedition(&mut store, "Vault");

        must(store.add_members(gates, &[C1, C2]));
        must(store.add_member(gates, C1));
        assert!(store.add_member(vault, C1).is_err());
        assert_eq!(must(store.expedition_for_character(C2)), Some(gates));

        must(store.update_leader(gates, C2));
        must(store.update_lock_state(gates, true));
        must(store.update_replay_on_join(gates, false));
        assert!(store.update_leader(ExpeditionId(999), C1).is_err());

        let record = match must(store.load_expedition(gates)) {
            Some(record) => record,
            None => panic!("missing expedition"),
        };
        assert_eq!(record.expedition_name, "Gates");
        assert_eq!(record.leader_id, C2);
        assert!(record.is_locked);
        assert!(!record.add_replay_on_join);
        assert_eq!(record.members, vec![C1, C2]);

        must(store.remove_member(gates, C1));
        assert_eq!(must(store.expedition_for_character(C1)), None);
        must(store.remove_all_members(gates));

        let all = must(store.load_all_expeditions());
        assert_eq!(
            all.iter().map(|record| record.id).collect::<Vec<_>>(),
            vec![gates, vault]
        );
        assert!(all.iter().all(|record| record.members.is_empty()));
        assert_eq!(must(store.load_expedition(ExpeditionId(999))), None);
        assert!(store
            .create_expedition("uuid", "Bad", C1, 6, 1)
            .is_err());
    }

    fn apply_op<S: LockoutStore>(store: &mut S, index: usize, op: (u8, u8, u8, u16)) {
        let (code, character, event, minutes) = op;
        let character_id = CharacterId(u32::from(character));
        let expedition_name = if event % 2 == 0 { "Gates" } else { "Vault" };
        let event_name = if event < 2 { "Boss" } else { "Trial" };
        let entry = LockoutEntry::new(
            format!("origin-{index}"),
            expedition_name,
            event_name,
            u32::from(minutes) * 60,
            fixture_now(),
        );

        let result = match code {
            0..=3 => store.upsert_character_lockouts(
                character_id,
                std::slice::from_ref(&entry),
                MergeStrategy::from_merge_flag(code < 2),
                LockoutState::from_pending_flag(code % 2 == 0),
            ),
            4 => store.confirm_pending(character_id, expedition_name),
            5 => store.delete_character_lockout(character_id, expedition_name, event_name),
            6 => store.delete_pending(character_id),
            7 => store.delete_character_lockouts_in(character_id, expedition_name),
            8 => store.upsert_members_lockout(&[character_id, CharacterId(3)], &entry),
            9 => store.delete_character_lockouts(character_id),
            10 => store.upsert_expedition_lockout(expedition_for(character), &entry),
            _ => store.delete_event_lockout(expedition_for(character), event_name),
        };
        must(result);
    }

    /// Ids 1 and 2 have expedition records; 3 does not.
    fn expedition_for(character: u8) -> ExpeditionId {
        ExpeditionId(u32::from(character % 3) + 1)
    }

    fn fixture_store_pair() -> (SqliteLockoutStore, MemoryLockoutStore) {
        let mut sqlite = fixture_store();
        let mut memory = MemoryLockoutStore::new();
        for name in ["Gates", "Vault"] {
            let expedition_id = create_expedition(&mut sqlite, name);
            memory.register_expedition(expedition_id, name);
        }
        (sqlite, memory)
    }

    fn hydrated<S: LockoutStore>(store: &S) -> ExpeditionLockouts {
        let requested = BTreeSet::from([ExpeditionId(1), ExpeditionId(2), ExpeditionId(3)]);
        must(store.get_active_for_expeditions(&requested))
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_sqlite_store_matches_memory_store(
            ops in prop::collection::vec((0u8..12, 0u8..4, 0u8..4, 0u16..120), 1..60)
        ) {
            let (mut sqlite, mut memory) = fixture_store_pair();

            for (index, op) in ops.iter().copied().enumerate() {
                apply_op(&mut sqlite, index, op);
                apply_op(&mut memory, index, op);
            }

            prop_assert_eq!(must(sqlite.character_rows()), memory.character_rows());
            prop_assert_eq!(hydrated(&sqlite), hydrated(&memory));
            let now = fixture_now() + Duration::seconds(1_800);
            for character in 0..4 {
                let character_id = CharacterId(character);
                prop_assert_eq!(
                    must(sqlite.get_active(character_id, now)),
                    must(memory.get_active(character_id, now))
                );
            }
        }

        #[test]
        fn prop_repeating_each_write_matches_applying_it_once(
            ops in prop::collection::vec((0u8..12, 0u8..4, 0u8..4, 0u16..120), 1..40)
        ) {
            let (mut once, _) = fixture_store_pair();
            let (mut twice, _) = fixture_store_pair();

            for (index, op) in ops.iter().copied().enumerate() {
                apply_op(&mut once, index, op);
                apply_op(&mut twice, index, op);
                apply_op(&mut twice, index, op);
            }

            prop_assert_eq!(must(twice.character_rows()), must(once.character_rows()));
            prop_assert_eq!(hydrated(&twice), hydrated(&once));
        }
    }
}
