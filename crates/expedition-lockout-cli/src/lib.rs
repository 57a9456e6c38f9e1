//! Command surface for the expedition lockout registry.
//!
//! Hosts embed it through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_command_with_db`] for a [`Command`] against a DB path.
//! - [`run_command`] for a [`Command`] against an existing [`CliRegistry`].
//!
//! Every command prints one pretty JSON document to stdout.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use expedition_lockout_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, CharacterId, ExpeditionId, ExpeditionRecord,
    ExpeditionRecords, FailurePolicy, KeyState, LockoutEntry, LockoutRegistry, ManualClock,
    RegistryConfig,
};
use expedition_lockout_store_sqlite::SqliteLockoutStore;
use serde::Serialize;
use serde_json::{json, Value};
use time::OffsetDateTime;
use ulid::Ulid;

/// Registry as driven by the CLI: SQLite backed, clock pinned per invocation.
pub type CliRegistry = LockoutRegistry<SqliteLockoutStore, ManualClock>;

#[derive(Debug, Parser)]
#[command(name = "lockouts")]
#[command(about = "Expedition lockout registry CLI")]
pub struct Cli {
    #[arg(long, default_value = "./expedition_lockouts.sqlite3")]
    db: PathBuf,

    /// Surface store failures instead of treating them as "no lockout".
    #[arg(long)]
    fail_closed: bool,

    /// Evaluate expiry as of this RFC3339 UTC instant instead of now.
    #[arg(long)]
    as_of: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Expedition {
        #[command(subcommand)]
        command: Box<ExpeditionCommand>,
    },
    Lockout {
        #[command(subcommand)]
        command: Box<LockoutCommand>,
    },
    Pending {
        #[command(subcommand)]
        command: Box<PendingCommand>,
    },
    /// Delete every expired lockout row.
    Purge,
}

#[derive(Debug, Subcommand)]
pub enum ExpeditionCommand {
    Create(ExpeditionCreateArgs),
    Show(ExpeditionIdArgs),
    List,
    AddMember(MemberArgs),
    RemoveMember(MemberArgs),
}

#[derive(Debug, Args)]
pub struct ExpeditionCreateArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    leader: u32,
    #[arg(long, default_value_t = 1)]
    min_players: u32,
    #[arg(long, default_value_t = 6)]
    max_players: u32,
    #[arg(long)]
    uuid: Option<String>,
    #[arg(long = "member")]
    members: Vec<u32>,
}

#[derive(Debug, Args)]
pub struct ExpeditionIdArgs {
    #[arg(long)]
    id: u32,
}

#[derive(Debug, Args)]
pub struct MemberArgs {
    #[arg(long)]
    id: u32,
    #[arg(long)]
    character: u32,
}

#[derive(Debug, Subcommand)]
pub enum LockoutCommand {
    List(LockoutListArgs),
    Check(LockoutCheckArgs),
    Apply(LockoutApplyArgs),
    Remove(LockoutRemoveArgs),
    /// Remove one event lockout from an expedition's own record.
    ClearEvent(ClearEventArgs),
    Hydrate(HydrateArgs),
}

#[derive(Debug, Args)]
pub struct LockoutListArgs {
    #[arg(long)]
    character: u32,
    #[arg(long)]
    expedition_name: Option<String>,
}

#[derive(Debug, Args)]
pub struct LockoutCheckArgs {
    #[arg(long)]
    character: u32,
    #[arg(long)]
    expedition_name: String,
    #[arg(long)]
    event: String,
}

#[derive(Debug, Args)]
pub struct LockoutApplyArgs {
    #[arg(long)]
    expedition_id: u32,
    #[arg(long)]
    event: String,
    /// Lockout length in seconds.
    #[arg(long)]
    duration: u32,
    /// Defaults to the expedition's current members.
    #[arg(long = "member")]
    members: Vec<u32>,
}

#[derive(Debug, Args)]
pub struct LockoutRemoveArgs {
    #[arg(long = "character", required = true)]
    characters: Vec<u32>,
    #[arg(long)]
    expedition_name: Option<String>,
    #[arg(long, requires = "expedition_name")]
    event: Option<String>,
}

#[derive(Debug, Args)]
pub struct ClearEventArgs {
    #[arg(long)]
    expedition_id: u32,
    #[arg(long)]
    event: String,
}

#[derive(Debug, Args)]
pub struct HydrateArgs {
    /// Defaults to every known expedition.
    #[arg(long = "expedition-id")]
    expedition_ids: Vec<u32>,
}

#[derive(Debug, Subcommand)]
pub enum PendingCommand {
    Reserve(PendingReserveArgs),
    Confirm(PendingConfirmArgs),
    Discard(PendingDiscardArgs),
}

#[derive(Debug, Args)]
pub struct PendingReserveArgs {
    #[arg(long)]
    expedition_id: u32,
    #[arg(long = "event", required = true)]
    events: Vec<String>,
    /// Lockout length in seconds, shared by every event.
    #[arg(long)]
    duration: u32,
    /// Defaults to the expedition's current members.
    #[arg(long = "member")]
    members: Vec<u32>,
}

#[derive(Debug, Args)]
pub struct PendingConfirmArgs {
    #[arg(long)]
    expedition_id: u32,
    /// Defaults to the expedition's current members.
    #[arg(long = "member")]
    members: Vec<u32>,
}

#[derive(Debug, Args)]
pub struct PendingDiscardArgs {
    #[arg(long = "member", required = true)]
    members: Vec<u32>,
}

#[derive(Debug, Serialize)]
pub struct RemainingView {
    pub days: u64,
    pub hours: u64,
    pub minutes: u64,
}

#[derive(Debug, Serialize)]
pub struct LockoutView {
    pub origin_expedition_uuid: String,
    pub expedition_name: String,
    pub event_name: String,
    pub expire_at: String,
    pub duration: u32,
    pub seconds_remaining: u64,
    pub remaining: RemainingView,
    pub replay_timer: bool,
}

impl LockoutView {
    fn from_entry(entry: &LockoutEntry, now: OffsetDateTime) -> Result<Self> {
        let (days, hours, minutes) = entry.remaining_parts(now);
        Ok(Self {
            origin_expedition_uuid: entry.origin_expedition_uuid.clone(),
            expedition_name: entry.expedition_name.clone(),
            event_name: entry.event_name.clone(),
            expire_at: format_rfc3339(entry.expire_at)?,
            duration: entry.duration,
            seconds_remaining: entry.seconds_remaining(now),
            remaining: RemainingView {
                days,
                hours,
                minutes,
            },
            replay_timer: entry.is_replay_timer(),
        })
    }
}

#[derive(Debug, Serialize)]
pub struct LockoutCheckView {
    pub character_id: CharacterId,
    pub expedition_name: String,
    pub event_name: String,
    pub as_of: String,
    pub locked_out: bool,
    pub state: &'static str,
    pub lockout: Option<LockoutView>,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when `--as-of` is invalid, the store cannot be opened or
/// migrated, or the command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let as_of = cli
        .as_of
        .as_deref()
        .map(parse_rfc3339_utc)
        .transpose()?;
    let config = RegistryConfig {
        failure_policy: if cli.fail_closed {
            FailurePolicy::Closed
        } else {
            FailurePolicy::Open
        },
    };
    run_command_with_db(&cli.db, config, as_of, cli.command)
}

/// Executes a parsed command against the `SQLite` DB at `db_path`.
///
/// # Errors
/// Returns an error when store open/migrate fails or the command fails.
pub fn run_command_with_db(
    db_path: &Path,
    config: RegistryConfig,
    as_of: Option<OffsetDateTime>,
    command: Command,
) -> Result<()> {
    let store = SqliteLockoutStore::open(db_path)?;
    store.migrate()?;
    tracing::debug!(
        db = %db_path.display(),
        failure_policy = ?config.failure_policy,
        pinned = as_of.is_some(),
        "opened lockout store"
    );
    let clock = ManualClock::new(as_of.unwrap_or_else(now_utc));
    let mut registry = LockoutRegistry::with_clock(store, clock, config);
    run_command(command, &mut registry)
}

/// Executes a parsed command against an existing registry and prints the
/// JSON result.
///
/// # Errors
/// Returns an error when validation, persistence, or lookup fails.
pub fn run_command(command: Command, registry: &mut CliRegistry) -> Result<()> {
    let output = execute_command(command, registry)?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Executes a parsed command and returns its JSON document.
///
/// # Errors
/// Returns an error when validation, persistence, or lookup fails.
pub fn execute_command(command: Command, registry: &mut CliRegistry) -> Result<Value> {
    match command {
        Command::Expedition { command } => run_expedition(*command, registry),
        Command::Lockout { command } => run_lockout(*command, registry),
        Command::Pending { command } => run_pending(*command, registry),
        Command::Purge => {
            let purged = registry.purge_expired()?;
            Ok(json!({
                "purged": purged,
                "as_of": format_rfc3339(registry.now())?,
            }))
        }
    }
}

fn run_expedition(command: ExpeditionCommand, registry: &mut CliRegistry) -> Result<Value> {
    match command {
        ExpeditionCommand::Create(args) => {
            let uuid = args.uuid.unwrap_or_else(|| Ulid::new().to_string());
            let store = registry.store_mut();
            let expedition_id = store.create_expedition(
                &uuid,
                &args.name,
                CharacterId(args.leader),
                args.min_players,
                args.max_players,
            )?;
            store.add_members(expedition_id, &character_ids(&args.members))?;
            Ok(serde_json::to_value(load_record(registry, expedition_id)?)?)
        }
        ExpeditionCommand::Show(args) => Ok(serde_json::to_value(load_record(
            registry,
            ExpeditionId(args.id),
        )?)?),
        ExpeditionCommand::List => Ok(serde_json::to_value(
            registry.store().load_all_expeditions()?,
        )?),
        ExpeditionCommand::AddMember(args) => {
            let expedition_id = ExpeditionId(args.id);
            load_record(registry, expedition_id)?;
            registry
                .store_mut()
                .add_member(expedition_id, CharacterId(args.character))?;
            Ok(serde_json::to_value(load_record(registry, expedition_id)?)?)
        }
        ExpeditionCommand::RemoveMember(args) => {
            let expedition_id = ExpeditionId(args.id);
            registry
                .store_mut()
                .remove_member(expedition_id, CharacterId(args.character))?;
            Ok(serde_json::to_value(load_record(registry, expedition_id)?)?)
        }
    }
}

fn run_lockout(command: LockoutCommand, registry: &mut CliRegistry) -> Result<Value> {
    let now = registry.now();
    match command {
        LockoutCommand::List(args) => {
            let character_id = CharacterId(args.character);
            let lockouts = match args.expedition_name.as_deref() {
                Some(name) => registry.get_character_lockouts_in(character_id, name)?,
                None => registry.get_character_lockouts(character_id)?,
            };
            Ok(json!({
                "character_id": character_id,
                "as_of": format_rfc3339(now)?,
                "lockouts": views_by_event(&lockouts, now)?,
            }))
        }
        LockoutCommand::Check(args) => {
            let character_id = CharacterId(args.character);
            let locked_out =
                registry.is_locked_out(character_id, &args.expedition_name, &args.event);
            let slot = registry.lockout_state(character_id, &args.expedition_name, &args.event)?;
            let view = LockoutCheckView {
                character_id,
                expedition_name: args.expedition_name,
                event_name: args.event,
                as_of: format_rfc3339(now)?,
                locked_out,
                state: slot_label(&slot),
                lockout: slot
                    .entry()
                    .map(|entry| LockoutView::from_entry(entry, now))
                    .transpose()?,
            };
            Ok(serde_json::to_value(view)?)
        }
        LockoutCommand::Apply(args) => {
            let record = load_record(registry, ExpeditionId(args.expedition_id))?;
            let members = members_or_current(&args.members, &record);
            let lockout = LockoutEntry::new(
                record.uuid.clone(),
                record.expedition_name.clone(),
                args.event,
                args.duration,
                now,
            );
            registry.apply_lockout_on_event(record.id, &members, &lockout)?;
            Ok(json!({
                "expedition_id": record.id,
                "members": members,
                "lockout": LockoutView::from_entry(&lockout, now)?,
            }))
        }
        LockoutCommand::Remove(args) => {
            let characters = character_ids(&args.characters);
            match (args.expedition_name.as_deref(), args.event.as_deref()) {
                (Some(name), Some(event)) => {
                    registry.remove_members_lockout(&characters, name, event)?;
                }
                (name, _) => {
                    for character_id in &characters {
                        registry.remove_character_lockouts(*character_id, name)?;
                    }
                }
            }
            Ok(json!({
                "removed": {
                    "characters": characters,
                    "expedition_name": args.expedition_name,
                    "event_name": args.event,
                }
            }))
        }
        LockoutCommand::ClearEvent(args) => {
            let expedition_id = ExpeditionId(args.expedition_id);
            registry.remove_event_lockout(expedition_id, &args.event)?;
            Ok(json!({
                "expedition_id": expedition_id,
                "event_name": args.event,
                "removed": true,
            }))
        }
        LockoutCommand::Hydrate(args) => {
            let expedition_ids: BTreeSet<ExpeditionId> = if args.expedition_ids.is_empty() {
                registry
                    .store()
                    .load_all_expeditions()?
                    .into_iter()
                    .map(|record| record.id)
                    .collect()
            } else {
                args.expedition_ids.iter().copied().map(ExpeditionId).collect()
            };

            let hydrated = registry.hydrate_all(&expedition_ids)?;
            let mut expeditions = BTreeMap::new();
            for (expedition_id, lockouts) in &hydrated {
                expeditions.insert(expedition_id.to_string(), views_by_event(lockouts, now)?);
            }
            Ok(json!({
                "as_of": format_rfc3339(now)?,
                "expeditions": expeditions,
            }))
        }
    }
}

fn run_pending(command: PendingCommand, registry: &mut CliRegistry) -> Result<Value> {
    let now = registry.now();
    match command {
        PendingCommand::Reserve(args) => {
            let record = load_record(registry, ExpeditionId(args.expedition_id))?;
            let members = members_or_current(&args.members, &record);
            let lockouts: Vec<LockoutEntry> = args
                .events
                .iter()
                .map(|event| {
                    LockoutEntry::new(
                        record.uuid.clone(),
                        record.expedition_name.clone(),
                        event.clone(),
                        args.duration,
                        now,
                    )
                })
                .collect();

            let reservation = registry.reserve(&record.expedition_name, &members, &lockouts)?;
            // resolved by a later `pending confirm` or `pending discard`
            let (expedition_name, members) = reservation.into_parts();
            Ok(json!({
                "expedition_name": expedition_name,
                "members": members,
                "state": "pending",
                "lockouts": lockouts
                    .iter()
                    .map(|entry| LockoutView::from_entry(entry, now))
                    .collect::<Result<Vec<_>>>()?,
            }))
        }
        PendingCommand::Confirm(args) => {
            let record = load_record(registry, ExpeditionId(args.expedition_id))?;
            let members = members_or_current(&args.members, &record);
            registry.confirm_members(&record.expedition_name, &members)?;
            Ok(json!({
                "expedition_name": record.expedition_name,
                "members": members,
                "state": "confirmed",
            }))
        }
        PendingCommand::Discard(args) => {
            let members = character_ids(&args.members);
            registry.discard_members(&members)?;
            Ok(json!({
                "members": members,
                "state": "discarded",
            }))
        }
    }
}

fn load_record(registry: &CliRegistry, expedition_id: ExpeditionId) -> Result<ExpeditionRecord> {
    registry
        .store()
        .load_expedition(expedition_id)?
        .ok_or_else(|| anyhow!("expedition {expedition_id} not found"))
}

fn members_or_current(members: &[u32], record: &ExpeditionRecord) -> Vec<CharacterId> {
    if members.is_empty() {
        record.members.clone()
    } else {
        character_ids(members)
    }
}

fn character_ids(raw: &[u32]) -> Vec<CharacterId> {
    raw.iter().copied().map(CharacterId).collect()
}

fn views_by_event(
    lockouts: &BTreeMap<String, LockoutEntry>,
    now: OffsetDateTime,
) -> Result<BTreeMap<String, LockoutView>> {
    lockouts
        .iter()
        .map(|(event_name, entry)| Ok((event_name.clone(), LockoutView::from_entry(entry, now)?)))
        .collect()
}

fn slot_label(slot: &KeyState) -> &'static str {
    match slot.state() {
        Some(state) => state.as_str(),
        None => "absent",
    }
}
