// Authoritative command log.
//
// One append-only sequence per scope: the global log plus one per map. Every
// accepted command is stamped with `execute_at_tick = tick + scheduling_delay`
// and the next sequence number of its scope, appended, and broadcast to every
// participant that has received the world. All three happen under the scope's
// mutex, so append order, sequence order and broadcast order are the same
// thing for every observer.
//
// Lock order (outermost first): clock read lock, scope map, scope mutexes in
// `Scope` order, registry. `submit` holds the clock read lock across the whole
// append so the clock cannot announce a ceiling past `execute_at_tick` before
// the command is on the wire. `with_locked` holds every scope mutex at once for
// join replays, so a joiner's replay and its subsequent live stream meet
// without gap or duplicate.
//
// Pruning (join points) drops entries a fresh joiner no longer needs. It never
// touches what was already broadcast; participants keep their own copies.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use lockstep_protocol::message::ScopeCommands;
use lockstep_protocol::{CommandKind, FactionId, PlayerId, ScheduledCommand, Scope, ScopeRule};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::clock::Clock;
use crate::error::CommandRejected;
use crate::registry::Registry;

#[derive(Default)]
struct ScopeLog {
    next_seq: u64,
    entries: VecDeque<ScheduledCommand>,
}

/// A command the relay has decided to accept, before stamping.
#[derive(Clone, Debug)]
pub struct NewCommand {
    pub kind: CommandKind,
    pub scope: Scope,
    pub origin_faction: FactionId,
    pub payload: Vec<u8>,
}

/// Persisted form of one scope's log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedScope {
    pub scope: Scope,
    pub next_seq: u64,
    pub commands: Vec<ScheduledCommand>,
}

pub struct CommandLog {
    scopes: RwLock<BTreeMap<Scope, Arc<Mutex<ScopeLog>>>>,
    echo_to_origin: bool,
}

/// Check a command's scope against its kind. Global kinds that name a map are
/// moved to the global log; map kinds without a map cannot be placed.
pub fn resolve_scope(kind: CommandKind, scope: Scope) -> Result<Scope, CommandRejected> {
    match (kind.scope_rule(), scope) {
        (ScopeRule::Global, Scope::Map(map)) => {
            warn!(?kind, ?map, "global command carried a map scope; moved to global log");
            Ok(Scope::Global)
        }
        (ScopeRule::Map, Scope::Global) => Err(CommandRejected::MapKindWithoutMap(kind)),
        _ => Ok(scope),
    }
}

impl CommandLog {
    pub fn new(echo_to_origin: bool) -> Self {
        Self {
            scopes: RwLock::new(BTreeMap::new()),
            echo_to_origin,
        }
    }

    fn scope_log(&self, scope: Scope) -> Arc<Mutex<ScopeLog>> {
        if let Some(log) = self.scopes.read().get(&scope) {
            return Arc::clone(log);
        }
        Arc::clone(self.scopes.write().entry(scope).or_default())
    }

    /// Stamp, append and broadcast one command. `origin` is the submitting
    /// participant (`None` for relay-issued commands); it is skipped by the
    /// broadcast unless echoing is on.
    pub fn submit(
        &self,
        clock: &Clock,
        registry: &Registry,
        command: NewCommand,
        origin: Option<PlayerId>,
    ) -> Result<ScheduledCommand, CommandRejected> {
        let scope = resolve_scope(command.kind, command.scope)?;
        let tick = clock.read();
        let log = self.scope_log(scope);
        let mut log = log.lock();

        let scheduled = ScheduledCommand {
            seq: log.next_seq,
            kind: command.kind,
            scope,
            origin_faction: command.origin_faction,
            execute_at_tick: clock.ceiling(*tick),
            payload: command.payload,
        };
        log.next_seq += 1;
        log.entries.push_back(scheduled.clone());

        let skip = if self.echo_to_origin { None } else { origin };
        registry.broadcast_command(&scheduled, skip);
        Ok(scheduled)
    }

    /// Run `f` over a consistent copy of every log while all appends are
    /// blocked. Whatever `f` sends reaches the peer before any later command.
    pub fn with_locked<R>(&self, f: impl FnOnce(Vec<ScopeCommands>) -> R) -> R {
        let scopes = self.scopes.read();
        let guards: Vec<_> = scopes
            .iter()
            .map(|(scope, log)| (*scope, log.lock()))
            .collect();
        let logs = guards
            .iter()
            .map(|(scope, log)| ScopeCommands {
                scope: *scope,
                commands: log.entries.iter().cloned().collect(),
            })
            .collect();
        f(logs)
    }

    pub fn entries(&self, scope: Scope) -> Vec<ScheduledCommand> {
        let scopes = self.scopes.read();
        scopes
            .get(&scope)
            .map(|log| log.lock().entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop every entry that executes before `join_tick`.
    pub fn prune_before(&self, join_tick: u64) -> usize {
        let scopes = self.scopes.read();
        let mut dropped = 0;
        for log in scopes.values() {
            let mut log = log.lock();
            let before = log.entries.len();
            log.entries.retain(|c| c.execute_at_tick >= join_tick);
            dropped += before - log.entries.len();
        }
        dropped
    }

    pub fn save(&self) -> Vec<SavedScope> {
        let scopes = self.scopes.read();
        scopes
            .iter()
            .map(|(scope, log)| {
                let log = log.lock();
                SavedScope {
                    scope: *scope,
                    next_seq: log.next_seq,
                    commands: log.entries.iter().cloned().collect(),
                }
            })
            .collect()
    }

    /// Replace every log with saved state.
    pub fn restore(&self, saved: Vec<SavedScope>) {
        let mut scopes = self.scopes.write();
        scopes.clear();
        for saved in saved {
            let log = ScopeLog {
                next_seq: saved.next_seq,
                entries: saved.commands.into(),
            };
            scopes.insert(saved.scope, Arc::new(Mutex::new(log)));
        }
    }

    /// Retained entries across all scopes.
    pub fn len(&self) -> usize {
        let scopes = self.scopes.read();
        scopes.values().map(|log| log.lock().entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
