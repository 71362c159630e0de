// Scheduled commands: the unit of lockstep agreement.
//
// A client submits a `CommandRequest`; the relay validates it, stamps an
// execution tick, appends it to exactly one scope's log and rebroadcasts the
// resulting `ScheduledCommand` to every participant (the originator
// included). Clients apply commands only from that rebroadcast, in log order,
// at `execute_at_tick`.
//
// `CommandKind` is deliberately coarse: the relay never interprets payloads,
// it only needs to know which scope a kind belongs to and whether clients may
// issue it at all.

use serde::{Deserialize, Serialize};

use crate::types::{FactionId, Scope};

/// What a command does, at the granularity the relay cares about.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    /// A synchronised simulation call; valid in either scope.
    Sync,
    /// Global simulation speed change.
    SetSpeed,
    /// Per-map simulation speed change.
    MapSpeed,
    /// Map-local designation (build orders, zones, ...).
    Designator,
    /// Global pause of every map.
    PauseAll,
    /// Debug tooling; valid in either scope.
    Debug,
    /// Relay-issued: the host snapshots state at this tick and uploads it.
    CreateJoinPoint,
    /// Relay-issued: a faction's first participant started playing.
    FactionOnline,
    /// Relay-issued: a faction's participant left.
    FactionOffline,
}

/// Which scopes a command kind may target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScopeRule {
    Global,
    Map,
    Either,
}

impl CommandKind {
    pub fn scope_rule(self) -> ScopeRule {
        match self {
            CommandKind::SetSpeed
            | CommandKind::PauseAll
            | CommandKind::CreateJoinPoint
            | CommandKind::FactionOnline
            | CommandKind::FactionOffline => ScopeRule::Global,
            CommandKind::MapSpeed | CommandKind::Designator => ScopeRule::Map,
            CommandKind::Sync | CommandKind::Debug => ScopeRule::Either,
        }
    }

    /// Kinds only the relay itself may append.
    pub fn server_only(self) -> bool {
        matches!(
            self,
            CommandKind::CreateJoinPoint | CommandKind::FactionOnline | CommandKind::FactionOffline
        )
    }
}

/// A client's request to schedule a command.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub kind: CommandKind,
    pub scope: Scope,
    pub payload: Vec<u8>,
}

/// An accepted command, immutable once created.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledCommand {
    /// Position in its scope's log, starting at 0 and gapless.
    pub seq: u64,
    pub kind: CommandKind,
    pub scope: Scope,
    pub origin_faction: FactionId,
    pub execute_at_tick: u64,
    pub payload: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_issued_kinds_are_global() {
        for kind in [
            CommandKind::CreateJoinPoint,
            CommandKind::FactionOnline,
            CommandKind::FactionOffline,
        ] {
            assert!(kind.server_only());
            assert_eq!(kind.scope_rule(), ScopeRule::Global);
        }
        assert!(!CommandKind::SetSpeed.server_only());
    }
}
