// Core ID types for the lockstep protocol.
//
// Lightweight newtypes shared by `message.rs`, `command.rs` and the relay's
// registry and command log. They are relay-scoped identifiers: the relay hands
// out compact integer player IDs, factions are opaque integers owned by the
// simulation, and maps ("sub-worlds") are named by the simulation too.
//
// `Scope` is the namespace a command or command log belongs to. Ordering is
// derived so scopes can key a `BTreeMap`; the relay relies on that map order
// when it locks every scope log for a join replay.

use serde::{Deserialize, Serialize};

/// Version of the packet catalogue. Bumped whenever a kind or body changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Relay-assigned player ID (compact u32, never reused within a session).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlayerId(pub u32);

/// Faction / ownership identifier as understood by the simulation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FactionId(pub u32);

impl FactionId {
    /// Faction every regular player starts in.
    pub const SHARED: FactionId = FactionId(0);
    /// Faction used for the relay's own commands and for arbiters.
    pub const SPECTATOR: FactionId = FactionId(u32::MAX);
}

/// Sub-world identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MapId(pub u32);

/// Namespace of a command log: the global log or one sub-world's log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Scope {
    Global,
    Map(MapId),
}

/// What a participant is in the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Regular,
    /// Administrative participant; may freeze the clock, reassign factions
    /// and upload join points.
    Host,
    /// Non-player participant that only cross-validates simulation state.
    Arbiter,
}

/// Lifecycle status of a participant as seen by everyone else.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlayerStatus {
    Connecting,
    Loading,
    Playing,
}
