// Message bodies for client-relay communication.
//
// Each packet kind in `packet.rs` has one body type here. Bodies are JSON
// encoded (`encode_body` / `decode_body`), matching the rest of the project's
// serde_json usage, with three exceptions that carry bulk bytes:
// - `ServerPacket::WorldData` is the raw snapshot blob.
// - `ClientPacket::WorldUpload` is an 8-byte big-endian tick followed by the
//   raw snapshot blob (`encode_world_upload` / `decode_world_upload`).
// - The out-of-band disconnect is a single reason byte
//   (`DisconnectReason::to_byte` / `from_byte`), so it can be decoded in any
//   state without a body codec.
//
// Command payloads, snapshots and traces are opaque to the relay.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::command::ScheduledCommand;
use crate::types::{FactionId, MapId, PlayerId, PlayerStatus, Role, Scope};

/// Serialize a message body.
pub fn encode_body<T: Serialize>(body: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(body)
}

/// Deserialize a message body.
pub fn decode_body<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, serde_json::Error> {
    serde_json::from_slice(bytes)
}

/// Why a connection is being closed. Sent as one byte with kind 63.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    ProtocolMismatch,
    BadUsername,
    BadCredentials,
    AlreadyConnected,
    Kicked,
    ServerFull,
    ShuttingDown,
    ManifestMismatch,
    ProtocolFault,
    InternalFault,
    /// The peer is leaving on purpose.
    Quit,
}

impl DisconnectReason {
    const ALL: [DisconnectReason; 11] = [
        DisconnectReason::ProtocolMismatch,
        DisconnectReason::BadUsername,
        DisconnectReason::BadCredentials,
        DisconnectReason::AlreadyConnected,
        DisconnectReason::Kicked,
        DisconnectReason::ServerFull,
        DisconnectReason::ShuttingDown,
        DisconnectReason::ManifestMismatch,
        DisconnectReason::ProtocolFault,
        DisconnectReason::InternalFault,
        DisconnectReason::Quit,
    ];

    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Unknown codes decode as `InternalFault`.
    pub fn from_byte(byte: u8) -> Self {
        Self::ALL
            .get(usize::from(byte))
            .copied()
            .unwrap_or(DisconnectReason::InternalFault)
    }
}

// ---------------------------------------------------------------------------
// Client → relay
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolHello {
    pub protocol_version: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Login {
    pub username: String,
    pub password: Option<String>,
    /// Join as a non-player referee.
    pub arbiter: bool,
}

/// Capability / version manifest. The first participant's manifest becomes
/// the session reference.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinManifest {
    pub sim_version_hash: u64,
    pub config_hash: u64,
    pub capabilities: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepAliveReply {
    pub id: u32,
    /// Last tick the client has simulated.
    pub sim_tick: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CursorUpdate {
    pub map: MapId,
    pub x: f32,
    pub z: f32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionUpdate {
    pub map: MapId,
    pub selected: Vec<u64>,
}

/// A fingerprint of simulation state over an interval starting at
/// `start_tick`, optionally with a detailed trace for diagnosis.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOpinion {
    pub start_tick: u64,
    pub digest: u64,
    pub trace: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceRequest {
    /// Whose trace is wanted; `None` means the host's.
    pub target: Option<PlayerId>,
    pub start_tick: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceResponse {
    pub request_id: u32,
    /// `None` if the participant no longer has a trace for that interval.
    pub trace: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetFaction {
    pub player: PlayerId,
    pub faction: FactionId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Freeze {
    pub frozen: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatText {
    pub text: String,
}

/// Bodyless packets (`WorldRequest`, `WorldLoaded`, `RequestRejoin`,
/// `AcceptRequest`, `Accepted`).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

/// Encode a host's join point upload.
pub fn encode_world_upload(tick: u64, snapshot: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + snapshot.len());
    out.extend_from_slice(&tick.to_be_bytes());
    out.extend_from_slice(snapshot);
    out
}

/// Split a join point upload into `(tick, snapshot)`.
pub fn decode_world_upload(bytes: &[u8]) -> Option<(u64, &[u8])> {
    if bytes.len() < 8 {
        return None;
    }
    let (tick, snapshot) = bytes.split_at(8);
    let mut buf = [0u8; 8];
    buf.copy_from_slice(tick);
    Some((u64::from_be_bytes(buf), snapshot))
}

// ---------------------------------------------------------------------------
// Relay → client
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsernameOk {
    pub player_id: PlayerId,
    pub username: String,
}

/// Public view of a participant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub id: PlayerId,
    pub username: String,
    pub faction: FactionId,
    pub role: Role,
    pub status: PlayerStatus,
    pub latency_ms: u32,
    pub ticks_behind: u64,
}

/// Session parameters handed out at the end of the handshake.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinInfo {
    pub player_id: PlayerId,
    pub session_name: String,
    pub role: Role,
    pub faction: FactionId,
    pub players: Vec<PlayerInfo>,
    pub scheduling_delay: u64,
}

/// One scope's replayed log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeCommands {
    pub scope: Scope,
    pub commands: Vec<ScheduledCommand>,
}

/// Header of a world transfer. The snapshot follows as `WorldData`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldDataStart {
    /// Tick the snapshot was taken at; replayed commands all execute at or
    /// after it.
    pub join_tick: u64,
    /// Authoritative tick when the transfer began.
    pub tick: u64,
    pub snapshot_len: u64,
    pub logs: Vec<ScopeCommands>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatBroadcast {
    pub from: PlayerId,
    pub name: String,
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepAlive {
    pub id: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CursorBroadcast {
    pub player: PlayerId,
    pub map: MapId,
    pub x: f32,
    pub z: f32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionBroadcast {
    pub player: PlayerId,
    pub map: MapId,
    pub selected: Vec<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyEntry {
    pub player: PlayerId,
    pub latency_ms: u32,
    pub ticks_behind: u64,
}

/// Incremental change to the participant list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlayerListDelta {
    Add(PlayerInfo),
    Remove(PlayerId),
    Status { player: PlayerId, status: PlayerStatus },
    Role { player: PlayerId, role: Role },
    Latencies(Vec<LatencyEntry>),
}

/// Simulation ceiling. Clients run ticks strictly below `ceiling`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeControl {
    pub ceiling: u64,
    pub frozen: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesyncDetected {
    pub start_tick: u64,
    pub players: Vec<PlayerId>,
}

/// Relay asks a participant for its detailed trace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceQuery {
    pub request_id: u32,
    pub start_tick: u64,
}

/// A trace forwarded to the participant that asked for it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceTransfer {
    pub source: PlayerId,
    pub start_tick: u64,
    pub trace: Option<String>,
}
