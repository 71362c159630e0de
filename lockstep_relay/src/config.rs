// Relay configuration.
//
// Every field has a default, so a JSON config file only needs the keys it
// changes (`#[serde(default)]`). The `relay` binary layers CLI flags on top of
// the optional file; embedders and tests build a `RelayConfig` directly.

use std::io;
use std::path::{Path, PathBuf};

use lockstep_protocol::FrameLimits;
use serde::{Deserialize, Serialize};

use crate::transport::DEFAULT_OUTBOUND_QUEUE;

/// Configuration for starting a relay server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub bind_address: String,
    pub port: u16,
    pub session_name: String,
    pub password: Option<String>,
    /// Regular participants allowed at once. Arbiters do not count.
    pub max_players: u32,
    /// Ticks between acceptance and execution of a command.
    pub scheduling_delay: u64,
    /// Wall-clock period of the clock loop.
    pub clock_period_ms: u64,
    /// Authoritative ticks added per clock period.
    pub ticks_per_period: u64,
    /// Tick the clock starts from (ignored when resuming a checkpoint).
    pub start_tick: u64,
    pub max_command_payload: usize,
    /// Send accepted commands back to their originator too.
    pub echo_to_origin: bool,
    /// Hold the clock while anyone is loading the world.
    pub pause_on_join: bool,
    /// Sync opinions retained per participant.
    pub opinion_capacity: usize,
    /// Clock periods between keep-alive probes.
    pub keepalive_periods: u64,
    /// Ask the host for a join point every this many ticks.
    pub join_point_interval: Option<u64>,
    /// Where join points are written as checkpoints.
    pub checkpoint_path: Option<PathBuf>,
    /// Restore clock, join point and logs from `checkpoint_path` on start.
    pub resume: bool,
    pub chunk_size: usize,
    pub max_message_size: usize,
    /// Frames queued per TCP peer before it is dropped as stalled.
    pub outbound_queue_frames: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let limits = FrameLimits::default();
        Self {
            bind_address: "127.0.0.1".into(),
            port: 7878,
            session_name: "lockstep-session".into(),
            password: None,
            max_players: 8,
            scheduling_delay: 15,
            clock_period_ms: 50,
            ticks_per_period: 3,
            start_tick: 0,
            max_command_payload: 64 * 1024,
            echo_to_origin: true,
            pause_on_join: true,
            opinion_capacity: 32,
            keepalive_periods: 20,
            join_point_interval: None,
            checkpoint_path: None,
            resume: false,
            chunk_size: limits.chunk_size,
            max_message_size: limits.max_message_size,
            outbound_queue_frames: DEFAULT_OUTBOUND_QUEUE,
        }
    }
}

impl RelayConfig {
    pub fn from_json_file(path: &Path) -> io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn frame_limits(&self) -> FrameLimits {
        FrameLimits {
            chunk_size: self.chunk_size,
            max_message_size: self.max_message_size,
        }
    }
}
