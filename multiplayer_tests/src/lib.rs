// Test-only game client for multiplayer integration tests.
//
// Wraps the real `NetClient` (from `lockstep_relay::client`) around a small
// deterministic simulation (`ToySim`) to provide a synchronous, test-friendly
// API for exercising the whole lockstep pipeline:
// join → world transfer → command → scheduled tick → sim step → compare.
//
// `ToySim` keeps one counter per scope. Commands carry a JSON `ToyAction`;
// add and multiply do not commute, so two sims only agree if they applied
// the same commands at the same ticks in the same order. Relay-issued
// commands are honoured too: faction online/offline toggles a set of factions
// and the host answers join point requests by uploading its snapshot.
//
// The only test-specific code here is the synchronous polling wrappers
// (blocking loops around `NetClient::recv_timeout`). Networking uses the
// same code paths as a real embedder.
//
// See also: `tests/full_pipeline.rs` for the integration test scenarios.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use lockstep_protocol::message::{DesyncDetected, ScopeCommands, TraceTransfer};
use lockstep_protocol::{CommandKind, PlayerId, Role, ScheduledCommand, Scope};
use lockstep_relay::{ClientEvent, ClientOptions, NetClient};
use serde::{Deserialize, Serialize};

/// Default timeout for blocking poll operations.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Wait between poll attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Payload of a player command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToyAction {
    Add(i64),
    Multiply(i64),
}

/// Minimal deterministic simulation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToySim {
    /// Next tick to execute.
    pub tick: u64,
    pub global: i64,
    /// Per-map counters, keyed by map id.
    pub maps: BTreeMap<u32, i64>,
    pub online_factions: BTreeSet<u32>,
}

impl ToySim {
    /// Restore from a join point. An empty snapshot is the initial state.
    pub fn from_snapshot(join_tick: u64, snapshot: &[u8]) -> Self {
        let mut sim = if snapshot.is_empty() {
            ToySim::default()
        } else {
            serde_json::from_slice(snapshot).expect("corrupt snapshot")
        };
        sim.tick = join_tick;
        sim
    }

    pub fn snapshot(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("serialize ToySim failed")
    }

    pub fn fingerprint(&self) -> u64 {
        u64::from(crc32fast::hash(&self.snapshot()))
    }

    pub fn apply(&mut self, command: &ScheduledCommand) {
        match command.kind {
            CommandKind::Sync | CommandKind::Designator => {
                let action: ToyAction =
                    serde_json::from_slice(&command.payload).expect("bad action payload");
                let counter = match command.scope {
                    Scope::Global => &mut self.global,
                    Scope::Map(map) => self.maps.entry(map.0).or_insert(0),
                };
                *counter = match action {
                    ToyAction::Add(n) => counter.wrapping_add(n),
                    ToyAction::Multiply(n) => counter.wrapping_mul(n),
                };
            }
            CommandKind::FactionOnline | CommandKind::FactionOffline => {
                let bytes: [u8; 4] = command.payload[..4].try_into().expect("faction payload");
                let faction = u32::from_be_bytes(bytes);
                if command.kind == CommandKind::FactionOnline {
                    self.online_factions.insert(faction);
                } else {
                    self.online_factions.remove(&faction);
                }
            }
            _ => {}
        }
    }
}

/// A test game client wrapping a real `NetClient` and a `ToySim`.
pub struct TestGameClient {
    client: NetClient,
    pub player: PlayerId,
    pub role: Role,
    pub sim: ToySim,
    pub playing: bool,
    /// Exclusive upper bound on ticks we may execute.
    pub ceiling: u64,
    /// Commands not yet executed, in execution order.
    pending: BTreeMap<(u64, Scope, u64), ScheduledCommand>,
    /// Every player command ever seen, by (scope, seq).
    seen: BTreeMap<(Scope, u64), ScheduledCommand>,
    pub desyncs: Vec<DesyncDetected>,
    pub traces: Vec<TraceTransfer>,
    pub uploads: Vec<u64>,
    pub disconnected: bool,
}

impl TestGameClient {
    /// Connect, complete the handshake and wait until playing.
    pub fn connect(addr: SocketAddr, name: &str) -> Self {
        let (client, info) = NetClient::connect(addr, ClientOptions::new(name))
            .expect("TestGameClient::connect failed");
        let mut this = Self {
            client,
            player: info.player_id,
            role: info.role,
            sim: ToySim::default(),
            playing: false,
            ceiling: 0,
            pending: BTreeMap::new(),
            seen: BTreeMap::new(),
            desyncs: Vec::new(),
            traces: Vec::new(),
            uploads: Vec::new(),
            disconnected: false,
        };
        this.wait_until("playing", |c| c.playing);
        this
    }

    pub fn send(&mut self, scope: Scope, action: ToyAction) {
        let kind = match scope {
            Scope::Global => CommandKind::Sync,
            Scope::Map(_) => CommandKind::Designator,
        };
        let payload = serde_json::to_vec(&action).expect("serialize ToyAction failed");
        self.client
            .send_command(kind, scope, payload)
            .expect("send_command failed");
    }

    /// Drain and handle every queued event. Does not advance the sim.
    pub fn pump(&mut self) {
        for event in self.client.poll() {
            self.handle(event);
        }
    }

    fn handle(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::WorldReceived {
                join_tick,
                snapshot,
                logs,
                ..
            } => self.load_world(join_tick, &snapshot, logs),
            ClientEvent::Playing => self.playing = true,
            ClientEvent::Command(command) => self.schedule(command),
            ClientEvent::TimeControl(control) => self.ceiling = control.ceiling,
            ClientEvent::Desync(report) => self.desyncs.push(report),
            ClientEvent::TraceTransfer(transfer) => self.traces.push(transfer),
            ClientEvent::Disconnected(_) => self.disconnected = true,
            _ => {}
        }
    }

    fn load_world(&mut self, join_tick: u64, snapshot: &[u8], logs: Vec<ScopeCommands>) {
        self.playing = false;
        self.sim = ToySim::from_snapshot(join_tick, snapshot);
        self.pending.clear();
        for command in logs.into_iter().flat_map(|log| log.commands) {
            self.schedule(command);
        }
    }

    fn schedule(&mut self, command: ScheduledCommand) {
        assert!(
            command.execute_at_tick >= self.sim.tick,
            "command for tick {} arrived at tick {}",
            command.execute_at_tick,
            self.sim.tick
        );
        if matches!(command.kind, CommandKind::Sync | CommandKind::Designator) {
            self.seen
                .insert((command.scope, command.seq), command.clone());
        }
        self.pending.insert(
            (command.execute_at_tick, command.scope, command.seq),
            command,
        );
    }

    /// Execute ticks below both the ceiling and `target`.
    pub fn advance(&mut self, target: u64) {
        while self.playing && self.sim.tick < self.ceiling.min(target) {
            let tick = self.sim.tick;
            let due: Vec<ScheduledCommand> = self
                .pending
                .range((tick, Scope::Global, 0)..)
                .take_while(|((at, _, _), _)| *at == tick)
                .map(|(_, c)| c.clone())
                .collect();
            if self.role == Role::Host
                && due.iter().any(|c| c.kind == CommandKind::CreateJoinPoint)
            {
                // Join points are the state at the start of the tick.
                self.client
                    .upload_world(tick, &self.sim.snapshot())
                    .expect("upload_world failed");
                self.uploads.push(tick);
            }
            for command in &due {
                self.sim.apply(command);
                self.pending
                    .remove(&(command.execute_at_tick, command.scope, command.seq));
            }
            self.sim.tick += 1;
        }
        self.client.report_tick(self.sim.tick);
    }

    /// Block until the sim has executed every tick below `target`.
    pub fn run_until(&mut self, target: u64) {
        self.wait_until("target tick", |c| {
            c.advance(target);
            c.sim.tick >= target
        });
    }

    /// Block until `count` player commands have been received.
    pub fn wait_for_commands(&mut self, count: usize) -> Vec<ScheduledCommand> {
        self.wait_until("commands", |c| c.seen.len() >= count);
        self.seen_commands()
    }

    /// Player commands received so far, ordered by scope and seq.
    pub fn seen_commands(&self) -> Vec<ScheduledCommand> {
        self.seen.values().cloned().collect()
    }

    /// Pump events until `done` holds.
    pub fn wait_until(&mut self, what: &str, mut done: impl FnMut(&mut Self) -> bool) {
        let start = Instant::now();
        loop {
            self.pump();
            if done(self) {
                return;
            }
            assert!(
                start.elapsed() < POLL_TIMEOUT,
                "timed out waiting for {what}"
            );
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    pub fn submit_opinion(&mut self) {
        let state = String::from_utf8(self.sim.snapshot()).expect("snapshot is JSON");
        self.client
            .submit_opinion(self.sim.tick, self.sim.fingerprint(), Some(state))
            .expect("submit_opinion failed");
    }

    pub fn request_trace(&mut self, target: Option<PlayerId>, start_tick: u64) {
        self.client
            .request_trace(target, start_tick)
            .expect("request_trace failed");
    }

    pub fn request_rejoin(&mut self) {
        self.client.request_rejoin().expect("request_rejoin failed");
        self.playing = false;
    }

    pub fn disconnect(self) {
        self.client.disconnect();
    }
}
