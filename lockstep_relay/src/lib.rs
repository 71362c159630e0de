// lockstep_relay: authoritative relay for lockstep simulations.
//
// The relay keeps several independent simulation instances in agreement by
// funnelling every state-changing command through one authority that stamps
// it with an execution tick, appends it to an ordered log and rebroadcasts it
// to everyone. It never runs the simulation; clients apply commands and report
// fingerprints, and the relay paces them with a shared tick ceiling.
//
// Module overview:
// - `transport.rs`:     Raw frame transports (TCP, in-process loopback).
// - `connection.rs`:    `Link` (thread-safe sending half), `Connection` (frame
//                       reassembly, state machine, dispatch) and `drive`, the
//                       per-connection reader loop.
// - `wait.rs`:          Cooperative await layer: linear handshake code that
//                       suspends until a specific packet kind arrives.
// - `server_states.rs`: Relay lifecycle states and their route tables.
// - `context.rs`:       `ServerContext`, the shared state every relay thread
//                       works against, and the session-level operations.
// - `registry.rs`:      Participants, roles, latency, broadcast fan-out.
// - `command_log.rs`:   Per-scope append-only command logs.
// - `clock.rs`:         Authoritative tick and the clock thread.
// - `desync.rs`:        Fingerprint comparison and trace exchange.
// - `checkpoint.rs`:    Join points persisted to disk.
// - `server.rs`:        Listener thread, `start_relay`, `RelayHandle`.
// - `client.rs`:        Client side of the protocol (`NetClient`).
// - `config.rs`:        `RelayConfig`.
// - `error.rs`:         `ConnError` and friends.
//
// Dependencies: `lockstep_protocol` for the wire format, `parking_lot` locks
// around shared state, `tracing` for logs. Connections run on plain threads;
// the await layer polls a `futures` `LocalPool` from the connection's own
// reader thread.
//
// The relay can run as a standalone binary (`main.rs`) or be embedded in a
// host process via `start_relay`.

pub mod checkpoint;
pub mod client;
pub mod clock;
pub mod command_log;
pub mod config;
pub mod connection;
pub mod context;
pub mod desync;
pub mod error;
pub mod registry;
pub mod server;
pub mod server_states;
pub mod transport;
pub mod wait;

pub use client::{ClientError, ClientEvent, ClientOptions, NetClient};
pub use config::RelayConfig;
pub use context::ServerContext;
pub use error::{CommandRejected, ConnError};
pub use server::{RelayHandle, start_relay};
