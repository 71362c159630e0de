// lockstep_protocol: wire protocol for the lockstep relay.
//
// This crate defines everything both ends of a connection must agree on, with
// no knowledge of sockets, threads or session state. It is shared by the relay
// server and its clients (`lockstep_relay`).
//
// Module overview:
// - `wire.rs`:     One-byte frame header codec (6-bit kind, 2-bit fragment tag).
// - `fragment.rs`: Splitting messages into frames and reassembling them, with
//                  the chunk and message size ceilings (`FrameLimits`).
// - `framing.rs`:  Length-delimited packet framing for byte-stream transports.
// - `packet.rs`:   Packet kind catalogues for both directions, with delivery
//                  class (reliable / best-effort).
// - `message.rs`:  Message bodies and their JSON codec; disconnect reasons.
// - `command.rs`:  Command kinds, scope rules, scheduled commands.
// - `types.rs`:    ID newtypes, `Scope`, `Role`, `PlayerStatus`.
// - `error.rs`:    `FrameError`.
//
// Design decisions:
// - **Binary frames, JSON bodies.** The frame layer is a fixed binary format so
//   fragmentation and kind dispatch never touch the body codec. Bodies stay
//   serde_json; bulk payloads (snapshots) skip JSON entirely.
// - **Opaque payloads.** Command payloads, snapshots and traces are bytes or
//   strings the relay never inspects.
// - **No async runtime.** Framing works over `std::io::Read`/`Write`.

pub mod command;
pub mod error;
pub mod fragment;
pub mod framing;
pub mod message;
pub mod packet;
pub mod types;
pub mod wire;

pub use command::{CommandKind, CommandRequest, ScheduledCommand, ScopeRule};
pub use error::FrameError;
pub use fragment::{CHUNK_SIZE, FrameLimits, MAX_MESSAGE_SIZE, RawMessage, Reassembler, fragment};
pub use framing::{read_packet, write_packet};
pub use message::{DisconnectReason, decode_body, encode_body};
pub use packet::{ClientPacket, Delivery, PacketKind, ServerPacket};
pub use types::{FactionId, MapId, PROTOCOL_VERSION, PlayerId, PlayerStatus, Role, Scope};
pub use wire::{FragTag, SPECIAL_DISCONNECT, decode_header, encode_header};

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::message::{TimeControl, WorldDataStart};

    /// Fragment a body, stream-frame every fragment, read them back and
    /// reassemble. This is the full send path a TCP connection uses.
    fn through_stream(kind: ServerPacket, payload: &[u8], limits: FrameLimits) -> RawMessage {
        let mut wire = Vec::new();
        for frame in fragment(kind.as_u8(), payload, &limits).unwrap() {
            write_packet(&mut wire, &frame, limits.max_frame_size()).unwrap();
        }

        let mut cursor = Cursor::new(&wire);
        let mut reassembler = Reassembler::new(limits);
        loop {
            let frame = read_packet(&mut cursor, limits.max_frame_size()).unwrap();
            if let Some(msg) = reassembler.push(&frame, |_| true).unwrap() {
                return msg;
            }
        }
    }

    #[test]
    fn time_control_through_stream() {
        let body = TimeControl {
            ceiling: 115,
            frozen: false,
        };
        let msg = through_stream(
            ServerPacket::TimeControl,
            &encode_body(&body).unwrap(),
            FrameLimits::default(),
        );
        assert_eq!(msg.kind, ServerPacket::TimeControl.as_u8());
        assert_eq!(decode_body::<TimeControl>(&msg.payload).unwrap(), body);
    }

    #[test]
    fn large_world_header_through_stream() {
        let limits = FrameLimits {
            chunk_size: 256,
            max_message_size: 1 << 20,
        };
        let commands = (0..50)
            .map(|seq| ScheduledCommand {
                seq,
                kind: CommandKind::Sync,
                scope: Scope::Global,
                origin_faction: FactionId::SHARED,
                execute_at_tick: 15 + seq,
                payload: vec![seq as u8; 20],
            })
            .collect();
        let header = WorldDataStart {
            join_tick: 0,
            tick: 64,
            snapshot_len: 0,
            logs: vec![message::ScopeCommands {
                scope: Scope::Global,
                commands,
            }],
        };
        let msg = through_stream(
            ServerPacket::WorldDataStart,
            &encode_body(&header).unwrap(),
            limits,
        );
        assert_eq!(decode_body::<WorldDataStart>(&msg.payload).unwrap(), header);
    }
}
