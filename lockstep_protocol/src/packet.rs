// Packet kind catalogue.
//
// Two enums, one per direction, map kinds to their 6-bit wire values:
// - `ClientPacket`: client → relay.
// - `ServerPacket`: relay → client.
//
// The numbering spaces overlap on purpose; a connection only ever decodes one
// direction. Kind 63 is the out-of-band disconnect in both catalogues.
//
// Each kind also declares its delivery class. Best-effort kinds (cursor and
// selection telemetry) may be sent over an unreliable channel; a receiver that
// has no handler for one simply drops it. Fragmentability is *not* declared
// here: the receiving state's route table owns that decision (see
// `lockstep_relay::connection`).

use std::fmt::Debug;

use crate::wire::SPECIAL_DISCONNECT;

/// How a packet travels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Ordered, guaranteed delivery.
    Reliable,
    /// May be lost, duplicated or late.
    Unreliable,
}

/// Common behaviour of both packet catalogues.
pub trait PacketKind: Copy + Eq + Debug + Send + Sync + 'static {
    fn from_u8(value: u8) -> Option<Self>;
    fn as_u8(self) -> u8;
    fn delivery(self) -> Delivery;
}

macro_rules! packet_kinds {
    (
        $(#[$meta:meta])*
        $name:ident {
            $($(#[$vmeta:meta])* $variant:ident = $value:expr $(=> $delivery:ident)?,)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum $name {
            $($(#[$vmeta])* $variant = $value,)*
        }

        impl PacketKind for $name {
            fn from_u8(value: u8) -> Option<Self> {
                match value {
                    $(v if v == $value => Some(Self::$variant),)*
                    _ => None,
                }
            }

            fn as_u8(self) -> u8 {
                self as u8
            }

            fn delivery(self) -> Delivery {
                match self {
                    $(Self::$variant => packet_kinds!(@delivery $($delivery)?),)*
                }
            }
        }
    };
    (@delivery) => { Delivery::Reliable };
    (@delivery $delivery:ident) => { Delivery::$delivery };
}

packet_kinds! {
    /// Packets sent by a client to the relay.
    ClientPacket {
        /// Protocol version announce; first packet of the handshake.
        Protocol = 0,
        Username = 1,
        /// Capability / version manifest.
        JoinData = 2,
        /// Handshake finished, please start the world transfer.
        WorldRequest = 3,
        /// World transfer applied; ready to play.
        WorldLoaded = 4,
        Command = 5,
        Chat = 6,
        /// Keep-alive reply carrying the client's current tick.
        KeepAlive = 7,
        Cursor = 8 => Unreliable,
        Selection = 9 => Unreliable,
        SyncOpinion = 10,
        TraceRequest = 11,
        TraceResponse = 12,
        SetFaction = 13,
        Freeze = 14,
        /// Join point snapshot from the host.
        WorldUpload = 15,
        RequestRejoin = 16,
        /// Accept handshake for transports that need one before `Protocol`.
        AcceptRequest = 17,
        Disconnect = SPECIAL_DISCONNECT,
    }
}

packet_kinds! {
    /// Packets sent by the relay to a client.
    ServerPacket {
        ProtocolOk = 0,
        UsernameOk = 1,
        JoinData = 2,
        /// World transfer header: join tick and replayed command logs.
        WorldDataStart = 3,
        /// Raw snapshot bytes.
        WorldData = 4,
        Command = 5,
        Chat = 6,
        KeepAlive = 7,
        Cursor = 8 => Unreliable,
        Selection = 9 => Unreliable,
        PlayerList = 10,
        /// Simulation ceiling and freeze flag.
        TimeControl = 11,
        DesyncDetected = 12,
        TraceRequest = 13,
        TraceTransfer = 14,
        SetFaction = 15,
        Accepted = 16,
        Disconnect = SPECIAL_DISCONNECT,
    }
}
