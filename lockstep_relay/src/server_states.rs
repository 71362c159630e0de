// Relay-side connection states.
//
// `ServerSide` plugs the relay into the generic state machine of
// `connection.rs`. Lifecycle:
//
//   PreAccept ─AcceptRequest─▶ Joining ─WorldRequest─▶ Loading ─WorldLoaded─▶ Playing
//                                                         ▲                     │
//                                                         └────RequestRejoin────┘
//
// Any state can end in `Disconnected`. TCP connections start in `Joining`;
// transports that need an explicit accept step (`RelayHandle::attach`) start in
// `PreAccept`.
//
// `Joining` is written as one cooperative task: wait for the protocol version,
// then the login, then the manifest, then the world request. `Loading` sends the
// world from its start hook and waits for `WorldLoaded` with the cleanup
// variant, so the clock hold taken for the joiner is always released. `Playing`
// is a plain route table; every method decodes its body and hands it to
// `ServerContext`.

use std::sync::Arc;

use bytes::Bytes;
use lockstep_protocol::message::{
    ChatText, CursorBroadcast, CursorUpdate, Empty, Freeze, JoinManifest, KeepAliveReply, Login,
    ProtocolHello, SelectionBroadcast, SelectionUpdate, SetFaction, SyncOpinion, TraceRequest,
    TraceResponse, UsernameOk, decode_world_upload,
};
use lockstep_protocol::{
    ClientPacket, CommandRequest, DisconnectReason, PROTOCOL_VERSION, PlayerId, PlayerStatus,
    ServerPacket, decode_body,
};
use tracing::{debug, info, warn};

use crate::connection::{
    ConnWaiter, Connection, ErasedHandler, Lifecycle, Route, Side, StateHandler,
};
use crate::context::ServerContext;
use crate::error::ConnError;
use crate::registry::{Audience, ServerLink};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    PreAccept,
    Joining,
    Loading,
    Playing,
    Disconnected,
}

impl Lifecycle for ServerState {
    const TERMINAL: Self = ServerState::Disconnected;
}

pub struct ServerSide;

pub type ServerConn = Connection<ServerSide>;

impl Side for ServerSide {
    type State = ServerState;
    type Inbound = ClientPacket;
    type Outbound = ServerPacket;
    type Context = ServerContext;

    fn handler_for(state: ServerState) -> Option<Box<dyn ErasedHandler<Self>>> {
        match state {
            ServerState::PreAccept => Some(Box::new(PreAccept)),
            ServerState::Joining => Some(Box::new(Joining)),
            ServerState::Loading => Some(Box::new(Loading)),
            ServerState::Playing => Some(Box::new(Playing)),
            ServerState::Disconnected => None,
        }
    }

    fn on_teardown(conn: &mut ServerConn, _cause: &ConnError) {
        if let Some(player) = conn.link().player() {
            conn.ctx().remove_player(player);
        }
    }
}

fn player_of(conn: &ServerConn) -> Result<PlayerId, ConnError> {
    conn.link()
        .player()
        .ok_or(ConnError::Internal("connection has no player identity"))
}

// ---------------------------------------------------------------------------
// PreAccept
// ---------------------------------------------------------------------------

struct PreAccept;

impl PreAccept {
    fn on_accept_request(&mut self, conn: &mut ServerConn, _: Bytes) -> Result<(), ConnError> {
        conn.link().send(ServerPacket::Accepted, &Empty {})?;
        conn.transition(ServerState::Joining);
        Ok(())
    }
}

impl StateHandler for PreAccept {
    type Side = ServerSide;
    const STATE: ServerState = ServerState::PreAccept;
    const ROUTES: &'static [Route<Self>] = &[Route {
        kind: ClientPacket::AcceptRequest,
        fragmentable: false,
        method: Self::on_accept_request,
    }];
}

// ---------------------------------------------------------------------------
// Joining
// ---------------------------------------------------------------------------

struct Joining;

async fn handshake(
    waiter: ConnWaiter<ServerSide>,
    link: ServerLink,
    ctx: Arc<ServerContext>,
) -> Result<(), ConnError> {
    let hello: ProtocolHello = decode_body(&waiter.wait_for(ClientPacket::Protocol)?.await)?;
    if hello.protocol_version != PROTOCOL_VERSION {
        return Err(ConnError::Refused(DisconnectReason::ProtocolMismatch));
    }
    link.send(ServerPacket::ProtocolOk, &Empty {})?;

    let login: Login = decode_body(&waiter.wait_for(ClientPacket::Username)?.await)?;
    let info = ctx.admit(&login, &link)?;
    link.set_identity(&info.username, info.id);
    link.send(
        ServerPacket::UsernameOk,
        &UsernameOk {
            player_id: info.id,
            username: info.username.clone(),
        },
    )?;

    let manifest: JoinManifest = decode_body(&waiter.wait_for(ClientPacket::JoinData)?.await)?;
    ctx.check_manifest(&manifest)?;
    link.send(ServerPacket::JoinData, &ctx.join_info(info.id)?)?;

    waiter.wait_for(ClientPacket::WorldRequest)?.await;
    waiter.transition(ServerState::Loading);
    Ok(())
}

impl StateHandler for Joining {
    type Side = ServerSide;
    const STATE: ServerState = ServerState::Joining;
    const ROUTES: &'static [Route<Self>] = &[];

    fn start(&mut self, conn: &mut ServerConn) -> Result<(), ConnError> {
        let task = handshake(conn.waiter(), conn.link().clone(), Arc::clone(conn.ctx()));
        conn.spawn(task)
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

struct Loading;

impl Loading {
    fn on_keep_alive(&mut self, conn: &mut ServerConn, payload: Bytes) -> Result<(), ConnError> {
        let reply: KeepAliveReply = decode_body(&payload)?;
        conn.ctx().record_keepalive(player_of(conn)?, &reply);
        Ok(())
    }

    fn on_trace_response(&mut self, conn: &mut ServerConn, payload: Bytes) -> Result<(), ConnError> {
        let response: TraceResponse = decode_body(&payload)?;
        conn.ctx().complete_trace(player_of(conn)?, response);
        Ok(())
    }

    fn on_chat(&mut self, conn: &mut ServerConn, payload: Bytes) -> Result<(), ConnError> {
        let chat: ChatText = decode_body(&payload)?;
        conn.ctx().chat(player_of(conn)?, chat.text);
        Ok(())
    }

    /// Play traffic sent before the participant saw its rejoin take effect.
    fn on_play_in_flight(&mut self, conn: &mut ServerConn, _: Bytes) -> Result<(), ConnError> {
        debug!(player = ?conn.link().player(), "play message during world transfer dropped");
        Ok(())
    }
}

impl StateHandler for Loading {
    type Side = ServerSide;
    const STATE: ServerState = ServerState::Loading;
    const ROUTES: &'static [Route<Self>] = &[
        Route {
            kind: ClientPacket::KeepAlive,
            fragmentable: false,
            method: Self::on_keep_alive,
        },
        Route {
            kind: ClientPacket::TraceResponse,
            fragmentable: true,
            method: Self::on_trace_response,
        },
        Route {
            kind: ClientPacket::Chat,
            fragmentable: false,
            method: Self::on_chat,
        },
        Route {
            kind: ClientPacket::Command,
            fragmentable: true,
            method: Self::on_play_in_flight,
        },
        Route {
            kind: ClientPacket::SyncOpinion,
            fragmentable: true,
            method: Self::on_play_in_flight,
        },
        Route {
            kind: ClientPacket::Cursor,
            fragmentable: false,
            method: Self::on_play_in_flight,
        },
        Route {
            kind: ClientPacket::Selection,
            fragmentable: false,
            method: Self::on_play_in_flight,
        },
        Route {
            kind: ClientPacket::TraceRequest,
            fragmentable: false,
            method: Self::on_play_in_flight,
        },
        Route {
            kind: ClientPacket::SetFaction,
            fragmentable: false,
            method: Self::on_play_in_flight,
        },
        Route {
            kind: ClientPacket::Freeze,
            fragmentable: false,
            method: Self::on_play_in_flight,
        },
        Route {
            kind: ClientPacket::WorldUpload,
            fragmentable: true,
            method: Self::on_play_in_flight,
        },
    ];

    fn start(&mut self, conn: &mut ServerConn) -> Result<(), ConnError> {
        let player = player_of(conn)?;
        let ctx = Arc::clone(conn.ctx());
        let hold = ctx.config.pause_on_join.then(|| ctx.clock.hold());
        ctx.registry.set_status(player, PlayerStatus::Loading);
        ctx.begin_world_transfer(player, conn.link())?;

        let waiter = conn.waiter();
        conn.spawn(async move {
            let loaded = waiter.wait_or_none(ClientPacket::WorldLoaded)?.await;
            drop(hold);
            if loaded.is_some() {
                waiter.transition(ServerState::Playing);
            }
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// Playing
// ---------------------------------------------------------------------------

struct Playing;

impl Playing {
    fn on_command(&mut self, conn: &mut ServerConn, payload: Bytes) -> Result<(), ConnError> {
        let request: CommandRequest = decode_body(&payload)?;
        let player = player_of(conn)?;
        if let Err(rejected) = conn.ctx().submit_command(player, request) {
            warn!(?player, %rejected, "command rejected");
        }
        Ok(())
    }

    fn on_chat(&mut self, conn: &mut ServerConn, payload: Bytes) -> Result<(), ConnError> {
        let chat: ChatText = decode_body(&payload)?;
        conn.ctx().chat(player_of(conn)?, chat.text);
        Ok(())
    }

    fn on_keep_alive(&mut self, conn: &mut ServerConn, payload: Bytes) -> Result<(), ConnError> {
        let reply: KeepAliveReply = decode_body(&payload)?;
        conn.ctx().record_keepalive(player_of(conn)?, &reply);
        Ok(())
    }

    fn on_cursor(&mut self, conn: &mut ServerConn, payload: Bytes) -> Result<(), ConnError> {
        let update: CursorUpdate = decode_body(&payload)?;
        let player = player_of(conn)?;
        let cursor = CursorBroadcast {
            player,
            map: update.map,
            x: update.x,
            z: update.z,
        };
        conn.ctx().registry.broadcast(
            Audience::PlayingExcept(player),
            ServerPacket::Cursor,
            &cursor,
        );
        Ok(())
    }

    fn on_selection(&mut self, conn: &mut ServerConn, payload: Bytes) -> Result<(), ConnError> {
        let update: SelectionUpdate = decode_body(&payload)?;
        let player = player_of(conn)?;
        let selection = SelectionBroadcast {
            player,
            map: update.map,
            selected: update.selected,
        };
        conn.ctx().registry.broadcast(
            Audience::PlayingExcept(player),
            ServerPacket::Selection,
            &selection,
        );
        Ok(())
    }

    fn on_sync_opinion(&mut self, conn: &mut ServerConn, payload: Bytes) -> Result<(), ConnError> {
        let opinion: SyncOpinion = decode_body(&payload)?;
        conn.ctx().submit_opinion(player_of(conn)?, opinion);
        Ok(())
    }

    fn on_trace_request(&mut self, conn: &mut ServerConn, payload: Bytes) -> Result<(), ConnError> {
        let request: TraceRequest = decode_body(&payload)?;
        conn.ctx().request_trace(player_of(conn)?, request);
        Ok(())
    }

    fn on_trace_response(&mut self, conn: &mut ServerConn, payload: Bytes) -> Result<(), ConnError> {
        let response: TraceResponse = decode_body(&payload)?;
        conn.ctx().complete_trace(player_of(conn)?, response);
        Ok(())
    }

    fn on_set_faction(&mut self, conn: &mut ServerConn, payload: Bytes) -> Result<(), ConnError> {
        let change: SetFaction = decode_body(&payload)?;
        conn.ctx().set_faction(player_of(conn)?, change);
        Ok(())
    }

    fn on_freeze(&mut self, conn: &mut ServerConn, payload: Bytes) -> Result<(), ConnError> {
        let freeze: Freeze = decode_body(&payload)?;
        conn.ctx().freeze(player_of(conn)?, freeze.frozen);
        Ok(())
    }

    fn on_world_upload(&mut self, conn: &mut ServerConn, payload: Bytes) -> Result<(), ConnError> {
        let (join_tick, snapshot) =
            decode_world_upload(&payload).ok_or(ConnError::Malformed("world upload"))?;
        let snapshot = payload.slice_ref(snapshot);
        conn.ctx()
            .upload_join_point(player_of(conn)?, join_tick, snapshot);
        Ok(())
    }

    fn on_request_rejoin(&mut self, conn: &mut ServerConn, _: Bytes) -> Result<(), ConnError> {
        let player = player_of(conn)?;
        info!(?player, "rejoin requested");
        conn.ctx().registry.set_receives_commands(player, false);
        conn.transition(ServerState::Loading);
        Ok(())
    }
}

impl StateHandler for Playing {
    type Side = ServerSide;
    const STATE: ServerState = ServerState::Playing;
    const ROUTES: &'static [Route<Self>] = &[
        Route {
            kind: ClientPacket::Command,
            fragmentable: true,
            method: Self::on_command,
        },
        Route {
            kind: ClientPacket::Chat,
            fragmentable: false,
            method: Self::on_chat,
        },
        Route {
            kind: ClientPacket::KeepAlive,
            fragmentable: false,
            method: Self::on_keep_alive,
        },
        Route {
            kind: ClientPacket::Cursor,
            fragmentable: false,
            method: Self::on_cursor,
        },
        Route {
            kind: ClientPacket::Selection,
            fragmentable: false,
            method: Self::on_selection,
        },
        Route {
            kind: ClientPacket::SyncOpinion,
            fragmentable: true,
            method: Self::on_sync_opinion,
        },
        Route {
            kind: ClientPacket::TraceRequest,
            fragmentable: false,
            method: Self::on_trace_request,
        },
        Route {
            kind: ClientPacket::TraceResponse,
            fragmentable: true,
            method: Self::on_trace_response,
        },
        Route {
            kind: ClientPacket::SetFaction,
            fragmentable: false,
            method: Self::on_set_faction,
        },
        Route {
            kind: ClientPacket::Freeze,
            fragmentable: false,
            method: Self::on_freeze,
        },
        Route {
            kind: ClientPacket::WorldUpload,
            fragmentable: true,
            method: Self::on_world_upload,
        },
        Route {
            kind: ClientPacket::RequestRejoin,
            fragmentable: false,
            method: Self::on_request_rejoin,
        },
    ];

    fn start(&mut self, conn: &mut ServerConn) -> Result<(), ConnError> {
        let player = player_of(conn)?;
        debug!(?player, "entering play");
        conn.ctx().enter_playing(player, conn.link())
    }
}
