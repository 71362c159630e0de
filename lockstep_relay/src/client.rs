// Client side of the relay protocol.
//
// `NetClient` is what a simulation host embeds to talk to the relay. Its
// connection runs the same state machine as the relay's (`connection.rs`),
// with `ClientSide` supplying mirror-image states:
//
//   PreAccept ─Accepted─▶ Joining ─(handshake)─▶ Loading ─WorldData─▶ Playing
//                                                   ▲                   │
//                                                   └──WorldDataStart───┘ (rejoin)
//
// Architecture:
// - A background reader thread owns the `Connection` and runs `drive`. Every
//   message the simulation cares about is pushed into an `mpsc` inbox as a
//   `ClientEvent`.
// - The calling thread sends through the shared `Link` and drains the inbox
//   with `poll()` / `recv_timeout()`, so it never blocks on network reads.
// - Keep-alive probes and trace queries are answered by the reader thread
//   itself, from the last tick reported with `report_tick` and the opinions
//   recorded by `submit_opinion`.
//
// `connect` blocks until the handshake is done (`JoinInfo` received) or fails.
// The world arrives afterwards as `ClientEvent::WorldReceived`.

use std::collections::VecDeque;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use lockstep_protocol::message::{
    ChatBroadcast, ChatText, CursorBroadcast, CursorUpdate, DesyncDetected, Empty, Freeze,
    JoinInfo, JoinManifest, KeepAlive, KeepAliveReply, Login, PlayerListDelta, ProtocolHello,
    ScopeCommands, SelectionBroadcast, SelectionUpdate, SetFaction, SyncOpinion, TimeControl,
    TraceQuery, TraceRequest, TraceResponse, TraceTransfer, UsernameOk, WorldDataStart,
    encode_world_upload,
};
use lockstep_protocol::{
    ClientPacket, CommandKind, CommandRequest, DisconnectReason, FactionId, FrameLimits, MapId,
    PROTOCOL_VERSION, PlayerId, ScheduledCommand, Scope, ServerPacket, decode_body,
};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::connection::{
    ConnWaiter, Connection, ErasedHandler, Lifecycle, Link, Route, Side, StateHandler, drive,
};
use crate::error::ConnError;
use crate::transport::{DEFAULT_OUTBOUND_QUEUE, Transport, TransportReceiver, tcp_pair};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    PreAccept,
    Joining,
    Loading,
    Playing,
    Disconnected,
}

impl Lifecycle for ClientState {
    const TERMINAL: Self = ClientState::Disconnected;
}

/// How to join.
#[derive(Clone, Debug)]
pub struct ClientOptions {
    pub username: String,
    pub password: Option<String>,
    pub arbiter: bool,
    pub manifest: JoinManifest,
    /// Start with the explicit accept exchange (`RelayHandle::attach`).
    pub needs_accept: bool,
    /// Opinions kept locally for answering trace queries.
    pub opinion_capacity: usize,
    /// Send traces along with opinions instead of waiting to be asked.
    pub inline_traces: bool,
    pub handshake_timeout: Duration,
    pub limits: FrameLimits,
    /// Frames queued for the relay before the connection counts as stalled.
    pub outbound_queue_frames: usize,
}

impl ClientOptions {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: None,
            arbiter: false,
            manifest: JoinManifest {
                sim_version_hash: 0,
                config_hash: 0,
                capabilities: Vec::new(),
            },
            needs_accept: false,
            opinion_capacity: 32,
            inline_traces: false,
            handshake_timeout: Duration::from_secs(5),
            limits: FrameLimits::default(),
            outbound_queue_frames: DEFAULT_OUTBOUND_QUEUE,
        }
    }
}

/// Something the simulation host needs to know about.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientEvent {
    Joined(JoinInfo),
    /// The join point and the log replay. Apply `logs` on top of `snapshot`
    /// starting at `join_tick`.
    WorldReceived {
        join_tick: u64,
        tick: u64,
        snapshot: Bytes,
        logs: Vec<ScopeCommands>,
    },
    Playing,
    Command(ScheduledCommand),
    TimeControl(TimeControl),
    Chat(ChatBroadcast),
    PlayerList(PlayerListDelta),
    Cursor(CursorBroadcast),
    Selection(SelectionBroadcast),
    Desync(DesyncDetected),
    TraceTransfer(TraceTransfer),
    FactionChanged(SetFaction),
    Disconnected(DisconnectReason),
}

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
    #[error("refused by relay: {0:?}")]
    Refused(DisconnectReason),
    #[error("handshake timed out")]
    Timeout,
    #[error("connection closed")]
    Closed,
    #[error("not playing")]
    NotPlaying,
    #[error(transparent)]
    Conn(#[from] ConnError),
}

struct ClientShared {
    state: ClientState,
    player: Option<PlayerId>,
    sim_tick: u64,
    opinions: VecDeque<(u64, Option<String>)>,
    rejoin_header: Option<WorldDataStart>,
}

/// State shared between a `NetClient` and its reader thread.
pub struct ClientContext {
    options: ClientOptions,
    events: Sender<ClientEvent>,
    shared: Mutex<ClientShared>,
}

impl ClientContext {
    fn new(options: ClientOptions, events: Sender<ClientEvent>) -> Self {
        Self {
            options,
            events,
            shared: Mutex::new(ClientShared {
                state: ClientState::PreAccept,
                player: None,
                sim_tick: 0,
                opinions: VecDeque::new(),
                rejoin_header: None,
            }),
        }
    }

    fn emit(&self, event: ClientEvent) {
        // The receiving `NetClient` may already be gone.
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: ClientState) {
        self.shared.lock().state = state;
    }

    fn retained_trace(&self, start_tick: u64) -> Option<String> {
        let shared = self.shared.lock();
        shared
            .opinions
            .iter()
            .find(|(tick, _)| *tick == start_tick)
            .and_then(|(_, trace)| trace.clone())
    }
}

pub struct ClientSide;

type ClientConn = Connection<ClientSide>;
type ClientLink = Link<ClientPacket>;

impl Side for ClientSide {
    type State = ClientState;
    type Inbound = ServerPacket;
    type Outbound = ClientPacket;
    type Context = ClientContext;

    fn handler_for(state: ClientState) -> Option<Box<dyn ErasedHandler<Self>>> {
        match state {
            ClientState::PreAccept => Some(Box::new(PreAccept)),
            ClientState::Joining => Some(Box::new(Joining)),
            ClientState::Loading => Some(Box::new(Loading { header: None })),
            ClientState::Playing => Some(Box::new(Playing)),
            ClientState::Disconnected => None,
        }
    }

    fn on_teardown(conn: &mut ClientConn, cause: &ConnError) {
        let reason = match cause {
            ConnError::PeerClosed(reason) => *reason,
            other => other.disconnect_reason(),
        };
        conn.ctx().set_state(ClientState::Disconnected);
        conn.ctx().emit(ClientEvent::Disconnected(reason));
    }
}

// ---------------------------------------------------------------------------
// Routes shared by several states
// ---------------------------------------------------------------------------

fn on_chat<H>(_: &mut H, conn: &mut ClientConn, payload: Bytes) -> Result<(), ConnError>
where
    H: StateHandler<Side = ClientSide>,
{
    conn.ctx().emit(ClientEvent::Chat(decode_body(&payload)?));
    Ok(())
}

fn on_player_list<H>(_: &mut H, conn: &mut ClientConn, payload: Bytes) -> Result<(), ConnError>
where
    H: StateHandler<Side = ClientSide>,
{
    conn.ctx().emit(ClientEvent::PlayerList(decode_body(&payload)?));
    Ok(())
}

fn on_set_faction<H>(_: &mut H, conn: &mut ClientConn, payload: Bytes) -> Result<(), ConnError>
where
    H: StateHandler<Side = ClientSide>,
{
    conn.ctx()
        .emit(ClientEvent::FactionChanged(decode_body(&payload)?));
    Ok(())
}

fn on_command<H>(_: &mut H, conn: &mut ClientConn, payload: Bytes) -> Result<(), ConnError>
where
    H: StateHandler<Side = ClientSide>,
{
    conn.ctx().emit(ClientEvent::Command(decode_body(&payload)?));
    Ok(())
}

fn on_time_control<H>(_: &mut H, conn: &mut ClientConn, payload: Bytes) -> Result<(), ConnError>
where
    H: StateHandler<Side = ClientSide>,
{
    conn.ctx()
        .emit(ClientEvent::TimeControl(decode_body(&payload)?));
    Ok(())
}

fn on_keep_alive<H>(_: &mut H, conn: &mut ClientConn, payload: Bytes) -> Result<(), ConnError>
where
    H: StateHandler<Side = ClientSide>,
{
    let probe: KeepAlive = decode_body(&payload)?;
    let sim_tick = conn.ctx().shared.lock().sim_tick;
    conn.link().send(
        ClientPacket::KeepAlive,
        &KeepAliveReply {
            id: probe.id,
            sim_tick,
        },
    )
}

fn on_cursor<H>(_: &mut H, conn: &mut ClientConn, payload: Bytes) -> Result<(), ConnError>
where
    H: StateHandler<Side = ClientSide>,
{
    conn.ctx().emit(ClientEvent::Cursor(decode_body(&payload)?));
    Ok(())
}

fn on_selection<H>(_: &mut H, conn: &mut ClientConn, payload: Bytes) -> Result<(), ConnError>
where
    H: StateHandler<Side = ClientSide>,
{
    conn.ctx().emit(ClientEvent::Selection(decode_body(&payload)?));
    Ok(())
}

fn on_desync<H>(_: &mut H, conn: &mut ClientConn, payload: Bytes) -> Result<(), ConnError>
where
    H: StateHandler<Side = ClientSide>,
{
    conn.ctx().emit(ClientEvent::Desync(decode_body(&payload)?));
    Ok(())
}

fn on_trace_query<H>(_: &mut H, conn: &mut ClientConn, payload: Bytes) -> Result<(), ConnError>
where
    H: StateHandler<Side = ClientSide>,
{
    let query: TraceQuery = decode_body(&payload)?;
    let trace = conn.ctx().retained_trace(query.start_tick);
    debug!(start_tick = query.start_tick, found = trace.is_some(), "answering trace query");
    conn.link().send(
        ClientPacket::TraceResponse,
        &TraceResponse {
            request_id: query.request_id,
            trace,
        },
    )
}

fn on_trace_transfer<H>(_: &mut H, conn: &mut ClientConn, payload: Bytes) -> Result<(), ConnError>
where
    H: StateHandler<Side = ClientSide>,
{
    conn.ctx()
        .emit(ClientEvent::TraceTransfer(decode_body(&payload)?));
    Ok(())
}

/// Route table of a world-holding state: its own rows plus everything a
/// participant with the world receives.
macro_rules! world_routes {
    ($($kind:ident => $method:expr, $fragmentable:expr;)*) => {
        &[
            $(Route { kind: ServerPacket::$kind, fragmentable: $fragmentable, method: $method },)*
            Route { kind: ServerPacket::Command, fragmentable: true, method: on_command::<Self> },
            Route { kind: ServerPacket::Chat, fragmentable: false, method: on_chat::<Self> },
            Route { kind: ServerPacket::PlayerList, fragmentable: false, method: on_player_list::<Self> },
            Route { kind: ServerPacket::TimeControl, fragmentable: false, method: on_time_control::<Self> },
            Route { kind: ServerPacket::KeepAlive, fragmentable: false, method: on_keep_alive::<Self> },
            Route { kind: ServerPacket::Cursor, fragmentable: false, method: on_cursor::<Self> },
            Route { kind: ServerPacket::Selection, fragmentable: false, method: on_selection::<Self> },
            Route { kind: ServerPacket::DesyncDetected, fragmentable: false, method: on_desync::<Self> },
            Route { kind: ServerPacket::TraceRequest, fragmentable: false, method: on_trace_query::<Self> },
            Route { kind: ServerPacket::TraceTransfer, fragmentable: true, method: on_trace_transfer::<Self> },
            Route { kind: ServerPacket::SetFaction, fragmentable: false, method: on_set_faction::<Self> },
        ]
    };
}

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

struct PreAccept;

impl PreAccept {
    fn on_accepted(&mut self, conn: &mut ClientConn, _: Bytes) -> Result<(), ConnError> {
        conn.transition(ClientState::Joining);
        Ok(())
    }
}

impl StateHandler for PreAccept {
    type Side = ClientSide;
    const STATE: ClientState = ClientState::PreAccept;
    const ROUTES: &'static [Route<Self>] = &[Route {
        kind: ServerPacket::Accepted,
        fragmentable: false,
        method: Self::on_accepted,
    }];

    fn start(&mut self, conn: &mut ClientConn) -> Result<(), ConnError> {
        conn.ctx().set_state(ClientState::PreAccept);
        conn.link().send(ClientPacket::AcceptRequest, &Empty {})
    }
}

struct Joining;

async fn handshake(
    waiter: ConnWaiter<ClientSide>,
    link: ClientLink,
    ctx: Arc<ClientContext>,
) -> Result<(), ConnError> {
    let options = &ctx.options;
    link.send(
        ClientPacket::Protocol,
        &ProtocolHello {
            protocol_version: PROTOCOL_VERSION,
        },
    )?;
    waiter.wait_for(ServerPacket::ProtocolOk)?.await;

    link.send(
        ClientPacket::Username,
        &Login {
            username: options.username.clone(),
            password: options.password.clone(),
            arbiter: options.arbiter,
        },
    )?;
    let accepted: UsernameOk = decode_body(&waiter.wait_for(ServerPacket::UsernameOk)?.await)?;
    link.set_identity(&accepted.username, accepted.player_id);
    ctx.shared.lock().player = Some(accepted.player_id);

    link.send(ClientPacket::JoinData, &options.manifest)?;
    let info: JoinInfo = decode_body(&waiter.wait_for(ServerPacket::JoinData)?.await)?;
    info!(player = ?info.player_id, session = %info.session_name, "joined session");
    ctx.emit(ClientEvent::Joined(info));

    link.send(ClientPacket::WorldRequest, &Empty {})?;
    waiter.transition(ClientState::Loading);
    Ok(())
}

impl StateHandler for Joining {
    type Side = ClientSide;
    const STATE: ClientState = ClientState::Joining;
    const ROUTES: &'static [Route<Self>] = &[
        Route {
            kind: ServerPacket::PlayerList,
            fragmentable: false,
            method: on_player_list::<Self>,
        },
        Route {
            kind: ServerPacket::Chat,
            fragmentable: false,
            method: on_chat::<Self>,
        },
        Route {
            kind: ServerPacket::SetFaction,
            fragmentable: false,
            method: on_set_faction::<Self>,
        },
    ];

    fn start(&mut self, conn: &mut ClientConn) -> Result<(), ConnError> {
        conn.ctx().set_state(ClientState::Joining);
        let task = handshake(conn.waiter(), conn.link().clone(), Arc::clone(conn.ctx()));
        conn.spawn(task)
    }
}

struct Loading {
    header: Option<WorldDataStart>,
}

impl Loading {
    fn on_world_start(&mut self, _: &mut ClientConn, payload: Bytes) -> Result<(), ConnError> {
        self.header = Some(decode_body(&payload)?);
        Ok(())
    }

    fn on_world_data(&mut self, conn: &mut ClientConn, payload: Bytes) -> Result<(), ConnError> {
        let header = self
            .header
            .take()
            .ok_or(ConnError::Malformed("world data before its header"))?;
        if header.snapshot_len != payload.len() as u64 {
            return Err(ConnError::Malformed("world data length"));
        }
        conn.ctx().emit(ClientEvent::WorldReceived {
            join_tick: header.join_tick,
            tick: header.tick,
            snapshot: payload,
            logs: header.logs,
        });
        conn.link().send(ClientPacket::WorldLoaded, &Empty {})?;
        conn.transition(ClientState::Playing);
        Ok(())
    }
}

impl StateHandler for Loading {
    type Side = ClientSide;
    const STATE: ClientState = ClientState::Loading;
    const ROUTES: &'static [Route<Self>] = world_routes! {
        WorldDataStart => Self::on_world_start, true;
        WorldData => Self::on_world_data, true;
    };

    fn start(&mut self, conn: &mut ClientConn) -> Result<(), ConnError> {
        let mut shared = conn.ctx().shared.lock();
        shared.state = ClientState::Loading;
        self.header = shared.rejoin_header.take();
        Ok(())
    }
}

struct Playing;

impl Playing {
    /// The relay is resending the world after a rejoin request.
    fn on_world_start(&mut self, conn: &mut ClientConn, payload: Bytes) -> Result<(), ConnError> {
        let header: WorldDataStart = decode_body(&payload)?;
        conn.ctx().shared.lock().rejoin_header = Some(header);
        conn.transition(ClientState::Loading);
        Ok(())
    }
}

impl StateHandler for Playing {
    type Side = ClientSide;
    const STATE: ClientState = ClientState::Playing;
    const ROUTES: &'static [Route<Self>] = world_routes! {
        WorldDataStart => Self::on_world_start, true;
    };

    fn start(&mut self, conn: &mut ClientConn) -> Result<(), ConnError> {
        conn.ctx().set_state(ClientState::Playing);
        conn.ctx().emit(ClientEvent::Playing);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// NetClient
// ---------------------------------------------------------------------------

/// Connection to a relay, driven by a background reader thread.
pub struct NetClient {
    link: ClientLink,
    ctx: Arc<ClientContext>,
    inbox: Receiver<ClientEvent>,
    backlog: VecDeque<ClientEvent>,
    reader_thread: Option<JoinHandle<()>>,
}

impl NetClient {
    /// Connect over TCP and complete the handshake.
    pub fn connect(
        addr: impl ToSocketAddrs,
        options: ClientOptions,
    ) -> Result<(Self, JoinInfo), ClientError> {
        let stream = TcpStream::connect(addr)?;
        let (transport, receiver) =
            tcp_pair(stream, options.limits, options.outbound_queue_frames)?;
        Self::connect_with(transport, receiver, options)
    }

    /// Complete the handshake over an already connected transport.
    pub fn connect_with(
        transport: impl Transport + 'static,
        receiver: impl TransportReceiver + 'static,
        options: ClientOptions,
    ) -> Result<(Self, JoinInfo), ClientError> {
        let (tx, inbox) = mpsc::channel();
        let initial = if options.needs_accept {
            ClientState::PreAccept
        } else {
            ClientState::Joining
        };
        let timeout = options.handshake_timeout;
        let link = Link::new(Box::new(transport), options.limits);
        let ctx = Arc::new(ClientContext::new(options, tx));

        let reader_thread = {
            let link = link.clone();
            let ctx = Arc::clone(&ctx);
            let receiver: Box<dyn TransportReceiver> = Box::new(receiver);
            // The connection's task pool is thread-local; build it on its thread.
            thread::Builder::new()
                .name("relay-client".into())
                .spawn(move || {
                    let conn = Connection::<ClientSide>::new(link, ctx, initial);
                    drive(conn, receiver);
                })?
        };

        let mut client = Self {
            link,
            ctx,
            inbox,
            backlog: VecDeque::new(),
            reader_thread: Some(reader_thread),
        };
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match client.inbox.recv_timeout(remaining) {
                Ok(ClientEvent::Joined(info)) => return Ok((client, info)),
                Ok(ClientEvent::Disconnected(reason)) => return Err(ClientError::Refused(reason)),
                Ok(other) => client.backlog.push_back(other),
                Err(RecvTimeoutError::Timeout) => {
                    client.link.close(DisconnectReason::Quit);
                    return Err(ClientError::Timeout);
                }
                Err(RecvTimeoutError::Disconnected) => return Err(ClientError::Closed),
            }
        }
    }

    pub fn player_id(&self) -> Option<PlayerId> {
        self.ctx.shared.lock().player
    }

    pub fn state(&self) -> ClientState {
        self.ctx.shared.lock().state
    }

    fn require_playing(&self) -> Result<(), ClientError> {
        playing_gate(self.state())
    }

    /// Submit a command. It takes effect only when the relay broadcasts it
    /// back as `ClientEvent::Command`.
    pub fn send_command(
        &self,
        kind: CommandKind,
        scope: Scope,
        payload: Vec<u8>,
    ) -> Result<(), ClientError> {
        self.require_playing()?;
        let request = CommandRequest {
            kind,
            scope,
            payload,
        };
        Ok(self.link.send(ClientPacket::Command, &request)?)
    }

    pub fn chat(&self, text: &str) -> Result<(), ClientError> {
        let chat = ChatText { text: text.into() };
        Ok(self.link.send(ClientPacket::Chat, &chat)?)
    }

    /// Last tick the local simulation finished; reported in keep-alive replies.
    pub fn report_tick(&self, tick: u64) {
        self.ctx.shared.lock().sim_tick = tick;
    }

    /// Report a fingerprint. The trace is kept locally so the relay can ask
    /// for it later; it is only sent along if `inline_traces` is set.
    pub fn submit_opinion(
        &self,
        start_tick: u64,
        digest: u64,
        trace: Option<String>,
    ) -> Result<(), ClientError> {
        self.require_playing()?;
        let inline = if self.ctx.options.inline_traces {
            trace.clone()
        } else {
            None
        };
        {
            let mut shared = self.ctx.shared.lock();
            let capacity = self.ctx.options.opinion_capacity.max(1);
            shared.opinions.retain(|(tick, _)| *tick != start_tick);
            shared.opinions.push_back((start_tick, trace));
            while shared.opinions.len() > capacity {
                shared.opinions.pop_front();
            }
        }
        let opinion = SyncOpinion {
            start_tick,
            digest,
            trace: inline,
        };
        Ok(self.link.send(ClientPacket::SyncOpinion, &opinion)?)
    }

    /// Ask for `target`'s trace (the host's if `None`). The answer arrives as
    /// `ClientEvent::TraceTransfer`.
    pub fn request_trace(&self, target: Option<PlayerId>, start_tick: u64) -> Result<(), ClientError> {
        self.require_playing()?;
        let request = TraceRequest { target, start_tick };
        Ok(self.link.send(ClientPacket::TraceRequest, &request)?)
    }

    pub fn set_faction(&self, player: PlayerId, faction: FactionId) -> Result<(), ClientError> {
        self.require_playing()?;
        let change = SetFaction { player, faction };
        Ok(self.link.send(ClientPacket::SetFaction, &change)?)
    }

    pub fn freeze(&self, frozen: bool) -> Result<(), ClientError> {
        self.require_playing()?;
        Ok(self.link.send(ClientPacket::Freeze, &Freeze { frozen })?)
    }

    /// Upload a join point snapshot taken at the start of `join_tick`.
    pub fn upload_world(&self, join_tick: u64, snapshot: &[u8]) -> Result<(), ClientError> {
        self.require_playing()?;
        let payload = encode_world_upload(join_tick, snapshot);
        Ok(self.link.send_bytes(ClientPacket::WorldUpload, &payload)?)
    }

    /// Ask the relay to resend the world. Expect `WorldReceived` and then
    /// `Playing` again.
    /// Play operations fail with `NotPlaying` from here until the new world
    /// is loaded.
    pub fn request_rejoin(&self) -> Result<(), ClientError> {
        {
            let mut shared = self.ctx.shared.lock();
            playing_gate(shared.state)?;
            shared.state = ClientState::Loading;
        }
        Ok(self.link.send(ClientPacket::RequestRejoin, &Empty {})?)
    }

    pub fn cursor(&self, map: MapId, x: f32, z: f32) -> Result<(), ClientError> {
        self.require_playing()?;
        Ok(self
            .link
            .send(ClientPacket::Cursor, &CursorUpdate { map, x, z })?)
    }

    pub fn selection(&self, map: MapId, selected: Vec<u64>) -> Result<(), ClientError> {
        self.require_playing()?;
        let update = SelectionUpdate { map, selected };
        Ok(self.link.send(ClientPacket::Selection, &update)?)
    }

    /// Drain every queued event without blocking.
    pub fn poll(&mut self) -> Vec<ClientEvent> {
        let mut events: Vec<ClientEvent> = self.backlog.drain(..).collect();
        events.extend(self.inbox.try_iter());
        events
    }

    /// Next event, waiting up to `timeout`.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<ClientEvent> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        self.inbox.recv_timeout(timeout).ok()
    }

    /// Close the connection and wait for the reader thread to finish.
    pub fn disconnect(mut self) {
        self.link.close(DisconnectReason::Quit);
        if let Some(handle) = self.reader_thread.take() {
            let _ = handle.join();
        }
    }
}

fn playing_gate(state: ClientState) -> Result<(), ClientError> {
    match state {
        ClientState::Playing => Ok(()),
        ClientState::Disconnected => Err(ClientError::Closed),
        _ => Err(ClientError::NotPlaying),
    }
}

impl Drop for NetClient {
    fn drop(&mut self) {
        self.link.close(DisconnectReason::Quit);
    }
}
