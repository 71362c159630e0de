// Framed connection and per-connection state machine.
//
// One `Connection` exists per peer and lives on that peer's reader thread. It
// turns raw frames from a `TransportReceiver` into complete messages
// (`Reassembler`), dispatches them to the live state handler, and applies
// state transitions. Its outbound half, `Link`, is a cheap clonable handle that
// other threads (broadcasts, the clock loop, the client API) use to send.
//
// Dispatch order for a complete message:
// 1. Kind 63 (out-of-band disconnect) is handled before reassembly and ends the
//    connection in any state.
// 2. A pending cooperative wait for that kind takes the message (`wait.rs`).
// 3. The handler's route table (`StateHandler::ROUTES`).
// 4. Otherwise: a reliable message is a protocol fault, a best-effort one is
//    dropped.
//
// The route table is also the only source of fragmentability: a first
// fragment whose kind has no `fragmentable: true` route in the current state is
// a fault.
//
// Transitions are deferred. A handler method or task requests one; after the
// current message is handled the connection retires the old handler (its
// waits are abandoned or resolved empty), installs the new one and runs its
// `start` hook. The server and client each implement `Side` to plug their
// state enums, packet catalogues and shared context into this machinery.

use std::fmt::Debug;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use lockstep_protocol::{
    Delivery, DisconnectReason, FragTag, FrameLimits, PacketKind, PlayerId, Reassembler,
    SPECIAL_DISCONNECT, decode_header, encode_body, encode_header, fragment,
};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::error::ConnError;
use crate::transport::{Transport, TransportReceiver};
use crate::wait::{LocalTasks, Waiter};

/// A lifecycle state enum with one terminal value.
pub trait Lifecycle: Copy + Eq + Debug + Send + Sync + 'static {
    const TERMINAL: Self;

    fn is_terminal(self) -> bool {
        self == Self::TERMINAL
    }
}

/// One end of the protocol (relay or client).
pub trait Side: Sized + 'static {
    type State: Lifecycle;
    type Inbound: PacketKind;
    type Outbound: PacketKind;
    type Context: Send + Sync + 'static;

    /// Fresh handler for a state. `None` for the terminal state.
    fn handler_for(state: Self::State) -> Option<Box<dyn ErasedHandler<Self>>>;

    /// Runs once, after the link is closed.
    fn on_teardown(conn: &mut Connection<Self>, cause: &ConnError);
}

pub type Method<H> =
    fn(&mut H, &mut Connection<<H as StateHandler>::Side>, Bytes) -> Result<(), ConnError>;

/// One row of a state's route table.
pub struct Route<H: StateHandler> {
    pub kind: <H::Side as Side>::Inbound,
    pub fragmentable: bool,
    pub method: Method<H>,
}

/// Typed handler for one lifecycle state.
pub trait StateHandler: Sized + 'static {
    type Side: Side;
    const STATE: <Self::Side as Side>::State;
    const ROUTES: &'static [Route<Self>];

    fn start(&mut self, _conn: &mut Connection<Self::Side>) -> Result<(), ConnError> {
        Ok(())
    }
}

/// Object-safe view of a `StateHandler`, so a connection can hold whichever
/// one is current.
pub trait ErasedHandler<S: Side> {
    fn state(&self) -> S::State;
    fn fragmentable(&self, kind: u8) -> bool;
    fn begin(&mut self, conn: &mut Connection<S>) -> Result<(), ConnError>;
    /// `None` if the state has no route for `kind`.
    fn dispatch(
        &mut self,
        conn: &mut Connection<S>,
        kind: u8,
        payload: Bytes,
    ) -> Option<Result<(), ConnError>>;
}

impl<H: StateHandler> ErasedHandler<H::Side> for H {
    fn state(&self) -> <H::Side as Side>::State {
        H::STATE
    }

    fn fragmentable(&self, kind: u8) -> bool {
        H::ROUTES
            .iter()
            .any(|route| route.fragmentable && route.kind.as_u8() == kind)
    }

    fn begin(&mut self, conn: &mut Connection<H::Side>) -> Result<(), ConnError> {
        StateHandler::start(self, conn)
    }

    fn dispatch(
        &mut self,
        conn: &mut Connection<H::Side>,
        kind: u8,
        payload: Bytes,
    ) -> Option<Result<(), ConnError>> {
        let route = H::ROUTES.iter().find(|route| route.kind.as_u8() == kind)?;
        Some((route.method)(self, conn, payload))
    }
}

// ---------------------------------------------------------------------------
// Link
// ---------------------------------------------------------------------------

struct Outbound {
    transport: Box<dyn Transport>,
    closed: bool,
}

#[derive(Default)]
struct Identity {
    username: Option<String>,
    player: Option<PlayerId>,
}

struct LinkShared {
    out: Mutex<Outbound>,
    identity: Mutex<Identity>,
    limits: FrameLimits,
}

/// Thread-safe sending half of a connection, typed by outbound kind.
pub struct Link<K> {
    shared: Arc<LinkShared>,
    _kind: PhantomData<K>,
}

impl<K> Clone for Link<K> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            _kind: PhantomData,
        }
    }
}

impl<K: PacketKind> Link<K> {
    pub fn new(transport: Box<dyn Transport>, limits: FrameLimits) -> Self {
        Self {
            shared: Arc::new(LinkShared {
                out: Mutex::new(Outbound {
                    transport,
                    closed: false,
                }),
                identity: Mutex::new(Identity::default()),
                limits,
            }),
            _kind: PhantomData,
        }
    }

    /// Send a JSON body.
    pub fn send<T: Serialize>(&self, kind: K, body: &T) -> Result<(), ConnError> {
        let payload = encode_body(body)?;
        self.send_bytes(kind, &payload)
    }

    /// Send a raw payload. All fragments go out under one lock, so messages
    /// from different threads never interleave. A closed link drops the
    /// message silently. A transport failure closes the link, and the
    /// connection's reader sees end of stream.
    pub fn send_bytes(&self, kind: K, payload: &[u8]) -> Result<(), ConnError> {
        if self.is_closed() {
            return Ok(());
        }
        let frames = fragment(kind.as_u8(), payload, &self.shared.limits)?;
        let mut out = self.shared.out.lock();
        if out.closed {
            return Ok(());
        }
        for frame in &frames {
            if let Err(err) = out.transport.send_raw(frame, kind.delivery()) {
                out.closed = true;
                out.transport.close();
                return Err(err.into());
            }
        }
        Ok(())
    }

    /// Send the out-of-band disconnect notice and close the transport.
    /// Idempotent.
    pub fn close(&self, reason: DisconnectReason) {
        let mut out = self.shared.out.lock();
        if out.closed {
            return;
        }
        out.closed = true;
        let notice = [
            encode_header(SPECIAL_DISCONNECT, FragTag::None),
            reason.to_byte(),
        ];
        let _ = out.transport.send_raw(&notice, Delivery::Reliable);
        out.transport.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.out.lock().closed
    }

    pub fn set_identity(&self, username: &str, player: PlayerId) {
        let mut identity = self.shared.identity.lock();
        identity.username = Some(username.to_owned());
        identity.player = Some(player);
    }

    pub fn player(&self) -> Option<PlayerId> {
        self.shared.identity.lock().player
    }

    pub fn username(&self) -> Option<String> {
        self.shared.identity.lock().username.clone()
    }

    /// Name for log lines.
    pub fn label(&self) -> String {
        self.username().unwrap_or_else(|| "<anonymous>".into())
    }

    pub fn limits(&self) -> FrameLimits {
        self.shared.limits
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

pub type ConnWaiter<S> = Waiter<<S as Side>::Inbound, <S as Side>::State>;

/// Receiving half and state machine of one connection.
pub struct Connection<S: Side> {
    link: Link<S::Outbound>,
    ctx: Arc<S::Context>,
    state: S::State,
    handler: Option<Box<dyn ErasedHandler<S>>>,
    reassembler: Reassembler,
    tasks: LocalTasks<S::Inbound, S::State>,
    pending_transition: Option<S::State>,
}

impl<S: Side> Connection<S> {
    /// A connection that will enter `initial` when started.
    pub fn new(link: Link<S::Outbound>, ctx: Arc<S::Context>, initial: S::State) -> Self {
        let reassembler = Reassembler::new(link.limits());
        Self {
            link,
            ctx,
            state: initial,
            handler: None,
            reassembler,
            tasks: LocalTasks::new(),
            pending_transition: None,
        }
    }

    pub fn link(&self) -> &Link<S::Outbound> {
        &self.link
    }

    pub fn ctx(&self) -> &Arc<S::Context> {
        &self.ctx
    }

    pub fn state(&self) -> S::State {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn waiter(&self) -> ConnWaiter<S> {
        self.tasks.waiter()
    }

    /// Request a transition, applied once the current message is handled.
    pub fn transition(&mut self, next: S::State) {
        self.pending_transition = Some(next);
    }

    /// Spawn a cooperative task owned by the current handler.
    pub fn spawn<F>(&mut self, task: F) -> Result<(), ConnError>
    where
        F: Future<Output = Result<(), ConnError>> + 'static,
    {
        self.tasks.spawn(task)
    }

    /// Install the initial state's handler.
    pub fn start(&mut self) -> Result<(), ConnError> {
        self.install(self.state)?;
        self.settle()
    }

    /// Feed one raw frame from the transport.
    pub fn receive_frame(&mut self, frame: &[u8], delivery: Delivery) -> Result<(), ConnError> {
        if self.is_closed() {
            return Ok(());
        }
        if let [header, rest @ ..] = frame {
            if decode_header(*header)? == (SPECIAL_DISCONNECT, FragTag::None) {
                let reason = rest
                    .first()
                    .map_or(DisconnectReason::Quit, |&b| DisconnectReason::from_byte(b));
                return Err(ConnError::PeerClosed(reason));
            }
        }

        let handler = self.handler.as_deref();
        let message = self
            .reassembler
            .push(frame, |kind| handler.is_some_and(|h| h.fragmentable(kind)))?;
        let Some(message) = message else {
            return Ok(());
        };
        self.dispatch(message.kind, message.payload, delivery)?;
        self.settle()
    }

    fn dispatch(&mut self, kind: u8, payload: Bytes, delivery: Delivery) -> Result<(), ConnError> {
        if S::Inbound::from_u8(kind).is_none() {
            return self.unhandled(kind, delivery, ConnError::UnknownKind(kind));
        }

        let payload = match self.tasks.try_resolve(kind, payload) {
            Ok(()) => return Ok(()),
            Err(payload) => payload,
        };

        let Some(mut handler) = self.handler.take() else {
            return Ok(());
        };
        let outcome = handler.dispatch(self, kind, payload);
        self.handler = Some(handler);

        match outcome {
            Some(result) => result,
            None => {
                let fault = ConnError::IllegalKind {
                    kind,
                    state: format!("{:?}", self.state),
                };
                self.unhandled(kind, delivery, fault)
            }
        }
    }

    fn unhandled(&self, kind: u8, delivery: Delivery, fault: ConnError) -> Result<(), ConnError> {
        match delivery {
            Delivery::Reliable => Err(fault),
            Delivery::Unreliable => {
                trace!(conn = %self.link.label(), kind, state = ?self.state, "dropped best-effort message");
                Ok(())
            }
        }
    }

    /// Run tasks and apply requested transitions until nothing changes.
    fn settle(&mut self) -> Result<(), ConnError> {
        loop {
            self.tasks.run_until_stalled();
            if let Some(fault) = self.tasks.take_fault() {
                return Err(fault);
            }
            let next = self
                .pending_transition
                .take()
                .or_else(|| self.tasks.take_transition());
            let Some(next) = next else {
                return Ok(());
            };

            self.tasks.retire();
            self.handler = None;
            debug!(conn = %self.link.label(), from = ?self.state, to = ?next, "state transition");
            self.install(next)?;
        }
    }

    fn install(&mut self, state: S::State) -> Result<(), ConnError> {
        let Some(mut handler) = S::handler_for(state) else {
            return Err(ConnError::Closed);
        };
        self.state = handler.state();
        let started = handler.begin(self);
        self.handler = Some(handler);
        started
    }

    /// Enter the terminal state: retire the handler, notify the peer, close
    /// the transport and run the side's teardown hook. Idempotent.
    pub fn teardown(&mut self, cause: &ConnError) {
        if self.is_closed() {
            return;
        }
        self.tasks.retire();
        self.handler = None;
        self.pending_transition = None;
        self.state = S::State::TERMINAL;
        self.link.close(cause.disconnect_reason());
        S::on_teardown(self, cause);
    }
}

/// Reader loop of one connection. Runs on its own thread until the
/// connection ends.
pub fn drive<S: Side>(mut conn: Connection<S>, mut receiver: Box<dyn TransportReceiver>) {
    let Err(cause) = pump(&mut conn, receiver.as_mut()) else {
        return;
    };
    if cause.is_benign() {
        info!(conn = %conn.link().label(), state = ?conn.state(), %cause, "connection closed");
    } else {
        warn!(conn = %conn.link().label(), state = ?conn.state(), %cause, "connection fault");
    }
    conn.teardown(&cause);
}

fn pump<S: Side>(
    conn: &mut Connection<S>,
    receiver: &mut dyn TransportReceiver,
) -> Result<(), ConnError> {
    conn.start()?;
    while !conn.is_closed() {
        let (frame, delivery) = receiver.recv_raw()?;
        conn.receive_frame(&frame, delivery)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use lockstep_protocol::{ClientPacket, ServerPacket, fragment};

    use super::*;
    use crate::transport::{LoopbackReceiver, loopback_pair};

    // A two-state toy protocol: `Greeting` waits for `Protocol` with the await
    // layer, `Open` routes `Command` (fragmentable) and `Cursor`.

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum Toy {
        Greeting,
        Open,
        Gone,
    }

    impl Lifecycle for Toy {
        const TERMINAL: Self = Toy::Gone;
    }

    #[derive(Default)]
    struct Counters {
        commands: AtomicUsize,
        cursors: AtomicUsize,
        teardowns: AtomicUsize,
    }

    struct ToySide;

    impl Side for ToySide {
        type State = Toy;
        type Inbound = ClientPacket;
        type Outbound = ServerPacket;
        type Context = Counters;

        fn handler_for(state: Toy) -> Option<Box<dyn ErasedHandler<Self>>> {
            match state {
                Toy::Greeting => Some(Box::new(Greeting)),
                Toy::Open => Some(Box::new(Open)),
                Toy::Gone => None,
            }
        }

        fn on_teardown(conn: &mut Connection<Self>, _cause: &ConnError) {
            conn.ctx().teardowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Greeting;

    impl StateHandler for Greeting {
        type Side = ToySide;
        const STATE: Toy = Toy::Greeting;
        const ROUTES: &'static [Route<Self>] = &[];

        fn start(&mut self, conn: &mut Connection<ToySide>) -> Result<(), ConnError> {
            let waiter = conn.waiter();
            let link = conn.link().clone();
            conn.spawn(async move {
                waiter.wait_for(ClientPacket::Protocol)?.await;
                link.send_bytes(ServerPacket::ProtocolOk, b"")?;
                waiter.transition(Toy::Open);
                Ok(())
            })
        }
    }

    struct Open;

    impl Open {
        fn on_command(&mut self, conn: &mut Connection<ToySide>, _: Bytes) -> Result<(), ConnError> {
            conn.ctx().commands.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_cursor(&mut self, conn: &mut Connection<ToySide>, _: Bytes) -> Result<(), ConnError> {
            conn.ctx().cursors.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl StateHandler for Open {
        type Side = ToySide;
        const STATE: Toy = Toy::Open;
        const ROUTES: &'static [Route<Self>] = &[
            Route {
                kind: ClientPacket::Command,
                fragmentable: true,
                method: Self::on_command,
            },
            Route {
                kind: ClientPacket::Cursor,
                fragmentable: false,
                method: Self::on_cursor,
            },
        ];
    }

    fn toy() -> (Connection<ToySide>, LoopbackReceiver) {
        let ((server_tx, _server_rx), (_peer_tx, peer_rx)) = loopback_pair();
        let link = Link::new(
            Box::new(server_tx),
            FrameLimits {
                chunk_size: 8,
                max_message_size: 64,
            },
        );
        let mut conn = Connection::new(link, Arc::new(Counters::default()), Toy::Greeting);
        conn.start().unwrap();
        (conn, peer_rx)
    }

    fn frame(kind: ClientPacket, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![encode_header(kind.as_u8(), FragTag::None)];
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn awaited_handshake_then_routes() {
        let (mut conn, mut peer) = toy();
        conn.receive_frame(&frame(ClientPacket::Protocol, b"{}"), Delivery::Reliable)
            .unwrap();
        assert_eq!(conn.state(), Toy::Open);
        let (reply, _) = peer.recv_raw().unwrap();
        assert_eq!(reply, vec![ServerPacket::ProtocolOk.as_u8()]);

        let frames = fragment(ClientPacket::Command.as_u8(), &[1u8; 20], &conn.link().limits())
            .unwrap();
        assert_eq!(frames.len(), 3);
        for f in &frames {
            conn.receive_frame(f, Delivery::Reliable).unwrap();
        }
        assert_eq!(conn.ctx().commands.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reliable_kind_without_route_is_fatal() {
        let (mut conn, _peer) = toy();
        let err = conn
            .receive_frame(&frame(ClientPacket::Command, b"x"), Delivery::Reliable)
            .unwrap_err();
        assert!(matches!(err, ConnError::IllegalKind { kind: 5, .. }));
    }

    #[test]
    fn best_effort_kind_without_route_is_dropped() {
        let (mut conn, _peer) = toy();
        conn.receive_frame(&frame(ClientPacket::Cursor, b"x"), Delivery::Unreliable)
            .unwrap();
        conn.receive_frame(&[encode_header(41, FragTag::None)], Delivery::Unreliable)
            .unwrap();
        assert_eq!(conn.state(), Toy::Greeting);
        assert_eq!(conn.ctx().cursors.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn fragments_of_unrouted_kind_are_fatal() {
        let (mut conn, _peer) = toy();
        conn.receive_frame(&frame(ClientPacket::Protocol, b""), Delivery::Reliable)
            .unwrap();
        let frames = fragment(ClientPacket::Cursor.as_u8(), &[0u8; 20], &conn.link().limits())
            .unwrap();
        let err = conn.receive_frame(&frames[0], Delivery::Reliable).unwrap_err();
        assert!(matches!(
            err,
            ConnError::Frame(lockstep_protocol::FrameError::NotFragmentable(8))
        ));
    }

    #[test]
    fn out_of_band_disconnect_ends_any_state() {
        let (mut conn, mut peer) = toy();
        let notice = [
            encode_header(SPECIAL_DISCONNECT, FragTag::None),
            DisconnectReason::Kicked.to_byte(),
        ];
        let err = conn.receive_frame(&notice, Delivery::Reliable).unwrap_err();
        assert!(matches!(err, ConnError::PeerClosed(DisconnectReason::Kicked)));

        conn.teardown(&err);
        conn.teardown(&err);
        assert!(conn.is_closed());
        assert!(conn.link().is_closed());
        assert_eq!(conn.ctx().teardowns.load(Ordering::SeqCst), 1);

        // The peer sees our own notice, then end of stream.
        let (frame, _) = peer.recv_raw().unwrap();
        assert_eq!(frame[0], SPECIAL_DISCONNECT);
        assert!(peer.recv_raw().is_err());
    }

    #[test]
    fn sends_after_close_are_silent() {
        let (conn, _peer) = toy();
        let oversized = [0u8; 65];
        assert!(matches!(
            conn.link().send_bytes(ServerPacket::Chat, &oversized),
            Err(ConnError::Frame(_))
        ));

        conn.link().close(DisconnectReason::Quit);
        conn.link()
            .send_bytes(ServerPacket::Chat, b"late")
            .unwrap();
        conn.link()
            .send_bytes(ServerPacket::Chat, &oversized)
            .unwrap();
    }

    #[test]
    fn transport_failure_closes_the_link() {
        let ((tx, mut own_rx), peer) = loopback_pair();
        drop(peer);
        let link = Link::<ServerPacket>::new(Box::new(tx), FrameLimits::default());
        assert!(matches!(
            link.send_bytes(ServerPacket::Chat, b"lost"),
            Err(ConnError::Io(_))
        ));
        assert!(link.is_closed());
        assert!(own_rx.recv_raw().is_err());
        link.send_bytes(ServerPacket::Chat, b"later").unwrap();
    }
}
