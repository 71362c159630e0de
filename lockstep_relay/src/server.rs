// TCP listener and relay lifecycle.
//
// Architecture: thread-per-connection with shared state.
//
// - **Listener thread** (nonblocking `TcpListener::accept()` loop): accepts new
//   TCP connections and spawns a reader thread for each.
// - **Reader threads** (one per connection): own the `Connection` and run
//   `connection::drive` until the connection ends. They call into the shared
//   `ServerContext` directly; broadcasts write to other connections through
//   their `Link`s.
// - **Clock thread**: `clock::run_clock_loop`, the only writer of the
//   authoritative tick.
//
// Shutdown: `RelayHandle::stop` clears `keep_running` (checked by the listener
// and clock threads), closes every connection with `ShuttingDown` so the reader
// threads see end of stream, and joins the listener and clock threads.

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use lockstep_protocol::ServerPacket;
use tracing::{info, warn};

use crate::clock::run_clock_loop;
use crate::command_log::NewCommand;
use crate::config::RelayConfig;
use crate::connection::{Connection, Link, drive};
use crate::context::ServerContext;
use crate::server_states::{ServerSide, ServerState};
use crate::transport::{Transport, TransportReceiver, tcp_pair};

/// Handle returned by `start_relay` to control the running server.
pub struct RelayHandle {
    ctx: Arc<ServerContext>,
    keep_running: Arc<AtomicBool>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl RelayHandle {
    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Serve a connection over a transport that needs an explicit accept
    /// handshake (it starts in `PreAccept`).
    pub fn attach(
        &self,
        transport: impl Transport + 'static,
        receiver: impl TransportReceiver + 'static,
    ) {
        spawn_connection(
            Arc::clone(&self.ctx),
            Box::new(transport),
            Box::new(receiver),
            ServerState::PreAccept,
        );
    }

    /// Disconnect a participant by username.
    pub fn kick(&self, username: &str) -> bool {
        self.ctx.kick(username)
    }

    /// Ask the host for a join point now.
    pub fn create_join_point(&self) -> bool {
        self.ctx.create_join_point().is_some()
    }

    /// Append a command on the relay's own behalf.
    pub fn issue(&self, command: NewCommand) -> bool {
        self.ctx
            .logs
            .submit(&self.ctx.clock, &self.ctx.registry, command, None)
            .is_ok()
    }

    /// Signal the relay to stop and wait for it to shut down.
    pub fn stop(mut self) {
        self.keep_running.store(false, Ordering::SeqCst);
        self.ctx.shutdown();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        info!("relay stopped");
    }
}

/// Start the relay on background threads. Returns a handle for stopping it
/// and the actual bound address (useful when port 0 is used to let the OS
/// pick a free port).
pub fn start_relay(config: RelayConfig) -> io::Result<(RelayHandle, SocketAddr)> {
    let listener = TcpListener::bind((config.bind_address.as_str(), config.port))?;
    let addr = listener.local_addr()?;
    listener.set_nonblocking(true)?;

    let ctx = Arc::new(ServerContext::new(config).map_err(io::Error::other)?);
    let keep_running = Arc::new(AtomicBool::new(true));

    let listener_thread = {
        let ctx = Arc::clone(&ctx);
        let keep_running = Arc::clone(&keep_running);
        thread::Builder::new()
            .name("relay-listener".into())
            .spawn(move || accept_loop(listener, ctx, keep_running))?
    };
    let clock_thread = {
        let ctx = Arc::clone(&ctx);
        let keep_running = Arc::clone(&keep_running);
        thread::Builder::new()
            .name("relay-clock".into())
            .spawn(move || run_clock_loop(ctx, keep_running))?
    };

    info!(%addr, session = %ctx.config.session_name, "relay listening");
    Ok((
        RelayHandle {
            ctx,
            keep_running,
            threads: vec![listener_thread, clock_thread],
        },
        addr,
    ))
}

fn accept_loop(listener: TcpListener, ctx: Arc<ServerContext>, keep_running: Arc<AtomicBool>) {
    let limits = ctx.config.frame_limits();
    let queue_frames = ctx.config.outbound_queue_frames;
    while keep_running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(err) = stream.set_nonblocking(false) {
                    warn!(%peer, %err, "failed to configure stream");
                    continue;
                }
                match tcp_pair(stream, limits, queue_frames) {
                    Ok((transport, receiver)) => {
                        info!(%peer, "connection accepted");
                        spawn_connection(
                            Arc::clone(&ctx),
                            Box::new(transport),
                            Box::new(receiver),
                            ServerState::Joining,
                        );
                    }
                    Err(err) => warn!(%peer, %err, "failed to set up connection"),
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(err) => {
                warn!(%err, "listener failed");
                break;
            }
        }
    }
}

fn spawn_connection(
    ctx: Arc<ServerContext>,
    transport: Box<dyn Transport>,
    receiver: Box<dyn TransportReceiver>,
    initial: ServerState,
) {
    let link = Link::<ServerPacket>::new(transport, ctx.config.frame_limits());
    ctx.track(&link);
    let spawned = thread::Builder::new()
        .name("relay-conn".into())
        .spawn(move || {
            let conn = Connection::<ServerSide>::new(link, ctx, initial);
            drive(conn, receiver);
        });
    if let Err(err) = spawned {
        warn!(%err, "failed to spawn connection thread");
    }
}
