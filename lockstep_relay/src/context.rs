// Shared server state.
//
// `ServerContext` bundles everything the relay's connections share: config,
// clock, registry, command log, desync exchange and the current join point.
// One `Arc<ServerContext>` is handed to every connection, the clock thread and
// the `RelayHandle`; there are no globals.
//
// The operations here are the session-level meaning of client messages. State
// handlers (`server_states.rs`) decode a message and call one method; the
// method does the locking, logging and fan-out.
//
// Lock order (outermost first): clock read lock, join point, command log
// (scope map, then scope mutexes), registry, link output. `begin_world_transfer`
// is the one place that takes all of them.

use std::path::Path;
use std::time::Instant;

use bytes::Bytes;
use lockstep_protocol::message::{
    ChatBroadcast, DisconnectReason, JoinInfo, JoinManifest, KeepAliveReply, Login, PlayerInfo,
    PlayerListDelta, SetFaction, SyncOpinion, TraceRequest, TraceResponse, TraceTransfer,
    WorldDataStart,
};
use lockstep_protocol::{
    CommandKind, CommandRequest, FactionId, PlayerId, PlayerStatus, ScheduledCommand, Scope,
    ServerPacket,
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::checkpoint::{self, Checkpoint, CheckpointError};
use crate::clock::Clock;
use crate::command_log::{CommandLog, NewCommand};
use crate::config::RelayConfig;
use crate::desync::{DesyncExchange, TraceRoute};
use crate::error::{CommandRejected, ConnError};
use crate::registry::{AdmissionRules, Audience, Registry, ServerLink};

/// Snapshot new joiners start from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JoinPoint {
    pub join_tick: u64,
    /// Opaque simulation state at the start of `join_tick`. Empty means the
    /// simulation's initial state.
    pub snapshot: Bytes,
}

pub struct ServerContext {
    pub config: RelayConfig,
    pub clock: Clock,
    pub registry: Registry,
    pub logs: CommandLog,
    pub desync: DesyncExchange,
    join_point: Mutex<JoinPoint>,
    reference_manifest: Mutex<Option<JoinManifest>>,
    /// Every connection's link, admitted or not, so shutdown reaches them all.
    open_links: Mutex<Vec<ServerLink>>,
}

fn faction_payload(faction: FactionId) -> Vec<u8> {
    faction.0.to_be_bytes().to_vec()
}

impl ServerContext {
    pub fn new(config: RelayConfig) -> Result<Self, CheckpointError> {
        let ctx = Self {
            clock: Clock::new(
                config.start_tick,
                config.ticks_per_period,
                config.scheduling_delay,
            ),
            registry: Registry::new(),
            logs: CommandLog::new(config.echo_to_origin),
            desync: DesyncExchange::new(config.opinion_capacity),
            join_point: Mutex::new(JoinPoint {
                join_tick: config.start_tick,
                snapshot: Bytes::new(),
            }),
            reference_manifest: Mutex::new(None),
            open_links: Mutex::new(Vec::new()),
            config,
        };
        if ctx.config.resume {
            if let Some(path) = ctx.config.checkpoint_path.as_deref() {
                ctx.resume_from(path)?;
            }
        }
        Ok(ctx)
    }

    fn resume_from(&self, path: &Path) -> Result<(), CheckpointError> {
        if !path.exists() {
            info!(path = %path.display(), "no checkpoint to resume from");
            return Ok(());
        }
        let saved = checkpoint::load(path)?;
        self.clock.restore(saved.tick);
        self.logs.restore(saved.logs);
        *self.join_point.lock() = JoinPoint {
            join_tick: saved.join_tick,
            snapshot: saved.snapshot,
        };
        info!(
            path = %path.display(),
            tick = saved.tick,
            join_tick = saved.join_tick,
            "resumed from checkpoint"
        );
        Ok(())
    }

    pub fn track(&self, link: &ServerLink) {
        let mut links = self.open_links.lock();
        links.retain(|l| !l.is_closed());
        links.push(link.clone());
    }

    pub fn join_point(&self) -> JoinPoint {
        self.join_point.lock().clone()
    }

    // -- Handshake ----------------------------------------------------------

    pub fn admit(&self, login: &Login, link: &ServerLink) -> Result<PlayerInfo, ConnError> {
        let rules = AdmissionRules {
            password: self.config.password.clone(),
            max_players: self.config.max_players,
        };
        self.registry.admit(login, link, &rules).map_err(|reason| {
            info!(username = %login.username, ?reason, "login refused");
            ConnError::Refused(reason)
        })
    }

    /// The first manifest becomes the session's reference; later ones must
    /// match its simulation and config hashes.
    pub fn check_manifest(&self, manifest: &JoinManifest) -> Result<(), ConnError> {
        let mut reference = self.reference_manifest.lock();
        if let Some(r) = reference.as_ref() {
            if r.sim_version_hash != manifest.sim_version_hash
                || r.config_hash != manifest.config_hash
            {
                return Err(ConnError::Refused(DisconnectReason::ManifestMismatch));
            }
            return Ok(());
        }
        *reference = Some(manifest.clone());
        Ok(())
    }

    pub fn join_info(&self, player: PlayerId) -> Result<JoinInfo, ConnError> {
        let info = self
            .registry
            .info(player)
            .ok_or(ConnError::Internal("joining player missing from registry"))?;
        Ok(JoinInfo {
            player_id: player,
            session_name: self.config.session_name.clone(),
            role: info.role,
            faction: info.faction,
            players: self.registry.player_list(),
            scheduling_delay: self.config.scheduling_delay,
        })
    }

    /// Send the join point and a replay of every log, then start streaming
    /// commands to `player`. Appends are blocked for the duration, so the
    /// replay and the live stream meet exactly.
    pub fn begin_world_transfer(&self, player: PlayerId, link: &ServerLink) -> Result<(), ConnError> {
        let tick = self.clock.read();
        let join_point = self.join_point.lock();
        self.logs.with_locked(|logs| {
            let replayed: usize = logs.iter().map(|l| l.commands.len()).sum();
            let header = WorldDataStart {
                join_tick: join_point.join_tick,
                tick: *tick,
                snapshot_len: join_point.snapshot.len() as u64,
                logs,
            };
            link.send(ServerPacket::WorldDataStart, &header)?;
            link.send_bytes(ServerPacket::WorldData, &join_point.snapshot)?;
            self.registry.set_receives_commands(player, true);
            info!(
                ?player,
                join_tick = join_point.join_tick,
                tick = *tick,
                replayed,
                snapshot = join_point.snapshot.len(),
                "world sent"
            );
            Ok(())
        })
    }

    /// Called once the participant has loaded the world.
    pub fn enter_playing(&self, player: PlayerId, link: &ServerLink) -> Result<(), ConnError> {
        if let Some(faction) = self.registry.enter_playing(player) {
            self.issue(CommandKind::FactionOnline, faction_payload(faction));
        }
        let tick = self.clock.read();
        link.send(ServerPacket::TimeControl, &self.clock.time_control(*tick))
    }

    // -- Commands -----------------------------------------------------------

    pub fn submit_command(
        &self,
        origin: PlayerId,
        request: CommandRequest,
    ) -> Result<ScheduledCommand, CommandRejected> {
        if request.kind.server_only() {
            return Err(CommandRejected::ServerOnly(request.kind));
        }
        let max = self.config.max_command_payload;
        if request.payload.len() > max {
            return Err(CommandRejected::PayloadTooLarge {
                len: request.payload.len(),
                max,
            });
        }
        let faction = self
            .registry
            .playing_faction(origin)
            .ok_or(CommandRejected::NotPlaying)?;
        if faction == FactionId::SPECTATOR {
            return Err(CommandRejected::Arbiter);
        }
        self.logs.submit(
            &self.clock,
            &self.registry,
            NewCommand {
                kind: request.kind,
                scope: request.scope,
                origin_faction: faction,
                payload: request.payload,
            },
            Some(origin),
        )
    }

    /// Append a relay-issued command to the global log.
    pub fn issue(&self, kind: CommandKind, payload: Vec<u8>) -> Option<ScheduledCommand> {
        let command = NewCommand {
            kind,
            scope: Scope::Global,
            origin_faction: FactionId::SPECTATOR,
            payload,
        };
        match self.logs.submit(&self.clock, &self.registry, command, None) {
            Ok(scheduled) => {
                debug!(?kind, seq = scheduled.seq, at = scheduled.execute_at_tick, "relay command issued");
                Some(scheduled)
            }
            Err(err) => {
                warn!(?kind, %err, "relay command rejected");
                None
            }
        }
    }

    // -- Chat and telemetry -------------------------------------------------

    pub fn chat(&self, from: PlayerId, text: String) {
        let Some(info) = self.registry.info(from) else {
            return;
        };
        let message = ChatBroadcast {
            from,
            name: info.username,
            text,
        };
        self.registry
            .broadcast(Audience::All, ServerPacket::Chat, &message);
    }

    pub fn record_keepalive(&self, player: PlayerId, reply: &KeepAliveReply) {
        let tick = self.clock.now();
        self.registry
            .record_keepalive(player, reply, Instant::now(), tick);
    }

    pub fn broadcast_latencies(&self) {
        let latencies = self.registry.latencies();
        if latencies.is_empty() {
            return;
        }
        self.registry.broadcast(
            Audience::All,
            ServerPacket::PlayerList,
            &PlayerListDelta::Latencies(latencies),
        );
    }

    // -- Desync exchange ----------------------------------------------------

    pub fn submit_opinion(&self, source: PlayerId, opinion: SyncOpinion) {
        if let Some(report) = self.desync.submit(source, opinion) {
            warn!(start_tick = report.start_tick, players = ?report.players, "desync detected");
            self.registry
                .broadcast(Audience::Playing, ServerPacket::DesyncDetected, &report);
        }
    }

    /// Serve a trace request. Without an explicit target the host's trace is
    /// fetched. Only participants past the handshake are asked; anyone else
    /// gets an empty transfer straight back.
    pub fn request_trace(&self, requester: PlayerId, request: TraceRequest) {
        let Some(target) = request.target.or_else(|| self.registry.host()) else {
            let empty = TraceTransfer {
                source: requester,
                start_tick: request.start_tick,
                trace: None,
            };
            self.registry
                .send_to(requester, ServerPacket::TraceTransfer, &empty);
            return;
        };
        let answerable = self.registry.info(target).is_some_and(|info| {
            matches!(info.status, PlayerStatus::Loading | PlayerStatus::Playing)
        });
        if !answerable {
            debug!(?requester, ?target, "trace target cannot answer");
            let empty = TraceTransfer {
                source: target,
                start_tick: request.start_tick,
                trace: None,
            };
            self.registry
                .send_to(requester, ServerPacket::TraceTransfer, &empty);
            return;
        }
        match self
            .desync
            .request_trace(requester, target, request.start_tick)
        {
            TraceRoute::Immediate {
                requester,
                transfer,
            } => {
                self.registry
                    .send_to(requester, ServerPacket::TraceTransfer, &transfer);
            }
            TraceRoute::Relay {
                target,
                query,
                evicted,
            } => {
                if let Some((owed, transfer)) = evicted {
                    self.registry
                        .send_to(owed, ServerPacket::TraceTransfer, &transfer);
                }
                if !self
                    .registry
                    .send_to(target, ServerPacket::TraceRequest, &query)
                {
                    let unanswered = TraceResponse {
                        request_id: query.request_id,
                        trace: None,
                    };
                    self.complete_trace(target, unanswered);
                }
            }
        }
    }

    pub fn complete_trace(&self, responder: PlayerId, response: TraceResponse) {
        if let Some((requester, transfer)) = self.desync.complete_trace(responder, response) {
            debug!(?responder, ?requester, "forwarding trace");
            self.registry
                .send_to(requester, ServerPacket::TraceTransfer, &transfer);
        }
    }

    // -- Host operations ----------------------------------------------------

    /// Host-only faction reassignment. Returns false if refused.
    pub fn set_faction(&self, requester: PlayerId, change: SetFaction) -> bool {
        if !self.registry.is_host(requester) {
            warn!(?requester, "faction change from non-host ignored");
            return false;
        }
        let Some(shift) = self.registry.set_faction(change.player, change.faction) else {
            return false;
        };
        self.registry
            .broadcast(Audience::All, ServerPacket::SetFaction, &change);
        if let Some(faction) = shift.offline {
            self.issue(CommandKind::FactionOffline, faction_payload(faction));
        }
        if let Some(faction) = shift.online {
            self.issue(CommandKind::FactionOnline, faction_payload(faction));
        }
        true
    }

    /// Host-only freeze. The new `TimeControl` goes out immediately.
    pub fn freeze(&self, requester: PlayerId, frozen: bool) -> bool {
        if !self.registry.is_host(requester) {
            warn!(?requester, "freeze from non-host ignored");
            return false;
        }
        self.clock.set_frozen(frozen);
        let tick = self.clock.read();
        self.registry.broadcast(
            Audience::Playing,
            ServerPacket::TimeControl,
            &self.clock.time_control(*tick),
        );
        info!(frozen, tick = *tick, "clock freeze changed");
        true
    }

    // -- Join points --------------------------------------------------------

    /// Ask the host to snapshot at a common tick.
    pub fn create_join_point(&self) -> Option<ScheduledCommand> {
        if self.registry.host().is_none() {
            debug!("no host to create a join point");
            return None;
        }
        self.issue(CommandKind::CreateJoinPoint, Vec::new())
    }

    pub fn upload_join_point(&self, uploader: PlayerId, join_tick: u64, snapshot: Bytes) -> bool {
        if !self.registry.is_host(uploader) {
            warn!(?uploader, "world upload from non-host ignored");
            return false;
        }
        self.install_join_point(join_tick, snapshot)
    }

    /// Replace the join point, prune history it makes unnecessary, and write
    /// a checkpoint if configured. Older join points are ignored.
    pub fn install_join_point(&self, join_tick: u64, snapshot: Bytes) -> bool {
        let tick = self.clock.now();
        let mut join_point = self.join_point.lock();
        if join_tick < join_point.join_tick {
            warn!(join_tick, current = join_point.join_tick, "stale join point ignored");
            return false;
        }
        *join_point = JoinPoint {
            join_tick,
            snapshot,
        };
        let pruned = self.logs.prune_before(join_tick);
        info!(join_tick, pruned, bytes = join_point.snapshot.len(), "join point installed");

        if let Some(path) = self.config.checkpoint_path.as_deref() {
            let saved = Checkpoint {
                join_tick,
                tick,
                snapshot: join_point.snapshot.clone(),
                logs: self.logs.save(),
            };
            if let Err(err) = checkpoint::save(path, &saved) {
                warn!(path = %path.display(), %err, "checkpoint write failed");
            }
        }
        true
    }

    // -- Lifecycle ----------------------------------------------------------

    pub fn remove_player(&self, player: PlayerId) {
        let Some(departure) = self.registry.remove(player) else {
            return;
        };
        info!(?player, username = %departure.info.username, "player left");
        if let Some(faction) = departure.faction_offline {
            self.issue(CommandKind::FactionOffline, faction_payload(faction));
        }
        for (requester, transfer) in self.desync.forget(player) {
            self.registry
                .send_to(requester, ServerPacket::TraceTransfer, &transfer);
        }
    }

    /// Disconnect a participant by name. Returns false if nobody matched.
    pub fn kick(&self, username: &str) -> bool {
        let Some(link) = self
            .registry
            .find(username)
            .and_then(|id| self.registry.link_of(id))
        else {
            return false;
        };
        info!(username, "kicking player");
        link.close(DisconnectReason::Kicked);
        true
    }

    pub fn shutdown(&self) {
        self.registry.close_all(DisconnectReason::ShuttingDown);
        for link in self.open_links.lock().drain(..) {
            link.close(DisconnectReason::ShuttingDown);
        }
    }
}

#[cfg(test)]
mod tests {
    use lockstep_protocol::message::decode_body;
    use lockstep_protocol::{MapId, PacketKind, decode_header};

    use super::*;
    use crate::test_support::{loopback_link, recv_message};
    use crate::transport::{LoopbackReceiver, TransportReceiver};

    fn config() -> RelayConfig {
        RelayConfig {
            start_tick: 100,
            ..RelayConfig::default()
        }
    }

    fn join(ctx: &ServerContext, name: &str) -> (PlayerId, ServerLink, LoopbackReceiver) {
        let (link, rx) = loopback_link();
        let login = Login {
            username: name.into(),
            password: None,
            arbiter: false,
        };
        let info = ctx.admit(&login, &link).unwrap();
        link.set_identity(name, info.id);
        ctx.begin_world_transfer(info.id, &link).unwrap();
        ctx.enter_playing(info.id, &link).unwrap();
        (info.id, link, rx)
    }

    /// Read until a message of `kind` arrives.
    fn next_of(rx: &mut LoopbackReceiver, kind: ServerPacket) -> Bytes {
        loop {
            let (got, payload) = recv_message(rx);
            if got == kind {
                return payload;
            }
        }
    }

    #[test]
    fn manifest_reference_is_set_by_first_joiner() {
        let ctx = ServerContext::new(config()).unwrap();
        let manifest = JoinManifest {
            sim_version_hash: 1,
            config_hash: 2,
            capabilities: vec![],
        };
        ctx.check_manifest(&manifest).unwrap();
        ctx.check_manifest(&manifest).unwrap();
        let other = JoinManifest {
            config_hash: 3,
            ..manifest
        };
        assert!(matches!(
            ctx.check_manifest(&other),
            Err(ConnError::Refused(DisconnectReason::ManifestMismatch))
        ));
    }

    #[test]
    fn command_validation() {
        let ctx = ServerContext::new(config()).unwrap();
        let (alice, _link, _rx) = join(&ctx, "alice");

        let server_only = CommandRequest {
            kind: CommandKind::CreateJoinPoint,
            scope: Scope::Global,
            payload: vec![],
        };
        assert_eq!(
            ctx.submit_command(alice, server_only),
            Err(CommandRejected::ServerOnly(CommandKind::CreateJoinPoint))
        );

        let huge = CommandRequest {
            kind: CommandKind::Sync,
            scope: Scope::Global,
            payload: vec![0; ctx.config.max_command_payload + 1],
        };
        assert!(matches!(
            ctx.submit_command(alice, huge),
            Err(CommandRejected::PayloadTooLarge { .. })
        ));

        let stranger = CommandRequest {
            kind: CommandKind::Designator,
            scope: Scope::Map(MapId(1)),
            payload: vec![],
        };
        assert_eq!(
            ctx.submit_command(PlayerId(99), stranger),
            Err(CommandRejected::NotPlaying)
        );
    }

    #[test]
    fn first_player_brings_its_faction_online() {
        let ctx = ServerContext::new(config()).unwrap();
        let (_alice, _link, mut rx) = join(&ctx, "alice");

        let command: ScheduledCommand = decode_body(&next_of(&mut rx, ServerPacket::Command)).unwrap();
        assert_eq!(command.kind, CommandKind::FactionOnline);
        assert_eq!(command.origin_faction, FactionId::SPECTATOR);
        assert_eq!(command.execute_at_tick, 115);
        assert_eq!(command.payload, FactionId::SHARED.0.to_be_bytes().to_vec());
    }

    #[test]
    fn join_point_prunes_and_rejects_stale_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.ckpt");
        let ctx = ServerContext::new(RelayConfig {
            checkpoint_path: Some(path.clone()),
            ..config()
        })
        .unwrap();
        let (alice, _link, _rx) = join(&ctx, "alice");
        assert_eq!(ctx.logs.len(), 1);

        assert!(ctx.upload_join_point(alice, 200, Bytes::from_static(b"world")));
        assert!(ctx.logs.is_empty());
        assert!(!ctx.install_join_point(150, Bytes::new()));
        assert_eq!(ctx.join_point().join_tick, 200);

        // A fresh relay resumes from the checkpoint.
        let resumed = ServerContext::new(RelayConfig {
            checkpoint_path: Some(path),
            resume: true,
            ..config()
        })
        .unwrap();
        assert_eq!(resumed.join_point().snapshot, Bytes::from_static(b"world"));
        assert_eq!(resumed.clock.now(), 100);
    }

    #[test]
    fn only_the_host_may_freeze() {
        let ctx = ServerContext::new(config()).unwrap();
        let (alice, _la, _ra) = join(&ctx, "alice");
        let (bob, _lb, mut rb) = join(&ctx, "bob");
        assert!(!ctx.freeze(bob, true));
        assert!(!ctx.clock.is_frozen());
        assert!(ctx.freeze(alice, true));

        loop {
            let payload = next_of(&mut rb, ServerPacket::TimeControl);
            let control: lockstep_protocol::message::TimeControl = decode_body(&payload).unwrap();
            if control.frozen {
                assert_eq!(control.ceiling, 115);
                break;
            }
        }
    }

    #[test]
    fn departure_keeps_shared_faction_online_while_someone_remains() {
        let ctx = ServerContext::new(config()).unwrap();
        let (alice, _la, _ra) = join(&ctx, "alice");
        let (bob, _lb, mut rb) = join(&ctx, "bob");
        ctx.remove_player(alice);
        assert_eq!(ctx.registry.info(alice), None);
        assert_eq!(ctx.registry.host(), Some(bob));

        let kinds: Vec<CommandKind> = ctx
            .logs
            .entries(Scope::Global)
            .iter()
            .map(|c| c.kind)
            .collect();
        assert_eq!(kinds, vec![CommandKind::FactionOnline]);

        let mut deltas = Vec::new();
        while deltas.len() < 3 {
            deltas.push(decode_body::<PlayerListDelta>(&next_of(&mut rb, ServerPacket::PlayerList)).unwrap());
        }
        assert_eq!(
            deltas,
            vec![
                PlayerListDelta::Status {
                    player: bob,
                    status: PlayerStatus::Playing
                },
                PlayerListDelta::Remove(alice),
                PlayerListDelta::Role {
                    player: bob,
                    role: lockstep_protocol::Role::Host
                },
            ]
        );
    }

    #[test]
    fn trace_of_a_participant_still_joining_is_answered_empty() {
        let ctx = ServerContext::new(config()).unwrap();
        let (alice, _la, mut ra) = join(&ctx, "alice");
        let (link, mut rb) = loopback_link();
        let login = Login {
            username: "bob".into(),
            password: None,
            arbiter: false,
        };
        let bob = ctx.admit(&login, &link).unwrap().id;
        link.set_identity("bob", bob);

        ctx.request_trace(
            alice,
            TraceRequest {
                target: Some(bob),
                start_tick: 500,
            },
        );
        let transfer: TraceTransfer =
            decode_body(&next_of(&mut ra, ServerPacket::TraceTransfer)).unwrap();
        assert_eq!(transfer.source, bob);
        assert_eq!(transfer.start_tick, 500);
        assert_eq!(transfer.trace, None);

        link.close(DisconnectReason::Kicked);
        while let Ok((frame, _)) = rb.recv_raw() {
            let (kind, _) = decode_header(frame[0]).unwrap();
            assert_ne!(kind, ServerPacket::TraceRequest.as_u8());
        }
    }
}
