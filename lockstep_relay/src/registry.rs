// Session / player registry.
//
// Tracks every admitted participant: identity, faction, role, lifecycle
// status, measured latency and how far behind the authoritative tick its
// simulation reported itself. Each record owns a clone of the participant's
// `Link`, so the registry is also the broadcast hub for everything that fans
// out to several participants.
//
// Rules enforced here:
// - Usernames are 3–15 characters of `[A-Za-z0-9_]` and unique.
// - The password (if any) applies to everyone, arbiters included.
// - `max_players` caps regular participants; arbiters are exempt.
// - The first regular participant becomes host. When the host leaves, the
//   longest-connected remaining regular participant is promoted. IDs are
//   handed out in increasing order, so that is the smallest remaining ID.
// - A faction is "online" while at least one of its participants has entered
//   `Playing`. The registry only counts; the caller turns the 0↔1 edges into
//   `FactionOnline` / `FactionOffline` commands, because appending to the
//   command log must not happen under the registry lock.
//
// All sends happen while the registry lock is held, which keeps every
// participant's view of player-list deltas in one order. Send failures are
// ignored: the failing connection's reader thread notices and tears it down.

use std::collections::BTreeMap;
use std::time::Instant;

use lockstep_protocol::message::{
    KeepAlive, KeepAliveReply, LatencyEntry, Login, PlayerInfo, PlayerListDelta,
};
use lockstep_protocol::{
    DisconnectReason, FactionId, PlayerId, PlayerStatus, Role, ScheduledCommand, ServerPacket,
    encode_body,
};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::connection::Link;

pub type ServerLink = Link<ServerPacket>;

/// Who a broadcast goes to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Audience {
    All,
    AllExcept(PlayerId),
    Playing,
    PlayingExcept(PlayerId),
}

struct PlayerRecord {
    username: String,
    faction: FactionId,
    role: Role,
    status: PlayerStatus,
    latency_ms: u32,
    ticks_behind: u64,
    link: ServerLink,
    /// Set once the world transfer went out; from then on every appended
    /// command is streamed to this participant.
    receives_commands: bool,
    /// Counted in `online` for its faction.
    announced_online: bool,
    probe: Option<(u32, Instant)>,
}

impl PlayerRecord {
    fn info(&self, id: PlayerId) -> PlayerInfo {
        PlayerInfo {
            id,
            username: self.username.clone(),
            faction: self.faction,
            role: self.role,
            status: self.status,
            latency_ms: self.latency_ms,
            ticks_behind: self.ticks_behind,
        }
    }

    fn in_audience(&self, id: PlayerId, audience: Audience) -> bool {
        match audience {
            Audience::All => true,
            Audience::AllExcept(skip) => id != skip,
            Audience::Playing => self.status == PlayerStatus::Playing,
            Audience::PlayingExcept(skip) => id != skip && self.status == PlayerStatus::Playing,
        }
    }
}

/// Admission limits, taken from the relay config.
#[derive(Clone, Debug)]
pub struct AdmissionRules {
    pub password: Option<String>,
    pub max_players: u32,
}

/// What changed when a participant left.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Departure {
    pub info: PlayerInfo,
    pub promoted: Option<PlayerId>,
    pub faction_offline: Option<FactionId>,
}

/// Online edges caused by a faction reassignment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FactionShift {
    pub offline: Option<FactionId>,
    pub online: Option<FactionId>,
}

#[derive(Default)]
struct Roster {
    players: BTreeMap<PlayerId, PlayerRecord>,
    next_id: u32,
    next_probe: u32,
    online: BTreeMap<FactionId, usize>,
}

impl Roster {
    fn broadcast_bytes(&self, audience: Audience, kind: ServerPacket, payload: &[u8]) {
        for (id, record) in &self.players {
            if record.in_audience(*id, audience) {
                if let Err(err) = record.link.send_bytes(kind, payload) {
                    debug!(player = ?id, ?kind, %err, "broadcast send failed");
                }
            }
        }
    }

    fn broadcast<T: Serialize>(&self, audience: Audience, kind: ServerPacket, body: &T) {
        match encode_body(body) {
            Ok(payload) => self.broadcast_bytes(audience, kind, &payload),
            Err(err) => warn!(?kind, %err, "failed to encode broadcast"),
        }
    }

    /// Count a faction in; returns it if it just came online.
    fn faction_up(&mut self, faction: FactionId) -> Option<FactionId> {
        let count = self.online.entry(faction).or_insert(0);
        *count += 1;
        (*count == 1).then_some(faction)
    }

    /// Count a faction out; returns it if it just went offline.
    fn faction_down(&mut self, faction: FactionId) -> Option<FactionId> {
        let count = self.online.get_mut(&faction)?;
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.online.remove(&faction);
            return Some(faction);
        }
        None
    }
}

/// Every admitted participant of the session.
#[derive(Default)]
pub struct Registry {
    roster: Mutex<Roster>,
}

pub fn valid_username(name: &str) -> bool {
    (3..=15).contains(&name.len())
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate a login and add the participant in `Connecting` status.
    pub fn admit(
        &self,
        login: &Login,
        link: &ServerLink,
        rules: &AdmissionRules,
    ) -> Result<PlayerInfo, DisconnectReason> {
        if !valid_username(&login.username) {
            return Err(DisconnectReason::BadUsername);
        }
        if rules.password.is_some() && login.password != rules.password {
            return Err(DisconnectReason::BadCredentials);
        }

        let mut roster = self.roster.lock();
        if roster
            .players
            .values()
            .any(|p| p.username.eq_ignore_ascii_case(&login.username))
        {
            return Err(DisconnectReason::AlreadyConnected);
        }
        let regulars = roster
            .players
            .values()
            .filter(|p| p.role != Role::Arbiter)
            .count();
        if !login.arbiter && regulars >= rules.max_players as usize {
            return Err(DisconnectReason::ServerFull);
        }

        let (role, faction) = if login.arbiter {
            (Role::Arbiter, FactionId::SPECTATOR)
        } else if roster.players.values().any(|p| p.role == Role::Host) {
            (Role::Regular, FactionId::SHARED)
        } else {
            (Role::Host, FactionId::SHARED)
        };

        let id = PlayerId(roster.next_id);
        roster.next_id += 1;
        let record = PlayerRecord {
            username: login.username.clone(),
            faction,
            role,
            status: PlayerStatus::Connecting,
            latency_ms: 0,
            ticks_behind: 0,
            link: link.clone(),
            receives_commands: false,
            announced_online: false,
            probe: None,
        };
        let info = record.info(id);
        roster.broadcast(
            Audience::All,
            ServerPacket::PlayerList,
            &PlayerListDelta::Add(info.clone()),
        );
        roster.players.insert(id, record);
        info!(player = ?id, username = %info.username, ?role, "player admitted");
        Ok(info)
    }

    /// Remove a participant and tell everyone else.
    pub fn remove(&self, id: PlayerId) -> Option<Departure> {
        let mut roster = self.roster.lock();
        let record = roster.players.remove(&id)?;
        let faction_offline = if record.announced_online {
            roster.faction_down(record.faction)
        } else {
            None
        };
        roster.broadcast(
            Audience::All,
            ServerPacket::PlayerList,
            &PlayerListDelta::Remove(id),
        );

        let mut promoted = None;
        if record.role == Role::Host {
            let heir = roster
                .players
                .iter_mut()
                .find(|(_, p)| p.role == Role::Regular);
            if let Some((heir_id, heir)) = heir {
                heir.role = Role::Host;
                promoted = Some(*heir_id);
            }
            if let Some(heir_id) = promoted {
                info!(player = ?heir_id, "promoted to host");
                roster.broadcast(
                    Audience::All,
                    ServerPacket::PlayerList,
                    &PlayerListDelta::Role {
                        player: heir_id,
                        role: Role::Host,
                    },
                );
            }
        }

        Some(Departure {
            info: record.info(id),
            promoted,
            faction_offline,
        })
    }

    pub fn set_status(&self, id: PlayerId, status: PlayerStatus) {
        let mut roster = self.roster.lock();
        let Some(record) = roster.players.get_mut(&id) else {
            return;
        };
        if record.status == status {
            return;
        }
        record.status = status;
        roster.broadcast(
            Audience::All,
            ServerPacket::PlayerList,
            &PlayerListDelta::Status { player: id, status },
        );
    }

    /// Mark a participant `Playing`. Returns its faction if that faction just
    /// came online.
    pub fn enter_playing(&self, id: PlayerId) -> Option<FactionId> {
        self.set_status(id, PlayerStatus::Playing);
        let mut roster = self.roster.lock();
        let record = roster.players.get_mut(&id)?;
        if record.announced_online || record.role == Role::Arbiter {
            return None;
        }
        record.announced_online = true;
        let faction = record.faction;
        roster.faction_up(faction)
    }

    pub fn set_receives_commands(&self, id: PlayerId, receives: bool) {
        if let Some(record) = self.roster.lock().players.get_mut(&id) {
            record.receives_commands = receives;
        }
    }

    /// Reassign a participant's faction.
    pub fn set_faction(&self, id: PlayerId, faction: FactionId) -> Option<FactionShift> {
        let mut roster = self.roster.lock();
        let record = roster.players.get_mut(&id)?;
        let old = std::mem::replace(&mut record.faction, faction);
        if old == faction {
            return Some(FactionShift::default());
        }
        if !record.announced_online {
            return Some(FactionShift::default());
        }
        Some(FactionShift {
            offline: roster.faction_down(old),
            online: roster.faction_up(faction),
        })
    }

    pub fn info(&self, id: PlayerId) -> Option<PlayerInfo> {
        self.roster.lock().players.get(&id).map(|p| p.info(id))
    }

    pub fn role_of(&self, id: PlayerId) -> Option<Role> {
        self.roster.lock().players.get(&id).map(|p| p.role)
    }

    pub fn is_host(&self, id: PlayerId) -> bool {
        self.role_of(id) == Some(Role::Host)
    }

    pub fn host(&self) -> Option<PlayerId> {
        let roster = self.roster.lock();
        roster
            .players
            .iter()
            .find(|(_, p)| p.role == Role::Host)
            .map(|(id, _)| *id)
    }

    /// Faction of a participant that is currently `Playing`.
    pub fn playing_faction(&self, id: PlayerId) -> Option<FactionId> {
        let roster = self.roster.lock();
        let record = roster.players.get(&id)?;
        (record.status == PlayerStatus::Playing).then_some(record.faction)
    }

    pub fn any_playing(&self) -> bool {
        self.roster
            .lock()
            .players
            .values()
            .any(|p| p.status == PlayerStatus::Playing)
    }

    pub fn find(&self, username: &str) -> Option<PlayerId> {
        let roster = self.roster.lock();
        roster
            .players
            .iter()
            .find(|(_, p)| p.username.eq_ignore_ascii_case(username))
            .map(|(id, _)| *id)
    }

    pub fn link_of(&self, id: PlayerId) -> Option<ServerLink> {
        self.roster.lock().players.get(&id).map(|p| p.link.clone())
    }

    pub fn player_list(&self) -> Vec<PlayerInfo> {
        let roster = self.roster.lock();
        roster.players.iter().map(|(id, p)| p.info(*id)).collect()
    }

    pub fn len(&self) -> usize {
        self.roster.lock().players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn broadcast<T: Serialize>(&self, audience: Audience, kind: ServerPacket, body: &T) {
        self.roster.lock().broadcast(audience, kind, body);
    }

    /// Stream an accepted command to everyone that has the world, optionally
    /// skipping its originator.
    pub fn broadcast_command(&self, command: &ScheduledCommand, skip: Option<PlayerId>) {
        let payload = match encode_body(command) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(seq = command.seq, %err, "failed to encode command");
                return;
            }
        };
        let roster = self.roster.lock();
        for (id, record) in &roster.players {
            if !record.receives_commands || Some(*id) == skip {
                continue;
            }
            if let Err(err) = record.link.send_bytes(ServerPacket::Command, &payload) {
                debug!(player = ?id, %err, "command send failed");
            }
        }
    }

    /// Send to one participant. Returns false if it is gone or the send failed.
    pub fn send_to<T: Serialize>(&self, id: PlayerId, kind: ServerPacket, body: &T) -> bool {
        let roster = self.roster.lock();
        let Some(record) = roster.players.get(&id) else {
            return false;
        };
        match record.link.send(kind, body) {
            Ok(()) => true,
            Err(err) => {
                debug!(player = ?id, ?kind, %err, "send failed");
                false
            }
        }
    }

    /// Probe every playing participant's round trip.
    pub fn send_keepalives(&self, now: Instant) {
        let mut roster = self.roster.lock();
        let roster = &mut *roster;
        for (id, record) in roster.players.iter_mut() {
            if record.status != PlayerStatus::Playing {
                continue;
            }
            let probe = roster.next_probe;
            roster.next_probe = roster.next_probe.wrapping_add(1);
            record.probe = Some((probe, now));
            if let Err(err) = record.link.send(ServerPacket::KeepAlive, &KeepAlive { id: probe }) {
                debug!(player = ?id, %err, "keep-alive send failed");
            }
        }
    }

    /// Match a keep-alive reply to its probe. Stale or unknown replies are
    /// ignored and return false.
    pub fn record_keepalive(
        &self,
        id: PlayerId,
        reply: &KeepAliveReply,
        now: Instant,
        authoritative_tick: u64,
    ) -> bool {
        let mut roster = self.roster.lock();
        let Some(record) = roster.players.get_mut(&id) else {
            return false;
        };
        match record.probe {
            Some((probe, sent)) if probe == reply.id => {
                let rtt = now.saturating_duration_since(sent).as_millis();
                record.latency_ms = u32::try_from(rtt).unwrap_or(u32::MAX);
                record.ticks_behind = authoritative_tick.saturating_sub(reply.sim_tick);
                record.probe = None;
                true
            }
            _ => false,
        }
    }

    pub fn latencies(&self) -> Vec<LatencyEntry> {
        let roster = self.roster.lock();
        roster
            .players
            .iter()
            .map(|(id, p)| LatencyEntry {
                player: *id,
                latency_ms: p.latency_ms,
                ticks_behind: p.ticks_behind,
            })
            .collect()
    }

    /// Close every connection with `reason`.
    pub fn close_all(&self, reason: DisconnectReason) {
        let roster = self.roster.lock();
        for record in roster.players.values() {
            record.link.close(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use lockstep_protocol::PacketKind;
    use lockstep_protocol::message::decode_body;

    use super::*;
    use crate::test_support::{loopback_link, recv_message};

    fn rules(max_players: u32) -> AdmissionRules {
        AdmissionRules {
            password: None,
            max_players,
        }
    }

    fn login(name: &str) -> Login {
        Login {
            username: name.into(),
            password: None,
            arbiter: false,
        }
    }

    #[test]
    fn username_rules() {
        assert!(valid_username("abc"));
        assert!(valid_username("Player_15_chars"));
        assert!(!valid_username("ab"));
        assert!(!valid_username("sixteen_chars_xx"));
        assert!(!valid_username("bad name"));
        assert!(!valid_username("émile"));
    }

    #[test]
    fn first_regular_is_host_and_arbiters_are_exempt_from_capacity() {
        let registry = Registry::new();
        let (link_a, _rx_a) = loopback_link();
        let (link_b, _rx_b) = loopback_link();
        let (link_c, _rx_c) = loopback_link();

        let alice = registry.admit(&login("alice"), &link_a, &rules(1)).unwrap();
        assert_eq!(alice.role, Role::Host);
        assert_eq!(alice.faction, FactionId::SHARED);

        assert_eq!(
            registry.admit(&login("bob"), &link_b, &rules(1)),
            Err(DisconnectReason::ServerFull)
        );

        let referee = Login {
            arbiter: true,
            ..login("referee")
        };
        let referee = registry.admit(&referee, &link_c, &rules(1)).unwrap();
        assert_eq!(referee.role, Role::Arbiter);
        assert_eq!(referee.faction, FactionId::SPECTATOR);
    }

    #[test]
    fn admission_refusals() {
        let registry = Registry::new();
        let (link, _rx) = loopback_link();
        let locked = AdmissionRules {
            password: Some("sesame".into()),
            max_players: 4,
        };

        assert_eq!(
            registry.admit(&login("x"), &link, &locked),
            Err(DisconnectReason::BadUsername)
        );
        assert_eq!(
            registry.admit(&login("alice"), &link, &locked),
            Err(DisconnectReason::BadCredentials)
        );
        let with_password = Login {
            password: Some("sesame".into()),
            ..login("alice")
        };
        registry.admit(&with_password, &link, &locked).unwrap();
        let duplicate = Login {
            password: Some("sesame".into()),
            ..login("ALICE")
        };
        assert_eq!(
            registry.admit(&duplicate, &link, &locked),
            Err(DisconnectReason::AlreadyConnected)
        );
    }

    #[test]
    fn host_leaving_promotes_longest_connected_regular() {
        let registry = Registry::new();
        let (link_a, _rx_a) = loopback_link();
        let (link_b, _rx_b) = loopback_link();
        let (link_c, mut rx_c) = loopback_link();
        let a = registry.admit(&login("alice"), &link_a, &rules(4)).unwrap();
        let b = registry.admit(&login("bob"), &link_b, &rules(4)).unwrap();
        let c = registry.admit(&login("carol"), &link_c, &rules(4)).unwrap();

        let departure = registry.remove(a.id).unwrap();
        assert_eq!(departure.promoted, Some(b.id));
        assert_eq!(registry.host(), Some(b.id));
        assert_eq!(registry.role_of(c.id), Some(Role::Regular));

        // Carol sees the removal, then the promotion.
        let (kind, payload) = recv_message(&mut rx_c);
        assert_eq!(kind, ServerPacket::PlayerList);
        assert_eq!(
            decode_body::<PlayerListDelta>(&payload).unwrap(),
            PlayerListDelta::Remove(a.id)
        );
        let (_, payload) = recv_message(&mut rx_c);
        assert_eq!(
            decode_body::<PlayerListDelta>(&payload).unwrap(),
            PlayerListDelta::Role {
                player: b.id,
                role: Role::Host
            }
        );
    }

    #[test]
    fn faction_online_edges() {
        let registry = Registry::new();
        let (link_a, _rx_a) = loopback_link();
        let (link_b, _rx_b) = loopback_link();
        let a = registry.admit(&login("alice"), &link_a, &rules(4)).unwrap();
        let b = registry.admit(&login("bob"), &link_b, &rules(4)).unwrap();

        assert_eq!(registry.enter_playing(a.id), Some(FactionId::SHARED));
        assert_eq!(registry.enter_playing(b.id), None);
        // Re-entering after a rejoin does not count twice.
        assert_eq!(registry.enter_playing(a.id), None);

        let shift = registry.set_faction(b.id, FactionId(7)).unwrap();
        assert_eq!(
            shift,
            FactionShift {
                offline: None,
                online: Some(FactionId(7))
            }
        );

        assert_eq!(registry.remove(a.id).unwrap().faction_offline, Some(FactionId::SHARED));
        assert_eq!(registry.remove(b.id).unwrap().faction_offline, Some(FactionId(7)));
    }

    #[test]
    fn commands_stream_only_to_participants_with_the_world() {
        let registry = Registry::new();
        let (link_a, mut rx_a) = loopback_link();
        let (link_b, mut rx_b) = loopback_link();
        let a = registry.admit(&login("alice"), &link_a, &rules(4)).unwrap();
        let b = registry.admit(&login("bob"), &link_b, &rules(4)).unwrap();
        // Drain Bob's admission delta from Alice's stream.
        recv_message(&mut rx_a);

        registry.set_receives_commands(a.id, true);
        let command = ScheduledCommand {
            seq: 0,
            kind: lockstep_protocol::CommandKind::Sync,
            scope: lockstep_protocol::Scope::Global,
            origin_faction: FactionId::SHARED,
            execute_at_tick: 15,
            payload: vec![1],
        };
        registry.broadcast_command(&command, Some(b.id));

        let (kind, payload) = recv_message(&mut rx_a);
        assert_eq!(kind, ServerPacket::Command);
        assert_eq!(decode_body::<ScheduledCommand>(&payload).unwrap(), command);

        // Bob has no world yet: he only ever saw his own admission.
        link_b.close(DisconnectReason::Quit);
        let mut kinds = Vec::new();
        while let Ok((frame, _)) = crate::transport::TransportReceiver::recv_raw(&mut rx_b) {
            kinds.push(frame[0] & lockstep_protocol::wire::KIND_MASK);
        }
        assert!(!kinds.contains(&ServerPacket::Command.as_u8()));
    }

    #[test]
    fn keepalive_measures_latency_and_lag() {
        let registry = Registry::new();
        let (link, _rx) = loopback_link();
        let a = registry.admit(&login("alice"), &link, &rules(4)).unwrap();
        registry.enter_playing(a.id);

        let sent = Instant::now();
        registry.send_keepalives(sent);
        let stale = KeepAliveReply { id: 99, sim_tick: 0 };
        assert!(!registry.record_keepalive(a.id, &stale, sent, 100));

        let reply = KeepAliveReply { id: 0, sim_tick: 90 };
        assert!(registry.record_keepalive(a.id, &reply, sent + Duration::from_millis(40), 100));
        let info = registry.info(a.id).unwrap();
        assert_eq!(info.latency_ms, 40);
        assert_eq!(info.ticks_behind, 10);
    }
}
