// End-to-end integration tests for the lockstep pipeline.
//
// Each test starts a real relay, connects real NetClient instances (via
// TestGameClient) running a deterministic toy simulation, and verifies the
// full path: join → world transfer → command → scheduled tick → identical
// state on every participant.
//
// The relay clock runs for real here (short periods), so sims are paced by
// the ceilings the relay broadcasts, just as a live embedder would be.

use std::thread;
use std::time::{Duration, Instant};

use lockstep_protocol::{MapId, Role, Scope};
use lockstep_relay::{RelayConfig, RelayHandle, start_relay};
use multiplayer_tests::{POLL_TIMEOUT, TestGameClient, ToyAction, ToySim};
use test_log::test;

fn test_config() -> RelayConfig {
    RelayConfig {
        port: 0,
        session_name: "integration-test".into(),
        clock_period_ms: 10,
        ticks_per_period: 2,
        scheduling_delay: 15,
        ..RelayConfig::default()
    }
}

fn start_test_relay(config: RelayConfig) -> (RelayHandle, std::net::SocketAddr) {
    start_relay(config).expect("relay failed to start")
}

/// Tick after the last of `commands` executes.
fn after(commands: &[lockstep_protocol::ScheduledCommand]) -> u64 {
    commands
        .iter()
        .map(|c| c.execute_at_tick)
        .max()
        .expect("no commands")
        + 1
}

fn wait_for_join_point(handle: &RelayHandle, join_tick: u64) {
    let start = Instant::now();
    while handle.context().join_point().join_tick != join_tick {
        assert!(start.elapsed() < POLL_TIMEOUT, "join point never installed");
        thread::sleep(Duration::from_millis(10));
    }
}

/// Host asks for a join point through the relay and runs until it uploads.
fn make_join_point(handle: &RelayHandle, host: &mut TestGameClient) -> u64 {
    assert!(handle.create_join_point());
    host.wait_until("join point upload", |c| {
        c.advance(u64::MAX);
        !c.uploads.is_empty()
    });
    let join_tick = host.uploads[0];
    wait_for_join_point(handle, join_tick);
    join_tick
}

// ---------------------------------------------------------------------------
// Test scenarios
// ---------------------------------------------------------------------------

/// Both players send commands in both scopes. Both sims end up identical.
#[test]
fn two_players_converge() {
    let (handle, addr) = start_test_relay(test_config());
    let mut host = TestGameClient::connect(addr, "host");
    let mut joiner = TestGameClient::connect(addr, "joiner");
    assert_eq!(host.role, Role::Host);
    assert_eq!(joiner.role, Role::Regular);

    host.send(Scope::Global, ToyAction::Add(5));
    joiner.send(Scope::Global, ToyAction::Multiply(3));
    host.send(Scope::Map(MapId(1)), ToyAction::Add(2));
    joiner.send(Scope::Map(MapId(1)), ToyAction::Multiply(7));

    let commands = host.wait_for_commands(4);
    assert_eq!(joiner.wait_for_commands(4), commands);

    let target = after(&commands);
    host.run_until(target);
    joiner.run_until(target);
    assert_eq!(host.sim, joiner.sim);
    assert_eq!(host.sim.fingerprint(), joiner.sim.fingerprint());
    assert!(host.sim.online_factions.contains(&0));

    host.disconnect();
    joiner.disconnect();
    handle.stop();
}

/// Commands in one scope are numbered without gaps, whoever sent them.
#[test]
fn sequence_numbers_are_gapless_per_scope() {
    let (handle, addr) = start_test_relay(test_config());
    let mut host = TestGameClient::connect(addr, "host");
    let mut joiner = TestGameClient::connect(addr, "joiner");

    for i in 0..5 {
        host.send(Scope::Map(MapId(3)), ToyAction::Add(i));
        joiner.send(Scope::Map(MapId(3)), ToyAction::Add(i * 10));
    }
    let commands = host.wait_for_commands(10);
    let seqs: Vec<u64> = commands.iter().map(|c| c.seq).collect();
    assert_eq!(seqs, (0..10).collect::<Vec<_>>());
    assert!(
        commands
            .windows(2)
            .all(|w| w[0].execute_at_tick <= w[1].execute_at_tick)
    );

    host.disconnect();
    joiner.disconnect();
    handle.stop();
}

/// A join point prunes history; a late joiner starts from it and catches up.
#[test]
fn late_joiner_starts_from_join_point() {
    let (handle, addr) = start_test_relay(test_config());
    let mut host = TestGameClient::connect(addr, "host");
    host.send(Scope::Global, ToyAction::Add(10));
    host.wait_for_commands(1);

    let join_tick = make_join_point(&handle, &mut host);
    let ctx = handle.context();
    assert!(
        ctx.logs
            .entries(Scope::Global)
            .iter()
            .all(|c| c.execute_at_tick >= join_tick)
    );

    let mut late = TestGameClient::connect(addr, "late");
    assert_eq!(late.sim.tick, join_tick);

    let map = Scope::Map(MapId(2));
    host.send(map, ToyAction::Add(1));
    late.send(map, ToyAction::Multiply(4));
    let in_map = |c: &TestGameClient| {
        c.seen_commands()
            .into_iter()
            .filter(|cmd| cmd.scope == map)
            .collect::<Vec<_>>()
    };
    host.wait_until("map commands", |c| in_map(c).len() == 2);
    late.wait_until("map commands", |c| in_map(c).len() == 2);

    let target = after(&in_map(&host));
    host.run_until(target);
    late.run_until(target);
    assert_eq!(host.sim, late.sim);

    late.disconnect();
    host.disconnect();
    handle.stop();
}

/// Requesting the world again lands on exactly the same state.
#[test]
fn rejoin_is_idempotent() {
    let (handle, addr) = start_test_relay(test_config());
    let mut host = TestGameClient::connect(addr, "host");
    let mut joiner = TestGameClient::connect(addr, "joiner");

    host.send(Scope::Global, ToyAction::Add(3));
    joiner.send(Scope::Global, ToyAction::Multiply(5));
    let first = host.wait_for_commands(2);
    joiner.wait_for_commands(2);
    let target = after(&first);
    joiner.run_until(target);

    joiner.request_rejoin();
    joiner.wait_until("rejoined", |c| c.playing);

    host.send(Scope::Global, ToyAction::Add(-1));
    let all = host.wait_for_commands(3);
    joiner.wait_for_commands(3);
    let target = after(&all);
    host.run_until(target);
    joiner.run_until(target);
    assert_eq!(host.sim, joiner.sim);

    host.disconnect();
    joiner.disconnect();
    handle.stop();
}

/// Diverging fingerprints are flagged to everyone, and the diverging player
/// can fetch the host's trace.
#[test]
fn desync_detected_and_trace_exchanged() {
    let (handle, addr) = start_test_relay(test_config());
    let mut host = TestGameClient::connect(addr, "host");
    let mut joiner = TestGameClient::connect(addr, "joiner");

    let tick = host.ceiling.max(joiner.ceiling) + 5;
    host.run_until(tick);
    joiner.run_until(tick);
    assert_eq!(host.sim, joiner.sim);

    joiner.sim.global = 99;
    host.submit_opinion();
    joiner.submit_opinion();
    for client in [&mut host, &mut joiner] {
        client.wait_until("desync report", |c| !c.desyncs.is_empty());
        assert_eq!(client.desyncs[0].start_tick, tick);
    }

    joiner.request_trace(None, tick);
    joiner.wait_until("trace", |c| !c.traces.is_empty());
    let transfer = &joiner.traces[0];
    assert_eq!(transfer.source, host.player);
    let host_state: ToySim =
        serde_json::from_str(transfer.trace.as_deref().expect("host kept its trace")).unwrap();
    assert_eq!(host_state, host.sim);

    host.disconnect();
    joiner.disconnect();
    handle.stop();
}

/// A restarted relay resumes from its checkpoint: clock, join point and logs.
#[test]
fn relay_resumes_from_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.ckpt");
    let config = RelayConfig {
        checkpoint_path: Some(path.clone()),
        ..test_config()
    };

    let (handle, addr) = start_test_relay(config.clone());
    let mut host = TestGameClient::connect(addr, "host");
    host.send(Scope::Global, ToyAction::Add(42));
    host.wait_for_commands(1);
    let join_tick = make_join_point(&handle, &mut host);
    let saved = handle.context().join_point();
    host.disconnect();
    handle.stop();
    assert!(path.exists());

    let (handle, addr) = start_test_relay(RelayConfig {
        resume: true,
        ..config
    });
    assert!(handle.context().clock.now() >= join_tick);
    assert_eq!(handle.context().join_point().snapshot, saved.snapshot);

    let returning = TestGameClient::connect(addr, "host");
    assert_eq!(returning.sim.tick, join_tick);
    assert_eq!(
        returning.sim,
        ToySim::from_snapshot(join_tick, &saved.snapshot)
    );

    returning.disconnect();
    handle.stop();
}
