// Authoritative simulation clock.
//
// The relay owns the only tick counter that matters. A dedicated thread
// (`run_clock_loop`) advances it by `ticks_per_period` every
// `clock_period_ms` and broadcasts the new ceiling (`tick + scheduling_delay`,
// exclusive) to every playing participant. Clients run their simulation up to
// but not including the ceiling, so a command stamped with
// `execute_at_tick = tick + scheduling_delay` always arrives before anyone
// could have simulated past it.
//
// The tick lives behind a `RwLock`:
// - The clock step takes the write lock and broadcasts the ceiling while still
//   holding it.
// - Command stamping and join replays hold the read lock while they append or
//   snapshot, so no step can slip between "read the tick" and "everyone saw
//   the result".
//
// parking_lot's `RwLock` is fair: a thread must never take the read lock twice,
// or it deadlocks against a waiting writer. Code that already holds a guard
// passes the tick value down instead of calling `now()` again.
//
// The clock does not advance while it is frozen (host request), while nobody
// is playing, or while any `ClockHold` is outstanding (a participant loading
// the world with `pause_on_join`).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use lockstep_protocol::ServerPacket;
use lockstep_protocol::message::TimeControl;
use parking_lot::{RwLock, RwLockReadGuard};
use tracing::{debug, trace};

use crate::context::ServerContext;
use crate::registry::{Audience, Registry};

/// Longest single sleep of the clock thread, so `stop` is noticed quickly.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

pub struct Clock {
    tick: RwLock<u64>,
    frozen: AtomicBool,
    holds: Arc<AtomicUsize>,
    ticks_per_period: u64,
    scheduling_delay: u64,
}

/// Result of one clock period.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StepOutcome {
    pub before: u64,
    pub tick: u64,
    pub advanced: bool,
}

/// Keeps the clock still while alive.
pub struct ClockHold {
    holds: Arc<AtomicUsize>,
}

impl Drop for ClockHold {
    fn drop(&mut self) {
        self.holds.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Clock {
    pub fn new(start_tick: u64, ticks_per_period: u64, scheduling_delay: u64) -> Self {
        Self {
            tick: RwLock::new(start_tick),
            frozen: AtomicBool::new(false),
            holds: Arc::new(AtomicUsize::new(0)),
            ticks_per_period,
            scheduling_delay,
        }
    }

    /// Pin the tick for the lifetime of the guard.
    pub fn read(&self) -> RwLockReadGuard<'_, u64> {
        self.tick.read()
    }

    /// Current tick. Must not be called while holding `read()`.
    pub fn now(&self) -> u64 {
        *self.tick.read()
    }

    /// Jump to a restored tick (checkpoint resume, tests).
    pub fn restore(&self, tick: u64) {
        *self.tick.write() = tick;
    }

    pub fn scheduling_delay(&self) -> u64 {
        self.scheduling_delay
    }

    pub fn ceiling(&self, tick: u64) -> u64 {
        tick.saturating_add(self.scheduling_delay)
    }

    pub fn time_control(&self, tick: u64) -> TimeControl {
        TimeControl {
            ceiling: self.ceiling(tick),
            frozen: self.is_frozen(),
        }
    }

    pub fn hold(&self) -> ClockHold {
        self.holds.fetch_add(1, Ordering::SeqCst);
        ClockHold {
            holds: Arc::clone(&self.holds),
        }
    }

    pub fn holds(&self) -> usize {
        self.holds.load(Ordering::SeqCst)
    }

    pub fn set_frozen(&self, frozen: bool) {
        self.frozen.store(frozen, Ordering::SeqCst);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    /// One clock period: advance if allowed and tell the playing
    /// participants about the new ceiling.
    pub fn step(&self, registry: &Registry) -> StepOutcome {
        let mut tick = self.tick.write();
        let before = *tick;
        let advanced = !self.is_frozen() && self.holds() == 0 && registry.any_playing();
        if advanced {
            *tick = tick.saturating_add(self.ticks_per_period);
            registry.broadcast(
                Audience::Playing,
                ServerPacket::TimeControl,
                &self.time_control(*tick),
            );
            trace!(tick = *tick, "clock advanced");
        }
        StepOutcome {
            before,
            tick: *tick,
            advanced,
        }
    }
}

/// True if `interval` divides some tick in `(before, after]`.
fn crossed_multiple(before: u64, after: u64, interval: u64) -> bool {
    interval > 0 && after > before && before / interval != after / interval
}

/// Clock thread body. Runs until `keep_running` goes false.
pub fn run_clock_loop(ctx: Arc<ServerContext>, keep_running: Arc<AtomicBool>) {
    let period = Duration::from_millis(ctx.config.clock_period_ms.max(1));
    let keepalive_periods = ctx.config.keepalive_periods;
    let join_point_interval = ctx.config.join_point_interval;
    let mut deadline = Instant::now() + period;
    let mut periods: u64 = 0;

    while keep_running.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now < deadline {
            thread::sleep((deadline - now).min(SLEEP_SLICE));
            continue;
        }
        deadline += period;
        if deadline < now {
            // Fell behind (suspended process, debugger); do not burst.
            deadline = now + period;
        }
        periods += 1;

        let outcome = ctx.clock.step(&ctx.registry);

        if keepalive_periods > 0 && periods % keepalive_periods == 0 {
            ctx.broadcast_latencies();
            ctx.registry.send_keepalives(now);
        }

        if let Some(interval) = join_point_interval {
            if outcome.advanced && crossed_multiple(outcome.before, outcome.tick, interval) {
                debug!(tick = outcome.tick, "scheduled join point");
                ctx.create_join_point();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use lockstep_protocol::message::{Login, decode_body};

    use super::*;
    use crate::registry::AdmissionRules;
    use crate::test_support::{loopback_link, recv_message};

    fn playing_registry() -> (Registry, crate::transport::LoopbackReceiver) {
        let registry = Registry::new();
        let (link, rx) = loopback_link();
        let login = Login {
            username: "alice".into(),
            password: None,
            arbiter: false,
        };
        let rules = AdmissionRules {
            password: None,
            max_players: 4,
        };
        let info = registry.admit(&login, &link, &rules).unwrap();
        registry.enter_playing(info.id);
        (registry, rx)
    }

    #[test]
    fn idle_without_players() {
        let clock = Clock::new(0, 3, 15);
        let outcome = clock.step(&Registry::new());
        assert!(!outcome.advanced);
        assert_eq!(clock.now(), 0);
    }

    #[test]
    fn step_broadcasts_exclusive_ceiling() {
        let (registry, mut rx) = playing_registry();
        // Status delta from entering Playing.
        recv_message(&mut rx);

        let clock = Clock::new(100, 3, 15);
        let outcome = clock.step(&registry);
        assert_eq!(
            outcome,
            StepOutcome {
                before: 100,
                tick: 103,
                advanced: true
            }
        );
        let (kind, payload) = recv_message(&mut rx);
        assert_eq!(kind, ServerPacket::TimeControl);
        assert_eq!(
            decode_body::<TimeControl>(&payload).unwrap(),
            TimeControl {
                ceiling: 118,
                frozen: false
            }
        );
    }

    #[test]
    fn holds_and_freeze_stop_the_clock() {
        let (registry, _rx) = playing_registry();
        let clock = Clock::new(0, 3, 15);

        let hold = clock.hold();
        assert!(!clock.step(&registry).advanced);
        drop(hold);
        assert_eq!(clock.holds(), 0);

        clock.set_frozen(true);
        assert!(!clock.step(&registry).advanced);
        clock.set_frozen(false);
        assert!(clock.step(&registry).advanced);
        assert_eq!(clock.now(), 3);
    }

    #[test]
    fn join_point_interval_crossing() {
        assert!(crossed_multiple(98, 101, 100));
        assert!(crossed_multiple(97, 100, 100));
        assert!(!crossed_multiple(100, 103, 100));
        assert!(!crossed_multiple(5, 5, 100));
        assert!(!crossed_multiple(0, 3, 0));
    }
}
