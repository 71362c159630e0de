// Desync detection and trace exchange.
//
// Participants periodically report a fingerprint of their simulation over an
// interval starting at `start_tick` (a `SyncOpinion`). The relay keeps the most
// recent `capacity` opinions per participant and compares each new one against
// every other participant's retained opinion for the same start tick. The first
// mismatch for a tick flags it; later reports for the same tick are compared
// but never flagged twice.
//
// Trace exchange is diagnostic only. A participant asks for another's detailed
// trace for a start tick. If the target's retained opinion already carries an
// inline trace it is returned at once; otherwise the relay forwards a query to
// the target under a fresh request id and relays the response back to the
// requester only. Responses are accepted only from the participant that was
// asked. At most `MAX_PENDING_TRACES` queries are outstanding; past that the
// oldest is given up and its requester gets an empty transfer.
//
// Nothing here sends anything. The caller (`context.rs`) turns the returned
// values into messages.

use std::collections::{BTreeMap, VecDeque};

use lockstep_protocol::PlayerId;
use lockstep_protocol::message::{
    DesyncDetected, SyncOpinion, TraceQuery, TraceResponse, TraceTransfer,
};
use parking_lot::Mutex;
use tracing::debug;

/// Flagged ticks remembered, so a tick is never reported twice.
const FLAGGED_MEMORY: usize = 256;

/// Trace queries awaiting a response, across all participants.
pub const MAX_PENDING_TRACES: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct PendingTrace {
    requester: PlayerId,
    target: PlayerId,
    start_tick: u64,
}

#[derive(Default)]
struct Exchange {
    opinions: BTreeMap<PlayerId, VecDeque<SyncOpinion>>,
    flagged: VecDeque<u64>,
    next_request: u32,
    /// Oldest first.
    pending: VecDeque<(u32, PendingTrace)>,
}

/// How a trace request is served.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TraceRoute {
    /// The trace (or its absence) is already known.
    Immediate {
        requester: PlayerId,
        transfer: TraceTransfer,
    },
    /// Ask `target` for it. `evicted` is the oldest outstanding request,
    /// dropped to make room, with the empty transfer its requester is owed.
    Relay {
        target: PlayerId,
        query: TraceQuery,
        evicted: Option<(PlayerId, TraceTransfer)>,
    },
}

pub struct DesyncExchange {
    state: Mutex<Exchange>,
    capacity: usize,
}

impl DesyncExchange {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(Exchange::default()),
            capacity: capacity.max(1),
        }
    }

    /// Retain an opinion and compare it. Returns the desync report the first
    /// time its start tick disagrees.
    pub fn submit(&self, source: PlayerId, opinion: SyncOpinion) -> Option<DesyncDetected> {
        let mut state = self.state.lock();
        let start_tick = opinion.start_tick;
        let digest = opinion.digest;

        let ring = state.opinions.entry(source).or_default();
        ring.retain(|o| o.start_tick != start_tick);
        ring.push_back(opinion);
        while ring.len() > self.capacity {
            ring.pop_front();
        }

        let mut sources = Vec::new();
        let mut disagree = false;
        for (player, ring) in &state.opinions {
            if let Some(other) = ring.iter().find(|o| o.start_tick == start_tick) {
                sources.push(*player);
                disagree |= other.digest != digest;
            }
        }
        if !disagree || state.flagged.contains(&start_tick) {
            return None;
        }

        state.flagged.push_back(start_tick);
        while state.flagged.len() > FLAGGED_MEMORY {
            state.flagged.pop_front();
        }
        Some(DesyncDetected {
            start_tick,
            players: sources,
        })
    }

    pub fn opinion(&self, source: PlayerId, start_tick: u64) -> Option<SyncOpinion> {
        let state = self.state.lock();
        state
            .opinions
            .get(&source)?
            .iter()
            .find(|o| o.start_tick == start_tick)
            .cloned()
    }

    pub fn request_trace(
        &self,
        requester: PlayerId,
        target: PlayerId,
        start_tick: u64,
    ) -> TraceRoute {
        let mut state = self.state.lock();
        let inline = state
            .opinions
            .get(&target)
            .and_then(|ring| ring.iter().find(|o| o.start_tick == start_tick))
            .and_then(|o| o.trace.clone());
        if let Some(trace) = inline {
            return TraceRoute::Immediate {
                requester,
                transfer: TraceTransfer {
                    source: target,
                    start_tick,
                    trace: Some(trace),
                },
            };
        }

        let request_id = state.next_request;
        state.next_request = state.next_request.wrapping_add(1);
        let evicted = if state.pending.len() >= MAX_PENDING_TRACES {
            state.pending.pop_front().map(|(id, oldest)| {
                debug!(request_id = id, target = ?oldest.target, "trace request given up");
                (
                    oldest.requester,
                    TraceTransfer {
                        source: oldest.target,
                        start_tick: oldest.start_tick,
                        trace: None,
                    },
                )
            })
        } else {
            None
        };
        state.pending.push_back((
            request_id,
            PendingTrace {
                requester,
                target,
                start_tick,
            },
        ));
        debug!(?requester, ?target, start_tick, request_id, "relaying trace request");
        TraceRoute::Relay {
            target,
            query: TraceQuery {
                request_id,
                start_tick,
            },
            evicted,
        }
    }

    /// Match a response to its request. Returns where to forward it.
    pub fn complete_trace(
        &self,
        responder: PlayerId,
        response: TraceResponse,
    ) -> Option<(PlayerId, TraceTransfer)> {
        let mut state = self.state.lock();
        let index = state
            .pending
            .iter()
            .position(|(id, _)| *id == response.request_id)?;
        let pending = state.pending[index].1;
        if pending.target != responder {
            debug!(?responder, request_id = response.request_id, "trace response from wrong participant");
            return None;
        }
        state.pending.remove(index);
        Some((
            pending.requester,
            TraceTransfer {
                source: responder,
                start_tick: pending.start_tick,
                trace: response.trace,
            },
        ))
    }

    /// Drop a departed participant. Requests still waiting on it are answered
    /// with an empty trace; requests it made are discarded.
    pub fn forget(&self, player: PlayerId) -> Vec<(PlayerId, TraceTransfer)> {
        let mut state = self.state.lock();
        state.opinions.remove(&player);
        let mut answered = Vec::new();
        state.pending.retain(|(_, pending)| {
            if pending.target == player && pending.requester != player {
                answered.push((
                    pending.requester,
                    TraceTransfer {
                        source: player,
                        start_tick: pending.start_tick,
                        trace: None,
                    },
                ));
            }
            pending.target != player && pending.requester != player
        });
        answered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opinion(start_tick: u64, digest: u64, trace: Option<&str>) -> SyncOpinion {
        SyncOpinion {
            start_tick,
            digest,
            trace: trace.map(str::to_owned),
        }
    }

    const A: PlayerId = PlayerId(0);
    const B: PlayerId = PlayerId(1);
    const C: PlayerId = PlayerId(2);

    #[test]
    fn differing_digests_flag_the_tick_once() {
        let exchange = DesyncExchange::new(8);
        assert_eq!(exchange.submit(A, opinion(500, 1, None)), None);
        assert_eq!(
            exchange.submit(B, opinion(500, 2, None)),
            Some(DesyncDetected {
                start_tick: 500,
                players: vec![A, B]
            })
        );
        assert_eq!(exchange.submit(C, opinion(500, 3, None)), None);
    }

    #[test]
    fn agreement_is_silent() {
        let exchange = DesyncExchange::new(8);
        exchange.submit(A, opinion(500, 7, None));
        assert_eq!(exchange.submit(B, opinion(500, 7, None)), None);
        assert_eq!(exchange.submit(C, opinion(400, 9, None)), None);
    }

    #[test]
    fn ring_is_bounded() {
        let exchange = DesyncExchange::new(2);
        for tick in [100, 200, 300] {
            exchange.submit(A, opinion(tick, 1, None));
        }
        assert_eq!(exchange.opinion(A, 100), None);
        assert!(exchange.opinion(A, 300).is_some());
        // A no longer holds 100, so B's report has nothing to disagree with.
        assert_eq!(exchange.submit(B, opinion(100, 2, None)), None);
    }

    #[test]
    fn inline_trace_is_served_immediately() {
        let exchange = DesyncExchange::new(8);
        exchange.submit(A, opinion(500, 1, Some("a-trace")));
        exchange.submit(B, opinion(500, 2, Some("b-trace")));
        match exchange.request_trace(B, A, 500) {
            TraceRoute::Immediate {
                requester,
                transfer,
            } => {
                assert_eq!(requester, B);
                assert_eq!(transfer.source, A);
                assert_eq!(transfer.trace.as_deref(), Some("a-trace"));
            }
            other => panic!("expected immediate trace, got {other:?}"),
        }
    }

    #[test]
    fn relayed_trace_goes_back_to_the_requester_only() {
        let exchange = DesyncExchange::new(8);
        exchange.submit(A, opinion(500, 1, None));
        let TraceRoute::Relay { target, query, .. } = exchange.request_trace(B, A, 500) else {
            panic!("expected a relayed request");
        };
        assert_eq!(target, A);

        let response = TraceResponse {
            request_id: query.request_id,
            trace: Some("a-trace".into()),
        };
        assert_eq!(exchange.complete_trace(C, response.clone()), None);
        let (to, transfer) = exchange.complete_trace(A, response.clone()).unwrap();
        assert_eq!(to, B);
        assert_eq!(transfer.trace.as_deref(), Some("a-trace"));
        // Answered requests are gone.
        assert_eq!(exchange.complete_trace(A, response), None);
    }

    #[test]
    fn departed_target_answers_empty() {
        let exchange = DesyncExchange::new(8);
        let TraceRoute::Relay { .. } = exchange.request_trace(B, A, 500) else {
            panic!("expected a relayed request");
        };
        let answered = exchange.forget(A);
        assert_eq!(answered.len(), 1);
        assert_eq!(answered[0].0, B);
        assert_eq!(answered[0].1.trace, None);
    }

    #[test]
    fn outstanding_requests_are_capped() {
        let exchange = DesyncExchange::new(8);
        let mut first = None;
        for tick in 0..MAX_PENDING_TRACES as u64 {
            let TraceRoute::Relay { query, evicted, .. } = exchange.request_trace(B, A, tick)
            else {
                panic!("expected a relayed request");
            };
            assert_eq!(evicted, None);
            first.get_or_insert(query);
        }

        // One more pushes out the oldest, which is answered empty.
        let TraceRoute::Relay { evicted, .. } = exchange.request_trace(C, A, 9_999) else {
            panic!("expected a relayed request");
        };
        let (to, transfer) = evicted.unwrap();
        assert_eq!(to, B);
        assert_eq!(transfer.source, A);
        assert_eq!(transfer.start_tick, 0);
        assert_eq!(transfer.trace, None);

        // A late response to the evicted query goes nowhere.
        let late = TraceResponse {
            request_id: first.unwrap().request_id,
            trace: Some("late".into()),
        };
        assert_eq!(exchange.complete_trace(A, late), None);
        assert_eq!(exchange.forget(A).len(), MAX_PENDING_TRACES);
    }
}
