// Cooperative await layer.
//
// Some states are easiest to write as straight-line code: send A, wait for
// reply B, send C, wait for D. This module lets a state handler spawn such a
// task on a per-connection `LocalPool` and suspend it until a specific packet
// kind arrives.
//
// Rules:
// - At most one wait is outstanding per connection. Asking for a second one
//   fails immediately with `AwaitError::AlreadyWaiting`.
// - A pending wait takes priority over the state's route table: when its kind
//   arrives, the payload goes to the waiting task and nowhere else.
// - Every task belongs to the handler generation it was spawned under.
//   `LocalTasks::retire` ends a generation: `wait_for` waits never resolve and
//   their tasks are aborted, `wait_or_none` waits resolve with `None` so the
//   task can run its cleanup.
// - Tasks cannot touch the `Connection` directly. They ask for a transition
//   through `Waiter::transition`, and an `Err` they return becomes a fault of
//   the connection; the connection applies both after each poll.
//
// Everything here is single-threaded (`Rc`/`RefCell`). The pool is only polled
// from the connection's own reader thread, with `run_until_stalled`, so a
// suspended task never blocks anything else.

use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;

use bytes::Bytes;
use futures::channel::oneshot;
use futures::executor::LocalPool;
use futures::future::{self, AbortHandle, Abortable};
use futures::task::LocalSpawnExt;
use lockstep_protocol::PacketKind;

use crate::error::{AwaitError, ConnError};

struct PendingWait {
    kind: u8,
    reply: oneshot::Sender<Bytes>,
}

struct WaitSlot<St> {
    generation: u64,
    pending: Option<PendingWait>,
    aborts: Vec<AbortHandle>,
    transition: Option<St>,
    fault: Option<ConnError>,
}

/// The task pool of one connection.
pub struct LocalTasks<K, St> {
    pool: LocalPool,
    slot: Rc<RefCell<WaitSlot<St>>>,
    _kind: std::marker::PhantomData<K>,
}

impl<K: PacketKind, St: Copy + 'static> Default for LocalTasks<K, St> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: PacketKind, St: Copy + 'static> LocalTasks<K, St> {
    pub fn new() -> Self {
        Self {
            pool: LocalPool::new(),
            slot: Rc::new(RefCell::new(WaitSlot {
                generation: 0,
                pending: None,
                aborts: Vec::new(),
                transition: None,
                fault: None,
            })),
            _kind: std::marker::PhantomData,
        }
    }

    /// A handle bound to the current handler generation.
    pub fn waiter(&self) -> Waiter<K, St> {
        Waiter {
            slot: Rc::clone(&self.slot),
            generation: self.slot.borrow().generation,
            _kind: std::marker::PhantomData,
        }
    }

    /// Spawn a task for the current generation. It does not run until the
    /// next `run_until_stalled`.
    pub fn spawn<F>(&mut self, task: F) -> Result<(), ConnError>
    where
        F: Future<Output = Result<(), ConnError>> + 'static,
    {
        let (handle, registration) = AbortHandle::new_pair();
        let slot = Rc::clone(&self.slot);
        let generation = slot.borrow().generation;
        let task = Abortable::new(task, registration);
        self.pool
            .spawner()
            .spawn_local(async move {
                if let Ok(Err(err)) = task.await {
                    let mut slot = slot.borrow_mut();
                    if slot.generation == generation && slot.fault.is_none() {
                        slot.fault = Some(err);
                    }
                }
            })
            .map_err(|_| ConnError::Internal("task pool is shut down"))?;
        self.slot.borrow_mut().aborts.push(handle);
        Ok(())
    }

    /// Kind of the outstanding wait, if any.
    pub fn waiting_for(&self) -> Option<u8> {
        self.slot.borrow().pending.as_ref().map(|p| p.kind)
    }

    /// Hand a message to the pending wait if it is waiting for `kind`.
    /// Gives the payload back otherwise.
    pub fn try_resolve(&mut self, kind: u8, payload: Bytes) -> Result<(), Bytes> {
        let pending = {
            let mut slot = self.slot.borrow_mut();
            if slot.pending.as_ref().is_none_or(|p| p.kind != kind) {
                return Err(payload);
            }
            slot.pending.take()
        };
        if let Some(pending) = pending {
            // A dropped receiver means the task is gone; the message dies with it.
            let _ = pending.reply.send(payload);
        }
        Ok(())
    }

    pub fn run_until_stalled(&mut self) {
        self.pool.run_until_stalled();
    }

    pub fn take_fault(&mut self) -> Option<ConnError> {
        self.slot.borrow_mut().fault.take()
    }

    pub fn take_transition(&mut self) -> Option<St> {
        self.slot.borrow_mut().transition.take()
    }

    /// End the current generation. Cleanup waits resolve with `None` and run
    /// to their next suspension point; every task of the generation is then
    /// aborted.
    pub fn retire(&mut self) {
        let aborts = {
            let mut slot = self.slot.borrow_mut();
            slot.generation += 1;
            slot.pending = None;
            std::mem::take(&mut slot.aborts)
        };
        self.pool.run_until_stalled();
        for handle in aborts {
            handle.abort();
        }
        self.pool.run_until_stalled();

        let mut slot = self.slot.borrow_mut();
        slot.transition = None;
        slot.fault = None;
    }
}

/// Task-side handle for waiting on packets and requesting transitions.
pub struct Waiter<K, St> {
    slot: Rc<RefCell<WaitSlot<St>>>,
    generation: u64,
    _kind: std::marker::PhantomData<K>,
}

impl<K, St> Clone for Waiter<K, St> {
    fn clone(&self) -> Self {
        Self {
            slot: Rc::clone(&self.slot),
            generation: self.generation,
            _kind: std::marker::PhantomData,
        }
    }
}

impl<K: PacketKind, St: Copy + 'static> Waiter<K, St> {
    fn register(&self, kind: K) -> Result<oneshot::Receiver<Bytes>, AwaitError> {
        let (reply, receiver) = oneshot::channel();
        let mut slot = self.slot.borrow_mut();
        if slot.generation != self.generation {
            // Dead handler: `reply` is dropped and the wait resolves empty.
            return Ok(receiver);
        }
        if slot.pending.is_some() {
            return Err(AwaitError::AlreadyWaiting);
        }
        slot.pending = Some(PendingWait {
            kind: kind.as_u8(),
            reply,
        });
        Ok(receiver)
    }

    /// Suspend until `kind` arrives. If the handler is retired first, the
    /// future never completes and its task is aborted.
    pub fn wait_for(&self, kind: K) -> Result<impl Future<Output = Bytes> + use<K, St>, AwaitError> {
        let receiver = self.register(kind)?;
        Ok(async move {
            match receiver.await {
                Ok(payload) => payload,
                Err(_) => future::pending().await,
            }
        })
    }

    /// Suspend until `kind` arrives, or resolve with `None` once the handler
    /// is retired.
    pub fn wait_or_none(
        &self,
        kind: K,
    ) -> Result<impl Future<Output = Option<Bytes>> + use<K, St>, AwaitError> {
        let receiver = self.register(kind)?;
        Ok(async move { receiver.await.ok() })
    }

    /// Ask the connection to move to `state` once the current poll finishes.
    /// Ignored if this handler is already retired.
    pub fn transition(&self, state: St) {
        let mut slot = self.slot.borrow_mut();
        if slot.generation == self.generation {
            slot.transition = Some(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use lockstep_protocol::ClientPacket;

    use super::*;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum Phase {
        Next,
    }

    type Tasks = LocalTasks<ClientPacket, Phase>;

    #[test]
    fn wait_resolves_on_matching_kind() {
        let mut tasks = Tasks::new();
        let waiter = tasks.waiter();
        let got = Rc::new(RefCell::new(None));
        let got_task = Rc::clone(&got);
        tasks
            .spawn(async move {
                let payload = waiter.wait_for(ClientPacket::Protocol)?.await;
                *got_task.borrow_mut() = Some(payload);
                waiter.transition(Phase::Next);
                Ok(())
            })
            .unwrap();
        tasks.run_until_stalled();
        assert_eq!(tasks.waiting_for(), Some(ClientPacket::Protocol.as_u8()));

        let other = Bytes::from_static(b"no");
        assert_eq!(
            tasks.try_resolve(ClientPacket::Username.as_u8(), other.clone()),
            Err(other)
        );
        assert_eq!(
            tasks.try_resolve(ClientPacket::Protocol.as_u8(), Bytes::from_static(b"yes")),
            Ok(())
        );
        tasks.run_until_stalled();

        assert_eq!(got.borrow().as_deref(), Some(&b"yes"[..]));
        assert_eq!(tasks.take_transition(), Some(Phase::Next));
        assert_eq!(tasks.waiting_for(), None);
    }

    #[test]
    fn second_wait_is_refused_immediately() {
        let tasks = Tasks::new();
        let waiter = tasks.waiter();
        let _first = waiter.wait_for(ClientPacket::Protocol).unwrap();
        assert!(matches!(
            waiter.wait_or_none(ClientPacket::Username),
            Err(AwaitError::AlreadyWaiting)
        ));
    }

    #[test]
    fn retire_abandons_plain_waits() {
        let mut tasks = Tasks::new();
        let waiter = tasks.waiter();
        let resumed = Rc::new(Cell::new(false));
        let resumed_task = Rc::clone(&resumed);
        tasks
            .spawn(async move {
                waiter.wait_for(ClientPacket::WorldLoaded)?.await;
                resumed_task.set(true);
                Ok(())
            })
            .unwrap();
        tasks.run_until_stalled();
        tasks.retire();

        assert!(!resumed.get());
        assert_eq!(tasks.waiting_for(), None);
        // A late message no longer reaches the dead task.
        assert!(
            tasks
                .try_resolve(ClientPacket::WorldLoaded.as_u8(), Bytes::new())
                .is_err()
        );
    }

    #[test]
    fn retire_resolves_cleanup_waits_with_none() {
        let mut tasks = Tasks::new();
        let waiter = tasks.waiter();
        let outcome = Rc::new(Cell::new(None));
        let outcome_task = Rc::clone(&outcome);
        tasks
            .spawn(async move {
                let got = waiter.wait_or_none(ClientPacket::WorldLoaded)?.await;
                outcome_task.set(Some(got.is_some()));
                // Retired handlers cannot steer the connection any more.
                waiter.transition(Phase::Next);
                Ok(())
            })
            .unwrap();
        tasks.run_until_stalled();
        tasks.retire();

        assert_eq!(outcome.get(), Some(false));
        assert_eq!(tasks.take_transition(), None);
    }

    #[test]
    fn task_error_becomes_a_fault() {
        let mut tasks = Tasks::new();
        tasks
            .spawn(async { Err(ConnError::Internal("boom")) })
            .unwrap();
        tasks.run_until_stalled();
        assert!(matches!(
            tasks.take_fault(),
            Some(ConnError::Internal("boom"))
        ));
    }
}
