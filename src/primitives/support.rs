//! Shared waiter/timeout/halt-hook plumbing reused by every derived
//! primitive in this module. Each primitive (`Queue`, `Dealer`, `Router`,
//! `Channel`, `Value`, `Pulse`) parks a task the same way `Pipe` does
//! (spec §4.3/§5 "cancellation and timeouts"): a one-shot outcome slot, an
//! optional timer that delivers `Timeout`, and a halt hook that delivers
//! `Halt` during hub teardown. Factoring it out here is what keeps each
//! primitive's own file down to just its delivery policy (FIFO-of-one,
//! FIFO-of-many, last-write-wins, coalescing, ...).

use std::cell::RefCell;
use std::rc::Rc;
use std::task::Waker;

use crate::error::{Error, Result};
use crate::hub::Hub;
use crate::scheduler::TimerHandle;

pub(crate) type Outcome<V> = Rc<RefCell<Option<Result<V>>>>;

/// A parked task waiting on some primitive-specific condition.
pub(crate) struct Waiter<V> {
    pub waker: Waker,
    pub outcome: Outcome<V>,
    pub timer: Option<TimerHandle>,
    pub halt_hook: Option<u64>,
}

impl<V> Waiter<V> {
    /// Deliver `result` and wake the parked task, unless it already
    /// resolved (e.g. its timeout fired the instant before this ran).
    pub fn complete(self, hub: &Hub, result: Result<V>) {
        if let Some(timer) = self.timer {
            hub.cancel_timeout(timer);
        }
        if let Some(id) = self.halt_hook {
            hub.unregister_halt_hook(id);
        }
        let mut slot = self.outcome.borrow_mut();
        if slot.is_none() {
            *slot = Some(result);
            drop(slot);
            self.waker.wake();
        }
    }
}

/// Build a fresh parked `Waiter` for `waker`, wiring up `timeout`'s timer
/// (if any) and a halt hook, both targeting the same outcome cell. Returns
/// the waiter (to store wherever the primitive keeps its waiters) and a
/// clone of the outcome cell (to poll on subsequent `poll` calls).
pub(crate) fn park<V: 'static>(hub: &Hub, waker: Waker, timeout: Option<u64>) -> (Waiter<V>, Outcome<V>) {
    let outcome: Outcome<V> = Rc::new(RefCell::new(None));

    let timer = timeout.map(|ms| {
        let outcome = outcome.clone();
        let waker = waker.clone();
        hub.schedule_timeout(ms, move || {
            let mut slot = outcome.borrow_mut();
            if slot.is_none() {
                *slot = Some(Err(Error::Timeout));
                drop(slot);
                waker.wake();
            }
        })
    });

    let halt_outcome = outcome.clone();
    let halt_waker = waker.clone();
    let halt_hook = hub.register_halt_hook(move || {
        let mut slot = halt_outcome.borrow_mut();
        if slot.is_none() {
            *slot = Some(Err(Error::Halt));
            drop(slot);
            halt_waker.wake();
        }
    });

    let waiter = Waiter {
        waker,
        outcome: outcome.clone(),
        timer,
        halt_hook: Some(halt_hook),
    };
    (waiter, outcome)
}

/// Tear down a waiter's timer/halt hook without delivering a result —
/// called from a future's `Drop` when it's cancelled (dropped) before its
/// outcome resolved, mirroring `Pipe`'s `SendFuture`/`RecvFuture` drop glue.
pub(crate) fn cancel(hub: &Hub, timer: Option<TimerHandle>, halt_hook: Option<u64>) {
    if let Some(timer) = timer {
        hub.cancel_timeout(timer);
    }
    if let Some(id) = halt_hook {
        hub.unregister_halt_hook(id);
    }
}
