//! Shared state behind a [`super::Sender`]/[`super::Recver`] pair.
//!
//! This is the single-threaded generalization of veloce's `spsc::Channel`:
//! where veloce guards a multi-item ring buffer with atomic head/tail
//! cursors and an `AtomicWaker` per side (because its two ends may live on
//! different threads), a `Pipe` has no buffer at all — it is a pure
//! rendezvous — and its two waiter slots are plain `RefCell`s, because a
//! `Hub` only ever runs on the thread that owns it.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::task::Waker;

use crate::error::{Error, Result};
use crate::hub::Hub;
use crate::scheduler::TimerHandle;

/// A single parked sender: the value it wants to hand off, and enough state
/// for whoever completes the rendezvous (a recver, a timeout, a close, an
/// abandonment, or hub teardown) to deliver exactly one outcome.
pub(crate) type Outcome<T> = Rc<RefCell<Option<T>>>;

pub(crate) struct SendWaiter<T> {
    pub value: Cell<Option<T>>,
    pub waker: Waker,
    pub outcome: Outcome<Result<()>>,
    pub timer: Option<TimerHandle>,
    pub halt_hook: Option<u64>,
}

pub(crate) struct RecvWaiter<T> {
    pub waker: Waker,
    pub outcome: Outcome<Result<T>>,
    pub timer: Option<TimerHandle>,
    pub halt_hook: Option<u64>,
}

pub(crate) struct PipeInner<T> {
    pub hub: Hub,
    pub sender_waiter: RefCell<Option<SendWaiter<T>>>,
    pub recver_waiter: RefCell<Option<RecvWaiter<T>>>,
    pub closed: Cell<bool>,
    pub sender_alive: Cell<bool>,
    pub recver_alive: Cell<bool>,
    /// Woken whenever the pipe transitions into "a send would succeed"
    /// (a recver parks, or the pipe closes/the recver is abandoned). Used
    /// only by `select`, which otherwise has no way to hear about a
    /// just-parked recver without itself being the one parking.
    pub send_ready_watchers: RefCell<Vec<Waker>>,
    /// Symmetric: woken whenever "a recv would succeed".
    pub recv_ready_watchers: RefCell<Vec<Waker>>,
}

fn notify(watchers: &RefCell<Vec<Waker>>) {
    for waker in watchers.borrow_mut().drain(..) {
        waker.wake();
    }
}

impl<T> PipeInner<T> {
    pub fn new(hub: Hub) -> Rc<Self> {
        Rc::new(PipeInner {
            hub,
            sender_waiter: RefCell::new(None),
            recver_waiter: RefCell::new(None),
            closed: Cell::new(false),
            sender_alive: Cell::new(true),
            recver_alive: Cell::new(true),
            send_ready_watchers: RefCell::new(Vec::new()),
            recv_ready_watchers: RefCell::new(Vec::new()),
        })
    }

    /// Record a parked sender and notify anyone watching for recv-readiness.
    pub fn park_sender(&self, waiter: SendWaiter<T>) {
        *self.sender_waiter.borrow_mut() = Some(waiter);
        notify(&self.recv_ready_watchers);
    }

    /// Record a parked recver and notify anyone watching for send-readiness.
    pub fn park_recver(&self, waiter: RecvWaiter<T>) {
        *self.recver_waiter.borrow_mut() = Some(waiter);
        notify(&self.send_ready_watchers);
    }

    /// Called from `Sender::drop` when the last sender handle goes away.
    pub fn abandon_sender(&self) {
        if !self.sender_alive.replace(false) {
            return;
        }
        if let Some(waiter) = self.recver_waiter.borrow_mut().take() {
            complete_recv(waiter, &self.hub, Err(Error::Abandoned));
        }
        notify(&self.recv_ready_watchers);
    }

    /// Called from `Recver::drop` when the last recver handle goes away.
    pub fn abandon_recver(&self) {
        if !self.recver_alive.replace(false) {
            return;
        }
        if let Some(waiter) = self.sender_waiter.borrow_mut().take() {
            complete_send(waiter, &self.hub, Err(Error::Abandoned));
        }
        notify(&self.send_ready_watchers);
    }

    /// Shared by both `Sender::close` and `Recver::close`: either side
    /// closing transitions the whole pipe, waking the opposite waiter with
    /// `Closed`. Idempotent.
    pub fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        if let Some(waiter) = self.sender_waiter.borrow_mut().take() {
            complete_send(waiter, &self.hub, Err(Error::Closed));
        }
        if let Some(waiter) = self.recver_waiter.borrow_mut().take() {
            complete_recv(waiter, &self.hub, Err(Error::Closed));
        }
        notify(&self.send_ready_watchers);
        notify(&self.recv_ready_watchers);
    }
}

pub(crate) fn complete_send<T>(waiter: SendWaiter<T>, hub: &Hub, result: Result<()>) {
    if let Some(timer) = waiter.timer {
        hub.cancel_timeout(timer);
    }
    if let Some(id) = waiter.halt_hook {
        hub.unregister_halt_hook(id);
    }
    let mut slot = waiter.outcome.borrow_mut();
    if slot.is_none() {
        *slot = Some(result);
        drop(slot);
        waiter.waker.wake();
    }
}

pub(crate) fn complete_recv<T>(waiter: RecvWaiter<T>, hub: &Hub, result: Result<T>) {
    if let Some(timer) = waiter.timer {
        hub.cancel_timeout(timer);
    }
    if let Some(id) = waiter.halt_hook {
        hub.unregister_halt_hook(id);
    }
    let mut slot = waiter.outcome.borrow_mut();
    if slot.is_none() {
        *slot = Some(result);
        drop(slot);
        waiter.waker.wake();
    }
}
