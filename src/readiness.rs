//! Shared waker bookkeeping for anything that parks on raw fd readiness
//! (spec §4.7/§4.9): [`crate::descriptor::Descriptor`] and the TCP
//! listener/connect futures in [`crate::net::tcp`] all register the same
//! shape of "wake me on IN" / "wake me on OUT" with the `Hub`'s
//! [`crate::hub::ReadinessTarget`] trait; this factors that bookkeeping out
//! so neither module re-derives it.

use std::cell::RefCell;
use std::task::Waker;

use crate::poller::mask;

#[derive(Default)]
pub(crate) struct Readiness {
    readable: RefCell<Vec<Waker>>,
    writable: RefCell<Vec<Waker>>,
}

impl Readiness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watch_readable(&self, waker: Waker) {
        self.readable.borrow_mut().push(waker);
    }

    pub fn watch_writable(&self, waker: Waker) {
        self.writable.borrow_mut().push(waker);
    }

    /// Dispatch a raw poller mask: wake readers on `IN`/`HUP`/`ERR`/`RDHUP`,
    /// writers on `OUT`/`ERR`. Edge-triggered readiness means a spurious
    /// wake just costs one extra non-blocking syscall attempt, never a
    /// missed event.
    pub fn on_ready(&self, bits: u32) {
        if bits & (mask::IN | mask::HUP | mask::ERR | mask::RDHUP) != 0 {
            for waker in self.readable.borrow_mut().drain(..) {
                waker.wake();
            }
        }
        if bits & (mask::OUT | mask::ERR) != 0 {
            for waker in self.writable.borrow_mut().drain(..) {
                waker.wake();
            }
        }
    }

    pub fn wake_all(&self) {
        for waker in self.readable.borrow_mut().drain(..) {
            waker.wake();
        }
        for waker in self.writable.borrow_mut().drain(..) {
            waker.wake();
        }
    }
}
