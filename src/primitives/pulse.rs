//! Pulse(ms) (spec §4.5): a periodic, coalescing one-slot `true` signal.
//! A timer reschedules itself every `ms` milliseconds; each firing sets a
//! single pending flag and wakes one parked `recv`, so bursts of ticks that
//! nobody consumed in time collapse into a single buffered `true` rather
//! than queuing up. The self-rescheduling timer holds only a `Weak` back
//! to the pulse, so dropping the last `Pulse` handle lets it stop on its
//! own next firing instead of needing an explicit shutdown call.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

use crate::error::{Error, Result};
use crate::hub::Hub;
use crate::primitives::support::{self, Outcome, Waiter};

struct PulseInner {
    hub: Hub,
    period_ms: u64,
    pending: Cell<bool>,
    recv_waiter: RefCell<Option<Waiter<bool>>>,
    closed: Cell<bool>,
}

fn schedule_tick(weak: Weak<PulseInner>) {
    let Some(inner) = weak.upgrade() else { return };
    if inner.closed.get() {
        return;
    }
    let period = inner.period_ms;
    inner.hub.schedule_timeout(period, move || {
        let Some(inner) = weak.upgrade() else { return };
        if inner.closed.get() {
            return;
        }
        inner.pending.set(true);
        if let Some(waiter) = inner.recv_waiter.borrow_mut().take() {
            waiter.complete(&inner.hub, Ok(true));
        }
        schedule_tick(weak.clone());
    });
}

/// A periodic coalescing signal: `true` becomes available every `ms`
/// milliseconds, collapsing any unconsumed ticks into one.
#[derive(Clone)]
pub struct Pulse {
    inner: Rc<PulseInner>,
}

impl Pulse {
    pub fn new(hub: Hub, period_ms: u64) -> Self {
        let inner = Rc::new(PulseInner {
            hub,
            period_ms,
            pending: Cell::new(false),
            recv_waiter: RefCell::new(None),
            closed: Cell::new(false),
        });
        schedule_tick(Rc::downgrade(&inner));
        Pulse { inner }
    }

    pub fn recv(&self, timeout: Option<u64>) -> RecvFuture {
        RecvFuture {
            inner: self.inner.clone(),
            timeout,
            outcome: None,
        }
    }

    pub fn close(&self) {
        if self.inner.closed.replace(true) {
            return;
        }
        if let Some(waiter) = self.inner.recv_waiter.borrow_mut().take() {
            waiter.complete(&self.inner.hub, Err(Error::Closed));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }
}

pub struct RecvFuture {
    inner: Rc<PulseInner>,
    timeout: Option<u64>,
    outcome: Option<Outcome<bool>>,
}

impl Future for RecvFuture {
    type Output = Result<bool>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<bool>> {
        let this = self.get_mut();

        if let Some(outcome) = &this.outcome {
            return match outcome.borrow_mut().take() {
                Some(result) => Poll::Ready(result),
                None => Poll::Pending,
            };
        }

        let inner = this.inner.clone();

        if inner.pending.replace(false) {
            return Poll::Ready(Ok(true));
        }
        if inner.closed.get() {
            return Poll::Ready(Err(Error::Closed));
        }
        if inner.hub.is_stopping() {
            return Poll::Ready(Err(Error::Stop));
        }
        if this.timeout == Some(0) {
            return Poll::Ready(Err(Error::Timeout));
        }

        let (waiter, outcome) = support::park(&inner.hub, cx.waker().clone(), this.timeout);
        *inner.recv_waiter.borrow_mut() = Some(waiter);
        this.outcome = Some(outcome);
        Poll::Pending
    }
}

impl Drop for RecvFuture {
    fn drop(&mut self) {
        let Some(outcome) = &self.outcome else { return };
        let mut slot = self.inner.recv_waiter.borrow_mut();
        let is_ours = slot.as_ref().is_some_and(|w| Rc::ptr_eq(&w.outcome, outcome));
        if is_ours {
            if let Some(w) = slot.take() {
                support::cancel(&self.inner.hub, w.timer, w.halt_hook);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesces_ticks_and_times_out_between_them() {
        let hub = Hub::new();
        let pulse = Pulse::new(hub.clone(), 20);
        let results = Rc::new(RefCell::new(Vec::new()));
        let r = results.clone();
        let h = hub.clone();
        hub.spawn(async move {
            r.borrow_mut().push(pulse.recv(Some(0)).await);

            h.sleep(25).await;
            r.borrow_mut().push(pulse.recv(None).await);

            r.borrow_mut().push(pulse.recv(Some(0)).await);
        });
        hub.run();

        let results = results.borrow();
        assert!(matches!(results[0], Err(Error::Timeout)));
        assert!(matches!(results[1], Ok(true)));
        assert!(matches!(results[2], Err(Error::Timeout)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn close_fails_the_parked_recv() {
        let hub = Hub::new();
        let pulse = Pulse::new(hub, 1_000);
        let recv = pulse.recv(None);
        futures::pin_mut!(recv);
        let waker = crate::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(recv.as_mut().poll(&mut cx).is_pending());
        pulse.close();
        assert!(matches!(recv.as_mut().poll(&mut cx), Poll::Ready(Err(Error::Closed))));
    }
}
