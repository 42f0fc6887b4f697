//! The select multiplexer (spec §4.4): wait on the first readiness among a
//! set of endpoints of possibly different payload types.
//!
//! Senders and recvers of different `T` don't share a type, so a mixed set
//! needs type erasure: [`Case`] is the object-safe surface every endpoint
//! implements, and the winning value comes back boxed behind `dyn Any` for
//! the caller to downcast. There's no teacher analogue for this (veloce's
//! channels are strictly 1:1, with nothing resembling a wait-on-any); this
//! is built directly from the Pipe's own `send_ready_watchers`/
//! `recv_ready_watchers` registration points (spec §9 "select without
//! races").

use std::any::Any;
use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::error::{Error, Result};
use crate::hub::Hub;
use crate::pipe::{Recver, Sender};
use crate::scheduler::TimerHandle;

/// One arm of a [`select`] call.
///
/// For a sender, "ready" means a recver is parked on its pipe (or the pipe
/// has closed/been abandoned, so the caller's subsequent `send` fails fast
/// rather than parking). For a recver, "ready" means a sender is parked, or
/// the pipe has closed/been abandoned.
pub trait Case {
    /// Would acting on this endpoint right now complete without parking?
    fn is_ready(&self) -> bool;

    /// Perform the endpoint's operation, assuming `is_ready()` just returned
    /// true. For a sender this never actually sends (the spec's contract:
    /// the caller calls `send` itself afterward) — it only turns a
    /// closed/abandoned pipe into the matching error. For a recver this
    /// performs the full rendezvous and returns the boxed value.
    fn complete(&self) -> Result<Option<Box<dyn Any>>>;

    /// Register to be woken the next time this endpoint's readiness
    /// changes. One-shot per the Pipe's own watcher lists — call again on
    /// every poll that doesn't resolve.
    fn watch(&self, waker: Waker);
}

impl<T: 'static> Case for Sender<T> {
    fn is_ready(&self) -> bool {
        self.recver_parked() || self.is_closed() || !self.recver_alive()
    }

    fn complete(&self) -> Result<Option<Box<dyn Any>>> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        if !self.recver_alive() {
            return Err(Error::Abandoned);
        }
        Ok(None)
    }

    fn watch(&self, waker: Waker) {
        self.watch_send_ready(waker);
    }
}

impl<T: 'static> Case for Recver<T> {
    fn is_ready(&self) -> bool {
        self.sender_parked() || self.is_closed() || !self.sender_alive()
    }

    fn complete(&self) -> Result<Option<Box<dyn Any>>> {
        match self.try_recv_now() {
            Some(Ok(value)) => Ok(Some(Box::new(value))),
            Some(Err(err)) => Err(err),
            None => unreachable!("Case::complete called without a prior is_ready() == true"),
        }
    }

    fn watch(&self, waker: Waker) {
        self.watch_recv_ready(waker);
    }
}

/// Wait on the first ready endpoint in `cases`, in argument order. Returns
/// the winning index and its boxed value (`None` for a sender-readiness
/// win — the caller is expected to then call `send` on that endpoint).
pub fn select<'a>(hub: &Hub, cases: &'a [&'a dyn Case], timeout: Option<u64>) -> SelectFuture<'a> {
    SelectFuture {
        hub: hub.clone(),
        cases,
        timeout,
        timer: None,
        fired: Rc::new(Cell::new(false)),
    }
}

pub struct SelectFuture<'a> {
    hub: Hub,
    cases: &'a [&'a dyn Case],
    timeout: Option<u64>,
    timer: Option<TimerHandle>,
    fired: Rc<Cell<bool>>,
}

impl<'a> Future for SelectFuture<'a> {
    type Output = Result<(usize, Option<Box<dyn Any>>)>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if this.fired.get() {
            return Poll::Ready(Err(Error::Timeout));
        }

        for (index, case) in this.cases.iter().enumerate() {
            if case.is_ready() {
                return Poll::Ready(case.complete().map(|value| (index, value)));
            }
        }

        if this.hub.is_stopping() {
            return Poll::Ready(Err(Error::Stop));
        }
        if this.timeout == Some(0) {
            return Poll::Ready(Err(Error::Timeout));
        }

        if this.timer.is_none() {
            if let Some(ms) = this.timeout {
                let fired = this.fired.clone();
                let waker = cx.waker().clone();
                this.timer = Some(this.hub.schedule_timeout(ms, move || {
                    fired.set(true);
                    waker.wake();
                }));
            }
        }

        for case in this.cases {
            case.watch(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl<'a> Drop for SelectFuture<'a> {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            self.hub.cancel_timeout(timer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::channel;

    #[tokio::test(flavor = "current_thread")]
    async fn sender_readiness_wins_over_recver_and_carries_no_value() {
        let hub = Hub::new();
        let (p1_tx, p1_rx) = channel::<i32>(hub.clone());
        let (p2_tx, p2_rx) = channel::<i32>(hub.clone());

        // Park a recver on P1 so P1's sender is select-ready.
        let recv_p1 = p1_rx.recv(None);
        futures::pin_mut!(recv_p1);
        let waker = crate::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(recv_p1.as_mut().poll(&mut cx).is_pending());

        // Park a sender on P2 so P2's recver is select-ready too.
        let send_p2 = p2_tx.send(10, None);
        futures::pin_mut!(send_p2);
        assert!(send_p2.as_mut().poll(&mut cx).is_pending());

        let cases: Vec<&dyn Case> = vec![&p1_tx, &p2_rx];
        let (index, value) = select(&hub, &cases, None).await.unwrap();
        assert_eq!(index, 0);
        assert!(value.is_none());

        p1_tx.send(20, None).await.unwrap();
        assert_eq!(recv_p1.as_mut().poll(&mut cx), Poll::Ready(Ok(20)));

        let cases: Vec<&dyn Case> = vec![&p2_rx];
        let (index, value) = select(&hub, &cases, None).await.unwrap();
        assert_eq!(index, 0);
        assert_eq!(*value.unwrap().downcast::<i32>().unwrap(), 10);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn zero_timeout_with_nothing_ready_times_out() {
        let hub = Hub::new();
        let (_tx, rx) = channel::<i32>(hub.clone());
        let cases: Vec<&dyn Case> = vec![&rx];
        let result = select(&hub, &cases, Some(0)).await;
        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn both_ready_resolves_without_parking() {
        let hub = Hub::new();
        let (tx_a, rx_a) = channel::<i32>(hub.clone());
        let (tx_b, rx_b) = channel::<i32>(hub.clone());
        tx_a.close();
        tx_b.close();
        let cases: Vec<&dyn Case> = vec![&rx_a, &rx_b];
        let result = select(&hub, &cases, None).await;
        assert!(matches!(result, Err(Error::Closed)));
    }
}
