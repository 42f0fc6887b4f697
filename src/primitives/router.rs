//! Router (spec §4.5): fair many-to-1 handoff, the mirror image of
//! `Dealer`. Any number of sender handles may be cloned from the one
//! returned; `recv` wakes exactly one waiting sender, oldest first.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use crate::error::{Error, Result};
use crate::hub::Hub;
use crate::primitives::support::{self, Outcome, Waiter};

struct SendSlot<T> {
    value: Cell<Option<T>>,
    waiter: Waiter<()>,
}

struct RouterInner<T> {
    hub: Hub,
    sender_waiters: RefCell<VecDeque<SendSlot<T>>>,
    recver_waiter: RefCell<Option<Waiter<T>>>,
    closed: Cell<bool>,
    recver_alive: Cell<bool>,
    sender_count: Cell<usize>,
}

impl<T> RouterInner<T> {
    fn abandon_recver(&self) {
        if !self.recver_alive.replace(false) {
            return;
        }
        for slot in self.sender_waiters.borrow_mut().drain(..) {
            slot.waiter.complete(&self.hub, Err(Error::Abandoned));
        }
    }

    fn drop_sender(&self) {
        let remaining = self.sender_count.get() - 1;
        self.sender_count.set(remaining);
        if remaining == 0 {
            if let Some(waiter) = self.recver_waiter.borrow_mut().take() {
                waiter.complete(&self.hub, Err(Error::Abandoned));
            }
        }
    }

    fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        if let Some(waiter) = self.recver_waiter.borrow_mut().take() {
            waiter.complete(&self.hub, Err(Error::Closed));
        }
        for slot in self.sender_waiters.borrow_mut().drain(..) {
            slot.waiter.complete(&self.hub, Err(Error::Closed));
        }
    }
}

/// Create a `Router`: the one recver plus the first sender handle. Clone
/// the sender to add more producers.
pub fn router<T>(hub: Hub) -> (Sender<T>, Recver<T>) {
    let inner = Rc::new(RouterInner {
        hub,
        sender_waiters: RefCell::new(VecDeque::new()),
        recver_waiter: RefCell::new(None),
        closed: Cell::new(false),
        recver_alive: Cell::new(true),
        sender_count: Cell::new(1),
    });
    (Sender { inner: inner.clone(), tag: Rc::new(()) }, Recver { inner })
}

pub struct Sender<T> {
    inner: Rc<RouterInner<T>>,
    tag: Rc<()>,
}

impl<T> Sender<T> {
    pub fn send(&self, value: T, timeout: Option<u64>) -> SendFuture<T> {
        SendFuture {
            inner: self.inner.clone(),
            value: Cell::new(Some(value)),
            timeout,
            outcome: None,
        }
    }

    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.inner.sender_count.set(self.inner.sender_count.get() + 1);
        Sender { inner: self.inner.clone(), tag: self.tag.clone() }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        self.inner.drop_sender();
    }
}

pub struct Recver<T> {
    inner: Rc<RouterInner<T>>,
}

impl<T> Recver<T> {
    pub fn recv(&self, timeout: Option<u64>) -> RecvFuture<T> {
        RecvFuture {
            inner: self.inner.clone(),
            timeout,
            outcome: None,
        }
    }

    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }
}

impl<T> Drop for Recver<T> {
    fn drop(&mut self) {
        self.inner.abandon_recver();
    }
}

pub struct SendFuture<T> {
    inner: Rc<RouterInner<T>>,
    value: Cell<Option<T>>,
    timeout: Option<u64>,
    outcome: Option<Outcome<()>>,
}

impl<T> Future for SendFuture<T> {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let this = self.get_mut();

        if let Some(outcome) = &this.outcome {
            return match outcome.borrow_mut().take() {
                Some(result) => Poll::Ready(result),
                None => Poll::Pending,
            };
        }

        let inner = this.inner.clone();

        if let Some(waiter) = inner.recver_waiter.borrow_mut().take() {
            let value = this.value.take().expect("value present on first poll");
            waiter.complete(&inner.hub, Ok(value));
            return Poll::Ready(Ok(()));
        }
        if inner.closed.get() {
            return Poll::Ready(Err(Error::Closed));
        }
        if !inner.recver_alive.get() {
            return Poll::Ready(Err(Error::Abandoned));
        }
        if inner.hub.is_stopping() {
            return Poll::Ready(Err(Error::Stop));
        }
        if this.timeout == Some(0) {
            return Poll::Ready(Err(Error::Timeout));
        }

        let (waiter, outcome) = support::park(&inner.hub, cx.waker().clone(), this.timeout);
        inner.sender_waiters.borrow_mut().push_back(SendSlot {
            value: Cell::new(this.value.take()),
            waiter,
        });
        this.outcome = Some(outcome);
        Poll::Pending
    }
}

impl<T> Drop for SendFuture<T> {
    fn drop(&mut self) {
        let Some(outcome) = &self.outcome else { return };
        self.inner
            .sender_waiters
            .borrow_mut()
            .retain(|s| !Rc::ptr_eq(&s.waiter.outcome, outcome));
    }
}

pub struct RecvFuture<T> {
    inner: Rc<RouterInner<T>>,
    timeout: Option<u64>,
    outcome: Option<Outcome<T>>,
}

impl<T> Future for RecvFuture<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<T>> {
        let this = self.get_mut();

        if let Some(outcome) = &this.outcome {
            return match outcome.borrow_mut().take() {
                Some(result) => Poll::Ready(result),
                None => Poll::Pending,
            };
        }

        let inner = this.inner.clone();

        if let Some(slot) = inner.sender_waiters.borrow_mut().pop_front() {
            let value = slot.value.take().expect("parked sender always carries its value");
            slot.waiter.complete(&inner.hub, Ok(()));
            return Poll::Ready(Ok(value));
        }
        if inner.closed.get() {
            return Poll::Ready(Err(Error::Closed));
        }
        if inner.sender_count.get() == 0 {
            return Poll::Ready(Err(Error::Abandoned));
        }
        if inner.hub.is_stopping() {
            return Poll::Ready(Err(Error::Stop));
        }
        if this.timeout == Some(0) {
            return Poll::Ready(Err(Error::Timeout));
        }

        let (waiter, outcome) = support::park(&inner.hub, cx.waker().clone(), this.timeout);
        *inner.recver_waiter.borrow_mut() = Some(waiter);
        this.outcome = Some(outcome);
        Poll::Pending
    }
}

impl<T> Drop for RecvFuture<T> {
    fn drop(&mut self) {
        let Some(outcome) = &self.outcome else { return };
        let mut slot = self.inner.recver_waiter.borrow_mut();
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

    #[tokio::test(flavor = "current_thread")]
    async fn wakes_oldest_waiting_sender_first() {
        let hub = Hub::new();
        let (tx, rx) = router::<i32>(hub.clone());
        let tx2 = tx.clone();

        let s1 = tx.send(1, None);
        futures::pin_mut!(s1);
        let waker = crate::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(s1.as_mut().poll(&mut cx).is_pending());

        let s2 = tx2.send(2, None);
        futures::pin_mut!(s2);
        assert!(s2.as_mut().poll(&mut cx).is_pending());

        assert_eq!(rx.recv(None).await.unwrap(), 1);
        assert!(s1.as_mut().poll(&mut cx).is_ready());
        assert!(s2.as_mut().poll(&mut cx).is_pending());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn recver_blocks_with_no_sender_waiting() {
        let hub = Hub::new();
        let (_tx, rx) = router::<i32>(hub);
        let result = rx.recv(Some(0)).await;
        assert!(matches!(result, Err(Error::Timeout)));
    }
}
