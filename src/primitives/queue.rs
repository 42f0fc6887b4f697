//! Queue(n) (spec §4.5): a sender/recver pair around an in-memory FIFO of
//! capacity `n`. `Channel` (bounded or unbuffered) is `Queue` with both
//! ends merged into one clonable handle; `Dealer`/`Router` reuse this
//! module's buffer-free (`n == 0`) direct-handoff path plus their own
//! many-waiter fairness.

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

pub(crate) struct QueueInner<T> {
    pub(crate) hub: Hub,
    capacity: usize,
    buffer: RefCell<VecDeque<T>>,
    sender_waiter: RefCell<Option<SendSlot<T>>>,
    recver_waiter: RefCell<Option<Waiter<T>>>,
    closed: Cell<bool>,
    sender_alive: Cell<bool>,
    recver_alive: Cell<bool>,
}

impl<T> QueueInner<T> {
    pub(crate) fn new(hub: Hub, capacity: usize) -> Rc<Self> {
        Rc::new(QueueInner {
            hub,
            capacity,
            buffer: RefCell::new(VecDeque::new()),
            sender_waiter: RefCell::new(None),
            recver_waiter: RefCell::new(None),
            closed: Cell::new(false),
            sender_alive: Cell::new(true),
            recver_alive: Cell::new(true),
        })
    }

    pub(crate) fn abandon_sender(&self) {
        if !self.sender_alive.replace(false) {
            return;
        }
        if let Some(waiter) = self.recver_waiter.borrow_mut().take() {
            waiter.complete(&self.hub, Err(Error::Abandoned));
        }
    }

    pub(crate) fn abandon_recver(&self) {
        if !self.recver_alive.replace(false) {
            return;
        }
        if let Some(slot) = self.sender_waiter.borrow_mut().take() {
            slot.waiter.complete(&self.hub, Err(Error::Abandoned));
        }
    }

    pub(crate) fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        if let Some(slot) = self.sender_waiter.borrow_mut().take() {
            slot.waiter.complete(&self.hub, Err(Error::Closed));
        }
        if let Some(waiter) = self.recver_waiter.borrow_mut().take() {
            waiter.complete(&self.hub, Err(Error::Closed));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.buffer.borrow().len()
    }
}

/// Create a bounded (or, with `capacity == 0`, unbuffered) queue.
pub fn queue<T>(hub: Hub, capacity: usize) -> (Sender<T>, Recver<T>) {
    let inner = QueueInner::new(hub, capacity);
    (Sender::new(inner.clone()), Recver::new(inner))
}

pub struct Sender<T> {
    pub(crate) inner: Rc<QueueInner<T>>,
    tag: Rc<()>,
}

impl<T> Sender<T> {
    pub(crate) fn new(inner: Rc<QueueInner<T>>) -> Self {
        Sender { inner, tag: Rc::new(()) }
    }

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
        Sender { inner: self.inner.clone(), tag: self.tag.clone() }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        if Rc::strong_count(&self.tag) == 1 {
            self.inner.abandon_sender();
        }
    }
}

pub struct Recver<T> {
    pub(crate) inner: Rc<QueueInner<T>>,
    tag: Rc<()>,
}

impl<T> Recver<T> {
    pub(crate) fn new(inner: Rc<QueueInner<T>>) -> Self {
        Recver { inner, tag: Rc::new(()) }
    }

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

    pub fn len(&self) -> usize {
        self.inner.len()
    }
}

impl<T> Clone for Recver<T> {
    fn clone(&self) -> Self {
        Recver { inner: self.inner.clone(), tag: self.tag.clone() }
    }
}

impl<T> Drop for Recver<T> {
    fn drop(&mut self) {
        if Rc::strong_count(&self.tag) == 1 {
            self.inner.abandon_recver();
        }
    }
}

pub struct SendFuture<T> {
    inner: Rc<QueueInner<T>>,
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
        if inner.buffer.borrow().len() < inner.capacity {
            inner.buffer.borrow_mut().push_back(this.value.take().expect("value present on first poll"));
            return Poll::Ready(Ok(()));
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
        *inner.sender_waiter.borrow_mut() = Some(SendSlot {
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
        let mut slot = self.inner.sender_waiter.borrow_mut();
        let is_ours = slot.as_ref().is_some_and(|s| Rc::ptr_eq(&s.waiter.outcome, outcome));
        if is_ours {
            if let Some(s) = slot.take() {
                support::cancel(&self.inner.hub, s.waiter.timer, s.waiter.halt_hook);
            }
        }
    }
}

pub struct RecvFuture<T> {
    inner: Rc<QueueInner<T>>,
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

        if let Some(value) = inner.buffer.borrow_mut().pop_front() {
            if let Some(slot) = inner.sender_waiter.borrow_mut().take() {
                let pending_value = slot.value.take().expect("parked sender always carries its value");
                inner.buffer.borrow_mut().push_back(pending_value);
                slot.waiter.complete(&inner.hub, Ok(()));
            }
            return Poll::Ready(Ok(value));
        }
        if let Some(slot) = inner.sender_waiter.borrow_mut().take() {
            let value = slot.value.take().expect("parked sender always carries its value");
            slot.waiter.complete(&inner.hub, Ok(()));
            return Poll::Ready(Ok(value));
        }
        if inner.closed.get() {
            return Poll::Ready(Err(Error::Closed));
        }
        if !inner.sender_alive.get() {
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

/// A bounded FIFO queue. Shorthand constructor matching the spec's
/// `Queue(n)` naming; `queue()` (lowercase) is the underlying primitive.
pub struct Queue;

impl Queue {
    pub fn new<T>(hub: Hub, capacity: usize) -> (Sender<T>, Recver<T>) {
        queue(hub, capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "current_thread")]
    async fn capacity_two_fills_drains_and_refills_in_fifo_order() {
        let hub = Hub::new();
        let (tx, rx) = queue::<i32>(hub, 2);

        tx.send(1, None).await.unwrap();
        tx.send(2, None).await.unwrap();
        assert!(matches!(tx.send(3, Some(0)).await, Err(Error::Timeout)));

        assert_eq!(rx.recv(None).await.unwrap(), 1);
        tx.send(3, Some(0)).await.unwrap();

        assert_eq!(rx.recv(None).await.unwrap(), 2);
        assert_eq!(rx.recv(None).await.unwrap(), 3);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn direct_handoff_when_recver_already_parked() {
        let hub = Hub::new();
        let (tx, rx) = queue::<i32>(hub, 0);
        let (sent, received) = futures::join!(tx.send(7, None), rx.recv(None));
        sent.unwrap();
        assert_eq!(received.unwrap(), 7);
    }
}
