//! Dealer (spec §4.5): fair 1-to-many handoff. A single sender; any number
//! of recver handles may be cloned from the one returned and each parks
//! independently. `send` wakes exactly one waiting recver, oldest first.
//! `Router` is the same fairness mirrored onto the other side.

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

struct DealerInner<T> {
    hub: Hub,
    sender_waiter: RefCell<Option<SendSlot<T>>>,
    recver_waiters: RefCell<VecDeque<Waiter<T>>>,
    closed: Cell<bool>,
    sender_alive: Cell<bool>,
    recver_count: Cell<usize>,
}

impl<T> DealerInner<T> {
    fn abandon_sender(&self) {
        if !self.sender_alive.replace(false) {
            return;
        }
        for waiter in self.recver_waiters.borrow_mut().drain(..) {
            waiter.complete(&self.hub, Err(Error::Abandoned));
        }
    }

    fn drop_recver(&self) {
        let remaining = self.recver_count.get() - 1;
        self.recver_count.set(remaining);
        if remaining == 0 {
            if let Some(slot) = self.sender_waiter.borrow_mut().take() {
                slot.waiter.complete(&self.hub, Err(Error::Abandoned));
            }
        }
    }

    fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        if let Some(slot) = self.sender_waiter.borrow_mut().take() {
            slot.waiter.complete(&self.hub, Err(Error::Closed));
        }
        for waiter in self.recver_waiters.borrow_mut().drain(..) {
            waiter.complete(&self.hub, Err(Error::Closed));
        }
    }
}

/// Create a `Dealer`: the one sender plus the first recver handle. Clone
/// the recver to add more consumers.
pub fn dealer<T>(hub: Hub) -> (Sender<T>, Recver<T>) {
    let inner = Rc::new(DealerInner {
        hub,
        sender_waiter: RefCell::new(None),
        recver_waiters: RefCell::new(VecDeque::new()),
        closed: Cell::new(false),
        sender_alive: Cell::new(true),
        recver_count: Cell::new(1),
    });
    (Sender { inner: inner.clone() }, Recver { inner, tag: Rc::new(()) })
}

pub struct Sender<T> {
    inner: Rc<DealerInner<T>>,
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

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        self.inner.abandon_sender();
    }
}

pub struct Recver<T> {
    inner: Rc<DealerInner<T>>,
    tag: Rc<()>,
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

impl<T> Clone for Recver<T> {
    fn clone(&self) -> Self {
        self.inner.recver_count.set(self.inner.recver_count.get() + 1);
        Recver { inner: self.inner.clone(), tag: self.tag.clone() }
    }
}

impl<T> Drop for Recver<T> {
    fn drop(&mut self) {
        self.inner.drop_recver();
    }
}

pub struct SendFuture<T> {
    inner: Rc<DealerInner<T>>,
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

        if let Some(waiter) = inner.recver_waiters.borrow_mut().pop_front() {
            let value = this.value.take().expect("value present on first poll");
            waiter.complete(&inner.hub, Ok(value));
            return Poll::Ready(Ok(()));
        }
        if inner.closed.get() {
            return Poll::Ready(Err(Error::Closed));
        }
        if inner.recver_count.get() == 0 {
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
    inner: Rc<DealerInner<T>>,
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
        inner.recver_waiters.borrow_mut().push_back(waiter);
        this.outcome = Some(outcome);
        Poll::Pending
    }
}

impl<T> Drop for RecvFuture<T> {
    fn drop(&mut self) {
        let Some(outcome) = &self.outcome else { return };
        self.inner
            .recver_waiters
            .borrow_mut()
            .retain(|w| !Rc::ptr_eq(&w.outcome, outcome));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;

    #[tokio::test(flavor = "current_thread")]
    async fn wakes_oldest_waiting_recver_first() {
        let hub = Hub::new();
        let (tx, rx) = dealer::<i32>(hub.clone());
        let rx2 = rx.clone();

        let order = Rc::new(StdRefCell::new(Vec::new()));
        let order1 = order.clone();
        let r1 = rx.recv(None);
        futures::pin_mut!(r1);
        let waker = crate::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(r1.as_mut().poll(&mut cx).is_pending());

        let order2 = order.clone();
        let r2 = rx2.recv(None);
        futures::pin_mut!(r2);
        assert!(r2.as_mut().poll(&mut cx).is_pending());

        tx.send(1, None).await.unwrap();
        assert_eq!(r1.as_mut().poll(&mut cx), Poll::Ready(Ok(1)));
        assert!(matches!(r2.as_mut().poll(&mut cx), Poll::Pending));
        let _ = (order1, order2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn sender_blocks_with_no_recver_waiting() {
        let hub = Hub::new();
        let (tx, _rx) = dealer::<i32>(hub);
        let result = tx.send(1, Some(0)).await;
        assert!(matches!(result, Err(Error::Timeout)));
    }
}
