//! Value (spec §4.5): a last-write-wins latch. `send(v)` stores `v` and
//! wakes *every* currently parked `recv`-waiter with it (unlike `Dealer`/
//! `Channel`, which wake exactly one) — this is the one derived primitive
//! where a single write fans out to all waiters rather than rendezvousing
//! with the first. Once stored, `recv` returns immediately until `clear`.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use crate::error::{Error, Result};
use crate::hub::Hub;
use crate::primitives::support::{self, Outcome, Waiter};

struct ValueInner<T> {
    hub: Hub,
    stored: RefCell<Option<T>>,
    recv_waiters: RefCell<VecDeque<Waiter<T>>>,
    closed: Cell<bool>,
}

#[derive(Clone)]
pub struct Value<T> {
    inner: Rc<ValueInner<T>>,
}

impl<T: Clone + 'static> Value<T> {
    pub fn new(hub: Hub) -> Self {
        Value {
            inner: Rc::new(ValueInner {
                hub,
                stored: RefCell::new(None),
                recv_waiters: RefCell::new(VecDeque::new()),
                closed: Cell::new(false),
            }),
        }
    }

    /// Store `value` and wake every task currently parked in `recv`.
    pub fn send(&self, value: T) {
        *self.inner.stored.borrow_mut() = Some(value.clone());
        for waiter in self.inner.recv_waiters.borrow_mut().drain(..) {
            waiter.complete(&self.inner.hub, Ok(value.clone()));
        }
    }

    /// The stored value, if `send` has been called since the last `clear`.
    pub fn get(&self) -> Option<T> {
        self.inner.stored.borrow().clone()
    }

    /// Drop the stored value; the next `recv` parks again until a new `send`.
    pub fn clear(&self) {
        *self.inner.stored.borrow_mut() = None;
    }

    pub fn recv(&self, timeout: Option<u64>) -> RecvFuture<T> {
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
        for waiter in self.inner.recv_waiters.borrow_mut().drain(..) {
            waiter.complete(&self.inner.hub, Err(Error::Closed));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }
}

pub struct RecvFuture<T> {
    inner: Rc<ValueInner<T>>,
    timeout: Option<u64>,
    outcome: Option<Outcome<T>>,
}

impl<T: Clone> Future for RecvFuture<T> {
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

        if let Some(value) = inner.stored.borrow().clone() {
            return Poll::Ready(Ok(value));
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
        inner.recv_waiters.borrow_mut().push_back(waiter);
        this.outcome = Some(outcome);
        Poll::Pending
    }
}

impl<T> Drop for RecvFuture<T> {
    fn drop(&mut self) {
        let Some(outcome) = &self.outcome else { return };
        self.inner
            .recv_waiters
            .borrow_mut()
            .retain(|w| !Rc::ptr_eq(&w.outcome, outcome));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "current_thread")]
    async fn recv_parks_until_send_then_returns_latched_value_repeatedly() {
        let hub = Hub::new();
        let value = Value::<i32>::new(hub);
        assert!(matches!(value.recv(Some(0)).await, Err(Error::Timeout)));

        value.send(42);
        assert_eq!(value.recv(None).await.unwrap(), 42);
        assert_eq!(value.recv(None).await.unwrap(), 42);

        value.clear();
        assert!(matches!(value.recv(Some(0)).await, Err(Error::Timeout)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn send_wakes_every_parked_waiter() {
        let hub = Hub::new();
        let value = Value::<i32>::new(hub);
        let r1 = value.recv(None);
        let r2 = value.recv(None);
        futures::pin_mut!(r1);
        futures::pin_mut!(r2);
        let waker = crate::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(r1.as_mut().poll(&mut cx).is_pending());
        assert!(r2.as_mut().poll(&mut cx).is_pending());

        value.send(7);
        assert_eq!(r1.as_mut().poll(&mut cx), Poll::Ready(Ok(7)));
        assert_eq!(r2.as_mut().poll(&mut cx), Poll::Ready(Ok(7)));
    }
}
