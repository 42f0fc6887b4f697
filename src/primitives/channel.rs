//! Channel(n=0) (spec §4.5): an unbuffered (`n == 0`) or bounded `Queue`
//! whose sender and recver are the same handle — any task holding a clone
//! may `send` or `recv`; pairs rendezvous in FIFO order of arrival on each
//! side. Unlike `Queue`'s single sender/single recver, both sides here can
//! have many simultaneous waiters, so it borrows `Dealer`/`Router`'s
//! queue-of-waiters shape for both directions at once.

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

struct ChannelInner<T> {
    hub: Hub,
    capacity: usize,
    buffer: RefCell<VecDeque<T>>,
    send_waiters: RefCell<VecDeque<SendSlot<T>>>,
    recv_waiters: RefCell<VecDeque<Waiter<T>>>,
    closed: Cell<bool>,
}

impl<T> ChannelInner<T> {
    fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        for slot in self.send_waiters.borrow_mut().drain(..) {
            slot.waiter.complete(&self.hub, Err(Error::Closed));
        }
        for waiter in self.recv_waiters.borrow_mut().drain(..) {
            waiter.complete(&self.hub, Err(Error::Closed));
        }
    }
}

/// Create a `Channel`: a single cloneable handle any task can send and
/// recv through. `capacity == 0` is the unbuffered rendezvous case.
pub fn channel<T>(hub: Hub, capacity: usize) -> Channel<T> {
    Channel {
        inner: Rc::new(ChannelInner {
            hub,
            capacity,
            buffer: RefCell::new(VecDeque::new()),
            send_waiters: RefCell::new(VecDeque::new()),
            recv_waiters: RefCell::new(VecDeque::new()),
            closed: Cell::new(false),
        }),
    }
}

#[derive(Clone)]
pub struct Channel<T> {
    inner: Rc<ChannelInner<T>>,
}

impl<T> Channel<T> {
    pub fn send(&self, value: T, timeout: Option<u64>) -> SendFuture<T> {
        SendFuture {
            inner: self.inner.clone(),
            value: Cell::new(Some(value)),
            timeout,
            outcome: None,
        }
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
        self.inner.buffer.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct SendFuture<T> {
    inner: Rc<ChannelInner<T>>,
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

        if let Some(waiter) = inner.recv_waiters.borrow_mut().pop_front() {
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
        if inner.hub.is_stopping() {
            return Poll::Ready(Err(Error::Stop));
        }
        if this.timeout == Some(0) {
            return Poll::Ready(Err(Error::Timeout));
        }

        let (waiter, outcome) = support::park(&inner.hub, cx.waker().clone(), this.timeout);
        inner.send_waiters.borrow_mut().push_back(SendSlot {
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
            .send_waiters
            .borrow_mut()
            .retain(|s| !Rc::ptr_eq(&s.waiter.outcome, outcome));
    }
}

pub struct RecvFuture<T> {
    inner: Rc<ChannelInner<T>>,
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
            if let Some(slot) = inner.send_waiters.borrow_mut().pop_front() {
                let pending_value = slot.value.take().expect("parked sender always carries its value");
                inner.buffer.borrow_mut().push_back(pending_value);
                slot.waiter.complete(&inner.hub, Ok(()));
            }
            return Poll::Ready(Ok(value));
        }
        if let Some(slot) = inner.send_waiters.borrow_mut().pop_front() {
            let value = slot.value.take().expect("parked sender always carries its value");
            slot.waiter.complete(&inner.hub, Ok(()));
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
    async fn unbuffered_rendezvous_between_any_two_handles() {
        let hub = Hub::new();
        let ch = channel::<i32>(hub, 0);
        let ch2 = ch.clone();
        let (sent, received) = futures::join!(ch.send(5, None), ch2.recv(None));
        sent.unwrap();
        assert_eq!(received.unwrap(), 5);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn bounded_capacity_behaves_like_queue() {
        let hub = Hub::new();
        let ch = channel::<i32>(hub, 1);
        ch.send(1, None).await.unwrap();
        assert!(matches!(ch.send(2, Some(0)).await, Err(Error::Timeout)));
        assert_eq!(ch.recv(None).await.unwrap(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn close_fails_pending_waiters() {
        let hub = Hub::new();
        let ch = channel::<i32>(hub, 0);
        let recv = ch.recv(None);
        futures::pin_mut!(recv);
        let waker = crate::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(recv.as_mut().poll(&mut cx).is_pending());
        ch.close();
        assert!(matches!(recv.as_mut().poll(&mut cx), Poll::Ready(Err(Error::Closed))));
    }
}
