use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::error::{Error, Result};
use crate::pipe::inner::{complete_recv, Outcome, PipeInner, SendWaiter};

/// The send half of a [`super::channel`]. Cloning a `Sender` is how
/// multiple tasks share one side (used by `Channel`); the pipe only
/// considers the sender side abandoned once every clone has dropped.
pub struct Sender<T> {
    pub(crate) inner: Rc<PipeInner<T>>,
    tag: Rc<()>,
}

impl<T> Sender<T> {
    pub(crate) fn new(inner: Rc<PipeInner<T>>) -> Self {
        Sender { inner, tag: Rc::new(()) }
    }

    /// Send `value`. `timeout`: `None` blocks forever, `Some(0)` fails
    /// immediately if no recver is parked, `Some(ms)` blocks up to `ms`.
    pub fn send(&self, value: T, timeout: Option<u64>) -> SendFuture<T> {
        SendFuture {
            pipe: self.inner.clone(),
            value: Cell::new(Some(value)),
            timeout,
            outcome: None,
        }
    }

    /// Close this side. Wakes a parked recver with `Closed`. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    /// True if a recver is currently parked on this pipe (used by `select`:
    /// sender-readiness means exactly this).
    pub(crate) fn recver_parked(&self) -> bool {
        self.inner.recver_waiter.borrow().is_some()
    }

    pub(crate) fn recver_alive(&self) -> bool {
        self.inner.recver_alive.get()
    }

    /// Register `waker` to be woken the next time a send on this pipe would
    /// succeed (a recver parks, or the pipe closes/is abandoned). One-shot:
    /// cleared on the next notification, so `select` re-registers every poll.
    pub(crate) fn watch_send_ready(&self, waker: Waker) {
        self.inner.send_ready_watchers.borrow_mut().push(waker);
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Sender {
            inner: self.inner.clone(),
            tag: self.tag.clone(),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        if Rc::strong_count(&self.tag) == 1 {
            self.inner.abandon_sender();
        }
    }
}

pub struct SendFuture<T> {
    pipe: Rc<PipeInner<T>>,
    value: Cell<Option<T>>,
    timeout: Option<u64>,
    outcome: Option<Outcome<Result<()>>>,
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

        let pipe = this.pipe.clone();

        if let Some(recv_waiter) = pipe.recver_waiter.borrow_mut().take() {
            let value = this.value.take().expect("value present on first poll");
            complete_recv(recv_waiter, &pipe.hub, Ok(value));
            return Poll::Ready(Ok(()));
        }
        if pipe.closed.get() {
            return Poll::Ready(Err(Error::Closed));
        }
        if !pipe.recver_alive.get() {
            return Poll::Ready(Err(Error::Abandoned));
        }
        if pipe.hub.is_stopping() {
            return Poll::Ready(Err(Error::Stop));
        }
        if this.timeout == Some(0) {
            return Poll::Ready(Err(Error::Timeout));
        }

        let outcome: Outcome<Result<()>> = Rc::new(RefCell::new(None));
        let waker = cx.waker().clone();

        let timer = this.timeout.map(|ms| {
            let outcome = outcome.clone();
            let waker = waker.clone();
            pipe.hub.schedule_timeout(ms, move || {
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
        let halt_hook = pipe.hub.register_halt_hook(move || {
            let mut slot = halt_outcome.borrow_mut();
            if slot.is_none() {
                *slot = Some(Err(Error::Halt));
                drop(slot);
                halt_waker.wake();
            }
        });

        pipe.park_sender(SendWaiter {
            value: Cell::new(this.value.take()),
            waker,
            outcome: outcome.clone(),
            timer,
            halt_hook: Some(halt_hook),
        });
        this.outcome = Some(outcome);
        Poll::Pending
    }
}

impl<T> Drop for SendFuture<T> {
    fn drop(&mut self) {
        let Some(outcome) = &self.outcome else { return };
        let mut slot = self.pipe.sender_waiter.borrow_mut();
        let is_ours = slot.as_ref().is_some_and(|w| Rc::ptr_eq(&w.outcome, outcome));
        if is_ours {
            if let Some(waiter) = slot.take() {
                if let Some(timer) = waiter.timer {
                    self.pipe.hub.cancel_timeout(timer);
                }
                if let Some(id) = waiter.halt_hook {
                    self.pipe.hub.unregister_halt_hook(id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Hub;
    use crate::pipe::channel;

    #[tokio::test(flavor = "current_thread")]
    async fn send_to_parked_recver_completes_without_parking() {
        let hub = Hub::new();
        let (tx, rx) = channel::<i32>(hub);
        // Both futures are `Rc`-based (single-threaded by design) so they're
        // driven concurrently on this one task with `join!` rather than
        // `tokio::spawn`, which would require `Send`.
        let (send_result, recv_result) = futures::join!(tx.send(12, None), rx.recv(None));
        send_result.unwrap();
        assert_eq!(recv_result.unwrap(), 12);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn zero_timeout_fails_fast_with_no_recver() {
        let hub = Hub::new();
        let (tx, _rx) = channel::<i32>(hub);
        let result = tx.send(1, Some(0)).await;
        assert!(matches!(result, Err(Error::Timeout)));
    }
}
