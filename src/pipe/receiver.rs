use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::error::{Error, Result};
use crate::pipe::inner::{complete_send, Outcome, PipeInner, RecvWaiter};

/// The receive half of a [`super::channel`]. See [`super::Sender`] for why
/// this is `Clone`.
pub struct Recver<T> {
    pub(crate) inner: Rc<PipeInner<T>>,
    tag: Rc<()>,
}

impl<T> Recver<T> {
    pub(crate) fn new(inner: Rc<PipeInner<T>>) -> Self {
        Recver { inner, tag: Rc::new(()) }
    }

    /// Receive a value. `timeout`: `None` blocks forever, `Some(0)` fails
    /// immediately if no sender is parked, `Some(ms)` blocks up to `ms`.
    pub fn recv(&self, timeout: Option<u64>) -> RecvFuture<T> {
        RecvFuture {
            pipe: self.inner.clone(),
            timeout,
            outcome: None,
        }
    }

    /// Close this side. Wakes a parked sender with `Closed`. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    /// True if a sender is currently parked on this pipe (used by `select`
    /// and by `Broadcast`'s non-blocking delivery attempts).
    pub(crate) fn sender_parked(&self) -> bool {
        self.inner.sender_waiter.borrow().is_some()
    }

    pub(crate) fn sender_alive(&self) -> bool {
        self.inner.sender_alive.get()
    }

    /// Register `waker` to be woken the next time a recv on this pipe would
    /// succeed (a sender parks, or the pipe closes/is abandoned). One-shot,
    /// like [`Sender::watch_send_ready`](super::Sender::watch_send_ready).
    pub(crate) fn watch_recv_ready(&self, waker: Waker) {
        self.inner.recv_ready_watchers.borrow_mut().push(waker);
    }

    /// Perform the rendezvous immediately, assuming the caller already
    /// confirmed readiness (a parked sender, or closed/abandoned). Used by
    /// `select`, which must complete the winning case atomically with the
    /// readiness check — no other task can interleave in a single-threaded
    /// hub, so there's no race between the check and this call.
    pub(crate) fn try_recv_now(&self) -> Option<Result<T>> {
        if let Some(waiter) = self.inner.sender_waiter.borrow_mut().take() {
            let value = waiter.value.take().expect("parked sender always carries its value");
            complete_send(waiter, &self.inner.hub, Ok(()));
            return Some(Ok(value));
        }
        if self.inner.closed.get() {
            return Some(Err(Error::Closed));
        }
        if !self.inner.sender_alive.get() {
            return Some(Err(Error::Abandoned));
        }
        None
    }
}

impl<T> Clone for Recver<T> {
    fn clone(&self) -> Self {
        Recver {
            inner: self.inner.clone(),
            tag: self.tag.clone(),
        }
    }
}

impl<T> Drop for Recver<T> {
    fn drop(&mut self) {
        if Rc::strong_count(&self.tag) == 1 {
            self.inner.abandon_recver();
        }
    }
}

pub struct RecvFuture<T> {
    pipe: Rc<PipeInner<T>>,
    timeout: Option<u64>,
    outcome: Option<Outcome<Result<T>>>,
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

        let pipe = this.pipe.clone();

        if let Some(send_waiter) = pipe.sender_waiter.borrow_mut().take() {
            let value = send_waiter
                .value
                .take()
                .expect("parked sender always carries its value");
            complete_send(send_waiter, &pipe.hub, Ok(()));
            return Poll::Ready(Ok(value));
        }
        if pipe.closed.get() {
            return Poll::Ready(Err(Error::Closed));
        }
        if !pipe.sender_alive.get() {
            return Poll::Ready(Err(Error::Abandoned));
        }
        if pipe.hub.is_stopping() {
            return Poll::Ready(Err(Error::Stop));
        }
        if this.timeout == Some(0) {
            return Poll::Ready(Err(Error::Timeout));
        }

        let outcome: Outcome<Result<T>> = Rc::new(RefCell::new(None));
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

        pipe.park_recver(RecvWaiter {
            waker,
            outcome: outcome.clone(),
            timer,
            halt_hook: Some(halt_hook),
        });
        this.outcome = Some(outcome);
        Poll::Pending
    }
}

impl<T> Drop for RecvFuture<T> {
    fn drop(&mut self) {
        let Some(outcome) = &self.outcome else { return };
        let mut slot = self.pipe.recver_waiter.borrow_mut();
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

    #[test]
    fn recv_on_idle_pipe_times_out() {
        let hub = Hub::new();
        let (_tx, rx) = channel::<i32>(hub.clone());
        let outcome = Rc::new(RefCell::new(None));
        let outcome2 = outcome.clone();
        hub.spawn(async move {
            *outcome2.borrow_mut() = Some(rx.recv(Some(10)).await);
        });
        hub.run();
        assert!(matches!(*outcome.borrow(), Some(Err(Error::Timeout))));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn dropping_sender_abandons_parked_recver() {
        let hub = Hub::new();
        let (tx, rx) = channel::<i32>(hub);
        let recv = rx.recv(None);
        futures::pin_mut!(recv);
        // Poll once to park the recver, then drop the sole sender.
        let waker = crate::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(recv.as_mut().poll(&mut cx).is_pending());
        drop(tx);
        assert!(matches!(recv.as_mut().poll(&mut cx), Poll::Ready(Err(Error::Abandoned))));
    }
}
