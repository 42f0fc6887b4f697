//! Broadcast (spec §4.5): one-to-many fan-out. `subscribe()` returns a
//! recver; `send(v)` delivers to every subscriber in subscribe order via a
//! non-blocking attempt each, pruning closed/abandoned subscribers as it
//! goes. Each subscriber is backed by a capacity-1 `Queue` rather than a
//! raw `Pipe`, so a subscriber that isn't parked in `recv` right now still
//! gets the next value buffered for it instead of silently missing it —
//! only a subscriber that's *already* holding an undelivered value misses
//! the next `send` (a deliberately lossy, best-effort fan-out, matching
//! the spec's "non-blocking attempts").

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::Context;

use crate::error::{Error, Result};
use crate::hub::Hub;
use crate::pipe::Recver as PipeRecver;
use crate::primitives::queue::{self, Recver, Sender};
use crate::task::{noop_waker, TaskHandle};

struct BroadcastInner<T> {
    hub: Hub,
    subscribers: RefCell<Vec<Sender<T>>>,
}

#[derive(Clone)]
pub struct Broadcast<T> {
    inner: Rc<BroadcastInner<T>>,
}

impl<T: Clone + 'static> Broadcast<T> {
    pub fn new(hub: Hub) -> Self {
        Broadcast {
            inner: Rc::new(BroadcastInner { hub, subscribers: RefCell::new(Vec::new()) }),
        }
    }

    /// Add a subscriber. Values broadcast after this call (and not missed
    /// per the lossy policy above) are visible through the returned recver.
    pub fn subscribe(&self) -> Recver<T> {
        let (tx, rx) = queue::queue(self.inner.hub.clone(), 1);
        self.inner.subscribers.borrow_mut().push(tx);
        rx
    }

    /// Deliver `value` to every live subscriber, in subscribe order.
    pub fn send(&self, value: T) {
        self.inner.subscribers.borrow_mut().retain(|tx| match try_send_now(tx, value.clone()) {
            Ok(()) | Err(Error::Timeout) => true,
            Err(_) => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.borrow().len()
    }

    /// Relay every value from `source` into this broadcast until it closes
    /// or is abandoned. Returns the spawned forwarding task's handle.
    pub fn forward_from(&self, source: PipeRecver<T>) -> TaskHandle {
        let this = self.clone();
        self.inner.hub.spawn(async move {
            while let Ok(value) = source.recv(None).await {
                this.send(value);
            }
        })
    }
}

/// Poll a capacity-1 `Queue` send with `timeout=Some(0)`: per `Queue`'s own
/// poll contract that branch always resolves on the first poll, so driving
/// it once with a no-op waker is a correct, non-async "try send".
fn try_send_now<T>(sender: &Sender<T>, value: T) -> Result<()> {
    let fut = sender.send(value, Some(0));
    futures::pin_mut!(fut);
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    match fut.as_mut().poll(&mut cx) {
        std::task::Poll::Ready(result) => result,
        std::task::Poll::Pending => unreachable!("Queue send with timeout=Some(0) never parks"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "current_thread")]
    async fn fans_out_to_every_subscriber_and_prunes_closed_ones() {
        let hub = Hub::new();
        let broadcast = Broadcast::new(hub);
        let s1 = broadcast.subscribe();
        let s2 = broadcast.subscribe();

        broadcast.send(1);
        assert_eq!(s1.recv(None).await.unwrap(), 1);
        assert_eq!(s2.recv(None).await.unwrap(), 1);

        s1.close();
        broadcast.send(3);
        assert_eq!(s2.recv(None).await.unwrap(), 3);
        assert!(matches!(s1.recv(None).await, Err(Error::Closed)));
    }
}
