//! The Pipe protocol (spec §4.3): a half-rendezvous synchronous channel
//! between exactly one sender and one recver, with closure, abandonment,
//! and timeout semantics.
//!
//! Structurally this mirrors the teacher crate's `spsc` module
//! (`mod.rs`/`sender.rs`/`receiver.rs`/an inner channel type) with the ring
//! buffer removed: a `Pipe` carries no values of its own, it only
//! rendezvouses a single waiting sender with a single waiting recver.

mod inner;
mod receiver;
mod sender;

pub mod combinators;

pub use receiver::{RecvFuture, Recver};
pub use sender::{SendFuture, Sender};

use crate::hub::Hub;
use inner::PipeInner;

/// Create a new rendezvous pipe bound to `hub`.
pub fn channel<T>(hub: Hub) -> (Sender<T>, Recver<T>) {
    let inner = PipeInner::new(hub);
    (Sender::new(inner.clone()), Recver::new(inner))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[tokio::test(flavor = "current_thread")]
    async fn rendezvous_delivers_the_same_value() {
        let hub = Hub::new();
        let (tx, rx) = channel::<i32>(hub);
        let (sent, received) = futures::join!(tx.send(12, Some(20)), rx.recv(Some(20)));
        assert!(sent.is_ok());
        assert_eq!(received.unwrap(), 12);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn close_wakes_the_opposite_parked_waiter() {
        let hub = Hub::new();
        let (tx, rx) = channel::<i32>(hub);
        let recv = rx.recv(None);
        futures::pin_mut!(recv);
        let waker = crate::task::noop_waker();
        let mut cx = std::task::Context::from_waker(&waker);
        assert!(recv.as_mut().poll(&mut cx).is_pending());
        tx.close();
        assert!(matches!(
            recv.as_mut().poll(&mut cx),
            std::task::Poll::Ready(Err(Error::Closed))
        ));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn close_is_idempotent() {
        let hub = Hub::new();
        let (tx, _rx) = channel::<i32>(hub);
        tx.close();
        tx.close();
        assert!(tx.is_closed());
    }
}
