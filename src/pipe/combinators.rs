//! Pipe combinators (spec §4.3, component table row "Pipe combinators"):
//! chaining (`pipe`), `map`, and `consume`, each a thin spawned-task
//! composition over the raw `Sender`/`Recver` primitives — no new state of
//! their own, which is the point: everything above this layer is "a thin
//! composition of pipes, spawned tasks, and descriptors" per spec §1.

use std::future::Future;

use crate::hub::Hub;
use crate::pipe::{channel, Recver, Sender};
use crate::task::TaskHandle;

/// Forward every value from `from` into `to` until `from` observes `Closed`
/// or `Abandoned`. Returns the spawned forwarding task's handle.
pub fn pipe<T: 'static>(hub: &Hub, from: Recver<T>, to: Sender<T>) -> TaskHandle {
    hub.spawn(async move {
        loop {
            match from.recv(None).await {
                Ok(value) => {
                    if to.send(value, None).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    })
}

/// Like `pipe`, but the forwarding logic is supplied by the caller instead
/// of being a plain relay. Mirrors the host spec's "accepts a function
/// `(recver, sender) -> void`" variant.
pub fn pipe_with<T, F, Fut>(hub: &Hub, from: Recver<T>, to: Sender<T>, f: F) -> TaskHandle
where
    T: 'static,
    F: FnOnce(Recver<T>, Sender<T>) -> Fut + 'static,
    Fut: Future<Output = ()> + 'static,
{
    hub.spawn(f(from, to))
}

/// Spawn a task that relays `f(v)` for every value received from `from`
/// into a freshly created pipe, and return its recver.
pub fn map<T, U, F>(hub: &Hub, from: Recver<T>, f: F) -> Recver<U>
where
    T: 'static,
    U: 'static,
    F: Fn(T) -> U + 'static,
{
    let (tx, rx) = channel::<U>(hub.clone());
    hub.spawn(async move {
        loop {
            match from.recv(None).await {
                Ok(value) => {
                    if tx.send(f(value), None).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
    rx
}

/// Spawn a task that calls `f(v)` for every value received from `from`.
/// Discards the returned handle if the caller doesn't need it — the hub
/// owns the task regardless.
pub fn consume<T, F>(hub: &Hub, from: Recver<T>, mut f: F) -> TaskHandle
where
    T: 'static,
    F: FnMut(T) + 'static,
{
    hub.spawn(async move {
        while let Ok(value) = from.recv(None).await {
            f(value);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Hub;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn map_transforms_values_in_order() {
        let hub = Hub::new();
        let (tx, rx) = channel::<i32>(hub.clone());
        let doubled = map(&hub, rx, |v| v * 2);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen2 = seen.clone();
        consume(&hub, doubled, move |v| seen2.borrow_mut().push(v));

        hub.spawn(async move {
            for v in [1, 2, 3] {
                tx.send(v, None).await.unwrap();
            }
            drop(tx);
        });

        hub.run();
        assert_eq!(*seen.borrow(), vec![2, 4, 6]);
    }

    #[test]
    fn pipe_relays_until_closed() {
        let hub = Hub::new();
        let (tx_a, rx_a) = channel::<i32>(hub.clone());
        let (tx_b, rx_b) = channel::<i32>(hub.clone());
        pipe(&hub, rx_a, tx_b);

        let received = Rc::new(RefCell::new(Vec::new()));
        let received2 = received.clone();
        consume(&hub, rx_b, move |v| received2.borrow_mut().push(v));

        hub.spawn(async move {
            tx_a.send(1, None).await.unwrap();
            tx_a.send(2, None).await.unwrap();
        });

        hub.run();
        assert_eq!(*received.borrow(), vec![1, 2]);
    }
}
