//! Producer(f) (spec §4.5): spawn `f(sender)` as a task and hand back its
//! recver. A thin composition over [`crate::pipe::channel`] and
//! [`Hub::spawn`] — no new wait-slot machinery of its own.

use std::future::Future;

use crate::hub::Hub;
use crate::pipe::{self, Recver, Sender};
use crate::task::TaskHandle;

/// Spawn `f` with a fresh pipe sender and return the matching recver,
/// along with the spawned task's handle.
pub fn producer<T, F, Fut>(hub: Hub, f: F) -> (Recver<T>, TaskHandle)
where
    T: 'static,
    F: FnOnce(Sender<T>) -> Fut + 'static,
    Fut: Future<Output = ()> + 'static,
{
    let (tx, rx) = pipe::channel(hub.clone());
    let handle = hub.spawn(f(tx));
    (rx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn runs_f_and_delivers_its_values_through_recv() {
        let hub = Hub::new();
        let (rx, _handle) = producer(hub.clone(), |tx: Sender<i32>| async move {
            for i in 0..3 {
                tx.send(i, None).await.unwrap();
            }
        });

        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen2 = seen.clone();
        hub.spawn(async move {
            while let Ok(v) = rx.recv(None).await {
                seen2.borrow_mut().push(v);
            }
        });

        hub.run();
        assert_eq!(*seen.borrow(), vec![0, 1, 2]);
    }
}
