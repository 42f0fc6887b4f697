//! Trigger(f) (spec §4.5): `fire()` sends a unit value into a source pipe; a
//! forwarding task owns both the source recver and the output sender, reads
//! the value, calls `f`, and forwards a unit value onward. That forwarding
//! task is the "middle" stage the spec describes as its own pipe — here it's
//! a plain async loop instead, since the source recver and output sender it
//! holds already give the same one-task-in-the-middle shape without a third
//! `Pipe` to wire up. The `Trigger` handle holds the only `Sender` for the
//! source pipe, so dropping it abandons the source: the forwarding task's
//! parked `recv` observes `Abandoned`, the loop exits, and the output sender
//! it was holding drops with it, abandoning the output pipe in turn. No
//! explicit cancellation needed — the chain unwinds on its own.

use crate::hub::Hub;
use crate::pipe::{self, Recver, Sender};
use crate::task::TaskHandle;

/// A trigger: `fire()` sends into the source pipe, the forwarding task
/// invokes `f`, and a unit value reaches the returned output recver.
pub struct Trigger {
    source: Sender<()>,
    _forwarder: TaskHandle,
}

impl Trigger {
    /// Build a trigger that calls `f()` on every `fire()` and returns the
    /// matching output recver.
    pub fn new<F>(hub: Hub, mut f: F) -> (Self, Recver<()>)
    where
        F: FnMut() + 'static,
    {
        let (source_tx, source_rx) = pipe::channel::<()>(hub.clone());
        let (output_tx, output_rx) = pipe::channel::<()>(hub.clone());

        let forwarder = hub.spawn(async move {
            while source_rx.recv(None).await.is_ok() {
                f();
                if output_tx.send((), None).await.is_err() {
                    break;
                }
            }
        });

        (
            Trigger {
                source: source_tx,
                _forwarder: forwarder,
            },
            output_rx,
        )
    }

    /// Fire the trigger once, parking until the forwarding task accepts it.
    pub async fn fire(&self) -> crate::error::Result<()> {
        self.source.send((), None).await
    }

    pub fn is_closed(&self) -> bool {
        self.source.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn fire_invokes_f_and_delivers_to_output() {
        let hub = Hub::new();
        let count = Rc::new(Cell::new(0));
        let count_clone = count.clone();
        let (trigger, output) = Trigger::new(hub.clone(), move || {
            count_clone.set(count_clone.get() + 1);
        });

        let seen = Rc::new(Cell::new(false));
        let seen2 = seen.clone();
        hub.spawn(async move {
            output.recv(None).await.unwrap();
            seen2.set(true);
        });
        hub.spawn(async move {
            trigger.fire().await.unwrap();
        });

        hub.run();
        assert_eq!(count.get(), 1);
        assert!(seen.get());
    }

    #[test]
    fn dropping_trigger_abandons_the_forwarding_chain() {
        let hub = Hub::new();
        let (trigger, output) = Trigger::new(hub.clone(), || {});
        drop(trigger);

        let abandoned = Rc::new(Cell::new(false));
        let abandoned2 = abandoned.clone();
        hub.spawn(async move {
            let result = output.recv(None).await;
            abandoned2.set(matches!(result, Err(crate::error::Error::Abandoned)));
        });

        hub.run();
        assert!(abandoned.get());
    }
}
