//! Thin helper over `Hub::signal` (spec §4.8/§9): spawn a task that turns
//! every delivery of a subscribed signal into a plain callback invocation,
//! used by `Hub::stop_on_term` for SIGINT/SIGTERM and internally by
//! `Child`'s SIGCHLD-driven reaper.

use crate::error::Result;
use crate::hub::Hub;
use crate::task::TaskHandle;

/// Subscribe to `signum` and invoke `callback` on every delivery, for as
/// long as the hub runs. Returns the spawned task's handle; dropping it
/// does not cancel the subscription (the spec has no cancel primitive
/// beyond closing the underlying recver, which this helper does not
/// expose).
pub fn on_signal(hub: &Hub, signum: i32, mut callback: impl FnMut(i32) + 'static) -> Result<TaskHandle> {
    let recver = hub.signal(signum)?;
    Ok(hub.spawn(async move {
        while let Ok(sig) = recver.recv(None).await {
            callback(sig);
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn invokes_callback_once_per_signal_delivery() {
        let hub = Hub::new();
        let count = Rc::new(Cell::new(0));
        let count2 = count.clone();
        on_signal(&hub, libc::SIGUSR1, move |_| count2.set(count2.get() + 1)).unwrap();

        unsafe {
            libc::raise(libc::SIGUSR1);
        }
        hub.spawn_later(5, {
            let hub = hub.clone();
            async move { hub.stop() }
        });
        hub.run();
        assert_eq!(count.get(), 1);
    }
}
