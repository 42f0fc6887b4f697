//! The cooperative scheduler (spec §4.2): a ready queue of runnable tasks,
//! the timer [`Scheduler`], and the edge-triggered [`Poller`], driven by a
//! single-threaded main loop.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::poller::{Mask, Poller};
use crate::primitives::broadcast::Broadcast;
use crate::primitives::queue::Recver;
use crate::scheduler::{Scheduler, TimerHandle};
use crate::task::{make_waker, BoxFuture, ReadyQueue, TaskHandle, TaskId, TaskSlot};

/// Something that wants to hear about readiness events for a registered fd.
/// Implemented by [`crate::descriptor::Descriptor`].
pub(crate) trait ReadinessTarget {
    fn on_ready(&self, mask: u32);
}

type HaltHookId = u64;

struct HubInner {
    tasks: RefCell<HashMap<TaskId, TaskSlot>>,
    ready: ReadyQueue,
    next_task_id: Cell<TaskId>,
    scheduler: RefCell<Scheduler>,
    poller: RefCell<Poller>,
    descriptors: RefCell<HashMap<RawFd, Rc<dyn ReadinessTarget>>>,
    stopping: Cell<bool>,
    halt_hooks: RefCell<HashMap<HaltHookId, Box<dyn FnOnce()>>>,
    next_halt_id: Cell<HaltHookId>,
    /// One self-pipe read fd + fan-out `Broadcast` per distinct signal
    /// number subscribed to via `Hub::signal`. Populated lazily.
    signals: RefCell<HashMap<i32, (RawFd, Broadcast<i32>)>>,
}

/// A cheaply-cloneable handle to the runtime. Every primitive in this crate
/// holds one so it can schedule timers, check for shutdown, and register
/// itself for forced wakeup during teardown.
///
/// `Hub` is intentionally not `Send`/`Sync` (it is built entirely on `Rc`):
/// the spec requires at most one Hub per thread of control, and this makes
/// sending one across threads a compile error rather than a runtime hazard.
#[derive(Clone)]
pub struct Hub(Rc<HubInner>);

impl Hub {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// `events` sizes the Poller's event buffer (`mio::Events::with_capacity`).
    pub fn with_capacity(events: usize) -> Self {
        Hub(Rc::new(HubInner {
            tasks: RefCell::new(HashMap::new()),
            ready: Rc::new(RefCell::new(VecDeque::new())),
            next_task_id: Cell::new(1),
            scheduler: RefCell::new(Scheduler::new()),
            poller: RefCell::new(Poller::new(events).expect("failed to create poller")),
            descriptors: RefCell::new(HashMap::new()),
            stopping: Cell::new(false),
            halt_hooks: RefCell::new(HashMap::new()),
            next_halt_id: Cell::new(0),
            signals: RefCell::new(HashMap::new()),
        }))
    }

    /// Schedule `fut` to run before the next poll. Returns a handle; dropping
    /// it does not cancel the task.
    pub fn spawn(&self, fut: impl Future<Output = ()> + 'static) -> TaskHandle {
        let id = self.0.next_task_id.get();
        self.0.next_task_id.set(id + 1);
        self.0.tasks.borrow_mut().insert(
            id,
            TaskSlot {
                id,
                future: Box::pin(fut),
            },
        );
        self.0.ready.borrow_mut().push_back(id);
        TaskHandle(id)
    }

    /// Identical to `spawn`, but deferred `ms` milliseconds via the
    /// [`Scheduler`].
    pub fn spawn_later(&self, ms: u64, fut: impl Future<Output = ()> + 'static) -> TaskHandle {
        let hub = self.clone();
        self.spawn(async move {
            hub.sleep(ms).await;
            fut.await;
        })
    }

    /// Park the current task until `ms` milliseconds have elapsed.
    pub fn sleep(&self, ms: u64) -> impl Future<Output = ()> + 'static {
        SleepFuture {
            hub: self.clone(),
            timer: None,
            fired: Rc::new(Cell::new(false)),
            ms,
        }
    }

    /// Request shutdown. Tasks that are about to park observe `Stop`
    /// immediately instead; the run loop drains remaining work and forces
    /// any task that can never otherwise wake to observe `Halt`.
    pub fn stop(&self) {
        self.0.stopping.set(true);
    }

    /// Wait on the first ready endpoint in `cases`, in argument order. See
    /// [`crate::select`] for the full contract.
    pub fn select<'a>(
        &self,
        cases: &'a [&'a dyn crate::select::Case],
        timeout: Option<u64>,
    ) -> crate::select::SelectFuture<'a> {
        crate::select::select(self, cases, timeout)
    }

    /// Wire a raw fd to the Poller and lift it into a [`crate::descriptor::Descriptor`].
    pub fn register(&self, fd: RawFd, mask: Mask) -> Result<crate::descriptor::Descriptor> {
        crate::descriptor::Descriptor::wrap(self.clone(), fd, mask)
    }

    /// Unregister a previously-`register`ed fd without closing it (use
    /// [`crate::descriptor::Descriptor::close`] to close too).
    pub fn unregister(&self, fd: RawFd) -> Result<()> {
        self.unregister_fd(fd)
    }

    /// Subscribe to OS signal `signum`. The first subscriber for a given
    /// signal number lazily installs a self-pipe (via `signal_hook`)
    /// registered with the Poller; every subscriber thereafter shares the
    /// same underlying `Broadcast`, so multiple independent listeners for
    /// the same signal (e.g. a SIGCHLD reaper per child) all observe it.
    pub fn signal(&self, signum: i32) -> Result<Recver<i32>> {
        Ok(self.signal_broadcast(signum)?.subscribe())
    }

    fn signal_broadcast(&self, signum: i32) -> Result<Broadcast<i32>> {
        if let Some((_, broadcast)) = self.0.signals.borrow().get(&signum) {
            return Ok(broadcast.clone());
        }

        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        let [read_fd, write_fd] = fds;
        signal_hook::low_level::pipe::register(signum, write_fd)?;

        let broadcast = Broadcast::new(self.clone());
        let target = Rc::new(SignalTarget {
            read_fd,
            signum,
            broadcast: broadcast.clone(),
        });
        self.register_fd(read_fd, crate::poller::mask::IN, target)?;
        self.0.signals.borrow_mut().insert(signum, (read_fd, broadcast.clone()));
        Ok(broadcast)
    }

    /// Like `stop`, but triggered by SIGINT/SIGTERM delivery.
    pub fn stop_on_term(&self) -> Result<()> {
        let hub = self.clone();
        crate::process::signals::on_signal(self, signal_hook::consts::SIGINT, move |_| hub.stop())?;
        let hub = self.clone();
        crate::process::signals::on_signal(self, signal_hook::consts::SIGTERM, move |_| hub.stop())?;
        Ok(())
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.0.stopping.get()
    }

    /// Run the main loop until either nothing is left to do, or shutdown is
    /// requested and nothing can make further progress.
    pub fn run(&self) {
        loop {
            self.run_ready();

            if self.all_done() {
                break;
            }

            if self.0.stopping.get() && self.is_stuck() && self.force_halt_if_stuck() {
                continue;
            }

            self.expire_timers();

            let wait_ms = if !self.0.ready.borrow().is_empty() {
                Some(0)
            } else {
                self.0.scheduler.borrow_mut().timeout()
            };
            if let Err(err) = self.0.poller.borrow_mut().wait(wait_ms) {
                tracing::error!(?err, "poller wait failed");
                continue;
            }
            self.dispatch_poller_events();
        }
    }

    fn run_ready(&self) {
        loop {
            let id = match self.0.ready.borrow_mut().pop_front() {
                Some(id) => id,
                None => break,
            };
            self.poll_task(id);
        }
    }

    fn poll_task(&self, id: TaskId) {
        let mut slot = match self.0.tasks.borrow_mut().remove(&id) {
            Some(slot) => slot,
            None => return,
        };
        let waker = make_waker(id, self.0.ready.clone());
        let mut cx = Context::from_waker(&waker);
        let poll_result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            slot.future.as_mut().poll(&mut cx)
        }));
        match poll_result {
            Ok(Poll::Pending) => {
                self.0.tasks.borrow_mut().insert(id, slot);
            }
            Ok(Poll::Ready(())) => {
                tracing::debug!(task = id, "task completed");
            }
            Err(payload) => {
                tracing::warn!(task = id, "task panicked: {:?}", panic_message(&payload));
            }
        }
    }

    fn expire_timers(&self) {
        loop {
            let callback = self.0.scheduler.borrow_mut().pop_due();
            match callback {
                Some(cb) => cb(),
                None => break,
            }
        }
    }

    fn dispatch_poller_events(&self) {
        let events = self.0.poller.borrow_mut().drain_events();
        let descriptors = self.0.descriptors.borrow();
        for (fd, mask) in events {
            if let Some(target) = descriptors.get(&fd) {
                target.on_ready(mask);
            }
        }
    }

    /// Nothing ready, nothing scheduled, and no task parked on anything —
    /// genuinely nothing left to do, independent of `stopping`. A
    /// registered fd with nothing parked on it (an open `Child` pipe
    /// nobody is reading, a `Listener` nobody is polling) isn't pending
    /// work on its own, so it doesn't keep this from being true.
    fn all_done(&self) -> bool {
        self.0.ready.borrow().is_empty() && self.0.scheduler.borrow().is_empty() && self.0.tasks.borrow().is_empty()
    }

    /// No ready work, no pending timers, and no registered fd that could
    /// ever wake one of the still-parked tasks `all_done` found. Only
    /// meaningful once `stopping` is set: it means the remaining parked
    /// tasks (rendezvous waits with no timeout) will never resolve on
    /// their own and need `force_halt_if_stuck` to deliver `Halt`.
    fn is_stuck(&self) -> bool {
        self.0.ready.borrow().is_empty() && self.0.scheduler.borrow().is_empty() && self.0.descriptors.borrow().is_empty()
    }

    /// If the loop would otherwise stall forever while stopping (no ready
    /// work, no timers, no descriptors, but tasks still parked on pipes that
    /// nothing will ever satisfy), force every outstanding parked waiter to
    /// observe `Halt`.
    fn force_halt_if_stuck(&self) -> bool {
        if !self.0.stopping.get() {
            return false;
        }
        let hooks: Vec<_> = self.0.halt_hooks.borrow_mut().drain().map(|(_, f)| f).collect();
        if hooks.is_empty() {
            return false;
        }
        for hook in hooks {
            hook();
        }
        true
    }

    pub(crate) fn schedule_timeout(&self, ms: u64, callback: impl FnOnce() + 'static) -> TimerHandle {
        self.0.scheduler.borrow_mut().add(ms, callback)
    }

    pub(crate) fn cancel_timeout(&self, handle: TimerHandle) {
        self.0.scheduler.borrow_mut().remove(handle);
    }

    /// Register a closure invoked if the hub must force a wakeup during
    /// teardown (see `Halt` in the error taxonomy). Returns an id to
    /// `unregister_halt_hook` once the wait resolves normally.
    pub(crate) fn register_halt_hook(&self, f: impl FnOnce() + 'static) -> HaltHookId {
        let id = self.0.next_halt_id.get();
        self.0.next_halt_id.set(id + 1);
        self.0.halt_hooks.borrow_mut().insert(id, Box::new(f));
        id
    }

    pub(crate) fn unregister_halt_hook(&self, id: HaltHookId) {
        self.0.halt_hooks.borrow_mut().remove(&id);
    }

    /// Wire a raw fd to the Poller for edge-triggered readiness.
    pub(crate) fn register_fd(&self, fd: RawFd, mask: Mask, target: Rc<dyn ReadinessTarget>) -> Result<()> {
        self.0.poller.borrow_mut().register(fd, mask)?;
        self.0.descriptors.borrow_mut().insert(fd, target);
        Ok(())
    }

    pub(crate) fn unregister_fd(&self, fd: RawFd) -> Result<()> {
        self.0.descriptors.borrow_mut().remove(&fd);
        self.0.poller.borrow_mut().unregister(fd)
    }

    pub(crate) fn reregister_fd(&self, fd: RawFd, mask: Mask) -> Result<()> {
        self.0.poller.borrow_mut().reregister(fd, mask)
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

/// Drains a signal self-pipe and fans each byte out as one delivery of
/// `signum` on `broadcast`. One of these per distinct signal number a
/// caller has ever subscribed to via `Hub::signal`.
struct SignalTarget {
    read_fd: RawFd,
    signum: i32,
    broadcast: Broadcast<i32>,
}

impl ReadinessTarget for SignalTarget {
    fn on_ready(&self, _mask: u32) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe { libc::read(self.read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n <= 0 {
                break;
            }
            for _ in 0..n {
                self.broadcast.send(self.signum);
            }
        }
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

struct SleepFuture {
    hub: Hub,
    timer: Option<TimerHandle>,
    fired: Rc<Cell<bool>>,
    ms: u64,
}

impl Future for SleepFuture {
    type Output = ();
    fn poll(mut self: std::pin::Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.fired.get() {
            return Poll::Ready(());
        }
        if self.timer.is_none() {
            let fired = self.fired.clone();
            let waker = cx.waker().clone();
            let handle = self.hub.schedule_timeout(self.ms, move || {
                fired.set(true);
                waker.wake();
            });
            self.timer = Some(handle);
        }
        Poll::Pending
    }
}

impl Drop for SleepFuture {
    fn drop(&mut self) {
        if let Some(handle) = self.timer.take() {
            if !self.fired.get() {
                self.hub.cancel_timeout(handle);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;

    #[test]
    fn spawn_runs_to_completion() {
        let hub = Hub::new();
        let ran = Rc::new(StdRefCell::new(false));
        let r = ran.clone();
        hub.spawn(async move {
            *r.borrow_mut() = true;
        });
        hub.run();
        assert!(*ran.borrow());
    }

    #[test]
    fn sleep_delays_until_timer_fires() {
        let hub = Hub::new();
        let order = Rc::new(StdRefCell::new(Vec::new()));
        let o1 = order.clone();
        let h1 = hub.clone();
        hub.spawn(async move {
            h1.sleep(5).await;
            o1.borrow_mut().push("slept");
        });
        let o2 = order.clone();
        hub.spawn(async move {
            o2.borrow_mut().push("immediate");
        });
        hub.run();
        assert_eq!(*order.borrow(), vec!["immediate", "slept"]);
    }

    #[test]
    fn stop_drains_ready_queue_before_exiting() {
        let hub = Hub::new();
        let ran = Rc::new(Cell::new(0));
        for _ in 0..3 {
            let r = ran.clone();
            hub.spawn(async move {
                r.set(r.get() + 1);
            });
        }
        hub.stop();
        hub.run();
        assert_eq!(ran.get(), 3);
    }
}
