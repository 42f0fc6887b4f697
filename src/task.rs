//! Tasks, rendered as boxed futures, and the waker plumbing that lets a
//! parked future re-queue itself on the hub's ready queue.
//!
//! The host system this runtime is modeled on represents a task as an
//! interpreter-level coroutine with GC-tracked references; Rust's closest
//! native equivalent is `Future` (an explicit, compiler-generated resumable
//! state machine). Because the hub only ever runs on the thread that owns
//! it, the waker here is built on `Rc`, not `Arc`/atomics — the single
//! threaded analogue of veloce's `AtomicWaker`-based `SendFuture`/
//! `RecvFuture`.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{RawWaker, RawWakerVTable, Waker};

pub type TaskId = u64;

pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = ()>>>;
pub(crate) type ReadyQueue = Rc<RefCell<VecDeque<TaskId>>>;

/// A spawned unit of work plus enough bookkeeping for the hub to drive it.
pub(crate) struct TaskSlot {
    pub id: TaskId,
    pub future: BoxFuture,
}

/// A handle returned by `Hub::spawn`. Dropping it does not cancel the task;
/// it merely stops being able to observe it. Cancellation is out of scope
/// (the spec has no cancel operation beyond `stop`/`Halt`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskHandle(pub(crate) TaskId);

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.0
    }
}

struct WakerData {
    id: TaskId,
    ready: ReadyQueue,
}

unsafe fn clone(data: *const ()) -> RawWaker {
    let rc = unsafe { Rc::from_raw(data as *const WakerData) };
    let cloned = Rc::clone(&rc);
    std::mem::forget(rc);
    RawWaker::new(Rc::into_raw(cloned) as *const (), &VTABLE)
}

unsafe fn wake(data: *const ()) {
    let rc = unsafe { Rc::from_raw(data as *const WakerData) };
    rc.ready.borrow_mut().push_back(rc.id);
}

unsafe fn wake_by_ref(data: *const ()) {
    let rc = unsafe { Rc::from_raw(data as *const WakerData) };
    rc.ready.borrow_mut().push_back(rc.id);
    std::mem::forget(rc);
}

unsafe fn drop_waker(data: *const ()) {
    unsafe { drop(Rc::from_raw(data as *const WakerData)) };
}

static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop_waker);

/// Build a waker that pushes `id` onto `ready` when woken. Not `Send`; the
/// raw pointer is an `Rc`, so using this waker from another thread is
/// undefined behavior. This is enforced informally by the hub never handing
/// wakers across an await boundary that could cross threads.
pub(crate) fn make_waker(id: TaskId, ready: ReadyQueue) -> Waker {
    let data = Rc::new(WakerData { id, ready });
    let raw = RawWaker::new(Rc::into_raw(data) as *const (), &VTABLE);
    unsafe { Waker::from_raw(raw) }
}

/// A no-op waker used to poll a future once without caring whether it parks
/// again (e.g. probing a `select` candidate for immediate readiness).
pub(crate) fn noop_waker() -> Waker {
    fn rc_data() -> Rc<WakerData> {
        thread_local! {
            static READY: ReadyQueue = Rc::new(RefCell::new(VecDeque::new()));
        }
        READY.with(|r| Rc::new(WakerData { id: 0, ready: r.clone() }))
    }
    let data = rc_data();
    let raw = RawWaker::new(Rc::into_raw(data) as *const (), &VTABLE);
    unsafe { Waker::from_raw(raw) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::task::Context;

    #[test]
    fn waking_enqueues_task_id() {
        let ready: ReadyQueue = Rc::new(RefCell::new(VecDeque::new()));
        let waker = make_waker(7, ready.clone());
        waker.wake_by_ref();
        assert_eq!(ready.borrow_mut().pop_front(), Some(7));
    }

    #[test]
    fn clone_preserves_identity() {
        let ready: ReadyQueue = Rc::new(RefCell::new(VecDeque::new()));
        let waker = make_waker(3, ready.clone());
        let cloned = waker.clone();
        drop(waker);
        cloned.wake();
        assert_eq!(ready.borrow_mut().pop_front(), Some(3));
    }

    #[test]
    fn noop_waker_does_not_panic_when_used_as_context() {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let _ = &mut cx;
    }
}
