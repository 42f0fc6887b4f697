//! A single-threaded cooperative concurrency runtime: a [`hub::Hub`] executor
//! with a timer wheel and an edge-triggered [`poller::Poller`], a family of
//! rendezvous [`pipe`]s with closure/abandonment semantics, a [`select`]
//! multiplexer over them, and the [`primitives`] (`Queue`, `Dealer`,
//! `Router`, `Channel`, `Broadcast`, `Value`, `Pulse`, `Producer`,
//! `Trigger`) derived from the Pipe protocol.
//!
//! [`descriptor::Descriptor`] lifts a non-blocking OS file descriptor into
//! the Pipe model; [`net`] and [`process`] are thin collaborators built
//! purely out of `Descriptor`, `Poller`, and pipe combinators — there is no
//! wire protocol or routing layer at this level.
//!
//! The crate is built entirely on `Rc`/`Cell`/`RefCell`: a [`hub::Hub`] and
//! everything it owns is `!Send`/`!Sync` by construction, so running two
//! hubs on the same thread is fine but moving one across threads is a
//! compile error rather than a runtime hazard.

pub mod descriptor;
pub mod error;
pub mod hub;
pub mod net;
pub mod pipe;
pub mod poller;
pub mod primitives;
pub mod process;
mod readiness;
mod scheduler;
pub mod select;
mod task;

pub use error::{Error, Result};
pub use hub::Hub;
pub use task::TaskHandle;
