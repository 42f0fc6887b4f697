//! Derived primitives (spec §4.5): `Queue`, `Dealer`, `Router`, `Channel`,
//! `Broadcast`, `Value`, `Pulse`, `Producer`, `Trigger` — all built on top
//! of the raw [`crate::pipe`] protocol and the shared waiter/timeout/halt
//! plumbing in [`support`], never duplicating that bookkeeping per module.

pub(crate) mod support;

pub mod broadcast;
pub mod channel;
pub mod dealer;
pub mod pulse;
pub mod producer;
pub mod queue;
pub mod router;
pub mod trigger;
pub mod value;

pub use broadcast::Broadcast;
pub use channel::{channel, Channel};
pub use dealer::dealer;
pub use producer::producer;
pub use pulse::Pulse;
pub use queue::{queue, Queue};
pub use router::router;
pub use trigger::Trigger;
pub use value::Value;
