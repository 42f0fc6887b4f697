//! Minimal non-blocking TCP (spec §4.9, a supplement grounded in
//! `original_source/vanilla/tcp.py`): a listener and a connector built
//! purely out of [`crate::descriptor::Descriptor`], the Poller, and the
//! pipe combinators — no framing, no routing, HTTP/WebSocket are
//! explicitly out of scope.

pub mod tcp;

pub use tcp::{connect, listen, Listener};
