//! Edge-triggered readiness (spec §4.6), wrapping `mio::Poll`/`mio::Events`.
//!
//! `mio` is grounded in `r3bl-org-r3bl-open-core/tui`, which depends on the
//! same `mio = "1.0"` with `os-poll`/`os-ext` features for its own native
//! reactor (`core/resilient_reactor_thread/`). On Linux, `mio::Poll` is
//! backed by epoll in edge-triggered mode, which is exactly the "avoid
//! busy-looping on persistently-ready descriptors" requirement the spec
//! calls out.

use std::os::fd::RawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::error::Result;

/// Raw readiness bits, independent of `mio`'s own event type, decomposed by
/// [`humanize_mask`]. Values match the epoll bit positions so a caller
/// reading `/usr/include/sys/epoll.h` recognizes them immediately.
pub mod mask {
    pub const IN: u32 = 0x001;
    pub const OUT: u32 = 0x004;
    pub const ERR: u32 = 0x008;
    pub const HUP: u32 = 0x010;
    pub const RDHUP: u32 = 0x2000;
    pub const ET: u32 = 1 << 31;
}

pub type Mask = u32;

/// Decompose a raw readiness bitmask into its symbolic parts. A pure
/// function, independent of `mio`, so it stays testable against the literal
/// vocabulary the spec names: `{in, out, hup, err, et, rdhup}`.
pub fn humanize_mask(bits: Mask) -> Vec<&'static str> {
    let mut out = Vec::new();
    if bits & mask::IN != 0 {
        out.push("in");
    }
    if bits & mask::OUT != 0 {
        out.push("out");
    }
    if bits & mask::HUP != 0 {
        out.push("hup");
    }
    if bits & mask::ERR != 0 {
        out.push("err");
    }
    if bits & mask::ET != 0 {
        out.push("et");
    }
    if bits & mask::RDHUP != 0 {
        out.push("rdhup");
    }
    out
}

fn interest_for(bits: Mask) -> Interest {
    let mut interest = None;
    if bits & mask::IN != 0 {
        interest = Some(Interest::READABLE);
    }
    if bits & mask::OUT != 0 {
        interest = Some(match interest {
            Some(i) => i.add(Interest::WRITABLE),
            None => Interest::WRITABLE,
        });
    }
    interest.unwrap_or(Interest::READABLE)
}

fn mio_event_to_mask(event: &mio::event::Event) -> Mask {
    let mut bits = mask::ET;
    if event.is_readable() {
        bits |= mask::IN;
    }
    if event.is_writable() {
        bits |= mask::OUT;
    }
    if event.is_error() {
        bits |= mask::ERR;
    }
    if event.is_read_closed() || event.is_write_closed() {
        bits |= mask::HUP;
    }
    if event.is_read_closed() {
        bits |= mask::RDHUP;
    }
    bits
}

pub(crate) struct Poller {
    poll: Poll,
    events: Events,
    drained: Vec<(RawFd, Mask)>,
}

impl Poller {
    pub fn new(capacity: usize) -> Result<Self> {
        Ok(Poller {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity),
            drained: Vec::new(),
        })
    }

    pub fn register(&mut self, fd: RawFd, requested: Mask) -> Result<()> {
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), Token(fd as usize), interest_for(requested))?;
        Ok(())
    }

    pub fn reregister(&mut self, fd: RawFd, requested: Mask) -> Result<()> {
        self.poll
            .registry()
            .reregister(&mut SourceFd(&fd), Token(fd as usize), interest_for(requested))?;
        Ok(())
    }

    pub fn unregister(&mut self, fd: RawFd) -> Result<()> {
        self.poll.registry().deregister(&mut SourceFd(&fd))?;
        Ok(())
    }

    /// Block for up to `ms` (`None` = forever, `Some(0)` = don't block) and
    /// stash the resulting events for `drain_events`.
    pub fn wait(&mut self, ms: Option<u64>) -> Result<()> {
        let timeout = ms.map(Duration::from_millis);
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }
        self.drained = self
            .events
            .iter()
            .map(|event| (event.token().0 as RawFd, mio_event_to_mask(event)))
            .collect();
        Ok(())
    }

    pub fn drain_events(&mut self) -> Vec<(RawFd, Mask)> {
        std::mem::take(&mut self.drained)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn humanize_mask_decomposes_known_bits() {
        let bits = mask::IN | mask::OUT | mask::HUP | mask::ERR | mask::ET | mask::RDHUP;
        assert_eq!(
            humanize_mask(bits),
            vec!["in", "out", "hup", "err", "et", "rdhup"]
        );
    }

    #[test]
    fn humanize_mask_empty_for_zero() {
        assert!(humanize_mask(0).is_empty());
    }

    #[test]
    fn register_and_wait_on_a_pipe() {
        let (r, w) = rustix_like_pipe();
        let mut poller = Poller::new(16).unwrap();
        poller.register(r, mask::IN).unwrap();
        // nothing written yet: immediate wait should see no events.
        poller.wait(Some(0)).unwrap();
        assert!(poller.drain_events().is_empty());

        unsafe {
            libc::write(w, b"x".as_ptr() as *const _, 1);
        }
        poller.wait(Some(200)).unwrap();
        let events = poller.drain_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, r);
        assert!(events[0].1 & mask::IN != 0);

        poller.unregister(r).unwrap();
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    fn rustix_like_pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        unsafe {
            assert_eq!(libc::pipe(fds.as_mut_ptr()), 0);
        }
        (fds[0], fds[1])
    }
}
