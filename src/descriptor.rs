//! The Descriptor layer (spec §4.7): a non-blocking byte stream lifted out
//! of a raw OS file descriptor, registered with the [`crate::poller::Poller`]
//! for edge-triggered readiness. Structurally this is the Pipe protocol's
//! sibling: instead of rendezvousing a value between two tasks, it
//! rendezvouses a task with the kernel's read/write buffers, with an
//! internal `Vec<u8>` standing in for the "no buffer" rule a raw `Pipe`
//! enforces. `recv_bytes`/`recv_partition` are framing built on top of that
//! buffer; the exact retention contract across calls is ground-truthed
//! against `original_source/tests/unit/test_vanilla.py::TestDescriptor`.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::io;
use std::os::fd::RawFd;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use crate::error::{Error, Result};
use crate::hub::{Hub, ReadinessTarget};
use crate::poller::{mask, Mask};
use crate::readiness::Readiness;

struct DescriptorInner {
    hub: Hub,
    fd: RawFd,
    readiness: Readiness,
    read_buf: RefCell<Vec<u8>>,
    read_eof: Cell<bool>,
    write_broken: Cell<bool>,
    closed: Cell<bool>,
}

impl ReadinessTarget for DescriptorInner {
    fn on_ready(&self, mask: u32) {
        self.readiness.on_ready(mask);
    }
}

impl DescriptorInner {
    /// Tear down once both directions are done: unregister from the
    /// poller, close the fd, wake anything still parked with `Closed`.
    /// Idempotent; called from explicit `close()` and from the auto-close
    /// path once EOF and a broken write have both been observed.
    fn close_now(&self) {
        if self.closed.replace(true) {
            return;
        }
        let _ = self.hub.unregister_fd(self.fd);
        unsafe {
            libc::close(self.fd);
        }
        self.readiness.wake_all();
    }

    fn maybe_auto_close(&self) {
        if self.read_eof.get() && self.write_broken.get() {
            self.close_now();
        }
    }

    /// Pull whatever is non-blockingly available straight into the
    /// internal buffer. Never removes anything from it.
    fn fill(&self) -> Result<Fill> {
        if self.closed.get() {
            return Ok(Fill::Eof);
        }
        let mut scratch = [0u8; 8192];
        match raw_read(self.fd, &mut scratch) {
            Ok(0) => {
                self.read_eof.set(true);
                self.maybe_auto_close();
                Ok(Fill::Eof)
            }
            Ok(n) => {
                self.read_buf.borrow_mut().extend_from_slice(&scratch[..n]);
                Ok(Fill::Filled)
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(Fill::WouldBlock),
            Err(err) => Err(err.into()),
        }
    }
}

enum Fill {
    Filled,
    WouldBlock,
    Eof,
}

fn raw_read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n >= 0 {
        Ok(n as usize)
    } else {
        Err(io::Error::last_os_error())
    }
}

fn raw_write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if n >= 0 {
        Ok(n as usize)
    } else {
        Err(io::Error::last_os_error())
    }
}

pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// A non-blocking byte stream over a raw fd, registered with the Hub's
/// poller. Cloning shares the same underlying fd and buffers (used when a
/// caller needs to pass a read half and a write half of one descriptor to
/// two different tasks).
pub struct Descriptor {
    inner: Rc<DescriptorInner>,
    // Separate from `inner` (which the Hub's fd registry also holds a
    // strong reference to) so `Drop` can tell "last externally-visible
    // handle" from "last reference overall" — same trick as
    // `pipe::Sender`/`Recver`.
    tag: Rc<()>,
}

impl Clone for Descriptor {
    fn clone(&self) -> Self {
        Descriptor { inner: self.inner.clone(), tag: self.tag.clone() }
    }
}

impl Drop for Descriptor {
    fn drop(&mut self) {
        if Rc::strong_count(&self.tag) == 1 {
            self.inner.close_now();
        }
    }
}

impl Descriptor {
    /// Wrap an already-nonblocking-or-not `fd`, setting `O_NONBLOCK` and
    /// registering it with the Hub for `requested` readiness.
    pub(crate) fn wrap(hub: Hub, fd: RawFd, requested: Mask) -> Result<Self> {
        set_nonblocking(fd)?;
        let inner = Rc::new(DescriptorInner {
            hub: hub.clone(),
            fd,
            readiness: Readiness::new(),
            read_buf: RefCell::new(Vec::new()),
            read_eof: Cell::new(false),
            write_broken: Cell::new(false),
            closed: Cell::new(false),
        });
        hub.register_fd(fd, requested, inner.clone())?;
        Ok(Descriptor { inner, tag: Rc::new(()) })
    }

    pub fn fd(&self) -> RawFd {
        self.inner.fd
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    /// Decompose a raw readiness bitmask into the symbolic set `{in, out,
    /// hup, err, et, rdhup}`. Shared with [`crate::poller::humanize_mask`].
    pub fn humanize_mask(bits: u32) -> Vec<&'static str> {
        crate::poller::humanize_mask(bits)
    }

    /// Attempt to write `bytes` in full, parking on writable-readiness for
    /// whatever doesn't fit the first non-blocking write.
    pub fn send(&self, bytes: impl Into<Vec<u8>>) -> SendFuture {
        SendFuture { inner: self.inner.clone(), remaining: bytes.into() }
    }

    /// Whatever bytes are currently available, after waiting for at least
    /// one byte to be readable (or EOF).
    pub fn recv(&self) -> RecvFuture {
        RecvFuture { inner: self.inner.clone() }
    }

    /// Accumulate exactly `n` bytes across as many reads as it takes.
    /// Returns early only with `Closed`.
    pub fn recv_bytes(&self, n: usize) -> RecvBytesFuture {
        RecvBytesFuture { inner: self.inner.clone(), target: n, collected: Vec::with_capacity(n) }
    }

    /// Accumulate until `sep` appears, returning the prefix with `sep`
    /// consumed and discarded. Any bytes read past `sep` stay buffered for
    /// the next call.
    pub fn recv_partition(&self, sep: impl Into<Vec<u8>>) -> RecvPartitionFuture {
        RecvPartitionFuture { inner: self.inner.clone(), sep: sep.into(), collected: Vec::new() }
    }

    /// Unregister from the poller, close the fd, mark both directions
    /// closed. Idempotent.
    pub fn close(&self) {
        self.inner.close_now();
    }
}

pub struct SendFuture {
    inner: Rc<DescriptorInner>,
    remaining: Vec<u8>,
}

impl Future for SendFuture {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let this = self.get_mut();
        loop {
            if this.remaining.is_empty() {
                return Poll::Ready(Ok(()));
            }
            if this.inner.closed.get() {
                return Poll::Ready(Err(Error::Closed));
            }
            match raw_write(this.inner.fd, &this.remaining) {
                Ok(n) => {
                    this.remaining.drain(0..n);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    this.inner.readiness.watch_writable(cx.waker().clone());
                    return Poll::Pending;
                }
                Err(err) if err.raw_os_error() == Some(libc::EPIPE) => {
                    this.inner.write_broken.set(true);
                    this.inner.maybe_auto_close();
                    return Poll::Ready(Err(Error::Closed));
                }
                Err(err) => return Poll::Ready(Err(err.into())),
            }
        }
    }
}

pub struct RecvFuture {
    inner: Rc<DescriptorInner>,
}

impl Future for RecvFuture {
    type Output = Result<Vec<u8>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<Vec<u8>>> {
        let this = self.get_mut();
        loop {
            if !this.inner.read_buf.borrow().is_empty() {
                return Poll::Ready(Ok(std::mem::take(&mut this.inner.read_buf.borrow_mut())));
            }
            if this.inner.closed.get() {
                return Poll::Ready(Err(Error::Closed));
            }
            match this.inner.fill() {
                Ok(Fill::Filled) => continue,
                Ok(Fill::Eof) => return Poll::Ready(Err(Error::Closed)),
                Ok(Fill::WouldBlock) => {
                    this.inner.readiness.watch_readable(cx.waker().clone());
                    return Poll::Pending;
                }
                Err(err) => return Poll::Ready(Err(err)),
            }
        }
    }
}

pub struct RecvBytesFuture {
    inner: Rc<DescriptorInner>,
    target: usize,
    collected: Vec<u8>,
}

impl Future for RecvBytesFuture {
    type Output = Result<Vec<u8>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<Vec<u8>>> {
        let this = self.get_mut();
        loop {
            let need = this.target - this.collected.len();
            if need > 0 {
                let mut buf = this.inner.read_buf.borrow_mut();
                let take = need.min(buf.len());
                this.collected.extend(buf.drain(0..take));
            }
            if this.collected.len() == this.target {
                return Poll::Ready(Ok(std::mem::take(&mut this.collected)));
            }
            match this.inner.fill() {
                Ok(Fill::Filled) => continue,
                Ok(Fill::Eof) => return Poll::Ready(Err(Error::Closed)),
                Ok(Fill::WouldBlock) => {
                    this.inner.readiness.watch_readable(cx.waker().clone());
                    return Poll::Pending;
                }
                Err(err) => return Poll::Ready(Err(err)),
            }
        }
    }
}

pub struct RecvPartitionFuture {
    inner: Rc<DescriptorInner>,
    sep: Vec<u8>,
    collected: Vec<u8>,
}

impl Future for RecvPartitionFuture {
    type Output = Result<Vec<u8>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<Vec<u8>>> {
        let this = self.get_mut();
        loop {
            {
                let mut buf = this.inner.read_buf.borrow_mut();
                if !buf.is_empty() {
                    this.collected.extend(buf.drain(..));
                }
            }
            if let Some(pos) = find_subslice(&this.collected, &this.sep) {
                let residual = this.collected.split_off(pos + this.sep.len());
                this.collected.truncate(pos);
                let prefix = std::mem::take(&mut this.collected);
                let mut buf = this.inner.read_buf.borrow_mut();
                let mut restored = residual;
                restored.extend(buf.drain(..));
                *buf = restored;
                return Poll::Ready(Ok(prefix));
            }
            match this.inner.fill() {
                Ok(Fill::Filled) => continue,
                Ok(Fill::Eof) => {
                    if !this.collected.is_empty() {
                        let mut buf = this.inner.read_buf.borrow_mut();
                        let mut restored = std::mem::take(&mut this.collected);
                        restored.extend(buf.drain(..));
                        *buf = restored;
                    }
                    return Poll::Ready(Err(Error::Closed));
                }
                Ok(Fill::WouldBlock) => {
                    this.inner.readiness.watch_readable(cx.waker().clone());
                    return Poll::Pending;
                }
                Err(err) => return Poll::Ready(Err(err)),
            }
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::mask as readiness_mask;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn os_pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        unsafe {
            assert_eq!(libc::pipe(fds.as_mut_ptr()), 0);
        }
        (fds[0], fds[1])
    }

    #[test]
    fn recv_bytes_retains_residual_across_calls() {
        // Ground truth: original_source/tests/unit/test_vanilla.py::
        // test_recv_bytes. A 3-byte send followed by a deferred 1-byte send
        // must yield "12" then "32" — the trailing "3" from the first send
        // stays in the Descriptor's internal buffer across the two
        // `recv_bytes(2)` calls.
        let hub = Hub::new();
        let (r, w) = os_pipe();
        let r = hub.register(r, readiness_mask::IN).unwrap();
        let w = hub.register(w, readiness_mask::OUT).unwrap();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen2 = seen.clone();
        let hub2 = hub.clone();
        hub.spawn(async move {
            w.send(b"123".to_vec()).await.unwrap();
            seen2.borrow_mut().push(r.recv_bytes(2).await.unwrap());
            hub2.spawn_later(10, async move {
                w.send(b"2".to_vec()).await.unwrap();
            });
            seen2.borrow_mut().push(r.recv_bytes(2).await.unwrap());
        });
        hub.run();
        assert_eq!(*seen.borrow(), vec![b"12".to_vec(), b"32".to_vec()]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn recv_partition_consumes_separator_once() {
        let hub = Hub::new();
        let (r, w) = os_pipe();
        let r = hub.register(r, readiness_mask::IN).unwrap();
        let w = hub.register(w, readiness_mask::OUT).unwrap();

        w.send(b"12\r\n3".to_vec()).await.unwrap();
        assert_eq!(r.recv_partition(b"\r\n".to_vec()).await.unwrap(), b"12");
    }

    #[test]
    fn humanize_mask_matches_poller() {
        let bits = mask::IN | mask::OUT;
        assert_eq!(Descriptor::humanize_mask(bits), crate::poller::humanize_mask(bits));
    }
}
