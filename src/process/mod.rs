//! Child-process management (spec §4.8): `fork`/`exec` wired through three
//! stdio `Descriptor`s, liveness/termination, and SIGCHLD-driven reaping.
//! Treated by the spec as a collaborator built purely out of primitives
//! this crate already has (`Descriptor`, `Value`, `Hub::spawn`) plus the
//! raw `libc::fork`/`execvp`/`waitpid`/`kill` syscalls an OS process model
//! can't avoid. Ground-truthed against
//! `original_source/tests/unit/test_process.py`.

pub mod signals;

use std::collections::HashMap;
use std::ffi::CString;
use std::os::fd::RawFd;

use crate::descriptor::Descriptor;
use crate::error::{Error, Result};
use crate::hub::Hub;
use crate::poller::mask;
use crate::primitives::value::Value;

/// How a child terminated, as reported by `waitpid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(i32),
}

/// A forked child with its three stdio descriptors and an exit-observing
/// [`Value`].
pub struct Child {
    pid: libc::pid_t,
    pub stdin: Descriptor,
    pub stdout: Descriptor,
    pub stderr: Descriptor,
    pub done: Value<ExitStatus>,
}

impl Child {
    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    /// `kill(pid, 0)`: true iff the process still exists (not yet reaped as
    /// a zombie, or still running).
    pub fn check_liveness(&self) -> bool {
        unsafe { libc::kill(self.pid, 0) == 0 }
    }

    pub fn terminate(&self) {
        unsafe {
            libc::kill(self.pid, libc::SIGTERM);
        }
    }

    pub fn signal(&self, signum: i32) {
        unsafe {
            libc::kill(self.pid, signum);
        }
    }
}

struct StdioPipes {
    child_stdin_read: RawFd,
    parent_stdin_write: RawFd,
    parent_stdout_read: RawFd,
    child_stdout_write: RawFd,
    parent_stderr_read: RawFd,
    child_stderr_write: RawFd,
}

fn make_stdio_pipes() -> Result<StdioPipes> {
    let (child_stdin_read, parent_stdin_write) = os_pipe()?;
    let (parent_stdout_read, child_stdout_write) = os_pipe()?;
    let (parent_stderr_read, child_stderr_write) = os_pipe()?;
    Ok(StdioPipes {
        child_stdin_read,
        parent_stdin_write,
        parent_stdout_read,
        child_stdout_write,
        parent_stderr_read,
        child_stderr_write,
    })
}

fn os_pipe() -> Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok((fds[0], fds[1]))
}

/// Wire the parent-side halves of `pipes` into `Descriptor`s and build a
/// `Child` around `pid`. Used by both `execv` and `spawn` once the fork has
/// happened and the parent has closed its copies of the child-side fds.
fn finish_parent_side(hub: &Hub, pid: libc::pid_t, pipes: StdioPipes) -> Result<Child> {
    unsafe {
        libc::close(pipes.child_stdin_read);
        libc::close(pipes.child_stdout_write);
        libc::close(pipes.child_stderr_write);
    }

    let stdin = hub.register(pipes.parent_stdin_write, mask::OUT)?;
    let stdout = hub.register(pipes.parent_stdout_read, mask::IN)?;
    let stderr = hub.register(pipes.parent_stderr_read, mask::IN)?;

    let done = Value::new(hub.clone());
    spawn_reaper(hub, pid, done.clone());

    Ok(Child { pid, stdin, stdout, stderr, done })
}

/// One task per child: subscribes to SIGCHLD and retries a targeted,
/// non-blocking `waitpid` on every delivery until this specific pid is
/// reaped. Simpler than a single hub-wide reaper dispatch table, and
/// exactly as correct since `waitpid` with an explicit pid only ever
/// reaps that child.
fn spawn_reaper(hub: &Hub, pid: libc::pid_t, done: Value<ExitStatus>) {
    let hub = hub.clone();
    let sigchld = match hub.signal(libc::SIGCHLD) {
        Ok(recver) => recver,
        Err(err) => {
            tracing::error!(?err, pid, "failed to subscribe to SIGCHLD");
            return;
        }
    };
    hub.spawn(async move {
        loop {
            if let Some(status) = try_wait(pid) {
                done.send(status);
                return;
            }
            if sigchld.recv(None).await.is_err() {
                return;
            }
        }
    });
}

fn try_wait(pid: libc::pid_t) -> Option<ExitStatus> {
    let mut status: libc::c_int = 0;
    let rc = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
    if rc == pid {
        if libc::WIFSIGNALED(status) {
            Some(ExitStatus::Signaled(libc::WTERMSIG(status)))
        } else {
            Some(ExitStatus::Exited(libc::WEXITSTATUS(status)))
        }
    } else {
        None
    }
}

fn to_cstrings(argv: &[impl AsRef<str>]) -> Result<Vec<CString>> {
    argv.iter()
        .map(|s| CString::new(s.as_ref()).map_err(|_| Error::Io(std::io::ErrorKind::InvalidInput.into())))
        .collect()
}

/// Fork and `execvp(argv[0], argv)` in the child, replacing its stdio with
/// the pipe ends wired to the returned `Child`. `env`, when given, replaces
/// (not merges with) the child's environment. With `stderrtoout`, the
/// child's stderr fd is `dup2`'d onto its stdout fd before exec.
///
/// `ENOENT`/`EACCES` from a failed exec propagate synchronously to the
/// caller (not through `done`): the child writes its errno to a
/// close-on-exec notify pipe before exiting, and the parent blocks briefly
/// on that pipe right after forking — either it sees immediate EOF (exec
/// succeeded, the pipe's write end closed automatically) or it reads the
/// errno and returns it as an `Io` error.
pub fn execv(hub: &Hub, argv: &[impl AsRef<str>], env: Option<&HashMap<String, String>>, stderrtoout: bool) -> Result<Child> {
    let argv_c = to_cstrings(argv)?;
    let env_c: Option<Vec<CString>> = env.map(|vars| {
        vars.iter()
            .map(|(k, v)| CString::new(format!("{k}={v}")).expect("env var contains NUL"))
            .collect()
    });

    let pipes = make_stdio_pipes()?;
    let (err_read, err_write) = os_pipe()?;
    unsafe {
        let flags = libc::fcntl(err_write, libc::F_GETFD);
        libc::fcntl(err_write, libc::F_SETFD, flags | libc::FD_CLOEXEC);
    }

    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    if pid == 0 {
        unsafe {
            libc::dup2(pipes.child_stdin_read, 0);
            libc::dup2(pipes.child_stdout_write, 1);
            libc::dup2(if stderrtoout { pipes.child_stdout_write } else { pipes.child_stderr_write }, 2);
            libc::close(pipes.child_stdin_read);
            libc::close(pipes.parent_stdin_write);
            libc::close(pipes.child_stdout_write);
            libc::close(pipes.parent_stdout_read);
            libc::close(pipes.child_stderr_write);
            libc::close(pipes.parent_stderr_read);
            libc::close(err_read);

            let mut argv_ptrs: Vec<*const libc::c_char> = argv_c.iter().map(|s| s.as_ptr()).collect();
            argv_ptrs.push(std::ptr::null());

            if let Some(env_c) = &env_c {
                let mut env_ptrs: Vec<*const libc::c_char> = env_c.iter().map(|s| s.as_ptr()).collect();
                env_ptrs.push(std::ptr::null());
                libc::execve(argv_ptrs[0], argv_ptrs.as_ptr(), env_ptrs.as_ptr());
            } else {
                libc::execvp(argv_ptrs[0], argv_ptrs.as_ptr());
            }

            let errno = *libc::__errno_location();
            let bytes = errno.to_ne_bytes();
            libc::write(err_write, bytes.as_ptr() as *const libc::c_void, bytes.len());
            libc::_exit(127);
        }
    }

    unsafe {
        libc::close(err_write);
    }
    let mut errno_bytes = [0u8; 4];
    let n = unsafe { libc::read(err_read, errno_bytes.as_mut_ptr() as *mut libc::c_void, 4) };
    unsafe {
        libc::close(err_read);
    }
    if n == 4 {
        let errno = i32::from_ne_bytes(errno_bytes);
        unsafe {
            libc::waitpid(pid, std::ptr::null_mut(), 0);
        }
        close_pipes(&pipes);
        return Err(std::io::Error::from_raw_os_error(errno).into());
    }

    finish_parent_side(hub, pid, pipes)
}

fn close_pipes(pipes: &StdioPipes) {
    unsafe {
        libc::close(pipes.child_stdin_read);
        libc::close(pipes.parent_stdin_write);
        libc::close(pipes.child_stdout_write);
        libc::close(pipes.parent_stdout_read);
        libc::close(pipes.child_stderr_write);
        libc::close(pipes.parent_stderr_read);
    }
}

/// Fork and run `f` directly in the child (no exec); the child's stdio is
/// wired to pipes exactly as in `execv`, so `f` can talk to the parent
/// through `std::io::stdin()`/`stdout()`/`stderr()`.
pub fn spawn(hub: &Hub, f: impl FnOnce()) -> Result<Child> {
    let pipes = make_stdio_pipes()?;
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    if pid == 0 {
        unsafe {
            libc::dup2(pipes.child_stdin_read, 0);
            libc::dup2(pipes.child_stdout_write, 1);
            libc::dup2(pipes.child_stderr_write, 2);
            libc::close(pipes.child_stdin_read);
            libc::close(pipes.parent_stdin_write);
            libc::close(pipes.child_stdout_write);
            libc::close(pipes.parent_stdout_read);
            libc::close(pipes.child_stderr_write);
            libc::close(pipes.parent_stderr_read);
        }
        f();
        unsafe {
            libc::_exit(0);
        }
    }

    finish_parent_side(hub, pid, pipes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execv_of_missing_binary_reports_enoent_synchronously() {
        let hub = Hub::new();
        let argv: &[&str] = &["/definitely/not/a/real/binary-xyz"];
        let err = execv(&hub, argv, None, false).unwrap_err();
        match err {
            Error::Io(io_err) => assert_eq!(io_err.raw_os_error(), Some(libc::ENOENT)),
            other => panic!("expected Io(ENOENT), got {other:?}"),
        }
    }

    #[test]
    fn execv_true_exits_cleanly_and_fulfills_done() {
        let hub = Hub::new();
        let argv: &[&str] = &["/usr/bin/true"];
        let child = execv(&hub, argv, None, false).unwrap();
        assert!(child.check_liveness() || child.done.get().is_some());

        let hub2 = hub.clone();
        let done = child.done.clone();
        hub.spawn(async move {
            let status = done.recv(Some(2000)).await.unwrap();
            assert_eq!(status, ExitStatus::Exited(0));
            hub2.stop();
        });
        hub.run();
    }
}
