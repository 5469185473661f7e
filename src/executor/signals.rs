//! Signal handling for the dispatcher
//!
//! Handlers only touch atomics or write one byte to a pipe. Everything else
//! happens on the dispatcher thread when it next yields.

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use tracing::debug;

use super::channel::{Pipe, Reader, Writer};
use crate::error::{Result, RunnerError};

static SIGINT_RECEIVED: AtomicBool = AtomicBool::new(false);
static SIGCHLD_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_sigint(_: libc::c_int) {
    SIGINT_RECEIVED.store(true, Ordering::SeqCst);
}

extern "C" fn on_sigchld(_: libc::c_int) {
    let fd = SIGCHLD_WRITE_FD.load(Ordering::SeqCst);
    if fd < 0 {
        return;
    }
    // SAFETY: write(2) and errno access are async-signal-safe. A full pipe
    // already holds a pending wakeup, so EAGAIN is fine.
    unsafe {
        let errno = *libc::__errno_location();
        let byte = 1u8;
        libc::write(fd, (&byte as *const u8).cast(), 1);
        *libc::__errno_location() = errno;
    }
}

fn install(signal: Signal, handler: SigHandler) -> Result<SigAction> {
    let action = SigAction::new(handler, SaFlags::SA_RESTART, SigSet::empty());
    // SAFETY: the handlers above are async-signal-safe.
    unsafe { sigaction(signal, &action) }.map_err(RunnerError::Signal)
}

fn restore(signal: Signal, previous: &SigAction) {
    // SAFETY: reinstates a disposition previously returned by sigaction.
    if let Err(e) = unsafe { sigaction(signal, previous) } {
        debug!("Failed to restore {:?} disposition: {}", signal, e);
    }
}

/// Consume a pending interrupt request.
pub fn take_sigint() -> bool {
    SIGINT_RECEIVED.swap(false, Ordering::SeqCst)
}

/// Check for an interrupt request without consuming it.
pub fn sigint_pending() -> bool {
    SIGINT_RECEIVED.load(Ordering::SeqCst)
}

/// Put SIGINT and SIGCHLD back to their defaults in a freshly forked
/// worker, so a Ctrl-C forwarded by the dispatcher terminates it.
pub fn reset_in_child() {
    SIGCHLD_WRITE_FD.store(-1, Ordering::SeqCst);
    for signal in [Signal::SIGINT, Signal::SIGCHLD] {
        let _ = install(signal, SigHandler::SigDfl);
    }
}

/// Keep SIGINT and SIGCHLD off a worker thread so they interrupt the
/// dispatcher's `epoll_wait` instead.
pub fn block_in_worker_thread() {
    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    set.add(Signal::SIGCHLD);
    if let Err(e) = set.thread_block() {
        debug!("Failed to block signals in worker thread: {}", e);
    }
}

/// Records SIGINT for the lifetime of the guard.
pub struct SigintGuard {
    previous: SigAction,
}

impl SigintGuard {
    pub fn install() -> Result<Self> {
        SIGINT_RECEIVED.store(false, Ordering::SeqCst);
        let previous = install(Signal::SIGINT, SigHandler::Handler(on_sigint))?;
        Ok(Self { previous })
    }
}

impl Drop for SigintGuard {
    fn drop(&mut self) {
        restore(Signal::SIGINT, &self.previous);
        SIGINT_RECEIVED.store(false, Ordering::SeqCst);
    }
}

/// Self-pipe that becomes readable whenever a child process exits.
pub struct ChildExitChannel {
    reader: Pipe<Reader>,
    // Kept alive for the handler, which writes through the raw fd.
    _writer: Pipe<Writer>,
    previous: SigAction,
}

impl ChildExitChannel {
    pub fn install() -> Result<Self> {
        let (reader, writer) = Pipe::create()?.split();
        reader.set_nonblocking()?;
        writer.set_nonblocking()?;

        SIGCHLD_WRITE_FD.store(writer.as_raw_fd(), Ordering::SeqCst);
        let previous = match install(Signal::SIGCHLD, SigHandler::Handler(on_sigchld)) {
            Ok(previous) => previous,
            Err(e) => {
                SIGCHLD_WRITE_FD.store(-1, Ordering::SeqCst);
                return Err(e);
            }
        };

        Ok(Self {
            reader,
            _writer: writer,
            previous,
        })
    }

    /// Discard pending wakeups.
    pub fn clear(&self) {
        self.reader.drain_to(&mut io::sink(), &AtomicBool::new(false));
    }
}

impl AsRawFd for ChildExitChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }
}

impl Drop for ChildExitChannel {
    fn drop(&mut self) {
        restore(Signal::SIGCHLD, &self.previous);
        SIGCHLD_WRITE_FD.store(-1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::raise;

    #[test]
    fn test_sigint_is_recorded() {
        let guard = SigintGuard::install().unwrap();
        assert!(!take_sigint());

        raise(Signal::SIGINT).unwrap();
        assert!(sigint_pending());
        assert!(take_sigint());
        assert!(!take_sigint());

        drop(guard);
    }

    #[test]
    fn test_worker_thread_blocks_signals() {
        let mask = std::thread::spawn(|| {
            block_in_worker_thread();
            SigSet::thread_get_mask().unwrap()
        })
        .join()
        .unwrap();
        assert!(mask.contains(Signal::SIGINT));
        assert!(mask.contains(Signal::SIGCHLD));

        let here = SigSet::thread_get_mask().unwrap();
        assert!(!here.contains(Signal::SIGINT));
    }
}
