//! Readiness multiplexer over epoll
//!
//! Every registered descriptor carries a [`Token`] naming the worker slot and
//! which of its pipes became readable. Waits return at most one event.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use crate::error::{Result, RunnerError};

/// Which pipe an event belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventTag {
    Result,
    Stdout,
    Stderr,
    /// Child-exit notifications; not tied to a slot
    Signal,
}

/// Registration data round-tripped through the kernel
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Token {
    pub slot: usize,
    pub tag: EventTag,
}

const SIGNAL_TOKEN: u64 = u64::MAX;

impl Token {
    pub fn new(slot: usize, tag: EventTag) -> Self {
        Self { slot, tag }
    }

    pub fn signal() -> Self {
        Self {
            slot: 0,
            tag: EventTag::Signal,
        }
    }

    fn to_u64(self) -> u64 {
        let tag = match self.tag {
            EventTag::Result => 0,
            EventTag::Stdout => 1,
            EventTag::Stderr => 2,
            EventTag::Signal => return SIGNAL_TOKEN,
        };
        ((self.slot as u64) << 2) | tag
    }

    fn from_u64(data: u64) -> Self {
        if data == SIGNAL_TOKEN {
            return Self::signal();
        }
        let tag = match data & 0b11 {
            0 => EventTag::Result,
            1 => EventTag::Stdout,
            _ => EventTag::Stderr,
        };
        Self {
            slot: (data >> 2) as usize,
            tag,
        }
    }
}

/// An epoll instance
#[derive(Debug)]
pub struct Multiplexer {
    epfd: OwnedFd,
}

fn cvt(ret: libc::c_int) -> Result<libc::c_int> {
    if ret < 0 {
        Err(RunnerError::Multiplexer(io::Error::last_os_error()))
    } else {
        Ok(ret)
    }
}

impl Multiplexer {
    pub fn new() -> Result<Self> {
        // SAFETY: no pointers involved; a valid fd is returned on success.
        let fd = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        // SAFETY: `fd` was just created and is owned by nothing else.
        let epfd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self { epfd })
    }

    /// Watch `fd` for readability.
    pub fn register(&self, fd: RawFd, token: Token) -> Result<()> {
        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: token.to_u64(),
        };
        // SAFETY: `event` is a valid, initialized epoll_event.
        cvt(unsafe {
            libc::epoll_ctl(
                self.epfd.as_raw_fd(),
                libc::EPOLL_CTL_ADD,
                fd,
                &mut event,
            )
        })?;
        Ok(())
    }

    pub fn deregister(&self, fd: RawFd) -> Result<()> {
        // SAFETY: EPOLL_CTL_DEL ignores the event pointer.
        cvt(unsafe {
            libc::epoll_ctl(
                self.epfd.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        })?;
        Ok(())
    }

    /// Wait for a single ready descriptor.
    ///
    /// `None` blocks until an event arrives; `Some(Duration::ZERO)` polls.
    /// A timeout or an interrupting signal yields `Ok(None)`.
    pub fn wait_one(&self, timeout: Option<Duration>) -> Result<Option<Token>> {
        let timeout_ms = match timeout {
            None => -1,
            Some(d) => d.as_millis().min(i32::MAX as u128) as libc::c_int,
        };
        let mut event = libc::epoll_event { events: 0, u64: 0 };

        // SAFETY: `event` has room for the single event requested.
        let n = unsafe { libc::epoll_wait(self.epfd.as_raw_fd(), &mut event, 1, timeout_ms) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(None);
            }
            return Err(RunnerError::Multiplexer(err));
        }
        if n == 0 {
            return Ok(None);
        }

        let data = event.u64;
        Ok(Some(Token::from_u64(data)))
    }
}
