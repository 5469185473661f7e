//! Unidirectional pipes between the dispatcher and its workers
//!
//! A [`Pipe`] starts [`Unopened`] with both ends alive. After a fork each side
//! keeps exactly one end by calling [`Pipe::become_reader`] or
//! [`Pipe::become_writer`]; the other end is closed. Role changes consume the
//! pipe, so a role can only be chosen once.

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd::pipe2;
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

use super::packet::{Packet, MAX_PACKET_SIZE};
use crate::error::{Result, RunnerError};

const DRAIN_CHUNK: usize = 4096;

/// Both ends are open
#[derive(Debug)]
pub struct Unopened {
    read: OwnedFd,
    write: OwnedFd,
}

/// Only the read end is open
#[derive(Debug)]
pub struct Reader(File);

/// Only the write end is open
#[derive(Debug)]
pub struct Writer(File);

/// A pipe in one of its three roles
#[derive(Debug)]
pub struct Pipe<S> {
    end: S,
}

/// Result of a non-blocking receive
#[derive(Debug, PartialEq, Eq)]
pub enum Received<P> {
    Packet(P),
    /// Nothing complete was available
    Empty,
    /// The writer is gone
    Closed,
}

impl Pipe<Unopened> {
    pub fn create() -> Result<Self> {
        let (read, write) = pipe2(OFlag::O_CLOEXEC).map_err(RunnerError::ChannelCreate)?;
        Ok(Self {
            end: Unopened { read, write },
        })
    }

    pub fn become_reader(self) -> Pipe<Reader> {
        Pipe {
            end: Reader(File::from(self.end.read)),
        }
    }

    pub fn become_writer(self) -> Pipe<Writer> {
        Pipe {
            end: Writer(File::from(self.end.write)),
        }
    }

    /// Keep both ends in this process, for thread workers.
    pub fn split(self) -> (Pipe<Reader>, Pipe<Writer>) {
        let Unopened { read, write } = self.end;
        (
            Pipe {
                end: Reader(File::from(read)),
            },
            Pipe {
                end: Writer(File::from(write)),
            },
        )
    }
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    fcntl(fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
        .map(drop)
        .map_err(RunnerError::ChannelCreate)
}

impl Pipe<Reader> {
    pub fn set_nonblocking(&self) -> Result<()> {
        set_nonblocking(self.as_raw_fd())
    }

    /// Read one packet without blocking. The reader must be non-blocking.
    pub fn try_recv<P: Packet>(&self) -> Received<P> {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        match (&self.end.0).read(&mut buf[..P::SIZE]) {
            Ok(0) => Received::Closed,
            Ok(n) if n == P::SIZE => match P::decode(&buf[..n]) {
                Some(packet) => Received::Packet(packet),
                None => Received::Empty,
            },
            Ok(_) => Received::Empty,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                Received::Empty
            }
            Err(_) => Received::Closed,
        }
    }

    /// Wait for the next packet. `None` means the writer went away or the
    /// read failed.
    pub fn recv_blocking<P: Packet>(&self) -> Option<P> {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        loop {
            match (&self.end.0).read(&mut buf[..P::SIZE]) {
                Ok(n) if n == P::SIZE => return P::decode(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                _ => return None,
            }
        }
    }

    /// Forward everything currently buffered in the pipe to `sink`.
    ///
    /// Stops when the pipe is empty or closed, or once `abort` is set. Write
    /// errors on the sink are ignored so a broken terminal never stalls the
    /// run.
    pub fn drain_to(&self, sink: &mut dyn Write, abort: &AtomicBool) {
        let mut buf = [0u8; DRAIN_CHUNK];
        while !abort.load(Ordering::Relaxed) {
            match (&self.end.0).read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let _ = sink.write_all(&buf[..n]);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        let _ = sink.flush();
    }
}

impl Pipe<Writer> {
    pub fn set_nonblocking(&self) -> Result<()> {
        set_nonblocking(self.as_raw_fd())
    }

    /// Write one packet in a single call. Returns `false` if the packet did
    /// not go out whole, which means the reader is gone.
    pub fn send<P: Packet>(&self, packet: &P) -> bool {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        packet.encode(&mut buf[..P::SIZE]);
        loop {
            match (&self.end.0).write(&buf[..P::SIZE]) {
                Ok(n) => return n == P::SIZE,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => return false,
            }
        }
    }

    /// Give up the pipe wrapper and keep the descriptor, e.g. for `dup2`.
    pub fn into_owned(self) -> OwnedFd {
        OwnedFd::from(self.end.0)
    }
}

impl AsFd for Pipe<Reader> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.end.0.as_fd()
    }
}

impl AsFd for Pipe<Writer> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.end.0.as_fd()
    }
}

impl AsRawFd for Pipe<Reader> {
    fn as_raw_fd(&self) -> RawFd {
        self.end.0.as_raw_fd()
    }
}

impl AsRawFd for Pipe<Writer> {
    fn as_raw_fd(&self) -> RawFd {
        self.end.0.as_raw_fd()
    }
}
