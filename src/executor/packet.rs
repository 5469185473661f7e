//! Fixed-size messages exchanged with workers
//!
//! Every packet is written with a single `write` and read with a single
//! `read`. Keeping them no larger than `PIPE_BUF` makes both operations
//! atomic, so a non-blocking reader never observes half a packet.

use crate::models::{Outcome, TestId};

/// A record with a fixed wire size
pub trait Packet: Sized {
    const SIZE: usize;

    fn encode(&self, buf: &mut [u8]);

    fn decode(buf: &[u8]) -> Option<Self>;
}

/// Largest packet size; buffers are allocated with this length.
pub const MAX_PACKET_SIZE: usize = 16;

const SENTINEL: u32 = u32::MAX;

/// Master → worker: run `test` on `queue`, or stop when `test` is `None`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DispatchPacket {
    pub test: Option<TestId>,
    pub queue: u32,
}

impl DispatchPacket {
    pub fn new(test: TestId, queue: u32) -> Self {
        Self {
            test: Some(test),
            queue,
        }
    }

    /// No further tests will be sent on this channel.
    pub fn sentinel() -> Self {
        Self {
            test: None,
            queue: 0,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.test.is_none()
    }
}

impl Packet for DispatchPacket {
    const SIZE: usize = 8;

    fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.test.unwrap_or(SENTINEL).to_le_bytes());
        buf[4..8].copy_from_slice(&self.queue.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Option<Self> {
        let test = u32::from_le_bytes(buf.get(0..4)?.try_into().ok()?);
        let queue = u32::from_le_bytes(buf.get(4..8)?.try_into().ok()?);
        Some(Self {
            test: (test != SENTINEL).then_some(test),
            queue,
        })
    }
}

/// Worker → master: outcome of one dispatched test.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResultPacket {
    pub test: TestId,
    pub queue: u32,
    pub outcome: Outcome,
}

impl Packet for ResultPacket {
    const SIZE: usize = 12;

    fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.test.to_le_bytes());
        buf[4..8].copy_from_slice(&self.queue.to_le_bytes());
        buf[8] = self.outcome.to_byte();
        buf[9..12].fill(0);
    }

    fn decode(buf: &[u8]) -> Option<Self> {
        let test = u32::from_le_bytes(buf.get(0..4)?.try_into().ok()?);
        let queue = u32::from_le_bytes(buf.get(4..8)?.try_into().ok()?);
        let outcome = Outcome::from_byte(*buf.get(8)?)?;
        Some(Self {
            test,
            queue,
            outcome,
        })
    }
}

/// Helper process → master: discovered queue count, `None` on failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueCountPacket(pub Option<u32>);

impl Packet for QueueCountPacket {
    const SIZE: usize = 4;

    fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.0.unwrap_or(SENTINEL).to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Option<Self> {
        let count = u32::from_le_bytes(buf.get(0..4)?.try_into().ok()?);
        Some(Self((count != SENTINEL).then_some(count)))
    }
}

const _: () = assert!(DispatchPacket::SIZE <= MAX_PACKET_SIZE);
const _: () = assert!(ResultPacket::SIZE <= MAX_PACKET_SIZE);
const _: () = assert!(MAX_PACKET_SIZE <= libc::PIPE_BUF);
