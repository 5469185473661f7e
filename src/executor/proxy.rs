//! Dispatcher-side handles for workers
//!
//! A [`WorkerProxy`] owns the dispatcher's ends of a worker's four pipes and
//! remembers which tests the worker holds. The [`WorkerPool`] is a fixed set
//! of slots; the slot index is what the multiplexer token carries.

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use std::os::fd::{AsRawFd, RawFd};
use std::thread::JoinHandle;
use tracing::{debug, warn};

use super::channel::{Pipe, Reader, Writer};
use super::mux::EventTag;
use super::packet::DispatchPacket;
use crate::models::TestId;

/// Most workers alive at once
pub const MAX_WORKERS: usize = 64;

/// Most tests queued on one worker
pub const MAX_ASSIGNED: usize = 256;

/// How the worker was started
#[derive(Debug)]
pub enum WorkerIdentity {
    Process(Pid),
    Thread(Option<JoinHandle<()>>),
}

/// Dispatcher's view of one worker
#[derive(Debug)]
pub struct WorkerProxy {
    identity: WorkerIdentity,
    dispatch: Pipe<Writer>,
    result: Pipe<Reader>,
    stdout: Pipe<Reader>,
    stderr: Pipe<Reader>,
    assigned: Vec<(TestId, u32)>,
    lifetime_dispatched: u32,
    sentinel_sent: bool,
    dead: bool,
}

impl WorkerProxy {
    pub fn new(
        identity: WorkerIdentity,
        dispatch: Pipe<Writer>,
        result: Pipe<Reader>,
        stdout: Pipe<Reader>,
        stderr: Pipe<Reader>,
    ) -> Self {
        Self {
            identity,
            dispatch,
            result,
            stdout,
            stderr,
            assigned: Vec::new(),
            lifetime_dispatched: 0,
            sentinel_sent: false,
            dead: false,
        }
    }

    pub fn pid(&self) -> Option<Pid> {
        match self.identity {
            WorkerIdentity::Process(pid) => Some(pid),
            WorkerIdentity::Thread(_) => None,
        }
    }

    pub fn is_thread(&self) -> bool {
        matches!(self.identity, WorkerIdentity::Thread(_))
    }

    /// Pid shown in console output. Thread workers share the dispatcher's.
    pub fn log_pid(&self) -> u32 {
        match self.identity {
            WorkerIdentity::Process(pid) => pid.as_raw() as u32,
            WorkerIdentity::Thread(_) => std::process::id(),
        }
    }

    /// Can this worker take another test?
    ///
    /// A process runs exactly one test in its lifetime. The thread worker
    /// queues tests up to [`MAX_ASSIGNED`].
    pub fn is_open(&self) -> bool {
        if self.dead || self.sentinel_sent {
            return false;
        }
        match self.identity {
            WorkerIdentity::Process(_) => self.lifetime_dispatched == 0,
            WorkerIdentity::Thread(_) => self.assigned.len() < MAX_ASSIGNED,
        }
    }

    pub fn mark_dead(&mut self) {
        self.dead = true;
    }

    pub fn assigned(&self) -> &[(TestId, u32)] {
        &self.assigned
    }

    pub fn lifetime_dispatched(&self) -> u32 {
        self.lifetime_dispatched
    }

    pub fn sentinel_sent(&self) -> bool {
        self.sentinel_sent
    }

    /// Send a test and record it as held by this worker. Returns `false`,
    /// recording nothing, if the packet could not be delivered or the worker
    /// is already holding its maximum.
    pub fn dispatch(&mut self, test: TestId, queue: u32) -> bool {
        if self.assigned.len() >= MAX_ASSIGNED {
            return false;
        }
        if !self.dispatch.send(&DispatchPacket::new(test, queue)) {
            return false;
        }
        self.assigned.push((test, queue));
        self.lifetime_dispatched += 1;
        true
    }

    /// Forget a test whose result arrived. `false` if the worker never held it.
    pub fn complete(&mut self, test: TestId, queue: u32) -> bool {
        match self.assigned.iter().position(|&a| a == (test, queue)) {
            Some(idx) => {
                self.assigned.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Tests the worker still held, in dispatch order.
    pub fn take_assigned(&mut self) -> Vec<(TestId, u32)> {
        std::mem::take(&mut self.assigned)
    }

    /// Tell the worker no more tests are coming. Only the first call writes.
    pub fn send_sentinel(&mut self) {
        if self.sentinel_sent {
            return;
        }
        self.sentinel_sent = true;
        if !self.dispatch.send(&DispatchPacket::sentinel()) {
            debug!("Worker {} did not take its sentinel", self.log_pid());
        }
    }

    pub fn result(&self) -> &Pipe<Reader> {
        &self.result
    }

    pub fn stdout(&self) -> &Pipe<Reader> {
        &self.stdout
    }

    pub fn stderr(&self) -> &Pipe<Reader> {
        &self.stderr
    }

    /// The three descriptors the dispatcher watches, with their tags
    pub fn watched_fds(&self) -> [(RawFd, EventTag); 3] {
        [
            (self.result.as_raw_fd(), EventTag::Result),
            (self.stdout.as_raw_fd(), EventTag::Stdout),
            (self.stderr.as_raw_fd(), EventTag::Stderr),
        ]
    }

    pub fn interrupt(&self) {
        if let WorkerIdentity::Process(pid) = self.identity {
            if let Err(e) = kill(pid, Signal::SIGINT) {
                debug!("Failed to interrupt worker {}: {}", pid, e);
            }
        }
    }

    /// Wait for a thread worker to return. No-op for processes.
    pub fn join(&mut self) {
        if let WorkerIdentity::Thread(handle) = &mut self.identity {
            if let Some(handle) = handle.take() {
                if handle.join().is_err() {
                    warn!("Worker thread panicked");
                }
            }
        }
    }

    /// Tear down a worker the dispatcher could not finish setting up.
    /// Processes are killed and reaped; threads see their dispatch channel
    /// close and are joined.
    pub fn abandon(self) {
        let WorkerProxy {
            identity,
            dispatch,
            result,
            stdout,
            stderr,
            ..
        } = self;
        drop(dispatch);

        match identity {
            WorkerIdentity::Process(pid) => {
                let _ = kill(pid, Signal::SIGKILL);
                let _ = waitpid(pid, None);
            }
            WorkerIdentity::Thread(Some(handle)) => {
                let _ = handle.join();
            }
            WorkerIdentity::Thread(None) => {}
        }
        drop((result, stdout, stderr));
    }
}

/// Fixed-capacity table of workers
#[derive(Debug)]
pub struct WorkerPool {
    slots: Vec<Option<WorkerProxy>>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_WORKERS).map(|_| None).collect(),
        }
    }

    pub fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(Option::is_none)
    }

    pub fn insert(&mut self, slot: usize, worker: WorkerProxy) {
        self.slots[slot] = Some(worker);
    }

    pub fn get(&self, slot: usize) -> Option<&WorkerProxy> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut WorkerProxy> {
        self.slots.get_mut(slot).and_then(Option::as_mut)
    }

    pub fn remove(&mut self, slot: usize) -> Option<WorkerProxy> {
        self.slots.get_mut(slot).and_then(Option::take)
    }

    pub fn find_open(&self) -> Option<usize> {
        self.slots
            .iter()
            .position(|w| w.as_ref().is_some_and(WorkerProxy::is_open))
    }

    pub fn find_by_pid(&self, pid: Pid) -> Option<usize> {
        self.slots
            .iter()
            .position(|w| w.as_ref().and_then(WorkerProxy::pid) == Some(pid))
    }

    /// Number of occupied slots
    pub fn live(&self) -> usize {
        self.slots.iter().filter(|w| w.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.live() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerProxy> {
        self.slots.iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut WorkerProxy> {
        self.slots.iter_mut().flatten()
    }

    /// Close every pipe without signalling anyone. Used in a freshly forked
    /// worker to let go of its siblings' channels.
    pub fn forget_all(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::channel::Received;

    struct Ends {
        proxy: WorkerProxy,
        dispatch_rx: Pipe<Reader>,
    }

    fn thread_proxy() -> Ends {
        let (dispatch_rx, dispatch_tx) = Pipe::create().unwrap().split();
        let (result_rx, _) = Pipe::create().unwrap().split();
        let (stdout_rx, _) = Pipe::create().unwrap().split();
        let (stderr_rx, _) = Pipe::create().unwrap().split();
        Ends {
            proxy: WorkerProxy::new(
                WorkerIdentity::Thread(None),
                dispatch_tx,
                result_rx,
                stdout_rx,
                stderr_rx,
            ),
            dispatch_rx,
        }
    }

    #[test]
    fn test_dispatch_tracks_assignments() {
        let Ends {
            mut proxy,
            dispatch_rx,
        } = thread_proxy();

        assert!(proxy.is_open());
        assert!(proxy.dispatch(4, 0));
        assert!(proxy.dispatch(5, 1));
        assert_eq!(proxy.assigned(), &[(4, 0), (5, 1)]);
        assert_eq!(
            dispatch_rx.recv_blocking::<DispatchPacket>(),
            Some(DispatchPacket::new(4, 0))
        );

        assert!(proxy.complete(4, 0));
        assert!(!proxy.complete(4, 0));
        assert_eq!(proxy.take_assigned(), vec![(5, 1)]);
        assert_eq!(proxy.lifetime_dispatched(), 2);
    }

    #[test]
    fn test_sentinel_sent_once() {
        let Ends {
            mut proxy,
            dispatch_rx,
        } = thread_proxy();
        dispatch_rx.set_nonblocking().unwrap();

        proxy.send_sentinel();
        proxy.send_sentinel();
        assert!(proxy.sentinel_sent());
        assert!(!proxy.is_open());

        assert_eq!(
            dispatch_rx.try_recv::<DispatchPacket>(),
            Received::Packet(DispatchPacket::sentinel())
        );
        assert_eq!(dispatch_rx.try_recv::<DispatchPacket>(), Received::Empty);
    }

    #[test]
    fn test_thread_capacity() {
        let Ends {
            mut proxy,
            dispatch_rx: _rx,
        } = thread_proxy();
        for id in 0..MAX_ASSIGNED as u32 {
            assert!(proxy.dispatch(id, 0));
        }
        assert!(!proxy.is_open());
        assert!(!proxy.dispatch(999, 0));
    }

    #[test]
    fn test_dispatch_to_gone_worker_fails() {
        let Ends {
            mut proxy,
            dispatch_rx,
        } = thread_proxy();
        drop(dispatch_rx);
        assert!(!proxy.dispatch(1, 0));
        assert!(proxy.assigned().is_empty());
    }

    #[test]
    fn test_pool_slots() {
        let mut pool = WorkerPool::new();
        assert!(pool.is_empty());
        assert_eq!(pool.free_slot(), Some(0));

        pool.insert(0, thread_proxy().proxy);
        assert_eq!(pool.free_slot(), Some(1));
        assert_eq!(pool.find_open(), Some(0));
        assert_eq!(pool.live(), 1);
        assert_eq!(pool.find_by_pid(Pid::from_raw(1)), None);

        assert!(pool.remove(0).is_some());
        assert!(pool.remove(0).is_none());
        assert!(pool.is_empty());
    }
}
