//! Test dispatcher
//!
//! Walks the enabled tests, hands each test/queue pair to an isolated worker
//! and records what comes back. All bookkeeping happens on one thread, woken
//! by the multiplexer whenever a worker writes a result or output, or a child
//! process exits.
//!
//! A worker that dies while holding tests gets those tests reported as lost;
//! the run carries on with fresh workers.

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{dup2, fork, ForkResult, Pid};
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::channel::{Pipe, Received};
use super::discovery;
use super::mux::{EventTag, Multiplexer, Token};
use super::options::{IsolationMode, RunOptions};
use super::packet::ResultPacket;
use super::proxy::{WorkerIdentity, WorkerPool, WorkerProxy, MAX_WORKERS};
use super::signals::{self, ChildExitChannel, SigintGuard};
use super::worker;
use crate::error::{Result, RunnerError};
use crate::harness::TestHarness;
use crate::models::{RunCounts, TestDef, TestId, TestRegistry, Verdict};
use crate::output::{JunitReport, Reporter};
use crate::utils::Timer;

/// Pause between forwarding Ctrl-C to workers and checking for a second one
const INTERRUPT_WINDOW: Duration = Duration::from_millis(500);

/// Runs one test session
pub struct Dispatcher {
    options: RunOptions,
    registry: Arc<TestRegistry>,
    harness: Arc<dyn TestHarness>,
    reporter: Reporter,
    stderr: Box<dyn Write>,
    junit: Option<JunitReport>,
    mux: Multiplexer,
    child_exit: Option<ChildExitChannel>,
    pool: WorkerPool,
    abort: AtomicBool,
    counts: RunCounts,
    in_flight: usize,
    peak_in_flight: usize,
    max_concurrent: usize,
    num_queues: u32,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<TestRegistry>,
        harness: Arc<dyn TestHarness>,
        options: RunOptions,
    ) -> Result<Self> {
        options.validate()?;

        let junit = match &options.junit_xml {
            Some(path) => Some(JunitReport::create(path, options.suite_name.as_str())?),
            None => None,
        };
        let reporter = Reporter::new(options.program.as_str()).with_pid_logging(options.log_pids);

        Ok(Self {
            max_concurrent: options.max_concurrent(),
            options,
            registry,
            harness,
            reporter,
            stderr: Box::new(io::stderr()),
            junit,
            mux: Multiplexer::new()?,
            child_exit: None,
            pool: WorkerPool::new(),
            abort: AtomicBool::new(false),
            counts: RunCounts::default(),
            in_flight: 0,
            peak_in_flight: 0,
            num_queues: 0,
        })
    }

    /// Send the result stream and forwarded worker stdout somewhere other
    /// than the process stdout.
    pub fn with_console(mut self, console: Box<dyn Write>) -> Self {
        self.reporter = self.reporter.with_console(console);
        self
    }

    /// Destination for forwarded worker stderr
    pub fn with_stderr(mut self, stderr: Box<dyn Write>) -> Self {
        self.stderr = stderr;
        self
    }

    pub fn counts(&self) -> &RunCounts {
        &self.counts
    }

    /// Most tests that were in flight at once
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight
    }

    /// Execute every enabled test and report. Returns whether the run
    /// succeeded: every planned test passed or was skipped.
    pub fn run(&mut self) -> Result<bool> {
        let _sigint = SigintGuard::install()?;
        let timer = Timer::start();

        match discovery::queue_count(self.harness.as_ref(), self.options.fork) {
            Ok(n) => {
                self.num_queues = n;
                self.counts = RunCounts::new(self.registry.planned(n));
                self.reporter.header(self.counts.planned);

                let outcome = if self.options.fork {
                    self.run_workers()
                } else {
                    self.run_inline();
                    Ok(())
                };
                if let Err(e) = outcome {
                    self.kill_all();
                    return Err(e);
                }
            }
            Err(e) => {
                error!("{}", e);
                self.counts = RunCounts::new(self.registry.enabled_count());
            }
        }

        self.reporter.summary(&self.counts);
        if let Some(junit) = self.junit.as_mut() {
            junit.finish(&self.counts)?;
        }

        info!(
            "Finished {} of {} tests in {}",
            self.counts.ran(),
            self.counts.planned,
            timer
        );
        Ok(self.counts.is_success())
    }

    /// Every enabled test/queue pair, in registry order
    fn work_items(&self) -> Vec<(TestId, u32)> {
        self.registry
            .enabled()
            .flat_map(|(id, def)| def.queues(self.num_queues).map(move |q| (id, q)))
            .collect()
    }

    /// Report skips decided by the dispatcher. Returns true if the pair was
    /// handled.
    fn skip_if_unrunnable(&mut self, def: &TestDef, id: TestId, queue: u32) -> bool {
        if queue >= self.num_queues {
            self.reporter.info(&format!(
                "{}: queue-family-index {} does not exist",
                def.name, queue
            ));
            self.report(id, queue, Verdict::Skip, 0);
            return true;
        }
        if def.skip {
            self.report(id, queue, Verdict::Skip, 0);
            return true;
        }
        false
    }

    fn run_inline(&mut self) {
        let registry = Arc::clone(&self.registry);

        for (id, queue) in self.work_items() {
            self.yield_to_sigint();
            if self.aborted() {
                break;
            }
            let Some(def) = registry.get(id) else {
                continue;
            };
            if self.skip_if_unrunnable(def, id, queue) {
                continue;
            }

            self.reporter.start(&def.qualified_name(queue), 0);
            let outcome = self.harness.execute(def, queue);
            self.report(id, queue, outcome.into(), 0);
        }
    }

    fn run_workers(&mut self) -> Result<()> {
        if self.options.isolation == IsolationMode::Process {
            let channel = ChildExitChannel::install()?;
            self.mux.register(channel.as_raw_fd(), Token::signal())?;
            self.child_exit = Some(channel);
        }

        self.dispatch_phase()?;
        self.cleanup_phase()?;

        if let Some(channel) = self.child_exit.take() {
            self.mux.deregister(channel.as_raw_fd())?;
        }
        Ok(())
    }

    fn dispatch_phase(&mut self) -> Result<()> {
        let registry = Arc::clone(&self.registry);

        for (id, queue) in self.work_items() {
            if self.aborted() {
                break;
            }
            let Some(def) = registry.get(id) else {
                continue;
            };
            if self.skip_if_unrunnable(def, id, queue) {
                continue;
            }

            self.dispatch_test(def, id, queue)?;
            self.collect_result(Some(Duration::ZERO))?;
        }
        Ok(())
    }

    fn cleanup_phase(&mut self) -> Result<()> {
        debug!("Entering cleanup with {} live worker(s)", self.pool.live());
        for worker in self.pool.iter_mut().filter(|w| !w.sentinel_sent()) {
            worker.send_sentinel();
        }
        while !self.pool.is_empty() {
            self.collect_result(None)?;
        }
        Ok(())
    }

    fn dispatch_test(&mut self, def: &TestDef, id: TestId, queue: u32) -> Result<()> {
        self.yield_to_sigint();

        while self.in_flight >= self.max_concurrent && !self.aborted() {
            self.collect_result(None)?;
        }

        let Some(slot) = self.acquire_worker()? else {
            return Ok(());
        };
        let name = def.qualified_name(queue);

        let Some(worker) = self.pool.get_mut(slot) else {
            return Err(RunnerError::Invariant(format!("worker slot {} vanished", slot)));
        };
        let pid = worker.log_pid();

        if worker.dispatch(id, queue) {
            if !worker.is_thread() {
                worker.send_sentinel();
            }
            self.in_flight += 1;
            self.peak_in_flight = self.peak_in_flight.max(self.in_flight);
            self.reporter.start(&name, pid);
        } else {
            warn!("Failed to dispatch {} to worker {}", name, pid);
            self.report(id, queue, Verdict::Lost, pid);
        }
        Ok(())
    }

    /// Find a worker able to take a test, spawning one if the limits allow.
    /// Returns `None` once the run is aborting.
    fn acquire_worker(&mut self) -> Result<Option<usize>> {
        loop {
            if self.aborted() {
                return Ok(None);
            }
            if let Some(slot) = self.pool.find_open() {
                return Ok(Some(slot));
            }

            if self.can_spawn() {
                match self.open_worker() {
                    Ok(slot) => return Ok(Some(slot)),
                    Err(e) => {
                        error!("Failed to start worker: {}", e);
                        self.abort.store(true, Ordering::SeqCst);
                        return Ok(None);
                    }
                }
            }

            self.collect_result(None)?;
        }
    }

    fn can_spawn(&self) -> bool {
        let live = self.pool.live();
        match self.options.isolation {
            IsolationMode::Process => live < self.max_concurrent,
            IsolationMode::Thread => live == 0,
        }
    }

    /// Start a worker and watch its pipes.
    fn open_worker(&mut self) -> Result<usize> {
        let slot = self
            .pool
            .free_slot()
            .ok_or_else(|| RunnerError::Spawn("no free worker slot".into()))?;

        let worker = match self.options.isolation {
            IsolationMode::Process => self.spawn_process()?,
            IsolationMode::Thread => self.spawn_thread()?,
        };

        if let Err(e) = self.watch(&worker, slot) {
            worker.abandon();
            return Err(e);
        }

        debug!("Worker {} started in slot {}", worker.log_pid(), slot);
        self.pool.insert(slot, worker);
        Ok(slot)
    }

    fn watch(&self, worker: &WorkerProxy, slot: usize) -> Result<()> {
        for pipe in [worker.result(), worker.stdout(), worker.stderr()] {
            pipe.set_nonblocking()?;
        }

        let fds = worker.watched_fds();
        for (i, (fd, tag)) in fds.iter().enumerate() {
            if let Err(e) = self.mux.register(*fd, Token::new(slot, *tag)) {
                for (fd, _) in &fds[..i] {
                    let _ = self.mux.deregister(*fd);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn spawn_process(&mut self) -> Result<WorkerProxy> {
        let dispatch = Pipe::create()?;
        let result = Pipe::create()?;
        let stdout = Pipe::create()?;
        let stderr = Pipe::create()?;

        self.reporter.flush();
        let _ = self.stderr.flush();
        let _ = io::stdout().flush();
        let _ = io::stderr().flush();

        // SAFETY: the child sticks to its own pipes and the harness, then
        // leaves through _exit without running the parent's destructors.
        match unsafe { fork() } {
            Err(e) => Err(RunnerError::Spawn(format!("fork: {}", e))),
            Ok(ForkResult::Child) => {
                let dispatch = dispatch.become_reader();
                let result = result.become_writer();
                let stdout = stdout.become_writer().into_owned();
                let stderr = stderr.become_writer().into_owned();

                let _ = dup2(stdout.as_raw_fd(), libc::STDOUT_FILENO);
                let _ = dup2(stderr.as_raw_fd(), libc::STDERR_FILENO);
                drop((stdout, stderr));

                signals::reset_in_child();
                self.pool.forget_all();

                let registry = &self.registry;
                let harness = self.harness.as_ref();
                let status = match panic::catch_unwind(AssertUnwindSafe(|| {
                    worker::run(&dispatch, &result, registry, harness)
                })) {
                    Ok(_) => 0,
                    Err(_) => 1,
                };
                // SAFETY: ends the worker without unwinding into parent code.
                unsafe { libc::_exit(status) }
            }
            Ok(ForkResult::Parent { child }) => Ok(WorkerProxy::new(
                WorkerIdentity::Process(child),
                dispatch.become_writer(),
                result.become_reader(),
                stdout.become_reader(),
                stderr.become_reader(),
            )),
        }
    }

    fn spawn_thread(&mut self) -> Result<WorkerProxy> {
        let (dispatch_rx, dispatch_tx) = Pipe::create()?.split();
        let (result_rx, result_tx) = Pipe::create()?.split();
        let (stdout_rx, stdout_tx) = Pipe::create()?.split();
        let (stderr_rx, stderr_tx) = Pipe::create()?.split();

        let registry = Arc::clone(&self.registry);
        let harness = Arc::clone(&self.harness);

        let handle = thread::Builder::new()
            .name("cts-worker".into())
            .spawn(move || {
                signals::block_in_worker_thread();
                // Threads share the process streams; the pipes only signal exit.
                let _streams = (stdout_tx, stderr_tx);
                worker::run(&dispatch_rx, &result_tx, &registry, harness.as_ref());
            })
            .map_err(|e| RunnerError::Spawn(format!("thread: {}", e)))?;

        Ok(WorkerProxy::new(
            WorkerIdentity::Thread(Some(handle)),
            dispatch_tx,
            result_rx,
            stdout_rx,
            stderr_rx,
        ))
    }

    /// Wait for one event and handle it.
    fn collect_result(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.yield_to_sigint();

        let Some(token) = self.mux.wait_one(timeout)? else {
            return Ok(());
        };

        match token.tag {
            EventTag::Result => self.read_results(token.slot),
            EventTag::Stdout => {
                if let Some(worker) = self.pool.get(token.slot) {
                    worker.stdout().drain_to(self.reporter.console(), &self.abort);
                }
                Ok(())
            }
            EventTag::Stderr => {
                if let Some(worker) = self.pool.get(token.slot) {
                    worker.stderr().drain_to(&mut *self.stderr, &self.abort);
                }
                Ok(())
            }
            EventTag::Signal => {
                if let Some(channel) = &self.child_exit {
                    channel.clear();
                }
                self.reap()
            }
        }
    }

    fn read_results(&mut self, slot: usize) -> Result<()> {
        let Some(worker) = self.pool.get(slot) else {
            return Ok(());
        };

        let mut packets = Vec::new();
        let closed = loop {
            match worker.result().try_recv::<ResultPacket>() {
                Received::Packet(p) => packets.push(p),
                Received::Empty => break false,
                Received::Closed => break true,
            }
        };
        let thread_exited = closed && worker.is_thread();

        for packet in packets {
            let Some(worker) = self.pool.get_mut(slot) else {
                break;
            };
            let pid = worker.log_pid();
            if !worker.complete(packet.test, packet.queue) {
                return Err(RunnerError::Invariant(format!(
                    "worker {} reported test {} it was not running",
                    pid, packet.test
                )));
            }
            self.in_flight -= 1;
            self.report(packet.test, packet.queue, packet.outcome.into(), pid);
        }

        // Processes are reaped through SIGCHLD; a thread is gone once it has
        // dropped its result writer.
        if thread_exited {
            self.retire_worker(slot)?;
        }
        Ok(())
    }

    /// Collect every exited child process.
    fn reap(&mut self) -> Result<()> {
        loop {
            let status = match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => return Ok(()),
                Ok(status) => status,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => return Ok(()),
                Err(e) => {
                    error!("waitpid failed: {}", e);
                    return Ok(());
                }
            };
            let Some(pid) = status.pid() else {
                continue;
            };
            if !matches!(status, WaitStatus::Exited(..) | WaitStatus::Signaled(..)) {
                continue;
            }

            let Some(slot) = self.pool.find_by_pid(pid) else {
                return Err(RunnerError::Invariant(format!(
                    "reaped unknown child process {}",
                    pid
                )));
            };

            if let WaitStatus::Signaled(_, signal, _) = status {
                debug!("Worker {} terminated by {:?}", pid, signal);
            }
            self.retire_worker(slot)?;
        }
    }

    /// Tear down a dead worker: drain what it left behind, report the tests
    /// it still held as lost and release its slot.
    fn retire_worker(&mut self, slot: usize) -> Result<()> {
        let Some(mut worker) = self.pool.remove(slot) else {
            return Err(RunnerError::Invariant(format!("slot {} is already empty", slot)));
        };
        worker.mark_dead();
        let pid = worker.log_pid();
        debug!(
            "Retiring worker {} after {} test(s)",
            pid,
            worker.lifetime_dispatched()
        );

        while let Received::Packet(packet) = worker.result().try_recv::<ResultPacket>() {
            if !worker.complete(packet.test, packet.queue) {
                return Err(RunnerError::Invariant(format!(
                    "worker {} reported test {} it was not running",
                    pid, packet.test
                )));
            }
            self.in_flight -= 1;
            self.report(packet.test, packet.queue, packet.outcome.into(), pid);
        }

        worker.stdout().drain_to(self.reporter.console(), &self.abort);
        worker.stderr().drain_to(&mut *self.stderr, &self.abort);

        let lost = worker.take_assigned();
        if !lost.is_empty() {
            warn!("Worker {} died holding {} test(s)", pid, lost.len());
        }
        for (test, queue) in lost {
            self.in_flight -= 1;
            self.report(test, queue, Verdict::Lost, pid);
        }

        for (fd, _) in worker.watched_fds() {
            self.mux.deregister(fd).map_err(|e| {
                RunnerError::Invariant(format!("failed to unwatch worker {}: {}", pid, e))
            })?;
        }

        worker.join();
        Ok(())
    }

    /// Act on a pending Ctrl-C. The first interrupts running workers and
    /// lets the run continue; a second within the window aborts the run.
    fn yield_to_sigint(&mut self) {
        if !signals::take_sigint() {
            return;
        }

        warn!("Interrupted, stopping running tests");
        for worker in self.pool.iter() {
            if worker.is_thread() {
                warn!("Thread workers cannot be interrupted");
            } else {
                debug!("Interrupting worker {} holding {:?}", worker.log_pid(), worker.assigned());
                worker.interrupt();
            }
        }

        thread::sleep(INTERRUPT_WINDOW);
        if signals::sigint_pending() {
            warn!("Interrupted twice, aborting the run");
            self.abort.store(true, Ordering::SeqCst);
        }
    }

    fn aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// Last resort after an internal error: kill every process worker and
    /// drop all slots.
    fn kill_all(&mut self) {
        for slot in 0..MAX_WORKERS {
            if let Some(worker) = self.pool.remove(slot) {
                worker.abandon();
            }
        }
        self.child_exit = None;
    }

    fn report(&mut self, test: TestId, queue: u32, verdict: Verdict, pid: u32) {
        let name = match self.registry.get(test) {
            Some(def) => def.qualified_name(queue),
            None => format!("#{}.q{}", test, queue),
        };

        self.counts.record(verdict);
        self.reporter.result(&name, verdict, pid);
        if let Some(junit) = self.junit.as_mut() {
            junit.add(&name, verdict);
        }
    }
}
