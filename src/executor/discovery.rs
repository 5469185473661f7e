//! Queue discovery
//!
//! Asking the device how many queues it has initializes driver state, and a
//! broken driver may crash doing it. Whenever tests run in workers the
//! question is asked from a short-lived helper process instead.

use nix::sys::wait::waitpid;
use nix::unistd::{dup2, fork, ForkResult};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, warn};

use super::channel::Pipe;
use super::packet::QueueCountPacket;
use super::signals;
use crate::error::{Result, RunnerError};
use crate::harness::TestHarness;

/// Query the queue count, from a helper process when `isolated`.
pub fn queue_count(harness: &dyn TestHarness, isolated: bool) -> Result<u32> {
    if !isolated {
        return harness
            .queue_count()
            .map_err(|e| RunnerError::Discovery(format!("{:#}", e)));
    }

    let pipe = Pipe::create()?;
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();

    // SAFETY: the child only runs the harness query and then _exits without
    // unwinding or running destructors.
    match unsafe { fork() } {
        Err(e) => Err(RunnerError::Spawn(format!("fork: {}", e))),
        Ok(ForkResult::Child) => {
            let writer = pipe.become_writer();
            signals::reset_in_child();
            silence_std_streams();

            let status = match panic::catch_unwind(AssertUnwindSafe(|| harness.queue_count())) {
                Ok(count) => {
                    writer.send(&QueueCountPacket(count.ok()));
                    0
                }
                Err(_) => 1,
            };
            // SAFETY: terminates the helper without touching parent state.
            unsafe { libc::_exit(status) }
        }
        Ok(ForkResult::Parent { child }) => {
            let reader = pipe.become_reader();
            let reply = reader.recv_blocking::<QueueCountPacket>();

            if let Err(e) = waitpid(child, None) {
                warn!("Failed to reap discovery helper {}: {}", child, e);
            }

            match reply {
                Some(QueueCountPacket(Some(count))) => {
                    debug!("Discovered {} queue(s)", count);
                    Ok(count)
                }
                Some(QueueCountPacket(None)) => Err(RunnerError::Discovery(
                    "harness could not report a queue count".into(),
                )),
                None => Err(RunnerError::Discovery(
                    "discovery helper exited without replying".into(),
                )),
            }
        }
    }
}

fn silence_std_streams() {
    if let Ok(null) = OpenOptions::new().write(true).open("/dev/null") {
        let _ = dup2(null.as_raw_fd(), libc::STDOUT_FILENO);
        let _ = dup2(null.as_raw_fd(), libc::STDERR_FILENO);
    }
}
