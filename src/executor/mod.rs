//! Test execution engine
//!
//! Isolates tests in forked processes or a worker thread and multiplexes
//! their results back onto a single dispatcher thread.

mod channel;
mod discovery;
mod dispatcher;
mod mux;
mod options;
mod packet;
mod proxy;
mod signals;
mod worker;

pub use dispatcher::Dispatcher;
pub use options::{is_one_test, IsolationMode, RunOptions, MAX_JOBS};

pub use crate::error::RunnerError;
