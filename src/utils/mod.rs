//! Utility functions and helpers

mod logger;
mod timer;

pub use logger::{init_logger, LogLevel};
pub use timer::Timer;
