//! Wall-clock timing for runs

use std::fmt;
use std::time::{Duration, Instant};

/// Measures one span of work
#[derive(Debug)]
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

/// `1.234s`, or whole milliseconds below one second
impl fmt::Display for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let elapsed = self.elapsed();
        if elapsed < Duration::from_secs(1) {
            write!(f, "{}ms", elapsed.as_millis())
        } else {
            write!(f, "{:.3}s", elapsed.as_secs_f64())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_elapsed() {
        let timer = Timer::start();
        sleep(Duration::from_millis(10));
        assert!(timer.elapsed_ms() >= 10);
        assert!(timer.to_string().ends_with("ms"));
        assert!(timer.elapsed() >= Duration::from_millis(10));
    }
}
