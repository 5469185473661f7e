//! Console result stream
//!
//! One line per event, flushed immediately so the last line printed before a
//! GPU hang names the test that caused it. Tags are padded to seven columns
//! and pids to ten, wide enough for `warning` and `dispatcher`.

use std::io::{self, Write};

use crate::models::{RunCounts, Verdict};

const RULE: &str = "================================";

/// Writes the human-readable result stream
pub struct Reporter {
    program: String,
    log_pids: bool,
    console: Box<dyn Write>,
}

impl Reporter {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            log_pids: false,
            console: Box::new(io::stdout()),
        }
    }

    pub fn with_pid_logging(mut self, enable: bool) -> Self {
        self.log_pids = enable;
        self
    }

    pub fn with_console(mut self, console: Box<dyn Write>) -> Self {
        self.console = console;
        self
    }

    /// Sink for bytes forwarded from worker stdout
    pub fn console(&mut self) -> &mut dyn Write {
        &mut *self.console
    }

    pub fn flush(&mut self) {
        let _ = self.console.flush();
    }

    pub fn header(&mut self, planned: u32) {
        self.line("info", 0, &format!("running {} tests", planned));
        self.line("info", 0, RULE);
    }

    pub fn start(&mut self, name: &str, pid: u32) {
        self.line("start", pid, name);
    }

    pub fn result(&mut self, name: &str, verdict: Verdict, pid: u32) {
        self.line(verdict.as_str(), pid, name);
    }

    pub fn info(&mut self, message: &str) {
        self.line("info", 0, message);
    }

    pub fn summary(&mut self, counts: &RunCounts) {
        self.line("info", 0, RULE);
        self.line("info", 0, &format!("ran {} tests", counts.ran()));
        self.line("info", 0, &format!("pass {}", counts.pass));
        self.line("info", 0, &format!("fail {}", counts.fail));
        self.line("info", 0, &format!("skip {}", counts.skip));
        self.line("info", 0, &format!("lost {}", counts.lost));
    }

    fn line(&mut self, tag: &str, pid: u32, message: &str) {
        let line = self.format_line(tag, pid, message);
        let _ = writeln!(self.console, "{}", line);
        let _ = self.console.flush();
    }

    fn format_line(&self, tag: &str, pid: u32, message: &str) -> String {
        if !self.log_pids {
            return format!("{}: {:<7}: {}", self.program, tag, message);
        }
        let who = if pid == 0 {
            "dispatcher".to_string()
        } else {
            pid.to_string()
        };
        format!("{} [{:<10}]: {:<7}: {}", self.program, who, tag, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Capture {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    #[test]
    fn test_plain_lines() {
        let capture = Capture::default();
        let mut reporter = Reporter::new("crucible").with_console(Box::new(capture.clone()));

        reporter.result("func.draw.q0", Verdict::Pass, 1234);
        reporter.result("func.clear.q1", Verdict::Lost, 0);

        assert_eq!(
            capture.text(),
            "crucible: pass   : func.draw.q0\ncrucible: lost   : func.clear.q1\n"
        );
    }

    #[test]
    fn test_pid_lines() {
        let reporter = Reporter::new("crucible").with_pid_logging(true);
        assert_eq!(
            reporter.format_line("start", 42, "a.q0"),
            "crucible [42        ]: start  : a.q0"
        );
        assert_eq!(
            reporter.format_line("warning", 0, "x"),
            "crucible [dispatcher]: warning: x"
        );
    }

    #[test]
    fn test_summary() {
        let capture = Capture::default();
        let mut reporter = Reporter::new("crucible").with_console(Box::new(capture.clone()));

        let mut counts = RunCounts::new(3);
        counts.record(Verdict::Pass);
        counts.record(Verdict::Fail);
        counts.record(Verdict::Lost);
        reporter.summary(&counts);

        let text = capture.text();
        assert!(text.contains("crucible: info   : ran 3 tests\n"));
        assert!(text.contains("crucible: info   : lost 1\n"));
        assert!(text.starts_with("crucible: info   : ================================\n"));
    }
}
