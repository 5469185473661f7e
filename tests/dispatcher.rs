//! End-to-end dispatcher runs
//!
//! These fork real worker processes and install process-wide signal
//! handlers, so every test holds `SERIAL` for its whole run.

use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::sleep;
use std::time::Duration;

use cts_runner::executor::{Dispatcher, IsolationMode, RunOptions};
use cts_runner::harness::{Manifest, ManifestHarness, TestHarness};
use cts_runner::models::{Outcome, TestDef, TestRegistry};

static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

/// Console sink shared with the test body
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
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

/// Decides the outcome from the test name prefix
struct Scripted {
    queues: Option<u32>,
}

impl TestHarness for Scripted {
    fn execute(&self, def: &TestDef, _queue: u32) -> Outcome {
        let kind = def.name.split('.').next().unwrap_or_default();
        match kind {
            "pass" => Outcome::Pass,
            "fail" => Outcome::Fail,
            "skip" => Outcome::Skip,
            "slow" => {
                sleep(Duration::from_millis(200));
                Outcome::Pass
            }
            "crash" => std::process::abort(),
            "panic" => panic!("harness panicked in {}", def.name),
            _ => Outcome::Fail,
        }
    }

    fn queue_count(&self) -> anyhow::Result<u32> {
        self.queues.ok_or_else(|| anyhow::anyhow!("no device"))
    }
}

/// Device whose driver dies while being queried
struct BrokenDevice;

impl TestHarness for BrokenDevice {
    fn execute(&self, _def: &TestDef, _queue: u32) -> Outcome {
        Outcome::Pass
    }

    fn queue_count(&self) -> anyhow::Result<u32> {
        std::process::abort()
    }
}

fn registry(names: &[&str], patterns: &[&str]) -> TestRegistry {
    let mut registry: TestRegistry = names.iter().map(|n| TestDef::new(*n)).collect();
    registry.enable_matching(patterns).unwrap();
    registry
}

fn options(isolation: IsolationMode, fork: bool, jobs: usize) -> RunOptions {
    RunOptions {
        jobs,
        isolation,
        fork,
        ..RunOptions::default()
    }
}

fn dispatcher(
    registry: TestRegistry,
    harness: impl TestHarness + 'static,
    options: RunOptions,
) -> (Dispatcher, Capture) {
    let console = Capture::default();
    let dispatcher = Dispatcher::new(Arc::new(registry), Arc::new(harness), options)
        .unwrap()
        .with_console(Box::new(console.clone()))
        .with_stderr(Box::new(io::sink()));
    (dispatcher, console)
}

#[test]
fn test_inline_run_reports_every_queue() {
    let _serial = serial();

    let mut registry: TestRegistry = [
        TestDef::new("pass.a"),
        TestDef::new("fail.b"),
        TestDef::new("skip.c"),
        TestDef::new("pass.wip").skipped(),
    ]
    .into_iter()
    .collect();
    registry.enable_matching::<&str>(&[]).unwrap();

    let (mut d, console) = dispatcher(
        registry,
        Scripted { queues: Some(2) },
        options(IsolationMode::Process, false, 1),
    );

    assert!(!d.run().unwrap());
    let counts = d.counts();
    assert_eq!(counts.planned, 8);
    assert_eq!((counts.pass, counts.fail, counts.skip, counts.lost), (2, 2, 4, 0));

    let text = console.text();
    assert!(text.contains("cts-runner: info   : running 8 tests"));
    assert!(text.contains("cts-runner: pass   : pass.a.q1"));
    assert!(text.contains("cts-runner: fail   : fail.b.q0"));
    assert!(text.contains("cts-runner: skip   : pass.wip.q0"));
    assert!(text.contains("cts-runner: info   : ran 8 tests"));
}

#[test]
fn test_process_workers_respect_job_limit() {
    let _serial = serial();

    let names: Vec<String> = (0..8).map(|i| format!("slow.{i}")).collect();
    let names: Vec<&str> = names.iter().map(String::as_str).collect();

    let (mut d, _console) = dispatcher(
        registry(&names, &[]),
        Scripted { queues: Some(1) },
        options(IsolationMode::Process, true, 4),
    );

    assert!(d.run().unwrap());
    assert_eq!(d.counts().pass, 8);
    assert!(d.peak_in_flight() <= 4);
    assert!(d.peak_in_flight() >= 2);
}

#[test]
fn test_crashed_worker_is_reported_lost() {
    let _serial = serial();

    let (mut d, console) = dispatcher(
        registry(&["pass.a", "crash.b", "pass.c"], &[]),
        Scripted { queues: Some(1) },
        options(IsolationMode::Process, true, 2),
    );

    assert!(!d.run().unwrap());
    let counts = d.counts();
    assert_eq!((counts.pass, counts.fail, counts.lost), (2, 0, 1));
    assert_eq!(counts.ran(), counts.planned);
    assert!(console.text().contains("lost   : crash.b.q0"));
}

#[test]
fn test_pinned_queue_outside_device_is_skipped() {
    let _serial = serial();

    let (mut d, console) = dispatcher(
        registry(&["pass.a", "pass.b", "fail.c"], &["pass.*.q1", "pass.b.q5"]),
        Scripted { queues: Some(2) },
        options(IsolationMode::Process, true, 1),
    );

    assert!(d.run().unwrap());
    let counts = d.counts();
    assert_eq!(counts.planned, 2);
    assert_eq!((counts.pass, counts.skip, counts.fail), (1, 1, 0));

    let text = console.text();
    assert!(text.contains("pass   : pass.a.q1"));
    assert!(text.contains("skip   : pass.b.q5"));
    assert!(!text.contains("fail.c"));
}

#[test]
fn test_thread_isolation_runs_in_order() {
    let _serial = serial();

    let (mut d, console) = dispatcher(
        registry(&["pass.a", "fail.b", "pass.c"], &[]),
        Scripted { queues: Some(1) },
        options(IsolationMode::Thread, true, 1),
    );

    assert!(!d.run().unwrap());
    let counts = d.counts();
    assert_eq!((counts.pass, counts.fail, counts.lost), (2, 1, 0));

    let text = console.text();
    let a = text.find("pass   : pass.a.q0").unwrap();
    let b = text.find("fail   : fail.b.q0").unwrap();
    let c = text.find("pass   : pass.c.q0").unwrap();
    assert!(a < b && b < c);
}

#[test]
fn test_discovery_failure_fails_run() {
    let _serial = serial();

    let (mut d, console) = dispatcher(
        registry(&["pass.a", "pass.b"], &[]),
        Scripted { queues: None },
        options(IsolationMode::Process, true, 2),
    );

    assert!(!d.run().unwrap());
    let counts = d.counts();
    assert_eq!(counts.planned, 2);
    assert_eq!(counts.ran(), 0);
    assert!(console.text().contains("ran 0 tests"));
}

#[test]
fn test_discovery_crash_in_thread_mode_is_contained() {
    let _serial = serial();

    let (mut d, console) = dispatcher(
        registry(&["pass.a", "pass.b"], &[]),
        BrokenDevice,
        options(IsolationMode::Thread, true, 1),
    );

    assert!(!d.run().unwrap());
    let counts = d.counts();
    assert_eq!(counts.planned, 2);
    assert_eq!(counts.ran(), 0);
    assert!(console.text().contains("ran 0 tests"));
}

#[test]
fn test_panicking_test_stays_in_its_worker() {
    let _serial = serial();
    let dir = tempfile::tempdir().unwrap();
    let escaped = dir.path().join("escaped");
    let parent = std::process::id();

    let (mut d, console) = dispatcher(
        registry(&["pass.a", "panic.b", "pass.c"], &[]),
        Scripted { queues: Some(1) },
        options(IsolationMode::Process, true, 1),
    );

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| d.run()));
    if std::process::id() != parent {
        // A worker made it back into this frame
        let _ = std::fs::write(&escaped, b"");
        unsafe { libc::_exit(0) }
    }

    assert!(!outcome.unwrap().unwrap());
    assert!(!escaped.exists());
    let counts = d.counts();
    assert_eq!((counts.pass, counts.fail, counts.lost), (2, 0, 1));
    assert!(console.text().contains("lost   : panic.b.q0"));
}

#[test]
fn test_junit_report_matches_counts() {
    let _serial = serial();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("results.xml");

    let (mut d, _console) = dispatcher(
        registry(&["pass.a", "fail.b", "skip.c", "crash.d"], &[]),
        Scripted { queues: Some(1) },
        options(IsolationMode::Process, true, 2).with_junit_xml(&path),
    );

    assert!(!d.run().unwrap());

    let xml = std::fs::read_to_string(&path).unwrap();
    assert!(xml.contains(r#"tests="4""#));
    assert!(xml.contains(r#"failures="1""#));
    assert!(xml.contains(r#"errors="1""#));
    assert!(xml.contains(r#"disabled="1""#));
    assert!(xml.contains(r#"<testcase status="lost" name="crash.d.q0">"#));
    assert!(xml.contains("<skipped/>"));
}

#[test]
fn test_manifest_commands_end_to_end() {
    let _serial = serial();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tests.yaml");
    std::fs::write(
        &path,
        r#"
queues: 2
tests:
  - name: true.cmd
    command: ["true"]
  - name: false.cmd
    command: ["false"]
  - name: skip.cmd
    command: ["sh", "-c", "exit 77"]
  - name: queue.cmd
    command: ["sh", "-c", "test \"$CTS_QUEUE_INDEX\" = 1"]
"#,
    )
    .unwrap();

    let manifest = Manifest::load(&path).unwrap();
    let mut registry = manifest.registry();
    registry.enable_matching::<&str>(&[]).unwrap();

    let (mut d, console) = dispatcher(
        registry,
        ManifestHarness::new(&manifest),
        options(IsolationMode::Process, true, 2),
    );

    assert!(!d.run().unwrap());
    let counts = d.counts();
    assert_eq!(counts.planned, 8);
    assert_eq!((counts.pass, counts.fail, counts.skip, counts.lost), (3, 3, 2, 0));

    let text = console.text();
    assert!(text.contains("fail   : queue.cmd.q0"));
    assert!(text.contains("pass   : queue.cmd.q1"));
}
