//! Worker loop
//!
//! Runs inside a forked child or the worker thread. Blocks on the dispatch
//! pipe, executes each test through the harness and answers with a result
//! packet. Returns once the dispatcher sends the sentinel or goes away.

use tracing::{debug, warn};

use super::channel::{Pipe, Reader, Writer};
use super::packet::{DispatchPacket, ResultPacket};
use crate::harness::TestHarness;
use crate::models::{Outcome, TestRegistry};

/// Serve dispatch requests until told to stop. Returns the number of tests
/// executed.
pub fn run(
    dispatch: &Pipe<Reader>,
    results: &Pipe<Writer>,
    registry: &TestRegistry,
    harness: &dyn TestHarness,
) -> u32 {
    let mut executed = 0;

    loop {
        let Some(packet) = dispatch.recv_blocking::<DispatchPacket>() else {
            debug!("Dispatch channel closed");
            break;
        };
        let Some(test) = packet.test else {
            break;
        };

        let outcome = match registry.get(test) {
            Some(def) => harness.execute(def, packet.queue),
            None => {
                warn!("Dispatched unknown test id {}", test);
                Outcome::Fail
            }
        };
        executed += 1;

        let result = ResultPacket {
            test,
            queue: packet.queue,
            outcome,
        };
        if !results.send(&result) {
            break;
        }
    }

    executed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TestDef;

    struct NameHarness;

    impl TestHarness for NameHarness {
        fn execute(&self, def: &TestDef, _queue: u32) -> Outcome {
            if def.name.starts_with("fail") {
                Outcome::Fail
            } else {
                Outcome::Pass
            }
        }

        fn queue_count(&self) -> anyhow::Result<u32> {
            Ok(1)
        }
    }

    fn registry() -> TestRegistry {
        ["pass.a", "fail.b"].into_iter().map(TestDef::new).collect()
    }

    #[test]
    fn test_worker_stops_at_sentinel() {
        let (dispatch_rx, dispatch_tx) = Pipe::create().unwrap().split();
        let (result_rx, result_tx) = Pipe::create().unwrap().split();

        assert!(dispatch_tx.send(&DispatchPacket::new(0, 0)));
        assert!(dispatch_tx.send(&DispatchPacket::new(1, 2)));
        assert!(dispatch_tx.send(&DispatchPacket::sentinel()));
        assert!(dispatch_tx.send(&DispatchPacket::new(0, 0)));

        let executed = run(&dispatch_rx, &result_tx, &registry(), &NameHarness);
        assert_eq!(executed, 2);

        let first: ResultPacket = result_rx.recv_blocking().unwrap();
        assert_eq!((first.test, first.outcome), (0, Outcome::Pass));
        let second: ResultPacket = result_rx.recv_blocking().unwrap();
        assert_eq!((second.test, second.queue, second.outcome), (1, 2, Outcome::Fail));
    }

    #[test]
    fn test_worker_stops_on_closed_channel() {
        let (dispatch_rx, dispatch_tx) = Pipe::create().unwrap().split();
        let (_result_rx, result_tx) = Pipe::create().unwrap().split();
        drop(dispatch_tx);

        assert_eq!(run(&dispatch_rx, &result_tx, &registry(), &NameHarness), 0);
    }

    #[test]
    fn test_worker_stops_when_results_unread() {
        let (dispatch_rx, dispatch_tx) = Pipe::create().unwrap().split();
        let (result_rx, result_tx) = Pipe::create().unwrap().split();
        drop(result_rx);

        assert!(dispatch_tx.send(&DispatchPacket::new(0, 0)));
        assert!(dispatch_tx.send(&DispatchPacket::new(1, 0)));
        assert_eq!(run(&dispatch_rx, &result_tx, &registry(), &NameHarness), 1);
    }
}
