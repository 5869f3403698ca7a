//! Coordinator behaviour against a hand-driven scheduler machine.

mod common;

use std::thread::JoinHandle;

use strads_coordinator::{Coordinator, CoordinatorError, RoundHandler};
use strads_core::StradsConfig;
use strads_wire::{link_pair, Endpoint, Envelope, Link, Message, PhaseMessage};

use common::CountingHandler;

fn config() -> StradsConfig {
    StradsConfig::from_toml(
        r#"
[scheduler]
modelsize = 20
maxset = 3

[cluster]
threads_per_scheduler = 2

[run]
iterations = 10
logfreq = 5
switch_iter = 5
"#,
    )
    .unwrap()
}

/// Consume a start or restart and its init chunks; returns the declared
/// task count.
fn take_start(link: &Link) -> u64 {
    let params = match link.recv().unwrap().message {
        Message::SchedStart { params, .. } | Message::SchedRestart { params, .. } => params,
        other => panic!("expected start, got {}", other.name()),
    };
    let mut received = 0;
    for _ in 0..params.chunks {
        match link.recv().unwrap().message {
            Message::InitVal { entries, .. } => received += entries.len() as u64,
            other => panic!("expected init chunk, got {}", other.name()),
        }
    }
    assert_eq!(received, params.taskcnt);
    params.taskcnt
}

fn ack(link: &Link, taskcnt: u64) {
    link.send(Envelope::new(Message::StartAck { mid: 0, taskcnt }))
        .unwrap();
}

fn phase(link: &Link, gid: i32, ids: Vec<u64>) {
    link.send(
        Envelope::new(Message::Phase(PhaseMessage {
            mid: 0,
            thrdgid: gid,
            task_ids: ids,
        }))
        .with_partition(gid as u64),
    )
    .unwrap();
}

fn expect_shutdown(link: &Link) {
    loop {
        match link.recv().unwrap().message {
            Message::Shutdown => return,
            Message::WeightUpdate { .. } => continue,
            other => panic!("expected shutdown, got {}", other.name()),
        }
    }
}

fn run_against(fake: impl FnOnce(Link) + Send + 'static) -> Result<(), CoordinatorError> {
    let (coord, machine) = link_pair(100, 0);
    let handle: JoinHandle<()> = std::thread::spawn(move || fake(machine));
    let mut coordinator = Coordinator::new(config(), vec![coord], CountingHandler::default())?;
    let result = coordinator.run().map(|_| ());
    handle.join().unwrap();
    result
}

#[test]
fn short_ack_is_rejected() {
    let err = run_against(|link| {
        let taskcnt = take_start(&link);
        ack(&link, taskcnt - 1);
        expect_shutdown(&link);
    })
    .unwrap_err();
    assert!(matches!(
        err,
        CoordinatorError::AckMismatch {
            mid: 0,
            declared: 20,
            acked: 19
        }
    ));
}

#[test]
fn phase_from_unknown_partition_is_fatal() {
    let err = run_against(|link| {
        ack(&link, take_start(&link));
        phase(&link, 0, vec![1, 2]);
        phase(&link, 1, vec![11, 12]);
        ack(&link, take_start(&link));
        phase(&link, 7, vec![1]);
        expect_shutdown(&link);
    })
    .unwrap_err();
    assert!(matches!(err, CoordinatorError::Protocol(_)), "{err}");
}

#[test]
fn phase_during_start_handshake_is_kept() {
    // The phase arrives before the restart ack; the coordinator must still
    // answer it once the round loop begins.
    let result = run_against(|link| {
        ack(&link, take_start(&link));
        phase(&link, 0, vec![1]);
        phase(&link, 1, vec![11]);
        take_start(&link);
        phase(&link, 0, vec![4, 5]);
        ack(&link, 20);
        match link.recv().unwrap().message {
            Message::WeightUpdate {
                thrdgid, entries, ..
            } => {
                assert_eq!(thrdgid, 0);
                assert_eq!(entries.len(), 2);
            }
            other => panic!("expected weight update, got {}", other.name()),
        }
        // Drop the link: the coordinator fails on the disconnect.
    });
    assert!(matches!(result, Err(CoordinatorError::Wire(_))));
}

struct ShortWeights;

impl RoundHandler for ShortWeights {
    type Partial = ();

    fn dispatch_scheduling(&mut self, _: &PhaseMessage) -> Result<(), CoordinatorError> {
        Ok(())
    }

    fn do_msgcombiner(&mut self, _: &PhaseMessage) -> Result<(), CoordinatorError> {
        Ok(())
    }

    fn do_aggregate(&mut self, _: &PhaseMessage, _: &()) -> Result<(), CoordinatorError> {
        Ok(())
    }

    fn update_weight(&mut self, _: &PhaseMessage, _: &()) -> Result<Vec<f64>, CoordinatorError> {
        Ok(vec![1.0])
    }

    fn objective(&mut self) -> Result<f64, CoordinatorError> {
        Ok(0.0)
    }

    fn set_initial_priority(&mut self, _: &mut [f64]) {}
}

#[test]
fn weight_count_must_match_phase() {
    let (coord, link) = link_pair(100, 0);
    let fake = std::thread::spawn(move || {
        ack(&link, take_start(&link));
        phase(&link, 0, vec![1]);
        phase(&link, 1, vec![11]);
        ack(&link, take_start(&link));
        phase(&link, 1, vec![11, 12]);
        expect_shutdown(&link);
    });
    let mut coordinator = Coordinator::new(config(), vec![coord], ShortWeights).unwrap();
    let err = coordinator.run().unwrap_err();
    fake.join().unwrap();
    assert!(matches!(err, CoordinatorError::Handler(_)), "{err}");
}
