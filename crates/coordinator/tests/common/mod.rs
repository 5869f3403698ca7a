//! In-process cluster used by the coordinator integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use strads_coordinator::{CoordinatorError, RoundHandler};
use strads_core::{StradsConfig, TaskId};
use strads_scheduler::{MachineContext, SchedError, SchedulerMachine, SchedulerStats};
use strads_wire::{link_pair, Endpoint, Envelope, Link, Message, PhaseMessage, WireError};

pub const COORD_RANK: i32 = 100;

pub type MachineHandle = JoinHandle<Result<SchedulerStats, SchedError>>;

/// Spawn one scheduler machine per configured scheduler node and return the
/// coordinator side of every link.
pub fn spawn_cluster(config: &StradsConfig) -> (Vec<Link>, Vec<MachineHandle>) {
    let mut links = Vec::new();
    let mut handles = Vec::new();
    for mid in 0..config.cluster.scheduler_machines {
        let ctx = Arc::new(
            MachineContext::from_cluster(mid, &config.cluster, config.scheduler.clone()).unwrap(),
        );
        let (coord, link) = link_pair(COORD_RANK, mid as i32);
        let machine = SchedulerMachine::new(ctx, link).unwrap();
        links.push(coord);
        handles.push(std::thread::spawn(move || machine.run()));
    }
    (links, handles)
}

pub fn join_all(handles: Vec<MachineHandle>) -> SchedulerStats {
    let mut total = SchedulerStats::default();
    for h in handles {
        let stats = h.join().unwrap().unwrap();
        total.merge(&stats);
    }
    total
}

// ── Handler ─────────────────────────────────────────────────────────

/// Handler whose weights depend only on the task id and whose objective
/// shrinks with every aggregated phase.
#[derive(Debug, Default)]
pub struct CountingHandler {
    pub dispatched: u64,
    pub aggregated: u64,
    pub tasks_seen: u64,
    pub logged: bool,
}

pub fn weight_of(id: TaskId) -> f64 {
    1.0 + (id % 3) as f64
}

impl RoundHandler for CountingHandler {
    type Partial = usize;

    fn dispatch_scheduling(&mut self, _phase: &PhaseMessage) -> Result<(), CoordinatorError> {
        self.dispatched += 1;
        Ok(())
    }

    fn do_msgcombiner(&mut self, phase: &PhaseMessage) -> Result<usize, CoordinatorError> {
        Ok(phase.task_ids.len())
    }

    fn do_aggregate(&mut self, _phase: &PhaseMessage, partial: &usize) -> Result<(), CoordinatorError> {
        self.aggregated += 1;
        self.tasks_seen += *partial as u64;
        Ok(())
    }

    fn update_weight(
        &mut self,
        phase: &PhaseMessage,
        _partial: &usize,
    ) -> Result<Vec<f64>, CoordinatorError> {
        Ok(phase.task_ids.iter().map(|id| weight_of(*id)).collect())
    }

    fn objective(&mut self) -> Result<f64, CoordinatorError> {
        Ok(1.0 / (1.0 + self.aggregated as f64))
    }

    fn set_initial_priority(&mut self, weights: &mut [f64]) {
        for (id, w) in weights.iter_mut().enumerate() {
            *w = weight_of(id as TaskId);
        }
    }

    fn log_parameters(&mut self) -> Result<(), CoordinatorError> {
        self.logged = true;
        Ok(())
    }
}

// ── Recording endpoint ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Phase { gid: i32, ids: Vec<TaskId> },
    Update { gid: i32, ids: Vec<TaskId>, values: Vec<f64> },
    Restart,
}

/// Link wrapper that records phases received and weight updates sent.
pub struct Recording {
    inner: Link,
    events: Arc<Mutex<Vec<Event>>>,
}

impl Recording {
    pub fn new(inner: Link, events: Arc<Mutex<Vec<Event>>>) -> Self {
        Self { inner, events }
    }

    fn observe(&self, env: &Envelope) {
        let event = match &env.message {
            Message::Phase(p) => Event::Phase {
                gid: p.thrdgid,
                ids: p.task_ids.clone(),
            },
            Message::WeightUpdate {
                thrdgid, entries, ..
            } => Event::Update {
                gid: *thrdgid,
                ids: entries.iter().map(|e| e.id).collect(),
                values: entries.iter().map(|e| e.value).collect(),
            },
            Message::SchedRestart { .. } => Event::Restart,
            _ => return,
        };
        self.events.lock().unwrap().push(event);
    }
}

impl Endpoint for Recording {
    fn local_rank(&self) -> i32 {
        self.inner.local_rank()
    }

    fn peer_rank(&self) -> i32 {
        self.inner.peer_rank()
    }

    fn send(&self, envelope: Envelope) -> Result<(), WireError> {
        self.observe(&envelope);
        self.inner.send(envelope)
    }

    fn recv(&self) -> Result<Envelope, WireError> {
        let env = self.inner.recv()?;
        self.observe(&env);
        Ok(env)
    }

    fn try_recv(&self) -> Result<Option<Envelope>, WireError> {
        let env = self.inner.try_recv()?;
        if let Some(env) = &env {
            self.observe(env);
        }
        Ok(env)
    }
}
