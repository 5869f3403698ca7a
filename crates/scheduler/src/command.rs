use strads_core::TaskId;
use strads_wire::IdVal;

/// Commands delivered to a scheduler thread's inbound queue.
#[derive(Debug, Clone, PartialEq)]
pub enum SamplingCommand {
    /// Seed every weight of the partition and produce the first phase.
    InitWeightUpdate(Vec<IdVal>),
    /// Re-seed every weight after a coordinator restart.
    RestartWeightUpdate(Vec<IdVal>),
    /// New weights for exactly the ids of the previous phase.
    WeightUpdate(Vec<IdVal>),
    /// Override the base weight and stop auto-tuning it.
    BwChange(f64),
    Shutdown,
}

impl SamplingCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::InitWeightUpdate(_) => "init_weight_update",
            Self::RestartWeightUpdate(_) => "restart_weight_update",
            Self::WeightUpdate(_) => "weight_update",
            Self::BwChange(_) => "bw_change",
            Self::Shutdown => "shutdown",
        }
    }
}

/// A finished round on one partition, waiting to be forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MakePhase {
    pub gid: usize,
    pub task_ids: Vec<TaskId>,
}
