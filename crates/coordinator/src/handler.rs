use strads_wire::PhaseMessage;

use crate::error::CoordinatorError;

/// Application hooks called by the coordinator for every phase.
///
/// For one phase the coordinator calls, in order, `dispatch_scheduling`,
/// `do_msgcombiner`, `do_aggregate` and `update_weight`. The weights
/// returned by `update_weight` are aligned with `phase.task_ids` and go back
/// to the partition that produced the phase.
pub trait RoundHandler {
    /// Combined worker results for one phase.
    type Partial;

    /// Hand the phase's tasks to the workers.
    fn dispatch_scheduling(&mut self, phase: &PhaseMessage) -> Result<(), CoordinatorError>;

    /// Collect and combine the workers' results for the phase.
    fn do_msgcombiner(&mut self, phase: &PhaseMessage) -> Result<Self::Partial, CoordinatorError>;

    /// Fold the combined results into the model.
    fn do_aggregate(
        &mut self,
        phase: &PhaseMessage,
        partial: &Self::Partial,
    ) -> Result<(), CoordinatorError>;

    /// New weight for every task of the phase.
    fn update_weight(
        &mut self,
        phase: &PhaseMessage,
        partial: &Self::Partial,
    ) -> Result<Vec<f64>, CoordinatorError>;

    /// Current objective value.
    fn objective(&mut self) -> Result<f64, CoordinatorError>;

    /// Fill the weights used for the post-warm-up restart. `weights` is
    /// zeroed and indexed by task id.
    fn set_initial_priority(&mut self, weights: &mut [f64]);

    /// Persist or print the final parameters.
    fn log_parameters(&mut self) -> Result<(), CoordinatorError> {
        Ok(())
    }
}
