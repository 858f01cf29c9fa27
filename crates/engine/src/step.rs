//! Step contract.

use async_trait::async_trait;
use tracing::warn;

use bakery_types::StepOutcome;

use crate::{
    error::StepError,
    state::{ExecutionContext, keys},
};

/// A unit of forward work plus its compensating action.
///
/// The sequencer calls [`run`](Self::run) at most once per pipeline run and,
/// once the run is over, [`cleanup`](Self::cleanup) for every step whose
/// `run` was invoked, most recent first. Steps decide from
/// [`ExecutionContext::abort_reason`] and their own bookkeeping whether there
/// is anything to undo.
#[async_trait]
pub trait ProvisioningStep: Send {
    /// Short identifier used in logs and run reports.
    fn name(&self) -> &str;

    /// Performs the forward work. Failures are recorded under the context's
    /// `error` key and reported as [`StepOutcome::Halt`].
    async fn run(&mut self, ctx: &mut ExecutionContext) -> StepOutcome;

    /// Compensates for work done by `run`. Never fails: problems are reported
    /// to the UI and the log only.
    async fn cleanup(&mut self, ctx: &ExecutionContext);
}

/// Reports a fatal step error and records it in the context.
pub fn halt_with(ctx: &mut ExecutionContext, step: &str, error: StepError) -> StepOutcome {
    let message = error.to_string();
    warn!(step, error = %message, contract_violation = error.is_contract_violation(), "step halted");
    if let Some(ui) = ctx.get_optional(&keys::UI) {
        ui.error(&message);
    }
    ctx.record_error(error);
    StepOutcome::Halt
}
