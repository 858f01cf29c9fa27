//! Ordered step execution with reverse-order rollback.
//!
//! The sequencer is the only writer of the execution context: it lends the
//! context to one step at a time, checks for cancellation at every step
//! boundary, stops on the first halt, and then runs cleanup for every step
//! that started, most recent first.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use bakery_types::{AbortReason, StepOutcome, StepState};

use crate::{state::ExecutionContext, step::ProvisioningStep};

/// Final state of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub name: String,
    pub state: StepState,
}

/// Timestamped state transition recorded while running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepEvent {
    pub step: String,
    pub state: StepState,
    pub at: DateTime<Utc>,
}

/// Outcome of a pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub steps: Vec<StepReport>,
    pub abort_reason: AbortReason,
    /// Message of the error that halted the run, if any.
    pub error: Option<String>,
    pub events: Vec<StepEvent>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        !self.abort_reason.is_abort()
    }

    pub fn state_of(&self, step: &str) -> Option<StepState> {
        self.steps.iter().find(|report| report.name == step).map(|report| report.state)
    }
}

/// Runs provisioning steps in order.
#[derive(Default)]
pub struct Sequencer {
    steps: Vec<Box<dyn ProvisioningStep>>,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_step(mut self, step: impl ProvisioningStep + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    /// Runs every step against `ctx`, then cleans up.
    pub async fn run(&mut self, ctx: &mut ExecutionContext) -> RunReport {
        let mut states = vec![StepState::NotStarted; self.steps.len()];
        let mut events = Vec::new();
        let mut started = 0usize;

        for (index, step) in self.steps.iter_mut().enumerate() {
            if ctx.is_cancelled() {
                info!(step = %step.name(), "cancellation observed; not starting step");
                ctx.mark_cancelled();
                break;
            }

            info!(step = %step.name(), "step started");
            states[index] = StepState::Running;
            record(&mut events, step.name(), StepState::Running);
            started = index + 1;

            match step.run(ctx).await {
                StepOutcome::Continue => {
                    states[index] = StepState::Succeeded;
                    record(&mut events, step.name(), StepState::Succeeded);
                    info!(step = %step.name(), "step succeeded");
                }
                StepOutcome::Halt => {
                    states[index] = StepState::Failed;
                    record(&mut events, step.name(), StepState::Failed);
                    warn!(step = %step.name(), "step halted the run");
                    ctx.mark_halted();
                    if ctx.is_cancelled() {
                        ctx.mark_cancelled();
                    }
                    break;
                }
            }
        }

        let abort_reason = ctx.abort_reason();
        if abort_reason.is_abort() {
            warn!(?abort_reason, started, "run aborted; rolling back");
        }

        for index in (0..started).rev() {
            let step = &mut self.steps[index];
            step.cleanup(ctx).await;
            if abort_reason.is_abort() && states[index] == StepState::Succeeded {
                states[index] = StepState::RolledBack;
                record(&mut events, step.name(), StepState::RolledBack);
            }
        }

        RunReport {
            steps: self
                .steps
                .iter()
                .zip(states)
                .map(|(step, state)| StepReport {
                    name: step.name().to_string(),
                    state,
                })
                .collect(),
            abort_reason,
            error: ctx.error().map(ToString::to_string),
            events,
        }
    }
}

fn record(events: &mut Vec<StepEvent>, step: &str, state: StepState) {
    events.push(StepEvent {
        step: step.to_string(),
        state,
        at: Utc::now(),
    });
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::*;
    use crate::state::CancellationFlag;

    type Journal = Arc<Mutex<Vec<String>>>;

    /// Step that journals its calls and optionally halts or cancels the run.
    struct JournalStep {
        name: &'static str,
        outcome: StepOutcome,
        cancel: Option<CancellationFlag>,
        journal: Journal,
    }

    impl JournalStep {
        fn new(name: &'static str, journal: &Journal) -> Self {
            Self {
                name,
                outcome: StepOutcome::Continue,
                cancel: None,
                journal: Arc::clone(journal),
            }
        }

        fn halting(mut self) -> Self {
            self.outcome = StepOutcome::Halt;
            self
        }

        fn cancelling(mut self, flag: &CancellationFlag) -> Self {
            self.cancel = Some(flag.clone());
            self
        }
    }

    #[async_trait]
    impl ProvisioningStep for JournalStep {
        fn name(&self) -> &str {
            self.name
        }

        async fn run(&mut self, _ctx: &mut ExecutionContext) -> StepOutcome {
            self.journal.lock().unwrap().push(format!("run:{}", self.name));
            if let Some(flag) = &self.cancel {
                flag.cancel();
            }
            self.outcome
        }

        async fn cleanup(&mut self, ctx: &ExecutionContext) {
            self.journal
                .lock()
                .unwrap()
                .push(format!("cleanup:{}:{:?}", self.name, ctx.abort_reason()));
        }
    }

    fn journal() -> Journal {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn entries(journal: &Journal) -> Vec<String> {
        journal.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn successful_run_cleans_up_in_reverse_without_abort() {
        let journal = journal();
        let mut sequencer = Sequencer::new()
            .with_step(JournalStep::new("a", &journal))
            .with_step(JournalStep::new("b", &journal))
            .with_step(JournalStep::new("c", &journal));
        let mut ctx = ExecutionContext::new();

        let report = sequencer.run(&mut ctx).await;

        assert!(report.succeeded());
        assert_eq!(report.abort_reason, AbortReason::None);
        assert!(report.steps.iter().all(|step| step.state == StepState::Succeeded));
        assert_eq!(
            entries(&journal),
            vec!["run:a", "run:b", "run:c", "cleanup:c:None", "cleanup:b:None", "cleanup:a:None"]
        );
    }

    #[tokio::test]
    async fn halt_stops_the_run_and_rolls_back_in_reverse() {
        let journal = journal();
        let mut sequencer = Sequencer::new()
            .with_step(JournalStep::new("a", &journal))
            .with_step(JournalStep::new("b", &journal))
            .with_step(JournalStep::new("c", &journal).halting())
            .with_step(JournalStep::new("d", &journal));
        let mut ctx = ExecutionContext::new();

        let report = sequencer.run(&mut ctx).await;

        assert_eq!(report.abort_reason, AbortReason::Halted);
        assert_eq!(
            entries(&journal),
            vec![
                "run:a",
                "run:b",
                "run:c",
                "cleanup:c:Halted",
                "cleanup:b:Halted",
                "cleanup:a:Halted"
            ]
        );
        assert_eq!(report.state_of("a"), Some(StepState::RolledBack));
        assert_eq!(report.state_of("b"), Some(StepState::RolledBack));
        assert_eq!(report.state_of("c"), Some(StepState::Failed));
        assert_eq!(report.state_of("d"), Some(StepState::NotStarted));
    }

    #[tokio::test]
    async fn cancellation_is_observed_at_the_next_step_boundary() {
        let journal = journal();
        let flag = CancellationFlag::new();
        let mut sequencer = Sequencer::new()
            .with_step(JournalStep::new("a", &journal))
            .with_step(JournalStep::new("b", &journal).cancelling(&flag))
            .with_step(JournalStep::new("c", &journal));
        let mut ctx = ExecutionContext::with_cancellation(flag);

        let report = sequencer.run(&mut ctx).await;

        assert_eq!(report.abort_reason, AbortReason::Cancelled);
        assert_eq!(
            entries(&journal),
            vec!["run:a", "run:b", "cleanup:b:Cancelled", "cleanup:a:Cancelled"]
        );
        assert_eq!(report.state_of("c"), Some(StepState::NotStarted));
    }

    #[tokio::test]
    async fn cancelled_before_start_runs_nothing() {
        let journal = journal();
        let flag = CancellationFlag::new();
        flag.cancel();
        let mut sequencer = Sequencer::new().with_step(JournalStep::new("a", &journal));
        let mut ctx = ExecutionContext::with_cancellation(flag);

        let report = sequencer.run(&mut ctx).await;

        assert_eq!(report.abort_reason, AbortReason::Cancelled);
        assert!(entries(&journal).is_empty());
        assert!(report.events.is_empty());
    }

    #[tokio::test]
    async fn events_trace_each_transition() {
        let journal = journal();
        let mut sequencer = Sequencer::new()
            .with_step(JournalStep::new("a", &journal))
            .with_step(JournalStep::new("b", &journal).halting());
        let mut ctx = ExecutionContext::new();

        let report = sequencer.run(&mut ctx).await;

        let transitions: Vec<(String, StepState)> = report.events.iter().map(|event| (event.step.clone(), event.state)).collect();
        assert_eq!(
            transitions,
            vec![
                ("a".to_string(), StepState::Running),
                ("a".to_string(), StepState::Succeeded),
                ("b".to_string(), StepState::Running),
                ("b".to_string(), StepState::Failed),
                ("a".to_string(), StepState::RolledBack),
            ]
        );
    }
}
