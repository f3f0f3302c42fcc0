mod state;
mod task;

pub use state::{AppState, StateMachine, StepOutcome, Transition};
pub use task::{ApplicationTask, FinalState, OutcomeRecord, RetryConfig, Severity, TaskLimits};
