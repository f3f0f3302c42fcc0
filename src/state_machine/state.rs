use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::task::{ApplicationTask, Severity};
use crate::error::ErrorClass;

/// Lifecycle of one application.
///
/// DISCOVERED → QUEUED → AUTHENTICATING → MATCHING → CUSTOMIZING → SUBMITTING
/// → SUCCEEDED | SKIPPED | FAILED
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppState {
    Discovered,
    Queued,
    Authenticating,
    Matching,
    Customizing,
    Submitting,
    Succeeded,
    Skipped,
    Failed(Severity),
}

impl AppState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AppState::Succeeded | AppState::Skipped | AppState::Failed(Severity::Fatal)
        )
    }
}

impl fmt::Display for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppState::Discovered => write!(f, "DISCOVERED"),
            AppState::Queued => write!(f, "QUEUED"),
            AppState::Authenticating => write!(f, "AUTHENTICATING"),
            AppState::Matching => write!(f, "MATCHING"),
            AppState::Customizing => write!(f, "CUSTOMIZING"),
            AppState::Submitting => write!(f, "SUBMITTING"),
            AppState::Succeeded => write!(f, "SUCCEEDED"),
            AppState::Skipped => write!(f, "SKIPPED"),
            AppState::Failed(Severity::Retryable) => write!(f, "FAILED(RETRYABLE)"),
            AppState::Failed(Severity::Fatal) => write!(f, "FAILED(FATAL)"),
        }
    }
}

/// What executing the current state's step produced.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Done,
    /// Matching scored the job below the threshold.
    BelowThreshold { score: f64 },
    Failed {
        class: ErrorClass,
        /// Minimum wait before the next try, when the collaborator named one.
        hint: Option<Duration>,
    },
    /// The bound session ran out of requests before the step could start.
    SessionExhausted,
    /// Stop signal or task deadline observed between steps.
    Interrupted(ErrorClass),
}

impl StepOutcome {
    pub fn failed(class: ErrorClass) -> Self {
        StepOutcome::Failed { class, hint: None }
    }
}

/// The result of evaluating a state transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Advance to the next state.
    Next(AppState),
    /// Retryable failure; the task waits out a backoff and is dispatched again.
    Retry {
        class: ErrorClass,
        attempt: u32,
        hint: Option<Duration>,
    },
    /// Detection: the session is torn down and the task waits for the
    /// platform's cool-down.
    CoolDown,
    /// Back to the queue without penalty (quota reached, session exhausted).
    Defer {
        class: Option<ErrorClass>,
        hint: Option<Duration>,
    },
    /// Needs manual resolution; the task leaves the dispatch queue.
    Park { class: ErrorClass },
    /// Terminal transition.
    Complete {
        state: AppState,
        class: Option<ErrorClass>,
    },
}

impl Transition {
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            Transition::Retry { class, .. } | Transition::Park { class } => Some(*class),
            Transition::CoolDown => Some(ErrorClass::DetectionSuspected),
            Transition::Defer { class, .. } | Transition::Complete { class, .. } => *class,
            Transition::Next(_) => None,
        }
    }
}

/// Drives an `ApplicationTask` through the lifecycle. Pure: no I/O, no clock.
pub struct StateMachine;

impl StateMachine {
    /// Compute and apply the next transition for `task` given the outcome of
    /// its current step.
    ///
    /// - Success walks the happy path; `Submitting` success completes the task.
    /// - Retryable classes retry until `max_retries` is exceeded, then fail.
    /// - Detection cools down until `max_detections` is exceeded, then fails.
    /// - Captcha parks, quota defers, everything else is fatal.
    pub fn next(task: &mut ApplicationTask, outcome: StepOutcome) -> Transition {
        if task.state.is_terminal() {
            return Transition::Complete {
                state: task.state,
                class: task.last_error,
            };
        }

        let transition = match outcome {
            StepOutcome::Done => match task.state {
                AppState::Discovered => Transition::Next(AppState::Queued),
                AppState::Queued | AppState::Failed(Severity::Retryable) => {
                    Transition::Next(AppState::Authenticating)
                }
                AppState::Authenticating => Transition::Next(AppState::Matching),
                AppState::Matching => Transition::Next(AppState::Customizing),
                AppState::Customizing => Transition::Next(AppState::Submitting),
                AppState::Submitting => Transition::Complete {
                    state: AppState::Succeeded,
                    class: None,
                },
                // Terminal states returned above.
                AppState::Succeeded | AppState::Skipped | AppState::Failed(Severity::Fatal) => {
                    Transition::Complete {
                        state: task.state,
                        class: None,
                    }
                }
            },
            StepOutcome::BelowThreshold { .. } => Transition::Complete {
                state: AppState::Skipped,
                class: None,
            },
            StepOutcome::Failed { class, hint } => Self::handle_failure(task, class, hint),
            StepOutcome::SessionExhausted => Transition::Defer {
                class: None,
                hint: None,
            },
            StepOutcome::Interrupted(class) => Self::fatal(class),
        };

        // Apply the transition to the task.
        match &transition {
            Transition::Next(next) => {
                if *next == AppState::Authenticating {
                    task.attempts += 1;
                }
                task.enter(*next);
            }
            Transition::Retry { class, .. } => {
                task.last_error = Some(*class);
                task.enter(AppState::Failed(Severity::Retryable));
            }
            Transition::CoolDown => {
                task.last_error = Some(ErrorClass::DetectionSuspected);
                task.enter(AppState::Queued);
            }
            Transition::Defer { class, .. } => {
                // A deferred dispatch does not count against the task.
                task.attempts = task.attempts.saturating_sub(1);
                if let Some(class) = class {
                    task.last_error = Some(*class);
                }
                task.enter(AppState::Queued);
            }
            Transition::Park { class } => {
                task.last_error = Some(*class);
                task.enter(AppState::Queued);
            }
            Transition::Complete { state, class } => {
                if class.is_some() {
                    task.last_error = *class;
                }
                task.enter(*state);
            }
        }

        transition
    }

    fn handle_failure(
        task: &mut ApplicationTask,
        class: ErrorClass,
        hint: Option<Duration>,
    ) -> Transition {
        match class {
            ErrorClass::DetectionSuspected => {
                task.detections += 1;
                if task.detections > task.limits.max_detections {
                    Self::fatal(class)
                } else {
                    Transition::CoolDown
                }
            }
            ErrorClass::CaptchaRequired => Transition::Park { class },
            ErrorClass::QuotaExceeded => Transition::Defer {
                class: Some(class),
                hint,
            },
            c if c.is_retryable() => {
                task.retry_count += 1;
                if task.retry_count <= task.limits.max_retries {
                    Transition::Retry {
                        class,
                        attempt: task.retry_count,
                        hint,
                    }
                } else {
                    Self::fatal(class)
                }
            }
            _ => Self::fatal(class),
        }
    }

    fn fatal(class: ErrorClass) -> Transition {
        Transition::Complete {
            state: AppState::Failed(Severity::Fatal),
            class: Some(class),
        }
    }
}
