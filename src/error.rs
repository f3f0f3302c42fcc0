use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::anthropic::AnthropicError;
use crate::platform::PlatformId;

#[derive(Debug, Error)]
pub enum AutoApplyError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("No enabled platforms. Enable at least one platform in autoapply.toml.")]
    NoPlatforms,

    #[error("Platform not active: {0}")]
    InactivePlatform(PlatformId),

    #[error("Scheduler is shutting down")]
    SchedulerClosed,

    #[error("Anthropic API error: {0}")]
    Anthropic(#[from] AnthropicError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Classifies an application failure for retry and escalation decisions.
///
/// Every collaborator error maps into exactly one class; the state machine
/// only ever reasons about classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Credentials were refused by the platform.
    LoginFailure,
    /// A captcha blocks login; needs manual resolution.
    CaptchaRequired,
    /// The platform served a challenge, block page or verification redirect.
    DetectionSuspected,
    /// Timeouts, connection resets, 5xx responses.
    NetworkTransient,
    /// The page or form no longer matches what the adapter expects.
    FormStructureChanged,
    /// The platform declined the application (already applied, closed posting).
    SubmissionRejected,
    /// The content gateway could not produce materials.
    ContentGenerationFailure,
    /// A daily submission cap was reached.
    QuotaExceeded,
    /// The run was stopped while the task was in flight.
    Cancelled,
    /// The task outlived its lifetime budget.
    TimedOut,
}

impl ErrorClass {
    /// Retryable classes are contained by the state machine up to the attempt cap.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorClass::NetworkTransient | ErrorClass::ContentGenerationFailure
        )
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorClass::LoginFailure => "LoginFailure",
            ErrorClass::CaptchaRequired => "CaptchaRequired",
            ErrorClass::DetectionSuspected => "DetectionSuspected",
            ErrorClass::NetworkTransient => "NetworkTransient",
            ErrorClass::FormStructureChanged => "FormStructureChanged",
            ErrorClass::SubmissionRejected => "SubmissionRejected",
            ErrorClass::ContentGenerationFailure => "ContentGenerationFailure",
            ErrorClass::QuotaExceeded => "QuotaExceeded",
            ErrorClass::Cancelled => "Cancelled",
            ErrorClass::TimedOut => "TimedOut",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_network_and_content_failures_retry() {
        assert!(ErrorClass::NetworkTransient.is_retryable());
        assert!(ErrorClass::ContentGenerationFailure.is_retryable());
        assert!(!ErrorClass::FormStructureChanged.is_retryable());
        assert!(!ErrorClass::SubmissionRejected.is_retryable());
        assert!(!ErrorClass::DetectionSuspected.is_retryable());
        assert!(!ErrorClass::QuotaExceeded.is_retryable());
    }

    #[test]
    fn error_class_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorClass::FormStructureChanged).unwrap();
        assert_eq!(json, r#""form_structure_changed""#);
        assert_eq!(ErrorClass::FormStructureChanged.to_string(), "FormStructureChanged");
    }

    #[test]
    fn inactive_platform_display() {
        let err = AutoApplyError::InactivePlatform(PlatformId::new("board"));
        assert_eq!(err.to_string(), "Platform not active: board");
    }
}
