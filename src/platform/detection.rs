//! Challenge-signature classification shared by HTTP adapters.

use reqwest::StatusCode;

use super::AdapterError;

const CAPTCHA_MARKERS: &[&str] = &[
    "captcha",
    "recaptcha",
    "hcaptcha",
    "are you a robot",
    "security check",
];

const BLOCK_MARKERS: &[&str] = &[
    "too many requests",
    "temporarily blocked",
    "access denied",
    "suspicious activity",
    "unusual traffic",
];

const VERIFICATION_PATHS: &[&str] = &["/verify", "/challenge", "/checkpoint"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Challenge {
    Clear,
    Captcha,
    Blocked,
}

/// Where the response was received, which decides how a captcha is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Login,
    Browse,
}

/// Classify a response from its status, final URL path and body text.
pub fn classify(status: StatusCode, final_path: &str, body: &str) -> Challenge {
    let path = final_path.to_ascii_lowercase();
    if VERIFICATION_PATHS.iter().any(|p| path.contains(p)) {
        return Challenge::Blocked;
    }
    let text = body.to_ascii_lowercase();
    if CAPTCHA_MARKERS.iter().any(|m| text.contains(m)) {
        return Challenge::Captcha;
    }
    let blocked_text = BLOCK_MARKERS.iter().any(|m| text.contains(m));
    let forbidden = status == StatusCode::FORBIDDEN && blocked_text;
    if status == StatusCode::TOO_MANY_REQUESTS || forbidden {
        return Challenge::Blocked;
    }
    if blocked_text && !status.is_success() {
        return Challenge::Blocked;
    }
    Challenge::Clear
}

impl Challenge {
    pub fn into_error(self, phase: Phase) -> Option<AdapterError> {
        match (self, phase) {
            (Challenge::Clear, _) => None,
            (Challenge::Captcha, Phase::Login) => Some(AdapterError::CaptchaRequired(
                "captcha served at login".into(),
            )),
            (Challenge::Captcha, Phase::Browse) => Some(AdapterError::DetectionSuspected(
                "captcha challenge".into(),
            )),
            (Challenge::Blocked, _) => Some(AdapterError::DetectionSuspected(
                "block page or verification redirect".into(),
            )),
        }
    }
}
