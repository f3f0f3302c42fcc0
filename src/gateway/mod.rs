//! Content generation boundary.
//!
//! The orchestrator never decides what goes into an application; it asks a
//! [`ContentGateway`] for a resume, a cover letter and one answer per
//! screening question, then hands the bundle to the adapter.

pub mod llm;
pub mod template;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::platform::{JobDetail, Question};

pub use llm::LlmContentGateway;
pub use template::TemplateGateway;

/// The candidate the materials are written for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateProfile {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub headline: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub years_experience: u32,
    /// Base resume text the tailored version starts from.
    #[serde(default)]
    pub resume: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Resume,
    CoverLetter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub kind: DocumentKind,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub question_id: String,
    pub text: String,
}

/// Everything submitted alongside an application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Materials {
    pub resume: Option<Document>,
    pub cover_letter: Option<Document>,
    #[serde(default)]
    pub answers: Vec<Answer>,
}

impl Materials {
    pub fn answer_for(&self, question_id: &str) -> Option<&Answer> {
        self.answers.iter().find(|a| a.question_id == question_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("content provider error: {0}")]
    ProviderError(String),

    #[error("content provider rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("content provider timed out")]
    Timeout,
}

impl GatewayError {
    /// Minimum wait the provider asked for, if any.
    pub fn retry_hint(&self) -> Option<Duration> {
        match self {
            GatewayError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

#[async_trait]
pub trait ContentGateway: Send + Sync {
    async fn generate_resume(
        &self,
        profile: &CandidateProfile,
        detail: &JobDetail,
    ) -> Result<Document, GatewayError>;

    async fn generate_cover_letter(
        &self,
        profile: &CandidateProfile,
        detail: &JobDetail,
    ) -> Result<Document, GatewayError>;

    async fn answer_question(
        &self,
        question: &Question,
        profile: &CandidateProfile,
        detail: &JobDetail,
    ) -> Result<Answer, GatewayError>;
}

/// Request every piece of material for one application. Stops at the first
/// failure; nothing partial is returned.
pub async fn prepare_materials(
    gateway: &dyn ContentGateway,
    profile: &CandidateProfile,
    detail: &JobDetail,
) -> Result<Materials, GatewayError> {
    let resume = gateway.generate_resume(profile, detail).await?;
    let cover_letter = gateway.generate_cover_letter(profile, detail).await?;
    let mut answers = Vec::with_capacity(detail.questions.len());
    for question in &detail.questions {
        answers.push(gateway.answer_question(question, profile, detail).await?);
    }
    Ok(Materials {
        resume: Some(resume),
        cover_letter: Some(cover_letter),
        answers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::JobListing;

    fn detail() -> JobDetail {
        JobDetail {
            listing: JobListing::new("board", "1", "Rust Engineer", "Acme", "Remote"),
            description: "Build things in Rust".into(),
            questions: vec![
                Question {
                    id: "q1".into(),
                    prompt: "Years of Rust?".into(),
                    field: Default::default(),
                },
                Question {
                    id: "q2".into(),
                    prompt: "Salary expectation?".into(),
                    field: Default::default(),
                },
            ],
            form_version: None,
        }
    }

    #[tokio::test]
    async fn prepare_materials_answers_every_question() {
        let gateway = TemplateGateway::new();
        let materials = prepare_materials(&gateway, &CandidateProfile::default(), &detail())
            .await
            .unwrap();
        assert!(materials.resume.is_some());
        assert!(materials.cover_letter.is_some());
        assert_eq!(materials.answers.len(), 2);
        assert!(materials.answer_for("q2").is_some());
    }

    #[tokio::test]
    async fn prepare_materials_stops_at_first_failure() {
        let gateway = TemplateGateway::new();
        gateway.fail_next(GatewayError::Timeout);
        let err = prepare_materials(&gateway, &CandidateProfile::default(), &detail())
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::Timeout);
        assert_eq!(gateway.calls(), 1);
    }

    #[test]
    fn retry_hint_only_for_rate_limits() {
        let limited = GatewayError::RateLimited {
            retry_after: Some(Duration::from_secs(3)),
        };
        assert_eq!(limited.retry_hint(), Some(Duration::from_secs(3)));
        assert_eq!(GatewayError::Timeout.retry_hint(), None);
    }
}
