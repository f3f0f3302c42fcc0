//! Content gateway backed by the Anthropic Messages API.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{Answer, CandidateProfile, ContentGateway, Document, DocumentKind, GatewayError};
use crate::anthropic::{AnthropicClient, AnthropicError};
use crate::platform::{JobDetail, Question};

const SYSTEM_PROMPT: &str = "You write concise, truthful job application material. \
Use only facts from the candidate profile. Reply with the requested text only.";

const DOCUMENT_MAX_TOKENS: u32 = 2048;
const ANSWER_MAX_TOKENS: u32 = 512;

pub struct LlmContentGateway {
    client: AnthropicClient,
}

impl LlmContentGateway {
    pub fn new(client: AnthropicClient) -> Self {
        Self { client }
    }

    async fn ask(&self, prompt: String, max_tokens: u32) -> Result<String, GatewayError> {
        debug!(model = self.client.model(), max_tokens, "requesting completion");
        self.client
            .complete(SYSTEM_PROMPT, prompt, max_tokens)
            .await
            .map_err(GatewayError::from)
    }
}

impl From<AnthropicError> for GatewayError {
    fn from(err: AnthropicError) -> Self {
        match err {
            AnthropicError::RateLimited { retry_after_ms } => GatewayError::RateLimited {
                retry_after: Some(Duration::from_millis(retry_after_ms)),
            },
            AnthropicError::Timeout => GatewayError::Timeout,
            other => GatewayError::ProviderError(other.to_string()),
        }
    }
}

fn describe(profile: &CandidateProfile, detail: &JobDetail) -> String {
    format!(
        "Candidate: {} ({})\nSummary: {}\nSkills: {}\nYears of experience: {}\n\n\
         Job: {} at {} ({})\nDescription:\n{}",
        profile.name,
        profile.headline,
        profile.summary,
        profile.skills.join(", "),
        profile.years_experience,
        detail.listing.title,
        detail.listing.company,
        detail.listing.location,
        detail.description
    )
}

#[async_trait]
impl ContentGateway for LlmContentGateway {
    async fn generate_resume(
        &self,
        profile: &CandidateProfile,
        detail: &JobDetail,
    ) -> Result<Document, GatewayError> {
        let prompt = format!(
            "{}\n\nBase resume:\n{}\n\nRewrite the resume to emphasise what this job asks for.",
            describe(profile, detail),
            profile.resume
        );
        let body = self.ask(prompt, DOCUMENT_MAX_TOKENS).await?;
        Ok(Document {
            kind: DocumentKind::Resume,
            body,
        })
    }

    async fn generate_cover_letter(
        &self,
        profile: &CandidateProfile,
        detail: &JobDetail,
    ) -> Result<Document, GatewayError> {
        let prompt = format!(
            "{}\n\nWrite a cover letter of at most three short paragraphs.",
            describe(profile, detail)
        );
        let body = self.ask(prompt, DOCUMENT_MAX_TOKENS).await?;
        Ok(Document {
            kind: DocumentKind::CoverLetter,
            body,
        })
    }

    async fn answer_question(
        &self,
        question: &Question,
        profile: &CandidateProfile,
        detail: &JobDetail,
    ) -> Result<Answer, GatewayError> {
        let prompt = format!(
            "{}\n\nAnswer this application question in one or two sentences:\n{}",
            describe(profile, detail),
            question.prompt
        );
        let text = self.ask(prompt, ANSWER_MAX_TOKENS).await?;
        Ok(Answer {
            question_id: question.id.clone(),
            text,
        })
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::platform::JobListing;

    fn detail() -> JobDetail {
        JobDetail {
            listing: JobListing::new("board", "1", "Rust Engineer", "Acme", "Remote"),
            description: "tokio services".into(),
            questions: Vec::new(),
            form_version: None,
        }
    }

    async fn gateway(server: &MockServer, timeout: Duration) -> LlmContentGateway {
        let client = AnthropicClient::with_base_url(
            "test-key".into(),
            "claude-sonnet-4-5".into(),
            format!("{}/v1/messages", server.uri()),
            timeout,
        )
        .unwrap();
        LlmContentGateway::new(client)
    }

    #[tokio::test]
    async fn cover_letter_from_completion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "msg_1",
                "content": [{"type": "text", "text": "Dear Acme team"}],
                "model": "claude-sonnet-4-5",
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 10, "output_tokens": 4}
            })))
            .mount(&server)
            .await;

        let gw = gateway(&server, Duration::from_secs(5)).await;
        let doc = gw
            .generate_cover_letter(&CandidateProfile::default(), &detail())
            .await
            .unwrap();
        assert_eq!(doc.kind, DocumentKind::CoverLetter);
        assert_eq!(doc.body, "Dear Acme team");
    }

    #[tokio::test]
    async fn rate_limit_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
            .mount(&server)
            .await;

        let gw = gateway(&server, Duration::from_secs(5)).await;
        let err = gw
            .generate_resume(&CandidateProfile::default(), &detail())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            GatewayError::RateLimited {
                retry_after: Some(Duration::from_secs(7))
            }
        );
    }

    #[tokio::test]
    async fn slow_provider_is_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let gw = gateway(&server, Duration::from_millis(200)).await;
        let err = gw
            .generate_resume(&CandidateProfile::default(), &detail())
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::Timeout);
    }

    #[tokio::test]
    async fn server_error_is_provider_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let gw = gateway(&server, Duration::from_secs(5)).await;
        let err = gw
            .answer_question(
                &Question {
                    id: "q".into(),
                    prompt: "Why?".into(),
                    field: Default::default(),
                },
                &CandidateProfile::default(),
                &detail(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ProviderError(msg) if msg.contains("500")));
    }
}
