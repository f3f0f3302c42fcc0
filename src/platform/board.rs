//! Reference adapter for a JSON job-board API.
//!
//! Talks to four endpoints through the session's browsing context:
//!
//! | Operation      | Request                                 |
//! |----------------|-----------------------------------------|
//! | authenticate   | `POST /api/session`                     |
//! | search_page    | `GET /api/jobs?q=..&location=..&cursor=`|
//! | fetch_detail   | `GET /api/jobs/{id}`                    |
//! | submit         | `POST /api/jobs/{id}/applications`      |
//!
//! Every response goes through the challenge classifier before its status is
//! interpreted, so a block page is never mistaken for an ordinary error.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::detection::{Phase, classify};
use super::{
    AdapterError, Credentials, JobDetail, JobListing, PlatformAdapter, PlatformId, Question,
    SearchCriteria, SearchCursor, SearchPage, SubmissionReceipt,
};
use crate::behavior::{ActionKind, FieldKind};
use crate::gateway::{Answer, Materials};
use crate::session::Session;

/// Application form versions this adapter knows how to fill in.
const SUPPORTED_FORM_VERSIONS: &[&str] = &["v1", "v2"];

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct WireListing {
    id: String,
    title: String,
    company: String,
    #[serde(default)]
    location: String,
    #[serde(default)]
    posted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct WirePage {
    jobs: Vec<WireListing>,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireQuestion {
    id: String,
    prompt: String,
    #[serde(default)]
    field: FieldKind,
}

#[derive(Debug, Deserialize)]
struct WireDetail {
    description: String,
    #[serde(default)]
    questions: Vec<WireQuestion>,
    form_version: String,
}

#[derive(Debug, Serialize)]
struct ApplicationRequest<'a> {
    form_version: Option<&'a str>,
    resume: Option<&'a str>,
    cover_letter: Option<&'a str>,
    answers: &'a [Answer],
}

#[derive(Debug, Deserialize)]
struct ApplicationResponse {
    #[serde(default)]
    confirmation: Option<String>,
}

pub struct BoardAdapter {
    platform: PlatformId,
    base_url: String,
}

impl BoardAdapter {
    pub fn new(platform: impl Into<PlatformId>, base_url: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn listing(&self, wire: WireListing) -> JobListing {
        let mut listing = JobListing::new(
            self.platform.clone(),
            wire.id,
            wire.title,
            wire.company,
            wire.location,
        );
        listing.posted_at = wire.posted_at;
        listing.detail_url = self.url(&format!("/api/jobs/{}", listing.job_id));
        listing
    }
}

/// Read a response body after checking it for challenge signatures.
///
/// JSON bodies of successful responses are exempt from marker matching; job
/// descriptions routinely mention things like "security check".
async fn inspect(
    response: reqwest::Response,
    phase: Phase,
) -> Result<(StatusCode, String), AdapterError> {
    let status = response.status();
    let final_path = response.url().path().to_string();
    let is_json = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("json"));
    let body = response.text().await?;

    let scanned = if is_json && status.is_success() { "" } else { body.as_str() };
    if let Some(err) = classify(status, &final_path, scanned).into_error(phase) {
        return Err(err);
    }
    if status.is_server_error() {
        return Err(AdapterError::NetworkTransient(format!("server returned {status}")));
    }
    Ok((status, body))
}

fn decode<T: for<'de> Deserialize<'de>>(body: &str) -> Result<T, AdapterError> {
    serde_json::from_str(body).map_err(|e| AdapterError::FormStructureChanged(e.to_string()))
}

fn unexpected(status: StatusCode) -> AdapterError {
    AdapterError::FormStructureChanged(format!("unexpected status {status}"))
}

#[async_trait]
impl PlatformAdapter for BoardAdapter {
    fn platform(&self) -> &PlatformId {
        &self.platform
    }

    async fn authenticate(
        &self,
        credentials: &Credentials,
        session: &mut Session,
    ) -> Result<(), AdapterError> {
        session.pace(ActionKind::Navigate).await;
        session
            .pace(ActionKind::Type {
                chars: credentials.username.len(),
                field: FieldKind::Email,
            })
            .await;
        session.pace(ActionKind::Click).await;

        let response = session
            .http()
            .post(self.url("/api/session"))
            .json(&LoginRequest {
                username: &credentials.username,
                password: &credentials.password,
            })
            .send()
            .await?;
        let (status, _) = inspect(response, Phase::Login).await?;
        match status {
            s if s.is_success() => {
                session.mark_authenticated();
                debug!(platform = %self.platform, session = %session.id(), "logged in");
                Ok(())
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(AdapterError::LoginFailure(
                format!("credentials for {} rejected", credentials.username),
            )),
            other => Err(unexpected(other)),
        }
    }

    async fn search_page(
        &self,
        criteria: &SearchCriteria,
        cursor: Option<&SearchCursor>,
        session: &mut Session,
    ) -> Result<SearchPage, AdapterError> {
        session.pace(ActionKind::Navigate).await;
        let mut query = vec![
            ("q", criteria.keywords.as_str()),
            ("location", criteria.location.as_str()),
        ];
        if let Some(SearchCursor(c)) = cursor {
            query.push(("cursor", c.as_str()));
        }
        let response = session
            .http()
            .get(self.url("/api/jobs"))
            .query(&query)
            .send()
            .await?;
        let (status, body) = inspect(response, Phase::Browse).await?;
        if !status.is_success() {
            return Err(unexpected(status));
        }
        let page: WirePage = decode(&body)?;
        session
            .pace(ActionKind::Scroll {
                distance_px: 400 * page.jobs.len().max(1) as u32,
            })
            .await;
        Ok(SearchPage {
            listings: page.jobs.into_iter().map(|w| self.listing(w)).collect(),
            next_cursor: page.next_cursor.map(SearchCursor),
        })
    }

    async fn fetch_detail(
        &self,
        listing: &JobListing,
        session: &mut Session,
    ) -> Result<JobDetail, AdapterError> {
        session.pace(ActionKind::Navigate).await;
        let response = session
            .http()
            .get(self.url(&format!("/api/jobs/{}", listing.job_id)))
            .send()
            .await?;
        let (status, body) = inspect(response, Phase::Browse).await?;
        if !status.is_success() {
            return Err(unexpected(status));
        }
        let wire: WireDetail = decode(&body)?;
        if !SUPPORTED_FORM_VERSIONS.contains(&wire.form_version.as_str()) {
            return Err(AdapterError::FormStructureChanged(format!(
                "unknown form version {}",
                wire.form_version
            )));
        }
        session
            .pace(ActionKind::Idle {
                content_chars: wire.description.len(),
            })
            .await;
        Ok(JobDetail {
            listing: listing.clone(),
            description: wire.description,
            questions: wire
                .questions
                .into_iter()
                .map(|q| Question {
                    id: q.id,
                    prompt: q.prompt,
                    field: q.field,
                })
                .collect(),
            form_version: Some(wire.form_version),
        })
    }

    async fn submit(
        &self,
        detail: &JobDetail,
        materials: &Materials,
        session: &mut Session,
    ) -> Result<SubmissionReceipt, AdapterError> {
        for question in &detail.questions {
            let chars = materials
                .answer_for(&question.id)
                .map(|a| a.text.len())
                .unwrap_or(0);
            session
                .pace(ActionKind::Type {
                    chars,
                    field: question.field,
                })
                .await;
        }
        session.pace(ActionKind::Click).await;

        let payload = ApplicationRequest {
            form_version: detail.form_version.as_deref(),
            resume: materials.resume.as_ref().map(|d| d.body.as_str()),
            cover_letter: materials.cover_letter.as_ref().map(|d| d.body.as_str()),
            answers: &materials.answers,
        };
        let response = session
            .http()
            .post(self.url(&format!("/api/jobs/{}/applications", detail.listing.job_id)))
            .json(&payload)
            .send()
            .await?;
        let (status, body) = inspect(response, Phase::Browse).await?;
        match status {
            s if s.is_success() => {
                let ack: ApplicationResponse = decode(&body)?;
                Ok(SubmissionReceipt {
                    confirmation: ack.confirmation,
                })
            }
            StatusCode::CONFLICT | StatusCode::GONE => Err(AdapterError::SubmissionRejected(
                format!("platform returned {status}"),
            )),
            StatusCode::UNPROCESSABLE_ENTITY => Err(AdapterError::FormStructureChanged(
                "application form rejected the payload".into(),
            )),
            StatusCode::UNAUTHORIZED => Err(AdapterError::LoginFailure("session expired".into())),
            other => Err(unexpected(other)),
        }
    }
}
