//! Platform adapter contract and the job data it produces.
//!
//! Each job platform implements [`PlatformAdapter`]. Every operation takes the
//! task's bound [`Session`] and must go through that session's browsing
//! context only. Adapters report failures as [`AdapterError`], which maps onto
//! the crate-wide [`ErrorClass`].

pub mod board;
pub mod detection;
pub mod registry;
pub mod scripted;

use std::collections::VecDeque;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::behavior::FieldKind;
use crate::error::ErrorClass;
use crate::gateway::Materials;
use crate::session::{Session, SessionError};

pub use board::BoardAdapter;
pub use registry::{AdapterEntry, AdapterKind, AdapterRegistry};
pub use scripted::ScriptedAdapter;

/// Identifier of a job platform, e.g. `"board"`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlatformId(String);

impl PlatformId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlatformId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlatformId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Identity of a listing across the whole run: `(platform, job id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub platform: PlatformId,
    pub job_id: String,
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.platform, self.job_id)
    }
}

/// A job posting as returned by a platform search. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobListing {
    pub platform: PlatformId,
    pub job_id: String,
    pub title: String,
    pub company: String,
    pub location: String,
    pub posted_at: Option<DateTime<Utc>>,
    pub detail_url: String,
}

impl JobListing {
    pub fn new(
        platform: impl Into<PlatformId>,
        job_id: impl Into<String>,
        title: impl Into<String>,
        company: impl Into<String>,
        location: impl Into<String>,
    ) -> Self {
        let platform = platform.into();
        let job_id = job_id.into();
        Self {
            detail_url: format!("{platform}://jobs/{job_id}"),
            platform,
            job_id,
            title: title.into(),
            company: company.into(),
            location: location.into(),
            posted_at: None,
        }
    }

    pub fn key(&self) -> JobKey {
        JobKey {
            platform: self.platform.clone(),
            job_id: self.job_id.clone(),
        }
    }
}

impl From<String> for PlatformId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// One screening question on an application form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub prompt: String,
    #[serde(default)]
    pub field: FieldKind,
}

/// Everything needed to fill in an application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDetail {
    pub listing: JobListing,
    pub description: String,
    #[serde(default)]
    pub questions: Vec<Question>,
    /// Version tag of the application form, when the platform exposes one.
    #[serde(default)]
    pub form_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchCriteria {
    pub keywords: String,
    #[serde(default)]
    pub location: String,
    /// Upper bound on pages fetched per search, keeping the sequence finite.
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
}

fn default_max_pages() -> u32 {
    5
}

/// Opaque continuation token handed out by a platform search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SearchCursor(pub String);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchPage {
    pub listings: Vec<JobListing>,
    pub next_cursor: Option<SearchCursor>,
}

/// Platform acknowledgement of a submitted application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionReceipt {
    pub confirmation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    #[error("login failed: {0}")]
    LoginFailure(String),

    #[error("captcha required: {0}")]
    CaptchaRequired(String),

    #[error("automation detection suspected: {0}")]
    DetectionSuspected(String),

    #[error("transient network failure: {0}")]
    NetworkTransient(String),

    #[error("form structure changed: {0}")]
    FormStructureChanged(String),

    #[error("submission rejected: {0}")]
    SubmissionRejected(String),
}

impl AdapterError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AdapterError::LoginFailure(_) => ErrorClass::LoginFailure,
            AdapterError::CaptchaRequired(_) => ErrorClass::CaptchaRequired,
            AdapterError::DetectionSuspected(_) => ErrorClass::DetectionSuspected,
            AdapterError::NetworkTransient(_) => ErrorClass::NetworkTransient,
            AdapterError::FormStructureChanged(_) => ErrorClass::FormStructureChanged,
            AdapterError::SubmissionRejected(_) => ErrorClass::SubmissionRejected,
        }
    }
}

impl From<reqwest::Error> for AdapterError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            AdapterError::FormStructureChanged(err.to_string())
        } else {
            AdapterError::NetworkTransient(err.to_string())
        }
    }
}

/// The fixed capability contract every platform implements.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn platform(&self) -> &PlatformId;

    async fn authenticate(
        &self,
        credentials: &Credentials,
        session: &mut Session,
    ) -> Result<(), AdapterError>;

    /// Fetches one page of results. `None` starts a fresh search.
    async fn search_page(
        &self,
        criteria: &SearchCriteria,
        cursor: Option<&SearchCursor>,
        session: &mut Session,
    ) -> Result<SearchPage, AdapterError>;

    async fn fetch_detail(
        &self,
        listing: &JobListing,
        session: &mut Session,
    ) -> Result<JobDetail, AdapterError>;

    async fn submit(
        &self,
        detail: &JobDetail,
        materials: &Materials,
        session: &mut Session,
    ) -> Result<SubmissionReceipt, AdapterError>;
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Lazy, finite sequence of listings over [`PlatformAdapter::search_page`].
///
/// The stream keeps the cursor of the next unfetched page, so a search that
/// failed midway can be resumed with [`ListingStream::resume`].
pub struct ListingStream<'a> {
    adapter: &'a dyn PlatformAdapter,
    criteria: &'a SearchCriteria,
    cursor: Option<SearchCursor>,
    buffered: VecDeque<JobListing>,
    pages_fetched: u32,
    exhausted: bool,
}

impl<'a> ListingStream<'a> {
    pub fn new(adapter: &'a dyn PlatformAdapter, criteria: &'a SearchCriteria) -> Self {
        Self {
            adapter,
            criteria,
            cursor: None,
            buffered: VecDeque::new(),
            pages_fetched: 0,
            exhausted: false,
        }
    }

    /// Restart a search from a cursor obtained from an earlier stream.
    pub fn resume(
        adapter: &'a dyn PlatformAdapter,
        criteria: &'a SearchCriteria,
        cursor: SearchCursor,
    ) -> Self {
        Self {
            cursor: Some(cursor),
            ..Self::new(adapter, criteria)
        }
    }

    /// Cursor of the next page that has not been fetched yet.
    pub fn cursor(&self) -> Option<&SearchCursor> {
        self.cursor.as_ref()
    }

    pub fn pages_fetched(&self) -> u32 {
        self.pages_fetched
    }

    /// Whether the next call to [`ListingStream::next`] will hit the platform.
    pub fn needs_fetch(&self) -> bool {
        self.buffered.is_empty() && !self.exhausted && self.pages_fetched < self.criteria.max_pages
    }

    pub async fn next(&mut self, session: &mut Session) -> Option<Result<JobListing, SearchError>> {
        loop {
            if let Some(listing) = self.buffered.pop_front() {
                return Some(Ok(listing));
            }
            if self.exhausted || self.pages_fetched >= self.criteria.max_pages {
                return None;
            }
            if let Err(err) = session.begin_request() {
                return Some(Err(err.into()));
            }
            let page = match self
                .adapter
                .search_page(self.criteria, self.cursor.as_ref(), session)
                .await
            {
                Ok(page) => page,
                Err(err) => return Some(Err(err.into())),
            };
            self.pages_fetched += 1;
            self.exhausted = page.next_cursor.is_none();
            self.cursor = page.next_cursor;
            self.buffered.extend(page.listings);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::test_session;

    #[test]
    fn job_key_display() {
        let listing = JobListing::new("board", "42", "Rust Engineer", "Acme", "Remote");
        assert_eq!(listing.key().to_string(), "board/42");
        assert_eq!(listing.detail_url, "board://jobs/42");
    }

    #[test]
    fn adapter_error_classes() {
        assert_eq!(
            AdapterError::FormStructureChanged("x".into()).class(),
            ErrorClass::FormStructureChanged
        );
        assert_eq!(
            AdapterError::DetectionSuspected("x".into()).class(),
            ErrorClass::DetectionSuspected
        );
        assert_eq!(
            AdapterError::CaptchaRequired("x".into()).class(),
            ErrorClass::CaptchaRequired
        );
    }

    #[test]
    fn search_criteria_defaults_max_pages() {
        let criteria: SearchCriteria = toml::from_str(r#"keywords = "rust""#).unwrap();
        assert_eq!(criteria.max_pages, 5);
        assert!(criteria.location.is_empty());
    }

    #[tokio::test]
    async fn listing_stream_pages_until_exhausted() {
        let adapter = ScriptedAdapter::new("board").with_generated_listings(7).with_page_size(3);
        let criteria = SearchCriteria {
            keywords: "rust".into(),
            location: String::new(),
            max_pages: 10,
        };
        let mut session = test_session("board", 100);
        let mut stream = ListingStream::new(&adapter, &criteria);

        let mut ids = Vec::new();
        while let Some(item) = stream.next(&mut session).await {
            ids.push(item.unwrap().job_id);
        }
        assert_eq!(ids.len(), 7);
        assert_eq!(stream.pages_fetched(), 3);
        assert!(stream.cursor().is_none());
        assert_eq!(session.requests(), 3);
    }

    #[tokio::test]
    async fn listing_stream_stops_at_page_limit_and_resumes() {
        let adapter = ScriptedAdapter::new("board").with_generated_listings(10).with_page_size(2);
        let criteria = SearchCriteria {
            keywords: "rust".into(),
            location: String::new(),
            max_pages: 2,
        };
        let mut session = test_session("board", 100);

        let mut first = ListingStream::new(&adapter, &criteria);
        let mut seen = 0;
        while let Some(item) = first.next(&mut session).await {
            item.unwrap();
            seen += 1;
        }
        assert_eq!(seen, 4);
        let cursor = first.cursor().cloned().expect("more pages remain");

        let mut resumed = ListingStream::resume(&adapter, &criteria, cursor);
        let next = resumed.next(&mut session).await.unwrap().unwrap();
        assert_eq!(next.job_id, "job-5");
    }

    #[tokio::test]
    async fn listing_stream_surfaces_exhausted_session() {
        let adapter = ScriptedAdapter::new("board").with_generated_listings(4).with_page_size(1);
        let criteria = SearchCriteria {
            keywords: "rust".into(),
            location: String::new(),
            max_pages: 10,
        };
        let mut session = test_session("board", 2);
        let mut stream = ListingStream::new(&adapter, &criteria);

        assert!(stream.next(&mut session).await.unwrap().is_ok());
        assert!(stream.next(&mut session).await.unwrap().is_ok());
        let err = stream.next(&mut session).await.unwrap().unwrap_err();
        assert!(matches!(err, SearchError::Session(SessionError::Exhausted { .. })));
    }
}
