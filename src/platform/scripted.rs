//! In-memory platform with scripted responses.
//!
//! Every operation succeeds unless a failure was queued for it (consumed in
//! order) or pinned to a specific job id (returned on every call). Used by
//! the `demo` command and throughout the tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::{
    AdapterError, Credentials, JobDetail, JobKey, JobListing, PlatformAdapter, PlatformId,
    Question, SearchCriteria, SearchCursor, SearchPage, SubmissionReceipt,
};
use crate::behavior::FieldKind;
use crate::gateway::Materials;
use crate::session::Session;

const TITLES: &[&str] = &[
    "Rust Engineer",
    "Backend Developer",
    "Platform Engineer",
    "Systems Programmer",
    "Site Reliability Engineer",
];
const COMPANIES: &[&str] = &["Acme", "Globex", "Initech", "Umbrella", "Hooli"];
const LOCATIONS: &[&str] = &["Remote", "Berlin", "Hybrid - London", "Remote (EU)", "New York"];

#[derive(Default)]
struct Script {
    auth: VecDeque<AdapterError>,
    search: VecDeque<AdapterError>,
    detail: VecDeque<AdapterError>,
    submit: VecDeque<AdapterError>,
    pinned_submit: HashMap<String, AdapterError>,
    submitted: Vec<JobKey>,
}

pub struct ScriptedAdapter {
    platform: PlatformId,
    listings: Vec<JobListing>,
    page_size: usize,
    latency: Duration,
    script: Mutex<Script>,
    auth_calls: AtomicUsize,
    search_calls: AtomicUsize,
    detail_calls: AtomicUsize,
    submit_calls: AtomicUsize,
}

impl ScriptedAdapter {
    pub fn new(platform: impl Into<PlatformId>) -> Self {
        Self {
            platform: platform.into(),
            listings: Vec::new(),
            page_size: 10,
            latency: Duration::ZERO,
            script: Mutex::new(Script::default()),
            auth_calls: AtomicUsize::new(0),
            search_calls: AtomicUsize::new(0),
            detail_calls: AtomicUsize::new(0),
            submit_calls: AtomicUsize::new(0),
        }
    }

    /// Populate the search results with `count` listings `job-1..=job-count`.
    pub fn with_generated_listings(mut self, count: usize) -> Self {
        self.listings = (1..=count)
            .map(|n| {
                let i = n - 1;
                JobListing::new(
                    self.platform.clone(),
                    format!("job-{n}"),
                    TITLES[i % TITLES.len()],
                    COMPANIES[i % COMPANIES.len()],
                    LOCATIONS[i % LOCATIONS.len()],
                )
            })
            .collect();
        self
    }

    pub fn with_listings(mut self, listings: Vec<JobListing>) -> Self {
        self.listings = listings;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Simulated network latency applied to every operation.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn fail_next_auth(&self, err: AdapterError) {
        self.script().auth.push_back(err);
    }

    pub fn fail_next_search(&self, err: AdapterError) {
        self.script().search.push_back(err);
    }

    pub fn fail_next_detail(&self, err: AdapterError) {
        self.script().detail.push_back(err);
    }

    pub fn fail_next_submit(&self, err: AdapterError) {
        self.script().submit.push_back(err);
    }

    /// Make every submission for `job_id` fail with `err`.
    pub fn fail_submit_for(&self, job_id: impl Into<String>, err: AdapterError) {
        self.script().pinned_submit.insert(job_id.into(), err);
    }

    pub fn auth_calls(&self) -> usize {
        self.auth_calls.load(Ordering::SeqCst)
    }

    pub fn search_calls(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }

    pub fn detail_calls(&self) -> usize {
        self.detail_calls.load(Ordering::SeqCst)
    }

    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    /// Keys of every accepted submission, in order.
    pub fn submitted(&self) -> Vec<JobKey> {
        self.script().submitted.clone()
    }

    async fn latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl PlatformAdapter for ScriptedAdapter {
    fn platform(&self) -> &PlatformId {
        &self.platform
    }

    async fn authenticate(
        &self,
        _credentials: &Credentials,
        session: &mut Session,
    ) -> Result<(), AdapterError> {
        self.auth_calls.fetch_add(1, Ordering::SeqCst);
        self.latency().await;
        if let Some(err) = self.script().auth.pop_front() {
            return Err(err);
        }
        session.mark_authenticated();
        Ok(())
    }

    async fn search_page(
        &self,
        _criteria: &SearchCriteria,
        cursor: Option<&SearchCursor>,
        _session: &mut Session,
    ) -> Result<SearchPage, AdapterError> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        self.latency().await;
        if let Some(err) = self.script().search.pop_front() {
            return Err(err);
        }
        let offset = match cursor {
            None => 0,
            Some(SearchCursor(raw)) => raw
                .parse::<usize>()
                .map_err(|_| AdapterError::FormStructureChanged(format!("bad cursor {raw}")))?,
        };
        let start = offset.min(self.listings.len());
        let end = (start + self.page_size).min(self.listings.len());
        Ok(SearchPage {
            listings: self.listings[start..end].to_vec(),
            next_cursor: (end < self.listings.len()).then(|| SearchCursor(end.to_string())),
        })
    }

    async fn fetch_detail(
        &self,
        listing: &JobListing,
        _session: &mut Session,
    ) -> Result<JobDetail, AdapterError> {
        self.detail_calls.fetch_add(1, Ordering::SeqCst);
        self.latency().await;
        if let Some(err) = self.script().detail.pop_front() {
            return Err(err);
        }
        Ok(JobDetail {
            listing: listing.clone(),
            description: format!(
                "{} at {}. We build services in Rust with tokio and async Rust. \
                 Located {}. 3+ years of experience.",
                listing.title, listing.company, listing.location
            ),
            questions: vec![Question {
                id: "why".into(),
                prompt: format!("Why do you want to join {}?", listing.company),
                field: FieldKind::Other,
            }],
            form_version: Some("v1".into()),
        })
    }

    async fn submit(
        &self,
        detail: &JobDetail,
        _materials: &Materials,
        _session: &mut Session,
    ) -> Result<SubmissionReceipt, AdapterError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        self.latency().await;
        let mut script = self.script();
        if let Some(err) = script.pinned_submit.get(&detail.listing.job_id) {
            return Err(err.clone());
        }
        if let Some(err) = script.submit.pop_front() {
            return Err(err);
        }
        script.submitted.push(detail.listing.key());
        Ok(SubmissionReceipt {
            confirmation: Some(format!("{}-{}", self.platform, detail.listing.job_id)),
        })
    }
}
