//! Offline gateway that fills fixed templates from the profile.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{Answer, CandidateProfile, ContentGateway, Document, DocumentKind, GatewayError};
use crate::platform::{JobDetail, Question};

#[derive(Default)]
pub struct TemplateGateway {
    failures: Mutex<VecDeque<GatewayError>>,
    calls: AtomicUsize,
}

impl TemplateGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a failure for the next call, whichever operation it is.
    pub fn fail_next(&self, err: GatewayError) {
        self.failures().push_back(err);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn failures(&self) -> MutexGuard<'_, VecDeque<GatewayError>> {
        self.failures.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn enter(&self) -> Result<(), GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.failures().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ContentGateway for TemplateGateway {
    async fn generate_resume(
        &self,
        profile: &CandidateProfile,
        detail: &JobDetail,
    ) -> Result<Document, GatewayError> {
        self.enter()?;
        let body = format!(
            "{}\n{}\n\nTarget role: {} at {}\nSkills: {}\n\n{}",
            profile.name,
            profile.headline,
            detail.listing.title,
            detail.listing.company,
            profile.skills.join(", "),
            profile.resume
        );
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
        self.enter()?;
        let body = format!(
            "Dear {} team,\n\nI am applying for the {} position. {}\n\nBest regards,\n{}",
            detail.listing.company, detail.listing.title, profile.summary, profile.name
        );
        Ok(Document {
            kind: DocumentKind::CoverLetter,
            body,
        })
    }

    async fn answer_question(
        &self,
        question: &Question,
        profile: &CandidateProfile,
        _detail: &JobDetail,
    ) -> Result<Answer, GatewayError> {
        self.enter()?;
        Ok(Answer {
            question_id: question.id.clone(),
            text: format!(
                "{} years of experience. {}",
                profile.years_experience, profile.summary
            ),
        })
    }
}
