use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use super::state::AppState;
use crate::error::ErrorClass;
use crate::gateway::Materials;
use crate::platform::{JobDetail, JobKey, JobListing, PlatformId};
use crate::session::SessionId;

/// Whether a failure may still be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Retryable,
    Fatal,
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries before a retryable failure becomes fatal.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound for a single backoff delay.
    #[serde(default = "default_ceiling_delay_ms")]
    pub ceiling_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_ceiling_delay_ms() -> u64 {
    60_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            ceiling_delay_ms: default_ceiling_delay_ms(),
        }
    }
}

impl RetryConfig {
    /// delay = min(base_delay_ms * 2^(attempt - 1), ceiling_delay_ms)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(
            self.base_delay_ms
                .saturating_mul(factor)
                .min(self.ceiling_delay_ms),
        )
    }

    /// Exponential delay plus up to 25% random jitter. A provider hint raises
    /// the delay to at least the hinted wait; the ceiling still applies.
    pub fn backoff<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        attempt: u32,
        hint: Option<Duration>,
    ) -> Duration {
        let ceiling = Duration::from_millis(self.ceiling_delay_ms);
        let base = self.delay_for_attempt(attempt);
        let jitter_ms = rng.random_range(0..=(base.as_millis() as u64 / 4));
        let delay = base + Duration::from_millis(jitter_ms);
        let delay = match hint {
            Some(hint) => delay.max(hint),
            None => delay,
        };
        delay.min(ceiling)
    }

    /// Longest time a retrying task can spend waiting between attempts.
    pub fn worst_case_wait(&self) -> Duration {
        Duration::from_millis(self.ceiling_delay_ms) * self.max_retries
    }
}

/// Per-task escalation limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskLimits {
    pub max_retries: u32,
    pub max_detections: u32,
}

/// One job application moving through the lifecycle.
///
/// Artifacts of completed steps are cached on the task, so a requeued task
/// resumes at the first step whose result is missing.
#[derive(Debug, Clone)]
pub struct ApplicationTask {
    pub id: Uuid,
    pub listing: JobListing,
    pub state: AppState,
    pub state_history: Vec<AppState>,
    /// Dispatches that ran against the platform. Deferrals are not counted.
    pub attempts: u32,
    pub retry_count: u32,
    pub detections: u32,
    pub last_error: Option<ErrorClass>,
    pub session: Option<SessionId>,
    pub limits: TaskLimits,
    /// Listing-level score used to order the queue.
    pub priority: f64,
    /// Discovery order, breaks priority ties.
    pub seq: u64,
    pub not_before: Option<Instant>,
    pub deadline: Instant,
    pub detail: Option<JobDetail>,
    pub score: Option<f64>,
    pub materials: Option<Materials>,
    pub confirmation: Option<String>,
    started: Instant,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApplicationTask {
    pub fn new(
        listing: JobListing,
        priority: f64,
        seq: u64,
        limits: TaskLimits,
        lifetime: Duration,
    ) -> Self {
        let now = Utc::now();
        let started = Instant::now();
        Self {
            id: Uuid::new_v4(),
            listing,
            state: AppState::Discovered,
            state_history: Vec::new(),
            attempts: 0,
            retry_count: 0,
            detections: 0,
            last_error: None,
            session: None,
            limits,
            priority,
            seq,
            not_before: None,
            deadline: started + lifetime,
            detail: None,
            score: None,
            materials: None,
            confirmation: None,
            started,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> JobKey {
        self.listing.key()
    }

    pub fn platform(&self) -> &PlatformId {
        &self.listing.platform
    }

    pub fn is_eligible(&self, now: Instant) -> bool {
        self.not_before.is_none_or(|t| t <= now)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub(crate) fn enter(&mut self, next: AppState) {
        self.state_history.push(self.state);
        self.state = next;
        self.updated_at = Utc::now();
    }

    /// Back into the queue, eligible again at `not_before`.
    pub fn requeue(&mut self, not_before: Option<Instant>) {
        if self.state != AppState::Queued {
            self.enter(AppState::Queued);
        }
        self.session = None;
        self.not_before = not_before;
    }
}

/// Final state of a task as recorded by the tracking sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalState {
    Succeeded,
    Skipped,
    Failed,
}

/// Structured record produced once per task at its terminal transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub task_id: Uuid,
    pub platform: PlatformId,
    pub job_id: String,
    pub title: String,
    pub company: String,
    pub final_state: FinalState,
    pub error: Option<ErrorClass>,
    pub attempts: u32,
    pub retries: u32,
    pub score: Option<f64>,
    pub confirmation: Option<String>,
    pub state_transitions: Vec<AppState>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl OutcomeRecord {
    /// Generate an outcome record from a task in a terminal state.
    pub fn from_task(task: &ApplicationTask) -> Self {
        let now = Utc::now();
        let mut transitions = task.state_history.clone();
        transitions.push(task.state);
        let final_state = match task.state {
            AppState::Succeeded => FinalState::Succeeded,
            AppState::Skipped => FinalState::Skipped,
            _ => FinalState::Failed,
        };

        Self {
            task_id: task.id,
            platform: task.listing.platform.clone(),
            job_id: task.listing.job_id.clone(),
            title: task.listing.title.clone(),
            company: task.listing.company.clone(),
            final_state,
            error: match final_state {
                FinalState::Failed => task.last_error,
                _ => None,
            },
            attempts: task.attempts,
            retries: task.retry_count,
            score: task.score,
            confirmation: task.confirmation.clone(),
            state_transitions: transitions,
            started_at: task.created_at,
            completed_at: now,
            duration_ms: task.elapsed().as_millis() as i64,
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    fn task() -> ApplicationTask {
        ApplicationTask::new(
            JobListing::new("board", "1", "Rust Engineer", "Acme", "Remote"),
            0.5,
            0,
            TaskLimits {
                max_retries: 3,
                max_detections: 2,
            },
            Duration::from_secs(600),
        )
    }

    #[test]
    fn task_creation_defaults() {
        let task = task();
        assert_eq!(task.state, AppState::Discovered);
        assert_eq!(task.attempts, 0);
        assert!(task.state_history.is_empty());
        assert!(task.is_eligible(Instant::now()));
        assert_eq!(task.key().to_string(), "board/1");
    }

    #[test]
    fn retry_config_exponential_backoff_with_ceiling() {
        let config = RetryConfig {
            max_retries: 5,
            base_delay_ms: 1000,
            ceiling_delay_ms: 5000,
        };
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(config.delay_for_attempt(4), Duration::from_millis(5000));
        assert_eq!(config.delay_for_attempt(60), Duration::from_millis(5000));
    }

    #[test]
    fn backoff_jitter_stays_within_quarter() {
        let config = RetryConfig::default();
        let mut rng = StdRng::seed_from_u64(9);
        for attempt in 1..=4 {
            let base = config.delay_for_attempt(attempt);
            for _ in 0..100 {
                let d = config.backoff(&mut rng, attempt, None);
                assert!(d >= base && d <= base + base / 4, "{d:?} for {base:?}");
            }
        }
    }

    #[test]
    fn backoff_honours_hint_but_not_past_ceiling() {
        let config = RetryConfig {
            max_retries: 3,
            base_delay_ms: 100,
            ceiling_delay_ms: 10_000,
        };
        let mut rng = StdRng::seed_from_u64(1);
        let d = config.backoff(&mut rng, 1, Some(Duration::from_secs(3)));
        assert_eq!(d, Duration::from_secs(3));
        let d = config.backoff(&mut rng, 1, Some(Duration::from_secs(60)));
        assert_eq!(d, Duration::from_secs(10));
    }

    #[test]
    fn requeue_resets_session_and_sets_not_before() {
        let mut task = task();
        task.enter(AppState::Queued);
        task.enter(AppState::Authenticating);
        task.session = Some(SessionId::new());
        let later = Instant::now() + Duration::from_secs(5);
        task.requeue(Some(later));
        assert_eq!(task.state, AppState::Queued);
        assert!(task.session.is_none());
        assert!(!task.is_eligible(Instant::now()));
    }

    #[test]
    fn outcome_record_from_task() {
        let mut task = task();
        task.enter(AppState::Queued);
        task.enter(AppState::Failed(Severity::Fatal));
        task.last_error = Some(ErrorClass::FormStructureChanged);
        task.attempts = 1;
        let record = OutcomeRecord::from_task(&task);

        assert_eq!(record.task_id, task.id);
        assert_eq!(record.final_state, FinalState::Failed);
        assert_eq!(record.error, Some(ErrorClass::FormStructureChanged));
        assert_eq!(
            record.state_transitions,
            vec![
                AppState::Discovered,
                AppState::Queued,
                AppState::Failed(Severity::Fatal)
            ]
        );
    }

    #[test]
    fn outcome_record_serialization() {
        let mut task = task();
        task.enter(AppState::Skipped);
        let record = OutcomeRecord::from_task(&task);
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains(r#""final_state":"skipped""#));
        let back: OutcomeRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.job_id, "1");
        assert_eq!(back.error, None);
    }
}
