//! Runs one application task against its bound session.
//!
//! [`RunContext`] owns every shared collaborator of a run. The
//! [`ApplicationRunner`] executes the step for the task's current state, feeds
//! the outcome to the pure [`StateMachine`] and keeps going until the machine
//! asks for something only the scheduler can do (wait, requeue, finalize).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::anthropic::AnthropicClient;
use crate::anthropic::client::API_URL;
use crate::behavior::BehaviorSimulator;
use crate::config::{AutoApplyConfig, GatewayKind};
use crate::error::{AutoApplyError, ErrorClass};
use crate::gateway::{
    CandidateProfile, ContentGateway, LlmContentGateway, TemplateGateway, prepare_materials,
};
use crate::matching::{KeywordSuitabilityJudge, SuitabilityJudge};
use crate::platform::{AdapterEntry, AdapterRegistry, PlatformId};
use crate::rate_limit::RateLimiter;
use crate::session::{
    NoProxy, ProxyEndpoint, ProxySource, RandomProfileGenerator, RotatingProxies, Session,
    SessionPool,
};
use crate::state_machine::{
    AppState, ApplicationTask, RetryConfig, StateMachine, StepOutcome, TaskLimits, Transition,
};
use crate::tracking::{JsonlTrackingSink, TrackingSink};

/// Platform-wide response to detections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectionPolicy {
    pub cooldown_base: Duration,
    pub cooldown_ceiling: Duration,
}

/// Everything a run shares between platform workers.
pub struct RunContext {
    pub registry: AdapterRegistry,
    pub pool: SessionPool,
    pub limiter: RateLimiter,
    pub gateway: Arc<dyn ContentGateway>,
    pub judge: Arc<dyn SuitabilityJudge>,
    pub sink: Arc<dyn TrackingSink>,
    pub profile: CandidateProfile,
    pub retry: RetryConfig,
    pub detection: DetectionPolicy,
    pub task_limits: TaskLimits,
    /// Minimum suitability score for a task to be submitted.
    pub threshold: f64,
    pub task_timeout: Duration,
    pub cancel: CancellationToken,
}

impl RunContext {
    /// Wire up a run from configuration.
    pub fn from_config(
        config: &AutoApplyConfig,
        cancel: CancellationToken,
    ) -> Result<Self, AutoApplyError> {
        let registry = AdapterRegistry::from_config(config)?;
        let caps: Vec<(PlatformId, usize)> = config
            .enabled_platforms()
            .map(|(name, p)| (PlatformId::new(name.as_str()), p.concurrency))
            .collect();

        let proxies: Arc<dyn ProxySource> = if config.session.proxies.is_empty() {
            Arc::new(NoProxy)
        } else {
            Arc::new(RotatingProxies::new(
                config
                    .session
                    .proxies
                    .iter()
                    .map(|url| ProxyEndpoint { url: url.clone() })
                    .collect(),
            ))
        };
        let pool = SessionPool::new(
            caps,
            Arc::new(RandomProfileGenerator),
            proxies,
            Arc::new(BehaviorSimulator::new(config.behavior.clone())),
            config.session_limits(),
            Duration::from_secs(config.session.checkout_timeout_secs),
        );
        let limiter = RateLimiter::new(
            config.platform_budgets(),
            config.global_bucket(),
            config.global.daily_submission_cap,
        );

        let gateway: Arc<dyn ContentGateway> = match config.gateway.kind {
            GatewayKind::Template => Arc::new(TemplateGateway::new()),
            GatewayKind::Llm => {
                if config.gateway.api_key.is_empty() {
                    return Err(AutoApplyError::Config(
                        "gateway.kind = \"llm\" needs ANTHROPIC_API_KEY".into(),
                    ));
                }
                let client = AnthropicClient::with_base_url(
                    config.gateway.api_key.clone(),
                    config.gateway.model.clone(),
                    API_URL.to_string(),
                    Duration::from_secs(config.gateway.timeout_secs),
                )?;
                Arc::new(LlmContentGateway::new(client))
            }
        };

        Ok(Self {
            registry,
            pool,
            limiter,
            gateway,
            judge: Arc::new(KeywordSuitabilityJudge::new(
                config.matching.clone(),
                config.profile.clone(),
            )),
            sink: Arc::new(JsonlTrackingSink::new(&config.tracking.path)),
            profile: config.profile.clone(),
            retry: config.retry.clone(),
            detection: DetectionPolicy {
                cooldown_base: Duration::from_secs(config.detection.cooldown_base_secs),
                cooldown_ceiling: Duration::from_secs(config.detection.cooldown_ceiling_secs),
            },
            task_limits: config.task_limits(),
            threshold: config.matching.threshold,
            task_timeout: Duration::from_secs(config.task_timeout_secs),
            cancel,
        })
    }
}

/// Executes lifecycle steps for tasks of one platform.
pub struct ApplicationRunner<'a> {
    ctx: &'a RunContext,
    entry: &'a AdapterEntry,
}

impl<'a> ApplicationRunner<'a> {
    pub fn new(ctx: &'a RunContext, entry: &'a AdapterEntry) -> Self {
        Self { ctx, entry }
    }

    /// Dispatch a queued task on `session` and run it until the state machine
    /// hands control back to the scheduler.
    pub async fn run(&self, task: &mut ApplicationTask, session: &mut Session) -> Transition {
        task.session = Some(session.id());
        let mut transition = StateMachine::next(task, StepOutcome::Done);

        while let Transition::Next(state) = transition {
            debug!(
                platform = %task.platform(),
                job_id = %task.listing.job_id,
                state = %state,
                session = %session.id(),
                "step"
            );
            // Stop signal and deadline are only honoured between steps; a
            // started submission always runs to its result.
            let outcome = match self.interruption(task) {
                Some(class) => StepOutcome::Interrupted(class),
                None => self.step(state, task, session).await,
            };
            transition = StateMachine::next(task, outcome);
        }

        info!(
            platform = %task.platform(),
            job_id = %task.listing.job_id,
            state = %task.state,
            attempt = task.attempts,
            class = ?transition.class(),
            "dispatch finished"
        );
        transition
    }

    fn interruption(&self, task: &ApplicationTask) -> Option<ErrorClass> {
        if self.ctx.cancel.is_cancelled() {
            Some(ErrorClass::Cancelled)
        } else if task.is_expired(Instant::now()) {
            Some(ErrorClass::TimedOut)
        } else {
            None
        }
    }

    async fn step(
        &self,
        state: AppState,
        task: &mut ApplicationTask,
        session: &mut Session,
    ) -> StepOutcome {
        match state {
            AppState::Authenticating => self.authenticate(session).await,
            AppState::Matching => self.matching(task, session).await,
            AppState::Customizing => self.customize(task).await,
            AppState::Submitting => self.submit(task, session).await,
            // Dispatch always starts at Authenticating.
            AppState::Discovered
            | AppState::Queued
            | AppState::Succeeded
            | AppState::Skipped
            | AppState::Failed(_) => StepOutcome::Done,
        }
    }

    async fn authenticate(&self, session: &mut Session) -> StepOutcome {
        if session.is_authenticated() {
            return StepOutcome::Done;
        }
        if session.begin_request().is_err() {
            return StepOutcome::SessionExhausted;
        }
        match self
            .entry
            .adapter
            .authenticate(&self.entry.credentials, session)
            .await
        {
            Ok(()) => StepOutcome::Done,
            Err(err) => {
                debug!(platform = %session.platform(), error = %err, "authentication failed");
                StepOutcome::failed(err.class())
            }
        }
    }

    async fn matching(&self, task: &mut ApplicationTask, session: &mut Session) -> StepOutcome {
        if task.detail.is_none() {
            if session.begin_request().is_err() {
                return StepOutcome::SessionExhausted;
            }
            match self.entry.adapter.fetch_detail(&task.listing, session).await {
                Ok(detail) => task.detail = Some(detail),
                Err(err) => {
                    debug!(job_id = %task.listing.job_id, error = %err, "detail fetch failed");
                    return StepOutcome::failed(err.class());
                }
            }
        }

        let score = match (task.score, task.detail.as_ref()) {
            (Some(score), _) => score,
            (None, Some(detail)) => {
                let suitability = self.ctx.judge.judge(detail).await;
                debug!(
                    job_id = %task.listing.job_id,
                    score = suitability.score,
                    reasons = ?suitability.reasons,
                    "suitability judged"
                );
                task.score = Some(suitability.score);
                suitability.score
            }
            (None, None) => return StepOutcome::failed(ErrorClass::FormStructureChanged),
        };

        if score < self.ctx.threshold {
            StepOutcome::BelowThreshold { score }
        } else {
            StepOutcome::Done
        }
    }

    async fn customize(&self, task: &mut ApplicationTask) -> StepOutcome {
        if task.materials.is_some() {
            return StepOutcome::Done;
        }
        let Some(detail) = task.detail.as_ref() else {
            return StepOutcome::failed(ErrorClass::FormStructureChanged);
        };
        match prepare_materials(self.ctx.gateway.as_ref(), &self.ctx.profile, detail).await {
            Ok(materials) => {
                task.materials = Some(materials);
                StepOutcome::Done
            }
            Err(err) => {
                debug!(job_id = %task.listing.job_id, error = %err, "content generation failed");
                StepOutcome::Failed {
                    class: ErrorClass::ContentGenerationFailure,
                    hint: err.retry_hint(),
                }
            }
        }
    }

    async fn submit(&self, task: &mut ApplicationTask, session: &mut Session) -> StepOutcome {
        let (Some(detail), Some(materials)) = (task.detail.as_ref(), task.materials.as_ref()) else {
            return StepOutcome::failed(ErrorClass::FormStructureChanged);
        };
        let platform = task.listing.platform.clone();

        let reserved_on = match self.ctx.limiter.reserve_submission(&platform) {
            Ok(day) => day,
            Err(quota) => {
                let wait = (quota.resets_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                info!(
                    platform = %platform,
                    job_id = %task.listing.job_id,
                    resets_at = %quota.resets_at,
                    "daily cap reached"
                );
                return StepOutcome::Failed {
                    class: ErrorClass::QuotaExceeded,
                    hint: Some(wait),
                };
            }
        };
        if session.begin_request().is_err() {
            self.ctx.limiter.release_submission(&platform, reserved_on);
            return StepOutcome::SessionExhausted;
        }

        match self.entry.adapter.submit(detail, materials, session).await {
            Ok(receipt) => {
                task.confirmation = receipt.confirmation;
                StepOutcome::Done
            }
            Err(err) => {
                self.ctx.limiter.release_submission(&platform, reserved_on);
                debug!(job_id = %task.listing.job_id, error = %err, "submission failed");
                StepOutcome::failed(err.class())
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::testing::{Options, context, platform};
    use super::*;
    use crate::config::PlatformConfig;
    use crate::gateway::GatewayError;
    use crate::platform::{AdapterError, AdapterKind, JobListing, ScriptedAdapter};
    use crate::state_machine::Severity;

    fn queued_task(ctx: &RunContext, job_id: &str) -> ApplicationTask {
        let mut task = ApplicationTask::new(
            JobListing::new("board", job_id, "Rust Engineer", "Acme", "Remote"),
            0.5,
            0,
            ctx.task_limits,
            ctx.task_timeout,
        );
        StateMachine::next(&mut task, StepOutcome::Done);
        task
    }

    #[tokio::test(start_paused = true)]
    async fn runner_happy_path_submits() {
        let (ctx, fx) = context(ScriptedAdapter::new("board"), Options::default());
        let entry = ctx.registry.get(&platform()).unwrap();
        let runner = ApplicationRunner::new(&ctx, entry);
        let mut lease = ctx.pool.checkout(&platform()).await.unwrap();
        let mut task = queued_task(&ctx, "1");

        let t = runner.run(&mut task, &mut lease).await;

        assert_eq!(
            t,
            Transition::Complete {
                state: AppState::Succeeded,
                class: None
            }
        );
        assert_eq!(task.confirmation.as_deref(), Some("board-1"));
        assert_eq!(task.session, Some(lease.id()));
        assert_eq!(fx.adapter.auth_calls(), 1);
        assert_eq!(fx.adapter.submit_calls(), 1);
        assert_eq!(ctx.limiter.submissions_today(&platform()), 1);
        // auth + detail + submit
        assert_eq!(lease.requests(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn authenticated_session_skips_login() {
        let (ctx, fx) = context(ScriptedAdapter::new("board"), Options::default());
        let entry = ctx.registry.get(&platform()).unwrap();
        let runner = ApplicationRunner::new(&ctx, entry);
        let mut lease = ctx.pool.checkout(&platform()).await.unwrap();

        let mut first = queued_task(&ctx, "1");
        runner.run(&mut first, &mut lease).await;
        let mut second = queued_task(&ctx, "2");
        runner.run(&mut second, &mut lease).await;

        assert_eq!(fx.adapter.auth_calls(), 1);
        assert_eq!(second.state, AppState::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn below_threshold_skips_without_content() {
        let opts = Options {
            threshold: 0.99,
            ..Default::default()
        };
        let (ctx, fx) = context(ScriptedAdapter::new("board"), opts);
        let entry = ctx.registry.get(&platform()).unwrap();
        let mut lease = ctx.pool.checkout(&platform()).await.unwrap();
        let mut task = queued_task(&ctx, "1");

        let t = ApplicationRunner::new(&ctx, entry).run(&mut task, &mut lease).await;
        assert!(matches!(t, Transition::Complete { state: AppState::Skipped, .. }));
        assert_eq!(fx.gateway.calls(), 0);
        assert_eq!(fx.adapter.submit_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn requeued_task_reuses_cached_artifacts() {
        let (ctx, fx) = context(ScriptedAdapter::new("board"), Options::default());
        fx.adapter.fail_next_submit(AdapterError::NetworkTransient("reset".into()));
        let entry = ctx.registry.get(&platform()).unwrap();
        let runner = ApplicationRunner::new(&ctx, entry);
        let mut lease = ctx.pool.checkout(&platform()).await.unwrap();
        let mut task = queued_task(&ctx, "1");

        let t = runner.run(&mut task, &mut lease).await;
        assert!(matches!(
            t,
            Transition::Retry { class: ErrorClass::NetworkTransient, attempt: 1, .. }
        ));
        assert_eq!(task.state, AppState::Failed(Severity::Retryable));
        assert_eq!(ctx.limiter.submissions_today(&platform()), 0);
        let gateway_calls = fx.gateway.calls();

        task.requeue(None);
        let t = runner.run(&mut task, &mut lease).await;
        assert!(matches!(t, Transition::Complete { state: AppState::Succeeded, .. }));
        assert_eq!(fx.adapter.detail_calls(), 1);
        assert_eq!(fx.gateway.calls(), gateway_calls);
        assert_eq!(task.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn gateway_rate_limit_carries_hint() {
        let (ctx, fx) = context(ScriptedAdapter::new("board"), Options::default());
        fx.gateway.fail_next(GatewayError::RateLimited {
            retry_after: Some(Duration::from_secs(9)),
        });
        let entry = ctx.registry.get(&platform()).unwrap();
        let mut lease = ctx.pool.checkout(&platform()).await.unwrap();
        let mut task = queued_task(&ctx, "1");

        let t = ApplicationRunner::new(&ctx, entry).run(&mut task, &mut lease).await;
        assert_eq!(
            t,
            Transition::Retry {
                class: ErrorClass::ContentGenerationFailure,
                attempt: 1,
                hint: Some(Duration::from_secs(9))
            }
        );
        assert!(task.materials.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn daily_cap_defers_at_submit() {
        let opts = Options {
            daily_cap: 1,
            ..Default::default()
        };
        let (ctx, fx) = context(ScriptedAdapter::new("board"), opts);
        let entry = ctx.registry.get(&platform()).unwrap();
        let runner = ApplicationRunner::new(&ctx, entry);
        let mut lease = ctx.pool.checkout(&platform()).await.unwrap();

        let mut first = queued_task(&ctx, "1");
        runner.run(&mut first, &mut lease).await;
        let mut second = queued_task(&ctx, "2");
        let t = runner.run(&mut second, &mut lease).await;

        match t {
            Transition::Defer {
                class: Some(ErrorClass::QuotaExceeded),
                hint: Some(hint),
            } => assert!(hint <= Duration::from_secs(24 * 3_600)),
            other => panic!("expected quota deferral, got {other:?}"),
        }
        assert_eq!(second.state, AppState::Queued);
        assert_eq!(second.attempts, 0);
        assert_eq!(fx.adapter.submit_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_session_defers() {
        let opts = Options {
            session_requests: 1,
            ..Default::default()
        };
        let (ctx, _fx) = context(ScriptedAdapter::new("board"), opts);
        let entry = ctx.registry.get(&platform()).unwrap();
        let mut lease = ctx.pool.checkout(&platform()).await.unwrap();
        let mut task = queued_task(&ctx, "1");

        let t = ApplicationRunner::new(&ctx, entry).run(&mut task, &mut lease).await;
        assert_eq!(
            t,
            Transition::Defer {
                class: None,
                hint: None
            }
        );
        assert_eq!(task.state, AppState::Queued);
        assert!(task.detail.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_run_fails_task_between_steps() {
        let (ctx, fx) = context(ScriptedAdapter::new("board"), Options::default());
        ctx.cancel.cancel();
        let entry = ctx.registry.get(&platform()).unwrap();
        let mut lease = ctx.pool.checkout(&platform()).await.unwrap();
        let mut task = queued_task(&ctx, "1");

        let t = ApplicationRunner::new(&ctx, entry).run(&mut task, &mut lease).await;
        assert_eq!(
            t,
            Transition::Complete {
                state: AppState::Failed(Severity::Fatal),
                class: Some(ErrorClass::Cancelled)
            }
        );
        assert_eq!(fx.adapter.auth_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_stops_task_after_current_step() {
        let opts = Options {
            task_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let adapter = ScriptedAdapter::new("board").with_latency(Duration::from_secs(10));
        let (ctx, fx) = context(adapter, opts);
        let entry = ctx.registry.get(&platform()).unwrap();
        let mut lease = ctx.pool.checkout(&platform()).await.unwrap();
        let mut task = queued_task(&ctx, "1");

        let t = ApplicationRunner::new(&ctx, entry).run(&mut task, &mut lease).await;
        assert_eq!(
            t,
            Transition::Complete {
                state: AppState::Failed(Severity::Fatal),
                class: Some(ErrorClass::TimedOut)
            }
        );
        // Login ran to completion; nothing after it started.
        assert_eq!(fx.adapter.auth_calls(), 1);
        assert!(lease.is_authenticated());
        assert_eq!(fx.adapter.detail_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_during_submit_lets_submission_land() {
        let opts = Options {
            task_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        // auth ends at 2s, detail at 4s, submit runs from 4s to 6s.
        let adapter = ScriptedAdapter::new("board").with_latency(Duration::from_secs(2));
        let (ctx, fx) = context(adapter, opts);
        let entry = ctx.registry.get(&platform()).unwrap();
        let mut lease = ctx.pool.checkout(&platform()).await.unwrap();
        let mut task = queued_task(&ctx, "1");

        let t = ApplicationRunner::new(&ctx, entry).run(&mut task, &mut lease).await;
        assert!(task.is_expired(Instant::now()));
        assert_eq!(
            t,
            Transition::Complete {
                state: AppState::Succeeded,
                class: None
            }
        );
        assert_eq!(fx.adapter.submit_calls(), 1);
        assert_eq!(task.confirmation.as_deref(), Some("board-1"));
        assert_eq!(ctx.limiter.submissions_today(&platform()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_submit_past_deadline_releases_daily_cap() {
        let opts = Options {
            task_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let adapter = ScriptedAdapter::new("board").with_latency(Duration::from_secs(2));
        let (ctx, fx) = context(adapter, opts);
        fx.adapter.fail_next_submit(AdapterError::NetworkTransient("reset".into()));
        let entry = ctx.registry.get(&platform()).unwrap();
        let mut lease = ctx.pool.checkout(&platform()).await.unwrap();
        let mut task = queued_task(&ctx, "1");

        let t = ApplicationRunner::new(&ctx, entry).run(&mut task, &mut lease).await;
        assert!(matches!(t, Transition::Retry { class: ErrorClass::NetworkTransient, .. }));
        assert_eq!(ctx.limiter.submissions_today(&platform()), 0);
    }

    #[test]
    fn from_config_builds_scripted_run() {
        let mut config = AutoApplyConfig::default();
        config.platforms.insert(
            "sandbox".into(),
            PlatformConfig {
                kind: AdapterKind::Scripted,
                concurrency: 3,
                ..Default::default()
            },
        );
        let ctx = RunContext::from_config(&config, CancellationToken::new()).unwrap();
        let sandbox = PlatformId::new("sandbox");
        assert_eq!(ctx.registry.len(), 1);
        assert_eq!(ctx.pool.available_slots(&sandbox), 3);
        assert_eq!(ctx.limiter.available(&sandbox), 10);
        assert_eq!(ctx.task_limits.max_retries, 3);
    }

    #[test]
    fn llm_gateway_needs_key() {
        let mut config = AutoApplyConfig::default();
        config.gateway.kind = GatewayKind::Llm;
        config.platforms.insert(
            "sandbox".into(),
            PlatformConfig {
                kind: AdapterKind::Scripted,
                ..Default::default()
            },
        );
        assert!(matches!(
            RunContext::from_config(&config, CancellationToken::new()),
            Err(AutoApplyError::Config(_))
        ));
    }
}
