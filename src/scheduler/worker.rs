//! One scheduling loop per platform.
//!
//! The worker owns the platform's queue and identity table. It dispatches the
//! highest-priority eligible task whenever a concurrency slot and a rate token
//! are both available, and turns each dispatch result into a requeue, a
//! cool-down, a park or a final outcome.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::cooldown::CoolDownTracker;
use super::{EnqueueOutcome, PlatformReport, PlatformSnapshot};
use crate::error::ErrorClass;
use crate::orchestrator::{ApplicationRunner, RunContext};
use crate::platform::{
    AdapterEntry, JobKey, JobListing, ListingStream, PlatformId, SearchCriteria, SearchError,
};
use crate::session::{Session, SessionError, SessionLease};
use crate::state_machine::{
    AppState, ApplicationTask, OutcomeRecord, StateMachine, StepOutcome, Transition,
};

// Pause before retrying a task whose session checkout failed.
const CHECKOUT_RETRY: Duration = Duration::from_secs(5);

pub(crate) enum Command {
    Enqueue {
        listing: JobListing,
        reply: Option<oneshot::Sender<EnqueueOutcome>>,
    },
    DiscoveryDone {
        pages: u32,
        /// The session the platform flagged, if a challenge ended the search.
        detection: Option<SessionLease>,
    },
}

/// Heap entry: higher priority first, then earlier discovery.
struct Ready(ApplicationTask);

impl Ord for Ready {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .priority
            .total_cmp(&other.0.priority)
            .then_with(|| other.0.seq.cmp(&self.0.seq))
    }
}

impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Ready {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ready {}

enum Dispatched {
    Ran {
        task: ApplicationTask,
        transition: Transition,
        lease: SessionLease,
    },
    NoSession {
        task: ApplicationTask,
        error: SessionError,
    },
}

pub(crate) struct PlatformWorker {
    ctx: Arc<RunContext>,
    platform: PlatformId,
    entry: AdapterEntry,
    concurrency: usize,
    commands: mpsc::Receiver<Command>,
    // Kept so discovery can feed listings through the same ordered channel.
    loopback: mpsc::Sender<Command>,
    snapshot: watch::Sender<PlatformSnapshot>,

    seen: HashSet<JobKey>,
    next_seq: u64,
    ready: BinaryHeap<Ready>,
    /// Waiting out a backoff or cool-down.
    waiting: Vec<ApplicationTask>,
    /// Held until the daily cap resets.
    held: Vec<ApplicationTask>,
    /// Needs manual resolution.
    parked: Vec<ApplicationTask>,
    in_flight: JoinSet<Dispatched>,
    quarantines: Vec<Instant>,
    /// No dispatch before this instant (set by a detection outside any task).
    paused_until: Option<Instant>,
    cooldown: CoolDownTracker,
    discovery: Option<JoinHandle<()>>,
    report: PlatformReport,
}

impl PlatformWorker {
    pub(crate) fn new(
        ctx: Arc<RunContext>,
        entry: AdapterEntry,
        commands: mpsc::Receiver<Command>,
        loopback: mpsc::Sender<Command>,
        snapshot: watch::Sender<PlatformSnapshot>,
    ) -> Self {
        let platform = entry.adapter.platform().clone();
        let concurrency = ctx.pool.available_slots(&platform);
        let cooldown = CoolDownTracker::new(ctx.detection);
        Self {
            report: PlatformReport::new(platform.clone()),
            ctx,
            platform,
            entry,
            concurrency,
            commands,
            loopback,
            snapshot,
            seen: HashSet::new(),
            next_seq: 0,
            ready: BinaryHeap::new(),
            waiting: Vec::new(),
            held: Vec::new(),
            parked: Vec::new(),
            in_flight: JoinSet::new(),
            quarantines: Vec::new(),
            paused_until: None,
            cooldown,
            discovery: None,
        }
    }

    pub(crate) async fn run(mut self) -> PlatformReport {
        info!(platform = %self.platform, concurrency = self.concurrency, "platform worker started");
        if let Some(criteria) = self.entry.search.clone() {
            self.start_discovery(criteria);
        }

        loop {
            let now = Instant::now();
            self.promote(now);
            self.expire(now).await;
            self.dispatch(now);
            self.publish();

            let wake = self.next_wake(now);
            let cancel = self.ctx.cancel.clone();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(done) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    match done {
                        Ok(dispatched) => self.settle(dispatched).await,
                        Err(err) => {
                            error!(platform = %self.platform, error = %err, "dispatch task aborted")
                        }
                    }
                }
                Some(command) = self.commands.recv() => self.handle(command),
                _ = sleep_until_opt(wake), if wake.is_some() => {}
            }
        }

        self.shutdown().await
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Enqueue { listing, reply } => {
                let outcome = self.enqueue(listing);
                // Publish before acknowledging so waiters never observe a stale idle state.
                self.publish();
                if let Some(reply) = reply {
                    let _ = reply.send(outcome);
                }
            }
            Command::DiscoveryDone { pages, detection } => {
                self.discovery = None;
                let queued = self.ready.len();
                info!(platform = %self.platform, pages, queued, "discovery finished");
                if let Some(lease) = detection {
                    let cooldown = self.cool_down(lease);
                    self.paused_until = Some(Instant::now() + cooldown);
                    warn!(
                        platform = %self.platform,
                        streak = self.cooldown.streak(),
                        cooldown_secs = cooldown.as_secs(),
                        "detection during discovery, dispatch paused"
                    );
                }
            }
        }
    }

    fn enqueue(&mut self, listing: JobListing) -> EnqueueOutcome {
        let key = listing.key();
        if self.seen.contains(&key) {
            debug!(platform = %self.platform, job_id = %key.job_id, "duplicate listing ignored");
            return EnqueueOutcome::Duplicate;
        }
        self.seen.insert(key);

        let priority = self.ctx.judge.priority(&listing);
        let mut task = ApplicationTask::new(
            listing,
            priority,
            self.next_seq,
            self.ctx.task_limits,
            self.ctx.task_timeout,
        );
        self.next_seq += 1;
        StateMachine::next(&mut task, StepOutcome::Done);
        debug!(
            platform = %self.platform,
            job_id = %task.listing.job_id,
            priority,
            "task queued"
        );
        self.ready.push(Ready(task));
        EnqueueOutcome::Accepted
    }

    /// Move tasks whose wait has elapsed back into the ready heap.
    fn promote(&mut self, now: Instant) {
        for list in [&mut self.waiting, &mut self.held] {
            let (due, still): (Vec<_>, Vec<_>) = std::mem::take(list)
                .into_iter()
                .partition(|t| t.is_eligible(now));
            *list = still;
            self.ready.extend(due.into_iter().map(Ready));
        }
    }

    /// Finalize queued tasks that outlived their lifetime.
    async fn expire(&mut self, now: Instant) {
        let mut expired = Vec::new();
        let ready = std::mem::take(&mut self.ready).into_vec();
        let (gone, keep): (Vec<_>, Vec<_>) = ready.into_iter().partition(|r| r.0.is_expired(now));
        self.ready = keep.into_iter().collect();
        expired.extend(gone.into_iter().map(|r| r.0));
        for list in [&mut self.waiting, &mut self.held, &mut self.parked] {
            let (gone, keep): (Vec<_>, Vec<_>) =
                std::mem::take(list).into_iter().partition(|t| t.is_expired(now));
            *list = keep;
            expired.extend(gone);
        }

        for mut task in expired {
            StateMachine::next(&mut task, StepOutcome::Interrupted(ErrorClass::TimedOut));
            self.finalize(task).await;
        }
    }

    fn capacity(&mut self, now: Instant) -> usize {
        self.quarantines.retain(|until| *until > now);
        let reserved = self.quarantines.len() + usize::from(self.discovery.is_some());
        self.concurrency.saturating_sub(reserved)
    }

    fn dispatch(&mut self, now: Instant) {
        if self.paused(now) {
            return;
        }
        while !self.ready.is_empty() && self.in_flight.len() < self.capacity(now) {
            if !self.ctx.limiter.try_acquire(&self.platform) {
                debug!(platform = %self.platform, "rate budget exhausted, deferring dispatch");
                break;
            }
            let Some(Ready(task)) = self.ready.pop() else {
                break;
            };
            self.spawn(task);
        }
    }

    fn paused(&mut self, now: Instant) -> bool {
        match self.paused_until {
            Some(until) if until > now => true,
            Some(_) => {
                self.paused_until = None;
                false
            }
            None => false,
        }
    }

    fn spawn(&mut self, mut task: ApplicationTask) {
        let ctx = Arc::clone(&self.ctx);
        let entry = self.entry.clone();
        let platform = self.platform.clone();
        self.in_flight.spawn(async move {
            let mut lease = match ctx.pool.checkout(&platform).await {
                Ok(lease) => lease,
                Err(error) => return Dispatched::NoSession { task, error },
            };
            let transition = ApplicationRunner::new(&ctx, &entry)
                .run(&mut task, &mut lease)
                .await;
            Dispatched::Ran {
                task,
                transition,
                lease,
            }
        });
    }

    /// Earliest instant at which the loop has something to do without an event.
    fn next_wake(&mut self, now: Instant) -> Option<Instant> {
        let mut wake: Option<Instant> = None;
        let mut consider = |at: Instant| {
            wake = Some(wake.map_or(at, |w| w.min(at)));
        };

        for task in self.waiting.iter().chain(&self.held) {
            if let Some(at) = task.not_before {
                consider(at);
            }
        }
        for task in self
            .ready
            .iter()
            .map(|r| &r.0)
            .chain(&self.waiting)
            .chain(&self.held)
            .chain(&self.parked)
        {
            consider(task.deadline);
        }
        for until in self.quarantines.iter().chain(&self.paused_until) {
            consider(*until);
        }
        if !self.ready.is_empty() && self.in_flight.len() < self.capacity(now) {
            consider(self.ctx.limiter.next_available(&self.platform));
        }
        wake
    }

    async fn settle(&mut self, dispatched: Dispatched) {
        let now = Instant::now();
        let (mut task, transition, lease) = match dispatched {
            Dispatched::Ran {
                task,
                transition,
                lease,
            } => (task, transition, lease),
            Dispatched::NoSession { mut task, error } => {
                warn!(
                    platform = %self.platform,
                    job_id = %task.listing.job_id,
                    error = %error,
                    "no session available"
                );
                task.requeue(Some(now + CHECKOUT_RETRY));
                self.waiting.push(task);
                return;
            }
        };

        match transition {
            Transition::Complete { state, class } => {
                if class == Some(ErrorClass::DetectionSuspected) {
                    self.detected(lease, &task);
                } else {
                    let healthy = !matches!(class, Some(ErrorClass::LoginFailure));
                    self.ctx.pool.checkin(lease, healthy);
                }
                if state == AppState::Succeeded {
                    self.cooldown.reset();
                }
                self.finalize(task).await;
            }
            Transition::Retry {
                class,
                attempt,
                hint,
            } => {
                self.ctx.pool.checkin(lease, true);
                let delay = self.ctx.retry.backoff(&mut rand::rng(), attempt, hint);
                info!(
                    platform = %self.platform,
                    job_id = %task.listing.job_id,
                    class = %class,
                    attempt,
                    max = task.limits.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "retry scheduled"
                );
                task.requeue(Some(now + delay));
                self.waiting.push(task);
            }
            Transition::CoolDown => {
                let cooldown = self.detected(lease, &task);
                task.requeue(Some(now + cooldown));
                self.waiting.push(task);
            }
            Transition::Park { class } => {
                self.ctx.pool.teardown(lease, None);
                warn!(
                    platform = %self.platform,
                    job_id = %task.listing.job_id,
                    class = %class,
                    "task parked, needs manual resolution"
                );
                task.requeue(None);
                self.parked.push(task);
            }
            Transition::Defer { class, hint } => {
                self.ctx.pool.checkin(lease, true);
                task.requeue(hint.map(|h| now + h));
                match class {
                    Some(ErrorClass::QuotaExceeded) => {
                        info!(
                            platform = %self.platform,
                            job_id = %task.listing.job_id,
                            "held until daily cap resets"
                        );
                        self.held.push(task);
                    }
                    _ => {
                        let job_id = &task.listing.job_id;
                        debug!(platform = %self.platform, job_id = %job_id, "task deferred");
                        self.waiting.push(task);
                    }
                }
            }
            Transition::Next(state) => {
                // The runner only returns once the machine stops advancing.
                warn!(
                    platform = %self.platform,
                    job_id = %task.listing.job_id,
                    state = %state,
                    "dispatch stopped early"
                );
                self.ctx.pool.checkin(lease, true);
                task.requeue(None);
                self.ready.push(Ready(task));
            }
        }
    }

    /// Tear the session down, quarantine its slot and grow the platform cool-down.
    fn cool_down(&mut self, lease: SessionLease) -> Duration {
        let cooldown = self.cooldown.record_detection();
        self.ctx.pool.teardown(lease, Some(cooldown));
        self.quarantines.push(Instant::now() + cooldown);
        if self.cooldown.streak() >= 2 {
            self.ctx.limiter.drain(&self.platform);
        }
        cooldown
    }

    fn detected(&mut self, lease: SessionLease, task: &ApplicationTask) -> Duration {
        let cooldown = self.cool_down(lease);
        warn!(
            platform = %self.platform,
            job_id = %task.listing.job_id,
            streak = self.cooldown.streak(),
            cooldown_secs = cooldown.as_secs(),
            "detection suspected, cooling down"
        );
        cooldown
    }

    async fn finalize(&mut self, task: ApplicationTask) {
        let record = OutcomeRecord::from_task(&task);
        self.report.count(&record);
        match task.state {
            AppState::Failed(_) => warn!(
                platform = %self.platform,
                job_id = %task.listing.job_id,
                class = ?task.last_error,
                attempts = task.attempts,
                "application failed"
            ),
            state => info!(
                platform = %self.platform,
                job_id = %task.listing.job_id,
                state = %state,
                attempts = task.attempts,
                "application finished"
            ),
        }
        if let Err(err) = self.ctx.sink.record(&record).await {
            warn!(
                platform = %self.platform,
                job_id = %record.job_id,
                error = %err,
                "tracking sink write failed"
            );
        }
    }

    fn publish(&self) {
        let mut cooling = self
            .waiting
            .iter()
            .filter(|t| t.last_error == Some(ErrorClass::DetectionSuspected))
            .count();
        if self.paused_until.is_some_and(|until| until > Instant::now()) {
            cooling += self.ready.len();
        }
        let mut by_state = BTreeMap::new();
        for task in self
            .ready
            .iter()
            .map(|r| &r.0)
            .chain(&self.waiting)
            .chain(&self.held)
            .chain(&self.parked)
        {
            *by_state.entry(task.state.to_string()).or_insert(0) += 1;
        }
        self.snapshot.send_replace(PlatformSnapshot {
            platform: self.platform.clone(),
            queued: self.ready.len() + self.waiting.len(),
            cooling_down: cooling,
            held: self.held.len(),
            parked: self.parked.len(),
            in_flight: self.in_flight.len(),
            discovering: self.discovery.is_some(),
            succeeded: self.report.succeeded,
            skipped: self.report.skipped,
            failed: self.report.failed,
            by_state,
        });
    }

    fn start_discovery(&mut self, criteria: SearchCriteria) {
        let ctx = Arc::clone(&self.ctx);
        let entry = self.entry.clone();
        let tx = self.loopback.clone();
        info!(platform = %self.platform, keywords = %criteria.keywords, "discovery started");
        self.discovery = Some(tokio::spawn(async move {
            let (pages, detection) = discover(&ctx, &entry, &criteria, &tx).await;
            let _ = tx.send(Command::DiscoveryDone { pages, detection }).await;
        }));
    }

    async fn shutdown(mut self) -> PlatformReport {
        let in_flight = self.in_flight.len();
        info!(platform = %self.platform, in_flight, "platform worker stopping");
        if let Some(discovery) = self.discovery.take() {
            discovery.abort();
        }
        // In-flight tasks observe the stop signal at their next step boundary.
        while let Some(done) = self.in_flight.join_next().await {
            match done {
                Ok(dispatched) => self.settle(dispatched).await,
                Err(err) => {
                    error!(platform = %self.platform, error = %err, "dispatch task aborted")
                }
            }
        }

        let mut remaining: Vec<ApplicationTask> = std::mem::take(&mut self.ready)
            .into_vec()
            .into_iter()
            .map(|r| r.0)
            .collect();
        remaining.append(&mut self.waiting);
        remaining.append(&mut self.held);
        remaining.append(&mut self.parked);
        for mut task in remaining {
            StateMachine::next(&mut task, StepOutcome::Interrupted(ErrorClass::Cancelled));
            self.finalize(task).await;
        }

        self.report.pool = self.ctx.pool.stats(&self.platform);
        self.publish();
        info!(
            platform = %self.platform,
            succeeded = self.report.succeeded,
            skipped = self.report.skipped,
            failed = self.report.failed,
            "platform worker stopped"
        );
        self.report
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Walk the platform's search on one signed-in session, spending one rate
/// token per page. Returns the pages fetched and, when a challenge ended the
/// search, the flagged session.
async fn discover(
    ctx: &RunContext,
    entry: &AdapterEntry,
    criteria: &SearchCriteria,
    tx: &mpsc::Sender<Command>,
) -> (u32, Option<SessionLease>) {
    let platform = entry.adapter.platform().clone();
    let mut lease = match ctx.pool.checkout(&platform).await {
        Ok(lease) => lease,
        Err(err) => {
            warn!(platform = %platform, error = %err, "discovery could not get a session");
            return (0, None);
        }
    };
    let mut stream = ListingStream::new(entry.adapter.as_ref(), criteria);

    loop {
        if stream.needs_fetch() {
            while !ctx.limiter.try_acquire(&platform) {
                let at = ctx.limiter.next_available(&platform);
                tokio::select! {
                    _ = ctx.cancel.cancelled() => {
                        ctx.pool.checkin(lease, true);
                        return (stream.pages_fetched(), None);
                    }
                    _ = tokio::time::sleep_until(at) => {}
                }
            }
        }
        if ctx.cancel.is_cancelled() {
            break;
        }

        let next = match sign_in(entry, &mut lease).await {
            Ok(()) => stream.next(&mut lease).await,
            Err(err) => Some(Err(err)),
        };
        match next {
            None => break,
            Some(Ok(listing)) => {
                let command = Command::Enqueue {
                    listing,
                    reply: None,
                };
                if tx.send(command).await.is_err() {
                    break;
                }
            }
            Some(Err(SearchError::Session(SessionError::Exhausted { .. }))) => {
                // Continue from the stream's cursor on a fresh session.
                ctx.pool.checkin(lease, true);
                lease = match ctx.pool.checkout(&platform).await {
                    Ok(lease) => lease,
                    Err(err) => {
                        warn!(platform = %platform, error = %err, "discovery lost its session");
                        return (stream.pages_fetched(), None);
                    }
                };
            }
            Some(Err(SearchError::Session(err))) => {
                warn!(platform = %platform, error = %err, "discovery session failed");
                break;
            }
            Some(Err(SearchError::Adapter(err))) => {
                let detection = matches!(
                    err.class(),
                    ErrorClass::DetectionSuspected | ErrorClass::CaptchaRequired
                );
                warn!(
                    platform = %platform,
                    class = %err.class(),
                    error = %err,
                    pages = stream.pages_fetched(),
                    "discovery stopped"
                );
                if detection {
                    return (stream.pages_fetched(), Some(lease));
                }
                let healthy = err.class() != ErrorClass::LoginFailure;
                ctx.pool.checkin(lease, healthy);
                return (stream.pages_fetched(), None);
            }
        }
    }

    ctx.pool.checkin(lease, true);
    (stream.pages_fetched(), None)
}

/// Log in once per session, counting the request like any other.
async fn sign_in(entry: &AdapterEntry, session: &mut Session) -> Result<(), SearchError> {
    if session.is_authenticated() {
        return Ok(());
    }
    session.begin_request()?;
    entry
        .adapter
        .authenticate(&entry.credentials, session)
        .await?;
    Ok(())
}
