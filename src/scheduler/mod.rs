//! Coordinates one worker per active platform.
//!
//! Workers share nothing mutable except the rate limiter and the session pool
//! inside the [`RunContext`]. The [`SchedulerHandle`] routes listings to the
//! owning worker and exposes each worker's latest [`PlatformSnapshot`].

mod cooldown;
mod worker;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::error::{AutoApplyError, ErrorClass};
use crate::orchestrator::RunContext;
use crate::platform::{JobListing, PlatformId};
use crate::session::PoolStats;
use crate::state_machine::{FinalState, OutcomeRecord};

pub use cooldown::CoolDownTracker;
use worker::{Command, PlatformWorker};

const COMMAND_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Accepted,
    /// The listing was already seen during this run.
    Duplicate,
}

/// Point-in-time view of one platform worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlatformSnapshot {
    pub platform: PlatformId,
    /// Ready or waiting out a backoff or cool-down.
    pub queued: usize,
    pub cooling_down: usize,
    /// Held until the daily submission cap resets.
    pub held: usize,
    pub parked: usize,
    pub in_flight: usize,
    pub discovering: bool,
    pub succeeded: u32,
    pub skipped: u32,
    pub failed: u32,
    /// Non-terminal tasks per lifecycle state.
    pub by_state: BTreeMap<String, usize>,
}

impl PlatformSnapshot {
    fn starting(platform: PlatformId, discovering: bool) -> Self {
        Self {
            platform,
            discovering,
            ..Default::default()
        }
    }

    /// Nothing left that can make progress on its own. Parked tasks and tasks
    /// held by the daily cap do not count.
    pub fn is_idle(&self) -> bool {
        self.queued == 0 && self.in_flight == 0 && !self.discovering
    }

    pub fn finished(&self) -> u32 {
        self.succeeded + self.skipped + self.failed
    }
}

/// Final counts of one platform.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PlatformReport {
    pub platform: PlatformId,
    pub succeeded: u32,
    pub skipped: u32,
    pub failed: u32,
    pub by_class: BTreeMap<ErrorClass, u32>,
    pub pool: PoolStats,
}

impl PlatformReport {
    fn new(platform: PlatformId) -> Self {
        Self {
            platform,
            ..Default::default()
        }
    }

    fn count(&mut self, record: &OutcomeRecord) {
        match record.final_state {
            FinalState::Succeeded => self.succeeded += 1,
            FinalState::Skipped => self.skipped += 1,
            FinalState::Failed => self.failed += 1,
        }
        if let Some(class) = record.error {
            *self.by_class.entry(class).or_insert(0) += 1;
        }
    }
}

/// What a run produced, per platform and overall.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub platforms: BTreeMap<PlatformId, PlatformReport>,
}

impl RunSummary {
    pub fn total(&self, state: FinalState) -> u32 {
        self.platforms
            .values()
            .map(|p| match state {
                FinalState::Succeeded => p.succeeded,
                FinalState::Skipped => p.skipped,
                FinalState::Failed => p.failed,
            })
            .sum()
    }

    pub fn by_class(&self) -> BTreeMap<ErrorClass, u32> {
        let mut out = BTreeMap::new();
        for report in self.platforms.values() {
            for (class, n) in &report.by_class {
                *out.entry(*class).or_insert(0) += n;
            }
        }
        out
    }
}

#[derive(Clone)]
pub struct SchedulerHandle {
    senders: Arc<HashMap<PlatformId, mpsc::Sender<Command>>>,
    snapshots: Arc<HashMap<PlatformId, watch::Receiver<PlatformSnapshot>>>,
}

impl SchedulerHandle {
    /// Hand a listing to its platform's worker.
    pub async fn enqueue(&self, listing: JobListing) -> Result<EnqueueOutcome, AutoApplyError> {
        let sender = self
            .senders
            .get(&listing.platform)
            .ok_or_else(|| AutoApplyError::InactivePlatform(listing.platform.clone()))?;
        let (reply, ack) = oneshot::channel();
        sender
            .send(Command::Enqueue {
                listing,
                reply: Some(reply),
            })
            .await
            .map_err(|_| AutoApplyError::SchedulerClosed)?;
        ack.await.map_err(|_| AutoApplyError::SchedulerClosed)
    }

    pub fn snapshot(&self, platform: &PlatformId) -> Option<PlatformSnapshot> {
        self.snapshots.get(platform).map(|rx| rx.borrow().clone())
    }

    pub fn snapshots(&self) -> Vec<PlatformSnapshot> {
        let mut all: Vec<_> = self.snapshots.values().map(|rx| rx.borrow().clone()).collect();
        all.sort_by(|a, b| a.platform.cmp(&b.platform));
        all
    }

    /// Resolves once every platform is idle.
    pub async fn wait_idle(&self) {
        for rx in self.snapshots.values() {
            let mut rx = rx.clone();
            // A closed channel means the worker is gone, which is idle enough.
            let _ = rx.wait_for(PlatformSnapshot::is_idle).await;
        }
    }
}

pub struct Scheduler {
    ctx: Arc<RunContext>,
    handle: SchedulerHandle,
    workers: Vec<(PlatformId, JoinHandle<PlatformReport>)>,
}

impl Scheduler {
    /// Spawn one worker per registered platform.
    pub fn start(ctx: Arc<RunContext>) -> Self {
        let mut senders = HashMap::new();
        let mut snapshots = HashMap::new();
        let mut workers = Vec::new();

        for platform in ctx.registry.platforms() {
            let Some(entry) = ctx.registry.get(platform) else {
                continue;
            };
            let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
            let starting = PlatformSnapshot::starting(platform.clone(), entry.search.is_some());
            let (snap_tx, snap_rx) = watch::channel(starting);
            let worker =
                PlatformWorker::new(Arc::clone(&ctx), entry.clone(), rx, tx.clone(), snap_tx);
            workers.push((platform.clone(), tokio::spawn(worker.run())));
            senders.insert(platform.clone(), tx);
            snapshots.insert(platform.clone(), snap_rx);
        }
        info!(platforms = workers.len(), "scheduler started");

        Self {
            ctx,
            handle: SchedulerHandle {
                senders: Arc::new(senders),
                snapshots: Arc::new(snapshots),
            },
            workers,
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    pub async fn wait_idle(&self) {
        self.handle.wait_idle().await;
    }

    /// Raise the stop signal, let in-flight tasks wind down and collect the
    /// per-platform reports.
    pub async fn shutdown(self) -> RunSummary {
        self.ctx.cancel.cancel();
        let mut summary = RunSummary::default();
        for (platform, worker) in self.workers {
            match worker.await {
                Ok(report) => {
                    summary.platforms.insert(platform, report);
                }
                Err(err) => error!(platform = %platform, error = %err, "platform worker crashed"),
            }
        }
        info!(
            succeeded = summary.total(FinalState::Succeeded),
            skipped = summary.total(FinalState::Skipped),
            failed = summary.total(FinalState::Failed),
            "scheduler stopped"
        );
        summary
    }
}
