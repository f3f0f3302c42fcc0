//! Request and submission budgets.
//!
//! Each platform has a token bucket, and one global bucket sits on top. A
//! spent token comes back one window after it was spent, so the refill is
//! continuous and no rolling window ever sees more than `capacity`
//! acquisitions. Acquiring is all-or-nothing across both buckets.
//!
//! Daily submission caps are separate counters keyed by the UTC date.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::platform::PlatformId;

// Tokens return strictly after the window; the margin keeps sleeps from
// waking exactly on the boundary.
const RETURN_MARGIN: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketConfig {
    pub capacity: u32,
    pub window: Duration,
}

#[derive(Debug)]
struct Bucket {
    config: BucketConfig,
    spent: VecDeque<Instant>,
}

impl Bucket {
    fn new(config: BucketConfig) -> Self {
        Self {
            config,
            spent: VecDeque::with_capacity(config.capacity as usize),
        }
    }

    fn refill(&mut self, now: Instant) {
        while let Some(&oldest) = self.spent.front() {
            if now.duration_since(oldest) > self.config.window {
                self.spent.pop_front();
            } else {
                break;
            }
        }
    }

    fn available(&self) -> u32 {
        self.config.capacity.saturating_sub(self.spent.len() as u32)
    }

    fn next_token_at(&self, now: Instant) -> Instant {
        if self.available() > 0 {
            return now;
        }
        match self.spent.front() {
            Some(&oldest) => oldest + self.config.window + RETURN_MARGIN,
            None => now,
        }
    }

    fn spend(&mut self, now: Instant) {
        self.spent.push_back(now);
    }

    fn drain(&mut self, now: Instant) {
        while self.spent.len() < self.config.capacity as usize {
            self.spent.push_back(now);
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct DailyCounter {
    cap: u32,
    date: NaiveDate,
    count: u32,
}

impl DailyCounter {
    fn new(cap: u32) -> Self {
        Self {
            cap,
            date: NaiveDate::MIN,
            count: 0,
        }
    }

    fn roll(&mut self, today: NaiveDate) {
        if self.date != today {
            self.date = today;
            self.count = 0;
        }
    }

    fn has_room(&self) -> bool {
        self.count < self.cap
    }

    fn release(&mut self, reserved_on: NaiveDate) {
        if self.date == reserved_on {
            self.count = self.count.saturating_sub(1);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaScope {
    Platform,
    Global,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("daily {scope:?} submission cap reached, resets at {resets_at}")]
pub struct QuotaExceeded {
    pub scope: QuotaScope,
    pub resets_at: DateTime<Utc>,
}

/// Per-platform limits handed to [`RateLimiter::new`].
#[derive(Debug, Clone, Copy)]
pub struct PlatformBudget {
    pub bucket: BucketConfig,
    pub daily_submission_cap: u32,
}

struct Inner {
    platforms: HashMap<PlatformId, (Bucket, DailyCounter)>,
    global: Bucket,
    global_daily: DailyCounter,
}

/// Shared by every platform worker; all operations are short and synchronous.
pub struct RateLimiter {
    inner: Mutex<Inner>,
}

impl RateLimiter {
    pub fn new(
        platforms: impl IntoIterator<Item = (PlatformId, PlatformBudget)>,
        global: BucketConfig,
        global_daily_submission_cap: u32,
    ) -> Self {
        let platforms = platforms
            .into_iter()
            .map(|(id, budget)| {
                (
                    id,
                    (
                        Bucket::new(budget.bucket),
                        DailyCounter::new(budget.daily_submission_cap),
                    ),
                )
            })
            .collect();
        Self {
            inner: Mutex::new(Inner {
                platforms,
                global: Bucket::new(global),
                global_daily: DailyCounter::new(global_daily_submission_cap),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take one token from both the platform and the global bucket, or none.
    pub fn try_acquire(&self, platform: &PlatformId) -> bool {
        let now = Instant::now();
        let mut inner = self.lock();
        let Inner {
            platforms, global, ..
        } = &mut *inner;
        let Some((bucket, _)) = platforms.get_mut(platform) else {
            return false;
        };
        bucket.refill(now);
        global.refill(now);
        if bucket.available() == 0 || global.available() == 0 {
            return false;
        }
        bucket.spend(now);
        global.spend(now);
        true
    }

    /// Tokens currently available to `platform`, counting the global bucket.
    pub fn available(&self, platform: &PlatformId) -> u32 {
        let now = Instant::now();
        let mut inner = self.lock();
        let Inner {
            platforms, global, ..
        } = &mut *inner;
        let Some((bucket, _)) = platforms.get_mut(platform) else {
            return 0;
        };
        bucket.refill(now);
        global.refill(now);
        bucket.available().min(global.available())
    }

    /// Earliest instant at which `try_acquire` can succeed.
    pub fn next_available(&self, platform: &PlatformId) -> Instant {
        let now = Instant::now();
        let mut inner = self.lock();
        let Inner {
            platforms, global, ..
        } = &mut *inner;
        let Some((bucket, _)) = platforms.get_mut(platform) else {
            return now;
        };
        bucket.refill(now);
        global.refill(now);
        bucket.next_token_at(now).max(global.next_token_at(now))
    }

    /// Zero the platform's budget. Tokens return on the usual schedule.
    pub fn drain(&self, platform: &PlatformId) {
        let now = Instant::now();
        let mut inner = self.lock();
        if let Some((bucket, _)) = inner.platforms.get_mut(platform) {
            bucket.refill(now);
            bucket.drain(now);
            warn!(platform = %platform, "rate budget drained");
        }
    }

    /// Count one submission against today's caps, or refuse. Returns the
    /// day the reservation was counted against.
    pub fn reserve_submission(&self, platform: &PlatformId) -> Result<NaiveDate, QuotaExceeded> {
        self.reserve_submission_on(platform, Utc::now().date_naive())
    }

    pub fn reserve_submission_on(
        &self,
        platform: &PlatformId,
        today: NaiveDate,
    ) -> Result<NaiveDate, QuotaExceeded> {
        let mut inner = self.lock();
        let Inner {
            platforms,
            global_daily,
            ..
        } = &mut *inner;
        let resets_at = next_reset(today);
        let Some((_, daily)) = platforms.get_mut(platform) else {
            return Err(QuotaExceeded {
                scope: QuotaScope::Platform,
                resets_at,
            });
        };
        daily.roll(today);
        global_daily.roll(today);
        if !daily.has_room() {
            return Err(QuotaExceeded {
                scope: QuotaScope::Platform,
                resets_at,
            });
        }
        if !global_daily.has_room() {
            return Err(QuotaExceeded {
                scope: QuotaScope::Global,
                resets_at,
            });
        }
        daily.count += 1;
        global_daily.count += 1;
        debug!(platform = %platform, today = daily.count, "submission reserved");
        Ok(today)
    }

    /// Give back a reservation whose submission did not go through. A
    /// counter that already rolled past `reserved_on` is left alone.
    pub fn release_submission(&self, platform: &PlatformId, reserved_on: NaiveDate) {
        let mut inner = self.lock();
        let Inner {
            platforms,
            global_daily,
            ..
        } = &mut *inner;
        if let Some((_, daily)) = platforms.get_mut(platform) {
            daily.release(reserved_on);
            global_daily.release(reserved_on);
        }
    }

    #[cfg(test)]
    pub(crate) fn submissions_today(&self, platform: &PlatformId) -> u32 {
        let today = Utc::now().date_naive();
        let inner = self.lock();
        inner
            .platforms
            .get(platform)
            .filter(|(_, d)| d.date == today)
            .map(|(_, d)| d.count)
            .unwrap_or(0)
    }
}

/// Midnight UTC following `today`.
pub fn next_reset(today: NaiveDate) -> DateTime<Utc> {
    today
        .succ_opt()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
