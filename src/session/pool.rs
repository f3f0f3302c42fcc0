//! Per-platform session pool.
//!
//! Each platform gets a semaphore sized to its concurrency cap and a free list
//! of idle sessions. A checked-out session travels inside a [`SessionLease`]
//! together with its semaphore permit, so a session cannot be handed to two
//! tasks at once and the slot is released exactly when the lease is consumed.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use super::{ProfileGenerator, ProxySource, Session, SessionError, SessionLimits};
use crate::behavior::BehaviorSimulator;
use crate::platform::PlatformId;

struct PlatformSlots {
    platform: PlatformId,
    permits: Arc<Semaphore>,
    free: Mutex<Vec<Session>>,
    created: AtomicU64,
    destroyed: AtomicU64,
}

impl PlatformSlots {
    fn free(&self) -> MutexGuard<'_, Vec<Session>> {
        self.free.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn destroy(&self, session: Session, reason: &str) {
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        debug!(
            platform = %self.platform,
            session = %session.id(),
            requests = session.requests(),
            reason,
            "session destroyed"
        );
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub created: u64,
    pub destroyed: u64,
    pub free: usize,
    pub available_slots: usize,
}

pub struct SessionPool {
    slots: HashMap<PlatformId, Arc<PlatformSlots>>,
    profiles: Arc<dyn ProfileGenerator>,
    proxies: Arc<dyn ProxySource>,
    behavior: Arc<BehaviorSimulator>,
    limits: SessionLimits,
    checkout_timeout: Duration,
}

impl SessionPool {
    /// `caps` maps each active platform to its concurrency cap.
    pub fn new(
        caps: impl IntoIterator<Item = (PlatformId, usize)>,
        profiles: Arc<dyn ProfileGenerator>,
        proxies: Arc<dyn ProxySource>,
        behavior: Arc<BehaviorSimulator>,
        limits: SessionLimits,
        checkout_timeout: Duration,
    ) -> Self {
        let slots = caps
            .into_iter()
            .map(|(platform, cap)| {
                let slots = PlatformSlots {
                    platform: platform.clone(),
                    permits: Arc::new(Semaphore::new(cap)),
                    free: Mutex::new(Vec::with_capacity(cap)),
                    created: AtomicU64::new(0),
                    destroyed: AtomicU64::new(0),
                };
                (platform, Arc::new(slots))
            })
            .collect();
        Self {
            slots,
            profiles,
            proxies,
            behavior,
            limits,
            checkout_timeout,
        }
    }

    fn platform_slots(&self, platform: &PlatformId) -> Result<&Arc<PlatformSlots>, SessionError> {
        self.slots
            .get(platform)
            .ok_or_else(|| SessionError::UnknownPlatform(platform.clone()))
    }

    /// Hand out a free session for `platform`, or open a new one.
    ///
    /// Waits for a concurrency slot up to the configured checkout timeout.
    /// Idle sessions that went stale while parked are destroyed here.
    pub async fn checkout(&self, platform: &PlatformId) -> Result<SessionLease, SessionError> {
        let slots = Arc::clone(self.platform_slots(platform)?);
        let acquire = Arc::clone(&slots.permits).acquire_owned();
        let permit = tokio::time::timeout(self.checkout_timeout, acquire)
            .await
            .map_err(|_| SessionError::CheckoutTimeout {
                platform: platform.clone(),
                waited: self.checkout_timeout,
            })?
            .map_err(|_| SessionError::UnknownPlatform(platform.clone()))?;

        let reused = {
            let mut free = slots.free();
            let mut found = None;
            while let Some(session) = free.pop() {
                if session.is_stale() {
                    slots.destroy(session, "stale while idle");
                } else {
                    found = Some(session);
                    break;
                }
            }
            found
        };

        let session = match reused {
            Some(session) => session,
            None => {
                let session = Session::open(
                    platform.clone(),
                    self.profiles.generate(),
                    self.proxies.next_proxy(),
                    self.limits,
                    Arc::clone(&self.behavior),
                )?;
                let warmup = self.behavior.warmup_delay(&mut rand::rng());
                tokio::time::sleep(warmup).await;
                slots.created.fetch_add(1, Ordering::Relaxed);
                debug!(
                    platform = %platform,
                    session = %session.id(),
                    user_agent = %session.fingerprint().user_agent,
                    proxy = session.proxy().map_or("direct", |p| p.url.as_str()),
                    "session opened"
                );
                session
            }
        };

        Ok(SessionLease {
            session: Some(session),
            permit: Some(permit),
            slots,
        })
    }

    /// Return a session. Healthy, non-stale sessions go back to the free list;
    /// everything else is destroyed.
    pub fn checkin(&self, mut lease: SessionLease, healthy: bool) {
        let Some(session) = lease.session.take() else {
            return;
        };
        if !healthy {
            lease.slots.destroy(session, "unhealthy");
        } else if session.is_stale() {
            lease.slots.destroy(session, "stale");
        } else {
            lease.slots.free().push(session);
        }
    }

    /// Destroy a session immediately. With a quarantine, the concurrency slot
    /// stays taken until the quarantine elapses.
    pub fn teardown(&self, mut lease: SessionLease, quarantine: Option<Duration>) {
        if let Some(session) = lease.session.take() {
            lease.slots.destroy(session, "teardown");
        }
        let permit = lease.permit.take();
        if let (Some(permit), Some(hold)) = (permit, quarantine) {
            info!(
                platform = %lease.slots.platform,
                quarantine_secs = hold.as_secs(),
                "session slot quarantined"
            );
            tokio::spawn(async move {
                tokio::time::sleep(hold).await;
                drop(permit);
            });
        }
    }

    pub fn available_slots(&self, platform: &PlatformId) -> usize {
        self.slots
            .get(platform)
            .map(|s| s.permits.available_permits())
            .unwrap_or(0)
    }

    pub fn stats(&self, platform: &PlatformId) -> PoolStats {
        let Some(slots) = self.slots.get(platform) else {
            return PoolStats::default();
        };
        PoolStats {
            created: slots.created.load(Ordering::Relaxed),
            destroyed: slots.destroyed.load(Ordering::Relaxed),
            free: slots.free().len(),
            available_slots: slots.permits.available_permits(),
        }
    }
}

/// Exclusive ownership of a checked-out session and its concurrency slot.
///
/// Dropping a lease without returning it destroys the session and frees the
/// slot.
pub struct SessionLease {
    session: Option<Session>,
    permit: Option<OwnedSemaphorePermit>,
    slots: Arc<PlatformSlots>,
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease")
            .field("active", &self.session.is_some())
            .finish_non_exhaustive()
    }
}

impl Deref for SessionLease {
    type Target = Session;

    fn deref(&self) -> &Session {
        match &self.session {
            Some(session) => session,
            // The session is only taken while the lease is being consumed.
            None => unreachable!("session lease used after release"),
        }
    }
}

impl DerefMut for SessionLease {
    fn deref_mut(&mut self) -> &mut Session {
        match &mut self.session {
            Some(session) => session,
            None => unreachable!("session lease used after release"),
        }
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.slots.destroy(session, "lease dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::BehaviorConfig;
    use crate::session::{NoProxy, ProxyEndpoint, RandomProfileGenerator, RotatingProxies};

    fn pool(cap: usize, max_requests: u32) -> SessionPool {
        SessionPool::new(
            [(PlatformId::new("board"), cap)],
            Arc::new(RandomProfileGenerator),
            Arc::new(NoProxy),
            Arc::new(BehaviorSimulator::new(BehaviorConfig::instant())),
            SessionLimits {
                max_requests,
                max_age: Duration::from_secs(600),
            },
            Duration::from_secs(5),
        )
    }

    fn board() -> PlatformId {
        PlatformId::new("board")
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_session_is_reused() {
        let pool = pool(2, 10);
        let lease = pool.checkout(&board()).await.unwrap();
        let id = lease.id();
        pool.checkin(lease, true);

        let again = pool.checkout(&board()).await.unwrap();
        assert_eq!(again.id(), id);
        assert_eq!(pool.stats(&board()).created, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn replacement_sessions_rotate_proxies() {
        let proxies = ["http://10.0.0.1:8080", "http://10.0.0.2:8080"]
            .map(|url| ProxyEndpoint { url: url.into() })
            .to_vec();
        let pool = SessionPool::new(
            [(board(), 1)],
            Arc::new(RandomProfileGenerator),
            Arc::new(RotatingProxies::new(proxies)),
            Arc::new(BehaviorSimulator::new(BehaviorConfig::instant())),
            SessionLimits::default(),
            Duration::from_secs(5),
        );

        let lease = pool.checkout(&board()).await.unwrap();
        assert_eq!(lease.proxy().unwrap().url, "http://10.0.0.1:8080");
        let agent = lease.fingerprint().user_agent.clone();
        pool.checkin(lease, true);

        // A reused session keeps its identity.
        let lease = pool.checkout(&board()).await.unwrap();
        assert_eq!(lease.fingerprint().user_agent, agent);
        assert_eq!(lease.proxy().unwrap().url, "http://10.0.0.1:8080");
        pool.checkin(lease, false);

        let lease = pool.checkout(&board()).await.unwrap();
        assert_eq!(lease.proxy().unwrap().url, "http://10.0.0.2:8080");
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_session_is_destroyed() {
        let pool = pool(2, 10);
        let lease = pool.checkout(&board()).await.unwrap();
        let id = lease.id();
        pool.checkin(lease, false);

        let fresh = pool.checkout(&board()).await.unwrap();
        assert_ne!(fresh.id(), id);
        let stats = pool.stats(&board());
        assert_eq!(stats.created, 2);
        assert_eq!(stats.destroyed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn session_is_retired_at_request_threshold() {
        let pool = pool(1, 3);
        let mut lease = pool.checkout(&board()).await.unwrap();
        let id = lease.id();
        for _ in 0..3 {
            lease.begin_request().unwrap();
        }
        assert!(lease.begin_request().is_err());
        pool.checkin(lease, true);

        let next = pool.checkout(&board()).await.unwrap();
        assert_ne!(next.id(), id);
        assert_eq!(next.requests(), 0);
        assert_eq!(pool.stats(&board()).destroyed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn checkout_times_out_when_saturated() {
        let pool = pool(1, 10);
        let _held = pool.checkout(&board()).await.unwrap();
        let err = pool.checkout(&board()).await.unwrap_err();
        assert!(matches!(err, SessionError::CheckoutTimeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_checkout_gets_released_slot() {
        let pool = Arc::new(pool(1, 10));
        let held = pool.checkout(&board()).await.unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.checkout(&board()).await.map(|l| l.id()) })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        let id = held.id();
        pool.checkin(held, true);
        assert_eq!(waiter.await.unwrap().unwrap(), id);
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_with_quarantine_withholds_slot() {
        let pool = pool(2, 10);
        let lease = pool.checkout(&board()).await.unwrap();
        assert_eq!(pool.available_slots(&board()), 1);

        pool.teardown(lease, Some(Duration::from_secs(30)));
        tokio::task::yield_now().await;
        assert_eq!(pool.available_slots(&board()), 1);
        assert_eq!(pool.stats(&board()).destroyed, 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(pool.available_slots(&board()), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_lease_frees_slot() {
        let pool = pool(1, 10);
        {
            let _lease = pool.checkout(&board()).await.unwrap();
            assert_eq!(pool.available_slots(&board()), 0);
        }
        assert_eq!(pool.available_slots(&board()), 1);
        assert_eq!(pool.stats(&board()).destroyed, 1);
    }

    #[tokio::test]
    async fn unknown_platform_is_rejected() {
        let pool = pool(1, 10);
        let err = pool.checkout(&PlatformId::new("nowhere")).await.unwrap_err();
        assert!(matches!(err, SessionError::UnknownPlatform(_)));
    }
}
