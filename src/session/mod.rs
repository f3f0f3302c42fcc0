//! Automated browsing sessions.
//!
//! A [`Session`] is one browsing context with a fixed fingerprint, bound to a
//! single platform. The [`SessionPool`] hands sessions out as
//! [`SessionLease`]s and decides when they are destroyed.

pub mod fingerprint;
pub mod pool;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{ACCEPT_LANGUAGE, HeaderMap, HeaderValue};
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

use crate::behavior::{ActionKind, BehaviorSimulator};
use crate::platform::PlatformId;

pub use fingerprint::{
    Fingerprint, NoProxy, ProfileGenerator, ProxyEndpoint, ProxySource, RandomProfileGenerator,
    RotatingProxies, Viewport,
};
pub use pool::{PoolStats, SessionLease, SessionPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to correlate log lines.
        let s = self.0.simple().to_string();
        f.write_str(&s[..8])
    }
}

/// Staleness thresholds: whichever is hit first retires the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    pub max_requests: u32,
    pub max_age: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_requests: 50,
            max_age: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("timed out after {waited:?} waiting for a {platform} session")]
    CheckoutTimeout {
        platform: PlatformId,
        waited: Duration,
    },

    #[error("session {id} is stale after {requests} requests")]
    Exhausted { id: SessionId, requests: u32 },

    #[error("no session slots configured for platform {0}")]
    UnknownPlatform(PlatformId),

    #[error("could not build browsing context: {0}")]
    Context(#[from] reqwest::Error),
}

/// One browsing context, exclusively owned by the task holding its lease.
pub struct Session {
    id: SessionId,
    platform: PlatformId,
    fingerprint: Fingerprint,
    proxy: Option<ProxyEndpoint>,
    created_at: Instant,
    requests: u32,
    limits: SessionLimits,
    authenticated: bool,
    http: reqwest::Client,
    behavior: Arc<BehaviorSimulator>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("platform", &self.platform)
            .field("requests", &self.requests)
            .field("authenticated", &self.authenticated)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Build the browsing context: a cookie-carrying client presenting the
    /// fingerprint's headers, routed through the proxy when one is given.
    pub fn open(
        platform: PlatformId,
        fingerprint: Fingerprint,
        proxy: Option<ProxyEndpoint>,
        limits: SessionLimits,
        behavior: Arc<BehaviorSimulator>,
    ) -> Result<Self, SessionError> {
        let mut headers = HeaderMap::new();
        if let Ok(lang) = HeaderValue::from_str(&fingerprint.accept_language()) {
            headers.insert(ACCEPT_LANGUAGE, lang);
        }
        let mut builder = reqwest::Client::builder()
            .cookie_store(true)
            .user_agent(fingerprint.user_agent.clone())
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30));
        if let Some(proxy) = &proxy {
            builder = builder.proxy(reqwest::Proxy::all(&proxy.url)?);
        }
        let http = builder.build()?;

        Ok(Self {
            id: SessionId::new(),
            platform,
            fingerprint,
            proxy,
            created_at: Instant::now(),
            requests: 0,
            limits,
            authenticated: false,
            http,
            behavior,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn platform(&self) -> &PlatformId {
        &self.platform
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn proxy(&self) -> Option<&ProxyEndpoint> {
        self.proxy.as_ref()
    }

    pub fn requests(&self) -> u32 {
        self.requests
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_stale(&self) -> bool {
        self.requests >= self.limits.max_requests || self.age() >= self.limits.max_age
    }

    /// Count one platform request against the staleness budget.
    ///
    /// Refuses once the session is stale, so a session never serves more
    /// requests than its threshold allows.
    pub fn begin_request(&mut self) -> Result<(), SessionError> {
        if self.is_stale() {
            return Err(SessionError::Exhausted {
                id: self.id,
                requests: self.requests,
            });
        }
        self.requests += 1;
        Ok(())
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn mark_authenticated(&mut self) {
        self.authenticated = true;
    }

    /// The session's browsing context. Adapters must not use any other client.
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Wait out a human-like timing plan for the given action.
    pub async fn pace(&self, action: ActionKind) {
        self.behavior.plan(action).perform().await;
    }
}


#[cfg(test)]
mod tests {
    use super::testing::test_session;
    use super::*;

    #[test]
    fn begin_request_refuses_past_threshold() {
        let mut session = test_session("board", 3);
        for _ in 0..3 {
            session.begin_request().unwrap();
        }
        assert!(session.is_stale());
        let err = session.begin_request().unwrap_err();
        assert!(matches!(err, SessionError::Exhausted { requests: 3, .. }));
        assert_eq!(session.requests(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn session_goes_stale_with_age() {
        let session = test_session("board", 100);
        assert!(!session.is_stale());
        tokio::time::advance(Duration::from_secs(3601)).await;
        assert!(session.is_stale());
    }

    #[test]
    fn session_ids_are_unique() {
        let a = test_session("board", 1);
        let b = test_session("board", 1);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id().to_string().len(), 8);
    }

    #[test]
    fn authentication_flag_sticks() {
        let mut session = test_session("board", 1);
        assert!(!session.is_authenticated());
        session.mark_authenticated();
        assert!(session.is_authenticated());
    }
}
