//! Fingerprint profiles and proxy sources for new sessions.

use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// The observable browser properties a session presents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub user_agent: String,
    pub viewport: Viewport,
    pub locale: String,
    pub timezone: String,
}

impl Fingerprint {
    /// `Accept-Language` value matching the locale, e.g. `en-GB,en;q=0.9`.
    pub fn accept_language(&self) -> String {
        match self.locale.split_once('-') {
            Some((lang, _)) => format!("{},{lang};q=0.9", self.locale),
            None => self.locale.clone(),
        }
    }

    #[cfg(test)]
    pub(crate) fn fixed() -> Self {
        Self {
            user_agent: WINDOWS_AGENTS[0].to_string(),
            viewport: Viewport {
                width: 1920,
                height: 1080,
            },
            locale: "en-US".into(),
            timezone: "America/New_York".into(),
        }
    }
}

/// Supplies a fingerprint for each new session.
pub trait ProfileGenerator: Send + Sync {
    fn generate(&self) -> Fingerprint;
}

const WINDOWS_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/118.0.0.0 Safari/537.36",
];

const MAC_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
];

const LINUX_AGENTS: &[&str] = &[
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
];

const WINDOWS_VIEWPORTS: &[(u32, u32)] = &[(1920, 1080), (1366, 768), (1536, 864), (1280, 720)];
const MAC_VIEWPORTS: &[(u32, u32)] = &[(1440, 900), (1680, 1050), (2560, 1440)];
const LINUX_VIEWPORTS: &[(u32, u32)] = &[(1920, 1080), (1280, 720)];

const LOCALES: &[(&str, &str)] = &[
    ("en-US", "America/New_York"),
    ("en-US", "America/Chicago"),
    ("en-US", "America/Los_Angeles"),
    ("en-GB", "Europe/London"),
    ("en-CA", "America/Toronto"),
];

/// Picks an OS family first, then a user agent and screen size that belong to
/// it, so the pieces of a fingerprint stay mutually consistent.
#[derive(Debug, Clone, Default)]
pub struct RandomProfileGenerator;

impl ProfileGenerator for RandomProfileGenerator {
    fn generate(&self) -> Fingerprint {
        let mut rng = rand::rng();
        let (agents, viewports) = match rng.random_range(0..10) {
            0..=5 => (WINDOWS_AGENTS, WINDOWS_VIEWPORTS),
            6..=8 => (MAC_AGENTS, MAC_VIEWPORTS),
            _ => (LINUX_AGENTS, LINUX_VIEWPORTS),
        };
        let user_agent = agents.choose(&mut rng).copied().unwrap_or(WINDOWS_AGENTS[0]);
        let (width, height) = viewports.choose(&mut rng).copied().unwrap_or((1920, 1080));
        let (locale, timezone) = LOCALES
            .choose(&mut rng)
            .copied()
            .unwrap_or(("en-US", "America/New_York"));
        Fingerprint {
            user_agent: user_agent.to_string(),
            viewport: Viewport { width, height },
            locale: locale.to_string(),
            timezone: timezone.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProxyEndpoint {
    pub url: String,
}

/// Supplies the proxy, if any, for each new session.
pub trait ProxySource: Send + Sync {
    fn next_proxy(&self) -> Option<ProxyEndpoint>;
}

#[derive(Debug, Clone, Default)]
pub struct NoProxy;

impl ProxySource for NoProxy {
    fn next_proxy(&self) -> Option<ProxyEndpoint> {
        None
    }
}

/// Round-robin over a fixed proxy list.
#[derive(Debug)]
pub struct RotatingProxies {
    proxies: Vec<ProxyEndpoint>,
    next: AtomicUsize,
}

impl RotatingProxies {
    pub fn new(proxies: Vec<ProxyEndpoint>) -> Self {
        Self {
            proxies,
            next: AtomicUsize::new(0),
        }
    }
}

impl ProxySource for RotatingProxies {
    fn next_proxy(&self) -> Option<ProxyEndpoint> {
        if self.proxies.is_empty() {
            return None;
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.proxies.len();
        Some(self.proxies[i].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_profiles_are_consistent() {
        let generator = RandomProfileGenerator;
        for _ in 0..200 {
            let fp = generator.generate();
            let size = (fp.viewport.width, fp.viewport.height);
            if fp.user_agent.contains("Macintosh") {
                assert!(MAC_VIEWPORTS.contains(&size));
            } else if fp.user_agent.contains("Windows") {
                assert!(WINDOWS_VIEWPORTS.contains(&size));
            } else {
                assert!(LINUX_VIEWPORTS.contains(&size));
            }
            assert!(LOCALES.contains(&(fp.locale.as_str(), fp.timezone.as_str())));
        }
    }

    #[test]
    fn accept_language_from_locale() {
        let mut fp = Fingerprint::fixed();
        assert_eq!(fp.accept_language(), "en-US,en;q=0.9");
        fp.locale = "de".into();
        assert_eq!(fp.accept_language(), "de");
    }

    #[test]
    fn rotating_proxies_cycle() {
        let source = RotatingProxies::new(vec![
            ProxyEndpoint {
                url: "http://p1:8080".into(),
            },
            ProxyEndpoint {
                url: "http://p2:8080".into(),
            },
        ]);
        let urls: Vec<String> = (0..4).filter_map(|_| source.next_proxy()).map(|p| p.url).collect();
        assert_eq!(urls, ["http://p1:8080", "http://p2:8080", "http://p1:8080", "http://p2:8080"]);
        assert!(RotatingProxies::new(Vec::new()).next_proxy().is_none());
        assert!(NoProxy.next_proxy().is_none());
    }
}
