//! Startup-time mapping from platform id to adapter.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{
    BoardAdapter, Credentials, PlatformAdapter, PlatformId, ScriptedAdapter, SearchCriteria,
};
use crate::config::AutoApplyConfig;
use crate::error::AutoApplyError;

/// The adapter implementations a platform can be configured with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    #[default]
    Board,
    Scripted,
}

/// One active platform: its adapter plus what it needs to log in and search.
#[derive(Clone)]
pub struct AdapterEntry {
    pub adapter: Arc<dyn PlatformAdapter>,
    pub credentials: Credentials,
    pub search: Option<SearchCriteria>,
}

/// Resolved once at startup. Disabled platforms are simply absent.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    entries: BTreeMap<PlatformId, AdapterEntry>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &AutoApplyConfig) -> Result<Self, AutoApplyError> {
        let mut registry = Self::new();
        for (name, platform) in config.enabled_platforms() {
            let id = PlatformId::new(name.as_str());
            let adapter: Arc<dyn PlatformAdapter> = match platform.kind {
                AdapterKind::Board => {
                    let base_url = platform.base_url.clone().ok_or_else(|| {
                        AutoApplyError::Config(format!("platform {name} needs a base_url"))
                    })?;
                    Arc::new(BoardAdapter::new(id.clone(), base_url))
                }
                AdapterKind::Scripted => Arc::new(
                    ScriptedAdapter::new(id.clone())
                        .with_generated_listings(platform.scripted_listings),
                ),
            };
            registry.register(
                adapter,
                Credentials::new(platform.username.clone(), platform.password.clone()),
                platform.search.clone(),
            );
        }
        if registry.is_empty() {
            return Err(AutoApplyError::NoPlatforms);
        }
        Ok(registry)
    }

    pub fn register(
        &mut self,
        adapter: Arc<dyn PlatformAdapter>,
        credentials: Credentials,
        search: Option<SearchCriteria>,
    ) {
        let id = adapter.platform().clone();
        self.entries.insert(
            id,
            AdapterEntry {
                adapter,
                credentials,
                search,
            },
        );
    }

    pub fn get(&self, platform: &PlatformId) -> Option<&AdapterEntry> {
        self.entries.get(platform)
    }

    pub fn platforms(&self) -> impl Iterator<Item = &PlatformId> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
