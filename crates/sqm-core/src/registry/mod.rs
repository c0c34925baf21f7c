//! WAN link registry
//!
//! Owns the configured links, the profile preset table, and one
//! [`LinkRuntime`] per link holding all mutable per-link pipeline state.
//! Runtime state is created when a link is added and dropped when it is
//! removed, so several links can be managed side by side without any
//! shared global state.

mod link;
mod profile;

pub use link::WanLink;
pub use profile::{ConnectionProfile, ProfileParams, ProfileTable};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::{debug, info};

use crate::alerts::FailureStreaks;
use crate::decision::BackoffState;
use crate::drift::DriftTracker;
use crate::error::{Result, SqmError};
use crate::latency::LatencyWindow;
use crate::models::{ShapingState, WanLinkId};
use crate::sampler::SampleGate;
use crate::status::Observations;

/// Lock a std mutex, recovering the data if a previous holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Mutable pipeline state for a single WAN link
pub struct LinkRuntime {
    link: RwLock<WanLink>,
    registered_at: DateTime<Utc>,
    shaping: RwLock<Option<ShapingState>>,
    /// Serializes deployments for this link
    pub(crate) deploy_lock: tokio::sync::Mutex<()>,
    pub(crate) latency: Mutex<LatencyWindow>,
    pub(crate) backoff: Mutex<BackoffState>,
    pub(crate) drift: Mutex<DriftTracker>,
    pub(crate) gate: Mutex<SampleGate>,
    pub(crate) failures: Mutex<FailureStreaks>,
    pub(crate) observations: RwLock<Observations>,
}

impl LinkRuntime {
    fn new(link: WanLink, now: DateTime<Utc>) -> Self {
        Self {
            link: RwLock::new(link),
            registered_at: now,
            shaping: RwLock::new(None),
            deploy_lock: tokio::sync::Mutex::new(()),
            latency: Mutex::new(LatencyWindow::default()),
            backoff: Mutex::new(BackoffState::Normal),
            drift: Mutex::new(DriftTracker::default()),
            gate: Mutex::new(SampleGate::default()),
            failures: Mutex::new(FailureStreaks::default()),
            observations: RwLock::new(Observations::default()),
        }
    }

    /// Snapshot of the link configuration
    pub fn link(&self) -> WanLink {
        self.link.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn id(&self) -> WanLinkId {
        self.link.read().unwrap_or_else(|e| e.into_inner()).id.clone()
    }

    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    /// Shaping state last confirmed on the gateway, if any
    pub fn shaping(&self) -> Option<ShapingState> {
        self.shaping.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn set_shaping(&self, state: Option<ShapingState>) {
        *self.shaping.write().unwrap_or_else(|e| e.into_inner()) = state;
    }

    pub fn observations(&self) -> Observations {
        self.observations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn update_observations(&self, f: impl FnOnce(&mut Observations)) {
        let mut observations = self.observations.write().unwrap_or_else(|e| e.into_inner());
        f(&mut observations);
    }

    pub fn backoff_active(&self) -> bool {
        lock(&self.backoff).is_active()
    }

    fn replace_link(&self, link: WanLink) {
        *self.link.write().unwrap_or_else(|e| e.into_inner()) = link;
    }
}

impl std::fmt::Debug for LinkRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkRuntime")
            .field("id", &self.id())
            .field("registered_at", &self.registered_at)
            .field("shaping", &self.shaping())
            .finish_non_exhaustive()
    }
}

/// Registry of managed WAN links and profile presets
pub struct WanLinkRegistry {
    links: DashMap<WanLinkId, Arc<LinkRuntime>>,
    profiles: RwLock<ProfileTable>,
}

impl Default for WanLinkRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WanLinkRegistry {
    pub fn new() -> Self {
        Self {
            links: DashMap::new(),
            profiles: RwLock::new(ProfileTable::default()),
        }
    }

    pub fn with_profiles(profiles: ProfileTable) -> Self {
        Self {
            links: DashMap::new(),
            profiles: RwLock::new(profiles),
        }
    }

    /// Register a new link and construct its runtime state
    pub fn add(&self, link: WanLink, now: DateTime<Utc>) -> Result<Arc<LinkRuntime>> {
        link.validate()?;
        self.check_interface_free(&link)?;
        let id = link.id.clone();

        match self.links.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(SqmError::DuplicateLink(id)),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                info!(
                    link_id = %id,
                    interface = %link.interface,
                    profile = %link.profile,
                    "Registered WAN link"
                );
                let runtime = Arc::new(LinkRuntime::new(link, now));
                entry.insert(runtime.clone());
                Ok(runtime)
            }
        }
    }

    /// Replace a link's configuration, keeping its learned state
    pub fn update(&self, link: WanLink) -> Result<Arc<LinkRuntime>> {
        link.validate()?;
        let runtime = self.get(&link.id)?;
        self.check_interface_free(&link)?;
        debug!(link_id = %link.id, "Updating WAN link configuration");
        runtime.replace_link(link);
        Ok(runtime)
    }

    /// Status is keyed by interface, so no two links may share one
    fn check_interface_free(&self, link: &WanLink) -> Result<()> {
        let taken_by = self.links.iter().find_map(|entry| {
            let other = entry.value().link();
            (other.id != link.id && other.interface == link.interface).then_some(other.id)
        });
        match taken_by {
            Some(other) => Err(SqmError::invalid(
                "interface",
                format!("{} is already used by link {}", link.interface, other),
            )),
            None => Ok(()),
        }
    }

    /// Remove a link and drop its runtime state
    pub fn remove(&self, id: &WanLinkId) -> Option<Arc<LinkRuntime>> {
        let removed = self.links.remove(id).map(|(_, runtime)| runtime);
        if removed.is_some() {
            info!(link_id = %id, "Removed WAN link");
        }
        removed
    }

    pub fn get(&self, id: &WanLinkId) -> Result<Arc<LinkRuntime>> {
        self.links
            .get(id)
            .map(|r| r.value().clone())
            .ok_or_else(|| SqmError::UnknownLink(id.clone()))
    }

    pub fn contains(&self, id: &WanLinkId) -> bool {
        self.links.contains_key(id)
    }

    /// All link definitions, ordered by id
    pub fn list(&self) -> Vec<WanLink> {
        let mut links: Vec<WanLink> = self.links.iter().map(|r| r.value().link()).collect();
        links.sort_by(|a, b| a.id.cmp(&b.id));
        links
    }

    pub fn ids(&self) -> Vec<WanLinkId> {
        let mut ids: Vec<WanLinkId> = self.links.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn profile_params(&self, profile: ConnectionProfile) -> ProfileParams {
        self.profiles
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(profile)
    }

    pub fn set_profile_params(&self, profile: ConnectionProfile, params: ProfileParams) -> Result<()> {
        self.profiles
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .set(profile, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{docsis_link, t0};

    #[test]
    fn test_add_and_get() {
        let registry = WanLinkRegistry::new();
        registry.add(docsis_link("wan1"), t0()).unwrap();

        let runtime = registry.get(&"wan1".into()).unwrap();
        assert_eq!(runtime.link().interface, "eth-wan1");
        assert!(runtime.shaping().is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_rejected() {
        let registry = WanLinkRegistry::new();
        registry.add(docsis_link("wan1"), t0()).unwrap();
        let err = registry.add(docsis_link("wan1"), t0()).unwrap_err();
        assert!(matches!(err, SqmError::DuplicateLink(_)));
    }

    #[test]
    fn test_shared_interface_rejected() {
        let registry = WanLinkRegistry::new();
        registry.add(docsis_link("wan1"), t0()).unwrap();

        let mut clash = docsis_link("wan2");
        clash.interface = "eth-wan1".to_string();
        assert!(matches!(
            registry.add(clash.clone(), t0()),
            Err(SqmError::InvalidParameter { name: "interface", .. })
        ));
        assert_eq!(registry.len(), 1);

        registry.add(docsis_link("wan2"), t0()).unwrap();
        assert!(registry.update(clash).is_err());
        assert_eq!(registry.get(&"wan2".into()).unwrap().link().interface, "eth-wan2");

        // a link keeps its own interface across updates
        let mut renamed = docsis_link("wan1");
        renamed.nominal_down_mbps = 400.0;
        registry.update(renamed).unwrap();
    }

    #[test]
    fn test_runtime_debug_shows_id() {
        let registry = WanLinkRegistry::new();
        let runtime = registry.add(docsis_link("wan1"), t0()).unwrap();
        assert!(format!("{:?}", runtime).contains("wan1"));
    }

    #[test]
    fn test_update_keeps_runtime_state() {
        let registry = WanLinkRegistry::new();
        let runtime = registry.add(docsis_link("wan1"), t0()).unwrap();
        lock(&runtime.failures).record_failure(crate::alerts::FailureKind::Deployment);

        let mut updated = docsis_link("wan1");
        updated.nominal_down_mbps = 500.0;
        let same = registry.update(updated).unwrap();

        assert!(Arc::ptr_eq(&runtime, &same));
        assert_eq!(same.link().nominal_down_mbps, 500.0);
        assert_eq!(
            lock(&same.failures).get(crate::alerts::FailureKind::Deployment),
            1
        );
    }

    #[test]
    fn test_update_unknown_link() {
        let registry = WanLinkRegistry::new();
        assert!(matches!(
            registry.update(docsis_link("wan9")),
            Err(SqmError::UnknownLink(_))
        ));
    }

    #[test]
    fn test_many_links_listed_in_order() {
        let registry = WanLinkRegistry::new();
        for id in ["wan3", "wan1", "wan2"] {
            registry.add(docsis_link(id), t0()).unwrap();
        }
        let ids: Vec<String> = registry.list().into_iter().map(|l| l.id.to_string()).collect();
        assert_eq!(ids, vec!["wan1", "wan2", "wan3"]);

        assert!(registry.remove(&"wan2".into()).is_some());
        assert!(registry.get(&"wan2".into()).is_err());
        assert_eq!(registry.len(), 2);
    }
}
