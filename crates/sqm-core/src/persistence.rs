//! On-disk state snapshots
//!
//! The whole pipeline state (links, baselines, shaping states, history) is
//! written as one versioned JSON document, atomically via a temp file.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::baseline::LinkBaselineSnapshot;
use crate::history::HistorySnapshot;
use crate::models::{ShapingState, WanLinkId};
use crate::registry::WanLink;

pub const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub links: Vec<WanLink>,
    pub baselines: Vec<LinkBaselineSnapshot>,
    pub shaping: BTreeMap<WanLinkId, ShapingState>,
    #[serde(default)]
    pub history: HistorySnapshot,
}

#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, state: &PersistedState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }

        let json = serde_json::to_vec_pretty(state).context("Failed to serialize state")?;

        let temp_path = self.path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .with_context(|| format!("Failed to create temp file {:?}", temp_path))?;
        file.write_all(&json).context("Failed to write state")?;
        file.sync_all().context("Failed to sync state file")?;

        std::fs::rename(&temp_path, &self.path)
            .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, self.path))?;
        Ok(())
    }

    /// `None` when no snapshot has been written yet
    pub fn load(&self) -> Result<Option<PersistedState>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let mut file = File::open(&self.path)
            .with_context(|| format!("Failed to open state file {:?}", self.path))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data).context("Failed to read state file")?;

        let state: PersistedState =
            serde_json::from_slice(&data).context("Failed to deserialize state")?;
        if state.version != STATE_VERSION {
            bail!(
                "Unsupported state version {} in {:?} (expected {})",
                state.version,
                self.path,
                STATE_VERSION
            );
        }

        info!(
            path = %self.path.display(),
            links = state.links.len(),
            saved_at = %state.saved_at,
            "Loaded persisted state"
        );
        Ok(Some(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AdjustmentReason, RatePair};
    use crate::testing::{docsis_link, t0};
    use tempfile::tempdir;

    fn sample_state() -> PersistedState {
        let mut shaping = BTreeMap::new();
        shaping.insert(
            WanLinkId::from("wan1"),
            ShapingState {
                applied: RatePair::new(276.0, 18.4),
                last_applied_at: t0(),
                last_adjustment_reason: AdjustmentReason::InitialMeasurement,
                last_deployed_content_hash: "deadbeef".to_string(),
            },
        );
        PersistedState {
            version: STATE_VERSION,
            saved_at: t0(),
            links: vec![docsis_link("wan1")],
            baselines: Vec::new(),
            shaping,
            history: HistorySnapshot::default(),
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("nested").join("state.json"));
        assert!(store.load().unwrap().is_none());

        let state = sample_state();
        store.save(&state).unwrap();
        assert_eq!(store.load().unwrap(), Some(state));
        assert!(!dir.path().join("nested").join("state.tmp").exists());
    }

    #[test]
    fn test_rejects_unknown_version() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let mut state = sample_state();
        state.version = 99;
        store.save(&state).unwrap();
        assert!(store.load().is_err());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{ not json").unwrap();
        assert!(StateStore::new(path).load().is_err());
    }
}
