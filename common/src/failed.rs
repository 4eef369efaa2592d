//! Failed-delivery set (`failed.json`).
//!
//! Names of segments that exhausted their upload retries. Purely
//! observational: nothing re-drives these automatically, the files stay in
//! the spool directory for inspection or a manual re-upload.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use crate::state::{self, StateError};

#[derive(Debug)]
pub struct FailedDeliverySet {
    path: PathBuf,
    // Serializes read-modify-write cycles from concurrent upload tasks.
    guard: Mutex<()>,
}

impl FailedDeliverySet {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Add `name`. Returns `false` if it was already present.
    pub fn add(&self, name: &str) -> Result<bool, StateError> {
        self.update(|set| set.insert(name.to_string()))
    }

    /// Remove `name`. Returns `false` if it was not present.
    pub fn remove(&self, name: &str) -> Result<bool, StateError> {
        self.update(|set| set.remove(name))
    }

    pub fn contains(&self, name: &str) -> Result<bool, StateError> {
        Ok(self.names()?.contains(name))
    }

    pub fn names(&self) -> Result<BTreeSet<String>, StateError> {
        let _lock = self.guard.lock().unwrap_or_else(|e| e.into_inner());
        state::load_json(&self.path)
    }

    fn update(&self, f: impl FnOnce(&mut BTreeSet<String>) -> bool) -> Result<bool, StateError> {
        let _lock = self.guard.lock().unwrap_or_else(|e| e.into_inner());
        let mut set: BTreeSet<String> = state::load_json(&self.path)?;
        let changed = f(&mut set);
        if changed {
            state::save_json(&self.path, &set)?;
            debug!("Failed set now holds {} name(s)", set.len());
        }
        Ok(changed)
    }
}
