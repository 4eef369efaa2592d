//! Persisted one-shot deadlines for the restart triggers.
//!
//! Each trigger is a file `triggers/<name>.json` holding its next fire
//! time. Because the deadline lives on disk, a restarted supervisor picks
//! the chain up where it left off, and the host can re-arm a trigger the
//! supervisor is waiting on.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::state::{self, StateError};

/// Self-rescheduling periodic restart job.
pub const RESTART_JOB: &str = "restart-job";
/// Exact wake-up timer, re-armed by the host and by itself.
pub const RESTART_ALARM: &str = "restart-alarm";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Deadline {
    fire_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct TriggerStore {
    dir: PathBuf,
}

impl TriggerStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    pub fn arm(&self, name: &str, fire_at: DateTime<Utc>) -> Result<(), StateError> {
        debug!("Arming trigger {name} for {fire_at}");
        state::save_json(
            &self.path(name),
            &Deadline {
                fire_at: Some(fire_at),
            },
        )
    }

    /// Arm `name` to fire `delay` from now.
    pub fn arm_in(&self, name: &str, delay: Duration) -> Result<(), StateError> {
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        self.arm(name, Utc::now() + delay)
    }

    pub fn disarm(&self, name: &str) -> Result<(), StateError> {
        state::save_json(&self.path(name), &Deadline::default())
    }

    /// Next fire time, or `None` when the trigger is not armed.
    pub fn deadline(&self, name: &str) -> Option<DateTime<Utc>> {
        match state::load_json::<Deadline>(&self.path(name)) {
            Ok(d) => d.fire_at,
            Err(e) => {
                warn!("Cannot read trigger {name}: {e}");
                None
            }
        }
    }
}
