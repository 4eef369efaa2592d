//! Persisted device identity (`identity.json`).
//!
//! The device id is written by the registration flow; the capture host
//! re-reads it on every poll so a late registration takes effect without a
//! restart. The host only ever touches `last_known_remote_state`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::protocol::RemoteCaptureState;
use crate::state::{self, StateError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub last_known_remote_state: RemoteCaptureState,
}

impl DeviceIdentity {
    /// The device id, if registration has produced a non-empty one.
    pub fn registered_id(&self) -> Option<&str> {
        self.device_id.as_deref().filter(|id| !id.trim().is_empty())
    }
}

#[derive(Debug, Clone)]
pub struct IdentityStore {
    path: PathBuf,
}

impl IdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current identity. A corrupt or unreadable file reads as
    /// "unregistered" so the poller just skips the cycle.
    pub fn load(&self) -> DeviceIdentity {
        match state::load_json(&self.path) {
            Ok(identity) => identity,
            Err(e) => {
                warn!("Cannot load device identity: {e}");
                DeviceIdentity::default()
            }
        }
    }

    /// Store a freshly registered device id.
    pub fn set_device_id(&self, device_id: &str) -> Result<(), StateError> {
        state::locked(&self.path, || {
            let mut identity: DeviceIdentity = state::load_json(&self.path).unwrap_or_default();
            identity.device_id = Some(device_id.to_string());
            state::save_json(&self.path, &identity)
        })
    }

    /// Record the last remote state seen, leaving the device id untouched.
    ///
    /// Both writers hold the identity lock for the whole read-modify-write,
    /// so a registration landing meanwhile is never overwritten.
    pub fn record_remote_state(&self, remote: RemoteCaptureState) -> Result<(), StateError> {
        state::locked(&self.path, || {
            let mut identity: DeviceIdentity = state::load_json(&self.path)?;
            if identity.last_known_remote_state == remote {
                return Ok(());
            }
            identity.last_known_remote_state = remote;
            state::save_json(&self.path, &identity)
        })
    }
}
