//! Host liveness: the persisted `host.json` flag and the `host.lock` file.
//!
//! `running`/`pid` are written only when the host enters and leaves
//! `run`; `enabled` only by the `start`/`stop` entry points. The lock is
//! held for the whole life of a host process and is the only liveness
//! authority: the kernel drops it when the process dies, while the flag
//! can outlive a power loss and name a pid that has since been reused.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::state::{self, StateError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostState {
    /// Whether the host is supposed to be running at all.
    pub enabled: bool,
    /// Whether a host believes it is running right now.
    pub running: bool,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
}

impl Default for HostState {
    fn default() -> Self {
        HostState {
            enabled: true,
            running: false,
            pid: None,
            started_at: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HostStateStore {
    path: PathBuf,
}

impl HostStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn load(&self) -> HostState {
        state::load_json(&self.path).unwrap_or_else(|e| {
            warn!("Cannot load host state: {e}");
            HostState::default()
        })
    }

    pub fn mark_started(&self, pid: u32) -> Result<(), StateError> {
        let mut st = self.load();
        st.running = true;
        st.pid = Some(pid);
        st.started_at = Some(Utc::now());
        state::save_json(&self.path, &st)
    }

    pub fn mark_stopped(&self) -> Result<(), StateError> {
        let mut st = self.load();
        st.running = false;
        st.pid = None;
        state::save_json(&self.path, &st)
    }

    pub fn set_enabled(&self, enabled: bool) -> Result<(), StateError> {
        let mut st = self.load();
        st.enabled = enabled;
        state::save_json(&self.path, &st)
    }
}

/// Exclusive `flock` on the host lock file, released on drop.
#[derive(Debug)]
pub struct HostLock {
    _lock: Flock<File>,
}

impl HostLock {
    /// Take the lock without blocking. `Ok(None)` means another process
    /// holds it.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        let file = open_lock_file(path)?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => Ok(Some(HostLock { _lock: lock })),
            Err((_file, e)) if e == Errno::EWOULDBLOCK => Ok(None),
            Err((_file, e)) => Err(e).context("flock failed"),
        }
    }

    /// Whether some process currently holds the lock.
    pub fn is_held(path: &Path) -> bool {
        if !path.exists() {
            return false;
        }
        // A lock taken here is dropped, and so released, straight away.
        match Self::try_acquire(path) {
            Ok(ours) => ours.is_none(),
            Err(e) => {
                debug!("Cannot check host lock: {e:#}");
                false
            }
        }
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Cannot create {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .with_context(|| format!("Cannot open host lock {}", path.display()))
}

/// Whether a process with `pid` exists.
pub fn pid_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
}

/// Liveness as seen from outside the host: somebody holds the host lock.
pub fn host_alive(lock_path: &Path) -> bool {
    HostLock::is_held(lock_path)
}

/// The pid of the live host, if any. The flag's pid is only trusted
/// while the lock is held.
pub fn live_host_pid(state: &HostState, lock_path: &Path) -> Option<u32> {
    if !host_alive(lock_path) {
        return None;
    }
    state.pid.filter(|&pid| state.running && pid_alive(pid))
}
