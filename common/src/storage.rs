//! Spool directory management: resolution, free-space checks and
//! age-based cleanup.
//!
//! Everything except [`spool_directory`] degrades to a safe default on I/O
//! errors; callers treat "unknown" free space as "not enough".

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use nix::sys::statvfs::statvfs;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::protocol::SegmentInfo;

/// Files modified more recently than this are assumed to still be written.
const SETTLE_TIME: Duration = Duration::from_secs(2);

/// Resolve (and create) the directory segment files are written to.
///
/// Candidates, first one that can be created wins: `SPOOL_DIR`,
/// `<STATE_DIR>/recordings`, the user data dir, the temp dir.
pub fn spool_directory(config: &Config) -> Result<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(dir) = &config.spool_dir {
        candidates.push(dir.clone());
    }
    candidates.push(config.state_dir.join("recordings"));
    if let Some(data) = dirs::data_local_dir() {
        candidates.push(data.join("murmur").join("recordings"));
    }
    candidates.push(std::env::temp_dir().join("murmur").join("recordings"));

    let mut last_err = None;
    for dir in candidates {
        match std::fs::create_dir_all(&dir) {
            Ok(()) => {
                debug!("Spool directory: {}", dir.display());
                return Ok(dir);
            }
            Err(e) => {
                warn!("Cannot use spool directory {}: {e}", dir.display());
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| std::io::Error::other("no candidates")))
        .context("No usable spool directory")
}

/// Free bytes available to unprivileged writers on the volume holding
/// `dir`. Zero on any error.
pub fn available_bytes(dir: &Path) -> u64 {
    match statvfs(dir) {
        Ok(stat) => (stat.blocks_available() as u64).saturating_mul(stat.fragment_size() as u64),
        Err(e) => {
            warn!("statvfs({}) failed: {e}", dir.display());
            0
        }
    }
}

pub fn has_headroom(dir: &Path, required_bytes: u64) -> bool {
    available_bytes(dir) >= required_bytes
}

/// Delete every file under `dir` last modified more than `max_age` ago.
///
/// Best-effort housekeeping: failures are logged and skipped. Returns the
/// number of files removed.
pub fn reclaim(dir: &Path, max_age: Duration) -> usize {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            warn!("Cannot scan {} for cleanup: {e}", dir.display());
            return 0;
        }
    };

    let now = SystemTime::now();
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(meta) = entry.metadata() else { continue };
        if !meta.is_file() {
            continue;
        }
        let age = meta
            .modified()
            .ok()
            .and_then(|m| now.duration_since(m).ok())
            .unwrap_or_default();
        if age <= max_age {
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!("Reclaimed {}", path.display());
                removed += 1;
            }
            Err(e) => warn!("Cannot remove stale {}: {e}", path.display()),
        }
    }

    if removed > 0 {
        info!("Reclaimed {removed} stale file(s) from {}", dir.display());
    }
    removed
}

/// Settled, non-empty segment files in `dir`, sorted by name.
pub fn list_segments(dir: &Path) -> Vec<SegmentInfo> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return vec![];
    };
    let cutoff = SystemTime::now() - SETTLE_TIME;

    let mut segments = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("wav") {
            continue;
        }
        let Ok(meta) = path.metadata() else { continue };
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        if modified > cutoff || meta.len() == 0 {
            continue;
        }
        segments.push(SegmentInfo {
            filename: path
                .file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string(),
            size: meta.len(),
            modified: chrono::DateTime::<chrono::Utc>::from(modified).to_rfc3339(),
        });
    }

    segments.sort_by(|a, b| a.filename.cmp(&b.filename));
    segments
}
