//! Configuration parsing – reads a KEY=VALUE file (`murmur.conf`).
//!
//! Every knob of the capture host and the supervisor lives here so that
//! segment length, poll period and restart cadence are configuration
//! rather than constants.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

/// Application configuration, shared by the host (`run`) and the
/// supervisor (`supervise`, `boot`, `start`, `stop`).
#[derive(Debug, Clone)]
pub struct Config {
    // ── server ───────────────────────────────────────────────────────
    /// Base URL of the collection API, e.g. `http://10.0.0.5:8000/api`.
    pub server_url: String,
    pub http_timeout_secs: u64,

    // ── storage ──────────────────────────────────────────────────────
    /// Directory for identity, failed set, host flag and trigger files.
    pub state_dir: PathBuf,
    /// Explicit spool directory; resolved by the storage manager when unset.
    pub spool_dir: Option<PathBuf>,
    pub required_space_bytes: u64,
    pub spool_max_age_hours: u64,
    pub reclaim_interval_secs: u64,

    // ── capture ──────────────────────────────────────────────────────
    pub segment_secs: u64,
    pub poll_interval_secs: u64,
    pub rec_card: Option<String>,
    pub channels: u16,
    pub sample_rate: u32,
    /// Device node whose accessibility stands in for capture permission.
    pub capture_device: PathBuf,

    // ── upload ───────────────────────────────────────────────────────
    pub max_upload_attempts: u32,
    pub upload_backoff_secs: u64,

    // ── lifecycle ────────────────────────────────────────────────────
    pub restart_job_secs: u64,
    pub restart_alarm_secs: u64,
    pub monitor_interval_secs: u64,
    pub monitor_backoff_secs: u64,
    pub teardown_relaunch_secs: u64,

    // ── status surface ───────────────────────────────────────────────
    /// Address of the local status server; `None` disables it.
    pub status_listen_addr: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server_url: "http://127.0.0.1:8000/api".into(),
            http_timeout_secs: 30,
            state_dir: PathBuf::from("/var/lib/murmur"),
            spool_dir: None,
            required_space_bytes: 10 * 1024 * 1024,
            spool_max_age_hours: 24,
            reclaim_interval_secs: 3600,
            segment_secs: 15 * 60,
            poll_interval_secs: 1,
            rec_card: None,
            channels: 1,
            sample_rate: 48_000,
            capture_device: PathBuf::from("/dev/snd"),
            max_upload_attempts: 5,
            upload_backoff_secs: 1,
            restart_job_secs: 60,
            restart_alarm_secs: 60,
            monitor_interval_secs: 15 * 60,
            monitor_backoff_secs: 60,
            teardown_relaunch_secs: 5,
            status_listen_addr: Some("127.0.0.1:8090".into()),
        }
    }
}

impl Config {
    /// Default config path.
    pub fn default_path() -> &'static str {
        "/etc/murmur/murmur.conf"
    }

    pub fn segment_duration(&self) -> Duration {
        Duration::from_secs(self.segment_secs.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn spool_max_age(&self) -> Duration {
        Duration::from_secs(self.spool_max_age_hours * 3600)
    }

    pub fn identity_path(&self) -> PathBuf {
        self.state_dir.join("identity.json")
    }

    pub fn failed_path(&self) -> PathBuf {
        self.state_dir.join("failed.json")
    }

    pub fn host_state_path(&self) -> PathBuf {
        self.state_dir.join("host.json")
    }

    pub fn host_lock_path(&self) -> PathBuf {
        self.state_dir.join("host.lock")
    }

    pub fn triggers_dir(&self) -> PathBuf {
        self.state_dir.join("triggers")
    }
}

/// Parse a `KEY=VALUE` configuration file.
///
/// A missing file is not an error: the host must come up after a reboot
/// even if provisioning never wrote a config, so defaults are used.
pub fn load(path: &Path) -> Result<Config> {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("Config {} not found – using defaults", path.display());
            return Ok(Config::default());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Cannot read config: {}", path.display()))
        }
    };
    let config = from_map(&parse_conf(&text));
    info!("Loaded config from {}", path.display());
    Ok(config)
}

fn from_map(map: &HashMap<String, String>) -> Config {
    let d = Config::default();

    let get = |key: &str| -> Option<String> { map.get(key).cloned() };
    let get_u64 = |key: &str, default: u64| -> u64 {
        get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    };
    let get_u32 = |key: &str, default: u32| -> u32 {
        get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    };

    Config {
        server_url: get("SERVER_URL")
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or(d.server_url),
        http_timeout_secs: get_u64("HTTP_TIMEOUT_SECS", d.http_timeout_secs),

        state_dir: get("STATE_DIR").map(PathBuf::from).unwrap_or(d.state_dir),
        spool_dir: get("SPOOL_DIR").filter(|s| !s.is_empty()).map(PathBuf::from),
        required_space_bytes: get_u64("REQUIRED_SPACE_BYTES", d.required_space_bytes),
        spool_max_age_hours: get_u64("SPOOL_MAX_AGE_HOURS", d.spool_max_age_hours),
        reclaim_interval_secs: get_u64("RECLAIM_INTERVAL_SECS", d.reclaim_interval_secs),

        segment_secs: get_u64("SEGMENT_SECS", d.segment_secs),
        poll_interval_secs: get_u64("POLL_INTERVAL_SECS", d.poll_interval_secs),
        rec_card: get("REC_CARD").filter(|s| !s.is_empty()),
        channels: get("CHANNELS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(d.channels),
        sample_rate: get_u32("SAMPLE_RATE", d.sample_rate),
        capture_device: get("CAPTURE_DEVICE")
            .map(PathBuf::from)
            .unwrap_or(d.capture_device),

        max_upload_attempts: get_u32("MAX_UPLOAD_ATTEMPTS", d.max_upload_attempts).max(1),
        upload_backoff_secs: get_u64("UPLOAD_BACKOFF_SECS", d.upload_backoff_secs),

        restart_job_secs: get_u64("RESTART_JOB_SECS", d.restart_job_secs),
        restart_alarm_secs: get_u64("RESTART_ALARM_SECS", d.restart_alarm_secs),
        monitor_interval_secs: get_u64("MONITOR_INTERVAL_SECS", d.monitor_interval_secs),
        monitor_backoff_secs: get_u64("MONITOR_BACKOFF_SECS", d.monitor_backoff_secs),
        teardown_relaunch_secs: get_u64("TEARDOWN_RELAUNCH_SECS", d.teardown_relaunch_secs),

        status_listen_addr: match get("STATUS_LISTEN_ADDR") {
            Some(addr) if addr.is_empty() => None,
            Some(addr) => Some(addr),
            None => d.status_listen_addr,
        },
    }
}

/// Parse `KEY=VALUE` lines into a map, stripping optional double-quotes.
fn parse_conf(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, val)) = line.split_once('=') {
            let key = key.trim();
            let val = val.trim().trim_matches('"');
            map.insert(key.to_string(), val.to_string());
        }
    }
    map
}

// ─── tests ───────────────────────────────────────────────────────────────
