//! Segment recorder – owns the capture device, one segment file at a time.
//!
//! [`SegmentRecorder`] is the Idle/Capturing state machine; the actual
//! device work is done by a [`CaptureBackend`]. In production that is
//! [`ArecordBackend`], which spawns `arecord` writing a WAV file and stops
//! it with SIGINT so the header is finalized.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use murmur_common::config::Config;

/// How long a fresh capture process gets to fail on a bad device.
const STARTUP_PROBE: Duration = Duration::from_millis(500);
/// How long `arecord` gets to finalize the file after SIGINT.
const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    /// The device could not be acquired; no file should be assumed.
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("a segment is already being captured")]
    Busy,
}

/// Exclusive access to the capture device, as seen by the controller.
#[async_trait]
pub trait Recorder: Send + Sync {
    /// Begin writing a new segment to `path`.
    async fn start(&self, path: &Path) -> Result<(), RecorderError>;
    /// Finish the current segment and return its path. No-op when idle.
    async fn stop(&self) -> Option<PathBuf>;
    async fn is_capturing(&self) -> bool;
}

/// Low-level device operations behind [`SegmentRecorder`].
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    type Handle: Send + 'static;

    async fn open(&self, path: &Path) -> Result<Self::Handle, RecorderError>;
    /// Release the device and leave a complete, readable file behind.
    async fn finalize(&self, handle: Self::Handle);
}

enum State<H> {
    Idle,
    Capturing { handle: H, path: PathBuf },
}

pub struct SegmentRecorder<B: CaptureBackend> {
    backend: B,
    // Held across open/finalize so concurrent start/stop calls serialize.
    state: Mutex<State<B::Handle>>,
}

impl<B: CaptureBackend> SegmentRecorder<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            state: Mutex::new(State::Idle),
        }
    }
}

#[async_trait]
impl<B: CaptureBackend> Recorder for SegmentRecorder<B> {
    async fn start(&self, path: &Path) -> Result<(), RecorderError> {
        let mut state = self.state.lock().await;
        if matches!(*state, State::Capturing { .. }) {
            return Err(RecorderError::Busy);
        }
        let handle = self.backend.open(path).await?;
        *state = State::Capturing {
            handle,
            path: path.to_path_buf(),
        };
        Ok(())
    }

    async fn stop(&self) -> Option<PathBuf> {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, State::Idle) {
            State::Idle => None,
            State::Capturing { handle, path } => {
                self.backend.finalize(handle).await;
                debug!("Segment finalized: {}", path.display());
                Some(path)
            }
        }
    }

    async fn is_capturing(&self) -> bool {
        matches!(*self.state.lock().await, State::Capturing { .. })
    }
}

// ── arecord ──────────────────────────────────────────────────────────────

pub struct ArecordBackend {
    program: String,
    channels: u16,
    sample_rate: u32,
    card: Option<String>,
}

impl ArecordBackend {
    pub fn from_config(config: &Config) -> Self {
        Self {
            program: "arecord".into(),
            channels: config.channels,
            sample_rate: config.sample_rate,
            card: config.rec_card.clone(),
        }
    }

    fn args(&self, path: &Path) -> Vec<String> {
        let mut args = vec![
            "-q".to_string(),
            "-f".into(),
            "S16_LE".into(),
            format!("-c{}", self.channels),
            format!("-r{}", self.sample_rate),
            "-t".into(),
            "wav".into(),
        ];
        if let Some(card) = &self.card {
            args.push("-D".into());
            args.push(card.clone());
        }
        args.push(path.to_string_lossy().into_owned());
        args
    }
}

#[async_trait]
impl CaptureBackend for ArecordBackend {
    type Handle = Child;

    async fn open(&self, path: &Path) -> Result<Child, RecorderError> {
        let mut child = Command::new(&self.program)
            .args(self.args(path))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                RecorderError::DeviceUnavailable(format!("cannot spawn {}: {e}", self.program))
            })?;

        // Drain stderr so ALSA errors show up in the log and the pipe
        // never fills up and blocks the recorder.
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.is_empty() {
                        warn!("[arecord] {line}");
                    }
                }
                debug!("arecord stderr stream ended");
            });
        }

        tokio::time::sleep(STARTUP_PROBE).await;
        match child.try_wait() {
            Ok(Some(status)) => {
                let _ = tokio::fs::remove_file(path).await;
                return Err(RecorderError::DeviceUnavailable(format!(
                    "{} exited immediately with {status} (check REC_CARD; \
                     'arecord -l' lists capture devices)",
                    self.program
                )));
            }
            Ok(None) => {}
            Err(e) => warn!("Cannot check arecord status: {e}"),
        }

        info!(
            "arecord started (pid={:?}, channels={}, card={:?}) → {}",
            child.id(),
            self.channels,
            self.card,
            path.display()
        );
        Ok(child)
    }

    async fn finalize(&self, mut child: Child) {
        // `id()` is `None` once the child has been reaped, so the pid is
        // still ours.
        if let Some(pid) = child.id().and_then(|p| i32::try_from(p).ok()) {
            if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGINT) {
                debug!("Cannot interrupt arecord: {e}");
            }
        }
        match tokio::time::timeout(STOP_GRACE, child.wait()).await {
            Ok(Ok(status)) => debug!("arecord exited with {status}"),
            Ok(Err(e)) => warn!("Cannot wait for arecord: {e}"),
            Err(_) => {
                warn!("arecord ignored SIGINT for {STOP_GRACE:?}; killing it");
                let _ = child.kill().await;
            }
        }
    }
}
