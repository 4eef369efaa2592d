//! Capture controller – polls the server for the desired state and drives
//! the recording loop.
//!
//! The poll loop and the recording loop share exactly one piece of state,
//! the `is_recording` flag. Everything else the recording loop needs is
//! handed to it when it is spawned.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use murmur_common::config::Config;
use murmur_common::identity::IdentityStore;
use murmur_common::protocol::RemoteCaptureState;
use murmur_common::segment::{self, Segment};
use murmur_common::storage;

use crate::probes::{CapturePermission, Reachability};
use crate::recorder::Recorder;
use crate::upload::{RemoteApi, Uploader};

/// Pause after the recorder refuses to start before trying again.
const START_RETRY_DELAY: Duration = Duration::from_secs(5);

pub const STATUS_STARTING: &str = "Service starting...";
pub const STATUS_SYNCING: &str = "Syncing with server...";
pub const STATUS_OFFLINE: &str = "Network unavailable";
pub const STATUS_UNREGISTERED: &str = "Waiting for registration";
pub const STATUS_NO_PERMISSION: &str = "Mic permission required";
pub const STATUS_RECORDING: &str = "Recording";
pub const STATUS_IDLE: &str = "Idle";

/// What one poll cycle should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    StartRecording,
    StopRecording,
    /// The server wants capture but the device is off limits.
    PermissionMissing,
    Nothing,
}

/// The transition table, as a pure function of the current state.
pub fn decide(is_recording: bool, remote: RemoteCaptureState, permission: bool) -> Action {
    match (is_recording, remote) {
        (false, RemoteCaptureState::Started) if permission => Action::StartRecording,
        (false, RemoteCaptureState::Started) => Action::PermissionMissing,
        (true, RemoteCaptureState::Stopped) => Action::StopRecording,
        _ => Action::Nothing,
    }
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub poll_interval: Duration,
    pub segment_duration: Duration,
    pub required_space: u64,
    pub spool_max_age: Duration,
    pub start_retry_delay: Duration,
}

impl CaptureSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            segment_duration: config.segment_duration(),
            required_space: config.required_space_bytes,
            spool_max_age: config.spool_max_age(),
            start_retry_delay: START_RETRY_DELAY,
        }
    }
}

/// Collaborators the controller is wired to.
pub struct ControllerDeps {
    pub api: Arc<dyn RemoteApi>,
    pub recorder: Arc<dyn Recorder>,
    pub permission: Arc<dyn CapturePermission>,
    pub reachability: Arc<dyn Reachability>,
    pub uploader: Uploader,
    pub identity: IdentityStore,
    pub spool_dir: PathBuf,
    pub settings: CaptureSettings,
}

/// Read-only view of the controller for the status server.
#[derive(Clone)]
pub struct StatusHandle {
    pub status: watch::Receiver<String>,
    pub is_recording: Arc<AtomicBool>,
}

struct RecordingTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct CaptureController {
    deps: Arc<ControllerDeps>,
    is_recording: Arc<AtomicBool>,
    recording: Option<RecordingTask>,
    status: watch::Sender<String>,
}

impl CaptureController {
    pub fn new(deps: ControllerDeps) -> Self {
        let (status, _) = watch::channel(STATUS_STARTING.to_string());
        Self {
            deps: Arc::new(deps),
            is_recording: Arc::new(AtomicBool::new(false)),
            recording: None,
            status,
        }
    }

    pub fn status_handle(&self) -> StatusHandle {
        StatusHandle {
            status: self.status.subscribe(),
            is_recording: self.is_recording.clone(),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.is_recording.load(Ordering::SeqCst)
    }

    /// Poll until `cancel` fires, then stop recording and hand off the
    /// in-flight segment.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            "Capture controller running (poll every {:?}, segments of {:?})",
            self.deps.settings.poll_interval, self.deps.settings.segment_duration
        );
        self.set_status(STATUS_SYNCING);

        let mut ticker = tokio::time::interval(self.deps.settings.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.poll_once().await;
        }

        self.stop_recording().await;
        info!("Capture controller stopped");
    }

    /// One poll cycle.
    pub async fn poll_once(&mut self) {
        // Re-read every cycle so a registration made elsewhere is picked up.
        let identity = self.deps.identity.load();

        if !self.deps.reachability.is_online().await {
            debug!("Network unavailable; retrying...");
            self.set_status(STATUS_OFFLINE);
            return;
        }
        let Some(device_id) = identity.registered_id().map(str::to_string) else {
            debug!("No device id yet; waiting for registration...");
            self.set_status(STATUS_UNREGISTERED);
            return;
        };

        let remote = self.deps.api.query_remote_state(&device_id).await;
        debug!("Remote state for {device_id}: {remote}");
        if let Err(e) = self.deps.identity.record_remote_state(remote) {
            debug!("Cannot persist remote state: {e}");
        }

        let is_recording = self.is_recording();
        let permission = self.deps.permission.granted();
        match decide(is_recording, remote, permission) {
            Action::StartRecording => self.start_recording(),
            Action::StopRecording => self.stop_recording().await,
            Action::PermissionMissing => {
                warn!("Server asks to start but capture permission is missing");
                self.set_status(STATUS_NO_PERMISSION);
                return;
            }
            Action::Nothing => {}
        }

        self.set_status(match (self.is_recording(), remote) {
            (true, _) => STATUS_RECORDING,
            (false, RemoteCaptureState::Unknown) => STATUS_SYNCING,
            (false, _) if !permission => STATUS_NO_PERMISSION,
            (false, _) => STATUS_IDLE,
        });
    }

    fn start_recording(&mut self) {
        // A loop that ended on its own (permission revoked) leaves a
        // finished handle behind.
        if let Some(old) = self.recording.take() {
            old.cancel.cancel();
        }

        let cancel = CancellationToken::new();
        self.is_recording.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(recording_loop(
            self.deps.clone(),
            self.is_recording.clone(),
            cancel.clone(),
        ));
        self.recording = Some(RecordingTask { cancel, handle });
        info!("Recording loop started");
    }

    async fn stop_recording(&mut self) {
        let Some(task) = self.recording.take() else {
            self.is_recording.store(false, Ordering::SeqCst);
            return;
        };
        task.cancel.cancel();
        if let Err(e) = task.handle.await {
            warn!("Recording loop ended abnormally: {e}");
        }
        self.is_recording.store(false, Ordering::SeqCst);
        info!("Recording loop stopped");
    }

    fn set_status(&self, status: &str) {
        self.status.send_if_modified(|current| {
            if current == status {
                return false;
            }
            info!("Status: {status}");
            *current = status.to_string();
            true
        });
    }
}

/// Capture consecutive segments until cancelled or permission is lost.
async fn recording_loop(
    deps: Arc<ControllerDeps>,
    is_recording: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let settings = &deps.settings;

    while !cancel.is_cancelled() {
        if !deps.permission.granted() {
            warn!("Lost capture permission; stopping recording loop");
            break;
        }

        if !storage::has_headroom(&deps.spool_dir, settings.required_space) {
            warn!("Not enough storage space; attempting cleanup");
            storage::reclaim(&deps.spool_dir, settings.spool_max_age);
            if sleep_or_cancel(settings.poll_interval, &cancel).await {
                break;
            }
            continue;
        }

        let seg = Segment::new_unique(&deps.spool_dir, Utc::now(), settings.segment_duration);
        if let Err(e) = deps.recorder.start(&seg.path).await {
            warn!("Failed to start new segment: {e}");
            if sleep_or_cancel(settings.start_retry_delay, &cancel).await {
                break;
            }
            continue;
        }
        debug!("Recording started: {}", seg.file_name());

        let cancelled = sleep_or_cancel(seg.target_duration, &cancel).await;
        if let Some(path) = deps.recorder.stop().await {
            hand_off(&deps, path);
        }
        if cancelled {
            break;
        }
    }

    // Never leave the device held once the loop is done.
    if let Some(path) = deps.recorder.stop().await {
        hand_off(&deps, path);
    }
    is_recording.store(false, Ordering::SeqCst);
}

/// Queue a finished segment for upload without blocking the next one.
fn hand_off(deps: &ControllerDeps, path: PathBuf) {
    match segment::inspect(&path) {
        Ok(p) => info!(
            "Recorded {} ({:.0}s, {} bytes)",
            segment::file_name(&path),
            p.duration.as_secs_f64(),
            p.size
        ),
        Err(e) => warn!("Segment may be incomplete: {e:#}"),
    }

    let Some(device_id) = deps.identity.load().registered_id().map(str::to_string) else {
        warn!(
            "No device id; leaving {} in the spool",
            segment::file_name(&path)
        );
        return;
    };
    deps.uploader.submit(device_id, path);
}

/// Sleep for `duration`; returns true if cancelled first.
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use async_trait::async_trait;
    use murmur_common::failed::FailedDeliverySet;

    use crate::recorder::tests::FakeBackend;
    use crate::recorder::SegmentRecorder;
    use crate::upload::tests::FakeApi;
    use crate::upload::RetryPolicy;

    use RemoteCaptureState::{Started, Stopped, Unknown};

    struct Flag(AtomicBool);

    impl CapturePermission for Flag {
        fn granted(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Reachability for Flag {
        async fn is_online(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        spool: PathBuf,
        api: Arc<FakeApi>,
        backend: Arc<FakeBackend>,
        permission: Arc<Flag>,
        online: Arc<Flag>,
        identity: IdentityStore,
        controller: CaptureController,
    }

    fn harness(upload_results: &[bool]) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let spool = dir.path().join("spool");
        std::fs::create_dir_all(&spool).unwrap();

        let api = Arc::new(FakeApi::with_results(upload_results));
        let backend = Arc::new(FakeBackend::default());
        let permission = Arc::new(Flag(AtomicBool::new(true)));
        let online = Arc::new(Flag(AtomicBool::new(true)));
        let identity = IdentityStore::new(dir.path().join("identity.json"));
        identity.set_device_id("7").unwrap();
        let failed = Arc::new(FailedDeliverySet::new(dir.path().join("failed.json")));

        let controller = CaptureController::new(ControllerDeps {
            api: api.clone(),
            recorder: Arc::new(SegmentRecorder::new(backend.clone())),
            permission: permission.clone(),
            reachability: online.clone(),
            uploader: Uploader::new(api.clone(), failed, RetryPolicy::default()),
            identity: identity.clone(),
            spool_dir: spool.clone(),
            settings: CaptureSettings {
                poll_interval: Duration::from_secs(1),
                segment_duration: Duration::from_secs(900),
                required_space: 0,
                spool_max_age: Duration::from_secs(24 * 3600),
                start_retry_delay: Duration::from_secs(5),
            },
        });

        Harness {
            _dir: dir,
            spool,
            api,
            backend,
            permission,
            online,
            identity,
            controller,
        }
    }

    impl Harness {
        fn script(&self, states: &[RemoteCaptureState]) {
            self.api.states.lock().unwrap().extend(states.iter().copied());
        }

        fn opened(&self) -> usize {
            self.backend.opened.load(Ordering::SeqCst)
        }

        fn finalized(&self) -> usize {
            self.backend.finalized.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_transition_table() {
        let cases = [
            (false, Started, true, Action::StartRecording),
            (false, Started, false, Action::PermissionMissing),
            (false, Stopped, true, Action::Nothing),
            (false, Unknown, true, Action::Nothing),
            (true, Stopped, true, Action::StopRecording),
            (true, Stopped, false, Action::StopRecording),
            (true, Started, true, Action::Nothing),
            (true, Unknown, true, Action::Nothing),
            (true, Started, false, Action::Nothing),
        ];
        for (recording, remote, permission, expected) in cases {
            assert_eq!(
                decide(recording, remote, permission),
                expected,
                "({recording}, {remote}, permission={permission})"
            );
        }
    }

    /// Let spawned tasks reach their next await point.
    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_unknown_started_started_stopped() {
        let mut h = harness(&[true]);
        h.script(&[Unknown, Started, Started, Stopped]);

        h.controller.poll_once().await;
        settle().await;
        assert!(!h.controller.is_recording());
        assert_eq!(h.opened(), 0);

        h.controller.poll_once().await;
        settle().await;
        assert!(h.controller.is_recording());
        assert_eq!(h.opened(), 1);

        h.controller.poll_once().await;
        settle().await;
        assert!(h.controller.is_recording());
        assert_eq!(h.opened(), 1);

        h.controller.poll_once().await;
        assert!(!h.controller.is_recording());
        assert_eq!(h.opened(), 1);
        assert_eq!(h.finalized(), 1);
        assert_eq!(h.api.queries.lock().unwrap().len(), 4);
        assert_eq!(
            h.identity.load().last_known_remote_state,
            RemoteCaptureState::Stopped
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_and_unregistered_skip_the_cycle() {
        let mut h = harness(&[]);
        h.script(&[Started]);

        h.online.0.store(false, Ordering::SeqCst);
        h.controller.poll_once().await;
        assert!(h.api.queries.lock().unwrap().is_empty());
        assert_eq!(*h.controller.status_handle().status.borrow(), STATUS_OFFLINE);

        h.online.0.store(true, Ordering::SeqCst);
        h.identity.set_device_id("").unwrap();
        h.controller.poll_once().await;
        assert!(h.api.queries.lock().unwrap().is_empty());
        assert!(!h.controller.is_recording());

        // Late registration is picked up without a restart.
        h.identity.set_device_id("8").unwrap();
        h.controller.poll_once().await;
        settle().await;
        assert_eq!(h.api.queries.lock().unwrap().as_slice(), ["8".to_string()]);
        assert!(h.controller.is_recording());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_permission_stays_stopped() {
        let mut h = harness(&[]);
        h.permission.0.store(false, Ordering::SeqCst);
        h.script(&[Started, Started]);

        h.controller.poll_once().await;
        assert!(!h.controller.is_recording());
        assert_eq!(h.opened(), 0);
        assert_eq!(
            *h.controller.status_handle().status.borrow(),
            STATUS_NO_PERMISSION
        );

        h.permission.0.store(true, Ordering::SeqCst);
        h.controller.poll_once().await;
        settle().await;
        assert!(h.controller.is_recording());
    }

    #[tokio::test(start_paused = true)]
    async fn test_segments_roll_over_and_upload() {
        let mut h = harness(&[true, true]);
        h.script(&[Started]);

        h.controller.poll_once().await;
        settle().await;
        assert_eq!(h.opened(), 1);

        // One full segment later the next one starts immediately.
        tokio::time::sleep(Duration::from_secs(900)).await;
        settle().await;
        assert_eq!(h.opened(), 2);
        assert_eq!(h.finalized(), 1);
        assert_eq!(h.backend.max_open.load(Ordering::SeqCst), 1);

        // The first segment was uploaded and removed from the spool.
        settle().await;
        let left: Vec<_> = std::fs::read_dir(&h.spool).unwrap().flatten().collect();
        assert_eq!(left.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_revoked_mid_loop_resets_flag() {
        let mut h = harness(&[true]);
        h.script(&[Started]);

        h.controller.poll_once().await;
        settle().await;
        assert!(h.controller.is_recording());

        h.permission.0.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(900)).await;
        settle().await;

        assert!(!h.controller.is_recording());
        assert_eq!(h.opened(), 1);
        assert_eq!(h.finalized(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_hands_off_in_flight_segment() {
        let h = harness(&[true]);
        h.script(&[Started]);
        let backend = h.backend.clone();
        let api = h.api.clone();
        let status = h.controller.status_handle();

        let cancel = CancellationToken::new();
        let run = tokio::spawn(h.controller.run(cancel.clone()));
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(status.is_recording.load(Ordering::SeqCst));

        cancel.cancel();
        run.await.unwrap();
        settle().await;

        assert_eq!(backend.opened.load(Ordering::SeqCst), 1);
        assert_eq!(backend.finalized.load(Ordering::SeqCst), 1);
        assert!(!status.is_recording.load(Ordering::SeqCst));
        assert_eq!(api.attempts.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_unavailable_retries_after_delay() {
        let mut h = harness(&[]);
        h.backend.unavailable.store(true, Ordering::SeqCst);
        h.script(&[Started]);

        h.controller.poll_once().await;
        settle().await;
        assert_eq!(h.opened(), 0);
        assert!(h.controller.is_recording());

        h.backend.unavailable.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(h.opened(), 1);
    }
}
