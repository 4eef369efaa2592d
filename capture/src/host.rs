//! The capture host: one long-running `murmur-capture run` process.
//!
//! Startup takes the host lock (a second host exits straight away), flags
//! itself as running and arms the restart alarm. It then runs the capture
//! controller until SIGINT/SIGTERM. On the way out it lets in-flight
//! uploads settle, re-arms the alarm for a quick relaunch unless the host
//! was disabled, and clears the running flag.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use murmur_common::config::Config;
use murmur_common::failed::FailedDeliverySet;
use murmur_common::host::{HostLock, HostStateStore};
use murmur_common::identity::IdentityStore;
use murmur_common::storage;
use murmur_common::trigger::{TriggerStore, RESTART_ALARM, RESTART_JOB};

use crate::controller::{CaptureController, CaptureSettings, ControllerDeps};
use crate::probes::{DeviceNodePermission, ServerReachability};
use crate::recorder::{ArecordBackend, SegmentRecorder};
use crate::server;
use crate::upload::{HttpApi, RetryPolicy, Uploader};

/// How long shutdown waits for uploads that are still retrying.
const UPLOAD_DRAIN_GRACE: Duration = Duration::from_secs(10);
const LOCK_ATTEMPTS: u32 = 3;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(200);

pub async fn run(config: Config) -> Result<()> {
    std::fs::create_dir_all(&config.state_dir)
        .with_context(|| format!("Cannot create state dir {}", config.state_dir.display()))?;

    let Some(_lock) = acquire_lock(&config.host_lock_path()).await? else {
        info!("Another capture host holds the lock; exiting");
        return Ok(());
    };

    let host_state = HostStateStore::new(config.host_state_path());
    host_state
        .mark_started(std::process::id())
        .context("Cannot write host state")?;
    info!("Capture host started (pid={})", std::process::id());

    let triggers = TriggerStore::new(config.triggers_dir());
    if let Err(e) = triggers.arm_in(RESTART_ALARM, Duration::from_secs(config.restart_alarm_secs))
    {
        warn!("Failed to arm restart alarm: {e}");
    }
    if triggers.deadline(RESTART_JOB).is_none() {
        if let Err(e) = triggers.arm_in(RESTART_JOB, Duration::from_secs(config.restart_job_secs))
        {
            warn!("Failed to schedule restart job: {e}");
        }
    }

    let result = serve(&config).await;

    if host_state.load().enabled {
        let relaunch = Duration::from_secs(config.teardown_relaunch_secs);
        match triggers.arm_in(RESTART_ALARM, relaunch) {
            Ok(()) => info!("Relaunch armed in {relaunch:?}"),
            Err(e) => warn!("Failed to arm relaunch: {e}"),
        }
    }
    if let Err(e) = host_state.mark_stopped() {
        error!("Cannot clear host state: {e}");
    }
    info!("Capture host stopped");
    result
}

/// Everything between "flagged as running" and "about to clear the flag".
async fn serve(config: &Config) -> Result<()> {
    let spool_dir = storage::spool_directory(config)?;
    let reclaimed = storage::reclaim(&spool_dir, config.spool_max_age());
    if reclaimed > 0 {
        info!("Reclaimed {reclaimed} stale segment(s) at startup");
    }

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    ctrlc::set_handler(move || {
        info!("Shutdown signal received");
        signal_token.cancel();
    })
    .context("Cannot set signal handler")?;

    let api = Arc::new(HttpApi::from_config(config)?);
    let failed = Arc::new(FailedDeliverySet::new(config.failed_path()));
    let uploader = Uploader::new(api.clone(), failed.clone(), RetryPolicy::from_config(config));

    let controller = CaptureController::new(ControllerDeps {
        api,
        recorder: Arc::new(SegmentRecorder::new(ArecordBackend::from_config(config))),
        permission: Arc::new(DeviceNodePermission::new(&config.capture_device)),
        reachability: Arc::new(ServerReachability::from_url(&config.server_url)?),
        uploader: uploader.clone(),
        identity: IdentityStore::new(config.identity_path()),
        spool_dir: spool_dir.clone(),
        settings: CaptureSettings::from_config(config),
    });

    let reclaim_task = tokio::spawn(reclaim_timer(
        spool_dir.clone(),
        config.spool_max_age(),
        Duration::from_secs(config.reclaim_interval_secs.max(1)),
        cancel.child_token(),
    ));

    let server_task = config.status_listen_addr.clone().map(|addr| {
        let state = server::AppState {
            status: controller.status_handle(),
            failed: failed.clone(),
            spool_dir: spool_dir.clone(),
            start_time: Instant::now(),
        };
        let token = cancel.child_token();
        tokio::spawn(async move {
            if let Err(e) = server::run(&addr, state, token).await {
                error!("Status server error: {e:#}");
            }
        })
    });

    controller.run(cancel.clone()).await;

    let pending = uploader.in_flight();
    if pending > 0 {
        info!("Waiting for {pending} upload(s) to finish");
    }
    uploader.drain(UPLOAD_DRAIN_GRACE).await;
    cancel.cancel();
    let _ = reclaim_task.await;
    if let Some(task) = server_task {
        let _ = task.await;
    }
    Ok(())
}

/// Take the host lock, retrying briefly: a supervisor checking liveness
/// holds it for an instant.
async fn acquire_lock(path: &Path) -> Result<Option<HostLock>> {
    for attempt in 1..=LOCK_ATTEMPTS {
        if let Some(lock) = HostLock::try_acquire(path)? {
            return Ok(Some(lock));
        }
        if attempt < LOCK_ATTEMPTS {
            tokio::time::sleep(LOCK_RETRY_DELAY).await;
        }
    }
    Ok(None)
}

async fn reclaim_timer(
    spool_dir: PathBuf,
    max_age: Duration,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick is immediate and startup already reclaimed.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let n = storage::reclaim(&spool_dir, max_age);
                if n > 0 {
                    info!("Reclaimed {n} stale segment(s)");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_host_cannot_take_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.lock");
        let held = acquire_lock(&path).await.unwrap();
        assert!(held.is_some());
        assert!(acquire_lock(&path).await.unwrap().is_none());

        drop(held);
        assert!(acquire_lock(&path).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_duplicate_host_exits_without_touching_state() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            state_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let _held = HostLock::try_acquire(&config.host_lock_path())
            .unwrap()
            .unwrap();

        run(config.clone()).await.unwrap();
        let st = HostStateStore::new(config.host_state_path()).load();
        assert!(!st.running);
        assert_eq!(st.pid, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reclaim_timer_removes_old_segments() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("seg-1.wav");
        std::fs::write(&old, b"x").unwrap();
        std::fs::File::options()
            .write(true)
            .open(&old)
            .unwrap()
            .set_modified(std::time::SystemTime::now() - Duration::from_secs(7200))
            .unwrap();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(reclaim_timer(
            dir.path().to_path_buf(),
            Duration::from_secs(3600),
            Duration::from_secs(60),
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_secs(61)).await;
        cancel.cancel();
        task.await.unwrap();
        assert!(!old.exists());
    }
}
