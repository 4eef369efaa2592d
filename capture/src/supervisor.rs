//! Lifecycle supervisor – keeps a capture host running.
//!
//! Four triggers call the same idempotent [`Supervisor::ensure_running`]
//! without coordinating with each other:
//!
//! 1. boot: once, when `boot` runs or the supervisor daemon comes up;
//! 2. restart job: a persisted deadline that reschedules itself every
//!    `RESTART_JOB_SECS`;
//! 3. restart alarm: a persisted one-shot deadline, re-armed by the host on
//!    every start, by the host on teardown, and by itself when it fires;
//! 4. monitor worker: a coarse periodic liveness check with linear backoff
//!    when a launch fails.
//!
//! Launching twice is harmless: the second host finds the host lock taken
//! and exits.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use murmur_common::config::Config;
use murmur_common::host::{self, HostStateStore};
use murmur_common::trigger::{TriggerStore, RESTART_ALARM, RESTART_JOB};

/// How often a pending deadline is re-read from disk, so a re-arm made by
/// another process is noticed.
const DEADLINE_RECHECK: Duration = Duration::from_secs(1);

/// Starts a host process. Must not wait for it to exit.
#[async_trait]
pub trait HostLauncher: Send + Sync {
    async fn launch(&self) -> Result<()>;
}

/// Re-executes this binary as `murmur-capture --config <path> run`,
/// detached into its own process group.
pub struct ExecLauncher {
    exe: PathBuf,
    config_path: PathBuf,
}

impl ExecLauncher {
    pub fn current(config_path: PathBuf) -> Result<Self> {
        let exe = std::env::current_exe().context("Cannot locate own executable")?;
        Ok(Self { exe, config_path })
    }
}

#[async_trait]
impl HostLauncher for ExecLauncher {
    async fn launch(&self) -> Result<()> {
        let child = tokio::process::Command::new(&self.exe)
            .arg("--config")
            .arg(&self.config_path)
            .arg("run")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .process_group(0)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.exe.display()))?;
        info!("Launched capture host (pid={:?})", child.id());
        // Dropping the handle leaves the host running; tokio reaps it.
        drop(child);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    Disabled,
    AlreadyRunning,
    Launched,
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub restart_job: Duration,
    pub restart_alarm: Duration,
    pub monitor_interval: Duration,
    pub monitor_backoff: Duration,
}

impl SupervisorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            restart_job: Duration::from_secs(config.restart_job_secs),
            restart_alarm: Duration::from_secs(config.restart_alarm_secs),
            monitor_interval: Duration::from_secs(config.monitor_interval_secs),
            monitor_backoff: Duration::from_secs(config.monitor_backoff_secs),
        }
    }
}

pub struct Supervisor {
    host_state: HostStateStore,
    lock_path: PathBuf,
    triggers: TriggerStore,
    launcher: Arc<dyn HostLauncher>,
    settings: SupervisorSettings,
}

impl Supervisor {
    pub fn new(config: &Config, launcher: Arc<dyn HostLauncher>) -> Self {
        Self {
            host_state: HostStateStore::new(config.host_state_path()),
            lock_path: config.host_lock_path(),
            triggers: TriggerStore::new(config.triggers_dir()),
            launcher,
            settings: SupervisorSettings::from_config(config),
        }
    }

    /// Launch the host unless it is disabled or already alive.
    pub async fn ensure_running(&self, source: &str) -> Result<EnsureOutcome> {
        let state = self.host_state.load();
        if !state.enabled {
            debug!("[{source}] host disabled; not launching");
            return Ok(EnsureOutcome::Disabled);
        }
        if host::host_alive(&self.lock_path) {
            debug!("[{source}] host already running");
            return Ok(EnsureOutcome::AlreadyRunning);
        }
        info!("[{source}] host not running; launching");
        self.launcher.launch().await?;
        Ok(EnsureOutcome::Launched)
    }

    /// Boot trigger: launch now and arm both persisted triggers.
    pub async fn on_boot(&self) {
        if let Err(e) = self.ensure_running("boot").await {
            warn!("Failed to start host on boot: {e:#}");
        }
        if let Err(e) = self
            .triggers
            .arm_in(RESTART_ALARM, self.settings.restart_alarm)
        {
            warn!("Failed to arm restart alarm: {e}");
        }
        if let Err(e) = self.triggers.arm_in(RESTART_JOB, self.settings.restart_job) {
            warn!("Failed to schedule restart job: {e}");
        }
    }

    /// Run every trigger until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            "Supervisor running (job every {:?}, alarm {:?}, monitor every {:?})",
            self.settings.restart_job, self.settings.restart_alarm, self.settings.monitor_interval
        );
        self.on_boot().await;

        tokio::join!(
            self.clone().job_loop(cancel.clone()),
            self.clone().alarm_loop(cancel.clone()),
            self.clone().monitor_loop(cancel.clone()),
        );
        info!("Supervisor stopped");
    }

    /// Restart job: fire, reschedule, repeat. An unarmed job arms itself,
    /// so the chain survives a lost deadline file.
    pub async fn job_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            if self.triggers.deadline(RESTART_JOB).is_none() {
                if let Err(e) = self.triggers.arm_in(RESTART_JOB, self.settings.restart_job) {
                    warn!("Failed to schedule restart job: {e}");
                }
            }
            if !self.wait_for_deadline(RESTART_JOB, &cancel).await {
                return;
            }
            if let Err(e) = self.ensure_running(RESTART_JOB).await {
                warn!("Failed to start host from restart job: {e:#}");
            }
            if let Err(e) = self.triggers.arm_in(RESTART_JOB, self.settings.restart_job) {
                warn!("Failed to reschedule restart job: {e}");
            }
        }
    }

    /// Restart alarm: waits for whoever armed it, fires once, re-arms.
    pub async fn alarm_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            if !self.wait_for_deadline(RESTART_ALARM, &cancel).await {
                return;
            }
            if let Err(e) = self.ensure_running(RESTART_ALARM).await {
                warn!("Failed to start host from restart alarm: {e:#}");
            }
            if let Err(e) = self
                .triggers
                .arm_in(RESTART_ALARM, self.settings.restart_alarm)
            {
                warn!("Failed to re-arm restart alarm: {e}");
            }
        }
    }

    /// Monitor worker: check liveness every interval; after a failed launch
    /// retry after `backoff × attempt`, never later than one interval.
    pub async fn monitor_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut failures: u32 = 0;
        loop {
            match self.ensure_running("monitor").await {
                Ok(outcome) => {
                    failures = 0;
                    if outcome == EnsureOutcome::Launched {
                        if let Err(e) =
                            self.triggers.arm_in(RESTART_JOB, self.settings.restart_job)
                        {
                            warn!("Failed to schedule restart job from monitor: {e}");
                        }
                    }
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    warn!("Monitor failed to start host (attempt {failures}): {e:#}");
                }
            }

            let delay = self.monitor_delay(failures);
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn monitor_delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            self.settings.monitor_interval
        } else {
            self.settings
                .monitor_backoff
                .saturating_mul(failures)
                .min(self.settings.monitor_interval)
        }
    }

    /// Sleep until the persisted deadline `name` is due. Returns false if
    /// cancelled first.
    async fn wait_for_deadline(&self, name: &str, cancel: &CancellationToken) -> bool {
        loop {
            let nap = match self.triggers.deadline(name) {
                None => DEADLINE_RECHECK,
                Some(at) => match (at - Utc::now()).to_std() {
                    // Negative durations fail to convert: already due.
                    Err(_) => return true,
                    Ok(left) if left.is_zero() => return true,
                    Ok(left) => left.min(DEADLINE_RECHECK),
                },
            };
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use murmur_common::host::HostLock;

    /// Launcher that "starts" a host the way `run` does: take the host
    /// lock and flag our own pid. Optionally fails the first few times.
    struct FakeLauncher {
        host_state: HostStateStore,
        lock_path: PathBuf,
        held: Mutex<Option<HostLock>>,
        launches: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait]
    impl HostLauncher for FakeLauncher {
        async fn launch(&self) -> Result<()> {
            let n = self.launches.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                anyhow::bail!("spawn failed");
            }
            let lock = HostLock::try_acquire(&self.lock_path)?
                .ok_or_else(|| anyhow::anyhow!("host lock already held"))?;
            *self.held.lock().unwrap() = Some(lock);
            self.host_state.mark_started(std::process::id())?;
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        config: Config,
        launcher: Arc<FakeLauncher>,
        supervisor: Arc<Supervisor>,
    }

    fn fixture(fail_first: usize, settings: SupervisorSettings) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            state_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let launcher = Arc::new(FakeLauncher {
            host_state: HostStateStore::new(config.host_state_path()),
            lock_path: config.host_lock_path(),
            held: Mutex::new(None),
            launches: AtomicUsize::new(0),
            fail_first,
        });
        let supervisor =
            Arc::new(Supervisor::new(&config, launcher.clone()).with_settings(settings));
        Fixture {
            _dir: dir,
            config,
            launcher,
            supervisor,
        }
    }

    impl Supervisor {
        fn with_settings(mut self, settings: SupervisorSettings) -> Self {
            self.settings = settings;
            self
        }

        fn is_host_alive(&self) -> bool {
            host::host_alive(&self.lock_path)
        }
    }

    fn fast_settings() -> SupervisorSettings {
        SupervisorSettings {
            restart_job: Duration::from_secs(60),
            restart_alarm: Duration::from_secs(60),
            monitor_interval: Duration::from_millis(300),
            monitor_backoff: Duration::from_millis(50),
        }
    }

    impl Fixture {
        fn launches(&self) -> usize {
            self.launcher.launches.load(Ordering::SeqCst)
        }

        /// Simulate a hard kill: the lock is released by the kernel but the
        /// flag still says running.
        fn kill_host(&self) {
            self.launcher.held.lock().unwrap().take();
            let store = HostStateStore::new(self.config.host_state_path());
            store.mark_started(u32::MAX).unwrap();
        }
    }

    #[tokio::test]
    async fn test_ensure_running_is_idempotent() {
        let f = fixture(0, fast_settings());
        assert_eq!(
            f.supervisor.ensure_running("test").await.unwrap(),
            EnsureOutcome::Launched
        );
        assert_eq!(
            f.supervisor.ensure_running("test").await.unwrap(),
            EnsureOutcome::AlreadyRunning
        );
        assert_eq!(f.launches(), 1);
    }

    #[tokio::test]
    async fn test_disabled_host_is_never_launched() {
        let f = fixture(0, fast_settings());
        HostStateStore::new(f.config.host_state_path())
            .set_enabled(false)
            .unwrap();
        assert_eq!(
            f.supervisor.ensure_running("test").await.unwrap(),
            EnsureOutcome::Disabled
        );
        assert_eq!(f.launches(), 0);
    }

    #[tokio::test]
    async fn test_held_lock_counts_as_alive() {
        let f = fixture(0, fast_settings());
        f.kill_host();
        let _lock = HostLock::try_acquire(&f.config.host_lock_path())
            .unwrap()
            .unwrap();
        assert_eq!(
            f.supervisor.ensure_running("test").await.unwrap(),
            EnsureOutcome::AlreadyRunning
        );
    }

    #[tokio::test]
    async fn test_stale_flag_with_reused_pid_is_relaunched() {
        let f = fixture(0, fast_settings());
        // After a power loss the flag still names the old pid, which now
        // belongs to an unrelated live process.
        let mut unrelated = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        HostStateStore::new(f.config.host_state_path())
            .mark_started(unrelated.id())
            .unwrap();

        f.supervisor.on_boot().await;
        assert_eq!(f.launches(), 1);
        assert_eq!(
            f.supervisor.ensure_running("monitor").await.unwrap(),
            EnsureOutcome::AlreadyRunning
        );
        assert_eq!(f.launches(), 1);

        unrelated.kill().unwrap();
        unrelated.wait().unwrap();
    }

    #[tokio::test]
    async fn test_boot_launches_and_arms_triggers() {
        let f = fixture(0, fast_settings());
        f.supervisor.on_boot().await;
        assert_eq!(f.launches(), 1);

        let triggers = TriggerStore::new(f.config.triggers_dir());
        assert!(triggers.deadline(RESTART_ALARM).unwrap() > Utc::now());
        assert!(triggers.deadline(RESTART_JOB).unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn test_alarm_fires_and_rearms() {
        let f = fixture(0, fast_settings());
        f.kill_host();
        let triggers = TriggerStore::new(f.config.triggers_dir());
        triggers
            .arm(RESTART_ALARM, Utc::now() - chrono::Duration::seconds(1))
            .unwrap();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(f.supervisor.clone().alarm_loop(cancel.clone()));
        for _ in 0..50 {
            if f.launches() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(f.launches(), 1);
        assert!(triggers.deadline(RESTART_ALARM).unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn test_overdue_job_fires_and_reschedules() {
        let f = fixture(0, fast_settings());
        f.kill_host();
        let triggers = TriggerStore::new(f.config.triggers_dir());
        triggers
            .arm(RESTART_JOB, Utc::now() - chrono::Duration::seconds(30))
            .unwrap();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(f.supervisor.clone().job_loop(cancel.clone()));
        for _ in 0..50 {
            if f.launches() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(f.launches(), 1);
        let next = triggers.deadline(RESTART_JOB).unwrap();
        assert!(next > Utc::now() + chrono::Duration::seconds(50));
    }

    #[tokio::test]
    async fn test_monitor_alone_restores_killed_host() {
        let settings = fast_settings();
        let ceiling = settings.monitor_interval + settings.monitor_backoff;
        let f = fixture(0, settings);
        f.supervisor.ensure_running("test").await.unwrap();
        assert!(f.supervisor.is_host_alive());

        let cancel = CancellationToken::new();
        let task = tokio::spawn(f.supervisor.clone().monitor_loop(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;

        f.kill_host();
        assert!(!f.supervisor.is_host_alive());
        let killed_at = tokio::time::Instant::now();
        while !f.supervisor.is_host_alive() {
            assert!(
                killed_at.elapsed() <= ceiling + Duration::from_millis(200),
                "host not restored within {ceiling:?}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        task.await.unwrap();
        assert_eq!(f.launches(), 2);
    }

    #[tokio::test]
    async fn test_monitor_backs_off_linearly_on_failure() {
        let f = fixture(2, fast_settings());
        f.kill_host();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(f.supervisor.clone().monitor_loop(cancel.clone()));
        // Attempts at ~0ms, ~50ms, ~150ms; the third succeeds.
        tokio::time::sleep(Duration::from_millis(250)).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(f.launches(), 3);
        assert!(f.supervisor.is_host_alive());
    }

    #[test]
    fn test_monitor_delay_is_capped() {
        let f = fixture(0, fast_settings());
        assert_eq!(f.supervisor.monitor_delay(0), Duration::from_millis(300));
        assert_eq!(f.supervisor.monitor_delay(1), Duration::from_millis(50));
        assert_eq!(f.supervisor.monitor_delay(3), Duration::from_millis(150));
        assert_eq!(f.supervisor.monitor_delay(100), Duration::from_millis(300));
    }
}
