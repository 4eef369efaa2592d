//! Murmur capture – records audio segments under remote control and
//! delivers them to the collection server.
//!
//! Subcommands:
//! * `run`        – the capture host itself
//! * `supervise`  – trigger daemon that keeps the host alive
//! * `boot`       – one-shot boot trigger (systemd unit / `@reboot`)
//! * `start`/`stop` – enable or disable the host
//! * `status`, `failed`, `register` – inspection and provisioning

mod controller;
mod host;
mod probes;
mod recorder;
mod server;
mod supervisor;
mod upload;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio_util::sync::CancellationToken;
use tracing::info;

use murmur_common::config::{self, Config};
use murmur_common::failed::FailedDeliverySet;
use murmur_common::host::{self as host_state, HostStateStore};
use murmur_common::identity::IdentityStore;
use murmur_common::trigger::{TriggerStore, RESTART_ALARM, RESTART_JOB};

use supervisor::{EnsureOutcome, ExecLauncher, Supervisor};
use upload::HttpApi;

#[derive(Parser)]
#[command(name = "murmur-capture", version, about = "Remote-controlled audio segment capture")]
struct Cli {
    /// Configuration file (KEY=VALUE).
    #[arg(short, long, default_value = Config::default_path())]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the capture host in the foreground.
    Run,
    /// Keep the host alive: boot trigger, restart job, restart alarm and
    /// monitor worker.
    Supervise,
    /// Boot trigger: start the host and arm the restart triggers.
    Boot,
    /// Enable the host and start it if it is not running.
    Start,
    /// Disable the host and terminate it.
    Stop,
    /// Show host, identity and delivery state.
    Status,
    /// List segments whose upload was given up.
    Failed,
    /// Register this device with the server and store its id.
    Register {
        name: String,
        #[arg(long, default_value_t = 1)]
        created_by: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = config::load(&cli.config).context("Config load failed")?;

    match cli.command {
        Command::Run => host::run(config).await,
        Command::Supervise => supervise(&config, cli.config).await,
        Command::Boot => {
            supervisor(&config, cli.config)?.on_boot().await;
            Ok(())
        }
        Command::Start => start(&config, cli.config).await,
        Command::Stop => stop(&config),
        Command::Status => status(&config),
        Command::Failed => failed(&config),
        Command::Register { name, created_by } => register(&config, &name, created_by).await,
    }
}

fn supervisor(config: &Config, config_path: PathBuf) -> Result<Supervisor> {
    let launcher = ExecLauncher::current(config_path)?;
    Ok(Supervisor::new(config, Arc::new(launcher)))
}

async fn supervise(config: &Config, config_path: PathBuf) -> Result<()> {
    let supervisor = Arc::new(supervisor(config, config_path)?);
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    ctrlc::set_handler(move || {
        info!("Shutdown signal received");
        token.cancel();
    })
    .context("Cannot set signal handler")?;

    supervisor.run(cancel).await;
    Ok(())
}

async fn start(config: &Config, config_path: PathBuf) -> Result<()> {
    HostStateStore::new(config.host_state_path())
        .set_enabled(true)
        .context("Cannot enable host")?;
    match supervisor(config, config_path)?.ensure_running("start").await? {
        EnsureOutcome::Launched => println!("Capture host launched"),
        EnsureOutcome::AlreadyRunning => println!("Capture host already running"),
        EnsureOutcome::Disabled => println!("Capture host is disabled"),
    }
    Ok(())
}

fn stop(config: &Config) -> Result<()> {
    let store = HostStateStore::new(config.host_state_path());
    store.set_enabled(false).context("Cannot disable host")?;
    TriggerStore::new(config.triggers_dir())
        .disarm(RESTART_ALARM)
        .context("Cannot disarm restart alarm")?;

    // Only a pid vouched for by the held host lock is signalled; a stale
    // flag may name an unrelated process.
    let state = store.load();
    match host_state::live_host_pid(&state, &config.host_lock_path()) {
        Some(pid) => {
            let raw = i32::try_from(pid).context("pid out of range")?;
            kill(Pid::from_raw(raw), Signal::SIGTERM)
                .with_context(|| format!("Cannot signal host {pid}"))?;
            println!("Sent SIGTERM to capture host (pid {pid})");
        }
        None => println!("Capture host disabled (was not running)"),
    }
    Ok(())
}

fn status(config: &Config) -> Result<()> {
    let state = HostStateStore::new(config.host_state_path()).load();
    let alive = host_state::host_alive(&config.host_lock_path());
    let identity = IdentityStore::new(config.identity_path()).load();
    let failed = FailedDeliverySet::new(config.failed_path())
        .names()
        .context("Cannot read failed set")?;
    let triggers = TriggerStore::new(config.triggers_dir());

    let fmt_deadline = |name: &str| {
        triggers
            .deadline(name)
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "not armed".to_string())
    };

    println!("enabled:        {}", state.enabled);
    println!("running:        {alive}");
    if let Some(pid) = state.pid {
        println!("pid:            {pid}");
    }
    if let Some(started) = state.started_at {
        println!("started at:     {}", started.to_rfc3339());
    }
    println!(
        "device id:      {}",
        identity.registered_id().unwrap_or("(unregistered)")
    );
    println!("remote state:   {}", identity.last_known_remote_state);
    println!("failed uploads: {}", failed.len());
    println!("restart job:    {}", fmt_deadline(RESTART_JOB));
    println!("restart alarm:  {}", fmt_deadline(RESTART_ALARM));
    Ok(())
}

fn failed(config: &Config) -> Result<()> {
    let names = FailedDeliverySet::new(config.failed_path())
        .names()
        .context("Cannot read failed set")?;
    for name in names {
        println!("{name}");
    }
    Ok(())
}

async fn register(config: &Config, name: &str, created_by: i64) -> Result<()> {
    let api = HttpApi::from_config(config)?;
    let device_id = api.register(name, created_by).await?;
    std::fs::create_dir_all(&config.state_dir)
        .with_context(|| format!("Cannot create state dir {}", config.state_dir.display()))?;
    IdentityStore::new(config.identity_path())
        .set_device_id(&device_id)
        .context("Cannot store device id")?;
    println!("Registered as device {device_id}");
    Ok(())
}
