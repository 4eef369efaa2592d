//! Upload client – talks to the collection server.
//!
//! [`RemoteApi`] is a single attempt per call and never surfaces transport
//! errors: the poller must survive network blips, and the retry driver
//! treats "server rejected" and "network failed" alike.
//!
//! [`deliver_with_retry`] layers bounded exponential backoff on top and
//! records exhausted segments in the [`FailedDeliverySet`].
//!
//! Segment bodies are streamed from disk. There is no deadline on a whole
//! upload, only on connecting and on going quiet: an upload fails once no
//! bytes have left the file for the idle timeout.

use std::collections::BTreeSet;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{self, Poll};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::io::ReaderStream;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use murmur_common::config::Config;
use murmur_common::failed::FailedDeliverySet;
use murmur_common::protocol::{
    RegisterRequest, RegisterResponse, RemoteCaptureState, StatusResponse,
};
use murmur_common::segment;

#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Desired capture state for `device_id`; `Unknown` on any failure.
    async fn query_remote_state(&self, device_id: &str) -> RemoteCaptureState;
    /// One upload attempt; true only on a 2xx response.
    async fn deliver(&self, device_id: &str, path: &Path) -> bool;
}

// ── HTTP implementation ──────────────────────────────────────────────────

/// How often a running upload is checked for progress.
const STALL_CHECK: Duration = Duration::from_millis(250);

pub struct HttpApi {
    client: reqwest::Client,
    base_url: String,
    /// Connect timeout, deadline for small JSON calls and the longest an
    /// upload may go without progress.
    timeout: Duration,
}

impl HttpApi {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .context("Cannot create HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            &config.server_url,
            Duration::from_secs(config.http_timeout_secs),
        )
    }

    /// Register this device and return the id the server assigned.
    pub async fn register(&self, name: &str, created_by: i64) -> Result<String> {
        let url = format!("{}/phones", self.base_url);
        let resp = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(&RegisterRequest {
                phone_name: name.to_string(),
                created_by,
            })
            .send()
            .await
            .context("POST /phones")?;

        if !resp.status().is_success() {
            anyhow::bail!("POST /phones returned {}", resp.status());
        }
        let body: RegisterResponse = resp.json().await.context("Parse registration JSON")?;
        Ok(body.phone_id.to_string())
    }

    async fn fetch_status(&self, device_id: &str) -> Result<RemoteCaptureState> {
        let url = format!("{}/phones/{device_id}/status", self.base_url);
        let resp = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .context("GET status")?;

        if !resp.status().is_success() {
            anyhow::bail!("GET {url} returned {}", resp.status());
        }
        let body: StatusResponse = resp.json().await.context("Parse status JSON")?;
        Ok(RemoteCaptureState::from_status(&body.recording_status))
    }

    async fn try_upload(&self, device_id: &str, path: &Path) -> Result<()> {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("Cannot open {}", path.display()))?;
        let len = file
            .metadata()
            .await
            .with_context(|| format!("Cannot stat {}", path.display()))?
            .len();

        let last_progress = Arc::new(Mutex::new(Instant::now()));
        let reader = ProgressReader {
            inner: file,
            last_progress: last_progress.clone(),
        };
        let body = reqwest::Body::wrap_stream(ReaderStream::new(reader));
        let part = Part::stream_with_length(body, len)
            .file_name(segment::file_name(path))
            .mime_str("audio/wav")?;
        let form = Form::new()
            .text("phone_id", device_id.to_string())
            .part("file", part);

        let url = format!("{}/recordings/upload", self.base_url);
        let send = self.client.post(&url).multipart(form).send();
        let resp = self
            .until_stalled(send, &last_progress)
            .await
            .context("POST /recordings/upload")?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("upload returned {status}");
        }
        match tokio::time::timeout(self.timeout, resp.text()).await {
            Ok(Ok(text)) => debug!("Server response: {text}"),
            Ok(Err(e)) => debug!("Cannot read server response: {e}"),
            Err(_) => debug!("Server response body timed out"),
        }
        Ok(())
    }

    /// Drive `request` until it completes or `last_progress` is older than
    /// the idle timeout.
    async fn until_stalled<T>(
        &self,
        request: impl Future<Output = reqwest::Result<T>>,
        last_progress: &Mutex<Instant>,
    ) -> Result<T> {
        tokio::pin!(request);
        let mut check = tokio::time::interval(STALL_CHECK);
        check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                result = &mut request => return Ok(result?),
                _ = check.tick() => {
                    let idle = last_progress
                        .lock()
                        .map(|at| at.elapsed())
                        .unwrap_or_default();
                    if idle > self.timeout {
                        anyhow::bail!("upload stalled for {}ms", idle.as_millis());
                    }
                }
            }
        }
    }
}

/// File reader that stamps every read that yielded bytes.
struct ProgressReader<R> {
    inner: R,
    last_progress: Arc<Mutex<Instant>>,
}

impl<R: AsyncRead + Unpin> AsyncRead for ProgressReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if matches!(poll, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            if let Ok(mut at) = self.last_progress.lock() {
                *at = Instant::now();
            }
        }
        poll
    }
}

#[async_trait]
impl RemoteApi for HttpApi {
    async fn query_remote_state(&self, device_id: &str) -> RemoteCaptureState {
        match self.fetch_status(device_id).await {
            Ok(state) => state,
            Err(e) => {
                warn!("Status check failed: {e:#}");
                RemoteCaptureState::Unknown
            }
        }
    }

    async fn deliver(&self, device_id: &str, path: &Path) -> bool {
        match self.try_upload(device_id, path).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Upload of {} failed: {e:#}", path.display());
                false
            }
        }
    }
}

// ── retry driver ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.max_upload_attempts.max(1),
            initial_backoff: Duration::from_secs(config.upload_backoff_secs),
        }
    }

    /// Delay after the `failed`-th failed attempt (1-based), before the
    /// next one.
    pub fn backoff(&self, failed: u32) -> Duration {
        let factor = 2u32.saturating_pow(failed.saturating_sub(1));
        self.initial_backoff.saturating_mul(factor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { attempts: u32 },
    Exhausted,
}

/// Deliver `path` with bounded exponential backoff.
///
/// On success the name is dropped from the failed set; on exhaustion it is
/// added. The file itself is left alone – that is the caller's decision.
pub async fn deliver_with_retry(
    api: &dyn RemoteApi,
    failed: &FailedDeliverySet,
    policy: &RetryPolicy,
    device_id: &str,
    path: &Path,
) -> DeliveryOutcome {
    let name = segment::file_name(path);

    for attempt in 1..=policy.max_attempts {
        if api.deliver(device_id, path).await {
            if let Err(e) = failed.remove(&name) {
                warn!("Cannot clear {name} from failed set: {e}");
            }
            info!("Uploaded {name} (attempt {attempt})");
            return DeliveryOutcome::Delivered { attempts: attempt };
        }
        if attempt < policy.max_attempts {
            let delay = policy.backoff(attempt);
            warn!(
                "Upload attempt {attempt} failed for {name}, retrying in {}ms",
                delay.as_millis()
            );
            tokio::time::sleep(delay).await;
        }
    }

    error!(
        "Failed to upload {name} after {} attempts",
        policy.max_attempts
    );
    if let Err(e) = failed.add(&name) {
        error!("Cannot record {name} in failed set: {e}");
    }
    DeliveryOutcome::Exhausted
}

/// Hands finished segments to the retry driver on detached tasks.
#[derive(Clone)]
pub struct Uploader {
    api: Arc<dyn RemoteApi>,
    failed: Arc<FailedDeliverySet>,
    policy: RetryPolicy,
    tracker: TaskTracker,
    pending: Arc<Mutex<BTreeSet<PathBuf>>>,
}

impl Uploader {
    pub fn new(api: Arc<dyn RemoteApi>, failed: Arc<FailedDeliverySet>, policy: RetryPolicy) -> Self {
        Self {
            api,
            failed,
            policy,
            tracker: TaskTracker::new(),
            pending: Arc::default(),
        }
    }

    /// Upload `path` in the background; the file is deleted only after a
    /// confirmed delivery.
    pub fn submit(&self, device_id: String, path: PathBuf) -> JoinHandle<DeliveryOutcome> {
        let api = self.api.clone();
        let failed = self.failed.clone();
        let policy = self.policy;
        let pending = self.pending.clone();
        if let Ok(mut set) = pending.lock() {
            set.insert(path.clone());
        }
        self.tracker.spawn(async move {
            let outcome =
                deliver_with_retry(api.as_ref(), &failed, &policy, &device_id, &path).await;
            if let Ok(mut set) = pending.lock() {
                set.remove(&path);
            }
            match outcome {
                DeliveryOutcome::Delivered { .. } => match std::fs::remove_file(&path) {
                    Ok(()) => debug!("Deleted uploaded {}", path.display()),
                    Err(e) => warn!("Cannot delete uploaded {}: {e}", path.display()),
                },
                DeliveryOutcome::Exhausted => {
                    info!("Keeping {} on disk for later re-drive", path.display());
                }
            }
            outcome
        })
    }

    /// Number of uploads still in flight.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Wait up to `grace` for in-flight uploads to settle. Segments still
    /// uploading after that are recorded in the failed set.
    pub async fn drain(&self, grace: Duration) {
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_ok() {
            return;
        }
        let stranded: Vec<PathBuf> = self
            .pending
            .lock()
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        warn!(
            "{} upload(s) still in flight at shutdown; files stay in the spool",
            stranded.len()
        );
        for path in stranded {
            let name = segment::file_name(&path);
            if let Err(e) = self.failed.add(&name) {
                error!("Cannot record {name} in failed set: {e}");
            }
        }
    }
}
