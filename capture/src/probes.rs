//! Environment checks the controller consults every cycle: capture
//! permission and network reachability.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Whether the process may use the capture device right now.
pub trait CapturePermission: Send + Sync {
    fn granted(&self) -> bool;
}

/// Permission means the configured device node (a file such as
/// `/dev/snd/pcmC0D0c` or the `/dev/snd` directory) is accessible.
pub struct DeviceNodePermission {
    path: PathBuf,
}

impl DeviceNodePermission {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CapturePermission for DeviceNodePermission {
    fn granted(&self) -> bool {
        if self.path.is_dir() {
            std::fs::read_dir(&self.path).is_ok()
        } else {
            std::fs::File::open(&self.path).is_ok()
        }
    }
}

#[async_trait]
pub trait Reachability: Send + Sync {
    async fn is_online(&self) -> bool;
}

/// Online means a TCP connection to the server's host and port succeeds.
pub struct ServerReachability {
    host: String,
    port: u16,
}

impl ServerReachability {
    pub fn from_url(server_url: &str) -> anyhow::Result<Self> {
        let url = reqwest::Url::parse(server_url)?;
        let host = url
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("SERVER_URL has no host: {server_url}"))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| anyhow::anyhow!("SERVER_URL has no port: {server_url}"))?;
        Ok(Self { host, port })
    }
}

#[async_trait]
impl Reachability for ServerReachability {
    async fn is_online(&self) -> bool {
        let connect = TcpStream::connect((self.host.as_str(), self.port));
        match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("{}:{} unreachable: {e}", self.host, self.port);
                false
            }
            Err(_) => {
                debug!("{}:{} connect timed out", self.host, self.port);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_node_permission() {
        let dir = tempfile::tempdir().unwrap();
        assert!(DeviceNodePermission::new(dir.path()).granted());

        let node = dir.path().join("pcmC0D0c");
        assert!(!DeviceNodePermission::new(&node).granted());
        std::fs::write(&node, b"").unwrap();
        assert!(DeviceNodePermission::new(&node).granted());
    }

    #[test]
    fn test_reachability_from_url() {
        let r = ServerReachability::from_url("http://10.0.0.5:8000/api").unwrap();
        assert_eq!((r.host.as_str(), r.port), ("10.0.0.5", 8000));
        let r = ServerReachability::from_url("https://collect.example.org/api").unwrap();
        assert_eq!(r.port, 443);
        assert!(ServerReachability::from_url("not a url").is_err());
    }

    #[tokio::test]
    async fn test_is_online() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let url = format!("http://{addr}/api");
        assert!(ServerReachability::from_url(&url).unwrap().is_online().await);

        drop(listener);
        assert!(!ServerReachability::from_url(&url).unwrap().is_online().await);
    }
}
