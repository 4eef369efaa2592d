//! Wire types for the collection server API and the local status server.

use serde::{Deserialize, Serialize};

/// Desired capture state as reported by the server for one device.
///
/// Never persisted as authoritative – it is re-derived on every poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteCaptureState {
    Started,
    Stopped,
    #[default]
    Unknown,
}

impl RemoteCaptureState {
    /// Map the server's `recording_status` string; anything unexpected is
    /// `Unknown`.
    pub fn from_status(status: &str) -> Self {
        match status.trim() {
            "started" => Self::Started,
            "stopped" => Self::Stopped,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for RemoteCaptureState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Unknown => "unknown",
        })
    }
}

/// `GET /phones/{id}/status` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub recording_status: String,
}

/// `POST /phones` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub phone_name: String,
    pub created_by: i64,
}

/// `POST /phones` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub phone_id: i64,
}

/// A segment file sitting in the spool directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentInfo {
    pub filename: String,
    pub size: u64,
    /// ISO-8601 modification timestamp.
    pub modified: String,
}

/// Local health-check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Passive status line, e.g. "Recording" or "Mic permission required".
    pub status: String,
    pub recording: bool,
    pub uptime_secs: u64,
}
