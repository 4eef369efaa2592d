//! Segment naming and post-capture validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

/// One bounded-duration capture file, the unit of upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// `seg-<unix millis>`, derived from the creation time.
    pub id: String,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub target_duration: Duration,
}

impl Segment {
    /// A new segment in `dir`, named after `created_at`.
    pub fn new(dir: &Path, created_at: DateTime<Utc>, target_duration: Duration) -> Self {
        let id = format!("seg-{}", created_at.timestamp_millis());
        let path = dir.join(format!("{id}.wav"));
        Segment {
            id,
            path,
            created_at,
            target_duration,
        }
    }

    /// Like [`Segment::new`], stepping the timestamp forward one
    /// millisecond at a time until the file name is free.
    pub fn new_unique(dir: &Path, created_at: DateTime<Utc>, target_duration: Duration) -> Self {
        let mut seg = Self::new(dir, created_at, target_duration);
        while seg.path.exists() {
            let next = seg.created_at + chrono::Duration::milliseconds(1);
            seg = Self::new(dir, next, target_duration);
        }
        seg
    }

    pub fn file_name(&self) -> String {
        file_name(&self.path)
    }
}

/// The bare file name of `path`, which is what the failed set stores.
pub fn file_name(path: &Path) -> String {
    path.file_name()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string()
}

/// What a finished segment file actually contains.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentStats {
    pub size: u64,
    pub duration: Duration,
}

/// Read the WAV header of a finished segment.
///
/// Fails when the file is missing or the header is not a valid WAV, which
/// usually means the recorder was killed before it could finalize.
pub fn inspect(path: &Path) -> Result<SegmentStats> {
    let size = std::fs::metadata(path)
        .with_context(|| format!("Cannot stat {}", path.display()))?
        .len();
    let reader =
        hound::WavReader::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
    let spec = reader.spec();
    let frames = reader.duration();
    let duration = if spec.sample_rate == 0 {
        Duration::ZERO
    } else {
        Duration::from_secs_f64(frames as f64 / spec.sample_rate as f64)
    };
    Ok(SegmentStats { size, duration })
}
