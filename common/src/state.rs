//! Small JSON state files under the state directory.
//!
//! Writes go through a temp file and a rename so a crash mid-write never
//! leaves a truncated file behind for the next process to choke on.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("cannot read {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("cannot write {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },
    #[error("corrupt state file {}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Load `path` as JSON; a missing file yields `T::default()`.
pub fn load_json<T>(path: &Path) -> Result<T, StateError>
where
    T: DeserializeOwned + Default,
{
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(T::default()),
        Err(source) => {
            return Err(StateError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_str(&text).map_err(|source| StateError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

/// Atomically replace `path` with the JSON encoding of `value`.
pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StateError> {
    let write_err = |source| StateError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(write_err)?;
    }
    let payload = serde_json::to_vec_pretty(value).map_err(|e| write_err(io::Error::other(e)))?;

    let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
    std::fs::write(&tmp, payload).map_err(write_err)?;
    std::fs::rename(&tmp, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        write_err(e)
    })
}

/// Run `f` while holding an exclusive `flock` on `<path>.lock`, so a
/// read-modify-write of `path` cannot interleave with another process.
pub fn locked<R>(
    path: &Path,
    f: impl FnOnce() -> Result<R, StateError>,
) -> Result<R, StateError> {
    let lock_path = path.with_extension("lock");
    let lock_err = |source| StateError::Write {
        path: lock_path.clone(),
        source,
    };

    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent).map_err(lock_err)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)
        .map_err(lock_err)?;
    let _guard = Flock::lock(file, FlockArg::LockExclusive)
        .map_err(|(_file, e)| lock_err(io::Error::from(e)))?;
    f()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let set: BTreeSet<String> = load_json(&dir.path().join("nope.json")).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn test_save_creates_parent_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("v.json");
        save_json(&path, &vec![1, 2, 3]).unwrap();

        let back: Vec<i32> = load_json(&path).unwrap();
        assert_eq!(back, vec![1, 2, 3]);

        let names: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .flatten()
            .map(|e| e.file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[test]
    fn test_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = load_json::<Vec<i32>>(&path).unwrap_err();
        assert!(matches!(err, StateError::Corrupt { .. }));
    }
}
