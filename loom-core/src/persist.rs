//! Durable snapshots of project memory.
//!
//! World state is written as pretty JSON with a format version, through a
//! temporary file and a rename so a crash mid-write never leaves a torn
//! snapshot behind.

use crate::world::WorldState;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;

/// Errors from persistence operations.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
}

/// Current snapshot file version.
const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    project_id: &'a str,
    state: &'a WorldState,
}

#[derive(Deserialize)]
struct Snapshot {
    version: u32,
    state: WorldState,
}

/// Write the full world state for a project.
pub async fn save_snapshot(
    path: impl AsRef<Path>,
    project_id: &str,
    state: &WorldState,
) -> Result<(), PersistError> {
    let snapshot = SnapshotRef {
        version: SNAPSHOT_VERSION,
        project_id,
        state,
    };
    write_json_atomic(path, &snapshot).await
}

/// Load a world state snapshot, or `None` if the project has never been saved.
pub async fn load_snapshot(path: impl AsRef<Path>) -> Result<Option<WorldState>, PersistError> {
    let path = path.as_ref();
    if !fs::try_exists(path).await? {
        return Ok(None);
    }

    let content = fs::read_to_string(path).await?;
    let snapshot: Snapshot = serde_json::from_str(&content)?;

    if snapshot.version != SNAPSHOT_VERSION {
        return Err(PersistError::VersionMismatch {
            expected: SNAPSHOT_VERSION,
            found: snapshot.version,
        });
    }

    Ok(Some(snapshot.state))
}

/// Serialize `value` next to `path` and rename it into place.
pub async fn write_json_atomic<T: Serialize + ?Sized>(
    path: impl AsRef<Path>,
    value: &T,
) -> Result<(), PersistError> {
    let path = path.as_ref();
    let content = serde_json::to_string_pretty(value)?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let tmp = tmp_path(path);
    fs::write(&tmp, content).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
