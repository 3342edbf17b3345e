//! Liveness marker: a PID file written at startup and removed at clean
//! shutdown.
//!
//! External supervisors treat a marker that survives the process as a sign
//! that cleanup did not complete.  For that reason the marker is *not*
//! removed on drop; only an explicit [`LivenessMarker::remove`] deletes it.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

/// Error type for liveness marker operations.
#[derive(Debug, Error)]
pub enum LivenessError {
    /// The marker could not be written.
    #[error("failed to write liveness marker {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The marker could not be removed.
    #[error("failed to remove liveness marker {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A written liveness marker.  Consumed by [`remove`](Self::remove), so it can
/// be removed at most once.
#[derive(Debug)]
pub struct LivenessMarker {
    path: PathBuf,
}

impl LivenessMarker {
    /// Writes the current process id, followed by a newline, to `path`.
    ///
    /// An existing file (for example left by a crashed run) is overwritten.
    ///
    /// # Errors
    ///
    /// Returns [`LivenessError::Create`] if the file cannot be written.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, LivenessError> {
        let path = path.into();
        let pid = std::process::id();
        std::fs::write(&path, format!("{pid}\n")).map_err(|source| LivenessError::Create {
            path: path.clone(),
            source,
        })?;
        info!("liveness marker {} written (pid {pid})", path.display());
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deletes the marker.  A marker that is already gone counts as removed.
    ///
    /// # Errors
    ///
    /// Returns [`LivenessError::Remove`] for any I/O error other than
    /// "not found".
    pub fn remove(self) -> Result<(), LivenessError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(LivenessError::Remove {
                    path: self.path,
                    source,
                })
            }
        }
        info!("liveness marker {} removed", self.path.display());
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
