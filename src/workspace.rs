//! Workspace confinement and per-file write locks.
//!
//! Every file tool resolves its path through [`resolve_in_workspace`], which
//! canonicalizes (following symlinks) and requires the result to stay under
//! the workspace root.  Component-wise prefix comparison means `/ws` does not
//! match `/ws-evil`.
//!
//! Write locks live in a lazily-grown map from canonical path to an async
//! mutex; entries are never removed, so acquire/release cannot race on map
//! membership.  Readers do not lock.

use std::{
    collections::HashMap,
    path::{Component, Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::{ErrorKind, ToolError};

// ─── Path jail ──────────────────────────────────────────────────────────────

/// Resolve `relative` against `root` and verify the result stays inside the
/// workspace.
///
/// The target may not exist yet (e.g. `create_file`): in that case the
/// longest existing ancestor is canonicalized and the remaining components
/// are appended after lexical normalization.
pub fn resolve_in_workspace(root: &Path, relative: &str) -> Result<PathBuf, ToolError> {
    let root = root.canonicalize().map_err(|e| {
        ToolError::new(
            ErrorKind::PathTraversal,
            format!("workspace root {} is not resolvable: {e}", root.display()),
        )
    })?;

    let requested = Path::new(relative);
    let candidate = if requested.is_absolute() {
        requested.to_path_buf()
    } else {
        root.join(requested)
    };
    let candidate = normalize(&candidate);

    // Canonicalize through the longest existing ancestor so symlinks inside
    // the workspace cannot smuggle the path outside it.
    let resolved = match candidate.canonicalize() {
        Ok(p) => p,
        Err(_) => {
            let (existing, tail) = split_at_existing(&candidate);
            let base = existing.canonicalize().map_err(|e| {
                ToolError::new(
                    ErrorKind::PathTraversal,
                    format!("cannot resolve '{relative}': {e}"),
                )
            })?;
            base.join(tail)
        }
    };

    if resolved.starts_with(&root) {
        Ok(resolved)
    } else {
        Err(ToolError::new(
            ErrorKind::PathTraversal,
            format!("'{relative}' escapes the workspace"),
        ))
    }
}

/// Lexically resolve `.` and `..` components.  A `..` that would climb above
/// the path's start is kept, which then fails the prefix check.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Split into (longest existing ancestor, remaining relative tail).
fn split_at_existing(path: &Path) -> (PathBuf, PathBuf) {
    let mut existing = path.to_path_buf();
    let mut tail = PathBuf::new();
    while !existing.exists() {
        let Some(name) = existing.file_name().map(|n| n.to_os_string()) else {
            break;
        };
        existing.pop();
        tail = Path::new(&name).join(&tail);
    }
    (existing, tail)
}

// ─── File locks ─────────────────────────────────────────────────────────────

/// Per-canonical-path write locks for one agent's workspace.
///
/// The guard type is an owned mutex guard, so a lock is released on every
/// exit path — including task cancellation — when the guard drops.
#[derive(Debug, Default)]
pub struct FileLocks {
    locks: Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>,
}

/// Held write lock on one file.
pub type FileLockGuard = OwnedMutexGuard<()>;

impl FileLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, path: &Path) -> Arc<AsyncMutex<()>> {
        let mut map = self.locks.lock().expect("file-lock map poisoned");
        Arc::clone(
            map.entry(path.to_path_buf())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    /// Acquire the write lock for `path`, waiting at most `timeout`.
    ///
    /// Timing out is a tool-level failure (`LockTimeout`) rather than a
    /// branch failure, so the model can back off and retry.
    pub async fn acquire(&self, path: &Path, timeout: Duration) -> Result<FileLockGuard, ToolError> {
        let lock = self.entry(path);
        tokio::time::timeout(timeout, lock.lock_owned())
            .await
            .map_err(|_| {
                ToolError::new(
                    ErrorKind::LockTimeout,
                    format!(
                        "could not acquire write lock on {} within {}s",
                        path.display(),
                        timeout.as_secs()
                    ),
                )
            })
    }

    /// Number of distinct paths ever locked (the map only grows).
    pub fn len(&self) -> usize {
        self.locks.lock().expect("file-lock map poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
