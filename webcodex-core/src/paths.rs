//! Working directory containment.
//!
//! Terminal sessions may only start inside the configured data root. A
//! requested directory is interpreted relative to the root (absolute paths
//! are accepted as long as they land inside it), normalized lexically, then
//! canonicalized so that symlinks cannot point a session outside the root.

use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PathError {
    #[error("Path escapes the data root: {0:?}")]
    EscapesRoot(PathBuf),

    #[error("Not a directory: {0:?}")]
    NotADirectory(PathBuf),

    #[error("Failed to resolve {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Resolve `requested` inside `root`.
///
/// Returns the canonical path of an existing directory that is `root` itself
/// or one of its descendants.
pub fn resolve_within_root(root: &Path, requested: &str) -> Result<PathBuf, PathError> {
    let canonical_root = canonicalize(root)?;

    let joined = if requested.trim().is_empty() {
        root.to_path_buf()
    } else {
        root.join(requested)
    };

    let normalized = normalize(&joined);
    if !normalized.starts_with(normalize(root)) && !normalized.starts_with(&canonical_root) {
        return Err(PathError::EscapesRoot(normalized));
    }

    let resolved = canonicalize(&normalized)?;
    if !resolved.starts_with(&canonical_root) {
        return Err(PathError::EscapesRoot(resolved));
    }
    if !resolved.is_dir() {
        return Err(PathError::NotADirectory(resolved));
    }

    Ok(resolved)
}

fn canonicalize(path: &Path) -> Result<PathBuf, PathError> {
    path.canonicalize().map_err(|source| PathError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Lexical normalization: drops `.` and folds `..` without touching the
/// filesystem. `..` never climbs above the filesystem root.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
