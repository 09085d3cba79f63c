//! Workspace layout helpers.
//!
//! The engine owns `<workspace>/.nerd/tools/` for canonical capability
//! sources and `<workspace>/.nerd/tools/.compiled/` for artifacts. The
//! sibling `.learnings/`, `.profiles/`, and `.traces/` directories belong
//! to external collaborators and are never touched here.

use crate::error::{EngineError, EngineResult};
use std::path::{Path, PathBuf};

/// Resolve the workspace root: `SELFFORGE_WORKSPACE` when set, else the
/// current directory.
pub fn workspace_root() -> PathBuf {
    if let Ok(root) = std::env::var("SELFFORGE_WORKSPACE") {
        if !root.trim().is_empty() {
            return PathBuf::from(root);
        }
    }
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

/// Create a directory tree if missing, wrapping the error with its path.
pub fn ensure_dir(path: &Path) -> EngineResult<()> {
    std::fs::create_dir_all(path)
        .map_err(|e| EngineError::io(format!("creating {}", path.display()), e))
}

/// Remove a file if it exists; missing files are not an error.
pub fn remove_if_exists(path: &Path) -> EngineResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(EngineError::io(format!("removing {}", path.display()), e)),
    }
}

/// File stem of a path as an owned string, when it has one.
pub fn file_stem(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_dir_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c");
        ensure_dir(&nested).unwrap();
        ensure_dir(&nested).unwrap();
        assert!(nested.is_dir());
    }

    #[test]
    fn remove_if_exists_tolerates_missing() {
        let dir = tempfile::tempdir().unwrap();
        remove_if_exists(&dir.path().join("nope")).unwrap();
    }

    #[test]
    fn workspace_root_honors_the_env_override() {
        let dir = tempfile::tempdir().unwrap();
        // keep the override absolute: other tests may read the default
        // workspace root concurrently and expect an absolute path
        std::env::set_var("SELFFORGE_WORKSPACE", dir.path());
        assert_eq!(workspace_root(), dir.path());
        std::env::remove_var("SELFFORGE_WORKSPACE");
        assert_ne!(workspace_root(), dir.path());
    }
}
