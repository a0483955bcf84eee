// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::SandboxError;
use crate::global_config::SandboxPolicy;

/// The working directory that belongs to one slot of the pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sandbox {
    pub slot: usize,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SandboxManager {
    root: PathBuf,
    policy: SandboxPolicy,
}

impl SandboxManager {
    pub fn new(root: impl Into<PathBuf>, policy: SandboxPolicy) -> Self {
        Self {
            root: root.into(),
            policy,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn policy(&self) -> SandboxPolicy {
        self.policy
    }

    pub fn path_for(&self, slot: usize) -> PathBuf {
        self.root.join(format!("sandbox-{}", slot))
    }

    /// Make sure the sandbox of `slot` exists and return it. Calling this
    /// again for the same slot returns the same path.
    pub fn reserve(&self, slot: usize) -> Result<Sandbox, SandboxError> {
        let path = self.path_for(slot);
        ensure_dir(&path)?;
        Ok(Sandbox { slot, path })
    }
}

fn ensure_dir(path: &Path) -> Result<(), SandboxError> {
    // Create directory like `mkdir -p`
    fs::create_dir_all(path).map_err(|source| SandboxError::Create {
        path: path.to_path_buf(),
        source,
    })
}

/// Move the calling process into `path` for the rest of its life.
///
/// Only ever called in a freshly launched worker process. There is no way
/// back; the process ends when the worker is done.
pub fn enter(path: &Path, policy: SandboxPolicy) -> Result<(), SandboxError> {
    ensure_dir(path)?;
    if policy == SandboxPolicy::Purge {
        purge(path)?;
    }
    std::env::set_current_dir(path).map_err(|source| SandboxError::Enter {
        path: path.to_path_buf(),
        source,
    })?;
    debug!("entered sandbox {}", path.display());
    Ok(())
}

/// Remove everything inside `path` but keep the directory itself.
pub fn purge(path: &Path) -> Result<(), SandboxError> {
    purge_contents(path).map_err(|source| SandboxError::Purge {
        path: path.to_path_buf(),
        source,
    })
}

fn purge_contents(path: &Path) -> io::Result<()> {
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        // file_type() does not follow symlinks, so a link to a directory
        // is removed as a link
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_is_stable_and_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SandboxManager::new(dir.path().join("pool"), SandboxPolicy::Purge);

        let first = manager.reserve(2).unwrap();
        let second = manager.reserve(2).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.path, dir.path().join("pool").join("sandbox-2"));
        assert!(first.path.is_dir());
    }

    #[test]
    fn slots_do_not_share_paths() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SandboxManager::new(dir.path(), SandboxPolicy::Inherit);
        let paths: Vec<_> = (0..3).map(|slot| manager.reserve(slot).unwrap().path).collect();
        assert_ne!(paths[0], paths[1]);
        assert_ne!(paths[1], paths[2]);
        assert!(paths[2].ends_with("sandbox-2"));
    }

    #[test]
    fn purge_keeps_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = dir.path().join("sandbox-0");
        fs::create_dir_all(sandbox.join("nested/deeper")).unwrap();
        fs::write(sandbox.join("residue.txt"), "left over").unwrap();
        fs::write(sandbox.join("nested/deeper/more.txt"), "more").unwrap();

        purge(&sandbox).unwrap();

        assert!(sandbox.is_dir());
        assert_eq!(fs::read_dir(&sandbox).unwrap().count(), 0);
    }

    #[test]
    fn reserve_fails_when_root_is_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("not-a-dir");
        fs::write(&root, "").unwrap();
        let manager = SandboxManager::new(&root, SandboxPolicy::Purge);
        assert!(matches!(
            manager.reserve(0),
            Err(SandboxError::Create { .. })
        ));
    }
}
