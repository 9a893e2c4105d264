// SPDX-License-Identifier: MIT OR Apache-2.0
//! The process-wide work directory: holds extracted bundle
//! artifacts, bundled live-U-boot, the OpenOCD config, and intermediate split files.
//!
//! Concurrent reset drivers on the same host race over this directory; that is a
//! known, accepted limitation of the original design and not
//! addressed here.

use std::path::{Path, PathBuf};

use crate::error::Error;

/// Default root, overridable via [`WorkDir::new`] or the `RESET_ENGINE_WORK_DIR`
/// environment variable (read by [`WorkDir::from_env`]).
pub const DEFAULT_ROOT: &str = "/tmp/reset-engine";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkDir
{
    root: PathBuf,
}

impl WorkDir
{
    pub fn new(root: impl Into<PathBuf>) -> Self
    {
        Self { root: root.into() }
    }

    /// Read `RESET_ENGINE_WORK_DIR` if set, else fall back to [`DEFAULT_ROOT`].
    pub fn from_env() -> Self
    {
        match std::env::var_os("RESET_ENGINE_WORK_DIR") {
            Some(path) => Self::new(path),
            None => Self::new(DEFAULT_ROOT),
        }
    }

    pub fn root(&self) -> &Path
    {
        &self.root
    }

    /// Create (if needed) and return a subdirectory of the work directory. Writers are
    /// responsible for creating their own subdirectories; this is the shared helper
    /// they do it with.
    pub fn subdir(&self, name: &str) -> Result<PathBuf, Error>
    {
        let path = self.root.join(name);
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }

    pub fn join(&self, name: impl AsRef<Path>) -> PathBuf
    {
        self.root.join(name)
    }

    /// A path is "rooted" in the work directory if it canonicalizes under it; used to
    /// validate file arguments to TFTP-backed copy operations.
    pub fn contains(&self, path: &Path) -> bool
    {
        let root = self.root.canonicalize().unwrap_or_else(|_| self.root.clone());
        match path.canonicalize() {
            Ok(resolved) => resolved.starts_with(&root),
            Err(_) => false,
        }
    }
}

impl Default for WorkDir
{
    fn default() -> Self
    {
        Self::from_env()
    }
}
