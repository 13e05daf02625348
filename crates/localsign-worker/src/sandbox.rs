//! Per-attempt working directory for the integrated builder.
//!
//! A sandbox is seeded from the builder's static sign-files tree, then
//! overlaid with the job archive and the unsigned artifact. The directory
//! is removed when the sandbox is dropped, on every exit path.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use localsign_protocol::{unpack, ArchiveError};
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Directory name prefix, so leftovers are recognisable in the temp dir.
pub const PREFIX: &str = "localsign-integrated-";

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("walk sign files: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("extract job archive: {0}")]
    Archive(#[from] ArchiveError),

    #[error("sign files directory not found: {}", .0.display())]
    SignFilesMissing(PathBuf),
}

#[derive(Debug)]
pub struct Sandbox {
    dir: TempDir,
}

impl Sandbox {
    /// Create an empty sandbox under the system temp directory.
    pub fn create() -> Result<Self, SandboxError> {
        let dir = tempfile::Builder::new().prefix(PREFIX).tempdir()?;
        debug!(path = %dir.path().display(), "created sandbox");
        Ok(Self { dir })
    }

    /// Create an empty sandbox under `parent`.
    pub fn create_in(parent: &Path) -> Result<Self, SandboxError> {
        let dir = tempfile::Builder::new().prefix(PREFIX).tempdir_in(parent)?;
        debug!(path = %dir.path().display(), "created sandbox");
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Copy the sign-files tree into the sandbox root, preserving layout
    /// and permissions. Returns the number of files copied.
    pub fn seed_from(&self, source: &Path) -> Result<usize, SandboxError> {
        if !source.is_dir() {
            return Err(SandboxError::SignFilesMissing(source.to_path_buf()));
        }

        let mut copied = 0;
        for entry in WalkDir::new(source).follow_links(true) {
            let entry = entry?;
            let relative = match entry.path().strip_prefix(source) {
                Ok(rel) if !rel.as_os_str().is_empty() => rel,
                _ => continue,
            };
            let target = self.path().join(relative);

            if entry.file_type().is_dir() {
                fs::create_dir_all(&target)?;
            } else {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                // fs::copy carries the permission bits, so the entrypoint stays executable.
                fs::copy(entry.path(), &target)?;
                copied += 1;
            }
        }
        Ok(copied)
    }

    /// Overlay a job archive onto the sandbox.
    pub fn unpack_archive<R: Read>(&self, archive: R) -> Result<usize, SandboxError> {
        Ok(unpack(archive, self.path())?)
    }

    /// Stream `reader` into a file at the sandbox root.
    pub fn write_file(&self, name: &str, reader: &mut dyn Read) -> Result<u64, SandboxError> {
        let mut file = File::create(self.path().join(name))?;
        Ok(io::copy(reader, &mut file)?)
    }

    /// Remove the sandbox now, logging instead of failing.
    pub fn close(self) {
        let path = self.dir.path().to_path_buf();
        if let Err(e) = self.dir.close() {
            warn!(path = %path.display(), error = %e, "failed to remove sandbox");
        }
    }
}
