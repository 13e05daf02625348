//! Signing profiles: named directories of credential files.
//!
//! Profile contents are opaque here. Every regular file under
//! `<profiles>/<name>/` is shipped to the entrypoint in the job archive.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use walkdir::WalkDir;

use super::is_valid_name;

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("profile not found: {0}")]
    NotFound(String),

    #[error("invalid profile name: {0}")]
    InvalidName(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("walk profile: {0}")]
    Walk(#[from] walkdir::Error),
}

/// One file of a profile, named relative to the profile directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileFile {
    pub name: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Profile {
    name: String,
    dir: PathBuf,
}

impl Profile {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// All regular files, sorted by relative name. Names use `/` separators.
    pub fn files(&self) -> Result<Vec<ProfileFile>, ProfileError> {
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.dir).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.dir) else {
                continue;
            };
            let name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            files.push(ProfileFile {
                name,
                data: fs::read(entry.path())?,
            });
        }
        Ok(files)
    }
}

#[derive(Debug, Clone)]
pub struct ProfileStore {
    root: PathBuf,
}

impl ProfileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn get(&self, name: &str) -> Result<Profile, ProfileError> {
        if !is_valid_name(name) {
            return Err(ProfileError::InvalidName(name.to_string()));
        }
        let dir = self.root.join(name);
        if !dir.is_dir() {
            return Err(ProfileError::NotFound(name.to_string()));
        }
        Ok(Profile {
            name: name.to_string(),
            dir,
        })
    }

    /// Names of all profiles, sorted. A missing root means no profiles.
    pub fn list(&self) -> Result<Vec<String>, ProfileError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                let name = entry.file_name().to_string_lossy().to_string();
                if is_valid_name(&name) {
                    names.push(name);
                }
            }
        }
        names.sort();
        Ok(names)
    }
}
