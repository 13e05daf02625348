//! Job archive codec
//!
//! Jobs travel from the queue to the worker as a plain tar stream. Headers
//! are canonical (GNU format, zero mtime/uid/gid) so the only variable
//! parts of an entry are its name, mode and payload.
//!
//! Unpacking never writes outside the destination: absolute names and names
//! containing `..` are rejected with [`ArchiveError::UnsafePath`].

use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use tar::{Archive, Builder, EntryType, Header};
use thiserror::Error;

/// Mode used for control files unless a caller asks otherwise.
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// Mode used for directories created implicitly while unpacking.
pub const DEFAULT_DIR_MODE: u32 = 0o755;

/// Errors from packing or unpacking a job archive.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("unsafe path in archive: {0}")]
    UnsafePath(String),

    #[error("unsupported entry type {kind} for {name}")]
    UnsupportedEntry { name: String, kind: String },
}

/// Payload of an archive entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    File(Vec<u8>),
    Directory,
}

/// One named entry of a job archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub mode: u32,
    pub kind: EntryKind,
}

impl ArchiveEntry {
    /// A regular file with [`DEFAULT_FILE_MODE`].
    pub fn file(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            mode: DEFAULT_FILE_MODE,
            kind: EntryKind::File(data.into()),
        }
    }

    /// A directory with [`DEFAULT_DIR_MODE`].
    pub fn dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: DEFAULT_DIR_MODE,
            kind: EntryKind::Directory,
        }
    }

    /// Override the permission bits.
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }
}

/// Streaming archive writer.
///
/// Entries are written in call order; callers that need a control entry to
/// be recoverable from a partial stream must append it first.
pub struct ArchiveWriter<W: Write> {
    builder: Builder<W>,
}

impl<W: Write> ArchiveWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            builder: Builder::new(writer),
        }
    }

    /// Append a regular file.
    pub fn append_file(&mut self, name: &str, mode: u32, data: &[u8]) -> Result<(), ArchiveError> {
        let mut header = canonical_header(EntryType::Regular, mode, data.len() as u64);
        self.builder.append_data(&mut header, name, data)?;
        Ok(())
    }

    /// Append a directory entry.
    pub fn append_dir(&mut self, name: &str, mode: u32) -> Result<(), ArchiveError> {
        let mut header = canonical_header(EntryType::Directory, mode, 0);
        self.builder.append_data(&mut header, name, io::empty())?;
        Ok(())
    }

    pub fn append(&mut self, entry: &ArchiveEntry) -> Result<(), ArchiveError> {
        match &entry.kind {
            EntryKind::File(data) => self.append_file(&entry.name, entry.mode, data),
            EntryKind::Directory => self.append_dir(&entry.name, entry.mode),
        }
    }

    /// Write the end-of-archive marker and hand back the inner writer.
    pub fn finish(self) -> Result<W, ArchiveError> {
        Ok(self.builder.into_inner()?)
    }
}

fn canonical_header(kind: EntryType, mode: u32, size: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(kind);
    header.set_size(size);
    header.set_mode(mode);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header
}

/// Pack entries into an in-memory archive.
pub fn pack(entries: &[ArchiveEntry]) -> Result<Vec<u8>, ArchiveError> {
    let mut writer = ArchiveWriter::new(Vec::new());
    for entry in entries {
        writer.append(entry)?;
    }
    writer.finish()
}

/// Unpack an archive into `destination`, returning the number of entries written.
///
/// Existing files are truncated. Permission bits from the archive are
/// applied after the payload is written.
pub fn unpack<R: Read>(reader: R, destination: &Path) -> Result<usize, ArchiveError> {
    let mut archive = Archive::new(reader);
    let mut written = 0;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let raw_path = entry.path()?.into_owned();
        let relative = safe_relative_path(&raw_path)?;
        let target = destination.join(&relative);
        let mode = entry.header().mode()? & 0o7777;

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&target)?;
                apply_mode(&target, mode, DEFAULT_DIR_MODE)?;
            }
            EntryType::Regular | EntryType::Continuous => {
                if let Some(parent) = target.parent() {
                    if !parent.exists() {
                        fs::create_dir_all(parent)?;
                        apply_mode(parent, DEFAULT_DIR_MODE, DEFAULT_DIR_MODE)?;
                    }
                }
                let mut file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(&target)?;
                io::copy(&mut entry, &mut file)?;
                drop(file);
                apply_mode(&target, mode, DEFAULT_FILE_MODE)?;
            }
            EntryType::XGlobalHeader => continue,
            other => {
                return Err(ArchiveError::UnsupportedEntry {
                    name: raw_path.display().to_string(),
                    kind: format!("{:?}", other),
                });
            }
        }
        written += 1;
    }

    Ok(written)
}

/// Best-effort lookup of a control entry's text.
///
/// Returns the trimmed contents of the first entry named `name`. A stream
/// that is truncated or corrupt yields `None` instead of an error, so the
/// caller can still identify a job whose transport failed midway.
pub fn extract_control_value<R: Read>(reader: R, name: &str) -> Option<String> {
    let mut archive = Archive::new(reader);
    let entries = archive.entries().ok()?;

    for entry in entries {
        let mut entry = entry.ok()?;
        let matches = entry
            .path()
            .map(|path| path == Path::new(name))
            .unwrap_or(false);
        if !matches {
            continue;
        }

        let size = entry.header().size().ok()?;
        if size == 0 {
            return Some(String::new());
        }

        let mut payload = Vec::new();
        entry.read_to_end(&mut payload).ok()?;
        if payload.len() as u64 != size {
            return None;
        }
        return Some(String::from_utf8_lossy(&payload).trim().to_string());
    }

    None
}

fn safe_relative_path(path: &Path) -> Result<PathBuf, ArchiveError> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ArchiveError::UnsafePath(path.display().to_string()));
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(ArchiveError::UnsafePath(path.display().to_string()));
    }
    Ok(clean)
}

#[cfg(unix)]
fn apply_mode(path: &Path, mode: u32, fallback: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mode = if mode == 0 { fallback } else { mode };
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn apply_mode(_path: &Path, _mode: u32, _fallback: u32) -> io::Result<()> {
    Ok(())
}
