//! Storage contracts consumed by the worker.
//!
//! The worker never owns jobs or applications; it reaches them through
//! these traits so the queue and app storage can live in the service crate.

use std::io::{self, Read, Write};
use std::sync::Arc;

use thiserror::Error;

use crate::archive::ArchiveError;
use crate::job::ReturnJob;

/// Blob holding the uploaded, unsigned artifact.
pub const APP_UNSIGNED: &str = "unsigned";
/// Blob holding the signed artifact once the worker produced it.
pub const APP_SIGNED: &str = "signed";
/// String metadata keys.
pub const APP_PROFILE_ID: &str = "profile_id";
pub const APP_SIGN_ARGS: &str = "sign_args";
pub const APP_USER_BUNDLE_ID: &str = "user_bundle_id";
pub const APP_BUILDER_ID: &str = "builder_id";
pub const APP_FILE_NAME: &str = "file_name";
pub const APP_BUNDLE_ID: &str = "bundle_id";

/// Errors from application storage.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("app {app_id} has no file {name}")]
    MissingFile { app_id: String, name: String },

    #[error("app {app_id} has no value {name}")]
    MissingValue { app_id: String, name: String },

    #[error("invalid storage name: {0}")]
    InvalidName(String),
}

/// Result of asking the queue for work.
#[derive(Debug, Error)]
pub enum TakeError {
    /// No job is pending. Signals idleness, not failure.
    #[error("no pending job")]
    NotFound,

    #[error("write job archive: {0}")]
    Archive(#[from] ArchiveError),
}

/// Queue operations the worker relies on.
pub trait JobStore: Send + Sync {
    /// Take the oldest pending job and stream its archive into `writer`.
    ///
    /// The return job is registered before the archive is written, so a
    /// partially written archive still identifies a job that can be deleted.
    fn take_next(&self, writer: &mut dyn Write) -> Result<(), TakeError>;

    fn get_by_id(&self, job_id: &str) -> Option<Arc<ReturnJob>>;

    /// Delete a return job. Returns `false` if it did not exist.
    fn delete_by_id(&self, job_id: &str) -> bool;
}

/// An application record: named blobs plus string metadata.
pub trait App: Send + Sync {
    fn id(&self) -> &str;

    fn get_file(&self, name: &str) -> Result<Box<dyn Read + Send>, StoreError>;

    /// Replace a blob with the contents of `reader`, returning bytes written.
    fn set_file(&self, name: &str, reader: &mut dyn Read) -> Result<u64, StoreError>;

    fn get_string(&self, name: &str) -> Result<String, StoreError>;

    fn set_string(&self, name: &str, value: &str) -> Result<(), StoreError>;

    /// Whether the signed blob exists.
    fn is_signed(&self) -> Result<bool, StoreError>;
}

/// Lookup of applications by id.
pub trait AppStore: Send + Sync {
    fn get(&self, app_id: &str) -> Option<Arc<dyn App>>;
}
