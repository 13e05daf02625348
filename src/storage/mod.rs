//! Storage for the signing service.
//!
//! - `jobs`: the in-memory job queue the integrated worker drains
//! - `apps`: application records on disk
//! - `profiles`: signing profile directories

mod apps;
mod jobs;
mod profiles;

use std::sync::Arc;

use localsign_protocol::StoreError;

use crate::config::Config;

pub use apps::{FsApp, FsAppStore, NewApp};
pub use jobs::{JobQueue, JobStatus, QueueError, SignJob};
pub use profiles::{Profile, ProfileError, ProfileFile, ProfileStore};

/// Whether `name` is usable as a single path component under a store root.
pub(crate) fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\', '\0'])
}

/// The service's storage, rooted at `config.save_dir`.
#[derive(Debug, Clone)]
pub struct Storage {
    pub jobs: Arc<JobQueue>,
    pub apps: Arc<FsAppStore>,
    pub profiles: ProfileStore,
}

impl Storage {
    pub fn open(config: &Config) -> Result<Self, StoreError> {
        Ok(Self {
            jobs: Arc::new(JobQueue::new()),
            apps: Arc::new(FsAppStore::open(config.apps_dir())?),
            profiles: ProfileStore::new(config.profiles_dir()),
        })
    }
}
