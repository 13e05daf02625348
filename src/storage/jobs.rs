//! In-memory job queue.
//!
//! Pending sign jobs wait in FIFO order until the worker takes one; taking
//! a job turns it into a return job keyed by a fresh id, which lives until
//! the worker deletes it. An application has at most one pending or return
//! job at any time.

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use localsign_protocol::{
    ArchiveWriter, JobStore, ReturnJob, TakeError, BUNDLE_ID_FILE, JOB_ID_FILE, SIGNED_FILE,
    SIGN_ARGS_FILE, UNSIGNED_FILE, USER_BUNDLE_ID_FILE,
};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::profiles::ProfileFile;

const CONTROL_FILE_MODE: u32 = 0o644;
const PROFILE_FILE_MODE: u32 = 0o600;

/// Sandbox file names owned by the job itself. Profile files with these
/// names are left out of the archive.
const RESERVED_NAMES: &[&str] = &[
    JOB_ID_FILE,
    SIGN_ARGS_FILE,
    USER_BUNDLE_ID_FILE,
    UNSIGNED_FILE,
    SIGNED_FILE,
    BUNDLE_ID_FILE,
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("app {0} already has a queued job")]
    AlreadyQueued(String),
}

/// A sign request waiting for the worker.
#[derive(Debug, Clone)]
pub struct SignJob {
    pub app_id: String,
    pub profile_id: String,
    pub sign_args: String,
    pub user_bundle_id: String,
    pub profile_files: Vec<ProfileFile>,
    pub queued_at: DateTime<Utc>,
}

impl SignJob {
    pub fn new(app_id: impl Into<String>, profile_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            profile_id: profile_id.into(),
            sign_args: String::new(),
            user_bundle_id: String::new(),
            profile_files: Vec::new(),
            queued_at: Utc::now(),
        }
    }

    pub fn with_sign_args(mut self, sign_args: impl Into<String>) -> Self {
        self.sign_args = sign_args.into();
        self
    }

    pub fn with_user_bundle_id(mut self, user_bundle_id: impl Into<String>) -> Self {
        self.user_bundle_id = user_bundle_id.into();
        self
    }

    pub fn with_profile_files(mut self, files: Vec<ProfileFile>) -> Self {
        self.profile_files = files;
        self
    }

    /// Stream this job's archive: `id.txt` first, then the control files,
    /// then the profile files.
    fn write_archive(&self, job_id: &str, writer: &mut dyn Write) -> Result<(), TakeError> {
        let mut archive = ArchiveWriter::new(writer);
        archive.append_file(JOB_ID_FILE, CONTROL_FILE_MODE, job_id.as_bytes())?;
        archive.append_file(SIGN_ARGS_FILE, CONTROL_FILE_MODE, self.sign_args.as_bytes())?;
        archive.append_file(
            USER_BUNDLE_ID_FILE,
            CONTROL_FILE_MODE,
            self.user_bundle_id.as_bytes(),
        )?;
        for file in &self.profile_files {
            if RESERVED_NAMES.contains(&file.name.as_str()) {
                warn!(%job_id, name = %file.name, "skipping profile file with reserved name");
                continue;
            }
            archive.append_file(&file.name, PROFILE_FILE_MODE, &file.data)?;
        }
        archive.finish()?;
        Ok(())
    }
}

/// Where an application's job currently is.
#[derive(Debug, Clone)]
pub enum JobStatus {
    /// Queued, not yet taken by a worker.
    Pending,
    /// Taken; the return job is live until the worker deletes it.
    InFlight(Arc<ReturnJob>),
    /// No job for the application.
    Absent,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<SignJob>,
    returns: HashMap<String, Arc<ReturnJob>>,
}

impl QueueState {
    fn has_app(&self, app_id: &str) -> bool {
        self.pending.iter().any(|job| job.app_id == app_id)
            || self.returns.values().any(|job| job.app_id() == app_id)
    }
}

#[derive(Debug, Default)]
pub struct JobQueue {
    state: RwLock<QueueState>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, QueueState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, QueueState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a sign job. Fails if the application already has a pending or
    /// in-flight job.
    pub fn enqueue(&self, job: SignJob) -> Result<(), QueueError> {
        let mut state = self.write();
        if state.has_app(&job.app_id) {
            return Err(QueueError::AlreadyQueued(job.app_id));
        }
        debug!(app_id = %job.app_id, profile_id = %job.profile_id, "queued sign job");
        state.pending.push_back(job);
        Ok(())
    }

    pub fn get_by_app_id(&self, app_id: &str) -> Option<Arc<ReturnJob>> {
        self.read()
            .returns
            .values()
            .find(|job| job.app_id() == app_id)
            .cloned()
    }

    /// Pending and in-flight state read under one lock, so a job moving
    /// from pending to in flight is never observed as absent.
    pub fn status(&self, app_id: &str) -> JobStatus {
        let state = self.read();
        if state.pending.iter().any(|job| job.app_id == app_id) {
            return JobStatus::Pending;
        }
        state
            .returns
            .values()
            .find(|job| job.app_id() == app_id)
            .map(|job| JobStatus::InFlight(Arc::clone(job)))
            .unwrap_or(JobStatus::Absent)
    }

    /// Whether the application has a job that no worker has taken yet.
    pub fn is_pending(&self, app_id: &str) -> bool {
        self.read().pending.iter().any(|job| job.app_id == app_id)
    }

    /// Drop whatever job the application has, pending or in flight.
    pub fn delete_by_app_id(&self, app_id: &str) -> bool {
        let mut state = self.write();
        let before = state.pending.len();
        state.pending.retain(|job| job.app_id != app_id);
        let mut removed = state.pending.len() != before;

        let return_ids: Vec<String> = state
            .returns
            .values()
            .filter(|job| job.app_id() == app_id)
            .map(|job| job.id().to_string())
            .collect();
        for id in return_ids {
            removed |= state.returns.remove(&id).is_some();
        }
        removed
    }

    /// Pending plus in-flight jobs.
    pub fn len(&self) -> usize {
        let state = self.read();
        state.pending.len() + state.returns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl JobStore for JobQueue {
    fn take_next(&self, writer: &mut dyn Write) -> Result<(), TakeError> {
        let (job, job_id) = {
            let mut state = self.write();
            let job = state.pending.pop_front().ok_or(TakeError::NotFound)?;
            let job_id = Uuid::new_v4().to_string();
            let return_job = ReturnJob::new(job_id.clone(), job.app_id.clone(), job.profile_id.clone());
            state.returns.insert(job_id.clone(), Arc::new(return_job));
            (job, job_id)
        };

        info!(%job_id, app_id = %job.app_id, "job taken by worker");
        job.write_archive(&job_id, writer)
    }

    fn get_by_id(&self, job_id: &str) -> Option<Arc<ReturnJob>> {
        self.read().returns.get(job_id).cloned()
    }

    fn delete_by_id(&self, job_id: &str) -> bool {
        let removed = self.write().returns.remove(job_id).is_some();
        if removed {
            debug!(%job_id, "return job deleted");
        }
        removed
    }
}
