//! One integrated job attempt.
//!
//! Takes the next job archive from the queue, prepares a sandbox, runs the
//! entrypoint and stores the result on the application. The queue entry is
//! deleted on every path where its id is known, after the sandbox is gone.

use std::fs::{self, File};
use std::io;
use std::path::PathBuf;

use localsign_protocol::store::{APP_BUNDLE_ID, APP_SIGNED, APP_UNSIGNED};
use localsign_protocol::{
    extract_control_value, AppStore, JobStore, StoreError, TakeError, BUNDLE_ID_FILE, JOB_ID_FILE,
    SIGNED_FILE, UNSIGNED_FILE,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::builder::{Builder, Integrated};
use crate::runner::{RunSpec, RunnerError};
use crate::sandbox::{Sandbox, SandboxError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Nothing was queued.
    Idle,
    Completed { job_id: String, app_id: String },
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("take job archive: {0}")]
    Transport(#[source] TakeError),

    #[error("job id not found in archive")]
    MissingJobId,

    #[error("return job not found: {0}")]
    UnknownJob(String),

    #[error("app not found: {0}")]
    AppNotFound(String),

    #[error("prepare sandbox: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("app storage: {0}")]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Entrypoint(#[from] RunnerError),

    #[error("signed app not found: {}", .0.display())]
    SignedMissing(PathBuf),
}

impl JobError {
    /// The queue itself failed, so retrying immediately is pointless.
    pub fn stops_draining(&self) -> bool {
        matches!(self, JobError::Transport(_))
    }

    /// Captured entrypoint output, when the entrypoint ran and failed.
    pub fn entrypoint_output(&self) -> Option<&str> {
        match self {
            JobError::Entrypoint(e) => e.output(),
            _ => None,
        }
    }
}

/// Run one job attempt for the integrated builder.
pub fn process_integrated_job(
    builder: &Integrated,
    jobs: &dyn JobStore,
    apps: &dyn AppStore,
) -> Result<JobOutcome, JobError> {
    let mut archive = Vec::new();
    match jobs.take_next(&mut archive) {
        Ok(()) => {}
        Err(TakeError::NotFound) => {
            debug!("no job found for integrated builder");
            return Ok(JobOutcome::Idle);
        }
        Err(e) => {
            error!(error = %e, "take next job");
            // The id entry is written first, so even a short archive usually names the job.
            if let Some(job_id) = job_id_from(&archive) {
                if jobs.delete_by_id(&job_id) {
                    info!(%job_id, "cleaned up job after archive error");
                }
            }
            return Err(JobError::Transport(e));
        }
    }

    let job_id = job_id_from(&archive).ok_or(JobError::MissingJobId)?;
    let return_job = jobs
        .get_by_id(&job_id)
        .ok_or_else(|| JobError::UnknownJob(job_id.clone()))?;
    let app_id = return_job.app_id().to_string();

    let attempt = format!("integrated-{}", Uuid::new_v4());
    info!(%attempt, %job_id, %app_id, "running integrated sign job");

    let result = run_attempt(builder, apps, &app_id, &archive);

    if !jobs.delete_by_id(&job_id) {
        warn!(%job_id, "unable to delete return job");
    }

    match result {
        Ok(()) => {
            info!(%attempt, %job_id, %app_id, "integrated sign job completed");
            Ok(JobOutcome::Completed { job_id, app_id })
        }
        Err(e) => {
            error!(%attempt, %job_id, %app_id, error = %e, "integrated sign job failed");
            Err(e)
        }
    }
}

fn job_id_from(archive: &[u8]) -> Option<String> {
    extract_control_value(archive, JOB_ID_FILE).filter(|id| !id.is_empty())
}

fn run_attempt(
    builder: &Integrated,
    apps: &dyn AppStore,
    app_id: &str,
    archive: &[u8],
) -> Result<(), JobError> {
    let app = apps
        .get(app_id)
        .ok_or_else(|| JobError::AppNotFound(app_id.to_string()))?;

    let sandbox = Sandbox::create()?;
    sandbox.seed_from(builder.sign_files_dir())?;
    sandbox.unpack_archive(archive)?;
    {
        let mut unsigned = app.get_file(APP_UNSIGNED)?;
        sandbox.write_file(UNSIGNED_FILE, &mut unsigned)?;
    }

    let spec = RunSpec {
        program: sandbox.path().join(builder.entrypoint()),
        work_dir: sandbox.path().to_path_buf(),
        env: builder.job_environment(),
        deadline: builder.job_timeout(),
    };
    builder.runner().run(&spec)?;

    let signed_path = sandbox.path().join(SIGNED_FILE);
    let mut signed = File::open(&signed_path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => JobError::SignedMissing(signed_path.clone()),
        _ => JobError::Io(e),
    })?;
    let bytes = app.set_file(APP_SIGNED, &mut signed)?;
    debug!(%app_id, bytes, "stored signed app");

    match fs::read_to_string(sandbox.path().join(BUNDLE_ID_FILE)) {
        Ok(text) => {
            if let Err(e) = app.set_string(APP_BUNDLE_ID, text.trim()) {
                warn!(%app_id, error = %e, "set bundle id");
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(%app_id, error = %e, "read bundle id"),
    }

    drop(signed);
    sandbox.close();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::IntegratedConfig;
    use localsign_protocol::{pack, App, ArchiveEntry, ArchiveError, ReturnJob};
    use std::collections::HashMap;
    use std::io::{Read, Write};
    use std::sync::{Arc, Mutex};

    /// Queue double: hands out one prepared archive, optionally failing
    /// after writing a prefix of it.
    #[derive(Default)]
    struct FakeJobs {
        archive: Mutex<Option<(Vec<u8>, bool)>>,
        entries: Mutex<HashMap<String, Arc<ReturnJob>>>,
    }

    impl FakeJobs {
        fn with_job(job: ReturnJob, archive: Vec<u8>) -> Self {
            let fake = Self::default();
            fake.entries.lock().unwrap().insert(job.id().to_string(), Arc::new(job));
            *fake.archive.lock().unwrap() = Some((archive, false));
            fake
        }

        fn failing_after(mut self, prefix: usize) -> Self {
            let slot = self.archive.get_mut().unwrap();
            if let Some((bytes, fail)) = slot.as_mut() {
                bytes.truncate(prefix);
                *fail = true;
            }
            self
        }

        fn contains(&self, job_id: &str) -> bool {
            self.entries.lock().unwrap().contains_key(job_id)
        }
    }

    impl JobStore for FakeJobs {
        fn take_next(&self, writer: &mut dyn Write) -> Result<(), TakeError> {
            let (bytes, fail) = self.archive.lock().unwrap().take().ok_or(TakeError::NotFound)?;
            writer.write_all(&bytes).map_err(ArchiveError::from)?;
            if fail {
                let broken = io::Error::new(io::ErrorKind::BrokenPipe, "connection reset");
                return Err(TakeError::Archive(ArchiveError::Io(broken)));
            }
            Ok(())
        }

        fn get_by_id(&self, job_id: &str) -> Option<Arc<ReturnJob>> {
            self.entries.lock().unwrap().get(job_id).cloned()
        }

        fn delete_by_id(&self, job_id: &str) -> bool {
            self.entries.lock().unwrap().remove(job_id).is_some()
        }
    }

    #[derive(Default)]
    struct FakeApp {
        id: String,
        files: Mutex<HashMap<String, Vec<u8>>>,
        strings: Mutex<HashMap<String, String>>,
    }

    impl App for FakeApp {
        fn id(&self) -> &str {
            &self.id
        }

        fn get_file(&self, name: &str) -> Result<Box<dyn Read + Send>, StoreError> {
            let files = self.files.lock().unwrap();
            let data = files.get(name).cloned().ok_or_else(|| StoreError::MissingFile {
                app_id: self.id.clone(),
                name: name.to_string(),
            })?;
            Ok(Box::new(io::Cursor::new(data)))
        }

        fn set_file(&self, name: &str, reader: &mut dyn Read) -> Result<u64, StoreError> {
            let mut data = Vec::new();
            reader.read_to_end(&mut data)?;
            let len = data.len() as u64;
            self.files.lock().unwrap().insert(name.to_string(), data);
            Ok(len)
        }

        fn get_string(&self, name: &str) -> Result<String, StoreError> {
            self.strings.lock().unwrap().get(name).cloned().ok_or_else(|| StoreError::MissingValue {
                app_id: self.id.clone(),
                name: name.to_string(),
            })
        }

        fn set_string(&self, name: &str, value: &str) -> Result<(), StoreError> {
            self.strings.lock().unwrap().insert(name.to_string(), value.to_string());
            Ok(())
        }

        fn is_signed(&self) -> Result<bool, StoreError> {
            Ok(self.files.lock().unwrap().contains_key(APP_SIGNED))
        }
    }

    #[derive(Default)]
    struct FakeApps {
        apps: HashMap<String, Arc<FakeApp>>,
    }

    impl FakeApps {
        fn with_app(app_id: &str, unsigned: &[u8]) -> (Self, Arc<FakeApp>) {
            let app = Arc::new(FakeApp {
                id: app_id.to_string(),
                ..FakeApp::default()
            });
            app.files.lock().unwrap().insert(APP_UNSIGNED.to_string(), unsigned.to_vec());
            let mut apps = HashMap::new();
            apps.insert(app_id.to_string(), Arc::clone(&app));
            (Self { apps }, app)
        }
    }

    impl AppStore for FakeApps {
        fn get(&self, app_id: &str) -> Option<Arc<dyn App>> {
            self.apps.get(app_id).map(|app| Arc::clone(app) as Arc<dyn App>)
        }
    }

    fn make_archive(job_id: &str) -> Vec<u8> {
        pack(&[
            ArchiveEntry::file(JOB_ID_FILE, job_id),
            ArchiveEntry::file("args.txt", "-a"),
            ArchiveEntry::file("cert.p12", vec![7u8; 2048]),
        ])
        .unwrap()
    }

    fn make_builder() -> Integrated {
        Integrated::new(IntegratedConfig::default())
    }

    #[test]
    fn test_idle_queue() {
        let jobs = FakeJobs::default();
        let apps = FakeApps::default();
        let outcome = process_integrated_job(&make_builder(), &jobs, &apps).unwrap();
        assert_eq!(outcome, JobOutcome::Idle);
    }

    #[test]
    fn test_partial_archive_still_deletes_entry() {
        let jobs = FakeJobs::with_job(ReturnJob::new("job-1", "app-1", "dev"), make_archive("job-1"))
            .failing_after(1536);
        let apps = FakeApps::default();

        let err = process_integrated_job(&make_builder(), &jobs, &apps).unwrap_err();

        assert!(matches!(err, JobError::Transport(_)), "{err:?}");
        assert!(err.stops_draining());
        assert!(!jobs.contains("job-1"));
    }

    #[test]
    fn test_unidentifiable_archive_leaves_entry() {
        let jobs = FakeJobs::with_job(ReturnJob::new("job-1", "app-1", "dev"), make_archive("job-1"))
            .failing_after(100);
        let apps = FakeApps::default();

        let err = process_integrated_job(&make_builder(), &jobs, &apps).unwrap_err();

        assert!(matches!(err, JobError::Transport(_)));
        assert!(jobs.contains("job-1"));
    }

    #[test]
    fn test_archive_without_id() {
        let archive = pack(&[ArchiveEntry::file("args.txt", "")]).unwrap();
        let jobs = FakeJobs::with_job(ReturnJob::new("job-1", "app-1", "dev"), archive);
        let apps = FakeApps::default();

        let err = process_integrated_job(&make_builder(), &jobs, &apps).unwrap_err();
        assert!(matches!(err, JobError::MissingJobId));
    }

    #[test]
    fn test_unknown_job_id() {
        let jobs = FakeJobs::with_job(ReturnJob::new("job-1", "app-1", "dev"), make_archive("job-2"));
        let apps = FakeApps::default();

        let err = process_integrated_job(&make_builder(), &jobs, &apps).unwrap_err();
        assert!(matches!(err, JobError::UnknownJob(ref id) if id == "job-2"));
        assert!(jobs.contains("job-1"));
    }

    #[test]
    fn test_missing_app_deletes_entry() {
        let jobs = FakeJobs::with_job(ReturnJob::new("job-1", "app-1", "dev"), make_archive("job-1"));
        let apps = FakeApps::default();

        let err = process_integrated_job(&make_builder(), &jobs, &apps).unwrap_err();

        assert!(matches!(err, JobError::AppNotFound(ref id) if id == "app-1"));
        assert!(!jobs.contains("job-1"));
    }

    #[cfg(unix)]
    mod entrypoint {
        use super::*;
        use crate::runner::ProcessRunner;
        use std::os::unix::fs::PermissionsExt;
        use std::path::Path;
        use tempfile::TempDir;

        fn make_sign_files(root: &Path, script: &str) -> PathBuf {
            let dir = root.join("builder");
            fs::create_dir_all(&dir).unwrap();
            let path = dir.join("sign.sh");
            fs::write(&path, format!("#!/bin/sh\n{script}")).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
            dir
        }

        fn make_stub_builder(sign_files_dir: PathBuf) -> Integrated {
            let config = IntegratedConfig {
                sign_files_dir,
                entrypoint: "sign.sh".to_string(),
                job_timeout_mins: 1,
                ..IntegratedConfig::default()
            };
            Integrated::new(config).with_runner(ProcessRunner::new().with_sink(Box::new(io::sink())))
        }

        #[test]
        fn test_success_stores_signed_and_bundle_id() {
            let temp = TempDir::new().unwrap();
            let script = "set -e\n\
                test \"$INTEGRATED_BUILDER\" = 1\n\
                test \"$(cat id.txt)\" = job-1\n\
                cp unsigned.ipa signed.ipa\n\
                printf '  com.example.app \\n' > bundle_id.txt\n";
            let builder = make_stub_builder(make_sign_files(temp.path(), script));
            let jobs = FakeJobs::with_job(ReturnJob::new("job-1", "app-1", "dev"), make_archive("job-1"));
            let (apps, app) = FakeApps::with_app("app-1", b"unsigned-bytes");

            let outcome = process_integrated_job(&builder, &jobs, &apps).unwrap();

            assert_eq!(
                outcome,
                JobOutcome::Completed {
                    job_id: "job-1".to_string(),
                    app_id: "app-1".to_string()
                }
            );
            assert!(!jobs.contains("job-1"));
            assert_eq!(app.files.lock().unwrap().get(APP_SIGNED).unwrap(), b"unsigned-bytes");
            assert_eq!(app.get_string(APP_BUNDLE_ID).unwrap(), "com.example.app");
        }

        #[test]
        fn test_entrypoint_failure_deletes_entry_and_leaves_app_unsigned() {
            let temp = TempDir::new().unwrap();
            let builder = make_stub_builder(make_sign_files(
                temp.path(),
                "echo 'ERROR: cert expired' >&2\nexit 1\n",
            ));
            let jobs = FakeJobs::with_job(ReturnJob::new("job-1", "app-1", "dev"), make_archive("job-1"));
            let (apps, app) = FakeApps::with_app("app-1", b"unsigned-bytes");

            let err = process_integrated_job(&builder, &jobs, &apps).unwrap_err();

            assert!(err.to_string().contains("ERROR: cert expired"), "{err}");
            assert!(err.entrypoint_output().unwrap().contains("ERROR: cert expired"));
            assert!(!jobs.contains("job-1"));
            assert!(!app.is_signed().unwrap());
        }

        #[test]
        fn test_missing_signed_output() {
            let temp = TempDir::new().unwrap();
            let builder = make_stub_builder(make_sign_files(temp.path(), "exit 0\n"));
            let jobs = FakeJobs::with_job(ReturnJob::new("job-1", "app-1", "dev"), make_archive("job-1"));
            let (apps, app) = FakeApps::with_app("app-1", b"unsigned-bytes");

            let err = process_integrated_job(&builder, &jobs, &apps).unwrap_err();

            assert!(matches!(err, JobError::SignedMissing(_)), "{err:?}");
            assert!(!jobs.contains("job-1"));
            assert!(!app.is_signed().unwrap());
        }

        #[test]
        fn test_missing_sign_files_is_sandbox_error() {
            let temp = TempDir::new().unwrap();
            let builder = make_stub_builder(temp.path().join("absent"));
            let jobs = FakeJobs::with_job(ReturnJob::new("job-1", "app-1", "dev"), make_archive("job-1"));
            let (apps, _app) = FakeApps::with_app("app-1", b"unsigned-bytes");

            let err = process_integrated_job(&builder, &jobs, &apps).unwrap_err();

            assert!(matches!(err, JobError::Sandbox(SandboxError::SignFilesMissing(_))));
            assert!(!jobs.contains("job-1"));
        }
    }
}
