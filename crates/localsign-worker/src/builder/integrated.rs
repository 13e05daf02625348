//! The integrated builder: one local worker thread running the sign
//! entrypoint for queued jobs.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::{Builder, BuilderError, BuilderSecrets};
use crate::job::{JobError, JobOutcome};
use crate::runner::ProcessRunner;

const BUILDER_NAME: &str = "Integrated";

/// `[builder.integrated]` configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegratedConfig {
    pub enable: bool,
    /// Static tree copied into every sandbox before the job archive.
    pub sign_files_dir: PathBuf,
    /// Entrypoint path relative to the sandbox root.
    pub entrypoint: String,
    pub job_timeout_mins: u64,
}

impl Default for IntegratedConfig {
    fn default() -> Self {
        Self {
            enable: true,
            sign_files_dir: PathBuf::from("./builder"),
            entrypoint: "sign.py".to_string(),
            job_timeout_mins: 15,
        }
    }
}

impl IntegratedConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_mins.saturating_mul(60))
    }
}

/// Worker body. Called with the builder each time the worker looks for work.
pub type ProcessFn = Box<dyn Fn(&Integrated) -> Result<JobOutcome, JobError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// No worker body installed yet; triggers are remembered.
    Uninstalled,
    Idle,
    Running,
}

#[derive(Debug)]
struct WorkerSlot {
    state: WorkerState,
    rerun: bool,
    shutdown: bool,
    runs: u64,
}

type Shared = (Mutex<WorkerSlot>, Condvar);

fn lock(shared: &Shared) -> MutexGuard<'_, WorkerSlot> {
    shared.0.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Integrated {
    config: IntegratedConfig,
    secrets: OnceLock<BuilderSecrets>,
    runner: ProcessRunner,
    shared: Arc<Shared>,
}

impl fmt::Debug for Integrated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Integrated")
            .field("config", &self.config)
            .field("secrets_set", &self.secrets.get().is_some())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Integrated {
    pub fn new(config: IntegratedConfig) -> Self {
        Self {
            config,
            secrets: OnceLock::new(),
            runner: ProcessRunner::new(),
            shared: Arc::new((
                Mutex::new(WorkerSlot {
                    state: WorkerState::Uninstalled,
                    rerun: false,
                    shutdown: false,
                    runs: 0,
                }),
                Condvar::new(),
            )),
        }
    }

    /// Replace the process runner (output sink, termination grace).
    pub fn with_runner(mut self, runner: ProcessRunner) -> Self {
        self.runner = runner;
        self
    }

    pub fn config(&self) -> &IntegratedConfig {
        &self.config
    }

    pub fn runner(&self) -> &ProcessRunner {
        &self.runner
    }

    pub fn sign_files_dir(&self) -> &Path {
        &self.config.sign_files_dir
    }

    pub fn entrypoint(&self) -> &str {
        &self.config.entrypoint
    }

    pub fn secrets(&self) -> Option<&BuilderSecrets> {
        self.secrets.get()
    }

    pub fn state(&self) -> WorkerState {
        lock(&self.shared).state
    }

    /// Number of worker runs finished since the body was installed.
    pub fn completed_runs(&self) -> u64 {
        lock(&self.shared).runs
    }

    /// Environment for one entrypoint invocation: the host environment,
    /// then the builder secrets, then the integrated-mode flags.
    pub fn job_environment(&self) -> BTreeMap<String, String> {
        let mut env: BTreeMap<String, String> = std::env::vars().collect();
        if let Some(secrets) = self.secrets.get() {
            env.extend(secrets.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        env.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());
        env.insert("INTEGRATED_BUILDER".to_string(), "1".to_string());
        env
    }

    /// Install the worker body and start the worker thread.
    ///
    /// Returns `Ok(false)` without replacing anything if a body is already
    /// installed. A trigger received before installation starts a run
    /// right away.
    pub fn set_process_fn(self: &Arc<Self>, process: ProcessFn) -> Result<bool, BuilderError> {
        let mut slot = lock(&self.shared);
        if slot.state != WorkerState::Uninstalled {
            debug!("integrated worker already installed");
            return Ok(false);
        }

        let shared = Arc::clone(&self.shared);
        let builder = Arc::downgrade(self);
        thread::Builder::new()
            .name("localsign-integrated".to_string())
            .spawn(move || worker_loop(shared, builder, process))
            .map_err(BuilderError::WorkerSpawn)?;

        slot.state = WorkerState::Idle;
        info!(pending_trigger = slot.rerun, "integrated worker started");
        Ok(true)
    }
}

impl Builder for Integrated {
    fn name(&self) -> &str {
        BUILDER_NAME
    }

    fn set_secrets(&self, secrets: BuilderSecrets) -> Result<(), BuilderError> {
        let stored = self.secrets.get_or_init(|| secrets.clone());
        if *stored == secrets {
            Ok(())
        } else {
            Err(BuilderError::SecretsConflict(BUILDER_NAME.to_string()))
        }
    }

    fn trigger(&self) -> Result<(), BuilderError> {
        let mut slot = lock(&self.shared);
        slot.rerun = true;
        debug!(state = ?slot.state, "integrated builder triggered");
        self.shared.1.notify_all();
        Ok(())
    }

    fn job_timeout(&self) -> Duration {
        self.config.job_timeout()
    }
}

impl Drop for Integrated {
    fn drop(&mut self) {
        let mut slot = lock(&self.shared);
        slot.shutdown = true;
        self.shared.1.notify_all();
    }
}

fn worker_loop(shared: Arc<Shared>, builder: Weak<Integrated>, process: ProcessFn) {
    loop {
        {
            let mut slot = lock(&shared);
            while !slot.rerun && !slot.shutdown {
                slot = shared.1.wait(slot).unwrap_or_else(PoisonError::into_inner);
            }
            if slot.shutdown {
                debug!("integrated worker stopping");
                return;
            }
            slot.rerun = false;
            slot.state = WorkerState::Running;
        }

        if let Some(builder) = builder.upgrade() {
            drain_queue(&builder, &process);
        }

        let mut slot = lock(&shared);
        slot.state = WorkerState::Idle;
        slot.runs += 1;
        shared.1.notify_all();
    }
}

/// Process jobs until the queue reports idle. Any attempt that got past
/// `take_next` consumed one pending job, so this terminates.
fn drain_queue(builder: &Integrated, process: &ProcessFn) {
    loop {
        match panic::catch_unwind(AssertUnwindSafe(|| process(builder))) {
            Ok(Ok(JobOutcome::Idle)) => return,
            Ok(Ok(JobOutcome::Completed { job_id, app_id })) => {
                debug!(%job_id, %app_id, "integrated job finished");
            }
            Ok(Err(e)) => {
                error!(error = %e, "integrated job failed");
                if e.stops_draining() {
                    return;
                }
            }
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                warn!(panic = %message, "integrated worker body panicked");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Instant;

    fn wait_for_runs(builder: &Integrated, runs: u64) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while builder.completed_runs() < runs {
            assert!(Instant::now() < deadline, "worker did not finish {runs} runs");
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn counting_fn(calls: Arc<AtomicUsize>) -> ProcessFn {
        Box::new(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(JobOutcome::Idle)
        })
    }

    #[test]
    fn test_config_defaults() {
        let config = IntegratedConfig::default();
        assert!(config.enable);
        assert_eq!(config.sign_files_dir, PathBuf::from("./builder"));
        assert_eq!(config.entrypoint, "sign.py");
        assert_eq!(config.job_timeout(), Duration::from_secs(15 * 60));
    }

    #[test]
    fn test_state_starts_uninstalled() {
        let builder = Integrated::new(IntegratedConfig::default());
        assert_eq!(builder.state(), WorkerState::Uninstalled);
        assert_eq!(builder.completed_runs(), 0);
    }

    #[test]
    fn test_second_install_is_noop() {
        let builder = Arc::new(Integrated::new(IntegratedConfig::default()));
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        assert!(builder.set_process_fn(counting_fn(Arc::clone(&first))).unwrap());
        assert!(!builder.set_process_fn(counting_fn(Arc::clone(&second))).unwrap());

        builder.trigger().unwrap();
        wait_for_runs(&builder, 1);
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_trigger_before_install_runs_after_install() {
        let builder = Arc::new(Integrated::new(IntegratedConfig::default()));
        let calls = Arc::new(AtomicUsize::new(0));

        builder.trigger().unwrap();
        builder.set_process_fn(counting_fn(Arc::clone(&calls))).unwrap();

        wait_for_runs(&builder, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_triggers_during_run_coalesce() {
        let builder = Arc::new(Integrated::new(IntegratedConfig::default()));
        let calls = Arc::new(AtomicUsize::new(0));
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let started_tx = Mutex::new(started_tx);
        let release_rx = Mutex::new(release_rx);

        let counter = Arc::clone(&calls);
        builder
            .set_process_fn(Box::new(move |_| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    started_tx.lock().unwrap().send(()).unwrap();
                    release_rx.lock().unwrap().recv().unwrap();
                }
                Ok(JobOutcome::Idle)
            }))
            .unwrap();

        builder.trigger().unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(builder.state(), WorkerState::Running);

        for _ in 0..5 {
            builder.trigger().unwrap();
        }
        release_tx.send(()).unwrap();

        wait_for_runs(&builder, 2);
        thread::sleep(Duration::from_millis(200));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(builder.completed_runs(), 2);
        assert_eq!(builder.state(), WorkerState::Idle);
    }

    #[test]
    fn test_run_drains_until_idle() {
        let builder = Arc::new(Integrated::new(IntegratedConfig::default()));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        builder
            .set_process_fn(Box::new(move |_| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < 3 {
                    Ok(JobOutcome::Completed {
                        job_id: format!("job-{n}"),
                        app_id: format!("app-{n}"),
                    })
                } else {
                    Ok(JobOutcome::Idle)
                }
            }))
            .unwrap();

        builder.trigger().unwrap();
        wait_for_runs(&builder, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_panicking_body_does_not_kill_worker() {
        let builder = Arc::new(Integrated::new(IntegratedConfig::default()));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        builder
            .set_process_fn(Box::new(move |_| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("boom");
                }
                Ok(JobOutcome::Idle)
            }))
            .unwrap();

        builder.trigger().unwrap();
        wait_for_runs(&builder, 1);
        builder.trigger().unwrap();
        wait_for_runs(&builder, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_job_environment_layers_secrets_and_flags() {
        let builder = Integrated::new(IntegratedConfig::default());
        let mut secrets = BuilderSecrets::new();
        secrets.insert("SECRET_KEY".to_string(), "abc".to_string());
        secrets.insert("SECRET_URL".to_string(), "http://localhost:8080".to_string());
        builder.set_secrets(secrets).unwrap();

        let env = builder.job_environment();
        assert_eq!(env.get("SECRET_KEY").map(String::as_str), Some("abc"));
        assert_eq!(env.get("SECRET_URL").map(String::as_str), Some("http://localhost:8080"));
        assert_eq!(env.get("PYTHONUNBUFFERED").map(String::as_str), Some("1"));
        assert_eq!(env.get("INTEGRATED_BUILDER").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_secrets_conflict() {
        let builder = Integrated::new(IntegratedConfig::default());
        let mut secrets = BuilderSecrets::new();
        secrets.insert("SECRET_KEY".to_string(), "abc".to_string());
        builder.set_secrets(secrets.clone()).unwrap();

        secrets.insert("SECRET_KEY".to_string(), "xyz".to_string());
        assert!(matches!(
            builder.set_secrets(secrets),
            Err(BuilderError::SecretsConflict(_))
        ));
        assert_eq!(
            builder.secrets().and_then(|s| s.get("SECRET_KEY")).map(String::as_str),
            Some("abc")
        );
    }
}
