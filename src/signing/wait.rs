//! Blocking wait for a queued job to finish.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use localsign_protocol::{App, StoreError};
use thiserror::Error;
use tracing::{debug, info};

use crate::storage::{JobQueue, JobStatus};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_TWO_FACTOR_CHECK: Duration = Duration::from_secs(2);
pub const DEFAULT_TWO_FACTOR_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum WaitError {
    #[error("job completed but app is not signed")]
    NotSigned,

    #[error("timeout waiting for job to be processed after {0:?}")]
    TimedOut(Duration),

    #[error("check signed status: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitConfig {
    pub poll_interval: Duration,
    /// How often the two-factor relay is inspected.
    pub two_factor_check: Duration,
    /// How long the job may run before the two-factor hint is shown.
    pub two_factor_grace: Duration,
    pub deadline: Duration,
}

impl WaitConfig {
    pub fn with_deadline(deadline: Duration) -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            two_factor_check: DEFAULT_TWO_FACTOR_CHECK,
            two_factor_grace: DEFAULT_TWO_FACTOR_GRACE,
            deadline,
        }
    }
}

/// What a successful wait observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaitReport {
    /// The "code may be required" notice was shown.
    pub two_factor_hinted: bool,
    /// A code was seen in the relay and acknowledged.
    pub two_factor_acknowledged: bool,
    pub elapsed: Duration,
}

/// Polls the queue until an application's job is gone, then reports
/// whether the application was signed.
#[derive(Debug, Clone)]
pub struct WaitLoop {
    queue: Arc<JobQueue>,
    config: WaitConfig,
}

impl WaitLoop {
    pub fn new(queue: Arc<JobQueue>, config: WaitConfig) -> Self {
        Self { queue, config }
    }

    pub fn config(&self) -> &WaitConfig {
        &self.config
    }

    /// Block until the job for `app` is gone or the deadline passes.
    ///
    /// Deletion alone never means success: the signed blob is checked
    /// after the entry disappears. A timeout does not stop the worker.
    pub fn wait(&self, app: &dyn App) -> Result<(), WaitError> {
        self.wait_with_report(app).map(|_| ())
    }

    /// [`wait`](Self::wait), also reporting which two-factor notices were
    /// shown on success.
    pub fn wait_with_report(&self, app: &dyn App) -> Result<WaitReport, WaitError> {
        let app_id = app.id();
        let started = Instant::now();
        let mut last_check = started;
        let mut seen_job: Option<String> = None;
        let mut report = WaitReport::default();

        loop {
            match self.queue.status(app_id) {
                JobStatus::Absent => {
                    report.elapsed = started.elapsed();
                    return if app.is_signed()? {
                        info!(%app_id, elapsed = ?report.elapsed, "job completed successfully");
                        Ok(report)
                    } else {
                        Err(WaitError::NotSigned)
                    };
                }
                JobStatus::Pending => {}
                JobStatus::InFlight(job) => {
                    if seen_job.as_deref() != Some(job.id()) {
                        info!(return_job_id = %job.id(), %app_id, "return job created, waiting for processing");
                        seen_job = Some(job.id().to_string());
                    }

                    if last_check.elapsed() >= self.config.two_factor_check {
                        last_check = Instant::now();
                        if job.two_factor().is_set() {
                            if !report.two_factor_acknowledged {
                                info!(return_job_id = %job.id(), "two-factor code provided, waiting for processing");
                                report.two_factor_acknowledged = true;
                            }
                        } else if !report.two_factor_hinted
                            && started.elapsed() >= self.config.two_factor_grace
                        {
                            info!(return_job_id = %job.id(), "if a two-factor code is required, the sign script will ask for it");
                            report.two_factor_hinted = true;
                        }
                    }
                }
            }

            if started.elapsed() >= self.config.deadline {
                debug!(%app_id, "wait deadline elapsed");
                return Err(WaitError::TimedOut(self.config.deadline));
            }

            thread::sleep(self.config.poll_interval);
        }
    }
}
