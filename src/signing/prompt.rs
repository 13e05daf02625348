//! Two-factor code entry.
//!
//! The sign script may need a code the operator receives out of band. The
//! code is handed to the in-flight return job's relay, where the worker's
//! callback side can read it.

use std::io::{self, BufRead, Write};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{info, warn};

use crate::storage::{JobQueue, JobStatus};

const PROMPT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("read 2FA code: {0}")]
    Io(#[from] io::Error),

    #[error("no job in progress for app {0}")]
    NoJob(String),
}

/// Hand `code` to the in-flight job for `app_id`.
///
/// Returns `true` if this call stored the code, `false` if the relay
/// already held one or the code was blank.
pub fn relay_code(queue: &JobQueue, app_id: &str, code: &str) -> Result<bool, PromptError> {
    let job = queue
        .get_by_app_id(app_id)
        .ok_or_else(|| PromptError::NoJob(app_id.to_string()))?;

    let stored = job.two_factor().set(code);
    if stored {
        info!(%app_id, return_job_id = %job.id(), "2FA code set in job");
    } else {
        warn!(%app_id, return_job_id = %job.id(), "2FA code ignored");
    }
    Ok(stored)
}

/// Wait until the job for `app_id` is in flight, ask for a code on
/// `output`, read one line from `input` and relay it.
///
/// May be started before the job is queued. Returns `Ok(false)` without
/// prompting if the job finishes or `deadline` passes first, and
/// `Ok(false)` on end of input.
pub fn prompt_two_factor<R, W>(
    mut input: R,
    mut output: W,
    queue: &JobQueue,
    app_id: &str,
    deadline: Duration,
) -> Result<bool, PromptError>
where
    R: BufRead,
    W: Write,
{
    let started = Instant::now();
    let mut queued = false;
    loop {
        match queue.status(app_id) {
            JobStatus::InFlight(_) => break,
            JobStatus::Pending => queued = true,
            // Not queued yet, or already finished.
            JobStatus::Absent if queued => return Ok(false),
            JobStatus::Absent => {}
        }
        if started.elapsed() >= deadline {
            return Ok(false);
        }
        thread::sleep(PROMPT_POLL_INTERVAL);
    }

    write!(output, "Enter 2FA code: ")?;
    output.flush()?;

    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(false);
    }

    match relay_code(queue, app_id, &line) {
        Err(PromptError::NoJob(_)) => {
            warn!(%app_id, "job finished before the 2FA code was entered");
            Ok(false)
        }
        other => other,
    }
}
