//! Supervised execution of the sign entrypoint.
//!
//! The entrypoint runs in its own process group with a caller-supplied
//! environment. Stdout and stderr are drained line by line on two threads
//! into a live sink (the operator's terminal by default) and a capture
//! buffer that is only surfaced when the run fails. The job deadline is
//! enforced with SIGTERM to the group, a grace period, then SIGKILL.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{error, info, warn};

/// Time between SIGTERM and SIGKILL when the deadline elapses.
pub const DEFAULT_TERMINATION_GRACE: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const SPAWN_ATTEMPTS: u32 = 3;

/// Case-insensitive markers that make a stdout line worth logging.
const IMPORTANT_MARKERS: &[&str] = &[
    "error",
    "failed",
    "exception",
    "two-factor authentication (2fa) code",
    "please enter",
];

/// Whether a stdout line from the entrypoint should be surfaced in the log.
///
/// Routine tool output is only echoed to the live sink; errors and
/// two-factor prompts are logged as well.
pub fn is_important_line(line: &str) -> bool {
    let lower = line.to_lowercase();
    IMPORTANT_MARKERS.iter().any(|marker| lower.contains(marker))
        || (lower.contains("2fa") && (lower.contains("code") || lower.contains("required")))
}

/// Errors from running the entrypoint.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error while supervising entrypoint: {0}")]
    Io(#[from] io::Error),

    #[error("sign script: {status}: {output}")]
    Failed { status: String, output: String },

    #[error("sign script: timed out after {after:?}: {output}")]
    TimedOut { after: Duration, output: String },
}

impl RunnerError {
    /// Combined stdout/stderr captured before the failure, if the process ran.
    pub fn output(&self) -> Option<&str> {
        match self {
            RunnerError::Failed { output, .. } | RunnerError::TimedOut { output, .. } => Some(output),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RunnerError::TimedOut { .. })
    }
}

/// One entrypoint invocation.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub program: PathBuf,
    pub work_dir: PathBuf,
    /// Complete environment; nothing is inherited from the worker.
    pub env: BTreeMap<String, String>,
    pub deadline: Duration,
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

enum Exit {
    Finished(ExitStatus),
    TimedOut,
}

type Sink = Arc<Mutex<Box<dyn Write + Send>>>;

/// Runs entrypoints and captures their output.
pub struct ProcessRunner {
    sink: Sink,
    termination_grace: Duration,
}

impl fmt::Debug for ProcessRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessRunner")
            .field("termination_grace", &self.termination_grace)
            .finish_non_exhaustive()
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRunner {
    /// Runner that echoes entrypoint output to the worker's stdout.
    pub fn new() -> Self {
        Self {
            sink: Arc::new(Mutex::new(Box::new(io::stdout()))),
            termination_grace: DEFAULT_TERMINATION_GRACE,
        }
    }

    /// Replace the live sink.
    pub fn with_sink(mut self, sink: Box<dyn Write + Send>) -> Self {
        self.sink = Arc::new(Mutex::new(sink));
        self
    }

    pub fn with_termination_grace(mut self, grace: Duration) -> Self {
        self.termination_grace = grace;
        self
    }

    /// Run the entrypoint to completion or until the deadline.
    ///
    /// Returns only after both output streams have been fully drained.
    pub fn run(&self, spec: &RunSpec) -> Result<(), RunnerError> {
        let mut command = Command::new(&spec.program);
        command
            .current_dir(&spec.work_dir)
            .env_clear()
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = spawn_with_retry(&mut command).map_err(|source| RunnerError::Spawn {
            program: spec.program.display().to_string(),
            source,
        })?;

        let capture = Arc::new(Mutex::new(String::new()));
        let stdout_handle = child
            .stdout
            .take()
            .map(|out| self.drain(out, Stream::Stdout, &capture));
        let stderr_handle = child
            .stderr
            .take()
            .map(|err| self.drain(err, Stream::Stderr, &capture));

        let exit = self.wait_with_deadline(&mut child, spec.deadline);
        if matches!(exit, Ok(Exit::Finished(_))) {
            kill_stragglers(&child);
        }

        for handle in [stdout_handle, stderr_handle].into_iter().flatten() {
            if handle.join().is_err() {
                warn!("sign script output drain panicked");
            }
        }
        let output = std::mem::take(&mut *capture.lock().unwrap_or_else(PoisonError::into_inner));

        match exit? {
            Exit::Finished(status) if status.success() => Ok(()),
            Exit::Finished(status) => {
                error!(status = %status, output = %output, "sign script failed");
                Err(RunnerError::Failed {
                    status: status.to_string(),
                    output,
                })
            }
            Exit::TimedOut => {
                error!(deadline = ?spec.deadline, output = %output, "sign script timed out");
                Err(RunnerError::TimedOut {
                    after: spec.deadline,
                    output,
                })
            }
        }
    }

    fn wait_with_deadline(&self, child: &mut Child, deadline: Duration) -> io::Result<Exit> {
        let started = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(Exit::Finished(status)),
                Ok(None) => {}
                Err(e) => {
                    let _ = self.terminate(child);
                    return Err(e);
                }
            }

            if started.elapsed() >= deadline {
                warn!(pid = child.id(), deadline = ?deadline, "deadline elapsed, terminating sign script");
                self.terminate(child)?;
                return Ok(Exit::TimedOut);
            }

            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Terminate the entrypoint's process group and reap the child.
    fn terminate(&self, child: &mut Child) -> io::Result<ExitStatus> {
        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            let group = Pid::from_raw(child.id() as i32);
            let _ = killpg(group, Signal::SIGTERM);

            let started = Instant::now();
            while started.elapsed() < self.termination_grace {
                if let Some(status) = child.try_wait()? {
                    kill_stragglers(child);
                    return Ok(status);
                }
                thread::sleep(POLL_INTERVAL);
            }
            let _ = killpg(group, Signal::SIGKILL);
        }

        let _ = child.kill();
        child.wait()
    }

    fn drain<R: Read + Send + 'static>(
        &self,
        stream: R,
        kind: Stream,
        capture: &Arc<Mutex<String>>,
    ) -> JoinHandle<()> {
        let sink = Arc::clone(&self.sink);
        let capture = Arc::clone(capture);

        thread::spawn(move || {
            let mut reader = BufReader::new(stream);
            let mut raw = Vec::new();
            loop {
                raw.clear();
                match reader.read_until(b'\n', &mut raw) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "read sign script output");
                        break;
                    }
                }
                let decoded = String::from_utf8_lossy(&raw);
                let line = decoded.trim_end_matches(['\r', '\n']);

                {
                    let mut sink = sink.lock().unwrap_or_else(PoisonError::into_inner);
                    let _ = writeln!(sink, "{line}");
                    let _ = sink.flush();
                }
                {
                    let mut capture = capture.lock().unwrap_or_else(PoisonError::into_inner);
                    capture.push_str(line);
                    capture.push('\n');
                }

                match kind {
                    Stream::Stdout => {
                        if is_important_line(line) {
                            info!(line, "sign script");
                        }
                    }
                    Stream::Stderr => warn!(line, "sign script stderr"),
                }
            }
        })
    }
}

/// SIGKILL whatever is left in the entrypoint's process group once the
/// entrypoint itself has exited. Background helpers would otherwise hold
/// the output pipes open and the drain threads would never finish.
#[cfg(unix)]
fn kill_stragglers(child: &Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let _ = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL);
}

#[cfg(not(unix))]
fn kill_stragglers(_child: &Child) {}

/// Spawn, retrying briefly on ETXTBSY.
///
/// The entrypoint is copied into the sandbox just before it is executed;
/// a concurrent fork elsewhere in the process can still hold the write
/// descriptor for a moment.
fn spawn_with_retry(command: &mut Command) -> io::Result<Child> {
    let mut attempt = 1;
    loop {
        match command.spawn() {
            Ok(child) => return Ok(child),
            Err(e) if attempt < SPAWN_ATTEMPTS && is_text_file_busy(&e) => {
                attempt += 1;
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(unix)]
fn is_text_file_busy(e: &io::Error) -> bool {
    e.raw_os_error() == Some(nix::errno::Errno::ETXTBSY as i32)
}

#[cfg(not(unix))]
fn is_text_file_busy(_e: &io::Error) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_important_line_markers() {
        assert!(is_important_line("ERROR: cert expired"));
        assert!(is_important_line("Build Failed"));
        assert!(is_important_line("Unhandled Exception in lane"));
        assert!(is_important_line("Please enter the 6 digit code"));
        assert!(is_important_line("Two-factor Authentication (2FA) code required"));
        assert!(is_important_line("2FA code was sent to your device"));
        assert!(is_important_line("2fa is required for this account"));
    }

    #[test]
    fn test_routine_lines_are_not_important() {
        assert!(!is_important_line("Resigning Payload/MyApp.app"));
        assert!(!is_important_line("2FA enabled"));
        assert!(!is_important_line(""));
    }

    #[test]
    fn test_runner_error_output_accessor() {
        let failed = RunnerError::Failed {
            status: "exit status: 1".to_string(),
            output: "boom\n".to_string(),
        };
        assert_eq!(failed.output(), Some("boom\n"));
        assert!(!failed.is_timeout());

        let timed_out = RunnerError::TimedOut {
            after: Duration::from_secs(1),
            output: String::new(),
        };
        assert!(timed_out.is_timeout());
    }

    #[cfg(unix)]
    mod unix {
        use super::super::*;
        use std::fs;
        use std::os::unix::fs::PermissionsExt;
        use std::path::Path;
        use tempfile::TempDir;

        /// Write sink shared with the test body.
        #[derive(Clone, Default)]
        struct SharedSink(Arc<Mutex<Vec<u8>>>);

        impl Write for SharedSink {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        impl SharedSink {
            fn contents(&self) -> String {
                String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
            }
        }

        fn write_script(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("entrypoint.sh");
            fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        /// Alive and not a zombie. An orphaned helper is reaped by init, which
        /// may lag behind the kill.
        fn is_running(pid: i32) -> bool {
            if nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_err() {
                return false;
            }
            match fs::read_to_string(format!("/proc/{pid}/stat")) {
                Ok(stat) => stat
                    .rsplit(')')
                    .next()
                    .and_then(|rest| rest.split_whitespace().next())
                    .is_some_and(|state| state != "Z"),
                Err(_) => !Path::new("/proc/self").exists(),
            }
        }

        fn spec(dir: &Path, program: PathBuf, deadline: Duration) -> RunSpec {
            let mut env = BTreeMap::new();
            env.insert("PATH".to_string(), std::env::var("PATH").unwrap_or_default());
            RunSpec {
                program,
                work_dir: dir.to_path_buf(),
                env,
                deadline,
            }
        }

        #[test]
        fn test_success_streams_to_sink() {
            let temp = TempDir::new().unwrap();
            let program = write_script(temp.path(), "echo hello\necho oops >&2\n");
            let sink = SharedSink::default();
            let runner = ProcessRunner::new().with_sink(Box::new(sink.clone()));

            runner.run(&spec(temp.path(), program, Duration::from_secs(10))).unwrap();

            let seen = sink.contents();
            assert!(seen.contains("hello\n"));
            assert!(seen.contains("oops\n"));
        }

        #[test]
        fn test_runs_in_work_dir() {
            let temp = TempDir::new().unwrap();
            let program = write_script(temp.path(), "echo done > marker.txt\n");
            let runner = ProcessRunner::new().with_sink(Box::new(io::sink()));

            runner.run(&spec(temp.path(), program, Duration::from_secs(10))).unwrap();

            assert_eq!(fs::read_to_string(temp.path().join("marker.txt")).unwrap(), "done\n");
        }

        #[test]
        fn test_environment_is_exactly_the_given_map() {
            let temp = TempDir::new().unwrap();
            let program = write_script(temp.path(), "echo \"foo=$FOO home=${HOME:-unset}\"\nexit 2\n");
            let runner = ProcessRunner::new().with_sink(Box::new(io::sink()));
            let mut spec = spec(temp.path(), program, Duration::from_secs(10));
            spec.env.insert("FOO".to_string(), "bar".to_string());

            let err = runner.run(&spec).unwrap_err();

            assert!(err.output().unwrap().contains("foo=bar home=unset"), "{err}");
        }

        #[test]
        fn test_nonzero_exit_carries_stderr() {
            let temp = TempDir::new().unwrap();
            let program = write_script(temp.path(), "echo 'ERROR: cert expired' >&2\nexit 1\n");
            let runner = ProcessRunner::new().with_sink(Box::new(io::sink()));

            let err = runner
                .run(&spec(temp.path(), program, Duration::from_secs(10)))
                .unwrap_err();

            assert!(matches!(err, RunnerError::Failed { .. }), "{err:?}");
            assert!(err.to_string().contains("ERROR: cert expired"), "{err}");
        }

        #[test]
        fn test_trailing_output_is_not_lost() {
            let temp = TempDir::new().unwrap();
            let program = write_script(
                temp.path(),
                "i=1\nwhile [ $i -le 500 ]; do echo \"line $i\"; i=$((i+1)); done\nexit 3\n",
            );
            let runner = ProcessRunner::new().with_sink(Box::new(io::sink()));

            let err = runner
                .run(&spec(temp.path(), program, Duration::from_secs(10)))
                .unwrap_err();

            let output = err.output().unwrap();
            assert!(output.contains("line 1\n"));
            assert!(output.contains("line 500\n"));
        }

        #[test]
        fn test_deadline_kills_process() {
            let temp = TempDir::new().unwrap();
            let program = write_script(temp.path(), "echo $$ > pid.txt\necho started\nsleep 30\n");
            let runner = ProcessRunner::new()
                .with_sink(Box::new(io::sink()))
                .with_termination_grace(Duration::from_secs(2));

            let started = Instant::now();
            let err = runner
                .run(&spec(temp.path(), program, Duration::from_millis(500)))
                .unwrap_err();

            assert!(err.is_timeout(), "{err:?}");
            assert!(started.elapsed() < Duration::from_secs(10));
            assert!(err.output().unwrap().contains("started"));

            let pid: i32 = fs::read_to_string(temp.path().join("pid.txt"))
                .unwrap()
                .trim()
                .parse()
                .unwrap();
            let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok();
            assert!(!alive, "entrypoint {pid} still running");
        }

        #[test]
        fn test_background_helper_does_not_outlive_entrypoint() {
            let temp = TempDir::new().unwrap();
            let program = write_script(
                temp.path(),
                "sleep 30 &\necho $! > helper.txt\necho done\nexit 0\n",
            );
            let runner = ProcessRunner::new().with_sink(Box::new(io::sink()));

            let started = Instant::now();
            runner.run(&spec(temp.path(), program, Duration::from_secs(1))).unwrap();

            assert!(started.elapsed() < Duration::from_secs(3), "{:?}", started.elapsed());
            let pid: i32 = fs::read_to_string(temp.path().join("helper.txt"))
                .unwrap()
                .trim()
                .parse()
                .unwrap();
            thread::sleep(Duration::from_millis(100));
            assert!(!is_running(pid), "helper {pid} still running");
        }

        #[test]
        fn test_missing_program_is_spawn_error() {
            let temp = TempDir::new().unwrap();
            let runner = ProcessRunner::new().with_sink(Box::new(io::sink()));

            let err = runner
                .run(&spec(temp.path(), temp.path().join("nope.sh"), Duration::from_secs(1)))
                .unwrap_err();

            assert!(matches!(err, RunnerError::Spawn { .. }), "{err:?}");
        }
    }
}
