//! localsign integrated worker
//!
//! Runs the external sign entrypoint for queued jobs:
//! - `builder`: the trigger protocol and the integrated builder's single worker thread
//! - `job`: one job attempt, from taking the archive to storing the signed app
//! - `runner`: supervised entrypoint execution with output capture and a deadline
//! - `sandbox`: the per-attempt working directory

pub mod builder;
pub mod job;
pub mod runner;
pub mod sandbox;

pub use builder::{
    AnyBuilder, Builder, BuilderError, BuilderSecrets, Integrated, IntegratedConfig, ProcessFn,
    WorkerState, SECRET_KEY, SECRET_URL,
};
pub use job::{process_integrated_job, JobError, JobOutcome};
pub use runner::{is_important_line, ProcessRunner, RunSpec, RunnerError};
pub use sandbox::{Sandbox, SandboxError};
