//! localsign - local iOS app signing orchestrator
//!
//! Turns an uploaded `.ipa` plus a signing profile into a signed bundle by
//! running an external sign script in a sandbox through the integrated
//! builder, and lets a caller block until the job is done.

pub mod config;
pub mod logging;
pub mod signing;
pub mod storage;

pub use config::{Config, ConfigError, EffectiveConfig};
pub use signing::{CliSigningOptions, SigningError, SigningService, WaitConfig, WaitError, WaitLoop};
pub use storage::{FsAppStore, JobQueue, SignJob, Storage};
