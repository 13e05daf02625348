//! localsign job protocol
//!
//! Types shared between the signing service and its integrated worker:
//! - the tar archive codec that moves a job's control files into a sandbox
//! - the return-job record and its two-factor relay
//! - the storage contracts the worker uses to reach jobs and applications

pub mod archive;
pub mod job;
pub mod store;

pub use archive::{
    extract_control_value, pack, unpack, ArchiveEntry, ArchiveError, ArchiveWriter, EntryKind,
};
pub use job::{ReturnJob, TwoFactorRelay};
pub use store::{App, AppStore, JobStore, StoreError, TakeError};

/// Control entry carrying the return-job id. Always the first archive entry.
pub const JOB_ID_FILE: &str = "id.txt";
/// Control entry carrying the user-supplied sign arguments.
pub const SIGN_ARGS_FILE: &str = "args.txt";
/// Control entry carrying the user-chosen bundle identifier.
pub const USER_BUNDLE_ID_FILE: &str = "user_bundle_id.txt";
/// Unsigned artifact as materialized in the sandbox.
pub const UNSIGNED_FILE: &str = "unsigned.ipa";
/// Signed artifact written by the entrypoint.
pub const SIGNED_FILE: &str = "signed.ipa";
/// Optional bundle id written by the entrypoint.
pub const BUNDLE_ID_FILE: &str = "bundle_id.txt";
