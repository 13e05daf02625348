//! Return jobs and the two-factor relay.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};

/// Single-assignment slot for an interactively supplied two-factor code.
///
/// The first non-empty `set` wins; later calls leave the stored code
/// untouched. Reads never block once the code is present.
#[derive(Debug, Default)]
pub struct TwoFactorRelay {
    code: OnceLock<String>,
}

impl TwoFactorRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `code` (trimmed). Returns `true` if this call stored it.
    ///
    /// Blank input is ignored so an accidental empty line does not consume
    /// the only write.
    pub fn set(&self, code: &str) -> bool {
        let code = code.trim();
        if code.is_empty() {
            return false;
        }
        self.code.set(code.to_string()).is_ok()
    }

    pub fn get(&self) -> Option<&str> {
        self.code.get().map(String::as_str)
    }

    pub fn is_set(&self) -> bool {
        self.code.get().is_some()
    }
}

/// A job that has been handed to a worker and is awaiting its result.
///
/// Exactly one return job exists per application while it is being signed.
/// It is deleted once the worker has stored the signed artifact or given up.
#[derive(Debug)]
pub struct ReturnJob {
    id: String,
    app_id: String,
    profile_id: String,
    created_at: DateTime<Utc>,
    two_factor: TwoFactorRelay,
}

impl ReturnJob {
    pub fn new(id: impl Into<String>, app_id: impl Into<String>, profile_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            app_id: app_id.into(),
            profile_id: profile_id.into(),
            created_at: Utc::now(),
            two_factor: TwoFactorRelay::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn profile_id(&self) -> &str {
        &self.profile_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn two_factor(&self) -> &TwoFactorRelay {
        &self.two_factor
    }
}
