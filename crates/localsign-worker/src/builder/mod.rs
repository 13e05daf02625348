//! Builder trigger protocol.
//!
//! A builder accepts the secrets its worker needs, can be triggered to look
//! for queued work, and reports how long one job may take. Only the
//! integrated builder exists today; `AnyBuilder` is the dispatch point for
//! further variants.

mod integrated;

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

pub use integrated::{Integrated, IntegratedConfig, ProcessFn, WorkerState};

/// Secret holding the shared builder key.
pub const SECRET_KEY: &str = "SECRET_KEY";
/// Secret holding the URL the entrypoint may call back into.
pub const SECRET_URL: &str = "SECRET_URL";

pub type BuilderSecrets = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum BuilderError {
    #[error("builder {0} already has different secrets")]
    SecretsConflict(String),

    #[error("failed to start worker thread: {0}")]
    WorkerSpawn(#[source] io::Error),
}

pub trait Builder: Send + Sync {
    fn name(&self) -> &str;

    /// Install the secrets map. Secrets are immutable once set; repeating an
    /// identical map is accepted.
    fn set_secrets(&self, secrets: BuilderSecrets) -> Result<(), BuilderError>;

    /// Ask the worker to look for queued work at least once more.
    fn trigger(&self) -> Result<(), BuilderError>;

    fn job_timeout(&self) -> Duration;
}

#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum AnyBuilder {
    Integrated(Arc<Integrated>),
}

impl AnyBuilder {
    pub fn as_integrated(&self) -> Option<&Arc<Integrated>> {
        match self {
            AnyBuilder::Integrated(builder) => Some(builder),
        }
    }

    fn inner(&self) -> &dyn Builder {
        match self {
            AnyBuilder::Integrated(builder) => builder.as_ref(),
        }
    }
}

impl From<Integrated> for AnyBuilder {
    fn from(builder: Integrated) -> Self {
        AnyBuilder::Integrated(Arc::new(builder))
    }
}

impl Builder for AnyBuilder {
    fn name(&self) -> &str {
        self.inner().name()
    }

    fn set_secrets(&self, secrets: BuilderSecrets) -> Result<(), BuilderError> {
        self.inner().set_secrets(secrets)
    }

    fn trigger(&self) -> Result<(), BuilderError> {
        self.inner().trigger()
    }

    fn job_timeout(&self) -> Duration {
        self.inner().job_timeout()
    }
}
