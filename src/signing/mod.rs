//! Signing service: wires storage, builders and the wait loop together.
//!
//! A request creates an application, queues a sign job for it, wakes the
//! builder and blocks in [`WaitLoop`] until the job's queue entry is gone.

mod prompt;
mod wait;

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use localsign_protocol::store::{APP_PROFILE_ID, APP_SIGNED, APP_SIGN_ARGS, APP_USER_BUNDLE_ID};
use localsign_protocol::{App, StoreError};
use localsign_worker::{process_integrated_job, AnyBuilder, Builder, BuilderError, Integrated};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::Config;
use crate::storage::{FsApp, JobQueue, NewApp, ProfileError, QueueError, SignJob, Storage};

pub use prompt::{prompt_two_factor, relay_code, PromptError};
pub use wait::{
    WaitConfig, WaitError, WaitLoop, WaitReport, DEFAULT_POLL_INTERVAL, DEFAULT_TWO_FACTOR_CHECK,
    DEFAULT_TWO_FACTOR_GRACE,
};

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("profile not found: {0}")]
    ProfileNotFound(String),

    #[error("profile: {0}")]
    Profile(#[source] ProfileError),

    #[error("builder not found: {0}")]
    BuilderNotFound(String),

    #[error("no builder configured")]
    NoBuilder,

    #[error("only the integrated builder is supported for synchronous signing: {0}")]
    UnsupportedBuilder(String),

    #[error(transparent)]
    Builder(#[from] BuilderError),

    #[error("open {path}: {source}")]
    OpenInput {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("app store: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("signing failed: {0}")]
    Wait(#[from] WaitError),

    #[error("signing completed but signed file not found")]
    SignedMissing,

    #[error("write {path}: {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl From<ProfileError> for SigningError {
    fn from(e: ProfileError) -> Self {
        match e {
            ProfileError::NotFound(name) => SigningError::ProfileNotFound(name),
            other => SigningError::Profile(other),
        }
    }
}

/// Options for signing a local `.ipa` file.
#[derive(Debug, Clone, Default)]
pub struct CliSigningOptions {
    pub ipa: PathBuf,
    pub profile: String,
    pub output: PathBuf,
    pub sign_args: String,
    pub user_bundle_id: String,
    /// Builder id; the first configured builder when `None`.
    pub builder_id: Option<String>,
    /// Ask for a two-factor code on the terminal while the job runs.
    pub prompt_two_factor: bool,
}

pub struct SigningService {
    config: Config,
    storage: Storage,
    builders: BTreeMap<String, AnyBuilder>,
    wait_config: Option<WaitConfig>,
}

impl std::fmt::Debug for SigningService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningService")
            .field("save_dir", &self.config.save_dir)
            .field("builders", &self.builders.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SigningService {
    /// Open storage under `config.save_dir` and create the enabled builders
    /// with their secrets.
    pub fn new(config: Config) -> Result<Self, SigningError> {
        let storage = Storage::open(&config)?;
        let builders = config.make_builders();
        let secrets = config.builder_secrets();
        for builder in builders.values() {
            builder.set_secrets(secrets.clone())?;
        }

        Ok(Self {
            config,
            storage,
            builders,
            wait_config: None,
        })
    }

    /// Override wait loop timings. The deadline otherwise follows the
    /// builder's job timeout.
    pub fn with_wait_config(mut self, wait_config: WaitConfig) -> Self {
        self.wait_config = Some(wait_config);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.storage.jobs
    }

    /// Look up a builder by id, or the first configured one.
    pub fn builder(&self, id: Option<&str>) -> Result<&AnyBuilder, SigningError> {
        match id.filter(|id| !id.is_empty()) {
            Some(id) => self
                .builders
                .get(id)
                .ok_or_else(|| SigningError::BuilderNotFound(id.to_string())),
            None => self.builders.values().next().ok_or(SigningError::NoBuilder),
        }
    }

    /// Install the integrated job body on `builder`. Repeated calls are
    /// no-ops.
    pub fn install_worker(&self, builder: &AnyBuilder) -> Result<(), SigningError> {
        let integrated = builder
            .as_integrated()
            .ok_or_else(|| SigningError::UnsupportedBuilder(builder.name().to_string()))?;

        let jobs = Arc::clone(&self.storage.jobs);
        let apps = Arc::clone(&self.storage.apps);
        integrated.set_process_fn(Box::new(move |builder: &Integrated| {
            process_integrated_job(builder, &*jobs, &*apps)
        }))?;
        Ok(())
    }

    fn wait_loop(&self, builder: &AnyBuilder) -> WaitLoop {
        let config = self
            .wait_config
            .unwrap_or_else(|| WaitConfig::with_deadline(builder.job_timeout()));
        WaitLoop::new(Arc::clone(&self.storage.jobs), config)
    }

    /// Queue a sign job for an existing application and wake its builder.
    pub fn submit(&self, app: &FsApp, builder: &AnyBuilder) -> Result<(), SigningError> {
        let profile_id = app.get_string(APP_PROFILE_ID)?;
        let profile = self.storage.profiles.get(&profile_id)?;
        let job = SignJob::new(app.id(), profile_id)
            .with_sign_args(app.get_string(APP_SIGN_ARGS).unwrap_or_default())
            .with_user_bundle_id(app.get_string(APP_USER_BUNDLE_ID).unwrap_or_default())
            .with_profile_files(profile.files()?);

        self.install_worker(builder)?;
        self.storage.jobs.enqueue(job)?;
        builder.trigger()?;
        Ok(())
    }

    /// Queue a sign job for an existing application and block until it is
    /// signed, has failed, or the builder's job timeout passes.
    pub fn sign_app_sync(&self, app: &FsApp, builder: &AnyBuilder) -> Result<(), SigningError> {
        self.submit(app, builder)?;
        self.wait_loop(builder).wait(app)?;
        Ok(())
    }

    /// Sign the `.ipa` at `options.ipa` and copy the result to
    /// `options.output`. Returns the application id.
    pub fn sign_file(&self, options: &CliSigningOptions) -> Result<String, SigningError> {
        self.storage.profiles.get(&options.profile)?;
        let builder = self.builder(options.builder_id.as_deref())?;

        let mut ipa = File::open(&options.ipa).map_err(|source| SigningError::OpenInput {
            path: options.ipa.clone(),
            source,
        })?;
        let file_name = options
            .ipa
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let app = self.storage.apps.create(
            &NewApp {
                file_name,
                profile_id: options.profile.clone(),
                sign_args: options.sign_args.clone(),
                user_bundle_id: options.user_bundle_id.clone(),
                builder_id: builder.name().to_string(),
            },
            &mut ipa,
        )?;
        info!(app_id = %app.id(), builder = builder.name(), profile = %options.profile, "signing app");

        self.submit(&app, builder)?;
        if options.prompt_two_factor {
            self.spawn_prompt(app.id(), builder);
        }
        self.wait_loop(builder).wait(&*app)?;

        if !app.is_signed()? {
            return Err(SigningError::SignedMissing);
        }
        let mut signed = app.get_file(APP_SIGNED)?;
        copy_to_output(&mut signed, &options.output)?;

        info!(app_id = %app.id(), output = %options.output.display(), "signed app written");
        Ok(app.id().to_string())
    }

    fn spawn_prompt(&self, app_id: &str, builder: &AnyBuilder) {
        let queue = Arc::clone(&self.storage.jobs);
        let app_id = app_id.to_string();
        let deadline = builder.job_timeout();

        let spawned = thread::Builder::new()
            .name("localsign-2fa-prompt".to_string())
            .spawn(move || {
                let stdin = io::stdin().lock();
                if let Err(e) = prompt_two_factor(stdin, io::stdout(), &queue, &app_id, deadline) {
                    warn!(%app_id, error = %e, "2FA prompt failed");
                }
            });
        if let Err(e) = spawned {
            warn!(error = %e, "failed to start 2FA prompt");
        }
    }
}

fn copy_to_output(reader: &mut dyn Read, path: &Path) -> Result<(), SigningError> {
    let output_err = |source| SigningError::Output {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(output_err)?;
    }
    let mut file = File::create(path).map_err(output_err)?;
    io::copy(reader, &mut file).map_err(output_err)?;
    file.sync_all().map_err(output_err)?;
    Ok(())
}
