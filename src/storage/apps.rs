//! Filesystem application store.
//!
//! Layout: `<apps>/<app_id>/<blob>` for blobs and `<apps>/<app_id>/<key>.txt`
//! for string metadata. Every write goes to a temp file in the app
//! directory and is renamed into place.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use localsign_protocol::store::{
    APP_BUILDER_ID, APP_FILE_NAME, APP_PROFILE_ID, APP_SIGNED, APP_SIGN_ARGS, APP_UNSIGNED,
    APP_USER_BUNDLE_ID,
};
use localsign_protocol::{App, AppStore, StoreError};
use tracing::debug;
use ulid::Ulid;

use super::is_valid_name;

const STRING_SUFFIX: &str = ".txt";

/// Metadata recorded when an application is created.
#[derive(Debug, Clone, Default)]
pub struct NewApp {
    pub file_name: String,
    pub profile_id: String,
    pub sign_args: String,
    pub user_bundle_id: String,
    pub builder_id: String,
}

#[derive(Debug)]
pub struct FsApp {
    id: String,
    dir: PathBuf,
}

impl FsApp {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn blob_path(&self, name: &str) -> Result<PathBuf, StoreError> {
        if !is_valid_name(name) {
            return Err(StoreError::InvalidName(name.to_string()));
        }
        Ok(self.dir.join(name))
    }

    fn string_path(&self, name: &str) -> Result<PathBuf, StoreError> {
        if !is_valid_name(name) {
            return Err(StoreError::InvalidName(name.to_string()));
        }
        Ok(self.dir.join(format!("{name}{STRING_SUFFIX}")))
    }

    /// Stream into a temp file next to `final_path`, then rename over it.
    fn write_atomic(&self, final_path: &Path, reader: &mut dyn Read) -> Result<u64, StoreError> {
        let file_name = final_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let temp_path = self.dir.join(format!(".{}.{}.tmp", file_name, Ulid::new()));

        let written = write_temp(&temp_path, reader);

        match written.and_then(|n| fs::rename(&temp_path, final_path).map(|()| n)) {
            Ok(n) => Ok(n),
            Err(e) => {
                let _ = fs::remove_file(&temp_path);
                Err(StoreError::Io(e))
            }
        }
    }
}

fn write_temp(path: &Path, reader: &mut dyn Read) -> io::Result<u64> {
    let mut file = File::create(path)?;
    let written = io::copy(reader, &mut file)?;
    file.flush()?;
    file.sync_all()?;
    Ok(written)
}

fn populate(app: &FsApp, new: &NewApp, unsigned: &mut dyn Read) -> Result<(), StoreError> {
    app.set_file(APP_UNSIGNED, unsigned)?;
    app.set_string(APP_FILE_NAME, &new.file_name)?;
    app.set_string(APP_PROFILE_ID, &new.profile_id)?;
    app.set_string(APP_SIGN_ARGS, &new.sign_args)?;
    app.set_string(APP_USER_BUNDLE_ID, &new.user_bundle_id)?;
    app.set_string(APP_BUILDER_ID, &new.builder_id)?;
    Ok(())
}

impl App for FsApp {
    fn id(&self) -> &str {
        &self.id
    }

    fn get_file(&self, name: &str) -> Result<Box<dyn Read + Send>, StoreError> {
        let path = self.blob_path(name)?;
        match File::open(&path) {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::MissingFile {
                app_id: self.id.clone(),
                name: name.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn set_file(&self, name: &str, reader: &mut dyn Read) -> Result<u64, StoreError> {
        let path = self.blob_path(name)?;
        let written = self.write_atomic(&path, reader)?;
        debug!(app_id = %self.id, name, bytes = written, "stored app file");
        Ok(written)
    }

    fn get_string(&self, name: &str) -> Result<String, StoreError> {
        let path = self.string_path(name)?;
        match fs::read_to_string(&path) {
            Ok(value) => Ok(value),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::MissingValue {
                app_id: self.id.clone(),
                name: name.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn set_string(&self, name: &str, value: &str) -> Result<(), StoreError> {
        let path = self.string_path(name)?;
        self.write_atomic(&path, &mut value.as_bytes())?;
        Ok(())
    }

    fn is_signed(&self) -> Result<bool, StoreError> {
        Ok(self.blob_path(APP_SIGNED)?.try_exists()?)
    }
}

#[derive(Debug, Clone)]
pub struct FsAppStore {
    root: PathBuf,
}

impl FsAppStore {
    /// Open (creating if needed) the store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create an application with a fresh ULID, its unsigned blob and its
    /// metadata.
    pub fn create(&self, new: &NewApp, unsigned: &mut dyn Read) -> Result<Arc<FsApp>, StoreError> {
        let id = Ulid::new().to_string();
        let dir = self.root.join(&id);
        fs::create_dir_all(&dir)?;
        let app = Arc::new(FsApp { id, dir });

        if let Err(e) = populate(&app, new, unsigned) {
            let _ = fs::remove_dir_all(&app.dir);
            return Err(e);
        }

        debug!(app_id = %app.id, "created app");
        Ok(app)
    }

    pub fn get_app(&self, app_id: &str) -> Option<Arc<FsApp>> {
        if !is_valid_name(app_id) {
            return None;
        }
        let dir = self.root.join(app_id);
        dir.is_dir().then(|| {
            Arc::new(FsApp {
                id: app_id.to_string(),
                dir,
            })
        })
    }

    /// Remove an application and all its files. Returns `false` if absent.
    pub fn delete(&self, app_id: &str) -> Result<bool, StoreError> {
        if !is_valid_name(app_id) {
            return Err(StoreError::InvalidName(app_id.to_string()));
        }
        match fs::remove_dir_all(self.root.join(app_id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

impl AppStore for FsAppStore {
    fn get(&self, app_id: &str) -> Option<Arc<dyn App>> {
        self.get_app(app_id).map(|app| app as Arc<dyn App>)
    }
}
