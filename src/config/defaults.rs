//! Built-in defaults (layer 1)

use serde_json::Value;

pub const DEFAULT_CONFIG_FILE: &str = "localsign.toml";
pub const DEFAULT_SERVER_URL: &str = "http://localhost:8080";
pub const DEFAULT_SAVE_DIR: &str = "data";
pub const DEFAULT_SIGN_FILES_DIR: &str = "./builder";
pub const DEFAULT_ENTRYPOINT: &str = "sign.py";
pub const DEFAULT_JOB_TIMEOUT_MINS: u64 = 15;

/// Built-in configuration as the base merge layer.
///
/// `builder_key` has no default; a missing key is generated and persisted
/// on load.
pub fn builtin_layer() -> Value {
    serde_json::json!({
        "server_url": DEFAULT_SERVER_URL,
        "save_dir": DEFAULT_SAVE_DIR,
        "builder": {
            "integrated": {
                "enable": true,
                "sign_files_dir": DEFAULT_SIGN_FILES_DIR,
                "entrypoint": DEFAULT_ENTRYPOINT,
                "job_timeout_mins": DEFAULT_JOB_TIMEOUT_MINS
            }
        }
    })
}
