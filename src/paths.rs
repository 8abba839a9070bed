//! Filesystem locations.
//!
//! Everything the tracer persists lives under `<home>/.emqutiti`. Directories
//! are created on first write and never removed.

use std::path::{Path, PathBuf};

const APP_DIR: &str = ".emqutiti";
const CONFIG_FILE: &str = "config.toml";
const LOCK_FILE: &str = "emqutiti-tracer.lock";

/// Profile used when the caller does not name one.
pub const DEFAULT_PROFILE: &str = "default";

/// `<home>/.emqutiti`, or `./.emqutiti` when no home directory is known.
pub fn app_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// Root under which every profile keeps its data.
pub fn data_root() -> PathBuf {
    app_dir().join("data")
}

/// The user config file holding profiles and persisted traces.
pub fn config_file() -> PathBuf {
    app_dir().join(CONFIG_FILE)
}

/// Directory of the trace store for `profile` below `root`.
pub fn traces_dir(root: &Path, profile: &str) -> PathBuf {
    let profile = if profile.is_empty() {
        DEFAULT_PROFILE
    } else {
        profile
    };
    root.join(profile).join("traces")
}

/// Well-known advisory lock file in the OS temp directory.
pub fn lock_file() -> PathBuf {
    std::env::temp_dir().join(LOCK_FILE)
}
