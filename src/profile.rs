//! Broker profiles
//!
//! Profiles live in the user config file (`~/.emqutiti/config.toml`) as
//! `[[profiles]]` entries next to a `default_profile` name:
//!
//! ```toml
//! default_profile = "local"
//!
//! [[profiles]]
//! name = "local"
//! schema = "tcp"
//! host = "localhost"
//! port = 1883
//! password = "keyring:emqutiti/local"
//! ```
//!
//! Loading resolves secrets: profiles with `from_env = true` read every field
//! from `EMQUTITI_<NAME>_<FIELD>` variables, the rest may reference the OS
//! secret store with a `keyring:<service>/<user>` password.

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::TracerError;
use crate::paths;

/// Prefix marking a password as a secret store reference.
pub const KEYRING_PREFIX: &str = "keyring:";

/// Variable overriding the password of profiles not sourced from the
/// environment.
pub const PASSWORD_ENV: &str = "MQTT_PASSWORD";

const ENV_PREFIX: &str = "EMQUTITI_";

/// A broker connection profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    pub name: String,
    /// `tcp`, `mqtt`, `ssl`, `tls` or `mqtts`.
    pub schema: String,
    pub host: String,
    pub port: u32,
    pub client_id: String,
    /// Append a unique suffix to `client_id` on every connect.
    pub random_id_suffix: bool,
    pub username: String,
    pub password: String,
    pub from_env: bool,
    #[serde(rename = "ssl_tls")]
    pub ssl: bool,
    pub skip_tls_verify: bool,
    pub mqtt_version: String,
    /// Seconds; 0 selects the client default.
    pub connect_timeout: u64,
    /// Seconds; 0 selects the client default.
    pub keep_alive: u64,
    pub auto_reconnect: bool,
    /// Seconds between reconnect attempts.
    pub reconnect_period: u64,
    pub clean_start: bool,
    pub session_expiry_interval: u32,
    pub maximum_packet_size: u32,
    pub last_will_enabled: bool,
    pub last_will_topic: String,
    pub last_will_qos: u8,
    pub last_will_retain: bool,
    pub last_will_payload: String,
}

/// Profile section of the user config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub default_profile: String,
    pub profiles: Vec<Profile>,
}

impl Config {
    /// Pick a profile: `name` if given, else `default_profile`, else the
    /// first profile.
    pub fn select(&self, name: Option<&str>) -> Result<&Profile, TracerError> {
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            return self
                .profiles
                .iter()
                .find(|p| p.name == name)
                .ok_or_else(|| TracerError::Config(format!("unknown profile '{}'", name)));
        }
        if !self.default_profile.is_empty() {
            if let Some(p) = self.profiles.iter().find(|p| p.name == self.default_profile) {
                return Ok(p);
            }
        }
        self.profiles
            .first()
            .ok_or_else(|| TracerError::Config("no connection profile available".to_string()))
    }
}

/// Read and decode the config file; `None` means the default location.
///
/// Secrets are not resolved; see [`load_profile`].
pub fn load_config(file: Option<&Path>) -> Result<Config, TracerError> {
    let path: PathBuf = file.map_or_else(paths::config_file, Path::to_path_buf);
    let text = fs::read_to_string(&path).map_err(|e| {
        TracerError::Config(format!("cannot read config file {}: {}", path.display(), e))
    })?;
    Ok(toml::from_str(&text)?)
}

/// Load one profile with its secrets resolved.
///
/// # Errors
///
/// Config errors for an unreadable file or unknown profile; an Auth error
/// when a keyring reference cannot be resolved.
pub fn load_profile(name: Option<&str>, file: Option<&Path>) -> Result<Profile, TracerError> {
    let config = load_config(file)?;
    let mut profile = config.select(name)?.clone();
    resolve_password(&mut profile)?;
    debug!(profile = %profile.name, host = %profile.host, "profile loaded");
    Ok(profile)
}

/// Resolve the password source of `profile`: environment fields for
/// `from_env` profiles, otherwise a keyring reference if present.
pub fn resolve_password(profile: &mut Profile) -> Result<(), TracerError> {
    if profile.from_env {
        apply_env_vars(profile, |var| env::var(var).ok());
        return Ok(());
    }
    if profile.password.starts_with(KEYRING_PREFIX) {
        profile.password = retrieve_password_from_keyring(&profile.password)?;
    }
    Ok(())
}

/// Apply `MQTT_PASSWORD` (read through `lookup`) unless the profile is
/// sourced from the environment.
pub fn override_password(profile: &mut Profile, lookup: impl Fn(&str) -> Option<String>) {
    if profile.from_env {
        return;
    }
    if let Some(password) = lookup(PASSWORD_ENV).filter(|p| !p.is_empty()) {
        debug!(profile = %profile.name, "password taken from {}", PASSWORD_ENV);
        profile.password = password;
    }
}

/// Environment variable prefix of a profile: `EMQUTITI_<NAME>_` with the name
/// upper-cased and every non-alphanumeric character replaced by `_`.
pub fn env_prefix(name: &str) -> String {
    let sanitized: String = name
        .to_ascii_uppercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{}{}_", ENV_PREFIX, sanitized)
}

/// Overwrite profile fields from `EMQUTITI_<NAME>_<FIELD>` variables.
///
/// Variables that are absent or fail to parse leave the field unchanged.
pub fn apply_env_vars(profile: &mut Profile, lookup: impl Fn(&str) -> Option<String>) {
    let prefix = env_prefix(&profile.name);
    let var = |field: &str| lookup(&format!("{}{}", prefix, field.to_ascii_uppercase()));

    let text = |field: &str, slot: &mut String| {
        if let Some(v) = var(field) {
            *slot = v;
        }
    };
    text("schema", &mut profile.schema);
    text("host", &mut profile.host);
    text("client_id", &mut profile.client_id);
    text("username", &mut profile.username);
    text("password", &mut profile.password);
    text("mqtt_version", &mut profile.mqtt_version);
    text("last_will_topic", &mut profile.last_will_topic);
    text("last_will_payload", &mut profile.last_will_payload);

    let flag = |field: &str, slot: &mut bool| {
        if let Some(v) = var(field).and_then(|v| parse_bool(&v)) {
            *slot = v;
        }
    };
    flag("random_id_suffix", &mut profile.random_id_suffix);
    flag("ssl_tls", &mut profile.ssl);
    flag("skip_tls_verify", &mut profile.skip_tls_verify);
    flag("auto_reconnect", &mut profile.auto_reconnect);
    flag("clean_start", &mut profile.clean_start);
    flag("last_will_enabled", &mut profile.last_will_enabled);
    flag("last_will_retain", &mut profile.last_will_retain);

    fn number<T: std::str::FromStr>(value: Option<String>, slot: &mut T) {
        if let Some(v) = value.and_then(|v| v.trim().parse().ok()) {
            *slot = v;
        }
    }
    number(var("port"), &mut profile.port);
    number(var("connect_timeout"), &mut profile.connect_timeout);
    number(var("keep_alive"), &mut profile.keep_alive);
    number(var("reconnect_period"), &mut profile.reconnect_period);
    number(var("session_expiry_interval"), &mut profile.session_expiry_interval);
    number(var("maximum_packet_size"), &mut profile.maximum_packet_size);
    number(var("last_will_qos"), &mut profile.last_will_qos);
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim() {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

/// Split a `keyring:<service>/<user>` reference.
pub fn parse_keyring_reference(reference: &str) -> Result<(&str, &str), TracerError> {
    let rest = reference.strip_prefix(KEYRING_PREFIX).ok_or_else(|| {
        TracerError::Auth("password does not reference the keyring".to_string())
    })?;
    match rest.split_once('/') {
        Some((service, user)) if !service.is_empty() && !user.is_empty() => Ok((service, user)),
        _ => Err(TracerError::Auth(format!(
            "invalid keyring reference '{}': expected keyring:<service>/<user>",
            reference
        ))),
    }
}

/// Look up the password a `keyring:<service>/<user>` reference points to.
pub fn retrieve_password_from_keyring(reference: &str) -> Result<String, TracerError> {
    let (service, user) = parse_keyring_reference(reference)?;
    keyring::Entry::new(service, user)
        .and_then(|entry| entry.get_password())
        .map_err(|e| {
            TracerError::Auth(format!(
                "failed to retrieve password from keyring for {}/{}: {}",
                service, user, e
            ))
        })
}
