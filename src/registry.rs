//! Persisted trace definitions.
//!
//! Started traces are remembered in the `[traces]` table of the user config
//! file, keyed by trace key:
//!
//! ```toml
//! [traces.nightly]
//! profile = "lab"
//! topics = ["sensors/#"]
//! start = "2024-01-15T22:00:00Z"
//! end = "2024-01-16T06:00:00Z"
//! ```
//!
//! Every other table in the file is preserved on save.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::TracerError;
use crate::lock::ProcessLock;
use crate::paths;
use crate::tracer::TraceConfig;

const TRACES_TABLE: &str = "traces";

/// Attempts at taking the process lock before an update gives up.
const LOCK_ATTEMPTS: u32 = 50;

const LOCK_RETRY_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedTrace {
    #[serde(default)]
    profile: String,
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    start: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    end: String,
}

#[derive(Debug, Default, Deserialize)]
struct TracesSection {
    #[serde(default)]
    traces: BTreeMap<String, PersistedTrace>,
}

/// The `[traces]` table of one config file.
///
/// Updates are read-modify-write cycles on the whole file and run under the
/// advisory process lock.
#[derive(Debug, Clone)]
pub struct TraceRegistry {
    path: PathBuf,
    lock_path: PathBuf,
}

impl Default for TraceRegistry {
    fn default() -> Self {
        Self::new(paths::config_file())
    }
}

impl TraceRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_path: paths::lock_file(),
        }
    }

    /// Use `lock_path` instead of the shared lock file.
    pub fn with_lock_path(mut self, lock_path: impl Into<PathBuf>) -> Self {
        self.lock_path = lock_path.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All stored trace definitions. A missing file holds none.
    ///
    /// An unset or unparsable start loads as the Unix epoch (start
    /// immediately); an unset or unparsable end loads as open-ended.
    pub fn load(&self) -> Result<BTreeMap<String, TraceConfig>, TracerError> {
        let Some(text) = self.read()? else {
            return Ok(BTreeMap::new());
        };
        let section: TracesSection = toml::from_str(&text)?;

        Ok(section
            .traces
            .into_iter()
            .map(|(key, t)| {
                let start = stored_time(&key, "start", &t.start)
                    .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
                let end = stored_time(&key, "end", &t.end);
                let config = TraceConfig {
                    profile: t.profile,
                    topics: t.topics,
                    start,
                    end,
                    key: key.clone(),
                };
                (key, config)
            })
            .collect())
    }

    /// Insert or replace the definition of `config.key`.
    pub fn add(&self, config: &TraceConfig) -> Result<(), TracerError> {
        let _lock = self.lock()?;
        let mut traces = self.load()?;
        traces.insert(config.key.clone(), config.clone());
        self.save(&traces)
    }

    /// Forget trace `key`. Unknown keys are ignored.
    pub fn remove(&self, key: &str) -> Result<(), TracerError> {
        let _lock = self.lock()?;
        let mut traces = self.load()?;
        if traces.remove(key).is_some() {
            self.save(&traces)?;
        }
        Ok(())
    }

    /// Replace the `[traces]` table with `traces`, keeping the rest of the
    /// file.
    pub fn save(&self, traces: &BTreeMap<String, TraceConfig>) -> Result<(), TracerError> {
        let mut document: toml::Table = match self.read()? {
            Some(text) => toml::from_str(&text)?,
            None => toml::Table::new(),
        };

        let mut table = toml::Table::new();
        for (key, config) in traces {
            let persisted = PersistedTrace {
                profile: config.profile.clone(),
                topics: config.topics.clone(),
                start: if config.start == DateTime::<Utc>::UNIX_EPOCH {
                    String::new()
                } else {
                    format_time(config.start)
                },
                end: config.end.map(format_time).unwrap_or_default(),
            };
            table.insert(key.clone(), toml::Value::try_from(persisted)?);
        }
        document.insert(TRACES_TABLE.to_string(), toml::Value::Table(table));

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, toml::to_string(&document)?)?;
        debug!(path = %self.path.display(), traces = traces.len(), "saved trace definitions");
        Ok(())
    }

    fn lock(&self) -> Result<ProcessLock, TracerError> {
        let mut attempt = 1;
        loop {
            match ProcessLock::acquire(&self.lock_path) {
                Err(TracerError::Io(e))
                    if e.kind() == ErrorKind::WouldBlock && attempt < LOCK_ATTEMPTS =>
                {
                    attempt += 1;
                    thread::sleep(LOCK_RETRY_DELAY);
                }
                result => return result,
            }
        }
    }

    fn read(&self) -> Result<Option<String>, TracerError> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn format_time(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn stored_time(key: &str, field: &str, value: &str) -> Option<DateTime<Utc>> {
    if value.is_empty() {
        return None;
    }
    match DateTime::parse_from_rfc3339(value) {
        Ok(ts) => Some(ts.with_timezone(&Utc)),
        Err(e) => {
            warn!(key, field, value, error = %e, "invalid stored trace time, ignoring");
            None
        }
    }
}
