//! Trace store
//!
//! Durable storage of trace records in an embedded `redb` database, one
//! database per profile at `<root>/<profile>/traces/traces.redb`.
//!
//! # Key layout
//!
//! Records are keyed `trace/<key>/<topic>/<nanos>` with the reception time as
//! 20-digit zero-padded decimal nanoseconds, so byte order equals
//! chronological order within one `(key, topic)` and a prefix scan over
//! `trace/<key>/` returns every record of a trace.
//!
//! # Access
//!
//! The database is opened and closed around every operation; no handle is
//! kept between calls. `redb` holds an exclusive file lock while open, so a
//! concurrent opener sees the store as busy. Opens retry for a short while
//! before surfacing [`TracerError::StoreBusy`].

use redb::{Database, DatabaseError, ReadableTable, TableDefinition, TableError};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::debug;

use crate::error::TracerError;
use crate::message::TraceMessage;
use crate::paths;
use crate::topics::TopicFilter;

const TRACES: TableDefinition<&str, &[u8]> = TableDefinition::new("traces");

const DB_FILE: &str = "traces.redb";

/// How many times an open is attempted while another handle holds the store.
const OPEN_ATTEMPTS: u32 = 50;

/// Pause between busy open attempts.
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Store key of a single record.
pub fn record_key(key: &str, topic: &str, nanos: u64) -> String {
    format!("trace/{}/{}/{:020}", key, topic, nanos)
}

/// Prefix shared by every record of trace `key`.
pub fn key_prefix(key: &str) -> String {
    format!("trace/{}/", key)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    ReadWrite,
    ReadOnly,
}

/// Handle to the per-profile trace databases below a data root.
///
/// Cheap to clone; holds no open database.
#[derive(Debug, Clone)]
pub struct TraceStore {
    root: PathBuf,
}

impl Default for TraceStore {
    /// Store rooted at `<home>/.emqutiti/data`.
    fn default() -> Self {
        Self::new(paths::data_root())
    }
}

impl TraceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the database file for `profile`.
    pub fn db_path(&self, profile: &str) -> PathBuf {
        paths::traces_dir(&self.root, profile).join(DB_FILE)
    }

    /// Persist `msg` under trace `key` in a single write transaction.
    pub fn add(&self, profile: &str, key: &str, msg: &TraceMessage) -> Result<(), TracerError> {
        let value = serde_json::to_vec(msg)?;
        let store_key = record_key(key, &msg.topic, msg.timestamp_nanos());

        let db = self.open_writable(profile)?;
        let txn = db.begin_write()?;
        {
            let mut table = txn.open_table(TRACES)?;
            table.insert(store_key.as_str(), value.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// All records of trace `key` in store-key order: chronological per
    /// topic, topics in lexicographic order.
    ///
    /// A record that fails to decode aborts the scan; nothing is returned.
    pub fn messages(&self, profile: &str, key: &str) -> Result<Vec<TraceMessage>, TracerError> {
        self.scan(profile, key, |_, value| Ok(serde_json::from_slice(value)?))
    }

    /// Raw store keys of trace `key`.
    pub fn keys(&self, profile: &str, key: &str) -> Result<Vec<String>, TracerError> {
        self.scan(profile, key, |store_key, _| Ok(store_key.to_string()))
    }

    /// Remove every record of trace `key` in one write transaction.
    pub fn delete(&self, profile: &str, key: &str) -> Result<(), TracerError> {
        if !self.db_path(profile).exists() {
            return Ok(());
        }
        let prefix = key_prefix(key);

        let db = self.open_writable(profile)?;
        let txn = db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(TRACES)?;
            let mut doomed = Vec::new();
            for entry in table.range::<&str>(prefix.as_str()..)? {
                let (store_key, _) = entry?;
                let store_key = store_key.value();
                if !store_key.starts_with(&prefix) {
                    break;
                }
                doomed.push(store_key.to_string());
            }
            for store_key in &doomed {
                table.remove(store_key.as_str())?;
            }
            doomed.len()
        };
        txn.commit()?;
        debug!(profile, key, removed, "deleted trace records");
        Ok(())
    }

    /// True iff trace `key` has at least one stored record.
    pub fn has_data(&self, profile: &str, key: &str) -> Result<bool, TracerError> {
        Ok(!self.keys(profile, key)?.is_empty())
    }

    /// Remove all data of trace `key`. Same as [`TraceStore::delete`].
    pub fn clear_data(&self, profile: &str, key: &str) -> Result<(), TracerError> {
        self.delete(profile, key)
    }

    /// Rebuild per-filter counters from the stored records of trace `key`.
    pub fn load_counts(
        &self,
        profile: &str,
        key: &str,
        filters: &TopicFilter,
    ) -> Result<HashMap<String, u64>, TracerError> {
        let mut counts: HashMap<String, u64> =
            filters.topics().iter().map(|f| (f.clone(), 0)).collect();
        for msg in self.messages(profile, key)? {
            for filter in filters.matching(&msg.topic) {
                if let Some(count) = counts.get_mut(filter) {
                    *count += 1;
                }
            }
        }
        Ok(counts)
    }

    fn scan<T>(
        &self,
        profile: &str,
        key: &str,
        mut visit: impl FnMut(&str, &[u8]) -> Result<T, TracerError>,
    ) -> Result<Vec<T>, TracerError> {
        let Some(db) = self.open_readable(profile)? else {
            return Ok(Vec::new());
        };
        let txn = db.begin_read()?;
        let table = match txn.open_table(TRACES) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let prefix = key_prefix(key);
        let mut out = Vec::new();
        for entry in table.range::<&str>(prefix.as_str()..)? {
            let (store_key, value) = entry?;
            let store_key = store_key.value();
            if !store_key.starts_with(&prefix) {
                break;
            }
            out.push(visit(store_key, value.value())?);
        }
        Ok(out)
    }

    fn open_writable(&self, profile: &str) -> Result<Database, TracerError> {
        fs::create_dir_all(paths::traces_dir(&self.root, profile))?;
        self.open(profile, Access::ReadWrite)
    }

    /// `None` when the profile has never been written to.
    fn open_readable(&self, profile: &str) -> Result<Option<Database>, TracerError> {
        if !self.db_path(profile).exists() {
            return Ok(None);
        }
        self.open(profile, Access::ReadOnly).map(Some)
    }

    fn open(&self, profile: &str, access: Access) -> Result<Database, TracerError> {
        let path = self.db_path(profile);
        let mut attempt = 1;
        loop {
            let result = match access {
                Access::ReadWrite => Database::create(&path),
                Access::ReadOnly => Database::open(&path),
            };
            match result {
                Ok(db) => return Ok(db),
                Err(DatabaseError::DatabaseAlreadyOpen) if attempt < OPEN_ATTEMPTS => {
                    attempt += 1;
                    thread::sleep(OPEN_RETRY_DELAY);
                }
                Err(DatabaseError::DatabaseAlreadyOpen) => {
                    return Err(TracerError::StoreBusy(path));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
