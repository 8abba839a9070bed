//! Error module
//!
//! Defines the error type shared by the tracer engine, the trace store, the
//! broker adapter and the headless driver. Every variant belongs to one
//! [`ErrorKind`], which is what callers branch on (the driver maps kinds to
//! exit codes).

use std::path::PathBuf;
use thiserror::Error;

/// Coarse classification of a [`TracerError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or malformed arguments, unknown profile, invalid filters.
    Config,
    /// Secret store lookup failed.
    Auth,
    /// Broker dial, handshake or TLS failure.
    Connect,
    /// A single filter could not be subscribed.
    Subscribe,
    /// Trace store open/read/write failure.
    Store,
    /// Lifecycle misuse, e.g. starting a tracer twice.
    State,
}

/// The main error type for the tracer.
#[derive(Error, Debug)]
pub enum TracerError {
    /// Invalid configuration or command-line input.
    #[error("{0}")]
    Config(String),

    /// Password could not be resolved from the OS secret store.
    #[error("{0}")]
    Auth(String),

    /// MQTT v3.1.1 connection error from rumqttc.
    ///
    /// Boxed because `rumqttc::ConnectionError` is large.
    #[error("MQTT connection error: {0}")]
    Connection(#[source] Box<rumqttc::ConnectionError>),

    /// MQTT v5 connection error from rumqttc.
    #[error("MQTT v5 connection error: {0}")]
    V5Connection(#[source] Box<rumqttc::v5::ConnectionError>),

    /// Connection could not be established for a reason rumqttc does not
    /// report itself (timeouts, refused CONNACK, unsupported scheme).
    #[error("{0}")]
    Connect(String),

    /// TLS material could not be loaded.
    #[error("TLS configuration error: {0}")]
    Tls(String),

    /// The broker client rejected a subscribe or unsubscribe request.
    #[error("subscribe {filter}: {reason}")]
    Subscribe { filter: String, reason: String },

    /// Embedded key-value store failure.
    #[error("trace store error: {0}")]
    Store(#[from] redb::Error),

    /// Another handle currently owns the trace store for writing.
    #[error("trace store busy: {}", .0.display())]
    StoreBusy(PathBuf),

    /// A stored record could not be encoded or decoded.
    #[error("trace record encoding error: {0}")]
    Json(#[from] serde_json::Error),

    /// General I/O error (directories, lock files, config file).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The user config file is not valid TOML for the expected layout.
    #[error("config file error: {0}")]
    Toml(#[from] toml::de::Error),

    /// The user config file could not be re-encoded.
    #[error("config file encoding error: {0}")]
    TomlEncode(#[from] toml::ser::Error),

    /// Lifecycle misuse.
    #[error("{0}")]
    State(String),
}

impl TracerError {
    /// Returns the classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TracerError::Config(_) | TracerError::Toml(_) | TracerError::TomlEncode(_) => {
                ErrorKind::Config
            }
            TracerError::Auth(_) => ErrorKind::Auth,
            TracerError::Connection(_)
            | TracerError::V5Connection(_)
            | TracerError::Connect(_)
            | TracerError::Tls(_) => ErrorKind::Connect,
            TracerError::Subscribe { .. } => ErrorKind::Subscribe,
            TracerError::Store(_)
            | TracerError::StoreBusy(_)
            | TracerError::Json(_)
            | TracerError::Io(_) => ErrorKind::Store,
            TracerError::State(_) => ErrorKind::State,
        }
    }

    /// True when the store was held open by someone else; callers may retry.
    pub fn is_busy(&self) -> bool {
        matches!(self, TracerError::StoreBusy(_))
    }
}

impl From<rumqttc::ConnectionError> for TracerError {
    fn from(err: rumqttc::ConnectionError) -> Self {
        TracerError::Connection(Box::new(err))
    }
}

impl From<rumqttc::v5::ConnectionError> for TracerError {
    fn from(err: rumqttc::v5::ConnectionError) -> Self {
        TracerError::V5Connection(Box::new(err))
    }
}

// redb splits its errors per operation; funnel them all into `Store`.
impl From<redb::DatabaseError> for TracerError {
    fn from(err: redb::DatabaseError) -> Self {
        TracerError::Store(err.into())
    }
}

impl From<redb::TransactionError> for TracerError {
    fn from(err: redb::TransactionError) -> Self {
        TracerError::Store(err.into())
    }
}

impl From<redb::TableError> for TracerError {
    fn from(err: redb::TableError) -> Self {
        TracerError::Store(err.into())
    }
}

impl From<redb::StorageError> for TracerError {
    fn from(err: redb::StorageError) -> Self {
        TracerError::Store(err.into())
    }
}

impl From<redb::CommitError> for TracerError {
    fn from(err: redb::CommitError) -> Self {
        TracerError::Store(err.into())
    }
}
