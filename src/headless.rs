//! Headless driver
//!
//! Runs one trace from the command line: resolve the broker profile, refuse
//! a key that already holds records or an end time in the past, connect,
//! start the tracer, then wait until the trace window closes or the user
//! interrupts, and report the per-filter counters.
//!
//! Failures before the tracer starts are returned as [`HeadlessError`]s
//! tagged with the phase they happened in. Once the tracer runs, errors are
//! only logged and the counters are still reported.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::env;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{ErrorKind, TracerError};
use crate::mqtt::{BrokerClient, MqttClientConfig, MqttTraceClient};
use crate::profile;
use crate::registry::TraceRegistry;
use crate::store::TraceStore;
use crate::topics::TopicFilter;
use crate::tracer::{TraceConfig, Tracer};
use crate::util;

/// How often the driver re-checks whether the trace is still active.
pub const TICK: Duration = Duration::from_millis(500);

/// Exit code for success, including interrupts and failures after start.
pub const EXIT_SUCCESS: u8 = 0;
/// Exit code for configuration/argument errors.
pub const EXIT_CONFIG_ERROR: u8 = 1;
/// Exit code for authentication/connection errors.
pub const EXIT_CONNECTION_ERROR: u8 = 2;
/// Exit code for trace store errors before the trace started.
pub const EXIT_STORE_ERROR: u8 = 3;
/// Exit code for any other failure before the trace started.
pub const EXIT_RUNTIME_ERROR: u8 = 4;

/// A parsed trace invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRequest {
    pub key: String,
    pub topics: Vec<String>,
    /// `None` selects the config file's default profile.
    pub profile: Option<String>,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    /// `None` selects `~/.emqutiti/config.toml`.
    pub config_file: Option<PathBuf>,
}

impl TraceRequest {
    /// Parse raw invocation values.
    ///
    /// `topics` is a comma-separated filter list. An absent `start` means
    /// now; an absent `end` means open-ended.
    pub fn parse(
        key: &str,
        topics: &str,
        start: Option<&str>,
        end: Option<&str>,
    ) -> Result<Self, TracerError> {
        let key = key.trim();
        if key.is_empty() || topics.trim().is_empty() {
            return Err(TracerError::Config(
                "--trace and --topics are required".to_string(),
            ));
        }
        let topics = TopicFilter::parse_list(topics)?.into_topics();
        let start = match start.filter(|s| !s.trim().is_empty()) {
            Some(s) => util::parse_rfc3339("start", s)?,
            None => Utc::now(),
        };
        let end = end
            .filter(|s| !s.trim().is_empty())
            .map(|s| util::parse_rfc3339("end", s))
            .transpose()?;

        Ok(Self {
            key: key.to_string(),
            topics,
            profile: None,
            start,
            end,
            config_file: None,
        })
    }

    /// The tracer configuration for this request under `profile`.
    pub fn trace_config(&self, profile: &str) -> TraceConfig {
        TraceConfig {
            profile: profile.to_string(),
            topics: self.topics.clone(),
            start: self.start,
            end: self.end,
            key: self.key.clone(),
        }
    }
}

/// Step of the driver a failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Config,
    Connect,
    DataCheck,
    Start,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Config => "config error",
            Phase::Connect => "connect error",
            Phase::DataCheck => "trace data check failed",
            Phase::Start => "trace start",
        })
    }
}

/// A failure before the tracer started.
#[derive(Debug)]
pub struct HeadlessError {
    pub phase: Phase,
    pub source: TracerError,
}

impl HeadlessError {
    fn at(phase: Phase) -> impl FnOnce(TracerError) -> Self {
        move |source| Self { phase, source }
    }

    /// Process exit code for this failure.
    pub fn exit_code(&self) -> u8 {
        exit_code(&self.source)
    }
}

impl fmt::Display for HeadlessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.phase, self.source)
    }
}

impl std::error::Error for HeadlessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Map an error that prevented the trace from starting to an exit code.
pub fn exit_code(error: &TracerError) -> u8 {
    match error.kind() {
        ErrorKind::Config => EXIT_CONFIG_ERROR,
        ErrorKind::Auth | ErrorKind::Connect => EXIT_CONNECTION_ERROR,
        ErrorKind::Store => EXIT_STORE_ERROR,
        ErrorKind::Subscribe | ErrorKind::State => EXIT_RUNTIME_ERROR,
    }
}

/// Final per-filter counters of a trace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceSummary {
    counts: BTreeMap<String, u64>,
}

impl TraceSummary {
    pub fn new(counts: HashMap<String, u64>) -> Self {
        Self {
            counts: counts.into_iter().collect(),
        }
    }

    pub fn get(&self, filter: &str) -> Option<u64> {
        self.counts.get(filter).copied()
    }

    /// `"<filter>: <count>"` lines, sorted by filter.
    pub fn lines(&self) -> impl Iterator<Item = String> + '_ {
        self.counts
            .iter()
            .map(|(filter, count)| format!("{}: {}", filter, count))
    }
}

/// Runs headless traces against one store and registry.
#[derive(Debug, Clone)]
pub struct Driver {
    store: TraceStore,
    registry: TraceRegistry,
    tick: Duration,
}

impl Default for Driver {
    fn default() -> Self {
        Self::new(TraceStore::default(), TraceRegistry::default())
    }
}

impl Driver {
    pub fn new(store: TraceStore, registry: TraceRegistry) -> Self {
        Self {
            store,
            registry,
            tick: TICK,
        }
    }

    /// Use a different re-check interval.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Run `request` end to end against the broker of its profile.
    ///
    /// `interrupt` completes when the user asks to stop.
    pub async fn run(
        &self,
        request: &TraceRequest,
        interrupt: impl Future<Output = ()>,
    ) -> Result<TraceSummary, HeadlessError> {
        let mut profile =
            profile::load_profile(request.profile.as_deref(), request.config_file.as_deref())
                .map_err(HeadlessError::at(Phase::Config))?;
        profile::override_password(&mut profile, |var| env::var(var).ok());
        let config = request.trace_config(&profile.name);
        self.check_new_trace(&config)?;

        let client_config =
            MqttClientConfig::from_profile(&profile).map_err(HeadlessError::at(Phase::Config))?;
        let client = MqttTraceClient::connect(&client_config)
            .await
            .map_err(HeadlessError::at(Phase::Connect))?;

        self.trace(config, Arc::new(client), interrupt).await
    }

    /// Run a trace over an already connected `client`.
    ///
    /// Refuses an end time in the past and a key that already has stored
    /// records, so an earlier trace is never overwritten. The client is
    /// disconnected on every error path.
    pub async fn trace(
        &self,
        config: TraceConfig,
        client: Arc<dyn BrokerClient>,
        interrupt: impl Future<Output = ()>,
    ) -> Result<TraceSummary, HeadlessError> {
        if let Err(e) = self.check_new_trace(&config) {
            client.disconnect();
            return Err(e);
        }

        let tracer = Tracer::new(config.clone(), Arc::clone(&client), self.store.clone());
        if let Err(e) = tracer.start() {
            client.disconnect();
            return Err(HeadlessError::at(Phase::Start)(e));
        }
        if let Err(e) = self.registry.add(&config) {
            warn!(key = %config.key, error = %e, "failed to persist trace definition");
        }

        let counts = drive(&tracer, interrupt, self.tick).await;
        Ok(TraceSummary::new(counts))
    }

    fn check_new_trace(&self, config: &TraceConfig) -> Result<(), HeadlessError> {
        if config.end.is_some_and(|end| end < Utc::now()) {
            return Err(HeadlessError::at(Phase::Config)(TracerError::Config(
                "trace end time already passed".to_string(),
            )));
        }
        let exists = self
            .store
            .has_data(&config.profile, &config.key)
            .map_err(HeadlessError::at(Phase::DataCheck))?;
        if exists {
            return Err(HeadlessError::at(Phase::Config)(TracerError::Config(
                "trace key already exists".to_string(),
            )));
        }
        Ok(())
    }
}

/// Wait while the tracer is planned or running, stopping it on `interrupt`.
///
/// Always leaves the tracer stopped and returns its final counters.
pub async fn drive(
    tracer: &Tracer,
    interrupt: impl Future<Output = ()>,
    tick: Duration,
) -> HashMap<String, u64> {
    tokio::pin!(interrupt);
    while tracer.planned() || tracer.running() {
        tokio::select! {
            _ = &mut interrupt => {
                info!(key = %tracer.config().key, "interrupted, stopping trace");
                break;
            }
            _ = tokio::time::sleep(tick) => {}
        }
    }
    tracer.stop().await;
    tracer.counts()
}
