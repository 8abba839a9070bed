//! Tracer engine
//!
//! A [`Tracer`] records every message published on a set of topic filters
//! during a time window `[start, end]`, persists each one through the
//! [`TraceStore`] and keeps a per-filter counter of what it stored.
//!
//! # Lifecycle
//!
//! ```text
//! idle --start(), now < start--> planned --start time--> running
//! idle --start(), now >= start-----------------------> running
//! planned | running --stop() / end time / connection lost--> stopped
//! ```
//!
//! [`Tracer::start`] returns immediately; a background task owned by the
//! tracer waits for the start time, subscribes, waits for the end time (or a
//! cancellation) and tears everything down. [`Tracer::stop`] waits for that
//! teardown, so once it returns no further record reaches the store.

use chrono::{DateTime, Utc};
use rumqttc::QoS;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::error::TracerError;
use crate::message::TraceMessage;
use crate::mqtt::{BrokerClient, IncomingMessage, MessageHandler};
use crate::store::TraceStore;
use crate::topics::TopicFilter;

/// Definition of one trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceConfig {
    /// Broker profile; selects the store partition.
    pub profile: String,
    /// Subscription filters, in the order counters are reported.
    pub topics: Vec<String>,
    pub start: DateTime<Utc>,
    /// `None` records until stopped.
    pub end: Option<DateTime<Utc>>,
    /// Unique trace name; store partition key.
    pub key: String,
}

impl TraceConfig {
    /// Trace starting at `start` with no end.
    pub fn new(
        profile: impl Into<String>,
        key: impl Into<String>,
        topics: Vec<String>,
        start: DateTime<Utc>,
    ) -> Self {
        Self {
            profile: profile.into(),
            topics,
            start,
            end: None,
            key: key.into(),
        }
    }

    pub fn with_end(mut self, end: DateTime<Utc>) -> Self {
        self.end = Some(end);
        self
    }

    /// Reject configurations a tracer cannot run.
    ///
    /// The key must be non-empty and free of `/`, which would let one trace's
    /// store prefix cover another's. Every filter must be well formed.
    pub fn validate(&self) -> Result<(), TracerError> {
        if self.key.is_empty() {
            return Err(TracerError::Config("trace key is empty".to_string()));
        }
        if self.key.contains('/') {
            return Err(TracerError::Config(format!(
                "trace key '{}' must not contain '/'",
                self.key
            )));
        }
        TopicFilter::new(self.topics.clone()).validate()
    }

    /// Whether a message received at `ts` belongs to the trace. Both bounds
    /// are inclusive.
    pub fn accepts(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && self.end.map_or(true, |end| ts <= end)
    }

    /// Whether `now` lies in the active window `[start, end)`.
    pub fn in_window(&self, now: DateTime<Utc>) -> bool {
        now >= self.start && self.end.map_or(true, |end| now < end)
    }

    /// An end at or before the start leaves nothing to record.
    pub fn is_empty_window(&self) -> bool {
        self.end.is_some_and(|end| end <= self.start)
    }
}

/// Lifecycle state of a [`Tracer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceState {
    /// Constructed, not started.
    Idle,
    /// Started, waiting for the start time.
    Planned,
    /// Subscriptions requested; messages are recorded.
    Running,
    /// Terminal.
    Stopped,
}

struct Lifecycle {
    state: TraceState,
    started: bool,
}

struct Shared {
    config: TraceConfig,
    filters: TopicFilter,
    store: TraceStore,
    client: Arc<dyn BrokerClient>,
    counts: Mutex<HashMap<String, u64>>,
    lifecycle: Mutex<Lifecycle>,
    /// Open while records may be written. Callbacks hold the read side for
    /// the whole persist-and-count step; closing takes the write side.
    recording: RwLock<bool>,
    cancel: watch::Sender<bool>,
    done: watch::Sender<bool>,
}

/// Records the messages of one trace.
///
/// Single-use: once stopped, a tracer cannot be restarted.
pub struct Tracer {
    shared: Arc<Shared>,
}

impl Tracer {
    /// Build an idle tracer. Counters start at zero for every filter.
    pub fn new(config: TraceConfig, client: Arc<dyn BrokerClient>, store: TraceStore) -> Self {
        let counts = config.topics.iter().map(|t| (t.clone(), 0)).collect();
        let filters = TopicFilter::new(config.topics.clone());
        Self {
            shared: Arc::new(Shared {
                config,
                filters,
                store,
                client,
                counts: Mutex::new(counts),
                lifecycle: Mutex::new(Lifecycle {
                    state: TraceState::Idle,
                    started: false,
                }),
                recording: RwLock::new(false),
                cancel: watch::channel(false).0,
                done: watch::channel(false).0,
            }),
        }
    }

    /// Start the trace and return immediately.
    ///
    /// Must be called inside a tokio runtime; the background worker is
    /// spawned on it.
    ///
    /// # Errors
    ///
    /// A state error when the tracer was already started or stopped, or when
    /// no runtime is available. A config error when the configuration is
    /// invalid. The tracer is left untouched in every error case.
    pub fn start(&self) -> Result<(), TracerError> {
        let runtime = Handle::try_current().map_err(|_| {
            TracerError::State("tracer must be started inside a tokio runtime".to_string())
        })?;
        let shared = &self.shared;
        let config = &shared.config;

        let mut lifecycle = shared.lifecycle();
        if lifecycle.started {
            return Err(TracerError::State("trace already running".to_string()));
        }
        if lifecycle.state == TraceState::Stopped {
            return Err(TracerError::State("trace already stopped".to_string()));
        }
        config.validate()?;
        lifecycle.started = true;

        if config.is_empty_window() {
            lifecycle.state = TraceState::Stopped;
            drop(lifecycle);
            info!(key = %config.key, "trace window is empty, nothing to record");
            shared.client.disconnect();
            shared.done.send_replace(true);
            return Ok(());
        }

        lifecycle.state = if Utc::now() < config.start {
            TraceState::Planned
        } else {
            TraceState::Running
        };
        info!(
            key = %config.key,
            profile = %config.profile,
            state = ?lifecycle.state,
            "trace started"
        );
        drop(lifecycle);

        *shared.recording.write().unwrap_or_else(PoisonError::into_inner) = true;
        runtime.spawn(Arc::clone(shared).run());
        Ok(())
    }

    /// Stop the trace and wait until the worker has disconnected.
    ///
    /// Idempotent. Stopping a tracer that was never started just marks it
    /// stopped.
    pub async fn stop(&self) {
        {
            let mut lifecycle = self.shared.lifecycle();
            if !lifecycle.started {
                lifecycle.state = TraceState::Stopped;
                return;
            }
        }
        self.shared.cancel.send_replace(true);
        let mut done = self.shared.done.subscribe();
        // Only fails if the sender is gone, which cannot happen while
        // `self` holds it.
        let _ = done.wait_for(|finished| *finished).await;
    }

    /// True while subscriptions are active and now lies in `[start, end)`.
    pub fn running(&self) -> bool {
        let state = self.state();
        matches!(state, TraceState::Planned | TraceState::Running)
            && self.shared.config.in_window(Utc::now())
    }

    /// True while the start time lies in the future. Independent of state.
    pub fn planned(&self) -> bool {
        Utc::now() < self.shared.config.start
    }

    pub fn state(&self) -> TraceState {
        self.shared.lifecycle().state
    }

    /// Snapshot of the per-filter counters.
    pub fn counts(&self) -> HashMap<String, u64> {
        self.shared.counts().clone()
    }

    /// Every stored record of this trace.
    pub fn messages(&self) -> Result<Vec<TraceMessage>, TracerError> {
        self.shared
            .store
            .messages(&self.shared.config.profile, &self.shared.config.key)
    }

    pub fn config(&self) -> &TraceConfig {
        &self.shared.config
    }
}

impl Drop for Tracer {
    fn drop(&mut self) {
        // The worker would otherwise keep an open-ended trace alive.
        self.shared.cancel.send_replace(true);
    }
}

/// Why the active phase of a trace ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finish {
    Cancelled,
    EndReached,
    ConnectionLost,
    NothingSubscribed,
}

impl Shared {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn counts(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run(self: Arc<Self>) {
        let finish = self.trace().await;
        match finish {
            Finish::NothingSubscribed => {
                error!(key = %self.config.key, "no topic filter could be subscribed, stopping trace")
            }
            Finish::ConnectionLost => {
                warn!(key = %self.config.key, "broker connection lost, stopping trace")
            }
            _ => debug!(key = %self.config.key, reason = ?finish, "trace finishing"),
        }
        self.finish().await;
    }

    async fn trace(self: &Arc<Self>) -> Finish {
        let mut cancel = self.cancel.subscribe();

        if let Some(delay) = until(self.config.start) {
            debug!(key = %self.config.key, ?delay, "waiting for trace start");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.wait_for(|c| *c) => return Finish::Cancelled,
            }
        }
        // A stop issued right after start must not reach the broker.
        if *cancel.borrow() {
            return Finish::Cancelled;
        }

        let (lost_tx, mut lost_rx) = watch::channel(false);
        self.client.on_connection_lost(Box::new(move |reason: &str| {
            warn!(%reason, "connection lost");
            lost_tx.send_replace(true);
        }));
        let (refused_tx, mut refused_rx) = mpsc::unbounded_channel::<(String, String)>();
        self.client
            .on_subscribe_refused(Box::new(move |filter: &str, reason: &str| {
                // The receiver is gone once the trace has finished.
                let _ = refused_tx.send((filter.to_string(), reason.to_string()));
            }));

        let handler = self.message_handler();
        let mut active: Vec<&str> = Vec::new();
        for filter in &self.config.topics {
            match self
                .client
                .subscribe(filter, QoS::AtMostOnce, Arc::clone(&handler))
            {
                Ok(()) => {
                    debug!(key = %self.config.key, %filter, "subscribed");
                    active.push(filter);
                }
                Err(e) => warn!(key = %self.config.key, %filter, error = %e, "subscribe failed"),
            }
        }
        if active.is_empty() {
            return Finish::NothingSubscribed;
        }

        {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state == TraceState::Planned {
                lifecycle.state = TraceState::Running;
                info!(key = %self.config.key, "trace running");
            }
        }

        let end_timer = async {
            match self.config.end {
                Some(end) => tokio::time::sleep(until(end).unwrap_or(Duration::ZERO)).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(end_timer);
        loop {
            tokio::select! {
                _ = &mut end_timer => return Finish::EndReached,
                _ = cancel.wait_for(|c| *c) => return Finish::Cancelled,
                _ = lost_rx.wait_for(|l| *l) => return Finish::ConnectionLost,
                Some((filter, reason)) = refused_rx.recv() => {
                    warn!(key = %self.config.key, %filter, %reason, "subscription refused by broker");
                    active.retain(|f| *f != filter);
                    if active.is_empty() {
                        return Finish::NothingSubscribed;
                    }
                }
            }
        }
    }

    /// Subscription callback. Holds only a weak reference so the client,
    /// which owns the handler, does not keep the tracer alive.
    fn message_handler(self: &Arc<Self>) -> MessageHandler {
        let shared: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |msg: &IncomingMessage| {
            if let Some(shared) = shared.upgrade() {
                shared.record(msg);
            }
        })
    }

    fn record(&self, msg: &IncomingMessage) {
        let open = self.recording.read().unwrap_or_else(PoisonError::into_inner);
        if !*open {
            return;
        }
        let ts = Utc::now();
        if !self.config.accepts(ts) {
            debug!(key = %self.config.key, topic = msg.topic(), "message outside trace window");
            return;
        }

        let record = TraceMessage::trace(ts, msg.topic(), msg.payload());
        if let Err(e) = self
            .store
            .add(&self.config.profile, &self.config.key, &record)
        {
            warn!(
                key = %self.config.key,
                topic = msg.topic(),
                error = %e,
                "failed to store trace message"
            );
            return;
        }

        let mut counts = self.counts();
        for filter in self.filters.matching(msg.topic()) {
            if let Some(count) = counts.get_mut(filter) {
                *count += 1;
            }
        }
    }

    async fn finish(self: Arc<Self>) {
        for filter in &self.config.topics {
            if let Err(e) = self.client.unsubscribe(filter) {
                debug!(key = %self.config.key, %filter, error = %e, "unsubscribe failed");
            }
        }
        self.client.disconnect();

        // Waits for in-flight callbacks, which may be blocked on store I/O.
        let gate = Arc::clone(&self);
        let closed = tokio::task::spawn_blocking(move || {
            *gate.recording.write().unwrap_or_else(PoisonError::into_inner) = false;
        })
        .await;
        if let Err(e) = closed {
            error!(key = %self.config.key, error = %e, "closing recording gate failed");
        }

        self.lifecycle().state = TraceState::Stopped;
        info!(key = %self.config.key, counts = ?*self.counts(), "trace stopped");
        self.done.send_replace(true);
    }
}

/// Time left until `at`, or `None` when it has passed.
fn until(at: DateTime<Utc>) -> Option<Duration> {
    (at - Utc::now()).to_std().ok().filter(|d| !d.is_zero())
}
