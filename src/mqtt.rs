//! MQTT client module
//!
//! Defines the narrow [`BrokerClient`] interface the tracer engine consumes
//! and its `rumqttc` implementation, [`MqttTraceClient`].
//!
//! The tracer only ever subscribes, unsubscribes and disconnects; inbound
//! publishes reach it through the [`MessageHandler`] it registers with each
//! subscription. Any client that satisfies the trait works, which is what the
//! tests use to drive the engine without a broker.

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, QoS, Transport};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::error::TracerError;
use crate::profile::Profile;
use crate::topics;
use crate::util;

/// Default keep-alive when the profile does not set one.
const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Default time allowed for the CONNACK to arrive.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default pause before polling again after a connection error.
const DEFAULT_RECONNECT_PERIOD: Duration = Duration::from_secs(1);

/// Time the event loop gets to flush the DISCONNECT before it is aborted.
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Request channel capacity. Subscriptions are few; the capacity only has
/// to absorb a burst of subscribe/unsubscribe requests.
const REQUEST_CAPACITY: usize = 256;

/// A publish delivered to a subscription handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    topic: String,
    payload: Vec<u8>,
}

impl IncomingMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Callback invoked for every publish matching a subscription.
///
/// May be called from a thread owned by the client, concurrently with any
/// other method of the tracer.
pub type MessageHandler = Arc<dyn Fn(&IncomingMessage) + Send + Sync>;

/// Callback invoked once when the broker connection is lost for good.
/// Receives a human-readable reason.
pub type ConnectionLostHandler = Box<dyn Fn(&str) + Send + Sync>;

/// Callback invoked when the broker refuses a subscription that
/// [`BrokerClient::subscribe`] had accepted. Receives the filter and the
/// broker's reason.
pub type SubscribeRefusedHandler = Box<dyn Fn(&str, &str) + Send + Sync>;

/// What the tracer engine needs from a broker connection.
pub trait BrokerClient: Send + Sync {
    /// Subscribe to `filter`; matching publishes are passed to `handler`.
    ///
    /// `Ok` means the request was sent. A later refusal by the broker is
    /// reported through [`BrokerClient::on_subscribe_refused`].
    fn subscribe(&self, filter: &str, qos: QoS, handler: MessageHandler)
        -> Result<(), TracerError>;

    /// Drop the subscription for `filter`.
    fn unsubscribe(&self, filter: &str) -> Result<(), TracerError>;

    /// Close the connection. Must be safe to call more than once.
    fn disconnect(&self);

    /// Register the handler to call when the connection drops without a
    /// prior [`BrokerClient::disconnect`]. Clients that never report
    /// connection loss may ignore it.
    fn on_connection_lost(&self, _handler: ConnectionLostHandler) {}

    /// Register the handler to call for every subscription the broker
    /// refuses in its SUBACK. Clients that subscribe synchronously may
    /// ignore it.
    fn on_subscribe_refused(&self, _handler: SubscribeRefusedHandler) {}
}

/// MQTT protocol revision spoken to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqttVersion {
    V311,
    V5,
}

impl MqttVersion {
    /// Parse a profile's `mqtt_version`. Empty means 3.1.1.
    pub fn parse(version: &str) -> Result<Self, TracerError> {
        match version.trim() {
            "" | "3" | "3.1" | "3.1.1" | "4" => Ok(MqttVersion::V311),
            "5" | "5.0" => Ok(MqttVersion::V5),
            other => Err(TracerError::Config(format!(
                "invalid MQTT version '{}': must be 3.1.1 or 5",
                other
            ))),
        }
    }
}

/// Last-will message registered at connect time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWillConfig {
    pub topic: String,
    pub payload: String,
    pub qos: QoS,
    pub retain: bool,
}

/// Configuration for establishing an MQTT client connection.
#[derive(Debug, Clone)]
pub struct MqttClientConfig {
    /// The hostname or IP address of the MQTT broker
    pub host: String,

    /// The port number of the MQTT broker
    pub port: u16,

    /// The client identifier. A unique one is generated when empty.
    pub client_id: String,

    /// Optional username for MQTT broker authentication
    pub username: Option<String>,

    /// Optional password for MQTT broker authentication
    pub password: Option<String>,

    pub version: MqttVersion,

    /// Optional TLS configuration for secure connections
    pub tls: Option<TlsConfig>,

    /// Maximum packet size in bytes (default: 1MB)
    pub max_packet_size: usize,

    pub keep_alive: Duration,

    /// Time allowed between dialing and receiving the CONNACK.
    pub connect_timeout: Duration,

    /// Clean session (3.1.1) / clean start (5).
    pub clean_session: bool,

    /// Keep polling after connection errors, waiting `reconnect_period`
    /// between attempts.
    pub auto_reconnect: bool,

    pub reconnect_period: Duration,

    pub last_will: Option<LastWillConfig>,
}

/// TLS settings for secure connections.
///
/// Server certificates are verified against the system roots.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Requested by the profile to skip certificate verification. rumqttc's
    /// default transport cannot do that; the request is logged and ignored.
    pub insecure: bool,
}

impl MqttClientConfig {
    /// Creates a new MQTT client configuration with the specified parameters
    /// and 3.1.1 defaults for everything else.
    ///
    /// # Example
    ///
    /// ```
    /// use mqtt_tracer::mqtt::MqttClientConfig;
    ///
    /// let config = MqttClientConfig::new(
    ///     "localhost".to_string(),
    ///     1883,
    ///     "my-client".to_string(),
    /// );
    /// assert!(config.clean_session);
    /// ```
    pub fn new(host: String, port: u16, client_id: String) -> Self {
        Self {
            host,
            port,
            client_id,
            username: None,
            password: None,
            version: MqttVersion::V311,
            tls: None,
            max_packet_size: 1024 * 1024,
            keep_alive: DEFAULT_KEEP_ALIVE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            clean_session: true,
            auto_reconnect: false,
            reconnect_period: DEFAULT_RECONNECT_PERIOD,
            last_will: None,
        }
    }

    /// Build the client configuration a profile describes.
    ///
    /// The profile's password must already be resolved (see
    /// [`crate::profile::resolve_password`]).
    pub fn from_profile(profile: &Profile) -> Result<Self, TracerError> {
        let tls = match profile.schema.trim().to_ascii_lowercase().as_str() {
            "" | "tcp" | "mqtt" => profile.ssl,
            "ssl" | "tls" | "mqtts" => true,
            other => {
                return Err(TracerError::Config(format!(
                    "unsupported broker scheme '{}' in profile '{}'",
                    other, profile.name
                )))
            }
        };

        let port = u16::try_from(profile.port).map_err(|_| {
            TracerError::Config(format!(
                "invalid port {} in profile '{}'",
                profile.port, profile.name
            ))
        })?;
        let port = match (port, tls) {
            (0, true) => 8883,
            (0, false) => 1883,
            (port, _) => port,
        };

        let mut client_id = util::generate_client_id(&Some(profile.client_id.clone()));
        if profile.random_id_suffix {
            client_id = util::with_random_suffix(&client_id);
        }

        let mut config = Self::new(profile.host.clone(), port, client_id)
            .with_version(MqttVersion::parse(&profile.mqtt_version)?);
        if !profile.username.is_empty() {
            config = config.with_credentials(profile.username.clone(), profile.password.clone());
        }
        if tls {
            config = config.with_tls(TlsConfig {
                insecure: profile.skip_tls_verify,
            });
        }
        if profile.maximum_packet_size > 0 {
            config.max_packet_size = profile.maximum_packet_size as usize;
        }
        if profile.keep_alive > 0 {
            config.keep_alive = Duration::from_secs(profile.keep_alive);
        }
        if profile.connect_timeout > 0 {
            config.connect_timeout = Duration::from_secs(profile.connect_timeout);
        }
        if profile.reconnect_period > 0 {
            config.reconnect_period = Duration::from_secs(profile.reconnect_period);
        }
        config.clean_session = profile.clean_start;
        config.auto_reconnect = profile.auto_reconnect;
        if profile.last_will_enabled && !profile.last_will_topic.is_empty() {
            config.last_will = Some(LastWillConfig {
                topic: profile.last_will_topic.clone(),
                payload: profile.last_will_payload.clone(),
                qos: qos_from_u8(profile.last_will_qos),
                retain: profile.last_will_retain,
            });
        }
        Ok(config)
    }

    /// Sets the authentication credentials for the MQTT connection.
    pub fn with_credentials(mut self, username: String, password: String) -> Self {
        self.username = Some(username);
        self.password = Some(password);
        self
    }

    /// Sets the TLS configuration for secure connections.
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_version(mut self, version: MqttVersion) -> Self {
        self.version = version;
        self
    }

    /// Returns true if TLS is configured for this connection.
    pub fn is_tls_enabled(&self) -> bool {
        self.tls.is_some()
    }

    fn transport(&self) -> Option<Transport> {
        let tls = self.tls.as_ref()?;
        if tls.insecure {
            warn!(
                host = %self.host,
                "skipping TLS verification is not supported; verifying against system roots"
            );
        }
        Some(Transport::tls_with_default_config())
    }

    fn v4_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_max_packet_size(self.max_packet_size, self.max_packet_size);
        options.set_clean_session(self.clean_session);
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            options.set_credentials(username, password);
        }
        if let Some(will) = &self.last_will {
            options.set_last_will(rumqttc::LastWill::new(
                will.topic.clone(),
                will.payload.clone(),
                will.qos,
                will.retain,
            ));
        }
        if let Some(transport) = self.transport() {
            options.set_transport(transport);
        }
        options
    }

    fn v5_options(&self) -> rumqttc::v5::MqttOptions {
        let mut options = rumqttc::v5::MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_max_packet_size(Some(self.max_packet_size as u32));
        options.set_clean_start(self.clean_session);
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            options.set_credentials(username, password);
        }
        if let Some(will) = &self.last_will {
            options.set_last_will(rumqttc::v5::mqttbytes::v5::LastWill::new(
                will.topic.clone(),
                will.payload.clone(),
                to_v5_qos(will.qos),
                will.retain,
                None,
            ));
        }
        if let Some(transport) = self.transport() {
            options.set_transport(transport);
        }
        options
    }
}

/// Convert a profile QoS number; anything but 1 or 2 is QoS 0.
pub fn qos_from_u8(qos: u8) -> QoS {
    match qos {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

/// Convert v4 QoS to v5 QoS (they're separate types in rumqttc)
fn to_v5_qos(qos: QoS) -> rumqttc::v5::mqttbytes::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::v5::mqttbytes::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::v5::mqttbytes::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::v5::mqttbytes::QoS::ExactlyOnce,
    }
}

/// Request side of either protocol revision.
#[derive(Clone)]
enum ClientHandle {
    V4(AsyncClient),
    V5(rumqttc::v5::AsyncClient),
}

impl ClientHandle {
    fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), String> {
        match self {
            Self::V4(c) => c.try_subscribe(filter, qos).map_err(|e| e.to_string()),
            Self::V5(c) => c
                .try_subscribe(filter, to_v5_qos(qos))
                .map_err(|e| e.to_string()),
        }
    }

    fn unsubscribe(&self, filter: &str) -> Result<(), String> {
        match self {
            Self::V4(c) => c.try_unsubscribe(filter).map_err(|e| e.to_string()),
            Self::V5(c) => c.try_unsubscribe(filter).map_err(|e| e.to_string()),
        }
    }

    fn disconnect(&self) -> Result<(), String> {
        match self {
            Self::V4(c) => c.try_disconnect().map_err(|e| e.to_string()),
            Self::V5(c) => c.try_disconnect().map_err(|e| e.to_string()),
        }
    }
}

/// Event side of either protocol revision.
enum EventSource {
    V4(EventLoop),
    V5(rumqttc::v5::EventLoop),
}

/// Unified incoming event extracted from either v4 or v5 MQTT events.
#[derive(Debug, PartialEq, Eq)]
enum MqttIncoming {
    Publish(IncomingMessage),
    ConnAck,
    /// A SUBSCRIBE left under this packet id.
    SubscribeSent(u16),
    /// SUBACK for `pkid`; `refused` carries the failure code, if any.
    SubAck { pkid: u16, refused: Option<String> },
    Other,
}

impl EventSource {
    async fn poll(&mut self) -> Result<MqttIncoming, TracerError> {
        match self {
            Self::V4(el) => Ok(Self::convert_v4_event(el.poll().await?)),
            Self::V5(el) => Ok(Self::convert_v5_event(el.poll().await?)),
        }
    }

    fn convert_v4_event(event: Event) -> MqttIncoming {
        use rumqttc::Packet;
        match event {
            Event::Incoming(Packet::Publish(p)) => {
                MqttIncoming::Publish(IncomingMessage::new(p.topic, p.payload.to_vec()))
            }
            Event::Incoming(Packet::ConnAck(_)) => MqttIncoming::ConnAck,
            Event::Incoming(Packet::SubAck(ack)) => MqttIncoming::SubAck {
                pkid: ack.pkid,
                refused: ack
                    .return_codes
                    .iter()
                    .find(|code| !matches!(code, rumqttc::SubscribeReasonCode::Success(_)))
                    .map(|code| format!("{:?}", code)),
            },
            Event::Outgoing(Outgoing::Subscribe(pkid)) => MqttIncoming::SubscribeSent(pkid),
            _ => MqttIncoming::Other,
        }
    }

    fn convert_v5_event(event: rumqttc::v5::Event) -> MqttIncoming {
        use rumqttc::v5::mqttbytes::v5::Packet;
        match event {
            rumqttc::v5::Event::Incoming(Packet::Publish(p)) => MqttIncoming::Publish(
                IncomingMessage::new(String::from_utf8_lossy(&p.topic), p.payload.to_vec()),
            ),
            rumqttc::v5::Event::Incoming(Packet::ConnAck(_)) => MqttIncoming::ConnAck,
            rumqttc::v5::Event::Incoming(Packet::SubAck(ack)) => {
                use rumqttc::v5::mqttbytes::v5::SubscribeReasonCode;
                MqttIncoming::SubAck {
                    pkid: ack.pkid,
                    refused: ack
                        .return_codes
                        .iter()
                        .find(|code| !matches!(code, SubscribeReasonCode::Success(_)))
                        .map(|code| format!("{:?}", code)),
                }
            }
            rumqttc::v5::Event::Outgoing(Outgoing::Subscribe(pkid)) => {
                MqttIncoming::SubscribeSent(pkid)
            }
            _ => MqttIncoming::Other,
        }
    }

    /// Poll until the broker acknowledges the connection.
    async fn wait_for_connack(&mut self) -> Result<(), TracerError> {
        loop {
            if let MqttIncoming::ConnAck = self.poll().await? {
                return Ok(());
            }
        }
    }
}

struct Subscription {
    filter: String,
    qos: QoS,
    handler: MessageHandler,
}

/// State shared between the client handle and its event loop task.
#[derive(Default)]
struct Dispatch {
    subscriptions: Mutex<Vec<Subscription>>,
    /// Filters of queued SUBSCRIBE requests, oldest first, until the event
    /// loop reports the packet id each went out under.
    queued: Mutex<VecDeque<String>>,
    /// Sent SUBSCRIBE packets awaiting their SUBACK.
    in_flight: Mutex<HashMap<u16, String>>,
    lost: Mutex<Option<ConnectionLostHandler>>,
    refused: Mutex<Option<SubscribeRefusedHandler>>,
    closing: AtomicBool,
}

impl Dispatch {
    fn subscriptions(&self) -> MutexGuard<'_, Vec<Subscription>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Distinct handlers whose filter covers `topic`, so a publish matching
    /// several filters of one handler is delivered to it once.
    fn handlers_for(&self, topic: &str) -> Vec<MessageHandler> {
        let mut handlers: Vec<MessageHandler> = Vec::new();
        for sub in self
            .subscriptions()
            .iter()
            .filter(|s| topics::matches(&s.filter, topic))
        {
            if !handlers.iter().any(|h| Arc::ptr_eq(h, &sub.handler)) {
                handlers.push(Arc::clone(&sub.handler));
            }
        }
        handlers
    }

    async fn deliver(&self, msg: IncomingMessage) {
        let handlers = self.handlers_for(msg.topic());
        if handlers.is_empty() {
            debug!(topic = msg.topic(), "publish matches no subscription");
            return;
        }
        // Handlers do blocking store I/O; keep it off the async workers but
        // finish one publish before polling the next to preserve order.
        let delivered = tokio::task::spawn_blocking(move || {
            for handler in &handlers {
                handler(&msg);
            }
        })
        .await;
        if let Err(e) = delivered {
            error!(error = %e, "message handler failed");
        }
    }

    /// Queue a SUBSCRIBE, remembering its filter so the SUBACK can be
    /// matched to it. The queue lock is held across the request so the
    /// queue order equals the order rumqttc sends them in.
    fn request_subscribe(
        &self,
        client: &ClientHandle,
        filter: &str,
        qos: QoS,
    ) -> Result<(), String> {
        let mut queued = lock(&self.queued);
        client.subscribe(filter, qos)?;
        queued.push_back(filter.to_string());
        Ok(())
    }

    fn subscribe_sent(&self, pkid: u16) {
        let Some(filter) = lock(&self.queued).pop_front() else {
            return;
        };
        lock(&self.in_flight).insert(pkid, filter);
    }

    /// Handle a SUBACK. A refused filter is dropped from dispatch and
    /// reported.
    fn subscribe_acked(&self, pkid: u16, refused: Option<String>) {
        let Some(filter) = lock(&self.in_flight).remove(&pkid) else {
            return;
        };
        let Some(reason) = refused else {
            debug!(%filter, "subscription acknowledged");
            return;
        };
        warn!(%filter, %reason, "broker refused subscription");
        self.subscriptions().retain(|s| s.filter != filter);
        if let Some(handler) = lock(&self.refused).as_ref() {
            handler(&filter, &reason);
        }
    }

    /// Requests queued on a dropped connection never get a packet id.
    fn forget_pending(&self) {
        lock(&self.queued).clear();
        lock(&self.in_flight).clear();
    }

    fn connection_lost(&self, reason: &str) {
        if let Some(handler) = lock(&self.lost).as_ref() {
            handler(reason);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// [`BrokerClient`] backed by a rumqttc connection.
///
/// The event loop runs on a tokio task for the lifetime of the connection.
pub struct MqttTraceClient {
    client: ClientHandle,
    dispatch: Arc<Dispatch>,
    event_loop: AbortHandle,
    runtime: Handle,
}

impl MqttTraceClient {
    /// Connect to the broker and wait for its CONNACK.
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns a connect-kind [`TracerError`] when the broker cannot be
    /// reached, refuses the connection, or does not answer within
    /// `connect_timeout`.
    pub async fn connect(config: &MqttClientConfig) -> Result<Self, TracerError> {
        let (client, mut events) = match config.version {
            MqttVersion::V311 => {
                let (client, el) = AsyncClient::new(config.v4_options(), REQUEST_CAPACITY);
                (ClientHandle::V4(client), EventSource::V4(el))
            }
            MqttVersion::V5 => {
                let (client, el) =
                    rumqttc::v5::AsyncClient::new(config.v5_options(), REQUEST_CAPACITY);
                (ClientHandle::V5(client), EventSource::V5(el))
            }
        };

        info!(
            host = %config.host,
            port = config.port,
            client_id = %config.client_id,
            version = ?config.version,
            "connecting to MQTT broker"
        );
        tokio::time::timeout(config.connect_timeout, events.wait_for_connack())
            .await
            .map_err(|_| {
                TracerError::Connect(format!(
                    "no CONNACK from {}:{} within {:?}",
                    config.host, config.port, config.connect_timeout
                ))
            })??;
        info!(host = %config.host, port = config.port, "connected to MQTT broker");

        let dispatch = Arc::new(Dispatch::default());
        let reconnect = config.auto_reconnect.then_some(config.reconnect_period);
        let task = tokio::spawn(run_event_loop(
            events,
            client.clone(),
            Arc::clone(&dispatch),
            reconnect,
        ));

        Ok(Self {
            client,
            dispatch,
            event_loop: task.abort_handle(),
            runtime: Handle::current(),
        })
    }
}

impl BrokerClient for MqttTraceClient {
    fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        handler: MessageHandler,
    ) -> Result<(), TracerError> {
        self.dispatch
            .request_subscribe(&self.client, filter, qos)
            .map_err(|reason| TracerError::Subscribe {
                filter: filter.to_string(),
                reason,
            })?;
        let mut subs = self.dispatch.subscriptions();
        subs.retain(|s| s.filter != filter);
        subs.push(Subscription {
            filter: filter.to_string(),
            qos,
            handler,
        });
        Ok(())
    }

    fn unsubscribe(&self, filter: &str) -> Result<(), TracerError> {
        self.dispatch.subscriptions().retain(|s| s.filter != filter);
        self.client
            .unsubscribe(filter)
            .map_err(|reason| TracerError::Subscribe {
                filter: filter.to_string(),
                reason,
            })
    }

    fn disconnect(&self) {
        if self.dispatch.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.client.disconnect() {
            debug!(error = %e, "disconnect request not queued");
        }
        let event_loop = self.event_loop.clone();
        self.runtime.spawn(async move {
            tokio::time::sleep(DISCONNECT_GRACE).await;
            event_loop.abort();
        });
    }

    fn on_connection_lost(&self, handler: ConnectionLostHandler) {
        *lock(&self.dispatch.lost) = Some(handler);
    }

    fn on_subscribe_refused(&self, handler: SubscribeRefusedHandler) {
        *lock(&self.dispatch.refused) = Some(handler);
    }
}

impl Drop for MqttTraceClient {
    fn drop(&mut self) {
        self.event_loop.abort();
    }
}

/// Drive the connection: deliver publishes, re-subscribe after reconnects,
/// and report a lost connection when reconnecting is disabled.
async fn run_event_loop(
    mut events: EventSource,
    client: ClientHandle,
    dispatch: Arc<Dispatch>,
    reconnect: Option<Duration>,
) {
    loop {
        match events.poll().await {
            Ok(MqttIncoming::Publish(msg)) => dispatch.deliver(msg).await,
            Ok(MqttIncoming::ConnAck) => {
                info!("reconnected to MQTT broker");
                let filters: Vec<(String, QoS)> = dispatch
                    .subscriptions()
                    .iter()
                    .map(|s| (s.filter.clone(), s.qos))
                    .collect();
                for (filter, qos) in filters {
                    if let Err(e) = dispatch.request_subscribe(&client, &filter, qos) {
                        warn!(filter = %filter, error = %e, "re-subscribe failed");
                    }
                }
            }
            Ok(MqttIncoming::SubscribeSent(pkid)) => dispatch.subscribe_sent(pkid),
            Ok(MqttIncoming::SubAck { pkid, refused }) => dispatch.subscribe_acked(pkid, refused),
            Ok(MqttIncoming::Other) => {}
            Err(e) => {
                dispatch.forget_pending();
                if dispatch.closing.load(Ordering::SeqCst) {
                    debug!(error = %e, "event loop closed");
                    return;
                }
                match reconnect {
                    Some(period) => {
                        warn!(error = %e, "MQTT connection error, retrying in {:?}", period);
                        tokio::time::sleep(period).await;
                    }
                    None => {
                        warn!(error = %e, "MQTT connection lost");
                        dispatch.connection_lost(&e.to_string());
                        return;
                    }
                }
            }
        }
    }
}
