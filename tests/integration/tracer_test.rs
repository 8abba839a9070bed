//! Integration tests for the tracer engine against an in-process broker client

use chrono::{Duration as ChronoDuration, Utc};
use mqtt_tracer::error::TracerError;
use mqtt_tracer::mqtt::{
    BrokerClient, ConnectionLostHandler, IncomingMessage, MessageHandler, SubscribeRefusedHandler,
};
use mqtt_tracer::store::TraceStore;
use mqtt_tracer::topics::{self, TopicFilter};
use mqtt_tracer::tracer::{TraceConfig, TraceState, Tracer};
use rumqttc::QoS;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use tokio::time::timeout;

/// Broker client that delivers publishes synchronously on the caller's thread.
#[derive(Default)]
struct FakeClient {
    subscriptions: Mutex<Vec<(String, MessageHandler)>>,
    unsubscribed: Mutex<Vec<String>>,
    rejected: Vec<String>,
    disconnects: AtomicUsize,
    lost: Mutex<Option<ConnectionLostHandler>>,
    refused: Mutex<Option<SubscribeRefusedHandler>>,
}

impl FakeClient {
    fn rejecting(filters: &[&str]) -> Self {
        Self {
            rejected: filters.iter().map(|f| f.to_string()).collect(),
            ..Self::default()
        }
    }

    fn publish(&self, topic: &str, payload: &[u8]) {
        let mut handlers: Vec<MessageHandler> = Vec::new();
        for (filter, handler) in self.subscriptions.lock().unwrap().iter() {
            if topics::matches(filter, topic) && !handlers.iter().any(|h| Arc::ptr_eq(h, handler))
            {
                handlers.push(Arc::clone(handler));
            }
        }
        let msg = IncomingMessage::new(topic, payload.to_vec());
        for handler in handlers {
            handler(&msg);
        }
    }

    fn subscribed(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .unwrap()
            .iter()
            .map(|(f, _)| f.clone())
            .collect()
    }

    fn drop_connection(&self) {
        if let Some(handler) = self.lost.lock().unwrap().as_ref() {
            handler("connection reset by peer");
        }
    }

    /// Answer the SUBSCRIBE for `filter` with a refusal, as a broker would
    /// in its SUBACK.
    fn refuse(&self, filter: &str) {
        self.subscriptions.lock().unwrap().retain(|(f, _)| f != filter);
        if let Some(handler) = self.refused.lock().unwrap().as_ref() {
            handler(filter, "NotAuthorized");
        }
    }

    fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

impl BrokerClient for FakeClient {
    fn subscribe(
        &self,
        filter: &str,
        _qos: QoS,
        handler: MessageHandler,
    ) -> Result<(), TracerError> {
        if self.rejected.iter().any(|f| f == filter) {
            return Err(TracerError::Subscribe {
                filter: filter.to_string(),
                reason: "not authorized".to_string(),
            });
        }
        self.subscriptions
            .lock()
            .unwrap()
            .push((filter.to_string(), handler));
        Ok(())
    }

    fn unsubscribe(&self, filter: &str) -> Result<(), TracerError> {
        self.subscriptions.lock().unwrap().retain(|(f, _)| f != filter);
        self.unsubscribed.lock().unwrap().push(filter.to_string());
        Ok(())
    }

    fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn on_connection_lost(&self, handler: ConnectionLostHandler) {
        *self.lost.lock().unwrap() = Some(handler);
    }

    fn on_subscribe_refused(&self, handler: SubscribeRefusedHandler) {
        *self.refused.lock().unwrap() = Some(handler);
    }
}

/// Helper: trace `topics` starting now under profile "test", key "k1"
fn config(topics: &[&str]) -> TraceConfig {
    TraceConfig::new(
        "test",
        "k1",
        topics.iter().map(|t| t.to_string()).collect(),
        Utc::now(),
    )
}

/// Helper: a tracer over a fresh store and fake client
fn setup(config: TraceConfig) -> (Tracer, Arc<FakeClient>, TraceStore, TempDir) {
    setup_with(config, FakeClient::default())
}

fn setup_with(
    config: TraceConfig,
    client: FakeClient,
) -> (Tracer, Arc<FakeClient>, TraceStore, TempDir) {
    let dir = tempdir().unwrap();
    let store = TraceStore::new(dir.path());
    let client = Arc::new(client);
    let tracer = Tracer::new(config, client.clone(), store.clone());
    (tracer, client, store, dir)
}

/// Helper: poll `condition` every 10ms for up to 5 seconds
async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
}

#[tokio::test]
async fn test_records_message_and_clear_removes_it() {
    let (tracer, client, store, _dir) = setup(config(&["a"]));
    tracer.start().unwrap();
    wait_until("subscription", || client.subscribed().len() == 1).await;

    client.publish("a", b"hello");

    let messages = tracer.messages().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].topic, "a");
    assert_eq!(messages[0].payload, "hello");
    assert_eq!(messages[0].kind, "trace");
    assert!(store.has_data("test", "k1").unwrap());

    tracer.stop().await;
    store.clear_data("test", "k1").unwrap();
    assert!(store.messages("test", "k1").unwrap().is_empty());
}

#[tokio::test]
async fn test_messages_outside_window_are_dropped() {
    let start = Utc::now() + ChronoDuration::milliseconds(150);
    let cfg = TraceConfig {
        start,
        ..config(&["a"])
    }
    .with_end(start + ChronoDuration::milliseconds(150));
    let (tracer, client, store, _dir) = setup(cfg);
    tracer.start().unwrap();

    client.publish("a", b"early");
    wait_until("stopped state", || tracer.state() == TraceState::Stopped).await;
    client.publish("a", b"late");

    assert_eq!(tracer.counts()["a"], 0);
    assert!(store.messages("test", "k1").unwrap().is_empty());
}

#[tokio::test]
async fn test_counts_every_matching_filter_but_stores_once() {
    let (tracer, client, _store, _dir) = setup(config(&["sensors/+/temp", "sensors/#"]));
    assert_eq!(tracer.counts()["sensors/#"], 0);
    tracer.start().unwrap();
    wait_until("subscriptions", || client.subscribed().len() == 2).await;

    client.publish("sensors/a/temp", b"21.5");
    let counts = tracer.counts();
    assert_eq!(counts["sensors/+/temp"], 1);
    assert_eq!(counts["sensors/#"], 1);

    client.publish("sensors/b/hum", b"40");
    let counts = tracer.counts();
    assert_eq!(counts["sensors/+/temp"], 1);
    assert_eq!(counts["sensors/#"], 2);

    client.publish("other/topic", b"ignored");
    assert_eq!(tracer.messages().unwrap().len(), 2);

    tracer.stop().await;
}

#[tokio::test]
async fn test_counts_match_reloaded_counts() {
    let filters = ["a/+", "a/#", "b"];
    let (tracer, client, store, _dir) = setup(config(&filters));
    tracer.start().unwrap();
    wait_until("subscriptions", || client.subscribed().len() == 3).await;

    for topic in ["a/x", "a/y/z", "b", "a/x", "b/c"] {
        client.publish(topic, topic.as_bytes());
        // Distinct reception times keep every record under its own key.
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    tracer.stop().await;

    let filter = TopicFilter::new(filters.iter().map(|f| f.to_string()).collect());
    let reloaded = store.load_counts("test", "k1", &filter).unwrap();
    assert_eq!(reloaded, tracer.counts());
    assert_eq!(reloaded["a/#"], 3);
}

#[tokio::test]
async fn test_nothing_recorded_after_stop() {
    let (tracer, client, _store, _dir) = setup(config(&["a"]));
    tracer.start().unwrap();
    wait_until("subscription", || client.subscribed().len() == 1).await;
    let handler = client.subscriptions.lock().unwrap()[0].1.clone();

    tracer.stop().await;

    // A late delivery through a handler the client still held.
    handler(&IncomingMessage::new("a", b"late".to_vec()));
    assert_eq!(tracer.counts()["a"], 0);
    assert!(tracer.messages().unwrap().is_empty());
    assert_eq!(*client.unsubscribed.lock().unwrap(), vec!["a".to_string()]);
}

#[tokio::test]
async fn test_planned_tracer_is_not_running() {
    let cfg = config(&["a"]);
    let cfg = TraceConfig {
        start: Utc::now() + ChronoDuration::hours(1),
        ..cfg
    };
    let (tracer, client, _store, _dir) = setup(cfg);
    tracer.start().unwrap();

    assert!(tracer.planned());
    assert!(!tracer.running());
    assert_eq!(tracer.state(), TraceState::Planned);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(client.subscribed().is_empty());

    tracer.stop().await;
    assert_eq!(tracer.state(), TraceState::Stopped);
    assert!(!tracer.running());
    // Pure time predicate.
    assert!(tracer.planned());
}

#[tokio::test]
async fn test_immediate_tracer_is_running() {
    let (tracer, _client, _store, _dir) = setup(config(&["a"]));
    tracer.start().unwrap();

    assert!(tracer.running());
    assert!(!tracer.planned());
    assert_eq!(tracer.state(), TraceState::Running);

    tracer.stop().await;
    assert!(!tracer.running());
}

#[tokio::test]
async fn test_planned_becomes_running_at_start_time() {
    let cfg = TraceConfig {
        start: Utc::now() + ChronoDuration::milliseconds(200),
        ..config(&["a"])
    };
    let (tracer, client, _store, _dir) = setup(cfg);
    tracer.start().unwrap();
    assert_eq!(tracer.state(), TraceState::Planned);

    wait_until("running state", || tracer.state() == TraceState::Running).await;
    assert_eq!(client.subscribed(), vec!["a".to_string()]);
    assert!(tracer.running());

    tracer.stop().await;
}

#[tokio::test]
async fn test_end_time_stops_the_tracer() {
    let cfg = config(&["a", "b"]).with_end(Utc::now() + ChronoDuration::milliseconds(200));
    let (tracer, client, _store, _dir) = setup(cfg);
    tracer.start().unwrap();

    wait_until("stopped state", || tracer.state() == TraceState::Stopped).await;
    assert!(!tracer.running());
    assert!(client.subscribed().is_empty());
    assert_eq!(client.unsubscribed.lock().unwrap().len(), 2);
    assert!(client.disconnects() >= 1);
}

#[tokio::test]
async fn test_second_start_fails() {
    let (tracer, _client, _store, _dir) = setup(config(&["a"]));
    tracer.start().unwrap();

    let err = tracer.start().unwrap_err();
    assert!(matches!(err, TracerError::State(_)));
    assert_eq!(err.to_string(), "trace already running");
    assert_eq!(tracer.state(), TraceState::Running);

    tracer.stop().await;
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let (tracer, client, _store, _dir) = setup(config(&["a"]));
    tracer.start().unwrap();

    tracer.stop().await;
    tracer.stop().await;
    assert_eq!(tracer.state(), TraceState::Stopped);
    assert!(client.disconnects() >= 1);
}

#[tokio::test]
async fn test_stop_right_after_start_never_subscribes() {
    let (tracer, client, _store, _dir) = setup(config(&["a", "b"]));
    tracer.start().unwrap();
    tracer.stop().await;

    assert_eq!(tracer.state(), TraceState::Stopped);
    assert!(client.subscribed().is_empty());
    assert_eq!(client.disconnects(), 1);
}

#[tokio::test]
async fn test_stop_before_start() {
    let (tracer, client, _store, _dir) = setup(config(&["a"]));

    tracer.stop().await;
    assert_eq!(tracer.state(), TraceState::Stopped);
    assert!(matches!(tracer.start(), Err(TracerError::State(_))));
    assert!(client.subscribed().is_empty());
}

#[tokio::test]
async fn test_connection_loss_is_a_soft_stop() {
    let (tracer, client, store, _dir) = setup(config(&["a"]));
    tracer.start().unwrap();
    wait_until("subscription", || client.subscribed().len() == 1).await;
    client.publish("a", b"kept");

    client.drop_connection();

    wait_until("stopped state", || tracer.state() == TraceState::Stopped).await;
    assert!(!tracer.running());
    assert_eq!(store.messages("test", "k1").unwrap().len(), 1);
    assert_eq!(tracer.counts()["a"], 1);
    tracer.stop().await;
}

#[tokio::test]
async fn test_end_before_start_stops_immediately() {
    let cfg = config(&["a"]);
    let end = cfg.start - ChronoDuration::seconds(1);
    let (tracer, client, _store, _dir) = setup(cfg.with_end(end));

    tracer.start().unwrap();

    assert_eq!(tracer.state(), TraceState::Stopped);
    assert!(!tracer.running());
    assert_eq!(tracer.counts()["a"], 0);
    assert_eq!(client.disconnects(), 1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(client.subscribed().is_empty());
    // Returns at once.
    timeout(Duration::from_secs(1), tracer.stop()).await.unwrap();
}

#[tokio::test]
async fn test_partial_subscribe_failure_keeps_tracing() {
    let (tracer, client, _store, _dir) =
        setup_with(config(&["denied/#", "a"]), FakeClient::rejecting(&["denied/#"]));
    tracer.start().unwrap();
    wait_until("subscription", || client.subscribed().len() == 1).await;

    client.publish("a", b"x");
    assert_eq!(tracer.counts()["a"], 1);
    assert_eq!(tracer.counts()["denied/#"], 0);
    assert_eq!(tracer.state(), TraceState::Running);

    tracer.stop().await;
}

#[tokio::test]
async fn test_all_subscribes_failing_stops_the_tracer() {
    let (tracer, client, _store, _dir) =
        setup_with(config(&["x", "y"]), FakeClient::rejecting(&["x", "y"]));
    tracer.start().unwrap();

    wait_until("stopped state", || tracer.state() == TraceState::Stopped).await;
    assert!(client.disconnects() >= 1);
}

#[tokio::test]
async fn test_broker_refusal_of_one_filter_keeps_tracing() {
    let (tracer, client, _store, _dir) = setup(config(&["denied/#", "a"]));
    tracer.start().unwrap();
    wait_until("subscriptions", || client.subscribed().len() == 2).await;

    client.refuse("denied/#");
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(tracer.state(), TraceState::Running);
    client.publish("a", b"x");
    assert_eq!(tracer.counts()["a"], 1);
    assert_eq!(tracer.counts()["denied/#"], 0);

    tracer.stop().await;
}

#[tokio::test]
async fn test_broker_refusing_every_filter_stops_the_tracer() {
    let (tracer, client, store, _dir) = setup(config(&["x", "y"]));
    tracer.start().unwrap();
    wait_until("subscriptions", || client.subscribed().len() == 2).await;

    client.refuse("x");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(tracer.state(), TraceState::Running);

    client.refuse("y");
    wait_until("stopped state", || tracer.state() == TraceState::Stopped).await;
    assert!(client.disconnects() >= 1);
    assert!(!store.has_data("test", "k1").unwrap());
}

#[tokio::test]
async fn test_invalid_config_leaves_tracer_idle() {
    let mut cfg = config(&["a"]);
    cfg.key = "bad/key".to_string();
    let (tracer, _client, _store, _dir) = setup(cfg);

    assert!(matches!(tracer.start(), Err(TracerError::Config(_))));
    assert_eq!(tracer.state(), TraceState::Idle);

    let (tracer, _client, _store, _dir) = setup(config(&["a/#/b"]));
    assert!(matches!(tracer.start(), Err(TracerError::Config(_))));
    assert_eq!(tracer.state(), TraceState::Idle);
}

#[test]
fn test_start_outside_runtime_fails() {
    let (tracer, _client, _store, _dir) = setup(config(&["a"]));
    assert!(matches!(tracer.start(), Err(TracerError::State(_))));
    assert_eq!(tracer.state(), TraceState::Idle);
}

#[tokio::test]
async fn test_config_is_returned_unchanged() {
    let cfg = config(&["a", "b/+"]);
    let (tracer, _client, _store, _dir) = setup(cfg.clone());
    assert_eq!(tracer.config(), &cfg);
}
