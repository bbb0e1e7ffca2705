//! Single-station connection: transport session, state machine and the
//! topic subscription registry.
//!
//! Each station owns one long-lived MQTT session secured with its own TLS
//! identity. A supervision task polls the transport event loop, tracks the
//! connection state and dispatches inbound messages to locally registered
//! callbacks. The subscription registry is independent of connection state:
//! entries survive disconnects and are re-issued to the broker on every
//! successful (re)connect, which repairs subscriptions a session reset may
//! have dropped server-side.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rumqttc::{AsyncClient, Event, Packet, QoS};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StationConfig;
use crate::error::StationError;
use crate::event::{MessageEnvelope, SharedCallback, StationEvent};
use crate::topic::{device_id_from_pattern, topic_matches};

/// Caller-side wait window for [`StationConnection::connect`].
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const LOCK_POISONED: &str = "station lock poisoned";

/// Connection lifecycle of one station.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Offline,
}

/// Options for one publish submission.
#[derive(Debug, Clone, Copy)]
pub struct PublishOptions {
    pub qos: QoS,
    pub retain: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }
}

/// Topic pattern to callback-set registry.
///
/// Callback identity is `Arc` pointer identity, so registering the same
/// handle twice on one topic is a no-op.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    topics: HashMap<String, Vec<SharedCallback>>,
}

impl SubscriptionRegistry {
    /// Adds a callback; returns true when the topic was not registered
    /// before (i.e. a broker-level subscribe is due).
    pub(crate) fn add(&mut self, topic: &str, callback: SharedCallback) -> bool {
        let newly_registered = !self.topics.contains_key(topic);
        let callbacks = self.topics.entry(topic.to_owned()).or_default();
        if !callbacks
            .iter()
            .any(|existing| Arc::ptr_eq(existing, &callback))
        {
            callbacks.push(callback);
        }
        newly_registered
    }

    /// Removes one callback; returns true when that emptied the topic's set
    /// and the entry was dropped (i.e. a broker-level unsubscribe is due).
    pub(crate) fn remove_callback(&mut self, topic: &str, callback: &SharedCallback) -> bool {
        let Some(callbacks) = self.topics.get_mut(topic) else {
            return false;
        };
        callbacks.retain(|existing| !Arc::ptr_eq(existing, callback));
        if callbacks.is_empty() {
            self.topics.remove(topic);
            return true;
        }
        false
    }

    /// Drops a whole topic entry regardless of remaining callbacks.
    pub(crate) fn remove_topic(&mut self, topic: &str) {
        self.topics.remove(topic);
    }

    /// Distinct registered topics, one broker subscribe each on reconnect.
    pub(crate) fn topics(&self) -> Vec<String> {
        self.topics.keys().cloned().collect()
    }

    /// Callbacks to invoke for an actual inbound topic: the exact-topic set
    /// first, then every other registered pattern that wildcard-matches.
    pub(crate) fn matches(&self, topic: &str) -> Vec<SharedCallback> {
        let mut matched = Vec::new();
        if let Some(exact) = self.topics.get(topic) {
            matched.extend(exact.iter().cloned());
        }
        for (pattern, callbacks) in &self.topics {
            if pattern != topic && topic_matches(pattern, topic) {
                matched.extend(callbacks.iter().cloned());
            }
        }
        matched
    }

    /// Concrete device ids appearing in `devices/<id>/...` patterns.
    pub(crate) fn device_ids(&self) -> HashSet<String> {
        self.topics
            .keys()
            .filter_map(|pattern| device_id_from_pattern(pattern))
            .map(str::to_owned)
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn callback_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, Vec::len)
    }
}

/// Invokes each callback, logging failures instead of propagating them so
/// one faulty handler cannot block its siblings.
fn invoke_callbacks(callbacks: &[SharedCallback], envelope: &MessageEnvelope) {
    for callback in callbacks {
        if let Err(err) = (**callback)(envelope) {
            warn!(
                station_id = %envelope.station_id,
                topic = %envelope.topic,
                %err,
                "message callback failed"
            );
        }
    }
}

#[derive(Clone)]
struct ActiveLink {
    client: AsyncClient,
    cancel: CancellationToken,
}

struct Shared {
    station_id: String,
    state: watch::Sender<ConnectionState>,
    registry: Mutex<SubscriptionRegistry>,
    link: Mutex<Option<ActiveLink>>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn client(&self) -> Option<AsyncClient> {
        self.link
            .lock()
            .expect(LOCK_POISONED)
            .as_ref()
            .map(|link| link.client.clone())
    }
}

/// One secured connection to a station's broker endpoint.
///
/// Created by the manager; the transport session opens as soon as the
/// supervision task is spawned. Must be constructed inside a tokio runtime.
pub struct StationConnection {
    config: StationConfig,
    shared: Arc<Shared>,
    events: mpsc::Sender<StationEvent>,
}

impl StationConnection {
    /// Builds the connection and opens its transport session. Events are
    /// reported into `events`, tagged with this station's id.
    pub fn new(
        config: StationConfig,
        events: mpsc::Sender<StationEvent>,
    ) -> Result<Self, StationError> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(Shared {
            station_id: config.station_id.clone(),
            state,
            registry: Mutex::new(SubscriptionRegistry::default()),
            link: Mutex::new(None),
        });
        let connection = Self {
            config,
            shared,
            events,
        };
        connection.spawn_link()?;
        Ok(connection)
    }

    pub fn station_id(&self) -> &str {
        &self.config.station_id
    }

    pub fn config(&self) -> &StationConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.current_state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Waits until the transport session is established.
    ///
    /// Idempotent: resolves immediately when already connected. Otherwise
    /// races the transport's connect/error signal against a fixed 10 s
    /// window. A timeout abandons only this wait; the underlying attempt
    /// keeps running and a late success is not reported separately.
    pub async fn connect(&self) -> Result<(), StationError> {
        if self.shared.link.lock().expect(LOCK_POISONED).is_none() {
            self.spawn_link()?;
        }

        let mut state_rx = self.shared.state.subscribe();
        if *state_rx.borrow() == ConnectionState::Connected {
            return Ok(());
        }

        let wait = async {
            loop {
                if state_rx.changed().await.is_err() {
                    return Err(StationError::ConnectFailed(
                        "connection state channel closed".to_owned(),
                    ));
                }
                let state = *state_rx.borrow_and_update();
                match state {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Reconnecting | ConnectionState::Offline => {
                        return Err(StationError::ConnectFailed(format!(
                            "transport error while connecting to {}:{}",
                            self.config.host, self.config.port
                        )));
                    }
                    ConnectionState::Disconnected => {
                        // The supervision task exited under us (a racing
                        // disconnect); reopen the session and keep waiting.
                        if self.shared.link.lock().expect(LOCK_POISONED).is_none() {
                            self.spawn_link()?;
                        }
                    }
                    ConnectionState::Connecting => {}
                }
            }
        };

        match tokio::time::timeout(CONNECT_TIMEOUT, wait).await {
            Ok(result) => result,
            Err(_) => Err(StationError::ConnectTimeout(CONNECT_TIMEOUT)),
        }
    }

    /// Requests a graceful transport shutdown. Registered subscriptions
    /// stay in memory and are replayed on the next connect.
    pub async fn disconnect(&self) {
        let link = self.shared.link.lock().expect(LOCK_POISONED).clone();
        if let Some(link) = link {
            if let Err(err) = link.client.disconnect().await {
                debug!(station_id = %self.station_id(), %err, "disconnect request not delivered");
            }
            link.cancel.cancel();
        }
    }

    /// Tears the session down without the graceful DISCONNECT exchange.
    /// Used when the station is being removed from its manager.
    pub fn shutdown(&self) {
        let link = self.shared.link.lock().expect(LOCK_POISONED).clone();
        if let Some(link) = link {
            link.cancel.cancel();
        }
    }

    /// Registers a callback for a topic pattern.
    ///
    /// The first registration of a topic issues a broker-level subscribe
    /// when currently connected; identical callback handles deduplicate.
    pub async fn subscribe(
        &self,
        topic: &str,
        callback: SharedCallback,
    ) -> Result<(), StationError> {
        let newly_registered = self
            .shared
            .registry
            .lock()
            .expect(LOCK_POISONED)
            .add(topic, callback);
        if newly_registered && self.is_connected() {
            if let Some(client) = self.shared.client() {
                client.subscribe(topic, QoS::AtMostOnce).await?;
                debug!(station_id = %self.station_id(), topic, "subscribed at broker");
            }
        }
        Ok(())
    }

    /// Removes a callback, or the whole topic entry when no callback is
    /// given. The broker-level unsubscribe is issued when connected and
    /// either the topic's set emptied or the removal was untargeted.
    pub async fn unsubscribe(
        &self,
        topic: &str,
        callback: Option<&SharedCallback>,
    ) -> Result<(), StationError> {
        let unsubscribe_broker = {
            let mut registry = self.shared.registry.lock().expect(LOCK_POISONED);
            match callback {
                Some(callback) => registry.remove_callback(topic, callback),
                None => {
                    registry.remove_topic(topic);
                    true
                }
            }
        };
        if unsubscribe_broker && self.is_connected() {
            if let Some(client) = self.shared.client() {
                client.unsubscribe(topic).await?;
                debug!(station_id = %self.station_id(), topic, "unsubscribed at broker");
            }
        }
        Ok(())
    }

    /// Submits one message. Delivery guarantees beyond submission are the
    /// transport's responsibility; nothing is retried here.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<crate::event::Payload>,
        options: PublishOptions,
    ) -> Result<(), StationError> {
        let wire = payload.into().to_wire()?;
        let client = self.shared.client().ok_or(StationError::Disconnected)?;
        client
            .publish(topic, options.qos, options.retain, wire)
            .await?;
        Ok(())
    }

    /// Apparent device ids, derived from registered `devices/<id>/...`
    /// patterns with a concrete id.
    pub fn connected_devices(&self) -> HashSet<String> {
        self.shared
            .registry
            .lock()
            .expect(LOCK_POISONED)
            .device_ids()
    }

    fn spawn_link(&self) -> Result<(), StationError> {
        let options = self.config.mqtt_options()?;
        let (client, eventloop) = AsyncClient::new(options, 16);
        let cancel = CancellationToken::new();
        *self.shared.link.lock().expect(LOCK_POISONED) = Some(ActiveLink {
            client: client.clone(),
            cancel: cancel.clone(),
        });
        info!(
            station_id = %self.station_id(),
            host = %self.config.host,
            port = self.config.port,
            "opening station transport session"
        );
        tokio::spawn(run_link(
            Arc::clone(&self.shared),
            eventloop,
            client,
            self.events.clone(),
            self.config.reconnect_period(),
            cancel,
        ));
        Ok(())
    }
}

async fn emit(events: &mpsc::Sender<StationEvent>, event: StationEvent) {
    if events.send(event).await.is_err() {
        debug!("aggregated event sink closed, event dropped");
    }
}

/// Supervision loop for one transport session. Runs until cancelled.
async fn run_link(
    shared: Arc<Shared>,
    mut eventloop: rumqttc::EventLoop,
    client: AsyncClient,
    events: mpsc::Sender<StationEvent>,
    reconnect_period: Duration,
    cancel: CancellationToken,
) {
    let station_id = shared.station_id.clone();
    shared.set_state(ConnectionState::Connecting);

    loop {
        let polled = tokio::select! {
            _ = cancel.cancelled() => break,
            polled = eventloop.poll() => polled,
        };

        match polled {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                shared.set_state(ConnectionState::Connected);
                info!(%station_id, "station connected");
                emit(
                    &events,
                    StationEvent::Connect {
                        station_id: station_id.clone(),
                    },
                )
                .await;
                resubscribe_all(&shared, &client, &station_id).await;
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                handle_publish(&shared, &events, &publish.topic, &publish.payload).await;
            }
            Ok(_) => {}
            Err(err) => {
                let was_connected = shared.current_state() == ConnectionState::Connected;
                warn!(%station_id, %err, "transport error");
                emit(
                    &events,
                    StationEvent::Error {
                        station_id: station_id.clone(),
                        error: err.to_string(),
                    },
                )
                .await;
                if was_connected {
                    shared.set_state(ConnectionState::Offline);
                    emit(
                        &events,
                        StationEvent::Offline {
                            station_id: station_id.clone(),
                        },
                    )
                    .await;
                } else {
                    // Flip before the reconnect pause so a pending connect
                    // wait rejects on the error signal, not on its timeout.
                    shared.set_state(ConnectionState::Reconnecting);
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(reconnect_period) => {}
                }
                shared.set_state(ConnectionState::Reconnecting);
                emit(
                    &events,
                    StationEvent::Reconnect {
                        station_id: station_id.clone(),
                    },
                )
                .await;
            }
        }
    }

    // Clear the link before flipping the state: anyone reacting to the
    // Disconnected transition must observe the session as gone.
    *shared.link.lock().expect(LOCK_POISONED) = None;
    shared.set_state(ConnectionState::Disconnected);
    info!(%station_id, "station transport session closed");
    emit(&events, StationEvent::Disconnect { station_id }).await;
}

/// Decodes one inbound PUBLISH, feeds every matching callback and emits
/// exactly one aggregated message event, however many handlers fired.
async fn handle_publish(
    shared: &Shared,
    events: &mpsc::Sender<StationEvent>,
    topic: &str,
    payload: &[u8],
) {
    let envelope = MessageEnvelope::from_wire(&shared.station_id, topic, payload);
    let callbacks = shared.registry.lock().expect(LOCK_POISONED).matches(topic);
    invoke_callbacks(&callbacks, &envelope);
    emit(events, StationEvent::Message(envelope)).await;
}

/// Replays every distinct registered topic to the broker after a
/// (re)connect, once per topic regardless of callback count.
async fn resubscribe_all(shared: &Shared, client: &AsyncClient, station_id: &str) {
    let topics = shared.registry.lock().expect(LOCK_POISONED).topics();
    for topic in topics {
        match client.subscribe(&topic, QoS::AtMostOnce).await {
            Ok(()) => debug!(%station_id, topic, "re-subscribed after connect"),
            Err(err) => warn!(%station_id, topic, %err, "re-subscribe failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportProtocol;
    use crate::event::{callback, Payload};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn envelope(topic: &str) -> MessageEnvelope {
        MessageEnvelope::from_wire("station-1", topic, b"{\"v\": 1}")
    }

    /// A station pointing at a closed local port, with a reconnect pause
    /// well past the connect-wait window.
    fn unreachable_station() -> StationConfig {
        StationConfig {
            station_id: "station-1".to_owned(),
            client_identity: "client-station-1".to_owned(),
            host: "127.0.0.1".to_owned(),
            port: 1,
            protocol: TransportProtocol::Mqtt,
            key_file: None,
            cert_file: None,
            ca_file: None,
            reconnect_ms: 20_000,
            keep_alive_secs: 5,
        }
    }

    #[test]
    fn first_registration_only_reports_new_topic() {
        let mut registry = SubscriptionRegistry::default();
        let first = callback(|_| Ok(()));
        let second = callback(|_| Ok(()));
        assert!(registry.add("devices/ABC/data", first));
        assert!(!registry.add("devices/ABC/data", second));
        assert_eq!(registry.callback_count("devices/ABC/data"), 2);
    }

    #[test]
    fn identical_callback_handles_deduplicate() {
        let mut registry = SubscriptionRegistry::default();
        let handle = callback(|_| Ok(()));
        registry.add("devices/ABC/data", Arc::clone(&handle));
        registry.add("devices/ABC/data", handle);
        assert_eq!(registry.callback_count("devices/ABC/data"), 1);
    }

    #[test]
    fn removing_last_callback_drops_topic_entry() {
        let mut registry = SubscriptionRegistry::default();
        let first = callback(|_| Ok(()));
        let second = callback(|_| Ok(()));
        registry.add("devices/ABC/data", Arc::clone(&first));
        registry.add("devices/ABC/data", Arc::clone(&second));

        assert!(!registry.remove_callback("devices/ABC/data", &first));
        assert!(registry.remove_callback("devices/ABC/data", &second));
        assert!(registry.topics().is_empty());
    }

    #[test]
    fn topics_are_distinct_regardless_of_callback_count() {
        let mut registry = SubscriptionRegistry::default();
        registry.add("devices/ABC/data", callback(|_| Ok(())));
        registry.add("devices/ABC/data", callback(|_| Ok(())));
        registry.add("devices/+/status", callback(|_| Ok(())));
        let mut topics = registry.topics();
        topics.sort();
        assert_eq!(topics, vec!["devices/+/status", "devices/ABC/data"]);
    }

    #[test]
    fn exact_subscribers_fire_before_wildcard_subscribers() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut registry = SubscriptionRegistry::default();

        let exact_order = Arc::clone(&order);
        registry.add(
            "devices/ABC/data",
            callback(move |_| {
                exact_order.lock().unwrap().push("exact");
                Ok(())
            }),
        );
        let wildcard_order = Arc::clone(&order);
        registry.add(
            "devices/+/data",
            callback(move |_| {
                wildcard_order.lock().unwrap().push("wildcard");
                Ok(())
            }),
        );

        invoke_callbacks(
            &registry.matches("devices/ABC/data"),
            &envelope("devices/ABC/data"),
        );
        assert_eq!(*order.lock().unwrap(), vec!["exact", "wildcard"]);
    }

    #[test]
    fn deeper_topic_does_not_match_single_level_wildcard() {
        let mut registry = SubscriptionRegistry::default();
        registry.add("devices/+/data", callback(|_| Ok(())));
        assert!(registry.matches("devices/ABC/data/extra").is_empty());
    }

    #[test]
    fn failing_callback_does_not_block_siblings() {
        let delivered = Arc::new(AtomicUsize::new(0));
        let mut registry = SubscriptionRegistry::default();
        registry.add("devices/ABC/data", callback(|_| Err("boom".into())));
        let counter = Arc::clone(&delivered);
        registry.add(
            "devices/+/data",
            callback(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        invoke_callbacks(
            &registry.matches("devices/ABC/data"),
            &envelope("devices/ABC/data"),
        );
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn device_ids_collect_concrete_patterns_only() {
        let mut registry = SubscriptionRegistry::default();
        registry.add("devices/ABC/data", callback(|_| Ok(())));
        registry.add("devices/ABC/status", callback(|_| Ok(())));
        registry.add("devices/+/data", callback(|_| Ok(())));
        registry.add("vendor/SER1/command", callback(|_| Ok(())));
        assert_eq!(
            registry.device_ids(),
            HashSet::from(["ABC".to_owned()])
        );
    }

    #[tokio::test]
    async fn connect_rejects_on_transport_error_before_timeout() {
        let (events, _events_rx) = mpsc::channel(32);
        let station = StationConnection::new(unreachable_station(), events).unwrap();
        // The reconnect pause (20 s) exceeds the connect window, so only an
        // immediate error signal can produce this rejection.
        assert!(matches!(
            station.connect().await,
            Err(StationError::ConnectFailed(_))
        ));
    }

    #[tokio::test]
    async fn connect_after_disconnect_respawns_the_session() {
        let (events, _events_rx) = mpsc::channel(32);
        let station = StationConnection::new(unreachable_station(), events).unwrap();
        let _ = station.connect().await;
        station.disconnect().await;
        // Even when the old supervision task is still winding down, a new
        // session opens and the wait settles on its error signal.
        assert!(matches!(
            station.connect().await,
            Err(StationError::ConnectFailed(_))
        ));
    }

    #[tokio::test]
    async fn inbound_publish_emits_one_aggregated_event_after_callbacks() {
        let (state, _state_rx) = watch::channel(ConnectionState::Connected);
        let shared = Shared {
            station_id: "station-1".to_owned(),
            state,
            registry: Mutex::new(SubscriptionRegistry::default()),
            link: Mutex::new(None),
        };
        let exact_hits = Arc::new(AtomicUsize::new(0));
        let wildcard_hits = Arc::new(AtomicUsize::new(0));
        {
            let mut registry = shared.registry.lock().unwrap();
            let exact = Arc::clone(&exact_hits);
            registry.add(
                "devices/ABC/data",
                callback(move |_| {
                    exact.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            );
            let wildcard = Arc::clone(&wildcard_hits);
            registry.add(
                "devices/+/data",
                callback(move |_| {
                    wildcard.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            );
        }

        let (events_tx, mut events_rx) = mpsc::channel(8);
        handle_publish(&shared, &events_tx, "devices/ABC/data", b"{\"temp\": 20}").await;

        assert_eq!(exact_hits.load(Ordering::SeqCst), 1);
        assert_eq!(wildcard_hits.load(Ordering::SeqCst), 1);
        match events_rx.recv().await {
            Some(StationEvent::Message(envelope)) => {
                assert_eq!(envelope.topic, "devices/ABC/data");
                assert_eq!(envelope.device_id.as_deref(), Some("ABC"));
            }
            other => panic!("expected a message event, got {other:?}"),
        }
        // Both handlers fired, yet exactly one aggregated event was emitted.
        assert!(events_rx.try_recv().is_err());
    }

    #[test]
    fn publish_options_default_to_qos0_no_retain() {
        let options = PublishOptions::default();
        assert_eq!(options.qos, QoS::AtMostOnce);
        assert!(!options.retain);
    }

    #[test]
    fn outbound_wire_form_carries_no_annotations() {
        let wire = Payload::Json(json!({"command": "REBOOT"})).to_wire().unwrap();
        let decoded: serde_json::Value = serde_json::from_slice(&wire).unwrap();
        assert_eq!(decoded, json!({"command": "REBOOT"}));
    }
}
