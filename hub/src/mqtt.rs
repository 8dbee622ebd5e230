use crate::auth::TokenSigner;
use crate::db;
use crate::errors::{Error, Result};
use crate::ingest::IngestJob;
use crate::metrics::{
    CHANNEL_FULL_TOTAL, MQTT_ACCEPTED_TOTAL, MQTT_MESSAGES_TOTAL, MQTT_REJECTED_TOTAL,
};
use crate::model::Envelope;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use sqlx::PgPool;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

const TOPIC_PREFIX: &str = "devices/";
const REFRESH_INTERVAL_SECS: u64 = 30;

/// Broker connection lifecycle. rumqttc reconnects on its own; this state
/// only records where the loop currently is so re-subscription happens at
/// the right moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// In-memory map of device id to its broker topic. Rebuilt from the device
/// table at startup and extended while connected; never persisted.
pub struct SubscriptionRegistry {
    topics: HashMap<i64, String>,
    state: ConnectionState,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            topics: HashMap::new(),
            state: ConnectionState::Disconnected,
        }
    }

    pub fn topic_for(device_id: i64) -> String {
        format!("{}{}", TOPIC_PREFIX, device_id)
    }

    /// Starts tracking a device. Returns the topic if it was not tracked
    /// before, None if already present (re-subscribing is a broker-level
    /// no-op, so callers skip it entirely).
    pub fn track(&mut self, device_id: i64) -> Option<String> {
        if self.topics.contains_key(&device_id) {
            return None;
        }
        let topic = Self::topic_for(device_id);
        self.topics.insert(device_id, topic.clone());
        Some(topic)
    }

    /// Devices present in `ids` but not yet tracked.
    pub fn missing(&self, ids: &[i64]) -> Vec<i64> {
        ids.iter()
            .copied()
            .filter(|id| !self.topics.contains_key(id))
            .collect()
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.topics.values().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn set_state(&mut self, state: ConnectionState) {
        if state != self.state {
            debug!("Broker connection: {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }
}

/// Extracts the device id from a per-device topic. The topic, not the
/// token, is the authoritative routing key.
pub fn device_id_from_topic(topic: &str) -> Option<i64> {
    let rest = topic.strip_prefix(TOPIC_PREFIX)?;
    if rest.contains('/') {
        return None;
    }
    rest.parse().ok()
}

/// Validates one inbound publish: topic shape, envelope shape, token
/// signature and expiry, and that the token's subject matches the topic's
/// device id. A valid token for device A published on device B's topic is
/// refused.
pub fn authorize_publish(signer: &TokenSigner, topic: &str, payload: &[u8]) -> Result<IngestJob> {
    let device_id = device_id_from_topic(topic)
        .ok_or_else(|| Error::Validation(format!("Unroutable topic: {}", topic)))?;

    let envelope: Envelope = serde_json::from_slice(payload)?;

    let token_device_id = signer.verify_device_token(&envelope.token)?;
    if token_device_id != device_id {
        return Err(Error::Forbidden);
    }

    Ok(IngestJob {
        device_id,
        reading: envelope.data,
    })
}

/// Runs the broker connection: subscribe to one topic per known device,
/// hand each verified reading off to the ingest worker, and keep the
/// subscription set current as devices are registered.
///
/// The event loop never does storage writes inline; the bounded channel is
/// the only crossing into the ingestion path.
pub async fn run_mqtt(
    broker: String,
    port: u16,
    client_id: String,
    signer: TokenSigner,
    pool: PgPool,
    tx: mpsc::Sender<IngestJob>,
) -> Result<()> {
    info!("Connecting to MQTT broker at {}:{}", broker, port);

    let mut mqtt_options = MqttOptions::new(client_id, broker, port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(false);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 10000);

    let mut registry = SubscriptionRegistry::new();
    registry.set_state(ConnectionState::Connecting);

    for device_id in db::active_device_ids(&pool).await? {
        if let Some(topic) = registry.track(device_id) {
            client.subscribe(&topic, QoS::AtMostOnce).await?;
        }
    }
    info!("Subscribed to {} device topics", registry.len());

    let mut refresh = interval(Duration::from_secs(REFRESH_INTERVAL_SECS));

    loop {
        tokio::select! {
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    registry.set_state(ConnectionState::Connected);
                    resubscribe_all(&client, &registry).await;
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    MQTT_MESSAGES_TOTAL.inc();
                    debug!(
                        "Received message on topic {}, size: {} bytes",
                        publish.topic,
                        publish.payload.len()
                    );

                    match authorize_publish(&signer, &publish.topic, &publish.payload) {
                        Ok(job) => {
                            if dispatch(&tx, job).await.is_ok() {
                                MQTT_ACCEPTED_TOTAL.inc();
                            } else {
                                error!("Ingest channel closed, dropping message");
                                MQTT_REJECTED_TOTAL.inc();
                            }
                        }
                        // No response channel exists on this path: log,
                        // count, drop.
                        Err(e) => {
                            MQTT_REJECTED_TOTAL.inc();
                            warn!("Dropping message on {}: {}", publish.topic, e);
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT error: {}", e);
                    registry.set_state(ConnectionState::Disconnected);
                    // rumqttc reconnects on the next poll
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    registry.set_state(ConnectionState::Connecting);
                }
            },

            _ = refresh.tick() => {
                // No point subscribing while the connection is down; the
                // next ConnAck re-subscribes everything anyway.
                if registry.state() == ConnectionState::Connected {
                    if let Err(e) = refresh_subscriptions(&client, &pool, &mut registry).await {
                        warn!("Subscription refresh failed: {}", e);
                    }
                }
            }
        }
    }
}

/// Re-issues every subscription after a (re)connect. The broker treats a
/// duplicate subscribe as a no-op, so this is safe to run on each ConnAck.
async fn resubscribe_all(client: &AsyncClient, registry: &SubscriptionRegistry) {
    for topic in registry.topics() {
        if let Err(e) = client.subscribe(topic, QoS::AtMostOnce).await {
            warn!("Failed to subscribe to {}: {}", topic, e);
        }
    }
    info!("Re-subscribed to {} device topics", registry.len());
}

/// Picks up devices registered since the last refresh.
async fn refresh_subscriptions(
    client: &AsyncClient,
    pool: &PgPool,
    registry: &mut SubscriptionRegistry,
) -> Result<()> {
    let ids = db::active_device_ids(pool).await?;
    for device_id in registry.missing(&ids) {
        if let Some(topic) = registry.track(device_id) {
            info!("Subscribing to new device topic {}", topic);
            client.subscribe(&topic, QoS::AtMostOnce).await?;
        }
    }
    Ok(())
}

/// Non-blocking handoff to the ingest worker. Prefers try_send so the
/// network loop is never parked on a full channel; falls back to a short
/// sleep plus blocking send under sustained backpressure.
async fn dispatch(tx: &mpsc::Sender<IngestJob>, job: IngestJob) -> Result<()> {
    match tx.try_send(job) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(job)) => {
            CHANNEL_FULL_TOTAL.inc();
            debug!("Ingest channel full, using blocking send");
            tokio::time::sleep(Duration::from_millis(1)).await;
            tx.send(job).await.map_err(|_| Error::ChannelSend)
        }
        Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::ChannelSend),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::Algorithm;

    fn signer() -> TokenSigner {
        TokenSigner::new("test-secret", Algorithm::HS256, 15)
    }

    fn envelope(token: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "token": token,
            "data": {"reading_type": "temp", "value": 21.5}
        }))
        .unwrap()
    }

    #[test]
    fn test_device_id_from_topic() {
        assert_eq!(device_id_from_topic("devices/7"), Some(7));
        assert_eq!(device_id_from_topic("devices/123456"), Some(123456));
        assert_eq!(device_id_from_topic("devices/"), None);
        assert_eq!(device_id_from_topic("devices/abc"), None);
        assert_eq!(device_id_from_topic("devices/7/extra"), None);
        assert_eq!(device_id_from_topic("telemetry/7"), None);
    }

    #[test]
    fn test_registry_track_is_idempotent() {
        let mut registry = SubscriptionRegistry::new();
        assert_eq!(registry.track(7), Some("devices/7".to_string()));
        assert_eq!(registry.track(7), None);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_missing() {
        let mut registry = SubscriptionRegistry::new();
        registry.track(1);
        registry.track(2);
        assert_eq!(registry.missing(&[1, 2, 3, 4]), vec![3, 4]);
        assert!(registry.missing(&[1, 2]).is_empty());
    }

    #[test]
    fn test_registry_state_transitions() {
        let mut registry = SubscriptionRegistry::new();
        assert_eq!(registry.state(), ConnectionState::Disconnected);
        registry.set_state(ConnectionState::Connecting);
        registry.set_state(ConnectionState::Connected);
        assert_eq!(registry.state(), ConnectionState::Connected);
        registry.set_state(ConnectionState::Disconnected);
        assert_eq!(registry.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_authorize_publish_accepts_matching_token() {
        let signer = signer();
        let token = signer.mint_device_token(7).unwrap();
        let job = authorize_publish(&signer, "devices/7", &envelope(&token)).unwrap();
        assert_eq!(job.device_id, 7);
        assert_eq!(job.reading.reading_type, "temp");
    }

    #[test]
    fn test_authorize_publish_rejects_mismatched_device() {
        let signer = signer();
        // Valid token for device 8 published on device 7's topic.
        let token = signer.mint_device_token(8).unwrap();
        assert!(matches!(
            authorize_publish(&signer, "devices/7", &envelope(&token)),
            Err(Error::Forbidden)
        ));
    }

    #[test]
    fn test_authorize_publish_rejects_bad_token() {
        let signer = signer();
        assert!(matches!(
            authorize_publish(&signer, "devices/7", &envelope("garbage")),
            Err(Error::InvalidToken)
        ));
    }

    #[test]
    fn test_authorize_publish_rejects_malformed_json() {
        let signer = signer();
        assert!(authorize_publish(&signer, "devices/7", b"not json").is_err());
    }

    #[test]
    fn test_authorize_publish_rejects_missing_keys() {
        let signer = signer();
        let payload = br#"{"data": {"reading_type": "temp", "value": 1.0}}"#;
        assert!(authorize_publish(&signer, "devices/7", payload).is_err());
    }

    #[test]
    fn test_authorize_publish_rejects_bad_topic() {
        let signer = signer();
        let token = signer.mint_device_token(7).unwrap();
        assert!(authorize_publish(&signer, "devices/not-a-number", &envelope(&token)).is_err());
    }

    #[test]
    fn test_dispatch_channel_closed() {
        tokio_test::block_on(async {
            let (tx, rx) = mpsc::channel(1);
            drop(rx);
            let job = IngestJob {
                device_id: 7,
                reading: crate::model::ReadingIn {
                    reading_type: "temp".to_string(),
                    value: 1.0,
                    timestamp: None,
                },
            };
            assert!(dispatch(&tx, job).await.is_err());
        });
    }

    #[test]
    fn test_dispatch_delivers() {
        tokio_test::block_on(async {
            let (tx, mut rx) = mpsc::channel(4);
            let job = IngestJob {
                device_id: 7,
                reading: crate::model::ReadingIn {
                    reading_type: "temp".to_string(),
                    value: 1.0,
                    timestamp: None,
                },
            };
            dispatch(&tx, job).await.unwrap();
            let received = rx.recv().await.unwrap();
            assert_eq!(received.device_id, 7);
        });
    }
}
