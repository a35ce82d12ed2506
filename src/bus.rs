//! ==============================================================================
//! bus.rs - environment sensors over mqtt
//! ==============================================================================
//!
//! purpose:
//!     subscribes to the rig's topic (default `secador/datos`) and merges every
//!     json payload into the store. the publisher sends whatever it has
//!     (temperatures, humidities, radiation, thermocouples, fan relays); only
//!     keys in the schema land, see domain.rs.
//!
//! failure policy:
//!     - malformed payload: dropped, counted, subscription untouched.
//!     - broker down / connection lost: counted, wait `retry_seconds`, poll
//!       again. rumqttc reconnects on the next poll and we resubscribe on
//!       every ConnAck, so a broker restart heals by itself.
//!
//! relationships:
//!     - used by: aggregator.rs (spawns BusChannel::run)
//!     - writes: store.rs, health.rs
//!
//! ==============================================================================

use crate::aggregator::RunFlag;
use crate::config::BusConfig;
use crate::domain::SensorUpdate;
use crate::error::BusError;
use crate::health::{Health, LinkState};
use crate::store::StateStore;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, SubscribeReasonCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// what a bus source hands to the ingestion loop
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BusEvent {
    /// (re)connected and subscribed
    Connected,
    /// raw payload of one message on the topic
    Message(Vec<u8>),
}

#[async_trait]
pub trait BusSource: Send {
    async fn next_event(&mut self) -> Result<BusEvent, BusError>;

    /// tear the subscription down
    async fn close(&mut self) {}
}

// ==============================================================================
// mqtt source
// ==============================================================================

pub struct MqttSource {
    client: AsyncClient,
    eventloop: EventLoop,
    topic: String,
    needs_subscribe: bool,
}

impl MqttSource {
    pub fn new(config: &BusConfig) -> Self {
        let mut options = MqttOptions::new(config.client_id.as_str(), config.host.as_str(), config.port);
        options.set_keep_alive(Duration::from_secs(config.keepalive_seconds));

        let (client, eventloop) = AsyncClient::new(options, 10);
        Self {
            client,
            eventloop,
            topic: config.topic.clone(),
            needs_subscribe: false,
        }
    }

    fn subscribe(&mut self) -> Result<(), BusError> {
        self.client
            .try_subscribe(self.topic.as_str(), QoS::AtMostOnce)
            .map_err(|e| BusError::Connection(e.to_string()))?;
        self.needs_subscribe = false;
        Ok(())
    }
}

#[async_trait]
impl BusSource for MqttSource {
    async fn next_event(&mut self) -> Result<BusEvent, BusError> {
        if self.needs_subscribe {
            self.subscribe()?;
        }

        loop {
            let event = self
                .eventloop
                .poll()
                .await
                .map_err(|e| BusError::Connection(e.to_string()))?;

            match event {
                Event::Incoming(Packet::ConnAck(_)) => {
                    // clean session: subscriptions do not survive a reconnect
                    self.subscribe()?;
                }
                Event::Incoming(Packet::SubAck(ack)) => {
                    if ack.return_codes.iter().any(|c| matches!(c, SubscribeReasonCode::Failure)) {
                        self.needs_subscribe = true;
                        return Err(BusError::SubscribeRejected { topic: self.topic.clone() });
                    }
                    return Ok(BusEvent::Connected);
                }
                // only one topic is subscribed, so every publish is ours
                Event::Incoming(Packet::Publish(publish)) => {
                    return Ok(BusEvent::Message(publish.payload.to_vec()));
                }
                _ => {}
            }
        }
    }

    async fn close(&mut self) {
        if self.client.try_disconnect().is_ok() {
            // give the eventloop a moment to flush the disconnect
            let _ = tokio::time::timeout(Duration::from_millis(200), self.eventloop.poll()).await;
        }
    }
}

// ==============================================================================
// in-process source
// ==============================================================================
// feeds payloads through a tokio channel. used for replaying captured payloads
// and in tests; dropping every sender ends the stream.

pub struct ChannelSource {
    rx: mpsc::Receiver<Vec<u8>>,
    announced: bool,
}

impl ChannelSource {
    pub fn new_pair(capacity: usize) -> (mpsc::Sender<Vec<u8>>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { rx, announced: false })
    }
}

#[async_trait]
impl BusSource for ChannelSource {
    async fn next_event(&mut self) -> Result<BusEvent, BusError> {
        if !self.announced {
            self.announced = true;
            return Ok(BusEvent::Connected);
        }
        match self.rx.recv().await {
            Some(payload) => Ok(BusEvent::Message(payload)),
            None => Err(BusError::Closed),
        }
    }

    async fn close(&mut self) {
        self.rx.close();
    }
}

// ==============================================================================
// decoding + ingestion loop
// ==============================================================================

/// decode one bus payload into a partial update
pub fn decode_payload(payload: &[u8]) -> Result<SensorUpdate, BusError> {
    let value: serde_json::Value = serde_json::from_slice(payload)?;
    if !value.is_object() {
        return Err(BusError::NotAnObject);
    }
    Ok(serde_json::from_value(value)?)
}

pub struct BusChannel {
    source: Box<dyn BusSource>,
    store: Arc<StateStore>,
    health: Arc<Health>,
    flag: Arc<RunFlag>,
    retry: Duration,
}

impl BusChannel {
    pub fn new(
        config: &BusConfig,
        source: Box<dyn BusSource>,
        store: Arc<StateStore>,
        health: Arc<Health>,
        flag: Arc<RunFlag>,
    ) -> Self {
        Self {
            source,
            store,
            health,
            flag,
            retry: config.retry(),
        }
    }

    pub async fn run(mut self) {
        info!("bus ingestion started");
        self.health.set_bus_state(LinkState::Connecting);

        let mut failures: u64 = 0;

        while self.flag.is_running() {
            let event = tokio::select! {
                event = self.source.next_event() => event,
                _ = self.flag.stopped() => break,
            };

            match event {
                Ok(BusEvent::Connected) => {
                    info!(after_failures = failures, "bus connected");
                    failures = 0;
                    self.health.set_bus_state(LinkState::Connected);
                }
                Ok(BusEvent::Message(payload)) => self.handle_payload(&payload),
                Err(BusError::Closed) => {
                    info!("bus source closed");
                    break;
                }
                Err(e) => {
                    Health::bump(&self.health.bus_connect_failures);
                    self.health.set_bus_state(LinkState::Disconnected);
                    failures += 1;
                    if failures == 1 {
                        warn!("bus unavailable, retrying: {e}");
                    } else {
                        debug!(attempt = failures, "bus still unavailable: {e}");
                    }
                    self.flag.sleep(self.retry).await;
                    self.health.set_bus_state(LinkState::Connecting);
                }
            }
        }

        self.source.close().await;
        self.health.set_bus_state(LinkState::Stopped);
        info!("bus ingestion stopped");
    }

    /// decode and merge one payload; malformed payloads are dropped
    pub fn handle_payload(&self, payload: &[u8]) {
        let update = match decode_payload(payload) {
            Ok(update) => update,
            Err(e) => {
                Health::bump(&self.health.bus_decode_errors);
                debug!(len = payload.len(), "dropping bus payload: {e}");
                return;
            }
        };
        Health::bump(&self.health.bus_messages);

        if self.flag.is_running() {
            let written = self.store.update(update);
            trace!(written, "bus update applied");
        }
    }
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn channel_bus(retry_seconds: u64) -> (mpsc::Sender<Vec<u8>>, BusChannel, Arc<StateStore>, Arc<Health>, Arc<RunFlag>) {
        let (tx, source) = ChannelSource::new_pair(16);
        let store = Arc::new(StateStore::new());
        let health = Arc::new(Health::new());
        let flag = Arc::new(RunFlag::new());
        let config = BusConfig { retry_seconds, ..BusConfig::default() };
        let bus = BusChannel::new(&config, Box::new(source), store.clone(), health.clone(), flag.clone());
        (tx, bus, store, health, flag)
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode_payload(b"{not json"), Err(BusError::Decode(_))));
        assert!(matches!(decode_payload(b"[1, 2, 3]"), Err(BusError::NotAnObject)));
        assert!(matches!(decode_payload(b"\xff\xfe"), Err(BusError::Decode(_))));
    }

    #[test]
    fn test_handle_payload_counts_and_merges() {
        let (_tx, bus, store, health, _flag) = channel_bus(1);

        bus.handle_payload(br#"{"temp1_C": 45.2, "ventiladores": [true, true, false]}"#);
        bus.handle_payload(b"garbage");
        bus.handle_payload(br#"{"unknown": 1}"#);

        let state = store.snapshot();
        assert_eq!(state.temperature1_c, 45.2);
        assert_eq!(state.fans, [true, true, false]);

        let report = health.report();
        assert_eq!(report.bus_messages, 2);
        assert_eq!(report.bus_decode_errors, 1);
    }

    #[tokio::test]
    async fn test_run_applies_messages_until_stopped() {
        let (tx, bus, store, health, flag) = channel_bus(1);
        let task = tokio::spawn(bus.run());

        tx.send(br#"{"timestamp_ms": 10, "radiacion_W_m2": 640.0}"#.to_vec()).await.unwrap();
        tx.send(b"{oops".to_vec()).await.unwrap();
        tx.send(br#"{"timestamp_ms": 11}"#.to_vec()).await.unwrap();

        for _ in 0..200 {
            if store.snapshot().timestamp_ms == 11 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(store.snapshot().timestamp_ms, 11);
        assert_eq!(store.snapshot().radiation_w_m2, 640.0);
        assert_eq!(health.report().bus_state, LinkState::Connected);

        flag.stop();
        task.await.unwrap();
        assert_eq!(health.report().bus_state, LinkState::Stopped);

        // the source is closed once the loop exits
        assert!(tx.send(br#"{"timestamp_ms": 99}"#.to_vec()).await.is_err());
        assert_eq!(store.snapshot().timestamp_ms, 11);
    }

    #[tokio::test]
    async fn test_closed_source_ends_loop() {
        let (tx, bus, _store, health, _flag) = channel_bus(1);
        drop(tx);
        bus.run().await;
        assert_eq!(health.report().bus_state, LinkState::Stopped);
        assert_eq!(health.report().bus_connect_failures, 0);
    }

    /// fails every poll, like a broker that is not there
    struct DeadBroker;

    #[async_trait]
    impl BusSource for DeadBroker {
        async fn next_event(&mut self) -> Result<BusEvent, BusError> {
            Err(BusError::Connection("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_dead_broker_is_retried_and_stoppable() {
        let store = Arc::new(StateStore::new());
        let health = Arc::new(Health::new());
        let flag = Arc::new(RunFlag::new());
        let config = BusConfig { retry_seconds: 60, ..BusConfig::default() };
        let bus = BusChannel::new(&config, Box::new(DeadBroker), store, health.clone(), flag.clone());
        let task = tokio::spawn(bus.run());

        for _ in 0..200 {
            if health.report().bus_connect_failures > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(health.report().bus_connect_failures, 1);
        assert_eq!(health.report().bus_state, LinkState::Disconnected);

        // stop wakes the 60s backoff
        flag.stop();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert_eq!(health.report().bus_state, LinkState::Stopped);
    }

    #[test]
    fn test_payload_after_stop_is_dropped() {
        let (_tx, bus, store, health, flag) = channel_bus(1);

        bus.handle_payload(br#"{"timestamp_ms": 7}"#);
        let before = store.snapshot();

        flag.stop();
        bus.handle_payload(br#"{"timestamp_ms": 8, "temp1_C": 99.0}"#);

        assert_eq!(store.snapshot(), before);
        assert_eq!(health.report().bus_messages, 2);
    }

    /// source whose delivery races with shutdown: clears the flag, then yields a message
    struct LateSource {
        flag: Arc<RunFlag>,
    }

    #[async_trait]
    impl BusSource for LateSource {
        async fn next_event(&mut self) -> Result<BusEvent, BusError> {
            self.flag.stop();
            Ok(BusEvent::Message(br#"{"timestamp_ms": 42}"#.to_vec()))
        }
    }

    #[tokio::test]
    async fn test_source_delivering_after_stop_does_not_write() {
        let store = Arc::new(StateStore::new());
        let health = Arc::new(Health::new());
        let flag = Arc::new(RunFlag::new());
        let source = LateSource { flag: flag.clone() };
        let bus = BusChannel::new(&BusConfig::default(), Box::new(source), store.clone(), health.clone(), flag);

        tokio::time::timeout(Duration::from_secs(2), bus.run()).await.unwrap();

        let report = health.report();
        assert_eq!(report.bus_messages, 1);
        assert_eq!(report.bus_state, LinkState::Stopped);
        assert_eq!(store.snapshot().timestamp_ms, 0);
    }
}

