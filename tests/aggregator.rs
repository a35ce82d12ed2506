//! end-to-end lifecycle of the aggregator with in-process transports

use async_trait::async_trait;
use secador_host::bus::ChannelSource;
use secador_host::serial::{ScaleConnector, ScaleLink};
use secador_host::{
    AggregatorError, HostConfig, LinkState, SensorAggregator, SensorState, SerialError,
    SnapshotSource,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// scale link fed from a channel, like a port that stays open
struct ChannelLink {
    rx: mpsc::Receiver<Vec<u8>>,
}

#[async_trait]
impl ScaleLink for ChannelLink {
    async fn read_frame(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, SerialError> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(frame)) => Ok(Some(frame)),
            Ok(None) => Err(SerialError::Disconnected),
        }
    }
}

/// scale that is "unplugged" for the first `failures` attempts
struct FakeScale {
    failures: usize,
    attempts: AtomicUsize,
    link: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
}

impl FakeScale {
    fn new(failures: usize) -> (mpsc::Sender<Vec<u8>>, Arc<Self>) {
        let (tx, rx) = mpsc::channel(16);
        let scale = Arc::new(Self {
            failures,
            attempts: AtomicUsize::new(0),
            link: Mutex::new(Some(rx)),
        });
        (tx, scale)
    }
}

#[async_trait]
impl ScaleConnector for FakeScale {
    fn describe(&self) -> String {
        "fake-scale".into()
    }

    async fn open(&self) -> Result<Box<dyn ScaleLink>, SerialError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        let rx = if attempt < self.failures { None } else { self.link.lock().unwrap().take() };
        match rx {
            Some(rx) => Ok(Box::new(ChannelLink { rx })),
            None => Err(SerialError::Open {
                port: "fake-scale".into(),
                reason: "device not present".into(),
            }),
        }
    }
}

fn fast_config() -> HostConfig {
    let mut config = HostConfig::default();
    config.bus.retry_seconds = 1;
    config.serial.read_timeout_ms = 10;
    config.serial.open_retry_ms = 10;
    config.serial.io_retry_ms = 10;
    config
}

async fn eventually<F: Fn(&SensorState) -> bool>(aggregator: &SensorAggregator, cond: F) -> SensorState {
    for _ in 0..400 {
        let snapshot = aggregator.snapshot();
        if cond(&snapshot) {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("state never reached: {:?}", aggregator.snapshot());
}

#[tokio::test]
async fn snapshot_is_populated_before_start() {
    let (_bus_tx, bus) = ChannelSource::new_pair(4);
    let (_scale_tx, scale) = FakeScale::new(0);
    let aggregator = SensorAggregator::with_transports(fast_config(), Box::new(bus), scale);

    assert!(!aggregator.is_running());
    assert_eq!(SnapshotSource::snapshot(&aggregator), SensorState::default());
    assert_eq!(aggregator.health().bus_state, LinkState::Idle);
}

#[tokio::test]
async fn both_channels_feed_one_snapshot() {
    let (bus_tx, bus) = ChannelSource::new_pair(16);
    let (scale_tx, scale) = FakeScale::new(0);
    let mut aggregator = SensorAggregator::with_transports(fast_config(), Box::new(bus), scale);
    aggregator.start().unwrap();

    bus_tx
        .send(
            br#"{"timestamp_ms": 5000, "temp1_C": 55.1, "humedad1_RH": 18.0,
                 "temperatura2_C": 48.3, "humedad2_RH": 21.5, "radiacion_W_m2": 712.0,
                 "termopares_C": [60.0, 61.0, 62.0, 63.0, 64.0, 65.0],
                 "ventiladores": [true, false, true], "firmware": "2.1"}"#
                .to_vec(),
        )
        .await
        .unwrap();
    scale_tx.send(b"1523,7 g\r\n".to_vec()).await.unwrap();

    let state = eventually(&aggregator, |s| s.timestamp_ms == 5000 && s.mass_text == "1523,7").await;
    assert_eq!(state.temperature1_c, 55.1);
    assert_eq!(state.radiation_w_m2, 712.0);
    assert_eq!(state.thermocouples_c[5], 65.0);
    assert_eq!(state.fans, [true, false, true]);
    assert_eq!(state.mass_g, 1523.7);

    let health = aggregator.health();
    assert_eq!(health.bus_state, LinkState::Connected);
    assert_eq!(health.serial_state, LinkState::Connected);

    aggregator.stop().await;
}

#[tokio::test]
async fn no_updates_after_stop() {
    let (bus_tx, bus) = ChannelSource::new_pair(16);
    let (scale_tx, scale) = FakeScale::new(0);
    let mut aggregator = SensorAggregator::with_transports(fast_config(), Box::new(bus), scale);
    aggregator.start().unwrap();

    bus_tx.send(br#"{"timestamp_ms": 1}"#.to_vec()).await.unwrap();
    scale_tx.send(b"10.00 g\n".to_vec()).await.unwrap();
    eventually(&aggregator, |s| s.timestamp_ms == 1 && s.mass_text == "10.00").await;

    aggregator.stop().await;
    assert!(!aggregator.is_running());
    let frozen = aggregator.snapshot();

    // both transports are released by stop, so nothing can be delivered any more
    assert!(bus_tx.send(br#"{"timestamp_ms": 2}"#.to_vec()).await.is_err());
    assert!(scale_tx.send(b"99.99 g\n".to_vec()).await.is_err());
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(aggregator.snapshot(), frozen);
    let health = aggregator.health();
    assert_eq!(health.bus_state, LinkState::Stopped);
    assert_eq!(health.serial_state, LinkState::Stopped);

    // stopping again is harmless
    aggregator.stop().await;
}

#[tokio::test]
async fn scale_recovers_after_repeated_open_failures() {
    let (_bus_tx, bus) = ChannelSource::new_pair(4);
    let (scale_tx, scale) = FakeScale::new(5);
    let mut aggregator =
        SensorAggregator::with_transports(fast_config(), Box::new(bus), scale.clone());
    aggregator.start().unwrap();

    scale_tx.send(b"250.0g\n".to_vec()).await.unwrap();
    let state = eventually(&aggregator, |s| s.mass_text == "250.0").await;
    assert_eq!(state.mass_g, 250.0);

    assert_eq!(aggregator.health().serial_open_failures, 5);
    assert_eq!(scale.attempts.load(Ordering::SeqCst), 6);

    aggregator.stop().await;
}

#[tokio::test]
async fn start_twice_is_rejected() {
    let (_bus_tx, bus) = ChannelSource::new_pair(4);
    let (_scale_tx, scale) = FakeScale::new(0);
    let mut aggregator = SensorAggregator::with_transports(fast_config(), Box::new(bus), scale);

    aggregator.start().unwrap();
    assert_eq!(aggregator.start(), Err(AggregatorError::AlreadyStarted));
    aggregator.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn readers_on_other_threads_see_whole_records() {
    let (bus_tx, bus) = ChannelSource::new_pair(64);
    let (_scale_tx, scale) = FakeScale::new(0);
    let mut aggregator = SensorAggregator::with_transports(fast_config(), Box::new(bus), scale);
    aggregator.start().unwrap();

    let reader = aggregator.reader();
    let readers: Vec<_> = (0..3)
        .map(|_| {
            let reader = reader.clone();
            std::thread::spawn(move || {
                for _ in 0..5_000 {
                    let s = reader.snapshot();
                    // every bus message writes the same value to both temperatures
                    assert_eq!(s.temperature1_c, s.temperature2_c);
                    assert_eq!(s.temperature1_c, s.timestamp_ms as f64);
                }
            })
        })
        .collect();

    for n in 1..=200u64 {
        let payload = format!(r#"{{"timestamp_ms": {n}, "temp1_C": {n}.0, "temperatura2_C": {n}.0}}"#);
        bus_tx.send(payload.into_bytes()).await.unwrap();
    }

    for r in readers {
        r.join().unwrap();
    }
    eventually(&aggregator, |s| s.timestamp_ms == 200).await;
    aggregator.stop().await;
}
