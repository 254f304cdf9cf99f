//! End-to-end tests for the sensor receiver
//!
//! A scripted radio plays back advertisements during every scan window and
//! answers connection requests from a per-peer script, so whole duty cycles
//! run on tokio's paused clock:
//! 1. Discovery and platform classification
//! 2. Connection, capability discovery and the signal protocol
//! 3. Per-peer timeout and dispatch budget
//! 4. Scan loop start idempotence
//! 5. Scan filter keeps unrelated advertisers out
//!
//! Run with: cargo test --test integration_sensor

use async_trait::async_trait;
use parking_lot::Mutex;
use proxima_core::sensor::{
    signal_data_action_code, SignalEnvelope, PAYLOAD_CHARACTERISTIC_UUID, PLATFORM_A_MANUFACTURER_ID,
    PLATFORM_A_SIGNAL_UUID, PLATFORM_B_SIGNAL_UUID, PROTOCOL_SERVICE_UUID,
};
use proxima_core::{
    radio_channel, Advertisement, ConnectionState, PayloadData, PeerId, PeerRecord, PeripheralHandle,
    PlatformType, RadioBridge, RadioError, RadioEvent, RadioLink, RadioState, ReceiveOnlyTransmitter,
    ReceiverHandle, ScanFilter, ScannerError, SensorConfig, SensorDelegate, SensorError, SensorEvent,
    SensorReceiver, ServiceDescriptor,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_test::assert_ok;
use uuid::Uuid;

// ============================================================================
// SCRIPTED RADIO
// ============================================================================

#[derive(Clone)]
struct FakePeer {
    advertisement: Advertisement,
    services: Vec<ServiceDescriptor>,
    payload: Option<Vec<u8>>,
    answers_connect: bool,
}

impl FakePeer {
    fn platform_b(id: &str, rssi: i16) -> Self {
        Self {
            advertisement: advert(id).with_service(PROTOCOL_SERVICE_UUID).with_rssi(rssi),
            services: vec![protocol_service(PLATFORM_B_SIGNAL_UUID)],
            payload: Some(vec![0x42, 0x01, id.len() as u8]),
            answers_connect: true,
        }
    }

    fn platform_a_background(id: &str, rssi: i16) -> Self {
        Self {
            advertisement: advert(id)
                .with_manufacturer_data(PLATFORM_A_MANUFACTURER_ID, vec![0x10, 0x05, 0x01])
                .with_rssi(rssi),
            services: vec![protocol_service(PLATFORM_A_SIGNAL_UUID)],
            payload: Some(vec![0x41, 0x02]),
            answers_connect: true,
        }
    }

    /// Some other device nearby, neither the protocol service nor platform-A data
    fn unrelated(id: &str) -> Self {
        Self {
            advertisement: advert(id)
                .with_manufacturer_data(0x0006, vec![0x01, 0x09])
                .with_rssi(-50),
            services: vec![],
            payload: None,
            answers_connect: true,
        }
    }

    fn silent(id: &str) -> Self {
        Self {
            answers_connect: false,
            ..Self::platform_b(id, -80)
        }
    }
}

fn advert(id: &str) -> Advertisement {
    Advertisement::new(PeerId::new(id), PeripheralHandle::new(id))
}

fn protocol_service(signal: Uuid) -> ServiceDescriptor {
    ServiceDescriptor {
        uuid: PROTOCOL_SERVICE_UUID,
        characteristics: vec![signal, PAYLOAD_CHARACTERISTIC_UUID],
    }
}

struct FakeRadio {
    link: RadioLink,
    state: Mutex<RadioState>,
    peers: Mutex<HashMap<String, FakePeer>>,
    log: Mutex<Vec<String>>,
    writes: Mutex<Vec<(String, Vec<u8>)>>,
}

impl FakeRadio {
    fn new(link: RadioLink, peers: Vec<FakePeer>) -> Self {
        Self {
            link,
            state: Mutex::new(RadioState::PoweredOn),
            peers: Mutex::new(
                peers
                    .into_iter()
                    .map(|p| (p.advertisement.peer.to_string(), p))
                    .collect(),
            ),
            log: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
        }
    }

    fn peer(&self, peripheral: &PeripheralHandle) -> Result<FakePeer, RadioError> {
        self.peers
            .lock()
            .get(peripheral.as_str())
            .cloned()
            .ok_or_else(|| RadioError::UnknownPeripheral(peripheral.to_string()))
    }

    fn record(&self, entry: String) {
        self.log.lock().push(entry);
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    fn count(&self, prefix: &str) -> usize {
        self.log.lock().iter().filter(|e| e.starts_with(prefix)).count()
    }

    fn connects(&self) -> Vec<String> {
        self.log
            .lock()
            .iter()
            .filter_map(|e| e.strip_prefix("connect:").map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl RadioBridge for FakeRadio {
    async fn state(&self) -> RadioState {
        *self.state.lock()
    }

    async fn start_scan(&self, filter: &ScanFilter) -> Result<(), RadioError> {
        self.record("start_scan".to_string());
        let adverts: Vec<Advertisement> = self
            .peers
            .lock()
            .values()
            .map(|p| p.advertisement.clone())
            .filter(|a| filter.matches(a))
            .collect();
        for advertisement in adverts {
            self.link.sighting(advertisement);
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), RadioError> {
        self.record("stop_scan".to_string());
        Ok(())
    }

    async fn connect(&self, peripheral: &PeripheralHandle) -> Result<(), RadioError> {
        self.record(format!("connect:{}", peripheral));
        let peer = self.peer(peripheral)?;
        if peer.answers_connect {
            self.link.event(RadioEvent::Connected {
                peer: peer.advertisement.peer,
            });
        }
        Ok(())
    }

    async fn disconnect(&self, peripheral: &PeripheralHandle) -> Result<(), RadioError> {
        self.record(format!("disconnect:{}", peripheral));
        self.link.event(RadioEvent::Disconnected {
            peer: PeerId::new(peripheral.as_str()),
            status: 0,
        });
        Ok(())
    }

    async fn close(&self, peripheral: &PeripheralHandle) {
        self.record(format!("close:{}", peripheral));
    }

    async fn discover_services(&self, peripheral: &PeripheralHandle) -> Result<(), RadioError> {
        self.record(format!("discover:{}", peripheral));
        let peer = self.peer(peripheral)?;
        self.link.event(RadioEvent::ServicesDiscovered {
            peer: peer.advertisement.peer,
            services: peer.services,
        });
        Ok(())
    }

    async fn read_characteristic(&self, peripheral: &PeripheralHandle, characteristic: Uuid) -> Result<(), RadioError> {
        self.record(format!("read:{}", peripheral));
        let peer = self.peer(peripheral)?;
        self.link.event(RadioEvent::CharacteristicRead {
            peer: peer.advertisement.peer,
            characteristic,
            success: peer.payload.is_some(),
            value: peer.payload,
        });
        Ok(())
    }

    async fn write_characteristic(
        &self,
        peripheral: &PeripheralHandle,
        characteristic: Uuid,
        value: Vec<u8>,
    ) -> Result<(), RadioError> {
        self.record(format!("write:{}:{}", peripheral, signal_data_action_code(&value)));
        self.writes.lock().push((peripheral.to_string(), value.clone()));
        self.link.event(RadioEvent::CharacteristicWritten {
            peer: PeerId::new(peripheral.as_str()),
            characteristic,
            value,
            success: true,
        });
        Ok(())
    }
}

// ============================================================================
// HARNESS
// ============================================================================

#[derive(Default)]
struct EventLog {
    events: Mutex<Vec<SensorEvent>>,
}

impl SensorDelegate for EventLog {
    fn did_measure(&self, platform: PlatformType, rssi: i16, peer: &PeerId) {
        self.events.lock().push(SensorEvent::DidMeasure {
            platform,
            rssi,
            peer: peer.clone(),
        });
    }

    fn did_read(&self, platform: PlatformType, payload: &PayloadData, peer: &PeerId) {
        self.events.lock().push(SensorEvent::DidRead {
            platform,
            payload: payload.clone(),
            peer: peer.clone(),
        });
    }

    fn did_update_state(&self, state: RadioState) {
        self.events.lock().push(SensorEvent::DidUpdateState(state));
    }
}

struct Harness {
    radio: Arc<FakeRadio>,
    events: Arc<EventLog>,
    handle: ReceiverHandle,
    task: JoinHandle<()>,
}

impl Harness {
    fn start(peers: Vec<FakePeer>) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let (link, feed) = radio_channel();
        let radio = Arc::new(FakeRadio::new(link, peers));
        let transmitter = Arc::new(ReceiveOnlyTransmitter::new(PayloadData::new(vec![0xaa, 0xbb])));
        let (mut receiver, handle) =
            SensorReceiver::new(SensorConfig::default(), radio.clone(), transmitter, feed)
                .expect("receiver");
        let events = Arc::new(EventLog::default());
        receiver.add_delegate(events.clone());

        Self {
            radio,
            events,
            handle,
            task: receiver.spawn(),
        }
    }

    async fn record(&self, id: &str) -> PeerRecord {
        let snapshot = self.handle.snapshot().await.expect("snapshot");
        snapshot
            .into_iter()
            .find(|r| r.identifier().as_str() == id)
            .expect("peer in registry")
    }

    /// Every sighting the scan filter passed carried one of the two signals
    async fn shutdown(self) {
        let status = self.handle.status().await.expect("status");
        assert_eq!(status.anomalous_sightings, 0);

        assert_ok!(self.handle.shutdown().await);
        assert_ok!(self.task.await);
    }
}

async fn advance(secs: u64) {
    tokio::time::sleep(Duration::from_secs(secs)).await;
}

// ============================================================================
// SCENARIOS
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_platform_b_peer_full_exchange() {
    let harness = Harness::start(vec![FakePeer::platform_b("b1", -58)]);

    // Scan window ends at 8s; dispatch runs on the same instant
    advance(9).await;

    let record = harness.record("b1").await;
    assert_eq!(record.platform(), PlatformType::PlatformB);
    assert_eq!(record.connection_state(), ConnectionState::Disconnected);
    assert_eq!(record.payload(), Some(&PayloadData::new(vec![0x42, 0x01, 2])));
    assert!(record.has_written_payload());

    let log = harness.radio.log();
    let session: Vec<&str> = log
        .iter()
        .map(String::as_str)
        .skip_while(|e| !e.starts_with("connect"))
        .collect();
    assert_eq!(
        session,
        vec![
            "connect:b1",
            "discover:b1",
            "read:b1",
            "write:b1:1",
            "write:b1:2",
            "disconnect:b1",
            "close:b1",
        ]
    );

    let writes = harness.radio.writes.lock().clone();
    let payload_write = SignalEnvelope::decode(&writes[0].1).expect("payload envelope");
    assert_eq!(payload_write.payload, vec![0xaa, 0xbb]);
    assert_eq!(payload_write.short_value, 2);
    let rssi_write = SignalEnvelope::decode(&writes[1].1).expect("rssi envelope");
    assert_eq!(rssi_write.rssi(), -58);

    let events = harness.events.events.lock().clone();
    assert_eq!(events[0], SensorEvent::DidUpdateState(RadioState::PoweredOn));
    assert!(events.contains(&SensorEvent::DidMeasure {
        platform: PlatformType::Unknown,
        rssi: -58,
        peer: PeerId::new("b1"),
    }));
    assert!(events.contains(&SensorEvent::DidRead {
        platform: PlatformType::PlatformB,
        payload: PayloadData::new(vec![0x42, 0x01, 2]),
        peer: PeerId::new("b1"),
    }));

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_unrelated_advertisement_never_reaches_registry() {
    let harness = Harness::start(vec![FakePeer::platform_b("b1", -62), FakePeer::unrelated("tv")]);

    advance(21).await;

    let snapshot = harness.handle.snapshot().await.expect("snapshot");
    let ids: Vec<&str> = snapshot.iter().map(|r| r.identifier().as_str()).collect();
    assert_eq!(ids, vec!["b1"]);
    assert_eq!(harness.radio.connects(), vec!["b1"]);

    let status = harness.handle.status().await.expect("status");
    assert_eq!(status.cycles, 2);
    assert_eq!(status.anomalous_sightings, 0);

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_rssi_rewritten_after_interval() {
    let harness = Harness::start(vec![FakePeer::platform_b("b1", -61)]);

    // Cycles stop at 8, 20, 32: the RSSI written at 8 is stale again by 32
    advance(33).await;

    let connects = harness.radio.connects();
    assert_eq!(connects, vec!["b1", "b1"]);
    assert_eq!(harness.radio.count("write:b1:2"), 2);
    // Payload is only written once
    assert_eq!(harness.radio.count("write:b1:1"), 1);

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_background_platform_a_confirmed_on_connect() {
    let harness = Harness::start(vec![FakePeer::platform_a_background("a1", -70)]);

    advance(9).await;

    let record = harness.record("a1").await;
    assert_eq!(record.platform(), PlatformType::PlatformA);
    assert_eq!(record.payload(), Some(&PayloadData::new(vec![0x41, 0x02])));
    assert_eq!(record.signal_characteristic(), Some(PLATFORM_A_SIGNAL_UUID));

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_peer_without_service_is_ignored_until_cooldown() {
    let mut peer = FakePeer::platform_a_background("x1", -75);
    peer.services = vec![];
    let harness = Harness::start(vec![peer]);

    // Several cycles, all within the five minute cooldown
    advance(60).await;

    assert_eq!(harness.record("x1").await.platform(), PlatformType::Ignore);
    assert_eq!(harness.radio.connects(), vec!["x1"]);

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_timeouts_and_budget_defer_remaining_peers() {
    let peers = ["a", "b", "c", "d", "e"]
        .iter()
        .map(|id| FakePeer::silent(id))
        .collect();
    let harness = Harness::start(peers);

    // Dispatch starts at 8s: a, b, c time out at 18, 28, 38; d and e are deferred
    advance(40).await;

    let status = harness.handle.status().await.expect("status");
    let report = status.last_dispatch.expect("dispatch ran");
    assert_eq!(report.attempted, 3);
    assert_eq!(report.timed_out, 3);
    assert_eq!(report.deferred, 2);
    assert_eq!(harness.radio.connects(), vec!["a", "b", "c"]);
    assert_eq!(harness.radio.count("close:"), 3);

    for id in ["a", "b", "c"] {
        assert_eq!(
            harness.record(id).await.connection_state(),
            ConnectionState::Disconnected
        );
    }

    // Next cycle stops at 50s; the deferred peers have waited longest
    advance(21).await;
    assert_eq!(harness.radio.connects(), vec!["a", "b", "c", "d", "e"]);

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_second_start_is_denied_with_one_loop() {
    let harness = Harness::start(vec![]);

    let first = harness.handle.status().await.expect("status").loop_id;
    assert!(first.is_some());

    let result = harness.handle.start().await;
    assert!(matches!(
        result,
        Err(SensorError::Scanner(ScannerError::AlreadyRunning))
    ));
    assert_eq!(harness.handle.status().await.expect("status").loop_id, first);

    // One loop means one start_scan per 12s cycle
    advance(13).await;
    assert_eq!(harness.radio.count("start_scan"), 2);

    harness.shutdown().await;
}
