/// Peer records tracked by the device registry
///
/// A `PeerRecord` carries everything the engine knows about one nearby device:
/// the platform guess, connection state, the payload read from it, and the
/// timestamps that drive the task table. Mutation is crate-private so the
/// registry and the connection engine running on the receiver task are the
/// only writers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::SensorError;

/// Session-stable identifier of a peer, derived from its radio identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque handle the radio uses to reach a peripheral
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeripheralHandle(String);

impl PeripheralHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Platform guess for a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlatformType {
    /// Nothing known yet
    Unknown,
    /// Platform-A manufacturer data seen without the service (background advert)
    PlatformATbc,
    /// Platform-A peer running the protocol
    PlatformA,
    /// Platform-B peer running the protocol
    PlatformB,
    /// Not running the protocol or misbehaving; reconsidered after a cooldown
    Ignore,
}

impl PlatformType {
    /// Confirmed platforms get the benefit of the doubt on protocol mismatch
    pub fn is_confirmed(&self) -> bool {
        matches!(self, PlatformType::PlatformA | PlatformType::PlatformB)
    }

    /// Platform still needs resolving through a payload read
    pub fn is_unresolved(&self) -> bool {
        matches!(self, PlatformType::Unknown | PlatformType::PlatformATbc)
    }
}

impl fmt::Display for PlatformType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformType::Unknown => write!(f, "unknown"),
            PlatformType::PlatformATbc => write!(f, "platformA_tbc"),
            PlatformType::PlatformA => write!(f, "platformA"),
            PlatformType::PlatformB => write!(f, "platformB"),
            PlatformType::Ignore => write!(f, "ignore"),
        }
    }
}

/// Connection state of a peer as seen by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    /// Whether `next` may follow `self` within one connection attempt
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        match next {
            ConnectionState::Disconnected => true,
            ConnectionState::Connecting => *self == ConnectionState::Disconnected,
            ConnectionState::Connected => *self == ConnectionState::Connecting,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// Identity payload read from a peer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PayloadData(Vec<u8>);

impl PayloadData {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Short hex prefix for log lines
    pub fn short_name(&self) -> String {
        let prefix = &self.0[..self.0.len().min(6)];
        hex::encode(prefix)
    }
}

impl From<Vec<u8>> for PayloadData {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

/// Payload sharing data a transmitter has queued for a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadSharingData {
    /// Peers whose payloads are included in `data`
    pub identifiers: Vec<PeerId>,
    /// Concatenated payloads to write
    pub data: PayloadData,
}

/// Everything known about one nearby peer
#[derive(Debug, Clone)]
pub struct PeerRecord {
    identifier: PeerId,
    peripheral: Option<PeripheralHandle>,
    platform: PlatformType,
    connection_state: ConnectionState,
    rssi: Option<i16>,
    payload: Option<PayloadData>,
    signal_characteristic: Option<Uuid>,
    payload_characteristic: Option<Uuid>,
    created_at: Instant,
    last_updated_at: Instant,
    state_changed_at: Instant,
    last_discovered_at: Option<Instant>,
    last_connect_requested_at: Option<Instant>,
    last_write_payload_at: Option<Instant>,
    last_write_rssi_at: Option<Instant>,
    last_write_payload_sharing_at: Option<Instant>,
    last_platform_update_at: Option<Instant>,
}

/// Time since `at`, or `Duration::MAX` when it never happened
fn since(at: Option<Instant>, now: Instant) -> Duration {
    at.map_or(Duration::MAX, |t| now.saturating_duration_since(t))
}

impl PeerRecord {
    pub(crate) fn new(identifier: PeerId, peripheral: Option<PeripheralHandle>, now: Instant) -> Self {
        Self {
            identifier,
            peripheral,
            platform: PlatformType::Unknown,
            connection_state: ConnectionState::Disconnected,
            rssi: None,
            payload: None,
            signal_characteristic: None,
            payload_characteristic: None,
            created_at: now,
            last_updated_at: now,
            state_changed_at: now,
            last_discovered_at: None,
            last_connect_requested_at: None,
            last_write_payload_at: None,
            last_write_rssi_at: None,
            last_write_payload_sharing_at: None,
            last_platform_update_at: None,
        }
    }

    pub fn identifier(&self) -> &PeerId {
        &self.identifier
    }

    pub fn peripheral(&self) -> Option<&PeripheralHandle> {
        self.peripheral.as_ref()
    }

    pub fn platform(&self) -> PlatformType {
        self.platform
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    pub fn rssi(&self) -> Option<i16> {
        self.rssi
    }

    pub fn payload(&self) -> Option<&PayloadData> {
        self.payload.as_ref()
    }

    pub fn signal_characteristic(&self) -> Option<Uuid> {
        self.signal_characteristic
    }

    pub fn payload_characteristic(&self) -> Option<Uuid> {
        self.payload_characteristic
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_updated_at(&self) -> Instant {
        self.last_updated_at
    }

    pub fn last_discovered_at(&self) -> Option<Instant> {
        self.last_discovered_at
    }

    pub fn last_connect_requested_at(&self) -> Option<Instant> {
        self.last_connect_requested_at
    }

    pub fn time_since_last_discovery(&self, now: Instant) -> Duration {
        since(self.last_discovered_at, now)
    }

    pub fn time_since_last_connect_request(&self, now: Instant) -> Duration {
        since(self.last_connect_requested_at, now)
    }

    pub fn time_since_last_write_payload(&self, now: Instant) -> Duration {
        since(self.last_write_payload_at, now)
    }

    pub fn time_since_last_write_rssi(&self, now: Instant) -> Duration {
        since(self.last_write_rssi_at, now)
    }

    pub fn time_since_last_write_payload_sharing(&self, now: Instant) -> Duration {
        since(self.last_write_payload_sharing_at, now)
    }

    pub fn time_since_last_platform_update(&self, now: Instant) -> Duration {
        since(self.last_platform_update_at, now)
    }

    pub fn has_written_payload(&self) -> bool {
        self.last_write_payload_at.is_some()
    }

    /// Time spent connected, if currently connected
    pub fn up_time(&self, now: Instant) -> Option<Duration> {
        (self.connection_state == ConnectionState::Connected)
            .then(|| now.saturating_duration_since(self.state_changed_at))
    }

    /// Time spent disconnected, if currently disconnected
    pub fn down_time(&self, now: Instant) -> Option<Duration> {
        (self.connection_state == ConnectionState::Disconnected)
            .then(|| now.saturating_duration_since(self.state_changed_at))
    }

    // ------------------------------------------------------------------
    // Mutation (registry and connection engine only)
    // ------------------------------------------------------------------

    pub(crate) fn set_peripheral(&mut self, peripheral: PeripheralHandle, now: Instant) {
        self.peripheral = Some(peripheral);
        self.last_updated_at = now;
    }

    pub(crate) fn register_discovery(&mut self, now: Instant) {
        self.last_discovered_at = Some(now);
        self.last_updated_at = now;
    }

    pub(crate) fn set_rssi(&mut self, rssi: i16, now: Instant) {
        self.rssi = Some(rssi);
        self.last_updated_at = now;
    }

    pub(crate) fn set_platform(&mut self, platform: PlatformType, now: Instant) {
        self.platform = platform;
        self.last_platform_update_at = Some(now);
        self.last_updated_at = now;
    }

    pub(crate) fn set_payload(&mut self, payload: PayloadData, now: Instant) {
        self.payload = Some(payload);
        self.last_updated_at = now;
    }

    pub(crate) fn transition(&mut self, next: ConnectionState, now: Instant) -> Result<(), SensorError> {
        if !self.connection_state.can_transition_to(next) {
            return Err(SensorError::InvalidTransition {
                peer: self.identifier.clone(),
                from: self.connection_state,
                to: next,
            });
        }
        if self.connection_state != next {
            self.state_changed_at = now;
        }
        self.connection_state = next;
        self.last_updated_at = now;
        Ok(())
    }

    pub(crate) fn register_connect_request(&mut self, now: Instant) {
        self.last_connect_requested_at = Some(now);
        self.last_updated_at = now;
    }

    pub(crate) fn register_write_payload(&mut self, now: Instant) {
        self.last_write_payload_at = Some(now);
        self.last_updated_at = now;
    }

    pub(crate) fn register_write_rssi(&mut self, now: Instant) {
        self.last_write_rssi_at = Some(now);
        self.last_updated_at = now;
    }

    pub(crate) fn register_write_payload_sharing(&mut self, now: Instant) {
        self.last_write_payload_sharing_at = Some(now);
        self.last_updated_at = now;
    }

    /// Characteristic handles are only valid for the connection they were discovered on
    pub(crate) fn invalidate_characteristics(&mut self) {
        self.signal_characteristic = None;
        self.payload_characteristic = None;
    }

    pub(crate) fn set_signal_characteristic(&mut self, characteristic: Uuid) {
        self.signal_characteristic = Some(characteristic);
    }

    pub(crate) fn set_payload_characteristic(&mut self, characteristic: Uuid) {
        self.payload_characteristic = Some(characteristic);
    }
}

impl fmt::Display for PeerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (platform={}, state={}, rssi={:?}, payload={})",
            self.identifier,
            self.platform,
            self.connection_state,
            self.rssi,
            self.payload
                .as_ref()
                .map_or_else(|| "none".to_string(), PayloadData::short_name)
        )
    }
}
