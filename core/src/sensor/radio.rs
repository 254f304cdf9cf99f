/// Radio bridge between the engine and a platform BLE stack
///
/// Platform code (btleplug on desktop, native stacks on mobile) implements
/// `RadioBridge`. Requests return immediately with `Ok` when accepted or an
/// error when refused; their completions come back asynchronously as
/// `RadioEvent`s on the `RadioLink`. Advertisement sightings travel on a
/// separate unbounded channel so the radio's callback thread never blocks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::config::SensorConfig;
use super::device::{PeerId, PeripheralHandle};

/// GATT status reported for a successful operation or a clean disconnect
pub const GATT_SUCCESS: u8 = 0;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Errors reported synchronously by the radio
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RadioError {
    #[error("Radio unavailable")]
    Unavailable,
    #[error("Radio powered off")]
    PoweredOff,
    #[error("Operation rejected: {0}")]
    Rejected(String),
    #[error("Unknown peripheral: {0}")]
    UnknownPeripheral(String),
}

// ============================================================================
// TYPES
// ============================================================================

/// Power state of the local radio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RadioState {
    Unknown,
    Unsupported,
    PoweredOff,
    PoweredOn,
}

impl fmt::Display for RadioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RadioState::Unknown => write!(f, "unknown"),
            RadioState::Unsupported => write!(f, "unsupported"),
            RadioState::PoweredOff => write!(f, "poweredOff"),
            RadioState::PoweredOn => write!(f, "poweredOn"),
        }
    }
}

/// One advertisement sighting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Identity the registry keys the peer by
    pub peer: PeerId,
    /// Handle the radio needs to connect to the advertiser
    pub peripheral: PeripheralHandle,
    /// Signal strength of this sighting, if reported
    pub rssi: Option<i16>,
    /// Advertised service ids
    pub services: Vec<Uuid>,
    /// Manufacturer specific data keyed by manufacturer id
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
}

impl Advertisement {
    pub fn new(peer: PeerId, peripheral: PeripheralHandle) -> Self {
        Self {
            peer,
            peripheral,
            rssi: None,
            services: Vec::new(),
            manufacturer_data: HashMap::new(),
        }
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    pub fn with_service(mut self, service: Uuid) -> Self {
        self.services.push(service);
        self
    }

    pub fn with_manufacturer_data(mut self, manufacturer_id: u16, data: Vec<u8>) -> Self {
        self.manufacturer_data.insert(manufacturer_id, data);
        self
    }

    /// Advertised service set contains `service`
    pub fn exposes_service(&self, service: &Uuid) -> bool {
        self.services.contains(service)
    }

    /// Advertisement carries a manufacturer data block for `manufacturer_id`
    pub fn has_manufacturer(&self, manufacturer_id: u16) -> bool {
        self.manufacturer_data.contains_key(&manufacturer_id)
    }
}

/// Scan filter: protocol service id OR platform-A manufacturer data.
///
/// Both predicates are needed because platform-A background advertisements
/// omit the service id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanFilter {
    pub service_uuid: Uuid,
    pub manufacturer_id: u16,
}

impl ScanFilter {
    pub fn from_config(config: &SensorConfig) -> Self {
        Self {
            service_uuid: config.service_uuid,
            manufacturer_id: config.platform_a_manufacturer_id,
        }
    }

    pub fn matches(&self, advertisement: &Advertisement) -> bool {
        advertisement.exposes_service(&self.service_uuid)
            || advertisement.has_manufacturer(self.manufacturer_id)
    }
}

/// Service found during capability discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

/// Completion and notification events from the radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    /// Local radio power state changed
    StateChanged(RadioState),
    /// Connection to a peer established
    Connected { peer: PeerId },
    /// Connection to a peer closed; non-zero status means abnormal
    Disconnected { peer: PeerId, status: u8 },
    /// Capability discovery finished
    ServicesDiscovered {
        peer: PeerId,
        services: Vec<ServiceDescriptor>,
    },
    /// Characteristic read finished
    CharacteristicRead {
        peer: PeerId,
        characteristic: Uuid,
        value: Option<Vec<u8>>,
        success: bool,
    },
    /// Characteristic write finished; `value` is what was attempted
    CharacteristicWritten {
        peer: PeerId,
        characteristic: Uuid,
        value: Vec<u8>,
        success: bool,
    },
}

impl RadioEvent {
    /// Peer the event belongs to, if any
    pub fn peer(&self) -> Option<&PeerId> {
        match self {
            RadioEvent::StateChanged(_) => None,
            RadioEvent::Connected { peer }
            | RadioEvent::Disconnected { peer, .. }
            | RadioEvent::ServicesDiscovered { peer, .. }
            | RadioEvent::CharacteristicRead { peer, .. }
            | RadioEvent::CharacteristicWritten { peer, .. } => Some(peer),
        }
    }
}

// ============================================================================
// CHANNELS
// ============================================================================

/// Sending side handed to the radio implementation
#[derive(Debug, Clone)]
pub struct RadioLink {
    sightings: mpsc::UnboundedSender<Advertisement>,
    events: mpsc::UnboundedSender<RadioEvent>,
}

impl RadioLink {
    /// Report an advertisement; returns false once the receiver is gone
    pub fn sighting(&self, advertisement: Advertisement) -> bool {
        self.sightings.send(advertisement).is_ok()
    }

    /// Report a completion or notification; returns false once the receiver is gone
    pub fn event(&self, event: RadioEvent) -> bool {
        self.events.send(event).is_ok()
    }
}

/// Receiving side consumed by the sensor receiver
#[derive(Debug)]
pub struct RadioFeed {
    pub(crate) sightings: mpsc::UnboundedReceiver<Advertisement>,
    pub(crate) events: mpsc::UnboundedReceiver<RadioEvent>,
}

/// Create the channel pair connecting a radio to the receiver
pub fn radio_channel() -> (RadioLink, RadioFeed) {
    let (sightings_tx, sightings_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    (
        RadioLink {
            sightings: sightings_tx,
            events: events_tx,
        },
        RadioFeed {
            sightings: sightings_rx,
            events: events_rx,
        },
    )
}

// ============================================================================
// PLATFORM BRIDGE
// ============================================================================

/// Operations the engine needs from a platform radio
#[async_trait]
pub trait RadioBridge: Send + Sync {
    /// Current power state
    async fn state(&self) -> RadioState;

    /// Start reporting sightings that match `filter`
    async fn start_scan(&self, filter: &ScanFilter) -> Result<(), RadioError>;

    /// Stop reporting sightings
    async fn stop_scan(&self) -> Result<(), RadioError>;

    /// Request a connection; completes with `Connected` or `Disconnected`
    async fn connect(&self, peripheral: &PeripheralHandle) -> Result<(), RadioError>;

    /// Request a graceful disconnect; completes with `Disconnected`
    async fn disconnect(&self, peripheral: &PeripheralHandle) -> Result<(), RadioError>;

    /// Release the connection immediately without waiting for the peer
    async fn close(&self, peripheral: &PeripheralHandle);

    /// Discover services; completes with `ServicesDiscovered`
    async fn discover_services(&self, peripheral: &PeripheralHandle) -> Result<(), RadioError>;

    /// Read a characteristic; completes with `CharacteristicRead`
    async fn read_characteristic(
        &self,
        peripheral: &PeripheralHandle,
        characteristic: Uuid,
    ) -> Result<(), RadioError>;

    /// Write a characteristic with response; completes with `CharacteristicWritten`
    async fn write_characteristic(
        &self,
        peripheral: &PeripheralHandle,
        characteristic: Uuid,
        value: Vec<u8>,
    ) -> Result<(), RadioError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::config::{PLATFORM_A_MANUFACTURER_ID, PROTOCOL_SERVICE_UUID};

    fn advert() -> Advertisement {
        Advertisement::new(PeerId::new("peer"), PeripheralHandle::new("handle"))
    }

    #[test]
    fn test_scan_filter_matches_service() {
        let filter = ScanFilter::from_config(&SensorConfig::default());
        assert!(filter.matches(&advert().with_service(PROTOCOL_SERVICE_UUID)));
    }

    #[test]
    fn test_scan_filter_matches_manufacturer() {
        let filter = ScanFilter::from_config(&SensorConfig::default());
        assert!(filter.matches(&advert().with_manufacturer_data(PLATFORM_A_MANUFACTURER_ID, vec![0x10])));
    }

    #[test]
    fn test_scan_filter_rejects_unrelated_advertisement() {
        let filter = ScanFilter::from_config(&SensorConfig::default());
        let unrelated = advert()
            .with_service(Uuid::from_u128(0x180d))
            .with_manufacturer_data(0x0006, vec![]);
        assert!(!filter.matches(&unrelated));
    }

    #[test]
    fn test_radio_event_peer() {
        let peer = PeerId::new("peer");
        assert_eq!(
            RadioEvent::Connected { peer: peer.clone() }.peer(),
            Some(&peer)
        );
        assert_eq!(RadioEvent::StateChanged(RadioState::PoweredOn).peer(), None);
    }

    #[tokio::test]
    async fn test_link_reports_closed_feed() {
        let (link, feed) = radio_channel();
        assert!(link.sighting(advert()));
        drop(feed);
        assert!(!link.sighting(advert()));
        assert!(!link.event(RadioEvent::StateChanged(RadioState::PoweredOff)));
    }
}
