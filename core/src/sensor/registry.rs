/// Device registry
///
/// In-memory table of peer records keyed by `PeerId`. The registry is owned
/// by the receiver task and never calls out: operations that produce
/// observable outcomes return `SensorEvent`s for the caller to forward.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::classifier::{classify, Classification};
use super::config::SensorConfig;
use super::delegate::SensorEvent;
use super::device::{ConnectionState, PeerId, PeerRecord, PeripheralHandle, PlatformType};
use super::radio::Advertisement;
use crate::SensorError;

/// Outcome of ingesting one batch of sightings
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestReport {
    /// Events to forward to delegates, in sighting order
    pub events: Vec<SensorEvent>,
    /// Distinct peers seen in the batch
    pub peers: Vec<PeerId>,
    /// Sightings with neither the service nor platform-A manufacturer data
    pub anomalous: usize,
}

/// Registry of every peer seen recently
pub struct DeviceRegistry {
    records: HashMap<PeerId, PeerRecord>,
    service_uuid: Uuid,
    manufacturer_id: u16,
    ignore_cooldown: Duration,
    expiry: Duration,
}

impl DeviceRegistry {
    pub fn new(config: &SensorConfig) -> Self {
        Self {
            records: HashMap::new(),
            service_uuid: config.service_uuid,
            manufacturer_id: config.platform_a_manufacturer_id,
            ignore_cooldown: config.ignore_cooldown(),
            expiry: config.expiry(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.records.contains_key(peer)
    }

    pub fn get(&self, peer: &PeerId) -> Option<&PeerRecord> {
        self.records.get(peer)
    }

    pub(crate) fn get_mut(&mut self, peer: &PeerId) -> Option<&mut PeerRecord> {
        self.records.get_mut(peer)
    }

    pub fn records(&self) -> impl Iterator<Item = &PeerRecord> {
        self.records.values()
    }

    /// Copy of every record, ordered by identifier
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        let mut records: Vec<PeerRecord> = self.records.values().cloned().collect();
        records.sort_by(|a, b| a.identifier().cmp(b.identifier()));
        records
    }

    /// Existing record for `peer`, or a new one
    pub(crate) fn resolve(
        &mut self,
        peer: &PeerId,
        peripheral: Option<PeripheralHandle>,
        now: Instant,
    ) -> &mut PeerRecord {
        let record = self
            .records
            .entry(peer.clone())
            .or_insert_with(|| PeerRecord::new(peer.clone(), None, now));
        if let Some(peripheral) = peripheral {
            if record.peripheral() != Some(&peripheral) {
                record.set_peripheral(peripheral, now);
            }
        }
        record
    }

    /// Explicit removal
    pub fn remove(&mut self, peer: &PeerId) -> Option<PeerRecord> {
        self.records.remove(peer)
    }

    /// Ignore cooldown has elapsed for `record`
    pub fn ignore_cooldown_elapsed(&self, record: &PeerRecord, now: Instant) -> bool {
        record.time_since_last_platform_update(now) >= self.ignore_cooldown
    }

    /// Ingest a batch of sightings drained from the scan window
    pub fn ingest(&mut self, sightings: Vec<Advertisement>, now: Instant) -> IngestReport {
        let mut report = IngestReport::default();
        debug!(sightings = sightings.len(), "Ingesting scan results");

        for sighting in sightings {
            if !report.peers.contains(&sighting.peer) {
                report.peers.push(sighting.peer.clone());
            }
            if self.ingest_one(sighting, now, &mut report.events) {
                report.anomalous += 1;
            }
        }

        debug!(
            peers = report.peers.len(),
            registry = self.records.len(),
            "Ingested scan results"
        );
        report
    }

    /// Ingest one sighting; returns true when it was anomalous
    fn ingest_one(&mut self, sighting: Advertisement, now: Instant, events: &mut Vec<SensorEvent>) -> bool {
        let exposes_service = sighting.exposes_service(&self.service_uuid);
        let is_platform_a = sighting.has_manufacturer(self.manufacturer_id);
        let ignore_cooldown = self.ignore_cooldown;

        let record = self.resolve(&sighting.peer, Some(sighting.peripheral), now);
        record.register_discovery(now);

        if let Some(rssi) = sighting.rssi {
            record.set_rssi(rssi, now);
            events.push(SensorEvent::DidMeasure {
                platform: record.platform(),
                rssi,
                peer: record.identifier().clone(),
            });
        }

        if record.platform() == PlatformType::Ignore {
            if record.time_since_last_platform_update(now) < ignore_cooldown {
                return false;
            }
            debug!(peer = %record.identifier(), "Ignore cooldown elapsed, switching to unknown");
            record.set_platform(PlatformType::Unknown, now);
        }

        match classify(exposes_service, is_platform_a, record.platform()) {
            Classification::Set(platform) => {
                if record.platform() != platform {
                    debug!(peer = %record.identifier(), from = %record.platform(), to = %platform, "Platform classified");
                }
                record.set_platform(platform, now);
                false
            }
            Classification::Keep => false,
            Classification::Anomalous => {
                error!(
                    peer = %record.identifier(),
                    "Sighting without service or platform-A manufacturer data"
                );
                record.set_platform(PlatformType::Ignore, now);
                true
            }
        }
    }

    /// Delete records not discovered within the expiry window
    pub fn remove_expired(&mut self, now: Instant) -> Vec<PeerId> {
        let expiry = self.expiry;
        let expired: Vec<PeerId> = self
            .records
            .values()
            .filter(|record| record.time_since_last_discovery(now) > expiry)
            .map(|record| record.identifier().clone())
            .collect();

        for peer in &expired {
            if let Some(record) = self.records.remove(peer) {
                debug!(record = %record, "Removed expired peer");
            }
        }
        expired
    }

    /// Move a peer's connection state, rejecting illegal transitions
    pub(crate) fn set_connection_state(
        &mut self,
        peer: &PeerId,
        state: ConnectionState,
        now: Instant,
    ) -> Result<(), SensorError> {
        let record = self
            .records
            .get_mut(peer)
            .ok_or_else(|| SensorError::UnknownPeer(peer.clone()))?;
        record.transition(state, now).map_err(|e| {
            warn!(peer = %peer, error = %e, "Rejected connection state change");
            e
        })
    }

    /// Force a peer to Disconnected; legal from any state
    pub(crate) fn force_disconnected(&mut self, peer: &PeerId, now: Instant) {
        if let Some(record) = self.records.get_mut(peer) {
            // Disconnected is reachable from every state
            let _ = record.transition(ConnectionState::Disconnected, now);
        }
    }

    pub(crate) fn set_platform(&mut self, peer: &PeerId, platform: PlatformType, now: Instant) {
        if let Some(record) = self.records.get_mut(peer) {
            record.set_platform(platform, now);
        }
    }
}
