// Delegate that logs sensor events and keeps per-peer tallies for the
// shutdown summary

use parking_lot::Mutex;
use proxima_core::{PayloadData, PeerId, PlatformType, RadioState, SensorDelegate};
use std::collections::HashMap;
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerTally {
    pub platform: Option<PlatformType>,
    pub measurements: u64,
    pub last_rssi: Option<i16>,
    pub payload: Option<String>,
}

#[derive(Default)]
pub struct LoggingDelegate {
    peers: Mutex<HashMap<PeerId, PeerTally>>,
}

impl LoggingDelegate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tallies ordered by peer id
    pub fn summary(&self) -> Vec<(PeerId, PeerTally)> {
        let mut peers: Vec<_> = self
            .peers
            .lock()
            .iter()
            .map(|(id, tally)| (id.clone(), tally.clone()))
            .collect();
        peers.sort_by(|a, b| a.0.cmp(&b.0));
        peers
    }
}

impl SensorDelegate for LoggingDelegate {
    fn did_measure(&self, platform: PlatformType, rssi: i16, peer: &PeerId) {
        info!(peer = %peer, platform = %platform, rssi, "didMeasure");
        let mut peers = self.peers.lock();
        let tally = peers.entry(peer.clone()).or_default();
        tally.measurements += 1;
        tally.last_rssi = Some(rssi);
        tally.platform.get_or_insert(platform);
    }

    fn did_read(&self, platform: PlatformType, payload: &PayloadData, peer: &PeerId) {
        info!(peer = %peer, platform = %platform, payload = %payload.short_name(), "didRead");
        let mut peers = self.peers.lock();
        let tally = peers.entry(peer.clone()).or_default();
        tally.platform = Some(platform);
        tally.payload = Some(hex::encode(payload.as_bytes()));
    }

    fn did_update_state(&self, state: RadioState) {
        info!(state = %state, "didUpdateState");
    }
}
