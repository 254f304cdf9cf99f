/// Transmitter capability queried by the task scheduler
///
/// Devices that cannot advertise themselves push their identity to peers by
/// writing it over the connection instead. The engine only needs to know
/// whether the local transmitter works, what payload to write, and whether
/// there is payload sharing data queued for a given peer.

use super::device::{PayloadData, PayloadSharingData, PeerRecord};

/// Local transmitter capabilities
#[cfg_attr(test, mockall::automock)]
pub trait Transmitter: Send + Sync {
    /// The device can advertise; write-based tasks are skipped when true
    fn is_supported(&self) -> bool;

    /// Identity payload of this device
    fn payload_data(&self) -> Option<PayloadData>;

    /// Payloads of other peers to share with `peer`, if any are queued
    fn payload_sharing_data(&self, peer: &PeerRecord) -> Option<PayloadSharingData>;
}

/// Transmitter for devices that cannot advertise
///
/// Always reports unsupported, so every reachable peer gets this device's
/// payload written to it. No sharing data is ever queued.
#[derive(Debug, Clone)]
pub struct ReceiveOnlyTransmitter {
    payload: PayloadData,
}

impl ReceiveOnlyTransmitter {
    pub fn new(payload: PayloadData) -> Self {
        Self { payload }
    }
}

impl Transmitter for ReceiveOnlyTransmitter {
    fn is_supported(&self) -> bool {
        false
    }

    fn payload_data(&self) -> Option<PayloadData> {
        Some(self.payload.clone())
    }

    fn payload_sharing_data(&self, _peer: &PeerRecord) -> Option<PayloadSharingData> {
        None
    }
}
