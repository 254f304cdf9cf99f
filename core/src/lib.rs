// Proxima Core: proximity sensing engine
//
// Finds nearby peers over BLE under a strict scan duty cycle, works out what
// platform each one runs, and swaps a small identity payload with every peer
// it can reach inside a bounded connection budget.

pub mod sensor;

use thiserror::Error;

pub use sensor::{
    radio_channel, Advertisement, ConnectionState, PayloadData, PayloadSharingData, PeerId,
    PeerRecord, PeripheralHandle, PlatformType, RadioBridge, RadioError, RadioEvent, RadioFeed,
    RadioLink, RadioState, ReceiveOnlyTransmitter, ReceiverHandle, ReceiverStatus, ScanFilter,
    ScannerError, SensorConfig, SensorDelegate, SensorEvent, SensorReceiver, ServiceDescriptor,
    SignalError, Transmitter,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SensorError {
    #[error("Radio error: {0}")]
    Radio(#[from] RadioError),
    #[error("Scanner error: {0}")]
    Scanner(#[from] ScannerError),
    #[error("Signal error: {0}")]
    Signal(#[from] SignalError),
    #[error("Invalid connection state transition for {peer}: {from} -> {to}")]
    InvalidTransition {
        peer: PeerId,
        from: ConnectionState,
        to: ConnectionState,
    },
    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerId),
    #[error("Receiver task not running")]
    ReceiverClosed,
}

impl SensorError {
    /// Failure confined to one peer; the engine carries on and retries next cycle
    pub fn is_peer_scoped(&self) -> bool {
        match self {
            SensorError::InvalidTransition { .. } | SensorError::UnknownPeer(_) => true,
            SensorError::Radio(e) => matches!(
                e,
                RadioError::Rejected(_) | RadioError::UnknownPeripheral(_)
            ),
            SensorError::Signal(_) => true,
            SensorError::Scanner(_) | SensorError::ReceiverClosed => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_scoped_errors() {
        assert!(SensorError::UnknownPeer(PeerId::new("p")).is_peer_scoped());
        assert!(SensorError::from(RadioError::Rejected("busy".into())).is_peer_scoped());
        assert!(!SensorError::from(RadioError::PoweredOff).is_peer_scoped());
        assert!(!SensorError::from(ScannerError::AlreadyRunning).is_peer_scoped());
        assert!(!SensorError::ReceiverClosed.is_peer_scoped());
    }

    #[test]
    fn test_transition_error_message() {
        let err = SensorError::InvalidTransition {
            peer: PeerId::new("p1"),
            from: ConnectionState::Disconnected,
            to: ConnectionState::Connected,
        };
        assert_eq!(
            err.to_string(),
            "Invalid connection state transition for p1: disconnected -> connected"
        );
    }
}
