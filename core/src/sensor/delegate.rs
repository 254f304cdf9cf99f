/// Outbound sensor events and the delegate interface that consumes them
///
/// Delegates are consumers only (logging, persistence, analytics); nothing
/// they do feeds back into the engine.

use std::sync::Arc;

use super::device::{PayloadData, PeerId, PlatformType};
use super::radio::RadioState;

/// Event produced by the engine for its delegates
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SensorEvent {
    /// Signal strength sampled for a peer
    DidMeasure {
        platform: PlatformType,
        rssi: i16,
        peer: PeerId,
    },
    /// Identity payload read from a peer
    DidRead {
        platform: PlatformType,
        payload: PayloadData,
        peer: PeerId,
    },
    /// Local radio power state changed
    DidUpdateState(RadioState),
}

/// Consumer of sensor events
pub trait SensorDelegate: Send + Sync {
    fn did_measure(&self, _platform: PlatformType, _rssi: i16, _peer: &PeerId) {}

    fn did_read(&self, _platform: PlatformType, _payload: &PayloadData, _peer: &PeerId) {}

    fn did_update_state(&self, _state: RadioState) {}
}

/// Fan events out to every registered delegate, in registration order
#[derive(Default, Clone)]
pub struct DelegateSet {
    delegates: Vec<Arc<dyn SensorDelegate>>,
}

impl DelegateSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, delegate: Arc<dyn SensorDelegate>) {
        self.delegates.push(delegate);
    }

    pub fn len(&self) -> usize {
        self.delegates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.delegates.is_empty()
    }

    pub fn notify(&self, event: &SensorEvent) {
        for delegate in &self.delegates {
            match event {
                SensorEvent::DidMeasure { platform, rssi, peer } => {
                    delegate.did_measure(*platform, *rssi, peer)
                }
                SensorEvent::DidRead {
                    platform,
                    payload,
                    peer,
                } => delegate.did_read(*platform, payload, peer),
                SensorEvent::DidUpdateState(state) => delegate.did_update_state(*state),
            }
        }
    }

    pub fn notify_all(&self, events: &[SensorEvent]) {
        for event in events {
            self.notify(event);
        }
    }
}
