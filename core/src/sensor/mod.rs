// Proximity sensor engine
//
// Duty-cycled scanning feeds sightings into the device registry; once per
// cycle the task scheduler picks peers with pending work and the connection
// engine exchanges payloads with them over the signal protocol.

pub mod classifier;
pub mod config;
pub mod connection;
pub mod delegate;
pub mod device;
pub mod radio;
pub mod receiver;
pub mod registry;
pub mod scanner;
pub mod signal;
pub mod tasks;
pub mod transmitter;

pub use classifier::{classify, classify_characteristics, Classification};
pub use config::{
    SensorConfig, PAYLOAD_CHARACTERISTIC_UUID, PLATFORM_A_MANUFACTURER_ID, PLATFORM_A_SIGNAL_UUID,
    PLATFORM_B_SIGNAL_UUID, PROTOCOL_SERVICE_UUID,
};
pub use connection::{ConnectionEngine, SessionContext, SessionOutcome, SessionState, TaskFailure};
pub use delegate::{DelegateSet, SensorDelegate, SensorEvent};
pub use device::{
    ConnectionState, PayloadData, PayloadSharingData, PeerId, PeerRecord, PeripheralHandle,
    PlatformType,
};
pub use radio::{
    radio_channel, Advertisement, RadioBridge, RadioError, RadioEvent, RadioFeed, RadioLink,
    RadioState, ScanFilter, ServiceDescriptor, GATT_SUCCESS,
};
pub use receiver::{ReceiverCommand, ReceiverHandle, ReceiverStatus, SensorReceiver};
pub use registry::{DeviceRegistry, IngestReport};
pub use scanner::{ArmedStep, ScanScheduler, ScanStep, ScannerError, ScannerState};
pub use signal::{
    signal_data, signal_data_action_code, signal_data_payload, signal_data_rssi, SignalAction,
    SignalEnvelope, SignalError, SIGNAL_HEADER_SIZE,
};
pub use tasks::{DispatchPlan, DispatchReport, NextTask, PendingPeer, RegistryStatus, TaskPolicy};
pub use transmitter::{ReceiveOnlyTransmitter, Transmitter};
