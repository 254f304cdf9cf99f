/// Connection protocol engine
///
/// Drives a single connection attempt: connect, capability discovery, then
/// the read/write signaling tasks chosen by the task policy, one at a time,
/// until no task remains and the peer is disconnected. The whole attempt
/// runs under the per-peer timeout; when it expires the connection is
/// force-closed and the registry forced to Disconnected.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::classifier::classify_characteristics;
use super::config::SensorConfig;
use super::delegate::SensorEvent;
use super::device::{ConnectionState, PeerId, PeerRecord, PeripheralHandle, PlatformType};
use super::radio::{RadioBridge, RadioError, RadioEvent, ServiceDescriptor, GATT_SUCCESS};
use super::registry::DeviceRegistry;
use super::signal::{signal_data_action_code, signal_data_payload, signal_data_rssi, SignalAction, SignalError};
use super::tasks::{NextTask, TaskPolicy};
use super::transmitter::Transmitter;
use crate::SensorError;

/// Connection attempt state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    ServicesDiscovered,
    Terminated,
}

/// How a connection attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Ran out of tasks and disconnected cleanly
    Completed,
    /// Per-peer timeout expired
    TimedOut,
    /// Refused by the radio, a task failed, or the link dropped abnormally
    Failed,
}

/// Reason a task could not be issued or did not complete
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskFailure {
    #[error("missing payload characteristic")]
    MissingPayloadCharacteristic,
    #[error("missing signal characteristic")]
    MissingSignalCharacteristic,
    #[error("missing payload data")]
    MissingPayloadData,
    #[error("missing payload sharing data")]
    MissingPayloadSharingData,
    #[error("missing RSSI data")]
    MissingRssiData,
    #[error("no read data")]
    NoReadData,
    #[error("operation reported failure")]
    OperationFailed,
    #[error(transparent)]
    Signal(#[from] SignalError),
    #[error(transparent)]
    Radio(#[from] RadioError),
}

/// Side effects collected while sessions run
#[derive(Debug, Default)]
pub struct SessionContext {
    /// Events to forward to delegates
    pub events: Vec<SensorEvent>,
    /// Radio events for other peers, applied after the dispatch pass
    pub deferred: Vec<RadioEvent>,
}

/// One connection attempt
#[derive(Debug, Clone)]
pub struct Session {
    peer: PeerId,
    peripheral: PeripheralHandle,
    state: SessionState,
    task: Option<NextTask>,
    failed: bool,
}

impl Session {
    fn new(peer: PeerId, peripheral: PeripheralHandle) -> Self {
        Self {
            peer,
            peripheral,
            state: SessionState::Disconnected,
            task: None,
            failed: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Task awaiting its completion event
    pub fn task(&self) -> Option<NextTask> {
        self.task
    }
}

/// Characteristic ids the engine looks for
#[derive(Debug, Clone, Copy)]
struct Capabilities {
    service: Uuid,
    platform_a_signal: Uuid,
    platform_b_signal: Uuid,
    payload: Uuid,
}

/// Runs connection attempts against the radio
pub struct ConnectionEngine {
    radio: Arc<dyn RadioBridge>,
    transmitter: Arc<dyn Transmitter>,
    policy: TaskPolicy,
    capabilities: Capabilities,
    timeout: Duration,
}

impl ConnectionEngine {
    pub fn new(config: &SensorConfig, radio: Arc<dyn RadioBridge>, transmitter: Arc<dyn Transmitter>) -> Self {
        Self {
            radio,
            transmitter,
            policy: TaskPolicy::from_config(config),
            capabilities: Capabilities {
                service: config.service_uuid,
                platform_a_signal: config.platform_a_signal_uuid,
                platform_b_signal: config.platform_b_signal_uuid,
                payload: config.payload_uuid,
            },
            timeout: config.connection_timeout(),
        }
    }

    pub fn policy(&self) -> &TaskPolicy {
        &self.policy
    }

    pub fn transmitter(&self) -> &dyn Transmitter {
        self.transmitter.as_ref()
    }

    /// Run one connection attempt to completion or timeout
    pub async fn run(
        &self,
        peer: &PeerId,
        registry: &mut DeviceRegistry,
        events: &mut mpsc::UnboundedReceiver<RadioEvent>,
        ctx: &mut SessionContext,
    ) -> SessionOutcome {
        let Some(peripheral) = registry.get(peer).and_then(|r| r.peripheral().cloned()) else {
            warn!(peer = %peer, "Connect skipped, no peripheral handle");
            return SessionOutcome::Failed;
        };

        let started = Instant::now();
        let mut session = Session::new(peer.clone(), peripheral.clone());
        debug!(peer = %peer, "Connect");

        let result = timeout(self.timeout, self.drive(&mut session, registry, events, ctx)).await;
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(peer = %peer, task = ?session.task, timeout = ?self.timeout, "Connection timed out");
                self.radio.close(&peripheral).await;
                registry.force_disconnected(peer, Instant::now());
                session.state = SessionState::Terminated;
                SessionOutcome::TimedOut
            }
        };

        let elapsed = started.elapsed();
        match outcome {
            SessionOutcome::Completed => debug!(peer = %peer, elapsed = ?elapsed, "Disconnected"),
            _ => warn!(peer = %peer, outcome = ?outcome, elapsed = ?elapsed, "Connection attempt unsuccessful"),
        }
        outcome
    }

    async fn drive(
        &self,
        session: &mut Session,
        registry: &mut DeviceRegistry,
        events: &mut mpsc::UnboundedReceiver<RadioEvent>,
        ctx: &mut SessionContext,
    ) -> SessionOutcome {
        if let Some(outcome) = self.connect(session, registry).await {
            return outcome;
        }

        while let Some(event) = events.recv().await {
            if event.peer() != Some(&session.peer) {
                ctx.deferred.push(event);
                continue;
            }
            if let Some(outcome) = self.on_event(session, registry, event, ctx).await {
                return outcome;
            }
        }

        warn!(peer = %session.peer, "Radio event feed closed mid-session");
        self.terminate(session, registry).await;
        SessionOutcome::Failed
    }

    async fn connect(&self, session: &mut Session, registry: &mut DeviceRegistry) -> Option<SessionOutcome> {
        let now = Instant::now();
        if registry
            .set_connection_state(&session.peer, ConnectionState::Connecting, now)
            .is_err()
        {
            session.state = SessionState::Terminated;
            return Some(SessionOutcome::Failed);
        }
        if let Some(record) = registry.get_mut(&session.peer) {
            record.register_connect_request(now);
        }
        session.state = SessionState::Connecting;

        if let Err(e) = self.radio.connect(&session.peripheral).await {
            let e = SensorError::from(e);
            if e.is_peer_scoped() {
                warn!(peer = %session.peer, error = %e, "Connect rejected");
            } else {
                error!(peer = %session.peer, error = %e, "Connect rejected by radio");
            }
            registry.force_disconnected(&session.peer, Instant::now());
            session.state = SessionState::Terminated;
            return Some(SessionOutcome::Failed);
        }
        None
    }

    async fn on_event(
        &self,
        session: &mut Session,
        registry: &mut DeviceRegistry,
        event: RadioEvent,
        ctx: &mut SessionContext,
    ) -> Option<SessionOutcome> {
        match event {
            RadioEvent::Connected { .. } => {
                if let Err(e) = registry.set_connection_state(&session.peer, ConnectionState::Connected, Instant::now()) {
                    debug!(peer = %session.peer, error = %e, "Unexpected connect event");
                    return None;
                }
                session.state = SessionState::Connected;
                debug!(peer = %session.peer, "Connected, discovering services");
                if let Err(e) = self.radio.discover_services(&session.peripheral).await {
                    warn!(peer = %session.peer, error = %e, "Service discovery rejected");
                    session.failed = true;
                    return self.disconnect(session, registry).await;
                }
                None
            }
            RadioEvent::ServicesDiscovered { services, .. } => {
                self.on_services_discovered(session, registry, &services).await
            }
            RadioEvent::CharacteristicRead {
                characteristic,
                value,
                success,
                ..
            } => {
                let result = self.on_read(session, registry, characteristic, value, success, ctx);
                self.after_task(session, registry, result).await
            }
            RadioEvent::CharacteristicWritten { value, success, .. } => {
                let result = self.on_write(session, registry, &value, success);
                self.after_task(session, registry, result).await
            }
            RadioEvent::Disconnected { status, .. } => {
                Some(self.on_disconnected(session, registry, status).await)
            }
            RadioEvent::StateChanged(_) => None,
        }
    }

    async fn on_services_discovered(
        &self,
        session: &mut Session,
        registry: &mut DeviceRegistry,
        services: &[ServiceDescriptor],
    ) -> Option<SessionOutcome> {
        let now = Instant::now();
        session.state = SessionState::ServicesDiscovered;
        let record = registry.get_mut(&session.peer)?;

        let Some(service) = services.iter().find(|s| s.uuid == self.capabilities.service) else {
            warn!(peer = %session.peer, platform = %record.platform(), "Protocol service missing");
            // Confirmed peers are retried on a later cycle instead
            if !record.platform().is_confirmed() {
                record.set_platform(PlatformType::Ignore, now);
            }
            session.failed = true;
            return self.disconnect(session, registry).await;
        };

        record.invalidate_characteristics();
        if let Some(platform) = classify_characteristics(
            &service.characteristics,
            self.capabilities.platform_a_signal,
            self.capabilities.platform_b_signal,
        ) {
            let signal = match platform {
                PlatformType::PlatformB => self.capabilities.platform_b_signal,
                _ => self.capabilities.platform_a_signal,
            };
            debug!(peer = %session.peer, platform = %platform, "Found signal characteristic");
            record.set_platform(platform, now);
            record.set_signal_characteristic(signal);
        }
        if service.characteristics.contains(&self.capabilities.payload) {
            debug!(peer = %session.peer, "Found payload characteristic");
            record.set_payload_characteristic(self.capabilities.payload);
        }

        self.next_task(session, registry).await
    }

    fn on_read(
        &self,
        session: &Session,
        registry: &mut DeviceRegistry,
        characteristic: Uuid,
        value: Option<Vec<u8>>,
        success: bool,
        ctx: &mut SessionContext,
    ) -> Result<(), TaskFailure> {
        if characteristic != self.capabilities.payload {
            debug!(peer = %session.peer, characteristic = %characteristic, "Read of unexpected characteristic");
            return Ok(());
        }
        if !success {
            return Err(TaskFailure::OperationFailed);
        }
        let payload = value.filter(|v| !v.is_empty()).ok_or(TaskFailure::NoReadData)?;
        let Some(record) = registry.get_mut(&session.peer) else {
            return Ok(());
        };
        record.set_payload(payload.into(), Instant::now());
        if let Some(payload) = record.payload() {
            debug!(peer = %session.peer, payload = %payload.short_name(), "Read payload");
            ctx.events.push(SensorEvent::DidRead {
                platform: record.platform(),
                payload: payload.clone(),
                peer: session.peer.clone(),
            });
        }
        Ok(())
    }

    fn on_write(
        &self,
        session: &Session,
        registry: &mut DeviceRegistry,
        value: &[u8],
        success: bool,
    ) -> Result<(), TaskFailure> {
        let action_code = signal_data_action_code(value);
        let Some(action) = SignalAction::from_code(action_code) else {
            warn!(peer = %session.peer, action_code, success, "Write of unknown data");
            return Ok(());
        };
        if !success {
            return Err(TaskFailure::OperationFailed);
        }
        let Some(record) = registry.get_mut(&session.peer) else {
            return Ok(());
        };
        let now = Instant::now();
        match action {
            SignalAction::WritePayload => record.register_write_payload(now),
            SignalAction::WriteRssi => record.register_write_rssi(now),
            SignalAction::WritePayloadSharing => record.register_write_payload_sharing(now),
        }
        debug!(peer = %session.peer, action = ?action, "Write succeeded");
        Ok(())
    }

    async fn after_task(
        &self,
        session: &mut Session,
        registry: &mut DeviceRegistry,
        result: Result<(), TaskFailure>,
    ) -> Option<SessionOutcome> {
        let task = session.task.take();
        match result {
            Ok(()) => self.next_task(session, registry).await,
            Err(reason) => {
                warn!(peer = %session.peer, task = ?task, reason = %reason, "Task failed");
                session.failed = true;
                self.disconnect(session, registry).await
            }
        }
    }

    /// Run the next pending task, or disconnect when none remains
    async fn next_task(&self, session: &mut Session, registry: &mut DeviceRegistry) -> Option<SessionOutcome> {
        let Some(record) = registry.get(&session.peer) else {
            return self.disconnect(session, registry).await;
        };
        let task = self.policy.next_task(record, self.transmitter.as_ref(), Instant::now());
        if task == NextTask::Nothing {
            debug!(peer = %session.peer, task = %task, "No further task");
            return self.disconnect(session, registry).await;
        }

        let requested = self.request(task, record, &session.peripheral).await;
        match requested {
            Ok(()) => {
                debug!(peer = %session.peer, task = %task, "Next task");
                session.task = Some(task);
                None
            }
            Err(reason) => {
                warn!(peer = %session.peer, task = %task, reason = %reason, "Next task failed");
                session.failed = true;
                self.disconnect(session, registry).await
            }
        }
    }

    /// Issue the radio operation for `task`
    async fn request(
        &self,
        task: NextTask,
        record: &PeerRecord,
        peripheral: &PeripheralHandle,
    ) -> Result<(), TaskFailure> {
        if task == NextTask::ReadPayload {
            let characteristic = record
                .payload_characteristic()
                .ok_or(TaskFailure::MissingPayloadCharacteristic)?;
            self.radio.read_characteristic(peripheral, characteristic).await?;
            return Ok(());
        }

        let signal = record
            .signal_characteristic()
            .ok_or(TaskFailure::MissingSignalCharacteristic)?;
        let data = match task {
            NextTask::WritePayload => {
                let payload = self.transmitter.payload_data().ok_or(TaskFailure::MissingPayloadData)?;
                signal_data_payload(SignalAction::WritePayload, payload.as_bytes())?
            }
            NextTask::WritePayloadSharing => {
                let sharing = self
                    .transmitter
                    .payload_sharing_data(record)
                    .filter(|sharing| !sharing.identifiers.is_empty())
                    .ok_or(TaskFailure::MissingPayloadSharingData)?;
                signal_data_payload(SignalAction::WritePayloadSharing, sharing.data.as_bytes())?
            }
            NextTask::WriteRssi => {
                let rssi = record.rssi().ok_or(TaskFailure::MissingRssiData)?;
                signal_data_rssi(rssi)
            }
            NextTask::ReadPayload | NextTask::Nothing => return Ok(()),
        };
        self.radio.write_characteristic(peripheral, signal, data).await?;
        Ok(())
    }

    /// Request a graceful disconnect; the session ends on the Disconnected event
    async fn disconnect(&self, session: &mut Session, registry: &mut DeviceRegistry) -> Option<SessionOutcome> {
        if let Err(e) = self.radio.disconnect(&session.peripheral).await {
            warn!(peer = %session.peer, error = %e, "Disconnect rejected, closing");
            self.terminate(session, registry).await;
            return Some(SessionOutcome::Failed);
        }
        None
    }

    async fn on_disconnected(&self, session: &mut Session, registry: &mut DeviceRegistry, status: u8) -> SessionOutcome {
        self.terminate(session, registry).await;
        if status != GATT_SUCCESS {
            warn!(peer = %session.peer, status, "Abnormal disconnect, ignoring peer");
            registry.set_platform(&session.peer, PlatformType::Ignore, Instant::now());
            return SessionOutcome::Failed;
        }
        if session.failed {
            SessionOutcome::Failed
        } else {
            SessionOutcome::Completed
        }
    }

    async fn terminate(&self, session: &mut Session, registry: &mut DeviceRegistry) {
        self.radio.close(&session.peripheral).await;
        registry.force_disconnected(&session.peer, Instant::now());
        session.state = SessionState::Terminated;
        session.task = None;
    }

    /// Apply a radio event that arrived outside its peer's session
    pub async fn apply_stray_event(&self, registry: &mut DeviceRegistry, event: RadioEvent) {
        let now = Instant::now();
        match event {
            RadioEvent::Disconnected { peer, status } => {
                debug!(peer = %peer, status, "Late disconnect");
                registry.force_disconnected(&peer, now);
                if status != GATT_SUCCESS {
                    registry.set_platform(&peer, PlatformType::Ignore, now);
                }
            }
            RadioEvent::Connected { peer } => {
                debug!(peer = %peer, "Late connect, closing");
                if let Some(peripheral) = registry.get(&peer).and_then(|r| r.peripheral().cloned()) {
                    self.radio.close(&peripheral).await;
                }
                registry.force_disconnected(&peer, now);
            }
            other => debug!(event = ?other, "Dropped stray radio event"),
        }
    }
}
