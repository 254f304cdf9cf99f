/// Sensor receiver task
///
/// A single tokio task owns the scan scheduler, the device registry and the
/// connection engine, and executes every radio operation in order. Commands
/// arrive through a `ReceiverHandle`; radio completions and power changes
/// arrive on the radio feed. The only timer is the deadline of the armed
/// duty-cycle step.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use super::config::SensorConfig;
use super::connection::{ConnectionEngine, SessionContext};
use super::delegate::{DelegateSet, SensorDelegate, SensorEvent};
use super::device::PeerRecord;
use super::radio::{Advertisement, RadioBridge, RadioEvent, RadioFeed, RadioState, ScanFilter};
use super::registry::DeviceRegistry;
use super::scanner::{ScanScheduler, ScanStep, ScannerError, ScannerState};
use super::tasks::{partition, pending_peers, DispatchPlan, DispatchReport};
use super::transmitter::Transmitter;
use crate::SensorError;

/// Commands accepted by the receiver task
#[derive(Debug)]
pub enum ReceiverCommand {
    /// Start the scan loop
    Start {
        reply: mpsc::Sender<Result<u64, ScannerError>>,
    },
    /// Stop hint
    Stop,
    /// Copy of the registry
    Snapshot { reply: mpsc::Sender<Vec<PeerRecord>> },
    /// Scheduler and dispatch summary
    Status { reply: mpsc::Sender<ReceiverStatus> },
    /// End the task
    Shutdown,
}

/// Summary of the receiver's state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverStatus {
    pub scanner: ScannerState,
    pub loop_id: Option<u64>,
    pub cycles: u64,
    pub peers: usize,
    /// Sightings with neither the service id nor platform-A data, since startup
    pub anomalous_sightings: u64,
    pub last_dispatch: Option<DispatchReport>,
}

/// Handle to communicate with the running receiver task
#[derive(Clone)]
pub struct ReceiverHandle {
    command_tx: mpsc::Sender<ReceiverCommand>,
}

impl ReceiverHandle {
    /// Start the scan loop; returns the loop identity
    pub async fn start(&self) -> Result<u64, SensorError> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.send(ReceiverCommand::Start { reply: reply_tx }).await?;

        let result = reply_rx.recv().await.ok_or(SensorError::ReceiverClosed)?;
        Ok(result?)
    }

    /// Stop hint; the loop keeps running while the radio is powered on
    pub async fn stop(&self) -> Result<(), SensorError> {
        self.send(ReceiverCommand::Stop).await
    }

    /// Copy of every registry record, ordered by identifier
    pub async fn snapshot(&self) -> Result<Vec<PeerRecord>, SensorError> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.send(ReceiverCommand::Snapshot { reply: reply_tx }).await?;
        reply_rx.recv().await.ok_or(SensorError::ReceiverClosed)
    }

    pub async fn status(&self) -> Result<ReceiverStatus, SensorError> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.send(ReceiverCommand::Status { reply: reply_tx }).await?;
        reply_rx.recv().await.ok_or(SensorError::ReceiverClosed)
    }

    pub async fn shutdown(&self) -> Result<(), SensorError> {
        self.send(ReceiverCommand::Shutdown).await
    }

    async fn send(&self, command: ReceiverCommand) -> Result<(), SensorError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| SensorError::ReceiverClosed)
    }
}

/// Scan, classify and connect engine
pub struct SensorReceiver {
    config: SensorConfig,
    radio: Arc<dyn RadioBridge>,
    filter: ScanFilter,
    scheduler: ScanScheduler,
    registry: DeviceRegistry,
    engine: ConnectionEngine,
    delegates: DelegateSet,
    feed: RadioFeed,
    command_rx: mpsc::Receiver<ReceiverCommand>,
    last_dispatch: Option<DispatchReport>,
    anomalous_sightings: u64,
}

impl SensorReceiver {
    pub fn new(
        config: SensorConfig,
        radio: Arc<dyn RadioBridge>,
        transmitter: Arc<dyn Transmitter>,
        feed: RadioFeed,
    ) -> Result<(Self, ReceiverHandle), SensorError> {
        let scheduler = ScanScheduler::new(&config)?;
        let (command_tx, command_rx) = mpsc::channel(32);

        let receiver = Self {
            filter: ScanFilter::from_config(&config),
            registry: DeviceRegistry::new(&config),
            engine: ConnectionEngine::new(&config, radio.clone(), transmitter),
            delegates: DelegateSet::new(),
            radio,
            scheduler,
            feed,
            command_rx,
            last_dispatch: None,
            anomalous_sightings: 0,
            config,
        };
        Ok((receiver, ReceiverHandle { command_tx }))
    }

    pub fn add_delegate(&mut self, delegate: Arc<dyn SensorDelegate>) {
        self.delegates.add(delegate);
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn scheduler(&self) -> &ScanScheduler {
        &self.scheduler
    }

    /// Spawn the receiver on the current runtime
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run until shutdown or until every handle is dropped
    pub async fn run(mut self) {
        let state = self.radio.state().await;
        self.on_state(state);
        info!(state = %state, "Sensor receiver running");

        loop {
            let deadline = self.scheduler.next_deadline();
            tokio::select! {
                command = self.command_rx.recv() => {
                    match command {
                        Some(ReceiverCommand::Shutdown) | None => break,
                        Some(command) => self.on_command(command).await,
                    }
                }
                event = self.feed.events.recv() => {
                    match event {
                        Some(event) => self.on_radio_event(event).await,
                        None => {
                            warn!("Radio event feed closed");
                            break;
                        }
                    }
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.step().await;
                }
            }
        }

        if self.scheduler.state() == ScannerState::Scanning {
            if let Err(e) = self.radio.stop_scan().await {
                debug!(error = %e, "Stop scan on shutdown failed");
            }
        }
        info!(peers = self.registry.len(), "Sensor receiver stopped");
    }

    async fn on_command(&mut self, command: ReceiverCommand) {
        match command {
            ReceiverCommand::Start { reply } => {
                let result = self.scheduler.start(Instant::now());
                let _ = reply.send(result).await;
            }
            ReceiverCommand::Stop => self.scheduler.stop(),
            ReceiverCommand::Snapshot { reply } => {
                let _ = reply.send(self.registry.snapshot()).await;
            }
            ReceiverCommand::Status { reply } => {
                let status = ReceiverStatus {
                    scanner: self.scheduler.state(),
                    loop_id: self.scheduler.loop_id(),
                    cycles: self.scheduler.cycles(),
                    peers: self.registry.len(),
                    anomalous_sightings: self.anomalous_sightings,
                    last_dispatch: self.last_dispatch,
                };
                let _ = reply.send(status).await;
            }
            ReceiverCommand::Shutdown => {}
        }
    }

    fn on_state(&mut self, state: RadioState) {
        debug!(state = %state, "Radio state");
        self.delegates.notify(&SensorEvent::DidUpdateState(state));
        self.scheduler.set_powered(state == RadioState::PoweredOn, Instant::now());
    }

    async fn on_radio_event(&mut self, event: RadioEvent) {
        match event {
            RadioEvent::StateChanged(state) => self.on_state(state),
            event => self.engine.apply_stray_event(&mut self.registry, event).await,
        }
    }

    /// Execute the armed duty-cycle step
    async fn step(&mut self) {
        let Some(armed) = self.scheduler.take_due(Instant::now()) else {
            return;
        };
        if self.scheduler.ensure_powered().is_err() {
            if armed.step == ScanStep::StopScan {
                self.abandon_scan().await;
            }
            return;
        }
        debug!(loop_id = armed.loop_id, step = ?armed.step, "Scan step");

        match armed.step {
            ScanStep::StartScan => self.start_scan().await,
            ScanStep::StopScan => self.stop_scan().await,
            ScanStep::Restart => {
                // Power was checked above, so the restart cannot be denied here
                let _ = self.scheduler.restart(Instant::now());
            }
        }
    }

    async fn start_scan(&mut self) {
        let stale = self.drain_sightings();
        if !stale.is_empty() {
            debug!(count = stale.len(), "Discarding sightings from before this scan");
        }
        match self.radio.start_scan(&self.filter).await {
            Ok(()) => self.scheduler.scan_started(Instant::now()),
            Err(e) => {
                warn!(error = %e, "Start scan failed");
                self.scheduler.park(&e.to_string());
            }
        }
    }

    async fn stop_scan(&mut self) {
        if let Err(e) = self.radio.stop_scan().await {
            warn!(error = %e, "Stop scan failed");
        }

        let sightings = self.drain_sightings();
        let now = Instant::now();
        let report = self.registry.ingest(sightings, now);
        if report.anomalous > 0 {
            self.anomalous_sightings += report.anomalous as u64;
            warn!(anomalous = report.anomalous, "Scan filter let through unrelated advertisements");
        }
        self.delegates.notify_all(&report.events);
        self.registry.remove_expired(now);

        let dispatch = self.dispatch().await;
        self.last_dispatch = Some(dispatch);
        self.scheduler.scan_stopped(Instant::now());
    }

    /// Window cut short by power loss; its sightings are dropped unprocessed
    async fn abandon_scan(&mut self) {
        if let Err(e) = self.radio.stop_scan().await {
            debug!(error = %e, "Stop scan after power loss failed");
        }
        let dropped = self.drain_sightings();
        info!(dropped = dropped.len(), "Scan window abandoned on power loss");
    }

    fn drain_sightings(&mut self) -> Vec<Advertisement> {
        let mut sightings = Vec::new();
        while let Ok(sighting) = self.feed.sightings.try_recv() {
            sightings.push(sighting);
        }
        sightings
    }

    /// Connect to pending peers, longest waiting first, within the budget
    async fn dispatch(&mut self) -> DispatchReport {
        let now = Instant::now();
        let status = partition(&self.registry, now);
        let pending = pending_peers(
            &self.registry,
            &status.disconnected,
            self.engine.transmitter(),
            self.engine.policy(),
            now,
        );

        let mut plan = DispatchPlan::new(pending, now, self.config.dispatch_budget());
        let mut ctx = SessionContext::default();
        while let Some(peer) = plan.next_peer(Instant::now()) {
            let outcome = self
                .engine
                .run(&peer, &mut self.registry, &mut self.feed.events, &mut ctx)
                .await;
            plan.record(outcome);
            self.delegates.notify_all(&ctx.events);
            ctx.events.clear();
        }
        let report = plan.finish(Instant::now());

        for event in ctx.deferred {
            self.on_radio_event(event).await;
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::config::PROTOCOL_SERVICE_UUID;
    use crate::sensor::device::{PayloadData, PeerId, PeripheralHandle};
    use crate::sensor::radio::{radio_channel, RadioError};
    use crate::sensor::transmitter::ReceiveOnlyTransmitter;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use uuid::Uuid;

    /// Radio that only records scan calls
    #[derive(Default)]
    struct ScanOnlyRadio {
        state: Mutex<Option<RadioState>>,
        calls: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl RadioBridge for ScanOnlyRadio {
        async fn state(&self) -> RadioState {
            self.state.lock().unwrap_or(RadioState::PoweredOn)
        }

        async fn start_scan(&self, _filter: &ScanFilter) -> Result<(), RadioError> {
            self.calls.lock().push("start_scan");
            Ok(())
        }

        async fn stop_scan(&self) -> Result<(), RadioError> {
            self.calls.lock().push("stop_scan");
            Ok(())
        }

        async fn connect(&self, _peripheral: &PeripheralHandle) -> Result<(), RadioError> {
            Err(RadioError::Unavailable)
        }

        async fn disconnect(&self, _peripheral: &PeripheralHandle) -> Result<(), RadioError> {
            Ok(())
        }

        async fn close(&self, _peripheral: &PeripheralHandle) {}

        async fn discover_services(&self, _peripheral: &PeripheralHandle) -> Result<(), RadioError> {
            Ok(())
        }

        async fn read_characteristic(&self, _peripheral: &PeripheralHandle, _c: Uuid) -> Result<(), RadioError> {
            Ok(())
        }

        async fn write_characteristic(
            &self,
            _peripheral: &PeripheralHandle,
            _c: Uuid,
            _value: Vec<u8>,
        ) -> Result<(), RadioError> {
            Ok(())
        }
    }

    fn receiver(radio: Arc<ScanOnlyRadio>, feed: RadioFeed) -> (SensorReceiver, ReceiverHandle) {
        let transmitter = Arc::new(ReceiveOnlyTransmitter::new(PayloadData::new(vec![1])));
        SensorReceiver::new(SensorConfig::default(), radio, transmitter, feed).expect("receiver")
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_while_running_is_denied() {
        let (_link, feed) = radio_channel();
        let (receiver, handle) = receiver(Arc::new(ScanOnlyRadio::default()), feed);
        let task = receiver.spawn();

        // Powered on at startup, so the loop is already running
        let status = handle.status().await.expect("status");
        let loop_id = status.loop_id.expect("loop running");

        let result = handle.start().await;
        assert!(matches!(
            result,
            Err(SensorError::Scanner(ScannerError::AlreadyRunning))
        ));
        assert_eq!(handle.status().await.expect("status").loop_id, Some(loop_id));

        handle.shutdown().await.expect("shutdown");
        task.await.expect("join");
    }

    #[tokio::test(start_paused = true)]
    async fn test_duty_cycle_alternates_scan_calls() {
        let (_link, feed) = radio_channel();
        let radio = Arc::new(ScanOnlyRadio::default());
        let (receiver, handle) = receiver(radio.clone(), feed);
        let task = receiver.spawn();

        // Two full cycles: 8s on, 4s off
        tokio::time::sleep(std::time::Duration::from_secs(25)).await;
        let status = handle.status().await.expect("status");
        assert_eq!(status.cycles, 2);
        assert_eq!(
            *radio.calls.lock(),
            vec!["start_scan", "stop_scan", "start_scan", "stop_scan", "start_scan"]
        );

        handle.shutdown().await.expect("shutdown");
        task.await.expect("join");
    }

    #[tokio::test(start_paused = true)]
    async fn test_powered_off_radio_waits_for_power_on() {
        let (link, feed) = radio_channel();
        let radio = Arc::new(ScanOnlyRadio::default());
        *radio.state.lock() = Some(RadioState::PoweredOff);
        let (receiver, handle) = receiver(radio.clone(), feed);
        let task = receiver.spawn();

        assert!(matches!(
            handle.start().await,
            Err(SensorError::Scanner(ScannerError::NotPoweredOn))
        ));
        assert!(radio.calls.lock().is_empty());

        link.event(RadioEvent::StateChanged(RadioState::PoweredOn));
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        assert_eq!(*radio.calls.lock(), vec!["start_scan"]);
        assert_eq!(handle.status().await.expect("status").scanner, ScannerState::Scanning);

        handle.shutdown().await.expect("shutdown");
        task.await.expect("join");
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_off_parks_loop() {
        let (link, feed) = radio_channel();
        let radio = Arc::new(ScanOnlyRadio::default());
        let (receiver, handle) = receiver(radio.clone(), feed);
        let task = receiver.spawn();

        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        link.event(RadioEvent::StateChanged(RadioState::PoweredOff));
        tokio::time::sleep(std::time::Duration::from_secs(10)).await;

        let status = handle.status().await.expect("status");
        assert_eq!(status.scanner, ScannerState::Stopped);
        assert_eq!(status.loop_id, None);
        assert_eq!(*radio.calls.lock(), vec!["start_scan", "stop_scan"]);

        handle.shutdown().await.expect("shutdown");
        task.await.expect("join");
    }

    #[tokio::test(start_paused = true)]
    async fn test_sightings_from_before_power_loss_are_dropped() {
        let (link, feed) = radio_channel();
        let radio = Arc::new(ScanOnlyRadio::default());
        let (receiver, handle) = receiver(radio.clone(), feed);
        let task = receiver.spawn();

        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        let gone = Advertisement::new(PeerId::new("gone"), PeripheralHandle::new("hci0/gone"))
            .with_rssi(-58)
            .with_service(PROTOCOL_SERVICE_UUID);
        assert!(link.sighting(gone));
        link.event(RadioEvent::StateChanged(RadioState::PoweredOff));

        tokio::time::sleep(std::time::Duration::from_secs(2 * 60 * 60)).await;
        link.event(RadioEvent::StateChanged(RadioState::PoweredOn));
        tokio::time::sleep(std::time::Duration::from_secs(9)).await;

        let status = handle.status().await.expect("status");
        assert_eq!(status.cycles, 1);
        assert_eq!(status.anomalous_sightings, 0);
        assert!(handle.snapshot().await.expect("snapshot").is_empty());
        assert_eq!(
            *radio.calls.lock(),
            vec!["start_scan", "stop_scan", "start_scan", "stop_scan"]
        );

        handle.shutdown().await.expect("shutdown");
        task.await.expect("join");
    }

    #[tokio::test(start_paused = true)]
    async fn test_anomalous_sightings_are_counted_in_status() {
        let (link, feed) = radio_channel();
        let (receiver, handle) = receiver(Arc::new(ScanOnlyRadio::default()), feed);
        let task = receiver.spawn();

        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        let stray = Advertisement::new(PeerId::new("stray"), PeripheralHandle::new("hci0/stray"));
        assert!(link.sighting(stray));
        tokio::time::sleep(std::time::Duration::from_secs(8)).await;

        let status = handle.status().await.expect("status");
        assert_eq!(status.cycles, 1);
        assert_eq!(status.anomalous_sightings, 1);

        handle.shutdown().await.expect("shutdown");
        task.await.expect("join");
    }
}
