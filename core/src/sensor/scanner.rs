/// Duty-cycled scan scheduler
///
/// The scan loop alternates a scanning window and an idle window while the
/// radio is powered on. The scheduler itself never sleeps or touches the
/// radio: each stage arms exactly one `ScanStep` with a deadline, and the
/// receiver task executes the step when the deadline passes, then reports
/// back so the next step can be armed.
///
/// ```text
/// Stopped --start--> Starting --StartScan--> Scanning --StopScan--> Idle
///    ^                  ^                                             |
///    |                  +------------------Restart--------------------+
///    +------ park (radio unavailable / powered off) ------------------+
/// ```

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::config::SensorConfig;

/// Errors for scan loop control
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScannerError {
    #[error("Scan loop already running")]
    AlreadyRunning,
    #[error("Radio not powered on")]
    NotPoweredOn,
    #[error("Invalid sensor configuration: {0}")]
    InvalidConfig(String),
}

/// Scan loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScannerState {
    /// No loop; waiting for start or power-on
    Stopped,
    /// Loop started, scan about to begin
    Starting,
    /// Radio scanning
    Scanning,
    /// Radio idle between scans
    Idle,
}

/// Next stage of the duty cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStep {
    /// Start a radio scan
    StartScan,
    /// Stop the radio scan, process sightings and dispatch connections
    StopScan,
    /// Idle window over, begin the next cycle
    Restart,
}

/// The single step the receiver has to execute next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArmedStep {
    pub step: ScanStep,
    pub loop_id: u64,
    pub at: Instant,
}

/// Duty-cycle state machine
pub struct ScanScheduler {
    state: ScannerState,
    loop_id: Option<u64>,
    loops_started: u64,
    powered_on: bool,
    scan_on: Duration,
    scan_off: Duration,
    armed: Option<ArmedStep>,
    cycles: u64,
}

impl ScanScheduler {
    /// Create a new scheduler from a validated configuration
    pub fn new(config: &SensorConfig) -> Result<Self, ScannerError> {
        config.validate()?;

        Ok(Self {
            state: ScannerState::Stopped,
            loop_id: None,
            loops_started: 0,
            powered_on: false,
            scan_on: config.scan_on(),
            scan_off: config.scan_off(),
            armed: None,
            cycles: 0,
        })
    }

    pub fn state(&self) -> ScannerState {
        self.state
    }

    /// Identity of the running loop
    pub fn loop_id(&self) -> Option<u64> {
        self.loop_id
    }

    pub fn is_running(&self) -> bool {
        self.state != ScannerState::Stopped
    }

    pub fn is_powered_on(&self) -> bool {
        self.powered_on
    }

    /// Completed scan windows since creation
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn armed(&self) -> Option<ArmedStep> {
        self.armed
    }

    /// Deadline of the armed step, if any
    pub fn next_deadline(&self) -> Option<Instant> {
        self.armed.map(|armed| armed.at)
    }

    /// Start the scan loop
    ///
    /// Rejected while a loop is running; the running loop keeps its identity.
    pub fn start(&mut self, now: Instant) -> Result<u64, ScannerError> {
        if let Some(loop_id) = self.loop_id.filter(|_| self.is_running()) {
            warn!(loop_id, state = ?self.state, "Scan loop start denied, already running");
            return Err(ScannerError::AlreadyRunning);
        }
        if !self.powered_on {
            info!("Scan loop start deferred until radio powers on");
            return Err(ScannerError::NotPoweredOn);
        }

        self.loops_started += 1;
        let loop_id = self.loops_started;
        self.loop_id = Some(loop_id);
        self.state = ScannerState::Starting;
        self.arm(ScanStep::StartScan, now);
        info!(loop_id, "Scan loop started");
        Ok(loop_id)
    }

    /// Stop hint; the loop follows radio power state, not this call
    pub fn stop(&self) {
        info!(
            loop_id = ?self.loop_id,
            state = ?self.state,
            "Scan loop stop requested, loop continues while radio is powered on"
        );
    }

    /// Record a radio power change; power-on starts the loop when stopped.
    ///
    /// Returns true when a new loop was started.
    pub fn set_powered(&mut self, powered_on: bool, now: Instant) -> bool {
        self.powered_on = powered_on;
        if powered_on {
            self.start(now).is_ok()
        } else {
            debug!(loop_id = ?self.loop_id, "Radio powered off, scan loop parks at next step");
            false
        }
    }

    /// Take the armed step once its deadline has passed
    pub fn take_due(&mut self, now: Instant) -> Option<ArmedStep> {
        match self.armed {
            Some(armed) if armed.at <= now => self.armed.take(),
            _ => None,
        }
    }

    /// Deny the step when the radio is off, parking the loop
    pub fn ensure_powered(&mut self) -> Result<(), ScannerError> {
        if self.powered_on {
            return Ok(());
        }
        self.park("radio not powered on");
        Err(ScannerError::NotPoweredOn)
    }

    /// Radio scan started; arms the stop at the end of the scanning window
    pub fn scan_started(&mut self, now: Instant) {
        self.state = ScannerState::Scanning;
        self.arm(ScanStep::StopScan, now + self.scan_on);
        debug!(loop_id = ?self.loop_id, window = ?self.scan_on, "Scanning");
    }

    /// Scan window processed; arms the restart at the end of the idle window
    pub fn scan_stopped(&mut self, now: Instant) {
        self.state = ScannerState::Idle;
        self.cycles += 1;
        self.arm(ScanStep::Restart, now + self.scan_off);
        debug!(loop_id = ?self.loop_id, window = ?self.scan_off, cycles = self.cycles, "Idle");
    }

    /// Idle window over; arms the next scan
    pub fn restart(&mut self, now: Instant) -> Result<(), ScannerError> {
        self.ensure_powered()?;
        self.state = ScannerState::Starting;
        self.arm(ScanStep::StartScan, now);
        Ok(())
    }

    /// Stop the loop until the next power-on
    pub fn park(&mut self, reason: &str) {
        warn!(loop_id = ?self.loop_id, reason, "Scan loop parked until next power-on");
        self.state = ScannerState::Stopped;
        self.loop_id = None;
        self.armed = None;
    }

    fn arm(&mut self, step: ScanStep, at: Instant) {
        if let Some(loop_id) = self.loop_id {
            self.armed = Some(ArmedStep { step, loop_id, at });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> ScanScheduler {
        ScanScheduler::new(&SensorConfig::default()).expect("Valid config")
    }

    #[test]
    fn test_scheduler_initial_state() {
        let scheduler = scheduler();
        assert_eq!(scheduler.state(), ScannerState::Stopped);
        assert!(scheduler.loop_id().is_none());
        assert!(scheduler.next_deadline().is_none());
        assert!(!scheduler.is_running());
    }

    #[test]
    fn test_scheduler_rejects_invalid_config() {
        let config = SensorConfig {
            scan_off_ms: 0,
            ..SensorConfig::default()
        };
        assert!(matches!(
            ScanScheduler::new(&config),
            Err(ScannerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_start_requires_power() {
        let mut scheduler = scheduler();
        let now = Instant::now();

        assert_eq!(scheduler.start(now), Err(ScannerError::NotPoweredOn));
        assert_eq!(scheduler.state(), ScannerState::Stopped);
    }

    #[test]
    fn test_start_twice_keeps_loop_identity() {
        let mut scheduler = scheduler();
        let now = Instant::now();

        assert!(scheduler.set_powered(true, now));
        let loop_id = scheduler.loop_id().expect("Loop running");

        assert_eq!(scheduler.start(now), Err(ScannerError::AlreadyRunning));
        assert!(!scheduler.set_powered(true, now));
        assert_eq!(scheduler.loop_id(), Some(loop_id));
    }

    #[test]
    fn test_full_duty_cycle() {
        let mut scheduler = scheduler();
        let t0 = Instant::now();
        scheduler.set_powered(true, t0);

        let step = scheduler.take_due(t0).expect("StartScan due");
        assert_eq!(step.step, ScanStep::StartScan);
        scheduler.scan_started(t0);
        assert_eq!(scheduler.state(), ScannerState::Scanning);
        assert_eq!(scheduler.next_deadline(), Some(t0 + Duration::from_secs(8)));

        // Not due yet
        assert!(scheduler.take_due(t0 + Duration::from_secs(7)).is_none());

        let t1 = t0 + Duration::from_secs(8);
        assert_eq!(scheduler.take_due(t1).map(|a| a.step), Some(ScanStep::StopScan));
        scheduler.scan_stopped(t1);
        assert_eq!(scheduler.state(), ScannerState::Idle);
        assert_eq!(scheduler.cycles(), 1);

        let t2 = t1 + Duration::from_secs(4);
        assert_eq!(scheduler.take_due(t2).map(|a| a.step), Some(ScanStep::Restart));
        scheduler.restart(t2).expect("Powered");
        assert_eq!(scheduler.take_due(t2).map(|a| a.step), Some(ScanStep::StartScan));
    }

    #[test]
    fn test_power_off_parks_at_next_step() {
        let mut scheduler = scheduler();
        let t0 = Instant::now();
        scheduler.set_powered(true, t0);
        scheduler.take_due(t0);
        scheduler.scan_started(t0);

        scheduler.set_powered(false, t0);
        assert!(scheduler.is_running());

        let t1 = t0 + Duration::from_secs(8);
        scheduler.take_due(t1);
        scheduler.scan_stopped(t1);
        let t2 = t1 + Duration::from_secs(4);
        scheduler.take_due(t2);
        assert_eq!(scheduler.restart(t2), Err(ScannerError::NotPoweredOn));
        assert_eq!(scheduler.state(), ScannerState::Stopped);
        assert!(scheduler.next_deadline().is_none());
    }

    #[test]
    fn test_power_on_after_park_starts_new_loop() {
        let mut scheduler = scheduler();
        let t0 = Instant::now();
        scheduler.set_powered(true, t0);
        let first = scheduler.loop_id().expect("First loop");

        scheduler.park("radio unavailable");
        assert!(scheduler.set_powered(true, t0));
        let second = scheduler.loop_id().expect("Second loop");
        assert_ne!(first, second);
    }

    #[test]
    fn test_stop_is_only_a_hint() {
        let mut scheduler = scheduler();
        let t0 = Instant::now();
        scheduler.set_powered(true, t0);

        scheduler.stop();
        assert_eq!(scheduler.state(), ScannerState::Starting);
        assert!(scheduler.next_deadline().is_some());
    }
}
