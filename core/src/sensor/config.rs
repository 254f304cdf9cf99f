/// Sensor configuration
///
/// Timing windows, connection budgets and the well-known capability identifiers
/// shared by every peer running the protocol. Durations are stored as plain
/// integers so the configuration round-trips through JSON unchanged.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use super::scanner::ScannerError;

/// Protocol service advertised by every participating peer
pub const PROTOCOL_SERVICE_UUID: Uuid = Uuid::from_u128(0x4281_32af_4746_42d3_801e_4572_d65b_fd9b);

/// Signal characteristic exposed by platform-A peers
pub const PLATFORM_A_SIGNAL_UUID: Uuid = Uuid::from_u128(0x0eb0_d5f2_eae4_4a9a_8af3_a4ad_b02d_4363);

/// Signal characteristic exposed by platform-B peers
pub const PLATFORM_B_SIGNAL_UUID: Uuid = Uuid::from_u128(0xf617_b813_092e_437a_8324_e09a_8082_1a11);

/// Payload characteristic, readable on both platforms
pub const PAYLOAD_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x3e98_c0f8_8f05_4829_a121_43e3_8f89_33e7);

/// Manufacturer id carried in platform-A advertisements (0x004C)
pub const PLATFORM_A_MANUFACTURER_ID: u16 = 0x004C;

/// Configuration for the scan/connect engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Scanning window in milliseconds (default 8s)
    pub scan_on_ms: u64,
    /// Idle window between scans in milliseconds (default 4s)
    pub scan_off_ms: u64,
    /// Time a single peer gets to finish its pending tasks (default 10s)
    pub connection_timeout_ms: u64,
    /// Total time budget for starting connections in one duty cycle (default 30s)
    pub dispatch_budget_ms: u64,
    /// Time before an ignored peer is reconsidered (default 5 minutes)
    pub ignore_cooldown_secs: u64,
    /// Time since last discovery after which a peer is forgotten (default 1 hour)
    pub expiry_secs: u64,
    /// Minimum interval between RSSI writes to the same peer (default 15s)
    pub rssi_write_interval_secs: u64,
    /// Minimum interval between payload sharing writes to the same peer (default 150s)
    pub payload_sharing_interval_secs: u64,
    /// Protocol service id
    pub service_uuid: Uuid,
    /// Platform-A signal characteristic id
    pub platform_a_signal_uuid: Uuid,
    /// Platform-B signal characteristic id
    pub platform_b_signal_uuid: Uuid,
    /// Payload characteristic id
    pub payload_uuid: Uuid,
    /// Platform-A manufacturer id
    pub platform_a_manufacturer_id: u16,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            scan_on_ms: 8_000,
            scan_off_ms: 4_000,
            connection_timeout_ms: 10_000,
            dispatch_budget_ms: 30_000,
            ignore_cooldown_secs: 5 * 60,
            expiry_secs: 60 * 60,
            rssi_write_interval_secs: 15,
            payload_sharing_interval_secs: 150,
            service_uuid: PROTOCOL_SERVICE_UUID,
            platform_a_signal_uuid: PLATFORM_A_SIGNAL_UUID,
            platform_b_signal_uuid: PLATFORM_B_SIGNAL_UUID,
            payload_uuid: PAYLOAD_CHARACTERISTIC_UUID,
            platform_a_manufacturer_id: PLATFORM_A_MANUFACTURER_ID,
        }
    }
}

impl SensorConfig {
    /// Set the scan and idle windows
    pub fn with_duty_cycle(mut self, scan_on: Duration, scan_off: Duration) -> Result<Self, ScannerError> {
        self.scan_on_ms = scan_on.as_millis() as u64;
        self.scan_off_ms = scan_off.as_millis() as u64;
        self.validate()?;
        Ok(self)
    }

    /// Set the per-peer timeout and the total dispatch budget
    pub fn with_connection_budget(
        mut self,
        per_peer: Duration,
        total: Duration,
    ) -> Result<Self, ScannerError> {
        self.connection_timeout_ms = per_peer.as_millis() as u64;
        self.dispatch_budget_ms = total.as_millis() as u64;
        self.validate()?;
        Ok(self)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ScannerError> {
        if self.scan_on_ms == 0 || self.scan_off_ms == 0 {
            return Err(ScannerError::InvalidConfig(
                "Scan windows must be > 0".to_string(),
            ));
        }
        if self.connection_timeout_ms == 0 {
            return Err(ScannerError::InvalidConfig(
                "Connection timeout must be > 0".to_string(),
            ));
        }
        if self.dispatch_budget_ms < self.connection_timeout_ms {
            return Err(ScannerError::InvalidConfig(
                "Dispatch budget must cover at least one connection".to_string(),
            ));
        }
        if self.ignore_cooldown_secs >= self.expiry_secs {
            return Err(ScannerError::InvalidConfig(
                "Ignore cooldown must be shorter than expiry".to_string(),
            ));
        }
        let characteristics = [
            self.platform_a_signal_uuid,
            self.platform_b_signal_uuid,
            self.payload_uuid,
        ];
        for (i, a) in characteristics.iter().enumerate() {
            if *a == self.service_uuid || characteristics[i + 1..].contains(a) {
                return Err(ScannerError::InvalidConfig(format!(
                    "Capability identifier {} is not unique",
                    a
                )));
            }
        }
        Ok(())
    }

    pub fn scan_on(&self) -> Duration {
        Duration::from_millis(self.scan_on_ms)
    }

    pub fn scan_off(&self) -> Duration {
        Duration::from_millis(self.scan_off_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn dispatch_budget(&self) -> Duration {
        Duration::from_millis(self.dispatch_budget_ms)
    }

    pub fn ignore_cooldown(&self) -> Duration {
        Duration::from_secs(self.ignore_cooldown_secs)
    }

    pub fn expiry(&self) -> Duration {
        Duration::from_secs(self.expiry_secs)
    }

    pub fn rssi_write_interval(&self) -> Duration {
        Duration::from_secs(self.rssi_write_interval_secs)
    }

    pub fn payload_sharing_interval(&self) -> Duration {
        Duration::from_secs(self.payload_sharing_interval_secs)
    }
}
