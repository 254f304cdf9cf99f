/// Task scheduler
///
/// Once per duty cycle the scheduler decides which peers have work pending,
/// orders them so the peer that has waited longest for a connection goes
/// first, and hands them to the connection engine one at a time until the
/// dispatch budget runs out.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use super::config::SensorConfig;
use super::connection::SessionOutcome;
use super::device::{ConnectionState, PeerId, PeerRecord, PlatformType};
use super::registry::DeviceRegistry;
use super::transmitter::Transmitter;

/// Action to run on a connected peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NextTask {
    Nothing,
    ReadPayload,
    WritePayload,
    WritePayloadSharing,
    WriteRssi,
}

impl fmt::Display for NextTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NextTask::Nothing => write!(f, "nothing"),
            NextTask::ReadPayload => write!(f, "readPayload"),
            NextTask::WritePayload => write!(f, "writePayload"),
            NextTask::WritePayloadSharing => write!(f, "writePayloadSharing"),
            NextTask::WriteRssi => write!(f, "writeRSSI"),
        }
    }
}

/// Rate limits for the write tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskPolicy {
    pub rssi_write_interval: Duration,
    pub payload_sharing_interval: Duration,
}

impl TaskPolicy {
    pub fn from_config(config: &SensorConfig) -> Self {
        Self {
            rssi_write_interval: config.rssi_write_interval(),
            payload_sharing_interval: config.payload_sharing_interval(),
        }
    }

    /// Pending action for `record`, in priority order
    pub fn next_task(&self, record: &PeerRecord, transmitter: &dyn Transmitter, now: Instant) -> NextTask {
        if record.platform() == PlatformType::Ignore {
            return NextTask::Nothing;
        }
        // Reading the payload also confirms the platform through discovery
        if record.platform().is_unresolved() || record.payload().is_none() {
            return NextTask::ReadPayload;
        }
        if transmitter.is_supported() {
            return NextTask::Nothing;
        }
        if !record.has_written_payload() {
            return NextTask::WritePayload;
        }
        if record.platform() == PlatformType::PlatformA
            && record.time_since_last_write_payload_sharing(now) > self.payload_sharing_interval
            && transmitter
                .payload_sharing_data(record)
                .map_or(false, |sharing| !sharing.identifiers.is_empty())
        {
            return NextTask::WritePayloadSharing;
        }
        if record.rssi().is_some() && record.time_since_last_write_rssi(now) > self.rssi_write_interval {
            return NextTask::WriteRssi;
        }
        NextTask::Nothing
    }
}

/// Peers with a radio handle, split by connection state
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RegistryStatus {
    pub connected: Vec<PeerId>,
    pub disconnected: Vec<PeerId>,
}

/// Split the registry by connection state; peers mid-connect are in neither list
pub fn partition(registry: &DeviceRegistry, now: Instant) -> RegistryStatus {
    let mut status = RegistryStatus::default();
    for record in registry.snapshot() {
        if record.peripheral().is_none() {
            continue;
        }
        match record.connection_state() {
            ConnectionState::Connected => {
                debug!(record = %record, up_time = ?record.up_time(now), "Status connected");
                status.connected.push(record.identifier().clone());
            }
            ConnectionState::Disconnected => {
                debug!(record = %record, down_time = ?record.down_time(now), "Status disconnected");
                status.disconnected.push(record.identifier().clone());
            }
            ConnectionState::Connecting => {}
        }
    }
    debug!(
        connected = status.connected.len(),
        disconnected = status.disconnected.len(),
        "Status summary"
    );
    status
}

/// A peer waiting for a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPeer {
    pub peer: PeerId,
    pub task: NextTask,
    /// Time since the last connect request, `Duration::MAX` for never
    pub waiting: Duration,
}

/// Disconnected peers with a pending task, longest waiting first
pub fn pending_peers(
    registry: &DeviceRegistry,
    disconnected: &[PeerId],
    transmitter: &dyn Transmitter,
    policy: &TaskPolicy,
    now: Instant,
) -> Vec<PendingPeer> {
    let mut pending: Vec<PendingPeer> = disconnected
        .iter()
        .filter_map(|peer| registry.get(peer))
        .filter(|record| record.platform() != PlatformType::Ignore)
        .filter_map(|record| {
            let task = policy.next_task(record, transmitter, now);
            (task != NextTask::Nothing).then(|| PendingPeer {
                peer: record.identifier().clone(),
                task,
                waiting: record.time_since_last_connect_request(now),
            })
        })
        .collect();

    pending.sort_by(|a, b| b.waiting.cmp(&a.waiting).then_with(|| a.peer.cmp(&b.peer)));

    debug!(peers = pending.len(), "Pending summary");
    for (rank, entry) in pending.iter().enumerate() {
        debug!(
            priority = rank + 1,
            peer = %entry.peer,
            task = %entry.task,
            waiting = ?(entry.waiting != Duration::MAX).then_some(entry.waiting),
            "Pending queue"
        );
    }
    pending
}

/// Outcome counts of one dispatch pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    /// Connection attempts started
    pub attempted: usize,
    /// Attempts that ran until no task remained or the peer disconnected
    pub completed: usize,
    /// Attempts cut off by the per-peer timeout
    pub timed_out: usize,
    /// Attempts the radio refused or that ended abnormally
    pub failed: usize,
    /// Peers left for the next cycle because the budget ran out
    pub deferred: usize,
}

/// Budgeted dispatch over an ordered pending list
///
/// The budget is checked only before starting a peer, so an attempt already
/// under way always runs to completion or to its own timeout.
pub struct DispatchPlan {
    queue: VecDeque<PeerId>,
    started: Instant,
    budget: Duration,
    report: DispatchReport,
}

impl DispatchPlan {
    pub fn new(pending: Vec<PendingPeer>, started: Instant, budget: Duration) -> Self {
        Self {
            queue: pending.into_iter().map(|entry| entry.peer).collect(),
            started,
            budget,
            report: DispatchReport::default(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.queue.len()
    }

    /// Next peer to connect, or None once the queue is empty or the budget is spent
    pub fn next_peer(&mut self, now: Instant) -> Option<PeerId> {
        if self.queue.is_empty() {
            return None;
        }
        let elapsed = now.saturating_duration_since(self.started);
        if elapsed >= self.budget {
            self.report.deferred += self.queue.len();
            debug!(
                elapsed = ?elapsed,
                budget = ?self.budget,
                deferred = self.queue.len(),
                "Dispatch budget reached"
            );
            self.queue.clear();
            return None;
        }
        let peer = self.queue.pop_front()?;
        self.report.attempted += 1;
        Some(peer)
    }

    pub fn record(&mut self, outcome: SessionOutcome) {
        match outcome {
            SessionOutcome::Completed => self.report.completed += 1,
            SessionOutcome::TimedOut => self.report.timed_out += 1,
            SessionOutcome::Failed => self.report.failed += 1,
        }
    }

    pub fn finish(self, now: Instant) -> DispatchReport {
        info!(
            attempted = self.report.attempted,
            completed = self.report.completed,
            timed_out = self.report.timed_out,
            failed = self.report.failed,
            deferred = self.report.deferred,
            elapsed = ?now.saturating_duration_since(self.started),
            "Dispatch pass finished"
        );
        self.report
    }
}
