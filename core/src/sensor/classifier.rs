/// Platform classification from advertisement and capability evidence
///
/// Platform-A peers drop the service id from their advertisements while in the
/// background, so a sighting alone cannot always tell "platform-A running the
/// protocol" apart from "some platform-A device". The decision table below
/// makes a best guess from the two signals available at scan time; the guess
/// is confirmed later from the characteristics found on connection.

use uuid::Uuid;

use super::device::PlatformType;

/// Result of classifying one sighting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Set the platform to this value
    Set(PlatformType),
    /// Keep whatever the record currently holds
    Keep,
    /// Neither signal present; the scan filter should make this impossible
    Anomalous,
}

/// Classify a sighting from its two advertisement signals
pub fn classify(exposes_service: bool, is_platform_a: bool, current: PlatformType) -> Classification {
    match (exposes_service, is_platform_a) {
        (true, true) => Classification::Set(PlatformType::PlatformA),
        (true, false) => Classification::Set(PlatformType::PlatformB),
        (false, true) => {
            // Only guess when nothing better is known
            if current == PlatformType::Unknown {
                Classification::Set(PlatformType::PlatformATbc)
            } else {
                Classification::Keep
            }
        }
        (false, false) => Classification::Anomalous,
    }
}

/// Confirm the platform from the signal characteristic exposed by the peer
pub fn classify_characteristics(
    characteristics: &[Uuid],
    platform_a_signal: Uuid,
    platform_b_signal: Uuid,
) -> Option<PlatformType> {
    if characteristics.contains(&platform_b_signal) {
        Some(PlatformType::PlatformB)
    } else if characteristics.contains(&platform_a_signal) {
        Some(PlatformType::PlatformA)
    } else {
        None
    }
}
