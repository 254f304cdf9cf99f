/// Signal characteristic wire format
///
/// Every write to a peer's signal characteristic is a small envelope:
/// `[action_code: u8 | short_value: u16 LE | payload...]`. The radio reports
/// write completions with only the value that was written, so the leading
/// action code is also what ties a completion back to the task that issued it.

use thiserror::Error;

/// Size of the envelope header in bytes
pub const SIGNAL_HEADER_SIZE: usize = 3;

/// Actions carried in the envelope header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SignalAction {
    /// Identity payload of this device
    WritePayload = 0x01,
    /// Last RSSI measured for the peer, carried in `short_value`
    WriteRssi = 0x02,
    /// Payloads of other peers the receiver cannot reach itself
    WritePayloadSharing = 0x03,
}

impl SignalAction {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(SignalAction::WritePayload),
            0x02 => Some(SignalAction::WriteRssi),
            0x03 => Some(SignalAction::WritePayloadSharing),
            _ => None,
        }
    }
}

/// Errors for envelope encoding and decoding
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalError {
    #[error("Signal data truncated: {len} bytes, header needs 3")]
    Truncated { len: usize },
    #[error("Signal payload too large: {len} bytes")]
    PayloadTooLarge { len: usize },
}

/// Decoded signal envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalEnvelope {
    pub action_code: u8,
    pub short_value: u16,
    pub payload: Vec<u8>,
}

impl SignalEnvelope {
    pub fn new(action_code: u8, short_value: u16, payload: Vec<u8>) -> Self {
        Self {
            action_code,
            short_value,
            payload,
        }
    }

    /// Header bytes for this envelope
    pub fn header(&self) -> [u8; SIGNAL_HEADER_SIZE] {
        let mut bytes = [0u8; SIGNAL_HEADER_SIZE];
        bytes[0] = self.action_code;
        bytes[1..3].copy_from_slice(&self.short_value.to_le_bytes());
        bytes
    }

    /// Serialize to bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(SIGNAL_HEADER_SIZE + self.payload.len());
        bytes.extend_from_slice(&self.header());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Deserialize from bytes; everything after the header is payload
    pub fn decode(bytes: &[u8]) -> Result<Self, SignalError> {
        if bytes.len() < SIGNAL_HEADER_SIZE {
            return Err(SignalError::Truncated { len: bytes.len() });
        }
        Ok(Self {
            action_code: bytes[0],
            short_value: u16::from_le_bytes([bytes[1], bytes[2]]),
            payload: bytes[SIGNAL_HEADER_SIZE..].to_vec(),
        })
    }

    pub fn action(&self) -> Option<SignalAction> {
        SignalAction::from_code(self.action_code)
    }

    /// `short_value` reinterpreted as a signed RSSI
    pub fn rssi(&self) -> i16 {
        self.short_value as i16
    }
}

/// Encode an envelope with an explicit short value
pub fn signal_data(action_code: u8, short_value: u16, payload: &[u8]) -> Vec<u8> {
    SignalEnvelope::new(action_code, short_value, payload.to_vec()).encode()
}

/// Encode a payload-carrying envelope; the short value is the payload length
pub fn signal_data_payload(action: SignalAction, payload: &[u8]) -> Result<Vec<u8>, SignalError> {
    let len = u16::try_from(payload.len())
        .map_err(|_| SignalError::PayloadTooLarge { len: payload.len() })?;
    Ok(signal_data(action.code(), len, payload))
}

/// Encode an RSSI envelope; the sample travels in the short value
pub fn signal_data_rssi(rssi: i16) -> Vec<u8> {
    signal_data(SignalAction::WriteRssi.code(), rssi as u16, &[])
}

/// Action code of an encoded envelope, 0 when there is nothing to read
pub fn signal_data_action_code(signal_data: &[u8]) -> u8 {
    signal_data.first().copied().unwrap_or(0)
}
