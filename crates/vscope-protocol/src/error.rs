//! Protocol error types.

use thiserror::Error;

/// Errors raised by the frame codec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Payload would not fit in a single frame.
    #[error("payload too large: maximum {max} bytes, got {actual}")]
    PayloadTooLarge {
        /// Maximum payload size.
        max: usize,
        /// Requested payload size.
        actual: usize,
    },

    /// LEN field outside the legal range.
    #[error("bad frame length field: {0}")]
    BadLen(u8),

    /// CRC over TYPE+PAYLOAD did not match the trailing byte.
    #[error("crc mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    CrcMismatch {
        /// CRC computed over the received bytes.
        expected: u8,
        /// CRC byte carried by the frame.
        actual: u8,
    },
}

/// Status codes reported by the device in an error frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    /// Request payload length did not match the operation.
    BadLen,
    /// A parameter value was rejected.
    BadParam,
    /// An index was out of range.
    Range,
    /// Requested data does not exist yet. An expected condition, not a fault.
    NotReady,
    /// Status code this host does not know.
    Unknown(u8),
}

impl DeviceStatus {
    /// Whether this status is an expected condition rather than a fault.
    pub fn is_not_ready(self) -> bool {
        matches!(self, DeviceStatus::NotReady)
    }
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceStatus::BadLen => write!(f, "bad length"),
            DeviceStatus::BadParam => write!(f, "bad parameter"),
            DeviceStatus::Range => write!(f, "index out of range"),
            DeviceStatus::NotReady => write!(f, "not ready"),
            DeviceStatus::Unknown(code) => write!(f, "unknown status (0x{code:02X})"),
        }
    }
}

impl From<u8> for DeviceStatus {
    fn from(code: u8) -> Self {
        use crate::constants::*;
        match code {
            STATUS_BAD_LEN => DeviceStatus::BadLen,
            STATUS_BAD_PARAM => DeviceStatus::BadParam,
            STATUS_RANGE => DeviceStatus::Range,
            STATUS_NOT_READY => DeviceStatus::NotReady,
            _ => DeviceStatus::Unknown(code),
        }
    }
}

impl From<DeviceStatus> for u8 {
    fn from(status: DeviceStatus) -> Self {
        use crate::constants::*;
        match status {
            DeviceStatus::BadLen => STATUS_BAD_LEN,
            DeviceStatus::BadParam => STATUS_BAD_PARAM,
            DeviceStatus::Range => STATUS_RANGE,
            DeviceStatus::NotReady => STATUS_NOT_READY,
            DeviceStatus::Unknown(code) => code,
        }
    }
}

/// Errors raised while decoding a response into a typed value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The device answered with an error frame.
    #[error("device error: {0}")]
    Device(DeviceStatus),

    /// Response is too short for its message type.
    #[error("response too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Expected minimum length.
        expected: usize,
        /// Actual length received.
        actual: usize,
    },

    /// The response TYPE did not match the request.
    #[error("unexpected response type: expected 0x{expected:02X}, got 0x{actual:02X}")]
    UnexpectedType {
        /// Message type that was requested.
        expected: u8,
        /// Message type the device answered with.
        actual: u8,
    },

    /// Structurally invalid payload. Indicates corruption surviving CRC or
    /// version skew, so callers log these loudly.
    #[error("decode error: {message}")]
    Decode {
        /// Human-readable description of the mismatch.
        message: String,
    },

    /// A string field was not valid UTF-8.
    #[error("invalid UTF-8 in name field")]
    InvalidUtf8,
}

impl ProtocolError {
    /// Shorthand for a [`ProtocolError::Decode`] with a formatted message.
    pub fn decode(message: impl Into<String>) -> Self {
        ProtocolError::Decode {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_code_round_trip() {
        for code in [1u8, 2, 4, 5, 0x7F] {
            let status = DeviceStatus::from(code);
            assert_eq!(u8::from(status), code);
        }
    }

    #[test]
    fn not_ready_is_not_a_fault() {
        assert!(DeviceStatus::NotReady.is_not_ready());
        assert!(!DeviceStatus::Range.is_not_ready());
    }
}
