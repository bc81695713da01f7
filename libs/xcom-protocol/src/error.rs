//! Xcom Error Types
//!
//! Core error types for the Xcom protocol engine.

use thiserror::Error;

use crate::types::ScomErrorCode;

/// Result type for Xcom operations
pub type Result<T> = std::result::Result<T, XcomError>;

/// Reason a byte span could not be decoded into a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameDefect {
    /// Fewer bytes than the declared frame length
    Truncated { needed: usize, available: usize },
    /// First byte is not the start marker
    BadStartMarker(u8),
    /// Declared length outside the accepted window
    BadLength(u32),
    /// A header field carries a code this engine does not know
    UnknownCode { field: &'static str, value: u8 },
}

impl std::fmt::Display for FrameDefect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameDefect::Truncated { needed, available } => {
                write!(f, "truncated frame: need {needed} bytes, have {available}")
            },
            FrameDefect::BadStartMarker(b) => write!(f, "bad start marker 0x{b:02X}"),
            FrameDefect::BadLength(len) => write!(f, "implausible length field {len}"),
            FrameDefect::UnknownCode { field, value } => {
                write!(f, "unknown {field} code 0x{value:02X}")
            },
        }
    }
}

/// Xcom errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum XcomError {
    /// Socket could not be established
    #[error("Connect error: {0}")]
    Connect(String),

    /// Frame could not be decoded (includes "not enough bytes yet")
    #[error("Malformed frame: {0}")]
    MalformedFrame(FrameDefect),

    /// Checksum over the declared span does not match
    #[error("Checksum error: expected {expected:04X}, got {actual:04X}")]
    Checksum { expected: u16, actual: u16 },

    /// Frame could not be encoded
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Instance index outside the family's device range
    #[error("Address out of range: {family} index {index} (valid 1..={count})")]
    AddressOutOfRange {
        family: String,
        index: u16,
        count: u16,
    },

    /// No configured family claims the address
    #[error("Unknown address: {0}")]
    UnknownAddress(u16),

    /// Family id or device code is not configured on this link
    #[error("Unknown device family: {0}")]
    UnknownFamily(String),

    /// Datapoint belongs to a different family than the targeted device
    #[error("Datapoint {nr} belongs to family '{datapoint_family}', not '{target_family}'")]
    FamilyMismatch {
        nr: u16,
        datapoint_family: String,
        target_family: String,
    },

    /// Scaled value does not fit the target width
    #[error("Value out of range: {0}")]
    ValueOutOfRange(String),

    /// Value shape does not match the datapoint's declared type
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    /// Payload shorter than the type's fixed width
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// Datapoint cannot be written
    #[error("Datapoint {0} is read-only")]
    ReadOnly(u16),

    /// Request arguments rejected before sending
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// No matching response within the retry budget
    #[error("Request timeout: {0}")]
    RequestTimeout(String),

    /// Same matching key already in flight
    #[error("Duplicate request: {0}")]
    DuplicateRequest(String),

    /// Engine stopped or connection lost while the request was pending
    #[error("Connection closed")]
    ConnectionClosed,

    /// Device answered with an error service
    #[error("Device error: {0}")]
    Device(ScomErrorCode),

    /// Catalog miss
    #[error("Unknown datapoint: {nr} (family {family:?})")]
    UnknownDatapoint { nr: u16, family: Option<String> },

    /// Message number missing from the message set
    #[error("Unknown message: {0}")]
    UnknownMessage(u16),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for XcomError {
    fn from(err: std::io::Error) -> Self {
        XcomError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for XcomError {
    fn from(err: serde_json::Error) -> Self {
        XcomError::Config(format!("JSON error: {err}"))
    }
}

// Helper methods for creating errors
impl XcomError {
    pub fn connect(msg: impl Into<String>) -> Self {
        XcomError::Connect(msg.into())
    }

    pub fn encoding(msg: impl Into<String>) -> Self {
        XcomError::Encoding(msg.into())
    }

    pub fn value_out_of_range(msg: impl Into<String>) -> Self {
        XcomError::ValueOutOfRange(msg.into())
    }

    pub fn type_mismatch(msg: impl Into<String>) -> Self {
        XcomError::TypeMismatch(msg.into())
    }

    pub fn malformed_payload(msg: impl Into<String>) -> Self {
        XcomError::MalformedPayload(msg.into())
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        XcomError::InvalidRequest(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        XcomError::Config(msg.into())
    }

    /// True when the decoder only needs more bytes
    pub fn is_incomplete(&self) -> bool {
        matches!(
            self,
            XcomError::MalformedFrame(FrameDefect::Truncated { .. })
        )
    }

    /// Errors caused by caller input, raised before anything is sent
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            XcomError::AddressOutOfRange { .. }
                | XcomError::UnknownAddress(_)
                | XcomError::UnknownFamily(_)
                | XcomError::FamilyMismatch { .. }
                | XcomError::ValueOutOfRange(_)
                | XcomError::TypeMismatch(_)
                | XcomError::ReadOnly(_)
                | XcomError::InvalidRequest(_)
                | XcomError::UnknownDatapoint { .. }
                | XcomError::UnknownMessage(_)
        )
    }

    /// Check if this error indicates a need for reconnection
    pub fn needs_reconnect(&self) -> bool {
        match self {
            XcomError::Io(msg) => {
                msg.contains("Broken pipe")
                    || msg.contains("Connection reset")
                    || msg.contains("Connection refused")
                    || msg.contains("Connection aborted")
            },
            XcomError::Connect(_) | XcomError::ConnectionClosed => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incomplete_classification() {
        let err = XcomError::MalformedFrame(FrameDefect::Truncated {
            needed: 17,
            available: 3,
        });
        assert!(err.is_incomplete());
        assert!(!XcomError::MalformedFrame(FrameDefect::BadLength(2)).is_incomplete());
        assert!(!XcomError::Checksum {
            expected: 1,
            actual: 2
        }
        .is_incomplete());
    }

    #[test]
    fn test_caller_errors() {
        assert!(XcomError::UnknownAddress(42).is_caller_error());
        assert!(XcomError::type_mismatch("string for FLOAT").is_caller_error());
        assert!(!XcomError::ConnectionClosed.is_caller_error());
        assert!(!XcomError::RequestTimeout("3023".into()).is_caller_error());
    }

    #[test]
    fn test_needs_reconnect() {
        assert!(XcomError::Io("Connection reset by peer".into()).needs_reconnect());
        assert!(XcomError::ConnectionClosed.needs_reconnect());
        assert!(!XcomError::Io("would block".into()).needs_reconnect());
        assert!(!XcomError::DuplicateRequest("x".into()).needs_reconnect());
    }

    #[test]
    fn test_display() {
        let err = XcomError::AddressOutOfRange {
            family: "xt".into(),
            index: 10,
            count: 9,
        };
        assert_eq!(err.to_string(), "Address out of range: xt index 10 (valid 1..=9)");

        let err = XcomError::MalformedFrame(FrameDefect::UnknownCode {
            field: "service",
            value: 0x7F,
        });
        assert!(err.to_string().contains("unknown service code 0x7F"));
    }
}
