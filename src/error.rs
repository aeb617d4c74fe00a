//! Error types for HSM communication.

use std::fmt;

use thiserror::Error;

/// Errors surfaced by the secure channel, the session pool and the connector.
#[derive(Debug, Error)]
pub enum HsmError {
    /// Connector I/O failure or non-OK transport status
    #[error("connector transport error: {0}")]
    Transport(String),

    /// Truncated or length-inconsistent wire frame
    #[error("malformed frame: {0}")]
    BadFrame(String),

    /// Response decoded but did not match what the command expects
    #[error("unexpected response: {0}")]
    BadResponse(String),

    /// CMAC on a session response did not verify
    #[error("response MAC verification failed")]
    BadResponseMac,

    /// The SCP03 authentication ceremony failed
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The channel reached its per-session message cap
    #[error("session reached its message limit; create a new channel")]
    SessionExhausted,

    /// Operation requires an authenticated channel
    #[error("session is not authenticated")]
    NotAuthenticated,

    /// The device answered with its one-byte error frame
    #[error("device returned error: {0}")]
    Device(DeviceErrorCode),

    /// Bad argument at construction time
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The session manager has been destroyed
    #[error("session manager is destroyed")]
    Destroyed,

    /// The pool currently holds no authenticated session
    #[error("no session available")]
    NoSessionAvailable,
}

/// Result type alias for HSM operations
pub type Result<T> = std::result::Result<T, HsmError>;

impl From<reqwest::Error> for HsmError {
    fn from(err: reqwest::Error) -> Self {
        HsmError::Transport(err.to_string())
    }
}

/// One-byte error codes reported by the device in an error frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorCode {
    Ok,
    InvalidCommand,
    InvalidData,
    InvalidSession,
    AuthFail,
    SessionFull,
    SessionFailed,
    StorageFailed,
    WrongLength,
    InvalidPermission,
    LogFull,
    ObjectNotFound,
    IdIllegal,
    CommandUnexecuted,
    /// Code not present in the published table
    Unknown(u8),
}

impl DeviceErrorCode {
    /// Map a wire byte to its error code.
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => Self::Ok,
            0x01 => Self::InvalidCommand,
            0x02 => Self::InvalidData,
            0x03 => Self::InvalidSession,
            0x04 => Self::AuthFail,
            0x05 => Self::SessionFull,
            0x06 => Self::SessionFailed,
            0x07 => Self::StorageFailed,
            0x08 => Self::WrongLength,
            0x09 => Self::InvalidPermission,
            0x0a => Self::LogFull,
            0x0b => Self::ObjectNotFound,
            0x0c => Self::IdIllegal,
            0xff => Self::CommandUnexecuted,
            other => Self::Unknown(other),
        }
    }

    /// The wire byte for this code.
    pub fn as_byte(&self) -> u8 {
        match self {
            Self::Ok => 0x00,
            Self::InvalidCommand => 0x01,
            Self::InvalidData => 0x02,
            Self::InvalidSession => 0x03,
            Self::AuthFail => 0x04,
            Self::SessionFull => 0x05,
            Self::SessionFailed => 0x06,
            Self::StorageFailed => 0x07,
            Self::WrongLength => 0x08,
            Self::InvalidPermission => 0x09,
            Self::LogFull => 0x0a,
            Self::ObjectNotFound => 0x0b,
            Self::IdIllegal => 0x0c,
            Self::CommandUnexecuted => 0xff,
            Self::Unknown(byte) => *byte,
        }
    }
}

impl fmt::Display for DeviceErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            Self::Ok => "OK",
            Self::InvalidCommand => "invalid command",
            Self::InvalidData => "invalid data",
            Self::InvalidSession => "invalid session",
            Self::AuthFail => "auth fail",
            Self::SessionFull => "session full",
            Self::SessionFailed => "session failed",
            Self::StorageFailed => "storage failed",
            Self::WrongLength => "wrong length",
            Self::InvalidPermission => "invalid permission",
            Self::LogFull => "log full",
            Self::ObjectNotFound => "object not found",
            Self::IdIllegal => "ID illegal",
            Self::CommandUnexecuted => "command unexecuted",
            Self::Unknown(byte) => return write!(f, "unknown (0x{byte:02x})"),
        };
        f.write_str(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_error_code_roundtrip() {
        for byte in [0x00u8, 0x01, 0x04, 0x0b, 0x0c, 0xff] {
            assert_eq!(DeviceErrorCode::from_byte(byte).as_byte(), byte);
        }

        // Codes outside the table survive as Unknown
        assert_eq!(
            DeviceErrorCode::from_byte(0x7f),
            DeviceErrorCode::Unknown(0x7f)
        );
        assert_eq!(DeviceErrorCode::Unknown(0x7f).as_byte(), 0x7f);
    }

    #[test]
    fn test_device_error_display() {
        let err = HsmError::Device(DeviceErrorCode::ObjectNotFound);
        assert_eq!(err.to_string(), "device returned error: object not found");

        let unknown = DeviceErrorCode::Unknown(0xab);
        assert_eq!(unknown.to_string(), "unknown (0xab)");
    }
}
