//! Error types and result definitions for the pioneer-wyt crate.

use thiserror::Error;

/// Represents all possible errors that can occur when communicating with a
/// Pioneer WYT unit over the Tuya LAN protocol.
#[derive(Error, Debug, Clone)]
pub enum TuyaError {
    /// Missing or invalid device binding field (bad key length, unknown protocol, ...)
    #[error("Configuration error: {0}")]
    Config(String),

    /// TCP connect/read/write failure; recoverable via reconnect
    #[error("IO error: {0}")]
    Io(String),

    /// TCP connection could not be established
    #[error("Socket connection failed")]
    ConnectionFailed,

    /// No live session to the device
    #[error("Device not connected")]
    NotConnected,

    /// Retries exhausted on an in-flight request
    #[error("Timeout waiting for device")]
    Timeout,

    /// v3.4 key exchange timed out or the device closed mid-handshake
    #[error("Session key negotiation failed")]
    HandshakeFailed,

    /// The KEY_RESP MAC did not verify against the local nonce
    #[error("Handshake MAC mismatch")]
    HandshakeMacMismatch,

    /// CRC check failed for a received v3.1/v3.3 frame
    #[error("CRC mismatch")]
    CrcMismatch,

    /// HMAC signature verification failed for a v3.4 frame
    #[error("HMAC mismatch")]
    HmacMismatch,

    /// Failed to decrypt a payload (wrong key, bad padding, or wrong version)
    #[error("Decryption failed")]
    DecryptionFailed,

    /// Failed to encrypt a payload for the device
    #[error("Encryption failed")]
    EncryptionFailed,

    /// The frame header was malformed
    #[error("Invalid frame header")]
    InvalidHeader,

    /// The frame payload was malformed or unexpected
    #[error("Invalid payload")]
    InvalidPayload,

    /// JSON serialization or deserialization error
    #[error("JSON error: {0}")]
    Json(String),

    /// DP write with an out-of-range or wrong-type value
    #[error("Bad value: {0}")]
    BadValue(String),
}

/// Coarse classification used by the recovery policy: transport and
/// handshake failures are retried inside the backoff loop, timeouts and
/// config errors surface to the caller, protocol errors drop the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Config,
    Transport,
    Handshake,
    Timeout,
    Protocol,
    Value,
}

impl TuyaError {
    pub fn class(&self) -> ErrorClass {
        match self {
            TuyaError::Config(_) => ErrorClass::Config,
            TuyaError::Io(_) | TuyaError::ConnectionFailed | TuyaError::NotConnected => {
                ErrorClass::Transport
            }
            TuyaError::Timeout => ErrorClass::Timeout,
            TuyaError::HandshakeFailed | TuyaError::HandshakeMacMismatch => ErrorClass::Handshake,
            TuyaError::CrcMismatch
            | TuyaError::HmacMismatch
            | TuyaError::DecryptionFailed
            | TuyaError::EncryptionFailed
            | TuyaError::InvalidHeader
            | TuyaError::InvalidPayload
            | TuyaError::Json(_) => ErrorClass::Protocol,
            TuyaError::BadValue(_) => ErrorClass::Value,
        }
    }
}

/// A specialized Result type for Tuya operations.
pub type Result<T> = std::result::Result<T, TuyaError>;

impl From<std::io::Error> for TuyaError {
    fn from(err: std::io::Error) -> Self {
        TuyaError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for TuyaError {
    fn from(err: serde_json::Error) -> Self {
        TuyaError::Json(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_recovery_policy() {
        assert_eq!(TuyaError::Timeout.class(), ErrorClass::Timeout);
        assert_eq!(TuyaError::CrcMismatch.class(), ErrorClass::Protocol);
        assert_eq!(TuyaError::ConnectionFailed.class(), ErrorClass::Transport);
        assert_eq!(
            TuyaError::HandshakeMacMismatch.class(),
            ErrorClass::Handshake
        );
        assert_eq!(TuyaError::Config("key".into()).class(), ErrorClass::Config);
    }
}
