//! Fencekeeper Error Types

use thiserror::Error;

use crate::protocol::ProtocolVersion;

/// Result type alias for fencekeeper operations
pub type Result<T> = std::result::Result<T, Error>;

/// Fencekeeper error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Wire protocol errors
    #[error("Short message: {len} bytes, need at least {need}")]
    ShortMessage { len: usize, need: usize },

    #[error("Bad message length: {0}")]
    BadLength(String),

    #[error("Unknown message type {0}")]
    UnknownMessageType(u16),

    #[error("Reject message from {from} version {got} vs {running}")]
    VersionMismatch {
        from: u32,
        got: ProtocolVersion,
        running: ProtocolVersion,
    },

    #[error("Bad message nodeid {claimed} from {actual}")]
    SenderMismatch { claimed: u32, actual: u32 },

    #[error("Invalid protocol version from {from}: {reason}")]
    InvalidVersion { from: u32, reason: String },

    // Version negotiation errors
    #[error("Incompatible daemon protocol run {run} max {max}")]
    IncompatibleProtocol {
        run: ProtocolVersion,
        max: ProtocolVersion,
    },

    #[error("Protocol negotiation failed: {0}")]
    Negotiation(String),

    // Group communication errors
    #[error("Group service busy, try again")]
    TryAgain,

    #[error("Group transport error: {0}")]
    Transport(String),

    #[error("Failed to join group {group}: {reason}")]
    JoinFailed { group: String, reason: String },

    // State errors
    #[error("No node history for nodeid {0}")]
    UnknownNode(u32),

    #[error("Invariant violated: {0}")]
    Invariant(String),

    // Fencing errors
    #[error("Override channel error: {0}")]
    Override(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TryAgain)
    }

    /// Check if this error must stop the coordinator
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::IncompatibleProtocol { .. }
                | Error::JoinFailed { .. }
                | Error::Config(_)
                | Error::ConfigParse(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert!(Error::TryAgain.is_retryable());
        assert!(!Error::Transport("down".into()).is_retryable());

        let err = Error::IncompatibleProtocol {
            run: ProtocolVersion::new(2, 1, 1),
            max: ProtocolVersion::new(1, 1, 1),
        };
        assert!(err.is_fatal());
        assert_eq!(
            err.to_string(),
            "Incompatible daemon protocol run 2.1.1 max 1.1.1"
        );
        assert!(!Error::UnknownNode(3).is_fatal());
    }
}
