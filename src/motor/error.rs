// Error taxonomy for the command/transport layer

use super::protocol::DecodeError;
use super::state::Rejection;

/// Error types for motor bus communication
#[derive(Debug, thiserror::Error)]
pub enum MotorError {
    #[error("Failed to open or close port {port}: {source}")]
    Connection {
        port: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Controller is already connected")]
    AlreadyConnected,

    #[error("Controller is not connected")]
    NotConnected,

    #[error("Motor {0} is not configured on this bus")]
    UnknownDevice(u8),

    #[error("Invalid transition for motor {id}: {reason}")]
    InvalidTransition { id: u8, reason: Rejection },

    #[error("Timeout waiting for response from motor {id}")]
    Timeout { id: u8 },

    #[error("Protocol error: {0}")]
    Protocol(#[from] DecodeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Motor {id} rejected command: {reason}")]
    Rejected { id: u8, reason: String },
}

pub type Result<T> = std::result::Result<T, MotorError>;
