/// Error types for the gateway subsystem
///
/// `GatewayError` is what every public operation returns. Decode and
/// validation failures have their own structured types so callers can
/// inspect them without string matching.
use thiserror::Error;

use crate::gateway::state::ConnectionState;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("Connect error ({endpoint}): {reason}")] Connect {
        endpoint: String,
        reason: String,
    },

    #[error("Authentication rejected: {reason}")] Auth {
        reason: String,
    },

    #[error("Command '{command}' timed out after {timeout_ms}ms")] CommandTimeout {
        command: String,
        timeout_ms: u64,
    },

    #[error("Command '{command}' failed: {message}")] Command {
        command: String,
        code: Option<String>,
        message: String,
    },

    #[error(transparent)] Decode(#[from] DecodeError),

    #[error(transparent)] Validation(#[from] ValidationError),

    #[error("Not authenticated (state: {state})")] NotAuthenticated {
        state: ConnectionState,
    },

    #[error("Socket not open (state: {state})")] NotConnected {
        state: ConnectionState,
    },

    #[error("Connection closed")] ConnectionClosed,

    #[error("Stage {stage} is locked: {reason}")] StageLocked {
        stage: String,
        reason: String,
    },

    #[error("Persistence API error: {0}")] Persistence(String),

    #[error("Configuration error: {0}")] Config(String),
}

impl GatewayError {
    pub fn connect(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        GatewayError::Connect {
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        GatewayError::Persistence(message.into())
    }

    /// Errors raised by the socket layer rather than by the gateway application
    pub fn is_transport(&self) -> bool {
        matches!(self, GatewayError::Connect { .. } | GatewayError::ConnectionClosed)
    }

    /// Whether a reconnection cycle may retry after this failure
    ///
    /// Rejected credentials are final; everything at the transport level and
    /// an unanswered authentication are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Connect { .. } => true,
            GatewayError::ConnectionClosed => true,
            GatewayError::CommandTimeout { command, .. } => command == crate::gateway::AUTH_COMMAND,
            _ => false,
        }
    }
}

/// A frame that could not be turned into a wire message
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("Malformed JSON: {0}")] Json(String),

    #[error("Unknown message kind '{0}'")] UnknownKind(String),

    #[error("Missing or invalid field '{field}' in {kind} message")] InvalidField {
        kind: String,
        field: String,
    },

    #[error("Malformed {kind} message: {reason}")] Malformed {
        kind: String,
        reason: String,
    },

    #[error("Binary frame is not valid UTF-8")] NotUtf8,

    #[error("Empty frame")] Empty,
}

/// A payload that failed its schema
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Validation failed for {subject}: {message}")]
pub struct ValidationError {
    /// Topic, serial, or field name the failure refers to
    pub subject: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            message: message.into(),
        }
    }
}
