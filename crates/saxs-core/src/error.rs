//! Error types for instrument communication.
//!
//! The taxonomy separates *what went wrong on the wire* from *what the
//! instrument told us*, because only the former participates in retries:
//!
//! - **`Connection`**: the link cannot be opened, is already open, or is not
//!   open. Raised by lifecycle calls only.
//! - **`Timeout`**: no reply within the read timeout. Retried.
//! - **`Protocol`**: well-formed bytes that cannot be interpreted. Plain
//!   protocol errors indicate a firmware/driver mismatch and are not retried;
//!   the framed-protocol integrity kinds (`Checksum`, `InstructionMismatch`)
//!   are retried because line noise is plausible.
//! - **`DeviceRejected`**: the firmware answered with an explicit negative
//!   status. Surfaced immediately, never retried.
//! - **`CommunicationBroken`**: the transport is confirmed dead. The owning
//!   connection is always scheduled for disconnection when this is raised.
//!
//! All variants carry owned strings so errors can be cloned into
//! notifications and stored as the last failure of a property.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the core error type.
pub type CoreResult<T> = std::result::Result<T, CoreError>;

// =============================================================================
// Connection Errors
// =============================================================================

/// Lifecycle errors: the link cannot be opened, or is in the wrong state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// `connect()` was called on a connection that is not disconnected.
    #[error("'{instrument}' is already connected")]
    AlreadyConnected {
        /// Instrument name
        instrument: String,
    },

    /// An operation that needs a live transport was called while disconnected.
    #[error("'{instrument}' is not connected")]
    NotConnected {
        /// Instrument name
        instrument: String,
    },

    /// Opening the transport or running the post-connect hook failed.
    #[error("cannot connect '{instrument}' at {address}: {reason}")]
    Open {
        /// Instrument name
        instrument: String,
        /// Address that was dialled
        address: String,
        /// Underlying cause
        reason: String,
    },
}

// =============================================================================
// Protocol Errors
// =============================================================================

/// The bytes arrived but could not be interpreted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The message does not follow the expected wire format.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// No candidate reply pattern matched a message tied to a pending command.
    #[error("reply to '{command}' did not match any known pattern: {message:?}")]
    Unmatched {
        /// Command whose reply was expected
        command: String,
        /// Raw message text
        message: String,
    },

    /// A captured field could not be converted to its declared type.
    #[error("field '{field}' = {raw:?} is not a valid {expected}")]
    BadField {
        /// Capture group name
        field: String,
        /// Raw captured text
        raw: String,
        /// Declared type
        expected: &'static str,
    },

    /// Framed-protocol checksum did not match the transmitted one.
    #[error("checksum mismatch: computed {computed:#04x}, received {received:#04x}")]
    Checksum {
        /// Checksum computed over the received bytes
        computed: u8,
        /// Checksum byte found on the wire
        received: u8,
    },

    /// The reply echoes a different instruction than the one sent.
    #[error("instruction mismatch: sent {sent}, reply echoes {received}")]
    InstructionMismatch {
        /// Instruction number that was sent
        sent: u8,
        /// Instruction number found in the reply
        received: u8,
    },
}

impl ProtocolError {
    /// Integrity failures that line noise can explain.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            ProtocolError::Checksum { .. } | ProtocolError::InstructionMismatch { .. }
        )
    }
}

// =============================================================================
// CoreError
// =============================================================================

/// Primary error type for the communication layer.
#[derive(Error, Debug, Clone)]
pub enum CoreError {
    /// Lifecycle error (cannot open, already open, not open).
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// No reply arrived within the allowed time.
    ///
    /// **Error Type**: Transient. Retried by device operations.
    #[error("'{instrument}' timed out after {after:?} waiting for {waiting_for}")]
    Timeout {
        /// Instrument name
        instrument: String,
        /// What was being waited for (command name or operation)
        waiting_for: String,
        /// Elapsed bound
        after: Duration,
    },

    /// Uninterpretable reply.
    #[error("'{instrument}' protocol error: {source}")]
    Protocol {
        /// Instrument name
        instrument: String,
        /// Specific protocol failure
        #[source]
        source: ProtocolError,
    },

    /// The firmware returned an explicit negative status.
    ///
    /// **Error Type**: Permanent for this request. Never retried.
    #[error("'{instrument}' rejected the request: {reason}")]
    DeviceRejected {
        /// Instrument name
        instrument: String,
        /// Device-provided reason
        reason: String,
    },

    /// The transport is dead; the connection is being torn down.
    #[error("'{instrument}' communication broken: {reason}")]
    CommunicationBroken {
        /// Instrument name
        instrument: String,
        /// Underlying I/O failure
        reason: String,
    },

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    /// A caller-supplied argument is outside what the device accepts.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl CoreError {
    /// Build a protocol error for `instrument`.
    pub fn protocol(instrument: impl Into<String>, source: ProtocolError) -> Self {
        CoreError::Protocol {
            instrument: instrument.into(),
            source,
        }
    }

    /// Build a device-rejected error for `instrument`.
    pub fn rejected(instrument: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::DeviceRejected {
            instrument: instrument.into(),
            reason: reason.into(),
        }
    }

    /// Build a communication-broken error for `instrument`.
    pub fn broken(instrument: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        CoreError::CommunicationBroken {
            instrument: instrument.into(),
            reason: reason.to_string(),
        }
    }

    /// Build a timeout error for `instrument`.
    pub fn timeout(
        instrument: impl Into<String>,
        waiting_for: impl Into<String>,
        after: Duration,
    ) -> Self {
        CoreError::Timeout {
            instrument: instrument.into(),
            waiting_for: waiting_for.into(),
            after,
        }
    }

    /// Whether a device operation should try again after this error.
    ///
    /// Only communication-class failures qualify: timeouts and framed-protocol
    /// integrity errors. Negative replies, interpretation failures and a dead
    /// transport are surfaced immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            CoreError::Timeout { .. } => true,
            CoreError::Protocol { source, .. } => source.is_integrity(),
            _ => false,
        }
    }

    /// Whether this error means the transport is gone.
    pub fn breaks_link(&self) -> bool {
        matches!(self, CoreError::CommunicationBroken { .. })
    }
}
