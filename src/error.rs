//! Error types shared by the relay components.

use crate::relay::framing::FrameError;
use crate::relay::ServerState;
use std::io;
use std::time::Duration;

/// Errors raised by the relay core.
///
/// Everything except `Bind` and `Lifecycle` is contained to the connection
/// that produced it: logged, the client dropped, the rest of the relay
/// untouched.
#[derive(Debug)]
pub enum RelayError {
    /// The listening socket could not be bound. Fatal for `start`.
    Bind { address: String, source: io::Error },
    /// A read, write or accept failed.
    Transport(io::Error),
    /// A write to a peer missed its deadline.
    WriteTimeout(Duration),
    /// Malformed or oversized input; the reader resynchronizes.
    Framing(FrameError),
    /// The bus stayed full for longer than the publish deadline.
    Capacity(Duration),
    /// The broadcaster is gone and the bus no longer accepts messages.
    BusClosed,
    /// An operation was attempted in a state that does not allow it.
    Lifecycle {
        operation: &'static str,
        state: ServerState,
    },
}

impl RelayError {
    /// Whether the reader loop may keep going after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, RelayError::Framing(_))
    }
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayError::Bind { address, source } => {
                write!(f, "Failed to bind '{address}': {source}")
            }
            RelayError::Transport(e) => write!(f, "Transport error: {e}"),
            RelayError::WriteTimeout(deadline) => {
                write!(f, "Write did not complete within {deadline:?}")
            }
            RelayError::Framing(e) => write!(f, "Framing error: {e}"),
            RelayError::Capacity(deadline) => {
                write!(f, "Message bus full for longer than {deadline:?}")
            }
            RelayError::BusClosed => write!(f, "Message bus is closed"),
            RelayError::Lifecycle { operation, state } => {
                write!(f, "Cannot {operation} while server is {state}")
            }
        }
    }
}

impl std::error::Error for RelayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RelayError::Bind { source, .. } => Some(source),
            RelayError::Transport(e) => Some(e),
            RelayError::Framing(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for RelayError {
    fn from(e: io::Error) -> Self {
        RelayError::Transport(e)
    }
}

impl From<FrameError> for RelayError {
    fn from(e: FrameError) -> Self {
        RelayError::Framing(e)
    }
}
