use linkmux_transport::TransportError;

use crate::signal::WaitError;

/// Errors that can occur in multiplexer operations.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    /// Channel id outside the compiled id space, or no table entry for it.
    #[error("invalid channel {0:#x}")]
    InvalidChannel(u16),

    /// The operation requires an open channel.
    #[error("channel {0:#x} not open")]
    ChannelNotOpen(u16),

    /// A second same-origin open on an already open channel.
    #[error("channel {0:#x} already open")]
    AlreadyOpen(u16),

    /// Non-blocking backpressure: the channel cannot accept or produce data.
    #[error("channel {0:#x} full")]
    ChannelFull(u16),

    /// A blocking wait exceeded its deadline.
    #[error("operation timed out")]
    Timeout,

    /// A blocking wait was aborted by cancellation.
    #[error("operation interrupted")]
    Interrupted,

    /// A transport buffer allocation failed.
    #[error("allocation of {size} bytes failed")]
    AllocationFailure { size: usize },

    /// The underlying transport read/write/open/close failed or was short.
    #[error("transport failure: {0}")]
    TransportFailure(#[source] TransportError),

    /// Unexpected event type in the current state, or malformed routing.
    #[error("protocol error: {0}")]
    ProtocolError(&'static str),

    /// No active link with this id (communication failure).
    #[error("no active link {0}")]
    LinkDown(u32),
}

impl From<TransportError> for MuxError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => MuxError::Timeout,
            TransportError::AllocationFailed { size } => MuxError::AllocationFailure { size },
            other => MuxError::TransportFailure(other),
        }
    }
}

impl From<WaitError> for MuxError {
    fn from(err: WaitError) -> Self {
        match err {
            WaitError::Timeout => MuxError::Timeout,
            WaitError::Interrupted => MuxError::Interrupted,
        }
    }
}

pub type Result<T> = std::result::Result<T, MuxError>;
