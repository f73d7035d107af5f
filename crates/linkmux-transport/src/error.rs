use crate::interface::Interface;

/// Errors that can occur in transport and allocator operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// No device is reachable on the given interface.
    #[error("no route to device {device_id:#x} on {interface:?}")]
    NoRoute { interface: Interface, device_id: u32 },

    /// A blocking transport operation exceeded its deadline.
    #[error("transport operation timed out")]
    Timeout,

    /// The transport has been shut down.
    #[error("transport shut down")]
    Shutdown,

    /// Buffer allocation failed.
    #[error("failed to allocate {size} bytes")]
    AllocationFailed { size: usize },

    /// The interface-side channel is not open.
    #[error("channel {chan:#x} not open on {interface:?}")]
    ChannelClosed { interface: Interface, chan: u16 },

    /// A transfer moved fewer bytes than requested.
    #[error("short transfer: {transferred} of {requested} bytes")]
    ShortTransfer { requested: usize, transferred: usize },

    /// An I/O error occurred on the underlying device.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;
