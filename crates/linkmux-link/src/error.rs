use linkmux_mux::MuxError;
use linkmux_transport::TransportError;

/// Errors surfaced by the link service.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error(transparent)]
    Mux(#[from] MuxError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Every link slot is in use.
    #[error("no free link slots")]
    NoFreeLinks,

    /// No connected link for this device id.
    #[error("device {0:#x} is not connected")]
    UnknownDevice(u32),

    /// The link id does not name an active link.
    #[error("no active link {0}")]
    InvalidLink(u32),
}

pub type Result<T> = std::result::Result<T, LinkError>;
