//! Protocol events.
//!
//! An event describes one operation traveling between the multiplexer, the
//! dispatcher and the passthrough path. Events are single-owner values:
//! every entry point consumes them, so each code path has exactly one place
//! responsible for disposal.

use bytes::Bytes;
use linkmux_transport::DeviceHandle;

use crate::channel::OpMode;
use crate::error::{MuxError, Result};

/// Which dispatcher queue an event is bound for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Outgoing: produced locally, bound for the wire.
    Tx,
    /// Incoming: completion or forward produced while servicing the wire.
    Rx,
}

/// Operation carried by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventKind {
    WriteReq = 0x00,
    WriteVolatileReq = 0x01,
    ReadReq = 0x02,
    ReadToBufferReq = 0x03,
    ReleaseReq = 0x04,
    OpenChannelReq = 0x05,
    CloseChannelReq = 0x06,
    PingReq = 0x07,
    WriteControlReq = 0x08,
    PassthroughWriteReq = 0x09,
    PassthroughVolatileWriteReq = 0x0A,
    PassthroughReadReq = 0x0B,
    PassthroughReadToBufferReq = 0x0C,

    WriteResp = 0x10,
    WriteVolatileResp = 0x11,
    ReadResp = 0x12,
    ReadToBufferResp = 0x13,
    ReleaseResp = 0x14,
    OpenChannelResp = 0x15,
    CloseChannelResp = 0x16,
    PingResp = 0x17,
    WriteControlResp = 0x18,
}

impl EventKind {
    /// Whether this kind is a completion of a previously issued request.
    pub fn is_response(self) -> bool {
        (self as u8) >= 0x10
    }

    /// Whether a payload body follows the wire header for this kind.
    pub fn carries_payload(self) -> bool {
        matches!(
            self,
            EventKind::WriteReq
                | EventKind::WriteVolatileReq
                | EventKind::WriteControlReq
                | EventKind::PassthroughWriteReq
                | EventKind::PassthroughVolatileWriteReq
        )
    }

    pub fn wire_code(self) -> u8 {
        self as u8
    }

    pub fn from_wire_code(code: u8) -> Result<Self> {
        let kind = match code {
            0x00 => EventKind::WriteReq,
            0x01 => EventKind::WriteVolatileReq,
            0x02 => EventKind::ReadReq,
            0x03 => EventKind::ReadToBufferReq,
            0x04 => EventKind::ReleaseReq,
            0x05 => EventKind::OpenChannelReq,
            0x06 => EventKind::CloseChannelReq,
            0x07 => EventKind::PingReq,
            0x08 => EventKind::WriteControlReq,
            0x09 => EventKind::PassthroughWriteReq,
            0x0A => EventKind::PassthroughVolatileWriteReq,
            0x0B => EventKind::PassthroughReadReq,
            0x0C => EventKind::PassthroughReadToBufferReq,
            0x10 => EventKind::WriteResp,
            0x11 => EventKind::WriteVolatileResp,
            0x12 => EventKind::ReadResp,
            0x13 => EventKind::ReadToBufferResp,
            0x14 => EventKind::ReleaseResp,
            0x15 => EventKind::OpenChannelResp,
            0x16 => EventKind::CloseChannelResp,
            0x17 => EventKind::PingResp,
            0x18 => EventKind::WriteControlResp,
            _ => return Err(MuxError::ProtocolError("unknown event kind on wire")),
        };
        Ok(kind)
    }
}

/// One protocol operation in flight.
#[derive(Debug, Clone)]
pub struct Event {
    pub link_id: u32,
    pub chan: u16,
    pub kind: EventKind,
    pub device: DeviceHandle,
    /// Payload size in bytes (or release size for release events).
    pub size: u32,
    pub timeout_ms: u32,
    /// Embedded payload, for operations that carry data by value.
    pub payload: Option<Bytes>,
    /// Physical address plumbing: release-by-address and passthrough buffers.
    pub phys: Option<u64>,
    /// Requested operating mode, for open requests.
    pub mode: Option<OpMode>,
}

impl Event {
    pub fn new(link_id: u32, kind: EventKind, device: DeviceHandle, chan: u16, size: u32) -> Self {
        Self {
            link_id,
            chan,
            kind,
            device,
            size,
            timeout_ms: 0,
            payload: None,
            phys: None,
            mode: None,
        }
    }

    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.size = payload.len() as u32;
        self.payload = Some(payload);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u32) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_mode(mut self, mode: OpMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_phys(mut self, phys: u64) -> Self {
        self.phys = Some(phys);
        self
    }
}

/// Serialized hand-off point between the multiplexer and the dispatcher.
pub trait EventSink: Send + Sync {
    /// Take ownership of an event for asynchronous delivery.
    fn enqueue(&self, direction: Direction, event: Event) -> Result<()>;
}
