//! Per-channel state: status machine, operating mode and the open-channel
//! context that exists only while a channel is open.

use std::sync::Arc;

use crate::config::{PACKET_QUEUE_CAPACITY, THRESHOLD_LOWER_PCT, THRESHOLD_UPPER_PCT};
use crate::notifier::CallbackTarget;
use crate::packet::PacketQueue;
use crate::signal::Signal;

/// Channel lifecycle state.
///
/// Opening is symmetric: whichever side's open request arrives second
/// completes the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Closed,
    /// This side issued an open; waiting for the peer to confirm.
    PendingLocal,
    /// The peer opened first; waiting for a local open.
    PendingPeer,
    Open,
}

/// Blocking behavior per direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpMode {
    RxBlockTxBlock = 0,
    RxBlockTxNonBlock = 1,
    RxNonBlockTxBlock = 2,
    RxNonBlockTxNonBlock = 3,
}

impl OpMode {
    pub fn rx_blocking(self) -> bool {
        matches!(self, OpMode::RxBlockTxBlock | OpMode::RxBlockTxNonBlock)
    }

    pub fn tx_blocking(self) -> bool {
        matches!(self, OpMode::RxBlockTxBlock | OpMode::RxNonBlockTxBlock)
    }

    pub fn from_wire_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(OpMode::RxBlockTxBlock),
            1 => Some(OpMode::RxBlockTxNonBlock),
            2 => Some(OpMode::RxNonBlockTxBlock),
            3 => Some(OpMode::RxNonBlockTxNonBlock),
            _ => None,
        }
    }

    pub fn wire_code(self) -> u8 {
        self as u8
    }
}

/// Live resources of an open channel.
///
/// Created on the transition out of `Closed`, destroyed on close. All fields
/// are guarded by the owning channel slot's lock; the signals are shared so
/// waiters can park after dropping that lock.
pub struct OpenChannel {
    pub rx_queue: PacketQueue,
    pub tx_queue: PacketQueue,
    pub rx_fill: u32,
    pub tx_fill: u32,
    pub tx_packets: u32,
    /// Hysteresis: set when fill trips the upper threshold, cleared when it
    /// drops below the lower one.
    pub tx_over_threshold: bool,
    pub opened: Arc<Signal>,
    pub available: Arc<Signal>,
    pub consumed: Arc<Signal>,
    pub released: Arc<Signal>,
    pub ready_callback: Option<CallbackTarget>,
    pub consumed_callback: Option<CallbackTarget>,
}

impl OpenChannel {
    pub fn new() -> Self {
        Self {
            rx_queue: PacketQueue::new(PACKET_QUEUE_CAPACITY),
            tx_queue: PacketQueue::new(PACKET_QUEUE_CAPACITY),
            rx_fill: 0,
            tx_fill: 0,
            tx_packets: 0,
            tx_over_threshold: false,
            opened: Arc::new(Signal::new()),
            available: Arc::new(Signal::new()),
            consumed: Arc::new(Signal::new()),
            released: Arc::new(Signal::new()),
            ready_callback: None,
            consumed_callback: None,
        }
    }

    /// Flow-control admission for a write of `size` bytes against a channel
    /// of `capacity` bytes.
    ///
    /// Applies the upper/lower threshold hysteresis and the packet-count
    /// limit. Mutates the hysteresis flag as thresholds are crossed.
    pub fn admit(&mut self, size: u32, capacity: u32) -> bool {
        let packet_limit = (PACKET_QUEUE_CAPACITY as u32 / 100) * THRESHOLD_UPPER_PCT;
        if self.tx_packets >= packet_limit {
            tracing::debug!(tx_packets = self.tx_packets, "packet queue limit reached");
            return false;
        }
        let prospective = self.tx_fill.saturating_add(size);
        if !self.tx_over_threshold {
            if prospective > (capacity / 100) * THRESHOLD_UPPER_PCT {
                self.tx_over_threshold = true;
                return false;
            }
            return true;
        }
        if prospective < (capacity / 100) * THRESHOLD_LOWER_PCT {
            self.tx_over_threshold = false;
            return true;
        }
        false
    }

    /// Abort every blocked waiter on this channel.
    pub fn interrupt_waiters(&self) {
        self.opened.interrupt();
        self.available.interrupt();
        self.consumed.interrupt();
        self.released.interrupt();
    }
}

impl Default for OpenChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// One entry of a link's channel table.
pub struct Channel {
    pub status: ChannelStatus,
    /// Coprocessor-side status for passthrough channels.
    pub coproc_status: ChannelStatus,
    pub mode: OpMode,
    /// Byte capacity used for flow-control thresholds.
    pub size: u32,
    pub timeout_ms: u32,
    pub open: Option<OpenChannel>,
}

impl Channel {
    pub fn new() -> Self {
        Self {
            status: ChannelStatus::Closed,
            coproc_status: ChannelStatus::Closed,
            mode: OpMode::RxBlockTxBlock,
            size: 0,
            timeout_ms: 0,
            open: None,
        }
    }
}

impl Default for Channel {
    fn default() -> Self {
        Self::new()
    }
}
