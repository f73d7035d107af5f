//! Compiled-in configuration constants.
//!
//! The channel-id space, link count, queue bounds and control-channel
//! parameters are fixed at build time, not negotiated at runtime.

use std::time::Duration;

/// Size of the channel-id space per link.
pub const NUM_CHANNELS: u16 = 4096;

/// Maximum number of concurrently connected links.
pub const MAX_LINKS: usize = 16;

/// Maximum number of packets queued per channel, per direction.
pub const PACKET_QUEUE_CAPACITY: usize = 10_000;

/// Alignment for DMA-visible packet buffers.
pub const PACKET_ALIGNMENT: usize = 64;

/// Maximum size of a single bounded-copy buffer (volatile and passthrough
/// read-to-buffer transfers).
pub const MAX_BUF_SIZE: usize = 128;

/// Maximum size of a single ordinary write.
pub const MAX_DATA_SIZE: usize = 1024 * 1024 * 1024;

/// Maximum size of an embedded control payload.
pub const MAX_CONTROL_DATA_SIZE: usize = 100;

/// End of the coprocessor (shared-memory) channel range, starting at zero.
pub const IPC_CHANNEL_LIMIT: u16 = 1024;

/// Control channel used for remote-host connection bootstrap.
pub const REMOTE_CONTROL_CHANNEL: u16 = 0x00A;

/// Control channel used for coprocessor connection bootstrap.
pub const COPROC_CONTROL_CHANNEL: u16 = 0x400;

/// Byte capacity of a control channel.
pub const CONTROL_CHANNEL_SIZE: u32 = 128;

/// Control channels wait indefinitely.
pub const CONTROL_CHANNEL_TIMEOUT_MS: u32 = 0;

/// Fill fraction (percent) above which writes are gated.
pub const THRESHOLD_UPPER_PCT: u32 = 85;

/// Fill fraction (percent) below which a tripped gate reopens.
pub const THRESHOLD_LOWER_PCT: u32 = 80;

/// Bounded wait for the peer to acknowledge a locally initiated open.
pub const OPEN_CHANNEL_TIMEOUT: Duration = Duration::from_secs(5);
