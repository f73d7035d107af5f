//! Static channel-id routing table.
//!
//! Channel ids map to a pair of interfaces: the primary interface used to
//! reach a remote host, and an optional secondary interface used when the
//! channel also passes through to the local coprocessor. Lookup is pure and
//! needs no locking.

use linkmux_transport::{DeviceHandle, DeviceKind, Interface};

use crate::config::{COPROC_CONTROL_CHANNEL, NUM_CHANNELS, REMOTE_CONTROL_CHANNEL};

/// The interface pair a channel id routes over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelClass {
    /// Interface toward the remote host.
    pub primary: Interface,
    /// Interface toward the local coprocessor, if the channel passes through.
    pub secondary: Option<Interface>,
}

struct RangeEntry {
    start: u16,
    stop: u16,
    class: ChannelClass,
}

const RANGES: &[RangeEntry] = &[
    RangeEntry {
        start: 0x000,
        stop: 0x001,
        class: ChannelClass {
            primary: Interface::Pcie,
            secondary: Some(Interface::Ipc),
        },
    },
    RangeEntry {
        start: 0x002,
        stop: 0x009,
        class: ChannelClass {
            primary: Interface::Usb,
            secondary: Some(Interface::Ipc),
        },
    },
    RangeEntry {
        start: 0x00A,
        stop: 0x3FD,
        class: ChannelClass {
            primary: Interface::Pcie,
            secondary: Some(Interface::Ipc),
        },
    },
    RangeEntry {
        start: 0x3FE,
        stop: 0x3FF,
        class: ChannelClass {
            primary: Interface::Eth,
            secondary: Some(Interface::Ipc),
        },
    },
    RangeEntry {
        start: 0x400,
        stop: 0xFFE,
        class: ChannelClass {
            primary: Interface::Pcie,
            secondary: None,
        },
    },
    RangeEntry {
        start: 0xFFF,
        stop: 0xFFF,
        class: ChannelClass {
            primary: Interface::Eth,
            secondary: None,
        },
    },
];

/// Look up the interface pair for a channel id.
pub fn classify(chan: u16) -> Option<ChannelClass> {
    if chan >= NUM_CHANNELS {
        return None;
    }
    RANGES
        .iter()
        .find(|entry| chan >= entry.start && chan <= entry.stop)
        .map(|entry| entry.class)
}

/// Whether traffic on this channel is also routed to the coprocessor domain.
pub fn is_passthrough(chan: u16) -> bool {
    matches!(
        classify(chan),
        Some(ChannelClass {
            secondary: Some(Interface::Ipc),
            ..
        })
    )
}

/// Whether this id is one of the two reserved connection-bootstrap channels.
pub fn is_control_channel(chan: u16) -> bool {
    chan == REMOTE_CONTROL_CHANNEL || chan == COPROC_CONTROL_CHANNEL
}

/// Whether a channel id is usable with the given device.
///
/// Coprocessor devices must match the channel's secondary interface; remote
/// devices must match the primary.
pub fn channel_for_device(chan: u16, device: &DeviceHandle) -> bool {
    let Some(class) = classify(chan) else {
        return false;
    };
    let Some(interface) = device.interface() else {
        return false;
    };
    match device.kind {
        DeviceKind::Coprocessor => class.secondary == Some(interface),
        DeviceKind::Remote => class.primary == interface,
    }
}
