//! Physical interface identification.
//!
//! A device id encodes its transport interface in bits 24..27, so the
//! interface a device is reachable over can be recovered from the id alone.

/// Bit position of the interface field inside a device id.
const INTERFACE_SHIFT: u32 = 24;
const INTERFACE_MASK: u32 = 0x7;

const INTERFACE_IPC: u32 = 0x0;
const INTERFACE_PCIE: u32 = 0x1;
const INTERFACE_USB: u32 = 0x2;
const INTERFACE_ETH: u32 = 0x3;

/// A physical transport interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interface {
    /// Inter-processor shared-memory transport to the local coprocessor.
    Ipc,
    /// PCIe link to a remote device.
    Pcie,
    /// USB CDC link to a remote device.
    Usb,
    /// Ethernet link to a remote device.
    Eth,
}

impl Interface {
    /// Decode the interface a device is reachable over from its device id.
    pub fn from_device_id(device_id: u32) -> Option<Interface> {
        match (device_id >> INTERFACE_SHIFT) & INTERFACE_MASK {
            INTERFACE_IPC => Some(Interface::Ipc),
            INTERFACE_PCIE => Some(Interface::Pcie),
            INTERFACE_USB => Some(Interface::Usb),
            INTERFACE_ETH => Some(Interface::Eth),
            _ => None,
        }
    }
}

/// What kind of endpoint a device handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// A remote host reachable over PCIe/USB/Ethernet.
    Remote,
    /// The local compute coprocessor reachable over shared memory.
    Coprocessor,
}

/// An opaque device identifier plus its endpoint kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceHandle {
    pub device_id: u32,
    pub kind: DeviceKind,
}

impl DeviceHandle {
    pub fn new(device_id: u32, kind: DeviceKind) -> Self {
        Self { device_id, kind }
    }

    /// The interface this device is reachable over.
    pub fn interface(&self) -> Option<Interface> {
        Interface::from_device_id(self.device_id)
    }
}

/// Build a device id with the interface field set.
pub fn device_id_for(interface: Interface, index: u32) -> u32 {
    let bits = match interface {
        Interface::Ipc => INTERFACE_IPC,
        Interface::Pcie => INTERFACE_PCIE,
        Interface::Usb => INTERFACE_USB,
        Interface::Eth => INTERFACE_ETH,
    };
    (bits << INTERFACE_SHIFT) | (index & 0x00FF_FFFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_roundtrip() {
        for iface in [Interface::Ipc, Interface::Pcie, Interface::Usb, Interface::Eth] {
            let id = device_id_for(iface, 7);
            assert_eq!(Interface::from_device_id(id), Some(iface));
        }
    }

    #[test]
    fn unknown_interface_bits() {
        let id = 0x5 << INTERFACE_SHIFT;
        assert_eq!(Interface::from_device_id(id), None);
    }

    #[test]
    fn handle_reports_interface() {
        let handle = DeviceHandle::new(device_id_for(Interface::Pcie, 0), DeviceKind::Remote);
        assert_eq!(handle.interface(), Some(Interface::Pcie));
    }
}
