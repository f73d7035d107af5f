//! Reference-counted link slots.
//!
//! Each connected device occupies one of a fixed number of link slots.
//! Repeated connects to the same device share the slot; the physical link
//! comes down only when the last reference is released.

use std::sync::Mutex;

use linkmux_mux::config::MAX_LINKS;
use linkmux_transport::DeviceHandle;

use crate::error::{LinkError, Result};

struct LinkEntry {
    device: DeviceHandle,
    refs: u32,
}

/// Maps device ids to link ids, with per-link reference counts.
pub struct LinkRegistry {
    slots: Mutex<Vec<Option<LinkEntry>>>,
}

impl Default for LinkRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkRegistry {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new((0..MAX_LINKS).map(|_| None).collect()),
        }
    }

    /// Take a reference on the link for `device`, assigning a slot on first
    /// use. Returns the link id and whether this was the first reference.
    pub fn acquire(&self, device: DeviceHandle) -> Result<(u32, bool)> {
        let mut slots = self.slots.lock().unwrap();
        if let Some((link_id, entry)) = slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| matches!(slot, Some(e) if e.device.device_id == device.device_id))
            .map(|(i, slot)| (i as u32, slot.as_mut()))
        {
            if let Some(entry) = entry {
                entry.refs += 1;
                return Ok((link_id, false));
            }
        }
        let free = slots
            .iter()
            .position(Option::is_none)
            .ok_or(LinkError::NoFreeLinks)?;
        slots[free] = Some(LinkEntry { device, refs: 1 });
        Ok((free as u32, true))
    }

    /// Drop one reference. Returns the link id when the last reference went
    /// away and the link should come down.
    pub fn release(&self, device_id: u32) -> Result<Option<u32>> {
        let mut slots = self.slots.lock().unwrap();
        let (link_id, slot) = slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| matches!(slot, Some(e) if e.device.device_id == device_id))
            .ok_or(LinkError::UnknownDevice(device_id))?;
        let entry = slot.as_mut().ok_or(LinkError::UnknownDevice(device_id))?;
        entry.refs -= 1;
        if entry.refs == 0 {
            *slot = None;
            return Ok(Some(link_id as u32));
        }
        Ok(None)
    }

    /// The link id and handle for a connected device.
    pub fn lookup(&self, device_id: u32) -> Result<(u32, DeviceHandle)> {
        let slots = self.slots.lock().unwrap();
        slots
            .iter()
            .enumerate()
            .find_map(|(i, slot)| match slot {
                Some(e) if e.device.device_id == device_id => Some((i as u32, e.device)),
                _ => None,
            })
            .ok_or(LinkError::UnknownDevice(device_id))
    }

    /// Link ids of every connected device, for shutdown.
    pub fn active_links(&self) -> Vec<u32> {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|_| i as u32))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use linkmux_transport::interface::device_id_for;
    use linkmux_transport::{DeviceKind, Interface};

    use super::*;

    fn dev(index: u32) -> DeviceHandle {
        DeviceHandle::new(device_id_for(Interface::Pcie, index), DeviceKind::Remote)
    }

    #[test]
    fn same_device_shares_a_slot() {
        let registry = LinkRegistry::new();
        let (id1, first) = registry.acquire(dev(1)).unwrap();
        assert!(first);
        let (id2, first) = registry.acquire(dev(1)).unwrap();
        assert!(!first);
        assert_eq!(id1, id2);

        assert_eq!(registry.release(dev(1).device_id).unwrap(), None);
        assert_eq!(registry.release(dev(1).device_id).unwrap(), Some(id1));
        assert!(registry.lookup(dev(1).device_id).is_err());
    }

    #[test]
    fn distinct_devices_get_distinct_slots() {
        let registry = LinkRegistry::new();
        let (id1, _) = registry.acquire(dev(1)).unwrap();
        let (id2, _) = registry.acquire(dev(2)).unwrap();
        assert_ne!(id1, id2);
        assert_eq!(registry.active_links().len(), 2);
    }

    #[test]
    fn slots_are_exhaustible() {
        let registry = LinkRegistry::new();
        for i in 0..MAX_LINKS as u32 {
            registry.acquire(dev(i)).unwrap();
        }
        let err = registry.acquire(dev(99)).unwrap_err();
        assert!(matches!(err, LinkError::NoFreeLinks));

        registry.release(dev(0).device_id).unwrap();
        registry.acquire(dev(99)).unwrap();
    }

    #[test]
    fn release_of_unknown_device_fails() {
        let registry = LinkRegistry::new();
        assert!(matches!(
            registry.release(0xBEEF).unwrap_err(),
            LinkError::UnknownDevice(0xBEEF)
        ));
    }
}
