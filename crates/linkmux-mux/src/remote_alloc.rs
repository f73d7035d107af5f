//! Registry of buffers allocated on behalf of the passthrough path.
//!
//! When a passthrough write allocates a buffer and hands its physical
//! address to the coprocessor, the coprocessor later hands the address back.
//! This registry maps that address to the original buffer so it can be
//! forwarded and eventually released. Entries are removed on first
//! successful lookup.

use std::sync::Mutex;

use bytes::Bytes;
use linkmux_transport::MemoryRegion;

#[derive(Debug, Clone)]
pub struct RemoteAlloc {
    pub data: Bytes,
    pub phys: u64,
    pub region: MemoryRegion,
    pub alignment: usize,
}

#[derive(Default)]
pub struct RemoteAllocRegistry {
    entries: Mutex<Vec<RemoteAlloc>>,
}

impl RemoteAllocRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, entry: RemoteAlloc) {
        self.entries.lock().unwrap().push(entry);
    }

    /// Remove and return the entry with the given physical address.
    pub fn take(&self, phys: u64) -> Option<RemoteAlloc> {
        let mut entries = self.entries.lock().unwrap();
        let idx = entries.iter().position(|e| e.phys == phys)?;
        Some(entries.remove(idx))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
