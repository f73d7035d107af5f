use std::time::Duration;

use bytes::{Bytes, BytesMut};

use crate::error::Result;
use crate::interface::Interface;

/// Which memory region a buffer is allocated from.
///
/// Ordinary packet buffers come from normal memory; buffers whose physical
/// address is handed to the coprocessor must come from the contiguous region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRegion {
    Normal,
    Contiguous,
}

/// Per-operation context for the shared-memory (coprocessor) interface.
#[derive(Debug, Clone, Copy, Default)]
pub struct IpcContext {
    /// Coprocessor-side channel the operation addresses.
    pub chan: u16,
    /// Payload is carried by value rather than by physical address.
    pub is_volatile: bool,
}

impl IpcContext {
    pub fn new(chan: u16) -> Self {
        Self {
            chan,
            is_volatile: false,
        }
    }

    pub fn volatile(chan: u16) -> Self {
        Self {
            chan,
            is_volatile: true,
        }
    }
}

/// A driver-allocated, DMA-visible buffer.
///
/// Writable until frozen into a packet; carries the physical address the
/// transport hardware sees.
#[derive(Debug)]
pub struct DmaBuffer {
    data: BytesMut,
    phys: u64,
    region: MemoryRegion,
    alignment: usize,
}

impl DmaBuffer {
    pub fn new(data: BytesMut, phys: u64, region: MemoryRegion, alignment: usize) -> Self {
        Self {
            data,
            phys,
            region,
            alignment,
        }
    }

    pub fn phys(&self) -> u64 {
        self.phys
    }

    pub fn region(&self) -> MemoryRegion {
        self.region
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Shrink to the number of bytes actually transferred.
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    /// Copy a payload in, replacing the buffer contents up to its capacity.
    pub fn fill_from(&mut self, src: &[u8]) {
        let n = src.len().min(self.data.len());
        self.data[..n].copy_from_slice(&src[..n]);
        self.data.truncate(n);
    }

    /// Freeze into immutable payload bytes plus the physical address.
    pub fn freeze(self) -> (Bytes, u64, MemoryRegion, usize) {
        (self.data.freeze(), self.phys, self.region, self.alignment)
    }
}

/// Allocates and releases DMA-visible buffers on behalf of a device.
pub trait BufferAllocator: Send + Sync {
    /// Allocate `size` bytes, aligned, from the given region.
    fn allocate(
        &self,
        device_id: u32,
        size: usize,
        alignment: usize,
        region: MemoryRegion,
    ) -> Result<DmaBuffer>;

    /// Return a buffer to the region it came from.
    ///
    /// `data` is the frozen payload; `phys` identifies the allocation.
    fn deallocate(&self, data: Bytes, phys: u64, alignment: usize, region: MemoryRegion);
}

/// Byte-level access to one physical interface.
///
/// `timeout` of `None` blocks indefinitely.
pub trait Transport: Send + Sync {
    /// Write `data` to the device. Returns the number of bytes accepted.
    fn write(
        &self,
        interface: Interface,
        device_id: u32,
        data: &[u8],
        timeout: Option<Duration>,
        ipc: Option<&IpcContext>,
    ) -> Result<usize>;

    /// Read into `buf`. Returns the number of bytes transferred.
    fn read(
        &self,
        interface: Interface,
        device_id: u32,
        buf: &mut [u8],
        timeout: Option<Duration>,
        ipc: Option<&IpcContext>,
    ) -> Result<usize>;

    /// Open an interface-side channel (shared-memory transports only).
    fn open_channel(&self, interface: Interface, device_id: u32, chan: u16) -> Result<()>;

    /// Close an interface-side channel.
    fn close_channel(&self, interface: Interface, device_id: u32, chan: u16) -> Result<()>;
}

/// Pure translation between host physical addresses and the coprocessor's
/// address space. Never copies data.
pub trait AddressTranslator: Send + Sync {
    fn to_device(&self, phys: u64) -> u64;
    fn to_host(&self, device_addr: u64) -> u64;
}
