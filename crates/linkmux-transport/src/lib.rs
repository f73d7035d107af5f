//! Transport contracts for linkmux.
//!
//! Defines the collaborator interfaces the channel multiplexer depends on:
//! - [`Transport`]: byte-level read/write/open/close over a physical interface
//! - [`BufferAllocator`]: DMA-visible buffer lifecycle with physical addresses
//! - [`AddressTranslator`]: host-physical to coprocessor address mapping
//!
//! This is the lowest layer of linkmux. Everything else builds on top of
//! these traits. The [`Loopback`] transport and [`HeapAllocator`] are
//! in-memory implementations used by tests and demos.

pub mod error;
pub mod interface;
pub mod loopback;
pub mod traits;

pub use error::{Result, TransportError};
pub use interface::{DeviceHandle, DeviceKind, Interface};
pub use loopback::{HeapAllocator, Loopback, OffsetTranslator};
pub use traits::{AddressTranslator, BufferAllocator, DmaBuffer, IpcContext, MemoryRegion, Transport};
