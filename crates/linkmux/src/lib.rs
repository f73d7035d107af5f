//! linkmux: many logical channels over one physical link.
//!
//! A channel multiplexer for talking to remote hosts and a local compute
//! coprocessor over PCIe, USB, Ethernet or shared memory. Callers open
//! numbered channels on a connected device, move data with blocking or
//! non-blocking semantics under credit-based flow control, and release
//! buffers when done.
//!
//! The workspace splits into three layers, re-exported here:
//!
//! - [`transport`]: the [`Transport`], [`BufferAllocator`] and
//!   [`AddressTranslator`] contracts plus in-memory implementations
//! - [`mux`]: the channel state machine, flow control and passthrough
//!   routing to the coprocessor domain
//! - [`link`]: link lifecycle, wire dispatch and the [`LinkService`] API
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use linkmux::{
//!     DeviceHandle, DeviceKind, HeapAllocator, Interface, LinkService, Loopback,
//!     OffsetTranslator, OpMode,
//! };
//! use linkmux::transport::interface::device_id_for;
//!
//! # fn main() -> Result<(), linkmux::LinkError> {
//! let service = LinkService::new(
//!     Arc::new(HeapAllocator::new()),
//!     Arc::new(Loopback::new()),
//!     Arc::new(OffsetTranslator::new(0)),
//! );
//! let device = DeviceHandle::new(device_id_for(Interface::Pcie, 1), DeviceKind::Remote);
//! service.connect(device)?;
//! service.open_channel(device.device_id, 0x500, OpMode::RxBlockTxBlock, 4096, 1000)?;
//! service.write(device.device_id, 0x500, b"hello")?;
//! # Ok(())
//! # }
//! ```

pub use linkmux_link as link;
pub use linkmux_mux as mux;
pub use linkmux_transport as transport;

pub use linkmux_link::{Dispatcher, LinkError, LinkRegistry, LinkService};
pub use linkmux_mux::{
    CallbackTarget, ChannelNotice, ChannelStatus, Event, EventKind, Multiplexer, MuxError,
    NoticeKind, OpMode, ReadPayload, TxReply,
};
pub use linkmux_transport::{
    AddressTranslator, BufferAllocator, DeviceHandle, DeviceKind, DmaBuffer, HeapAllocator,
    Interface, IpcContext, Loopback, MemoryRegion, OffsetTranslator, Transport, TransportError,
};
