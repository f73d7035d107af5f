//! Passthrough routing to the coprocessor domain.
//!
//! Channels below the shared-memory channel limit exist in two domains at
//! once: the host side, reached through the dispatcher, and the coprocessor
//! side, reached through the shared-memory interface. Large payloads cross
//! the boundary by address: the host stages the data in a contiguous buffer
//! and hands the translated physical address over; volatile payloads cross
//! by value.

use bytes::Bytes;
use linkmux_transport::{DmaBuffer, Interface, IpcContext, MemoryRegion, TransportError};

use crate::channel::{ChannelStatus, OpMode};
use crate::config::{IPC_CHANNEL_LIMIT, MAX_BUF_SIZE, PACKET_ALIGNMENT};
use crate::error::{MuxError, Result};
use crate::event::{Direction, Event, EventKind};
use crate::multiplexer::{timeout_duration, ChannelSlot, LinkTable, Multiplexer, ReadPayload, TxReply};
use crate::remote_alloc::RemoteAlloc;

/// Size of a physical address carried over the shared-memory interface.
const ADDR_SIZE: usize = std::mem::size_of::<u64>();

impl Multiplexer {
    /// Direct operations from a caller attached through the shared-memory
    /// interface. Channels at or above the shared-memory limit have no
    /// coprocessor side and the operation is a no-op.
    pub(crate) fn passthrough(&self, event: Event) -> Result<TxReply> {
        let chan = event.chan;
        if chan >= IPC_CHANNEL_LIMIT {
            return Ok(TxReply::Done);
        }
        let table = self.link_table(event.link_id)?;
        let slot = &table.channels[chan as usize];
        match event.kind {
            EventKind::WriteReq | EventKind::PassthroughWriteReq => {
                let phys = event
                    .phys
                    .ok_or(MuxError::ProtocolError("passthrough write without address"))?;
                self.coproc_params(slot, chan)?;
                self.coproc_write_addr(chan, event.device.device_id, phys)?;
                Ok(TxReply::Done)
            }
            EventKind::WriteVolatileReq
            | EventKind::WriteControlReq
            | EventKind::PassthroughVolatileWriteReq => {
                let payload = event
                    .payload
                    .as_ref()
                    .ok_or(MuxError::ProtocolError("volatile write without payload"))?;
                self.coproc_params(slot, chan)?;
                self.coproc_write_bytes(chan, event.device.device_id, payload)?;
                Ok(TxReply::Done)
            }
            EventKind::ReadReq | EventKind::PassthroughReadReq => {
                let phys = self.coproc_read_phys(slot, &event)?;
                // a buffer staged by this host is handed back with its data;
                // anything else is address-only
                let data = match self.remote_allocs.take(phys) {
                    Some(entry) => {
                        let data = entry.data.clone();
                        self.allocator
                            .deallocate(entry.data, entry.phys, entry.alignment, entry.region);
                        data
                    }
                    None => Bytes::new(),
                };
                Ok(TxReply::Read(ReadPayload {
                    data,
                    phys: Some(phys),
                }))
            }
            EventKind::ReadToBufferReq => {
                let (mode, timeout_ms) = self.coproc_params(slot, chan)?;
                let data = self.coproc_read_bytes(chan, &event, mode, timeout_ms)?;
                Ok(TxReply::Read(ReadPayload { data, phys: None }))
            }
            EventKind::OpenChannelReq => {
                let mut guard = slot.state.lock().unwrap();
                if guard.coproc_status != ChannelStatus::Closed {
                    return Err(MuxError::AlreadyOpen(chan));
                }
                guard.size = event.size;
                guard.timeout_ms = event.timeout_ms;
                if let Some(mode) = event.mode {
                    guard.mode = mode;
                }
                self.transport
                    .open_channel(Interface::Ipc, event.device.device_id, chan)
                    .map_err(MuxError::from)?;
                guard.coproc_status = ChannelStatus::Open;
                Ok(TxReply::Done)
            }
            EventKind::CloseChannelReq => {
                let mut guard = slot.state.lock().unwrap();
                if guard.coproc_status != ChannelStatus::Open {
                    return Err(MuxError::ChannelNotOpen(chan));
                }
                self.transport
                    .close_channel(Interface::Ipc, event.device.device_id, chan)
                    .map_err(MuxError::from)?;
                guard.coproc_status = ChannelStatus::Closed;
                Ok(TxReply::Done)
            }
            _ => Ok(TxReply::Done),
        }
    }

    /// Inbound peer write bound for the coprocessor. The payload is staged
    /// in a host buffer and crosses by address (contiguous region) or by
    /// value (volatile). No path leaves an orphaned allocation behind.
    pub(crate) fn rx_passthrough_write(
        &self,
        table: &LinkTable,
        event: Event,
        volatile: bool,
    ) -> Result<()> {
        let chan = event.chan;
        let slot = &table.channels[chan as usize];
        let (_, timeout_ms) = self.coproc_params(slot, chan)?;

        let size = event.size as usize;
        let region = if volatile {
            MemoryRegion::Normal
        } else {
            MemoryRegion::Contiguous
        };
        let mut buffer =
            self.allocator
                .allocate(event.device.device_id, size, PACKET_ALIGNMENT, region)?;
        if let Err(err) = self.fill_from_wire(&event, &mut buffer, timeout_ms) {
            let (data, phys, region, alignment) = buffer.freeze();
            self.allocator.deallocate(data, phys, alignment, region);
            return Err(err);
        }

        let (data, phys, region, alignment) = buffer.freeze();
        if volatile {
            let result = self.coproc_write_bytes(chan, event.device.device_id, &data);
            self.allocator.deallocate(data, phys, alignment, region);
            result
        } else {
            self.remote_allocs.register(RemoteAlloc {
                data: data.clone(),
                phys,
                region,
                alignment,
            });
            match self.coproc_write_addr(chan, event.device.device_id, phys) {
                Ok(()) => Ok(()),
                Err(err) => {
                    self.remote_allocs.take(phys);
                    self.allocator.deallocate(data, phys, alignment, region);
                    Err(err)
                }
            }
        }
    }

    /// Inbound peer read of the coprocessor's next buffer. The address the
    /// coprocessor hands back must match a buffer staged by an earlier
    /// passthrough write; its data is forwarded to the host peer.
    pub(crate) fn rx_passthrough_read(&self, table: &LinkTable, event: Event) -> Result<()> {
        let chan = event.chan;
        let slot = &table.channels[chan as usize];
        let phys = self.coproc_read_phys(slot, &event)?;
        let entry = self
            .remote_allocs
            .take(phys)
            .ok_or(MuxError::ProtocolError("coprocessor returned unknown buffer"))?;

        let forward = Event::new(
            event.link_id,
            EventKind::WriteReq,
            event.device,
            chan,
            entry.data.len() as u32,
        )
        .with_payload(entry.data.clone())
        .with_timeout_ms(event.timeout_ms);
        let result = self.sink.enqueue(Direction::Rx, forward);
        self.allocator
            .deallocate(entry.data, entry.phys, entry.alignment, entry.region);
        result
    }

    /// Inbound peer bounded-copy read from the coprocessor.
    pub(crate) fn rx_passthrough_read_to_buffer(
        &self,
        table: &LinkTable,
        event: Event,
    ) -> Result<()> {
        let chan = event.chan;
        let slot = &table.channels[chan as usize];
        let (mode, timeout_ms) = self.coproc_params(slot, chan)?;

        let data = self.coproc_read_bytes(chan, &event, mode, timeout_ms)?;
        let forward = Event::new(
            event.link_id,
            EventKind::WriteReq,
            event.device,
            chan,
            data.len() as u32,
        )
        .with_payload(data)
        .with_timeout_ms(event.timeout_ms);
        self.sink.enqueue(Direction::Rx, forward)
    }

    /// Mode and timeout of a channel whose coprocessor side must be open.
    fn coproc_params(&self, slot: &ChannelSlot, chan: u16) -> Result<(OpMode, u32)> {
        let guard = slot.state.lock().unwrap();
        if guard.coproc_status != ChannelStatus::Open {
            return Err(MuxError::ChannelNotOpen(chan));
        }
        Ok((guard.mode, guard.timeout_ms))
    }

    /// Hand a buffer to the coprocessor by translated physical address.
    fn coproc_write_addr(&self, chan: u16, device_id: u32, phys: u64) -> Result<()> {
        let device_addr = self.translator.to_device(phys);
        let bytes = device_addr.to_le_bytes();
        let ctx = IpcContext::new(chan);
        let written = self
            .transport
            .write(Interface::Ipc, device_id, &bytes, None, Some(&ctx))
            .map_err(MuxError::from)?;
        if written != ADDR_SIZE {
            return Err(MuxError::TransportFailure(TransportError::ShortTransfer {
                requested: ADDR_SIZE,
                transferred: written,
            }));
        }
        Ok(())
    }

    /// Hand a payload to the coprocessor by value.
    fn coproc_write_bytes(&self, chan: u16, device_id: u32, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_BUF_SIZE {
            return Err(MuxError::ProtocolError("volatile payload exceeds maximum"));
        }
        let ctx = IpcContext::volatile(chan);
        let written = self
            .transport
            .write(Interface::Ipc, device_id, payload, None, Some(&ctx))
            .map_err(MuxError::from)?;
        if written != payload.len() {
            return Err(MuxError::TransportFailure(TransportError::ShortTransfer {
                requested: payload.len(),
                transferred: written,
            }));
        }
        Ok(())
    }

    /// Receive the coprocessor's next buffer address, translated back to a
    /// host physical address.
    fn coproc_read_phys(&self, slot: &ChannelSlot, event: &Event) -> Result<u64> {
        let (mode, timeout_ms) = self.coproc_params(slot, event.chan)?;
        let timeout = if mode.rx_blocking() {
            None
        } else {
            timeout_duration(timeout_ms)
        };
        let ctx = IpcContext::new(event.chan);
        let mut addr = [0u8; ADDR_SIZE];
        let n = self
            .transport
            .read(Interface::Ipc, event.device.device_id, &mut addr, timeout, Some(&ctx))
            .map_err(MuxError::from)?;
        if n != ADDR_SIZE {
            return Err(MuxError::TransportFailure(TransportError::ShortTransfer {
                requested: ADDR_SIZE,
                transferred: n,
            }));
        }
        Ok(self.translator.to_host(u64::from_le_bytes(addr)))
    }

    /// Receive a bounded-copy payload from the coprocessor by value.
    fn coproc_read_bytes(
        &self,
        chan: u16,
        event: &Event,
        mode: OpMode,
        timeout_ms: u32,
    ) -> Result<Bytes> {
        let timeout = if mode.rx_blocking() {
            None
        } else {
            timeout_duration(timeout_ms)
        };
        let ctx = IpcContext::volatile(chan);
        let mut buf = vec![0u8; MAX_BUF_SIZE];
        let n = self
            .transport
            .read(Interface::Ipc, event.device.device_id, &mut buf, timeout, Some(&ctx))
            .map_err(MuxError::from)?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    /// Stage an inbound payload from the host-side wire into a buffer.
    fn fill_from_wire(&self, event: &Event, buffer: &mut DmaBuffer, timeout_ms: u32) -> Result<()> {
        let size = event.size as usize;
        if let Some(payload) = event.payload.as_ref() {
            buffer.fill_from(payload);
            return Ok(());
        }
        let interface = event
            .device
            .interface()
            .ok_or(MuxError::ProtocolError("device with unknown interface"))?;
        let transferred = self
            .transport
            .read(
                interface,
                event.device.device_id,
                buffer.as_mut_slice(),
                timeout_duration(timeout_ms),
                None,
            )
            .map_err(MuxError::from)?;
        if transferred != size {
            return Err(MuxError::TransportFailure(TransportError::ShortTransfer {
                requested: size,
                transferred,
            }));
        }
        Ok(())
    }
}
