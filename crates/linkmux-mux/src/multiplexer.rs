//! The channel multiplexer core.
//!
//! [`Multiplexer::tx`] processes outbound requests from caller threads:
//! channel lifecycle, flow control and blocking semantics. [`Multiplexer::rx`]
//! processes inbound events delivered by the dispatch thread: buffering,
//! signaling and completions. Both engines consume their event; whatever is
//! not handed to the dispatcher sink is disposed of here.

use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use linkmux_transport::{
    AddressTranslator, BufferAllocator, DeviceHandle, DmaBuffer, Interface, MemoryRegion, Transport,
    TransportError,
};

use crate::channel::{Channel, ChannelStatus, OpMode, OpenChannel};
use crate::config::{
    CONTROL_CHANNEL_SIZE, CONTROL_CHANNEL_TIMEOUT_MS, COPROC_CONTROL_CHANNEL, IPC_CHANNEL_LIMIT,
    MAX_CONTROL_DATA_SIZE, MAX_DATA_SIZE, MAX_LINKS, NUM_CHANNELS, OPEN_CHANNEL_TIMEOUT,
    PACKET_ALIGNMENT, REMOTE_CONTROL_CHANNEL,
};
use crate::error::{MuxError, Result};
use crate::event::{Direction, Event, EventKind, EventSink};
use crate::notifier::{CallbackTarget, ChannelNotice, Notifier, NoticeKind};
use crate::packet::Packet;
use crate::remote_alloc::RemoteAllocRegistry;
use crate::signal::deadline_after_ms;
use crate::table;

/// Data handed back by a read operation.
///
/// `phys` identifies the buffer for a later address-matched release; it is
/// absent for bounded-copy reads that do not transfer buffer ownership.
#[derive(Debug, Clone)]
pub struct ReadPayload {
    pub data: Bytes,
    pub phys: Option<u64>,
}

/// Result of one TX engine invocation.
#[derive(Debug)]
pub enum TxReply {
    Done,
    Read(ReadPayload),
}

pub(crate) struct ChannelSlot {
    pub(crate) state: Mutex<Channel>,
}

pub(crate) struct LinkTable {
    pub(crate) device: DeviceHandle,
    pub(crate) channels: Vec<ChannelSlot>,
}

impl LinkTable {
    fn new(device: DeviceHandle) -> Self {
        let channels = (0..NUM_CHANNELS)
            .map(|_| ChannelSlot {
                state: Mutex::new(Channel::new()),
            })
            .collect();
        Self { device, channels }
    }
}

/// Channel multiplexer over all active links.
pub struct Multiplexer {
    links: Vec<RwLock<Option<Arc<LinkTable>>>>,
    pub(crate) allocator: Arc<dyn BufferAllocator>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) translator: Arc<dyn AddressTranslator>,
    pub(crate) sink: Arc<dyn EventSink>,
    pub(crate) remote_allocs: RemoteAllocRegistry,
    notifier: Notifier,
}

pub(crate) fn timeout_duration(timeout_ms: u32) -> Option<Duration> {
    if timeout_ms == 0 {
        None
    } else {
        Some(Duration::from_millis(u64::from(timeout_ms)))
    }
}

impl Multiplexer {
    pub fn new(
        allocator: Arc<dyn BufferAllocator>,
        transport: Arc<dyn Transport>,
        translator: Arc<dyn AddressTranslator>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let links = (0..MAX_LINKS).map(|_| RwLock::new(None)).collect();
        Self {
            links,
            allocator,
            transport,
            translator,
            sink,
            remote_allocs: RemoteAllocRegistry::new(),
            notifier: Notifier::spawn(),
        }
    }

    /// Bring up the channel table for a link and open its control channels.
    pub fn connect(&self, link_id: u32, device: DeviceHandle) -> Result<()> {
        let slot = self
            .links
            .get(link_id as usize)
            .ok_or(MuxError::LinkDown(link_id))?;
        let mut guard = slot.write().unwrap();
        if guard.is_some() {
            return Ok(());
        }
        let table = Arc::new(LinkTable::new(device));
        for ctrl in [REMOTE_CONTROL_CHANNEL, COPROC_CONTROL_CHANNEL] {
            let mut chan = table.channels[ctrl as usize].state.lock().unwrap();
            chan.size = CONTROL_CHANNEL_SIZE;
            chan.timeout_ms = CONTROL_CHANNEL_TIMEOUT_MS;
            chan.mode = OpMode::RxBlockTxBlock;
            chan.open = Some(OpenChannel::new());
            chan.status = ChannelStatus::Open;
        }
        *guard = Some(table);
        tracing::info!(link_id, device_id = device.device_id, "link connected");
        Ok(())
    }

    /// Tear down every channel on a link and drop its table.
    pub fn disconnect(&self, link_id: u32) -> Result<()> {
        let slot = self
            .links
            .get(link_id as usize)
            .ok_or(MuxError::LinkDown(link_id))?;
        let table = slot.write().unwrap().take().ok_or(MuxError::LinkDown(link_id))?;
        for channel in &table.channels {
            let mut guard = channel.state.lock().unwrap();
            self.teardown_locked(&mut guard);
        }
        tracing::info!(link_id, "link disconnected");
        Ok(())
    }

    pub(crate) fn link_table(&self, link_id: u32) -> Result<Arc<LinkTable>> {
        self.links
            .get(link_id as usize)
            .and_then(|slot| slot.read().unwrap().clone())
            .ok_or(MuxError::LinkDown(link_id))
    }

    pub(crate) fn dealloc_packet(&self, packet: Packet) {
        self.allocator
            .deallocate(packet.data, packet.phys, packet.alignment, packet.region);
    }

    fn dealloc_buffer(&self, buffer: DmaBuffer) {
        let (data, phys, region, alignment) = buffer.freeze();
        self.allocator.deallocate(data, phys, alignment, region);
    }

    /// Discard the open-channel context, freeing every buffered packet and
    /// aborting every blocked waiter. Caller holds the slot lock.
    fn teardown_locked(&self, chan_state: &mut Channel) {
        if let Some(mut open) = chan_state.open.take() {
            open.interrupt_waiters();
            for packet in open.rx_queue.drain_all() {
                self.dealloc_packet(packet);
            }
            for packet in open.tx_queue.drain_all() {
                self.dealloc_packet(packet);
            }
        }
        chan_state.status = ChannelStatus::Closed;
    }

    /// Register the data-ready callback for a channel.
    pub fn register_ready_callback(
        &self,
        link_id: u32,
        chan: u16,
        target: CallbackTarget,
    ) -> Result<()> {
        self.with_open(link_id, chan, |open| {
            open.ready_callback = Some(target);
            tracing::info!(link_id, chan, "data-ready callback registered");
            Ok(())
        })
    }

    /// Register the data-consumed callback for a channel.
    pub fn register_consumed_callback(
        &self,
        link_id: u32,
        chan: u16,
        target: CallbackTarget,
    ) -> Result<()> {
        self.with_open(link_id, chan, |open| {
            open.consumed_callback = Some(target);
            tracing::info!(link_id, chan, "data-consumed callback registered");
            Ok(())
        })
    }

    fn with_open<R>(
        &self,
        link_id: u32,
        chan: u16,
        f: impl FnOnce(&mut OpenChannel) -> Result<R>,
    ) -> Result<R> {
        if chan >= NUM_CHANNELS {
            return Err(MuxError::InvalidChannel(chan));
        }
        let table = self.link_table(link_id)?;
        let mut guard = table.channels[chan as usize].state.lock().unwrap();
        let open = guard.open.as_mut().ok_or(MuxError::ChannelNotOpen(chan))?;
        f(open)
    }

    /*
     * TX engine
     */

    /// Process one outbound request.
    pub fn tx(&self, event: Event) -> Result<TxReply> {
        let chan = event.chan;
        if chan >= NUM_CHANNELS {
            return Err(MuxError::InvalidChannel(chan));
        }
        if !table::channel_for_device(chan, &event.device) {
            return Err(MuxError::InvalidChannel(chan));
        }
        if table::is_control_channel(chan) {
            return Err(MuxError::InvalidChannel(chan));
        }
        // callers attached directly to the coprocessor bypass the dispatcher
        if chan < IPC_CHANNEL_LIMIT && event.device.interface() == Some(Interface::Ipc) {
            return self.passthrough(event);
        }
        let table = self.link_table(event.link_id)?;
        match event.kind {
            EventKind::WriteReq | EventKind::WriteVolatileReq | EventKind::WriteControlReq => {
                self.tx_write(&table, event)
            }
            EventKind::ReadReq | EventKind::ReadToBufferReq => self.tx_read(&table, event),
            EventKind::ReleaseReq => self.tx_release(&table, event),
            EventKind::OpenChannelReq => self.tx_open(&table, event),
            EventKind::CloseChannelReq => self.tx_close(&table, event),
            EventKind::PingReq => {
                self.sink.enqueue(Direction::Tx, event)?;
                Ok(TxReply::Done)
            }
            _ => Err(MuxError::ProtocolError("unexpected event kind on the tx path")),
        }
    }

    fn tx_write(&self, table: &LinkTable, event: Event) -> Result<TxReply> {
        let chan = event.chan;
        let size = event.size as usize;
        // size limits apply before any allocation or state change
        let limit = match event.kind {
            EventKind::WriteControlReq => MAX_CONTROL_DATA_SIZE,
            _ => MAX_DATA_SIZE,
        };
        if size > limit {
            return Err(MuxError::ProtocolError("payload exceeds maximum size"));
        }

        let slot = &table.channels[chan as usize];
        let mut guard = slot.state.lock().unwrap();
        if guard.status != ChannelStatus::Open {
            return Err(MuxError::ChannelNotOpen(chan));
        }
        let capacity = guard.size;
        let timeout_ms = guard.timeout_ms;
        let mode = guard.mode;
        // one absolute deadline for the whole backpressure loop: retries
        // never extend the configured blocking time
        let deadline = deadline_after_ms(timeout_ms);
        loop {
            let open = guard.open.as_mut().ok_or(MuxError::ChannelNotOpen(chan))?;
            if open.admit(event.size, capacity) {
                break;
            }
            if !mode.tx_blocking() {
                return Err(MuxError::ChannelFull(chan));
            }
            let released = open.released.clone();
            drop(guard);
            released.wait_deadline(deadline)?;
            guard = slot.state.lock().unwrap();
            if guard.status != ChannelStatus::Open {
                return Err(MuxError::ChannelNotOpen(chan));
            }
        }
        let open = guard.open.as_mut().ok_or(MuxError::ChannelNotOpen(chan))?;
        open.tx_fill = open.tx_fill.saturating_add(event.size);
        open.tx_packets += 1;
        let consumed = open.consumed.clone();
        drop(guard);

        let mut event = event;
        event.timeout_ms = timeout_ms;
        if table::is_passthrough(chan) {
            event.kind = match event.kind {
                EventKind::WriteReq => EventKind::PassthroughWriteReq,
                _ => EventKind::PassthroughVolatileWriteReq,
            };
            self.sink.enqueue(Direction::Tx, event)?;
        } else {
            let blocking = mode.tx_blocking();
            self.sink.enqueue(Direction::Tx, event)?;
            if blocking {
                // second phase: wait for the peer to consume the data
                consumed.wait_deadline(deadline_after_ms(timeout_ms))?;
            }
        }
        Ok(TxReply::Done)
    }

    fn tx_read(&self, table: &LinkTable, event: Event) -> Result<TxReply> {
        let chan = event.chan;
        let slot = &table.channels[chan as usize];
        let mut guard = slot.state.lock().unwrap();
        if guard.status != ChannelStatus::Open {
            return Err(MuxError::ChannelNotOpen(chan));
        }
        let timeout_ms = guard.timeout_ms;
        let mode = guard.mode;

        if table::is_passthrough(chan) {
            // ask the coprocessor side for its next buffer
            let mirror_kind = match event.kind {
                EventKind::ReadReq => EventKind::PassthroughReadReq,
                _ => EventKind::PassthroughReadToBufferReq,
            };
            let mirror = Event::new(event.link_id, mirror_kind, event.device, chan, 0)
                .with_timeout_ms(timeout_ms);
            self.sink.enqueue(Direction::Tx, mirror)?;
        }

        let deadline = deadline_after_ms(timeout_ms);
        if mode.rx_blocking() {
            let available = guard
                .open
                .as_ref()
                .ok_or(MuxError::ChannelNotOpen(chan))?
                .available
                .clone();
            drop(guard);
            available.wait_deadline(deadline)?;
            guard = slot.state.lock().unwrap();
            if guard.status != ChannelStatus::Open {
                return Err(MuxError::ChannelNotOpen(chan));
            }
        }
        let copy = event.kind == EventKind::ReadToBufferReq;
        let open = guard.open.as_mut().ok_or(MuxError::ChannelNotOpen(chan))?;
        let mut payload = match open.rx_queue.claim_front() {
            Some(packet) => ReadPayload {
                data: packet.data.clone(),
                phys: Some(packet.phys),
            },
            None => return Err(MuxError::ChannelFull(chan)),
        };
        let len = payload.data.len() as u32;
        if copy && table::is_passthrough(chan) {
            // bounded-copy reads on the passthrough path release immediately
            if let Some(packet) = open.rx_queue.release(payload.phys) {
                open.rx_fill = open.rx_fill.saturating_sub(packet.len() as u32);
                self.dealloc_packet(packet);
            }
            payload.phys = None;
        }
        drop(guard);

        // notify the peer its data was consumed
        let mut event = event;
        event.size = len;
        event.timeout_ms = timeout_ms;
        self.sink.enqueue(Direction::Tx, event)?;
        Ok(TxReply::Read(payload))
    }

    fn tx_release(&self, table: &LinkTable, event: Event) -> Result<TxReply> {
        let chan = event.chan;
        let slot = &table.channels[chan as usize];
        let mut guard = slot.state.lock().unwrap();
        let open = guard.open.as_mut().ok_or(MuxError::ChannelNotOpen(chan))?;
        let packet = open
            .rx_queue
            .release(event.phys)
            .ok_or(MuxError::ProtocolError("no matching packet to release"))?;
        let len = packet.len() as u32;
        open.rx_fill = open.rx_fill.saturating_sub(len);
        self.dealloc_packet(packet);
        drop(guard);

        // the peer replenishes its tx credit on receipt
        let mut event = event;
        event.size = len;
        self.sink.enqueue(Direction::Tx, event)?;
        Ok(TxReply::Done)
    }

    fn tx_open(&self, table: &LinkTable, event: Event) -> Result<TxReply> {
        let chan = event.chan;
        let slot = &table.channels[chan as usize];
        let mut guard = slot.state.lock().unwrap();
        match guard.status {
            ChannelStatus::Closed => {
                guard.size = event.size;
                guard.timeout_ms = event.timeout_ms;
                guard.mode = event.mode.unwrap_or(OpMode::RxBlockTxBlock);
                let open = OpenChannel::new();
                let opened = open.opened.clone();
                guard.open = Some(open);
                guard.status = ChannelStatus::PendingLocal;
                drop(guard);

                if let Err(err) = self.sink.enqueue(Direction::Tx, event) {
                    let mut guard = slot.state.lock().unwrap();
                    self.teardown_locked(&mut guard);
                    return Err(err);
                }
                match opened.wait_deadline(Some(Instant::now() + OPEN_CHANNEL_TIMEOUT)) {
                    Ok(()) => {
                        let mut guard = slot.state.lock().unwrap();
                        if guard.status == ChannelStatus::PendingLocal {
                            guard.status = ChannelStatus::Open;
                        }
                        Ok(TxReply::Done)
                    }
                    Err(wait) => {
                        // peer never acknowledged: tear the channel back down
                        let mut guard = slot.state.lock().unwrap();
                        self.teardown_locked(&mut guard);
                        Err(wait.into())
                    }
                }
            }
            ChannelStatus::PendingPeer => {
                // the peer opened first; this open completes the handshake
                guard.size = event.size;
                guard.timeout_ms = event.timeout_ms;
                guard.mode = event.mode.unwrap_or(OpMode::RxBlockTxBlock);
                guard.status = ChannelStatus::Open;
                Ok(TxReply::Done)
            }
            ChannelStatus::Open | ChannelStatus::PendingLocal => Err(MuxError::AlreadyOpen(chan)),
        }
    }

    fn tx_close(&self, table: &LinkTable, event: Event) -> Result<TxReply> {
        let chan = event.chan;
        let slot = &table.channels[chan as usize];
        let mut guard = slot.state.lock().unwrap();
        if guard.status != ChannelStatus::Open {
            return Err(MuxError::ChannelNotOpen(chan));
        }
        self.teardown_locked(&mut guard);
        if table::is_passthrough(chan) && guard.coproc_status == ChannelStatus::Open {
            self.transport
                .close_channel(Interface::Ipc, event.device.device_id, chan)
                .map_err(MuxError::from)?;
            guard.coproc_status = ChannelStatus::Closed;
        }
        drop(guard);
        self.sink.enqueue(Direction::Tx, event)?;
        Ok(TxReply::Done)
    }

    /*
     * RX engine
     */

    /// Process one inbound event or completion.
    pub fn rx(&self, event: Event) -> Result<()> {
        let chan = event.chan;
        if chan >= NUM_CHANNELS {
            return Err(MuxError::InvalidChannel(chan));
        }
        let table = self.link_table(event.link_id)?;
        match event.kind {
            EventKind::WriteReq | EventKind::WriteVolatileReq => {
                self.rx_write(&table, event, false)
            }
            EventKind::WriteControlReq => self.rx_write(&table, event, true),
            EventKind::ReadReq | EventKind::ReadToBufferReq => self.rx_consumed(&table, event),
            EventKind::ReleaseReq => self.rx_release(&table, event),
            EventKind::OpenChannelReq => self.rx_open(&table, event),
            EventKind::CloseChannelReq => self.rx_close(&table, event),
            EventKind::PingReq => {
                let mut event = event;
                event.kind = EventKind::PingResp;
                self.sink.enqueue(Direction::Rx, event)
            }
            EventKind::OpenChannelResp => {
                let mut guard = table.channels[chan as usize].state.lock().unwrap();
                let open = guard.open.as_mut().ok_or(MuxError::ChannelNotOpen(chan))?;
                open.opened.notify();
                Ok(())
            }
            EventKind::PassthroughWriteReq => self.rx_passthrough_write(&table, event, false),
            EventKind::PassthroughVolatileWriteReq => {
                self.rx_passthrough_write(&table, event, true)
            }
            EventKind::PassthroughReadReq => self.rx_passthrough_read(&table, event),
            EventKind::PassthroughReadToBufferReq => {
                self.rx_passthrough_read_to_buffer(&table, event)
            }
            // completions are fully processed by being consumed here
            EventKind::WriteResp
            | EventKind::WriteVolatileResp
            | EventKind::WriteControlResp
            | EventKind::ReadResp
            | EventKind::ReadToBufferResp
            | EventKind::ReleaseResp
            | EventKind::CloseChannelResp
            | EventKind::PingResp => Ok(()),
        }
    }

    fn rx_write(&self, table: &LinkTable, event: Event, embedded: bool) -> Result<()> {
        let chan = event.chan;
        let link_id = event.link_id;
        let size = event.size as usize;
        let slot = &table.channels[chan as usize];
        let mut guard = slot.state.lock().unwrap();
        let status = guard.status;
        let mode = guard.mode;
        let timeout_ms = guard.timeout_ms;
        if guard.open.is_none() {
            return Err(MuxError::ChannelNotOpen(chan));
        }

        // the embedded payload is validated before anything is allocated
        let embedded_payload = if embedded {
            Some(
                event
                    .payload
                    .clone()
                    .ok_or(MuxError::ProtocolError("control write without payload"))?,
            )
        } else {
            None
        };
        let mut buffer =
            self.allocator
                .allocate(event.device.device_id, size, PACKET_ALIGNMENT, MemoryRegion::Normal)?;
        if let Some(payload) = &embedded_payload {
            buffer.fill_from(payload);
        } else {
            let interface = event
                .device
                .interface()
                .ok_or(MuxError::ProtocolError("device with unknown interface"))?;
            let transferred = match self.transport.read(
                interface,
                event.device.device_id,
                buffer.as_mut_slice(),
                timeout_duration(timeout_ms),
                None,
            ) {
                Ok(n) => n,
                Err(err) => {
                    self.dealloc_buffer(buffer);
                    return Err(err.into());
                }
            };
            if transferred != size {
                self.dealloc_buffer(buffer);
                return Err(MuxError::TransportFailure(TransportError::ShortTransfer {
                    requested: size,
                    transferred,
                }));
            }
        }

        let open = guard.open.as_mut().ok_or(MuxError::ChannelNotOpen(chan))?;
        let packet = Packet::from_buffer(buffer);
        if let Err(packet) = open.rx_queue.push(packet) {
            self.dealloc_packet(packet);
            return Err(MuxError::ChannelFull(chan));
        }
        open.rx_fill = open.rx_fill.saturating_add(size as u32);
        let available = open.available.clone();
        let callback = if status == ChannelStatus::Open && !mode.rx_blocking() {
            open.ready_callback.clone()
        } else {
            None
        };
        drop(guard);

        available.notify();
        let mut event = event;
        event.kind = match event.kind {
            EventKind::WriteVolatileReq => EventKind::WriteVolatileResp,
            EventKind::WriteControlReq => EventKind::WriteControlResp,
            _ => EventKind::WriteResp,
        };
        event.payload = None;
        self.sink.enqueue(Direction::Rx, event)?;

        if let Some(target) = callback {
            self.notifier.deliver(
                target,
                ChannelNotice {
                    link_id,
                    chan,
                    kind: NoticeKind::DataReady,
                },
            );
        }
        Ok(())
    }

    fn rx_consumed(&self, table: &LinkTable, event: Event) -> Result<()> {
        let chan = event.chan;
        let link_id = event.link_id;
        let slot = &table.channels[chan as usize];
        let mut guard = slot.state.lock().unwrap();
        let status = guard.status;
        let mode = guard.mode;
        let open = guard.open.as_mut().ok_or(MuxError::ChannelNotOpen(chan))?;
        let consumed = open.consumed.clone();
        let callback = if status == ChannelStatus::Open && !mode.tx_blocking() {
            open.consumed_callback.clone()
        } else {
            None
        };
        drop(guard);

        consumed.notify();
        let mut event = event;
        event.kind = EventKind::ReadToBufferResp;
        self.sink.enqueue(Direction::Rx, event)?;

        if let Some(target) = callback {
            self.notifier.deliver(
                target,
                ChannelNotice {
                    link_id,
                    chan,
                    kind: NoticeKind::DataConsumed,
                },
            );
        }
        Ok(())
    }

    fn rx_release(&self, table: &LinkTable, event: Event) -> Result<()> {
        let chan = event.chan;
        let slot = &table.channels[chan as usize];
        let mut guard = slot.state.lock().unwrap();
        let open = guard.open.as_mut().ok_or(MuxError::ChannelNotOpen(chan))?;
        open.tx_fill = open.tx_fill.saturating_sub(event.size);
        open.tx_packets = open.tx_packets.saturating_sub(1);
        let released = open.released.clone();
        drop(guard);

        released.notify();
        let mut event = event;
        event.kind = EventKind::ReleaseResp;
        self.sink.enqueue(Direction::Rx, event)
    }

    fn rx_open(&self, table: &LinkTable, event: Event) -> Result<()> {
        let chan = event.chan;
        let slot = &table.channels[chan as usize];
        let mut guard = slot.state.lock().unwrap();
        match guard.status {
            ChannelStatus::Closed => {
                guard.size = event.size;
                guard.timeout_ms = event.timeout_ms;
                if let Some(mode) = event.mode {
                    guard.mode = mode;
                }
                let open = OpenChannel::new();
                let opened = open.opened.clone();
                guard.open = Some(open);
                guard.status = ChannelStatus::PendingPeer;
                opened.notify();
            }
            ChannelStatus::PendingLocal => {
                // our own open raced the peer's: the second arrival wins
                guard.status = ChannelStatus::Open;
                if let Some(open) = &guard.open {
                    open.opened.notify();
                }
            }
            ChannelStatus::Open | ChannelStatus::PendingPeer => {
                tracing::debug!(chan, "open request for already open channel");
            }
        }
        drop(guard);

        let ack = Event::new(event.link_id, EventKind::OpenChannelResp, event.device, chan, 0);
        self.sink.enqueue(Direction::Rx, ack)?;

        // bring up the coprocessor side of passthrough channels
        if table::is_passthrough(chan) && chan < IPC_CHANNEL_LIMIT {
            let mut guard = slot.state.lock().unwrap();
            if guard.coproc_status == ChannelStatus::Closed {
                self.transport
                    .open_channel(Interface::Ipc, event.device.device_id, chan)
                    .map_err(MuxError::from)?;
                guard.coproc_status = ChannelStatus::Open;
            }
        }
        Ok(())
    }

    fn rx_close(&self, table: &LinkTable, event: Event) -> Result<()> {
        let chan = event.chan;
        let slot = &table.channels[chan as usize];
        let mut guard = slot.state.lock().unwrap();
        if guard.status == ChannelStatus::Closed {
            tracing::debug!(chan, "close request for closed channel");
            return Ok(());
        }
        self.teardown_locked(&mut guard);
        if table::is_passthrough(chan) && guard.coproc_status == ChannelStatus::Open {
            self.transport
                .close_channel(Interface::Ipc, event.device.device_id, chan)
                .map_err(MuxError::from)?;
            guard.coproc_status = ChannelStatus::Closed;
        }
        drop(guard);
        let mut event = event;
        event.kind = EventKind::CloseChannelResp;
        self.sink.enqueue(Direction::Rx, event)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::thread;

    use linkmux_transport::interface::device_id_for;
    use linkmux_transport::{DeviceKind, HeapAllocator, Loopback, OffsetTranslator};

    use super::*;

    struct CapturingSink {
        events: Mutex<Vec<(Direction, Event)>>,
    }

    impl CapturingSink {
        fn new() -> Self {
            Self {
                events: Mutex::new(Vec::new()),
            }
        }

        fn take(&self) -> Vec<(Direction, Event)> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }
    }

    impl EventSink for CapturingSink {
        fn enqueue(&self, direction: Direction, event: Event) -> Result<()> {
            self.events.lock().unwrap().push((direction, event));
            Ok(())
        }
    }

    struct Fixture {
        mux: Arc<Multiplexer>,
        sink: Arc<CapturingSink>,
        transport: Arc<Loopback>,
        allocator: Arc<HeapAllocator>,
    }

    fn fixture() -> Fixture {
        let sink = Arc::new(CapturingSink::new());
        let transport = Arc::new(Loopback::new());
        let allocator = Arc::new(HeapAllocator::new());
        let mux = Arc::new(Multiplexer::new(
            allocator.clone(),
            transport.clone(),
            Arc::new(OffsetTranslator::new(0x8000_0000)),
            sink.clone(),
        ));
        mux.connect(0, pcie_dev()).unwrap();
        Fixture {
            mux,
            sink,
            transport,
            allocator,
        }
    }

    fn pcie_dev() -> DeviceHandle {
        DeviceHandle::new(device_id_for(Interface::Pcie, 1), DeviceKind::Remote)
    }

    fn coproc_dev() -> DeviceHandle {
        DeviceHandle::new(device_id_for(Interface::Ipc, 0), DeviceKind::Coprocessor)
    }

    fn open_event(chan: u16, size: u32, timeout_ms: u32, mode: OpMode) -> Event {
        Event::new(0, EventKind::OpenChannelReq, pcie_dev(), chan, size)
            .with_timeout_ms(timeout_ms)
            .with_mode(mode)
    }

    /// Peer open first, then local open: deterministic and non-blocking.
    fn open(f: &Fixture, chan: u16, size: u32, timeout_ms: u32, mode: OpMode) {
        f.mux.rx(open_event(chan, size, timeout_ms, mode)).unwrap();
        f.mux.tx(open_event(chan, size, timeout_ms, mode)).unwrap();
        f.sink.take();
    }

    fn status_of(f: &Fixture, chan: u16) -> ChannelStatus {
        f.mux.link_table(0).unwrap().channels[chan as usize]
            .state
            .lock()
            .unwrap()
            .status
    }

    const CHAN: u16 = 0x500; // plain remote channel, no coprocessor side
    const PT_CHAN: u16 = 0x00B; // passthrough channel

    #[test]
    fn control_channels_open_on_connect() {
        let f = fixture();
        assert_eq!(status_of(&f, REMOTE_CONTROL_CHANNEL), ChannelStatus::Open);
        assert_eq!(status_of(&f, COPROC_CONTROL_CHANNEL), ChannelStatus::Open);
        assert_eq!(status_of(&f, CHAN), ChannelStatus::Closed);
    }

    #[test]
    fn open_completes_when_peer_acknowledges() {
        let f = fixture();
        let mux = Arc::clone(&f.mux);
        let opener = thread::spawn(move || {
            mux.tx(open_event(CHAN, 1000, 0, OpMode::RxBlockTxBlock))
        });
        thread::sleep(Duration::from_millis(30));
        assert_eq!(status_of(&f, CHAN), ChannelStatus::PendingLocal);

        f.mux
            .rx(open_event(CHAN, 1000, 0, OpMode::RxBlockTxBlock))
            .unwrap();
        assert!(matches!(opener.join().unwrap().unwrap(), TxReply::Done));
        assert_eq!(status_of(&f, CHAN), ChannelStatus::Open);

        let kinds: Vec<EventKind> = f.sink.take().iter().map(|(_, e)| e.kind).collect();
        assert!(kinds.contains(&EventKind::OpenChannelReq));
        assert!(kinds.contains(&EventKind::OpenChannelResp));
    }

    #[test]
    fn open_after_peer_open_succeeds_immediately() {
        let f = fixture();
        f.mux
            .rx(open_event(CHAN, 1000, 0, OpMode::RxBlockTxBlock))
            .unwrap();
        assert_eq!(status_of(&f, CHAN), ChannelStatus::PendingPeer);

        let start = Instant::now();
        f.mux
            .tx(open_event(CHAN, 1000, 0, OpMode::RxBlockTxBlock))
            .unwrap();
        assert!(start.elapsed() < Duration::from_millis(100));
        assert_eq!(status_of(&f, CHAN), ChannelStatus::Open);
    }

    #[test]
    fn second_local_open_is_rejected() {
        let f = fixture();
        open(&f, CHAN, 1000, 0, OpMode::RxBlockTxBlock);
        let err = f
            .mux
            .tx(open_event(CHAN, 1000, 0, OpMode::RxBlockTxBlock))
            .unwrap_err();
        assert!(matches!(err, MuxError::AlreadyOpen(CHAN)));
    }

    #[test]
    fn concurrent_opens_converge_to_one_open_channel() {
        let f = fixture();
        let mux = Arc::clone(&f.mux);
        let local = thread::spawn(move || {
            mux.tx(open_event(CHAN, 1000, 0, OpMode::RxBlockTxBlock))
        });
        let mux = Arc::clone(&f.mux);
        let peer = thread::spawn(move || {
            mux.rx(open_event(CHAN, 1000, 0, OpMode::RxBlockTxBlock))
        });
        local.join().unwrap().unwrap();
        peer.join().unwrap().unwrap();
        assert_eq!(status_of(&f, CHAN), ChannelStatus::Open);
    }

    #[test]
    fn invalid_channel_ids_are_rejected() {
        let f = fixture();
        for chan in [NUM_CHANNELS, u16::MAX] {
            let err = f
                .mux
                .tx(Event::new(0, EventKind::WriteReq, pcie_dev(), chan, 4))
                .unwrap_err();
            assert!(matches!(err, MuxError::InvalidChannel(_)));
        }
        // reserved control channels are not directly usable
        let err = f
            .mux
            .tx(open_event(REMOTE_CONTROL_CHANNEL, 128, 0, OpMode::RxBlockTxBlock))
            .unwrap_err();
        assert!(matches!(err, MuxError::InvalidChannel(_)));
        // channel range does not route over this device's interface
        let err = f
            .mux
            .tx(Event::new(0, EventKind::WriteReq, pcie_dev(), 0x002, 4))
            .unwrap_err();
        assert!(matches!(err, MuxError::InvalidChannel(0x002)));
    }

    #[test]
    fn operations_on_unconnected_link_fail() {
        let f = fixture();
        let err = f
            .mux
            .tx(Event::new(3, EventKind::WriteReq, pcie_dev(), CHAN, 4))
            .unwrap_err();
        assert!(matches!(err, MuxError::LinkDown(3)));
        let err = f.mux.connect(MAX_LINKS as u32, pcie_dev()).unwrap_err();
        assert!(matches!(err, MuxError::LinkDown(_)));
    }

    #[test]
    fn write_rx_read_release_roundtrip() {
        let f = fixture();
        open(&f, CHAN, 1000, 0, OpMode::RxNonBlockTxNonBlock);

        let payload = Bytes::from_static(b"hello mux");
        f.mux
            .tx(Event::new(0, EventKind::WriteReq, pcie_dev(), CHAN, 0)
                .with_payload(payload.clone()))
            .unwrap();
        let sent = f.sink.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, Direction::Tx);
        assert_eq!(sent[0].1.kind, EventKind::WriteReq);

        // peer data arrives: bytes on the wire, then the event
        f.transport
            .write(Interface::Pcie, 0, &payload, None, None)
            .unwrap();
        f.mux
            .rx(Event::new(
                0,
                EventKind::WriteReq,
                pcie_dev(),
                CHAN,
                payload.len() as u32,
            ))
            .unwrap();
        assert_eq!(f.allocator.outstanding(), 1);

        let reply = f
            .mux
            .tx(Event::new(0, EventKind::ReadReq, pcie_dev(), CHAN, 0))
            .unwrap();
        let TxReply::Read(read) = reply else {
            panic!("read returned no data");
        };
        assert_eq!(read.data, payload);
        let phys = read.phys.unwrap();

        f.mux
            .tx(Event::new(0, EventKind::ReleaseReq, pcie_dev(), CHAN, 0).with_phys(phys))
            .unwrap();
        assert_eq!(f.allocator.outstanding(), 0);

        let kinds: Vec<EventKind> = f.sink.take().iter().map(|(_, e)| e.kind).collect();
        assert!(kinds.contains(&EventKind::WriteResp));
        assert!(kinds.contains(&EventKind::ReadReq));
        assert!(kinds.contains(&EventKind::ReleaseReq));
    }

    #[test]
    fn release_of_unknown_buffer_fails() {
        let f = fixture();
        open(&f, CHAN, 1000, 0, OpMode::RxNonBlockTxNonBlock);
        let err = f
            .mux
            .tx(Event::new(0, EventKind::ReleaseReq, pcie_dev(), CHAN, 0).with_phys(0xDEAD))
            .unwrap_err();
        assert!(matches!(err, MuxError::ProtocolError(_)));
    }

    #[test]
    fn blocking_read_times_out() {
        let f = fixture();
        open(&f, CHAN, 1000, 100, OpMode::RxBlockTxNonBlock);
        let start = Instant::now();
        let err = f
            .mux
            .tx(Event::new(0, EventKind::ReadReq, pcie_dev(), CHAN, 0))
            .unwrap_err();
        assert!(matches!(err, MuxError::Timeout));
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn blocking_read_wakes_when_data_arrives() {
        let f = fixture();
        open(&f, CHAN, 1000, 500, OpMode::RxBlockTxNonBlock);

        let mux = Arc::clone(&f.mux);
        let transport = Arc::clone(&f.transport);
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            transport.write(Interface::Pcie, 0, b"late", None, None).unwrap();
            mux.rx(Event::new(0, EventKind::WriteReq, pcie_dev(), CHAN, 4))
                .unwrap();
        });

        let reply = f
            .mux
            .tx(Event::new(0, EventKind::ReadReq, pcie_dev(), CHAN, 0))
            .unwrap();
        producer.join().unwrap();
        let TxReply::Read(read) = reply else {
            panic!("read returned no data");
        };
        assert_eq!(read.data.as_ref(), b"late");
    }

    #[test]
    fn nonblocking_write_hits_upper_threshold() {
        let f = fixture();
        open(&f, CHAN, 1000, 0, OpMode::RxNonBlockTxNonBlock);

        // 800 of 1000: admitted (threshold is 850)
        f.mux
            .tx(Event::new(0, EventKind::WriteReq, pcie_dev(), CHAN, 800))
            .unwrap();
        // 800 + 100 > 850: gated
        let err = f
            .mux
            .tx(Event::new(0, EventKind::WriteReq, pcie_dev(), CHAN, 100))
            .unwrap_err();
        assert!(matches!(err, MuxError::ChannelFull(CHAN)));

        // peer releases everything: fill drops below the lower threshold
        f.mux
            .rx(Event::new(0, EventKind::ReleaseReq, pcie_dev(), CHAN, 800))
            .unwrap();
        f.mux
            .tx(Event::new(0, EventKind::WriteReq, pcie_dev(), CHAN, 100))
            .unwrap();
    }

    #[test]
    fn blocked_writer_wakes_on_peer_release() {
        let f = fixture();
        open(&f, CHAN, 1000, 0, OpMode::RxNonBlockTxBlock);
        // the consumed signal counts, so peer reads may be credited up front
        f.mux
            .rx(Event::new(0, EventKind::ReadReq, pcie_dev(), CHAN, 800))
            .unwrap();
        f.mux
            .tx(Event::new(0, EventKind::WriteReq, pcie_dev(), CHAN, 800))
            .unwrap();

        let mux = Arc::clone(&f.mux);
        let writer = thread::spawn(move || {
            mux.tx(Event::new(0, EventKind::WriteReq, pcie_dev(), CHAN, 100))
        });
        thread::sleep(Duration::from_millis(50));
        f.mux
            .rx(Event::new(0, EventKind::ReadReq, pcie_dev(), CHAN, 100))
            .unwrap();
        f.mux
            .rx(Event::new(0, EventKind::ReleaseReq, pcie_dev(), CHAN, 800))
            .unwrap();
        assert!(matches!(writer.join().unwrap().unwrap(), TxReply::Done));
    }

    #[test]
    fn write_deadline_survives_useless_wakeups() {
        let f = fixture();
        open(&f, CHAN, 1000, 200, OpMode::RxNonBlockTxBlock);
        f.mux
            .rx(Event::new(0, EventKind::ReadReq, pcie_dev(), CHAN, 800))
            .unwrap();
        f.mux
            .tx(Event::new(0, EventKind::WriteReq, pcie_dev(), CHAN, 800))
            .unwrap();

        // zero-byte releases wake the writer without freeing credit
        let mux = Arc::clone(&f.mux);
        let noise = thread::spawn(move || {
            for _ in 0..10 {
                thread::sleep(Duration::from_millis(40));
                mux.rx(Event::new(0, EventKind::ReleaseReq, pcie_dev(), CHAN, 0))
                    .unwrap();
            }
        });

        let start = Instant::now();
        let err = f
            .mux
            .tx(Event::new(0, EventKind::WriteReq, pcie_dev(), CHAN, 100))
            .unwrap_err();
        let elapsed = start.elapsed();
        noise.join().unwrap();
        assert!(matches!(err, MuxError::Timeout));
        assert!(elapsed >= Duration::from_millis(200));
        // the deadline is absolute: wakeups must not restart the clock
        assert!(elapsed < Duration::from_millis(450));
    }

    #[test]
    fn oversized_writes_fail_before_allocation() {
        let f = fixture();
        open(&f, CHAN, 1000, 0, OpMode::RxNonBlockTxNonBlock);
        let err = f
            .mux
            .tx(Event::new(
                0,
                EventKind::WriteReq,
                pcie_dev(),
                CHAN,
                (MAX_DATA_SIZE + 1) as u32,
            ))
            .unwrap_err();
        assert!(matches!(err, MuxError::ProtocolError(_)));

        let err = f
            .mux
            .tx(Event::new(
                0,
                EventKind::WriteControlReq,
                pcie_dev(),
                CHAN,
                (MAX_CONTROL_DATA_SIZE + 1) as u32,
            ))
            .unwrap_err();
        assert!(matches!(err, MuxError::ProtocolError(_)));
        assert_eq!(f.allocator.outstanding(), 0);
    }

    #[test]
    fn rx_allocation_failure_is_reported() {
        let f = fixture();
        open(&f, CHAN, 1000, 0, OpMode::RxNonBlockTxNonBlock);
        f.allocator.fail_next();
        let err = f
            .mux
            .rx(Event::new(0, EventKind::WriteReq, pcie_dev(), CHAN, 4))
            .unwrap_err();
        assert!(matches!(err, MuxError::AllocationFailure { size: 4 }));
        assert_eq!(f.allocator.outstanding(), 0);
    }

    #[test]
    fn rx_write_on_closed_channel_is_rejected() {
        let f = fixture();
        let err = f
            .mux
            .rx(Event::new(0, EventKind::WriteReq, pcie_dev(), CHAN, 4))
            .unwrap_err();
        assert!(matches!(err, MuxError::ChannelNotOpen(CHAN)));
    }

    #[test]
    fn control_write_carries_payload_by_value() {
        let f = fixture();
        open(&f, CHAN, 1000, 0, OpMode::RxNonBlockTxNonBlock);
        let payload = Bytes::from_static(b"ctl");
        f.mux
            .rx(Event::new(0, EventKind::WriteControlReq, pcie_dev(), CHAN, 0)
                .with_payload(payload.clone()))
            .unwrap();

        let reply = f
            .mux
            .tx(Event::new(0, EventKind::ReadReq, pcie_dev(), CHAN, 0))
            .unwrap();
        let TxReply::Read(read) = reply else {
            panic!("read returned no data");
        };
        assert_eq!(read.data, payload);
    }

    #[test]
    fn control_write_without_payload_leaves_no_allocation() {
        let f = fixture();
        open(&f, CHAN, 1000, 0, OpMode::RxNonBlockTxNonBlock);
        let err = f
            .mux
            .rx(Event::new(0, EventKind::WriteControlReq, pcie_dev(), CHAN, 4))
            .unwrap_err();
        assert!(matches!(err, MuxError::ProtocolError(_)));
        assert_eq!(f.allocator.outstanding(), 0);
    }

    #[test]
    fn close_interrupts_blocked_reader() {
        let f = fixture();
        open(&f, CHAN, 1000, 0, OpMode::RxBlockTxNonBlock);

        let mux = Arc::clone(&f.mux);
        let reader = thread::spawn(move || {
            mux.tx(Event::new(0, EventKind::ReadReq, pcie_dev(), CHAN, 0))
        });
        thread::sleep(Duration::from_millis(50));
        f.mux
            .tx(Event::new(0, EventKind::CloseChannelReq, pcie_dev(), CHAN, 0))
            .unwrap();

        let err = reader.join().unwrap().unwrap_err();
        assert!(matches!(
            err,
            MuxError::Interrupted | MuxError::ChannelNotOpen(CHAN)
        ));
        assert_eq!(status_of(&f, CHAN), ChannelStatus::Closed);

        let err = f
            .mux
            .tx(Event::new(0, EventKind::WriteReq, pcie_dev(), CHAN, 4))
            .unwrap_err();
        assert!(matches!(err, MuxError::ChannelNotOpen(CHAN)));
    }

    #[test]
    fn peer_close_tears_the_channel_down() {
        let f = fixture();
        open(&f, CHAN, 1000, 0, OpMode::RxNonBlockTxNonBlock);
        f.transport
            .write(Interface::Pcie, 0, b"data", None, None)
            .unwrap();
        f.mux
            .rx(Event::new(0, EventKind::WriteReq, pcie_dev(), CHAN, 4))
            .unwrap();
        assert_eq!(f.allocator.outstanding(), 1);

        f.mux
            .rx(Event::new(0, EventKind::CloseChannelReq, pcie_dev(), CHAN, 0))
            .unwrap();
        assert_eq!(status_of(&f, CHAN), ChannelStatus::Closed);
        assert_eq!(f.allocator.outstanding(), 0);
    }

    #[test]
    fn disconnect_reclaims_buffered_data() {
        let f = fixture();
        open(&f, CHAN, 1000, 0, OpMode::RxNonBlockTxNonBlock);
        f.transport
            .write(Interface::Pcie, 0, b"data", None, None)
            .unwrap();
        f.mux
            .rx(Event::new(0, EventKind::WriteReq, pcie_dev(), CHAN, 4))
            .unwrap();
        assert_eq!(f.allocator.outstanding(), 1);

        f.mux.disconnect(0).unwrap();
        assert_eq!(f.allocator.outstanding(), 0);
        let err = f
            .mux
            .tx(Event::new(0, EventKind::WriteReq, pcie_dev(), CHAN, 4))
            .unwrap_err();
        assert!(matches!(err, MuxError::LinkDown(0)));
    }

    #[test]
    fn ping_flows_both_ways() {
        let f = fixture();
        f.mux
            .tx(Event::new(0, EventKind::PingReq, pcie_dev(), CHAN, 0))
            .unwrap();
        f.mux
            .rx(Event::new(0, EventKind::PingReq, pcie_dev(), CHAN, 0))
            .unwrap();
        let kinds: Vec<(Direction, EventKind)> =
            f.sink.take().iter().map(|(d, e)| (*d, e.kind)).collect();
        assert!(kinds.contains(&(Direction::Tx, EventKind::PingReq)));
        assert!(kinds.contains(&(Direction::Rx, EventKind::PingResp)));
    }

    #[test]
    fn ready_callback_fires_for_nonblocking_channel() {
        let f = fixture();
        open(&f, CHAN, 1000, 0, OpMode::RxNonBlockTxNonBlock);
        let (tx, rx) = mpsc::channel();
        f.mux
            .register_ready_callback(0, CHAN, CallbackTarget::Subscriber(tx))
            .unwrap();

        f.transport
            .write(Interface::Pcie, 0, b"data", None, None)
            .unwrap();
        f.mux
            .rx(Event::new(0, EventKind::WriteReq, pcie_dev(), CHAN, 4))
            .unwrap();

        let notice = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(notice.chan, CHAN);
        assert_eq!(notice.kind, NoticeKind::DataReady);
    }

    #[test]
    fn consumed_callback_fires_for_nonblocking_writer() {
        let f = fixture();
        open(&f, CHAN, 1000, 0, OpMode::RxNonBlockTxNonBlock);
        let (tx, rx) = mpsc::channel();
        f.mux
            .register_consumed_callback(0, CHAN, CallbackTarget::Subscriber(tx))
            .unwrap();

        f.mux
            .rx(Event::new(0, EventKind::ReadReq, pcie_dev(), CHAN, 4))
            .unwrap();
        let notice = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(notice.kind, NoticeKind::DataConsumed);
    }

    #[test]
    fn peer_consumption_wakes_blocking_writer() {
        let f = fixture();
        open(&f, CHAN, 1000, 0, OpMode::RxNonBlockTxBlock);

        let mux = Arc::clone(&f.mux);
        let writer = thread::spawn(move || {
            mux.tx(Event::new(0, EventKind::WriteReq, pcie_dev(), CHAN, 100))
        });
        thread::sleep(Duration::from_millis(50));
        // peer signals it consumed the data by issuing its read
        f.mux
            .rx(Event::new(0, EventKind::ReadReq, pcie_dev(), CHAN, 100))
            .unwrap();
        assert!(matches!(writer.join().unwrap().unwrap(), TxReply::Done));
    }

    /*
     * Passthrough
     */

    fn open_passthrough(f: &Fixture) {
        f.mux
            .rx(open_event(PT_CHAN, 1000, 100, OpMode::RxNonBlockTxNonBlock))
            .unwrap();
        f.mux
            .tx(open_event(PT_CHAN, 1000, 100, OpMode::RxNonBlockTxNonBlock))
            .unwrap();
        f.sink.take();
    }

    #[test]
    fn passthrough_open_brings_up_coprocessor_side() {
        let f = fixture();
        open_passthrough(&f);
        let table = f.mux.link_table(0).unwrap();
        let guard = table.channels[PT_CHAN as usize].state.lock().unwrap();
        assert_eq!(guard.status, ChannelStatus::Open);
        assert_eq!(guard.coproc_status, ChannelStatus::Open);
    }

    #[test]
    fn passthrough_write_is_remapped_for_dispatch() {
        let f = fixture();
        open_passthrough(&f);
        f.mux
            .tx(Event::new(0, EventKind::WriteReq, pcie_dev(), PT_CHAN, 0)
                .with_payload(Bytes::from_static(b"fwd")))
            .unwrap();
        let sent = f.sink.take();
        assert_eq!(sent[0].1.kind, EventKind::PassthroughWriteReq);

        f.mux
            .tx(Event::new(0, EventKind::WriteVolatileReq, pcie_dev(), PT_CHAN, 0)
                .with_payload(Bytes::from_static(b"v")))
            .unwrap();
        let sent = f.sink.take();
        assert_eq!(sent[0].1.kind, EventKind::PassthroughVolatileWriteReq);
    }

    #[test]
    fn inbound_passthrough_write_then_read_forwards_to_host() {
        let f = fixture();
        open_passthrough(&f);

        let payload = b"to the coprocessor and back";
        f.transport
            .write(Interface::Pcie, 0, payload, None, None)
            .unwrap();
        f.mux
            .rx(Event::new(
                0,
                EventKind::PassthroughWriteReq,
                pcie_dev(),
                PT_CHAN,
                payload.len() as u32,
            ))
            .unwrap();
        // buffer staged and its address handed to the coprocessor
        assert_eq!(f.allocator.outstanding(), 1);
        assert_eq!(f.mux.remote_allocs.len(), 1);

        f.mux
            .rx(Event::new(0, EventKind::PassthroughReadReq, pcie_dev(), PT_CHAN, 0))
            .unwrap();
        assert_eq!(f.allocator.outstanding(), 0);
        assert!(f.mux.remote_allocs.is_empty());

        let forwarded = f.sink.take();
        let (direction, event) = forwarded.last().unwrap();
        assert_eq!(*direction, Direction::Rx);
        assert_eq!(event.kind, EventKind::WriteReq);
        assert_eq!(event.payload.as_ref().unwrap().as_ref(), payload);
    }

    #[test]
    fn failed_coprocessor_handoff_leaves_no_allocation() {
        let f = fixture();
        open_passthrough(&f);
        f.transport.fail_ipc_writes(true);

        f.transport
            .write(Interface::Pcie, 0, b"lost", None, None)
            .unwrap();
        let err = f
            .mux
            .rx(Event::new(0, EventKind::PassthroughWriteReq, pcie_dev(), PT_CHAN, 4))
            .unwrap_err();
        assert!(matches!(err, MuxError::TransportFailure(_)));
        assert_eq!(f.allocator.outstanding(), 0);
        assert!(f.mux.remote_allocs.is_empty());
    }

    #[test]
    fn inbound_bounded_read_forwards_coprocessor_data() {
        let f = fixture();
        open_passthrough(&f);
        f.transport.inject_ipc_message(PT_CHAN, b"small".to_vec());

        f.mux
            .rx(Event::new(
                0,
                EventKind::PassthroughReadToBufferReq,
                pcie_dev(),
                PT_CHAN,
                0,
            ))
            .unwrap();
        let forwarded = f.sink.take();
        let (_, event) = forwarded.last().unwrap();
        assert_eq!(event.kind, EventKind::WriteReq);
        assert_eq!(event.payload.as_ref().unwrap().as_ref(), b"small");
        assert_eq!(f.allocator.outstanding(), 0);
    }

    #[test]
    fn coprocessor_attached_caller_roundtrip() {
        let f = fixture();
        // a caller on the coprocessor side opens and uses the channel directly
        f.mux
            .tx(Event::new(0, EventKind::OpenChannelReq, coproc_dev(), PT_CHAN, 1000)
                .with_timeout_ms(100)
                .with_mode(OpMode::RxNonBlockTxNonBlock))
            .unwrap();

        f.mux
            .tx(Event::new(0, EventKind::WriteVolatileReq, coproc_dev(), PT_CHAN, 0)
                .with_payload(Bytes::from_static(b"direct")))
            .unwrap();

        let reply = f
            .mux
            .tx(Event::new(0, EventKind::ReadToBufferReq, coproc_dev(), PT_CHAN, 0))
            .unwrap();
        let TxReply::Read(read) = reply else {
            panic!("read returned no data");
        };
        assert_eq!(read.data.as_ref(), b"direct");
        assert!(read.phys.is_none());

        // second open of the coprocessor side is rejected
        let err = f
            .mux
            .tx(Event::new(0, EventKind::OpenChannelReq, coproc_dev(), PT_CHAN, 1000))
            .unwrap_err();
        assert!(matches!(err, MuxError::AlreadyOpen(PT_CHAN)));

        f.mux
            .tx(Event::new(0, EventKind::CloseChannelReq, coproc_dev(), PT_CHAN, 0))
            .unwrap();
    }
}
