//! The top-level linkmux service.
//!
//! [`LinkService`] ties the pieces together: the reference-counted link
//! registry, the per-link dispatcher and the multiplexer core. It exposes
//! the device-facing API: connect, channel lifecycle, data transfer and
//! buffer release.

use std::sync::Arc;

use bytes::Bytes;
use linkmux_mux::config::MAX_BUF_SIZE;
use linkmux_mux::{
    CallbackTarget, Event, EventKind, Multiplexer, MuxError, OpMode, ReadPayload, TxReply,
};
use linkmux_transport::{AddressTranslator, BufferAllocator, DeviceHandle, Transport};

use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::registry::LinkRegistry;

pub struct LinkService {
    mux: Arc<Multiplexer>,
    dispatcher: Arc<Dispatcher>,
    registry: LinkRegistry,
}

impl LinkService {
    pub fn new(
        allocator: Arc<dyn BufferAllocator>,
        transport: Arc<dyn Transport>,
        translator: Arc<dyn AddressTranslator>,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&transport)));
        let mux = Arc::new(Multiplexer::new(
            allocator,
            transport,
            translator,
            Arc::clone(&dispatcher) as Arc<dyn linkmux_mux::EventSink>,
        ));
        Self {
            mux,
            dispatcher,
            registry: LinkRegistry::new(),
        }
    }

    /// Bring up (or take another reference on) the link to a device.
    pub fn connect(&self, device: DeviceHandle) -> Result<u32> {
        let (link_id, first) = self.registry.acquire(device)?;
        if first {
            if let Err(err) = self.mux.connect(link_id, device) {
                self.registry.release(device.device_id)?;
                return Err(err.into());
            }
            if let Err(err) = self.dispatcher.start_link(link_id, device, Arc::clone(&self.mux)) {
                self.mux.disconnect(link_id)?;
                self.registry.release(device.device_id)?;
                return Err(err);
            }
        }
        Ok(link_id)
    }

    /// Drop one reference on the device's link, tearing it down on the last.
    pub fn disconnect(&self, device_id: u32) -> Result<()> {
        if let Some(link_id) = self.registry.release(device_id)? {
            self.dispatcher.stop_link(link_id);
            self.mux.disconnect(link_id)?;
        }
        Ok(())
    }

    /// Open a channel toward the device and wait for the peer handshake.
    pub fn open_channel(
        &self,
        device_id: u32,
        chan: u16,
        mode: OpMode,
        size: u32,
        timeout_ms: u32,
    ) -> Result<()> {
        let (link_id, device) = self.registry.lookup(device_id)?;
        let event = Event::new(link_id, EventKind::OpenChannelReq, device, chan, size)
            .with_timeout_ms(timeout_ms)
            .with_mode(mode);
        self.mux.tx(event)?;
        Ok(())
    }

    pub fn close_channel(&self, device_id: u32, chan: u16) -> Result<()> {
        let (link_id, device) = self.registry.lookup(device_id)?;
        self.mux
            .tx(Event::new(link_id, EventKind::CloseChannelReq, device, chan, 0))?;
        Ok(())
    }

    /// Write a payload; blocks under backpressure on blocking channels.
    pub fn write(&self, device_id: u32, chan: u16, data: &[u8]) -> Result<()> {
        let (link_id, device) = self.registry.lookup(device_id)?;
        let event = Event::new(link_id, EventKind::WriteReq, device, chan, 0)
            .with_payload(Bytes::copy_from_slice(data));
        self.mux.tx(event)?;
        Ok(())
    }

    /// Write a small payload carried by value end to end.
    pub fn write_volatile(&self, device_id: u32, chan: u16, data: &[u8]) -> Result<()> {
        if data.len() > MAX_BUF_SIZE {
            return Err(MuxError::ProtocolError("volatile payload exceeds maximum").into());
        }
        let (link_id, device) = self.registry.lookup(device_id)?;
        let event = Event::new(link_id, EventKind::WriteVolatileReq, device, chan, 0)
            .with_payload(Bytes::copy_from_slice(data));
        self.mux.tx(event)?;
        Ok(())
    }

    /// Write a control payload on a data channel.
    pub fn write_control(&self, device_id: u32, chan: u16, data: &[u8]) -> Result<()> {
        let (link_id, device) = self.registry.lookup(device_id)?;
        let event = Event::new(link_id, EventKind::WriteControlReq, device, chan, 0)
            .with_payload(Bytes::copy_from_slice(data));
        self.mux.tx(event)?;
        Ok(())
    }

    /// Read the next buffered payload. The returned buffer stays charged to
    /// the channel until [`LinkService::release`].
    pub fn read(&self, device_id: u32, chan: u16) -> Result<ReadPayload> {
        let (link_id, device) = self.registry.lookup(device_id)?;
        match self
            .mux
            .tx(Event::new(link_id, EventKind::ReadReq, device, chan, 0))?
        {
            TxReply::Read(payload) => Ok(payload),
            TxReply::Done => Err(MuxError::ProtocolError("read produced no data").into()),
        }
    }

    /// Read the next payload by copy into `buf`. Returns the bytes copied.
    pub fn read_to_buffer(&self, device_id: u32, chan: u16, buf: &mut [u8]) -> Result<usize> {
        let (link_id, device) = self.registry.lookup(device_id)?;
        let reply = self.mux.tx(Event::new(
            link_id,
            EventKind::ReadToBufferReq,
            device,
            chan,
            buf.len() as u32,
        ))?;
        match reply {
            TxReply::Read(payload) => {
                let n = payload.data.len().min(buf.len());
                buf[..n].copy_from_slice(&payload.data[..n]);
                // buffers handed out by copy on plain channels still need a
                // release to return their flow-control credit
                if let Some(phys) = payload.phys {
                    self.release(device_id, chan, Some(phys))?;
                }
                Ok(n)
            }
            TxReply::Done => Err(MuxError::ProtocolError("read produced no data").into()),
        }
    }

    /// Return a previously read buffer. `phys` of `None` releases the oldest
    /// outstanding buffer on the channel.
    pub fn release(&self, device_id: u32, chan: u16, phys: Option<u64>) -> Result<()> {
        let (link_id, device) = self.registry.lookup(device_id)?;
        let mut event = Event::new(link_id, EventKind::ReleaseReq, device, chan, 0);
        if let Some(phys) = phys {
            event = event.with_phys(phys);
        }
        self.mux.tx(event)?;
        Ok(())
    }

    /// Liveness probe for the device's link.
    pub fn ping(&self, device_id: u32) -> Result<()> {
        let (link_id, device) = self.registry.lookup(device_id)?;
        self.mux
            .tx(Event::new(link_id, EventKind::PingReq, device, 0, 0))?;
        Ok(())
    }

    pub fn register_ready_callback(
        &self,
        device_id: u32,
        chan: u16,
        target: CallbackTarget,
    ) -> Result<()> {
        let (link_id, _) = self.registry.lookup(device_id)?;
        self.mux.register_ready_callback(link_id, chan, target)?;
        Ok(())
    }

    pub fn register_consumed_callback(
        &self,
        device_id: u32,
        chan: u16,
        target: CallbackTarget,
    ) -> Result<()> {
        let (link_id, _) = self.registry.lookup(device_id)?;
        self.mux.register_consumed_callback(link_id, chan, target)?;
        Ok(())
    }
}

impl Drop for LinkService {
    fn drop(&mut self) {
        self.dispatcher.stop_all();
        for link_id in self.registry.active_links() {
            if let Err(err) = self.mux.disconnect(link_id) {
                tracing::warn!(link_id, error = %err, "teardown on drop failed");
            }
        }
    }
}
