//! Per-link event dispatch.
//!
//! Each active link runs two threads: a writer draining the link's event
//! queue onto the wire, and a pump reading wire traffic and feeding it to
//! the multiplexer's RX engine. Events cross the wire as a fixed header,
//! followed by the payload for payload-bearing kinds.
//!
//! Wire header layout (little endian):
//!
//! ```text
//! offset  size  field
//!      0     2  magic "LM"
//!      2     1  event kind
//!      3     1  operating mode (open requests only)
//!      4     2  channel id
//!      6     4  payload / transfer size
//!     10     4  channel timeout, milliseconds
//!     14     2  reserved, zero
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use linkmux_mux::{
    Direction, Event, EventKind, EventSink, Multiplexer, MuxError, OpMode,
};
use linkmux_transport::{DeviceHandle, Interface, Transport, TransportError};

use crate::error::{LinkError, Result};

pub(crate) const WIRE_MAGIC: [u8; 2] = *b"LM";
pub(crate) const HEADER_LEN: usize = 16;

/// How often a pump re-checks its shutdown flag while idle.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A decoded wire header.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct WireHeader {
    pub kind: EventKind,
    pub mode: Option<OpMode>,
    pub chan: u16,
    pub size: u32,
    pub timeout_ms: u32,
}

pub(crate) fn encode(event: &Event) -> Bytes {
    let payload_len = event
        .payload
        .as_ref()
        .filter(|_| event.kind.carries_payload())
        .map(|p| p.len())
        .unwrap_or(0);
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload_len);
    buf.put_slice(&WIRE_MAGIC);
    buf.put_u8(event.kind.wire_code());
    buf.put_u8(event.mode.map(OpMode::wire_code).unwrap_or(0));
    buf.put_u16_le(event.chan);
    buf.put_u32_le(event.size);
    buf.put_u32_le(event.timeout_ms);
    buf.put_u16_le(0);
    if event.kind.carries_payload() {
        if let Some(payload) = &event.payload {
            buf.put_slice(payload);
        }
    }
    buf.freeze()
}

pub(crate) fn decode_header(buf: &[u8; HEADER_LEN]) -> linkmux_mux::Result<WireHeader> {
    if buf[0..2] != WIRE_MAGIC {
        return Err(MuxError::ProtocolError("bad wire magic"));
    }
    let kind = EventKind::from_wire_code(buf[2])?;
    let mode = if kind == EventKind::OpenChannelReq {
        OpMode::from_wire_code(buf[3])
    } else {
        None
    };
    let chan = u16::from_le_bytes([buf[4], buf[5]]);
    let size = u32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]);
    let timeout_ms = u32::from_le_bytes([buf[10], buf[11], buf[12], buf[13]]);
    Ok(WireHeader {
        kind,
        mode,
        chan,
        size,
        timeout_ms,
    })
}

struct LinkWorker {
    sender: mpsc::Sender<Event>,
    running: Arc<AtomicBool>,
    writer: Option<thread::JoinHandle<()>>,
    pump: Option<thread::JoinHandle<()>>,
}

impl Drop for LinkWorker {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        // closing the queue lets the writer drain and exit
        let (dummy, _) = mpsc::channel();
        drop(std::mem::replace(&mut self.sender, dummy));
        if let Some(handle) = self.writer.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.pump.take() {
            let _ = handle.join();
        }
    }
}

/// Routes multiplexer events onto the wire, one worker pair per link.
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    links: Mutex<HashMap<u32, LinkWorker>>,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            links: Mutex::new(HashMap::new()),
        }
    }

    /// Spin up the writer and pump for a freshly connected link.
    pub fn start_link(
        &self,
        link_id: u32,
        device: DeviceHandle,
        mux: Arc<Multiplexer>,
    ) -> Result<()> {
        let interface = device
            .interface()
            .ok_or(LinkError::UnknownDevice(device.device_id))?;
        let mut links = self.links.lock().unwrap();
        if links.contains_key(&link_id) {
            return Ok(());
        }

        let (sender, receiver) = mpsc::channel::<Event>();
        let transport = Arc::clone(&self.transport);
        let writer = thread::Builder::new()
            .name(format!("linkmux-tx-{link_id}"))
            .spawn(move || writer_loop(receiver, transport, interface, device.device_id))
            .map_err(|err| LinkError::Transport(TransportError::Io(err)))?;

        let running = Arc::new(AtomicBool::new(true));
        let pump_running = Arc::clone(&running);
        let transport = Arc::clone(&self.transport);
        let pump = thread::Builder::new()
            .name(format!("linkmux-rx-{link_id}"))
            .spawn(move || pump_loop(pump_running, transport, interface, device, link_id, mux))
            .map_err(|err| LinkError::Transport(TransportError::Io(err)))?;

        links.insert(
            link_id,
            LinkWorker {
                sender,
                running,
                writer: Some(writer),
                pump: Some(pump),
            },
        );
        tracing::info!(link_id, "dispatcher started");
        Ok(())
    }

    /// Stop and join the link's worker pair.
    pub fn stop_link(&self, link_id: u32) {
        // joining happens after the lock is released: the pump thread may be
        // inside enqueue, waiting on the same mutex
        let worker = self.links.lock().unwrap().remove(&link_id);
        if worker.is_some() {
            tracing::info!(link_id, "dispatcher stopped");
        }
    }

    pub fn stop_all(&self) {
        let drained = std::mem::take(&mut *self.links.lock().unwrap());
        drop(drained);
    }
}

impl EventSink for Dispatcher {
    fn enqueue(&self, direction: Direction, event: Event) -> linkmux_mux::Result<()> {
        let link_id = event.link_id;
        tracing::trace!(?direction, kind = ?event.kind, chan = event.chan, "event queued");
        let links = self.links.lock().unwrap();
        let worker = links.get(&link_id).ok_or(MuxError::LinkDown(link_id))?;
        worker
            .sender
            .send(event)
            .map_err(|_| MuxError::LinkDown(link_id))
    }
}

fn writer_loop(
    receiver: mpsc::Receiver<Event>,
    transport: Arc<dyn Transport>,
    interface: Interface,
    device_id: u32,
) {
    for event in receiver {
        let frame = encode(&event);
        match transport.write(interface, device_id, &frame, None, None) {
            Ok(_) => {}
            Err(TransportError::Shutdown) => break,
            Err(err) => {
                tracing::warn!(kind = ?event.kind, chan = event.chan, error = %err, "wire write failed");
            }
        }
    }
}

fn pump_loop(
    running: Arc<AtomicBool>,
    transport: Arc<dyn Transport>,
    interface: Interface,
    device: DeviceHandle,
    link_id: u32,
    mux: Arc<Multiplexer>,
) {
    let mut header = [0u8; HEADER_LEN];
    while running.load(Ordering::SeqCst) {
        match transport.read(interface, device.device_id, &mut header, Some(POLL_INTERVAL), None) {
            Ok(n) if n == HEADER_LEN => {}
            Ok(n) => {
                tracing::warn!(n, "truncated wire header");
                continue;
            }
            Err(TransportError::Timeout) => continue,
            Err(TransportError::Shutdown) => break,
            Err(err) => {
                tracing::warn!(error = %err, "wire read failed");
                break;
            }
        }
        let wire = match decode_header(&header) {
            Ok(wire) => wire,
            Err(err) => {
                tracing::warn!(error = %err, "dropping undecodable frame");
                continue;
            }
        };
        let mut event = Event::new(link_id, wire.kind, device, wire.chan, wire.size)
            .with_timeout_ms(wire.timeout_ms);
        if let Some(mode) = wire.mode {
            event = event.with_mode(mode);
        }
        // control payloads are small and travel embedded; everything else is
        // consumed from the wire by the RX engine itself
        if wire.kind == EventKind::WriteControlReq {
            let mut payload = vec![0u8; wire.size as usize];
            match transport.read(
                interface,
                device.device_id,
                &mut payload,
                Some(POLL_INTERVAL),
                None,
            ) {
                Ok(n) if n == wire.size as usize => {
                    event = event.with_payload(Bytes::from(payload));
                }
                Ok(_) | Err(_) => {
                    // header and payload have split: the stream framing is
                    // lost, so later bytes would be misparsed as headers
                    tracing::warn!(chan = wire.chan, "control payload missing, stopping pump");
                    break;
                }
            }
        }
        if let Err(err) = mux.rx(event) {
            tracing::warn!(chan = wire.chan, kind = ?wire.kind, error = %err, "inbound event rejected");
        }
    }
}

#[cfg(test)]
mod tests {
    use linkmux_transport::interface::device_id_for;
    use linkmux_transport::DeviceKind;

    use super::*;

    fn dev() -> DeviceHandle {
        DeviceHandle::new(device_id_for(Interface::Pcie, 1), DeviceKind::Remote)
    }

    #[test]
    fn header_roundtrip() {
        let event = Event::new(0, EventKind::OpenChannelReq, dev(), 0x123, 4096)
            .with_timeout_ms(750)
            .with_mode(OpMode::RxNonBlockTxBlock);
        let frame = encode(&event);
        assert_eq!(frame.len(), HEADER_LEN);

        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&frame);
        let wire = decode_header(&header).unwrap();
        assert_eq!(wire.kind, EventKind::OpenChannelReq);
        assert_eq!(wire.mode, Some(OpMode::RxNonBlockTxBlock));
        assert_eq!(wire.chan, 0x123);
        assert_eq!(wire.size, 4096);
        assert_eq!(wire.timeout_ms, 750);
    }

    #[test]
    fn payload_follows_header_for_writes() {
        let event = Event::new(0, EventKind::WriteReq, dev(), 7, 0)
            .with_payload(Bytes::from_static(b"abc"));
        let frame = encode(&event);
        assert_eq!(frame.len(), HEADER_LEN + 3);
        assert_eq!(&frame[HEADER_LEN..], b"abc");

        // release events reuse size without a payload body
        let event = Event::new(0, EventKind::ReleaseReq, dev(), 7, 100);
        assert_eq!(encode(&event).len(), HEADER_LEN);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut header = [0u8; HEADER_LEN];
        header[0] = b'X';
        assert!(decode_header(&header).is_err());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut header = [0u8; HEADER_LEN];
        header[0..2].copy_from_slice(&WIRE_MAGIC);
        header[2] = 0x0E;
        assert!(decode_header(&header).is_err());
    }

    #[test]
    fn mode_is_only_decoded_for_opens() {
        let event = Event::new(0, EventKind::WriteReq, dev(), 1, 4);
        let frame = encode(&event);
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&frame[..HEADER_LEN]);
        assert_eq!(decode_header(&header).unwrap().mode, None);
    }
}
