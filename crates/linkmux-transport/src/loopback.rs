//! In-memory transport and allocator used by tests and demos.
//!
//! [`Loopback`] loops every stream write back to its own interface, so a
//! node talks to itself as if it were its own peer. The shared-memory
//! interface carries discrete messages per coprocessor channel instead of a
//! byte stream, matching how the real transport behaves.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

use crate::error::{Result, TransportError};
use crate::interface::Interface;
use crate::traits::{AddressTranslator, BufferAllocator, DmaBuffer, IpcContext, MemoryRegion, Transport};

#[derive(Default)]
struct LoopbackState {
    streams: HashMap<Interface, VecDeque<u8>>,
    ipc_messages: HashMap<u16, VecDeque<Vec<u8>>>,
    ipc_open: HashSet<u16>,
    fail_ipc_writes: bool,
    shutdown: bool,
}

/// Loopback transport: stream interfaces echo to themselves, the shared
/// memory interface carries per-channel messages.
pub struct Loopback {
    state: Mutex<LoopbackState>,
    cv: Condvar,
}

impl Default for Loopback {
    fn default() -> Self {
        Self::new()
    }
}

impl Loopback {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LoopbackState::default()),
            cv: Condvar::new(),
        }
    }

    /// Make subsequent shared-memory writes fail, for error-path tests.
    pub fn fail_ipc_writes(&self, fail: bool) {
        self.state.lock().unwrap().fail_ipc_writes = fail;
        self.cv.notify_all();
    }

    /// Inject a message on a coprocessor channel, as if the coprocessor
    /// had produced it.
    pub fn inject_ipc_message(&self, chan: u16, data: Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        state.ipc_messages.entry(chan).or_default().push_back(data);
        self.cv.notify_all();
    }

    /// Wake all blocked readers with `Shutdown`.
    pub fn shutdown(&self) {
        self.state.lock().unwrap().shutdown = true;
        self.cv.notify_all();
    }

    fn wait_deadline<'a>(
        &self,
        guard: std::sync::MutexGuard<'a, LoopbackState>,
        deadline: Option<Instant>,
    ) -> Result<std::sync::MutexGuard<'a, LoopbackState>> {
        match deadline {
            None => Ok(self.cv.wait(guard).unwrap()),
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(TransportError::Timeout);
                }
                let (guard, _) = self.cv.wait_timeout(guard, deadline - now).unwrap();
                Ok(guard)
            }
        }
    }
}

impl Transport for Loopback {
    fn write(
        &self,
        interface: Interface,
        _device_id: u32,
        data: &[u8],
        _timeout: Option<Duration>,
        ipc: Option<&IpcContext>,
    ) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        if state.shutdown {
            return Err(TransportError::Shutdown);
        }
        match interface {
            Interface::Ipc => {
                let chan = ipc.map(|c| c.chan).unwrap_or(0);
                if state.fail_ipc_writes {
                    return Err(TransportError::ChannelClosed {
                        interface: Interface::Ipc,
                        chan,
                    });
                }
                if !state.ipc_open.contains(&chan) {
                    return Err(TransportError::ChannelClosed {
                        interface: Interface::Ipc,
                        chan,
                    });
                }
                state.ipc_messages.entry(chan).or_default().push_back(data.to_vec());
            }
            _ => {
                state.streams.entry(interface).or_default().extend(data.iter().copied());
            }
        }
        self.cv.notify_all();
        Ok(data.len())
    }

    fn read(
        &self,
        interface: Interface,
        _device_id: u32,
        buf: &mut [u8],
        timeout: Option<Duration>,
        ipc: Option<&IpcContext>,
    ) -> Result<usize> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock().unwrap();
        loop {
            if state.shutdown {
                return Err(TransportError::Shutdown);
            }
            match interface {
                Interface::Ipc => {
                    let chan = ipc.map(|c| c.chan).unwrap_or(0);
                    if let Some(msg) = state.ipc_messages.get_mut(&chan).and_then(|q| q.pop_front())
                    {
                        let n = msg.len().min(buf.len());
                        buf[..n].copy_from_slice(&msg[..n]);
                        return Ok(n);
                    }
                }
                _ => {
                    let ready = state
                        .streams
                        .get(&interface)
                        .map(|q| q.len() >= buf.len())
                        .unwrap_or(false);
                    if ready {
                        let queue = state.streams.get_mut(&interface).unwrap();
                        for slot in buf.iter_mut() {
                            *slot = queue.pop_front().unwrap();
                        }
                        return Ok(buf.len());
                    }
                }
            }
            state = self.wait_deadline(state, deadline)?;
        }
    }

    fn open_channel(&self, interface: Interface, _device_id: u32, chan: u16) -> Result<()> {
        if interface == Interface::Ipc {
            self.state.lock().unwrap().ipc_open.insert(chan);
        }
        Ok(())
    }

    fn close_channel(&self, interface: Interface, _device_id: u32, chan: u16) -> Result<()> {
        if interface == Interface::Ipc {
            let mut state = self.state.lock().unwrap();
            state.ipc_open.remove(&chan);
            state.ipc_messages.remove(&chan);
        }
        Ok(())
    }
}

/// Heap-backed allocator with a ledger of live allocations.
///
/// Physical addresses are synthesized from a monotonic counter, which is
/// enough for address-matched release and translation tests.
pub struct HeapAllocator {
    next_phys: AtomicU64,
    ledger: Mutex<HashMap<u64, usize>>,
    fail_next: AtomicBool,
}

impl Default for HeapAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapAllocator {
    pub fn new() -> Self {
        Self {
            next_phys: AtomicU64::new(0x1000),
            ledger: Mutex::new(HashMap::new()),
            fail_next: AtomicBool::new(false),
        }
    }

    /// Number of allocations not yet returned.
    pub fn outstanding(&self) -> usize {
        self.ledger.lock().unwrap().len()
    }

    /// Make the next allocation fail, for error-path tests.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

impl BufferAllocator for HeapAllocator {
    fn allocate(
        &self,
        _device_id: u32,
        size: usize,
        alignment: usize,
        region: MemoryRegion,
    ) -> Result<DmaBuffer> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(TransportError::AllocationFailed { size });
        }
        let align = alignment.max(1) as u64;
        let phys = self
            .next_phys
            .fetch_add(((size as u64 / align) + 1) * align, Ordering::SeqCst);
        self.ledger.lock().unwrap().insert(phys, size);
        Ok(DmaBuffer::new(BytesMut::zeroed(size), phys, region, alignment))
    }

    fn deallocate(&self, _data: Bytes, phys: u64, _alignment: usize, _region: MemoryRegion) {
        if self.ledger.lock().unwrap().remove(&phys).is_none() {
            tracing::warn!(phys, "deallocate of unknown buffer");
        }
    }
}

/// Fixed-offset address translation between host and coprocessor space.
pub struct OffsetTranslator {
    offset: u64,
}

impl OffsetTranslator {
    pub fn new(offset: u64) -> Self {
        Self { offset }
    }
}

impl AddressTranslator for OffsetTranslator {
    fn to_device(&self, phys: u64) -> u64 {
        phys.wrapping_add(self.offset)
    }

    fn to_host(&self, device_addr: u64) -> u64 {
        device_addr.wrapping_sub(self.offset)
    }
}
