//! Per-channel packet queues.

use std::collections::VecDeque;

use bytes::Bytes;
use linkmux_transport::{DmaBuffer, MemoryRegion};

/// An immutable-once-queued unit of buffered data.
#[derive(Debug, Clone)]
pub struct Packet {
    pub data: Bytes,
    pub phys: u64,
    pub region: MemoryRegion,
    pub alignment: usize,
}

impl Packet {
    /// Freeze a filled DMA buffer into a packet.
    pub fn from_buffer(buffer: DmaBuffer) -> Self {
        let (data, phys, region, alignment) = buffer.freeze();
        Self {
            data,
            phys,
            region,
            alignment,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Bounded FIFO of packets, plus the packets currently held by a caller.
///
/// A packet lives in exactly one of the two lists. The fill-level invariant
/// is: channel fill == sum of lengths across both lists.
#[derive(Debug)]
pub struct PacketQueue {
    queued: VecDeque<Packet>,
    outstanding: Vec<Packet>,
    capacity: usize,
}

impl PacketQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queued: VecDeque::new(),
            outstanding: Vec::new(),
            capacity,
        }
    }

    /// Total packets tracked, queued plus outstanding.
    pub fn len(&self) -> usize {
        self.queued.len() + self.outstanding.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Enqueue at the tail. Returns the packet back if the queue is full.
    pub fn push(&mut self, packet: Packet) -> Result<(), Packet> {
        if self.is_full() {
            return Err(packet);
        }
        self.queued.push_back(packet);
        Ok(())
    }

    /// Move the head packet to the outstanding list and return a view of it.
    pub fn claim_front(&mut self) -> Option<&Packet> {
        let packet = self.queued.pop_front()?;
        self.outstanding.push(packet);
        self.outstanding.last()
    }

    /// Remove an outstanding packet: by physical address when given,
    /// otherwise the oldest one.
    pub fn release(&mut self, addr: Option<u64>) -> Option<Packet> {
        match addr {
            None => {
                if self.outstanding.is_empty() {
                    None
                } else {
                    Some(self.outstanding.remove(0))
                }
            }
            Some(addr) => {
                let idx = self.outstanding.iter().position(|p| p.phys == addr)?;
                Some(self.outstanding.remove(idx))
            }
        }
    }

    /// Remove every packet, queued and outstanding, for channel teardown.
    pub fn drain_all(&mut self) -> Vec<Packet> {
        let mut all: Vec<Packet> = self.queued.drain(..).collect();
        all.append(&mut self.outstanding);
        all
    }

    /// Sum of lengths across both lists, for bookkeeping checks.
    pub fn fill_bytes(&self) -> usize {
        self.queued.iter().map(Packet::len).sum::<usize>()
            + self.outstanding.iter().map(Packet::len).sum::<usize>()
    }
}
