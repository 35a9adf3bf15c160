//! Shared test fixtures: in-memory rings and a scriptable backend end.

use core::sync::atomic::{AtomicU8, Ordering};

use guest_gnttab::GrantRef;

use crate::EventChannel;
use crate::ring::{IntfPage, RingBuffer, ring_size};
use crate::wire::{HDR_SIZE, Header};

/// Deterministic xorshift64 for randomized-order tests.
pub fn xorshift(state: &mut u64) -> u64 {
    *state ^= *state << 13;
    *state ^= *state >> 7;
    *state ^= *state << 17;
    *state
}

/// Event channel for hosted tests: waiting yields the thread, real
/// threads make notification implicit.
pub struct YieldChannel;

impl EventChannel for YieldChannel {
    fn notify(&self) {}

    fn wait(&self) {
        std::thread::yield_now();
    }
}

/// Both ring data areas plus the interface page, heap-backed.
pub struct TestRings {
    pub intf: IntfPage,
    in_data: Vec<AtomicU8>,
    out_data: Vec<AtomicU8>,
}

impl TestRings {
    pub fn new(order: usize) -> Self {
        let size = ring_size(order) as usize;
        let refs = (0..1usize << order)
            .map(|i| GrantRef(8 + i as u32))
            .collect();
        Self {
            intf: IntfPage::new(order, refs),
            in_data: (0..size).map(|_| AtomicU8::new(0)).collect(),
            out_data: (0..size).map(|_| AtomicU8::new(0)).collect(),
        }
    }

    pub fn ring_in(&self) -> RingBuffer<'_> {
        RingBuffer::new(&self.in_data)
    }

    pub fn ring_out(&self) -> RingBuffer<'_> {
        RingBuffer::new(&self.out_data)
    }
}

/// The backend's view: consumes the frontend's out ring, produces onto
/// its in ring.
pub struct BackendEnd<'a> {
    intf: &'a IntfPage,
    to_guest: RingBuffer<'a>,
    from_guest: RingBuffer<'a>,
}

impl<'a> BackendEnd<'a> {
    pub fn new(rings: &'a TestRings) -> Self {
        Self {
            intf: &rings.intf,
            to_guest: rings.ring_in(),
            from_guest: rings.ring_out(),
        }
    }

    fn available(&self) -> u32 {
        self.intf
            .out_prod
            .load(Ordering::Acquire)
            .wrapping_sub(self.intf.out_cons.load(Ordering::Relaxed))
    }

    /// Pull one complete request off the guest's out ring, if any.
    pub fn try_recv(&self) -> Option<(Header, Vec<u8>)> {
        if self.available() < HDR_SIZE {
            return None;
        }
        let cons = self.intf.out_cons.load(Ordering::Relaxed);
        let mut hb = [0u8; HDR_SIZE as usize];
        self.from_guest.read(cons, &mut hb);
        let hdr = Header::from_bytes(&hb);
        while self.available() < hdr.size {
            std::thread::yield_now();
        }
        let mut body = vec![0u8; (hdr.size - HDR_SIZE) as usize];
        self.from_guest.read(cons.wrapping_add(HDR_SIZE), &mut body);
        self.intf
            .out_cons
            .store(cons.wrapping_add(hdr.size), Ordering::Release);
        Some((hdr, body))
    }

    pub fn recv_blocking(&self) -> (Header, Vec<u8>) {
        loop {
            if let Some(m) = self.try_recv() {
                return m;
            }
            std::thread::yield_now();
        }
    }

    /// Put one response onto the guest's in ring.
    pub fn send(&self, cmd: u8, tag: u16, body: &[u8]) {
        let size = HDR_SIZE + body.len() as u32;
        let prod = self.intf.in_prod.load(Ordering::Relaxed);
        while self
            .to_guest
            .size()
            .wrapping_sub(prod.wrapping_sub(self.intf.in_cons.load(Ordering::Acquire)))
            < size
        {
            std::thread::yield_now();
        }
        let hdr = Header { size, cmd, tag };
        self.to_guest.write(prod, &hdr.to_bytes());
        self.to_guest.write(prod.wrapping_add(HDR_SIZE), body);
        self.intf
            .in_prod
            .store(prod.wrapping_add(size), Ordering::Release);
    }

    /// Put raw bytes onto the guest's in ring without framing, for
    /// crafting malformed responses.
    pub fn send_raw(&self, bytes: &[u8]) {
        let len = bytes.len() as u32;
        let prod = self.intf.in_prod.load(Ordering::Relaxed);
        while self
            .to_guest
            .size()
            .wrapping_sub(prod.wrapping_sub(self.intf.in_cons.load(Ordering::Acquire)))
            < len
        {
            std::thread::yield_now();
        }
        self.to_guest.write(prod, bytes);
        self.intf
            .in_prod
            .store(prod.wrapping_add(len), Ordering::Release);
    }

}
