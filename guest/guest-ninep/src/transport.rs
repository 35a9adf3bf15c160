//! Ring transport and tag-correlated request multiplexing.
//!
//! Multiple requests may be outstanding at once, so a caller waiting for
//! its own response may have to consume other tags' responses first.
//! Those are pulled off the ring whole and stashed on their slot; the
//! slot's owner finds the stash on its next look instead of touching the
//! ring. Response order therefore never has to match send order.
//!
//! Two counting semaphores with count one serialize the two ring ends:
//! the out token covers space-wait plus full message composition (a
//! short message must not fragment a longer one mid-write), the in token
//! covers header consumption.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use guest_sync::{Semaphore, SpinLock};

use crate::ring::{IntfPage, RingBuffer};
use crate::wire::{BodyReader, CMD_ERROR, HDR_SIZE, Header, WireArg, WireField};
use crate::{EventChannel, P9Error};

/// Outstanding-request slots per device; the slot index is the wire tag.
pub const N_REQS: usize = 64;

/// Free-list end marker.
const END: u16 = N_REQS as u16;

struct Req {
    cmd: u8,
    result: Option<P9Error>,
    inflight: bool,
    /// Full response (header included) drained by another waiter.
    data: Option<Vec<u8>>,
    next_free: u16,
}

struct ReqPool {
    free_head: u16,
    reqs: [Req; N_REQS],
}

impl ReqPool {
    fn new() -> Self {
        Self {
            free_head: 0,
            reqs: core::array::from_fn(|i| Req {
                cmd: 0,
                result: None,
                inflight: false,
                data: None,
                next_free: i as u16 + 1,
            }),
        }
    }
}

/// One 9P device's ring endpoints and request pool.
pub struct Transport<'a> {
    intf: &'a IntfPage,
    data_in: RingBuffer<'a>,
    data_out: RingBuffer<'a>,
    chan: &'a dyn EventChannel,
    /// Producer position including data not yet published to the peer.
    prod_pvt_out: AtomicU32,
    /// Consumer position including data not yet acknowledged to the peer.
    cons_pvt_in: AtomicU32,
    pool: SpinLock<ReqPool>,
    out_sem: Semaphore,
    in_sem: Semaphore,
}

impl<'a> Transport<'a> {
    #[must_use]
    pub fn new(
        intf: &'a IntfPage,
        data_in: RingBuffer<'a>,
        data_out: RingBuffer<'a>,
        chan: &'a dyn EventChannel,
    ) -> Self {
        Self {
            intf,
            data_in,
            data_out,
            chan,
            prod_pvt_out: AtomicU32::new(0),
            cons_pvt_in: AtomicU32::new(0),
            pool: SpinLock::new(ReqPool::new()),
            out_sem: Semaphore::new(1),
            in_sem: Semaphore::new(1),
        }
    }

    #[must_use]
    pub fn ring_order(&self) -> usize {
        self.intf.ring_order()
    }

    /// Claim a request slot for `cmd`; its index is the wire tag.
    pub fn alloc_req(&self, cmd: u8) -> Result<u16, P9Error> {
        let mut pool = self.pool.lock();
        if pool.free_head == END {
            return Err(P9Error::NoFreeRequest);
        }
        let tag = pool.free_head;
        pool.free_head = pool.reqs[tag as usize].next_free;
        let req = &mut pool.reqs[tag as usize];
        req.cmd = cmd;
        req.result = None;
        req.inflight = false;
        req.data = None;
        Ok(tag)
    }

    /// Return a slot to the pool once its result has been consumed.
    pub fn release_req(&self, tag: u16) {
        let mut pool = self.pool.lock();
        let head = pool.free_head;
        let req = &mut pool.reqs[tag as usize];
        req.inflight = false;
        req.data = None;
        req.next_free = head;
        pool.free_head = tag;
    }

    /// Result of the response correlated to `tag`.
    pub fn req_result(&self, tag: u16) -> Result<(), P9Error> {
        match self.pool.lock().reqs[tag as usize].result {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    fn ring_out_free(&self) -> u32 {
        let queued = self
            .prod_pvt_out
            .load(Ordering::Relaxed)
            .wrapping_sub(self.intf.out_cons.load(Ordering::Acquire));
        self.data_out.size() - queued
    }

    fn ring_in_data(&self) -> u32 {
        self.intf
            .in_prod
            .load(Ordering::Acquire)
            .wrapping_sub(self.cons_pvt_in.load(Ordering::Relaxed))
    }

    /// Serialize and send one message; marks the slot in flight.
    ///
    /// Blocks while the ring lacks space for the whole message. The
    /// space wait runs under the out token on purpose: releasing it
    /// while waiting would let a shorter message overtake and fragment
    /// this one.
    pub fn send(&self, tag: u16, args: &[WireArg<'_>]) {
        let cmd = self.pool.lock().reqs[tag as usize].cmd;
        let size = HDR_SIZE + args.iter().map(WireArg::wire_len).sum::<u32>();

        let mut msg = Vec::with_capacity(size as usize);
        msg.extend_from_slice(&Header { size, cmd, tag }.to_bytes());
        for a in args {
            a.encode(&mut msg);
        }

        self.out_sem.acquire();

        while self.ring_out_free() < size {
            self.chan.wait();
        }

        let prod = self.prod_pvt_out.load(Ordering::Relaxed);
        self.data_out.write(prod, &msg);
        self.prod_pvt_out
            .store(prod.wrapping_add(size), Ordering::Relaxed);
        // The slot must count as pending before the peer can see the
        // message, or an immediate response would be dropped as stray.
        self.pool.lock().reqs[tag as usize].inflight = true;
        // Data must be on the ring before the peer sees the index move.
        self.intf
            .out_prod
            .store(prod.wrapping_add(size), Ordering::Release);

        self.out_sem.release();

        self.chan.notify();
    }

    /// Wait for the response to `tag` and decode its body into `fields`;
    /// the outcome lands in [`req_result`](Self::req_result).
    ///
    /// Responses for other tags encountered on the way are stashed on
    /// their slots; malformed responses (unknown or idle tag) are logged
    /// and skipped without disturbing anyone's wait.
    pub fn recv(&self, tag: u16, fields: &mut [WireField<'_>]) {
        self.in_sem.acquire();

        while !self.recv_one(tag, fields) {}

        // All ring reads are done before the peer may reuse the space.
        self.intf
            .in_cons
            .store(self.cons_pvt_in.load(Ordering::Relaxed), Ordering::Release);
        self.chan.notify();

        self.in_sem.release();
    }

    /// One attempt: consume a stashed buffer or one ring message.
    /// Returns whether it was the caller's own response.
    fn recv_one(&self, tag: u16, fields: &mut [WireField<'_>]) -> bool {
        if let Some(buf) = self.pool.lock().reqs[tag as usize].data.take() {
            let hdr = Header::from_bytes(buf[..HDR_SIZE as usize].try_into().unwrap());
            let body = &buf[HDR_SIZE as usize..];
            let mut pos = 0;
            let reader = BodyReader::new(
                |dst: &mut [u8]| {
                    dst.copy_from_slice(&body[pos..pos + dst.len()]);
                    pos += dst.len();
                },
                hdr.size - HDR_SIZE,
            );
            self.finish_decode(tag, hdr.cmd, reader, fields);
            return true;
        }

        while self.ring_in_data() < HDR_SIZE {
            self.chan.wait();
        }
        let cons = self.cons_pvt_in.load(Ordering::Relaxed);
        let mut hb = [0u8; HDR_SIZE as usize];
        self.data_in.read(cons, &mut hb);
        self.cons_pvt_in
            .store(cons.wrapping_add(HDR_SIZE), Ordering::Relaxed);
        let hdr = Header::from_bytes(&hb);
        if hdr.size < HDR_SIZE {
            // The header itself is consumed; the declared size must not
            // move the consumer backwards over it.
            log::warn!("illegal response: undersized message ({} bytes)", hdr.size);
            return false;
        }
        let body_len = hdr.size - HDR_SIZE;

        while self.ring_in_data() < body_len {
            self.chan.wait();
        }

        let rtag = hdr.tag as usize;
        let mut pool = self.pool.lock();
        if rtag >= N_REQS || !pool.reqs[rtag].inflight {
            drop(pool);
            log::warn!(
                "illegal response: {}",
                if rtag >= N_REQS {
                    "tag out of bounds"
                } else {
                    "request not pending"
                }
            );
            self.cons_pvt_in
                .store(cons.wrapping_add(hdr.size), Ordering::Relaxed);
            return false;
        }
        pool.reqs[rtag].inflight = false;

        if rtag != tag as usize {
            // Someone else's answer; take it off the ring whole.
            let mut buf = alloc::vec![0u8; hdr.size as usize];
            buf[..HDR_SIZE as usize].copy_from_slice(&hb);
            self.data_in
                .read(cons.wrapping_add(HDR_SIZE), &mut buf[HDR_SIZE as usize..]);
            pool.reqs[rtag].data = Some(buf);
            drop(pool);
            self.cons_pvt_in
                .store(cons.wrapping_add(hdr.size), Ordering::Relaxed);
            return false;
        }
        drop(pool);

        // Our own: decode straight off the ring.
        let ring = &self.data_in;
        let mut pos = cons.wrapping_add(HDR_SIZE);
        let reader = BodyReader::new(
            |dst: &mut [u8]| {
                ring.read(pos, dst);
                pos = pos.wrapping_add(dst.len() as u32);
            },
            body_len,
        );
        self.finish_decode(tag, hdr.cmd, reader, fields);
        self.cons_pvt_in
            .store(cons.wrapping_add(hdr.size), Ordering::Relaxed);
        true
    }

    /// Classify the response and decode on success.
    fn finish_decode<F: FnMut(&mut [u8])>(
        &self,
        tag: u16,
        resp_cmd: u8,
        mut reader: BodyReader<F>,
        fields: &mut [WireField<'_>],
    ) {
        let req_cmd = self.pool.lock().reqs[tag as usize].cmd;
        let result = if resp_cmd == CMD_ERROR {
            let (msg, status) = reader.error_body();
            log::warn!("request {req_cmd} resulted in \"{msg}\" (status {status})");
            Some(P9Error::Io)
        } else if resp_cmd != req_cmd + 1 {
            log::warn!(
                "illegal response: wrong return type ({resp_cmd} instead of {})",
                req_cmd + 1
            );
            Some(P9Error::IllegalResponse)
        } else {
            reader.decode(fields);
            None
        };
        self.pool.lock().reqs[tag as usize].result = result;
    }
}
