//! 9P-2000.u request builders over the transport.
//!
//! Each builder claims one request slot, sends, waits for its tagged
//! response, reads the slot result, and releases the slot. Read and
//! write split the caller's range into chunks bounded by the negotiated
//! maximum message size, reusing one slot across the whole loop.

use alloc::string::String;

use core::sync::atomic::{AtomicU32, Ordering};

use guest_sync::SpinLock;

use crate::transport::Transport;
use crate::wire::{
    CMD_ATTACH, CMD_CLUNK, CMD_CREATE, CMD_OPEN, CMD_READ, CMD_STAT, CMD_VERSION, CMD_WALK,
    CMD_WRITE, HDR_SIZE, P9_VERSION, Qid, WireArg, WireField,
};
use crate::{P9Error, ring_size};

/// The fid every connection starts from; attached to the export root and
/// never clunked by file operations.
pub const ROOT_FID: Fid = Fid(0);

/// A file handle in the 9P sense: a small integer the server associates
/// with a walked-to file.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(transparent)]
pub struct Fid(pub u32);

/// Open mode on the wire.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct OpenMode(pub u8);

impl OpenMode {
    pub const READ: Self = Self(0);
    pub const WRITE: Self = Self(1);
    pub const RDWR: Self = Self(2);

    /// Truncate on open.
    #[must_use]
    pub const fn truncate(self) -> Self {
        Self(self.0 | 16)
    }
}

/// Decoded stat response (9P2000.u extended form).
#[derive(Clone, Debug, Default)]
pub struct P9Stat {
    pub size: u16,
    pub kind: u16,
    pub dev: u32,
    pub qid: Qid,
    pub mode: u32,
    pub atime: u32,
    pub mtime: u32,
    pub length: u64,
    pub name: String,
    pub uid: String,
    pub gid: String,
    pub muid: String,
    pub extension: String,
    pub n_uid: u32,
    pub n_gid: u32,
    pub n_muid: u32,
}

/// One connected 9P device.
pub struct Dev9p<'a> {
    tr: Transport<'a>,
    /// Largest message the backend accepts, from version negotiation.
    msize_max: AtomicU32,
    /// One bit per allocatable fid; bit n is fid n+1, fid 0 is the root.
    fid_mask: SpinLock<u64>,
}

impl<'a> Dev9p<'a> {
    #[must_use]
    pub fn new(tr: Transport<'a>) -> Self {
        Self {
            tr,
            msize_max: AtomicU32::new(0),
            fid_mask: SpinLock::new(!0),
        }
    }

    #[must_use]
    pub fn transport(&self) -> &Transport<'a> {
        &self.tr
    }

    #[must_use]
    pub fn msize_max(&self) -> u32 {
        self.msize_max.load(Ordering::Relaxed)
    }

    /// Claim a fid for a new file handle.
    pub fn get_fid(&self) -> Result<Fid, P9Error> {
        let mut mask = self.fid_mask.lock();
        let bit = mask.trailing_zeros();
        if bit == 64 {
            return Err(P9Error::NoFreeFid);
        }
        *mask &= !(1u64 << bit);
        Ok(Fid(bit + 1))
    }

    /// Return a fid; the root fid is never pooled.
    pub fn put_fid(&self, fid: Fid) {
        if fid != ROOT_FID {
            *self.fid_mask.lock() |= 1u64 << (fid.0 - 1);
        }
    }

    /// Negotiate protocol version and maximum message size.
    ///
    /// A backend answering with any other version string fails the
    /// negotiation even though the wire exchange succeeded.
    pub fn version(&self) -> Result<(), P9Error> {
        let msize = ring_size(self.tr.ring_order()) / 2;
        let tag = self.tr.alloc_req(CMD_VERSION)?;
        self.tr
            .send(tag, &[WireArg::U32(msize), WireArg::Str(P9_VERSION)]);

        let mut msize_max = 0u32;
        let mut version = String::new();
        self.tr.recv(
            tag,
            &mut [WireField::U32(&mut msize_max), WireField::Str(&mut version)],
        );
        let ret = self.tr.req_result(tag);
        self.tr.release_req(tag);
        ret?;

        if version != P9_VERSION {
            return Err(P9Error::NotSupported);
        }
        self.msize_max.store(msize_max, Ordering::Relaxed);
        Ok(())
    }

    /// Attach the root fid to the export.
    pub fn attach(&self) -> Result<Qid, P9Error> {
        let tag = self.tr.alloc_req(CMD_ATTACH)?;
        self.tr.send(
            tag,
            &[
                WireArg::U32(ROOT_FID.0),
                WireArg::U32(0),
                WireArg::Str("root"),
                WireArg::Str("root"),
                WireArg::U32(0),
            ],
        );
        let mut qid = Qid::default();
        self.tr.recv(tag, &mut [WireField::Qid(&mut qid)]);
        let ret = self.tr.req_result(tag);
        self.tr.release_req(tag);
        ret.map(|()| qid)
    }

    /// Associate `newfid` with `name` under `fid`; empty `name` clones
    /// `fid`.
    pub fn walk(&self, fid: Fid, newfid: Fid, name: &str) -> Result<(), P9Error> {
        let tag = self.tr.alloc_req(CMD_WALK)?;
        let mut nqid = 0u16;
        if name.is_empty() {
            self.tr.send(
                tag,
                &[
                    WireArg::U32(fid.0),
                    WireArg::U32(newfid.0),
                    WireArg::U16(0),
                ],
            );
            self.tr.recv(tag, &mut [WireField::U16(&mut nqid)]);
        } else {
            self.tr.send(
                tag,
                &[
                    WireArg::U32(fid.0),
                    WireArg::U32(newfid.0),
                    WireArg::U16(1),
                    WireArg::Str(name),
                ],
            );
            let mut qid = Qid::default();
            self.tr
                .recv(tag, &mut [WireField::U16(&mut nqid), WireField::Qid(&mut qid)]);
        }
        let ret = self.tr.req_result(tag);
        self.tr.release_req(tag);
        ret
    }

    pub fn open(&self, fid: Fid, mode: OpenMode) -> Result<(), P9Error> {
        let tag = self.tr.alloc_req(CMD_OPEN)?;
        self.tr.send(tag, &[WireArg::U32(fid.0), WireArg::U8(mode.0)]);
        let mut qid = Qid::default();
        let mut iounit = 0u32;
        self.tr.recv(
            tag,
            &mut [WireField::Qid(&mut qid), WireField::U32(&mut iounit)],
        );
        let ret = self.tr.req_result(tag);
        self.tr.release_req(tag);
        ret
    }

    /// Create `name` under the directory `fid` walks to; `fid` ends up
    /// open on the new file.
    pub fn create(
        &self,
        fid: Fid,
        name: &str,
        perm: u32,
        mode: OpenMode,
    ) -> Result<(), P9Error> {
        let tag = self.tr.alloc_req(CMD_CREATE)?;
        self.tr.send(
            tag,
            &[
                WireArg::U32(fid.0),
                WireArg::Str(name),
                WireArg::U32(perm),
                WireArg::U8(mode.0),
                WireArg::Str(""),
            ],
        );
        let mut qid = Qid::default();
        let mut iounit = 0u32;
        self.tr.recv(
            tag,
            &mut [WireField::Qid(&mut qid), WireField::U32(&mut iounit)],
        );
        let ret = self.tr.req_result(tag);
        self.tr.release_req(tag);
        ret
    }

    pub fn clunk(&self, fid: Fid) -> Result<(), P9Error> {
        let tag = self.tr.alloc_req(CMD_CLUNK)?;
        self.tr.send(tag, &[WireArg::U32(fid.0)]);
        self.tr.recv(tag, &mut []);
        let ret = self.tr.req_result(tag);
        self.tr.release_req(tag);
        ret
    }

    pub fn stat(&self, fid: Fid) -> Result<P9Stat, P9Error> {
        let tag = self.tr.alloc_req(CMD_STAT)?;
        self.tr.send(tag, &[WireArg::U32(fid.0)]);

        let mut stat = P9Stat::default();
        let mut total = 0u16;
        self.tr.recv(
            tag,
            &mut [
                WireField::U16(&mut total),
                WireField::U16(&mut stat.size),
                WireField::U16(&mut stat.kind),
                WireField::U32(&mut stat.dev),
                WireField::Qid(&mut stat.qid),
                WireField::U32(&mut stat.mode),
                WireField::U32(&mut stat.atime),
                WireField::U32(&mut stat.mtime),
                WireField::U64(&mut stat.length),
                WireField::Str(&mut stat.name),
                WireField::Str(&mut stat.uid),
                WireField::Str(&mut stat.gid),
                WireField::Str(&mut stat.muid),
                WireField::Str(&mut stat.extension),
                WireField::U32(&mut stat.n_uid),
                WireField::U32(&mut stat.n_gid),
                WireField::U32(&mut stat.n_muid),
            ],
        );
        let ret = self.tr.req_result(tag);
        self.tr.release_req(tag);
        ret.map(|()| stat)
    }

    /// Read up to `data.len()` bytes at `offset`, chunked by the
    /// negotiated message size. A zero-byte response ends the transfer
    /// (end of file); returns bytes actually read.
    pub fn read(&self, fid: Fid, mut offset: u64, data: &mut [u8]) -> Result<usize, P9Error> {
        let tag = self.tr.alloc_req(CMD_READ)?;
        let count_max = self.msize_max() - (HDR_SIZE + 4);
        let mut done = 0usize;

        let result = loop {
            if done == data.len() {
                break Ok(done);
            }
            let count = (data.len() - done).min(count_max as usize) as u32;
            self.tr.send(
                tag,
                &[
                    WireArg::U32(fid.0),
                    WireArg::U64(offset),
                    WireArg::U32(count),
                ],
            );
            let mut got = 0u32;
            self.tr
                .recv(tag, &mut [WireField::Blob(&mut got, &mut data[done..])]);
            if let Err(e) = self.tr.req_result(tag) {
                break Err(e);
            }
            if got == 0 {
                // End of file.
                break Ok(done);
            }
            done += got as usize;
            offset += u64::from(got);
        };

        self.tr.release_req(tag);
        result
    }

    /// Write `data` at `offset`, chunked by the negotiated message
    /// size; returns bytes actually written.
    pub fn write(&self, fid: Fid, mut offset: u64, data: &[u8]) -> Result<usize, P9Error> {
        let tag = self.tr.alloc_req(CMD_WRITE)?;
        let count_max = self.msize_max() - (HDR_SIZE + 4 + 8 + 4);
        let mut done = 0usize;

        let result = loop {
            if done == data.len() {
                break Ok(done);
            }
            let count = (data.len() - done).min(count_max as usize);
            self.tr.send(
                tag,
                &[
                    WireArg::U32(fid.0),
                    WireArg::U64(offset),
                    WireArg::Blob(&data[done..done + count]),
                ],
            );
            let mut written = 0u32;
            self.tr.recv(tag, &mut [WireField::U32(&mut written)]);
            if let Err(e) = self.tr.req_result(tag) {
                break Err(e);
            }
            done += written as usize;
            offset += u64::from(written);
        };

        self.tr.release_req(tag);
        result
    }

    /// Walk `fid` from the root through `parts`, one step per
    /// component. Returns the number of steps that could not be walked
    /// (0 on success); `fid` stays associated with the last step that
    /// worked.
    pub fn walk_from_root(&self, fid: Fid, parts: &[&str]) -> usize {
        let mut curr = ROOT_FID;
        for (i, part) in parts.iter().enumerate() {
            if self.walk(curr, fid, part).is_err() {
                return parts.len() - i;
            }
            curr = fid;
        }
        0
    }
}
