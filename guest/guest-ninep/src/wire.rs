//! 9P wire encoding: the fixed header and the typed value sequences
//! messages are composed of and decoded into.
//!
//! Every message starts with `{ u32 size; u8 cmd; u16 tag }`; integers
//! are little-endian, strings are a `u16` length plus raw bytes, blobs a
//! `u32` length plus raw bytes, and a qid is 13 opaque bytes. A
//! successful response carries the request command plus one;
//! [`CMD_ERROR`] carries a message string and an errno-style status.

use alloc::string::String;
use alloc::vec::Vec;

/// Wire header length.
pub const HDR_SIZE: u32 = 7;

/// Opaque 13-byte file identity: type byte, version word, unique id.
pub type Qid = [u8; 13];

/// Protocol version negotiated with the backend.
pub const P9_VERSION: &str = "9P2000.u";

pub const CMD_VERSION: u8 = 100;
pub const CMD_ATTACH: u8 = 104;
pub const CMD_ERROR: u8 = 107;
pub const CMD_WALK: u8 = 110;
pub const CMD_OPEN: u8 = 112;
pub const CMD_CREATE: u8 = 114;
pub const CMD_READ: u8 = 116;
pub const CMD_WRITE: u8 = 118;
pub const CMD_CLUNK: u8 = 120;
pub const CMD_STAT: u8 = 124;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Header {
    pub size: u32,
    pub cmd: u8,
    pub tag: u16,
}

impl Header {
    #[must_use]
    pub fn to_bytes(self) -> [u8; HDR_SIZE as usize] {
        let mut out = [0u8; HDR_SIZE as usize];
        out[0..4].copy_from_slice(&self.size.to_le_bytes());
        out[4] = self.cmd;
        out[5..7].copy_from_slice(&self.tag.to_le_bytes());
        out
    }

    #[must_use]
    pub fn from_bytes(b: &[u8; HDR_SIZE as usize]) -> Self {
        Self {
            size: u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            cmd: b[4],
            tag: u16::from_le_bytes([b[5], b[6]]),
        }
    }
}

/// One outbound wire value.
#[derive(Copy, Clone, Debug)]
pub enum WireArg<'a> {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    /// Length-prefixed string (`u16` length, no terminator).
    Str(&'a str),
    /// Length-prefixed opaque bytes (`u32` length).
    Blob(&'a [u8]),
}

impl WireArg<'_> {
    /// Encoded size in bytes.
    #[must_use]
    pub fn wire_len(&self) -> u32 {
        match self {
            Self::U8(_) => 1,
            Self::U16(_) => 2,
            Self::U32(_) => 4,
            Self::U64(_) => 8,
            Self::Str(s) => 2 + s.len() as u32,
            Self::Blob(b) => 4 + b.len() as u32,
        }
    }

    /// Append the encoding to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Self::U8(v) => out.push(*v),
            Self::U16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::U32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::U64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Str(s) => {
                out.extend_from_slice(&(s.len() as u16).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            Self::Blob(b) => {
                out.extend_from_slice(&(b.len() as u32).to_le_bytes());
                out.extend_from_slice(b);
            }
        }
    }
}

/// One inbound wire value and where to put it.
#[derive(Debug)]
pub enum WireField<'a> {
    U16(&'a mut u16),
    U32(&'a mut u32),
    U64(&'a mut u64),
    /// Heap-allocated copy of a length-prefixed string.
    Str(&'a mut String),
    /// Length-prefixed bytes into the prefix of a caller buffer; the
    /// received length is stored in the first slot.
    Blob(&'a mut u32, &'a mut [u8]),
    Qid(&'a mut Qid),
}

/// A message body being decoded, bounded by the declared message size.
///
/// Reading past the bound logs and yields zero bytes instead of
/// overrunning; a malformed backend can truncate its own message but
/// not corrupt the guest.
pub struct BodyReader<F> {
    fetch: F,
    remaining: u32,
}

impl<F: FnMut(&mut [u8])> BodyReader<F> {
    /// Wrap a raw byte source (`fetch` fills a buffer from the stream)
    /// with `len` valid bytes.
    pub fn new(fetch: F, len: u32) -> Self {
        Self {
            fetch,
            remaining: len,
        }
    }

    fn copy(&mut self, dst: &mut [u8]) {
        let want = dst.len() as u32;
        let have = want.min(self.remaining);
        if have < want {
            log::warn!("short copy (dropping {} bytes)", want - have);
            dst[have as usize..].fill(0);
        }
        (self.fetch)(&mut dst[..have as usize]);
        self.remaining -= have;
    }

    fn u16(&mut self) -> u16 {
        let mut b = [0u8; 2];
        self.copy(&mut b);
        u16::from_le_bytes(b)
    }

    fn u32(&mut self) -> u32 {
        let mut b = [0u8; 4];
        self.copy(&mut b);
        u32::from_le_bytes(b)
    }

    fn u64(&mut self) -> u64 {
        let mut b = [0u8; 8];
        self.copy(&mut b);
        u64::from_le_bytes(b)
    }

    fn string(&mut self) -> String {
        let len = self.u16();
        let mut buf = alloc::vec![0u8; len as usize];
        self.copy(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Decode a length-prefixed error body: the message text (logged by
    /// the caller) and the errno-style status.
    pub fn error_body(&mut self) -> (String, u32) {
        let msg = self.string();
        let status = self.u32();
        (msg, status)
    }

    /// Decode `fields` in order from the body.
    pub fn decode(&mut self, fields: &mut [WireField<'_>]) {
        for field in fields {
            match field {
                WireField::U16(v) => **v = self.u16(),
                WireField::U32(v) => **v = self.u32(),
                WireField::U64(v) => **v = self.u64(),
                WireField::Str(s) => **s = self.string(),
                WireField::Blob(len, data) => {
                    let n = self.u32();
                    let n = if n as usize > data.len() {
                        log::warn!("blob of {n} bytes exceeds buffer, truncating");
                        data.len() as u32
                    } else {
                        n
                    };
                    **len = n;
                    self.copy(&mut data[..n as usize]);
                }
                WireField::Qid(q) => self.copy(&mut q[..]),
            }
        }
    }
}
