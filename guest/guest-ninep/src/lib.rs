//! # 9P frontend over a shared ring
//!
//! The paravirtual 9P device: two flexible byte rings in shared memory
//! (one per direction), a fixed pool of outstanding-request slots
//! correlated by wire tag, and the 9P-2000.u request builders on top.
//!
//! ```text
//!  version/attach/walk/open/create/stat/read/write/clunk   (proto)
//! ┌────────────────────────────────▼───────────────────────────────┐
//! │                    Request multiplexer                         │
//! │  tag-correlated slots · out-of-order responses stashed per     │
//! │  slot · one composer / one header-consumer at a time           │
//! ├────────────────────────────────────────────────────────────────┤
//! │                     Shared byte rings                          │
//! │  private prod/cons indices, published with release ordering    │
//! │  only when a whole message is on the ring                      │
//! └────────────────────────────────▲───────────────────────────────┘
//!            backend domain (granted pages + event channel)
//! ```
//!
//! The connection handshake with the backend runs over a key-value
//! config store ([`ConfigStore`]); notification uses an event channel
//! ([`EventChannel`]). Both are trait seams: the kernel wires in its
//! Xenbus and event-channel bindings, tests wire in mocks and plain
//! thread yields.
//!
//! No receive timeout exists at this layer. A backend that never answers
//! a tag blocks that caller forever while other callers keep working;
//! bounded waits belong to the layer above.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod device;
mod path;
mod proto;
mod ring;
#[cfg(test)]
mod testutil;
mod transport;
mod wire;

pub use device::{
    ConfigError, ConfigStore, ConnectionState, DeviceInfo, await_connected, publish_ring,
    query_backend, shutdown,
};
pub use path::{path_canonical, split_path};
pub use proto::{Dev9p, Fid, OpenMode, P9Stat, ROOT_FID};
pub use ring::{DEFAULT_RING_ORDER, IntfPage, RingBuffer, ring_size};
pub use transport::{N_REQS, Transport};
pub use wire::{P9_VERSION, Qid, WireArg, WireField};

use thiserror::Error;

/// Notification and blocking against the peer domain.
///
/// `wait` is the cooperative suspension point: it returns when an event
/// *may* have arrived and the caller re-checks its condition. Spurious
/// wakeups are fine.
pub trait EventChannel: Sync {
    /// Notify the peer that ring state changed.
    fn notify(&self);

    /// Block (cooperatively) until the peer may have changed ring state.
    fn wait(&self);
}

/// Local error classification for 9P operations.
///
/// Peer-reported errors collapse into [`P9Error::Io`]; the peer's error
/// text is logged, not preserved.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum P9Error {
    /// All request slots are in flight.
    #[error("no free request slot")]
    NoFreeRequest,
    /// The peer answered with an error response.
    #[error("I/O error reported by peer")]
    Io,
    /// The response command did not match the request.
    #[error("illegal response type")]
    IllegalResponse,
    /// Version negotiation found no common protocol.
    #[error("protocol version not supported")]
    NotSupported,
    /// No free fid for another open file.
    #[error("out of fids")]
    NoFreeFid,
    /// A walk step failed.
    #[error("path component not found")]
    NotFound,
    /// The path is not canonical.
    #[error("invalid path")]
    InvalidPath,
    /// The config-store handshake failed.
    #[error("handshake failed: {0}")]
    Handshake(&'static str),
    /// Config store access failed.
    #[error("config store: {0}")]
    Store(#[from] ConfigError),
}
