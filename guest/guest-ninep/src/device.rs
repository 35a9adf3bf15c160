//! Backend handshake over the key-value config store.
//!
//! Frontend and backend negotiate through a shared tree of string keys
//! plus a per-side `state` key that walks a fixed ladder:
//!
//! ```text
//! Unknown → Initialising → InitWait → Initialised → Connected
//!                                                      │
//!                                           Closing → Closed
//! ```
//!
//! The frontend reads the backend's static keys while the backend sits
//! in `InitWait`, publishes its ring in one transaction together with
//! `Initialised`, and the two sides then meet in `Connected`. Teardown
//! walks both sides through `Closing` to `Closed` in lock step.

use alloc::format;
use alloc::string::String;

use guest_gnttab::GrantRef;
use thiserror::Error;

use crate::ring::DEFAULT_RING_ORDER;
use crate::P9Error;

/// Position on the handshake ladder, shared with the peer through the
/// store's `state` keys.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
#[repr(u32)]
pub enum ConnectionState {
    Unknown = 0,
    Initialising = 1,
    InitWait = 2,
    Initialised = 3,
    Connected = 4,
    Closing = 5,
    Closed = 6,
}

impl ConnectionState {
    #[must_use]
    pub fn from_value(v: u32) -> Self {
        match v {
            1 => Self::Initialising,
            2 => Self::InitWait,
            3 => Self::Initialised,
            4 => Self::Connected,
            5 => Self::Closing,
            6 => Self::Closed,
            _ => Self::Unknown,
        }
    }
}

/// Config store access failure.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum ConfigError {
    #[error("key not found")]
    NotFound,
    #[error("permission denied")]
    Denied,
    #[error("malformed value")]
    Malformed,
}

/// The key-value store both domains handshake through.
///
/// The kernel binds this to its Xenbus client; tests use an in-memory
/// map. `wait_state_change` blocks until the state under `path` differs
/// from `current` and returns the new state; spurious wakeups are
/// handled by the caller re-checking.
pub trait ConfigStore: Sync {
    fn read(&self, path: &str) -> Result<String, ConfigError>;

    fn write(&self, path: &str, value: &str) -> Result<(), ConfigError>;

    /// Write several keys in one transaction; all or none become
    /// visible.
    fn write_many(&self, entries: &[(&str, &str)]) -> Result<(), ConfigError>;

    fn read_state(&self, path: &str) -> ConnectionState;

    fn write_state(&self, path: &str, state: ConnectionState) -> Result<(), ConfigError>;

    fn wait_state_change(&self, path: &str, current: ConnectionState) -> ConnectionState;
}

/// Everything learned about one device during [`query_backend`].
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    /// The frontend's own directory in the store.
    pub nodename: String,
    /// The backend's directory in the store.
    pub backend: String,
    /// Domain hosting the backend; grants are issued to it.
    pub backend_id: u32,
    /// Mount tag identifying the export.
    pub tag: String,
    /// Agreed ring order, clamped to [`DEFAULT_RING_ORDER`].
    pub ring_order: usize,
}

fn parse_u32(v: &str) -> Result<u32, P9Error> {
    v.trim().parse().map_err(|_| P9Error::Handshake("malformed number in store"))
}

/// Wait until the state under `path` reaches `want`.
///
/// A peer that moves past `want` (a backend closing while we wait for
/// it to connect) fails the wait instead of blocking forever.
fn wait_for(store: &dyn ConfigStore, path: &str, want: ConnectionState) -> Result<(), P9Error> {
    let mut state = store.read_state(path);
    while state != want {
        if state > want {
            log::warn!("peer at {path} reached {state:?} while waiting for {want:?}");
            return Err(P9Error::Handshake("peer gave up"));
        }
        state = store.wait_state_change(path, state);
    }
    Ok(())
}

/// Locate the backend and read its static configuration.
///
/// Blocks until the backend reaches `InitWait`, then checks that it
/// speaks protocol version 1 and agrees on a ring order.
pub fn query_backend(store: &dyn ConfigStore, nodename: &str) -> Result<DeviceInfo, P9Error> {
    let backend_id = parse_u32(&store.read(&format!("{nodename}/backend-id"))?)?;
    let backend = store.read(&format!("{nodename}/backend"))?;
    let tag = store.read(&format!("{nodename}/tag"))?;

    wait_for(store, &backend, ConnectionState::InitWait)?;

    let max_order = parse_u32(&store.read(&format!("{backend}/max-ring-page-order"))?)?;
    let ring_order = (max_order as usize).min(DEFAULT_RING_ORDER);

    let versions = store.read(&format!("{backend}/versions"))?;
    if !versions.split(',').any(|v| v.trim() == "1") {
        log::warn!("backend versions \"{versions}\" lack version 1");
        return Err(P9Error::Handshake("no common protocol version"));
    }

    Ok(DeviceInfo {
        nodename: String::from(nodename),
        backend,
        backend_id,
        tag,
        ring_order,
    })
}

/// Publish the ring under the frontend's directory and move to
/// `Initialised`.
///
/// `intf_ref` is the grant of the interface page; the data-page grants
/// live inside that page. All keys land in one transaction so the
/// backend never sees a half-published ring.
pub fn publish_ring(
    store: &dyn ConfigStore,
    info: &DeviceInfo,
    intf_ref: GrantRef,
    event_channel: u32,
) -> Result<(), P9Error> {
    let node = &info.nodename;
    let ring_ref = format!("{}", intf_ref.0);
    let channel = format!("{event_channel}");
    let keys = [
        format!("{node}/version"),
        format!("{node}/num-rings"),
        format!("{node}/ring-ref0"),
        format!("{node}/event-channel-0"),
    ];
    store.write_many(&[
        (keys[0].as_str(), "1"),
        (keys[1].as_str(), "1"),
        (keys[2].as_str(), ring_ref.as_str()),
        (keys[3].as_str(), channel.as_str()),
    ])?;
    store.write_state(node, ConnectionState::Initialised)?;
    Ok(())
}

/// Wait for the backend to connect, then connect our side.
pub fn await_connected(store: &dyn ConfigStore, info: &DeviceInfo) -> Result<(), P9Error> {
    wait_for(store, &info.backend, ConnectionState::Connected)?;
    store.write_state(&info.nodename, ConnectionState::Connected)?;
    Ok(())
}

/// Tear the connection down in lock step with the backend.
pub fn shutdown(store: &dyn ConfigStore, info: &DeviceInfo) -> Result<(), P9Error> {
    store.write_state(&info.nodename, ConnectionState::Closing)?;
    wait_for(store, &info.backend, ConnectionState::Closing)?;
    store.write_state(&info.nodename, ConnectionState::Closed)?;
    wait_for(store, &info.backend, ConnectionState::Closed)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory store; waiting yields, real threads make changes
    /// visible.
    struct MockStore {
        map: Mutex<HashMap<String, String>>,
    }

    impl MockStore {
        fn new(entries: &[(&str, &str)]) -> Self {
            Self {
                map: Mutex::new(
                    entries
                        .iter()
                        .map(|(k, v)| (String::from(*k), String::from(*v)))
                        .collect(),
                ),
            }
        }
    }

    impl ConfigStore for MockStore {
        fn read(&self, path: &str) -> Result<String, ConfigError> {
            self.map
                .lock()
                .unwrap()
                .get(path)
                .cloned()
                .ok_or(ConfigError::NotFound)
        }

        fn write(&self, path: &str, value: &str) -> Result<(), ConfigError> {
            self.map
                .lock()
                .unwrap()
                .insert(String::from(path), String::from(value));
            Ok(())
        }

        fn write_many(&self, entries: &[(&str, &str)]) -> Result<(), ConfigError> {
            let mut map = self.map.lock().unwrap();
            for (k, v) in entries {
                map.insert(String::from(*k), String::from(*v));
            }
            Ok(())
        }

        fn read_state(&self, path: &str) -> ConnectionState {
            match self.read(&format!("{path}/state")) {
                Ok(v) => ConnectionState::from_value(v.parse().unwrap_or(0)),
                Err(_) => ConnectionState::Unknown,
            }
        }

        fn write_state(&self, path: &str, state: ConnectionState) -> Result<(), ConfigError> {
            self.write(&format!("{path}/state"), &format!("{}", state as u32))
        }

        fn wait_state_change(&self, path: &str, current: ConnectionState) -> ConnectionState {
            loop {
                let state = self.read_state(path);
                if state != current {
                    return state;
                }
                std::thread::yield_now();
            }
        }
    }

    const FE: &str = "device/9pfs/0";
    const BE: &str = "backend/9pfs/1/0";

    fn store_with_backend(max_order: &str, versions: &str) -> MockStore {
        let store = MockStore::new(&[
            ("device/9pfs/0/backend-id", "1"),
            ("device/9pfs/0/backend", BE),
            ("device/9pfs/0/tag", "shared"),
            ("backend/9pfs/1/0/max-ring-page-order", max_order),
            ("backend/9pfs/1/0/versions", versions),
        ]);
        store.write_state(BE, ConnectionState::InitWait).unwrap();
        store
    }

    #[test]
    fn query_clamps_ring_order() {
        let store = store_with_backend("9", "1,2");
        let info = query_backend(&store, FE).unwrap();
        assert_eq!(info.backend, BE);
        assert_eq!(info.backend_id, 1);
        assert_eq!(info.tag, "shared");
        assert_eq!(info.ring_order, DEFAULT_RING_ORDER);

        let store = store_with_backend("2", "1");
        assert_eq!(query_backend(&store, FE).unwrap().ring_order, 2);
    }

    #[test]
    fn query_rejects_unknown_versions() {
        let store = store_with_backend("4", "2,3");
        assert_eq!(
            query_backend(&store, FE).unwrap_err(),
            P9Error::Handshake("no common protocol version")
        );
    }

    #[test]
    fn query_waits_for_init_wait() {
        let store = store_with_backend("4", "1");
        store.write_state(BE, ConnectionState::Initialising).unwrap();

        std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::yield_now();
                store.write_state(BE, ConnectionState::InitWait).unwrap();
            });
            assert!(query_backend(&store, FE).is_ok());
        });
    }

    #[test]
    fn connect_and_shutdown_in_lock_step() {
        let store = store_with_backend("4", "1");
        let info = query_backend(&store, FE).unwrap();

        std::thread::scope(|s| {
            let store = &store;
            s.spawn(move || {
                // The backend side: connect once the ring is published,
                // mirror the teardown.
                while store.read_state(FE) != ConnectionState::Initialised {
                    std::thread::yield_now();
                }
                assert_eq!(store.read(&format!("{FE}/ring-ref0")).unwrap(), "42");
                assert_eq!(store.read(&format!("{FE}/event-channel-0")).unwrap(), "3");
                assert_eq!(store.read(&format!("{FE}/num-rings")).unwrap(), "1");
                store.write_state(BE, ConnectionState::Connected).unwrap();

                while store.read_state(FE) != ConnectionState::Closing {
                    std::thread::yield_now();
                }
                store.write_state(BE, ConnectionState::Closing).unwrap();
                while store.read_state(FE) != ConnectionState::Closed {
                    std::thread::yield_now();
                }
                store.write_state(BE, ConnectionState::Closed).unwrap();
            });

            publish_ring(store, &info, GrantRef(42), 3).unwrap();
            await_connected(store, &info).unwrap();
            assert_eq!(store.read_state(FE), ConnectionState::Connected);

            shutdown(store, &info).unwrap();
            assert_eq!(store.read_state(BE), ConnectionState::Closed);
        });
    }

    #[test]
    fn closing_backend_fails_the_connect_wait() {
        let store = store_with_backend("4", "1");
        let info = query_backend(&store, FE).unwrap();
        store.write_state(BE, ConnectionState::Closing).unwrap();
        assert_eq!(
            await_connected(&store, &info),
            Err(P9Error::Handshake("peer gave up"))
        );
    }
}
