//! SETTINGS values and the process-wide persisted-settings store.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::origin::Origin;

/// SETTINGS parameter identifiers (SPDY/3.1).
pub mod ids {
    pub const UPLOAD_BANDWIDTH: u32 = 1;
    pub const DOWNLOAD_BANDWIDTH: u32 = 2;
    pub const ROUND_TRIP_TIME: u32 = 3;
    pub const MAX_CONCURRENT_STREAMS: u32 = 4;
    pub const CURRENT_CWND: u32 = 5;
    pub const DOWNLOAD_RETRANS_RATE: u32 = 6;
    pub const INITIAL_WINDOW_SIZE: u32 = 7;
    pub const CLIENT_CERTIFICATE_VECTOR_SIZE: u32 = 8;
}

/// A single SETTINGS entry as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Setting {
    pub id: u32,
    pub value: u32,
    /// Sender asks the receiver to persist this value for the origin.
    pub persist_value: bool,
    /// Receiver echoes a previously persisted value. Illegal from a server.
    pub persisted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StoredValue {
    value: u32,
    persist_value: bool,
    persisted: bool,
}

/// A sparse mapping from setting id to value with per-entry flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpdySettings {
    entries: BTreeMap<u32, StoredValue>,
}

impl SpdySettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_value(&mut self, id: u32, value: u32) {
        self.set(Setting {
            id,
            value,
            persist_value: false,
            persisted: false,
        });
    }

    pub fn set(&mut self, setting: Setting) {
        self.entries.insert(
            setting.id,
            StoredValue {
                value: setting.value,
                persist_value: setting.persist_value,
                persisted: setting.persisted,
            },
        );
    }

    pub fn get(&self, id: u32) -> Option<u32> {
        self.entries.get(&id).map(|v| v.value)
    }

    pub fn remove(&mut self, id: u32) {
        self.entries.remove(&id);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Entries in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = Setting> + '_ {
        self.entries.iter().map(|(id, v)| Setting {
            id: *id,
            value: v.value,
            persist_value: v.persist_value,
            persisted: v.persisted,
        })
    }
}

/// Process-wide mapping from origin to persisted remote settings.
///
/// A cloneable handle; the lock is held only across a single read or
/// write, never across an await point. Persistence is process-lifetime
/// only. Each session gets an injected handle rather than reaching for a
/// global.
#[derive(Debug, Clone, Default)]
pub struct SettingsStore {
    inner: Arc<Mutex<HashMap<Origin, SpdySettings>>>,
}

impl SettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Persist a single value for an origin.
    pub fn set(&self, origin: &Origin, id: u32, value: u32) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(origin.clone()).or_default().set_value(id, value);
    }

    /// Copy-on-access read of an origin's persisted settings.
    pub fn get(&self, origin: &Origin) -> Option<SpdySettings> {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.get(origin).cloned()
    }

    /// Drop all persisted settings for an origin.
    pub fn clear(&self, origin: &Origin) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.remove(origin);
    }
}
