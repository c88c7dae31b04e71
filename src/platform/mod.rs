//! Host-provided services.
//!
//! The engine never reads the OS clock, battery, or disk directly; the host
//! injects these behind small traits so the core stays testable and
//! portable. Defaults cover the common case: a monotonic clock, a static
//! device monitor, and an in-memory blob store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::protocol::NodeId;
use crate::transport::TransportKind;

/// Blob store key under which the node id persists across restarts
pub const NODE_ID_KEY: &str = "node_id";

/// Monotonic milliseconds source
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Default clock: milliseconds since construction
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Device status the platform layer feeds into the engine
pub trait DeviceMonitor: Send + Sync {
    fn battery_percent(&self) -> u8;
    fn is_online(&self) -> bool;
    fn transport_available(&self, kind: TransportKind) -> bool;
}

/// Host-settable device monitor; hosts update it as OS callbacks fire.
pub struct StaticDeviceMonitor {
    battery: AtomicU8,
    online: AtomicBool,
    unavailable: Mutex<Vec<TransportKind>>,
}

impl StaticDeviceMonitor {
    pub fn new() -> Self {
        Self {
            battery: AtomicU8::new(100),
            online: AtomicBool::new(true),
            unavailable: Mutex::new(Vec::new()),
        }
    }

    pub fn set_battery(&self, percent: u8) {
        self.battery.store(percent.min(100), Ordering::Relaxed);
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Relaxed);
    }

    pub fn set_transport_available(&self, kind: TransportKind, available: bool) {
        let mut unavailable = self.unavailable.lock();
        if available {
            unavailable.retain(|k| *k != kind);
        } else if !unavailable.contains(&kind) {
            unavailable.push(kind);
        }
    }
}

impl Default for StaticDeviceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceMonitor for StaticDeviceMonitor {
    fn battery_percent(&self) -> u8 {
        self.battery.load(Ordering::Relaxed)
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    fn transport_available(&self, kind: TransportKind) -> bool {
        !self.unavailable.lock().contains(&kind)
    }
}

/// Persistent key-value blob store supplied by the host. Used only for the
/// node id and, optionally, verified pairing records.
pub trait BlobStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// In-memory blob store (contents die with the process)
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self {
            blobs: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobStore for MemoryBlobStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.lock().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.blobs.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.blobs.lock().remove(key);
        Ok(())
    }
}

/// Bundle of host services handed to the engine at construction
#[derive(Clone)]
pub struct Platform {
    pub clock: Arc<dyn Clock>,
    pub monitor: Arc<dyn DeviceMonitor>,
    pub store: Arc<dyn BlobStore>,
}

impl Platform {
    /// Default in-process platform: monotonic clock, everything available,
    /// memory-backed store.
    pub fn in_process() -> Self {
        Self {
            clock: Arc::new(MonotonicClock::new()),
            monitor: Arc::new(StaticDeviceMonitor::new()),
            store: Arc::new(MemoryBlobStore::new()),
        }
    }

    /// Fetch the persisted node id or mint and persist a fresh one.
    pub fn load_or_create_node_id(&self) -> Result<NodeId> {
        if let Some(bytes) = self.store.get(NODE_ID_KEY)? {
            if bytes.len() == 16 {
                let mut id: NodeId = [0u8; 16];
                id.copy_from_slice(&bytes);
                return Ok(id);
            }
        }
        let mut id: NodeId = [0u8; 16];
        getrandom::getrandom(&mut id)
            .map_err(|e| Error::Fatal(format!("host RNG failure: {}", e)))?;
        self.store.put(NODE_ID_KEY, &id)?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_is_stable_across_loads() {
        let platform = Platform::in_process();
        let first = platform.load_or_create_node_id().unwrap();
        let second = platform.load_or_create_node_id().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn monitor_tracks_transport_availability() {
        let monitor = StaticDeviceMonitor::new();
        assert!(monitor.transport_available(TransportKind::DirectLan));
        monitor.set_transport_available(TransportKind::DirectLan, false);
        assert!(!monitor.transport_available(TransportKind::DirectLan));
        monitor.set_transport_available(TransportKind::DirectLan, true);
        assert!(monitor.transport_available(TransportKind::DirectLan));
    }

    #[test]
    fn monotonic_clock_advances() {
        let clock = MonotonicClock::new();
        let a = clock.now_ms();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(clock.now_ms() >= a);
    }
}
