//! IP camera device family for a home-automation hub.
//! Host-driven: the host owns sockets and the RPC transport; this crate owns peers,
//! their parameters, persistence and the maintenance worker.

pub mod catalog;
pub mod central;
pub mod error;
pub mod events;
pub mod family;
pub mod identity;
pub mod params;
pub mod peer;
pub mod protocol;
pub mod scheduler;
pub mod storage;
pub mod url;
pub mod wire;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub use catalog::{Catalog, CatalogError, DeviceDescription, ParameterDescriptor};
pub use central::Central;
pub use error::{Error, Result};
pub use events::{ChannelSink, Event, EventSink, LogSink};
pub use family::{DeviceFamily, IpCamFamily};
pub use identity::SerialNumber;
pub use peer::{OutboundRequest, Peer};
pub use protocol::{ParamsetKind, Value};
pub use scheduler::{Worker, WorkerHandle};
pub use storage::{FileStorage, MemoryStorage, Storage};
pub use url::UrlInfo;

/// Tunables of the registry and the worker.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Time in which every peer should be visited once.
    pub worker_window: Duration,
    /// Worker iterations between interval recalculations.
    pub recalc_threshold: u32,
    /// Worker interval before the first recalculation.
    pub initial_interval: Duration,
    /// Polls while waiting for a deleted peer to be released.
    pub drain_attempts: u32,
    pub drain_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            worker_window: Duration::from_millis(3000),
            recalc_threshold: 10_000,
            initial_interval: Duration::from_millis(10),
            drain_attempts: 600,
            drain_interval: Duration::from_millis(100),
        }
    }
}

/// Where the hub's embedded web server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenInfo {
    pub address: String,
    pub port: u16,
}

impl ListenInfo {
    /// Externally visible URL prefix of one peer's bridge endpoints.
    pub fn peer_prefix(&self, peer_id: u64) -> String {
        let port = if self.port != 80 {
            format!(":{}", self.port)
        } else {
            String::new()
        };
        format!(
            "http://{}{}/{}/{}/",
            self.address,
            port,
            protocol::BRIDGE_NAMESPACE,
            peer_id
        )
    }
}

/// Shared collaborators handed to the registry, every peer and the bridge.
pub struct Context {
    pub storage: Arc<dyn Storage>,
    pub catalog: Arc<Catalog>,
    pub events: Arc<dyn EventSink>,
    pub settings: Settings,
    listen: RwLock<Option<ListenInfo>>,
}

impl Context {
    pub fn new(
        storage: Arc<dyn Storage>,
        catalog: Arc<Catalog>,
        events: Arc<dyn EventSink>,
        settings: Settings,
    ) -> Self {
        Self {
            storage,
            catalog,
            events,
            settings,
            listen: RwLock::new(None),
        }
    }

    pub fn listen_info(&self) -> Option<ListenInfo> {
        self.listen
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_listen_info(&self, info: Option<ListenInfo>) {
        *self.listen.write().unwrap_or_else(PoisonError::into_inner) = info;
    }
}

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_prefix_omits_default_port() {
        let l = ListenInfo {
            address: "10.0.0.2".into(),
            port: 80,
        };
        assert_eq!(l.peer_prefix(4), "http://10.0.0.2/ipcam/4/");
        let l = ListenInfo {
            address: "10.0.0.2".into(),
            port: 2001,
        };
        assert_eq!(l.peer_prefix(4), "http://10.0.0.2:2001/ipcam/4/");
    }
}
