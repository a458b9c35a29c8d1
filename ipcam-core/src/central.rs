//! Peer registry: owns every paired camera, indexed by id and by serial number.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::events::Event;
use crate::identity::SerialNumber;
use crate::peer::Peer;
use crate::protocol::Value;
use crate::{lock, Context, ListenInfo};

#[derive(Default)]
struct PeerMaps {
    by_id: BTreeMap<u64, Arc<Peer>>,
    by_serial: HashMap<String, Arc<Peer>>,
}

/// The family's central. The mutex guards map membership only; each peer locks its own state.
pub struct Central {
    id: u64,
    serial: String,
    ctx: Arc<Context>,
    peers: Mutex<PeerMaps>,
    disposing: AtomicBool,
}

impl Central {
    pub fn new(ctx: Arc<Context>, id: u64, serial: &str) -> Self {
        Self {
            id,
            serial: serial.to_string(),
            ctx,
            peers: Mutex::new(PeerMaps::default()),
            disposing: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Pair a new camera. Returns the new peer id.
    pub fn create_device(&self, device_type: u32, serial: &str) -> Result<u64> {
        let serial = SerialNumber::parse(serial)?;
        if self.peer_by_serial(serial.as_str()).is_some() {
            return Err(Error::AlreadyPaired(serial.to_string()));
        }
        let description = self
            .ctx
            .catalog
            .find(device_type, 0)
            .ok_or(Error::UnsupportedDeviceType(device_type))?;
        let peer = Arc::new(Peer::new(
            self.ctx.clone(),
            self.id,
            serial.clone(),
            device_type,
            0,
            description,
        ));
        {
            // serial first: a visible id must always resolve by serial too
            let mut maps = lock(&self.peers);
            if maps.by_serial.contains_key(serial.as_str()) {
                return Err(Error::AlreadyPaired(serial.to_string()));
            }
            maps.by_serial.insert(serial.to_string(), peer.clone());
        }
        let saved = peer
            .save(false)
            .and_then(|_| peer.initialize_central_config());
        if let Err(e) = saved {
            lock(&self.peers).by_serial.remove(serial.as_str());
            if peer.id() != 0 {
                if let Err(purge) = peer.delete_from_storage() {
                    tracing::error!(serial = %serial, error = %purge, "Could not purge half-created peer");
                }
            }
            return Err(e);
        }
        let id = peer.id();
        lock(&self.peers).by_id.insert(id, peer.clone());
        tracing::info!(peer_id = id, serial = %serial, device_type = %format!("0x{:04X}", device_type), "Added peer");

        self.ctx.events.emit(Event::NewDevices {
            descriptions: peer.device_descriptions(),
        });
        peer.attach_hooks();
        peer.init_http_client();
        Ok(id)
    }

    /// Delete a paired device. Unknown ids are an error here; see [`Central::delete_peer`].
    pub fn delete_device(&self, id: u64) -> Result<()> {
        if self.peer(id).is_none() {
            return Err(Error::UnknownDevice);
        }
        self.delete_peer(id);
        Ok(())
    }

    pub fn delete_device_by_serial(&self, serial: &str) -> Result<()> {
        let peer = self.peer_by_serial(serial).ok_or(Error::UnknownDevice)?;
        let id = peer.id();
        drop(peer);
        self.delete_device(id)
    }

    /// Unlink, drain, purge. A no-op for unknown ids.
    ///
    /// The peer is flagged and removed from both maps first so no new holder can find it,
    /// then this waits for in-flight holders (relays, RPC calls) to release it before its
    /// rows are deleted. A holder that never lets go only delays the purge, it cannot stop it.
    pub fn delete_peer(&self, id: u64) {
        let Some(peer) = self.peer(id) else {
            return;
        };
        peer.set_deleting();
        peer.detach_hooks();
        self.ctx.events.emit(Event::DevicesDeleted {
            ids: vec![id],
            addresses: peer.addresses(),
        });
        {
            let mut maps = lock(&self.peers);
            maps.by_serial.remove(peer.serial().as_str());
            maps.by_id.remove(&id);
        }

        let settings = &self.ctx.settings;
        let mut released = Arc::strong_count(&peer) <= 1;
        for _ in 0..settings.drain_attempts {
            if released {
                break;
            }
            std::thread::sleep(settings.drain_interval);
            released = Arc::strong_count(&peer) <= 1;
        }
        if !released {
            tracing::error!(
                peer_id = id,
                holders = Arc::strong_count(&peer) - 1,
                "Peer is still in use after waiting; deleting anyway"
            );
        }
        if let Err(e) = peer.delete_from_storage() {
            tracing::error!(peer_id = id, error = %e, "Could not purge peer from storage");
        }
        tracing::info!(peer_id = id, serial = %peer.serial(), "Deleted peer");
    }

    pub fn peer(&self, id: u64) -> Option<Arc<Peer>> {
        lock(&self.peers).by_id.get(&id).cloned()
    }

    pub fn peer_by_serial(&self, serial: &str) -> Option<Arc<Peer>> {
        lock(&self.peers).by_serial.get(serial).cloned()
    }

    /// Like [`Central::peer`] but unknown ids are an error.
    pub fn device(&self, id: u64) -> Result<Arc<Peer>> {
        self.peer(id).ok_or(Error::UnknownDevice)
    }

    pub fn peer_count(&self) -> usize {
        lock(&self.peers).by_id.len()
    }

    /// Snapshot of all peers in id order.
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        lock(&self.peers).by_id.values().cloned().collect()
    }

    /// First peer with an id greater than `after`, wrapping around to the lowest id.
    pub fn next_peer(&self, after: Option<u64>) -> Option<Arc<Peer>> {
        let maps = lock(&self.peers);
        let lower = after.map_or(Bound::Unbounded, Bound::Excluded);
        maps.by_id
            .range((lower, Bound::Unbounded))
            .next()
            .or_else(|| maps.by_id.iter().next())
            .map(|(_, p)| p.clone())
    }

    /// Device descriptions of every peer.
    pub fn list_devices(&self) -> Vec<Value> {
        self.peers()
            .iter()
            .flat_map(|p| p.device_descriptions())
            .collect()
    }

    /// Rebuild all peers of this central from storage. Rows that no longer resolve are skipped.
    pub fn load_peers(&self) -> Result<usize> {
        let rows = self.ctx.storage.peers(self.id)?;
        let mut loaded = 0;
        for row in rows {
            let Some(description) = self.ctx.catalog.find(row.device_type, row.firmware) else {
                tracing::error!(
                    peer_id = row.id,
                    device_type = %format!("0x{:04X}", row.device_type),
                    firmware = row.firmware,
                    "Could not load peer: device type not supported"
                );
                continue;
            };
            let peer = match Peer::load(self.ctx.clone(), &row, description) {
                Ok(p) => Arc::new(p),
                Err(e) => {
                    tracing::error!(peer_id = row.id, error = %e, "Could not load peer");
                    continue;
                }
            };
            {
                let mut maps = lock(&self.peers);
                if maps.by_serial.contains_key(peer.serial().as_str())
                    || maps.by_id.contains_key(&peer.id())
                {
                    tracing::error!(peer_id = row.id, serial = %row.serial, "Duplicate peer in storage");
                    continue;
                }
                maps.by_serial
                    .insert(peer.serial().to_string(), peer.clone());
                maps.by_id.insert(peer.id(), peer.clone());
            }
            peer.attach_hooks();
            loaded += 1;
        }
        tracing::info!(count = loaded, "Loaded peers");
        Ok(loaded)
    }

    /// Persist every peer owned by this central.
    pub fn save_peers(&self, full: bool) {
        for peer in self.peers() {
            if peer.parent_id() != self.id {
                continue;
            }
            if let Err(e) = peer.save(full) {
                tracing::error!(peer_id = peer.id(), error = %e, "Could not save peer");
            }
        }
    }

    pub fn hub_started(&self) {
        for peer in self.peers() {
            peer.hub_started();
        }
    }

    pub fn hub_shutting_down(&self) {
        for peer in self.peers() {
            peer.hub_shutting_down();
        }
    }

    /// The bridge's listener moved: republish every peer's external URLs.
    pub fn listen_changed(&self, listen: ListenInfo) {
        if self.ctx.listen_info().as_ref() == Some(&listen) {
            return;
        }
        self.ctx.set_listen_info(Some(listen));
        for peer in self.peers() {
            peer.init_http_client();
        }
    }

    pub fn is_disposing(&self) -> bool {
        self.disposing.load(Ordering::SeqCst)
    }

    /// Dispose every peer. Idempotent.
    pub fn dispose(&self) {
        if self.disposing.swap(true, Ordering::SeqCst) {
            return;
        }
        for peer in self.peers() {
            peer.dispose();
        }
    }
}
