//! Persistence: a narrow row-store interface (peers table, peer-variables table) and two backends.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::lock;
use crate::protocol::ParamsetKind;

/// Row of the peers table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRow {
    /// 0 inserts a new row.
    pub id: u64,
    pub parent_id: u64,
    pub device_type: u32,
    pub firmware: u32,
    pub serial: String,
}

/// Row of the peer-variables table: one stored parameter payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableRow {
    /// 0 inserts a new row.
    pub id: u64,
    pub peer_id: u64,
    pub kind: ParamsetKind,
    pub channel: u32,
    pub parameter: String,
    pub data: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot encoding: {0}")]
    Encode(#[from] bincode::Error),
    #[error("unknown peer {0}")]
    UnknownPeer(u64),
}

/// Row store reachable by the registry and every peer.
pub trait Storage: Send + Sync {
    /// Peer rows owned by `parent_id`, ordered by id.
    fn peers(&self, parent_id: u64) -> Result<Vec<PeerRow>, StorageError>;
    /// Insert (id 0) or update a peer row. Returns the row id.
    fn save_peer(&self, row: PeerRow) -> Result<u64, StorageError>;
    /// Delete a peer row and all of its variables. Unknown ids are ignored.
    fn delete_peer(&self, id: u64) -> Result<(), StorageError>;
    fn variables(&self, peer_id: u64) -> Result<Vec<VariableRow>, StorageError>;
    /// Insert (id 0) or update a variable row. Returns the row id.
    fn save_variable(&self, row: VariableRow) -> Result<u64, StorageError>;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Tables {
    next_peer_id: u64,
    next_variable_id: u64,
    peers: BTreeMap<u64, PeerRow>,
    variables: BTreeMap<u64, VariableRow>,
}

impl Tables {
    fn peers(&self, parent_id: u64) -> Vec<PeerRow> {
        self.peers
            .values()
            .filter(|p| p.parent_id == parent_id)
            .cloned()
            .collect()
    }

    fn save_peer(&mut self, mut row: PeerRow) -> Result<u64, StorageError> {
        if row.id == 0 {
            self.next_peer_id += 1;
            row.id = self.next_peer_id;
        } else if !self.peers.contains_key(&row.id) {
            return Err(StorageError::UnknownPeer(row.id));
        }
        let id = row.id;
        self.peers.insert(id, row);
        Ok(id)
    }

    fn delete_peer(&mut self, id: u64) {
        self.peers.remove(&id);
        self.variables.retain(|_, v| v.peer_id != id);
    }

    fn variables(&self, peer_id: u64) -> Vec<VariableRow> {
        self.variables
            .values()
            .filter(|v| v.peer_id == peer_id)
            .cloned()
            .collect()
    }

    fn save_variable(&mut self, mut row: VariableRow) -> Result<u64, StorageError> {
        if !self.peers.contains_key(&row.peer_id) {
            return Err(StorageError::UnknownPeer(row.peer_id));
        }
        if row.id == 0 {
            let existing = self.variables.values().find(|v| {
                v.peer_id == row.peer_id
                    && v.kind == row.kind
                    && v.channel == row.channel
                    && v.parameter == row.parameter
            });
            row.id = match existing {
                Some(v) => v.id,
                None => {
                    self.next_variable_id += 1;
                    self.next_variable_id
                }
            };
        }
        let id = row.id;
        self.next_variable_id = self.next_variable_id.max(id);
        self.variables.insert(id, row);
        Ok(id)
    }
}

/// In-process store. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    tables: Mutex<Tables>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn peers(&self, parent_id: u64) -> Result<Vec<PeerRow>, StorageError> {
        Ok(lock(&self.tables).peers(parent_id))
    }

    fn save_peer(&self, row: PeerRow) -> Result<u64, StorageError> {
        lock(&self.tables).save_peer(row)
    }

    fn delete_peer(&self, id: u64) -> Result<(), StorageError> {
        lock(&self.tables).delete_peer(id);
        Ok(())
    }

    fn variables(&self, peer_id: u64) -> Result<Vec<VariableRow>, StorageError> {
        Ok(lock(&self.tables).variables(peer_id))
    }

    fn save_variable(&self, row: VariableRow) -> Result<u64, StorageError> {
        lock(&self.tables).save_variable(row)
    }
}

/// Store backed by a bincode snapshot file, rewritten through a temp file + rename on each mutation.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    tables: Mutex<Tables>,
}

impl FileStorage {
    /// Open `path`, starting empty if the file does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let tables = match std::fs::read(&path) {
            Ok(bytes) => bincode::deserialize(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Tables::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            tables: Mutex::new(tables),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, tables: &Tables) -> Result<(), StorageError> {
        let bytes = bincode::serialize(tables)?;
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl Storage for FileStorage {
    fn peers(&self, parent_id: u64) -> Result<Vec<PeerRow>, StorageError> {
        Ok(lock(&self.tables).peers(parent_id))
    }

    fn save_peer(&self, row: PeerRow) -> Result<u64, StorageError> {
        let mut tables = lock(&self.tables);
        let id = tables.save_peer(row)?;
        self.flush(&tables)?;
        Ok(id)
    }

    fn delete_peer(&self, id: u64) -> Result<(), StorageError> {
        let mut tables = lock(&self.tables);
        tables.delete_peer(id);
        self.flush(&tables)
    }

    fn variables(&self, peer_id: u64) -> Result<Vec<VariableRow>, StorageError> {
        Ok(lock(&self.tables).variables(peer_id))
    }

    fn save_variable(&self, row: VariableRow) -> Result<u64, StorageError> {
        let mut tables = lock(&self.tables);
        let id = tables.save_variable(row)?;
        self.flush(&tables)?;
        Ok(id)
    }
}
