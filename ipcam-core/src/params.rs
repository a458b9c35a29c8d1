//! Per-peer parameter store: channel -> parameter id -> payload, persistence handle, descriptor.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::catalog::ParameterDescriptor;
use crate::protocol::{ParamsetKind, Value};
use crate::storage::{Storage, StorageError, VariableRow};
use crate::wire::{self, CodecError};

/// One stored parameter. `database_id == 0` means not yet persisted.
#[derive(Debug, Clone, Default)]
pub struct ConfigurationParameter {
    pub data: Vec<u8>,
    pub database_id: u64,
    /// `None` when the catalog has no such parameter; the entry is then inert.
    pub descriptor: Option<Arc<ParameterDescriptor>>,
}

impl ConfigurationParameter {
    /// Decoded value. Password parameters always read back as the zero value.
    pub fn value(&self) -> Option<Value> {
        let desc = self.descriptor.as_ref()?;
        if desc.flags.password {
            return Some(desc.zero_value());
        }
        Some(wire::decode(desc, &self.data))
    }

    /// Decoded value without password masking, for internal consumers.
    pub fn raw_value(&self) -> Option<Value> {
        let desc = self.descriptor.as_ref()?;
        Some(wire::decode(desc, &self.data))
    }
}

/// Error from the parameter store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("parameter {id} not found on channel {channel}")]
    NotFound { channel: u32, id: String },
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// One of a peer's two parameter sets.
#[derive(Debug, Clone)]
pub struct ParameterSet {
    kind: ParamsetKind,
    channels: BTreeMap<u32, BTreeMap<String, ConfigurationParameter>>,
}

impl ParameterSet {
    pub fn new(kind: ParamsetKind) -> Self {
        Self {
            kind,
            channels: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> ParamsetKind {
        self.kind
    }

    pub fn get(&self, channel: u32, id: &str) -> Result<&ConfigurationParameter, StoreError> {
        self.channels
            .get(&channel)
            .and_then(|c| c.get(id))
            .ok_or_else(|| StoreError::NotFound {
                channel,
                id: id.to_string(),
            })
    }

    pub fn contains(&self, channel: u32, id: &str) -> bool {
        self.channels
            .get(&channel)
            .map_or(false, |c| c.contains_key(id))
    }

    pub fn channel(&self, channel: u32) -> Option<&BTreeMap<String, ConfigurationParameter>> {
        self.channels.get(&channel)
    }

    /// Put a parameter into the in-memory map without persisting (used when loading rows).
    pub fn insert(&mut self, channel: u32, id: &str, parameter: ConfigurationParameter) {
        self.channels
            .entry(channel)
            .or_default()
            .insert(id.to_string(), parameter);
    }

    /// Store `data` and persist it at once. Writes to inert parameters are dropped.
    /// A `peer_id` of 0 keeps the write in memory until the peer is saved.
    pub fn set(
        &mut self,
        storage: &dyn Storage,
        peer_id: u64,
        channel: u32,
        id: &str,
        data: Vec<u8>,
    ) -> Result<(), StoreError> {
        let kind = self.kind;
        let parameter = self
            .channels
            .get_mut(&channel)
            .and_then(|c| c.get_mut(id))
            .ok_or_else(|| StoreError::NotFound {
                channel,
                id: id.to_string(),
            })?;
        if parameter.descriptor.is_none() {
            return Ok(());
        }
        parameter.data = data;
        if peer_id != 0 {
            persist(storage, kind, peer_id, channel, id, parameter)?;
        }
        Ok(())
    }

    /// Encode `value` and store it.
    pub fn set_value(
        &mut self,
        storage: &dyn Storage,
        peer_id: u64,
        channel: u32,
        id: &str,
        value: &Value,
    ) -> Result<(), StoreError> {
        let desc = self
            .get(channel, id)?
            .descriptor
            .clone();
        let Some(desc) = desc else {
            return Ok(());
        };
        let data = wire::encode(&desc, value)?;
        self.set(storage, peer_id, channel, id, data)
    }

    /// Insert the default for `desc` if the parameter has no entry yet. Returns whether it did.
    pub fn ensure_default(
        &mut self,
        storage: &dyn Storage,
        peer_id: u64,
        channel: u32,
        desc: &Arc<ParameterDescriptor>,
    ) -> Result<bool, StoreError> {
        if self.contains(channel, &desc.id) {
            return Ok(false);
        }
        let mut parameter = ConfigurationParameter {
            data: wire::encode(desc, &desc.default_value())?,
            database_id: 0,
            descriptor: Some(desc.clone()),
        };
        if peer_id != 0 {
            persist(storage, self.kind, peer_id, channel, &desc.id, &mut parameter)?;
        }
        self.insert(channel, &desc.id, parameter);
        Ok(true)
    }

    /// Persist every parameter (used on first save and on full shutdown saves).
    pub fn save_all(&mut self, storage: &dyn Storage, peer_id: u64) -> Result<(), StoreError> {
        let kind = self.kind;
        for (channel, params) in self.channels.iter_mut() {
            for (id, parameter) in params.iter_mut() {
                persist(storage, kind, peer_id, *channel, id, parameter)?;
            }
        }
        Ok(())
    }
}

fn persist(
    storage: &dyn Storage,
    kind: ParamsetKind,
    peer_id: u64,
    channel: u32,
    id: &str,
    parameter: &mut ConfigurationParameter,
) -> Result<(), StoreError> {
    let row = VariableRow {
        id: parameter.database_id,
        peer_id,
        kind,
        channel,
        parameter: id.to_string(),
        data: parameter.data.clone(),
    };
    parameter.database_id = storage.save_variable(row)?;
    Ok(())
}
