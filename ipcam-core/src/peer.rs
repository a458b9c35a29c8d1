//! One paired camera: parameter sets, identity, motion state and HTTP endpoint settings.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::catalog::{DeviceDescription, ParameterGroup};
use crate::error::{Error, Result};
use crate::events::Event;
use crate::identity::{device_addresses, SerialNumber};
use crate::params::{ConfigurationParameter, ParameterSet};
use crate::protocol::{ParamsetKind, StructBuilder, Value, FAMILY_ID};
use crate::storage::PeerRow;
use crate::url::UrlInfo;
use crate::wire::{self, SlotMerger};
use crate::{lock, now_ms, Context};

pub const MOTION: &str = "MOTION";
pub const STREAM_URL: &str = "STREAM_URL";
pub const SNAPSHOT_URL: &str = "SNAPSHOT_URL";
pub const CA_FILE: &str = "CA_FILE";
pub const VERIFY_CERTIFICATE: &str = "VERIFY_CERTIFICATE";
pub const RESET_MOTION_AFTER: &str = "RESET_MOTION_AFTER";

const CUSTOM_URL_TRIGGER: &str = "OPEN_CUSTOM_URL_";
const HTTP_SETTINGS: [&str; 4] = [STREAM_URL, SNAPSHOT_URL, CA_FILE, VERIFY_CERTIFICATE];

/// Channel carrying device-wide configuration.
pub const CONFIG_CHANNEL: u32 = 0;
/// Channel carrying the camera's live values.
pub const CAMERA_CHANNEL: u32 = 1;

pub const MOTION_RESET_MIN_MS: u64 = 5_000;
pub const MOTION_RESET_MAX_MS: u64 = 3_600_000;
const MOTION_RESET_DEFAULT_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MotionState {
    active: bool,
    since_ms: u64,
    reset_after_ms: u64,
}

/// Everything mutable about a peer's parameters. One lock, so writes from RPC,
/// the motion webhook and the worker are serialized and the last one wins.
struct PeerState {
    config: ParameterSet,
    values: ParameterSet,
    motion: MotionState,
}

/// Upstream endpoints and TLS settings, derived from the channel 0 configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpConfig {
    pub stream: UrlInfo,
    pub snapshot: UrlInfo,
    pub ca_file: String,
    pub verify_certificate: bool,
}

/// One-shot GET the host performs on behalf of a peer (custom URL triggers).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub peer_id: u64,
    pub url: UrlInfo,
    pub ca_file: String,
    pub verify_certificate: bool,
}

pub struct Peer {
    id: AtomicU64,
    parent_id: u64,
    serial: SerialNumber,
    device_type: u32,
    firmware: u32,
    description: Arc<DeviceDescription>,
    ctx: Arc<Context>,
    state: Mutex<PeerState>,
    http: RwLock<HttpConfig>,
    deleting: AtomicBool,
    disposing: AtomicBool,
    shutting_down: AtomicBool,
    hooks_attached: AtomicBool,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id())
            .field("serial", &self.serial)
            .field("device_type", &self.device_type)
            .finish()
    }
}

impl Peer {
    /// New, not yet persisted peer (id 0).
    pub fn new(
        ctx: Arc<Context>,
        parent_id: u64,
        serial: SerialNumber,
        device_type: u32,
        firmware: u32,
        description: Arc<DeviceDescription>,
    ) -> Self {
        Self {
            id: AtomicU64::new(0),
            parent_id,
            serial,
            device_type,
            firmware,
            description,
            ctx,
            state: Mutex::new(PeerState {
                config: ParameterSet::new(ParamsetKind::Config),
                values: ParameterSet::new(ParamsetKind::Values),
                motion: MotionState {
                    active: false,
                    since_ms: 0,
                    reset_after_ms: MOTION_RESET_DEFAULT_MS,
                },
            }),
            http: RwLock::new(HttpConfig {
                verify_certificate: true,
                ..HttpConfig::default()
            }),
            deleting: AtomicBool::new(false),
            disposing: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            hooks_attached: AtomicBool::new(false),
        }
    }

    /// Rebuild a peer from its persisted row and variables.
    pub fn load(ctx: Arc<Context>, row: &PeerRow, description: Arc<DeviceDescription>) -> Result<Self> {
        let serial = SerialNumber::parse(&row.serial)?;
        let peer = Self::new(
            ctx,
            row.parent_id,
            serial,
            row.device_type,
            row.firmware,
            description,
        );
        peer.id.store(row.id, Ordering::SeqCst);
        {
            let mut state = lock(&peer.state);
            for var in peer.ctx.storage.variables(row.id)? {
                let descriptor = peer
                    .description
                    .group(var.channel, var.kind)
                    .and_then(|g| g.get(&var.parameter))
                    .cloned();
                if descriptor.is_none() {
                    tracing::debug!(peer_id = row.id, channel = var.channel, parameter = %var.parameter, "Stored parameter has no descriptor");
                }
                let parameter = ConfigurationParameter {
                    data: var.data,
                    database_id: var.id,
                    descriptor,
                };
                match var.kind {
                    ParamsetKind::Config => state.config.insert(var.channel, &var.parameter, parameter),
                    ParamsetKind::Values => state.values.insert(var.channel, &var.parameter, parameter),
                    ParamsetKind::Link => {}
                }
            }
        }
        peer.initialize_central_config()?;
        {
            let mut state = lock(&peer.state);
            let motion = state
                .values
                .get(CAMERA_CHANNEL, MOTION)
                .ok()
                .and_then(ConfigurationParameter::raw_value)
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if motion {
                state.motion.active = true;
                state.motion.since_ms = now_ms();
            }
            reload_reset_after(&mut state);
        }
        peer.reload_http_settings();
        Ok(peer)
    }

    pub fn id(&self) -> u64 {
        self.id.load(Ordering::SeqCst)
    }

    pub fn parent_id(&self) -> u64 {
        self.parent_id
    }

    pub fn serial(&self) -> &SerialNumber {
        &self.serial
    }

    pub fn device_type(&self) -> u32 {
        self.device_type
    }

    pub fn firmware(&self) -> u32 {
        self.firmware
    }

    pub fn description(&self) -> &Arc<DeviceDescription> {
        &self.description
    }

    /// `SERIAL` plus `SERIAL:channel` for every channel of the device.
    pub fn addresses(&self) -> Vec<String> {
        device_addresses(&self.serial, self.description.channels.keys())
    }

    pub fn is_deleting(&self) -> bool {
        self.deleting.load(Ordering::SeqCst)
    }

    pub fn set_deleting(&self) {
        self.deleting.store(true, Ordering::SeqCst);
    }

    pub fn is_disposing(&self) -> bool {
        self.disposing.load(Ordering::SeqCst)
    }

    pub fn set_shutting_down(&self, value: bool) {
        self.shutting_down.store(value, Ordering::SeqCst);
    }

    /// False once the peer is deleting, disposing or the hub is shutting down.
    /// Long-running relays poll this between chunks.
    pub fn is_alive(&self) -> bool {
        !(self.deleting.load(Ordering::SeqCst)
            || self.disposing.load(Ordering::SeqCst)
            || self.shutting_down.load(Ordering::SeqCst))
    }

    /// Start serving bridge requests for this peer.
    pub fn attach_hooks(&self) {
        self.hooks_attached.store(true, Ordering::SeqCst);
    }

    pub fn detach_hooks(&self) {
        self.hooks_attached.store(false, Ordering::SeqCst);
    }

    pub fn hooks_attached(&self) -> bool {
        self.hooks_attached.load(Ordering::SeqCst)
    }

    /// Mark disposing and stop serving bridge requests. Idempotent.
    pub fn dispose(&self) {
        if self.disposing.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(peer_id = self.id(), "Removing bridge hooks");
        self.detach_hooks();
    }

    pub fn hub_started(&self) {
        self.attach_hooks();
        self.init_http_client();
    }

    pub fn hub_shutting_down(&self) {
        self.set_shutting_down(true);
        self.detach_hooks();
    }

    fn check_alive(&self) -> Result<()> {
        if self.is_disposing() {
            return Err(Error::Disposing);
        }
        Ok(())
    }

    /// Persist the peer row, assigning an id on first save. New peers and `full` saves
    /// also write every parameter.
    pub fn save(&self, full: bool) -> Result<()> {
        let current = self.id();
        let id = self.ctx.storage.save_peer(PeerRow {
            id: current,
            parent_id: self.parent_id,
            device_type: self.device_type,
            firmware: self.firmware,
            serial: self.serial.to_string(),
        })?;
        self.id.store(id, Ordering::SeqCst);
        if current == 0 || full {
            let mut state = lock(&self.state);
            state.config.save_all(self.ctx.storage.as_ref(), id)?;
            state.values.save_all(self.ctx.storage.as_ref(), id)?;
        }
        Ok(())
    }

    /// Purge the peer row and all of its variables.
    pub fn delete_from_storage(&self) -> Result<()> {
        self.ctx.storage.delete_peer(self.id())?;
        Ok(())
    }

    /// Give every descriptor without a stored payload its default value.
    pub fn initialize_central_config(&self) -> Result<()> {
        let id = self.id();
        let storage = self.ctx.storage.as_ref();
        let mut state = lock(&self.state);
        for (channel, function) in &self.description.channels {
            for desc in function.config.iter() {
                state.config.ensure_default(storage, id, *channel, desc)?;
            }
            for desc in function.values.iter() {
                state.values.ensure_default(storage, id, *channel, desc)?;
            }
        }
        Ok(())
    }

    // motion

    /// Clear MOTION once its reset time has passed.
    pub fn worker(&self) -> Result<()> {
        self.worker_at(now_ms())
    }

    pub fn worker_at(&self, now: u64) -> Result<()> {
        if self.is_disposing() {
            return Ok(());
        }
        {
            let mut state = lock(&self.state);
            let m = state.motion;
            if !m.active || now < m.since_ms.saturating_add(m.reset_after_ms) {
                return Ok(());
            }
            if !state.values.contains(CAMERA_CHANNEL, MOTION) {
                return Ok(());
            }
            state.motion.active = false;
            state.values.set_value(
                self.ctx.storage.as_ref(),
                self.id(),
                CAMERA_CHANNEL,
                MOTION,
                &Value::Boolean(false),
            )?;
        }
        tracing::debug!(peer_id = self.id(), serial = %self.serial, "MOTION reset");
        self.emit_values(CAMERA_CHANNEL, vec![(MOTION.to_string(), Value::Boolean(false))]);
        Ok(())
    }

    /// Handle a motion webhook: set MOTION, remember when, re-read the reset time.
    pub fn trigger_motion(&self) -> Result<()> {
        self.trigger_motion_at(now_ms())
    }

    pub fn trigger_motion_at(&self, now: u64) -> Result<()> {
        {
            let mut state = lock(&self.state);
            if !state.values.contains(CAMERA_CHANNEL, MOTION) {
                return Err(Error::UnknownParameter(MOTION.to_string()));
            }
            state.values.set_value(
                self.ctx.storage.as_ref(),
                self.id(),
                CAMERA_CHANNEL,
                MOTION,
                &Value::Boolean(true),
            )?;
            state.motion.active = true;
            state.motion.since_ms = now;
            reload_reset_after(&mut state);
        }
        tracing::debug!(peer_id = self.id(), serial = %self.serial, "MOTION triggered");
        self.emit_values(CAMERA_CHANNEL, vec![(MOTION.to_string(), Value::Boolean(true))]);
        Ok(())
    }

    pub fn motion_active(&self) -> bool {
        lock(&self.state).motion.active
    }

    pub fn reset_motion_after_ms(&self) -> u64 {
        lock(&self.state).motion.reset_after_ms
    }

    // http

    pub fn http_config(&self) -> HttpConfig {
        self.http
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Re-read upstream URLs and TLS settings from channel 0.
    pub fn reload_http_settings(&self) {
        let config = {
            let state = lock(&self.state);
            let string = |id: &str| {
                config_value(&state, id)
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default()
            };
            HttpConfig {
                stream: UrlInfo::parse(&string(STREAM_URL)),
                snapshot: UrlInfo::parse(&string(SNAPSHOT_URL)),
                ca_file: string(CA_FILE),
                verify_certificate: config_value(&state, VERIFY_CERTIFICATE)
                    .and_then(|v| v.as_bool())
                    .unwrap_or(true),
            }
        };
        *self.http.write().unwrap_or_else(PoisonError::into_inner) = config;
    }

    /// Reload HTTP settings and republish the externally visible URLs.
    pub fn init_http_client(&self) {
        self.reload_http_settings();
        if let Err(e) = self.refresh_external_urls() {
            tracing::error!(peer_id = self.id(), error = %e, "Could not update external URLs");
        }
    }

    /// Point the STREAM_URL and SNAPSHOT_URL values at the hub's bridge endpoints.
    pub fn refresh_external_urls(&self) -> Result<()> {
        if !self.http_config().stream.is_configured() {
            tracing::warn!(peer_id = self.id(), "Can't init HTTP client: please set STREAM_URL to a valid value");
            return Ok(());
        }
        let Some(listen) = self.ctx.listen_info() else {
            return Ok(());
        };
        if listen.port == 0 {
            return Ok(());
        }
        let id = self.id();
        let prefix = listen.peer_prefix(id);
        let stream_url = format!("{}stream.mjpeg", prefix);
        let mut changed = Vec::new();
        {
            let mut state = lock(&self.state);
            let current = state
                .values
                .get(CAMERA_CHANNEL, STREAM_URL)
                .ok()
                .and_then(ConfigurationParameter::raw_value);
            let Some(current) = current else {
                return Ok(());
            };
            if current.as_str() == Some(stream_url.as_str()) {
                return Ok(());
            }
            let storage = self.ctx.storage.as_ref();
            let stream = Value::String(stream_url);
            state.values.set_value(storage, id, CAMERA_CHANNEL, STREAM_URL, &stream)?;
            changed.push((STREAM_URL.to_string(), stream));
            if state.values.contains(CAMERA_CHANNEL, SNAPSHOT_URL) {
                let snapshot = Value::String(format!("{}snapshot.jpg", prefix));
                state.values.set_value(storage, id, CAMERA_CHANNEL, SNAPSHOT_URL, &snapshot)?;
                changed.push((SNAPSHOT_URL.to_string(), snapshot));
            }
        }
        tracing::info!(peer_id = id, serial = %self.serial, prefix = %prefix, "External URLs updated");
        self.emit_values(CAMERA_CHANNEL, changed);
        Ok(())
    }

    // hub-facing operations

    fn group(&self, channel: u32, kind: ParamsetKind) -> Result<&ParameterGroup> {
        let function = self
            .description
            .channel(channel)
            .ok_or(Error::UnknownChannel(channel))?;
        function.group(kind).ok_or(Error::UnknownParamset)
    }

    pub fn get_paramset(&self, channel: u32, kind: ParamsetKind) -> Result<Value> {
        self.check_alive()?;
        let group = self.group(channel, kind)?;
        let state = lock(&self.state);
        let set = match kind {
            ParamsetKind::Config => &state.config,
            ParamsetKind::Values => &state.values,
            ParamsetKind::Link => return Err(Error::UnsupportedParamsetType),
        };
        let mut out = BTreeMap::new();
        for desc in group.iter() {
            if desc.id.is_empty() || !desc.flags.visible {
                continue;
            }
            if kind == ParamsetKind::Values && !desc.flags.readable {
                continue;
            }
            let Ok(parameter) = set.get(channel, &desc.id) else {
                continue;
            };
            let value = parameter.value().unwrap_or_else(|| desc.zero_value());
            out.insert(desc.id.clone(), value);
        }
        Ok(Value::Struct(out))
    }

    /// Write a parameter set. Config writes persist each entry; value writes go through
    /// [`Peer::set_value`] and hand back any outbound requests they produce.
    pub fn put_paramset(
        &self,
        channel: u32,
        kind: ParamsetKind,
        values: &BTreeMap<String, Value>,
    ) -> Result<Vec<OutboundRequest>> {
        self.check_alive()?;
        self.group(channel, kind)?;
        if values.is_empty() {
            return Ok(Vec::new());
        }
        match kind {
            ParamsetKind::Config => {
                self.put_config(channel, values)?;
                Ok(Vec::new())
            }
            ParamsetKind::Values => {
                let mut requests = Vec::new();
                for (key, value) in values {
                    if key.is_empty() {
                        continue;
                    }
                    match self.set_value(channel, key, value) {
                        Ok(Some(request)) => requests.push(request),
                        Ok(None) => {}
                        Err(e) => {
                            tracing::debug!(peer_id = self.id(), channel, parameter = %key, error = %e, "Value not set")
                        }
                    }
                }
                Ok(requests)
            }
            ParamsetKind::Link => Err(Error::UnsupportedParamsetType),
        }
    }

    fn put_config(&self, channel: u32, values: &BTreeMap<String, Value>) -> Result<()> {
        let id = self.id();
        let mut reload_http = false;
        let mut device_changed = false;
        let mut slots = SlotMerger::new();
        let mut result = Ok(());
        {
            let mut state = lock(&self.state);
            // encode the whole batch first so a bad entry leaves nothing half applied
            let mut encoded = Vec::new();
            for (key, value) in values {
                if key.is_empty() {
                    continue;
                }
                let Some(desc) = state
                    .config
                    .get(channel, key)
                    .ok()
                    .and_then(|p| p.descriptor.clone())
                else {
                    continue;
                };
                if !desc.flags.writable {
                    continue;
                }
                // an empty password keeps the stored one
                if desc.flags.password && value.as_str().map_or(false, str::is_empty) {
                    continue;
                }
                let data = wire::encode(&desc, value)?;
                encoded.push((key, desc, data));
            }
            for (key, desc, data) in encoded {
                slots.add(&desc, &data);
                if channel == CONFIG_CHANNEL && HTTP_SETTINGS.contains(&key.as_str()) {
                    reload_http = true;
                }
                if desc.is_device_config() {
                    device_changed = true;
                }
                // the in-memory value is updated even when persisting fails
                let stored = state
                    .config
                    .set(self.ctx.storage.as_ref(), id, channel, key, data);
                if channel == CONFIG_CHANNEL && key == RESET_MOTION_AFTER {
                    reload_reset_after(&mut state);
                }
                if let Err(e) = stored {
                    result = Err(e.into());
                    break;
                }
                let slot = slots
                    .slot(desc.physical.list_id(), desc.physical.index)
                    .map(hex)
                    .unwrap_or_default();
                tracing::info!(peer_id = id, channel, parameter = %key, slot = %slot, "Parameter set");
            }
        }
        if reload_http {
            self.init_http_client();
        }
        if device_changed {
            self.ctx.events.emit(Event::UpdateDevice {
                peer_id: id,
                channel,
            });
        }
        result
    }

    pub fn get_value(&self, channel: u32, key: &str) -> Result<Value> {
        self.check_alive()?;
        let state = lock(&self.state);
        if state.values.channel(channel).is_none() {
            return Err(Error::UnknownChannel(channel));
        }
        let parameter = state.values.get(channel, key)?;
        let group = self.group(channel, ParamsetKind::Values)?;
        let desc = group
            .get(key)
            .ok_or_else(|| Error::UnknownParameter(key.to_string()))?;
        if !desc.flags.readable {
            return Err(Error::NotReadable(key.to_string()));
        }
        Ok(parameter.value().unwrap_or_else(|| desc.zero_value()))
    }

    /// Write one live value. `OPEN_CUSTOM_URL_nn` does not store anything; it returns the
    /// request for `CUSTOM_URL_nn` for the host to perform.
    pub fn set_value(&self, channel: u32, key: &str, value: &Value) -> Result<Option<OutboundRequest>> {
        self.check_alive()?;
        if key.is_empty() {
            return Err(Error::UnknownParameter(String::new()));
        }
        let id = self.id();
        let stored = {
            let mut state = lock(&self.state);
            if state.values.channel(channel).is_none() {
                return Err(Error::UnknownChannel(channel));
            }
            if let Some(number) = custom_url_number(key) {
                return self.custom_url_request(&state, number);
            }
            let desc = state
                .values
                .get(channel, key)
                .ok()
                .and_then(|p| p.descriptor.clone())
                .filter(|d| d.flags.writable)
                .ok_or_else(|| Error::UnknownParameter(key.to_string()))?;
            state
                .values
                .set_value(self.ctx.storage.as_ref(), id, channel, key, value)?;
            state
                .values
                .get(channel, key)?
                .value()
                .unwrap_or_else(|| desc.zero_value())
        };
        self.emit_values(channel, vec![(key.to_string(), stored)]);
        Ok(None)
    }

    fn custom_url_request(&self, state: &PeerState, number: &str) -> Result<Option<OutboundRequest>> {
        let name = format!("CUSTOM_URL_{}", number);
        let Some(url) = config_value(state, &name) else {
            return Ok(None);
        };
        let url = url.as_str().unwrap_or_default().to_string();
        if url.is_empty() {
            return Err(Error::CustomUrl(format!("{} is not set", name)));
        }
        let info = UrlInfo::parse(&url);
        if !info.is_configured() {
            return Err(Error::CustomUrl("could not get host from custom URL".into()));
        }
        let http = self.http_config();
        tracing::info!(peer_id = self.id(), url = %url, "Calling custom URL");
        Ok(Some(OutboundRequest {
            peer_id: self.id(),
            url: info,
            ca_file: http.ca_file,
            verify_certificate: http.verify_certificate,
        }))
    }

    pub fn get_paramset_description(
        &self,
        channel: u32,
        kind: ParamsetKind,
        remote_peer: Option<u64>,
    ) -> Result<Value> {
        self.check_alive()?;
        let group = self.group(channel, kind)?;
        if kind == ParamsetKind::Link && remote_peer.map_or(false, |id| id > 0) {
            // cameras have no direct links
            return Err(Error::UnknownDevice);
        }
        Ok(group.description())
    }

    /// Device description records: one for the device, one per channel.
    pub fn device_descriptions(&self) -> Vec<Value> {
        let type_id = self
            .description
            .supported_device(self.device_type, self.firmware)
            .map(|s| s.id.clone())
            .unwrap_or_else(|| self.description.id.clone());
        let children: Vec<Value> = self
            .description
            .channels
            .keys()
            .map(|c| Value::String(self.serial.channel_address(*c)))
            .collect();
        let mut out = vec![StructBuilder::new()
            .field("ID", self.id())
            .field("ADDRESS", self.serial.as_str())
            .field("TYPE", type_id.as_str())
            .field("TYPE_ID", self.device_type)
            .field("FAMILY", i64::from(FAMILY_ID))
            .field("FIRMWARE", firmware_string(self.firmware))
            .field("CHILDREN", children)
            .field("PARAMSETS", vec![Value::from(ParamsetKind::Config.rpc_name())])
            .field("FLAGS", 1i64)
            .build()];
        for (channel, function) in &self.description.channels {
            let mut paramsets = vec![
                Value::from(ParamsetKind::Config.rpc_name()),
                Value::from(ParamsetKind::Values.rpc_name()),
            ];
            if function.link.is_some() {
                paramsets.push(Value::from(ParamsetKind::Link.rpc_name()));
            }
            out.push(
                StructBuilder::new()
                    .field("ID", self.id())
                    .field("ADDRESS", self.serial.channel_address(*channel))
                    .field("PARENT", self.serial.as_str())
                    .field("PARENT_TYPE", type_id.as_str())
                    .field("TYPE", function.type_name.as_str())
                    .field("INDEX", *channel)
                    .field("FAMILY", i64::from(FAMILY_ID))
                    .field("PARAMSETS", paramsets)
                    .field("FLAGS", 1i64)
                    .build(),
            );
        }
        out
    }

    /// Summary record. An empty `fields` list returns every field.
    pub fn get_device_info(&self, fields: &[&str]) -> Result<Value> {
        self.check_alive()?;
        let wanted = |f: &str| fields.is_empty() || fields.contains(&f);
        let mut info = BTreeMap::new();
        let mut put = |key: &str, value: Value| {
            if wanted(key) {
                info.insert(key.to_string(), value);
            }
        };
        put("ID", Value::from(self.id()));
        put("ADDRESS", Value::from(self.serial.as_str()));
        put("TYPE_ID", Value::from(self.device_type));
        put("FAMILY", Value::Integer(i64::from(FAMILY_ID)));
        put("FIRMWARE", Value::from(firmware_string(self.firmware)));
        let http = self.http_config();
        put("STREAM_CONFIGURED", Value::from(http.stream.is_configured()));
        put("SNAPSHOT_CONFIGURED", Value::from(http.snapshot.is_configured()));
        put("MOTION", Value::from(self.motion_active()));
        Ok(Value::Struct(info))
    }

    fn emit_values(&self, channel: u32, changed: Vec<(String, Value)>) {
        if changed.is_empty() {
            return;
        }
        let (keys, values): (Vec<String>, Vec<Value>) = changed.into_iter().unzip();
        self.ctx.events.emit(Event::ValueChanged {
            peer_id: self.id(),
            address: self.serial.channel_address(channel),
            channel,
            keys,
            values,
        });
    }
}

fn config_value(state: &PeerState, id: &str) -> Option<Value> {
    state
        .config
        .get(CONFIG_CHANNEL, id)
        .ok()
        .and_then(ConfigurationParameter::raw_value)
}

fn reload_reset_after(state: &mut PeerState) {
    if let Some(seconds) = config_value(state, RESET_MOTION_AFTER).and_then(|v| v.as_i64()) {
        let ms = seconds.max(0) as u64 * 1000;
        state.motion.reset_after_ms = ms.clamp(MOTION_RESET_MIN_MS, MOTION_RESET_MAX_MS);
    }
}

fn custom_url_number(key: &str) -> Option<&str> {
    key.strip_prefix(CUSTOM_URL_TRIGGER)
        .filter(|n| n.len() == 2)
}

fn firmware_string(firmware: u32) -> String {
    format!("{}.{}", firmware >> 4, firmware & 0x0F)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::GENERIC_IPCAM_TYPE;
    use crate::testing::{context, drain};
    use crate::ListenInfo;

    fn paired(ctx: &Arc<Context>, serial: &str) -> Peer {
        let description = ctx.catalog.find(GENERIC_IPCAM_TYPE, 0).unwrap();
        let peer = Peer::new(
            ctx.clone(),
            0,
            SerialNumber::parse(serial).unwrap(),
            GENERIC_IPCAM_TYPE,
            0,
            description,
        );
        peer.save(false).unwrap();
        peer.initialize_central_config().unwrap();
        peer
    }

    fn config(entries: &[(&str, Value)]) -> BTreeMap<String, Value> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn defaults_initialized_and_persisted() {
        let (ctx, _rx) = context();
        let peer = paired(&ctx, "CAM0000001");
        assert_ne!(peer.id(), 0);
        let master = peer.get_paramset(0, ParamsetKind::Config).unwrap();
        let master = master.as_struct().unwrap();
        assert_eq!(master.get(RESET_MOTION_AFTER), Some(&Value::Integer(30)));
        assert_eq!(master.get(VERIFY_CERTIFICATE), Some(&Value::Boolean(true)));
        assert_eq!(peer.reset_motion_after_ms(), 30_000);
        let rows = ctx.storage.variables(peer.id()).unwrap();
        assert_eq!(rows.len(), 9 + 3);
    }

    #[test]
    fn motion_resets_after_timeout() {
        let (ctx, rx) = context();
        let peer = paired(&ctx, "CAM0000001");
        peer.put_paramset(0, ParamsetKind::Config, &config(&[(RESET_MOTION_AFTER, Value::Integer(5))]))
            .unwrap();
        drain(&rx);

        let t = 1_000_000;
        peer.trigger_motion_at(t).unwrap();
        assert_eq!(peer.get_value(1, MOTION).unwrap(), Value::Boolean(true));
        assert_eq!(peer.reset_motion_after_ms(), 5_000);

        peer.worker_at(t + 4_999).unwrap();
        assert_eq!(peer.get_value(1, MOTION).unwrap(), Value::Boolean(true));
        peer.worker_at(t + 5_000).unwrap();
        assert_eq!(peer.get_value(1, MOTION).unwrap(), Value::Boolean(false));
        assert!(!peer.motion_active());

        let events = drain(&rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[1],
            Event::ValueChanged { address, keys, values, .. }
                if address == "CAM0000001:1" && keys == &vec![MOTION.to_string()] && values == &vec![Value::Boolean(false)]
        ));
    }

    #[test]
    fn reset_after_clamped() {
        let (ctx, _rx) = context();
        let peer = paired(&ctx, "CAM0000001");
        // stored value clamps to the descriptor's 5..3600 seconds
        peer.put_paramset(0, ParamsetKind::Config, &config(&[(RESET_MOTION_AFTER, Value::Integer(1))]))
            .unwrap();
        assert_eq!(peer.reset_motion_after_ms(), MOTION_RESET_MIN_MS);
        peer.put_paramset(0, ParamsetKind::Config, &config(&[(RESET_MOTION_AFTER, Value::Integer(99_999))]))
            .unwrap();
        assert_eq!(peer.reset_motion_after_ms(), MOTION_RESET_MAX_MS);
    }

    #[test]
    fn errors_by_kind() {
        let (ctx, _rx) = context();
        let peer = paired(&ctx, "CAM0000001");
        assert!(matches!(peer.get_value(7, MOTION), Err(Error::UnknownChannel(7))));
        assert!(matches!(peer.get_value(1, "NOPE"), Err(Error::UnknownParameter(_))));
        assert!(matches!(
            peer.get_paramset(1, ParamsetKind::Link),
            Err(Error::UnknownParamset)
        ));
        assert!(matches!(
            peer.put_paramset(9, ParamsetKind::Config, &BTreeMap::new()),
            Err(Error::UnknownChannel(9))
        ));
        assert!(matches!(
            peer.set_value(1, MOTION, &Value::Boolean(true)),
            Err(Error::UnknownParameter(_))
        ));
        peer.dispose();
        assert!(matches!(peer.get_value(1, MOTION), Err(Error::Disposing)));
        assert_eq!(Error::Disposing.code(), -32500);
    }

    #[test]
    fn http_settings_reload_and_external_urls() {
        let (ctx, rx) = context();
        ctx.set_listen_info(Some(ListenInfo {
            address: "192.168.1.10".into(),
            port: 2001,
        }));
        let peer = paired(&ctx, "CAM0000001");
        drain(&rx);
        peer.put_paramset(
            0,
            ParamsetKind::Config,
            &config(&[
                (STREAM_URL, "http://cam.local:8080/video.mjpg".into()),
                (SNAPSHOT_URL, "https://cam.local/snap.jpg".into()),
                (VERIFY_CERTIFICATE, false.into()),
            ]),
        )
        .unwrap();
        let http = peer.http_config();
        assert_eq!(http.stream.port, 8080);
        assert!(http.snapshot.ssl);
        assert!(!http.verify_certificate);

        let prefix = format!("http://192.168.1.10:2001/ipcam/{}/", peer.id());
        assert_eq!(
            peer.get_value(1, STREAM_URL).unwrap(),
            Value::String(format!("{}stream.mjpeg", prefix))
        );
        assert_eq!(
            peer.get_value(1, SNAPSHOT_URL).unwrap(),
            Value::String(format!("{}snapshot.jpg", prefix))
        );
        let events = drain(&rx);
        assert!(events.iter().any(|e| matches!(e, Event::ValueChanged { keys, .. } if keys.len() == 2)));
        assert!(events.iter().any(|e| matches!(e, Event::UpdateDevice { channel: 0, .. })));

        // unchanged listener: nothing republished
        peer.init_http_client();
        assert!(drain(&rx).is_empty());
    }

    #[test]
    fn custom_url_trigger() {
        let (ctx, _rx) = context();
        let peer = paired(&ctx, "CAM0000001");
        assert!(matches!(
            peer.set_value(1, "OPEN_CUSTOM_URL_01", &Value::Boolean(true)),
            Err(Error::CustomUrl(_))
        ));
        peer.put_paramset(
            0,
            ParamsetKind::Config,
            &config(&[("CUSTOM_URL_01", "http://cam.local/cgi/light?on".into())]),
        )
        .unwrap();
        let request = peer
            .set_value(1, "OPEN_CUSTOM_URL_01", &Value::Boolean(true))
            .unwrap()
            .unwrap();
        assert_eq!(request.url.host, "cam.local");
        assert_eq!(request.url.path, "/cgi/light?on");
        assert!(request.verify_certificate);
        // no such custom URL parameter: silently nothing
        assert!(peer
            .set_value(1, "OPEN_CUSTOM_URL_09", &Value::Boolean(true))
            .unwrap()
            .is_none());
        assert!(matches!(
            peer.set_value(1, "OPEN_CUSTOM_URL_1", &Value::Boolean(true)),
            Err(Error::UnknownParameter(_))
        ));
        let mut values = BTreeMap::new();
        values.insert("OPEN_CUSTOM_URL_01".to_string(), Value::Boolean(true));
        assert_eq!(peer.put_paramset(1, ParamsetKind::Values, &values).unwrap().len(), 1);
    }

    #[test]
    fn bad_entry_rejects_whole_config_batch() {
        let (ctx, rx) = context();
        let peer = paired(&ctx, "CAM0000001");
        drain(&rx);
        let result = peer.put_paramset(
            0,
            ParamsetKind::Config,
            &config(&[
                (STREAM_URL, "http://cam.local/video".into()),
                (VERIFY_CERTIFICATE, "notabool".into()),
            ]),
        );
        assert!(matches!(result, Err(Error::InvalidValue(_))));
        let stored = lock(&peer.state)
            .config
            .get(0, STREAM_URL)
            .unwrap()
            .raw_value();
        assert_eq!(stored, Some(Value::String(String::new())));
        assert!(!peer.http_config().stream.is_configured());
        assert!(drain(&rx).is_empty());

        peer.put_paramset(
            0,
            ParamsetKind::Config,
            &config(&[(STREAM_URL, "http://cam.local/video".into())]),
        )
        .unwrap();
        assert_eq!(peer.http_config().stream.host, "cam.local");
    }

    const SECRET_CAMERA: &str = r#"{
        "id": "SecretCam",
        "supported": [{ "id": "SecretCam", "type_number": 4242 }],
        "channels": {
            "0": { "type": "MAINTENANCE", "config": [
                { "id": "USER", "physical": { "index": 0, "size_bits": 0, "operation": "config_string" },
                  "logical": { "type": "string", "default": "" } },
                { "id": "PASSWORD", "flags": { "password": true },
                  "physical": { "index": 1, "size_bits": 0, "operation": "config_string" },
                  "logical": { "type": "string", "default": "" } }
            ] },
            "1": { "type": "CAMERA", "values": [
                { "id": "TOKEN", "flags": { "password": true },
                  "physical": { "index": 0, "size_bits": 0 },
                  "logical": { "type": "string" } }
            ] }
        }
    }"#;

    #[test]
    fn passwords_masked_and_kept_on_empty_write() {
        let (ctx, rx) = context();
        let description = Arc::new(DeviceDescription::from_json(SECRET_CAMERA).unwrap());
        let peer = Peer::new(
            ctx.clone(),
            0,
            SerialNumber::parse("CAM0000009").unwrap(),
            4242,
            0,
            description,
        );
        peer.save(false).unwrap();
        peer.initialize_central_config().unwrap();
        let stored = || {
            lock(&peer.state)
                .config
                .get(0, "PASSWORD")
                .unwrap()
                .raw_value()
        };

        peer.put_paramset(
            0,
            ParamsetKind::Config,
            &config(&[("USER", "admin".into()), ("PASSWORD", "hunter2".into())]),
        )
        .unwrap();
        let master = peer.get_paramset(0, ParamsetKind::Config).unwrap();
        let master = master.as_struct().unwrap();
        assert_eq!(master.get("USER"), Some(&Value::from("admin")));
        assert_eq!(master.get("PASSWORD"), Some(&Value::String(String::new())));
        assert_eq!(stored(), Some(Value::from("hunter2")));

        // an empty password keeps the stored secret, in memory and on disk
        peer.put_paramset(0, ParamsetKind::Config, &config(&[("PASSWORD", "".into())]))
            .unwrap();
        assert_eq!(stored(), Some(Value::from("hunter2")));
        let row = ctx
            .storage
            .variables(peer.id())
            .unwrap()
            .into_iter()
            .find(|v| v.parameter == "PASSWORD")
            .unwrap();
        assert_eq!(row.data, b"hunter2");

        peer.put_paramset(0, ParamsetKind::Config, &config(&[("PASSWORD", "s3cret".into())]))
            .unwrap();
        assert_eq!(stored(), Some(Value::from("s3cret")));

        // live values: masked on read and in the change notification
        drain(&rx);
        assert!(peer.set_value(1, "TOKEN", &Value::from("abc")).unwrap().is_none());
        assert_eq!(peer.get_value(1, "TOKEN").unwrap(), Value::String(String::new()));
        let values = peer.get_paramset(1, ParamsetKind::Values).unwrap();
        assert_eq!(
            values.as_struct().unwrap().get("TOKEN"),
            Some(&Value::String(String::new()))
        );
        let events = drain(&rx);
        assert!(events.iter().any(|e| matches!(
            e,
            Event::ValueChanged { keys, values, .. }
                if keys == &["TOKEN".to_string()] && values == &[Value::String(String::new())]
        )));
    }

    #[test]
    fn load_restores_state() {
        let (ctx, _rx) = context();
        let id = {
            let peer = paired(&ctx, "CAM0000001");
            peer.put_paramset(
                0,
                ParamsetKind::Config,
                &config(&[
                    (STREAM_URL, "http://cam/video".into()),
                    (RESET_MOTION_AFTER, Value::Integer(60)),
                ]),
            )
            .unwrap();
            peer.trigger_motion_at(1).unwrap();
            peer.id()
        };
        let row = ctx
            .storage
            .peers(0)
            .unwrap()
            .into_iter()
            .find(|r| r.id == id)
            .unwrap();
        let description = ctx.catalog.find(row.device_type, row.firmware).unwrap();
        let peer = Peer::load(ctx.clone(), &row, description).unwrap();
        assert_eq!(peer.serial().as_str(), "CAM0000001");
        assert!(peer.motion_active());
        assert_eq!(peer.reset_motion_after_ms(), 60_000);
        assert_eq!(peer.http_config().stream.host, "cam");
    }

    #[test]
    fn descriptions_and_info() {
        let (ctx, _rx) = context();
        let peer = paired(&ctx, "CAM0000001");
        let d = peer.device_descriptions();
        assert_eq!(d.len(), 3);
        let device = d[0].as_struct().unwrap();
        assert_eq!(device.get("ADDRESS"), Some(&Value::from("CAM0000001")));
        assert_eq!(device.get("TYPE"), Some(&Value::from("IpCam")));
        let camera = d[2].as_struct().unwrap();
        assert_eq!(camera.get("ADDRESS"), Some(&Value::from("CAM0000001:1")));
        assert_eq!(camera.get("TYPE"), Some(&Value::from("CAMERA")));

        let info = peer.get_device_info(&["ID", "MOTION"]).unwrap();
        let info = info.as_struct().unwrap();
        assert_eq!(info.len(), 2);
        assert_eq!(info.get("MOTION"), Some(&Value::Boolean(false)));

        let desc = peer
            .get_paramset_description(0, ParamsetKind::Config, None)
            .unwrap();
        let reset = desc.as_struct().unwrap().get(RESET_MOTION_AFTER).unwrap();
        assert_eq!(reset.as_struct().unwrap().get("MAX"), Some(&Value::Integer(3600)));
        assert_eq!(reset.as_struct().unwrap().get("UNIT"), Some(&Value::from("s")));
    }
}
