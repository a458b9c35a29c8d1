//! Parameter descriptor catalog: read-only device descriptions shared by all peers of a type.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use crate::protocol::{ParamsetKind, StructBuilder, Value};

/// Built-in description of the generic IP camera.
const BUILTIN_IPCAM: &str = include_str!("../catalog/ipcam.json");

/// Device type of the built-in generic IP camera.
pub const GENERIC_IPCAM_TYPE: u32 = 0x01A2;

/// How a parameter reaches the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Config,
    ConfigString,
    #[default]
    Store,
    None,
}

/// Capability flags of a parameter.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Flags {
    pub readable: bool,
    pub writable: bool,
    pub password: bool,
    pub internal: bool,
    pub service: bool,
    pub visible: bool,
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            readable: true,
            writable: true,
            password: false,
            internal: false,
            service: false,
            visible: true,
        }
    }
}

/// Physical encoding: where the bits live in the device's memory map.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Physical {
    /// Byte index within the list.
    pub index: u32,
    /// Bit position of the least significant bit inside the first byte.
    pub bit_offset: u8,
    /// Width in bits. 0 means variable length (strings).
    pub size_bits: u32,
    /// Parameters sharing a list and index share one on-wire slot. -1 means list 0.
    pub list: i32,
    pub operation: OperationType,
}

impl Default for Physical {
    fn default() -> Self {
        Self {
            index: 0,
            bit_offset: 0,
            size_bits: 8,
            list: -1,
            operation: OperationType::Store,
        }
    }
}

impl Physical {
    /// List id with the "no list" marker folded to 0.
    pub fn list_id(&self) -> i32 {
        if self.list < 0 {
            0
        } else {
            self.list
        }
    }
}

fn default_min() -> i64 {
    i64::from(i32::MIN)
}

fn default_max() -> i64 {
    i64::from(i32::MAX)
}

fn default_factor() -> f64 {
    1.0
}

/// Logical type and packet/value conversion rule.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogicalType {
    Boolean {
        #[serde(default)]
        default: bool,
    },
    Integer {
        #[serde(default = "default_min")]
        min: i64,
        #[serde(default = "default_max")]
        max: i64,
        #[serde(default)]
        default: i64,
    },
    /// Stored as an integer of `round(value * factor)`.
    Float {
        #[serde(default = "default_min_f")]
        min: f64,
        #[serde(default = "default_max_f")]
        max: f64,
        #[serde(default)]
        default: f64,
        #[serde(default = "default_factor")]
        factor: f64,
    },
    String {
        #[serde(default)]
        default: String,
    },
    Enum {
        values: Vec<String>,
        #[serde(default)]
        default: i64,
    },
    Action,
}

fn default_min_f() -> f64 {
    f64::from(i32::MIN)
}

fn default_max_f() -> f64 {
    f64::from(i32::MAX)
}

/// Immutable metadata of one named parameter.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ParameterDescriptor {
    pub id: String,
    #[serde(default)]
    pub flags: Flags,
    #[serde(default)]
    pub physical: Physical,
    pub logical: LogicalType,
    #[serde(default)]
    pub unit: String,
}

impl ParameterDescriptor {
    /// Value a freshly paired device starts with.
    pub fn default_value(&self) -> Value {
        match &self.logical {
            LogicalType::Boolean { default } => Value::Boolean(*default),
            LogicalType::Integer { default, .. } | LogicalType::Enum { default, .. } => {
                Value::Integer(*default)
            }
            LogicalType::Float { default, .. } => Value::Float(*default),
            LogicalType::String { default } => Value::String(default.clone()),
            LogicalType::Action => Value::Boolean(false),
        }
    }

    /// Zero/empty value of the type. Returned in place of password payloads.
    pub fn zero_value(&self) -> Value {
        match &self.logical {
            LogicalType::Boolean { .. } | LogicalType::Action => Value::Boolean(false),
            LogicalType::Integer { .. } | LogicalType::Enum { .. } => Value::Integer(0),
            LogicalType::Float { .. } => Value::Float(0.0),
            LogicalType::String { .. } => Value::String(String::new()),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match &self.logical {
            LogicalType::Boolean { .. } => "BOOL",
            LogicalType::Integer { .. } => "INTEGER",
            LogicalType::Float { .. } => "FLOAT",
            LogicalType::String { .. } => "STRING",
            LogicalType::Enum { .. } => "ENUM",
            LogicalType::Action => "ACTION",
        }
    }

    /// Whether the parameter is pushed to the device when changed.
    pub fn is_device_config(&self) -> bool {
        matches!(
            self.physical.operation,
            OperationType::Config | OperationType::ConfigString
        )
    }

    /// Paramset description record as the hub expects it.
    pub fn description(&self, tab_order: usize) -> Value {
        let mut operations = 0i64;
        if self.flags.readable {
            operations |= 1;
        }
        if self.flags.writable {
            operations |= 2;
        }
        let mut ui_flags = 0i64;
        if self.flags.visible {
            ui_flags |= 0x01;
        }
        if self.flags.internal {
            ui_flags |= 0x02;
        }
        if self.flags.service {
            ui_flags |= 0x08;
        }
        let default = if self.flags.password {
            self.zero_value()
        } else {
            self.default_value()
        };
        let mut record = StructBuilder::new()
            .field("ID", self.id.as_str())
            .field("TYPE", self.type_name())
            .field("OPERATIONS", operations)
            .field("FLAGS", ui_flags)
            .field("DEFAULT", default)
            .field("UNIT", self.unit.as_str())
            .field("TAB_ORDER", tab_order as i64);
        match &self.logical {
            LogicalType::Integer { min, max, .. } => {
                record = record.field("MIN", *min).field("MAX", *max);
            }
            LogicalType::Float { min, max, .. } => {
                record = record.field("MIN", *min).field("MAX", *max);
            }
            LogicalType::Enum { values, .. } => {
                let list: Vec<Value> = values.iter().map(|v| Value::from(v.as_str())).collect();
                record = record
                    .field("MIN", 0i64)
                    .field("MAX", values.len().saturating_sub(1) as i64)
                    .field("VALUE_LIST", list);
            }
            LogicalType::Boolean { .. } | LogicalType::Action => {
                record = record.field("MIN", false).field("MAX", true);
            }
            LogicalType::String { .. } => {}
        }
        record.build()
    }

    fn validate(&self) -> Result<(), CatalogError> {
        if self.id.is_empty() {
            return Err(CatalogError::Invalid("parameter without id".into()));
        }
        if self.physical.bit_offset > 7 {
            return Err(CatalogError::Invalid(format!(
                "{}: bit offset {} out of range",
                self.id, self.physical.bit_offset
            )));
        }
        let bits = self.physical.size_bits;
        match &self.logical {
            LogicalType::String { .. } => Ok(()),
            LogicalType::Boolean { .. } | LogicalType::Action if !(1..=8).contains(&bits) => Err(
                CatalogError::Invalid(format!("{}: boolean width {} out of range", self.id, bits)),
            ),
            LogicalType::Integer { min, max, default } => {
                if !(1..=32).contains(&bits) || min > max || default < min || default > max {
                    return Err(CatalogError::Invalid(format!(
                        "{}: inconsistent integer layout",
                        self.id
                    )));
                }
                let (lo, hi) = field_range(bits, *min < 0);
                if *min < lo || *max > hi {
                    return Err(CatalogError::Invalid(format!(
                        "{}: range {}..={} does not fit in {} bits",
                        self.id, min, max, bits
                    )));
                }
                Ok(())
            }
            LogicalType::Float { min, max, factor, .. } => {
                if !(1..=32).contains(&bits) || min > max || *factor <= 0.0 {
                    return Err(CatalogError::Invalid(format!(
                        "{}: inconsistent float layout",
                        self.id
                    )));
                }
                let (lo, hi) = field_range(bits, *min < 0.0);
                if (min * factor).round() < lo as f64 || (max * factor).round() > hi as f64 {
                    return Err(CatalogError::Invalid(format!(
                        "{}: scaled range does not fit in {} bits",
                        self.id, bits
                    )));
                }
                Ok(())
            }
            LogicalType::Enum { values, default } => {
                if !(1..=32).contains(&bits)
                    || values.is_empty()
                    || *default as usize >= values.len()
                    || values.len() as i64 - 1 > field_range(bits, false).1
                {
                    return Err(CatalogError::Invalid(format!(
                        "{}: inconsistent enum layout",
                        self.id
                    )));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Smallest and largest raw value a `bits` wide field holds.
fn field_range(bits: u32, signed: bool) -> (i64, i64) {
    if signed {
        (-(1i64 << (bits - 1)), (1i64 << (bits - 1)) - 1)
    } else {
        (0, (1i64 << bits) - 1)
    }
}

/// Ordered set of parameters of one channel and kind.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(from = "Vec<ParameterDescriptor>")]
pub struct ParameterGroup {
    parameters: Vec<Arc<ParameterDescriptor>>,
    by_id: HashMap<String, usize>,
}

impl From<Vec<ParameterDescriptor>> for ParameterGroup {
    fn from(list: Vec<ParameterDescriptor>) -> Self {
        let mut group = ParameterGroup::default();
        for p in list {
            group.by_id.insert(p.id.clone(), group.parameters.len());
            group.parameters.push(Arc::new(p));
        }
        group
    }
}

impl ParameterGroup {
    pub fn get(&self, id: &str) -> Option<&Arc<ParameterDescriptor>> {
        self.by_id.get(id).map(|&i| &self.parameters[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ParameterDescriptor>> {
        self.parameters.iter()
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Paramset description: parameter id -> description record.
    pub fn description(&self) -> Value {
        let mut out = BTreeMap::new();
        for (i, p) in self.parameters.iter().enumerate() {
            if p.id.is_empty() || !p.flags.visible {
                continue;
            }
            out.insert(p.id.clone(), p.description(i));
        }
        Value::Struct(out)
    }
}

/// One logical sub-address of a device.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Channel {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub config: ParameterGroup,
    #[serde(default)]
    pub values: ParameterGroup,
    #[serde(default)]
    pub link: Option<ParameterGroup>,
}

impl Channel {
    pub fn group(&self, kind: ParamsetKind) -> Option<&ParameterGroup> {
        match kind {
            ParamsetKind::Config => Some(&self.config),
            ParamsetKind::Values => Some(&self.values),
            ParamsetKind::Link => self.link.as_ref(),
        }
    }
}

/// A device type/firmware combination a description applies to.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SupportedDevice {
    pub id: String,
    pub type_number: u32,
    #[serde(default)]
    pub min_firmware: u32,
    #[serde(default)]
    pub max_firmware: Option<u32>,
    #[serde(default)]
    pub description: String,
}

impl SupportedDevice {
    fn matches(&self, device_type: u32, firmware: u32) -> bool {
        self.type_number == device_type
            && firmware >= self.min_firmware
            && self.max_firmware.map_or(true, |max| firmware <= max)
    }
}

/// Per-channel parameter tables of one device family member.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceDescription {
    pub id: String,
    pub supported: Vec<SupportedDevice>,
    pub channels: BTreeMap<u32, Channel>,
}

impl DeviceDescription {
    /// Parse and validate a JSON device description.
    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let description: DeviceDescription = serde_json::from_str(json)?;
        description.validate()?;
        Ok(description)
    }

    pub fn channel(&self, channel: u32) -> Option<&Channel> {
        self.channels.get(&channel)
    }

    pub fn group(&self, channel: u32, kind: ParamsetKind) -> Option<&ParameterGroup> {
        self.channel(channel).and_then(|c| c.group(kind))
    }

    /// Type entry for a device type and firmware.
    pub fn supported_device(&self, device_type: u32, firmware: u32) -> Option<&SupportedDevice> {
        self.supported
            .iter()
            .find(|s| s.matches(device_type, firmware))
    }

    fn validate(&self) -> Result<(), CatalogError> {
        if self.supported.is_empty() {
            return Err(CatalogError::Invalid(format!(
                "{}: no supported device types",
                self.id
            )));
        }
        for channel in self.channels.values() {
            for group in [Some(&channel.config), Some(&channel.values), channel.link.as_ref()]
                .into_iter()
                .flatten()
            {
                for p in group.iter() {
                    p.validate()?;
                }
            }
        }
        Ok(())
    }
}

/// All device descriptions known to the family. Built once, then shared read-only.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    devices: Vec<Arc<DeviceDescription>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog containing only the compiled-in generic IP camera.
    pub fn builtin() -> Result<Self, CatalogError> {
        let mut catalog = Self::new();
        catalog.add(DeviceDescription::from_json(BUILTIN_IPCAM)?);
        Ok(catalog)
    }

    pub fn add(&mut self, description: DeviceDescription) {
        self.devices.push(Arc::new(description));
    }

    /// Load every `*.json` file of a directory. Returns the number of descriptions added.
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize, CatalogError> {
        let mut added = 0;
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().map_or(false, |ext| ext == "json"))
            .collect();
        paths.sort();
        for path in paths {
            let json = std::fs::read_to_string(&path)?;
            match DeviceDescription::from_json(&json) {
                Ok(d) => {
                    tracing::debug!(path = %path.display(), id = %d.id, "Loaded device description");
                    self.add(d);
                    added += 1;
                }
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "Skipping device description");
                }
            }
        }
        Ok(added)
    }

    /// Description matching a device type and firmware. Later additions win.
    pub fn find(&self, device_type: u32, firmware: u32) -> Option<Arc<DeviceDescription>> {
        self.devices
            .iter()
            .rev()
            .find(|d| d.supported_device(device_type, firmware).is_some())
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("invalid device description json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid device description: {0}")]
    Invalid(String),
}
