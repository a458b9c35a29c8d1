//! Hub-facing value model: typed values, parameter-set kinds and family constants.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Family id the hub uses to route requests to this module.
pub const FAMILY_ID: i32 = 10;

/// Human readable family name.
pub const FAMILY_NAME: &str = "IPCam";

/// Path namespace of the media proxy bridge (`/ipcam/{id}/{action}`).
pub const BRIDGE_NAMESPACE: &str = "ipcam";

/// Typed value exchanged with the hub. Encoding on the host side is up to the RPC layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Void,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Struct(BTreeMap<String, Value>),
}

impl Value {
    pub fn is_void(&self) -> bool {
        matches!(self, Value::Void)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            Value::Integer(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Boolean(b) => Some(i64::from(*b)),
            Value::Float(f) => Some(f.round() as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Struct(m) => Some(m),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self {
        Value::Struct(v)
    }
}

/// Builder for `Value::Struct` records (device descriptions, paramset descriptions).
#[derive(Debug, Default)]
pub struct StructBuilder(BTreeMap<String, Value>);

impl StructBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn build(self) -> Value {
        Value::Struct(self.0)
    }
}

/// Parameter group of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ParamsetKind {
    /// Installer configuration ("MASTER").
    Config,
    /// Live values reported by the device.
    Values,
    /// Direct links between peers. Described by the catalog, never stored.
    Link,
}

impl ParamsetKind {
    /// Name the hub uses in device descriptions.
    pub fn rpc_name(&self) -> &'static str {
        match self {
            ParamsetKind::Config => "MASTER",
            ParamsetKind::Values => "VALUES",
            ParamsetKind::Link => "LINK",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untagged_json_shape() {
        let v = StructBuilder::new()
            .field("ID", 7u64)
            .field("ADDRESS", "CAM0000001")
            .field("MOTION", false)
            .build();
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, r#"{"ADDRESS":"CAM0000001","ID":7,"MOTION":false}"#);
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn coercions() {
        assert_eq!(Value::Boolean(true).as_i64(), Some(1));
        assert_eq!(Value::Integer(0).as_bool(), Some(false));
        assert_eq!(Value::Float(2.6).as_i64(), Some(3));
        assert_eq!(Value::String("x".into()).as_i64(), None);
        assert!(Value::Void.is_void());
    }

    #[test]
    fn paramset_names() {
        assert_eq!(ParamsetKind::Config.rpc_name(), "MASTER");
        assert_eq!(ParamsetKind::Values.rpc_name(), "VALUES");
    }
}
