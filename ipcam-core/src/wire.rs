//! Parameter codec: typed value <-> on-wire bytes per descriptor, plus list-slot merging.
//!
//! Numeric fields are big-endian, `ceil((bit_offset + size_bits) / 8)` bytes long, with the
//! field's least significant bit at `bit_offset` of the last byte. Strings are raw UTF-8.

use std::collections::BTreeMap;

use crate::catalog::{LogicalType, ParameterDescriptor};
use crate::protocol::Value;

/// Error converting a value into its binary form.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("{id}: expected {expected} value")]
    TypeMismatch { id: String, expected: &'static str },
    #[error("{0}: cannot encode an empty value")]
    Void(String),
}

/// Encode `value` for `desc`. Out-of-range numbers are clamped to the declared bounds.
pub fn encode(desc: &ParameterDescriptor, value: &Value) -> Result<Vec<u8>, CodecError> {
    if value.is_void() {
        return Err(CodecError::Void(desc.id.clone()));
    }
    let mismatch = |expected| CodecError::TypeMismatch {
        id: desc.id.clone(),
        expected,
    };
    let raw: i64 = match &desc.logical {
        LogicalType::String { .. } => {
            let s = value.as_str().ok_or_else(|| mismatch("string"))?;
            return Ok(s.as_bytes().to_vec());
        }
        LogicalType::Boolean { .. } => {
            i64::from(value.as_bool().ok_or_else(|| mismatch("boolean"))?)
        }
        LogicalType::Action => 1,
        LogicalType::Integer { min, max, .. } => value
            .as_i64()
            .ok_or_else(|| mismatch("integer"))?
            .clamp(*min, *max),
        LogicalType::Float {
            min, max, factor, ..
        } => {
            let f = value.as_f64().ok_or_else(|| mismatch("float"))?;
            (f.clamp(*min, *max) * factor).round() as i64
        }
        LogicalType::Enum { values, .. } => {
            let last = values.len().saturating_sub(1) as i64;
            match value {
                Value::String(name) => values
                    .iter()
                    .position(|v| v == name)
                    .map(|i| i as i64)
                    .ok_or_else(|| mismatch("enum"))?,
                other => other.as_i64().ok_or_else(|| mismatch("enum"))?.clamp(0, last),
            }
        }
    };
    Ok(pack(raw, desc.physical.size_bits, desc.physical.bit_offset))
}

/// Decode `bytes` for `desc`. Never fails: missing bytes read as zero, invalid UTF-8 is replaced.
pub fn decode(desc: &ParameterDescriptor, bytes: &[u8]) -> Value {
    let bits = desc.physical.size_bits;
    let offset = desc.physical.bit_offset;
    match &desc.logical {
        LogicalType::String { .. } => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        LogicalType::Boolean { .. } | LogicalType::Action => {
            Value::Boolean(unpack(bytes, bits, offset, false) != 0)
        }
        LogicalType::Integer { min, .. } => Value::Integer(unpack(bytes, bits, offset, *min < 0)),
        LogicalType::Float { min, factor, .. } => {
            Value::Float(unpack(bytes, bits, offset, *min < 0.0) as f64 / factor)
        }
        LogicalType::Enum { .. } => Value::Integer(unpack(bytes, bits, offset, false)),
    }
}

/// Byte length of a numeric field including its bit offset.
pub fn byte_len(size_bits: u32, bit_offset: u8) -> usize {
    (size_bits as usize + bit_offset as usize + 7) / 8
}

fn mask(size_bits: u32) -> u64 {
    if size_bits >= 64 {
        u64::MAX
    } else {
        (1u64 << size_bits) - 1
    }
}

fn pack(raw: i64, size_bits: u32, bit_offset: u8) -> Vec<u8> {
    let len = byte_len(size_bits, bit_offset).max(1);
    let shifted = ((raw as u64) & mask(size_bits)) << bit_offset;
    let be = shifted.to_be_bytes();
    be[be.len() - len..].to_vec()
}

fn unpack(bytes: &[u8], size_bits: u32, bit_offset: u8, signed: bool) -> i64 {
    let len = byte_len(size_bits, bit_offset).max(1);
    let word = bytes
        .iter()
        .take(len)
        .fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
    let field = (word >> bit_offset) & mask(size_bits);
    if signed && size_bits > 0 && size_bits < 64 && field & (1u64 << (size_bits - 1)) != 0 {
        (field | !mask(size_bits)) as i64
    } else {
        field as i64
    }
}

/// Accumulates encoded fields per (list, index) slot. Fields sharing a slot are OR-merged,
/// front-aligned, with the slot zero-extended when a later field is longer.
#[derive(Debug, Default, Clone)]
pub struct SlotMerger {
    slots: BTreeMap<(i32, u32), Vec<u8>>,
}

impl SlotMerger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, desc: &ParameterDescriptor, bytes: &[u8]) {
        let key = (desc.physical.list_id(), desc.physical.index);
        let slot = self.slots.entry(key).or_default();
        if bytes.len() > slot.len() {
            slot.resize(bytes.len(), 0);
        }
        for (dst, src) in slot.iter_mut().zip(bytes) {
            *dst |= *src;
        }
    }

    pub fn slot(&self, list: i32, index: u32) -> Option<&[u8]> {
        self.slots.get(&(list, index)).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn into_slots(self) -> BTreeMap<(i32, u32), Vec<u8>> {
        self.slots
    }
}
