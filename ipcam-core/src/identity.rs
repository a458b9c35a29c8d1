//! Device identity: serial numbers and the hub addresses derived from them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Exact length of a camera serial number.
pub const SERIAL_LEN: usize = 10;

/// Validated 10-character serial number. Unique within a registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SerialNumber(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("serial number must be exactly {SERIAL_LEN} characters, got {0}")]
pub struct InvalidSerial(pub usize);

impl SerialNumber {
    pub fn parse(s: &str) -> Result<Self, InvalidSerial> {
        let len = s.chars().count();
        if len != SERIAL_LEN {
            return Err(InvalidSerial(len));
        }
        Ok(SerialNumber(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hub address of one channel: `SERIAL:channel`.
    pub fn channel_address(&self, channel: u32) -> String {
        format!("{}:{}", self.0, channel)
    }
}

impl TryFrom<String> for SerialNumber {
    type Error = InvalidSerial;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<SerialNumber> for String {
    fn from(s: SerialNumber) -> Self {
        s.0
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Addresses of a device and each of its channels, as announced on add and delete.
pub fn device_addresses<'a>(
    serial: &SerialNumber,
    channels: impl IntoIterator<Item = &'a u32>,
) -> Vec<String> {
    std::iter::once(serial.to_string())
        .chain(channels.into_iter().map(|c| serial.channel_address(*c)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_enforced() {
        assert!(SerialNumber::parse("ABCDEFGHIJ").is_ok());
        assert_eq!(SerialNumber::parse("ABCDEFGHI"), Err(InvalidSerial(9)));
        assert_eq!(SerialNumber::parse("ABCDEFGHIJK"), Err(InvalidSerial(11)));
        assert_eq!(SerialNumber::parse(""), Err(InvalidSerial(0)));
    }

    #[test]
    fn addresses() {
        let s = SerialNumber::parse("CAM0000001").unwrap();
        assert_eq!(
            device_addresses(&s, &[0, 1]),
            vec!["CAM0000001", "CAM0000001:0", "CAM0000001:1"]
        );
    }

    #[test]
    fn serde_validates() {
        let ok: Result<SerialNumber, _> = serde_json::from_str("\"ABCDEFGHIJ\"");
        assert!(ok.is_ok());
        let bad: Result<SerialNumber, _> = serde_json::from_str("\"SHORT\"");
        assert!(bad.is_err());
    }
}
