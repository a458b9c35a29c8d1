//! Errors surfaced to the hub, each with a stable RPC error code.

use crate::catalog::CatalogError;
use crate::identity::InvalidSerial;
use crate::params::StoreError;
use crate::storage::StorageError;
use crate::wire::CodecError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid serial number: {0}")]
    InvalidSerial(#[from] InvalidSerial),
    #[error("a device with serial number {0} is already paired")]
    AlreadyPaired(String),
    #[error("unsupported device type 0x{0:04X}")]
    UnsupportedDeviceType(u32),
    #[error("unknown device")]
    UnknownDevice,
    #[error("unknown channel {0}")]
    UnknownChannel(u32),
    #[error("unknown parameter {0}")]
    UnknownParameter(String),
    #[error("unknown parameter set")]
    UnknownParamset,
    #[error("parameter set type is not supported")]
    UnsupportedParamsetType,
    #[error("parameter {0} is not readable")]
    NotReadable(String),
    #[error("peer is being disposed")]
    Disposing,
    #[error(transparent)]
    InvalidValue(#[from] CodecError),
    #[error("custom url: {0}")]
    CustomUrl(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Numeric error code the hub reports to RPC callers.
    pub fn code(&self) -> i32 {
        match self {
            Error::InvalidSerial(_) | Error::CustomUrl(_) | Error::InvalidValue(_) => -1,
            Error::UnknownDevice | Error::UnknownChannel(_) => -2,
            Error::UnknownParamset | Error::UnsupportedParamsetType => -3,
            Error::AlreadyPaired(_) | Error::UnknownParameter(_) => -5,
            Error::UnsupportedDeviceType(_) | Error::NotReadable(_) => -6,
            Error::Disposing | Error::Storage(_) | Error::Catalog(_) | Error::Internal(_) => {
                -32500
            }
        }
    }
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { id, .. } => Error::UnknownParameter(id),
            StoreError::Codec(e) => Error::InvalidValue(e),
            StoreError::Storage(e) => Error::Storage(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
