//! Error types for hrlink.
//!
//! This module defines all error types that can occur while streaming heart
//! rate data, including transport, configuration, I/O, and LSL errors.

use smol_str::SmolStr;
use thiserror::Error;

use crate::transport::TransportError;

/// Main error type for hrlink.
#[derive(Error, Debug)]
pub enum HrLinkError {
   /// Malformed device address. Fatal: never reaches the transport.
   #[error("malformed device address {0:?}: expected six colon-separated hex octets")]
   AddressFormat(SmolStr),

   /// Unknown address type. Fatal: never reaches the transport.
   #[error("invalid address type {0:?}: expected \"random\" or \"public\"")]
   AddressType(SmolStr),

   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("transport error: {0}")]
   Transport(#[from] TransportError),

   #[error("supervisor has been shut down")]
   SupervisorShutdown,

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("could not determine config directory")]
   ConfigDirNotFound,

   #[error("LSL error: {0}")]
   Lsl(String),
}

/// Convenience type alias for Results with `HrLinkError`.
pub type Result<T> = std::result::Result<T, HrLinkError>;
