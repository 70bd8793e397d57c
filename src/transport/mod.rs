//! Transport capability boundary.
//!
//! The supervisor drives a BLE link exclusively through the traits in this
//! module; it never inspects transport internals beyond the supervision
//! hooks (`is_alive`/`force_kill`). Implementations may be backed by a
//! native BLE stack binding or by a scriptable fake.

use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;
use smol_str::SmolStr;
use thiserror::Error;
use uuid::Uuid;

use crate::error::HrLinkError;

pub mod ble;
pub mod mock;

/// Errors surfaced by a transport implementation.
///
/// All of these are retryable under the reconnection policy; fatal
/// configuration problems are rejected before a transport is ever touched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
   #[error("connection attempt timed out")]
   ConnectTimeout,

   #[error("transport disconnected: {0}")]
   Disconnected(SmolStr),

   #[error("service or characteristic discovery failed: {0}")]
   Discovery(SmolStr),

   #[error("notification wait failed: {0}")]
   NotificationWait(SmolStr),

   #[error("transport worker was terminated")]
   WorkerKilled,
}

/// BLE address kind of the target device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
   Random,
   Public,
}

impl FromStr for AddressType {
   type Err = HrLinkError;

   fn from_str(s: &str) -> Result<Self, Self::Err> {
      match s {
         "random" => Ok(Self::Random),
         "public" => Ok(Self::Public),
         other => Err(HrLinkError::AddressType(other.into())),
      }
   }
}

impl fmt::Display for AddressType {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         Self::Random => f.write_str("random"),
         Self::Public => f.write_str("public"),
      }
   }
}

/// The GATT service/characteristic pair a session subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicBinding {
   pub service: Uuid,
   pub characteristic: Uuid,
}

/// Immutable description of one target device.
#[derive(Debug, Clone)]
pub struct DeviceTarget {
   address: SmolStr,
   address_type: AddressType,
   binding: CharacteristicBinding,
}

impl DeviceTarget {
   /// Validates the address and builds a target.
   ///
   /// The address must be six colon-separated hex octets; anything else is
   /// rejected here, before any transport attempt can start.
   pub fn new(
      address: &str,
      address_type: AddressType,
      binding: CharacteristicBinding,
   ) -> Result<Self, HrLinkError> {
      if !is_valid_address(address) {
         return Err(HrLinkError::AddressFormat(address.into()));
      }
      Ok(Self {
         address: address.into(),
         address_type,
         binding,
      })
   }

   pub fn address(&self) -> &str {
      &self.address
   }

   pub fn address_type(&self) -> AddressType {
      self.address_type
   }

   pub fn binding(&self) -> &CharacteristicBinding {
      &self.binding
   }
}

fn is_valid_address(address: &str) -> bool {
   let octets: Vec<&str> = address.split(':').collect();
   octets.len() == 6
      && octets
         .iter()
         .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Callback invoked with each raw notification payload.
pub type NotifyHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Factory for connection attempts against one kind of BLE backend.
pub trait Transport: Send + Sync + 'static {
   type Attempt: Attempt<Session = Self::Session>;
   type Session: Session;

   /// Begins a connection attempt. Must be cheap and must not block; the
   /// returned handle is what the watchdog escalates against.
   fn begin(&self, target: &DeviceTarget) -> Self::Attempt;
}

/// A single in-flight connection attempt.
///
/// The handle is shared between the task driving [`Attempt::establish`] and
/// the supervisor's watchdog, which only ever calls the non-blocking
/// supervision methods.
#[async_trait]
pub trait Attempt: Send + Sync + 'static {
   type Session: Session;

   /// Drives the attempt to an open transport session.
   async fn establish(&self, timeout: Duration) -> Result<Self::Session, TransportError>;

   /// Asks the transport worker to wind down gracefully. Must not block.
   fn request_stop(&self);

   /// Kills the transport worker outright. Must not block.
   fn force_kill(&self);

   /// Whether a worker handle is still there to signal.
   fn is_alive(&self) -> bool;
}

/// An open transport session.
#[async_trait]
pub trait Session: Send + Sync + 'static {
   /// Resolves the target service and characteristic.
   ///
   /// Exactly one match is required for each; zero or several matches fail
   /// with [`TransportError::Discovery`].
   async fn discover(&self, binding: &CharacteristicBinding) -> Result<(), TransportError>;

   /// Arms notification delivery: future inbound notifications invoke
   /// `on_data`.
   async fn subscribe(&self, on_data: NotifyHandler) -> Result<(), TransportError>;

   /// Blocks until a notification arrives (the handler has already run by
   /// the time this returns `Ok(true)`), the timeout elapses (`Ok(false)`),
   /// or the transport drops. `None` waits indefinitely.
   async fn wait_for_notification(
      &self,
      timeout: Option<Duration>,
   ) -> Result<bool, TransportError>;

   /// Idempotent, best-effort.
   async fn disconnect(&self);

   fn is_alive(&self) -> bool;

   /// Drops the session resources without waiting. Must not block.
   fn force_terminate(&self);
}

#[cfg(test)]
mod tests {
   use super::*;
   use uuid::uuid;

   fn binding() -> CharacteristicBinding {
      CharacteristicBinding {
         service: uuid!("0000180d-0000-1000-8000-00805f9b34fb"),
         characteristic: uuid!("00002a37-0000-1000-8000-00805f9b34fb"),
      }
   }

   #[test]
   fn accepts_well_formed_addresses() {
      for addr in ["F6:4A:06:35:E9:BA", "00:11:22:aa:bb:cc"] {
         assert!(DeviceTarget::new(addr, AddressType::Random, binding()).is_ok());
      }
   }

   #[test]
   fn rejects_malformed_addresses() {
      for addr in [
         "",
         "F6:4A:06:35:E9",
         "F6:4A:06:35:E9:BA:00",
         "F6-4A-06-35-E9-BA",
         "F6:4A:06:35:E9:Bx",
         "F6:4A:06:35:E9:B",
         "not an address",
      ] {
         let err = DeviceTarget::new(addr, AddressType::Random, binding()).unwrap_err();
         assert!(matches!(err, HrLinkError::AddressFormat(_)), "{addr:?}");
      }
   }

   #[test]
   fn address_type_parsing() {
      assert_eq!("random".parse::<AddressType>().unwrap(), AddressType::Random);
      assert_eq!("public".parse::<AddressType>().unwrap(), AddressType::Public);
      assert!(matches!(
         "0".parse::<AddressType>().unwrap_err(),
         HrLinkError::AddressType(_)
      ));
   }
}
