//! BlueZ-backed transport implementation.
//!
//! The connect worker runs as its own tokio task so that a wedged BlueZ
//! operation never blocks the supervisor: a graceful stop is a cancellation
//! signal the worker selects on, a forced stop aborts the task outright.

use std::{
   pin::Pin,
   sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   },
   time::Duration,
};

use async_trait::async_trait;
use bluer::{
   Adapter, Address,
   gatt::remote::Characteristic,
};
use futures::{Stream, StreamExt};
use log::{debug, info};
use smol_str::SmolStr;
use tokio::{
   sync::{Notify, oneshot},
   task::JoinHandle,
   time,
};

use crate::{
   error::Result,
   transport::{
      AddressType, Attempt, CharacteristicBinding, DeviceTarget, NotifyHandler, Session,
      Transport, TransportError,
   },
};

fn bluer_address_type(kind: AddressType) -> bluer::AddressType {
   match kind {
      AddressType::Random => bluer::AddressType::LeRandom,
      AddressType::Public => bluer::AddressType::LePublic,
   }
}

/// Transport backed by the system BlueZ daemon.
pub struct BluerTransport {
   // the session must outlive every adapter handle cloned from it
   _session: bluer::Session,
   adapter: Adapter,
}

impl BluerTransport {
   /// Opens the default adapter and powers it on if needed.
   pub async fn new() -> Result<Self> {
      let session = bluer::Session::new().await?;
      let adapter = session.default_adapter().await?;
      if !adapter.is_powered().await? {
         adapter.set_powered(true).await?;
         info!("powered on adapter {}", adapter.name());
      }
      Ok(Self {
         _session: session,
         adapter,
      })
   }
}

impl Transport for BluerTransport {
   type Attempt = BluerAttempt;
   type Session = BluerSession;

   fn begin(&self, target: &DeviceTarget) -> BluerAttempt {
      BluerAttempt {
         adapter: self.adapter.clone(),
         address: target.address().into(),
         address_type: target.address_type(),
         cancel: Arc::new(Notify::new()),
         worker: parking_lot::Mutex::new(None),
      }
   }
}

/// One in-flight BlueZ connection attempt.
pub struct BluerAttempt {
   adapter: Adapter,
   address: SmolStr,
   address_type: AddressType,
   cancel: Arc<Notify>,
   worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Attempt for BluerAttempt {
   type Session = BluerSession;

   async fn establish(&self, timeout: Duration) -> std::result::Result<BluerSession, TransportError> {
      let address: Address = self
         .address
         .parse()
         .map_err(|_| TransportError::Disconnected("unparseable device address".into()))?;
      let address_type = bluer_address_type(self.address_type);
      let adapter = self.adapter.clone();
      let cancel = self.cancel.clone();

      let (tx, rx) = oneshot::channel();
      let task = tokio::spawn(async move {
         let connect = async {
            adapter
               .connect_device(address, address_type)
               .await
               .map_err(|e| TransportError::Disconnected(e.to_string().into()))
         };
         let result = tokio::select! {
            _ = cancel.notified() => Err(TransportError::WorkerKilled),
            r = connect => r,
         };
         let _ = tx.send(result);
      });
      *self.worker.lock() = Some(task);

      let device = match time::timeout(timeout, rx).await {
         Err(_) => {
            // our own deadline, not a wedge: reap the worker ourselves
            self.force_kill();
            return Err(TransportError::ConnectTimeout);
         },
         Ok(Err(_)) => return Err(TransportError::WorkerKilled),
         Ok(Ok(result)) => result?,
      };

      debug!("transport link to {address} established");
      Ok(BluerSession {
         device,
         characteristic: parking_lot::Mutex::new(None),
         stream: tokio::sync::Mutex::new(None),
         alive: AtomicBool::new(true),
      })
   }

   fn request_stop(&self) {
      self.cancel.notify_one();
   }

   fn force_kill(&self) {
      if let Some(task) = self.worker.lock().take() {
         task.abort();
      }
   }

   fn is_alive(&self) -> bool {
      self.worker.lock().as_ref().is_some_and(|t| !t.is_finished())
   }
}

impl Drop for BluerAttempt {
   fn drop(&mut self) {
      self.force_kill();
   }
}

type NotificationStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// An open BlueZ GATT session.
pub struct BluerSession {
   device: bluer::Device,
   characteristic: parking_lot::Mutex<Option<Characteristic>>,
   /// Stream plus handler live under one async lock so that handler
   /// invocations for this session are strictly ordered.
   stream: tokio::sync::Mutex<Option<(NotificationStream, NotifyHandler)>>,
   alive: AtomicBool,
}

impl BluerSession {
   async fn resolve_characteristic(
      &self,
      binding: &CharacteristicBinding,
   ) -> std::result::Result<Characteristic, TransportError> {
      let discovery_err =
         |msg: String| TransportError::Discovery(SmolStr::from(msg));
      let bluer_err =
         |e: bluer::Error| TransportError::Discovery(e.to_string().into());

      let mut matched_service = None;
      for service in self.device.services().await.map_err(bluer_err)? {
         if service.uuid().await.map_err(bluer_err)? == binding.service {
            if matched_service.replace(service).is_some() {
               return Err(discovery_err(format!(
                  "more than one service matches {}",
                  binding.service
               )));
            }
         }
      }
      let service = matched_service
         .ok_or_else(|| discovery_err(format!("service {} not found", binding.service)))?;

      let mut matched_char = None;
      for characteristic in service.characteristics().await.map_err(bluer_err)? {
         if characteristic.uuid().await.map_err(bluer_err)? == binding.characteristic {
            if matched_char.replace(characteristic).is_some() {
               return Err(discovery_err(format!(
                  "more than one characteristic matches {}",
                  binding.characteristic
               )));
            }
         }
      }
      matched_char.ok_or_else(|| {
         discovery_err(format!(
            "characteristic {} not found",
            binding.characteristic
         ))
      })
   }
}

#[async_trait]
impl Session for BluerSession {
   async fn discover(&self, binding: &CharacteristicBinding) -> std::result::Result<(), TransportError> {
      let characteristic = self.resolve_characteristic(binding).await?;
      debug!(
         "resolved characteristic {} on {}",
         binding.characteristic,
         self.device.address()
      );
      *self.characteristic.lock() = Some(characteristic);
      Ok(())
   }

   async fn subscribe(&self, on_data: NotifyHandler) -> std::result::Result<(), TransportError> {
      let characteristic = self
         .characteristic
         .lock()
         .clone()
         .ok_or_else(|| TransportError::Discovery("subscribe before discovery".into()))?;
      let stream = characteristic
         .notify()
         .await
         .map_err(|e| TransportError::Disconnected(e.to_string().into()))?;
      *self.stream.lock().await = Some((Box::pin(stream), on_data));
      Ok(())
   }

   async fn wait_for_notification(
      &self,
      timeout: Option<Duration>,
   ) -> std::result::Result<bool, TransportError> {
      let mut guard = self.stream.lock().await;
      let Some((stream, handler)) = guard.as_mut() else {
         return Err(TransportError::NotificationWait("session is not subscribed".into()));
      };

      let item = match timeout {
         Some(t) => match time::timeout(t, stream.next()).await {
            Err(_) => return Ok(false),
            Ok(item) => item,
         },
         None => stream.next().await,
      };

      match item {
         Some(data) => {
            handler(&data);
            Ok(true)
         },
         None => {
            self.alive.store(false, Ordering::Relaxed);
            Err(TransportError::Disconnected("notification stream ended".into()))
         },
      }
   }

   async fn disconnect(&self) {
      self.alive.store(false, Ordering::Relaxed);
      *self.stream.lock().await = None;
      if let Err(e) = self.device.disconnect().await {
         debug!("disconnect from {} failed: {e}", self.device.address());
      }
   }

   fn is_alive(&self) -> bool {
      self.alive.load(Ordering::Relaxed)
   }

   fn force_terminate(&self) {
      self.alive.store(false, Ordering::Relaxed);
      let device = self.device.clone();
      tokio::spawn(async move {
         let _ = device.disconnect().await;
      });
   }
}
