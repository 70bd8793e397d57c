//! Scriptable in-memory transport.
//!
//! Used by the test suite and for running the pipeline without hardware.
//! Each connection attempt follows a scripted plan; notifications are
//! injected by hand. Counters expose what the supervisor did to the
//! transport (connects, stop requests, kills).

use std::{
   collections::VecDeque,
   sync::{
      Arc,
      atomic::{AtomicBool, AtomicU64, Ordering},
   },
   time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{sync::Notify, time};

use crate::transport::{
   Attempt, CharacteristicBinding, DeviceTarget, NotifyHandler, Session, Transport,
   TransportError,
};

/// How a scripted connection attempt behaves.
#[derive(Debug, Clone)]
pub enum AttemptPlan {
   /// Connects after a short delay.
   Succeed,
   /// Fails with the given error after a short delay.
   Fail(TransportError),
   /// Never completes on its own; ignores stop requests but dies when
   /// force-killed.
   Hang,
   /// Never completes and ignores every signal; after a force kill the
   /// worker handle reads as lost. Models the unreapable worker case.
   Wedge,
}

#[derive(Default)]
struct MockShared {
   plans: Mutex<VecDeque<AttemptPlan>>,
   connects_started: AtomicU64,
   in_flight: AtomicU64,
   max_in_flight: AtomicU64,
   stops_requested: AtomicU64,
   force_kills: AtomicU64,
   disconnects: AtomicU64,
   queue: Mutex<VecDeque<Vec<u8>>>,
   queue_notify: Notify,
   fail_next_wait: AtomicBool,
}

/// Handle to the scripted transport. Cheaply cloneable; clones share the
/// script and counters.
#[derive(Clone, Default)]
pub struct MockTransport {
   shared: Arc<MockShared>,
}

impl MockTransport {
   pub fn new() -> Self {
      Self::default()
   }

   /// Queues a plan for the next attempt. Attempts beyond the scripted
   /// queue succeed.
   pub fn plan(&self, plan: AttemptPlan) {
      self.shared.plans.lock().push_back(plan);
   }

   /// Delivers a notification payload to the open session.
   pub fn inject_notification(&self, data: &[u8]) {
      self.shared.queue.lock().push_back(data.to_vec());
      self.shared.queue_notify.notify_waiters();
   }

   /// Makes the next notification wait fail, simulating a link drop.
   pub fn fail_next_wait(&self) {
      self.shared.fail_next_wait.store(true, Ordering::Relaxed);
   }

   pub fn connects_started(&self) -> u64 {
      self.shared.connects_started.load(Ordering::Relaxed)
   }

   /// Highest number of connect calls ever simultaneously in flight.
   pub fn max_in_flight(&self) -> u64 {
      self.shared.max_in_flight.load(Ordering::Relaxed)
   }

   pub fn stops_requested(&self) -> u64 {
      self.shared.stops_requested.load(Ordering::Relaxed)
   }

   pub fn force_kills(&self) -> u64 {
      self.shared.force_kills.load(Ordering::Relaxed)
   }

   pub fn disconnects(&self) -> u64 {
      self.shared.disconnects.load(Ordering::Relaxed)
   }
}

impl Transport for MockTransport {
   type Attempt = MockAttempt;
   type Session = MockSession;

   fn begin(&self, _target: &DeviceTarget) -> MockAttempt {
      let plan = self
         .shared
         .plans
         .lock()
         .pop_front()
         .unwrap_or(AttemptPlan::Succeed);
      MockAttempt {
         shared: self.shared.clone(),
         plan,
         cancel: Notify::new(),
         lost: AtomicBool::new(false),
         active: AtomicBool::new(false),
      }
   }
}

/// Decrements the in-flight counter even when the attempt task is aborted.
struct InFlightGuard(Arc<MockShared>);

impl InFlightGuard {
   fn enter(shared: &Arc<MockShared>) -> Self {
      shared.connects_started.fetch_add(1, Ordering::SeqCst);
      let now = shared.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
      shared.max_in_flight.fetch_max(now, Ordering::SeqCst);
      Self(shared.clone())
   }
}

impl Drop for InFlightGuard {
   fn drop(&mut self) {
      self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
   }
}

pub struct MockAttempt {
   shared: Arc<MockShared>,
   plan: AttemptPlan,
   cancel: Notify,
   lost: AtomicBool,
   active: AtomicBool,
}

#[async_trait]
impl Attempt for MockAttempt {
   type Session = MockSession;

   async fn establish(&self, _timeout: Duration) -> Result<MockSession, TransportError> {
      let _guard = InFlightGuard::enter(&self.shared);
      self.active.store(true, Ordering::SeqCst);

      let result = match &self.plan {
         AttemptPlan::Succeed => {
            time::sleep(Duration::from_millis(5)).await;
            Ok(MockSession {
               shared: self.shared.clone(),
               handler: Mutex::new(None),
               alive: AtomicBool::new(true),
            })
         },
         AttemptPlan::Fail(e) => {
            time::sleep(Duration::from_millis(5)).await;
            Err(e.clone())
         },
         AttemptPlan::Hang => {
            self.cancel.notified().await;
            Err(TransportError::WorkerKilled)
         },
         AttemptPlan::Wedge => {
            futures::future::pending::<()>().await;
            unreachable!()
         },
      };

      self.active.store(false, Ordering::SeqCst);
      result
   }

   fn request_stop(&self) {
      self.shared.stops_requested.fetch_add(1, Ordering::SeqCst);
      // scripted workers ignore the polite request
   }

   fn force_kill(&self) {
      self.shared.force_kills.fetch_add(1, Ordering::SeqCst);
      match self.plan {
         AttemptPlan::Wedge => {
            self.lost.store(true, Ordering::SeqCst);
         },
         _ => self.cancel.notify_one(),
      }
   }

   fn is_alive(&self) -> bool {
      !self.lost.load(Ordering::SeqCst) && self.active.load(Ordering::SeqCst)
   }
}

pub struct MockSession {
   shared: Arc<MockShared>,
   handler: Mutex<Option<NotifyHandler>>,
   alive: AtomicBool,
}

#[async_trait]
impl Session for MockSession {
   async fn discover(&self, _binding: &CharacteristicBinding) -> Result<(), TransportError> {
      Ok(())
   }

   async fn subscribe(&self, on_data: NotifyHandler) -> Result<(), TransportError> {
      *self.handler.lock() = Some(on_data);
      Ok(())
   }

   async fn wait_for_notification(
      &self,
      timeout: Option<Duration>,
   ) -> Result<bool, TransportError> {
      loop {
         if self.shared.fail_next_wait.swap(false, Ordering::Relaxed) {
            self.alive.store(false, Ordering::Relaxed);
            return Err(TransportError::Disconnected("simulated link drop".into()));
         }
         if let Some(data) = self.shared.queue.lock().pop_front() {
            if let Some(handler) = self.handler.lock().clone() {
               handler(&data);
            }
            return Ok(true);
         }
         let notified = self.shared.queue_notify.notified();
         if let Some(data) = self.shared.queue.lock().pop_front() {
            if let Some(handler) = self.handler.lock().clone() {
               handler(&data);
            }
            return Ok(true);
         }
         match timeout {
            Some(t) => {
               if time::timeout(t, notified).await.is_err() {
                  return Ok(false);
               }
            },
            None => notified.await,
         }
      }
   }

   async fn disconnect(&self) {
      if self.alive.swap(false, Ordering::Relaxed) {
         self.shared.disconnects.fetch_add(1, Ordering::SeqCst);
      }
   }

   fn is_alive(&self) -> bool {
      self.alive.load(Ordering::Relaxed)
   }

   fn force_terminate(&self) {
      self.alive.store(false, Ordering::Relaxed);
   }
}
