//! Connection lifecycle supervision for one BLE device.
//!
//! This module owns the connect/monitor/teardown state machine: it serializes
//! connection attempts, escalates against transport workers that stop
//! responding, and re-establishes dropped sessions on a fixed backoff when
//! auto-reconnect is enabled.

use std::{
   sync::{
      Arc,
      atomic::{AtomicU64, Ordering},
   },
   time::{Duration, Instant},
};

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::{task::JoinHandle, time};

use crate::{
   config::Config,
   error::{HrLinkError, Result},
   transport::{Attempt, DeviceTarget, NotifyHandler, Session, Transport, TransportError},
};

/// Lifecycle phase of the supervised connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Phase {
   Idle,
   Connecting,
   Connected,
   Terminating,
}

/// Watchdog progress against a stuck attempt. Advances monotonically within
/// one attempt and resets when the next attempt starts.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Escalation {
   None,
   GracefulRequested,
   ForceRequested,
}

/// Timing knobs and the reconnection mode of a supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
   /// Timeout handed to the transport for a single connect call.
   pub connect_timeout: Duration,
   /// How long the connecting phase may last before the watchdog steps in.
   pub attempt_timeout: Duration,
   /// Spacing between watchdog escalation steps.
   pub escalation_interval: Duration,
   /// Fixed delay between attempts when auto-reconnect is enabled.
   pub reconnect_backoff: Duration,
   /// How long teardown waits for an in-flight attempt before killing it.
   pub shutdown_grace: Duration,
   /// Run attempts in the background and retry indefinitely.
   pub auto_reconnect: bool,
}

impl Default for SupervisorOptions {
   fn default() -> Self {
      Self {
         connect_timeout: Duration::from_secs(20),
         attempt_timeout: Duration::from_secs(30),
         escalation_interval: Duration::from_secs(2),
         reconnect_backoff: Duration::from_secs(2),
         shutdown_grace: Duration::from_secs(3),
         auto_reconnect: false,
      }
   }
}

impl SupervisorOptions {
   pub fn from_config(config: &Config, auto_reconnect: bool) -> Self {
      Self {
         connect_timeout: config.connect_timeout(),
         attempt_timeout: config.attempt_timeout(),
         escalation_interval: config.escalation_interval(),
         reconnect_backoff: config.reconnect_backoff(),
         shutdown_grace: config.shutdown_grace(),
         auto_reconnect,
      }
   }
}

/// All mutable connection state, guarded by one lock.
///
/// Invariant: at most one of {no attempt, one connecting attempt, one live
/// session} at any instant. The lock is never held across an await point.
struct ConnState<T: Transport> {
   phase: Phase,
   attempt: Option<Arc<T::Attempt>>,
   attempt_task: Option<JoinHandle<()>>,
   session: Option<Arc<T::Session>>,
   last_attempt_start: Option<Instant>,
   last_attempt_end: Option<Instant>,
   escalation: Escalation,
   last_escalation_at: Option<Instant>,
}

impl<T: Transport> Default for ConnState<T> {
   fn default() -> Self {
      Self {
         phase: Phase::Idle,
         attempt: None,
         attempt_task: None,
         session: None,
         last_attempt_start: None,
         last_attempt_end: None,
         escalation: Escalation::None,
         last_escalation_at: None,
      }
   }
}

struct Inner<T: Transport> {
   transport: T,
   target: DeviceTarget,
   options: SupervisorOptions,
   handler: NotifyHandler,
   state: Mutex<ConnState<T>>,
   /// Wedged workers the watchdog gave up on. A nonzero count means a stale
   /// transport worker may be lingering somewhere.
   abandoned_workers: AtomicU64,
}

/// Supervises the connection lifecycle of one device.
///
/// Cheaply cloneable; all clones share the same state machine. Each device
/// gets its own supervisor instance.
pub struct DeviceSupervisor<T: Transport> {
   inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for DeviceSupervisor<T> {
   fn clone(&self) -> Self {
      Self {
         inner: self.inner.clone(),
      }
   }
}

impl<T: Transport> DeviceSupervisor<T> {
   pub fn new(
      transport: T,
      target: DeviceTarget,
      options: SupervisorOptions,
      handler: NotifyHandler,
   ) -> Self {
      Self {
         inner: Arc::new(Inner {
            transport,
            target,
            options,
            handler,
            state: Mutex::new(ConnState::default()),
            abandoned_workers: AtomicU64::new(0),
         }),
      }
   }

   /// Starts a connection attempt if none is active.
   ///
   /// With auto-reconnect the attempt runs as a background task and this
   /// returns immediately; otherwise it blocks until the attempt completes
   /// (check [`Self::is_connected`] for the outcome). Calling this while
   /// already connecting or connected is a no-op.
   pub async fn connect(&self) -> Result<()> {
      {
         let mut st = self.inner.state.lock();
         match st.phase {
            Phase::Connected | Phase::Connecting => return Ok(()),
            Phase::Terminating => return Err(HrLinkError::SupervisorShutdown),
            Phase::Idle => {},
         }
         st.phase = Phase::Connecting;
         st.escalation = Escalation::None;
         st.last_escalation_at = None;
         st.last_attempt_start = Some(Instant::now());

         if self.inner.options.auto_reconnect {
            // spawn under the lock so the stored handle always belongs to
            // the attempt that owns this phase transition
            st.attempt_task = Some(tokio::spawn(Self::run_attempt(self.inner.clone())));
            return Ok(());
         }
      }

      Self::run_attempt(self.inner.clone()).await;
      Ok(())
   }

   /// Reports whether a live session is established.
   ///
   /// Not a pure getter: this runs the stuck-attempt watchdog and, with
   /// auto-reconnect, starts a new attempt once the backoff has elapsed.
   pub async fn is_connected(&self) -> bool {
      let (connected, start_attempt) = {
         let mut st = self.inner.state.lock();
         let now = Instant::now();
         self.check_watchdog(&mut st, now);
         let start_attempt = self.inner.options.auto_reconnect
            && st.phase == Phase::Idle
            && st.last_attempt_end.is_none_or(|t| {
               now.saturating_duration_since(t) >= self.inner.options.reconnect_backoff
            });
         (st.phase == Phase::Connected, start_attempt)
      };

      if start_attempt {
         let _ = self.connect().await;
      }
      connected
   }

   /// Waits up to `timeout` for one notification; zero waits indefinitely.
   ///
   /// Returns true iff the notification handler ran during the wait. When
   /// not connected this sleeps out the timeout instead. A transport error
   /// during the wait tears the session down.
   pub async fn process(&self, timeout: Duration) -> bool {
      if !self.is_connected().await {
         if !timeout.is_zero() {
            time::sleep(timeout).await;
         }
         return false;
      }

      let Some(session) = self.inner.state.lock().session.clone() else {
         return false;
      };

      let wait = (!timeout.is_zero()).then_some(timeout);
      match session.wait_for_notification(wait).await {
         Ok(fresh) => fresh,
         Err(e) => {
            warn!("lost connection to {}: {e}", self.inner.target.address());
            {
               let mut st = self.inner.state.lock();
               if st.session.as_ref().is_some_and(|s| Arc::ptr_eq(s, &session)) {
                  st.session = None;
                  if st.phase == Phase::Connected {
                     st.phase = Phase::Idle;
                  }
               }
            }
            session.disconnect().await;
            false
         },
      }
   }

   /// Tears down the session and any in-flight attempt. Idempotent.
   pub async fn disconnect(&self) {
      self.teardown(false).await;
   }

   /// Terminal teardown: like [`Self::disconnect`], but further connect
   /// calls fail with [`HrLinkError::SupervisorShutdown`].
   pub async fn shutdown(&self) {
      self.teardown(true).await;
   }

   pub fn phase(&self) -> Phase {
      self.inner.state.lock().phase
   }

   /// Number of wedged transport workers the watchdog abandoned instead of
   /// blocking on. Each one may have leaked a worker.
   pub fn abandoned_workers(&self) -> u64 {
      self.inner.abandoned_workers.load(Ordering::Relaxed)
   }

   /// Escalation ladder for attempts that neither succeed nor fail.
   ///
   /// Must stay non-blocking: signals are issued here, the waiting happens
   /// in the attempt's own task.
   fn check_watchdog(&self, st: &mut ConnState<T>, now: Instant) {
      if st.phase != Phase::Connecting {
         return;
      }
      let Some(started) = st.last_attempt_start else {
         return;
      };
      let elapsed = now.saturating_duration_since(started);
      if elapsed < self.inner.options.attempt_timeout {
         return;
      }
      let due = st
         .last_escalation_at
         .is_none_or(|t| now.saturating_duration_since(t) >= self.inner.options.escalation_interval);
      let address = self.inner.target.address();

      match st.escalation {
         Escalation::None => {
            warn!("attempt to {address} stuck for {elapsed:?}, requesting worker stop");
            if let Some(attempt) = &st.attempt {
               attempt.request_stop();
            }
            st.escalation = Escalation::GracefulRequested;
            st.last_escalation_at = Some(now);
         },
         Escalation::GracefulRequested if due => {
            warn!("transport worker for {address} ignored stop request, killing it");
            if let Some(attempt) = &st.attempt {
               attempt.force_kill();
            } else if let Some(task) = &st.attempt_task {
               task.abort();
            }
            st.escalation = Escalation::ForceRequested;
            st.last_escalation_at = Some(now);
         },
         Escalation::ForceRequested if due => {
            match st.attempt.as_ref() {
               Some(attempt) if attempt.is_alive() => {
                  // kill again in case the first one stalled
                  attempt.force_kill();
                  st.last_escalation_at = Some(now);
               },
               _ => {
                  // The worker handle is gone and the attempt never reported
                  // back: stop tracking it so a fresh attempt can start. The
                  // old worker may leak; liveness wins over accounting here.
                  self.inner.abandoned_workers.fetch_add(1, Ordering::Relaxed);
                  if let Some(task) = st.attempt_task.take() {
                     task.abort();
                  }
                  st.attempt = None;
                  st.phase = Phase::Idle;
                  st.last_attempt_end = Some(now);
                  warn!(
                     "giving up on wedged attempt to {address}; a stale transport worker may linger"
                  );
               },
            }
         },
         _ => {},
      }
   }

   async fn teardown(&self, terminal: bool) {
      let (attempt, task, session) = {
         let mut st = self.inner.state.lock();
         if terminal {
            st.phase = Phase::Terminating;
         } else if st.phase != Phase::Terminating {
            st.phase = Phase::Idle;
         }
         st.escalation = Escalation::None;
         (st.attempt.take(), st.attempt_task.take(), st.session.take())
      };

      if let Some(mut task) = task
         && !task.is_finished()
      {
         if let Some(attempt) = &attempt {
            attempt.request_stop();
         }
         if time::timeout(self.inner.options.shutdown_grace, &mut task)
            .await
            .is_err()
         {
            warn!(
               "attempt to {} did not wind down within grace period, aborting it",
               self.inner.target.address()
            );
            if let Some(attempt) = &attempt {
               attempt.force_kill();
            }
            task.abort();
         }
      }

      if let Some(session) = session {
         session.disconnect().await;
      }
   }

   /// Drives one attempt to completion and publishes the outcome.
   async fn run_attempt(inner: Arc<Inner<T>>) {
      let address = inner.target.address();
      debug!("connecting to device {address}");

      let attempt = Arc::new(inner.transport.begin(&inner.target));
      {
         let mut st = inner.state.lock();
         if st.phase != Phase::Connecting {
            debug!("attempt to {address} cancelled before it started");
            return;
         }
         st.attempt = Some(attempt.clone());
      }

      let outcome = Self::drive(&inner, attempt.as_ref()).await;

      let leftover = {
         let mut st = inner.state.lock();
         st.attempt = None;
         st.last_attempt_end = Some(Instant::now());
         match outcome {
            Ok(session) => {
               if st.phase == Phase::Connecting {
                  st.session = Some(Arc::new(session));
                  st.phase = Phase::Connected;
                  info!("connected to {address}");
                  None
               } else {
                  // torn down or abandoned while the attempt was in flight;
                  // the session must not outlive the attempt that lost
                  // ownership of it
                  Some(session)
               }
            },
            Err(e) => {
               warn!("connection attempt to {address} failed: {e}");
               if st.phase == Phase::Connecting {
                  st.phase = Phase::Idle;
               }
               None
            },
         }
      };

      if let Some(session) = leftover {
         session.disconnect().await;
      }
   }

   /// Connect, discover, subscribe. Cleans up the partial session on any
   /// failure past the connect step.
   async fn drive(
      inner: &Inner<T>,
      attempt: &T::Attempt,
   ) -> std::result::Result<T::Session, TransportError> {
      let session = attempt.establish(inner.options.connect_timeout).await?;
      if let Err(e) = session.discover(inner.target.binding()).await {
         session.disconnect().await;
         return Err(e);
      }
      if let Err(e) = session.subscribe(inner.handler.clone()).await {
         session.disconnect().await;
         return Err(e);
      }
      Ok(session)
   }
}
