//! End-to-end supervisor tests against the scripted mock transport.

use std::{
   sync::Arc,
   time::{Duration, Instant},
};

use parking_lot::Mutex;

use hrlink::{
   error::HrLinkError,
   heart_rate::{NotificationRouter, heart_rate_binding},
   sink::{SampleSink, StreamKind},
   supervisor::{DeviceSupervisor, Phase, SupervisorOptions},
   transport::{
      AddressType, DeviceTarget, NotifyHandler, TransportError,
      mock::{AttemptPlan, MockTransport},
   },
};

fn target() -> DeviceTarget {
   DeviceTarget::new("F6:4A:06:35:E9:BA", AddressType::Random, heart_rate_binding()).unwrap()
}

fn options(auto_reconnect: bool) -> SupervisorOptions {
   SupervisorOptions {
      connect_timeout: Duration::from_millis(500),
      attempt_timeout: Duration::from_millis(100),
      escalation_interval: Duration::from_millis(50),
      reconnect_backoff: Duration::from_millis(50),
      shutdown_grace: Duration::from_millis(100),
      auto_reconnect,
   }
}

fn noop_handler() -> NotifyHandler {
   Arc::new(|_: &[u8]| {})
}

/// Polls `is_connected` (which drives the watchdog and reconnect policy)
/// until it reports true or the deadline passes.
async fn eventually_connected(
   supervisor: &DeviceSupervisor<MockTransport>,
   within: Duration,
) -> bool {
   let deadline = Instant::now() + within;
   while Instant::now() < deadline {
      if supervisor.is_connected().await {
         return true;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
   }
   false
}

#[derive(Default)]
struct RecordingSink {
   published: Mutex<Vec<(StreamKind, f32)>>,
}

impl SampleSink for RecordingSink {
   fn publish(&self, stream: StreamKind, value: f32) {
      self.published.lock().push((stream, value));
   }
}

#[test]
fn malformed_address_is_fatal_before_any_transport_attempt() {
   let err =
      DeviceTarget::new("12:34:56", AddressType::Random, heart_rate_binding()).unwrap_err();
   assert!(matches!(err, HrLinkError::AddressFormat(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn synchronous_connect_establishes_session() {
   let transport = MockTransport::new();
   let supervisor =
      DeviceSupervisor::new(transport.clone(), target(), options(false), noop_handler());

   supervisor.connect().await.unwrap();

   assert!(supervisor.is_connected().await);
   assert_eq!(supervisor.phase(), Phase::Connected);
   assert_eq!(transport.connects_started(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_connect_calls_share_one_attempt() {
   let transport = MockTransport::new();
   let supervisor =
      DeviceSupervisor::new(transport.clone(), target(), options(true), noop_handler());

   let mut callers = Vec::new();
   for _ in 0..16 {
      let supervisor = supervisor.clone();
      callers.push(tokio::spawn(async move {
         supervisor.connect().await.unwrap();
      }));
   }
   for caller in callers {
      caller.await.unwrap();
   }

   assert!(eventually_connected(&supervisor, Duration::from_secs(1)).await);
   assert_eq!(transport.max_in_flight(), 1);
   assert_eq!(transport.connects_started(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_attempt_is_retried_after_backoff() {
   let transport = MockTransport::new();
   transport.plan(AttemptPlan::Fail(TransportError::ConnectTimeout));
   let supervisor =
      DeviceSupervisor::new(transport.clone(), target(), options(true), noop_handler());

   supervisor.connect().await.unwrap();

   assert!(eventually_connected(&supervisor, Duration::from_secs(2)).await);
   assert!(transport.connects_started() >= 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn watchdog_escalates_against_hung_attempt() {
   let transport = MockTransport::new();
   transport.plan(AttemptPlan::Hang);
   let supervisor =
      DeviceSupervisor::new(transport.clone(), target(), options(true), noop_handler());

   supervisor.connect().await.unwrap();

   // the hung attempt must be stopped, killed, and replaced by a working one
   assert!(eventually_connected(&supervisor, Duration::from_secs(3)).await);
   assert!(transport.stops_requested() >= 1);
   assert!(transport.force_kills() >= 1);
   assert_eq!(supervisor.abandoned_workers(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn wedged_worker_is_abandoned_and_counted() {
   let transport = MockTransport::new();
   transport.plan(AttemptPlan::Wedge);
   let supervisor =
      DeviceSupervisor::new(transport.clone(), target(), options(true), noop_handler());

   supervisor.connect().await.unwrap();

   assert!(eventually_connected(&supervisor, Duration::from_secs(3)).await);
   assert_eq!(supervisor.abandoned_workers(), 1);
   assert!(transport.force_kills() >= 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn link_drop_during_process_tears_down_and_reconnects() {
   let transport = MockTransport::new();
   let supervisor =
      DeviceSupervisor::new(transport.clone(), target(), options(true), noop_handler());

   supervisor.connect().await.unwrap();
   assert!(eventually_connected(&supervisor, Duration::from_secs(1)).await);

   transport.fail_next_wait();
   let fresh = supervisor.process(Duration::from_millis(50)).await;
   assert!(!fresh);
   assert_eq!(supervisor.phase(), Phase::Idle);
   assert!(transport.disconnects() >= 1);

   // the next polls re-establish the session within backoff + attempt time
   assert!(eventually_connected(&supervisor, Duration::from_secs(2)).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn process_returns_false_on_timeout_without_data() {
   let transport = MockTransport::new();
   let supervisor =
      DeviceSupervisor::new(transport.clone(), target(), options(false), noop_handler());

   supervisor.connect().await.unwrap();
   let fresh = supervisor.process(Duration::from_millis(50)).await;
   assert!(!fresh);
   assert!(supervisor.is_connected().await);
}

#[tokio::test(flavor = "multi_thread")]
async fn process_sleeps_out_timeout_when_disconnected() {
   let transport = MockTransport::new();
   let supervisor = DeviceSupervisor::new(transport, target(), options(false), noop_handler());

   let start = Instant::now();
   let fresh = supervisor.process(Duration::from_millis(50)).await;
   assert!(!fresh);
   assert!(start.elapsed() >= Duration::from_millis(45));
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnect_is_idempotent() {
   let transport = MockTransport::new();
   let supervisor =
      DeviceSupervisor::new(transport.clone(), target(), options(false), noop_handler());

   supervisor.connect().await.unwrap();
   assert!(supervisor.is_connected().await);

   supervisor.disconnect().await;
   assert_eq!(supervisor.phase(), Phase::Idle);
   supervisor.disconnect().await;
   assert_eq!(supervisor.phase(), Phase::Idle);
   assert_eq!(transport.disconnects(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnect_cancels_in_flight_attempt() {
   let transport = MockTransport::new();
   transport.plan(AttemptPlan::Hang);
   let supervisor =
      DeviceSupervisor::new(transport.clone(), target(), options(true), noop_handler());

   supervisor.connect().await.unwrap();
   tokio::time::sleep(Duration::from_millis(20)).await;

   supervisor.disconnect().await;
   assert_eq!(supervisor.phase(), Phase::Idle);
   assert!(transport.stops_requested() >= 1);
   assert!(transport.force_kills() >= 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_is_terminal() {
   let transport = MockTransport::new();
   let supervisor =
      DeviceSupervisor::new(transport.clone(), target(), options(false), noop_handler());

   supervisor.connect().await.unwrap();
   supervisor.shutdown().await;

   assert_eq!(supervisor.phase(), Phase::Terminating);
   assert!(matches!(
      supervisor.connect().await.unwrap_err(),
      HrLinkError::SupervisorShutdown
   ));
   assert!(!supervisor.is_connected().await);
}

#[tokio::test(flavor = "multi_thread")]
async fn notifications_flow_through_router_to_sink() {
   let sink = Arc::new(RecordingSink::default());
   let router = NotificationRouter::new(sink.clone());
   let transport = MockTransport::new();
   let supervisor =
      DeviceSupervisor::new(transport.clone(), target(), options(false), router.handler());

   supervisor.connect().await.unwrap();
   assert!(supervisor.is_connected().await);

   transport.inject_notification(&[0x10, 0x3C, 0x00, 0x04]);
   let fresh = supervisor.process(Duration::from_millis(500)).await;
   assert!(fresh);

   let current = router.current();
   assert_eq!(current.heart_rate, Some(60));
   assert_eq!(current.intervals.as_slice(), &[4.0 / 1024.0]);

   let published = sink.published.lock().clone();
   assert_eq!(
      published.as_slice(),
      &[
         (StreamKind::HeartRate, 60.0),
         (StreamKind::InterBeatInterval, 4.0 / 1024.0),
      ]
   );
}
