//! Heart-rate measurement decoding and routing.
//!
//! Decodes raw GATT heart-rate measurement payloads into heart-rate and
//! inter-beat-interval samples and fans fresh samples out to the sink. The
//! latest decoded values stay cached for the polling loop (and for stale
//! republishing while disconnected).

use std::sync::{
   Arc,
   atomic::{AtomicU64, Ordering},
};

use log::{debug, warn};
use parking_lot::Mutex;
use smallvec::SmallVec;
use uuid::{Uuid, uuid};

use crate::{
   sink::{SampleSink, StreamKind},
   transport::{CharacteristicBinding, NotifyHandler},
};

/// Standard GATT heart rate service.
pub const HEART_RATE_SERVICE: Uuid = uuid!("0000180d-0000-1000-8000-00805f9b34fb");
/// Standard GATT heart rate measurement characteristic.
pub const HEART_RATE_MEASUREMENT: Uuid = uuid!("00002a37-0000-1000-8000-00805f9b34fb");

/// Binding for the standard heart-rate measurement characteristic.
pub fn heart_rate_binding() -> CharacteristicBinding {
   CharacteristicBinding {
      service: HEART_RATE_SERVICE,
      characteristic: HEART_RATE_MEASUREMENT,
   }
}

/// One decoded measurement. Recreated on every notification; the router
/// keeps the latest one as "current".
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DecodedSample {
   /// Heart rate in beats per minute. None until the first measurement.
   pub heart_rate: Option<u8>,
   /// Inter-beat intervals in seconds; devices may batch several per
   /// notification, or none at all.
   pub intervals: SmallVec<[f32; 4]>,
   /// Whether this notification carried any intervals.
   pub fresh_ibi: bool,
}

/// Decodes a heart-rate measurement payload.
///
/// Byte 0 is the flags byte, ignored; interpretation is by length alone.
/// Byte 1 is the heart rate. Any bytes from offset 2 are little-endian u16
/// inter-beat intervals in units of 1/1024 s; a trailing odd byte is
/// tolerated and dropped. Payloads shorter than two bytes decode to `None`
/// (no update).
pub fn decode(data: &[u8]) -> Option<DecodedSample> {
   if data.len() < 2 {
      return None;
   }
   let heart_rate = data[1];
   let mut intervals = SmallVec::new();
   let fresh_ibi = data.len() >= 4;
   if fresh_ibi {
      for pair in data[2..].chunks_exact(2) {
         let raw = u16::from_le_bytes([pair[0], pair[1]]);
         intervals.push(f32::from(raw) / 1024.0);
      }
   }
   Some(DecodedSample {
      heart_rate: Some(heart_rate),
      intervals,
      fresh_ibi,
   })
}

/// Routes raw notification payloads to decoded samples and the sink.
pub struct NotificationRouter {
   current: Mutex<DecodedSample>,
   sink: Arc<dyn SampleSink>,
   hr_seen: AtomicU64,
   ibi_seen: AtomicU64,
}

impl NotificationRouter {
   pub fn new(sink: Arc<dyn SampleSink>) -> Arc<Self> {
      Arc::new(Self {
         current: Mutex::new(DecodedSample::default()),
         sink,
         hr_seen: AtomicU64::new(0),
         ibi_seen: AtomicU64::new(0),
      })
   }

   /// Builds the notification callback to hand to the transport.
   pub fn handler(self: &Arc<Self>) -> NotifyHandler {
      let router = self.clone();
      Arc::new(move |data: &[u8]| router.on_notification(data))
   }

   /// Latest decoded values; persists across notifications until overwritten.
   pub fn current(&self) -> DecodedSample {
      self.current.lock().clone()
   }

   /// Total fresh heart-rate and interval samples seen so far.
   pub fn samples_seen(&self) -> (u64, u64) {
      (
         self.hr_seen.load(Ordering::Relaxed),
         self.ibi_seen.load(Ordering::Relaxed),
      )
   }

   fn on_notification(&self, data: &[u8]) {
      let Some(sample) = decode(data) else {
         warn!("ignoring malformed notification: {}", hex::encode(data));
         return;
      };
      debug!(
         "notification: bpm={:?} intervals={:?} ({})",
         sample.heart_rate,
         sample.intervals,
         hex::encode(data)
      );

      if let Some(bpm) = sample.heart_rate {
         self.hr_seen.fetch_add(1, Ordering::Relaxed);
         self.sink.publish(StreamKind::HeartRate, f32::from(bpm));
      }
      if sample.fresh_ibi {
         self.ibi_seen.fetch_add(sample.intervals.len() as u64, Ordering::Relaxed);
         for ibi in &sample.intervals {
            self.sink.publish(StreamKind::InterBeatInterval, *ibi);
         }
      }

      *self.current.lock() = sample;
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use parking_lot::Mutex as PlMutex;

   #[derive(Default)]
   struct RecordingSink {
      published: PlMutex<Vec<(StreamKind, f32)>>,
   }

   impl SampleSink for RecordingSink {
      fn publish(&self, stream: StreamKind, value: f32) {
         self.published.lock().push((stream, value));
      }
   }

   #[test]
   fn decode_heart_rate_only() {
      let sample = decode(&[0x00, 0x3C]).unwrap();
      assert_eq!(sample.heart_rate, Some(60));
      assert!(sample.intervals.is_empty());
      assert!(!sample.fresh_ibi);
   }

   #[test]
   fn decode_single_interval() {
      let sample = decode(&[0x10, 0x3C, 0x00, 0x04]).unwrap();
      assert_eq!(sample.heart_rate, Some(60));
      assert_eq!(sample.intervals.as_slice(), &[4.0 / 1024.0]);
      assert!(sample.fresh_ibi);
   }

   #[test]
   fn decode_batched_intervals() {
      let sample = decode(&[0x10, 0x3C, 0x00, 0x04, 0x00, 0x08]).unwrap();
      assert_eq!(sample.intervals.as_slice(), &[4.0 / 1024.0, 8.0 / 1024.0]);
      assert!(sample.fresh_ibi);
   }

   #[test]
   fn decode_drops_trailing_odd_byte() {
      let sample = decode(&[0x10, 0x3C, 0x00, 0x04, 0xFF]).unwrap();
      assert_eq!(sample.intervals.as_slice(), &[4.0 / 1024.0]);
   }

   #[test]
   fn decode_rejects_short_payloads() {
      assert!(decode(&[]).is_none());
      assert!(decode(&[0x00]).is_none());
   }

   #[test]
   fn decode_flags_byte_is_ignored() {
      // identical payloads apart from the flags byte decode identically
      let a = decode(&[0x00, 0x50, 0x00, 0x04]).unwrap();
      let b = decode(&[0x16, 0x50, 0x00, 0x04]).unwrap();
      assert_eq!(a, b);
   }

   #[test]
   fn router_caches_latest_and_publishes_fresh() {
      let sink = Arc::new(RecordingSink::default());
      let router = NotificationRouter::new(sink.clone());
      let handler = router.handler();

      handler(&[0x10, 0x3C, 0x00, 0x04]);
      handler(&[0x00, 0x3D]);

      let current = router.current();
      assert_eq!(current.heart_rate, Some(61));
      assert!(!current.fresh_ibi);

      let published = sink.published.lock();
      assert_eq!(
         published.as_slice(),
         &[
            (StreamKind::HeartRate, 60.0),
            (StreamKind::InterBeatInterval, 4.0 / 1024.0),
            (StreamKind::HeartRate, 61.0),
         ]
      );
      assert_eq!(router.samples_seen(), (2, 1));
   }

   #[test]
   fn router_keeps_current_on_malformed_payload() {
      let router = NotificationRouter::new(Arc::new(RecordingSink::default()));
      let handler = router.handler();

      handler(&[0x00, 0x48]);
      handler(&[0x00]);

      assert_eq!(router.current().heart_rate, Some(72));
   }
}
