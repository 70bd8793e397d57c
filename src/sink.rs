//! Sample publishing to the local LSL bus.
//!
//! The supervisor and router only ever see the [`SampleSink`] trait; the LSL
//! outlet handling lives behind it. Sink failures are logged and swallowed,
//! they never feed back into connection handling.

use log::{info, warn};
use lsl::{ChannelFormat, Pushable, StreamInfo, StreamOutlet};

use crate::error::{HrLinkError, Result};

/// Logical output streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
   HeartRate,
   InterBeatInterval,
}

impl StreamKind {
   /// LSL content type tag.
   pub fn content_type(self) -> &'static str {
      match self {
         Self::HeartRate => "heart_rate",
         Self::InterBeatInterval => "heart_ibi",
      }
   }
}

/// Receives decoded samples, one call per sample.
pub trait SampleSink: Send + Sync + 'static {
   fn publish(&self, stream: StreamKind, value: f32);
}

/// Which logical streams to actually publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSelection {
   pub heart_rate: bool,
   pub ibi: bool,
}

/// Publishes samples to LSL, one single-channel float32 outlet per enabled
/// stream.
pub struct LslSink {
   heart_rate: Option<StreamOutlet>,
   ibi: Option<StreamOutlet>,
}

// liblsl outlets are thread-safe; the binding does not carry the markers.
unsafe impl Send for LslSink {}
unsafe impl Sync for LslSink {}

impl LslSink {
   /// Creates outlets for the selected streams.
   ///
   /// The source id is derived from the stream name, content type and device
   /// address so that consumers can resume across restarts.
   pub fn new(
      name: &str,
      device_address: &str,
      selection: StreamSelection,
      nominal_rate_hz: f64,
   ) -> Result<Self> {
      let make = |kind: StreamKind| -> Result<StreamOutlet> {
         let content_type = kind.content_type();
         let source_id = format!("{name}_{content_type}_{device_address}");
         let stream_info =
            StreamInfo::new(name, content_type, 1, nominal_rate_hz, ChannelFormat::Float32, &source_id)
               .map_err(|e| HrLinkError::Lsl(format!("{e:?}")))?;
         let outlet = StreamOutlet::new(&stream_info, 0, 360)
            .map_err(|e| HrLinkError::Lsl(format!("{e:?}")))?;
         info!("streaming {content_type} as {source_id}");
         Ok(outlet)
      };

      Ok(Self {
         heart_rate: selection.heart_rate.then(|| make(StreamKind::HeartRate)).transpose()?,
         ibi: selection.ibi.then(|| make(StreamKind::InterBeatInterval)).transpose()?,
      })
   }
}

impl SampleSink for LslSink {
   fn publish(&self, stream: StreamKind, value: f32) {
      let outlet = match stream {
         StreamKind::HeartRate => self.heart_rate.as_ref(),
         StreamKind::InterBeatInterval => self.ibi.as_ref(),
      };
      if let Some(outlet) = outlet
         && let Err(e) = outlet.push_sample(&vec![value])
      {
         warn!("failed to push {} sample: {e:?}", stream.content_type());
      }
   }
}
