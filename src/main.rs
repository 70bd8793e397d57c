//! hrlink CLI.
//!
//! Connects to a BLE heart-rate wearable and streams heart-rate and
//! inter-beat-interval samples to LSL, reconnecting automatically when
//! asked to.

use std::{
   sync::Arc,
   time::{Duration, Instant},
};

use clap::{Parser, ValueEnum};
use log::{debug, error, info};
use tokio::signal;

use hrlink::{
   config::Config,
   error::Result,
   heart_rate::{self, NotificationRouter},
   sink::{LslSink, SampleSink, StreamKind, StreamSelection},
   supervisor::{DeviceSupervisor, SupervisorOptions},
   transport::{AddressType, DeviceTarget, ble::BluerTransport},
};

#[derive(ValueEnum, Debug, Clone, Copy)]
enum Streams {
   None,
   Hr,
   Ibi,
   Both,
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct CliArgs {
   /// MAC address of the device
   #[arg(short, long)]
   mac_address: String,

   /// Stream name announced on the LSL network
   #[arg(short, long, default_value = "hrlink")]
   name: String,

   /// Which sample streams to publish
   #[arg(short, long, value_enum, default_value_t = Streams::Both)]
   streams: Streams,

   /// BLE address type of the device: "random" or "public"
   #[arg(short, long, default_value = "random")]
   address_type: String,

   /// Print debug information, including effective sampling rates
   #[arg(short, long)]
   verbose: bool,

   /// Automatically reconnect upon start or when the link breaks,
   /// republishing last known values in the meantime
   #[arg(short, long)]
   reconnect: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
   let args = CliArgs::parse();

   env_logger::Builder::from_env(
      env_logger::Env::default().default_filter_or(if args.verbose { "debug" } else { "info" }),
   )
   .init();

   let config = Config::load()?;
   let address_type: AddressType = args.address_type.parse()?;
   let target = DeviceTarget::new(
      &args.mac_address,
      address_type,
      heart_rate::heart_rate_binding(),
   )?;

   let selection = StreamSelection {
      heart_rate: matches!(args.streams, Streams::Hr | Streams::Both),
      ibi: matches!(args.streams, Streams::Ibi | Streams::Both),
   };
   let sink = Arc::new(LslSink::new(
      &args.name,
      target.address(),
      selection,
      config.nominal_rate_hz,
   )?);
   let router = NotificationRouter::new(sink.clone());

   let transport = BluerTransport::new().await?;
   let options = SupervisorOptions::from_config(&config, args.reconnect);
   let supervisor = DeviceSupervisor::new(transport, target, options, router.handler());

   supervisor.connect().await?;
   if !args.reconnect && !supervisor.is_connected().await {
      error!("could not connect to {}", args.mac_address);
      std::process::exit(1);
   }

   let mut pump_task = tokio::spawn(pump(
      supervisor.clone(),
      router,
      sink,
      config.nominal_rate_hz,
      args.reconnect,
   ));

   tokio::select! {
      _ = signal::ctrl_c() => {
         info!("shutting down");
         pump_task.abort();
      }
      _ = &mut pump_task => {}
   }

   supervisor.shutdown().await;
   Ok(())
}

/// Polls the supervisor at the nominal rate, republishing last known values
/// while the link is down and reporting inbound rates when verbose.
async fn pump(
   supervisor: DeviceSupervisor<BluerTransport>,
   router: Arc<NotificationRouter>,
   sink: Arc<LslSink>,
   nominal_rate_hz: f64,
   reconnect: bool,
) {
   let poll_interval = Duration::from_secs_f64(1.0 / nominal_rate_hz);
   let mut last_report = Instant::now();
   let (mut hr_mark, mut ibi_mark) = router.samples_seen();

   loop {
      if !reconnect && !supervisor.is_connected().await {
         info!("device disconnected, stopping");
         break;
      }

      // fresh samples are published by the router as they decode
      supervisor.process(poll_interval).await;

      if !supervisor.is_connected().await {
         // keep the bus alive with the last known values while the link
         // is being re-established
         let current = router.current();
         if let Some(bpm) = current.heart_rate {
            sink.publish(StreamKind::HeartRate, f32::from(bpm));
         }
         if let Some(last) = current.intervals.last() {
            sink.publish(StreamKind::InterBeatInterval, *last);
         }
      }

      let elapsed = last_report.elapsed();
      if elapsed >= Duration::from_secs(1) {
         let (hr_seen, ibi_seen) = router.samples_seen();
         debug!(
            "incoming rates: {:.1} Hz heart rate, {:.1} Hz intervals",
            (hr_seen - hr_mark) as f64 / elapsed.as_secs_f64(),
            (ibi_seen - ibi_mark) as f64 / elapsed.as_secs_f64()
         );
         hr_mark = hr_seen;
         ibi_mark = ibi_seen;
         last_report = Instant::now();
      }
   }
}
