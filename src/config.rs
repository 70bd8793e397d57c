//! Configuration management for hrlink.
//!
//! This module handles loading and saving the timing configuration from disk:
//! connection timeouts, watchdog thresholds, and reconnection backoff.

use std::{env, fs, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{HrLinkError, Result};

/// Main configuration structure for hrlink.
///
/// All fields have defaults, so a partial (or absent) config file is fine.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
   /// Timeout handed to the transport for a single connect call.
   #[serde(default = "default_connect_timeout")]
   pub connect_timeout_sec: u64,

   /// How long an attempt may sit in the connecting phase before the
   /// watchdog starts escalating against the transport worker.
   #[serde(default = "default_attempt_timeout")]
   pub attempt_timeout_sec: u64,

   /// Spacing between watchdog escalation steps.
   #[serde(default = "default_escalation_interval")]
   pub escalation_interval_sec: u64,

   /// Fixed delay between the end of one connection attempt and the start
   /// of the next when auto-reconnect is enabled.
   #[serde(default = "default_reconnect_backoff")]
   pub reconnect_backoff_sec: u64,

   /// How long disconnect/shutdown waits for an in-flight attempt to wind
   /// down before force-terminating it.
   #[serde(default = "default_shutdown_grace")]
   pub shutdown_grace_sec: u64,

   /// Nominal rate advertised on the LSL outlets, and the polling cadence
   /// of the pump loop (Hz).
   #[serde(default = "default_nominal_rate")]
   pub nominal_rate_hz: f64,
}

const fn default_connect_timeout() -> u64 {
   20
}

const fn default_attempt_timeout() -> u64 {
   30
}

const fn default_escalation_interval() -> u64 {
   2
}

const fn default_reconnect_backoff() -> u64 {
   2
}

const fn default_shutdown_grace() -> u64 {
   3
}

const fn default_nominal_rate() -> f64 {
   1.0
}

impl Default for Config {
   fn default() -> Self {
      Self {
         connect_timeout_sec: default_connect_timeout(),
         attempt_timeout_sec: default_attempt_timeout(),
         escalation_interval_sec: default_escalation_interval(),
         reconnect_backoff_sec: default_reconnect_backoff(),
         shutdown_grace_sec: default_shutdown_grace(),
         nominal_rate_hz: default_nominal_rate(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates a default one if not present.
   pub fn load() -> Result<Self> {
      let config_path = Self::config_path()?;

      if config_path.exists() {
         let contents = fs::read_to_string(&config_path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save()?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      let config_path = Self::config_path()?;

      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(&config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      if let Ok(path) = env::var("HRLINK_CONFIG") {
         return Ok(PathBuf::from(path));
      }
      let config_dir = dirs::config_dir().ok_or(HrLinkError::ConfigDirNotFound)?;
      Ok(config_dir.join("hrlink").join("config.toml"))
   }

   pub fn connect_timeout(&self) -> Duration {
      Duration::from_secs(self.connect_timeout_sec)
   }

   pub fn attempt_timeout(&self) -> Duration {
      Duration::from_secs(self.attempt_timeout_sec)
   }

   pub fn escalation_interval(&self) -> Duration {
      Duration::from_secs(self.escalation_interval_sec)
   }

   pub fn reconnect_backoff(&self) -> Duration {
      Duration::from_secs(self.reconnect_backoff_sec)
   }

   pub fn shutdown_grace(&self) -> Duration {
      Duration::from_secs(self.shutdown_grace_sec)
   }
}
