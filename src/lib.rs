//! hrlink — BLE heart-rate to Lab Streaming Layer bridge.
//!
//! Streams heart-rate and inter-beat-interval samples from a BLE wearable
//! to a local LSL bus, supervising the GATT notification session so that
//! link drops and wedged transport workers are recovered from instead of
//! wedging the pipeline.

pub mod config;
pub mod error;
pub mod heart_rate;
pub mod sink;
pub mod supervisor;
pub mod transport;
