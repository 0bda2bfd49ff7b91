//! Wi-Fi station link management and secured OTA updates for ESP32 nodes.
//!
//! [`network::Connection`] brings the station link up with a bounded
//! reconnect budget and keeps a supervisor thread watching it.
//! [`ota::update`] streams a firmware image over a secured session and
//! commits it. Both report lifecycle events on an [`bus::EventBus`].
//!
//! Platform bindings live behind the `esp-idf` feature; without it the crate
//! builds on a host with loopback doubles for the radio and the transport.

pub mod bus;
pub mod config;
pub mod error;
pub mod logging;
pub mod network;
pub mod ota;
pub mod version;

pub use error::{status, Error, Result};

#[cfg(test)]
mod tests;
