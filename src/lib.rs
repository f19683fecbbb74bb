#![cfg_attr(docsrs, feature(doc_cfg))]
//! # btbattery_lib
//!
//! Telemetry for JBD and JK smart BMS over Bluetooth LE.
//!
//! Each pack gets its own connection loop ([`link::spawn_link`]) that
//! reassembles notification fragments into frames, decodes them with the
//! vendor protocol and keeps the latest [`snapshot::BatterySnapshot`]. Two to
//! four packs can be combined into one [`aggregate::VirtualBattery`].
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`.
//! - `btleplug`: Enables [`btleplug_transport`], the BLE transport on top of the `btleplug` crate.
//! - `bin-dependencies`: Enables everything the `btbattery` binary needs, `btleplug` included.

mod error;

pub mod aggregate;
pub mod battery;
pub mod config;
pub mod link;
/// Frame assembly and decoding for the supported BMS vendors.
pub mod protocol;
pub mod snapshot;
pub mod transport;
pub mod watchdog;

/// BLE transport backed by `btleplug`.
#[cfg_attr(docsrs, doc(cfg(feature = "btleplug")))]
#[cfg(feature = "btleplug")]
pub mod btleplug_transport;

pub use error::{Error, Result, TransportError};
