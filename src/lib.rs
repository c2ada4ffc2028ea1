#![cfg_attr(docsrs, feature(doc_cfg))]
//! # bmsbridge_lib
//!
//! This crate bridges a JK BMS (Battery Management System) battery pack to a
//! solar inverter. One serial bus polls the battery on its vendor protocol
//! and decodes the status telemetry; a second serial bus emulates the
//! register-addressed slave the inverter expects and answers its reads from
//! the latest decoded snapshot.
//!
//! ## Features
//!
//! This crate uses a feature-based system to keep dependencies minimal.
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `bmsbridge` command-line tool and pulls in `serialport` and `serde`.
//!
//! ### Client Features
//! - `serialport`: Enables the serial clients for both buses using the `serialport` crate.
//!
//! ### Utility Features
//! - `protocol_serde`: Enables `serde` support for serializing decoded snapshots.
//! - `bin-dependencies`: Enables all features required by the `bmsbridge` binary executable.

/// Contains error types for the library.
mod error;
/// Register payload sources feeding the inverter-facing dispatcher.
pub mod adapter;
/// CRC-16/MODBUS.
pub mod crc;
/// Inverter-facing slave protocol: frame sync, register map, replies.
pub mod inverter;
/// Battery vendor protocol: status framing and telemetry decoding.
pub mod jk;
/// Decoded battery state shared between the two buses.
pub mod snapshot;

pub use error::Error;

/// Serial clients for the battery and inverter buses.
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
#[cfg(feature = "serialport")]
pub mod serialport;
