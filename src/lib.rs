//! SMA photovoltaic inverter polling over Bluetooth and Speedwire.
//!
//! The crate implements the SMAdata2 application protocol against both of
//! SMA's transports, discovers the plant, retrieves live telemetry and
//! historical archives, and hands decoded snapshots to exporter sinks.

pub mod archive;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod export;
pub mod poller;
pub mod protocol;
pub mod records;
pub mod session;
pub mod tags;
pub mod telemetry;
pub mod transport;

pub use error::{Result, SmaError};
