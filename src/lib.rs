#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # bleterm
//!
//! A Rust library for talking to BLE "terminal" peripherals and for decoding
//! the sensor beacons that the same firmware family broadcasts.
//!
//! The library covers three jobs:
//!
//! - **Advertisement classification**: raw advertisement payloads are sorted into
//!   plain connectable devices, legacy sensor beacons (24 bytes of manufacturer data)
//!   and proximity beacons (iBeacon-style layout with any vendor identifier).
//! - **Session setup**: a confirmation-gated state machine discovers the terminal
//!   service and enables notify, indicate and battery subscriptions one descriptor
//!   write at a time.
//! - **Message transport**: outbound text is encoded (Ascii or Hex, with a selectable
//!   line ending), split into 20-byte packets and written with 10 ms pacing; inbound
//!   notifications are decoded into a bounded, turn-based message log.
//!
//! The pure pieces ([`advertisement`], [`beacon`], [`registry`], [`session`],
//! [`protocol`], [`log`]) never touch the radio. [`ble`] and [`device`] bind them to
//! `btleplug`.
//!
//! ## Quick Start
//!
//! ```no_run
//! use bleterm::{ConnectionParams, TerminalDevice};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let terminal = TerminalDevice::connect_first(ConnectionParams::default()).await?;
//!
//!     let mut events = terminal.subscribe();
//!     terminal.send("hello").await?;
//!
//!     while let Ok(event) = events.recv().await {
//!         println!("{event:?}");
//!     }
//!     Ok(())
//! }
//! ```

/// Advertisement classification
pub mod advertisement;
/// Beacon payload decoding
pub mod beacon;
/// btleplug adapter: scanning and session driving
pub mod ble;
/// High-level terminal client
pub mod device;
/// Error types and handling
pub mod error;
/// Typed event bus
pub mod events;
/// Bounded message log
pub mod log;
/// Outbound/inbound message codec
pub mod protocol;
/// Discovered device and beacon bookkeeping
pub mod registry;
/// GATT session state machine
pub mod session;
/// Paced packet delivery over a GATT link
pub mod transport;
/// Type definitions and data structures
pub mod types;

pub use advertisement::{AdvertisementClassifier, Classification};
pub use beacon::{BeaconData, ProximityBeacon, SensorBeacon};
pub use ble::{BleManager, PeripheralLink};
pub use device::TerminalDevice;
pub use error::{Result, TerminalError};
pub use events::{EventBus, EventKind, TerminalEvent};
pub use log::{MessageLog, MessageLogEntry};
pub use registry::{DeviceRegistry, ScanReport};
pub use session::{GattEvent, GattSession, SessionAction, SessionFailure, SessionState};
pub use transport::{GattLink, MessageTransport};
pub use types::{
    BeaconRecord, ConnectionParams, DeviceClass, DeviceIdentity, DiscoveredDevice, Direction,
    Encoding, GattProfile, LineEnding, OutboundMessage, TerminalConfig,
};

use uuid::Uuid;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Placeholder terminal service UUID
///
/// The terminal UUIDs below are defaults for [`GattProfile::default`]. Override them
/// through [`GattProfile`] with the UUID set of the actual firmware.
pub const TERMINAL_SERVICE_UUID: Uuid = Uuid::from_u128(0x569a_1101_b87f_490c_92cb_11ba_5ea5_167c);

/// Placeholder notify characteristic UUID
pub const NOTIFY_CHAR_UUID: Uuid = Uuid::from_u128(0x569a_2001_b87f_490c_92cb_11ba_5ea5_167c);

/// Placeholder indicate characteristic UUID
///
/// Older firmware does not expose it.
pub const INDICATE_CHAR_UUID: Uuid = Uuid::from_u128(0x569a_2002_b87f_490c_92cb_11ba_5ea5_167c);

/// Placeholder write-without-response characteristic UUID
pub const WRITE_CHAR_UUID: Uuid = Uuid::from_u128(0x569a_2000_b87f_490c_92cb_11ba_5ea5_167c);

/// Standard Battery Service
pub const BATTERY_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_180f_0000_1000_8000_0080_5f9b_34fb);

/// Standard Battery Level characteristic
pub const BATTERY_LEVEL_CHAR_UUID: Uuid =
    Uuid::from_u128(0x0000_2a19_0000_1000_8000_0080_5f9b_34fb);

/// Client Characteristic Configuration Descriptor
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x0000_2902_0000_1000_8000_0080_5f9b_34fb);
