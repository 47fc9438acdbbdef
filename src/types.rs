use serde::{Deserialize, Serialize};
use std::{fmt, time::SystemTime};
use uuid::Uuid;

use crate::{
    BATTERY_LEVEL_CHAR_UUID, BATTERY_SERVICE_UUID, INDICATE_CHAR_UUID, NOTIFY_CHAR_UUID,
    TERMINAL_SERVICE_UUID, WRITE_CHAR_UUID,
};

/// Identity of an advertising peripheral: advertised name plus address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Advertised local name
    pub name: String,
    /// Platform address (MAC on Linux/Windows, CoreBluetooth UUID on macOS)
    pub address: String,
}

impl DeviceIdentity {
    /// Create a new identity
    #[must_use]
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

/// Device class assigned by the advertisement classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceClass {
    /// Connectable device without a recognised beacon payload
    Plain,
    /// Sensor beacon carrying 24 bytes of manufacturer data
    LegacyBeacon,
    /// iBeacon-style proximity beacon
    ProximityBeacon,
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain => write!(f, "Plain"),
            Self::LegacyBeacon => write!(f, "Legacy Beacon"),
            Self::ProximityBeacon => write!(f, "Proximity Beacon"),
        }
    }
}

/// A connectable peripheral seen during the current scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Name and address
    pub identity: DeviceIdentity,
    /// Last-seen signal strength in dBm
    pub rssi: i16,
    /// Always [`DeviceClass::Plain`] for connectable devices
    pub class: DeviceClass,
}

impl DiscoveredDevice {
    /// Create a new connectable device record
    #[must_use]
    pub const fn new(identity: DeviceIdentity, rssi: i16) -> Self {
        Self {
            identity,
            rssi,
            class: DeviceClass::Plain,
        }
    }
}

/// A beacon seen at least once
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconRecord {
    /// Name and address
    pub identity: DeviceIdentity,
    /// Beacon class
    pub class: DeviceClass,
    /// Raw sub-payload as extracted by the classifier
    pub payload: Vec<u8>,
    /// Last-seen signal strength in dBm
    pub rssi: i16,
    /// Wall-clock time of the last sighting
    pub last_seen: SystemTime,
}

/// Outbound text format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encoding {
    /// Text is sent as its UTF-8 bytes
    #[default]
    Ascii,
    /// Text is a string of hex digit pairs packed into bytes
    Hex,
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ascii => write!(f, "Ascii"),
            Self::Hex => write!(f, "Hex"),
        }
    }
}

/// Line terminator appended to outbound text
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LineEnding {
    /// Nothing appended
    #[default]
    None,
    /// Carriage return
    Cr,
    /// Line feed
    Lf,
    /// Carriage return + line feed
    CrLf,
}

impl LineEnding {
    /// Suffix appended to the text
    #[must_use]
    pub const fn suffix(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Cr => "\r",
            Self::Lf => "\n",
            Self::CrLf => "\r\n",
        }
    }
}

impl fmt::Display for LineEnding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Cr => write!(f, "CR"),
            Self::Lf => write!(f, "LF"),
            Self::CrLf => write!(f, "CRLF"),
        }
    }
}

/// Direction tag of a message log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Data from the peripheral
    Received,
    /// Data sent to the peripheral
    Transmitted,
    /// Battery level report
    BatteryNotice,
}

/// A single send request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Text as entered by the user
    pub text: String,
    /// Output encoding
    pub encoding: Encoding,
    /// Line ending to append
    pub line_ending: LineEnding,
}

/// Session-scoped encoding and line-ending selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalConfig {
    /// Encoding for outbound text and inbound display
    pub encoding: Encoding,
    /// Line ending appended to outbound text
    pub line_ending: LineEnding,
}

impl TerminalConfig {
    /// Build an outbound message using this configuration
    #[must_use]
    pub fn outbound(&self, text: impl Into<String>) -> OutboundMessage {
        OutboundMessage {
            text: text.into(),
            encoding: self.encoding,
            line_ending: self.line_ending,
        }
    }
}

/// Connection parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// Scan duration in milliseconds
    pub scan_timeout_ms: u64,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Company identifier that tags legacy sensor beacon manufacturer data
    pub company_id: u16,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            scan_timeout_ms: 10_000,
            connect_timeout_ms: 30_000,
            company_id: 0x0000,
        }
    }
}

/// UUID set describing the terminal firmware's GATT layout
///
/// The default terminal UUIDs are placeholders; the battery UUIDs are the standard
/// Battery Service ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattProfile {
    /// Terminal service
    pub service: Uuid,
    /// Notify characteristic under the terminal service
    pub notify: Uuid,
    /// Indicate characteristic under the terminal service
    pub indicate: Uuid,
    /// Write characteristic under the terminal service
    pub write: Uuid,
    /// Battery service
    pub battery_service: Uuid,
    /// Battery level characteristic
    pub battery_level: Uuid,
}

impl Default for GattProfile {
    fn default() -> Self {
        Self {
            service: TERMINAL_SERVICE_UUID,
            notify: NOTIFY_CHAR_UUID,
            indicate: INDICATE_CHAR_UUID,
            write: WRITE_CHAR_UUID,
            battery_service: BATTERY_SERVICE_UUID,
            battery_level: BATTERY_LEVEL_CHAR_UUID,
        }
    }
}
