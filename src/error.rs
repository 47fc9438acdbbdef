use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur when talking to terminal peripherals and beacons
#[derive(Error, Debug)]
pub enum TerminalError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// No Bluetooth adapter or no matching device
    #[error("Device not found")]
    DeviceNotFound,

    /// Device connection failed
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// Device disconnected unexpectedly
    #[error("Device disconnected")]
    Disconnected,

    /// Operation timeout
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// The peripheral does not expose the terminal service at all
    #[error("Wrong device type: terminal service not present")]
    WrongDeviceType,

    /// The terminal service is present but a required characteristic is not
    #[error("Missing capability: {0}")]
    MissingCapability(String),

    /// Service discovery finished with a failure status
    #[error("Service discovery failed with status {status:02X}")]
    DiscoveryFailed {
        /// GATT status reported by the stack
        status: u8,
    },

    /// Enabling notifications or indications was rejected
    #[error("Subscription to {characteristic} failed")]
    SubscriptionFailed {
        /// Characteristic whose descriptor write failed
        characteristic: Uuid,
    },

    /// A beacon payload did not match its fixed layout
    #[error("Decode error: expected {expected} bytes, got {actual}")]
    Decode {
        /// Required payload length
        expected: usize,
        /// Actual payload length
        actual: usize,
    },

    /// Outbound text could not be encoded in the selected format
    #[error("invalid message format")]
    InvalidMessageFormat,

    /// The link layer rejected a packet write
    #[error("failed to send data")]
    WriteRejected,

    /// A send operation is already in flight
    #[error("A message is already being transmitted")]
    SendInProgress,

    /// Operation not valid in the current session state
    #[error("Invalid session state: {state}")]
    InvalidState {
        /// Current session state description
        state: String,
    },
}

/// Result type for terminal operations
pub type Result<T> = std::result::Result<T, TerminalError>;

impl TerminalError {
    /// Check if this error indicates a link-level issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::ConnectionFailed(_)
                | Self::Disconnected
                | Self::DeviceNotFound
                | Self::Timeout { .. }
        )
    }

    /// Check if this error terminates the current session
    #[must_use]
    pub const fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Self::WrongDeviceType
                | Self::MissingCapability(_)
                | Self::DiscoveryFailed { .. }
                | Self::SubscriptionFailed { .. }
                | Self::Disconnected
        )
    }

    /// Check if this error only affects a single outbound message
    #[must_use]
    pub const fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidMessageFormat | Self::WriteRejected | Self::SendInProgress
        )
    }
}
