//! Connection and subscription sequencing for a terminal peripheral.
//!
//! The state machine is sans-IO: the BLE driver feeds it [`GattEvent`]s and performs
//! the [`SessionAction`]s it returns. Descriptor writes are chained, each one issued
//! only after the previous write was confirmed, because most stacks reject or drop a
//! second GATT operation while one is outstanding.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> ServicesDiscovered -> CapabilityVerified
//!     -> SubscribingNotify -> SubscribingIndicate -> SubscribingBattery -> Ready
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    error::{Result, TerminalError},
    types::GattProfile,
};

/// GATT status code reported for a successful operation
pub const GATT_SUCCESS: u8 = 0x00;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No link
    Disconnected,
    /// Link establishment requested
    Connecting,
    /// Link up, service discovery requested
    Connected,
    /// Service discovery completed successfully
    ServicesDiscovered,
    /// Terminal service and its notify and write characteristics are present
    CapabilityVerified,
    /// Waiting for the notify descriptor write to complete
    SubscribingNotify,
    /// Waiting for the indicate descriptor write to complete
    SubscribingIndicate,
    /// Waiting for the battery descriptor write to complete
    SubscribingBattery,
    /// All subscriptions in place, the transport may use the session
    Ready,
    /// Session setup failed; only a disconnect leaves this state
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::ServicesDiscovered => "ServicesDiscovered",
            Self::CapabilityVerified => "CapabilityVerified",
            Self::SubscribingNotify => "SubscribingNotify",
            Self::SubscribingIndicate => "SubscribingIndicate",
            Self::SubscribingBattery => "SubscribingBattery",
            Self::Ready => "Ready",
            Self::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Why a session ended in [`SessionState::Failed`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionFailure {
    /// Link could not be established
    ConnectionFailed(String),
    /// Service discovery reported a failure status
    DiscoveryFailed(u8),
    /// Terminal service absent
    WrongDeviceType,
    /// Terminal service present, named characteristic absent
    MissingCapability(String),
    /// Descriptor write for the characteristic was rejected
    SubscriptionFailed(Uuid),
}

impl fmt::Display for SessionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed(reason) => write!(f, "connection failed: {reason}"),
            Self::DiscoveryFailed(status) => write!(f, "service discovery failed ({status:02X})"),
            Self::WrongDeviceType => write!(f, "wrong device type"),
            Self::MissingCapability(what) => write!(f, "missing capability: {what}"),
            Self::SubscriptionFailed(uuid) => write!(f, "subscription to {uuid} failed"),
        }
    }
}

impl From<SessionFailure> for TerminalError {
    fn from(failure: SessionFailure) -> Self {
        match failure {
            SessionFailure::ConnectionFailed(reason) => Self::ConnectionFailed(reason),
            SessionFailure::DiscoveryFailed(status) => Self::DiscoveryFailed { status },
            SessionFailure::WrongDeviceType => Self::WrongDeviceType,
            SessionFailure::MissingCapability(what) => Self::MissingCapability(what),
            SessionFailure::SubscriptionFailed(characteristic) => {
                Self::SubscriptionFailed { characteristic }
            }
        }
    }
}

/// A discovered service and the characteristics under it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    /// Service UUID
    pub uuid: Uuid,
    /// Characteristic UUIDs
    pub characteristics: Vec<Uuid>,
}

/// Events delivered by the BLE stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattEvent {
    /// Link established
    Connected,
    /// Link establishment failed
    ConnectionFailed(String),
    /// Link lost or closed
    Disconnected,
    /// Service discovery finished
    ServicesDiscovered {
        /// GATT status
        status: u8,
        /// Services found on the peripheral
        services: Vec<ServiceInfo>,
    },
    /// Notification or indication payload
    CharacteristicChanged {
        /// Source characteristic
        characteristic: Uuid,
        /// Payload
        value: Vec<u8>,
    },
    /// Characteristic write finished
    CharacteristicWriteComplete {
        /// Written characteristic
        characteristic: Uuid,
        /// GATT status
        status: u8,
    },
    /// CCCD write finished
    DescriptorWriteComplete {
        /// Characteristic owning the descriptor
        characteristic: Uuid,
        /// GATT status
        status: u8,
    },
}

/// Value written to a Client Characteristic Configuration Descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorValue {
    /// Enable notifications
    EnableNotification,
    /// Enable indications
    EnableIndication,
}

impl DescriptorValue {
    /// Descriptor bytes as written on the wire
    #[must_use]
    pub const fn bytes(self) -> [u8; 2] {
        match self {
            Self::EnableNotification => [0x01, 0x00],
            Self::EnableIndication => [0x02, 0x00],
        }
    }
}

/// Work the driver must carry out after an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Start service discovery
    DiscoverServices,
    /// Write the CCCD of `characteristic`
    WriteDescriptor {
        /// Characteristic to subscribe to
        characteristic: Uuid,
        /// Notification or indication
        value: DescriptorValue,
    },
    /// Session reached [`SessionState::Ready`]
    Ready(GattSession),
    /// Session failed; the driver tears the link down
    Fail(SessionFailure),
    /// Link is gone and the session handles were released
    Release,
}

/// Handles resolved for a connected terminal peripheral
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattSession {
    /// Address of the connected peripheral
    pub peer: String,
    /// Terminal service
    pub service: Uuid,
    /// Notify characteristic
    pub notify: Uuid,
    /// Write characteristic
    pub write: Uuid,
    /// Indicate characteristic, absent on older firmware
    pub indicate: Option<Uuid>,
    /// Battery level characteristic, absent without a battery service
    pub battery_level: Option<Uuid>,
}

/// Drives a single terminal session from connect to ready
#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    profile: GattProfile,
    state: SessionState,
    peer: Option<String>,
    session: Option<GattSession>,
    failure: Option<SessionFailure>,
}

impl SessionStateMachine {
    /// Create a disconnected state machine for the given UUID profile
    #[must_use]
    pub const fn new(profile: GattProfile) -> Self {
        Self {
            profile,
            state: SessionState::Disconnected,
            peer: None,
            session: None,
            failure: None,
        }
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Resolved handles, available only while [`SessionState::Ready`]
    #[must_use]
    pub fn ready_session(&self) -> Option<&GattSession> {
        if self.state == SessionState::Ready {
            self.session.as_ref()
        } else {
            None
        }
    }

    /// Reason for the last failure
    #[must_use]
    pub const fn failure(&self) -> Option<&SessionFailure> {
        self.failure.as_ref()
    }

    /// UUID profile in use
    #[must_use]
    pub const fn profile(&self) -> &GattProfile {
        &self.profile
    }

    /// Begin connecting to `peer`
    ///
    /// # Errors
    ///
    /// Returns [`TerminalError::InvalidState`] unless the machine is
    /// [`SessionState::Disconnected`].
    pub fn connect(&mut self, peer: impl Into<String>) -> Result<()> {
        if self.state != SessionState::Disconnected {
            return Err(TerminalError::InvalidState {
                state: self.state.to_string(),
            });
        }

        let peer = peer.into();
        info!("Connecting to {}", peer);
        self.peer = Some(peer);
        self.failure = None;
        self.state = SessionState::Connecting;
        Ok(())
    }

    /// Feed one stack event, returning the actions it triggers
    pub fn handle(&mut self, event: GattEvent) -> Vec<SessionAction> {
        match (self.state, event) {
            (SessionState::Disconnected, GattEvent::Disconnected) => Vec::new(),
            (_, GattEvent::Disconnected) => {
                info!("Session closed in state {}", self.state);
                self.peer = None;
                self.session = None;
                self.state = SessionState::Disconnected;
                vec![SessionAction::Release]
            }
            (SessionState::Connecting, GattEvent::Connected) => {
                self.state = SessionState::Connected;
                vec![SessionAction::DiscoverServices]
            }
            (SessionState::Connecting, GattEvent::ConnectionFailed(reason)) => {
                self.fail(SessionFailure::ConnectionFailed(reason))
            }
            (SessionState::Connected, GattEvent::ServicesDiscovered { status, services }) => {
                if status != GATT_SUCCESS {
                    return self.fail(SessionFailure::DiscoveryFailed(status));
                }
                self.state = SessionState::ServicesDiscovered;
                self.verify_capability(&services)
            }
            (SessionState::SubscribingNotify, GattEvent::DescriptorWriteComplete { characteristic, status })
                if self.is_handle(characteristic, |s| Some(s.notify)) =>
            {
                if status != GATT_SUCCESS {
                    return self.fail(SessionFailure::SubscriptionFailed(characteristic));
                }
                self.after_notify()
            }
            (SessionState::SubscribingIndicate, GattEvent::DescriptorWriteComplete { characteristic, status })
                if self.is_handle(characteristic, |s| s.indicate) =>
            {
                if status != GATT_SUCCESS {
                    return self.fail(SessionFailure::SubscriptionFailed(characteristic));
                }
                self.after_indicate()
            }
            (SessionState::SubscribingBattery, GattEvent::DescriptorWriteComplete { characteristic, status })
                if self.is_handle(characteristic, |s| s.battery_level) =>
            {
                if status != GATT_SUCCESS {
                    warn!("Battery subscription rejected ({status:02X}), continuing without it");
                }
                self.ready()
            }
            (_, GattEvent::CharacteristicChanged { .. }) => Vec::new(),
            (_, GattEvent::CharacteristicWriteComplete { characteristic, status }) => {
                if status != GATT_SUCCESS {
                    warn!("Write to {} completed with status {:02X}", characteristic, status);
                }
                Vec::new()
            }
            (state, event) => {
                warn!("Ignoring {:?} in state {}", event, state);
                Vec::new()
            }
        }
    }

    fn is_handle(&self, characteristic: Uuid, pick: impl Fn(&GattSession) -> Option<Uuid>) -> bool {
        self.session.as_ref().and_then(pick) == Some(characteristic)
    }

    fn verify_capability(&mut self, services: &[ServiceInfo]) -> Vec<SessionAction> {
        let Some(terminal) = services.iter().find(|s| s.uuid == self.profile.service) else {
            return self.fail(SessionFailure::WrongDeviceType);
        };

        let has = |uuid: Uuid| terminal.characteristics.contains(&uuid);
        if !has(self.profile.notify) {
            return self.fail(SessionFailure::MissingCapability(
                "notify characteristic".to_string(),
            ));
        }
        if !has(self.profile.write) {
            return self.fail(SessionFailure::MissingCapability(
                "write characteristic".to_string(),
            ));
        }

        let battery_level = services
            .iter()
            .find(|s| s.uuid == self.profile.battery_service)
            .filter(|s| s.characteristics.contains(&self.profile.battery_level))
            .map(|_| self.profile.battery_level);

        let session = GattSession {
            peer: self.peer.clone().unwrap_or_default(),
            service: terminal.uuid,
            notify: self.profile.notify,
            write: self.profile.write,
            indicate: has(self.profile.indicate).then_some(self.profile.indicate),
            battery_level,
        };
        let notify = session.notify;
        self.session = Some(session);
        self.state = SessionState::CapabilityVerified;
        debug!("{}: {:?}", self.state, self.session);

        self.state = SessionState::SubscribingNotify;
        vec![SessionAction::WriteDescriptor {
            characteristic: notify,
            value: DescriptorValue::EnableNotification,
        }]
    }

    fn after_notify(&mut self) -> Vec<SessionAction> {
        match self.session.as_ref().and_then(|s| s.indicate) {
            Some(indicate) => {
                self.state = SessionState::SubscribingIndicate;
                vec![SessionAction::WriteDescriptor {
                    characteristic: indicate,
                    value: DescriptorValue::EnableIndication,
                }]
            }
            None => {
                info!("No indicate characteristic, older firmware: skipping indicate and battery");
                self.ready()
            }
        }
    }

    fn after_indicate(&mut self) -> Vec<SessionAction> {
        match self.session.as_ref().and_then(|s| s.battery_level) {
            Some(battery_level) => {
                self.state = SessionState::SubscribingBattery;
                vec![SessionAction::WriteDescriptor {
                    characteristic: battery_level,
                    value: DescriptorValue::EnableNotification,
                }]
            }
            None => self.ready(),
        }
    }

    fn ready(&mut self) -> Vec<SessionAction> {
        self.state = SessionState::Ready;
        info!("Session ready");
        self.session
            .clone()
            .map(SessionAction::Ready)
            .into_iter()
            .collect()
    }

    fn fail(&mut self, failure: SessionFailure) -> Vec<SessionAction> {
        error!("Session failed in state {}: {}", self.state, failure);
        self.state = SessionState::Failed;
        self.session = None;
        self.failure = Some(failure.clone());
        vec![SessionAction::Fail(failure)]
    }
}
