use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::session::{GattSession, SessionFailure};

/// Number of events buffered per subscriber before the slowest one lags
pub const EVENT_CAPACITY: usize = 64;

/// Everything the core reports to the outside world
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalEvent {
    /// Link established
    Connected,
    /// Service discovery finished and the terminal service was found
    ServicesReady,
    /// Subscriptions complete, the session accepts outbound messages
    SessionReady(GattSession),
    /// Session setup failed and the link is being torn down
    SessionFailed(SessionFailure),
    /// Link closed
    Disconnected,
    /// Raw notification payload
    DataReceived {
        /// Source characteristic
        characteristic: Uuid,
        /// Payload
        bytes: Vec<u8>,
    },
    /// Battery level notification
    BatteryLevel(u8),
    /// All packets of a message were written
    TxFinished {
        /// Text as entered
        text: String,
    },
    /// A message could not be sent
    TxError {
        /// Human-readable reason
        reason: String,
    },
}

/// Discriminant of a [`TerminalEvent`], for subscribers interested in one kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// [`TerminalEvent::Connected`]
    Connected,
    /// [`TerminalEvent::ServicesReady`]
    ServicesReady,
    /// [`TerminalEvent::SessionReady`]
    SessionReady,
    /// [`TerminalEvent::SessionFailed`]
    SessionFailed,
    /// [`TerminalEvent::Disconnected`]
    Disconnected,
    /// [`TerminalEvent::DataReceived`]
    DataReceived,
    /// [`TerminalEvent::BatteryLevel`]
    BatteryLevel,
    /// [`TerminalEvent::TxFinished`]
    TxFinished,
    /// [`TerminalEvent::TxError`]
    TxError,
}

impl TerminalEvent {
    /// Kind of this event
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Connected => EventKind::Connected,
            Self::ServicesReady => EventKind::ServicesReady,
            Self::SessionReady(_) => EventKind::SessionReady,
            Self::SessionFailed(_) => EventKind::SessionFailed,
            Self::Disconnected => EventKind::Disconnected,
            Self::DataReceived { .. } => EventKind::DataReceived,
            Self::BatteryLevel(_) => EventKind::BatteryLevel,
            Self::TxFinished { .. } => EventKind::TxFinished,
            Self::TxError { .. } => EventKind::TxError,
        }
    }
}

/// In-process fan-out of [`TerminalEvent`]s
///
/// Cloning the bus shares the same channel. Publishing with no subscribers is not
/// an error.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<TerminalEvent>,
}

impl EventBus {
    /// Create a bus with [`EVENT_CAPACITY`] slots per subscriber
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    /// Publish an event to all current subscribers
    pub fn publish(&self, event: TerminalEvent) {
        debug!("Event: {:?}", event.kind());
        let _ = self.sender.send(event);
    }

    /// Subscribe to all events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TerminalEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to events of a single kind
    #[must_use]
    pub fn subscribe_kind(&self, kind: EventKind) -> KindReceiver {
        KindReceiver {
            kind,
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver that yields only events of one [`EventKind`]
#[derive(Debug)]
pub struct KindReceiver {
    kind: EventKind,
    receiver: broadcast::Receiver<TerminalEvent>,
}

impl KindReceiver {
    /// Wait for the next matching event
    ///
    /// Lagged events are skipped. Returns `None` once the bus is dropped.
    pub async fn recv(&mut self) -> Option<TerminalEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.kind() == self.kind => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
