use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{Mutex, OwnedMutexGuard, RwLock},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{Result, TerminalError},
    events::{EventBus, TerminalEvent},
    log::MessageLog,
    protocol::{battery_notice, decode_battery_level, decode_terminal_payload, encode, fragment},
    session::GattSession,
    types::{Direction, Encoding, OutboundMessage},
};

/// Delay after each successful packet write
pub const PACING_DELAY: Duration = Duration::from_millis(10);

/// Packet write primitive of a connected peripheral
///
/// Implementations return an error when the link layer refuses the write, which is
/// also how a send notices a disconnect that happened mid-message.
#[async_trait]
pub trait GattLink: Send + Sync {
    /// Write one packet of at most 20 bytes to `characteristic`
    async fn write(&self, characteristic: Uuid, packet: &[u8]) -> Result<()>;
}

/// Sends messages over a ready session and routes inbound notifications
///
/// Cloning is cheap; clones share the link, the log and the in-flight guard.
#[derive(Clone)]
pub struct MessageTransport {
    link: Arc<dyn GattLink>,
    session: GattSession,
    events: EventBus,
    log: Arc<RwLock<MessageLog>>,
    battery_level: Arc<RwLock<Option<u8>>>,
    in_flight: Arc<Mutex<()>>,
}

impl MessageTransport {
    /// Bind a transport to the handles of a ready session
    pub fn new(link: Arc<dyn GattLink>, session: GattSession, events: EventBus) -> Self {
        Self::with_log(link, session, events, Arc::new(RwLock::new(MessageLog::new())))
    }

    /// Bind a transport that appends to an existing message log
    pub fn with_log(
        link: Arc<dyn GattLink>,
        session: GattSession,
        events: EventBus,
        log: Arc<RwLock<MessageLog>>,
    ) -> Self {
        Self {
            link,
            session,
            events,
            log,
            battery_level: Arc::new(RwLock::new(None)),
            in_flight: Arc::new(Mutex::new(())),
        }
    }

    /// Session handles this transport writes to
    #[must_use]
    pub const fn session(&self) -> &GattSession {
        &self.session
    }

    /// Shared message log
    #[must_use]
    pub fn log(&self) -> Arc<RwLock<MessageLog>> {
        self.log.clone()
    }

    /// Last battery level reported by the peripheral
    pub async fn battery_level(&self) -> Option<u8> {
        *self.battery_level.read().await
    }

    /// Whether a send is currently in flight
    #[must_use]
    pub fn is_sending(&self) -> bool {
        self.in_flight.try_lock().is_err()
    }

    /// Send a message and wait for the last packet to be written
    ///
    /// On success the text is logged as [`Direction::Transmitted`] and
    /// [`TerminalEvent::TxFinished`] is published; on failure
    /// [`TerminalEvent::TxError`] is published and the log is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`TerminalError::SendInProgress`] if another send has not finished,
    /// [`TerminalError::InvalidMessageFormat`] if Hex input does not parse (nothing is
    /// written), or [`TerminalError::WriteRejected`] if a packet write fails (the
    /// remaining packets are dropped).
    pub async fn send(&self, message: OutboundMessage) -> Result<()> {
        let guard = self.acquire()?;
        self.deliver(message, guard).await
    }

    /// Start sending a message on a background task
    ///
    /// The in-flight check happens before the task is spawned, so a second dispatch
    /// while one is running fails immediately.
    ///
    /// # Errors
    ///
    /// Returns [`TerminalError::SendInProgress`] if another send has not finished.
    pub fn dispatch(&self, message: OutboundMessage) -> Result<JoinHandle<Result<()>>> {
        let guard = self.acquire()?;
        let transport = self.clone();
        Ok(tokio::spawn(async move {
            transport.deliver(message, guard).await
        }))
    }

    fn acquire(&self) -> Result<OwnedMutexGuard<()>> {
        self.in_flight
            .clone()
            .try_lock_owned()
            .map_err(|_| TerminalError::SendInProgress)
    }

    async fn deliver(&self, message: OutboundMessage, _guard: OwnedMutexGuard<()>) -> Result<()> {
        match self.write_packets(&message).await {
            Ok(count) => {
                let text = format!("{}{}", message.text, message.line_ending.suffix());
                info!("Tx: {:?} in {} packet(s)", text, count);
                self.log.write().await.append(Direction::Transmitted, &text);
                self.events.publish(TerminalEvent::TxFinished { text });
                Ok(())
            }
            Err(e) => {
                warn!("Send failed: {}", e);
                self.events.publish(TerminalEvent::TxError {
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn write_packets(&self, message: &OutboundMessage) -> Result<usize> {
        let payload = encode(message)?;
        let packets = fragment(&payload);

        for packet in &packets {
            debug!("Tx packet: {:02X?}", &packet[..]);
            self.link
                .write(self.session.write, packet)
                .await
                .map_err(|e| {
                    debug!("Packet write rejected: {}", e);
                    TerminalError::WriteRejected
                })?;
            tokio::time::sleep(PACING_DELAY).await;
        }

        Ok(packets.len())
    }

    /// Route one inbound notification
    ///
    /// Battery payloads become a [`Direction::BatteryNotice`] entry and a
    /// [`TerminalEvent::BatteryLevel`] event. Payloads from the notify or indicate
    /// characteristic are decoded for `encoding` and appended as
    /// [`Direction::Received`]. Anything else is ignored.
    pub async fn handle_notification(&self, characteristic: Uuid, value: &[u8], encoding: Encoding) {
        if Some(characteristic) == self.session.battery_level {
            let Some(level) = decode_battery_level(value) else {
                warn!("Empty battery notification");
                return;
            };
            debug!("Battery level: {}", level);
            *self.battery_level.write().await = Some(level);
            self.log
                .write()
                .await
                .append(Direction::BatteryNotice, &battery_notice(level));
            self.events.publish(TerminalEvent::BatteryLevel(level));
            return;
        }

        let is_terminal = characteristic == self.session.notify
            || Some(characteristic) == self.session.indicate;
        if !is_terminal {
            debug!("Ignoring notification from {}", characteristic);
            return;
        }

        debug!("Rx: {:02X?}", value);
        let text = decode_terminal_payload(value, encoding);
        self.log.write().await.append(Direction::Received, &text);
        self.events.publish(TerminalEvent::DataReceived {
            characteristic,
            bytes: value.to_vec(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{events::EventKind, types::LineEnding, GattProfile};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::{assert_err, assert_ok};

    /// Records every packet; optionally rejects the N-th write (1-based)
    #[derive(Default)]
    struct MockLink {
        writes: std::sync::Mutex<Vec<(Uuid, Vec<u8>)>>,
        attempts: AtomicUsize,
        reject_at: Option<usize>,
    }

    impl MockLink {
        fn rejecting(n: usize) -> Self {
            Self {
                reject_at: Some(n),
                ..Default::default()
            }
        }

        fn packets(&self) -> Vec<Vec<u8>> {
            self.writes
                .lock()
                .unwrap()
                .iter()
                .map(|(_, p)| p.clone())
                .collect()
        }
    }

    #[async_trait]
    impl GattLink for MockLink {
        async fn write(&self, characteristic: Uuid, packet: &[u8]) -> Result<()> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if self.reject_at == Some(attempt) {
                return Err(TerminalError::Disconnected);
            }
            self.writes
                .lock()
                .unwrap()
                .push((characteristic, packet.to_vec()));
            Ok(())
        }
    }

    fn session() -> GattSession {
        let profile = GattProfile::default();
        GattSession {
            peer: "AA:BB:CC:DD:EE:FF".to_string(),
            service: profile.service,
            notify: profile.notify,
            write: profile.write,
            indicate: Some(profile.indicate),
            battery_level: Some(profile.battery_level),
        }
    }

    fn ascii(text: &str) -> OutboundMessage {
        OutboundMessage {
            text: text.to_string(),
            encoding: Encoding::Ascii,
            line_ending: LineEnding::None,
        }
    }

    fn transport(link: &Arc<MockLink>) -> (MessageTransport, EventBus) {
        let bus = EventBus::new();
        let link: Arc<dyn GattLink> = link.clone();
        (MessageTransport::new(link, session(), bus.clone()), bus)
    }

    #[tokio::test]
    async fn test_send_fragments_in_order() {
        let link = Arc::new(MockLink::default());
        let (transport, bus) = transport(&link);
        let mut events = bus.subscribe_kind(EventKind::TxFinished);

        let text = "abcdefghijklmnopqrstuvwxyz0123456789ABCDEFGHIJ";
        assert_ok!(transport.send(ascii(text)).await);

        let packets = link.packets();
        assert_eq!(packets.len(), text.len().div_ceil(20));
        assert!(packets.iter().all(|p| p.len() <= 20));
        assert_eq!(packets.concat(), text.as_bytes());
        assert!(link
            .writes
            .lock()
            .unwrap()
            .iter()
            .all(|(c, _)| *c == session().write));

        assert_eq!(
            events.recv().await,
            Some(TerminalEvent::TxFinished {
                text: text.to_string()
            })
        );

        let log = transport.log();
        let entries = log.read().await.snapshot();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].direction, Direction::Transmitted);
        assert_eq!(entries[0].text, text);
    }

    #[tokio::test]
    async fn test_rejected_packet_aborts_send() {
        let link = Arc::new(MockLink::rejecting(2));
        let (transport, bus) = transport(&link);
        let mut events = bus.subscribe_kind(EventKind::TxError);

        let error = assert_err!(transport.send(ascii(&"x".repeat(60))).await);
        assert!(matches!(error, TerminalError::WriteRejected));

        // First packet went out, second was rejected, third never attempted
        assert_eq!(link.packets().len(), 1);
        assert_eq!(link.attempts.load(Ordering::SeqCst), 2);

        assert_eq!(
            events.recv().await,
            Some(TerminalEvent::TxError {
                reason: "failed to send data".to_string()
            })
        );
        assert!(transport.log().read().await.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_hex_writes_nothing() {
        let link = Arc::new(MockLink::default());
        let (transport, bus) = transport(&link);
        let mut events = bus.subscribe_kind(EventKind::TxError);

        let message = OutboundMessage {
            text: "0G".to_string(),
            encoding: Encoding::Hex,
            line_ending: LineEnding::CrLf,
        };
        let error = assert_err!(transport.send(message).await);
        assert!(matches!(error, TerminalError::InvalidMessageFormat));
        assert_eq!(link.attempts.load(Ordering::SeqCst), 0);

        assert_eq!(
            events.recv().await,
            Some(TerminalEvent::TxError {
                reason: "invalid message format".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_hex_send_with_line_ending() {
        let link = Arc::new(MockLink::default());
        let (transport, _bus) = transport(&link);

        let message = OutboundMessage {
            text: "01 02 0A".to_string(),
            encoding: Encoding::Hex,
            line_ending: LineEnding::CrLf,
        };
        assert_ok!(transport.send(message).await);
        assert_eq!(link.packets(), vec![vec![0x01, 0x02, 0x0A]]);
    }

    #[tokio::test]
    async fn test_transmitted_text_keeps_line_ending() {
        let link = Arc::new(MockLink::default());
        let (transport, bus) = transport(&link);
        let mut events = bus.subscribe_kind(EventKind::TxFinished);

        let message = || OutboundMessage {
            text: "AT".to_string(),
            encoding: Encoding::Ascii,
            line_ending: LineEnding::CrLf,
        };
        assert_ok!(transport.send(message()).await);
        assert_ok!(transport.send(message()).await);

        for _ in 0..2 {
            assert_eq!(
                events.recv().await,
                Some(TerminalEvent::TxFinished {
                    text: "AT\r\n".to_string()
                })
            );
        }

        let entries = transport.log().read().await.snapshot();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].direction, Direction::Transmitted);
        assert_eq!(entries[0].text, "AT\r\nAT\r\n");
    }

    #[tokio::test]
    async fn test_empty_message_sends_no_packets() {
        let link = Arc::new(MockLink::default());
        let (transport, _bus) = transport(&link);

        assert_ok!(transport.send(ascii("")).await);
        assert!(link.packets().is_empty());
    }

    #[tokio::test]
    async fn test_second_send_while_in_flight_is_rejected() {
        let link = Arc::new(MockLink::default());
        let (transport, _bus) = transport(&link);

        let handle = assert_ok!(transport.dispatch(ascii(&"y".repeat(100))));
        assert!(transport.is_sending());

        let error = assert_err!(transport.send(ascii("second")).await);
        assert!(matches!(error, TerminalError::SendInProgress));

        assert_ok!(assert_ok!(handle.await));
        assert!(!transport.is_sending());
        assert_eq!(link.packets().len(), 5);

        assert_ok!(transport.send(ascii("third")).await);
    }

    #[tokio::test]
    async fn test_receive_path_routes_by_characteristic() {
        let link = Arc::new(MockLink::default());
        let (transport, bus) = transport(&link);
        let mut battery = bus.subscribe_kind(EventKind::BatteryLevel);
        let profile = GattProfile::default();

        transport
            .handle_notification(profile.notify, b"hel", Encoding::Ascii)
            .await;
        transport
            .handle_notification(profile.indicate, b"lo", Encoding::Ascii)
            .await;
        transport
            .handle_notification(profile.battery_level, &[87], Encoding::Ascii)
            .await;
        transport
            .handle_notification(profile.notify, &[0x0A, 0xFF], Encoding::Hex)
            .await;
        transport
            .handle_notification(Uuid::from_u128(0x1234), b"noise", Encoding::Ascii)
            .await;

        let entries = transport.log().read().await.snapshot();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].direction, Direction::Received);
        assert_eq!(entries[0].text, "hello");
        assert_eq!(entries[1].direction, Direction::BatteryNotice);
        assert_eq!(entries[1].text, "Battery level: 87 ");
        assert_eq!(entries[2].text, "0A FF ");

        assert_eq!(battery.recv().await, Some(TerminalEvent::BatteryLevel(87)));
        assert_eq!(transport.battery_level().await, Some(87));
    }
}
