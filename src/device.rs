use btleplug::{api::Peripheral as _, platform::Peripheral};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{broadcast, mpsc, Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{error, info, warn};

use crate::{
    advertisement::AdvertisementClassifier,
    ble::{handle_notifications, watch_disconnect, BleManager, PeripheralLink},
    error::{Result, TerminalError},
    events::{EventBus, EventKind, KindReceiver, TerminalEvent},
    log::{MessageLog, MessageLogEntry},
    registry::DeviceRegistry,
    session::{GattEvent, GattSession, SessionAction, SessionState, SessionStateMachine},
    transport::{GattLink, MessageTransport},
    types::{ConnectionParams, DiscoveredDevice, Encoding, GattProfile, LineEnding, TerminalConfig},
};

/// Main interface for talking to a terminal peripheral
///
/// `TerminalDevice` owns one connected session: it scans, connects, walks the
/// subscription sequence, and then lets the caller send text and observe replies
/// through the event bus and the message log.
///
/// # Examples
///
/// ```no_run
/// use bleterm::{ConnectionParams, Encoding, LineEnding, TerminalDevice};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let terminal = TerminalDevice::connect_first(ConnectionParams::default()).await?;
///
///     terminal.set_line_ending(LineEnding::CrLf).await;
///     terminal.send("AT").await?;
///
///     terminal.set_encoding(Encoding::Hex).await;
///     terminal.send("01 02 FF").await?;
///
///     for entry in terminal.log_snapshot().await {
///         println!("{:?}: {}", entry.direction, entry.text);
///     }
///
///     terminal.disconnect().await?;
///     Ok(())
/// }
/// ```
pub struct TerminalDevice {
    ble_manager: BleManager,
    peripheral: Peripheral,
    device: DiscoveredDevice,
    machine: Arc<Mutex<SessionStateMachine>>,
    transport: MessageTransport,
    config: Arc<RwLock<TerminalConfig>>,
    events: EventBus,
    tasks: Vec<JoinHandle<()>>,
}

impl TerminalDevice {
    /// Scan and connect to the connectable device with the strongest signal
    ///
    /// # Errors
    ///
    /// Returns [`TerminalError::DeviceNotFound`] if the scan finds no connectable
    /// device, or any error from [`TerminalDevice::connect_to_device`].
    pub async fn connect_first(params: ConnectionParams) -> Result<Self> {
        let ble_manager = BleManager::new().await?;
        let mut registry = DeviceRegistry::new(AdvertisementClassifier::new(params.company_id));
        ble_manager
            .scan(Duration::from_millis(params.scan_timeout_ms), &mut registry)
            .await?;

        let device = strongest(registry.devices())
            .cloned()
            .ok_or(TerminalError::DeviceNotFound)?;
        registry.end_scan();

        Self::connect_to_device(ble_manager, device, &params, GattProfile::default()).await
    }

    /// Scan and connect to the device advertising at `address`
    ///
    /// # Errors
    ///
    /// Returns [`TerminalError::DeviceNotFound`] if no connectable device with that
    /// address was seen, or any error from [`TerminalDevice::connect_to_device`].
    pub async fn connect(address: &str, params: ConnectionParams) -> Result<Self> {
        let ble_manager = BleManager::new().await?;
        let mut registry = DeviceRegistry::new(AdvertisementClassifier::new(params.company_id));
        ble_manager
            .scan(Duration::from_millis(params.scan_timeout_ms), &mut registry)
            .await?;

        let device = registry
            .device_by_address(address)
            .cloned()
            .ok_or(TerminalError::DeviceNotFound)?;
        registry.end_scan();

        Self::connect_to_device(ble_manager, device, &params, GattProfile::default()).await
    }

    /// Connect to a device found by a previous scan on `ble_manager`
    ///
    /// Runs the full subscription sequence for `profile`, then starts the
    /// notification pump and the disconnect watcher.
    ///
    /// # Errors
    ///
    /// Returns [`TerminalError::DeviceNotFound`] if the adapter no longer knows the
    /// device, [`TerminalError::ConnectionFailed`] if the link cannot be established,
    /// [`TerminalError::WrongDeviceType`] or [`TerminalError::MissingCapability`] if
    /// the peripheral is not a terminal, or [`TerminalError::SubscriptionFailed`] if
    /// enabling notifications fails.
    pub async fn connect_to_device(
        ble_manager: BleManager,
        device: DiscoveredDevice,
        params: &ConnectionParams,
        profile: GattProfile,
    ) -> Result<Self> {
        info!("Connecting to device: {}", device.identity);

        let peripheral = ble_manager
            .find_peripheral(&device.identity.address)
            .await?;
        let events = EventBus::new();

        let mut machine = SessionStateMachine::new(profile);
        let (session, notifications) = ble_manager
            .establish_session(
                &peripheral,
                &mut machine,
                Duration::from_millis(params.connect_timeout_ms),
                &events,
            )
            .await?;

        let link: Arc<dyn GattLink> = Arc::new(PeripheralLink::new(peripheral.clone()));
        let transport = MessageTransport::new(link, session, events.clone());
        let machine = Arc::new(Mutex::new(machine));
        let config = Arc::new(RwLock::new(TerminalConfig::default()));

        let (sender, receiver) = mpsc::unbounded_channel();
        let mut tasks = Vec::with_capacity(3);

        tasks.push(tokio::spawn(handle_notifications(
            notifications,
            sender.clone(),
        )));

        let adapter = ble_manager.adapter().clone();
        let id = peripheral.id();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = watch_disconnect(adapter, id, sender).await {
                error!("Disconnect watcher failed: {}", e);
            }
        }));

        tasks.push(tokio::spawn(route_events(
            receiver,
            machine.clone(),
            transport.clone(),
            config.clone(),
            events.clone(),
        )));

        Ok(Self {
            ble_manager,
            peripheral,
            device,
            machine,
            transport,
            config,
            events,
            tasks,
        })
    }

    /// Device this terminal is connected to
    #[must_use]
    pub const fn device(&self) -> &DiscoveredDevice {
        &self.device
    }

    /// Handles of the ready session
    #[must_use]
    pub const fn session(&self) -> &GattSession {
        self.transport.session()
    }

    /// Current session state
    pub async fn state(&self) -> SessionState {
        self.machine.lock().await.state()
    }

    /// Check whether the session is still ready for traffic
    pub async fn is_connected(&self) -> bool {
        self.state().await == SessionState::Ready
    }

    /// Subscribe to all terminal events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TerminalEvent> {
        self.events.subscribe()
    }

    /// Subscribe to terminal events of one kind
    #[must_use]
    pub fn subscribe_kind(&self, kind: EventKind) -> KindReceiver {
        self.events.subscribe_kind(kind)
    }

    /// Current encoding and line-ending selection
    pub async fn config(&self) -> TerminalConfig {
        *self.config.read().await
    }

    /// Select the encoding for outbound text and inbound display
    pub async fn set_encoding(&self, encoding: Encoding) {
        info!("Encoding set to {}", encoding);
        self.config.write().await.encoding = encoding;
    }

    /// Select the line ending appended to outbound text
    pub async fn set_line_ending(&self, line_ending: LineEnding) {
        info!("Line ending set to {}", line_ending);
        self.config.write().await.line_ending = line_ending;
    }

    /// Send `text` with the current configuration
    ///
    /// # Errors
    ///
    /// Returns [`TerminalError::InvalidState`] if the session is no longer ready,
    /// [`TerminalError::SendInProgress`] if another send is running,
    /// [`TerminalError::InvalidMessageFormat`] for unparseable Hex input, or
    /// [`TerminalError::WriteRejected`] if a packet write fails.
    pub async fn send(&self, text: &str) -> Result<()> {
        let state = self.state().await;
        if state != SessionState::Ready {
            return Err(TerminalError::InvalidState {
                state: state.to_string(),
            });
        }

        let message = self.config.read().await.outbound(text);
        self.transport.send(message).await
    }

    /// Copy of the message log, oldest entry first
    pub async fn log_snapshot(&self) -> Vec<MessageLogEntry> {
        self.transport.log().read().await.snapshot()
    }

    /// Shared handle to the message log
    #[must_use]
    pub fn log(&self) -> Arc<RwLock<MessageLog>> {
        self.transport.log()
    }

    /// Remove all entries from the message log
    pub async fn clear_log(&self) {
        self.transport.log().write().await.clear();
    }

    /// Last battery level reported by the peripheral
    pub async fn battery_level(&self) -> Option<u8> {
        self.transport.battery_level().await
    }

    /// Disconnect from the device
    ///
    /// Publishes [`TerminalEvent::Disconnected`] unless the link was already gone.
    ///
    /// # Errors
    ///
    /// Returns [`TerminalError::Ble`] if disconnection fails.
    pub async fn disconnect(&self) -> Result<()> {
        info!("Disconnecting from {}", self.device.identity);

        let result = self.ble_manager.disconnect(&self.peripheral).await;
        release(&self.machine, &self.events).await;
        result
    }
}

impl Drop for TerminalDevice {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let peripheral = self.peripheral.clone();
        handle.spawn(async move {
            if peripheral.is_connected().await.unwrap_or(false) {
                let _ = peripheral.disconnect().await;
            }
        });
    }
}

/// Pick the device with the strongest signal; ties keep first-seen order
fn strongest(devices: &[DiscoveredDevice]) -> Option<&DiscoveredDevice> {
    devices.iter().rev().max_by_key(|device| device.rssi)
}

/// Drive a disconnect through the state machine, announcing it once
async fn release(machine: &Mutex<SessionStateMachine>, events: &EventBus) {
    let actions = machine.lock().await.handle(GattEvent::Disconnected);
    if actions.contains(&SessionAction::Release) {
        events.publish(TerminalEvent::Disconnected);
    }
}

/// Consume stack events of a ready session until it disconnects
async fn route_events(
    mut receiver: mpsc::UnboundedReceiver<GattEvent>,
    machine: Arc<Mutex<SessionStateMachine>>,
    transport: MessageTransport,
    config: Arc<RwLock<TerminalConfig>>,
    events: EventBus,
) {
    while let Some(event) = receiver.recv().await {
        match event {
            GattEvent::CharacteristicChanged {
                characteristic,
                value,
            } => {
                let encoding = config.read().await.encoding;
                transport
                    .handle_notification(characteristic, &value, encoding)
                    .await;
            }
            GattEvent::Disconnected => {
                warn!("Link to {} lost", transport.session().peer);
                release(&machine, &events).await;
                break;
            }
            other => {
                machine.lock().await.handle(other);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        session::ServiceInfo,
        types::{DeviceIdentity, Direction},
    };
    use async_trait::async_trait;
    use uuid::Uuid;

    struct NullLink;

    #[async_trait]
    impl GattLink for NullLink {
        async fn write(&self, _characteristic: Uuid, _packet: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    fn ready_machine() -> SessionStateMachine {
        let profile = GattProfile::default();
        let mut machine = SessionStateMachine::new(profile);
        machine.connect("AA:BB:CC:DD:EE:FF").unwrap();
        machine.handle(GattEvent::Connected);
        machine.handle(GattEvent::ServicesDiscovered {
            status: 0,
            services: vec![ServiceInfo {
                uuid: profile.service,
                characteristics: vec![profile.notify, profile.write],
            }],
        });
        machine.handle(GattEvent::DescriptorWriteComplete {
            characteristic: profile.notify,
            status: 0,
        });
        assert_eq!(machine.state(), SessionState::Ready);
        machine
    }

    #[test]
    fn test_strongest_device_selection() {
        let devices = vec![
            DiscoveredDevice::new(DeviceIdentity::new("A", "01"), -80),
            DiscoveredDevice::new(DeviceIdentity::new("B", "02"), -40),
            DiscoveredDevice::new(DeviceIdentity::new("C", "03"), -40),
        ];
        assert_eq!(strongest(&devices).unwrap().identity.name, "B");
        assert!(strongest(&[]).is_none());
    }

    #[tokio::test]
    async fn test_route_events_until_disconnect() {
        let machine = ready_machine();
        let session = machine.ready_session().cloned().unwrap();
        let machine = Arc::new(Mutex::new(machine));

        let events = EventBus::new();
        let mut disconnected = events.subscribe_kind(EventKind::Disconnected);
        let link: Arc<dyn GattLink> = Arc::new(NullLink);
        let transport = MessageTransport::new(link, session.clone(), events.clone());
        let config = Arc::new(RwLock::new(TerminalConfig {
            encoding: Encoding::Hex,
            line_ending: LineEnding::None,
        }));

        let (sender, receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(route_events(
            receiver,
            machine.clone(),
            transport.clone(),
            config,
            events.clone(),
        ));

        sender
            .send(GattEvent::CharacteristicChanged {
                characteristic: session.notify,
                value: vec![0x4F, 0x4B],
            })
            .unwrap();
        sender.send(GattEvent::Disconnected).unwrap();
        task.await.unwrap();

        let entries = transport.log().read().await.snapshot();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].direction, Direction::Received);
        assert_eq!(entries[0].text, "4F 4B ");

        assert_eq!(machine.lock().await.state(), SessionState::Disconnected);
        assert_eq!(
            disconnected.recv().await,
            Some(TerminalEvent::Disconnected)
        );
    }

    #[tokio::test]
    async fn test_release_announces_once() {
        let machine = Mutex::new(ready_machine());
        let events = EventBus::new();
        let mut all = events.subscribe();

        release(&machine, &events).await;
        release(&machine, &events).await;
        events.publish(TerminalEvent::Connected);

        assert_eq!(all.recv().await.unwrap(), TerminalEvent::Disconnected);
        assert_eq!(all.recv().await.unwrap(), TerminalEvent::Connected);
    }
}
