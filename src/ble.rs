use async_trait::async_trait;
use btleplug::{
    api::{
        Central, CentralEvent, Characteristic, Manager as _, Peripheral as _,
        PeripheralProperties, ScanFilter, ValueNotification, WriteType,
    },
    platform::{Adapter, Manager, Peripheral, PeripheralId},
};
use futures::stream::{Stream, StreamExt};
use std::{collections::HashMap, pin::Pin, time::Duration};
use tokio::{
    sync::{mpsc, Mutex},
    time::{timeout, timeout_at, Instant},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{Result, TerminalError},
    events::{EventBus, TerminalEvent},
    registry::{DeviceRegistry, ScanReport},
    session::{
        DescriptorValue, GattEvent, GattSession, ServiceInfo, SessionAction, SessionState,
        SessionStateMachine, GATT_SUCCESS,
    },
    transport::GattLink,
};

/// Status reported for a GATT operation the stack refused
pub const GATT_ERROR: u8 = 0x85;

/// Flags AD structure prepended to every reassembled advertisement
const FLAGS_AD: [u8; 3] = [0x02, 0x01, 0x06];

/// AD type of manufacturer-specific data
const MANUFACTURER_AD_TYPE: u8 = 0xFF;

/// Notifications of one connected peripheral
pub type NotificationStream = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;

/// BLE manager for terminal peripherals and beacons
pub struct BleManager {
    #[allow(dead_code)]
    manager: Manager,
    adapter: Adapter,
    active: Mutex<Option<Peripheral>>,
}

impl BleManager {
    /// Create a new BLE manager bound to the first adapter
    ///
    /// # Errors
    ///
    /// Returns [`TerminalError::Ble`] if the Bluetooth stack cannot be initialized,
    /// or [`TerminalError::DeviceNotFound`] if no adapter is present.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(TerminalError::DeviceNotFound)?;

        Ok(Self {
            manager,
            adapter,
            active: Mutex::new(None),
        })
    }

    /// Adapter in use
    #[must_use]
    pub const fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Scan for `duration`, feeding every advertisement into `registry`
    ///
    /// Advertisements that cannot be read are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`TerminalError::Ble`] if scanning cannot be started or stopped.
    pub async fn scan(&self, duration: Duration, registry: &mut DeviceRegistry) -> Result<()> {
        info!("Starting scan for {}ms...", duration.as_millis());

        let mut events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;

        let deadline = Instant::now() + duration;
        while let Ok(Some(event)) = timeout_at(deadline, events.next()).await {
            let id = match event {
                CentralEvent::DeviceDiscovered(id)
                | CentralEvent::DeviceUpdated(id)
                | CentralEvent::ManufacturerDataAdvertisement { id, .. } => id,
                _ => continue,
            };
            self.observe(&id, registry).await;
        }

        self.adapter.stop_scan().await?;

        info!(
            "Scan completed. Found {} device(s) and {} beacon(s)",
            registry.devices().len(),
            registry.beacons().len()
        );
        Ok(())
    }

    async fn observe(&self, id: &PeripheralId, registry: &mut DeviceRegistry) {
        let peripheral = match self.adapter.peripheral(id).await {
            Ok(peripheral) => peripheral,
            Err(e) => {
                debug!("Skipping advertisement from {:?}: {}", id, e);
                return;
            }
        };

        if let Ok(Some(properties)) = peripheral.properties().await {
            registry.observe(&scan_report(&properties));
        }
    }

    /// Stop scanning
    ///
    /// # Errors
    ///
    /// Returns [`TerminalError::Ble`] if the adapter refuses.
    pub async fn stop_scan(&self) -> Result<()> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    /// Look up a peripheral the adapter has seen by its address
    ///
    /// # Errors
    ///
    /// Returns [`TerminalError::DeviceNotFound`] if no peripheral has that address.
    pub async fn find_peripheral(&self, address: &str) -> Result<Peripheral> {
        self.adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.address().to_string() == address)
            .ok_or(TerminalError::DeviceNotFound)
    }

    /// Connect to `peripheral` and drive `machine` until the session is ready
    ///
    /// Scanning is stopped and any other active connection is closed first. On a
    /// failure the link is torn down and `machine` is returned to
    /// [`SessionState::Disconnected`].
    ///
    /// The returned stream is opened before the first subscription, so it also
    /// holds values the peripheral pushed while the session was being set up.
    ///
    /// # Errors
    ///
    /// Returns the [`TerminalError`] matching the session failure,
    /// [`TerminalError::Ble`] if the notification stream cannot be opened, or
    /// [`TerminalError::InvalidState`] if `machine` is not disconnected.
    pub async fn establish_session(
        &self,
        peripheral: &Peripheral,
        machine: &mut SessionStateMachine,
        connect_timeout: Duration,
        events: &EventBus,
    ) -> Result<(GattSession, NotificationStream)> {
        if let Err(e) = self.adapter.stop_scan().await {
            debug!("Stop scan before connect: {}", e);
        }
        self.release_other(peripheral).await;

        machine.connect(peripheral.address().to_string())?;

        let mut notifications = None;
        let mut next = Some(connect(peripheral, connect_timeout).await);
        while let Some(event) = next.take() {
            for action in machine.handle(event) {
                match action {
                    SessionAction::DiscoverServices => {
                        events.publish(TerminalEvent::Connected);
                        match peripheral.notifications().await {
                            Ok(stream) => notifications = Some(stream),
                            Err(e) => {
                                abort(peripheral, machine).await;
                                return Err(e.into());
                            }
                        }
                        next = Some(discover(peripheral).await);
                    }
                    SessionAction::WriteDescriptor {
                        characteristic,
                        value,
                    } => {
                        if machine.state() == SessionState::SubscribingNotify {
                            events.publish(TerminalEvent::ServicesReady);
                        }
                        next = Some(subscribe(peripheral, characteristic, value).await);
                    }
                    SessionAction::Ready(session) => {
                        let Some(stream) = notifications.take() else {
                            abort(peripheral, machine).await;
                            return Err(TerminalError::InvalidState {
                                state: "ready without a notification stream".to_string(),
                            });
                        };
                        *self.active.lock().await = Some(peripheral.clone());
                        info!("Successfully connected to {}", session.peer);
                        events.publish(TerminalEvent::SessionReady(session.clone()));
                        return Ok((session, stream));
                    }
                    SessionAction::Fail(failure) => {
                        events.publish(TerminalEvent::SessionFailed(failure.clone()));
                        abort(peripheral, machine).await;
                        return Err(failure.into());
                    }
                    SessionAction::Release => return Err(TerminalError::Disconnected),
                }
            }
        }

        Err(TerminalError::InvalidState {
            state: machine.state().to_string(),
        })
    }

    /// Disconnect `peripheral` and forget it as the active connection
    ///
    /// # Errors
    ///
    /// Returns [`TerminalError::Ble`] if disconnection fails.
    pub async fn disconnect(&self, peripheral: &Peripheral) -> Result<()> {
        let mut active = self.active.lock().await;
        if active.as_ref().is_some_and(|p| p.id() == peripheral.id()) {
            *active = None;
        }
        drop(active);

        peripheral.disconnect().await?;
        Ok(())
    }

    async fn release_other(&self, peripheral: &Peripheral) {
        let previous = self.active.lock().await.take();
        if let Some(previous) = previous.filter(|p| p.id() != peripheral.id()) {
            info!("Closing previous connection to {}", previous.address());
            if let Err(e) = previous.disconnect().await {
                warn!("Failed to disconnect previous peripheral: {}", e);
            }
        }
    }
}

/// Tear the link down and return `machine` to [`SessionState::Disconnected`]
async fn abort(peripheral: &Peripheral, machine: &mut SessionStateMachine) {
    if let Err(e) = peripheral.disconnect().await {
        debug!("Disconnect after failure: {}", e);
    }
    machine.handle(GattEvent::Disconnected);
}

async fn connect(peripheral: &Peripheral, connect_timeout: Duration) -> GattEvent {
    match timeout(connect_timeout, peripheral.connect()).await {
        Ok(Ok(())) => GattEvent::Connected,
        Ok(Err(e)) => GattEvent::ConnectionFailed(e.to_string()),
        Err(_) => GattEvent::ConnectionFailed(
            TerminalError::Timeout {
                timeout_ms: u64::try_from(connect_timeout.as_millis()).unwrap_or(u64::MAX),
            }
            .to_string(),
        ),
    }
}

async fn discover(peripheral: &Peripheral) -> GattEvent {
    if let Err(e) = peripheral.discover_services().await {
        warn!("Service discovery failed: {}", e);
        return GattEvent::ServicesDiscovered {
            status: GATT_ERROR,
            services: Vec::new(),
        };
    }

    let services = peripheral
        .services()
        .iter()
        .map(|service| ServiceInfo {
            uuid: service.uuid,
            characteristics: service.characteristics.iter().map(|c| c.uuid).collect(),
        })
        .collect();

    GattEvent::ServicesDiscovered {
        status: GATT_SUCCESS,
        services,
    }
}

/// Enable delivery on `characteristic`
///
/// btleplug writes the CCCD itself, picking notification or indication from the
/// characteristic properties, so `value` is only reported.
async fn subscribe(
    peripheral: &Peripheral,
    characteristic: Uuid,
    value: DescriptorValue,
) -> GattEvent {
    debug!(
        "Writing CCCD {:02X?} for {}",
        value.bytes(),
        characteristic
    );

    let status = match find_characteristic(peripheral, characteristic) {
        Some(handle) => match peripheral.subscribe(&handle).await {
            Ok(()) => GATT_SUCCESS,
            Err(e) => {
                warn!("Subscribe to {} failed: {}", characteristic, e);
                GATT_ERROR
            }
        },
        None => GATT_ERROR,
    };

    GattEvent::DescriptorWriteComplete {
        characteristic,
        status,
    }
}

fn find_characteristic(peripheral: &Peripheral, uuid: Uuid) -> Option<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
}

/// Build a scan report from btleplug's parsed advertisement properties
#[must_use]
pub fn scan_report(properties: &PeripheralProperties) -> ScanReport {
    ScanReport {
        name: properties.local_name.clone(),
        address: properties.address.to_string(),
        rssi: properties.rssi.unwrap_or(0),
        raw: reassemble_advertisement(&properties.manufacturer_data),
        manufacturer_data: properties.manufacturer_data.clone(),
    }
}

/// Rebuild a raw advertisement payload from parsed manufacturer data
///
/// The payload starts with a general-discoverable flags structure followed by one
/// manufacturer-specific structure per company identifier, in ascending order. A
/// proximity beacon therefore comes out in its on-air 30-byte layout.
#[must_use]
pub fn reassemble_advertisement(manufacturer_data: &HashMap<u16, Vec<u8>>) -> Vec<u8> {
    let mut company_ids: Vec<u16> = manufacturer_data.keys().copied().collect();
    company_ids.sort_unstable();

    let mut raw = FLAGS_AD.to_vec();
    for company_id in company_ids {
        let data = &manufacturer_data[&company_id];
        let Ok(length) = u8::try_from(data.len() + 3) else {
            debug!("Manufacturer data for {:04X} too long, skipped", company_id);
            continue;
        };
        raw.push(length);
        raw.push(MANUFACTURER_AD_TYPE);
        raw.extend_from_slice(&company_id.to_le_bytes());
        raw.extend_from_slice(data);
    }
    raw
}

/// [`GattLink`] backed by a connected btleplug peripheral
pub struct PeripheralLink {
    peripheral: Peripheral,
    characteristics: HashMap<Uuid, Characteristic>,
}

impl PeripheralLink {
    /// Wrap a peripheral whose services have been discovered
    #[must_use]
    pub fn new(peripheral: Peripheral) -> Self {
        let characteristics = peripheral
            .characteristics()
            .into_iter()
            .map(|c| (c.uuid, c))
            .collect();
        Self {
            peripheral,
            characteristics,
        }
    }
}

#[async_trait]
impl GattLink for PeripheralLink {
    async fn write(&self, characteristic: Uuid, packet: &[u8]) -> Result<()> {
        let handle = self
            .characteristics
            .get(&characteristic)
            .ok_or_else(|| TerminalError::MissingCapability(characteristic.to_string()))?;

        self.peripheral
            .write(handle, packet, WriteType::WithoutResponse)
            .await?;
        Ok(())
    }
}

/// Forward notifications as [`GattEvent::CharacteristicChanged`]
///
/// Returns when the notification stream ends or the receiver is dropped.
pub async fn handle_notifications<S>(
    mut notifications: S,
    sender: mpsc::UnboundedSender<GattEvent>,
) where
    S: Stream<Item = ValueNotification> + Unpin,
{
    while let Some(data) = notifications.next().await {
        let event = GattEvent::CharacteristicChanged {
            characteristic: data.uuid,
            value: data.value,
        };
        if sender.send(event).is_err() {
            break;
        }
    }
    debug!("Notification stream ended");
}

/// Emit [`GattEvent::Disconnected`] once the adapter reports `id` disconnected
///
/// # Errors
///
/// Returns [`TerminalError::Ble`] if the adapter event stream cannot be opened.
pub async fn watch_disconnect(
    adapter: Adapter,
    id: PeripheralId,
    sender: mpsc::UnboundedSender<GattEvent>,
) -> Result<()> {
    let mut events = adapter.events().await?;

    while let Some(event) = events.next().await {
        if let CentralEvent::DeviceDisconnected(disconnected) = event {
            if disconnected == id {
                info!("Peripheral {:?} disconnected", id);
                let _ = sender.send(GattEvent::Disconnected);
                break;
            }
        }
    }

    Ok(())
}
