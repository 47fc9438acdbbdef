use std::{collections::HashMap, time::SystemTime};
use tracing::debug;

use crate::{
    advertisement::{AdvertisementClassifier, Classification},
    beacon,
    types::{BeaconRecord, DeviceClass, DeviceIdentity, DiscoveredDevice},
};

/// One advertisement report from the scanner
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    /// Advertised local name; reports without a name are ignored
    pub name: Option<String>,
    /// Platform address
    pub address: String,
    /// Signal strength in dBm
    pub rssi: i16,
    /// Raw advertisement payload
    pub raw: Vec<u8>,
    /// Manufacturer-specific data keyed by company identifier
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
}

/// Deduplicated view of everything seen while scanning
///
/// Connectable devices and beacons live in two independent collections, each kept
/// in first-seen order. Entries are matched by name and address.
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    classifier: AdvertisementClassifier,
    devices: Vec<DiscoveredDevice>,
    beacons: Vec<BeaconRecord>,
}

impl DeviceRegistry {
    /// Create an empty registry using `classifier` for incoming reports
    #[must_use]
    pub const fn new(classifier: AdvertisementClassifier) -> Self {
        Self {
            classifier,
            devices: Vec::new(),
            beacons: Vec::new(),
        }
    }

    /// Classify a scan report and record it
    ///
    /// Returns the classification, or `None` when the report has no name or its
    /// beacon payload does not decode. Undecodable beacons are not recorded.
    pub fn observe(&mut self, report: &ScanReport) -> Option<DeviceClass> {
        let name = report.name.as_ref()?;
        let identity = DeviceIdentity::new(name.clone(), report.address.clone());

        let classification = self
            .classifier
            .classify(&report.raw, &report.manufacturer_data);
        let class = classification.class();

        match classification {
            Classification::Plain => {
                self.upsert_device(identity, report.rssi);
            }
            Classification::LegacyBeacon(payload) | Classification::ProximityBeacon(payload) => {
                if let Err(e) = beacon::decode(class, &payload) {
                    debug!("Skipping {} from {}: {}", class, identity, e);
                    return None;
                }
                self.upsert_beacon(identity, class, payload, report.rssi);
            }
        }

        Some(class)
    }

    /// Insert a connectable device or refresh its signal strength
    pub fn upsert_device(&mut self, identity: DeviceIdentity, rssi: i16) {
        if let Some(device) = self.devices.iter_mut().find(|d| d.identity == identity) {
            device.rssi = rssi;
            return;
        }

        debug!("New device: {}", identity);
        self.devices.push(DiscoveredDevice::new(identity, rssi));
    }

    /// Insert a beacon or refresh its payload, signal strength and timestamp
    pub fn upsert_beacon(
        &mut self,
        identity: DeviceIdentity,
        class: DeviceClass,
        payload: Vec<u8>,
        rssi: i16,
    ) {
        let now = SystemTime::now();

        if let Some(beacon) = self.beacons.iter_mut().find(|b| b.identity == identity) {
            beacon.payload = payload;
            beacon.rssi = rssi;
            beacon.last_seen = now;
            return;
        }

        debug!("New {}: {}", class, identity);
        self.beacons.push(BeaconRecord {
            identity,
            class,
            payload,
            rssi,
            last_seen: now,
        });
    }

    /// Connectable devices in first-seen order
    #[must_use]
    pub fn devices(&self) -> &[DiscoveredDevice] {
        &self.devices
    }

    /// Beacons in first-seen order
    #[must_use]
    pub fn beacons(&self) -> &[BeaconRecord] {
        &self.beacons
    }

    /// Look up a connectable device by address
    #[must_use]
    pub fn device_by_address(&self, address: &str) -> Option<&DiscoveredDevice> {
        self.devices.iter().find(|d| d.identity.address == address)
    }

    /// Drop the connectable devices of a finished scan session
    ///
    /// Beacons are kept.
    pub fn end_scan(&mut self) {
        self.devices.clear();
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new(AdvertisementClassifier::new(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advertisement::{LEGACY_BEACON_LEN, PROXIMITY_BEACON_PREFIX};

    fn report(name: Option<&str>, address: &str, rssi: i16) -> ScanReport {
        ScanReport {
            name: name.map(str::to_string),
            address: address.to_string(),
            rssi,
            ..Default::default()
        }
    }

    #[test]
    fn test_device_upsert_updates_in_place() {
        let mut registry = DeviceRegistry::default();
        registry.observe(&report(Some("Term"), "AA", -70));
        registry.observe(&report(Some("Other"), "BB", -50));
        registry.observe(&report(Some("Term"), "AA", -40));

        let devices = registry.devices();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].identity.name, "Term");
        assert_eq!(devices[0].rssi, -40);
        assert_eq!(devices[1].identity.address, "BB");
    }

    #[test]
    fn test_nameless_reports_ignored() {
        let mut registry = DeviceRegistry::default();
        assert_eq!(registry.observe(&report(None, "AA", -70)), None);
        assert!(registry.devices().is_empty());
        assert!(registry.beacons().is_empty());
    }

    #[test]
    fn test_same_address_different_name_is_new_entry() {
        let mut registry = DeviceRegistry::default();
        registry.upsert_device(DeviceIdentity::new("A", "AA"), -70);
        registry.upsert_device(DeviceIdentity::new("B", "AA"), -70);
        assert_eq!(registry.devices().len(), 2);
    }

    #[test]
    fn test_beacon_upsert_refreshes_payload() {
        let mut registry = DeviceRegistry::new(AdvertisementClassifier::new(0x0059));

        let mut first = report(Some("Sensor"), "CC", -80);
        first
            .manufacturer_data
            .insert(0x0059, vec![1u8; LEGACY_BEACON_LEN]);
        assert_eq!(registry.observe(&first), Some(DeviceClass::LegacyBeacon));
        let first_seen = registry.beacons()[0].last_seen;

        let mut second = report(Some("Sensor"), "CC", -60);
        second
            .manufacturer_data
            .insert(0x0059, vec![2u8; LEGACY_BEACON_LEN]);
        registry.observe(&second);

        let beacons = registry.beacons();
        assert_eq!(beacons.len(), 1);
        assert_eq!(beacons[0].payload, vec![2u8; LEGACY_BEACON_LEN]);
        assert_eq!(beacons[0].rssi, -60);
        assert!(beacons[0].last_seen >= first_seen);
        assert!(registry.devices().is_empty());
    }

    #[test]
    fn test_proximity_beacon_routed_to_beacons() {
        let mut registry = DeviceRegistry::default();
        let mut beacon = report(Some("Tag"), "DD", -55);
        beacon.raw = PROXIMITY_BEACON_PREFIX.to_vec();
        beacon.raw.extend_from_slice(&[0u8; 21]);

        assert_eq!(registry.observe(&beacon), Some(DeviceClass::ProximityBeacon));
        assert_eq!(registry.beacons()[0].payload.len(), 30);
        assert!(registry.beacons()[0].decode().is_ok());
    }

    #[test]
    fn test_truncated_proximity_beacon_not_recorded() {
        let mut registry = DeviceRegistry::default();
        let mut beacon = report(Some("Tag"), "DD", -55);
        beacon.raw = PROXIMITY_BEACON_PREFIX.to_vec();

        assert_eq!(registry.observe(&beacon), None);
        assert!(registry.beacons().is_empty());
        assert!(registry.devices().is_empty());
    }

    #[test]
    fn test_end_scan_keeps_beacons() {
        let mut registry = DeviceRegistry::default();
        registry.upsert_device(DeviceIdentity::new("Term", "AA"), -70);
        registry.upsert_beacon(
            DeviceIdentity::new("Tag", "DD"),
            DeviceClass::LegacyBeacon,
            vec![0; LEGACY_BEACON_LEN],
            -70,
        );

        assert!(registry.device_by_address("AA").is_some());
        registry.end_scan();
        assert!(registry.devices().is_empty());
        assert_eq!(registry.beacons().len(), 1);
    }
}
