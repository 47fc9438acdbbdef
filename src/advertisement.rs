use std::collections::HashMap;

use crate::types::DeviceClass;

/// Fixed prefix of a proximity beacon advertisement
///
/// Flags AD structure (`02 01 06`), then a 0x1A-byte manufacturer-specific AD
/// structure whose data starts with the beacon type `02 15`.
pub const PROXIMITY_BEACON_PREFIX: [u8; 9] = [0x02, 0x01, 0x06, 0x1A, 0xFF, 0x4C, 0x00, 0x02, 0x15];

/// Prefix positions holding the company identifier; any vendor is accepted there
const COMPANY_ID_POSITIONS: [usize; 2] = [5, 6];

/// Exact manufacturer data length of a legacy sensor beacon
pub const LEGACY_BEACON_LEN: usize = 24;

/// Outcome of classifying one advertisement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Connectable device, no beacon payload
    Plain,
    /// Legacy sensor beacon with its 24-byte manufacturer data
    LegacyBeacon(Vec<u8>),
    /// Proximity beacon with the full raw advertisement
    ProximityBeacon(Vec<u8>),
}

impl Classification {
    /// Device class of this classification
    #[must_use]
    pub const fn class(&self) -> DeviceClass {
        match self {
            Self::Plain => DeviceClass::Plain,
            Self::LegacyBeacon(_) => DeviceClass::LegacyBeacon,
            Self::ProximityBeacon(_) => DeviceClass::ProximityBeacon,
        }
    }

    /// Beacon sub-payload, if any
    #[must_use]
    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            Self::Plain => None,
            Self::LegacyBeacon(payload) | Self::ProximityBeacon(payload) => Some(payload),
        }
    }

    /// Consume into class and sub-payload
    #[must_use]
    pub fn into_parts(self) -> (DeviceClass, Option<Vec<u8>>) {
        let class = self.class();
        match self {
            Self::Plain => (class, None),
            Self::LegacyBeacon(payload) | Self::ProximityBeacon(payload) => (class, Some(payload)),
        }
    }
}

/// Sorts raw advertisements into device classes
///
/// Pure function of the advertisement bytes, the manufacturer data lookup and the
/// configured company identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvertisementClassifier {
    company_id: u16,
}

impl AdvertisementClassifier {
    /// Create a classifier that recognises legacy beacons tagged with `company_id`
    #[must_use]
    pub const fn new(company_id: u16) -> Self {
        Self { company_id }
    }

    /// Company identifier used for the legacy beacon test
    #[must_use]
    pub const fn company_id(&self) -> u16 {
        self.company_id
    }

    /// Classify an advertisement
    ///
    /// The proximity beacon test runs first; the legacy beacon test only runs if it
    /// fails. Short or malformed payloads classify as [`Classification::Plain`].
    #[must_use]
    pub fn classify(
        &self,
        raw: &[u8],
        manufacturer_data: &HashMap<u16, Vec<u8>>,
    ) -> Classification {
        if is_proximity_beacon(raw) {
            return Classification::ProximityBeacon(raw.to_vec());
        }

        match manufacturer_data.get(&self.company_id) {
            Some(data) if data.len() == LEGACY_BEACON_LEN => {
                Classification::LegacyBeacon(data.clone())
            }
            _ => Classification::Plain,
        }
    }
}

/// Check the proximity beacon prefix, skipping the company identifier bytes
#[must_use]
pub fn is_proximity_beacon(raw: &[u8]) -> bool {
    if raw.len() < PROXIMITY_BEACON_PREFIX.len() {
        return false;
    }

    PROXIMITY_BEACON_PREFIX
        .iter()
        .zip(raw)
        .enumerate()
        .filter(|(i, _)| !COMPANY_ID_POSITIONS.contains(i))
        .all(|(_, (expected, actual))| expected == actual)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proximity_advertisement() -> Vec<u8> {
        let mut raw = PROXIMITY_BEACON_PREFIX.to_vec();
        raw.extend((0..16).map(|i| i * 0x11));
        raw.extend_from_slice(&[0x00, 0x01, 0x00, 0x02, 0xC5]);
        raw
    }

    #[test]
    fn test_proximity_beacon_any_vendor() {
        let classifier = AdvertisementClassifier::new(0x0059);
        let empty = HashMap::new();

        for (lo, hi) in [(0x4C, 0x00), (0x00, 0x00), (0xFF, 0xFF), (0x59, 0x12)] {
            let mut raw = proximity_advertisement();
            raw[5] = lo;
            raw[6] = hi;
            let result = classifier.classify(&raw, &empty);
            assert_eq!(result.class(), DeviceClass::ProximityBeacon);
            assert_eq!(result.payload(), Some(raw.as_slice()));
        }
    }

    #[test]
    fn test_prefix_mismatch_outside_company_id() {
        let classifier = AdvertisementClassifier::new(0);
        let empty = HashMap::new();

        for index in [0, 1, 2, 3, 4, 7, 8] {
            let mut raw = proximity_advertisement();
            raw[index] ^= 0xFF;
            assert_eq!(classifier.classify(&raw, &empty), Classification::Plain);
        }
    }

    #[test]
    fn test_short_payloads_are_plain() {
        let classifier = AdvertisementClassifier::new(0);
        let empty = HashMap::new();

        for len in 0..PROXIMITY_BEACON_PREFIX.len() {
            let raw = &PROXIMITY_BEACON_PREFIX[..len];
            assert_eq!(classifier.classify(raw, &empty), Classification::Plain);
        }
    }

    #[test]
    fn test_legacy_beacon_requires_exact_length() {
        let classifier = AdvertisementClassifier::new(0x0059);
        let raw = [0x02, 0x01, 0x06];

        let mut manufacturer_data = HashMap::new();
        manufacturer_data.insert(0x0059, vec![7u8; LEGACY_BEACON_LEN]);
        let result = classifier.classify(&raw, &manufacturer_data);
        assert_eq!(result, Classification::LegacyBeacon(vec![7u8; LEGACY_BEACON_LEN]));

        manufacturer_data.insert(0x0059, vec![7u8; LEGACY_BEACON_LEN - 1]);
        assert_eq!(
            classifier.classify(&raw, &manufacturer_data),
            Classification::Plain
        );

        manufacturer_data.insert(0x0059, vec![7u8; LEGACY_BEACON_LEN + 1]);
        assert_eq!(
            classifier.classify(&raw, &manufacturer_data),
            Classification::Plain
        );
    }

    #[test]
    fn test_legacy_beacon_other_company_is_plain() {
        let classifier = AdvertisementClassifier::new(0x0059);
        let mut manufacturer_data = HashMap::new();
        manufacturer_data.insert(0x004C, vec![0u8; LEGACY_BEACON_LEN]);

        assert_eq!(
            classifier.classify(&[], &manufacturer_data),
            Classification::Plain
        );
    }

    #[test]
    fn test_proximity_wins_over_legacy() {
        let classifier = AdvertisementClassifier::new(0x004C);
        let raw = proximity_advertisement();
        let mut manufacturer_data = HashMap::new();
        manufacturer_data.insert(0x004C, vec![0u8; LEGACY_BEACON_LEN]);

        let (class, payload) = classifier.classify(&raw, &manufacturer_data).into_parts();
        assert_eq!(class, DeviceClass::ProximityBeacon);
        assert_eq!(payload, Some(raw));
    }
}
