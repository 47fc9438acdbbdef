use bytes::Buf;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Write as _};

use crate::{
    advertisement::LEGACY_BEACON_LEN,
    error::{Result, TerminalError},
    types::{BeaconRecord, DeviceClass},
};

/// Minimum advertisement length holding a complete proximity beacon
pub const PROXIMITY_BEACON_LEN: usize = 30;

/// Offset of the proximity UUID inside the raw advertisement
const PROXIMITY_UUID_OFFSET: usize = 9;

/// Decoded proximity beacon
///
/// Layout of the raw advertisement (0-indexed):
/// - Bytes 9-24: proximity UUID
/// - Bytes 25-26: major (big-endian)
/// - Bytes 27-28: minor (big-endian)
/// - Byte 29: measured power at 1 m (signed dBm)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProximityBeacon {
    /// Proximity UUID as lowercase hex without separators
    pub proximity_uuid: String,
    /// Major group identifier
    pub major: u16,
    /// Minor identifier
    pub minor: u16,
    /// Calibrated signal strength at one metre
    pub measured_power: i8,
}

impl ProximityBeacon {
    /// Decode from the full raw advertisement
    ///
    /// # Errors
    ///
    /// Returns [`TerminalError::Decode`] if the advertisement is shorter than
    /// [`PROXIMITY_BEACON_LEN`] bytes.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < PROXIMITY_BEACON_LEN {
            return Err(TerminalError::Decode {
                expected: PROXIMITY_BEACON_LEN,
                actual: raw.len(),
            });
        }

        let mut buf = &raw[PROXIMITY_UUID_OFFSET..PROXIMITY_BEACON_LEN];

        let mut uuid = [0u8; 16];
        buf.copy_to_slice(&mut uuid);
        let proximity_uuid = uuid.iter().fold(String::with_capacity(32), |mut s, b| {
            let _ = write!(s, "{b:02x}");
            s
        });

        let major = buf.get_u16();
        let minor = buf.get_u16();
        let measured_power = buf.get_i8();

        Ok(Self {
            proximity_uuid,
            major,
            minor,
            measured_power,
        })
    }
}

impl fmt::Display for ProximityBeacon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Proximity UUID: {} Major: {} Minor: {} Measured power: {}",
            self.proximity_uuid, self.major, self.minor, self.measured_power
        )
    }
}

/// Decoded legacy sensor beacon
///
/// 24-byte manufacturer data, multi-byte fields little-endian signed:
/// - Byte 0: type id
/// - Bytes 1-2: sequence number
/// - Bytes 3-4: temperature (hundredths of °C)
/// - Bytes 5-6: humidity
/// - Bytes 7-8: light
/// - Bytes 9-10: CO2
/// - Bytes 11-12: air quality
/// - Bytes 13-14: sound level
/// - Bytes 15-20: accelerometer X, Y, Z (hundredths)
/// - Bytes 21-22: electric field
/// - Byte 23: tx power
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorBeacon {
    /// Beacon type id
    pub type_id: i8,
    /// Sequence number
    pub sequence: i16,
    /// Raw temperature, hundredths of a degree
    pub temperature_raw: i16,
    /// Humidity
    pub humidity: i16,
    /// Light level
    pub light: i16,
    /// CO2 level
    pub co2: i16,
    /// Air quality index
    pub air_quality: i16,
    /// Sound level
    pub sound: i16,
    /// Raw accelerometer X, Y, Z in hundredths
    pub acceleration_raw: [i16; 3],
    /// Electric field reading
    pub electric_field: i16,
    /// Transmit power
    pub tx_power: i8,
}

impl SensorBeacon {
    /// Decode from the 24-byte manufacturer data
    ///
    /// # Errors
    ///
    /// Returns [`TerminalError::Decode`] unless the payload is exactly
    /// [`LEGACY_BEACON_LEN`] bytes.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() != LEGACY_BEACON_LEN {
            return Err(TerminalError::Decode {
                expected: LEGACY_BEACON_LEN,
                actual: payload.len(),
            });
        }

        let mut buf = payload;

        Ok(Self {
            type_id: buf.get_i8(),
            sequence: buf.get_i16_le(),
            temperature_raw: buf.get_i16_le(),
            humidity: buf.get_i16_le(),
            light: buf.get_i16_le(),
            co2: buf.get_i16_le(),
            air_quality: buf.get_i16_le(),
            sound: buf.get_i16_le(),
            acceleration_raw: [buf.get_i16_le(), buf.get_i16_le(), buf.get_i16_le()],
            electric_field: buf.get_i16_le(),
            tx_power: buf.get_i8(),
        })
    }

    /// Temperature in °C
    #[must_use]
    pub fn temperature_celsius(&self) -> f32 {
        f32::from(self.temperature_raw) / 100.0
    }

    /// Acceleration on X, Y and Z
    #[must_use]
    pub fn acceleration(&self) -> [f32; 3] {
        self.acceleration_raw.map(|axis| f32::from(axis) / 100.0)
    }
}

impl fmt::Display for SensorBeacon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [x, y, z] = self.acceleration();
        write!(
            f,
            "#{} temp {:.2} hum {} light {} co2 {} air {} sound {} acc {:.2}/{:.2}/{:.2} electric {}",
            self.sequence,
            self.temperature_celsius(),
            self.humidity,
            self.light,
            self.co2,
            self.air_quality,
            self.sound,
            x,
            y,
            z,
            self.electric_field
        )
    }
}

/// Decoded beacon of either class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BeaconData {
    /// iBeacon-style proximity beacon
    Proximity(ProximityBeacon),
    /// Legacy sensor beacon
    Sensor(SensorBeacon),
}

/// Decode a classified sub-payload
///
/// # Errors
///
/// Returns [`TerminalError::Decode`] on a length mismatch, or
/// [`TerminalError::InvalidState`] for [`DeviceClass::Plain`], which carries no payload.
pub fn decode(class: DeviceClass, payload: &[u8]) -> Result<BeaconData> {
    match class {
        DeviceClass::ProximityBeacon => ProximityBeacon::decode(payload).map(BeaconData::Proximity),
        DeviceClass::LegacyBeacon => SensorBeacon::decode(payload).map(BeaconData::Sensor),
        DeviceClass::Plain => Err(TerminalError::InvalidState {
            state: "plain device has no beacon payload".to_string(),
        }),
    }
}

impl BeaconRecord {
    /// Decode the stored sub-payload according to the record's class
    ///
    /// # Errors
    ///
    /// See [`decode`].
    pub fn decode(&self) -> Result<BeaconData> {
        decode(self.class, &self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advertisement::PROXIMITY_BEACON_PREFIX;
    use tokio_test::{assert_err, assert_ok};

    fn proximity_advertisement() -> Vec<u8> {
        let mut raw = PROXIMITY_BEACON_PREFIX.to_vec();
        raw.extend_from_slice(&[
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB, 0xCC, 0xDD,
            0xEE, 0xFF,
        ]);
        raw.extend_from_slice(&[0x01, 0x02, 0x00, 0x2A, 0xC5]);
        raw
    }

    fn sensor_payload() -> Vec<u8> {
        let mut payload = vec![0u8; LEGACY_BEACON_LEN];
        payload[0] = 0x03;
        payload[1..3].copy_from_slice(&7i16.to_le_bytes());
        payload[3..5].copy_from_slice(&0x0834i16.to_le_bytes());
        payload[5..7].copy_from_slice(&45i16.to_le_bytes());
        payload[7..9].copy_from_slice(&300i16.to_le_bytes());
        payload[9..11].copy_from_slice(&410i16.to_le_bytes());
        payload[11..13].copy_from_slice(&12i16.to_le_bytes());
        payload[13..15].copy_from_slice(&55i16.to_le_bytes());
        payload[15..17].copy_from_slice(&(-98i16).to_le_bytes());
        payload[17..19].copy_from_slice(&3i16.to_le_bytes());
        payload[19..21].copy_from_slice(&981i16.to_le_bytes());
        payload[21..23].copy_from_slice(&(-2i16).to_le_bytes());
        payload[23] = 0xF4;
        payload
    }

    #[test]
    fn test_proximity_decode() {
        let beacon = assert_ok!(ProximityBeacon::decode(&proximity_advertisement()));
        assert_eq!(beacon.proximity_uuid, "00112233445566778899aabbccddeeff");
        assert_eq!(beacon.major, 0x0102);
        assert_eq!(beacon.minor, 42);
        assert_eq!(beacon.measured_power, -59);
    }

    #[test]
    fn test_proximity_decode_too_short() {
        let raw = proximity_advertisement();
        let error = assert_err!(ProximityBeacon::decode(&raw[..29]));
        assert!(matches!(
            error,
            TerminalError::Decode {
                expected: 30,
                actual: 29
            }
        ));
    }

    #[test]
    fn test_sensor_decode_fields() {
        let beacon = assert_ok!(SensorBeacon::decode(&sensor_payload()));
        assert_eq!(beacon.type_id, 3);
        assert_eq!(beacon.sequence, 7);
        assert_eq!(beacon.temperature_raw, 2100);
        assert!((beacon.temperature_celsius() - 21.0).abs() < f32::EPSILON);
        assert_eq!(beacon.humidity, 45);
        assert_eq!(beacon.light, 300);
        assert_eq!(beacon.co2, 410);
        assert_eq!(beacon.air_quality, 12);
        assert_eq!(beacon.sound, 55);
        assert_eq!(beacon.acceleration_raw, [-98, 3, 981]);
        assert_eq!(beacon.electric_field, -2);
        assert_eq!(beacon.tx_power, -12);

        let [x, _, z] = beacon.acceleration();
        assert!((x + 0.98).abs() < 0.001);
        assert!((z - 9.81).abs() < 0.001);
    }

    #[test]
    fn test_sensor_display_precision() {
        let beacon = SensorBeacon::decode(&sensor_payload()).unwrap();
        let rendered = beacon.to_string();
        assert!(rendered.contains("temp 21.00"));
        assert!(rendered.contains("acc -0.98/0.03/9.81"));
    }

    #[test]
    fn test_sensor_decode_length_mismatch() {
        let mut payload = sensor_payload();
        payload.push(0);
        assert_err!(SensorBeacon::decode(&payload));
        assert_err!(SensorBeacon::decode(&payload[..20]));
    }

    #[test]
    fn test_decode_dispatch() {
        let proximity = decode(DeviceClass::ProximityBeacon, &proximity_advertisement());
        assert!(matches!(proximity, Ok(BeaconData::Proximity(_))));

        let sensor = decode(DeviceClass::LegacyBeacon, &sensor_payload());
        assert!(matches!(sensor, Ok(BeaconData::Sensor(_))));

        assert_err!(decode(DeviceClass::Plain, &[]));
    }
}
