//! Sensor Model
//!
//! This module defines the data exchanged with a wearable heart rate sensor:
//! - Bluetooth LE Heart Rate Service (HRS) measurement messages
//! - Samples forwarded to the recording pipeline
//! - Device telemetry and connection state

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Helper macro to check if a specific bit is set in a byte.
macro_rules! is_bit_set {
    ($byte:expr, $pos:expr) => {
        ($byte & (1 << $pos)) != 0
    };
}

/// Helper macro to extract a `u16` value in little-endian format from a byte slice.
macro_rules! get_u16_little_endian {
    ($slice:expr, $lsb:expr) => {
        (($slice[1 + $lsb] as u16) << 8) | $slice[$lsb] as u16
    };
}

/// Maximum number of RR values a single HRS notification can carry.
const MAX_RR_VALUES: usize = 9;

/// Represents a Bluetooth LE Heart Rate Service (HRS) measurement.
///
/// Parses and stores data from the Heart Rate Measurement characteristic including:
/// - Heart rate value (8 or 16 bit)
/// - RR intervals (raw, 1/1024 s resolution)
/// - Energy expenditure
/// - Sensor contact status
#[derive(Copy, Clone, Default, Deserialize, Serialize, Debug, PartialEq)]
pub struct HeartrateMessage {
    /// Flags indicating the presence of optional data and data encoding.
    flags: u8,
    /// Heart rate value in beats per minute (BPM).
    hr_value: u16,
    /// Energy expenditure in kilojoules (if present).
    energy_expended: u16,
    /// Raw RR interval values in 1/1024 s units.
    rr_values: [u16; MAX_RR_VALUES],
    /// Number of valid entries in `rr_values`.
    rr_count: u8,
}

impl HeartrateMessage {
    /// Parses a raw Heart Rate Measurement notification.
    ///
    /// Returns an error for payloads that are too short for the fields their flags announce.
    /// A trailing odd byte in the RR section is ignored.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 2 {
            return Err(anyhow!(
                "heart rate measurement too short: {} bytes",
                data.len()
            ));
        }

        let flags = data[0];
        let hr_value = if is_bit_set!(flags, 0) {
            if data.len() < 3 {
                return Err(anyhow!("16 bit heart rate announced but missing"));
            }
            get_u16_little_endian!(data, 1)
        } else {
            data[1] as u16
        };

        let mut result = HeartrateMessage {
            flags,
            hr_value,
            ..Default::default()
        };

        if result.has_energy_exp() {
            let offset = result.energy_exp_offset();
            if data.len() < offset + 2 {
                return Err(anyhow!("energy expenditure announced but missing"));
            }
            result.energy_expended = get_u16_little_endian!(data, offset);
        }

        if result.has_rr_interval() {
            let rr_offset = result.rr_offset().min(data.len());
            for (rr_store, chunk) in result
                .rr_values
                .iter_mut()
                .zip(data[rr_offset..].chunks_exact(2))
            {
                *rr_store = get_u16_little_endian!(chunk, 0);
                result.rr_count += 1;
            }
        }

        Ok(result)
    }

    /// Checks if the heart rate value uses 16-bit representation.
    pub fn has_long_hr(&self) -> bool {
        is_bit_set!(self.flags, 0)
    }

    /// Returns the heart rate value in beats per minute.
    pub fn get_hr(&self) -> u16 {
        self.hr_value
    }

    /// Checks if RR intervals are present.
    pub fn has_rr_interval(&self) -> bool {
        is_bit_set!(self.flags, 4)
    }

    /// Returns the RR intervals converted to milliseconds.
    pub fn get_rr_intervals_ms(&self) -> Vec<f64> {
        self.rr_values[..self.rr_count as usize]
            .iter()
            .map(|&raw| raw as f64 * 1000.0 / 1024.0)
            .collect()
    }

    /// Checks if energy expenditure data is available.
    pub fn has_energy_exp(&self) -> bool {
        is_bit_set!(self.flags, 3)
    }

    /// Returns the energy expenditure value in kilojoules.
    pub fn get_energy_exp(&self) -> f64 {
        self.energy_expended as f64
    }

    /// Checks if the sensor has contact with the user's body.
    pub fn sen_has_contact(&self) -> bool {
        is_bit_set!(self.flags, 1)
    }

    /// Checks if the sensor supports contact detection.
    pub fn sen_contact_supported(&self) -> bool {
        is_bit_set!(self.flags, 2)
    }

    fn energy_exp_offset(&self) -> usize {
        2 + (self.has_long_hr() as usize)
    }

    fn rr_offset(&self) -> usize {
        if self.has_energy_exp() {
            self.energy_exp_offset() + 2
        } else {
            self.energy_exp_offset()
        }
    }
}

impl fmt::Display for HeartrateMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HR {} bpm", self.hr_value)?;
        if self.has_rr_interval() {
            let rr = self
                .get_rr_intervals_ms()
                .iter()
                .map(|rr| format!("{:.1}", rr))
                .collect::<Vec<_>>()
                .join(", ");
            write!(f, ", RR [{}] ms", rr)?;
        }
        if self.sen_contact_supported() && !self.sen_has_contact() {
            write!(f, " (no contact)")?;
        }
        Ok(())
    }
}

/// One live sample forwarded from the sensor to the recording pipeline.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartrateSample {
    /// Heart rate in beats per minute.
    pub heart_rate: u16,
    /// RR intervals carried by the notification, in milliseconds.
    pub rr_intervals_ms: Vec<f64>,
}

impl From<&HeartrateMessage> for HeartrateSample {
    fn from(msg: &HeartrateMessage) -> Self {
        Self {
            heart_rate: msg.get_hr(),
            rr_intervals_ms: msg.get_rr_intervals_ms(),
        }
    }
}

/// Device metadata, replaced on every telemetry update.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorInfo {
    /// Display name of the device.
    pub name: String,
    /// Battery level in percent (0-100).
    pub battery_percent: Option<u8>,
    /// Received signal strength.
    pub signal_strength: Option<i16>,
}

/// Connection lifecycle of the single tracked sensor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorConnectionState {
    #[default]
    Disconnected,
    Scanning,
    Connecting,
    Connected,
    Failed,
}

impl SensorConnectionState {
    /// True while a connection attempt is under way or established.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Scanning | Self::Connecting | Self::Connected)
    }
}

impl fmt::Display for SensorConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Scanning => "scanning",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_8bit_hr_with_rr() {
        // flags: rr present, hr 80, rr 1024 (= 1000 ms)
        let msg = HeartrateMessage::parse(&[0b10000, 80, 0x00, 0x04]).unwrap();
        assert_eq!(msg.get_hr(), 80);
        assert!(msg.has_rr_interval());
        assert_eq!(msg.get_rr_intervals_ms(), vec![1000.0]);
    }

    #[test]
    fn test_parse_16bit_hr_energy_and_two_rr() {
        let data = [
            0b11001, // long hr, energy, rr
            0x2C, 0x01, // hr 300
            0x10, 0x00, // energy 16
            0x00, 0x02, // rr 512
            0x00, 0x04, // rr 1024
        ];
        let msg = HeartrateMessage::parse(&data).unwrap();
        assert_eq!(msg.get_hr(), 300);
        assert_eq!(msg.get_energy_exp(), 16.0);
        assert_eq!(msg.get_rr_intervals_ms(), vec![500.0, 1000.0]);
    }

    #[test]
    fn test_parse_without_rr_flag_ignores_trailing_bytes() {
        let msg = HeartrateMessage::parse(&[0, 72, 0x00, 0x04]).unwrap();
        assert!(msg.get_rr_intervals_ms().is_empty());
    }

    #[test]
    fn test_parse_rejects_short_payloads() {
        assert!(HeartrateMessage::parse(&[]).is_err());
        assert!(HeartrateMessage::parse(&[0b10000]).is_err());
        assert!(HeartrateMessage::parse(&[0b1, 80]).is_err());
        assert!(HeartrateMessage::parse(&[0b1000, 80, 1]).is_err());
    }

    #[test]
    fn test_odd_trailing_rr_byte_is_dropped() {
        let msg = HeartrateMessage::parse(&[0b10000, 60, 0x00, 0x04, 0x01]).unwrap();
        assert_eq!(msg.get_rr_intervals_ms().len(), 1);
    }

    #[test]
    fn test_sample_from_message() {
        let msg = HeartrateMessage::parse(&[0b10110, 65, 0x00, 0x04]).unwrap();
        let sample = HeartrateSample::from(&msg);
        assert_eq!(sample.heart_rate, 65);
        assert_eq!(sample.rr_intervals_ms, vec![1000.0]);
        assert!(msg.sen_has_contact());
    }

    #[test]
    fn test_busy_states() {
        assert!(SensorConnectionState::Scanning.is_busy());
        assert!(SensorConnectionState::Connected.is_busy());
        assert!(!SensorConnectionState::Failed.is_busy());
        assert!(!SensorConnectionState::Disconnected.is_busy());
    }
}
