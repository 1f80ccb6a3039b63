use crate::domain::error::{MalformedSighting, ScanStartError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Stable handle of an advertising device.
///
/// Opaque bytes; platforms that identify devices by MAC address use the
/// textual `AA:BB:CC:DD:EE:FF` form (see [`DeviceIdentity::from_mac`]).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceIdentity(Vec<u8>);

impl DeviceIdentity {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Canonical identity for a 48-bit Bluetooth address.
    pub fn from_mac(address: u64) -> Self {
        let octets = address.to_be_bytes();
        let text = octets[2..]
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":");
        Self(text.into_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for DeviceIdentity {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<String> for DeviceIdentity {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(text) if text.chars().all(|c| c.is_ascii_graphic()) => f.write_str(text),
            _ => {
                for b in &self.0 {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceIdentity({})", self)
    }
}

/// One normalized sighting of an advertising device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementRecord {
    device: DeviceIdentity,
    rssi: i16,
    payload: Vec<u8>,
    observed_at: Instant,
}

impl AdvertisementRecord {
    pub fn new(
        device: DeviceIdentity,
        rssi: i16,
        payload: Vec<u8>,
        observed_at: Instant,
    ) -> Result<Self, MalformedSighting> {
        if device.is_empty() {
            return Err(MalformedSighting::EmptyIdentity);
        }
        Ok(Self {
            device,
            rssi,
            payload,
            observed_at,
        })
    }

    pub fn device(&self) -> &DeviceIdentity {
        &self.device
    }

    pub fn rssi(&self) -> i16 {
        self.rssi
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn observed_at(&self) -> Instant {
        self.observed_at
    }
}

/// Scan duty cycle requested by an observer.
///
/// Ordered so that the strongest demand is the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanIntensity {
    /// No scanning wanted.
    #[serde(rename = "NONE")]
    Off,
    /// Highest latency, lowest power.
    LowPower,
    /// Lowest latency, highest power.
    Active,
}

/// Identifier of a registered observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObserverId(pub u64);

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Region transition produced by the presence tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceTransition {
    Enter(AdvertisementRecord),
    Exit(DeviceIdentity),
}

impl PresenceTransition {
    pub fn device(&self) -> &DeviceIdentity {
        match self {
            Self::Enter(record) => record.device(),
            Self::Exit(device) => device,
        }
    }
}

/// Event delivered to every registered observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    ScanStarted { intensity: ScanIntensity },
    ScanStopped,
    EnterRegion(AdvertisementRecord),
    LeaveRegion(DeviceIdentity),
    ScanFailed(ScanStartError),
}

impl From<PresenceTransition> for ServiceEvent {
    fn from(transition: PresenceTransition) -> Self {
        match transition {
            PresenceTransition::Enter(record) => Self::EnterRegion(record),
            PresenceTransition::Exit(device) => Self::LeaveRegion(device),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_identity_is_malformed() {
        let result = AdvertisementRecord::new(DeviceIdentity::new(Vec::new()), -60, vec![], Instant::now());
        assert_eq!(result, Err(MalformedSighting::EmptyIdentity));
    }

    #[test]
    fn test_identity_from_mac() {
        let id = DeviceIdentity::from_mac(0x0000_AABB_CCDD_EE0F);
        assert_eq!(id.to_string(), "AA:BB:CC:DD:EE:0F");
    }

    #[test]
    fn test_binary_identity_displays_as_hex() {
        let id = DeviceIdentity::new(vec![0x00, 0xfe]);
        assert_eq!(id.to_string(), "00fe");
    }

    #[test]
    fn test_intensity_ordering() {
        assert!(ScanIntensity::Active > ScanIntensity::LowPower);
        assert!(ScanIntensity::LowPower > ScanIntensity::Off);
        assert_eq!(serde_json::to_string(&ScanIntensity::Off).unwrap(), "\"NONE\"");
        assert_eq!(
            serde_json::to_string(&ScanIntensity::LowPower).unwrap(),
            "\"LOW_POWER\""
        );
    }
}
