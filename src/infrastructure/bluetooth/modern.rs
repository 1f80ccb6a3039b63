//! Modern filter/settings backend
//!
//! Modern platforms take native filter and settings objects, filter and
//! deduplicate in the controller, and report matches through first-match,
//! all-matches and match-lost callbacks.

use crate::domain::error::ScanStartError;
use crate::domain::models::{AdvertisementRecord, DeviceIdentity, ScanIntensity};
use crate::infrastructure::bluetooth::scanner::{
    sighting_channel, ScanBackend, ScanFilter, ScanHandle, ScanSlot, SightingStream,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Native filter object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlatformScanFilter {
    pub service_uuid: Option<String>,
    pub device: Option<DeviceIdentity>,
}

impl From<&ScanFilter> for PlatformScanFilter {
    fn from(filter: &ScanFilter) -> Self {
        Self {
            service_uuid: filter.service_uuid.clone(),
            device: filter.device.clone(),
        }
    }
}

/// Native duty-cycle setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformScanMode {
    LowPower,
    Balanced,
    LowLatency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackType {
    AllMatches,
    FirstMatch,
    MatchLost,
}

/// Native settings object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformScanSettings {
    pub scan_mode: PlatformScanMode,
    pub callback_type: CallbackType,
    /// Zero means immediate delivery.
    pub report_delay: Duration,
}

impl PlatformScanSettings {
    pub fn for_intensity(intensity: ScanIntensity) -> Self {
        let scan_mode = match intensity {
            ScanIntensity::Active => PlatformScanMode::LowLatency,
            ScanIntensity::LowPower | ScanIntensity::Off => PlatformScanMode::LowPower,
        };
        Self {
            scan_mode,
            callback_type: CallbackType::AllMatches,
            report_delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModernScanResult {
    pub device: DeviceIdentity,
    pub rssi: i16,
    pub payload: Vec<u8>,
    /// Platform receive time, when the platform reports one.
    pub timestamp: Option<Instant>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModernScanEvent {
    FirstMatch(ModernScanResult),
    AllMatches(ModernScanResult),
    MatchLost(ModernScanResult),
}

pub type ModernCallback = Arc<dyn Fn(ModernScanEvent) + Send + Sync>;

/// Native primitives of a modern scanning API.
pub trait ModernPlatform: Send {
    fn start_scan(
        &mut self,
        filters: Vec<PlatformScanFilter>,
        settings: PlatformScanSettings,
        callback: ModernCallback,
    ) -> Result<(), ScanStartError>;

    fn stop_scan(&mut self);
}

pub struct ModernBackend<P: ModernPlatform> {
    platform: P,
    slot: ScanSlot,
}

impl<P: ModernPlatform> ModernBackend<P> {
    pub fn new(platform: P) -> Self {
        Self {
            platform,
            slot: ScanSlot::default(),
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }
}

impl<P: ModernPlatform> ScanBackend for ModernBackend<P> {
    fn name(&self) -> &'static str {
        "modern"
    }

    fn start_scan(
        &mut self,
        filter: &ScanFilter,
        intensity: ScanIntensity,
    ) -> Result<(ScanHandle, SightingStream), ScanStartError> {
        if self.slot.is_busy() {
            return Err(ScanStartError::AlreadyActive);
        }

        let (sender, stream) = sighting_channel();
        let producer = sender.clone();
        let callback: ModernCallback = Arc::new(move |event: ModernScanEvent| {
            let result = match event {
                ModernScanEvent::FirstMatch(result) | ModernScanEvent::AllMatches(result) => {
                    result
                }
                ModernScanEvent::MatchLost(result) => {
                    // Region exits are decided by the presence tracker's own timeout.
                    debug!("Platform reported match lost for {}", result.device);
                    return;
                }
            };
            let observed_at = result.timestamp.unwrap_or_else(Instant::now);
            match AdvertisementRecord::new(result.device, result.rssi, result.payload, observed_at)
            {
                Ok(record) => {
                    producer.push(record);
                }
                Err(e) => warn!("Dropping modern scan result: {}", e),
            }
        });

        let filters = vec![PlatformScanFilter::from(filter)];
        let settings = PlatformScanSettings::for_intensity(intensity);
        if let Err(e) = self.platform.start_scan(filters, settings, callback) {
            sender.close();
            return Err(e);
        }

        let handle = self.slot.occupy(sender);
        info!("Modern scan started at {:?}", intensity);
        Ok((handle, stream))
    }

    fn stop_scan(&mut self, handle: ScanHandle) {
        if self.slot.release(handle) {
            self.platform.stop_scan();
            info!("Modern scan stopped");
        } else {
            debug!("Ignoring stop for inactive scan {:?}", handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeModern {
        callback: Option<ModernCallback>,
        requests: Vec<(Vec<PlatformScanFilter>, PlatformScanSettings)>,
        stops: usize,
    }

    impl FakeModern {
        fn fire(&self, event: ModernScanEvent) {
            if let Some(cb) = &self.callback {
                cb(event);
            }
        }
    }

    impl ModernPlatform for FakeModern {
        fn start_scan(
            &mut self,
            filters: Vec<PlatformScanFilter>,
            settings: PlatformScanSettings,
            callback: ModernCallback,
        ) -> Result<(), ScanStartError> {
            self.requests.push((filters, settings));
            self.callback = Some(callback);
            Ok(())
        }

        fn stop_scan(&mut self) {
            self.stops += 1;
        }
    }

    fn result(device: &str, at: Instant) -> ModernScanResult {
        ModernScanResult {
            device: device.into(),
            rssi: -58,
            payload: vec![0xAA],
            timestamp: Some(at),
        }
    }

    #[test]
    fn test_filter_and_settings_are_translated() {
        let mut backend = ModernBackend::new(FakeModern::default());
        let filter = ScanFilter::for_service("feaa");
        backend.start_scan(&filter, ScanIntensity::Active).unwrap();

        let (filters, settings) = &backend.platform().requests[0];
        assert_eq!(filters[0].service_uuid.as_deref(), Some("feaa"));
        assert_eq!(settings.scan_mode, PlatformScanMode::LowLatency);
        assert_eq!(settings.callback_type, CallbackType::AllMatches);
    }

    #[test]
    fn test_low_power_maps_to_low_power_mode() {
        let settings = PlatformScanSettings::for_intensity(ScanIntensity::LowPower);
        assert_eq!(settings.scan_mode, PlatformScanMode::LowPower);
    }

    #[test]
    fn test_matches_become_records_and_match_lost_is_ignored() {
        let mut backend = ModernBackend::new(FakeModern::default());
        let (_handle, mut stream) = backend
            .start_scan(&ScanFilter::any(), ScanIntensity::LowPower)
            .unwrap();
        let at = Instant::now();

        backend.platform().fire(ModernScanEvent::FirstMatch(result("AA:BB", at)));
        backend.platform().fire(ModernScanEvent::MatchLost(result("AA:BB", at)));
        backend.platform().fire(ModernScanEvent::AllMatches(result("", at)));

        let record = stream.try_recv().unwrap();
        assert_eq!(record.device(), &DeviceIdentity::from("AA:BB"));
        assert_eq!(record.observed_at(), at);
        assert!(stream.try_recv().is_err());
    }

    #[test]
    fn test_stop_gates_late_callbacks() {
        let mut backend = ModernBackend::new(FakeModern::default());
        let (handle, mut stream) = backend
            .start_scan(&ScanFilter::any(), ScanIntensity::Active)
            .unwrap();
        backend.stop_scan(handle);
        backend
            .platform()
            .fire(ModernScanEvent::AllMatches(result("AA:BB", Instant::now())));
        assert!(stream.try_recv().is_err());
        assert_eq!(backend.platform().stops, 1);

        assert!(backend
            .start_scan(&ScanFilter::any(), ScanIntensity::Active)
            .is_ok());
    }
}
