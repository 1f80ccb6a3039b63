//! Legacy callback-result backend
//!
//! Legacy platforms report every received advertisement as a free-form
//! result with no filtering and no deduplication. This adapter applies the
//! scan filter itself, rejects results without an address and rate-limits
//! identical reports of the same device.

use crate::domain::error::{MalformedSighting, ScanStartError};
use crate::domain::models::{AdvertisementRecord, DeviceIdentity, ScanIntensity};
use crate::infrastructure::bluetooth::scanner::{
    sighting_channel, ScanBackend, ScanFilter, ScanHandle, ScanSlot, SightingStream,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// One raw result as handed over by a legacy platform callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawScanResult {
    pub address: Option<String>,
    pub rssi: i32,
    #[serde(default)]
    pub scan_record: Vec<u8>,
    #[serde(default)]
    pub service_uuids: Vec<String>,
}

impl RawScanResult {
    fn into_record(self, observed_at: Instant) -> Result<AdvertisementRecord, MalformedSighting> {
        let address = self.address.ok_or(MalformedSighting::MissingAddress)?;
        let rssi = self.rssi.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
        AdvertisementRecord::new(address.into(), rssi, self.scan_record, observed_at)
    }
}

pub type LegacyCallback = Arc<dyn Fn(RawScanResult) + Send + Sync>;

/// Invoked by the platform when a scan ends on its own (radio off, input
/// exhausted). Not called for scans ended through `stop_le_scan`.
pub type ScanEndedCallback = Arc<dyn Fn() + Send + Sync>;

/// Native primitives of a legacy scanning API.
pub trait LegacyPlatform: Send {
    fn start_le_scan(
        &mut self,
        intensity: ScanIntensity,
        callback: LegacyCallback,
        on_end: ScanEndedCallback,
    ) -> Result<(), ScanStartError>;

    fn stop_le_scan(&mut self);
}

/// Drops repeats of an unchanged advertisement seen within `window`.
///
/// Entries older than the window are evicted at most once per window, so
/// rotating random addresses do not accumulate.
#[derive(Debug)]
pub(crate) struct Deduplicator {
    window: Duration,
    last: HashMap<DeviceIdentity, (Vec<u8>, Instant)>,
    pruned_at: Option<Instant>,
}

impl Deduplicator {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            window,
            last: HashMap::new(),
            pruned_at: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.last.len()
    }

    fn prune(&mut self, now: Instant) {
        let due = match self.pruned_at {
            Some(at) => now.saturating_duration_since(at) >= self.window,
            None => true,
        };
        if !due {
            return;
        }
        let window = self.window;
        self.last
            .retain(|_, (_, seen_at)| now.saturating_duration_since(*seen_at) < window);
        self.pruned_at = Some(now);
    }

    pub(crate) fn is_duplicate(&mut self, record: &AdvertisementRecord) -> bool {
        self.prune(record.observed_at());
        if let Some((payload, at)) = self.last.get(record.device()) {
            if payload.as_slice() == record.payload()
                && record.observed_at().saturating_duration_since(*at) < self.window
            {
                return true;
            }
        }
        self.last.insert(
            record.device().clone(),
            (record.payload().to_vec(), record.observed_at()),
        );
        false
    }
}

pub struct LegacyBackend<P: LegacyPlatform> {
    platform: P,
    dedup_window: Duration,
    slot: ScanSlot,
}

impl<P: LegacyPlatform> LegacyBackend<P> {
    pub fn new(platform: P, dedup_window: Duration) -> Self {
        Self {
            platform,
            dedup_window,
            slot: ScanSlot::default(),
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }
}

impl<P: LegacyPlatform> ScanBackend for LegacyBackend<P> {
    fn name(&self) -> &'static str {
        "legacy"
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
        let dedup = Mutex::new(Deduplicator::new(self.dedup_window));
        let filter = filter.clone();
        let producer = sender.clone();

        let callback: LegacyCallback = Arc::new(move |raw: RawScanResult| {
            if !producer.is_open() {
                return;
            }
            let service_uuids = raw.service_uuids.clone();
            let record = match raw.into_record(Instant::now()) {
                Ok(record) => record,
                Err(e) => {
                    warn!("Dropping legacy scan result: {}", e);
                    return;
                }
            };
            if !filter.matches(record.device(), &service_uuids) {
                return;
            }
            let duplicate = dedup
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .is_duplicate(&record);
            if !duplicate {
                producer.push(record);
            }
        });

        let ender = sender.clone();
        let on_end: ScanEndedCallback = Arc::new(move || {
            if ender.is_open() {
                warn!("Legacy platform ended the scan");
                ender.close();
            }
        });

        if let Err(e) = self.platform.start_le_scan(intensity, callback, on_end) {
            sender.close();
            return Err(e);
        }

        let handle = self.slot.occupy(sender);
        info!("Legacy scan started at {:?}", intensity);
        Ok((handle, stream))
    }

    fn stop_scan(&mut self, handle: ScanHandle) {
        if self.slot.release(handle) {
            self.platform.stop_le_scan();
            info!("Legacy scan stopped");
        } else {
            debug!("Ignoring stop for inactive scan {:?}", handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// In-memory platform that lets the test fire callbacks by hand.
    #[derive(Default)]
    struct FakeLegacy {
        callback: Option<LegacyCallback>,
        on_end: Option<ScanEndedCallback>,
        started: Vec<ScanIntensity>,
        stops: usize,
        fail_with: Option<ScanStartError>,
    }

    impl FakeLegacy {
        fn fire(&self, raw: RawScanResult) {
            if let Some(cb) = &self.callback {
                cb(raw);
            }
        }

        fn end(&self) {
            if let Some(on_end) = &self.on_end {
                on_end();
            }
        }
    }

    impl LegacyPlatform for FakeLegacy {
        fn start_le_scan(
            &mut self,
            intensity: ScanIntensity,
            callback: LegacyCallback,
            on_end: ScanEndedCallback,
        ) -> Result<(), ScanStartError> {
            if let Some(e) = self.fail_with {
                return Err(e);
            }
            self.started.push(intensity);
            self.callback = Some(callback);
            self.on_end = Some(on_end);
            Ok(())
        }

        fn stop_le_scan(&mut self) {
            self.stops += 1;
        }
    }

    fn raw(address: Option<&str>, payload: &[u8], uuids: &[&str]) -> RawScanResult {
        RawScanResult {
            address: address.map(str::to_string),
            rssi: -64,
            scan_record: payload.to_vec(),
            service_uuids: uuids.iter().map(|u| u.to_string()).collect(),
        }
    }

    #[test]
    fn test_duplicates_are_suppressed() {
        let mut backend = LegacyBackend::new(FakeLegacy::default(), Duration::from_secs(60));
        let (_handle, mut stream) = backend
            .start_scan(&ScanFilter::any(), ScanIntensity::Active)
            .unwrap();

        backend.platform().fire(raw(Some("AA:BB"), &[1, 2], &[]));
        backend.platform().fire(raw(Some("AA:BB"), &[1, 2], &[]));
        backend.platform().fire(raw(Some("AA:BB"), &[1, 3], &[]));

        assert_eq!(stream.try_recv().unwrap().payload(), &[1, 2]);
        assert_eq!(stream.try_recv().unwrap().payload(), &[1, 3]);
        assert!(stream.try_recv().is_err());
    }

    #[test]
    fn test_filter_and_malformed_results_are_dropped() {
        let mut backend = LegacyBackend::new(FakeLegacy::default(), Duration::ZERO);
        let filter = ScanFilter::for_service("feaa");
        let (_handle, mut stream) = backend.start_scan(&filter, ScanIntensity::LowPower).unwrap();

        backend.platform().fire(raw(None, &[], &["feaa"]));
        backend.platform().fire(raw(Some("AA:BB"), &[], &["180f"]));
        backend.platform().fire(raw(Some("CC:DD"), &[], &["FEAA"]));

        let record = stream.try_recv().unwrap();
        assert_eq!(record.device(), &DeviceIdentity::from("CC:DD"));
        assert!(stream.try_recv().is_err());
        assert_eq!(backend.platform().started, vec![ScanIntensity::LowPower]);
    }

    #[test]
    fn test_second_start_is_rejected() {
        let mut backend = LegacyBackend::new(FakeLegacy::default(), Duration::ZERO);
        let _scan = backend
            .start_scan(&ScanFilter::any(), ScanIntensity::Active)
            .unwrap();
        let err = backend
            .start_scan(&ScanFilter::any(), ScanIntensity::Active)
            .unwrap_err();
        assert_eq!(err, ScanStartError::AlreadyActive);
    }

    #[test]
    fn test_platform_failure_is_surfaced() {
        let platform = FakeLegacy {
            fail_with: Some(ScanStartError::PermissionDenied),
            ..FakeLegacy::default()
        };
        let mut backend = LegacyBackend::new(platform, Duration::ZERO);
        let err = backend
            .start_scan(&ScanFilter::any(), ScanIntensity::Active)
            .unwrap_err();
        assert_eq!(err, ScanStartError::PermissionDenied);
        assert!(backend
            .start_scan(&ScanFilter::any(), ScanIntensity::Active)
            .is_err());
    }

    #[test]
    fn test_no_records_after_stop() {
        let mut backend = LegacyBackend::new(FakeLegacy::default(), Duration::ZERO);
        let (handle, mut stream) = backend
            .start_scan(&ScanFilter::any(), ScanIntensity::Active)
            .unwrap();
        backend.stop_scan(handle);
        backend.platform().fire(raw(Some("AA:BB"), &[], &[]));

        assert!(stream.try_recv().is_err());
        assert_eq!(backend.platform().stops, 1);

        backend.stop_scan(handle);
        assert_eq!(backend.platform().stops, 1);
    }

    #[test]
    fn test_dedup_forgets_devices_outside_window() {
        let mut dedup = Deduplicator::new(Duration::from_secs(1));
        let base = Instant::now();
        for i in 0..100u64 {
            let record = AdvertisementRecord::new(
                DeviceIdentity::from_mac(i),
                -60,
                vec![1],
                base,
            )
            .unwrap();
            assert!(!dedup.is_duplicate(&record));
        }
        assert_eq!(dedup.len(), 100);

        let later = AdvertisementRecord::new(
            DeviceIdentity::from_mac(500),
            -60,
            vec![1],
            base + Duration::from_secs(2),
        )
        .unwrap();
        assert!(!dedup.is_duplicate(&later));
        assert_eq!(dedup.len(), 1);
    }

    #[tokio::test]
    async fn test_platform_end_closes_stream() {
        let mut backend = LegacyBackend::new(FakeLegacy::default(), Duration::ZERO);
        let (handle, mut stream) = backend
            .start_scan(&ScanFilter::any(), ScanIntensity::Active)
            .unwrap();
        backend.platform().fire(raw(Some("AA:BB"), &[], &[]));
        backend.platform().end();

        assert!(stream.recv().await.is_some());
        assert!(stream.recv().await.is_none());

        backend.stop_scan(handle);
        assert!(backend
            .start_scan(&ScanFilter::any(), ScanIntensity::Active)
            .is_ok());
    }
}
