//! Scan backend contract
//!
//! Every concrete backend exposes the same start/stop pair and pushes
//! normalized [`AdvertisementRecord`]s into a per-scan [`SightingStream`].

use crate::domain::error::ScanStartError;
use crate::domain::models::{AdvertisementRecord, DeviceIdentity, ScanIntensity};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// Records of one scan, delivered until the scan is stopped.
pub type SightingStream = mpsc::UnboundedReceiver<AdvertisementRecord>;

/// Which advertisements a scan surfaces.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    /// Only advertisements listing this service UUID.
    pub service_uuid: Option<String>,
    /// Only this device.
    pub device: Option<DeviceIdentity>,
}

impl ScanFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn for_service(uuid: impl Into<String>) -> Self {
        Self {
            service_uuid: Some(uuid.into()),
            device: None,
        }
    }

    pub fn matches(&self, device: &DeviceIdentity, service_uuids: &[String]) -> bool {
        if let Some(wanted) = &self.device {
            if wanted != device {
                return false;
            }
        }
        match &self.service_uuid {
            Some(wanted) => {
                let wanted = normalize_uuid(wanted);
                service_uuids.iter().any(|u| normalize_uuid(u) == wanted)
            }
            None => true,
        }
    }
}

/// Lowercase, brace-free form used to compare UUID strings.
pub fn normalize_uuid(uuid: &str) -> String {
    uuid.trim_matches(|c: char| c == '{' || c == '}')
        .to_ascii_lowercase()
}

/// Token identifying one started scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScanHandle(pub(crate) u64);

/// One scan/stop contract over the platform scanning APIs.
///
/// The service never asks for [`ScanIntensity::Off`]; it stops the scan
/// instead.
pub trait ScanBackend: Send {
    fn name(&self) -> &'static str;

    fn start_scan(
        &mut self,
        filter: &ScanFilter,
        intensity: ScanIntensity,
    ) -> Result<(ScanHandle, SightingStream), ScanStartError>;

    /// After this returns, no further records reach the stream of `handle`.
    fn stop_scan(&mut self, handle: ScanHandle);
}

/// Producer half of a [`SightingStream`], gated so a stopped scan cannot
/// leak late platform callbacks.
///
/// All clones share one underlying sender; [`SightingSender::close`] drops
/// it, so the stream ends once buffered records are drained.
#[derive(Debug, Clone)]
pub struct SightingSender {
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<AdvertisementRecord>>>>,
}

impl SightingSender {
    pub fn push(&self, record: AdvertisementRecord) -> bool {
        match self.lock().as_ref() {
            Some(tx) => tx.send(record).is_ok(),
            None => false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.lock().is_some()
    }

    pub fn close(&self) {
        self.lock().take();
    }

    fn lock(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<AdvertisementRecord>>> {
        self.tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub fn sighting_channel() -> (SightingSender, SightingStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        SightingSender {
            tx: Arc::new(Mutex::new(Some(tx))),
        },
        rx,
    )
}

/// Book-keeping shared by the adapters: at most one scan at a time.
#[derive(Debug, Default)]
pub(crate) struct ScanSlot {
    next_id: u64,
    current: Option<(ScanHandle, SightingSender)>,
}

impl ScanSlot {
    pub(crate) fn is_busy(&self) -> bool {
        self.current.is_some()
    }

    pub(crate) fn occupy(&mut self, sender: SightingSender) -> ScanHandle {
        self.next_id += 1;
        let handle = ScanHandle(self.next_id);
        self.current = Some((handle, sender));
        handle
    }

    /// Close and release the slot if `handle` is the running scan.
    pub(crate) fn release(&mut self, handle: ScanHandle) -> bool {
        match &self.current {
            Some((current, sender)) if *current == handle => {
                sender.close();
                self.current = None;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_filter_matches_service_uuid_case_insensitively() {
        let filter = ScanFilter::for_service("0000FEAA-0000-1000-8000-00805F9B34FB");
        let device = DeviceIdentity::from("AA:BB");
        assert!(filter.matches(
            &device,
            &["{0000feaa-0000-1000-8000-00805f9b34fb}".to_string()]
        ));
        assert!(!filter.matches(&device, &[]));
        assert!(ScanFilter::any().matches(&device, &[]));
    }

    #[test]
    fn test_filter_matches_device() {
        let filter = ScanFilter {
            service_uuid: None,
            device: Some("AA:BB".into()),
        };
        assert!(filter.matches(&"AA:BB".into(), &[]));
        assert!(!filter.matches(&"CC:DD".into(), &[]));
    }

    #[test]
    fn test_closed_sender_drops_records() {
        let (sender, mut stream) = sighting_channel();
        let record =
            AdvertisementRecord::new("AA:BB".into(), -50, Vec::new(), Instant::now()).unwrap();
        assert!(sender.push(record.clone()));
        sender.close();
        assert!(!sender.push(record));
        assert!(stream.try_recv().is_ok());
        assert!(stream.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_ends_stream_for_all_clones() {
        let (sender, mut stream) = sighting_channel();
        let _callback_copy = sender.clone();
        sender.close();
        assert_eq!(stream.recv().await, None);
    }

    #[test]
    fn test_slot_releases_only_current_handle() {
        let mut slot = ScanSlot::default();
        let (sender, _stream) = sighting_channel();
        let handle = slot.occupy(sender.clone());
        assert!(slot.is_busy());
        assert!(!slot.release(ScanHandle(handle.0 + 1)));
        assert!(slot.release(handle));
        assert!(!sender.is_open());
        assert!(!slot.is_busy());
    }
}
