//! WinRT advertisement watcher
//!
//! Exposes `BluetoothLEAdvertisementWatcher` as a [`LegacyPlatform`]: it
//! reports every received advertisement unfiltered, so the legacy adapter
//! does the filtering and deduplication on top.

use crate::domain::error::ScanStartError;
use crate::domain::models::{DeviceIdentity, ScanIntensity};
use crate::infrastructure::bluetooth::legacy::{
    LegacyCallback, LegacyPlatform, RawScanResult, ScanEndedCallback,
};
use tracing::{info, warn};
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisement, BluetoothLEAdvertisementReceivedEventArgs,
    BluetoothLEAdvertisementWatcher, BluetoothLEAdvertisementWatcherStoppedEventArgs,
    BluetoothLEScanningMode,
};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::DataReader;
use windows::Win32::Foundation::E_ACCESSDENIED;

#[derive(Default)]
pub struct WinRtPlatform {
    watcher: Option<BluetoothLEAdvertisementWatcher>,
}

impl WinRtPlatform {
    pub fn new() -> Self {
        Self::default()
    }
}

fn start_error(e: windows::core::Error) -> ScanStartError {
    warn!("Advertisement watcher error: {}", e);
    if e.code() == E_ACCESSDENIED {
        ScanStartError::PermissionDenied
    } else {
        ScanStartError::HardwareUnavailable
    }
}

/// Re-serialize the advertisement's data sections as AD structures.
fn scan_record(adv: &BluetoothLEAdvertisement) -> windows::core::Result<Vec<u8>> {
    let mut record = Vec::new();
    let sections = adv.DataSections()?;
    for i in 0..sections.Size()? {
        let section = sections.GetAt(i)?;
        let reader = DataReader::FromBuffer(&section.Data()?)?;
        let length = reader.UnconsumedBufferLength()? as usize;
        let mut bytes = vec![0u8; length];
        reader.ReadBytes(&mut bytes)?;

        record.push((length + 1).min(u8::MAX as usize) as u8);
        record.push(section.DataType()?);
        record.extend_from_slice(&bytes);
    }
    Ok(record)
}

impl LegacyPlatform for WinRtPlatform {
    fn start_le_scan(
        &mut self,
        intensity: ScanIntensity,
        callback: LegacyCallback,
        on_end: ScanEndedCallback,
    ) -> Result<(), ScanStartError> {
        if self.watcher.is_some() {
            return Err(ScanStartError::AlreadyActive);
        }

        let watcher = BluetoothLEAdvertisementWatcher::new().map_err(start_error)?;
        let mode = match intensity {
            ScanIntensity::Active => BluetoothLEScanningMode::Active,
            ScanIntensity::LowPower | ScanIntensity::Off => BluetoothLEScanningMode::Passive,
        };
        watcher.SetScanningMode(mode).map_err(start_error)?;

        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let adv = args.Advertisement()?;
                    let service_uuids = adv.ServiceUuids()?;
                    let mut uuids = Vec::new();
                    for i in 0..service_uuids.Size()? {
                        uuids.push(format!("{:?}", service_uuids.GetAt(i)?));
                    }

                    callback(RawScanResult {
                        address: Some(DeviceIdentity::from_mac(args.BluetoothAddress()?).to_string()),
                        rssi: args.RawSignalStrengthInDBm()? as i32,
                        scan_record: scan_record(&adv).unwrap_or_default(),
                        service_uuids: uuids,
                    });
                }
                Ok(())
            },
        );

        // Fires for our own Stop() too; the adapter ignores it once the scan is released.
        let stopped = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementWatcherStoppedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    info!("Advertisement watcher stopped: {:?}", args.Error()?);
                }
                on_end();
                Ok(())
            },
        );

        watcher.Received(&handler).map_err(start_error)?;
        watcher.Stopped(&stopped).map_err(start_error)?;
        watcher.Start().map_err(start_error)?;
        info!("Advertisement watcher started ({:?})", mode);
        self.watcher = Some(watcher);
        Ok(())
    }

    fn stop_le_scan(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            info!("Stopping advertisement watcher...");
            if let Err(e) = watcher.Stop() {
                warn!("Failed to stop advertisement watcher: {}", e);
            }
        }
    }
}

impl Drop for WinRtPlatform {
    fn drop(&mut self) {
        self.stop_le_scan();
    }
}
