//! Line-oriented replay platform
//!
//! Feeds [`RawScanResult`]s, one JSON object per line, from any reader
//! (stdin for the daemon) into a legacy scan. Used where no native radio
//! backend is compiled in.

use crate::domain::error::ScanStartError;
use crate::domain::models::ScanIntensity;
use crate::infrastructure::bluetooth::legacy::{
    LegacyCallback, LegacyPlatform, RawScanResult, ScanEndedCallback,
};
use std::io::BufRead;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

type SharedCallback = Arc<Mutex<Option<(LegacyCallback, ScanEndedCallback)>>>;

pub struct ReplayPlatform {
    callback: SharedCallback,
    source: Option<Box<dyn BufRead + Send>>,
}

impl ReplayPlatform {
    pub fn new(source: impl BufRead + Send + 'static) -> Self {
        Self {
            callback: Arc::new(Mutex::new(None)),
            source: Some(Box::new(source)),
        }
    }

    pub fn stdin() -> Self {
        Self::new(std::io::BufReader::new(std::io::stdin()))
    }

    fn spawn_reader(source: Box<dyn BufRead + Send>, callback: SharedCallback) {
        std::thread::spawn(move || {
            for line in source.lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("Replay source read error: {}", e);
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let raw = match serde_json::from_str::<RawScanResult>(&line) {
                    Ok(raw) => raw,
                    Err(e) => {
                        warn!("Skipping unparsable replay line: {}", e);
                        continue;
                    }
                };
                match Self::current(&callback) {
                    Some((cb, _)) => cb(raw),
                    None => debug!("No scan running, dropping replayed result"),
                }
            }
            info!("Replay source exhausted");
            if let Some((_, on_end)) = Self::current(&callback) {
                on_end();
            }
        });
    }

    fn current(callback: &SharedCallback) -> Option<(LegacyCallback, ScanEndedCallback)> {
        callback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl LegacyPlatform for ReplayPlatform {
    fn start_le_scan(
        &mut self,
        intensity: ScanIntensity,
        callback: LegacyCallback,
        on_end: ScanEndedCallback,
    ) -> Result<(), ScanStartError> {
        {
            let mut current = self
                .callback
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if current.is_some() {
                return Err(ScanStartError::AlreadyActive);
            }
            *current = Some((callback, on_end));
        }
        if let Some(source) = self.source.take() {
            Self::spawn_reader(source, self.callback.clone());
        }
        info!("Replay scan started ({:?})", intensity);
        Ok(())
    }

    fn stop_le_scan(&mut self) {
        *self
            .callback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::DeviceIdentity;
    use crate::infrastructure::bluetooth::legacy::LegacyBackend;
    use crate::infrastructure::bluetooth::scanner::{ScanBackend, ScanFilter};
    use std::io::Cursor;
    use std::time::Duration;

    #[tokio::test]
    async fn test_replays_lines_into_scan() {
        let lines = concat!(
            r#"{"address":"AA:BB","rssi":-40}"#,
            "\n",
            "not json\n",
            r#"{"address":"CC:DD","rssi":-80,"scan_record":[2,1,6]}"#,
            "\n",
        );
        let mut backend =
            LegacyBackend::new(ReplayPlatform::new(Cursor::new(lines)), Duration::ZERO);
        let (_handle, mut stream) = backend
            .start_scan(&ScanFilter::any(), ScanIntensity::Active)
            .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), stream.recv())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(5), stream.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.device(), &DeviceIdentity::from("AA:BB"));
        assert_eq!(second.device(), &DeviceIdentity::from("CC:DD"));
        assert_eq!(second.payload(), &[2, 1, 6]);
    }

    #[tokio::test]
    async fn test_exhausted_source_ends_stream() {
        let lines = concat!(r#"{"address":"AA:BB","rssi":-40}"#, "\n");
        let mut backend =
            LegacyBackend::new(ReplayPlatform::new(Cursor::new(lines)), Duration::ZERO);
        let (_handle, mut stream) = backend
            .start_scan(&ScanFilter::any(), ScanIntensity::LowPower)
            .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), stream.recv())
            .await
            .unwrap();
        assert!(first.is_some());
        let end = tokio::time::timeout(Duration::from_secs(5), stream.recv())
            .await
            .unwrap();
        assert!(end.is_none());
    }
}
