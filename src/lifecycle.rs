//! Lifecycle binding
//!
//! Glue for hosts with foreground/background components. The binding holds
//! an explicit [`ServiceHandle`], registers one observer for the host and
//! asks for an ACTIVE scan while any aware component is in the foreground,
//! LOW_POWER otherwise.

use crate::domain::error::ServiceError;
use crate::domain::models::{ObserverId, ScanIntensity};
use crate::infrastructure::bluetooth::ServiceHandle;
use crate::infrastructure::channel::EventSink;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

pub struct LifecycleBinding {
    handle: ServiceHandle,
    observer: ObserverId,
    foreground: AtomicUsize,
    detached: bool,
}

impl LifecycleBinding {
    /// Register `sink` with the service and start a background scan.
    pub fn attach(handle: ServiceHandle, sink: impl EventSink + 'static) -> Result<Self, ServiceError> {
        let observer = handle.register(sink)?;
        let binding = Self {
            handle,
            observer,
            foreground: AtomicUsize::new(0),
            detached: false,
        };
        binding.request_scan()?;
        Ok(binding)
    }

    pub fn observer(&self) -> ObserverId {
        self.observer
    }

    pub fn foreground_count(&self) -> usize {
        self.foreground.load(Ordering::SeqCst)
    }

    pub fn scan_intensity(&self) -> ScanIntensity {
        if self.foreground_count() == 0 {
            ScanIntensity::LowPower
        } else {
            ScanIntensity::Active
        }
    }

    /// An aware component came to the foreground.
    pub fn foreground_resumed(&self) -> Result<(), ServiceError> {
        if self.foreground.fetch_add(1, Ordering::SeqCst) == 0 {
            self.request_scan()?;
        }
        Ok(())
    }

    /// An aware component left the foreground.
    pub fn foreground_paused(&self) -> Result<(), ServiceError> {
        let previous = self
            .foreground
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        if previous <= 1 {
            self.request_scan()?;
        }
        Ok(())
    }

    fn request_scan(&self) -> Result<(), ServiceError> {
        let intensity = self.scan_intensity();
        debug!("Lifecycle requests {:?} scan", intensity);
        self.handle.request_scan(self.observer, intensity)
    }

    /// Unregister from the service.
    pub fn detach(mut self) -> Result<(), ServiceError> {
        self.detached = true;
        self.handle.unregister(self.observer)
    }
}

impl Drop for LifecycleBinding {
    fn drop(&mut self) {
        if !self.detached {
            if let Err(e) = self.handle.unregister(self.observer) {
                warn!("Failed to unregister lifecycle observer: {}", e);
            }
        }
    }
}
