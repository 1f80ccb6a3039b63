//! Scan Arbiter
//!
//! Keeps one intensity demand per observer and resolves them to the single
//! intensity the backend should run at.

use crate::domain::models::{ObserverId, ScanIntensity};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct ScanArbiter {
    demands: HashMap<ObserverId, ScanIntensity>,
}

impl ScanArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a demand; `Off` removes it.
    pub fn set_demand(&mut self, observer: ObserverId, intensity: ScanIntensity) {
        if intensity == ScanIntensity::Off {
            self.demands.remove(&observer);
        } else {
            self.demands.insert(observer, intensity);
        }
    }

    pub fn remove(&mut self, observer: ObserverId) {
        self.demands.remove(&observer);
    }

    pub fn demand(&self, observer: ObserverId) -> ScanIntensity {
        self.demands
            .get(&observer)
            .copied()
            .unwrap_or(ScanIntensity::Off)
    }

    /// Strongest outstanding demand, `Off` when nobody wants a scan.
    pub fn current_intensity(&self) -> ScanIntensity {
        self.demands
            .values()
            .copied()
            .max()
            .unwrap_or(ScanIntensity::Off)
    }

    pub fn len(&self) -> usize {
        self.demands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.demands.is_empty()
    }
}
