//! Presence Tracker
//!
//! Folds a stream of advertisement records into per-device region state and
//! yields ENTER/EXIT transitions. For a single device ENTER and EXIT always
//! alternate; repeated sightings of a device already in region are silent.

use crate::domain::models::{AdvertisementRecord, DeviceIdentity, PresenceTransition};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::trace;

/// Default time without a sighting before a device is considered gone.
pub const DEFAULT_MATCH_LOST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// A device in region that has not been seen for at least this long
    /// leaves the region.
    pub match_lost_timeout: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            match_lost_timeout: DEFAULT_MATCH_LOST_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    InRegion,
    OutOfRegion,
}

#[derive(Debug, Clone)]
struct PresenceEntry {
    last_seen_at: Instant,
    state: RegionState,
    latest: AdvertisementRecord,
}

pub struct PresenceTracker {
    config: PresenceConfig,
    entries: HashMap<DeviceIdentity, PresenceEntry>,
}

impl PresenceTracker {
    pub fn new(config: PresenceConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
        }
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    /// Fold one sighting into the tracker.
    ///
    /// Records older than the device's last sighting are ignored. If the
    /// device is still marked in region but the gap to this record already
    /// reached the timeout, the missed EXIT is emitted before the new ENTER.
    pub fn observe(&mut self, record: AdvertisementRecord) -> Vec<PresenceTransition> {
        let timeout = self.config.match_lost_timeout;
        let seen_at = record.observed_at();

        let entry = match self.entries.entry(record.device().clone()) {
            Entry::Vacant(slot) => {
                slot.insert(PresenceEntry {
                    last_seen_at: seen_at,
                    state: RegionState::InRegion,
                    latest: record.clone(),
                });
                return vec![PresenceTransition::Enter(record)];
            }
            Entry::Occupied(slot) => slot.into_mut(),
        };

        if seen_at < entry.last_seen_at {
            trace!(device = %record.device(), "Ignoring stale sighting");
            return Vec::new();
        }

        let mut transitions = Vec::new();
        if entry.state == RegionState::InRegion
            && seen_at.saturating_duration_since(entry.last_seen_at) >= timeout
        {
            entry.state = RegionState::OutOfRegion;
            transitions.push(PresenceTransition::Exit(record.device().clone()));
        }

        entry.last_seen_at = seen_at;
        entry.latest = record.clone();
        if entry.state == RegionState::OutOfRegion {
            entry.state = RegionState::InRegion;
            transitions.push(PresenceTransition::Enter(record));
        }
        transitions
    }

    /// Expire every in-region device not seen within the timeout as of `now`.
    pub fn sweep(&mut self, now: Instant) -> Vec<PresenceTransition> {
        let timeout = self.config.match_lost_timeout;
        self.entries
            .iter_mut()
            .filter(|(_, entry)| {
                entry.state == RegionState::InRegion
                    && now.saturating_duration_since(entry.last_seen_at) >= timeout
            })
            .map(|(device, entry)| {
                entry.state = RegionState::OutOfRegion;
                PresenceTransition::Exit(device.clone())
            })
            .collect()
    }

    /// Latest sighting of every device currently in region.
    pub fn in_region(&self) -> Vec<AdvertisementRecord> {
        self.entries
            .values()
            .filter(|entry| entry.state == RegionState::InRegion)
            .map(|entry| entry.latest.clone())
            .collect()
    }

    /// Emit EXIT for every device in region, then forget all state.
    pub fn flush(&mut self) -> Vec<PresenceTransition> {
        self.entries
            .drain()
            .filter(|(_, entry)| entry.state == RegionState::InRegion)
            .map(|(device, _)| PresenceTransition::Exit(device))
            .collect()
    }

    /// Forget all state without emitting anything.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn state(&self, device: &DeviceIdentity) -> Option<RegionState> {
        self.entries.get(device).map(|entry| entry.state)
    }

    pub fn last_seen(&self, device: &DeviceIdentity) -> Option<Instant> {
        self.entries.get(device).map(|entry| entry.last_seen_at)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> PresenceTracker {
        PresenceTracker::new(PresenceConfig {
            match_lost_timeout: Duration::from_secs(30),
        })
    }

    fn sighting(device: &str, at: Instant) -> AdvertisementRecord {
        AdvertisementRecord::new(device.into(), -70, vec![0x02, 0x01, 0x06], at).unwrap()
    }

    fn kinds(transitions: &[PresenceTransition]) -> Vec<&'static str> {
        transitions
            .iter()
            .map(|t| match t {
                PresenceTransition::Enter(_) => "enter",
                PresenceTransition::Exit(_) => "exit",
            })
            .collect()
    }

    #[test]
    fn test_continuous_sightings_enter_once() {
        let mut tracker = tracker();
        let base = Instant::now();
        let mut events = Vec::new();
        for i in 0..20 {
            let at = base + Duration::from_secs(i * 5);
            events.extend(tracker.observe(sighting("AA:BB", at)));
            events.extend(tracker.sweep(at));
        }
        assert_eq!(kinds(&events), vec!["enter"]);
        assert_eq!(tracker.state(&"AA:BB".into()), Some(RegionState::InRegion));
    }

    #[test]
    fn test_gap_produces_enter_exit_enter() {
        let mut tracker = tracker();
        let base = Instant::now();
        let mut events = tracker.observe(sighting("AA:BB", base));
        events.extend(tracker.sweep(base + Duration::from_secs(29)));
        events.extend(tracker.sweep(base + Duration::from_secs(31)));
        events.extend(tracker.sweep(base + Duration::from_secs(45)));
        events.extend(tracker.observe(sighting("AA:BB", base + Duration::from_secs(50))));
        assert_eq!(kinds(&events), vec!["enter", "exit", "enter"]);
    }

    #[test]
    fn test_gap_without_sweep_still_alternates() {
        let mut tracker = tracker();
        let base = Instant::now();
        let mut events = tracker.observe(sighting("AA:BB", base));
        events.extend(tracker.observe(sighting("AA:BB", base + Duration::from_secs(30))));
        assert_eq!(kinds(&events), vec!["enter", "exit", "enter"]);
    }

    #[test]
    fn test_stale_record_is_ignored() {
        let mut tracker = tracker();
        let base = Instant::now();
        tracker.observe(sighting("D", base + Duration::from_secs(10)));
        let events = tracker.observe(sighting("D", base + Duration::from_secs(5)));
        assert!(events.is_empty());
        assert_eq!(
            tracker.last_seen(&"D".into()),
            Some(base + Duration::from_secs(10))
        );
    }

    #[test]
    fn test_stale_record_does_not_reenter() {
        let mut tracker = tracker();
        let base = Instant::now();
        tracker.observe(sighting("D", base + Duration::from_secs(10)));
        assert_eq!(tracker.sweep(base + Duration::from_secs(40)).len(), 1);
        let events = tracker.observe(sighting("D", base + Duration::from_secs(9)));
        assert!(events.is_empty());
        assert_eq!(tracker.state(&"D".into()), Some(RegionState::OutOfRegion));
    }

    #[test]
    fn test_devices_are_independent() {
        let mut tracker = tracker();
        let base = Instant::now();
        tracker.observe(sighting("A", base));
        tracker.observe(sighting("B", base + Duration::from_secs(20)));
        let exits = tracker.sweep(base + Duration::from_secs(35));
        assert_eq!(exits, vec![PresenceTransition::Exit("A".into())]);
        assert_eq!(tracker.in_region().len(), 1);
        assert_eq!(tracker.in_region()[0].device(), &DeviceIdentity::from("B"));
    }

    #[test]
    fn test_flush_exits_present_devices_and_clears() {
        let mut tracker = tracker();
        let base = Instant::now();
        tracker.observe(sighting("A", base));
        tracker.observe(sighting("B", base));
        tracker.sweep(base + Duration::from_secs(31));
        tracker.observe(sighting("B", base + Duration::from_secs(32)));

        let flushed = tracker.flush();
        assert_eq!(flushed, vec![PresenceTransition::Exit("B".into())]);
        assert!(tracker.is_empty());
    }
}
