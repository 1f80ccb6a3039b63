//! Beacon presence detection.
//!
//! Observes BLE advertisements through one of two platform scanning APIs,
//! tracks which beacons are in range and notifies every registered observer
//! exactly once per ENTER/LEAVE transition, while arbitrating scan
//! intensity between observers.

pub mod domain;
pub mod infrastructure;
pub mod ipc_client;
pub mod ipc_worker;
pub mod lifecycle;

pub use domain::error::{
    CommandOnUnknownObserver, MalformedSighting, ObserverUnreachable, ScanStartError, ServiceError,
};
pub use domain::models::{
    AdvertisementRecord, DeviceIdentity, ObserverId, PresenceTransition, ScanIntensity,
    ServiceEvent,
};
pub use domain::presence::{PresenceConfig, PresenceTracker};
pub use infrastructure::bluetooth::{
    ScanBackend, ScanFilter, ServiceCommand, ServiceConfig, ServiceHandle, SessionService,
};
pub use infrastructure::channel::EventSink;
pub use lifecycle::LifecycleBinding;
