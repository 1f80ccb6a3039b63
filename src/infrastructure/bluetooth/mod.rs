//! Bluetooth Module
//!
//! Scan backends and the session service that drives them.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    SessionService                        │
//! │  (commands, presence tracking, observer fan-out)         │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │ dyn ScanBackend
//!         ┌─────────────┴─────────────┐
//!         │                           │
//!         ▼                           ▼
//! ┌───────────────┐          ┌────────────────┐
//! │ LegacyBackend │          │ ModernBackend  │
//! │ - filtering   │          │ - native       │
//! │ - dedup       │          │   filters and  │
//! │               │          │   settings     │
//! └───────┬───────┘          └────────┬───────┘
//!         ▼                           ▼
//!  LegacyPlatform               ModernPlatform
//!  (WinRT watcher, replay)      (host supplied)
//! ```
//!
//! ## Modules
//!
//! - [`scanner`] - Backend contract, scan filter, sighting stream
//! - [`legacy`] - Adapter for callback-result platforms
//! - [`modern`] - Adapter for filter/settings platforms
//! - [`replay`] - JSON-lines platform for hosts without a radio backend
//! - [`service`] - Session service

pub mod legacy;
pub mod modern;
pub mod replay;
pub mod scanner;
pub mod service;
#[cfg(windows)]
pub mod winrt;

pub use scanner::{ScanBackend, ScanFilter, ScanHandle, SightingStream};
pub use service::{ServiceCommand, ServiceConfig, ServiceHandle, SessionService};
