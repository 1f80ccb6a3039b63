//! Error taxonomy for the presence core.
//!
//! None of these are fatal: a malformed sighting is dropped, a failed scan
//! start is reported to observers, an unreachable observer is deregistered
//! and a command for an unknown observer is a no-op.

use crate::domain::models::ObserverId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A raw sighting that cannot be turned into an advertisement record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MalformedSighting {
    #[error("sighting has an empty device identity")]
    EmptyIdentity,
    #[error("sighting carries no device address")]
    MissingAddress,
}

/// Why a scan could not be started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanStartError {
    #[error("a scan is already active on this backend")]
    AlreadyActive,
    #[error("bluetooth hardware is unavailable")]
    HardwareUnavailable,
    #[error("permission to scan was denied")]
    PermissionDenied,
}

/// Delivery to an observer channel failed; the observer is presumed gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("observer channel is closed")]
pub struct ObserverUnreachable;

/// UNREGISTER or REQUEST_SCAN for an observer that is not registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no registered observer {0}")]
pub struct CommandOnUnknownObserver(pub ObserverId);

/// Failures of the [`ServiceHandle`](crate::ServiceHandle) itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("session service is no longer running")]
    Stopped,
}
