//! Domain layer: the platform-independent presence core.

pub mod arbiter;
pub mod error;
pub mod models;
pub mod presence;
pub mod settings;
