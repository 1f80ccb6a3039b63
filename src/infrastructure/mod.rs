pub mod bluetooth;
pub mod channel;
pub mod logging;
