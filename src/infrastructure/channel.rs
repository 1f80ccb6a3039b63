//! Observer Channel
//!
//! The service only needs a non-blocking "deliver or report gone" sink per
//! observer. In-process observers hand over a tokio unbounded sender; the
//! IPC worker wraps each socket connection in its own sink.

use crate::domain::error::ObserverUnreachable;
use crate::domain::models::ServiceEvent;
use tokio::sync::mpsc;

pub trait EventSink: Send {
    /// Queue `event` for the observer. Must not block.
    fn deliver(&self, event: &ServiceEvent) -> Result<(), ObserverUnreachable>;
}

impl EventSink for mpsc::UnboundedSender<ServiceEvent> {
    fn deliver(&self, event: &ServiceEvent) -> Result<(), ObserverUnreachable> {
        self.send(event.clone()).map_err(|_| ObserverUnreachable)
    }
}
