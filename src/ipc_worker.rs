//! Cross-process observer channel
//!
//! Each local-socket connection is one observer. It is registered on
//! connect and unregistered when the peer hangs up. Both directions carry
//! newline-delimited JSON: [`WireCommand`] from the client, [`WireEvent`]
//! from the service.

use crate::domain::error::{ObserverUnreachable, ScanStartError};
use crate::domain::models::{ObserverId, ScanIntensity, ServiceEvent};
use crate::infrastructure::bluetooth::{ServiceCommand, ServiceHandle};
use crate::infrastructure::channel::EventSink;
use anyhow::Result;
use interprocess::local_socket::{
    traits::ListenerExt, GenericNamespaced, ListenerOptions, Stream as LocalStream, ToNsName,
};
use interprocess::TryClone;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WireCommand {
    RequestScan { intensity: ScanIntensity },
    Unregister,
    Ping,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WireEvent {
    ScanStarted {
        intensity: ScanIntensity,
    },
    ScanStopped,
    EnterRegion {
        device: String,
        rssi: i16,
        payload: Vec<u8>,
    },
    LeaveRegion {
        device: String,
    },
    ScanFailed {
        reason: ScanStartError,
    },
    Pong,
}

impl From<&ServiceEvent> for WireEvent {
    fn from(event: &ServiceEvent) -> Self {
        match event {
            ServiceEvent::ScanStarted { intensity } => Self::ScanStarted {
                intensity: *intensity,
            },
            ServiceEvent::ScanStopped => Self::ScanStopped,
            ServiceEvent::EnterRegion(record) => Self::EnterRegion {
                device: record.device().to_string(),
                rssi: record.rssi(),
                payload: record.payload().to_vec(),
            },
            ServiceEvent::LeaveRegion(device) => Self::LeaveRegion {
                device: device.to_string(),
            },
            ServiceEvent::ScanFailed(reason) => Self::ScanFailed { reason: *reason },
        }
    }
}

/// Events queued for one connection before the peer counts as unreachable.
const CONNECTION_QUEUE_CAPACITY: usize = 1024;

/// Sink for one connection; the writer thread drains the queue. A peer
/// that stops reading fills the queue and is dropped as unreachable.
struct ConnectionSink(mpsc::Sender<WireEvent>);

impl EventSink for ConnectionSink {
    fn deliver(&self, event: &ServiceEvent) -> Result<(), ObserverUnreachable> {
        self.0
            .try_send(WireEvent::from(event))
            .map_err(|_| ObserverUnreachable)
    }
}

/// Accept observer connections on `socket_name` until the listener fails.
pub fn run_ipc_worker(socket_name: &str, handle: ServiceHandle) -> Result<()> {
    let name = socket_name.to_ns_name::<GenericNamespaced>()?;
    let listener = ListenerOptions::new().name(name).create_sync()?;

    info!("Listening for observers on {}", socket_name);

    for conn in listener.incoming().filter_map(|x| x.ok()) {
        let handle = handle.clone();
        std::thread::spawn(move || {
            let observer = handle.next_observer_id();
            if let Err(e) = handle_connection(conn, observer, &handle) {
                error!("Observer {} connection error: {}", observer, e);
            }
            // Idempotent if the client already unregistered.
            let _ = handle.unregister(observer);
        });
    }

    Ok(())
}

fn handle_connection(stream: LocalStream, observer: ObserverId, handle: &ServiceHandle) -> Result<()> {
    info!("Observer {} connected", observer);
    let (tx, rx) = mpsc::channel(CONNECTION_QUEUE_CAPACITY);
    spawn_writer(stream.try_clone()?, rx, observer);

    handle.send(ServiceCommand::Register {
        observer,
        reply: Box::new(ConnectionSink(tx.clone())),
    })?;

    let mut reader = BufReader::new(stream);
    let mut buffer = Vec::new();
    loop {
        buffer.clear();
        if reader.read_until(b'\n', &mut buffer)? == 0 {
            info!("Observer {} disconnected", observer);
            break;
        }
        if buffer.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let command = match serde_json::from_slice::<WireCommand>(&buffer) {
            Ok(command) => command,
            Err(e) => {
                warn!("Observer {} sent an invalid command: {}", observer, e);
                continue;
            }
        };
        debug!("Observer {} command: {:?}", observer, command);
        match command {
            WireCommand::RequestScan { intensity } => handle.request_scan(observer, intensity)?,
            WireCommand::Unregister => {
                handle.unregister(observer)?;
                break;
            }
            WireCommand::Ping => {
                let _ = tx.try_send(WireEvent::Pong);
            }
        }
    }
    Ok(())
}

/// Write queued events as JSON lines. A failed write ends the thread, which
/// closes the queue so the service sees the observer as unreachable.
fn spawn_writer(
    mut stream: LocalStream,
    mut events: mpsc::Receiver<WireEvent>,
    observer: ObserverId,
) {
    std::thread::spawn(move || {
        while let Some(event) = events.blocking_recv() {
            let written = serde_json::to_string(&event)
                .map_err(anyhow::Error::from)
                .and_then(|json| {
                    stream.write_all((json + "\n").as_bytes())?;
                    stream.flush()?;
                    Ok(())
                });
            if let Err(e) = written {
                debug!("Observer {} write failed: {}", observer, e);
                break;
            }
        }
    });
}
