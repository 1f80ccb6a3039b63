use crate::domain::models::ScanIntensity;
use crate::ipc_worker::{WireCommand, WireEvent};
use anyhow::{Context, Result};
use interprocess::local_socket::{
    traits::Stream, GenericNamespaced, Stream as LocalStream, ToNsName,
};
use interprocess::TryClone;
use std::io::{BufRead, BufReader, Write};
use std::time::{Duration, Instant};
use tracing::info;

/// Blocking observer connected to a running service over the local socket.
pub struct IpcClient {
    writer: LocalStream,
    reader: BufReader<LocalStream>,
}

impl IpcClient {
    /// Connect to the service; registration happens on connect.
    pub fn connect(socket_name: &str) -> Result<Self> {
        let name = socket_name.to_ns_name::<GenericNamespaced>()?;
        let writer = LocalStream::connect(name)
            .with_context(|| format!("Service not reachable on {}", socket_name))?;
        let reader = BufReader::new(writer.try_clone()?);
        info!("Connected to presence service on {}", socket_name);
        Ok(Self { writer, reader })
    }

    /// Poll until the service accepts connections or `timeout` passes.
    pub fn wait_for_service(socket_name: &str, timeout: Duration) -> Result<Self> {
        let start = Instant::now();
        loop {
            match Self::connect(socket_name) {
                Ok(client) => return Ok(client),
                Err(e) if start.elapsed() >= timeout => return Err(e),
                Err(_) => std::thread::sleep(Duration::from_millis(200)),
            }
        }
    }

    pub fn send(&mut self, command: &WireCommand) -> Result<()> {
        let json = serde_json::to_string(command)? + "\n";
        self.send_raw(json.as_bytes())
    }

    /// Write bytes to the service as-is; callers supply the line ending.
    pub fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn request_scan(&mut self, intensity: ScanIntensity) -> Result<()> {
        self.send(&WireCommand::RequestScan { intensity })
    }

    pub fn ping(&mut self) -> Result<()> {
        self.send(&WireCommand::Ping)
    }

    /// Unregister and close the connection.
    pub fn unregister(mut self) -> Result<()> {
        self.send(&WireCommand::Unregister)
    }

    /// Block until the next event; `None` once the service hung up.
    pub fn next_event(&mut self) -> Result<Option<WireEvent>> {
        let mut buffer = String::new();
        if self.reader.read_line(&mut buffer)? == 0 {
            return Ok(None);
        }
        let event = serde_json::from_str(&buffer).context("Malformed event from service")?;
        Ok(Some(event))
    }
}
