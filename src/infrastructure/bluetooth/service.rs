//! Session Service
//!
//! Owns the scan backend, the presence tracker, the scan arbiter and the
//! observer registrations. Commands, sightings and sweep ticks are handled
//! one at a time by the task running [`SessionService::run`], so the
//! tracker has a single writer and backend start/stop never race.

use crate::domain::arbiter::ScanArbiter;
use crate::domain::error::{CommandOnUnknownObserver, ServiceError};
use crate::domain::models::{
    AdvertisementRecord, ObserverId, PresenceTransition, ScanIntensity, ServiceEvent,
};
use crate::domain::presence::{PresenceConfig, PresenceTracker};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::scanner::{ScanBackend, ScanFilter, ScanHandle, SightingStream};
use crate::infrastructure::channel::EventSink;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Commands accepted from observers.
pub enum ServiceCommand {
    Register {
        observer: ObserverId,
        reply: Box<dyn EventSink>,
    },
    Unregister {
        observer: ObserverId,
    },
    RequestScan {
        observer: ObserverId,
        intensity: ScanIntensity,
    },
}

impl fmt::Debug for ServiceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Register { observer, .. } => write!(f, "Register({})", observer),
            Self::Unregister { observer } => write!(f, "Unregister({})", observer),
            Self::RequestScan {
                observer,
                intensity,
            } => write!(f, "RequestScan({}, {:?})", observer, intensity),
        }
    }
}

#[derive(Debug)]
pub(crate) enum Envelope {
    Command(ServiceCommand),
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub presence: PresenceConfig,
    pub sweep_interval: Duration,
    pub filter: ScanFilter,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            presence: PresenceConfig::default(),
            sweep_interval: Duration::from_secs(1),
            filter: ScanFilter::any(),
        }
    }
}

impl From<&Settings> for ServiceConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            presence: settings.presence_config(),
            sweep_interval: settings.sweep_interval(),
            filter: settings.scan_filter(),
        }
    }
}

/// Cloneable command endpoint of a running [`SessionService`].
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    inbox: mpsc::UnboundedSender<Envelope>,
    next_id: Arc<AtomicU64>,
}

impl ServiceHandle {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (inbox, rx) = mpsc::unbounded_channel();
        (
            Self {
                inbox,
                next_id: Arc::new(AtomicU64::new(1)),
            },
            rx,
        )
    }

    pub fn next_observer_id(&self) -> ObserverId {
        ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn send(&self, command: ServiceCommand) -> Result<(), ServiceError> {
        self.inbox
            .send(Envelope::Command(command))
            .map_err(|_| ServiceError::Stopped)
    }

    /// Register `reply` under a fresh observer id.
    pub fn register(&self, reply: impl EventSink + 'static) -> Result<ObserverId, ServiceError> {
        let observer = self.next_observer_id();
        self.send(ServiceCommand::Register {
            observer,
            reply: Box::new(reply),
        })?;
        Ok(observer)
    }

    /// Register an in-process observer and return its event receiver.
    pub fn subscribe(
        &self,
    ) -> Result<(ObserverId, mpsc::UnboundedReceiver<ServiceEvent>), ServiceError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let observer = self.register(tx)?;
        Ok((observer, rx))
    }

    pub fn unregister(&self, observer: ObserverId) -> Result<(), ServiceError> {
        self.send(ServiceCommand::Unregister { observer })
    }

    pub fn request_scan(
        &self,
        observer: ObserverId,
        intensity: ScanIntensity,
    ) -> Result<(), ServiceError> {
        self.send(ServiceCommand::RequestScan {
            observer,
            intensity,
        })
    }

    pub fn shutdown(&self) -> Result<(), ServiceError> {
        self.inbox
            .send(Envelope::Shutdown)
            .map_err(|_| ServiceError::Stopped)
    }
}

struct ActiveScan {
    handle: ScanHandle,
    intensity: ScanIntensity,
    sightings: SightingStream,
}

pub struct SessionService {
    config: ServiceConfig,
    backend: Box<dyn ScanBackend>,
    tracker: PresenceTracker,
    arbiter: ScanArbiter,
    observers: BTreeMap<ObserverId, Box<dyn EventSink>>,
    active: Option<ActiveScan>,
    unreachable: Vec<ObserverId>,
}

impl SessionService {
    pub fn new(config: ServiceConfig, backend: Box<dyn ScanBackend>) -> Self {
        let tracker = PresenceTracker::new(config.presence.clone());
        Self {
            config,
            backend,
            tracker,
            arbiter: ScanArbiter::new(),
            observers: BTreeMap::new(),
            active: None,
            unreachable: Vec::new(),
        }
    }

    /// Run the service on the current tokio runtime.
    pub fn spawn(config: ServiceConfig, backend: Box<dyn ScanBackend>) -> (ServiceHandle, JoinHandle<()>) {
        let (handle, inbox) = ServiceHandle::channel();
        let service = Self::new(config, backend);
        let task = tokio::spawn(service.run(inbox));
        (handle, task)
    }

    pub(crate) async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Envelope>) {
        info!("Session service started with {} backend", self.backend.name());
        let mut sweep_timer = tokio::time::interval(self.config.sweep_interval);
        sweep_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                envelope = inbox.recv() => match envelope {
                    Some(Envelope::Command(command)) => self.handle_command(command),
                    Some(Envelope::Shutdown) | None => break,
                },
                sighting = next_sighting(&mut self.active) => match sighting {
                    Some(record) => self.handle_sighting(record),
                    None => self.handle_stream_closed(),
                },
                _ = sweep_timer.tick() => self.sweep(Instant::now()),
            }
        }

        self.shutdown();
        info!("Session service stopped");
    }

    pub fn handle_command(&mut self, command: ServiceCommand) {
        debug!("Received command: {:?}", command);
        let result = match command {
            ServiceCommand::Register { observer, reply } => {
                self.register(observer, reply);
                Ok(())
            }
            ServiceCommand::Unregister { observer } => self.unregister(observer),
            ServiceCommand::RequestScan {
                observer,
                intensity,
            } => self.request_scan(observer, intensity),
        };
        if let Err(e) = result {
            debug!("Ignoring command: {}", e);
        }
        self.reap_unreachable();
    }

    pub fn handle_sighting(&mut self, record: AdvertisementRecord) {
        if self.active.is_none() {
            return;
        }
        let transitions = self.tracker.observe(record);
        self.publish(transitions);
        self.reap_unreachable();
    }

    pub fn sweep(&mut self, now: Instant) {
        let transitions = self.tracker.sweep(now);
        self.publish(transitions);
        self.reap_unreachable();
    }

    pub fn scan_intensity(&self) -> Option<ScanIntensity> {
        self.active.as_ref().map(|scan| scan.intensity)
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    pub fn is_registered(&self, observer: ObserverId) -> bool {
        self.observers.contains_key(&observer)
    }

    pub fn tracker(&self) -> &PresenceTracker {
        &self.tracker
    }

    fn register(&mut self, observer: ObserverId, reply: Box<dyn EventSink>) {
        if self.observers.contains_key(&observer) {
            debug!("Observer {} already registered", observer);
            return;
        }

        // Bring the newcomer up to date so its per-device stream starts with ENTER.
        let mut greeting = Vec::new();
        if let Some(intensity) = self.scan_intensity() {
            greeting.push(ServiceEvent::ScanStarted { intensity });
        }
        greeting.extend(self.tracker.in_region().into_iter().map(ServiceEvent::EnterRegion));
        for event in &greeting {
            if let Err(e) = reply.deliver(event) {
                debug!("Observer {} gone during registration: {}", observer, e);
                return;
            }
        }

        info!("Observer {} registered", observer);
        self.observers.insert(observer, reply);
    }

    fn unregister(&mut self, observer: ObserverId) -> Result<(), CommandOnUnknownObserver> {
        if self.observers.remove(&observer).is_none() {
            return Err(CommandOnUnknownObserver(observer));
        }
        info!("Observer {} unregistered", observer);
        self.arbiter.remove(observer);
        self.reconcile();
        if self.observers.is_empty() {
            self.tracker.clear();
        }
        Ok(())
    }

    fn request_scan(
        &mut self,
        observer: ObserverId,
        intensity: ScanIntensity,
    ) -> Result<(), CommandOnUnknownObserver> {
        if !self.observers.contains_key(&observer) {
            return Err(CommandOnUnknownObserver(observer));
        }
        debug!("Observer {} requests {:?}", observer, intensity);
        self.arbiter.set_demand(observer, intensity);
        self.reconcile();
        Ok(())
    }

    /// Bring the backend in line with the arbiter's aggregate intensity.
    fn reconcile(&mut self) {
        let target = self.arbiter.current_intensity();
        let running = self.scan_intensity();
        if running == Some(target) || (running.is_none() && target == ScanIntensity::Off) {
            return;
        }

        if let Some(scan) = self.active.take() {
            self.backend.stop_scan(scan.handle);
            if target == ScanIntensity::Off {
                info!("No scan demand left, scan stopped");
                self.broadcast(&ServiceEvent::ScanStopped);
                self.flush_presence();
                return;
            }
            info!("Restarting scan: {:?} -> {:?}", scan.intensity, target);
        }

        match self.backend.start_scan(&self.config.filter, target) {
            Ok((handle, sightings)) => {
                info!("Scan started at {:?}", target);
                self.active = Some(ActiveScan {
                    handle,
                    intensity: target,
                    sightings,
                });
                self.broadcast(&ServiceEvent::ScanStarted { intensity: target });
            }
            Err(e) => {
                warn!("Failed to start scan at {:?}: {}", target, e);
                self.flush_presence();
                self.broadcast(&ServiceEvent::ScanFailed(e));
            }
        }
    }

    fn handle_stream_closed(&mut self) {
        if let Some(scan) = self.active.take() {
            warn!("Scan backend ended the sighting stream");
            self.backend.stop_scan(scan.handle);
            self.broadcast(&ServiceEvent::ScanStopped);
            self.flush_presence();
            self.reap_unreachable();
        }
    }

    fn flush_presence(&mut self) {
        let transitions = self.tracker.flush();
        self.publish(transitions);
    }

    fn publish(&mut self, transitions: Vec<PresenceTransition>) {
        for transition in transitions {
            debug!("Presence transition: {:?}", transition);
            self.broadcast(&ServiceEvent::from(transition));
        }
    }

    fn broadcast(&mut self, event: &ServiceEvent) {
        for (observer, sink) in &self.observers {
            if sink.deliver(event).is_err() {
                self.unreachable.push(*observer);
            }
        }
    }

    /// Deregister every observer whose channel failed, retracting its demand.
    fn reap_unreachable(&mut self) {
        while let Some(observer) = self.unreachable.pop() {
            if self.observers.remove(&observer).is_some() {
                debug!("Observer {} unreachable, deregistered", observer);
                self.arbiter.remove(observer);
                self.reconcile();
            }
        }
        if self.observers.is_empty() {
            self.tracker.clear();
        }
    }

    fn shutdown(&mut self) {
        if let Some(scan) = self.active.take() {
            self.backend.stop_scan(scan.handle);
        }
        self.observers.clear();
        self.tracker.clear();
    }
}

async fn next_sighting(active: &mut Option<ActiveScan>) -> Option<AdvertisementRecord> {
    match active {
        Some(scan) => scan.sightings.recv().await,
        None => std::future::pending().await,
    }
}
