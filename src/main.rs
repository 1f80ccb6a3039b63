use anyhow::{Context, Result};
use beacon_presence::domain::settings::{Settings, SettingsService};
use beacon_presence::infrastructure::bluetooth::legacy::LegacyBackend;
use beacon_presence::infrastructure::logging::init_logger;
use beacon_presence::ipc_client::IpcClient;
use beacon_presence::ipc_worker::run_ipc_worker;
use beacon_presence::{ScanBackend, ScanIntensity, ServiceConfig, SessionService};
use std::time::Duration;
use tracing::{error, info};

fn main() -> Result<()> {
    let settings_service = SettingsService::new()?;
    let settings = settings_service.get().clone();

    let _logging_guard = init_logger(&settings.log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    if std::env::args().any(|arg| arg == "--observe") {
        run_observer(&settings)
    } else {
        run_service(&settings)
    }
}

#[cfg(windows)]
fn build_backend(settings: &Settings) -> Box<dyn ScanBackend> {
    use beacon_presence::infrastructure::bluetooth::winrt::WinRtPlatform;
    Box::new(LegacyBackend::new(
        WinRtPlatform::new(),
        settings.legacy_dedup_window(),
    ))
}

#[cfg(not(windows))]
fn build_backend(settings: &Settings) -> Box<dyn ScanBackend> {
    use beacon_presence::infrastructure::bluetooth::replay::ReplayPlatform;
    Box::new(LegacyBackend::new(
        ReplayPlatform::stdin(),
        settings.legacy_dedup_window(),
    ))
}

/// Host the session service and the observer socket until Ctrl-C.
fn run_service(settings: &Settings) -> Result<()> {
    info!("Starting beacon presence service");
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    rt.block_on(async {
        let (handle, task) =
            SessionService::spawn(ServiceConfig::from(settings), build_backend(settings));

        let ipc_handle = handle.clone();
        let socket_name = settings.ipc_socket_name.clone();
        std::thread::spawn(move || {
            if let Err(e) = run_ipc_worker(&socket_name, ipc_handle) {
                error!("Observer socket failed: {}", e);
            }
        });

        tokio::signal::ctrl_c().await?;
        info!("Shutting down");
        handle.shutdown()?;
        task.await?;
        Ok::<_, anyhow::Error>(())
    })
}

/// Connect as an observer, request an active scan and print events.
fn run_observer(settings: &Settings) -> Result<()> {
    let mut client =
        IpcClient::wait_for_service(&settings.ipc_socket_name, Duration::from_secs(5))?;
    client.request_scan(ScanIntensity::Active)?;
    while let Some(event) = client.next_event()? {
        println!("{}", serde_json::to_string(&event)?);
    }
    info!("Service closed the connection");
    Ok(())
}
