use anyhow::Context;
use ble_notify_client::domain::models::AppEvent;
use ble_notify_client::domain::responder::CommandResponder;
use ble_notify_client::domain::settings::SettingsService;
use ble_notify_client::infrastructure::bluetooth::{ClientSession, ZbusTransport};
use ble_notify_client::infrastructure::logging;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::new()?;
    if !settings_service.path().exists() {
        settings_service.save()?;
    }

    let _logging_guard = logging::init_logger(&settings_service.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!("Starting BLE notify client");
    info!("Settings loaded from {}", settings_service.path().display());

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    rt.block_on(run(settings_service))
}

async fn run(settings_service: SettingsService) -> anyhow::Result<()> {
    let settings = settings_service.get().clone();
    let (bus_tx, mut bus_rx) = mpsc::unbounded_channel();
    let (app_tx, mut app_rx) = mpsc::unbounded_channel();

    let transport = ZbusTransport::system(bus_tx)
        .await
        .context("Failed to connect to the system bus")?;
    let mut session = ClientSession::new(transport, settings.ble.clone(), app_tx);
    session.set_change_callback(|interface, name, value| {
        tracing::debug!("{} {} = {}", interface, name, value.as_i8());
    });
    session.initialize()?;

    let mut responder = CommandResponder::new(settings.command_palette, settings.notification_limit);

    loop {
        tokio::select! {
            Some(event) = bus_rx.recv() => session.dispatch(event),
            Some(event) = app_rx.recv() => match event {
                AppEvent::Ready => info!("Session ready"),
                AppEvent::StateChanged(state) => info!("State: {}", state),
                AppEvent::ChannelOpened { mtu } => info!("Notifications enabled (MTU {})", mtu),
                AppEvent::ChannelClosed => warn!("Notification channel closed"),
                AppEvent::Notification(value) => {
                    info!("Received notification: {}", value);
                    let response = responder.on_notification(value);
                    if let Some(command) = response.write {
                        info!("Writing command {:#010X}", command);
                        if let Err(e) = session.write_command(command) {
                            error!("Failed to write command: {}", e);
                        }
                    }
                    if response.shutdown {
                        info!("Received {} notifications, exiting", responder.received());
                        break;
                    }
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            else => break,
        }
    }

    session.shutdown();
    Ok(())
}
