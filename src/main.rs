use clap::Parser;
use serde::Serialize;
use serial_command_channel::config::{parse_usb_id, Config, ConfigLoader, LogFormat};
use serial_command_channel::port::list_usb_ports;
use serial_command_channel::{
    ChannelEvent, ChannelObserver, ChannelOrchestrator, Command, CommandReceiver, DeviceIdentity,
    DispatchOutcome, EventSender, OrchestratorConfig, SerialportTransport,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// Command-line arguments
#[derive(Parser, Debug)]
#[command(
    version,
    about = "Listens to a USB hardware controller and forwards its button commands.",
    long_about = "Watches for the controller, opens it when it is attached, and turns each \
                  newline-terminated command (CAPTURE, UV, RGB) into a camera action. \
                  Without a camera attached the actions are logged."
)]
struct Args {
    /// Path to a configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// USB vendor ID of the controller (hex, e.g. 1209 or 0x1209).
    #[arg(long, value_parser = parse_usb_id)]
    vendor_id: Option<u16>,

    /// USB product ID of the controller (hex).
    #[arg(long, value_parser = parse_usb_id)]
    product_id: Option<u16>,

    /// List attached USB serial devices and exit.
    #[arg(short, long)]
    list: bool,

    /// Print the device list as JSON.
    #[arg(long, requires = "list")]
    json: bool,

    /// Log level (overrides the configuration; RUST_LOG overrides both).
    #[arg(long)]
    log_level: Option<String>,
}

/// Stands in for the camera: logs every action and accepts it.
#[derive(Debug, Default)]
struct LoggingReceiver;

impl CommandReceiver for LoggingReceiver {
    fn trigger_capture(&mut self) -> bool {
        info!("Capture triggered");
        true
    }

    fn switch_to_normal_mode(&mut self) -> bool {
        info!("Switched to normal (RGB) mode");
        true
    }

    fn switch_to_fluorescence_mode(&mut self) -> bool {
        info!("Switched to fluorescence (UV) mode");
        true
    }

    fn is_guided_session_active(&self) -> bool {
        false
    }
}

#[derive(Debug, Default)]
struct LoggingObserver;

impl ChannelObserver for LoggingObserver {
    fn on_connection_state_changed(&mut self, connected: bool) {
        if connected {
            info!("Controller connected");
        } else {
            info!("Controller disconnected");
        }
    }

    fn on_command_dispatched(&mut self, command: &Command, outcome: &DispatchOutcome) {
        info!(command = %command.kind(), raw = command.raw_text(), %outcome, "Command handled");
    }
}

#[derive(Serialize)]
struct ListedDevice<'a> {
    #[serde(flatten)]
    device: &'a DeviceIdentity,
    is_target: bool,
}

// --- Main Application Entry Point ---
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let loader = match &args.config {
        Some(path) => ConfigLoader::load_from(path)?,
        None => ConfigLoader::load()?,
    };
    let config_path = loader.config_path.clone();
    let mut config = loader.into_config();
    if let Some(vendor_id) = args.vendor_id {
        config.device.vendor_id = vendor_id;
    }
    if let Some(product_id) = args.product_id {
        config.device.product_id = product_id;
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }

    init_tracing(&config);
    match &config_path {
        Some(path) => info!(path = %path.display(), "Loaded configuration"),
        None => info!("Using built-in configuration"),
    }

    if args.list {
        return list_devices(&config, args.json);
    }

    let transport = Arc::new(SerialportTransport::new(config.serial.hotplug_poll_interval()));
    let mut channel = ChannelOrchestrator::new(
        transport,
        Box::new(LoggingReceiver),
        Box::new(LoggingObserver),
        OrchestratorConfig::from(&config),
    );

    tokio::spawn(forward_shutdown(channel.event_sender()));

    let result = tokio::task::spawn_blocking(move || {
        let started = channel.start();
        if started.is_ok() {
            channel.run_until_shutdown();
        }
        channel.destroy();
        started
    })
    .await?;

    result?;
    info!("Stopped");
    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match config.logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Compact => builder.compact().init(),
    }
}

fn list_devices(config: &Config, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let target = config.device.target();
    let devices = list_usb_ports()?;

    if json {
        let listed: Vec<ListedDevice<'_>> = devices
            .iter()
            .map(|device| ListedDevice {
                device,
                is_target: device.matches(target),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&listed)?);
        return Ok(());
    }

    if devices.is_empty() {
        println!("No USB serial devices found.");
    }
    for device in &devices {
        let marker = if device.matches(target) { "*" } else { " " };
        let product = device.product.as_deref().unwrap_or("");
        println!("{} {} {}", marker, device, product);
    }
    Ok(())
}

// --- Graceful Shutdown Handler ---
async fn forward_shutdown(events: EventSender) {
    shutdown_signal().await;
    if events.send(ChannelEvent::Shutdown).is_err() {
        warn!("Event loop already stopped");
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Signal received, shutting down");
}
