// src/main.rs
//
// Command-line front end: list serial ports and drivers, discover devices,
// and listen on a configured connection printing frames until Ctrl-C.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use wirestream_lib::config::{AppConfig, ConfigError};
use wirestream_lib::io::serial::list_ports;
use wirestream_lib::io::{BusType, IoError, ManagerError};
use wirestream_lib::logging::{init_logging, LogFormat, LogLevel, LoggingConfig};
use wirestream_lib::{ConnectionManager, Context, IoEvent};

#[derive(Parser, Debug)]
#[command(name = "wirestream", version, about = "Serial, TCP/UDP and BLE frame listener")]
struct Cli {
    /// Log output format
    #[arg(long, value_name = "FORMAT", global = true)]
    log_format: Option<LogFormat>,

    /// Minimum log level
    #[arg(long, value_name = "LEVEL", global = true)]
    log_level: Option<LogLevel>,

    /// Write logs to a timestamped file in this directory instead of stderr
    #[arg(long, value_name = "DIR", global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List serial ports
    Ports,
    /// Show the available transport drivers
    Drivers,
    /// Discover devices for one transport
    Devices {
        #[arg(value_enum)]
        bus: BusArg,
    },
    /// Connect and print frames until Ctrl-C
    Listen {
        /// TOML (or .json) configuration file
        #[arg(long, short)]
        config: PathBuf,

        /// Print frame payloads as hex instead of text
        #[arg(long)]
        hex: bool,

        /// Hex bytes to write once connected
        #[arg(long, value_name = "HEX")]
        send: Option<String>,
    },
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum BusArg {
    Uart,
    Network,
    Ble,
}

impl From<BusArg> for BusType {
    fn from(bus: BusArg) -> Self {
        match bus {
            BusArg::Uart => BusType::Uart,
            BusArg::Network => BusType::Network,
            BusArg::Ble => BusType::BluetoothLe,
        }
    }
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error(transparent)]
    Io(#[from] IoError),
    #[error("invalid hex payload: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("failed to start logging: {0}")]
    Logging(std::io::Error),
}

impl Cli {
    /// Command-line options take precedence over the config file
    fn logging(&self, base: LoggingConfig) -> LoggingConfig {
        LoggingConfig {
            format: self.log_format.unwrap_or(base.format),
            level: self.log_level.unwrap_or(base.level),
            directory: self.log_dir.clone().or(base.directory),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    match &cli.command {
        Command::Ports => {
            init_logging(&cli.logging(LoggingConfig::default())).map_err(CliError::Logging)?;
            print_ports()
        }
        Command::Drivers => {
            init_logging(&cli.logging(LoggingConfig::default())).map_err(CliError::Logging)?;
            print_drivers();
            Ok(())
        }
        Command::Devices { bus } => {
            init_logging(&cli.logging(LoggingConfig::default())).map_err(CliError::Logging)?;
            print_devices((*bus).into()).await
        }
        Command::Listen { config, hex, send } => {
            let app = AppConfig::load(config)?;
            init_logging(&cli.logging(app.logging.clone())).map_err(CliError::Logging)?;
            let payload = send.as_deref().map(hex::decode).transpose()?;
            listen(app, *hex, payload).await
        }
    }
}

fn print_ports() -> Result<(), CliError> {
    let ports = list_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        let usb = match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => format!(" {:04x}:{:04x}", vid, pid),
            _ => String::new(),
        };
        println!(
            "{:<24} {:<10}{} {}",
            port.port_name,
            port.port_type,
            usb,
            port.manufacturer.unwrap_or_default()
        );
    }
    Ok(())
}

fn print_drivers() {
    let ctx = Context::default();
    for driver in ctx.factory().all_drivers() {
        let f = &driver.features;
        println!(
            "{:<13} {:<24} supported={} bidirectional={} discovery={} reconnection={} multiple={}",
            driver.bus_type.as_str(),
            driver.name,
            driver.supported,
            f.bidirectional,
            f.discovery,
            f.reconnection,
            f.multiple_connections
        );
    }
}

async fn print_devices(bus: BusType) -> Result<(), CliError> {
    let ctx = Context::default();
    let devices = ctx.factory().discover_devices(bus).await?;
    if devices.is_empty() {
        println!("No {} devices found", bus);
    }
    for device in devices {
        println!(
            "{:<40} {} {}",
            device.id,
            device.name,
            device.details.unwrap_or_default()
        );
    }
    Ok(())
}

fn format_time(timestamp_ms: u64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms as i64)
        .map(|t| {
            t.with_timezone(&chrono::Local)
                .format("%H:%M:%S%.3f")
                .to_string()
        })
        .unwrap_or_else(|| timestamp_ms.to_string())
}

async fn listen(app: AppConfig, as_hex: bool, payload: Option<Vec<u8>>) -> Result<(), CliError> {
    let ctx = Context::new(app.context_config());
    let manager = ConnectionManager::new(&ctx);
    let mut events = manager.subscribe();

    info!("[listen] Connecting to {}", app.device.describe());
    if let Err(e) = manager.connect(app.device.clone()).await {
        manager.destroy().await;
        return Err(e.into());
    }

    if let Some(payload) = payload {
        match manager.write_data(&payload).await {
            Ok(n) => info!("[listen] Sent {} byte(s)", n),
            Err(e) => warn!("[listen] Send failed: {}", e),
        }
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("[listen] Interrupted");
                break;
            }
            event = events.recv() => match event {
                Ok(IoEvent::FrameReceived(frame)) => {
                    let payload = if as_hex {
                        hex::encode_upper(&frame.data)
                    } else {
                        String::from_utf8_lossy(&frame.data).into_owned()
                    };
                    println!("{} #{} {}", format_time(frame.timestamp), frame.sequence, payload);
                }
                Ok(IoEvent::StateChanged(state)) => info!("[listen] State: {:?}", state),
                Ok(IoEvent::StatisticsUpdated(stats)) => info!(
                    "[listen] rx {} B / {} frames, tx {} B, errors {}, reconnects {}, up {}s",
                    stats.bytes_received,
                    stats.frames_received,
                    stats.bytes_sent,
                    stats.errors,
                    stats.reconnections,
                    Duration::from_millis(stats.uptime_ms).as_secs()
                ),
                Ok(IoEvent::Error(message)) => error!("[listen] {}", message),
                Ok(IoEvent::Warning(message)) => warn!("[listen] {}", message),
                Ok(IoEvent::RawDataReceived { .. }) => {}
                Err(RecvError::Lagged(n)) => warn!("[listen] Skipped {} event(s)", n),
                Err(RecvError::Closed) => break,
            }
        }
    }

    manager.destroy().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_listen() {
        let cli = Cli::try_parse_from([
            "wirestream",
            "listen",
            "--config",
            "device.toml",
            "--hex",
            "--log-level",
            "debug",
        ])
        .unwrap();
        match &cli.command {
            Command::Listen { config, hex, send } => {
                assert_eq!(config, &PathBuf::from("device.toml"));
                assert!(*hex);
                assert!(send.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }

        let logging = cli.logging(LoggingConfig::default());
        assert_eq!(logging.level, LogLevel::Debug);
        assert_eq!(logging.format, LogFormat::Text);
    }

    #[test]
    fn test_parses_devices_bus() {
        let cli = Cli::try_parse_from(["wirestream", "devices", "ble"]).unwrap();
        match cli.command {
            Command::Devices { bus } => assert_eq!(BusType::from(bus), BusType::BluetoothLe),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_format_time() {
        assert_eq!(format_time(0).len(), "00:00:00.000".len());
    }
}
