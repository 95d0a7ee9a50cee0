// Connection check: open the adapter, ping each motor, report and disconnect
use std::path::PathBuf;

use clap::Parser;
use robstride_bus::config::ControllerConfig;
use robstride_bus::motor::{Controller, Device, ParameterIndex};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "robstride", about = "Check RobStride motors behind a USB-CAN adapter")]
struct Args {
    /// Serial port of the adapter (e.g. /dev/ttyUSB0, COM6)
    #[arg(short, long, required_unless_present = "config")]
    port: Option<String>,

    /// Motor CAN id to check (repeatable)
    #[arg(short, long = "id")]
    ids: Vec<u8>,

    /// Serial baud rate [default: 921600]
    #[arg(short, long)]
    baud: Option<u32>,

    /// CAN id of this host [default: 253]
    #[arg(long)]
    host_id: Option<u8>,

    /// JSON controller config; values given on the command line override it
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl Args {
    fn into_config(self) -> Result<ControllerConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => ControllerConfig::from_file(path)?,
            None => ControllerConfig::new(String::new(), Vec::new()),
        };
        if let Some(baud) = self.baud {
            config.baudrate = baud;
        }
        if let Some(host_id) = self.host_id {
            config.host_id = host_id;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if !self.ids.is_empty() {
            config.devices = self.ids.into_iter().map(Device::new).collect();
        }
        // Ping explicitly below so every motor gets reported
        config.verify_on_connect = false;
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    if let Err(e) = run(Args::parse()).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.into_config()?;
    if config.devices.is_empty() {
        return Err("no motor ids given (use --id or a config file)".into());
    }

    let session = Controller::serial(config).into_session().await?;
    let total = session.device_ids().len();
    let mut missing = 0;
    for id in session.device_ids() {
        match session.ping(id).await {
            Ok(uid) => {
                let mode = session
                    .read_parameter(id, ParameterIndex::RunMode)
                    .await
                    .map(|mode| mode.to_string())
                    .unwrap_or_else(|e| format!("unreadable ({})", e));
                println!("motor {:3}  mcu {:016X}  run mode {}", id, uid, mode);
            }
            Err(e) => {
                warn!("Motor {} did not answer: {}", id, e);
                println!("motor {:3}  no response", id);
                missing += 1;
            }
        }
    }

    let report = session.close().await;
    if !report.is_clean() {
        warn!("Shutdown reported errors: {:?}", report);
    }
    info!("{} of {} motors responded", total - missing, total);

    if missing > 0 {
        return Err(format!("{} motor(s) did not respond", missing).into());
    }
    Ok(())
}
