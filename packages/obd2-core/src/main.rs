use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use serde::Serialize;
use uuid::Uuid;

use obd2_core::config;
use obd2_core::transport::{BleConfig, BleTransport, SerialTransport};
use obd2_core::{ByteTransport, Elm327, UdsResponse};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan for BLE OBD adapters
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value_t = 10)]
        timeout: u64,

        /// List every BLE device instead of only OBD-looking ones
        #[arg(short, long)]
        all: bool,
    },
    /// Send one diagnostic request and print the decoded response
    Query {
        /// BLE device address (overrides config.toml)
        #[arg(short, long)]
        address: Option<String>,

        /// Serial port to use instead of BLE
        #[arg(short, long)]
        port: Option<String>,

        /// Target CAN id for UDS requests, hex (e.g. 7E4)
        #[arg(short, long, value_parser = parse_hex_u16)]
        can_id: Option<u16>,

        /// Request code, hex: a packed UDS request (e.g. 220101) or, without
        /// a CAN id, an OBD-II Mode 01 PID (e.g. 0C)
        #[arg(value_parser = parse_hex_u32)]
        request: u32,
    },
}

#[derive(Debug, Serialize)]
struct QueryReport {
    timestamp: String,
    service_id: String,
    data_identifier: Option<String>,
    payload: String,
}

impl QueryReport {
    fn new(response: &UdsResponse) -> Self {
        Self {
            timestamp: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            service_id: format!("{:02X}", response.service_id),
            data_identifier: response.data_identifier.map(|did| format!("{did:04X}")),
            payload: hex::encode_upper(&response.payload),
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Warn)
            .init();
    }

    match args.command {
        Command::Scan { timeout, all } => scan(Duration::from_secs(timeout), all),
        Command::Query {
            address,
            port,
            can_id,
            request,
        } => query(address, port, can_id, request),
    }
}

fn scan(timeout: Duration, all: bool) -> Result<()> {
    info!("Scanning for BLE devices for {timeout:?}");

    let devices = if all {
        BleTransport::discover_devices(timeout, None)?
    } else {
        BleTransport::discover_obd_devices(timeout)?
    };

    if devices.is_empty() {
        bail!("no matching BLE devices found");
    }

    println!("{}", serde_json::to_string_pretty(&devices)?);
    Ok(())
}

fn query(
    address: Option<String>,
    port: Option<String>,
    can_id: Option<u16>,
    request: u32,
) -> Result<()> {
    let config = config::load_config()?;
    let adapter = config.adapter;

    if let Some(port) = port.or_else(|| adapter.port.clone()) {
        let transport =
            SerialTransport::new(port, adapter.baud_rate).with_timeout(adapter.timeout());
        return run_query(transport, can_id, request);
    }

    let Some(address) = address.or_else(|| adapter.address.clone()) else {
        bail!("no adapter address configured; pass --address or set it in config.toml");
    };

    let mut ble = BleConfig::new(address);
    ble.timeout = adapter.timeout();
    ble.service_uuid = parse_uuid(adapter.service_uuid.as_deref())?;
    ble.notify_uuid = parse_uuid(adapter.notify_uuid.as_deref())?;
    ble.write_uuid = parse_uuid(adapter.write_uuid.as_deref())?;
    run_query(BleTransport::new(ble), can_id, request)
}

fn run_query<T: ByteTransport + 'static>(
    mut transport: T,
    can_id: Option<u16>,
    request: u32,
) -> Result<()> {
    transport.open()?;

    let mut elm = Elm327::new(transport);
    elm.initialize()?;
    let result = elm.send_message(can_id, request);
    elm.close()?;

    let response = result?;
    info!("Decoded response: {response}");
    println!("{}", serde_json::to_string_pretty(&QueryReport::new(&response))?);
    Ok(())
}

fn parse_uuid(value: Option<&str>) -> Result<Option<Uuid>> {
    value
        .map(|s| Uuid::parse_str(s).with_context(|| format!("invalid UUID {s:?}")))
        .transpose()
}

fn parse_hex_u16(s: &str) -> std::result::Result<u16, String> {
    u16::from_str_radix(s.trim_start_matches("0x"), 16)
        .map_err(|e| format!("invalid hex value {s:?}: {e}"))
}

fn parse_hex_u32(s: &str) -> std::result::Result<u32, String> {
    u32::from_str_radix(s.trim_start_matches("0x"), 16)
        .map_err(|e| format!("invalid hex value {s:?}: {e}"))
}
