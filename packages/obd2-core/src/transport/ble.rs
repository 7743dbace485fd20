//! BLE transport for ELM327 dongles speaking GATT over a notify/write pair.
//!
//! btleplug is async end to end, while the rest of the driver is
//! synchronous. The transport bridges the two by running every GATT future
//! on a dedicated single-worker tokio runtime: synchronous calls block on
//! dispatched futures with a deadline, and a spawned task appends incoming
//! notification bytes to a mutex-guarded receive buffer that readers drain
//! with a short polling cadence.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use btleplug::api::{
    Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info};
use serde::Serialize;
use tokio::runtime::Runtime;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::transport::ByteTransport;

/// Service UUIDs used by common ELM327 BLE clones, searched ahead of any
/// other service when the caller does not name one.
pub const COMMON_SERVICE_UUIDS: [&str; 2] = [
    // Standard ELM327 BLE
    "0000fff0-0000-1000-8000-00805f9b34fb",
    // Vgate iCar Pro / IOS-Vlink
    "e7810a71-73ae-499d-8c15-faa9aef0c3f2",
];

/// Device-name fragments that identify OBD dongles during discovery.
const OBD_NAME_PATTERNS: [&str; 7] =
    ["vgate", "vlink", "obd", "elm", "icar", "v-link", "ios-vlink"];

/// Receive-buffer polling cadence for `read` and `read_until`.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How often the peripheral list is re-checked while scanning for the
/// configured address.
const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Connection settings for [`BleTransport`].
#[derive(Debug, Clone)]
pub struct BleConfig {
    /// BLE device address, e.g. `D2:E0:2F:8D:5C:6B`.
    pub address: String,
    /// Restrict characteristic discovery to this service.
    pub service_uuid: Option<Uuid>,
    /// Explicit notify characteristic, skipping discovery.
    pub notify_uuid: Option<Uuid>,
    /// Explicit write characteristic, skipping discovery.
    pub write_uuid: Option<Uuid>,
    /// Connection and read/write deadline.
    pub timeout: Duration,
}

impl BleConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            service_uuid: None,
            notify_uuid: None,
            write_uuid: None,
            timeout: Duration::from_secs(10),
        }
    }
}

/// A device seen during discovery.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredDevice {
    pub name: String,
    pub address: String,
}

struct BleLink {
    runtime: Runtime,
    peripheral: Peripheral,
    notify_char: Characteristic,
    write_char: Characteristic,
    write_type: WriteType,
}

/// GATT transport for ELM327-compatible BLE dongles.
pub struct BleTransport {
    config: BleConfig,
    rx_buffer: Arc<Mutex<Vec<u8>>>,
    link: Option<BleLink>,
}

impl BleTransport {
    pub fn new(config: BleConfig) -> Self {
        Self {
            config,
            rx_buffer: Arc::new(Mutex::new(Vec::new())),
            link: None,
        }
    }

    /// Scan for nearby BLE devices, optionally keeping only names containing
    /// `name_filter` (case-insensitive).
    pub fn discover_devices(
        timeout: Duration,
        name_filter: Option<&str>,
    ) -> Result<Vec<DiscoveredDevice>> {
        let devices = Self::scan(timeout)?;
        Ok(match name_filter {
            Some(filter) => {
                let filter = filter.to_lowercase();
                devices
                    .into_iter()
                    .filter(|d| d.name.to_lowercase().contains(&filter))
                    .collect()
            }
            None => devices,
        })
    }

    /// Scan for devices whose names look like OBD dongles.
    pub fn discover_obd_devices(timeout: Duration) -> Result<Vec<DiscoveredDevice>> {
        Ok(Self::scan(timeout)?
            .into_iter()
            .filter(|d| matches_obd_name(&d.name))
            .collect())
    }

    fn scan(timeout: Duration) -> Result<Vec<DiscoveredDevice>> {
        let runtime = new_runtime()?;
        runtime.block_on(async {
            let adapter = default_adapter().await?;
            adapter
                .start_scan(ScanFilter::default())
                .await
                .map_err(open_err)?;
            tokio::time::sleep(timeout).await;

            let mut devices = Vec::new();
            for peripheral in adapter.peripherals().await.map_err(open_err)? {
                let props = peripheral.properties().await.map_err(open_err)?;
                let name = props
                    .and_then(|p| p.local_name)
                    .unwrap_or_else(|| "Unknown".to_string());
                devices.push(DiscoveredDevice {
                    name,
                    address: peripheral.address().to_string(),
                });
            }
            let _ = adapter.stop_scan().await;
            Ok(devices)
        })
    }

    fn rx_lock(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        self.rx_buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ByteTransport for BleTransport {
    fn open(&mut self) -> Result<()> {
        if self.link.is_some() {
            return Ok(());
        }

        let runtime = new_runtime()?;
        info!("Connecting to BLE device {}", self.config.address);
        let (peripheral, notify_char, write_char, write_type) =
            runtime.block_on(connect(&self.config))?;
        debug!(
            "Using notify characteristic {} and write characteristic {}",
            notify_char.uuid, write_char.uuid
        );

        let mut notifications = match runtime.block_on(peripheral.notifications()) {
            Ok(stream) => stream,
            Err(e) => {
                let _ = runtime.block_on(peripheral.disconnect());
                return Err(open_err(e));
            }
        };

        // Pump notification bytes into the shared receive buffer. The task
        // ends when the stream closes or the runtime is dropped.
        let buffer = Arc::clone(&self.rx_buffer);
        let notify_uuid = notify_char.uuid;
        runtime.spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != notify_uuid {
                    continue;
                }
                buffer
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .extend_from_slice(&notification.value);
            }
        });

        self.link = Some(BleLink {
            runtime,
            peripheral,
            notify_char,
            write_char,
            write_type,
        });
        info!("BLE connection to {} established", self.config.address);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(link) = self.link.take() {
            let _ = link.runtime.block_on(async {
                let _ = link.peripheral.unsubscribe(&link.notify_char).await;
                link.peripheral.disconnect().await
            });
            // Dropping the runtime stops the notification task.
        }
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let timeout = self.config.timeout;
        let link = self
            .link
            .as_ref()
            .ok_or_else(|| Error::TransportWrite("BLE transport not open".into()))?;
        link.runtime.block_on(async {
            tokio::time::timeout(
                timeout,
                link.peripheral.write(&link.write_char, data, link.write_type),
            )
            .await
            .map_err(|_| Error::TransportTimeout("BLE write timed out".into()))?
            .map_err(|e| Error::TransportWrite(format!("BLE write failed: {e}")))
        })
    }

    fn read(&mut self, size: usize) -> Result<Vec<u8>> {
        if self.link.is_none() {
            return Err(Error::TransportRead("BLE transport not open".into()));
        }
        let deadline = Instant::now() + self.config.timeout;
        loop {
            {
                let mut buf = self.rx_lock();
                if buf.len() >= size {
                    return Ok(buf.drain(..size).collect());
                }
                if Instant::now() >= deadline {
                    if !buf.is_empty() {
                        return Ok(buf.drain(..).collect());
                    }
                    return Err(Error::TransportTimeout("BLE read timed out".into()));
                }
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn read_until(&mut self, terminator: &[u8], timeout: Option<Duration>) -> Result<Vec<u8>> {
        if self.link.is_none() {
            return Err(Error::TransportRead("BLE transport not open".into()));
        }
        let deadline = Instant::now() + timeout.unwrap_or(self.config.timeout);
        loop {
            {
                let mut buf = self.rx_lock();
                if let Some(data) = take_until(&mut buf, terminator) {
                    return Ok(data);
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::TransportTimeout("BLE read_until timed out".into()));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn flush_input(&mut self) -> Result<()> {
        self.rx_lock().clear();
        Ok(())
    }

    fn flush_output(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.link.is_some()
    }

    fn needs_delays(&self) -> bool {
        true
    }
}

fn new_runtime() -> Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .map_err(|e| Error::TransportOpen(format!("failed to start BLE worker: {e}")))
}

fn open_err(e: btleplug::Error) -> Error {
    Error::TransportOpen(format!("BLE error: {e}"))
}

async fn default_adapter() -> Result<Adapter> {
    let manager = Manager::new().await.map_err(open_err)?;
    let adapters = manager.adapters().await.map_err(open_err)?;
    adapters
        .into_iter()
        .next()
        .ok_or_else(|| Error::TransportOpen("no Bluetooth adapter available".into()))
}

async fn connect(
    config: &BleConfig,
) -> Result<(Peripheral, Characteristic, Characteristic, WriteType)> {
    let adapter = default_adapter().await?;
    let peripheral = find_peripheral(&adapter, &config.address, config.timeout).await?;

    tokio::time::timeout(config.timeout, peripheral.connect())
        .await
        .map_err(|_| Error::TransportOpen(format!("timed out connecting to {}", config.address)))?
        .map_err(open_err)?;

    match setup_characteristics(&peripheral, config).await {
        Ok((notify_char, write_char, write_type)) => {
            Ok((peripheral, notify_char, write_char, write_type))
        }
        Err(e) => {
            // Leave the link fully released after a partial open.
            let _ = peripheral.disconnect().await;
            Err(e)
        }
    }
}

async fn find_peripheral(adapter: &Adapter, address: &str, timeout: Duration) -> Result<Peripheral> {
    adapter
        .start_scan(ScanFilter::default())
        .await
        .map_err(open_err)?;
    let deadline = Instant::now() + timeout;

    let peripheral = loop {
        let mut matched = None;
        for peripheral in adapter.peripherals().await.map_err(open_err)? {
            if peripheral.address().to_string().eq_ignore_ascii_case(address)
                || peripheral.id().to_string() == address
            {
                matched = Some(peripheral);
                break;
            }
        }
        if let Some(peripheral) = matched {
            break peripheral;
        }
        if Instant::now() >= deadline {
            let _ = adapter.stop_scan().await;
            return Err(Error::TransportOpen(format!(
                "BLE device {address} not found"
            )));
        }
        tokio::time::sleep(SCAN_POLL_INTERVAL).await;
    };

    let _ = adapter.stop_scan().await;
    Ok(peripheral)
}

async fn setup_characteristics(
    peripheral: &Peripheral,
    config: &BleConfig,
) -> Result<(Characteristic, Characteristic, WriteType)> {
    peripheral.discover_services().await.map_err(open_err)?;

    let (notify_char, write_char) = select_characteristics(peripheral, config)?;

    let write_type = if write_char
        .properties
        .contains(CharPropFlags::WRITE_WITHOUT_RESPONSE)
    {
        WriteType::WithoutResponse
    } else {
        WriteType::WithResponse
    };

    peripheral.subscribe(&notify_char).await.map_err(open_err)?;
    Ok((notify_char, write_char, write_type))
}

/// Pick the notify and write characteristics: caller-supplied UUIDs win,
/// otherwise the first characteristic with the right properties, searching
/// the well-known ELM327 services before any others.
fn select_characteristics(
    peripheral: &Peripheral,
    config: &BleConfig,
) -> Result<(Characteristic, Characteristic)> {
    let hints: Vec<Uuid> = COMMON_SERVICE_UUIDS
        .iter()
        .filter_map(|s| Uuid::parse_str(s).ok())
        .collect();

    let mut services: Vec<_> = peripheral.services().into_iter().collect();
    services.sort_by_key(|s| usize::from(!hints.contains(&s.uuid)));

    let mut candidates = Vec::new();
    for service in services {
        if let Some(service_uuid) = config.service_uuid {
            if service.uuid != service_uuid {
                continue;
            }
        }
        candidates.extend(service.characteristics);
    }

    let notify_char = pick_characteristic(
        &candidates,
        config.notify_uuid,
        CharPropFlags::NOTIFY | CharPropFlags::INDICATE,
    )
    .ok_or_else(|| Error::TransportOpen("no notify characteristic found".into()))?;
    let write_char = pick_characteristic(
        &candidates,
        config.write_uuid,
        CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE,
    )
    .ok_or_else(|| Error::TransportOpen("no write characteristic found".into()))?;

    Ok((notify_char, write_char))
}

fn pick_characteristic(
    candidates: &[Characteristic],
    explicit: Option<Uuid>,
    wanted: CharPropFlags,
) -> Option<Characteristic> {
    match explicit {
        Some(uuid) => candidates.iter().find(|c| c.uuid == uuid).cloned(),
        None => candidates
            .iter()
            .find(|c| c.properties.intersects(wanted))
            .cloned(),
    }
}

/// Split off and return the buffer prefix through the first occurrence of
/// `terminator`, leaving the remainder in place.
fn take_until(buffer: &mut Vec<u8>, terminator: &[u8]) -> Option<Vec<u8>> {
    if terminator.is_empty() {
        return None;
    }
    let pos = buffer
        .windows(terminator.len())
        .position(|window| window == terminator)?;
    let rest = buffer.split_off(pos + terminator.len());
    Some(std::mem::replace(buffer, rest))
}

fn matches_obd_name(name: &str) -> bool {
    let name = name.to_lowercase();
    OBD_NAME_PATTERNS.iter().any(|p| name.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_until_splits_at_the_terminator() {
        let mut buffer = b"OK\r\r>41 0C".to_vec();
        let data = take_until(&mut buffer, b">").unwrap();
        assert_eq!(data, b"OK\r\r>");
        assert_eq!(buffer, b"41 0C");
    }

    #[test]
    fn take_until_leaves_partial_data_in_place() {
        let mut buffer = b"SEARCHING...".to_vec();
        assert!(take_until(&mut buffer, b">").is_none());
        assert_eq!(buffer, b"SEARCHING...");
    }

    #[test]
    fn take_until_handles_multi_byte_terminators() {
        let mut buffer = b"abc\r\ndef".to_vec();
        let data = take_until(&mut buffer, b"\r\n").unwrap();
        assert_eq!(data, b"abc\r\n");
        assert_eq!(buffer, b"def");
    }

    #[test]
    fn obd_name_patterns_match_known_dongles() {
        assert!(matches_obd_name("IOS-Vlink"));
        assert!(matches_obd_name("Vgate iCar Pro"));
        assert!(matches_obd_name("OBDII"));
        assert!(matches_obd_name("ELM327 v1.5"));
        assert!(!matches_obd_name("JBL Flip 5"));
    }

    #[test]
    fn config_defaults_to_ten_second_timeout() {
        let config = BleConfig::new("D2:E0:2F:8D:5C:6B");
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert!(config.service_uuid.is_none());
        assert!(config.notify_uuid.is_none());
        assert!(config.write_uuid.is_none());
    }

    #[test]
    fn operations_fail_cleanly_when_closed() {
        let mut transport = BleTransport::new(BleConfig::new("AA:BB:CC:DD:EE:FF"));
        assert!(!transport.is_open());
        assert!(matches!(transport.read(1), Err(Error::TransportRead(_))));
        assert!(matches!(
            transport.read_until(b">", None),
            Err(Error::TransportRead(_))
        ));
        assert!(matches!(
            transport.write(b"ATZ\r"),
            Err(Error::TransportWrite(_))
        ));
        // Closing a transport that never opened is a no-op.
        assert!(transport.close().is_ok());
        assert!(transport.flush_input().is_ok());
    }
}
