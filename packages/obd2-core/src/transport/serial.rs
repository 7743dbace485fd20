//! Serial-port transport for wired ELM327 adapters.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use log::info;
use serialport::{ClearBuffer, SerialPort};

use crate::error::{Error, Result};
use crate::transport::ByteTransport;

/// Byte channel over a serial port, for USB and RFCOMM-bridged adapters.
pub struct SerialTransport {
    port_name: String,
    baud_rate: u32,
    timeout: Duration,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            timeout: Duration::from_secs(1),
            port: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Names of the serial ports present on this system.
    pub fn list_ports() -> Result<Vec<String>> {
        let ports = serialport::available_ports()
            .map_err(|e| Error::TransportOpen(format!("failed to enumerate serial ports: {e}")))?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| Error::TransportRead("serial port not open".into()))
    }
}

impl ByteTransport for SerialTransport {
    fn open(&mut self) -> Result<()> {
        if self.port.is_some() {
            return Ok(());
        }
        info!(
            "Opening serial port {} at {} baud",
            self.port_name, self.baud_rate
        );
        let port = serialport::new(self.port_name.clone(), self.baud_rate)
            .timeout(self.timeout)
            .open()
            .map_err(|e| Error::TransportOpen(format!("failed to open {}: {e}", self.port_name)))?;
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.port = None;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let port = self.port_mut()?;
        match port.write_all(data) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                Err(Error::TransportTimeout(format!("serial write timed out: {e}")))
            }
            Err(e) => Err(Error::TransportWrite(format!("serial write failed: {e}"))),
        }
    }

    fn read(&mut self, size: usize) -> Result<Vec<u8>> {
        let port = self.port_mut()?;
        let mut buf = vec![0u8; size];
        match port.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                Err(Error::TransportTimeout(format!("serial read timed out: {e}")))
            }
            Err(e) => Err(Error::TransportRead(format!("serial read failed: {e}"))),
        }
    }

    fn read_until(&mut self, terminator: &[u8], timeout: Option<Duration>) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout.unwrap_or(self.timeout);
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| Error::TransportRead("serial port not open".into()))?;
        let original_timeout = port.timeout();

        let mut data = Vec::new();
        let mut byte = [0u8; 1];
        let result = loop {
            let now = Instant::now();
            if now >= deadline {
                break Err(Error::TransportTimeout("serial read_until timed out".into()));
            }
            if port.set_timeout(deadline - now).is_err() {
                break Err(Error::TransportRead(
                    "failed to arm serial read timeout".into(),
                ));
            }
            match port.read(&mut byte) {
                Ok(0) => continue,
                Ok(_) => {
                    data.push(byte[0]);
                    if data.ends_with(terminator) {
                        break Ok(data);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    break Err(Error::TransportTimeout("serial read_until timed out".into()));
                }
                Err(e) => break Err(Error::TransportRead(format!("serial read failed: {e}"))),
            }
        };

        let _ = port.set_timeout(original_timeout);
        result
    }

    fn flush_input(&mut self) -> Result<()> {
        self.port_mut()?
            .clear(ClearBuffer::Input)
            .map_err(|e| Error::TransportRead(format!("failed to flush input: {e}")))
    }

    fn flush_output(&mut self) -> Result<()> {
        self.port_mut()?
            .flush()
            .map_err(|e| Error::TransportWrite(format!("failed to flush output: {e}")))
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operations_fail_cleanly_when_closed() {
        let mut transport = SerialTransport::new("/dev/ttyUSB99", 115_200);
        assert!(!transport.is_open());
        assert!(matches!(transport.read(1), Err(Error::TransportRead(_))));
        assert!(matches!(
            transport.write(b"ATZ\r"),
            Err(Error::TransportRead(_))
        ));
        assert!(transport.close().is_ok());
    }

    #[test]
    fn builder_applies_the_timeout() {
        let transport =
            SerialTransport::new("/dev/ttyUSB0", 38_400).with_timeout(Duration::from_secs(5));
        assert_eq!(transport.timeout, Duration::from_secs(5));
        assert!(transport.needs_delays());
    }
}
