//! Transport layer: the byte-channel contract and its implementations.

pub mod ble;
pub mod mock;
pub mod serial;

pub use ble::{BleConfig, BleTransport, DiscoveredDevice};
pub use mock::MockTransport;
pub use serial::SerialTransport;

use std::time::Duration;

use crate::error::Result;

/// A bidirectional byte channel to an ELM327 adapter.
///
/// Implementations own their underlying OS handle or GATT client and must be
/// safe to `close` after a partially failed `open`. Every read has an
/// effective deadline, either passed in or configured on the transport.
/// `Send` is required so a controller can share the transport with its
/// tester-present worker.
pub trait ByteTransport: Send {
    /// Establish the channel. Idempotent when already open.
    fn open(&mut self) -> Result<()>;

    /// Release all resources. Idempotent, and safe after a failed `open`.
    fn close(&mut self) -> Result<()>;

    /// Deliver bytes to the adapter.
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Read up to `size` bytes, waiting until data arrives or the configured
    /// deadline elapses.
    fn read(&mut self, size: usize) -> Result<Vec<u8>>;

    /// Read up to and including the first occurrence of `terminator`.
    fn read_until(&mut self, terminator: &[u8], timeout: Option<Duration>) -> Result<Vec<u8>>;

    /// Discard buffered inbound bytes.
    fn flush_input(&mut self) -> Result<()>;

    /// Force pending outbound bytes onto the wire.
    fn flush_output(&mut self) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Whether the controller should insert ELM327 settling delays.
    /// True for hardware transports, false for mocks.
    fn needs_delays(&self) -> bool {
        true
    }
}
