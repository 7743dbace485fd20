//! OBD-II/UDS driver for ELM327-class adapters.
//!
//! This library drives ELM327 dongles over BLE or serial byte transports,
//! reassembles ISO-TP (ISO 15765-2) frames, and decodes UDS (ISO 14229)
//! responses into structured values.
//!
//! A session opens a transport, wraps it in an [`Elm327`] controller,
//! initializes the adapter, and issues requests:
//!
//! ```no_run
//! use obd2_core::transport::{BleConfig, BleTransport};
//! use obd2_core::{ByteTransport, Elm327};
//!
//! # fn main() -> obd2_core::Result<()> {
//! let mut transport = BleTransport::new(BleConfig::new("D2:E0:2F:8D:5C:6B"));
//! transport.open()?;
//!
//! let mut elm = Elm327::new(transport);
//! elm.initialize()?;
//! let response = elm.send_message(Some(0x7E4), 0x220101)?;
//! println!("{response}");
//! elm.close()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod elm327;
pub mod error;
pub mod isotp;
pub mod transport;
pub mod uds;

pub use elm327::Elm327;
pub use error::{Error, Result};
pub use isotp::{parse_isotp_frames, IsoTpAssembler, IsoTpFrame};
pub use transport::{BleConfig, BleTransport, ByteTransport, MockTransport, SerialTransport};
pub use uds::UdsResponse;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
