//! ISO-TP (ISO 15765-2) frame parsing and message reassembly.
//!
//! The ELM327 hands us one CAN frame per reply line. Each frame starts with
//! a PCI byte whose high nibble selects the frame kind; multi-byte messages
//! arrive as a First frame followed by Consecutive frames that this module
//! stitches back together. Flow control is handled inside the adapter, so
//! the receive path only ever sees it as a frame to skip.

use crate::error::{Error, Result};

/// Frame kind, from the high nibble of the PCI byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Single,
    First,
    Consecutive,
    FlowControl,
}

/// One CAN data payload with its parsed protocol control information.
#[derive(Debug, Clone)]
pub struct IsoTpFrame {
    pub kind: FrameKind,
    pub data: Vec<u8>,
    /// Sequence number, consecutive frames only.
    pub sequence_number: Option<u8>,
    /// Declared message length: 0..=7 for single frames, 12-bit for first frames.
    pub declared_length: Option<usize>,
}

impl IsoTpFrame {
    /// Parse one frame from raw bytes (CAN id already stripped).
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let pci = *bytes
            .first()
            .ok_or_else(|| Error::IsoTpProtocol("frame data cannot be empty".into()))?;

        match (pci & 0xF0) >> 4 {
            // Single frame: 0L DD DD ...
            0x0 => {
                let length = (pci & 0x0F) as usize;
                let end = bytes.len().min(1 + length);
                Ok(Self {
                    kind: FrameKind::Single,
                    data: bytes[1..end].to_vec(),
                    sequence_number: None,
                    declared_length: Some(length),
                })
            }
            // First frame: 1L LL DD DD ..., 12-bit total length
            0x1 => {
                if bytes.len() < 2 {
                    return Err(Error::IsoTpProtocol(
                        "first frame shorter than its PCI".into(),
                    ));
                }
                let length = (((pci & 0x0F) as usize) << 8) | bytes[1] as usize;
                Ok(Self {
                    kind: FrameKind::First,
                    data: bytes[2..].to_vec(),
                    sequence_number: None,
                    declared_length: Some(length),
                })
            }
            // Consecutive frame: 2N DD DD ...
            0x2 => Ok(Self {
                kind: FrameKind::Consecutive,
                data: bytes[1..].to_vec(),
                sequence_number: Some(pci & 0x0F),
                declared_length: None,
            }),
            // Flow control and anything else carries no user data here.
            _ => Ok(Self {
                kind: FrameKind::FlowControl,
                data: Vec::new(),
                sequence_number: None,
                declared_length: None,
            }),
        }
    }

    /// Parse a frame from a hex string as found in an ELM327 reply line.
    pub fn from_hex(frame: &str) -> Result<Self> {
        let bytes = hex::decode(frame)
            .map_err(|e| Error::IsoTpProtocol(format!("invalid frame hex {frame:?}: {e}")))?;
        Self::parse(&bytes)
    }
}

/// Stateful accumulator reassembling one logical ISO-TP message.
///
/// One-shot: feed frames in arrival order with [`add_frame`](Self::add_frame)
/// until the message completes, then take the payload.
#[derive(Debug)]
pub struct IsoTpAssembler {
    payload: Vec<u8>,
    expected_length: Option<usize>,
    next_sequence: u8,
    complete: bool,
}

impl IsoTpAssembler {
    pub fn new() -> Self {
        Self {
            payload: Vec::new(),
            expected_length: None,
            next_sequence: 1,
            complete: false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Add the next frame of the message.
    ///
    /// A Single or First frame may only start an empty message; Consecutive
    /// frames must follow a First frame with sequence numbers that increment
    /// modulo 16. The payload is truncated to the declared length when the
    /// final frame overshoots it.
    pub fn add_frame(&mut self, frame: &IsoTpFrame) -> Result<()> {
        if self.complete {
            return Err(Error::IsoTpProtocol("message is already complete".into()));
        }

        match frame.kind {
            FrameKind::Single => {
                if !self.payload.is_empty() || self.expected_length.is_some() {
                    return Err(Error::IsoTpProtocol(
                        "single frame received but message already started".into(),
                    ));
                }
                self.payload = frame.data.clone();
                self.expected_length = frame.declared_length;
                self.complete = true;
            }
            FrameKind::First => {
                if !self.payload.is_empty() || self.expected_length.is_some() {
                    return Err(Error::IsoTpProtocol(
                        "first frame received but message already started".into(),
                    ));
                }
                self.payload.extend_from_slice(&frame.data);
                self.expected_length = frame.declared_length;
                self.next_sequence = 1;
                self.finish_if_complete();
            }
            FrameKind::Consecutive => {
                if self.expected_length.is_none() {
                    return Err(Error::IsoTpProtocol(
                        "consecutive frame received without first frame".into(),
                    ));
                }
                let sequence = frame.sequence_number.unwrap_or(0);
                if sequence != self.next_sequence {
                    return Err(Error::IsoTpProtocol(format!(
                        "expected sequence {}, got {}",
                        self.next_sequence, sequence
                    )));
                }
                self.payload.extend_from_slice(&frame.data);
                self.next_sequence = (self.next_sequence + 1) % 16;
                self.finish_if_complete();
            }
            FrameKind::FlowControl => {}
        }

        Ok(())
    }

    fn finish_if_complete(&mut self) {
        if let Some(expected) = self.expected_length {
            if self.payload.len() >= expected {
                // Excess bytes in the last frame are padding.
                self.payload.truncate(expected);
                self.complete = true;
            }
        }
    }

    /// The assembled payload, available once the message is complete.
    pub fn payload(&self) -> Result<&[u8]> {
        if !self.complete {
            return Err(Error::IsoTpProtocol("message is not complete yet".into()));
        }
        Ok(&self.payload)
    }

    pub fn into_payload(self) -> Result<Vec<u8>> {
        if !self.complete {
            return Err(Error::IsoTpProtocol("message is not complete yet".into()));
        }
        Ok(self.payload)
    }
}

impl Default for IsoTpAssembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a list of hex frame strings and reassemble the complete message.
pub fn parse_isotp_frames<S: AsRef<str>>(frames: &[S]) -> Result<Vec<u8>> {
    let mut assembler = IsoTpAssembler::new();
    for frame in frames {
        let frame = IsoTpFrame::from_hex(frame.as_ref())?;
        assembler.add_frame(&frame)?;
    }
    assembler.into_payload()
}
