//! UDS (ISO 14229) response decoding.

use std::fmt;

use serde::Serialize;

use crate::error::{Error, Result};

/// Services whose responses carry a 16-bit data identifier right after the
/// service id: ReadDataByIdentifier (0x22/0x62), WriteDataByIdentifier
/// (0x2E/0x6E), and InputOutputControlByIdentifier (0x2F/0x6F).
const SERVICES_WITH_DATA_ID: [u8; 6] = [0x22, 0x62, 0x2E, 0x6E, 0x2F, 0x6F];

/// Structured UDS response handed back to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UdsResponse {
    pub service_id: u8,
    pub data_identifier: Option<u16>,
    /// Data bytes after the service id and, if present, the data identifier.
    pub payload: Vec<u8>,
}

impl UdsResponse {
    /// Split a reassembled ISO-TP payload into service id, optional data
    /// identifier, and the remaining data bytes.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let (&service_id, rest) = payload
            .split_first()
            .ok_or_else(|| Error::UdsMalformed("payload too short for UDS response".into()))?;

        if SERVICES_WITH_DATA_ID.contains(&service_id) {
            if rest.len() < 2 {
                return Err(Error::UdsMalformed(format!(
                    "payload too short for service 0x{service_id:02X} with data identifier"
                )));
            }
            Ok(Self {
                service_id,
                data_identifier: Some(u16::from_be_bytes([rest[0], rest[1]])),
                payload: rest[2..].to_vec(),
            })
        } else {
            Ok(Self {
                service_id,
                data_identifier: None,
                payload: rest.to_vec(),
            })
        }
    }
}

impl fmt::Display for UdsResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.data_identifier {
            Some(did) => write!(
                f,
                "service 0x{:02X}, data id 0x{:04X}, {} payload bytes",
                self.service_id,
                did,
                self.payload.len()
            ),
            None => write!(
                f,
                "service 0x{:02X}, {} payload bytes",
                self.service_id,
                self.payload.len()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_data_by_identifier_response_carries_did() {
        let response = UdsResponse::decode(&[0x62, 0x01, 0x02, 0x05, 0xFF]).unwrap();
        assert_eq!(response.service_id, 0x62);
        assert_eq!(response.data_identifier, Some(0x0102));
        assert_eq!(response.payload, vec![0x05, 0xFF]);
    }

    #[test]
    fn plain_service_response_has_no_did() {
        let response = UdsResponse::decode(&[0x50, 0x03, 0x00, 0x32, 0x01, 0xF4]).unwrap();
        assert_eq!(response.service_id, 0x50);
        assert_eq!(response.data_identifier, None);
        assert_eq!(response.payload, vec![0x03, 0x00, 0x32, 0x01, 0xF4]);
    }

    #[test]
    fn empty_payload_is_rejected() {
        assert!(matches!(
            UdsResponse::decode(&[]),
            Err(Error::UdsMalformed(_))
        ));
    }

    #[test]
    fn did_service_shorter_than_three_bytes_is_rejected() {
        assert!(matches!(
            UdsResponse::decode(&[0x62, 0x01]),
            Err(Error::UdsMalformed(_))
        ));
    }

    #[test]
    fn did_services_consume_three_header_bytes() {
        for service in SERVICES_WITH_DATA_ID {
            let raw = [service, 0xAB, 0xCD, 0x01, 0x02, 0x03, 0x04];
            let response = UdsResponse::decode(&raw).unwrap();
            assert_eq!(response.data_identifier, Some(0xABCD));
            assert_eq!(response.payload.len(), raw.len() - 3);
        }
    }

    #[test]
    fn other_services_consume_one_header_byte() {
        let raw = [0x7F, 0x22, 0x31];
        let response = UdsResponse::decode(&raw).unwrap();
        assert_eq!(response.data_identifier, None);
        assert_eq!(response.payload.len(), raw.len() - 1);
    }
}
