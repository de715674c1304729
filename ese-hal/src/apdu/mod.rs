//! APDU (Application Protocol Data Unit) handling
//!
//! Command and response framing for the ISO 7816-4 traffic exchanged with the
//! secure element.
//!
//! # Example
//! ```
//! use ese_hal::apdu::{APDU, Response, SW};
//!
//! let select = APDU::select_by_name(0x01, 0x00, &[0xA0, 0x00, 0x00, 0x01, 0x51]);
//! assert_eq!(select.to_bytes(), vec![0x01, 0xA4, 0x04, 0x00, 0x05, 0xA0, 0x00, 0x00, 0x01, 0x51, 0x00]);
//!
//! let response = Response::from_bytes(&[0x6F, 0x00, 0x90, 0x00]).unwrap();
//! assert_eq!(response.sw(), SW::SUCCESS);
//! ```

mod response;
mod status;

pub use response::Response;
pub use status::SW;

use thiserror::Error;

/// Errors that can occur while parsing or slicing APDU frames
#[derive(Debug, Error, PartialEq, Eq)]
pub enum APDUError {
    #[error("APDU too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    #[error("Invalid APDU length")]
    InvalidLength,
}

/// Mask selecting the logical channel number from a CLA byte
pub const CLA_CHANNEL_MASK: u8 = 0x03;

/// Number of logical channels the chip multiplexes, basic channel included
pub const MAX_CHANNELS: u8 = 0x04;

/// The basic channel, implicitly available and never handed out by MANAGE CHANNEL
pub const BASIC_CHANNEL: u8 = 0x00;

/// Channel number returned to the caller when no channel was allocated
pub const INVALID_CHANNEL: u8 = 0xFF;

/// MANAGE CHANNEL (open) sent before every logical channel select
pub const MANAGE_CHANNEL_OPEN: [u8; 5] = [0x00, 0x70, 0x00, 0x00, 0x01];

/// Instruction bytes used by the channel manager
pub mod ins {
    pub const SELECT: u8 = 0xA4;
    pub const MANAGE_CHANNEL: u8 = 0x70;
}

/// P1 values
pub mod p1 {
    /// SELECT by DF name
    pub const SELECT_BY_NAME: u8 = 0x04;
    /// MANAGE CHANNEL close
    pub const MANAGE_CHANNEL_CLOSE: u8 = 0x80;
}

/// A command APDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct APDU {
    /// Class byte (CLA), low two bits carry the logical channel
    pub cla: u8,
    /// Instruction byte (INS)
    pub ins: u8,
    /// Parameter 1 (P1)
    pub p1: u8,
    /// Parameter 2 (P2)
    pub p2: u8,
    /// Command data (may be empty)
    pub data: Vec<u8>,
    /// Expected response length (Le), None if not specified
    pub le: Option<u32>,
}

impl APDU {
    /// Create a new APDU with just the header (CLA, INS, P1, P2)
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: Vec::new(),
            le: None,
        }
    }

    /// Create a new APDU with data
    pub fn with_data(cla: u8, ins: u8, p1: u8, p2: u8, data: Vec<u8>) -> Self {
        Self {
            data,
            ..Self::new(cla, ins, p1, p2)
        }
    }

    /// Set the expected response length
    pub fn expect(mut self, le: u32) -> Self {
        self.le = Some(le);
        self
    }

    /// SELECT by name on `channel`, expecting up to 256 response bytes
    pub fn select_by_name(channel: u8, p2: u8, aid: &[u8]) -> Self {
        Self::with_data(channel, ins::SELECT, p1::SELECT_BY_NAME, p2, aid.to_vec()).expect(256)
    }

    /// MANAGE CHANNEL (close) for `channel`
    pub fn manage_channel_close(channel: u8) -> Self {
        Self::new(channel, ins::MANAGE_CHANNEL, p1::MANAGE_CHANNEL_CLOSE, channel)
    }

    /// Logical channel encoded in the class byte
    pub fn channel(&self) -> u8 {
        self.cla & CLA_CHANNEL_MASK
    }

    /// Encode to wire format
    ///
    /// Short encoding is used whenever Lc and Le fit, extended otherwise.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![self.cla, self.ins, self.p1, self.p2];
        let extended = self.data.len() > 255 || self.le.map_or(false, |le| le > 256);

        if !self.data.is_empty() {
            if extended {
                out.push(0x00);
                out.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
            } else {
                out.push(self.data.len() as u8);
            }
            out.extend_from_slice(&self.data);
        }

        if let Some(le) = self.le {
            if extended {
                if self.data.is_empty() {
                    out.push(0x00);
                }
                // 65536 wraps to 0000
                out.extend_from_slice(&(le as u16).to_be_bytes());
            } else {
                // 256 wraps to 00
                out.push(le as u8);
            }
        }
        out
    }
}

/// Parse a short-form command APDU
///
/// - Case 1: CLA INS P1 P2
/// - Case 2: CLA INS P1 P2 Le
/// - Case 3: CLA INS P1 P2 Lc Data
/// - Case 4: CLA INS P1 P2 Lc Data Le
pub fn parse_apdu(raw: &[u8]) -> Result<APDU, APDUError> {
    if raw.len() < 4 {
        return Err(APDUError::TooShort {
            expected: 4,
            actual: raw.len(),
        });
    }

    let mut apdu = APDU::new(raw[0], raw[1], raw[2], raw[3]);
    let body = &raw[4..];
    let decode_le = |b: u8| if b == 0 { 256 } else { b as u32 };

    match body.len() {
        0 => {}
        1 => apdu.le = Some(decode_le(body[0])),
        n => {
            let lc = body[0] as usize;
            if n == 1 + lc {
                apdu.data = body[1..].to_vec();
            } else if n == 2 + lc {
                apdu.data = body[1..1 + lc].to_vec();
                apdu.le = Some(decode_le(body[1 + lc]));
            } else {
                return Err(APDUError::InvalidLength);
            }
        }
    }
    Ok(apdu)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_by_name_encoding() {
        let aid = hex::decode("A000000151000000").unwrap();
        let apdu = APDU::select_by_name(0x02, 0x0C, &aid);
        let mut expected = vec![0x02, 0xA4, 0x04, 0x0C, 0x08];
        expected.extend_from_slice(&aid);
        expected.push(0x00);
        assert_eq!(apdu.to_bytes(), expected);
        assert_eq!(apdu.channel(), 2);
    }

    #[test]
    fn test_manage_channel_close_encoding() {
        assert_eq!(
            APDU::manage_channel_close(3).to_bytes(),
            vec![0x03, 0x70, 0x80, 0x03]
        );
    }

    #[test]
    fn test_extended_encoding() {
        let apdu = APDU::with_data(0x80, 0xE8, 0x00, 0x00, vec![0xAB; 300]);
        let bytes = apdu.to_bytes();
        assert_eq!(&bytes[4..7], &[0x00, 0x01, 0x2C]);
        assert_eq!(bytes.len(), 7 + 300);
    }

    #[test]
    fn test_parse_cases() {
        let case1 = parse_apdu(&[0x00, 0x70, 0x80, 0x01]).unwrap();
        assert!(case1.data.is_empty());
        assert!(case1.le.is_none());

        let case2 = parse_apdu(&MANAGE_CHANNEL_OPEN).unwrap();
        assert_eq!(case2.ins, ins::MANAGE_CHANNEL);
        assert_eq!(case2.le, Some(1));

        let case4 = parse_apdu(&[0x01, 0xA4, 0x04, 0x00, 0x02, 0xA0, 0x00, 0x00]).unwrap();
        assert_eq!(case4.data, vec![0xA0, 0x00]);
        assert_eq!(case4.le, Some(256));
        assert_eq!(case4.channel(), 1);
    }

    #[test]
    fn test_parse_rejects_bad_lengths() {
        assert_eq!(
            parse_apdu(&[0x00, 0xA4, 0x04]),
            Err(APDUError::TooShort { expected: 4, actual: 3 })
        );
        assert_eq!(
            parse_apdu(&[0x00, 0xA4, 0x04, 0x00, 0x05, 0x01]),
            Err(APDUError::InvalidLength)
        );
    }

    #[test]
    fn test_encode_parse_select() {
        let apdu = APDU::select_by_name(0x01, 0x00, &[0xD2, 0x76, 0x00, 0x01, 0x24, 0x01]);
        assert_eq!(parse_apdu(&apdu.to_bytes()).unwrap(), apdu);
    }
}
