//! APDU Response handling
//!
//! A Response contains the payload returned by the chip plus the trailing
//! SW1/SW2 status word.

use super::status::SW;
use super::APDUError;

/// A response APDU split into payload and status word
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Response data (without status words)
    pub data: Vec<u8>,
    /// Status word 1 (SW1)
    pub sw1: u8,
    /// Status word 2 (SW2)
    pub sw2: u8,
}

impl Response {
    /// Create a new response with data and status word
    pub fn new(data: Vec<u8>, sw: u16) -> Self {
        let [sw1, sw2] = SW::to_bytes(sw);
        Self { data, sw1, sw2 }
    }

    /// Create a response carrying only a status word
    pub fn status(sw: u16) -> Self {
        Self::new(Vec::new(), sw)
    }

    /// Split raw response bytes at the trailing status word
    ///
    /// Fails if fewer than two bytes were received.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, APDUError> {
        if raw.len() < 2 {
            return Err(APDUError::TooShort {
                expected: 2,
                actual: raw.len(),
            });
        }
        let (data, sw) = raw.split_at(raw.len() - 2);
        Ok(Self {
            data: data.to_vec(),
            sw1: sw[0],
            sw2: sw[1],
        })
    }

    /// Get the combined status word as u16
    pub fn sw(&self) -> u16 {
        SW::from_bytes(self.sw1, self.sw2)
    }

    /// Check if the response is 9000
    pub fn is_okay(&self) -> bool {
        SW::is_success(self.sw())
    }

    /// Convert to raw bytes (data + SW1 + SW2)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(self.len());
        result.extend_from_slice(&self.data);
        result.push(self.sw1);
        result.push(self.sw2);
        result
    }

    /// Get total length in bytes (data + 2 status bytes)
    pub fn len(&self) -> usize {
        self.data.len() + 2
    }

    /// Check if response has no data
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl From<u16> for Response {
    fn from(sw: u16) -> Self {
        Self::status(sw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_bytes_splits_status_word() {
        let resp = Response::from_bytes(&[0x6F, 0x10, 0x84, 0x90, 0x00]).unwrap();
        assert_eq!(resp.data, vec![0x6F, 0x10, 0x84]);
        assert_eq!(resp.sw(), SW::SUCCESS);
        assert!(resp.is_okay());
    }

    #[test]
    fn test_from_bytes_status_only() {
        let resp = Response::from_bytes(&[0x6A, 0x81]).unwrap();
        assert!(resp.is_empty());
        assert_eq!(resp.sw(), SW::FUNCTION_NOT_SUPPORTED);
        assert!(!resp.is_okay());
    }

    #[test]
    fn test_from_bytes_too_short() {
        assert_eq!(
            Response::from_bytes(&[0x90]),
            Err(APDUError::TooShort { expected: 2, actual: 1 })
        );
        assert!(Response::from_bytes(&[]).is_err());
    }

    #[test]
    fn test_to_bytes_appends_status_word() {
        let resp = Response::new(vec![0xDE, 0xAD], SW::WRONG_LENGTH);
        assert_eq!(resp.len(), 4);
        assert_eq!(resp.to_bytes(), vec![0xDE, 0xAD, 0x67, 0x00]);
    }

    #[test]
    fn test_from_sw() {
        let resp: Response = 0x6A86.into();
        assert_eq!(resp.to_bytes(), vec![0x6A, 0x86]);
    }
}
