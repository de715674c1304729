//! Result taxonomy returned to clients of the secure element

use std::fmt;

use crate::apdu::SW;

/// Outcome of a channel or lifecycle operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecureElementStatus {
    Success,
    /// Generic or unclassified failure
    Failed,
    /// Link-level failure, or SW 64FF
    IoError,
    /// No logical channel left (SW 6A81)
    ChannelNotAvailable,
    /// AID not found on the chip (SW 6700)
    NoSuchElementError,
    /// Operation refused by the chip (SW 6A86, 6Exx, 6Dxx)
    UnsupportedOperation,
}

impl SecureElementStatus {
    /// Classify the status word of a SELECT response
    pub fn from_select_sw(sw: u16) -> Self {
        match sw {
            SW::SUCCESS => Self::Success,
            SW::WRONG_LENGTH => Self::NoSuchElementError,
            SW::INCORRECT_P1_P2 => Self::UnsupportedOperation,
            _ => Self::Failed,
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl fmt::Display for SecureElementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::IoError => "IOERROR",
            Self::ChannelNotAvailable => "CHANNEL_NOT_AVAILABLE",
            Self::NoSuchElementError => "NO_SUCH_ELEMENT_ERROR",
            Self::UnsupportedOperation => "UNSUPPORTED_OPERATION",
        };
        f.write_str(name)
    }
}
