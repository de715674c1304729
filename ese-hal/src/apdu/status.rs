//! Status Word (SW) constants for APDU responses
//!
//! ISO 7816-4 status words that the channel manager reacts to. Anything not
//! listed here is treated as an unclassified failure by the callers.

/// Status Word constants
pub struct SW;

impl SW {
    // Success
    pub const SUCCESS: u16 = 0x9000;

    // Execution errors (64xx)
    /// Reported by the transport when the physical exchange itself broke down
    pub const IO_ERROR: u16 = 0x64FF;

    // Checking errors
    pub const WRONG_LENGTH: u16 = 0x6700;
    pub const FUNCTION_NOT_SUPPORTED: u16 = 0x6A81;
    pub const FILE_NOT_FOUND: u16 = 0x6A82;
    pub const INCORRECT_P1_P2: u16 = 0x6A86;
    pub const INS_NOT_SUPPORTED: u16 = 0x6D00;
    pub const CLA_NOT_SUPPORTED: u16 = 0x6E00;

    /// Combine SW1 and SW2 into a single status word
    #[inline]
    pub fn from_bytes(sw1: u8, sw2: u8) -> u16 {
        ((sw1 as u16) << 8) | (sw2 as u16)
    }

    /// Split a status word into its SW1/SW2 bytes
    #[inline]
    pub fn to_bytes(sw: u16) -> [u8; 2] {
        [(sw >> 8) as u8, sw as u8]
    }

    /// Check if a status word indicates success
    #[inline]
    pub fn is_success(sw: u16) -> bool {
        sw == Self::SUCCESS
    }

    /// Check if a status word reports a broken transport (64FF)
    #[inline]
    pub fn is_io_error(sw: u16) -> bool {
        sw == Self::IO_ERROR
    }

    /// Check if the card rejected the class or instruction (6Exx / 6Dxx)
    ///
    /// Only SW1 is compared, the card may put anything in SW2.
    #[inline]
    pub fn is_unsupported_command(sw: u16) -> bool {
        matches!((sw >> 8) as u8, 0x6E | 0x6D)
    }
}
