//! Logical channel bookkeeping
//!
//! Tracks which of the chip's channels are open. The number of open channels
//! decides when the chip may be powered down.

use crate::apdu::{BASIC_CHANNEL, MAX_CHANNELS};

/// Open/closed flag per channel plus the aggregate count
///
/// `open_count()` always equals the number of open slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelTable {
    slots: [bool; MAX_CHANNELS as usize],
    open_count: u8,
}

impl ChannelTable {
    pub fn new() -> Self {
        Self {
            slots: [false; MAX_CHANNELS as usize],
            open_count: 0,
        }
    }

    /// Whether `channel` is a valid channel number
    pub fn is_valid(channel: u8) -> bool {
        channel < MAX_CHANNELS
    }

    /// Whether `channel` is one the chip can hand out through MANAGE CHANNEL
    pub fn is_logical(channel: u8) -> bool {
        channel != BASIC_CHANNEL && Self::is_valid(channel)
    }

    pub fn is_open(&self, channel: u8) -> bool {
        self.slots.get(channel as usize).copied().unwrap_or(false)
    }

    /// Mark `channel` open
    ///
    /// Returns `false` if the slot was already open or the number is out of
    /// range; the count is left untouched in both cases.
    pub fn mark_open(&mut self, channel: u8) -> bool {
        match self.slots.get_mut(channel as usize) {
            Some(slot) if !*slot => {
                *slot = true;
                self.open_count += 1;
                true
            }
            _ => false,
        }
    }

    /// Mark `channel` closed, returning whether it was open
    pub fn mark_closed(&mut self, channel: u8) -> bool {
        match self.slots.get_mut(channel as usize) {
            Some(slot) if *slot => {
                *slot = false;
                self.open_count -= 1;
                true
            }
            _ => false,
        }
    }

    pub fn open_count(&self) -> u8 {
        self.open_count
    }

    pub fn is_empty(&self) -> bool {
        self.open_count == 0
    }

    /// Open channel numbers in ascending order
    pub fn open_channels(&self) -> impl Iterator<Item = u8> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, open)| **open)
            .map(|(n, _)| n as u8)
    }

    /// Close every slot
    pub fn clear(&mut self) {
        self.slots = [false; MAX_CHANNELS as usize];
        self.open_count = 0;
    }
}

impl Default for ChannelTable {
    fn default() -> Self {
        Self::new()
    }
}
