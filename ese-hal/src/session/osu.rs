//! OS-update (OSU) mode interceptor
//!
//! While the chip's operating system is being updated, traffic on the basic
//! channel is split in two: frames wrapped in the proprietary OSU header are
//! unwrapped and forwarded, a reset frame is handled locally, anything else
//! passes through as GlobalPlatform traffic. Dedicated mode is entered by
//! selecting [`OSU_AID`] and left by closing the basic channel.

use log::{debug, info, warn};

use crate::apdu::{APDUError, BASIC_CHANNEL, CLA_CHANNEL_MASK};
use crate::link::{EndpointGuard, OsMode, TransceiveLink};

/// AID announcing dedicated OSU mode
pub const OSU_AID: [u8; 9] = [0x4F, 0x70, 0x80, 0x13, 0x04, 0xDE, 0xAD, 0xBE, 0xEF];

/// SELECT with empty AID, blocked while the chip reports OSU mode
pub const DEFAULT_SELECT_AID: [u8; 5] = [0x00, 0xA4, 0x04, 0x00, 0x00];

/// Class byte of proprietary OSU frames
pub const OSU_PROP_CLA: u8 = 0x80;
/// Instruction byte of proprietary OSU frames
pub const OSU_PROP_INS: u8 = 0xDF;
/// P1 requesting a reset of the chip's OS-update state
pub const OSU_PROP_RST_P1: u8 = 0xEF;

/// Proprietary header length when byte 4 (short Lc) is non-zero
const SHORT_HEADER_LEN: usize = 5;
/// Proprietary header length with a zero byte 4 (extended Lc)
const EXTENDED_HEADER_LEN: usize = 7;

/// How an APDU is handled with respect to OSU mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsuApduMode {
    /// Not OSU traffic; while OSU is active such frames are not forwarded
    NonOsu,
    /// Dedicated vendor protocol
    Proprietary,
    /// Standard GlobalPlatform traffic
    GlobalPlatform,
    /// Reset instruction consumed locally
    Reset,
}

/// Client request the interceptor is consulted for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsuEvent<'a> {
    Init,
    OpenBasic(&'a [u8]),
    OpenLogical(&'a [u8]),
    Close(u8),
    Reset,
}

/// OSU mode flags
///
/// The chip-reported flag is re-read on every entry point and never trusted
/// from a previous call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OsuInterceptor {
    app_osu_mode: bool,
    jcop_osu_mode: bool,
}

impl OsuInterceptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dedicated mode requested by a client through [`OSU_AID`]
    pub fn app_osu_mode(&self) -> bool {
        self.app_osu_mode
    }

    /// Whether any OSU mode is active
    pub fn is_osu_mode(&self) -> bool {
        self.app_osu_mode || self.jcop_osu_mode
    }

    /// Leave dedicated mode
    pub fn clear_app_mode(&mut self) {
        if self.app_osu_mode {
            info!("Leaving dedicated OSU mode");
        }
        self.app_osu_mode = false;
    }

    fn refresh(&mut self, link: &dyn TransceiveLink) {
        self.jcop_osu_mode = link.os_mode() == OsMode::Osu;
    }

    fn current_mode(&self) -> OsuApduMode {
        if self.app_osu_mode {
            OsuApduMode::Proprietary
        } else if self.jcop_osu_mode {
            OsuApduMode::GlobalPlatform
        } else {
            OsuApduMode::NonOsu
        }
    }

    /// Update the mode for a non-transmit request and report the result
    ///
    /// Opening with [`OSU_AID`] enters dedicated mode and yields
    /// [`OsuApduMode::Proprietary`]. Closing the basic channel leaves it.
    pub fn on_event(&mut self, link: &dyn TransceiveLink, event: OsuEvent<'_>) -> OsuApduMode {
        self.refresh(link);
        let mode = match event {
            OsuEvent::OpenBasic(aid) | OsuEvent::OpenLogical(aid) => {
                if aid == OSU_AID {
                    self.app_osu_mode = true;
                    info!("Dedicated OSU mode set");
                    OsuApduMode::Proprietary
                } else if self.is_osu_mode() {
                    debug!("Non OSU AID selected while OSU mode is active");
                    OsuApduMode::GlobalPlatform
                } else {
                    OsuApduMode::NonOsu
                }
            }
            OsuEvent::Close(channel) => {
                if channel == BASIC_CHANNEL {
                    self.clear_app_mode();
                }
                self.current_mode()
            }
            OsuEvent::Init | OsuEvent::Reset => self.current_mode(),
        };
        debug!("OSU {:?} -> {:?}", event, mode);
        mode
    }

    /// Inspect and, if needed, rewrite an outgoing frame in place
    ///
    /// Outside OSU mode every frame is passed through. Inside OSU mode:
    /// - frames on a logical channel, or the default SELECT while the chip is
    ///   in OSU mode, are [`OsuApduMode::NonOsu`] and `frame` is emptied;
    /// - proprietary frames have their 5 or 7 byte header stripped;
    /// - the proprietary reset frame resets the chip's OS-update state through
    ///   `link` and `frame` is emptied;
    /// - everything else is [`OsuApduMode::GlobalPlatform`], unchanged.
    ///
    /// The caller must already hold the session lock.
    pub fn check_transmit(
        &mut self,
        link: &dyn TransceiveLink,
        endpoint: u8,
        frame: &mut Vec<u8>,
    ) -> Result<OsuApduMode, APDUError> {
        self.refresh(link);
        if !self.is_osu_mode() {
            return Ok(OsuApduMode::GlobalPlatform);
        }

        let cla = *frame.first().ok_or(APDUError::TooShort {
            expected: 1,
            actual: 0,
        })?;

        if cla & CLA_CHANNEL_MASK != BASIC_CHANNEL
            || (self.jcop_osu_mode && frame.as_slice() == DEFAULT_SELECT_AID)
        {
            frame.clear();
            return Ok(OsuApduMode::NonOsu);
        }

        match frame.as_slice() {
            [OSU_PROP_CLA, OSU_PROP_INS, OSU_PROP_RST_P1, ..] => {
                info!("OSU reset frame received");
                reset_os_update(link, endpoint);
                frame.clear();
                Ok(OsuApduMode::Reset)
            }
            [OSU_PROP_CLA, OSU_PROP_INS, ..] => {
                strip_proprietary_header(frame)?;
                debug!("OSU proprietary frame unwrapped to {} bytes", frame.len());
                Ok(OsuApduMode::Proprietary)
            }
            _ => Ok(OsuApduMode::GlobalPlatform),
        }
    }
}

fn strip_proprietary_header(frame: &mut Vec<u8>) -> Result<(), APDUError> {
    let header = match frame.get(4) {
        Some(0) => EXTENDED_HEADER_LEN,
        Some(_) => SHORT_HEADER_LEN,
        None => {
            return Err(APDUError::TooShort {
                expected: SHORT_HEADER_LEN,
                actual: frame.len(),
            })
        }
    };
    if frame.len() < header {
        return Err(APDUError::TooShort {
            expected: header,
            actual: frame.len(),
        });
    }
    frame.drain(..header);
    Ok(())
}

fn reset_os_update(link: &dyn TransceiveLink, endpoint: u8) {
    let _endpoint = EndpointGuard::enter(link, endpoint);
    if let Err(e) = link.reset_os_update() {
        warn!("OS update reset failed: {}", e);
    }
}
