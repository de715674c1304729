//! Transport boundary towards the physical secure element
//!
//! The core never talks SPI itself. It drives an implementation of
//! [`TransceiveLink`], which owns the electrical protocol, the power rails and
//! the vendor specific OS-update hooks.

pub mod virtual_ese;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::LinkError;

pub use virtual_ese::VirtualEse;

/// Mode the chip is opened and initialised in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitMode {
    #[default]
    Normal,
    Osu,
}

/// OS mode reported live by the chip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsMode {
    Normal,
    /// The chip's operating system is waiting for (or running) an update
    Osu,
}

/// Byte exchange capability bound to one physical chip
///
/// Every call to [`exchange`](TransceiveLink::exchange) must be bracketed by
/// [`set_endpoint_context`](TransceiveLink::set_endpoint_context) and
/// [`reset_endpoint_context`](TransceiveLink::reset_endpoint_context). The
/// link itself does no locking, callers serialise through the session lock.
pub trait TransceiveLink: Send + Sync {
    fn open(&self, mode: InitMode) -> Result<(), LinkError>;

    fn init(&self, mode: InitMode) -> Result<(), LinkError>;

    fn deinit(&self) -> Result<(), LinkError>;

    fn close(&self) -> Result<(), LinkError>;

    fn set_endpoint_context(&self, id: u8) -> Result<(), LinkError>;

    fn reset_endpoint_context(&self, id: u8) -> Result<(), LinkError>;

    /// Send one command and return the full response, status word included
    fn exchange(&self, command: &[u8]) -> Result<Vec<u8>, LinkError>;

    /// Query the chip for its current OS mode
    fn os_mode(&self) -> OsMode;

    /// Drop the chip's pending OS-update state
    fn reset_os_update(&self) -> Result<(), LinkError>;

    /// Answer to reset, empty when the transport does not expose one
    fn atr(&self) -> Vec<u8> {
        Vec::new()
    }
}

/// Endpoint context held for the lifetime of the guard
///
/// The context is reset on drop, on every exit path of the bracketed sequence.
pub(crate) struct EndpointGuard<'a> {
    link: &'a dyn TransceiveLink,
    id: u8,
}

impl<'a> EndpointGuard<'a> {
    pub(crate) fn enter(link: &'a dyn TransceiveLink, id: u8) -> Self {
        if let Err(e) = link.set_endpoint_context(id) {
            warn!("set endpoint context {} failed: {}", id, e);
        }
        Self { link, id }
    }
}

impl Drop for EndpointGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.link.reset_endpoint_context(self.id) {
            warn!("reset endpoint context {} failed: {}", self.id, e);
        }
    }
}
