//! Loader download trigger
//!
//! Selecting [`LOADER_AID`] on the basic channel does not reach the chip.
//! Instead the engine hands control to a [`LoaderDownload`] implementation,
//! which runs the applet/OS download out of band and reports progress through
//! the state-change callback. This is a protocol quirk of the service: one
//! SELECT turns into a control-plane operation depending on its payload.

use std::sync::Arc;

use crate::callback::StateChangeCallback;

/// AID that triggers the loader download when selected on the basic channel
pub const LOADER_AID: [u8; 13] = [
    0xA0, 0x00, 0x00, 0x03, 0x96, 0x41, 0x4C, 0x41, 0x01, 0x43, 0x4F, 0x52, 0x01,
];

/// Whether a download could be started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Success,
    Failed,
}

/// Out-of-band download module
///
/// Called with the session lock held. Implementations must not call back into
/// the [`SecureElement`](crate::SecureElement) from `perform_download`; long
/// running work belongs on a thread of its own.
pub trait LoaderDownload: Send + Sync {
    /// Start a download, reporting completion through `callback` if one is registered
    fn perform_download(&self, callback: Option<Arc<dyn StateChangeCallback>>) -> DownloadStatus;
}

/// Download module for builds without a loader; every request fails
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLoader;

impl LoaderDownload for NoLoader {
    fn perform_download(&self, _callback: Option<Arc<dyn StateChangeCallback>>) -> DownloadStatus {
        DownloadStatus::Failed
    }
}
