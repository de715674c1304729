//! Error types
//!
//! Transport and configuration failures. Operations exposed to clients fold
//! these into a [`SecureElementStatus`](crate::SecureElementStatus).

use std::path::PathBuf;

use thiserror::Error;

use crate::apdu::{Response, SW};

/// Failures reported by a [`TransceiveLink`](crate::link::TransceiveLink)
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// The exchange failed; whatever the transport received is kept
    #[error("transceive failed ({} response bytes)", response.len())]
    Transceive { response: Vec<u8> },

    #[error("link is not open")]
    NotOpen,

    #[error("endpoint context {0} could not be switched")]
    EndpointContext(u8),

    #[error("driver error: {0}")]
    Driver(String),
}

impl LinkError {
    /// Status word carried by a failed exchange, if one was received
    pub fn status_word(&self) -> Option<u16> {
        match self {
            Self::Transceive { response } => Response::from_bytes(response).ok().map(|r| r.sw()),
            _ => None,
        }
    }

    /// Whether the failure carries SW 64FF
    pub fn is_io_error(&self) -> bool {
        self.status_word().map_or(false, SW::is_io_error)
    }
}

/// Errors raised while loading or storing [`EseConfig`](crate::EseConfig)
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access config {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("terminal id {0:?} does not name an eSE terminal")]
    InvalidTerminalId(String),
}
