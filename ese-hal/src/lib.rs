//! Logical channel manager for an embedded secure element
//!
//! Sits between clients and the physical eSE. Clients open the basic channel
//! or a logical channel by AID, exchange raw APDUs and close channels again;
//! the chip is powered lazily on first use and powered down once the last
//! channel closes.
//!
//! Access to the chip goes through a [`TransceiveLink`]. [`VirtualEse`] is an
//! in-process implementation used for tests and bring-up.
//!
//! ```
//! use std::sync::Arc;
//! use ese_hal::{EseConfig, SecureElement, SecureElementStatus, VirtualEse};
//!
//! let aid = [0xA0, 0x00, 0x00, 0x01, 0x51];
//! let chip = Arc::new(VirtualEse::new().with_applet(&aid));
//! let se = SecureElement::new(EseConfig::default(), chip);
//!
//! let (response, status) = se.open_logical_channel(&aid, 0x00);
//! assert_eq!(status, SecureElementStatus::Success);
//! assert_eq!(se.close_channel(response.channel_number), SecureElementStatus::Success);
//! assert!(!se.is_initialized());
//! ```

pub mod apdu;
pub mod callback;
pub mod config;
pub mod download;
pub mod error;
pub mod link;
pub mod secure_element;
pub mod session;
pub mod status;

pub use callback::StateChangeCallback;
pub use config::EseConfig;
pub use download::{DownloadStatus, LoaderDownload, NoLoader, LOADER_AID};
pub use error::{ConfigError, LinkError};
pub use link::{InitMode, OsMode, TransceiveLink, VirtualEse};
pub use secure_element::{LogicalChannelResponse, SecureElement};
pub use status::SecureElementStatus;
