//! Per-chip session state guarded by the session lock

pub mod channels;
pub mod osu;

pub use channels::ChannelTable;
pub use osu::{OsuApduMode, OsuEvent, OsuInterceptor, OSU_AID};
