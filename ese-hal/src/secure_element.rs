//! Secure element session context
//!
//! `SecureElement` multiplexes the chip's logical channels between clients.
//! All transceive-class requests are serialised by one session lock, which is
//! held from command build to response classification so that endpoint
//! context bracketing and channel bookkeeping of two requests never interleave.

use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::{Mutex, MutexGuard};

use crate::apdu::{
    Response, APDU, BASIC_CHANNEL, INVALID_CHANNEL, MANAGE_CHANNEL_OPEN, SW,
};
use crate::callback::StateChangeCallback;
use crate::config::EseConfig;
use crate::download::{DownloadStatus, LoaderDownload, NoLoader, LOADER_AID};
use crate::error::LinkError;
use crate::link::{EndpointGuard, TransceiveLink};
use crate::session::{ChannelTable, OsuApduMode, OsuEvent, OsuInterceptor};
use crate::status::SecureElementStatus;

/// Result of opening a logical channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalChannelResponse {
    /// Channel assigned by the chip, [`INVALID_CHANNEL`] if none was allocated
    pub channel_number: u8,
    /// SELECT response, status word included
    pub select_response: Vec<u8>,
}

impl LogicalChannelResponse {
    fn unallocated() -> Self {
        Self {
            channel_number: INVALID_CHANNEL,
            select_response: Vec::new(),
        }
    }
}

/// State guarded by the session lock
struct Session {
    initialized: bool,
    link_open: bool,
    channels: ChannelTable,
    osu: OsuInterceptor,
    callback: Option<Arc<dyn StateChangeCallback>>,
}

impl Session {
    fn new() -> Self {
        Self {
            initialized: false,
            link_open: false,
            channels: ChannelTable::new(),
            osu: OsuInterceptor::new(),
            callback: None,
        }
    }

    /// Drop every channel and dedicated mode
    fn clear(&mut self) {
        self.initialized = false;
        self.channels.clear();
        self.osu.clear_app_mode();
    }
}

#[derive(Default)]
struct PendingNotices {
    queue: VecDeque<(Arc<dyn StateChangeCallback>, bool)>,
    dispatching: bool,
}

/// State changes waiting to be reported
///
/// Notices are queued while the session lock is held, so the queue follows
/// the order of the state changes. They are delivered after the session lock
/// is released, by one thread at a time, and no lock is held while a callback
/// runs. A callback may call back into the [`SecureElement`]; anything it
/// queues is delivered after it returns.
#[derive(Default)]
struct Notices {
    pending: Mutex<PendingNotices>,
}

impl Notices {
    /// Queue a notice for the registered callback; the caller holds the session lock
    fn push(&self, session: &Session, connected: bool) {
        if let Some(callback) = &session.callback {
            self.push_to(Arc::clone(callback), connected);
        }
    }

    fn push_to(&self, callback: Arc<dyn StateChangeCallback>, connected: bool) {
        self.pending.lock().queue.push_back((callback, connected));
    }

    /// Deliver queued notices unless another thread is already doing so
    fn dispatch(&self) {
        {
            let mut pending = self.pending.lock();
            if pending.dispatching {
                return;
            }
            pending.dispatching = true;
        }
        loop {
            let next = {
                let mut pending = self.pending.lock();
                match pending.queue.pop_front() {
                    Some(next) => next,
                    None => {
                        pending.dispatching = false;
                        return;
                    }
                }
            };
            let (callback, connected) = next;
            callback.on_state_change(connected);
        }
    }
}

/// Session context for one physical secure element
pub struct SecureElement {
    config: EseConfig,
    link: Arc<dyn TransceiveLink>,
    loader: Arc<dyn LoaderDownload>,
    session: Mutex<Session>,
    notices: Notices,
}

impl SecureElement {
    /// Create a session over `link`; the chip is powered lazily
    pub fn new(config: EseConfig, link: Arc<dyn TransceiveLink>) -> Self {
        Self {
            config,
            link,
            loader: Arc::new(NoLoader),
            session: Mutex::new(Session::new()),
            notices: Notices::default(),
        }
    }

    /// Use `loader` for selects of [`LOADER_AID`] on the basic channel
    pub fn with_loader(mut self, loader: Arc<dyn LoaderDownload>) -> Self {
        self.loader = loader;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        debug!("[{}] acquiring session lock", self.config.terminal_id);
        let guard = self.session.lock();
        debug!("[{}] session lock acquired", self.config.terminal_id);
        guard
    }

    fn endpoint(&self) -> EndpointGuard<'_> {
        EndpointGuard::enter(self.link.as_ref(), self.config.endpoint_context)
    }

    /// One raw exchange; the caller holds the lock and the endpoint context
    fn exchange(&self, command: &[u8]) -> Result<Vec<u8>, LinkError> {
        debug!("TX {}", hex::encode_upper(command));
        match self.link.exchange(command) {
            Ok(response) => {
                debug!("RX {}", hex::encode_upper(&response));
                Ok(response)
            }
            Err(e) => {
                error!("exchange failed: {}", e);
                Err(e)
            }
        }
    }

    /// Open (if needed) and initialise the chip
    fn chip_init(&self, session: &mut Session) -> Result<(), LinkError> {
        let mode = self.config.init_mode;
        if !session.link_open {
            self.link.open(mode)?;
            session.link_open = true;
        }
        {
            let _endpoint = self.endpoint();
            self.link.init(mode)?;
        }
        session.initialized = true;
        let osu = session.osu.on_event(self.link.as_ref(), OsuEvent::Init);
        info!("[{}] eSE initialised, OSU mode {:?}", self.config.terminal_id, osu);
        Ok(())
    }

    /// Deinitialise the chip and reset every channel
    ///
    /// Local state is reset even if the link refuses, so that an empty
    /// channel table always means an uninitialised chip.
    fn chip_deinit(&self, session: &mut Session) -> SecureElementStatus {
        let result = if session.initialized {
            let _endpoint = self.endpoint();
            self.link.deinit()
        } else {
            Ok(())
        };
        session.clear();
        match result {
            Ok(()) => {
                info!("[{}] eSE deinitialised", self.config.terminal_id);
                SecureElementStatus::Success
            }
            Err(e) => {
                warn!("[{}] eSE deinit failed: {}", self.config.terminal_id, e);
                SecureElementStatus::Failed
            }
        }
    }

    fn ensure_initialized(&self, session: &mut Session) -> Result<(), SecureElementStatus> {
        if session.initialized {
            return Ok(());
        }
        self.chip_init(session).map_err(|e| {
            error!("[{}] lazy eSE init failed: {}", self.config.terminal_id, e);
            SecureElementStatus::IoError
        })
    }

    /// Power the chip down again if this request initialised it and left no channel open
    fn release_if_idle(&self, session: &mut Session, powered_here: bool) {
        if powered_here && session.initialized && session.channels.is_empty() {
            debug!("[{}] nothing opened, powering down", self.config.terminal_id);
            self.chip_deinit(session);
        }
    }

    /// SELECT `aid` on `channel` and classify the answer
    fn select(&self, channel: u8, p2: u8, aid: &[u8]) -> (Vec<u8>, SecureElementStatus) {
        let command = APDU::select_by_name(channel, p2, aid).to_bytes();
        let raw = match self.exchange(&command) {
            Ok(raw) => raw,
            Err(e) if e.is_io_error() => return (Vec::new(), SecureElementStatus::IoError),
            Err(_) => return (Vec::new(), SecureElementStatus::Failed),
        };
        match Response::from_bytes(&raw) {
            Ok(response) => {
                let status = SecureElementStatus::from_select_sw(response.sw());
                debug!("SELECT on channel {} -> {:04X} {}", channel, response.sw(), status);
                (response.to_bytes(), status)
            }
            Err(e) => {
                warn!("malformed SELECT response: {}", e);
                (Vec::new(), SecureElementStatus::Failed)
            }
        }
    }

    /// Allocate a logical channel through MANAGE CHANNEL
    fn manage_channel_open(&self, session: &mut Session) -> Result<u8, SecureElementStatus> {
        let raw = self
            .exchange(&MANAGE_CHANNEL_OPEN)
            .map_err(|_| SecureElementStatus::IoError)?;
        let response = Response::from_bytes(&raw).map_err(|_| SecureElementStatus::IoError)?;

        match response.sw() {
            SW::FUNCTION_NOT_SUPPORTED => Err(SecureElementStatus::ChannelNotAvailable),
            SW::SUCCESS => {
                let channel = response
                    .data
                    .first()
                    .copied()
                    .filter(|&n| ChannelTable::is_logical(n))
                    .ok_or_else(|| {
                        warn!("MANAGE CHANNEL returned no usable channel: {:02X?}", response.data);
                        SecureElementStatus::Failed
                    })?;
                if !session.channels.mark_open(channel) {
                    warn!("channel {} was already marked open", channel);
                }
                Ok(channel)
            }
            sw if SW::is_unsupported_command(sw) => Err(SecureElementStatus::UnsupportedOperation),
            sw => {
                warn!("unexpected MANAGE CHANNEL status {:04X}", sw);
                Err(SecureElementStatus::IoError)
            }
        }
    }

    /// Register `callback` and power the chip
    ///
    /// Calling this on an initialised chip only re-announces it.
    pub fn init(&self, callback: Arc<dyn StateChangeCallback>) -> SecureElementStatus {
        let status = {
            let mut session = self.lock();
            session.callback = Some(callback);
            if session.initialized {
                self.notices.push(&session, true);
                SecureElementStatus::Success
            } else {
                match self.chip_init(&mut session) {
                    Ok(()) => {
                        self.notices.push(&session, true);
                        SecureElementStatus::Success
                    }
                    Err(e) => {
                        error!("[{}] eSE init failed: {}", self.config.terminal_id, e);
                        SecureElementStatus::IoError
                    }
                }
            }
        };
        self.notices.dispatch();
        status
    }

    /// Answer to reset of the chip
    pub fn get_atr(&self) -> Vec<u8> {
        self.link.atr()
    }

    /// The eSE is soldered on the board
    pub fn is_card_present(&self) -> bool {
        true
    }

    /// Send raw bytes to the chip and return its raw answer
    ///
    /// An empty result means the exchange failed or the frame was not allowed
    /// while OSU mode is active.
    pub fn transmit(&self, data: &[u8]) -> Vec<u8> {
        let mut frame = data.to_vec();
        let mut session = self.lock();

        let mode = match session.osu.check_transmit(
            self.link.as_ref(),
            self.config.endpoint_context,
            &mut frame,
        ) {
            Ok(mode) => mode,
            Err(e) => {
                warn!("rejecting frame in OSU mode: {}", e);
                return Vec::new();
            }
        };
        match mode {
            OsuApduMode::NonOsu => {
                warn!("frame blocked while OSU mode is active");
                return Vec::new();
            }
            OsuApduMode::Reset => return Response::status(SW::SUCCESS).to_bytes(),
            OsuApduMode::Proprietary | OsuApduMode::GlobalPlatform => {}
        }

        let _endpoint = self.endpoint();
        self.exchange(&frame).unwrap_or_default()
    }

    /// Select `aid` on the basic channel
    ///
    /// Returns the select response (status word included) and its
    /// classification. Selecting [`LOADER_AID`] starts the loader download
    /// instead of reaching the chip.
    pub fn open_basic_channel(&self, aid: &[u8], p2: u8) -> (Vec<u8>, SecureElementStatus) {
        let result = {
            let mut session = self.lock();
            let powered_here = !session.initialized;
            let result = self.open_basic_locked(&mut session, aid, p2);
            self.release_if_idle(&mut session, powered_here);
            result
        };
        self.notices.dispatch();
        result
    }

    fn open_basic_locked(
        &self,
        session: &mut Session,
        aid: &[u8],
        p2: u8,
    ) -> (Vec<u8>, SecureElementStatus) {
        if let Err(status) = self.ensure_initialized(session) {
            return (Vec::new(), status);
        }

        if session.osu.on_event(self.link.as_ref(), OsuEvent::OpenBasic(aid))
            == OsuApduMode::Proprietary
        {
            session.channels.mark_open(BASIC_CHANNEL);
            return (Response::status(SW::SUCCESS).to_bytes(), SecureElementStatus::Success);
        }

        if aid == LOADER_AID {
            return self.loader_download(session);
        }

        let _endpoint = self.endpoint();
        let (response, status) = self.select(BASIC_CHANNEL, p2, aid);
        if status.is_success() {
            session.channels.mark_open(BASIC_CHANNEL);
        }
        (response, status)
    }

    fn loader_download(&self, session: &mut Session) -> (Vec<u8>, SecureElementStatus) {
        info!("[{}] loader AID selected, starting download", self.config.terminal_id);
        match self.loader.perform_download(session.callback.clone()) {
            DownloadStatus::Success => {
                session.channels.mark_open(BASIC_CHANNEL);
                (Response::status(SW::SUCCESS).to_bytes(), SecureElementStatus::Success)
            }
            DownloadStatus::Failed => {
                error!("[{}] loader download could not be started", self.config.terminal_id);
                self.notices.push(session, false);
                (Response::status(SW::INCORRECT_P1_P2).to_bytes(), SecureElementStatus::Failed)
            }
        }
    }

    /// Allocate a logical channel and select `aid` on it
    pub fn open_logical_channel(
        &self,
        aid: &[u8],
        p2: u8,
    ) -> (LogicalChannelResponse, SecureElementStatus) {
        let mut session = self.lock();
        let powered_here = !session.initialized;
        let result = self.open_logical_locked(&mut session, aid, p2);
        self.release_if_idle(&mut session, powered_here);
        result
    }

    fn open_logical_locked(
        &self,
        session: &mut Session,
        aid: &[u8],
        p2: u8,
    ) -> (LogicalChannelResponse, SecureElementStatus) {
        let mut response = LogicalChannelResponse::unallocated();

        if let Err(status) = self.ensure_initialized(session) {
            return (response, status);
        }

        if session.osu.on_event(self.link.as_ref(), OsuEvent::OpenLogical(aid))
            == OsuApduMode::Proprietary
        {
            // dedicated traffic always runs on the basic channel
            session.channels.mark_open(BASIC_CHANNEL);
            response.channel_number = BASIC_CHANNEL;
            response.select_response = Response::status(SW::SUCCESS).to_bytes();
            return (response, SecureElementStatus::Success);
        }

        let _endpoint = self.endpoint();
        let channel = match self.manage_channel_open(session) {
            Ok(channel) => channel,
            Err(status) => {
                debug!("MANAGE CHANNEL -> {}", status);
                return (response, status);
            }
        };
        info!("[{}] logical channel {} allocated", self.config.terminal_id, channel);

        response.channel_number = channel;
        let (select_response, status) = self.select(channel, p2, aid);
        response.select_response = select_response;
        (response, status)
    }

    /// Close `channel`, powering the chip down once no channel is left open
    pub fn close_channel(&self, channel: u8) -> SecureElementStatus {
        if !ChannelTable::is_valid(channel) {
            error!("invalid channel {}", channel);
            return SecureElementStatus::Failed;
        }

        let mut session = self.lock();
        let mut status = SecureElementStatus::Failed;

        if channel != BASIC_CHANNEL {
            let _endpoint = self.endpoint();
            let command = APDU::manage_channel_close(channel).to_bytes();
            status = match self.exchange(&command) {
                Ok(raw) if Response::from_bytes(&raw).map_or(false, |r| r.is_okay()) => {
                    SecureElementStatus::Success
                }
                Ok(_) => SecureElementStatus::Failed,
                Err(e) => {
                    warn!("closing channel {} failed: {}", channel, e);
                    SecureElementStatus::Failed
                }
            };
        }

        if channel == BASIC_CHANNEL || status.is_success() {
            session.channels.mark_closed(channel);
            session.osu.on_event(self.link.as_ref(), OsuEvent::Close(channel));
            status = if session.channels.is_empty() {
                self.chip_deinit(&mut session)
            } else {
                SecureElementStatus::Success
            };
        }
        debug!("close channel {} -> {}", channel, status);
        status
    }

    /// Power cycle the chip, dropping every open channel
    pub fn reset(&self) -> SecureElementStatus {
        let status = {
            let mut session = self.lock();
            session.osu.on_event(self.link.as_ref(), OsuEvent::Reset);
            self.notices.push(&session, false);

            let deinit = self.chip_deinit(&mut session);
            match self.chip_init(&mut session) {
                Ok(()) => {
                    self.notices.push(&session, true);
                    deinit
                }
                Err(e) => {
                    error!("[{}] eSE re-init failed: {}", self.config.terminal_id, e);
                    SecureElementStatus::Failed
                }
            }
        };
        self.notices.dispatch();
        status
    }

    /// Forced teardown after the registered client went away
    ///
    /// Serialised with every other request; the chip is deinitialised and
    /// closed regardless of open channels.
    pub fn client_died(&self) {
        {
            let mut session = self.lock();
            warn!(
                "[{}] client died, tearing down eSE with channels {:?} open",
                self.config.terminal_id,
                session.channels.open_channels().collect::<Vec<_>>()
            );
            {
                let _endpoint = self.endpoint();
                if let Err(e) = self.link.deinit() {
                    warn!("deinit during teardown failed: {}", e);
                }
            }
            if let Err(e) = self.link.close() {
                warn!("close during teardown failed: {}", e);
            }
            session.clear();
            session.link_open = false;
            if let Some(callback) = session.callback.take() {
                self.notices.push_to(callback, false);
            }
        }
        self.notices.dispatch();
    }

    pub fn is_initialized(&self) -> bool {
        self.lock().initialized
    }

    pub fn open_channel_count(&self) -> u8 {
        self.lock().channels.open_count()
    }

    pub fn is_channel_open(&self, channel: u8) -> bool {
        self.lock().channels.is_open(channel)
    }

    /// Whether dedicated OSU mode was entered by a client
    pub fn app_osu_mode(&self) -> bool {
        self.lock().osu.app_osu_mode()
    }
}
