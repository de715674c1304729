//! In-process secure element
//!
//! `VirtualEse` behaves like a chip with four logical channels and a fixed
//! set of applets. It can be scripted to return arbitrary responses or
//! failures, and it records every exchange so the traffic seen at the link
//! boundary can be inspected.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use log::{debug, info};
use parking_lot::Mutex;

use super::{InitMode, OsMode, TransceiveLink};
use crate::apdu::{ins, p1, parse_apdu, Response, BASIC_CHANNEL, MAX_CHANNELS, SW};
use crate::error::LinkError;

/// SW returned when closing or selecting on a channel that is not open
const SW_LOGICAL_CHANNEL_NOT_SUPPORTED: u16 = 0x6881;
const SW_REFERENCED_DATA_NOT_FOUND: u16 = 0x6A88;

/// Historical bytes advertised in the virtual ATR
const HISTORICAL_BYTES: &[u8] = b"vESE";

/// Number of calls made to each lifecycle entry point
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LifecycleCounters {
    pub open: usize,
    pub init: usize,
    pub deinit: usize,
    pub close: usize,
    pub os_update_resets: usize,
}

struct ChipState {
    opened: bool,
    initialized: bool,
    os_mode: OsMode,
    channels: [bool; MAX_CHANNELS as usize],
    applets: Vec<Vec<u8>>,
    scripted: VecDeque<Result<Vec<u8>, LinkError>>,
    fail_init: bool,
    fail_deinit: bool,
    active_context: Option<u8>,
    exchanges: Vec<Vec<u8>>,
    counters: LifecycleCounters,
}

/// Simulated eSE implementing [`TransceiveLink`]
pub struct VirtualEse {
    state: Mutex<ChipState>,
    exchange_delay: Duration,
    in_flight: AtomicUsize,
    violations: AtomicUsize,
    atr: Vec<u8>,
}

impl VirtualEse {
    /// Create a chip with no applets installed
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ChipState {
                opened: false,
                initialized: false,
                os_mode: OsMode::Normal,
                channels: [false; MAX_CHANNELS as usize],
                applets: Vec::new(),
                scripted: VecDeque::new(),
                fail_init: false,
                fail_deinit: false,
                active_context: None,
                exchanges: Vec::new(),
                counters: LifecycleCounters::default(),
            }),
            exchange_delay: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            violations: AtomicUsize::new(0),
            atr: build_atr(HISTORICAL_BYTES),
        }
    }

    /// Install an applet that answers SELECT for `aid`
    pub fn with_applet(self, aid: &[u8]) -> Self {
        self.state.lock().applets.push(aid.to_vec());
        self
    }

    /// Hold every exchange for `delay`, to widen race windows in tests
    pub fn with_exchange_delay(mut self, delay: Duration) -> Self {
        self.exchange_delay = delay;
        self
    }

    /// Queue a response returned by the next exchange instead of the simulated one
    pub fn push_response(&self, response: Result<Vec<u8>, LinkError>) {
        self.state.lock().scripted.push_back(response);
    }

    pub fn set_os_mode(&self, mode: OsMode) {
        self.state.lock().os_mode = mode;
    }

    pub fn set_fail_init(&self, fail: bool) {
        self.state.lock().fail_init = fail;
    }

    pub fn set_fail_deinit(&self, fail: bool) {
        self.state.lock().fail_deinit = fail;
    }

    /// Every command received so far, in order
    pub fn exchanges(&self) -> Vec<Vec<u8>> {
        self.state.lock().exchanges.clone()
    }

    pub fn counters(&self) -> LifecycleCounters {
        self.state.lock().counters
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().opened
    }

    /// Whether the chip considers `channel` open
    pub fn channel_open(&self, channel: u8) -> bool {
        self.state
            .lock()
            .channels
            .get(channel as usize)
            .copied()
            .unwrap_or(false)
    }

    /// Number of bracketing or overlapping exchange violations observed
    ///
    /// An exchange outside an endpoint context, a context set twice, or two
    /// exchanges in flight at once each count as one violation.
    pub fn violations(&self) -> usize {
        self.violations.load(Ordering::SeqCst)
    }

    fn violation(&self, what: &str) {
        debug!("virtual eSE protocol violation: {}", what);
        self.violations.fetch_add(1, Ordering::SeqCst);
    }

    fn process_apdu(state: &mut ChipState, command: &[u8]) -> Vec<u8> {
        let cmd = match parse_apdu(command) {
            Ok(cmd) => cmd,
            Err(_) => return Response::status(SW::WRONG_LENGTH).to_bytes(),
        };
        let channel = cmd.channel() as usize;

        if channel != BASIC_CHANNEL as usize && !state.channels[channel] {
            return Response::status(SW_LOGICAL_CHANNEL_NOT_SUPPORTED).to_bytes();
        }

        match (cmd.ins, cmd.p1) {
            (ins::MANAGE_CHANNEL, 0x00) => {
                match (1..MAX_CHANNELS as usize).find(|&n| !state.channels[n]) {
                    Some(n) => {
                        state.channels[n] = true;
                        Response::new(vec![n as u8], SW::SUCCESS).to_bytes()
                    }
                    None => Response::status(SW::FUNCTION_NOT_SUPPORTED).to_bytes(),
                }
            }
            (ins::MANAGE_CHANNEL, p1::MANAGE_CHANNEL_CLOSE) => {
                let target = cmd.p2 as usize;
                if target == 0 || target >= MAX_CHANNELS as usize || !state.channels[target] {
                    return Response::status(SW_REFERENCED_DATA_NOT_FOUND).to_bytes();
                }
                state.channels[target] = false;
                Response::status(SW::SUCCESS).to_bytes()
            }
            (ins::SELECT, p1::SELECT_BY_NAME) => {
                if state.applets.iter().any(|aid| *aid == cmd.data) {
                    // FCI template carrying the DF name
                    let mut fci = vec![0x84, cmd.data.len() as u8];
                    fci.extend_from_slice(&cmd.data);
                    let mut data = vec![0x6F, fci.len() as u8];
                    data.extend_from_slice(&fci);
                    Response::new(data, SW::SUCCESS).to_bytes()
                } else {
                    Response::status(SW::FILE_NOT_FOUND).to_bytes()
                }
            }
            _ => Response::status(SW::INS_NOT_SUPPORTED).to_bytes(),
        }
    }
}

impl Default for VirtualEse {
    fn default() -> Self {
        Self::new()
    }
}

impl TransceiveLink for VirtualEse {
    fn open(&self, mode: InitMode) -> Result<(), LinkError> {
        let mut state = self.state.lock();
        state.counters.open += 1;
        state.opened = true;
        info!("virtual eSE opened ({:?})", mode);
        Ok(())
    }

    fn init(&self, mode: InitMode) -> Result<(), LinkError> {
        let mut state = self.state.lock();
        state.counters.init += 1;
        if !state.opened {
            return Err(LinkError::NotOpen);
        }
        if state.fail_init {
            return Err(LinkError::Driver("init rejected".to_string()));
        }
        state.initialized = true;
        info!("virtual eSE initialised ({:?})", mode);
        Ok(())
    }

    fn deinit(&self) -> Result<(), LinkError> {
        let mut state = self.state.lock();
        state.counters.deinit += 1;
        if state.fail_deinit {
            return Err(LinkError::Driver("deinit rejected".to_string()));
        }
        state.initialized = false;
        state.channels = [false; MAX_CHANNELS as usize];
        Ok(())
    }

    fn close(&self) -> Result<(), LinkError> {
        let mut state = self.state.lock();
        state.counters.close += 1;
        state.opened = false;
        state.initialized = false;
        state.channels = [false; MAX_CHANNELS as usize];
        Ok(())
    }

    fn set_endpoint_context(&self, id: u8) -> Result<(), LinkError> {
        let mut state = self.state.lock();
        if state.active_context.is_some() {
            drop(state);
            self.violation("endpoint context set twice");
            return Err(LinkError::EndpointContext(id));
        }
        state.active_context = Some(id);
        Ok(())
    }

    fn reset_endpoint_context(&self, id: u8) -> Result<(), LinkError> {
        let mut state = self.state.lock();
        if state.active_context != Some(id) {
            drop(state);
            self.violation("endpoint context reset without matching set");
            return Ok(());
        }
        state.active_context = None;
        Ok(())
    }

    fn exchange(&self, command: &[u8]) -> Result<Vec<u8>, LinkError> {
        if self.in_flight.fetch_add(1, Ordering::SeqCst) != 0 {
            self.violation("overlapping exchanges");
        }
        {
            let mut state = self.state.lock();
            if state.active_context.is_none() {
                drop(state);
                self.violation("exchange outside endpoint context");
                state = self.state.lock();
            }
            state.exchanges.push(command.to_vec());
        }

        if !self.exchange_delay.is_zero() {
            thread::sleep(self.exchange_delay);
        }

        let result = {
            let mut state = self.state.lock();
            if let Some(scripted) = state.scripted.pop_front() {
                scripted
            } else if !state.initialized {
                Err(LinkError::NotOpen)
            } else {
                Ok(Self::process_apdu(&mut state, command))
            }
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn os_mode(&self) -> OsMode {
        self.state.lock().os_mode
    }

    fn reset_os_update(&self) -> Result<(), LinkError> {
        let mut state = self.state.lock();
        if state.active_context.is_none() {
            drop(state);
            self.violation("OS update reset outside endpoint context");
            state = self.state.lock();
        }
        state.counters.os_update_resets += 1;
        state.os_mode = OsMode::Normal;
        Ok(())
    }

    fn atr(&self) -> Vec<u8> {
        self.atr.clone()
    }
}

/// Build a T=1 ATR with specific historical bytes
pub fn build_atr(historical_bytes: &[u8]) -> Vec<u8> {
    let hist_len = historical_bytes.len().min(15);
    let mut atr = Vec::with_capacity(hist_len + 4);

    // TS: direct convention
    atr.push(0x3B);
    // T0: TD1 present, K historical bytes
    atr.push(0x80 | hist_len as u8);
    // TD1: T=1, no further interface bytes
    atr.push(0x01);
    atr.extend_from_slice(&historical_bytes[..hist_len]);

    // TCK: XOR of T0 up to the last historical byte
    let tck = atr[1..].iter().fold(0u8, |acc, &b| acc ^ b);
    atr.push(tck);
    atr
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apdu::{APDU, MANAGE_CHANNEL_OPEN};

    const AID: &[u8] = &[0xA0, 0x00, 0x00, 0x01, 0x51];

    fn powered_chip() -> VirtualEse {
        let chip = VirtualEse::new().with_applet(AID);
        chip.open(InitMode::Normal).unwrap();
        chip.init(InitMode::Normal).unwrap();
        chip
    }

    fn bracketed(chip: &VirtualEse, command: &[u8]) -> Result<Vec<u8>, LinkError> {
        chip.set_endpoint_context(0).unwrap();
        let rsp = chip.exchange(command);
        chip.reset_endpoint_context(0).unwrap();
        rsp
    }

    #[test]
    fn test_manage_channel_allocates_in_order() {
        let chip = powered_chip();
        for expected in 1..=3u8 {
            assert_eq!(bracketed(&chip, &MANAGE_CHANNEL_OPEN).unwrap(), vec![expected, 0x90, 0x00]);
        }
        assert_eq!(bracketed(&chip, &MANAGE_CHANNEL_OPEN).unwrap(), vec![0x6A, 0x81]);
        assert_eq!(chip.violations(), 0);
    }

    #[test]
    fn test_select_on_open_channel() {
        let chip = powered_chip();
        bracketed(&chip, &MANAGE_CHANNEL_OPEN).unwrap();
        let rsp = bracketed(&chip, &APDU::select_by_name(1, 0, AID).to_bytes()).unwrap();
        assert_eq!(Response::from_bytes(&rsp).unwrap().sw(), SW::SUCCESS);
        assert_eq!(rsp[0], 0x6F);

        let rsp = bracketed(&chip, &APDU::select_by_name(2, 0, AID).to_bytes()).unwrap();
        assert_eq!(rsp, vec![0x68, 0x81]);
    }

    #[test]
    fn test_close_channel() {
        let chip = powered_chip();
        bracketed(&chip, &MANAGE_CHANNEL_OPEN).unwrap();
        assert!(chip.channel_open(1));
        let rsp = bracketed(&chip, &APDU::manage_channel_close(1).to_bytes()).unwrap();
        assert_eq!(rsp, vec![0x90, 0x00]);
        assert!(!chip.channel_open(1));
    }

    #[test]
    fn test_scripted_response_wins() {
        let chip = powered_chip();
        chip.push_response(Err(LinkError::Transceive { response: vec![0x64, 0xFF] }));
        assert!(bracketed(&chip, &MANAGE_CHANNEL_OPEN).unwrap_err().is_io_error());
        assert_eq!(chip.exchanges().len(), 1);
    }

    #[test]
    fn test_exchange_requires_init() {
        let chip = VirtualEse::new();
        assert_eq!(bracketed(&chip, &MANAGE_CHANNEL_OPEN), Err(LinkError::NotOpen));
    }

    #[test]
    fn test_unbracketed_exchange_is_a_violation() {
        let chip = powered_chip();
        chip.exchange(&MANAGE_CHANNEL_OPEN).unwrap();
        assert_eq!(chip.violations(), 1);
    }

    #[test]
    fn test_nested_endpoint_context_is_rejected() {
        let chip = powered_chip();
        chip.set_endpoint_context(0).unwrap();
        assert_eq!(chip.set_endpoint_context(0), Err(LinkError::EndpointContext(0)));
        chip.reset_endpoint_context(0).unwrap();
        assert_eq!(chip.violations(), 1);
    }

    #[test]
    fn test_build_atr() {
        let atr = build_atr(b"vESE");
        assert_eq!(atr[0], 0x3B);
        assert_eq!(atr[1], 0x84);
        assert_eq!(atr.len(), 3 + 4 + 1);
        let tck = atr[1..atr.len() - 1].iter().fold(0u8, |acc, &b| acc ^ b);
        assert_eq!(*atr.last().unwrap(), tck);
    }
}
