//! Transport session manager.
//!
//! Owns the [`LinkPort`] device and runs the configuration lifecycle, a
//! gated transmitter and a chunked receive engine.  Everything is polled
//! from [`Session::step()`]; transfer completions arrive as [`LinkEvent`]s
//! pushed by the driver's interrupt glue and are drained here, never acted
//! on in interrupt context.
//!
//! Two receive modes are supported:
//!
//! - **fixed-length**: chunks accumulate into the frame buffer until the
//!   target length is reached; excess bytes in the final chunk are
//!   truncated.
//! - **auto-terminated**: chunks are additionally scanned for an un-escaped
//!   terminator byte.  A terminator preceded by the escape byte does not
//!   count (the pending-escape flag carries across chunk boundaries).  On a
//!   match the terminator is stripped, trailing bytes are discarded and the
//!   completion flag is set; reaching the target length without a match
//!   sets the failure flag instead, so a garbled, never-terminated message
//!   cannot hang the session.
//!
//! Exactly one receive and one transmit may be outstanding at a time.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::link::{LineCoding, LinkEvent, LinkEventConsumer, LinkPort, TransferHandle};
use crate::step::Step;
use crate::{Error, Result};

/// Size of one read chunk copied out of the driver, matching a full-speed
/// bulk endpoint.
pub const CHUNK_SIZE: usize = 64;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    /// Opening the device layer; retried every poll until it succeeds.
    Init,
    /// Waiting for the host to select a configuration.
    WaitForConfiguration,
    /// Steady state: transfers may be armed and completed.
    Transact,
}

/// Transmit/receive gate states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XferState {
    /// Transfer completed; promoted to `Ready` on the next poll.
    Idle,
    /// Gate open, a new transfer may be armed.
    Ready,
    /// Transfer in flight.
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxMode {
    None,
    Fixed,
    Auto,
}

/// Transport session over a [`LinkPort`].
///
/// `RX` is the frame-buffer capacity; a receive target may not exceed it.
pub struct Session<'q, L: LinkPort, const RX: usize> {
    port: L,
    events: LinkEventConsumer<'q>,

    state: SessionState,
    configured: bool,
    line_coding: LineCoding,

    tx_state: XferState,
    rx_state: XferState,
    read_handle: TransferHandle,
    write_handle: TransferHandle,

    rx_buf: [u8; RX],
    rx_len: usize,
    rx_mode: RxMode,
    rx_target: usize,
    rx_terminator: u8,
    rx_escape: u8,
    rx_escaped: bool,
    rx_done: bool,
    rx_failed: bool,

    chunk: [u8; CHUNK_SIZE],
}

impl<'q, L: LinkPort, const RX: usize> Session<'q, L, RX> {
    /// Create a session over `port`.
    ///
    /// Arguments:
    /// - `port` - the transport device seam
    /// - `events` - consumer half of the completion-event queue; the
    ///   producer half belongs to the driver's interrupt glue
    pub fn new(port: L, events: LinkEventConsumer<'q>) -> Self {
        Self {
            port,
            events,
            state: SessionState::Init,
            configured: false,
            line_coding: LineCoding::default(),
            tx_state: XferState::Ready,
            rx_state: XferState::Ready,
            read_handle: TransferHandle::INVALID,
            write_handle: TransferHandle::INVALID,
            rx_buf: [0; RX],
            rx_len: 0,
            rx_mode: RxMode::None,
            rx_target: 0,
            rx_terminator: 0,
            rx_escape: 0,
            rx_escaped: false,
            rx_done: false,
            rx_failed: false,
            chunk: [0; CHUNK_SIZE],
        }
    }

    /// Advance the session state machine by one step.
    pub fn step(&mut self) -> Step {
        match self.state {
            SessionState::Init => match self.port.open() {
                Ok(()) => {
                    debug!("link opened");
                    self.state = SessionState::WaitForConfiguration;
                    Step::Again
                }
                // Device layer not ready yet; try again next poll.
                Err(_) => Step::Idle,
            },

            SessionState::WaitForConfiguration => {
                self.drain_events();
                if self.configured {
                    debug!("link configured");
                    self.enter_transact();
                    Step::Again
                } else {
                    Step::Idle
                }
            }

            SessionState::Transact => {
                let mut progress = self.drain_events();

                if !self.configured {
                    self.reset_on_deconfigure();
                    return Step::Again;
                }

                if self.tx_state == XferState::Idle {
                    self.tx_state = XferState::Ready;
                    progress = true;
                }

                if self.rx_active() && self.rx_state == XferState::Ready {
                    self.arm_read();
                }

                if progress { Step::Again } else { Step::Idle }
            }
        }
    }

    /// Line configuration reported to the host on request.  Informational
    /// only; the byte stream is never reshaped to match.
    pub fn line_coding(&self) -> LineCoding {
        self.line_coding
    }

    pub fn set_line_coding(&mut self, coding: LineCoding) {
        self.line_coding = coding;
    }

    /// Whether the host has configured the device.
    pub fn configured(&self) -> bool {
        self.state == SessionState::Transact && self.configured
    }

    /// Whether the transmit gate will accept a frame.
    pub fn tx_ready(&self) -> bool {
        self.configured() && self.tx_state == XferState::Ready
    }

    /// Start an asynchronous transmission of `data`.
    ///
    /// Fails with [`Error::Busy`] unless the gate is `Ready`.  The port
    /// consumes `data` before this returns; completion returns the gate to
    /// `Ready` via the event queue.
    pub fn transmit(&mut self, data: &[u8]) -> Result<()> {
        if !self.configured() {
            return Err(Error::NotConfigured);
        }
        if self.tx_state != XferState::Ready {
            return Err(Error::Busy);
        }

        match self.port.begin_write(data) {
            Ok(handle) => {
                trace!("tx armed, {} bytes", data.len());
                self.write_handle = handle;
                self.tx_state = XferState::Busy;
                Ok(())
            }
            Err(e) => {
                warn!("tx arm failed: {e:?}");
                Err(Error::Link)
            }
        }
    }

    /// Start a fixed-length receive of exactly `target` bytes.
    pub fn receive(&mut self, target: usize) -> Result<()> {
        self.start_receive(RxMode::Fixed, target, 0, 0)
    }

    /// Start an auto-terminated receive.
    ///
    /// Completes when an un-escaped `terminator` arrives; fails (without
    /// completing) if `target` bytes accumulate first.
    pub fn receive_auto(&mut self, target: usize, terminator: u8, escape: u8) -> Result<()> {
        self.start_receive(RxMode::Auto, target, terminator, escape)
    }

    /// Whether the current receive completed.
    pub fn rx_complete(&self) -> bool {
        self.rx_done
    }

    /// Whether the current receive failed (overrun or never terminated).
    pub fn rx_failed(&self) -> bool {
        self.rx_failed
    }

    /// Whether a receive is in progress.
    pub fn rx_active(&self) -> bool {
        self.rx_mode != RxMode::None
    }

    /// The received frame so far (complete once [`Self::rx_complete()`]).
    pub fn frame(&self) -> &[u8] {
        &self.rx_buf[..self.rx_len]
    }

    /// Discard the current frame and all receive flags, freeing the engine
    /// for the next [`Self::receive()`]/[`Self::receive_auto()`].
    pub fn rx_reset(&mut self) {
        self.rx_mode = RxMode::None;
        self.rx_len = 0;
        self.rx_escaped = false;
        self.rx_done = false;
        self.rx_failed = false;
    }

    fn start_receive(&mut self, mode: RxMode, target: usize, terminator: u8, escape: u8) -> Result<()> {
        if !self.configured() {
            return Err(Error::NotConfigured);
        }
        if self.rx_active() {
            return Err(Error::Busy);
        }
        if target > RX {
            return Err(Error::BufferTooSmall);
        }

        self.rx_mode = mode;
        self.rx_target = target;
        self.rx_terminator = terminator;
        self.rx_escape = escape;
        self.rx_escaped = false;
        self.rx_len = 0;
        self.rx_done = false;
        self.rx_failed = false;
        Ok(())
    }

    fn enter_transact(&mut self) {
        self.state = SessionState::Transact;
        self.tx_state = XferState::Ready;
        self.rx_state = XferState::Ready;
        self.read_handle = TransferHandle::INVALID;
        self.write_handle = TransferHandle::INVALID;
    }

    /// Configuration loss: abandon in-flight transfers and offer fresh
    /// gates immediately on reconfiguration.  No host notification.
    fn reset_on_deconfigure(&mut self) {
        debug!("link configuration lost");
        self.state = SessionState::WaitForConfiguration;
        self.tx_state = XferState::Ready;
        self.rx_state = XferState::Ready;
        self.read_handle = TransferHandle::INVALID;
        self.write_handle = TransferHandle::INVALID;
        self.rx_reset();
    }

    /// Drain completion events.  Returns whether anything was consumed.
    fn drain_events(&mut self) -> bool {
        let mut any = false;
        while let Some(event) = self.events.dequeue() {
            any = true;
            match event {
                LinkEvent::Configured => self.configured = true,
                LinkEvent::Deconfigured => self.configured = false,
                LinkEvent::ReadDone { handle, len } => self.on_read_done(handle, len),
                LinkEvent::WriteDone { handle } => self.on_write_done(handle),
            }
        }
        any
    }

    fn on_write_done(&mut self, handle: TransferHandle) {
        if handle != self.write_handle || !handle.is_valid() {
            trace!("stale write completion {handle:?}");
            return;
        }
        self.write_handle = TransferHandle::INVALID;
        self.tx_state = XferState::Idle;
    }

    fn on_read_done(&mut self, handle: TransferHandle, len: usize) {
        if handle != self.read_handle || !handle.is_valid() {
            trace!("stale read completion {handle:?}");
            return;
        }
        self.read_handle = TransferHandle::INVALID;
        self.rx_state = XferState::Ready;

        let want = len.min(CHUNK_SIZE);
        let got = match self.port.read_data(handle, &mut self.chunk[..want]) {
            Ok(n) => n,
            Err(e) => {
                warn!("read copy-out failed: {e:?}");
                self.rx_failed = true;
                self.rx_mode = RxMode::None;
                return;
            }
        };

        match self.rx_mode {
            RxMode::None => trace!("dropping {got} unsolicited bytes"),
            RxMode::Fixed => self.ingest_fixed(got),
            RxMode::Auto => self.ingest_auto(got),
        }
    }

    fn ingest_fixed(&mut self, got: usize) {
        // Bytes beyond the target are truncated.
        let take = got.min(self.rx_target - self.rx_len);
        self.rx_buf[self.rx_len..self.rx_len + take].copy_from_slice(&self.chunk[..take]);
        self.rx_len += take;

        if self.rx_len == self.rx_target {
            self.rx_done = true;
            self.rx_mode = RxMode::None;
        }
    }

    fn ingest_auto(&mut self, got: usize) {
        for i in 0..got {
            let byte = self.chunk[i];

            if self.rx_len >= self.rx_target {
                self.rx_failed = true;
                self.rx_mode = RxMode::None;
                return;
            }

            if self.rx_escaped {
                self.rx_escaped = false;
            } else if byte == self.rx_escape {
                self.rx_escaped = true;
            } else if byte == self.rx_terminator {
                // Terminator stripped; anything after it is discarded.
                self.rx_done = true;
                self.rx_mode = RxMode::None;
                return;
            }

            self.rx_buf[self.rx_len] = byte;
            self.rx_len += 1;

            if self.rx_len == self.rx_target {
                // Never-terminated message; flag it rather than hang.
                self.rx_failed = true;
                self.rx_mode = RxMode::None;
                return;
            }
        }
    }

    fn arm_read(&mut self) {
        match self.port.begin_read() {
            Ok(handle) => {
                self.read_handle = handle;
                self.rx_state = XferState::Busy;
            }
            Err(e) => {
                // Leave the gate Ready and retry next poll.
                warn!("rx arm failed: {e:?}");
            }
        }
    }
}
