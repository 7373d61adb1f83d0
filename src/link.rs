//! Host transport seam: port trait, transfer handles and completion events.
//!
//! This module contains the boundary between the session manager and the
//! underlying serial-transport device stack (USB CDC, a UART with a framing
//! driver, a pseudo-terminal under test).  The device stack itself -
//! enumeration, control transfers, configuration events - lives outside this
//! crate; a [`LinkPort`] implementation adapts it.
//!
//! # Possible implementations
//!
//! - For MCU firmware: wrap the vendor USB CDC function driver, submitting
//!   endpoint transfers and raising [`LinkEvent`]s from its completion
//!   interrupts
//! - For PC-based applications and tests: an in-memory port that completes
//!   transfers from scripted data
//!
//! # Completion signalling
//!
//! Transfers complete asynchronously, typically in interrupt context.  The
//! driver side must not touch session state from there; instead it pushes a
//! [`LinkEvent`] into a [`LinkEventQueue`], whose consumer half is owned by
//! the session and drained on its next poll.  The queue is single-producer/
//! single-consumer: the event payload is fully written before the push
//! publishes it, so the poll loop never observes a half-raised completion.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use heapless::spsc::{Consumer, Producer, Queue};

/// Depth of the link completion-event queue.
///
/// At most one read and one write are outstanding per session, plus
/// configuration changes; a handful of slots is plenty.
pub const LINK_EVENT_DEPTH: usize = 8;

/// Completion-event queue between driver interrupt glue and the session.
pub type LinkEventQueue = Queue<LinkEvent, LINK_EVENT_DEPTH>;

/// Producer half, held by the driver's interrupt glue.
pub type LinkEventProducer<'q> = Producer<'q, LinkEvent, LINK_EVENT_DEPTH>;

/// Consumer half, owned by the session.
pub type LinkEventConsumer<'q> = Consumer<'q, LinkEvent, LINK_EVENT_DEPTH>;

/// Handle identifying one outstanding transfer on a [`LinkPort`].
///
/// Handles are assigned by the port and become meaningless after a
/// configuration loss; the session compares completion events against its
/// recorded handles and ignores stale ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferHandle(pub u32);

impl TransferHandle {
    /// Sentinel for "no transfer outstanding".
    pub const INVALID: TransferHandle = TransferHandle(u32::MAX);

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

/// Events raised by the transport driver towards the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// Host selected a configuration; the session may transact.
    Configured,
    /// Configuration lost (reset, suspend, cable pull).
    Deconfigured,
    /// A read transfer completed with `len` bytes held by the driver.
    ReadDone { handle: TransferHandle, len: usize },
    /// A write transfer was fully sent.
    WriteDone { handle: TransferHandle },
}

/// Port trait.
///
/// All methods are non-blocking.  Completion of reads and writes is
/// signalled out-of-band via [`LinkEvent`]s.
pub trait LinkPort {
    /// The error type returned by port operations.
    ///
    /// This allows implementations to use their own error types (vendor
    /// driver status codes, `std::io::Error` under test).
    type Error: core::fmt::Debug;

    /// Try to open the device layer.
    ///
    /// May fail while the stack is still initializing; the session retries
    /// on every poll until it succeeds.
    fn open(&mut self) -> Result<(), Self::Error>;

    /// Arm one asynchronous read.
    ///
    /// The driver reads into its own endpoint storage and raises
    /// [`LinkEvent::ReadDone`] with the returned handle when data arrives.
    /// At most one read may be armed at a time.
    fn begin_read(&mut self) -> Result<TransferHandle, Self::Error>;

    /// Copy the payload of a completed read out of the driver.
    ///
    /// Valid only after [`LinkEvent::ReadDone`] for `handle` and before the
    /// next [`Self::begin_read()`].  Returns the number of bytes copied,
    /// truncated to `buf.len()`.
    fn read_data(&mut self, handle: TransferHandle, buf: &mut [u8]) -> Result<usize, Self::Error>;

    /// Start one asynchronous write of `data`.
    ///
    /// The driver must copy or fully consume `data` before returning; the
    /// caller's buffer is not borrowed past this call.  Completion is
    /// raised as [`LinkEvent::WriteDone`] with the returned handle.  At
    /// most one write may be in flight at a time.
    fn begin_write(&mut self, data: &[u8]) -> Result<TransferHandle, Self::Error>;
}

/// Nominal serial line configuration reported to the host.
///
/// The link is a virtual byte stream; the line coding is reported on
/// request but never enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineCoding {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: StopBits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBits {
    One,
    Two,
}

impl Default for LineCoding {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: StopBits::One,
        }
    }
}
