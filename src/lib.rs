//! Acquisition and host-link firmware core for FPGA-based sampling
//! instruments.
//!
//! This crate contains the three cooperating, non-blocking engines of an
//! instrument front-end: sample acquisition from an FPGA data path, a framed
//! session over a byte-stream host transport, and the protocol engine that
//! ties the two together and exposes the instrument's control registers to
//! the host.
//!
//! `no_std`, allocation-free.  All hardware access goes through seams so the
//! core runs unchanged on any MCU (or on a workstation under test):
//!
//! - the host transport device is a [`link::LinkPort`] implementation,
//!   raising completion events through a single-producer/single-consumer
//!   queue from interrupt context;
//! - the FPGA sample pins are a [`pins::SamplerPort`] implementation
//!   (a generic [`pins::ParallelSampler`] over `embedded-hal` digital pins
//!   is provided);
//! - the register-backing buses are `embedded-hal` [`SpiBus`] and [`I2c`]
//!   implementations.
//!
//! ## Architecture
//!
//! Everything is polled.  Each engine exposes one `step()` function which
//! never blocks: a wait condition means "stay in this state until the next
//! poll observes the condition".  Steps report whether they made progress
//! via [`step::Step`], and [`step::drive()`] re-invokes a step until it
//! settles, so a state that in hardware terms "falls through" to the next
//! one completes within a single scheduler iteration.
//!
//! [`sched::Instrument`] owns all engine state and composes the per-poll
//! ordering: transport session first, then acquisition, then the protocol
//! engine.  Interrupts never run business logic; they only push
//! [`link::LinkEvent`]s which the session consumes on its next step.
//!
//! ## Wire protocol
//!
//! Host messages are binary frames:
//!
//! ```text
//! START(0x1E) | type | command | fixed field block | payload | END(0x04)
//! ```
//!
//! Reserved bytes occurring inside the field block or payload are prefixed
//! with ESCAPE(0x1A) on encode and taken literally after an ESCAPE on
//! decode.  See [`proto`] for the full message model.
//!
//! ## Modules
//!
//! - [`step`] - progress reporting and the immediate-reevaluation helper
//! - [`link`] - host transport seam: port trait, transfer handles, events
//! - [`session`] - transport session manager (transmit gate, receive engine)
//! - [`pins`] - acquisition pin seam over `embedded-hal`
//! - [`acq`] - trigger-wait/sample-burst controller and sample buffer
//! - [`proto`] - wire format and the protocol engine
//! - [`regs`] - virtual register spaces and their backing bus transactions
//! - [`sched`] - top-level scheduler composing the engines
//!
//! [`SpiBus`]: embedded_hal::spi::SpiBus
//! [`I2c`]: embedded_hal::i2c::I2c

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#![no_std]

#[cfg(test)]
extern crate std;

pub mod acq;
pub mod link;
pub mod pins;
pub mod proto;
pub mod regs;
pub mod sched;
pub mod session;
pub mod step;

/// Default sample buffer capacity in bytes.
pub const SAMPLES: usize = 8192;

/// Firmware core errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Transfer gate is not ready to accept work
    Busy,
    /// Buffer too small for the requested transfer
    BufferTooSmall,
    /// Transport device is not configured
    NotConfigured,
    /// Frame does not begin with the start byte
    BadStart,
    /// Message type tag is not a host command
    BadType,
    /// Unknown command tag
    BadCommand,
    /// Declared variable length is invalid or over the limit
    BadLength,
    /// Frame ended before the declared fields
    Truncated,
    /// Transport driver error
    Link,
    /// Register-backing bus error
    Bus,
}

/// Type to represent the result of a firmware core operation
pub type Result<T> = core::result::Result<T, Error>;
