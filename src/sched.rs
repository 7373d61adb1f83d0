//! Top-level scheduler.
//!
//! [`Instrument`] owns the session, the acquisition controller, the
//! protocol engine and the register file, and runs them cooperatively:
//! one [`Instrument::poll()`] per driver-loop iteration, each engine's
//! step driven to quiescence in turn.  There is no other shared state -
//! everything is passed by reference between the components here.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use embedded_hal::digital::OutputPin;
use embedded_hal::i2c::I2c;
use embedded_hal::spi::SpiBus;

use crate::acq::Acquisition;
use crate::link::LinkPort;
use crate::pins::SamplerPort;
use crate::proto::{Engine, MAX_INCOMING};
use crate::regs::RegisterFile;
use crate::session::Session;
use crate::step::drive;
use crate::SAMPLES;

/// The composed instrument core.
///
/// Type parameters are the hardware seams: `L` the host link, `SP` the
/// sampler pins, `SF`/`SA` the FPGA and AFE SPI buses, `I` the DAC I2C
/// bus, `P` the DAC load strobe.  `N` is the sample buffer capacity.
pub struct Instrument<'q, L, SP, SF, SA, I, P, const N: usize = SAMPLES>
where
    L: LinkPort,
    SP: SamplerPort,
{
    session: Session<'q, L, MAX_INCOMING>,
    acq: Acquisition<SP, N>,
    engine: Engine,
    regs: RegisterFile<SF, SA, I, P>,
}

impl<'q, L, SP, SF, SA, I, P, const N: usize> Instrument<'q, L, SP, SF, SA, I, P, N>
where
    L: LinkPort,
    SP: SamplerPort,
    SF: SpiBus,
    SA: SpiBus,
    I: I2c,
    P: OutputPin,
{
    /// Compose the instrument from its parts.
    pub fn new(
        session: Session<'q, L, MAX_INCOMING>,
        acq: Acquisition<SP, N>,
        regs: RegisterFile<SF, SA, I, P>,
    ) -> Self {
        Self {
            session,
            acq,
            engine: Engine::new(),
            regs,
        }
    }

    /// Run one scheduler iteration.
    ///
    /// The session is pumped first so freshly completed transfers are
    /// visible, then acquisition, then the protocol engine - which itself
    /// polls the receive chain before acting on a completed capture, so
    /// completion delivery wins same-iteration ties.
    pub fn poll(&mut self) {
        let session = &mut self.session;
        let acq = &mut self.acq;
        let engine = &mut self.engine;
        let regs = &mut self.regs;

        drive(|| session.step());
        let configured = session.configured();
        drive(|| acq.step(configured));
        drive(|| engine.step(session, acq, regs));
    }

    pub fn session(&self) -> &Session<'q, L, MAX_INCOMING> {
        &self.session
    }

    pub fn acquisition(&self) -> &Acquisition<SP, N> {
        &self.acq
    }

    pub fn acquisition_mut(&mut self) -> &mut Acquisition<SP, N> {
        &mut self.acq
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }
}
