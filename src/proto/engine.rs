//! Protocol engine: message lifecycle and virtual-register dispatch.
//!
//! The engine runs three small state machines:
//!
//! - the top level: `Init -> Wait -> ProcessHostMessage ->
//!   SendHardwareMessage -> Wait`;
//! - a receive chain feeding frames from the session's auto-terminated
//!   receive through the decoder;
//! - a transmit chain pushing a staged reply through the session's
//!   transmit gate.
//!
//! In `Wait` the engine pumps the receive chain first and then checks the
//! acquisition controller; a capture completing in the same iteration as a
//! host message always wins the tie, so sample delivery is never delayed
//! behind command processing.  The staged message stays ready and is
//! processed on the next pass.
//!
//! Replies are encoded at dispatch time, directly into the engine's frame
//! buffer: a read result's view into a virtual register buffer is
//! serialized before anything can mutate that buffer again.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use embedded_hal::digital::OutputPin;
use embedded_hal::i2c::I2c;
use embedded_hal::spi::SpiBus;

use crate::acq::Acquisition;
use crate::link::LinkPort;
use crate::pins::SamplerPort;
use crate::proto::{
    decode_command, DecodedCommand, CommandKind, Outgoing, END_MESSAGE, ESCAPE, MAX_INCOMING,
    MAX_OUTGOING, MAX_PAYLOAD,
};
use crate::regs::RegisterFile;
use crate::session::Session;
use crate::step::Step;
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    Init,
    Wait,
    ProcessHostMessage,
    SendHardwareMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxState {
    /// No receive armed.
    Wait,
    /// Auto-terminated receive in flight.
    Receiving,
    /// Completed frame awaiting decode.
    Decode,
    /// Decoded command held until the engine processes it.
    MsgReady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    /// Nothing staged.
    Wait,
    /// Frame staged, waiting for the transmit gate.
    Transmit,
    /// Frame handed to the session, waiting for completion.
    Transmitting,
}

/// The protocol engine.
///
/// Owns the decode payload buffer and the outgoing frame buffer; state
/// between polls is held here, never on the stack.
pub struct Engine {
    state: EngineState,
    rx_state: RxState,
    tx_state: TxState,

    rx_error_count: u32,
    rx_error_flag: bool,
    tx_error_count: u32,
    tx_error_flag: bool,

    /// Host asked for sample data; consumed on the next capture.
    wait_trigger: bool,
    /// Send an unsolicited Triggered command for captures nobody asked
    /// about.
    announce_trigger: bool,

    pending: Option<DecodedCommand>,
    payload: [u8; MAX_PAYLOAD],

    out: [u8; MAX_OUTGOING],
    out_len: usize,
}

impl Engine {
    pub fn new() -> Self {
        Self {
            state: EngineState::Init,
            rx_state: RxState::Wait,
            tx_state: TxState::Wait,
            rx_error_count: 0,
            rx_error_flag: false,
            tx_error_count: 0,
            tx_error_flag: false,
            wait_trigger: false,
            announce_trigger: false,
            pending: None,
            payload: [0; MAX_PAYLOAD],
            out: [0; MAX_OUTGOING],
            out_len: 0,
        }
    }

    /// Whether a host sample request is pending on the next capture.
    pub fn host_waiting(&self) -> bool {
        self.wait_trigger
    }

    /// Enable the unsolicited Triggered notification (off by default).
    pub fn set_announce_trigger(&mut self, enable: bool) {
        self.announce_trigger = enable;
    }

    pub fn rx_error_count(&self) -> u32 {
        self.rx_error_count
    }

    pub fn rx_error_flag(&self) -> bool {
        self.rx_error_flag
    }

    pub fn tx_error_count(&self) -> u32 {
        self.tx_error_count
    }

    pub fn tx_error_flag(&self) -> bool {
        self.tx_error_flag
    }

    /// Advance the engine by one step.
    pub fn step<L, SP, SF, SA, I, P, const RX: usize, const N: usize>(
        &mut self,
        session: &mut Session<'_, L, RX>,
        acq: &mut Acquisition<SP, N>,
        regs: &mut RegisterFile<SF, SA, I, P>,
    ) -> Step
    where
        L: LinkPort,
        SP: SamplerPort,
        SF: SpiBus,
        SA: SpiBus,
        I: I2c,
        P: OutputPin,
    {
        match self.state {
            EngineState::Init => {
                // Bus handles are owned by the register file from
                // construction; nothing to open here.
                self.state = EngineState::Wait;
                Step::Again
            }

            EngineState::Wait => {
                let mut progress = self.rx_step(session) == Step::Again;

                if self.rx_state == RxState::MsgReady {
                    self.state = EngineState::ProcessHostMessage;
                    progress = true;
                }

                // Capture completion outranks a staged host message.
                if acq.captured() {
                    if self.wait_trigger {
                        self.wait_trigger = false;
                        self.stage(Outgoing::SampleData {
                            data: acq.captured_data(),
                        });
                    } else if self.announce_trigger {
                        self.stage(Outgoing::Triggered);
                    }
                    acq.release();
                    self.state = EngineState::SendHardwareMessage;
                    progress = true;
                }

                if progress { Step::Again } else { Step::Idle }
            }

            EngineState::ProcessHostMessage => {
                if let Some(cmd) = self.pending.take() {
                    self.dispatch(cmd, regs);
                }
                session.rx_reset();
                self.rx_state = RxState::Wait;
                self.state = EngineState::SendHardwareMessage;
                Step::Again
            }

            EngineState::SendHardwareMessage => {
                if self.tx_state == TxState::Wait {
                    self.state = EngineState::Wait;
                    Step::Again
                } else {
                    self.tx_step(session)
                }
            }
        }
    }

    /// Resolve one host command against the register file, staging the
    /// reply where the command calls for one.
    fn dispatch<SF, SA, I, P>(&mut self, cmd: DecodedCommand, regs: &mut RegisterFile<SF, SA, I, P>)
    where
        SF: SpiBus,
        SA: SpiBus,
        I: I2c,
        P: OutputPin,
    {
        match cmd.kind {
            CommandKind::RequestSampleData => {
                trace!("host waiting for next capture");
                self.wait_trigger = true;
            }

            CommandKind::WriteRegisters => {
                let written = regs.write(cmd.address, &self.payload[..cmd.payload_len]);
                self.stage(Outgoing::WriteAck { length: written });
            }

            CommandKind::ReadRegisters => {
                let data = regs.read(cmd.address, cmd.length);
                self.stage(Outgoing::ReadData { data });
            }

            // Triggered is device-originated; a host sending it gets no
            // reply.
            CommandKind::Triggered => trace!("ignoring Triggered from host"),
        }
    }

    fn stage(&mut self, message: Outgoing<'_>) {
        match message.encode(&mut self.out) {
            Ok(len) => {
                self.out_len = len;
                self.tx_state = TxState::Transmit;
            }
            Err(e) => {
                warn!("encode failed: {e:?}");
                self.tx_error_count += 1;
                self.tx_error_flag = true;
            }
        }
    }

    fn rx_step<L: LinkPort, const RX: usize>(&mut self, session: &mut Session<'_, L, RX>) -> Step {
        match self.rx_state {
            RxState::Wait => {
                match session.receive_auto(MAX_INCOMING.min(RX), END_MESSAGE, ESCAPE) {
                    Ok(()) => {
                        self.rx_state = RxState::Receiving;
                        Step::Again
                    }
                    // Link down or mid-reset; retry next poll.
                    Err(_) => Step::Idle,
                }
            }

            RxState::Receiving => {
                if session.rx_failed() {
                    debug!("receive overrun, discarding");
                    self.rx_error_count += 1;
                    self.rx_error_flag = true;
                    session.rx_reset();
                    self.rx_state = RxState::Wait;
                    Step::Again
                } else if session.rx_complete() {
                    self.rx_state = RxState::Decode;
                    Step::Again
                } else if !session.rx_active() {
                    // Session abandoned the receive (configuration loss).
                    self.rx_state = RxState::Wait;
                    Step::Again
                } else {
                    Step::Idle
                }
            }

            RxState::Decode => match decode_command(session.frame(), &mut self.payload) {
                Ok(cmd) => {
                    trace!("host command {:?}", cmd.kind);
                    self.pending = Some(cmd);
                    self.rx_state = RxState::MsgReady;
                    Step::Again
                }
                Err(e) => {
                    debug!("decode rejected: {e:?}");
                    self.rx_error_count += 1;
                    self.rx_error_flag = true;
                    session.rx_reset();
                    self.rx_state = RxState::Wait;
                    Step::Again
                }
            },

            // Held until the engine's Wait state picks the message up.
            RxState::MsgReady => Step::Idle,
        }
    }

    fn tx_step<L: LinkPort, const RX: usize>(&mut self, session: &mut Session<'_, L, RX>) -> Step {
        match self.tx_state {
            TxState::Wait => Step::Idle,

            TxState::Transmit => match session.transmit(&self.out[..self.out_len]) {
                Ok(()) => {
                    self.tx_state = TxState::Transmitting;
                    Step::Again
                }
                // Gate busy with a previous frame; wait it out.
                Err(Error::Busy) => Step::Idle,
                Err(e) => {
                    // Configuration lost or driver refused; the reply is
                    // moot.
                    debug!("dropping staged reply: {e:?}");
                    self.tx_error_count += 1;
                    self.tx_error_flag = true;
                    self.tx_state = TxState::Wait;
                    Step::Again
                }
            },

            TxState::Transmitting => {
                if session.tx_ready() {
                    self.tx_state = TxState::Wait;
                    Step::Again
                } else {
                    Step::Idle
                }
            }
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}
