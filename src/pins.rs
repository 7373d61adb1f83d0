//! Acquisition pin seam.
//!
//! The acquisition controller polls a handful of FPGA-facing digital
//! signals.  [`SamplerPort`] names them; [`ParallelSampler`] implements the
//! trait over `embedded-hal` digital pins for real hardware.  All signals
//! are level-polled, not edge-latched.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use embedded_hal::digital::{InputPin, OutputPin, StatefulOutputPin};

/// The FPGA-facing signal group used by the acquisition controller.
///
/// Implementations with fallible pins should treat a pin read error as
/// de-asserted; the controller has no error path for a broken pin.
pub trait SamplerPort {
    /// Trigger input: the data path has a burst of new samples.
    fn trigger_asserted(&mut self) -> bool;

    /// Second-buffer-full input: the FPGA's double-buffered capture has
    /// enough data that draining may overlap the ongoing fill.
    fn burst_ready(&mut self) -> bool;

    /// Data-ready input: the currently requested sample byte is valid on
    /// the parallel lines.
    fn sample_ready(&mut self) -> bool;

    /// Drive the data-request output.
    fn set_data_request(&mut self, asserted: bool);

    /// Drive the ready-to-receive output.
    fn set_host_ready(&mut self, asserted: bool);

    /// Toggle the diagnostic indicator.
    fn toggle_indicator(&mut self);

    /// Read the 8 parallel data lines into one byte, line `i` at bit
    /// position `i`.
    fn read_bus(&mut self) -> u8;
}

/// [`SamplerPort`] over discrete `embedded-hal` pins.
pub struct ParallelSampler<T, B, R, Q, H, LED, D0, D1, D2, D3, D4, D5, D6, D7> {
    pub trigger: T,
    pub buffer_full: B,
    pub data_ready: R,
    pub data_request: Q,
    pub host_ready: H,
    pub indicator: LED,
    pub data: (D0, D1, D2, D3, D4, D5, D6, D7),
}

impl<T, B, R, Q, H, LED, D0, D1, D2, D3, D4, D5, D6, D7> SamplerPort
    for ParallelSampler<T, B, R, Q, H, LED, D0, D1, D2, D3, D4, D5, D6, D7>
where
    T: InputPin,
    B: InputPin,
    R: InputPin,
    Q: OutputPin,
    H: OutputPin,
    LED: StatefulOutputPin,
    D0: InputPin,
    D1: InputPin,
    D2: InputPin,
    D3: InputPin,
    D4: InputPin,
    D5: InputPin,
    D6: InputPin,
    D7: InputPin,
{
    fn trigger_asserted(&mut self) -> bool {
        self.trigger.is_high().unwrap_or(false)
    }

    fn burst_ready(&mut self) -> bool {
        self.buffer_full.is_high().unwrap_or(false)
    }

    fn sample_ready(&mut self) -> bool {
        self.data_ready.is_high().unwrap_or(false)
    }

    fn set_data_request(&mut self, asserted: bool) {
        if asserted {
            self.data_request.set_high().ok();
        } else {
            self.data_request.set_low().ok();
        }
    }

    fn set_host_ready(&mut self, asserted: bool) {
        if asserted {
            self.host_ready.set_high().ok();
        } else {
            self.host_ready.set_low().ok();
        }
    }

    fn toggle_indicator(&mut self) {
        self.indicator.toggle().ok();
    }

    fn read_bus(&mut self) -> u8 {
        let mut byte = 0u8;
        byte |= (self.data.0.is_high().unwrap_or(false) as u8) << 0;
        byte |= (self.data.1.is_high().unwrap_or(false) as u8) << 1;
        byte |= (self.data.2.is_high().unwrap_or(false) as u8) << 2;
        byte |= (self.data.3.is_high().unwrap_or(false) as u8) << 3;
        byte |= (self.data.4.is_high().unwrap_or(false) as u8) << 4;
        byte |= (self.data.5.is_high().unwrap_or(false) as u8) << 5;
        byte |= (self.data.6.is_high().unwrap_or(false) as u8) << 6;
        byte |= (self.data.7.is_high().unwrap_or(false) as u8) << 7;
        byte
    }
}
