//! Virtual register spaces and their backing bus transactions.
//!
//! The host sees one flat address map; four disjoint ranges are each backed
//! by an owned buffer and a side effect:
//!
//! | space   | range            | backing transaction                     |
//! |---------|------------------|-----------------------------------------|
//! | control | 0x1000..=0x1007  | in-memory loopback                      |
//! | FPGA    | 0x2000..=0x2001  | full-duplex SPI, whole buffer           |
//! | AFE     | 0x3000..=0x3001  | SPI with per-byte bit reversal          |
//! | DAC     | 0x4000..=0x4010  | I2C under a load strobe                 |
//!
//! A request not fully contained in exactly one range performs no
//! transaction; callers report that as a zero-length outcome.  Bus failures
//! surface the same way, so the host infers failure from the echoed length.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use embedded_hal::digital::OutputPin;
use embedded_hal::i2c::I2c;
use embedded_hal::spi::SpiBus;

use crate::{Error, Result};

/// Local control memory.
pub const CONTROL_BASE: u32 = 0x0000_1000;
pub const CONTROL_SIZE: usize = 8;

/// FPGA data-path registers.
pub const FPGA_BASE: u32 = 0x0000_2000;
pub const FPGA_SIZE: usize = 2;

/// Analog front end (filter/PGA) registers.
pub const AFE_BASE: u32 = 0x0000_3000;
pub const AFE_SIZE: usize = 2;

/// Offset DAC registers.
pub const DAC_BASE: u32 = 0x0000_4000;
pub const DAC_SIZE: usize = 17;

/// 7-bit bus address of the DAC.
pub const DAC_ADDRESS: u8 = 0x60;

/// Writing this byte at DAC offset 0 runs the calibration sequence.
pub const DAC_CAL_SENTINEL: u8 = 0xAA;

/// The four output codes live at offsets 2..10, one little-endian u16
/// each.
const DAC_CODES_OFFSET: usize = 2;
const DAC_FAST_WRITE_LEN: usize = 8;

/// Select the internal reference on all channels.
const DAC_CMD_SELECT_VREF: u8 = 0x8F;
/// Unity gain on all channels.
const DAC_CMD_SELECT_GAIN: u8 = 0xC0;

/// Marker bit set on the first byte of an AFE write, before reversal.
const AFE_WRITE_MARKER: u8 = 0x80;

/// The virtual register spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Space {
    Control,
    Fpga,
    Afe,
    Dac,
}

struct Region {
    space: Space,
    base: u32,
    size: u32,
}

static REGIONS: [Region; 4] = [
    Region {
        space: Space::Control,
        base: CONTROL_BASE,
        size: CONTROL_SIZE as u32,
    },
    Region {
        space: Space::Fpga,
        base: FPGA_BASE,
        size: FPGA_SIZE as u32,
    },
    Region {
        space: Space::Afe,
        base: AFE_BASE,
        size: AFE_SIZE as u32,
    },
    Region {
        space: Space::Dac,
        base: DAC_BASE,
        size: DAC_SIZE as u32,
    },
];

/// Resolve `[address, address + length - 1]` to the one space containing
/// it, returning the space and the offset within it.
///
/// `None` when the range is empty, spans space boundaries, or touches
/// unmapped addresses.
pub fn resolve(address: u32, length: u32) -> Option<(Space, usize)> {
    if length == 0 {
        return None;
    }
    let end = address.checked_add(length - 1)?;
    REGIONS.iter().find_map(|r| {
        let contained = address >= r.base && end <= r.base + r.size - 1;
        contained.then(|| (r.space, (address - r.base) as usize))
    })
}

/// The register file: four virtual buffers and the buses backing them.
pub struct RegisterFile<SF, SA, I, P> {
    control: [u8; CONTROL_SIZE],
    fpga: [u8; FPGA_SIZE],
    afe: [u8; AFE_SIZE],
    dac: [u8; DAC_SIZE],

    fpga_bus: SF,
    afe_bus: SA,
    dac_bus: I,
    dac_load: P,
}

impl<SF, SA, I, P> RegisterFile<SF, SA, I, P>
where
    SF: SpiBus,
    SA: SpiBus,
    I: I2c,
    P: OutputPin,
{
    /// Take ownership of the opened buses and the DAC load-strobe pin
    /// (active low, released here).
    pub fn new(fpga_bus: SF, afe_bus: SA, dac_bus: I, mut dac_load: P) -> Self {
        dac_load.set_high().ok();
        Self {
            control: [0; CONTROL_SIZE],
            fpga: [0; FPGA_SIZE],
            afe: [0; AFE_SIZE],
            dac: [0; DAC_SIZE],
            fpga_bus,
            afe_bus,
            dac_bus,
            dac_load,
        }
    }

    /// Write `data` at `address`.  Returns the number of bytes actually
    /// written: `data.len()` on success, 0 on a rejected range or a failed
    /// backing transaction.
    pub fn write(&mut self, address: u32, data: &[u8]) -> u32 {
        let Some((space, offset)) = resolve(address, data.len() as u32) else {
            debug!("write {:#010x}+{} rejected", address, data.len());
            return 0;
        };

        let result = match space {
            Space::Control => {
                self.control[offset..offset + data.len()].copy_from_slice(data);
                Ok(())
            }
            Space::Fpga => {
                self.fpga[offset..offset + data.len()].copy_from_slice(data);
                self.fpga_transfer()
            }
            Space::Afe => {
                self.afe[offset..offset + data.len()].copy_from_slice(data);
                self.afe_write()
            }
            Space::Dac => {
                self.dac[offset..offset + data.len()].copy_from_slice(data);
                self.dac_write(offset, data)
            }
        };

        match result {
            Ok(()) => data.len() as u32,
            Err(e) => {
                warn!("{space:?} write transaction failed: {e:?}");
                0
            }
        }
    }

    /// Read `length` bytes at `address`.  Returns a view into the backing
    /// virtual buffer, empty on a rejected range or a failed transaction.
    ///
    /// The view is only valid until the register file is next written;
    /// callers serialize it immediately.
    pub fn read(&mut self, address: u32, length: u32) -> &[u8] {
        let Some((space, offset)) = resolve(address, length) else {
            debug!("read {address:#010x}+{length} rejected");
            return &[];
        };
        let len = length as usize;

        let result = match space {
            Space::Control => Ok(()),
            Space::Fpga => self.fpga_transfer(),
            Space::Afe => self.afe_read(),
            // DAC reads echo the virtual buffer; the device has no
            // read-back path in use.
            Space::Dac => Ok(()),
        };

        match result {
            Ok(()) => {
                let buf: &[u8] = match space {
                    Space::Control => &self.control,
                    Space::Fpga => &self.fpga,
                    Space::Afe => &self.afe,
                    Space::Dac => &self.dac,
                };
                &buf[offset..offset + len]
            }
            Err(e) => {
                warn!("{space:?} read transaction failed: {e:?}");
                &[]
            }
        }
    }

    /// The whole FPGA virtual buffer crosses the bus regardless of the
    /// requested range; the full-duplex response replaces the buffer
    /// contents.
    fn fpga_transfer(&mut self) -> Result<()> {
        self.fpga_bus
            .transfer_in_place(&mut self.fpga)
            .and_then(|()| self.fpga_bus.flush())
            .map_err(|_| Error::Bus)
    }

    /// Send the AFE buffer, write marker set on the first byte, every byte
    /// bit-reversed for the LSB-first device.
    fn afe_write(&mut self) -> Result<()> {
        let mut frame = self.afe;
        frame[0] |= AFE_WRITE_MARKER;
        for byte in frame.iter_mut() {
            *byte = byte.reverse_bits();
        }
        self.afe_bus
            .write(&frame)
            .and_then(|()| self.afe_bus.flush())
            .map_err(|_| Error::Bus)
    }

    /// Zero-filled write-then-read exchange; the response is un-reversed
    /// into the virtual buffer.
    fn afe_read(&mut self) -> Result<()> {
        let mut response = [0u8; AFE_SIZE];
        self.afe_bus
            .transfer(&mut response, &[0u8; AFE_SIZE])
            .and_then(|()| self.afe_bus.flush())
            .map_err(|_| Error::Bus)?;
        for (dst, src) in self.afe.iter_mut().zip(response.iter()) {
            *dst = src.reverse_bits();
        }
        Ok(())
    }

    fn dac_write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        if offset == 0 && data[0] == DAC_CAL_SENTINEL {
            self.dac_calibrate()
        } else if offset == DAC_CODES_OFFSET && data.len() == DAC_FAST_WRITE_LEN {
            self.dac_load_codes()
        } else {
            // Plain buffer update; nothing crosses the bus.
            Ok(())
        }
    }

    /// Calibration: select reference mode and gain, then load all four
    /// output codes.
    fn dac_calibrate(&mut self) -> Result<()> {
        self.dac_bus
            .write(DAC_ADDRESS, &[DAC_CMD_SELECT_VREF])
            .map_err(|_| Error::Bus)?;
        self.dac_bus
            .write(DAC_ADDRESS, &[DAC_CMD_SELECT_GAIN])
            .map_err(|_| Error::Bus)?;
        self.dac_load_codes()
    }

    /// Fast write of the four output codes, byte-swapped onto the wire,
    /// with the load strobe held asserted until the transaction completes.
    fn dac_load_codes(&mut self) -> Result<()> {
        let mut frame = [0u8; DAC_FAST_WRITE_LEN];
        for code in 0..4 {
            let offset = DAC_CODES_OFFSET + 2 * code;
            frame[2 * code] = self.dac[offset + 1];
            frame[2 * code + 1] = self.dac[offset];
        }

        self.dac_load.set_low().ok();
        let result = self
            .dac_bus
            .write(DAC_ADDRESS, &frame)
            .map_err(|_| Error::Bus);
        self.dac_load.set_high().ok();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::Infallible;
    use core::result::Result;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::vec::Vec;

    /// Everything the mocks observe, in order.
    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Ev {
        SpiWrite(Vec<u8>),
        SpiTransfer(Vec<u8>),
        I2cWrite(u8, Vec<u8>),
        Strobe(bool),
    }

    type Log = Rc<RefCell<Vec<Ev>>>;

    #[derive(Debug)]
    struct BusFault;

    impl embedded_hal::spi::Error for BusFault {
        fn kind(&self) -> embedded_hal::spi::ErrorKind {
            embedded_hal::spi::ErrorKind::Other
        }
    }

    impl embedded_hal::i2c::Error for BusFault {
        fn kind(&self) -> embedded_hal::i2c::ErrorKind {
            embedded_hal::i2c::ErrorKind::Other
        }
    }

    #[derive(Clone)]
    struct MockSpi {
        log: Log,
        /// Bytes clocked back on the next transfer.
        response: Rc<RefCell<Vec<u8>>>,
        fail: Rc<RefCell<bool>>,
    }

    impl MockSpi {
        fn new(log: &Log) -> Self {
            Self {
                log: log.clone(),
                response: Rc::new(RefCell::new(Vec::new())),
                fail: Rc::new(RefCell::new(false)),
            }
        }

        fn check(&self) -> Result<(), BusFault> {
            if *self.fail.borrow() { Err(BusFault) } else { Ok(()) }
        }
    }

    impl embedded_hal::spi::ErrorType for MockSpi {
        type Error = BusFault;
    }

    impl SpiBus for MockSpi {
        fn read(&mut self, words: &mut [u8]) -> Result<(), BusFault> {
            self.check()?;
            let response = self.response.borrow();
            for (i, w) in words.iter_mut().enumerate() {
                *w = response.get(i).copied().unwrap_or(0);
            }
            Ok(())
        }

        fn write(&mut self, words: &[u8]) -> Result<(), BusFault> {
            self.check()?;
            self.log.borrow_mut().push(Ev::SpiWrite(words.to_vec()));
            Ok(())
        }

        fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), BusFault> {
            self.check()?;
            self.log.borrow_mut().push(Ev::SpiTransfer(write.to_vec()));
            let response = self.response.borrow();
            for (i, w) in read.iter_mut().enumerate() {
                *w = response.get(i).copied().unwrap_or(0);
            }
            Ok(())
        }

        fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), BusFault> {
            self.check()?;
            self.log.borrow_mut().push(Ev::SpiTransfer(words.to_vec()));
            let response = self.response.borrow();
            for (i, w) in words.iter_mut().enumerate() {
                *w = response.get(i).copied().unwrap_or(0);
            }
            Ok(())
        }

        fn flush(&mut self) -> Result<(), BusFault> {
            self.check()
        }
    }

    #[derive(Clone)]
    struct MockI2c {
        log: Log,
        fail: Rc<RefCell<bool>>,
    }

    impl MockI2c {
        fn new(log: &Log) -> Self {
            Self {
                log: log.clone(),
                fail: Rc::new(RefCell::new(false)),
            }
        }
    }

    impl embedded_hal::i2c::ErrorType for MockI2c {
        type Error = BusFault;
    }

    impl I2c for MockI2c {
        fn transaction(
            &mut self,
            address: u8,
            operations: &mut [embedded_hal::i2c::Operation<'_>],
        ) -> Result<(), BusFault> {
            if *self.fail.borrow() {
                return Err(BusFault);
            }
            for op in operations {
                match op {
                    embedded_hal::i2c::Operation::Write(data) => self
                        .log
                        .borrow_mut()
                        .push(Ev::I2cWrite(address, data.to_vec())),
                    embedded_hal::i2c::Operation::Read(buf) => buf.fill(0),
                }
            }
            Ok(())
        }
    }

    #[derive(Clone)]
    struct StrobePin(Log);

    impl embedded_hal::digital::ErrorType for StrobePin {
        type Error = Infallible;
    }

    impl OutputPin for StrobePin {
        fn set_low(&mut self) -> Result<(), Infallible> {
            self.0.borrow_mut().push(Ev::Strobe(false));
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Infallible> {
            self.0.borrow_mut().push(Ev::Strobe(true));
            Ok(())
        }
    }

    struct Rig {
        regs: RegisterFile<MockSpi, MockSpi, MockI2c, StrobePin>,
        fpga: MockSpi,
        afe: MockSpi,
        dac: MockI2c,
        log: Log,
    }

    fn rig() -> Rig {
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        let fpga = MockSpi::new(&log);
        let afe = MockSpi::new(&log);
        let dac = MockI2c::new(&log);
        let regs = RegisterFile::new(
            fpga.clone(),
            afe.clone(),
            dac.clone(),
            StrobePin(log.clone()),
        );
        log.borrow_mut().clear(); // drop the construction-time strobe release
        Rig {
            regs,
            fpga,
            afe,
            dac,
            log,
        }
    }

    #[test]
    fn resolve_contained_ranges() {
        assert_eq!(resolve(0x1000, 8), Some((Space::Control, 0)));
        assert_eq!(resolve(0x1007, 1), Some((Space::Control, 7)));
        assert_eq!(resolve(0x2000, 2), Some((Space::Fpga, 0)));
        assert_eq!(resolve(0x3001, 1), Some((Space::Afe, 1)));
        assert_eq!(resolve(0x4000, 17), Some((Space::Dac, 0)));
        assert_eq!(resolve(0x4002, 8), Some((Space::Dac, 2)));
    }

    #[test]
    fn resolve_rejects_straddling_and_unmapped() {
        // Across the control boundary.
        assert_eq!(resolve(0x1006, 4), None);
        // Entirely unmapped.
        assert_eq!(resolve(0x0000, 4), None);
        assert_eq!(resolve(0x5000, 1), None);
        // Starts before a space, ends inside it.
        assert_eq!(resolve(0x1FFE, 4), None);
        // Empty and overflowing ranges.
        assert_eq!(resolve(0x1000, 0), None);
        assert_eq!(resolve(0xFFFF_FFFF, 2), None);
    }

    #[test]
    fn control_space_is_loopback() {
        let mut r = rig();
        assert_eq!(r.regs.write(0x1002, &[0xAB, 0xCD]), 2);
        assert_eq!(r.regs.read(0x1002, 2), &[0xAB, 0xCD]);
        // Nothing crossed any bus.
        assert!(r.log.borrow().is_empty());
    }

    #[test]
    fn rejected_range_performs_no_transaction() {
        let mut r = rig();
        assert_eq!(r.regs.write(0x1006, &[0; 4]), 0);
        assert_eq!(r.regs.read(0x2001, 2), &[] as &[u8]);
        assert!(r.log.borrow().is_empty());
    }

    #[test]
    fn fpga_write_transfers_whole_buffer() {
        let mut r = rig();
        r.fpga.response.borrow_mut().extend_from_slice(&[0x55, 0x66]);
        assert_eq!(r.regs.write(0x2001, &[0x11]), 1);
        // The whole 2-byte buffer crossed the bus despite the 1-byte
        // request at offset 1.
        assert_eq!(r.log.borrow()[..], [Ev::SpiTransfer(std::vec![0x00, 0x11])]);
        // The full-duplex response replaced the buffer.
        assert_eq!(r.regs.read(0x2000, 2), &[0x55, 0x66]);
    }

    #[test]
    fn afe_write_reverses_bits_and_sets_marker() {
        let mut r = rig();
        assert_eq!(r.regs.write(0x3000, &[0x01, 0x03]), 2);
        // First byte 0x01 | marker 0x80 = 0x81, reversed = 0x81;
        // second byte 0x03 reversed = 0xC0.
        assert_eq!(
            r.log.borrow()[..],
            [Ev::SpiWrite(std::vec![0x81, 0xC0])]
        );
    }

    #[test]
    fn afe_read_unreverses_response() {
        let mut r = rig();
        r.afe.response.borrow_mut().extend_from_slice(&[0xC0, 0x80]);
        assert_eq!(r.regs.read(0x3000, 2), &[0x03, 0x01]);
        // Zero-filled exchange on the wire.
        assert_eq!(
            r.log.borrow()[..],
            [Ev::SpiTransfer(std::vec![0x00, 0x00])]
        );
    }

    #[test]
    fn dac_plain_write_touches_buffer_only() {
        let mut r = rig();
        assert_eq!(r.regs.write(0x400B, &[0x12, 0x34]), 2);
        assert!(r.log.borrow().is_empty());
        assert_eq!(r.regs.read(0x400B, 2), &[0x12, 0x34]);
    }

    #[test]
    fn dac_calibration_sequence() {
        let mut r = rig();
        // Stage the four output codes first (little-endian).
        assert_eq!(
            r.regs
                .write(0x4002, &[0x11, 0x0A, 0x22, 0x0B, 0x33, 0x0C, 0x44, 0x0D]),
            8
        );
        r.log.borrow_mut().clear();

        assert_eq!(r.regs.write(0x4000, &[DAC_CAL_SENTINEL]), 1);
        assert_eq!(
            r.log.borrow()[..],
            [
                Ev::I2cWrite(DAC_ADDRESS, std::vec![0x8F]),
                Ev::I2cWrite(DAC_ADDRESS, std::vec![0xC0]),
                Ev::Strobe(false),
                // Codes byte-swapped onto the wire.
                Ev::I2cWrite(
                    DAC_ADDRESS,
                    std::vec![0x0A, 0x11, 0x0B, 0x22, 0x0C, 0x33, 0x0D, 0x44]
                ),
                Ev::Strobe(true),
            ]
        );
    }

    #[test]
    fn dac_fast_write_strobes_codes() {
        let mut r = rig();
        assert_eq!(
            r.regs
                .write(0x4002, &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]),
            8
        );
        assert_eq!(
            r.log.borrow()[..],
            [
                Ev::Strobe(false),
                Ev::I2cWrite(
                    DAC_ADDRESS,
                    std::vec![0x02, 0x01, 0x04, 0x03, 0x06, 0x05, 0x08, 0x07]
                ),
                Ev::Strobe(true),
            ]
        );
    }

    #[test]
    fn bus_failure_reports_zero_length() {
        let mut r = rig();
        *r.fpga.fail.borrow_mut() = true;
        assert_eq!(r.regs.write(0x2000, &[0x01]), 0);
        assert_eq!(r.regs.read(0x2000, 1), &[] as &[u8]);

        *r.dac.fail.borrow_mut() = true;
        assert_eq!(r.regs.write(0x4000, &[DAC_CAL_SENTINEL]), 0);
    }

    #[test]
    fn dac_failed_fast_write_releases_strobe() {
        let mut r = rig();
        *r.dac.fail.borrow_mut() = true;
        assert_eq!(r.regs.write(0x4002, &[0u8; 8]), 0);
        assert_eq!(
            r.log.borrow()[..],
            [Ev::Strobe(false), Ev::Strobe(true)]
        );
    }
}
