//! Host wire protocol: framing, escaping and the message model.
//!
//! Frames are binary:
//!
//! ```text
//! START(0x1E) | type ('C'/'R') | command ('s'/'t'/'w'/'r')
//!            | fixed field block | [variable payload] | END(0x04)
//! ```
//!
//! The fixed field block is sized per (type, command); each field is a
//! one-byte format-identifier tag followed by the field's raw bytes,
//! little-endian for multi-byte values.  Reserved bytes (START, END,
//! END_BLOCK, ESCAPE) occurring inside the field block or payload are
//! preceded by an inserted ESCAPE on encode; on decode an ESCAPE is dropped
//! and the following byte taken literally.
//!
//! [`decode_command()`] parses a received frame (terminator already
//! stripped by the session's auto-receive) into a [`DecodedCommand`];
//! [`Outgoing`] encodes the device's replies and notifications.  The
//! engine tying both to the rest of the instrument lives in
//! [`engine`].

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

pub mod engine;

pub use engine::Engine;

use crate::{Error, Result, SAMPLES};

/// Frame start byte.
pub const START_MESSAGE: u8 = 0x1E;
/// Frame terminator byte.
pub const END_MESSAGE: u8 = 0x04;
/// Reserved block terminator byte.
pub const END_BLOCK: u8 = 0x17;
/// Escape byte.
pub const ESCAPE: u8 = 0x1A;

/// Message type tags.
pub const MSG_COMMAND: u8 = b'C';
pub const MSG_RESULT: u8 = b'R';

/// Format identifier bytes tagging the fixed fields.
pub const ADDRESS_FI: u8 = b'A';
pub const LENGTH_FI: u8 = b'L';
pub const DATA_FI: u8 = b'D';

/// Upper bound on a message's variable payload.
pub const MAX_PAYLOAD: usize = 256;

const BUFFER_MARGIN: usize = 100;

/// Receive buffer bound: a fully escaped payload, the frame overhead, and
/// margin.
pub const MAX_INCOMING: usize = MAX_PAYLOAD * 2 + 15 + BUFFER_MARGIN;

/// Transmit buffer bound: a fully escaped sample buffer plus margin.
pub const MAX_OUTGOING: usize = SAMPLES * 2 + BUFFER_MARGIN;

/// Whether `byte` must be escaped on the wire.
pub const fn is_reserved(byte: u8) -> bool {
    matches!(byte, START_MESSAGE | END_MESSAGE | END_BLOCK | ESCAPE)
}

/// Command tags, shared by the command and result message forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// `'s'` - host asks for the next completed capture.
    RequestSampleData,
    /// `'t'` - device announces a completed capture.
    Triggered,
    /// `'w'` - host writes a virtual register range.
    WriteRegisters,
    /// `'r'` - host reads a virtual register range.
    ReadRegisters,
}

impl CommandKind {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            b's' => Some(Self::RequestSampleData),
            b't' => Some(Self::Triggered),
            b'w' => Some(Self::WriteRegisters),
            b'r' => Some(Self::ReadRegisters),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        match self {
            Self::RequestSampleData => b's',
            Self::Triggered => b't',
            Self::WriteRegisters => b'w',
            Self::ReadRegisters => b'r',
        }
    }
}

/// Unescaped size of the fixed field block for a (type, command) pair.
///
/// `None` for combinations that do not exist on the wire.
pub fn fixed_block_len(msg_type: u8, kind: CommandKind) -> Option<usize> {
    match msg_type {
        MSG_COMMAND => Some(match kind {
            CommandKind::RequestSampleData | CommandKind::Triggered => 0,
            // 'A' + address + 'L' + length + 'D'
            CommandKind::WriteRegisters => 11,
            // 'A' + address + 'L' + length
            CommandKind::ReadRegisters => 10,
        }),
        MSG_RESULT => match kind {
            // 'L' + length + 'D'
            CommandKind::RequestSampleData | CommandKind::ReadRegisters => Some(6),
            // 'L' + length
            CommandKind::WriteRegisters => Some(5),
            CommandKind::Triggered => None,
        },
        _ => None,
    }
}

/// A host command parsed off the wire.
///
/// `address`/`length` are zero for the kinds without fields; the payload
/// (write data) is unescaped into the buffer passed to
/// [`decode_command()`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedCommand {
    pub kind: CommandKind,
    pub address: u32,
    pub length: u32,
    pub payload_len: usize,
}

/// Parse one received frame (without its END terminator) into a command.
///
/// The variable payload is unescaped into `payload`.  Rejections:
///
/// - [`Error::BadStart`] - first byte is not START
/// - [`Error::BadType`] - type tag is not `'C'`
/// - [`Error::BadCommand`] - unknown command tag
/// - [`Error::BadLength`] - declared payload length over [`MAX_PAYLOAD`]
/// - [`Error::Truncated`] - frame ends inside a declared field
pub fn decode_command(frame: &[u8], payload: &mut [u8]) -> Result<DecodedCommand> {
    if frame.first() != Some(&START_MESSAGE) {
        return Err(Error::BadStart);
    }
    if frame.len() < 3 {
        return Err(Error::Truncated);
    }
    if frame[1] != MSG_COMMAND {
        return Err(Error::BadType);
    }
    let kind = CommandKind::from_tag(frame[2]).ok_or(Error::BadCommand)?;

    let block_len = fixed_block_len(MSG_COMMAND, kind).ok_or(Error::BadCommand)?;
    let mut block = [0u8; 11];
    let mut pos = 3;
    for slot in block.iter_mut().take(block_len) {
        *slot = next_unescaped(frame, &mut pos)?;
    }

    let (address, length) = match kind {
        CommandKind::WriteRegisters | CommandKind::ReadRegisters => (
            u32::from_le_bytes([block[1], block[2], block[3], block[4]]),
            u32::from_le_bytes([block[6], block[7], block[8], block[9]]),
        ),
        _ => (0, 0),
    };

    let payload_len = match kind {
        CommandKind::WriteRegisters => length as usize,
        _ => 0,
    };
    if payload_len > MAX_PAYLOAD {
        return Err(Error::BadLength);
    }
    if payload_len > payload.len() {
        return Err(Error::BufferTooSmall);
    }

    for slot in payload.iter_mut().take(payload_len) {
        *slot = next_unescaped(frame, &mut pos)?;
    }

    Ok(DecodedCommand {
        kind,
        address,
        length,
        payload_len,
    })
}

/// Take the next data byte, dropping a preceding ESCAPE.
fn next_unescaped(frame: &[u8], pos: &mut usize) -> Result<u8> {
    if frame.get(*pos) == Some(&ESCAPE) {
        *pos += 1;
    }
    let byte = *frame.get(*pos).ok_or(Error::Truncated)?;
    *pos += 1;
    Ok(byte)
}

/// A device-to-host message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outgoing<'a> {
    /// Result carrying a completed capture.
    SampleData { data: &'a [u8] },
    /// Result echoing the number of register bytes actually written
    /// (0 on a failed or rejected write).
    WriteAck { length: u32 },
    /// Result carrying register bytes read (empty on a failed or rejected
    /// read).
    ReadData { data: &'a [u8] },
    /// Device-originated notification of a completed capture.
    Triggered,
}

impl Outgoing<'_> {
    /// Serialize into `out`, escaping reserved bytes.  Returns the wire
    /// length, END terminator included.
    pub fn encode(&self, out: &mut [u8]) -> Result<usize> {
        let (msg_type, kind) = match self {
            Self::SampleData { .. } => (MSG_RESULT, CommandKind::RequestSampleData),
            Self::WriteAck { .. } => (MSG_RESULT, CommandKind::WriteRegisters),
            Self::ReadData { .. } => (MSG_RESULT, CommandKind::ReadRegisters),
            Self::Triggered => (MSG_COMMAND, CommandKind::Triggered),
        };

        let mut pos = 0;
        put(out, &mut pos, START_MESSAGE)?;
        put(out, &mut pos, msg_type)?;
        put(out, &mut pos, kind.tag())?;

        match self {
            Self::SampleData { data } | Self::ReadData { data } => {
                put_escaped(out, &mut pos, LENGTH_FI)?;
                for byte in (data.len() as u32).to_le_bytes() {
                    put_escaped(out, &mut pos, byte)?;
                }
                put_escaped(out, &mut pos, DATA_FI)?;
                for &byte in *data {
                    put_escaped(out, &mut pos, byte)?;
                }
            }
            Self::WriteAck { length } => {
                put_escaped(out, &mut pos, LENGTH_FI)?;
                for byte in length.to_le_bytes() {
                    put_escaped(out, &mut pos, byte)?;
                }
            }
            Self::Triggered => {}
        }

        put(out, &mut pos, END_MESSAGE)?;
        Ok(pos)
    }
}

fn put(out: &mut [u8], pos: &mut usize, byte: u8) -> Result<()> {
    if *pos >= out.len() {
        return Err(Error::BufferTooSmall);
    }
    out[*pos] = byte;
    *pos += 1;
    Ok(())
}

fn put_escaped(out: &mut [u8], pos: &mut usize, byte: u8) -> Result<()> {
    if is_reserved(byte) {
        put(out, pos, ESCAPE)?;
    }
    put(out, pos, byte)
}
