//! JTAG transport layer.
//!
//! A [`Cable`] shifts raw bits. The [`AdvDebugUnit`] adapter layered on top
//! speaks the Advanced Debug Unit burst protocol and presents the
//! `access(write, addr, buffer)` bus abstraction every higher layer uses.

use std::io;

use thiserror::Error;

pub mod advdbg;
pub mod crc;
pub mod proxy;
pub mod sim;

pub use advdbg::{AdvDebugUnit, JtagDeviceInfo};
pub use proxy::JtagProxy;

#[derive(Error, Debug)]
pub enum CableError {
    #[error("cable transport failed: {0}")]
    Io(#[from] io::Error),
    #[error("cable is disconnected")]
    Disconnected,
    #[error("stream of {0} bits does not fit a proxy request")]
    StreamTooLong(usize),
    #[error("no start bit from the AXI module within {0} us")]
    AccessTimeout(u64),
    #[error("burst CRC mismatch at {addr:#010x} (got {got:#010x}, expected {expected:#010x})")]
    CrcMismatch { addr: u32, got: u32, expected: u32 },
    #[error("write burst at {addr:#010x} not acknowledged by the AXI module")]
    WriteNotAcked { addr: u32 },
    #[error("debug unit reported a bus error at {addr:#010x}")]
    BusError { addr: u32 },
    #[error("JTAG chain sanity check failed (ir bits: {ir_len}, dr bits: {dr_len})")]
    ChainProbe { ir_len: isize, dr_len: isize },
    #[error("burst of {size} bytes is not aligned to {width}-byte words")]
    Misaligned { size: usize, width: usize },
}

/// Raw bit-shifting interface offered by a JTAG cable.
///
/// All streams are LSB first: bit `i` of the transfer lives at bit `i % 8`
/// of byte `i / 8`. `last_tms` asserts TMS on the final clocked bit, which
/// moves the TAP out of its shift state.
pub trait Cable: Send {
    /// Shifts a single bit, optionally capturing TDO.
    fn bit_inout(&mut self, input: Option<&mut bool>, out: bool, last_tms: bool)
        -> Result<(), CableError>;

    /// Shifts `n_bits` bits out of `out`, optionally capturing TDO into
    /// `input` (which must hold at least `n_bits.div_ceil(8)` bytes).
    fn stream_inout(
        &mut self,
        input: Option<&mut [u8]>,
        out: &[u8],
        n_bits: usize,
        last_tms: bool,
    ) -> Result<(), CableError>;

    /// Clocks one TCK cycle with TMS at the given level and TDI low.
    fn jtag_write_tms(&mut self, bit: bool) -> Result<(), CableError>;

    /// Drives the dedicated TRST line.
    fn jtag_reset(&mut self, active: bool) -> Result<(), CableError>;

    /// Returns the TAP to Run-Test/Idle through Test-Logic-Reset.
    fn jtag_soft_reset(&mut self) -> Result<(), CableError> {
        for _ in 0..5 {
            self.jtag_write_tms(true)?;
        }
        self.jtag_write_tms(false)?;
        Ok(())
    }

    /// Drives the chip reset line.
    fn chip_reset(&mut self, active: bool) -> Result<(), CableError>;

    /// Pushes out any buffered bit operations.
    fn flush(&mut self) -> Result<(), CableError>;
}

pub(crate) fn bits_to_bytes(n_bits: usize) -> usize {
    n_bits.div_ceil(8)
}
