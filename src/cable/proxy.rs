//! JTAG-over-TCP proxy cable.
//!
//! Each request carries an 8-byte little-endian header followed, for JTAG
//! shifts, by one payload byte per bit. TDI sits in its own bit position,
//! TRST is held deasserted on every data byte, and TMS is set on the last
//! byte when the shift leaves the TAP state. Captured TDO comes back packed
//! eight bits per byte.

use std::sync::Arc;
use std::time::Duration;

use scroll::{Pread, Pwrite, LE};
use tracing::{debug, info};

use super::{bits_to_bytes, Cable, CableError};
use crate::event_loop::EventLoop;
use crate::net::{Client, Socket};

const REQ_JTAG: u32 = 1;
const REQ_RESET: u32 = 2;

/// Bit positions inside a payload byte.
const BIT_TRST: u8 = 0;
const BIT_TMS: u8 = 1;
const BIT_TDI: u8 = 2;

#[derive(Debug, Clone, Copy, Pread, Pwrite)]
struct ProxyHeader {
    kind: u32,
    bits: u16,
    tdo: u8,
    pad: u8,
}

impl ProxyHeader {
    fn to_bytes(self) -> [u8; 8] {
        let mut raw = [0u8; 8];
        raw.pwrite_with(self, 0, LE).expect("header fits");
        raw
    }
}

/// Cable talking to an external JTAG proxy server.
pub struct JtagProxy {
    socket: Arc<Socket>,
}

impl JtagProxy {
    pub fn connect(
        el: &EventLoop,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<JtagProxy, CableError> {
        info!(host, port, "connecting to JTAG proxy");
        let socket = Client::new(el).connect_blocking(host, port, timeout)?;
        info!(host, port, "JTAG proxy connected");
        Ok(JtagProxy { socket })
    }

    fn proxy_stream(
        &mut self,
        input: Option<&mut [u8]>,
        out: &[u8],
        n_bits: usize,
        last_tms: bool,
        data_bit: u8,
    ) -> Result<(), CableError> {
        if n_bits >= 1 << 16 {
            return Err(CableError::StreamTooLong(n_bits));
        }

        let header = ProxyHeader {
            kind: REQ_JTAG,
            bits: n_bits as u16,
            tdo: input.is_some() as u8,
            pad: 0,
        };

        let mut payload = vec![0u8; n_bits];
        for (i, slot) in payload.iter_mut().enumerate() {
            let bit = out[i / 8] >> (i % 8) & 1;
            *slot = bit << data_bit;
            // TRST is active low; keep it released unless it is the signal
            // being driven.
            if data_bit != BIT_TRST {
                *slot |= 1 << BIT_TRST;
            }
        }
        if last_tms {
            payload[n_bits - 1] |= 1 << BIT_TMS;
        }

        self.socket.write_immediate(&header.to_bytes())?;
        self.socket.write_immediate(&payload)?;

        if let Some(input) = input {
            let want = bits_to_bytes(n_bits);
            let mut got = 0;
            while got < want {
                let n = self.socket.read_immediate(&mut input[got..want], None)?;
                if n == 0 {
                    return Err(CableError::Disconnected);
                }
                got += n;
            }
        }
        Ok(())
    }
}

impl Cable for JtagProxy {
    fn bit_inout(
        &mut self,
        input: Option<&mut bool>,
        out: bool,
        last_tms: bool,
    ) -> Result<(), CableError> {
        let mut captured = [0u8; 1];
        let out_byte = [out as u8];
        self.stream_inout(
            input.is_some().then_some(&mut captured[..]),
            &out_byte,
            1,
            last_tms,
        )?;
        if let Some(input) = input {
            *input = captured[0] & 1 != 0;
        }
        Ok(())
    }

    fn stream_inout(
        &mut self,
        input: Option<&mut [u8]>,
        out: &[u8],
        n_bits: usize,
        last_tms: bool,
    ) -> Result<(), CableError> {
        self.proxy_stream(input, out, n_bits, last_tms, BIT_TDI)
    }

    fn jtag_write_tms(&mut self, bit: bool) -> Result<(), CableError> {
        // A TMS move is a one-bit shift with TMS at the requested level.
        let out = [0u8];
        self.proxy_stream(None, &out, 1, bit, BIT_TDI)
    }

    fn jtag_reset(&mut self, active: bool) -> Result<(), CableError> {
        debug!(active, "jtag reset");
        let value = [!active as u8];
        self.proxy_stream(None, &value, 1, false, BIT_TRST)
    }

    fn chip_reset(&mut self, active: bool) -> Result<(), CableError> {
        debug!(active, "chip reset");
        let header = ProxyHeader {
            kind: REQ_RESET,
            bits: 0,
            // The reset level travels in the tdo slot of the header.
            tdo: active as u8,
            pad: 0,
        };
        self.socket.write_immediate(&header.to_bytes())?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), CableError> {
        Ok(())
    }
}
