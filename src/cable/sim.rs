//! In-process JTAG chain simulator.
//!
//! Implements the target side of the bit protocol the adapter speaks: a TAP
//! state machine, IDCODE/bypass/IR shift paths for a configurable chain of
//! devices, and the Advanced Debug Unit burst engine backed by a sparse
//! memory. Tests drive the real adapter against this cable, so the framing
//! (53-bit commands, start bits, CRC, match bits) is exercised for real.
//!
//! Handles are cheap clones sharing one state, which lets a test keep a
//! handle for inspection after the cable has been boxed into the bridge.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{bits_to_bytes, crc, Cable, CableError};

/// One device on the simulated chain.
#[derive(Debug, Clone)]
pub struct SimDevice {
    pub id: u32,
    pub ir_len: usize,
}

impl SimDevice {
    pub fn new(id: u32) -> Self {
        SimDevice { id, ir_len: 4 }
    }
}

/// Width of the generic (non-debug, non-bypass) data registers.
const GENERIC_REG_BITS: usize = 4;

/// One bus transaction observed by the AXI engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BurstRecord {
    pub write: bool,
    pub addr: u32,
    /// Word width in bytes.
    pub width: usize,
    /// Number of words transferred.
    pub count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TapState {
    TestLogicReset,
    RunTestIdle,
    SelectDr,
    CaptureDr,
    ShiftDr,
    Exit1Dr,
    PauseDr,
    Exit2Dr,
    UpdateDr,
    SelectIr,
    CaptureIr,
    ShiftIr,
    Exit1Ir,
    PauseIr,
    Exit2Ir,
    UpdateIr,
}

impl TapState {
    fn next(self, tms: bool) -> TapState {
        use TapState::*;
        match (self, tms) {
            (TestLogicReset, true) => TestLogicReset,
            (TestLogicReset, false) => RunTestIdle,
            (RunTestIdle, true) => SelectDr,
            (RunTestIdle, false) => RunTestIdle,
            (SelectDr, true) => SelectIr,
            (SelectDr, false) => CaptureDr,
            (CaptureDr, true) => Exit1Dr,
            (CaptureDr, false) => ShiftDr,
            (ShiftDr, true) => Exit1Dr,
            (ShiftDr, false) => ShiftDr,
            (Exit1Dr, true) => UpdateDr,
            (Exit1Dr, false) => PauseDr,
            (PauseDr, true) => Exit2Dr,
            (PauseDr, false) => PauseDr,
            (Exit2Dr, true) => ShiftDr,
            (Exit2Dr, false) => PauseDr,
            (UpdateDr, true) => SelectDr,
            (UpdateDr, false) => RunTestIdle,
            (SelectIr, true) => TestLogicReset,
            (SelectIr, false) => CaptureIr,
            (CaptureIr, true) => Exit1Ir,
            (CaptureIr, false) => ShiftIr,
            (ShiftIr, true) => Exit1Ir,
            (ShiftIr, false) => ShiftIr,
            (Exit1Ir, true) => UpdateIr,
            (Exit1Ir, false) => PauseIr,
            (PauseIr, true) => Exit2Ir,
            (PauseIr, false) => PauseIr,
            (Exit2Ir, true) => ShiftIr,
            (Exit2Ir, false) => PauseIr,
            (UpdateIr, true) => SelectDr,
            (UpdateIr, false) => RunTestIdle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IrMode {
    Idcode,
    Bypass,
    Debug,
    Generic(u32),
}

#[derive(Debug)]
struct DeviceState {
    id: u32,
    ir_len: usize,
    ir_mode: IrMode,
    generic_reg: u32,
}

/// What the DR shift path currently routes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShiftKind {
    None,
    Ir,
    DrChain,
    DrDebug,
}

#[derive(Debug)]
enum EnginePhase {
    /// Collecting a module-select, internal-register or burst command.
    Command,
    WritePending {
        width: usize,
        count: usize,
        addr: u32,
    },
    WriteActive {
        width: usize,
        count: usize,
        addr: u32,
        in_bits: Vec<bool>,
        matched: Option<bool>,
    },
    ReadPending {
        width: usize,
        count: usize,
        addr: u32,
    },
    ReadActive {
        delay: usize,
        out: VecDeque<bool>,
    },
    ErrorReadPending,
}

struct SimState {
    devices: Vec<DeviceState>,
    tap: TapState,
    shift_kind: ShiftKind,
    /// Content of the currently selected shift path, front bit next out.
    chain: VecDeque<bool>,
    /// Bits shifted in during the current session, oldest first.
    session_in: Vec<bool>,
    phase: EnginePhase,
    debug_ir: u32,
    memory: HashMap<u32, u8>,
    burst_log: Vec<BurstRecord>,
    read_delay_bits: usize,
    corrupt_next_read_crc: bool,
    latched_error: Option<u32>,
    fail_ops: usize,
}

impl SimState {
    fn reset_devices(&mut self) {
        for device in &mut self.devices {
            device.ir_mode = IrMode::Idcode;
        }
        self.phase = EnginePhase::Command;
    }

    fn debug_engine_active(&self) -> bool {
        self.devices.len() == 1 && self.devices[0].ir_mode == IrMode::Debug
    }

    fn clock(&mut self, tms: bool, tdi: bool) -> bool {
        let out = match self.tap {
            TapState::ShiftDr | TapState::ShiftIr => self.shift_bit(tdi),
            _ => false,
        };

        let previous = self.tap;
        self.tap = previous.next(tms);
        if self.tap != previous || self.tap == TapState::TestLogicReset {
            match self.tap {
                TapState::TestLogicReset => self.reset_devices(),
                TapState::CaptureIr => self.capture_ir(),
                TapState::CaptureDr => self.capture_dr(),
                TapState::UpdateIr => self.update_ir(),
                TapState::UpdateDr => self.update_dr(),
                _ => {}
            }
        }
        out
    }

    fn shift_bit(&mut self, tdi: bool) -> bool {
        self.session_in.push(tdi);
        match self.shift_kind {
            ShiftKind::DrDebug => self.engine_shift(tdi),
            ShiftKind::Ir | ShiftKind::DrChain => {
                let out = self.chain.pop_front().unwrap_or(false);
                self.chain.push_back(tdi);
                out
            }
            ShiftKind::None => false,
        }
    }

    fn capture_ir(&mut self) {
        self.shift_kind = ShiftKind::Ir;
        self.session_in.clear();
        self.chain.clear();
        // Each device captures the mandated 01 pattern in its low bits.
        for device in &self.devices {
            for bit in 0..device.ir_len {
                self.chain.push_back(bit == 0);
            }
        }
    }

    fn capture_dr(&mut self) {
        self.session_in.clear();
        if self.debug_engine_active() {
            self.shift_kind = ShiftKind::DrDebug;
            self.engine_capture();
            return;
        }
        self.shift_kind = ShiftKind::DrChain;
        self.chain.clear();
        for device in &self.devices {
            match device.ir_mode {
                IrMode::Idcode => {
                    for bit in 0..32 {
                        self.chain.push_back(device.id >> bit & 1 != 0);
                    }
                }
                // Auxiliary registers (boot configuration and friends) are
                // modelled four bits wide, like the taps this mirrors.
                IrMode::Generic(_) => {
                    for bit in 0..GENERIC_REG_BITS {
                        self.chain.push_back(device.generic_reg >> bit & 1 != 0);
                    }
                }
                IrMode::Bypass | IrMode::Debug => self.chain.push_back(false),
            }
        }
    }

    fn update_ir(&mut self) {
        let debug_ir = self.debug_ir;
        let chain: Vec<bool> = self.chain.iter().copied().collect();
        let mut offset = 0;
        for device in &mut self.devices {
            let mut value = 0u32;
            for bit in 0..device.ir_len {
                if chain.get(offset + bit).copied().unwrap_or(false) {
                    value |= 1 << bit;
                }
            }
            offset += device.ir_len;
            let all_ones = (1u32 << device.ir_len) - 1;
            device.ir_mode = if value == debug_ir {
                IrMode::Debug
            } else if value == all_ones {
                IrMode::Bypass
            } else {
                IrMode::Generic(value)
            };
        }
        self.shift_kind = ShiftKind::None;
    }

    fn update_dr(&mut self) {
        match self.shift_kind {
            ShiftKind::DrDebug => self.engine_update(),
            ShiftKind::DrChain => {
                // A generic register on a single-device chain latches what
                // was shifted in.
                if self.devices.len() == 1 {
                    if let IrMode::Generic(_) = self.devices[0].ir_mode {
                        let mut value = 0u32;
                        for (bit, set) in self.chain.iter().enumerate().take(GENERIC_REG_BITS) {
                            if *set {
                                value |= 1 << bit;
                            }
                        }
                        self.devices[0].generic_reg = value;
                    }
                }
            }
            _ => {}
        }
        self.shift_kind = ShiftKind::None;
    }

    fn engine_capture(&mut self) {
        match std::mem::replace(&mut self.phase, EnginePhase::Command) {
            EnginePhase::WritePending { width, count, addr } => {
                self.phase = EnginePhase::WriteActive {
                    width,
                    count,
                    addr,
                    in_bits: Vec::new(),
                    matched: None,
                };
            }
            EnginePhase::ReadPending { width, count, addr } => {
                let mut out = VecDeque::new();
                out.push_back(true); // start bit
                let mut payload = vec![0u8; width * count];
                for (i, byte) in payload.iter_mut().enumerate() {
                    *byte = *self.memory.get(&(addr + i as u32)).unwrap_or(&0);
                }
                for i in 0..payload.len() * 8 {
                    out.push_back(payload[i / 8] >> (i % 8) & 1 != 0);
                }
                let mut burst_crc = crc::compute(crc::CRC_SEED, &payload, payload.len() * 8);
                if self.corrupt_next_read_crc {
                    self.corrupt_next_read_crc = false;
                    burst_crc ^= 1;
                }
                for bit in 0..32 {
                    out.push_back(burst_crc >> bit & 1 != 0);
                }
                out.push_back(false); // 33rd CRC bit
                self.burst_log.push(BurstRecord {
                    write: false,
                    addr,
                    width,
                    count,
                });
                self.phase = EnginePhase::ReadActive {
                    delay: self.read_delay_bits,
                    out,
                };
            }
            EnginePhase::ErrorReadPending => {
                let mut out = VecDeque::new();
                let (flag, addr) = match self.latched_error {
                    Some(addr) => (true, addr),
                    None => (false, 0),
                };
                out.push_back(flag);
                for bit in 0..32 {
                    out.push_back(addr >> bit & 1 != 0);
                }
                self.phase = EnginePhase::ReadActive { delay: 0, out };
            }
            other => self.phase = other,
        }
    }

    fn engine_shift(&mut self, tdi: bool) -> bool {
        match &mut self.phase {
            EnginePhase::WriteActive {
                width,
                count,
                in_bits,
                matched,
                ..
            } => {
                let payload_bits = *width * *count * 8;
                let match_index = 1 + payload_bits + 32;
                let index = in_bits.len();
                in_bits.push(tdi);
                if index == match_index {
                    // Start bit, payload and CRC are all in; verify now.
                    let ok = {
                        let started = in_bits.first().copied().unwrap_or(false);
                        let mut payload = vec![0u8; *width * *count];
                        for i in 0..payload_bits {
                            if in_bits[1 + i] {
                                payload[i / 8] |= 1 << (i % 8);
                            }
                        }
                        let mut sent_crc = 0u32;
                        for bit in 0..32 {
                            if in_bits[1 + payload_bits + bit] {
                                sent_crc |= 1 << bit;
                            }
                        }
                        started
                            && sent_crc == crc::compute(crc::CRC_SEED, &payload, payload_bits)
                    };
                    *matched = Some(ok);
                    ok
                } else {
                    false
                }
            }
            EnginePhase::ReadActive { delay, out } => {
                if *delay > 0 {
                    *delay = delay.saturating_sub(1);
                    false
                } else {
                    out.pop_front().unwrap_or(false)
                }
            }
            _ => false,
        }
    }

    fn engine_update(&mut self) {
        match std::mem::replace(&mut self.phase, EnginePhase::Command) {
            EnginePhase::Command => self.decode_command(),
            EnginePhase::WriteActive {
                width,
                count,
                addr,
                in_bits,
                matched,
            } => {
                if matched == Some(true) {
                    let payload_bits = width * count * 8;
                    for i in 0..payload_bits {
                        let byte = addr + (i / 8) as u32;
                        let mut value = *self.memory.get(&byte).unwrap_or(&0);
                        if in_bits[1 + i] {
                            value |= 1 << (i % 8);
                        } else {
                            value &= !(1 << (i % 8));
                        }
                        self.memory.insert(byte, value);
                    }
                    self.burst_log.push(BurstRecord {
                        write: true,
                        addr,
                        width,
                        count,
                    });
                }
            }
            EnginePhase::ReadActive { .. } => {}
            pending => self.phase = pending,
        }
    }

    fn decode_command(&mut self) {
        let bits = &self.session_in;
        let value = bits
            .iter()
            .take(64)
            .enumerate()
            .fold(0u64, |acc, (i, &b)| acc | (u64::from(b) << i));
        match bits.len() {
            6 => match value {
                0x20 => {} // AXI module select
                0x1A => self.phase = EnginePhase::ErrorReadPending,
                0x13 => self.latched_error = None,
                _ => {}
            },
            53 => {
                let count = (value & 0xFFFF) as usize;
                let addr = ((value >> 16) & 0xFFFF_FFFF) as u32;
                let opcode = ((value >> 48) & 0xF) as u8;
                match opcode {
                    0x1 => self.phase = EnginePhase::WritePending { width: 1, count, addr },
                    0x2 => self.phase = EnginePhase::WritePending { width: 2, count, addr },
                    0x3 => self.phase = EnginePhase::WritePending { width: 4, count, addr },
                    0x5 => self.phase = EnginePhase::ReadPending { width: 1, count, addr },
                    0x6 => self.phase = EnginePhase::ReadPending { width: 2, count, addr },
                    0x7 => self.phase = EnginePhase::ReadPending { width: 4, count, addr },
                    _ => {}
                }
            }
            _ => {}
        }
    }
}

/// Simulated cable handle. Clones share the same chain and memory.
#[derive(Clone)]
pub struct SimCable {
    state: Arc<Mutex<SimState>>,
}

impl SimCable {
    pub fn new(devices: Vec<SimDevice>) -> Self {
        assert!(!devices.is_empty());
        SimCable {
            state: Arc::new(Mutex::new(SimState {
                devices: devices
                    .into_iter()
                    .map(|d| DeviceState {
                        id: d.id,
                        ir_len: d.ir_len,
                        ir_mode: IrMode::Idcode,
                        generic_reg: 0,
                    })
                    .collect(),
                tap: TapState::TestLogicReset,
                shift_kind: ShiftKind::None,
                chain: VecDeque::new(),
                session_in: Vec::new(),
                phase: EnginePhase::Command,
                debug_ir: 0x4,
                memory: HashMap::new(),
                burst_log: Vec::new(),
                read_delay_bits: 0,
                corrupt_next_read_crc: false,
                latched_error: None,
                fail_ops: 0,
            })),
        }
    }

    /// Handle onto the simulated memory.
    pub fn memory(&self) -> SimMemory {
        SimMemory {
            state: self.state.clone(),
        }
    }

    /// Snapshot of all bus transactions seen so far.
    pub fn burst_log(&self) -> Vec<BurstRecord> {
        self.state.lock().burst_log.clone()
    }

    pub fn clear_burst_log(&self) {
        self.state.lock().burst_log.clear();
    }

    /// Zero bits clocked out before the read start bit appears.
    pub fn set_read_delay_bits(&self, bits: usize) {
        self.state.lock().read_delay_bits = bits;
    }

    /// Corrupts the CRC of the next read burst.
    pub fn corrupt_next_read_crc(&self) {
        self.state.lock().corrupt_next_read_crc = true;
    }

    /// Latches a bus error for the error-register protocol.
    pub fn latch_bus_error(&self, addr: u32) {
        self.state.lock().latched_error = Some(addr);
    }

    /// Fails the next `n` cable operations with an I/O error.
    pub fn fail_next_ops(&self, n: usize) {
        self.state.lock().fail_ops = n;
    }

    fn check_fault(state: &mut SimState) -> Result<(), CableError> {
        if state.fail_ops > 0 {
            state.fail_ops -= 1;
            return Err(CableError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "simulated cable fault",
            )));
        }
        Ok(())
    }
}

/// Shared view of the simulated target memory.
#[derive(Clone)]
pub struct SimMemory {
    state: Arc<Mutex<SimState>>,
}

impl SimMemory {
    pub fn read(&self, addr: u32, buf: &mut [u8]) {
        let state = self.state.lock();
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = *state.memory.get(&(addr + i as u32)).unwrap_or(&0);
        }
    }

    pub fn write(&self, addr: u32, data: &[u8]) {
        let mut state = self.state.lock();
        for (i, &byte) in data.iter().enumerate() {
            state.memory.insert(addr + i as u32, byte);
        }
    }

    pub fn read_u32(&self, addr: u32) -> u32 {
        let mut word = [0u8; 4];
        self.read(addr, &mut word);
        u32::from_le_bytes(word)
    }

    pub fn write_u32(&self, addr: u32, value: u32) {
        self.write(addr, &value.to_le_bytes());
    }
}

impl Cable for SimCable {
    fn bit_inout(
        &mut self,
        input: Option<&mut bool>,
        out: bool,
        last_tms: bool,
    ) -> Result<(), CableError> {
        let mut state = self.state.lock();
        Self::check_fault(&mut state)?;
        let tdo = state.clock(last_tms, out);
        if let Some(input) = input {
            *input = tdo;
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
        assert!(out.len() >= bits_to_bytes(n_bits));
        let mut state = self.state.lock();
        Self::check_fault(&mut state)?;
        let mut captured = vec![0u8; bits_to_bytes(n_bits)];
        for i in 0..n_bits {
            let tdi = out[i / 8] >> (i % 8) & 1 != 0;
            let tms = last_tms && i == n_bits - 1;
            if state.clock(tms, tdi) {
                captured[i / 8] |= 1 << (i % 8);
            }
        }
        if let Some(input) = input {
            let len = captured.len().min(input.len());
            input[..len].copy_from_slice(&captured[..len]);
        }
        Ok(())
    }

    fn jtag_write_tms(&mut self, bit: bool) -> Result<(), CableError> {
        let mut state = self.state.lock();
        Self::check_fault(&mut state)?;
        state.clock(bit, false);
        Ok(())
    }

    fn jtag_reset(&mut self, active: bool) -> Result<(), CableError> {
        let mut state = self.state.lock();
        Self::check_fault(&mut state)?;
        if active {
            state.tap = TapState::TestLogicReset;
            state.reset_devices();
        }
        Ok(())
    }

    fn chip_reset(&mut self, _active: bool) -> Result<(), CableError> {
        Ok(())
    }

    fn flush(&mut self) -> Result<(), CableError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tap_reaches_shift_dr() {
        let mut state = TapState::TestLogicReset;
        for tms in [false, true, false, false] {
            state = state.next(tms);
        }
        assert_eq!(state, TapState::ShiftDr);
    }

    #[test]
    fn five_tms_ones_reset_from_anywhere() {
        for start in [
            TapState::ShiftDr,
            TapState::PauseIr,
            TapState::UpdateDr,
            TapState::RunTestIdle,
        ] {
            let mut state = start;
            for _ in 0..5 {
                state = state.next(true);
            }
            assert_eq!(state, TapState::TestLogicReset, "from {start:?}");
        }
    }

    #[test]
    fn idcode_shifts_out_after_reset() {
        let mut cable = SimCable::new(vec![SimDevice::new(0xA5A5_0FF1)]);
        cable.jtag_soft_reset().unwrap();
        cable.jtag_write_tms(true).unwrap(); // select DR
        cable.jtag_write_tms(false).unwrap(); // capture
        cable.jtag_write_tms(false).unwrap(); // shift
        let mut recv = [0u8; 4];
        cable.stream_inout(Some(&mut recv), &[0u8; 4], 32, true).unwrap();
        assert_eq!(u32::from_le_bytes(recv), 0xA5A5_0FF1);
    }

    #[test]
    fn memory_handle_defaults_to_zero() {
        let cable = SimCable::new(vec![SimDevice::new(1)]);
        assert_eq!(cable.memory().read_u32(0x100), 0);
        cable.memory().write_u32(0x100, 42);
        assert_eq!(cable.memory().read_u32(0x100), 42);
    }
}
