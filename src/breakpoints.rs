//! Software breakpoints.
//!
//! A breakpoint replaces the instruction at its address with an `ebreak`,
//! sized to match the original encoding: compressed instructions get the
//! 16-bit `c.ebreak`, everything else the full 32-bit `ebreak`. Two history
//! sets track what changed since the last resume so the target only flushes
//! its prefetch buffers when a breakpoint actually moved.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, error};

use crate::cable::{AdvDebugUnit, CableError};

const INSN_BP: u32 = 0x0010_0073;
const INSN_BP_COMPRESSED: u16 = 0x9002;

fn insn_is_compressed(insn: u32) -> bool {
    insn & 0x3 != 0x3
}

/// The instruction a breakpoint displaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OriginalInsn {
    Compressed(u16),
    Full(u32),
}

#[derive(Debug)]
struct Breakpoint {
    original: OriginalInsn,
    enabled: bool,
}

pub struct Breakpoints {
    adapter: Arc<AdvDebugUnit>,
    table: BTreeMap<u32, Breakpoint>,
    enabled_since: BTreeSet<u32>,
    disabled_since: BTreeSet<u32>,
}

impl Breakpoints {
    pub fn new(adapter: Arc<AdvDebugUnit>) -> Breakpoints {
        Breakpoints {
            adapter,
            table: BTreeMap::new(),
            enabled_since: BTreeSet::new(),
            disabled_since: BTreeSet::new(),
        }
    }

    /// True if an enabled breakpoint sits at `addr`.
    pub fn is_active(&self, addr: u32) -> bool {
        self.table.get(&addr).is_some_and(|bp| bp.enabled)
    }

    pub fn at_addr(&self, addr: u32) -> bool {
        self.table.contains_key(&addr)
    }

    /// Something was enabled or disabled since the last history clear.
    pub fn have_changed(&self) -> bool {
        !self.enabled_since.is_empty() || !self.disabled_since.is_empty()
    }

    pub fn clear_history(&mut self) {
        self.enabled_since.clear();
        self.disabled_since.clear();
    }

    fn mark_enabled(&mut self, addr: u32) {
        if !self.disabled_since.remove(&addr) {
            self.enabled_since.insert(addr);
        }
    }

    fn mark_disabled(&mut self, addr: u32) {
        if !self.enabled_since.remove(&addr) {
            self.disabled_since.insert(addr);
        }
    }

    /// Plants a breakpoint at `addr`, reusing an existing record.
    pub fn insert(&mut self, addr: u32) -> Result<(), CableError> {
        if let Some(bp) = self.table.get(&addr) {
            if bp.enabled {
                error!(addr = format_args!("{addr:#010x}"), "breakpoint already inserted");
                return Ok(());
            }
        }
        debug!(addr = format_args!("{addr:#010x}"), "inserting breakpoint");
        let original = self.write_trap(addr)?;
        self.table.insert(
            addr,
            Breakpoint {
                original,
                enabled: true,
            },
        );
        self.mark_enabled(addr);
        Ok(())
    }

    /// Restores the original instruction and drops the record.
    pub fn remove(&mut self, addr: u32) -> Result<(), CableError> {
        match self.table.remove(&addr) {
            Some(bp) => {
                if bp.enabled {
                    self.restore_original(addr, bp.original)?;
                    self.mark_disabled(addr);
                }
                Ok(())
            }
            None => {
                debug!(addr = format_args!("{addr:#010x}"), "no breakpoint to remove");
                Ok(())
            }
        }
    }

    /// Re-arms every breakpoint without touching the table.
    pub fn enable_all(&mut self) -> Result<(), CableError> {
        debug!(count = self.table.len(), "enabling all breakpoints");
        let addrs: Vec<u32> = self.table.keys().copied().collect();
        for addr in addrs {
            if !self.table[&addr].enabled {
                let original = self.write_trap(addr)?;
                let bp = self.table.get_mut(&addr).unwrap();
                bp.original = original;
                bp.enabled = true;
                self.mark_enabled(addr);
            }
        }
        Ok(())
    }

    /// Puts the original instructions back without dropping the records.
    pub fn disable_all(&mut self) -> Result<(), CableError> {
        debug!(count = self.table.len(), "disabling all breakpoints");
        let entries: Vec<(u32, OriginalInsn, bool)> = self
            .table
            .iter()
            .map(|(addr, bp)| (*addr, bp.original, bp.enabled))
            .collect();
        for (addr, original, enabled) in entries {
            if enabled {
                self.restore_original(addr, original)?;
                self.table.get_mut(&addr).unwrap().enabled = false;
                self.mark_disabled(addr);
            }
        }
        Ok(())
    }

    /// Removes every breakpoint, restoring the target's code.
    pub fn clear(&mut self) -> Result<(), CableError> {
        let addrs: Vec<u32> = self.table.keys().copied().collect();
        for addr in addrs {
            self.remove(addr)?;
        }
        Ok(())
    }

    /// Reads the instruction at `addr` and replaces it with the matching
    /// trap encoding.
    fn write_trap(&mut self, addr: u32) -> Result<OriginalInsn, CableError> {
        let mut word = [0u8; 4];
        self.adapter.read(addr, &mut word)?;
        let insn = u32::from_le_bytes(word);

        if insn_is_compressed(insn) {
            debug!(
                addr = format_args!("{addr:#010x}"),
                insn = format_args!("{insn:#06x}"),
                "arming compressed breakpoint"
            );
            self.adapter.write(addr, &INSN_BP_COMPRESSED.to_le_bytes())?;
            Ok(OriginalInsn::Compressed(insn as u16))
        } else {
            debug!(
                addr = format_args!("{addr:#010x}"),
                insn = format_args!("{insn:#010x}"),
                "arming breakpoint"
            );
            self.adapter.write(addr, &INSN_BP.to_le_bytes())?;
            Ok(OriginalInsn::Full(insn))
        }
    }

    fn restore_original(&mut self, addr: u32, original: OriginalInsn) -> Result<(), CableError> {
        let mut word = [0u8; 4];
        self.adapter.read(addr, &mut word)?;
        let current = u32::from_le_bytes(word);

        match original {
            OriginalInsn::Compressed(insn) => {
                if current as u16 != INSN_BP_COMPRESSED {
                    error!(
                        addr = format_args!("{addr:#010x}"),
                        current = format_args!("{current:#010x}"),
                        "memory does not hold a compressed ebreak"
                    );
                }
                self.adapter.write(addr, &insn.to_le_bytes())
            }
            OriginalInsn::Full(insn) => {
                if current != INSN_BP {
                    error!(
                        addr = format_args!("{addr:#010x}"),
                        current = format_args!("{current:#010x}"),
                        "memory does not hold an ebreak"
                    );
                }
                self.adapter.write(addr, &insn.to_le_bytes())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cable::sim::{SimCable, SimDevice};
    use crate::config::AdvDbgConfig;

    fn setup() -> (Breakpoints, SimCable) {
        let cable = SimCable::new(vec![SimDevice::new(0x1234_5677)]);
        let handle = cable.clone();
        let adapter =
            AdvDebugUnit::connect(Box::new(cable), &AdvDbgConfig::default(), false).unwrap();
        (Breakpoints::new(adapter), handle)
    }

    #[test]
    fn full_insn_roundtrip() {
        let (mut bps, sim) = setup();
        sim.memory().write_u32(0x1000, 0x0000_00EF); // jal, uncompressed
        bps.insert(0x1000).unwrap();
        assert_eq!(sim.memory().read_u32(0x1000), INSN_BP);
        assert!(bps.is_active(0x1000));
        bps.remove(0x1000).unwrap();
        assert_eq!(sim.memory().read_u32(0x1000), 0x0000_00EF);
        assert!(!bps.at_addr(0x1000));
    }

    #[test]
    fn compressed_insn_roundtrip() {
        let (mut bps, sim) = setup();
        // Low half is a compressed instruction, high half belongs to the
        // next instruction and must survive untouched.
        sim.memory().write_u32(0x2000, 0xBEEF_4501);
        bps.insert(0x2000).unwrap();
        let word = sim.memory().read_u32(0x2000);
        assert_eq!(word as u16, INSN_BP_COMPRESSED);
        assert_eq!(word >> 16, 0xBEEF);
        bps.remove(0x2000).unwrap();
        assert_eq!(sim.memory().read_u32(0x2000), 0xBEEF_4501);
    }

    #[test]
    fn compression_detection() {
        for (insn, compressed) in [
            (0x0000_0013u32, false), // nop
            (0x0000_4501, true),
            (0xFFFF_FFFF, false),
            (0x0000_0002, true),
        ] {
            assert_eq!(insn_is_compressed(insn), compressed, "insn {insn:#010x}");
        }
    }

    #[test]
    fn history_tracks_changes() {
        let (mut bps, sim) = setup();
        sim.memory().write_u32(0x1000, 0x0000_0013);
        assert!(!bps.have_changed());
        bps.insert(0x1000).unwrap();
        assert!(bps.have_changed());
        bps.clear_history();
        assert!(!bps.have_changed());
        // Disable and re-enable cancel each other out.
        bps.disable_all().unwrap();
        bps.enable_all().unwrap();
        assert!(!bps.have_changed());
        bps.disable_all().unwrap();
        assert!(bps.have_changed());
    }

    #[test]
    fn disable_all_restores_memory_but_keeps_records() {
        let (mut bps, sim) = setup();
        sim.memory().write_u32(0x1000, 0x0000_0013);
        bps.insert(0x1000).unwrap();
        bps.disable_all().unwrap();
        assert_eq!(sim.memory().read_u32(0x1000), 0x0000_0013);
        assert!(bps.at_addr(0x1000));
        assert!(!bps.is_active(0x1000));
        bps.enable_all().unwrap();
        assert_eq!(sim.memory().read_u32(0x1000), INSN_BP);
    }

    #[test]
    fn clear_removes_everything() {
        let (mut bps, sim) = setup();
        sim.memory().write_u32(0x1000, 0x0000_0013);
        sim.memory().write_u32(0x2000, 0x0000_4501);
        bps.insert(0x1000).unwrap();
        bps.insert(0x2000).unwrap();
        bps.clear().unwrap();
        assert_eq!(sim.memory().read_u32(0x1000), 0x0000_0013);
        assert_eq!(sim.memory().read_u32(0x2000), 0x0000_4501);
        assert!(!bps.at_addr(0x1000));
        assert!(!bps.at_addr(0x2000));
    }
}
