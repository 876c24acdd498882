//! Per-core debug operations.
//!
//! A powered-off core swallows every operation: reads come back as zero and
//! writes do nothing, so callers never touch a gated bus.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::regs::*;
use crate::cable::{AdvDebugUnit, CableError};

pub struct Core {
    adapter: Arc<AdvDebugUnit>,
    pub cluster_id: u32,
    pub core_id: u32,
    /// Dense, process-stable identifier; the RSP wire sees `thread_id + 1`.
    pub thread_id: usize,
    dbg_unit_addr: u32,
    is_on: bool,
    stopped: bool,
    step: bool,
    commit_step: bool,
    resume_prepared: bool,
    on_trap: bool,
    pc_cached: Option<u32>,
    power_state_changed: bool,
}

impl Core {
    pub fn new(
        adapter: Arc<AdvDebugUnit>,
        cluster_id: u32,
        core_id: u32,
        thread_id: usize,
        dbg_unit_addr: u32,
    ) -> Core {
        debug!(cluster_id, core_id, thread_id, "instantiated core");
        Core {
            adapter,
            cluster_id,
            core_id,
            thread_id,
            dbg_unit_addr,
            is_on: false,
            stopped: false,
            step: false,
            commit_step: false,
            resume_prepared: false,
            on_trap: false,
            pc_cached: None,
            power_state_changed: false,
        }
    }

    pub fn init(&mut self, is_on: bool) {
        self.is_on = is_on;
        self.pc_cached = None;
        self.stopped = false;
        self.step = false;
        self.commit_step = false;
    }

    pub fn is_on(&self) -> bool {
        self.is_on
    }

    pub fn name(&self) -> String {
        format!("Cluster {:02} - Core {:01}", self.cluster_id, self.core_id)
    }

    /// Reads a register of the debug bank, by byte offset.
    pub fn read(&self, offset: u32) -> Result<u32, CableError> {
        if !self.is_on {
            return Ok(0);
        }
        let value = self.adapter.read_u32(self.dbg_unit_addr + offset)?;
        trace!(
            addr = format_args!("{:#010x}", self.dbg_unit_addr + offset),
            value = format_args!("{value:#010x}"),
            "dbg read"
        );
        Ok(value)
    }

    /// Writes a register of the debug bank, by byte offset.
    pub fn write(&self, offset: u32, value: u32) -> Result<(), CableError> {
        if !self.is_on {
            return Ok(());
        }
        trace!(
            addr = format_args!("{:#010x}", self.dbg_unit_addr + offset),
            value = format_args!("{value:#010x}"),
            "dbg write"
        );
        self.adapter.write_u32(self.dbg_unit_addr + offset, value)
    }

    pub fn gpr_read(&self, index: u32) -> Result<u32, CableError> {
        self.read(DBG_GPR_BASE + index * 4)
    }

    pub fn gpr_write(&self, index: u32, value: u32) -> Result<(), CableError> {
        self.write(DBG_GPR_BASE + index * 4, value)
    }

    /// Reads all 32 general purpose registers in one burst.
    pub fn gpr_read_all(&self) -> Result<[u32; 32], CableError> {
        let mut gpr = [0u32; 32];
        if !self.is_on {
            return Ok(gpr);
        }
        let mut raw = [0u8; 32 * 4];
        self.adapter
            .read(self.dbg_unit_addr + DBG_GPR_BASE, &mut raw)?;
        for (value, bytes) in gpr.iter_mut().zip(raw.chunks_exact(4)) {
            *value = u32::from_le_bytes(bytes.try_into().unwrap());
        }
        Ok(gpr)
    }

    pub fn csr_read(&self, index: u32) -> Result<u32, CableError> {
        self.read(DBG_CSR_BASE + index * 4)
    }

    pub fn csr_write(&self, index: u32, value: u32) -> Result<(), CableError> {
        self.write(DBG_CSR_BASE + index * 4, value)
    }

    /// Requests a halt by setting the halt bit of CTRL.
    pub fn stop(&mut self) -> Result<(), CableError> {
        if !self.is_on || self.stopped {
            return Ok(());
        }
        debug!(cluster = self.cluster_id, core = self.core_id, "halting core");
        let mut ctrl = DbgCtrl(self.read(DBG_CTRL_REG)?);
        ctrl.set_halted(true);
        self.write(DBG_CTRL_REG, ctrl.0)
    }

    pub fn halt(&mut self) -> Result<(), CableError> {
        self.stop()
    }

    pub fn is_stopped(&mut self) -> Result<bool, CableError> {
        if !self.is_on {
            return Ok(false);
        }
        let ctrl = DbgCtrl(self.read(DBG_CTRL_REG)?);
        self.stopped = ctrl.halted();
        trace!(
            cluster = self.cluster_id,
            core = self.core_id,
            stopped = self.stopped,
            "core status"
        );
        Ok(self.stopped)
    }

    /// Decodes HIT: whether a single step retired and whether the core
    /// sleeps in a wfi.
    pub fn read_hit(&self) -> Result<(bool, bool), CableError> {
        let hit = DbgHit(self.read(DBG_HIT_REG)?);
        Ok((self.step && hit.ss_hit(), hit.sleeping()))
    }

    pub fn get_cause(&self) -> Result<u32, CableError> {
        self.read(DBG_CAUSE_REG)
    }

    /// Program counter the debugger should see.
    ///
    /// The value is NPC while stepping and on interrupt or debug-request
    /// entries, PPC otherwise. Cached until the core resumes or its power
    /// toggles.
    pub fn actual_pc_read(&mut self) -> Result<u32, CableError> {
        if let Some(pc) = self.pc_cached {
            return Ok(pc);
        }
        let ppc = self.read(DBG_PPC_REG)?;
        let npc = self.read(DBG_NPC_REG)?;
        let (is_hit, _) = self.read_hit()?;

        let pc = if is_hit {
            self.on_trap = false;
            npc
        } else {
            let cause = self.get_cause()?;
            self.on_trap = cause & EXC_CAUSE_MASK == EXC_CAUSE_BREAKPOINT
                && !cause_is_interrupt(cause);
            if cause_is_interrupt(cause) || cause & EXC_CAUSE_MASK == EXC_CAUSE_DBG_HALT {
                npc
            } else {
                ppc
            }
        };
        debug!(
            cluster = self.cluster_id,
            core = self.core_id,
            ppc = format_args!("{ppc:#010x}"),
            npc = format_args!("{npc:#010x}"),
            pc = format_args!("{pc:#010x}"),
            "pc read"
        );
        self.pc_cached = Some(pc);
        Ok(pc)
    }

    /// True while the cached state says the core trapped on a breakpoint.
    pub fn is_stopped_on_trap(&self) -> bool {
        self.pc_cached.is_some() && self.on_trap
    }

    /// What a GDB client should be told about this core right now.
    pub fn get_signal(&mut self) -> Result<TargetSignal, CableError> {
        if !self.is_stopped()? {
            return Ok(TargetSignal::None);
        }
        let (is_hit, is_sleeping) = self.read_hit()?;
        if is_hit {
            return Ok(TargetSignal::Trap);
        }
        if is_sleeping {
            return Ok(TargetSignal::None);
        }
        Ok(cause_to_signal(self.get_cause()?))
    }

    /// Polls one core after a resume. Returns the stop cause, if any.
    pub fn check_stopped(&mut self) -> Result<Option<u32>, CableError> {
        if !self.resume_prepared || !self.is_stopped()? {
            return Ok(None);
        }
        let (is_hit, is_sleeping) = self.read_hit()?;
        if is_hit {
            debug!(
                cluster = self.cluster_id,
                core = self.core_id,
                "core finished its single step"
            );
            return Ok(Some(EXC_CAUSE_BREAKPOINT));
        }
        if is_sleeping {
            return Ok(None);
        }
        let cause = self.get_cause()?;
        debug!(
            cluster = self.cluster_id,
            core = self.core_id,
            cause = format_args!("{cause:#010x}"),
            "core stopped"
        );
        Ok(Some(cause))
    }

    /// Records the step mode wanted on the next resume. The CTRL write is
    /// deferred until the resume is committed.
    pub fn set_step_mode(&mut self, step: bool) {
        if step != self.step {
            debug!(
                cluster = self.cluster_id,
                core = self.core_id,
                step,
                "step mode changed"
            );
            self.step = step;
            self.commit_step = true;
        }
    }

    fn commit_step_mode(&mut self) -> Result<(), CableError> {
        if !self.is_on || !self.commit_step {
            return Ok(());
        }
        let mut ctrl = DbgCtrl(0);
        ctrl.set_halted(true);
        ctrl.set_single_step(self.step);
        self.write(DBG_CTRL_REG, ctrl.0)?;
        self.commit_step = false;
        Ok(())
    }

    /// Marks the core as taking part in the next resume.
    pub fn prepare_resume(&mut self, step: bool) {
        if self.resume_prepared {
            return;
        }
        self.resume_prepared = true;
        self.set_step_mode(step);
    }

    pub fn clear_resume(&mut self) {
        self.resume_prepared = false;
    }

    pub fn should_resume(&self) -> bool {
        self.resume_prepared
    }

    /// Pushes the pending step mode and clears HIT ahead of a cluster-level
    /// resume through the cross-trigger matrix.
    pub fn commit_resume(&mut self) -> Result<(), CableError> {
        self.stopped = false;
        if !self.is_on {
            return Ok(());
        }
        self.pc_cached = None;
        self.commit_step_mode()?;
        self.write(DBG_HIT_REG, 0)
    }

    /// Resumes this core individually.
    pub fn resume(&mut self) -> Result<(), CableError> {
        self.stopped = false;
        if !self.is_on {
            return Ok(());
        }
        debug!(
            cluster = self.cluster_id,
            core = self.core_id,
            step = self.step,
            "resuming core"
        );
        // HIT must be cleared before CTRL releases the core.
        if let Err(err) = self.write(DBG_HIT_REG, 0) {
            warn!(%err, "unable to clear hit register");
        }
        let mut ctrl = DbgCtrl(0);
        ctrl.set_single_step(self.step);
        if let Err(err) = self.write(DBG_CTRL_REG, ctrl.0) {
            warn!(%err, "unable to write ctrl register");
        }
        self.commit_step = false;
        self.pc_cached = None;
        Ok(())
    }

    /// Rewrites NPC with itself, forcing a prefetch buffer flush.
    pub fn flush(&self) -> Result<(), CableError> {
        if !self.is_on {
            return Ok(());
        }
        let npc = self.read(DBG_NPC_REG)?;
        self.write(DBG_NPC_REG, npc)
    }

    /// True once the power state toggled since the last call; consumers
    /// use this to drop any state derived from the dead core.
    pub fn take_power_state_change(&mut self) -> bool {
        std::mem::replace(&mut self.power_state_changed, false)
    }

    /// Applies a power edge. Powering on enables the ebreak and illegal
    /// instruction traps; either edge invalidates the cached PC.
    pub fn set_power(&mut self, is_on: bool) -> Result<(), CableError> {
        if is_on == self.is_on {
            return Ok(());
        }
        self.is_on = is_on;
        self.power_state_changed = true;
        self.pc_cached = None;
        if is_on {
            debug!(cluster = self.cluster_id, core = self.core_id, "core powered on");
            self.write(DBG_IE_REG, 1 << 3 | 1 << 2)?;
        } else {
            debug!(cluster = self.cluster_id, core = self.core_id, "core powered off");
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn step_state(&self) -> (bool, bool, bool) {
        (self.step, self.commit_step, self.resume_prepared)
    }
}
