//! Cluster-level control: power gating, halt distribution and caches.

use std::sync::Arc;

use tracing::{debug, warn};

use super::core::Core;
use super::regs::*;
use crate::breakpoints::Breakpoints;
use crate::cable::{AdvDebugUnit, CableError};

/// How to find out whether a cluster is powered.
#[derive(Debug, Clone)]
pub enum PowerCtrl {
    /// The domain is always on (the fabric controller).
    Always,
    /// A bit in a SoC controller register tells.
    Bypass { reg_addr: u32, bit: u8 },
}

impl PowerCtrl {
    fn is_on(&self, adapter: &AdvDebugUnit) -> Result<bool, CableError> {
        match self {
            PowerCtrl::Always => Ok(true),
            PowerCtrl::Bypass { reg_addr, bit } => {
                let info = adapter.read_u32(*reg_addr)?;
                Ok(info >> bit & 1 != 0)
            }
        }
    }
}

/// Offsets inside the cluster control block.
const XTRIGGER_HALT_MASK: u32 = 0x38;
const XTRIGGER_HALT_RESUME: u32 = 0x28;

/// Halt distribution model of a cluster.
#[derive(Debug, Clone)]
pub enum HaltCtrl {
    /// Cores are halted and resumed one by one.
    Single,
    /// A cross-trigger matrix propagates one core's halt to its siblings.
    XTrigger { base: u32, current_mask: u32 },
}

impl HaltCtrl {
    fn init(&mut self, adapter: &AdvDebugUnit) -> Result<(), CableError> {
        match self {
            HaltCtrl::Single => Ok(()),
            HaltCtrl::XTrigger { current_mask, .. } => {
                *current_mask = 0;
                self.set_halt_mask(adapter, 0xFFFF_FFFF)
            }
        }
    }

    /// Programs which cores the cross trigger stops. Writing an unchanged
    /// mask is a successful no-op.
    fn set_halt_mask(&mut self, adapter: &AdvDebugUnit, mask: u32) -> Result<(), CableError> {
        if let HaltCtrl::XTrigger { base, current_mask } = self {
            if *current_mask != mask {
                adapter.write_u32(*base + XTRIGGER_HALT_MASK, mask)?;
                *current_mask = mask;
            }
        }
        Ok(())
    }

    pub fn has_xtrigger(&self) -> bool {
        matches!(self, HaltCtrl::XTrigger { .. })
    }
}

/// Instruction cache flush register of a cluster or of the FC.
#[derive(Debug, Clone)]
pub enum CacheCtrl {
    Cluster { base: u32 },
    Fc { base: u32 },
}

impl CacheCtrl {
    fn flush(&self, adapter: &AdvDebugUnit) -> Result<(), CableError> {
        let base = match self {
            CacheCtrl::Cluster { base } | CacheCtrl::Fc { base } => *base,
        };
        debug!(addr = format_args!("{base:#010x}"), "flushing instruction cache");
        adapter.write_u32(base + 0x04, 0xFFFF_FFFF)
    }
}

pub struct Cluster {
    adapter: Arc<AdvDebugUnit>,
    pub cluster_id: u32,
    power: PowerCtrl,
    ctrl: HaltCtrl,
    cache: Option<CacheCtrl>,
    pub cores: Vec<Core>,
    is_on: bool,
    nb_on_cores: u32,
}

impl Cluster {
    pub fn new(
        adapter: Arc<AdvDebugUnit>,
        cluster_id: u32,
        power: PowerCtrl,
        ctrl: HaltCtrl,
        cache: Option<CacheCtrl>,
        cores: Vec<Core>,
    ) -> Cluster {
        debug!(cluster_id, nb_cores = cores.len(), "instantiated cluster");
        Cluster {
            adapter,
            cluster_id,
            power,
            ctrl,
            cache,
            cores,
            is_on: false,
            nb_on_cores: 0,
        }
    }

    pub fn is_on(&self) -> bool {
        self.is_on
    }

    pub fn init(&mut self) -> Result<(), CableError> {
        self.is_on = self.power.is_on(&self.adapter)?;
        self.nb_on_cores = if self.is_on { self.cores.len() as u32 } else { 0 };
        debug!(cluster = self.cluster_id, is_on = self.is_on, "init cluster");
        let is_on = self.is_on;
        for core in &mut self.cores {
            core.init(is_on);
        }
        if self.is_on {
            self.ctrl.init(&self.adapter)?;
        }
        Ok(())
    }

    /// Re-reads the power state and applies any edge to the cores.
    pub fn update_power(&mut self) -> Result<(), CableError> {
        let is_on = self.power.is_on(&self.adapter)?;
        self.set_power(is_on)
    }

    fn set_power(&mut self, is_on: bool) -> Result<(), CableError> {
        if is_on != self.is_on {
            debug!(cluster = self.cluster_id, is_on, "cluster power changed");
            self.is_on = is_on;
            if is_on {
                self.ctrl.init(&self.adapter)?;
            }
        }
        if is_on {
            if self.nb_on_cores != self.cores.len() as u32 {
                for core in &mut self.cores {
                    core.set_power(true)?;
                }
                self.nb_on_cores = self.cores.len() as u32;
            }
        } else {
            for core in &mut self.cores {
                core.set_power(false)?;
            }
            self.nb_on_cores = 0;
        }
        Ok(())
    }

    /// Halts the cluster.
    ///
    /// With a cross-trigger matrix halting the first core stops every
    /// sibling; otherwise each core is halted individually. Afterwards any
    /// core sitting on a live breakpoint it trapped on has its NPC rewound
    /// so the original instruction re-executes once the breakpoint is gone.
    pub fn halt(&mut self, breakpoints: &Breakpoints) -> Result<(), CableError> {
        if !self.is_on {
            return Ok(());
        }
        debug!(cluster = self.cluster_id, "halting cluster");
        if self.ctrl.has_xtrigger() {
            if let Some(first) = self.cores.first_mut() {
                first.halt()?;
            }
        } else {
            for core in &mut self.cores {
                core.halt()?;
            }
        }

        for core in &mut self.cores {
            if !core.is_on() || !core.is_stopped()? {
                continue;
            }
            let pc = core.actual_pc_read()?;
            if breakpoints.is_active(pc) && core.is_stopped_on_trap() {
                debug!(
                    cluster = self.cluster_id,
                    core = core.core_id,
                    pc = format_args!("{pc:#010x}"),
                    "core stopped on a live breakpoint, rewinding npc"
                );
                core.write(DBG_NPC_REG, pc)?;
            }
        }
        Ok(())
    }

    /// Resumes every prepared core.
    pub fn resume(&mut self) -> Result<(), CableError> {
        debug!(cluster = self.cluster_id, "resuming cluster");
        if self.ctrl.has_xtrigger() {
            // Step mode is cached per core and has to be committed through
            // the per-core registers before the global release.
            let mut mask = 0u32;
            for core in &mut self.cores {
                if core.should_resume() {
                    core.commit_resume()?;
                    mask |= 1 << core.core_id;
                }
            }
            if self.is_on {
                self.ctrl.set_halt_mask(&self.adapter, mask)?;
                if let HaltCtrl::XTrigger { base, .. } = self.ctrl {
                    debug!(
                        cluster = self.cluster_id,
                        mask = format_args!("{mask:#010x}"),
                        "resuming through the cross-trigger register"
                    );
                    self.adapter.write_u32(base + XTRIGGER_HALT_RESUME, mask)?;
                }
            }
        } else {
            for core in &mut self.cores {
                if core.should_resume() {
                    core.resume()?;
                }
            }
        }
        Ok(())
    }

    /// Looks for a stopped core among those taking part in the last
    /// resume. A breakpoint hit beats any other stop cause.
    pub fn check_stopped(&mut self) -> Result<Option<(usize, u32)>, CableError> {
        let mut found: Option<(usize, u32)> = None;
        for core in &mut self.cores {
            if let Some(cause) = core.check_stopped()? {
                if cause & EXC_CAUSE_MASK == EXC_CAUSE_BREAKPOINT && !cause_is_interrupt(cause) {
                    return Ok(Some((core.thread_id, cause)));
                }
                if found.is_none() {
                    found = Some((core.thread_id, cause));
                }
            }
        }
        Ok(found)
    }

    /// Flushes the instruction cache and every core's prefetch buffer.
    pub fn flush(&mut self) -> Result<(), CableError> {
        if !self.is_on {
            return Ok(());
        }
        debug!(cluster = self.cluster_id, "flushing cluster");
        if let Some(cache) = &self.cache {
            cache.flush(&self.adapter)?;
        }
        for core in &self.cores {
            if let Err(err) = core.flush() {
                warn!(%err, core = core.core_id, "prefetch flush failed");
            }
        }
        Ok(())
    }
}
