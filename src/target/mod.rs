//! Target model: clusters, cores and the thread map exposed to GDB.

pub mod cluster;
pub mod core;
pub mod regs;

use std::sync::Arc;

use tracing::debug;

pub use cluster::{CacheCtrl, Cluster, HaltCtrl, PowerCtrl};
pub use core::Core;
pub use regs::{cause_to_signal, TargetSignal};

use crate::breakpoints::Breakpoints;
use crate::cable::{AdvDebugUnit, CableError};
use crate::config::Config;

/// Offset of the cluster debug units inside a cluster's address space.
const CLUSTER_DBG_UNIT_OFFSET: u32 = 0x30_0000;
/// Stride between per-core debug units.
const CORE_DBG_UNIT_STRIDE: u32 = 0x8000;
/// Offset of the cluster controller (cross trigger) block.
const CLUSTER_CTRL_OFFSET: u32 = 0x20_0000;
/// Offset of the cluster instruction cache controller.
const CLUSTER_CACHE_OFFSET: u32 = 0x20_1400;
/// Stride between clusters.
const CLUSTER_STRIDE: u32 = 0x40_0000;

/// A core that stopped, as reported by [`Target::check_stopped`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoppedCore {
    pub thread_id: usize,
    pub cause: u32,
}

/// The set of clusters the bridge controls.
///
/// Cores carry a dense `thread_id` assigned at construction; it never
/// changes for the lifetime of the bridge and indexes directly into the
/// cluster arena.
pub struct Target {
    adapter: Arc<AdvDebugUnit>,
    clusters: Vec<Cluster>,
    /// thread_id to (cluster index, core index).
    threads: Vec<(usize, usize)>,
}

impl Target {
    pub fn new(adapter: Arc<AdvDebugUnit>, config: &Config) -> Result<Target, CableError> {
        let mut clusters = Vec::new();
        let mut threads = Vec::new();
        let mut next_thread = 0usize;

        if let Some(fc) = &config.soc.fc {
            let core = Core::new(
                adapter.clone(),
                fc.cluster_id,
                0,
                next_thread,
                fc.dbg_unit_base,
            );
            threads.push((clusters.len(), 0));
            next_thread += 1;
            clusters.push(Cluster::new(
                adapter.clone(),
                fc.cluster_id,
                PowerCtrl::Always,
                HaltCtrl::Single,
                fc.icache_base.map(|base| CacheCtrl::Fc { base }),
                vec![core],
            ));
        }

        if let Some(cluster_config) = &config.soc.cluster {
            for i in 0..cluster_config.nb_cluster {
                let base = cluster_config.base + CLUSTER_STRIDE * i;
                let mut cores = Vec::new();
                for pe in 0..cluster_config.nb_pe {
                    let dbg_unit =
                        base + CLUSTER_DBG_UNIT_OFFSET + pe * CORE_DBG_UNIT_STRIDE;
                    cores.push(Core::new(adapter.clone(), i, pe, next_thread, dbg_unit));
                    threads.push((clusters.len(), pe as usize));
                    next_thread += 1;
                }
                let power = match &cluster_config.power_bypass {
                    Some(bypass) => PowerCtrl::Bypass {
                        reg_addr: bypass.reg_addr,
                        bit: bypass.bit,
                    },
                    None => PowerCtrl::Always,
                };
                clusters.push(Cluster::new(
                    adapter.clone(),
                    i,
                    power,
                    HaltCtrl::XTrigger {
                        base: base + CLUSTER_CTRL_OFFSET,
                        current_mask: 0,
                    },
                    Some(CacheCtrl::Cluster {
                        base: base + CLUSTER_CACHE_OFFSET,
                    }),
                    cores,
                ));
            }
        }

        let mut target = Target {
            adapter,
            clusters,
            threads,
        };
        for cluster in &mut target.clusters {
            cluster.init()?;
        }
        debug!(threads = target.threads.len(), "target initialized");
        Ok(target)
    }

    pub fn nb_threads(&self) -> usize {
        self.threads.len()
    }

    pub fn thread_ids(&self) -> impl Iterator<Item = usize> + '_ {
        0..self.threads.len()
    }

    pub fn core(&self, thread_id: usize) -> Option<&Core> {
        let (cluster, core) = *self.threads.get(thread_id)?;
        Some(&self.clusters[cluster].cores[core])
    }

    pub fn core_mut(&mut self, thread_id: usize) -> Option<&mut Core> {
        let (cluster, core) = *self.threads.get(thread_id)?;
        Some(&mut self.clusters[cluster].cores[core])
    }

    /// Halts every cluster.
    pub fn halt(&mut self, breakpoints: &Breakpoints) -> Result<(), CableError> {
        for cluster in &mut self.clusters {
            cluster.halt(breakpoints)?;
        }
        Ok(())
    }

    pub fn clear_resume_all(&mut self) {
        for cluster in &mut self.clusters {
            for core in &mut cluster.cores {
                core.clear_resume();
            }
        }
    }

    pub fn prepare_resume_all(&mut self, step: bool) {
        for cluster in &mut self.clusters {
            for core in &mut cluster.cores {
                core.prepare_resume(step);
            }
        }
    }

    /// Releases every prepared core. If any breakpoint moved since the
    /// last resume, caches and prefetch buffers are flushed first so stale
    /// instructions cannot retire.
    pub fn resume_all(&mut self, breakpoints: &mut Breakpoints) -> Result<(), CableError> {
        if breakpoints.have_changed() {
            self.flush_all()?;
            breakpoints.clear_history();
        }
        for cluster in &mut self.clusters {
            cluster.resume()?;
        }
        Ok(())
    }

    pub fn flush_all(&mut self) -> Result<(), CableError> {
        for cluster in &mut self.clusters {
            cluster.flush()?;
        }
        Ok(())
    }

    pub fn update_power(&mut self) -> Result<(), CableError> {
        for cluster in &mut self.clusters {
            cluster.update_power()?;
        }
        Ok(())
    }

    /// Refreshes power state and polls the cores that took part in the
    /// last resume. A breakpoint hit wins over any other cause.
    pub fn check_stopped(&mut self) -> Result<Option<StoppedCore>, CableError> {
        let mut found: Option<StoppedCore> = None;
        for cluster in &mut self.clusters {
            cluster.update_power()?;
            if !cluster.is_on() {
                continue;
            }
            if let Some((thread_id, cause)) = cluster.check_stopped()? {
                let stopped = StoppedCore { thread_id, cause };
                if cause & regs::EXC_CAUSE_MASK == regs::EXC_CAUSE_BREAKPOINT
                    && !regs::cause_is_interrupt(cause)
                {
                    return Ok(Some(stopped));
                }
                if found.is_none() {
                    found = Some(stopped);
                }
            }
        }
        Ok(found)
    }

    /// Re-reads power and core state after an external target restart.
    pub fn reinitialize(&mut self) -> Result<(), CableError> {
        debug!("reinitializing target");
        for cluster in &mut self.clusters {
            cluster.init()?;
        }
        Ok(())
    }

    pub fn mem_read(&self, addr: u32, buffer: &mut [u8]) -> Result<(), CableError> {
        self.adapter.read(addr, buffer)
    }

    pub fn mem_write(&self, addr: u32, data: &[u8]) -> Result<(), CableError> {
        self.adapter.write(addr, data)
    }
}
