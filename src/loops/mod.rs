//! Loop manager and its cooperative pollers.
//!
//! The manager owns an ordered list of loopers and one repeating timer on
//! the event loop. Each tick it resolves the target-side debug structure,
//! checks for program exit and then gives every non-paused looper one slice
//! of work. A looper that needs its own cadence pauses itself and clears
//! its pause flag from a one-shot timer.

pub mod ioloop;
pub mod reqloop;
pub mod shared;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info};

pub use ioloop::Ioloop;
pub use reqloop::Reqloop;

use crate::cable::{AdvDebugUnit, CableError};
use crate::config::LoopConfig;
use crate::event_loop::{EventLoop, TimerHandle};
use shared::debug_struct;

/// What a looper wants after one slice of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LooperStatus {
    Continue,
    /// Skip this looper until it clears its own pause flag.
    Pause,
    /// Remove this looper.
    Stop,
    /// Tear down every looper.
    StopAll,
}

/// Context handed to loopers on every call.
pub struct LoopContext {
    pub adapter: Arc<AdvDebugUnit>,
    pub event_loop: EventLoop,
    /// The looper's own pause flag, cleared to resume scheduling.
    pub pause: Arc<AtomicBool>,
    /// Address of the debug structure on the target.
    pub debug_struct: u32,
}

impl LoopContext {
    /// Bus access that surfaces cable errors for StopAll translation.
    pub fn read_u32(&self, offset: u32) -> Result<u32, CableError> {
        self.adapter.read_u32(self.debug_struct + offset)
    }

    pub fn write_u32(&self, offset: u32, value: u32) -> Result<(), CableError> {
        self.adapter.write_u32(self.debug_struct + offset, value)
    }
}

/// A cooperative polling task driven by the manager.
pub trait Looper: Send {
    /// Called once when the debug structure becomes available.
    fn register_proc(&mut self, ctx: &LoopContext) -> Result<LooperStatus, CableError>;
    /// Called on every manager tick.
    fn loop_proc(&mut self, ctx: &LoopContext) -> Result<LooperStatus, CableError>;
}

struct LooperSlot {
    looper: Box<dyn Looper>,
    pause: Arc<AtomicBool>,
    registered: bool,
}

pub type ExitHook = Box<dyn FnMut(i32) + Send>;

struct ManagerState {
    loopers: Vec<LooperSlot>,
    exit_hooks: Vec<ExitHook>,
    debug_struct_addr: u32,
    check_available: bool,
    fast: Duration,
    slow: Duration,
    current: Option<Duration>,
    stopped: bool,
    exit_status: Option<i32>,
}

struct ManagerInner {
    adapter: Arc<AdvDebugUnit>,
    el: EventLoop,
    state: Mutex<ManagerState>,
    timer: Mutex<Option<TimerHandle>>,
}

/// Drives the loopers from a single repeating event-loop timer.
#[derive(Clone)]
pub struct LoopManager {
    inner: Arc<ManagerInner>,
}

impl LoopManager {
    pub fn new(el: &EventLoop, adapter: Arc<AdvDebugUnit>, config: &LoopConfig) -> LoopManager {
        let manager = LoopManager {
            inner: Arc::new(ManagerInner {
                adapter,
                el: el.clone(),
                state: Mutex::new(ManagerState {
                    loopers: Vec::new(),
                    exit_hooks: Vec::new(),
                    debug_struct_addr: config.debug_struct_addr,
                    check_available: config.check_available,
                    fast: Duration::from_micros(config.fast_usecs),
                    slow: Duration::from_micros(config.slow_usecs),
                    current: None,
                    stopped: true,
                    exit_status: None,
                }),
                timer: Mutex::new(None),
            }),
        };

        let tick_inner = manager.inner.clone();
        let timer = el.timer(Box::new(move || ManagerInner::tick(&tick_inner)));
        *manager.inner.timer.lock() = Some(timer);
        manager
    }

    pub fn set_debug_struct_addr(&self, addr: u32) {
        self.inner.state.lock().debug_struct_addr = addr;
    }

    /// Observer run when the target reports its exit status.
    pub fn on_exit(&self, hook: ExitHook) {
        self.inner.state.lock().exit_hooks.push(hook);
    }

    /// Exit status seen so far, if the program finished.
    pub fn exit_status(&self) -> Option<i32> {
        self.inner.state.lock().exit_status
    }

    pub fn add_looper(&self, looper: Box<dyn Looper>) {
        let mut state = self.inner.state.lock();
        state.loopers.push(LooperSlot {
            looper,
            pause: Arc::new(AtomicBool::new(false)),
            registered: false,
        });
    }

    pub fn clear_loopers(&self) {
        self.stop();
        self.inner.state.lock().loopers.clear();
    }

    pub fn start(&self, fast: bool) {
        debug!("loop manager started");
        {
            let mut state = self.inner.state.lock();
            state.stopped = false;
            state.current = Some(if fast { state.fast } else { state.slow });
        }
        self.apply_timer();
    }

    pub fn stop(&self) {
        debug!("loop manager stopped");
        {
            let mut state = self.inner.state.lock();
            state.stopped = true;
            state.current = None;
        }
        self.apply_timer();
    }

    /// Switches between the fast and slow polling cadence.
    pub fn set_loop_speed(&self, fast: bool) {
        {
            let mut state = self.inner.state.lock();
            if state.stopped {
                return;
            }
            state.current = Some(if fast { state.fast } else { state.slow });
        }
        self.apply_timer();
    }

    fn apply_timer(&self) {
        let current = self.inner.state.lock().current;
        if let Some(timer) = self.inner.timer.lock().as_ref() {
            timer.set_timeout(current);
        }
    }
}

impl ManagerInner {
    /// One manager tick. Runs on the event-loop thread.
    fn tick(inner: &Arc<ManagerInner>) -> Option<Duration> {
        match Self::try_tick(inner) {
            Ok(next) => next,
            Err(err) => {
                error!(%err, "loop manager cable error, stopping all loopers");
                let mut state = inner.state.lock();
                state.loopers.clear();
                state.stopped = true;
                state.current = None;
                None
            }
        }
    }

    fn try_tick(inner: &Arc<ManagerInner>) -> Result<Option<Duration>, CableError> {
        let (addr, check_available, current) = {
            let state = inner.state.lock();
            if state.stopped {
                return Ok(None);
            }
            (
                state.debug_struct_addr,
                state.check_available,
                state.current,
            )
        };
        if addr == 0 {
            return Ok(current);
        }

        // The target publishes the structure address once its runtime is up.
        let debug_struct = inner.adapter.read_u32(addr)?;
        if debug_struct == 0 {
            return Ok(current);
        }

        if check_available {
            let available = inner
                .adapter
                .read_u32(debug_struct + debug_struct::TARGET_STATE)?
                != 0;
            if !available {
                return Ok(current);
            }
        }

        // Program exit beats any other work.
        let exit_value = inner
            .adapter
            .read_u32(debug_struct + debug_struct::EXIT_STATUS)?;
        if exit_value >> 31 != 0 {
            let status = ((exit_value << 1) as i32) >> 1;
            info!(status, "detected end of application");
            let mut hooks = {
                let mut state = inner.state.lock();
                state.exit_status = Some(status);
                std::mem::take(&mut state.exit_hooks)
            };
            for hook in &mut hooks {
                hook(status);
            }
            let mut state = inner.state.lock();
            state.loopers.clear();
            state.stopped = true;
            state.current = None;
            return Ok(None);
        }

        Self::run_loopers(inner, debug_struct)
    }

    fn run_loopers(
        inner: &Arc<ManagerInner>,
        debug_struct: u32,
    ) -> Result<Option<Duration>, CableError> {
        let mut index = 0;
        loop {
            // Take the looper out so its callbacks may reach the manager.
            let mut slot = {
                let mut state = inner.state.lock();
                if index >= state.loopers.len() {
                    break;
                }
                if state.loopers[index].pause.load(Ordering::SeqCst) {
                    index += 1;
                    continue;
                }
                state.loopers.remove(index)
            };
            let ctx = LoopContext {
                adapter: inner.adapter.clone(),
                event_loop: inner.el.clone(),
                pause: slot.pause.clone(),
                debug_struct,
            };

            let status = if !slot.registered {
                slot.registered = true;
                slot.looper.register_proc(&ctx)?
            } else {
                slot.looper.loop_proc(&ctx)?
            };

            match status {
                LooperStatus::Continue => {
                    inner.state.lock().loopers.insert(index, slot);
                    index += 1;
                }
                LooperStatus::Pause => {
                    slot.pause.store(true, Ordering::SeqCst);
                    inner.state.lock().loopers.insert(index, slot);
                    index += 1;
                }
                LooperStatus::Stop => {
                    debug!("looper finished");
                }
                LooperStatus::StopAll => {
                    let mut state = inner.state.lock();
                    state.loopers.clear();
                    state.stopped = true;
                    state.current = None;
                    return Ok(None);
                }
            }
        }

        let mut state = inner.state.lock();
        if state.loopers.is_empty() {
            state.stopped = true;
            state.current = None;
            return Ok(None);
        }
        Ok(state.current)
    }
}
