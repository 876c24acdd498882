//! Printf forwarding looper.
//!
//! The target accumulates characters in a small buffer and publishes the
//! pending count. Each tick drains one batch into the host's output; if
//! more shows up while draining, the looper pauses itself and switches to a
//! dedicated fast timer until the target's buffer runs empty.

use std::io::Write;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use super::shared::debug_struct;
use super::{LoopContext, Looper, LooperStatus};
use crate::cable::CableError;

/// Where the forwarded characters go. Shared so the fast-path timer can
/// keep writing after the looper returned.
pub type OutputSink = Arc<Mutex<Box<dyn Write + Send>>>;

pub struct Ioloop {
    sink: OutputSink,
    /// Pause between fast-path batches.
    printing_pause: Duration,
}

impl Ioloop {
    pub fn new() -> Ioloop {
        Ioloop::with_sink(Arc::new(Mutex::new(Box::new(std::io::stdout()))))
    }

    pub fn with_sink(sink: OutputSink) -> Ioloop {
        Ioloop {
            sink,
            printing_pause: Duration::ZERO,
        }
    }

    /// Reads the pending byte count.
    fn print_len(ctx: &LoopContext) -> Result<u32, CableError> {
        ctx.read_u32(debug_struct::PENDING_PUTCHAR)
    }

    /// Drains one batch: fetch the bytes, hand the buffer back to the
    /// target, emit on the host.
    fn print_one(sink: &OutputSink, ctx: &LoopContext, len: u32) -> Result<(), CableError> {
        let len = (len as usize).min(debug_struct::PUTC_BUFFER_LEN);
        let mut buffer = vec![0u8; len];
        ctx.adapter
            .read(ctx.debug_struct + debug_struct::PUTC_BUFFER, &mut buffer)?;
        ctx.write_u32(debug_struct::PENDING_PUTCHAR, 0)?;
        let mut sink = sink.lock();
        let _ = sink.write_all(&buffer);
        let _ = sink.flush();
        Ok(())
    }

    /// Self-rescheduling fast path run from its own one-shot timer while
    /// the target keeps producing output.
    fn spawn_print_loop(&self, ctx: &LoopContext) {
        let sink = self.sink.clone();
        let pause = ctx.pause.clone();
        let tick_ctx = LoopContext {
            adapter: ctx.adapter.clone(),
            event_loop: ctx.event_loop.clone(),
            pause: ctx.pause.clone(),
            debug_struct: ctx.debug_struct,
        };
        let printing_pause = self.printing_pause;
        ctx.event_loop.spawn_timer(
            Duration::ZERO,
            Box::new(move || {
                let drained = (|| -> Result<bool, CableError> {
                    let len = Ioloop::print_len(&tick_ctx)?;
                    if len == 0 {
                        return Ok(true);
                    }
                    Ioloop::print_one(&sink, &tick_ctx, len)?;
                    Ok(false)
                })();
                match drained {
                    Ok(true) => {
                        // Buffer empty: hand scheduling back to the manager.
                        pause.store(false, Ordering::SeqCst);
                        None
                    }
                    Ok(false) => Some(printing_pause),
                    Err(_) => {
                        pause.store(false, Ordering::SeqCst);
                        None
                    }
                }
            }),
        );
    }
}

impl Default for Ioloop {
    fn default() -> Self {
        Self::new()
    }
}

impl Looper for Ioloop {
    fn register_proc(&mut self, ctx: &LoopContext) -> Result<LooperStatus, CableError> {
        // Announce that printf output is collected on this side.
        ctx.write_u32(debug_struct::USE_INTERNAL_PRINTF, 0)?;
        Ok(LooperStatus::Continue)
    }

    fn loop_proc(&mut self, ctx: &LoopContext) -> Result<LooperStatus, CableError> {
        let len = Self::print_len(ctx)?;
        if len == 0 {
            return Ok(LooperStatus::Continue);
        }
        Self::print_one(&self.sink, ctx, len)?;

        // Still producing? Switch to the dedicated fast timer.
        if Self::print_len(ctx)? > 0 {
            debug!("target keeps printing, entering fast drain");
            self.spawn_print_loop(ctx);
            Ok(LooperStatus::Pause)
        } else {
            Ok(LooperStatus::Continue)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cable::sim::{SimCable, SimDevice};
    use crate::cable::AdvDebugUnit;
    use crate::config::{AdvDbgConfig, LoopConfig};
    use crate::event_loop::EventLoop;
    use crate::loops::LoopManager;

    const DEBUG_STRUCT_PTR: u32 = 0x1000;
    const DEBUG_STRUCT: u32 = 0x2000;

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn setup() -> (LoopManager, EventLoop, SimCable, SharedSink) {
        let cable = SimCable::new(vec![SimDevice::new(0x1234_5677)]);
        let handle = cable.clone();
        let adapter =
            AdvDebugUnit::connect(Box::new(cable), &AdvDbgConfig::default(), false).unwrap();
        let el = EventLoop::new();
        let manager = LoopManager::new(
            &el,
            adapter,
            &LoopConfig {
                debug_struct_addr: DEBUG_STRUCT_PTR,
                fast_usecs: 500,
                slow_usecs: 10_000_000,
                check_available: false,
            },
        );
        handle.memory().write_u32(DEBUG_STRUCT_PTR, DEBUG_STRUCT);
        let sink = SharedSink::default();
        manager.add_looper(Box::new(Ioloop::with_sink(Arc::new(Mutex::new(Box::new(
            sink.clone(),
        ))))));
        (manager, el, handle, sink)
    }

    fn run_for(el: &EventLoop, duration: Duration) {
        let stopper = el.clone();
        let thread = std::thread::spawn(move || {
            std::thread::sleep(duration);
            stopper.stop();
        });
        el.run();
        thread.join().unwrap();
    }

    #[test]
    fn forwards_pending_output() {
        let (manager, el, sim, sink) = setup();
        sim.memory()
            .write(DEBUG_STRUCT + debug_struct::PUTC_BUFFER, b"hello\n");
        sim.memory()
            .write_u32(DEBUG_STRUCT + debug_struct::PENDING_PUTCHAR, 6);

        manager.start(true);
        run_for(&el, Duration::from_millis(50));

        assert_eq!(&*sink.0.lock(), b"hello\n");
        // The pending count was handed back to the target.
        assert_eq!(
            sim.memory()
                .read_u32(DEBUG_STRUCT + debug_struct::PENDING_PUTCHAR),
            0
        );
    }

    #[test]
    fn announces_host_side_printf() {
        let (manager, el, sim, _sink) = setup();
        sim.memory()
            .write_u32(DEBUG_STRUCT + debug_struct::USE_INTERNAL_PRINTF, 1);
        manager.start(true);
        run_for(&el, Duration::from_millis(30));
        assert_eq!(
            sim.memory()
                .read_u32(DEBUG_STRUCT + debug_struct::USE_INTERNAL_PRINTF),
            0
        );
    }
}
