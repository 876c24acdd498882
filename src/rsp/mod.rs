//! GDB Remote Serial Protocol server.
//!
//! The listener accepts a single debugger at a time. Connecting halts the
//! target (after pausing the loop manager); each session runs on its own
//! worker thread. When the debugger detaches, breakpoints are cleared and
//! the target resumes headless.

pub mod client;
pub mod packet;
pub mod parser;

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::breakpoints::Breakpoints;
use crate::cable::{AdvDebugUnit, CableError};
use crate::config::Config;
use crate::event_loop::EventLoop;
use crate::net::{Listener, Socket};
use crate::target::Target;
use client::Session;

/// Handler for `qRcmd`/`qXfer` and the out-of-band bridge commands.
pub type CommandHook = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;
/// Notification the bridge uses to pause and resume the loop manager.
pub type RunHook = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct RunHooks {
    on_halt: Option<RunHook>,
    on_resume: Option<RunHook>,
}

struct SessionHandle {
    join: Option<JoinHandle<()>>,
    abort: Arc<AtomicBool>,
    worker: ThreadId,
}

/// State shared between the server, its listener callback and the session
/// worker thread.
pub struct GdbServerInner {
    pub(crate) target: Mutex<Target>,
    pub(crate) breakpoints: Mutex<Breakpoints>,
    pub(crate) capabilities: String,
    pub(crate) misa: u32,
    pub(crate) command_hook: Option<CommandHook>,
    run_hooks: Mutex<RunHooks>,
    session: Mutex<Option<SessionHandle>>,
}

impl GdbServerInner {
    /// Pauses the loop manager, then stops every core.
    pub(crate) fn halt_target(&self) -> Result<(), CableError> {
        if let Some(on_halt) = &self.run_hooks.lock().on_halt {
            on_halt();
        }
        let mut target = self.target.lock();
        let breakpoints = self.breakpoints.lock();
        target.halt(&breakpoints)
    }

    /// Restarts the loop manager, lets `prepare` pick the resuming cores
    /// and releases them.
    pub(crate) fn resume_target(
        &self,
        prepare: impl FnOnce(&mut Target),
    ) -> Result<(), CableError> {
        if let Some(on_resume) = &self.run_hooks.lock().on_resume {
            on_resume();
        }
        let mut target = self.target.lock();
        let mut breakpoints = self.breakpoints.lock();
        prepare(&mut target);
        target.resume_all(&mut breakpoints)
    }

    /// End-of-session cleanup: unless the server is tearing down, forget
    /// all breakpoints and let the target run free.
    fn session_finished(&self, aborted: bool) {
        self.session.lock().take();
        if aborted {
            return;
        }
        debug!("debugger detached, resuming target");
        if let Err(err) = self.breakpoints.lock().clear() {
            warn!(%err, "failed to clear breakpoints on detach");
        }
        if let Err(err) = self.resume_target(|target| {
            target.clear_resume_all();
            target.prepare_resume_all(false);
        }) {
            warn!(%err, "failed to resume target on detach");
        }
    }
}

/// The RSP server: listener plus at most one active session.
pub struct GdbServer {
    inner: Arc<GdbServerInner>,
    listener: Mutex<Option<Listener>>,
    port: u16,
}

impl GdbServer {
    pub fn new(
        adapter: Arc<AdvDebugUnit>,
        config: &Config,
        command_hook: Option<CommandHook>,
    ) -> Result<GdbServer, CableError> {
        let target = Target::new(adapter.clone(), config)?;
        let breakpoints = Breakpoints::new(adapter);
        Ok(GdbServer {
            inner: Arc::new(GdbServerInner {
                target: Mutex::new(target),
                breakpoints: Mutex::new(breakpoints),
                capabilities: config.gdb_server.capabilities.clone(),
                misa: config.chip.misa,
                command_hook,
                run_hooks: Mutex::new(RunHooks::default()),
                session: Mutex::new(None),
            }),
            listener: Mutex::new(None),
            port: config.gdb_server.port,
        })
    }

    /// Installs the loop-manager pause/resume notifications.
    pub fn set_run_hooks(&self, on_halt: RunHook, on_resume: RunHook) {
        let mut hooks = self.inner.run_hooks.lock();
        hooks.on_halt = Some(on_halt);
        hooks.on_resume = Some(on_resume);
    }

    /// Halts the target and starts listening for debuggers.
    pub fn open(&self, el: &EventLoop) -> io::Result<()> {
        self.inner
            .halt_target()
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?;

        let listener = Listener::bind(el, self.port)?;
        let inner = self.inner.clone();
        let accepting = ListenerAccess::new(&listener);
        listener.on_connected(Box::new(move |sock| {
            Self::client_connected(&inner, &accepting, sock);
        }));
        listener.start();
        info!(port = listener.port(), "RSP server opened");
        *self.listener.lock() = Some(listener);
        Ok(())
    }

    /// Actual bound port (useful when configured with port 0).
    pub fn port(&self) -> u16 {
        self.listener
            .lock()
            .as_ref()
            .map(|l| l.port())
            .unwrap_or(self.port)
    }

    fn client_connected(inner: &Arc<GdbServerInner>, accepting: &ListenerAccess, sock: Arc<Socket>) {
        // The slot stays locked until the handle is stored, so a session
        // that dies instantly cannot race its own registration.
        let mut slot = inner.session.lock();
        if slot.is_some() {
            warn!("refusing second debugger connection");
            sock.shutdown();
            return;
        }
        accepting.set(false);

        if let Err(err) = inner.halt_target() {
            error!(%err, "failed to halt target for debugger");
        }

        let abort = Arc::new(AtomicBool::new(false));
        let session_inner = inner.clone();
        let session_abort = abort.clone();
        let session_accepting = accepting.clone();
        let join = thread::Builder::new()
            .name("rsp-session".into())
            .spawn(move || {
                Session::new(session_inner.clone(), sock.clone(), session_abort.clone()).run();
                sock.shutdown();
                session_inner.session_finished(session_abort.load(Ordering::SeqCst));
                session_accepting.set(true);
            })
            .expect("spawn rsp session");

        *slot = Some(SessionHandle {
            worker: join.thread().id(),
            join: Some(join),
            abort,
        });
    }

    /// Shuts the server down.
    ///
    /// With `wait_finished` the current session worker is joined, except
    /// when called from that worker itself: then only the abort flag is
    /// raised and the worker unwinds on its own.
    pub fn close(&self, wait_finished: bool) {
        if let Some(listener) = self.listener.lock().take() {
            listener.stop();
        }
        let handle = self.inner.session.lock().take();
        if let Some(mut handle) = handle {
            handle.abort.store(true, Ordering::SeqCst);
            let is_worker = thread::current().id() == handle.worker;
            if wait_finished && !is_worker {
                if let Some(join) = handle.join.take() {
                    let _ = join.join();
                }
            }
        }
    }

    /// Re-reads target state after an external restart and re-arms the
    /// breakpoints the debugger still expects.
    pub fn refresh_target(&self) -> Result<(), CableError> {
        self.inner.target.lock().reinitialize()?;
        self.inner.target.lock().update_power()?;
        self.inner.breakpoints.lock().enable_all()
    }

    pub fn update_power(&self) -> Result<(), CableError> {
        self.inner.target.lock().update_power()
    }
}

/// Clonable view of the listener's accepting flag, shared with the
/// session worker so it can re-open the door when it finishes.
#[derive(Clone)]
struct ListenerAccess {
    flag: Arc<AtomicBool>,
}

impl ListenerAccess {
    fn new(listener: &Listener) -> ListenerAccess {
        ListenerAccess {
            flag: listener.accepting_flag(),
        }
    }

    fn set(&self, accepting: bool) {
        self.flag.store(accepting, Ordering::SeqCst);
    }
}
