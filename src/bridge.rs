//! Bridge composition root.
//!
//! Owns the event loop, the debug unit adapter, the loop manager with its
//! loopers, the GDB server and the raw request server, all built from one
//! JSON configuration string. Out-of-band host commands (start and stop of
//! the target, `qRcmd`/`qXfer` forwards) are injected as a callback table
//! by whatever embeds the bridge.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::cable::{AdvDebugUnit, Cable, JtagProxy};
use crate::config::{Config, ConfigError};
use crate::event_loop::EventLoop;
use crate::loops::reqloop::{null_framebuffer_factory, FramebufferFactory};
use crate::loops::{Ioloop, LoopManager, Reqloop};
use crate::reqserver::ReqServer;
use crate::rsp::{CommandHook, GdbServer};

#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Cable(#[from] crate::cable::CableError),
    #[error("network setup failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown cable type '{0}'")]
    UnknownCable(String),
}

/// Everything the bridge process owns.
pub struct Bridge {
    config: Config,
    event_loop: EventLoop,
    adapter: Arc<AdvDebugUnit>,
    loop_manager: LoopManager,
    gdb_server: Option<GdbServer>,
    req_server: Option<ReqServer>,
    command_hook: Option<CommandHook>,
    fb_factory: FramebufferFactory,
}

impl Bridge {
    /// Builds the bridge from a configuration string, opening the cable
    /// named there.
    pub fn from_config_str(config_str: &str) -> Result<Bridge, BridgeError> {
        let config = Config::from_json(config_str)?;
        let event_loop = EventLoop::new();
        let cable: Box<dyn Cable> = match config.cable.kind.as_str() {
            "jtag-proxy" => Box::new(JtagProxy::connect(
                &event_loop,
                &config.cable.host,
                config.cable.port,
                Duration::from_secs(5),
            )?),
            other => return Err(BridgeError::UnknownCable(other.to_owned())),
        };
        Self::with_cable(config, event_loop, cable)
    }

    /// Builds the bridge around an already opened cable.
    pub fn with_cable(
        config: Config,
        event_loop: EventLoop,
        cable: Box<dyn Cable>,
    ) -> Result<Bridge, BridgeError> {
        let force_dr32 = config.chip.name == "wolfe";
        let adapter = AdvDebugUnit::connect(cable, &config.adv_dbg_unit, force_dr32)?;
        adapter.device_select(config.cable.tap);

        let loop_manager = LoopManager::new(&event_loop, adapter.clone(), &config.loops);

        Ok(Bridge {
            config,
            event_loop,
            adapter,
            loop_manager,
            gdb_server: None,
            req_server: None,
            command_hook: None,
            fb_factory: null_framebuffer_factory(),
        })
    }

    /// Installs the host command table used for `qRcmd`/`qXfer` forwards
    /// and the `__start_target`-style bridge commands.
    pub fn set_command_hook(&mut self, hook: CommandHook) {
        self.command_hook = Some(hook);
    }

    /// Installs a rendering backend for target framebuffer requests.
    pub fn set_framebuffer_factory(&mut self, factory: FramebufferFactory) {
        self.fb_factory = factory;
    }

    pub fn event_loop(&self) -> EventLoop {
        self.event_loop.clone()
    }

    pub fn adapter(&self) -> Arc<AdvDebugUnit> {
        self.adapter.clone()
    }

    pub fn loop_manager(&self) -> LoopManager {
        self.loop_manager.clone()
    }

    pub fn gdb_server(&self) -> Option<&GdbServer> {
        self.gdb_server.as_ref()
    }

    pub fn req_server(&self) -> Option<&ReqServer> {
        self.req_server.as_ref()
    }

    /// Brings up the configured services: loopers, the RSP server and the
    /// raw request server.
    pub fn start(&mut self) -> Result<(), BridgeError> {
        self.loop_manager
            .add_looper(Box::new(Ioloop::new()));
        self.loop_manager
            .add_looper(Box::new(Reqloop::new(self.fb_factory.clone())));

        let gdb_server = GdbServer::new(
            self.adapter.clone(),
            &self.config,
            self.command_hook.clone(),
        )?;
        // The loop manager pauses whenever the debugger halts the target
        // and resumes just before the target does.
        let manager = self.loop_manager.clone();
        let on_halt = Box::new(move || manager.stop());
        let manager = self.loop_manager.clone();
        let on_resume = Box::new(move || manager.start(true));
        gdb_server.set_run_hooks(on_halt, on_resume);
        gdb_server.open(&self.event_loop)?;
        self.gdb_server = Some(gdb_server);

        if let Some(reqserver_config) = &self.config.reqserver {
            let server = ReqServer::new(
                &self.event_loop,
                self.adapter.clone(),
                reqserver_config.port,
            );
            server.start()?;
            self.req_server = Some(server);
        }

        info!("bridge started");
        Ok(())
    }

    /// Starts polling the target-side structures.
    pub fn start_loops(&self) {
        self.loop_manager.start(true);
    }

    /// Blocks the calling thread serving everything until
    /// [`Bridge::shutdown`] is invoked from elsewhere.
    pub fn run(&self) {
        self.event_loop.run();
    }

    pub fn shutdown(&mut self) {
        info!("bridge shutting down");
        if let Some(gdb_server) = &self.gdb_server {
            gdb_server.close(true);
        }
        if let Some(req_server) = &self.req_server {
            req_server.stop();
        }
        self.loop_manager.clear_loopers();
        if let Err(err) = self.adapter.flush() {
            warn!(%err, "cable flush on shutdown failed");
        }
        self.event_loop.stop();
    }
}
