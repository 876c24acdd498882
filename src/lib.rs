//! Host-side debug bridge for multi-cluster RISC-V SoCs.
//!
//! The bridge talks to the chip through an Advanced Debug Unit sitting
//! behind a JTAG cable and exposes three services on top of that single
//! transport:
//!
//! - a GDB Remote Serial Protocol server ([`rsp::GdbServer`]) giving a host
//!   debugger access to every core of every cluster,
//! - a semihosting request loop ([`loops`]) servicing file I/O, printf
//!   forwarding and program-exit requests issued by target firmware,
//! - a raw memory request server ([`reqserver::ReqServer`]) for bulk bus
//!   transactions over TCP.
//!
//! The layering is strictly bottom up: the [`event_loop`] reactor drives
//! the [`net`] sockets, the [`cable`] module turns bit shifting into a
//! `access(write, addr, buffer)` bus abstraction, the [`target`] model
//! implements halt/resume/step semantics for clusters and cores, and the
//! [`rsp`] engine maps GDB packets onto all of the above. [`bridge::Bridge`]
//! wires the pieces together from a JSON configuration string.

pub mod breakpoints;
pub mod bridge;
pub mod cable;
pub mod config;
pub mod event_loop;
pub mod loops;
pub mod net;
pub mod reqserver;
pub mod rsp;
pub mod target;

pub use bridge::Bridge;
pub use cable::{AdvDebugUnit, Cable, CableError};
pub use config::Config;
pub use event_loop::EventLoop;
pub use target::Target;
