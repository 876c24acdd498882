//! One debugger session: packet dispatch and the stop-wait loop.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::packet::{send_packet, PacketIo, Receiver, Step};
use super::parser::{parse_packet, ContAction, Packet, QueryPacket, VPacket};
use super::GdbServerInner;
use crate::cable::CableError;
use crate::net::Socket;
use crate::target::TargetSignal;

/// Polling granularity of the receive and wait loops.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// What the remote debugger told us about a capability in `qSupported`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    Supported,
    NotSupported,
    Maybe,
    Value(String),
}

/// Parses `name+;name-;name=value;name?` capability lists.
pub fn parse_capabilities(args: &str) -> HashMap<String, Capability> {
    let mut caps = HashMap::new();
    for item in args.split(';').filter(|s| !s.is_empty()) {
        if let Some((name, value)) = item.split_once('=') {
            caps.insert(name.to_owned(), Capability::Value(value.to_owned()));
        } else if let Some(name) = item.strip_suffix('+') {
            caps.insert(name.to_owned(), Capability::Supported);
        } else if let Some(name) = item.strip_suffix('-') {
            caps.insert(name.to_owned(), Capability::NotSupported);
        } else if let Some(name) = item.strip_suffix('?') {
            caps.insert(name.to_owned(), Capability::Maybe);
        }
    }
    caps
}

struct SocketIo<'a>(&'a Socket);

impl PacketIo for SocketIo<'_> {
    fn send_raw(&mut self, data: &[u8]) -> io::Result<()> {
        self.0.write_immediate(data)
    }

    fn recv_byte(&mut self, timeout: Duration) -> io::Result<Option<u8>> {
        let mut byte = [0u8; 1];
        match self.0.read_immediate(&mut byte, Some(timeout))? {
            0 => Ok(None),
            _ => Ok(Some(byte[0])),
        }
    }
}

enum Action {
    Continue,
    Disconnect,
}

/// Formats a register value the way GDB expects: hex nibbles of the
/// target's byte order.
fn reg_hex(value: u32) -> String {
    value
        .to_le_bytes()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

pub struct Session {
    server: Arc<GdbServerInner>,
    sock: Arc<Socket>,
    receiver: Receiver,
    thread_sel: usize,
    thread_init: usize,
    killed: bool,
    remote_caps: HashMap<String, Capability>,
    abort: Arc<AtomicBool>,
}

impl Session {
    pub fn new(server: Arc<GdbServerInner>, sock: Arc<Socket>, abort: Arc<AtomicBool>) -> Session {
        Session {
            server,
            sock,
            receiver: Receiver::default(),
            thread_sel: 0,
            thread_init: 0,
            killed: false,
            remote_caps: HashMap::new(),
            abort,
        }
    }

    /// Serves the debugger until it detaches, the socket dies or the
    /// server aborts the session.
    pub fn run(&mut self) {
        info!("RSP session started");
        loop {
            if self.abort.load(Ordering::SeqCst) {
                break;
            }
            let payload = match self.receive_packet() {
                Ok(Some(payload)) => payload,
                Ok(None) => continue,
                Err(err) => {
                    debug!(%err, "RSP connection lost");
                    break;
                }
            };
            let packet = parse_packet(&payload);
            match self.dispatch(packet) {
                Ok(Action::Continue) => {}
                Ok(Action::Disconnect) => break,
                Err(err) => {
                    warn!(%err, "RSP session ending on I/O error");
                    break;
                }
            }
        }
        info!("RSP session finished");
    }

    /// Whether the debugger advertised a capability in `qSupported`.
    #[allow(dead_code)]
    fn remote_capability(&self, name: &str) -> bool {
        self.remote_caps.get(name) == Some(&Capability::Supported)
    }

    /// Blocks for up to one poll interval; `Ok(None)` means try again.
    fn receive_packet(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut chunk = [0u8; 256];
        let n = self.sock.read_immediate(&mut chunk, Some(RECV_TIMEOUT))?;
        if n == 0 {
            self.receiver.check_timeout();
            return Ok(None);
        }
        for (i, &byte) in chunk[..n].iter().enumerate() {
            match self.receiver.push(byte) {
                Step::Pending => {}
                Step::Break => return Ok(Some(vec![0x03])),
                Step::Packet(payload) => {
                    // Acknowledge before replying.
                    self.sock.write_immediate(b"+")?;
                    if i + 1 < n {
                        debug!("trailing bytes after packet, dropped");
                    }
                    return Ok(Some(payload));
                }
            }
        }
        Ok(None)
    }

    fn send(&mut self, payload: &[u8]) -> io::Result<()> {
        send_packet(&mut SocketIo(&self.sock), payload)
    }

    fn send_str(&mut self, payload: &str) -> io::Result<Action> {
        self.send(payload.as_bytes())?;
        Ok(Action::Continue)
    }

    /// Replies with the handler result, mapping cable failures to `E01`.
    fn reply(&mut self, result: Result<String, CableError>) -> io::Result<Action> {
        match result {
            Ok(reply) => self.send_str(&reply),
            Err(err) => {
                error!(%err, "target access failed");
                self.send_str("E01")
            }
        }
    }

    fn dispatch(&mut self, packet: Packet) -> io::Result<Action> {
        debug!(?packet, "dispatching");
        match packet {
            Packet::Break | Packet::HaltReason => {
                let reply = self.signal_reply();
                self.reply(reply)
            }
            Packet::ReadRegisters => {
                let reply = self.regs_read();
                self.reply(reply)
            }
            Packet::ReadRegister(reg) => self.reg_read(reg),
            Packet::WriteRegister { reg, value } => self.reg_write(reg, value),
            Packet::ReadMemory { addr, length } => {
                let reply = self.mem_read(addr, length);
                self.reply(reply)
            }
            Packet::WriteMemoryHex { addr, data } | Packet::WriteMemoryBinary { addr, data } => {
                let reply = self
                    .server
                    .target
                    .lock()
                    .mem_write(addr, &data)
                    .map(|()| "OK".to_owned());
                self.reply(reply)
            }
            Packet::InsertBreakpoint { kind: 0, addr } => {
                let reply = self
                    .server
                    .breakpoints
                    .lock()
                    .insert(addr)
                    .map(|()| "OK".to_owned());
                self.reply(reply)
            }
            Packet::RemoveBreakpoint { kind: 0, addr } => {
                let reply = self
                    .server
                    .breakpoints
                    .lock()
                    .remove(addr)
                    .map(|()| "OK".to_owned());
                self.reply(reply)
            }
            // Only software breakpoints exist on this target.
            Packet::InsertBreakpoint { .. } | Packet::RemoveBreakpoint { .. } => self.send_str(""),
            Packet::SelectThread { op: _, thread_id } => self.select_thread(thread_id),
            Packet::Continue { addr } => self.cont(addr, false),
            Packet::Step { addr } => self.cont(addr, true),
            Packet::ThreadAlive(_) => self.send_str("OK"),
            Packet::ExtendedMode => self.send_str("OK"),
            Packet::Detach => {
                self.send_str("OK")?;
                Ok(Action::Disconnect)
            }
            Packet::V(v) => self.v_packet(v),
            Packet::Query(q) => self.query(q),
            Packet::Unknown(raw) => {
                warn!(
                    packet = %String::from_utf8_lossy(&raw),
                    "unknown packet"
                );
                // A known command that would not parse is an error; anything
                // else gets the standard "not supported" empty reply.
                let known_prefix = raw
                    .first()
                    .is_some_and(|b| b"pPmMXzZHcCsST".contains(b));
                self.send_str(if known_prefix { "E01" } else { "" })
            }
        }
    }

    /// `?` and asynchronous break: report the state of the selected core.
    fn signal_reply(&mut self) -> Result<String, CableError> {
        if self.killed {
            return Ok("X00".to_owned());
        }
        let mut target = self.server.target.lock();
        let signal = match target.core_mut(self.thread_sel) {
            Some(core) => core.get_signal()?,
            None => TargetSignal::None,
        };
        Ok(format!("S{:02x}", signal as u32))
    }

    fn stop_reply(&mut self, thread_id: usize) -> Result<String, CableError> {
        let signal = {
            let mut target = self.server.target.lock();
            match target.core_mut(thread_id) {
                Some(core) => core.get_signal()?,
                None => TargetSignal::None,
            }
        };
        Ok(format!("T{:02x}thread:{:x};", signal as u32, thread_id + 1))
    }

    fn regs_read(&mut self) -> Result<String, CableError> {
        let mut target = self.server.target.lock();
        let core = match target.core_mut(self.thread_sel) {
            Some(core) => core,
            None => return Ok("E01".to_owned()),
        };
        let gpr = core.gpr_read_all()?;
        let pc = core.actual_pc_read()?;
        let mut reply = String::with_capacity(33 * 8);
        for value in gpr {
            reply.push_str(&reg_hex(value));
        }
        reply.push_str(&reg_hex(pc));
        Ok(reply)
    }

    fn reg_read(&mut self, reg: u32) -> io::Result<Action> {
        const CSR_FIRST: u32 = 0x41;
        const MISA: u32 = CSR_FIRST + 0x301;
        let result = (|| -> Result<Option<u32>, CableError> {
            let mut target = self.server.target.lock();
            let core = match target.core_mut(self.thread_sel) {
                Some(core) => core,
                None => return Ok(None),
            };
            match reg {
                0..=31 => core.gpr_read(reg).map(Some),
                0x20 => core.actual_pc_read().map(Some),
                MISA => Ok(Some(self.server.misa)),
                CSR_FIRST.. => core.csr_read(reg - CSR_FIRST).map(Some),
                _ => Ok(None),
            }
        })();
        match result {
            Ok(Some(value)) => self.send_str(&reg_hex(value)),
            Ok(None) => self.send_str(""),
            Err(err) => {
                error!(%err, "register read failed");
                self.send_str("E01")
            }
        }
    }

    fn reg_write(&mut self, reg: u32, value: u32) -> io::Result<Action> {
        use crate::target::regs::DBG_NPC_REG;
        let result: Option<Result<(), CableError>> = {
            let mut target = self.server.target.lock();
            match target.core_mut(self.thread_sel) {
                Some(core) => match reg {
                    0..=31 => Some(core.gpr_write(reg, value)),
                    32 => Some(core.write(DBG_NPC_REG, value)),
                    _ => None,
                },
                None => None,
            }
        };
        match result {
            Some(Ok(())) => self.send_str("OK"),
            Some(Err(err)) => {
                error!(%err, "register write failed");
                self.send_str("E01")
            }
            None => self.send_str("E01"),
        }
    }

    fn mem_read(&mut self, addr: u32, length: u32) -> Result<String, CableError> {
        let mut data = vec![0u8; length as usize];
        self.server.target.lock().mem_read(addr, &mut data)?;
        Ok(data.iter().map(|b| format!("{b:02x}")).collect())
    }

    fn select_thread(&mut self, wire_id: i64) -> io::Result<Action> {
        if wire_id == -1 {
            // Applies to all threads.
            return self.send_str("OK");
        }
        let internal = if wire_id == 0 { 0 } else { wire_id as usize - 1 };
        let known = { self.server.target.lock().core(internal).is_some() };
        if known {
            self.thread_sel = internal;
            self.send_str("OK")
        } else {
            self.send_str("E01")
        }
    }

    /// `c`/`C`/`s`/`S`: optionally redirect NPC, then resume everything.
    fn cont(&mut self, addr: Option<u32>, step: bool) -> io::Result<Action> {
        use crate::target::regs::DBG_NPC_REG;
        if let Some(addr) = addr {
            let result = {
                let mut target = self.server.target.lock();
                match target.core_mut(self.thread_sel) {
                    Some(core) => core.read(DBG_NPC_REG).and_then(|npc| {
                        if npc != addr {
                            core.write(DBG_NPC_REG, addr)
                        } else {
                            Ok(())
                        }
                    }),
                    None => Ok(()),
                }
            };
            if let Err(err) = result {
                error!(%err, "failed to redirect npc");
                return self.send_str("E01");
            }
        }
        self.thread_sel = self.thread_init;

        if let Err(err) = self.server.resume_target(|target| {
            target.clear_resume_all();
            target.prepare_resume_all(step);
        }) {
            error!(%err, "resume failed");
            return self.send_str("E01");
        }
        self.wait_stop()
    }

    fn v_packet(&mut self, v: VPacket) -> io::Result<Action> {
        match v {
            VPacket::ContQuery => self.send_str("vCont;c;s;C;S"),
            VPacket::Cont(actions) => self.v_cont(actions),
            VPacket::Kill => {
                if let Err(err) = self.server.halt_target() {
                    error!(%err, "halt on vKill failed");
                }
                self.killed = true;
                self.send_str("OK")
            }
            VPacket::Run => self.send_str("X09;process:a410"),
            VPacket::Unknown(name) => {
                debug!(name, "unhandled v packet");
                self.send_str("")
            }
        }
    }

    fn v_cont(&mut self, actions: Vec<ContAction>) -> io::Result<Action> {
        let thread_init = self.thread_init;
        let mut selected = None;
        let result = self.server.resume_target(|target| {
            target.clear_resume_all();
            for action in &actions {
                match action.thread_id {
                    None | Some(-1) => target.prepare_resume_all(action.step),
                    Some(wire_id) => {
                        let internal = if wire_id == 0 {
                            thread_init
                        } else {
                            wire_id as usize - 1
                        };
                        selected = Some(internal);
                        match target.core_mut(internal) {
                            Some(core) => core.prepare_resume(action.step),
                            None => warn!(wire_id, "vCont names an unknown thread"),
                        }
                    }
                }
            }
        });
        if let Some(internal) = selected {
            self.thread_sel = internal;
        }
        if let Err(err) = result {
            error!(%err, "vCont resume failed");
            return self.send_str("E01");
        }
        self.wait_stop()
    }

    /// After a resume: poll the target until a core stops or the debugger
    /// sends an asynchronous break.
    fn wait_stop(&mut self) -> io::Result<Action> {
        loop {
            if self.abort.load(Ordering::SeqCst) {
                return Ok(Action::Disconnect);
            }

            let stopped = self.server.target.lock().check_stopped();
            match stopped {
                Ok(Some(stopped)) => {
                    if let Err(err) = self.server.halt_target() {
                        error!(%err, "halt after stop failed");
                    }
                    self.thread_sel = stopped.thread_id;
                    debug!(
                        thread = stopped.thread_id,
                        cause = stopped.cause,
                        "core stopped"
                    );
                    let reply = self.stop_reply(stopped.thread_id);
                    return self.reply(reply);
                }
                Ok(None) => {}
                Err(err) => {
                    error!(%err, "target poll failed");
                    return self.send_str("E01");
                }
            }

            let mut byte = [0u8; 1];
            match self.sock.read_immediate(&mut byte, Some(RECV_TIMEOUT)) {
                Ok(0) => {}
                Ok(_) => {
                    if byte[0] == 0x03 {
                        debug!("asynchronous break");
                        if let Err(err) = self.server.halt_target() {
                            error!(%err, "halt on break failed");
                        }
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn query(&mut self, q: QueryPacket) -> io::Result<Action> {
        match q {
            QueryPacket::Supported(args) => {
                self.remote_caps = parse_capabilities(&args);
                let mut reply = "PacketSize=100".to_owned();
                if !self.server.capabilities.is_empty() {
                    reply.push(';');
                    reply.push_str(&self.server.capabilities);
                }
                self.send_str(&reply)
            }
            QueryPacket::FirstThreadInfo => {
                let ids: Vec<String> = self
                    .server
                    .target
                    .lock()
                    .thread_ids()
                    .map(|tid| format!("{}", tid + 1))
                    .collect();
                self.send_str(&format!("m{}", ids.join(",")))
            }
            QueryPacket::SubsequentThreadInfo => self.send_str("l"),
            QueryPacket::ThreadExtraInfo(wire_id) => {
                let internal = if wire_id == 0 { 0 } else { wire_id as usize - 1 };
                let name = {
                    let target = self.server.target.lock();
                    match target.core(internal) {
                        Some(core) if core.is_on() => core.name(),
                        Some(core) => format!("{} (Off)", core.name()),
                        None => "Unknown Core".to_owned(),
                    }
                };
                let hex: String = name.bytes().map(|b| format!("{b:02X}")).collect();
                self.send_str(&hex)
            }
            QueryPacket::Attached => self.send_str(if self.killed { "0" } else { "1" }),
            QueryPacket::CurrentThread => self.send_str(&format!("QC{:x}", self.thread_sel + 1)),
            QueryPacket::Symbol => self.send_str("OK"),
            QueryPacket::Offsets => self.send_str("Text=0;Data=0;Bss=0"),
            QueryPacket::Forward(text) => {
                let reply = self
                    .server
                    .command_hook
                    .as_ref()
                    .and_then(|hook| hook(&text));
                match reply {
                    Some(reply) => self.send_str(&reply),
                    None => self.send_str(""),
                }
            }
            QueryPacket::Other(name) => {
                debug!(name, "unsupported query");
                self.send_str("")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_list_parses() {
        let caps = parse_capabilities("multiprocess+;swbreak+;xmlRegisters=i386;fork-events-");
        assert_eq!(caps["multiprocess"], Capability::Supported);
        assert_eq!(caps["swbreak"], Capability::Supported);
        assert_eq!(caps["xmlRegisters"], Capability::Value("i386".into()));
        assert_eq!(caps["fork-events"], Capability::NotSupported);
    }

    #[test]
    fn register_hex_is_target_byte_order() {
        assert_eq!(reg_hex(0x1c00_8080), "8080001c");
        assert_eq!(reg_hex(0), "00000000");
    }
}
