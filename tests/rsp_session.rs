//! End-to-end RSP scenarios against a simulated target.
//!
//! A real `GdbServer` listens on an ephemeral port; the test plays the
//! debugger over plain TCP while poking the simulated debug registers the
//! way the hardware would.

mod common;

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use riscv_debug_bridge::cable::sim::{SimCable, SimDevice, SimMemory};
use riscv_debug_bridge::cable::AdvDebugUnit;
use riscv_debug_bridge::config::Config;
use riscv_debug_bridge::event_loop::EventLoop;
use riscv_debug_bridge::rsp::{CommandHook, GdbServer};

const FC_DBG: u32 = 0x1B30_0000;
const CTRL: u32 = FC_DBG;
const HIT: u32 = FC_DBG + 0x4;
const CAUSE: u32 = FC_DBG + 0xC;
const NPC: u32 = FC_DBG + 0x2000;
const PPC: u32 = FC_DBG + 0x2004;

const CLUSTER_CORE0_DBG: u32 = 0x1030_0000;

const HALTED: u32 = 1 << 16;
const CAUSE_BREAKPOINT: u32 = 0x3;
const CAUSE_DBG_HALT: u32 = 0x1F;

const EBREAK: u32 = 0x0010_0073;

struct Fixture {
    el: EventLoop,
    server: GdbServer,
    sim: SimCable,
    runner: Option<std::thread::JoinHandle<()>>,
}

impl Fixture {
    fn new(with_cluster: bool, hook: Option<CommandHook>) -> Fixture {
        common::init_tracing();
        let config_json = if with_cluster {
            r#"{
                "chip": { "name": "gap" },
                "gdb_server": { "port": 0 },
                "soc": {
                    "fc": { "cluster_id": 32, "dbg_unit_base": 456130560 },
                    "cluster": { "nb_cluster": 1, "nb_pe": 1, "base": 268435456 }
                }
            }"#
        } else {
            r#"{
                "chip": { "name": "gap" },
                "gdb_server": { "port": 0 },
                "soc": { "fc": { "cluster_id": 32, "dbg_unit_base": 456130560 } }
            }"#
        };
        let config = Config::from_json(config_json).unwrap();

        let cable = SimCable::new(vec![SimDevice::new(0x1234_5677)]);
        let sim = cable.clone();
        // The fabric controller boots stopped on an ebreak.
        sim.memory().write_u32(CTRL, HALTED);
        sim.memory().write_u32(CAUSE, CAUSE_BREAKPOINT);

        let adapter =
            AdvDebugUnit::connect(Box::new(cable), &config.adv_dbg_unit, false).unwrap();
        let el = EventLoop::new();
        let server = GdbServer::new(adapter, &config, hook).unwrap();
        server.open(&el).unwrap();

        let runner_el = el.clone();
        let runner = std::thread::spawn(move || runner_el.run());
        Fixture {
            el,
            server,
            sim,
            runner: Some(runner),
        }
    }

    fn memory(&self) -> SimMemory {
        self.sim.memory()
    }

    fn connect(&self) -> GdbClient {
        let stream = TcpStream::connect(("127.0.0.1", self.server.port())).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        GdbClient { stream }
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.server.close(true);
        self.el.stop();
        if let Some(runner) = self.runner.take() {
            runner.join().unwrap();
        }
    }
}

struct GdbClient {
    stream: TcpStream,
}

impl GdbClient {
    fn frame(payload: &str) -> Vec<u8> {
        let checksum = payload
            .bytes()
            .fold(0u32, |acc, b| (acc + u32::from(b)) % 256);
        format!("${payload}#{checksum:02x}").into_bytes()
    }

    fn byte(&mut self) -> u8 {
        let mut byte = [0u8; 1];
        self.stream.read_exact(&mut byte).unwrap();
        byte[0]
    }

    /// Sends one command and waits for the server's ack.
    fn send(&mut self, payload: &str) {
        self.stream.write_all(&Self::frame(payload)).unwrap();
        let ack = self.byte();
        assert_eq!(ack, b'+', "expected ack for {payload}");
    }

    /// Reads one reply frame, acknowledges it and returns the payload.
    fn recv(&mut self) -> String {
        loop {
            let byte = self.byte();
            if byte == b'$' {
                break;
            }
        }
        let mut payload = Vec::new();
        loop {
            let byte = self.byte();
            if byte == b'#' {
                break;
            }
            payload.push(byte);
        }
        // Consume the checksum and acknowledge.
        let _ = self.byte();
        let _ = self.byte();
        self.stream.write_all(b"+").unwrap();
        String::from_utf8(payload).unwrap()
    }

    fn roundtrip(&mut self, payload: &str) -> String {
        self.send(payload);
        self.recv()
    }

    fn send_break(&mut self) {
        self.stream.write_all(&[0x03]).unwrap();
    }
}

#[test]
fn halt_reason_and_registers_on_ebreak() {
    let fixture = Fixture::new(false, None);
    let mut gdb = fixture.connect();

    // Stopped on a breakpoint: signal 5.
    assert_eq!(gdb.roundtrip("?"), "S05");

    // 32 GPRs and the PC, eight nibbles each.
    let regs = gdb.roundtrip("g");
    assert_eq!(regs.len(), 33 * 8);

    // A single thread is reported, numbered from one.
    assert_eq!(gdb.roundtrip("qfThreadInfo"), "m1");
    assert_eq!(gdb.roundtrip("qsThreadInfo"), "l");
    assert_eq!(gdb.roundtrip("qC"), "QC1");
    assert_eq!(gdb.roundtrip("qAttached"), "1");

    let supported = gdb.roundtrip("qSupported:swbreak+");
    assert!(supported.starts_with("PacketSize=100"), "{supported}");
}

#[test]
fn register_and_memory_access() {
    let fixture = Fixture::new(false, None);
    let mut gdb = fixture.connect();

    // Seed x5 on the "hardware" side.
    fixture.memory().write_u32(FC_DBG + 0x400 + 5 * 4, 0xdead_beef);
    assert_eq!(gdb.roundtrip("p5"), "efbeadde");
    // MISA reports the configured constant.
    assert_eq!(gdb.roundtrip("p342"), "00000004");

    // Run one resume/stop cycle with a staged PPC: the reported PC follows
    // the previous program counter on a breakpoint stop.
    gdb.send("c");
    std::thread::sleep(Duration::from_millis(150));
    fixture.memory().write_u32(PPC, 0x1c00_8080);
    fixture.memory().write_u32(CAUSE, CAUSE_BREAKPOINT);
    fixture.memory().write_u32(CTRL, HALTED);
    assert_eq!(gdb.recv(), "T05thread:1;");
    assert_eq!(gdb.roundtrip("p20"), "8080001c");

    // Writing a register goes through to the debug bank.
    assert_eq!(gdb.roundtrip("P5=0d0d0d0d"), "OK");
    assert_eq!(fixture.memory().read_u32(FC_DBG + 0x400 + 5 * 4), 0x0d0d_0d0d);

    // Memory write then read through m/M.
    assert_eq!(gdb.roundtrip("M2000,4:0d00008a"), "OK");
    assert_eq!(gdb.roundtrip("m2000,4"), "0d00008a");
    assert_eq!(fixture.memory().read_u32(0x2000), 0x8a00_000d);
}

#[test]
fn breakpoint_insert_continue_hit() {
    let fixture = Fixture::new(false, None);
    let mut gdb = fixture.connect();

    // A nop lives at the breakpoint address.
    fixture.memory().write_u32(0x1000, 0x0000_0013);

    assert_eq!(gdb.roundtrip("Z0,1000,4"), "OK");
    // Memory now holds the trap instruction.
    assert_eq!(fixture.memory().read_u32(0x1000), EBREAK);

    // Continue; no reply until the core stops.
    gdb.send("c");
    std::thread::sleep(Duration::from_millis(150));
    // The core released: halt bit cleared by the resume.
    assert_eq!(fixture.memory().read_u32(CTRL) & HALTED, 0);

    // The simulated core fetches from 0x1000 and traps.
    fixture.memory().write_u32(PPC, 0x1000);
    fixture.memory().write_u32(NPC, 0x1004);
    fixture.memory().write_u32(CAUSE, CAUSE_BREAKPOINT);
    fixture.memory().write_u32(HIT, 0);
    fixture.memory().write_u32(CTRL, HALTED);

    assert_eq!(gdb.recv(), "T05thread:1;");
    // The halt path rewound NPC onto the breakpoint.
    assert_eq!(fixture.memory().read_u32(NPC), 0x1000);

    // Removing the breakpoint restores the original instruction.
    assert_eq!(gdb.roundtrip("z0,1000,4"), "OK");
    assert_eq!(fixture.memory().read_u32(0x1000), 0x0000_0013);
}

#[test]
fn async_break_halts_the_target() {
    let fixture = Fixture::new(false, None);
    let mut gdb = fixture.connect();

    gdb.send("c");
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(fixture.memory().read_u32(CTRL) & HALTED, 0);

    // The running core reports a debug-request stop when interrupted.
    fixture.memory().write_u32(CAUSE, CAUSE_DBG_HALT);
    gdb.send_break();

    // The bridge wrote the halt bit; reflect it as the hardware would and
    // expect the stop packet (signal 17).
    let reply = gdb.recv();
    assert_eq!(reply, "T11thread:1;");
    assert_eq!(fixture.memory().read_u32(CTRL) & HALTED, HALTED);
}

#[test]
fn vcont_step_and_continue() {
    let fixture = Fixture::new(true, None);
    let mut gdb = fixture.connect();

    assert_eq!(gdb.roundtrip("vCont?"), "vCont;c;s;C;S");
    assert_eq!(gdb.roundtrip("qfThreadInfo"), "m1,2");

    // The cross-trigger release clears the halt state in hardware; the
    // passive simulation needs the cluster core reflected as running
    // before the mixed resume is issued.
    fixture.memory().write_u32(CLUSTER_CORE0_DBG, 0);
    fixture.memory().write_u32(CLUSTER_CORE0_DBG + 0xC, 0);

    // Thread 1 (the FC) steps, thread 2 continues.
    gdb.send("vCont;s:1;c:2");
    std::thread::sleep(Duration::from_millis(150));

    // The FC was released in single-step mode.
    assert_eq!(fixture.memory().read_u32(CTRL), 0x1);
    // The cluster resumed through the cross-trigger resume register.
    assert_eq!(fixture.memory().read_u32(0x1020_0028), 0x1);

    // The FC retires its single step.
    fixture.memory().write_u32(HIT, 0x1);
    fixture.memory().write_u32(CTRL, HALTED | 0x1);

    let reply = gdb.recv();
    assert_eq!(reply, "T05thread:1;");
}

#[test]
fn cable_error_yields_e01_and_session_survives() {
    let fixture = Fixture::new(false, None);
    let mut gdb = fixture.connect();

    fixture.memory().write_u32(0x3000, 0x1234_5678);
    fixture.sim.fail_next_ops(1);
    assert_eq!(gdb.roundtrip("m3000,4"), "E01");
    // The next access goes through untouched.
    assert_eq!(gdb.roundtrip("m3000,4"), "78563412");
}

#[test]
fn detach_clears_breakpoints_and_resumes() {
    let fixture = Fixture::new(false, None);
    let mut gdb = fixture.connect();

    fixture.memory().write_u32(0x1000, 0x0000_0013);
    assert_eq!(gdb.roundtrip("Z0,1000,4"), "OK");
    assert_eq!(fixture.memory().read_u32(0x1000), EBREAK);

    assert_eq!(gdb.roundtrip("D"), "OK");
    drop(gdb);

    // Give the worker a moment to clean up and resume the target.
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(fixture.memory().read_u32(0x1000), 0x0000_0013);
    assert_eq!(fixture.memory().read_u32(CTRL) & HALTED, 0);

    // A fresh debugger is welcome afterwards.
    fixture.memory().write_u32(CTRL, HALTED);
    let mut gdb = fixture.connect();
    assert_eq!(gdb.roundtrip("?"), "S05");
}

#[test]
fn unknown_and_query_packets() {
    let hook: CommandHook = Arc::new(|cmd: &str| {
        cmd.starts_with("qRcmd").then(|| "4f4b".to_owned())
    });
    let fixture = Fixture::new(false, Some(hook));
    let mut gdb = fixture.connect();

    // Unknown packets get an empty reply and the session stays up.
    assert_eq!(gdb.roundtrip("@bogus"), "");
    assert_eq!(gdb.roundtrip("qTStatus"), "");
    assert_eq!(gdb.roundtrip("qOffsets"), "Text=0;Data=0;Bss=0");
    assert_eq!(gdb.roundtrip("qSymbol::"), "OK");
    // Monitor commands reach the injected hook.
    assert_eq!(gdb.roundtrip("qRcmd,7265736574"), "4f4b");
    assert_eq!(gdb.roundtrip("T1"), "OK");
    // Thread names mention cluster and core.
    let info = gdb.roundtrip("qThreadExtraInfo,1");
    let name: String = (0..info.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&info[i..i + 2], 16).unwrap() as char)
        .collect();
    assert_eq!(name, "Cluster 32 - Core 0");
}
