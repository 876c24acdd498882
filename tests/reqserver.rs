//! Raw memory request server round-trips over localhost TCP.

mod common;

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use anyhow::Result;

use riscv_debug_bridge::cable::sim::{SimCable, SimDevice};
use riscv_debug_bridge::cable::AdvDebugUnit;
use riscv_debug_bridge::config::AdvDbgConfig;
use riscv_debug_bridge::event_loop::EventLoop;
use riscv_debug_bridge::reqserver::{
    ReqServer, REQ_READMEM, REQ_WRITEMEM, RSP_ERROR, RSP_READMEM, RSP_WRITEMEM,
};

struct Fixture {
    el: EventLoop,
    server: ReqServer,
    sim: SimCable,
    runner: Option<std::thread::JoinHandle<()>>,
}

impl Fixture {
    fn new() -> Result<Fixture> {
        common::init_tracing();
        let cable = SimCable::new(vec![SimDevice::new(0x1234_5677)]);
        let sim = cable.clone();
        let adapter = AdvDebugUnit::connect(Box::new(cable), &AdvDbgConfig::default(), false)?;
        let el = EventLoop::new();
        let server = ReqServer::new(&el, adapter, 0);
        server.start()?;
        let runner_el = el.clone();
        let runner = std::thread::spawn(move || runner_el.run());
        Ok(Fixture {
            el,
            server,
            sim,
            runner: Some(runner),
        })
    }

    fn connect(&self) -> Result<TcpStream> {
        let stream = TcpStream::connect(("127.0.0.1", self.server.port()))?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;
        Ok(stream)
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.server.stop();
        self.el.stop();
        if let Some(runner) = self.runner.take() {
            runner.join().unwrap();
        }
    }
}

fn request(trans_id: u32, kind: u32, addr: u32, len: i32) -> Vec<u8> {
    let mut raw = Vec::with_capacity(16);
    raw.extend_from_slice(&trans_id.to_le_bytes());
    raw.extend_from_slice(&kind.to_le_bytes());
    raw.extend_from_slice(&addr.to_le_bytes());
    raw.extend_from_slice(&len.to_le_bytes());
    raw
}

fn read_rsp(stream: &mut TcpStream) -> Result<(u32, u32)> {
    let mut raw = [0u8; 8];
    stream.read_exact(&mut raw)?;
    Ok((
        u32::from_le_bytes(raw[0..4].try_into()?),
        u32::from_le_bytes(raw[4..8].try_into()?),
    ))
}

#[test]
fn read_memory_roundtrip() -> Result<()> {
    let fixture = Fixture::new()?;
    let mut stream = fixture.connect()?;

    fixture.sim.memory().write(0x1000, b"12345678");

    stream.write_all(&request(7, REQ_READMEM, 0x1000, 8))?;

    let (trans_id, kind) = read_rsp(&mut stream)?;
    assert_eq!(trans_id, 7);
    assert_eq!(kind, RSP_READMEM);

    let mut len = [0u8; 4];
    stream.read_exact(&mut len)?;
    assert_eq!(u32::from_le_bytes(len), 8);

    let mut data = [0u8; 8];
    stream.read_exact(&mut data)?;
    assert_eq!(&data, b"12345678");
    Ok(())
}

#[test]
fn write_memory_roundtrip() -> Result<()> {
    let fixture = Fixture::new()?;
    let mut stream = fixture.connect()?;

    let mut frame = request(9, REQ_WRITEMEM, 0x2000, 6);
    frame.extend_from_slice(b"abcdef");
    stream.write_all(&frame)?;

    let (trans_id, kind) = read_rsp(&mut stream)?;
    assert_eq!(trans_id, 9);
    assert_eq!(kind, RSP_WRITEMEM);

    let mut back = [0u8; 6];
    fixture.sim.memory().read(0x2000, &mut back);
    assert_eq!(&back, b"abcdef");
    Ok(())
}

#[test]
fn consecutive_transactions_share_the_connection() -> Result<()> {
    let fixture = Fixture::new()?;
    let mut stream = fixture.connect()?;

    for (i, value) in [0xAAu8, 0xBB, 0xCC].iter().enumerate() {
        let trans_id = 100 + i as u32;
        let mut frame = request(trans_id, REQ_WRITEMEM, 0x3000 + i as u32, 1);
        frame.push(*value);
        stream.write_all(&frame)?;
        let (id, kind) = read_rsp(&mut stream)?;
        assert_eq!(id, trans_id);
        assert_eq!(kind, RSP_WRITEMEM);
    }

    let mut back = [0u8; 3];
    fixture.sim.memory().read(0x3000, &mut back);
    assert_eq!(back, [0xAA, 0xBB, 0xCC]);
    Ok(())
}

#[test]
fn malformed_request_gets_an_error_frame() -> Result<()> {
    let fixture = Fixture::new()?;
    let mut stream = fixture.connect()?;

    // Zero length is invalid.
    stream.write_all(&request(3, REQ_READMEM, 0x1000, 0))?;
    let (trans_id, kind) = read_rsp(&mut stream)?;
    assert_eq!(trans_id, 3);
    assert_eq!(kind, RSP_ERROR);
    Ok(())
}

#[test]
fn second_client_is_refused_until_the_first_leaves() -> Result<()> {
    let fixture = Fixture::new()?;
    let mut first = fixture.connect()?;

    // The second connection is shut down immediately.
    let mut second = fixture.connect()?;
    let mut buf = [0u8; 1];
    assert_eq!(second.read(&mut buf)?, 0);

    // The first client still works.
    let mut frame = request(1, REQ_WRITEMEM, 0x4000, 1);
    frame.push(0x55);
    first.write_all(&frame)?;
    let (_, kind) = read_rsp(&mut first)?;
    assert_eq!(kind, RSP_WRITEMEM);
    Ok(())
}
