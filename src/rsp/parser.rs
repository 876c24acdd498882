//! Parser for RSP packet bodies.
//!
//! Runs on the de-escaped payload of one packet and produces a [`Packet`]
//! for the dispatcher. Addresses and lengths are hex; thread ids are
//! decimal, `-1` meaning "all threads" and `0` "any thread".

use nom::{
    branch::alt,
    bytes::complete::{tag, take, take_while1},
    character::complete::char,
    combinator::{map, opt, rest, value},
    sequence::preceded,
    IResult,
};

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Packet {
    /// Byte 0x03 outside a frame.
    Break,
    /// `?`
    HaltReason,
    /// `g`
    ReadRegisters,
    /// `p n`
    ReadRegister(u32),
    /// `P n=v`, value already decoded from target byte order
    WriteRegister { reg: u32, value: u32 },
    /// `m addr,len`
    ReadMemory { addr: u32, length: u32 },
    /// `M addr,len:hex`
    WriteMemoryHex { addr: u32, data: Vec<u8> },
    /// `X addr,len:binary`
    WriteMemoryBinary { addr: u32, data: Vec<u8> },
    /// `Z type,addr,kind`
    InsertBreakpoint { kind: u32, addr: u32 },
    /// `z type,addr,kind`
    RemoveBreakpoint { kind: u32, addr: u32 },
    /// `H op tid`
    SelectThread { op: char, thread_id: i64 },
    /// `c [addr]` / `C sig[;addr]`
    Continue { addr: Option<u32> },
    /// `s [addr]` / `S sig;addr`
    Step { addr: Option<u32> },
    /// `T tid`
    ThreadAlive(i64),
    /// `D`
    Detach,
    /// `!`
    ExtendedMode,
    V(VPacket),
    Query(QueryPacket),
    Unknown(Vec<u8>),
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum VPacket {
    /// `vCont?`
    ContQuery,
    /// `vCont;action[:tid];...`
    Cont(Vec<ContAction>),
    /// `vKill`
    Kill,
    /// `vRun;file...`
    Run,
    Unknown(String),
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ContAction {
    pub step: bool,
    /// `None` applies to all threads.
    pub thread_id: Option<i64>,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum QueryPacket {
    /// `qSupported[:cap;cap...]`, raw argument list
    Supported(String),
    /// `qfThreadInfo`
    FirstThreadInfo,
    /// `qsThreadInfo`
    SubsequentThreadInfo,
    /// `qThreadExtraInfo,tid`
    ThreadExtraInfo(i64),
    /// `qAttached`
    Attached,
    /// `qC`
    CurrentThread,
    /// `qSymbol:...`
    Symbol,
    /// `qOffsets`
    Offsets,
    /// `qRcmd,...` or `qXfer:...`, forwarded whole to the command hook
    Forward(String),
    /// Any other `q` packet
    Other(String),
}

fn hex_u32(input: &[u8]) -> IResult<&[u8], u32> {
    let (input, digits) = take_while1(|c: u8| c.is_ascii_hexdigit())(input)?;
    let s = std::str::from_utf8(digits).expect("hex digits are ascii");
    match u64::from_str_radix(s, 16) {
        Ok(v) => Ok((input, v as u32)),
        Err(_) => Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::HexDigit,
        ))),
    }
}

/// A register value travels as hex nibbles of the target's little-endian
/// byte order.
fn hex_u32_target_order(input: &[u8]) -> IResult<&[u8], u32> {
    let (input, digits) = take(8usize)(input)?;
    let s = match std::str::from_utf8(digits) {
        Ok(s) => s,
        Err(_) => {
            return Err(nom::Err::Error(nom::error::Error::new(
                input,
                nom::error::ErrorKind::HexDigit,
            )))
        }
    };
    match u32::from_str_radix(s, 16) {
        Ok(raw) => Ok((input, u32::from_le_bytes(raw.to_be_bytes()))),
        Err(_) => Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::HexDigit,
        ))),
    }
}

fn dec_i64(input: &[u8]) -> IResult<&[u8], i64> {
    let (input, neg) = opt(char('-'))(input)?;
    let (input, digits) = take_while1(|c: u8| c.is_ascii_digit())(input)?;
    let s = std::str::from_utf8(digits).expect("digits are ascii");
    match s.parse::<i64>() {
        Ok(v) => Ok((input, if neg.is_some() { -v } else { v })),
        Err(_) => Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Digit,
        ))),
    }
}

fn hex_bytes(input: &[u8]) -> IResult<&[u8], Vec<u8>> {
    let (input, digits) = rest(input)?;
    if digits.len() % 2 != 0 {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::HexDigit,
        )));
    }
    let mut data = Vec::with_capacity(digits.len() / 2);
    for pair in digits.chunks_exact(2) {
        let s = match std::str::from_utf8(pair) {
            Ok(s) => s,
            Err(_) => {
                return Err(nom::Err::Error(nom::error::Error::new(
                    input,
                    nom::error::ErrorKind::HexDigit,
                )))
            }
        };
        match u8::from_str_radix(s, 16) {
            Ok(byte) => data.push(byte),
            Err(_) => {
                return Err(nom::Err::Error(nom::error::Error::new(
                    input,
                    nom::error::ErrorKind::HexDigit,
                )))
            }
        }
    }
    Ok((input, data))
}

fn halt_reason(input: &[u8]) -> IResult<&[u8], Packet> {
    value(Packet::HaltReason, char('?'))(input)
}

fn read_registers(input: &[u8]) -> IResult<&[u8], Packet> {
    value(Packet::ReadRegisters, char('g'))(input)
}

fn read_register(input: &[u8]) -> IResult<&[u8], Packet> {
    map(preceded(char('p'), hex_u32), Packet::ReadRegister)(input)
}

fn write_register(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = char('P')(input)?;
    let (input, reg) = hex_u32(input)?;
    let (input, _) = char('=')(input)?;
    let (input, value) = hex_u32_target_order(input)?;
    Ok((input, Packet::WriteRegister { reg, value }))
}

fn read_memory(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = char('m')(input)?;
    let (input, addr) = hex_u32(input)?;
    let (input, _) = char(',')(input)?;
    let (input, length) = hex_u32(input)?;
    Ok((input, Packet::ReadMemory { addr, length }))
}

fn write_memory_hex(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = char('M')(input)?;
    let (input, addr) = hex_u32(input)?;
    let (input, _) = char(',')(input)?;
    let (input, length) = hex_u32(input)?;
    let (input, _) = char(':')(input)?;
    let (input, data) = hex_bytes(input)?;
    if data.len() != length as usize {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::LengthValue,
        )));
    }
    Ok((input, Packet::WriteMemoryHex { addr, data }))
}

fn write_memory_binary(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = char('X')(input)?;
    let (input, addr) = hex_u32(input)?;
    let (input, _) = char(',')(input)?;
    let (input, length) = hex_u32(input)?;
    let (input, _) = char(':')(input)?;
    let (input, data) = take(length)(input)?;
    Ok((
        input,
        Packet::WriteMemoryBinary {
            addr,
            data: data.to_vec(),
        },
    ))
}

fn breakpoint(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, insert) = alt((value(true, char('Z')), value(false, char('z'))))(input)?;
    let (input, kind) = hex_u32(input)?;
    let (input, _) = char(',')(input)?;
    let (input, addr) = hex_u32(input)?;
    let (input, _) = char(',')(input)?;
    let (input, _size) = hex_u32(input)?;
    Ok((
        input,
        if insert {
            Packet::InsertBreakpoint { kind, addr }
        } else {
            Packet::RemoveBreakpoint { kind, addr }
        },
    ))
}

fn select_thread(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = char('H')(input)?;
    let (input, op) = alt((char('c'), char('g')))(input)?;
    let (input, thread_id) = dec_i64(input)?;
    Ok((input, Packet::SelectThread { op, thread_id }))
}

fn cont(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = char('c')(input)?;
    let (input, addr) = opt(hex_u32)(input)?;
    Ok((input, Packet::Continue { addr }))
}

fn cont_signal(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = char('C')(input)?;
    let (input, _sig) = hex_u32(input)?;
    let (input, addr) = opt(preceded(char(';'), hex_u32))(input)?;
    Ok((input, Packet::Continue { addr }))
}

fn step(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = char('s')(input)?;
    let (input, addr) = opt(hex_u32)(input)?;
    Ok((input, Packet::Step { addr }))
}

fn step_signal(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = char('S')(input)?;
    let (input, _sig) = hex_u32(input)?;
    let (input, addr) = opt(preceded(char(';'), hex_u32))(input)?;
    Ok((input, Packet::Step { addr }))
}

fn thread_alive(input: &[u8]) -> IResult<&[u8], Packet> {
    map(preceded(char('T'), dec_i64), Packet::ThreadAlive)(input)
}

fn detach(input: &[u8]) -> IResult<&[u8], Packet> {
    value(Packet::Detach, char('D'))(input)
}

fn extended_mode(input: &[u8]) -> IResult<&[u8], Packet> {
    value(Packet::ExtendedMode, char('!'))(input)
}

fn cont_action(input: &[u8]) -> IResult<&[u8], ContAction> {
    let (input, step) = alt((
        value(false, char('c')),
        map(preceded(char('C'), hex_u32), |_| false),
        value(true, char('s')),
        map(preceded(char('S'), hex_u32), |_| true),
    ))(input)?;
    let (input, thread_id) = opt(preceded(char(':'), dec_i64))(input)?;
    Ok((input, ContAction { step, thread_id }))
}

fn v_packet(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = char('v')(input)?;
    let (rest_input, packet) = alt((
        value(VPacket::ContQuery, tag("Cont?")),
        value(VPacket::Kill, tag("Kill")),
        value(VPacket::Run, tag("Run")),
        map(rest, |r: &[u8]| {
            VPacket::Unknown(String::from_utf8_lossy(r).into_owned())
        }),
    ))(input)?;
    Ok((rest_input, Packet::V(packet)))
}

fn v_cont(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = tag("vCont")(input)?;
    let (input, actions) = nom::multi::many1(preceded(char(';'), cont_action))(input)?;
    Ok((input, Packet::V(VPacket::Cont(actions))))
}

fn query(input: &[u8]) -> IResult<&[u8], Packet> {
    let (_, _) = char('q')(input)?;
    let text = String::from_utf8_lossy(input).into_owned();
    let body = &input[1..];
    let packet = if let Some(args) = text.strip_prefix("qSupported") {
        QueryPacket::Supported(args.trim_start_matches(':').to_owned())
    } else if body.starts_with(b"fThreadInfo") {
        QueryPacket::FirstThreadInfo
    } else if body.starts_with(b"sThreadInfo") {
        QueryPacket::SubsequentThreadInfo
    } else if let Some(arg) = text.strip_prefix("qThreadExtraInfo,") {
        match arg.parse::<i64>() {
            Ok(tid) => QueryPacket::ThreadExtraInfo(tid),
            Err(_) => QueryPacket::Other(text),
        }
    } else if body.starts_with(b"Attached") {
        QueryPacket::Attached
    } else if body.starts_with(b"Rcmd") || body.starts_with(b"Xfer") {
        QueryPacket::Forward(text)
    } else if body.starts_with(b"Symbol") {
        QueryPacket::Symbol
    } else if body.starts_with(b"Offsets") {
        QueryPacket::Offsets
    } else if body == b"C" {
        QueryPacket::CurrentThread
    } else {
        QueryPacket::Other(text)
    };
    Ok((&input[input.len()..], Packet::Query(packet)))
}

/// Decodes one de-escaped packet body.
pub fn parse_packet(input: &[u8]) -> Packet {
    if input == [0x03] {
        return Packet::Break;
    }
    let result = alt((
        halt_reason,
        read_registers,
        read_register,
        write_register,
        read_memory,
        write_memory_hex,
        write_memory_binary,
        breakpoint,
        select_thread,
        cont,
        cont_signal,
        step,
        step_signal,
        thread_alive,
        detach,
        extended_mode,
        v_cont,
        v_packet,
        query,
    ))(input);
    match result {
        Ok((_, packet)) => packet,
        Err(_) => Packet::Unknown(input.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_commands() {
        assert_eq!(parse_packet(b"?"), Packet::HaltReason);
        assert_eq!(parse_packet(b"g"), Packet::ReadRegisters);
        assert_eq!(parse_packet(b"D"), Packet::Detach);
        assert_eq!(parse_packet(b"!"), Packet::ExtendedMode);
        assert_eq!(parse_packet(b"T1"), Packet::ThreadAlive(1));
        assert_eq!(parse_packet(&[0x03]), Packet::Break);
    }

    #[test]
    fn parses_register_access() {
        assert_eq!(parse_packet(b"p20"), Packet::ReadRegister(0x20));
        // 0xdeadbeef arrives as its little-endian bytes ef be ad de.
        assert_eq!(
            parse_packet(b"P5=efbeadde"),
            Packet::WriteRegister {
                reg: 5,
                value: 0xdead_beef
            }
        );
    }

    #[test]
    fn parses_memory_access() {
        assert_eq!(
            parse_packet(b"m1c008080,40"),
            Packet::ReadMemory {
                addr: 0x1c00_8080,
                length: 0x40
            }
        );
        assert_eq!(
            parse_packet(b"M1000,2:beef"),
            Packet::WriteMemoryHex {
                addr: 0x1000,
                data: vec![0xbe, 0xef]
            }
        );
        assert_eq!(
            parse_packet(b"X2000,3:abc"),
            Packet::WriteMemoryBinary {
                addr: 0x2000,
                data: b"abc".to_vec()
            }
        );
    }

    #[test]
    fn parses_breakpoints() {
        assert_eq!(
            parse_packet(b"Z0,1c008080,4"),
            Packet::InsertBreakpoint {
                kind: 0,
                addr: 0x1c00_8080
            }
        );
        assert_eq!(
            parse_packet(b"z0,1c008080,2"),
            Packet::RemoveBreakpoint {
                kind: 0,
                addr: 0x1c00_8080
            }
        );
    }

    #[test]
    fn parses_thread_selection() {
        assert_eq!(
            parse_packet(b"Hg-1"),
            Packet::SelectThread {
                op: 'g',
                thread_id: -1
            }
        );
        assert_eq!(
            parse_packet(b"Hc3"),
            Packet::SelectThread {
                op: 'c',
                thread_id: 3
            }
        );
    }

    #[test]
    fn parses_resume_commands() {
        assert_eq!(parse_packet(b"c"), Packet::Continue { addr: None });
        assert_eq!(
            parse_packet(b"c1c008080"),
            Packet::Continue {
                addr: Some(0x1c00_8080)
            }
        );
        assert_eq!(parse_packet(b"s"), Packet::Step { addr: None });
        assert_eq!(
            parse_packet(b"C05;1000"),
            Packet::Continue { addr: Some(0x1000) }
        );
        assert_eq!(parse_packet(b"S05;1000"), Packet::Step { addr: Some(0x1000) });
    }

    #[test]
    fn parses_vcont() {
        assert_eq!(parse_packet(b"vCont?"), Packet::V(VPacket::ContQuery));
        assert_eq!(
            parse_packet(b"vCont;s:1;c:2"),
            Packet::V(VPacket::Cont(vec![
                ContAction {
                    step: true,
                    thread_id: Some(1)
                },
                ContAction {
                    step: false,
                    thread_id: Some(2)
                },
            ]))
        );
        assert_eq!(
            parse_packet(b"vCont;c"),
            Packet::V(VPacket::Cont(vec![ContAction {
                step: false,
                thread_id: None
            }]))
        );
        assert_eq!(parse_packet(b"vKill"), Packet::V(VPacket::Kill));
        assert_eq!(
            parse_packet(b"vMustReplyEmpty"),
            Packet::V(VPacket::Unknown("MustReplyEmpty".into()))
        );
    }

    #[test]
    fn parses_queries() {
        assert_eq!(
            parse_packet(b"qSupported:multiprocess+;swbreak+"),
            Packet::Query(QueryPacket::Supported("multiprocess+;swbreak+".into()))
        );
        assert_eq!(
            parse_packet(b"qfThreadInfo"),
            Packet::Query(QueryPacket::FirstThreadInfo)
        );
        assert_eq!(
            parse_packet(b"qsThreadInfo"),
            Packet::Query(QueryPacket::SubsequentThreadInfo)
        );
        assert_eq!(
            parse_packet(b"qThreadExtraInfo,2"),
            Packet::Query(QueryPacket::ThreadExtraInfo(2))
        );
        assert_eq!(parse_packet(b"qC"), Packet::Query(QueryPacket::CurrentThread));
        assert_eq!(
            parse_packet(b"qRcmd,7265736574"),
            Packet::Query(QueryPacket::Forward("qRcmd,7265736574".into()))
        );
        assert_eq!(
            parse_packet(b"qTStatus"),
            Packet::Query(QueryPacket::Other("qTStatus".into()))
        );
    }

    #[test]
    fn unknown_packets_are_preserved() {
        assert_eq!(parse_packet(b"@bogus"), Packet::Unknown(b"@bogus".to_vec()));
    }
}
