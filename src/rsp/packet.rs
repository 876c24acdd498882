//! RSP packet framing.
//!
//! Packets travel as `$<payload>#<hh>` where `hh` is the modulo-256 sum of
//! the raw payload bytes in lower-case hex. A `}` escapes the following
//! byte by XOR with `0x20`; the checksum covers the escaped form. The
//! receiver is a pure byte-at-a-time state machine so it can be fed from a
//! socket in arbitrary fragments.

use std::time::{Duration, Instant};

use tracing::{trace, warn};

pub const PACKET_MAX_LEN: usize = 4096;
pub const PACKET_TIMEOUT: Duration = Duration::from_secs(2);
const ACK_TIMEOUT: Duration = Duration::from_secs(1);

/// Bytes that must be escaped on the wire.
fn needs_escape(byte: u8) -> bool {
    matches!(byte, b'#' | b'%' | b'}' | b'*')
}

/// Outcome of feeding one byte to the receiver.
#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    Pending,
    /// A well-formed packet arrived; the payload is de-escaped. The caller
    /// acknowledges with `+`.
    Packet(Vec<u8>),
    /// An asynchronous break (0x03) arrived outside a packet.
    Break,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecvState {
    Leadin,
    Body,
    Checksum,
}

/// Receiver state machine.
pub struct Receiver {
    state: RecvState,
    payload: Vec<u8>,
    checksum: u32,
    escaped: bool,
    check_chars: [u8; 2],
    check_len: usize,
    started_at: Option<Instant>,
    timeout: Duration,
}

impl Default for Receiver {
    fn default() -> Self {
        Self::new(PACKET_TIMEOUT)
    }
}

impl Receiver {
    pub fn new(timeout: Duration) -> Receiver {
        Receiver {
            state: RecvState::Leadin,
            payload: Vec::new(),
            checksum: 0,
            escaped: false,
            check_chars: [0; 2],
            check_len: 0,
            started_at: None,
            timeout,
        }
    }

    fn reset(&mut self) {
        self.state = RecvState::Leadin;
        self.payload.clear();
        self.checksum = 0;
        self.escaped = false;
        self.check_len = 0;
        self.started_at = None;
    }

    /// Drops a half-received packet whose deadline passed.
    pub fn check_timeout(&mut self) {
        if let Some(started_at) = self.started_at {
            if started_at.elapsed() > self.timeout {
                warn!("packet timed out, dropping partial input");
                self.reset();
            }
        }
    }

    pub fn push(&mut self, byte: u8) -> Step {
        match self.state {
            RecvState::Leadin => {
                if byte == 0x03 {
                    return Step::Break;
                }
                if byte == b'$' {
                    self.reset();
                    self.state = RecvState::Body;
                    self.started_at = Some(Instant::now());
                }
                Step::Pending
            }
            RecvState::Body => {
                if byte == b'#' {
                    self.state = RecvState::Checksum;
                    return Step::Pending;
                }
                if self.payload.len() >= PACKET_MAX_LEN {
                    warn!("packet exceeds {PACKET_MAX_LEN} bytes, dropping");
                    self.reset();
                    return Step::Pending;
                }
                self.checksum = (self.checksum + u32::from(byte)) % 256;
                if self.escaped {
                    self.payload.push(byte ^ 0x20);
                    self.escaped = false;
                } else if byte == b'}' {
                    self.escaped = true;
                } else {
                    self.payload.push(byte);
                }
                Step::Pending
            }
            RecvState::Checksum => {
                self.check_chars[self.check_len] = byte;
                self.check_len += 1;
                if self.check_len < 2 {
                    return Step::Pending;
                }
                let sent = std::str::from_utf8(&self.check_chars)
                    .ok()
                    .and_then(|s| u32::from_str_radix(s, 16).ok());
                let computed = self.checksum;
                let payload = std::mem::take(&mut self.payload);
                self.reset();
                if sent == Some(computed) {
                    trace!(len = payload.len(), "packet received");
                    Step::Packet(payload)
                } else {
                    warn!(?sent, computed, "checksum mismatch, dropping packet");
                    Step::Pending
                }
            }
        }
    }
}

/// Wraps `payload` into a wire frame, escaping as needed.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 4);
    frame.push(b'$');
    let mut checksum = 0u32;
    for &byte in payload {
        if needs_escape(byte) {
            let escaped = byte ^ 0x20;
            frame.push(b'}');
            frame.push(escaped);
            checksum = (checksum + u32::from(b'}') + u32::from(escaped)) % 256;
        } else {
            frame.push(byte);
            checksum = (checksum + u32::from(byte)) % 256;
        }
    }
    frame.push(b'#');
    frame.extend_from_slice(format!("{checksum:02x}").as_bytes());
    frame
}

/// Transport the sender needs: raw writes and single-byte reads with a
/// timeout so acknowledgements can be awaited.
pub trait PacketIo {
    fn send_raw(&mut self, data: &[u8]) -> std::io::Result<()>;
    /// Returns `None` on timeout.
    fn recv_byte(&mut self, timeout: Duration) -> std::io::Result<Option<u8>>;
}

/// Sends one packet and retries until the peer acknowledges it.
pub fn send_packet(io: &mut impl PacketIo, payload: &[u8]) -> std::io::Result<()> {
    let frame = encode(payload);
    loop {
        trace!(frame = %String::from_utf8_lossy(&frame), "sending");
        io.send_raw(&frame)?;
        match io.recv_byte(ACK_TIMEOUT)? {
            Some(b'+') => return Ok(()),
            Some(other) => {
                warn!(byte = other, "expected ack, resending");
            }
            None => {
                warn!("no ack within timeout, resending");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(receiver: &mut Receiver, bytes: &[u8]) -> Option<Step> {
        for &byte in bytes {
            match receiver.push(byte) {
                Step::Pending => continue,
                step => return Some(step),
            }
        }
        None
    }

    #[test]
    fn receives_a_simple_packet() {
        let mut receiver = Receiver::default();
        let step = feed(&mut receiver, b"$qSupported#37").unwrap();
        assert_eq!(step, Step::Packet(b"qSupported".to_vec()));
    }

    #[test]
    fn tolerates_fragmented_input() {
        let mut receiver = Receiver::default();
        assert!(feed(&mut receiver, b"$qSup").is_none());
        assert!(feed(&mut receiver, b"ported#3").is_none());
        let step = feed(&mut receiver, b"7").unwrap();
        assert_eq!(step, Step::Packet(b"qSupported".to_vec()));
    }

    #[test]
    fn bad_checksum_is_dropped() {
        let mut receiver = Receiver::default();
        assert!(feed(&mut receiver, b"$qSupported#38").is_none());
        // The receiver is ready for the retransmission.
        let step = feed(&mut receiver, b"$qSupported#37").unwrap();
        assert_eq!(step, Step::Packet(b"qSupported".to_vec()));
    }

    #[test]
    fn break_byte_reported_immediately() {
        let mut receiver = Receiver::default();
        assert_eq!(receiver.push(0x03), Step::Break);
    }

    #[test]
    fn junk_before_leadin_is_ignored() {
        let mut receiver = Receiver::default();
        let step = feed(&mut receiver, b"+++garbage$g#67").unwrap();
        assert_eq!(step, Step::Packet(b"g".to_vec()));
    }

    #[test]
    fn escaped_bytes_roundtrip() {
        for payload in [
            b"no escapes".to_vec(),
            b"has # hash".to_vec(),
            b"has } brace".to_vec(),
            vec![b'*', b'%', b'}', b'#'],
            (0u8..=255).collect::<Vec<u8>>(),
        ] {
            let frame = encode(&payload);
            let mut receiver = Receiver::default();
            let step = feed(&mut receiver, &frame).expect("frame should complete");
            assert_eq!(step, Step::Packet(payload));
        }
    }

    #[test]
    fn encode_escapes_the_reserved_bytes() {
        let frame = encode(b"}");
        assert_eq!(&frame[..3], b"$}]");
        let frame = encode(b"#");
        assert_eq!(&frame[..3], b"$}\x03");
    }

    #[test]
    fn checksum_matches_gdb_reference() {
        // "g" sums to 0x67.
        assert_eq!(encode(b"g"), b"$g#67".to_vec());
        // "OK" sums to 0x9a.
        assert_eq!(encode(b"OK"), b"$OK#9a".to_vec());
    }

    #[test]
    fn oversized_packet_is_discarded() {
        let mut receiver = Receiver::default();
        let mut big = vec![b'$'];
        big.extend(std::iter::repeat(b'a').take(PACKET_MAX_LEN + 2));
        assert!(feed(&mut receiver, &big).is_none());
        // A fresh packet still parses afterwards.
        let step = feed(&mut receiver, b"$g#67").unwrap();
        assert_eq!(step, Step::Packet(b"g".to_vec()));
    }
}
