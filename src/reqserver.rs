//! Raw memory request server.
//!
//! A line of external tools moves bulk data over a binary TCP protocol:
//! a fixed little-endian header `{trans_id, type, addr, len}` optionally
//! followed by a write payload. Read replies carry their length and data;
//! writes are acknowledged with a bare header. One client at a time; large
//! transactions are chipped away in burst-sized chunks on a repeating
//! timer so the event loop never blocks on the cable.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use scroll::{Pread, Pwrite, LE};
use tracing::{debug, error, info, warn};

use crate::cable::AdvDebugUnit;
use crate::event_loop::{EventLoop, FileEvents, TimerHandle};
use crate::net::{CircularBuffer, Listener, Socket};

pub const REQ_READMEM: u32 = 0;
pub const REQ_WRITEMEM: u32 = 1;
pub const RSP_READMEM: u32 = 2;
pub const RSP_WRITEMEM: u32 = 3;
pub const RSP_ERROR: u32 = 4;
pub const RSP_ALERT: u32 = 5;

/// Largest request accepted, in bytes.
const MAX_REQ_LEN: i32 = 5_000_000;
/// Pause between transaction chunks.
const TRANS_TICK: Duration = Duration::from_micros(100);
/// Partial requests are dropped when the peer stalls this long.
const PACKET_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Pread, Pwrite)]
struct ReqHeader {
    trans_id: u32,
    kind: u32,
    addr: u32,
    len: i32,
}

const HEADER_LEN: usize = 16;

#[derive(Debug, Clone, Copy, Pread, Pwrite)]
struct RspHeader {
    trans_id: u32,
    kind: u32,
}

const RSP_LEN: usize = 8;

fn push_rsp(buf: &mut CircularBuffer, trans_id: u32, kind: u32) {
    let mut raw = [0u8; RSP_LEN];
    raw.pwrite_with(RspHeader { trans_id, kind }, 0, LE)
        .expect("rsp header fits");
    buf.write_copy(&raw);
}

/// One transaction moving through receive, execute and send.
#[derive(Debug)]
struct Transaction {
    header: ReqHeader,
    data: Vec<u8>,
    /// Progress cursor: receive fill for writes, cable progress during
    /// execution, send drain for read replies.
    pos: usize,
    error: bool,
}

impl Transaction {
    fn new(header: ReqHeader) -> Transaction {
        Transaction {
            header,
            data: Vec::new(),
            pos: 0,
            error: false,
        }
    }

    /// Runs one chunk against the cable. Returns true when finished.
    fn execute(&mut self, adapter: &AdvDebugUnit) -> bool {
        if self.error {
            return true;
        }
        let len = self.header.len as usize;
        if self.data.len() < len {
            self.data.resize(len, 0);
        }
        let chunk = adapter.max_burst().min(len - self.pos);
        let addr = self.header.addr + self.pos as u32;
        let result = if self.header.kind == REQ_WRITEMEM {
            adapter.write(addr, &self.data[self.pos..self.pos + chunk])
        } else {
            adapter.read(addr, &mut self.data[self.pos..self.pos + chunk])
        };
        match result {
            Ok(()) => {
                self.pos += chunk;
                if self.pos >= len {
                    self.pos = 0;
                    true
                } else {
                    false
                }
            }
            Err(err) => {
                error!(%err, addr = format_args!("{addr:#010x}"), "reqserver access failed");
                self.error = true;
                true
            }
        }
    }

    /// Encodes the response into the out-buffer. Returns true when the
    /// whole reply is queued.
    fn send(&mut self, buf: &mut CircularBuffer) -> bool {
        if self.error {
            if buf.available() < RSP_LEN {
                return false;
            }
            push_rsp(buf, self.header.trans_id, RSP_ERROR);
            return true;
        }
        if self.header.kind == REQ_WRITEMEM {
            if buf.available() < RSP_LEN {
                return false;
            }
            push_rsp(buf, self.header.trans_id, RSP_WRITEMEM);
            return true;
        }

        // Read reply: header with length once, then the payload as the
        // buffer drains. At least one payload byte must follow the header
        // in the same pass, `pos == 0` doubles as "header not yet sent".
        if self.pos == 0 {
            if buf.available() <= RSP_LEN + 4 {
                return false;
            }
            push_rsp(buf, self.header.trans_id, RSP_READMEM);
            buf.write_copy(&(self.data.len() as u32).to_le_bytes());
        }
        self.pos += buf.write_copy(&self.data[self.pos..]);
        self.pos >= self.data.len()
    }
}

#[derive(Default)]
struct ClientState {
    /// Header, and payload for writes, being received.
    partial: Option<Transaction>,
    pending: VecDeque<Transaction>,
    completed: VecDeque<Transaction>,
    send_alert: bool,
    send_reset: bool,
}

struct ClientInner {
    sock: Arc<Socket>,
    adapter: Arc<AdvDebugUnit>,
    state: Mutex<ClientState>,
    trans_timer: Mutex<Option<TimerHandle>>,
    timeout_timer: Mutex<Option<TimerHandle>>,
}

struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    fn new(el: &EventLoop, adapter: Arc<AdvDebugUnit>, sock: Arc<Socket>) -> Client {
        let inner = Arc::new(ClientInner {
            sock: sock.clone(),
            adapter,
            state: Mutex::new(ClientState::default()),
            trans_timer: Mutex::new(None),
            timeout_timer: Mutex::new(None),
        });

        let read_inner = inner.clone();
        sock.set_read_cb(Box::new(move |_sock, buf| {
            ClientInner::on_read(&read_inner, buf);
        }));
        let write_inner = inner.clone();
        sock.set_write_cb(Box::new(move |sock, buf| {
            ClientInner::on_write(&write_inner, sock, buf);
        }));

        let timer_inner = inner.clone();
        let trans_timer = el.timer(Box::new(move || ClientInner::process_transaction(&timer_inner)));
        *inner.trans_timer.lock() = Some(trans_timer);

        let timeout_inner = inner.clone();
        let timeout_timer = el.timer(Box::new(move || ClientInner::packet_timeout(&timeout_inner)));
        *inner.timeout_timer.lock() = Some(timeout_timer);

        sock.set_events(FileEvents::Readable);
        Client {
            inner,
        }
    }

    fn stop(&self) {
        debug!("reqserver client stopping");
        if let Some(timer) = self.inner.trans_timer.lock().take() {
            timer.cancel();
        }
        if let Some(timer) = self.inner.timeout_timer.lock().take() {
            timer.cancel();
        }
        self.inner.sock.close();
    }

    fn target_alert(&self) {
        let mut state = self.inner.state.lock();
        state.send_alert = true;
        drop(state);
        self.inner.sock.set_events(FileEvents::Both);
    }

    fn target_reset(&self) {
        let mut state = self.inner.state.lock();
        state.send_reset = true;
        state.send_alert = false;
        state.pending.clear();
        state.completed.clear();
        drop(state);
        self.inner.sock.set_events(FileEvents::Both);
    }
}

impl ClientInner {
    /// Socket read callback: peel complete requests off the stream.
    fn on_read(inner: &Arc<ClientInner>, buf: &mut CircularBuffer) {
        let mut state = inner.state.lock();
        let mut got_request = false;
        loop {
            if let Some(mut partial) = state.partial.take() {
                // Writes stream their payload after the header.
                let want = partial.header.len as usize;
                let mut chunk = vec![0u8; (want - partial.pos).min(buf.len())];
                let n = buf.read_copy(&mut chunk);
                partial.data.extend_from_slice(&chunk[..n]);
                partial.pos += n;
                if partial.pos < want {
                    state.partial = Some(partial);
                    break;
                }
                partial.pos = 0;
                state.pending.push_back(partial);
                got_request = true;
                continue;
            }

            if buf.len() < HEADER_LEN {
                break;
            }
            let mut raw = [0u8; HEADER_LEN];
            buf.read_copy(&mut raw);
            let header: ReqHeader = raw.pread_with(0, LE).expect("header length checked");

            if header.kind > REQ_WRITEMEM || header.len <= 0 || header.len > MAX_REQ_LEN {
                warn!(?header, "malformed request");
                buf.clear();
                let mut bad = Transaction::new(header);
                bad.error = true;
                state.completed.push_back(bad);
                got_request = true;
                continue;
            }

            let transaction = Transaction::new(header);
            if header.kind == REQ_WRITEMEM {
                state.partial = Some(transaction);
            } else {
                state.pending.push_back(transaction);
                got_request = true;
            }
        }

        let idle = state.partial.is_none() && buf.is_empty();
        let has_pending = !state.pending.is_empty();
        let has_completed = !state.completed.is_empty();
        drop(state);

        if got_request || has_pending {
            if let Some(timer) = inner.trans_timer.lock().as_ref() {
                timer.set_timeout(Some(Duration::ZERO));
            }
        }
        if has_completed {
            inner.sock.set_events(FileEvents::Both);
        }
        if let Some(timer) = inner.timeout_timer.lock().as_ref() {
            timer.set_timeout(if idle { None } else { Some(PACKET_TIMEOUT) });
        }
    }

    /// Socket write callback: drain completed transactions and any alert
    /// or reset frames.
    fn on_write(inner: &Arc<ClientInner>, sock: &Arc<Socket>, buf: &mut CircularBuffer) {
        let mut state = inner.state.lock();

        while let Some(front) = state.completed.front_mut() {
            if front.send(buf) {
                state.completed.pop_front();
            } else {
                break;
            }
        }

        // Alert and reset frames slot in between transactions.
        if (state.send_alert || state.send_reset) && buf.available() >= RSP_LEN {
            if state.send_alert {
                // An alert obsoletes everything not yet sent.
                state.completed.clear();
                push_rsp(buf, 0, RSP_ALERT);
            } else {
                push_rsp(buf, 0, RSP_ERROR);
            }
            state.send_alert = false;
            state.send_reset = false;
        }

        if state.completed.is_empty() && !state.send_alert && !state.send_reset {
            drop(state);
            sock.set_events(FileEvents::Readable);
        }
    }

    /// Transaction pump: move the front pending transaction forward by one
    /// burst-sized chunk.
    fn process_transaction(inner: &Arc<ClientInner>) -> Option<Duration> {
        let mut state = inner.state.lock();
        let Some(front) = state.pending.front_mut() else {
            return None;
        };
        if front.execute(&inner.adapter) {
            let done = state.pending.pop_front().expect("front exists");
            state.completed.push_back(done);
            drop(state);
            inner.sock.set_events(FileEvents::Both);
            return Some(TRANS_TICK);
        }
        Some(TRANS_TICK)
    }

    /// Receive timeout: drop a half-received request.
    fn packet_timeout(inner: &Arc<ClientInner>) -> Option<Duration> {
        debug!("request timed out, resetting receive state");
        inner.state.lock().partial = None;
        inner.sock.with_in_buffer(|buf| buf.clear());
        None
    }
}

struct ServerInner {
    el: EventLoop,
    adapter: Arc<AdvDebugUnit>,
    listener: Mutex<Option<Listener>>,
    client: Mutex<Option<Client>>,
    port: u16,
}

/// TCP front-end for bulk memory access.
pub struct ReqServer {
    inner: Arc<ServerInner>,
}

impl ReqServer {
    pub fn new(el: &EventLoop, adapter: Arc<AdvDebugUnit>, port: u16) -> ReqServer {
        ReqServer {
            inner: Arc::new(ServerInner {
                el: el.clone(),
                adapter,
                listener: Mutex::new(None),
                client: Mutex::new(None),
                port,
            }),
        }
    }

    pub fn start(&self) -> std::io::Result<()> {
        let listener = Listener::bind(&self.inner.el, self.inner.port)?;
        let inner = self.inner.clone();
        listener.on_connected(Box::new(move |sock| {
            ServerInner::client_connected(&inner, sock);
        }));
        listener.start();
        *self.inner.listener.lock() = Some(listener);
        Ok(())
    }

    pub fn port(&self) -> u16 {
        self.inner
            .listener
            .lock()
            .as_ref()
            .map(|l| l.port())
            .unwrap_or(self.inner.port)
    }

    pub fn stop(&self) {
        let client = self.inner.client.lock().take();
        if let Some(client) = client {
            client.stop();
        }
        let listener = self.inner.listener.lock().take();
        if let Some(listener) = listener {
            listener.stop();
        }
    }

    /// Forwarded when the target is reset: drop anything in flight.
    pub fn target_reset(&self) {
        if let Some(client) = self.inner.client.lock().as_ref() {
            client.target_reset();
        }
    }

    /// Forwarded when the target raises an asynchronous alert.
    pub fn target_alert(&self) {
        if let Some(client) = self.inner.client.lock().as_ref() {
            client.target_alert();
        }
    }
}

impl ServerInner {
    fn client_connected(inner: &Arc<ServerInner>, sock: Arc<Socket>) {
        let mut slot = inner.client.lock();
        if slot.is_some() {
            warn!("reqserver already has a client, refusing");
            sock.shutdown();
            return;
        }
        info!("reqserver client connected");

        let drop_inner = inner.clone();
        sock.set_closed_cb(Box::new(move || {
            info!("reqserver client disconnected");
            drop_inner.client.lock().take();
        }));
        *slot = Some(Client::new(&inner.el, inner.adapter.clone(), sock));
    }
}
