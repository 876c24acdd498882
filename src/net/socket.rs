//! Buffered non-blocking socket.
//!
//! A [`Socket`] can be driven two ways. Reactor mode registers the handle
//! with the event loop: incoming bytes are drained into a circular
//! in-buffer before the read callback runs, and the write callback fills a
//! circular out-buffer that is flushed as the wire accepts it, with
//! watermark flow control on both sides. Immediate mode bypasses the
//! buffers with polled synchronous reads and writes, which is what the RSP
//! worker thread and the JTAG proxy cable use.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::buffer::{CircularBuffer, DEFAULT_BUFFER_SIZE};
use super::wait_ready;
use crate::event_loop::{EventLoop, FileEvents, FileHandle};

/// Lifecycle of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Open,
    ShuttingDown,
    ShutDown,
    Closed,
}

pub type DataCallback = Box<dyn FnMut(&Arc<Socket>, &mut CircularBuffer) + Send>;
pub type ClosedCallback = Box<dyn FnOnce() + Send>;

struct SocketInner {
    state: SocketState,
    in_buf: Option<CircularBuffer>,
    out_buf: Option<CircularBuffer>,
    user_events: FileEvents,
    read_flowing: bool,
    write_flowing: bool,
    read_cb: Option<DataCallback>,
    write_cb: Option<DataCallback>,
    closed_cb: Option<ClosedCallback>,
    handle: Option<FileHandle>,
}

pub struct Socket {
    stream: TcpStream,
    high: usize,
    low: usize,
    inner: Mutex<SocketInner>,
}

impl Socket {
    /// Wraps `stream`, marks it non-blocking and registers it with the
    /// event loop (initially watching nothing).
    pub fn attach(el: &EventLoop, stream: TcpStream) -> io::Result<Arc<Socket>> {
        Self::attach_sized(el, stream, DEFAULT_BUFFER_SIZE)
    }

    pub fn attach_sized(
        el: &EventLoop,
        stream: TcpStream,
        buffer_size: usize,
    ) -> io::Result<Arc<Socket>> {
        stream.set_nonblocking(true)?;
        let sock = Arc::new(Socket {
            stream,
            high: buffer_size * 3 / 4,
            low: buffer_size / 4,
            inner: Mutex::new(SocketInner {
                state: SocketState::Open,
                in_buf: Some(CircularBuffer::with_capacity(buffer_size)),
                out_buf: Some(CircularBuffer::with_capacity(buffer_size)),
                user_events: FileEvents::None,
                read_flowing: true,
                write_flowing: true,
                read_cb: None,
                write_cb: None,
                closed_cb: None,
                handle: None,
            }),
        });

        let weak = Arc::downgrade(&sock);
        let handle = el.file(
            sock.stream.as_raw_fd(),
            FileEvents::None,
            Box::new(move |events| {
                if let Some(sock) = weak.upgrade() {
                    Socket::handle_events(&sock, events);
                }
            }),
        );
        sock.inner.lock().handle = Some(handle);
        Ok(sock)
    }

    pub fn state(&self) -> SocketState {
        self.inner.lock().state
    }

    pub fn peer_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.stream.peer_addr()
    }

    pub fn set_read_cb(&self, cb: DataCallback) {
        self.inner.lock().read_cb = Some(cb);
    }

    pub fn set_write_cb(&self, cb: DataCallback) {
        self.inner.lock().write_cb = Some(cb);
    }

    pub fn set_closed_cb(&self, cb: ClosedCallback) {
        self.inner.lock().closed_cb = Some(cb);
    }

    /// Selects what readiness the event loop should watch. Writable is kept
    /// enabled behind the scenes while the out-buffer holds data.
    pub fn set_events(&self, events: FileEvents) {
        self.inner.lock().user_events = events;
        self.apply_events();
    }

    /// Runs `f` on the in-buffer outside of the event callbacks.
    pub fn with_in_buffer<R>(&self, f: impl FnOnce(&mut CircularBuffer) -> R) -> R {
        let mut buf = self.inner.lock().in_buf.take().expect("in buffer in use");
        let result = f(&mut buf);
        self.inner.lock().in_buf = Some(buf);
        self.apply_events();
        result
    }

    /// Runs `f` on the out-buffer, then flushes towards the wire.
    pub fn with_out_buffer<R>(&self, f: impl FnOnce(&mut CircularBuffer) -> R) -> R {
        let mut buf = self.inner.lock().out_buf.take().expect("out buffer in use");
        let result = f(&mut buf);
        self.inner.lock().out_buf = Some(buf);
        self.flush_out();
        self.apply_events();
        result
    }

    /// Synchronous read used by worker threads. Returns `Ok(0)` on timeout;
    /// a closed peer surfaces as `UnexpectedEof`.
    pub fn read_immediate(&self, buf: &mut [u8], timeout: Option<Duration>) -> io::Result<usize> {
        if self.inner.lock().state == SocketState::Closed {
            return Err(io::ErrorKind::NotConnected.into());
        }
        if !wait_ready(self.stream.as_raw_fd(), true, false, timeout)? {
            return Ok(0);
        }
        match (&self.stream).read(buf) {
            Ok(0) => Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => Ok(n),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(err) => Err(err),
        }
    }

    /// Synchronous write of the whole buffer.
    pub fn write_immediate(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            wait_ready(self.stream.as_raw_fd(), false, true, None)?;
            match (&self.stream).write(buf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => buf = &buf[n..],
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Sends FIN, drains whatever the peer still had in flight and closes.
    pub fn shutdown(&self) {
        {
            let mut inner = self.inner.lock();
            match inner.state {
                SocketState::Open => inner.state = SocketState::ShuttingDown,
                _ => return,
            }
        }
        debug!("shutting down socket");
        let _ = self.stream.shutdown(Shutdown::Write);

        let mut sink = [0u8; 256];
        loop {
            match wait_ready(
                self.stream.as_raw_fd(),
                true,
                false,
                Some(Duration::from_millis(500)),
            ) {
                Ok(true) => match (&self.stream).read(&mut sink) {
                    Ok(n) if n > 0 => continue,
                    _ => break,
                },
                _ => break,
            }
        }
        self.inner.lock().state = SocketState::ShutDown;
        self.close();
    }

    /// Tears the socket down and fires the closed callback exactly once.
    pub fn close(&self) {
        let closed_cb = {
            let mut inner = self.inner.lock();
            if inner.state == SocketState::Closed {
                return;
            }
            inner.state = SocketState::Closed;
            if let Some(handle) = inner.handle.take() {
                handle.remove();
            }
            inner.closed_cb.take()
        };
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(cb) = closed_cb {
            cb();
        }
    }

    fn handle_events(sock: &Arc<Socket>, events: FileEvents) {
        if events.wants_read() {
            Self::handle_readable(sock);
        }
        if events.wants_write() {
            Self::handle_writable(sock);
        }
        sock.apply_events();
    }

    fn handle_readable(sock: &Arc<Socket>) {
        let (mut buf, cb) = {
            let mut inner = sock.inner.lock();
            if inner.state != SocketState::Open {
                return;
            }
            let buf = match inner.in_buf.take() {
                Some(buf) => buf,
                None => return,
            };
            (buf, inner.read_cb.take())
        };

        let mut eof = false;
        loop {
            if buf.available() == 0 {
                break;
            }
            match buf.fill_from(&mut &sock.stream) {
                Ok(0) => {
                    // Free space but nothing read: the peer sent FIN.
                    eof = true;
                    break;
                }
                Ok(_) => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    trace!(%err, "read error");
                    eof = true;
                    break;
                }
            }
        }

        let mut cb = cb;
        if let Some(cb) = cb.as_mut() {
            if !buf.is_empty() {
                cb(sock, &mut buf);
            }
        }

        {
            let mut inner = sock.inner.lock();
            inner.read_flowing = if buf.len() >= sock.high {
                false
            } else if buf.len() <= sock.low {
                true
            } else {
                inner.read_flowing
            };
            inner.in_buf = Some(buf);
            if let Some(cb) = cb {
                inner.read_cb.get_or_insert(cb);
            }
        }

        if eof {
            debug!("peer closed connection");
            sock.close();
        }
    }

    fn handle_writable(sock: &Arc<Socket>) {
        let (mut buf, cb, flowing) = {
            let mut inner = sock.inner.lock();
            if inner.state == SocketState::Closed {
                return;
            }
            let buf = match inner.out_buf.take() {
                Some(buf) => buf,
                None => return,
            };
            (buf, inner.write_cb.take(), inner.write_flowing)
        };

        // Ask the application for data first, then flush. Past the high
        // watermark the invite is withheld until the buffer drains back
        // below the low one.
        let mut cb = cb;
        if let Some(cb) = cb.as_mut() {
            if flowing && buf.available() > 0 {
                cb(sock, &mut buf);
            }
        }

        {
            let mut inner = sock.inner.lock();
            inner.write_flowing = if buf.len() >= sock.high {
                false
            } else if buf.len() <= sock.low {
                true
            } else {
                inner.write_flowing
            };
            inner.out_buf = Some(buf);
            if let Some(cb) = cb {
                inner.write_cb.get_or_insert(cb);
            }
        }
        sock.flush_out();
    }

    fn flush_out(&self) {
        let mut buf = {
            let mut inner = self.inner.lock();
            match inner.out_buf.take() {
                Some(buf) => buf,
                None => return,
            }
        };
        while !buf.is_empty() {
            match buf.drain_to(&mut &self.stream) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    trace!(%err, "write error");
                    self.restore_out_buf(buf);
                    self.close();
                    return;
                }
            }
        }
        self.restore_out_buf(buf);
    }

    fn restore_out_buf(&self, buf: CircularBuffer) {
        let mut inner = self.inner.lock();
        inner.write_flowing = if buf.len() >= self.high {
            false
        } else if buf.len() <= self.low {
            true
        } else {
            inner.write_flowing
        };
        inner.out_buf = Some(buf);
    }

    /// Recomputes the readiness set the loop should watch.
    fn apply_events(&self) {
        let inner = self.inner.lock();
        if inner.state != SocketState::Open {
            return;
        }
        let (in_len, out_len) = (
            inner.in_buf.as_ref().map_or(0, |b| b.len()),
            inner.out_buf.as_ref().map_or(0, |b| b.len()),
        );
        let read = inner.user_events.wants_read() && inner.read_flowing && in_len < self.high;
        let write = out_len > 0 || (inner.user_events.wants_write() && inner.write_flowing);
        if let Some(handle) = &inner.handle {
            handle.set_events(FileEvents::combine(read, write));
        }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        // The watch must not outlive the file descriptor.
        if let Some(handle) = self.inner.lock().handle.take() {
            handle.remove();
        }
    }
}
