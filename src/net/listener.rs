//! Accepting TCP listener driven by the event loop.

use std::io;
use std::net::TcpListener;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::socket::Socket;
use crate::event_loop::{EventLoop, FileEvents, FileHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Stopped,
    Started,
}

pub type ConnectedCallback = Box<dyn FnMut(Arc<Socket>) + Send>;
pub type StateCallback = Box<dyn FnMut(ListenerState) + Send>;

struct ListenerInner {
    el: EventLoop,
    listener: TcpListener,
    accepting: Arc<AtomicBool>,
    handle: Mutex<Option<FileHandle>>,
    connected_cb: Mutex<Option<ConnectedCallback>>,
    state_cb: Mutex<Option<StateCallback>>,
}

/// Binds a port and hands accepted connections to a callback as
/// ready-to-use [`Socket`]s.
pub struct Listener {
    inner: Arc<ListenerInner>,
}

impl Listener {
    pub fn bind(el: &EventLoop, port: u16) -> io::Result<Listener> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        listener.set_nonblocking(true)?;
        Ok(Listener {
            inner: Arc::new(ListenerInner {
                el: el.clone(),
                listener,
                accepting: Arc::new(AtomicBool::new(true)),
                handle: Mutex::new(None),
                connected_cb: Mutex::new(None),
                state_cb: Mutex::new(None),
            }),
        })
    }

    pub fn port(&self) -> u16 {
        self.inner
            .listener
            .local_addr()
            .map(|a| a.port())
            .unwrap_or(0)
    }

    pub fn on_connected(&self, cb: ConnectedCallback) {
        *self.inner.connected_cb.lock() = Some(cb);
    }

    pub fn on_state_change(&self, cb: StateCallback) {
        *self.inner.state_cb.lock() = Some(cb);
    }

    /// Registers the acceptor with the event loop.
    pub fn start(&self) {
        let mut slot = self.inner.handle.lock();
        if slot.is_some() {
            return;
        }
        let inner = self.inner.clone();
        let handle = self.inner.el.file(
            self.inner.listener.as_raw_fd(),
            FileEvents::Readable,
            Box::new(move |_| ListenerInner::accept_ready(&inner)),
        );
        *slot = Some(handle);
        info!(port = self.port(), "listener started");
        if let Some(cb) = self.inner.state_cb.lock().as_mut() {
            cb(ListenerState::Started);
        }
    }

    pub fn stop(&self) {
        if let Some(handle) = self.inner.handle.lock().take() {
            handle.remove();
            debug!(port = self.port(), "listener stopped");
            if let Some(cb) = self.inner.state_cb.lock().as_mut() {
                cb(ListenerState::Stopped);
            }
        }
    }

    /// Temporarily refuse (and immediately close) new connections.
    pub fn set_accepting(&self, accepting: bool) {
        self.inner.accepting.store(accepting, Ordering::SeqCst);
    }

    /// Shared flag behind [`Listener::set_accepting`], for owners that
    /// toggle acceptance from other threads after the listener moved.
    pub fn accepting_flag(&self) -> Arc<AtomicBool> {
        self.inner.accepting.clone()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(handle) = self.inner.handle.lock().take() {
            handle.remove();
        }
    }
}

impl ListenerInner {
    fn accept_ready(inner: &Arc<ListenerInner>) {
        loop {
            match inner.listener.accept() {
                Ok((stream, peer)) => {
                    if !inner.accepting.load(Ordering::SeqCst) {
                        debug!(%peer, "refusing connection while busy");
                        drop(stream);
                        continue;
                    }
                    info!(%peer, "client connected");
                    match Socket::attach(&inner.el, stream) {
                        Ok(sock) => {
                            if let Some(cb) = inner.connected_cb.lock().as_mut() {
                                cb(sock);
                            }
                        }
                        Err(err) => warn!(%err, "failed to set up client socket"),
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!(%err, "accept failed");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream;
    use std::time::Duration;

    #[test]
    fn accepts_a_client() {
        let el = EventLoop::new();
        let listener = Listener::bind(&el, 0).unwrap();
        let port = listener.port();

        let (tx, rx) = std::sync::mpsc::channel();
        listener.on_connected(Box::new(move |sock| {
            tx.send(sock).unwrap();
        }));
        listener.start();

        let runner_el = el.clone();
        let runner = std::thread::spawn(move || runner_el.run());

        let mut peer = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let sock = rx.recv_timeout(Duration::from_secs(2)).unwrap();

        use std::io::Write;
        peer.write_all(b"hi").unwrap();
        let mut buf = [0u8; 2];
        let n = sock
            .read_immediate(&mut buf, Some(Duration::from_secs(1)))
            .unwrap();
        assert_eq!(&buf[..n], b"hi");

        el.stop();
        runner.join().unwrap();
    }
}
