//! Outbound TCP connections.

use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::socket::Socket;
use crate::event_loop::EventLoop;

pub type ConnectedCallback = Box<dyn FnOnce(Arc<Socket>) + Send>;
pub type ErrorCallback = Box<dyn FnOnce(io::Error) + Send>;

/// Mirror of [`super::Listener`] for the connecting side.
pub struct Client {
    el: EventLoop,
}

impl Client {
    pub fn new(el: &EventLoop) -> Client {
        Client { el: el.clone() }
    }

    /// Connects and reports the outcome through the callbacks.
    pub fn connect(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
        on_connected: ConnectedCallback,
        on_error: ErrorCallback,
    ) {
        match self.connect_blocking(host, port, timeout) {
            Ok(sock) => on_connected(sock),
            Err(err) => {
                warn!(host, port, %err, "connect failed");
                on_error(err);
            }
        }
    }

    /// Connects within `timeout` and returns the socket for immediate-mode
    /// use. This is the path the JTAG proxy cable takes.
    pub fn connect_blocking(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> io::Result<Arc<Socket>> {
        let mut last_err = io::Error::new(io::ErrorKind::NotFound, "address did not resolve");
        for addr in (host, port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    debug!(%addr, "connected");
                    return Socket::attach(&self.el, stream);
                }
                Err(err) => last_err = err,
            }
        }
        Err(last_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn connect_blocking_roundtrip() {
        let el = EventLoop::new();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let client = Client::new(&el);
        let sock = client
            .connect_blocking("127.0.0.1", port, Duration::from_secs(1))
            .unwrap();
        let (mut peer, _) = listener.accept().unwrap();

        sock.write_immediate(b"hello").unwrap();
        use std::io::Read;
        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn connect_refused_reports_error() {
        let el = EventLoop::new();
        let client = Client::new(&el);
        // Bind and drop to get a port nothing listens on.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        assert!(client
            .connect_blocking("127.0.0.1", port, Duration::from_millis(200))
            .is_err());
    }
}
