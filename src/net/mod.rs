//! TCP reactor layer shared by every external surface of the bridge.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags};

pub mod buffer;
pub mod client;
pub mod listener;
pub mod socket;

pub use buffer::CircularBuffer;
pub use client::Client;
pub use listener::Listener;
pub use socket::{Socket, SocketState};

/// Waits until `fd` is ready for reading and/or writing.
///
/// Returns `Ok(false)` on timeout. `timeout` of `None` waits forever.
pub(crate) fn wait_ready(
    fd: RawFd,
    read: bool,
    write: bool,
    timeout: Option<Duration>,
) -> io::Result<bool> {
    let mut flags = PollFlags::empty();
    if read {
        flags |= PollFlags::POLLIN;
    }
    if write {
        flags |= PollFlags::POLLOUT;
    }
    let borrowed_fd = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
    let mut fds = [PollFd::new(&borrowed_fd, flags)];
    let timeout_ms = match timeout {
        Some(t) => (t.as_millis() as i64).clamp(0, i32::MAX as i64) as i32,
        None => -1,
    };
    loop {
        match poll(&mut fds, timeout_ms) {
            Ok(0) => return Ok(false),
            Ok(_) => return Ok(true),
            Err(nix::errno::Errno::EINTR) => continue,
            Err(err) => return Err(io::Error::from_raw_os_error(err as i32)),
        }
    }
}
