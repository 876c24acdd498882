//! Single-threaded cooperative reactor.
//!
//! One thread calls [`EventLoop::run`]; every callback fires on that thread.
//! Timers and file watches may be re-armed from any thread, a self-wake
//! channel interrupts the poll when that happens. Timer deadlines are
//! derived from the previous deadline rather than from "now", so a slow
//! callback does not make a periodic timer drift.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags};
use parking_lot::Mutex;
use tracing::{trace, warn};

/// Readiness interest of a file watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEvents {
    None,
    Readable,
    Writable,
    Both,
}

impl FileEvents {
    pub fn wants_read(self) -> bool {
        matches!(self, FileEvents::Readable | FileEvents::Both)
    }

    pub fn wants_write(self) -> bool {
        matches!(self, FileEvents::Writable | FileEvents::Both)
    }

    pub fn combine(read: bool, write: bool) -> FileEvents {
        match (read, write) {
            (true, true) => FileEvents::Both,
            (true, false) => FileEvents::Readable,
            (false, true) => FileEvents::Writable,
            (false, false) => FileEvents::None,
        }
    }
}

/// A timer callback returns the delay until its next firing, or `None` when
/// it is done.
pub type TimerCallback = Box<dyn FnMut() -> Option<Duration> + Send>;
pub type FileCallback = Box<dyn FnMut(FileEvents) + Send>;

struct TimerSlot {
    deadline: Option<Instant>,
    /// Bumped by every external re-arm, so a `set_timeout` racing with the
    /// callback wins over the callback's return value.
    epoch: u64,
    /// Taken out while the callback runs.
    cb: Option<TimerCallback>,
    /// One-shot timers are removed once they report done.
    persistent: bool,
}

struct FileSlot {
    fd: RawFd,
    events: FileEvents,
    cb: Option<FileCallback>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    timers: HashMap<u64, TimerSlot>,
    files: HashMap<u64, FileSlot>,
    stop: bool,
}

struct Inner {
    state: Mutex<State>,
    wake_tx: UnixStream,
}

impl Inner {
    fn wake(&self) {
        // A full wake channel already guarantees a wakeup.
        let _ = (&self.wake_tx).write(&[0u8]);
    }
}

/// Cheaply clonable handle to the reactor.
#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<Inner>,
    wake_rx: Arc<UnixStream>,
}

/// Handle to a persistent timer. The timer stays registered when it reports
/// done and can be re-armed with [`TimerHandle::set_timeout`].
#[derive(Clone)]
pub struct TimerHandle {
    inner: Weak<Inner>,
    id: u64,
}

impl TimerHandle {
    /// Arms the timer to fire `delay` from now, or parks it with `None`.
    pub fn set_timeout(&self, delay: Option<Duration>) {
        if let Some(inner) = self.inner.upgrade() {
            {
                let mut state = inner.state.lock();
                if let Some(slot) = state.timers.get_mut(&self.id) {
                    slot.deadline = delay.map(|d| Instant::now() + d);
                    slot.epoch += 1;
                }
            }
            inner.wake();
        }
    }

    /// Unregisters the timer.
    pub fn cancel(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.state.lock().timers.remove(&self.id);
            inner.wake();
        }
    }
}

/// Handle to a file watch.
#[derive(Clone)]
pub struct FileHandle {
    inner: Weak<Inner>,
    id: u64,
}

impl FileHandle {
    pub fn set_events(&self, events: FileEvents) {
        if let Some(inner) = self.inner.upgrade() {
            {
                let mut state = inner.state.lock();
                if let Some(slot) = state.files.get_mut(&self.id) {
                    slot.events = events;
                }
            }
            inner.wake();
        }
    }

    pub fn remove(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.state.lock().files.remove(&self.id);
            inner.wake();
        }
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    pub fn new() -> Self {
        let (wake_tx, wake_rx) = UnixStream::pair().expect("wake channel");
        wake_tx
            .set_nonblocking(true)
            .expect("wake channel nonblocking");
        wake_rx
            .set_nonblocking(true)
            .expect("wake channel nonblocking");
        EventLoop {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                wake_tx,
            }),
            wake_rx: Arc::new(wake_rx),
        }
    }

    /// Registers a persistent timer. It starts parked; arm it with
    /// [`TimerHandle::set_timeout`].
    pub fn timer(&self, cb: TimerCallback) -> TimerHandle {
        self.register_timer(cb, None, true)
    }

    /// Fire-and-forget timer firing `delay` from now. It reschedules itself
    /// through its return value and is unregistered once it returns `None`.
    pub fn spawn_timer(&self, delay: Duration, cb: TimerCallback) -> TimerHandle {
        self.register_timer(cb, Some(Instant::now() + delay), false)
    }

    fn register_timer(
        &self,
        cb: TimerCallback,
        deadline: Option<Instant>,
        persistent: bool,
    ) -> TimerHandle {
        let id = {
            let mut state = self.inner.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.timers.insert(
                id,
                TimerSlot {
                    deadline,
                    epoch: 0,
                    cb: Some(cb),
                    persistent,
                },
            );
            id
        };
        self.inner.wake();
        TimerHandle {
            inner: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Watches a file descriptor. The caller keeps ownership of the fd and
    /// must remove the watch before closing it.
    pub fn file(&self, fd: RawFd, events: FileEvents, cb: FileCallback) -> FileHandle {
        let id = {
            let mut state = self.inner.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.files.insert(
                id,
                FileSlot {
                    fd,
                    events,
                    cb: Some(cb),
                },
            );
            id
        };
        self.inner.wake();
        FileHandle {
            inner: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Asks a running [`EventLoop::run`] to return.
    pub fn stop(&self) {
        self.inner.state.lock().stop = true;
        self.inner.wake();
    }

    /// Blocks the calling thread dispatching timers and file events until
    /// the event set becomes empty or [`EventLoop::stop`] is called.
    pub fn run(&self) {
        loop {
            let mut due: Vec<(u64, TimerCallback, Instant, u64)> = Vec::new();
            let mut poll_set: Vec<(u64, RawFd, PollFlags)> = Vec::new();
            let timeout_ms;
            {
                let mut state = self.inner.state.lock();
                if state.stop {
                    state.stop = false;
                    return;
                }

                let now = Instant::now();
                let mut next_deadline: Option<Instant> = None;
                for (id, slot) in state.timers.iter_mut() {
                    match slot.deadline {
                        Some(deadline) if deadline <= now => {
                            if let Some(cb) = slot.cb.take() {
                                due.push((*id, cb, deadline, slot.epoch));
                            }
                        }
                        Some(deadline) => {
                            next_deadline =
                                Some(next_deadline.map_or(deadline, |d| d.min(deadline)));
                        }
                        None => {}
                    }
                }

                for (id, slot) in state.files.iter() {
                    let mut flags = PollFlags::empty();
                    if slot.events.wants_read() {
                        flags |= PollFlags::POLLIN;
                    }
                    if slot.events.wants_write() {
                        flags |= PollFlags::POLLOUT;
                    }
                    if !flags.is_empty() {
                        poll_set.push((*id, slot.fd, flags));
                    }
                }

                let any_armed = state
                    .timers
                    .values()
                    .any(|slot| slot.deadline.is_some() || slot.cb.is_none());
                if due.is_empty() && !any_armed && state.files.is_empty() {
                    trace!("event set empty, leaving loop");
                    return;
                }

                timeout_ms = if !due.is_empty() {
                    0
                } else {
                    match next_deadline {
                        Some(deadline) => {
                            let remaining = deadline.saturating_duration_since(now);
                            (remaining.as_millis() as i64).clamp(1, i32::MAX as i64) as i32
                        }
                        None => -1,
                    }
                };
            }

            if due.is_empty() {
                self.poll_files(&poll_set, timeout_ms);
            }

            for (id, mut cb, deadline, epoch) in due {
                let next = cb();
                let mut state = self.inner.state.lock();
                let remove = match state.timers.get_mut(&id) {
                    Some(slot) => {
                        if slot.epoch == epoch {
                            // Reschedule relative to the old deadline so the
                            // period does not drift.
                            slot.deadline = next.map(|d| deadline + d);
                        }
                        if slot.deadline.is_none() && !slot.persistent {
                            true
                        } else {
                            slot.cb = Some(cb);
                            false
                        }
                    }
                    // Cancelled while running.
                    None => {
                        drop(cb);
                        false
                    }
                };
                if remove {
                    state.timers.remove(&id);
                }
            }
        }
    }

    fn poll_files(&self, poll_set: &[(u64, RawFd, PollFlags)], timeout_ms: i32) {
        let mut fds: Vec<PollFd> = Vec::with_capacity(poll_set.len() + 1);
        let wake_fd = unsafe { BorrowedFd::borrow_raw(self.wake_rx.as_raw_fd()) };
        fds.push(PollFd::new(&wake_fd, PollFlags::POLLIN));
        let borrowed_fds: Vec<BorrowedFd> = poll_set
            .iter()
            .map(|(_, fd, _)| unsafe { BorrowedFd::borrow_raw(*fd) })
            .collect();
        for ((_, _, flags), bfd) in poll_set.iter().zip(borrowed_fds.iter()) {
            fds.push(PollFd::new(bfd, *flags));
        }

        let ready: Vec<(u64, FileEvents)> = match poll(&mut fds, timeout_ms) {
            Ok(0) => return,
            Ok(_) => {
                let mut ready = Vec::new();
                if fds[0]
                    .revents()
                    .is_some_and(|r| r.contains(PollFlags::POLLIN))
                {
                    let mut sink = [0u8; 64];
                    while matches!((&*self.wake_rx).read(&mut sink), Ok(n) if n > 0) {}
                }
                for (pfd, (id, _, _)) in fds[1..].iter().zip(poll_set) {
                    let revents = pfd.revents().unwrap_or(PollFlags::empty());
                    let read = revents
                        .intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR);
                    let write = revents.intersects(PollFlags::POLLOUT | PollFlags::POLLERR);
                    if read || write {
                        ready.push((*id, FileEvents::combine(read, write)));
                    }
                }
                ready
            }
            Err(nix::errno::Errno::EINTR) => return,
            Err(err) => {
                warn!(%err, "poll failed");
                return;
            }
        };

        for (id, events) in ready {
            let cb = self
                .inner
                .state
                .lock()
                .files
                .get_mut(&id)
                .and_then(|slot| slot.cb.take());
            if let Some(mut cb) = cb {
                cb(events);
                if let Some(slot) = self.inner.state.lock().files.get_mut(&id) {
                    slot.cb = Some(cb);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn one_shot_timer_fires_once() {
        let el = EventLoop::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        el.spawn_timer(Duration::from_millis(1), Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            None
        }));
        el.run();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn repeating_timer_reschedules_itself() {
        let el = EventLoop::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        el.spawn_timer(Duration::from_millis(1), Box::new(move || {
            if counter.fetch_add(1, Ordering::SeqCst) < 4 {
                Some(Duration::from_millis(1))
            } else {
                None
            }
        }));
        el.run();
        assert_eq!(fired.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn parked_persistent_timer_does_not_hold_the_loop() {
        let el = EventLoop::new();
        let _parked = el.timer(Box::new(|| None));
        // No armed timer and no file: run returns immediately.
        el.run();
    }

    #[test]
    fn timer_rearmed_from_another_thread() {
        let el = EventLoop::new();
        // A far-future timer keeps the loop from draining early.
        el.spawn_timer(Duration::from_secs(3600), Box::new(|| None));

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let handle = el.timer(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            None
        }));

        let rearm = handle.clone();
        let stopper = el.clone();
        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            rearm.set_timeout(Some(Duration::from_millis(1)));
            std::thread::sleep(Duration::from_millis(30));
            stopper.stop();
        });

        el.run();
        thread.join().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_interrupts_run() {
        let el = EventLoop::new();
        // An armed timer far in the future keeps the loop alive.
        el.spawn_timer(Duration::from_secs(3600), Box::new(|| None));
        let stopper = el.clone();
        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            stopper.stop();
        });
        el.run();
        thread.join().unwrap();
    }
}
