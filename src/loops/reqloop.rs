//! Semihosting request looper.
//!
//! Target firmware queues `hal_bridge_req` nodes on a singly linked list.
//! Each tick pops pending nodes, services them against host-side files or
//! the framebuffer hook, writes the result back and rings the notification
//! doorbell so the target can continue.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::shared::bridge_req::*;
use super::shared::debug_struct;
use super::{LoopContext, Looper, LooperStatus};
use crate::cable::CableError;

/// Largest chunk moved between a host file and target memory at once.
const IO_CHUNK: usize = 4096;
/// Requests serviced per tick before yielding back to the manager.
const MAX_REQS_PER_TICK: usize = 64;

/// Host-side rendering sink for target framebuffer updates.
pub trait Framebuffer: Send {
    fn update(&mut self, pixels: &[u8], posx: i32, posy: i32, width: u32, height: u32);
}

/// Creates a framebuffer window, or refuses (`None`).
pub type FramebufferFactory =
    Arc<dyn Fn(&str, u32, u32, u32) -> Option<Box<dyn Framebuffer>> + Send + Sync>;

/// Default hook: no rendering backend is compiled in.
pub fn null_framebuffer_factory() -> FramebufferFactory {
    Arc::new(|name, _, _, _| {
        error!(name, "framebuffer requested but no rendering backend is available");
        None
    })
}

struct FbSlot {
    fb: Box<dyn Framebuffer>,
    width: u32,
    height: u32,
}

enum HostFile {
    Stdin,
    Stdout,
    Stderr,
    File(File),
}

pub struct Reqloop {
    files: HashMap<u32, HostFile>,
    next_fd: u32,
    framebuffers: HashMap<u64, FbSlot>,
    next_screen: u64,
    fb_factory: FramebufferFactory,
}

impl Reqloop {
    pub fn new(fb_factory: FramebufferFactory) -> Reqloop {
        let mut files = HashMap::new();
        files.insert(0, HostFile::Stdin);
        files.insert(1, HostFile::Stdout);
        files.insert(2, HostFile::Stderr);
        Reqloop {
            files,
            next_fd: 3,
            framebuffers: HashMap::new(),
            next_screen: 1,
            fb_factory,
        }
    }

    /// Marks the request done and rings the notification doorbell.
    fn reply_req(&self, ctx: &LoopContext, req_addr: u32) -> Result<(), CableError> {
        ctx.adapter.write_u32(req_addr + DONE, 1)?;
        let notif_addr = ctx.read_u32(debug_struct::NOTIF_REQ_ADDR)?;
        let notif_value = ctx.read_u32(debug_struct::NOTIF_REQ_VALUE)?;
        ctx.adapter.write_u32(notif_addr, notif_value)
    }

    /// Reads a NUL-terminated name out of target memory.
    fn read_name(&self, ctx: &LoopContext, addr: u32, len: u32) -> Result<String, CableError> {
        let mut raw = vec![0u8; len as usize + 1];
        ctx.adapter.read(addr, &mut raw)?;
        while raw.last() == Some(&0) {
            raw.pop();
        }
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    fn handle_open(&mut self, ctx: &LoopContext, req_addr: u32) -> Result<(), CableError> {
        let name_len = ctx.adapter.read_u32(req_addr + OPEN_NAME_LEN)?;
        let name_ptr = ctx.adapter.read_u32(req_addr + OPEN_NAME)?;
        let flags = ctx.adapter.read_u32(req_addr + OPEN_FLAGS)?;
        let name = self.read_name(ctx, name_ptr, name_len)?;

        // Newlib-style open flags.
        let writing = flags & 0x3 != 0;
        let mut options = OpenOptions::new();
        options
            .read(flags & 0x3 != 0x1)
            .write(writing)
            .append(flags & 0x8 != 0)
            .create(flags & 0x200 != 0)
            .truncate(flags & 0x400 != 0);
        if flags & 0x800 != 0 {
            options.create_new(true);
        }

        let retval = match options.open(&name) {
            Ok(file) => {
                let fd = self.next_fd;
                self.next_fd += 1;
                self.files.insert(fd, HostFile::File(file));
                info!(name, fd, "opened file for target");
                fd as i32
            }
            Err(err) => {
                warn!(name, %err, "target open failed");
                -1
            }
        };
        ctx.adapter.write_u32(req_addr + OPEN_RETVAL, retval as u32)?;
        self.reply_req(ctx, req_addr)
    }

    fn handle_read(&mut self, ctx: &LoopContext, req_addr: u32) -> Result<(), CableError> {
        let fd = ctx.adapter.read_u32(req_addr + IO_FILE)?;
        let mut ptr = ctx.adapter.read_u32(req_addr + IO_PTR)?;
        let mut size = ctx.adapter.read_u32(req_addr + IO_LEN)? as usize;
        let mut result: i32 = 0;

        while size > 0 {
            let mut chunk = vec![0u8; size.min(IO_CHUNK)];
            let n = match self.files.get_mut(&fd) {
                Some(HostFile::File(file)) => file.read(&mut chunk),
                Some(HostFile::Stdin) => std::io::stdin().read(&mut chunk),
                _ => Err(std::io::ErrorKind::InvalidInput.into()),
            };
            match n {
                Ok(0) => break,
                Ok(n) => {
                    ctx.adapter.write(ptr, &chunk[..n])?;
                    result += n as i32;
                    ptr += n as u32;
                    size -= n;
                }
                Err(_) => {
                    if result == 0 {
                        result = -1;
                    }
                    break;
                }
            }
        }

        ctx.adapter.write_u32(req_addr + IO_RETVAL, result as u32)?;
        self.reply_req(ctx, req_addr)
    }

    fn handle_write(&mut self, ctx: &LoopContext, req_addr: u32) -> Result<(), CableError> {
        let fd = ctx.adapter.read_u32(req_addr + IO_FILE)?;
        let mut ptr = ctx.adapter.read_u32(req_addr + IO_PTR)?;
        let mut size = ctx.adapter.read_u32(req_addr + IO_LEN)? as usize;
        let mut result: i32 = 0;

        while size > 0 {
            let mut chunk = vec![0u8; size.min(IO_CHUNK)];
            ctx.adapter.read(ptr, &mut chunk)?;
            let n = match self.files.get_mut(&fd) {
                Some(HostFile::File(file)) => file.write(&chunk),
                Some(HostFile::Stdout) => std::io::stdout().write(&chunk),
                Some(HostFile::Stderr) => std::io::stderr().write(&chunk),
                Some(HostFile::Stdin) | None => Err(std::io::ErrorKind::InvalidInput.into()),
            };
            match n {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    result += n as i32;
                    ptr += n as u32;
                    size -= n;
                }
            }
        }
        if result == 0 {
            result = -1;
        }

        ctx.adapter.write_u32(req_addr + IO_RETVAL, result as u32)?;
        self.reply_req(ctx, req_addr)
    }

    fn handle_close(&mut self, ctx: &LoopContext, req_addr: u32) -> Result<(), CableError> {
        let fd = ctx.adapter.read_u32(req_addr + CLOSE_FILE)?;
        let retval = match self.files.remove(&fd) {
            Some(HostFile::File(_)) => 0i32,
            Some(other) => {
                // The standard streams stay open.
                self.files.insert(fd, other);
                0
            }
            None => -1,
        };
        debug!(fd, retval, "target closed file");
        ctx.adapter.write_u32(req_addr + CLOSE_RETVAL, retval as u32)?;
        self.reply_req(ctx, req_addr)
    }

    fn handle_fb_open(&mut self, ctx: &LoopContext, req_addr: u32) -> Result<(), CableError> {
        let name_len = ctx.adapter.read_u32(req_addr + FB_OPEN_NAME_LEN)?;
        let name_ptr = ctx.adapter.read_u32(req_addr + FB_OPEN_NAME)?;
        let width = ctx.adapter.read_u32(req_addr + FB_OPEN_WIDTH)?;
        let height = ctx.adapter.read_u32(req_addr + FB_OPEN_HEIGHT)?;
        let format = ctx.adapter.read_u32(req_addr + FB_OPEN_FORMAT)?;
        let name = self.read_name(ctx, name_ptr, name_len)?;

        let screen = match (self.fb_factory)(&name, width, height, format) {
            Some(fb) => {
                let screen = self.next_screen;
                self.next_screen += 1;
                self.framebuffers.insert(screen, FbSlot { fb, width, height });
                info!(name, width, height, format, "framebuffer opened");
                screen
            }
            None => 0,
        };
        ctx.adapter
            .write(req_addr + FB_OPEN_SCREEN, &screen.to_le_bytes())?;
        self.reply_req(ctx, req_addr)
    }

    fn handle_fb_update(&mut self, ctx: &LoopContext, req_addr: u32) -> Result<(), CableError> {
        let mut screen_raw = [0u8; 8];
        ctx.adapter.read(req_addr + FB_UPDATE_SCREEN, &mut screen_raw)?;
        let screen = u64::from_le_bytes(screen_raw);
        let addr = ctx.adapter.read_u32(req_addr + FB_UPDATE_ADDR)?;
        let mut posx = ctx.adapter.read_u32(req_addr + FB_UPDATE_POSX)? as i32;
        let mut posy = ctx.adapter.read_u32(req_addr + FB_UPDATE_POSY)? as i32;
        let mut width = ctx.adapter.read_u32(req_addr + FB_UPDATE_WIDTH)?;
        let mut height = ctx.adapter.read_u32(req_addr + FB_UPDATE_HEIGHT)?;

        if let Some(slot) = self.framebuffers.get_mut(&screen) {
            if posx == -1 {
                posx = 0;
                posy = 0;
                width = slot.width;
                height = slot.height;
            }
            let mut pixels = vec![0u8; width as usize * height as usize];
            ctx.adapter.read(addr, &mut pixels)?;
            slot.fb.update(&pixels, posx, posy, width, height);
        } else {
            warn!(screen, "framebuffer update for an unknown screen");
        }
        self.reply_req(ctx, req_addr)
    }

    fn handle_status_sync(&mut self, ctx: &LoopContext, req_addr: u32) -> Result<(), CableError> {
        let state = ctx.read_u32(debug_struct::TARGET_STATE)?;
        debug!(state, "target status sync");
        self.reply_req(ctx, req_addr)
    }

    /// Pops and services one request. Returns the looper status to apply,
    /// or `None` when the queue is empty.
    fn handle_one_req(&mut self, ctx: &LoopContext) -> Result<Option<LooperStatus>, CableError> {
        let req_addr = ctx.read_u32(debug_struct::FIRST_BRIDGE_REQ)?;
        if req_addr == 0 {
            return Ok(None);
        }

        let kind = ctx.adapter.read_u32(req_addr + KIND)?;
        let next = ctx.adapter.read_u32(req_addr + NEXT)?;

        // Unlink before servicing, the target may queue more behind it.
        ctx.adapter.write_u32(req_addr + POPPED, 1)?;
        ctx.write_u32(debug_struct::FIRST_BRIDGE_REQ, next)?;

        debug!(kind, req = format_args!("{req_addr:#010x}"), "bridge request");
        match kind {
            KIND_CONNECT => {
                self.reply_req(ctx, req_addr)?;
                Ok(Some(LooperStatus::Continue))
            }
            KIND_DISCONNECT => {
                info!("target disconnected from the bridge");
                self.reply_req(ctx, req_addr)?;
                Ok(Some(LooperStatus::Stop))
            }
            KIND_OPEN => {
                self.handle_open(ctx, req_addr)?;
                Ok(Some(LooperStatus::Continue))
            }
            KIND_READ => {
                self.handle_read(ctx, req_addr)?;
                Ok(Some(LooperStatus::Continue))
            }
            KIND_WRITE => {
                self.handle_write(ctx, req_addr)?;
                Ok(Some(LooperStatus::Continue))
            }
            KIND_CLOSE => {
                self.handle_close(ctx, req_addr)?;
                Ok(Some(LooperStatus::Continue))
            }
            KIND_FB_OPEN => {
                self.handle_fb_open(ctx, req_addr)?;
                Ok(Some(LooperStatus::Continue))
            }
            KIND_FB_UPDATE => {
                self.handle_fb_update(ctx, req_addr)?;
                Ok(Some(LooperStatus::Continue))
            }
            KIND_TARGET_STATUS_SYNC => {
                self.handle_status_sync(ctx, req_addr)?;
                Ok(Some(LooperStatus::Continue))
            }
            other => {
                error!(kind = other, "unknown bridge request");
                self.reply_req(ctx, req_addr)?;
                Ok(Some(LooperStatus::Continue))
            }
        }
    }
}

impl Looper for Reqloop {
    fn register_proc(&mut self, ctx: &LoopContext) -> Result<LooperStatus, CableError> {
        // Tell the freshly booted runtime someone is watching its queue.
        ctx.write_u32(debug_struct::BRIDGE_CONNECTED, 1)?;
        Ok(LooperStatus::Continue)
    }

    fn loop_proc(&mut self, ctx: &LoopContext) -> Result<LooperStatus, CableError> {
        for _ in 0..MAX_REQS_PER_TICK {
            match self.handle_one_req(ctx)? {
                None => break,
                Some(LooperStatus::Continue) => continue,
                Some(status) => return Ok(status),
            }
        }
        Ok(LooperStatus::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cable::sim::{SimCable, SimDevice};
    use crate::cable::AdvDebugUnit;
    use crate::config::{AdvDbgConfig, LoopConfig};
    use crate::event_loop::EventLoop;
    use crate::loops::LoopManager;
    use parking_lot::Mutex;
    use std::time::Duration;

    const DEBUG_STRUCT_PTR: u32 = 0x1000;
    const DEBUG_STRUCT: u32 = 0x2000;
    const REQ: u32 = 0x3000;
    const NOTIF_TARGET: u32 = 0x4000;

    fn setup(fb: FramebufferFactory) -> (LoopManager, EventLoop, SimCable) {
        let cable = SimCable::new(vec![SimDevice::new(0x1234_5677)]);
        let handle = cable.clone();
        let adapter =
            AdvDebugUnit::connect(Box::new(cable), &AdvDbgConfig::default(), false).unwrap();
        let el = EventLoop::new();
        let manager = LoopManager::new(
            &el,
            adapter,
            &LoopConfig {
                debug_struct_addr: DEBUG_STRUCT_PTR,
                fast_usecs: 500,
                slow_usecs: 10_000_000,
                check_available: false,
            },
        );
        handle.memory().write_u32(DEBUG_STRUCT_PTR, DEBUG_STRUCT);
        handle
            .memory()
            .write_u32(DEBUG_STRUCT + debug_struct::NOTIF_REQ_ADDR, NOTIF_TARGET);
        handle
            .memory()
            .write_u32(DEBUG_STRUCT + debug_struct::NOTIF_REQ_VALUE, 0xCAFE);
        manager.add_looper(Box::new(Reqloop::new(fb)));
        (manager, el, handle)
    }

    fn run_for(el: &EventLoop, duration: Duration) {
        let stopper = el.clone();
        let thread = std::thread::spawn(move || {
            std::thread::sleep(duration);
            stopper.stop();
        });
        el.run();
        thread.join().unwrap();
    }

    fn queue_req(sim: &SimCable, kind: u32) {
        sim.memory().write_u32(REQ + KIND, kind);
        sim.memory().write_u32(REQ + NEXT, 0);
        sim.memory().write_u32(REQ + DONE, 0);
        sim.memory().write_u32(REQ + POPPED, 0);
        sim.memory()
            .write_u32(DEBUG_STRUCT + debug_struct::FIRST_BRIDGE_REQ, REQ);
    }

    #[test]
    fn connect_request_is_acknowledged() {
        let (manager, el, sim) = setup(null_framebuffer_factory());
        queue_req(&sim, KIND_CONNECT);
        manager.start(true);
        run_for(&el, Duration::from_millis(50));

        assert_eq!(sim.memory().read_u32(REQ + DONE), 1);
        assert_eq!(sim.memory().read_u32(REQ + POPPED), 1);
        // The queue head was advanced and the doorbell rung.
        assert_eq!(
            sim.memory()
                .read_u32(DEBUG_STRUCT + debug_struct::FIRST_BRIDGE_REQ),
            0
        );
        assert_eq!(sim.memory().read_u32(NOTIF_TARGET), 0xCAFE);
        // Registration announced the bridge.
        assert_eq!(
            sim.memory()
                .read_u32(DEBUG_STRUCT + debug_struct::BRIDGE_CONNECTED),
            1
        );
    }

    struct RecordingFb(Arc<Mutex<Vec<(i32, i32, u32, u32, Vec<u8>)>>>);

    impl Framebuffer for RecordingFb {
        fn update(&mut self, pixels: &[u8], posx: i32, posy: i32, width: u32, height: u32) {
            self.0
                .lock()
                .push((posx, posy, width, height, pixels.to_vec()));
        }
    }

    #[test]
    fn fb_open_and_update_roundtrip() {
        let updates: Arc<Mutex<Vec<(i32, i32, u32, u32, Vec<u8>)>>> =
            Arc::new(Mutex::new(Vec::new()));
        let records = updates.clone();
        let factory: FramebufferFactory = Arc::new(move |_name, _w, _h, _fmt| {
            Some(Box::new(RecordingFb(records.clone())) as Box<dyn Framebuffer>)
        });
        let (manager, el, sim) = setup(factory);

        // fb_open: 4x2 gray screen named "lcd".
        sim.memory().write(0x5000, b"lcd\0");
        sim.memory().write_u32(REQ + FB_OPEN_NAME_LEN, 3);
        sim.memory().write_u32(REQ + FB_OPEN_NAME, 0x5000);
        sim.memory().write_u32(REQ + FB_OPEN_WIDTH, 4);
        sim.memory().write_u32(REQ + FB_OPEN_HEIGHT, 2);
        sim.memory().write_u32(REQ + FB_OPEN_FORMAT, super::super::shared::FB_FORMAT_GRAY);
        queue_req(&sim, KIND_FB_OPEN);
        manager.start(true);
        run_for(&el, Duration::from_millis(50));

        let screen = sim.memory().read_u32(REQ + FB_OPEN_SCREEN);
        assert_eq!(screen, 1);
        assert_eq!(sim.memory().read_u32(REQ + DONE), 1);

        // fb_update: full frame via posx == -1.
        let pixels: Vec<u8> = (0u8..8).collect();
        sim.memory().write(0x6000, &pixels);
        sim.memory().write(REQ + FB_UPDATE_SCREEN, &1u64.to_le_bytes());
        sim.memory().write_u32(REQ + FB_UPDATE_ADDR, 0x6000);
        sim.memory().write_u32(REQ + FB_UPDATE_POSX, -1i32 as u32);
        sim.memory().write_u32(REQ + FB_UPDATE_POSY, 0);
        sim.memory().write_u32(REQ + FB_UPDATE_WIDTH, 0);
        sim.memory().write_u32(REQ + FB_UPDATE_HEIGHT, 0);
        queue_req(&sim, KIND_FB_UPDATE);
        manager.start(true);
        run_for(&el, Duration::from_millis(50));

        let updates = updates.lock();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0], (0, 0, 4, 2, pixels));
    }

    #[test]
    fn file_roundtrip_through_target_memory() {
        let (manager, el, sim) = setup(null_framebuffer_factory());
        let dir = std::env::temp_dir().join("riscv-debug-bridge-reqloop-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("io.txt");
        std::fs::write(&path, b"target data").unwrap();
        let path_str = path.to_str().unwrap().to_owned();

        // open(path, O_RDONLY)
        let name = format!("{path_str}\0");
        sim.memory().write(0x5000, name.as_bytes());
        sim.memory()
            .write_u32(REQ + OPEN_NAME_LEN, path_str.len() as u32);
        sim.memory().write_u32(REQ + OPEN_NAME, 0x5000);
        sim.memory().write_u32(REQ + OPEN_FLAGS, 0);
        sim.memory().write_u32(REQ + OPEN_MODE, 0);
        queue_req(&sim, KIND_OPEN);
        manager.start(true);
        run_for(&el, Duration::from_millis(50));

        let fd = sim.memory().read_u32(REQ + OPEN_RETVAL);
        assert_eq!(fd, 3, "first allocated descriptor");

        // read(fd, 0x7000, 11)
        sim.memory().write_u32(REQ + IO_FILE, fd);
        sim.memory().write_u32(REQ + IO_PTR, 0x7000);
        sim.memory().write_u32(REQ + IO_LEN, 11);
        queue_req(&sim, KIND_READ);
        manager.start(true);
        run_for(&el, Duration::from_millis(50));

        assert_eq!(sim.memory().read_u32(REQ + IO_RETVAL), 11);
        let mut data = [0u8; 11];
        sim.memory().read(0x7000, &mut data);
        assert_eq!(&data, b"target data");

        // close(fd)
        sim.memory().write_u32(REQ + CLOSE_FILE, fd);
        queue_req(&sim, KIND_CLOSE);
        manager.start(true);
        run_for(&el, Duration::from_millis(50));
        assert_eq!(sim.memory().read_u32(REQ + CLOSE_RETVAL), 0);

        std::fs::remove_file(&path).ok();
    }
}
