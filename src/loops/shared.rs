//! Layout of the structures the target firmware shares with the bridge.
//!
//! The bridge finds a pointer at a well-known address; it dereferences to
//! the debug structure below. Everything is little-endian 32-bit, matching
//! the target's view of its own memory.

/// Field offsets inside the debug structure.
pub mod debug_struct {
    /// Zeroed by the bridge to announce that printf output is collected
    /// on the host side.
    pub const USE_INTERNAL_PRINTF: u32 = 0x000;
    /// Bit 31 set means the program exited with the lower 31 bits as
    /// (sign-extended) status.
    pub const EXIT_STATUS: u32 = 0x004;
    /// Number of bytes waiting in the putc buffer.
    pub const PENDING_PUTCHAR: u32 = 0x008;
    pub const PUTC_BUFFER: u32 = 0x00C;
    pub const PUTC_BUFFER_LEN: usize = 256;
    /// Doorbell the bridge rings after completing a request.
    pub const NOTIF_REQ_ADDR: u32 = 0x10C;
    pub const NOTIF_REQ_VALUE: u32 = 0x110;
    /// Head of the singly linked request list.
    pub const FIRST_BRIDGE_REQ: u32 = 0x114;
    /// Set to one by the bridge when a request loop is watching.
    pub const BRIDGE_CONNECTED: u32 = 0x118;
    /// Target state word; non-zero means the target accepts accesses.
    pub const TARGET_STATE: u32 = 0x11C;
}

/// Field offsets inside one request node.
pub mod bridge_req {
    pub const NEXT: u32 = 0x00;
    pub const SIZE: u32 = 0x04;
    pub const KIND: u32 = 0x08;
    pub const DONE: u32 = 0x0C;
    pub const POPPED: u32 = 0x10;
    /// Start of the per-request payload union.
    pub const PAYLOAD: u32 = 0x14;

    /// Total bytes the bridge reads per node.
    pub const NODE_LEN: usize = 0x14 + 0x20;

    pub const KIND_CONNECT: u32 = 0;
    pub const KIND_DISCONNECT: u32 = 1;
    pub const KIND_OPEN: u32 = 2;
    pub const KIND_READ: u32 = 3;
    pub const KIND_WRITE: u32 = 4;
    pub const KIND_CLOSE: u32 = 5;
    pub const KIND_FB_OPEN: u32 = 6;
    pub const KIND_FB_UPDATE: u32 = 7;
    pub const KIND_TARGET_STATUS_SYNC: u32 = 8;

    /// `open` payload: name_len, name ptr, flags, mode, retval.
    pub const OPEN_NAME_LEN: u32 = PAYLOAD;
    pub const OPEN_NAME: u32 = PAYLOAD + 0x04;
    pub const OPEN_FLAGS: u32 = PAYLOAD + 0x08;
    pub const OPEN_MODE: u32 = PAYLOAD + 0x0C;
    pub const OPEN_RETVAL: u32 = PAYLOAD + 0x10;

    /// `read`/`write` payload: file, ptr, len, retval.
    pub const IO_FILE: u32 = PAYLOAD;
    pub const IO_PTR: u32 = PAYLOAD + 0x04;
    pub const IO_LEN: u32 = PAYLOAD + 0x08;
    pub const IO_RETVAL: u32 = PAYLOAD + 0x0C;

    /// `close` payload: file, retval.
    pub const CLOSE_FILE: u32 = PAYLOAD;
    pub const CLOSE_RETVAL: u32 = PAYLOAD + 0x04;

    /// `fb_open` payload: name_len, name ptr, width, height, format,
    /// screen handle (64 bit).
    pub const FB_OPEN_NAME_LEN: u32 = PAYLOAD;
    pub const FB_OPEN_NAME: u32 = PAYLOAD + 0x04;
    pub const FB_OPEN_WIDTH: u32 = PAYLOAD + 0x08;
    pub const FB_OPEN_HEIGHT: u32 = PAYLOAD + 0x0C;
    pub const FB_OPEN_FORMAT: u32 = PAYLOAD + 0x10;
    pub const FB_OPEN_SCREEN: u32 = PAYLOAD + 0x14;

    /// `fb_update` payload: screen handle (64 bit), addr, posx, posy,
    /// width, height.
    pub const FB_UPDATE_SCREEN: u32 = PAYLOAD;
    pub const FB_UPDATE_ADDR: u32 = PAYLOAD + 0x08;
    pub const FB_UPDATE_POSX: u32 = PAYLOAD + 0x0C;
    pub const FB_UPDATE_POSY: u32 = PAYLOAD + 0x10;
    pub const FB_UPDATE_WIDTH: u32 = PAYLOAD + 0x14;
    pub const FB_UPDATE_HEIGHT: u32 = PAYLOAD + 0x18;
}

/// Framebuffer pixel formats of `fb_open`.
pub const FB_FORMAT_GRAY: u32 = 1;
