//! Per-descriptor metadata
//!
//! The hook layer consults an `FdCtx` before rewriting a call: only managed
//! sockets that the application left in blocking mode take the fiber path.
//! Creating a context for a socket forces the OS-level O_NONBLOCK flag on
//! (so workers can yield instead of blocking) while the application's own
//! blocking intent is tracked separately in `user_nonblock` and re-applied
//! on every fcntl the application issues.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

/// Which of the two per-socket timeouts a call consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// SO_RCVTIMEO: read/recv/accept family
    Recv,
    /// SO_SNDTIMEO: write/send family
    Send,
}

/// Per-descriptor state.
pub struct FdCtx {
    fd: RawFd,
    is_init: AtomicBool,
    is_socket: AtomicBool,
    sys_nonblock: AtomicBool,
    user_nonblock: AtomicBool,
    is_closed: AtomicBool,
    /// Milliseconds; -1 = no timeout
    recv_timeout_ms: AtomicI64,
    send_timeout_ms: AtomicI64,
}

impl FdCtx {
    fn new(fd: RawFd) -> FdCtx {
        let ctx = FdCtx {
            fd,
            is_init: AtomicBool::new(false),
            is_socket: AtomicBool::new(false),
            sys_nonblock: AtomicBool::new(false),
            user_nonblock: AtomicBool::new(false),
            is_closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicI64::new(-1),
            send_timeout_ms: AtomicI64::new(-1),
        };
        ctx.init();
        ctx
    }

    /// Probe the descriptor type and, for sockets, force the OS-level
    /// non-blocking flag on.
    fn init(&self) {
        if self.is_init.load(Ordering::Acquire) {
            return;
        }
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(self.fd, &mut st) } == -1 {
            self.is_socket.store(false, Ordering::Release);
        } else {
            self.is_init.store(true, Ordering::Release);
            let is_sock = (st.st_mode & libc::S_IFMT) == libc::S_IFSOCK;
            self.is_socket.store(is_sock, Ordering::Release);
        }

        if self.is_socket.load(Ordering::Acquire) {
            let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL, 0) };
            if flags & libc::O_NONBLOCK == 0 {
                unsafe { libc::fcntl(self.fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            }
            self.sys_nonblock.store(true, Ordering::Release);
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn is_socket(&self) -> bool {
        self.is_socket.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_closed(&self) {
        self.is_closed.store(true, Ordering::Release);
    }

    /// The non-blocking flag the runtime imposed (sockets only).
    #[inline]
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Acquire)
    }

    /// The non-blocking mode the application itself asked for.
    #[inline]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_user_nonblock(&self, v: bool) {
        self.user_nonblock.store(v, Ordering::Release);
    }

    /// Timeout in ms for the given direction; -1 = none.
    pub fn timeout(&self, kind: TimeoutKind) -> i64 {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.load(Ordering::Acquire),
            TimeoutKind::Send => self.send_timeout_ms.load(Ordering::Acquire),
        }
    }

    pub fn set_timeout(&self, kind: TimeoutKind, ms: i64) {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.store(ms, Ordering::Release),
            TimeoutKind::Send => self.send_timeout_ms.store(ms, Ordering::Release),
        }
    }
}

/// Growable fd → FdCtx table.
pub struct FdManager {
    slots: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

impl FdManager {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(vec![None; 64]),
        }
    }

    /// Look up (and with `auto_create`, lazily build) the context for `fd`.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;
        {
            let slots = self.slots.read().unwrap();
            if idx < slots.len() {
                if let Some(ctx) = &slots[idx] {
                    return Some(ctx.clone());
                }
            }
            if !auto_create {
                return None;
            }
        }

        let mut slots = self.slots.write().unwrap();
        if idx >= slots.len() {
            let new_len = std::cmp::max(idx + 1, slots.len() * 2);
            slots.resize(new_len, None);
        }
        if let Some(ctx) = &slots[idx] {
            return Some(ctx.clone()); // raced with another creator
        }
        let ctx = Arc::new(FdCtx::new(fd));
        slots[idx] = Some(ctx.clone());
        Some(ctx)
    }

    /// Drop the context for a closed descriptor.
    pub fn del(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut slots = self.slots.write().unwrap();
        if (fd as usize) < slots.len() {
            if let Some(ctx) = slots[fd as usize].take() {
                ctx.set_closed();
            }
        }
    }
}

impl Default for FdManager {
    fn default() -> Self {
        Self::new()
    }
}

static FD_MANAGER: OnceLock<FdManager> = OnceLock::new();

/// Process-wide descriptor table.
pub fn fd_manager() -> &'static FdManager {
    FD_MANAGER.get_or_init(FdManager::new)
}
