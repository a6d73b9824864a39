//! Hooked blocking calls
//!
//! Capability-gated shims over the libc call surface. With hooking enabled
//! for the calling thread (worker threads enable it on startup) and a
//! managed socket in application-visible blocking mode, a would-block
//! result registers interest with the IoManager, parks the calling fiber
//! and retries once readiness - or a timeout - wakes it. In every other
//! case the shim delegates straight to the real call, so results and errno
//! behavior are indistinguishable from the unhooked functions.
//!
//! Sleeps never block the OS thread: they arm a one-shot timer that
//! re-schedules the calling fiber, then yield.

use std::any::Any;
use std::cell::Cell;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use strand_core::error::SchedError;
use strand_core::log_error;

use crate::config;
use crate::fd_manager::{fd_manager, TimeoutKind};
use crate::fiber::Fiber;
use crate::io_manager::{IoEvent, IoManager};
use crate::scheduler::Task;

thread_local! {
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

/// Is call interception enabled for the calling thread?
pub fn is_hook_enable() -> bool {
    HOOK_ENABLED.with(|c| c.get())
}

/// Toggle call interception for the calling thread. Worker threads switch
/// this on when their run loop starts.
pub fn set_hook_enable(flag: bool) {
    HOOK_ENABLED.with(|c| c.set(flag));
}

/// The calling thread's errno; hooked calls report failures through it
/// exactly like the raw calls do.
#[inline]
pub fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

#[inline]
fn set_errno(e: i32) {
    unsafe {
        *libc::__errno_location() = e;
    }
}

/// Shared token between a parked I/O call and its timeout timer. The timer
/// holds it weakly: once the call returns and drops the token, a late
/// timeout upgrades to nothing and becomes a no-op.
struct TimerCond {
    cancelled: AtomicI32,
}

impl TimerCond {
    fn new() -> Arc<TimerCond> {
        Arc::new(TimerCond {
            cancelled: AtomicI32::new(0),
        })
    }
}

/// The common rewrite for readiness-driven calls.
///
/// 1. Bail out to the real call unless (hooked thread, managed socket,
///    application wants blocking).
/// 2. Run the real call; retry inline on EINTR.
/// 3. On EAGAIN: arm an optional condition timer, register interest,
///    yield to HOLD.
/// 4. On resume: cancel the timer; fail with the timeout's errno if it
///    fired, otherwise retry from 2.
fn do_io<F>(
    fd: RawFd,
    fun_name: &str,
    event: IoEvent,
    timeout_kind: TimeoutKind,
    mut fun: F,
) -> isize
where
    F: FnMut() -> isize,
{
    if !is_hook_enable() {
        return fun();
    }
    let Some(ctx) = fd_manager().get(fd, false) else {
        return fun();
    };
    if !ctx.is_socket() || ctx.user_nonblock() {
        return fun();
    }

    let to = ctx.timeout(timeout_kind);
    let tinfo = TimerCond::new();

    loop {
        // Re-checked every round: a hooked close may have woken us, and
        // the fd number must not be touched again once it is ours no more.
        if ctx.is_closed() {
            set_errno(libc::EBADF);
            return -1;
        }
        let mut n = fun();
        while n == -1 && errno() == libc::EINTR {
            n = fun();
        }
        if n != -1 || errno() != libc::EAGAIN {
            return n;
        }

        let Some(iom) = IoManager::current() else {
            // No reactor on this thread; surface the would-block result.
            return n;
        };

        let timer = if to != -1 {
            let winfo = Arc::downgrade(&tinfo);
            let wiom = Arc::downgrade(&iom);
            let cond_arc: Arc<dyn Any + Send + Sync> = tinfo.clone();
            let cond: std::sync::Weak<dyn Any + Send + Sync> = Arc::downgrade(&cond_arc);
            Some(iom.add_condition_timer(
                to as u64,
                move || {
                    let Some(t) = winfo.upgrade() else {
                        return;
                    };
                    if t.cancelled.load(Ordering::SeqCst) != 0 {
                        return;
                    }
                    t.cancelled.store(libc::ETIMEDOUT, Ordering::SeqCst);
                    if let Some(iom) = wiom.upgrade() {
                        iom.cancel_event(fd, event);
                    }
                },
                cond,
                false,
            ))
        } else {
            None
        };

        match iom.add_event(fd, event, None) {
            Err(e) => {
                log_error!("{}: add_event({}, {:?}) failed: {}", fun_name, fd, event, e);
                if let Some(t) = timer {
                    t.cancel();
                }
                if let SchedError::Os(code) = e {
                    set_errno(code);
                }
                return -1;
            }
            Ok(()) => {
                Fiber::yield_to_hold();
                if let Some(t) = timer {
                    t.cancel();
                }
                let cancelled = tinfo.cancelled.load(Ordering::SeqCst);
                if cancelled != 0 {
                    set_errno(cancelled);
                    return -1;
                }
                // Readiness fired: retry the real call.
            }
        }
    }
}

// ── sleep family ──

/// Park the calling fiber for `ms` milliseconds without blocking its
/// worker thread. Outside a hooked fiber this is a plain thread sleep.
pub fn sleep_ms(ms: u64) {
    if !is_hook_enable() {
        std::thread::sleep(std::time::Duration::from_millis(ms));
        return;
    }
    let Some(iom) = IoManager::current() else {
        std::thread::sleep(std::time::Duration::from_millis(ms));
        return;
    };
    let fiber = Fiber::current();
    let wiom = Arc::downgrade(&iom);
    iom.add_timer(
        ms,
        move || {
            if let Some(iom) = wiom.upgrade() {
                iom.schedule_to(Task::from(fiber.clone()), -1);
            }
        },
        false,
    );
    Fiber::yield_to_hold();
}

/// Hooked `sleep(3)`.
pub fn sleep(seconds: u32) -> u32 {
    if !is_hook_enable() {
        return unsafe { libc::sleep(seconds) };
    }
    sleep_ms(seconds as u64 * 1000);
    0
}

/// Hooked `usleep(3)`.
pub fn usleep(usec: u64) -> i32 {
    if !is_hook_enable() {
        return unsafe { libc::usleep(usec as libc::useconds_t) };
    }
    sleep_ms(usec / 1000);
    0
}

/// Hooked `nanosleep(2)` (remaining-time reporting not supported; a
/// hooked sleep is never interrupted by signals).
pub fn nanosleep(req: &libc::timespec) -> i32 {
    if !is_hook_enable() {
        return unsafe { libc::nanosleep(req, std::ptr::null_mut()) };
    }
    let ms = req.tv_sec as u64 * 1000 + req.tv_nsec as u64 / 1_000_000;
    sleep_ms(ms);
    0
}

// ── socket lifecycle ──

/// Hooked `socket(2)`: the new descriptor enters the fd table (which
/// forces the OS-level non-blocking flag on).
pub fn socket(domain: i32, ty: i32, protocol: i32) -> RawFd {
    if !is_hook_enable() {
        return unsafe { libc::socket(domain, ty, protocol) };
    }
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if fd == -1 {
        return fd;
    }
    fd_manager().get(fd, true);
    fd
}

/// Hooked `connect(2)` with an explicit timeout (u64::MAX = none).
///
/// Initiates the non-blocking handshake, waits for writability or the
/// timeout, then inspects SO_ERROR for the outcome.
pub fn connect_with_timeout(
    fd: RawFd,
    addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
    timeout_ms: u64,
) -> i32 {
    if !is_hook_enable() {
        return unsafe { libc::connect(fd, addr, addrlen) };
    }
    let Some(ctx) = fd_manager().get(fd, false) else {
        set_errno(libc::EBADF);
        return -1;
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return unsafe { libc::connect(fd, addr, addrlen) };
    }

    let n = unsafe { libc::connect(fd, addr, addrlen) };
    if n == 0 {
        return 0;
    }
    if n != -1 || errno() != libc::EINPROGRESS {
        return n as i32;
    }

    let Some(iom) = IoManager::current() else {
        return n as i32;
    };
    let tinfo = TimerCond::new();
    let timer = if timeout_ms != u64::MAX {
        let winfo = Arc::downgrade(&tinfo);
        let wiom = Arc::downgrade(&iom);
        let cond_arc: Arc<dyn Any + Send + Sync> = tinfo.clone();
        let cond: std::sync::Weak<dyn Any + Send + Sync> = Arc::downgrade(&cond_arc);
        Some(iom.add_condition_timer(
            timeout_ms,
            move || {
                let Some(t) = winfo.upgrade() else {
                    return;
                };
                if t.cancelled.load(Ordering::SeqCst) != 0 {
                    return;
                }
                t.cancelled.store(libc::ETIMEDOUT, Ordering::SeqCst);
                if let Some(iom) = wiom.upgrade() {
                    iom.cancel_event(fd, IoEvent::Write);
                }
            },
            cond,
            false,
        ))
    } else {
        None
    };

    match iom.add_event(fd, IoEvent::Write, None) {
        Ok(()) => {
            Fiber::yield_to_hold();
            if let Some(t) = timer {
                t.cancel();
            }
            let cancelled = tinfo.cancelled.load(Ordering::SeqCst);
            if cancelled != 0 {
                set_errno(cancelled);
                return -1;
            }
        }
        Err(e) => {
            if let Some(t) = timer {
                t.cancel();
            }
            log_error!("connect: add_event({}, WRITE) failed: {}", fd, e);
        }
    }

    let mut error: i32 = 0;
    let mut len = std::mem::size_of::<i32>() as libc::socklen_t;
    let rt = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut error as *mut i32 as *mut libc::c_void,
            &mut len,
        )
    };
    if rt == -1 {
        return -1;
    }
    if error == 0 {
        0
    } else {
        set_errno(error);
        -1
    }
}

/// Hooked `connect(2)` using the configured default timeout.
pub fn connect(fd: RawFd, addr: *const libc::sockaddr, addrlen: libc::socklen_t) -> i32 {
    connect_with_timeout(fd, addr, addrlen, config::connect_timeout_ms())
}

/// Hooked `accept(2)`; the accepted descriptor enters the fd table.
pub fn accept(fd: RawFd, addr: *mut libc::sockaddr, addrlen: *mut libc::socklen_t) -> RawFd {
    let new_fd = do_io(fd, "accept", IoEvent::Read, TimeoutKind::Recv, || unsafe {
        libc::accept(fd, addr, addrlen) as isize
    }) as RawFd;
    if new_fd >= 0 && is_hook_enable() {
        fd_manager().get(new_fd, true);
    }
    new_fd
}

/// Hooked `close(2)`: wakes every fiber still waiting on the descriptor
/// (with an error) before the real close, so none is left pending forever.
pub fn close(fd: RawFd) -> i32 {
    if !is_hook_enable() {
        return unsafe { libc::close(fd) };
    }
    if fd_manager().get(fd, false).is_some() {
        // Closed flag first, wake second: a waiter woken on another worker
        // re-checks the flag and fails with EBADF instead of re-arming an
        // event on a descriptor about to disappear.
        fd_manager().del(fd);
        if let Some(iom) = IoManager::current() {
            iom.cancel_all(fd);
        }
    }
    unsafe { libc::close(fd) }
}

// ── read family ──

/// Hooked `read(2)`.
pub fn read(fd: RawFd, buf: &mut [u8]) -> isize {
    let ptr = buf.as_mut_ptr();
    let len = buf.len();
    do_io(fd, "read", IoEvent::Read, TimeoutKind::Recv, || unsafe {
        libc::read(fd, ptr as *mut libc::c_void, len)
    })
}

/// Hooked `readv(2)`.
pub fn readv(fd: RawFd, iov: *const libc::iovec, iovcnt: i32) -> isize {
    do_io(fd, "readv", IoEvent::Read, TimeoutKind::Recv, || unsafe {
        libc::readv(fd, iov, iovcnt)
    })
}

/// Hooked `recv(2)`.
pub fn recv(fd: RawFd, buf: &mut [u8], flags: i32) -> isize {
    let ptr = buf.as_mut_ptr();
    let len = buf.len();
    do_io(fd, "recv", IoEvent::Read, TimeoutKind::Recv, || unsafe {
        libc::recv(fd, ptr as *mut libc::c_void, len, flags)
    })
}

/// Hooked `recvfrom(2)`.
pub fn recvfrom(
    fd: RawFd,
    buf: &mut [u8],
    flags: i32,
    src_addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
) -> isize {
    let ptr = buf.as_mut_ptr();
    let len = buf.len();
    do_io(fd, "recvfrom", IoEvent::Read, TimeoutKind::Recv, || unsafe {
        libc::recvfrom(fd, ptr as *mut libc::c_void, len, flags, src_addr, addrlen)
    })
}

/// Hooked `recvmsg(2)`.
pub fn recvmsg(fd: RawFd, msg: *mut libc::msghdr, flags: i32) -> isize {
    do_io(fd, "recvmsg", IoEvent::Read, TimeoutKind::Recv, || unsafe {
        libc::recvmsg(fd, msg, flags)
    })
}

// ── write family ──

/// Hooked `write(2)`.
pub fn write(fd: RawFd, buf: &[u8]) -> isize {
    let ptr = buf.as_ptr();
    let len = buf.len();
    do_io(fd, "write", IoEvent::Write, TimeoutKind::Send, || unsafe {
        libc::write(fd, ptr as *const libc::c_void, len)
    })
}

/// Hooked `writev(2)`.
pub fn writev(fd: RawFd, iov: *const libc::iovec, iovcnt: i32) -> isize {
    do_io(fd, "writev", IoEvent::Write, TimeoutKind::Send, || unsafe {
        libc::writev(fd, iov, iovcnt)
    })
}

/// Hooked `send(2)`.
pub fn send(fd: RawFd, buf: &[u8], flags: i32) -> isize {
    let ptr = buf.as_ptr();
    let len = buf.len();
    do_io(fd, "send", IoEvent::Write, TimeoutKind::Send, || unsafe {
        libc::send(fd, ptr as *const libc::c_void, len, flags)
    })
}

/// Hooked `sendto(2)`.
pub fn sendto(
    fd: RawFd,
    buf: &[u8],
    flags: i32,
    dest_addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
) -> isize {
    let ptr = buf.as_ptr();
    let len = buf.len();
    do_io(fd, "sendto", IoEvent::Write, TimeoutKind::Send, || unsafe {
        libc::sendto(fd, ptr as *const libc::c_void, len, flags, dest_addr, addrlen)
    })
}

/// Hooked `sendmsg(2)`.
pub fn sendmsg(fd: RawFd, msg: *const libc::msghdr, flags: i32) -> isize {
    do_io(fd, "sendmsg", IoEvent::Write, TimeoutKind::Send, || unsafe {
        libc::sendmsg(fd, msg, flags)
    })
}

// ── blocking-mode bookkeeping ──

/// Hooked `fcntl(fd, F_SETFL, arg)`: records the application's O_NONBLOCK
/// intent and keeps the internally forced flag in place underneath.
pub fn fcntl_setfl(fd: RawFd, mut arg: i32) -> i32 {
    match fd_manager().get(fd, false) {
        Some(ctx) if !ctx.is_closed() && ctx.is_socket() => {
            ctx.set_user_nonblock(arg & libc::O_NONBLOCK != 0);
            if ctx.sys_nonblock() {
                arg |= libc::O_NONBLOCK;
            } else {
                arg &= !libc::O_NONBLOCK;
            }
            unsafe { libc::fcntl(fd, libc::F_SETFL, arg) }
        }
        _ => unsafe { libc::fcntl(fd, libc::F_SETFL, arg) },
    }
}

/// Hooked `fcntl(fd, F_GETFL)`: reports the O_NONBLOCK state the
/// application asked for, hiding the forced flag.
pub fn fcntl_getfl(fd: RawFd) -> i32 {
    let arg = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    match fd_manager().get(fd, false) {
        Some(ctx) if !ctx.is_closed() && ctx.is_socket() => {
            if ctx.user_nonblock() {
                arg | libc::O_NONBLOCK
            } else {
                arg & !libc::O_NONBLOCK
            }
        }
        _ => arg,
    }
}

/// Hooked `ioctl(fd, FIONBIO, &flag)`: same bookkeeping as F_SETFL.
pub fn ioctl_fionbio(fd: RawFd, on: bool) -> i32 {
    if let Some(ctx) = fd_manager().get(fd, false) {
        if !ctx.is_closed() && ctx.is_socket() {
            ctx.set_user_nonblock(on);
        }
    }
    let mut flag: i32 = on as i32;
    unsafe { libc::ioctl(fd, libc::FIONBIO, &mut flag as *mut i32) }
}

/// Hooked `getsockopt(2)` (plain passthrough; present for surface parity).
pub fn getsockopt(
    fd: RawFd,
    level: i32,
    optname: i32,
    optval: *mut libc::c_void,
    optlen: *mut libc::socklen_t,
) -> i32 {
    unsafe { libc::getsockopt(fd, level, optname, optval, optlen) }
}

/// Hooked `setsockopt(2)`: SO_RCVTIMEO / SO_SNDTIMEO are mirrored into the
/// fd table so hooked calls honor them as fiber timeouts.
pub fn setsockopt(
    fd: RawFd,
    level: i32,
    optname: i32,
    optval: *const libc::c_void,
    optlen: libc::socklen_t,
) -> i32 {
    if is_hook_enable()
        && level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
        && !optval.is_null()
    {
        if let Some(ctx) = fd_manager().get(fd, true) {
            let tv = unsafe { &*(optval as *const libc::timeval) };
            let ms = tv.tv_sec as i64 * 1000 + tv.tv_usec as i64 / 1000;
            let kind = if optname == libc::SO_RCVTIMEO {
                TimeoutKind::Recv
            } else {
                TimeoutKind::Send
            };
            // A zero timeval means "no timeout" in socket semantics.
            ctx.set_timeout(kind, if ms == 0 { -1 } else { ms });
        }
    }
    unsafe { libc::setsockopt(fd, level, optname, optval, optlen) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    fn make_socketpair() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        let rt = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(rt, 0);
        (fds[0], fds[1])
    }

    fn close_raw(fd: RawFd) {
        unsafe {
            libc::close(fd);
        }
    }

    #[test]
    fn test_hook_flag_is_per_thread() {
        assert!(!is_hook_enable());
        set_hook_enable(true);
        assert!(is_hook_enable());
        std::thread::spawn(|| {
            assert!(!is_hook_enable());
        })
        .join()
        .unwrap();
        set_hook_enable(false);
    }

    #[test]
    fn test_disabled_passthrough_matches_raw() {
        // This thread never enables hooking: results must be exactly the
        // raw calls'.
        let (a, b) = make_socketpair();
        assert_eq!(write(b, b"hi"), 2);
        let mut buf = [0u8; 8];
        assert_eq!(read(a, &mut buf), 2);
        assert_eq!(&buf[..2], b"hi");

        // Would-block behaves identically too.
        let flags = unsafe { libc::fcntl(a, libc::F_GETFL) };
        unsafe { libc::fcntl(a, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        let n = read(a, &mut buf);
        assert_eq!(n, -1);
        assert_eq!(errno(), libc::EAGAIN);

        assert_eq!(close(a), 0);
        assert_eq!(close(b), 0);
    }

    #[test]
    fn test_hooked_sleeps_overlap_on_one_worker() {
        let iom = IoManager::new(1, false, "hook-sleep");
        let (tx, rx) = mpsc::channel();
        let start = Instant::now();

        let tx1 = tx.clone();
        iom.spawn(move || {
            sleep(1);
            let _ = tx1.send((1u32, start.elapsed()));
        });
        let tx2 = tx;
        iom.spawn(move || {
            sleep(2);
            let _ = tx2.send((2u32, start.elapsed()));
        });

        let (first, _) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        let (second, total) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        // Cooperative overlap: 1s and 2s sleeps on one worker finish in
        // ~2s total, shorter one first.
        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert!(total >= Duration::from_millis(1900), "total {:?}", total);
        assert!(total < Duration::from_millis(2900), "total {:?}", total);

        iom.stop();
    }

    #[test]
    fn test_read_times_out_with_etimedout() {
        let iom = IoManager::new(1, false, "hook-timeout");
        let (a, b) = make_socketpair();
        let (tx, rx) = mpsc::channel();

        iom.spawn(move || {
            fd_manager().get(a, true);
            let tv = libc::timeval {
                tv_sec: 0,
                tv_usec: 100_000,
            };
            setsockopt(
                a,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            );
            let start = Instant::now();
            let mut buf = [0u8; 8];
            let n = read(a, &mut buf);
            let _ = tx.send((n, errno(), start.elapsed()));
        });

        let (n, err, elapsed) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(n, -1);
        assert_eq!(err, libc::ETIMEDOUT);
        assert!(elapsed >= Duration::from_millis(90), "elapsed {:?}", elapsed);

        iom.stop();
        fd_manager().del(a);
        close_raw(a);
        close_raw(b);
    }

    #[test]
    fn test_read_completes_when_peer_writes() {
        let iom = IoManager::new(1, false, "hook-read");
        let (a, b) = make_socketpair();
        let (tx, rx) = mpsc::channel();

        iom.spawn(move || {
            fd_manager().get(a, true);
            let mut buf = [0u8; 8];
            let n = read(a, &mut buf);
            let _ = tx.send((n, buf));
        });

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(
            unsafe { libc::write(b, b"ok".as_ptr() as *const libc::c_void, 2) },
            2
        );
        let (n, buf) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(n, 2);
        assert_eq!(&buf[..2], b"ok");

        iom.stop();
        fd_manager().del(a);
        close_raw(a);
        close_raw(b);
    }

    #[test]
    fn test_hooked_close_wakes_blocked_reader() {
        let iom = IoManager::new(1, false, "hook-close");
        let (a, b) = make_socketpair();
        let (tx, rx) = mpsc::channel();

        iom.spawn(move || {
            fd_manager().get(a, true);
            let mut buf = [0u8; 8];
            // No timeout: only the close can wake this.
            let n = read(a, &mut buf);
            let _ = tx.send((n, errno()));
        });
        iom.spawn(move || {
            sleep_ms(100);
            close(a);
        });

        let (n, err) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(n, -1);
        assert_eq!(err, libc::EBADF);

        iom.stop();
        close_raw(b);
    }

    #[test]
    fn test_fcntl_hides_forced_nonblock() {
        let (a, b) = make_socketpair();
        fd_manager().get(a, true);

        // The runtime forced O_NONBLOCK on, but the application never
        // asked for it.
        let raw = unsafe { libc::fcntl(a, libc::F_GETFL) };
        assert!(raw & libc::O_NONBLOCK != 0);
        assert!(fcntl_getfl(a) & libc::O_NONBLOCK == 0);

        // The application's own request is visible again through the hook.
        fcntl_setfl(a, fcntl_getfl(a) | libc::O_NONBLOCK);
        assert!(fcntl_getfl(a) & libc::O_NONBLOCK != 0);
        assert!(fd_manager().get(a, false).unwrap().user_nonblock());

        fd_manager().del(a);
        close_raw(a);
        close_raw(b);
    }

    #[test]
    fn test_ioctl_fionbio_records_intent() {
        let (a, b) = make_socketpair();
        fd_manager().get(a, true);
        assert_eq!(ioctl_fionbio(a, true), 0);
        assert!(fd_manager().get(a, false).unwrap().user_nonblock());
        assert_eq!(ioctl_fionbio(a, false), 0);
        assert!(!fd_manager().get(a, false).unwrap().user_nonblock());
        fd_manager().del(a);
        close_raw(a);
        close_raw(b);
    }

    #[test]
    fn test_user_nonblock_bypasses_fiber_path() {
        let iom = IoManager::new(1, false, "hook-bypass");
        let (a, b) = make_socketpair();
        let (tx, rx) = mpsc::channel();

        iom.spawn(move || {
            fd_manager().get(a, true);
            fcntl_setfl(a, libc::O_NONBLOCK);
            // Application asked for non-blocking: EAGAIN comes straight
            // back instead of parking the fiber.
            let mut buf = [0u8; 8];
            let n = read(a, &mut buf);
            let _ = tx.send((n, errno()));
        });

        let (n, err) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(n, -1);
        assert_eq!(err, libc::EAGAIN);

        iom.stop();
        fd_manager().del(a);
        close_raw(a);
        close_raw(b);
    }
}
