//! IoManager: the reactor
//!
//! A `Scheduler` whose idle fibers park in `epoll_wait` instead of
//! spinning. The wait is bounded by the earliest timer deadline and broken
//! early through an eventfd whenever new work arrives or a new timer
//! becomes the earliest ("tickle"). Per descriptor and event kind at most
//! one action is registered at a time - either "resume this fiber" or "run
//! this callback" - and firing consumes the registration.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::ops::Deref;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use strand_core::error::{SchedError, SchedResult};
use strand_core::state::FiberState;
use strand_core::{log_debug, log_error, log_info, runtime_assert};

use crate::fiber::{Fiber, FiberFn};
use crate::hook::errno;
use crate::scheduler::{ReactorDriver, Scheduler, Task};
use crate::timer::{Timer, TimerManager};

thread_local! {
    /// IoManager owning the current thread, installed at worker startup.
    static CURRENT_IOM: RefCell<Option<Weak<IoManager>>> = const { RefCell::new(None) };
}

/// Readiness kind; values match the epoll bits they map to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum IoEvent {
    Read = 0x1,  // EPOLLIN
    Write = 0x4, // EPOLLOUT
}

impl IoEvent {
    #[inline]
    fn bit(self) -> u32 {
        self as u32
    }
}

/// What to do when a registered event fires.
enum EventAction {
    /// Re-schedule this suspended fiber
    Fiber(Arc<Fiber>),
    /// Run this callback on a fresh fiber
    Call(FiberFn),
}

#[derive(Default)]
struct SlotInner {
    /// Bitmask of registered IoEvent kinds
    registered: u32,
    read: Option<EventAction>,
    write: Option<EventAction>,
}

/// Per-descriptor registration slot; the table index is the fd.
#[derive(Default)]
struct EventSlot {
    inner: Mutex<SlotInner>,
}

pub struct IoManager {
    sched: Arc<Scheduler>,
    timers: TimerManager,
    epfd: RawFd,
    /// eventfd used to break epoll_wait early
    wake_fd: RawFd,
    slots: RwLock<Vec<Arc<EventSlot>>>,
    /// Registered-and-unfired event count across all descriptors
    pending: AtomicUsize,
    self_weak: Weak<IoManager>,
}

impl Deref for IoManager {
    type Target = Scheduler;

    fn deref(&self) -> &Scheduler {
        &self.sched
    }
}

/// Longest the reactor sleeps even with no timers, so shutdown and stale
/// state are noticed without a tickle.
const MAX_IDLE_TIMEOUT_MS: u64 = 3000;

const MAX_EVENTS: usize = 256;

impl IoManager {
    /// Build and immediately start a reactor-backed scheduler.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<IoManager> {
        let iom = Arc::new_cyclic(|weak: &Weak<IoManager>| {
            let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
            runtime_assert!(epfd >= 0, "epoll_create1 failed: errno {}", errno());

            let wake_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
            runtime_assert!(wake_fd >= 0, "eventfd failed: errno {}", errno());

            let mut ev = libc::epoll_event {
                events: (libc::EPOLLIN as u32) | (libc::EPOLLET as u32),
                u64: wake_fd as u64,
            };
            let rt = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, wake_fd, &mut ev) };
            runtime_assert!(rt == 0, "epoll_ctl(wake_fd) failed: errno {}", errno());

            let sched = Scheduler::new(threads, use_caller, name);
            let driver: Weak<dyn ReactorDriver + Send + Sync> = weak.clone();
            sched.set_driver(driver);

            let timers = {
                let w = weak.clone();
                TimerManager::with_front_notify(move || {
                    // A new earliest deadline: the parked reactor must
                    // re-evaluate its wait.
                    if let Some(iom) = w.upgrade() {
                        iom.tickle();
                    }
                })
            };

            let mut slots = Vec::new();
            grow_slots(&mut slots, 32);

            IoManager {
                sched,
                timers,
                epfd,
                wake_fd,
                slots: RwLock::new(slots),
                pending: AtomicUsize::new(0),
                self_weak: weak.clone(),
            }
        });
        if use_caller {
            iom.install_thread_context();
        }
        iom.start();
        iom
    }

    /// IoManager owning the current thread, if any.
    pub fn current() -> Option<Arc<IoManager>> {
        CURRENT_IOM.with(|c| c.borrow().as_ref().and_then(Weak::upgrade))
    }

    /// Register interest in `event` on `fd`. With no callback the action is
    /// "resume the calling fiber", so the caller is expected to yield to
    /// HOLD right after. At most one registration per (fd, kind).
    pub fn add_event(&self, fd: RawFd, event: IoEvent, cb: Option<FiberFn>) -> SchedResult<()> {
        let slot = self.slot_for(fd);
        let mut inner = slot.inner.lock().unwrap();
        runtime_assert!(
            inner.registered & event.bit() == 0,
            "add_event: fd {} already has {:?} registered",
            fd,
            event
        );

        let op = if inner.registered != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        let events = (libc::EPOLLET as u32) | inner.registered | event.bit();
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let rt = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rt != 0 {
            let e = errno();
            log_error!(
                "{}: add_event epoll_ctl({}, {:?}) failed: errno {}",
                self.sched.name(),
                fd,
                event,
                e
            );
            return Err(SchedError::Os(e));
        }

        self.pending.fetch_add(1, Ordering::SeqCst);
        let action = match cb {
            Some(cb) => EventAction::Call(cb),
            None => {
                let cur = Fiber::current();
                runtime_assert!(
                    cur.state() == FiberState::Exec,
                    "add_event: calling fiber not in EXEC"
                );
                EventAction::Fiber(cur)
            }
        };
        match event {
            IoEvent::Read => inner.read = Some(action),
            IoEvent::Write => inner.write = Some(action),
        }
        inner.registered |= event.bit();
        Ok(())
    }

    /// Remove a registration without firing it.
    pub fn del_event(&self, fd: RawFd, event: IoEvent) -> bool {
        let Some(slot) = self.existing_slot(fd) else {
            return false;
        };
        let mut inner = slot.inner.lock().unwrap();
        if inner.registered & event.bit() == 0 {
            return false;
        }
        if !self.epoll_update(fd, &mut inner, event.bit()) {
            return false;
        }
        match event {
            IoEvent::Read => inner.read = None,
            IoEvent::Write => inner.write = None,
        }
        self.pending.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Remove a registration and fire its action immediately, so the waiter
    /// wakes (used by timeouts and the hooked close).
    pub fn cancel_event(&self, fd: RawFd, event: IoEvent) -> bool {
        let Some(slot) = self.existing_slot(fd) else {
            return false;
        };
        let action = {
            let mut inner = slot.inner.lock().unwrap();
            if inner.registered & event.bit() == 0 {
                return false;
            }
            if !self.epoll_update(fd, &mut inner, event.bit()) {
                return false;
            }
            match event {
                IoEvent::Read => inner.read.take(),
                IoEvent::Write => inner.write.take(),
            }
        };
        self.fire(action);
        true
    }

    /// Cancel both kinds for a descriptor; the hooked close path.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(slot) = self.existing_slot(fd) else {
            return false;
        };
        let (read, write) = {
            let mut inner = slot.inner.lock().unwrap();
            if inner.registered == 0 {
                return false;
            }
            let rt = unsafe {
                libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
            };
            if rt != 0 {
                log_error!(
                    "{}: cancel_all epoll_ctl(DEL, {}) failed: errno {}",
                    self.sched.name(),
                    fd,
                    errno()
                );
            }
            inner.registered = 0;
            (inner.read.take(), inner.write.take())
        };
        self.fire(read);
        self.fire(write);
        true
    }

    /// Schedule `cb` to run after `ms` milliseconds on this reactor.
    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timers.add_timer(ms, cb, recurring)
    }

    /// Timer whose callback only runs while `cond` is still alive.
    pub fn add_condition_timer<F>(
        &self,
        ms: u64,
        cb: F,
        cond: Weak<dyn std::any::Any + Send + Sync>,
        recurring: bool,
    ) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timers.add_condition_timer(ms, cb, cond, recurring)
    }

    pub fn has_timer(&self) -> bool {
        self.timers.has_timer()
    }

    // ── internals ──

    fn slot_for(&self, fd: RawFd) -> Arc<EventSlot> {
        runtime_assert!(fd >= 0, "negative fd");
        let idx = fd as usize;
        {
            let slots = self.slots.read().unwrap();
            if idx < slots.len() {
                return slots[idx].clone();
            }
        }
        let mut slots = self.slots.write().unwrap();
        if idx >= slots.len() {
            let new_len = std::cmp::max(idx + 1, slots.len() * 2);
            grow_slots(&mut slots, new_len);
        }
        slots[idx].clone()
    }

    fn existing_slot(&self, fd: RawFd) -> Option<Arc<EventSlot>> {
        if fd < 0 {
            return None;
        }
        let slots = self.slots.read().unwrap();
        slots.get(fd as usize).cloned()
    }

    /// Re-register `fd` without the bits in `clear`; MOD when something
    /// stays registered, DEL otherwise. Updates `inner.registered`.
    fn epoll_update(&self, fd: RawFd, inner: &mut SlotInner, clear: u32) -> bool {
        let left = inner.registered & !clear;
        let op = if left != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_DEL
        };
        let mut ev = libc::epoll_event {
            events: (libc::EPOLLET as u32) | left,
            u64: fd as u64,
        };
        let rt = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rt != 0 {
            log_error!(
                "{}: epoll_ctl({}, fd {}) failed: errno {}",
                self.sched.name(),
                op,
                fd,
                errno()
            );
            return false;
        }
        inner.registered = left;
        true
    }

    /// Hand a detached action to the scheduler and drop its registration
    /// from the pending count.
    fn fire(&self, action: Option<EventAction>) {
        let Some(action) = action else {
            return;
        };
        match action {
            EventAction::Fiber(f) => self.sched.schedule_to(Task::from(f), -1),
            EventAction::Call(cb) => self.sched.schedule_to(Task::Call(cb), -1),
        }
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    fn wake(&self) {
        let val: u64 = 1;
        unsafe {
            libc::write(self.wake_fd, &val as *const u64 as *const libc::c_void, 8);
        }
    }

    fn drain_wake_fd(&self) {
        let mut buf = [0u8; 8];
        unsafe {
            libc::read(self.wake_fd, buf.as_mut_ptr() as *mut libc::c_void, 8);
        }
    }

    /// The reactor loop, run as every worker's idle fiber.
    fn reactor_idle(&self) {
        log_debug!("{}: reactor idle", self.sched.name());
        let mut events =
            vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        loop {
            if self.reactor_stopping() {
                log_info!("{}: reactor idle exits", self.sched.name());
                break;
            }

            let timeout = match self.timers.next_timer() {
                Some(ms) => ms.min(MAX_IDLE_TIMEOUT_MS) as i32,
                None => MAX_IDLE_TIMEOUT_MS as i32,
            };
            let n = unsafe {
                libc::epoll_wait(self.epfd, events.as_mut_ptr(), MAX_EVENTS as i32, timeout)
            };
            if n < 0 && errno() != libc::EINTR {
                log_error!(
                    "{}: epoll_wait failed: errno {}",
                    self.sched.name(),
                    errno()
                );
            }
            let n = n.max(0) as usize;

            // Expired timers first: their callbacks become ordinary units.
            let cbs = self.timers.list_expired();
            for cb in cbs {
                self.sched.schedule_to(Task::call(move || cb()), -1);
            }

            for ev in &events[..n] {
                let data = ev.u64;
                let mut revents = ev.events;

                if data == self.wake_fd as u64 {
                    self.drain_wake_fd();
                    continue;
                }

                let fd = data as RawFd;
                let Some(slot) = self.existing_slot(fd) else {
                    continue;
                };
                let mut fired: VecDeque<EventAction> = VecDeque::new();
                {
                    let mut inner = slot.inner.lock().unwrap();
                    if revents & ((libc::EPOLLERR | libc::EPOLLHUP) as u32) != 0 {
                        // Error or hangup wakes every waiter on the fd.
                        revents |= ((libc::EPOLLIN | libc::EPOLLOUT) as u32) & inner.registered;
                    }
                    let mut real = 0u32;
                    if revents & (libc::EPOLLIN as u32) != 0 {
                        real |= IoEvent::Read.bit();
                    }
                    if revents & (libc::EPOLLOUT as u32) != 0 {
                        real |= IoEvent::Write.bit();
                    }
                    if inner.registered & real == 0 {
                        continue;
                    }
                    if !self.epoll_update(fd, &mut inner, real) {
                        continue;
                    }
                    if real & IoEvent::Read.bit() != 0 {
                        if let Some(a) = inner.read.take() {
                            fired.push_back(a);
                        }
                    }
                    if real & IoEvent::Write.bit() != 0 {
                        if let Some(a) = inner.write.take() {
                            fired.push_back(a);
                        }
                    }
                }
                for action in fired {
                    self.fire(Some(action));
                }
            }

            // Hand control back so this worker runs what we just scheduled.
            Fiber::yield_to_hold();
        }
    }
}

impl ReactorDriver for IoManager {
    fn tickle(&self) {
        if !self.sched.has_idle_threads() {
            return;
        }
        self.wake();
    }

    fn idle(&self) {
        self.reactor_idle();
    }

    fn reactor_stopping(&self) -> bool {
        !self.timers.has_timer()
            && self.pending.load(Ordering::SeqCst) == 0
            && self.sched.base_stopping()
    }

    fn install_thread_context(&self) {
        CURRENT_IOM.with(|c| *c.borrow_mut() = Some(self.self_weak.clone()));
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        if !self.sched.stop_requested() {
            log_error!("{}: IoManager dropped without stop()", self.sched.name());
        }
        unsafe {
            libc::close(self.wake_fd);
            libc::close(self.epfd);
        }
    }
}

fn grow_slots(slots: &mut Vec<Arc<EventSlot>>, size: usize) {
    while slots.len() < size {
        slots.push(Arc::new(EventSlot::default()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    fn make_pipe() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        let rt = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(rt, 0);
        (fds[0], fds[1])
    }

    fn close_fd(fd: RawFd) {
        unsafe {
            libc::close(fd);
        }
    }

    #[test]
    fn test_event_callback_fires_on_readable() {
        let iom = IoManager::new(1, false, "io-ready");
        let (r, w) = make_pipe();
        let (tx, rx) = mpsc::channel();

        iom.add_event(
            r,
            IoEvent::Read,
            Some(Box::new(move || {
                tx.send(()).unwrap();
            })),
        )
        .unwrap();

        unsafe {
            libc::write(w, b"x".as_ptr() as *const libc::c_void, 1);
        }
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        iom.stop();
        close_fd(r);
        close_fd(w);
    }

    #[test]
    fn test_cancel_event_force_wakes() {
        let iom = IoManager::new(1, false, "io-cancel");
        let (r, w) = make_pipe();
        let (tx, rx) = mpsc::channel();

        iom.add_event(
            r,
            IoEvent::Read,
            Some(Box::new(move || {
                tx.send(()).unwrap();
            })),
        )
        .unwrap();

        // Nothing was ever written; only the cancel can fire the action.
        assert!(iom.cancel_event(r, IoEvent::Read));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!iom.cancel_event(r, IoEvent::Read));

        iom.stop();
        close_fd(r);
        close_fd(w);
    }

    #[test]
    fn test_del_event_drops_silently() {
        let iom = IoManager::new(1, false, "io-del");
        let (r, w) = make_pipe();
        let (tx, rx) = mpsc::channel::<()>();

        iom.add_event(
            r,
            IoEvent::Read,
            Some(Box::new(move || {
                tx.send(()).unwrap();
            })),
        )
        .unwrap();
        assert!(iom.del_event(r, IoEvent::Read));
        unsafe {
            libc::write(w, b"x".as_ptr() as *const libc::c_void, 1);
        }
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

        iom.stop();
        close_fd(r);
        close_fd(w);
    }

    #[test]
    fn test_fiber_resumes_on_readiness() {
        let iom = IoManager::new(1, false, "io-fiber");
        let mut fds = [0i32; 2];
        let rt =
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(rt, 0);
        let (a, b) = (fds[0], fds[1]);
        let (tx, rx) = mpsc::channel();

        let iom2 = iom.clone();
        iom.spawn(move || {
            iom2.add_event(a, IoEvent::Read, None).unwrap();
            Fiber::yield_to_hold();
            // Readiness fired; the byte is there now.
            let mut buf = [0u8; 8];
            let n = unsafe { libc::read(a, buf.as_mut_ptr() as *mut libc::c_void, 8) };
            tx.send(n).unwrap();
        });

        std::thread::sleep(Duration::from_millis(50));
        unsafe {
            libc::write(b, b"y".as_ptr() as *const libc::c_void, 1);
        }
        let n = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(n, 1);

        iom.stop();
        close_fd(a);
        close_fd(b);
    }

    #[test]
    fn test_timer_fires_through_reactor() {
        let iom = IoManager::new(1, false, "io-timer");
        let (tx, rx) = mpsc::channel();
        let start = Instant::now();
        iom.add_timer(
            50,
            move || {
                let _ = tx.send(start.elapsed());
            },
            false,
        );
        let elapsed = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(elapsed >= Duration::from_millis(45), "fired early: {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(2), "fired late: {:?}", elapsed);
        iom.stop();
    }

    #[test]
    fn test_recurring_timer_reset_changes_cadence() {
        let iom = IoManager::new(1, false, "io-reset");
        let times: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
        let handle: Arc<Mutex<Option<Timer>>> = Arc::new(Mutex::new(None));
        let (tx, rx) = mpsc::channel();

        let t = {
            let times = times.clone();
            let handle = handle.clone();
            iom.add_timer(
                50,
                move || {
                    let mut ts = times.lock().unwrap();
                    ts.push(Instant::now());
                    let n = ts.len();
                    drop(ts);
                    if n == 3 {
                        // A firing timer may change its own future cadence.
                        if let Some(t) = handle.lock().unwrap().as_ref() {
                            t.reset(200, true);
                        }
                    }
                    if n == 4 {
                        let _ = tx.send(());
                    }
                },
                true,
            )
        };
        *handle.lock().unwrap() = Some(t.clone());

        rx.recv_timeout(Duration::from_secs(10)).unwrap();
        t.cancel();

        let ts = times.lock().unwrap();
        let third_gap = ts[3].duration_since(ts[2]);
        assert!(
            third_gap >= Duration::from_millis(150),
            "reset did not stretch the period: {:?}",
            third_gap
        );
        drop(ts);
        iom.stop();
    }

    #[test]
    fn test_use_caller_reactor_drains_in_stop() {
        std::thread::spawn(|| {
            let iom = IoManager::new(1, true, "io-caller");
            let count = Arc::new(AtomicUsize::new(0));
            for _ in 0..4 {
                let c = count.clone();
                iom.spawn(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                });
            }
            // No pooled workers: the caller thread drains inside stop().
            iom.stop();
            assert_eq!(count.load(Ordering::SeqCst), 4);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_stop_drains_scheduled_work() {
        let iom = IoManager::new(2, false, "io-drain");
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let c = count.clone();
            iom.spawn(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        iom.stop();
        assert_eq!(count.load(Ordering::SeqCst), 16);
        assert!(iom.stopping());
    }
}
