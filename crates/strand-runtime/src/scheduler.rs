//! Fiber scheduler
//!
//! Maps a dynamic set of fibers and plain callbacks onto a fixed pool of
//! worker threads. Each worker runs the pulling loop in `run`; when nothing
//! is runnable the per-thread idle fiber takes over (the reactor parks in
//! epoll there). A scheduler constructed with `use_caller` claims the
//! constructing thread as one of its workers: that thread joins the drain
//! inside `stop` through a caller-mode scheduling fiber.
//!
//! State machine per instance: constructed (stopping=true) → `start` →
//! running → `stop` → drained and joined. `stop` may only be called once,
//! by the designated caller thread if one exists and by an outside thread
//! otherwise.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use strand_core::state::FiberState;
use strand_core::{fatal, log_debug, log_info, runtime_assert};

use crate::fiber::{Fiber, FiberFn};
use crate::hook;
use crate::thread::{self, Thread};

thread_local! {
    /// Scheduler owning the current thread.
    static CURRENT_SCHED: RefCell<Option<Weak<Scheduler>>> = const { RefCell::new(None) };

    /// The scheduling-context fiber that ordinary fibers trade places with
    /// on this thread: a worker's root fiber, or the caller-mode fiber of
    /// a use_caller scheduler.
    static SCHED_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
}

/// The scheduling-context fiber for the current thread.
pub(crate) fn scheduling_fiber() -> Option<Arc<Fiber>> {
    SCHED_FIBER.with(|c| c.borrow().clone())
}

/// A schedulable unit: a fiber to resume or a callback to wrap in one.
pub enum Task {
    Fiber(Arc<Fiber>),
    Call(FiberFn),
}

impl Task {
    /// Wrap a plain callback.
    pub fn call<F>(f: F) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        Task::Call(Box::new(f))
    }
}

impl From<Arc<Fiber>> for Task {
    fn from(f: Arc<Fiber>) -> Task {
        Task::Fiber(f)
    }
}

/// Queue entry: unit plus thread affinity (-1 = any worker).
struct TaskUnit {
    task: Task,
    thread: i32,
}

/// Seam through which the reactor specializes the scheduler; mirrors the
/// overridable surface (tickle / idle / stopping) plus per-thread context
/// installation for worker startup.
pub(crate) trait ReactorDriver: Send + Sync {
    fn tickle(&self);
    fn idle(&self);
    fn reactor_stopping(&self) -> bool;
    fn install_thread_context(&self);
}

pub struct Scheduler {
    name: String,
    /// Pending units, scanned under lock for the first eligible entry
    queue: Mutex<VecDeque<TaskUnit>>,
    threads: Mutex<Vec<Thread>>,
    thread_ids: Mutex<Vec<i32>>,
    /// Pooled worker threads (excludes the caller thread)
    thread_count: usize,
    active_count: AtomicUsize,
    idle_count: AtomicUsize,
    stopping: AtomicBool,
    auto_stop: AtomicBool,
    /// Caller-mode scheduling fiber, when the constructing thread joined
    root_fiber: Mutex<Option<Arc<Fiber>>>,
    /// Kernel tid of the caller thread, -1 otherwise
    root_thread: i32,
    driver: OnceLock<Weak<dyn ReactorDriver + Send + Sync>>,
    self_weak: Weak<Scheduler>,
}

impl Scheduler {
    /// Create a scheduler with `threads` workers. With `use_caller` the
    /// invoking thread counts as one of them: it claims this scheduler as
    /// its own (one scheduler per thread) and participates in draining
    /// when `stop` runs.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        runtime_assert!(threads > 0, "scheduler needs at least one thread");
        let name = if name.is_empty() {
            String::from("scheduler")
        } else {
            name.to_string()
        };

        Arc::new_cyclic(|weak: &Weak<Scheduler>| {
            let mut thread_count = threads;
            let mut root_fiber = None;
            let mut root_thread = -1;
            let mut thread_ids = Vec::new();

            if use_caller {
                // Materialize this thread's root fiber before anything
                // switches away from it.
                Fiber::current();
                thread_count -= 1;

                runtime_assert!(
                    Scheduler::current().is_none(),
                    "thread already owns a scheduler"
                );
                CURRENT_SCHED.with(|c| *c.borrow_mut() = Some(weak.clone()));

                let w = weak.clone();
                let rf = Fiber::new(
                    move || {
                        if let Some(sched) = w.upgrade() {
                            sched.run();
                        }
                    },
                    0,
                    true,
                );
                thread::set_name(&name);
                SCHED_FIBER.with(|c| *c.borrow_mut() = Some(rf.clone()));

                root_thread = thread::gettid();
                thread_ids.push(root_thread);
                root_fiber = Some(rf);
            }

            Scheduler {
                name,
                queue: Mutex::new(VecDeque::new()),
                threads: Mutex::new(Vec::new()),
                thread_ids: Mutex::new(thread_ids),
                thread_count,
                active_count: AtomicUsize::new(0),
                idle_count: AtomicUsize::new(0),
                stopping: AtomicBool::new(true),
                auto_stop: AtomicBool::new(false),
                root_fiber: Mutex::new(root_fiber),
                root_thread,
                driver: OnceLock::new(),
                self_weak: weak.clone(),
            }
        })
    }

    /// Scheduler owning the current thread, if any.
    pub fn current() -> Option<Arc<Scheduler>> {
        CURRENT_SCHED.with(|c| c.borrow().as_ref().and_then(Weak::upgrade))
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn arc(&self) -> Arc<Scheduler> {
        self.self_weak
            .upgrade()
            .unwrap_or_else(|| fatal!("scheduler used after drop"))
    }

    pub(crate) fn set_driver(&self, driver: Weak<dyn ReactorDriver + Send + Sync>) {
        let _ = self.driver.set(driver);
    }

    fn driver(&self) -> Option<Arc<dyn ReactorDriver + Send + Sync>> {
        self.driver.get().and_then(Weak::upgrade)
    }

    /// Spawn the pooled worker threads. No-op if already running.
    pub fn start(&self) {
        let mut threads = self.threads.lock().unwrap();
        if !self.stopping.load(Ordering::Acquire) {
            return;
        }
        self.stopping.store(false, Ordering::Release);
        runtime_assert!(threads.is_empty(), "scheduler restarted after stop");

        let mut ids = self.thread_ids.lock().unwrap();
        for i in 0..self.thread_count {
            let sched = self.arc();
            let t = Thread::new(
                move || sched.run(),
                &format!("{}_{}", self.name, i),
            );
            ids.push(t.tid());
            threads.push(t);
        }
    }

    /// Queue a unit for any worker.
    pub fn schedule(&self, task: impl Into<Task>) {
        self.schedule_to(task, -1);
    }

    /// Queue a unit pinned to the worker with kernel tid `thread`
    /// (-1 = any worker).
    pub fn schedule_to(&self, task: impl Into<Task>, thread: i32) {
        let need_tickle = {
            let mut q = self.queue.lock().unwrap();
            let was_empty = q.is_empty();
            q.push_back(TaskUnit {
                task: task.into(),
                thread,
            });
            was_empty
        };
        // An idle worker (or parked reactor) only needs a nudge when the
        // queue transitions from empty; busy workers re-scan anyway.
        if need_tickle {
            self.tickle();
        }
    }

    /// Convenience: schedule a plain callback.
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_to(Task::call(f), -1);
    }

    pub(crate) fn tickle(&self) {
        match self.driver() {
            Some(d) => d.tickle(),
            None => log_debug!("{}: tickle", self.name),
        }
    }

    /// True iff both stop flags are set, the queue is empty and no unit is
    /// active. Single source of truth for "may we shut down now".
    pub fn stopping(&self) -> bool {
        match self.driver() {
            Some(d) => d.reactor_stopping(),
            None => self.base_stopping(),
        }
    }

    pub(crate) fn base_stopping(&self) -> bool {
        self.auto_stop.load(Ordering::Acquire)
            && self.stopping.load(Ordering::Acquire)
            && self.queue.lock().unwrap().is_empty()
            && self.active_count.load(Ordering::Acquire) == 0
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub(crate) fn has_idle_threads(&self) -> bool {
        self.idle_count.load(Ordering::Acquire) > 0
    }

    /// Drain all pending units and join the pool. Must be called once; on
    /// the designated caller thread when one exists, from outside the pool
    /// otherwise.
    pub fn stop(&self) {
        self.auto_stop.store(true, Ordering::Release);

        let root = self.root_fiber.lock().unwrap().clone();
        if let Some(ref rf) = root {
            if self.thread_count == 0
                && (rf.state() == FiberState::Term || rf.state() == FiberState::Init)
            {
                log_info!("{}: stopped", self.name);
                self.stopping.store(true, Ordering::Release);
                if self.stopping() {
                    return;
                }
            }
        }

        if self.root_thread != -1 {
            runtime_assert!(
                Scheduler::current().map_or(false, |s| std::ptr::eq(Arc::as_ptr(&s), self)),
                "{}: stop must run on the caller thread",
                self.name
            );
        } else {
            runtime_assert!(
                Scheduler::current().map_or(true, |s| !std::ptr::eq(Arc::as_ptr(&s), self)),
                "{}: stop must not run on one of its own workers",
                self.name
            );
        }

        self.stopping.store(true, Ordering::Release);
        for _ in 0..self.thread_count {
            self.tickle();
        }
        if root.is_some() {
            self.tickle();
        }

        if let Some(rf) = root {
            // The caller thread becomes a worker until everything drains.
            if !self.stopping() {
                rf.call();
            }
        }

        let thrs: Vec<Thread> = self.threads.lock().unwrap().drain(..).collect();
        for t in thrs {
            t.join();
        }
    }

    /// Cooperative hand-off: re-schedule the current fiber onto this
    /// scheduler (optionally a specific thread) and yield until picked up
    /// there. No-op when already in the right place.
    pub fn switch_to(&self, thread: i32) {
        if let Some(cur) = Scheduler::current() {
            if std::ptr::eq(Arc::as_ptr(&cur), self)
                && (thread == -1 || thread == thread::gettid())
            {
                return;
            }
        }
        self.schedule_to(Fiber::current(), thread);
        Fiber::yield_to_hold();
    }

    /// Worker loop: one per pooled thread, also run by the caller thread's
    /// scheduling fiber during `stop`.
    pub(crate) fn run(&self) {
        log_debug!("{}: run", self.name);
        hook::set_hook_enable(true);
        CURRENT_SCHED.with(|c| *c.borrow_mut() = Some(self.self_weak.clone()));
        if let Some(d) = self.driver() {
            d.install_thread_context();
        }

        let tid = thread::gettid();
        if tid != self.root_thread {
            // Pooled worker: its root fiber is the scheduling context.
            let root = Fiber::current();
            SCHED_FIBER.with(|c| *c.borrow_mut() = Some(root));
        }

        let idle_fiber = {
            let sched = self.arc();
            Fiber::new(move || sched.idle_entry(), 0, false)
        };
        let mut cb_fiber: Option<Arc<Fiber>> = None;

        loop {
            let mut tickle_me = false;
            let mut unit: Option<TaskUnit> = None;
            {
                let mut q = self.queue.lock().unwrap();
                let mut idx = 0;
                while idx < q.len() {
                    let u = &q[idx];
                    if u.thread != -1 && u.thread != tid {
                        // Affined elsewhere; its worker may be asleep.
                        tickle_me = true;
                        idx += 1;
                        continue;
                    }
                    if let Task::Fiber(ref f) = u.task {
                        // Still switching out on another worker; the unit
                        // stays queued until its context is saved.
                        if f.state() == FiberState::Exec {
                            idx += 1;
                            continue;
                        }
                    }
                    unit = q.remove(idx);
                    self.active_count.fetch_add(1, Ordering::SeqCst);
                    break;
                }
                tickle_me = tickle_me || !q.is_empty();
            }
            if tickle_me {
                self.tickle();
            }

            match unit {
                Some(TaskUnit {
                    task: Task::Fiber(f),
                    ..
                }) => {
                    if !f.state().is_terminal() {
                        f.resume();
                        self.active_count.fetch_sub(1, Ordering::SeqCst);
                        match f.state() {
                            FiberState::Ready => self.schedule_to(f, -1),
                            s if !s.is_terminal() => f.set_state(FiberState::Hold),
                            _ => {}
                        }
                    } else {
                        self.active_count.fetch_sub(1, Ordering::SeqCst);
                    }
                }
                Some(TaskUnit {
                    task: Task::Call(cb),
                    ..
                }) => {
                    // Reuse one callback fiber per worker so back-to-back
                    // callbacks do not reallocate a stack each time.
                    let f = match cb_fiber.take() {
                        Some(f) => {
                            f.reset_boxed(cb);
                            f
                        }
                        None => Fiber::new_boxed(cb, 0, false),
                    };
                    f.resume();
                    self.active_count.fetch_sub(1, Ordering::SeqCst);
                    match f.state() {
                        FiberState::Ready => {
                            self.schedule_to(f, -1);
                        }
                        s if s.is_terminal() => {
                            // Stack stays warm for the next callback.
                            cb_fiber = Some(f);
                        }
                        _ => {
                            // Held by a waiter now; a fresh wrapper next
                            // round avoids reuse ambiguity.
                            f.set_state(FiberState::Hold);
                        }
                    }
                }
                None => {
                    if idle_fiber.state() == FiberState::Term {
                        log_info!("{}: idle fiber terminated, worker exits", self.name);
                        break;
                    }
                    self.idle_count.fetch_add(1, Ordering::SeqCst);
                    idle_fiber.resume();
                    self.idle_count.fetch_sub(1, Ordering::SeqCst);
                    if !idle_fiber.state().is_terminal() {
                        idle_fiber.set_state(FiberState::Hold);
                    }
                }
            }
        }
    }

    /// Idle-fiber body; the reactor overrides this through the driver seam.
    fn idle_entry(&self) {
        match self.driver() {
            Some(d) => d.idle(),
            None => self.default_idle(),
        }
    }

    /// With no reactor there is nothing to park on: hand the core back
    /// briefly and yield until draining is allowed.
    fn default_idle(&self) {
        log_debug!("{}: idle", self.name);
        while !self.stopping() {
            std::thread::yield_now();
            Fiber::yield_to_hold();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let _ = CURRENT_SCHED.try_with(|c| {
            let is_me = c
                .borrow()
                .as_ref()
                .map_or(false, |w| std::ptr::eq(w.as_ptr(), self));
            if is_me {
                *c.borrow_mut() = None;
            }
        });
    }
}

/// RAII hand-off: switches the current fiber to `target` on construction
/// and back to the previous scheduler on drop.
pub struct SchedulerGuard {
    prev: Option<Arc<Scheduler>>,
}

impl SchedulerGuard {
    pub fn new(target: &Arc<Scheduler>) -> SchedulerGuard {
        let prev = Scheduler::current();
        target.switch_to(-1);
        SchedulerGuard { prev }
    }
}

impl Drop for SchedulerGuard {
    fn drop(&mut self) {
        if let Some(prev) = self.prev.take() {
            prev.switch_to(-1);
        }
    }
}
