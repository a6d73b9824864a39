//! Named OS-thread wrapper
//!
//! Thin wrapper over `std::thread` that registers a name and kernel tid for
//! the new thread and blocks the constructor until that registration is
//! visible (start barrier). Scheduler affinity hints are kernel tids, so a
//! `Thread`'s tid must be valid the moment `new` returns.

use std::cell::{Cell, RefCell};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

thread_local! {
    static THREAD_NAME: RefCell<String> = RefCell::new(String::from("UNKNOWN"));
    static THREAD_TID: Cell<i32> = const { Cell::new(-1) };
}

/// Kernel thread id of the calling thread, cached per thread.
#[inline]
pub fn gettid() -> i32 {
    THREAD_TID.with(|c| {
        let mut id = c.get();
        if id == -1 {
            id = unsafe { libc::syscall(libc::SYS_gettid) as i32 };
            c.set(id);
        }
        id
    })
}

/// Name registered for the calling thread.
pub fn current_name() -> String {
    THREAD_NAME.with(|c| c.borrow().clone())
}

/// Register a name for the calling thread (also used for the main thread,
/// which no `Thread` wrapper constructs).
pub fn set_name(name: &str) {
    if name.is_empty() {
        return;
    }
    THREAD_NAME.with(|c| *c.borrow_mut() = name.to_string());
}

/// A named worker thread with a known kernel tid.
pub struct Thread {
    handle: Option<JoinHandle<()>>,
    tid: i32,
    name: String,
}

impl Thread {
    /// Spawn `f` on a new named thread. Returns once the thread has
    /// registered its tid and name, so both are immediately usable.
    pub fn new<F>(f: F, name: &str) -> Thread
    where
        F: FnOnce() + Send + 'static,
    {
        let name = if name.is_empty() {
            String::from("UNKNOWN")
        } else {
            name.to_string()
        };

        let started = Arc::new((Mutex::new(None::<i32>), Condvar::new()));
        let started2 = started.clone();
        let registered_name = name.clone();

        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                set_name(&registered_name);
                let tid = gettid();
                {
                    let (lock, cvar) = &*started2;
                    *lock.lock().unwrap() = Some(tid);
                    cvar.notify_one();
                }
                f();
            })
            .expect("failed to spawn thread");

        let tid = {
            let (lock, cvar) = &*started;
            let mut guard = lock.lock().unwrap();
            while guard.is_none() {
                guard = cvar.wait(guard).unwrap();
            }
            guard.unwrap()
        };

        Thread {
            handle: Some(handle),
            tid,
            name,
        }
    }

    /// Kernel tid of the wrapped thread.
    #[inline]
    pub fn tid(&self) -> i32 {
        self.tid
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the thread to finish.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[test]
    fn test_gettid_stable() {
        let a = gettid();
        let b = gettid();
        assert!(a > 0);
        assert_eq!(a, b);
    }

    #[test]
    fn test_tid_valid_after_new() {
        let observed = Arc::new(AtomicI32::new(0));
        let obs = observed.clone();
        let t = Thread::new(
            move || {
                obs.store(gettid(), Ordering::SeqCst);
            },
            "tid-test",
        );
        let tid = t.tid();
        t.join();
        assert_eq!(observed.load(Ordering::SeqCst), tid);
    }

    #[test]
    fn test_name_registration() {
        let t = Thread::new(
            || {
                assert_eq!(current_name(), "named-test");
            },
            "named-test",
        );
        assert_eq!(t.name(), "named-test");
        t.join();
    }
}
