//! Timers
//!
//! Wall-clock timer set used by the reactor. Timers are ordered by
//! (deadline, id) so the earliest is always first; recurring timers are
//! re-inserted after collection, which guarantees the callbacks of one
//! timer never overlap. A condition timer gates its callback on the
//! liveness of a weak token, so an I/O timeout armed next to an operation
//! becomes a no-op once the operation completes and drops the token.
//!
//! Lock order: the set's RwLock is taken before any per-timer mutex,
//! never the reverse.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

pub(crate) type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Current wall-clock time in milliseconds.
pub fn now_ms() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
    ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000
}

/// A clock that jumped back by more than this is treated as rolled over
/// and every pending timer re-expires rather than waiting forever.
const ROLLOVER_WINDOW_MS: u64 = 60 * 60 * 1000;

fn clock_rolled_over(previous_ms: u64, now: u64) -> bool {
    now < previous_ms && now < previous_ms.saturating_sub(ROLLOVER_WINDOW_MS)
}

struct TimerNodeState {
    /// Period in ms (also the original delay); 0 only for immediate timers
    ms: u64,
    /// Absolute expiry, wall-clock ms
    deadline: u64,
    recurring: bool,
    /// None once cancelled or fired (one-shot)
    cb: Option<TimerCallback>,
}

struct TimerNode {
    id: u64,
    state: Mutex<TimerNodeState>,
}

struct TimerInner {
    timers: BTreeMap<(u64, u64), Arc<TimerNode>>,
    /// Debounce for the front-insert notification; reset by the expiry scan
    tickled: bool,
    /// Last observed clock reading, for rollover detection
    previous_ms: u64,
}

pub(crate) struct TimerShared {
    inner: RwLock<TimerInner>,
    next_id: AtomicU64,
    /// Invoked (outside the lock) when a new timer becomes the earliest
    on_front: Box<dyn Fn() + Send + Sync>,
}

/// Handle to a scheduled timer.
#[derive(Clone)]
pub struct Timer {
    node: Arc<TimerNode>,
    owner: Weak<TimerShared>,
}

impl Timer {
    /// Remove the timer; its callback will not run. Returns false if it
    /// already fired or was cancelled.
    pub fn cancel(&self) -> bool {
        let Some(shared) = self.owner.upgrade() else {
            return false;
        };
        let mut inner = shared.inner.write().unwrap();
        let key = {
            let mut st = self.node.state.lock().unwrap();
            if st.cb.is_none() {
                return false;
            }
            st.cb = None;
            (st.deadline, self.node.id)
        };
        inner.timers.remove(&key);
        true
    }

    /// Push the expiry out to now + period, keeping the period.
    pub fn refresh(&self) -> bool {
        let Some(shared) = self.owner.upgrade() else {
            return false;
        };
        let mut inner = shared.inner.write().unwrap();
        {
            let mut st = self.node.state.lock().unwrap();
            if st.cb.is_none() {
                return false;
            }
            inner.timers.remove(&(st.deadline, self.node.id));
            st.deadline = now_ms() + st.ms;
            inner
                .timers
                .insert((st.deadline, self.node.id), self.node.clone());
        }
        true
    }

    /// Replace the period. With `from_now` the new expiry counts from the
    /// current time, otherwise from the original scheduled base; a firing
    /// recurring timer can change its own future cadence this way.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        let Some(shared) = self.owner.upgrade() else {
            return false;
        };
        let at_front;
        {
            let mut inner = shared.inner.write().unwrap();
            let mut st = self.node.state.lock().unwrap();
            if st.cb.is_none() {
                return false;
            }
            if st.ms == ms && !from_now {
                return true;
            }
            inner.timers.remove(&(st.deadline, self.node.id));
            let start = if from_now {
                now_ms()
            } else {
                st.deadline - st.ms
            };
            st.ms = ms;
            st.deadline = start + ms;
            let key = (st.deadline, self.node.id);
            drop(st);
            inner.timers.insert(key, self.node.clone());
            at_front = front_inserted(&mut inner, key);
        }
        if at_front {
            (shared.on_front)();
        }
        true
    }
}

/// Marks the debounce flag if `key` landed at the front; returns whether
/// the front-insert hook should fire.
fn front_inserted(inner: &mut TimerInner, key: (u64, u64)) -> bool {
    let at_front = inner.timers.keys().next() == Some(&key) && !inner.tickled;
    if at_front {
        inner.tickled = true;
    }
    at_front
}

/// Owner of the ordered timer set.
pub struct TimerManager {
    shared: Arc<TimerShared>,
}

impl TimerManager {
    pub fn new() -> Self {
        Self::with_front_notify(|| {})
    }

    /// `notify` runs (with no locks held) whenever a newly inserted timer
    /// becomes the earliest one; the reactor uses this to re-evaluate its
    /// wait deadline.
    pub fn with_front_notify<F>(notify: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(TimerShared {
                inner: RwLock::new(TimerInner {
                    timers: BTreeMap::new(),
                    tickled: false,
                    previous_ms: now_ms(),
                }),
                next_id: AtomicU64::new(0),
                on_front: Box::new(notify),
            }),
        }
    }

    /// Schedule `cb` to run after `ms` milliseconds; recurring timers
    /// re-arm with the same period after each firing.
    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_timer_cb(ms, Arc::new(cb), recurring)
    }

    /// Like `add_timer`, but the callback only runs if `cond` is still
    /// alive at expiry.
    pub fn add_condition_timer<F>(
        &self,
        ms: u64,
        cb: F,
        cond: Weak<dyn Any + Send + Sync>,
        recurring: bool,
    ) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        let wrapped: TimerCallback = Arc::new(move || {
            if cond.upgrade().is_some() {
                cb();
            }
        });
        self.add_timer_cb(ms, wrapped, recurring)
    }

    pub(crate) fn add_timer_cb(&self, ms: u64, cb: TimerCallback, recurring: bool) -> Timer {
        let node = Arc::new(TimerNode {
            id: self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            state: Mutex::new(TimerNodeState {
                ms,
                deadline: now_ms() + ms,
                recurring,
                cb: Some(cb),
            }),
        });
        let at_front;
        {
            let mut inner = self.shared.inner.write().unwrap();
            let key = (node.state.lock().unwrap().deadline, node.id);
            inner.timers.insert(key, node.clone());
            at_front = front_inserted(&mut inner, key);
        }
        if at_front {
            (self.shared.on_front)();
        }
        Timer {
            node,
            owner: Arc::downgrade(&self.shared),
        }
    }

    /// Milliseconds until the earliest timer: Some(0) when overdue, None
    /// when no timers are pending.
    pub fn next_timer(&self) -> Option<u64> {
        let inner = self.shared.inner.read().unwrap();
        inner.timers.keys().next().map(|(deadline, _)| {
            let now = now_ms();
            if now >= *deadline {
                0
            } else {
                deadline - now
            }
        })
    }

    pub fn has_timer(&self) -> bool {
        !self.shared.inner.read().unwrap().timers.is_empty()
    }

    /// Collect the callbacks of every expired timer in expiry order,
    /// re-arming recurring ones. After a backward clock jump beyond the
    /// rollover window, all timers count as expired.
    pub fn list_expired(&self) -> Vec<TimerCallback> {
        let now = now_ms();
        {
            let inner = self.shared.inner.read().unwrap();
            if inner.timers.is_empty() {
                return Vec::new();
            }
        }

        let mut inner = self.shared.inner.write().unwrap();
        if inner.timers.is_empty() {
            return Vec::new();
        }
        inner.tickled = false;

        let rollover = clock_rolled_over(inner.previous_ms, now);
        inner.previous_ms = now;
        if !rollover {
            if let Some((first, _)) = inner.timers.keys().next() {
                if *first > now {
                    return Vec::new();
                }
            }
        }

        let mut cbs = Vec::new();
        let mut requeue = Vec::new();
        loop {
            let key = match inner.timers.keys().next().copied() {
                Some(k) => k,
                None => break,
            };
            if !rollover && key.0 > now {
                break;
            }
            let node = inner.timers.remove(&key).unwrap();
            let mut st = node.state.lock().unwrap();
            let Some(cb) = st.cb.clone() else {
                continue; // cancelled while queued
            };
            cbs.push(cb);
            if st.recurring {
                st.deadline = now + st.ms;
                let key = (st.deadline, node.id);
                drop(st);
                requeue.push((key, node));
            } else {
                st.cb = None;
            }
        }
        for (key, node) in requeue {
            inner.timers.insert(key, node);
        }
        cbs
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_expiry_ordering() {
        let mgr = TimerManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (ms, tag) in [(30u64, 3), (10, 1), (20, 2)] {
            let o = order.clone();
            mgr.add_timer(ms, move || o.lock().unwrap().push(tag), false);
        }
        std::thread::sleep(Duration::from_millis(50));
        for cb in mgr.list_expired() {
            cb();
        }
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
        assert!(!mgr.has_timer());
    }

    #[test]
    fn test_next_timer() {
        let mgr = TimerManager::new();
        assert_eq!(mgr.next_timer(), None);
        let _t = mgr.add_timer(10_000, || {}, false);
        let next = mgr.next_timer().unwrap();
        assert!(next > 0 && next <= 10_000);
    }

    #[test]
    fn test_cancel() {
        let mgr = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let t = mgr.add_timer(
            10,
            move || {
                f.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );
        assert!(t.cancel());
        assert!(!t.cancel());
        assert!(!mgr.has_timer());
        std::thread::sleep(Duration::from_millis(20));
        assert!(mgr.list_expired().is_empty());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_recurring_rearms() {
        let mgr = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let t = mgr.add_timer(
            10,
            move || {
                f.fetch_add(1, Ordering::SeqCst);
            },
            true,
        );
        for _ in 0..3 {
            std::thread::sleep(Duration::from_millis(15));
            for cb in mgr.list_expired() {
                cb();
            }
        }
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert!(mgr.has_timer());
        t.cancel();
        assert!(!mgr.has_timer());
    }

    #[test]
    fn test_condition_timer_dropped_token() {
        let mgr = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let token: Arc<dyn Any + Send + Sync> = Arc::new(1u32);
        let cond = Arc::downgrade(&token);
        mgr.add_condition_timer(
            10,
            move || {
                f.fetch_add(1, Ordering::SeqCst);
            },
            cond,
            false,
        );
        drop(token);
        std::thread::sleep(Duration::from_millis(20));
        for cb in mgr.list_expired() {
            cb();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_condition_timer_live_token() {
        let mgr = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let token: Arc<dyn Any + Send + Sync> = Arc::new(1u32);
        mgr.add_condition_timer(
            10,
            move || {
                f.fetch_add(1, Ordering::SeqCst);
            },
            Arc::downgrade(&token),
            false,
        );
        std::thread::sleep(Duration::from_millis(20));
        for cb in mgr.list_expired() {
            cb();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reset_from_now_extends() {
        let mgr = TimerManager::new();
        let t = mgr.add_timer(20, || {}, false);
        assert!(t.reset(10_000, true));
        std::thread::sleep(Duration::from_millis(40));
        // Original deadline passed, but the reset pushed it out.
        assert!(mgr.list_expired().is_empty());
        let next = mgr.next_timer().unwrap();
        assert!(next > 5_000);
    }

    #[test]
    fn test_refresh_pushes_deadline() {
        let mgr = TimerManager::new();
        let t = mgr.add_timer(5_000, || {}, false);
        let before = mgr.next_timer().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(t.refresh());
        let after = mgr.next_timer().unwrap();
        assert!(after + 30 >= before);
    }

    #[test]
    fn test_front_notify_debounce() {
        let notified = Arc::new(AtomicUsize::new(0));
        let n = notified.clone();
        let mgr = TimerManager::with_front_notify(move || {
            n.fetch_add(1, Ordering::SeqCst);
        });
        let _a = mgr.add_timer(5_000, || {}, false);
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        // Earlier timer, but the debounce is still armed: no second hook
        // until an expiry scan resets it.
        let _b = mgr.add_timer(1_000, || {}, false);
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        mgr.list_expired();
        let _c = mgr.add_timer(500, || {}, false);
        assert_eq!(notified.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_clock_rollover_detection() {
        assert!(!clock_rolled_over(1_000, 2_000));
        assert!(!clock_rolled_over(2_000, 1_500)); // small backward step
        let hour = 60 * 60 * 1000;
        assert!(clock_rolled_over(10 * hour, 8 * hour));
        assert!(!clock_rolled_over(10 * hour, 10 * hour - hour / 2));
    }
}
