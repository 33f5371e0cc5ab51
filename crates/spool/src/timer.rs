//! Deadline-ordered timers.
//!
//! Timers live in a `BTreeMap` keyed by `(deadline, seq)`, so the minimum
//! deadline is always the first entry and every deadline change is a
//! remove-then-reinsert under the manager's write lock. Deadlines are
//! monotonic `Instant`s; a separate wall-clock observation detects large
//! backward steps and forces a full expiry pass so absolute deadlines can
//! never strand a mixed deployment.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime};

use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};

/// Wall-clock steps smaller than this are treated as NTP slew, not a
/// rollback.
const ROLLBACK_THRESHOLD: Duration = Duration::from_secs(60 * 60);

pub(crate) type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimerKey {
    deadline: Instant,
    seq: u64,
}

struct TimerInner {
    seq: u64,
    recurring: bool,
    period: Mutex<Duration>,
    deadline: Mutex<Instant>,
    /// Cleared on cancel and after a one-shot fires; `None` means the
    /// timer can never fire again.
    callback: Mutex<Option<TimerCallback>>,
}

struct TimerShared {
    timers: RwLock<BTreeMap<TimerKey, Arc<TimerInner>>>,
    /// Dedups front-insertion wakes until the reactor recomputes its wait.
    tickled: AtomicBool,
    front_waker: OnceCell<Box<dyn Fn() + Send + Sync>>,
    prev_wall: Mutex<SystemTime>,
    next_seq: AtomicU64,
}

/// Handle to a scheduled timer. Dropping the handle does not cancel the
/// timer.
pub struct Timer {
    inner: Arc<TimerInner>,
    manager: Weak<TimerShared>,
}

impl Timer {
    /// Removes the timer permanently; its callback never fires afterwards.
    /// Returns false if it already fired, was cancelled, or the manager is
    /// gone.
    pub fn cancel(&self) -> bool {
        let manager = match self.manager.upgrade() {
            Some(manager) => manager,
            None => return false,
        };
        let mut timers = manager.timers.write();
        let mut callback = self.inner.callback.lock();
        if callback.is_none() {
            return false;
        }
        *callback = None;
        let key = TimerKey {
            deadline: *self.inner.deadline.lock(),
            seq: self.inner.seq,
        };
        timers.remove(&key);
        true
    }

    /// Recomputes the deadline as now + period. Only moves the deadline
    /// later, so it never needs to wake the reactor.
    pub fn refresh(&self) -> bool {
        let manager = match self.manager.upgrade() {
            Some(manager) => manager,
            None => return false,
        };
        let mut timers = manager.timers.write();
        if self.inner.callback.lock().is_none() {
            return false;
        }
        let period = *self.inner.period.lock();
        let mut deadline = self.inner.deadline.lock();
        let key = TimerKey { deadline: *deadline, seq: self.inner.seq };
        if timers.remove(&key).is_none() {
            return false;
        }
        *deadline = Instant::now() + period;
        let key = TimerKey { deadline: *deadline, seq: self.inner.seq };
        drop(deadline);
        timers.insert(key, Arc::clone(&self.inner));
        true
    }

    /// Changes the period. `from_now` re-anchors the deadline to now;
    /// otherwise the original start offset is preserved.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        let new_period = Duration::from_millis(ms);
        if !from_now && new_period == *self.inner.period.lock() {
            return true;
        }
        let manager = match self.manager.upgrade() {
            Some(manager) => manager,
            None => return false,
        };
        {
            let mut timers = manager.timers.write();
            if self.inner.callback.lock().is_none() {
                return false;
            }
            let mut period = self.inner.period.lock();
            let mut deadline = self.inner.deadline.lock();
            let key = TimerKey { deadline: *deadline, seq: self.inner.seq };
            if timers.remove(&key).is_none() {
                return false;
            }
            let start = if from_now { Instant::now() } else { *deadline - *period };
            *period = new_period;
            *deadline = start + new_period;
        }
        // Reinsert outside the simple path so a new minimum wakes the
        // reactor like any fresh insertion.
        manager.insert(Arc::clone(&self.inner));
        true
    }
}

/// Thread-safe, deadline-ordered collection of one-shot and recurring
/// callbacks. Independent of fibers; the reactor composes one.
pub struct TimerManager {
    shared: Arc<TimerShared>,
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerManager {
    pub fn new() -> TimerManager {
        TimerManager {
            shared: Arc::new(TimerShared {
                timers: RwLock::new(BTreeMap::new()),
                tickled: AtomicBool::new(false),
                front_waker: OnceCell::new(),
                prev_wall: Mutex::new(SystemTime::now()),
                next_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Schedules `cb` to fire `ms` milliseconds from now.
    pub fn add_timer(
        &self,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> Timer {
        let period = Duration::from_millis(ms);
        let inner = Arc::new(TimerInner {
            seq: self.shared.next_seq.fetch_add(1, Ordering::Relaxed),
            recurring,
            period: Mutex::new(period),
            deadline: Mutex::new(Instant::now() + period),
            callback: Mutex::new(Some(Arc::new(cb))),
        });
        self.shared.insert(Arc::clone(&inner));
        Timer {
            inner,
            manager: Arc::downgrade(&self.shared),
        }
    }

    /// As [`add_timer`](Self::add_timer), but the callback is skipped when
    /// the object behind `cond` no longer exists at fire time.
    pub fn add_condition_timer<T: Send + Sync + 'static>(
        &self,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        cond: Weak<T>,
        recurring: bool,
    ) -> Timer {
        self.add_timer(
            ms,
            move || {
                if cond.upgrade().is_some() {
                    cb();
                }
            },
            recurring,
        )
    }

    /// Time until the earliest deadline; `None` when no timers exist,
    /// `Some(ZERO)` when one is already due. Also re-arms the
    /// front-insertion wake.
    pub fn next_timeout(&self) -> Option<Duration> {
        let timers = self.shared.timers.read();
        self.shared.tickled.store(false, Ordering::Relaxed);
        let (key, _) = timers.first_key_value()?;
        Some(key.deadline.saturating_duration_since(Instant::now()))
    }

    pub fn has_timer(&self) -> bool {
        !self.shared.timers.read().is_empty()
    }

    /// Pops every due timer and appends its callback to `out`. Recurring
    /// timers are reinserted anchored on the previous deadline, so a drain
    /// after a long gap collects one expiration per elapsed period. A
    /// detected clock rollback expires everything in a single pass.
    pub(crate) fn take_expired(&self, out: &mut Vec<TimerCallback>) {
        let now = Instant::now();
        let rollback = self.shared.detect_clock_rollback();
        let mut timers = self.shared.timers.write();

        if rollback {
            for (_, inner) in std::mem::take(&mut *timers) {
                let mut callback = inner.callback.lock();
                if inner.recurring {
                    if let Some(cb) = callback.as_ref() {
                        out.push(Arc::clone(cb));
                    }
                    drop(callback);
                    let next = now + *inner.period.lock();
                    *inner.deadline.lock() = next;
                    timers.insert(TimerKey { deadline: next, seq: inner.seq }, inner);
                } else if let Some(cb) = callback.take() {
                    out.push(cb);
                }
            }
            return;
        }

        loop {
            let due = match timers.first_key_value() {
                Some((key, _)) => key.deadline <= now,
                None => break,
            };
            if !due {
                break;
            }
            let (_, inner) = timers.pop_first().expect("checked non-empty");
            let mut callback = inner.callback.lock();
            if inner.recurring {
                if let Some(cb) = callback.as_ref() {
                    out.push(Arc::clone(cb));
                }
                drop(callback);
                let next = *inner.deadline.lock() + *inner.period.lock();
                *inner.deadline.lock() = next;
                timers.insert(TimerKey { deadline: next, seq: inner.seq }, inner);
            } else if let Some(cb) = callback.take() {
                out.push(cb);
            }
        }
    }

    /// Installs the hook invoked when a new timer becomes the minimum
    /// deadline. Set once, by the reactor that owns this manager.
    pub(crate) fn set_front_waker(&self, waker: impl Fn() + Send + Sync + 'static) {
        let _ = self.shared.front_waker.set(Box::new(waker));
    }

    #[cfg(test)]
    fn force_rollback_for_test(&self) {
        *self.shared.prev_wall.lock() = SystemTime::now() + Duration::from_secs(2 * 60 * 60);
    }
}

impl TimerShared {
    fn insert(&self, inner: Arc<TimerInner>) {
        let at_front;
        {
            let mut timers = self.timers.write();
            let key = TimerKey {
                deadline: *inner.deadline.lock(),
                seq: inner.seq,
            };
            timers.insert(key, inner);
            let is_front = timers
                .first_key_value()
                .map(|(first, _)| *first == key)
                .unwrap_or(false);
            // Wake at most once until next_timeout() resets the flag.
            at_front = is_front && !self.tickled.load(Ordering::Relaxed);
            if at_front {
                self.tickled.store(true, Ordering::Relaxed);
            }
        }
        if at_front {
            if let Some(waker) = self.front_waker.get() {
                waker();
            }
        }
    }

    fn detect_clock_rollback(&self) -> bool {
        let now = SystemTime::now();
        let mut prev = self.prev_wall.lock();
        let rolled = match prev.duration_since(now) {
            Ok(step) => step > ROLLBACK_THRESHOLD,
            Err(_) => false,
        };
        *prev = now;
        rolled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering::SeqCst;
    use std::thread;

    fn drain(manager: &TimerManager) -> usize {
        let mut cbs = Vec::new();
        manager.take_expired(&mut cbs);
        let n = cbs.len();
        for cb in cbs {
            cb();
        }
        n
    }

    #[test]
    fn test_one_shot_fires_exactly_once() {
        let manager = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        manager.add_timer(20, move || { h.fetch_add(1, SeqCst); }, false);

        assert_eq!(drain(&manager), 0);
        thread::sleep(Duration::from_millis(40));
        assert_eq!(drain(&manager), 1);
        assert_eq!(hits.load(SeqCst), 1);
        // A second drain collects nothing.
        assert_eq!(drain(&manager), 0);
        assert!(!manager.has_timer());
    }

    #[test]
    fn test_cancel_before_deadline() {
        let manager = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let timer = manager.add_timer(20, move || { h.fetch_add(1, SeqCst); }, false);

        assert!(timer.cancel());
        assert!(!timer.cancel());
        thread::sleep(Duration::from_millis(40));
        assert_eq!(drain(&manager), 0);
        assert_eq!(hits.load(SeqCst), 0);
    }

    #[test]
    fn test_recurring_catches_up() {
        let manager = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let start = Instant::now();
        let timer = manager.add_timer(100, move || { h.fetch_add(1, SeqCst); }, true);

        thread::sleep(Duration::from_millis(550));
        let n = drain(&manager);
        assert!(n >= 5, "expected at least 5 expirations, got {n}");
        assert!(
            n as u128 <= start.elapsed().as_millis() / 100,
            "collected more expirations than elapsed periods"
        );
        assert_eq!(hits.load(SeqCst), n);
        // Still armed for the next period.
        assert!(manager.has_timer());
        timer.cancel();
        assert!(!manager.has_timer());
    }

    #[test]
    fn test_refresh_pushes_deadline_back() {
        let manager = TimerManager::new();
        let timer = manager.add_timer(100, || {}, false);
        thread::sleep(Duration::from_millis(60));
        assert!(timer.refresh());
        // Old deadline (t=100) has passed relative to the refreshed one.
        thread::sleep(Duration::from_millis(60));
        let mut cbs = Vec::new();
        manager.take_expired(&mut cbs);
        assert!(cbs.is_empty(), "refreshed timer fired at the old deadline");
        thread::sleep(Duration::from_millis(60));
        manager.take_expired(&mut cbs);
        assert_eq!(cbs.len(), 1);
    }

    #[test]
    fn test_reset_from_now() {
        let manager = TimerManager::new();
        let timer = manager.add_timer(60_000, || {}, false);
        assert!(timer.reset(20, true));
        thread::sleep(Duration::from_millis(40));
        assert_eq!(drain(&manager), 1);
    }

    #[test]
    fn test_next_timeout() {
        let manager = TimerManager::new();
        assert_eq!(manager.next_timeout(), None);
        manager.add_timer(10_000, || {}, false);
        let next = manager.next_timeout().unwrap();
        assert!(next <= Duration::from_millis(10_000));
        assert!(next > Duration::from_millis(9_000));

        manager.add_timer(10, || {}, false);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(manager.next_timeout(), Some(Duration::ZERO));
    }

    #[test]
    fn test_front_waker_dedup() {
        let manager = TimerManager::new();
        let wakes = Arc::new(AtomicUsize::new(0));
        let w = Arc::clone(&wakes);
        manager.set_front_waker(move || { w.fetch_add(1, SeqCst); });

        manager.add_timer(1_000, || {}, false);
        assert_eq!(wakes.load(SeqCst), 1);
        // Not a new minimum: no wake.
        manager.add_timer(2_000, || {}, false);
        assert_eq!(wakes.load(SeqCst), 1);
        // New minimum, but the previous wake has not been consumed yet.
        manager.add_timer(500, || {}, false);
        assert_eq!(wakes.load(SeqCst), 1);

        // next_timeout() re-arms the wake.
        let _ = manager.next_timeout();
        manager.add_timer(100, || {}, false);
        assert_eq!(wakes.load(SeqCst), 2);
    }

    #[test]
    fn test_condition_timer_skips_dead_guard() {
        let manager = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let guard = Arc::new(());
        let h = Arc::clone(&hits);
        manager.add_condition_timer(10, move || { h.fetch_add(1, SeqCst); }, Arc::downgrade(&guard), false);
        drop(guard);

        let live_guard = Arc::new(());
        let h = Arc::clone(&hits);
        manager.add_condition_timer(10, move || { h.fetch_add(10, SeqCst); }, Arc::downgrade(&live_guard), false);

        thread::sleep(Duration::from_millis(30));
        assert_eq!(drain(&manager), 2);
        assert_eq!(hits.load(SeqCst), 10);
        drop(live_guard);
    }

    #[test]
    fn test_clock_rollback_expires_everything() {
        let manager = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        manager.add_timer(60_000, move || { h.fetch_add(1, SeqCst); }, false);

        manager.force_rollback_for_test();
        assert_eq!(drain(&manager), 1);
        assert_eq!(hits.load(SeqCst), 1);
        assert!(!manager.has_timer());
    }
}
