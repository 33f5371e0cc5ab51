//! Multi-threaded cooperative scheduler.
//!
//! A pool of worker threads pulls `{fiber | callback}` tasks from one
//! mutex-guarded queue. Tasks can pin themselves to a worker id; the
//! dispatch loop scans past entries pinned elsewhere (an O(n) walk under
//! the lock, acceptable while queues stay short). The caller thread can
//! participate as the highest-numbered worker, in which case `stop()`
//! drains remaining work on the calling thread before joining the rest.
//!
//! The reactor plugs in through the [`Schedule`] trait: `tickle` breaks a
//! blocked wait, `idle` is what a worker runs when the queue is empty, and
//! `stopping` extends the exit predicate with pending-work checks.

use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;

use crate::fiber::{self, Fiber, FiberState};

thread_local! {
    static WORKER_ID: Cell<Option<usize>> = Cell::new(None);
}

/// Id of the worker the calling thread dispatches for, if any.
pub fn current_worker() -> Option<usize> {
    WORKER_ID.with(|slot| slot.get())
}

type CallbackFn = Box<dyn FnOnce() + Send + 'static>;

/// A unit of schedulable work: an existing fiber to resume, or a callback
/// to run on a scratch fiber. Consumed exactly once by the dispatch loop.
pub enum ScheduleTask {
    Fiber(Arc<Fiber>),
    Callback(CallbackFn),
}

impl ScheduleTask {
    pub fn callback(f: impl FnOnce() + Send + 'static) -> ScheduleTask {
        ScheduleTask::Callback(Box::new(f))
    }
}

impl From<Arc<Fiber>> for ScheduleTask {
    fn from(fiber: Arc<Fiber>) -> ScheduleTask {
        ScheduleTask::Fiber(fiber)
    }
}

struct QueuedTask {
    task: ScheduleTask,
    affinity: Option<usize>,
}

/// State shared by every worker of one scheduler: the task queue plus the
/// idle/active counters and the stop flag. The queue mutex is the only
/// lock; counters are atomic.
pub(crate) struct SchedulerShared {
    name: String,
    queue: Mutex<VecDeque<QueuedTask>>,
    idle_threads: AtomicUsize,
    active_threads: AtomicUsize,
    stopping: AtomicBool,
}

impl SchedulerShared {
    pub(crate) fn new(name: &str) -> SchedulerShared {
        SchedulerShared {
            name: name.to_owned(),
            queue: Mutex::new(VecDeque::new()),
            idle_threads: AtomicUsize::new(0),
            active_threads: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Enqueues a task; true when the queue was empty before, i.e. the
    /// push that justifies a wake.
    fn push(&self, task: ScheduleTask, affinity: Option<usize>) -> bool {
        let mut queue = self.queue.lock();
        let was_empty = queue.is_empty();
        queue.push_back(QueuedTask { task, affinity });
        was_empty
    }

    pub(crate) fn has_idle_threads(&self) -> bool {
        self.idle_threads.load(Ordering::SeqCst) > 0
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Stop requested, queue drained, nobody mid-task.
    pub(crate) fn base_stopping(&self) -> bool {
        self.stop_requested()
            && self.active_threads.load(Ordering::SeqCst) == 0
            && self.queue.lock().is_empty()
    }
}

/// Hook points a scheduler flavor provides to the shared dispatch loop.
/// The base scheduler keeps the defaults; the reactor overrides all three.
pub(crate) trait Schedule: Send + Sync + 'static {
    fn shared(&self) -> &SchedulerShared;

    /// Wakes one blocked idle worker. The base idle loop polls, so there
    /// is nothing to interrupt.
    fn tickle(&self) {}

    /// True once no worker could ever receive more work.
    fn stopping(&self) -> bool {
        self.shared().base_stopping()
    }

    /// Body of the per-worker idle fiber. Runs until `stopping()`,
    /// yielding back to the dispatch loop between waits.
    fn idle(self: Arc<Self>)
    where
        Self: Sized,
    {
        while !self.stopping() {
            thread::sleep(Duration::from_millis(1));
            fiber::yield_now();
        }
    }

    /// Called once per worker before it enters the dispatch loop.
    fn on_worker_start(self: Arc<Self>, worker_id: usize)
    where
        Self: Sized,
    {
        let _ = worker_id;
    }
}

/// Enqueues a task, waking a worker only on the empty→non-empty
/// transition.
pub(crate) fn submit<S: Schedule>(sched: &Arc<S>, task: ScheduleTask, affinity: Option<usize>) {
    if sched.shared().push(task, affinity) {
        sched.tickle();
    }
}

/// The base scheduler flavor: queue only, polling idle loop.
pub(crate) struct BaseScheduler {
    shared: SchedulerShared,
}

impl Schedule for BaseScheduler {
    fn shared(&self) -> &SchedulerShared {
        &self.shared
    }
}

/// Per-worker dispatch loop. Runs on the worker thread's root context, or
/// on the caller thread's dedicated dispatch fiber.
pub(crate) fn dispatch<S: Schedule>(sched: &Arc<S>, worker_id: usize) {
    WORKER_ID.with(|slot| slot.set(Some(worker_id)));
    log::debug!("{}: worker {} dispatching", sched.shared().name(), worker_id);
    Arc::clone(sched).on_worker_start(worker_id);

    let idle_sched = Arc::clone(sched);
    let idle_fiber = Fiber::new(move || idle_sched.idle(), 0, true)
        .expect("failed to allocate idle fiber stack");
    // Scratch fiber for callback tasks, reused across dispatches.
    let mut scratch: Option<Arc<Fiber>> = None;
    let shared = sched.shared();

    loop {
        let mut task = None;
        let tickle_me;
        {
            let mut queue = shared.queue.lock();
            let mut idx = 0;
            while idx < queue.len() {
                if let Some(affinity) = queue[idx].affinity {
                    // Pinned to another worker; skip past it.
                    if affinity != worker_id {
                        idx += 1;
                        continue;
                    }
                }
                let entry = queue.remove(idx).expect("index in bounds");
                shared.active_threads.fetch_add(1, Ordering::SeqCst);
                task = Some(entry.task);
                break;
            }
            // Entries remain that some other worker could take.
            tickle_me = task.is_some() && !queue.is_empty();
        }
        if tickle_me {
            sched.tickle();
        }

        match task {
            Some(ScheduleTask::Fiber(fiber)) => {
                fiber.resume();
                // Whatever state the fiber came back in, it is on its own
                // now; fibers that want to run again resubmit themselves.
                shared.active_threads.fetch_sub(1, Ordering::SeqCst);
            }
            Some(ScheduleTask::Callback(cb)) => {
                let fiber = match scratch.take() {
                    Some(fiber) => {
                        fiber.reset(cb);
                        fiber
                    }
                    None => Fiber::new(cb, 0, true)
                        .expect("failed to allocate callback fiber stack"),
                };
                Arc::clone(&fiber).resume();
                // Only a finished fiber is reusable; one that yielded is
                // parked somewhere waiting for its wakeup.
                if fiber.state() == FiberState::Term {
                    scratch = Some(fiber);
                }
                shared.active_threads.fetch_sub(1, Ordering::SeqCst);
            }
            None => {
                if idle_fiber.state() == FiberState::Term {
                    break;
                }
                shared.idle_threads.fetch_add(1, Ordering::SeqCst);
                Arc::clone(&idle_fiber).resume();
                shared.idle_threads.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    log::debug!("{}: worker {} exiting", shared.name(), worker_id);
}

/// Thread-pool lifecycle shared by the base scheduler and the reactor:
/// spawned workers, optional caller participation, start/stop/join.
pub(crate) struct WorkerPool<S: Schedule> {
    sched: Arc<S>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    spawned: usize,
    caller_fiber: Mutex<Option<Arc<Fiber>>>,
    root_thread: ThreadId,
    started: AtomicBool,
}

impl<S: Schedule> WorkerPool<S> {
    /// `threads == 0` selects one worker per CPU. With `use_caller`, the
    /// constructing thread counts as the highest-numbered worker and the
    /// pool spawns one thread fewer.
    pub(crate) fn new(sched: Arc<S>, threads: usize, use_caller: bool) -> WorkerPool<S> {
        let threads = if threads == 0 { num_cpus::get() } else { threads };
        assert!(threads >= 1, "scheduler needs at least one worker");
        let spawned = if use_caller { threads - 1 } else { threads };

        let caller_fiber = if use_caller {
            let caller_sched = Arc::clone(&sched);
            let caller_id = spawned;
            let fiber = Fiber::new(move || dispatch(&caller_sched, caller_id), 0, false)
                .expect("failed to allocate caller dispatch fiber");
            // Task fibers on this thread must yield back to the dispatch
            // fiber, not the thread root.
            fiber::set_scheduler_fiber(Arc::clone(&fiber));
            Some(fiber)
        } else {
            None
        };

        WorkerPool {
            sched,
            threads: Mutex::new(Vec::new()),
            spawned,
            caller_fiber: Mutex::new(caller_fiber),
            root_thread: thread::current().id(),
            started: AtomicBool::new(false),
        }
    }

    pub(crate) fn sched(&self) -> &Arc<S> {
        &self.sched
    }

    pub(crate) fn on_root_thread(&self) -> bool {
        thread::current().id() == self.root_thread
    }

    pub(crate) fn start(&self) {
        let shared = self.sched.shared();
        if shared.stop_requested() {
            log::warn!("{}: start() after stop() ignored", shared.name());
            return;
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut threads = self.threads.lock();
        for id in 0..self.spawned {
            let sched = Arc::clone(&self.sched);
            let handle = thread::Builder::new()
                .name(format!("{}-worker-{}", shared.name(), id))
                .spawn(move || dispatch(&sched, id))
                .expect("failed to spawn worker thread");
            threads.push(handle);
        }
        log::debug!("{}: started {} workers", shared.name(), self.spawned);
    }

    pub(crate) fn schedule(&self, task: ScheduleTask, affinity: Option<usize>) {
        submit(&self.sched, task, affinity);
    }

    /// Requests stop, wakes every worker, drains remaining work on this
    /// thread when caller participation is enabled, then joins. Only the
    /// constructing thread may call this.
    pub(crate) fn stop(&self) {
        assert!(
            self.on_root_thread(),
            "stop() must be called from the thread that created the scheduler"
        );
        let shared = self.sched.shared();
        shared.stopping.store(true, Ordering::SeqCst);

        for _ in 0..self.spawned {
            self.sched.tickle();
        }

        let caller = self.caller_fiber.lock().take();
        if let Some(fiber) = caller {
            self.sched.tickle();
            fiber.resume();
            // The caller's dispatch fiber has terminated; later fibers on
            // this thread yield to the root again.
            fiber::set_scheduler_fiber(fiber::root_fiber());
        }

        let handles: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        log::debug!("{}: stopped", shared.name());
    }
}

/// Public scheduler over the base flavor: a thread pool, a task queue,
/// and nothing waking on I/O. See [`crate::IoManager`] for the reactor.
pub struct Scheduler {
    pool: WorkerPool<BaseScheduler>,
}

impl Scheduler {
    /// `threads == 0` selects one worker per CPU; `use_caller` lets the
    /// constructing thread drain work inside [`stop`](Self::stop).
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Scheduler {
        let sched = Arc::new(BaseScheduler {
            shared: SchedulerShared::new(name),
        });
        Scheduler {
            pool: WorkerPool::new(sched, threads, use_caller),
        }
    }

    pub fn name(&self) -> &str {
        self.pool.sched().shared().name()
    }

    pub fn start(&self) {
        self.pool.start();
    }

    pub fn stop(&self) {
        self.pool.stop();
    }

    /// Submits a task runnable on any worker.
    pub fn schedule(&self, task: impl Into<ScheduleTask>) {
        self.pool.schedule(task.into(), None);
    }

    /// Submits a task pinned to worker `affinity` when given.
    pub fn schedule_to(&self, task: impl Into<ScheduleTask>, affinity: Option<usize>) {
        self.pool.schedule(task.into(), affinity);
    }

    /// Convenience for scheduling a plain callback.
    pub fn spawn(&self, f: impl FnOnce() + Send + 'static) {
        self.pool.schedule(ScheduleTask::callback(f), None);
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if self.pool.on_root_thread() && !self.pool.sched().shared().stop_requested() {
            self.pool.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering::SeqCst;

    #[test]
    fn test_callbacks_drain_before_stop_returns() {
        let sched = Scheduler::new(2, false, "sched-test");
        sched.start();

        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let h = Arc::clone(&hits);
            sched.spawn(move || {
                h.fetch_add(1, SeqCst);
            });
        }
        sched.stop();
        assert_eq!(hits.load(SeqCst), 10);
    }

    #[test]
    fn test_caller_thread_drains_on_stop() {
        // One worker total and it is the caller: nothing runs until stop().
        let sched = Scheduler::new(1, true, "caller-test");
        sched.start();

        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let h = Arc::clone(&hits);
            sched.spawn(move || {
                h.fetch_add(1, SeqCst);
            });
        }
        assert_eq!(hits.load(SeqCst), 0);
        sched.stop();
        assert_eq!(hits.load(SeqCst), 5);
    }

    #[test]
    fn test_fiber_task_resumed_once() {
        let sched = Scheduler::new(1, false, "fiber-task-test");
        sched.start();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let fiber = Fiber::new(
            move || {
                h.fetch_add(1, SeqCst);
            },
            0,
            true,
        )
        .unwrap();
        sched.schedule(Arc::clone(&fiber));
        sched.stop();

        assert_eq!(hits.load(SeqCst), 1);
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_worker_id_visible_to_tasks() {
        let sched = Scheduler::new(2, false, "worker-id-test");
        sched.start();

        let seen = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..8 {
            let s = Arc::clone(&seen);
            sched.spawn(move || {
                s.lock().push(current_worker());
            });
        }
        sched.stop();

        let seen = seen.lock();
        assert_eq!(seen.len(), 8);
        for id in seen.iter() {
            assert!(matches!(id, Some(0) | Some(1)));
        }
    }
}
