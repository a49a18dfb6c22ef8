//! Background task scheduling.
//!
//! One fixed-cap thread pool per [`Priority`]. Tasks queue FIFO within their class;
//! workers are spawned lazily up to the class limit and live until shutdown. Classes do
//! not share workers, so LOW work keeps its own OS threads no matter how busy HIGH is.
//!
//! A task runs at most once and always runs eventually: shutdown drains each queue
//! before joining. Task failures (an `Err` or a panic) are logged and discarded; the
//! optional failure hook is the only way they leave the worker.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    Low,
    High,
    User,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::Low, Priority::High, Priority::User];

    fn index(self) -> usize {
        match self {
            Priority::Low => 0,
            Priority::High => 1,
            Priority::User => 2,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::High => "high",
            Priority::User => "user",
        };
        f.write_str(s)
    }
}

/// Shareable stop flag a task checks before starting expensive work.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Details of a task that returned an error or panicked.
#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub priority: Priority,
    pub task_id: u64,
    pub message: String,
    pub panicked: bool,
}

pub type TaskFailureHook = Arc<dyn Fn(&TaskFailure) + Send + Sync>;
type ThreadStartHook = Arc<dyn Fn() + Send + Sync>;

type Task = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

struct Job {
    id: u64,
    task: Task,
}

struct PoolState {
    queue: VecDeque<Job>,
    running: usize,
    max_threads: usize,
    spawned: usize,
    handles: Vec<JoinHandle<()>>,
    exit: bool,
}

struct ThreadPool {
    priority: Priority,
    state: Mutex<PoolState>,
    work_cv: Condvar,
    idle_cv: Condvar,
    on_failure: Option<TaskFailureHook>,
    on_thread_start: Option<ThreadStartHook>,
}

impl ThreadPool {
    fn new(
        priority: Priority,
        max_threads: usize,
        on_failure: Option<TaskFailureHook>,
        on_thread_start: Option<ThreadStartHook>,
    ) -> Self {
        Self {
            priority,
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                running: 0,
                max_threads: max_threads.max(1),
                spawned: 0,
                handles: Vec::new(),
                exit: false,
            }),
            work_cv: Condvar::new(),
            idle_cv: Condvar::new(),
            on_failure,
            on_thread_start,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn workers while queued jobs outnumber free workers and the cap allows.
    fn grow_if_needed(self: &Arc<Self>, st: &mut PoolState) {
        while st.spawned < st.max_threads && st.spawned - st.running < st.queue.len() {
            let pool = Arc::clone(self);
            let index = st.spawned;
            let name = format!("bg-{}-{}", self.priority, index);
            match thread::Builder::new().name(name).spawn(move || pool.worker_loop(index)) {
                Ok(handle) => {
                    st.handles.push(handle);
                    st.spawned += 1;
                    debug!(priority = %self.priority, workers = st.spawned, "spawned background worker");
                }
                Err(e) => {
                    // Existing workers (if any) still drain the queue.
                    warn!(priority = %self.priority, error = %e, "failed to spawn background worker");
                    break;
                }
            }
        }
    }

    fn submit(self: &Arc<Self>, job: Job) {
        let mut st = self.lock();
        if st.exit {
            warn!(priority = %self.priority, task_id = job.id, "task submitted during shutdown; running inline");
            drop(st);
            self.run_job(job);
            return;
        }
        trace!(priority = %self.priority, task_id = job.id, queued = st.queue.len() + 1, "task queued");
        st.queue.push_back(job);
        self.grow_if_needed(&mut st);
        drop(st);
        self.work_cv.notify_one();
    }

    fn worker_loop(&self, index: usize) {
        if let Some(hook) = &self.on_thread_start {
            hook();
        }
        trace!(priority = %self.priority, index, "worker started");
        loop {
            let job = {
                let mut st = self.lock();
                loop {
                    if st.running < st.max_threads {
                        if let Some(job) = st.queue.pop_front() {
                            st.running += 1;
                            break job;
                        }
                    }
                    if st.exit && st.queue.is_empty() {
                        trace!(priority = %self.priority, index, "worker exiting");
                        return;
                    }
                    st = self.work_cv.wait(st).unwrap_or_else(PoisonError::into_inner);
                }
            };

            self.run_job(job);

            let mut st = self.lock();
            st.running -= 1;
            let idle = st.running == 0 && st.queue.is_empty();
            drop(st);
            self.work_cv.notify_one();
            if idle {
                self.idle_cv.notify_all();
            }
        }
    }

    fn run_job(&self, job: Job) {
        let Job { id, task } = job;
        let failure = match catch_unwind(AssertUnwindSafe(task)) {
            Ok(Ok(())) => {
                trace!(priority = %self.priority, task_id = id, "task completed");
                return;
            }
            Ok(Err(e)) => TaskFailure {
                priority: self.priority,
                task_id: id,
                message: format!("{e:#}"),
                panicked: false,
            },
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                TaskFailure {
                    priority: self.priority,
                    task_id: id,
                    message,
                    panicked: true,
                }
            }
        };
        error!(
            priority = %failure.priority,
            task_id = failure.task_id,
            panicked = failure.panicked,
            error = %failure.message,
            "background task failed; error discarded"
        );
        if let Some(hook) = &self.on_failure {
            hook(&failure);
        }
    }

    fn set_max(self: &Arc<Self>, n: usize) {
        let mut st = self.lock();
        if n <= st.max_threads {
            trace!(priority = %self.priority, requested = n, current = st.max_threads, "pool limit unchanged");
            return;
        }
        st.max_threads = n;
        debug!(priority = %self.priority, max_threads = n, "raised pool limit");
        self.grow_if_needed(&mut st);
        drop(st);
        self.work_cv.notify_all();
    }

    fn wait_idle(&self) {
        let mut st = self.lock();
        while st.running > 0 || !st.queue.is_empty() {
            st = self.idle_cv.wait(st).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn shutdown(&self) {
        let handles = {
            let mut st = self.lock();
            st.exit = true;
            std::mem::take(&mut st.handles)
        };
        self.work_cv.notify_all();
        let me = thread::current().id();
        for h in handles {
            if h.thread().id() == me {
                // Last Env reference dropped from inside a task; the worker exits on its own.
                continue;
            }
            if h.join().is_err() {
                warn!(priority = %self.priority, "background worker panicked outside a task");
            }
        }
    }
}

/// Per-class worker counts and hooks used to build a [`Scheduler`].
#[derive(Clone, Default)]
pub(crate) struct SchedulerOptions {
    pub low_threads: usize,
    pub high_threads: usize,
    pub user_threads: usize,
    pub lower_low_priority: bool,
    pub on_failure: Option<TaskFailureHook>,
    pub on_low_thread_start: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl fmt::Debug for SchedulerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerOptions")
            .field("low_threads", &self.low_threads)
            .field("high_threads", &self.high_threads)
            .field("user_threads", &self.user_threads)
            .field("lower_low_priority", &self.lower_low_priority)
            .field("on_failure", &self.on_failure.is_some())
            .finish()
    }
}

pub struct Scheduler {
    pools: [Arc<ThreadPool>; 3],
    next_id: AtomicU64,
}

impl Scheduler {
    pub(crate) fn new(opts: SchedulerOptions) -> Self {
        let low_hook = if opts.lower_low_priority { opts.on_low_thread_start.clone() } else { None };
        let pool = |p: Priority, n: usize, start: Option<ThreadStartHook>| {
            Arc::new(ThreadPool::new(p, n, opts.on_failure.clone(), start))
        };
        Self {
            pools: [
                pool(Priority::Low, opts.low_threads, low_hook),
                pool(Priority::High, opts.high_threads, None),
                pool(Priority::User, opts.user_threads, None),
            ],
            next_id: AtomicU64::new(1),
        }
    }

    fn pool(&self, p: Priority) -> &Arc<ThreadPool> {
        &self.pools[p.index()]
    }

    /// Queue `task` on the `priority` class and return immediately.
    pub fn schedule<F>(&self, priority: Priority, task: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.pool(priority).submit(Job { id, task: Box::new(task) });
    }

    /// Raise the worker cap for `priority` to at least `n`. Pools never shrink.
    pub fn inc_background_threads_if_needed(&self, priority: Priority, n: usize) {
        self.pool(priority).set_max(n);
    }

    pub fn background_threads(&self, priority: Priority) -> usize {
        self.pool(priority).lock().max_threads
    }

    /// Workers actually started so far (lazy, never above the cap).
    pub fn spawned_threads(&self, priority: Priority) -> usize {
        self.pool(priority).lock().spawned
    }

    pub fn queue_len(&self, priority: Priority) -> usize {
        self.pool(priority).lock().queue.len()
    }

    pub fn running(&self, priority: Priority) -> usize {
        self.pool(priority).lock().running
    }

    /// Block until the class has nothing queued or running.
    pub fn wait_idle(&self, priority: Priority) {
        self.pool(priority).wait_idle();
    }

    fn shutdown(&self) {
        for p in &self.pools {
            p.shutdown();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
