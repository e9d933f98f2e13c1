//! Completion scheduling: a fixed thread-pool executor for trampolining
//! callbacks off store threads, a single-threaded timer for delayed tasks,
//! and an async-op tracker used to drain in-flight work at shutdown.

use crate::error::Result;
use log::debug;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// One-shot completion callback carrying the operation result.
pub type Completion = Box<dyn FnOnce(Result<()>) + Send + 'static>;
/// One-shot completion callback carrying read payload or error.
pub type BytesCompletion = Box<dyn FnOnce(Result<Vec<u8>>) + Send + 'static>;

pub fn completion<F>(f: F) -> Completion
where
    F: FnOnce(Result<()>) + Send + 'static,
{
    Box::new(f)
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct ExecutorState {
    queue: VecDeque<Job>,
    shutdown: bool,
}

struct ExecutorShared {
    state: Mutex<ExecutorState>,
    cond: Condvar,
}

/// Fixed-size worker pool. Store completion threads hand long-running work
/// here; queued jobs still run during shutdown drain.
#[derive(Clone)]
pub struct Executor {
    shared: Arc<ExecutorShared>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Executor {
    pub fn new(name: &str, threads: usize) -> Self {
        let shared = Arc::new(ExecutorShared {
            state: Mutex::new(ExecutorState {
                queue: VecDeque::new(),
                shutdown: false,
            }),
            cond: Condvar::new(),
        });

        let mut handles = Vec::with_capacity(threads.max(1));
        for index in 0..threads.max(1) {
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("{}-{}", name, index))
                .spawn(move || Self::worker_loop(&shared))
                .expect("spawn executor worker");
            handles.push(handle);
        }

        Self {
            shared,
            workers: Arc::new(Mutex::new(handles)),
        }
    }

    fn worker_loop(shared: &ExecutorShared) {
        loop {
            let job = {
                let mut state = shared.state.lock();
                loop {
                    if let Some(job) = state.queue.pop_front() {
                        break job;
                    }
                    if state.shutdown {
                        return;
                    }
                    shared.cond.wait(&mut state);
                }
            };
            job();
        }
    }

    pub fn queue<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            debug!("event=executor_job_dropped reason=shutdown");
            return;
        }
        state.queue.push_back(Box::new(job));
        self.shared.cond.notify_one();
    }

    /// Complete `cb` with `result` on a pool thread.
    pub fn complete(&self, cb: Completion, result: Result<()>) {
        self.queue(move || cb(result));
    }

    /// Drains queued jobs and joins the workers. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            self.shared.cond.notify_all();
        }
        let handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

struct ScheduledTask {
    deadline: Instant,
    job: Job,
}

struct TimerState {
    tasks: BTreeMap<u64, ScheduledTask>,
    next_id: u64,
    shutdown: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    cond: Condvar,
}

/// Handle to a scheduled task; pass back to [`TaskTimer::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerToken(u64);

/// Single-threaded timer running delayed tasks (watch re-arm,
/// commit-position coalescing, appender age flushes).
#[derive(Clone)]
pub struct TaskTimer {
    shared: Arc<TimerShared>,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl TaskTimer {
    pub fn new(name: &str) -> Self {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                tasks: BTreeMap::new(),
                next_id: 0,
                shutdown: false,
            }),
            cond: Condvar::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || Self::timer_loop(&thread_shared))
            .expect("spawn timer thread");

        Self {
            shared,
            thread: Arc::new(Mutex::new(Some(handle))),
        }
    }

    fn timer_loop(shared: &TimerShared) {
        let mut state = shared.state.lock();
        loop {
            if state.shutdown {
                return;
            }
            let now = Instant::now();
            let due = state
                .tasks
                .iter()
                .filter(|(_, task)| task.deadline <= now)
                .map(|(&id, _)| id)
                .min();
            if let Some(id) = due {
                let task = state.tasks.remove(&id).expect("due task present");
                drop(state);
                (task.job)();
                state = shared.state.lock();
                continue;
            }
            match state.tasks.values().map(|task| task.deadline).min() {
                Some(deadline) => {
                    shared.cond.wait_until(&mut state, deadline);
                }
                None => {
                    shared.cond.wait(&mut state);
                }
            }
        }
    }

    pub fn schedule<F>(&self, delay: Duration, job: F) -> TimerToken
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.tasks.insert(
            id,
            ScheduledTask {
                deadline: Instant::now() + delay,
                job: Box::new(job),
            },
        );
        self.shared.cond.notify_one();
        TimerToken(id)
    }

    /// Returns true when the task was cancelled before firing.
    pub fn cancel(&self, token: TimerToken) -> bool {
        let mut state = self.shared.state.lock();
        state.tasks.remove(&token.0).is_some()
    }

    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.tasks.clear();
            self.shared.cond.notify_all();
        }
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

struct CountdownState {
    remaining: usize,
    result: Result<()>,
    on_finish: Option<Completion>,
}

/// Fans several completions into one callback; the first error delivered
/// wins. A zero count completes immediately.
pub struct Countdown {
    state: Mutex<CountdownState>,
}

impl Countdown {
    pub fn new(count: usize, on_finish: Completion) -> Arc<Self> {
        if count == 0 {
            on_finish(Ok(()));
            return Arc::new(Self {
                state: Mutex::new(CountdownState {
                    remaining: 0,
                    result: Ok(()),
                    on_finish: None,
                }),
            });
        }
        Arc::new(Self {
            state: Mutex::new(CountdownState {
                remaining: count,
                result: Ok(()),
                on_finish: Some(on_finish),
            }),
        })
    }

    pub fn completion(self: &Arc<Self>) -> Completion {
        let countdown = Arc::clone(self);
        Box::new(move |result| {
            let finish = {
                let mut state = countdown.state.lock();
                debug_assert!(state.remaining > 0, "countdown over-completed");
                if state.result.is_ok() {
                    if let Err(err) = result {
                        state.result = Err(err);
                    }
                }
                state.remaining -= 1;
                if state.remaining == 0 {
                    state.on_finish.take().map(|cb| (cb, state.result.clone()))
                } else {
                    None
                }
            };
            if let Some((cb, result)) = finish {
                cb(result);
            }
        })
    }
}

/// Counts in-flight asynchronous operations so shutdown can wait for the
/// last completion instead of racing it.
#[derive(Default)]
pub struct AsyncOpTracker {
    pending: Mutex<u64>,
    cond: Condvar,
}

impl AsyncOpTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_op(&self) {
        *self.pending.lock() += 1;
    }

    pub fn finish_op(&self) {
        let mut pending = self.pending.lock();
        debug_assert!(*pending > 0, "finish_op without start_op");
        *pending -= 1;
        if *pending == 0 {
            self.cond.notify_all();
        }
    }

    pub fn wait_for_ops(&self) {
        let mut pending = self.pending.lock();
        while *pending > 0 {
            self.cond.wait(&mut pending);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn executor_runs_queued_jobs() {
        let executor = Executor::new("test-exec", 2);
        let counter = Arc::new(AtomicU64::new(0));
        let tracker = Arc::new(AsyncOpTracker::new());
        for _ in 0..16 {
            let counter = Arc::clone(&counter);
            let tracker = Arc::clone(&tracker);
            tracker.start_op();
            executor.queue(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                tracker.finish_op();
            });
        }
        tracker.wait_for_ops();
        executor.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn executor_drains_queue_on_shutdown() {
        let executor = Executor::new("drain-exec", 1);
        let counter = Arc::new(AtomicU64::new(0));
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            executor.queue(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        executor.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn timer_fires_after_delay() {
        let timer = TaskTimer::new("test-timer");
        let tracker = Arc::new(AsyncOpTracker::new());
        let fired = Arc::new(AtomicU64::new(0));

        tracker.start_op();
        let fired_clone = Arc::clone(&fired);
        let tracker_clone = Arc::clone(&tracker);
        timer.schedule(Duration::from_millis(10), move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
            tracker_clone.finish_op();
        });
        tracker.wait_for_ops();
        timer.shutdown();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelled_tasks_do_not_fire() {
        let timer = TaskTimer::new("cancel-timer");
        let fired = Arc::new(AtomicU64::new(0));
        let fired_clone = Arc::clone(&fired);
        let token = timer.schedule(Duration::from_secs(30), move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timer.cancel(token));
        assert!(!timer.cancel(token));
        timer.shutdown();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn tasks_run_in_deadline_order() {
        let timer = TaskTimer::new("order-timer");
        let tracker = Arc::new(AsyncOpTracker::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        for (delay_ms, label) in [(30u64, "late"), (5, "early")] {
            tracker.start_op();
            let order = Arc::clone(&order);
            let tracker = Arc::clone(&tracker);
            timer.schedule(Duration::from_millis(delay_ms), move || {
                order.lock().push(label);
                tracker.finish_op();
            });
        }
        tracker.wait_for_ops();
        timer.shutdown();
        assert_eq!(*order.lock(), vec!["early", "late"]);
    }
}
