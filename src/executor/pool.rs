//! Scaling thread pool executor.
//!
//! The pool manages a set of OS threads fed from a lock-free injection
//! queue. It supports:
//!
//! - **Capacity management**: configurable min/max threads with lazy spawn
//!   and idle retirement
//! - **Rejection**: `execute` after shutdown returns a typed rejection that
//!   fails the stage being scheduled
//! - **Shutdown**: graceful shutdown with a bounded drain timeout
//!
//! # Thread Lifecycle
//!
//! Threads are spawned lazily up to `max_threads` when all active threads
//! are busy and work is pending. When idle beyond `idle_timeout`, threads
//! above `min_threads` retire. [`ThreadPool::fixed`] pins both bounds to
//! the same value for the classic fixed-size pool.
//!
//! # Example
//!
//! ```
//! use stagechain::ThreadPool;
//!
//! let pool = ThreadPool::fixed(2);
//! let stage = pool.submit(|| Ok("done"));
//! assert_eq!(*stage.get().unwrap(), "done");
//! pool.shutdown();
//! ```

use crossbeam_queue::SegQueue;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle as ThreadJoinHandle};
use std::time::Duration;

use crate::error::{BoxError, RejectedError};
use crate::executor::{Executor, ExecutorHandle, Job};
use crate::stage::Stage;
use crate::tracing_compat::{debug, trace};

/// Default idle timeout before retiring excess threads.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration options for the thread pool.
#[derive(Clone)]
pub struct PoolOptions {
    /// Idle timeout before retiring excess threads.
    pub idle_timeout: Duration,
    /// Thread name prefix.
    pub thread_name_prefix: String,
    /// Callback when a worker thread starts.
    pub on_thread_start: Option<Arc<dyn Fn() + Send + Sync>>,
    /// Callback when a worker thread stops.
    pub on_thread_stop: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            thread_name_prefix: "stagechain".to_string(),
            on_thread_start: None,
            on_thread_stop: None,
        }
    }
}

impl fmt::Debug for PoolOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolOptions")
            .field("idle_timeout", &self.idle_timeout)
            .field("thread_name_prefix", &self.thread_name_prefix)
            .field("on_thread_start", &self.on_thread_start.is_some())
            .field("on_thread_stop", &self.on_thread_stop.is_some())
            .finish()
    }
}

struct PoolInner {
    /// Minimum number of threads to keep alive.
    min_threads: usize,
    /// Maximum number of threads allowed.
    max_threads: usize,
    /// Current number of live worker threads.
    active_threads: AtomicUsize,
    /// Number of threads currently executing a job.
    busy_threads: AtomicUsize,
    /// Number of pending jobs in the queue.
    pending_count: AtomicUsize,
    /// Injection queue.
    queue: SegQueue<Job>,
    /// Shutdown flag.
    shutdown: AtomicBool,
    /// Condition variable for thread parking.
    condvar: Condvar,
    /// Mutex for the condition variable.
    mutex: Mutex<()>,
    /// Idle timeout for excess threads.
    idle_timeout: Duration,
    /// Thread name prefix.
    thread_name_prefix: String,
    /// Callback when a worker thread starts.
    on_thread_start: Option<Arc<dyn Fn() + Send + Sync>>,
    /// Callback when a worker thread stops.
    on_thread_stop: Option<Arc<dyn Fn() + Send + Sync>>,
    /// Worker join handles for cleanup.
    thread_handles: Mutex<Vec<ThreadJoinHandle<()>>>,
}

impl PoolInner {
    fn notify_one(&self) {
        let _guard = self.mutex.lock().unwrap();
        self.condvar.notify_one();
    }

    fn notify_all(&self) {
        let _guard = self.mutex.lock().unwrap();
        self.condvar.notify_all();
    }
}

/// A cloneable handle to a [`ThreadPool`].
///
/// Handles submit work but do not own the worker threads; dropping the
/// last handle does not shut the pool down.
#[derive(Clone)]
pub struct PoolHandle {
    inner: Arc<PoolInner>,
}

impl PoolHandle {
    /// Submits a root stage running `computation` on this pool.
    pub fn submit<T, F>(&self, computation: F) -> Stage<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Result<T, BoxError> + Send + 'static,
    {
        let executor: ExecutorHandle = Arc::new(self.clone());
        Stage::run_on(&executor, computation)
    }

    /// Returns the number of pending jobs.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending_count.load(Ordering::Relaxed)
    }

    /// Returns the number of live worker threads.
    #[must_use]
    pub fn active_threads(&self) -> usize {
        self.inner.active_threads.load(Ordering::Relaxed)
    }

    /// Returns true if the pool is shut down.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }
}

impl Executor for PoolHandle {
    fn execute(&self, job: Job) -> Result<(), RejectedError> {
        submit_job(&self.inner, job)
    }
}

impl fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolHandle")
            .field("active_threads", &self.active_threads())
            .field("pending_jobs", &self.pending_count())
            .finish()
    }
}

/// A scaling pool of worker threads.
///
/// Dropping the pool initiates shutdown and waits briefly for workers to
/// drain.
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

impl ThreadPool {
    /// Creates a pool with the given thread bounds and default options.
    ///
    /// # Panics
    ///
    /// Panics if `max_threads` is 0.
    #[must_use]
    pub fn new(min_threads: usize, max_threads: usize) -> Self {
        Self::with_options(min_threads, max_threads, PoolOptions::default())
    }

    /// Creates a fixed-size pool of `threads` workers, all spawned eagerly.
    ///
    /// # Panics
    ///
    /// Panics if `threads` is 0.
    #[must_use]
    pub fn fixed(threads: usize) -> Self {
        Self::new(threads, threads)
    }

    /// Creates a pool with custom options.
    ///
    /// # Panics
    ///
    /// Panics if `max_threads` is 0.
    #[must_use]
    pub fn with_options(min_threads: usize, max_threads: usize, options: PoolOptions) -> Self {
        assert!(max_threads > 0, "max_threads must be at least 1");
        let max_threads = max_threads.max(min_threads);

        let inner = Arc::new(PoolInner {
            min_threads,
            max_threads,
            active_threads: AtomicUsize::new(0),
            busy_threads: AtomicUsize::new(0),
            pending_count: AtomicUsize::new(0),
            queue: SegQueue::new(),
            shutdown: AtomicBool::new(false),
            condvar: Condvar::new(),
            mutex: Mutex::new(()),
            idle_timeout: options.idle_timeout,
            thread_name_prefix: options.thread_name_prefix,
            on_thread_start: options.on_thread_start,
            on_thread_stop: options.on_thread_stop,
            thread_handles: Mutex::new(Vec::with_capacity(max_threads)),
        });

        for _ in 0..min_threads {
            spawn_thread(&inner);
        }

        Self { inner }
    }

    /// Returns a cloneable handle to this pool.
    #[must_use]
    pub fn handle(&self) -> PoolHandle {
        PoolHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Returns a shared executor handle backed by this pool.
    #[must_use]
    pub fn executor(&self) -> ExecutorHandle {
        Arc::new(self.handle())
    }

    /// Submits a root stage running `computation` on this pool.
    pub fn submit<T, F>(&self, computation: F) -> Stage<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Result<T, BoxError> + Send + 'static,
    {
        self.handle().submit(computation)
    }

    /// Returns the number of pending jobs.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending_count.load(Ordering::Relaxed)
    }

    /// Returns the number of live worker threads.
    #[must_use]
    pub fn active_threads(&self) -> usize {
        self.inner.active_threads.load(Ordering::Relaxed)
    }

    /// Returns the number of threads currently executing a job.
    #[must_use]
    pub fn busy_threads(&self) -> usize {
        self.inner.busy_threads.load(Ordering::Relaxed)
    }

    /// Returns true if the pool is shut down.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Initiates shutdown.
    ///
    /// New submissions are rejected; jobs already queued continue to
    /// execute.
    pub fn shutdown(&self) {
        debug!("thread pool shutting down");
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.notify_all();
    }

    /// Shuts down and waits up to `timeout` for all workers to exit.
    ///
    /// Returns true if every worker exited before the deadline.
    pub fn shutdown_and_wait(&self, timeout: Duration) -> bool {
        self.shutdown();

        let deadline = std::time::Instant::now() + timeout;
        while self.inner.active_threads.load(Ordering::Acquire) > 0 {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            // Wake parked workers so they notice the shutdown flag
            self.inner.notify_all();
            thread::sleep(Duration::from_millis(10).min(remaining));
        }

        let mut handles = self.inner.thread_handles.lock().unwrap();
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
        true
    }
}

impl Executor for ThreadPool {
    fn execute(&self, job: Job) -> Result<(), RejectedError> {
        submit_job(&self.inner, job)
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("min_threads", &self.inner.min_threads)
            .field("max_threads", &self.inner.max_threads)
            .field("active_threads", &self.active_threads())
            .field("pending_jobs", &self.pending_count())
            .finish()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
        let _ = self.shutdown_and_wait(Duration::from_secs(5));
    }
}

/// Enqueues a job, waking or spawning a worker as needed.
fn submit_job(inner: &Arc<PoolInner>, job: Job) -> Result<(), RejectedError> {
    if inner.shutdown.load(Ordering::Acquire) {
        return Err(RejectedError::new("thread pool is shut down"));
    }
    inner.queue.push(job);
    inner.pending_count.fetch_add(1, Ordering::Relaxed);
    maybe_spawn_thread(inner);
    inner.notify_one();
    Ok(())
}

/// Spawns a new worker thread on the given pool.
fn spawn_thread(inner: &Arc<PoolInner>) {
    let inner_clone = Arc::clone(inner);
    let thread_id = inner.active_threads.fetch_add(1, Ordering::Relaxed);
    let name = format!("{}-worker-{}", inner.thread_name_prefix, thread_id);
    trace!(worker = %name, "spawning pool worker");

    let handle = thread::Builder::new()
        .name(name)
        .spawn(move || {
            if let Some(ref callback) = inner_clone.on_thread_start {
                callback();
            }

            worker_loop(&inner_clone);

            if let Some(ref callback) = inner_clone.on_thread_stop {
                callback();
            }

            inner_clone.active_threads.fetch_sub(1, Ordering::Relaxed);
        })
        .expect("failed to spawn pool worker thread");

    inner.thread_handles.lock().unwrap().push(handle);
}

/// Spawns a new thread if all live workers are busy and work is pending.
fn maybe_spawn_thread(inner: &Arc<PoolInner>) {
    let active = inner.active_threads.load(Ordering::Relaxed);
    let busy = inner.busy_threads.load(Ordering::Relaxed);
    let pending = inner.pending_count.load(Ordering::Relaxed);

    if active < inner.max_threads && busy >= active && pending > 0 {
        spawn_thread(inner);
    }
}

/// The worker scheduling loop.
fn worker_loop(inner: &PoolInner) {
    loop {
        if let Some(job) = inner.queue.pop() {
            inner.pending_count.fetch_sub(1, Ordering::Relaxed);
            inner.busy_threads.fetch_add(1, Ordering::Relaxed);
            // A panicking job must not take the worker down with it; the
            // stage layer converts panics before they reach the pool, so
            // this only fires for raw jobs submitted through `execute`.
            let outcome = catch_unwind(AssertUnwindSafe(job));
            if outcome.is_err() {
                debug!("pool job panicked");
            }
            inner.busy_threads.fetch_sub(1, Ordering::Relaxed);
            continue;
        }

        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }

        let active = inner.active_threads.load(Ordering::Relaxed);
        if active > inner.min_threads {
            // Park with timeout, retiring if still idle afterwards
            let result = inner
                .condvar
                .wait_timeout(inner.mutex.lock().unwrap(), inner.idle_timeout)
                .unwrap();

            if result.1.timed_out()
                && inner.queue.is_empty()
                && inner.active_threads.load(Ordering::Relaxed) > inner.min_threads
            {
                trace!("retiring idle pool worker");
                break;
            }
        } else {
            let guard = inner.mutex.lock().unwrap();
            let _guard = inner.condvar.wait(guard).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;

    #[test]
    fn execute_runs_job() {
        let pool = ThreadPool::fixed(2);
        let counter = Arc::new(AtomicI32::new(0));

        let c = Arc::clone(&counter);
        pool.handle()
            .execute(Box::new(move || {
                c.fetch_add(1, Ordering::Relaxed);
            }))
            .unwrap();

        thread::sleep(Duration::from_millis(100));
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn submit_returns_completed_stage() {
        let pool = ThreadPool::fixed(2);
        let stage = pool.submit(|| Ok(7));
        assert_eq!(*stage.get().unwrap(), 7);
    }

    #[test]
    fn fixed_pool_spawns_eagerly() {
        let pool = ThreadPool::fixed(3);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(pool.active_threads(), 3);
    }

    #[test]
    fn execute_after_shutdown_is_rejected() {
        let pool = ThreadPool::fixed(1);
        pool.shutdown();
        let result = pool.handle().execute(Box::new(|| {}));
        assert!(result.is_err());
    }

    #[test]
    fn shutdown_idempotent() {
        let pool = ThreadPool::new(1, 2);
        pool.shutdown();
        assert!(pool.is_shutdown());
        pool.shutdown();
        assert!(pool.is_shutdown());
        assert!(pool.shutdown_and_wait(Duration::from_secs(2)));
    }

    #[test]
    fn queued_jobs_drain_during_shutdown() {
        let pool = ThreadPool::new(2, 4);
        let counter = Arc::new(AtomicI32::new(0));

        for _ in 0..10 {
            let c = Arc::clone(&counter);
            pool.handle()
                .execute(Box::new(move || {
                    c.fetch_add(1, Ordering::Relaxed);
                }))
                .unwrap();
        }

        assert!(pool.shutdown_and_wait(Duration::from_secs(5)));
        assert_eq!(counter.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn panicking_job_does_not_kill_worker() {
        let pool = ThreadPool::fixed(1);
        pool.handle()
            .execute(Box::new(|| panic!("intentional panic")))
            .unwrap();

        thread::sleep(Duration::from_millis(50));

        let counter = Arc::new(AtomicI32::new(0));
        let c = Arc::clone(&counter);
        pool.handle()
            .execute(Box::new(move || {
                c.fetch_add(1, Ordering::Relaxed);
            }))
            .unwrap();

        thread::sleep(Duration::from_millis(100));
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn excess_threads_retire_after_idle_timeout() {
        let options = PoolOptions {
            idle_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let pool = ThreadPool::with_options(0, 3, options);

        let barrier = Arc::new(std::sync::Barrier::new(4));
        for _ in 0..3 {
            let b = Arc::clone(&barrier);
            pool.handle()
                .execute(Box::new(move || {
                    b.wait();
                }))
                .unwrap();
        }

        thread::sleep(Duration::from_millis(50));
        assert!(pool.active_threads() >= 1);

        barrier.wait();
        thread::sleep(Duration::from_millis(400));
        assert!(
            pool.active_threads() <= 1,
            "expected excess workers to retire, active={}",
            pool.active_threads()
        );
    }

    #[test]
    fn concurrent_submitters() {
        let pool = ThreadPool::new(2, 8);
        let counter = Arc::new(AtomicI32::new(0));
        let mut submitters = Vec::new();

        for _ in 0..4 {
            let handle = pool.handle();
            let c = Arc::clone(&counter);
            submitters.push(thread::spawn(move || {
                for _ in 0..50 {
                    let c_inner = Arc::clone(&c);
                    handle
                        .execute(Box::new(move || {
                            c_inner.fetch_add(1, Ordering::Relaxed);
                        }))
                        .unwrap();
                }
            }));
        }

        for submitter in submitters {
            submitter.join().expect("submitter panicked");
        }

        assert!(pool.shutdown_and_wait(Duration::from_secs(5)));
        assert_eq!(counter.load(Ordering::Relaxed), 200);
    }

    #[test]
    fn thread_callbacks_fire() {
        let started = Arc::new(AtomicI32::new(0));
        let stopped = Arc::new(AtomicI32::new(0));

        let started_clone = Arc::clone(&started);
        let stopped_clone = Arc::clone(&stopped);
        let options = PoolOptions {
            on_thread_start: Some(Arc::new(move || {
                started_clone.fetch_add(1, Ordering::Relaxed);
            })),
            on_thread_stop: Some(Arc::new(move || {
                stopped_clone.fetch_add(1, Ordering::Relaxed);
            })),
            ..Default::default()
        };

        let pool = ThreadPool::with_options(2, 4, options);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(started.load(Ordering::Relaxed), 2);

        pool.shutdown_and_wait(Duration::from_secs(5));
        assert_eq!(stopped.load(Ordering::Relaxed), 2);
    }
}
