//! Per-stage callback registry.
//!
//! The registry is the mailbox attached to each stage: the stage's task
//! settles it at most once, and every subscriber observes the terminal
//! outcome exactly once. Subscribers arriving after the settle are
//! dispatched immediately with a clone of the stored outcome.
//!
//! The registry also backs the blocking accessors: waiting on the condvar
//! is correct even for stages whose transition is short-circuited, because
//! every terminal path settles the registry.

use std::mem;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Failure, StageResult};
use crate::tracing_compat::trace;

/// A registered consumer of a stage's terminal outcome.
pub(crate) type Consumer<T> = Box<dyn FnOnce(StageResult<T>) + Send>;

enum RegistryState<T> {
    Open(Vec<Consumer<T>>),
    Settled(StageResult<T>),
}

pub(crate) struct CallbackRegistry<T> {
    state: Mutex<RegistryState<T>>,
    settled: Condvar,
}

impl<T> CallbackRegistry<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState::Open(Vec::new())),
            settled: Condvar::new(),
        }
    }

    /// Records a consumer, or dispatches it immediately if the registry is
    /// already settled.
    pub(crate) fn subscribe(&self, consumer: Consumer<T>) {
        let outcome = {
            let mut state = self.state.lock().unwrap();
            match &mut *state {
                RegistryState::Open(consumers) => {
                    consumers.push(consumer);
                    return;
                }
                RegistryState::Settled(result) => result.clone(),
            }
        };
        consumer(outcome);
    }

    /// Settles with a success value. Returns false if already settled.
    pub(crate) fn success(&self, value: std::sync::Arc<T>) -> bool {
        self.settle(Ok(value))
    }

    /// Settles with a failure. Returns false if already settled.
    pub(crate) fn failure(&self, failure: Failure) -> bool {
        self.settle(Err(failure))
    }

    /// Transitions Open → Settled and fans out to all recorded consumers.
    ///
    /// The second settle of a registry is ignored; consumers are invoked
    /// outside the lock.
    pub(crate) fn settle(&self, result: StageResult<T>) -> bool {
        let consumers = {
            let mut state = self.state.lock().unwrap();
            if matches!(*state, RegistryState::Settled(_)) {
                return false;
            }
            match mem::replace(&mut *state, RegistryState::Settled(result.clone())) {
                RegistryState::Open(consumers) => consumers,
                RegistryState::Settled(_) => unreachable!(),
            }
        };
        self.settled.notify_all();
        trace!(consumers = consumers.len(), "registry settled");
        for consumer in consumers {
            consumer(result.clone());
        }
        true
    }

    /// Blocks until the registry settles.
    pub(crate) fn wait(&self) -> StageResult<T> {
        let mut state = self.state.lock().unwrap();
        loop {
            match &*state {
                RegistryState::Settled(result) => return result.clone(),
                RegistryState::Open(_) => state = self.settled.wait(state).unwrap(),
            }
        }
    }

    /// Blocks until the registry settles or `timeout` elapses.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> Option<StageResult<T>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            if let RegistryState::Settled(result) = &*state {
                return Some(result.clone());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (guard, _) = self.settled.wait_timeout(state, remaining).unwrap();
            state = guard;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn settle_fires_recorded_consumers_once() {
        let registry = CallbackRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let hits = Arc::clone(&hits);
            registry.subscribe(Box::new(move |result: StageResult<u32>| {
                assert_eq!(*result.unwrap(), 5);
                hits.fetch_add(1, Ordering::SeqCst);
            }));
        }

        assert!(registry.success(Arc::new(5)));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn second_settle_is_ignored() {
        let registry = CallbackRegistry::<u32>::new();
        assert!(registry.success(Arc::new(1)));
        assert!(!registry.failure(Failure::Cancelled));
        assert_eq!(*registry.wait().unwrap(), 1);
    }

    #[test]
    fn late_subscriber_dispatched_immediately() {
        let registry = CallbackRegistry::<u32>::new();
        registry.failure(Failure::Cancelled);

        let hits = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&hits);
        registry.subscribe(Box::new(move |result| {
            assert!(result.unwrap_err().is_cancelled());
            observed.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wait_timeout_returns_outcome_once_settled() {
        let registry = CallbackRegistry::<u32>::new();
        registry.success(Arc::new(9));
        let outcome = registry.wait_timeout(Duration::from_millis(1)).unwrap();
        assert_eq!(*outcome.unwrap(), 9);
    }

    #[test]
    fn wait_timeout_expires_when_open() {
        let registry = CallbackRegistry::<u32>::new();
        assert!(registry.wait_timeout(Duration::from_millis(20)).is_none());
    }

    #[test]
    fn wait_unblocks_on_settle_from_other_thread() {
        let registry = Arc::new(CallbackRegistry::<u32>::new());
        let settler = Arc::clone(&registry);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            settler.success(Arc::new(11));
        });

        assert_eq!(*registry.wait().unwrap(), 11);
        handle.join().unwrap();
    }
}
