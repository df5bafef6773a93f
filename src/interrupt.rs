//! Cooperative interruption for in-flight computations.
//!
//! Cancelling a stage with `interrupt = true` raises the [`InterruptToken`]
//! of its running computation. Interruption is cooperative: the computation
//! observes the token and abandons work; a computation that ignores it runs
//! to completion, but its result is discarded because the stage is already
//! terminal.
//!
//! While a stage transition executes, the stage's token is installed as the
//! thread's *current* token, so user closures need no extra plumbing:
//!
//! ```
//! use std::time::Duration;
//! use stagechain::interrupt;
//!
//! fn crunch() -> Result<u64, stagechain::BoxError> {
//!     let mut total = 0;
//!     for chunk in 0..5 {
//!         interrupt::sleep(Duration::from_millis(1))?;
//!         total += chunk;
//!     }
//!     Ok(total)
//! }
//! # assert_eq!(crunch().unwrap(), 10);
//! ```
//!
//! [`sleep`] waits on the token's condvar, so a raise wakes the sleeper
//! immediately instead of after the timeout elapses.

use std::cell::RefCell;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// The computation was interrupted while cancellation was in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("computation interrupted")]
pub struct Interrupted;

struct TokenInner {
    raised: Mutex<bool>,
    condvar: Condvar,
}

/// A raisable interruption flag shared between a stage and its running
/// computation.
///
/// Clones share the same flag.
#[derive(Clone)]
pub struct InterruptToken {
    inner: Arc<TokenInner>,
}

impl InterruptToken {
    /// Creates a new, unraised token.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                raised: Mutex::new(false),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Raises the token and wakes any thread sleeping on it.
    pub fn raise(&self) {
        let mut raised = self.inner.raised.lock().unwrap();
        *raised = true;
        self.inner.condvar.notify_all();
    }

    /// Returns true if the token has been raised.
    #[must_use]
    pub fn is_raised(&self) -> bool {
        *self.inner.raised.lock().unwrap()
    }

    /// Sleeps for `duration`, waking early with [`Interrupted`] if the
    /// token is raised before or during the sleep.
    pub fn sleep(&self, duration: Duration) -> Result<(), Interrupted> {
        let deadline = Instant::now() + duration;
        let mut raised = self.inner.raised.lock().unwrap();
        loop {
            if *raised {
                return Err(Interrupted);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            let (guard, _) = self.inner.condvar.wait_timeout(raised, remaining).unwrap();
            raised = guard;
        }
    }
}

impl Default for InterruptToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InterruptToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptToken")
            .field("raised", &self.is_raised())
            .finish()
    }
}

thread_local! {
    /// Token of the stage transition currently running on this thread.
    static CURRENT: RefCell<Option<InterruptToken>> = const { RefCell::new(None) };
}

/// Restores the previously installed token when a transition finishes.
pub(crate) struct TokenScope {
    previous: Option<InterruptToken>,
}

/// Installs `token` as the thread's current token for the duration of the
/// returned scope.
pub(crate) fn enter(token: InterruptToken) -> TokenScope {
    let previous = CURRENT.with(|current| current.borrow_mut().replace(token));
    TokenScope { previous }
}

impl Drop for TokenScope {
    fn drop(&mut self) {
        CURRENT.with(|current| {
            *current.borrow_mut() = self.previous.take();
        });
    }
}

/// Returns the token of the stage transition running on this thread, if
/// any.
#[must_use]
pub fn current() -> Option<InterruptToken> {
    CURRENT.with(|current| current.borrow().clone())
}

/// Returns true if the current thread's stage transition has been asked to
/// stop.
///
/// Outside a stage transition this always returns false.
#[must_use]
pub fn requested() -> bool {
    current().is_some_and(|token| token.is_raised())
}

/// Interruptible sleep on the current thread's token.
///
/// Outside a stage transition this degrades to a plain
/// [`std::thread::sleep`].
pub fn sleep(duration: Duration) -> Result<(), Interrupted> {
    match current() {
        Some(token) => token.sleep(duration),
        None => {
            std::thread::sleep(duration);
            Ok(())
        }
    }
}
