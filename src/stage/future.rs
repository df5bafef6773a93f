//! One-way export of a stage's terminal outcome.
//!
//! [`StageFuture`] is a plain completable cell driven by the stage's
//! registry: when the stage terminates, the cell settles with a clone of
//! the outcome. The exported future has no back-channel: dropping it or
//! ceasing to poll it never cancels the originating stage.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use crate::error::StageResult;
use crate::stage::Stage;

struct FutureCell<T> {
    result: Option<StageResult<T>>,
    waker: Option<Waker>,
}

struct FutureShared<T> {
    cell: Mutex<FutureCell<T>>,
    settled: Condvar,
}

/// A completable future mirroring a stage's terminal outcome.
///
/// Offers both blocking accessors and a [`std::future::Future`]
/// implementation, so the outcome can be consumed from plain threads or an
/// async runtime.
pub struct StageFuture<T> {
    shared: Arc<FutureShared<T>>,
}

impl<T: Send + Sync + 'static> Stage<T> {
    /// Exports this stage's terminal outcome as a plain completable
    /// future.
    ///
    /// The bridge is one-way: the future observes the stage, never the
    /// reverse.
    #[must_use]
    pub fn to_future(&self) -> StageFuture<T> {
        let shared = Arc::new(FutureShared {
            cell: Mutex::new(FutureCell {
                result: None,
                waker: None,
            }),
            settled: Condvar::new(),
        });
        let sink = Arc::clone(&shared);
        self.subscribe_consumer(Box::new(move |result| {
            let waker = {
                let mut cell = sink.cell.lock().unwrap();
                cell.result = Some(result);
                cell.waker.take()
            };
            sink.settled.notify_all();
            if let Some(waker) = waker {
                waker.wake();
            }
        }));
        StageFuture { shared }
    }
}

impl<T> StageFuture<T> {
    /// Returns the outcome if the stage has already terminated.
    #[must_use]
    pub fn try_get(&self) -> Option<StageResult<T>> {
        self.shared.cell.lock().unwrap().result.clone()
    }

    /// Returns true once the originating stage has terminated.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.shared.cell.lock().unwrap().result.is_some()
    }

    /// Blocks until the originating stage terminates.
    #[must_use]
    pub fn wait(&self) -> StageResult<T> {
        let mut cell = self.shared.cell.lock().unwrap();
        loop {
            if let Some(result) = &cell.result {
                return result.clone();
            }
            cell = self.shared.settled.wait(cell).unwrap();
        }
    }

    /// Blocks until the originating stage terminates or `timeout`
    /// elapses.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> Option<StageResult<T>> {
        let deadline = Instant::now() + timeout;
        let mut cell = self.shared.cell.lock().unwrap();
        loop {
            if let Some(result) = &cell.result {
                return Some(result.clone());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (guard, _) = self.shared.settled.wait_timeout(cell, remaining).unwrap();
            cell = guard;
        }
    }
}

impl<T> Future for StageFuture<T> {
    type Output = StageResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut cell = self.shared.cell.lock().unwrap();
        if let Some(result) = &cell.result {
            Poll::Ready(result.clone())
        } else {
            cell.waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

impl<T> std::fmt::Debug for StageFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageFuture")
            .field("done", &self.is_done())
            .finish()
    }
}
