//! Executor contract and implementations.
//!
//! An executor is a sink of runnables: it accepts a [`Job`] for eventual
//! execution and may run jobs concurrently. Stages schedule their
//! transitions and callback dispatches through this trait, so any thread
//! pool can host a composition chain.
//!
//! Two implementations ship with the crate:
//!
//! - [`ThreadPool`]: a scaling pool of OS threads (see [`pool`])
//! - [`inline()`]: the distinguished pseudo-executor that runs jobs
//!   synchronously on the calling thread
//!
//! The inline executor is for short, non-blocking bridges between stages.
//! It must not serve as a stage's default executor; combinators handed the
//! inline executor derive their successor with the parent stage's default
//! instead.

use crate::error::RejectedError;
use std::sync::{Arc, OnceLock};

pub mod pool;

pub use pool::{PoolHandle, PoolOptions, ThreadPool};

/// A unit of work submitted to an executor.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Shared handle to an executor.
pub type ExecutorHandle = Arc<dyn Executor>;

/// A sink of runnables.
pub trait Executor: Send + Sync {
    /// Submits a job for eventual execution.
    ///
    /// A rejection (for example after shutdown) fails the stage whose work
    /// was being scheduled, with the rejection as cause.
    fn execute(&self, job: Job) -> Result<(), RejectedError>;

    /// Returns true if this executor runs jobs synchronously on the
    /// submitting thread.
    fn runs_inline(&self) -> bool {
        false
    }
}

/// Runs jobs synchronously on the calling thread.
struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, job: Job) -> Result<(), RejectedError> {
        job();
        Ok(())
    }

    fn runs_inline(&self) -> bool {
        true
    }
}

/// Returns the distinguished inline executor.
///
/// Jobs run synchronously on the submitting thread. Permitted for callback
/// dispatch; forbidden as a stage's default executor.
#[must_use]
pub fn inline() -> ExecutorHandle {
    static INLINE: OnceLock<ExecutorHandle> = OnceLock::new();
    INLINE.get_or_init(|| Arc::new(InlineExecutor)).clone()
}
