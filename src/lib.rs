//! Stagechain: cancel-correct promise composition for blocking workloads.
//!
//! # Overview
//!
//! Stagechain is a promise/future composition library built on the principle
//! that cancellation must be recursive, not a leaf concern. A [`Stage`] is a
//! value-producing, cancellable computation running on an [`Executor`];
//! combinators derive new stages and record, per stage, the upstream
//! producers and dynamically composed inner stages. Cancelling a derived
//! stage transitively cancels everything that was working to produce its
//! input, preserving the caller's interrupt intent across the whole chain.
//!
//! # Core Guarantees
//!
//! - **One terminal transition**: a stage reaches exactly one of Succeeded,
//!   Failed, or Cancelled, exactly once
//! - **Exactly-once delivery**: every callback registered on a stage observes
//!   the terminal outcome exactly once, regardless of registration order
//! - **Recursive cancellation**: `cancel` walks the recorded dependency
//!   edges with the same interrupt flag; only the call that performed the
//!   transition propagates
//! - **Interruption awareness**: `cancel(true)` raises the interrupt token of
//!   an in-flight computation, waking interruptible sleeps immediately
//! - **Race-free compose**: an inner stage produced while cancellation is in
//!   flight is cancelled on installation with the latched interrupt intent
//!
//! # Module Structure
//!
//! - [`stage`]: the extended promise type, its combinators, and the
//!   cancellation graph
//! - [`executor`]: the executor contract, the inline pseudo-executor, and a
//!   scaling thread pool
//! - [`interrupt`]: cooperative interruption tokens with ambient per-thread
//!   access
//! - [`error`]: the failure taxonomy flowing through composition chains
//! - [`tracing_compat`]: structured logging shim (optional `tracing`)
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use stagechain::{interrupt, ThreadPool};
//!
//! let pool = ThreadPool::fixed(4);
//! let stage = pool
//!     .submit(|| {
//!         interrupt::sleep(Duration::from_millis(10))?;
//!         Ok(21)
//!     })
//!     .then_apply(|n| Ok(n * 2));
//!
//! assert_eq!(*stage.get().unwrap(), 42);
//! pool.shutdown();
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::module_inception)]

pub mod error;
pub mod executor;
pub mod interrupt;
pub mod stage;
pub mod tracing_compat;

pub use error::{BoxError, Failure, GetError, PanicPayload, RejectedError, StageResult};
pub use executor::{inline, Executor, ExecutorHandle, Job, PoolHandle, PoolOptions, ThreadPool};
pub use interrupt::{InterruptToken, Interrupted};
pub use stage::{Stage, StageFuture, StageState};
