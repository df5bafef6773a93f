//! Stages: cancellable staged computations and their combinators.
//!
//! A [`Stage`] wraps a one-shot computation with a five-state lifecycle
//! (Pending, Running, Succeeded, Failed, Cancelled), a per-stage callback
//! registry for multi-consumer fan-out of the terminal outcome, and a
//! cancellation graph recording which stages to cancel transitively.
//!
//! Combinators derive new stages from existing ones; every derived stage
//! records its upstream as a dependency, and `then_compose` additionally
//! records the dynamically produced inner stage, so `cancel` reaches every
//! computation working toward the cancelled value.

mod future;
mod registry;
mod stage;

pub use future::StageFuture;
pub use stage::{Stage, StageState};
