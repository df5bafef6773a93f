//! The stage type: state machine, cancellation graph, combinator engine.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{BoxError, Failure, GetError, PanicPayload, RejectedError, StageResult};
use crate::executor::{inline, ExecutorHandle};
use crate::interrupt::{self, InterruptToken};
use crate::stage::registry::{CallbackRegistry, Consumer};
use crate::tracing_compat::{debug, trace};

/// Lifecycle state of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StageState {
    /// Created; the transition has not started.
    Pending = 0,
    /// The transition computation is running.
    Running = 1,
    /// Terminal: completed with a value.
    Succeeded = 2,
    /// Terminal: completed with a failure.
    Failed = 3,
    /// Terminal: cancelled.
    Cancelled = 4,
}

impl StageState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Pending,
            1 => Self::Running,
            2 => Self::Succeeded,
            3 => Self::Failed,
            _ => Self::Cancelled,
        }
    }

    /// Returns true for Succeeded, Failed, and Cancelled.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// The thunk a transition runs to produce the stage's terminal outcome.
type Thunk<T> = Box<dyn FnOnce() -> StageResult<T> + Send>;

/// Type-erased cancellation hook; dependency edges hold stages of
/// arbitrary value types.
trait Cancellable: Send + Sync {
    fn cancel_edge(&self, interrupt: bool) -> bool;
}

type DependencyEdge = Arc<dyn Cancellable>;

/// Stages to cancel when this stage is cancelled, plus the interrupt
/// intent of the cancel that won the terminal transition.
struct DepGraph {
    edges: Vec<DependencyEdge>,
    interrupted_on_cancel: bool,
}

struct StageInner<T> {
    state: AtomicU8,
    interrupt: InterruptToken,
    registry: CallbackRegistry<T>,
    default_executor: ExecutorHandle,
    deps: Mutex<DepGraph>,
}

impl<T: Send + Sync + 'static> StageInner<T> {
    fn new(default_executor: ExecutorHandle, dependency: Option<DependencyEdge>) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(StageState::Pending as u8),
            interrupt: InterruptToken::new(),
            registry: CallbackRegistry::new(),
            default_executor,
            deps: Mutex::new(DepGraph {
                edges: dependency.into_iter().collect(),
                interrupted_on_cancel: false,
            }),
        })
    }

    fn state(&self) -> StageState {
        StageState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: StageState, to: StageState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn is_cancelled(&self) -> bool {
        self.state() == StageState::Cancelled
    }

    /// Attempts Pending/Running → Cancelled, raising the interrupt token
    /// if the computation was in flight.
    fn try_cancel_transition(&self, interrupt: bool) -> bool {
        if self.transition(StageState::Pending, StageState::Cancelled) {
            return true;
        }
        if self.transition(StageState::Running, StageState::Cancelled) {
            if interrupt {
                self.interrupt.raise();
            }
            return true;
        }
        false
    }

    /// Cancels this stage and, if this call performed the transition,
    /// every recorded dependency with the same interrupt flag.
    ///
    /// The dep lock is taken before the state transition so that a
    /// `compose` installer observing Cancelled always reads the final
    /// latched intent. Edges are drained under the lock but cancelled
    /// after releasing it: the walk must not hold any lock, because
    /// settling a dependency's registry can synchronously run user
    /// callbacks that cancel stages of this same graph.
    fn cancel(&self, interrupt: bool) -> bool {
        let edges = {
            let mut deps = self.deps.lock().unwrap();
            if !self.try_cancel_transition(interrupt) {
                return false;
            }
            deps.interrupted_on_cancel = interrupt;
            std::mem::take(&mut deps.edges)
        };
        if !edges.is_empty() {
            debug!(interrupt, edges = edges.len(), "cancelling recorded dependencies");
        }
        for edge in edges {
            edge.cancel_edge(interrupt);
        }
        self.registry.failure(Failure::Cancelled);
        true
    }

    fn latched_interrupt(&self) -> bool {
        self.deps.lock().unwrap().interrupted_on_cancel
    }

    fn set_edges(&self, edges: Vec<DependencyEdge>) {
        self.deps.lock().unwrap().edges = edges;
    }

    /// Schedules a transition thunk on `executor`; a rejection fails the
    /// stage with the rejection as cause.
    fn launch(inner: &Arc<Self>, thunk: Thunk<T>, executor: &ExecutorHandle) {
        let stage = Arc::clone(inner);
        let job = Box::new(move || stage.run_transition(thunk));
        if let Err(rejection) = executor.execute(job) {
            inner.fail_rejected(rejection);
        }
    }

    fn fail_rejected(&self, rejection: RejectedError) {
        debug!(%rejection, "stage transition rejected by executor");
        if self.transition(StageState::Pending, StageState::Failed) {
            self.registry.failure(Failure::wrap(Box::new(rejection)));
        }
    }

    /// Runs the transition thunk: Pending → Running → terminal, settling
    /// the registry with the outcome.
    ///
    /// A lost Pending CAS means the stage was cancelled before the
    /// transition started; the cancel path has already settled the
    /// registry. A lost terminal CAS means cancellation won while the
    /// thunk was running; the late result is discarded.
    fn run_transition(self: &Arc<Self>, thunk: Thunk<T>) {
        if !self.transition(StageState::Pending, StageState::Running) {
            return;
        }
        let result = {
            let _scope = interrupt::enter(self.interrupt.clone());
            match catch_unwind(AssertUnwindSafe(thunk)) {
                Ok(result) => result,
                Err(caught) => Err(Failure::Panicked(PanicPayload::from_caught(caught.as_ref()))),
            }
        };
        let terminal = if result.is_ok() {
            StageState::Succeeded
        } else {
            StageState::Failed
        };
        if self.transition(StageState::Running, terminal) {
            self.registry.settle(result);
        } else {
            self.registry.failure(Failure::Cancelled);
        }
    }

    /// Drives the registry directly, bypassing the transition machinery.
    ///
    /// Only for stages that are never exposed (the `either` funnel); their
    /// state stays Pending so they remain cancellable as dependencies.
    fn settle_directly(&self, result: StageResult<T>) {
        match result {
            Ok(value) => {
                self.registry.success(value);
            }
            Err(failure) => {
                self.registry.failure(failure);
            }
        }
    }
}

impl<T: Send + Sync + 'static> Cancellable for StageInner<T> {
    fn cancel_edge(&self, interrupt: bool) -> bool {
        self.cancel(interrupt)
    }
}

/// Forwards an already-computed outcome into a stage through its
/// transition machinery on the inline executor.
fn forward_to<U: Send + Sync + 'static>(target: &Arc<StageInner<U>>, result: StageResult<U>) {
    StageInner::launch(target, Box::new(move || result), &inline());
}

/// A value-producing, cancellable staged computation.
///
/// `Stage` is a shared handle; clones refer to the same stage. Combinators
/// derive successor stages and wire the cancellation graph so that
/// [`cancel`](Stage::cancel) is transitive over upstream producers and
/// composed inner stages.
pub struct Stage<T> {
    inner: Arc<StageInner<T>>,
}

impl<T> Clone for Stage<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for Stage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("state", &self.inner.state())
            .finish()
    }
}

impl<T: Send + Sync + 'static> Stage<T> {
    /// Creates a root stage that runs `computation` on `executor`.
    ///
    /// The executor is also the stage's default executor for derived
    /// stages; the inline executor is not permitted here.
    pub fn run_on<F>(executor: &ExecutorHandle, computation: F) -> Self
    where
        F: FnOnce() -> Result<T, BoxError> + Send + 'static,
    {
        debug_assert!(
            !executor.runs_inline(),
            "the inline executor cannot be a stage's default executor"
        );
        let stage = Self {
            inner: StageInner::new(Arc::clone(executor), None),
        };
        StageInner::launch(
            &stage.inner,
            Box::new(move || computation().map(Arc::new).map_err(Failure::wrap)),
            executor,
        );
        stage
    }

    /// Creates an already-succeeded stage carrying `value`, with `executor`
    /// as the default for derived stages.
    pub fn ready(executor: &ExecutorHandle, value: T) -> Self {
        debug_assert!(
            !executor.runs_inline(),
            "the inline executor cannot be a stage's default executor"
        );
        let stage = Self {
            inner: StageInner::new(Arc::clone(executor), None),
        };
        stage
            .inner
            .state
            .store(StageState::Succeeded as u8, Ordering::Release);
        stage.inner.registry.success(Arc::new(value));
        stage
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> StageState {
        self.inner.state()
    }

    /// Returns true if the stage was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Returns true if the stage reached a terminal state.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.inner.state().is_terminal()
    }

    /// Returns the stage's default executor.
    #[must_use]
    pub fn default_executor(&self) -> ExecutorHandle {
        Arc::clone(&self.inner.default_executor)
    }

    /// Cancels this stage, returning true only if this call performed the
    /// terminal transition.
    ///
    /// Cancellation is recursive: every recorded dependency (the upstream
    /// of a derived stage, both producers of an `either`, the inner stage
    /// of a `compose`) is cancelled with the same `interrupt` flag. With
    /// `interrupt = true`, a computation already running has its
    /// [`InterruptToken`] raised; cooperative computations observe it and
    /// abandon work, while others run to completion with their result
    /// discarded.
    pub fn cancel(&self, interrupt: bool) -> bool {
        self.inner.cancel(interrupt)
    }

    /// Blocks until the stage terminates, returning the shared value.
    ///
    /// A chain that failed with a wrapped user error surfaces that error
    /// with one level of the composition envelope stripped.
    pub fn get(&self) -> Result<Arc<T>, GetError> {
        self.inner.registry.wait().map_err(GetError::from_failure)
    }

    /// Like [`get`](Self::get), bounded by `timeout`.
    pub fn get_timeout(&self, timeout: Duration) -> Result<Arc<T>, GetError> {
        match self.inner.registry.wait_timeout(timeout) {
            Some(result) => result.map_err(GetError::from_failure),
            None => Err(GetError::Timeout),
        }
    }

    /// Registers a raw consumer of the terminal outcome.
    pub(crate) fn subscribe_consumer(&self, consumer: Consumer<T>) {
        self.inner.registry.subscribe(consumer);
    }

    /// Creates a successor stage with the upstream recorded as its sole
    /// initial dependency.
    ///
    /// An inline `executor` is substituted with the parent's default so
    /// the successor always has a real default executor.
    fn successor<U: Send + Sync + 'static>(&self, executor: &ExecutorHandle) -> Stage<U> {
        let default = if executor.runs_inline() {
            Arc::clone(&self.inner.default_executor)
        } else {
            Arc::clone(executor)
        };
        Stage {
            inner: StageInner::new(default, Some(self.edge())),
        }
    }

    /// This stage as a type-erased cancellation edge.
    fn edge(&self) -> DependencyEdge {
        Arc::clone(&self.inner) as DependencyEdge
    }

    /// The shared construction template: when this stage terminates, map
    /// the outcome and drive `target`'s transition on `executor`.
    fn add_transition<U: Send + Sync + 'static>(
        &self,
        target: &Stage<U>,
        executor: &ExecutorHandle,
        map: impl FnOnce(StageResult<T>) -> StageResult<U> + Send + 'static,
    ) {
        let target_inner = Arc::clone(&target.inner);
        let executor = Arc::clone(executor);
        self.inner.registry.subscribe(Box::new(move |result| {
            StageInner::launch(&target_inner, Box::new(move || map(result)), &executor);
        }));
    }

    // === map / accept / run ===

    /// Maps the success value; dispatched on the completing thread.
    pub fn then_apply<U, F>(&self, f: F) -> Stage<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(&T) -> Result<U, BoxError> + Send + 'static,
    {
        self.then_apply_on(&inline(), f)
    }

    /// Maps the success value on the default executor.
    pub fn then_apply_async<U, F>(&self, f: F) -> Stage<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(&T) -> Result<U, BoxError> + Send + 'static,
    {
        self.then_apply_on(&self.default_executor(), f)
    }

    /// Maps the success value on the given executor.
    ///
    /// On upstream failure the successor fails with the same failure; the
    /// mapping function is not called. The upstream is recorded as the
    /// successor's dependency, so cancelling the successor before its own
    /// transition starts cancels the upstream.
    pub fn then_apply_on<U, F>(&self, executor: &ExecutorHandle, f: F) -> Stage<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(&T) -> Result<U, BoxError> + Send + 'static,
    {
        let next = self.successor::<U>(executor);
        self.add_transition(&next, executor, move |result| match result {
            Ok(value) => f(value.as_ref()).map(Arc::new).map_err(Failure::wrap),
            Err(failure) => Err(failure),
        });
        next
    }

    /// Consumes the success value; dispatched on the completing thread.
    pub fn then_accept<F>(&self, f: F) -> Stage<()>
    where
        F: FnOnce(&T) -> Result<(), BoxError> + Send + 'static,
    {
        self.then_accept_on(&inline(), f)
    }

    /// Consumes the success value on the default executor.
    pub fn then_accept_async<F>(&self, f: F) -> Stage<()>
    where
        F: FnOnce(&T) -> Result<(), BoxError> + Send + 'static,
    {
        self.then_accept_on(&self.default_executor(), f)
    }

    /// Consumes the success value on the given executor.
    pub fn then_accept_on<F>(&self, executor: &ExecutorHandle, f: F) -> Stage<()>
    where
        F: FnOnce(&T) -> Result<(), BoxError> + Send + 'static,
    {
        self.then_apply_on(executor, f)
    }

    /// Runs an action after success; dispatched on the completing thread.
    pub fn then_run<F>(&self, f: F) -> Stage<()>
    where
        F: FnOnce() -> Result<(), BoxError> + Send + 'static,
    {
        self.then_run_on(&inline(), f)
    }

    /// Runs an action after success on the default executor.
    pub fn then_run_async<F>(&self, f: F) -> Stage<()>
    where
        F: FnOnce() -> Result<(), BoxError> + Send + 'static,
    {
        self.then_run_on(&self.default_executor(), f)
    }

    /// Runs an action after success on the given executor.
    pub fn then_run_on<F>(&self, executor: &ExecutorHandle, f: F) -> Stage<()>
    where
        F: FnOnce() -> Result<(), BoxError> + Send + 'static,
    {
        self.then_apply_on(executor, move |_| f())
    }

    // === compose ===

    /// Composes with a stage-returning function; dispatched on the
    /// completing thread.
    pub fn then_compose<U, F>(&self, f: F) -> Stage<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(&T) -> Result<Stage<U>, BoxError> + Send + 'static,
    {
        self.then_compose_on(&inline(), f)
    }

    /// Composes with a stage-returning function on the default executor.
    pub fn then_compose_async<U, F>(&self, f: F) -> Stage<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(&T) -> Result<Stage<U>, BoxError> + Send + 'static,
    {
        self.then_compose_on(&self.default_executor(), f)
    }

    /// Composes with a stage-returning function on the given executor.
    ///
    /// On upstream success, `f` runs on `executor` and its inner stage is
    /// installed as the exposed stage's sole dependency; the inner stage's
    /// terminal outcome is forwarded to the exposed stage. The exposed
    /// stage is cancellable during the whole window: before `f` runs
    /// (through the recorded upstream edge), while `f` runs (the inner
    /// stage is cancelled at installation with the latched interrupt
    /// intent), and after installation (through the new edge). On upstream
    /// failure, `f` is bypassed and the failure is delivered directly.
    pub fn then_compose_on<U, F>(&self, executor: &ExecutorHandle, f: F) -> Stage<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(&T) -> Result<Stage<U>, BoxError> + Send + 'static,
    {
        self.compose_with(executor, move |value: Arc<T>| f(value.as_ref()))
    }

    /// Compose core; takes the shared value by `Arc` so `combine` can move
    /// the first operand into the bridge it builds over the second.
    fn compose_with<U, F>(&self, executor: &ExecutorHandle, f: F) -> Stage<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(Arc<T>) -> Result<Stage<U>, BoxError> + Send + 'static,
    {
        let next = self.successor::<U>(executor);
        // Internal carrier for running `f`; never exposed to the caller.
        let temp = self.successor::<()>(executor);
        let next_inner = Arc::clone(&next.inner);
        self.add_transition(&temp, executor, move |result: StageResult<T>| {
            match result {
                Ok(value) => {
                    let produced = catch_unwind(AssertUnwindSafe(move || f(value)));
                    let inner_stage = match produced {
                        Ok(Ok(stage)) => stage,
                        Ok(Err(error)) => {
                            let failure = Failure::wrap(error);
                            forward_to(&next_inner, Err(failure.clone()));
                            return Err(failure);
                        }
                        Err(caught) => {
                            let failure =
                                Failure::Panicked(PanicPayload::from_caught(caught.as_ref()));
                            forward_to(&next_inner, Err(failure.clone()));
                            return Err(failure);
                        }
                    };

                    // Move-to-next bridge: the inner stage's outcome becomes
                    // the exposed stage's outcome.
                    let bridge_target = Arc::clone(&next_inner);
                    inner_stage
                        .inner
                        .registry
                        .subscribe(Box::new(move |inner_result| {
                            forward_to(&bridge_target, inner_result);
                        }));

                    // Install the inner stage as the exposed stage's sole
                    // dependency, unless cancellation already won the race
                    // while `f` was running.
                    let cancel_now = {
                        let mut deps = next_inner.deps.lock().unwrap();
                        if next_inner.is_cancelled() {
                            Some(deps.interrupted_on_cancel)
                        } else {
                            deps.edges = vec![inner_stage.edge()];
                            None
                        }
                    };
                    if let Some(latched) = cancel_now {
                        trace!(
                            interrupt = latched,
                            "inner stage produced after cancel; cancelling it"
                        );
                        inner_stage.inner.cancel(latched);
                    }
                    Ok(Arc::new(()))
                }
                Err(failure) => {
                    forward_to(&next_inner, Err(failure));
                    Ok(Arc::new(()))
                }
            }
        });
        next
    }

    // === combine ===

    /// Combines with another stage's value; bridges dispatched on the
    /// completing threads.
    pub fn then_combine<U, V, F>(&self, other: &Stage<U>, f: F) -> Stage<V>
    where
        U: Send + Sync + 'static,
        V: Send + Sync + 'static,
        F: FnOnce(&T, &U) -> Result<V, BoxError> + Send + 'static,
    {
        self.then_combine_on(other, &inline(), f)
    }

    /// Combines with another stage's value on the default executor.
    pub fn then_combine_async<U, V, F>(&self, other: &Stage<U>, f: F) -> Stage<V>
    where
        U: Send + Sync + 'static,
        V: Send + Sync + 'static,
        F: FnOnce(&T, &U) -> Result<V, BoxError> + Send + 'static,
    {
        self.then_combine_on(other, &self.default_executor(), f)
    }

    /// Combines with another stage's value on the given executor.
    ///
    /// Expressed as a compose over this stage plus a map on `other`.
    /// Cancelling the combined stage cancels this stage through the
    /// compose path; a post-completion hook then cancels `other` with the
    /// latched interrupt flag.
    pub fn then_combine_on<U, V, F>(
        &self,
        other: &Stage<U>,
        executor: &ExecutorHandle,
        f: F,
    ) -> Stage<V>
    where
        U: Send + Sync + 'static,
        V: Send + Sync + 'static,
        F: FnOnce(&T, &U) -> Result<V, BoxError> + Send + 'static,
    {
        let other_stage = other.clone();
        let apply_executor = Arc::clone(executor);
        let next = self.compose_with(&inline(), move |first: Arc<T>| {
            Ok(other_stage
                .then_apply_on(&apply_executor, move |second| f(first.as_ref(), second)))
        });

        let next_inner = Arc::clone(&next.inner);
        let other_edge = other.clone();
        next.inner.registry.subscribe(Box::new(move |_| {
            if next_inner.is_cancelled() {
                let interrupt = next_inner.latched_interrupt();
                other_edge.cancel(interrupt);
            }
        }));
        next
    }

    /// Consumes both values; bridges dispatched on the completing threads.
    pub fn then_accept_both<U, F>(&self, other: &Stage<U>, f: F) -> Stage<()>
    where
        U: Send + Sync + 'static,
        F: FnOnce(&T, &U) -> Result<(), BoxError> + Send + 'static,
    {
        self.then_accept_both_on(other, &inline(), f)
    }

    /// Consumes both values on the default executor.
    pub fn then_accept_both_async<U, F>(&self, other: &Stage<U>, f: F) -> Stage<()>
    where
        U: Send + Sync + 'static,
        F: FnOnce(&T, &U) -> Result<(), BoxError> + Send + 'static,
    {
        self.then_accept_both_on(other, &self.default_executor(), f)
    }

    /// Consumes both values on the given executor.
    pub fn then_accept_both_on<U, F>(
        &self,
        other: &Stage<U>,
        executor: &ExecutorHandle,
        f: F,
    ) -> Stage<()>
    where
        U: Send + Sync + 'static,
        F: FnOnce(&T, &U) -> Result<(), BoxError> + Send + 'static,
    {
        self.then_combine_on(other, executor, f)
    }

    /// Runs an action after both stages succeed; bridges dispatched on the
    /// completing threads.
    pub fn run_after_both<U, F>(&self, other: &Stage<U>, f: F) -> Stage<()>
    where
        U: Send + Sync + 'static,
        F: FnOnce() -> Result<(), BoxError> + Send + 'static,
    {
        self.run_after_both_on(other, &inline(), f)
    }

    /// Runs an action after both stages succeed, on the default executor.
    pub fn run_after_both_async<U, F>(&self, other: &Stage<U>, f: F) -> Stage<()>
    where
        U: Send + Sync + 'static,
        F: FnOnce() -> Result<(), BoxError> + Send + 'static,
    {
        self.run_after_both_on(other, &self.default_executor(), f)
    }

    /// Runs an action after both stages succeed, on the given executor.
    pub fn run_after_both_on<U, F>(
        &self,
        other: &Stage<U>,
        executor: &ExecutorHandle,
        f: F,
    ) -> Stage<()>
    where
        U: Send + Sync + 'static,
        F: FnOnce() -> Result<(), BoxError> + Send + 'static,
    {
        self.then_combine_on(other, executor, move |_, _| f())
    }

    // === either ===

    /// Maps whichever value arrives first; dispatched on the completing
    /// thread.
    pub fn apply_to_either<U, F>(&self, other: &Stage<T>, f: F) -> Stage<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(&T) -> Result<U, BoxError> + Send + 'static,
    {
        self.apply_to_either_on(other, &inline(), f)
    }

    /// Maps whichever value arrives first, on the default executor.
    pub fn apply_to_either_async<U, F>(&self, other: &Stage<T>, f: F) -> Stage<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(&T) -> Result<U, BoxError> + Send + 'static,
    {
        self.apply_to_either_on(other, &self.default_executor(), f)
    }

    /// Maps whichever value arrives first, on the given executor.
    ///
    /// A registry-only funnel subscribes to both upstreams; the first
    /// terminal outcome wins and the second is ignored. The funnel records
    /// both producers as dependencies, so cancelling the returned stage
    /// aborts both.
    pub fn apply_to_either_on<U, F>(
        &self,
        other: &Stage<T>,
        executor: &ExecutorHandle,
        f: F,
    ) -> Stage<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(&T) -> Result<U, BoxError> + Send + 'static,
    {
        let funnel = self.either_funnel(other, executor);
        funnel.then_apply_on(executor, f)
    }

    /// Consumes whichever value arrives first; dispatched on the
    /// completing thread.
    pub fn accept_either<F>(&self, other: &Stage<T>, f: F) -> Stage<()>
    where
        F: FnOnce(&T) -> Result<(), BoxError> + Send + 'static,
    {
        self.accept_either_on(other, &inline(), f)
    }

    /// Consumes whichever value arrives first, on the default executor.
    pub fn accept_either_async<F>(&self, other: &Stage<T>, f: F) -> Stage<()>
    where
        F: FnOnce(&T) -> Result<(), BoxError> + Send + 'static,
    {
        self.accept_either_on(other, &self.default_executor(), f)
    }

    /// Consumes whichever value arrives first, on the given executor.
    pub fn accept_either_on<F>(&self, other: &Stage<T>, executor: &ExecutorHandle, f: F) -> Stage<()>
    where
        F: FnOnce(&T) -> Result<(), BoxError> + Send + 'static,
    {
        self.apply_to_either_on(other, executor, f)
    }

    /// Runs an action after either stage succeeds; dispatched on the
    /// completing thread.
    pub fn run_after_either<U, F>(&self, other: &Stage<U>, f: F) -> Stage<()>
    where
        U: Send + Sync + 'static,
        F: FnOnce() -> Result<(), BoxError> + Send + 'static,
    {
        self.run_after_either_on(other, &inline(), f)
    }

    /// Runs an action after either stage succeeds, on the default
    /// executor.
    pub fn run_after_either_async<U, F>(&self, other: &Stage<U>, f: F) -> Stage<()>
    where
        U: Send + Sync + 'static,
        F: FnOnce() -> Result<(), BoxError> + Send + 'static,
    {
        self.run_after_either_on(other, &self.default_executor(), f)
    }

    /// Runs an action after either stage succeeds, on the given executor.
    ///
    /// The producers may have different value types; both are discarded.
    pub fn run_after_either_on<U, F>(
        &self,
        other: &Stage<U>,
        executor: &ExecutorHandle,
        f: F,
    ) -> Stage<()>
    where
        U: Send + Sync + 'static,
        F: FnOnce() -> Result<(), BoxError> + Send + 'static,
    {
        let funnel: Stage<()> = self.successor::<()>(executor);
        let first = Arc::clone(&funnel.inner);
        self.inner.registry.subscribe(Box::new(move |result| {
            first.settle_directly(result.map(|_| Arc::new(())));
        }));
        let second = Arc::clone(&funnel.inner);
        other.inner.registry.subscribe(Box::new(move |result| {
            second.settle_directly(result.map(|_| Arc::new(())));
        }));
        funnel.inner.set_edges(vec![self.edge(), other.edge()]);
        funnel.then_run_on(executor, f)
    }

    /// Builds the registry-only funnel stage shared by the same-typed
    /// either combinators.
    fn either_funnel(&self, other: &Stage<T>, executor: &ExecutorHandle) -> Stage<T> {
        let funnel = self.successor::<T>(executor);
        let first = Arc::clone(&funnel.inner);
        self.inner
            .registry
            .subscribe(Box::new(move |result| first.settle_directly(result)));
        let second = Arc::clone(&funnel.inner);
        other
            .inner
            .registry
            .subscribe(Box::new(move |result| second.settle_directly(result)));
        funnel.inner.set_edges(vec![self.edge(), other.edge()]);
        funnel
    }

    // === recover / finalize / handle ===

    /// Recovers from a failure with `f`; success values pass through
    /// untouched.
    ///
    /// Errors returned by the recovery function propagate as failures of
    /// the successor.
    pub fn exceptionally<F>(&self, f: F) -> Stage<T>
    where
        F: FnOnce(&Failure) -> Result<T, BoxError> + Send + 'static,
    {
        let executor = inline();
        let next = self.successor::<T>(&executor);
        self.add_transition(&next, &executor, move |result| match result {
            Ok(value) => Ok(value),
            Err(failure) => f(&failure).map(Arc::new).map_err(Failure::wrap),
        });
        next
    }

    /// Observes the terminal outcome and re-emits it; dispatched on the
    /// completing thread.
    pub fn when_complete<F>(&self, action: F) -> Stage<T>
    where
        F: FnOnce(Option<&T>, Option<&Failure>) -> Result<(), BoxError> + Send + 'static,
    {
        self.when_complete_on(&inline(), action)
    }

    /// Observes the terminal outcome and re-emits it, on the default
    /// executor.
    pub fn when_complete_async<F>(&self, action: F) -> Stage<T>
    where
        F: FnOnce(Option<&T>, Option<&Failure>) -> Result<(), BoxError> + Send + 'static,
    {
        self.when_complete_on(&self.default_executor(), action)
    }

    /// Observes the terminal outcome and re-emits it, on the given
    /// executor.
    ///
    /// If the action itself fails, its error replaces the original
    /// outcome; otherwise the original value or failure is re-emitted
    /// unchanged.
    pub fn when_complete_on<F>(&self, executor: &ExecutorHandle, action: F) -> Stage<T>
    where
        F: FnOnce(Option<&T>, Option<&Failure>) -> Result<(), BoxError> + Send + 'static,
    {
        let next = self.successor::<T>(executor);
        self.add_transition(&next, executor, move |result| match result {
            Ok(value) => match action(Some(value.as_ref()), None) {
                Ok(()) => Ok(value),
                Err(error) => Err(Failure::wrap(error)),
            },
            Err(failure) => match action(None, Some(&failure)) {
                Ok(()) => Err(failure),
                Err(error) => Err(Failure::wrap(error)),
            },
        });
        next
    }

    /// Maps both outcomes through one function; dispatched on the
    /// completing thread.
    pub fn handle<U, F>(&self, f: F) -> Stage<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(Option<&T>, Option<&Failure>) -> Result<U, BoxError> + Send + 'static,
    {
        self.handle_on(&inline(), f)
    }

    /// Maps both outcomes through one function on the default executor.
    pub fn handle_async<U, F>(&self, f: F) -> Stage<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(Option<&T>, Option<&Failure>) -> Result<U, BoxError> + Send + 'static,
    {
        self.handle_on(&self.default_executor(), f)
    }

    /// Maps both outcomes through one function on the given executor.
    ///
    /// A failure is consumed, not propagated: the function's return value
    /// is the successor's success value either way.
    pub fn handle_on<U, F>(&self, executor: &ExecutorHandle, f: F) -> Stage<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(Option<&T>, Option<&Failure>) -> Result<U, BoxError> + Send + 'static,
    {
        let next = self.successor::<U>(executor);
        self.add_transition(&next, executor, move |result| {
            let mapped = match &result {
                Ok(value) => f(Some(value.as_ref()), None),
                Err(failure) => f(None, Some(failure)),
            };
            mapped.map(Arc::new).map_err(Failure::wrap)
        });
        next
    }
}
