//! Steppable sessions over long-running native computations.
//!
//! A session wraps one native computation handle and drives it in bounded
//! increments so the host thread is never blocked for longer than it asked
//! for. The phase machine is `Idle -> Running -> {Done | Failed}`, with
//! `Canceled` reachable from any non-terminal phase — explicitly via
//! [`Session::cancel`], or automatically when a watched version scope
//! changes under the session's feet (the computation was reading state
//! that no longer exists in the shape it started from).
//!
//! Watch checks run before any work: a mutated graph cancels the session
//! on the next `step`/`progress` call rather than producing results
//! computed over inconsistent inputs. The cancel reason names the changed
//! scope so callers can tell cancellation-by-mutation from a native
//! failure.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::engine::{
    classify_phase, ComputationHandle, ComputationParams, ComputationSummary, EntityKind,
    GraphEngine, PhaseClass, ProgressReport,
};
use crate::error::{Result, RuntimeError};
use crate::runtime::GraphRuntime;
use crate::version::VersionScope;

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Created, not yet stepped.
    Idle,
    /// At least one step taken, no terminal phase reached.
    Running,
    /// The native computation completed; results await finalization.
    Done,
    /// The native computation reported failure. No partial result is
    /// trusted.
    Failed,
    /// Canceled explicitly or by a watched mutation.
    Canceled,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::Failed | Phase::Canceled)
    }
}

/// Configuration for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Computation kind, matched against the engine's entry points.
    pub kind: String,
    pub params: ComputationParams,
    /// Version scopes whose change auto-cancels the session. The weight
    /// attribute named in `params` is watched implicitly.
    pub watch: Vec<VersionScope>,
    /// Node attribute the result is written to at finalization.
    pub out_attribute: String,
}

impl SessionConfig {
    /// Defaults: watch both topologies, write to `"community"`.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            params: ComputationParams::default(),
            watch: vec![
                VersionScope::Topology(EntityKind::Node),
                VersionScope::Topology(EntityKind::Edge),
            ],
            out_attribute: "community".to_string(),
        }
    }

    pub fn with_params(mut self, params: ComputationParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_watch(mut self, watch: Vec<VersionScope>) -> Self {
        self.watch = watch;
        self
    }

    pub fn with_out_attribute(mut self, name: impl Into<String>) -> Self {
        self.out_attribute = name.into();
        self
    }
}

/// Per-call overrides for [`Session::step`]. `None` falls back to the
/// runtime configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepOptions {
    /// Work units for a single budgeted advance.
    pub budget: Option<u32>,
    /// Wall-clock deadline in milliseconds; enables chunked stepping.
    pub timeout_ms: Option<u64>,
    /// Chunk size while time-boxed; overrun past the deadline is bounded
    /// by one chunk.
    pub chunk_budget: Option<u32>,
}

/// Controls for the [`Session::run`] convenience loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions<'a> {
    pub step: StepOptions,
    /// Cooperative abort flag checked before every step.
    pub abort: Option<&'a std::sync::atomic::AtomicBool>,
    /// Iteration cap override; guards against a native computation that
    /// never terminates.
    pub max_iterations: Option<usize>,
}

/// A steppable handle over one native computation.
///
/// Not `Clone`; the session owns its native handle and releases it on
/// [`dispose`](Session::dispose) or drop.
pub struct Session<E: GraphEngine> {
    runtime: GraphRuntime<E>,
    handle: Option<ComputationHandle>,
    phase: Phase,
    config: SessionConfig,
    baseline: Vec<(VersionScope, u64)>,
    cancel_reason: Option<String>,
    summary: Option<ComputationSummary>,
}

impl<E: GraphEngine> Session<E> {
    pub(crate) fn new(runtime: GraphRuntime<E>, config: SessionConfig) -> Result<Self> {
        let handle = {
            let mut engine = runtime.lock_engine_mut("create session")?;
            if !engine.supports_computation(&config.kind) {
                return Err(RuntimeError::MissingEntryPoint(format!(
                    "computation \"{}\"",
                    config.kind
                )));
            }
            engine.computation_create(&config.kind, &config.params)?
        };

        let mut watch = config.watch.clone();
        if let Some(attr) = &config.params.weight_attribute {
            let scope = VersionScope::attribute(EntityKind::Edge, attr.clone());
            if !watch.contains(&scope) {
                watch.push(scope);
            }
        }
        let baseline = watch
            .into_iter()
            .map(|scope| {
                let version = runtime.version(&scope);
                (scope, version)
            })
            .collect();

        info!(kind = %config.kind, "session created");
        Ok(Self {
            runtime,
            handle: Some(handle),
            phase: Phase::Idle,
            config,
            baseline,
            cancel_reason: None,
            summary: None,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Cancel reason, set once the phase is `Canceled`.
    pub fn cancel_reason(&self) -> Option<&str> {
        self.cancel_reason.as_deref()
    }

    fn live_handle(&self) -> Result<ComputationHandle> {
        self.handle.ok_or(RuntimeError::Disposed("session"))
    }

    fn canceled_err(&self) -> RuntimeError {
        RuntimeError::Canceled {
            reason: self
                .cancel_reason
                .clone()
                .unwrap_or_else(|| "canceled".to_string()),
        }
    }

    /// Compares watched scopes against their baselines; the first
    /// mismatch cancels the session.
    fn check_watch(&mut self) -> Result<()> {
        if self.phase.is_terminal() {
            return Ok(());
        }
        let mut changed = None;
        for (scope, baseline) in &self.baseline {
            let current = self.runtime.version(scope);
            if current != *baseline {
                warn!(%scope, baseline, current, "session auto-canceled");
                changed = Some(format!("{scope} changed"));
                break;
            }
        }
        match changed {
            Some(reason) => {
                self.cancel(&reason);
                Err(self.canceled_err())
            }
            None => Ok(()),
        }
    }

    /// Advances the computation by one bounded increment.
    ///
    /// Budgeted by default; when a timeout applies, advances in chunks
    /// until the deadline passes or a terminal phase is reached. Terminal
    /// `Done`/`Failed` phases make this a no-op; a canceled or disposed
    /// session errors.
    pub fn step(&mut self, options: StepOptions) -> Result<Phase> {
        let handle = self.live_handle()?;
        match self.phase {
            Phase::Done | Phase::Failed => return Ok(self.phase),
            Phase::Canceled => return Err(self.canceled_err()),
            Phase::Idle | Phase::Running => {}
        }
        self.check_watch()?;

        let defaults = self.runtime.config();
        let budget = options.budget.unwrap_or(defaults.step_budget);
        let timeout_ms = options.timeout_ms.or(defaults.step_timeout_ms);
        let chunk = options.chunk_budget.unwrap_or(defaults.chunk_budget).max(1);

        let mut engine = self.runtime.lock_engine_mut("step session")?;
        let code = match timeout_ms {
            None => engine.computation_step(handle, budget)?,
            Some(ms) => {
                let deadline = Instant::now() + Duration::from_millis(ms);
                loop {
                    let code = engine.computation_step(handle, chunk)?;
                    if classify_phase(code) != PhaseClass::Running
                        || Instant::now() >= deadline
                    {
                        break code;
                    }
                }
            }
        };
        drop(engine);

        match classify_phase(code) {
            PhaseClass::Running => {
                self.phase = Phase::Running;
                Ok(Phase::Running)
            }
            PhaseClass::Done => {
                self.phase = Phase::Done;
                debug!(kind = %self.config.kind, "session done");
                Ok(Phase::Done)
            }
            PhaseClass::Failed => {
                self.phase = Phase::Failed;
                Err(RuntimeError::NativeFailure(format!(
                    "computation \"{}\" reported phase {code}",
                    self.config.kind
                )))
            }
        }
    }

    /// Reads progress counters. Performs the watch check first, so a
    /// progress poll after a graph mutation cancels exactly like a step.
    pub fn progress(&mut self) -> Result<ProgressReport> {
        let handle = self.live_handle()?;
        if self.phase == Phase::Canceled {
            return Err(self.canceled_err());
        }
        self.check_watch()?;
        let engine = self.runtime.lock_engine()?;
        engine.computation_progress(handle)
    }

    /// Writes the result into the destination attribute and returns the
    /// summary. Only legal once the phase is `Done`; memoized, so calling
    /// again returns the same summary without touching the engine.
    pub fn finalize(&mut self) -> Result<ComputationSummary> {
        let handle = self.live_handle()?;
        if let Some(summary) = &self.summary {
            return Ok(summary.clone());
        }
        match self.phase {
            Phase::Done => {}
            Phase::Canceled => return Err(self.canceled_err()),
            other => {
                return Err(RuntimeError::InvalidArgument(format!(
                    "cannot finalize a session in phase {other:?}"
                )))
            }
        }

        let mut engine = self.runtime.lock_engine_mut("finalize session")?;
        let summary = engine.computation_finalize(handle, &self.config.out_attribute)?;
        self.runtime.bump_scope(
            &mut engine,
            VersionScope::attribute(EntityKind::Node, self.config.out_attribute.clone()),
        );
        drop(engine);

        info!(
            kind = %self.config.kind,
            out = %self.config.out_attribute,
            groups = summary.group_count,
            "session finalized"
        );
        self.summary = Some(summary.clone());
        Ok(summary)
    }

    /// Cancels the session. Idempotent; no-op once `Done` or `Failed`.
    pub fn cancel(&mut self, reason: &str) {
        match self.phase {
            Phase::Done | Phase::Failed | Phase::Canceled => {}
            Phase::Idle | Phase::Running => {
                self.phase = Phase::Canceled;
                self.cancel_reason = Some(reason.to_string());
                debug!(reason, "session canceled");
            }
        }
    }

    /// Releases the native computation. Idempotent; later calls on this
    /// session fail with [`RuntimeError::Disposed`].
    pub fn dispose(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if self.runtime.is_disposed() {
            return;
        }
        if let Ok(mut engine) = self.runtime.lock_engine_mut("dispose session") {
            engine.computation_destroy(handle);
        }
    }

    /// Drives the session to completion and finalizes.
    ///
    /// Steps in a loop, invoking `on_progress` after every non-terminal
    /// step and yielding between iterations per the runtime
    /// configuration. Cancels cooperatively when the abort flag is set.
    pub fn run(
        &mut self,
        options: RunOptions<'_>,
        mut on_progress: impl FnMut(&ProgressReport),
    ) -> Result<ComputationSummary> {
        let defaults = self.runtime.config();
        let max_iterations = options.max_iterations.unwrap_or(defaults.max_run_iterations);
        let yield_ms = defaults.yield_ms;

        for _ in 0..max_iterations {
            if let Some(abort) = options.abort {
                if abort.load(std::sync::atomic::Ordering::Acquire) {
                    self.cancel("aborted by caller");
                    return Err(self.canceled_err());
                }
            }
            match self.step(options.step)? {
                Phase::Done => return self.finalize(),
                _ => {
                    let report = self.progress()?;
                    on_progress(&report);
                }
            }
            if yield_ms > 0 {
                std::thread::sleep(Duration::from_millis(yield_ms));
            } else {
                std::thread::yield_now();
            }
        }
        Err(RuntimeError::NativeFailure(format!(
            "computation \"{}\" did not reach a terminal phase within {max_iterations} steps",
            self.config.kind
        )))
    }
}

impl<E: GraphEngine> Drop for Session<E> {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::memory::{MemoryEngine, COMPONENTS};
    use crate::engine::ElementType;
    use crate::runtime::GraphRuntime;

    fn path_graph(nodes: usize) -> GraphRuntime<MemoryEngine> {
        let runtime = GraphRuntime::new(MemoryEngine::new());
        let ids = runtime.add_nodes(nodes).unwrap();
        let pairs: Vec<(u32, u32)> = ids.windows(2).map(|w| (w[0], w[1])).collect();
        runtime.add_edges(&pairs).unwrap();
        runtime
    }

    fn unbudgeted() -> StepOptions {
        StepOptions {
            budget: Some(u32::MAX),
            timeout_ms: None,
            chunk_budget: None,
        }
    }

    #[test]
    fn session_runs_to_done_and_finalizes() {
        let runtime = path_graph(6);
        let mut session = runtime
            .create_session(SessionConfig::new(COMPONENTS))
            .unwrap();
        assert_eq!(session.phase(), Phase::Idle);

        let mut steps = 0;
        while session.step(unbudgeted()).unwrap() != Phase::Done {
            steps += 1;
            assert!(steps < 100, "components never converged");
        }
        assert_eq!(session.phase(), Phase::Done);

        let summary = session.finalize().unwrap();
        assert_eq!(summary.entity_count, 6);
        assert_eq!(summary.group_count, 1);
        assert!(runtime.has_attribute(EntityKind::Node, "community"));

        // Finalize is memoized.
        let again = session.finalize().unwrap();
        assert_eq!(again, summary);
    }

    #[test]
    fn generous_deadline_drives_chunks_to_done() {
        let runtime = path_graph(8);
        let mut session = runtime
            .create_session(SessionConfig::new(COMPONENTS))
            .unwrap();

        // Chunks of one work unit under a deadline far in the future:
        // the loop keeps chunking inside a single step call until the
        // computation is terminal.
        let phase = session
            .step(StepOptions {
                budget: None,
                timeout_ms: Some(10_000),
                chunk_budget: Some(1),
            })
            .unwrap();
        assert_eq!(phase, Phase::Done);
        assert_eq!(session.finalize().unwrap().group_count, 1);
    }

    #[test]
    fn elapsed_deadline_overruns_by_one_chunk_at_most() {
        let runtime = path_graph(8);
        let mut session = runtime
            .create_session(SessionConfig::new(COMPONENTS))
            .unwrap();

        // A zero deadline has already passed when the first chunk
        // returns, so exactly one chunk of work lands.
        let phase = session
            .step(StepOptions {
                budget: None,
                timeout_ms: Some(0),
                chunk_budget: Some(3),
            })
            .unwrap();
        assert_eq!(phase, Phase::Running);
        let report = session.progress().unwrap();
        assert_eq!(report.current, 3.0);
    }

    #[test]
    fn finalize_before_done_is_rejected() {
        let runtime = path_graph(4);
        let mut session = runtime
            .create_session(SessionConfig::new(COMPONENTS))
            .unwrap();
        let err = session.finalize().unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidArgument(_)));
    }

    #[test]
    fn topology_mutation_auto_cancels() {
        let runtime = path_graph(4);
        let mut session = runtime
            .create_session(SessionConfig::new(COMPONENTS))
            .unwrap();
        let phase = session
            .step(StepOptions {
                budget: Some(1),
                ..StepOptions::default()
            })
            .unwrap();
        assert_eq!(phase, Phase::Running);

        runtime.add_nodes(1).unwrap();
        let err = session.step(StepOptions::default()).unwrap_err();
        match err {
            RuntimeError::Canceled { reason } => {
                assert_eq!(reason, "node topology changed");
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
        assert_eq!(session.phase(), Phase::Canceled);

        // Canceled is sticky.
        assert!(matches!(
            session.step(StepOptions::default()).unwrap_err(),
            RuntimeError::Canceled { .. }
        ));
    }

    #[test]
    fn watched_attribute_mutation_auto_cancels() {
        let runtime = path_graph(4);
        runtime
            .define_attribute(EntityKind::Edge, "weight", ElementType::F64, 1)
            .unwrap();
        let config = SessionConfig::new(COMPONENTS).with_params(ComputationParams {
            weight_attribute: Some("weight".to_string()),
            ..ComputationParams::default()
        });
        let mut session = runtime.create_session(config).unwrap();

        runtime
            .with_attribute_mut::<f64, _>(EntityKind::Edge, "weight", |view| {
                view.set(0, 2.0);
            })
            .unwrap();
        let err = session.progress().unwrap_err();
        match err {
            RuntimeError::Canceled { reason } => {
                assert_eq!(reason, "edge attribute \"weight\" changed");
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
    }

    #[test]
    fn explicit_cancel_is_idempotent_and_keeps_first_reason() {
        let runtime = path_graph(3);
        let mut session = runtime
            .create_session(SessionConfig::new(COMPONENTS))
            .unwrap();
        session.cancel("host shutdown");
        session.cancel("second reason");
        assert_eq!(session.cancel_reason(), Some("host shutdown"));
        assert_eq!(session.phase(), Phase::Canceled);
    }

    #[test]
    fn native_failure_is_terminal() {
        let runtime = path_graph(4);
        let mut session = runtime
            .create_session(SessionConfig::new(COMPONENTS))
            .unwrap();
        runtime.with_engine_mut(|e| e.inject_step_failure()).unwrap();

        let err = session.step(StepOptions::default()).unwrap_err();
        assert!(matches!(err, RuntimeError::NativeFailure(_)));
        assert_eq!(session.phase(), Phase::Failed);

        // Terminal phases make step a no-op.
        assert_eq!(session.step(StepOptions::default()).unwrap(), Phase::Failed);
        assert!(matches!(
            session.finalize().unwrap_err(),
            RuntimeError::InvalidArgument(_)
        ));
    }

    #[test]
    fn small_budget_stays_running() {
        let runtime = path_graph(64);
        let mut session = runtime
            .create_session(SessionConfig::new(COMPONENTS))
            .unwrap();
        let phase = session
            .step(StepOptions {
                budget: Some(1),
                timeout_ms: None,
                chunk_budget: None,
            })
            .unwrap();
        assert_eq!(phase, Phase::Running);
        let report = session.progress().unwrap();
        assert!(report.current > 0.0);
        assert!(report.current < report.total);
    }

    #[test]
    fn unknown_kind_is_a_missing_entry_point() {
        let runtime = path_graph(3);
        let err = runtime
            .create_session(SessionConfig::new("does-not-exist"))
            .err()
            .unwrap();
        assert!(matches!(err, RuntimeError::MissingEntryPoint(_)));
    }

    #[test]
    fn empty_graph_rejects_session_creation() {
        let runtime = GraphRuntime::new(MemoryEngine::new());
        let err = runtime
            .create_session(SessionConfig::new(COMPONENTS))
            .err()
            .unwrap();
        assert!(matches!(err, RuntimeError::InvalidArgument(_)));
    }

    #[test]
    fn disposed_session_rejects_everything() {
        let runtime = path_graph(3);
        let mut session = runtime
            .create_session(SessionConfig::new(COMPONENTS))
            .unwrap();
        session.dispose();
        session.dispose();
        assert!(matches!(
            session.step(StepOptions::default()).unwrap_err(),
            RuntimeError::Disposed(_)
        ));
        assert!(matches!(
            session.progress().unwrap_err(),
            RuntimeError::Disposed(_)
        ));
    }

    #[test]
    fn run_drives_to_completion_with_progress() {
        let runtime = path_graph(8);
        let mut session = runtime
            .create_session(SessionConfig::new(COMPONENTS))
            .unwrap();
        let mut reports = 0usize;
        let summary = session
            .run(
                RunOptions {
                    step: StepOptions {
                        budget: Some(4),
                        ..StepOptions::default()
                    },
                    ..RunOptions::default()
                },
                |_| reports += 1,
            )
            .unwrap();
        assert_eq!(summary.group_count, 1);
        assert!(reports > 0);
    }

    #[test]
    fn run_honors_abort_flag() {
        use std::sync::atomic::AtomicBool;
        let runtime = path_graph(8);
        let mut session = runtime
            .create_session(SessionConfig::new(COMPONENTS))
            .unwrap();
        let abort = AtomicBool::new(true);
        let err = session
            .run(
                RunOptions {
                    abort: Some(&abort),
                    ..RunOptions::default()
                },
                |_| {},
            )
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Canceled { .. }));
        assert_eq!(session.cancel_reason(), Some("aborted by caller"));
    }
}
