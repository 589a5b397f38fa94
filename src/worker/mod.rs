//! Worker delegation: running a computation on a snapshot, off-thread.
//!
//! Delegation moves a long computation off the host thread entirely. The
//! live graph is captured into an immutable [`WorkerSnapshot`] (dense
//! positions, no shared memory), shipped to a dedicated worker thread over
//! a command channel, and rebuilt there into a private runtime. The worker
//! drives a session to completion, streaming [`Event::Progress`] back, and
//! finally returns a [`WorkerResult`] whose values the host applies
//! through
//! [`GraphRuntime::apply_worker_result`](crate::GraphRuntime::apply_worker_result)
//! — which re-validates the entity count, because the live graph may have
//! mutated while the worker ran.
//!
//! Commands and events are correlated by request id and session id. The
//! payload types are serde-serializable, so the same protocol crosses a
//! process boundary unchanged; in this crate the transport is a pair of
//! in-process mpsc channels.

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::engine::{
    ComputationParams, ComputationSummary, ElementType, EntityKind, GraphEngine, ProgressReport,
};
use crate::error::{Result, RuntimeError};
use crate::runtime::GraphRuntime;
use crate::session::{Session, SessionConfig, StepOptions};

/// Immutable, self-contained capture of the live graph for delegation.
///
/// Node ids are remapped to dense positions `0..node_count`; edges and
/// weights refer to positions. Nothing here aliases the live graph's
/// memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    /// Computation kind to run against the snapshot.
    pub kind: String,
    pub directed: bool,
    pub node_count: u32,
    /// Edge endpoint positions, in dense edge order.
    pub edges: Vec<(u32, u32)>,
    /// Per-edge weights aligned with `edges`, when the computation is
    /// weighted.
    pub weights: Option<Vec<f64>>,
    pub params: ComputationParams,
    pub out_attribute: String,
}

/// Values and summary produced by a delegated computation.
///
/// `values[i]` belongs to the entity at dense position `i` of the
/// snapshot. `entity_count` is echoed for re-validation at apply time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResult {
    pub entity_count: u32,
    pub values: Vec<u32>,
    pub summary: ComputationSummary,
}

/// Host-to-worker protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    Create {
        id: u64,
        session: u64,
        snapshot: WorkerSnapshot,
    },
    Run {
        id: u64,
        session: u64,
    },
    Cancel {
        id: u64,
        session: u64,
        reason: String,
    },
    Dispose {
        id: u64,
        session: u64,
    },
    Shutdown,
}

/// Worker-to-host protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Created {
        id: u64,
        session: u64,
    },
    Progress {
        id: u64,
        session: u64,
        report: ProgressReport,
    },
    Done {
        id: u64,
        session: u64,
        result: WorkerResult,
    },
    Failed {
        id: u64,
        session: u64,
        error: String,
    },
    Canceled {
        id: u64,
        session: u64,
        reason: String,
    },
    Disposed {
        id: u64,
        session: u64,
    },
}

/// One delegated session living on the worker thread.
struct Delegate<E: GraphEngine> {
    runtime: GraphRuntime<E>,
    session: Session<E>,
    out_attribute: String,
    node_count: u32,
}

/// Spawns worker threads that rebuild snapshots with engines from a
/// factory.
pub struct WorkerHost;

impl WorkerHost {
    /// Spawns a worker thread and returns its client handle.
    ///
    /// `factory` builds a fresh, empty engine per snapshot; the worker
    /// populates it from the snapshot and never touches the host's
    /// engine.
    pub fn spawn<E, F>(factory: F) -> WorkerClient
    where
        E: GraphEngine + Send + 'static,
        F: Fn() -> E + Send + 'static,
    {
        Self::spawn_with_config(factory, RuntimeConfig::default())
    }

    pub fn spawn_with_config<E, F>(factory: F, config: RuntimeConfig) -> WorkerClient
    where
        E: GraphEngine + Send + 'static,
        F: Fn() -> E + Send + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let (event_tx, event_rx) = mpsc::channel();
        let thread = std::thread::Builder::new()
            .name("lattice-worker".to_string())
            .spawn(move || host_loop(factory, config, cmd_rx, event_tx))
            .ok();
        WorkerClient {
            commands: cmd_tx,
            events: event_rx,
            thread,
            next_id: 1,
        }
    }
}

/// Client half of the protocol; lives on the host thread.
pub struct WorkerClient {
    commands: Sender<Command>,
    events: Receiver<Event>,
    thread: Option<JoinHandle<()>>,
    next_id: u64,
}

impl WorkerClient {
    fn fresh_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| RuntimeError::Channel("worker command channel closed".to_string()))
    }

    fn recv(&self) -> Result<Event> {
        self.events
            .recv()
            .map_err(|_| RuntimeError::Channel("worker event channel closed".to_string()))
    }

    /// Ships a snapshot to the worker; returns the delegated session id.
    pub fn create(&mut self, snapshot: WorkerSnapshot) -> Result<u64> {
        let id = self.fresh_id();
        let session = self.fresh_id();
        self.send(Command::Create {
            id,
            session,
            snapshot,
        })?;
        loop {
            match self.recv()? {
                Event::Created { id: got, session } if got == id => return Ok(session),
                Event::Failed {
                    id: got, error, ..
                } if got == id => return Err(RuntimeError::NativeFailure(error)),
                _ => {}
            }
        }
    }

    /// Runs a delegated session to completion, invoking `on_progress`
    /// for every progress event it streams back.
    pub fn run(
        &mut self,
        session: u64,
        mut on_progress: impl FnMut(&ProgressReport),
    ) -> Result<WorkerResult> {
        let id = self.fresh_id();
        self.send(Command::Run { id, session })?;
        loop {
            match self.recv()? {
                Event::Progress {
                    session: got,
                    report,
                    ..
                } if got == session => on_progress(&report),
                Event::Done {
                    session: got,
                    result,
                    ..
                } if got == session => return Ok(result),
                Event::Failed {
                    session: got,
                    error,
                    ..
                } if got == session => return Err(RuntimeError::NativeFailure(error)),
                Event::Canceled {
                    session: got,
                    reason,
                    ..
                } if got == session => return Err(RuntimeError::Canceled { reason }),
                _ => {}
            }
        }
    }

    /// Handle for canceling from another thread while `run` blocks.
    pub fn canceller(&self, session: u64) -> WorkerCanceller {
        WorkerCanceller {
            commands: self.commands.clone(),
            session,
        }
    }

    /// Queues a cancel for a delegated session.
    pub fn cancel(&mut self, session: u64, reason: &str) -> Result<()> {
        let id = self.fresh_id();
        self.send(Command::Cancel {
            id,
            session,
            reason: reason.to_string(),
        })
    }

    /// Releases a delegated session on the worker.
    pub fn dispose(&mut self, session: u64) -> Result<()> {
        let id = self.fresh_id();
        self.send(Command::Dispose { id, session })?;
        loop {
            match self.recv()? {
                Event::Disposed { id: got, .. } if got == id => return Ok(()),
                _ => {}
            }
        }
    }
}

impl Drop for WorkerClient {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Cancel handle usable from any thread.
#[derive(Clone)]
pub struct WorkerCanceller {
    commands: Sender<Command>,
    session: u64,
}

impl WorkerCanceller {
    pub fn cancel(&self, reason: &str) -> Result<()> {
        self.commands
            .send(Command::Cancel {
                id: 0,
                session: self.session,
                reason: reason.to_string(),
            })
            .map_err(|_| RuntimeError::Channel("worker command channel closed".to_string()))
    }
}

/// Builds a private runtime and session from a snapshot.
fn build_delegate<E: GraphEngine>(engine: E, snapshot: &WorkerSnapshot) -> Result<Delegate<E>> {
    let runtime = GraphRuntime::new(engine);
    runtime.add_nodes(snapshot.node_count as usize)?;
    runtime.add_edges(&snapshot.edges)?;
    if let (Some(weights), Some(attr)) = (&snapshot.weights, &snapshot.params.weight_attribute) {
        runtime.define_attribute(EntityKind::Edge, attr, ElementType::F64, 1)?;
        runtime.with_attribute_mut::<f64, _>(EntityKind::Edge, attr, |view| {
            for (id, weight) in weights.iter().enumerate() {
                view.set(id as u32, *weight);
            }
        })?;
    }
    let config = SessionConfig::new(snapshot.kind.clone())
        .with_params(snapshot.params.clone())
        .with_out_attribute(snapshot.out_attribute.clone());
    let session = runtime.create_session(config)?;
    Ok(Delegate {
        runtime,
        session,
        out_attribute: snapshot.out_attribute.clone(),
        node_count: snapshot.node_count,
    })
}

fn host_loop<E, F>(
    factory: F,
    config: RuntimeConfig,
    commands: Receiver<Command>,
    events: Sender<Event>,
) where
    E: GraphEngine + Send + 'static,
    F: Fn() -> E + Send + 'static,
{
    let mut delegates: HashMap<u64, Delegate<E>> = HashMap::new();
    let mut pending: VecDeque<Command> = VecDeque::new();
    info!("worker thread started");

    loop {
        let command = match pending.pop_front() {
            Some(command) => command,
            None => match commands.recv() {
                Ok(command) => command,
                Err(_) => break,
            },
        };
        match command {
            Command::Create {
                id,
                session,
                snapshot,
            } => {
                debug!(session, nodes = snapshot.node_count, "delegate create");
                let event = match build_delegate(factory(), &snapshot) {
                    Ok(delegate) => {
                        delegates.insert(session, delegate);
                        Event::Created { id, session }
                    }
                    Err(err) => Event::Failed {
                        id,
                        session,
                        error: err.to_string(),
                    },
                };
                if events.send(event).is_err() {
                    break;
                }
            }
            Command::Run { id, session } => {
                let outcome = run_delegate(
                    id,
                    session,
                    &mut delegates,
                    &mut pending,
                    &commands,
                    &events,
                    &config,
                );
                if outcome.is_err() {
                    break;
                }
            }
            Command::Cancel {
                id,
                session,
                reason,
            } => {
                if let Some(delegate) = delegates.get_mut(&session) {
                    delegate.session.cancel(&reason);
                    if events
                        .send(Event::Canceled {
                            id,
                            session,
                            reason,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
            }
            Command::Dispose { id, session } => {
                if let Some(mut delegate) = delegates.remove(&session) {
                    delegate.session.dispose();
                    delegate.runtime.dispose();
                }
                if events.send(Event::Disposed { id, session }).is_err() {
                    break;
                }
            }
            Command::Shutdown => break,
        }
    }
    info!("worker thread stopped");
}

/// Drives one delegated session to a terminal event.
///
/// Control commands arriving mid-run are drained between steps: cancels
/// and disposes for this session apply immediately, anything else queues
/// for the main loop. Returns `Err` only when the event channel closed.
#[allow(clippy::too_many_arguments)]
fn run_delegate<E: GraphEngine>(
    id: u64,
    session_id: u64,
    delegates: &mut HashMap<u64, Delegate<E>>,
    pending: &mut VecDeque<Command>,
    commands: &Receiver<Command>,
    events: &Sender<Event>,
    config: &RuntimeConfig,
) -> std::result::Result<(), ()> {
    let send = |event: Event| events.send(event).map_err(|_| ());

    if !delegates.contains_key(&session_id) {
        return send(Event::Failed {
            id,
            session: session_id,
            error: format!("unknown delegated session {session_id}"),
        });
    }

    let step = StepOptions {
        budget: Some(config.step_budget),
        timeout_ms: None,
        chunk_budget: None,
    };
    for _ in 0..config.max_run_iterations {
        // Drain control traffic that arrived while stepping.
        while let Ok(command) = commands.try_recv() {
            pending.push_back(command);
        }
        let mut canceled: Option<(u64, String)> = None;
        let mut disposed: Option<u64> = None;
        pending.retain(|command| match command {
            Command::Cancel {
                id,
                session,
                reason,
            } if *session == session_id => {
                canceled = Some((*id, reason.clone()));
                false
            }
            Command::Dispose { id, session } if *session == session_id => {
                disposed = Some(*id);
                false
            }
            _ => true,
        });
        if let Some((cancel_id, reason)) = canceled {
            if let Some(delegate) = delegates.get_mut(&session_id) {
                delegate.session.cancel(&reason);
            }
            warn!(session = session_id, %reason, "delegate canceled mid-run");
            return send(Event::Canceled {
                id: cancel_id,
                session: session_id,
                reason,
            });
        }
        if let Some(dispose_id) = disposed {
            if let Some(mut delegate) = delegates.remove(&session_id) {
                delegate.session.dispose();
                delegate.runtime.dispose();
            }
            return send(Event::Disposed {
                id: dispose_id,
                session: session_id,
            });
        }

        let Some(delegate) = delegates.get_mut(&session_id) else {
            return send(Event::Failed {
                id,
                session: session_id,
                error: format!("unknown delegated session {session_id}"),
            });
        };
        match delegate.session.step(step) {
            Ok(crate::session::Phase::Done) => {
                let result = match finish_delegate(delegate) {
                    Ok(result) => result,
                    Err(err) => {
                        return send(Event::Failed {
                            id,
                            session: session_id,
                            error: err.to_string(),
                        })
                    }
                };
                debug!(
                    session = session_id,
                    groups = result.summary.group_count,
                    "delegate done"
                );
                return send(Event::Done {
                    id,
                    session: session_id,
                    result,
                });
            }
            Ok(_) => match delegate.session.progress() {
                Ok(report) => {
                    send(Event::Progress {
                        id,
                        session: session_id,
                        report,
                    })?;
                }
                Err(err) => {
                    return send(failure_event(id, session_id, err));
                }
            },
            Err(err) => {
                return send(failure_event(id, session_id, err));
            }
        }
        if config.yield_ms > 0 {
            std::thread::sleep(Duration::from_millis(config.yield_ms));
        }
    }
    send(Event::Failed {
        id,
        session: session_id,
        error: "delegated computation did not terminate".to_string(),
    })
}

fn failure_event(id: u64, session: u64, err: RuntimeError) -> Event {
    match err {
        RuntimeError::Canceled { reason } => Event::Canceled {
            id,
            session,
            reason,
        },
        other => Event::Failed {
            id,
            session,
            error: other.to_string(),
        },
    }
}

/// Finalizes a done session and packages the result values.
fn finish_delegate<E: GraphEngine>(delegate: &mut Delegate<E>) -> Result<WorkerResult> {
    let summary = delegate.session.finalize()?;
    let values = delegate
        .runtime
        .dense_values::<u32>(EntityKind::Node, &delegate.out_attribute)?
        .to_vec();
    Ok(WorkerResult {
        entity_count: delegate.node_count,
        values,
        summary,
    })
}

/// Snapshot-run-apply in one call: captures the live graph, runs the
/// computation on a worker built by `factory`, and applies the result.
pub fn delegate_run<E, E2, F>(
    runtime: &GraphRuntime<E>,
    kind: &str,
    params: &ComputationParams,
    out_attribute: &str,
    factory: F,
    on_progress: impl FnMut(&ProgressReport),
) -> Result<ComputationSummary>
where
    E: GraphEngine,
    E2: GraphEngine + Send + 'static,
    F: Fn() -> E2 + Send + 'static,
{
    let snapshot = runtime.snapshot(kind, params, out_attribute)?;
    let mut client = WorkerHost::spawn(factory);
    let session = client.create(snapshot)?;
    let result = client.run(session, on_progress)?;
    client.dispose(session)?;
    runtime.apply_worker_result(&result, out_attribute)?;
    Ok(result.summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::memory::{MemoryEngine, COMPONENTS};
    use crate::runtime::GraphRuntime;

    fn two_component_graph() -> GraphRuntime<MemoryEngine> {
        let runtime = GraphRuntime::new(MemoryEngine::new());
        runtime.add_nodes(6).unwrap();
        // Two triangles, no edge between them.
        runtime
            .add_edges(&[(0, 1), (1, 2), (2, 0), (3, 4), (4, 5), (5, 3)])
            .unwrap();
        runtime
    }

    #[test]
    fn delegation_round_trip_applies_labels() {
        let runtime = two_component_graph();
        let summary = delegate_run(
            &runtime,
            COMPONENTS,
            &ComputationParams::default(),
            "community",
            MemoryEngine::new,
            |_| {},
        )
        .unwrap();
        assert_eq!(summary.entity_count, 6);
        assert_eq!(summary.group_count, 2);

        let labels = runtime
            .dense_values::<u32>(EntityKind::Node, "community")
            .unwrap()
            .to_vec();
        assert_eq!(labels.len(), 6);
        assert_eq!(labels[0], labels[1]);
        assert_eq!(labels[1], labels[2]);
        assert_eq!(labels[3], labels[4]);
        assert_ne!(labels[0], labels[3]);
    }

    #[test]
    fn apply_refused_after_live_mutation() {
        let runtime = two_component_graph();
        let snapshot = runtime
            .snapshot(COMPONENTS, &ComputationParams::default(), "community")
            .unwrap();
        let mut client = WorkerHost::spawn(MemoryEngine::new);
        let session = client.create(snapshot).unwrap();
        let result = client.run(session, |_| {}).unwrap();

        // Mutate while the result is in flight.
        runtime.add_nodes(1).unwrap();
        let err = runtime
            .apply_worker_result(&result, "community")
            .unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::SnapshotMismatch { result: 6, live: 7 }
        ));
        assert!(!runtime.has_attribute(EntityKind::Node, "community"));
    }

    #[test]
    fn queued_cancel_wins_over_run() {
        let runtime = two_component_graph();
        let snapshot = runtime
            .snapshot(COMPONENTS, &ComputationParams::default(), "community")
            .unwrap();
        let mut client = WorkerHost::spawn(MemoryEngine::new);
        let session = client.create(snapshot).unwrap();
        client.cancel(session, "host shutdown").unwrap();

        let err = client.run(session, |_| {}).unwrap_err();
        match err {
            RuntimeError::Canceled { reason } => assert_eq!(reason, "host shutdown"),
            other => panic!("expected cancellation, got {other:?}"),
        }
    }

    #[test]
    fn run_on_unknown_session_fails() {
        let mut client = WorkerHost::spawn(MemoryEngine::new);
        let err = client.run(42, |_| {}).unwrap_err();
        assert!(matches!(err, RuntimeError::NativeFailure(_)));
    }

    #[test]
    fn snapshot_remaps_ids_to_dense_positions() {
        let runtime = two_component_graph();
        runtime.remove_nodes(&[0]).unwrap();
        let snapshot = runtime
            .snapshot(COMPONENTS, &ComputationParams::default(), "community")
            .unwrap();
        assert_eq!(snapshot.node_count, 5);
        // Dense order is [1, 2, 3, 4, 5]; the surviving triangle edge
        // (1, 2) becomes positions (0, 1).
        assert!(snapshot.edges.contains(&(0, 1)));
        assert!(snapshot
            .edges
            .iter()
            .all(|&(a, b)| a < 5 && b < 5));
    }

    #[test]
    fn weighted_snapshot_carries_edge_weights() {
        let runtime = two_component_graph();
        runtime
            .define_attribute(EntityKind::Edge, "weight", ElementType::F64, 1)
            .unwrap();
        runtime
            .with_attribute_mut::<f64, _>(EntityKind::Edge, "weight", |view| {
                for id in 0..6 {
                    view.set(id, id as f64 + 0.5);
                }
            })
            .unwrap();
        let params = ComputationParams {
            weight_attribute: Some("weight".to_string()),
            ..ComputationParams::default()
        };
        let snapshot = runtime
            .snapshot(COMPONENTS, &params, "community")
            .unwrap();
        assert_eq!(
            snapshot.weights.as_deref(),
            Some(&[0.5, 1.5, 2.5, 3.5, 4.5, 5.5][..])
        );
    }

    #[test]
    fn snapshot_serializes_for_cross_boundary_transfer() {
        let runtime = two_component_graph();
        let snapshot = runtime
            .snapshot(COMPONENTS, &ComputationParams::default(), "community")
            .unwrap();
        let json = serde_json::to_string(&snapshot).unwrap();
        let back: WorkerSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.node_count, snapshot.node_count);
        assert_eq!(back.edges, snapshot.edges);
    }
}
