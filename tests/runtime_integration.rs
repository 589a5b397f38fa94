//! End-to-end coverage of dense aliasing, version coherence, and the
//! session pipeline against the in-memory engine.

use lattice::session::Phase;
use lattice::{
    BufferMode, ElementType, EntityKind, GraphEngine, GraphRuntime, MemoryEngine, RuntimeError,
    SessionConfig, StepOptions,
};

fn path_graph(nodes: usize) -> GraphRuntime<MemoryEngine> {
    let runtime = GraphRuntime::new(MemoryEngine::new());
    let ids = runtime.add_nodes(nodes).unwrap();
    let pairs: Vec<(u32, u32)> = ids.windows(2).map(|w| (w[0], w[1])).collect();
    runtime.add_edges(&pairs).unwrap();
    runtime
}

fn with_scores(runtime: &GraphRuntime<MemoryEngine>, n: u32) {
    runtime
        .define_attribute(EntityKind::Node, "score", ElementType::F64, 1)
        .unwrap();
    runtime
        .with_attribute_mut::<f64, _>(EntityKind::Node, "score", |view| {
            for id in 0..n {
                view.set(id, id as f64);
            }
        })
        .unwrap();
}

#[test]
fn head_removal_shifts_alias_by_exactly_one_stride() {
    let runtime = path_graph(10);
    with_scores(&runtime, 10);

    let before = runtime.dense_descriptor(EntityKind::Node, "score").unwrap();
    assert_eq!(before.mode, BufferMode::Aliased);
    let base = runtime
        .with_engine(|e| e.attribute_raw(EntityKind::Node, "score").unwrap().offset);
    assert_eq!(before.offset, base);

    // Removing the head node advances the valid window by one; the range
    // stays gap-free, so the view still aliases, one stride further in.
    runtime.remove_nodes(&[0]).unwrap();
    let after = runtime.dense_descriptor(EntityKind::Node, "score").unwrap();
    assert_eq!(after.mode, BufferMode::Aliased);
    assert_eq!(after.offset, base + after.stride);
    assert_eq!(after.count, 9);
    assert_eq!(runtime.with_engine(|e| e.repack_calls()), 0);

    let values = runtime
        .dense_values::<f64>(EntityKind::Node, "score")
        .unwrap()
        .to_vec();
    assert_eq!(values[0], 1.0);
    assert_eq!(values[8], 9.0);
}

#[test]
fn append_into_slack_keeps_alias_offset_stable() {
    let runtime = path_graph(10);
    with_scores(&runtime, 10);
    let before = runtime.dense_descriptor(EntityKind::Node, "score").unwrap();

    // Free a tail slot, then append into the slack: capacity is
    // untouched, so the attribute buffer never moves.
    runtime.remove_nodes(&[9]).unwrap();
    runtime.add_nodes(1).unwrap();

    let after = runtime.dense_descriptor(EntityKind::Node, "score").unwrap();
    assert_ne!(after.version, before.version);
    assert_eq!(after.offset, before.offset);
    assert_eq!(after.mode, BufferMode::Aliased);
    assert_eq!(after.count, 10);
}

#[test]
fn capacity_growth_moves_the_dense_view() {
    let runtime = path_graph(10);
    with_scores(&runtime, 10);
    let before = runtime.dense_descriptor(EntityKind::Node, "score").unwrap();

    // Exceeding capacity reallocates attribute storage; a stale cached
    // offset here would be a use-after-free in disguise.
    runtime.add_nodes(64).unwrap();
    let after = runtime.dense_descriptor(EntityKind::Node, "score").unwrap();
    assert_ne!(after.version, before.version);
    assert_ne!(after.offset, before.offset);

    let values = runtime
        .dense_values::<f64>(EntityKind::Node, "score")
        .unwrap()
        .to_vec();
    assert_eq!(values.len(), 74);
    assert_eq!(values[3], 3.0);
}

#[test]
fn live_view_blocks_session_stepping() {
    let runtime = path_graph(6);
    with_scores(&runtime, 6);
    let mut session = runtime
        .create_session(SessionConfig::new("components"))
        .unwrap();

    let view = runtime
        .dense_values::<f64>(EntityKind::Node, "score")
        .unwrap();
    let err = session.step(StepOptions::default()).unwrap_err();
    assert!(matches!(err, RuntimeError::BufferAccessActive(_)));
    drop(view);
    assert!(session.step(StepOptions::default()).is_ok());
}

#[test]
fn session_pipeline_labels_components() {
    let runtime = GraphRuntime::new(MemoryEngine::new());
    runtime.add_nodes(6).unwrap();
    runtime
        .add_edges(&[(0, 1), (1, 2), (3, 4), (4, 5)])
        .unwrap();

    let mut session = runtime
        .create_session(SessionConfig::new("components"))
        .unwrap();
    while session.step(StepOptions::default()).unwrap() != Phase::Done {}
    let summary = session.finalize().unwrap();
    assert_eq!(summary.group_count, 2);

    let labels = runtime
        .dense_values::<u32>(EntityKind::Node, "community")
        .unwrap()
        .to_vec();
    assert_eq!(labels[0], labels[2]);
    assert_eq!(labels[3], labels[5]);
    assert_ne!(labels[0], labels[3]);

    // Bridging the components and re-running collapses them into one.
    runtime.add_edges(&[(2, 3)]).unwrap();
    let mut session = runtime
        .create_session(SessionConfig::new("components"))
        .unwrap();
    while session.step(StepOptions::default()).unwrap() != Phase::Done {}
    assert_eq!(session.finalize().unwrap().group_count, 1);
}

#[test]
fn mutation_between_steps_cancels_with_named_scope() {
    let runtime = path_graph(8);
    let mut session = runtime
        .create_session(SessionConfig::new("components"))
        .unwrap();
    session
        .step(StepOptions {
            budget: Some(1),
            ..StepOptions::default()
        })
        .unwrap();

    runtime.remove_edges(&[0]).unwrap();
    match session.step(StepOptions::default()).unwrap_err() {
        RuntimeError::Canceled { reason } => assert_eq!(reason, "edge topology changed"),
        other => panic!("expected cancellation, got {other:?}"),
    }
    assert_eq!(session.phase(), Phase::Canceled);
}

#[test]
fn node_removal_cascades_to_incident_edges() {
    let runtime = path_graph(4);
    assert_eq!(runtime.edge_count(), 3);
    let doomed = runtime.remove_nodes(&[1]).unwrap();
    assert_eq!(doomed.len(), 2);
    assert_eq!(runtime.edge_count(), 1);
    assert_eq!(runtime.edge_endpoints(doomed[0]), None);
}
