//! Worker delegation against a live graph: snapshot, off-thread run,
//! re-validated apply.

use lattice::worker::delegate_run;
use lattice::{
    ComputationParams, ElementType, EntityKind, GraphRuntime, MemoryEngine, RuntimeError,
    WorkerHost,
};

fn two_component_graph() -> GraphRuntime<MemoryEngine> {
    let runtime = GraphRuntime::new(MemoryEngine::new());
    runtime.add_nodes(6).unwrap();
    runtime
        .add_edges(&[(0, 1), (1, 2), (2, 0), (3, 4), (4, 5), (5, 3)])
        .unwrap();
    runtime
}

#[test]
fn delegated_result_lands_on_the_live_graph() {
    let runtime = two_component_graph();
    let summary = delegate_run(
        &runtime,
        "components",
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
    assert_eq!(labels[0], labels[1]);
    assert_ne!(labels[0], labels[3]);
}

#[test]
fn weighted_delegation_round_trip() {
    let runtime = two_component_graph();
    runtime
        .define_attribute(EntityKind::Edge, "weight", ElementType::F64, 1)
        .unwrap();
    runtime
        .with_attribute_mut::<f64, _>(EntityKind::Edge, "weight", |view| {
            for id in 0..6 {
                view.set(id, 1.0);
            }
        })
        .unwrap();

    let params = ComputationParams {
        weight_attribute: Some("weight".to_string()),
        ..ComputationParams::default()
    };
    let summary = delegate_run(
        &runtime,
        "components",
        &params,
        "community",
        MemoryEngine::new,
        |_| {},
    )
    .unwrap();
    assert_eq!(summary.group_count, 2);
}

#[test]
fn removal_in_flight_refuses_the_apply() {
    let runtime = two_component_graph();
    let snapshot = runtime
        .snapshot("components", &ComputationParams::default(), "community")
        .unwrap();
    let mut client = WorkerHost::spawn(MemoryEngine::new);
    let session = client.create(snapshot).unwrap();
    let result = client.run(session, |_| {}).unwrap();
    client.dispose(session).unwrap();

    runtime.remove_nodes(&[5]).unwrap();
    let err = runtime
        .apply_worker_result(&result, "community")
        .unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::SnapshotMismatch { result: 6, live: 5 }
    ));
    assert!(!runtime.has_attribute(EntityKind::Node, "community"));
}

#[test]
fn one_worker_serves_sequential_sessions() {
    let runtime = two_component_graph();
    let mut client = WorkerHost::spawn(MemoryEngine::new);

    for _ in 0..3 {
        let snapshot = runtime
            .snapshot("components", &ComputationParams::default(), "community")
            .unwrap();
        let session = client.create(snapshot).unwrap();
        let result = client.run(session, |_| {}).unwrap();
        client.dispose(session).unwrap();
        assert_eq!(result.summary.group_count, 2);
        runtime.apply_worker_result(&result, "community").unwrap();
    }
}
