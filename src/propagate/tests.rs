use std::error::Error;
use std::sync::Arc;

use shardprop_testing::TestCases;

use super::{
    DiagnosticLevel, IncompatibleOp, PropagateError, PropagateOptions, PropagateStats,
    PropagationState, Propagator, SweepOrder, UnsupportedOpPolicy,
};
use crate::dims;
use crate::dims_mapping::{DimMap, DimsMapping};
use crate::graph::{Graph, OperatorDesc};
use crate::mesh::Mesh;
use crate::registry::RuleRegistry;
use crate::rule::{DistOp, DistRule};

fn mesh_2x2() -> Arc<Mesh> {
    Arc::new(Mesh::new([2, 2]).unwrap())
}

/// Add a chain of shape-preserving operators `t0 -> t1 -> ... -> tN` with
/// the given initial tensor mappings.
fn chain_graph(op_types: &[&str], mappings: &[DimsMapping]) -> Graph {
    assert_eq!(mappings.len(), op_types.len() + 1);
    let mut graph = Graph::new(mesh_2x2());
    for (i, mapping) in mappings.iter().enumerate() {
        graph
            .add_sharded_tensor(&format!("t{}", i), &[8, 8], mapping.clone())
            .unwrap();
    }
    for (i, op_type) in op_types.iter().enumerate() {
        let input = format!("t{}", i);
        let output = format!("t{}", i + 1);
        graph
            .add_op(OperatorDesc::new(
                &format!("{}_{}", op_type, i),
                op_type,
                &[&input],
                &[&output],
            ))
            .unwrap();
    }
    graph
}

fn tensor_mappings(graph: &Graph) -> Vec<(String, DimsMapping)> {
    graph
        .tensors()
        .map(|t| (t.name().to_string(), t.dims_mapping().clone()))
        .collect()
}

/// Rule which insists on a fixed value for axis 0 of every operand.
struct Pin {
    name: &'static str,
    value: DimMap,
}

impl DistRule for Pin {
    fn name(&self) -> &str {
        self.name
    }

    fn is_input_compatible(&self, _op: &DistOp) -> bool {
        true
    }

    fn is_output_compatible(&self, _op: &DistOp) -> bool {
        true
    }

    fn is_auto_compatible(&self, op: &DistOp) -> bool {
        let attr = op.dist_attr();
        attr.inputs()
            .iter()
            .chain(attr.outputs())
            .all(|m| m.get(0) == Some(self.value))
    }

    fn update_dims_mapping(&self, op: &mut DistOp) -> bool {
        let num_operands = op.num_inputs() + op.num_outputs();
        let mut changed = false;
        for operand in 0..num_operands {
            changed |= op.set_operand_axis(operand, 0, self.value);
        }
        changed
    }
}

#[test]
fn test_tanh_end_to_end() -> Result<(), Box<dyn Error>> {
    let registry = RuleRegistry::with_all_rules();
    let mut graph = Graph::new(mesh_2x2());
    graph.add_sharded_tensor("x", &[8, 16], dims![0, -1])?;
    graph.add_tensor("y", &[8, 16])?;
    let id = graph.add_op(OperatorDesc::new("tanh_0", "tanh", &["x"], &["y"]))?;

    // Rule-level behavior: the first update changes the output, the second
    // changes nothing.
    let rule = registry
        .container("tanh")?
        .select(&graph.dist_op(id).unwrap())
        .unwrap();
    let mut op = graph.dist_op(id).unwrap();
    assert!(rule.update_dims_mapping(&mut op));
    assert!(!rule.update_dims_mapping(&mut op));
    drop(op);

    let propagator = Propagator::new(&registry);
    assert_eq!(propagator.state(&graph), PropagationState::Unresolved);

    let stats = propagator.propagate(&mut graph)?;
    assert_eq!(stats, PropagateStats { passes: 2, updates: 1 });
    assert_eq!(graph.dims_mapping("x"), Some(&dims![0, -1]));
    assert_eq!(graph.dims_mapping("y"), Some(&dims![0, -1]));

    let attr = graph.op(id).unwrap().dist_attr();
    assert_eq!(attr.rule(), Some("shape_preserving"));
    assert_eq!(attr.outputs(), &[dims![0, -1]]);
    assert_eq!(propagator.state(&graph), PropagationState::Resolved);

    Ok(())
}

#[test]
fn test_propagate_is_idempotent() -> Result<(), Box<dyn Error>> {
    let registry = RuleRegistry::with_all_rules();
    let propagator = Propagator::new(&registry);
    let mut graph = chain_graph(
        &["tanh", "scale", "relu"],
        &[dims![0, -1], dims![-1, -1], dims![-1, 1], dims![-1, -1]],
    );

    propagator.propagate(&mut graph)?;
    let first = graph.to_json()?;

    let stats = propagator.propagate(&mut graph)?;
    assert_eq!(stats, PropagateStats { passes: 1, updates: 0 });
    assert_eq!(graph.to_json()?, first);

    Ok(())
}

#[test]
fn test_sharding_spreads_through_chain() -> Result<(), Box<dyn Error>> {
    let registry = RuleRegistry::with_all_rules();
    let mut graph = chain_graph(
        &["tanh", "scale", "relu"],
        &[dims![0, -1], dims![-1, -1], dims![-1, 1], dims![-1, -1]],
    );
    Propagator::new(&registry).propagate(&mut graph)?;

    for (name, mapping) in tensor_mappings(&graph) {
        assert_eq!(mapping, dims![0, 1], "mapping of {}", name);
    }
    Ok(())
}

#[test]
fn test_sweep_orders_agree() {
    #[derive(Debug)]
    struct Case {
        mappings: Vec<DimsMapping>,
        expected: DimsMapping,
    }

    let cases = [
        Case {
            mappings: vec![dims![0, -1], dims![-1, -1], dims![-1, -1], dims![-1, -1]],
            expected: dims![0, -1],
        },
        Case {
            mappings: vec![dims![-1, -1], dims![-1, -1], dims![-1, -1], dims![-1, 1]],
            expected: dims![-1, 1],
        },
        Case {
            mappings: vec![dims![0, -1], dims![-1, -1], dims![-1, 1], dims![-1, -1]],
            expected: dims![0, 1],
        },
        // Conflicting proposals from both ends of the chain.
        Case {
            mappings: vec![dims![0, -1], dims![-1, -1], dims![-1, -1], dims![1, -1]],
            expected: dims![-1, -1],
        },
    ];

    cases.test_each(|case| {
        let registry = RuleRegistry::with_all_rules();
        let ops = ["tanh", "scale", "tanh"];

        let mut forward = chain_graph(&ops, &case.mappings);
        Propagator::new(&registry).propagate(&mut forward).unwrap();

        let mut opts = PropagateOptions::default();
        opts.set_sweep(SweepOrder::ForwardBackward);
        let mut forward_backward = chain_graph(&ops, &case.mappings);
        Propagator::with_options(&registry, opts)
            .propagate(&mut forward_backward)
            .unwrap();

        assert_eq!(tensor_mappings(&forward), tensor_mappings(&forward_backward));

        // Converged mappings agree along the chain.
        for (name, mapping) in tensor_mappings(&forward) {
            assert_eq!(mapping, case.expected, "mapping of {}", name);
        }
    });
}

#[test]
fn test_conflicting_inputs_replicate() -> Result<(), Box<dyn Error>> {
    let registry = RuleRegistry::with_all_rules();
    let mut graph = Graph::new(mesh_2x2());
    graph.add_sharded_tensor("cond", &[8, 8], dims![0, -1])?;
    graph.add_sharded_tensor("x", &[8, 8], dims![1, -1])?;
    graph.add_sharded_tensor("y", &[8, 8], dims![-1, 1])?;
    graph.add_tensor("out", &[8, 8])?;
    graph.add_op(OperatorDesc::new(
        "where_0",
        "where",
        &["cond", "x", "y"],
        &["out"],
    ))?;

    Propagator::new(&registry).propagate(&mut graph)?;

    for (name, mapping) in tensor_mappings(&graph) {
        assert_eq!(mapping, dims![-1, 1], "mapping of {}", name);
    }
    Ok(())
}

#[test]
fn test_converged_mappings_never_reuse_mesh_dims() -> Result<(), Box<dyn Error>> {
    let registry = RuleRegistry::with_all_rules();
    let mut graph = Graph::new(mesh_2x2());

    // `a` proposes mesh dim 0 for axis 0 while `b` already uses mesh dim 0
    // on axis 1.
    graph.add_sharded_tensor("a", &[8, 8], dims![0, -1])?;
    graph.add_sharded_tensor("b", &[8, 8], dims![-1, 0])?;
    graph.add_tensor("sum", &[8, 8])?;
    graph.add_tensor("out", &[8, 8])?;
    graph.add_op(OperatorDesc::new(
        "add_0",
        "elementwise_add",
        &["a", "b"],
        &["sum"],
    ))?;
    graph.add_op(OperatorDesc::new("tanh_0", "tanh", &["sum"], &["out"]))?;

    Propagator::new(&registry).propagate(&mut graph)?;

    let mesh_ndim = graph.mesh().ndim();
    for tensor in graph.tensors() {
        tensor.dims_mapping().validate(mesh_ndim)?;
    }
    // Axis 0 is replicated because `b` already uses mesh dim 0, which
    // leaves mesh dim 0 free for axis 1.
    for name in ["a", "b", "sum", "out"] {
        assert_eq!(graph.dims_mapping(name), Some(&dims![-1, 0]), "mapping of {}", name);
    }
    Ok(())
}

#[test]
fn test_chain_conflict_replicates_every_tensor() -> Result<(), Box<dyn Error>> {
    let registry = RuleRegistry::with_all_rules();
    let mut graph = chain_graph(
        &["tanh", "tanh"],
        &[dims![0, -1], dims![-1, -1], dims![1, -1]],
    );
    Propagator::new(&registry).propagate(&mut graph)?;

    // `tanh_1` sees mesh dim 0 from upstream and mesh dim 1 from its output.
    // The replicated result must win over the stale sharded mapping that
    // `tanh_0` still holds for `t1`.
    for (name, mapping) in tensor_mappings(&graph) {
        assert_eq!(mapping, dims![-1, -1], "mapping of {}", name);
        assert!(graph.tensor(&name).unwrap().is_forced_replicated(0));
    }
    Ok(())
}

#[test]
fn test_broadcast_replication_reaches_neighbours() -> Result<(), Box<dyn Error>> {
    let registry = RuleRegistry::with_all_rules();
    let mut graph = Graph::new(mesh_2x2());
    graph.add_tensor("x", &[4, 8])?;
    graph.add_tensor("b", &[1, 8])?;
    graph.add_tensor("y", &[4, 8])?;
    graph.add_sharded_tensor("w", &[1, 8], dims![0, -1])?;
    graph.add_op(OperatorDesc::new("add", "elementwise_add", &["x", "b"], &["y"]))?;
    graph.add_op(OperatorDesc::new("act", "tanh", &["b"], &["w"]))?;

    let mut opts = PropagateOptions::default();
    opts.set_max_iterations(20);
    Propagator::with_options(&registry, opts).propagate(&mut graph)?;

    // `add` broadcasts axis 0 of `b`, so it stays replicated, and so does
    // the same axis of `w`.
    for (name, mapping) in tensor_mappings(&graph) {
        assert_eq!(mapping, dims![-1, -1], "mapping of {}", name);
    }
    assert!(graph.tensor("b").unwrap().is_forced_replicated(0));
    assert!(graph.tensor("w").unwrap().is_forced_replicated(0));
    assert!(!graph.tensor("b").unwrap().is_forced_replicated(1));
    Ok(())
}

#[test]
fn test_partial_sum_replication_reaches_neighbours() -> Result<(), Box<dyn Error>> {
    let registry = RuleRegistry::with_all_rules();
    let mut graph = Graph::new(mesh_2x2());
    graph.add_sharded_tensor("x", &[8, 16], dims![-1, 0])?;
    graph.add_tensor("w", &[16, 32])?;
    graph.add_tensor("h", &[8, 32])?;
    graph.add_sharded_tensor("a", &[8, 32], dims![0, -1])?;
    graph.add_op(OperatorDesc::new("fc", "matmul_v2", &["x", "w"], &["h"]))?;
    graph.add_op(OperatorDesc::new("act", "relu", &["h"], &["a"]))?;

    let mut opts = PropagateOptions::default();
    opts.set_max_iterations(20);
    Propagator::with_options(&registry, opts).propagate(&mut graph)?;

    // The contraction axis uses mesh dim 0, so no axis of `h` can, and the
    // activation downstream is replicated to match.
    assert_eq!(graph.dims_mapping("x"), Some(&dims![-1, 0]));
    assert_eq!(graph.dims_mapping("w"), Some(&dims![0, -1]));
    assert_eq!(graph.dims_mapping("h"), Some(&dims![-1, -1]));
    assert_eq!(graph.dims_mapping("a"), Some(&dims![-1, -1]));
    Ok(())
}

#[test]
fn test_committed_dist_attr_is_merged() -> Result<(), Box<dyn Error>> {
    let registry = RuleRegistry::with_all_rules();
    let mut graph = chain_graph(
        &["tanh", "tanh"],
        &[dims![-1, -1], dims![-1, -1], dims![-1, 1]],
    );
    let id = graph.find_op("tanh_0").unwrap();
    let mut op = graph.dist_op(id).unwrap();
    op.dist_attr_mut().inputs_mut()[0] = dims![0, -1];
    let attr = op.into_dist_attr();
    graph.commit_dist_op(id, attr)?;

    Propagator::new(&registry).propagate(&mut graph)?;

    // The annotation on `tanh_0` and the tensor mapping of `t2` combine.
    for (name, mapping) in tensor_mappings(&graph) {
        assert_eq!(mapping, dims![0, 1], "mapping of {}", name);
    }
    Ok(())
}

#[test]
fn test_operator_annotation_flows_to_tensors() -> Result<(), Box<dyn Error>> {
    let registry = RuleRegistry::with_all_rules();
    let mut graph = chain_graph(
        &["tanh", "scale"],
        &[dims![-1, -1], dims![-1, -1], dims![-1, -1]],
    );
    let scale = graph.find_op("scale_1").unwrap();
    graph.set_op_output_dims_mapping(scale, 0, dims![-1, 1])?;

    Propagator::new(&registry).propagate(&mut graph)?;

    for (name, mapping) in tensor_mappings(&graph) {
        assert_eq!(mapping, dims![-1, 1], "mapping of {}", name);
    }
    Ok(())
}

#[test]
fn test_oscillating_rules_do_not_converge() {
    #[derive(Debug)]
    struct Case {
        first: DimMap,
        second: DimMap,
    }

    let cases = [
        Case {
            first: DimMap::Sharded(0),
            second: DimMap::Sharded(1),
        },
        Case {
            first: DimMap::Sharded(0),
            second: DimMap::Replicated,
        },
    ];

    cases.test_each(|case| {
        let mut registry = RuleRegistry::new();
        for (op_type, value) in [("pin_a", case.first), ("pin_b", case.second)] {
            registry.register_container(op_type);
            registry
                .register_rule(
                    op_type,
                    Arc::new(Pin {
                        name: op_type,
                        value,
                    }),
                )
                .unwrap();
        }

        let mut graph = Graph::new(mesh_2x2());
        graph.add_tensor("x", &[8]).unwrap();
        graph.add_tensor("y", &[8]).unwrap();
        graph
            .add_op(OperatorDesc::new("a", "pin_a", &["x"], &["y"]))
            .unwrap();
        graph
            .add_op(OperatorDesc::new("b", "pin_b", &["x"], &["y"]))
            .unwrap();

        let mut opts = PropagateOptions::default();
        opts.set_max_iterations(10);
        let err = Propagator::with_options(&registry, opts)
            .propagate(&mut graph)
            .err()
            .unwrap();

        // Each pass ends with `b`'s mappings on the tensors, leaving `a` out
        // of sync.
        match err {
            PropagateError::DidNotConverge { iterations, ops } => {
                assert_eq!(iterations, 10);
                assert_eq!(ops, ["a"]);
            }
            other => panic!("unexpected error {:?}", other),
        }
    });
}

#[test]
fn test_iteration_cap_reports_last_changed_ops() {
    let registry = RuleRegistry::with_all_rules();
    let mut graph = chain_graph(&["tanh"], &[dims![0, -1], dims![-1, -1]]);

    let mut opts = PropagateOptions::default();
    opts.set_max_iterations(1);
    let err = Propagator::with_options(&registry, opts)
        .propagate(&mut graph)
        .err()
        .unwrap();

    // The graph is consistent after one pass, but the pass which would
    // confirm that never ran.
    assert!(matches!(
        err,
        PropagateError::DidNotConverge { iterations: 1, ref ops } if ops == &["tanh_0"]
    ));
    assert_eq!(graph.dims_mapping("t1"), Some(&dims![0, -1]));
}

#[test]
fn test_unsupported_operator() {
    #[derive(Debug)]
    struct Case {
        policy: UnsupportedOpPolicy,
        expect_error: bool,
    }

    let cases = [
        Case {
            policy: UnsupportedOpPolicy::Error,
            expect_error: true,
        },
        Case {
            policy: UnsupportedOpPolicy::Skip,
            expect_error: false,
        },
    ];

    cases.test_each(|case| {
        let registry = RuleRegistry::with_all_rules();
        let mut graph = chain_graph(
            &["tanh", "conv2d", "tanh"],
            &[dims![0, -1], dims![-1, -1], dims![-1, -1], dims![-1, -1]],
        );

        let mut opts = PropagateOptions::default();
        opts.set_unsupported_ops(case.policy)
            .set_diagnostics(DiagnosticLevel::Off);
        let propagator = Propagator::with_options(&registry, opts);
        let result = propagator.propagate(&mut graph);

        if case.expect_error {
            let err = result.err().unwrap();
            assert!(matches!(
                err,
                PropagateError::UnsupportedOperator { ref op, ref op_type }
                    if op == "conv2d_1" && op_type == "conv2d"
            ));
            assert_eq!(propagator.state(&graph), PropagationState::Unresolved);
        } else {
            result.unwrap();
            // The skipped operator blocks propagation to the last tensors.
            assert_eq!(graph.dims_mapping("t1"), Some(&dims![0, -1]));
            assert_eq!(graph.dims_mapping("t2"), Some(&dims![-1, -1]));
            assert_eq!(propagator.state(&graph), PropagationState::Resolved);
        }
    });
}

#[test]
fn test_incompatible_operators() {
    let registry = RuleRegistry::with_all_rules();

    // Operand ranks differ, so the shape-preserving rule can never be
    // satisfied.
    let mut graph = Graph::new(mesh_2x2());
    graph.add_sharded_tensor("x", &[8], dims![0]).unwrap();
    graph.add_tensor("y", &[8, 8]).unwrap();
    graph
        .add_op(OperatorDesc::new("tanh_0", "tanh", &["x"], &["y"]))
        .unwrap();

    let ops = match Propagator::new(&registry).propagate(&mut graph) {
        Err(PropagateError::Incompatible { ops }) => ops,
        other => panic!("unexpected result {:?}", other),
    };
    assert_eq!(
        ops,
        [IncompatibleOp {
            op: "tanh_0".into(),
            op_type: "tanh".into(),
            tensors: vec!["x".into(), "y".into()],
        }]
    );

    // An annotation whose length doesn't match the tensor's rank.
    let mut graph = chain_graph(&["tanh"], &[dims![-1, -1], dims![-1, -1]]);
    let id = graph.find_op("tanh_0").unwrap();
    graph
        .set_op_input_dims_mapping(id, 0, dims![0, -1, -1])
        .unwrap();

    let ops = match Propagator::new(&registry).propagate(&mut graph) {
        Err(PropagateError::Incompatible { ops }) => ops,
        other => panic!("unexpected result {:?}", other),
    };
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].tensors, ["t0"]);
    assert_eq!(ops[0].to_string(), "tanh_0 (tanh): [t0]");
}

#[test]
fn test_propagate_all_matches_serial_runs() {
    let registry = RuleRegistry::with_all_rules();
    let propagator = Propagator::new(&registry);
    let make_graphs = || {
        vec![
            chain_graph(&["tanh"], &[dims![0, -1], dims![-1, -1]]),
            chain_graph(
                &["scale", "relu"],
                &[dims![-1, -1], dims![-1, -1], dims![1, 0]],
            ),
            chain_graph(
                &["tanh", "conv2d"],
                &[dims![0, -1], dims![-1, -1], dims![-1, -1]],
            ),
        ]
    };

    let mut parallel = make_graphs();
    let results = propagator.propagate_all(&mut parallel);
    assert_eq!(results.len(), 3);

    let mut serial = make_graphs();
    for ((graph, parallel_graph), result) in serial.iter_mut().zip(&parallel).zip(results) {
        let serial_result = propagator.propagate(graph);
        assert_eq!(serial_result.is_ok(), result.is_ok());
        if let (Ok(a), Ok(b)) = (serial_result, result) {
            assert_eq!(a, b);
        }
        assert_eq!(tensor_mappings(graph), tensor_mappings(parallel_graph));
    }
}

#[test]
fn test_options() {
    let opts = PropagateOptions::default();
    assert_eq!(opts.max_iterations(), 100);
    assert_eq!(opts.unsupported_ops(), UnsupportedOpPolicy::Error);
    assert_eq!(opts.sweep(), SweepOrder::Forward);
    assert_eq!(opts.diagnostics(), DiagnosticLevel::Warn);

    let mut opts = PropagateOptions::default();
    opts.set_max_iterations(0)
        .set_sweep(SweepOrder::ForwardBackward)
        .set_diagnostics(DiagnosticLevel::Info);
    assert_eq!(opts.max_iterations(), 1);
    assert_eq!(opts.sweep(), SweepOrder::ForwardBackward);
    assert_eq!(opts.diagnostics(), DiagnosticLevel::Info);
}
