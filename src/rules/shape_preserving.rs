//! Sharding rule for operators whose operands all share one shape.

use smallvec::SmallVec;

use crate::rule::{DistOp, DistRule};

/// Rule for operators whose outputs are sharded exactly like their inputs.
///
/// This covers unary operators such as `tanh` as well as operators like
/// `where` whose inputs all have the output's shape.
#[derive(Copy, Clone, Debug, Default)]
pub struct ShapePreserving;

impl DistRule for ShapePreserving {
    fn name(&self) -> &str {
        "shape_preserving"
    }

    fn is_input_compatible(&self, _op: &DistOp) -> bool {
        true
    }

    fn is_output_compatible(&self, _op: &DistOp) -> bool {
        true
    }

    fn is_auto_compatible(&self, op: &DistOp) -> bool {
        let Some(out) = op.output_dims_mapping(0) else {
            return false;
        };
        op.dist_attr().inputs().iter().all(|input| input == out)
    }

    fn update_dims_mapping(&self, op: &mut DistOp) -> bool {
        let Some(out_ndim) = op.output_dims_mapping(0).map(|m| m.ndim()) else {
            return false;
        };
        let num_inputs = op.dist_attr().inputs().len();

        let mut changed = false;
        for axis in 0..out_ndim {
            let mut participants: SmallVec<[(usize, usize); 4]> = (0..num_inputs)
                .filter(|&i| op.input_dims_mapping(i).is_some_and(|m| m.ndim() > axis))
                .map(|i| (i, axis))
                .collect();
            participants.push((num_inputs, axis));
            changed |= op.update_operand_axes(&participants);
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use shardprop_testing::TestCases;

    use super::ShapePreserving;
    use crate::dims;
    use crate::dims_mapping::DimsMapping;
    use crate::graph::{Graph, OperatorDesc};
    use crate::mesh::Mesh;
    use crate::rule::DistRule;

    #[test]
    fn test_shape_preserving() {
        #[derive(Debug)]
        struct Case {
            op_type: &'static str,
            inputs: Vec<DimsMapping>,
            output: DimsMapping,
            expected: DimsMapping,
        }

        let cases = [
            // Sharding flows from input to output.
            Case {
                op_type: "tanh",
                inputs: [dims![0, -1]].into(),
                output: dims![-1, -1],
                expected: dims![0, -1],
            },
            // ...and from output to input.
            Case {
                op_type: "scale",
                inputs: [dims![-1, -1]].into(),
                output: dims![-1, 1],
                expected: dims![-1, 1],
            },
            // Inputs sharded on different axes are merged.
            Case {
                op_type: "where",
                inputs: [dims![0, -1], dims![-1, 1], dims![-1, -1]].into(),
                output: dims![-1, -1],
                expected: dims![0, 1],
            },
            // Conflicting proposals for an axis replicate it.
            Case {
                op_type: "where",
                inputs: [dims![0, -1], dims![1, -1], dims![-1, -1]].into(),
                output: dims![-1, -1],
                expected: dims![-1, -1],
            },
        ];

        cases.test_each(|case| {
            let mut graph = Graph::new(Arc::new(Mesh::new([2, 2]).unwrap()));
            let mut input_names = Vec::new();
            for (i, mapping) in case.inputs.iter().enumerate() {
                let name = format!("in{}", i);
                graph
                    .add_sharded_tensor(&name, &[4, 4], mapping.clone())
                    .unwrap();
                input_names.push(name);
            }
            graph
                .add_sharded_tensor("out", &[4, 4], case.output.clone())
                .unwrap();
            let input_names: Vec<&str> = input_names.iter().map(|s| s.as_str()).collect();
            let id = graph
                .add_op(OperatorDesc::new("op", case.op_type, &input_names, &["out"]))
                .unwrap();

            let mut op = graph.dist_op(id).unwrap();
            let rule = ShapePreserving;
            assert!(!rule.is_auto_compatible(&op));
            assert!(rule.update_dims_mapping(&mut op));
            assert!(rule.is_auto_compatible(&op));
            assert!(!rule.update_dims_mapping(&mut op));

            for mapping in op.dist_attr().inputs().iter().chain(op.dist_attr().outputs()) {
                assert_eq!(mapping, &case.expected);
            }
        });
    }

    #[test]
    fn test_rank_mismatch_is_incompatible() {
        let mut graph = Graph::new(Arc::new(Mesh::new([2]).unwrap()));
        graph.add_sharded_tensor("x", &[4], dims![0]).unwrap();
        graph.add_tensor("y", &[4, 4]).unwrap();
        let id = graph
            .add_op(OperatorDesc::new("op", "tanh", &["x"], &["y"]))
            .unwrap();

        let mut op = graph.dist_op(id).unwrap();
        let rule = ShapePreserving;
        assert!(rule.update_dims_mapping(&mut op));
        assert_eq!(op.output_dims_mapping(0), Some(&dims![0, -1]));

        // The input has fewer axes than the output, so the mappings can never
        // be equal.
        assert!(!rule.is_auto_compatible(&op));
        assert!(!rule.update_dims_mapping(&mut op));
    }
}
