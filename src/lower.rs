//! Lowering of operators with resolved shardings into per-device execution
//! steps.
//!
//! Once propagation has converged, each operator is lowered for the forward
//! or backward direction. Rules choose how their operators are lowered via
//! [`DistRule::lowering`]. Most use the shared [`DefaultLowering`], which
//! runs the operator on each device's local shard. Rules whose operators
//! produce partial results (eg. a matmul with a sharded contraction axis)
//! supply a specialized lowering which also emits collectives.

use serde::Serialize;
use thiserror::Error;

use crate::dims_mapping::{DimsMapping, DimsMappingError};
use crate::graph::{Graph, OpId, OperatorDesc};
use crate::mesh::Mesh;
use crate::registry::RuleRegistry;
use crate::rule::{DistOp, DistRule};

/// Direction in which an operator is executed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Forward,
    Backward,
}

/// Strategy which turns a resolved operator into execution steps.
pub trait OpLowering: Send + Sync {
    fn lower(&self, ctx: &LowerContext, plan: &mut ExecutionPlan) -> Result<(), LowerError>;
}

/// How a rule's operators are lowered in one direction.
#[derive(Copy, Clone)]
pub enum Lowering<'a> {
    /// Use [`DefaultLowering`].
    Default,

    /// Use a rule-specific strategy.
    Specialized(&'a dyn OpLowering),
}

impl<'a> Lowering<'a> {
    /// Return the strategy object this lowering delegates to.
    pub fn strategy(self) -> &'a dyn OpLowering {
        match self {
            Lowering::Default => &DefaultLowering,
            Lowering::Specialized(lowering) => lowering,
        }
    }

    pub fn is_default(&self) -> bool {
        matches!(self, Lowering::Default)
    }
}

/// Lowering which runs the operator independently on each device's shard.
///
/// This assumes the operator's operands are already consistently sharded
/// and leaves any communication to the runtime.
#[derive(Copy, Clone, Debug, Default)]
pub struct DefaultLowering;

impl OpLowering for DefaultLowering {
    fn lower(&self, ctx: &LowerContext, plan: &mut ExecutionPlan) -> Result<(), LowerError> {
        plan.push(ctx.compute_step()?);
        Ok(())
    }
}

/// Errors that occur when lowering a graph.
#[derive(Error, Clone, Debug, PartialEq)]
pub enum LowerError {
    /// The operator's dims mappings are not consistent. Run propagation
    /// first.
    #[error("operator \"{op}\" has unresolved dims mappings")]
    Unresolved { op: String },

    /// A dims mapping cannot be applied to the graph's mesh.
    #[error("operator \"{op}\" has an invalid dims mapping for tensor \"{tensor}\"")]
    InvalidDimsMapping {
        op: String,
        tensor: String,
        #[source]
        error: DimsMappingError,
    },
}

/// Return the name of the gradient of tensor `name`.
pub fn grad_name(name: &str) -> String {
    format!("{}@GRAD", name)
}

/// A tensor as seen by a single device.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LocalTensor {
    pub name: String,

    /// Shape of the local shard.
    pub shape: Vec<usize>,

    pub dims_mapping: DimsMapping,
}

/// Reduction applied by an [`Step::AllReduce`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Reduction {
    Sum,
    Mean,
    Max,
}

/// A step in an [`ExecutionPlan`].
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Step {
    /// Run an operator kernel on each device's local shards.
    Compute {
        op: String,
        op_type: String,
        direction: Direction,
        rule: Option<String>,
        inputs: Vec<LocalTensor>,
        outputs: Vec<LocalTensor>,
    },

    /// Combine a partial result across the devices along a mesh dimension.
    AllReduce {
        tensor: String,
        mesh_dim: usize,
        reduction: Reduction,
    },
}

/// Ordered list of steps produced by a [`Dispatcher`].
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ExecutionPlan {
    steps: Vec<Step>,
}

impl ExecutionPlan {
    pub fn new() -> ExecutionPlan {
        ExecutionPlan::default()
    }

    pub fn push(&mut self, step: Step) {
        self.steps.push(step);
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Iterate over the `(tensor, mesh_dim, reduction)` of each all-reduce
    /// step.
    pub fn all_reduces(&self) -> impl Iterator<Item = (&str, usize, Reduction)> {
        self.steps.iter().filter_map(|step| match step {
            Step::AllReduce {
                tensor,
                mesh_dim,
                reduction,
            } => Some((tensor.as_str(), *mesh_dim, *reduction)),
            Step::Compute { .. } => None,
        })
    }
}

/// Operator being lowered, plus the context needed to lower it.
///
/// `'g` is the lifetime of the graph the operator view borrows from, and
/// `'a` the lifetime of the view itself.
pub struct LowerContext<'a, 'g> {
    op: &'a DistOp<'g>,
    mesh: &'a Mesh,
    direction: Direction,
    rule: Option<&'a str>,
}

impl<'a, 'g> LowerContext<'a, 'g> {
    pub fn new(
        op: &'a DistOp<'g>,
        mesh: &'a Mesh,
        direction: Direction,
        rule: Option<&'a str>,
    ) -> LowerContext<'a, 'g> {
        LowerContext {
            op,
            mesh,
            direction,
            rule,
        }
    }

    pub fn op(&self) -> &'a DistOp<'g> {
        self.op
    }

    pub fn mesh(&self) -> &'a Mesh {
        self.mesh
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Return the shape of the local shard of a tensor with the given global
    /// shape and dims mapping.
    pub fn local_shape(
        &self,
        tensor: &str,
        shape: &[usize],
        mapping: &DimsMapping,
    ) -> Result<Vec<usize>, LowerError> {
        mapping
            .validate(self.mesh.ndim())
            .map_err(|error| LowerError::InvalidDimsMapping {
                op: self.op.name().to_string(),
                tensor: tensor.to_string(),
                error,
            })?;
        if mapping.ndim() != shape.len() {
            return Err(LowerError::Unresolved {
                op: self.op.name().to_string(),
            });
        }

        Ok(shape
            .iter()
            .zip(mapping.iter())
            .map(|(&size, dim_map)| {
                dim_map
                    .mesh_dim()
                    .and_then(|mesh_dim| self.mesh.shard_size(size, mesh_dim))
                    .unwrap_or(size)
            })
            .collect())
    }

    fn local_tensor(
        &self,
        name: String,
        shape: Option<&[usize]>,
        mapping: Option<&DimsMapping>,
    ) -> Result<LocalTensor, LowerError> {
        let (Some(shape), Some(mapping)) = (shape, mapping) else {
            return Err(LowerError::Unresolved {
                op: self.op.name().to_string(),
            });
        };
        Ok(LocalTensor {
            shape: self.local_shape(&name, shape, mapping)?,
            dims_mapping: mapping.clone(),
            name,
        })
    }

    /// Return the local tensors for the operator's inputs.
    ///
    /// In the backward direction these are the forward inputs followed by
    /// the gradients of the forward outputs.
    pub fn inputs(&self) -> Result<Vec<LocalTensor>, LowerError> {
        let desc = self.op.desc();
        let mut inputs = Vec::with_capacity(desc.inputs().len());
        for (i, name) in desc.inputs().iter().enumerate() {
            inputs.push(self.local_tensor(
                name.clone(),
                self.op.input_shape(i),
                self.op.input_dims_mapping(i),
            )?);
        }
        if self.direction == Direction::Backward {
            for (i, name) in desc.outputs().iter().enumerate() {
                inputs.push(self.local_tensor(
                    grad_name(name),
                    self.op.output_shape(i),
                    self.op.output_dims_mapping(i),
                )?);
            }
        }
        Ok(inputs)
    }

    /// Return the local tensors for the operator's outputs.
    ///
    /// In the backward direction these are the gradients of the forward
    /// inputs, which are sharded like the inputs themselves.
    pub fn outputs(&self) -> Result<Vec<LocalTensor>, LowerError> {
        let desc = self.op.desc();
        match self.direction {
            Direction::Forward => desc
                .outputs()
                .iter()
                .enumerate()
                .map(|(i, name)| {
                    self.local_tensor(
                        name.clone(),
                        self.op.output_shape(i),
                        self.op.output_dims_mapping(i),
                    )
                })
                .collect(),
            Direction::Backward => desc
                .inputs()
                .iter()
                .enumerate()
                .map(|(i, name)| {
                    self.local_tensor(
                        grad_name(name),
                        self.op.input_shape(i),
                        self.op.input_dims_mapping(i),
                    )
                })
                .collect(),
        }
    }

    /// Create the step which runs the operator's kernel on local shards.
    pub fn compute_step(&self) -> Result<Step, LowerError> {
        Ok(Step::Compute {
            op: self.op.name().to_string(),
            op_type: self.op.op_type().to_string(),
            direction: self.direction,
            rule: self.rule.map(|r| r.to_string()),
            inputs: self.inputs()?,
            outputs: self.outputs()?,
        })
    }
}

/// Lowers graphs with resolved shardings into [`ExecutionPlan`]s.
pub struct Dispatcher<'r> {
    registry: &'r RuleRegistry,
}

impl<'r> Dispatcher<'r> {
    pub fn new(registry: &'r RuleRegistry) -> Dispatcher<'r> {
        Dispatcher { registry }
    }

    /// Lower the forward pass of a graph. Operators are visited in
    /// declaration order.
    pub fn forward(&self, graph: &Graph) -> Result<ExecutionPlan, LowerError> {
        self.lower(graph, Direction::Forward, graph.ops())
    }

    /// Lower the backward pass of a graph. Operators are visited in reverse
    /// declaration order.
    pub fn backward(&self, graph: &Graph) -> Result<ExecutionPlan, LowerError> {
        self.lower(graph, Direction::Backward, graph.ops().rev())
    }

    fn lower<'g>(
        &self,
        graph: &'g Graph,
        direction: Direction,
        ops: impl Iterator<Item = (OpId, &'g OperatorDesc)>,
    ) -> Result<ExecutionPlan, LowerError> {
        let mut plan = ExecutionPlan::new();
        for (id, desc) in ops {
            let Some(op) = graph.dist_op(id) else {
                continue;
            };
            let rule = self.resolve_rule(&op);
            if !op.is_well_formed() || rule.is_some_and(|rule| !rule.is_auto_compatible(&op)) {
                return Err(LowerError::Unresolved {
                    op: desc.name().to_string(),
                });
            }

            let lowering = rule.map_or(Lowering::Default, |rule| rule.lowering(direction));
            let ctx = LowerContext::new(&op, graph.mesh(), direction, rule.map(|r| r.name()));
            lowering.strategy().lower(&ctx, &mut plan)?;
        }
        Ok(plan)
    }

    /// Find the rule for an operator, preferring the one recorded by
    /// propagation. Operator types without registered rules return `None`.
    fn resolve_rule(&self, op: &DistOp) -> Option<&'r dyn DistRule> {
        self.registry.container(op.op_type()).ok()?.resolve(op)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use smallvec::smallvec;

    use super::{Direction, Dispatcher, LocalTensor, LowerContext, LowerError, Step, grad_name};
    use crate::dims;
    use crate::dims_mapping::DimsMappingError;
    use crate::graph::{Graph, OperatorDesc, OperatorDistAttr};
    use crate::mesh::Mesh;
    use crate::registry::RuleRegistry;
    use crate::rule::DistOp;

    fn tanh_graph() -> Graph {
        let mut graph = Graph::new(Arc::new(Mesh::new([2, 4]).unwrap()));
        graph.add_sharded_tensor("x", &[8, 16], dims![0, 1]).unwrap();
        graph.add_sharded_tensor("y", &[8, 16], dims![0, 1]).unwrap();
        graph
            .add_op(OperatorDesc::new("tanh_0", "tanh", &["x"], &["y"]))
            .unwrap();
        graph
    }

    #[test]
    fn test_forward_default_lowering() {
        let registry = RuleRegistry::with_all_rules();
        let graph = tanh_graph();
        let plan = Dispatcher::new(&registry).forward(&graph).unwrap();

        assert_eq!(plan.len(), 1);
        assert_eq!(plan.all_reduces().count(), 0);
        let Step::Compute {
            op,
            direction,
            rule,
            inputs,
            outputs,
            ..
        } = &plan.steps()[0]
        else {
            panic!("expected compute step");
        };
        assert_eq!(op, "tanh_0");
        assert_eq!(*direction, Direction::Forward);
        assert_eq!(rule.as_deref(), Some("shape_preserving"));
        assert_eq!(
            inputs,
            &[LocalTensor {
                name: "x".into(),
                shape: vec![4, 4],
                dims_mapping: dims![0, 1],
            }]
        );
        assert_eq!(outputs[0].shape, [4, 4]);
    }

    #[test]
    fn test_backward_default_lowering() {
        let registry = RuleRegistry::with_all_rules();
        let mut graph = tanh_graph();
        graph.add_sharded_tensor("z", &[8, 16], dims![0, 1]).unwrap();
        graph
            .add_op(OperatorDesc::new("scale_0", "scale", &["y"], &["z"]))
            .unwrap();

        let plan = Dispatcher::new(&registry).backward(&graph).unwrap();
        let ops: Vec<_> = plan
            .steps()
            .iter()
            .filter_map(|step| match step {
                Step::Compute { op, .. } => Some(op.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(ops, ["scale_0", "tanh_0"]);

        let Step::Compute {
            inputs, outputs, ..
        } = &plan.steps()[1]
        else {
            panic!("expected compute step");
        };
        let input_names: Vec<_> = inputs.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(input_names, ["x", "y@GRAD"]);
        assert_eq!(outputs[0].name, grad_name("x"));
        assert_eq!(outputs[0].shape, [4, 4]);
    }

    #[test]
    fn test_unresolved_op() {
        let registry = RuleRegistry::with_all_rules();
        let mut graph = Graph::new(Arc::new(Mesh::new([2]).unwrap()));
        graph.add_sharded_tensor("x", &[8], dims![0]).unwrap();
        graph.add_tensor("y", &[8]).unwrap();
        graph
            .add_op(OperatorDesc::new("tanh_0", "tanh", &["x"], &["y"]))
            .unwrap();

        let err = Dispatcher::new(&registry).forward(&graph).err().unwrap();
        assert_eq!(
            err,
            LowerError::Unresolved {
                op: "tanh_0".into()
            }
        );
    }

    #[test]
    fn test_unregistered_op_uses_default_lowering() {
        let registry = RuleRegistry::new();
        let graph = tanh_graph();
        let plan = Dispatcher::new(&registry).forward(&graph).unwrap();
        let Step::Compute { rule, outputs, .. } = &plan.steps()[0] else {
            panic!("expected compute step");
        };
        assert_eq!(*rule, None);
        assert_eq!(outputs[0].dims_mapping, dims![0, 1]);
    }

    #[test]
    fn test_local_shape() {
        let mesh = Mesh::new([2, 3]).unwrap();
        let desc = OperatorDesc::new("op", "tanh", &["x"], &["y"]);
        let attr = OperatorDistAttr::new(vec![dims![1, -1]], vec![dims![2, -1]]);
        let op = DistOp::new(
            &desc,
            smallvec![&[7, 5][..]],
            smallvec![&[7, 5][..]],
            attr,
        );
        let ctx = LowerContext::new(&op, &mesh, Direction::Forward, None);

        assert_eq!(ctx.local_shape("x", &[7, 5], &dims![1, -1]), Ok(vec![3, 5]));
        assert_eq!(ctx.local_shape("x", &[7, 5], &dims![0, 1]), Ok(vec![4, 2]));

        let err = ctx.compute_step().err().unwrap();
        assert_eq!(
            err,
            LowerError::InvalidDimsMapping {
                op: "op".into(),
                tensor: "y".into(),
                error: DimsMappingError::MeshDimOutOfRange {
                    axis: 0,
                    mesh_dim: 2,
                    mesh_ndim: 2,
                },
            }
        );
    }
}
