//! shardprop propagates sharding annotations through operator graphs for
//! auto-parallel training.
//!
//! A program is described as a [`Graph`] of tensors and operators, together
//! with a logical device [`Mesh`]. Each tensor carries a [`DimsMapping`]
//! which says, for every axis of the tensor, whether the axis is replicated
//! or split along one dimension of the mesh. Users typically annotate a few
//! tensors, such as model inputs and parameters, and leave the rest
//! replicated.
//!
//! # Propagating mappings
//!
//! The basic workflow is:
//!
//! 1. Build a [`Graph`] with [`Graph::add_tensor`], [`Graph::add_sharded_tensor`]
//!    and [`Graph::add_op`], or load one with [`Graph::from_json`].
//! 2. Create a [`RuleRegistry`], usually with
//!    [`RuleRegistry::with_all_rules`], which maps operator types to
//!    sharding rules.
//! 3. Run a [`Propagator`] over the graph. It repeatedly asks each
//!    operator's rule to make the operator's mappings consistent, and
//!    spreads the results through shared tensors, until nothing changes.
//!
//! ```
//! use std::sync::Arc;
//!
//! use shardprop::{dims, Graph, Mesh, OperatorDesc, Propagator, RuleRegistry};
//!
//! let mesh = Arc::new(Mesh::new([2, 4]).unwrap());
//! let mut graph = Graph::new(mesh);
//! graph.add_sharded_tensor("x", &[16, 32], dims![0, -1]).unwrap();
//! graph.add_tensor("y", &[16, 32]).unwrap();
//! graph
//!     .add_op(OperatorDesc::new("tanh_0", "tanh", &["x"], &["y"]))
//!     .unwrap();
//!
//! let registry = RuleRegistry::with_all_rules();
//! Propagator::new(&registry).propagate(&mut graph).unwrap();
//! assert_eq!(graph.dims_mapping("y"), Some(&dims![0, -1]));
//! ```
//!
//! The [`propagate`] function is a shortcut which uses the built-in rules and
//! reads options from the environment.
//!
//! ## Custom rules
//!
//! Rules implement the [`DistRule`] trait and are registered per operator
//! type. When several rules are registered for one type, the first one
//! which accepts an operator's structure is used.
//!
//! ## Environment variables
//!
//! [`PropagateOptions::from_env`] reads these variables:
//!
//! - `SHARDPROP_MAX_ITERATIONS` - Maximum number of passes over the graph
//! - `SHARDPROP_SKIP_UNSUPPORTED` - Skip operators without rules instead of
//!   failing
//! - `SHARDPROP_DIAGNOSTICS` - One of `off`, `warn` or `info`
//! - `SHARDPROP_SWEEP` - One of `forward` or `forward-backward`
//!
//! Diagnostics are emitted as [tracing](https://docs.rs/tracing) events.
//!
//! # Lowering
//!
//! Once mappings are resolved, a [`Dispatcher`] turns the graph into an
//! [`ExecutionPlan`] for one device: local compute steps for each operator,
//! plus the collective operations needed to combine partial results. Rules
//! can supply their own lowering via [`DistRule::lowering`].

mod dims_mapping;
mod env;
mod graph;
mod lower;
mod mesh;
mod propagate;
mod registry;
mod rule;

pub mod rules;

pub use dims_mapping::{
    DimMap, DimsMapping, DimsMappingError, Resolution, resolve_dim_map, update_axis,
};
pub use graph::{
    AttrValue, Graph, GraphError, OpId, OperatorDesc, OperatorDistAttr, TensorDesc,
};
pub use lower::{
    DefaultLowering, Direction, Dispatcher, ExecutionPlan, LocalTensor, LowerContext,
    LowerError, Lowering, OpLowering, Reduction, Step, grad_name,
};
pub use mesh::{Mesh, MeshError};
pub use propagate::{
    DiagnosticLevel, IncompatibleOp, PropagateError, PropagateOptions, PropagateStats,
    PropagationState, Propagator, SweepOrder, UnsupportedOpPolicy, propagate,
};
pub use registry::{RegistryError, RuleContainer, RuleRegistry};
pub use rule::{DistOp, DistRule};
