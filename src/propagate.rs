//! Fixed-point propagation of dims mappings across an operator graph.

use std::fmt;

use rayon::prelude::*;
use thiserror::Error;

use crate::dims_mapping::{DimsMapping, update_axis};
use crate::env::{env_choice, env_flag, env_usize};
use crate::graph::{Graph, GraphError, OpId, OperatorDistAttr};
use crate::registry::RuleRegistry;

mod diagnostics;

#[cfg(test)]
mod tests;

pub use diagnostics::DiagnosticLevel;
use diagnostics::Diagnostics;

/// What to do when an operator's type has no registered rules.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum UnsupportedOpPolicy {
    /// Fail with [`PropagateError::UnsupportedOperator`].
    #[default]
    Error,
    /// Leave the operator's mappings untouched and continue.
    Skip,
}

/// Order in which operators are visited in each pass.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SweepOrder {
    /// Declaration order.
    #[default]
    Forward,
    /// Declaration order, then reverse declaration order.
    ForwardBackward,
}

/// Options which customize a propagation run.
#[derive(Clone, Debug, PartialEq)]
pub struct PropagateOptions {
    max_iterations: usize,
    unsupported_ops: UnsupportedOpPolicy,
    sweep: SweepOrder,
    diagnostics: DiagnosticLevel,
}

impl Default for PropagateOptions {
    fn default() -> Self {
        PropagateOptions {
            max_iterations: 100,
            unsupported_ops: UnsupportedOpPolicy::Error,
            sweep: SweepOrder::Forward,
            diagnostics: DiagnosticLevel::Warn,
        }
    }
}

impl PropagateOptions {
    /// Create default options, with overrides applied from environment
    /// variables.
    ///
    /// The supported variables are:
    ///
    /// - `SHARDPROP_MAX_ITERATIONS`: a positive integer
    /// - `SHARDPROP_SKIP_UNSUPPORTED`: a boolean flag (eg. "1" or "true")
    /// - `SHARDPROP_DIAGNOSTICS`: "off", "warn" or "info"
    /// - `SHARDPROP_SWEEP`: "forward" or "forward-backward"
    ///
    /// Invalid values are reported and ignored.
    pub fn from_env() -> PropagateOptions {
        let mut opts = PropagateOptions::default();
        if let Some(n) = env_usize("SHARDPROP_MAX_ITERATIONS") {
            opts.set_max_iterations(n);
        }
        if env_flag("SHARDPROP_SKIP_UNSUPPORTED", false) {
            opts.set_unsupported_ops(UnsupportedOpPolicy::Skip);
        }
        if let Some(level) = env_choice(
            "SHARDPROP_DIAGNOSTICS",
            &[
                ("off", DiagnosticLevel::Off),
                ("warn", DiagnosticLevel::Warn),
                ("info", DiagnosticLevel::Info),
            ],
        ) {
            opts.set_diagnostics(level);
        }
        if let Some(sweep) = env_choice(
            "SHARDPROP_SWEEP",
            &[
                ("forward", SweepOrder::Forward),
                ("forward-backward", SweepOrder::ForwardBackward),
            ],
        ) {
            opts.set_sweep(sweep);
        }
        opts
    }

    /// Set the maximum number of passes before giving up. Values below 1 are
    /// treated as 1.
    pub fn set_max_iterations(&mut self, n: usize) -> &mut Self {
        self.max_iterations = n.max(1);
        self
    }

    pub fn set_unsupported_ops(&mut self, policy: UnsupportedOpPolicy) -> &mut Self {
        self.unsupported_ops = policy;
        self
    }

    pub fn set_sweep(&mut self, sweep: SweepOrder) -> &mut Self {
        self.sweep = sweep;
        self
    }

    pub fn set_diagnostics(&mut self, level: DiagnosticLevel) -> &mut Self {
        self.diagnostics = level;
        self
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    pub fn unsupported_ops(&self) -> UnsupportedOpPolicy {
        self.unsupported_ops
    }

    pub fn sweep(&self) -> SweepOrder {
        self.sweep
    }

    pub fn diagnostics(&self) -> DiagnosticLevel {
        self.diagnostics
    }
}

/// An operator whose mappings could not be made consistent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IncompatibleOp {
    pub op: String,
    pub op_type: String,

    /// Tensors whose mappings are at fault.
    pub tensors: Vec<String>,
}

impl fmt::Display for IncompatibleOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}): [{}]",
            self.op,
            self.op_type,
            self.tensors.join(", ")
        )
    }
}

fn join_display<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|item| item.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors that occur during propagation.
#[derive(Error, Debug)]
pub enum PropagateError {
    /// An operator's type has no registered rules.
    #[error("operator \"{op}\" has type \"{op_type}\", which has no sharding rules")]
    UnsupportedOperator { op: String, op_type: String },

    /// The iteration cap was reached before the graph became stable.
    #[error(
        "propagation did not converge after {iterations} passes; unresolved operators: {}",
        .ops.join(", ")
    )]
    DidNotConverge { iterations: usize, ops: Vec<String> },

    /// The graph is stable, but some operators are still inconsistent.
    #[error("operators have incompatible dims mappings: {}", join_display(.ops))]
    Incompatible { ops: Vec<IncompatibleOp> },

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Statistics from a successful propagation run.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PropagateStats {
    /// Number of passes over the graph, including the final stable pass.
    pub passes: usize,

    /// Number of operator visits which changed a mapping.
    pub updates: usize,
}

/// Whether a graph's mappings are at a fixed point.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PropagationState {
    /// A propagation pass would change at least one mapping.
    Unresolved,
    /// Every operator with rules is consistent with its tensors.
    Resolved,
}

/// Bring an operator's copy of a tensor's mapping in line with the tensor.
///
/// Normally the tensor's mapping is copied to the operator. If the
/// operator's copy is an annotation which has not been merged yet, the two
/// are reconciled axis by axis, with sharded values taking precedence, and
/// the result is stored in both. Mappings with different ranks are left
/// unchanged. Returns true if either mapping changed.
fn sync_mapping(tensor: &mut DimsMapping, attr: &mut DimsMapping, annotated: bool) -> bool {
    if tensor.ndim() != attr.ndim() || tensor == attr {
        return false;
    }
    if !annotated {
        *attr = tensor.clone();
        return true;
    }
    let mut pair = [tensor.clone(), attr.clone()];
    for axis in 0..tensor.ndim() {
        update_axis(&mut pair, &[axis, axis]);
    }
    let [new_tensor, new_attr] = pair;
    *tensor = new_tensor;
    *attr = new_attr;
    true
}

/// Sync each operand of an operator. `tensors` holds the operand tensors'
/// mappings and `annotated` the operands with pending annotations, both
/// numbered inputs first.
fn sync_operands(
    attr: &mut OperatorDistAttr,
    tensors: &mut [DimsMapping],
    annotated: &[usize],
) -> bool {
    let num_inputs = attr.inputs().len();
    let mut changed = false;
    for (i, mapping) in attr.inputs_mut().iter_mut().enumerate() {
        if let Some(tensor) = tensors.get_mut(i) {
            changed |= sync_mapping(tensor, mapping, annotated.contains(&i));
        }
    }
    for (i, mapping) in attr.outputs_mut().iter_mut().enumerate() {
        let operand = num_inputs + i;
        if let Some(tensor) = tensors.get_mut(operand) {
            changed |= sync_mapping(tensor, mapping, annotated.contains(&operand));
        }
    }
    changed
}

/// Drives rules to a fixed point over a graph.
///
/// Each pass visits every operator. For each operator, its dist attr is
/// first synced with the current mappings of its tensors, then its rule is
/// asked to make the operator's mappings consistent, and finally the
/// results are written back to the tensors. Passes repeat until one
/// changes nothing.
///
/// Runs are deterministic: operators are visited in a fixed order and rules
/// are pure functions of the mappings they see.
pub struct Propagator<'r> {
    registry: &'r RuleRegistry,
    options: PropagateOptions,
}

impl<'r> Propagator<'r> {
    /// Create a propagator with default options.
    pub fn new(registry: &'r RuleRegistry) -> Propagator<'r> {
        Self::with_options(registry, PropagateOptions::default())
    }

    pub fn with_options(registry: &'r RuleRegistry, options: PropagateOptions) -> Propagator<'r> {
        Propagator { registry, options }
    }

    pub fn options(&self) -> &PropagateOptions {
        &self.options
    }

    /// Propagate mappings through `graph` until they reach a fixed point.
    ///
    /// On error the graph is left with the mappings reached so far.
    pub fn propagate(&self, graph: &mut Graph) -> Result<PropagateStats, PropagateError> {
        let diagnostics = Diagnostics::new(self.options.diagnostics);
        let order = self.visit_order(graph);
        let mut stats = PropagateStats::default();
        let mut last_changed: Vec<OpId> = Vec::new();

        for _ in 0..self.options.max_iterations {
            stats.passes += 1;
            let mut changed: Vec<OpId> = Vec::new();
            for &id in &order {
                if self.visit(graph, id, &diagnostics)? {
                    changed.push(id);
                }
            }
            tracing::debug!(
                pass = stats.passes,
                updates = changed.len(),
                "propagation pass"
            );

            if changed.is_empty() {
                self.check_resolved(graph, &diagnostics)?;
                tracing::debug!(
                    passes = stats.passes,
                    updates = stats.updates,
                    warned_ops = diagnostics.warned_count(),
                    "propagation converged"
                );
                return Ok(stats);
            }
            stats.updates += changed.len();
            last_changed = changed;
        }

        let mut unresolved = self.unresolved_ops(graph);
        if unresolved.is_empty() {
            unresolved = last_changed;
            unresolved.sort();
            unresolved.dedup();
        }
        Err(PropagateError::DidNotConverge {
            iterations: self.options.max_iterations,
            ops: unresolved
                .into_iter()
                .filter_map(|id| graph.op(id).map(|op| op.name().to_string()))
                .collect(),
        })
    }

    /// Propagate mappings through several independent graphs in parallel.
    ///
    /// Each graph is processed by a single thread, so the result for each
    /// graph is the same as from [`propagate`](Propagator::propagate).
    pub fn propagate_all(
        &self,
        graphs: &mut [Graph],
    ) -> Vec<Result<PropagateStats, PropagateError>> {
        graphs
            .par_iter_mut()
            .map(|graph| self.propagate(graph))
            .collect()
    }

    /// Return whether a propagation pass over `graph` would change anything.
    ///
    /// Operators without rules count as resolved only if they would be
    /// skipped.
    pub fn state(&self, graph: &Graph) -> PropagationState {
        let unsupported = graph
            .ops()
            .any(|(_, op)| !self.registry.contains(op.op_type()));
        if self.options.unsupported_ops == UnsupportedOpPolicy::Error && unsupported {
            return PropagationState::Unresolved;
        }
        if self.unresolved_ops(graph).is_empty() {
            PropagationState::Resolved
        } else {
            PropagationState::Unresolved
        }
    }

    fn visit_order(&self, graph: &Graph) -> Vec<OpId> {
        let mut order: Vec<OpId> = graph.ops().map(|(id, _)| id).collect();
        if self.options.sweep == SweepOrder::ForwardBackward {
            order.extend(graph.ops().rev().map(|(id, _)| id));
        }
        order
    }

    /// Visit one operator. Returns true if any mapping changed.
    fn visit(
        &self,
        graph: &mut Graph,
        id: OpId,
        diagnostics: &Diagnostics,
    ) -> Result<bool, PropagateError> {
        let Some(desc) = graph.op(id) else {
            return Ok(false);
        };
        let container = match self.registry.container(desc.op_type()) {
            Ok(container) => container,
            Err(_) => match self.options.unsupported_ops {
                UnsupportedOpPolicy::Error => {
                    return Err(PropagateError::UnsupportedOperator {
                        op: desc.name().to_string(),
                        op_type: desc.op_type().to_string(),
                    });
                }
                UnsupportedOpPolicy::Skip => {
                    diagnostics.warn(
                        graph,
                        id,
                        format_args!("skipped unsupported operator type \"{}\"", desc.op_type()),
                    );
                    return Ok(false);
                }
            },
        };

        // Bring the operator's copy of its mappings in line with its tensors.
        let mut attr = desc.dist_attr().clone();
        let annotated = graph.take_annotations(id);
        let mut tensors = graph.operand_mappings(id);
        let synced = sync_operands(&mut attr, &mut tensors, &annotated);
        if synced {
            graph.store_operands(id, tensors, &[]);
            graph.store_dist_attr(id, attr);
        }
        let tensors = graph.operand_mappings(id);

        let Some(mut op) = graph.dist_op(id) else {
            return Ok(synced);
        };
        let Some(rule) = container.resolve(&op) else {
            diagnostics.warn(
                graph,
                id,
                format_args!("no rule for \"{}\" accepts this operator", op.op_type()),
            );
            return Ok(synced);
        };
        op.dist_attr_mut().set_rule(Some(rule.name()));

        let updated = !rule.is_auto_compatible(&op) && rule.update_dims_mapping(&mut op);
        if updated {
            diagnostics.info(
                graph,
                id,
                format_args!("rule \"{}\" updated dims mappings", rule.name()),
            );
        }
        let (attr, forced) = op.into_parts();

        // Write the results back to tensors, skipping mappings which don't
        // fit the tensor or the mesh.
        let mesh_ndim = graph.mesh().ndim();
        let new_tensors: Vec<DimsMapping> = attr
            .inputs()
            .iter()
            .chain(attr.outputs())
            .zip(tensors)
            .map(|(mapping, tensor)| {
                if mapping.ndim() == tensor.ndim() && mapping.validate(mesh_ndim).is_ok() {
                    mapping.clone()
                } else {
                    tensor
                }
            })
            .collect();
        let stored = graph.store_operands(id, new_tensors, &forced);
        graph.store_dist_attr(id, attr);

        Ok(synced || updated || stored)
    }

    /// Return the operators with rules which are not consistent with
    /// themselves or with their tensors.
    fn unresolved_ops(&self, graph: &Graph) -> Vec<OpId> {
        graph
            .ops()
            .filter(|&(id, desc)| {
                let Ok(container) = self.registry.container(desc.op_type()) else {
                    return false;
                };
                let Some(op) = graph.dist_op(id) else {
                    return false;
                };
                let attr = op.dist_attr();
                let in_sync = attr
                    .inputs()
                    .iter()
                    .chain(attr.outputs())
                    .zip(graph.operand_mappings(id))
                    .all(|(mapping, tensor)| {
                        mapping.ndim() != tensor.ndim() || *mapping == tensor
                    });
                let consistent = container
                    .resolve(&op)
                    .is_some_and(|rule| rule.is_auto_compatible(&op));
                !(in_sync && consistent)
            })
            .map(|(id, _)| id)
            .collect()
    }

    /// Check that a stable graph is consistent.
    fn check_resolved(
        &self,
        graph: &Graph,
        diagnostics: &Diagnostics,
    ) -> Result<(), PropagateError> {
        let ops: Vec<IncompatibleOp> = self
            .unresolved_ops(graph)
            .into_iter()
            .filter_map(|id| {
                let op = graph.dist_op(id)?;
                let mut tensors: Vec<String> =
                    op.malformed_operands().map(|name| name.to_string()).collect();
                if tensors.is_empty() {
                    tensors = op.desc().tensor_names().map(|name| name.to_string()).collect();
                }
                diagnostics.warn(
                    graph,
                    id,
                    format_args!("incompatible dims mappings for [{}]", tensors.join(", ")),
                );
                Some(IncompatibleOp {
                    op: op.name().to_string(),
                    op_type: op.op_type().to_string(),
                    tensors,
                })
            })
            .collect();

        if ops.is_empty() {
            Ok(())
        } else {
            Err(PropagateError::Incompatible { ops })
        }
    }
}

/// Propagate mappings through `graph` using the built-in rules and options
/// from the environment.
///
/// See [`PropagateOptions::from_env`].
pub fn propagate(graph: &mut Graph) -> Result<PropagateStats, PropagateError> {
    let registry = RuleRegistry::with_all_rules();
    Propagator::with_options(&registry, PropagateOptions::from_env()).propagate(graph)
}
