//! Sharding and lowering rules for reductions.

use smallvec::SmallVec;

use crate::dims_mapping::DimMap;
use crate::lower::{
    Direction, ExecutionPlan, LowerContext, LowerError, Lowering, OpLowering, Reduction, Step,
};
use crate::rule::{DistOp, DistRule};
use crate::rules::resolve_axis;

/// Rule for reductions over a subset of axes (`reduce_sum`, `reduce_mean`,
/// `reduce_max`).
///
/// The reduced axes are given by the `dim` attribute. If `reduce_all` is
/// set, or `dim` is missing or empty, all axes are reduced. With `keep_dim`
/// the output has the same rank as the input, with reduced axes of size 1.
///
/// Kept axes are sharded like the corresponding input axes. When a reduced
/// axis is sharded, each device reduces only its shard, and the forward
/// lowering combines the partial results with an all-reduce.
#[derive(Copy, Clone, Debug, Default)]
pub struct Reduce;

/// Axis layout of a reduction.
struct ReduceAxes {
    /// For each input axis, whether it is reduced.
    reduced: SmallVec<[bool; 4]>,
    keep_dim: bool,
}

impl ReduceAxes {
    fn new(op: &DistOp) -> Option<ReduceAxes> {
        let ndim = op.input_shape(0)?.len();
        let desc = op.desc();
        let keep_dim = desc.get_bool("keep_dim", false);

        let dims = desc.get_ints("dim").unwrap_or_default();
        let mut reduced: SmallVec<[bool; 4]> = SmallVec::from_elem(false, ndim);
        if desc.get_bool("reduce_all", false) || dims.is_empty() {
            reduced.fill(true);
        } else {
            for dim in dims {
                reduced[resolve_axis(ndim, dim)?] = true;
            }
        }
        Some(ReduceAxes { reduced, keep_dim })
    }

    /// Return the rank of the output.
    fn out_ndim(&self) -> usize {
        if self.keep_dim {
            self.reduced.len()
        } else {
            self.reduced.iter().filter(|r| !**r).count()
        }
    }

    /// Iterate over `(input_axis, output_axis)` pairs for axes which are
    /// not reduced.
    fn kept_axes(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.reduced
            .iter()
            .enumerate()
            .filter(|(_, reduced)| !**reduced)
            .enumerate()
            .map(|(out_axis, (in_axis, _))| {
                if self.keep_dim {
                    (in_axis, in_axis)
                } else {
                    (in_axis, out_axis)
                }
            })
    }

    /// Iterate over the input axes which are reduced.
    fn reduced_axes(&self) -> impl Iterator<Item = usize> + '_ {
        self.reduced
            .iter()
            .enumerate()
            .filter(|(_, reduced)| **reduced)
            .map(|(axis, _)| axis)
    }
}

fn reduction_for(op_type: &str) -> Reduction {
    match op_type {
        "reduce_max" => Reduction::Max,
        "reduce_mean" => Reduction::Mean,
        _ => Reduction::Sum,
    }
}

impl DistRule for Reduce {
    fn name(&self) -> &str {
        "reduce"
    }

    fn is_input_compatible(&self, op: &DistOp) -> bool {
        op.num_inputs() == 1 && ReduceAxes::new(op).is_some()
    }

    fn is_output_compatible(&self, op: &DistOp) -> bool {
        let (Some(axes), Some(out_shape)) = (ReduceAxes::new(op), op.output_shape(0)) else {
            return false;
        };
        op.num_outputs() == 1 && out_shape.len() == axes.out_ndim()
    }

    fn is_auto_compatible(&self, op: &DistOp) -> bool {
        if !op.is_well_formed() || !self.is_input_compatible(op) || !self.is_output_compatible(op)
        {
            return false;
        }
        let (Some(axes), Some(input), Some(out)) = (
            ReduceAxes::new(op),
            op.input_dims_mapping(0),
            op.output_dims_mapping(0),
        ) else {
            return false;
        };

        let kept_agree = axes
            .kept_axes()
            .all(|(in_axis, out_axis)| input.get(in_axis) == out.get(out_axis));
        let reduced_replicated = !axes.keep_dim
            || axes
                .reduced_axes()
                .all(|axis| out.get(axis) == Some(DimMap::Replicated));
        let no_partial_reuse = axes
            .reduced_axes()
            .filter_map(|axis| input.get(axis).and_then(DimMap::mesh_dim))
            .all(|mesh_dim| out.axis_for_mesh_dim(mesh_dim).is_none());

        kept_agree && reduced_replicated && no_partial_reuse
    }

    fn update_dims_mapping(&self, op: &mut DistOp) -> bool {
        if !op.is_well_formed() || !self.is_input_compatible(op) || !self.is_output_compatible(op)
        {
            return false;
        }
        let Some(axes) = ReduceAxes::new(op) else {
            return false;
        };

        let mut changed = false;
        for (in_axis, out_axis) in axes.kept_axes() {
            changed |= op.update_operand_axes(&[(0, in_axis), (1, out_axis)]);
        }
        if axes.keep_dim {
            for axis in axes.reduced_axes() {
                changed |= op.replicate_operand_axis(1, axis);
            }
        }
        changed
    }

    fn lowering(&self, direction: Direction) -> Lowering<'_> {
        match direction {
            Direction::Forward => Lowering::Specialized(self),
            Direction::Backward => Lowering::Default,
        }
    }
}

impl OpLowering for Reduce {
    fn lower(&self, ctx: &LowerContext, plan: &mut ExecutionPlan) -> Result<(), LowerError> {
        let op = ctx.op();
        let unresolved = || LowerError::Unresolved {
            op: op.name().to_string(),
        };
        let axes = ReduceAxes::new(op).ok_or_else(unresolved)?;
        let input = op.input_dims_mapping(0).ok_or_else(unresolved)?;

        plan.push(ctx.compute_step()?);

        let reduction = reduction_for(op.op_type());
        let output = &op.desc().outputs()[0];
        for mesh_dim in axes
            .reduced_axes()
            .filter_map(|axis| input.get(axis).and_then(DimMap::mesh_dim))
        {
            plan.push(Step::AllReduce {
                tensor: output.clone(),
                mesh_dim,
                reduction,
            });
        }
        Ok(())
    }
}
