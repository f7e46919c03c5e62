//! Sharding and lowering rules for matrix multiplication.

use smallvec::SmallVec;

use crate::dims_mapping::{DimMap, DimsMapping};
use crate::lower::{
    Direction, ExecutionPlan, LowerContext, LowerError, Lowering, OpLowering, Reduction, Step,
    grad_name,
};
use crate::rule::{DistOp, DistRule};
use crate::rules::{aligned_axis, is_broadcast};

const X: usize = 0;
const Y: usize = 1;
const OUT: usize = 2;

/// Rule for batched matrix multiplication, `Out = X @ Y`.
///
/// The axes of each operand take one of four roles. `m` is the row axis of
/// `X` and `Out`, `n` is the column axis of `Y` and `Out`, and `k` is the
/// contraction axis of `X` and `Y`. Any leading axes are batch axes, which
/// broadcast like elementwise operands. The `trans_x` and `trans_y`
/// attributes swap the last two axes of `X` and `Y` respectively.
///
/// Sharding `k` splits the contraction, so each device computes a partial
/// sum of `Out`. The lowering for this rule emits the all-reduce needed to
/// combine these.
#[derive(Copy, Clone, Debug, Default)]
pub struct MatMul;

/// Axis of an input aligned with a batch axis of the output.
enum BatchAxis {
    Aligned(usize),
    Broadcast(usize),
    Missing,
}

impl BatchAxis {
    fn is_shared(&self) -> bool {
        matches!(self, BatchAxis::Aligned(_))
    }
}

/// Positions of each axis role in the operands of a matmul.
struct MatMulAxes<'a> {
    x_shape: &'a [usize],
    y_shape: &'a [usize],
    out_shape: &'a [usize],
    x_m: usize,
    x_k: usize,
    y_k: usize,
    y_n: usize,
    out_m: usize,
    out_n: usize,
}

impl<'a> MatMulAxes<'a> {
    fn new(op: &DistOp<'a>) -> Option<MatMulAxes<'a>> {
        let x_shape = op.input_shape(X)?;
        let y_shape = op.input_shape(Y)?;
        let out_shape = op.output_shape(0)?;
        let (x_ndim, y_ndim, out_ndim) = (x_shape.len(), y_shape.len(), out_shape.len());
        if x_ndim < 2 || y_ndim < 2 || out_ndim < 2 {
            return None;
        }

        // `matmul_v2` names these `trans_x`/`trans_y`, `matmul` uses
        // `transpose_X`/`transpose_Y`.
        let desc = op.desc();
        let trans_x = desc.get_bool("trans_x", desc.get_bool("transpose_X", false));
        let trans_y = desc.get_bool("trans_y", desc.get_bool("transpose_Y", false));

        let (x_m, x_k) = if trans_x {
            (x_ndim - 1, x_ndim - 2)
        } else {
            (x_ndim - 2, x_ndim - 1)
        };
        let (y_k, y_n) = if trans_y {
            (y_ndim - 1, y_ndim - 2)
        } else {
            (y_ndim - 2, y_ndim - 1)
        };

        Some(MatMulAxes {
            x_shape,
            y_shape,
            out_shape,
            x_m,
            x_k,
            y_k,
            y_n,
            out_m: out_ndim - 2,
            out_n: out_ndim - 1,
        })
    }

    fn num_batch_axes(&self) -> usize {
        self.out_shape.len() - 2
    }

    /// Return the axis of `X` or `Y` aligned with batch axis `out_axis` of
    /// the output.
    fn batch_axis(&self, input: usize, out_axis: usize) -> BatchAxis {
        let in_shape = if input == X { self.x_shape } else { self.y_shape };
        match aligned_axis(in_shape.len() - 2, self.num_batch_axes(), out_axis) {
            Some(in_axis) if is_broadcast(in_shape[in_axis], self.out_shape[out_axis]) => {
                BatchAxis::Broadcast(in_axis)
            }
            Some(in_axis) => BatchAxis::Aligned(in_axis),
            None => BatchAxis::Missing,
        }
    }

    /// Return true if the operand shapes are valid for a matmul.
    fn is_valid(&self) -> bool {
        let batch_ok = (0..self.num_batch_axes()).all(|out_axis| {
            [X, Y].into_iter().all(|input| match self.batch_axis(input, out_axis) {
                BatchAxis::Aligned(in_axis) => {
                    let in_shape = if input == X { self.x_shape } else { self.y_shape };
                    in_shape[in_axis] == self.out_shape[out_axis]
                }
                BatchAxis::Broadcast(_) | BatchAxis::Missing => true,
            })
        });
        batch_ok
            && self.x_shape[self.x_k] == self.y_shape[self.y_k]
            && self.x_shape[self.x_m] == self.out_shape[self.out_m]
            && self.y_shape[self.y_n] == self.out_shape[self.out_n]
    }
}

/// Return the mesh dimensions sharding the output axes that are reduced
/// when computing the gradient of `input`.
///
/// The gradient of `X` sums over `n`, the gradient of `Y` sums over `m`.
/// Both also sum over batch axes along which the input was broadcast.
fn grad_reduce_dims(axes: &MatMulAxes, out: &DimsMapping, input: usize) -> SmallVec<[usize; 4]> {
    let contracted = if input == X { axes.out_n } else { axes.out_m };
    let mut reduce_axes: SmallVec<[usize; 4]> = (0..axes.num_batch_axes())
        .filter(|&out_axis| !axes.batch_axis(input, out_axis).is_shared())
        .collect();
    reduce_axes.push(contracted);

    let mut mesh_dims = SmallVec::new();
    for mesh_dim in reduce_axes
        .into_iter()
        .filter_map(|axis| out.get(axis).and_then(DimMap::mesh_dim))
    {
        if !mesh_dims.contains(&mesh_dim) {
            mesh_dims.push(mesh_dim);
        }
    }
    mesh_dims
}

impl DistRule for MatMul {
    fn name(&self) -> &str {
        "matmul"
    }

    fn is_input_compatible(&self, op: &DistOp) -> bool {
        op.num_inputs() == 2
            && op.input_shape(X).is_some_and(|s| s.len() >= 2)
            && op.input_shape(Y).is_some_and(|s| s.len() >= 2)
    }

    fn is_output_compatible(&self, op: &DistOp) -> bool {
        let (Some(x), Some(y), Some(out)) =
            (op.input_shape(X), op.input_shape(Y), op.output_shape(0))
        else {
            return false;
        };
        op.num_outputs() == 1
            && out.len() == x.len().max(y.len())
            && MatMulAxes::new(op).is_some_and(|axes| axes.is_valid())
    }

    fn is_auto_compatible(&self, op: &DistOp) -> bool {
        if !op.is_well_formed() || !self.is_input_compatible(op) || !self.is_output_compatible(op)
        {
            return false;
        }
        let Some(axes) = MatMulAxes::new(op) else {
            return false;
        };
        let (Some(x), Some(y), Some(out)) = (
            op.input_dims_mapping(X),
            op.input_dims_mapping(Y),
            op.output_dims_mapping(0),
        ) else {
            return false;
        };

        let no_reuse = [x, y, out]
            .into_iter()
            .all(|mapping| mapping.validate(usize::MAX).is_ok());
        let roles_agree = x.get(axes.x_m) == out.get(axes.out_m)
            && y.get(axes.y_n) == out.get(axes.out_n)
            && x.get(axes.x_k) == y.get(axes.y_k);
        let batch_agrees = (0..axes.num_batch_axes()).all(|out_axis| {
            [(X, x), (Y, y)]
                .into_iter()
                .all(|(input, mapping)| match axes.batch_axis(input, out_axis) {
                    BatchAxis::Aligned(in_axis) => mapping.get(in_axis) == out.get(out_axis),
                    BatchAxis::Broadcast(in_axis) => {
                        mapping.get(in_axis) == Some(DimMap::Replicated)
                    }
                    BatchAxis::Missing => true,
                })
        });

        // The output is a partial sum across the mesh dim sharding `k`, so it
        // cannot also be split along that dim.
        let out_not_partial = x
            .get(axes.x_k)
            .and_then(DimMap::mesh_dim)
            .is_none_or(|mesh_dim| out.axis_for_mesh_dim(mesh_dim).is_none());

        no_reuse && roles_agree && batch_agrees && out_not_partial
    }

    fn update_dims_mapping(&self, op: &mut DistOp) -> bool {
        if !op.is_well_formed() || !self.is_input_compatible(op) || !self.is_output_compatible(op)
        {
            return false;
        }
        let Some(axes) = MatMulAxes::new(op) else {
            return false;
        };

        let mut changed = false;
        for out_axis in 0..axes.num_batch_axes() {
            let mut participants: SmallVec<[(usize, usize); 3]> = SmallVec::new();
            for input in [X, Y] {
                match axes.batch_axis(input, out_axis) {
                    BatchAxis::Aligned(in_axis) => participants.push((input, in_axis)),
                    BatchAxis::Broadcast(in_axis) => {
                        changed |= op.replicate_operand_axis(input, in_axis);
                    }
                    BatchAxis::Missing => {}
                }
            }
            participants.push((OUT, out_axis));
            changed |= op.update_operand_axes(&participants);
        }

        changed |= op.update_operand_axes(&[(X, axes.x_m), (OUT, axes.out_m)]);
        changed |= op.update_operand_axes(&[(Y, axes.y_n), (OUT, axes.out_n)]);
        changed |= op.update_operand_axes(&[(X, axes.x_k), (Y, axes.y_k)]);

        let k_mesh_dim = op
            .input_dims_mapping(X)
            .and_then(|x| x.get(axes.x_k))
            .and_then(DimMap::mesh_dim);
        if let Some(mesh_dim) = k_mesh_dim
            && let Some(out_axis) = op
                .output_dims_mapping(0)
                .and_then(|out| out.axis_for_mesh_dim(mesh_dim))
        {
            changed |= op.replicate_operand_axis(OUT, out_axis);
        }

        changed
    }

    fn lowering(&self, _direction: Direction) -> Lowering<'_> {
        Lowering::Specialized(self)
    }
}

impl OpLowering for MatMul {
    fn lower(&self, ctx: &LowerContext, plan: &mut ExecutionPlan) -> Result<(), LowerError> {
        let op = ctx.op();
        let unresolved = || LowerError::Unresolved {
            op: op.name().to_string(),
        };
        let axes = MatMulAxes::new(op).ok_or_else(unresolved)?;
        let (Some(x), Some(out)) = (op.input_dims_mapping(X), op.output_dims_mapping(0)) else {
            return Err(unresolved());
        };
        let desc = op.desc();

        plan.push(ctx.compute_step()?);

        match ctx.direction() {
            Direction::Forward => {
                if let Some(mesh_dim) = x.get(axes.x_k).and_then(DimMap::mesh_dim) {
                    plan.push(Step::AllReduce {
                        tensor: desc.outputs()[0].clone(),
                        mesh_dim,
                        reduction: Reduction::Sum,
                    });
                }
            }
            Direction::Backward => {
                for input in [X, Y] {
                    for mesh_dim in grad_reduce_dims(&axes, out, input) {
                        plan.push(Step::AllReduce {
                            tensor: grad_name(&desc.inputs()[input]),
                            mesh_dim,
                            reduction: Reduction::Sum,
                        });
                    }
                }
            }
        }
        Ok(())
    }
}
