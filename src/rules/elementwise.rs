//! Sharding rule for broadcasting elementwise operators.

use smallvec::SmallVec;

use crate::dims_mapping::DimMap;
use crate::rule::{DistOp, DistRule};
use crate::rules::{aligned_axis, is_broadcast};

/// Rule for binary elementwise operators whose inputs are broadcast against
/// each other.
///
/// Inputs are aligned with the output at their trailing axes. An input axis
/// of size 1 that is broadcast to a larger output axis holds the same data
/// on every device, so it must be replicated. All other aligned axes must be
/// sharded like the output.
#[derive(Copy, Clone, Debug, Default)]
pub struct Elementwise;

/// How an input axis relates to an output axis.
enum AxisRole {
    /// The input axis has the same size as the output axis.
    Aligned(usize),
    /// The input axis is broadcast to the output axis.
    Broadcast(usize),
    /// The input has no axis aligned with the output axis.
    Missing,
}

fn axis_role(in_shape: &[usize], out_shape: &[usize], out_axis: usize) -> AxisRole {
    match aligned_axis(in_shape.len(), out_shape.len(), out_axis) {
        Some(in_axis) if is_broadcast(in_shape[in_axis], out_shape[out_axis]) => {
            AxisRole::Broadcast(in_axis)
        }
        Some(in_axis) => AxisRole::Aligned(in_axis),
        None => AxisRole::Missing,
    }
}

impl DistRule for Elementwise {
    fn name(&self) -> &str {
        "elementwise"
    }

    fn is_input_compatible(&self, op: &DistOp) -> bool {
        let Some(out_shape) = op.output_shape(0) else {
            return false;
        };
        op.num_inputs() > 0
            && (0..op.num_inputs())
                .filter_map(|i| op.input_shape(i))
                .all(|shape| shape.len() <= out_shape.len())
    }

    fn is_output_compatible(&self, op: &DistOp) -> bool {
        op.num_outputs() == 1
    }

    fn is_auto_compatible(&self, op: &DistOp) -> bool {
        if !op.is_well_formed() || !self.is_input_compatible(op) {
            return false;
        }
        let (Some(out_shape), Some(out)) = (op.output_shape(0), op.output_dims_mapping(0)) else {
            return false;
        };

        (0..op.num_inputs()).all(|i| {
            let (Some(in_shape), Some(input)) = (op.input_shape(i), op.input_dims_mapping(i))
            else {
                return false;
            };
            (0..out_shape.len()).all(|out_axis| match axis_role(in_shape, out_shape, out_axis) {
                AxisRole::Aligned(in_axis) => input.get(in_axis) == out.get(out_axis),
                AxisRole::Broadcast(in_axis) => input.get(in_axis) == Some(DimMap::Replicated),
                AxisRole::Missing => true,
            })
        })
    }

    fn update_dims_mapping(&self, op: &mut DistOp) -> bool {
        // Axis alignment relies on each mapping matching its tensor's rank.
        if !op.is_well_formed() || !self.is_input_compatible(op) {
            return false;
        }
        let Some(out_shape) = op.output_shape(0) else {
            return false;
        };
        let num_inputs = op.num_inputs();

        let mut changed = false;
        for out_axis in 0..out_shape.len() {
            let mut participants: SmallVec<[(usize, usize); 4]> = SmallVec::new();
            let mut broadcast: SmallVec<[(usize, usize); 2]> = SmallVec::new();
            for i in 0..num_inputs {
                let Some(in_shape) = op.input_shape(i) else {
                    continue;
                };
                match axis_role(in_shape, out_shape, out_axis) {
                    AxisRole::Aligned(in_axis) => participants.push((i, in_axis)),
                    AxisRole::Broadcast(in_axis) => broadcast.push((i, in_axis)),
                    AxisRole::Missing => {}
                }
            }
            participants.push((num_inputs, out_axis));

            changed |= op.update_operand_axes(&participants);
            for (operand, axis) in broadcast {
                changed |= op.replicate_operand_axis(operand, axis);
            }
        }
        changed
    }
}
