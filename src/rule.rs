//! The per-operator rule contract and the operator view that rules act on.

use smallvec::SmallVec;

use crate::dims_mapping::{DimMap, DimsMapping, update_axis};
use crate::graph::{OperatorDesc, OperatorDistAttr};
use crate::lower::{Direction, Lowering};

/// Sharding rule for a family of operators.
///
/// A rule decides whether an operator's current sharding assignment is
/// consistent and, if not, moves it towards a consistent one. Rules are
/// pure policy: they hold no graph state, and their answers depend only on
/// the [`DistOp`] they are given. This is what makes propagation
/// deterministic.
///
/// An inconsistent assignment is not an error. Rules answer `false` and the
/// [`Propagator`](crate::Propagator) keeps iterating until the graph reaches
/// a fixed point.
pub trait DistRule: Send + Sync {
    /// Name which identifies this rule within a
    /// [`RuleContainer`](crate::RuleContainer).
    fn name(&self) -> &str;

    /// Return true if the operator's inputs have a structure this rule can
    /// handle (number of inputs, ranks etc.).
    fn is_input_compatible(&self, op: &DistOp) -> bool;

    /// Return true if the operator's outputs have a structure this rule can
    /// handle.
    fn is_output_compatible(&self, op: &DistOp) -> bool;

    /// Return true if the operator's current dims mappings are consistent
    /// with each other.
    fn is_auto_compatible(&self, op: &DistOp) -> bool;

    /// Update the operator's dims mappings towards a consistent assignment.
    ///
    /// Returns true if any mapping changed.
    fn update_dims_mapping(&self, op: &mut DistOp) -> bool;

    /// Return how the operator is executed in the given direction once its
    /// sharding is resolved.
    fn lowering(&self, direction: Direction) -> Lowering<'_> {
        let _ = direction;
        Lowering::Default
    }
}

/// Per-axis flags of one tensor.
pub(crate) type AxisFlags = SmallVec<[bool; 4]>;

/// View of an operator which a [`DistRule`] inspects and updates.
///
/// This borrows the operator and the shapes of its tensors from the graph,
/// and owns a working copy of the operator's [`OperatorDistAttr`].
///
/// The view also tracks which operand axes are forced to stay replicated.
/// Axes are forced when a rule replicates them, or when reconciling an axis
/// replicates a value which was sharded, and once forced they reject
/// sharded proposals.
#[derive(Clone, Debug)]
pub struct DistOp<'a> {
    desc: &'a OperatorDesc,
    input_shapes: SmallVec<[&'a [usize]; 4]>,
    output_shapes: SmallVec<[&'a [usize]; 2]>,
    dist_attr: OperatorDistAttr,

    /// Forced-replicated axes per operand, inputs first. Missing entries
    /// are not forced.
    forced: SmallVec<[AxisFlags; 4]>,
}

impl<'a> DistOp<'a> {
    pub fn new(
        desc: &'a OperatorDesc,
        input_shapes: SmallVec<[&'a [usize]; 4]>,
        output_shapes: SmallVec<[&'a [usize]; 2]>,
        dist_attr: OperatorDistAttr,
    ) -> DistOp<'a> {
        DistOp {
            desc,
            input_shapes,
            output_shapes,
            dist_attr,
            forced: SmallVec::new(),
        }
    }

    /// Set the axes of each operand, inputs first, which are already forced
    /// to stay replicated.
    pub(crate) fn with_forced_axes(mut self, forced: SmallVec<[AxisFlags; 4]>) -> Self {
        self.forced = forced;
        self
    }

    pub fn desc(&self) -> &'a OperatorDesc {
        self.desc
    }

    pub fn name(&self) -> &'a str {
        self.desc.name()
    }

    pub fn op_type(&self) -> &'a str {
        self.desc.op_type()
    }

    pub fn num_inputs(&self) -> usize {
        self.input_shapes.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.output_shapes.len()
    }

    /// Return the shape of input `index`.
    pub fn input_shape(&self, index: usize) -> Option<&'a [usize]> {
        self.input_shapes.get(index).copied()
    }

    /// Return the shape of output `index`.
    pub fn output_shape(&self, index: usize) -> Option<&'a [usize]> {
        self.output_shapes.get(index).copied()
    }

    pub fn input_dims_mapping(&self, index: usize) -> Option<&DimsMapping> {
        self.dist_attr.input(index)
    }

    pub fn output_dims_mapping(&self, index: usize) -> Option<&DimsMapping> {
        self.dist_attr.output(index)
    }

    pub fn dist_attr(&self) -> &OperatorDistAttr {
        &self.dist_attr
    }

    pub fn dist_attr_mut(&mut self) -> &mut OperatorDistAttr {
        &mut self.dist_attr
    }

    pub fn into_dist_attr(self) -> OperatorDistAttr {
        self.dist_attr
    }

    /// Split the view into its dist attr and forced-replicated axes.
    pub(crate) fn into_parts(self) -> (OperatorDistAttr, SmallVec<[AxisFlags; 4]>) {
        (self.dist_attr, self.forced)
    }

    /// Return true if axis `axis` of operand `operand` must stay
    /// replicated. Operands are numbered inputs first.
    pub fn is_forced_replicated(&self, operand: usize, axis: usize) -> bool {
        self.forced
            .get(operand)
            .and_then(|flags| flags.get(axis))
            .copied()
            .unwrap_or(false)
    }

    fn force_replicated(&mut self, operand: usize, axis: usize) {
        let num_operands = self.dist_attr.inputs().len() + self.dist_attr.outputs().len();
        if operand >= num_operands {
            return;
        }
        if self.forced.len() < num_operands {
            self.forced.resize(num_operands, AxisFlags::new());
        }
        let flags = &mut self.forced[operand];
        if flags.len() <= axis {
            flags.resize(axis + 1, false);
        }
        flags[axis] = true;
    }

    /// Return true if every operand's dims mapping has one entry per axis of
    /// the operand's tensor.
    pub fn is_well_formed(&self) -> bool {
        self.malformed_operands().next().is_none()
    }

    /// Iterate over the names of operands whose dims mapping length differs
    /// from the rank of their tensor.
    pub fn malformed_operands(&self) -> impl Iterator<Item = &'a str> + '_ {
        let shapes = self.input_shapes.iter().chain(self.output_shapes.iter());
        let mappings = self
            .dist_attr
            .inputs()
            .iter()
            .chain(self.dist_attr.outputs())
            .map(Some)
            .chain(std::iter::repeat(None));
        self.desc
            .tensor_names()
            .zip(shapes.zip(mappings))
            .filter(|(_, (shape, mapping))| mapping.is_none_or(|m| m.ndim() != shape.len()))
            .map(|(name, _)| name)
    }

    /// Reconcile one axis of several operands with [`update_axis`].
    ///
    /// Each participant is `(operand, axis)`, where operands are numbered
    /// inputs first, then outputs. Returns true if any mapping changed.
    ///
    /// If any participant is forced to stay replicated, all of them are
    /// replicated. If reconciling replaces a sharded value with replicated,
    /// because of a conflict or a mesh dim used elsewhere, all participants
    /// become forced.
    pub fn update_operand_axes(&mut self, participants: &[(usize, usize)]) -> bool {
        if participants
            .iter()
            .any(|&(operand, axis)| self.is_forced_replicated(operand, axis))
        {
            let mut changed = false;
            for &(operand, axis) in participants {
                changed |= self.replicate_operand_axis(operand, axis);
            }
            return changed;
        }

        let num_inputs = self.dist_attr.inputs().len();
        let mut mappings: SmallVec<[DimsMapping; 4]> = SmallVec::new();
        let mut axes: SmallVec<[usize; 4]> = SmallVec::new();
        for &(operand, axis) in participants {
            if let Some(mapping) = self.operand_mapping(operand) {
                mappings.push(mapping.clone());
                axes.push(axis);
            }
        }

        let is_sharded = |mappings: &[DimsMapping]| {
            mappings
                .iter()
                .zip(&axes)
                .any(|(m, &axis)| m.get(axis).is_some_and(DimMap::is_sharded))
        };
        let was_sharded = is_sharded(mappings.as_slice());
        if !update_axis(&mut mappings, &axes) {
            return false;
        }
        if was_sharded && !is_sharded(mappings.as_slice()) {
            for &(operand, axis) in participants {
                self.force_replicated(operand, axis);
            }
        }

        let mut updated = mappings.into_iter();
        for &(operand, _) in participants {
            let slot = if operand < num_inputs {
                self.dist_attr.inputs_mut().get_mut(operand)
            } else {
                self.dist_attr.outputs_mut().get_mut(operand - num_inputs)
            };
            if let Some(slot) = slot
                && let Some(mapping) = updated.next()
            {
                *slot = mapping;
            }
        }
        true
    }

    /// Set axis `axis` of operand `operand` to replicated, and force it to
    /// stay replicated for the rest of propagation. Returns true if the
    /// mapping changed.
    pub fn replicate_operand_axis(&mut self, operand: usize, axis: usize) -> bool {
        if self.operand_mapping(operand).is_some_and(|m| axis < m.ndim()) {
            self.force_replicated(operand, axis);
        }
        self.set_operand_axis(operand, axis, DimMap::Replicated)
    }

    /// Set axis `axis` of operand `operand` to `value`. Returns true if the
    /// mapping changed.
    ///
    /// Unlike [`update_operand_axes`](DistOp::update_operand_axes) this does
    /// not check whether another axis of the operand already uses the same
    /// mesh dimension.
    pub fn set_operand_axis(&mut self, operand: usize, axis: usize, value: DimMap) -> bool {
        let num_inputs = self.dist_attr.inputs().len();
        let mapping = if operand < num_inputs {
            self.dist_attr.inputs_mut().get_mut(operand)
        } else {
            self.dist_attr.outputs_mut().get_mut(operand - num_inputs)
        };
        match mapping {
            Some(mapping) if mapping.get(axis).is_some_and(|d| d != value) => {
                mapping.set(axis, value);
                true
            }
            _ => false,
        }
    }

    /// Return the mapping of an operand, numbering inputs first.
    pub fn operand_mapping(&self, operand: usize) -> Option<&DimsMapping> {
        let num_inputs = self.dist_attr.inputs().len();
        if operand < num_inputs {
            self.dist_attr.input(operand)
        } else {
            self.dist_attr.output(operand - num_inputs)
        }
    }
}
