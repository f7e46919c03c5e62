//! Operator graphs annotated with sharding assignments.

use std::collections::BTreeMap;
use std::sync::Arc;

// Tensor names are supplied by the graph builder rather than by untrusted
// input, so DOS resistance of the default hasher is not needed.
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dims_mapping::{DimMap, DimsMapping, DimsMappingError};
use crate::mesh::Mesh;
use crate::rule::{AxisFlags, DistOp};

mod op_id;

pub use op_id::OpId;

/// Errors that occur when building or loading a [`Graph`].
#[derive(Error, Debug)]
pub enum GraphError {
    /// A tensor with the same name was already added.
    #[error("tensor \"{name}\" is already defined")]
    DuplicateTensor { name: String },

    /// An operator or lookup referenced a tensor which does not exist.
    #[error("unknown tensor \"{name}\"")]
    UnknownTensor { name: String },

    /// A dims mapping is not valid for the graph's mesh.
    #[error("invalid dims mapping for \"{tensor}\": {error}")]
    InvalidDimsMapping {
        tensor: String,
        #[source]
        error: DimsMappingError,
    },

    /// An operator's dist attr does not have one mapping per operand.
    #[error("dist attr of operator \"{op}\" has {actual} mapping(s) for {expected} operand(s)")]
    DistAttrArity {
        op: String,
        expected: usize,
        actual: usize,
    },

    /// An operator ID does not refer to an operator in this graph.
    #[error("operator ID {id} is invalid")]
    UnknownOperator { id: OpId },

    /// An operand index is out of range for an operator.
    #[error("operator \"{op}\" has no operand at index {index}")]
    InvalidOperand { op: String, index: usize },

    /// A serialized graph could not be parsed.
    #[error("failed to parse graph: {0}")]
    Json(#[from] serde_json::Error),
}

/// A tensor in the graph: an operator input, output, or both.
#[derive(Clone, Debug, PartialEq)]
pub struct TensorDesc {
    name: String,
    shape: Vec<usize>,
    dims_mapping: DimsMapping,

    /// Axes which a rule has forced to stay replicated during propagation.
    forced: AxisFlags,
}

impl TensorDesc {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Return the current sharding assignment of the tensor.
    pub fn dims_mapping(&self) -> &DimsMapping {
        &self.dims_mapping
    }

    /// Return true if propagation has pinned axis `axis` to be replicated.
    ///
    /// An axis is pinned when a rule replicates it, for example a broadcast
    /// axis or an axis whose operands disagree. Once pinned, sharded
    /// proposals from other operators for the axis are ignored. Pins are
    /// cleared by [`Graph::set_dims_mapping`] and are not serialized.
    pub fn is_forced_replicated(&self, axis: usize) -> bool {
        self.forced.get(axis).copied().unwrap_or(false)
    }

    /// Apply `mapping`, with the axes in `forced` kept replicated.
    ///
    /// Returns true if the mapping or the set of forced axes changed.
    fn store(&mut self, mut mapping: DimsMapping, forced: &[bool]) -> bool {
        let mut changed = false;
        for (axis, _) in forced.iter().enumerate().filter(|(_, f)| **f) {
            if axis >= mapping.ndim() {
                break;
            }
            if self.forced.len() <= axis {
                self.forced.resize(axis + 1, false);
            }
            changed |= !self.forced[axis];
            self.forced[axis] = true;
        }
        for axis in 0..mapping.ndim() {
            if self.is_forced_replicated(axis) {
                mapping.set(axis, DimMap::Replicated);
            }
        }
        if self.dims_mapping != mapping {
            self.dims_mapping = mapping;
            changed = true;
        }
        changed
    }
}

/// Value of an operator attribute.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Ints(Vec<i64>),
    String(String),
}

impl From<bool> for AttrValue {
    fn from(val: bool) -> Self {
        AttrValue::Bool(val)
    }
}

impl From<i64> for AttrValue {
    fn from(val: i64) -> Self {
        AttrValue::Int(val)
    }
}

impl From<f64> for AttrValue {
    fn from(val: f64) -> Self {
        AttrValue::Float(val)
    }
}

impl From<Vec<i64>> for AttrValue {
    fn from(val: Vec<i64>) -> Self {
        AttrValue::Ints(val)
    }
}

impl From<&str> for AttrValue {
    fn from(val: &str) -> Self {
        AttrValue::String(val.to_string())
    }
}

/// Sharding assignment of an operator's operands.
///
/// Holds one [`DimsMapping`] per input and per output, by position, plus the
/// name of the rule which was selected for the operator during propagation.
///
/// Operators usually see the same mapping as the tensors they use. A
/// mapping set directly on the operator acts as an annotation which
/// propagation reconciles with the tensor's own mapping.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OperatorDistAttr {
    inputs: Vec<DimsMapping>,
    outputs: Vec<DimsMapping>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rule: Option<String>,
}

impl OperatorDistAttr {
    pub fn new(inputs: Vec<DimsMapping>, outputs: Vec<DimsMapping>) -> Self {
        OperatorDistAttr {
            inputs,
            outputs,
            rule: None,
        }
    }

    pub fn inputs(&self) -> &[DimsMapping] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[DimsMapping] {
        &self.outputs
    }

    pub fn input(&self, index: usize) -> Option<&DimsMapping> {
        self.inputs.get(index)
    }

    pub fn output(&self, index: usize) -> Option<&DimsMapping> {
        self.outputs.get(index)
    }

    pub(crate) fn inputs_mut(&mut self) -> &mut [DimsMapping] {
        &mut self.inputs
    }

    pub(crate) fn outputs_mut(&mut self) -> &mut [DimsMapping] {
        &mut self.outputs
    }

    /// Name of the rule selected for this operator, if propagation has run.
    pub fn rule(&self) -> Option<&str> {
        self.rule.as_deref()
    }

    pub(crate) fn set_rule(&mut self, rule: Option<&str>) {
        self.rule = rule.map(|r| r.to_string());
    }
}

/// An operator instance in the graph.
#[derive(Clone, Debug, PartialEq)]
pub struct OperatorDesc {
    name: String,
    op_type: String,
    inputs: Vec<String>,
    outputs: Vec<String>,
    attrs: BTreeMap<String, AttrValue>,
    dist_attr: OperatorDistAttr,
}

impl OperatorDesc {
    /// Describe an operator of type `op_type` which reads tensors `inputs`
    /// and writes tensors `outputs`.
    pub fn new(name: &str, op_type: &str, inputs: &[&str], outputs: &[&str]) -> Self {
        OperatorDesc {
            name: name.to_string(),
            op_type: op_type.to_string(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            attrs: BTreeMap::new(),
            dist_attr: OperatorDistAttr::default(),
        }
    }

    /// Add or replace an attribute.
    pub fn with_attr(mut self, name: &str, value: impl Into<AttrValue>) -> Self {
        self.attrs.insert(name.to_string(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn op_type(&self) -> &str {
        &self.op_type
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn attr(&self, name: &str) -> Option<&AttrValue> {
        self.attrs.get(name)
    }

    pub fn attrs(&self) -> &BTreeMap<String, AttrValue> {
        &self.attrs
    }

    /// Return a boolean attribute, or `default` if it is missing or has a
    /// different type.
    pub fn get_bool(&self, name: &str, default: bool) -> bool {
        match self.attrs.get(name) {
            Some(AttrValue::Bool(val)) => *val,
            Some(AttrValue::Int(val)) => *val != 0,
            _ => default,
        }
    }

    /// Return an integer list attribute. A scalar integer is treated as a
    /// single-element list.
    pub fn get_ints(&self, name: &str) -> Option<Vec<i64>> {
        match self.attrs.get(name) {
            Some(AttrValue::Ints(vals)) => Some(vals.clone()),
            Some(AttrValue::Int(val)) => Some(vec![*val]),
            _ => None,
        }
    }

    pub fn dist_attr(&self) -> &OperatorDistAttr {
        &self.dist_attr
    }

    /// Iterate over the names of all operands, inputs first.
    pub fn tensor_names(&self) -> impl Iterator<Item = &str> {
        self.inputs
            .iter()
            .chain(self.outputs.iter())
            .map(|s| s.as_str())
    }
}

/// An operator graph whose tensors are distributed over a device [`Mesh`].
///
/// Tensors and operators are kept in declaration order. The mesh is shared
/// and read-only; the dims mappings of tensors and operators are updated in
/// place by propagation.
#[derive(Clone, Debug)]
pub struct Graph {
    mesh: Arc<Mesh>,
    tensors: Vec<TensorDesc>,
    tensor_ids: FxHashMap<String, usize>,
    ops: Vec<OperatorDesc>,

    /// Operands, numbered inputs first, whose operator mapping was set by
    /// the user and has not yet been merged into the tensor.
    annotations: FxHashSet<(OpId, usize)>,
}

impl Graph {
    /// Create an empty graph over `mesh`.
    pub fn new(mesh: Arc<Mesh>) -> Graph {
        Graph {
            mesh,
            tensors: Vec::new(),
            tensor_ids: FxHashMap::default(),
            ops: Vec::new(),
            annotations: FxHashSet::default(),
        }
    }

    pub fn mesh(&self) -> &Arc<Mesh> {
        &self.mesh
    }

    /// Add a fully replicated tensor.
    pub fn add_tensor(&mut self, name: &str, shape: &[usize]) -> Result<(), GraphError> {
        self.add_sharded_tensor(name, shape, DimsMapping::replicated(shape.len()))
    }

    /// Add a tensor with an initial sharding assignment.
    ///
    /// The mapping must be valid for the mesh. Its length is not checked
    /// against the tensor's rank here. A mismatch is reported by
    /// propagation for the operators that use the tensor.
    pub fn add_sharded_tensor(
        &mut self,
        name: &str,
        shape: &[usize],
        dims_mapping: DimsMapping,
    ) -> Result<(), GraphError> {
        if self.tensor_ids.contains_key(name) {
            return Err(GraphError::DuplicateTensor {
                name: name.to_string(),
            });
        }
        self.check_mapping(name, &dims_mapping)?;

        self.tensor_ids.insert(name.to_string(), self.tensors.len());
        self.tensors.push(TensorDesc {
            name: name.to_string(),
            shape: shape.to_vec(),
            dims_mapping,
            forced: AxisFlags::new(),
        });
        Ok(())
    }

    /// Add an operator and return its ID.
    ///
    /// All input and output tensors must already exist. If the operator
    /// has no dist attr, one is created from the current mappings of its
    /// tensors. Otherwise the dist attr is treated as an annotation, and
    /// mappings which differ from the tensors are merged into them by the
    /// next propagation run.
    pub fn add_op(&mut self, mut op: OperatorDesc) -> Result<OpId, GraphError> {
        for name in op.tensor_names() {
            if !self.tensor_ids.contains_key(name) {
                return Err(GraphError::UnknownTensor {
                    name: name.to_string(),
                });
            }
        }

        let attr = &op.dist_attr;
        let annotated = if attr.inputs.is_empty() && attr.outputs.is_empty() {
            let lookup = |name: &String| self.tensors[self.tensor_ids[name]].dims_mapping.clone();
            op.dist_attr = OperatorDistAttr {
                inputs: op.inputs.iter().map(lookup).collect(),
                outputs: op.outputs.iter().map(lookup).collect(),
                rule: attr.rule.clone(),
            };
            Vec::new()
        } else {
            self.check_dist_attr(&op, attr)?;
            self.annotated_operands(&op, attr)
        };

        let id = OpId::from_usize(self.ops.len());
        self.annotations
            .extend(annotated.into_iter().map(|operand| (id, operand)));
        self.ops.push(op);
        Ok(id)
    }

    pub fn tensor(&self, name: &str) -> Option<&TensorDesc> {
        self.tensor_ids.get(name).map(|&idx| &self.tensors[idx])
    }

    /// Iterate over tensors in declaration order.
    pub fn tensors(&self) -> impl Iterator<Item = &TensorDesc> {
        self.tensors.iter()
    }

    /// Return the current dims mapping of a tensor.
    pub fn dims_mapping(&self, name: &str) -> Option<&DimsMapping> {
        self.tensor(name).map(|t| &t.dims_mapping)
    }

    /// Replace the dims mapping of a tensor.
    ///
    /// This does not update the dist attrs of operators which use the
    /// tensor. Propagation reconciles them on its next run. Axes pinned by
    /// an earlier run are released.
    pub fn set_dims_mapping(&mut self, name: &str, mapping: DimsMapping) -> Result<(), GraphError> {
        self.check_mapping(name, &mapping)?;
        let idx = self.tensor_index(name)?;
        let tensor = &mut self.tensors[idx];
        tensor.dims_mapping = mapping;
        tensor.forced.clear();
        Ok(())
    }

    /// Annotate the mapping that operator `id` expects for input `index`.
    ///
    /// The next propagation run merges the annotation with the tensor's
    /// mapping, axis by axis, with sharded values taking precedence.
    pub fn set_op_input_dims_mapping(
        &mut self,
        id: OpId,
        index: usize,
        mapping: DimsMapping,
    ) -> Result<(), GraphError> {
        self.set_operand_mapping(id, index, mapping, true)
    }

    /// Annotate the mapping that operator `id` produces for output `index`.
    pub fn set_op_output_dims_mapping(
        &mut self,
        id: OpId,
        index: usize,
        mapping: DimsMapping,
    ) -> Result<(), GraphError> {
        self.set_operand_mapping(id, index, mapping, false)
    }

    fn set_operand_mapping(
        &mut self,
        id: OpId,
        index: usize,
        mapping: DimsMapping,
        is_input: bool,
    ) -> Result<(), GraphError> {
        let op = self
            .ops
            .get(id.as_usize())
            .ok_or(GraphError::UnknownOperator { id })?;
        let names = if is_input { &op.inputs } else { &op.outputs };
        let Some(tensor) = names.get(index) else {
            return Err(GraphError::InvalidOperand {
                op: op.name.clone(),
                index,
            });
        };
        self.check_mapping(tensor, &mapping)?;
        let operand = if is_input { index } else { op.inputs.len() + index };

        let attr = &mut self.ops[id.as_usize()].dist_attr;
        let slot = if is_input {
            attr.inputs.get_mut(index)
        } else {
            attr.outputs.get_mut(index)
        };
        let Some(slot) = slot else {
            return Err(GraphError::InvalidOperand {
                op: self.ops[id.as_usize()].name.clone(),
                index,
            });
        };
        *slot = mapping;
        self.annotations.insert((id, operand));
        Ok(())
    }

    pub fn op(&self, id: OpId) -> Option<&OperatorDesc> {
        self.ops.get(id.as_usize())
    }

    /// Find an operator by name.
    pub fn find_op(&self, name: &str) -> Option<OpId> {
        self.ops
            .iter()
            .position(|op| op.name == name)
            .map(OpId::from_usize)
    }

    /// Iterate over operators and their IDs in declaration order.
    pub fn ops(&self) -> impl DoubleEndedIterator<Item = (OpId, &OperatorDesc)> {
        self.ops
            .iter()
            .enumerate()
            .map(|(idx, op)| (OpId::from_usize(idx), op))
    }

    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    /// Return a view of operator `id` for use with a
    /// [`DistRule`](crate::DistRule).
    ///
    /// The view holds a copy of the operator's dist attr, and knows which
    /// tensor axes propagation has pinned as replicated. Use
    /// [`Graph::commit_dist_op`] to store changes made to it.
    pub fn dist_op(&self, id: OpId) -> Option<DistOp<'_>> {
        let op = self.ops.get(id.as_usize())?;
        let tensor_of = |name: &str| &self.tensors[self.tensor_ids[name]];
        let shape_of = |name: &String| tensor_of(name.as_str()).shape.as_slice();
        let forced = op.tensor_names().map(|name| tensor_of(name).forced.clone());
        Some(
            DistOp::new(
                op,
                op.inputs.iter().map(shape_of).collect(),
                op.outputs.iter().map(shape_of).collect(),
                op.dist_attr.clone(),
            )
            .with_forced_axes(forced.collect()),
        )
    }

    /// Store the dist attr of an operator view created by [`Graph::dist_op`].
    ///
    /// The attr must have one valid mapping per operand. Mappings which
    /// differ from the operands' tensors are treated as annotations, as
    /// with [`Graph::set_op_input_dims_mapping`].
    pub fn commit_dist_op(&mut self, id: OpId, attr: OperatorDistAttr) -> Result<(), GraphError> {
        let op = self
            .ops
            .get(id.as_usize())
            .ok_or(GraphError::UnknownOperator { id })?;
        self.check_dist_attr(op, &attr)?;
        let annotated = self.annotated_operands(op, &attr);
        self.annotations
            .extend(annotated.into_iter().map(|operand| (id, operand)));
        self.ops[id.as_usize()].dist_attr = attr;
        Ok(())
    }

    /// Store a dist attr produced by propagation.
    pub(crate) fn store_dist_attr(&mut self, id: OpId, attr: OperatorDistAttr) {
        if let Some(op) = self.ops.get_mut(id.as_usize()) {
            op.dist_attr = attr;
        }
    }

    /// Remove and return the pending annotations of operator `id`, as
    /// operand indices numbered inputs first.
    pub(crate) fn take_annotations(&mut self, id: OpId) -> Vec<usize> {
        let Some(op) = self.ops.get(id.as_usize()) else {
            return Vec::new();
        };
        (0..op.inputs.len() + op.outputs.len())
            .filter(|&operand| self.annotations.remove(&(id, operand)))
            .collect()
    }

    fn check_dist_attr(
        &self,
        op: &OperatorDesc,
        attr: &OperatorDistAttr,
    ) -> Result<(), GraphError> {
        if attr.inputs.len() != op.inputs.len() || attr.outputs.len() != op.outputs.len() {
            return Err(GraphError::DistAttrArity {
                op: op.name.clone(),
                expected: op.inputs.len() + op.outputs.len(),
                actual: attr.inputs.len() + attr.outputs.len(),
            });
        }
        for (name, mapping) in op.tensor_names().zip(attr.inputs.iter().chain(&attr.outputs)) {
            self.check_mapping(name, mapping)?;
        }
        Ok(())
    }

    /// Return the operands whose mapping in `attr` differs from the
    /// mapping of their tensor.
    fn annotated_operands(&self, op: &OperatorDesc, attr: &OperatorDistAttr) -> Vec<usize> {
        let mappings = attr.inputs.iter().chain(&attr.outputs);
        op.tensor_names()
            .zip(mappings)
            .enumerate()
            .filter(|(_, (name, mapping))| {
                self.tensors[self.tensor_ids[*name]].dims_mapping != **mapping
            })
            .map(|(operand, _)| operand)
            .collect()
    }

    /// Return copies of the mappings of the tensors used by operator `id`,
    /// inputs first.
    pub(crate) fn operand_mappings(&self, id: OpId) -> Vec<DimsMapping> {
        self.ops[id.as_usize()]
            .tensor_names()
            .map(|name| self.tensors[self.tensor_ids[name]].dims_mapping.clone())
            .collect()
    }

    /// Store the mappings of the tensors used by operator `id`, in the order
    /// returned by [`operand_mappings`](Graph::operand_mappings).
    ///
    /// `forced` lists, per operand, axes to pin as replicated. Axes which
    /// are already pinned stay replicated whatever `mappings` says.
    ///
    /// Returns true if any tensor's mapping or pinned axes changed.
    pub(crate) fn store_operands(
        &mut self,
        id: OpId,
        mappings: Vec<DimsMapping>,
        forced: &[AxisFlags],
    ) -> bool {
        let op = &self.ops[id.as_usize()];
        let mut changed = false;
        let names = op.inputs.iter().chain(&op.outputs);
        for (operand, (name, mapping)) in names.zip(mappings).enumerate() {
            let tensor = &mut self.tensors[self.tensor_ids[name]];
            let forced = forced.get(operand).map(|f| f.as_slice()).unwrap_or(&[]);
            changed |= tensor.store(mapping, forced);
        }
        changed
    }

    /// Parse a graph from JSON.
    ///
    /// The format is:
    ///
    /// ```text
    /// {
    ///   "mesh": { "shape": [2, 4], "process_ids": [...] },
    ///   "tensors": [{ "name": "x", "shape": [8, 16], "dims_mapping": [0, -1] }],
    ///   "ops": [{
    ///     "name": "tanh_0", "type": "tanh", "inputs": ["x"], "outputs": ["y"],
    ///     "attrs": {}, "dist_attr": { "inputs": [[0, -1]], "outputs": [[0, -1]] }
    ///   }]
    /// }
    /// ```
    ///
    /// `process_ids`, `dims_mapping`, `attrs` and `dist_attr` are optional.
    pub fn from_json(json: &str) -> Result<Graph, GraphError> {
        let def: GraphDef = serde_json::from_str(json)?;
        let mut graph = Graph::new(Arc::new(def.mesh));
        for tensor in def.tensors {
            let mapping = tensor
                .dims_mapping
                .unwrap_or_else(|| DimsMapping::replicated(tensor.shape.len()));
            graph.add_sharded_tensor(&tensor.name, &tensor.shape, mapping)?;
        }
        for op in def.ops {
            graph.add_op(OperatorDesc {
                name: op.name,
                op_type: op.op_type,
                inputs: op.inputs,
                outputs: op.outputs,
                attrs: op.attrs,
                dist_attr: op.dist_attr.unwrap_or_default(),
            })?;
        }
        Ok(graph)
    }

    /// Serialize the graph, including current mappings, to JSON.
    pub fn to_json(&self) -> Result<String, GraphError> {
        let def = GraphDef {
            mesh: self.mesh.as_ref().clone(),
            tensors: self
                .tensors
                .iter()
                .map(|t| TensorDef {
                    name: t.name.clone(),
                    shape: t.shape.clone(),
                    dims_mapping: Some(t.dims_mapping.clone()),
                })
                .collect(),
            ops: self
                .ops
                .iter()
                .map(|op| OpDef {
                    name: op.name.clone(),
                    op_type: op.op_type.clone(),
                    inputs: op.inputs.clone(),
                    outputs: op.outputs.clone(),
                    attrs: op.attrs.clone(),
                    dist_attr: Some(op.dist_attr.clone()),
                })
                .collect(),
        };
        Ok(serde_json::to_string_pretty(&def)?)
    }

    fn tensor_index(&self, name: &str) -> Result<usize, GraphError> {
        self.tensor_ids
            .get(name)
            .copied()
            .ok_or_else(|| GraphError::UnknownTensor {
                name: name.to_string(),
            })
    }

    fn check_mapping(&self, tensor: &str, mapping: &DimsMapping) -> Result<(), GraphError> {
        mapping
            .validate(self.mesh.ndim())
            .map_err(|error| GraphError::InvalidDimsMapping {
                tensor: tensor.to_string(),
                error,
            })
    }
}

#[derive(Serialize, Deserialize)]
struct GraphDef {
    mesh: Mesh,
    tensors: Vec<TensorDef>,
    ops: Vec<OpDef>,
}

#[derive(Serialize, Deserialize)]
struct TensorDef {
    name: String,
    shape: Vec<usize>,
    #[serde(default)]
    dims_mapping: Option<DimsMapping>,
}

#[derive(Serialize, Deserialize)]
struct OpDef {
    name: String,
    #[serde(rename = "type")]
    op_type: String,
    inputs: Vec<String>,
    outputs: Vec<String>,
    #[serde(default)]
    attrs: BTreeMap<String, AttrValue>,
    #[serde(default)]
    dist_attr: Option<OperatorDistAttr>,
}
