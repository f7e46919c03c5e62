//! Per-axis sharding assignments and the utilities used to reconcile them.

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use thiserror::Error;

/// Assignment of a single tensor axis to the mesh.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum DimMap {
    /// The axis is not split. Every device holds the full axis.
    #[default]
    Replicated,

    /// The axis is split evenly along the given mesh dimension.
    Sharded(usize),
}

impl DimMap {
    /// Return the mesh dimension this axis is sharded along, if any.
    pub fn mesh_dim(self) -> Option<usize> {
        match self {
            DimMap::Replicated => None,
            DimMap::Sharded(dim) => Some(dim),
        }
    }

    pub fn is_sharded(self) -> bool {
        matches!(self, DimMap::Sharded(_))
    }
}

/// Integer encoding used in serialized graphs: `-1` is replicated and
/// non-negative values are mesh dimensions.
impl From<DimMap> for i64 {
    fn from(val: DimMap) -> i64 {
        match val {
            DimMap::Replicated => -1,
            DimMap::Sharded(dim) => dim as i64,
        }
    }
}

impl TryFrom<i64> for DimMap {
    type Error = String;

    fn try_from(val: i64) -> Result<DimMap, String> {
        match val {
            -1 => Ok(DimMap::Replicated),
            dim if dim >= 0 => Ok(DimMap::Sharded(dim as usize)),
            other => Err(format!("invalid dims mapping entry {}", other)),
        }
    }
}

impl fmt::Display for DimMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", i64::from(*self))
    }
}

/// Errors for a [`DimsMapping`] that is invalid for a given mesh.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum DimsMappingError {
    /// An axis is sharded along a mesh dimension that does not exist.
    #[error("axis {axis} is sharded along mesh dimension {mesh_dim}, but the mesh has {mesh_ndim} dimension(s)")]
    MeshDimOutOfRange {
        axis: usize,
        mesh_dim: usize,
        mesh_ndim: usize,
    },

    /// Two axes of the same tensor are sharded along the same mesh dimension.
    #[error("mesh dimension {mesh_dim} is used by more than one axis")]
    DuplicateMeshDim { mesh_dim: usize },
}

/// Sharding assignment of every axis of a tensor.
///
/// Entry `i` describes how axis `i` of the tensor is distributed. A valid
/// mapping only refers to mesh dimensions that exist and uses each mesh
/// dimension for at most one axis. See [`DimsMapping::validate`].
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<DimMap>", into = "Vec<DimMap>")]
pub struct DimsMapping(SmallVec<[DimMap; 4]>);

impl From<Vec<DimMap>> for DimsMapping {
    fn from(dims: Vec<DimMap>) -> DimsMapping {
        DimsMapping(dims.into())
    }
}

impl From<DimsMapping> for Vec<DimMap> {
    fn from(mapping: DimsMapping) -> Vec<DimMap> {
        mapping.0.into_vec()
    }
}

impl From<&[DimMap]> for DimsMapping {
    fn from(dims: &[DimMap]) -> DimsMapping {
        DimsMapping(dims.into())
    }
}

impl FromIterator<DimMap> for DimsMapping {
    fn from_iter<I: IntoIterator<Item = DimMap>>(iter: I) -> DimsMapping {
        DimsMapping(iter.into_iter().collect())
    }
}

impl DimsMapping {
    /// Return a mapping for a tensor with `ndim` axes where every axis is
    /// replicated.
    pub fn replicated(ndim: usize) -> DimsMapping {
        DimsMapping(SmallVec::from_elem(DimMap::Replicated, ndim))
    }

    /// Return the number of axes this mapping covers.
    pub fn ndim(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, axis: usize) -> Option<DimMap> {
        self.0.get(axis).copied()
    }

    /// Set the mapping of `axis`.
    ///
    /// Panics if `axis` is out of range.
    pub fn set(&mut self, axis: usize, val: DimMap) {
        self.0[axis] = val;
    }

    pub fn as_slice(&self) -> &[DimMap] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = DimMap> + '_ {
        self.0.iter().copied()
    }

    /// Return true if no axis is sharded.
    pub fn is_replicated(&self) -> bool {
        self.0.iter().all(|d| !d.is_sharded())
    }

    /// Return the axis sharded along `mesh_dim`, if any.
    pub fn axis_for_mesh_dim(&self, mesh_dim: usize) -> Option<usize> {
        self.0.iter().position(|d| d.mesh_dim() == Some(mesh_dim))
    }

    /// Return the mesh dimensions used by this mapping, in axis order.
    pub fn mesh_dims(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().filter_map(|d| d.mesh_dim())
    }

    /// Check that this mapping is valid for a mesh with `mesh_ndim`
    /// dimensions.
    pub fn validate(&self, mesh_ndim: usize) -> Result<(), DimsMappingError> {
        let mut used: SmallVec<[usize; 4]> = SmallVec::new();
        for (axis, mesh_dim) in self
            .0
            .iter()
            .enumerate()
            .filter_map(|(axis, d)| d.mesh_dim().map(|m| (axis, m)))
        {
            if mesh_dim >= mesh_ndim {
                return Err(DimsMappingError::MeshDimOutOfRange {
                    axis,
                    mesh_dim,
                    mesh_ndim,
                });
            }
            if used.contains(&mesh_dim) {
                return Err(DimsMappingError::DuplicateMeshDim { mesh_dim });
            }
            used.push(mesh_dim);
        }
        Ok(())
    }
}

impl fmt::Debug for DimsMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for DimsMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

/// Construct a [`DimsMapping`] from integer entries, where `-1` means
/// replicated and `k >= 0` means sharded along mesh dimension `k`.
///
/// ```
/// use shardprop::{dims, DimMap};
///
/// let mapping = dims![0, -1];
/// assert_eq!(mapping.get(0), Some(DimMap::Sharded(0)));
/// assert_eq!(mapping.get(1), Some(DimMap::Replicated));
/// ```
#[macro_export]
macro_rules! dims {
    ($($x:expr),* $(,)?) => {{
        let entries: ::std::vec::Vec<i64> = ::std::vec![$($x as i64),*];
        entries
            .into_iter()
            .map(|x| match x {
                x if x < 0 => $crate::DimMap::Replicated,
                x => $crate::DimMap::Sharded(x as usize),
            })
            .collect::<$crate::DimsMapping>()
    }};
}

/// Outcome of combining the candidate mappings proposed for one axis.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// All sharded candidates agree (or there are none).
    Agreed(DimMap),

    /// At least two candidates are sharded along different mesh dimensions.
    Conflict { first: usize, second: usize },
}

impl Resolution {
    /// Return the mapping to apply. Conflicting axes are replicated.
    pub fn dim_map(self) -> DimMap {
        match self {
            Resolution::Agreed(dim) => dim,
            Resolution::Conflict { .. } => DimMap::Replicated,
        }
    }
}

/// Combine the mappings proposed for one axis by each participant.
///
/// A sharded proposal wins over replicated ones. If two proposals name
/// different mesh dimensions the result is a conflict, no matter how many
/// other participants agree with either of them.
pub fn resolve_dim_map(candidates: impl IntoIterator<Item = DimMap>) -> Resolution {
    let mut chosen: Option<usize> = None;
    for mesh_dim in candidates.into_iter().filter_map(DimMap::mesh_dim) {
        match chosen {
            None => chosen = Some(mesh_dim),
            Some(first) if first != mesh_dim => {
                return Resolution::Conflict {
                    first,
                    second: mesh_dim,
                };
            }
            Some(_) => {}
        }
    }
    Resolution::Agreed(chosen.map_or(DimMap::Replicated, DimMap::Sharded))
}

/// Reconcile axis `axes[i]` of `mappings[i]` across all participants `i`.
///
/// The participants' values are combined with [`resolve_dim_map`]. If the
/// result is sharded along a mesh dimension that some participant already
/// uses for a different axis, the axis is replicated instead, so that no
/// tensor ends up using a mesh dimension twice. The result is then written
/// to every participant.
///
/// Participants whose axis index is out of range are ignored. Returns true
/// if any participant's mapping changed.
///
/// # Panics
///
/// Panics if `mappings` and `axes` have different lengths.
pub fn update_axis(mappings: &mut [DimsMapping], axes: &[usize]) -> bool {
    assert_eq!(mappings.len(), axes.len(), "one axis per participant");

    let in_range = |pair: &(&DimsMapping, &usize)| *pair.1 < pair.0.ndim();
    let resolution = resolve_dim_map(
        mappings
            .iter()
            .zip(axes)
            .filter(in_range)
            .filter_map(|(m, &axis)| m.get(axis)),
    );

    let mut target = resolution.dim_map();
    if let DimMap::Sharded(mesh_dim) = target {
        let collides = mappings
            .iter()
            .zip(axes)
            .filter(in_range)
            .any(|(m, &axis)| {
                m.axis_for_mesh_dim(mesh_dim)
                    .is_some_and(|other| other != axis)
            });
        if collides {
            target = DimMap::Replicated;
        }
    }

    let mut changed = false;
    for (mapping, &axis) in mappings.iter_mut().zip(axes) {
        if axis < mapping.ndim() && mapping.get(axis) != Some(target) {
            mapping.set(axis, target);
            changed = true;
        }
    }
    changed
}
