//! Logical device meshes.

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that occur when constructing a [`Mesh`].
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum MeshError {
    /// The mesh has no dimensions.
    #[error("mesh shape must have at least one dimension")]
    EmptyShape,

    /// A mesh dimension has size zero.
    #[error("mesh dimension {dim} has size 0")]
    ZeroSizedDim { dim: usize },

    /// The number of process IDs does not match the product of the mesh shape.
    #[error("mesh has {actual} process(es), but its shape implies {expected}")]
    ProcessCountMismatch { expected: usize, actual: usize },

    /// A process ID occurs more than once.
    #[error("process id {id} appears more than once in the mesh")]
    DuplicateProcessId { id: u32 },

    /// The mesh shape implies more devices than `u32` process IDs can number.
    #[error("mesh shape implies more than {} devices", u32::MAX)]
    TooManyDevices,
}

/// An N-dimensional grid of devices over which tensors are distributed.
///
/// Each device is identified by a process ID. Processes are laid out in
/// row-major order, so for a mesh of shape `[2, 4]` the process at
/// coordinates `[1, 2]` is `process_ids()[6]`.
///
/// Meshes are immutable once constructed. Graphs hold them in an `Arc` so
/// that a single mesh can be shared by many graphs, including graphs
/// processed concurrently.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "MeshDef", into = "MeshDef")]
pub struct Mesh {
    shape: Vec<usize>,
    process_ids: Vec<u32>,
}

/// Serialized form of a [`Mesh`].
#[derive(Clone, Serialize, Deserialize)]
struct MeshDef {
    shape: Vec<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    process_ids: Option<Vec<u32>>,
}

impl TryFrom<MeshDef> for Mesh {
    type Error = MeshError;

    fn try_from(def: MeshDef) -> Result<Mesh, MeshError> {
        match def.process_ids {
            Some(ids) => Mesh::with_process_ids(def.shape, ids),
            None => Mesh::new(def.shape),
        }
    }
}

impl From<Mesh> for MeshDef {
    fn from(mesh: Mesh) -> MeshDef {
        MeshDef {
            shape: mesh.shape,
            process_ids: Some(mesh.process_ids),
        }
    }
}

impl Mesh {
    /// Create a mesh with the given shape whose process IDs are
    /// `0..num_devices`.
    pub fn new(shape: impl Into<Vec<usize>>) -> Result<Mesh, MeshError> {
        let shape = shape.into();
        let count = check_shape(&shape)?;
        let count = u32::try_from(count).map_err(|_| MeshError::TooManyDevices)?;
        Ok(Mesh {
            shape,
            process_ids: (0..count).collect(),
        })
    }

    /// Create a mesh with explicit process IDs, in row-major order.
    pub fn with_process_ids(
        shape: impl Into<Vec<usize>>,
        process_ids: impl Into<Vec<u32>>,
    ) -> Result<Mesh, MeshError> {
        let shape = shape.into();
        let process_ids = process_ids.into();
        let expected = check_shape(&shape)?;
        if process_ids.len() != expected {
            return Err(MeshError::ProcessCountMismatch {
                expected,
                actual: process_ids.len(),
            });
        }

        let mut seen = FxHashSet::default();
        for &id in &process_ids {
            if !seen.insert(id) {
                return Err(MeshError::DuplicateProcessId { id });
            }
        }

        Ok(Mesh { shape, process_ids })
    }

    /// Return the number of mesh dimensions.
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Return the size of each mesh dimension.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Return the size of mesh dimension `dim`, or `None` if out of range.
    pub fn dim_size(&self, dim: usize) -> Option<usize> {
        self.shape.get(dim).copied()
    }

    /// Return the total number of devices in the mesh.
    pub fn num_devices(&self) -> usize {
        self.process_ids.len()
    }

    pub fn process_ids(&self) -> &[u32] {
        &self.process_ids
    }

    /// Return the coordinates of `process` in the mesh, or `None` if the
    /// process is not part of the mesh.
    pub fn coords(&self, process: u32) -> Option<Vec<usize>> {
        let mut flat = self.process_ids.iter().position(|&id| id == process)?;
        let mut coords = vec![0; self.ndim()];
        for (coord, &size) in coords.iter_mut().zip(&self.shape).rev() {
            *coord = flat % size;
            flat /= size;
        }
        Some(coords)
    }

    /// Return the size of the local shard of a tensor axis with size
    /// `axis_size` when split along mesh dimension `mesh_dim`.
    ///
    /// Uneven splits round up, so the last shard may be smaller than the
    /// returned size. Returns `None` if `mesh_dim` is out of range.
    pub fn shard_size(&self, axis_size: usize, mesh_dim: usize) -> Option<usize> {
        self.dim_size(mesh_dim).map(|parts| axis_size.div_ceil(parts))
    }
}

/// Validate a mesh shape and return the number of devices it implies.
fn check_shape(shape: &[usize]) -> Result<usize, MeshError> {
    if shape.is_empty() {
        return Err(MeshError::EmptyShape);
    }
    if let Some(dim) = shape.iter().position(|&size| size == 0) {
        return Err(MeshError::ZeroSizedDim { dim });
    }
    shape
        .iter()
        .try_fold(1usize, |count, &size| count.checked_mul(size))
        .filter(|&count| u32::try_from(count).is_ok())
        .ok_or(MeshError::TooManyDevices)
}

#[cfg(test)]
mod tests {
    use shardprop_testing::TestCases;

    use super::{Mesh, MeshError};

    #[test]
    fn test_new_mesh() {
        let mesh = Mesh::new([2, 4]).unwrap();
        assert_eq!(mesh.ndim(), 2);
        assert_eq!(mesh.shape(), &[2, 4]);
        assert_eq!(mesh.num_devices(), 8);
        assert_eq!(mesh.process_ids(), &[0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(mesh.dim_size(1), Some(4));
        assert_eq!(mesh.dim_size(2), None);
    }

    #[test]
    fn test_invalid_mesh() {
        #[derive(Debug)]
        struct Case {
            shape: Vec<usize>,
            process_ids: Option<Vec<u32>>,
            expected: MeshError,
        }

        let cases = [
            Case {
                shape: vec![],
                process_ids: None,
                expected: MeshError::EmptyShape,
            },
            Case {
                shape: vec![2, 0],
                process_ids: None,
                expected: MeshError::ZeroSizedDim { dim: 1 },
            },
            Case {
                shape: vec![2, 2],
                process_ids: Some(vec![0, 1, 2]),
                expected: MeshError::ProcessCountMismatch {
                    expected: 4,
                    actual: 3,
                },
            },
            Case {
                shape: vec![2],
                process_ids: Some(vec![5, 5]),
                expected: MeshError::DuplicateProcessId { id: 5 },
            },
            Case {
                shape: vec![65536, 65537],
                process_ids: None,
                expected: MeshError::TooManyDevices,
            },
            Case {
                shape: vec![usize::MAX, 2],
                process_ids: Some(vec![0]),
                expected: MeshError::TooManyDevices,
            },
        ];

        cases.test_each(|case| {
            let result = match &case.process_ids {
                Some(ids) => Mesh::with_process_ids(case.shape.clone(), ids.clone()),
                None => Mesh::new(case.shape.clone()),
            };
            assert_eq!(result, Err(case.expected.clone()));
        });
    }

    #[test]
    fn test_coords() {
        let mesh = Mesh::with_process_ids([2, 3], [10, 11, 12, 13, 14, 15]).unwrap();
        assert_eq!(mesh.coords(10), Some(vec![0, 0]));
        assert_eq!(mesh.coords(12), Some(vec![0, 2]));
        assert_eq!(mesh.coords(14), Some(vec![1, 1]));
        assert_eq!(mesh.coords(99), None);
    }

    #[test]
    fn test_shard_size() {
        let mesh = Mesh::new([2, 3]).unwrap();
        assert_eq!(mesh.shard_size(8, 0), Some(4));
        assert_eq!(mesh.shard_size(16, 1), Some(6));
        assert_eq!(mesh.shard_size(16, 2), None);
    }

    #[test]
    fn test_deserialize_validates() {
        let mesh: Mesh = serde_json::from_str(r#"{"shape": [2, 2]}"#).unwrap();
        assert_eq!(mesh.num_devices(), 4);

        let err = serde_json::from_str::<Mesh>(r#"{"shape": [2], "process_ids": [1]}"#);
        assert!(err.is_err());
    }
}
