//! Logical device mesh that sharding strategies are expressed against.

use serde::{Deserialize, Serialize};

use crate::error::{CompileError, Result};

/// A logical arrangement of devices used for parallel computation.
///
/// The mesh is an n-dimensional grid of device ranks; the product of the
/// rank-layout dimensions equals the total device count. The mesh is
/// immutable after construction and safely shared across concurrent
/// compilations.
///
/// # Examples
/// ```
/// # use shardplan::mesh::DeviceMesh;
/// let mesh = DeviceMesh::new(vec![2, 4], 0).unwrap();
/// assert_eq!(mesh.device_count(), 8);
/// assert_eq!(mesh.rank(), 0);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMesh {
    shape: Vec<usize>,
    device_count: usize,
    rank: usize,
}

impl DeviceMesh {
    /// Constructs a mesh from its rank layout and the global rank of the
    /// calling process.
    ///
    /// # Errors
    /// Returns [`CompileError::InvalidMesh`] when the shape is empty, a mesh
    /// dimension is zero or the rank is out of range.
    pub fn new(shape: Vec<usize>, rank: usize) -> Result<Self> {
        if shape.is_empty() {
            return Err(CompileError::InvalidMesh(
                "mesh shape must have at least one dimension".into(),
            ));
        }
        if shape.iter().any(|&d| d == 0) {
            return Err(CompileError::InvalidMesh(format!(
                "mesh dimensions must be positive, got {shape:?}"
            )));
        }
        let device_count = shape.iter().product();
        if rank >= device_count {
            return Err(CompileError::InvalidMesh(format!(
                "rank {rank} out of range for {device_count} devices"
            )));
        }
        Ok(Self {
            shape,
            device_count,
            rank,
        })
    }

    /// Convenience constructor for a 1-D mesh over `count` devices.
    pub fn linear(count: usize, rank: usize) -> Result<Self> {
        Self::new(vec![count], rank)
    }

    /// Returns the rank layout.
    #[inline]
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Returns the total number of devices.
    #[inline]
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.device_count
    }

    /// Returns the global rank of the calling process.
    #[inline]
    #[must_use]
    pub fn rank(&self) -> usize {
        self.rank
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mesh_2x4() {
        let mesh = DeviceMesh::new(vec![2, 4], 3).unwrap();
        assert_eq!(mesh.device_count(), 8);
        assert_eq!(mesh.shape(), &[2, 4]);
        assert_eq!(mesh.rank(), 3);
    }

    #[test]
    fn test_mesh_shape_must_be_nonempty() {
        let err = DeviceMesh::new(vec![], 0).unwrap_err();
        assert!(matches!(err, CompileError::InvalidMesh(_)));
    }

    #[test]
    fn test_mesh_dimensions_must_be_positive() {
        let err = DeviceMesh::new(vec![4, 0], 0).unwrap_err();
        assert!(matches!(err, CompileError::InvalidMesh(_)));
    }

    #[test]
    fn test_mesh_rank_must_be_in_range() {
        let err = DeviceMesh::linear(8, 8).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid device mesh: rank 8 out of range for 8 devices"
        );
    }
}
