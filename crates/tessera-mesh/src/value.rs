//! Array values that may be a shard of a larger, tiled array.

use serde::{Deserialize, Serialize};
use tessera_tensor::{Array, Element, Tensor};

use crate::directory::LocalitiesDirectory;
use crate::error::MeshError;

/// An array plus optional distribution metadata.
///
/// Without a directory the array is fully local (or replicated on every
/// locality) and distributed primitives fall back to their local algorithm.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PartitionedValue {
    pub array: Array,
    pub directory: Option<LocalitiesDirectory>,
}

impl PartitionedValue {
    /// A purely local value.
    pub fn local(array: impl Into<Array>) -> Self {
        Self {
            array: array.into(),
            directory: None,
        }
    }

    /// A shard of a distributed value. The directory is checked against the
    /// shard's shape.
    pub fn distributed(
        array: impl Into<Array>,
        directory: LocalitiesDirectory,
    ) -> Result<Self, MeshError> {
        let array = array.into();
        directory.validate(array.dims())?;
        Ok(Self {
            array,
            directory: Some(directory),
        })
    }

    pub fn is_distributed(&self) -> bool {
        self.directory.is_some()
    }

    /// Global dims: the local dims when fully local.
    pub fn global_dims(&self) -> Vec<usize> {
        match &self.directory {
            Some(d) => d.global_dims(self.array.dims()),
            None => self.array.dims().to_vec(),
        }
    }

    /// Borrow the shard as a typed tensor.
    pub fn tensor<T: Element>(&self) -> Option<&Tensor<T>> {
        self.array.as_tensor()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{AnnotationDescriptor, LocalityDescriptor};
    use crate::tiling::TileDescriptor;

    #[test]
    fn distributed_value_reports_global_dims() {
        let dir = LocalitiesDirectory::new(
            LocalityDescriptor::new(0, 2).unwrap(),
            AnnotationDescriptor::new("v", 0),
            vec![TileDescriptor::vector(0, 2), TileDescriptor::vector(2, 5)],
        )
        .unwrap();
        let v = PartitionedValue::distributed(Tensor::from_slice(&[1i64, 2]), dir).unwrap();
        assert!(v.is_distributed());
        assert_eq!(v.global_dims(), vec![5]);
        assert_eq!(v.tensor::<i64>().unwrap().data(), &[1, 2]);
    }

    #[test]
    fn mismatched_shard_rejected() {
        let dir = LocalitiesDirectory::new(
            LocalityDescriptor::new(0, 2).unwrap(),
            AnnotationDescriptor::new("v", 0),
            vec![TileDescriptor::vector(0, 2), TileDescriptor::vector(2, 5)],
        )
        .unwrap();
        let r = PartitionedValue::distributed(Tensor::from_slice(&[1i64, 2, 3]), dir);
        assert!(r.is_err());
    }

    #[test]
    fn local_value() {
        let v = PartitionedValue::local(Tensor::from_slice(&[1.0, 2.0]));
        assert!(!v.is_distributed());
        assert_eq!(v.global_dims(), vec![2]);
    }
}
