//! tessera — distributed execution of tiled N-dimensional arrays.
//!
//! Re-exports the array storage layer ([`tensor`]) and the distribution
//! layer ([`mesh`]) so programs depend on one crate.

pub use tessera_mesh as mesh;
pub use tessera_tensor as tensor;

pub use tessera_mesh::{
    argmax, argmin, conv1d, dot, retile, retile_receive, slice, slice_gathered,
    LocalitiesDirectory, Locality, Mesh, MeshConfig, MeshError, Padding, PartitionedValue,
    RetileTarget, TileDescriptor, TilingSpan,
};
pub use tessera_tensor::{Array, Element, ElementType, Numeric, Shape, Tensor};
