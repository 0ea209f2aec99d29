//! tessera-mesh — Distributed execution of tiled arrays.
//!
//! A program runs as N cooperating localities. Each one owns one
//! rectangular tile of every distributed array and evaluates the same
//! operators on its own shard. The operators exchange the data they need
//! on their own, either by fetching remote regions or through collectives.
//!
//! # Architecture
//!
//! ```text
//!  locality 0            locality 1            locality 2
//! ┌────────────┐       ┌────────────┐       ┌────────────┐
//! │ primitives │       │ primitives │       │ primitives │
//! │  dot, ...  │       │  dot, ...  │       │  dot, ...  │
//! ├────────────┤ fetch ├────────────┤ fetch ├────────────┤
//! │  registry  │ ←───→ │  registry  │ ←───→ │  registry  │
//! ├────────────┤       ├────────────┤       ├────────────┤
//! │ collective │ ────→ │ collective │ ←──── │ collective │
//! │  (member)  │contrib│   (root)   │contrib│  (member)  │
//! └────────────┘       └────────────┘       └────────────┘
//!        tarpc over iroh QUIC, or in-process channels
//! ```
//!
//! # Quick start
//!
//! ```ignore
//! use tessera_mesh::{dot, Mesh, MeshConfig, PartitionedValue};
//!
//! let mesh = Mesh::local(3, MeshConfig::default()).await?;
//! let results = mesh
//!     .run(|loc| async move {
//!         let (x, y) = load_shards(loc.id());
//!         dot(&loc, &x, &y).await
//!     })
//!     .await;
//! ```

pub mod collective;
pub mod config;
pub mod directory;
pub mod error;
pub mod locality;
pub mod mesh;
pub mod object;
pub mod primitives;
pub mod protocol;
pub mod registry;
pub mod tiling;
pub mod transport;
pub mod value;

// Re-exports
pub use collective::{
    abort_among, all_gather_among, all_reduce, all_reduce_among, barrier, barrier_among,
    reduce_or_abort, ReduceOp,
};
pub use config::MeshConfig;
pub use directory::{AnnotationDescriptor, LocalitiesDirectory, LocalityDescriptor, RETILE_SUFFIX};
pub use error::MeshError;
pub use locality::Locality;
pub use mesh::{Mesh, MeshBuilder};
pub use object::{DistributedObject, Shard};
pub use primitives::{
    argmax, argmin, conv1d, dot, index_compare, retile, retile_receive, slice, slice_gathered,
    ArgKind, Padding, RetileTarget,
};
pub use protocol::{Contribution, FetchReply, PROTOCOL_VERSION};
pub use registry::{Published, Registry};
pub use tiling::{TileDescriptor, TilingSpan, MAX_RANK};
pub use transport::{MeshTransport, QuicStream, ALPN};
pub use value::PartitionedValue;
