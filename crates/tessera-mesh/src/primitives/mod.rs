//! Distributed array operators.
//!
//! Each operator takes the calling [`Locality`] and already evaluated
//! [`PartitionedValue`] operands. All localities holding a shard of an
//! operand call the operator together (SPMD); operands without a directory
//! are local (or replicated) and take the plain single-process path.
//!
//! The common shape of a distributed operator:
//!
//! 1. validate ranks, shapes and axes against the global shape,
//! 2. find the global region this locality is responsible for,
//! 3. scan the peers' tiles, intersect them with that region and copy the
//!    overlaps (locally or by concurrent fetches),
//! 4. run the local kernel,
//! 5. either stamp the result with a new directory (`generation + 1`) or
//!    combine the partial results with a keyed collective.

mod argreduce;
mod dot;
pub(crate) mod gather;
mod retile;
mod slice;
mod window;

use tessera_tensor::{Array, Element, Tensor};

use crate::directory::{AnnotationDescriptor, LocalitiesDirectory};
use crate::error::MeshError;
use crate::locality::Locality;
use crate::tiling::{ranges, TilingSpan, MAX_RANK};

use self::gather::ShardExchange;

pub use argreduce::{argmax, argmin, index_compare, ArgKind};
pub use dot::dot;
pub use retile::{retile, retile_receive, RetileTarget};
pub use slice::{slice, slice_gathered};
pub use window::{conv1d, Padding};

/// The directory of an operand if it is genuinely split. A directory with
/// no tiled axis describes a replicated value, which every operator treats
/// as local.
pub(crate) fn effective_directory(
    op: &'static str,
    locality: &Locality,
    directory: Option<&LocalitiesDirectory>,
) -> Result<Option<LocalitiesDirectory>, MeshError> {
    let Some(dir) = directory else {
        return Ok(None);
    };
    if dir.this_site() != locality.id() || dir.num_sites() > locality.num_localities() {
        return Err(MeshError::InvalidSite {
            site: dir.this_site(),
            num_sites: dir.num_sites(),
        });
    }
    if dir.rank() > MAX_RANK {
        return Err(MeshError::shape(op, format!("rank {} exceeds {MAX_RANK}", dir.rank())));
    }
    if dir.tiled_axes().is_empty() {
        return Ok(None);
    }
    Ok(Some(dir.clone()))
}

/// Collective key for one invocation of an operator over one distributed
/// value.
pub(crate) fn reduce_key(locality: &Locality, op: &str, annotation: &AnnotationDescriptor) -> String {
    locality.round(&format!("{op}:{}@{}", annotation.reduce_key(), annotation.generation))
}

/// Clip a global `span` to `window` and re-origin it at `window.start`.
/// Spans entirely outside the window become empty.
pub(crate) fn clip_to(span: TilingSpan, window: TilingSpan) -> TilingSpan {
    let start = span.start.clamp(window.start, window.stop);
    let stop = span.stop.clamp(start, window.stop);
    TilingSpan::new(start - window.start, stop - window.start)
}

/// Operands promoted to a common arithmetic type.
pub(crate) enum NumericPair {
    I64(Tensor<i64>, Tensor<i64>),
    F64(Tensor<f64>, Tensor<f64>),
}

/// bool and uint8 promote to int64; anything mixed with float64 becomes
/// float64.
pub(crate) fn promote_pair(a: &Array, b: &Array) -> NumericPair {
    match (a, b) {
        (Array::F64(_), _) | (_, Array::F64(_)) => NumericPair::F64(a.to_f64(), b.to_f64()),
        _ => NumericPair::I64(a.to_i64(), b.to_i64()),
    }
}

/// Where the pieces of a non-driving operand come from: a local copy, or
/// the peers' published shards.
pub(crate) enum OperandSource<T: Element> {
    Local(Tensor<T>),
    Shared(ShardExchange<T>),
}

impl<T: Element> OperandSource<T> {
    pub async fn new(
        locality: &Locality,
        shard: &Tensor<T>,
        directory: Option<&LocalitiesDirectory>,
        role: &str,
    ) -> Result<Self, MeshError> {
        Ok(match directory {
            None => Self::Local(shard.clone()),
            Some(dir) => Self::Shared(ShardExchange::publish(locality, shard, dir, role).await?),
        })
    }

    /// The global `region` of the operand.
    pub async fn region(&self, region: &[TilingSpan]) -> Result<Tensor<T>, MeshError> {
        match self {
            Self::Local(t) => Ok(t.region(&ranges(region))),
            Self::Shared(ex) => ex.gather(region).await,
        }
    }

    pub async fn finish<R>(self, result: Result<R, MeshError>) -> Result<R, MeshError> {
        match self {
            Self::Local(_) => result,
            Self::Shared(ex) => ex.finish(result).await,
        }
    }
}
