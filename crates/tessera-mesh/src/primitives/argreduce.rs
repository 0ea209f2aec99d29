//! Distributed arg-reductions (`argmax`, `argmin`).
//!
//! Each locality scans its shard, turning local positions into global
//! indices as it goes, and the per-locality candidates are combined with
//! [`index_compare`]: the strictly better value wins, equal values go to
//! the smaller global index. NaN never beats a number.

use tessera_tensor::{with_tensor, Element, Shape, Tensor};

use crate::collective::reduce_or_abort;
use crate::directory::LocalitiesDirectory;
use crate::error::MeshError;
use crate::locality::Locality;
use crate::primitives::{effective_directory, reduce_key};
use crate::tiling::{TileDescriptor, TilingSpan};
use crate::value::PartitionedValue;

/// Which extreme an arg-reduction looks for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgKind {
    Max,
    Min,
}

impl ArgKind {
    fn op(self) -> &'static str {
        match self {
            Self::Max => "argmax",
            Self::Min => "argmin",
        }
    }
}

/// Whether candidate `a` (value, global index) wins over `b`.
pub fn index_compare<T: Element>(kind: ArgKind, a: (T, u64), b: (T, u64)) -> bool {
    match (a.0.is_nan(), b.0.is_nan()) {
        (false, true) => return true,
        (true, false) => return false,
        (true, true) => return a.1 < b.1,
        (false, false) => {}
    }
    let (better, worse) = match kind {
        ArgKind::Max => (a.0 > b.0, a.0 < b.0),
        ArgKind::Min => (a.0 < b.0, a.0 > b.0),
    };
    better || (!worse && a.1 < b.1)
}

type Candidate<T> = Option<(T, u64)>;

fn pick<T: Element>(kind: ArgKind, a: Candidate<T>, b: Candidate<T>) -> Candidate<T> {
    match (a, b) {
        (Some(x), Some(y)) => Some(if index_compare(kind, x, y) { x } else { y }),
        (x, None) => x,
        (None, y) => y,
    }
}

/// Index of the largest element, over the flattened array or along `axis`.
pub async fn argmax(
    locality: &Locality,
    value: &PartitionedValue,
    axis: Option<usize>,
) -> Result<PartitionedValue, MeshError> {
    arg_reduce(locality, value, axis, ArgKind::Max).await
}

/// Index of the smallest element, over the flattened array or along `axis`.
pub async fn argmin(
    locality: &Locality,
    value: &PartitionedValue,
    axis: Option<usize>,
) -> Result<PartitionedValue, MeshError> {
    arg_reduce(locality, value, axis, ArgKind::Min).await
}

async fn arg_reduce(
    locality: &Locality,
    value: &PartitionedValue,
    axis: Option<usize>,
    kind: ArgKind,
) -> Result<PartitionedValue, MeshError> {
    let op = kind.op();
    let dir = effective_directory(op, locality, value.directory.as_ref())?;
    let global = value.global_dims();
    let rank = global.len();

    let axis = match axis {
        Some(axis) if axis >= rank => return Err(MeshError::InvalidAxis { op, axis, rank }),
        // Reducing the only axis of a vector is the flattened reduction.
        Some(_) if rank == 1 => None,
        Some(axis) if rank > 2 && dir.is_some() => {
            return Err(MeshError::unsupported(
                op,
                format!("reduction along axis {axis} of a distributed rank-{rank} array"),
            ))
        }
        other => other,
    };
    let reduced = axis.map_or(global.iter().product(), |a| global[a]);
    if reduced == 0 {
        return Err(MeshError::shape(op, format!("attempt to reduce an empty array of shape {global:?}")));
    }

    with_tensor!(&value.array, t => match (axis, dir.as_ref()) {
        (None, d) => flat(locality, t, d, &global, kind).await,
        (Some(axis), None) => local_axis(t, axis, kind),
        (Some(axis), Some(d)) => along_axis(locality, t, d, &global, axis, kind).await,
    })
}

fn local_region(dir: Option<&LocalitiesDirectory>, global: &[usize]) -> Vec<TilingSpan> {
    match dir {
        Some(d) => d.tile_region(d.this_site(), global),
        None => global.iter().map(|&e| TilingSpan::full(e)).collect(),
    }
}

/// Best element of the shard, indexed in the flattened global array.
fn scan_flat<T: Element>(
    shard: &Tensor<T>,
    region: &[TilingSpan],
    global_strides: &[usize],
    kind: ArgKind,
) -> Candidate<T> {
    if shard.numel() == 0 {
        return None;
    }
    let mut idx = vec![0usize; shard.ndim()];
    let mut best = None;
    loop {
        let flat: usize = idx
            .iter()
            .zip(region)
            .zip(global_strides)
            .map(|((i, span), stride)| (i + span.start) * stride)
            .sum();
        best = pick(kind, best, Some((shard.get(&idx), flat as u64)));
        if !shard.shape().advance(&mut idx) {
            break;
        }
    }
    best
}

async fn flat<T: Element>(
    locality: &Locality,
    shard: &Tensor<T>,
    dir: Option<&LocalitiesDirectory>,
    global: &[usize],
    kind: ArgKind,
) -> Result<PartitionedValue, MeshError> {
    let region = local_region(dir, global);
    let strides = Shape::from_slice(global).contiguous_strides();
    let local = scan_flat(shard, &region, &strides, kind);
    let best = match dir {
        None => local,
        Some(d) => {
            let key = reduce_key(locality, kind.op(), &d.annotation);
            reduce_or_abort(locality, &key, d.num_sites(), Ok(local), move |a, b| pick(kind, a, b)).await?
        }
    };
    match best {
        Some((_, index)) => Ok(PartitionedValue::local(Tensor::scalar(index as i64))),
        None => Err(MeshError::shape(kind.op(), "no element to reduce")),
    }
}

fn finish_indices<T: Element>(op: &'static str, best: &[Candidate<T>]) -> Result<Vec<i64>, MeshError> {
    best.iter()
        .map(|c| {
            c.map(|(_, i)| i as i64)
                .ok_or_else(|| MeshError::shape(op, "no element to reduce"))
        })
        .collect()
}

/// Reduction along `axis` of a whole array of any rank. The result drops
/// that axis.
fn local_axis<T: Element>(
    array: &Tensor<T>,
    axis: usize,
    kind: ArgKind,
) -> Result<PartitionedValue, MeshError> {
    let dims = array.dims();
    let out_dims: Vec<usize> = dims
        .iter()
        .enumerate()
        .filter(|&(a, _)| a != axis)
        .map(|(_, &d)| d)
        .collect();
    let out_strides = Shape::from_slice(&out_dims).contiguous_strides();
    let mut best: Vec<Candidate<T>> = vec![None; out_dims.iter().product()];
    if array.numel() > 0 {
        let mut idx = vec![0usize; dims.len()];
        loop {
            let slot: usize = idx
                .iter()
                .enumerate()
                .filter(|&(a, _)| a != axis)
                .zip(&out_strides)
                .map(|((_, i), stride)| i * stride)
                .sum();
            best[slot] = pick(kind, best[slot], Some((array.get(&idx), idx[axis] as u64)));
            if !array.shape().advance(&mut idx) {
                break;
            }
        }
    }
    let indices = finish_indices(kind.op(), &best)?;
    Ok(PartitionedValue::local(Tensor::from_vec(indices, &out_dims)))
}

/// Reduction along `axis` of a tiled matrix.
async fn along_axis<T: Element>(
    locality: &Locality,
    shard: &Tensor<T>,
    d: &LocalitiesDirectory,
    global: &[usize],
    axis: usize,
    kind: ArgKind,
) -> Result<PartitionedValue, MeshError> {
    let op = kind.op();
    let keep = 1 - axis;
    let region = d.tile_region(d.this_site(), global);
    let kept = region[keep];
    let origin = region[axis].start;

    let mut local: Vec<Candidate<T>> = vec![None; kept.size()];
    if shard.numel() > 0 {
        let mut idx = [0usize; 2];
        loop {
            let slot = &mut local[idx[keep]];
            *slot = pick(kind, *slot, Some((shard.get(&idx), (idx[axis] + origin) as u64)));
            if !shard.shape().advance(&mut idx) {
                break;
            }
        }
    }

    if !d.is_tiled(axis) {
        // Whole reduction axis is local: the result keeps the other axis'
        // tiling.
        let indices = finish_indices(op, &local)?;
        let tiles = (0..d.num_sites())
            .map(|site| {
                let s = d.tile_region(site, global)[keep];
                TileDescriptor::vector(s.start, s.stop)
            })
            .collect();
        let directory = LocalitiesDirectory::new(d.locality, d.annotation.next_generation(), tiles)?;
        return PartitionedValue::distributed(Tensor::from_slice(&indices), directory);
    }

    let mut full: Vec<Candidate<T>> = vec![None; global[keep]];
    full[kept.range()].copy_from_slice(&local);
    let key = reduce_key(locality, op, &d.annotation);
    let combined = reduce_or_abort(locality, &key, d.num_sites(), Ok(full), move |a, b| {
        a.into_iter().zip(b).map(|(x, y)| pick(kind, x, y)).collect()
    })
    .await?;
    let indices = finish_indices(op, &combined)?;
    Ok(PartitionedValue::local(Tensor::from_slice(&indices)))
}
