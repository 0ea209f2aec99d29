//! Distributed contraction (`dot`).
//!
//! The tiled operand drives: each locality contracts its own shard against
//! the matching region of the other operand (gathered from peers when that
//! operand is tiled too). Results that stay aligned with the driver's
//! tiling come back distributed; partial sums are combined with a keyed
//! collective and come back replicated.

use tracing::debug;

use tessera_tensor::{Numeric, Shape, Tensor};

use crate::collective::{reduce_or_abort, ReduceOp};
use crate::directory::LocalitiesDirectory;
use crate::error::MeshError;
use crate::locality::Locality;
use crate::primitives::{effective_directory, promote_pair, reduce_key, NumericPair, OperandSource};
use crate::tiling::{TileDescriptor, TilingSpan};
use crate::value::PartitionedValue;

const OP: &str = "dot";

/// Contract `lhs` with `rhs`.
///
/// Rank 0 scales the other operand; 1·1 is the inner product, 2·1 and 1·2
/// matrix-vector products, 2·2 matrix multiplication.
pub async fn dot(
    locality: &Locality,
    lhs: &PartitionedValue,
    rhs: &PartitionedValue,
) -> Result<PartitionedValue, MeshError> {
    let da = effective_directory(OP, locality, lhs.directory.as_ref())?;
    let db = effective_directory(OP, locality, rhs.directory.as_ref())?;
    let ga = lhs.global_dims();
    let gb = rhs.global_dims();
    check_shapes(&ga, &gb)?;
    if let (Some(a), Some(b)) = (&da, &db) {
        if a.num_sites() != b.num_sites() {
            return Err(MeshError::unsupported(
                OP,
                format!(
                    "operands are split over {} and {} localities",
                    a.num_sites(),
                    b.num_sites()
                ),
            ));
        }
    }
    let (da, db) = (da.as_ref(), db.as_ref());
    match promote_pair(&lhs.array, &rhs.array) {
        NumericPair::I64(a, b) => contract(locality, Operands { a, da, ga: &ga, b, db, gb: &gb }).await,
        NumericPair::F64(a, b) => contract(locality, Operands { a, da, ga: &ga, b, db, gb: &gb }).await,
    }
}

fn check_shapes(ga: &[usize], gb: &[usize]) -> Result<(), MeshError> {
    let inner = match (ga.len(), gb.len()) {
        (0, _) | (_, 0) => return Ok(()),
        (1, 1) => (ga[0], gb[0]),
        (2, 1) => (ga[1], gb[0]),
        (1, 2) | (2, 2) => (ga[ga.len() - 1], gb[0]),
        (ra, rb) => {
            return Err(MeshError::shape(
                OP,
                format!("operands of rank {ra} and {rb} are not supported (ranks 0 to 2)"),
            ))
        }
    };
    if inner.0 != inner.1 {
        return Err(MeshError::shape(
            OP,
            format!("contracted dimensions differ: {ga:?} and {gb:?}"),
        ));
    }
    Ok(())
}

struct Operands<'a, T: Numeric> {
    a: Tensor<T>,
    da: Option<&'a LocalitiesDirectory>,
    ga: &'a [usize],
    b: Tensor<T>,
    db: Option<&'a LocalitiesDirectory>,
    gb: &'a [usize],
}

/// Single-process contraction of two whole arrays.
fn local_dot<T: Numeric>(a: &Tensor<T>, b: &Tensor<T>) -> Tensor<T> {
    match (a.ndim(), b.ndim()) {
        (0, _) => {
            let s = a.data()[0];
            b.map(|x| s * x)
        }
        (_, 0) => {
            let s = b.data()[0];
            a.map(|x| x * s)
        }
        (1, 1) => Tensor::scalar(a.dot(b)),
        (2, 1) => a.matvec(b),
        (1, 2) => a.vecmat(b),
        _ => a.matmul(b),
    }
}

async fn contract<T: Numeric>(
    locality: &Locality,
    ops: Operands<'_, T>,
) -> Result<PartitionedValue, MeshError> {
    if ops.da.is_none() && ops.db.is_none() {
        return Ok(PartitionedValue::local(local_dot(&ops.a, &ops.b)));
    }
    match (ops.ga.len(), ops.gb.len()) {
        (0, _) | (_, 0) => scale(ops),
        (1, 1) => inner(locality, ops).await,
        (2, 1) => matvec(locality, ops).await,
        (1, 2) => vecmat(locality, ops).await,
        _ => matmul(locality, ops).await,
    }
}

/// Scalar times a tiled array: purely local, the tiling carries over.
fn scale<T: Numeric>(ops: Operands<'_, T>) -> Result<PartitionedValue, MeshError> {
    let dir = match (ops.da, ops.db) {
        (Some(d), None) if ops.gb.is_empty() => d,
        (None, Some(d)) if ops.ga.is_empty() => d,
        _ => {
            return Err(MeshError::unsupported(
                OP,
                "a distributed rank-0 operand cannot be contracted",
            ))
        }
    };
    let result = local_dot(&ops.a, &ops.b);
    PartitionedValue::distributed(result, dir.regenerate(dir.tiles.clone()))
}

/// Tiles describing one axis of the driver's tiling as a 1-D result.
fn vector_tiles(dir: &LocalitiesDirectory, global: &[usize], axis: usize) -> Vec<TileDescriptor> {
    (0..dir.num_sites())
        .map(|site| {
            let s = dir.tile_region(site, global)[axis];
            TileDescriptor::vector(s.start, s.stop)
        })
        .collect()
}

fn place<T: Numeric>(len: usize, at: TilingSpan, part: &Tensor<T>) -> Vec<T> {
    let mut full = vec![T::ZERO; len];
    full[at.range()].copy_from_slice(part.data());
    full
}

fn stamp<T: Numeric>(
    result: Tensor<T>,
    driver: &LocalitiesDirectory,
    tiles: Vec<TileDescriptor>,
) -> Result<PartitionedValue, MeshError> {
    let directory = LocalitiesDirectory::new(driver.locality, driver.annotation.next_generation(), tiles)?;
    PartitionedValue::distributed(result, directory)
}

async fn sum_partials<T: Numeric>(
    locality: &Locality,
    driver: &LocalitiesDirectory,
    partial: Result<Vec<T>, MeshError>,
    dims: &[usize],
) -> Result<PartitionedValue, MeshError> {
    let key = reduce_key(locality, OP, &driver.annotation);
    let total = reduce_or_abort(locality, &key, driver.num_sites(), partial, |x, y| {
        ReduceOp::Sum.apply_elementwise(x, y)
    })
    .await?;
    Ok(PartitionedValue::local(Tensor::new(total, Shape::from_slice(dims))))
}

/// vector · vector: partial inner products, summed across localities.
async fn inner<T: Numeric>(
    locality: &Locality,
    ops: Operands<'_, T>,
) -> Result<PartitionedValue, MeshError> {
    // The product is symmetric, so whichever side is tiled drives.
    let (shard, driver, global, other, other_dir, role) = match (ops.da, ops.db) {
        (Some(d), _) => (&ops.a, d, ops.ga, &ops.b, ops.db, "rhs"),
        (None, Some(d)) => (&ops.b, d, ops.gb, &ops.a, None, "lhs"),
        (None, None) => return Ok(PartitionedValue::local(local_dot(&ops.a, &ops.b))),
    };
    let mine = driver.tile_region(driver.this_site(), global);
    let source = OperandSource::new(locality, other, other_dir, role).await?;
    let partial = source.region(&mine).await.map(|piece| shard.dot(&piece));
    let partial = source.finish(partial).await;
    debug!("dot: locality {} contributes its partial inner product", locality.id());
    let key = reduce_key(locality, OP, &driver.annotation);
    let total = reduce_or_abort(locality, &key, driver.num_sites(), partial, |x: T, y: T| x + y).await?;
    Ok(PartitionedValue::local(Tensor::scalar(total)))
}

/// matrix · vector.
async fn matvec<T: Numeric>(
    locality: &Locality,
    ops: Operands<'_, T>,
) -> Result<PartitionedValue, MeshError> {
    let m = ops.ga[0];
    if let Some(da) = ops.da {
        let mine = da.tile_region(da.this_site(), ops.ga);
        let source = OperandSource::new(locality, &ops.b, ops.db, "rhs").await?;
        let partial = source.region(&[mine[1]]).await.map(|piece| ops.a.matvec(&piece));
        let partial = source.finish(partial).await;
        if !da.is_tiled(1) {
            return stamp(partial?, da, vector_tiles(da, ops.ga, 0));
        }
        let rows = mine[0];
        let partial = partial.map(|p| place(m, rows, &p));
        return sum_partials(locality, da, partial, &[m]).await;
    }
    let Some(db) = ops.db else {
        return Ok(PartitionedValue::local(local_dot(&ops.a, &ops.b)));
    };
    // Only the vector is tiled: contract the matching columns of the
    // replicated matrix.
    let cols = db.tile_region(db.this_site(), ops.gb)[0];
    let block = ops.a.region(&[0..m, cols.range()]);
    let partial = Ok(block.matvec(&ops.b).into_data());
    sum_partials(locality, db, partial, &[m]).await
}

/// vector · matrix.
async fn vecmat<T: Numeric>(
    locality: &Locality,
    ops: Operands<'_, T>,
) -> Result<PartitionedValue, MeshError> {
    let n = ops.gb[1];
    if let Some(db) = ops.db {
        let mine = db.tile_region(db.this_site(), ops.gb);
        let source = OperandSource::new(locality, &ops.a, ops.da, "lhs").await?;
        let partial = source.region(&[mine[0]]).await.map(|piece| piece.vecmat(&ops.b));
        let partial = source.finish(partial).await;
        if !db.is_tiled(0) {
            return stamp(partial?, db, vector_tiles(db, ops.gb, 1));
        }
        let cols = mine[1];
        let partial = partial.map(|p| place(n, cols, &p));
        return sum_partials(locality, db, partial, &[n]).await;
    }
    let Some(da) = ops.da else {
        return Ok(PartitionedValue::local(local_dot(&ops.a, &ops.b)));
    };
    let rows = da.tile_region(da.this_site(), ops.ga)[0];
    let block = ops.b.region(&[rows.range(), 0..n]);
    let partial = Ok(ops.a.vecmat(&block).into_data());
    sum_partials(locality, da, partial, &[n]).await
}

/// matrix · matrix.
async fn matmul<T: Numeric>(
    locality: &Locality,
    ops: Operands<'_, T>,
) -> Result<PartitionedValue, MeshError> {
    let (m, k, n) = (ops.ga[0], ops.ga[1], ops.gb[1]);
    if let Some(da) = ops.da {
        if da.is_tiled(1) {
            return Err(MeshError::unsupported(
                OP,
                "column-wise contraction parallelization of the left operand",
            ));
        }
        // Row-tiled lhs: every locality needs the whole rhs.
        let source = OperandSource::new(locality, &ops.b, ops.db, "rhs").await?;
        let partial = source
            .region(&[TilingSpan::full(k), TilingSpan::full(n)])
            .await
            .map(|rhs| ops.a.matmul(&rhs));
        let partial = source.finish(partial).await?;
        let tiles = (0..da.num_sites())
            .map(|site| {
                let r = da.tile_region(site, ops.ga)[0];
                TileDescriptor::rows(r.start, r.stop)
            })
            .collect();
        return stamp(partial, da, tiles);
    }
    let Some(db) = ops.db else {
        return Ok(PartitionedValue::local(local_dot(&ops.a, &ops.b)));
    };
    let mine = db.tile_region(db.this_site(), ops.gb);
    let block = ops.a.region(&[0..m, mine[0].range()]);
    let partial = block.matmul(&ops.b);
    if !db.is_tiled(0) {
        let tiles = (0..db.num_sites())
            .map(|site| {
                let c = db.tile_region(site, ops.gb)[1];
                TileDescriptor::columns(c.start, c.stop)
            })
            .collect();
        return stamp(partial, db, tiles);
    }
    let mut full = Tensor::zeros(Shape::from_slice(&[m, n]));
    full.write_region(&[0, mine[1].start], &partial);
    sum_partials(locality, db, Ok(full.into_data()), &[m, n]).await
}
