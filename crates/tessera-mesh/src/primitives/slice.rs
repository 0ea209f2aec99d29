//! Slicing a tiled array by one global half-open range per axis.

use std::ops::Range;

use tessera_tensor::{with_tensor, Array, Element, Tensor};

use crate::directory::LocalitiesDirectory;
use crate::error::MeshError;
use crate::locality::Locality;
use crate::primitives::gather::ShardExchange;
use crate::primitives::{clip_to, effective_directory};
use crate::tiling::{TileDescriptor, TilingSpan};
use crate::value::PartitionedValue;

const OP: &str = "slice";

fn selection(global: &[usize], select: &[Range<usize>]) -> Result<Vec<TilingSpan>, MeshError> {
    if select.len() != global.len() {
        return Err(MeshError::shape(
            OP,
            format!("{} ranges given for an array of rank {}", select.len(), global.len()),
        ));
    }
    select
        .iter()
        .zip(global)
        .map(|(r, &extent)| {
            TilingSpan::checked(r.start, r.end)
                .filter(|s| s.stop <= extent)
                .ok_or_else(|| {
                    MeshError::shape(OP, format!("range {r:?} does not fit an axis of extent {extent}"))
                })
        })
        .collect()
}

/// Select `select` (one global range per axis). A tiled value stays tiled:
/// every locality keeps the part of the selection it already owns, so no
/// data moves.
pub async fn slice(
    locality: &Locality,
    value: &PartitionedValue,
    select: &[Range<usize>],
) -> Result<PartitionedValue, MeshError> {
    let dir = effective_directory(OP, locality, value.directory.as_ref())?;
    let global = value.global_dims();
    let window = selection(&global, select)?;
    let Some(dir) = dir else {
        let array = with_tensor!(&value.array, t => Array::from(t.region(select)));
        return Ok(PartitionedValue::local(array));
    };

    let clip = |site: u32| -> Vec<TilingSpan> {
        dir.tile_region(site, &global)
            .into_iter()
            .zip(&window)
            .map(|(span, &w)| clip_to(span, w))
            .collect()
    };
    let tiles: Vec<TileDescriptor> = (0..dir.num_sites())
        .map(|site| {
            let clipped = clip(site);
            TileDescriptor::new(
                (0..dir.rank())
                    .map(|axis| dir.is_tiled(axis).then_some(clipped[axis]))
                    .collect(),
            )
        })
        .collect();

    // This locality's clipped tile, back in its shard's coordinates.
    let mine = dir.tile_region(dir.this_site(), &global);
    let local: Vec<Range<usize>> = clip(dir.this_site())
        .iter()
        .zip(&window)
        .zip(&mine)
        .map(|((c, w), m)| {
            if c.is_empty() {
                return 0..0;
            }
            let start = c.start + w.start - m.start;
            start..start + c.size()
        })
        .collect();
    let array = with_tensor!(&value.array, t => Array::from(t.region(&local)));
    let directory = LocalitiesDirectory::new(dir.locality, dir.annotation.next_generation(), tiles)?;
    PartitionedValue::distributed(array, directory)
}

/// Select `select` and assemble the whole selection on every locality.
pub async fn slice_gathered(
    locality: &Locality,
    value: &PartitionedValue,
    select: &[Range<usize>],
) -> Result<PartitionedValue, MeshError> {
    let dir = effective_directory(OP, locality, value.directory.as_ref())?;
    let global = value.global_dims();
    let window = selection(&global, select)?;
    let Some(dir) = dir else {
        let array = with_tensor!(&value.array, t => Array::from(t.region(select)));
        return Ok(PartitionedValue::local(array));
    };
    let array = with_tensor!(&value.array, t => Array::from(gather_window(locality, t, &dir, &window).await?));
    Ok(PartitionedValue::local(array))
}

async fn gather_window<T: Element>(
    locality: &Locality,
    shard: &Tensor<T>,
    dir: &LocalitiesDirectory,
    window: &[TilingSpan],
) -> Result<Tensor<T>, MeshError> {
    let exchange = ShardExchange::publish(locality, shard, dir, OP).await?;
    let result = exchange.gather(window).await;
    exchange.finish(result).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MeshConfig;
    use crate::directory::{AnnotationDescriptor, LocalityDescriptor};
    use crate::mesh::Mesh;

    fn vector(site: u32) -> PartitionedValue {
        let bounds = [(0, 3), (3, 6), (6, 9)];
        let (s, e) = bounds[site as usize];
        let dir = LocalitiesDirectory::new(
            LocalityDescriptor::new(site, 3).unwrap(),
            AnnotationDescriptor::new("v", 0),
            bounds.iter().map(|&(a, b)| TileDescriptor::vector(a, b)).collect(),
        )
        .unwrap();
        let data: Vec<i64> = (s as i64 + 1..=e as i64).collect();
        PartitionedValue::distributed(Tensor::from_slice(&data), dir).unwrap()
    }

    #[tokio::test]
    async fn slice_stays_distributed() {
        let mesh = Mesh::local(3, MeshConfig::default()).await.unwrap();
        let results = mesh
            .run(|loc| async move { slice(&loc, &vector(loc.id()), &[2..7]).await })
            .await;
        let shards: Vec<Vec<i64>> = results
            .iter()
            .map(|r| r.as_ref().unwrap().tensor::<i64>().unwrap().data().to_vec())
            .collect();
        assert_eq!(shards, vec![vec![3], vec![4, 5, 6], vec![7]]);
        let d = results[2].as_ref().unwrap().directory.clone().unwrap();
        assert_eq!(d.tiles[0], TileDescriptor::vector(0, 1));
        assert_eq!(d.tiles[2], TileDescriptor::vector(4, 5));
        assert_eq!(d.annotation.generation, 1);
    }

    #[tokio::test]
    async fn slice_leaves_empty_tiles() {
        let mesh = Mesh::local(3, MeshConfig::default()).await.unwrap();
        let results = mesh
            .run(|loc| async move { slice(&loc, &vector(loc.id()), &[4..6]).await })
            .await;
        let r0 = results[0].as_ref().unwrap();
        assert_eq!(r0.array.numel(), 0);
        assert_eq!(r0.global_dims(), vec![2]);
        assert_eq!(results[1].as_ref().unwrap().tensor::<i64>().unwrap().data(), &[5, 6]);
    }

    #[tokio::test]
    async fn gathered_slice_on_every_locality() {
        let mesh = Mesh::local(3, MeshConfig::default()).await.unwrap();
        let results = mesh
            .run(|loc| async move { slice_gathered(&loc, &vector(loc.id()), &[1..8]).await })
            .await;
        for r in results {
            let r = r.unwrap();
            assert!(!r.is_distributed());
            assert_eq!(r.tensor::<i64>().unwrap().data(), &[2, 3, 4, 5, 6, 7, 8]);
        }
    }

    #[tokio::test]
    async fn local_slice_and_bad_ranges() {
        let mesh = Mesh::local(1, MeshConfig::default()).await.unwrap();
        let loc = mesh.locality(0).unwrap();
        let m = PartitionedValue::local(Tensor::from_vec((0..6).map(f64::from).collect(), &[2, 3]));
        let r = slice(loc, &m, &[1..2, 0..2]).await.unwrap();
        assert_eq!(r.tensor::<f64>().unwrap().data(), &[3.0, 4.0]);
        assert!(matches!(slice(loc, &m, &[0..3, 0..1]).await, Err(MeshError::ShapeMismatch { .. })));
        assert!(matches!(slice(loc, &m, &[0..1]).await, Err(MeshError::ShapeMismatch { .. })));
    }
}
