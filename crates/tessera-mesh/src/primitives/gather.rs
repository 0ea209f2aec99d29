//! Assembling arbitrary global regions of a tiled operand.
//!
//! Every locality publishes its shard for the duration of one operator
//! call. A locality that needs a region it does not own intersects the
//! region with each peer's tile, fetches the overlapping pieces
//! concurrently, and writes them into a buffer at their offsets. Pieces
//! owned locally are copied without communication.

use futures::future::try_join_all;
use tracing::trace;

use tessera_tensor::{Element, Shape, Tensor};

use crate::collective::abort_among;
use crate::directory::LocalitiesDirectory;
use crate::error::MeshError;
use crate::locality::Locality;
use crate::object::DistributedObject;
use crate::tiling::{intersect_region, TilingSpan};

/// One operand's shards, published for the duration of an operator call.
pub(crate) struct ShardExchange<T: Element> {
    object: DistributedObject<Tensor<T>>,
    directory: LocalitiesDirectory,
    global: Vec<usize>,
    locality: Locality,
    participants: u32,
}

impl<T: Element> ShardExchange<T> {
    /// Publish this locality's shard under
    /// `"{annotation}@{generation}/{role}#{round}"`, where the round counts
    /// earlier exchanges of the same operand and role on this locality.
    pub async fn publish(
        locality: &Locality,
        shard: &Tensor<T>,
        directory: &LocalitiesDirectory,
        role: &str,
    ) -> Result<Self, MeshError> {
        let base = locality.round(&format!(
            "{}@{}/{role}",
            directory.annotation.name, directory.annotation.generation
        ));
        let global = directory.global_dims(shard.dims());
        let participants = directory.num_sites();
        Self::publish_named(locality, shard.clone(), directory.clone(), global, base, participants)
            .await
    }

    /// Publish `shard` under `base` among localities `0..participants`.
    /// Localities past the end of `directory` take part with an empty shard
    /// so they can read the owners' tiles and share the teardown barrier.
    pub async fn publish_named(
        locality: &Locality,
        shard: Tensor<T>,
        directory: LocalitiesDirectory,
        global: Vec<usize>,
        base: String,
        participants: u32,
    ) -> Result<Self, MeshError> {
        let created = DistributedObject::create(
            locality,
            base.clone(),
            shard,
            Some(participants),
            Some(locality.id()),
        );
        let object = match created {
            Ok(object) => object,
            Err(e) => {
                let key = format!("barrier/{base}");
                abort_among(locality, &key, participants, &e.to_string()).await;
                return Err(e);
            }
        };
        Ok(Self {
            object,
            directory,
            global,
            locality: locality.clone(),
            participants,
        })
    }

    /// Assemble the global `region` (one span per axis) from whichever
    /// localities own it.
    pub async fn gather(&self, region: &[TilingSpan]) -> Result<Tensor<T>, MeshError> {
        if region.len() != self.global.len()
            || region.iter().zip(&self.global).any(|(s, &d)| s.stop > d)
        {
            return Err(MeshError::shape(
                "gather",
                format!("region {region:?} is outside an array of shape {:?}", self.global),
            ));
        }
        let dims: Vec<usize> = region.iter().map(TilingSpan::size).collect();
        let mut out = Tensor::zeros(Shape::new(dims));
        if out.numel() == 0 {
            return Ok(out);
        }

        let mut pending = Vec::new();
        for site in 0..self.directory.num_sites() {
            let tile = self.directory.tile_region(site, &self.global);
            let Some(overlap) = intersect_region(region, &tile) else {
                continue;
            };
            let source = self.directory.project_region(site, &overlap);
            let offset: Vec<usize> = overlap
                .iter()
                .zip(region)
                .map(|(o, r)| o.start - r.start)
                .collect();
            trace!("gather {:?}: {:?} from site {site}", region, overlap);
            pending.push(async move {
                let piece = self.object.fetch_region(site, &source).await?;
                Ok::<_, MeshError>((offset, piece))
            });
        }
        for (offset, piece) in try_join_all(pending).await? {
            out.write_region(&offset, &piece);
        }
        Ok(out)
    }

    /// Retire the published shards once every locality is done with them,
    /// passing `result` through. On error the peers are told not to wait.
    pub async fn finish<R>(self, result: Result<R, MeshError>) -> Result<R, MeshError> {
        match result {
            Ok(value) => {
                self.object.retire().await?;
                Ok(value)
            }
            Err(e) => {
                let key = format!("barrier/{}", self.object.base_name());
                abort_among(&self.locality, &key, self.participants, &e.to_string()).await;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MeshConfig;
    use crate::directory::{AnnotationDescriptor, LocalityDescriptor};
    use crate::mesh::Mesh;
    use crate::tiling::TileDescriptor;

    fn block_directory(site: u32) -> LocalitiesDirectory {
        // 4x4 matrix in four 2x2 blocks.
        let span = |a, b| TilingSpan::new(a, b);
        LocalitiesDirectory::new(
            LocalityDescriptor::new(site, 4).unwrap(),
            AnnotationDescriptor::new("blocks", 0),
            vec![
                TileDescriptor::block(span(0, 2), span(0, 2)),
                TileDescriptor::block(span(0, 2), span(2, 4)),
                TileDescriptor::block(span(2, 4), span(0, 2)),
                TileDescriptor::block(span(2, 4), span(2, 4)),
            ],
        )
        .unwrap()
    }

    fn global_value(i: usize, j: usize) -> i64 {
        (i * 4 + j) as i64
    }

    #[tokio::test]
    async fn gather_center_of_block_tiled_matrix() {
        let mesh = Mesh::local(4, MeshConfig::default()).await.unwrap();
        let results = mesh
            .run(|loc| async move {
                let dir = block_directory(loc.id());
                let region = dir.tile_region(loc.id(), &[4, 4]);
                let shard = Tensor::from_fn(Shape::from_slice(&[2, 2]), |idx| {
                    global_value(idx[0] + region[0].start, idx[1] + region[1].start)
                });
                let ex = ShardExchange::publish(&loc, &shard, &dir, "test").await?;
                let center = ex.gather(&[TilingSpan::new(1, 3), TilingSpan::new(1, 3)]).await;
                ex.finish(center).await
            })
            .await;
        for r in results {
            assert_eq!(r.unwrap().into_data(), vec![5, 6, 9, 10]);
        }
    }

    #[tokio::test]
    async fn out_of_range_region_rejected() {
        let mesh = Mesh::local(1, MeshConfig::default()).await.unwrap();
        let loc = mesh.locality(0).unwrap();
        let dir = LocalitiesDirectory::new(
            LocalityDescriptor::new(0, 1).unwrap(),
            AnnotationDescriptor::new("v", 0),
            vec![TileDescriptor::vector(0, 3)],
        )
        .unwrap();
        let ex = ShardExchange::publish(loc, &Tensor::from_slice(&[1.0, 2.0, 3.0]), &dir, "t")
            .await
            .unwrap();
        let r = ex.gather(&[TilingSpan::new(2, 5)]).await;
        assert!(matches!(r, Err(MeshError::ShapeMismatch { .. })));
        assert!(ex.finish(Ok(())).await.is_ok());
    }
}
