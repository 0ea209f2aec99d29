//! Redistributing a tiled array under a new tiling.
//!
//! Every locality of the mesh takes part. Holders of the source call
//! [`retile`] with the tile they should own afterwards (or `None` if they
//! drop out); localities outside the source tiling call [`retile_receive`]
//! with the source's annotation. Layouts and targets are exchanged with an
//! all-gather so every locality can check the new tiling, then each new
//! owner assembles its tile from the intersecting old tiles.

use serde::{Deserialize, Serialize};
use tracing::debug;

use tessera_tensor::{with_tensor, Array, Element, ElementType, Tensor};

use crate::collective::all_gather_among;
use crate::directory::{AnnotationDescriptor, LocalitiesDirectory, LocalityDescriptor, RETILE_SUFFIX};
use crate::error::MeshError;
use crate::locality::Locality;
use crate::primitives::effective_directory;
use crate::primitives::gather::ShardExchange;
use crate::tiling::{ranges, TileDescriptor, TilingSpan};
use crate::value::PartitionedValue;

const OP: &str = "retile";

/// What one locality should own after a retile.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetileTarget {
    /// Position in the new set of localities.
    pub locality: LocalityDescriptor,
    /// Tile owned in the new tiling.
    pub tile: TileDescriptor,
}

impl RetileTarget {
    pub fn new(locality: LocalityDescriptor, tile: TileDescriptor) -> Self {
        Self { locality, tile }
    }
}

/// The source as its holders describe it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct SourceLayout {
    annotation: AnnotationDescriptor,
    element: ElementType,
    global: Vec<usize>,
    tiles: Vec<TileDescriptor>,
}

/// One locality's contribution to the retile all-gather.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct Offer {
    source: Option<SourceLayout>,
    target: Option<RetileTarget>,
}

/// The source layout all holders agree on. Holders must be exactly the
/// localities `0..n` of the old tiling.
fn source_layout(offers: &[Offer]) -> Result<SourceLayout, MeshError> {
    let Some(layout) = offers.iter().find_map(|o| o.source.clone()) else {
        return Err(MeshError::shape(OP, "no locality holds the source"));
    };
    let holders = layout.tiles.len();
    for (id, offer) in offers.iter().enumerate() {
        match &offer.source {
            Some(other) if *other != layout => {
                return Err(MeshError::shape(
                    OP,
                    format!("locality {id} describes the source differently"),
                ))
            }
            None if id < holders => {
                return Err(MeshError::shape(
                    OP,
                    format!("locality {id} owns a tile of {} but offered no shard", layout.annotation),
                ))
            }
            _ => {}
        }
    }
    Ok(layout)
}

/// Order the gathered targets by new site and check they describe one
/// consistent set of localities.
fn new_tiles(
    targets: &[Option<RetileTarget>],
    rank: usize,
) -> Result<(u32, Vec<TileDescriptor>), MeshError> {
    let present: Vec<(u32, &RetileTarget)> = targets
        .iter()
        .enumerate()
        .filter_map(|(rank, t)| t.as_ref().map(|t| (rank as u32, t)))
        .collect();
    let Some((_, first)) = present.first() else {
        return Err(MeshError::shape(OP, "no locality asked for a tile"));
    };
    let num_new = first.locality.num_localities;
    if num_new as usize > targets.len() {
        return Err(MeshError::InvalidSite {
            site: num_new - 1,
            num_sites: targets.len() as u32,
        });
    }
    let mut tiles: Vec<Option<TileDescriptor>> = vec![None; num_new as usize];
    for (id, t) in &present {
        if t.locality.num_localities != num_new {
            return Err(MeshError::shape(
                OP,
                format!(
                    "localities disagree on the new locality count ({num_new} and {})",
                    t.locality.num_localities
                ),
            ));
        }
        // New site i lives on mesh locality i.
        if t.locality.locality_id != *id || t.locality.locality_id >= num_new {
            return Err(MeshError::InvalidSite {
                site: t.locality.locality_id,
                num_sites: num_new,
            });
        }
        if t.tile.rank() != rank {
            return Err(MeshError::shape(
                OP,
                format!("target tile {} does not have rank {rank}", t.tile),
            ));
        }
        tiles[t.locality.locality_id as usize] = Some(t.tile.clone());
    }
    let tiles = tiles
        .into_iter()
        .enumerate()
        .map(|(site, t)| {
            t.ok_or_else(|| MeshError::shape(OP, format!("no locality asked for new site {site}")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok((num_new, tiles))
}

/// Move `source` onto the tiling described by the localities' targets.
///
/// Returns this locality's shard of the new tiling, or `None` if it was
/// not given a target. The new value is named after the source with a
/// `"/retiled"` suffix and the next generation.
pub async fn retile(
    locality: &Locality,
    source: &PartitionedValue,
    target: Option<RetileTarget>,
) -> Result<Option<PartitionedValue>, MeshError> {
    let Some(dir) = source.directory.as_ref() else {
        return Err(MeshError::unsupported(OP, "the source value is not distributed"));
    };
    let tiled = effective_directory(OP, locality, Some(dir))?;
    let layout = SourceLayout {
        annotation: dir.annotation.clone(),
        element: source.array.element_type(),
        global: dir.global_dims(source.array.dims()),
        tiles: dir.tiles.clone(),
    };
    let held = (&source.array, tiled.is_some(), layout);
    redistribute(locality, &dir.annotation, Some(held), target).await
}

/// Take part in retiling the value named `annotation` from a locality
/// that holds no shard of it, typically to receive a tile when the new
/// tiling spans more localities than the old one.
pub async fn retile_receive(
    locality: &Locality,
    annotation: &AnnotationDescriptor,
    target: Option<RetileTarget>,
) -> Result<Option<PartitionedValue>, MeshError> {
    redistribute(locality, annotation, None, target).await
}

async fn redistribute(
    locality: &Locality,
    annotation: &AnnotationDescriptor,
    held: Option<(&Array, bool, SourceLayout)>,
    target: Option<RetileTarget>,
) -> Result<Option<PartitionedValue>, MeshError> {
    let key = locality.round(&format!("{OP}:gather/{}@{}", annotation.name, annotation.generation));
    let offer = Offer {
        source: held.as_ref().map(|(_, _, layout)| layout.clone()),
        target: target.clone(),
    };
    let offers = all_gather_among(locality, &key, locality.num_localities(), offer).await?;
    let layout = source_layout(&offers)?;
    let targets: Vec<Option<RetileTarget>> = offers.into_iter().map(|o| o.target).collect();
    let (num_new, tiles) = new_tiles(&targets, layout.global.len())?;

    let annotation = layout.annotation.derived(RETILE_SUFFIX);
    LocalitiesDirectory::new(LocalityDescriptor::new(0, num_new)?, annotation.clone(), tiles.clone())?
        .validate_partition(&layout.global)?;

    let num_old = layout.tiles.len() as u32;
    let participants = num_old.max(num_new);
    if locality.id() >= participants {
        return Ok(None);
    }
    debug!(
        "locality {} retiling {} from {num_old} onto {num_new} localities",
        locality.id(),
        layout.annotation
    );

    let old = LocalitiesDirectory::new(
        LocalityDescriptor::new(0, num_old)?,
        layout.annotation.clone(),
        layout.tiles.clone(),
    )?;
    // A replicated source that stays on its holders needs no exchange.
    let shared = participants > num_old || held.as_ref().map_or(true, |(_, tiled, _)| *tiled);
    let exchange = Exchange {
        locality,
        old: &old,
        global: &layout.global,
        base: format!("{key}/shards"),
        participants,
        shared,
    };
    let empty;
    let array = match held {
        Some((array, _, _)) => array,
        None => {
            empty = Array::zeros(layout.element, &vec![0; layout.global.len()]);
            &empty
        }
    };
    let region = target.as_ref().map(|t| t.tile.region(&layout.global));
    let shard = with_tensor!(array, t => {
        exchange.assemble(t, region.as_deref()).await?.map(Array::from)
    });

    match (target, shard) {
        (Some(t), Some(shard)) => {
            let directory = LocalitiesDirectory::new(t.locality, annotation, tiles)?;
            Ok(Some(PartitionedValue::distributed(shard, directory)?))
        }
        _ => Ok(None),
    }
}

/// How the old shards reach the new owners.
struct Exchange<'a> {
    locality: &'a Locality,
    old: &'a LocalitiesDirectory,
    global: &'a [usize],
    base: String,
    participants: u32,
    shared: bool,
}

impl Exchange<'_> {
    /// Serve this locality's old shard and, if it owns a new tile, copy the
    /// new tile's region together.
    async fn assemble<T: Element>(
        &self,
        shard: &Tensor<T>,
        region: Option<&[TilingSpan]>,
    ) -> Result<Option<Tensor<T>>, MeshError> {
        if !self.shared {
            return Ok(region.map(|r| shard.region(&ranges(r))));
        }
        let exchange = ShardExchange::publish_named(
            self.locality,
            shard.clone(),
            self.old.clone(),
            self.global.to_vec(),
            self.base.clone(),
            self.participants,
        )
        .await?;
        let result = match region {
            Some(region) => exchange.gather(region).await.map(Some),
            None => Ok(None),
        };
        exchange.finish(result).await
    }
}
