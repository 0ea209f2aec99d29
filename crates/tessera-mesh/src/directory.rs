//! Distribution metadata attached to a partitioned value.
//!
//! A `LocalitiesDirectory` tells every locality which tile each of its peers
//! owns, under which name the value is known, and which generation of that
//! name this tiling belongs to.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::MeshError;
use crate::tiling::{intersect_region, project_span, region_size, TileDescriptor, TilingSpan};

/// Suffix appended to a name each time a value is retiled.
pub const RETILE_SUFFIX: &str = "/retiled";

/// Global identity of a distributed value.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AnnotationDescriptor {
    pub name: String,
    pub generation: u64,
}

impl AnnotationDescriptor {
    pub fn new(name: impl Into<String>, generation: u64) -> Self {
        Self {
            name: name.into(),
            generation,
        }
    }

    /// Same name, next generation.
    pub fn next_generation(&self) -> Self {
        Self {
            name: self.name.clone(),
            generation: self.generation + 1,
        }
    }

    /// Suffixed name, next generation.
    pub fn derived(&self, suffix: &str) -> Self {
        Self {
            name: format!("{}{suffix}", self.name),
            generation: self.generation + 1,
        }
    }

    /// Key for a collective reduction over this value.
    pub fn reduce_key(&self) -> String {
        format!("reduce/{}", self.name)
    }
}

impl fmt::Display for AnnotationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.generation)
    }
}

/// Which locality this is, out of how many.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalityDescriptor {
    pub locality_id: u32,
    pub num_localities: u32,
}

impl LocalityDescriptor {
    /// Create a descriptor, rejecting `locality_id >= num_localities`.
    pub fn new(locality_id: u32, num_localities: u32) -> Result<Self, MeshError> {
        if locality_id >= num_localities {
            return Err(MeshError::InvalidSite {
                site: locality_id,
                num_sites: num_localities,
            });
        }
        Ok(Self {
            locality_id,
            num_localities,
        })
    }
}

/// Per-locality tiling of one distributed value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalitiesDirectory {
    pub locality: LocalityDescriptor,
    pub annotation: AnnotationDescriptor,
    /// `tiles[i]` is the tile owned by locality `i`.
    pub tiles: Vec<TileDescriptor>,
}

impl LocalitiesDirectory {
    /// Build a directory and check its tile count against the locality
    /// descriptor. Geometry is checked separately by [`Self::validate`],
    /// since it needs the local shard's shape.
    pub fn new(
        locality: LocalityDescriptor,
        annotation: AnnotationDescriptor,
        tiles: Vec<TileDescriptor>,
    ) -> Result<Self, MeshError> {
        if tiles.len() != locality.num_localities as usize {
            return Err(MeshError::shape(
                "directory",
                format!(
                    "{} tiles for {} localities",
                    tiles.len(),
                    locality.num_localities
                ),
            ));
        }
        if let Some(first) = tiles.first() {
            if tiles.iter().any(|t| t.rank() != first.rank()) {
                return Err(MeshError::shape("directory", "tiles disagree on rank"));
            }
        }
        Ok(Self {
            locality,
            annotation,
            tiles,
        })
    }

    pub fn this_site(&self) -> u32 {
        self.locality.locality_id
    }

    pub fn num_sites(&self) -> u32 {
        self.locality.num_localities
    }

    pub fn rank(&self) -> usize {
        self.tiles.first().map_or(0, TileDescriptor::rank)
    }

    /// The tile owned by the calling locality.
    pub fn local_tile(&self) -> &TileDescriptor {
        &self.tiles[self.locality.locality_id as usize]
    }

    /// Whether any locality carries a span along `axis`.
    pub fn is_tiled(&self, axis: usize) -> bool {
        self.tiles.iter().any(|t| t.has_span(axis))
    }

    /// Axes along which the value is split.
    pub fn tiled_axes(&self) -> Vec<usize> {
        (0..self.rank()).filter(|&a| self.is_tiled(a)).collect()
    }

    /// Global extent of `axis`: the largest span stop if the axis is tiled,
    /// otherwise the local shard's extent.
    pub fn global_extent(&self, axis: usize, local_dims: &[usize]) -> usize {
        if self.is_tiled(axis) {
            self.tiles
                .iter()
                .filter_map(|t| t.span(axis))
                .map(|s| s.stop)
                .max()
                .unwrap_or(0)
        } else {
            local_dims[axis]
        }
    }

    /// Global shape reconstructed from the tiling and the local shard.
    pub fn global_dims(&self, local_dims: &[usize]) -> Vec<usize> {
        (0..self.rank())
            .map(|a| self.global_extent(a, local_dims))
            .collect()
    }

    /// Concrete global region owned by `site`.
    pub fn tile_region(&self, site: u32, global_dims: &[usize]) -> Vec<TilingSpan> {
        self.tiles[site as usize].region(global_dims)
    }

    /// Map a global span on `axis` into the local frame of `site`'s tile.
    pub fn project(&self, site: u32, axis: usize, global: TilingSpan) -> TilingSpan {
        match self.tiles[site as usize].span(axis) {
            Some(tile) => project_span(tile, global),
            None => global,
        }
    }

    /// Map a whole global region into `site`'s local frame.
    pub fn project_region(&self, site: u32, region: &[TilingSpan]) -> Vec<TilingSpan> {
        region
            .iter()
            .enumerate()
            .map(|(axis, &s)| self.project(site, axis, s))
            .collect()
    }

    /// Directory for the next generation of the same value with new tiles.
    pub fn regenerate(&self, tiles: Vec<TileDescriptor>) -> Self {
        Self {
            locality: self.locality,
            annotation: self.annotation.next_generation(),
            tiles,
        }
    }

    /// Check the partition invariant against the local shard's dims.
    ///
    /// The local shard must match this locality's tile. On every tiled axis
    /// the distinct spans must cover `[0, extent)` without gaps or overlap,
    /// and the tiles, taken as rectangles, must be pairwise disjoint and
    /// cover the global region.
    pub fn validate(&self, local_dims: &[usize]) -> Result<(), MeshError> {
        let rank = self.rank();
        if local_dims.len() != rank {
            return Err(MeshError::shape(
                "directory",
                format!("tiles have rank {rank} but the local shard has rank {}", local_dims.len()),
            ));
        }
        let global = self.global_dims(local_dims);
        let expected = self.local_tile().local_dims(&global);
        if expected != local_dims {
            return Err(MeshError::shape(
                "directory",
                format!("local shard is {local_dims:?} but its tile implies {expected:?}"),
            ));
        }
        self.validate_partition(&global)
    }

    /// Check that the tiles partition an array of shape `global`: on every
    /// tiled axis the distinct spans cover `[0, extent)` without gaps or
    /// overlap, and the tile rectangles are disjoint and cover every element.
    pub fn validate_partition(&self, global: &[usize]) -> Result<(), MeshError> {
        if global.len() != self.rank() {
            return Err(MeshError::shape(
                "directory",
                format!("tiles have rank {} but the array has rank {}", self.rank(), global.len()),
            ));
        }
        for axis in self.tiled_axes() {
            let mut spans: Vec<TilingSpan> = self
                .tiles
                .iter()
                .map(|t| t.span(axis).unwrap_or_else(|| TilingSpan::full(global[axis])))
                .filter(|s| !s.is_empty())
                .collect();
            spans.sort();
            spans.dedup();
            let mut cursor = 0;
            for s in &spans {
                if s.start != cursor {
                    return Err(MeshError::shape(
                        "directory",
                        format!("axis {axis}: span {s} leaves a gap or overlap at {cursor}"),
                    ));
                }
                cursor = s.stop;
            }
            if cursor != global[axis] {
                return Err(MeshError::shape(
                    "directory",
                    format!("axis {axis}: spans end at {cursor}, extent is {}", global[axis]),
                ));
            }
        }

        let regions: Vec<Vec<TilingSpan>> =
            self.tiles.iter().map(|t| t.region(global)).collect();
        for i in 0..regions.len() {
            for j in i + 1..regions.len() {
                if region_size(&regions[i]) > 0
                    && region_size(&regions[j]) > 0
                    && intersect_region(&regions[i], &regions[j]).is_some()
                {
                    return Err(MeshError::shape(
                        "directory",
                        format!("tiles of localities {i} and {j} overlap"),
                    ));
                }
            }
        }
        let covered: usize = regions.iter().map(|r| region_size(r)).sum();
        let total: usize = global.iter().product();
        if covered != total {
            return Err(MeshError::shape(
                "directory",
                format!("tiles cover {covered} of {total} elements"),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory(site: u32, tiles: Vec<TileDescriptor>) -> LocalitiesDirectory {
        let n = tiles.len() as u32;
        LocalitiesDirectory::new(
            LocalityDescriptor::new(site, n).unwrap(),
            AnnotationDescriptor::new("x", 0),
            tiles,
        )
        .unwrap()
    }

    #[test]
    fn locality_descriptor_bounds() {
        assert!(LocalityDescriptor::new(0, 1).is_ok());
        assert_eq!(
            LocalityDescriptor::new(2, 2),
            Err(MeshError::InvalidSite { site: 2, num_sites: 2 })
        );
    }

    #[test]
    fn tile_count_must_match() {
        let r = LocalitiesDirectory::new(
            LocalityDescriptor::new(0, 3).unwrap(),
            AnnotationDescriptor::new("x", 0),
            vec![TileDescriptor::vector(0, 2)],
        );
        assert!(matches!(r, Err(MeshError::ShapeMismatch { .. })));
    }

    #[test]
    fn annotation_keys_and_generations() {
        let a = AnnotationDescriptor::new("w", 4);
        assert_eq!(a.reduce_key(), "reduce/w");
        assert_eq!(a.next_generation(), AnnotationDescriptor::new("w", 5));
        assert_eq!(a.derived(RETILE_SUFFIX).name, "w/retiled");
        assert_eq!(a.to_string(), "w#4");
    }

    #[test]
    fn row_tiling_validates() {
        let d = directory(1, vec![TileDescriptor::rows(0, 2), TileDescriptor::rows(2, 5)]);
        assert_eq!(d.tiled_axes(), vec![0]);
        assert_eq!(d.global_dims(&[3, 4]), vec![5, 4]);
        d.validate(&[3, 4]).unwrap();
        assert_eq!(d.project(1, 0, TilingSpan::new(3, 5)), TilingSpan::new(1, 3));
        assert_eq!(d.project(1, 1, TilingSpan::new(1, 2)), TilingSpan::new(1, 2));
    }

    #[test]
    fn gap_and_overlap_rejected() {
        let gap = directory(0, vec![TileDescriptor::vector(0, 2), TileDescriptor::vector(3, 5)]);
        assert!(gap.validate(&[2]).is_err());

        let overlap = directory(0, vec![TileDescriptor::vector(0, 3), TileDescriptor::vector(2, 5)]);
        assert!(overlap.validate(&[3]).is_err());
    }

    #[test]
    fn wrong_local_shape_rejected() {
        let d = directory(0, vec![TileDescriptor::vector(0, 2), TileDescriptor::vector(2, 5)]);
        assert!(d.validate(&[3]).is_err());
        assert!(d.validate(&[2, 1]).is_err());
    }

    #[test]
    fn block_tiling_validates() {
        let s = TilingSpan::new;
        let tiles = vec![
            TileDescriptor::block(s(0, 2), s(0, 3)),
            TileDescriptor::block(s(0, 2), s(3, 4)),
            TileDescriptor::block(s(2, 4), s(0, 3)),
            TileDescriptor::block(s(2, 4), s(3, 4)),
        ];
        let d = directory(3, tiles.clone());
        d.validate(&[2, 1]).unwrap();

        let mut bad = tiles;
        bad[3] = TileDescriptor::block(s(2, 4), s(0, 4));
        let d = directory(0, bad);
        assert!(d.validate(&[2, 3]).is_err());
    }

    #[test]
    fn degenerate_tile_allowed() {
        let d = directory(
            1,
            vec![TileDescriptor::vector(0, 4), TileDescriptor::vector(4, 4)],
        );
        d.validate(&[0]).unwrap();
        assert_eq!(d.global_extent(0, &[0]), 4);
    }
}
