//! Tiling geometry: half-open spans and per-locality tile descriptors.
//!
//! Everything here is pure arithmetic. Spans are expressed in global
//! coordinates unless a function says otherwise.

use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};

/// Highest array rank a tile descriptor can describe.
pub const MAX_RANK: usize = 3;

/// A half-open interval `[start, stop)` along one global axis.
///
/// A span with `start == stop` is valid and means the owning locality holds
/// nothing along that axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawSpan")]
pub struct TilingSpan {
    pub start: usize,
    pub stop: usize,
}

/// Wire form of a span, checked on the way in.
#[derive(Deserialize)]
struct RawSpan {
    start: usize,
    stop: usize,
}

impl TryFrom<RawSpan> for TilingSpan {
    type Error = String;

    fn try_from(raw: RawSpan) -> Result<Self, Self::Error> {
        Self::checked(raw.start, raw.stop)
            .ok_or_else(|| format!("tiling span [{}, {}) is inverted", raw.start, raw.stop))
    }
}

impl TilingSpan {
    /// Create a span. Panics if `start > stop`.
    pub fn new(start: usize, stop: usize) -> Self {
        assert!(start <= stop, "tiling span [{start}, {stop}) is inverted");
        Self { start, stop }
    }

    /// Create a span, or `None` if `start > stop`.
    pub fn checked(start: usize, stop: usize) -> Option<Self> {
        (start <= stop).then_some(Self { start, stop })
    }

    /// The span covering `[0, extent)`.
    pub fn full(extent: usize) -> Self {
        Self::new(0, extent)
    }

    pub fn size(&self) -> usize {
        self.stop - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.stop
    }

    /// Whether `other` lies entirely within this span.
    pub fn contains(&self, other: &TilingSpan) -> bool {
        self.start <= other.start && other.stop <= self.stop
    }

    /// Re-express this span relative to `origin` (i.e. subtract it).
    pub fn relative_to(&self, origin: usize) -> Self {
        debug_assert!(origin <= self.start, "span {self} starts before origin {origin}");
        Self {
            start: self.start - origin,
            stop: self.stop - origin,
        }
    }

    /// Shift this span forward by `offset`.
    pub fn shifted(&self, offset: usize) -> Self {
        Self {
            start: self.start + offset,
            stop: self.stop + offset,
        }
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.stop
    }
}

impl fmt::Display for TilingSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.stop)
    }
}

/// Overlap of two spans, or `None` if they are disjoint (or touch only at a
/// boundary).
pub fn intersect(a: TilingSpan, b: TilingSpan) -> Option<TilingSpan> {
    let start = a.start.max(b.start);
    let stop = a.stop.min(b.stop);
    (start < stop).then_some(TilingSpan { start, stop })
}

/// Axis-wise overlap of two rectangular regions of equal rank.
///
/// Returns `None` as soon as one axis is disjoint. A rank-0 region always
/// intersects (a scalar has exactly one element).
pub fn intersect_region(a: &[TilingSpan], b: &[TilingSpan]) -> Option<Vec<TilingSpan>> {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(&x, &y)| intersect(x, y)).collect()
}

/// Map a global span into the local frame of a tile span on the same axis.
///
/// The caller must clip `global` with [`intersect`] first; a span outside
/// the tile is a programming error.
pub fn project_span(tile: TilingSpan, global: TilingSpan) -> TilingSpan {
    debug_assert!(
        tile.contains(&global),
        "project: span {global} is not inside tile {tile}"
    );
    global.relative_to(tile.start)
}

/// Convert a region to index ranges.
pub fn ranges(region: &[TilingSpan]) -> Vec<Range<usize>> {
    region.iter().map(TilingSpan::range).collect()
}

/// Element count of a region.
pub fn region_size(region: &[TilingSpan]) -> usize {
    region.iter().map(TilingSpan::size).product()
}

/// The rectangular region one locality owns: an optional span per axis.
///
/// `None` on an axis means the locality is not tiled along it and implicitly
/// owns the whole extent.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileDescriptor {
    spans: Vec<Option<TilingSpan>>,
}

impl TileDescriptor {
    /// Create a tile from one optional span per axis. Panics above
    /// [`MAX_RANK`].
    pub fn new(spans: Vec<Option<TilingSpan>>) -> Self {
        assert!(spans.len() <= MAX_RANK, "tile rank {} exceeds {MAX_RANK}", spans.len());
        Self { spans }
    }

    /// An untiled descriptor of the given rank.
    pub fn untiled(rank: usize) -> Self {
        Self::new(vec![None; rank])
    }

    /// Tile of a 1-D value.
    pub fn vector(start: usize, stop: usize) -> Self {
        Self::new(vec![Some(TilingSpan::new(start, stop))])
    }

    /// Row tile of a 2-D value (columns untiled).
    pub fn rows(start: usize, stop: usize) -> Self {
        Self::new(vec![Some(TilingSpan::new(start, stop)), None])
    }

    /// Column tile of a 2-D value (rows untiled).
    pub fn columns(start: usize, stop: usize) -> Self {
        Self::new(vec![None, Some(TilingSpan::new(start, stop))])
    }

    /// Block tile of a 2-D value.
    pub fn block(rows: TilingSpan, columns: TilingSpan) -> Self {
        Self::new(vec![Some(rows), Some(columns)])
    }

    pub fn rank(&self) -> usize {
        self.spans.len()
    }

    pub fn span(&self, axis: usize) -> Option<TilingSpan> {
        self.spans.get(axis).copied().flatten()
    }

    pub fn has_span(&self, axis: usize) -> bool {
        self.span(axis).is_some()
    }

    pub fn spans(&self) -> &[Option<TilingSpan>] {
        &self.spans
    }

    /// Axes this tile carries a span on.
    pub fn tiled_axes(&self) -> Vec<usize> {
        (0..self.rank()).filter(|&a| self.has_span(a)).collect()
    }

    /// Concrete global region of this tile given the global extents; untiled
    /// axes cover their full extent.
    pub fn region(&self, global_dims: &[usize]) -> Vec<TilingSpan> {
        debug_assert_eq!(global_dims.len(), self.rank());
        self.spans
            .iter()
            .zip(global_dims)
            .map(|(s, &extent)| s.unwrap_or_else(|| TilingSpan::full(extent)))
            .collect()
    }

    /// Local array dims implied by this tile.
    pub fn local_dims(&self, global_dims: &[usize]) -> Vec<usize> {
        self.region(global_dims).iter().map(TilingSpan::size).collect()
    }
}

impl fmt::Display for TileDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, s) in self.spans.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match s {
                Some(s) => write!(f, "{s}")?,
                None => f.write_str("*")?,
            }
        }
        f.write_str(")")
    }
}
